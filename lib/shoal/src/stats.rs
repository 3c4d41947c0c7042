//! Per-server counters kept by the pool. The wider statistics surface is an
//! external collaborator; this module only carries what the core itself
//! needs to preserve across a topology swap.

use hashbrown::HashMap;

#[derive(Debug, Default, Clone)]
pub struct ServerStats {
    pub requests: u64,
    pub responses: u64,
    pub errors: u64,
    pub fragments: u64,
}

#[derive(Default)]
pub struct PoolStats {
    per_server: HashMap<String, ServerStats>,
    pub redirects: u64,
    pub probes: u64,
}

impl PoolStats {
    pub fn new() -> PoolStats {
        PoolStats::default()
    }

    #[inline]
    pub fn server(&mut self, name: &str) -> &mut ServerStats {
        self.per_server.entry(name.to_string()).or_default()
    }

    #[inline]
    pub fn server_snapshot(&self, name: &str) -> Option<&ServerStats> {
        self.per_server.get(name)
    }

    /// Drops counters for servers that did not survive a topology swap;
    /// survivors keep their history.
    pub fn retain_servers<'a, I: Iterator<Item = &'a str> + Clone>(&mut self, survivors: I) {
        self.per_server
            .retain(|name, _| survivors.clone().any(|s| s == name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_survive_swap_for_survivors() {
        let mut stats = PoolStats::new();
        stats.server("10.0.0.1:6379").requests = 7;
        stats.server("10.0.0.2:6379").requests = 3;

        let survivors = ["10.0.0.1:6379", "10.0.0.3:6379"];
        stats.retain_servers(survivors.iter().copied());

        assert_eq!(stats.server_snapshot("10.0.0.1:6379").unwrap().requests, 7);
        assert!(stats.server_snapshot("10.0.0.2:6379").is_none());
        assert_eq!(stats.server("10.0.0.3:6379").requests, 0);
    }
}
