use keel::logging;
use serde_derive::{Deserialize, Serialize};
use shoal::cluster::PoolConfig;
use std::path::Path;

pub const DEFAULT_PORT: u16 = 22121;

#[derive(Serialize, Deserialize)]
pub struct Listen {
    pub address: String,
    pub allowlist_file: Option<String>,
    pub allowlist_interval_secs: u64,
}

#[derive(Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub servers: Vec<String>,
    pub rediscluster: bool,
    pub zone: String,
    pub env: String,
    /// Address-prefix to zone-name pairs for locality tagging.
    pub zone_map: Vec<(String, String)>,
    pub auth: Option<String>,
    pub redis_db: u32,
    pub req_limit: u64,
    pub rsp_limit: u64,
    pub timeout_ms: u64,
    pub update_ticks: u32,
}

#[derive(Serialize, Deserialize)]
pub struct Log {
    pub level: String,
    pub file: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct ProxyConfig {
    pub listen: Listen,
    pub pool: Pool,
    pub log: Log,
    pub tick_interval_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> ProxyConfig {
        let defaults = PoolConfig::default();

        ProxyConfig {
            listen: Listen {
                address: format!("0.0.0.0:{}", DEFAULT_PORT),
                allowlist_file: None,
                allowlist_interval_secs: 5,
            },
            pool: Pool {
                name: defaults.name,
                servers: Vec::new(),
                rediscluster: true,
                zone: String::new(),
                env: String::new(),
                zone_map: Vec::new(),
                auth: None,
                redis_db: 0,
                req_limit: defaults.req_limit,
                rsp_limit: defaults.rsp_limit,
                timeout_ms: defaults.timeout_ms,
                update_ticks: defaults.update_ticks,
            },
            log: Log {
                level: "info".to_string(),
                file: None,
            },
            tick_interval_ms: 100,
        }
    }
}

impl ProxyConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ProxyConfig {
        serdeconv::from_toml_file(path).expect("Error loading proxy configuration file")
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            name: self.pool.name.clone(),
            servers: self.pool.servers.clone(),
            rediscluster: self.pool.rediscluster,
            zone: self.pool.zone.clone(),
            env: self.pool.env.clone(),
            zone_map: self.pool.zone_map.clone(),
            auth: self.pool.auth.clone(),
            redis_db: self.pool.redis_db,
            req_limit: self.pool.req_limit,
            rsp_limit: self.pool.rsp_limit,
            timeout_ms: self.pool.timeout_ms,
            update_ticks: self.pool.update_ticks,
            ..PoolConfig::default()
        }
    }

    pub fn log_settings(&self) -> logging::Settings {
        logging::Settings {
            level: logging::parse_level(&self.log.level).unwrap_or(logging::Level::Info),
            file: self.log.file.as_ref().map(Into::into),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrips_through_toml() {
        let config = ProxyConfig::default();
        let toml = serdeconv::to_toml_string(&config).unwrap();
        let back: ProxyConfig = serdeconv::from_toml_str(&toml).unwrap();

        assert_eq!(back.listen.address, config.listen.address);
        assert_eq!(back.pool.update_ticks, config.pool.update_ticks);
        assert_eq!(back.log.level, "info");
    }

    #[test]
    fn test_parses_handwritten_config() {
        let toml = r#"
tick_interval_ms = 100

[listen]
address = "127.0.0.1:22121"
allowlist_interval_secs = 5

[pool]
name = "cache"
servers = ["10.0.0.1:6379", "10.0.0.2:6379"]
rediscluster = true
zone = "z1"
env = "prod"
zone_map = [["10.0.0.", "z1"], ["10.0.1.", "z2"]]
redis_db = 2
req_limit = 1048576
rsp_limit = 4194304
timeout_ms = 2000
update_ticks = 10

[log]
level = "debug"
"#;
        let config: ProxyConfig = serdeconv::from_toml_str(toml).unwrap();

        assert_eq!(config.pool.servers.len(), 2);
        assert_eq!(config.pool.zone_map[1].1, "z2");
        assert_eq!(config.pool.redis_db, 2);
        assert_eq!(
            config.log_settings().level,
            keel::logging::Level::Debug
        );

        let pool = config.pool_config();
        assert_eq!(pool.timeout_ms, 2000);
        assert!(pool.auth.is_none());
    }
}
