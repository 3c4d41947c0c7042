//! Parsing of the `CLUSTER NODES` probe snapshot into a staged topology:
//! a server list, the replica sets, and the 16384-entry slot map. The
//! staging output is applied to the pool on a later tick, never in place.
//!
//! One line per node:
//!
//! ```text
//! <id> <ip:port[@cport]> <flags> <master-id> <ping> <pong> <epoch> <state> [slots...]
//! ```
//!
//! Slot entries are single slots (`42`), ranges (`0-5460`), or bracketed
//! import/export markers, which are ignored. Nodes flagged `fail`,
//! `handshake` or `noaddr` are skipped wholesale.

use keel::hashing::CLUSTER_SLOTS;
use keel::shared::{ErrorType, NetError, NetResult};

#[derive(Debug, Clone)]
pub struct StagedServer {
    /// Logical name, `host:port`.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub node_id: String,
    pub master_id: Option<String>,
    pub is_master: bool,
}

#[derive(Debug, Clone)]
pub struct StagedReplicaSet {
    /// Index into `StagedTopology::servers`.
    pub master: Option<usize>,
    pub slaves: Vec<usize>,
}

#[derive(Debug)]
pub struct StagedTopology {
    pub servers: Vec<StagedServer>,
    pub replica_sets: Vec<StagedReplicaSet>,
    /// Slot index to replica-set index.
    pub slots: Vec<Option<u32>>,
}

pub fn parse(snapshot: &[u8]) -> NetResult<StagedTopology> {
    let text =
        std::str::from_utf8(snapshot).map_err(|_| NetError::Fatal(ErrorType::Protocol))?;

    let mut servers: Vec<StagedServer> = Vec::new();
    let mut slot_ranges: Vec<(usize, u16, u16)> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(NetError::Fatal(ErrorType::Protocol));
        }

        let flags = fields[2];
        if flags
            .split(',')
            .any(|f| matches!(f, "fail" | "fail?" | "handshake" | "noaddr"))
        {
            continue;
        }

        let addr = fields[1].split('@').next().unwrap_or(fields[1]);
        let (host, port) = match addr.rsplit_once(':') {
            Some((host, port)) => (host, port),
            None => return Err(NetError::Fatal(ErrorType::Protocol)),
        };
        let port: u16 = port
            .parse()
            .map_err(|_| NetError::Fatal(ErrorType::Protocol))?;
        if host.is_empty() {
            continue;
        }

        let is_master = flags.split(',').any(|f| f == "master");
        let master_id = match fields[3] {
            "-" => None,
            id => Some(id.to_string()),
        };

        let idx = servers.len();
        servers.push(StagedServer {
            name: format!("{}:{}", host, port),
            host: host.to_string(),
            port,
            node_id: fields[0].to_string(),
            master_id,
            is_master,
        });

        for entry in &fields[8..] {
            // Importing/migrating markers are bracketed; the slot still
            // belongs to its current owner, so they carry no assignment.
            if entry.starts_with('[') {
                continue;
            }

            let (lo, hi) = match entry.split_once('-') {
                Some((lo, hi)) => (lo, hi),
                None => (*entry, *entry),
            };
            let lo: u16 = lo
                .parse()
                .map_err(|_| NetError::Fatal(ErrorType::Protocol))?;
            let hi: u16 = hi
                .parse()
                .map_err(|_| NetError::Fatal(ErrorType::Protocol))?;
            if lo > hi || u32::from(hi) >= CLUSTER_SLOTS {
                return Err(NetError::Fatal(ErrorType::Protocol));
            }

            slot_ranges.push((idx, lo, hi));
        }
    }

    // One replica set per slot-owning master; slaves attach by master id.
    let mut replica_sets: Vec<StagedReplicaSet> = Vec::new();
    let mut rs_of_server: Vec<Option<u32>> = vec![None; servers.len()];

    for &(idx, _, _) in &slot_ranges {
        if rs_of_server[idx].is_none() {
            rs_of_server[idx] = Some(replica_sets.len() as u32);
            replica_sets.push(StagedReplicaSet {
                master: Some(idx),
                slaves: Vec::new(),
            });
        }
    }

    for (idx, server) in servers.iter().enumerate() {
        let master_id = match &server.master_id {
            Some(id) => id,
            None => continue,
        };

        if let Some(master_idx) = servers.iter().position(|s| &s.node_id == master_id) {
            if let Some(rs) = rs_of_server[master_idx] {
                replica_sets[rs as usize].slaves.push(idx);
            }
        }
    }

    let mut slots: Vec<Option<u32>> = vec![None; CLUSTER_SLOTS as usize];
    for &(idx, lo, hi) in &slot_ranges {
        let rs = rs_of_server[idx].expect("slot owner has a replica set");
        for slot in lo..=hi {
            slots[slot as usize] = Some(rs);
        }
    }

    Ok(StagedTopology {
        servers,
        replica_sets,
        slots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNAPSHOT: &str = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@40004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@40002 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@40003 master - 0 1426238318243 3 connected 10923-16383
6ec23923021cf3ffec47632106199cb7f496ce01 127.0.0.1:30005@40005 slave 67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 0 1426238316232 5 connected
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@40001 myself,master - 0 0 1 connected 0-5460
";

    #[test]
    fn test_parse_reference_snapshot() {
        let topo = parse(SNAPSHOT.as_bytes()).unwrap();

        assert_eq!(topo.servers.len(), 5);
        assert_eq!(topo.replica_sets.len(), 3);

        // Slot 0 belongs to 30001, whose slave is 30004.
        let rs0 = topo.slots[0].unwrap() as usize;
        let master = topo.replica_sets[rs0].master.unwrap();
        assert_eq!(topo.servers[master].name, "127.0.0.1:30001");
        assert_eq!(topo.replica_sets[rs0].slaves.len(), 1);
        assert_eq!(
            topo.servers[topo.replica_sets[rs0].slaves[0]].name,
            "127.0.0.1:30004"
        );

        // Range boundaries.
        assert_eq!(topo.slots[5460], topo.slots[0]);
        assert_ne!(topo.slots[5461], topo.slots[5460]);
        assert_eq!(topo.slots[16383], topo.slots[10923]);

        // Every slot is covered in this snapshot.
        assert!(topo.slots.iter().all(|slot| slot.is_some()));
    }

    #[test]
    fn test_failed_nodes_are_skipped() {
        let snapshot = "\
aaa 10.0.0.1:7000@17000 master,fail - 0 0 1 disconnected 0-99
bbb 10.0.0.2:7000@17000 master - 0 0 2 connected 100-16383
";
        let topo = parse(snapshot.as_bytes()).unwrap();

        assert_eq!(topo.servers.len(), 1);
        assert!(topo.slots[0].is_none());
        assert!(topo.slots[100].is_some());
    }

    #[test]
    fn test_migrating_markers_are_ignored() {
        let snapshot =
            "aaa 10.0.0.1:7000@17000 master - 0 0 1 connected 0-10 [11->-bbb]\n";
        let topo = parse(snapshot.as_bytes()).unwrap();

        assert!(topo.slots[10].is_some());
        assert!(topo.slots[11].is_none());
    }

    #[test]
    fn test_single_slot_entry() {
        let snapshot = "aaa 10.0.0.1:7000 master - 0 0 1 connected 42\n";
        let topo = parse(snapshot.as_bytes()).unwrap();

        assert!(topo.slots[42].is_some());
        assert!(topo.slots[41].is_none());
        assert!(topo.slots[43].is_none());
    }

    #[test]
    fn test_garbage_rejects() {
        assert!(parse(b"not a cluster nodes reply").is_err());
        assert!(parse(b"aaa 10.0.0.1:x master - 0 0 1 connected\n").is_err());
        assert!(parse(b"aaa 10.0.0.1:7000 master - 0 0 1 connected 9-2\n").is_err());
    }

    #[test]
    fn test_empty_snapshot_is_empty_topology() {
        let topo = parse(b"").unwrap();
        assert!(topo.servers.is_empty());
        assert!(topo.slots.iter().all(|slot| slot.is_none()));
    }
}
