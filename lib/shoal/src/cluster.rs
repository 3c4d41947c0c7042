//! The server pool: the authoritative 16384-slot routing table, the staged
//! topology produced by probing, and the refresh tick that swaps staged
//! state in. Routing picks the slot master for writes and a random replica
//! from the nearest non-empty locality bucket for reads.

use crate::buf::Chain;
use crate::msg::{MsgArena, MsgId, MsgType};
use crate::stats::PoolStats;
use crate::topo::{self, StagedTopology};
use hashbrown::HashMap;
use keel::hashing::{key_slot, CLUSTER_SLOTS};
use keel::logging::{self, Logger};
use keel::shared::{ErrorType, NetError, NetResult};
use rand::Rng;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

/// Locality buckets per replica set.
pub const MAX_TAGS: usize = 5;

/// The topology probe, three-arg form; the trailing `extra` marks the reply
/// for the capture path.
pub const CLUSTER_NODES_PROBE: &[u8] = b"*3\r\n$7\r\ncluster\r\n$5\r\nnodes\r\n$5\r\nextra\r\n";

pub type ServerId = usize;

/// How long a server stays dead after a connect failure.
const RETRY_BACKOFF_MS: u64 = 2_000;

pub struct Server {
    /// Logical name, `host:port`.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub addr: SocketAddr,
    pub zone: Option<String>,
    pub failure_count: u32,
    pub next_retry: u64,
}

impl Server {
    fn resolve(host: &str, port: u16, zone: Option<String>) -> NetResult<Server> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|_| NetError::Fatal(ErrorType::AddrParse))?
            .next()
            .ok_or(NetError::Fatal(ErrorType::AddrParse))?;

        Ok(Server {
            name: format!("{}:{}", host, port),
            host: host.to_string(),
            port,
            addr,
            zone,
            failure_count: 0,
            next_retry: 0,
        })
    }

    #[inline]
    pub fn ready_for_retry(&self, now_millis: u64) -> bool {
        now_millis >= self.next_retry
    }
}

/// A master and its slaves, the slaves grouped into locality buckets with
/// lower indices meaning nearer.
pub struct ReplicaSet {
    pub master: Option<ServerId>,
    pub tagged: [Vec<ServerId>; MAX_TAGS],
}

impl ReplicaSet {
    fn new() -> ReplicaSet {
        ReplicaSet {
            master: None,
            tagged: Default::default(),
        }
    }
}

/// What the topology refresher needs from the socket layer. Addresses are
/// passed alongside ids so implementors never need to reach back into the
/// pool mid-call.
pub trait Backend {
    /// Enqueues a request on a connection to the server, connecting first
    /// if necessary.
    fn enqueue(&mut self, server: ServerId, addr: SocketAddr, msg: MsgId) -> NetResult<()>;
    /// Closes every open connection to the server.
    fn close_server(&mut self, server: ServerId);
    /// Warms up a connection to the server.
    fn connect(&mut self, server: ServerId, addr: SocketAddr) -> NetResult<()>;
}

pub struct PoolConfig {
    pub name: String,
    /// Seed `host:port` endpoints used until the first probe lands.
    pub servers: Vec<String>,
    pub rediscluster: bool,
    pub zone: String,
    pub env: String,
    /// Address-prefix to zone-name mapping for locality tagging.
    pub zone_map: Vec<(String, String)>,
    pub auth: Option<String>,
    pub redis_db: u32,
    pub req_limit: u64,
    pub rsp_limit: u64,
    pub timeout_ms: u64,
    pub probe_buf_size: usize,
    /// Ticks between topology refreshes.
    pub update_ticks: u32,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            name: "default".to_string(),
            servers: Vec::new(),
            rediscluster: true,
            zone: String::new(),
            env: String::new(),
            zone_map: Vec::new(),
            auth: None,
            redis_db: 0,
            req_limit: 1024 * 1024,
            rsp_limit: 4 * 1024 * 1024,
            timeout_ms: 2_000,
            probe_buf_size: 1024 * 1024,
            update_ticks: 10,
        }
    }
}

pub struct ServerPool {
    pub config: PoolConfig,
    pub stats: PoolStats,

    servers: Vec<Server>,
    by_name: HashMap<String, ServerId>,
    replica_sets: Vec<ReplicaSet>,
    slots: Vec<Option<u32>>,

    /// Slot hash, injectable for tests.
    hash: fn(&[u8]) -> u16,

    // Refresh machinery.
    staged: Option<StagedTopology>,
    staged_servers_update: bool,
    staged_slots_update: bool,
    need_update_slots: bool,
    ticks_left: u32,

    probe_buf: Vec<u8>,
    probe_busy: bool,
    probe_wake_tx: SyncSender<()>,
    probe_wake_rx: Receiver<()>,

    pub slots_update_at: u64,
    pub servers_update_at: u64,

    log: Logger,
}

impl ServerPool {
    pub fn new(config: PoolConfig, log: Logger) -> ServerPool {
        let (probe_wake_tx, probe_wake_rx) = sync_channel(1);

        let mut pool = ServerPool {
            stats: PoolStats::new(),
            servers: Vec::new(),
            by_name: HashMap::new(),
            replica_sets: Vec::new(),
            slots: vec![None; CLUSTER_SLOTS as usize],
            hash: key_slot,
            staged: None,
            staged_servers_update: false,
            staged_slots_update: false,
            need_update_slots: false,
            ticks_left: config.update_ticks,
            probe_buf: Vec::new(),
            probe_busy: false,
            probe_wake_tx,
            probe_wake_rx,
            slots_update_at: 0,
            servers_update_at: 0,
            log,
            config,
        };

        for seed in pool.config.servers.clone() {
            match parse_addr(&seed) {
                Some((host, port)) => {
                    let zone = pool.zone_for(&host);
                    match Server::resolve(&host, port, zone) {
                        Ok(server) => {
                            pool.add_server(server);
                        }
                        Err(_) => {
                            logging::warn!(pool.log, "failed to resolve seed server"; "seed" => %seed)
                        }
                    }
                }
                None => logging::warn!(pool.log, "malformed seed server"; "seed" => %seed),
            }
        }

        pool
    }

    /// Swaps in a different slot hash; routing and fragment grouping both
    /// go through it.
    pub fn set_hash(&mut self, hash: fn(&[u8]) -> u16) {
        self.hash = hash;
    }

    fn add_server(&mut self, server: Server) -> ServerId {
        let id = self.servers.len();
        self.by_name.insert(server.name.clone(), id);
        self.servers.push(server);
        id
    }

    #[inline]
    pub fn server(&self, id: ServerId) -> &Server {
        &self.servers[id]
    }

    #[inline]
    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    /// The `host:port` lookup used when following redirects.
    #[inline]
    pub fn find_server(&self, name: &str) -> Option<ServerId> {
        self.by_name.get(name).copied()
    }

    fn zone_for(&self, host: &str) -> Option<String> {
        self.config
            .zone_map
            .iter()
            .find(|(prefix, _)| host.starts_with(prefix.as_str()))
            .map(|(_, zone)| zone.clone())
    }

    /// Locality bucket for a server zone: same zone as the pool, then any
    /// known zone, then unknown. Buckets 3-4 stay empty.
    fn tag_of(&self, zone: Option<&str>) -> usize {
        match zone {
            Some(zone) if zone == self.config.zone => 0,
            Some(_) => 1,
            None => 2,
        }
    }

    #[inline]
    pub fn slot_of(&self, key: &[u8]) -> u16 {
        (self.hash)(key)
    }

    /// The configured slot hash, handed to the fragmenter so grouping and
    /// routing always agree.
    #[inline]
    pub fn hash_fn(&self) -> fn(&[u8]) -> u16 {
        self.hash
    }

    /// Selects the backend server for a request key. Writes go to the slot
    /// master; reads to a random server in the nearest populated bucket.
    pub fn route<R: Rng>(&self, mtype: MsgType, key: &[u8], rng: &mut R) -> NetResult<ServerId> {
        if !self.config.rediscluster {
            return Err(NetError::Fatal(ErrorType::NoServer));
        }

        let slot = (self.hash)(key);
        let rs = self.slots[slot as usize]
            .and_then(|idx| self.replica_sets.get(idx as usize))
            .ok_or(NetError::Fatal(ErrorType::NoServer))?;

        if mtype.is_write() {
            return rs.master.ok_or(NetError::Fatal(ErrorType::NoServer));
        }

        for bucket in &rs.tagged {
            if !bucket.is_empty() {
                return Ok(bucket[rng.gen_range(0..bucket.len())]);
            }
        }

        Err(NetError::Fatal(ErrorType::NoServer))
    }

    /// Last captured `CLUSTER NODES` snapshot, for the NODES command.
    #[inline]
    pub fn probe_snapshot(&self) -> &[u8] {
        &self.probe_buf
    }

    /// Copies a probe reply into the snapshot buffer and pokes the wake
    /// channel. A reply that arrives while the previous one is still being
    /// consumed is dropped.
    pub fn capture_probe(&mut self, chain: &Chain) -> bool {
        if self.probe_busy {
            logging::debug!(self.log, "probe buffer busy, dropping probe reply");
            return false;
        }
        if chain.len() as usize > self.config.probe_buf_size {
            logging::warn!(self.log, "probe reply exceeds buffer";
                           "len" => chain.len(), "cap" => self.config.probe_buf_size);
            return false;
        }

        self.probe_busy = true;
        self.probe_buf = chain.to_vec();

        if let Err(TrySendError::Disconnected(_)) = self.probe_wake_tx.try_send(()) {
            panic!("probe wake channel disconnected");
        }
        true
    }

    /// One refresh tick: schedule a probe on the interval, consume a
    /// captured snapshot into staging, and swap staged state in.
    pub fn tick<R: Rng>(
        &mut self,
        arena: &mut MsgArena,
        backend: &mut dyn Backend,
        rng: &mut R,
        now_millis: u64,
    ) {
        if self.ticks_left == 0 {
            self.need_update_slots = true;
            self.ticks_left = self.config.update_ticks;
        } else {
            self.ticks_left -= 1;
        }

        if self.need_update_slots {
            self.need_update_slots = false;
            self.send_probe(arena, backend, rng);
        }

        if self.probe_wake_rx.try_recv().is_ok() {
            self.consume_probe();
        }

        if self.staged_servers_update {
            self.staged_servers_update = false;
            self.apply_staged_servers(backend, now_millis);
        }

        if self.staged_slots_update {
            self.staged_slots_update = false;
            self.apply_staged_slots(now_millis);
        }
    }

    fn send_probe<R: Rng>(&mut self, arena: &mut MsgArena, backend: &mut dyn Backend, rng: &mut R) {
        let target = match self.probe_target(rng) {
            Some(server) => server,
            None => {
                logging::warn!(self.log, "no server available for topology probe");
                return;
            }
        };

        let msg_id = arena.get(true);
        let msg = arena.msg_mut(msg_id).unwrap();
        msg.chain.append(CLUSTER_NODES_PROBE);
        // Probe messages carry no owner; the reply path recognizes them by
        // that.
        msg.owner = None;

        self.stats.probes += 1;

        let addr = self.servers[target].addr;
        if let Err(err) = backend.enqueue(target, addr, msg_id) {
            logging::warn!(self.log, "failed to enqueue topology probe";
                           "server" => %self.servers[target].name, "err" => ?err);
            arena.put(msg_id);
        }
    }

    /// A random tagged server from a random assigned slot, else a random
    /// configured server.
    fn probe_target<R: Rng>(&self, rng: &mut R) -> Option<ServerId> {
        let slot = rng.gen_range(0..CLUSTER_SLOTS) as usize;

        if let Some(rs) = self.slots[slot].and_then(|idx| self.replica_sets.get(idx as usize)) {
            for bucket in &rs.tagged {
                if !bucket.is_empty() {
                    return Some(bucket[rng.gen_range(0..bucket.len())]);
                }
            }
        }

        if self.servers.is_empty() {
            return None;
        }
        Some(rng.gen_range(0..self.servers.len()))
    }

    /// Parses the captured snapshot into staging and raises the update
    /// flags. The snapshot keeps its wire framing (NODES serves it
    /// verbatim); the parser gets the payload only.
    fn consume_probe(&mut self) {
        let staged = match topo::parse(strip_bulk_frame(&self.probe_buf)) {
            Ok(staged) => staged,
            Err(err) => {
                logging::warn!(self.log, "failed to parse cluster nodes snapshot"; "err" => ?err);
                self.probe_busy = false;
                return;
            }
        };

        if staged.servers.is_empty() {
            logging::warn!(self.log, "probe snapshot contained no usable nodes");
            self.probe_busy = false;
            return;
        }

        logging::debug!(self.log, "staged topology";
                        "servers" => staged.servers.len(),
                        "replica_sets" => staged.replica_sets.len());

        self.staged = Some(staged);
        self.staged_servers_update = true;
        self.staged_slots_update = true;
        self.probe_busy = false;
    }

    fn apply_staged_servers(&mut self, backend: &mut dyn Backend, now_millis: u64) {
        let staged = match &self.staged {
            Some(staged) => staged,
            None => return,
        };
        if staged.servers.is_empty() {
            return;
        }

        // Drop every connection to the outgoing set; stats survive for
        // servers present on both sides.
        for id in 0..self.servers.len() {
            backend.close_server(id);
        }

        let survivor_names: Vec<String> =
            staged.servers.iter().map(|s| s.name.clone()).collect();
        self.stats
            .retain_servers(survivor_names.iter().map(|s| s.as_str()));

        let staged = self.staged.take().unwrap();

        let mut servers = Vec::with_capacity(staged.servers.len());
        let mut by_name = HashMap::new();
        let mut kept: Vec<Option<ServerId>> = Vec::with_capacity(staged.servers.len());

        for node in &staged.servers {
            let zone = self.zone_for(&node.host);
            match Server::resolve(&node.host, node.port, zone) {
                Ok(server) => {
                    let id = servers.len();
                    by_name.insert(server.name.clone(), id);
                    servers.push(server);
                    kept.push(Some(id));
                }
                Err(_) => {
                    logging::warn!(self.log, "failed to resolve cluster node"; "name" => %node.name);
                    kept.push(None);
                }
            }
        }

        // Rebuild replica sets against the new server ids, slaves and
        // master both landing in their locality bucket.
        let mut replica_sets = Vec::with_capacity(staged.replica_sets.len());
        for rs in &staged.replica_sets {
            let mut out = ReplicaSet::new();

            if let Some(master_id) = rs.master.and_then(|idx| kept[idx]) {
                out.master = Some(master_id);
                let tag = self.tag_of(servers[master_id].zone.as_deref());
                out.tagged[tag].push(master_id);
            }
            for &slave in &rs.slaves {
                if let Some(slave_id) = kept[slave] {
                    let tag = self.tag_of(servers[slave_id].zone.as_deref());
                    out.tagged[tag].push(slave_id);
                }
            }

            replica_sets.push(out);
        }

        self.servers = servers;
        self.by_name = by_name;
        self.replica_sets = replica_sets;
        self.staged = Some(StagedTopology {
            servers: Vec::new(),
            replica_sets: Vec::new(),
            slots: staged.slots,
        });

        for id in 0..self.servers.len() {
            let addr = self.servers[id].addr;
            if backend.connect(id, addr).is_err() {
                self.note_connect_failure(id, now_millis);
            }
        }

        self.servers_update_at = now_millis;

        logging::info!(self.log, "applied staged servers";
                       "servers" => self.servers.len(),
                       "replica_sets" => self.replica_sets.len());
    }

    fn apply_staged_slots(&mut self, now_millis: u64) {
        let staged = match self.staged.take() {
            Some(staged) => staged,
            None => return,
        };

        self.slots = staged.slots;
        self.slots_update_at = now_millis;

        let assigned = self.slots.iter().filter(|slot| slot.is_some()).count();
        logging::info!(self.log, "applied staged slots"; "assigned" => assigned);
    }

    #[inline]
    pub fn note_connect_failure(&mut self, id: ServerId, now_millis: u64) {
        let server = &mut self.servers[id];
        server.failure_count += 1;
        server.next_retry = now_millis + RETRY_BACKOFF_MS;
    }

    #[inline]
    pub fn note_alive(&mut self, id: ServerId) {
        let server = &mut self.servers[id];
        server.failure_count = 0;
        server.next_retry = 0;
    }

    /// Human-readable slot map, one line per replica-set transition plus
    /// one per tagged server, for the SLOT/SLOTS command.
    pub fn topo_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut last: Option<Option<u32>> = None;

        for (slot, rs_idx) in self.slots.iter().enumerate() {
            if last == Some(*rs_idx) {
                continue;
            }
            last = Some(*rs_idx);

            let rs = match rs_idx.and_then(|idx| self.replica_sets.get(idx as usize)) {
                Some(rs) => rs,
                None => {
                    lines.push(format!("slot {:5} owned by no server", slot));
                    continue;
                }
            };

            let master = rs
                .master
                .map(|id| self.servers[id].name.clone())
                .unwrap_or_else(|| "nil".to_string());
            lines.push(format!(
                "slot {:5} master {} tags[{},{},{},{},{}]",
                slot,
                master,
                rs.tagged[0].len(),
                rs.tagged[1].len(),
                rs.tagged[2].len(),
                rs.tagged[3].len(),
                rs.tagged[4].len()
            ));

            for (tag, bucket) in rs.tagged.iter().enumerate().rev() {
                for &id in bucket {
                    lines.push(format!("{:2}:{:<22}", tag, self.servers[id].name));
                }
            }
        }

        lines
    }
}

fn parse_addr(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}

/// Drops the `$<len>\r\n ... \r\n` framing of a bulk reply, if present.
fn strip_bulk_frame(buf: &[u8]) -> &[u8] {
    if buf.first() != Some(&b'$') {
        return buf;
    }

    let body_start = match buf.iter().position(|&b| b == b'\n') {
        Some(lf) => lf + 1,
        None => return buf,
    };

    let body = &buf[body_start..];
    body.strip_suffix(b"\r\n").unwrap_or(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::MsgArena;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct MockBackend {
        enqueued: Vec<(ServerId, MsgId)>,
        closed: Vec<ServerId>,
        connected: Vec<ServerId>,
    }

    impl MockBackend {
        fn new() -> MockBackend {
            MockBackend {
                enqueued: Vec::new(),
                closed: Vec::new(),
                connected: Vec::new(),
            }
        }
    }

    impl Backend for MockBackend {
        fn enqueue(&mut self, server: ServerId, _addr: SocketAddr, msg: MsgId) -> NetResult<()> {
            self.enqueued.push((server, msg));
            Ok(())
        }

        fn close_server(&mut self, server: ServerId) {
            self.closed.push(server);
        }

        fn connect(&mut self, server: ServerId, _addr: SocketAddr) -> NetResult<()> {
            self.connected.push(server);
            Ok(())
        }
    }

    const SNAPSHOT: &str = "\
aaa 127.0.0.1:7001 master - 0 0 1 connected 0-8191
bbb 127.0.0.2:7002 master - 0 0 2 connected 8192-16383
ccc 127.0.0.3:7003 slave aaa 0 0 1 connected
";

    fn pool_with_topology() -> ServerPool {
        let config = PoolConfig {
            servers: vec!["127.0.0.1:7001".to_string()],
            zone: "z1".to_string(),
            zone_map: vec![
                ("127.0.0.1".to_string(), "z1".to_string()),
                ("127.0.0.3".to_string(), "z1".to_string()),
            ],
            update_ticks: 0,
            ..PoolConfig::default()
        };
        let log = Logger::root(logging::Discard, logging::o!());
        let mut pool = ServerPool::new(config, log);

        let mut probe_chain = Chain::new();
        probe_chain.append(SNAPSHOT.as_bytes());
        assert!(pool.capture_probe(&probe_chain));

        let mut arena = MsgArena::new(512);
        let mut backend = MockBackend::new();
        let mut rng = StdRng::seed_from_u64(7);
        pool.tick(&mut arena, &mut backend, &mut rng, 1_000);

        pool
    }

    #[test]
    fn test_probe_applies_topology() {
        let pool = pool_with_topology();

        assert_eq!(pool.servers().len(), 3);
        assert!(pool.find_server("127.0.0.1:7001").is_some());
        assert!(pool.find_server("127.0.0.2:7002").is_some());
        assert_eq!(pool.slots_update_at, 1_000);
        assert_eq!(pool.servers_update_at, 1_000);
    }

    #[test]
    fn test_writes_route_to_master_deterministically() {
        let pool = pool_with_topology();
        let mut rng = StdRng::seed_from_u64(1);

        let first = pool.route(MsgType::Set, b"foo", &mut rng).unwrap();
        let second = pool.route(MsgType::Set, b"foo", &mut rng).unwrap();

        assert_eq!(first, second);
        // foo hashes to slot 12182, owned by 127.0.0.2:7002.
        assert_eq!(pool.server(first).name, "127.0.0.2:7002");
    }

    #[test]
    fn test_reads_stay_within_replica_set() {
        let pool = pool_with_topology();
        let mut rng = StdRng::seed_from_u64(2);

        // bar hashes to slot 5061, owned by 7001 with slave 7003, both in
        // the pool's own zone.
        let expected: Vec<&str> = vec!["127.0.0.1:7001", "127.0.0.3:7003"];
        for _ in 0..32 {
            let id = pool.route(MsgType::Get, b"bar", &mut rng).unwrap();
            assert!(expected.contains(&pool.server(id).name.as_str()));
        }
    }

    #[test]
    fn test_unassigned_slot_is_no_server() {
        let config = PoolConfig {
            servers: vec!["127.0.0.1:7001".to_string()],
            ..PoolConfig::default()
        };
        let log = Logger::root(logging::Discard, logging::o!());
        let pool = ServerPool::new(config, log);
        let mut rng = StdRng::seed_from_u64(3);

        assert_eq!(
            pool.route(MsgType::Get, b"foo", &mut rng),
            Err(NetError::Fatal(ErrorType::NoServer))
        );
    }

    #[test]
    fn test_tick_sends_probe_on_interval() {
        let config = PoolConfig {
            servers: vec!["127.0.0.1:7001".to_string()],
            update_ticks: 2,
            ..PoolConfig::default()
        };
        let log = Logger::root(logging::Discard, logging::o!());
        let mut pool = ServerPool::new(config, log);

        let mut arena = MsgArena::new(512);
        let mut backend = MockBackend::new();
        let mut rng = StdRng::seed_from_u64(4);

        // Counts down: nothing fires until ticks_left hits zero.
        pool.tick(&mut arena, &mut backend, &mut rng, 0);
        pool.tick(&mut arena, &mut backend, &mut rng, 100);
        assert!(backend.enqueued.is_empty());

        pool.tick(&mut arena, &mut backend, &mut rng, 200);
        assert_eq!(backend.enqueued.len(), 1);

        let (_, msg_id) = backend.enqueued[0];
        let msg = arena.msg(msg_id).unwrap();
        assert_eq!(msg.chain.to_vec(), CLUSTER_NODES_PROBE);
        assert!(msg.owner.is_none());
    }

    #[test]
    fn test_framed_probe_snapshot_applies() {
        let config = PoolConfig {
            servers: vec!["127.0.0.1:7001".to_string()],
            update_ticks: 0,
            ..PoolConfig::default()
        };
        let log = Logger::root(logging::Discard, logging::o!());
        let mut pool = ServerPool::new(config, log);

        // The capture path stores the reply with its bulk framing intact.
        let body = "aaa 127.0.0.1:7001 master - 0 0 1 connected 0-16383\n";
        let wire = format!("${}\r\n{}\r\n", body.len(), body);
        let mut chain = Chain::new();
        chain.append(wire.as_bytes());
        assert!(pool.capture_probe(&chain));

        let mut arena = MsgArena::new(512);
        let mut backend = MockBackend::new();
        let mut rng = StdRng::seed_from_u64(11);
        pool.tick(&mut arena, &mut backend, &mut rng, 100);

        let mut route_rng = StdRng::seed_from_u64(12);
        let id = pool.route(MsgType::Get, b"anything", &mut route_rng).unwrap();
        assert_eq!(pool.server(id).name, "127.0.0.1:7001");
        assert_eq!(pool.probe_snapshot(), wire.as_bytes());
    }

    #[test]
    fn test_busy_probe_buffer_drops_second_capture() {
        let config = PoolConfig::default();
        let log = Logger::root(logging::Discard, logging::o!());
        let mut pool = ServerPool::new(config, log);

        let mut chain = Chain::new();
        chain.append(SNAPSHOT.as_bytes());

        assert!(pool.capture_probe(&chain));
        assert!(!pool.capture_probe(&chain));
    }

    #[test]
    fn test_swap_preserves_surviving_stats() {
        let mut pool = pool_with_topology();
        pool.stats.server("127.0.0.1:7001").requests = 42;
        pool.stats.server("127.0.0.9:9999").requests = 5;

        // A second probe with the same nodes re-applies the topology.
        let mut chain = Chain::new();
        chain.append(SNAPSHOT.as_bytes());
        assert!(pool.capture_probe(&chain));

        let mut arena = MsgArena::new(512);
        let mut backend = MockBackend::new();
        let mut rng = StdRng::seed_from_u64(5);
        pool.tick(&mut arena, &mut backend, &mut rng, 2_000);

        assert_eq!(
            pool.stats.server_snapshot("127.0.0.1:7001").unwrap().requests,
            42
        );
        assert!(pool.stats.server_snapshot("127.0.0.9:9999").is_none());
        assert!(!backend.closed.is_empty());
        assert_eq!(backend.connected.len(), 3);
    }

    #[test]
    fn test_topo_lines_walk_transitions() {
        let pool = pool_with_topology();
        let lines = pool.topo_lines();

        // Two replica sets: a master line each, plus tagged-server lines.
        assert!(lines[0].starts_with("slot     0 master 127.0.0.1:7001"));
        assert!(lines.iter().any(|l| l.contains("master 127.0.0.2:7002")));
        assert!(lines.iter().any(|l| l.contains("127.0.0.3:7003")));
    }
}
