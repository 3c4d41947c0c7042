//! The single-threaded poll loop tying everything together: accepting
//! clients, parsing requests, fragmenting and routing them to backend
//! connections, pairing replies, coalescing fragments and delivering
//! responses in arrival order.

use crate::cluster::{Backend, ServerId, ServerPool};
use crate::dispatch;
use crate::forward::{self, ForwardAction};
use crate::fragment;
use crate::msg::{ConnId, MsgArena, MsgId};
use crate::net::conn::{Conn, ConnKind};
use hashbrown::HashMap;
use keel::logging::{self, LevelHandle, LogControl, Logger};
use keel::shared::{ErrorType, NetError, NetResult};
use keel::time::Clock;
use keel::allowlist::AllowlistHandle;
use mio::net::{TcpListener, TcpStream};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

const LISTENER_TOKEN: mio::Token = mio::Token(0);
const EVENT_CAPACITY: usize = 8192;

const EMSG_NO_SERVER: &[u8] = b"-ERR no server available\r\n";
const EMSG_BACKEND_LOST: &[u8] = b"-ERR backend connection lost\r\n";
const EMSG_BAD_REQUEST: &[u8] = b"-ERR bad request\r\n";

/// Socket-side state split out so the pool can drive it through the
/// `Backend` trait while the endpoint holds the pool itself.
struct Sockets {
    poll: mio::Poll,
    conns: Vec<Option<Conn>>,
    free: Vec<ConnId>,
    /// Open connections per server, reused LIFO.
    server_conns: HashMap<ServerId, Vec<ConnId>>,
    /// Connections opened since the last sweep; the endpoint injects the
    /// post-connect messages into these.
    fresh: Vec<ConnId>,
    /// Connections condemned during a pool tick, cleaned up afterwards.
    dead: Vec<ConnId>,
    log: Logger,
}

impl Sockets {
    fn register(&mut self, conn: Conn) -> NetResult<ConnId> {
        let id = conn.id;

        self.poll.register(
            conn.stream(),
            mio::Token(id + 1),
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )?;

        self.conns[id] = Some(conn);
        Ok(id)
    }

    fn slot(&mut self) -> ConnId {
        match self.free.pop() {
            Some(id) => id,
            None => {
                self.conns.push(None);
                self.conns.len() - 1
            }
        }
    }

    fn conn_mut(&mut self, id: ConnId) -> Option<&mut Conn> {
        self.conns.get_mut(id).and_then(|slot| slot.as_mut())
    }

    /// A live connection to the server, reusing the most recently used one
    /// or dialing a new non-blocking connect.
    fn acquire(&mut self, server: ServerId, addr: SocketAddr) -> NetResult<ConnId> {
        if let Some(stack) = self.server_conns.get(&server) {
            if let Some(&id) = stack.last() {
                return Ok(id);
            }
        }

        let stream = TcpStream::connect(&addr)?;
        let id = self.slot();
        let conn = Conn::new(id, ConnKind::Server(server), stream);
        self.register(conn)?;

        self.server_conns.entry(server).or_default().push(id);
        self.fresh.push(id);

        logging::debug!(self.log, "connected to server"; "server" => server, "addr" => %addr);
        Ok(id)
    }
}

impl Backend for Sockets {
    fn enqueue(&mut self, server: ServerId, addr: SocketAddr, msg: MsgId) -> NetResult<()> {
        let id = self.acquire(server, addr)?;
        self.conn_mut(id)
            .expect("acquired connection is live")
            .pending
            .push_back(msg);
        Ok(())
    }

    fn close_server(&mut self, server: ServerId) {
        if let Some(stack) = self.server_conns.remove(&server) {
            self.dead.extend(stack);
        }
    }

    fn connect(&mut self, server: ServerId, addr: SocketAddr) -> NetResult<()> {
        self.acquire(server, addr).map(|_| ())
    }
}

pub struct Endpoint {
    listener: TcpListener,
    events: mio::Events,
    sockets: Sockets,

    pool: ServerPool,
    arena: MsgArena,
    rng: StdRng,
    clock: Clock,

    allowlist: AllowlistHandle,
    log_level: LevelHandle,
    admin: Option<Receiver<LogControl>>,

    log: Logger,
}

impl Endpoint {
    pub fn new(
        address: &str,
        pool: ServerPool,
        arena: MsgArena,
        allowlist: AllowlistHandle,
        log_level: LevelHandle,
        admin: Option<Receiver<LogControl>>,
        tick_interval: Duration,
        log: Logger,
    ) -> NetResult<Endpoint> {
        let poll = mio::Poll::new()?;
        let listener = TcpListener::bind(&address.parse::<SocketAddr>()?)?;

        poll.register(
            &listener,
            LISTENER_TOKEN,
            mio::Ready::readable(),
            mio::PollOpt::edge(),
        )?;

        Ok(Endpoint {
            listener,
            events: mio::Events::with_capacity(EVENT_CAPACITY),
            sockets: Sockets {
                poll,
                conns: Vec::new(),
                free: Vec::new(),
                server_conns: HashMap::new(),
                fresh: Vec::new(),
                dead: Vec::new(),
                log: log.clone(),
            },
            pool,
            arena,
            rng: StdRng::from_entropy(),
            clock: Clock::new(tick_interval),
            allowlist,
            log_level,
            admin,
            log,
        })
    }

    pub fn run(&mut self) -> NetResult<()> {
        loop {
            self.turn(Some(self.clock.interval()))?;
        }
    }

    /// One loop iteration: poll, handle readiness, tick.
    pub fn turn(&mut self, timeout: Option<Duration>) -> NetResult<()> {
        self.sockets.poll.poll(&mut self.events, timeout)?;

        let mut ready: Vec<(ConnId, bool, bool)> = Vec::new();
        for event in &self.events {
            if event.token() == LISTENER_TOKEN {
                ready.push((usize::MAX, false, false));
            } else {
                let id = usize::from(event.token()) - 1;
                ready.push((
                    id,
                    event.readiness().is_readable(),
                    event.readiness().is_writable(),
                ));
            }
        }

        for (id, readable, writable) in ready {
            if id == usize::MAX {
                self.accept_clients();
                continue;
            }

            if readable {
                self.handle_readable(id);
            }
            if writable {
                self.handle_writable(id);
            }
        }

        let now = Instant::now();
        for _ in 0..self.clock.advance(now) {
            self.tick();
        }

        Ok(())
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if !self.allowlist.is_allowed(&peer.ip().to_string()) {
                        logging::info!(self.log, "client rejected by allowlist"; "peer" => %peer);
                        continue;
                    }

                    let id = self.sockets.slot();
                    let mut conn = Conn::new(id, ConnKind::Client, stream);
                    conn.need_auth = matches!(&self.pool.config.auth, Some(p) if !p.is_empty());

                    match self.sockets.register(conn) {
                        Ok(_) => {
                            logging::debug!(self.log, "client connected";
                                            "conn" => id, "peer" => %peer);
                        }
                        Err(err) => {
                            logging::warn!(self.log, "failed to register client";
                                           "err" => ?err);
                            self.sockets.free.push(id);
                        }
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "accept failed"; "err" => ?err);
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, id: ConnId) {
        let conn = match self.sockets.conn_mut(id) {
            Some(conn) => conn,
            None => return,
        };
        let is_client = conn.is_client();

        let completed = match conn.receive(&mut self.arena) {
            Ok(completed) => completed,
            Err(NetError::Wait) => return,
            Err(err) => {
                logging::debug!(self.log, "connection failed on read";
                                "conn" => id, "err" => ?err);
                self.close_conn(id);
                return;
            }
        };

        for msg_id in completed {
            if is_client {
                self.process_request(id, msg_id);
            } else {
                self.process_response(id, msg_id);
            }

            // The connection may have been condemned mid-batch.
            if self.sockets.conn_mut(id).is_none() {
                break;
            }
        }

        self.sweep_dead();
    }

    fn handle_writable(&mut self, id: ConnId) {
        let is_client = match self.sockets.conn_mut(id) {
            Some(conn) => conn.is_client(),
            None => return,
        };

        if is_client {
            self.flush_client(id);
        } else {
            self.flush_server(id);
        }
    }

    // -- request path ----------------------------------------------------

    fn process_request(&mut self, conn_id: ConnId, req_id: MsgId) {
        {
            let req = self.arena.msg_mut(req_id).expect("completed request is live");
            req.owner = Some(conn_id);
        }

        let (quit, mut noforward, mtype) = {
            let req = self.arena.msg(req_id).unwrap();
            (req.quit, req.noforward, req.mtype)
        };

        if quit {
            self.arena.put(req_id);
            let close_now = match self.sockets.conn_mut(conn_id) {
                Some(conn) => {
                    conn.closing = true;
                    conn.outstanding.is_empty()
                }
                None => false,
            };
            if close_now {
                self.close_conn(conn_id);
            }
            return;
        }

        dispatch::check_req_size(&mut self.arena, req_id, self.pool.config.req_limit);
        noforward |= self.arena.msg(req_id).unwrap().noforward;

        // Unauthenticated connections get nothing but AUTH through.
        let need_auth = self
            .sockets
            .conn_mut(conn_id)
            .map_or(false, |conn| conn.need_auth);
        if need_auth && mtype != crate::msg::MsgType::Auth {
            noforward = true;
        }

        if noforward {
            self.reply_internal(conn_id, req_id);
            return;
        }

        let frags = match fragment::fragment(&mut self.arena, req_id, self.pool.hash_fn()) {
            Ok(frags) => frags,
            Err(err) => {
                logging::warn!(self.log, "fragmentation failed"; "err" => ?err);
                self.close_conn(conn_id);
                return;
            }
        };

        if let Some(conn) = self.sockets.conn_mut(conn_id) {
            conn.outstanding.push_back(req_id);
        }

        if frags.is_empty() {
            if let Err(text) = self.forward_to_backend(req_id) {
                self.error_reply(req_id, text);
                self.flush_client(conn_id);
            }
        } else {
            for &frag_id in &frags {
                if let Err(text) = self.forward_to_backend(frag_id) {
                    // One unroutable fragment fails the whole request.
                    let owner = self.arena.msg_mut(req_id).unwrap();
                    owner.mark_error(ErrorType::NoServer);
                    self.error_reply(req_id, text);
                    self.flush_client(conn_id);
                    break;
                }
            }
        }

        self.flush_fresh_and_pending();
    }

    /// Routes one request (or fragment) and queues it on a server
    /// connection.
    fn forward_to_backend(&mut self, msg_id: MsgId) -> Result<(), &'static [u8]> {
        let (mtype, key) = {
            let msg = self.arena.msg(msg_id).expect("forwarding a live message");
            if msg.keys.is_empty() {
                return Err(EMSG_BAD_REQUEST);
            }
            (msg.mtype, msg.key_bytes(0))
        };

        let server = self
            .pool
            .route(mtype, &key, &mut self.rng)
            .map_err(|_| EMSG_NO_SERVER)?;

        let now_millis = keel::time::timestamp_millis();
        if !self.pool.server(server).ready_for_retry(now_millis) {
            return Err(EMSG_NO_SERVER);
        }
        let addr = self.pool.server(server).addr;

        let name = self.pool.server(server).name.clone();
        self.pool.stats.server(&name).requests += 1;

        if self.sockets.enqueue(server, addr, msg_id).is_err() {
            self.pool.note_connect_failure(server, now_millis);
            return Err(EMSG_NO_SERVER);
        }
        Ok(())
    }

    fn reply_internal(&mut self, conn_id: ConnId, req_id: MsgId) {
        let rsp_id = self.arena.get(false);
        {
            let [req, rsp] = self
                .arena
                .pair_mut(req_id, rsp_id)
                .expect("request and response are distinct");
            req.peer = Some(rsp.id);
            rsp.peer = Some(req.id);
        }

        let mut need_auth = self
            .sockets
            .conn_mut(conn_id)
            .map_or(false, |conn| conn.need_auth);

        let result = dispatch::reply(
            &mut self.arena,
            req_id,
            rsp_id,
            &self.pool,
            std::slice::from_ref(&self.pool),
            &mut need_auth,
        );

        if let Some(conn) = self.sockets.conn_mut(conn_id) {
            conn.need_auth = need_auth;
            conn.outstanding.push_back(req_id);
        }

        if result.is_err() {
            self.close_conn(conn_id);
            return;
        }

        self.arena.msg_mut(req_id).unwrap().done = true;
        self.flush_client(conn_id);
    }

    fn error_reply(&mut self, req_id: MsgId, text: &[u8]) {
        let rsp_id = self.arena.get(false);
        self.arena.msg_mut(rsp_id).unwrap().chain.append(text);

        let [req, rsp] = self
            .arena
            .pair_mut(req_id, rsp_id)
            .expect("request and response are distinct");
        req.peer = Some(rsp.id);
        rsp.peer = Some(req.id);
        req.done = true;
    }

    // -- response path ---------------------------------------------------

    fn process_response(&mut self, conn_id: ConnId, rsp_id: MsgId) {
        let req_id = match self.sockets.conn_mut(conn_id) {
            Some(conn) => match conn.inflight.pop_front() {
                Some(req_id) => {
                    conn.inflight_since = if conn.inflight.is_empty() {
                        None
                    } else {
                        Some(Instant::now())
                    };
                    req_id
                }
                None => {
                    logging::warn!(self.log, "unsolicited reply from server"; "conn" => conn_id);
                    self.arena.put(rsp_id);
                    self.close_conn(conn_id);
                    return;
                }
            },
            None => {
                self.arena.put(rsp_id);
                return;
            }
        };

        {
            let [req, rsp] = self
                .arena
                .pair_mut(req_id, rsp_id)
                .expect("request and response are distinct");
            req.peer = Some(rsp.id);
            rsp.peer = Some(req.id);
            rsp.owner = Some(conn_id);
        }

        if let Some(ConnKind::Server(server)) = self.sockets.conn_mut(conn_id).map(|c| c.kind) {
            self.pool.note_alive(server);
            let name = self.pool.server(server).name.clone();
            self.pool.stats.server(&name).responses += 1;
        }

        dispatch::check_rsp_size(&mut self.arena, rsp_id, self.pool.config.rsp_limit);

        let action = forward::pre_rsp_forward(
            &mut self.arena,
            &mut self.pool,
            &mut self.sockets,
            rsp_id,
            &self.log,
        );
        if action == ForwardAction::Consumed {
            self.flush_fresh_and_pending();
            return;
        }

        let (swallow, frag_id, frag_owner, client) = {
            let req = self.arena.msg(req_id).expect("paired request is live");
            (req.swallow, req.frag_id, req.frag_owner, req.owner)
        };

        if swallow {
            let server_name = match self.sockets.conn_mut(conn_id).map(|c| c.kind) {
                Some(ConnKind::Server(server)) => self.pool.server(server).name.clone(),
                _ => String::new(),
            };
            forward::log_swallowed(&self.arena, req_id, rsp_id, &server_name, &self.log);
            self.arena.put(req_id);
            self.arena.put(rsp_id);
            return;
        }

        if frag_id != 0 {
            let owner_id = frag_owner.expect("fragment has an owner");

            // The owner may be gone already (client hung up); drain the
            // straggler quietly.
            if self.arena.msg(owner_id).is_none() {
                self.arena.put(req_id);
                self.arena.put(rsp_id);
                return;
            }

            fragment::pre_coalesce(&mut self.arena, rsp_id);

            let (owner_done, owner_client) = {
                let owner = self.arena.msg(owner_id).unwrap();
                (owner.nfrag_done >= owner.nfrag && !owner.done, owner.owner)
            };

            if owner_done {
                self.finish_coalesce(owner_id);
                if let Some(client_id) = owner_client {
                    self.flush_client(client_id);
                }
            }
            return;
        }

        self.arena.msg_mut(req_id).unwrap().done = true;
        if let Some(client_id) = client {
            self.flush_client(client_id);
        }
    }

    fn finish_coalesce(&mut self, owner_id: MsgId) {
        let rsp_id = self.arena.get(false);
        {
            let [owner, rsp] = self
                .arena
                .pair_mut(owner_id, rsp_id)
                .expect("owner and response are distinct");
            owner.peer = Some(rsp.id);
            rsp.peer = Some(owner.id);
        }

        let coalesce = fragment::post_coalesce(&mut self.arena, owner_id);

        // Release the fragments and their replies; the combined response
        // has everything it needs now.
        let frag_seq = self.arena.msg(owner_id).unwrap().frag_seq.clone();
        let mut seen = Vec::new();
        for frag_id in frag_seq {
            if seen.contains(&frag_id) {
                continue;
            }
            seen.push(frag_id);

            if let Some(frag_rsp) = self.arena.msg(frag_id).and_then(|frag| frag.peer) {
                self.arena.put(frag_rsp);
            }
            self.arena.put(frag_id);
        }

        let mut close_client = None;
        {
            let owner = self.arena.msg_mut(owner_id).unwrap();
            match coalesce {
                Ok(()) => owner.done = true,
                Err(_) => {
                    // A missing sub-reply is unrecoverable for this client.
                    owner.mark_error(ErrorType::BadFragment);
                    owner.done = true;
                    close_client = owner.owner;
                }
            }
        }

        if let Some(client_id) = close_client {
            self.close_conn(client_id);
            return;
        }

        if self.arena.msg(owner_id).map_or(false, |o| o.error.is_some()) {
            // Owner errored along the way: replace the reply content.
            if let Some(rsp) = self.arena.msg_mut(rsp_id) {
                if rsp.chain.is_empty() {
                    rsp.chain.append(EMSG_BACKEND_LOST);
                }
            }
        }
    }

    // -- delivery --------------------------------------------------------

    /// Writes finished responses to the client in request order.
    fn flush_client(&mut self, conn_id: ConnId) {
        loop {
            let head = match self.sockets.conn_mut(conn_id) {
                Some(conn) => match conn.outstanding.front() {
                    Some(&head) => head,
                    None => break,
                },
                None => return,
            };

            let (done, rsp_id) = match self.arena.msg(head) {
                Some(req) => (req.done, req.peer),
                None => {
                    // Request vanished; drop the queue slot.
                    self.sockets
                        .conn_mut(conn_id)
                        .unwrap()
                        .outstanding
                        .pop_front();
                    continue;
                }
            };

            if !done {
                break;
            }

            let rsp_id = match rsp_id {
                Some(rsp_id) => rsp_id,
                None => {
                    self.sockets
                        .conn_mut(conn_id)
                        .unwrap()
                        .outstanding
                        .pop_front();
                    self.arena.put(head);
                    continue;
                }
            };

            let conn = self.sockets.conn_mut(conn_id).unwrap();
            let rsp = self.arena.msg_mut(rsp_id).unwrap();

            match rsp.chain.egress(conn.stream_mut()) {
                Ok(_) => {
                    conn.outstanding.pop_front();
                    self.arena.put(head);
                    self.arena.put(rsp_id);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::debug!(self.log, "client write failed";
                                    "conn" => conn_id, "err" => ?err);
                    self.close_conn(conn_id);
                    return;
                }
            }
        }

        let close_now = self
            .sockets
            .conn_mut(conn_id)
            .map_or(false, |conn| conn.closing && conn.outstanding.is_empty());
        if close_now {
            self.close_conn(conn_id);
        }
    }

    fn flush_server(&mut self, conn_id: ConnId) {
        let result = match self.sockets.conn_mut(conn_id) {
            Some(conn) => conn.send_pending(&mut self.arena),
            None => return,
        };

        match result {
            Ok(()) | Err(NetError::Wait) => {}
            Err(err) => {
                logging::debug!(self.log, "server write failed";
                                "conn" => conn_id, "err" => ?err);
                self.close_conn(conn_id);
            }
        }
    }

    /// Post-connect injection for fresh server connections, then a write
    /// attempt on every connection with queued data.
    fn flush_fresh_and_pending(&mut self) {
        let fresh = std::mem::take(&mut self.sockets.fresh);
        for conn_id in fresh {
            let synthetic = forward::post_connect(&mut self.arena, &self.pool);
            if let Some(conn) = self.sockets.conn_mut(conn_id) {
                for (i, msg_id) in synthetic.into_iter().enumerate() {
                    conn.pending.insert(i, msg_id);
                }
            }
        }

        let ids: Vec<ConnId> = self
            .sockets
            .conns
            .iter()
            .flatten()
            .filter(|conn| !conn.is_client() && !conn.pending.is_empty())
            .map(|conn| conn.id)
            .collect();
        for id in ids {
            self.flush_server(id);
        }

        self.sweep_dead();
    }

    // -- lifecycle -------------------------------------------------------

    fn tick(&mut self) {
        if let Some(admin) = &self.admin {
            while let Ok(control) = admin.try_recv() {
                logging::info!(self.log, "applying log control"; "control" => ?control);
                self.log_level.apply(control);
            }
        }

        let now_millis = keel::time::timestamp_millis();
        self.pool
            .tick(&mut self.arena, &mut self.sockets, &mut self.rng, now_millis);

        self.flush_fresh_and_pending();
        self.sweep_timeouts();
        self.sweep_dead();
    }

    /// Backend connections whose oldest in-flight request has outlived the
    /// pool timeout get closed; their requests are errored to clients.
    fn sweep_timeouts(&mut self) {
        let timeout = Duration::from_millis(self.pool.config.timeout_ms);
        let now = Instant::now();

        let expired: Vec<ConnId> = self
            .sockets
            .conns
            .iter()
            .flatten()
            .filter(|conn| {
                !conn.is_client()
                    && conn
                        .inflight_since
                        .map_or(false, |since| now.duration_since(since) >= timeout)
            })
            .map(|conn| conn.id)
            .collect();

        for id in expired {
            logging::warn!(self.log, "backend timed out"; "conn" => id);
            self.close_conn(id);
        }
    }

    fn sweep_dead(&mut self) {
        let dead = std::mem::take(&mut self.sockets.dead);
        for id in dead {
            self.close_conn(id);
        }
    }

    fn close_conn(&mut self, conn_id: ConnId) {
        let mut conn = match self.sockets.conns.get_mut(conn_id).and_then(|slot| slot.take()) {
            Some(conn) => conn,
            None => return,
        };

        let _ = self.sockets.poll.deregister(conn.stream());
        conn.close();
        self.sockets.free.push(conn_id);

        if let Some(rmsg) = conn.rmsg.take() {
            self.arena.put(rmsg);
        }

        match conn.kind {
            ConnKind::Client => {
                logging::debug!(self.log, "client closed"; "conn" => conn_id);
                for req_id in conn.outstanding.drain(..) {
                    if let Some(rsp_id) = self.arena.msg(req_id).and_then(|req| req.peer) {
                        self.arena.put(rsp_id);
                    }
                    self.arena.put(req_id);
                }
            }
            ConnKind::Server(server) => {
                logging::debug!(self.log, "server connection closed";
                                "conn" => conn_id, "server" => server);

                if let Some(stack) = self.sockets.server_conns.get_mut(&server) {
                    stack.retain(|&id| id != conn_id);
                }

                let pending: Vec<MsgId> = conn.pending.drain(..).collect();
                let inflight: Vec<MsgId> = conn.inflight.drain(..).collect();
                for req_id in pending.into_iter().chain(inflight) {
                    self.fail_backend_request(req_id);
                }
            }
        }
    }

    /// A request lost to a dead backend connection: swallowed and probe
    /// messages are dropped, fragments poison their owner, plain requests
    /// are errored straight to the client.
    fn fail_backend_request(&mut self, req_id: MsgId) {
        let (swallow, probe, frag_owner, client) = match self.arena.msg(req_id) {
            Some(req) => (
                req.swallow,
                req.owner.is_none() && req.frag_id == 0,
                if req.frag_id != 0 { req.frag_owner } else { None },
                req.owner,
            ),
            None => return,
        };

        if swallow || probe {
            self.arena.put(req_id);
            return;
        }

        if let Some(owner_id) = frag_owner {
            self.arena.put(req_id);

            if self.arena.msg(owner_id).is_some() {
                let (owner_done, owner_client) = {
                    let owner = self.arena.msg_mut(owner_id).unwrap();
                    owner.mark_error(ErrorType::Io(io::ErrorKind::ConnectionReset));
                    owner.ferror = true;
                    owner.nfrag_done += 1;
                    (owner.nfrag_done >= owner.nfrag && !owner.done, owner.owner)
                };

                if owner_done {
                    self.error_reply(owner_id, EMSG_BACKEND_LOST);
                    if let Some(client_id) = owner_client {
                        self.flush_client(client_id);
                    }
                }
            }
            return;
        }

        self.error_reply(req_id, EMSG_BACKEND_LOST);
        if let Some(client_id) = client {
            self.flush_client(client_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::PoolConfig;

    #[test]
    fn test_endpoint_binds_and_turns() {
        let log = Logger::root(logging::Discard, logging::o!());
        let pool = ServerPool::new(PoolConfig::default(), log.clone());
        let level = test_level_handle();

        let mut endpoint = Endpoint::new(
            "127.0.0.1:0",
            pool,
            MsgArena::new(crate::buf::CHUNK_SIZE),
            AllowlistHandle::disabled(),
            level,
            None,
            Duration::from_millis(100),
            log,
        )
        .unwrap();

        // No clients, no servers: a turn is a no-op that must not block
        // beyond the timeout.
        endpoint.turn(Some(Duration::from_millis(10))).unwrap();
    }

    fn test_level_handle() -> LevelHandle {
        let (_, handle) = logging::init(&logging::Settings::default()).unwrap();
        handle
    }
}
