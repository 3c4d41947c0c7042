//! Hooks around forwarding. The response-side hook intercepts `-MOVED` and
//! `-ASK` redirects (re-sending the original request verbatim to the named
//! server, preceded by `ASKING` where required) and captures topology-probe
//! replies into the pool's snapshot buffer. The connect-side hook injects
//! the synthetic AUTH and SELECT messages a fresh backend connection needs.

use crate::cluster::{Backend, ServerPool};
use crate::msg::{MsgArena, MsgId, MsgType};
use keel::logging::{self, Logger};

pub const ASKING_MESSAGE: &[u8] = b"*1\r\n$6\r\nASKING\r\n";

/// What the caller should do with a response after the hook ran.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ForwardAction {
    /// Deliver to the client as usual.
    Forward,
    /// The hook consumed the response; nothing goes to the client.
    Consumed,
}

/// Runs on every response arriving from a backend, before the default
/// forward-to-client path.
pub fn pre_rsp_forward(
    arena: &mut MsgArena,
    pool: &mut ServerPool,
    backend: &mut dyn Backend,
    rsp_id: MsgId,
    log: &Logger,
) -> ForwardAction {
    let (rsp_type, addr_span, req_id) = {
        let rsp = arena.msg(rsp_id).expect("forward hook on a live response");
        (rsp.mtype, rsp.redirect_addr, rsp.peer)
    };

    if rsp_type == MsgType::Moved || rsp_type == MsgType::Ask {
        let req_id = req_id.expect("redirect reply is paired");
        return redirect(arena, pool, backend, rsp_id, req_id, rsp_type, addr_span, log);
    }

    // A reply whose request has no owning connection is the topology probe.
    let probe = match req_id {
        Some(req_id) => arena.msg(req_id).map_or(false, |req| req.owner.is_none()),
        None => false,
    };

    if probe {
        let req_id = req_id.unwrap();
        {
            let rsp = arena.msg(rsp_id).unwrap();
            pool.capture_probe(&rsp.chain);
        }
        arena.put(req_id);
        arena.put(rsp_id);
        return ForwardAction::Consumed;
    }

    ForwardAction::Forward
}

#[allow(clippy::too_many_arguments)]
fn redirect(
    arena: &mut MsgArena,
    pool: &mut ServerPool,
    backend: &mut dyn Backend,
    rsp_id: MsgId,
    req_id: MsgId,
    rsp_type: MsgType,
    addr_span: Option<(u64, u64)>,
    log: &Logger,
) -> ForwardAction {
    // Rewind the request so it is re-sent byte for byte.
    {
        let req = arena.msg_mut(req_id).expect("redirected request is live");
        req.chain.rewind_read();
        req.peer = None;
    }

    let addr = {
        let rsp = arena.msg(rsp_id).unwrap();
        let (start, end) = match addr_span {
            Some(span) => span,
            None => {
                logging::warn!(log, "redirect reply carried no address");
                arena.put(req_id);
                arena.put(rsp_id);
                return ForwardAction::Consumed;
            }
        };
        String::from_utf8_lossy(&rsp.chain.copy_range(start, end)).into_owned()
    };

    let (server, server_addr) = match pool.find_server(&addr) {
        Some(server) => (server, pool.server(server).addr),
        None => {
            logging::warn!(log, "redirect target not in server table"; "addr" => %addr);
            arena.put(req_id);
            arena.put(rsp_id);
            return ForwardAction::Consumed;
        }
    };

    if rsp_type == MsgType::Ask {
        let ask_id = arena.get(true);
        let ask = arena.msg_mut(ask_id).unwrap();
        ask.chain.append(ASKING_MESSAGE);
        ask.swallow = true;
        ask.owner = None;

        if backend.enqueue(server, server_addr, ask_id).is_err() {
            logging::warn!(log, "failed to enqueue ASKING"; "addr" => %addr);
            arena.put(ask_id);
            arena.put(req_id);
            arena.put(rsp_id);
            return ForwardAction::Consumed;
        }
    }

    if backend.enqueue(server, server_addr, req_id).is_err() {
        logging::warn!(log, "failed to re-enqueue redirected request"; "addr" => %addr);
        arena.put(req_id);
        arena.put(rsp_id);
        return ForwardAction::Consumed;
    }

    pool.stats.redirects += 1;
    logging::debug!(log, "followed redirect";
                    "kind" => ?rsp_type, "addr" => %addr);

    arena.put(rsp_id);
    ForwardAction::Consumed
}

/// Synthetic messages to enqueue, in order, at the head of a freshly
/// connected backend connection's queue: AUTH when the pool has a
/// password, SELECT when a non-zero database is configured. Both are
/// swallowed; their replies never reach a client.
pub fn post_connect(arena: &mut MsgArena, pool: &ServerPool) -> Vec<MsgId> {
    let mut msgs = Vec::new();

    if let Some(password) = &pool.config.auth {
        if !password.is_empty() {
            let id = arena.get(true);
            let msg = arena.msg_mut(id).unwrap();
            msg.chain.append(
                format!("*2\r\n$4\r\nAUTH\r\n${}\r\n{}\r\n", password.len(), password)
                    .as_bytes(),
            );
            msg.mtype = MsgType::Auth;
            msg.swallow = true;
            msg.owner = None;
            msgs.push(id);
        }
    }

    if pool.config.redis_db > 0 {
        let db = pool.config.redis_db.to_string();
        let id = arena.get(true);
        let msg = arena.msg_mut(id).unwrap();
        msg.chain
            .append(format!("*2\r\n$6\r\nSELECT\r\n${}\r\n{}\r\n", db.len(), db).as_bytes());
        msg.mtype = MsgType::Select;
        msg.swallow = true;
        msg.owner = None;
        msgs.push(id);
    }

    msgs
}

/// Called when a swallowed reply is dropped: an error answer to the
/// synthetic SELECT is worth a warning, but never fails the connection.
pub fn log_swallowed(
    arena: &MsgArena,
    req_id: MsgId,
    rsp_id: MsgId,
    server_name: &str,
    log: &Logger,
) {
    let req_type = arena.msg(req_id).map(|m| m.mtype);
    let rsp = match arena.msg(rsp_id) {
        Some(rsp) => rsp,
        None => return,
    };

    if req_type == Some(MsgType::Select) && rsp.mtype == MsgType::Error {
        let bytes = rsp.chain.to_vec();
        let text = bytes
            .strip_prefix(b"-")
            .unwrap_or(&bytes)
            .strip_suffix(b"\r\n")
            .unwrap_or(&bytes);
        let text = String::from_utf8_lossy(&text[..text.len().min(127)]).into_owned();

        logging::warn!(log, "synthetic SELECT failed";
                       "server" => server_name, "reply" => text);
    }
}
