//! Commands the proxy answers itself: PING, AUTH, and the NODE/NODES and
//! SLOT/SLOTS introspection commands. Also the request/response size
//! limits. Replies are written straight into the paired response's chain.

use crate::cluster::ServerPool;
use crate::msg::{MsgArena, MsgId, MsgType};
use keel::shared::NetResult;

pub const REPL_OK: &[u8] = b"+OK\r\n";
pub const REPL_PONG: &[u8] = b"+PONG\r\n";

pub const AUTH_INVALID_PASSWORD: &[u8] = b"-ERR invalid password\r\n";
pub const AUTH_REQUIRE_PASSWORD: &[u8] = b"-NOAUTH Authentication required\r\n";
pub const AUTH_NO_PASSWORD: &[u8] = b"-ERR Client sent AUTH, but no password is set\r\n";

pub const NODES_INVALID: &[u8] =
    b"-ERR invalid server pool number for nodes command. try nodes 0\r\n";
pub const SLOTS_INVALID: &[u8] =
    b"-ERR invalid server pool number for slots command. try slots 0\r\n";

pub const EMSG_REQ_TOO_LARGE: &[u8] = b"-ERR req msg length too large\r\n";
pub const EMSG_RSP_TOO_LARGE: &[u8] = b"-ERR rsp msg length too large\r\n";

/// Builds the reply to a noforward request into the paired response.
/// `need_auth` is the owning client connection's gate; AUTH both reads and
/// writes it.
pub fn reply(
    arena: &mut MsgArena,
    req_id: MsgId,
    rsp_id: MsgId,
    pool: &ServerPool,
    pools: &[ServerPool],
    need_auth: &mut bool,
) -> NetResult<()> {
    let mtype = arena.msg(req_id).expect("replying to a live request").mtype;

    if mtype == MsgType::Auth {
        return handle_auth(arena, req_id, rsp_id, pool, need_auth);
    }

    if *need_auth {
        append(arena, rsp_id, AUTH_REQUIRE_PASSWORD);
        return Ok(());
    }

    match mtype {
        MsgType::Ping => append(arena, rsp_id, REPL_PONG),

        MsgType::ReqTooLarge => append(arena, rsp_id, EMSG_REQ_TOO_LARGE),

        MsgType::Node | MsgType::Nodes => {
            match pool_index(arena, req_id, pools.len()) {
                Some(idx) => {
                    let snapshot = pools[idx].probe_snapshot().to_vec();
                    let rsp = arena.msg_mut(rsp_id).unwrap();
                    rsp.chain.append(&snapshot);
                }
                None => append(arena, rsp_id, NODES_INVALID),
            }
        }

        MsgType::Slot | MsgType::Slots => {
            match pool_index(arena, req_id, pools.len()) {
                Some(idx) => {
                    let lines = pools[idx].topo_lines();
                    let rsp = arena.msg_mut(rsp_id).unwrap();
                    rsp.chain
                        .append(format!("*{}\r\n", lines.len()).as_bytes());
                    for line in &lines {
                        rsp.chain
                            .append(format!("${}\r\n{}\r\n", line.len(), line).as_bytes());
                    }
                }
                None => append(arena, rsp_id, SLOTS_INVALID),
            }
        }

        _ => unreachable!("reply called for a forwardable request"),
    }

    Ok(())
}

fn handle_auth(
    arena: &mut MsgArena,
    req_id: MsgId,
    rsp_id: MsgId,
    pool: &ServerPool,
    need_auth: &mut bool,
) -> NetResult<()> {
    let password = match &pool.config.auth {
        Some(password) if !password.is_empty() => password.clone(),
        _ => {
            append(arena, rsp_id, AUTH_NO_PASSWORD);
            return Ok(());
        }
    };

    let supplied = {
        let req = arena.msg(req_id).unwrap();
        if req.keys.is_empty() {
            Vec::new()
        } else {
            req.key_bytes(0)
        }
    };

    if supplied == password.as_bytes() {
        *need_auth = false;
        append(arena, rsp_id, REPL_OK);
    } else {
        *need_auth = true;
        append(arena, rsp_id, AUTH_INVALID_PASSWORD);
    }

    Ok(())
}

/// Optional numeric pool index argument of NODE/NODES and SLOT/SLOTS; no
/// argument means pool zero, leading digits are taken as written.
fn pool_index(arena: &MsgArena, req_id: MsgId, npools: usize) -> Option<usize> {
    let req = arena.msg(req_id).unwrap();

    let idx = if req.keys.is_empty() {
        0
    } else {
        let bytes = req.key_bytes(0);
        let mut value = 0usize;
        for &ch in &bytes {
            if !ch.is_ascii_digit() {
                break;
            }
            value = value * 10 + usize::from(ch - b'0');
        }
        value
    };

    if idx < npools {
        Some(idx)
    } else {
        None
    }
}

fn append(arena: &mut MsgArena, rsp_id: MsgId, bytes: &[u8]) {
    arena
        .msg_mut(rsp_id)
        .expect("replying into a live response")
        .chain
        .append(bytes);
}

/// Demotes an oversized request so the reply path answers it with an error
/// instead of forwarding.
pub fn check_req_size(arena: &mut MsgArena, req_id: MsgId, limit: u64) {
    let req = arena.msg_mut(req_id).expect("size check on a live request");
    debug_assert!(req.request);

    if req.mlen() > limit {
        req.noforward = true;
        req.mtype = MsgType::ReqTooLarge;
    }
}

/// Replaces an oversized response's content with a fixed error reply.
pub fn check_rsp_size(arena: &mut MsgArena, rsp_id: MsgId, limit: u64) {
    let rsp = arena.msg_mut(rsp_id).expect("size check on a live response");
    debug_assert!(!rsp.request);

    if rsp.mlen() > limit {
        rsp.chain.clear();
        rsp.frag_seq.clear();
        rsp.keys.clear();
        rsp.chain.append(EMSG_RSP_TOO_LARGE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::PoolConfig;
    use crate::codec::{self, ParseResult};
    use keel::logging::{self, Logger};

    fn pool(auth: Option<&str>) -> ServerPool {
        let config = PoolConfig {
            auth: auth.map(|s| s.to_string()),
            ..PoolConfig::default()
        };
        ServerPool::new(config, Logger::root(logging::Discard, logging::o!()))
    }

    fn parse_req(arena: &mut MsgArena, bytes: &[u8]) -> MsgId {
        let id = arena.get(true);
        let msg = arena.msg_mut(id).unwrap();
        msg.chain.append(bytes);
        assert_eq!(codec::parse(msg), ParseResult::Ok);
        id
    }

    fn run_reply(
        arena: &mut MsgArena,
        req: MsgId,
        pool: &ServerPool,
        need_auth: &mut bool,
    ) -> Vec<u8> {
        let rsp = arena.get(false);
        let pools = std::slice::from_ref(pool);
        reply(arena, req, rsp, pool, pools, need_auth).unwrap();
        arena.msg(rsp).unwrap().chain.to_vec()
    }

    #[test]
    fn test_ping_gets_pong_without_backend() {
        let pool = pool(None);
        let mut arena = MsgArena::new(512);
        let req = parse_req(&mut arena, b"*1\r\n$4\r\nPING\r\n");
        let mut need_auth = false;

        assert_eq!(run_reply(&mut arena, req, &pool, &mut need_auth), REPL_PONG);
    }

    #[test]
    fn test_auth_with_no_password_configured() {
        let pool = pool(None);
        let mut arena = MsgArena::new(512);
        let req = parse_req(&mut arena, b"*2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n");
        let mut need_auth = false;

        assert_eq!(
            run_reply(&mut arena, req, &pool, &mut need_auth),
            AUTH_NO_PASSWORD
        );
        assert!(!need_auth);
    }

    #[test]
    fn test_auth_accepts_matching_password() {
        let pool = pool(Some("secret"));
        let mut arena = MsgArena::new(512);
        let req = parse_req(&mut arena, b"*2\r\n$4\r\nAUTH\r\n$6\r\nsecret\r\n");
        let mut need_auth = true;

        assert_eq!(run_reply(&mut arena, req, &pool, &mut need_auth), REPL_OK);
        assert!(!need_auth);
    }

    #[test]
    fn test_auth_rejects_wrong_password() {
        let pool = pool(Some("secret"));
        let mut arena = MsgArena::new(512);
        let req = parse_req(&mut arena, b"*2\r\n$4\r\nAUTH\r\n$5\r\nwrong\r\n");
        let mut need_auth = false;

        assert_eq!(
            run_reply(&mut arena, req, &pool, &mut need_auth),
            AUTH_INVALID_PASSWORD
        );
        assert!(need_auth);
    }

    #[test]
    fn test_unauthenticated_commands_are_gated() {
        let pool = pool(Some("secret"));
        let mut arena = MsgArena::new(512);
        let req = parse_req(&mut arena, b"*1\r\n$4\r\nPING\r\n");
        let mut need_auth = true;

        assert_eq!(
            run_reply(&mut arena, req, &pool, &mut need_auth),
            AUTH_REQUIRE_PASSWORD
        );
    }

    #[test]
    fn test_nodes_out_of_range_pool() {
        let pool = pool(None);
        let mut arena = MsgArena::new(512);
        let req = parse_req(&mut arena, b"*2\r\n$5\r\nNODES\r\n$1\r\n3\r\n");
        let mut need_auth = false;

        assert_eq!(
            run_reply(&mut arena, req, &pool, &mut need_auth),
            NODES_INVALID
        );
    }

    #[test]
    fn test_slots_out_of_range_pool() {
        let pool = pool(None);
        let mut arena = MsgArena::new(512);
        let req = parse_req(&mut arena, b"*2\r\n$5\r\nSLOTS\r\n$1\r\n9\r\n");
        let mut need_auth = false;

        assert_eq!(
            run_reply(&mut arena, req, &pool, &mut need_auth),
            SLOTS_INVALID
        );
    }

    #[test]
    fn test_slots_formats_multibulk_of_lines() {
        let pool = pool(None);
        let mut arena = MsgArena::new(512);
        let req = parse_req(&mut arena, b"*2\r\n$5\r\nSLOTS\r\n$1\r\n0\r\n");
        let mut need_auth = false;

        let out = run_reply(&mut arena, req, &pool, &mut need_auth);
        // An empty pool still renders the unassigned-slot transition line.
        assert!(out.starts_with(b"*1\r\n$"));
        assert!(out.windows(18).any(|w| w == b"owned by no server"));
    }

    #[test]
    fn test_req_size_limit_demotes() {
        let mut arena = MsgArena::new(512);
        let req = parse_req(&mut arena, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");

        check_req_size(&mut arena, req, 10);

        let msg = arena.msg(req).unwrap();
        assert_eq!(msg.mtype, MsgType::ReqTooLarge);
        assert!(msg.noforward);
    }

    #[test]
    fn test_rsp_size_limit_replaces_content() {
        let mut arena = MsgArena::new(512);
        let rsp = arena.get(false);
        arena
            .msg_mut(rsp)
            .unwrap()
            .chain
            .append(b"$100\r\nsomething very large...\r\n");

        check_rsp_size(&mut arena, rsp, 8);

        assert_eq!(arena.msg(rsp).unwrap().chain.to_vec(), EMSG_RSP_TOO_LARGE);
    }

    #[test]
    fn test_too_large_request_reply() {
        let pool = pool(None);
        let mut arena = MsgArena::new(512);
        let req = parse_req(&mut arena, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
        check_req_size(&mut arena, req, 4);
        let mut need_auth = false;

        assert_eq!(
            run_reply(&mut arena, req, &pool, &mut need_auth),
            EMSG_REQ_TOO_LARGE
        );
    }
}
