//! Message objects and their arena. Requests and responses share one
//! representation: a type tag, the buffer chain carrying the wire bytes,
//! parser bookkeeping, the key position list, and the fragment linkage.
//!
//! Cross-message relationships (request/response pairing, fragment
//! ownership) are ids into the arena rather than pointers, so the cyclic
//! ownership of the wire protocol maps onto plain owned data.

use crate::buf::Chain;
use crate::codec::req::ReqState;
use crate::codec::rsp::RspState;
use hashbrown::HashMap;
use keel::shared::ErrorType;

pub type MsgId = u64;

/// Connection slot in the endpoint, opaque to this module.
pub type ConnId = usize;

/// Byte positions of one key argument, as stream offsets into the owning
/// message's chain.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KeyPos {
    pub start: u64,
    pub end: u64,
}

/// Closed set of recognized message types: every supported request command
/// plus the response kinds, with the redirects promoted to their own tags.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MsgType {
    Unknown,

    // Requests.
    Append,
    Auth,
    Bitcount,
    Decr,
    Decrby,
    Del,
    Dump,
    Eval,
    Evalsha,
    Exists,
    Expire,
    Expireat,
    Get,
    Getbit,
    Getrange,
    Getset,
    Hdel,
    Hexists,
    Hget,
    Hgetall,
    Hincrby,
    Hincrbyfloat,
    Hkeys,
    Hlen,
    Hmget,
    Hmset,
    Hscan,
    Hset,
    Hsetnx,
    Hvals,
    Incr,
    Incrby,
    Incrbyfloat,
    Lindex,
    Linsert,
    Llen,
    Lpop,
    Lpush,
    Lpushx,
    Lrange,
    Lrem,
    Lset,
    Ltrim,
    Mget,
    Mset,
    Node,
    Nodes,
    Persist,
    Pexpire,
    Pexpireat,
    Pfadd,
    Pfcount,
    Pfmerge,
    Ping,
    Psetex,
    Pttl,
    Quit,
    Restore,
    Rpop,
    Rpoplpush,
    Rpush,
    Rpushx,
    Sadd,
    Scard,
    Sdiff,
    Sdiffstore,
    Select,
    Set,
    Setbit,
    Setex,
    Setnx,
    Setrange,
    Sinter,
    Sinterstore,
    Sismember,
    Slot,
    Slots,
    Smembers,
    Smove,
    Sort,
    Spop,
    Srandmember,
    Srem,
    Sscan,
    Strlen,
    Sunion,
    Sunionstore,
    Ttl,
    Type,
    Zadd,
    Zcard,
    Zcount,
    Zincrby,
    Zinterstore,
    Zlexcount,
    Zrange,
    Zrangebylex,
    Zrangebyscore,
    Zrank,
    Zrem,
    Zremrangebylex,
    Zremrangebyrank,
    Zremrangebyscore,
    Zrevrange,
    Zrevrangebyscore,
    Zrevrank,
    Zscan,
    Zscore,
    Zunionstore,

    /// Request demoted for exceeding the size limit.
    ReqTooLarge,

    // Responses.
    Status,
    Error,
    Integer,
    Bulk,
    Multibulk,
    Moved,
    Ask,
}

/// Semantic arity class of a request command, driving the parser's state
/// transitions after the command token.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Arity {
    /// No key, no args (`PING`).
    NoKey,
    /// One key, no further args (`GET`).
    Arg0,
    /// One key then exactly one arg (`EXPIRE`).
    Arg1,
    /// One key then exactly two args (`SETEX`).
    Arg2,
    /// One key then exactly three args (`LINSERT`).
    Arg3,
    /// One key then zero or more args (`SET`, `ZADD`).
    ArgN,
    /// One or more keys, nothing else (`MGET`, `DEL`).
    ArgX,
    /// Interleaved key/value pairs (`MSET`).
    ArgKvx,
    /// `EVAL`/`EVALSHA`: script, numkeys, keys, args.
    ArgEval,
}

impl MsgType {
    /// Classifies a command token, case-insensitively. Unknown commands stay
    /// unclassified and the parser rejects them.
    pub fn classify(token: &[u8]) -> MsgType {
        if token.len() > 16 {
            return MsgType::Unknown;
        }

        let mut lower = [0u8; 16];
        for (dst, src) in lower.iter_mut().zip(token) {
            *dst = src.to_ascii_lowercase();
        }

        match &lower[..token.len()] {
            b"get" => MsgType::Get,
            b"set" => MsgType::Set,
            b"ttl" => MsgType::Ttl,
            b"del" => MsgType::Del,

            b"pttl" => MsgType::Pttl,
            b"decr" => MsgType::Decr,
            b"dump" => MsgType::Dump,
            b"hdel" => MsgType::Hdel,
            b"hget" => MsgType::Hget,
            b"hlen" => MsgType::Hlen,
            b"hset" => MsgType::Hset,
            b"incr" => MsgType::Incr,
            b"llen" => MsgType::Llen,
            b"lpop" => MsgType::Lpop,
            b"lrem" => MsgType::Lrem,
            b"lset" => MsgType::Lset,
            b"rpop" => MsgType::Rpop,
            b"sadd" => MsgType::Sadd,
            b"spop" => MsgType::Spop,
            b"srem" => MsgType::Srem,
            b"type" => MsgType::Type,
            b"mget" => MsgType::Mget,
            b"mset" => MsgType::Mset,
            b"zadd" => MsgType::Zadd,
            b"zrem" => MsgType::Zrem,
            b"eval" => MsgType::Eval,
            b"sort" => MsgType::Sort,
            b"ping" => MsgType::Ping,
            b"quit" => MsgType::Quit,
            b"auth" => MsgType::Auth,
            b"node" => MsgType::Node,
            b"slot" => MsgType::Slot,

            b"hkeys" => MsgType::Hkeys,
            b"hmget" => MsgType::Hmget,
            b"hmset" => MsgType::Hmset,
            b"hvals" => MsgType::Hvals,
            b"hscan" => MsgType::Hscan,
            b"lpush" => MsgType::Lpush,
            b"ltrim" => MsgType::Ltrim,
            b"rpush" => MsgType::Rpush,
            b"scard" => MsgType::Scard,
            b"sdiff" => MsgType::Sdiff,
            b"setex" => MsgType::Setex,
            b"setnx" => MsgType::Setnx,
            b"smove" => MsgType::Smove,
            b"sscan" => MsgType::Sscan,
            b"zcard" => MsgType::Zcard,
            b"zrank" => MsgType::Zrank,
            b"zscan" => MsgType::Zscan,
            b"pfadd" => MsgType::Pfadd,
            b"nodes" => MsgType::Nodes,
            b"slots" => MsgType::Slots,

            b"append" => MsgType::Append,
            b"decrby" => MsgType::Decrby,
            b"exists" => MsgType::Exists,
            b"expire" => MsgType::Expire,
            b"getbit" => MsgType::Getbit,
            b"getset" => MsgType::Getset,
            b"psetex" => MsgType::Psetex,
            b"hsetnx" => MsgType::Hsetnx,
            b"incrby" => MsgType::Incrby,
            b"lindex" => MsgType::Lindex,
            b"lpushx" => MsgType::Lpushx,
            b"lrange" => MsgType::Lrange,
            b"rpushx" => MsgType::Rpushx,
            b"setbit" => MsgType::Setbit,
            b"sinter" => MsgType::Sinter,
            b"strlen" => MsgType::Strlen,
            b"sunion" => MsgType::Sunion,
            b"zcount" => MsgType::Zcount,
            b"zrange" => MsgType::Zrange,
            b"zscore" => MsgType::Zscore,

            b"persist" => MsgType::Persist,
            b"pexpire" => MsgType::Pexpire,
            b"hexists" => MsgType::Hexists,
            b"hgetall" => MsgType::Hgetall,
            b"hincrby" => MsgType::Hincrby,
            b"linsert" => MsgType::Linsert,
            b"zincrby" => MsgType::Zincrby,
            b"evalsha" => MsgType::Evalsha,
            b"restore" => MsgType::Restore,
            b"pfcount" => MsgType::Pfcount,
            b"pfmerge" => MsgType::Pfmerge,

            b"expireat" => MsgType::Expireat,
            b"bitcount" => MsgType::Bitcount,
            b"getrange" => MsgType::Getrange,
            b"setrange" => MsgType::Setrange,
            b"smembers" => MsgType::Smembers,
            b"zrevrank" => MsgType::Zrevrank,

            b"pexpireat" => MsgType::Pexpireat,
            b"rpoplpush" => MsgType::Rpoplpush,
            b"sismember" => MsgType::Sismember,
            b"zrevrange" => MsgType::Zrevrange,
            b"zlexcount" => MsgType::Zlexcount,

            b"sdiffstore" => MsgType::Sdiffstore,

            b"incrbyfloat" => MsgType::Incrbyfloat,
            b"sinterstore" => MsgType::Sinterstore,
            b"srandmember" => MsgType::Srandmember,
            b"sunionstore" => MsgType::Sunionstore,
            b"zinterstore" => MsgType::Zinterstore,
            b"zunionstore" => MsgType::Zunionstore,
            b"zrangebylex" => MsgType::Zrangebylex,

            b"hincrbyfloat" => MsgType::Hincrbyfloat,

            b"zrangebyscore" => MsgType::Zrangebyscore,

            b"zremrangebylex" => MsgType::Zremrangebylex,

            b"zremrangebyrank" => MsgType::Zremrangebyrank,

            b"zremrangebyscore" => MsgType::Zremrangebyscore,
            b"zrevrangebyscore" => MsgType::Zrevrangebyscore,

            _ => MsgType::Unknown,
        }
    }

    /// Arity class for a request type. Response types have no arity.
    pub fn arity(self) -> Option<Arity> {
        use MsgType::*;

        let arity = match self {
            Ping | Quit | Node | Slot => Arity::NoKey,

            Exists | Persist | Pttl | Ttl | Type | Dump | Decr | Get | Incr | Strlen
            | Hgetall | Hkeys | Hlen | Hvals | Llen | Lpop | Rpop | Scard | Smembers | Spop
            | Zcard | Pfcount | Auth | Nodes | Slots => Arity::Arg0,

            Expire | Expireat | Pexpire | Pexpireat | Append | Decrby | Getbit | Getset
            | Incrby | Incrbyfloat | Setnx | Hexists | Hget | Lindex | Lpushx | Rpoplpush
            | Rpushx | Sismember | Zrank | Zrevrank | Zscore => Arity::Arg1,

            Getrange | Psetex | Setbit | Setex | Setrange | Hincrby | Hincrbyfloat | Hset
            | Hsetnx | Lrange | Lrem | Lset | Ltrim | Smove | Zcount | Zlexcount | Zincrby
            | Zremrangebylex | Zremrangebyrank | Zremrangebyscore | Restore => Arity::Arg2,

            Linsert => Arity::Arg3,

            Sort | Bitcount | Set | Hdel | Hmget | Hmset | Hscan | Lpush | Rpush | Sadd
            | Sdiff | Sdiffstore | Sinter | Sinterstore | Srem | Sunion | Sunionstore
            | Srandmember | Sscan | Pfadd | Pfmerge | Zadd | Zinterstore | Zrange
            | Zrangebyscore | Zrem | Zrevrange | Zrangebylex | Zrevrangebyscore
            | Zunionstore | Zscan => Arity::ArgN,

            Mget | Del => Arity::ArgX,

            Mset => Arity::ArgKvx,

            Eval | Evalsha => Arity::ArgEval,

            _ => return None,
        };

        Some(arity)
    }

    /// Commands answered by the proxy itself, marked noforward at
    /// classification time.
    #[inline]
    pub fn is_internal(self) -> bool {
        matches!(
            self,
            MsgType::Ping
                | MsgType::Auth
                | MsgType::Node
                | MsgType::Nodes
                | MsgType::Slot
                | MsgType::Slots
        )
    }

    /// Commands that mutate the keyspace route to the slot master; the rest
    /// may be served by any tagged replica.
    pub fn is_write(self) -> bool {
        use MsgType::*;

        matches!(
            self,
            Set | Setnx
                | Setex
                | Psetex
                | Del
                | Mset
                | Append
                | Decr
                | Decrby
                | Incr
                | Incrby
                | Incrbyfloat
                | Getset
                | Setbit
                | Setrange
                | Expire
                | Expireat
                | Pexpire
                | Pexpireat
                | Persist
                | Hdel
                | Hset
                | Hsetnx
                | Hmset
                | Hincrby
                | Hincrbyfloat
                | Linsert
                | Lpop
                | Lpush
                | Lpushx
                | Lrem
                | Lset
                | Ltrim
                | Rpop
                | Rpoplpush
                | Rpush
                | Rpushx
                | Sadd
                | Sdiffstore
                | Sinterstore
                | Smove
                | Spop
                | Srem
                | Sunionstore
                | Zadd
                | Zincrby
                | Zrem
                | Zremrangebylex
                | Zremrangebyrank
                | Zremrangebyscore
                | Zinterstore
                | Zunionstore
                | Pfadd
                | Pfmerge
                | Restore
                | Sort
                | Eval
                | Evalsha
        )
    }

    #[inline]
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MsgType::Status
                | MsgType::Error
                | MsgType::Integer
                | MsgType::Bulk
                | MsgType::Multibulk
                | MsgType::Moved
                | MsgType::Ask
        )
    }
}

/// Parser bookkeeping: the suspended state of whichever FSM owns the
/// message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ParseState {
    Req(ReqState),
    Rsp(RspState),
}

pub struct Msg {
    pub id: MsgId,
    pub request: bool,
    pub mtype: MsgType,
    pub chain: Chain,

    // Parser bookkeeping. `pos` and `token` are stream offsets.
    pub state: ParseState,
    pub pos: u64,
    pub token: Option<u64>,
    pub rlen: u64,
    pub rnarg: u64,
    pub narg: u64,
    pub narg_start: u64,
    pub narg_end: u64,

    pub keys: Vec<KeyPos>,

    /// Integer reply accumulator; also sums DEL fragment replies and holds
    /// the slot number of a redirect.
    pub integer: u64,

    /// `host:port` literal of a `-MOVED`/`-ASK` reply.
    pub redirect_addr: Option<(u64, u64)>,

    // Fragment linkage.
    pub frag_id: u64,
    pub nfrag: u32,
    pub nfrag_done: u32,
    pub frag_owner: Option<MsgId>,
    pub frag_seq: Vec<MsgId>,

    pub peer: Option<MsgId>,
    pub owner: Option<ConnId>,

    pub noforward: bool,
    pub quit: bool,
    pub noreply: bool,
    pub swallow: bool,
    pub ferror: bool,
    /// Response is complete and may be delivered in queue order.
    pub done: bool,
    pub error: Option<ErrorType>,
}

impl Msg {
    fn new(id: MsgId, request: bool, chunk_size: usize) -> Msg {
        Msg {
            id,
            request,
            mtype: MsgType::Unknown,
            chain: Chain::with_chunk_size(chunk_size),
            state: if request {
                ParseState::Req(ReqState::Start)
            } else {
                ParseState::Rsp(RspState::Start)
            },
            pos: 0,
            token: None,
            rlen: 0,
            rnarg: 0,
            narg: 0,
            narg_start: 0,
            narg_end: 0,
            keys: Vec::new(),
            integer: 0,
            redirect_addr: None,
            frag_id: 0,
            nfrag: 0,
            nfrag_done: 0,
            frag_owner: None,
            frag_seq: Vec::new(),
            peer: None,
            owner: None,
            noforward: false,
            quit: false,
            noreply: false,
            swallow: false,
            ferror: false,
            done: false,
            error: None,
        }
    }

    /// Total byte length of the message.
    #[inline]
    pub fn mlen(&self) -> u64 {
        self.chain.len()
    }

    /// Bytes of key argument `i`.
    #[inline]
    pub fn key_bytes(&self, i: usize) -> Vec<u8> {
        let kpos = self.keys[i];
        self.chain.copy_range(kpos.start, kpos.end)
    }

    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.frag_id != 0
    }

    #[inline]
    pub fn mark_error(&mut self, kind: ErrorType) {
        self.error = Some(kind);
    }
}

/// Every live message in the proxy, keyed by id. This is the message pool
/// of the original collapsed into one owner; peer and fragment links are
/// ids into this table.
pub struct MsgArena {
    msgs: HashMap<MsgId, Msg>,
    chunk_size: usize,
    next_id: MsgId,
    next_frag_id: u64,
}

impl MsgArena {
    #[inline]
    pub fn new(chunk_size: usize) -> MsgArena {
        MsgArena {
            msgs: HashMap::new(),
            chunk_size,
            // Id 0 is reserved so frag_id == 0 can mean "not a fragment".
            next_id: 1,
            next_frag_id: 1,
        }
    }

    /// Allocates a fresh message and returns its id.
    pub fn get(&mut self, request: bool) -> MsgId {
        let id = self.next_id;
        self.next_id += 1;
        self.msgs.insert(id, Msg::new(id, request, self.chunk_size));
        id
    }

    /// Releases a message. Every id handed out by `get` must come back here
    /// exactly once.
    pub fn put(&mut self, id: MsgId) -> Option<Msg> {
        self.msgs.remove(&id)
    }

    #[inline]
    pub fn msg(&self, id: MsgId) -> Option<&Msg> {
        self.msgs.get(&id)
    }

    #[inline]
    pub fn msg_mut(&mut self, id: MsgId) -> Option<&mut Msg> {
        self.msgs.get_mut(&id)
    }

    /// Borrows two distinct messages mutably at once, for peer and fragment
    /// bookkeeping.
    #[inline]
    pub fn pair_mut(&mut self, a: MsgId, b: MsgId) -> Option<[&mut Msg; 2]> {
        self.msgs.get_many_mut([&a, &b])
    }

    #[inline]
    pub fn next_frag_id(&mut self) -> u64 {
        let id = self.next_frag_id;
        self.next_frag_id += 1;
        id
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_case_insensitive() {
        assert_eq!(MsgType::classify(b"GET"), MsgType::Get);
        assert_eq!(MsgType::classify(b"mGeT"), MsgType::Mget);
        assert_eq!(MsgType::classify(b"zrevrangebyscore"), MsgType::Zrevrangebyscore);
        assert_eq!(MsgType::classify(b"flushall"), MsgType::Unknown);
        assert_eq!(MsgType::classify(b"averyverylongcommandname"), MsgType::Unknown);
    }

    #[test]
    fn test_arity_groups() {
        assert_eq!(MsgType::Ping.arity(), Some(Arity::NoKey));
        assert_eq!(MsgType::Get.arity(), Some(Arity::Arg0));
        assert_eq!(MsgType::Expire.arity(), Some(Arity::Arg1));
        assert_eq!(MsgType::Setex.arity(), Some(Arity::Arg2));
        assert_eq!(MsgType::Linsert.arity(), Some(Arity::Arg3));
        assert_eq!(MsgType::Set.arity(), Some(Arity::ArgN));
        assert_eq!(MsgType::Mget.arity(), Some(Arity::ArgX));
        assert_eq!(MsgType::Mset.arity(), Some(Arity::ArgKvx));
        assert_eq!(MsgType::Evalsha.arity(), Some(Arity::ArgEval));
        assert_eq!(MsgType::Status.arity(), None);
    }

    #[test]
    fn test_internal_and_write_flags() {
        assert!(MsgType::Ping.is_internal());
        assert!(MsgType::Slots.is_internal());
        assert!(!MsgType::Get.is_internal());

        assert!(MsgType::Set.is_write());
        assert!(MsgType::Del.is_write());
        assert!(!MsgType::Get.is_write());
        assert!(!MsgType::Mget.is_write());
    }

    #[test]
    fn test_arena_lifecycle() {
        let mut arena = MsgArena::new(512);

        let req = arena.get(true);
        let rsp = arena.get(false);
        assert_ne!(req, rsp);
        assert_eq!(arena.len(), 2);

        let [a, b] = arena.pair_mut(req, rsp).unwrap();
        a.peer = Some(b.id);
        b.peer = Some(a.id);

        assert!(arena.put(req).is_some());
        assert!(arena.put(req).is_none());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_frag_ids_start_nonzero() {
        let mut arena = MsgArena::new(512);
        assert_eq!(arena.next_frag_id(), 1);
        assert_eq!(arena.next_frag_id(), 2);
    }
}
