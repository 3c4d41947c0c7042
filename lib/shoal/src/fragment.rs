//! Fragmentation of the vector commands (`MGET`, `DEL`, `MSET`) across
//! cluster slots, and the pre-/post-coalesce passes that reassemble one
//! reply for the client.
//!
//! All fragments of a request share a `frag_id` and point at the original
//! via `frag_owner`; the original's `frag_seq[i]` names the fragment
//! handling key `i`, which is what lets the coalesced multibulk come back
//! in the client's key order no matter how replies interleave.

use crate::buf::Chain;
use crate::msg::{MsgArena, MsgId, MsgType};
use hashbrown::HashMap;
use keel::shared::{ErrorType, NetError, NetResult};

/// Copies one bulk (`$<len>\r\n<bytes>\r\n` or `$-1\r\n`) from the head of
/// `src` into `dst`, stealing whole chunks where possible. With no
/// destination the bulk is just eaten.
pub fn copy_bulk(dst: Option<&mut Chain>, src: &mut Chain) -> NetResult<()> {
    src.prune_empty_head();

    let head = src.head_readable();
    if head.is_empty() {
        return Err(NetError::Fatal(ErrorType::BadFragment));
    }

    // A fragment reply may itself be an error (e.g. -CROSSSLOT); that is
    // fatal for the coalesce.
    if head[0] == b'-' {
        return Err(NetError::Fatal(ErrorType::BadFragment));
    }
    if head[0] != b'$' {
        return Err(NetError::Fatal(ErrorType::BadFragment));
    }

    let len = if head.len() >= 3 && head[1] == b'-' && head[2] == b'1' {
        // Null bulk, '$-1\r\n'.
        5u64
    } else {
        let mut digits = 0u64;
        let mut ndigits = 0u64;
        for &ch in &head[1..] {
            if !ch.is_ascii_digit() {
                break;
            }
            digits = digits * 10 + u64::from(ch - b'0');
            ndigits += 1;
        }
        if ndigits == 0 {
            return Err(NetError::Fatal(ErrorType::BadFragment));
        }
        // '$' + digits + CRLF + payload + CRLF.
        1 + ndigits + 2 + digits + 2
    };

    match dst {
        Some(dst) => dst.transfer_from(src, len),
        None => src.discard(len),
    }
}

/// Splits a vector request into per-slot sub-requests, grouping keys with
/// the pool-configured slot hash. Non-vector requests come back untouched
/// with no fragments.
pub fn fragment(
    arena: &mut MsgArena,
    req_id: MsgId,
    hash: fn(&[u8]) -> u16,
) -> NetResult<Vec<MsgId>> {
    let (mtype, key_step) = {
        let req = arena.msg(req_id).expect("fragmenting a live message");
        match req.mtype {
            MsgType::Mget | MsgType::Del => (req.mtype, 1usize),
            MsgType::Mset => (req.mtype, 2usize),
            _ => return Ok(Vec::new()),
        }
    };

    // Snapshot the key bytes before the chain is disturbed.
    let (keys, owner_conn): (Vec<Vec<u8>>, _) = {
        let req = arena.msg(req_id).unwrap();
        debug_assert_eq!(req.keys.len() as u64, (req.narg - 1) / key_step as u64);
        (
            (0..req.keys.len()).map(|i| req.key_bytes(i)).collect(),
            req.owner,
        )
    };

    // Eat the '*narg\r\n$k\r\nCMD\r\n' preamble; it always sits in one
    // contiguous chunk.
    {
        let req = arena.msg_mut(req_id).unwrap();
        req.chain.rewind_read();
        for _ in 0..3 {
            loop {
                let byte = req
                    .chain
                    .first_byte()
                    .ok_or(NetError::Fatal(ErrorType::Protocol))?;
                req.chain.consume(1);
                if byte == b'\n' {
                    break;
                }
            }
        }
    }

    let mut sub_by_slot: HashMap<u16, MsgId> = HashMap::new();
    let mut order: Vec<MsgId> = Vec::new();
    let mut frag_seq: Vec<MsgId> = Vec::with_capacity(keys.len());

    for key in &keys {
        let slot = hash(key);

        let sub_id = *sub_by_slot.entry(slot).or_insert_with(|| {
            let id = arena.get(true);
            order.push(id);
            id
        });
        frag_seq.push(sub_id);

        {
            let sub = arena.msg_mut(sub_id).unwrap();
            sub.owner = owner_conn;
            sub.narg += 1;
            append_key(&mut sub.chain, key);
            let end = sub.chain.write_offset() - 2;
            sub.keys.push(crate::msg::KeyPos {
                start: end - key.len() as u64,
                end,
            });
        }

        if key_step == 2 {
            // MSET: eat the key bulk off the original, move the value bulk
            // into the fragment.
            let [req, sub] = arena
                .pair_mut(req_id, sub_id)
                .expect("request and fragment are distinct");
            copy_bulk(None, &mut req.chain)?;
            copy_bulk(Some(&mut sub.chain), &mut req.chain)?;
            sub.narg += 1;
        }
    }

    let frag_id = arena.next_frag_id();

    for &sub_id in &order {
        let sub = arena.msg_mut(sub_id).unwrap();
        let header = match mtype {
            MsgType::Mget => format!("*{}\r\n$4\r\nmget\r\n", sub.narg + 1),
            MsgType::Del => format!("*{}\r\n$3\r\ndel\r\n", sub.narg + 1),
            MsgType::Mset => format!("*{}\r\n$4\r\nmset\r\n", sub.narg + 1),
            _ => unreachable!("vector types checked above"),
        };
        sub.chain.prepend(header.as_bytes());
        sub.mtype = mtype;
        sub.frag_id = frag_id;
        sub.frag_owner = Some(req_id);
    }

    let req = arena.msg_mut(req_id).unwrap();
    req.frag_id = frag_id;
    req.frag_owner = Some(req_id);
    req.nfrag = order.len() as u32;
    req.nfrag_done = 0;
    req.frag_seq = frag_seq;

    Ok(order)
}

fn append_key(chain: &mut Chain, key: &[u8]) {
    chain.append(format!("${}\r\n", key.len()).as_bytes());
    chain.append(key);
    chain.append(b"\r\n");
}

/// Runs on each reply to a fragment as it arrives: folds the piece into the
/// owner and strips reply framing that post-coalesce will re-synthesize.
pub fn pre_coalesce(arena: &mut MsgArena, rsp_id: MsgId) {
    let (rsp_type, rsp_integer, narg_span) = {
        let rsp = arena.msg(rsp_id).expect("coalescing a live response");
        debug_assert!(!rsp.request);
        (
            rsp.mtype,
            rsp.integer,
            (rsp.narg_start, rsp.narg_end),
        )
    };

    let (owner_id, frag_type) = {
        let rsp = arena.msg(rsp_id).unwrap();
        let frag = arena
            .msg(rsp.peer.expect("fragment reply is paired"))
            .expect("paired fragment is live");
        if frag.frag_id == 0 {
            return;
        }
        (frag.frag_owner.expect("fragment has an owner"), frag.mtype)
    };

    {
        let owner = arena.msg_mut(owner_id).expect("fragment owner is live");
        owner.nfrag_done += 1;
    }

    match rsp_type {
        MsgType::Integer => {
            // Only DEL fragments come back as integers.
            debug_assert_eq!(frag_type, MsgType::Del);
            let owner = arena.msg_mut(owner_id).unwrap();
            owner.integer += rsp_integer;
            arena.msg_mut(rsp_id).unwrap().chain.clear();
        }

        MsgType::Multibulk => {
            // Only MGET fragments come back as multibulks. Excise the
            // leading '*N\r\n'; post-coalesce writes the combined one.
            debug_assert_eq!(frag_type, MsgType::Mget);
            let rsp = arena.msg_mut(rsp_id).unwrap();
            let (narg_start, narg_end) = narg_span;
            let excise = narg_end + 2 - narg_start;
            rsp.chain.consume(excise);
        }

        MsgType::Status => {
            if frag_type == MsgType::Mset {
                arena.msg_mut(rsp_id).unwrap().chain.clear();
            }
        }

        _ => {
            // Anything else on a fragment poisons the owner.
            let owner = arena.msg_mut(owner_id).unwrap();
            owner.mark_error(ErrorType::Protocol);
        }
    }
}

/// Runs once every fragment has reported in; builds the combined reply into
/// the owner's paired response. An unrecoverable gap (a fragment without a
/// reply) is surfaced as an error so the caller closes the client
/// connection.
pub fn post_coalesce(arena: &mut MsgArena, owner_id: MsgId) -> NetResult<()> {
    let (mtype, errored, integer, narg, nkeys, rsp_id) = {
        let owner = arena.msg(owner_id).expect("coalescing a live owner");
        debug_assert_eq!(owner.frag_owner, Some(owner_id));
        (
            owner.mtype,
            owner.error.is_some() || owner.ferror,
            owner.integer,
            owner.narg,
            owner.frag_seq.len(),
            owner.peer.expect("owner has a paired response"),
        )
    };

    if errored {
        return Ok(());
    }

    match mtype {
        MsgType::Del => {
            let rsp = arena.msg_mut(rsp_id).unwrap();
            rsp.chain.prepend(format!(":{}\r\n", integer).as_bytes());
        }

        MsgType::Mset => {
            let rsp = arena.msg_mut(rsp_id).unwrap();
            rsp.chain.append(b"+OK\r\n");
        }

        MsgType::Mget => {
            {
                let rsp = arena.msg_mut(rsp_id).unwrap();
                rsp.chain.prepend(format!("*{}\r\n", narg - 1).as_bytes());
            }

            for i in 0..nkeys {
                let frag_id = arena.msg(owner_id).unwrap().frag_seq[i];
                let sub_rsp_id = arena
                    .msg(frag_id)
                    .and_then(|frag| frag.peer)
                    .ok_or(NetError::Fatal(ErrorType::BadFragment))?;

                let [rsp, sub_rsp] = arena
                    .pair_mut(rsp_id, sub_rsp_id)
                    .ok_or(NetError::Fatal(ErrorType::BadFragment))?;
                copy_bulk(Some(&mut rsp.chain), &mut sub_rsp.chain)?;
            }
        }

        _ => unreachable!("post-coalesce on a non-vector request"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, ParseResult};
    use crate::msg::MsgArena;
    use keel::hashing::key_slot;

    fn parse_req(arena: &mut MsgArena, bytes: &[u8]) -> MsgId {
        let id = arena.get(true);
        let msg = arena.msg_mut(id).unwrap();
        msg.chain.append(bytes);
        assert_eq!(codec::parse(msg), ParseResult::Ok);
        id
    }

    fn parse_rsp(arena: &mut MsgArena, bytes: &[u8]) -> MsgId {
        let id = arena.get(false);
        let msg = arena.msg_mut(id).unwrap();
        msg.chain.append(bytes);
        assert_eq!(codec::parse(msg), ParseResult::Ok);
        id
    }

    /// Pairs a parsed reply with fragment `frag` and runs pre-coalesce.
    fn deliver(arena: &mut MsgArena, frag: MsgId, reply: &[u8]) {
        let rsp = parse_rsp(arena, reply);
        let [f, r] = arena.pair_mut(frag, rsp).unwrap();
        f.peer = Some(r.id);
        r.peer = Some(f.id);
        pre_coalesce(arena, rsp);
    }

    /// Attaches an empty response to the owner for post-coalesce to fill.
    fn attach_response(arena: &mut MsgArena, owner: MsgId) -> MsgId {
        let rsp = arena.get(false);
        let [o, r] = arena.pair_mut(owner, rsp).unwrap();
        o.peer = Some(r.id);
        r.peer = Some(o.id);
        rsp
    }

    #[test]
    fn test_non_vector_request_is_left_alone() {
        let mut arena = MsgArena::new(512);
        let req = parse_req(&mut arena, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");

        let frags = fragment(&mut arena, req, key_slot).unwrap();

        assert!(frags.is_empty());
        assert_eq!(arena.msg(req).unwrap().frag_id, 0);
    }

    #[test]
    fn test_mget_groups_keys_by_slot() {
        let mut arena = MsgArena::new(512);
        // {a}a and {a}c share a slot; {b}b hashes elsewhere.
        let req = parse_req(
            &mut arena,
            b"*4\r\n$4\r\nMGET\r\n$4\r\n{a}a\r\n$4\r\n{b}b\r\n$4\r\n{a}c\r\n",
        );

        let frags = fragment(&mut arena, req, key_slot).unwrap();
        assert_eq!(frags.len(), 2);

        let owner = arena.msg(req).unwrap();
        assert_eq!(owner.nfrag, 2);
        assert_eq!(owner.frag_seq.len(), 3);
        assert_eq!(owner.frag_seq[0], owner.frag_seq[2]);
        assert_ne!(owner.frag_seq[0], owner.frag_seq[1]);

        // Sub-requests carry the lowercase command and their keys in client
        // order.
        let first = arena.msg(frags[0]).unwrap();
        assert_eq!(
            first.chain.to_vec(),
            b"*3\r\n$4\r\nmget\r\n$4\r\n{a}a\r\n$4\r\n{a}c\r\n"
        );
        assert_eq!(first.mtype, MsgType::Mget);
        assert_eq!(first.frag_id, owner.frag_id);

        let second = arena.msg(frags[1]).unwrap();
        assert_eq!(second.chain.to_vec(), b"*2\r\n$4\r\nmget\r\n$4\r\n{b}b\r\n");
    }

    #[test]
    fn test_single_slot_mget_still_fragments_once() {
        let mut arena = MsgArena::new(512);
        let req = parse_req(&mut arena, b"*2\r\n$4\r\nMGET\r\n$3\r\nfoo\r\n");

        let frags = fragment(&mut arena, req, key_slot).unwrap();

        assert_eq!(frags.len(), 1);
        assert_eq!(
            arena.msg(frags[0]).unwrap().chain.to_vec(),
            b"*2\r\n$4\r\nmget\r\n$3\r\nfoo\r\n"
        );
    }

    #[test]
    fn test_mset_moves_values_into_fragments() {
        let mut arena = MsgArena::new(512);
        let req = parse_req(
            &mut arena,
            b"*5\r\n$4\r\nMSET\r\n$4\r\n{a}a\r\n$2\r\nv1\r\n$4\r\n{b}b\r\n$2\r\nv2\r\n",
        );

        let frags = fragment(&mut arena, req, key_slot).unwrap();
        assert_eq!(frags.len(), 2);

        assert_eq!(
            arena.msg(frags[0]).unwrap().chain.to_vec(),
            b"*3\r\n$4\r\nmset\r\n$4\r\n{a}a\r\n$2\r\nv1\r\n"
        );
        assert_eq!(
            arena.msg(frags[1]).unwrap().chain.to_vec(),
            b"*3\r\n$4\r\nmset\r\n$4\r\n{b}b\r\n$2\r\nv2\r\n"
        );
    }

    #[test]
    fn test_mget_coalesce_restores_client_order() {
        let mut arena = MsgArena::new(512);
        let req = parse_req(
            &mut arena,
            b"*4\r\n$4\r\nMGET\r\n$4\r\n{a}a\r\n$4\r\n{b}b\r\n$4\r\n{a}c\r\n",
        );

        let frags = fragment(&mut arena, req, key_slot).unwrap();
        assert_eq!(frags.len(), 2);

        // Shard replies arrive out of order: the {b}b fragment first.
        deliver(&mut arena, frags[1], b"*1\r\n$1\r\nB\r\n");
        deliver(&mut arena, frags[0], b"*2\r\n$1\r\nA\r\n$1\r\nC\r\n");

        let owner = arena.msg(req).unwrap();
        assert_eq!(owner.nfrag_done, owner.nfrag);
        assert!(owner.error.is_none());

        let rsp = attach_response(&mut arena, req);
        post_coalesce(&mut arena, req).unwrap();

        assert_eq!(
            arena.msg(rsp).unwrap().chain.to_vec(),
            b"*3\r\n$1\r\nA\r\n$1\r\nB\r\n$1\r\nC\r\n"
        );
        assert_eq!(arena.msg(req).unwrap().integer, 0);
    }

    #[test]
    fn test_mget_coalesce_with_null_and_empty_replies() {
        let mut arena = MsgArena::new(512);
        let req = parse_req(
            &mut arena,
            b"*3\r\n$4\r\nMGET\r\n$4\r\n{a}a\r\n$4\r\n{b}b\r\n",
        );

        let frags = fragment(&mut arena, req, key_slot).unwrap();
        deliver(&mut arena, frags[0], b"*1\r\n$-1\r\n");
        deliver(&mut arena, frags[1], b"*1\r\n$2\r\nbv\r\n");

        let rsp = attach_response(&mut arena, req);
        post_coalesce(&mut arena, req).unwrap();

        assert_eq!(
            arena.msg(rsp).unwrap().chain.to_vec(),
            b"*2\r\n$-1\r\n$2\r\nbv\r\n"
        );
    }

    #[test]
    fn test_pre_coalesce_excises_empty_multibulk() {
        let mut arena = MsgArena::new(512);
        let req = parse_req(&mut arena, b"*2\r\n$4\r\nMGET\r\n$3\r\nfoo\r\n");
        let frags = fragment(&mut arena, req, key_slot).unwrap();

        // A shard may answer a fragment with '*0\r\n'; the excision must
        // remove exactly those four bytes.
        deliver(&mut arena, frags[0], b"*0\r\n");

        let rsp_id = arena.msg(frags[0]).unwrap().peer.unwrap();
        assert_eq!(arena.msg(rsp_id).unwrap().chain.len(), 0);
    }

    #[test]
    fn test_del_coalesce_sums_integers() {
        let mut arena = MsgArena::new(512);
        let req = parse_req(
            &mut arena,
            b"*3\r\n$3\r\nDEL\r\n$4\r\n{a}a\r\n$4\r\n{b}b\r\n",
        );

        let frags = fragment(&mut arena, req, key_slot).unwrap();
        assert_eq!(frags.len(), 2);
        deliver(&mut arena, frags[0], b":2\r\n");
        deliver(&mut arena, frags[1], b":1\r\n");

        let rsp = attach_response(&mut arena, req);
        post_coalesce(&mut arena, req).unwrap();

        assert_eq!(arena.msg(rsp).unwrap().chain.to_vec(), b":3\r\n");
    }

    #[test]
    fn test_mset_coalesce_answers_ok() {
        let mut arena = MsgArena::new(512);
        let req = parse_req(
            &mut arena,
            b"*5\r\n$4\r\nMSET\r\n$4\r\n{a}a\r\n$2\r\nv1\r\n$4\r\n{b}b\r\n$2\r\nv2\r\n",
        );

        let frags = fragment(&mut arena, req, key_slot).unwrap();
        deliver(&mut arena, frags[0], b"+OK\r\n");
        deliver(&mut arena, frags[1], b"+OK\r\n");

        let rsp = attach_response(&mut arena, req);
        post_coalesce(&mut arena, req).unwrap();

        assert_eq!(arena.msg(rsp).unwrap().chain.to_vec(), b"+OK\r\n");
    }

    #[test]
    fn test_reply_permutations_coalesce_identically() {
        let replies: [&[u8]; 2] = [b"*2\r\n$1\r\nA\r\n$1\r\nC\r\n", b"*1\r\n$1\r\nB\r\n"];

        let mut outputs = Vec::new();
        for order in [[0usize, 1], [1, 0]] {
            let mut arena = MsgArena::new(512);
            let req = parse_req(
                &mut arena,
                b"*4\r\n$4\r\nMGET\r\n$4\r\n{a}a\r\n$4\r\n{b}b\r\n$4\r\n{a}c\r\n",
            );
            let frags = fragment(&mut arena, req, key_slot).unwrap();

            for &i in &order {
                deliver(&mut arena, frags[i], replies[i]);
            }

            let rsp = attach_response(&mut arena, req);
            post_coalesce(&mut arena, req).unwrap();
            outputs.push(arena.msg(rsp).unwrap().chain.to_vec());
        }

        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[0], b"*3\r\n$1\r\nA\r\n$1\r\nB\r\n$1\r\nC\r\n");
    }

    #[test]
    fn test_wrong_reply_type_poisons_owner() {
        let mut arena = MsgArena::new(512);
        let req = parse_req(&mut arena, b"*2\r\n$3\r\nDEL\r\n$3\r\nfoo\r\n");
        let frags = fragment(&mut arena, req, key_slot).unwrap();

        deliver(&mut arena, frags[0], b"$3\r\nbar\r\n");

        let owner = arena.msg(req).unwrap();
        assert_eq!(owner.error, Some(ErrorType::Protocol));
        assert_eq!(owner.nfrag_done, 1);
    }

    #[test]
    fn test_copy_bulk_rejects_error_reply() {
        let mut src = Chain::with_chunk_size(512);
        src.append(b"-CROSSSLOT something\r\n");

        let mut dst = Chain::with_chunk_size(512);
        assert!(copy_bulk(Some(&mut dst), &mut src).is_err());
    }
}
