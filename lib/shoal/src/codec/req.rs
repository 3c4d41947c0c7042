//! Request parser: a restartable FSM over the unified request form
//!
//! ```text
//! *<N>\r\n ( $<len>\r\n <bytes>\r\n ){N}
//! ```
//!
//! Inline and legacy bulk commands are not accepted. The parser walks the
//! tail chunk of the message's chain from the suspended cursor; all cursor
//! and token values are stream offsets, so a repair relocation does not
//! disturb them.

use super::{ParseResult, CR, LF, MAX_BULK_LEN, MAX_NARG};
use crate::msg::{Arity, KeyPos, Msg, MsgType, ParseState};
use keel::shared::ErrorType;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReqState {
    Start,
    Narg,
    NargLf,
    ReqTypeLen,
    ReqTypeLenLf,
    ReqType,
    ReqTypeLf,
    KeyLen,
    KeyLenLf,
    Key,
    KeyLf,
    Arg1Len,
    Arg1LenLf,
    Arg1,
    Arg1Lf,
    Arg2Len,
    Arg2LenLf,
    Arg2,
    Arg2Lf,
    Arg3Len,
    Arg3LenLf,
    Arg3,
    Arg3Lf,
    ArgNLen,
    ArgNLenLf,
    ArgN,
    ArgNLf,
}

macro_rules! fail {
    ($msg:expr, $state:expr) => {{
        $msg.state = ParseState::Req($state);
        return ParseResult::Error(ErrorType::Protocol);
    }};
}

pub fn parse(msg: &mut Msg) -> ParseResult {
    let mut state = match msg.state {
        ParseState::Req(state) => state,
        ParseState::Rsp(_) => panic!("response parse state on a request message"),
    };

    let chunk = match msg.chain.tail() {
        Some(chunk) => chunk,
        None => return ParseResult::Again,
    };

    let base = chunk.base();
    let data = chunk.filled();
    let end = data.len();
    let full = chunk.is_full();
    let key_limit = msg.chain.chunk_size() as u64;

    debug_assert!(msg.pos >= base && msg.pos <= base + end as u64);
    let mut p = (msg.pos - base) as usize;

    while p < end {
        let ch = data[p];

        match state {
            ReqState::Start | ReqState::Narg => {
                match msg.token {
                    None => {
                        if ch != b'*' {
                            fail!(msg, state);
                        }
                        msg.token = Some(base + p as u64);
                        msg.narg_start = base + p as u64;
                        msg.rnarg = 0;
                        state = ReqState::Narg;
                    }
                    Some(_) if ch.is_ascii_digit() => {
                        msg.rnarg = msg.rnarg * 10 + u64::from(ch - b'0');
                        if msg.rnarg > MAX_NARG {
                            fail!(msg, state);
                        }
                    }
                    Some(_) if ch == CR => {
                        if msg.rnarg == 0 {
                            fail!(msg, state);
                        }
                        msg.narg = msg.rnarg;
                        msg.narg_end = base + p as u64;
                        msg.token = None;
                        state = ReqState::NargLf;
                    }
                    Some(_) => fail!(msg, state),
                }
            }

            ReqState::NargLf => {
                if ch != LF {
                    fail!(msg, state);
                }
                state = ReqState::ReqTypeLen;
            }

            ReqState::ReqTypeLen => {
                match msg.token {
                    None => {
                        if ch != b'$' {
                            fail!(msg, state);
                        }
                        msg.token = Some(base + p as u64);
                        msg.rlen = 0;
                    }
                    Some(_) if ch.is_ascii_digit() => {
                        msg.rlen = msg.rlen * 10 + u64::from(ch - b'0');
                        if msg.rlen > MAX_BULK_LEN {
                            fail!(msg, state);
                        }
                    }
                    Some(_) if ch == CR => {
                        if msg.rlen == 0 || msg.rnarg == 0 {
                            fail!(msg, state);
                        }
                        msg.rnarg -= 1;
                        msg.token = None;
                        state = ReqState::ReqTypeLenLf;
                    }
                    Some(_) => fail!(msg, state),
                }
            }

            ReqState::ReqTypeLenLf => {
                if ch != LF {
                    fail!(msg, state);
                }
                state = ReqState::ReqType;
            }

            ReqState::ReqType => {
                if msg.token.is_none() {
                    msg.token = Some(base + p as u64);
                }
                let token = (msg.token.unwrap() - base) as usize;

                // Jump to the byte just past the announced token length; if
                // it is not here yet, eat what is and suspend.
                let m = token + msg.rlen as usize;
                if m >= end {
                    p = end;
                    continue;
                }
                if data[m] != CR {
                    fail!(msg, state);
                }

                msg.rlen = 0;
                msg.token = None;
                msg.mtype = MsgType::classify(&data[token..m]);

                if msg.mtype == MsgType::Unknown {
                    fail!(msg, state);
                }
                if msg.mtype.is_internal() {
                    msg.noforward = true;
                }
                if msg.mtype == MsgType::Quit {
                    msg.quit = true;
                }

                p = m;
                state = ReqState::ReqTypeLf;
            }

            ReqState::ReqTypeLf => {
                if ch != LF {
                    fail!(msg, state);
                }
                match msg.mtype.arity().expect("classified request has an arity") {
                    Arity::NoKey => return done(msg, base + p as u64),
                    Arity::ArgEval => state = ReqState::Arg1Len,
                    _ => state = ReqState::KeyLen,
                }
            }

            ReqState::KeyLen => {
                match msg.token {
                    None => {
                        if ch != b'$' {
                            fail!(msg, state);
                        }
                        msg.token = Some(base + p as u64);
                        msg.rlen = 0;
                    }
                    Some(_) if ch.is_ascii_digit() => {
                        msg.rlen = msg.rlen * 10 + u64::from(ch - b'0');
                        if msg.rlen > MAX_BULK_LEN {
                            fail!(msg, state);
                        }
                    }
                    Some(_) if ch == CR => {
                        // A key must fit one chunk or the contiguity
                        // invariant breaks down.
                        if msg.rlen >= key_limit {
                            fail!(msg, state);
                        }
                        if msg.rnarg == 0 {
                            fail!(msg, state);
                        }
                        msg.rnarg -= 1;
                        msg.token = None;
                        state = ReqState::KeyLenLf;
                    }
                    Some(_) => fail!(msg, state),
                }
            }

            ReqState::KeyLenLf => {
                if ch != LF {
                    fail!(msg, state);
                }
                state = ReqState::Key;
            }

            ReqState::Key => {
                if msg.token.is_none() {
                    msg.token = Some(base + p as u64);
                }
                let token = (msg.token.unwrap() - base) as usize;

                let m = token + msg.rlen as usize;
                if m >= end {
                    p = end;
                    continue;
                }
                if data[m] != CR {
                    fail!(msg, state);
                }

                msg.rlen = 0;
                let start = msg.token.take().unwrap();
                msg.keys.push(KeyPos {
                    start,
                    end: base + m as u64,
                });

                p = m;
                state = ReqState::KeyLf;
            }

            ReqState::KeyLf => {
                if ch != LF {
                    fail!(msg, state);
                }
                match msg.mtype.arity().expect("classified request has an arity") {
                    Arity::Arg0 => {
                        if msg.rnarg != 0 {
                            fail!(msg, state);
                        }
                        return done(msg, base + p as u64);
                    }
                    Arity::Arg1 => {
                        if msg.rnarg != 1 {
                            fail!(msg, state);
                        }
                        state = ReqState::Arg1Len;
                    }
                    Arity::Arg2 => {
                        if msg.rnarg != 2 {
                            fail!(msg, state);
                        }
                        state = ReqState::Arg1Len;
                    }
                    Arity::Arg3 => {
                        if msg.rnarg != 3 {
                            fail!(msg, state);
                        }
                        state = ReqState::Arg1Len;
                    }
                    Arity::ArgN => {
                        if msg.rnarg == 0 {
                            return done(msg, base + p as u64);
                        }
                        state = ReqState::Arg1Len;
                    }
                    Arity::ArgX => {
                        if msg.rnarg == 0 {
                            return done(msg, base + p as u64);
                        }
                        state = ReqState::KeyLen;
                    }
                    Arity::ArgKvx => {
                        if msg.rnarg == 0 {
                            return done(msg, base + p as u64);
                        }
                        if msg.narg % 2 == 0 {
                            fail!(msg, state);
                        }
                        state = ReqState::Arg1Len;
                    }
                    Arity::ArgEval => {
                        if msg.rnarg == 0 {
                            return done(msg, base + p as u64);
                        }
                        state = ReqState::ArgNLen;
                    }
                    Arity::NoKey => fail!(msg, state),
                }
            }

            ReqState::Arg1Len
            | ReqState::Arg2Len
            | ReqState::Arg3Len
            | ReqState::ArgNLen => {
                match msg.token {
                    None => {
                        if ch != b'$' {
                            fail!(msg, state);
                        }
                        msg.rlen = 0;
                        msg.token = Some(base + p as u64);
                    }
                    Some(_) if ch.is_ascii_digit() => {
                        msg.rlen = msg.rlen * 10 + u64::from(ch - b'0');
                        if msg.rlen > MAX_BULK_LEN {
                            fail!(msg, state);
                        }
                    }
                    Some(token) if ch == CR => {
                        if base + p as u64 - token <= 1 || msg.rnarg == 0 {
                            fail!(msg, state);
                        }
                        msg.rnarg -= 1;
                        msg.token = None;
                        state = match state {
                            ReqState::Arg1Len => ReqState::Arg1LenLf,
                            ReqState::Arg2Len => ReqState::Arg2LenLf,
                            ReqState::Arg3Len => ReqState::Arg3LenLf,
                            _ => ReqState::ArgNLenLf,
                        };
                    }
                    Some(_) => fail!(msg, state),
                }
            }

            ReqState::Arg1LenLf
            | ReqState::Arg2LenLf
            | ReqState::Arg3LenLf
            | ReqState::ArgNLenLf => {
                if ch != LF {
                    fail!(msg, state);
                }
                state = match state {
                    ReqState::Arg1LenLf => ReqState::Arg1,
                    ReqState::Arg2LenLf => ReqState::Arg2,
                    ReqState::Arg3LenLf => ReqState::Arg3,
                    _ => ReqState::ArgN,
                };
            }

            ReqState::Arg1 | ReqState::Arg3 | ReqState::ArgN => {
                let m = p + msg.rlen as usize;
                if m >= end {
                    msg.rlen -= (end - p) as u64;
                    p = end;
                    continue;
                }
                if data[m] != CR {
                    fail!(msg, state);
                }

                p = m;
                msg.rlen = 0;
                state = match state {
                    ReqState::Arg1 => ReqState::Arg1Lf,
                    ReqState::Arg3 => ReqState::Arg3Lf,
                    _ => ReqState::ArgNLf,
                };
            }

            ReqState::Arg2 => {
                // For EVAL/EVALSHA this argument is the key count; it must
                // be tokenized so the digits can be read back.
                if msg.token.is_none() && msg.mtype.arity() == Some(Arity::ArgEval) {
                    msg.token = Some(base + p as u64);
                }

                let m = p + msg.rlen as usize;
                if m >= end {
                    msg.rlen -= (end - p) as u64;
                    p = end;
                    continue;
                }
                if data[m] != CR {
                    fail!(msg, state);
                }

                p = m;
                msg.rlen = 0;

                if msg.mtype.arity() == Some(Arity::ArgEval) {
                    let token = (msg.token.unwrap() - base) as usize;
                    if p <= token {
                        fail!(msg, state);
                    }

                    let mut nkey: u64 = 0;
                    for &digit in &data[token..p] {
                        if !digit.is_ascii_digit() {
                            fail!(msg, state);
                        }
                        nkey = nkey * 10 + u64::from(digit - b'0');
                        if nkey > MAX_NARG {
                            fail!(msg, state);
                        }
                    }
                    if nkey == 0 {
                        fail!(msg, state);
                    }

                    msg.token = None;
                }

                state = ReqState::Arg2Lf;
            }

            ReqState::Arg1Lf => {
                if ch != LF {
                    fail!(msg, state);
                }
                match msg.mtype.arity().expect("classified request has an arity") {
                    Arity::Arg1 => {
                        if msg.rnarg != 0 {
                            fail!(msg, state);
                        }
                        return done(msg, base + p as u64);
                    }
                    Arity::Arg2 => {
                        if msg.rnarg != 1 {
                            fail!(msg, state);
                        }
                        state = ReqState::Arg2Len;
                    }
                    Arity::Arg3 => {
                        if msg.rnarg != 2 {
                            fail!(msg, state);
                        }
                        state = ReqState::Arg2Len;
                    }
                    Arity::ArgN => {
                        if msg.rnarg == 0 {
                            return done(msg, base + p as u64);
                        }
                        state = ReqState::ArgNLen;
                    }
                    Arity::ArgEval => {
                        if msg.rnarg < 2 {
                            fail!(msg, state);
                        }
                        state = ReqState::Arg2Len;
                    }
                    Arity::ArgKvx => {
                        if msg.rnarg == 0 {
                            return done(msg, base + p as u64);
                        }
                        state = ReqState::KeyLen;
                    }
                    _ => fail!(msg, state),
                }
            }

            ReqState::Arg2Lf => {
                if ch != LF {
                    fail!(msg, state);
                }
                match msg.mtype.arity().expect("classified request has an arity") {
                    Arity::Arg2 => {
                        if msg.rnarg != 0 {
                            fail!(msg, state);
                        }
                        return done(msg, base + p as u64);
                    }
                    Arity::Arg3 => {
                        if msg.rnarg != 1 {
                            fail!(msg, state);
                        }
                        state = ReqState::Arg3Len;
                    }
                    Arity::ArgN => {
                        if msg.rnarg == 0 {
                            return done(msg, base + p as u64);
                        }
                        state = ReqState::ArgNLen;
                    }
                    Arity::ArgEval => {
                        if msg.rnarg < 1 {
                            fail!(msg, state);
                        }
                        state = ReqState::KeyLen;
                    }
                    _ => fail!(msg, state),
                }
            }

            ReqState::Arg3Lf => {
                if ch != LF {
                    fail!(msg, state);
                }
                match msg.mtype.arity().expect("classified request has an arity") {
                    Arity::Arg3 => {
                        if msg.rnarg != 0 {
                            fail!(msg, state);
                        }
                        return done(msg, base + p as u64);
                    }
                    Arity::ArgN => {
                        if msg.rnarg == 0 {
                            return done(msg, base + p as u64);
                        }
                        state = ReqState::ArgNLen;
                    }
                    _ => fail!(msg, state),
                }
            }

            ReqState::ArgNLf => {
                if ch != LF {
                    fail!(msg, state);
                }
                match msg.mtype.arity().expect("classified request has an arity") {
                    Arity::ArgN | Arity::ArgEval => {
                        if msg.rnarg == 0 {
                            return done(msg, base + p as u64);
                        }
                        state = ReqState::ArgNLen;
                    }
                    _ => fail!(msg, state),
                }
            }
        }

        p += 1;
    }

    debug_assert_eq!(p, end);
    msg.state = ParseState::Req(state);

    if full && msg.token.is_some() {
        // Partial token at the end of a full chunk: the caller must move it
        // into the next chunk before resuming.
        msg.pos = msg.token.take().unwrap();
        ParseResult::Repair
    } else {
        msg.pos = base + end as u64;
        ParseResult::Again
    }
}

fn done(msg: &mut Msg, lf_offset: u64) -> ParseResult {
    msg.pos = lf_offset + 1;
    msg.state = ParseState::Req(ReqState::Start);
    msg.token = None;
    ParseResult::Ok
}
