//! Response parser: status, error, integer, bulk and multibulk replies,
//! with a seven-byte lookahead that promotes `-MOVED ` and `-ASK ` error
//! replies to their own types and extracts the slot number and `host:port`
//! literal. Multibulk replies may nest one level, which covers the
//! `[cursor, [values...]]` shape of the scan family.

use super::{ParseResult, CR, LF, MAX_BULK_LEN, MAX_NARG};
use crate::msg::{Msg, MsgType, ParseState};
use keel::shared::ErrorType;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RspState {
    Start,
    Integer,
    Bulk,
    BulkLf,
    BulkArg,
    BulkArgLf,
    Multibulk,
    MultibulkNargLf,
    MultibulkArgnLen,
    MultibulkArgnLenLf,
    MultibulkArgn,
    MultibulkArgnLf,
    RuntoCrlf,
    AlmostDone,
    SlotNum,
    SlotAddrStart,
    SlotAddr,
}

macro_rules! fail {
    ($msg:expr, $state:expr) => {{
        $msg.state = ParseState::Rsp($state);
        return ParseResult::Error(ErrorType::Protocol);
    }};
}

pub fn parse(msg: &mut Msg) -> ParseResult {
    let mut state = match msg.state {
        ParseState::Rsp(state) => state,
        ParseState::Req(_) => panic!("request parse state on a response message"),
    };

    let chunk = match msg.chain.tail() {
        Some(chunk) => chunk,
        None => return ParseResult::Again,
    };

    let base = chunk.base();
    let data = chunk.filled();
    let end = data.len();
    let full = chunk.is_full();

    debug_assert!(msg.pos >= base && msg.pos <= base + end as u64);
    let mut p = (msg.pos - base) as usize;

    while p < end {
        let ch = data[p];

        match state {
            RspState::Start => {
                msg.mtype = MsgType::Unknown;

                if ch == b'-' {
                    if msg.token.is_none() {
                        msg.token = Some(base + p as u64);
                    }
                    // 7 bytes is the longer of '-MOVED ' and '-ASK '; wait
                    // for the whole prefix before dispatching.
                    if msg.token.unwrap() + 7 >= base + end as u64 {
                        p = end;
                        continue;
                    }
                }

                match ch {
                    b'+' => {
                        msg.mtype = MsgType::Status;
                        state = RspState::RuntoCrlf;
                    }
                    b'-' => {
                        let next = &data[p + 1..];
                        if next[..5].eq_ignore_ascii_case(b"MOVED") {
                            msg.mtype = MsgType::Moved;
                            msg.token = None;
                            msg.integer = 0;
                            p += 6;
                            state = RspState::SlotNum;
                        } else if next[..3].eq_ignore_ascii_case(b"ASK") {
                            msg.mtype = MsgType::Ask;
                            msg.token = None;
                            msg.integer = 0;
                            p += 4;
                            state = RspState::SlotNum;
                        } else {
                            msg.mtype = MsgType::Error;
                            msg.token = None;
                            state = RspState::RuntoCrlf;
                        }
                    }
                    b':' => {
                        msg.mtype = MsgType::Integer;
                        msg.integer = 0;
                        state = RspState::Integer;
                    }
                    b'$' => {
                        msg.mtype = MsgType::Bulk;
                        state = RspState::Bulk;
                        continue;
                    }
                    b'*' => {
                        msg.mtype = MsgType::Multibulk;
                        state = RspState::Multibulk;
                        continue;
                    }
                    _ => fail!(msg, state),
                }
            }

            RspState::Integer => {
                if ch == CR {
                    state = RspState::AlmostDone;
                } else if ch == b'-' {
                    // Sign accepted and skipped; the magnitude is all the
                    // coalescer ever reads.
                } else if ch.is_ascii_digit() {
                    msg.integer = msg.integer * 10 + u64::from(ch - b'0');
                } else {
                    fail!(msg, state);
                }
            }

            RspState::RuntoCrlf => {
                if ch == CR {
                    state = RspState::AlmostDone;
                }
            }

            RspState::AlmostDone => {
                if ch != LF {
                    fail!(msg, state);
                }
                return done(msg, base + p as u64);
            }

            RspState::Bulk => {
                match msg.token {
                    None => {
                        if ch != b'$' {
                            fail!(msg, state);
                        }
                        msg.token = Some(base + p as u64);
                        msg.rlen = 0;
                    }
                    Some(_) if ch == b'-' => {
                        // Null bulk reply, '$-1'.
                        state = RspState::RuntoCrlf;
                    }
                    Some(_) if ch.is_ascii_digit() => {
                        msg.rlen = msg.rlen * 10 + u64::from(ch - b'0');
                        if msg.rlen > MAX_BULK_LEN {
                            fail!(msg, state);
                        }
                    }
                    Some(token) if ch == CR => {
                        if base + p as u64 - token <= 1 {
                            fail!(msg, state);
                        }
                        msg.token = None;
                        state = RspState::BulkLf;
                    }
                    Some(_) => fail!(msg, state),
                }
            }

            RspState::BulkLf => {
                if ch != LF {
                    fail!(msg, state);
                }
                state = RspState::BulkArg;
            }

            RspState::BulkArg => {
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
                state = RspState::BulkArgLf;
            }

            RspState::BulkArgLf => {
                if ch != LF {
                    fail!(msg, state);
                }
                return done(msg, base + p as u64);
            }

            RspState::Multibulk => {
                match msg.token {
                    None => {
                        if ch != b'*' {
                            fail!(msg, state);
                        }
                        msg.token = Some(base + p as u64);
                        msg.narg_start = base + p as u64;
                        msg.rnarg = 0;
                    }
                    Some(_) if ch == b'-' => {
                        // Null multibulk reply, '*-1'.
                        state = RspState::RuntoCrlf;
                    }
                    Some(_) if ch.is_ascii_digit() => {
                        msg.rnarg = msg.rnarg * 10 + u64::from(ch - b'0');
                        if msg.rnarg > MAX_NARG {
                            fail!(msg, state);
                        }
                    }
                    Some(token) if ch == CR => {
                        if base + p as u64 - token <= 1 {
                            fail!(msg, state);
                        }
                        msg.narg = msg.rnarg;
                        msg.narg_end = base + p as u64;
                        msg.token = None;
                        state = RspState::MultibulkNargLf;
                    }
                    Some(_) => fail!(msg, state),
                }
            }

            RspState::MultibulkNargLf => {
                if ch != LF {
                    fail!(msg, state);
                }
                if msg.rnarg == 0 {
                    // The reply is '*0\r\n'.
                    return done(msg, base + p as u64);
                }
                state = RspState::MultibulkArgnLen;
            }

            RspState::MultibulkArgnLen => {
                match msg.token {
                    None => {
                        // A nested multibulk may appear as the final
                        // element (the scan family); handle it by tail
                        // recursing into the multibulk state.
                        if ch == b'*' {
                            state = RspState::Multibulk;
                            continue;
                        }
                        if ch != b'$' && ch != b':' {
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
                    Some(_) if ch == b'-' => {}
                    Some(token) if ch == CR => {
                        let token_local = (token - base) as usize;
                        if base + p as u64 - token <= 1 || msg.rnarg == 0 {
                            fail!(msg, state);
                        }

                        if (msg.rlen == 1 && p - token_local == 3) || data[token_local] == b':'
                        {
                            // A '$-1' element or an integer element has no
                            // data line of its own.
                            msg.rlen = 0;
                            state = RspState::MultibulkArgnLf;
                        } else {
                            state = RspState::MultibulkArgnLenLf;
                        }
                        msg.rnarg -= 1;
                        msg.token = None;
                    }
                    Some(_) => fail!(msg, state),
                }
            }

            RspState::MultibulkArgnLenLf => {
                if ch != LF {
                    fail!(msg, state);
                }
                state = RspState::MultibulkArgn;
            }

            RspState::MultibulkArgn => {
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
                state = RspState::MultibulkArgnLf;
            }

            RspState::MultibulkArgnLf => {
                if ch != LF {
                    fail!(msg, state);
                }
                if msg.rnarg == 0 {
                    return done(msg, base + p as u64);
                }
                state = RspState::MultibulkArgnLen;
            }

            RspState::SlotNum => {
                if ch == b' ' {
                    state = RspState::SlotAddrStart;
                } else if ch.is_ascii_digit() {
                    msg.integer = msg.integer * 10 + u64::from(ch - b'0');
                } else {
                    fail!(msg, state);
                }
            }

            RspState::SlotAddrStart => {
                msg.redirect_addr = Some((base + p as u64, base + p as u64));
                state = RspState::SlotAddr;
            }

            RspState::SlotAddr => {
                if ch == CR {
                    let (start, _) = msg.redirect_addr.expect("addr start recorded");
                    msg.redirect_addr = Some((start, base + p as u64));
                    state = RspState::AlmostDone;
                }
            }
        }

        p += 1;
    }

    debug_assert_eq!(p, end);
    msg.state = ParseState::Rsp(state);

    if full && msg.token.is_some() {
        msg.pos = msg.token.take().unwrap();
        ParseResult::Repair
    } else {
        // A suspended redirect lookahead restarts from the '-' token, since
        // the prefix dispatch reads it as a unit.
        msg.pos = match (state, msg.token) {
            (RspState::Start, Some(token)) => token,
            _ => base + end as u64,
        };
        ParseResult::Again
    }
}

fn done(msg: &mut Msg, lf_offset: u64) -> ParseResult {
    msg.pos = lf_offset + 1;
    msg.state = ParseState::Rsp(RspState::Start);
    msg.token = None;
    ParseResult::Ok
}
