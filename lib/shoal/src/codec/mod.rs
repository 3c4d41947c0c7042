//! Incremental, restartable parsers for the redis unified protocol. Each
//! call consumes whatever bytes are currently in the message's chain and
//! suspends cleanly, recording the parse state, cursor and partial token on
//! the message itself.

use crate::msg::Msg;
use keel::shared::ErrorType;

pub mod req;
pub mod rsp;

pub const CR: u8 = b'\r';
pub const LF: u8 = b'\n';

/// Largest bulk length the parser accepts, matching the redis 512 MiB cap.
pub const MAX_BULK_LEN: u64 = 512 * 1024 * 1024;

/// Largest argument count the parser accepts.
pub const MAX_NARG: u64 = 1024 * 1024;

/// Verdict of one parse step.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ParseResult {
    /// Message complete; the cursor points just past the trailing LF.
    Ok,
    /// More bytes needed, nothing special to do.
    Again,
    /// Suspended mid-token at the end of a full chunk: the caller must move
    /// the partial token (at the message cursor) into a fresh chunk via
    /// `Chain::repair` before resuming.
    Repair,
    /// Protocol violation or resource failure; the connection must close.
    Error(ErrorType),
}

/// Runs the parser matching the message's direction.
#[inline]
pub fn parse(msg: &mut Msg) -> ParseResult {
    if msg.request {
        req::parse(msg)
    } else {
        rsp::parse(msg)
    }
}
