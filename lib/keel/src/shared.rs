use std::io;
use std::net;

pub type NetResult<T> = Result<T, NetError>;

/// Two-level error plumbing shared by the whole proxy. `Wait` means "no
/// progress possible right now, retry on readiness"; everything else is
/// fatal for the operation at hand.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorType {
    /// Malformed bytes on the wire, the EINVAL of the original.
    Protocol,
    /// Buffer pool exhausted, the ENOMEM of the original.
    NoMem,
    /// No server holds the slot, or the lookup came up empty.
    NoServer,
    /// A message exceeded the configured size limit.
    TooLarge,
    /// A fragment reply arrived with a type its owner cannot accept.
    BadFragment,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}
