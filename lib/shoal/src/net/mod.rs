//! The socket layer: connections and the single-threaded poll loop. The
//! protocol core treats this as a collaborator; everything here is plumbing
//! between sockets, the parsers and the pool.

pub mod conn;
pub mod endpoint;
