//! One client- or server-side connection: a mio stream, the message being
//! parsed off it, and the in-flight queues that keep responses paired and
//! ordered.

use crate::cluster::ServerId;
use crate::codec::{self, ParseResult};
use crate::msg::{ConnId, MsgArena, MsgId};
use keel::shared::{ErrorType, NetError, NetResult};
use mio::net::TcpStream;
use std::collections::VecDeque;
use std::io;
use std::time::Instant;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnKind {
    Client,
    Server(ServerId),
}

pub struct Conn {
    pub id: ConnId,
    pub kind: ConnKind,
    stream: Option<TcpStream>,

    /// Message currently being parsed off this socket.
    pub rmsg: Option<MsgId>,

    /// Client: accepted requests in arrival order; responses are delivered
    /// head-first so ordering holds.
    pub outstanding: VecDeque<MsgId>,

    /// Server: requests waiting to be written.
    pub pending: VecDeque<MsgId>,
    /// Server: requests written, awaiting their replies in send order.
    pub inflight: VecDeque<MsgId>,

    /// When the current inflight head was sent, for the timeout sweep.
    pub inflight_since: Option<Instant>,

    pub need_auth: bool,
    /// Flush outstanding replies, then close (QUIT).
    pub closing: bool,
}

impl Conn {
    pub fn new(id: ConnId, kind: ConnKind, stream: TcpStream) -> Conn {
        Conn {
            id,
            kind,
            stream: Some(stream),
            rmsg: None,
            outstanding: VecDeque::new(),
            pending: VecDeque::new(),
            inflight: VecDeque::new(),
            inflight_since: None,
            need_auth: false,
            closing: false,
        }
    }

    #[inline]
    pub fn is_client(&self) -> bool {
        self.kind == ConnKind::Client
    }

    #[inline]
    pub fn stream(&self) -> &TcpStream {
        self.stream.as_ref().expect("connection has a live stream")
    }

    #[inline]
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("connection has a live stream")
    }

    /// Reads whatever the socket has and drives the parser. Returns the
    /// ids of messages completed by this read.
    pub fn receive(&mut self, arena: &mut MsgArena) -> NetResult<Vec<MsgId>> {
        let mut completed = Vec::new();

        loop {
            let rmsg = match self.rmsg {
                Some(rmsg) => rmsg,
                None => {
                    let rmsg = arena.get(self.is_client());
                    self.rmsg = Some(rmsg);
                    rmsg
                }
            };

            let msg = arena.msg_mut(rmsg).expect("receive target is live");
            let stream = self.stream.as_mut().expect("receive on a live stream");

            match msg.chain.ingress(stream) {
                Ok(0) => return Err(NetError::Fatal(ErrorType::Io(io::ErrorKind::UnexpectedEof))),
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(completed),
                Err(err) => return Err(err.into()),
            }

            let is_client = self.is_client();
            advance_parse(arena, &mut self.rmsg, is_client, &mut completed)?;
        }
    }

    /// Writes queued bytes. For a server connection this drains `pending`
    /// into `inflight`; client response writing is driven by the endpoint
    /// against the outstanding queue.
    pub fn send_pending(&mut self, arena: &mut MsgArena) -> NetResult<()> {
        while let Some(&head) = self.pending.front() {
            let msg = match arena.msg_mut(head) {
                Some(msg) => msg,
                None => {
                    self.pending.pop_front();
                    continue;
                }
            };
            let stream = self.stream.as_mut().expect("send on a live stream");

            match msg.chain.egress(stream) {
                Ok(_) => {
                    self.pending.pop_front();
                    self.inflight.push_back(head);
                    if self.inflight.len() == 1 {
                        self.inflight_since = Some(Instant::now());
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Err(NetError::Wait);
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }

    /// Shuts the stream down; queued message ids are left for the endpoint
    /// to release.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}

/// Drives the parser over the in-progress message until it runs out of
/// bytes, handling repair and pipelined follow-on messages. Completed ids
/// are appended to `completed`; `rmsg` always holds the next in-progress
/// message on return.
pub fn advance_parse(
    arena: &mut MsgArena,
    rmsg: &mut Option<MsgId>,
    request: bool,
    completed: &mut Vec<MsgId>,
) -> NetResult<()> {
    loop {
        let current = rmsg.expect("advance_parse with a message in progress");
        let msg = arena.msg_mut(current).expect("parse target is live");

        match codec::parse(msg) {
            ParseResult::Ok => {
                let leftover = msg.chain.take_tail_from(msg.pos);
                completed.push(current);

                let next = arena.get(request);
                if !leftover.is_empty() {
                    arena.msg_mut(next).unwrap().chain.append(&leftover);
                }
                *rmsg = Some(next);

                if leftover.is_empty() {
                    return Ok(());
                }
            }
            ParseResult::Again => return Ok(()),
            ParseResult::Repair => {
                msg.chain.repair(msg.pos);
                return Ok(());
            }
            ParseResult::Error(kind) => return Err(NetError::Fatal(kind)),
        }
    }
}
