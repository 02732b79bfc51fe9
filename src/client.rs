//! Per-connected-client state.
//!
//! A client owns its socket, a decode buffer for partial inbound frames, an
//! outbound byte queue, a subscription (a PTY or a session), and the
//! last-sent view used for diffing: per-grid snapshots, cursor, and the set
//! of highlight ids already defined for this client. The server is the only
//! code that touches these records, always on the main thread.

use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;

use crate::rpc::{FrameBuffer, Message};
use crate::term::{CursorState, ScreenSnapshot};

/// What the client is looking at.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum Subscription {
    #[default]
    None,
    /// One PTY, viewport-sized.
    Pty { pty_id: u64 },
    /// A session: whatever panes the active tab shows, tiled.
    Session { name: String },
}

/// The last state this client was sent for one grid.
#[derive(Debug)]
pub struct GridView {
    pub snapshot: ScreenSnapshot,
    pub cursor: Option<CursorState>,
}

pub struct Client {
    pub id: u64,
    pub stream: UnixStream,
    pub decode: FrameBuffer,
    outbound: Vec<u8>,
    pub subscription: Subscription,
    pub viewport_rows: u16,
    pub viewport_cols: u16,
    pub grids: HashMap<u64, GridView>,
    pub seen_styles: HashSet<u64>,
    pub sent_default_colors: Option<((u8, u8, u8), (u8, u8, u8))>,
    /// Set when the connection must be torn down (decode error, overflow,
    /// socket failure). The server reaps flagged clients after dispatch.
    pub dead: bool,
}

impl Client {
    pub fn new(id: u64, stream: UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Client {
            id,
            stream,
            decode: FrameBuffer::new(),
            outbound: Vec::new(),
            subscription: Subscription::None,
            viewport_rows: 24,
            viewport_cols: 80,
            grids: HashMap::new(),
            seen_styles: HashSet::new(),
            sent_default_colors: None,
            dead: false,
        })
    }

    /// Read whatever the socket has into the decode buffer. `Ok(true)`
    /// means the peer closed the stream.
    pub fn fill_decoder(&mut self) -> io::Result<bool> {
        let mut buf = [0u8; 16 * 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Ok(true),
                Ok(n) => self.decode.extend(&buf[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Queue a frame for delivery. A queue past `cap` bytes marks the
    /// client dead instead of growing without bound.
    pub fn enqueue(&mut self, msg: Message, cap: usize) -> bool {
        if self.dead {
            return false;
        }
        let before = self.outbound.len();
        msg.encode_into(&mut self.outbound);
        if self.outbound.len() > cap {
            self.outbound.truncate(before);
            self.dead = true;
            return false;
        }
        true
    }

    /// Push queued bytes to the socket. `Ok(true)` when fully drained.
    pub fn flush(&mut self) -> io::Result<bool> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn queued_bytes(&self) -> usize {
        self.outbound.len()
    }

    /// Forget everything sent so far so the next frame is a full paint.
    /// Style definitions survive; they are per-client, not per-grid.
    pub fn reset_view(&mut self) {
        self.grids.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Value;

    fn pair() -> (Client, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        (Client::new(1, a).unwrap(), b)
    }

    fn note(name: &str) -> Message {
        Message::Notification {
            method: name.to_string(),
            params: Value::Array(Vec::new()),
        }
    }

    #[test]
    fn enqueue_then_flush_reaches_the_peer() {
        let (mut client, mut peer) = pair();
        assert!(client.enqueue(note("bell"), 1 << 20));
        assert!(client.flush().unwrap());
        assert!(!client.wants_write());

        peer.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 256];
        let n = peer.read(&mut buf).unwrap();
        let (value, _) = crate::rpc::decode(&buf[..n]).unwrap();
        match Message::from_value(value).unwrap() {
            Message::Notification { method, .. } => assert_eq!(method, "bell"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn overflowing_the_cap_marks_the_client_dead() {
        let (mut client, _peer) = pair();
        let big = Message::Notification {
            method: "redraw".to_string(),
            params: Value::Str("x".repeat(512)),
        };
        assert!(client.enqueue(big.clone(), 4096));
        // The queue is never flushed (peer not reading), so the cap trips.
        let mut accepted = 1;
        while client.enqueue(big.clone(), 4096) {
            accepted += 1;
            assert!(accepted < 100, "cap never tripped");
        }
        assert!(client.dead);
        // Dead clients accept nothing further.
        assert!(!client.enqueue(note("bell"), 4096));
    }

    #[test]
    fn partial_inbound_frames_wait_in_the_decoder() {
        let (mut client, mut peer) = pair();
        let mut wire = Vec::new();
        note("ping").encode_into(&mut wire);
        let (head, tail) = wire.split_at(3);

        peer.write_all(head).unwrap();
        assert!(!client.fill_decoder().unwrap());
        assert!(client.decode.next_message().unwrap().is_none());

        peer.write_all(tail).unwrap();
        assert!(!client.fill_decoder().unwrap());
        assert!(client.decode.next_message().unwrap().is_some());
    }

    #[test]
    fn peer_close_reports_eof() {
        let (mut client, peer) = pair();
        drop(peer);
        assert!(client.fill_decoder().unwrap());
    }

    #[test]
    fn reset_view_clears_grids_but_keeps_styles() {
        let (mut client, _peer) = pair();
        client.grids.insert(
            1,
            GridView {
                snapshot: ScreenSnapshot::blank(2, 2),
                cursor: None,
            },
        );
        client.seen_styles.insert(5);
        client.reset_view();
        assert!(client.grids.is_empty());
        assert!(client.seen_styles.contains(&5));
    }
}
