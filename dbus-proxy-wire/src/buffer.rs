//! Framed, ancillary-data-carrying byte buffers (§3 "Buffer", §4.1).
//!
//! The original source refcounts buffers because a single buffer can be referenced by a
//! read cursor and by outgoing queues at once. In safe Rust we instead give each buffer a
//! single owner at a time: a [`Buffer`] is either the side's exclusive "current read"
//! buffer, or has been moved (by value) onto exactly one outgoing queue. See `DESIGN.md`
//! for the rationale (mirrors §9's "Reference-counted buffers" design note).

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use crate::error::{WireError, WireResult};
use crate::transport::Transport;

/// D-Bus messages are always padded to an 8-byte boundary.
pub fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// A byte region with a write cursor (`pos`), a send cursor (`sent`), and any ancillary
/// file descriptors that arrived with (or should leave with) the final byte.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    pos: usize,
    sent: usize,
    send_credentials: bool,
    ancillary: Vec<OwnedFd>,
}

impl Buffer {
    /// A fresh buffer sized to receive exactly `size` bytes.
    pub fn new_sized(size: usize) -> Self {
        Buffer {
            data: vec![0u8; size],
            pos: 0,
            sent: 0,
            send_credentials: false,
            ancillary: Vec::new(),
        }
    }

    /// The one-byte buffer used to read the stream's leading credential byte.
    pub fn new_credential_byte() -> Self {
        let mut b = Buffer::new_sized(1);
        b.send_credentials = true;
        b
    }

    /// Grow `self` into a buffer of `new_size`, carrying over the already-read prefix,
    /// `pos`, `sent` and the attached ancillary fds. `self` is left empty (§4.1 "growth").
    pub fn grow_to(&mut self, new_size: usize) {
        debug_assert!(new_size >= self.pos);
        let mut data = vec![0u8; new_size];
        data[..self.pos].copy_from_slice(&self.data[..self.pos]);
        self.data = data;
        // pos, sent and ancillary are carried over as-is.
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        let pos = data.len();
        Buffer {
            data,
            pos,
            sent: 0,
            send_credentials: false,
            ancillary: Vec::new(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_read_complete(&self) -> bool {
        self.pos == self.data.len()
    }

    pub fn is_send_complete(&self) -> bool {
        self.send_credentials || self.sent >= self.data.len()
    }

    pub fn remaining_to_write(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn ancillary(&self) -> &[OwnedFd] {
        &self.ancillary
    }

    /// Remove and return every ancillary fd currently attached to this buffer.
    pub fn take_ancillary(&mut self) -> Vec<OwnedFd> {
        std::mem::take(&mut self.ancillary)
    }

    /// Attach fds to this buffer (e.g. re-attaching exactly `unix_fds` of them after
    /// validating the header, §4.5 step 2).
    pub fn attach_ancillary(&mut self, fds: Vec<OwnedFd>) {
        self.ancillary = fds;
    }

    /// Invariant check used by tests and debug assertions (§8): `sent <= pos <= size`.
    pub fn check_invariant(&self) -> bool {
        self.sent <= self.pos && self.pos <= self.data.len()
    }

    /// Copy as much of `bytes` as fits into `data[pos..size]`, advancing `pos` as if it
    /// had been read off the wire. Used to seed the "extra input data" left over past
    /// the auth handshake's final CRLF (§4.1, §4.2) straight into the next read buffer.
    /// Returns the number of bytes consumed.
    pub fn fill_from_slice(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.data.len() - self.pos);
        self.data[self.pos..self.pos + n].copy_from_slice(&bytes[..n]);
        self.pos += n;
        n
    }

    /// Attempt one non-blocking read into `data[pos..size]`.
    ///
    /// Returns `Ok(true)` iff at least one byte was moved in. Returns `Ok(false)` on
    /// would-block. A zero-length successful read means the peer closed the stream and
    /// is reported as [`WireError::Io`] with `ErrorKind::UnexpectedEof`.
    pub fn read_from(&mut self, transport: &dyn Transport) -> WireResult<bool> {
        if self.pos >= self.data.len() {
            return Ok(false);
        }
        match transport.recv(&mut self.data[self.pos..]) {
            Ok((0, _)) => Err(WireError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed connection",
            ))),
            Ok((n, fds)) => {
                self.pos += n;
                self.ancillary.extend(fds);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(WireError::Io(e)),
        }
    }

    /// Attempt one non-blocking write of the unsent tail, plus any attached ancillary fds.
    ///
    /// Returns `Ok(true)` iff the buffer is now fully sent.
    pub fn write_to(&mut self, transport: &dyn Transport) -> WireResult<bool> {
        if self.send_credentials {
            if self.sent == 0 {
                match transport.send_credential_byte() {
                    Ok(_) => {
                        self.sent = 1;
                        return Ok(true);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) => return Err(WireError::Io(e)),
                }
            }
            return Ok(true);
        }

        let fds: Vec<BorrowedFd<'_>> = if self.sent == 0 {
            self.ancillary.iter().map(|f| f.as_fd()).collect()
        } else {
            Vec::new()
        };
        match transport.send(&self.data[self.sent..self.pos], &fds) {
            Ok(n) => {
                self.sent += n;
                if self.sent >= self.pos {
                    self.ancillary.clear();
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(WireError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sized_satisfies_invariant() {
        let b = Buffer::new_sized(16);
        assert!(b.check_invariant());
        assert_eq!(b.size(), 16);
        assert!(!b.is_read_complete());
    }

    #[test]
    fn grow_preserves_prefix_and_cursors() {
        let mut b = Buffer::from_bytes(vec![1, 2, 3, 4]);
        b.grow_to(8);
        assert_eq!(b.size(), 8);
        assert_eq!(&b.data()[..4], &[1, 2, 3, 4]);
        assert_eq!(b.pos(), 4);
        assert!(b.check_invariant());
    }

    #[test]
    fn credential_buffer_is_one_byte() {
        let b = Buffer::new_credential_byte();
        assert_eq!(b.size(), 1);
    }

    #[test]
    fn align8_rounds_up() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(9), 16);
    }
}
