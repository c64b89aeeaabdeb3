//! Unix-domain transport: non-blocking `recv`/`send` plus SCM_RIGHTS fd passing and the
//! single credential byte every D-Bus stream transport starts with.
//!
//! Grounded on `zbus`'s own `address/transport/unix.rs` and its `nix`-based socket layer
//! (`connection/socket/mod.rs`'s `ReadHalf`/`WriteHalf` split), adapted from `zbus`'s async
//! `recvmsg`/`sendmsg` calls to the synchronous, readiness-driven model this proxy uses.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{
    recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr,
};
use nix::sys::uio::{IoSlice, IoSliceMut};

/// Abstraction over "a byte stream that can also carry ancillary file descriptors",
/// so the framing code in [`crate::buffer`] doesn't need to know it's talking to a
/// `UnixStream` specifically.
pub trait Transport: std::fmt::Debug + Send {
    /// Non-blocking receive. Returns `(bytes_read, fds_received)`.
    fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)>;

    /// Non-blocking send, passing `fds` alongside the first byte of `buf` (matches D-Bus
    /// semantics: fds are associated with the message they arrive at the end of).
    fn send(&self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize>;

    /// Send the single credential byte that begins a stream-credential transport.
    fn send_credential_byte(&self) -> io::Result<usize>;

    fn raw_fd(&self) -> RawFd;
}

impl Transport for UnixStream {
    fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
        let fd = self.as_raw_fd();
        let mut iov = [IoSliceMut::new(buf)];
        let mut cmsg_space = nix::cmsg_space!([RawFd; 16]);
        let msg = recvmsg::<UnixAddr>(fd, &mut iov, Some(&mut cmsg_space), MsgFlags::MSG_DONTWAIT)
            .map_err(nix_to_io)?;

        let mut fds = Vec::new();
        for cmsg in msg.cmsgs().map_err(nix_to_io)? {
            if let ControlMessageOwned::ScmRights(raw_fds) = cmsg {
                for raw in raw_fds {
                    // Safety: the kernel just handed us ownership of this fd via SCM_RIGHTS.
                    fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
                }
            }
        }
        Ok((msg.bytes, fds))
    }

    fn send(&self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        let fd = self.as_raw_fd();
        let iov = [IoSlice::new(buf)];
        let raw_fds: Vec<RawFd> = fds.iter().map(|f| f.as_raw_fd()).collect();
        let cmsgs: &[ControlMessage<'_>] = if raw_fds.is_empty() {
            &[]
        } else {
            &[ControlMessage::ScmRights(&raw_fds)]
        };
        sendmsg::<UnixAddr>(fd, &iov, cmsgs, MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_NOSIGNAL, None)
            .map_err(nix_to_io)
    }

    fn send_credential_byte(&self) -> io::Result<usize> {
        use std::io::Write;
        let mut writer = self;
        writer.write(&[0u8])
    }

    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}
