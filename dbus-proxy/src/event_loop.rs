//! Readiness-driven event loop substrate (§5, §9 "Global event loop", §10.4): a thin
//! collaborator that registers each [`Side`](crate::side::Side)'s socket with a
//! `mio::Poll` and hands readiness back to the caller as plain data, leaving dispatch
//! to [`crate::proxy::Proxy`].

use std::io;
use std::os::fd::AsRawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::client::{SideId, BUS_SIDE, CLIENT_SIDE};
use crate::proxy::{ClientId, Proxy};

const LISTENER_TOKEN: Token = Token(0);
const LIVENESS_TOKEN: Token = Token(usize::MAX);

/// One readiness notification, decoded from a raw `mio::Token` back into the
/// (client, side) pair or the listener/liveness descriptors it was registered for.
pub enum Readiness {
    Listener,
    Side {
        client: ClientId,
        side: SideId,
        readable: bool,
        writable: bool,
    },
    /// The liveness descriptor became readable (parent wrote) or hung up/errored
    /// (parent closed its end); `hung_up` distinguishes the two (§6 "Liveness
    /// descriptor").
    Liveness { hung_up: bool },
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
}

impl EventLoop {
    pub fn new(proxy: &Proxy) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener_fd = proxy.listener().as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&mut listener_fd), LISTENER_TOKEN, Interest::READABLE)?;
        Ok(EventLoop {
            poll,
            events: Events::with_capacity(128),
        })
    }

    fn side_token(id: ClientId, side: SideId) -> Token {
        Token(1 + id * 2 + side.0)
    }

    fn decode_token(token: Token) -> Option<(ClientId, SideId)> {
        if token == LISTENER_TOKEN || token == LIVENESS_TOKEN {
            return None;
        }
        let raw = token.0 - 1;
        Some((raw / 2, SideId(raw % 2)))
    }

    /// Register both sides of a freshly accepted client (§10.4).
    pub fn register_client(&mut self, id: ClientId, proxy: &Proxy) -> io::Result<()> {
        let Some(client) = proxy.client(id) else { return Ok(()) };
        for side_id in [CLIENT_SIDE, BUS_SIDE] {
            let mut fd = client.side(side_id).socket().as_raw_fd();
            let token = Self::side_token(id, side_id);
            self.poll
                .registry()
                .register(&mut SourceFd(&mut fd), token, Interest::READABLE | Interest::WRITABLE)?;
        }
        Ok(())
    }

    /// Deregister a client's sockets before it is dropped (§9 "cancellation is
    /// expressed by dropping the side handle"): must run while the sockets are still
    /// open, since deregistering after close can race a reused fd number.
    pub fn deregister_client(&mut self, id: ClientId, proxy: &Proxy) {
        let Some(client) = proxy.client(id) else { return };
        for side_id in [CLIENT_SIDE, BUS_SIDE] {
            let mut fd = client.side(side_id).socket().as_raw_fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&mut fd));
        }
    }

    /// Register the liveness descriptor (§6): only watched for readability/hangup,
    /// never written to through this registration.
    pub fn register_liveness(&mut self, raw_fd: std::os::fd::RawFd) -> io::Result<()> {
        let mut fd = raw_fd;
        self.poll
            .registry()
            .register(&mut SourceFd(&mut fd), LIVENESS_TOKEN, Interest::READABLE)?;
        Ok(())
    }

    /// Block until at least one registered socket is ready, or `timeout` elapses.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        self.poll.poll(&mut self.events, timeout)?;
        let mut out = Vec::new();
        for event in self.events.iter() {
            if event.token() == LISTENER_TOKEN {
                out.push(Readiness::Listener);
                continue;
            }
            if event.token() == LIVENESS_TOKEN {
                out.push(Readiness::Liveness {
                    hung_up: event.is_read_closed() || event.is_error(),
                });
                continue;
            }
            if let Some((client, side)) = Self::decode_token(event.token()) {
                out.push(Readiness::Side {
                    client,
                    side,
                    readable: event.is_readable(),
                    writable: event.is_writable(),
                });
            }
        }
        Ok(out)
    }
}
