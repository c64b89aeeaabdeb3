//! SASL-style authentication relay (§4.2): tracks request/reply parity across the
//! line-oriented CRLF handshake and decides when each side may switch to binary
//! message framing.

use dbus_proxy_wire::{WireError, WireResult};

/// 16 KiB safety bound on an unterminated auth line buffer (§4.2, §8).
const MAX_AUTH_BUFFER: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    WaitingForBegin,
    WaitingForBacklog,
    Complete,
}

/// Per-client auth bookkeeping (§3 `Client` auth fields).
#[derive(Debug)]
pub struct AuthRelay {
    state: AuthState,
    auth_requests: u32,
    auth_replies: u32,
    client_buffer: Vec<u8>,
    bus_buffer: Vec<u8>,
    /// Bytes that arrived glued to the end of a CRLF line, stashed until the side's
    /// next read once complete (§4.1 "extra input data").
    client_extra: Vec<u8>,
    bus_extra: Vec<u8>,
}

impl AuthRelay {
    pub fn new() -> Self {
        AuthRelay {
            state: AuthState::WaitingForBegin,
            auth_requests: 0,
            auth_replies: 0,
            client_buffer: Vec::new(),
            bus_buffer: Vec::new(),
            client_extra: Vec::new(),
            bus_extra: Vec::new(),
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == AuthState::Complete
    }

    /// Bytes stashed past the final CRLF after `BEGIN`, or past the last reply line
    /// once the bus side is free to resume feeding the client (§4.1, §4.2).
    pub fn take_client_extra(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.client_extra)
    }

    pub fn take_bus_extra(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bus_extra)
    }

    /// Feed bytes arriving from the client side. Returns `Ok(true)` if this call moved
    /// the relay into `Complete` or `WaitingForBacklog`.
    pub fn feed_client(&mut self, bytes: &[u8]) -> WireResult<()> {
        self.client_buffer.extend_from_slice(bytes);
        if self.client_buffer.len() > MAX_AUTH_BUFFER {
            return Err(WireError::AuthBufferOverflow);
        }

        loop {
            let Some(nl) = self.client_buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line_end = nl + 1;
            let line = self.client_buffer[..line_end].to_vec();
            let rest = self.client_buffer.split_off(line_end);
            self.client_buffer = rest;

            let trimmed = line
                .strip_suffix(b"\r\n")
                .or_else(|| line.strip_suffix(b"\n"))
                .unwrap_or(&line);
            validate_auth_line(trimmed)?;

            if is_begin_line(trimmed) {
                self.client_extra = std::mem::take(&mut self.client_buffer);
                if self.auth_requests == self.auth_replies {
                    self.state = AuthState::Complete;
                } else {
                    self.state = AuthState::WaitingForBacklog;
                }
                return Ok(());
            }

            self.auth_requests += 1;
        }
        Ok(())
    }

    /// Feed bytes arriving from the bus side. Returns an error if a reply arrives with
    /// no outstanding request (§4.2).
    pub fn feed_bus(&mut self, bytes: &[u8]) -> WireResult<()> {
        if self.state == AuthState::Complete {
            return Ok(());
        }

        self.bus_buffer.extend_from_slice(bytes);
        if self.bus_buffer.len() > MAX_AUTH_BUFFER {
            return Err(WireError::AuthBufferOverflow);
        }

        loop {
            let Some(nl) = self.bus_buffer.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line_end = nl + 1;
            let rest = self.bus_buffer.split_off(line_end);
            self.bus_buffer = rest;

            if self.auth_replies >= self.auth_requests {
                return Err(WireError::UnsolicitedAuthReply);
            }
            self.auth_replies += 1;

            if self.state == AuthState::WaitingForBacklog && self.auth_replies == self.auth_requests {
                self.bus_extra = std::mem::take(&mut self.bus_buffer);
                self.state = AuthState::Complete;
                return Ok(());
            }
        }
        Ok(())
    }
}

impl Default for AuthRelay {
    fn default() -> Self {
        Self::new()
    }
}

fn is_begin_line(line: &[u8]) -> bool {
    line == b"BEGIN" || line.starts_with(b"BEGIN ") || line.starts_with(b"BEGIN\t")
}

/// A line must be ASCII-printable and start with an uppercase letter (§4.2).
fn validate_auth_line(line: &[u8]) -> WireResult<()> {
    if line.first().map(|b| b.is_ascii_uppercase()) != Some(true) {
        return Err(WireError::InvalidAuthLine);
    }
    if !line.iter().all(|&b| b.is_ascii_graphic() || b == b' ') {
        return Err(WireError::InvalidAuthLine);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_request_reply_completes_immediately() {
        let mut relay = AuthRelay::new();
        relay.feed_client(b"AUTH EXTERNAL 31303030\r\n").unwrap();
        assert_eq!(relay.state(), AuthState::WaitingForBegin);
        relay.feed_bus(b"OK 1234deadbeef\r\n").unwrap();
        relay.feed_client(b"BEGIN\r\n").unwrap();
        assert_eq!(relay.state(), AuthState::Complete);
    }

    #[test]
    fn begin_before_backlog_waits() {
        let mut relay = AuthRelay::new();
        relay.feed_client(b"AUTH EXTERNAL 31303030\r\n").unwrap();
        relay.feed_client(b"NEGOTIATE_UNIX_FD\r\n").unwrap();
        relay.feed_client(b"BEGIN\r\n").unwrap();
        assert_eq!(relay.state(), AuthState::WaitingForBacklog);

        relay.feed_bus(b"OK 1234deadbeef\r\n").unwrap();
        assert_eq!(relay.state(), AuthState::WaitingForBacklog);
        relay.feed_bus(b"AGREE_UNIX_FD\r\n").unwrap();
        assert_eq!(relay.state(), AuthState::Complete);
    }

    #[test]
    fn extra_bytes_after_begin_are_preserved() {
        let mut relay = AuthRelay::new();
        relay.feed_client(b"AUTH EXTERNAL 31303030\r\n").unwrap();
        relay.feed_bus(b"OK 1234deadbeef\r\n").unwrap();
        relay.feed_client(b"BEGIN\r\nextra-binary-bytes").unwrap();
        assert_eq!(relay.take_client_extra(), b"extra-binary-bytes");
    }

    #[test]
    fn unsolicited_reply_errors() {
        let mut relay = AuthRelay::new();
        assert!(relay.feed_bus(b"REJECTED\r\n").is_err());
    }

    #[test]
    fn invalid_line_errors() {
        let mut relay = AuthRelay::new();
        assert!(relay.feed_client(b"lowercase\r\n").is_err());
    }

    #[test]
    fn overflow_without_begin_errors() {
        let mut relay = AuthRelay::new();
        let line = vec![b'A'; MAX_AUTH_BUFFER + 1];
        assert!(relay.feed_client(&line).is_err());
    }
}
