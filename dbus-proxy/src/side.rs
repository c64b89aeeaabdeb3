//! One end of a client↔bus pair: owning socket, read/write buffers, and the table of
//! serials awaiting replies (§3 "Side", §4.1).

use std::collections::{HashMap, VecDeque};
use std::os::unix::net::UnixStream;

use dbus_proxy_wire::{Buffer, WireResult};

use crate::auth::AuthState;

/// What kind of reply a recorded serial is waiting for (§3 `Side` serial table, §4.5,
/// §4.6). `Hello`/`FakeGetNameOwner` carry the extra data those handlers need.
#[derive(Debug, Clone)]
pub enum ExpectedReply {
    /// An ordinary forwarded call; pass the reply through unchanged.
    Normal,
    /// This serial was the client's `Hello`; the reply's first argument is this
    /// connection's own unique name (§4.5 step 4, §4.6 step 2).
    Hello,
    /// A synthesized round-trip ping standing in for a denied/rewritten call; look up
    /// the canned reply keyed by this serial (§4.5 "Synthesized round trip").
    Rewrite,
    /// A synthesized `AddMatch` issued during the initial burst (§4.7); its reply is
    /// always dropped.
    Filter,
    /// A synthesized `ListNames()` issued during the initial burst for subtree
    /// discovery (§4.7); dropped, and re-enables the client-side reader.
    FakeListNames,
    /// A synthesized `GetNameOwner(NAME)` issued during the initial burst; on success,
    /// associates the returned unique name with `NAME` (§4.6 step 2, §4.7).
    FakeGetNameOwner(String),
    /// The client's own `NameHasOwner` call, to be answered with a filtered boolean.
    FilterHasOwnerReply,
    /// The client's own `GetNameOwner` call, to be answered with a filtered owner name.
    FilterGetOwnerReply,
    /// The client's own `ListNames`/`ListActivatableNames` call; filter the returned
    /// array down to names visible at SEE or above (§4.6 step 2 LIST_NAMES).
    ListNames,
}

/// The largest serial a real client may use; serials above this are reserved for
/// proxy-synthesized bus calls (§3, §8).
pub const MAX_CLIENT_SERIAL: u32 = u32::MAX - 65536;

/// One direction of a client↔bus pair (§3 "Side").
pub struct Side {
    socket: UnixStream,
    /// Current read buffer: starts as the 16-byte header buffer, swapped to a sized
    /// body buffer once the message length is known, then reset (§4.1).
    read_buffer: Buffer,
    reading_header: bool,
    outgoing: VecDeque<Buffer>,
    expected_replies: HashMap<u32, ExpectedReply>,
    /// True once the leading credential byte has been observed; the bus side starts
    /// true because it is this process that sends credentials on that side (§3).
    got_first_byte: bool,
    closed: bool,
    /// Client-side reads are stalled while auth is `WaitingForBacklog` (§4.1), or while
    /// a `FakeListNames` round trip from the initial burst is outstanding (§4.7).
    read_paused: bool,
}

impl Side {
    pub fn new(socket: UnixStream, starts_with_credentials_sent: bool) -> Self {
        socket.set_nonblocking(true).ok();
        Side {
            socket,
            read_buffer: Buffer::new_sized(dbus_proxy_wire::FIXED_HEADER_SIZE),
            reading_header: true,
            outgoing: VecDeque::new(),
            expected_replies: HashMap::new(),
            got_first_byte: starts_with_credentials_sent,
            closed: false,
            read_paused: false,
        }
    }

    pub fn socket(&self) -> &UnixStream {
        &self.socket
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn pause_reads(&mut self) {
        self.read_paused = true;
    }

    pub fn resume_reads(&mut self) {
        self.read_paused = false;
    }

    pub fn reads_paused(&self) -> bool {
        self.read_paused
    }

    pub fn got_first_byte(&self) -> bool {
        self.got_first_byte
    }

    pub fn mark_first_byte_seen(&mut self) {
        self.got_first_byte = true;
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outgoing.is_empty()
    }

    pub fn enqueue(&mut self, buf: Buffer) {
        self.outgoing.push_back(buf);
    }

    pub fn record_expected_reply(&mut self, serial: u32, kind: ExpectedReply) {
        self.expected_replies.insert(serial, kind);
    }

    pub fn has_expected_reply(&self, serial: u32) -> bool {
        self.expected_replies.contains_key(&serial)
    }

    /// Remove and return the expectation recorded for `serial`, if any (§4.6 step 2
    /// "steal the entry").
    pub fn take_expected_reply(&mut self, serial: u32) -> Option<ExpectedReply> {
        self.expected_replies.remove(&serial)
    }

    /// Drain one non-blocking write from the front of the outgoing queue. Returns
    /// `Ok(true)` if progress was made (§4.1 write contract).
    pub fn write_pump(&mut self) -> WireResult<bool> {
        let mut progressed = false;
        while let Some(front) = self.outgoing.front_mut() {
            if front.write_to(&self.socket)? {
                if front.is_send_complete() {
                    self.outgoing.pop_front();
                    progressed = true;
                    continue;
                }
            } else {
                break;
            }
            progressed = true;
        }
        Ok(progressed)
    }

    /// Attempt to read more bytes into the current read buffer (§4.1 read contract).
    /// Returns `Ok(true)` if the buffer completed this call; the completed buffer
    /// (and whether it was a header or a body) is left for the caller to fetch via
    /// [`Side::take_completed_header`]/[`Side::swap_in_body_buffer`].
    pub fn read_pump(&mut self, auth_state: Option<AuthState>) -> WireResult<bool> {
        if self.read_paused {
            return Ok(false);
        }
        if auth_state == Some(AuthState::WaitingForBacklog) {
            return Ok(false);
        }

        if !self.got_first_byte {
            let mut credential_buf = Buffer::new_sized(1);
            if credential_buf.read_from(&self.socket)? {
                self.got_first_byte = true;
                // The credential byte itself still needs forwarding; callers treat a
                // 1-byte completed buffer specially via `is_credential_probe`.
                self.read_buffer = credential_buf;
                return Ok(true);
            }
            return Ok(false);
        }

        self.read_buffer.read_from(&self.socket)
    }

    pub fn current_read_buffer(&self) -> &Buffer {
        &self.read_buffer
    }

    pub fn is_reading_header(&self) -> bool {
        self.reading_header
    }

    pub fn read_buffer_complete(&self) -> bool {
        self.read_buffer.is_read_complete()
    }

    /// After the 16-byte header buffer completes and its total message length has been
    /// probed, grow into a body buffer of that size, preserving the header prefix, and
    /// continue reading the body (§4.1).
    pub fn grow_to_body(&mut self, total_len: usize) {
        self.read_buffer.grow_to(total_len);
        self.reading_header = false;
    }

    /// Take the completed buffer and reset this side to read a fresh 16-byte header.
    pub fn take_completed_buffer(&mut self) -> Buffer {
        let completed = std::mem::replace(
            &mut self.read_buffer,
            Buffer::new_sized(dbus_proxy_wire::FIXED_HEADER_SIZE),
        );
        self.reading_header = true;
        completed
    }

    /// Seed extra bytes that arrived glued to the end of the auth handshake (§4.1,
    /// §4.2) directly into the current read buffer, as if they'd just been read.
    /// Returns any bytes that didn't fit (the caller re-queues them once the buffer
    /// this call completed has been drained and a fresh one is in place).
    pub fn seed_extra_input(&mut self, bytes: &[u8]) -> Vec<u8> {
        let consumed = self.read_buffer.fill_from_slice(bytes);
        bytes[consumed..].to_vec()
    }
}
