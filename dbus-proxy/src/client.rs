//! A single accepted connection: a client side, a bus side, the auth relay between
//! them, and the name-tracking/rewrite state the policy engine consults (§3 "Client").

use std::collections::HashMap;
use std::os::unix::net::UnixStream;

use dbus_proxy_wire::Buffer;

use crate::auth::AuthRelay;
use crate::policy::PolicyLevel;
use crate::rewrite::CannedReply;
use crate::side::{Side, MAX_CLIENT_SERIAL};

/// Index into [`Client::sides`]; 0 is the client-facing side, 1 is the bus-facing side
/// (§9 "Sibling references": integer index instead of a raw back-pointer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideId(pub usize);

pub const CLIENT_SIDE: SideId = SideId(0);
pub const BUS_SIDE: SideId = SideId(1);

impl SideId {
    pub fn other(self) -> SideId {
        SideId(1 - self.0)
    }
}

pub struct Client {
    sides: [Side; 2],
    pub auth: AuthRelay,
    pub hello_serial: Option<u32>,
    next_fake_serial: u32,
    /// serial -> canned reply to substitute when its round-trip ping answers (§4.5
    /// "Synthesized round trip").
    pub rewrite_reply: HashMap<u32, CannedReply>,
    /// serial -> well-known name, for synthesized `GetNameOwner` calls issued during
    /// the initial burst (§4.7).
    pub get_owner_reply: HashMap<u32, String>,
    pub unique_id_policy: HashMap<String, PolicyLevel>,
    pub unique_id_owned_names: HashMap<String, Vec<String>>,
}

impl Client {
    pub fn new(client_socket: UnixStream, bus_socket: UnixStream) -> Self {
        Client {
            sides: [
                Side::new(client_socket, false),
                Side::new(bus_socket, true),
            ],
            auth: AuthRelay::new(),
            hello_serial: None,
            next_fake_serial: MAX_CLIENT_SERIAL + 1,
            rewrite_reply: HashMap::new(),
            get_owner_reply: HashMap::new(),
            unique_id_policy: HashMap::new(),
            unique_id_owned_names: HashMap::new(),
        }
    }

    pub fn side(&self, id: SideId) -> &Side {
        &self.sides[id.0]
    }

    pub fn side_mut(&mut self, id: SideId) -> &mut Side {
        &mut self.sides[id.0]
    }

    pub fn is_closed(&self) -> bool {
        self.sides[0].is_closed() && self.sides[1].is_closed()
    }

    /// The fully-closed-on-both-sides-with-nothing-left-to-drain condition under which
    /// the client object itself may be released (§5 "Cancellation").
    pub fn can_be_released(&self) -> bool {
        self.sides
            .iter()
            .all(|s| s.is_closed() && !s.has_pending_writes())
    }

    /// Close one side, marking it for teardown once its outgoing queue drains (§5).
    pub fn close_side(&mut self, id: SideId) {
        self.sides[id.0].close();
    }

    /// Allocate the next fake serial, strictly increasing from the top of the
    /// reserved region, for a synthesized bus call (§3 "fake-serial counter", §4.7,
    /// §8 "every synthesized serial is strictly greater than MAX_CLIENT_SERIAL").
    pub fn next_fake_serial(&mut self) -> u32 {
        let serial = self.next_fake_serial;
        self.next_fake_serial = self.next_fake_serial.saturating_add(1);
        serial
    }

    /// Raise `unique_id_policy[name]` to at least `level` (monotonic, §3, §8).
    pub fn raise_unique_policy(&mut self, name: &str, level: PolicyLevel) {
        let entry = self.unique_id_policy.entry(name.to_owned()).or_insert(PolicyLevel::None);
        if level > *entry {
            *entry = level;
        }
    }

    pub fn unique_policy(&self, name: &str) -> PolicyLevel {
        self.unique_id_policy.get(name).copied().unwrap_or(PolicyLevel::None)
    }

    /// Record that well-known `name` is now owned by unique name `owner` (§4.6 step 4,
    /// §4.6 step 2 FAKE_GET_NAME_OWNER, §9 open question: acquisitions only, never
    /// retracted on release — see DESIGN.md).
    pub fn record_ownership(&mut self, owner: &str, name: &str) {
        let names = self.unique_id_owned_names.entry(owner.to_owned()).or_default();
        if !names.iter().any(|n| n == name) {
            names.push(name.to_owned());
        }
    }

    pub fn owned_names(&self, owner: &str) -> &[String] {
        self.unique_id_owned_names
            .get(owner)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn enqueue_on(&mut self, id: SideId, buf: Buffer) {
        self.sides[id.0].enqueue(buf);
    }
}
