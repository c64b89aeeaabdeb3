//! Accepts connections, owns the filter table, and drives each [`Client`] through the
//! auth relay and the classify/forward pipeline (§3 "Proxy", §4, §4.7).

use std::collections::HashMap;
use std::os::unix::net::{UnixListener, UnixStream};

use dbus_proxy_wire::header::{self, Header};
use dbus_proxy_wire::{Buffer, WireError, WireResult};
use tracing::{debug, trace, warn};

use crate::auth::AuthState;
use crate::client::{Client, SideId, BUS_SIDE, CLIENT_SIDE};
use crate::policy::Filters;
use crate::rewrite::{self, BusAction, ClientAction};
use crate::side::ExpectedReply;

/// Opaque token identifying one accepted connection (§3 "Proxy" client list).
pub type ClientId = usize;

pub struct Proxy {
    listener: UnixListener,
    bus_address: String,
    pub filter: bool,
    pub log: bool,
    pub sloppy_names: bool,
    filters: Filters,
    clients: HashMap<ClientId, Client>,
    next_client_id: ClientId,
}

impl Proxy {
    pub fn bind(
        socket_path: &str,
        bus_address: String,
        filter: bool,
        log: bool,
        sloppy_names: bool,
        filters: Filters,
    ) -> WireResult<Self> {
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path)?;
        listener.set_nonblocking(true)?;
        Ok(Proxy {
            listener,
            bus_address,
            filter,
            log,
            sloppy_names,
            filters,
            clients: HashMap::new(),
            next_client_id: 0,
        })
    }

    pub fn listener(&self) -> &UnixListener {
        &self.listener
    }

    pub fn bus_address(&self) -> &str {
        &self.bus_address
    }

    pub fn clients(&self) -> impl Iterator<Item = (&ClientId, &Client)> {
        self.clients.iter()
    }

    pub fn clients_mut(&mut self) -> impl Iterator<Item = (&ClientId, &mut Client)> {
        self.clients.iter_mut()
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    /// Accept one pending connection and pair it with a freshly connected bus stream.
    /// `connect_bus` is the external transport-address connector (§1, §6): an opaque
    /// collaborator this crate does not implement.
    pub fn accept_one(
        &mut self,
        connect_bus: impl FnOnce(&str) -> WireResult<UnixStream>,
    ) -> WireResult<Option<ClientId>> {
        let (client_socket, _addr) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(WireError::Io(e)),
        };
        let bus_socket = connect_bus(&self.bus_address)?;
        bus_socket.set_nonblocking(true)?;

        let id = self.next_client_id;
        self.next_client_id += 1;
        debug!(client = id, "accepted connection");
        self.clients.insert(id, Client::new(client_socket, bus_socket));
        Ok(Some(id))
    }

    /// Drop every client that has fully drained and closed both sides (§5
    /// "Cancellation").
    pub fn reap_closed_clients(&mut self) -> Vec<ClientId> {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.can_be_released())
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            self.clients.remove(id);
            trace!(client = id, "released");
        }
        dead
    }

    pub fn remove_client(&mut self, id: ClientId) {
        self.clients.remove(&id);
    }

    /// Pump one side's socket: read what's available, process completed messages, and
    /// write out whatever is queued. Returns `true` if the side made progress.
    pub fn service_side(&mut self, id: ClientId, side_id: SideId) -> WireResult<bool> {
        let Some(client) = self.clients.get_mut(&id) else {
            return Ok(false);
        };

        let wrote = client.side_mut(side_id).write_pump()?;

        let auth_state = if side_id == CLIENT_SIDE {
            Some(client.auth.state())
        } else {
            None
        };
        let read = self.pump_reads(id, side_id, auth_state)?;

        Ok(wrote || read)
    }

    fn pump_reads(&mut self, id: ClientId, side_id: SideId, auth_state: Option<AuthState>) -> WireResult<bool> {
        let mut progressed = false;
        loop {
            let Some(client) = self.clients.get_mut(&id) else { break };
            let side = client.side_mut(side_id);
            if side.is_closed() {
                break;
            }

            let moved = match side.read_pump(auth_state) {
                Ok(m) => m,
                Err(e) => {
                    warn!(client = id, side = side_id.0, error = %e, "closing side after read error");
                    side.close();
                    break;
                }
            };
            if !moved {
                break;
            }
            progressed = true;

            if !side.read_buffer_complete() {
                continue;
            }

            if let Err(e) = self.handle_completed_buffer(id, side_id) {
                warn!(client = id, side = side_id.0, error = %e, "closing side after framing error");
                if let Some(client) = self.clients.get_mut(&id) {
                    client.side_mut(side_id).close();
                }
            }
        }
        Ok(progressed)
    }

    /// A read buffer on `side_id` just completed (either a 16-byte header, a full
    /// message body, or the one-byte credential probe). Advance the state machine.
    fn handle_completed_buffer(&mut self, id: ClientId, side_id: SideId) -> WireResult<()> {
        let client = self.clients.get_mut(&id).ok_or(WireError::HeaderTooShort)?;

        if client.side(side_id).is_reading_header() && client.side(side_id).current_read_buffer().size() == 1 {
            // The leading credential byte: forward verbatim, untouched by auth/policy.
            let buf = client.side_mut(side_id).take_completed_buffer();
            client.enqueue_on(side_id.other(), buf);
            return Ok(());
        }

        if !client.auth.is_complete() {
            return self.handle_auth_bytes(id, side_id);
        }

        if client.side(side_id).is_reading_header() {
            let buf = client.side(side_id).current_read_buffer();
            let total_len = header::probe_total_length(buf.data())?;
            client.side_mut(side_id).grow_to_body(total_len);
            return Ok(());
        }

        let buf = client.side_mut(side_id).take_completed_buffer();
        let header = header::parse(buf.data())?;
        self.dispatch_message(id, side_id, header, buf)
    }

    /// Feed raw bytes from a completed header-sized auth buffer through the auth
    /// relay, then reset the side to read the next 16 bytes (§4.2 treats the stream as
    /// line-oriented text, not framed messages, until `BEGIN`).
    fn handle_auth_bytes(&mut self, id: ClientId, side_id: SideId) -> WireResult<()> {
        let client = self.clients.get_mut(&id).ok_or(WireError::HeaderTooShort)?;
        let buf = client.side_mut(side_id).take_completed_buffer();
        let bytes = buf.data().to_vec();

        if side_id == CLIENT_SIDE {
            client.auth.feed_client(&bytes)?;
        } else {
            client.auth.feed_bus(&bytes)?;
        }

        // Forward the raw bytes verbatim: the bus/client still needs to see the
        // handshake text even though the proxy is only watching line boundaries.
        client.enqueue_on(side_id.other(), Buffer::from_bytes(bytes));

        if client.auth.is_complete() {
            let client_extra = client.auth.take_client_extra();
            let bus_extra = client.auth.take_bus_extra();
            if !client_extra.is_empty() {
                let leftover = client.side_mut(CLIENT_SIDE).seed_extra_input(&client_extra);
                debug_assert!(leftover.is_empty(), "auth extra input larger than one header buffer");
            }
            if !bus_extra.is_empty() {
                let leftover = client.side_mut(BUS_SIDE).seed_extra_input(&bus_extra);
                debug_assert!(leftover.is_empty(), "auth extra input larger than one header buffer");
            }
        } else if client.auth.state() == AuthState::WaitingForBacklog {
            client.side_mut(CLIENT_SIDE).pause_reads();
        }

        if client.auth.state() != AuthState::WaitingForBacklog {
            client.side_mut(CLIENT_SIDE).resume_reads();
        }

        Ok(())
    }

    fn dispatch_message(
        &mut self,
        id: ClientId,
        side_id: SideId,
        header: Header,
        mut buf: Buffer,
    ) -> WireResult<()> {
        let client = self.clients.get_mut(&id).ok_or(WireError::HeaderTooShort)?;

        let declared_fds = header.unix_fds as usize;
        let received = buf.take_ancillary();
        if received.len() != declared_fds {
            return Err(WireError::FdCountMismatch {
                declared: header.unix_fds,
                received: received.len(),
            });
        }
        buf.attach_ancillary(received);

        if side_id == CLIENT_SIDE {
            if header.serial > crate::side::MAX_CLIENT_SERIAL {
                return Err(WireError::SerialOutOfRange(header.serial));
            }

            let was_hello = header.member_name() == Some("Hello") && header.is_dbus_method_call();
            let action = rewrite::handle_client_to_bus(client, &self.filters, self.filter, &header, buf)?;
            match action {
                ClientAction::Forward(buf) => client.enqueue_on(BUS_SIDE, buf),
                ClientAction::Drop => {}
                ClientAction::SubstituteRoundTrip { ping } => client.enqueue_on(BUS_SIDE, ping),
            }
            if was_hello && self.filter {
                self.emit_initial_burst(id);
            }
        } else {
            let action = rewrite::handle_bus_to_client(
                client,
                &self.filters,
                self.filter,
                self.sloppy_names,
                &header,
                buf,
            )?;
            match action {
                BusAction::Forward(buf) => client.enqueue_on(CLIENT_SIDE, buf),
                BusAction::Drop => {}
                BusAction::DropAndResumeClientReads => {
                    client.side_mut(CLIENT_SIDE).resume_reads();
                }
            }
        }
        Ok(())
    }

    /// Once the client's `Hello` has been forwarded, synthesize the `AddMatch` /
    /// `GetNameOwner` / `ListNames` burst that seeds name-ownership tracking (§4.7).
    fn emit_initial_burst(&mut self, id: ClientId) {
        let entries: Vec<(String, bool)> = self.configured_filter_names();
        let Some(client) = self.clients.get_mut(&id) else { return };

        let mut has_subtree = false;

        for (name, is_subtree) in &entries {
            if *is_subtree {
                has_subtree = true;
            }
            let serial = client.next_fake_serial();
            let arg0 = if *is_subtree {
                format!("arg0namespace='{name}'")
            } else {
                format!("arg0='{name}'")
            };
            let add_match = dbus_proxy_wire::message::Synthesized {
                message_type: dbus_proxy_wire::MessageType::MethodCall,
                serial,
                path: Some("/org/freedesktop/DBus".to_owned()),
                interface: Some("org.freedesktop.DBus".to_owned()),
                member: Some("AddMatch".to_owned()),
                error_name: None,
                destination: Some("org.freedesktop.DBus".to_owned()),
                reply_serial: None,
                body: dbus_proxy_wire::message::CannedBody::StringName(format!(
                    "type='signal',sender='org.freedesktop.DBus',interface='org.freedesktop.DBus',member='NameOwnerChanged',{arg0}"
                )),
                unix_fds: None,
                no_reply_expected: false,
            };
            client
                .side_mut(BUS_SIDE)
                .record_expected_reply(serial, ExpectedReply::Filter);
            client.enqueue_on(BUS_SIDE, Buffer::from_bytes(add_match.into_bytes()));

            if !is_subtree {
                let serial = client.next_fake_serial();
                let get_owner = dbus_proxy_wire::message::Synthesized {
                    message_type: dbus_proxy_wire::MessageType::MethodCall,
                    serial,
                    path: Some("/org/freedesktop/DBus".to_owned()),
                    interface: Some("org.freedesktop.DBus".to_owned()),
                    member: Some("GetNameOwner".to_owned()),
                    error_name: None,
                    destination: Some("org.freedesktop.DBus".to_owned()),
                    reply_serial: None,
                    body: dbus_proxy_wire::message::CannedBody::StringName(name.clone()),
                    unix_fds: None,
                    no_reply_expected: false,
                };
                client.get_owner_reply.insert(serial, name.clone());
                client
                    .side_mut(BUS_SIDE)
                    .record_expected_reply(serial, ExpectedReply::FakeGetNameOwner(name.clone()));
                client.enqueue_on(BUS_SIDE, Buffer::from_bytes(get_owner.into_bytes()));
            }
        }

        if has_subtree {
            let serial = client.next_fake_serial();
            let list_names = dbus_proxy_wire::message::Synthesized {
                message_type: dbus_proxy_wire::MessageType::MethodCall,
                serial,
                path: Some("/org/freedesktop/DBus".to_owned()),
                interface: Some("org.freedesktop.DBus".to_owned()),
                member: Some("ListNames".to_owned()),
                error_name: None,
                destination: Some("org.freedesktop.DBus".to_owned()),
                reply_serial: None,
                body: dbus_proxy_wire::message::CannedBody::Empty,
                unix_fds: None,
                no_reply_expected: false,
            };
            client
                .side_mut(BUS_SIDE)
                .record_expected_reply(serial, ExpectedReply::FakeListNames);
            client.side_mut(CLIENT_SIDE).pause_reads();
            client.enqueue_on(BUS_SIDE, Buffer::from_bytes(list_names.into_bytes()));
        }
    }

    fn configured_filter_names(&self) -> Vec<(String, bool)> {
        self.filters.configured_names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_id_other_flips() {
        assert_eq!(CLIENT_SIDE.other(), BUS_SIDE);
        assert_eq!(BUS_SIDE.other(), CLIENT_SIDE);
    }

    /// `Hello` call that declares more unix fds than will actually be attached, to
    /// exercise the mismatch check in `dispatch_message` directly (§4.3 "fd count must
    /// match"), built through the same `Synthesized` encoder production code uses.
    fn build_hello_with_declared_fds(serial: u32, unix_fds: u32) -> Vec<u8> {
        dbus_proxy_wire::message::Synthesized {
            message_type: dbus_proxy_wire::MessageType::MethodCall,
            serial,
            path: Some("/org/freedesktop/DBus".to_owned()),
            interface: Some("org.freedesktop.DBus".to_owned()),
            member: Some("Hello".to_owned()),
            error_name: None,
            destination: Some("org.freedesktop.DBus".to_owned()),
            reply_serial: None,
            body: dbus_proxy_wire::message::CannedBody::Empty,
            unix_fds: Some(unix_fds),
            no_reply_expected: false,
        }
        .into_bytes()
    }

    #[test]
    fn fd_count_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("proxy.sock");
        let mut proxy = Proxy::bind(
            sock_path.to_str().unwrap(),
            "unused:bus:address".to_owned(),
            true,
            false,
            false,
            Filters::new(),
        )
        .unwrap();

        let (client_sock, bus_sock) = UnixStream::pair().unwrap();
        proxy.clients.insert(0, Client::new(client_sock, bus_sock));

        let bytes = build_hello_with_declared_fds(7, 2);
        let header = header::parse(&bytes).unwrap();
        let buffer = Buffer::from_bytes(bytes);

        let result = proxy.dispatch_message(0, CLIENT_SIDE, header, buffer);
        assert!(matches!(
            result,
            Err(WireError::FdCountMismatch { declared: 2, received: 0 })
        ));
    }
}
