//! Call classification (§4.5), reply/broadcast filtering (§4.6) and the synthesized
//! round-trip rewrite pipeline that lets the proxy answer a denied call without
//! breaking the client's one-reply-per-serial contract.

use dbus_proxy_wire::header::{Endian, HeaderFlags};
use dbus_proxy_wire::message::{self, CannedBody, Synthesized};
use dbus_proxy_wire::{Buffer, Header, MessageType, WireResult};
use enumflags2::BitFlags;

use crate::client::Client;
use crate::policy::{Filters, PolicyLevel, RuleType};
use crate::side::ExpectedReply;

const BUS_NAME: &str = "org.freedesktop.DBus";
const PEER_IFACE: &str = "org.freedesktop.DBus.Peer";

/// Copy the body bytes out of a completed message buffer (an owned copy, so the
/// buffer itself can be moved on into a forwarding queue right after, §4.5/§4.6).
fn body_bytes(header: &Header, buffer: &Buffer) -> Vec<u8> {
    let start = header.body_offset;
    let end = start + header.body_len as usize;
    buffer.data().get(start..end).map(|b| b.to_vec()).unwrap_or_default()
}

/// What to substitute for a denied call whose client expects a reply, preserved until
/// the round-trip ping's answer arrives (§3 `rewrite_reply`, §4.5, §9 "Canned reply
/// table": serialized bytes rather than a live message object).
#[derive(Debug, Clone)]
pub enum CannedReply {
    Error(&'static str),
    Bool(bool),
    Name(Option<String>),
}

impl CannedReply {
    fn into_message(self, reply_serial: u32) -> Synthesized {
        match self {
            CannedReply::Error(name) => Synthesized {
                message_type: MessageType::Error,
                serial: 0,
                path: None,
                interface: None,
                member: None,
                error_name: Some(name.to_owned()),
                destination: None,
                reply_serial: Some(reply_serial),
                body: CannedBody::Empty,
                unix_fds: None,
                no_reply_expected: false,
            },
            CannedReply::Bool(b) => Synthesized {
                message_type: MessageType::MethodReturn,
                serial: 0,
                path: None,
                interface: None,
                member: None,
                error_name: None,
                destination: None,
                reply_serial: Some(reply_serial),
                body: CannedBody::Bool(b),
                unix_fds: None,
                no_reply_expected: false,
            },
            CannedReply::Name(None) => Synthesized {
                message_type: MessageType::Error,
                serial: 0,
                path: None,
                interface: None,
                member: None,
                error_name: Some("org.freedesktop.DBus.Error.NameHasNoOwner".to_owned()),
                destination: None,
                reply_serial: Some(reply_serial),
                body: CannedBody::Empty,
                unix_fds: None,
                no_reply_expected: false,
            },
            CannedReply::Name(Some(owner)) => Synthesized {
                message_type: MessageType::MethodReturn,
                serial: 0,
                path: None,
                interface: None,
                member: None,
                error_name: None,
                destination: None,
                reply_serial: Some(reply_serial),
                body: CannedBody::StringName(owner),
                unix_fds: None,
                no_reply_expected: false,
            },
        }
    }
}

/// Outcome of classifying and dispatching one outgoing client call (§4.5 step 6).
pub enum ClientAction {
    /// Forward the original buffer to the bus unchanged.
    Forward(Buffer),
    /// Drop silently: either denied with no reply expected, or an unsolicited/unknown
    /// reply.
    Drop,
    /// Replace the call with a `Peer.Ping` carrying the same serial; the canned reply
    /// it stands in for has already been recorded under that serial and will be
    /// substituted when the ping answers.
    SubstituteRoundTrip { ping: Buffer },
}

/// Required minimum policy level for a bus method that targets a name argument
/// (§4.5's VALIDATE_OWN / VALIDATE_TALK / VALIDATE_SEE rows).
#[derive(Debug, Clone, Copy)]
enum Validate {
    Own,
    Talk,
    See,
}

enum Handler {
    Pass,
    Deny,
    Hide,
    ValidateMatch,
    Validate(Validate),
    FilterHasOwnerReply,
    FilterGetOwnerReply,
    FilterNameListReply,
}

/// Classify an outgoing client call per the §4.5 dispatch table.
fn classify(header: &Header, client: &Client, filters: &Filters) -> Handler {
    if let Some(reply_serial) = header.reply_serial {
        return if client.side(crate::client::BUS_SIDE).has_expected_reply(reply_serial) {
            Handler::Pass
        } else {
            Handler::Deny
        };
    }

    let destination = header.destination.as_ref().map(|d| d.as_str()).unwrap_or("");
    let dest_policy = policy_for_destination(destination, client, filters);

    if dest_policy < PolicyLevel::See {
        return Handler::Hide;
    }
    if dest_policy < PolicyLevel::Talk {
        return Handler::Deny;
    }

    if !header.is_for_bus() {
        let (_, matched) = filters.max_policy_and_matched(destination);
        let matches_a_call_rule = matched.iter().any(|rule| {
            rule.matches_call(
                RuleType::Call.into(),
                header.path.as_ref().map(|p| p.as_str()),
                header.interface.as_ref().map(|i| i.as_str()),
                header.member_name(),
            )
        });
        return if dest_policy == PolicyLevel::Own || matches_a_call_rule {
            Handler::Pass
        } else {
            Handler::Deny
        };
    }

    if header.is_introspection_call() {
        return Handler::Pass;
    }

    if !header.is_dbus_method_call() {
        return Handler::Deny;
    }

    match header.member_name() {
        Some("AddMatch") => Handler::ValidateMatch,
        Some("Hello") | Some("RemoveMatch") | Some("GetId") => Handler::Pass,
        Some("UpdateActivationEnvironment") | Some("BecomeMonitor") => Handler::Deny,
        Some("RequestName") | Some("ReleaseName") | Some("ListQueuedOwners") => {
            Handler::Validate(Validate::Own)
        }
        Some("NameHasOwner") => Handler::FilterHasOwnerReply,
        Some("GetNameOwner") => Handler::FilterGetOwnerReply,
        Some(
            "GetConnectionUnixProcessID"
            | "GetConnectionCredentials"
            | "GetConnectionUnixUser"
            | "GetConnectionSELinuxSecurityContext"
            | "GetAdtAuditSessionData",
        ) => Handler::Validate(Validate::See),
        Some("StartServiceByName") => Handler::Validate(Validate::Talk),
        Some("ListNames") | Some("ListActivatableNames") => Handler::FilterNameListReply,
        _ => Handler::Deny,
    }
}

fn policy_for_destination(destination: &str, client: &Client, filters: &Filters) -> PolicyLevel {
    if destination.starts_with(':') {
        let own = client.unique_policy(destination);
        filters.max_policy_for_unique(own, client.owned_names(destination))
    } else {
        filters.max_policy(destination)
    }
}

/// Build the `Peer.Ping` that stands in for a denied/rewritten call, carrying the
/// client's original serial (§4.5 "Synthesized round trip").
fn build_ping(serial: u32, destination: &str) -> Buffer {
    let msg = Synthesized {
        message_type: MessageType::MethodCall,
        serial,
        path: Some("/org/freedesktop/DBus/Peer".to_owned()),
        interface: Some(PEER_IFACE.to_owned()),
        member: Some("Ping".to_owned()),
        error_name: None,
        destination: Some(destination.to_owned()),
        reply_serial: None,
        body: CannedBody::Empty,
        unix_fds: None,
        no_reply_expected: false,
    };
    Buffer::from_bytes(msg.into_bytes())
}

/// HIDE semantics pick between `NameHasNoOwner` and `ServiceUnknown` depending on whether
/// the bus would have tried to auto-start the destination (§4.5 step 6): a unique name or
/// a call carrying `NO_AUTO_START` can never trigger activation, so it gets the same
/// "no owner" answer `GetNameOwner` would; a well-known name the bus would auto-start
/// gets the answer real activation failure would produce.
fn hide_or_deny_reply(hide: bool, destination: &str, flags: BitFlags<HeaderFlags>) -> CannedReply {
    if hide {
        if destination.starts_with(':') || flags.contains(HeaderFlags::NoAutoStart) {
            CannedReply::Error("org.freedesktop.DBus.Error.NameHasNoOwner")
        } else {
            CannedReply::Error("org.freedesktop.DBus.Error.ServiceUnknown")
        }
    } else {
        CannedReply::Error("org.freedesktop.DBus.Error.AccessDenied")
    }
}

/// Substitute a round trip for a denied call, or drop it outright if no reply is
/// expected (§4.5 step 6 VALIDATE_*/HIDE/DENY).
fn deny_or_hide(client: &mut Client, header: &Header, canned: CannedReply, destination: &str) -> ClientAction {
    if !header.client_message_generates_reply() {
        return ClientAction::Drop;
    }
    client.rewrite_reply.insert(header.serial, canned);
    client
        .side_mut(crate::client::BUS_SIDE)
        .record_expected_reply(header.serial, ExpectedReply::Rewrite);
    ClientAction::SubstituteRoundTrip {
        ping: build_ping(header.serial, destination),
    }
}

/// Process one outgoing client call: classify it, then dispatch per the handler table
/// (§4.5 steps 1-6). `filter_enabled` is `Proxy.filter`; when false every call passes
/// through unfiltered except the serial/fd bookkeeping.
pub fn handle_client_to_bus(
    client: &mut Client,
    filters: &Filters,
    filter_enabled: bool,
    header: &Header,
    buffer: Buffer,
) -> WireResult<ClientAction> {
    let body = body_bytes(header, &buffer);
    let body = body.as_slice();
    if header.member_name() == Some("Hello") && header.is_dbus_method_call() {
        client.hello_serial = Some(header.serial);
    }

    if !filter_enabled {
        if header.client_message_generates_reply() {
            client
                .side_mut(crate::client::BUS_SIDE)
                .record_expected_reply(header.serial, reply_kind_for(header));
        }
        return Ok(ClientAction::Forward(buffer));
    }

    let handler = classify(header, client, filters);
    let destination = header.destination.as_ref().map(|d| d.as_str()).unwrap_or(BUS_NAME);

    let action = match handler {
        Handler::Pass => {
            if header.client_message_generates_reply() {
                client
                    .side_mut(crate::client::BUS_SIDE)
                    .record_expected_reply(header.serial, reply_kind_for(header));
            }
            ClientAction::Forward(buffer)
        }
        Handler::Deny => deny_or_hide(client, header, hide_or_deny_reply(false, destination, header.flags), destination),
        Handler::Hide => deny_or_hide(client, header, hide_or_deny_reply(true, destination, header.flags), destination),
        Handler::ValidateMatch => {
            let arg = message::first_string_arg(body, header.endian)?;
            if arg.as_deref().map(|s| s.contains("eavesdrop=")).unwrap_or(false) {
                deny_or_hide(client, header, hide_or_deny_reply(false, destination, header.flags), destination)
            } else {
                if header.client_message_generates_reply() {
                    client
                        .side_mut(crate::client::BUS_SIDE)
                        .record_expected_reply(header.serial, ExpectedReply::Normal);
                }
                ClientAction::Forward(buffer)
            }
        }
        Handler::Validate(which) => {
            let required = match which {
                Validate::Own => PolicyLevel::Own,
                Validate::Talk => PolicyLevel::Talk,
                Validate::See => PolicyLevel::See,
            };
            let target = message::first_string_arg(body, header.endian)?;
            let target_policy = target
                .as_deref()
                .map(|name| policy_for_destination(name, client, filters))
                .unwrap_or(PolicyLevel::None);
            if target_policy >= required {
                if header.client_message_generates_reply() {
                    client
                        .side_mut(crate::client::BUS_SIDE)
                        .record_expected_reply(header.serial, ExpectedReply::Normal);
                }
                ClientAction::Forward(buffer)
            } else {
                let subject = target.as_deref().unwrap_or("");
                let reply = hide_or_deny_reply(target_policy < PolicyLevel::See, subject, header.flags);
                deny_or_hide(client, header, reply, destination)
            }
        }
        Handler::FilterHasOwnerReply => {
            let target = message::first_string_arg(body, header.endian)?;
            let target_policy = target
                .as_deref()
                .map(|name| policy_for_destination(name, client, filters))
                .unwrap_or(PolicyLevel::None);
            if target_policy < PolicyLevel::See {
                deny_or_hide(client, header, CannedReply::Bool(false), destination)
            } else {
                client
                    .side_mut(crate::client::BUS_SIDE)
                    .record_expected_reply(header.serial, ExpectedReply::FilterHasOwnerReply);
                ClientAction::Forward(buffer)
            }
        }
        Handler::FilterGetOwnerReply => {
            let target = message::first_string_arg(body, header.endian)?;
            let target_policy = target
                .as_deref()
                .map(|name| policy_for_destination(name, client, filters))
                .unwrap_or(PolicyLevel::None);
            if target_policy < PolicyLevel::See {
                let reply = CannedReply::Error("org.freedesktop.DBus.Error.NameHasNoOwner");
                deny_or_hide(client, header, reply, destination)
            } else {
                client
                    .side_mut(crate::client::BUS_SIDE)
                    .record_expected_reply(header.serial, ExpectedReply::FilterGetOwnerReply);
                ClientAction::Forward(buffer)
            }
        }
        Handler::FilterNameListReply => {
            client
                .side_mut(crate::client::BUS_SIDE)
                .record_expected_reply(header.serial, ExpectedReply::ListNames);
            ClientAction::Forward(buffer)
        }
    };

    Ok(action)
}

fn reply_kind_for(header: &Header) -> ExpectedReply {
    if header.member_name() == Some("Hello") && header.is_dbus_method_call() {
        ExpectedReply::Hello
    } else {
        ExpectedReply::Normal
    }
}

/// Outcome of processing one incoming bus message (§4.6).
pub enum BusAction {
    Forward(Buffer),
    Drop,
    /// A `FakeListNames` round trip answered; re-enable the client-side reader.
    DropAndResumeClientReads,
}

/// Process one incoming bus message: reply-serial dispatch, `NameOwnerChanged`
/// handling, and broadcast filtering (§4.6).
pub fn handle_bus_to_client(
    client: &mut Client,
    filters: &Filters,
    filter_enabled: bool,
    sloppy_names: bool,
    header: &Header,
    buffer: Buffer,
) -> WireResult<BusAction> {
    if !filter_enabled {
        return Ok(BusAction::Forward(buffer));
    }

    let body = body_bytes(header, &buffer);
    let body = body.as_slice();

    if let Some(reply_serial) = header.reply_serial {
        let expectation = client
            .side_mut(crate::client::BUS_SIDE)
            .take_expected_reply(reply_serial);
        return Ok(match expectation {
            None => BusAction::Drop,
            Some(ExpectedReply::Hello) => {
                if header.message_type == MessageType::MethodReturn {
                    if let Some(unique_name) = message::first_string_arg(body, header.endian)? {
                        client.raise_unique_policy(&unique_name, PolicyLevel::Talk);
                    }
                }
                BusAction::Forward(buffer)
            }
            Some(ExpectedReply::Rewrite) => match client.rewrite_reply.remove(&reply_serial) {
                None => BusAction::Drop,
                Some(canned) => {
                    let reply = canned.into_message(reply_serial);
                    BusAction::Forward(Buffer::from_bytes(reply.into_bytes()))
                }
            },
            Some(ExpectedReply::Filter) => BusAction::Drop,
            Some(ExpectedReply::FakeListNames) => BusAction::DropAndResumeClientReads,
            Some(ExpectedReply::FakeGetNameOwner(name)) => {
                if header.message_type == MessageType::MethodReturn {
                    if let Some(owner) = message::first_string_arg(body, header.endian)? {
                        client.record_ownership(&owner, &name);
                    }
                }
                BusAction::Drop
            }
            Some(ExpectedReply::FilterHasOwnerReply) => BusAction::Forward(buffer),
            Some(ExpectedReply::FilterGetOwnerReply) => BusAction::Forward(buffer),
            Some(ExpectedReply::ListNames) => {
                let names = message::string_array(body, header.endian)?;
                let visible: Vec<String> = names
                    .into_iter()
                    .filter(|n| filters.max_policy(n) >= PolicyLevel::See)
                    .collect();
                let reply = Synthesized {
                    message_type: MessageType::MethodReturn,
                    serial: 0,
                    path: None,
                    interface: None,
                    member: None,
                    error_name: None,
                    destination: None,
                    reply_serial: Some(reply_serial),
                    body: CannedBody::StringArray(visible),
                    unix_fds: None,
                    no_reply_expected: false,
                };
                BusAction::Forward(Buffer::from_bytes(reply.into_bytes()))
            }
            Some(ExpectedReply::Normal) => BusAction::Forward(buffer),
        });
    }

    if matches!(header.message_type, MessageType::MethodReturn | MessageType::Error) {
        return Ok(BusAction::Drop);
    }

    if header.message_type == MessageType::Signal {
        if header.member_name() == Some("NameOwnerChanged")
            && header.interface.as_ref().map(|i| i.as_str()) == Some(BUS_NAME)
        {
            if let Some((name, _old, new)) = parse_name_owner_changed(body, header.endian) {
                let visible = filters.max_policy(&name) >= PolicyLevel::See
                    || (sloppy_names && name.starts_with(':'));
                if !new.is_empty() {
                    client.record_ownership(&new, &name);
                }
                if !visible {
                    return Ok(BusAction::Drop);
                }
                return Ok(BusAction::Forward(buffer));
            }
        }

        if header.destination.is_none() {
            let sender = header.sender.as_ref().map(|s| s.as_str()).unwrap_or("");
            let (sender_policy, matched) = filters.max_policy_and_matched(sender);
            let matches_broadcast = matched.iter().any(|rule| {
                rule.matches_call(
                    RuleType::Broadcast.into(),
                    header.path.as_ref().map(|p| p.as_str()),
                    header.interface.as_ref().map(|i| i.as_str()),
                    header.member_name(),
                )
            });
            if sender_policy < PolicyLevel::Talk && !matches_broadcast {
                return Ok(BusAction::Drop);
            }
        }
    }

    if let Some(sender) = &header.sender {
        if sender.as_str().starts_with(':') {
            client.raise_unique_policy(sender.as_str(), PolicyLevel::See);
        }
    }

    Ok(BusAction::Forward(buffer))
}

fn parse_name_owner_changed(body: &[u8], endian: Endian) -> Option<(String, String, String)> {
    let mut offset = 0usize;
    let name = read_string_at(body, endian, &mut offset)?;
    let old = read_string_at(body, endian, &mut offset)?;
    let new = read_string_at(body, endian, &mut offset)?;
    Some((name, old, new))
}

fn read_string_at(body: &[u8], endian: Endian, offset: &mut usize) -> Option<String> {
    if *offset + 4 > body.len() {
        return None;
    }
    let len = endian.read_u32(body, *offset) as usize;
    let start = *offset + 4;
    let end = start.checked_add(len)?;
    if end >= body.len() {
        return None;
    }
    let s = std::str::from_utf8(&body[start..end]).ok()?.to_owned();
    *offset = end + 1;
    Some(s)
}
