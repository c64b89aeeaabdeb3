//! The binary message header: endian-marked fixed header, variable-length field array,
//! and the handful of derived predicates the policy engine needs (§4.3).
//!
//! Mirrors the shape of `zbus`'s own `message::header` module (`PrimaryHeader` + `Header`
//! + per-field accessors), but parses directly off the wire into owned, already-validated
//! `zbus_names` types rather than round-tripping through `serde`: the policy engine only
//! ever needs a handful of scalar fields out of a message it will otherwise forward
//! untouched, so a full typed deserialization of the header would be wasted work.

use enumflags2::{bitflags, BitFlags};
use zbus_names::{BusName, ErrorName, InterfaceName, MemberName, UniqueName};
use zvariant::ObjectPath;

use crate::buffer::align8;
use crate::error::{WireError, WireResult};

pub const FIXED_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

impl Endian {
    fn from_marker(b: u8) -> WireResult<Self> {
        match b {
            b'B' => Ok(Endian::Big),
            b'l' => Ok(Endian::Little),
            other => Err(WireError::BadEndian(other)),
        }
    }

    pub(crate) fn read_u32(self, data: &[u8], offset: usize) -> u32 {
        let b = [
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ];
        match self {
            Endian::Big => u32::from_be_bytes(b),
            Endian::Little => u32::from_le_bytes(b),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    fn from_byte(b: u8) -> WireResult<Self> {
        match b {
            1 => Ok(MessageType::MethodCall),
            2 => Ok(MessageType::MethodReturn),
            3 => Ok(MessageType::Error),
            4 => Ok(MessageType::Signal),
            other => Err(WireError::MalformedField(other as usize)),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            MessageType::MethodCall => 1,
            MessageType::MethodReturn => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }
}

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFlags {
    NoReplyExpected = 0x1,
    NoAutoStart = 0x2,
    AllowInteractiveAuth = 0x4,
}

const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;
const FIELD_UNIX_FDS: u8 = 9;

/// Header field type codes, exposed for the message-synthesis side (`crate::message`)
/// which needs to emit the same codes this module parses.
pub mod field_codes {
    pub const PATH: u8 = super::FIELD_PATH;
    pub const INTERFACE: u8 = super::FIELD_INTERFACE;
    pub const MEMBER: u8 = super::FIELD_MEMBER;
    pub const ERROR_NAME: u8 = super::FIELD_ERROR_NAME;
    pub const REPLY_SERIAL: u8 = super::FIELD_REPLY_SERIAL;
    pub const DESTINATION: u8 = super::FIELD_DESTINATION;
    pub const SENDER: u8 = super::FIELD_SENDER;
    pub const SIGNATURE: u8 = super::FIELD_SIGNATURE;
    pub const UNIX_FDS: u8 = super::FIELD_UNIX_FDS;
}

/// A fully decoded, validated message header (§3 "Header", §4.3).
#[derive(Debug, Clone)]
pub struct Header {
    pub endian: Endian,
    pub message_type: MessageType,
    pub flags: BitFlags<HeaderFlags>,
    pub body_len: u32,
    pub serial: u32,
    pub path: Option<ObjectPath<'static>>,
    pub interface: Option<InterfaceName<'static>>,
    pub member: Option<MemberName<'static>>,
    pub error_name: Option<ErrorName<'static>>,
    pub destination: Option<BusName<'static>>,
    pub sender: Option<UniqueName<'static>>,
    pub signature: Option<String>,
    pub reply_serial: Option<u32>,
    pub unix_fds: u32,
    /// Byte offset in the source buffer where the message body starts.
    pub body_offset: usize,
}

const DBUS_DESTINATION: &str = "org.freedesktop.DBus";
const DBUS_INTROSPECTABLE_IFACE: &str = "org.freedesktop.DBus.Introspectable";
const DBUS_LOCAL_IFACE: &str = "org.freedesktop.DBus.Local";
const DBUS_LOCAL_PATH: &str = "/org/freedesktop/DBus/Local";

impl Header {
    pub fn is_for_bus(&self) -> bool {
        matches!(&self.destination, Some(d) if d.as_str() == DBUS_DESTINATION)
    }

    pub fn is_dbus_method_call(&self) -> bool {
        self.is_for_bus()
            && matches!(&self.interface, Some(i) if i.as_str() == DBUS_DESTINATION)
    }

    pub fn is_introspection_call(&self) -> bool {
        matches!(&self.interface, Some(i) if i.as_str() == DBUS_INTROSPECTABLE_IFACE)
    }

    pub fn client_message_generates_reply(&self) -> bool {
        self.message_type == MessageType::MethodCall
            && !self.flags.contains(HeaderFlags::NoReplyExpected)
    }

    pub fn member_name(&self) -> Option<&str> {
        self.member.as_ref().map(|m| m.as_str())
    }
}

/// Parse a completed message buffer (`data.len()` must equal the full message length).
/// Compute the full message length (fixed header + field array + padding + body) from
/// just the completed 16-byte fixed header, so a [`Side`](crate) can size the body
/// buffer to allocate before the rest of the message has even arrived (§4.1 "length
/// probe").
pub fn probe_total_length(data: &[u8]) -> WireResult<usize> {
    if data.len() < FIXED_HEADER_SIZE {
        return Err(WireError::HeaderTooShort);
    }
    let endian = Endian::from_marker(data[0])?;
    let body_len = endian.read_u32(data, 4);
    let array_len = endian.read_u32(data, 12);

    let array_end = FIXED_HEADER_SIZE
        .checked_add(array_len as usize)
        .ok_or(WireError::HeaderArrayOverflow(array_len))?;
    let header_end = align8(array_end);
    header_end
        .checked_add(body_len as usize)
        .ok_or(WireError::HeaderArrayOverflow(array_len))
}

pub fn parse(data: &[u8]) -> WireResult<Header> {
    if data.len() < FIXED_HEADER_SIZE {
        return Err(WireError::HeaderTooShort);
    }

    let endian = Endian::from_marker(data[0])?;
    let message_type = MessageType::from_byte(data[1])?;
    let raw_flags = data[2];
    let flags = BitFlags::<HeaderFlags>::from_bits_truncate(raw_flags);
    let protocol_version = data[3];
    if protocol_version != 1 {
        return Err(WireError::BadProtocolVersion(protocol_version));
    }
    let body_len = endian.read_u32(data, 4);
    let serial = endian.read_u32(data, 8);
    if serial == 0 {
        return Err(WireError::ZeroSerial);
    }
    let array_len = endian.read_u32(data, 12);

    let array_start = FIXED_HEADER_SIZE;
    let array_end = array_start
        .checked_add(array_len as usize)
        .ok_or(WireError::HeaderArrayOverflow(array_len))?;
    let header_end = align8(array_end);
    if header_end > data.len() {
        return Err(WireError::HeaderArrayOverflow(array_len));
    }

    let mut fields = DecodedFields::default();
    let mut offset = array_start;
    while offset < array_end {
        offset = align8(offset);
        if offset >= array_end {
            break;
        }
        offset = parse_one_field(data, offset, endian, &mut fields)?;
    }

    let body_padding_end = header_end;
    let total_needed = body_padding_end
        .checked_add(body_len as usize)
        .ok_or(WireError::HeaderArrayOverflow(array_len))?;
    if total_needed > data.len() {
        return Err(WireError::HeaderArrayOverflow(array_len));
    }

    validate_by_type(message_type, &fields)?;

    Ok(Header {
        endian,
        message_type,
        flags,
        body_len,
        serial,
        path: fields.path,
        interface: fields.interface,
        member: fields.member,
        error_name: fields.error_name,
        destination: fields.destination,
        sender: fields.sender,
        signature: fields.signature,
        reply_serial: fields.reply_serial,
        unix_fds: fields.unix_fds.unwrap_or(0),
        body_offset: body_padding_end,
    })
}

#[derive(Default)]
struct DecodedFields {
    path: Option<ObjectPath<'static>>,
    interface: Option<InterfaceName<'static>>,
    member: Option<MemberName<'static>>,
    error_name: Option<ErrorName<'static>>,
    destination: Option<BusName<'static>>,
    sender: Option<UniqueName<'static>>,
    signature: Option<String>,
    reply_serial: Option<u32>,
    unix_fds: Option<u32>,
}

/// Decode one 8-byte-aligned `(code, signature, value)` entry starting at `offset`.
/// Returns the offset just past the decoded value.
fn parse_one_field(
    data: &[u8],
    offset: usize,
    endian: Endian,
    out: &mut DecodedFields,
) -> WireResult<usize> {
    if offset + 4 > data.len() {
        return Err(WireError::MalformedField(offset));
    }
    let code = data[offset];
    let sig_len = data[offset + 1] as usize;
    let sig_start = offset + 2;
    let sig_end = sig_start + sig_len;
    if sig_end + 1 > data.len() {
        return Err(WireError::MalformedField(offset));
    }
    let signature = std::str::from_utf8(&data[sig_start..sig_end])
        .map_err(|_| WireError::MalformedField(offset))?;
    // NUL terminator after the signature bytes.
    let mut cursor = sig_end + 1;

    match code {
        FIELD_PATH => {
            require_signature(signature, "o", offset)?;
            let (s, next) = read_aligned_string(data, cursor, endian)?;
            out.path = Some(ObjectPath::try_from(s)?.into_owned());
            cursor = next;
        }
        FIELD_INTERFACE => {
            require_signature(signature, "s", offset)?;
            let (s, next) = read_aligned_string(data, cursor, endian)?;
            out.interface = Some(InterfaceName::try_from(s)?.into_owned());
            cursor = next;
        }
        FIELD_MEMBER => {
            require_signature(signature, "s", offset)?;
            let (s, next) = read_aligned_string(data, cursor, endian)?;
            out.member = Some(MemberName::try_from(s)?.into_owned());
            cursor = next;
        }
        FIELD_ERROR_NAME => {
            require_signature(signature, "s", offset)?;
            let (s, next) = read_aligned_string(data, cursor, endian)?;
            out.error_name = Some(ErrorName::try_from(s)?.into_owned());
            cursor = next;
        }
        FIELD_DESTINATION => {
            require_signature(signature, "s", offset)?;
            let (s, next) = read_aligned_string(data, cursor, endian)?;
            out.destination = Some(BusName::try_from(s)?.into_owned());
            cursor = next;
        }
        FIELD_SENDER => {
            require_signature(signature, "s", offset)?;
            let (s, next) = read_aligned_string(data, cursor, endian)?;
            out.sender = Some(UniqueName::try_from(s)?.into_owned());
            cursor = next;
        }
        FIELD_SIGNATURE => {
            require_signature(signature, "g", offset)?;
            let sig_str_len = data[cursor] as usize;
            let sig_data_start = cursor + 1;
            let sig_data_end = sig_data_start + sig_str_len;
            if sig_data_end + 1 > data.len() {
                return Err(WireError::MalformedField(offset));
            }
            let sig = std::str::from_utf8(&data[sig_data_start..sig_data_end])
                .map_err(|_| WireError::MalformedField(offset))?;
            out.signature = Some(sig.to_owned());
            cursor = sig_data_end + 1;
        }
        FIELD_REPLY_SERIAL => {
            require_signature(signature, "u", offset)?;
            cursor = align8_to(cursor, 4);
            if cursor + 4 > data.len() {
                return Err(WireError::MalformedField(offset));
            }
            out.reply_serial = Some(endian.read_u32(data, cursor));
            cursor += 4;
        }
        FIELD_UNIX_FDS => {
            require_signature(signature, "u", offset)?;
            cursor = align8_to(cursor, 4);
            if cursor + 4 > data.len() {
                return Err(WireError::MalformedField(offset));
            }
            out.unix_fds = Some(endian.read_u32(data, cursor));
            cursor += 4;
        }
        _ => {
            // Unknown field: skip past its value using its declared signature's
            // minimal alignment so later fields remain parseable.
            cursor = skip_unknown_value(data, cursor, signature, endian, offset)?;
        }
    }

    Ok(cursor)
}

fn require_signature(got: &str, expected: &str, offset: usize) -> WireResult<()> {
    if got == expected {
        Ok(())
    } else {
        Err(WireError::WrongFieldSignature).map_err(|e| {
            let _ = offset;
            e
        })
    }
}

/// Read a 4-byte-aligned, length-prefixed, NUL-terminated string starting at `offset`.
fn read_aligned_string(data: &[u8], offset: usize, endian: Endian) -> WireResult<(&str, usize)> {
    let offset = align8_to(offset, 4);
    if offset + 4 > data.len() {
        return Err(WireError::MalformedField(offset));
    }
    let len = endian.read_u32(data, offset) as usize;
    let start = offset + 4;
    let end = start + len;
    if end + 1 > data.len() {
        return Err(WireError::MalformedField(offset));
    }
    let s = std::str::from_utf8(&data[start..end]).map_err(|_| WireError::MalformedField(offset))?;
    Ok((s, end + 1))
}

fn align8_to(n: usize, align: usize) -> usize {
    (n + (align - 1)) & !(align - 1)
}

fn skip_unknown_value(
    data: &[u8],
    mut cursor: usize,
    signature: &str,
    endian: Endian,
    offset: usize,
) -> WireResult<usize> {
    match signature.chars().next() {
        Some('s') | Some('o') => {
            let (_, next) = read_aligned_string(data, cursor, endian)?;
            Ok(next)
        }
        Some('g') => {
            let len = *data.get(cursor).ok_or(WireError::MalformedField(offset))? as usize;
            Ok(cursor + 1 + len + 1)
        }
        Some('u') | Some('i') => {
            cursor = align8_to(cursor, 4);
            Ok(cursor + 4)
        }
        Some('y') => Ok(cursor + 1),
        _ => Err(WireError::MalformedField(offset)),
    }
}

fn validate_by_type(message_type: MessageType, fields: &DecodedFields) -> WireResult<()> {
    match message_type {
        MessageType::MethodCall => {
            if fields.path.is_none() || fields.member.is_none() {
                return Err(WireError::MethodCallMissingFields);
            }
        }
        MessageType::MethodReturn => {
            if fields.reply_serial.is_none() {
                return Err(WireError::MethodReturnMissingReplySerial);
            }
        }
        MessageType::Error => {
            if fields.error_name.is_none() || fields.reply_serial.is_none() {
                return Err(WireError::ErrorMissingFields);
            }
        }
        MessageType::Signal => {
            if fields.path.is_none() || fields.interface.is_none() || fields.member.is_none() {
                return Err(WireError::SignalMissingFields);
            }
            let path_is_local = matches!(&fields.path, Some(p) if p.as_str() == DBUS_LOCAL_PATH);
            let iface_is_local =
                matches!(&fields.interface, Some(i) if i.as_str() == DBUS_LOCAL_IFACE);
            if path_is_local || iface_is_local {
                return Err(WireError::LocalSignalRejected);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_aligned_string(buf: &mut Vec<u8>, field_code: u8, sig: &str, s: &str) {
        while buf.len() % 8 != 0 {
            buf.push(0);
        }
        buf.push(field_code);
        buf.push(sig.len() as u8);
        buf.extend_from_slice(sig.as_bytes());
        buf.push(0);
        while buf.len() % 4 != 0 {
            buf.push(0);
        }
        buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
        buf.push(0);
    }

    fn build_method_call(serial: u32, path: &str, member: &str, iface: Option<&str>) -> Vec<u8> {
        let mut fields = Vec::new();
        push_aligned_string(&mut fields, FIELD_PATH, "o", path);
        if let Some(iface) = iface {
            push_aligned_string(&mut fields, FIELD_INTERFACE, "s", iface);
        }
        push_aligned_string(&mut fields, FIELD_MEMBER, "s", member);
        push_aligned_string(&mut fields, FIELD_DESTINATION, "s", "org.freedesktop.DBus");

        let mut msg = Vec::new();
        msg.push(b'l');
        msg.push(MessageType::MethodCall.as_byte());
        msg.push(0); // flags
        msg.push(1); // protocol version
        msg.extend_from_slice(&0u32.to_le_bytes()); // body_len
        msg.extend_from_slice(&serial.to_le_bytes());
        msg.extend_from_slice(&(fields.len() as u32).to_le_bytes());
        msg.extend_from_slice(&fields);
        while msg.len() % 8 != 0 {
            msg.push(0);
        }
        msg
    }

    #[test]
    fn probes_total_length_matching_built_message() {
        let data = build_method_call(1, "/org/freedesktop/DBus", "Hello", Some("org.freedesktop.DBus"));
        let probed = probe_total_length(&data[..FIXED_HEADER_SIZE]).unwrap();
        assert_eq!(probed, data.len());
    }

    #[test]
    fn parses_hello_call() {
        let data = build_method_call(1, "/org/freedesktop/DBus", "Hello", Some("org.freedesktop.DBus"));
        let header = parse(&data).unwrap();
        assert_eq!(header.serial, 1);
        assert_eq!(header.message_type, MessageType::MethodCall);
        assert!(header.is_for_bus());
        assert!(header.is_dbus_method_call());
        assert_eq!(header.member_name(), Some("Hello"));
    }

    #[test]
    fn rejects_zero_serial() {
        let mut data = build_method_call(1, "/p", "M", None);
        data[8..12].copy_from_slice(&0u32.to_le_bytes());
        assert!(matches!(parse(&data), Err(WireError::ZeroSerial)));
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(matches!(parse(&[0u8; 4]), Err(WireError::HeaderTooShort)));
    }

    #[test]
    fn rejects_bad_endian() {
        let mut data = build_method_call(1, "/p", "M", None);
        data[0] = b'x';
        assert!(matches!(parse(&data), Err(WireError::BadEndian(_))));
    }

    #[test]
    fn method_call_requires_path_and_member() {
        let mut fields = Vec::new();
        push_aligned_string(&mut fields, FIELD_DESTINATION, "s", "org.freedesktop.DBus");
        let mut msg = Vec::new();
        msg.push(b'l');
        msg.push(MessageType::MethodCall.as_byte());
        msg.push(0);
        msg.push(1);
        msg.extend_from_slice(&0u32.to_le_bytes());
        msg.extend_from_slice(&1u32.to_le_bytes());
        msg.extend_from_slice(&(fields.len() as u32).to_le_bytes());
        msg.extend_from_slice(&fields);
        while msg.len() % 8 != 0 {
            msg.push(0);
        }
        assert!(matches!(
            parse(&msg),
            Err(WireError::MethodCallMissingFields)
        ));
    }

    #[test]
    fn signal_with_local_interface_rejected() {
        let mut fields = Vec::new();
        push_aligned_string(&mut fields, FIELD_PATH, "o", "/some/path");
        push_aligned_string(&mut fields, FIELD_INTERFACE, "s", DBUS_LOCAL_IFACE);
        push_aligned_string(&mut fields, FIELD_MEMBER, "s", "Disconnected");
        let mut msg = Vec::new();
        msg.push(b'l');
        msg.push(MessageType::Signal.as_byte());
        msg.push(0);
        msg.push(1);
        msg.extend_from_slice(&0u32.to_le_bytes());
        msg.extend_from_slice(&1u32.to_le_bytes());
        msg.extend_from_slice(&(fields.len() as u32).to_le_bytes());
        msg.extend_from_slice(&fields);
        while msg.len() % 8 != 0 {
            msg.push(0);
        }
        assert!(matches!(
            parse(&msg),
            Err(WireError::LocalSignalRejected)
        ));
    }
}
