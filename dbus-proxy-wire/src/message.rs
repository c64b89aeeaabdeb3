//! Narrow body codecs: reading the first string argument out of a call we need to
//! classify, and serializing the small canned reply bodies the rewrite pipeline
//! substitutes for denied/hidden calls (§4.5, §4.6, §9 "Canned reply table").
//!
//! Full variant-body decoding is out of scope (§1): everything here only ever touches
//! a `u32` length prefix plus ASCII/UTF-8 bytes, so it uses the same manual aligned-read
//! primitives as [`crate::header`] rather than pulling in `zvariant`'s general (de)serializer
//! for a single string or a flat string array.

use crate::error::{WireError, WireResult};
use crate::header;
use crate::header::{Endian, FIXED_HEADER_SIZE, HeaderFlags, MessageType};
use enumflags2::BitFlags;

/// Read the first `STRING` or `OBJECT_PATH` argument of a message body, given the
/// message's signature starts with `s`, `o`, or (permissively) `g`.
///
/// Returns `None` if the body is empty or doesn't start with a string-like type; callers
/// treat that as "no name argument" (§4.5 VALIDATE_* / FILTER_* handlers all expect one).
pub fn first_string_arg(body: &[u8], endian: Endian) -> WireResult<Option<String>> {
    if body.is_empty() {
        return Ok(None);
    }
    let len = endian.read_u32(body, 0) as usize;
    let start = 4;
    let end = start
        .checked_add(len)
        .ok_or(WireError::MalformedField(0))?;
    if end > body.len() {
        return Err(WireError::MalformedField(0));
    }
    let s = std::str::from_utf8(&body[start..end]).map_err(|_| WireError::MalformedField(0))?;
    Ok(Some(s.to_owned()))
}

/// Parse an `ARRAY of STRING` body (the `ListNames`/`ListActivatableNames` reply shape).
pub fn string_array(body: &[u8], endian: Endian) -> WireResult<Vec<String>> {
    if body.len() < 4 {
        return Ok(Vec::new());
    }
    let array_byte_len = endian.read_u32(body, 0) as usize;
    let mut offset = 4;
    let array_end = offset
        .checked_add(array_byte_len)
        .ok_or(WireError::MalformedField(0))?;
    if array_end > body.len() {
        return Err(WireError::MalformedField(0));
    }
    let mut out = Vec::new();
    while offset < array_end {
        offset = align4(offset);
        if offset >= array_end {
            break;
        }
        let len = endian.read_u32(body, offset) as usize;
        let start = offset + 4;
        let end = start + len;
        if end >= body.len() {
            return Err(WireError::MalformedField(offset));
        }
        let s = std::str::from_utf8(&body[start..end]).map_err(|_| WireError::MalformedField(offset))?;
        out.push(s.to_owned());
        offset = end + 1;
    }
    Ok(out)
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// Serialize `ARRAY of STRING` in native little-endian order (synthesized messages are
/// always produced by this process, so we always choose our own wire endianness).
pub fn encode_string_array(names: &[String]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&0u32.to_le_bytes()); // placeholder length
    let array_start = body.len();
    for name in names {
        while body.len() % 4 != 0 {
            body.push(0);
        }
        body.extend_from_slice(&(name.len() as u32).to_le_bytes());
        body.extend_from_slice(name.as_bytes());
        body.push(0);
    }
    let array_len = (body.len() - array_start) as u32;
    body[0..4].copy_from_slice(&array_len.to_le_bytes());
    body
}

pub fn encode_string(s: &str) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(s.len() as u32).to_le_bytes());
    body.extend_from_slice(s.as_bytes());
    body.push(0);
    body
}

pub fn encode_bool(b: bool) -> Vec<u8> {
    (if b { 1u32 } else { 0u32 }).to_le_bytes().to_vec()
}

/// What a synthesized message's body looks like, for the handful of reply shapes the
/// rewrite pipeline produces (§4.5, §4.6, §9 "Canned reply table").
#[derive(Debug, Clone)]
pub enum CannedBody {
    Empty,
    Bool(bool),
    StringName(String),
    StringArray(Vec<String>),
}

impl CannedBody {
    pub fn encode(&self) -> (Vec<u8>, &'static str) {
        match self {
            CannedBody::Empty => (Vec::new(), ""),
            CannedBody::Bool(b) => (encode_bool(*b), "b"),
            CannedBody::StringName(s) => (encode_string(s), "s"),
            CannedBody::StringArray(v) => (encode_string_array(v), "as"),
        }
    }
}

/// Fully describes a message this proxy synthesizes itself: an outbound call to the
/// bus (Ping, AddMatch, GetNameOwner, ListNames) or a canned reply/error back to the
/// client. Always little-endian and protocol version 1 (§4.5, §4.7).
#[derive(Debug, Clone)]
pub struct Synthesized {
    pub message_type: MessageType,
    pub serial: u32,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub destination: Option<String>,
    pub reply_serial: Option<u32>,
    pub unix_fds: Option<u32>,
    pub body: CannedBody,
    pub no_reply_expected: bool,
}

impl Synthesized {
    /// Serialize into a complete, ready-to-send message buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        let (body, signature) = self.body.encode();

        let mut fields = Vec::new();
        if let Some(path) = &self.path {
            push_field_string(&mut fields, header::field_codes::PATH, "o", path);
        }
        if let Some(iface) = &self.interface {
            push_field_string(&mut fields, header::field_codes::INTERFACE, "s", iface);
        }
        if let Some(member) = &self.member {
            push_field_string(&mut fields, header::field_codes::MEMBER, "s", member);
        }
        if let Some(error_name) = &self.error_name {
            push_field_string(&mut fields, header::field_codes::ERROR_NAME, "s", error_name);
        }
        if let Some(dest) = &self.destination {
            push_field_string(&mut fields, header::field_codes::DESTINATION, "s", dest);
        }
        if let Some(reply_serial) = self.reply_serial {
            push_field_u32(&mut fields, header::field_codes::REPLY_SERIAL, reply_serial);
        }
        if let Some(unix_fds) = self.unix_fds {
            push_field_u32(&mut fields, header::field_codes::UNIX_FDS, unix_fds);
        }
        if !signature.is_empty() {
            push_field_signature(&mut fields, header::field_codes::SIGNATURE, signature);
        }

        let mut flags: BitFlags<HeaderFlags> = BitFlags::empty();
        if self.no_reply_expected {
            flags.insert(HeaderFlags::NoReplyExpected);
        }

        let mut msg = Vec::with_capacity(FIXED_HEADER_SIZE + fields.len() + body.len() + 8);
        msg.push(b'l');
        msg.push(self.message_type.as_byte());
        msg.push(flags.bits());
        msg.push(1);
        msg.extend_from_slice(&(body.len() as u32).to_le_bytes());
        msg.extend_from_slice(&self.serial.to_le_bytes());
        msg.extend_from_slice(&(fields.len() as u32).to_le_bytes());
        msg.extend_from_slice(&fields);
        while msg.len() % 8 != 0 {
            msg.push(0);
        }
        msg.extend_from_slice(&body);
        msg
    }
}

fn push_field_string(buf: &mut Vec<u8>, code: u8, sig: &str, value: &str) {
    while buf.len() % 8 != 0 {
        buf.push(0);
    }
    buf.push(code);
    buf.push(sig.len() as u8);
    buf.extend_from_slice(sig.as_bytes());
    buf.push(0);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
}

fn push_field_u32(buf: &mut Vec<u8>, code: u8, value: u32) {
    while buf.len() % 8 != 0 {
        buf.push(0);
    }
    buf.push(code);
    buf.push(1);
    buf.push(b'u');
    buf.push(0);
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_field_signature(buf: &mut Vec<u8>, code: u8, sig: &str) {
    while buf.len() % 8 != 0 {
        buf.push(0);
    }
    buf.push(code);
    buf.push(1);
    buf.push(b'g');
    buf.push(0);
    buf.push(sig.len() as u8);
    buf.extend_from_slice(sig.as_bytes());
    buf.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header;

    #[test]
    fn round_trips_string_array() {
        let names = vec!["org.a".to_string(), "org.b".to_string()];
        let encoded = encode_string_array(&names);
        let decoded = string_array(&encoded, Endian::Little).unwrap();
        assert_eq!(decoded, names);
    }

    #[test]
    fn synthesized_ping_parses_back() {
        let msg = Synthesized {
            message_type: MessageType::MethodCall,
            serial: 5,
            path: Some("/org/freedesktop/DBus/Peer".to_string()),
            interface: Some("org.freedesktop.DBus.Peer".to_string()),
            member: Some("Ping".to_string()),
            error_name: None,
            destination: Some("org.freedesktop.DBus".to_string()),
            reply_serial: None,
            unix_fds: None,
            body: CannedBody::Empty,
            no_reply_expected: false,
        };
        let bytes = msg.into_bytes();
        let parsed = header::parse(&bytes).unwrap();
        assert_eq!(parsed.serial, 5);
        assert_eq!(parsed.member_name(), Some("Ping"));
    }

    #[test]
    fn synthesized_error_reply_has_reply_serial() {
        let msg = Synthesized {
            message_type: MessageType::Error,
            serial: 100,
            path: None,
            interface: None,
            member: None,
            error_name: Some("org.freedesktop.DBus.Error.AccessDenied".to_string()),
            destination: None,
            reply_serial: Some(5),
            unix_fds: None,
            body: CannedBody::Empty,
            no_reply_expected: false,
        };
        let bytes = msg.into_bytes();
        let parsed = header::parse(&bytes).unwrap();
        assert_eq!(parsed.reply_serial, Some(5));
        assert_eq!(
            parsed.error_name.as_ref().map(|e| e.as_str()),
            Some("org.freedesktop.DBus.Error.AccessDenied")
        );
    }

    #[test]
    fn synthesized_unix_fds_round_trips() {
        let msg = Synthesized {
            message_type: MessageType::MethodCall,
            serial: 7,
            path: Some("/org/freedesktop/DBus".to_string()),
            interface: Some("org.freedesktop.DBus".to_string()),
            member: Some("Hello".to_string()),
            error_name: None,
            destination: Some("org.freedesktop.DBus".to_string()),
            reply_serial: None,
            unix_fds: Some(2),
            body: CannedBody::Empty,
            no_reply_expected: false,
        };
        let bytes = msg.into_bytes();
        let parsed = header::parse(&bytes).unwrap();
        assert_eq!(parsed.unix_fds, 2);
    }
}
