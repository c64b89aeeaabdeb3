use std::io;

/// Everything that can go wrong while framing or parsing the D-Bus wire protocol.
///
/// A `WireError` always means the side that produced it must be closed; there is no
/// recoverable path once a buffer fails to parse (§7 malformed-wire).
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("message shorter than the 16-byte fixed header")]
    HeaderTooShort,

    #[error("invalid endianness marker {0:#x}")]
    BadEndian(u8),

    #[error("unsupported protocol version {0}")]
    BadProtocolVersion(u8),

    #[error("header field array length {0} overflows the message")]
    HeaderArrayOverflow(u32),

    #[error("message serial is zero")]
    ZeroSerial,

    #[error("header field had wrong signature for its code")]
    WrongFieldSignature,

    #[error("header field array is malformed at byte offset {0}")]
    MalformedField(usize),

    #[error("method call is missing a path or member field")]
    MethodCallMissingFields,

    #[error("method return is missing a reply-serial field")]
    MethodReturnMissingReplySerial,

    #[error("error message is missing an error-name or reply-serial field")]
    ErrorMissingFields,

    #[error("signal is missing path, interface or member fields")]
    SignalMissingFields,

    #[error("signal uses the reserved org.freedesktop.DBus.Local interface or path")]
    LocalSignalRejected,

    #[error("declared unix_fds count ({declared}) does not match received ancillary fds ({received})")]
    FdCountMismatch { declared: u32, received: usize },

    #[error("client serial {0} exceeds the maximum allowed client serial")]
    SerialOutOfRange(u32),

    #[error("auth line buffer exceeded the 16 KiB safety bound")]
    AuthBufferOverflow,

    #[error("auth line is not ASCII-printable or does not start with an uppercase letter")]
    InvalidAuthLine,

    #[error("unsolicited auth reply with no outstanding request")]
    UnsolicitedAuthReply,

    #[error("invalid D-Bus name or path: {0}")]
    InvalidName(#[from] zbus_names::Error),

    #[error("variant decoding failed: {0}")]
    Variant(#[from] zvariant::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type WireResult<T> = Result<T, WireError>;
