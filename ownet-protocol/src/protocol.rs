use std::fmt::Display;

/// Size of the fixed request and response headers: six 32-bit words.
pub const HEADER_LEN: usize = 24;

/// Size of one anti-loop token on the wire.
pub const TOKEN_LEN: usize = 16;

/// Largest payload (path, data and tokens together) a server accepts by default.
pub const MAX_PAYLOAD_SIZE: usize = 100_050;

/// Longest path, including its terminating null, a server accepts.
pub const PATH_MAX: usize = 2048;

/// The packed version word at the start of every header.
///
/// The 32 bits hold several fields:
///
/// - bits 0..16: number of anti-loop tokens appended to the request
/// - bit 16: the request was forwarded by another server (tokens are present)
/// - bits 17..25: the base protocol version
/// - bit 31: the side-tap flag
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Version(u32);

impl Version {
    const TOKEN_MASK: u32 = 0xFFFF;
    const SERVER_MESSAGE: u32 = 1 << 16;
    const PROTOCOL_SHIFT: u32 = 17;
    const PROTOCOL_MASK: u32 = 0xFF << Self::PROTOCOL_SHIFT;
    const SIDETAP: u32 = 1 << 31;

    /// The protocol version spoken by this implementation
    pub const CURRENT_PROTOCOL: u8 = 0;

    /// A version word for the given base protocol, without tokens or flags.
    pub fn new(protocol: u8) -> Version {
        Version((protocol as u32) << Self::PROTOCOL_SHIFT)
    }

    pub fn from_bits(bits: u32) -> Version {
        Version(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    /// The base protocol version
    pub fn protocol(&self) -> u8 {
        ((self.0 & Self::PROTOCOL_MASK) >> Self::PROTOCOL_SHIFT) as u8
    }

    /// Whether the message was sent by another server and carries anti-loop tokens.
    pub fn is_server_message(&self) -> bool {
        self.0 & Self::SERVER_MESSAGE != 0
    }

    /// Number of anti-loop tokens that follow the payload.
    /// Always zero unless [`Version::is_server_message`] is set.
    pub fn token_count(&self) -> usize {
        if self.is_server_message() {
            (self.0 & Self::TOKEN_MASK) as usize
        } else {
            0
        }
    }

    /// Marks the message as server-originated and records the token count.
    pub fn with_tokens(self, count: u16) -> Version {
        Version((self.0 & !Self::TOKEN_MASK) | Self::SERVER_MESSAGE | count as u32)
    }

    /// Clears the server-message flag and the token count.
    pub fn without_tokens(self) -> Version {
        Version(self.0 & !(Self::TOKEN_MASK | Self::SERVER_MESSAGE))
    }

    pub fn is_sidetap(&self) -> bool {
        self.0 & Self::SIDETAP != 0
    }

    pub fn with_sidetap(self, sidetap: bool) -> Version {
        if sidetap {
            Version(self.0 | Self::SIDETAP)
        } else {
            Version(self.0 & !Self::SIDETAP)
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.protocol())?;
        if self.is_server_message() {
            write!(f, "+{} tokens", self.token_count())?;
        }
        if self.is_sidetap() {
            write!(f, " (sidetap)")?;
        }
        Ok(())
    }
}

#[test]
fn version_fields_are_independent() {
    let v = Version::new(3).with_tokens(2).with_sidetap(true);
    assert_eq!(v.protocol(), 3);
    assert_eq!(v.token_count(), 2);
    assert!(v.is_server_message());
    assert!(v.is_sidetap());
    let v = v.without_tokens();
    assert_eq!(v.token_count(), 0);
    assert!(!v.is_server_message());
    assert_eq!(v.protocol(), 3);
}

/// Temperature unit requested by the client.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum TemperatureScale {
    #[default]
    Celsius,
    Fahrenheit,
    Kelvin,
    Rankine,
}

impl TemperatureScale {
    fn from_bits(bits: u32) -> TemperatureScale {
        match bits {
            1 => TemperatureScale::Fahrenheit,
            2 => TemperatureScale::Kelvin,
            3 => TemperatureScale::Rankine,
            _ => TemperatureScale::Celsius,
        }
    }

    fn bits(&self) -> u32 {
        match self {
            TemperatureScale::Celsius => 0,
            TemperatureScale::Fahrenheit => 1,
            TemperatureScale::Kelvin => 2,
            TemperatureScale::Rankine => 3,
        }
    }

    /// Converts a value in degrees Celsius into this scale.
    pub fn from_celsius(&self, celsius: f64) -> f64 {
        match self {
            TemperatureScale::Celsius => celsius,
            TemperatureScale::Fahrenheit => celsius * 1.8 + 32.0,
            TemperatureScale::Kelvin => celsius + 273.15,
            TemperatureScale::Rankine => (celsius + 273.15) * 1.8,
        }
    }
}

/// How device addresses are rendered in paths.
/// `f` is the family code, `i` the serial number and `c` the checksum.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum DeviceFormat {
    #[default]
    FdotI,
    FI,
    FdotIdotC,
    FdotIC,
    FIdotC,
    FIC,
}

impl DeviceFormat {
    fn from_bits(bits: u32) -> DeviceFormat {
        match bits {
            1 => DeviceFormat::FI,
            2 => DeviceFormat::FdotIdotC,
            3 => DeviceFormat::FdotIC,
            4 => DeviceFormat::FIdotC,
            5 => DeviceFormat::FIC,
            _ => DeviceFormat::FdotI,
        }
    }

    fn bits(&self) -> u32 {
        match self {
            DeviceFormat::FdotI => 0,
            DeviceFormat::FI => 1,
            DeviceFormat::FdotIdotC => 2,
            DeviceFormat::FdotIC => 3,
            DeviceFormat::FIdotC => 4,
            DeviceFormat::FIC => 5,
        }
    }
}

/// Per-request control flags.
///
/// Besides single-bit options the word packs the temperature scale
/// (bits 16..24) and the device name format (bits 24..32).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ControlFlags(u32);

impl ControlFlags {
    /// Directory listings should include the `bus.N` entries
    pub const BUS_RETURN: u32 = 0x0000_0002;
    /// Persistence requested (in requests) or granted (in responses)
    pub const PERSISTENT: u32 = 0x0000_0004;
    pub const ALIAS: u32 = 0x0000_0008;
    pub const SAFEMODE: u32 = 0x0000_0010;
    /// Bypass any cached values and talk to the bus
    pub const UNCACHED: u32 = 0x0000_0020;
    pub const OWNET: u32 = 0x0000_0100;

    const TEMPSCALE_SHIFT: u32 = 16;
    const TEMPSCALE_MASK: u32 = 0xFF << Self::TEMPSCALE_SHIFT;
    const DEVFORMAT_SHIFT: u32 = 24;
    const DEVFORMAT_MASK: u32 = 0xFF << Self::DEVFORMAT_SHIFT;

    pub fn from_bits(bits: u32) -> ControlFlags {
        ControlFlags(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, mask: u32) -> bool {
        self.0 & mask == mask
    }

    pub fn with(self, mask: u32, set: bool) -> ControlFlags {
        if set {
            ControlFlags(self.0 | mask)
        } else {
            ControlFlags(self.0 & !mask)
        }
    }

    pub fn persistent(&self) -> bool {
        self.contains(Self::PERSISTENT)
    }

    pub fn with_persistent(self, persistent: bool) -> ControlFlags {
        self.with(Self::PERSISTENT, persistent)
    }

    pub fn uncached(&self) -> bool {
        self.contains(Self::UNCACHED)
    }

    pub fn bus_return(&self) -> bool {
        self.contains(Self::BUS_RETURN)
    }

    pub fn temperature_scale(&self) -> TemperatureScale {
        TemperatureScale::from_bits((self.0 & Self::TEMPSCALE_MASK) >> Self::TEMPSCALE_SHIFT)
    }

    pub fn with_temperature_scale(self, scale: TemperatureScale) -> ControlFlags {
        ControlFlags((self.0 & !Self::TEMPSCALE_MASK) | (scale.bits() << Self::TEMPSCALE_SHIFT))
    }

    pub fn device_format(&self) -> DeviceFormat {
        DeviceFormat::from_bits((self.0 & Self::DEVFORMAT_MASK) >> Self::DEVFORMAT_SHIFT)
    }

    pub fn with_device_format(self, format: DeviceFormat) -> ControlFlags {
        ControlFlags((self.0 & !Self::DEVFORMAT_MASK) | (format.bits() << Self::DEVFORMAT_SHIFT))
    }
}

#[test]
fn control_flags_pack_scale_and_format() {
    let flags = ControlFlags::default()
        .with_persistent(true)
        .with_temperature_scale(TemperatureScale::Kelvin)
        .with_device_format(DeviceFormat::FdotIC);
    assert!(flags.persistent());
    assert_eq!(flags.temperature_scale(), TemperatureScale::Kelvin);
    assert_eq!(flags.device_format(), DeviceFormat::FdotIC);
    assert_eq!(flags.bits(), 0x0302_0004);
    assert!(!flags.with_persistent(false).persistent());
}

/// The kind of query a request carries.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MessageKind {
    Error,
    /// Does nothing, used to check that a server answers
    Nop,
    Read,
    Write,
    /// Directory listing, one response per entry followed by an empty terminator
    Dir,
    /// No longer used, kept for numbering
    Size,
    Presence,
    /// Directory listing as a single comma separated response
    DirAll,
    /// Directory listing for directories, read for everything else
    Get,
    /// Like [`MessageKind::DirAll`], directories carry a trailing `/`
    DirAllSlash,
    /// Like [`MessageKind::Get`], directories carry a trailing `/`
    GetSlash,
    Unknown(i32),
}

impl MessageKind {
    pub fn from_i32(value: i32) -> MessageKind {
        match value {
            0 => MessageKind::Error,
            1 => MessageKind::Nop,
            2 => MessageKind::Read,
            3 => MessageKind::Write,
            4 => MessageKind::Dir,
            5 => MessageKind::Size,
            6 => MessageKind::Presence,
            7 => MessageKind::DirAll,
            8 => MessageKind::Get,
            9 => MessageKind::DirAllSlash,
            10 => MessageKind::GetSlash,
            other => MessageKind::Unknown(other),
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            MessageKind::Error => 0,
            MessageKind::Nop => 1,
            MessageKind::Read => 2,
            MessageKind::Write => 3,
            MessageKind::Dir => 4,
            MessageKind::Size => 5,
            MessageKind::Presence => 6,
            MessageKind::DirAll => 7,
            MessageKind::Get => 8,
            MessageKind::DirAllSlash => 9,
            MessageKind::GetSlash => 10,
            MessageKind::Unknown(other) => *other,
        }
    }

    /// Whether a request of this kind must name a path.
    pub fn needs_path(&self) -> bool {
        matches!(
            self,
            MessageKind::Read
                | MessageKind::Write
                | MessageKind::Dir
                | MessageKind::Presence
                | MessageKind::DirAll
                | MessageKind::Get
                | MessageKind::DirAllSlash
                | MessageKind::GetSlash
        )
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Error => write!(f, "error"),
            MessageKind::Nop => write!(f, "nop"),
            MessageKind::Read => write!(f, "read"),
            MessageKind::Write => write!(f, "write"),
            MessageKind::Dir => write!(f, "dir"),
            MessageKind::Size => write!(f, "size"),
            MessageKind::Presence => write!(f, "presence"),
            MessageKind::DirAll => write!(f, "dirall"),
            MessageKind::Get => write!(f, "get"),
            MessageKind::DirAllSlash => write!(f, "dirallslash"),
            MessageKind::GetSlash => write!(f, "getslash"),
            MessageKind::Unknown(other) => write!(f, "unknown({})", other),
        }
    }
}

/// An opaque marker identifying one server process.
/// Forwarded requests carry one token for every server they passed through.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct AntiLoopToken([u8; TOKEN_LEN]);

impl AntiLoopToken {
    pub fn new(bytes: [u8; TOKEN_LEN]) -> AntiLoopToken {
        AntiLoopToken(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }
}

/// A Request is sent from the client to the server.
/// Every request is answered by one response, or for [`MessageKind::Dir`] by a
/// sequence of responses closed by an empty terminator. Keep-alive responses
/// may precede the answer at any time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    pub version: Version,
    pub kind: MessageKind,
    pub flags: ControlFlags,
    /// The path the query addresses. `None` when the request has no payload.
    pub path: Option<String>,
    /// Bytes to write, only carried by [`MessageKind::Write`] requests.
    pub data: Vec<u8>,
    /// Requested read length, or the number of bytes to write
    pub size: i32,
    pub offset: i32,
    /// Tokens of the servers this request already passed through
    pub tokens: Vec<AntiLoopToken>,
}

impl Request {
    fn with_kind(kind: MessageKind, path: Option<String>) -> Request {
        Request {
            version: Version::new(Version::CURRENT_PROTOCOL),
            kind,
            flags: ControlFlags::default(),
            path,
            data: Vec::new(),
            size: 0,
            offset: 0,
            tokens: Vec::new(),
        }
    }

    pub fn nop() -> Request {
        Request::with_kind(MessageKind::Nop, None)
    }

    pub fn presence(path: impl Into<String>) -> Request {
        Request::with_kind(MessageKind::Presence, Some(path.into()))
    }

    pub fn read(path: impl Into<String>, size: i32, offset: i32) -> Request {
        Request {
            size,
            offset,
            ..Request::with_kind(MessageKind::Read, Some(path.into()))
        }
    }

    pub fn write(path: impl Into<String>, data: impl Into<Vec<u8>>, offset: i32) -> Request {
        let data = data.into();
        Request {
            size: data.len() as i32,
            offset,
            data,
            ..Request::with_kind(MessageKind::Write, Some(path.into()))
        }
    }

    pub fn dir(path: impl Into<String>) -> Request {
        Request::with_kind(MessageKind::Dir, Some(path.into()))
    }

    pub fn dir_all(path: impl Into<String>, slash: bool) -> Request {
        let kind = if slash {
            MessageKind::DirAllSlash
        } else {
            MessageKind::DirAll
        };
        Request::with_kind(kind, Some(path.into()))
    }

    pub fn get(path: impl Into<String>, size: i32, slash: bool) -> Request {
        let kind = if slash {
            MessageKind::GetSlash
        } else {
            MessageKind::Get
        };
        Request {
            size,
            ..Request::with_kind(kind, Some(path.into()))
        }
    }

    pub fn with_flags(mut self, flags: ControlFlags) -> Request {
        self.flags = flags;
        self
    }

    /// Attaches the anti-loop tokens of a forwarded request.
    pub fn with_tokens(mut self, tokens: Vec<AntiLoopToken>) -> Request {
        self.version = if tokens.is_empty() {
            self.version.without_tokens()
        } else {
            self.version.with_tokens(tokens.len() as u16)
        };
        self.tokens = tokens;
        self
    }

    /// Number of payload bytes announced in the header (path and data, tokens excluded).
    pub fn payload_len(&self) -> usize {
        self.path.as_ref().map(|p| p.len() + 1).unwrap_or(0) + self.data.len()
    }
}

/// A Response is sent from the server to the client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub version: Version,
    pub flags: ControlFlags,
    /// Zero or a byte count on success, a negated errno on failure
    pub ret: i32,
    pub size: i32,
    pub offset: i32,
    pub data: Vec<u8>,
    /// Keep-alive responses carry a payload length of `-1` and no data
    pub keepalive: bool,
}

impl Response {
    pub fn new(version: Version, flags: ControlFlags) -> Response {
        Response {
            version,
            flags,
            ret: 0,
            size: 0,
            offset: 0,
            data: Vec::new(),
            keepalive: false,
        }
    }

    /// A "still working" marker. Clients waiting for an answer discard it.
    pub fn keepalive(version: Version, flags: ControlFlags) -> Response {
        Response {
            keepalive: true,
            ..Response::new(version, flags)
        }
    }

    /// The payload length announced in the header
    pub fn payload_len(&self) -> i32 {
        if self.keepalive {
            -1
        } else {
            self.data.len() as i32
        }
    }

    /// An empty, non keep-alive response. Ends a streamed directory listing.
    pub fn is_terminator(&self) -> bool {
        !self.keepalive && self.data.is_empty()
    }

    /// The payload interpreted as a string, up to the first null byte.
    pub fn text(&self) -> String {
        let end = self
            .data
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.data.len());
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }
}
