//! Types exchanged between the server and a [`crate::DeviceTree`] implementation.
use std::fmt::Display;

use nix::errno::Errno;
use ownet_protocol::{AntiLoopToken, ControlFlags, DeviceFormat};

/// Outcome of a query. Failures are reported as POSIX error numbers and reach the
/// client as a negative result code.
pub type QueryResult<T> = Result<T, Errno>;

/// Index of a physical bus.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BusId(pub u32);

impl Display for BusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bus.{}", self.0)
    }
}

/// The 64-bit address of a one-wire device: family code, 48-bit serial number and CRC8.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DeviceId([u8; 8]);

/// Dallas/Maxim CRC8 (polynomial x^8 + x^5 + x^4 + 1, reflected)
pub fn crc8(bytes: &[u8]) -> u8 {
    let mut crc = 0u8;
    for byte in bytes {
        let mut b = *byte;
        for _ in 0..8 {
            let mix = (crc ^ b) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            b >>= 1;
        }
    }
    crc
}

impl DeviceId {
    /// Builds an address from family and serial number, computing the checksum.
    pub fn new(family: u8, serial: [u8; 6]) -> DeviceId {
        let mut bytes = [0u8; 8];
        bytes[0] = family;
        bytes[1..7].copy_from_slice(&serial);
        bytes[7] = crc8(&bytes[..7]);
        DeviceId(bytes)
    }

    pub fn from_bytes(bytes: [u8; 8]) -> DeviceId {
        DeviceId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn family(&self) -> u8 {
        self.0[0]
    }

    pub fn crc(&self) -> u8 {
        self.0[7]
    }

    /// Parses a device name in any of the supported formats.
    ///
    /// Dots are ignored. Fourteen hex digits name family and serial, sixteen also carry
    /// the checksum, which then has to match.
    pub fn parse(name: &str) -> Option<DeviceId> {
        let digits: Vec<u8> = name.bytes().filter(|b| *b != b'.').collect();
        if (digits.len() != 14 && digits.len() != 16) || !digits.iter().all(u8::is_ascii_hexdigit)
        {
            return None;
        }
        let mut bytes = [0u8; 8];
        for (i, pair) in digits.chunks(2).enumerate() {
            let text = std::str::from_utf8(pair).ok()?;
            bytes[i] = u8::from_str_radix(text, 16).ok()?;
        }
        let mut serial = [0u8; 6];
        serial.copy_from_slice(&bytes[1..7]);
        let id = DeviceId::new(bytes[0], serial);
        if digits.len() == 16 && id.crc() != bytes[7] {
            return None;
        }
        Some(id)
    }

    /// Renders the address the way the client asked for.
    pub fn name(&self, format: DeviceFormat) -> String {
        let family = format!("{:02X}", self.family());
        let serial: String = self.0[1..7]
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect();
        let crc = format!("{:02X}", self.crc());
        match format {
            DeviceFormat::FdotI => format!("{}.{}", family, serial),
            DeviceFormat::FI => format!("{}{}", family, serial),
            DeviceFormat::FdotIdotC => format!("{}.{}.{}", family, serial, crc),
            DeviceFormat::FdotIC => format!("{}.{}{}", family, serial, crc),
            DeviceFormat::FIdotC => format!("{}{}.{}", family, serial, crc),
            DeviceFormat::FIC => format!("{}{}{}", family, serial, crc),
        }
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name(DeviceFormat::FdotI))
    }
}

/// How often the value behind a property changes, which decides what has to be locked
/// while it is accessed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Change {
    /// Fixed for the lifetime of the device (type, address)
    Static,
    /// Changes only when written
    Stable,
    /// Measured on every access
    Volatile,
    /// Internal counters, never touches the bus
    Statistic,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeKind {
    Directory,
    Property(Change),
}

/// A resolved path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Node {
    /// The path as the client sent it
    pub path: String,
    pub kind: NodeKind,
    /// The bus the node lives on, if it is tied to one
    pub bus: Option<BusId>,
    /// The device the node belongs to, if any
    pub device: Option<DeviceId>,
}

impl Node {
    pub fn directory(path: impl Into<String>) -> Node {
        Node {
            path: path.into(),
            kind: NodeKind::Directory,
            bus: None,
            device: None,
        }
    }

    pub fn property(path: impl Into<String>, change: Change) -> Node {
        Node {
            path: path.into(),
            kind: NodeKind::Property(change),
            bus: None,
            device: None,
        }
    }

    pub fn on_bus(mut self, bus: BusId) -> Node {
        self.bus = Some(bus);
        self
    }

    pub fn of_device(mut self, device: DeviceId) -> Node {
        self.device = Some(device);
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// One element of a directory listing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    /// Full path of the element
    pub path: String,
    pub is_dir: bool,
}

impl DirEntry {
    pub fn new(path: impl Into<String>, is_dir: bool) -> DirEntry {
        DirEntry {
            path: path.into(),
            is_dir,
        }
    }
}

/// Per-request settings handed to the device tree.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct QueryContext {
    /// The client's control flags (temperature scale, name format, caching)
    pub flags: ControlFlags,
    /// Tokens to attach when the query is forwarded to another server
    pub tokens: Vec<AntiLoopToken>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn device_names_follow_the_requested_format() {
        let id = DeviceId::parse("10.67C6697351FF").unwrap();
        assert_eq!(id.family(), 0x10);
        assert_eq!(id.to_string(), "10.67C6697351FF");
        assert_eq!(id.name(DeviceFormat::FI), "1067C6697351FF");
        let with_crc = id.name(DeviceFormat::FdotIdotC);
        assert_eq!(with_crc.len(), "10.67C6697351FF.XX".len());
        assert_eq!(DeviceId::parse(&with_crc), Some(id));
        assert_eq!(DeviceId::parse(&id.name(DeviceFormat::FIC)), Some(id));
    }

    #[test]
    fn wrong_checksum_is_rejected() {
        let id = DeviceId::parse("28.0000000000AA").unwrap();
        let bad = format!("{}.{:02X}", id, id.crc().wrapping_add(1));
        assert_eq!(DeviceId::parse(&bad), None);
        assert_eq!(DeviceId::parse("28.00"), None);
        assert_eq!(DeviceId::parse("ZZ.0000000000AA"), None);
    }

    #[test]
    fn crc8_matches_known_rom() {
        assert_eq!(crc8(&[0x02, 0x1C, 0xB8, 0x01, 0x00, 0x00, 0x00]), 0xA2);
    }
}
