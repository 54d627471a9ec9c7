use std::fmt;

/// ATT attribute handle. Zero means "not discovered".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttrHandle(pub u16);

impl AttrHandle {
    pub const NONE: AttrHandle = AttrHandle(0);
    pub const FIRST: AttrHandle = AttrHandle(0x0001);
    pub const LAST: AttrHandle = AttrHandle(0xFFFF);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Handle immediately after this one, saturating at `LAST`.
    pub fn next(self) -> AttrHandle {
        AttrHandle(self.0.saturating_add(1))
    }
}

impl fmt::Display for AttrHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Radio-stack identifier for one live link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnHandle(pub u16);

impl fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn{}", self.0)
    }
}

/// Generation-tagged connection table slot.
///
/// A key stays valid only while its slot holds the connection it was issued
/// for; once the slot is reused the generation differs and lookups miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub slot: u16,
    pub generation: u32,
}

impl ConnKey {
    pub fn owner_tag(self) -> OwnerTag {
        OwnerTag((u64::from(self.generation) << 16) | u64::from(self.slot))
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

/// Opaque tag recorded on pool allocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct OwnerTag(pub u64);

/// Peer address as rendered by the radio backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr(pub String);

impl PeerAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// HCI disconnect reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ConnectionTimeout,
    RemoteUserTerminated,
    LocalHostTerminated,
    Other(u8),
}

impl DisconnectReason {
    pub fn hci_code(self) -> u8 {
        match self {
            Self::ConnectionTimeout => 0x08,
            Self::RemoteUserTerminated => 0x13,
            Self::LocalHostTerminated => 0x16,
            Self::Other(code) => code,
        }
    }

    pub fn from_hci(code: u8) -> Self {
        match code {
            0x08 => Self::ConnectionTimeout,
            0x13 => Self::RemoteUserTerminated,
            0x16 => Self::LocalHostTerminated,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ConnectionTimeout => "connection timeout",
            Self::RemoteUserTerminated => "remote user terminated",
            Self::LocalHostTerminated => "local host terminated",
            Self::Other(_) => "other",
        };
        write!(f, "0x{:02x} {label}", self.hci_code())
    }
}
