//! SSL/TLS configuration shared by the endpoint types: flags, server name override, role.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use serde::{Deserialize, Serialize};

/// Engine-defined certificate/behavior toggles. Applied before the handshake that uses them.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SslFlags(u32);

impl SslFlags {
    pub const NONE: SslFlags = SslFlags(0);
    /// Run TLS on this endpoint (implied by `https://` / `wss://` URLs).
    pub const ENABLE: SslFlags = SslFlags(0x01);
    pub const ALLOW_EXPIRED_CERT: SslFlags = SslFlags(0x02);
    pub const ALLOW_INVALID_CERT_CN: SslFlags = SslFlags(0x04);
    pub const ALLOW_UNTRUSTED_CERT: SslFlags = SslFlags(0x08);
    pub const ALLOW_REVOKED_CERT: SslFlags = SslFlags(0x10);
    pub const ALLOW_ANY_ROOT: SslFlags = SslFlags(0x20);
    pub const ALLOW_SELF_SIGNED_CERT: SslFlags = SslFlags(0x40);
    pub const VERIFY_HOST_NAME: SslFlags = SslFlags(0x1000);

    /// Every `ALLOW_*` relaxation.
    pub const ALLOW_ALL: SslFlags = SslFlags(0x7e);

    pub const fn from_bits(bits: u32) -> Self {
        SslFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: SslFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: SslFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when any certificate verification relaxation is set.
    pub const fn relaxes_verification(self) -> bool {
        self.intersects(Self::ALLOW_ALL)
    }
}

impl BitOr for SslFlags {
    type Output = SslFlags;

    fn bitor(self, rhs: SslFlags) -> SslFlags {
        SslFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for SslFlags {
    fn bitor_assign(&mut self, rhs: SslFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for SslFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SslFlags({:#x})", self.0)
    }
}

/// Which side of the TLS handshake a TCP socket plays. TCP sockets are symmetric,
/// so only the caller knows whether it initiated or accepted the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i32)]
pub enum SslRole {
    Client = 0,
    Server = 1,
}

impl SslRole {
    pub fn from_raw(v: i32) -> Option<Self> {
        match v {
            0 => Some(SslRole::Client),
            1 => Some(SslRole::Server),
            _ => None,
        }
    }
}

/// TLS settings applied to an endpoint so far. Kept on the managed side so they can be
/// inspected, and replayed onto fresh handles (WebSocket reopens).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub flags: Option<SslFlags>,
    pub server_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_composition() {
        let f = SslFlags::ENABLE | SslFlags::ALLOW_SELF_SIGNED_CERT;
        assert!(f.contains(SslFlags::ENABLE));
        assert!(f.relaxes_verification());
        assert!(!SslFlags::ENABLE.relaxes_verification());
        assert!(!(SslFlags::ENABLE | SslFlags::VERIFY_HOST_NAME).relaxes_verification());
        assert_eq!(f.bits(), 0x41);
    }

    #[test]
    fn role_raw_values() {
        assert_eq!(SslRole::Client as i32, 0);
        assert_eq!(SslRole::from_raw(1), Some(SslRole::Server));
        assert_eq!(SslRole::from_raw(2), None);
    }
}
