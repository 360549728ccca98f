//! Hyper-V socket addressing.
//!
//! Hyper-V identifies socket services by GUID. A Linux guest exposes them
//! through AF_VSOCK using the kernel's template scheme: service GUIDs of the
//! form `xxxxxxxx-facb-11e6-bd58-64006a7986d3` map to the vsock port given by
//! the first dword. Parsing is strict; a malformed GUID is a configuration
//! error and fatal at startup.

use crate::error::{Result, TransportError};
use crate::vsock::VsockAddr;
use std::fmt;

/// The GUID suffix of the Linux vsock template range.
const VSOCK_TEMPLATE_SUFFIX: &str = "-facb-11e6-bd58-64006a7986d3";

/// A Hyper-V socket service identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HvsockServiceId {
    guid: String,
    port: u32,
}

impl HvsockServiceId {
    /// Parses a service GUID string.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] if the string is not a
    /// well-formed GUID.
    pub fn parse(s: &str) -> Result<Self> {
        let guid = s.to_ascii_lowercase();
        if guid.len() != 36 {
            return Err(TransportError::InvalidAddress(format!(
                "service GUID `{s}`: expected 36 characters"
            )));
        }
        for (i, c) in guid.char_indices() {
            let ok = match i {
                8 | 13 | 18 | 23 => c == '-',
                _ => c.is_ascii_hexdigit(),
            };
            if !ok {
                return Err(TransportError::InvalidAddress(format!(
                    "service GUID `{s}`: unexpected character at offset {i}"
                )));
            }
        }

        let port = u32::from_str_radix(&guid[..8], 16)
            .map_err(|_| TransportError::InvalidAddress(format!("service GUID `{s}`")))?;
        Ok(Self { guid, port })
    }

    /// The vsock port encoded in the GUID's first dword.
    #[must_use]
    pub fn port(&self) -> u32 {
        self.port
    }

    /// Returns true when the GUID sits in the kernel's vsock template range,
    /// i.e. the mapping to a plain vsock port is lossless.
    #[must_use]
    pub fn is_vsock_template(&self) -> bool {
        self.guid.ends_with(VSOCK_TEMPLATE_SUFFIX)
    }

    /// The vsock address a Linux guest listens on for this service.
    #[must_use]
    pub fn listen_addr(&self) -> VsockAddr {
        VsockAddr::any(self.port)
    }

    /// The vsock address a Linux guest dials to reach the host service.
    #[must_use]
    pub fn host_addr(&self) -> VsockAddr {
        VsockAddr::host(self.port)
    }
}

impl fmt::Display for HvsockServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.guid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_template_guid() {
        let id = HvsockServiceId::parse("00000ACB-FACB-11E6-BD58-64006A7986D3").unwrap();
        assert_eq!(id.port(), 0xACB);
        assert!(id.is_vsock_template());
        assert_eq!(id.listen_addr(), VsockAddr::any(0xACB));
        assert_eq!(id.host_addr(), VsockAddr::host(0xACB));
    }

    #[test]
    fn parse_non_template_guid() {
        let id = HvsockServiceId::parse("deadbeef-1111-2222-3333-444455556666").unwrap();
        assert_eq!(id.port(), 0xDEAD_BEEF);
        assert!(!id.is_vsock_template());
    }

    #[test]
    fn rejects_malformed_guids() {
        for bad in [
            "",
            "not-a-guid",
            "00000acb-facb-11e6-bd58-64006a7986",    // too short
            "00000acb-facb-11e6-bd58-64006a7986d3f", // too long
            "g0000acb-facb-11e6-bd58-64006a7986d3",  // non-hex
            "00000acbxfacb-11e6-bd58-64006a7986d3",  // missing hyphen
        ] {
            assert!(HvsockServiceId::parse(bad).is_err(), "accepted `{bad}`");
        }
    }

    #[test]
    fn display_round_trips_lowercased() {
        let id = HvsockServiceId::parse("00000ACB-FACB-11E6-BD58-64006A7986D3").unwrap();
        assert_eq!(id.to_string(), "00000acb-facb-11e6-bd58-64006a7986d3");
    }
}
