//! Guest transport addressing.

use crate::error::{Result, TransportError};
use crate::hvsock::HvsockServiceId;
use crate::vsock::VsockAddr;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A guest-side transport address.
///
/// Textual forms:
///
/// - `vsock:<cid>:<port>`: AF_VSOCK, cid `any` for listening
/// - `hvsock:<service-guid>`: Hyper-V socket service
/// - `9p:<dir>`: 9P channel base directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestAddr {
    /// AF_VSOCK `(cid, port)` pair.
    Vsock(VsockAddr),
    /// Hyper-V socket service GUID.
    Hvsock(HvsockServiceId),
    /// 9P channel base directory.
    Ninep(PathBuf),
}

impl FromStr for GuestAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| TransportError::InvalidAddress(format!("`{s}`: missing scheme")))?;
        match scheme {
            "vsock" => Ok(Self::Vsock(VsockAddr::parse(rest)?)),
            "hvsock" => Ok(Self::Hvsock(HvsockServiceId::parse(rest)?)),
            "9p" => {
                if rest.is_empty() {
                    return Err(TransportError::InvalidAddress(format!(
                        "`{s}`: empty channel directory"
                    )));
                }
                Ok(Self::Ninep(PathBuf::from(rest)))
            }
            other => Err(TransportError::InvalidAddress(format!(
                "unknown transport scheme `{other}`"
            ))),
        }
    }
}

impl fmt::Display for GuestAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vsock(addr) => write!(f, "vsock:{addr}"),
            Self::Hvsock(id) => write!(f, "hvsock:{id}"),
            Self::Ninep(dir) => write!(f, "9p:{}", dir.display()),
        }
    }
}
