//! AF_VSOCK stream transport.
//!
//! Guest-side listening and host dialing over the virtio socket address
//! family. Hyper-V socket services on Linux guests surface through the same
//! family (see [`crate::hvsock`]).
//!
//! ## CID (Context ID) Values
//!
//! - `VMADDR_CID_HYPERVISOR` (0): reserved for the hypervisor
//! - `VMADDR_CID_LOCAL` (1): local communication
//! - `VMADDR_CID_HOST` (2): the host, from the guest's perspective
//! - 3+: guest VMs

use crate::error::{Result, TransportError};
use std::fmt;

/// Vsock address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsockAddr {
    /// Context ID.
    pub cid: u32,
    /// Port number.
    pub port: u32,
}

impl VsockAddr {
    /// Hypervisor CID (reserved).
    pub const CID_HYPERVISOR: u32 = 0;
    /// Local CID.
    pub const CID_LOCAL: u32 = 1;
    /// Host CID (from guest perspective).
    pub const CID_HOST: u32 = 2;
    /// Any CID (for binding).
    pub const CID_ANY: u32 = u32::MAX;

    /// Creates a new vsock address.
    #[must_use]
    pub const fn new(cid: u32, port: u32) -> Self {
        Self { cid, port }
    }

    /// Creates an address for the host (from guest perspective).
    #[must_use]
    pub const fn host(port: u32) -> Self {
        Self::new(Self::CID_HOST, port)
    }

    /// Creates an address for any CID (for binding).
    #[must_use]
    pub const fn any(port: u32) -> Self {
        Self::new(Self::CID_ANY, port)
    }

    /// Parses the `<cid>:<port>` form, where cid may be `any` or `host`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] on malformed input.
    pub fn parse(s: &str) -> Result<Self> {
        let (cid_str, port_str) = s
            .split_once(':')
            .ok_or_else(|| TransportError::InvalidAddress(format!("vsock address `{s}`")))?;
        let cid = match cid_str {
            "any" => Self::CID_ANY,
            "host" => Self::CID_HOST,
            other => other
                .parse()
                .map_err(|_| TransportError::InvalidAddress(format!("vsock cid `{other}`")))?,
        };
        let port = port_str
            .parse()
            .map_err(|_| TransportError::InvalidAddress(format!("vsock port `{port_str}`")))?;
        Ok(Self { cid, port })
    }
}

impl fmt::Display for VsockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cid == Self::CID_ANY {
            write!(f, "any:{}", self.port)
        } else {
            write!(f, "{}:{}", self.cid, self.port)
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::{connect, VsockListener};

#[cfg(target_os = "linux")]
mod linux {
    use super::VsockAddr;
    use crate::fd::{set_nonblocking, FdEndpoint};
    use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
    use std::io;
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use tokio::io::unix::AsyncFd;

    /// Raw sockaddr_vm structure for vsock.
    #[repr(C)]
    struct SockaddrVm {
        svm_family: libc::sa_family_t,
        svm_reserved1: u16,
        svm_port: u32,
        svm_cid: u32,
        svm_flags: u8,
        svm_zero: [u8; 3],
    }

    impl SockaddrVm {
        #[allow(clippy::cast_possible_truncation)]
        fn new(cid: u32, port: u32) -> Self {
            Self {
                svm_family: libc::AF_VSOCK as libc::sa_family_t,
                svm_reserved1: 0,
                svm_port: port,
                svm_cid: cid,
                svm_flags: 0,
                svm_zero: [0; 3],
            }
        }
    }

    fn create_socket() -> io::Result<OwnedFd> {
        socket(
            AddressFamily::Vsock,
            SockType::Stream,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(io::Error::from)
    }

    /// Connects to a vsock address, returning a duplex endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or the connection is
    /// refused. Dial retrying is the caller's concern.
    #[allow(clippy::cast_possible_truncation)]
    pub fn connect(addr: VsockAddr) -> io::Result<FdEndpoint> {
        let fd = create_socket()?;

        let sockaddr = SockaddrVm::new(addr.cid, addr.port);
        let sockaddr_ptr = std::ptr::addr_of!(sockaddr).cast::<libc::sockaddr>();

        // SAFETY: sockaddr is a properly initialized sockaddr_vm.
        let result = unsafe {
            libc::connect(
                fd.as_raw_fd(),
                sockaddr_ptr,
                mem::size_of::<SockaddrVm>() as libc::socklen_t,
            )
        };
        if result < 0 {
            return Err(io::Error::last_os_error());
        }

        tracing::debug!(%addr, "vsock connected");
        FdEndpoint::from_owned_fd(fd)
    }

    /// Listener for incoming vsock connections.
    pub struct VsockListener {
        inner: AsyncFd<OwnedFd>,
        addr: VsockAddr,
    }

    impl VsockListener {
        /// Binds and listens on the given address.
        ///
        /// # Errors
        ///
        /// Returns an error if the socket cannot be created, bound, or put
        /// into listening mode.
        #[allow(clippy::cast_possible_truncation)]
        pub fn bind(addr: VsockAddr) -> io::Result<Self> {
            let fd = create_socket()?;

            let sockaddr = SockaddrVm::new(addr.cid, addr.port);
            let sockaddr_ptr = std::ptr::addr_of!(sockaddr).cast::<libc::sockaddr>();

            // SAFETY: sockaddr is a properly initialized sockaddr_vm.
            let result = unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    sockaddr_ptr,
                    mem::size_of::<SockaddrVm>() as libc::socklen_t,
                )
            };
            if result < 0 {
                return Err(io::Error::last_os_error());
            }

            // SAFETY: listen on a freshly bound fd.
            let result = unsafe { libc::listen(fd.as_raw_fd(), 128) };
            if result < 0 {
                return Err(io::Error::last_os_error());
            }

            set_nonblocking(fd.as_raw_fd())?;
            tracing::debug!(%addr, "vsock listener bound");
            Ok(Self {
                inner: AsyncFd::new(fd)?,
                addr,
            })
        }

        /// Returns the bound address.
        #[must_use]
        pub fn local_addr(&self) -> VsockAddr {
            self.addr
        }

        /// Accepts the next incoming connection.
        ///
        /// # Errors
        ///
        /// Returns an error when accept fails; the listener is unusable
        /// afterwards and callers treat this as fatal.
        pub async fn accept(&self) -> io::Result<(FdEndpoint, VsockAddr)> {
            loop {
                let mut guard = self.inner.readable().await?;
                match guard.try_io(|inner| {
                    let mut sockaddr = SockaddrVm::new(0, 0);
                    #[allow(clippy::cast_possible_truncation)]
                    let mut len = mem::size_of::<SockaddrVm>() as libc::socklen_t;

                    // SAFETY: accept4 writes the peer address into sockaddr.
                    let fd = unsafe {
                        libc::accept4(
                            inner.get_ref().as_raw_fd(),
                            std::ptr::addr_of_mut!(sockaddr).cast::<libc::sockaddr>(),
                            &mut len,
                            libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                        )
                    };
                    if fd < 0 {
                        return Err(io::Error::last_os_error());
                    }

                    // SAFETY: accept4 returned a fresh fd we now own.
                    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                    Ok((owned, VsockAddr::new(sockaddr.svm_cid, sockaddr.svm_port)))
                }) {
                    Ok(Ok((owned, peer))) => {
                        return Ok((FdEndpoint::from_owned_fd(owned)?, peer));
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(_would_block) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_constructors() {
        let addr = VsockAddr::new(3, 1234);
        assert_eq!(addr.cid, 3);
        assert_eq!(addr.port, 1234);

        let host = VsockAddr::host(4089);
        assert_eq!(host.cid, VsockAddr::CID_HOST);
        assert_eq!(host.port, 4089);
    }

    #[test]
    fn addr_parse_forms() {
        assert_eq!(VsockAddr::parse("3:1025").unwrap(), VsockAddr::new(3, 1025));
        assert_eq!(
            VsockAddr::parse("any:80").unwrap(),
            VsockAddr::any(80)
        );
        assert_eq!(
            VsockAddr::parse("host:514").unwrap(),
            VsockAddr::host(514)
        );

        assert!(VsockAddr::parse("1025").is_err());
        assert!(VsockAddr::parse("x:1025").is_err());
        assert!(VsockAddr::parse("3:").is_err());
    }

    #[test]
    fn addr_display_round_trip() {
        for addr in [VsockAddr::new(3, 1025), VsockAddr::any(80)] {
            assert_eq!(VsockAddr::parse(&addr.to_string()).unwrap(), addr);
        }
    }
}
