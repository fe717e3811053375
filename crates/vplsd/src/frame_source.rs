//! Sources of raw Ethernet frames mirrored to the controller.
//!
//! On Linux, [`PacketSocketSource`] reads from an `AF_PACKET` socket bound
//! to the switch's CPU interface. [`ChannelFrameSource`] is fed from memory.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Blocking-free stream of captured frames.
#[async_trait]
pub trait FrameSource: Send {
    /// Interface or label the frames come from.
    fn interface(&self) -> &str;

    /// Next captured frame; `None` once the source is exhausted.
    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Frame source backed by an mpsc channel.
pub struct ChannelFrameSource {
    label: String,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl ChannelFrameSource {
    pub fn new(label: impl Into<String>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            label: label.into(),
            rx,
        }
    }
}

/// Creates a channel-backed source and the sender that feeds it.
pub fn channel(label: impl Into<String>, capacity: usize) -> (mpsc::Sender<Vec<u8>>, ChannelFrameSource) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, ChannelFrameSource::new(label, rx))
}

#[async_trait]
impl FrameSource for ChannelFrameSource {
    fn interface(&self) -> &str {
        &self.label
    }

    async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(target_os = "linux")]
pub use linux::PacketSocketSource;

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use async_trait::async_trait;
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, info};

    use super::FrameSource;
    use crate::error::{Result, VplsError};

    const MAX_FRAME_LEN: usize = 65536;

    /// Raw capture on one interface.
    pub struct PacketSocketSource {
        interface: String,
        fd: AsyncFd<OwnedFd>,
        buffer: Vec<u8>,
    }

    impl PacketSocketSource {
        /// Opens a non-blocking `AF_PACKET` socket bound to `interface`.
        ///
        /// Requires `CAP_NET_RAW`.
        pub fn open(interface: &str) -> Result<Self> {
            let ifindex = nix::net::if_::if_nametoindex(interface).map_err(|e| {
                VplsError::capture(interface, format!("Unknown interface: {}", e))
            })?;
            let protocol = (libc::ETH_P_ALL as u16).to_be();

            let fd = unsafe {
                let raw = libc::socket(
                    libc::AF_PACKET,
                    libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                    i32::from(protocol),
                );
                if raw < 0 {
                    return Err(VplsError::capture(
                        interface,
                        format!("Failed to create packet socket: {}", io::Error::last_os_error()),
                    ));
                }
                OwnedFd::from_raw_fd(raw)
            };

            let ret = unsafe {
                let mut addr: libc::sockaddr_ll = mem::zeroed();
                addr.sll_family = libc::AF_PACKET as u16;
                addr.sll_protocol = protocol;
                addr.sll_ifindex = ifindex as i32;
                libc::bind(
                    fd.as_raw_fd(),
                    &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(VplsError::capture(
                    interface,
                    format!("Failed to bind packet socket: {}", io::Error::last_os_error()),
                ));
            }

            let fd = AsyncFd::new(fd).map_err(|e| {
                VplsError::capture(interface, format!("Failed to register socket: {}", e))
            })?;

            info!(interface, ifindex, "Opened packet capture socket");
            Ok(Self {
                interface: interface.to_string(),
                fd,
                buffer: vec![0; MAX_FRAME_LEN],
            })
        }
    }

    /// Reads one frame, returning its length and whether we sent it.
    fn recv_frame(fd: &OwnedFd, buf: &mut [u8]) -> io::Result<(usize, bool)> {
        unsafe {
            let mut addr: libc::sockaddr_ll = mem::zeroed();
            let mut addr_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
            let n = libc::recvfrom(
                fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut addr as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                &mut addr_len,
            );
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok((n as usize, addr.sll_pkttype == libc::PACKET_OUTGOING))
        }
    }

    #[async_trait]
    impl FrameSource for PacketSocketSource {
        fn interface(&self) -> &str {
            &self.interface
        }

        async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| recv_frame(inner.get_ref(), &mut self.buffer)) {
                    Ok(Ok((_, true))) => continue,
                    Ok(Ok((len, false))) => {
                        debug!(interface = %self.interface, len, "Captured frame");
                        return Ok(Some(self.buffer[..len].to_vec()));
                    }
                    Ok(Err(e)) => {
                        return Err(VplsError::capture(
                            &self.interface,
                            format!("Receive error: {}", e),
                        ))
                    }
                    // Spurious wakeup
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use unsupported::PacketSocketSource;

#[cfg(not(target_os = "linux"))]
mod unsupported {
    use async_trait::async_trait;

    use super::FrameSource;
    use crate::error::{Result, VplsError};

    pub struct PacketSocketSource {
        interface: String,
    }

    impl PacketSocketSource {
        pub fn open(interface: &str) -> Result<Self> {
            Err(VplsError::capture(
                interface,
                "Raw packet capture is only supported on Linux",
            ))
        }
    }

    #[async_trait]
    impl FrameSource for PacketSocketSource {
        fn interface(&self) -> &str {
            &self.interface
        }

        async fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }
}
