//! Raw frame sources.
//!
//! On Linux the default source is an `AF_PACKET` raw socket. With the `pcap`
//! feature libpcap is used instead, which also covers macOS and Windows.

use chrono::{DateTime, Utc};
use std::io;
use std::time::Duration;
use thiserror::Error;

use super::ProtocolFilter;

/// Link layer framing of a captured buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    /// Starts directly with an IPv4/IPv6 header.
    RawIp,
}

/// A frame exactly as delivered by the source.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Vec<u8>,
    /// Length on the wire, which may exceed `data.len()` when truncated by snaplen.
    pub original_len: u32,
    pub link: LinkType,
    pub captured_at: DateTime<Utc>,
}

/// Source-level failures, classified before any platform context is attached.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("{0}")]
    PermissionDenied(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Io(String),
}

impl From<io::Error> for SourceError {
    fn from(e: io::Error) -> Self {
        // EPERM and EACCES both map to PermissionDenied.
        if e.kind() == io::ErrorKind::PermissionDenied || is_permission_message(&e.to_string()) {
            SourceError::PermissionDenied(e.to_string())
        } else {
            SourceError::Io(e.to_string())
        }
    }
}

/// Recognise permission failures reported only as text (libpcap, Npcap).
pub fn is_permission_message(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("operation not permitted")
        || msg.contains("permission denied")
        || msg.contains("don't have permission")
        || msg.contains("access is denied")
}

/// Yields raw frames one at a time.
pub trait PacketSource {
    /// Wait up to `wait` for the next frame. `Ok(None)` means nothing arrived.
    fn next_frame(&mut self, wait: Duration) -> Result<Option<RawFrame>, SourceError>;
}

/// Opens packet sources. One source per capture run.
pub trait CaptureBackend: Send + Sync {
    fn open(&self, filter: ProtocolFilter) -> Result<Box<dyn PacketSource>, SourceError>;
}

/// The platform's native capture mechanism.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemBackend;

impl CaptureBackend for SystemBackend {
    fn open(&self, filter: ProtocolFilter) -> Result<Box<dyn PacketSource>, SourceError> {
        open_system_source(filter)
    }
}

#[cfg(feature = "pcap")]
fn open_system_source(filter: ProtocolFilter) -> Result<Box<dyn PacketSource>, SourceError> {
    Ok(Box::new(libpcap::PcapSource::open(filter)?))
}

#[cfg(all(not(feature = "pcap"), target_os = "linux"))]
fn open_system_source(_filter: ProtocolFilter) -> Result<Box<dyn PacketSource>, SourceError> {
    // Filtering happens after normalization for raw sockets.
    Ok(Box::new(raw::RawSocketSource::open()?))
}

#[cfg(all(not(feature = "pcap"), not(target_os = "linux")))]
fn open_system_source(_filter: ProtocolFilter) -> Result<Box<dyn PacketSource>, SourceError> {
    Err(SourceError::Unavailable(
        "raw socket capture is only available on Linux; build with the `pcap` feature".to_string(),
    ))
}

#[cfg(all(not(feature = "pcap"), target_os = "linux"))]
mod raw {
    use super::{LinkType, PacketSource, RawFrame, SourceError};
    use chrono::Utc;
    use socket2::{Domain, Protocol, Socket, Type};
    use std::io::{self, Read};
    use std::time::Duration;

    /// All ethertypes, from linux/if_ether.h.
    const ETH_P_ALL: u16 = 0x0003;
    const SNAPLEN: usize = 65535;
    const MIN_WAIT: Duration = Duration::from_millis(1);

    pub struct RawSocketSource {
        socket: Socket,
        buf: Vec<u8>,
    }

    impl RawSocketSource {
        /// Needs CAP_NET_RAW; fails with EPERM otherwise.
        pub fn open() -> Result<Self, SourceError> {
            let protocol = Protocol::from(i32::from(ETH_P_ALL.to_be()));
            let socket = Socket::new(Domain::PACKET, Type::RAW, Some(protocol))?;
            tracing::debug!("Capture: opened AF_PACKET raw socket");
            Ok(Self {
                socket,
                buf: vec![0u8; SNAPLEN],
            })
        }
    }

    impl PacketSource for RawSocketSource {
        fn next_frame(&mut self, wait: Duration) -> Result<Option<RawFrame>, SourceError> {
            // A zero read timeout is rejected by the OS.
            self.socket.set_read_timeout(Some(wait.max(MIN_WAIT)))?;

            match self.socket.read(&mut self.buf) {
                Ok(n) => Ok(Some(RawFrame {
                    data: self.buf[..n].to_vec(),
                    original_len: u32::try_from(n).unwrap_or(u32::MAX),
                    link: LinkType::Ethernet,
                    captured_at: Utc::now(),
                })),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) =>
                {
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}

#[cfg(feature = "pcap")]
mod libpcap {
    use super::{is_permission_message, LinkType, PacketSource, ProtocolFilter, RawFrame, SourceError};
    use chrono::Utc;
    use std::time::Duration;

    /// libpcap read timeout; `next_frame` returns `None` after this much idle time.
    const POLL_MS: i32 = 250;

    pub struct PcapSource {
        cap: pcap::Capture<pcap::Active>,
        link: LinkType,
    }

    fn classify(e: pcap::Error) -> SourceError {
        let msg = e.to_string();
        if is_permission_message(&msg) {
            SourceError::PermissionDenied(msg)
        } else {
            SourceError::Io(msg)
        }
    }

    impl PcapSource {
        pub fn open(filter: ProtocolFilter) -> Result<Self, SourceError> {
            let device = pcap::Device::lookup()
                .map_err(classify)?
                .ok_or_else(|| SourceError::Unavailable("no capture device found".to_string()))?;
            tracing::debug!("Capture: using pcap device {}", device.name);

            let mut cap = pcap::Capture::from_device(device)
                .map_err(classify)?
                .snaplen(65535)
                .timeout(POLL_MS)
                .open()
                .map_err(classify)?;

            if let Some(expr) = filter.bpf() {
                cap.filter(expr, true).map_err(classify)?;
            }

            let link = match cap.get_datalink().0 {
                1 => LinkType::Ethernet,
                12 | 101 => LinkType::RawIp,
                other => {
                    return Err(SourceError::Unavailable(format!(
                        "unsupported link type {}",
                        other
                    )))
                }
            };

            Ok(Self { cap, link })
        }
    }

    impl PacketSource for PcapSource {
        fn next_frame(&mut self, _wait: Duration) -> Result<Option<RawFrame>, SourceError> {
            match self.cap.next_packet() {
                Ok(packet) => Ok(Some(RawFrame {
                    data: packet.data.to_vec(),
                    original_len: packet.header.len,
                    link: self.link,
                    captured_at: Utc::now(),
                })),
                Err(pcap::Error::TimeoutExpired) => Ok(None),
                Err(e) => Err(classify(e)),
            }
        }
    }
}
