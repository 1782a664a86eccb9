//! Packet capture module.
//!
//! Frames come from a [`PacketSource`], are normalized into [`PacketRecord`]s
//! and persisted once per finished capture run.
//!
//! [`PacketRecord`]: crate::db::PacketRecord

mod normalize;
mod session;
mod source;
mod stats;

pub use normalize::*;
pub use session::*;
pub use source::*;
pub use stats::*;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::Protocol;

/// Capture error types.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Missing OS permission. Never retried automatically.
    #[error("packet capture not permitted: {message}")]
    CapabilityDenied {
        message: String,
        instructions: PermissionInstructions,
    },
    #[error("packet source unavailable: {0}")]
    Unavailable(String),
    #[error("packet capture failed: {0}")]
    Runtime(String),
}

impl CaptureError {
    pub(crate) fn from_source(err: SourceError, platform: Platform) -> Self {
        match err {
            SourceError::PermissionDenied(message) => CaptureError::CapabilityDenied {
                message,
                instructions: platform.instructions(),
            },
            SourceError::Unavailable(message) => CaptureError::Unavailable(message),
            SourceError::Io(message) => CaptureError::Runtime(message),
        }
    }
}

/// Protocol restriction for a capture run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProtocolFilter {
    Tcp,
    Udp,
    Icmp,
    Ip,
    #[default]
    All,
}

impl ProtocolFilter {
    /// Parse a filter name. Unrecognized names mean no filter.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => ProtocolFilter::Tcp,
            "udp" => ProtocolFilter::Udp,
            "icmp" => ProtocolFilter::Icmp,
            "ip" => ProtocolFilter::Ip,
            _ => ProtocolFilter::All,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolFilter::Tcp => "tcp",
            ProtocolFilter::Udp => "udp",
            ProtocolFilter::Icmp => "icmp",
            ProtocolFilter::Ip => "ip",
            ProtocolFilter::All => "all",
        }
    }

    /// Whether a normalized record passes this filter. Every normalized
    /// record carries a network-layer header, so `Ip` admits all of them.
    pub fn matches(&self, protocol: Protocol) -> bool {
        match self {
            ProtocolFilter::Tcp => protocol == Protocol::Tcp,
            ProtocolFilter::Udp => protocol == Protocol::Udp,
            ProtocolFilter::Icmp => protocol == Protocol::Icmp,
            ProtocolFilter::Ip | ProtocolFilter::All => true,
        }
    }

    /// Kernel filter expression for backends that support one.
    pub fn bpf(&self) -> Option<&'static str> {
        match self {
            ProtocolFilter::Tcp => Some("tcp"),
            ProtocolFilter::Udp => Some("udp"),
            ProtocolFilter::Icmp => Some("icmp or icmp6"),
            ProtocolFilter::Ip => Some("ip or ip6"),
            ProtocolFilter::All => None,
        }
    }

    /// Filters offered to clients, with display labels.
    pub fn supported() -> Vec<(&'static str, &'static str)> {
        vec![
            ("tcp", "TCP"),
            ("udp", "UDP"),
            ("ip", "IP"),
            ("icmp", "ICMP"),
            ("all", "All Protocols"),
        ]
    }
}

impl From<String> for ProtocolFilter {
    fn from(s: String) -> Self {
        ProtocolFilter::parse(&s)
    }
}

impl From<ProtocolFilter> for String {
    fn from(f: ProtocolFilter) -> Self {
        f.as_str().to_string()
    }
}

/// Operating system family, for remediation text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    pub fn instructions(&self) -> PermissionInstructions {
        let exe = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "netpulse".to_string());

        let methods = match self {
            Platform::Linux => vec![
                RemediationMethod::new(
                    "Grant capture capabilities",
                    format!("sudo setcap cap_net_raw,cap_net_admin=eip {}", exe),
                    "Allows raw packet capture without running the whole service as root. Re-apply after every rebuild.",
                ),
                RemediationMethod::new(
                    "Run with sudo",
                    format!("sudo {}", exe),
                    "Runs the service as root.",
                ),
            ],
            Platform::MacOs => vec![
                RemediationMethod::new(
                    "Run with sudo",
                    format!("sudo {}", exe),
                    "Runs the service as root, which can open /dev/bpf devices.",
                ),
                RemediationMethod::new(
                    "Grant BPF device access",
                    "sudo chmod o+r /dev/bpf*".to_string(),
                    "Lets non-root users read BPF devices until the next reboot.",
                ),
            ],
            Platform::Windows => vec![
                RemediationMethod::new(
                    "Run as Administrator",
                    format!("Start-Process -FilePath '{}' -Verb RunAs", exe),
                    "Starts the service from an elevated PowerShell.",
                ),
                RemediationMethod::new(
                    "Install Npcap",
                    "https://npcap.com/#download".to_string(),
                    "Packet capture on Windows needs the Npcap driver.",
                ),
            ],
        };

        PermissionInstructions {
            os: self.name(),
            methods,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Platform::Linux => "Linux",
            Platform::MacOs => "macOS",
            Platform::Windows => "Windows",
        }
    }
}

/// One way to obtain capture permission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemediationMethod {
    pub method: String,
    pub command: String,
    pub description: String,
}

impl RemediationMethod {
    fn new(method: &str, command: String, description: &str) -> Self {
        Self {
            method: method.to_string(),
            command,
            description: description.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PermissionInstructions {
    pub os: &'static str,
    pub methods: Vec<RemediationMethod>,
}

/// Whether this process can capture packets right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureCapability {
    pub has_permission: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<PermissionInstructions>,
}
