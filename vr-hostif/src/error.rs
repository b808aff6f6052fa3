//! Error types for the host-interface datapath.
//!
//! Nothing in the datapath is fatal: failures free the frame involved and
//! surface either as a [`DropReason`] (counted in [`crate::stats::DropStats`])
//! or as one of the typed errors below.

use std::io;
use thiserror::Error;

/// Reason a frame or packet was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DropReason {
    /// Buffer offsets do not fit the packet representation.
    #[error("invalid packet")]
    InvalidPacket,
    /// Label outside the router's label table.
    #[error("invalid label")]
    InvalidLabel,
    /// Label resolved to no next-hop.
    #[error("invalid nexthop")]
    InvalidNexthop,
    /// Interface missing or of the wrong kind.
    #[error("invalid interface")]
    InvalidIf,
    /// Catch-all for stale steering and unexpected state.
    #[error("miscellaneous")]
    Misc,
    /// Header could not be located or a transmit was rejected.
    #[error("no memory")]
    NoMemory,
    /// GRO input queue overflow.
    #[error("gro queue full")]
    QueueFull,
    /// Destination core's mailbox is full.
    #[error("core backlog full")]
    BacklogFull,
    /// Segmentation produced nothing or failed.
    #[error("gso failed")]
    GsoFailed,
    /// No host device attached, or the interface is being torn down.
    #[error("interface down")]
    InterfaceDown,
}

impl DropReason {
    /// All reasons, in counter order.
    pub const ALL: [DropReason; 10] = [
        DropReason::InvalidPacket,
        DropReason::InvalidLabel,
        DropReason::InvalidNexthop,
        DropReason::InvalidIf,
        DropReason::Misc,
        DropReason::NoMemory,
        DropReason::QueueFull,
        DropReason::BacklogFull,
        DropReason::GsoFailed,
        DropReason::InterfaceDown,
    ];

    /// Number of distinct reasons.
    pub const COUNT: usize = Self::ALL.len();

    /// Dense index used by the drop counters.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Short machine-readable name.
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::InvalidPacket => "invalid_packet",
            DropReason::InvalidLabel => "invalid_label",
            DropReason::InvalidNexthop => "invalid_nexthop",
            DropReason::InvalidIf => "invalid_if",
            DropReason::Misc => "misc",
            DropReason::NoMemory => "no_memory",
            DropReason::QueueFull => "queue_full",
            DropReason::BacklogFull => "backlog_full",
            DropReason::GsoFailed => "gso_failed",
            DropReason::InterfaceDown => "interface_down",
        }
    }
}

/// Host device transmit/deliver failure.
#[derive(Debug, Error)]
pub enum TxError {
    #[error("device {0} is down")]
    DeviceDown(String),
    #[error("device queue full")]
    QueueFull,
    #[error("frame rejected: {0}")]
    Rejected(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Software fragmentation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    #[error("network header is not IPv4")]
    NotIpv4,
    #[error("truncated header")]
    Truncated,
    #[error("mtu {mtu} leaves no room for payload")]
    MtuTooSmall { mtu: usize },
    #[error("payload of {payload} bytes fits a single fragment of {frag_size}")]
    SingleFragment { payload: usize, frag_size: usize },
    #[error("checksum could not be resolved")]
    Checksum,
}

/// Software segmentation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GsoError {
    #[error("frame has no segmentation descriptor")]
    NoDescriptor,
    #[error("segment size is zero")]
    ZeroSize,
    #[error("truncated header")]
    Truncated,
    #[error("unsupported segmentation kind")]
    Unsupported,
    #[error("fragmentation failed: {0}")]
    Fragment(#[from] FragmentError),
}

/// Configuration loading/validation failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Control-path failure (attach, table updates, topology).
#[derive(Debug, Error)]
pub enum DatapathError {
    #[error("interface {0} already has a host device attached")]
    AlreadyAttached(u32),
    #[error("interface {0} has no host device attached")]
    NotAttached(u32),
    #[error("interface index {idx} out of range (max {max})")]
    InterfaceOutOfRange { idx: u32, max: usize },
    #[error("label {label} out of range (max {max})")]
    LabelOutOfRange { label: u32, max: usize },
    #[error("router {0} not found")]
    RouterNotFound(u16),
    #[error("core {core} out of range ({cores} cores)")]
    CoreOutOfRange { core: usize, cores: usize },
    #[error("topology error: {0}")]
    Topology(String),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("system error: {0}")]
    Sys(#[from] nix::errno::Errno),
}

pub type Result<T> = std::result::Result<T, DatapathError>;
