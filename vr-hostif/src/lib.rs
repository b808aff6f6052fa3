pub mod checksum;
pub mod config;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod frame;
pub mod gro;
pub mod gso;
pub mod interface;
pub mod packet;
pub mod receive;
pub mod reinject;
pub mod rewrite;
pub mod router;
pub mod rps;
pub mod runtime;
pub mod stats;
pub mod test_util;
pub mod transmit;

pub use config::DatapathConfig;
pub use engine::ForwardingEngine;
pub use error::{DatapathError, DropReason, Result};
pub use frame::Frame;
pub use interface::{HostDevice, Interface, VifType};
pub use packet::{Packet, PacketFlags, PacketType};
pub use receive::{Datapath, DatapathBuilder};
