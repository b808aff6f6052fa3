//! Interface model and the host-device seam.
//!
//! An [`Interface`] (vif) is the forwarding engine's view of a port. While a
//! host device is attached the interface owns it exclusively; transmit and
//! host-stack delivery go through the [`HostDevice`] trait. Virtual
//! interfaces also carry the GRO input queue that feeds the reinjection path.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::config::GroConfig;
use crate::error::TxError;
use crate::frame::{ETH_HLEN, Frame};
use crate::gro::GroContext;
use crate::stats::InterfaceCounters;

/// Interface kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VifType {
    /// Physical port facing the underlay.
    Physical,
    /// Tap facing a VM or container.
    Virtual,
    /// Host stack (tunnel terminus).
    Host,
    /// Management channel to the agent.
    Agent,
}

impl fmt::Display for VifType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VifType::Physical => "physical",
            VifType::Virtual => "virtual",
            VifType::Host => "host",
            VifType::Agent => "agent",
        };
        f.write_str(name)
    }
}

/// A host network device the datapath sends to and delivers through.
pub trait HostDevice: Send + Sync {
    fn name(&self) -> &str;

    fn mtu(&self) -> usize;

    /// Link-layer header length.
    fn hard_header_len(&self) -> usize {
        ETH_HLEN
    }

    /// Queue a frame for transmission on the wire.
    fn queue_xmit(&self, frame: Frame) -> Result<(), TxError>;

    /// Deliver a frame to the host network stack.
    fn netif_rx(&self, frame: Frame) -> Result<(), TxError>;
}

/// Attached device handle.
pub struct DeviceHandle(Box<dyn HostDevice>);

impl DeviceHandle {
    pub fn device(&self) -> &dyn HostDevice {
        self.0.as_ref()
    }
}

impl std::ops::Deref for DeviceHandle {
    type Target = dyn HostDevice;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

/// Forwarding-engine interface.
pub struct Interface {
    idx: u32,
    rid: u16,
    vrf: u16,
    kind: VifType,
    name: String,
    device: ArcSwapOption<DeviceHandle>,
    gro: Option<GroContext>,
    counters: InterfaceCounters,
}

/// Builder for creating an Interface
pub struct InterfaceBuilder {
    idx: u32,
    kind: VifType,
    rid: u16,
    vrf: u16,
    name: Option<String>,
    gro: GroConfig,
}

impl InterfaceBuilder {
    pub fn new(idx: u32, kind: VifType) -> Self {
        Self {
            idx,
            kind,
            rid: 0,
            vrf: 0,
            name: None,
            gro: GroConfig::default(),
        }
    }

    pub fn rid(mut self, rid: u16) -> Self {
        self.rid = rid;
        self
    }

    pub fn vrf(mut self, vrf: u16) -> Self {
        self.vrf = vrf;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// GRO queue settings, used for virtual interfaces only.
    pub fn gro(mut self, gro: GroConfig) -> Self {
        self.gro = gro;
        self
    }

    pub fn build(self) -> Arc<Interface> {
        let gro = (self.kind == VifType::Virtual)
            .then(|| GroContext::new(self.gro.queue_limit, self.gro.overflow));
        Arc::new(Interface {
            idx: self.idx,
            rid: self.rid,
            vrf: self.vrf,
            kind: self.kind,
            name: self
                .name
                .unwrap_or_else(|| format!("vif{}/{}", self.rid, self.idx)),
            device: ArcSwapOption::empty(),
            gro,
            counters: InterfaceCounters::default(),
        })
    }
}

impl Interface {
    pub fn builder(idx: u32, kind: VifType) -> InterfaceBuilder {
        InterfaceBuilder::new(idx, kind)
    }

    pub fn idx(&self) -> u32 {
        self.idx
    }

    pub fn rid(&self) -> u16 {
        self.rid
    }

    pub fn vrf(&self) -> u16 {
        self.vrf
    }

    pub fn kind(&self) -> VifType {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_physical(&self) -> bool {
        self.kind == VifType::Physical
    }

    pub fn is_virtual(&self) -> bool {
        self.kind == VifType::Virtual
    }

    /// Current device, if attached.
    pub fn device(&self) -> Option<Arc<DeviceHandle>> {
        self.device.load_full()
    }

    pub fn has_device(&self) -> bool {
        self.device.load().is_some()
    }

    /// Install the host device. Returns false if one is already attached.
    pub(crate) fn install_device(&self, device: Box<dyn HostDevice>) -> bool {
        if self.device.load().is_some() {
            return false;
        }
        self.device.store(Some(Arc::new(DeviceHandle(device))));
        true
    }

    /// Remove the host device, returning it.
    pub(crate) fn take_device(&self) -> Option<Arc<DeviceHandle>> {
        self.device.swap(None)
    }

    /// MTU of the attached device (0 when detached).
    pub fn mtu(&self) -> usize {
        self.device.load_full().map_or(0, |d| d.mtu())
    }

    pub fn hard_header_len(&self) -> usize {
        self.device
            .load_full()
            .map_or(ETH_HLEN, |d| d.hard_header_len())
    }

    pub fn gro(&self) -> Option<&GroContext> {
        self.gro.as_ref()
    }

    pub fn counters(&self) -> &InterfaceCounters {
        &self.counters
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("idx", &self.idx)
            .field("rid", &self.rid)
            .field("vrf", &self.vrf)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("attached", &self.has_device())
            .finish()
    }
}

impl fmt::Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}:{})", self.name, self.kind, self.idx)
    }
}
