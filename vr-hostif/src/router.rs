//! Router registry, interface tables and label tables.
//!
//! All tables are read on the packet path and written by the control path.
//! Readers load an immutable snapshot through `ArcSwap`; writers clone the
//! current snapshot, replace whole entries and store the result. Nothing is
//! mutated in place and the read path never takes a lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::debug;

use crate::error::{DatapathError, DropReason, Result};
use crate::interface::Interface;

/// Label value carried in the 4-byte label header, right-shifted by this.
pub const LABEL_SHIFT: u32 = 12;

/// Length of the label header pushed in front of GRO-bound frames.
pub const LABEL_HDR_LEN: usize = 4;

/// Forwarding next-hop resolved from a label.
pub struct NextHop {
    id: u32,
    vif: Option<Arc<Interface>>,
}

impl NextHop {
    pub fn new(id: u32, vif: Option<Arc<Interface>>) -> Arc<Self> {
        Arc::new(Self { id, vif })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Outgoing interface.
    pub fn vif(&self) -> Option<&Arc<Interface>> {
        self.vif.as_ref()
    }
}

impl fmt::Debug for NextHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NextHop")
            .field("id", &self.id)
            .field("vif", &self.vif.as_ref().map(|v| v.idx()))
            .finish()
    }
}

/// Fixed-size table indexed by label.
#[derive(Clone, Default)]
pub struct LabelTable {
    entries: Vec<Option<Arc<NextHop>>>,
}

impl LabelTable {
    pub fn new(size: usize) -> Self {
        Self {
            entries: vec![None; size],
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, label: u32) -> Option<&Arc<NextHop>> {
        self.entries.get(label as usize).and_then(Option::as_ref)
    }
}

/// Extract the label from a 4-byte label header word.
pub fn label_from_header(word: u32) -> u32 {
    word >> LABEL_SHIFT
}

/// Build a label header word for `label` (bottom-of-stack, TTL 64).
pub fn label_header(label: u32) -> u32 {
    (label << LABEL_SHIFT) | 0x100 | 64
}

/// One forwarding instance.
pub struct Router {
    rid: u16,
    interfaces: ArcSwap<Vec<Option<Arc<Interface>>>>,
    labels: ArcSwap<LabelTable>,
}

impl Router {
    pub fn new(rid: u16, max_interfaces: usize, max_labels: usize) -> Self {
        Self {
            rid,
            interfaces: ArcSwap::from_pointee(vec![None; max_interfaces]),
            labels: ArcSwap::from_pointee(LabelTable::new(max_labels)),
        }
    }

    pub fn rid(&self) -> u16 {
        self.rid
    }

    pub fn max_interfaces(&self) -> usize {
        self.interfaces.load().len()
    }

    pub fn max_labels(&self) -> usize {
        self.labels.load().len()
    }

    pub fn interface(&self, idx: u32) -> Option<Arc<Interface>> {
        self.interfaces
            .load()
            .get(idx as usize)
            .and_then(|slot| slot.clone())
    }

    /// All installed interfaces.
    pub fn interfaces(&self) -> Vec<Arc<Interface>> {
        self.interfaces.load().iter().flatten().cloned().collect()
    }

    /// Install an interface in its slot, replacing any previous one.
    pub fn add_interface(&self, vif: Arc<Interface>) -> Result<()> {
        let idx = vif.idx() as usize;
        let max = self.max_interfaces();
        if idx >= max {
            return Err(DatapathError::InterfaceOutOfRange { idx: vif.idx(), max });
        }
        debug!(rid = self.rid, vif = %vif, "Adding interface");
        self.interfaces.rcu(|current| {
            let mut next = Vec::clone(current);
            next[idx] = Some(Arc::clone(&vif));
            next
        });
        Ok(())
    }

    pub fn remove_interface(&self, idx: u32) -> Option<Arc<Interface>> {
        let removed = self.interface(idx)?;
        self.interfaces.rcu(|current| {
            let mut next = Vec::clone(current);
            next[idx as usize] = None;
            next
        });
        debug!(rid = self.rid, vif = %removed, "Removed interface");
        Some(removed)
    }

    /// Install or clear the next-hop for a label. The range is checked
    /// against the table being replaced.
    pub fn set_label(&self, label: u32, nh: Option<Arc<NextHop>>) -> Result<()> {
        let mut max = None;
        self.labels.rcu(|current| {
            let mut next = LabelTable::clone(current);
            max = match next.entries.get_mut(label as usize) {
                Some(slot) => {
                    *slot = nh.clone();
                    None
                }
                None => Some(current.len()),
            };
            next
        });
        match max {
            Some(max) => Err(DatapathError::LabelOutOfRange { label, max }),
            None => Ok(()),
        }
    }

    /// Resolve a label. The table size is checked before the lookup.
    pub fn lookup_label(&self, label: u32) -> std::result::Result<Arc<NextHop>, DropReason> {
        let table = self.labels.load();
        if label as usize >= table.len() {
            return Err(DropReason::InvalidLabel);
        }
        table.get(label).cloned().ok_or(DropReason::InvalidNexthop)
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("rid", &self.rid)
            .field("max_interfaces", &self.max_interfaces())
            .field("max_labels", &self.max_labels())
            .finish()
    }
}

/// Process-wide router lookup by id.
#[derive(Default)]
pub struct RouterRegistry {
    routers: ArcSwap<HashMap<u16, Arc<Router>>>,
}

impl RouterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, rid: u16) -> Option<Arc<Router>> {
        self.routers.load().get(&rid).cloned()
    }

    /// Register a router, replacing any with the same id.
    pub fn insert(&self, router: Arc<Router>) {
        self.routers.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(router.rid(), Arc::clone(&router));
            next
        });
    }

    pub fn remove(&self, rid: u16) -> Option<Arc<Router>> {
        let removed = self.get(rid)?;
        self.routers.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(&rid);
            next
        });
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.routers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.load().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::VifType;

    #[test]
    fn test_label_lookup_outcomes() {
        let router = Router::new(0, 8, 16);
        let vif = Interface::builder(3, VifType::Virtual).build();
        router.set_label(5, Some(NextHop::new(42, Some(vif)))).unwrap();

        assert_eq!(router.lookup_label(5).unwrap().id(), 42);
        assert_eq!(router.lookup_label(6).unwrap_err(), DropReason::InvalidNexthop);
        assert_eq!(router.lookup_label(16).unwrap_err(), DropReason::InvalidLabel);
        assert!(router.set_label(16, None).is_err());
    }

    #[test]
    fn test_set_label_out_of_range() {
        let router = Router::new(0, 8, 4);
        let err = router
            .set_label(4, Some(NextHop::new(1, None)))
            .unwrap_err();
        assert!(matches!(err, DatapathError::LabelOutOfRange { label: 4, max: 4 }));
        let err = router.set_label(u32::MAX, None).unwrap_err();
        assert!(matches!(err, DatapathError::LabelOutOfRange { max: 4, .. }));

        router.set_label(3, Some(NextHop::new(7, None))).unwrap();
        assert_eq!(router.max_labels(), 4);
        assert_eq!(router.lookup_label(3).unwrap().id(), 7);
    }

    #[test]
    fn test_snapshot_survives_update() {
        let router = Router::new(0, 8, 4);
        router.set_label(1, Some(NextHop::new(1, None))).unwrap();
        let snapshot = router.labels.load_full();

        router.set_label(1, None).unwrap();
        assert_eq!(snapshot.get(1).unwrap().id(), 1);
        assert_eq!(router.lookup_label(1).unwrap_err(), DropReason::InvalidNexthop);
    }

    #[test]
    fn test_interface_table() {
        let router = Router::new(1, 4, 4);
        let vif = Interface::builder(2, VifType::Physical).rid(1).build();
        router.add_interface(Arc::clone(&vif)).unwrap();
        assert!(router.interface(2).is_some());
        assert!(router.interface(3).is_none());
        assert!(router.interface(99).is_none());

        let big = Interface::builder(4, VifType::Physical).build();
        assert!(matches!(
            router.add_interface(big),
            Err(DatapathError::InterfaceOutOfRange { idx: 4, max: 4 })
        ));

        assert!(router.remove_interface(2).is_some());
        assert!(router.interface(2).is_none());
        assert!(router.interfaces().is_empty());
    }

    #[test]
    fn test_registry() {
        let registry = RouterRegistry::new();
        registry.insert(Arc::new(Router::new(7, 1, 1)));
        assert_eq!(registry.get(7).unwrap().rid(), 7);
        assert!(registry.get(8).is_none());
        assert!(registry.remove(7).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_label_header_roundtrip() {
        assert_eq!(label_from_header(label_header(1000)), 1000);
    }
}
