//! The polymorphic object tree (spec component C6): `Device` / `Disklabel`
//! / `Partition` nodes, shared ownership, and the `cast`-up-the-parent-
//! chain operation.
//!
//! The source represents this with per-variant v-tables of function
//! pointers and an `object_cast` that walks a manually maintained parent
//! pointer. Spec §9 calls for a tagged-variant re-encoding instead: each
//! concrete node is a Rust `enum` case, ownership runs strictly
//! parent-owns-child via `Rc`, and every back-link (child-to-parent, and
//! the inner-disklabel-to-owning-partition link that would otherwise form
//! a cycle) is a `Weak`. Destruction is then just what `Rc`/`Drop` already
//! do — no unwind-handler stack is needed to avoid leaks (spec §5, §9).

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use diskforge_core::chs::ChsGeometry;
use diskforge_core::{BlockDevice, DiskforgeError, Result};

use crate::ebr::EbrLabel;
use crate::gpt::GptLabel;
use crate::mbr::MbrLabel;

pub type DeviceRef = Rc<RefCell<DeviceNode>>;
pub type DisklabelRef = Rc<RefCell<DisklabelNode>>;
pub type PartitionRef = Rc<RefCell<PartitionNode>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Device,
    Disklabel,
    Partition,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Device => write!(f, "device"),
            NodeKind::Disklabel => write!(f, "disklabel"),
            NodeKind::Partition => write!(f, "partition"),
        }
    }
}

/// The device-manager façade's `BlockDevice` plus the one disklabel it
/// may hold. `start()` is always 0; `end()` is the last addressable
/// sector (inclusive), per the in-memory convention fixed in
/// `SPEC_FULL.md` §6 item 4.
pub struct DeviceNode {
    pub device: Box<dyn BlockDevice>,
    pub disklabel: Option<DisklabelRef>,
}

impl DeviceNode {
    pub fn new(device: Box<dyn BlockDevice>) -> DeviceRef {
        Rc::new(RefCell::new(DeviceNode {
            device,
            disklabel: None,
        }))
    }

    pub fn start(&self) -> u64 {
        0
    }

    pub fn end(&self) -> u64 {
        let sector_size = self.device.sector_size().max(1) as u64;
        (self.device.size_bytes() / sector_size).saturating_sub(1)
    }
}

/// Where a `DisklabelNode` hangs from. A top-level disklabel hangs off a
/// `DeviceNode`; a nested one (the EBR chain inside an `Extended`
/// partition, or the GPT inside a `GuidProtective` one) hangs off the
/// owning `Partition`. Both are `Weak`: the strong link runs the other
/// way (device owns its disklabel; an `Extended`/`GuidProtective`
/// partition owns its inner disklabel).
pub enum DisklabelParent {
    Device(Weak<RefCell<DeviceNode>>),
    Partition(Weak<RefCell<PartitionNode>>),
}

pub enum DisklabelVariant {
    Mbr(MbrLabel),
    Gpt(GptLabel),
    Ebr(EbrLabel),
}

pub struct DisklabelNode {
    pub parent: DisklabelParent,
    pub variant: DisklabelVariant,
}

impl DisklabelNode {
    pub fn new(parent: DisklabelParent, variant: DisklabelVariant) -> DisklabelRef {
        Rc::new(RefCell::new(DisklabelNode { parent, variant }))
    }

    pub fn start(&self) -> Result<u64> {
        Handle::from(&self.parent)?.start()
    }

    pub fn end(&self) -> Result<u64> {
        Handle::from(&self.parent)?.end()
    }
}

/// Everything a concrete partition variant carries (spec §3 "Partition").
pub enum PartitionVariant {
    Primary,
    Logical,
    Extended { lba_mode: bool, disklabel: DisklabelRef },
    GuidProtective { disklabel: DisklabelRef },
}

pub struct PartitionNode {
    pub parent: Weak<RefCell<DisklabelNode>>,
    /// Inclusive sector bounds, per the in-memory convention fixed in
    /// `SPEC_FULL.md` §6 item 4.
    pub start: u64,
    pub end: u64,
    /// 0-based slot within the parent disklabel's children array;
    /// `number()` (spec §4.9) is `slot + 1`.
    pub slot: usize,
    pub variant: PartitionVariant,
}

impl PartitionNode {
    pub fn new(
        parent: Weak<RefCell<DisklabelNode>>,
        start: u64,
        end: u64,
        slot: usize,
        variant: PartitionVariant,
    ) -> PartitionRef {
        Rc::new(RefCell::new(PartitionNode {
            parent,
            start,
            end,
            slot,
            variant,
        }))
    }

    pub fn type_name(&self) -> &'static str {
        match &self.variant {
            PartitionVariant::Primary => "PRIMARY",
            PartitionVariant::Logical => "LOGICAL",
            PartitionVariant::Extended { lba_mode: false, .. } => "EXTENDED",
            PartitionVariant::Extended { lba_mode: true, .. } => "EXTENDED LBA",
            PartitionVariant::GuidProtective { .. } => "GUID",
        }
    }

    pub fn have_disklabel(&self) -> bool {
        matches!(
            self.variant,
            PartitionVariant::Extended { .. } | PartitionVariant::GuidProtective { .. }
        )
    }

    pub fn disklabel(&self) -> Option<DisklabelRef> {
        match &self.variant {
            PartitionVariant::Extended { disklabel, .. } => Some(disklabel.clone()),
            PartitionVariant::GuidProtective { disklabel, .. } => Some(disklabel.clone()),
            _ => None,
        }
    }

    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// A type-erased reference to any node in the tree, used for `cast` and
/// for the handful of operations (geometry lookup, raw device I/O) any
/// node kind needs to reach the enclosing `Device` for.
#[derive(Clone)]
pub enum Handle {
    Device(DeviceRef),
    Disklabel(DisklabelRef),
    Partition(PartitionRef),
}

impl Handle {
    fn from(parent: &DisklabelParent) -> Result<Handle> {
        match parent {
            DisklabelParent::Device(w) => w
                .upgrade()
                .map(Handle::Device)
                .ok_or_else(|| DiskforgeError::Internal("disklabel's device was dropped".into())),
            DisklabelParent::Partition(w) => w
                .upgrade()
                .map(Handle::Partition)
                .ok_or_else(|| {
                    DiskforgeError::Internal("disklabel's owning partition was dropped".into())
                }),
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Handle::Device(_) => NodeKind::Device,
            Handle::Disklabel(_) => NodeKind::Disklabel,
            Handle::Partition(_) => NodeKind::Partition,
        }
    }

    pub fn start(&self) -> Result<u64> {
        match self {
            Handle::Device(d) => Ok(d.borrow().start()),
            Handle::Disklabel(d) => d.borrow().start(),
            Handle::Partition(p) => Ok(p.borrow().start),
        }
    }

    pub fn end(&self) -> Result<u64> {
        match self {
            Handle::Device(d) => Ok(d.borrow().end()),
            Handle::Disklabel(d) => d.borrow().end(),
            Handle::Partition(p) => Ok(p.borrow().end),
        }
    }

    pub fn parent(&self) -> Option<Handle> {
        match self {
            Handle::Device(_) => None,
            Handle::Disklabel(d) => Handle::from(&d.borrow().parent).ok(),
            Handle::Partition(p) => p.borrow().parent.upgrade().map(Handle::Disklabel),
        }
    }

    /// Walk up the parent chain to the nearest ancestor-or-self of `kind`.
    /// `EInternal` if the chain ends (or a back-link was dropped) before
    /// one is found.
    pub fn cast(&self, kind: NodeKind) -> Result<Handle> {
        let mut current = self.clone();
        loop {
            if current.kind() == kind {
                return Ok(current);
            }
            current = current.parent().ok_or_else(|| {
                DiskforgeError::Internal(format!("no ancestor of kind {kind}"))
            })?;
        }
    }

    /// Geometry of the enclosing device, used by CHS codecs.
    pub fn chs_geometry(&self) -> Result<ChsGeometry> {
        match self.cast(NodeKind::Device)? {
            Handle::Device(d) => {
                let g = d.borrow().device.geometry()?;
                Ok(ChsGeometry {
                    heads: g.heads,
                    sectors_per_track: g.sectors_per_track,
                })
            }
            _ => unreachable!("cast(Device) always returns Handle::Device"),
        }
    }

    /// Run `f` against the enclosing device's `BlockDevice`, for probing
    /// or committing. Every disklabel probe/commit path goes through this
    /// rather than touching `BlockDevice` directly.
    pub fn with_device_mut<R>(&self, f: impl FnOnce(&mut dyn BlockDevice) -> Result<R>) -> Result<R> {
        match self.cast(NodeKind::Device)? {
            Handle::Device(d) => {
                let mut node = d.borrow_mut();
                f(node.device.as_mut())
            }
            _ => unreachable!("cast(Device) always returns Handle::Device"),
        }
    }

    pub fn sector_size(&self) -> Result<u32> {
        self.with_device_mut(|dev| Ok(dev.sector_size()))
    }

    pub fn optimal_alignment(&self) -> Result<u64> {
        self.with_device_mut(|dev| Ok(dev.optimal_alignment()))
    }
}

/// Build the `DisklabelParent` link for a fresh disklabel hanging off
/// `parent`, which must be a `Device` (top-level MBR/GPT) or a
/// `Partition` (nested EBR chain or protected GPT).
pub fn parent_link(parent: &Handle) -> Result<DisklabelParent> {
    match parent {
        Handle::Device(d) => Ok(DisklabelParent::Device(Rc::downgrade(d))),
        Handle::Partition(p) => Ok(DisklabelParent::Partition(Rc::downgrade(p))),
        Handle::Disklabel(_) => Err(DiskforgeError::Internal(
            "a disklabel cannot parent another disklabel directly".into(),
        )),
    }
}

impl From<&DeviceRef> for Handle {
    fn from(value: &DeviceRef) -> Self {
        Handle::Device(value.clone())
    }
}

impl From<&DisklabelRef> for Handle {
    fn from(value: &DisklabelRef) -> Self {
        Handle::Disklabel(value.clone())
    }
}

impl From<&PartitionRef> for Handle {
    fn from(value: &PartitionRef) -> Self {
        Handle::Partition(value.clone())
    }
}
