//! `diskforge-disklabel`: the object tree and the three disklabel
//! systems (MBR, EBR, GPT) built on top of `diskforge-core`'s
//! `BlockDevice` seam. See `diskforge_core` for the primitives; this
//! crate is where MBR/EBR/GPT semantics actually live.

pub mod dispatch;
pub mod ebr;
pub mod gpt;
pub mod mbr;
pub mod partition;
pub mod tree;

pub use dispatch::{create, probe};
pub use ebr::{EbrLabel, EbrLink, EbrPartitionType};
pub use gpt::{GptHeader, GptLabel};
pub use mbr::{MbrEntry, MbrLabel, MbrPartitionType};
pub use tree::{
    DeviceNode, DeviceRef, DisklabelNode, DisklabelParent, DisklabelRef, DisklabelVariant, Handle,
    NodeKind, PartitionNode, PartitionRef, PartitionVariant,
};
