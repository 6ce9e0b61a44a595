#![cfg_attr(not(test), no_std)]

// Types shared between the eBPF engine and the userspace consumer.
// Keep this crate `no_std` friendly so it can be used from eBPF code.

pub mod counter;
pub mod walker;

pub use counter::{CounterStore, Disposition, StoreFull, bump_all, bump_global, bump_interface, on_packet};
pub use walker::{Classification, PacketView, classify};

/// Name of the global per-CPU array, one slot per [`ProtoTag`].
pub const MAP_STATS: &str = "stats_percpu";
/// Name of the per-CPU hash keyed by [`IfProtoKey`].
pub const MAP_IF_STATS: &str = "if_stats_percpu";

/// Build-time capacity of the per-interface table.
pub const IF_STATS_MAX_ENTRIES: u32 = 4096;

/// Number of slots in the global table.
pub const PROTO_TAG_COUNT: u32 = 4;

/// Protocol bucket a packet is counted under.
///
/// The discriminants are the slot indices of the global table and the
/// `proto` field of [`IfProtoKey`], so they are part of the map ABI.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ProtoTag {
    Ipv4 = 0,
    Ipv6 = 1,
    #[cfg_attr(feature = "serde", serde(rename = "icmp6"))]
    Icmpv6 = 2,
    Other = 3,
}

impl ProtoTag {
    pub const ALL: [ProtoTag; PROTO_TAG_COUNT as usize] =
        [ProtoTag::Ipv4, ProtoTag::Ipv6, ProtoTag::Icmpv6, ProtoTag::Other];

    #[inline(always)]
    pub const fn slot(self) -> u32 {
        self as u32
    }

    /// Unknown slots collapse into `Other`.
    pub const fn from_slot(slot: u32) -> Self {
        match slot {
            0 => ProtoTag::Ipv4,
            1 => ProtoTag::Ipv6,
            2 => ProtoTag::Icmpv6,
            _ => ProtoTag::Other,
        }
    }

    /// Label value used in exported metrics. Matches the serialized form.
    pub const fn name(self) -> &'static str {
        match self {
            ProtoTag::Ipv4 => "ipv4",
            ProtoTag::Ipv6 => "ipv6",
            ProtoTag::Icmpv6 => "icmp6",
            ProtoTag::Other => "other",
        }
    }
}

/// One core's `(packets, bytes)` pair for a key. Only ever incremented.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct ProtoStats {
    pub packets: u64,
    pub bytes: u64,
}

impl ProtoStats {
    #[inline(always)]
    pub fn record(&mut self, bytes: u64) {
        self.packets = self.packets.wrapping_add(1);
        self.bytes = self.bytes.wrapping_add(bytes);
    }
}

/// Key of the per-interface table.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct IfProtoKey {
    pub ifindex: u32,
    pub proto: u32,
}

impl IfProtoKey {
    pub const fn new(ifindex: u32, tag: ProtoTag) -> Self {
        Self {
            ifindex,
            proto: tag.slot(),
        }
    }

    pub const fn tag(&self) -> ProtoTag {
        ProtoTag::from_slot(self.proto)
    }
}

// Userspace reads these types straight out of the maps.
#[cfg(feature = "user")]
mod user_impls {
    extern crate aya;

    use super::{IfProtoKey, ProtoStats};
    use aya::Pod;

    unsafe impl Pod for ProtoStats {}
    unsafe impl Pod for IfProtoKey {}
}
