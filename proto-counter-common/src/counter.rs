//! Counter update protocol and per-packet dispatch.
//!
//! A [`CounterStore`] is one core's view of both tables. The kernel
//! implements it over per-CPU maps, userspace over plain per-core shards;
//! the bump logic below is shared by both.

use crate::{IfProtoKey, ProtoStats, ProtoTag, walker::PacketView};

/// Returned when the per-interface table has no room for a new key.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StoreFull;

pub trait CounterStore {
    /// Slot of the fixed-size global table. Always present for a valid tag.
    fn global_slot(&mut self, tag: ProtoTag) -> Option<&mut ProtoStats>;

    fn interface_slot(&mut self, key: &IfProtoKey) -> Option<&mut ProtoStats>;

    /// Inserts `init` at `key`. Inserting a key that already exists must be harmless.
    fn insert_interface(&mut self, key: &IfProtoKey, init: &ProtoStats) -> Result<(), StoreFull>;
}

/// What the attachment point should do with the packet. There is only one answer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Disposition {
    Continue,
}

#[inline(always)]
pub fn bump_global<S: CounterStore>(store: &mut S, tag: ProtoTag, bytes: u64) {
    if let Some(stats) = store.global_slot(tag) {
        stats.record(bytes);
    }
}

/// Ensures `(ifindex, tag)` exists, then increments it. `ifindex == 0` is skipped.
///
/// A full table drops the increment for that key.
#[inline(always)]
pub fn bump_interface<S: CounterStore>(store: &mut S, ifindex: u32, tag: ProtoTag, bytes: u64) {
    if ifindex == 0 {
        return;
    }
    let key = IfProtoKey::new(ifindex, tag);
    if let Some(stats) = store.interface_slot(&key) {
        stats.record(bytes);
        return;
    }
    // Another core may win the insert; the re-lookup below covers both outcomes.
    let _ = store.insert_interface(&key, &ProtoStats::default());
    if let Some(stats) = store.interface_slot(&key) {
        stats.record(bytes);
    }
}

#[inline(always)]
pub fn bump_all<S: CounterStore>(store: &mut S, ifindex: u32, tag: ProtoTag, bytes: u64) {
    bump_global(store, tag, bytes);
    bump_interface(store, ifindex, tag, bytes);
}

/// Classifies one packet and accounts it. Never influences forwarding.
#[inline(always)]
pub fn on_packet<S: CounterStore>(store: &mut S, view: &PacketView<'_>) -> Disposition {
    let pkt_len = view.wire_len();
    let ifindex = view.selected_ifindex();
    let class = crate::walker::classify(view);

    bump_all(store, ifindex, class.tag, pkt_len);
    if let Some(nested) = class.nested {
        bump_all(store, ifindex, nested, pkt_len);
    }

    Disposition::Continue
}
