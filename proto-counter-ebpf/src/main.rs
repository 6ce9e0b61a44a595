#![no_std]
#![no_main]

use aya_ebpf::bindings::{TC_ACT_OK, xdp_action};
use aya_ebpf::macros::{classifier, map, xdp};
use aya_ebpf::maps::{PerCpuArray, PerCpuHashMap};
use aya_ebpf::programs::{TcContext, XdpContext};
use proto_counter_common::{
    CounterStore, IF_STATS_MAX_ENTRIES, IfProtoKey, PROTO_TAG_COUNT, PacketView, ProtoStats,
    ProtoTag, StoreFull, on_packet,
};

#[map(name = "stats_percpu")]
static STATS: PerCpuArray<ProtoStats> = PerCpuArray::<ProtoStats>::with_max_entries(PROTO_TAG_COUNT, 0);

#[map(name = "if_stats_percpu")]
static IF_STATS: PerCpuHashMap<IfProtoKey, ProtoStats> =
    PerCpuHashMap::<IfProtoKey, ProtoStats>::with_max_entries(IF_STATS_MAX_ENTRIES, 0);

/// The current CPU's slots of both maps.
struct MapStore;

impl CounterStore for MapStore {
    #[inline(always)]
    fn global_slot(&mut self, tag: ProtoTag) -> Option<&mut ProtoStats> {
        STATS.get_ptr_mut(tag.slot()).map(|ptr| unsafe { &mut *ptr })
    }

    #[inline(always)]
    fn interface_slot(&mut self, key: &IfProtoKey) -> Option<&mut ProtoStats> {
        IF_STATS.get_ptr_mut(key).map(|ptr| unsafe { &mut *ptr })
    }

    #[inline(always)]
    fn insert_interface(&mut self, key: &IfProtoKey, init: &ProtoStats) -> Result<(), StoreFull> {
        // BPF_ANY: a concurrent zero-insert of the same key only resets this CPU's untouched slot.
        IF_STATS.insert(key, init, 0).map_err(|_| StoreFull)
    }
}

#[classifier]
pub fn tc_proto_counter(ctx: TcContext) -> i32 {
    let (ifindex, ingress_ifindex) = unsafe { ((*ctx.skb.skb).ifindex, (*ctx.skb.skb).ingress_ifindex) };
    let view = unsafe { PacketView::from_raw(ctx.data(), ctx.data_end(), ifindex, ingress_ifindex) };
    on_packet(&mut MapStore, &view);
    TC_ACT_OK
}

#[xdp]
pub fn xdp_proto_counter(ctx: XdpContext) -> u32 {
    // XDP only knows the receiving device.
    let ingress_ifindex = unsafe { (*ctx.ctx).ingress_ifindex };
    let view = unsafe { PacketView::from_raw(ctx.data(), ctx.data_end(), 0, ingress_ifindex) };
    on_packet(&mut MapStore, &view);
    xdp_action::XDP_PASS
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}
