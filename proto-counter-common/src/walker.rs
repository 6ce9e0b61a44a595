//! Bounded header walk: Ethernet, up to two VLAN tags, then IPv4/IPv6.
//!
//! Every read is preceded by a comparison against `data_end`; the eBPF
//! verifier rejects the program otherwise, so keep the check and the load
//! in the same accessor.

use core::{marker::PhantomData, mem, ptr};

use crate::ProtoTag;

pub const ETH_HDR_LEN: usize = 14;
pub const ETH_TYPE_OFFSET: usize = 12;
pub const VLAN_HDR_LEN: usize = 4;
pub const IPV4_HDR_LEN: usize = 20;
pub const IPV6_HDR_LEN: usize = 40;
pub const IPV6_NEXT_HDR_OFFSET: usize = 6;

/// Tags unwound before giving up on the frame.
pub const MAX_VLAN_DEPTH: usize = 2;

pub const ETH_P_IP: u16 = 0x0800;
pub const ETH_P_IPV6: u16 = 0x86DD;
pub const ETH_P_8021Q: u16 = 0x8100;
pub const ETH_P_8021AD: u16 = 0x88A8;
pub const IPPROTO_ICMPV6: u8 = 58;

/// Read-only window `[data, data_end)` over one packet plus its interface metadata.
#[derive(Copy, Clone, Debug)]
pub struct PacketView<'a> {
    data: usize,
    data_end: usize,
    /// Interface the packet is accounted to; `0` when unknown.
    pub ifindex: u32,
    /// Fallback for redirected or virtual-device contexts.
    pub ingress_ifindex: u32,
    _bytes: PhantomData<&'a [u8]>,
}

impl<'a> PacketView<'a> {
    /// Wraps a raw packet window handed over by the kernel.
    ///
    /// # Safety
    ///
    /// `data..data_end` must stay readable for `'a`, and `data <= data_end`.
    #[inline(always)]
    pub unsafe fn from_raw(data: usize, data_end: usize, ifindex: u32, ingress_ifindex: u32) -> Self {
        Self {
            data,
            data_end,
            ifindex,
            ingress_ifindex,
            _bytes: PhantomData,
        }
    }

    pub fn from_slice(bytes: &'a [u8]) -> Self {
        let data = bytes.as_ptr() as usize;
        Self {
            data,
            data_end: data + bytes.len(),
            ifindex: 0,
            ingress_ifindex: 0,
            _bytes: PhantomData,
        }
    }

    pub fn with_ifindex(mut self, ifindex: u32, ingress_ifindex: u32) -> Self {
        self.ifindex = ifindex;
        self.ingress_ifindex = ingress_ifindex;
        self
    }

    /// Bytes on the wire, counted whether or not the headers parse.
    #[inline(always)]
    pub fn wire_len(&self) -> u64 {
        self.data_end.saturating_sub(self.data) as u64
    }

    /// Prefers the observed interface, falls back to the ingress one.
    #[inline(always)]
    pub fn selected_ifindex(&self) -> u32 {
        if self.ifindex != 0 {
            self.ifindex
        } else {
            self.ingress_ifindex
        }
    }

    #[inline(always)]
    fn fits(&self, offset: usize, len: usize) -> bool {
        self.data + offset + len <= self.data_end
    }

    #[inline(always)]
    fn ptr_at<T>(&self, offset: usize) -> Option<*const T> {
        let start = self.data + offset;
        if start + mem::size_of::<T>() > self.data_end {
            return None;
        }
        Some(start as *const T)
    }

    #[inline(always)]
    fn load_be16(&self, offset: usize) -> Option<u16> {
        let p = self.ptr_at::<[u8; 2]>(offset)?;
        // SAFETY: `ptr_at` checked that both bytes lie before `data_end`.
        Some(u16::from_be_bytes(unsafe { ptr::read_unaligned(p) }))
    }

    #[inline(always)]
    fn load_u8(&self, offset: usize) -> Option<u8> {
        let p = self.ptr_at::<u8>(offset)?;
        // SAFETY: as above.
        Some(unsafe { *p })
    }
}

/// Result of one header walk.
///
/// `nested` is only ever `Some(Icmpv6)`, and only alongside `tag == Ipv6`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Classification {
    pub tag: ProtoTag,
    pub nested: Option<ProtoTag>,
}

impl Classification {
    const OTHER: Self = Self {
        tag: ProtoTag::Other,
        nested: None,
    };

    const fn plain(tag: ProtoTag) -> Self {
        Self { tag, nested: None }
    }
}

#[inline(always)]
fn is_vlan_tpid(ether_type: u16) -> bool {
    ether_type == ETH_P_8021Q || ether_type == ETH_P_8021AD
}

/// Classifies one packet. Truncated or unrecognised input yields `Other`.
#[inline(always)]
pub fn classify(view: &PacketView<'_>) -> Classification {
    if !view.fits(0, ETH_HDR_LEN) {
        return Classification::OTHER;
    }
    let Some(mut ether_type) = view.load_be16(ETH_TYPE_OFFSET) else {
        return Classification::OTHER;
    };

    let mut cursor = ETH_HDR_LEN;
    for _ in 0..MAX_VLAN_DEPTH {
        if !is_vlan_tpid(ether_type) {
            break;
        }
        if !view.fits(cursor, VLAN_HDR_LEN) {
            return Classification::OTHER;
        }
        // Encapsulated EtherType sits after the 2-byte TCI.
        let Some(inner) = view.load_be16(cursor + 2) else {
            return Classification::OTHER;
        };
        ether_type = inner;
        cursor += VLAN_HDR_LEN;
    }

    match ether_type {
        ETH_P_IP => {
            if view.fits(cursor, IPV4_HDR_LEN) {
                Classification::plain(ProtoTag::Ipv4)
            } else {
                Classification::OTHER
            }
        }
        ETH_P_IPV6 => {
            if !view.fits(cursor, IPV6_HDR_LEN) {
                return Classification::OTHER;
            }
            match view.load_u8(cursor + IPV6_NEXT_HDR_OFFSET) {
                Some(IPPROTO_ICMPV6) => Classification {
                    tag: ProtoTag::Ipv6,
                    nested: Some(ProtoTag::Icmpv6),
                },
                Some(_) => Classification::plain(ProtoTag::Ipv6),
                None => Classification::OTHER,
            }
        }
        // A third stacked tag lands here too.
        _ => Classification::OTHER,
    }
}
