//! Fixed shared-memory layouts for the channel core.
//!
//! Everything in this module is part of the cross-process ABI: the structs
//! are `#[repr(C)]`, little-endian, naturally aligned, and their sizes are
//! pinned by compile-time assertions. The same bytes are mapped by every
//! participant (and travel intact across external bridges), so field order
//! here must never change without a version bump of the whole bus.
//!
//! # Memory objects
//!
//! ```text
//! CCB object      ┌──────────────────────────────────────────┐
//!                 │ ChannelControlBlock header (incl. mutex) │
//!                 ├──────────────────────────────────────────┤
//!                 │ MessageSlot[0] .. MessageSlot[N-1]       │
//!                 └──────────────────────────────────────────┘
//! buffer object   ┌────────────┬─────────────────────────────┐
//!                 │ prefix (32)│ payload (slot_size, 32-pad) │  × N
//!                 └────────────┴─────────────────────────────┘
//! SCB object      │ ChannelCounters[MAX_CHANNELS]            │
//! ```

use std::mem;

use bytemuck::{Pod, Zeroable};

use crate::channel::bitset::OwnerBitSet;
use crate::channel::list::{SlotList, SlotListElement};
use crate::channel::mutex::ChannelLock;

/// Fixed number of per-channel counter entries in the SCB. Shared memory
/// sizes must be fixed, so the server has a hard channel cap.
pub const MAX_CHANNELS: usize = 1024;

/// Maximum number of owners of a slot: one bit per publisher or subscriber
/// reference. A multiple of 64, because it is the width of a word bitset.
pub const MAX_SLOT_OWNERS: usize = 1024;

/// Max length of a channel name stored in shared memory. Longer names are
/// truncated here; the full name lives only in process memory.
pub const MAX_CHANNEL_NAME: usize = 64;

/// Alignment of each payload area inside the buffer object.
pub const BUFFER_ALIGNMENT: usize = 32;

/// Prefix flag: reliable activation marker message.
pub const MESSAGE_ACTIVATE: u64 = 1;
/// Prefix flag: message arrived via an external bridge.
pub const MESSAGE_BRIDGED: u64 = 2;
/// Prefix flag: a subscriber has observed this message.
pub const MESSAGE_SEEN: u64 = 4;

/// Header stored immediately before every message buffer in the buffer
/// object, and transferred intact across bridges.
///
/// The 4 bytes of padding at offset 0 give an external length-framing step
/// somewhere to write a length word and send prefix+payload in one piece.
/// That write is why the buffer object cannot be mapped read-only in
/// subscribers.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct MessagePrefix {
    /// Reserved for external length framing.
    pub padding: i32,
    pub message_size: i32,
    pub ordinal: u64,
    pub timestamp: u64,
    pub flags: u64,
}

const _: () = assert!(mem::size_of::<MessagePrefix>() == 32);

/// Per-slot metadata in the CCB. Always on exactly one of the free, busy,
/// or active lists.
#[repr(C)]
pub struct MessageSlot {
    /// Intrusive list element. Must stay at offset 0: a slot's list-element
    /// offset doubles as the slot's offset.
    pub element: SlotListElement,
    /// Unique slot ID in `[0, num_slots)`.
    pub id: i32,
    /// Number of subscriber cursors on this slot.
    pub ref_count: i16,
    /// Subset of `ref_count` held by reliable subscribers.
    pub reliable_ref_count: i16,
    /// Ordinal of the message currently occupying the slot.
    pub ordinal: u64,
    /// Size of the message currently occupying the slot.
    pub message_size: u64,
    /// One bit per participant currently referencing the slot.
    pub owners: OwnerBitSet,
}

const _: () = assert!(mem::size_of::<MessageSlot>() == 32 + MAX_SLOT_OWNERS / 8);

/// Per-channel counters in the system control block. Written only by the
/// server; read lock-free by clients as a staleness hint.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct ChannelCounters {
    /// Bumped whenever the channel's publisher set changes.
    pub num_pub_updates: u16,
    /// Bumped whenever the channel's subscriber set changes.
    pub num_sub_updates: u16,
    pub num_pubs: u16,
    pub num_reliable_pubs: u16,
    pub num_subs: u16,
    pub num_reliable_subs: u16,
}

const _: () = assert!(mem::size_of::<ChannelCounters>() == 12);

/// The system control block: one per server, shared across all channels.
#[repr(C)]
pub struct SystemControlBlock {
    pub counters: [ChannelCounters; MAX_CHANNELS],
}

/// The control data for one channel, allocated by the server and mapped
/// read/write by every participant. `num_slots` MessageSlots follow the
/// header immediately; list links are byte offsets from the start of this
/// struct.
#[repr(C)]
pub struct ChannelControlBlock {
    /// Truncated channel name, so it shows up in a hexdump.
    pub channel_name: [u8; MAX_CHANNEL_NAME],
    pub num_slots: i32,
    /// Payload size per slot, not including the MessagePrefix.
    pub slot_size: i32,
    /// Next ordinal to assign. Starts at 1.
    pub next_ordinal: u64,

    // Statistics counters.
    pub total_bytes: u64,
    pub total_messages: u64,

    /// Slots with active messages in them, ordered by ordinal.
    pub active_list: SlotList,
    /// Slots handed out to publishers, invisible to subscribers.
    pub busy_list: SlotList,
    /// Slots owned by nobody.
    pub free_list: SlotList,

    /// Robust, process-shared lock for this channel only.
    pub lock: ChannelLock,
}

// The name..free_list prefix of the CCB is ABI; the mutex size is
// platform-defined and sits last on purpose.
const _: () = assert!(mem::offset_of!(ChannelControlBlock, num_slots) == 64);
const _: () = assert!(mem::offset_of!(ChannelControlBlock, next_ordinal) == 72);
const _: () = assert!(mem::offset_of!(ChannelControlBlock, active_list) == 96);
const _: () = assert!(mem::offset_of!(ChannelControlBlock, lock) == 120);

/// Round `v` up to a multiple of `alignment` (a power of two).
#[inline]
pub const fn aligned(v: usize, alignment: usize) -> usize {
    (v + alignment - 1) & !(alignment - 1)
}

/// Bytes occupied by one slot in the buffer object: prefix plus the
/// 32-byte-aligned payload area.
#[inline]
pub const fn buffer_stride(slot_size: usize) -> usize {
    mem::size_of::<MessagePrefix>() + aligned(slot_size, BUFFER_ALIGNMENT)
}

/// Size of the CCB shared-memory object for a channel with `num_slots`.
#[inline]
pub const fn ccb_size(num_slots: usize) -> usize {
    mem::size_of::<ChannelControlBlock>() + num_slots * mem::size_of::<MessageSlot>()
}

/// Size of the buffer shared-memory object.
#[inline]
pub const fn buffers_size(num_slots: usize, slot_size: usize) -> usize {
    num_slots * buffer_stride(slot_size)
}

/// Size of the SCB shared-memory object.
#[inline]
pub const fn scb_size() -> usize {
    mem::size_of::<SystemControlBlock>()
}

/// CCB-relative byte offset of slot `id` (equal to the offset of its list
/// element, which sits at offset 0 of the slot).
#[inline]
pub(crate) fn slot_offset(id: i32) -> i32 {
    (mem::size_of::<ChannelControlBlock>() + id as usize * mem::size_of::<MessageSlot>()) as i32
}

/// Offset of slot `id`'s prefix within the buffer object.
#[inline]
pub(crate) fn prefix_offset(id: i32, slot_size: usize) -> usize {
    id as usize * buffer_stride(slot_size)
}

/// Offset of slot `id`'s payload within the buffer object.
#[inline]
pub(crate) fn payload_offset(id: i32, slot_size: usize) -> usize {
    prefix_offset(id, slot_size) + mem::size_of::<MessagePrefix>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_field_offsets_are_abi() {
        assert_eq!(mem::offset_of!(MessagePrefix, padding), 0);
        assert_eq!(mem::offset_of!(MessagePrefix, message_size), 4);
        assert_eq!(mem::offset_of!(MessagePrefix, ordinal), 8);
        assert_eq!(mem::offset_of!(MessagePrefix, timestamp), 16);
        assert_eq!(mem::offset_of!(MessagePrefix, flags), 24);
    }

    #[test]
    fn buffer_addressing() {
        // slot_size 100 pads to 128, stride 160.
        assert_eq!(buffer_stride(100), 160);
        assert_eq!(prefix_offset(0, 100), 0);
        assert_eq!(payload_offset(0, 100), 32);
        assert_eq!(prefix_offset(3, 100), 480);
        assert_eq!(payload_offset(3, 100), 512);
        // Already aligned payloads gain nothing.
        assert_eq!(buffer_stride(64), 96);
    }

    #[test]
    fn aligned_rounds_up() {
        assert_eq!(aligned(0, 32), 0);
        assert_eq!(aligned(1, 32), 32);
        assert_eq!(aligned(32, 32), 32);
        assert_eq!(aligned(33, 32), 64);
    }

    #[test]
    fn scb_is_fixed_size() {
        assert_eq!(scb_size(), MAX_CHANNELS * mem::size_of::<ChannelCounters>());
    }

    #[test]
    fn slot_offsets_are_contiguous() {
        let s0 = slot_offset(0) as usize;
        let s1 = slot_offset(1) as usize;
        assert_eq!(s0, mem::size_of::<ChannelControlBlock>());
        assert_eq!(s1 - s0, mem::size_of::<MessageSlot>());
    }
}
