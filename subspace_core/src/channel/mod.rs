//! The shared-memory channel core.
//!
//! One channel is three shared-memory objects: the channel control block
//! (CCB: header, robust mutex, slot table), a parallel buffer region (one
//! prefixed payload area per slot), and the server-wide system control
//! block (SCB: per-channel update counters). Every participant maps all
//! three at whatever address the OS picks, which is why the slot lists
//! speak in CCB-relative offsets rather than pointers.
//!
//! A [`Channel`] value is one participant's private view of that shared
//! state. All mutation of the CCB happens under the channel mutex; message
//! payload bytes are read and written outside the lock, isolated by slot
//! lifecycle (a slot on the busy list is invisible to subscribers until
//! its publish transaction moves it to the active list).

pub mod bitset;
pub mod layout;
pub mod list;
pub mod mutex;

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr::addr_of_mut;

use crate::error::{Result, SubspaceError};
use crate::memory::ShmRegion;

use layout::{
    buffers_size, ccb_size, payload_offset, prefix_offset, scb_size, slot_offset, ChannelControlBlock,
    ChannelCounters, MessagePrefix, MessageSlot, MAX_CHANNELS, MAX_SLOT_OWNERS, MESSAGE_ACTIVATE,
};
use mutex::{ChannelLock, LockState};

/// The shared memory file descriptors for one channel, as distributed by
/// the server: the CCB object and the buffer object. (The SCB travels
/// separately, once per client.)
#[derive(Debug)]
pub struct SharedMemoryFds {
    pub ccb: OwnedFd,
    pub buffers: OwnedFd,
}

/// Result of a publish transaction.
#[derive(Debug, Clone, Copy)]
pub struct PublishedMessage {
    /// The next writable slot, already on the busy list. `None` for
    /// reliable publishers (they pull a slot lazily so back-pressure stays
    /// observable) and for unreliable publishers that ran out of slots.
    pub new_slot: Option<i32>,
    pub ordinal: u64,
    pub timestamp: u64,
    /// Whether subscriber trigger fds should be fired for this message.
    pub notify: bool,
}

/// Channel statistics counters, read under the CCB mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub total_bytes: u64,
    pub total_messages: u64,
}

/// A dead participant, as reported by the server's out-of-band bookkeeping
/// when robust-mutex recovery runs.
#[derive(Debug, Clone, Copy)]
pub struct DeadOwner {
    pub owner: i32,
    pub reliable: bool,
}

/// Which list a slot is on. Every slot is on exactly one at all times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotListKind {
    Free,
    Busy,
    Active,
}

/// Diagnostic snapshot of one slot, taken under the CCB mutex.
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub id: i32,
    pub list: SlotListKind,
    pub ref_count: i16,
    pub reliable_ref_count: i16,
    pub ordinal: u64,
    pub message_size: u64,
    pub owner_count: u32,
}

// ─── System control block view ──────────────────────────────────────────────

/// A mapped view of the system control block.
///
/// The SCB is written only by the server; clients read it lock-free as a
/// staleness hint. A stale read is safe: at worst it costs an unnecessary
/// round-trip to the server.
#[derive(Debug)]
pub struct ScbView {
    region: ShmRegion,
}

impl ScbView {
    /// Allocate a fresh, zeroed SCB. Server-side.
    pub fn create() -> Result<Self> {
        Ok(Self {
            region: ShmRegion::create("subspace_scb", scb_size())?,
        })
    }

    /// Map the SCB from a descriptor received from the server.
    pub fn from_fd(fd: RawFd) -> Result<Self> {
        Ok(Self {
            region: ShmRegion::from_fd(fd, scb_size())?,
        })
    }

    /// Duplicate the backing descriptor for transfer to a client.
    pub fn dup_fd(&self) -> Result<OwnedFd> {
        self.region.dup_fd()
    }

    fn entry_ptr(&self, channel_id: i32) -> *mut ChannelCounters {
        debug_assert!((0..MAX_CHANNELS as i32).contains(&channel_id));
        // SAFETY: channel_id is bounds-checked; the region is scb_size() long.
        unsafe {
            (self.region.as_ptr() as *mut ChannelCounters).offset(channel_id as isize)
        }
    }

    /// Read one channel's counters. Lock-free; the server may be writing
    /// concurrently, so the copy is volatile and possibly stale.
    pub fn counters(&self, channel_id: i32) -> ChannelCounters {
        // SAFETY: entry_ptr is in bounds; ChannelCounters is Pod so any
        // byte pattern is a valid value.
        unsafe { std::ptr::read_volatile(self.entry_ptr(channel_id)) }
    }

    /// Read-modify-write one channel's counters. Server-side only; the
    /// SCB has a single writer by contract.
    pub fn update<F: FnOnce(&mut ChannelCounters)>(&self, channel_id: i32, f: F) {
        let ptr = self.entry_ptr(channel_id);
        // SAFETY: single-writer contract; ptr is in bounds.
        unsafe {
            let mut counters = std::ptr::read_volatile(ptr);
            f(&mut counters);
            std::ptr::write_volatile(ptr, counters);
        }
    }
}

// ─── Channel ────────────────────────────────────────────────────────────────

type DeadOwnerHook = Box<dyn Fn() -> Vec<DeadOwner> + Send + Sync>;

/// One participant's view of a channel: its private mappings of the SCB,
/// CCB and buffer objects, plus the operations that manipulate the shared
/// slot structures under the CCB mutex.
///
/// Channel objects are never shared between participants; two publishers
/// in the same process each map the memory independently.
pub struct Channel {
    name: String,
    channel_id: i32,
    num_slots: i32,
    slot_size: i32,
    /// SCB update count last seen by this participant.
    pub(crate) num_updates: u16,
    scb: ScbView,
    ccb: ShmRegion,
    buffers: ShmRegion,
    dead_owner_hook: Option<DeadOwnerHook>,
}

/// RAII guard for the CCB mutex.
struct CcbGuard {
    lock: *mut ChannelLock,
}

impl Drop for CcbGuard {
    fn drop(&mut self) {
        // SAFETY: the guard exists only while the lock is held.
        unsafe { mutex::unlock(self.lock) };
    }
}

fn monotonic_now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer; CLOCK_MONOTONIC is always available.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

impl Channel {
    /// Allocate the shared memory for a channel and initialize the CCB:
    /// header, robust mutex, and every slot on the free list. Server-side;
    /// the returned descriptors are what get distributed to participants.
    pub fn allocate(
        name: &str,
        slot_size: i32,
        num_slots: i32,
        channel_id: i32,
        scb: ScbView,
    ) -> Result<(Channel, SharedMemoryFds)> {
        if num_slots <= 0 || slot_size <= 0 {
            return Err(SubspaceError::invalid_input(format!(
                "channel '{}' needs positive sizing (slot_size={}, num_slots={})",
                name, slot_size, num_slots
            )));
        }
        if !(0..MAX_CHANNELS as i32).contains(&channel_id) {
            return Err(SubspaceError::invalid_input(format!(
                "channel id {} out of range",
                channel_id
            )));
        }

        let ccb = ShmRegion::create(&format!("{}_ccb", name), ccb_size(num_slots as usize))?;
        let buffers = ShmRegion::create(
            &format!("{}_buffers", name),
            buffers_size(num_slots as usize, slot_size as usize),
        )?;
        let fds = SharedMemoryFds {
            ccb: ccb.dup_fd()?,
            buffers: buffers.dup_fd()?,
        };

        let channel = Channel {
            name: name.to_string(),
            channel_id,
            num_slots,
            slot_size,
            num_updates: 0,
            scb,
            ccb,
            buffers,
            dead_owner_hook: None,
        };
        // SAFETY: the regions are fresh and private to us until the fds are
        // handed out, so initialization races with nobody.
        unsafe { channel.init_ccb()? };
        log::info!(
            "allocated channel '{}' (id {}, {} slots x {} bytes)",
            name,
            channel_id,
            num_slots,
            slot_size
        );
        Ok((channel, fds))
    }

    /// Map an existing channel from descriptors received from the server.
    pub fn map(
        name: &str,
        channel_id: i32,
        slot_size: i32,
        num_slots: i32,
        scb: ScbView,
        fds: &SharedMemoryFds,
    ) -> Result<Channel> {
        if num_slots <= 0 || slot_size <= 0 {
            return Err(SubspaceError::invalid_input(format!(
                "channel '{}' needs positive sizing (slot_size={}, num_slots={})",
                name, slot_size, num_slots
            )));
        }
        let ccb = ShmRegion::from_fd(fds.ccb.as_raw_fd(), ccb_size(num_slots as usize))?;
        let buffers = ShmRegion::from_fd(
            fds.buffers.as_raw_fd(),
            buffers_size(num_slots as usize, slot_size as usize),
        )?;
        let channel = Channel {
            name: name.to_string(),
            channel_id,
            num_slots,
            slot_size,
            num_updates: 0,
            scb,
            ccb,
            buffers,
            dead_owner_hook: None,
        };
        // SAFETY: the CCB was initialized before its fd was distributed.
        let (stored_slots, stored_size) = unsafe {
            let ccb = channel.ccb_ptr();
            ((*ccb).num_slots, (*ccb).slot_size)
        };
        if stored_slots != num_slots || stored_size != slot_size {
            return Err(SubspaceError::corrupt(format!(
                "channel '{}' sizing mismatch: ccb has {}x{}, server said {}x{}",
                name, stored_slots, stored_size, num_slots, slot_size
            )));
        }
        log::debug!("mapped channel '{}' (id {})", name, channel_id);
        Ok(channel)
    }

    /// Register the hook that names dead participants during robust-mutex
    /// recovery. Supplied by the server layer; without it, recovery only
    /// marks the mutex consistent and leaves slot cleanup to the server's
    /// own `cleanup_slots` call.
    pub fn set_dead_owner_hook(
        &mut self,
        hook: impl Fn() -> Vec<DeadOwner> + Send + Sync + 'static,
    ) {
        self.dead_owner_hook = Some(Box::new(hook));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel_id(&self) -> i32 {
        self.channel_id
    }

    pub fn num_slots(&self) -> i32 {
        self.num_slots
    }

    /// Payload bytes per slot, excluding the message prefix.
    pub fn slot_size(&self) -> i32 {
        self.slot_size
    }

    /// This channel's SCB counters: a lock-free, possibly stale hint.
    pub fn scb_counters(&self) -> ChannelCounters {
        self.scb.counters(self.channel_id)
    }

    /// Current number of subscribers, per the SCB.
    pub fn num_subscribers(&self) -> u16 {
        self.scb_counters().num_subs
    }

    /// Current number of publishers, per the SCB.
    pub fn num_publishers(&self) -> u16 {
        self.scb_counters().num_pubs
    }

    // ── pointer helpers ────────────────────────────────────────────────────

    fn base(&self) -> *mut u8 {
        self.ccb.as_ptr() as *mut u8
    }

    fn ccb_ptr(&self) -> *mut ChannelControlBlock {
        self.base() as *mut ChannelControlBlock
    }

    fn lock_ptr(&self) -> *mut ChannelLock {
        // SAFETY: the CCB mapping is at least ccb_size() long.
        unsafe { addr_of_mut!((*self.ccb_ptr()).lock) }
    }

    fn slot_ptr(&self, id: i32) -> *mut MessageSlot {
        debug_assert!((0..self.num_slots).contains(&id));
        // SAFETY: id is in range, so the offset is within the CCB mapping.
        unsafe { self.base().offset(slot_offset(id) as isize) as *mut MessageSlot }
    }

    fn prefix_ptr(&self, id: i32) -> *mut MessagePrefix {
        // SAFETY: id is in range, so the offset is within the buffer mapping.
        unsafe {
            (self.buffers.as_ptr() as *mut u8).add(prefix_offset(id, self.slot_size as usize))
                as *mut MessagePrefix
        }
    }

    /// Address of slot `id`'s payload area.
    pub(crate) fn payload_ptr(&self, id: i32) -> *mut u8 {
        debug_assert!((0..self.num_slots).contains(&id));
        // SAFETY: id is in range, so the offset is within the buffer mapping.
        unsafe {
            (self.buffers.as_ptr() as *mut u8).add(payload_offset(id, self.slot_size as usize))
        }
    }

    /// Validate a CCB-relative offset found in a list link and convert it
    /// to a slot id. Anything malformed means the shared state is corrupt.
    fn slot_id_at(&self, offset: i32) -> Result<i32> {
        let header = std::mem::size_of::<ChannelControlBlock>() as i32;
        let slot_bytes = std::mem::size_of::<MessageSlot>() as i32;
        if offset < header || (offset - header) % slot_bytes != 0 {
            return Err(SubspaceError::corrupt(format!(
                "channel '{}': list link holds bad offset {}",
                self.name, offset
            )));
        }
        let id = (offset - header) / slot_bytes;
        if id >= self.num_slots {
            return Err(SubspaceError::corrupt(format!(
                "channel '{}': list link points past slot table (id {})",
                self.name, id
            )));
        }
        Ok(id)
    }

    fn check_slot_id(&self, id: i32) -> Result<()> {
        if (0..self.num_slots).contains(&id) {
            Ok(())
        } else {
            Err(SubspaceError::invalid_input(format!(
                "slot id {} out of range for channel '{}'",
                id, self.name
            )))
        }
    }

    // ── initialization ─────────────────────────────────────────────────────

    /// # Safety
    /// Must run exactly once, on fresh zeroed regions, before the fds are
    /// distributed.
    unsafe fn init_ccb(&self) -> Result<()> {
        let ccb = self.ccb_ptr();
        let mut name_bytes = [0u8; layout::MAX_CHANNEL_NAME];
        let n = self.name.len().min(layout::MAX_CHANNEL_NAME);
        name_bytes[..n].copy_from_slice(&self.name.as_bytes()[..n]);
        (*ccb).channel_name = name_bytes;
        (*ccb).num_slots = self.num_slots;
        (*ccb).slot_size = self.slot_size;
        (*ccb).next_ordinal = 1;
        (*ccb).total_bytes = 0;
        (*ccb).total_messages = 0;
        list::init_list(addr_of_mut!((*ccb).active_list));
        list::init_list(addr_of_mut!((*ccb).busy_list));
        list::init_list(addr_of_mut!((*ccb).free_list));
        mutex::init(self.lock_ptr())?;
        for id in 0..self.num_slots {
            let slot = self.slot_ptr(id);
            list::init_element(addr_of_mut!((*slot).element));
            (*slot).id = id;
            (*slot).ref_count = 0;
            (*slot).reliable_ref_count = 0;
            (*slot).ordinal = 0;
            (*slot).message_size = 0;
            (*slot).owners.clear_all();
            list::push_back(self.base(), addr_of_mut!((*ccb).free_list), slot_offset(id));
        }
        Ok(())
    }

    // ── locking ────────────────────────────────────────────────────────────

    fn lock_ccb(&self) -> Result<CcbGuard> {
        // SAFETY: lock_ptr points at the mutex init_ccb set up.
        let state = unsafe { mutex::lock(self.lock_ptr())? };
        let guard = CcbGuard {
            lock: self.lock_ptr(),
        };
        if state == LockState::Inconsistent {
            // A participant died holding the lock. Eliminate its footprint
            // before anyone trusts the shared state again.
            log::warn!(
                "channel '{}': lock holder died, reconciling shared state",
                self.name
            );
            if let Some(hook) = &self.dead_owner_hook {
                for dead in hook() {
                    // SAFETY: we hold the lock.
                    unsafe { self.cleanup_slots_locked(dead.owner, dead.reliable) };
                }
            }
            // SAFETY: we hold the lock and acquired it inconsistent.
            unsafe { mutex::mark_consistent(self.lock_ptr())? };
        }
        Ok(guard)
    }

    // ── slot allocation ────────────────────────────────────────────────────

    /// Find a slot for a publisher to write into. Comes from the free list
    /// if possible, otherwise reclaims the oldest unreferenced slot on the
    /// active list. A reliable publisher's scan stops dead at the first
    /// slot a reliable subscriber still owes a read for.
    ///
    /// On success the slot is on the busy list with the owner bit set.
    /// `None` means out-of-slots for unreliable callers and back-pressure
    /// for reliable ones.
    pub fn find_free_slot(&self, reliable: bool, owner: i32) -> Result<Option<i32>> {
        let _guard = self.lock_ccb()?;
        // SAFETY: we hold the lock.
        unsafe { self.find_free_slot_locked(reliable, owner) }
    }

    /// # Safety
    /// Caller must hold the CCB mutex.
    unsafe fn find_free_slot_locked(&self, reliable: bool, owner: i32) -> Result<Option<i32>> {
        let ccb = self.ccb_ptr();
        let free = addr_of_mut!((*ccb).free_list);
        let active = addr_of_mut!((*ccb).active_list);

        let taken = if (*free).first != 0 {
            let offset = (*free).first;
            let id = self.slot_id_at(offset)?;
            list::remove(self.base(), free, offset);
            Some(id)
        } else {
            let mut found = None;
            for offset in list::iter(self.base(), active) {
                let id = self.slot_id_at(offset)?;
                let slot = self.slot_ptr(id);
                if reliable && (*slot).reliable_ref_count > 0 {
                    // A reliable subscriber still owes a read here. Reliable
                    // publishers may neither take this slot nor skip it.
                    break;
                }
                if (*slot).ref_count == 0 {
                    found = Some((id, offset));
                    break;
                }
            }
            match found {
                Some((id, offset)) => {
                    list::remove(self.base(), active, offset);
                    (*self.slot_ptr(id)).owners.clear_all();
                    Some(id)
                }
                None => None,
            }
        };

        if let Some(id) = taken {
            list::push_back(self.base(), addr_of_mut!((*ccb).busy_list), slot_offset(id));
            (*self.slot_ptr(id)).owners.set(owner);
        }
        Ok(taken)
    }

    /// Record the size of the message being staged in a busy slot. The slot
    /// is owned by the staging publisher and invisible to everyone else, so
    /// this write needs no lock.
    pub(crate) fn stage_message_size(&self, slot_id: i32, size: u64) {
        debug_assert!((0..self.num_slots).contains(&slot_id));
        // SAFETY: slot_id is in range.
        unsafe { (*self.slot_ptr(slot_id)).message_size = size };
    }

    /// Message size currently recorded in a slot.
    pub(crate) fn slot_message_size(&self, slot_id: i32) -> u64 {
        // SAFETY: slot_id is validated by callers.
        unsafe { (*self.slot_ptr(slot_id)).message_size }
    }

    /// Ordinal currently recorded in a slot. Stable while the caller holds
    /// a reference on the slot (it cannot be reclaimed under them).
    pub(crate) fn slot_ordinal(&self, slot_id: i32) -> u64 {
        // SAFETY: slot_id is validated by callers.
        unsafe { (*self.slot_ptr(slot_id)).ordinal }
    }

    /// Copy of the message prefix for a slot the caller holds.
    pub(crate) fn prefix(&self, slot_id: i32) -> MessagePrefix {
        // SAFETY: slot_id is validated by callers; any byte pattern is a
        // valid MessagePrefix.
        unsafe { *self.prefix_ptr(slot_id) }
    }

    // ── publish ────────────────────────────────────────────────────────────

    /// Complete a publish: assign the ordinal and timestamp, fill in the
    /// message prefix (unless `omit_prefix`: bridged messages arrive with
    /// one already written), move the slot from busy to the tail of active,
    /// and, for unreliable publishers, grab the next writable slot.
    pub fn activate_slot_and_get_another(
        &self,
        slot_id: i32,
        reliable: bool,
        is_activation: bool,
        owner: i32,
        omit_prefix: bool,
    ) -> Result<PublishedMessage> {
        self.check_slot_id(slot_id)?;
        let _guard = self.lock_ccb()?;
        // SAFETY: we hold the lock; slot_id is in range.
        unsafe {
            let ccb = self.ccb_ptr();
            let slot = self.slot_ptr(slot_id);

            let ordinal = (*ccb).next_ordinal;
            (*ccb).next_ordinal += 1;
            let timestamp = monotonic_now_ns();
            let message_size = (*slot).message_size;

            if !omit_prefix {
                let prefix = self.prefix_ptr(slot_id);
                (*prefix).message_size = message_size as i32;
                (*prefix).ordinal = ordinal;
                (*prefix).timestamp = timestamp;
                (*prefix).flags = if is_activation { MESSAGE_ACTIVATE } else { 0 };
            }

            (*slot).ordinal = ordinal;
            (*ccb).total_bytes += message_size;
            (*ccb).total_messages += 1;

            let was_empty = (*addr_of_mut!((*ccb).active_list)).first == 0;
            list::remove(
                self.base(),
                addr_of_mut!((*ccb).busy_list),
                slot_offset(slot_id),
            );
            list::push_back(
                self.base(),
                addr_of_mut!((*ccb).active_list),
                slot_offset(slot_id),
            );
            (*slot).owners.clear(owner);

            // Wake subscribers only when the backlog was empty: a non-empty
            // active list means they were already notified and have not
            // drained yet.
            let notify = was_empty;

            let new_slot = if reliable {
                None
            } else {
                self.find_free_slot_locked(false, owner)?
            };

            Ok(PublishedMessage {
                new_slot,
                ordinal,
                timestamp,
                notify,
            })
        }
    }

    // ── subscribe ──────────────────────────────────────────────────────────

    /// Move a subscriber cursor to the next slot on the active list (or the
    /// head, when the cursor is unset). Returns `None` at the end of the
    /// list, in which case the cursor is unchanged and keeps its reference.
    pub fn next_slot(&self, current: Option<i32>, reliable: bool, owner: i32) -> Result<Option<i32>> {
        self.move_cursor(current, reliable, owner, CursorTarget::Next)
    }

    /// Move a subscriber cursor straight to the tail of the active list,
    /// for "newest message" semantics. Skipped slots show up as an ordinal gap.
    pub fn last_slot(&self, current: Option<i32>, reliable: bool, owner: i32) -> Result<Option<i32>> {
        self.move_cursor(current, reliable, owner, CursorTarget::Tail)
    }

    fn move_cursor(
        &self,
        current: Option<i32>,
        reliable: bool,
        owner: i32,
        target: CursorTarget,
    ) -> Result<Option<i32>> {
        if let Some(id) = current {
            self.check_slot_id(id)?;
        }
        let _guard = self.lock_ccb()?;
        // SAFETY: we hold the lock; ids are validated.
        unsafe {
            let ccb = self.ccb_ptr();
            let target_offset = match target {
                CursorTarget::Next => match current {
                    None => (*ccb).active_list.first,
                    Some(id) => (*self.slot_ptr(id)).element.next,
                },
                CursorTarget::Tail => (*ccb).active_list.last,
            };
            if target_offset == 0 {
                return Ok(None);
            }
            let new_id = self.slot_id_at(target_offset)?;
            if let Some(id) = current {
                self.release_slot_locked(id, reliable, owner);
            }
            let slot = self.slot_ptr(new_id);
            (*slot).ref_count += 1;
            if reliable {
                (*slot).reliable_ref_count += 1;
            }
            (*slot).owners.set(owner);
            Ok(Some(new_id))
        }
    }

    /// # Safety
    /// Caller must hold the CCB mutex; `id` must be in range.
    unsafe fn release_slot_locked(&self, id: i32, reliable: bool, owner: i32) {
        let slot = self.slot_ptr(id);
        debug_assert!((*slot).ref_count > 0);
        if (*slot).ref_count > 0 {
            (*slot).ref_count -= 1;
        }
        if reliable {
            debug_assert!((*slot).reliable_ref_count > 0);
            if (*slot).reliable_ref_count > 0 {
                (*slot).reliable_ref_count -= 1;
            }
        }
        (*slot).owners.clear(owner);
    }

    /// Find the active message with the largest prefix timestamp that is
    /// `<= timestamp` and move the cursor there, with the same ownership
    /// transfer as [`Channel::next_slot`]. Returns `None`, with no
    /// ownership change, when every active message is newer, or the list
    /// is empty.
    ///
    /// `scratch` is caller-owned so rare searches don't allocate per call;
    /// it is clobbered.
    pub fn find_active_slot_by_timestamp(
        &self,
        current: Option<i32>,
        timestamp: u64,
        reliable: bool,
        owner: i32,
        scratch: &mut Vec<i32>,
    ) -> Result<Option<i32>> {
        if let Some(id) = current {
            self.check_slot_id(id)?;
        }
        let _guard = self.lock_ccb()?;
        // SAFETY: we hold the lock; ids come from validated list links.
        unsafe {
            scratch.clear();
            let ccb = self.ccb_ptr();
            for offset in list::iter(self.base(), addr_of_mut!((*ccb).active_list)) {
                scratch.push(self.slot_id_at(offset)?);
            }
            // Timestamps are monotonic, but interleaved publishers can in
            // pathological cases leave them out of list order. Sort before
            // the binary search.
            scratch.sort_by_key(|&id| (*self.prefix_ptr(id)).timestamp);
            let idx = scratch.partition_point(|&id| (*self.prefix_ptr(id)).timestamp <= timestamp);
            if idx == 0 {
                return Ok(None);
            }
            let new_id = scratch[idx - 1];
            if let Some(id) = current {
                self.release_slot_locked(id, reliable, owner);
            }
            let slot = self.slot_ptr(new_id);
            (*slot).ref_count += 1;
            if reliable {
                (*slot).reliable_ref_count += 1;
            }
            (*slot).owners.set(owner);
            Ok(Some(new_id))
        }
    }

    // ── cleanup ────────────────────────────────────────────────────────────

    /// Drop every reference `owner` holds: clear its bit and decrement the
    /// ref counts on each slot it owned. Used when a participant
    /// disconnects or is evicted. Idempotent for a given owner.
    pub fn cleanup_slots(&self, owner: i32, reliable: bool) -> Result<()> {
        let _guard = self.lock_ccb()?;
        // SAFETY: we hold the lock.
        unsafe { self.cleanup_slots_locked(owner, reliable) };
        Ok(())
    }

    /// # Safety
    /// Caller must hold the CCB mutex.
    unsafe fn cleanup_slots_locked(&self, owner: i32, reliable: bool) {
        if !(0..MAX_SLOT_OWNERS as i32).contains(&owner) {
            return;
        }
        for id in 0..self.num_slots {
            let slot = self.slot_ptr(id);
            if (*slot).owners.test(owner) {
                (*slot).owners.clear(owner);
                if (*slot).ref_count > 0 {
                    (*slot).ref_count -= 1;
                }
                if reliable && (*slot).reliable_ref_count > 0 {
                    (*slot).reliable_ref_count -= 1;
                }
            }
        }
    }

    // ── statistics and diagnostics ─────────────────────────────────────────

    /// Statistics counters, read under the CCB mutex.
    pub fn counters(&self) -> Result<ChannelStats> {
        let _guard = self.lock_ccb()?;
        // SAFETY: we hold the lock.
        unsafe {
            let ccb = self.ccb_ptr();
            Ok(ChannelStats {
                total_bytes: (*ccb).total_bytes,
                total_messages: (*ccb).total_messages,
            })
        }
    }

    /// The next ordinal the channel will assign. Diagnostic.
    pub fn next_ordinal(&self) -> Result<u64> {
        let _guard = self.lock_ccb()?;
        // SAFETY: we hold the lock.
        unsafe { Ok((*self.ccb_ptr()).next_ordinal) }
    }

    /// Snapshot every slot's list membership and reference state, verifying
    /// on the way that each slot is on exactly one list. A slot on zero or
    /// two lists is corruption.
    pub fn snapshot(&self) -> Result<Vec<SlotInfo>> {
        let _guard = self.lock_ccb()?;
        // SAFETY: we hold the lock.
        unsafe {
            let ccb = self.ccb_ptr();
            let mut membership: Vec<Option<SlotListKind>> = vec![None; self.num_slots as usize];
            let lists = [
                (SlotListKind::Free, addr_of_mut!((*ccb).free_list)),
                (SlotListKind::Busy, addr_of_mut!((*ccb).busy_list)),
                (SlotListKind::Active, addr_of_mut!((*ccb).active_list)),
            ];
            for (kind, head) in lists {
                for offset in list::iter(self.base(), head) {
                    let id = self.slot_id_at(offset)? as usize;
                    if membership[id].is_some() {
                        return Err(SubspaceError::corrupt(format!(
                            "channel '{}': slot {} is on two lists",
                            self.name, id
                        )));
                    }
                    membership[id] = Some(kind);
                }
            }
            membership
                .iter()
                .enumerate()
                .map(|(id, kind)| {
                    let kind = kind.ok_or_else(|| {
                        SubspaceError::corrupt(format!(
                            "channel '{}': slot {} is on no list",
                            self.name, id
                        ))
                    })?;
                    let slot = self.slot_ptr(id as i32);
                    Ok(SlotInfo {
                        id: id as i32,
                        list: kind,
                        ref_count: (*slot).ref_count,
                        reliable_ref_count: (*slot).reliable_ref_count,
                        ordinal: (*slot).ordinal,
                        message_size: (*slot).message_size,
                        owner_count: (*slot).owners.count(),
                    })
                })
                .collect()
        }
    }

    /// Ordinals along the active list, head to tail. Diagnostic; strictly
    /// increasing by construction.
    pub fn active_ordinals(&self) -> Result<Vec<u64>> {
        let _guard = self.lock_ccb()?;
        // SAFETY: we hold the lock.
        unsafe {
            let ccb = self.ccb_ptr();
            let mut ordinals = Vec::new();
            for offset in list::iter(self.base(), addr_of_mut!((*ccb).active_list)) {
                let id = self.slot_id_at(offset)?;
                ordinals.push((*self.slot_ptr(id)).ordinal);
            }
            Ok(ordinals)
        }
    }

    /// Log the contents of the three slot lists.
    pub fn dump_lists(&self) -> Result<()> {
        let _guard = self.lock_ccb()?;
        // SAFETY: we hold the lock.
        unsafe {
            let ccb = self.ccb_ptr();
            for (label, head) in [
                ("active", addr_of_mut!((*ccb).active_list)),
                ("busy", addr_of_mut!((*ccb).busy_list)),
                ("free", addr_of_mut!((*ccb).free_list)),
            ] {
                let ids: Vec<i32> = list::iter(self.base(), head)
                    .map(|offset| self.slot_id_at(offset))
                    .collect::<Result<_>>()?;
                log::debug!("channel '{}' {} list: {:?}", self.name, label, ids);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum CursorTarget {
    Next,
    Tail,
}
