//! The message type returned by reads and publishes.

/// A message read from a subscriber, or the receipt for a publish.
///
/// For reads, `buffer` points straight into the channel's shared buffer
/// region; no copy is made. The pointer stays valid while the subscriber's
/// cursor remains on the slot (the slot cannot be reclaimed while the
/// cursor reference pins it) and the mapping is alive. For publish
/// receipts the buffer is null; only the ordinal, timestamp and length are
/// meaningful.
#[derive(Debug, Clone)]
pub struct Message {
    pub length: usize,
    pub buffer: *const u8,
    pub ordinal: u64,
    pub timestamp: u64,
    /// The message carried the Activate flag (only visible to subscribers
    /// that opted in to seeing activation messages).
    pub is_activation: bool,
    /// Slot the message occupies, -1 when empty.
    pub slot_id: i32,
}

// SAFETY: the pointer targets process-shared memory that outlives any
// thread; synchronization is the slot reference held by the subscriber.
unsafe impl Send for Message {}
unsafe impl Sync for Message {}

impl Default for Message {
    fn default() -> Self {
        Self {
            length: 0,
            buffer: std::ptr::null(),
            ordinal: 0,
            timestamp: 0,
            is_activation: false,
            slot_id: -1,
        }
    }
}

impl Message {
    /// An empty read: no message was available.
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn published(length: usize, ordinal: u64, timestamp: u64) -> Self {
        Self {
            length,
            buffer: std::ptr::null(),
            ordinal,
            timestamp,
            is_activation: false,
            slot_id: -1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// View the payload bytes.
    ///
    /// # Safety
    /// The subscriber that produced this message must still hold its cursor
    /// on the slot, and the channel mapping must still be alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        if self.buffer.is_null() || self.length == 0 {
            &[]
        } else {
            std::slice::from_raw_parts(self.buffer, self.length)
        }
    }
}
