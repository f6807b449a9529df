//! The subscriber state machine.
//!
//! A subscriber created before any publisher has bound the channel is a
//! *placeholder*: it has no shared memory to map and every read yields an
//! empty message. The SCB publisher-update counter tells it (lock-free)
//! when the server has since bound the channel, at which point the owning
//! layer re-realises it with fresh descriptors via [`Subscriber::remap`].
//!
//! A mapped subscriber is a cursor over the channel's active list. Moving
//! the cursor releases the reference on the old slot and pins the new one,
//! so the slot under the cursor can never be reclaimed out from under a
//! read.

use crate::channel::layout::MESSAGE_ACTIVATE;
use crate::channel::{Channel, ScbView, SharedMemoryFds};
use crate::error::Result;
use crate::message::Message;
use crate::options::SubscriberOptions;
use crate::trigger::{PollFd, Trigger};

/// How a read picks its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// The next unread message, in ordinal order.
    Next,
    /// Jump to the newest message; skipped messages surface as a drop.
    Newest,
}

enum SubscriberChannel {
    /// No publishers have bound the channel yet; only the SCB is mapped.
    Placeholder(ScbView),
    Mapped(Channel),
}

type DropCallback = Box<dyn FnMut(i64) + Send>;

/// A subscriber bound to one channel.
pub struct Subscriber {
    name: String,
    channel_id: i32,
    options: SubscriberOptions,
    subscriber_id: i32,
    channel: SubscriberChannel,
    /// Cursor: the active slot this subscriber currently references.
    current: Option<i32>,
    /// Readable when new messages may have arrived.
    poll: PollFd,
    /// This subscriber's own trigger (the write side of `poll`).
    trigger: Trigger,
    /// One trigger per reliable publisher, fired when we drain the channel
    /// so back-pressured publishers retry.
    reliable_pub_triggers: Vec<Trigger>,
    drop_callback: Option<DropCallback>,
    /// Scratch for timestamp searches, reused across calls.
    scratch: Vec<i32>,
}

impl Subscriber {
    /// Bind a subscriber to a mapped channel. The id, notifier fds and
    /// reliable-publisher triggers come from the server.
    pub fn new(
        channel: Channel,
        options: SubscriberOptions,
        subscriber_id: i32,
        poll: PollFd,
        trigger: Trigger,
        reliable_pub_triggers: Vec<Trigger>,
    ) -> Self {
        let subscriber = Self {
            name: channel.name().to_string(),
            channel_id: channel.channel_id(),
            options,
            subscriber_id,
            channel: SubscriberChannel::Mapped(channel),
            current: None,
            poll,
            trigger,
            reliable_pub_triggers,
            drop_callback: None,
            scratch: Vec::new(),
        };
        // Wake ourselves once so existing messages get picked up.
        subscriber.trigger.fire();
        subscriber
    }

    /// A subscriber on a channel no publisher has bound yet.
    pub fn placeholder(
        name: &str,
        channel_id: i32,
        scb: ScbView,
        options: SubscriberOptions,
        subscriber_id: i32,
        poll: PollFd,
        trigger: Trigger,
    ) -> Self {
        Self {
            name: name.to_string(),
            channel_id,
            options,
            subscriber_id,
            channel: SubscriberChannel::Placeholder(scb),
            current: None,
            poll,
            trigger,
            reliable_pub_triggers: Vec::new(),
            drop_callback: None,
            scratch: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscriber_id(&self) -> i32 {
        self.subscriber_id
    }

    pub fn is_reliable(&self) -> bool {
        self.options.reliable
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.channel, SubscriberChannel::Placeholder(_))
    }

    /// Ordinal of the message under the cursor, if any.
    pub fn current_ordinal(&self) -> Option<u64> {
        match (&self.channel, self.current) {
            (SubscriberChannel::Mapped(channel), Some(id)) => Some(channel.slot_ordinal(id)),
            _ => None,
        }
    }

    /// Register a callback invoked with the number of missed messages
    /// whenever an ordinal gap is observed.
    pub fn set_drop_callback(&mut self, callback: impl FnMut(i64) + Send + 'static) {
        self.drop_callback = Some(Box::new(callback));
    }

    pub fn clear_drop_callback(&mut self) {
        self.drop_callback = None;
    }

    /// Has the server's publisher set changed since this handle last
    /// synced? Lock-free staleness hint; a `true` means the owning layer
    /// should fetch fresh descriptors and call [`Subscriber::remap`].
    pub fn needs_reload(&self) -> bool {
        let counters = match &self.channel {
            SubscriberChannel::Placeholder(scb) => scb.counters(self.channel_id),
            SubscriberChannel::Mapped(channel) => channel.scb_counters(),
        };
        let seen = match &self.channel {
            SubscriberChannel::Placeholder(_) => 0,
            SubscriberChannel::Mapped(channel) => channel.num_updates,
        };
        counters.num_pub_updates != seen
    }

    /// Re-realise the subscriber over fresh descriptors (placeholder →
    /// mapped, or a remap after the channel changed). The cursor resets.
    pub fn remap(
        &mut self,
        slot_size: i32,
        num_slots: i32,
        scb: ScbView,
        fds: &SharedMemoryFds,
        num_updates: u16,
        reliable_pub_triggers: Vec<Trigger>,
    ) -> Result<()> {
        let mut channel = Channel::map(
            &self.name,
            self.channel_id,
            slot_size,
            num_slots,
            scb,
            fds,
        )?;
        channel.num_updates = num_updates;
        self.channel = SubscriberChannel::Mapped(channel);
        self.reliable_pub_triggers = reliable_pub_triggers;
        self.current = None;
        // Pick up whatever is already on the channel.
        self.trigger.fire();
        Ok(())
    }

    /// Read the next (or newest) message. An empty message means there is
    /// nothing to read: the channel is drained, or this subscriber is
    /// still a placeholder.
    pub fn read_message(&mut self, mode: ReadMode) -> Result<Message> {
        self.poll.clear();
        let channel = match &self.channel {
            SubscriberChannel::Placeholder(_) => return Ok(Message::empty()),
            SubscriberChannel::Mapped(channel) => channel,
        };

        let reliable = self.options.reliable;
        let owner = self.subscriber_id;

        loop {
            let last_ordinal = self.current.map(|id| channel.slot_ordinal(id));
            let moved = match mode {
                ReadMode::Next => channel.next_slot(self.current, reliable, owner)?,
                ReadMode::Newest => channel.last_slot(self.current, reliable, owner)?,
            };
            let Some(new_id) = moved else {
                // Drained. Nudge back-pressured reliable publishers: our
                // released references may have freed slots.
                for trigger in &self.reliable_pub_triggers {
                    trigger.fire();
                }
                return Ok(Message::empty());
            };
            self.current = Some(new_id);

            let ordinal = channel.slot_ordinal(new_id);
            if let Some(last) = last_ordinal {
                let missed = ordinal as i64 - last as i64 - 1;
                if missed > 0 {
                    if self.options.log_dropped_messages {
                        log::warn!(
                            "dropped {} message{} on channel '{}'",
                            missed,
                            if missed == 1 { "" } else { "s" },
                            self.name
                        );
                    }
                    if let Some(callback) = &mut self.drop_callback {
                        callback(missed);
                    }
                }
            }

            // Read outside the lock: our cursor reference pins the slot.
            let prefix = channel.prefix(new_id);
            let is_activation = prefix.flags & MESSAGE_ACTIVATE != 0;
            if is_activation && !self.options.pass_activation {
                match mode {
                    // Cursor is parked on the marker; the next iteration
                    // moves past it (or drains).
                    ReadMode::Next => continue,
                    // The newest message is the marker: nothing to deliver.
                    ReadMode::Newest => {
                        for trigger in &self.reliable_pub_triggers {
                            trigger.fire();
                        }
                        return Ok(Message::empty());
                    }
                }
            }

            return Ok(Message {
                length: channel.slot_message_size(new_id) as usize,
                buffer: channel.payload_ptr(new_id),
                ordinal,
                timestamp: prefix.timestamp,
                is_activation,
                slot_id: new_id,
            });
        }
    }

    /// Find the newest active message whose timestamp is `<=` the given
    /// one. An empty result leaves the cursor (and its references) exactly
    /// where they were.
    pub fn find_message(&mut self, timestamp: u64) -> Result<Message> {
        let channel = match &self.channel {
            SubscriberChannel::Placeholder(_) => return Ok(Message::empty()),
            SubscriberChannel::Mapped(channel) => channel,
        };
        let found = channel.find_active_slot_by_timestamp(
            self.current,
            timestamp,
            self.options.reliable,
            self.subscriber_id,
            &mut self.scratch,
        )?;
        let Some(new_id) = found else {
            return Ok(Message::empty());
        };
        self.current = Some(new_id);
        let prefix = channel.prefix(new_id);
        Ok(Message {
            length: channel.slot_message_size(new_id) as usize,
            buffer: channel.payload_ptr(new_id),
            ordinal: channel.slot_ordinal(new_id),
            timestamp: prefix.timestamp,
            is_activation: prefix.flags & MESSAGE_ACTIVATE != 0,
            slot_id: new_id,
        })
    }

    /// Block until a new message may be available.
    pub fn wait(&self, timeout_ms: Option<i32>) -> Result<()> {
        self.poll.wait(timeout_ms)
    }

    /// The raw poll descriptor, for integration into an external poll loop
    /// or cooperative scheduler.
    pub fn poll_fd(&self) -> std::os::fd::RawFd {
        self.poll.raw_fd()
    }

    /// Fire this subscriber's own notifier.
    pub fn trigger(&self) {
        self.trigger.fire();
    }
}
