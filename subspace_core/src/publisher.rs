//! The publisher state machine.
//!
//! An unreliable publisher always has a writable slot in hand: it is
//! created holding one and every publish atomically swaps it for the next.
//! Running out of slots is fatal for it.
//!
//! A reliable publisher is slotless when idle. It acquires a slot lazily on
//! the next buffer request, so slot exhaustion surfaces there as an absent
//! buffer, back-pressure the caller can wait out on the poll fd, rather
//! than as an overwrite of a message some reliable subscriber still owes a
//! read. On creation it publishes a single one-byte activation message so
//! that reliable subscribers always have at least one slot to pin.

use crate::channel::Channel;
use crate::error::{Result, SubspaceError};
use crate::message::Message;
use crate::options::PublisherOptions;
use crate::trigger::{PollFd, Trigger};

/// A publisher bound to one channel.
pub struct Publisher {
    channel: Channel,
    options: PublisherOptions,
    publisher_id: i32,
    /// The slot currently being written, on the busy list. Always set for
    /// unreliable publishers; `None` for reliable publishers between
    /// publishes.
    current: Option<i32>,
    /// Readable when slots may have freed up (reliable publishers only).
    poll: PollFd,
    /// One trigger per subscriber, fired when a publish needs a wakeup.
    subscriber_triggers: Vec<Trigger>,
}

impl Publisher {
    /// Bind a publisher to a mapped channel. The id, poll fd, and
    /// subscriber triggers come from the server.
    ///
    /// Reliable publishers immediately emit their activation message;
    /// unreliable publishers immediately claim their first slot.
    pub fn new(
        channel: Channel,
        options: PublisherOptions,
        publisher_id: i32,
        poll: PollFd,
        subscriber_triggers: Vec<Trigger>,
    ) -> Result<Self> {
        let mut publisher = Self {
            channel,
            options,
            publisher_id,
            current: None,
            poll,
            subscriber_triggers,
        };

        if publisher.options.reliable {
            if !publisher.options.bridge {
                publisher.send_activation()?;
            }
        } else {
            let slot = publisher
                .channel
                .find_free_slot(false, publisher_id)?
                .ok_or_else(|| SubspaceError::ChannelFull(publisher.channel.name().to_string()))?;
            publisher.current = Some(slot);
        }
        publisher.trigger_subscribers();
        Ok(publisher)
    }

    /// One marker message, size 1, Activate flag set. Its only job is to
    /// put a slot on the active list so every reliable subscriber acquires
    /// a reliable reference before this publisher can fill the ring.
    fn send_activation(&mut self) -> Result<()> {
        let slot = self
            .channel
            .find_free_slot(true, self.publisher_id)?
            .ok_or_else(|| SubspaceError::ChannelFull(self.channel.name().to_string()))?;
        self.channel.stage_message_size(slot, 1);
        self.channel
            .activate_slot_and_get_another(slot, true, true, self.publisher_id, false)?;
        self.current = None;
        Ok(())
    }

    pub fn name(&self) -> &str {
        self.channel.name()
    }

    pub fn is_reliable(&self) -> bool {
        self.options.reliable
    }

    pub fn publisher_id(&self) -> i32 {
        self.publisher_id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Get the buffer to write the next message into.
    ///
    /// `Ok(None)` is back-pressure, and only reliable publishers see it:
    /// either no free slot exists (wait on the poll fd), or the channel has
    /// no subscribers yet: with nobody pinning slots, publishing would let
    /// the ring wrap before a reliable subscriber ever arrived.
    pub fn get_buffer(&mut self) -> Result<Option<&mut [u8]>> {
        if self.options.reliable {
            self.poll.clear();
            if self.current.is_none() {
                if self.channel.num_subscribers() == 0 {
                    return Ok(None);
                }
                match self.channel.find_free_slot(true, self.publisher_id)? {
                    Some(slot) => self.current = Some(slot),
                    None => return Ok(None),
                }
            }
        }
        let slot = self.current.ok_or_else(|| {
            SubspaceError::NotConnected(self.channel.name().to_string())
        })?;
        let ptr = self.channel.payload_ptr(slot);
        let len = self.channel.slot_size() as usize;
        // SAFETY: the slot is on the busy list and owned by this publisher;
        // nothing else reads or writes its payload until it is activated.
        Ok(Some(unsafe { std::slice::from_raw_parts_mut(ptr, len) }))
    }

    /// Publish the message previously written into the buffer.
    ///
    /// Returns a receipt carrying the assigned ordinal and timestamp. For
    /// unreliable publishers a fresh slot is acquired eagerly and failure
    /// to get one is fatal; reliable publishers go back to idle.
    pub fn publish_message(&mut self, message_size: usize) -> Result<Message> {
        let slot = self.current.ok_or_else(|| {
            SubspaceError::invalid_input("no buffer held; call get_buffer first")
        })?;
        if message_size == 0 || message_size > self.channel.slot_size() as usize {
            return Err(SubspaceError::invalid_input(format!(
                "message size {} outside 1..={}",
                message_size,
                self.channel.slot_size()
            )));
        }

        self.channel.stage_message_size(slot, message_size as u64);
        let published = self.channel.activate_slot_and_get_another(
            slot,
            self.options.reliable,
            false,
            self.publisher_id,
            self.options.bridge,
        )?;
        self.current = published.new_slot;

        if published.notify {
            self.trigger_subscribers();
        }

        if self.current.is_none() && !self.options.reliable {
            return Err(SubspaceError::ChannelFull(self.channel.name().to_string()));
        }

        Ok(Message::published(
            message_size,
            published.ordinal,
            published.timestamp,
        ))
    }

    /// Write and publish in one call.
    pub fn publish(&mut self, payload: &[u8]) -> Result<Message> {
        let buffer = self.get_buffer()?;
        match buffer {
            None => Ok(Message::empty()),
            Some(buffer) => {
                if payload.len() > buffer.len() {
                    return Err(SubspaceError::invalid_input(format!(
                        "payload of {} bytes exceeds slot size {}",
                        payload.len(),
                        buffer.len()
                    )));
                }
                buffer[..payload.len()].copy_from_slice(payload);
                self.publish_message(payload.len())
            }
        }
    }

    /// Block until a slot may have freed up. Only meaningful for reliable
    /// publishers.
    pub fn wait(&self, timeout_ms: Option<i32>) -> Result<()> {
        if !self.options.reliable {
            return Err(SubspaceError::invalid_input(
                "unreliable publishers can't wait",
            ));
        }
        self.poll.wait(timeout_ms)
    }

    /// The raw poll descriptor, for integration into an external poll loop
    /// or cooperative scheduler.
    pub fn poll_fd(&self) -> std::os::fd::RawFd {
        self.poll.raw_fd()
    }

    fn trigger_subscribers(&self) {
        for trigger in &self.subscriber_triggers {
            trigger.fire();
        }
    }
}
