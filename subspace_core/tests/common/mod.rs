//! In-process stand-in for the Subspace server.
//!
//! Integration tests need someone to play the server's role: allocate the
//! shared-memory objects, assign owner IDs, maintain the SCB counters, and
//! wire up notifier pipes. `TestBus` does exactly that for one channel,
//! handing each participant its own private mapping the way the real
//! server hands out descriptors.

#![allow(dead_code)]

use std::os::fd::{AsRawFd, OwnedFd};

use subspace_core::trigger::{notifier_pair, Trigger};
use subspace_core::{
    Channel, Publisher, PublisherOptions, ScbView, SharedMemoryFds, Subscriber, SubscriberOptions,
};

const CHANNEL_ID: i32 = 7;

pub struct TestBus {
    /// The server's own mapping of the channel, used for allocation-time
    /// initialization, diagnostics, and owner cleanup.
    pub server: Channel,
    /// The server's SCB view: the single writer of the counters.
    scb: ScbView,
    scb_fd: OwnedFd,
    fds: SharedMemoryFds,
    name: String,
    slot_size: i32,
    num_slots: i32,
    next_owner: i32,
    /// Write ends of every subscriber's notifier, cloned into publishers.
    sub_triggers: Vec<Trigger>,
    /// Write ends of every reliable publisher's notifier, cloned into
    /// subscribers.
    reliable_pub_triggers: Vec<Trigger>,
}

impl TestBus {
    pub fn new(name: &str, slot_size: i32, num_slots: i32) -> Self {
        let scb = ScbView::create().expect("scb create");
        let scb_fd = scb.dup_fd().expect("scb dup");
        let server_scb = ScbView::from_fd(scb_fd.as_raw_fd()).expect("scb map");
        let (server, fds) = Channel::allocate(name, slot_size, num_slots, CHANNEL_ID, server_scb)
            .expect("channel allocate");
        Self {
            server,
            scb,
            scb_fd,
            fds,
            name: name.to_string(),
            slot_size,
            num_slots,
            next_owner: 0,
            sub_triggers: Vec::new(),
            reliable_pub_triggers: Vec::new(),
        }
    }

    pub fn channel_id(&self) -> i32 {
        CHANNEL_ID
    }

    pub fn scb_fd(&self) -> std::os::fd::RawFd {
        self.scb_fd.as_raw_fd()
    }

    pub fn fds(&self) -> &SharedMemoryFds {
        &self.fds
    }

    fn alloc_owner(&mut self) -> i32 {
        let owner = self.next_owner;
        self.next_owner += 1;
        owner
    }

    /// Map a fresh participant view of the channel, the way a client would
    /// from received descriptors.
    pub fn map_channel(&self) -> Channel {
        let scb = ScbView::from_fd(self.scb_fd.as_raw_fd()).expect("scb map");
        Channel::map(
            &self.name,
            CHANNEL_ID,
            self.slot_size,
            self.num_slots,
            scb,
            &self.fds,
        )
        .expect("channel map")
    }

    pub fn add_publisher(&mut self, options: PublisherOptions) -> Publisher {
        let owner = self.alloc_owner();
        let (trigger, poll) = notifier_pair().expect("notifier");
        let reliable = options.reliable;

        self.scb.update(CHANNEL_ID, |c| {
            c.num_pubs += 1;
            c.num_pub_updates += 1;
            if reliable {
                c.num_reliable_pubs += 1;
            }
        });

        let sub_triggers = self
            .sub_triggers
            .iter()
            .map(|t| t.try_clone().expect("trigger clone"))
            .collect();
        let publisher = Publisher::new(self.map_channel(), options, owner, poll, sub_triggers)
            .expect("publisher");
        if reliable {
            self.reliable_pub_triggers.push(trigger);
        }
        publisher
    }

    pub fn add_subscriber(&mut self, options: SubscriberOptions) -> Subscriber {
        let owner = self.alloc_owner();
        let (trigger, poll) = notifier_pair().expect("notifier");
        let reliable = options.reliable;

        self.scb.update(CHANNEL_ID, |c| {
            c.num_subs += 1;
            c.num_sub_updates += 1;
            if reliable {
                c.num_reliable_subs += 1;
            }
        });

        self.sub_triggers
            .push(trigger.try_clone().expect("trigger clone"));
        let reliable_pub_triggers = self
            .reliable_pub_triggers
            .iter()
            .map(|t| t.try_clone().expect("trigger clone"))
            .collect();
        Subscriber::new(
            self.map_channel(),
            options,
            owner,
            poll,
            trigger,
            reliable_pub_triggers,
        )
    }

    /// The server evicting a dead participant: eliminate its footprint.
    pub fn evict(&self, owner: i32, reliable: bool) {
        self.server
            .cleanup_slots(owner, reliable)
            .expect("cleanup_slots");
    }
}
