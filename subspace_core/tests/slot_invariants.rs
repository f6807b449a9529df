//! Invariant and boundary-behavior tests for the slot machinery.
//!
//! The channel's `snapshot()` diagnostic is the workhorse here: it fails
//! with a corruption error unless every slot is on exactly one list, and
//! it exposes the reference counts the invariants below are stated over.

mod common;

use std::sync::{Arc, Mutex};

use common::TestBus;
use subspace_core::{PublisherOptions, ReadMode, SlotInfo, SubscriberOptions};

/// ref_count ≥ reliable_ref_count ≥ 0, and the owner bitset accounts for
/// at least every subscriber reference.
fn check_reference_invariants(snapshot: &[SlotInfo]) {
    for slot in snapshot {
        assert!(slot.ref_count >= 0, "slot {}: negative ref_count", slot.id);
        assert!(
            slot.ref_count >= slot.reliable_ref_count,
            "slot {}: reliable refs exceed refs",
            slot.id
        );
        assert!(slot.reliable_ref_count >= 0);
        assert!(
            slot.owner_count >= slot.ref_count as u32,
            "slot {}: fewer owners than references",
            slot.id
        );
    }
}

#[test]
fn membership_and_refcounts_hold_through_a_workload() {
    let mut bus = TestBus::new("invariants", 64, 4);
    let mut publisher = bus.add_publisher(PublisherOptions::new());
    let mut subscriber = bus.add_subscriber(SubscriberOptions::new());
    let mut reliable_sub = bus.add_subscriber(SubscriberOptions::new().reliable(true));

    for i in 0..20u32 {
        publisher.publish(&i.to_le_bytes()).unwrap();
        if i % 3 == 0 {
            subscriber.read_message(ReadMode::Next).unwrap();
        }
        if i % 5 == 0 {
            reliable_sub.read_message(ReadMode::Newest).unwrap();
        }
        // snapshot() itself verifies exactly-one-list membership.
        let snapshot = bus.server.snapshot().unwrap();
        check_reference_invariants(&snapshot);

        let ordinals = bus.server.active_ordinals().unwrap();
        assert!(
            ordinals.windows(2).all(|w| w[0] < w[1]),
            "active list not strictly ordered: {:?}",
            ordinals
        );
    }
    assert_eq!(bus.server.counters().unwrap().total_messages, 20);
}

#[test]
fn drop_accounting_balances_for_a_next_only_subscriber() {
    let mut bus = TestBus::new("accounting", 64, 3);
    let mut publisher = bus.add_publisher(PublisherOptions::new());
    let mut subscriber =
        bus.add_subscriber(SubscriberOptions::new().log_dropped_messages(false));

    let dropped: Arc<Mutex<i64>> = Arc::new(Mutex::new(0));
    let sink = Arc::clone(&dropped);
    subscriber.set_drop_callback(move |missed| *sink.lock().unwrap() += missed);

    const TOTAL: u64 = 25;
    let mut read = 0i64;
    for i in 1..=TOTAL {
        publisher.publish(format!("m{}", i).as_bytes()).unwrap();
        // Catch ordinal 1 before the ring can wrap, then read only
        // sporadically so the ring laps the subscriber.
        if i == 1 || i % 4 == 0 {
            if !subscriber.read_message(ReadMode::Next).unwrap().is_empty() {
                read += 1;
            }
        }
    }
    // Drain whatever is left.
    loop {
        let message = subscriber.read_message(ReadMode::Next).unwrap();
        if message.is_empty() {
            break;
        }
        read += 1;
    }

    // Starting from ordinal 1, every published message was either read or
    // reported dropped.
    assert_eq!(read + *dropped.lock().unwrap(), TOTAL as i64);
}

#[test]
fn subscriber_joining_after_wrap_sees_only_surviving_messages() {
    let mut bus = TestBus::new("late_join", 64, 3);
    let mut publisher = bus.add_publisher(PublisherOptions::new());
    for i in 1..=10 {
        publisher.publish(format!("m{}", i).as_bytes()).unwrap();
    }

    let mut subscriber = bus.add_subscriber(SubscriberOptions::new());
    let drops: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&drops);
    subscriber.set_drop_callback(move |missed| sink.lock().unwrap().push(missed));

    // The ring wrapped long ago: the first visible ordinal is > 1, read
    // with no gap reported (there is no previous ordinal to compare with).
    let first = subscriber.read_message(ReadMode::Next).unwrap();
    assert!(first.ordinal > 1);
    assert!(drops.lock().unwrap().is_empty());

    // The survivors come out in order.
    let mut last = first.ordinal;
    loop {
        let message = subscriber.read_message(ReadMode::Next).unwrap();
        if message.is_empty() {
            break;
        }
        assert_eq!(message.ordinal, last + 1);
        last = message.ordinal;
    }
    assert_eq!(last, 10);
}

#[test]
fn reliable_publisher_with_zero_subscribers_gets_no_buffer() {
    let mut bus = TestBus::new("no_subs", 64, 4);
    let mut publisher = bus.add_publisher(PublisherOptions::new().reliable(true));

    // Nothing pins slots while there are no subscribers; handing out a
    // buffer would let the ring wrap before a reliable subscriber arrives.
    assert!(publisher.get_buffer().unwrap().is_none());

    let _subscriber = bus.add_subscriber(SubscriberOptions::new().reliable(true));
    assert!(publisher.get_buffer().unwrap().is_some());
}

#[test]
fn newest_mode_reports_skipped_messages() {
    let mut bus = TestBus::new("newest", 64, 8);
    let mut publisher = bus.add_publisher(PublisherOptions::new());
    let mut subscriber =
        bus.add_subscriber(SubscriberOptions::new().log_dropped_messages(false));

    let drops: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&drops);
    subscriber.set_drop_callback(move |missed| sink.lock().unwrap().push(missed));

    for i in 1..=5 {
        publisher.publish(format!("m{}", i).as_bytes()).unwrap();
    }
    // First read: no previous ordinal, so no gap is reported.
    let newest = subscriber.read_message(ReadMode::Newest).unwrap();
    assert_eq!(newest.ordinal, 5);
    assert!(drops.lock().unwrap().is_empty());

    for i in 6..=8 {
        publisher.publish(format!("m{}", i).as_bytes()).unwrap();
    }
    // Jumping 5 -> 8 skips ordinals 6 and 7.
    let newest = subscriber.read_message(ReadMode::Newest).unwrap();
    assert_eq!(newest.ordinal, 8);
    assert_eq!(drops.lock().unwrap().clone(), vec![2]);
}

#[test]
fn concurrent_publishers_assign_unique_ordered_ordinals() {
    let mut bus = TestBus::new("racing", 64, 8);
    let mut handles = Vec::new();
    for _ in 0..2 {
        let mut publisher = bus.add_publisher(PublisherOptions::new());
        handles.push(std::thread::spawn(move || {
            for i in 0..50u32 {
                publisher.publish(&i.to_le_bytes()).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(bus.server.counters().unwrap().total_messages, 100);
    assert_eq!(bus.server.next_ordinal().unwrap(), 101);
    let ordinals = bus.server.active_ordinals().unwrap();
    assert!(ordinals.windows(2).all(|w| w[0] < w[1]));
    bus.server.snapshot().unwrap();
}

#[test]
fn cleanup_for_a_publisher_leaves_subscriber_references_alone() {
    let mut bus = TestBus::new("mixed_cleanup", 64, 4);
    let mut publisher = bus.add_publisher(PublisherOptions::new());
    let mut subscriber = bus.add_subscriber(SubscriberOptions::new());

    publisher.publish(b"m1").unwrap();
    let message = subscriber.read_message(ReadMode::Next).unwrap();
    let held = message.slot_id as usize;

    // Evicting the publisher must not disturb the subscriber's pin.
    bus.evict(0, false);
    let snapshot = bus.server.snapshot().unwrap();
    assert_eq!(snapshot[held].ref_count, 1);
    assert_eq!(snapshot[held].owner_count, 1);
}
