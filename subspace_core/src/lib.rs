//! # Subspace core
//!
//! The shared-memory channel core of Subspace, a local pub/sub messaging
//! bus. Publishers and subscribers in different processes on the same host
//! exchange fixed-layout messages through POSIX shared-memory regions
//! brokered by a central server, without copying message bytes.
//!
//! This crate is the part that lives in shared memory and in every
//! participant:
//!
//! - **Channel layout**: the channel control block (name, sizing, ordinal
//!   counter, statistics, robust mutex, slot table), the parallel buffer
//!   region of prefixed payload slots, and the server-wide system control
//!   block of update counters.
//! - **Slot lifecycle**: every slot is always on exactly one of the free,
//!   busy, or active lists (offset-linked, since each process maps the
//!   memory at a different address); publishers stage messages in busy
//!   slots and activate them onto the ordinal-ordered active list, where
//!   subscriber cursors pin them with reference counts until read.
//! - **Reliability**: reliable publishers never reclaim a slot a reliable
//!   subscriber still owes a read for (they see back-pressure instead)
//!   and emit a one-byte activation marker at creation so late-joining
//!   reliable subscribers always have a slot to pin.
//!
//! The request/response protocol that distributes file descriptors, the
//! TCP bridge, and the server process itself live elsewhere; this crate
//! treats them purely as a source of descriptors, size parameters, and
//! owner IDs.
//!
//! ```no_run
//! use std::os::fd::AsRawFd;
//! use subspace_core::trigger::notifier_pair;
//! use subspace_core::{Channel, Publisher, PublisherOptions, ScbView};
//!
//! # fn main() -> subspace_core::Result<()> {
//! // Server side: allocate the SCB and one channel.
//! let scb = ScbView::create()?;
//! let scb_fd = scb.dup_fd()?;
//! let (_server, fds) = Channel::allocate("telemetry", 256, 16, 0, scb)?;
//!
//! // Participant side: map the same objects from the descriptors and
//! // publish. Ids and notifier fds normally come from the server.
//! let channel = Channel::map(
//!     "telemetry",
//!     0,
//!     256,
//!     16,
//!     ScbView::from_fd(scb_fd.as_raw_fd())?,
//!     &fds,
//! )?;
//! let (_trigger, poll) = notifier_pair()?;
//! let mut publisher =
//!     Publisher::new(channel, PublisherOptions::new(), 1, poll, Vec::new())?;
//! publisher.publish(b"hello")?;
//! # Ok(()) }
//! ```

pub mod channel;
pub mod error;
pub mod memory;
pub mod message;
pub mod options;
pub mod publisher;
pub mod subscriber;
pub mod trigger;

pub use channel::{
    Channel, ChannelStats, DeadOwner, PublishedMessage, ScbView, SharedMemoryFds, SlotInfo,
    SlotListKind,
};
pub use error::{Result, SubspaceError};
pub use memory::ShmRegion;
pub use message::Message;
pub use options::{PublisherOptions, SubscriberOptions};
pub use publisher::Publisher;
pub use subscriber::{ReadMode, Subscriber};
