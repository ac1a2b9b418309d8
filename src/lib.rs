//! Publish and subscribe on top of a state vector sync engine
//!
//! Producers publish named objects. The sync engine assigns each object the next sequence
//! number of its producer and tells every other member which `(producer, sequence)` ranges
//! became available. This crate sits on top of that: it keeps track of subscriptions, resolves
//! which object name hides behind a `(producer, sequence)` pair, fetches only the objects
//! somebody subscribed to, and hands each object to a subscriber at most once.
//!
//! The crate is split the same way as a gossip protocol implementation:
//!
//! - [`proto`] contains the protocol as a state machine without any IO. It consumes
//!   [`proto::InEvent`]s and emits [`proto::OutEvent`]s.
//! - [`net`] drives that state machine from a single actor task against a [`net::SyncEngine`]
//!   and exposes the cloneable [`net::PubSub`] handle to applications.
//! - [`memory`] is an in-process sync engine used by tests and the demos.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod memory;
pub mod metrics;
pub mod net;
pub mod proto;
pub mod security;

pub use self::{
    net::{PubSub, PublishOptions, SyncEngine},
    proto::{MissingRange, Name, SeqNo, SubscriptionHandle, SubscriptionPacket},
};
