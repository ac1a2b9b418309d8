//! Protocol implementation, as a state machine without IO

pub mod data;
pub mod dedup;
pub mod mapping;
pub mod name;
pub mod state;
pub mod subscription;

pub use self::{
    data::{ContentType, Data, DecodeError, EncodeError, SignatureInfo, SyncObject},
    dedup::{DedupCache, ObjectId},
    mapping::{InsertOutcome, MappingList, MappingStore, MemoryMappingStore, SeqRange},
    name::{Component, Name, NameParseError, SeqNo},
    state::{
        Config, Delivery, FetchRequest, InEvent, MappingRequest, MissingRange, OutEvent, Retries,
        State, Stats, SubscriptionPacket,
    },
    subscription::{Registry, Scope, Subscription, SubscriptionHandle},
};
