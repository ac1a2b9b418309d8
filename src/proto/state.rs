//! The pub/sub protocol state
//!
//! [`State`] reacts to what the sync engine reports and decides what to fetch and what to
//! deliver. It does no IO itself: every input is an [`InEvent`] and every action the runtime
//! has to perform is returned as an [`OutEvent`].

use std::{collections::VecDeque, fmt, mem};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{
    data::{Data, EncodeError, SyncObject},
    dedup::{DedupCache, ObjectId},
    mapping::{InsertOutcome, MappingList, MappingStore, MemoryMappingStore, SeqRange},
    name::{Name, SeqNo},
    subscription::{Registry, SubscriptionHandle},
};

/// Default capacity of the [`DedupCache`].
pub const DEFAULT_MAX_OBJECT_IDS: usize = 32768;

/// Default number of sequence numbers asked for in a single mapping lookup.
///
/// Mapping responses have a bounded size, longer ranges are split into chunks of this length.
pub const DEFAULT_MAPPING_CHUNK_LEN: u64 = 11;

/// A range of sequence numbers the sync engine reports as newly available from a producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MissingRange {
    /// The producer that advanced.
    pub producer: Name,
    /// First new sequence number.
    pub low: SeqNo,
    /// Last new sequence number, inclusive.
    pub high: SeqNo,
}

impl MissingRange {
    /// Create a new missing range.
    pub fn new(producer: Name, low: SeqNo, high: SeqNo) -> Self {
        Self {
            producer,
            low,
            high,
        }
    }

    /// The sequence numbers of this range.
    pub fn seqs(&self) -> SeqRange {
        SeqRange::new(self.low, self.high)
    }
}

/// An object handed to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionPacket {
    /// The application object.
    pub data: Data,
    /// The producer it was published by.
    pub producer: Name,
    /// Its sequence number in the producer's stream.
    pub seq: SeqNo,
}

/// How often the sync engine should retry a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Retries {
    /// Until the object arrives.
    #[default]
    Unlimited,
    /// At most this many times after the first attempt.
    Limited(u32),
}

/// Protocol configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capacity of the cache of delivered object ids.
    pub max_object_ids: usize,
    /// Maximum number of sequence numbers per mapping lookup.
    ///
    /// The unresolved part of a range is always advanced by this amount per lookup, no matter
    /// how many mappings the response contains.
    pub mapping_chunk_len: u64,
    /// Retry budget for data fetches and mapping lookups.
    pub fetch_retries: Retries,
    /// Whether encapsulated objects have to be validated before delivery.
    ///
    /// If set, deliveries are emitted as [`OutEvent::Validate`] instead of
    /// [`OutEvent::Deliver`].
    pub validate_encapsulated: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_object_ids: DEFAULT_MAX_OBJECT_IDS,
            mapping_chunk_len: DEFAULT_MAPPING_CHUNK_LEN,
            fetch_retries: Retries::Unlimited,
            validate_encapsulated: false,
        }
    }
}

/// A data fetch, identified by producer, sequence number and the subscription it is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchRequest {
    /// Producer to fetch from.
    pub producer: Name,
    /// Sequence number to fetch.
    pub seq: SeqNo,
    /// The subscription that wants the object.
    pub subscription: SubscriptionHandle,
    /// Prefetch of a sequence number that was not reported yet. Failure is expected.
    pub speculative: bool,
}

/// A mapping lookup for a chunk of a producer's stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappingRequest {
    /// Producer whose mappings are requested.
    pub producer: Name,
    /// The requested sequence numbers.
    pub range: SeqRange,
}

/// An object ready to be handed to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Receiving subscription.
    pub subscription: SubscriptionHandle,
    /// The packet to deliver.
    pub packet: SubscriptionPacket,
}

/// Input event to the protocol state.
#[derive(Clone)]
pub enum InEvent {
    /// The sync engine reports newly available data.
    MissingData(Vec<MissingRange>),
    /// A data fetch completed. `None` if the engine gave up.
    DataFetched(FetchRequest, Option<SyncObject>),
    /// A mapping lookup completed. `None` if the engine gave up.
    MappingsFetched(MappingRequest, Option<MappingList>),
    /// A sync message from a peer carried an extra block.
    RecvExtraBlock(Bytes),
}

impl fmt::Debug for InEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingData(batch) => write!(f, "MissingData({batch:?})"),
            Self::DataFetched(req, obj) => write!(f, "DataFetched({req:?}, {obj:?})"),
            Self::MappingsFetched(req, list) => write!(
                f,
                "MappingsFetched({req:?}, {:?})",
                list.as_ref().map(|l| l.pairs.len())
            ),
            Self::RecvExtraBlock(block) => write!(f, "RecvExtraBlock(<{}>)", block.len()),
        }
    }
}

/// An output event from the protocol state, to be performed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutEvent {
    /// Fetch an object through the sync engine and report back with [`InEvent::DataFetched`].
    FetchData(FetchRequest),
    /// Look up mappings and report back with [`InEvent::MappingsFetched`].
    FetchMappings(MappingRequest),
    /// Validate the encapsulated object, and deliver it if it is valid.
    Validate(Delivery),
    /// Invoke the subscription's callback.
    Deliver(Delivery),
    /// Invoke the update callback with the batch, exactly as reported.
    EmitUpdate(Vec<MissingRange>),
}

/// Counters of what the state did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// Objects published by this node.
    pub published: u64,
    /// Missing ranges received.
    pub missing_ranges: u64,
    /// Data fetches issued, including prefetches.
    pub fetches: u64,
    /// Speculative fetches issued.
    pub prefetches: u64,
    /// Mapping lookups issued.
    pub mapping_lookups: u64,
    /// Objects handed out for delivery or validation.
    pub delivered: u64,
    /// Fetched objects that had already been delivered.
    pub duplicates: u64,
    /// Fetched objects that did not encapsulate an application object.
    pub not_encapsulated: u64,
    /// Fetched objects whose application object failed to decode.
    pub malformed_objects: u64,
    /// Fetch completions for subscriptions that were removed meanwhile.
    pub orphaned: u64,
    /// Data fetches the engine gave up on.
    pub failed_fetches: u64,
    /// Mapping lookups the engine gave up on.
    pub failed_mapping_lookups: u64,
    /// Mappings that disagreed with an already recorded mapping.
    pub mapping_conflicts: u64,
    /// Extra blocks handed to the engine.
    pub extra_blocks_sent: u64,
    /// Extra blocks received from peers.
    pub extra_blocks_received: u64,
    /// Received extra blocks that failed to decode.
    pub malformed_extra_blocks: u64,
}

/// Mappings of own publications that were not yet piggybacked.
///
/// The list belongs to a single producer. Publications under a different producer are not
/// added while the list is non-empty.
#[derive(Debug, Default)]
struct PendingMappings {
    owner: Option<Name>,
    pairs: Vec<(SeqNo, Name)>,
}

impl PendingMappings {
    fn record(&mut self, producer: &Name, seq: SeqNo, name: &Name) -> bool {
        match &self.owner {
            Some(owner) if owner != producer => false,
            _ => {
                self.owner = Some(producer.clone());
                self.pairs.push((seq, name.clone()));
                true
            }
        }
    }
}

/// The pub/sub protocol state of a node.
#[derive(Debug)]
pub struct State<S = MemoryMappingStore> {
    me: Name,
    config: Config,
    registry: Registry,
    dedup: DedupCache,
    pending: PendingMappings,
    store: S,
    outbox: VecDeque<OutEvent>,
    stats: Stats,
}

impl State<MemoryMappingStore> {
    /// Create the state for the node publishing as `me`, with an in-memory mapping store.
    pub fn new(me: Name, config: Config) -> Self {
        Self::with_store(me, config, MemoryMappingStore::default())
    }
}

impl<S: MappingStore> State<S> {
    /// Create the state with a custom mapping store.
    pub fn with_store(me: Name, config: Config, store: S) -> Self {
        Self {
            dedup: DedupCache::new(config.max_object_ids),
            me,
            config,
            registry: Registry::default(),
            pending: PendingMappings::default(),
            store,
            outbox: VecDeque::new(),
            stats: Stats::default(),
        }
    }

    /// The producer identity of this node.
    pub fn me(&self) -> &Name {
        &self.me
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Handle an incoming event.
    ///
    /// Returns an iterator of outgoing events that must be processed by the runtime.
    pub fn handle(&mut self, event: InEvent) -> impl Iterator<Item = OutEvent> + '_ {
        match event {
            InEvent::MissingData(batch) => self.on_missing_data(batch),
            InEvent::DataFetched(request, object) => self.on_data_fetched(request, object),
            InEvent::MappingsFetched(request, list) => self.on_mappings_fetched(request, list),
            InEvent::RecvExtraBlock(block) => self.on_extra_block(&block),
        }
        self.outbox.drain(..)
    }

    /// Subscribe to all objects of producers matching `prefix`.
    pub fn subscribe_to_producer(&mut self, prefix: Name, prefetch: bool) -> SubscriptionHandle {
        self.registry.subscribe_to_producer(prefix, prefetch)
    }

    /// Subscribe to all objects with a name matching `prefix`.
    pub fn subscribe_to_prefix(&mut self, prefix: Name) -> SubscriptionHandle {
        self.registry.subscribe_to_prefix(prefix)
    }

    /// Remove a subscription. Returns `false` if the handle is unknown.
    ///
    /// Fetches already issued for the subscription are not cancelled. Their completions are
    /// ignored.
    pub fn unsubscribe(&mut self, handle: SubscriptionHandle) -> bool {
        self.registry.unsubscribe(handle)
    }

    /// The subscription registry.
    pub fn subscriptions(&self) -> &Registry {
        &self.registry
    }

    /// Record that `name` was published as `seq` of `producer`.
    ///
    /// The mapping is stored, and queued for piggybacking unless the queue currently holds
    /// mappings of a different producer.
    pub fn record_publish(&mut self, producer: &Name, seq: SeqNo, name: &Name) {
        self.stats.published += 1;
        if !self.pending.record(producer, seq, name) {
            debug!(%producer, seq, "pending mappings belong to another producer, not piggybacking");
        }
        self.learn_mapping(producer, seq, name.clone());
    }

    /// Take the pending mappings, encoded as an extra block for the next sync message.
    ///
    /// The pending list is empty afterwards, also if encoding fails.
    pub fn take_extra_block(&mut self) -> Result<Bytes, EncodeError> {
        let pending = mem::take(&mut self.pending);
        let list = MappingList {
            producer: pending.owner.unwrap_or_default(),
            pairs: pending.pairs,
        };
        self.stats.extra_blocks_sent += 1;
        trace!(producer = %list.producer, pairs = list.pairs.len(), "flush extra block");
        list.encode()
    }

    /// Look up a mapping in the local store.
    pub fn mapping(&self, producer: &Name, seq: SeqNo) -> Option<Name> {
        self.store.get_mapping(producer, seq)
    }

    /// Answer a mapping lookup of a peer from the local store.
    ///
    /// Only the first [`Config::mapping_chunk_len`] sequence numbers of `range` are looked at.
    /// Unknown sequence numbers are left out of the response.
    pub fn query_mappings(&self, producer: &Name, range: SeqRange) -> MappingList {
        let mut list = MappingList::new(producer.clone());
        if let Some(chunk) = range.chunks(self.config.mapping_chunk_len).next() {
            list.pairs = chunk
                .iter()
                .filter_map(|seq| Some((seq, self.store.get_mapping(producer, seq)?)))
                .collect();
        }
        list
    }

    /// The mapping store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The cache of delivered object ids.
    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    /// Counters of what the state did so far.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn on_missing_data(&mut self, batch: Vec<MissingRange>) {
        debug!(ranges = batch.len(), "missing data");
        for range in &batch {
            self.stats.missing_ranges += 1;
            if range.high < range.low {
                warn!(producer = %range.producer, range = %range.seqs(), "ignoring empty missing range");
                continue;
            }

            for sub in self.registry.producer_subscriptions() {
                if !sub.matches_producer(&range.producer) {
                    continue;
                }
                trace!(producer = %range.producer, range = %range.seqs(), sub = %sub.handle, "producer subscription matched");
                for seq in range.seqs().iter() {
                    self.stats.fetches += 1;
                    self.outbox.push_back(OutEvent::FetchData(FetchRequest {
                        producer: range.producer.clone(),
                        seq,
                        subscription: sub.handle,
                        speculative: false,
                    }));
                }
                if sub.prefetch() {
                    if let Some(seq) = range.high.checked_add(1) {
                        self.stats.fetches += 1;
                        self.stats.prefetches += 1;
                        self.outbox.push_back(OutEvent::FetchData(FetchRequest {
                            producer: range.producer.clone(),
                            seq,
                            subscription: sub.handle,
                            speculative: true,
                        }));
                    }
                }
            }

            if !self.registry.name_subscriptions().is_empty() {
                self.resolve_names(range);
            }
        }
        self.outbox.push_back(OutEvent::EmitUpdate(batch));
    }

    /// Resolve the names of a missing range and fetch what name subscriptions want.
    ///
    /// Local mappings are used up to the first unknown sequence number. Everything from there on
    /// is looked up on the network in chunks.
    fn resolve_names(&mut self, range: &MissingRange) {
        let mut residual = None;
        for seq in range.seqs().iter() {
            match self.store.get_mapping(&range.producer, seq) {
                Some(name) => self.fetch_name_matches(&range.producer, seq, &name),
                None => {
                    residual = Some(SeqRange::new(seq, range.high));
                    break;
                }
            }
        }
        let Some(residual) = residual else {
            return;
        };
        trace!(producer = %range.producer, %residual, "resolving mappings from network");
        for chunk in residual.chunks(self.config.mapping_chunk_len) {
            self.stats.mapping_lookups += 1;
            self.outbox
                .push_back(OutEvent::FetchMappings(MappingRequest {
                    producer: range.producer.clone(),
                    range: chunk,
                }));
        }
    }

    fn fetch_name_matches(&mut self, producer: &Name, seq: SeqNo, name: &Name) {
        for sub in self.registry.name_subscriptions() {
            if sub.matches_name(name) {
                trace!(%producer, seq, %name, sub = %sub.handle, "name subscription matched");
                self.stats.fetches += 1;
                self.outbox.push_back(OutEvent::FetchData(FetchRequest {
                    producer: producer.clone(),
                    seq,
                    subscription: sub.handle,
                    speculative: false,
                }));
            }
        }
    }

    fn on_mappings_fetched(&mut self, request: MappingRequest, list: Option<MappingList>) {
        let Some(list) = list else {
            self.stats.failed_mapping_lookups += 1;
            debug!(producer = %request.producer, range = %request.range, "mapping lookup failed");
            return;
        };
        let (pairs, ignored): (Vec<_>, Vec<_>) = list
            .pairs
            .into_iter()
            .partition(|(seq, _)| request.range.contains(*seq));
        if !ignored.is_empty() {
            debug!(producer = %request.producer, range = %request.range, ignored = ignored.len(), "mapping response outside of requested range");
        }
        trace!(producer = %request.producer, range = %request.range, pairs = pairs.len(), "mappings fetched");
        for (seq, name) in &pairs {
            self.learn_mapping(&request.producer, *seq, name.clone());
        }
        for sub in self.registry.name_subscriptions() {
            for (seq, name) in &pairs {
                if sub.matches_name(name) {
                    self.stats.fetches += 1;
                    self.outbox.push_back(OutEvent::FetchData(FetchRequest {
                        producer: request.producer.clone(),
                        seq: *seq,
                        subscription: sub.handle,
                        speculative: false,
                    }));
                }
            }
        }
    }

    fn on_data_fetched(&mut self, request: FetchRequest, object: Option<SyncObject>) {
        let FetchRequest {
            producer,
            seq,
            subscription,
            speculative,
        } = request;
        let Some(object) = object else {
            self.stats.failed_fetches += 1;
            if speculative {
                trace!(%producer, seq, "prefetch found nothing");
            } else {
                debug!(%producer, seq, "fetch failed");
            }
            return;
        };
        if self.registry.get(subscription).is_none() {
            self.stats.orphaned += 1;
            trace!(%producer, seq, sub = %subscription, "subscription is gone, dropping object");
            return;
        }

        let id = ObjectId::new(&producer, seq);
        if !self.dedup.insert(id) {
            self.stats.duplicates += 1;
            trace!(%producer, seq, id = %id.fmt_short(), "duplicate, not delivering");
            return;
        }

        let data = match object.decapsulate() {
            Ok(Some(data)) => data,
            Ok(None) => {
                self.stats.not_encapsulated += 1;
                debug!(%producer, seq, "fetched object is not encapsulated, not delivering");
                return;
            }
            Err(err) => {
                self.stats.malformed_objects += 1;
                warn!(%producer, seq, "failed to decode fetched object: {err}");
                return;
            }
        };

        if self.store.get_mapping(&producer, seq).is_none() {
            self.learn_mapping(&producer, seq, data.name.clone());
        }

        self.stats.delivered += 1;
        let delivery = Delivery {
            subscription,
            packet: SubscriptionPacket {
                data,
                producer,
                seq,
            },
        };
        if self.config.validate_encapsulated {
            self.outbox.push_back(OutEvent::Validate(delivery));
        } else {
            self.outbox.push_back(OutEvent::Deliver(delivery));
        }
    }

    fn on_extra_block(&mut self, block: &[u8]) {
        let list = match MappingList::decode(block) {
            Ok(list) => list,
            Err(err) => {
                self.stats.malformed_extra_blocks += 1;
                debug!("ignoring malformed extra block: {err}");
                return;
            }
        };
        self.stats.extra_blocks_received += 1;
        trace!(producer = %list.producer, pairs = list.pairs.len(), "received extra block");
        for (seq, name) in list.pairs {
            self.learn_mapping(&list.producer, seq, name);
        }
    }

    fn learn_mapping(&mut self, producer: &Name, seq: SeqNo, name: Name) {
        if self.store.insert_mapping(producer, seq, name.clone()) == InsertOutcome::Conflict {
            self.stats.mapping_conflicts += 1;
            warn!(%producer, seq, %name, "conflicting mapping, keeping the recorded one");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn state() -> State {
        State::new("/me".into(), Config::default())
    }

    fn object(name: &str) -> SyncObject {
        SyncObject::encapsulate(&Data::new(name.into(), &b"payload"[..])).unwrap()
    }

    fn fetch(producer: &str, seq: SeqNo, sub: SubscriptionHandle, speculative: bool) -> OutEvent {
        OutEvent::FetchData(FetchRequest {
            producer: producer.into(),
            seq,
            subscription: sub,
            speculative,
        })
    }

    fn lookup(producer: &str, low: SeqNo, high: SeqNo) -> OutEvent {
        OutEvent::FetchMappings(MappingRequest {
            producer: producer.into(),
            range: SeqRange::new(low, high),
        })
    }

    fn missing(producer: &str, low: SeqNo, high: SeqNo) -> Vec<MissingRange> {
        vec![MissingRange::new(producer.into(), low, high)]
    }

    #[test]
    fn producer_subscription_fetches_exact_range() {
        let mut state = state();
        let sub = state.subscribe_to_producer("/p".into(), false);
        let out: Vec<_> = state
            .handle(InEvent::MissingData(missing("/p", 5, 7)))
            .collect();
        assert_eq!(
            out,
            vec![
                fetch("/p", 5, sub, false),
                fetch("/p", 6, sub, false),
                fetch("/p", 7, sub, false),
                OutEvent::EmitUpdate(missing("/p", 5, 7)),
            ]
        );
    }

    #[test]
    fn producer_subscription_prefetches_next() {
        let mut state = state();
        let sub = state.subscribe_to_producer("/p".into(), true);
        let out: Vec<_> = state
            .handle(InEvent::MissingData(missing("/p", 5, 7)))
            .collect();
        assert_eq!(out.len(), 5);
        assert_eq!(out[3], fetch("/p", 8, sub, true));
        assert_eq!(state.stats().prefetches, 1);
    }

    #[test]
    fn update_is_emitted_without_subscriptions() {
        let mut state = state();
        state.subscribe_to_producer("/other".into(), true);
        let batch = vec![
            MissingRange::new("/p".into(), 1, 2),
            MissingRange::new("/q".into(), 4, 4),
        ];
        let out: Vec<_> = state.handle(InEvent::MissingData(batch.clone())).collect();
        assert_eq!(out, vec![OutEvent::EmitUpdate(batch)]);
    }

    #[test]
    fn name_subscription_resolves_locally() {
        let mut state = state();
        let sub = state.subscribe_to_prefix("/a".into());
        state.record_publish(&"/p".into(), 5, &"/a/b".into());
        let out: Vec<_> = state
            .handle(InEvent::MissingData(missing("/p", 5, 5)))
            .collect();
        assert_eq!(
            out,
            vec![
                fetch("/p", 5, sub, false),
                OutEvent::EmitUpdate(missing("/p", 5, 5))
            ]
        );
    }

    #[test]
    fn name_subscription_resolves_via_network() {
        let mut state = state();
        let sub = state.subscribe_to_prefix("/a".into());
        let out: Vec<_> = state
            .handle(InEvent::MissingData(missing("/p", 5, 15)))
            .collect();
        assert_eq!(
            out,
            vec![lookup("/p", 5, 15), OutEvent::EmitUpdate(missing("/p", 5, 15))]
        );

        let request = MappingRequest {
            producer: "/p".into(),
            range: SeqRange::new(5, 15),
        };
        let list = MappingList {
            producer: "/p".into(),
            pairs: vec![(5, "/a/b".into()), (6, "/c/d".into())],
        };
        let out: Vec<_> = state
            .handle(InEvent::MappingsFetched(request, Some(list)))
            .collect();
        assert_eq!(out, vec![fetch("/p", 5, sub, false)]);
        // learned mappings are kept
        assert_eq!(state.mapping(&"/p".into(), 6), Some("/c/d".into()));
    }

    #[test]
    fn local_resolution_stops_at_first_unknown() {
        let mut state = state();
        let sub = state.subscribe_to_prefix("/a".into());
        state.record_publish(&"/p".into(), 1, &"/a/1".into());
        state.record_publish(&"/p".into(), 2, &"/x/2".into());
        // 3 is unknown, 4 is known but past the gap
        state.record_publish(&"/p".into(), 4, &"/a/4".into());
        let out: Vec<_> = state
            .handle(InEvent::MissingData(missing("/p", 1, 30)))
            .collect();
        assert_eq!(
            out,
            vec![
                fetch("/p", 1, sub, false),
                lookup("/p", 3, 13),
                lookup("/p", 14, 24),
                lookup("/p", 25, 30),
                OutEvent::EmitUpdate(missing("/p", 1, 30)),
            ]
        );
    }

    #[test]
    fn mapping_responses_are_limited_to_requested_range() {
        let mut state = state();
        state.subscribe_to_prefix("/a".into());
        let request = MappingRequest {
            producer: "/p".into(),
            range: SeqRange::new(1, 1),
        };
        let list = MappingList {
            producer: "/p".into(),
            pairs: vec![(7, "/a/7".into())],
        };
        let out: Vec<_> = state
            .handle(InEvent::MappingsFetched(request, Some(list)))
            .collect();
        assert!(out.is_empty());
        assert_eq!(state.mapping(&"/p".into(), 7), None);
    }

    #[test]
    fn delivers_at_most_once() {
        let mut state = state();
        let by_producer = state.subscribe_to_producer("/p".into(), false);
        let by_name = state.subscribe_to_prefix("/a".into());
        state.record_publish(&"/p".into(), 1, &"/a/1".into());
        let out: Vec<_> = state
            .handle(InEvent::MissingData(missing("/p", 1, 1)))
            .collect();
        assert_eq!(out.len(), 3);

        let completion = |sub| {
            InEvent::DataFetched(
                FetchRequest {
                    producer: "/p".into(),
                    seq: 1,
                    subscription: sub,
                    speculative: false,
                },
                Some(object("/a/1")),
            )
        };
        let out: Vec<_> = state.handle(completion(by_name)).collect();
        let [OutEvent::Deliver(delivery)] = out.as_slice() else {
            panic!("expected a delivery, got {out:?}");
        };
        assert_eq!(delivery.subscription, by_name);
        assert_eq!(delivery.packet.seq, 1);
        assert_eq!(delivery.packet.data.name, "/a/1".into());

        assert_eq!(state.handle(completion(by_producer)).count(), 0);
        assert_eq!(state.handle(completion(by_name)).count(), 0);
        assert_eq!(state.stats().duplicates, 2);
        assert_eq!(state.stats().delivered, 1);
    }

    #[test]
    fn validation_is_requested_when_configured() {
        let config = Config {
            validate_encapsulated: true,
            ..Default::default()
        };
        let mut state = State::new("/me".into(), config);
        let sub = state.subscribe_to_producer("/p".into(), false);
        let request = FetchRequest {
            producer: "/p".into(),
            seq: 3,
            subscription: sub,
            speculative: false,
        };
        let out: Vec<_> = state
            .handle(InEvent::DataFetched(request, Some(object("/a/3"))))
            .collect();
        assert!(matches!(out.as_slice(), [OutEvent::Validate(_)]));
    }

    #[test]
    fn delivery_backfills_mapping() {
        let mut state = state();
        let sub = state.subscribe_to_producer("/p".into(), false);
        let request = FetchRequest {
            producer: "/p".into(),
            seq: 9,
            subscription: sub,
            speculative: false,
        };
        assert_eq!(state.handle(InEvent::DataFetched(request, Some(object("/x/9")))).count(), 1);
        assert_eq!(state.mapping(&"/p".into(), 9), Some("/x/9".into()));
    }

    #[test]
    fn completion_for_removed_subscription_is_noop() {
        let mut state = state();
        let sub = state.subscribe_to_producer("/p".into(), false);
        assert!(state.unsubscribe(sub));
        let request = FetchRequest {
            producer: "/p".into(),
            seq: 1,
            subscription: sub,
            speculative: false,
        };
        let out: Vec<_> = state
            .handle(InEvent::DataFetched(request, Some(object("/a"))))
            .collect();
        assert!(out.is_empty());
        assert!(state.dedup().is_empty());
        assert_eq!(state.stats().orphaned, 1);
    }

    #[test]
    fn non_encapsulated_objects_are_not_delivered() {
        let mut state = state();
        let sub = state.subscribe_to_producer("/p".into(), false);
        let request = FetchRequest {
            producer: "/p".into(),
            seq: 1,
            subscription: sub,
            speculative: false,
        };
        let out: Vec<_> = state
            .handle(InEvent::DataFetched(
                request.clone(),
                Some(SyncObject::blob(&b"raw"[..])),
            ))
            .collect();
        assert!(out.is_empty());
        assert_eq!(state.stats().not_encapsulated, 1);

        let out: Vec<_> = state.handle(InEvent::DataFetched(request, None)).collect();
        assert!(out.is_empty());
        assert_eq!(state.stats().failed_fetches, 1);
    }

    #[test]
    fn extra_block_flushes_once() {
        let mut state = state();
        let me: Name = "/me".into();
        state.record_publish(&me, 1, &"/a/1".into());
        state.record_publish(&me, 2, &"/a/2".into());

        let block = state.take_extra_block().unwrap();
        let list = MappingList::decode(&block).unwrap();
        assert_eq!(list.producer, me);
        assert_eq!(list.pairs, vec![(1, "/a/1".into()), (2, "/a/2".into())]);

        let list = MappingList::decode(&state.take_extra_block().unwrap()).unwrap();
        assert!(list.is_empty());

        state.record_publish(&me, 3, &"/a/3".into());
        let list = MappingList::decode(&state.take_extra_block().unwrap()).unwrap();
        assert_eq!(list.pairs, vec![(3, "/a/3".into())]);
    }

    /// Known edge case: the pending list has a single owner. A publication under another
    /// producer identity is stored locally but silently left out of the piggyback until the
    /// list is flushed.
    #[test]
    fn pending_mappings_have_a_single_owner() {
        let mut state = state();
        let me: Name = "/me".into();
        let alias: Name = "/alias".into();
        state.record_publish(&me, 1, &"/a/1".into());
        state.record_publish(&alias, 1, &"/b/1".into());

        let list = MappingList::decode(&state.take_extra_block().unwrap()).unwrap();
        assert_eq!(list.producer, me);
        assert_eq!(list.pairs, vec![(1, "/a/1".into())]);
        assert_eq!(state.mapping(&alias, 1), Some("/b/1".into()));

        // after a flush the other identity can take over
        state.record_publish(&alias, 2, &"/b/2".into());
        let list = MappingList::decode(&state.take_extra_block().unwrap()).unwrap();
        assert_eq!(list.producer, alias);
    }

    #[test]
    fn extra_blocks_feed_the_mapping_store() {
        let mut sender = State::new("/p".into(), Config::default());
        sender.record_publish(&"/p".into(), 1, &"/a/1".into());
        let block = sender.take_extra_block().unwrap();

        let mut state = state();
        assert_eq!(state.handle(InEvent::RecvExtraBlock(block)).count(), 0);
        assert_eq!(state.mapping(&"/p".into(), 1), Some("/a/1".into()));

        let out: Vec<_> = state
            .handle(InEvent::RecvExtraBlock(Bytes::from_static(&[0xff, 0xff])))
            .collect();
        assert!(out.is_empty());
        assert_eq!(state.stats().malformed_extra_blocks, 1);
    }

    #[test]
    fn conflicting_mappings_keep_the_first() {
        let mut state = state();
        state.record_publish(&"/p".into(), 1, &"/a/1".into());
        let mut sender = State::new("/p".into(), Config::default());
        sender.record_publish(&"/p".into(), 1, &"/evil".into());
        let block = sender.take_extra_block().unwrap();
        assert_eq!(state.handle(InEvent::RecvExtraBlock(block)).count(), 0);
        assert_eq!(state.mapping(&"/p".into(), 1), Some("/a/1".into()));
        assert_eq!(state.stats().mapping_conflicts, 1);
    }

    #[test]
    fn query_mappings_is_bounded() {
        let mut state = state();
        let me: Name = "/me".into();
        for seq in 1..=20 {
            if seq != 3 {
                state.record_publish(&me, seq, &Name::from("/a").join(seq.to_string()));
            }
        }
        let list = state.query_mappings(&me, SeqRange::new(1, 20));
        let seqs: Vec<_> = list.pairs.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![1, 2, 4, 5, 6, 7, 8, 9, 10, 11]);
        assert!(state.query_mappings(&"/other".into(), SeqRange::new(1, 5)).is_empty());
    }

    #[test]
    fn config_defaults_from_serde() {
        let config: Config = postcard::from_bytes(&postcard::to_stdvec(&Config::default()).unwrap()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.mapping_chunk_len, 11);
        assert_eq!(config.max_object_ids, 32768);
    }
}
