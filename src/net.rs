//! Runtime for the pub/sub protocol on top of a [`SyncEngine`]

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use n0_future::{future::Boxed as BoxFuture, task::AbortOnDropHandle};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
};
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{
    metrics::Metrics,
    proto::{
        self, Data, Delivery, EncodeError, FetchRequest, InEvent, MappingList, MappingRequest,
        MissingRange, Name, OutEvent, Retries, SeqNo, SeqRange, Stats, SubscriptionHandle,
        SubscriptionPacket, SyncObject,
    },
    security::{SecurityOptions, ValidationError},
};

/// Channel capacity for the ToActor message queue (single)
const TO_ACTOR_CAP: usize = 64;

/// The state vector sync engine the pub/sub layer runs on.
///
/// The engine allocates sequence numbers, tells its peers about them and fetches objects.
/// Notifications in the other direction are given to the [`PubSub`] handle by the engine's
/// glue code: [`PubSub::on_missing_data`] when peers advanced, [`PubSub::extra_block`] right
/// before sending a sync message and [`PubSub::recv_extra_block`] when a received sync message
/// carried an extra block.
pub trait SyncEngine: fmt::Debug + Send + Sync + 'static {
    /// Store `object` as the next sequence number of `producer` and announce it to peers.
    ///
    /// The returned future must not wait on the [`PubSub`] that called it, because the
    /// pub/sub actor waits for it to complete.
    fn publish(
        &self,
        object: SyncObject,
        freshness: Option<Duration>,
        producer: Name,
    ) -> BoxFuture<Result<SeqNo, EngineError>>;

    /// Fetch the object at `seq` of `producer`.
    fn fetch_data(
        &self,
        producer: Name,
        seq: SeqNo,
        retries: Retries,
    ) -> BoxFuture<Result<SyncObject, EngineError>>;

    /// Ask the network for the names published in `range` of `producer`.
    fn fetch_name_mapping(
        &self,
        producer: Name,
        range: SeqRange,
        retries: Retries,
    ) -> BoxFuture<Result<MappingList, EngineError>>;
}

/// Errors returned by [`SyncEngine`] implementations.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum EngineError {
    #[snafu(display("sync engine is closed"))]
    Closed {},
    #[snafu(display("no object at {producer}/{seq}"))]
    NotFound { producer: Name, seq: SeqNo },
    #[snafu(display("timed out after {attempts} attempts"))]
    Timeout { attempts: u32 },
    #[snafu(display("publish rejected: {reason}"))]
    Rejected { reason: String },
}

/// Errors returned from the [`PubSub`] handle.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum PubSubError {
    #[snafu(display("pubsub actor closed"))]
    ActorClosed {},
    #[snafu(display("sync engine failed"))]
    Engine { source: EngineError },
    #[snafu(display("failed to encode"))]
    Encode { source: EncodeError },
}

/// Options for [`PubSub::spawn`].
#[derive(Debug, Clone)]
pub struct Options {
    /// The producer identity of this node.
    pub node: Name,
    /// Protocol configuration.
    pub config: proto::Config,
    /// Signing and validation.
    pub security: SecurityOptions,
}

impl Options {
    /// Default options for the node publishing as `node`.
    pub fn new(node: Name) -> Self {
        Self {
            node,
            config: Default::default(),
            security: Default::default(),
        }
    }
}

/// Options for [`PubSub::publish`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Publish as this producer instead of the node's own identity.
    pub producer: Option<Name>,
    /// Freshness period of the object. `None` means it never becomes stale.
    pub freshness: Option<Duration>,
}

impl PublishOptions {
    /// Set the producer identity to publish as.
    pub fn producer(mut self, producer: Name) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Set the freshness period.
    pub fn freshness(mut self, freshness: Duration) -> Self {
        self.freshness = Some(freshness);
        self
    }
}

type SubscriptionCallback = Box<dyn Fn(SubscriptionPacket) + Send + Sync + 'static>;
type UpdateCallback = Box<dyn Fn(&[MissingRange]) + Send + Sync + 'static>;

/// Publish objects and subscribe to producers or name prefixes.
///
/// This is a cheaply cloneable handle to an actor that owns the protocol state. The actor stops
/// when the last handle is dropped.
#[derive(Debug, Clone)]
pub struct PubSub {
    me: Name,
    to_actor_tx: mpsc::Sender<ToActor>,
    metrics: Arc<Metrics>,
    _actor_handle: Arc<AbortOnDropHandle<()>>,
}

impl PubSub {
    /// Spawn the pub/sub actor on the current tokio runtime.
    ///
    /// `on_update` is called once for every batch of missing ranges the engine reports,
    /// whether or not any subscription matched.
    pub fn spawn(
        engine: Arc<dyn SyncEngine>,
        options: Options,
        on_update: impl Fn(&[MissingRange]) + Send + Sync + 'static,
    ) -> Self {
        let Options {
            node,
            mut config,
            security,
        } = options;
        config.validate_encapsulated = security.encapsulated_validator.is_some();
        let state = proto::State::new(node.clone(), config);
        let metrics = Arc::new(Metrics::default());
        let (to_actor_tx, to_actor_rx) = mpsc::channel(TO_ACTOR_CAP);

        let actor = Actor {
            state,
            engine,
            security,
            to_actor_rx,
            callbacks: Default::default(),
            on_update: Box::new(on_update),
            fetch_tasks: JoinSet::new(),
            mapping_tasks: JoinSet::new(),
            validation_tasks: JoinSet::new(),
            metrics: metrics.clone(),
        };
        let actor_handle = tokio::spawn(actor.run().instrument(error_span!("pubsub", me = %node)));
        Self {
            me: node,
            to_actor_tx,
            metrics,
            _actor_handle: Arc::new(AbortOnDropHandle::new(actor_handle)),
        }
    }

    /// The producer identity of this node.
    pub fn me(&self) -> &Name {
        &self.me
    }

    /// Metrics of this instance.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Publish `payload` under `name`.
    ///
    /// The object is signed with the configured signer. Returns the sequence number the
    /// engine allocated for it.
    pub async fn publish(
        &self,
        name: Name,
        payload: impl Into<Bytes>,
        opts: PublishOptions,
    ) -> Result<SeqNo, PubSubError> {
        let data = Data::new(name, payload).with_freshness(opts.freshness);
        self.rpc(|reply| ToActor::Publish {
            data,
            sign: true,
            producer: opts.producer,
            reply,
        })
        .await?
    }

    /// Publish an already constructed object unchanged.
    ///
    /// The object is not signed again. Its own freshness period is passed to the engine.
    pub async fn publish_encoded(
        &self,
        data: Data,
        producer: Option<Name>,
    ) -> Result<SeqNo, PubSubError> {
        self.rpc(|reply| ToActor::Publish {
            data,
            sign: false,
            producer,
            reply,
        })
        .await?
    }

    /// Subscribe to all objects of producers matching `prefix`.
    ///
    /// With `prefetch`, the sequence number after every reported range is fetched as well, so
    /// the next object may be delivered before its producer's update arrives.
    pub async fn subscribe_to_producer(
        &self,
        prefix: Name,
        prefetch: bool,
        callback: impl Fn(SubscriptionPacket) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle, PubSubError> {
        self.rpc(|reply| ToActor::Subscribe {
            scope: Scope::Producer { prefix, prefetch },
            callback: Box::new(callback),
            reply,
        })
        .await
    }

    /// Subscribe to all objects whose name matches `prefix`.
    pub async fn subscribe_to_prefix(
        &self,
        prefix: Name,
        callback: impl Fn(SubscriptionPacket) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle, PubSubError> {
        self.rpc(|reply| ToActor::Subscribe {
            scope: Scope::Name { prefix },
            callback: Box::new(callback),
            reply,
        })
        .await
    }

    /// Remove a subscription. Returns `false` if the handle was unknown.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<bool, PubSubError> {
        self.rpc(|reply| ToActor::Unsubscribe { handle, reply }).await
    }

    /// Report newly available data. Called by the engine glue.
    pub async fn on_missing_data(&self, batch: Vec<MissingRange>) -> Result<(), PubSubError> {
        self.send(ToActor::InEvent(InEvent::MissingData(batch))).await
    }

    /// Get the extra block to attach to the next sync message. Called by the engine glue.
    ///
    /// Every recorded mapping is handed out once.
    pub async fn extra_block(&self) -> Result<Bytes, PubSubError> {
        self.rpc(|reply| ToActor::ExtraBlock { reply }).await?
    }

    /// Process the extra block of a received sync message. Called by the engine glue.
    ///
    /// Malformed blocks are ignored.
    pub async fn recv_extra_block(&self, block: Bytes) -> Result<(), PubSubError> {
        self.send(ToActor::InEvent(InEvent::RecvExtraBlock(block)))
            .await
    }

    /// Answer a peer's mapping lookup from the local mapping store.
    pub async fn query_mappings(
        &self,
        producer: Name,
        range: SeqRange,
    ) -> Result<MappingList, PubSubError> {
        self.rpc(|reply| ToActor::QueryMappings {
            producer,
            range,
            reply,
        })
        .await
    }

    /// Look up a mapping in the local mapping store.
    pub async fn mapping(&self, producer: Name, seq: SeqNo) -> Result<Option<Name>, PubSubError> {
        self.rpc(|reply| ToActor::Mapping {
            producer,
            seq,
            reply,
        })
        .await
    }

    /// Counters of the protocol state.
    pub async fn stats(&self) -> Result<Stats, PubSubError> {
        self.rpc(|reply| ToActor::Stats { reply }).await
    }

    async fn send(&self, msg: ToActor) -> Result<(), PubSubError> {
        self.to_actor_tx
            .send(msg)
            .await
            .map_err(|_| ActorClosedSnafu.build())
    }

    async fn rpc<T>(
        &self,
        msg: impl FnOnce(oneshot::Sender<T>) -> ToActor,
    ) -> Result<T, PubSubError> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(msg(reply)).await?;
        reply_rx.await.map_err(|_| ActorClosedSnafu.build())
    }
}

#[derive(Debug)]
enum Scope {
    Producer { prefix: Name, prefetch: bool },
    Name { prefix: Name },
}

/// Input messages for the pub/sub [`Actor`].
#[derive(derive_more::Debug)]
enum ToActor {
    Publish {
        data: Data,
        sign: bool,
        producer: Option<Name>,
        reply: oneshot::Sender<Result<SeqNo, PubSubError>>,
    },
    Subscribe {
        scope: Scope,
        #[debug(skip)]
        callback: SubscriptionCallback,
        reply: oneshot::Sender<SubscriptionHandle>,
    },
    Unsubscribe {
        handle: SubscriptionHandle,
        reply: oneshot::Sender<bool>,
    },
    InEvent(InEvent),
    ExtraBlock {
        reply: oneshot::Sender<Result<Bytes, PubSubError>>,
    },
    QueryMappings {
        producer: Name,
        range: SeqRange,
        reply: oneshot::Sender<MappingList>,
    },
    Mapping {
        producer: Name,
        seq: SeqNo,
        reply: oneshot::Sender<Option<Name>>,
    },
    Stats {
        reply: oneshot::Sender<Stats>,
    },
}

/// Owns the protocol state and performs the IO it asks for.
struct Actor {
    state: proto::State,
    engine: Arc<dyn SyncEngine>,
    security: SecurityOptions,
    to_actor_rx: mpsc::Receiver<ToActor>,
    /// Subscription callbacks, removed on unsubscribe.
    callbacks: HashMap<SubscriptionHandle, SubscriptionCallback>,
    on_update: UpdateCallback,
    /// Data fetches in flight. Never cancelled.
    fetch_tasks: JoinSet<(FetchRequest, Result<SyncObject, EngineError>)>,
    /// Mapping lookups in flight.
    mapping_tasks: JoinSet<(MappingRequest, Result<MappingList, EngineError>)>,
    /// Validations in flight.
    validation_tasks: JoinSet<(Delivery, Result<(), ValidationError>)>,
    metrics: Arc<Metrics>,
}

impl Actor {
    async fn run(mut self) {
        let mut i = 0;
        loop {
            i += 1;
            trace!(?i, "tick");
            self.metrics.actor_tick_main.inc();
            tokio::select! {
                biased;
                msg = self.to_actor_rx.recv() => {
                    match msg {
                        Some(msg) => self.handle_to_actor_msg(msg).await,
                        None => {
                            debug!("all pubsub handles dropped, stop pubsub actor");
                            break;
                        }
                    }
                }
                Some(res) = self.fetch_tasks.join_next(), if !self.fetch_tasks.is_empty() => {
                    match res {
                        Ok((request, res)) => {
                            let object = match res {
                                Ok(object) => Some(object),
                                Err(err) => {
                                    if !request.speculative {
                                        debug!(producer = %request.producer, seq = request.seq, "fetch failed: {err}");
                                    }
                                    self.metrics.fetches_failed.inc();
                                    None
                                }
                            };
                            self.handle_in_event(InEvent::DataFetched(request, object));
                        }
                        Err(err) => warn!("fetch task panicked: {err:?}"),
                    }
                }
                Some(res) = self.mapping_tasks.join_next(), if !self.mapping_tasks.is_empty() => {
                    match res {
                        Ok((request, res)) => {
                            let list = match res {
                                Ok(list) => Some(list),
                                Err(err) => {
                                    debug!(producer = %request.producer, range = %request.range, "mapping lookup failed: {err}");
                                    self.metrics.mapping_lookups_failed.inc();
                                    None
                                }
                            };
                            self.handle_in_event(InEvent::MappingsFetched(request, list));
                        }
                        Err(err) => warn!("mapping task panicked: {err:?}"),
                    }
                }
                Some(res) = self.validation_tasks.join_next(), if !self.validation_tasks.is_empty() => {
                    match res {
                        Ok((delivery, Ok(()))) => self.deliver(delivery),
                        Ok((delivery, Err(err))) => {
                            debug!(producer = %delivery.packet.producer, seq = delivery.packet.seq, "validation failed: {err}");
                            self.metrics.validation_rejected.inc();
                        }
                        Err(err) => warn!("validation task panicked: {err:?}"),
                    }
                }
            }
        }
    }

    async fn handle_to_actor_msg(&mut self, msg: ToActor) {
        trace!("handle to_actor {msg:?}");
        match msg {
            ToActor::Publish {
                data,
                sign,
                producer,
                reply,
            } => {
                let res = self.publish(data, sign, producer).await;
                reply.send(res).ok();
            }
            ToActor::Subscribe {
                scope,
                callback,
                reply,
            } => {
                let handle = match scope {
                    Scope::Producer { prefix, prefetch } => {
                        debug!(%prefix, prefetch, "subscribe to producer");
                        self.state.subscribe_to_producer(prefix, prefetch)
                    }
                    Scope::Name { prefix } => {
                        debug!(%prefix, "subscribe to prefix");
                        self.state.subscribe_to_prefix(prefix)
                    }
                };
                self.callbacks.insert(handle, callback);
                reply.send(handle).ok();
            }
            ToActor::Unsubscribe { handle, reply } => {
                let removed = self.state.unsubscribe(handle);
                self.callbacks.remove(&handle);
                debug!(sub = %handle, removed, "unsubscribe");
                reply.send(removed).ok();
            }
            ToActor::InEvent(event) => self.handle_in_event(event),
            ToActor::ExtraBlock { reply } => {
                let res = self.state.take_extra_block().context(EncodeSnafu);
                if res.is_ok() {
                    self.metrics.extra_blocks_sent.inc();
                }
                reply.send(res).ok();
            }
            ToActor::QueryMappings {
                producer,
                range,
                reply,
            } => {
                reply.send(self.state.query_mappings(&producer, range)).ok();
            }
            ToActor::Mapping {
                producer,
                seq,
                reply,
            } => {
                reply.send(self.state.mapping(&producer, seq)).ok();
            }
            ToActor::Stats { reply } => {
                reply.send(self.state.stats().clone()).ok();
            }
        }
    }

    async fn publish(
        &mut self,
        mut data: Data,
        sign: bool,
        producer: Option<Name>,
    ) -> Result<SeqNo, PubSubError> {
        if sign {
            self.security.signer.sign(&mut data);
        }
        let producer = producer.unwrap_or_else(|| self.state.me().clone());
        let object = SyncObject::encapsulate(&data).context(EncodeSnafu)?;
        let seq = self
            .engine
            .publish(object, data.freshness, producer.clone())
            .await
            .context(EngineSnafu)?;
        self.state.record_publish(&producer, seq, &data.name);
        self.metrics.published.inc();
        debug!(%producer, seq, name = %data.name, "published");
        Ok(seq)
    }

    fn handle_in_event(&mut self, event: InEvent) {
        match &event {
            InEvent::MissingData(batch) => {
                debug!(?batch, "handle in_event");
                self.metrics.missing_ranges.inc_by(batch.len() as u64);
            }
            InEvent::RecvExtraBlock(_) => {
                trace!(?event, "handle in_event");
                self.metrics.extra_blocks_recv.inc();
            }
            _ => trace!(?event, "handle in_event"),
        }
        let before = self.state.stats().clone();
        let out: Vec<_> = self.state.handle(event).collect();
        let after = self.state.stats();
        self.metrics
            .duplicates
            .inc_by(after.duplicates - before.duplicates);
        self.metrics
            .extra_blocks_malformed
            .inc_by(after.malformed_extra_blocks - before.malformed_extra_blocks);

        for event in out {
            trace!("out_event {event:?}");
            match event {
                OutEvent::FetchData(request) => self.spawn_fetch(request),
                OutEvent::FetchMappings(request) => self.spawn_mapping_lookup(request),
                OutEvent::Validate(delivery) => self.spawn_validation(delivery),
                OutEvent::Deliver(delivery) => self.deliver(delivery),
                OutEvent::EmitUpdate(batch) => (self.on_update)(&batch),
            }
        }
    }

    fn spawn_fetch(&mut self, request: FetchRequest) {
        self.metrics.fetches.inc();
        if request.speculative {
            self.metrics.prefetches.inc();
        }
        let fut = self.engine.fetch_data(
            request.producer.clone(),
            request.seq,
            self.state.config().fetch_retries,
        );
        self.fetch_tasks.spawn(async move { (request, fut.await) });
    }

    fn spawn_mapping_lookup(&mut self, request: MappingRequest) {
        self.metrics.mapping_lookups.inc();
        let fut = self.engine.fetch_name_mapping(
            request.producer.clone(),
            request.range,
            self.state.config().fetch_retries,
        );
        self.mapping_tasks.spawn(async move { (request, fut.await) });
    }

    fn spawn_validation(&mut self, delivery: Delivery) {
        let Some(validator) = &self.security.encapsulated_validator else {
            // validation is only requested when a validator is configured
            self.deliver(delivery);
            return;
        };
        let fut = validator.validate(&delivery.packet.data);
        self.validation_tasks
            .spawn(async move { (delivery, fut.await) });
    }

    fn deliver(&mut self, delivery: Delivery) {
        let Some(callback) = self.callbacks.get(&delivery.subscription) else {
            trace!(sub = %delivery.subscription, "subscription is gone, not delivering");
            return;
        };
        trace!(
            sub = %delivery.subscription,
            producer = %delivery.packet.producer,
            seq = delivery.packet.seq,
            "deliver"
        );
        self.metrics.delivered.inc();
        callback(delivery.packet);
    }
}
