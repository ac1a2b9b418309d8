//! An in-process sync engine
//!
//! [`MemoryNetwork`] simulates a sync group whose members live in the same process. It
//! allocates sequence numbers, stores published objects, attaches the publisher's extra block to
//! the simulated sync message and reports the new sequence numbers to all other members. Mapping
//! lookups are answered by the member that owns the producer.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use n0_future::future::Boxed as BoxFuture;
use tokio::sync::Notify;
use tracing::{Instrument, debug, error_span, trace, warn};

use crate::{
    net::{ClosedSnafu, EngineError, NotFoundSnafu, Options, PubSub, SyncEngine, TimeoutSnafu},
    proto::{MappingList, MissingRange, Name, Retries, SeqNo, SeqRange, SyncObject},
};

/// How long a single fetch attempt waits for the object to be published.
pub const FETCH_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(50);

/// A sync group of in-process members.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Inner>>,
    published: Arc<Notify>,
}

#[derive(Debug)]
struct Inner {
    members: Vec<Member>,
    objects: HashMap<(Name, SeqNo), SyncObject>,
    /// Latest sequence number per producer.
    latest: HashMap<Name, SeqNo>,
    /// Member that publishes as a producer.
    owners: HashMap<Name, Name>,
    /// Latest sequence number reported to a member, keyed by `(member, producer)`.
    reported: HashMap<(Name, Name), SeqNo>,
    piggyback: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            objects: HashMap::new(),
            latest: HashMap::new(),
            owners: HashMap::new(),
            reported: HashMap::new(),
            piggyback: true,
        }
    }
}

#[derive(Debug)]
struct Member {
    node: Name,
    pubsub: PubSub,
}

impl MemoryNetwork {
    /// Create an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member and spawn its [`PubSub`].
    pub fn join(
        &self,
        options: Options,
        on_update: impl Fn(&[MissingRange]) + Send + Sync + 'static,
    ) -> PubSub {
        let node = options.node.clone();
        let engine = MemoryEngine {
            node: node.clone(),
            network: self.clone(),
        };
        let pubsub = PubSub::spawn(Arc::new(engine), options, on_update);
        let mut inner = self.inner.lock().expect("poisoned");
        inner.members.retain(|member| member.node != node);
        inner.members.push(Member {
            node,
            pubsub: pubsub.clone(),
        });
        pubsub
    }

    /// Remove a member. It will no longer receive updates.
    ///
    /// Returns `false` if there was no such member.
    pub fn leave(&self, node: &Name) -> bool {
        let mut inner = self.inner.lock().expect("poisoned");
        let len = inner.members.len();
        inner.members.retain(|member| &member.node != node);
        inner.members.len() != len
    }

    /// Whether extra blocks reach the other members.
    ///
    /// If disabled, extra blocks are still taken from the publisher but are lost in transit.
    pub fn set_piggyback(&self, enabled: bool) {
        self.inner.lock().expect("poisoned").piggyback = enabled;
    }

    /// The object stored at `seq` of `producer`.
    pub fn object(&self, producer: &Name, seq: SeqNo) -> Option<SyncObject> {
        let inner = self.inner.lock().expect("poisoned");
        inner.objects.get(&(producer.clone(), seq)).cloned()
    }

    /// The latest sequence number of `producer`.
    pub fn latest(&self, producer: &Name) -> Option<SeqNo> {
        let inner = self.inner.lock().expect("poisoned");
        inner.latest.get(producer).copied()
    }

    /// Store an object without going through a member's [`PubSub`] and announce it.
    ///
    /// No extra block is sent along.
    pub fn insert(&self, producer: Name, object: SyncObject) -> SeqNo {
        let seq = self.store(None, producer.clone(), object);
        let network = self.clone();
        tokio::spawn(async move { network.announce(None, producer, seq).await });
        seq
    }

    fn store(&self, owner: Option<&Name>, producer: Name, object: SyncObject) -> SeqNo {
        let mut inner = self.inner.lock().expect("poisoned");
        let latest = inner.latest.entry(producer.clone()).or_default();
        *latest += 1;
        let seq = *latest;
        if let Some(owner) = owner {
            inner.owners.insert(producer.clone(), owner.clone());
        }
        inner.objects.insert((producer, seq), object);
        drop(inner);
        self.published.notify_waiters();
        seq
    }

    /// Send the simulated sync message of `from` announcing `seq` of `producer`.
    async fn announce(&self, from: Option<Name>, producer: Name, seq: SeqNo) {
        let (sender, piggyback) = {
            let inner = self.inner.lock().expect("poisoned");
            let sender = from.as_ref().and_then(|from| {
                inner
                    .members
                    .iter()
                    .find(|member| &member.node == from)
                    .map(|member| member.pubsub.clone())
            });
            (sender, inner.piggyback)
        };
        let block = match sender {
            Some(sender) => match sender.extra_block().await {
                Ok(block) => Some(block),
                Err(err) => {
                    warn!("failed to get extra block: {err}");
                    None
                }
            },
            None => None,
        };

        let deliveries: Vec<_> = {
            let mut inner = self.inner.lock().expect("poisoned");
            let peers: Vec<_> = inner
                .members
                .iter()
                .filter(|member| Some(&member.node) != from.as_ref())
                .map(|member| (member.node.clone(), member.pubsub.clone()))
                .collect();
            peers
                .into_iter()
                .filter_map(|(node, pubsub)| {
                    let reported = inner
                        .reported
                        .entry((node, producer.clone()))
                        .or_default();
                    if *reported >= seq {
                        return None;
                    }
                    let range = MissingRange::new(producer.clone(), *reported + 1, seq);
                    *reported = seq;
                    Some((pubsub, range))
                })
                .collect()
        };

        for (pubsub, range) in deliveries {
            trace!(to = %pubsub.me(), ?range, "sync message");
            if let Some(block) = &block {
                if piggyback {
                    pubsub.recv_extra_block(block.clone()).await.ok();
                }
            }
            pubsub.on_missing_data(vec![range]).await.ok();
        }
    }

    fn owner(&self, producer: &Name) -> Option<PubSub> {
        let inner = self.inner.lock().expect("poisoned");
        let owner = inner.owners.get(producer)?;
        inner
            .members
            .iter()
            .find(|member| &member.node == owner)
            .map(|member| member.pubsub.clone())
    }
}

/// The [`SyncEngine`] of a single member of a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    node: Name,
    network: MemoryNetwork,
}

impl SyncEngine for MemoryEngine {
    fn publish(
        &self,
        object: SyncObject,
        _freshness: Option<Duration>,
        producer: Name,
    ) -> BoxFuture<Result<SeqNo, EngineError>> {
        let network = self.network.clone();
        let node = self.node.clone();
        Box::pin(async move {
            let seq = network.store(Some(&node), producer.clone(), object);
            debug!(%producer, seq, "stored object");
            // The announcement needs the publisher's extra block, which is only available once
            // this future has completed.
            let span = error_span!("announce", %producer, seq);
            tokio::spawn(
                async move { network.announce(Some(node), producer, seq).await }.instrument(span),
            );
            Ok(seq)
        })
    }

    fn fetch_data(
        &self,
        producer: Name,
        seq: SeqNo,
        retries: Retries,
    ) -> BoxFuture<Result<SyncObject, EngineError>> {
        let network = self.network.clone();
        Box::pin(async move {
            let mut attempts = 0u32;
            loop {
                attempts = attempts.saturating_add(1);
                let published = network.published.notified();
                if let Some(object) = network.object(&producer, seq) {
                    return Ok(object);
                }
                if let Retries::Limited(max) = retries {
                    if attempts > max {
                        return TimeoutSnafu { attempts }.fail();
                    }
                }
                tokio::time::timeout(FETCH_ATTEMPT_TIMEOUT, published)
                    .await
                    .ok();
            }
        })
    }

    fn fetch_name_mapping(
        &self,
        producer: Name,
        range: SeqRange,
        _retries: Retries,
    ) -> BoxFuture<Result<MappingList, EngineError>> {
        let owner = self.network.owner(&producer);
        Box::pin(async move {
            let Some(owner) = owner else {
                return NotFoundSnafu {
                    producer,
                    seq: range.low,
                }
                .fail();
            };
            owner
                .query_mappings(producer, range)
                .await
                .map_err(|_| ClosedSnafu.build())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{net::PublishOptions, proto::Data};

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn fetch_returns_stored_or_times_out() {
        let network = MemoryNetwork::new();
        let engine = MemoryEngine {
            node: "/a".into(),
            network: network.clone(),
        };
        let fetch = engine.fetch_data("/p".into(), 1, Retries::Unlimited);
        let object = SyncObject::blob(&b"x"[..]);
        network.store(None, "/p".into(), object.clone());
        assert_eq!(fetch.await.unwrap(), object);

        let missing = engine
            .fetch_data("/p".into(), 2, Retries::Limited(1))
            .await;
        assert!(matches!(missing, Err(EngineError::Timeout { attempts: 2, .. })));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn members_are_told_about_new_data() {
        let network = MemoryNetwork::new();
        let updates = Arc::new(Mutex::new(Vec::new()));
        let alice = network.join(Options::new("/alice".into()), |_| {});
        let _bob = network.join(Options::new("/bob".into()), {
            let updates = updates.clone();
            move |batch: &[MissingRange]| updates.lock().unwrap().extend_from_slice(batch)
        });

        let seq = alice
            .publish("/chat/1".into(), &b"hi"[..], PublishOptions::default())
            .await
            .unwrap();
        assert_eq!(seq, 1);
        assert_eq!(network.latest(&"/alice".into()), Some(1));
        let stored = network.object(&"/alice".into(), 1).unwrap();
        assert_eq!(
            stored.decapsulate().unwrap().map(|data: Data| data.name),
            Some("/chat/1".into())
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while updates.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            updates.lock().unwrap().clone(),
            vec![MissingRange::new("/alice".into(), 1, 1)]
        );
    }
}
