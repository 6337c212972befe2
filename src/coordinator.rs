//! Top-level `Coordinator`: wires the metadata tables, commit/abort
//! tracking, the proxy pool, and the merge engine behind the client- and
//! proxy-facing RPC surface described in spec.md §7.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, instrument};

use crate::commit::CommitCoordinator;
use crate::domain::model::{ClusterId, EcSchema, Operation, Stripe, StripeId};
use crate::domain::ports::{
    BlockPlacement, DecodePlan, DeleteBlockRequest, DeleteScope, EncodePlan, EventPublisher,
    ProxyClient,
};
use crate::domain::DomainEvent;
use crate::error::{Error, Result};
use crate::merge::{self, MergeOutcome, PollConfig};
use crate::placement;
use crate::rng;
use crate::state::{ObjectRecord, Tables, UpdatingEntry};
use crate::topology::ProxyPool;

/// Build the wire-format block list a proxy needs from a stripe's blocks,
/// resolving each block's node id to its endpoint.
fn block_placements(tables: &Tables, stripe: &Stripe) -> Vec<BlockPlacement> {
    stripe
        .blocks
        .iter()
        .map(|b| BlockPlacement {
            block_key: b.block_key.clone(),
            block_id: b.block_id,
            block_type: b.block_type,
            node_endpoint: tables.nodes.get(&b.map2node).map(|n| n.endpoint.clone()).unwrap_or_default(),
        })
        .collect()
}

/// Byte-transfer endpoint for a SET reply: the RPC proxy port plus one
/// (spec.md §4.4). Falls back to the unmodified endpoint if it doesn't
/// parse as `host:port`.
fn bump_port(endpoint: &str) -> String {
    match endpoint.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => format!("{host}:{}", port + 1),
            Err(_) => endpoint.to_string(),
        },
        None => endpoint.to_string(),
    }
}

/// Everything a client needs to drive an `encodeAndSet` against a proxy
/// once `uploadOriginKeyValue` has placed its stripe.
#[derive(Debug, Clone)]
pub struct SetPlacement {
    pub stripe_id: StripeId,
    pub serving_cluster: ClusterId,
    pub serving_proxy_endpoint: String,
}

/// Everything a client needs to drive a `decodeAndGet` against a proxy.
#[derive(Debug, Clone)]
pub struct GetPlacement {
    pub stripe: Stripe,
    pub serving_proxy_endpoint: String,
    pub object_size: u64,
}

pub struct Coordinator {
    tables: Arc<Mutex<Tables>>,
    commit: CommitCoordinator,
    proxies: ProxyPool,
    events: Arc<dyn EventPublisher>,
    poll: PollConfig,
}

impl Coordinator {
    pub fn new(tables: Tables, proxies: ProxyPool, events: Arc<dyn EventPublisher>, poll: PollConfig) -> Self {
        let tables = Arc::new(Mutex::new(tables));
        let commit = CommitCoordinator::new(tables.clone());
        Coordinator {
            tables,
            commit,
            proxies,
            events,
            poll,
        }
    }

    /// `setParameter`: install a new EC schema and reset placement state.
    #[instrument(skip(self))]
    pub async fn set_parameter(&self, schema: EcSchema) -> Result<()> {
        self.tables.lock().set_parameter(schema)?;
        self.events.publish(DomainEvent::SchemaInstalled { timestamp: chrono::Utc::now() }).await.ok();
        Ok(())
    }

    /// `uploadOriginKeyValue`: place a brand-new stripe for `object_key`,
    /// drive the chosen proxy's `encodeAndSet`, and on success record the
    /// object as updating (erasing any prior updating entry for this key).
    #[instrument(skip(self))]
    pub async fn upload_origin_key_value(&self, object_key: &str, object_size: u64) -> Result<SetPlacement> {
        let (stripe_id, serving_cluster, serving_proxy_endpoint, plan) = {
            let mut tables = self.tables.lock();
            tables.object_updating.remove(object_key);
            let (stripe_id, serving_cluster) = placement::generate_placement(&mut tables, object_key, object_size)?;
            let schema = tables.schema()?;
            let stripe = tables.stripe(stripe_id)?.clone();
            let block_size = stripe.data_blocks().first().map(|b| b.block_size).unwrap_or(0);
            let plan = EncodePlan {
                stripe_id,
                object_key: object_key.to_string(),
                object_size,
                block_size,
                k: schema.k,
                g: schema.g,
                l: schema.l,
                encode_type: schema.encode_type,
                blocks: block_placements(&tables, &stripe),
            };
            let endpoint = tables
                .clusters
                .get(&serving_cluster)
                .map(|c| bump_port(&c.proxy_endpoint))
                .unwrap_or_default();
            (stripe_id, serving_cluster, endpoint, plan)
        };

        self.proxies.get(serving_cluster)?.encode_and_set(plan).await?;

        self.tables.lock().object_updating.insert(
            object_key.to_string(),
            UpdatingEntry {
                operation: Operation::Set,
                stripe_id,
                object_size,
            },
        );
        self.events
            .publish(DomainEvent::stripe_placed(stripe_id, vec![serving_cluster]))
            .await
            .ok();
        Ok(SetPlacement {
            stripe_id,
            serving_cluster,
            serving_proxy_endpoint,
        })
    }

    /// `reportCommitAbort`: a proxy's callback after an encode/decode/delete
    /// RPC resolves.
    #[instrument(skip(self))]
    pub async fn report_commit_abort(&self, object_key: &str, operation: Operation, stripe_id: StripeId, committed: bool) {
        self.commit.report_commit_abort(object_key, operation, stripe_id, committed);
        if operation == Operation::Set {
            let event = if committed {
                DomainEvent::object_committed(object_key, stripe_id)
            } else {
                DomainEvent::object_aborted(object_key)
            };
            self.events.publish(event).await.ok();
        } else if committed {
            self.events
                .publish(DomainEvent::object_deleted(
                    (operation == Operation::DelKey).then(|| object_key.to_string()),
                    stripe_id,
                ))
                .await
                .ok();
        }
    }

    /// `checkCommitAbort`: blocks until `operation` has resolved for this
    /// key/stripe.
    #[instrument(skip(self))]
    pub async fn check_commit_abort(&self, object_key: &str, operation: Operation, stripe_id: StripeId) -> bool {
        self.commit.check_commit_abort(object_key, operation, stripe_id).await
    }

    /// `getValue`: look up the committed stripe an object lives in, pick a
    /// cluster holding one of its data blocks uniformly at random, and
    /// drive that proxy's `decodeAndGet` to push the object to
    /// `client_endpoint`.
    #[instrument(skip(self))]
    pub async fn get_value(&self, object_key: &str, client_endpoint: &str) -> Result<GetPlacement> {
        let (stripe, object_size, serving_cluster, endpoint, plan) = {
            let tables = self.tables.lock();
            let record = tables.object_commit.get(object_key).ok_or_else(|| Error::NoSuchKey(object_key.to_string()))?;
            let stripe = tables.stripe(record.stripe_id)?.clone();
            let data_clusters: Vec<ClusterId> = stripe.data_blocks().iter().map(|b| b.map2cluster).collect();
            let serving_cluster = *rng::choose(&data_clusters).ok_or_else(|| Error::NoSuchStripe(record.stripe_id))?;
            let schema = tables.schema()?;
            let endpoint = tables
                .clusters
                .get(&serving_cluster)
                .map(|c| c.proxy_endpoint.clone())
                .unwrap_or_default();
            let plan = DecodePlan {
                stripe_id: stripe.stripe_id,
                object_key: object_key.to_string(),
                client_endpoint: client_endpoint.to_string(),
                k: schema.k,
                g: schema.g,
                l: schema.l,
                encode_type: schema.encode_type,
                blocks: block_placements(&tables, &stripe),
            };
            (stripe, record.object_size, serving_cluster, endpoint, plan)
        };

        self.proxies.get(serving_cluster)?.decode_and_get(plan).await?;

        Ok(GetPlacement {
            stripe,
            serving_proxy_endpoint: endpoint,
            object_size,
        })
    }

    /// `delByKey`: mark an object's commit-table entry as updating-for-
    /// deletion, then send `deleteBlock` (scoped to this key's data block
    /// keys) to a randomly chosen cluster among those holding them; the
    /// actual block removal happens once a proxy reports the delete
    /// committed.
    #[instrument(skip(self))]
    pub async fn del_by_key(&self, object_key: &str) -> Result<StripeId> {
        let (record, target_cluster, keys) = {
            let mut tables = self.tables.lock();
            let record = tables
                .object_commit
                .get(object_key)
                .cloned()
                .ok_or_else(|| Error::NoSuchKey(object_key.to_string()))?;
            tables.object_updating.insert(
                object_key.to_string(),
                UpdatingEntry {
                    operation: Operation::DelKey,
                    stripe_id: record.stripe_id,
                    object_size: record.object_size,
                },
            );
            let stripe = tables.stripe(record.stripe_id)?;
            let owned: Vec<&crate::domain::model::Block> = stripe
                .blocks
                .iter()
                .filter(|b| b.map2key.as_deref() == Some(object_key))
                .collect();
            let keys: Vec<String> = owned.iter().map(|b| b.block_key.clone()).collect();
            let clusters: Vec<ClusterId> = owned.iter().map(|b| b.map2cluster).collect();
            let target_cluster = *rng::choose(&clusters).ok_or_else(|| Error::NoSuchStripe(record.stripe_id))?;
            (record, target_cluster, keys)
        };

        self.proxies
            .get(target_cluster)?
            .delete_block(DeleteBlockRequest {
                scope: DeleteScope::Keys(keys),
            })
            .await?;

        Ok(record.stripe_id)
    }

    /// `delByStripe`: mark a whole stripe for deletion and send
    /// `deleteBlock` (scoped to the whole stripe) to a randomly chosen
    /// cluster among its residents.
    #[instrument(skip(self))]
    pub async fn del_by_stripe(&self, stripe_id: StripeId) -> Result<()> {
        let target_cluster = {
            let mut tables = self.tables.lock();
            let stripe = tables.stripe(stripe_id)?;
            let clusters: Vec<ClusterId> = stripe.place2clusters.iter().copied().collect();
            let target_cluster = *rng::choose(&clusters).ok_or(Error::NoSuchStripe(stripe_id))?;
            if !tables.stripe_deleting.contains(&stripe_id) {
                tables.stripe_deleting.push(stripe_id);
            }
            target_cluster
        };

        self.proxies
            .get(target_cluster)?
            .delete_block(DeleteBlockRequest {
                scope: DeleteScope::Stripe(stripe_id),
            })
            .await?;

        Ok(())
    }

    /// `listStripes`: every stripe currently known to the coordinator.
    pub fn list_stripes(&self) -> Vec<Stripe> {
        self.tables.lock().stripes.values().cloned().collect()
    }

    /// `checkalive`: coordinator health, also used to probe the topology
    /// proxies at startup via [`ProxyPool::connect_http`].
    pub async fn checkalive(&self, cluster_id: ClusterId) -> Result<String> {
        self.proxies.get(cluster_id)?.checkalive("coordinator-probe").await
    }

    /// `requestMerge`: one merge pass over every existing merge group.
    #[instrument(skip(self))]
    pub async fn request_merge(&self, step: u32) -> MergeOutcome {
        info!(step, "requestMerge starting");
        merge::request_merge(&self.tables, &self.proxies, self.events.as_ref(), step, &self.poll).await
    }

    pub fn proxies(&self) -> &ProxyPool {
        &self.proxies
    }

    /// A shared handle to the underlying metadata tables, for callers (the
    /// metrics exporter) that need to sample them independently of the
    /// coordinator's own RPC surface.
    pub fn tables_handle(&self) -> Arc<Mutex<Tables>> {
        self.tables.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, MockProxyClient};
    use crate::domain::model::{Cluster, EncodeType, MultiStripePlacement, Node, SingleStripePlacement};
    use crate::rng;
    use std::collections::HashMap;

    fn schema() -> EcSchema {
        EcSchema {
            k: 4,
            g: 2,
            l: 2,
            b: 2,
            x: 2,
            encode_type: EncodeType::AzureLrc,
            single_stripe_placement: SingleStripePlacement::Optimal,
            multi_stripe_placement: MultiStripePlacement::Ran,
            partial_decoding: false,
        }
    }

    fn small_topology() -> Tables {
        let mut clusters = HashMap::new();
        let mut nodes = HashMap::new();
        let mut next_node = 0u32;
        for c in 0..6 {
            let mut node_ids = Vec::new();
            for _ in 0..4 {
                nodes.insert(
                    next_node,
                    Node {
                        node_id: next_node,
                        endpoint: format!("n{next_node}"),
                        cluster_id: c,
                        stripe_block_counts: HashMap::new(),
                    },
                );
                node_ids.push(next_node);
                next_node += 1;
            }
            clusters.insert(
                c,
                Cluster {
                    cluster_id: c,
                    proxy_endpoint: format!("10.0.0.{c}:9100"),
                    node_ids,
                    blocks: Vec::new(),
                    stripes: Default::default(),
                },
            );
        }
        let mut tables = Tables::new(clusters, nodes);
        tables.set_parameter(schema()).unwrap();
        tables
    }

    fn coordinator() -> Coordinator {
        let mut stubs: HashMap<ClusterId, std::sync::Arc<dyn ProxyClient>> = HashMap::new();
        for c in 0..6 {
            let mock = std::sync::Arc::new(MockProxyClient::new());
            mock.set_step_done(true);
            stubs.insert(c, mock);
        }
        let proxies = ProxyPool::from_stubs(stubs);
        Coordinator::new(small_topology(), proxies, Arc::new(InMemoryEventCollector::new()), PollConfig::default())
    }

    #[tokio::test]
    async fn set_then_commit_makes_get_visible() {
        rng::seed_from_u64(42);
        let coordinator = coordinator();
        let placement = coordinator.upload_origin_key_value("obj1", 1024).await.unwrap();

        assert!(coordinator.get_value("obj1", "client:9000").await.is_err());

        coordinator
            .report_commit_abort("obj1", Operation::Set, placement.stripe_id, true)
            .await;
        assert!(coordinator.check_commit_abort("obj1", Operation::Set, placement.stripe_id).await);

        let get = coordinator.get_value("obj1", "client:9000").await.unwrap();
        assert_eq!(get.stripe.stripe_id, placement.stripe_id);
    }

    #[tokio::test]
    async fn del_by_stripe_requires_an_existing_stripe() {
        let coordinator = coordinator();
        assert!(coordinator.del_by_stripe(999).await.is_err());
    }

    #[test]
    fn bump_port_adds_one_to_the_rpc_port() {
        assert_eq!(bump_port("10.0.0.3:9100"), "10.0.0.3:9101");
        assert_eq!(bump_port("not-a-port"), "not-a-port");
    }

    #[tokio::test]
    async fn set_reply_serves_the_byte_transfer_port() {
        rng::seed_from_u64(7);
        let coordinator = coordinator();
        let placement = coordinator.upload_origin_key_value("obj1", 1024).await.unwrap();

        let rpc_endpoint = format!("10.0.0.{}:9100", placement.serving_cluster);
        assert_eq!(placement.serving_proxy_endpoint, bump_port(&rpc_endpoint));
        assert_eq!(
            placement.serving_proxy_endpoint,
            format!("10.0.0.{}:9101", placement.serving_cluster)
        );
    }
}
