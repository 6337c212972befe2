//! In-memory metadata tables: the coordinator's only state.
//!
//! Everything here lives behind one `parking_lot::Mutex<Tables>` (see
//! [`crate::coordinator::Coordinator`]); this module owns the tables
//! themselves and the bookkeeping `setParameter` and the placement/merge
//! engines mutate directly.

use std::collections::HashMap;

use crate::domain::model::{Cluster, ClusterId, EcSchema, Node, NodeId, Operation, Stripe, StripeId};
use crate::error::{Error, Result};

/// A durable (committed) object: which stripe it lives in and its
/// original size, used to recompute `block_size` on GET.
#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub object_key: String,
    pub object_size: u64,
    pub stripe_id: StripeId,
}

/// An in-flight SET/DEL-by-key, waiting on a proxy's commit/abort report.
#[derive(Debug, Clone)]
pub struct UpdatingEntry {
    pub operation: Operation,
    pub stripe_id: StripeId,
    pub object_size: u64,
}

/// Per-merge-group placement bookkeeping. Reset whenever a merge group
/// fills up or the free-cluster supply runs dry; see `placement.rs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggRange {
    pub start_index: u32,
    pub size: u32,
}

/// All coordinator metadata, as described in spec.md §3 and §5: cluster,
/// node, stripe, object_* and stripe_deleting tables, merge groups, the
/// free-cluster cache, and the stripe id / merge degree counters.
pub struct Tables {
    pub schema: Option<EcSchema>,
    pub clusters: HashMap<ClusterId, Cluster>,
    pub nodes: HashMap<NodeId, Node>,
    pub stripes: HashMap<StripeId, Stripe>,
    pub object_commit: HashMap<String, ObjectRecord>,
    pub object_updating: HashMap<String, UpdatingEntry>,
    pub stripe_deleting: Vec<StripeId>,
    pub merge_groups: Vec<Vec<StripeId>>,
    /// DIS's and OPT's shared free-cluster pool for the current merge group.
    pub free_clusters: Vec<ClusterId>,
    /// AGG's contiguous cluster-id range for the current merge group.
    pub agg_range: Option<AggRange>,
    /// OPT's small aggregation range for parity-adjacent chunks.
    pub opt_agg_range: Option<AggRange>,
    pub cur_stripe_id: StripeId,
    pub merge_degree: u64,
}

impl Tables {
    /// Build empty tables around a fixed, already-loaded topology. Topology
    /// is never touched again by `setParameter`.
    pub fn new(clusters: HashMap<ClusterId, Cluster>, nodes: HashMap<NodeId, Node>) -> Self {
        Tables {
            schema: None,
            clusters,
            nodes,
            stripes: HashMap::new(),
            object_commit: HashMap::new(),
            object_updating: HashMap::new(),
            stripe_deleting: Vec::new(),
            merge_groups: Vec::new(),
            free_clusters: Vec::new(),
            agg_range: None,
            opt_agg_range: None,
            cur_stripe_id: 0,
            merge_degree: 0,
        }
    }

    /// `setParameter`: install a new EC schema and fully reset placement
    /// state. Topology (clusters/nodes as loaded) is untouched, but every
    /// cluster's and node's residency is wiped along with it, since
    /// residency only has meaning relative to a schema.
    pub fn set_parameter(&mut self, schema: EcSchema) -> Result<()> {
        schema.validate()?;
        for cluster in self.clusters.values_mut() {
            cluster.blocks.clear();
            cluster.stripes.clear();
        }
        for node in self.nodes.values_mut() {
            node.stripe_block_counts.clear();
        }
        self.stripes.clear();
        self.object_commit.clear();
        self.object_updating.clear();
        self.stripe_deleting.clear();
        self.merge_groups.clear();
        self.free_clusters.clear();
        self.agg_range = None;
        self.opt_agg_range = None;
        self.cur_stripe_id = 0;
        self.merge_degree = 0;
        self.schema = Some(schema);
        Ok(())
    }

    pub fn schema(&self) -> Result<EcSchema> {
        self.schema.ok_or(Error::SchemaNotSet)
    }

    /// Stripe ids never recycle within a session (I6).
    pub fn next_stripe_id(&mut self) -> StripeId {
        let id = self.cur_stripe_id;
        self.cur_stripe_id += 1;
        id
    }

    /// All cluster ids, sorted; the fixed universe AGG/OPT reserve
    /// contiguous ranges within and Ran/DIS draw from.
    pub fn sorted_cluster_ids(&self) -> Vec<ClusterId> {
        let mut ids: Vec<ClusterId> = self.clusters.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Append `stripe_id` to the current merge group, opening a new one if
    /// the last is already full (`x` stripes) or none exists yet. Used by
    /// every multi-stripe strategy regardless of whether it also uses
    /// `merge_groups` to drive cluster selection (only DIS/AGG/OPT do; Ran
    /// still needs the bookkeeping so I5 membership is well-defined).
    pub fn push_to_merge_group(&mut self, x: u32, stripe_id: StripeId) {
        let needs_new = self
            .merge_groups
            .last()
            .map(|g| g.len() >= x as usize)
            .unwrap_or(true);
        if needs_new {
            self.merge_groups.push(Vec::new());
        }
        self.merge_groups.last_mut().unwrap().push(stripe_id);
    }

    pub fn stripe(&self, stripe_id: StripeId) -> Result<&Stripe> {
        self.stripes.get(&stripe_id).ok_or(Error::NoSuchStripe(stripe_id))
    }

    /// Recompute `place2clusters` for a stripe from its current blocks;
    /// used after a partial block removal (I3).
    pub fn recompute_place2clusters(&mut self, stripe_id: StripeId) {
        if let Some(stripe) = self.stripes.get_mut(&stripe_id) {
            stripe.place2clusters = stripe.blocks.iter().map(|b| b.map2cluster).collect();
        }
    }
}
