//! Core data model: EC schema, blocks, stripes, clusters and nodes.
//!
//! Mirrors the coordinator's in-memory metadata tables: a stripe owns an
//! ordered list of blocks (data, then global parities, then local
//! parities); clusters and nodes hold a secondary residency index used for
//! placement and invariant checks.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type StripeId = u64;
pub type ClusterId = u32;
pub type NodeId = u32;

/// Which erasure code family governs a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodeType {
    AzureLrc,
    OptimalCauchyLrc,
}

/// The only supported single-stripe placement strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SingleStripePlacement {
    Optimal,
}

/// Multi-stripe layout strategy: governs how clusters are chosen across
/// the stripes of a merge group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiStripePlacement {
    Ran,
    Dis,
    Agg,
    Opt,
}

/// Position of a block within its stripe's `k + g + l` block list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Data,
    Global,
    Local,
}

/// The client-visible operation an updating-table entry corresponds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Set,
    DelKey,
    DelStripe,
}

/// EC schema parameters, fixed cluster-wide by `setParameter`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EcSchema {
    pub k: u32,
    pub g: u32,
    pub l: u32,
    pub b: u32,
    pub x: u32,
    pub encode_type: EncodeType,
    pub single_stripe_placement: SingleStripePlacement,
    pub multi_stripe_placement: MultiStripePlacement,
    pub partial_decoding: bool,
}

impl EcSchema {
    /// `k = l*b` and at least one global parity; anything else is rejected
    /// up front rather than surfacing lazily during placement.
    pub fn validate(&self) -> Result<()> {
        if self.l == 0 || self.b == 0 || self.k != self.l * self.b {
            return Err(Error::SchemaRejected(format!(
                "k ({}) must equal l*b (l={}, b={})",
                self.k, self.l, self.b
            )));
        }
        if self.g < 1 {
            return Err(Error::SchemaRejected(format!(
                "g must be at least 1, got {}",
                self.g
            )));
        }
        if self.x == 0 {
            return Err(Error::SchemaRejected(
                "x (stripes per merge group) must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of clusters a local group occupies once fully formed:
    /// `ceil((b+1)/(g+1))`.
    pub fn clusters_per_local_group(&self) -> u32 {
        div_ceil(self.b + 1, self.g + 1)
    }
}

pub fn div_ceil(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

/// A single block of a stripe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub block_key: String,
    pub block_id: u32,
    pub block_type: BlockType,
    pub block_size: u64,
    pub map2stripe: StripeId,
    pub map2cluster: ClusterId,
    pub map2node: NodeId,
    /// 0..l-1 for data/local blocks of that group; `l` for global blocks.
    pub map2group: u32,
    /// Owning object key; empty for local/global parity blocks.
    pub map2key: Option<String>,
}

/// An object living inside a (possibly merged) stripe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectKeyEntry {
    pub object_key: String,
    pub object_size: u64,
}

/// A full EC codeword: `k` data + `g` global + `l` local blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stripe {
    pub stripe_id: StripeId,
    pub k: u32,
    pub l: u32,
    pub g: u32,
    pub object_keys: Vec<ObjectKeyEntry>,
    /// Ordered 0..k-1 data, k..k+g-1 global, k+g..k+g+l-1 local.
    pub blocks: Vec<Block>,
    pub place2clusters: BTreeSet<ClusterId>,
}

impl Stripe {
    pub fn data_blocks(&self) -> &[Block] {
        &self.blocks[0..self.k as usize]
    }

    pub fn global_blocks(&self) -> &[Block] {
        &self.blocks[self.k as usize..(self.k + self.g) as usize]
    }

    pub fn local_blocks(&self) -> &[Block] {
        &self.blocks[(self.k + self.g) as usize..]
    }

    pub fn local_block(&self, group: u32) -> &Block {
        &self.local_blocks()[group as usize]
    }

    pub fn data_blocks_of_group(&self, group: u32, b: u32) -> &[Block] {
        let start = (group * b) as usize;
        &self.data_blocks()[start..start + b as usize]
    }

    pub fn total_blocks(&self) -> u32 {
        self.k + self.g + self.l
    }
}

/// A fault domain: hosts a proxy and a set of storage nodes.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub cluster_id: ClusterId,
    pub proxy_endpoint: String,
    pub node_ids: Vec<NodeId>,
    /// Resident block references: (stripe_id, block_id).
    pub blocks: Vec<(StripeId, u32)>,
    pub stripes: BTreeSet<StripeId>,
}

impl Cluster {
    pub fn block_count_of_stripe(&self, stripe_id: StripeId) -> usize {
        self.blocks.iter().filter(|(s, _)| *s == stripe_id).count()
    }
}

/// A storage server identified by an endpoint, within one cluster.
#[derive(Debug, Clone)]
pub struct Node {
    pub node_id: NodeId,
    pub endpoint: String,
    pub cluster_id: ClusterId,
    /// How many blocks of each stripe currently live on this node; used so
    /// that erasing one block doesn't unlink other blocks of the same
    /// stripe, and so placement never reuses a node already holding the
    /// stripe being placed.
    pub stripe_block_counts: std::collections::HashMap<StripeId, u32>,
}

impl Node {
    pub fn holds_stripe(&self, stripe_id: StripeId) -> bool {
        self.stripe_block_counts.contains_key(&stripe_id)
    }
}
