//! Domain ports (DDD port/adapter pattern).
//!
//! `ProxyClient` is the one real external dependency of the coordinator: a
//! per-cluster stub through which every proxy RPC in the external
//! interface is issued. `EventPublisher` is an optional audit sink.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::events::DomainEvent;
use super::model::{BlockType, ClusterId, EncodeType, NodeId, StripeId};
use crate::error::Result;

// =============================================================================
// Proxy RPC payloads
//
// These double as the wire format: `ProxyHttpClient` serializes them
// directly as the JSON body of each proxy RPC.
// =============================================================================

/// One block's placement, as handed to a proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockPlacement {
    pub block_key: String,
    pub block_id: u32,
    pub block_type: BlockType,
    pub node_endpoint: String,
}

/// The full placement plan a proxy needs to encode and store an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodePlan {
    pub stripe_id: StripeId,
    pub object_key: String,
    pub object_size: u64,
    pub block_size: u64,
    pub k: u32,
    pub g: u32,
    pub l: u32,
    pub encode_type: EncodeType,
    pub blocks: Vec<BlockPlacement>,
}

/// The plan a proxy needs to decode and push an object to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodePlan {
    pub stripe_id: StripeId,
    pub object_key: String,
    pub client_endpoint: String,
    pub k: u32,
    pub g: u32,
    pub l: u32,
    pub encode_type: EncodeType,
    pub blocks: Vec<BlockPlacement>,
}

/// `deleteBlock`'s `stripe_id = -1` sentinel: "these block keys only",
/// vs. `>= 0`: "every block of this stripe".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeleteScope {
    Keys(Vec<String>),
    Stripe(StripeId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteBlockRequest {
    pub scope: DeleteScope,
}

/// Which of the three `checkStep` phases a recompute/relocation is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecalcStep {
    Global = 0,
    Local = 1,
    Reloc = 2,
}

/// One source block feeding a parity recomputation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceBlock {
    pub cluster_id: ClusterId,
    pub node_endpoint: String,
    pub block_key: String,
}

/// Plan for the main proxy driving a parity recomputation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecalcPlan {
    pub merged_stripe_id: StripeId,
    pub step: RecalcStep,
    pub group: Option<u32>,
    pub partial_decoding: bool,
    pub sources: Vec<SourceBlock>,
    pub new_block_key: String,
    pub new_node_endpoint: String,
}

/// Plan for a helper proxy streaming (optionally partially-decoded) data
/// to the main proxy of a recomputation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelpRecalcPlan {
    pub merged_stripe_id: StripeId,
    pub step: RecalcStep,
    pub group: Option<u32>,
    pub partial_decoding: bool,
    pub sources: Vec<SourceBlock>,
    pub main_proxy_endpoint: String,
}

/// One block relocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMove {
    pub block_key: String,
    pub block_id: u32,
    pub from_node_endpoint: String,
    pub to_cluster_id: ClusterId,
    pub to_node_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelocPlan {
    pub stripe_id: StripeId,
    pub moves: Vec<BlockMove>,
}

// =============================================================================
// Proxy port
// =============================================================================

/// The four-and-a-bit RPCs a proxy exposes to the coordinator.
///
/// Implemented by [`crate::adapters::ProxyHttpClient`] for production use
/// and by [`crate::adapters::MockProxyClient`] for tests.
#[async_trait]
pub trait ProxyClient: Send + Sync {
    /// Health probe; returns whatever name was sent.
    async fn checkalive(&self, name: &str) -> Result<String>;

    async fn encode_and_set(&self, plan: EncodePlan) -> Result<()>;

    async fn decode_and_get(&self, plan: DecodePlan) -> Result<()>;

    async fn delete_block(&self, req: DeleteBlockRequest) -> Result<()>;

    async fn main_recalculate(&self, plan: RecalcPlan) -> Result<()>;

    async fn help_recalculate(&self, plan: HelpRecalcPlan) -> Result<()>;

    async fn block_reloc(&self, plan: RelocPlan) -> Result<()>;

    /// Poll whether the most recently requested step has completed.
    /// Must be retried until it returns `Ok(true)` or an error.
    async fn check_step(&self, step: RecalcStep) -> Result<bool>;
}

// =============================================================================
// Event publisher port
// =============================================================================

/// Port for publishing domain events (audit trail of commits, aborts, and
/// merges). Backed by `tracing` in production; collected in memory in
/// tests.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> Result<()>;
}
