//! Error types for the coordinator.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the coordinator.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Proxy HTTP transport error
    #[error("proxy transport error: {0}")]
    ProxyTransport(#[from] reqwest::Error),

    // =========================================================================
    // Topology errors
    // =========================================================================
    /// Topology XML failed to parse
    #[error("failed to parse topology file: {0}")]
    TopologyParse(#[from] quick_xml::de::DeError),

    /// Topology file named a cluster or node more than once
    #[error("duplicate {kind} id in topology: {id}")]
    DuplicateTopologyId { kind: &'static str, id: String },

    // =========================================================================
    // Schema errors
    // =========================================================================
    /// setParameter was called with an inconsistent schema
    #[error("schema rejected: {0}")]
    SchemaRejected(String),

    /// An RPC was issued before any schema had been installed
    #[error("no EC schema installed; call setParameter first")]
    SchemaNotSet,

    // =========================================================================
    // Lookup errors
    // =========================================================================
    /// GET/DEL against a key absent from the commit table
    #[error("no such key: {0}")]
    NoSuchKey(String),

    /// DEL/merge against a stripe id absent from the stripe table
    #[error("no such stripe: {0}")]
    NoSuchStripe(u64),

    /// No cluster in the topology satisfies a placement constraint
    #[error("no eligible cluster found for placement: {0}")]
    NoEligibleCluster(String),

    /// No free node within a chosen cluster
    #[error("no free node in cluster {cluster_id}")]
    NoFreeNode { cluster_id: u32 },

    // =========================================================================
    // Proxy RPC errors
    // =========================================================================
    /// A proxy RPC returned a non-OK status
    #[error("proxy RPC '{rpc}' to cluster {cluster_id} failed: {reason}")]
    ProxyRpcFailed {
        rpc: &'static str,
        cluster_id: u32,
        reason: String,
    },

    /// No proxy stub is registered for a cluster id
    #[error("no proxy stub registered for cluster {0}")]
    UnknownCluster(u32),

    // =========================================================================
    // Merge errors
    // =========================================================================
    /// requestMerge's step-size arithmetic failed its preconditions
    #[error("merge precondition failed: {0}")]
    MergePreconditionFailed(String),

    /// A fault-tolerance invariant would be violated and no valid
    /// destination could be found during relocation; the owning merge
    /// chunk is bailed out of, not the whole merge.
    #[error("invariant violated during merge chunk for stripe {stripe_id}: {reason}")]
    Invariant { stripe_id: u64, reason: String },

    // =========================================================================
    // Internal
    // =========================================================================
    /// Anything else, logged and surfaced as a coarse failure
    #[error("internal error: {0}")]
    Internal(String),
}
