//! Control-plane coordinator for an Azure-LRC / Optimal-Cauchy-LRC
//! erasure-coded object store, with in-place stripe merging.
//!
//! The coordinator holds all cluster metadata in memory behind a single
//! mutex: cluster/node topology, the stripe table, the object commit/
//! updating tables, and the merge-group bookkeeping `requestMerge` walks.
//! It drives proxies (one per cluster, each fronting a set of storage
//! nodes) through a small JSON-over-HTTP RPC surface; proxies do the
//! actual erasure-coding math.
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`commit`] - Commit/abort coordination and stripe purge
//! - [`coordinator`] - The `Coordinator`: wires tables, commit tracking,
//!   the proxy pool, and the merge engine behind the RPC surface
//! - [`domain`] - Domain layer with ports and events (DDD)
//! - [`error`] - Error types
//! - [`merge`] - The `requestMerge` engine: harvest, recompute, relocate
//! - [`metrics`] - Prometheus metrics integration
//! - [`placement`] - Single- and multi-stripe block placement strategies
//! - [`rng`] - The shared thread-local RNG used for every random choice
//! - [`rpc`] - The client- and proxy-facing HTTP RPC server
//! - [`state`] - In-memory metadata tables
//! - [`topology`] - Topology file loader and the per-cluster proxy pool

pub mod adapters;
pub mod commit;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod merge;
pub mod metrics;
pub mod placement;
pub mod rng;
pub mod rpc;
pub mod state;
pub mod topology;

pub use coordinator::Coordinator;
pub use error::{Error, Result};
