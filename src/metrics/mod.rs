//! Metrics module.
//!
//! Registers the coordinator's Prometheus metrics (spec.md §4.10): RPCs
//! served per kind, placement calls, merge chunks attempted/succeeded/
//! failed, proxy RPC latency/failure counts by kind, outstanding
//! `checkCommitAbort` waiters, and stripe/cluster/node table sizes sampled
//! on scrape.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prometheus::{register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Gauge, HistogramVec};
use tracing::instrument;

use crate::state::Tables;

/// All counters/histograms the coordinator registers at startup, plus a
/// handle to the tables it samples gauges from on scrape.
pub struct CoordinatorMetrics {
    rpc_total: CounterVec,
    placement_total: prometheus::Counter,
    merge_chunks_total: CounterVec,
    proxy_rpc_total: CounterVec,
    proxy_rpc_latency_seconds: HistogramVec,
    commit_abort_waiters: Gauge,
    stripe_table_size: Gauge,
    cluster_table_size: Gauge,
    node_table_size: Gauge,
    tables: Arc<Mutex<Tables>>,
}

impl CoordinatorMetrics {
    pub fn new(tables: Arc<Mutex<Tables>>) -> prometheus::Result<Arc<Self>> {
        Ok(Arc::new(CoordinatorMetrics {
            rpc_total: register_counter_vec!("coordinator_rpc_total", "RPCs served, by path", &["rpc"])?,
            placement_total: prometheus::register_counter!("coordinator_placement_total", "Stripe placements performed")?,
            merge_chunks_total: register_counter_vec!(
                "coordinator_merge_chunks_total",
                "Merge chunks processed, by outcome",
                &["outcome"]
            )?,
            proxy_rpc_total: register_counter_vec!(
                "coordinator_proxy_rpc_total",
                "Proxy RPCs issued, by kind and outcome",
                &["rpc", "outcome"]
            )?,
            proxy_rpc_latency_seconds: register_histogram_vec!(
                "coordinator_proxy_rpc_latency_seconds",
                "Proxy RPC latency, by kind",
                &["rpc"]
            )?,
            commit_abort_waiters: register_gauge!(
                "coordinator_commit_abort_waiters",
                "checkCommitAbort calls currently blocked"
            )?,
            stripe_table_size: register_gauge!("coordinator_stripe_table_size", "Stripes currently tracked")?,
            cluster_table_size: register_gauge!("coordinator_cluster_table_size", "Clusters in the loaded topology")?,
            node_table_size: register_gauge!("coordinator_node_table_size", "Nodes in the loaded topology")?,
            tables,
        }))
    }

    pub fn record_rpc(&self, path: &str) {
        self.rpc_total.with_label_values(&[path]).inc();
    }

    pub fn record_placement(&self) {
        self.placement_total.inc();
    }

    pub fn record_merge_outcome(&self, merged: bool) {
        let outcome = if merged { "merged" } else { "no_op" };
        self.merge_chunks_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_proxy_rpc(&self, rpc: &str, outcome: &str, elapsed: Duration) {
        self.proxy_rpc_total.with_label_values(&[rpc, outcome]).inc();
        self.proxy_rpc_latency_seconds.with_label_values(&[rpc]).observe(elapsed.as_secs_f64());
    }

    pub fn inc_commit_abort_waiters(&self) {
        self.commit_abort_waiters.inc();
    }

    pub fn dec_commit_abort_waiters(&self) {
        self.commit_abort_waiters.dec();
    }

    /// Refresh the table-size gauges from the live tables; called right
    /// before every `/metrics` scrape.
    #[instrument(skip(self))]
    pub fn sample_table_sizes(&self) {
        let tables = self.tables.lock();
        self.stripe_table_size.set(tables.stripes.len() as f64);
        self.cluster_table_size.set(tables.clusters.len() as f64);
        self.node_table_size.set(tables.nodes.len() as f64);
    }
}
