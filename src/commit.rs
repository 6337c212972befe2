//! Commit/abort coordinator (spec.md §4.5): two-phase visibility of
//! SET/DEL, gated by a condition variable every commit path broadcasts.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::instrument;

use crate::domain::model::{Operation, StripeId};
use crate::state::{ObjectRecord, Tables};

/// Removes every block of `stripe_id` whose `map2key == object_key` from
/// the stripe's own block list and from every cluster/node residency
/// index; drops the stripe entirely if it ends up empty.
fn remove_object_blocks(tables: &mut Tables, stripe_id: StripeId, object_key: &str) {
    let Some(stripe) = tables.stripes.get_mut(&stripe_id) else {
        return;
    };
    let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut stripe.blocks)
        .into_iter()
        .partition(|b| b.map2key.as_deref() == Some(object_key));
    stripe.blocks = kept;
    stripe.object_keys.retain(|o| o.object_key != object_key);
    let stripe_empty = stripe.blocks.is_empty();

    for block in &removed {
        if let Some(cluster) = tables.clusters.get_mut(&block.map2cluster) {
            cluster.blocks.retain(|(s, id)| !(*s == stripe_id && *id == block.block_id));
        }
        if let Some(node) = tables.nodes.get_mut(&block.map2node) {
            if let Some(count) = node.stripe_block_counts.get_mut(&stripe_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    node.stripe_block_counts.remove(&stripe_id);
                }
            }
        }
    }

    if stripe_empty {
        tables.stripes.remove(&stripe_id);
        for group in &mut tables.merge_groups {
            group.retain(|s| *s != stripe_id);
        }
    } else {
        tables.recompute_place2clusters(stripe_id);
    }
}

/// Removes every block of `stripe_id` from every cluster/node, then purges
/// any commit-table entry whose object lived in this stripe. Used by
/// DEL-stripe commit and by merge's "replace source stripes" step.
pub fn purge_stripe(tables: &mut Tables, stripe_id: StripeId) {
    let Some(stripe) = tables.stripes.remove(&stripe_id) else {
        return;
    };
    for block in &stripe.blocks {
        if let Some(cluster) = tables.clusters.get_mut(&block.map2cluster) {
            cluster.blocks.retain(|(s, id)| !(*s == stripe_id && *id == block.block_id));
            cluster.stripes.remove(&stripe_id);
        }
        if let Some(node) = tables.nodes.get_mut(&block.map2node) {
            node.stripe_block_counts.remove(&stripe_id);
        }
    }
    tables.object_commit.retain(|_, record| record.stripe_id != stripe_id);
    for group in &mut tables.merge_groups {
        group.retain(|s| *s != stripe_id);
    }
}

/// Gates `checkCommitAbort` waiters on a condition variable every report
/// path broadcasts, per spec.md §4.5/§5.
pub struct CommitCoordinator {
    tables: Arc<Mutex<Tables>>,
    notify: Arc<Notify>,
}

impl CommitCoordinator {
    pub fn new(tables: Arc<Mutex<Tables>>) -> Self {
        Self {
            tables,
            notify: Arc::new(Notify::new()),
        }
    }

    /// `reportCommitAbort`: a proxy's callback after an encode/decode/
    /// delete RPC resolves.
    #[instrument(skip(self))]
    pub fn report_commit_abort(
        &self,
        object_key: &str,
        operation: Operation,
        stripe_id: StripeId,
        committed: bool,
    ) {
        {
            let mut tables = self.tables.lock();
            match (operation, committed) {
                (Operation::Set, true) => {
                    if let Some(entry) = tables.object_updating.remove(object_key) {
                        tables.object_commit.insert(
                            object_key.to_string(),
                            ObjectRecord {
                                object_key: object_key.to_string(),
                                object_size: entry.object_size,
                                stripe_id: entry.stripe_id,
                            },
                        );
                    }
                }
                (Operation::Set, false) => {
                    tables.object_updating.remove(object_key);
                }
                (Operation::DelKey, true) => {
                    tables.object_updating.remove(object_key);
                    if let Some(record) = tables.object_commit.remove(object_key) {
                        remove_object_blocks(&mut tables, record.stripe_id, object_key);
                    }
                }
                (Operation::DelKey, false) => {
                    tables.object_updating.remove(object_key);
                }
                (Operation::DelStripe, true) => {
                    tables.stripe_deleting.retain(|s| *s != stripe_id);
                    purge_stripe(&mut tables, stripe_id);
                }
                (Operation::DelStripe, false) => {
                    tables.stripe_deleting.retain(|s| *s != stripe_id);
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// `checkCommitAbort`: blocks until the observed outcome is consistent
    /// with `operation` having resolved. There is no timeout and no signal
    /// distinguishing "still pending" from "aborted" — an aborted SET that
    /// never becomes visible parks its caller forever, matching spec.md
    /// §5's "no timeout" cancellation model (see DESIGN.md).
    #[instrument(skip(self))]
    pub async fn check_commit_abort(&self, object_key: &str, operation: Operation, stripe_id: StripeId) -> bool {
        loop {
            let notified = self.notify.notified();
            {
                let tables = self.tables.lock();
                let resolved = match operation {
                    Operation::Set => tables.object_commit.contains_key(object_key),
                    Operation::DelKey => !tables.object_commit.contains_key(object_key),
                    Operation::DelStripe => !tables.stripe_deleting.contains(&stripe_id),
                };
                if resolved {
                    return true;
                }
            }
            notified.await;
        }
    }
}
