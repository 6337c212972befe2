//! Merge engine: `requestMerge` (spec.md §4.6, transactionality in §4.7).
//!
//! Coalesces `s` stripes of each existing merge group into one: harvests
//! their data blocks into a single renumbered codeword, drives parity
//! recomputation and old-parity deletion across proxies, then relocates
//! whatever blocks would otherwise violate the single-cluster
//! fault-tolerance invariant (I4) or local-group compactness.
//!
//! Each chunk is computed independently and committed to the shared
//! tables only once every step has succeeded; a chunk that cannot find a
//! valid relocation destination aborts on its own, leaving its source
//! stripes untouched, and the merge continues with the next chunk.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, instrument, warn};

use crate::domain::model::{
    div_ceil, Block, BlockType, ClusterId, EcSchema, EncodeType, MultiStripePlacement, NodeId,
    Stripe, StripeId,
};
use crate::domain::ports::{
    BlockMove, DeleteBlockRequest, DeleteScope, EventPublisher, HelpRecalcPlan, ProxyClient,
    RecalcPlan, RecalcStep, RelocPlan, SourceBlock,
};
use crate::domain::DomainEvent;
use crate::error::{Error, Result};
use crate::placement;
use crate::rng;
use crate::state::Tables;
use crate::topology::ProxyPool;

/// `checkStep` polling cadence; spec.md §9 calls for "must be retried until
/// success or explicit failure".
#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval: Duration::from_millis(50),
            max_attempts: 40,
        }
    }
}

/// `requestMerge`'s reply: whether this pass merged anything, and the
/// elapsed wall-times billed to local-parity recompute, global-parity
/// recompute, and data relocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOutcome {
    pub merged: bool,
    pub local_recompute_secs: f64,
    pub global_recompute_secs: f64,
    pub relocation_secs: f64,
}

#[derive(Debug, Default)]
struct ChunkMetrics {
    local_recompute_secs: f64,
    global_recompute_secs: f64,
    relocation_secs: f64,
}

fn precondition_step(
    schema: &EcSchema,
    stripe_count: usize,
    merge_groups: &[Vec<StripeId>],
    merge_degree: u64,
    s: u32,
) -> std::result::Result<(), String> {
    if s == 0 {
        return Err("step size must be at least 1".into());
    }
    if stripe_count % s as usize != 0 {
        return Err(format!("stripe table size {stripe_count} is not a multiple of {s}"));
    }
    if merge_degree == 0 {
        let rem = schema.b % (schema.g + 1);
        if rem != 0 {
            let required = schema.g / rem;
            if required == 0 || s != required {
                return Err(format!(
                    "first-stage merge requires step size {required} (g/({}mod({}+1))), got {s}",
                    schema.b, schema.g
                ));
            }
        }
    }
    if matches!(
        schema.multi_stripe_placement,
        MultiStripePlacement::Dis | MultiStripePlacement::Opt
    ) {
        for group in merge_groups {
            if !group.is_empty() && group.len() % s as usize != 0 {
                return Err(format!("merge group of size {} is not a multiple of {s}", group.len()));
            }
        }
    }
    Ok(())
}

/// spec.md §4.6 step 2: renumber data blocks group-major (all of group 0's
/// blocks first, in source order, then group 1's, ...) so the merged
/// stripe's local groups stay contiguous ranges. Also records where every
/// harvested block (data and old parities) physically lives, for driving
/// recompute.
struct Harvest {
    merged: Stripe,
    block_location: Vec<SourceBlock>,
    parity_location: Vec<Vec<SourceBlock>>,
}

fn source_block(tables: &Tables, block: &Block) -> SourceBlock {
    SourceBlock {
        cluster_id: block.map2cluster,
        node_endpoint: tables
            .nodes
            .get(&block.map2node)
            .map(|n| n.endpoint.clone())
            .unwrap_or_default(),
        block_key: block.block_key.clone(),
    }
}

fn harvest(tables: &Tables, schema: &EcSchema, sources: &[Stripe], merged_id: StripeId) -> Harvest {
    let s = sources.len() as u32;
    let b_prime = schema.b * s;
    let k_prime = schema.k * s;

    let mut data_blocks: Vec<Option<Block>> = (0..k_prime).map(|_| None).collect();
    let mut object_keys = Vec::new();
    let mut block_location = Vec::new();
    let mut parity_location: Vec<Vec<SourceBlock>> = (0..schema.l).map(|_| Vec::new()).collect();

    for (src_idx, source) in sources.iter().enumerate() {
        object_keys.extend(source.object_keys.iter().cloned());
        for group in 0..schema.l {
            for (offset, block) in source.data_blocks_of_group(group, schema.b).iter().enumerate() {
                let merged_block_id = group * b_prime + (src_idx as u32) * schema.b + offset as u32;
                let mut new_block = block.clone();
                new_block.block_id = merged_block_id;
                new_block.map2stripe = merged_id;
                new_block.map2group = group;
                block_location.push(source_block(tables, block));
                data_blocks[merged_block_id as usize] = Some(new_block);
            }
            let old_local = source.local_block(group);
            parity_location[group as usize].push(source_block(tables, old_local));
            if matches!(schema.encode_type, EncodeType::OptimalCauchyLrc) {
                for gblock in source.global_blocks() {
                    parity_location[group as usize].push(source_block(tables, gblock));
                }
            }
        }
    }

    let data_blocks: Vec<Block> = data_blocks.into_iter().map(|b| b.expect("every merged data block id was assigned exactly once")).collect();
    let merged = Stripe {
        stripe_id: merged_id,
        k: k_prime,
        l: schema.l,
        g: schema.g,
        object_keys,
        blocks: data_blocks,
        place2clusters: Default::default(),
    };
    Harvest {
        merged,
        block_location,
        parity_location,
    }
}

/// Register a freshly harvested (or freshly-parented) block's residency in
/// the cluster/node tables without touching the stripe table itself — the
/// merged stripe isn't inserted there until the whole chunk commits.
fn register_residency(tables: &mut Tables, stripe_id: StripeId, block: &Block) {
    if let Some(cluster) = tables.clusters.get_mut(&block.map2cluster) {
        cluster.blocks.push((stripe_id, block.block_id));
        cluster.stripes.insert(stripe_id);
    }
    if let Some(node) = tables.nodes.get_mut(&block.map2node) {
        *node.stripe_block_counts.entry(stripe_id).or_insert(0) += 1;
    }
}

fn unregister_residency(tables: &mut Tables, stripe_id: StripeId, block: &Block) {
    if let Some(cluster) = tables.clusters.get_mut(&block.map2cluster) {
        cluster.blocks.retain(|(s, id)| !(*s == stripe_id && *id == block.block_id));
        if !cluster.blocks.iter().any(|(s, _)| *s == stripe_id) {
            cluster.stripes.remove(&stripe_id);
        }
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

async fn poll_check_step(proxy: &dyn ProxyClient, step: RecalcStep, poll: &PollConfig) -> Result<()> {
    for attempt in 0..poll.max_attempts {
        if proxy.check_step(step).await? {
            return Ok(());
        }
        if attempt + 1 < poll.max_attempts {
            tokio::time::sleep(poll.interval).await;
        }
    }
    Err(Error::ProxyRpcFailed {
        rpc: "checkStep",
        cluster_id: u32::MAX,
        reason: "step did not complete within the retry budget".into(),
    })
}

/// spec.md §4.6 step 4: one main proxy recomputes a new parity block from
/// `sources`, with every other cluster holding a source block running as a
/// concurrent `helpRecalculate` helper; poll `checkStep` until the main
/// proxy reports done.
#[allow(clippy::too_many_arguments)]
async fn run_recompute(
    proxies: &ProxyPool,
    merged_stripe_id: StripeId,
    step: RecalcStep,
    group: Option<u32>,
    sources: &[SourceBlock],
    partial_decoding: bool,
    target_cluster: ClusterId,
    new_block_key: String,
    new_node_endpoint: String,
    poll: &PollConfig,
) -> Result<()> {
    let main = proxies.get(target_cluster)?;
    let main_plan = RecalcPlan {
        merged_stripe_id,
        step,
        group,
        partial_decoding,
        sources: sources.to_vec(),
        new_block_key,
        new_node_endpoint,
    };

    let mut helper_clusters: Vec<ClusterId> = sources.iter().map(|s| s.cluster_id).collect();
    helper_clusters.sort_unstable();
    helper_clusters.dedup();
    helper_clusters.retain(|c| *c != target_cluster);

    let help_futs = helper_clusters.into_iter().map(|hc| {
        let help_sources: Vec<SourceBlock> = sources.iter().filter(|s| s.cluster_id == hc).cloned().collect();
        let plan = HelpRecalcPlan {
            merged_stripe_id,
            step,
            group,
            partial_decoding,
            sources: help_sources,
            main_proxy_endpoint: format!("cluster-{target_cluster}"),
        };
        async move {
            let helper = proxies.get(hc)?;
            helper.help_recalculate(plan).await
        }
    });

    let (main_res, help_res) = tokio::join!(main.main_recalculate(main_plan), futures::future::join_all(help_futs));
    main_res?;
    for r in help_res {
        r?;
    }

    poll_check_step(main.as_ref(), step, poll).await
}

/// spec.md §4.6 step 5: delete every old parity block, issued to one
/// randomly chosen cluster among those that held them.
async fn delete_old_parities(proxies: &ProxyPool, sources: &[Stripe]) -> Result<()> {
    let mut keys = Vec::new();
    let mut candidate_clusters = Vec::new();
    for source in sources {
        for block in source.global_blocks().iter().chain(source.local_blocks()) {
            keys.push(block.block_key.clone());
            candidate_clusters.push(block.map2cluster);
        }
    }
    if keys.is_empty() {
        return Ok(());
    }
    let target = *rng::choose(&candidate_clusters).expect("non-empty parity set implies a candidate cluster");
    proxies
        .get(target)?
        .delete_block(DeleteBlockRequest {
            scope: DeleteScope::Keys(keys),
        })
        .await
}

/// Priorities (a)/(b)/(c) for relocation destination search (spec.md
/// §4.6 step 6). `allow_newly_added` gates priority (b); `allow_fresh`
/// gates priority (c). Step 7 (`enforce_local_compactness`) calls this
/// with both enabled, since spec.md directs it to use "the same
/// destination search as step 6".
fn find_destination(
    tables: &Tables,
    merged: &Stripe,
    group: u32,
    exclude: ClusterId,
    newly_added: &HashSet<ClusterId>,
    allow_newly_added: bool,
    allow_fresh: bool,
) -> Option<ClusterId> {
    let g = merged.g;
    let mut per_cluster: HashMap<ClusterId, (u32, HashMap<u32, u32>, bool)> = HashMap::new();
    for block in &merged.blocks {
        let entry = per_cluster.entry(block.map2cluster).or_insert_with(|| (0, HashMap::new(), false));
        entry.0 += 1;
        if block.block_type == BlockType::Global {
            entry.2 = true;
        } else {
            *entry.1.entry(block.map2group).or_insert(0) += 1;
        }
    }

    let candidate_ok = |cluster_id: ClusterId| -> bool {
        if cluster_id == exclude {
            return false;
        }
        match per_cluster.get(&cluster_id) {
            None => true,
            Some((count, groups, has_global)) => {
                if *has_global || *count >= g + 1 {
                    false
                } else {
                    let majority = groups.iter().max_by_key(|(_, c)| **c).map(|(grp, _)| *grp);
                    majority.map(|m| m == group).unwrap_or(true)
                }
            }
        }
    };

    let mut in_place = merged.place2clusters.clone();
    in_place.retain(|c| candidate_ok(*c));
    if let Some(found) = rng::choose_from(in_place.iter().copied()) {
        return Some(found);
    }

    if allow_newly_added {
        let mut added: Vec<ClusterId> = newly_added.iter().copied().filter(|c| candidate_ok(*c)).collect();
        added.sort_unstable();
        if let Some(found) = rng::choose(&added) {
            return Some(*found);
        }
    }

    if allow_fresh {
        let empty: Vec<ClusterId> = tables
            .sorted_cluster_ids()
            .into_iter()
            .filter(|c| !per_cluster.contains_key(c) && *c != exclude)
            .collect();
        if let Some(found) = rng::choose(&empty) {
            return Some(*found);
        }
    }

    None
}

fn move_block(
    tables: &mut Tables,
    merged: &mut Stripe,
    block_idx: usize,
    to_cluster: ClusterId,
    used_this_pass: &mut HashMap<ClusterId, HashSet<NodeId>>,
) -> Result<BlockMove> {
    let stripe_id = merged.stripe_id;
    let old_block = merged.blocks[block_idx].clone();
    unregister_residency(tables, stripe_id, &old_block);

    let from_endpoint = tables.nodes.get(&old_block.map2node).map(|n| n.endpoint.clone()).unwrap_or_default();
    let used = used_this_pass.entry(to_cluster).or_default();
    let new_node = placement::place_block(tables, stripe_id, to_cluster, old_block.block_id, used)?;
    let to_endpoint = tables.nodes.get(&new_node).map(|n| n.endpoint.clone()).unwrap_or_default();

    merged.blocks[block_idx].map2cluster = to_cluster;
    merged.blocks[block_idx].map2node = new_node;

    Ok(BlockMove {
        block_key: old_block.block_key,
        block_id: old_block.block_id,
        from_node_endpoint: from_endpoint,
        to_cluster_id: to_cluster,
        to_node_endpoint: to_endpoint,
    })
}

/// spec.md §4.6 step 6: enforce I4 cluster-by-cluster.
fn enforce_i4(tables: &mut Tables, merged: &mut Stripe) -> Result<Vec<BlockMove>> {
    let mut moves = Vec::new();
    let mut newly_added: HashSet<ClusterId> = HashSet::new();
    let mut used_this_pass: HashMap<ClusterId, HashSet<NodeId>> = HashMap::new();

    loop {
        merged.place2clusters = merged.blocks.iter().map(|b| b.map2cluster).collect();
        let mut violating: Option<ClusterId> = None;
        for &cluster_id in &merged.place2clusters {
            let in_cluster: Vec<usize> = merged
                .blocks
                .iter()
                .enumerate()
                .filter(|(_, b)| b.map2cluster == cluster_id)
                .map(|(i, _)| i)
                .collect();
            let has_global = in_cluster.iter().any(|&i| merged.blocks[i].block_type == BlockType::Global);
            let has_data_or_local = in_cluster
                .iter()
                .any(|&i| merged.blocks[i].block_type != BlockType::Global);
            let mut groups: HashMap<u32, u32> = HashMap::new();
            for &i in &in_cluster {
                if merged.blocks[i].block_type != BlockType::Global {
                    *groups.entry(merged.blocks[i].map2group).or_insert(0) += 1;
                }
            }
            let multi_group = groups.len() > 1;
            if (has_global && has_data_or_local) || in_cluster.len() > (merged.g + 1) as usize || multi_group {
                violating = Some(cluster_id);
                break;
            }
        }

        let Some(cluster_id) = violating else {
            break;
        };

        let in_cluster: Vec<usize> = merged
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.map2cluster == cluster_id)
            .map(|(i, _)| i)
            .collect();
        let has_global = in_cluster.iter().any(|&i| merged.blocks[i].block_type == BlockType::Global);
        let has_data_or_local = in_cluster
            .iter()
            .any(|&i| merged.blocks[i].block_type != BlockType::Global);

        let to_move: Vec<usize> = if has_global && has_data_or_local {
            // Case 1: evacuate every data/local block, keep the globals.
            in_cluster
                .iter()
                .copied()
                .filter(|&i| merged.blocks[i].block_type != BlockType::Global)
                .collect()
        } else {
            // Case 2/3: keep the largest local group (trimmed to g+1), move the rest.
            let mut groups: HashMap<u32, Vec<usize>> = HashMap::new();
            for &i in &in_cluster {
                groups.entry(merged.blocks[i].map2group).or_default().push(i);
            }
            let keep_group = groups.iter().max_by_key(|(_, v)| v.len()).map(|(g, _)| *g);
            let mut to_move = Vec::new();
            for (grp, idxs) in groups {
                if Some(grp) != keep_group {
                    to_move.extend(idxs);
                } else if idxs.len() > (merged.g + 1) as usize {
                    to_move.extend(idxs.into_iter().skip((merged.g + 1) as usize));
                }
            }
            to_move
        };

        for idx in to_move {
            let group = merged.blocks[idx].map2group;
            let dest = find_destination(tables, merged, group, cluster_id, &newly_added, true, true).ok_or_else(|| {
                Error::Invariant {
                    stripe_id: merged.stripe_id,
                    reason: format!("no I4-valid destination for block {} leaving cluster {cluster_id}", merged.blocks[idx].block_key),
                }
            })?;
            newly_added.insert(dest);
            moves.push(move_block(tables, merged, idx, dest, &mut used_this_pass)?);
        }
    }

    Ok(moves)
}

/// spec.md §4.6 step 7: cap the number of distinct clusters any one local
/// group is spread across.
fn enforce_local_compactness(tables: &mut Tables, merged: &mut Stripe) -> Result<Vec<BlockMove>> {
    let mut moves = Vec::new();
    let bound = div_ceil(merged.k / merged.l + 1, merged.g + 1);
    let mut used_this_pass: HashMap<ClusterId, HashSet<NodeId>> = HashMap::new();

    for group in 0..merged.l {
        let mut newly_added: HashSet<ClusterId> = HashSet::new();
        loop {
            let mut per_cluster: HashMap<ClusterId, Vec<usize>> = HashMap::new();
            for (i, block) in merged.blocks.iter().enumerate() {
                if block.block_type != BlockType::Global && block.map2group == group {
                    per_cluster.entry(block.map2cluster).or_default().push(i);
                }
            }
            if per_cluster.len() <= bound as usize {
                break;
            }
            let mut ranked: Vec<(ClusterId, Vec<usize>)> = per_cluster.into_iter().collect();
            ranked.sort_by_key(|(_, idxs)| idxs.len());
            let (smallest, idxs) = ranked.remove(0);

            for idx in idxs {
                let dest = find_destination(tables, merged, group, smallest, &newly_added, true, true).ok_or_else(|| {
                    Error::Invariant {
                        stripe_id: merged.stripe_id,
                        reason: format!(
                            "no compactness-valid destination for group {group} block leaving cluster {smallest}"
                        ),
                    }
                })?;
                newly_added.insert(dest);
                moves.push(move_block(tables, merged, idx, dest, &mut used_this_pass)?);
            }
        }
    }

    Ok(moves)
}

/// Discards a chunk's in-progress work: unregisters the merged stripe's
/// residency so the source stripes' bookkeeping is exactly as it was
/// before the chunk started.
fn rollback_chunk(tables: &mut Tables, merged: &Stripe) {
    for block in &merged.blocks {
        unregister_residency(tables, merged.stripe_id, block);
    }
}

async fn merge_one_chunk(
    tables: &Arc<Mutex<Tables>>,
    proxies: &ProxyPool,
    source_ids: &[StripeId],
    poll: &PollConfig,
) -> Result<(StripeId, ChunkMetrics)> {
    struct Prepared {
        schema: EcSchema,
        sources: Vec<Stripe>,
        merged: Stripe,
        block_location: Vec<SourceBlock>,
        parity_location: Vec<Vec<SourceBlock>>,
        global_cluster: ClusterId,
        global_node_endpoint: String,
        local_clusters: Vec<ClusterId>,
        local_node_endpoints: Vec<String>,
    }

    let mut prepared = {
        let mut t = tables.lock();
        let schema = t.schema()?;
        let sources: Vec<Stripe> = source_ids.iter().map(|id| t.stripe(*id).map(|s| s.clone())).collect::<Result<_>>()?;
        let merged_id = t.next_stripe_id();
        let Harvest {
            mut merged,
            block_location,
            parity_location,
        } = harvest(&t, &schema, &sources, merged_id);

        for block in &merged.blocks {
            register_residency(&mut t, merged_id, block);
        }

        let last = sources.last().expect("a merge chunk always has at least one source stripe");
        let global_cluster = last.global_blocks()[0].map2cluster;
        let local_clusters: Vec<ClusterId> = (0..schema.l).map(|i| last.local_block(i).map2cluster).collect();

        let mut used_by_cluster: HashMap<ClusterId, HashSet<NodeId>> = HashMap::new();
        let mut global_node_endpoint = String::new();
        for g in 0..schema.g {
            let block_id = merged.k + g;
            let used = used_by_cluster.entry(global_cluster).or_default();
            let node = placement::place_block(&mut t, merged_id, global_cluster, block_id, used)?;
            let block = Block {
                block_key: placement::global_block_key(merged_id, g),
                block_id,
                block_type: BlockType::Global,
                block_size: last.global_blocks()[g as usize].block_size,
                map2stripe: merged_id,
                map2cluster: global_cluster,
                map2node: node,
                map2group: schema.l,
                map2key: None,
            };
            if g == 0 {
                global_node_endpoint = t.nodes.get(&node).map(|n| n.endpoint.clone()).unwrap_or_default();
            }
            merged.blocks.push(block);
        }

        let mut local_node_endpoints = Vec::with_capacity(schema.l as usize);
        for (group, &lc) in local_clusters.iter().enumerate() {
            let block_id = merged.k + merged.g + group as u32;
            let used = used_by_cluster.entry(lc).or_default();
            let node = placement::place_block(&mut t, merged_id, lc, block_id, used)?;
            let endpoint = t.nodes.get(&node).map(|n| n.endpoint.clone()).unwrap_or_default();
            local_node_endpoints.push(endpoint);
            merged.blocks.push(Block {
                block_key: placement::local_block_key(merged_id, group as u32),
                block_id,
                block_type: BlockType::Local,
                block_size: last.local_block(group as u32).block_size,
                map2stripe: merged_id,
                map2cluster: lc,
                map2node: node,
                map2group: group as u32,
                map2key: None,
            });
        }

        merged.place2clusters = merged.blocks.iter().map(|b| b.map2cluster).collect();

        Prepared {
            schema,
            sources,
            merged,
            block_location,
            parity_location,
            global_cluster,
            global_node_endpoint,
            local_clusters,
            local_node_endpoints,
        }
    };

    let merged_id = prepared.merged.stripe_id;
    let mut metrics = ChunkMetrics::default();

    let global_start = Instant::now();
    let recompute_result = run_recompute(
        proxies,
        merged_id,
        RecalcStep::Global,
        None,
        &prepared.block_location,
        prepared.schema.partial_decoding,
        prepared.global_cluster,
        placement::global_block_key(merged_id, 0),
        prepared.global_node_endpoint.clone(),
        poll,
    )
    .await;
    metrics.global_recompute_secs = global_start.elapsed().as_secs_f64();
    if let Err(e) = recompute_result {
        rollback_chunk(&mut tables.lock(), &prepared.merged);
        return Err(e);
    }

    for group in 0..prepared.schema.l {
        let start = Instant::now();
        let result = run_recompute(
            proxies,
            merged_id,
            RecalcStep::Local,
            Some(group),
            &prepared.parity_location[group as usize],
            prepared.schema.partial_decoding,
            prepared.local_clusters[group as usize],
            placement::local_block_key(merged_id, group),
            prepared.local_node_endpoints[group as usize].clone(),
            poll,
        )
        .await;
        metrics.local_recompute_secs += start.elapsed().as_secs_f64();
        if let Err(e) = result {
            rollback_chunk(&mut tables.lock(), &prepared.merged);
            return Err(e);
        }
    }

    if let Err(e) = delete_old_parities(proxies, &prepared.sources).await {
        rollback_chunk(&mut tables.lock(), &prepared.merged);
        return Err(e);
    }

    let reloc_start = Instant::now();
    let mut all_moves = Vec::new();
    {
        let mut t = tables.lock();
        match enforce_i4(&mut t, &mut prepared.merged) {
            Ok(moves) => all_moves.extend(moves),
            Err(e) => {
                rollback_chunk(&mut t, &prepared.merged);
                return Err(e);
            }
        }
        match enforce_local_compactness(&mut t, &mut prepared.merged) {
            Ok(moves) => all_moves.extend(moves),
            Err(e) => {
                rollback_chunk(&mut t, &prepared.merged);
                return Err(e);
            }
        }
        prepared.merged.place2clusters = prepared.merged.blocks.iter().map(|b| b.map2cluster).collect();
    }

    if !all_moves.is_empty() {
        let target = prepared
            .merged
            .place2clusters
            .iter()
            .next()
            .copied()
            .expect("a stripe with moves has at least one resident cluster");
        let reloc_result = async {
            let proxy = proxies.get(target)?;
            proxy
                .block_reloc(RelocPlan {
                    stripe_id: merged_id,
                    moves: all_moves,
                })
                .await?;
            poll_check_step(proxy.as_ref(), RecalcStep::Reloc, poll).await
        }
        .await;
        if let Err(e) = reloc_result {
            rollback_chunk(&mut tables.lock(), &prepared.merged);
            return Err(e);
        }
    }
    metrics.relocation_secs = reloc_start.elapsed().as_secs_f64();

    {
        let mut t = tables.lock();
        for source in &prepared.sources {
            crate::commit::purge_stripe(&mut t, source.stripe_id);
        }
        t.stripes.insert(merged_id, prepared.merged);
    }

    Ok((merged_id, metrics))
}

/// `requestMerge`: one merge pass over every existing merge group, in
/// chunks of `step` stripes.
#[instrument(skip(tables, proxies, events))]
pub async fn request_merge(
    tables: &Arc<Mutex<Tables>>,
    proxies: &ProxyPool,
    events: &dyn EventPublisher,
    step: u32,
    poll: &PollConfig,
) -> MergeOutcome {
    let (schema, stripe_count, merge_groups, merge_degree) = {
        let t = tables.lock();
        let Ok(schema) = t.schema() else {
            return MergeOutcome::default();
        };
        (schema, t.stripes.len(), t.merge_groups.clone(), t.merge_degree)
    };

    if let Err(reason) = precondition_step(&schema, stripe_count, &merge_groups, merge_degree, step) {
        warn!(reason, "requestMerge precondition failed");
        return MergeOutcome::default();
    }

    let mut outcome = MergeOutcome::default();
    let mut next_merge_groups: Vec<StripeId> = Vec::new();
    let mut any_merged = false;

    for group in &merge_groups {
        for chunk in group.chunks(step as usize) {
            if chunk.len() < step as usize {
                continue;
            }
            match merge_one_chunk(tables, proxies, chunk, poll).await {
                Ok((merged_id, metrics)) => {
                    any_merged = true;
                    outcome.local_recompute_secs += metrics.local_recompute_secs;
                    outcome.global_recompute_secs += metrics.global_recompute_secs;
                    outcome.relocation_secs += metrics.relocation_secs;
                    next_merge_groups.push(merged_id);
                    events
                        .publish(DomainEvent::MergeChunkCompleted {
                            merged_stripe_id: merged_id,
                            source_stripes: chunk.to_vec(),
                            local_recompute_ms: (metrics.local_recompute_secs * 1000.0) as u64,
                            global_recompute_ms: (metrics.global_recompute_secs * 1000.0) as u64,
                            relocation_ms: (metrics.relocation_secs * 1000.0) as u64,
                            timestamp: chrono::Utc::now(),
                        })
                        .await
                        .ok();
                }
                Err(e) => {
                    error!(error = %e, stripes = ?chunk, "merge chunk aborted");
                    events
                        .publish(DomainEvent::MergeChunkAborted {
                            source_stripes: chunk.to_vec(),
                            reason: e.to_string(),
                            timestamp: chrono::Utc::now(),
                        })
                        .await
                        .ok();
                }
            }
        }
    }

    if any_merged {
        let mut t = tables.lock();
        let x = schema.x;
        t.merge_groups.clear();
        for merged_id in next_merge_groups {
            t.push_to_merge_group(x, merged_id);
        }
        t.merge_degree += 1;
    }
    outcome.merged = any_merged;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockProxyClient;
    use crate::domain::model::{Cluster, EncodeType, MultiStripePlacement, Node, SingleStripePlacement};
    use crate::domain::ports::ProxyClient as _;
    use std::collections::HashMap as Map;
    use std::sync::Arc as StdArc;

    fn schema() -> EcSchema {
        EcSchema {
            k: 8,
            g: 2,
            l: 2,
            b: 4,
            x: 2,
            encode_type: EncodeType::AzureLrc,
            single_stripe_placement: SingleStripePlacement::Optimal,
            multi_stripe_placement: MultiStripePlacement::Dis,
            partial_decoding: false,
        }
    }

    fn topology(num_clusters: u32, nodes_per_cluster: u32) -> (Map<ClusterId, Cluster>, Map<NodeId, Node>) {
        let mut clusters = Map::new();
        let mut nodes = Map::new();
        let mut next_node = 0u32;
        for c in 0..num_clusters {
            let mut node_ids = Vec::new();
            for _ in 0..nodes_per_cluster {
                nodes.insert(
                    next_node,
                    Node {
                        node_id: next_node,
                        endpoint: format!("10.0.0.{next_node}:9000"),
                        cluster_id: c,
                        stripe_block_counts: Map::new(),
                    },
                );
                node_ids.push(next_node);
                next_node += 1;
            }
            clusters.insert(
                c,
                Cluster {
                    cluster_id: c,
                    proxy_endpoint: format!("10.1.0.{c}:9100"),
                    node_ids,
                    blocks: Vec::new(),
                    stripes: Default::default(),
                },
            );
        }
        (clusters, nodes)
    }

    fn mock_pool(cluster_ids: impl Iterator<Item = ClusterId>) -> ProxyPool {
        let mut stubs: Map<ClusterId, StdArc<dyn ProxyClient>> = Map::new();
        for c in cluster_ids {
            let mock = StdArc::new(MockProxyClient::new());
            mock.set_step_done(true);
            stubs.insert(c, mock);
        }
        ProxyPool::from_stubs(stubs)
    }

    /// Scenario S3: requestMerge(s=2) on a DIS-placed pair of stripes
    /// merges them into one with k'=16 data, g=2 global, l=2 local blocks.
    #[tokio::test]
    async fn s3_merges_two_stripes_into_one() {
        rng::seed_from_u64(100);
        let (clusters, nodes) = topology(10, 5);
        let cluster_ids: Vec<ClusterId> = clusters.keys().copied().collect();
        let tables = StdArc::new(Mutex::new(Tables::new(clusters, nodes)));
        {
            let mut t = tables.lock();
            t.set_parameter(schema()).unwrap();
            placement::generate_placement(&mut t, "obj1", 4096).unwrap();
            placement::generate_placement(&mut t, "obj2", 4096).unwrap();
        }

        let proxies = mock_pool(cluster_ids.into_iter());
        let events = crate::adapters::InMemoryEventCollector::new();
        let outcome = request_merge(&tables, &proxies, &events, 2, &PollConfig::default()).await;

        assert!(outcome.merged);
        let t = tables.lock();
        assert_eq!(t.stripes.len(), 1);
        let merged = t.stripes.values().next().unwrap();
        assert_eq!(merged.k, 16);
        assert_eq!(merged.g, 2);
        assert_eq!(merged.l, 2);
        assert_eq!(merged.data_blocks().len(), 16);
        for block in &merged.blocks {
            if let Some(cluster) = t.clusters.get(&block.map2cluster) {
                assert!(cluster.blocks.contains(&(merged.stripe_id, block.block_id)));
            }
        }
    }

    /// Scenario S6: an ineligible step size returns merged=false with no
    /// side effects.
    #[tokio::test]
    async fn s6_bad_step_size_is_a_no_op() {
        rng::seed_from_u64(101);
        let (clusters, nodes) = topology(10, 5);
        let cluster_ids: Vec<ClusterId> = clusters.keys().copied().collect();
        let tables = StdArc::new(Mutex::new(Tables::new(clusters, nodes)));
        {
            let mut t = tables.lock();
            t.set_parameter(schema()).unwrap();
            for i in 0..4 {
                placement::generate_placement(&mut t, &format!("obj{i}"), 1024).unwrap();
            }
        }
        let proxies = mock_pool(cluster_ids.into_iter());
        let events = crate::adapters::InMemoryEventCollector::new();
        let outcome = request_merge(&tables, &proxies, &events, 3, &PollConfig::default()).await;
        assert!(!outcome.merged);
        assert_eq!(tables.lock().stripes.len(), 4);
    }

    #[test]
    fn precondition_enforces_first_stage_step_arithmetic() {
        let mut s = schema();
        s.b = 5; // b mod (g+1) = 5 mod 3 = 2, required step = g/2 = 1
        assert!(precondition_step(&s, 4, &[vec![0, 1, 2, 3]], 0, 1).is_ok());
        assert!(precondition_step(&s, 4, &[vec![0, 1, 2, 3]], 0, 2).is_err());
        // Later stages drop the arithmetic refinement.
        assert!(precondition_step(&s, 4, &[vec![0, 1, 2, 3]], 1, 2).is_ok());
    }
}
