//! An in-memory `ProxyClient` for tests.
//!
//! Unconditionally compiled (not `#[cfg(test)]`): integration tests under
//! `tests/` are a separate crate and link against the library, so test
//! doubles that they need have to be ordinary exported items.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::ports::{
    DecodePlan, DeleteBlockRequest, EncodePlan, HelpRecalcPlan, ProxyClient, RecalcPlan,
    RecalcStep, RelocPlan,
};
use crate::error::Result;

/// Records every call made against it; never fails unless told to.
#[derive(Default)]
pub struct MockProxyClient {
    inner: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    encoded: Vec<EncodePlan>,
    decoded: Vec<DecodePlan>,
    deleted: Vec<DeleteBlockRequest>,
    main_recalcs: Vec<RecalcPlan>,
    help_recalcs: Vec<HelpRecalcPlan>,
    relocs: Vec<RelocPlan>,
    fail_checkalive: bool,
    step_done: bool,
}

impl MockProxyClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_checkalive(&self, fail: bool) {
        self.inner.lock().fail_checkalive = fail;
    }

    /// Toggle the value `check_step` returns; flows like `checkStep`
    /// polling in the real proxy, where a step transitions from
    /// in-progress to done at some point after the triggering RPC lands.
    pub fn set_step_done(&self, done: bool) {
        self.inner.lock().step_done = done;
    }

    pub fn encoded(&self) -> Vec<EncodePlan> {
        self.inner.lock().encoded.clone()
    }

    pub fn decoded(&self) -> Vec<DecodePlan> {
        self.inner.lock().decoded.clone()
    }

    pub fn deleted_count(&self) -> usize {
        self.inner.lock().deleted.len()
    }

    pub fn main_recalcs(&self) -> Vec<RecalcPlan> {
        self.inner.lock().main_recalcs.clone()
    }

    pub fn help_recalcs(&self) -> Vec<HelpRecalcPlan> {
        self.inner.lock().help_recalcs.clone()
    }

    pub fn relocs(&self) -> Vec<RelocPlan> {
        self.inner.lock().relocs.clone()
    }
}

#[async_trait]
impl ProxyClient for MockProxyClient {
    async fn checkalive(&self, name: &str) -> Result<String> {
        if self.inner.lock().fail_checkalive {
            return Err(crate::error::Error::Internal("mock checkalive failure".into()));
        }
        Ok(name.to_string())
    }

    async fn encode_and_set(&self, plan: EncodePlan) -> Result<()> {
        self.inner.lock().encoded.push(plan);
        Ok(())
    }

    async fn decode_and_get(&self, plan: DecodePlan) -> Result<()> {
        self.inner.lock().decoded.push(plan);
        Ok(())
    }

    async fn delete_block(&self, req: DeleteBlockRequest) -> Result<()> {
        self.inner.lock().deleted.push(req);
        Ok(())
    }

    async fn main_recalculate(&self, plan: RecalcPlan) -> Result<()> {
        self.inner.lock().main_recalcs.push(plan);
        Ok(())
    }

    async fn help_recalculate(&self, plan: HelpRecalcPlan) -> Result<()> {
        self.inner.lock().help_recalcs.push(plan);
        Ok(())
    }

    async fn block_reloc(&self, plan: RelocPlan) -> Result<()> {
        self.inner.lock().relocs.push(plan);
        Ok(())
    }

    async fn check_step(&self, _step: RecalcStep) -> Result<bool> {
        Ok(self.inner.lock().step_done)
    }
}
