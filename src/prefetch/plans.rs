use std::collections::HashMap;
use std::sync::Arc;

use crate::{
    adapters::{FetchPlan, PlanCompiler, PlanId, PlanRequest},
    error::Error,
};

/// Compiled plans reused across passes, keyed by request fingerprint.
#[derive(Debug, Default)]
pub struct PlanCache {
    plans: HashMap<PlanId, Arc<FetchPlan>>,
}

impl PlanCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(
        &mut self,
        request: PlanRequest,
        compiler: &dyn PlanCompiler,
    ) -> Result<Arc<FetchPlan>, Error> {
        let id = request.fingerprint();
        if let Some(plan) = self.plans.get(&id) {
            return Ok(Arc::clone(plan));
        }
        let plan = Arc::new(compiler.compile(&request)?);
        tracing::trace!(plan = %id, target = %request.target, "compiled fetch plan");
        self.plans.insert(id, Arc::clone(&plan));
        Ok(plan)
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}
