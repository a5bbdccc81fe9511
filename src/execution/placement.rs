//! Hybrid placement - splits steps between the local and remote branches

use crate::core::{config::HybridConfig, Step};
use tracing::debug;

/// Steps of one run bucketed by where they execute
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Placement {
    pub local: Vec<Step>,
    pub remote: Vec<Step>,
}

impl Placement {
    pub fn is_local_only(&self) -> bool {
        self.remote.is_empty()
    }

    pub fn is_remote_only(&self) -> bool {
        self.local.is_empty()
    }
}

/// A step runs locally when its type is allowed and its parameters are small
pub fn runs_locally(step: &Step, config: &HybridConfig) -> bool {
    config.local_step_types.iter().any(|t| t == &step.step_type)
        && step.config_size_bytes() <= config.max_local_config_bytes
}

/// Bucket `steps`, keeping declaration order within each bucket
pub fn place(steps: &[Step], config: &HybridConfig) -> Placement {
    let (local, remote): (Vec<Step>, Vec<Step>) = steps
        .iter()
        .cloned()
        .partition(|step| runs_locally(step, config));

    debug!(
        "Hybrid placement: {} local, {} remote",
        local.len(),
        remote.len()
    );
    Placement { local, remote }
}
