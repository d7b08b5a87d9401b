use std::sync::Arc;

use qrelay_provider_core::{AdapterRegistry, TokenCounter};

use crate::providers::workflow::WorkflowAdapter;

pub fn register_builtin_adapters(
    registry: &mut AdapterRegistry,
    counter: Arc<dyn TokenCounter>,
    workflow_debug: bool,
) {
    registry.register(Arc::new(WorkflowAdapter::new(counter, workflow_debug)));
}
