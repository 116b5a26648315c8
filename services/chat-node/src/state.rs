//! Node context shared across request handlers.

use std::sync::Arc;

use crate::scheduler::Scheduler;

/// Shared node context.
///
/// Built once at startup and passed to both listeners and the registrar.
#[derive(Clone)]
pub struct NodeContext {
    inner: Arc<NodeContextInner>,
}

struct NodeContextInner {
    scheduler: Scheduler,
    app_name: String,
    version: String,
}

impl NodeContext {
    pub fn new(scheduler: Scheduler, app_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(NodeContextInner {
                scheduler,
                app_name: app_name.into(),
                version: version.into(),
            }),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }
}
