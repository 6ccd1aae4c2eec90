//! A scoped stack of teardown steps, unwound in reverse registration order.
//! Step failures are logged and never interrupt the rest of the unwind.

use futures::future::BoxFuture;
use std::future::Future;
use tracing::warn;

#[derive(Default)]
pub(crate) struct TeardownStack {
    steps: Vec<(&'static str, BoxFuture<'static, anyhow::Result<()>>)>,
}

impl TeardownStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push<F>(&mut self, label: &'static str, step: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.steps.push((label, Box::pin(step)));
    }

    pub(crate) async fn unwind(&mut self) {
        while let Some((label, step)) = self.steps.pop() {
            if let Err(error) = step.await {
                warn!(%error, step = label, "Teardown failed");
            }
        }
    }
}
