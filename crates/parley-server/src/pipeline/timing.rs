use std::time::{Duration, Instant};

use async_trait::async_trait;

use parley_shared::ChatError;

use super::{Next, Request, Stage};
use crate::context::RequestContext;

/// Logs how long the inner call took. Never changes the result.
///
/// For streaming requests this covers the time to the first fragment.
pub struct TimingStage {
    threshold: Duration,
}

impl TimingStage {
    pub fn new(threshold: Duration) -> Self {
        Self { threshold }
    }

    fn is_slow(&self, elapsed: Duration) -> bool {
        elapsed > self.threshold
    }
}

#[async_trait]
impl<R: Request> Stage<R> for TimingStage {
    async fn call(
        &self,
        ctx: &RequestContext,
        req: R,
        next: Next<'_, R>,
    ) -> Result<R::Response, ChatError> {
        let started = Instant::now();
        let result = next.run(ctx, req).await;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        if self.is_slow(elapsed) {
            tracing::warn!(
                correlation_id = %ctx.correlation_id,
                request = R::NAME,
                elapsed_ms,
                threshold_ms = self.threshold.as_millis() as u64,
                ok = result.is_ok(),
                "slow request"
            );
        } else {
            tracing::debug!(
                correlation_id = %ctx.correlation_id,
                request = R::NAME,
                elapsed_ms,
                ok = result.is_ok(),
                "request timed"
            );
        }
        result
    }
}
