use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;

use parley_shared::ChatError;

use super::{Next, Request, Stage};
use crate::context::RequestContext;

/// Outermost stage: nothing past it reaches the transport as a raw fault.
///
/// A panic in an inner stage or the handler, and any `Internal` error, is
/// logged with its cause and replaced by an opaque internal error.
pub struct ContainmentStage;

#[async_trait]
impl<R: Request> Stage<R> for ContainmentStage {
    async fn call(
        &self,
        ctx: &RequestContext,
        req: R,
        next: Next<'_, R>,
    ) -> Result<R::Response, ChatError> {
        match AssertUnwindSafe(next.run(ctx, req)).catch_unwind().await {
            Ok(Err(ChatError::Internal(cause))) => {
                tracing::error!(
                    correlation_id = %ctx.correlation_id,
                    request = R::NAME,
                    %cause,
                    "request failed"
                );
                Err(ChatError::Internal("internal error".into()))
            }
            Ok(result) => result,
            Err(panic) => {
                tracing::error!(
                    correlation_id = %ctx.correlation_id,
                    request = R::NAME,
                    cause = %panic_message(&*panic),
                    "request handler panicked"
                );
                Err(ChatError::Internal("internal error".into()))
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
