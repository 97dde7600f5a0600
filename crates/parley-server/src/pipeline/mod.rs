//! Ordered chain of cross-cutting stages around a request handler.
//!
//! Every request type goes through the same [`Pipeline`]. A stage receives
//! the context, the request and a [`Next`] continuation; it either calls
//! `next.run(..)` or short-circuits with its own result. The standard chain,
//! outer to inner, is containment → validation → timing → handler.

mod containment;
mod timing;
mod validation;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use parley_shared::protocol::FieldError;
use parley_shared::types::ConversationId;
use parley_shared::ChatError;

use crate::context::RequestContext;
use crate::identity::IdentityProvider;

pub use containment::ContainmentStage;
pub(crate) use containment::panic_message;
pub use timing::TimingStage;
pub use validation::{ValidationRules, ValidationStage};

/// A request the pipeline can carry.
pub trait Request: Send + 'static {
    type Response: Send + 'static;

    /// Name used in logs and spans.
    const NAME: &'static str;

    /// Field rules. Every failure is returned, not just the first.
    fn validate(&self, _rules: &ValidationRules) -> Vec<FieldError> {
        Vec::new()
    }

    /// Conversation the caller must own, if any.
    fn conversation_id(&self) -> Option<ConversationId> {
        None
    }
}

/// Innermost element of the chain.
#[async_trait]
pub trait Handler<R: Request>: Send + Sync {
    async fn handle(&self, ctx: &RequestContext, req: R) -> Result<R::Response, ChatError>;
}

#[async_trait]
pub trait Stage<R: Request>: Send + Sync {
    async fn call(
        &self,
        ctx: &RequestContext,
        req: R,
        next: Next<'_, R>,
    ) -> Result<R::Response, ChatError>;
}

/// The remainder of the chain after the current stage.
pub struct Next<'a, R: Request> {
    stages: &'a [Arc<dyn Stage<R>>],
    handler: &'a dyn Handler<R>,
}

impl<'a, R: Request> Next<'a, R> {
    pub fn run(
        self,
        ctx: &'a RequestContext,
        req: R,
    ) -> BoxFuture<'a, Result<R::Response, ChatError>> {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.call(
                ctx,
                req,
                Next {
                    stages: rest,
                    handler: self.handler,
                },
            ),
            None => self.handler.handle(ctx, req),
        }
    }
}

pub struct Pipeline<R: Request> {
    stages: Vec<Arc<dyn Stage<R>>>,
    handler: Arc<dyn Handler<R>>,
}

impl<R: Request> Clone for Pipeline<R> {
    fn clone(&self) -> Self {
        Self {
            stages: self.stages.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<R: Request> Pipeline<R> {
    /// A pipeline with no stages.
    pub fn new(handler: Arc<dyn Handler<R>>) -> Self {
        Self {
            stages: Vec::new(),
            handler,
        }
    }

    /// Append a stage inside the ones already added.
    pub fn stage(mut self, stage: impl Stage<R> + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// containment → validation → timing → handler
    pub fn standard(
        handler: Arc<dyn Handler<R>>,
        identity: Arc<dyn IdentityProvider>,
        rules: ValidationRules,
        slow_threshold: Duration,
    ) -> Self {
        Self::new(handler)
            .stage(ContainmentStage)
            .stage(ValidationStage::new(identity, rules))
            .stage(TimingStage::new(slow_threshold))
    }

    pub async fn execute(&self, ctx: &RequestContext, req: R) -> Result<R::Response, ChatError> {
        Next {
            stages: &self.stages,
            handler: self.handler.as_ref(),
        }
        .run(ctx, req)
        .await
    }
}
