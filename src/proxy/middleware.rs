//! Request and response modifier chains.
//!
//! A middleware stage receives the next modifier and returns a new one
//! wrapping it. Stages are folded in reverse onto a no-op terminal, so
//! the first registered stage is the outermost wrapper: it runs first on
//! the way in and last on the way out.

use std::sync::{Arc, PoisonError, RwLock};

use http::{Request, Response};
use hyper::body::Bytes;
use tracing::info;

/// Mutates a buffered request in place.
pub type RequestModifier = Arc<dyn Fn(&mut Request<Bytes>) + Send + Sync>;

/// Mutates a buffered response in place; an error aborts the relay.
pub type ResponseModifier =
    Arc<dyn Fn(&mut Response<Bytes>) -> Result<(), MiddlewareError> + Send + Sync>;

/// Wraps a modifier into another one.
pub type Stage<M> = Arc<dyn Fn(M) -> M + Send + Sync>;

pub type RequestMiddleware = Stage<RequestModifier>;
pub type ResponseMiddleware = Stage<ResponseModifier>;

#[derive(Debug, thiserror::Error)]
#[error("response middleware rejected the response: {0}")]
pub struct MiddlewareError(pub String);

/// Terminal request modifier.
pub fn nop_request_modifier() -> RequestModifier {
    Arc::new(|_: &mut Request<Bytes>| {})
}

/// Terminal response modifier.
pub fn nop_response_modifier() -> ResponseModifier {
    Arc::new(|_: &mut Response<Bytes>| Ok(()))
}

/// An append-only list of stages.
///
/// Written during setup, read concurrently afterwards.
pub struct Chain<M> {
    stages: RwLock<Vec<Stage<M>>>,
}

impl<M> Chain<M> {
    pub fn new() -> Self {
        Self {
            stages: RwLock::new(Vec::new()),
        }
    }

    pub fn push(&self, stage: Stage<M>) {
        self.stages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Folds the stages, innermost first, onto `terminal`.
    pub fn compose(&self, terminal: M) -> M {
        let stages = self.stages.read().unwrap_or_else(PoisonError::into_inner);
        stages
            .iter()
            .rev()
            .fold(terminal, |next, stage| stage(next))
    }
}

impl<M> Default for Chain<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs each request before it is forwarded.
pub fn trace_requests() -> RequestMiddleware {
    Arc::new(|next: RequestModifier| -> RequestModifier {
        Arc::new(move |req: &mut Request<Bytes>| {
            info!("--> {} {} ({} bytes)", req.method(), req.uri(), req.body().len());
            next(req);
        })
    })
}

/// Logs each upstream response before it is relayed.
pub fn trace_responses() -> ResponseMiddleware {
    Arc::new(|next: ResponseModifier| -> ResponseModifier {
        Arc::new(move |res: &mut Response<Bytes>| {
            info!("<-- {} ({} bytes)", res.status(), res.body().len());
            next(res)
        })
    })
}
