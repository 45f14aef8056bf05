//! Request context pooling.
//!
//! Contexts are handed out reset for the incoming request and go back to the
//! free list when the guard drops, which also happens while unwinding from a
//! panicking handler. At most `max_idle` contexts are kept.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use crate::app::{lock, Services};
use crate::context::Context;
use crate::http::Request;

pub(crate) struct ContextPool {
    free: Mutex<Vec<Box<Context>>>,
    max_idle: usize,
}

impl ContextPool {
    pub(crate) fn new(max_idle: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    /// Takes an idle context, or allocates one, and resets it for `request`.
    pub(crate) fn acquire(&self, request: Request, services: Arc<Services>) -> PooledContext<'_> {
        let idle = lock(&self.free).pop();
        let context = match idle {
            Some(mut context) => {
                context.reset(request, services);
                context
            }
            None => Box::new(Context::with_services(request, services)),
        };
        PooledContext {
            pool: self,
            context: Some(context),
        }
    }

    fn release(&self, mut context: Box<Context>) {
        context.release();
        let mut free = lock(&self.free);
        if free.len() < self.max_idle {
            free.push(context);
        }
    }

    /// Number of contexts waiting for reuse.
    pub(crate) fn idle(&self) -> usize {
        lock(&self.free).len()
    }
}

/// A context on loan from a [`ContextPool`].
pub(crate) struct PooledContext<'a> {
    pool: &'a ContextPool,
    context: Option<Box<Context>>,
}

impl Deref for PooledContext<'_> {
    type Target = Context;

    fn deref(&self) -> &Context {
        // Only `drop` takes the context out.
        self.context.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledContext<'_> {
    fn deref_mut(&mut self) -> &mut Context {
        self.context.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledContext<'_> {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            self.pool.release(context);
        }
    }
}
