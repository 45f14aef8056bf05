//! Middleware chain composition.
//!
//! A chain wraps a terminal handler with middleware from the last to the
//! first, so the first-registered middleware is outermost: it runs first on
//! the way in and last on the way out.

use std::sync::OnceLock;

use crate::handler::{Handler, Middleware};

/// Composes `middleware` around `terminal`.
pub(crate) fn build(middleware: &[Middleware], terminal: Handler) -> Handler {
    middleware
        .iter()
        .rev()
        .fold(terminal, |next, middleware| middleware.handle(next))
}

/// A lazily built chain for one scope (the default router or one host).
///
/// A cache is never reset in place. Invalidation publishes a fresh, empty
/// cache next to the new middleware list, and dispatches still holding the
/// old snapshot keep using the old chain.
#[derive(Debug, Default)]
pub(crate) struct ChainCache {
    head: OnceLock<Handler>,
}

impl ChainCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the cached chain, building it on first use.
    pub(crate) fn get_or_build(&self, build: impl FnOnce() -> Handler) -> Handler {
        self.head.get_or_init(build).clone()
    }

    pub(crate) fn is_built(&self) -> bool {
        self.head.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::http::Request;
    use std::sync::{Arc, Mutex};

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> Middleware {
        let log = log.clone();
        Middleware::from_fn(move |c: &mut Context, next: &Handler| {
            log.lock().unwrap().push(format!("{label}>"));
            let result = next.handle(c);
            log.lock().unwrap().push(format!("<{label}"));
            result
        })
    }

    /// Tests onion ordering: first registered runs first and finishes last.
    #[test]
    fn test_build_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let terminal = {
            let log = log.clone();
            Handler::from_fn(move |_c: &mut Context| {
                log.lock().unwrap().push("handler".to_owned());
                Ok(())
            })
        };

        let chain = build(&[recorder(&log, "mw1"), recorder(&log, "mw2")], terminal);
        chain.handle(&mut Context::new(Request::default())).unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["mw1>", "mw2>", "handler", "<mw2", "<mw1"]
        );
    }

    /// Tests that the cache builds once.
    #[test]
    fn test_cache_builds_once() {
        let cache = ChainCache::new();
        assert!(!cache.is_built());

        let builds = Arc::new(Mutex::new(0));
        for _ in 0..3 {
            let builds = builds.clone();
            cache.get_or_build(move || {
                *builds.lock().unwrap() += 1;
                Handler::from_fn(|_c: &mut Context| Ok(()))
            });
        }

        assert!(cache.is_built());
        assert_eq!(*builds.lock().unwrap(), 1);
    }
}
