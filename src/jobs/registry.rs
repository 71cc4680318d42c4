//! The kind→handler capability map the runner dispatches through.
//!
//! Registration is rare and dispatch is frequent, so the table sits behind
//! a `parking_lot::RwLock`: dispatch takes the reader, `register` takes the
//! writer, and registering while `run` is already polling is safe.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;

type BoxedHandler =
    Box<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// A table of job handlers keyed by job kind.
#[derive(Default)]
pub struct JobRegistry {
    handlers: RwLock<HashMap<String, BoxedHandler>>,
}

/// Shared handle to a registry, cloned into the runner and into whichever
/// code registers handlers at startup.
pub type SharedJobRegistry = Arc<JobRegistry>;

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or overwrite) the handler for `kind`. The handler receives
    /// the job's raw payload string; the core never parses it.
    pub fn register<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |payload| Box::pin(handler(payload)));
        self.handlers.write().insert(kind.into(), boxed);
    }

    pub fn is_registered(&self, kind: &str) -> bool {
        self.handlers.read().contains_key(kind)
    }

    pub fn registered_kinds(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    /// Dispatch `payload` to the handler registered for `kind`.
    ///
    /// Returns an error carrying a recognizable `"no handler registered"`
    /// prefix when `kind` has no registration, so callers can distinguish
    /// a missing-handler condition from a handler that itself failed.
    pub async fn dispatch(&self, kind: &str, payload: String) -> Result<()> {
        let fut = {
            let handlers = self.handlers.read();
            let handler = handlers
                .get(kind)
                .ok_or_else(|| anyhow::anyhow!("no handler registered for job kind {kind:?}"))?;
            handler(payload)
        };
        fut.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn register_and_dispatch() {
        let registry = JobRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        registry.register("email", move |_payload| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        assert!(registry.is_registered("email"));
        assert!(!registry.is_registered("sms"));

        registry.dispatch("email", "{}".into()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_without_registration_errors() {
        let registry = JobRegistry::new();
        let err = registry.dispatch("missing", "".into()).await.unwrap_err();
        assert!(err.to_string().contains("no handler registered"));
    }

    #[test]
    fn registered_kinds_lists_all() {
        let registry = JobRegistry::new();
        registry.register("a", |_| async { Ok(()) });
        registry.register("b", |_| async { Ok(()) });
        let mut kinds = registry.registered_kinds();
        kinds.sort();
        assert_eq!(kinds, vec!["a".to_string(), "b".to_string()]);
    }
}
