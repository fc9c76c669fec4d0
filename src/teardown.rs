//! Release stack
//!
//! Every resource a run acquires registers its release action here at the
//! moment it is acquired. `release_all` unwinds the stack in reverse order,
//! exactly once per action, and keeps going past failures.

use std::future::Future;

use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tracing::{debug, warn};

/// Error returned by a release action
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type ReleaseAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// A release that failed. Logged, never propagated.
#[derive(Error, Debug)]
#[error("Failed to release {resource}: {reason}")]
pub struct TeardownError {
    pub resource: String,
    pub reason: String,
}

struct Release {
    resource: String,
    action: ReleaseAction,
}

/// Ordered release actions for one run
#[derive(Default)]
pub struct ReleaseStack {
    entries: Vec<Release>,
}

impl ReleaseStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register how to release a freshly acquired resource
    pub fn push<F, Fut>(&mut self, resource: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let resource = resource.into();
        debug!("Acquired {}", resource);
        self.entries.push(Release {
            resource,
            action: Box::new(move || action().boxed()),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resources still held, most recent last
    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.resource.as_str())
    }

    /// Run every pending release, newest first. The stack is drained, so a
    /// second call does nothing.
    pub async fn release_all(&mut self) -> Vec<TeardownError> {
        let mut failures = Vec::new();
        while let Some(entry) = self.entries.pop() {
            match (entry.action)().await {
                Ok(()) => debug!("Released {}", entry.resource),
                Err(e) => {
                    let failure = TeardownError {
                        resource: entry.resource,
                        reason: crate::error::describe(e.as_ref()),
                    };
                    warn!("{}", failure);
                    failures.push(failure);
                }
            }
        }
        failures
    }
}

impl Drop for ReleaseStack {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            let leaked: Vec<&str> = self.resources().collect();
            warn!("Dropping release stack with unreleased resources: {}", leaked.join(", "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn record(stack: &mut ReleaseStack, log: &Arc<Mutex<Vec<String>>>, name: &str, fail: bool) {
        let log = Arc::clone(log);
        let name = name.to_string();
        stack.push(name.clone(), move || async move {
            log.lock().unwrap().push(name.clone());
            if fail {
                Err(format!("{} is stuck", name).into())
            } else {
                Ok(())
            }
        });
    }

    #[tokio::test]
    async fn test_releases_in_reverse_order() {
        let log = recorder();
        let mut stack = ReleaseStack::new();
        record(&mut stack, &log, "network", false);
        record(&mut stack, &log, "origin", false);
        record(&mut stack, &log, "gateway", false);
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.resources().last(), Some("gateway"));

        let failures = stack.release_all().await;
        assert!(failures.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["gateway", "origin", "network"]);
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn test_continues_after_failure() {
        let log = recorder();
        let mut stack = ReleaseStack::new();
        record(&mut stack, &log, "network", false);
        record(&mut stack, &log, "origin", true);
        record(&mut stack, &log, "gateway", false);

        let failures = stack.release_all().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].resource, "origin");
        assert_eq!(
            failures[0].to_string(),
            "Failed to release origin: origin is stuck"
        );
        assert_eq!(*log.lock().unwrap(), vec!["gateway", "origin", "network"]);
    }

    #[tokio::test]
    async fn test_releases_exactly_once() {
        let log = recorder();
        let mut stack = ReleaseStack::new();
        record(&mut stack, &log, "workspace", true);

        assert_eq!(stack.release_all().await.len(), 1);
        assert!(stack.release_all().await.is_empty());
        assert_eq!(log.lock().unwrap().len(), 1);
    }
}
