use crate::error::{CohortError, CohortResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cooperative cancellation signal shared between a request and the store running its query.
///
/// Clones observe the same flag. A token trips when [`cancel`](Self::cancel) is called on it (or
/// any clone), when its deadline passes, or when its parent trips.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<CancelToken>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                deadline: Instant::now().checked_add(timeout),
                ..Inner::default()
            }),
        }
    }

    /// A token that trips with `self`, and additionally after `timeout` if one is given.
    pub fn child(&self, timeout: Option<Duration>) -> CancelToken {
        match timeout {
            None => self.clone(),
            Some(timeout) => Self {
                inner: Arc::new(Inner {
                    cancelled: AtomicBool::new(false),
                    deadline: Instant::now().checked_add(timeout),
                    parent: Some(self.clone()),
                }),
            },
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        if self.inner.deadline.is_some_and(|d| Instant::now() >= d) {
            return true;
        }
        self.inner
            .parent
            .as_ref()
            .is_some_and(CancelToken::is_cancelled)
    }

    pub fn check(&self) -> CohortResult<()> {
        if self.is_cancelled() {
            Err(CohortError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(matches!(token.check(), Err(CohortError::Cancelled)));
    }

    #[test]
    fn child_trips_with_parent_or_its_own_deadline() {
        let parent = CancelToken::new();
        let child = parent.child(Some(Duration::from_secs(3600)));
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());

        let expired = CancelToken::new().child(Some(Duration::ZERO));
        assert!(expired.is_cancelled());

        // Cancelling a child leaves the parent alone.
        let parent = CancelToken::new();
        parent.child(Some(Duration::from_secs(60))).cancel();
        assert!(!parent.is_cancelled());
    }
}
