use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Counts the unresolved items of one source.
///
/// Every enlisted item holds a [`Ticket`]; the count drops when the ticket is
/// resolved or dropped, so each item is accounted for exactly once no matter
/// which path it leaves the pool by.
#[derive(Debug, Clone, Default)]
pub struct CompletionGroup {
    inner: Arc<GroupInner>,
}

#[derive(Debug, Default)]
struct GroupInner {
    pending: AtomicUsize,
    drained: Notify,
}

impl GroupInner {
    fn resolve_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

impl CompletionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enlist(&self) -> Ticket {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        Ticket {
            group: Some(Arc::clone(&self.inner)),
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Waits until every enlisted ticket is resolved. Only meaningful once no
    /// further items will be enlisted.
    pub async fn wait(&self) {
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// Claim on one unit of a [`CompletionGroup`].
#[derive(Debug)]
pub struct Ticket {
    group: Option<Arc<GroupInner>>,
}

impl Ticket {
    pub fn resolve(mut self) {
        if let Some(group) = self.group.take() {
            group.resolve_one();
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if let Some(group) = self.group.take() {
            group.resolve_one();
        }
    }
}
