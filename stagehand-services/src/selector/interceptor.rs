use std::{sync::Arc, time::Duration};

use stagehand_core::{queue::DequeueInterceptor, Queue, Sink};
use tracing::{trace, warn};

use super::Selector;

/// Polls a selector before every dequeue of a socket stage and feeds the
/// resulting [`Readiness`](super::Readiness) events into the stage queue.
///
/// The poll blocks only while the queue is empty, for the queue timeout or
/// `idle_timeout` when the queue has none. A request enqueued meanwhile wakes
/// the selector up through `notify`.
pub struct SelectorInterceptor {
    selector: Arc<Selector>,
    idle_timeout: Duration,
}

impl SelectorInterceptor {
    pub fn new(selector: Arc<Selector>, idle_timeout: Duration) -> Self {
        Self {
            selector,
            idle_timeout,
        }
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    fn timeout(&self, queue: &Queue) -> Duration {
        if queue.size() > 0 {
            Duration::ZERO
        } else if queue.timeout().is_zero() {
            self.idle_timeout
        } else {
            queue.timeout()
        }
    }
}

impl DequeueInterceptor for SelectorInterceptor {
    fn before(&self, queue: &Queue) {
        match self.selector.select(Some(self.timeout(queue))) {
            Ok(ready) => {
                for readiness in ready {
                    // a refused event releases its key when dropped and the
                    // key is selected again on the next cycle
                    if let Err(e) = queue.enqueue(Box::new(readiness)) {
                        trace!(queue = queue.name(), "readiness deferred: {e}");
                    }
                }
            }
            Err(e) => warn!(queue = queue.name(), "select failed: {e}"),
        }
    }

    fn notify(&self) {
        self.selector.wakeup();
    }
}
