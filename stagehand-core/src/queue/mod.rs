//! Stage queues.
//!
//! A [`Queue`] is the hand-off point between stages. Producers see it through the
//! [`Sink`] trait, the owning stage's pipeline drains it through [`Source`].
//! Capacity accounting covers both visible elements and reservations taken with
//! [`Sink::prepare_enqueue`], so a reserved slot can never be stolen by a
//! concurrent producer.
use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex, RwLock};
use service_async::MakeService;

use crate::{
    config::{QueueConfig, QueueKind},
    error::{Error, SinkError},
    event::BoxedEvent,
};

pub mod predicate;

pub use predicate::{EnqueuePredicate, RateLimitingPredicate, ThresholdPredicate};

pub type SinkRef = Arc<dyn Sink>;

/// Producer side of a queue.
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueues one element, handing it back on failure.
    fn offer(&self, event: BoxedEvent) -> Result<(), Rejected>;

    /// Reserves room for `events` without making them visible to consumers.
    ///
    /// The predicate, if any, is evaluated before the reservation is taken.
    fn prepare_enqueue(&self, events: Vec<BoxedEvent>) -> Result<PreparedEnqueue, SinkError>;

    fn size(&self) -> usize;

    /// `None` for queues without a capacity limit.
    fn capacity(&self) -> Option<usize>;

    fn enqueue(&self, event: BoxedEvent) -> Result<(), SinkError> {
        self.offer(event).map_err(|rejected| rejected.error)
    }

    /// All-or-nothing: either every element is queued or none is.
    fn enqueue_many(&self, events: Vec<BoxedEvent>) -> Result<(), SinkError> {
        if events.is_empty() {
            return Ok(());
        }
        self.prepare_enqueue(events)?.commit()
    }

    fn try_enqueue(&self, event: BoxedEvent) -> bool {
        self.offer(event).is_ok()
    }
}

impl fmt::Debug for dyn Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sink").field(&self.name()).finish()
    }
}

/// Consumer side of a queue.
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    fn dequeue(&self) -> Option<BoxedEvent>;

    fn dequeue_many(&self, max: usize) -> Vec<BoxedEvent>;

    fn dequeue_all(&self) -> Vec<BoxedEvent>;

    fn size(&self) -> usize;
}

/// An element refused by [`Sink::offer`], returned to its producer.
pub struct Rejected {
    pub error: SinkError,
    pub event: BoxedEvent,
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .field("event", &self.event.event_type())
            .finish()
    }
}

/// Hook run around every dequeue of a queue.
///
/// With an interceptor installed the queue no longer blocks on its own when it
/// is empty; `before` is expected to wait for work instead (for instance by
/// polling a selector and feeding readiness events back into the queue).
pub trait DequeueInterceptor: Send + Sync {
    fn before(&self, queue: &Queue);

    fn after(&self, _queue: &Queue) {}

    /// Called after elements have been published to the queue.
    fn notify(&self) {}
}

#[derive(Clone, Default)]
pub struct QueueOptions {
    pub capacity: Option<usize>,
    /// How long an empty dequeue may block. Zero never blocks.
    pub timeout: Duration,
    pub predicate: Option<Arc<dyn EnqueuePredicate>>,
}

#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    name: String,
    capacity: Option<usize>,
    timeout: Duration,
    predicate: Option<Arc<dyn EnqueuePredicate>>,
    state: Mutex<QueueState>,
    not_empty: Condvar,
    interceptor: RwLock<Option<Arc<dyn DequeueInterceptor>>>,
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<BoxedEvent>,
    reserved: usize,
    closed: bool,
}

impl Queue {
    pub fn bounded(name: impl Into<String>, capacity: usize) -> Self {
        Self::with_options(
            name,
            QueueOptions {
                capacity: Some(capacity),
                ..Default::default()
            },
        )
    }

    pub fn unbounded(name: impl Into<String>) -> Self {
        Self::with_options(name, QueueOptions::default())
    }

    pub fn with_options(name: impl Into<String>, options: QueueOptions) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                capacity: options.capacity,
                timeout: options.timeout,
                predicate: options.predicate,
                state: Mutex::new(QueueState::default()),
                not_empty: Condvar::new(),
                interceptor: RwLock::new(None),
            }),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    #[inline]
    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// Visible elements only; outstanding reservations are not counted.
    pub fn size(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Refuses further enqueues. Queued elements can still be drained.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.inner.not_empty.notify_all();
    }

    pub fn set_dequeue_interceptor(&self, interceptor: Arc<dyn DequeueInterceptor>) {
        *self.inner.interceptor.write() = Some(interceptor);
    }

    pub fn clear_dequeue_interceptor(&self) {
        self.inner.interceptor.write().take();
    }

    pub fn as_sink(&self) -> SinkRef {
        Arc::new(self.clone())
    }

    pub fn same_queue(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Takes room for `count` elements, checking closure, capacity and
    /// predicate in that order.
    pub(crate) fn reserve(&self, count: usize) -> Result<Reservation, SinkError> {
        let mut state = self.inner.state.lock();
        self.admit(&state, count)?;
        state.reserved += count;
        Ok(Reservation {
            queue: self.clone(),
            count,
            settled: false,
        })
    }

    fn admit(&self, state: &QueueState, incoming: usize) -> Result<(), SinkError> {
        if state.closed {
            return Err(SinkError::Closed {
                sink: self.inner.name.clone(),
            });
        }
        let queued = state.items.len() + state.reserved;
        if let Some(capacity) = self.inner.capacity {
            if queued + incoming > capacity {
                return Err(SinkError::Full {
                    sink: self.inner.name.clone(),
                });
            }
        }
        if let Some(predicate) = &self.inner.predicate {
            if !predicate.accept(incoming, queued) {
                return Err(SinkError::Denied {
                    sink: self.inner.name.clone(),
                });
            }
        }
        Ok(())
    }

    fn publish_reserved(&self, count: usize, events: Vec<BoxedEvent>) -> Result<(), SinkError> {
        let mut state = self.inner.state.lock();
        state.reserved = state.reserved.saturating_sub(count);
        if state.closed {
            if let Some(predicate) = &self.inner.predicate {
                predicate.refund(count);
            }
            return Err(SinkError::Closed {
                sink: self.inner.name.clone(),
            });
        }
        state.items.extend(events);
        drop(state);
        self.published();
        Ok(())
    }

    fn release(&self, count: usize) {
        let mut state = self.inner.state.lock();
        state.reserved = state.reserved.saturating_sub(count);
        if let Some(predicate) = &self.inner.predicate {
            predicate.refund(count);
        }
    }

    fn published(&self) {
        self.inner.not_empty.notify_all();
        let interceptor = self.inner.interceptor.read().clone();
        if let Some(interceptor) = interceptor {
            interceptor.notify();
        }
    }

    fn take(&self, max: usize) -> Vec<BoxedEvent> {
        let interceptor = self.inner.interceptor.read().clone();
        if let Some(interceptor) = &interceptor {
            interceptor.before(self);
        }

        let mut state = self.inner.state.lock();
        if state.items.is_empty()
            && interceptor.is_none()
            && !state.closed
            && !self.inner.timeout.is_zero()
        {
            self.inner
                .not_empty
                .wait_for(&mut state, self.inner.timeout);
        }
        let n = max.min(state.items.len());
        let taken: Vec<_> = state.items.drain(..n).collect();
        drop(state);

        if let Some(interceptor) = &interceptor {
            interceptor.after(self);
        }
        taken
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl Sink for Queue {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn offer(&self, event: BoxedEvent) -> Result<(), Rejected> {
        let mut state = self.inner.state.lock();
        if let Err(error) = self.admit(&state, 1) {
            return Err(Rejected { error, event });
        }
        state.items.push_back(event);
        drop(state);
        self.published();
        Ok(())
    }

    fn prepare_enqueue(&self, events: Vec<BoxedEvent>) -> Result<PreparedEnqueue, SinkError> {
        let reservation = self.reserve(events.len())?;
        Ok(PreparedEnqueue::new(vec![(reservation, events)]))
    }

    fn size(&self) -> usize {
        Queue::size(self)
    }

    fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }
}

impl Source for Queue {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn dequeue(&self) -> Option<BoxedEvent> {
        self.take(1).pop()
    }

    fn dequeue_many(&self, max: usize) -> Vec<BoxedEvent> {
        self.take(max)
    }

    fn dequeue_all(&self) -> Vec<BoxedEvent> {
        self.take(usize::MAX)
    }

    fn size(&self) -> usize {
        Queue::size(self)
    }
}

/// Room held in one queue on behalf of a [`PreparedEnqueue`].
pub(crate) struct Reservation {
    queue: Queue,
    count: usize,
    settled: bool,
}

impl Reservation {
    fn publish(mut self, events: Vec<BoxedEvent>) -> Result<(), SinkError> {
        self.settled = true;
        self.queue.publish_reserved(self.count, events)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            self.queue.release(self.count);
        }
    }
}

/// Token of a split-phase enqueue.
///
/// `commit` publishes the reserved elements in order, `abort` releases the
/// room and refunds the queue's predicate. Dropping the token without either
/// aborts it.
#[must_use = "a prepared enqueue holds queue capacity until committed or aborted"]
pub struct PreparedEnqueue {
    parts: Vec<(Reservation, Vec<BoxedEvent>)>,
}

impl PreparedEnqueue {
    pub(crate) fn new(parts: Vec<(Reservation, Vec<BoxedEvent>)>) -> Self {
        Self { parts }
    }

    /// Number of reserved elements, summed over every target queue.
    pub fn len(&self) -> usize {
        self.parts.iter().map(|(r, _)| r.count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn commit(self) -> Result<(), SinkError> {
        let mut result = Ok(());
        for (reservation, events) in self.parts {
            if let Err(e) = reservation.publish(events) {
                result = Err(e);
            }
        }
        result
    }

    pub fn abort(self) {}
}

impl fmt::Debug for PreparedEnqueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedEnqueue")
            .field("len", &self.len())
            .finish()
    }
}

/// Builds a stage queue from its configuration.
pub struct QueueBuilder {
    stage: String,
    config: QueueConfig,
}

impl QueueBuilder {
    pub fn new(stage: impl Into<String>, config: QueueConfig) -> Self {
        Self {
            stage: stage.into(),
            config,
        }
    }
}

impl MakeService for QueueBuilder {
    type Service = Queue;
    type Error = Error;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        let invalid = |reason: &str| Error::InvalidQueue {
            stage: self.stage.clone(),
            reason: reason.to_string(),
        };
        let capacity = match (self.config.kind, self.config.capacity) {
            (QueueKind::Bounded, Some(0)) => return Err(invalid("capacity must be at least 1")),
            (QueueKind::Bounded, Some(capacity)) => Some(capacity),
            (QueueKind::Bounded, None) => {
                return Err(invalid("bounded queues need a capacity"))
            }
            (QueueKind::Unbounded, Some(_)) => {
                return Err(invalid("unbounded queues take no capacity"))
            }
            (QueueKind::Unbounded, None) => None,
        };
        let predicate = match &self.config.predicate {
            Some(config) => Some(predicate::build(&self.stage, config)?),
            None => None,
        };
        Ok(Queue::with_options(
            self.stage.clone(),
            QueueOptions {
                capacity,
                timeout: Duration::from_millis(self.config.timeout_ms),
                predicate,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Instant,
    };

    use super::*;
    use crate::{
        config::PredicateConfig,
        test_util::{item, values},
    };

    #[test]
    fn bounded_queue_refuses_past_capacity() {
        let queue = Queue::bounded("q", 2);
        queue.enqueue(item(1)).unwrap();
        queue.enqueue(item(2)).unwrap();
        assert_eq!(
            queue.enqueue(item(3)),
            Err(SinkError::Full { sink: "q".into() })
        );
        assert!(!queue.try_enqueue(item(3)));

        let rejected = queue.offer(item(4)).unwrap_err();
        assert!(rejected.error.is_recoverable());
        assert_eq!(values(vec![rejected.event]), [4]);

        assert_eq!(values(queue.dequeue().into_iter().collect()), [1]);
        queue.enqueue(item(3)).unwrap();
        assert_eq!(values(queue.dequeue_all()), [2, 3]);
    }

    #[test]
    fn dequeue_preserves_fifo_order() {
        let queue = Queue::unbounded("q");
        for i in 0..10 {
            queue.enqueue(item(i)).unwrap();
        }
        assert_eq!(values(queue.dequeue_many(3)), [0, 1, 2]);
        assert_eq!(values(queue.dequeue_all()), [3, 4, 5, 6, 7, 8, 9]);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn enqueue_many_is_all_or_nothing() {
        let queue = Queue::bounded("q", 3);
        queue.enqueue(item(0)).unwrap();
        assert!(queue.enqueue_many(vec![item(1), item(2), item(3)]).is_err());
        assert_eq!(queue.size(), 1);
        queue.enqueue_many(vec![item(1), item(2)]).unwrap();
        assert_eq!(values(queue.dequeue_all()), [0, 1, 2]);
    }

    #[test]
    fn aborted_reservation_leaves_queue_untouched() {
        let queue = Queue::bounded("q", 2);
        let token = queue.prepare_enqueue(vec![item(1), item(2)]).unwrap();
        assert_eq!(token.len(), 2);
        assert_eq!(queue.size(), 0);
        assert!(queue.dequeue().is_none());
        assert!(!queue.try_enqueue(item(9)));

        token.abort();
        assert_eq!(queue.size(), 0);
        queue.enqueue(item(3)).unwrap();
        queue.enqueue(item(4)).unwrap();
        assert_eq!(values(queue.dequeue_all()), [3, 4]);
    }

    #[test]
    fn dropped_reservation_is_released() {
        let queue = Queue::bounded("q", 1);
        {
            let _token = queue.prepare_enqueue(vec![item(1)]).unwrap();
            assert!(!queue.try_enqueue(item(2)));
        }
        assert!(queue.try_enqueue(item(2)));
    }

    #[test]
    fn committed_reservation_keeps_reserved_order() {
        let queue = Queue::bounded("q", 4);
        queue.enqueue(item(0)).unwrap();
        let token = queue.prepare_enqueue(vec![item(1), item(2)]).unwrap();
        queue.enqueue(item(3)).unwrap();
        token.commit().unwrap();
        assert_eq!(values(queue.dequeue_all()), [0, 3, 1, 2]);
        assert!(queue.try_enqueue(item(4)));
    }

    #[test]
    fn closed_queue_refuses_but_drains() {
        let queue = Queue::unbounded("q");
        queue.enqueue(item(1)).unwrap();
        let token = queue.prepare_enqueue(vec![item(2)]).unwrap();
        queue.close();
        assert_eq!(
            queue.enqueue(item(3)),
            Err(SinkError::Closed { sink: "q".into() })
        );
        assert!(token.commit().is_err());
        assert_eq!(values(queue.dequeue_all()), [1]);
    }

    #[test]
    fn threshold_predicate_denies_after_capacity_check() {
        let queue = Queue::with_options(
            "q",
            QueueOptions {
                capacity: Some(3),
                predicate: Some(Arc::new(ThresholdPredicate::new(2))),
                ..Default::default()
            },
        );
        queue.enqueue(item(1)).unwrap();
        queue.enqueue(item(2)).unwrap();
        assert_eq!(
            queue.enqueue(item(3)),
            Err(SinkError::Denied { sink: "q".into() })
        );
        assert!(queue.prepare_enqueue(vec![item(3)]).is_err());
    }

    #[test]
    fn aborted_reservation_refunds_the_rate_limiter() {
        let queue = Queue::with_options(
            "q",
            QueueOptions {
                predicate: Some(Arc::new(RateLimitingPredicate::new(0.001, 1).unwrap())),
                ..Default::default()
            },
        );
        queue.prepare_enqueue(vec![item(1)]).unwrap().abort();
        assert!(queue.try_enqueue(item(2)));
        assert!(!queue.try_enqueue(item(3)));
        assert_eq!(values(queue.dequeue_all()), [2]);
    }

    #[test]
    fn empty_dequeue_waits_for_timeout() {
        let queue = Queue::with_options(
            "q",
            QueueOptions {
                timeout: Duration::from_millis(30),
                ..Default::default()
            },
        );
        let start = Instant::now();
        assert!(queue.dequeue_all().is_empty());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[derive(Default)]
    struct Counting {
        before: AtomicUsize,
        after: AtomicUsize,
        notified: AtomicUsize,
    }

    impl DequeueInterceptor for Counting {
        fn before(&self, _queue: &Queue) {
            self.before.fetch_add(1, Ordering::Relaxed);
        }

        fn after(&self, _queue: &Queue) {
            self.after.fetch_add(1, Ordering::Relaxed);
        }

        fn notify(&self) {
            self.notified.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn interceptor_wraps_dequeue() {
        let queue = Queue::with_options(
            "q",
            QueueOptions {
                timeout: Duration::from_secs(5),
                ..Default::default()
            },
        );
        let counting = Arc::new(Counting::default());
        queue.set_dequeue_interceptor(counting.clone());

        // the interceptor owns blocking, so an empty dequeue returns at once
        let start = Instant::now();
        assert!(queue.dequeue_all().is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));

        queue.enqueue(item(1)).unwrap();
        assert_eq!(values(queue.dequeue_all()), [1]);
        assert_eq!(counting.before.load(Ordering::Relaxed), 2);
        assert_eq!(counting.after.load(Ordering::Relaxed), 2);
        assert_eq!(counting.notified.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn builder_validates_configuration() {
        let build = |config: QueueConfig| QueueBuilder::new("stage", config).make();

        let bounded = build(QueueConfig {
            kind: QueueKind::Bounded,
            capacity: Some(8),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(bounded.capacity(), Some(8));
        assert_eq!(bounded.name(), "stage");

        assert!(matches!(
            build(QueueConfig {
                kind: QueueKind::Bounded,
                ..Default::default()
            }),
            Err(Error::InvalidQueue { .. })
        ));
        assert!(matches!(
            build(QueueConfig {
                capacity: Some(3),
                ..Default::default()
            }),
            Err(Error::InvalidQueue { .. })
        ));
        assert!(matches!(
            build(QueueConfig {
                predicate: Some(PredicateConfig::RateLimiting {
                    target_rate: 0.0,
                    depth: 1
                }),
                ..Default::default()
            }),
            Err(Error::InvalidPredicate { .. })
        ));
    }
}
