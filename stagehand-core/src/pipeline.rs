//! Stage pipelines: a stage's sources bound to its handler.
//!
//! A pipeline is what thread managers drive. Each invocation of
//! [`StagePipeline::run_once`] drains every source and hands the events to the
//! stage's [`EventHandler`]. A pipeline is never run by two workers at once.
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    error::Error,
    event::{BoxedEvent, EventType},
    handler::StageHandler,
    queue::Source,
    AnyResult,
};

/// Receives the events dequeued by a pipeline.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: BoxedEvent);

    fn handle_events(&self, events: Vec<BoxedEvent>) {
        for event in events {
            self.handle_event(event);
        }
    }

    fn initialize(&self) -> AnyResult<()> {
        Ok(())
    }

    fn dispose(&self) {}
}

/// Delivers every event to one handler, one at a time or batched according
/// to the handler's entry.
pub struct DirectHandler {
    handler: Arc<StageHandler>,
}

impl DirectHandler {
    pub fn new(handler: Arc<StageHandler>) -> Self {
        Self { handler }
    }
}

impl EventHandler for DirectHandler {
    fn handle_event(&self, event: BoxedEvent) {
        self.handler.handle(event);
    }

    fn handle_events(&self, events: Vec<BoxedEvent>) {
        self.handler.handle_batch(events);
    }
}

/// Routes each event to the handler bound to its type or, failing that, to
/// its nearest ancestor type.
///
/// Lookups are cached per concrete type, including misses, so an unmatched
/// type is reported only once. A batch is split into one group per handler,
/// keeping the relative order of the events inside each group.
pub struct MappedHandler {
    stage: String,
    handlers: HashMap<&'static str, Arc<StageHandler>>,
    resolved: Mutex<HashMap<&'static str, Option<Arc<StageHandler>>>>,
    unmatched: AtomicUsize,
}

impl MappedHandler {
    pub fn new(stage: impl Into<String>, handlers: Vec<Arc<StageHandler>>) -> Result<Self, Error> {
        let stage = stage.into();
        let mut table = HashMap::with_capacity(handlers.len());
        for handler in handlers {
            let accepts = handler.accepts().name();
            if table.insert(accepts, handler).is_some() {
                return Err(Error::ConflictingHandlers {
                    stage,
                    event: accepts,
                });
            }
        }
        Ok(Self {
            stage,
            handlers: table,
            resolved: Mutex::new(HashMap::new()),
            unmatched: AtomicUsize::new(0),
        })
    }

    /// Number of distinct event types that found no handler so far.
    pub fn unmatched_types(&self) -> usize {
        self.unmatched.load(Ordering::Relaxed)
    }

    fn resolve(&self, event_type: &'static EventType) -> Option<Arc<StageHandler>> {
        let mut resolved = self.resolved.lock();
        if let Some(hit) = resolved.get(event_type.name()) {
            return hit.clone();
        }
        let found = event_type
            .ancestors()
            .find_map(|t| self.handlers.get(t.name()).cloned());
        if found.is_none() {
            self.unmatched.fetch_add(1, Ordering::Relaxed);
            warn!(
                stage = %self.stage,
                "no handler for events of type {event_type}, dropping them"
            );
        }
        resolved.insert(event_type.name(), found.clone());
        found
    }
}

impl EventHandler for MappedHandler {
    fn handle_event(&self, event: BoxedEvent) {
        if let Some(handler) = self.resolve(event.event_type()) {
            handler.handle(event);
        }
    }

    fn handle_events(&self, events: Vec<BoxedEvent>) {
        let mut pending = events;
        while !pending.is_empty() {
            let before = pending.len();
            let handler = self.resolve(pending[0].event_type());
            let (matched, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|event| {
                match (self.resolve(event.event_type()), &handler) {
                    (Some(h), Some(handler)) => Arc::ptr_eq(&h, handler),
                    (None, None) => true,
                    _ => false,
                }
            });
            pending = rest;
            if let Some(handler) = handler {
                handler.handle_batch(matched);
            }
            if pending.len() == before {
                warn!(
                    stage = %self.stage,
                    remaining = pending.len(),
                    "dispatch made no progress, dropping the remaining events"
                );
                break;
            }
        }
    }
}

pub struct StagePipeline {
    name: String,
    sources: Vec<Arc<dyn Source>>,
    handler: Box<dyn EventHandler>,
    running: Mutex<()>,
}

impl StagePipeline {
    pub fn new(
        name: impl Into<String>,
        sources: Vec<Arc<dyn Source>>,
        handler: Box<dyn EventHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            sources,
            handler,
            running: Mutex::new(()),
        }
    }

    /// Picks direct delivery for a single handler, type dispatch otherwise.
    pub fn for_handlers(
        name: impl Into<String>,
        sources: Vec<Arc<dyn Source>>,
        mut handlers: Vec<Arc<StageHandler>>,
    ) -> Result<Self, Error> {
        let name = name.into();
        let handler: Box<dyn EventHandler> = match handlers.len() {
            0 => return Err(Error::NoHandlers(name)),
            1 => Box::new(DirectHandler::new(handlers.remove(0))),
            _ => Box::new(MappedHandler::new(name.clone(), handlers)?),
        };
        Ok(Self::new(name, sources, handler))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initialize(&self) -> AnyResult<()> {
        debug!(stage = %self.name, "initializing pipeline");
        self.handler.initialize()
    }

    pub fn dispose(&self) {
        self.handler.dispose();
    }

    /// Drains every source once. Returns the number of events handled, zero if
    /// another worker is currently running this pipeline.
    pub fn run_once(&self) -> usize {
        self.run_once_unless(&AtomicBool::new(false))
    }

    /// Like [`run_once`](Self::run_once), handling nothing once `retired` is
    /// set. The flag is read while holding the run guard, so an invocation
    /// that starts after [`wait_idle`](Self::wait_idle) returned sees it.
    pub(crate) fn run_once_unless(&self, retired: &AtomicBool) -> usize {
        let Some(_running) = self.running.try_lock() else {
            return 0;
        };
        if retired.load(Ordering::Acquire) {
            return 0;
        }
        let mut handled = 0;
        for source in &self.sources {
            let events = source.dequeue_all();
            if events.is_empty() {
                continue;
            }
            handled += events.len();
            self.handler.handle_events(events);
        }
        handled
    }

    /// Blocks until no invocation of this pipeline is in flight.
    pub fn wait_idle(&self) {
        drop(self.running.lock());
    }

    /// Events waiting in the pipeline's sources.
    pub fn backlog(&self) -> usize {
        self.sources.iter().map(|s| s.size()).sum()
    }
}

impl fmt::Debug for StagePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sources: Vec<_> = self.sources.iter().map(|s| s.name()).collect();
        f.debug_struct("StagePipeline")
            .field("name", &self.name)
            .field("sources", &sources)
            .finish()
    }
}
