//! Application handlers and their binding to stages.
//!
//! A [`StageService`] publishes a table of [`HandlerEntry`]s, one per event type
//! it wants to receive. Configuration binds all or some of those entries to a
//! stage; each binding becomes a [`StageHandler`] which forwards return values
//! and failures to the stage's [`RETURN_SINK`] and [`EXCEPTION_SINK`].
use std::{collections::BTreeMap, fmt, sync::Arc};

use anyhow::anyhow;
use tracing::{debug, error, warn};

use crate::{
    error::Error,
    event::{BoxedEvent, Event, EventType, HandlerFailedEvent},
    queue::{Sink, SinkRef},
    sink_map::{SinkMap, EXCEPTION_SINK, RETURN_SINK},
    AnyResult,
};

pub type HandlerOutput = AnyResult<Option<BoxedEvent>>;

type SingleFn = dyn Fn(BoxedEvent) -> HandlerOutput + Send + Sync;
type BatchFn = dyn Fn(Vec<BoxedEvent>) -> HandlerOutput + Send + Sync;

#[derive(Clone)]
enum Delivery {
    Single(Arc<SingleFn>),
    Batch(Arc<BatchFn>),
}

/// One handler published by a service.
#[derive(Clone)]
pub struct HandlerEntry {
    signature: &'static str,
    accepts: &'static EventType,
    delivery: Delivery,
}

impl HandlerEntry {
    /// Receives events one at a time.
    pub fn single<F>(signature: &'static str, accepts: &'static EventType, f: F) -> Self
    where
        F: Fn(BoxedEvent) -> HandlerOutput + Send + Sync + 'static,
    {
        Self {
            signature,
            accepts,
            delivery: Delivery::Single(Arc::new(f)),
        }
    }

    /// Receives every matching event of one dequeue cycle at once.
    pub fn batch<F>(signature: &'static str, accepts: &'static EventType, f: F) -> Self
    where
        F: Fn(Vec<BoxedEvent>) -> HandlerOutput + Send + Sync + 'static,
    {
        Self {
            signature,
            accepts,
            delivery: Delivery::Batch(Arc::new(f)),
        }
    }

    /// Like [`single`](Self::single), downcasting to the concrete event type.
    pub fn typed<T, F>(signature: &'static str, accepts: &'static EventType, f: F) -> Self
    where
        T: Event,
        F: Fn(T) -> HandlerOutput + Send + Sync + 'static,
    {
        Self::single(signature, accepts, move |event| {
            let event = event
                .downcast::<T>()
                .map_err(|e| anyhow!("{signature} cannot handle {}", e.event_type()))?;
            f(*event)
        })
    }

    /// Like [`batch`](Self::batch); events of another concrete type are dropped.
    pub fn typed_batch<T, F>(signature: &'static str, accepts: &'static EventType, f: F) -> Self
    where
        T: Event,
        F: Fn(Vec<T>) -> HandlerOutput + Send + Sync + 'static,
    {
        Self::batch(signature, accepts, move |events| {
            let mut typed = Vec::with_capacity(events.len());
            for event in events {
                match event.downcast::<T>() {
                    Ok(event) => typed.push(*event),
                    Err(event) => warn!(
                        handler = signature,
                        "dropping event of unexpected type {}",
                        event.event_type()
                    ),
                }
            }
            f(typed)
        })
    }

    #[inline]
    pub fn signature(&self) -> &'static str {
        self.signature
    }

    #[inline]
    pub fn accepts(&self) -> &'static EventType {
        self.accepts
    }

    #[inline]
    pub fn is_batch(&self) -> bool {
        matches!(self.delivery, Delivery::Batch(_))
    }
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("signature", &self.signature)
            .field("accepts", &self.accepts)
            .field("batch", &self.is_batch())
            .finish()
    }
}

/// An application component hosted by one or more stages.
pub trait StageService: Send + Sync + 'static {
    fn handlers(self: Arc<Self>) -> Vec<HandlerEntry>;

    /// Called once, before any stage starts, with the union of the sink maps
    /// of every stage the service is bound to.
    fn initialize(&self, _sinks: &SinkMap) -> AnyResult<()> {
        Ok(())
    }

    fn dispose(&self) {}
}

/// A handler entry bound to a stage.
pub struct StageHandler {
    stage: String,
    entry: HandlerEntry,
    return_sink: Option<SinkRef>,
    exception_sink: Option<SinkRef>,
}

impl StageHandler {
    pub fn new(stage: impl Into<String>, entry: HandlerEntry, sinks: &SinkMap) -> Self {
        Self {
            stage: stage.into(),
            entry,
            return_sink: sinks.sink(RETURN_SINK).ok(),
            exception_sink: sinks.sink(EXCEPTION_SINK).ok(),
        }
    }

    #[inline]
    pub fn accepts(&self) -> &'static EventType {
        self.entry.accepts
    }

    #[inline]
    pub fn signature(&self) -> &'static str {
        self.entry.signature
    }

    #[inline]
    pub fn is_batch(&self) -> bool {
        self.entry.is_batch()
    }

    pub fn handle(&self, event: BoxedEvent) {
        let output = match &self.entry.delivery {
            Delivery::Single(f) => f(event),
            Delivery::Batch(f) => f(vec![event]),
        };
        self.complete(output);
    }

    pub fn handle_batch(&self, events: Vec<BoxedEvent>) {
        match &self.entry.delivery {
            Delivery::Single(f) => {
                for event in events {
                    self.complete(f(event));
                }
            }
            Delivery::Batch(f) => self.complete(f(events)),
        }
    }

    fn complete(&self, output: HandlerOutput) {
        match output {
            Ok(None) => {}
            Ok(Some(event)) => match &self.return_sink {
                Some(sink) => {
                    if let Err(e) = sink.enqueue(event) {
                        warn!(
                            stage = %self.stage,
                            handler = self.entry.signature,
                            "return value dropped: {e}"
                        );
                    }
                }
                None => debug!(
                    stage = %self.stage,
                    handler = self.entry.signature,
                    "no return sink, dropping {}",
                    event.event_type()
                ),
            },
            Err(err) => match &self.exception_sink {
                Some(sink) => {
                    let failed = HandlerFailedEvent {
                        stage: self.stage.clone(),
                        signature: self.entry.signature,
                        error: err,
                    };
                    if !sink.try_enqueue(Box::new(failed)) {
                        warn!(
                            stage = %self.stage,
                            handler = self.entry.signature,
                            "exception sink refused a handler failure"
                        );
                    }
                }
                None => error!(
                    stage = %self.stage,
                    handler = self.entry.signature,
                    "handler failed: {err:?}"
                ),
            },
        }
    }
}

impl fmt::Debug for StageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageHandler")
            .field("stage", &self.stage)
            .field("entry", &self.entry)
            .finish()
    }
}

const DEFAULT_HINT: &str = "default";

/// Services available for binding, keyed by role and hint.
#[derive(Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, BTreeMap<String, Arc<dyn StageService>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service` under `role`; a missing hint means `"default"`.
    pub fn register<S: StageService>(
        &mut self,
        role: impl Into<String>,
        hint: Option<&str>,
        service: Arc<S>,
    ) -> &mut Self {
        self.services
            .entry(role.into())
            .or_default()
            .insert(hint.unwrap_or(DEFAULT_HINT).to_string(), service);
        self
    }

    /// Looks a service up by role. Without a hint the role must either hold a
    /// single service or one registered as `"default"`.
    ///
    /// Returns a key identifying the service instance together with it.
    pub fn select(
        &self,
        role: &str,
        hint: Option<&str>,
    ) -> Result<(String, Arc<dyn StageService>), Error> {
        let not_found = || Error::NoSuchService {
            role: role.to_string(),
            hint: hint.map(str::to_string),
        };
        let hints = self.services.get(role).ok_or_else(not_found)?;
        let found = match hint {
            Some(hint) => hints.get_key_value(hint),
            None if hints.len() == 1 => hints.iter().next(),
            None => hints.get_key_value(DEFAULT_HINT),
        };
        let (hint, service) = found.ok_or_else(not_found)?;
        Ok((format!("{role}#{hint}"), service.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::HANDLER_FAILED,
        queue::{Queue, Source},
        sink_map::SinkBinding,
        test_util::{item, values, Item, ITEM},
    };

    struct Doubler;

    impl StageService for Doubler {
        fn handlers(self: Arc<Self>) -> Vec<HandlerEntry> {
            vec![HandlerEntry::typed("double", &ITEM, |Item(v): Item| {
                if v == 0 {
                    return Err(anyhow!("zero"));
                }
                Ok(Some(item(v * 2)))
            })]
        }
    }

    fn sinks(ret: &Queue, exc: &Queue) -> SinkMap {
        let mut map = SinkMap::new();
        map.insert(RETURN_SINK, SinkBinding::Stage(ret.clone()))
            .unwrap();
        map.insert(EXCEPTION_SINK, SinkBinding::Stage(exc.clone()))
            .unwrap();
        map
    }

    #[test]
    fn results_go_to_return_and_exception_sinks() {
        let (ret, exc) = (Queue::unbounded("ret"), Queue::unbounded("exc"));
        let entry = Arc::new(Doubler).handlers().remove(0);
        let handler = StageHandler::new("stage", entry, &sinks(&ret, &exc));

        handler.handle(item(2));
        handler.handle_batch(vec![item(3), item(0)]);
        assert_eq!(values(ret.dequeue_all()), [4, 6]);

        let failures = exc.dequeue_all();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].event_type(), &HANDLER_FAILED);
        let failed = failures[0].downcast_ref::<HandlerFailedEvent>().unwrap();
        assert_eq!(failed.stage, "stage");
        assert_eq!(failed.signature, "double");
    }

    #[test]
    fn missing_sinks_only_log() {
        let entry = Arc::new(Doubler).handlers().remove(0);
        let handler = StageHandler::new("stage", entry, &SinkMap::new());
        handler.handle(item(1));
        handler.handle(item(0));
    }

    #[test]
    fn batch_entries_receive_whole_batches() {
        let out = Queue::unbounded("out");
        let mut map = SinkMap::new();
        map.insert(RETURN_SINK, SinkBinding::Stage(out.clone()))
            .unwrap();
        let entry = HandlerEntry::typed_batch("sum", &ITEM, |items: Vec<Item>| {
            Ok(Some(item(items.iter().map(|i| i.0).sum())))
        });
        assert!(entry.is_batch());
        let handler = StageHandler::new("stage", entry, &map);
        handler.handle_batch(vec![item(1), item(2), item(3)]);
        handler.handle(item(5));
        assert_eq!(values(out.dequeue_all()), [6, 5]);
    }

    #[test]
    fn registry_selects_by_role_and_hint() {
        let mut registry = ServiceRegistry::new();
        registry.register("double", None, Arc::new(Doubler));
        assert_eq!(registry.select("double", None).unwrap().0, "double#default");

        registry.register("double", Some("fast"), Arc::new(Doubler));
        assert_eq!(registry.select("double", None).unwrap().0, "double#default");
        assert_eq!(
            registry.select("double", Some("fast")).unwrap().0,
            "double#fast"
        );
        assert!(matches!(
            registry.select("double", Some("slow")),
            Err(Error::NoSuchService { .. })
        ));
        assert!(registry.select("triple", None).is_err());

        let mut registry = ServiceRegistry::new();
        registry
            .register("double", Some("a"), Arc::new(Doubler))
            .register("double", Some("b"), Arc::new(Doubler));
        assert!(registry.select("double", None).is_err());
    }
}
