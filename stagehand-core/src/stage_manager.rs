//! Assembly and lifecycle of a stage graph.
//!
//! [`StageManager::assemble`] turns a [`Topology`] into queues, pipelines and
//! thread managers in two passes: every queue is built first, then sink maps
//! and handler bindings are resolved, so a stage may name a stage declared
//! after it. The manager then owns every stage by name.
use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex;
use service_async::MakeService;
use tracing::{debug, info};

use crate::{
    config::{HandlerConfig, SinkEntryConfig, StageConfig, Topology},
    error::{Error, SinkError},
    event::BoxedEvent,
    handler::{HandlerEntry, ServiceRegistry, StageHandler, StageService},
    pipeline::StagePipeline,
    queue::{Queue, QueueBuilder, Sink, SinkRef, Source},
    sink_map::{SinkBinding, SinkMap, SinkSet, EXCEPTION_SINK, RETURN_SINK},
    thread::{ThreadManager, ThreadManagerBuilder},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Assembled,
    Initialized,
    Started,
    Stopped,
    Disposed,
}

impl Lifecycle {
    fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Assembled => "assembled",
            Lifecycle::Initialized => "initialized",
            Lifecycle::Started => "started",
            Lifecycle::Stopped => "stopped",
            Lifecycle::Disposed => "disposed",
        }
    }
}

struct Stage {
    queue: Queue,
    pipeline: Arc<StagePipeline>,
    sinks: SinkMap,
    // index into `StageManager::managers`
    manager: usize,
}

struct BoundService {
    service: Arc<dyn StageService>,
    sinks: SinkMap,
}

pub struct StageManager {
    stages: BTreeMap<String, Stage>,
    managers: Vec<Arc<dyn ThreadManager>>,
    services: BTreeMap<String, BoundService>,
    state: Mutex<Lifecycle>,
}

impl StageManager {
    pub fn assemble(topology: &Topology, registry: &ServiceRegistry) -> Result<Self, Error> {
        let mut seen = HashSet::new();
        for stage in topology.stages() {
            if !seen.insert(stage.name.as_str()) {
                return Err(Error::DuplicateStage(stage.name.clone()));
            }
        }

        let mut managers = Vec::with_capacity(topology.groups.len());
        let mut queues = BTreeMap::new();
        for group in &topology.groups {
            managers.push(
                ThreadManagerBuilder::new(group.name.clone(), group.thread_manager.clone())
                    .make()?,
            );
            for stage in &group.stages {
                let queue = QueueBuilder::new(stage.name.clone(), stage.queue.clone()).make()?;
                queues.insert(stage.name.clone(), queue);
            }
        }

        let mut stages = BTreeMap::new();
        let mut services: BTreeMap<String, BoundService> = BTreeMap::new();
        for (manager, group) in topology.groups.iter().enumerate() {
            for config in &group.stages {
                let queue = queues
                    .get(&config.name)
                    .cloned()
                    .ok_or_else(|| Error::NoSuchSink(config.name.clone()))?;
                let sinks = build_sink_map(config, &queue, &queues)?;

                let mut handlers = Vec::new();
                for binding in &config.handlers {
                    let (key, service) =
                        registry.select(&binding.service, binding.hint.as_deref())?;
                    let handler_sinks = handler_sink_map(binding, &sinks, &queues)?;
                    for entry in select_entries(binding, &service)? {
                        handlers.push(Arc::new(StageHandler::new(
                            config.name.clone(),
                            entry,
                            &handler_sinks,
                        )));
                    }
                    match services.get_mut(&key) {
                        Some(bound) => bound.sinks.merge(&sinks)?,
                        None => {
                            services.insert(
                                key,
                                BoundService {
                                    service,
                                    sinks: sinks.clone(),
                                },
                            );
                        }
                    }
                }

                let sources: Vec<Arc<dyn Source>> = vec![Arc::new(queue.clone())];
                let pipeline = StagePipeline::for_handlers(config.name.clone(), sources, handlers)?;
                debug!(stage = %config.name, sinks = ?sinks, "stage assembled");
                stages.insert(
                    config.name.clone(),
                    Stage {
                        queue,
                        pipeline: Arc::new(pipeline),
                        sinks,
                        manager,
                    },
                );
            }
        }

        info!(
            "assembled {} stages on {} thread managers",
            stages.len(),
            managers.len()
        );
        Ok(Self {
            stages,
            managers,
            services,
            state: Mutex::new(Lifecycle::Assembled),
        })
    }

    /// Initializes every bound service, then every pipeline.
    pub fn initialize(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        expect_state(*state, &[Lifecycle::Assembled], "initialize")?;
        for (key, bound) in &self.services {
            debug!("initializing service {key}");
            bound
                .service
                .initialize(&bound.sinks)
                .map_err(Error::Service)?;
        }
        for stage in self.stages.values() {
            stage.pipeline.initialize().map_err(Error::Service)?;
        }
        *state = Lifecycle::Initialized;
        Ok(())
    }

    /// Starts the thread managers and hands them their pipelines.
    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        expect_state(*state, &[Lifecycle::Initialized, Lifecycle::Stopped], "start")?;
        for manager in &self.managers {
            manager.start()?;
        }
        for stage in self.stages.values() {
            self.managers[stage.manager].register(stage.pipeline.clone());
        }
        *state = Lifecycle::Started;
        info!("stage manager started");
        Ok(())
    }

    /// Stops scheduling every stage; in-flight invocations complete first.
    pub fn stop(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        match *state {
            Lifecycle::Started => {
                self.deregister_all();
                *state = Lifecycle::Stopped;
                Ok(())
            }
            Lifecycle::Stopped => Ok(()),
            other => Err(Error::Lifecycle {
                state: other.as_str(),
                action: "stop",
            }),
        }
    }

    /// Stops every stage, then releases services, pipelines, worker threads
    /// and queues. Calling it again does nothing.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        if *state == Lifecycle::Disposed {
            return;
        }
        if *state == Lifecycle::Started {
            self.deregister_all();
        }
        for manager in &self.managers {
            manager.shutdown();
        }
        for bound in self.services.values() {
            bound.service.dispose();
        }
        for stage in self.stages.values() {
            stage.pipeline.dispose();
            stage.queue.close();
        }
        *state = Lifecycle::Disposed;
        info!("stage manager disposed");
    }

    /// Blocks until every worker thread has exited.
    pub fn wait(&self) {
        for manager in &self.managers {
            manager.join();
        }
    }

    pub fn enqueue(&self, event: BoxedEvent, stage: &str) -> Result<(), SinkError> {
        match self.stages.get(stage) {
            Some(found) => found.queue.enqueue(event),
            None => Err(SinkError::NoSuchSink(stage.to_string())),
        }
    }

    pub fn sink(&self, stage: &str) -> Result<SinkRef, Error> {
        self.queue(stage).map(|q| q.as_sink())
    }

    pub fn queue(&self, stage: &str) -> Result<Queue, Error> {
        self.stages
            .get(stage)
            .map(|s| s.queue.clone())
            .ok_or_else(|| Error::NoSuchSink(stage.to_string()))
    }

    pub fn sink_map(&self, stage: &str) -> Result<&SinkMap, Error> {
        self.stages
            .get(stage)
            .map(|s| &s.sinks)
            .ok_or_else(|| Error::NoSuchSink(stage.to_string()))
    }

    pub fn stage_names(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(String::as_str)
    }

    fn deregister_all(&self) {
        for manager in &self.managers {
            manager.deregister_all();
        }
    }
}

impl Drop for StageManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn expect_state(
    state: Lifecycle,
    allowed: &[Lifecycle],
    action: &'static str,
) -> Result<(), Error> {
    if allowed.contains(&state) {
        Ok(())
    } else {
        Err(Error::Lifecycle {
            state: state.as_str(),
            action,
        })
    }
}

fn stage_queue(queues: &BTreeMap<String, Queue>, stage: &str) -> Result<Queue, Error> {
    queues
        .get(stage)
        .cloned()
        .ok_or_else(|| Error::NoSuchSink(stage.to_string()))
}

fn build_sink_entry(
    entry: &SinkEntryConfig,
    queues: &BTreeMap<String, Queue>,
) -> Result<SinkBinding, Error> {
    let invalid = |reason: &str| Error::InvalidSinkEntry {
        name: entry.name.clone(),
        reason: reason.to_string(),
    };
    match (&entry.stage, entry.stages.as_slice()) {
        (Some(stage), []) => Ok(SinkBinding::Stage(stage_queue(queues, stage)?)),
        (None, []) => Err(invalid("names no stage")),
        (None, stages) => {
            let members = stages
                .iter()
                .map(|s| stage_queue(queues, s))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(SinkBinding::Set(SinkSet::new(
                entry.name.clone(),
                members,
                entry.policy,
            )))
        }
        (Some(_), _) => Err(invalid("takes either `stage` or `stages`, not both")),
    }
}

fn build_sink_map(
    config: &StageConfig,
    own: &Queue,
    queues: &BTreeMap<String, Queue>,
) -> Result<SinkMap, Error> {
    let mut sinks = SinkMap::new();
    for entry in &config.sink_map.sinks {
        sinks.insert(entry.name.clone(), build_sink_entry(entry, queues)?)?;
    }
    let default = match &config.sink_map.default {
        Some(name) => resolve(name, &sinks, queues)?.sink(),
        None => own.as_sink(),
    };
    sinks.set_default(default);
    Ok(sinks)
}

/// Sink-map names take precedence over stage names.
fn resolve(
    name: &str,
    sinks: &SinkMap,
    queues: &BTreeMap<String, Queue>,
) -> Result<SinkBinding, Error> {
    match sinks.binding(name) {
        Some(binding) => Ok(binding.clone()),
        None => stage_queue(queues, name).map(SinkBinding::Stage),
    }
}

fn handler_sink_map(
    binding: &HandlerConfig,
    stage_sinks: &SinkMap,
    queues: &BTreeMap<String, Queue>,
) -> Result<SinkMap, Error> {
    let mut sinks = stage_sinks.clone();
    if let Some(name) = &binding.return_sink {
        sinks.insert(RETURN_SINK, resolve(name, stage_sinks, queues)?)?;
    }
    if let Some(name) = &binding.exception_sink {
        sinks.insert(EXCEPTION_SINK, resolve(name, stage_sinks, queues)?)?;
    }
    Ok(sinks)
}

fn select_entries(
    binding: &HandlerConfig,
    service: &Arc<dyn StageService>,
) -> Result<Vec<HandlerEntry>, Error> {
    let entries = service.clone().handlers();
    let Some(signature) = &binding.signature else {
        return Ok(entries);
    };
    entries
        .into_iter()
        .find(|e| e.signature() == signature)
        .map(|e| vec![e])
        .ok_or_else(|| Error::NoSuchHandler {
            service: binding.service.clone(),
            signature: signature.clone(),
        })
}
