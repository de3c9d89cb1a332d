use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_channel::oneshot::Receiver as OReceiver;
use tracing::{debug, error, info};

use super::{run_worker, should_stop, PipelineSet, ThreadManager, Worker, Workers};
use crate::{config::TpspConfig, error::Error, pipeline::StagePipeline};

/// Self-tuning manager.
///
/// A supervisor thread samples the total backlog of the registered pipelines
/// every `sleep_time_ms`. Above `threshold + margin` it adds a worker, below
/// `threshold - margin` it retires one, always staying within
/// `min_threads..=max_threads`.
pub struct TpspThreadManager {
    name: String,
    config: TpspConfig,
    pipelines: Arc<PipelineSet>,
    pool_size: Arc<AtomicUsize>,
    supervisor: Workers,
    started: AtomicBool,
}

impl TpspThreadManager {
    pub fn new(name: impl Into<String>, config: TpspConfig) -> Result<Self, Error> {
        if config.min_threads == 0 || config.max_threads < config.min_threads {
            return Err(Error::InvalidThreadManager(format!(
                "tpsp needs 1 <= min_threads <= max_threads, got {} and {}",
                config.min_threads, config.max_threads
            )));
        }
        if config.margin > config.threshold {
            return Err(Error::InvalidThreadManager(format!(
                "tpsp margin {} exceeds its threshold {}",
                config.margin, config.threshold
            )));
        }
        Ok(Self {
            name: name.into(),
            config,
            pipelines: Default::default(),
            pool_size: Default::default(),
            supervisor: Default::default(),
            started: AtomicBool::new(false),
        })
    }

    /// Workers currently alive, the supervisor excluded.
    pub fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Acquire)
    }
}

impl ThreadManager for TpspThreadManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let supervisor = Supervisor {
            name: self.name.clone(),
            config: self.config.clone(),
            pipelines: self.pipelines.clone(),
            pool_size: self.pool_size.clone(),
            pool: Vec::new(),
            next_id: 0,
        };
        let worker = Worker::spawn(format!("{}-supervisor", self.name), move |stop| {
            supervisor.run(stop)
        })?;
        self.supervisor.push(worker);
        info!("supervisor started for {}", self.name);
        Ok(())
    }

    fn register(&self, pipeline: Arc<StagePipeline>) {
        self.pipelines.register(pipeline);
    }

    fn deregister(&self, pipeline: &str) -> bool {
        self.pipelines.deregister(pipeline)
    }

    fn deregister_all(&self) {
        self.pipelines.deregister_all();
    }

    fn shutdown(&self) {
        self.supervisor.signal();
        self.supervisor.join();
    }

    fn join(&self) {
        self.supervisor.join();
    }
}

impl Drop for TpspThreadManager {
    fn drop(&mut self) {
        if !self.supervisor.is_empty() {
            self.shutdown();
        }
    }
}

struct Supervisor {
    name: String,
    config: TpspConfig,
    pipelines: Arc<PipelineSet>,
    pool_size: Arc<AtomicUsize>,
    pool: Vec<Worker>,
    next_id: usize,
}

impl Supervisor {
    fn run(mut self, mut stop: OReceiver<()>) {
        while self.pool.len() < self.config.min_threads {
            if !self.grow() {
                break;
            }
        }

        let tick = Duration::from_millis(self.config.sleep_time_ms);
        let high = self.config.threshold + self.config.margin;
        let low = self.config.threshold - self.config.margin;
        while !should_stop(&mut stop) {
            std::thread::sleep(tick);
            let backlog = self.pipelines.backlog();
            if backlog > high && self.pool.len() < self.config.max_threads {
                if self.grow() {
                    debug!("{}: backlog {backlog}, pool grown to {}", self.name, self.pool.len());
                }
            } else if backlog < low && self.pool.len() > self.config.min_threads {
                self.shrink();
                debug!("{}: backlog {backlog}, pool shrunk to {}", self.name, self.pool.len());
            }
        }

        while !self.pool.is_empty() {
            self.shrink();
        }
    }

    fn grow(&mut self) -> bool {
        let worker_id = self.next_id;
        self.next_id += 1;
        let pipelines = self.pipelines.clone();
        let idle = Duration::from_millis(self.config.worker_sleep_time_ms);
        match Worker::spawn(format!("{}-worker-{worker_id}", self.name), move |stop| {
            run_worker(&pipelines, stop, idle)
        }) {
            Ok(worker) => {
                self.pool.push(worker);
                self.pool_size.store(self.pool.len(), Ordering::Release);
                true
            }
            Err(e) => {
                error!("{}: spawn worker {worker_id} failed: {e}", self.name);
                false
            }
        }
    }

    fn shrink(&mut self) {
        if let Some(worker) = self.pool.pop() {
            if worker.signal().join().is_err() {
                error!("{}: retired worker exited with a panic", self.name);
            }
            self.pool_size.store(self.pool.len(), Ordering::Release);
        }
    }
}
