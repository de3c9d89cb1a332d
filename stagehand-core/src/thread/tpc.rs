use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::info;

use super::{pin_to_core, run_worker, PipelineSet, ThreadManager, Worker, Workers};
use crate::{config::TpcConfig, error::Error, pipeline::StagePipeline};

/// Thread-per-CPU manager.
///
/// Spawns `processors * threads_per_processor` workers which all scan the same
/// set of pipelines. With `cpu_affinity` set, worker `n` is pinned to core
/// `n % available_parallelism`.
pub struct TpcThreadManager {
    name: String,
    config: TpcConfig,
    pipelines: Arc<PipelineSet>,
    workers: Workers,
    started: AtomicBool,
}

impl TpcThreadManager {
    pub fn new(name: impl Into<String>, config: TpcConfig) -> Result<Self, Error> {
        if config.processors == 0 || config.threads_per_processor == 0 {
            return Err(Error::InvalidThreadManager(format!(
                "tpc needs at least one processor and one thread per processor, got {} x {}",
                config.processors, config.threads_per_processor
            )));
        }
        Ok(Self {
            name: name.into(),
            config,
            pipelines: Default::default(),
            workers: Default::default(),
            started: AtomicBool::new(false),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.config.processors * self.config.threads_per_processor
    }
}

impl ThreadManager for TpcThreadManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let cores = if self.config.cpu_affinity {
            std::thread::available_parallelism().ok()
        } else {
            None
        };
        let idle = Duration::from_millis(self.config.sleep_time_ms);
        for worker_id in 0..self.worker_count() {
            let thread = format!("{}-worker-{worker_id}", self.name);
            let core = cores.map(|cores| worker_id % cores.get());
            let pipelines = self.pipelines.clone();
            let worker = Worker::spawn(thread.clone(), move |stop| {
                pin_to_core(&thread, core);
                run_worker(&pipelines, stop, idle)
            })?;
            self.workers.push(worker);
        }
        info!("{} workers started for {}", self.worker_count(), self.name);
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
        self.workers.signal();
        self.workers.join();
    }

    fn join(&self) {
        self.workers.join();
    }
}

impl Drop for TpcThreadManager {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown();
        }
    }
}
