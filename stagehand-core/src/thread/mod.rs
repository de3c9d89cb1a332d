//! Thread managers driving stage pipelines.
//!
//! Two policies are provided: [`TpcThreadManager`] keeps a fixed pool sized
//! from the processor count, [`TpspThreadManager`] grows and shrinks its pool
//! from the backlog it observes. Workers of both scan every registered
//! pipeline in turn and sleep briefly after a scan that found nothing to do.
use std::{
    any::Any,
    io,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use futures_channel::oneshot::{Receiver as OReceiver, Sender as OSender};
use monoio::utils::bind_to_cpu_set;
use parking_lot::{Mutex, RwLock};
use service_async::MakeService;
use tracing::{error, warn};

use crate::{config::ThreadManagerConfig, error::Error, pipeline::StagePipeline};

mod tpc;
mod tpsp;

pub use tpc::TpcThreadManager;
pub use tpsp::TpspThreadManager;

pub trait ThreadManager: Send + Sync {
    fn name(&self) -> &str;

    /// Spawns the workers. Calling it again is a no-op.
    fn start(&self) -> io::Result<()>;

    fn register(&self, pipeline: Arc<StagePipeline>);

    /// Removes the pipeline from the scan set and waits until no worker is
    /// still running it. Returns false if it was not registered.
    fn deregister(&self, pipeline: &str) -> bool;

    fn deregister_all(&self);

    /// Stops every worker and waits for them to exit.
    fn shutdown(&self);

    /// Waits for the workers to exit without asking them to.
    fn join(&self);
}

/// Pipelines registered with one thread manager.
#[derive(Default)]
pub(crate) struct PipelineSet {
    pipelines: RwLock<Vec<Arc<Registered>>>,
}

/// One registration. Workers may still hold it in a scan taken before it was
/// removed, so removal also retires it.
pub(crate) struct Registered {
    pipeline: Arc<StagePipeline>,
    retired: AtomicBool,
}

impl Registered {
    fn run(&self) -> usize {
        self.pipeline.run_once_unless(&self.retired)
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.pipeline.wait_idle();
    }
}

impl PipelineSet {
    pub(crate) fn register(&self, pipeline: Arc<StagePipeline>) {
        let mut pipelines = self.pipelines.write();
        if pipelines.iter().any(|r| r.pipeline.name() == pipeline.name()) {
            warn!(stage = pipeline.name(), "pipeline registered twice, ignoring");
            return;
        }
        pipelines.push(Arc::new(Registered {
            pipeline,
            retired: AtomicBool::new(false),
        }));
    }

    pub(crate) fn deregister(&self, name: &str) -> bool {
        let removed = {
            let mut pipelines = self.pipelines.write();
            pipelines
                .iter()
                .position(|r| r.pipeline.name() == name)
                .map(|i| pipelines.remove(i))
        };
        match removed {
            Some(registered) => {
                registered.retire();
                true
            }
            None => false,
        }
    }

    pub(crate) fn deregister_all(&self) {
        let removed = std::mem::take(&mut *self.pipelines.write());
        for registered in removed {
            registered.retire();
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Registered>> {
        self.pipelines.read().clone()
    }

    pub(crate) fn backlog(&self) -> usize {
        self.pipelines
            .read()
            .iter()
            .map(|r| r.pipeline.backlog())
            .sum()
    }
}

/// A running thread and the signal that stops it.
pub(crate) struct Worker {
    handle: JoinHandle<()>,
    stop: OSender<()>,
}

impl Worker {
    pub(crate) fn spawn<F>(name: String, f: F) -> io::Result<Self>
    where
        F: FnOnce(OReceiver<()>) + Send + 'static,
    {
        let (stop, stop_rx) = futures_channel::oneshot::channel::<()>();
        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || f(stop_rx))?;
        Ok(Self { handle, stop })
    }

    pub(crate) fn signal(self) -> JoinHandle<()> {
        let _ = self.stop.send(());
        self.handle
    }
}

/// Threads owned by a thread manager: stop signals and join handles are kept
/// apart so one thread can wait while another shuts the pool down.
#[derive(Default)]
pub(crate) struct Workers {
    stops: Mutex<Vec<OSender<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Workers {
    pub(crate) fn push(&self, worker: Worker) {
        self.stops.lock().push(worker.stop);
        self.handles.lock().push(worker.handle);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    pub(crate) fn signal(&self) {
        for stop in self.stops.lock().drain(..) {
            let _ = stop.send(());
        }
    }

    pub(crate) fn join(&self) {
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread exited with a panic");
            }
        }
    }
}

/// Returns true once the owner asked the thread to stop or went away.
pub(crate) fn should_stop(stop: &mut OReceiver<()>) -> bool {
    !matches!(stop.try_recv(), Ok(None))
}

pub(crate) fn pin_to_core(thread: &str, core: Option<usize>) {
    if let Some(core) = core {
        if let Err(e) = bind_to_cpu_set([core]) {
            warn!("bind thread {thread} to core {core} failed: {e}");
        }
    }
}

/// Scan loop shared by every worker.
pub(crate) fn run_worker(pipelines: &PipelineSet, mut stop: OReceiver<()>, idle: Duration) {
    let mut cursor = 0usize;
    while !should_stop(&mut stop) {
        let snapshot = pipelines.snapshot();
        let mut handled = 0;
        for i in 0..snapshot.len() {
            handled += run_guarded(&snapshot[(cursor + i) % snapshot.len()]);
        }
        cursor = cursor.wrapping_add(1);
        if handled == 0 {
            std::thread::sleep(idle);
        }
    }
}

fn run_guarded(registered: &Registered) -> usize {
    match catch_unwind(AssertUnwindSafe(|| registered.run())) {
        Ok(handled) => handled,
        Err(panic) => {
            error!(
                stage = registered.pipeline.name(),
                "pipeline panicked: {}",
                panic_message(panic.as_ref())
            );
            0
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

/// Builds a thread manager from its configuration.
pub struct ThreadManagerBuilder {
    name: String,
    config: ThreadManagerConfig,
}

impl ThreadManagerBuilder {
    pub fn new(name: impl Into<String>, config: ThreadManagerConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

impl MakeService for ThreadManagerBuilder {
    type Service = Arc<dyn ThreadManager>;
    type Error = Error;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        let manager: Arc<dyn ThreadManager> = match &self.config {
            ThreadManagerConfig::Tpc(config) => {
                Arc::new(TpcThreadManager::new(self.name.clone(), config.clone())?)
            }
            ThreadManagerConfig::Tpsp(config) => {
                Arc::new(TpspThreadManager::new(self.name.clone(), config.clone())?)
            }
        };
        Ok(manager)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{
        config::{TpcConfig, TpspConfig},
        event::BoxedEvent,
        pipeline::EventHandler,
        queue::{Queue, Sink},
        test_util::{eventually, item},
    };

    pub(crate) struct Counting {
        pub handled: Arc<AtomicUsize>,
        pub delay: Duration,
        pub panics: bool,
    }

    impl EventHandler for Counting {
        fn handle_event(&self, _event: BoxedEvent) {
            if self.panics {
                panic!("handler blew up");
            }
            std::thread::sleep(self.delay);
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn counting_pipeline(
        name: &str,
        delay: Duration,
        panics: bool,
    ) -> (Arc<StagePipeline>, Queue, Arc<AtomicUsize>) {
        let queue = Queue::unbounded(name);
        let handled = Arc::new(AtomicUsize::new(0));
        let pipeline = StagePipeline::new(
            name,
            vec![Arc::new(queue.clone())],
            Box::new(Counting {
                handled: handled.clone(),
                delay,
                panics,
            }),
        );
        (Arc::new(pipeline), queue, handled)
    }

    fn tpc(processors: usize) -> TpcThreadManager {
        TpcThreadManager::new(
            "test",
            TpcConfig {
                processors,
                threads_per_processor: 1,
                sleep_time_ms: 1,
                cpu_affinity: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn tpc_drives_registered_pipelines() {
        let manager = tpc(2);
        let (pipeline, queue, handled) = counting_pipeline("count", Duration::ZERO, false);
        manager.register(pipeline);
        manager.start().unwrap();
        for i in 0..50 {
            queue.enqueue(item(i)).unwrap();
        }
        assert!(eventually(|| handled.load(Ordering::SeqCst) == 50));
        manager.shutdown();
    }

    #[test]
    fn panicking_stage_does_not_stop_the_pool() {
        let manager = tpc(1);
        let (bad, bad_queue, _) = counting_pipeline("bad", Duration::ZERO, true);
        let (good, good_queue, handled) = counting_pipeline("good", Duration::ZERO, false);
        manager.register(bad);
        manager.register(good);
        manager.start().unwrap();
        for i in 0..10 {
            bad_queue.enqueue(item(i)).unwrap();
            good_queue.enqueue(item(i)).unwrap();
        }
        assert!(eventually(|| handled.load(Ordering::SeqCst) == 10));
        manager.shutdown();
    }

    #[test]
    fn deregister_waits_for_running_invocation() {
        let manager = tpc(1);
        let (pipeline, queue, handled) =
            counting_pipeline("slow", Duration::from_millis(200), false);
        manager.register(pipeline.clone());
        manager.start().unwrap();
        queue.enqueue(item(1)).unwrap();
        // wait until a worker picked the event up
        assert!(eventually(|| queue.size() == 0));
        assert!(manager.deregister("slow"));
        assert_eq!(handled.load(Ordering::SeqCst), 1);
        assert!(!manager.deregister("slow"));

        queue.enqueue(item(2)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.size(), 1);
        manager.shutdown();
    }

    #[test]
    fn deregistered_pipeline_is_not_run_from_a_stale_scan() {
        let manager = tpc(1);
        let (slow, slow_queue, slow_handled) =
            counting_pipeline("slow", Duration::from_millis(150), false);
        let (target, target_queue, target_handled) =
            counting_pipeline("target", Duration::ZERO, false);
        manager.register(slow);
        manager.register(target);
        manager.start().unwrap();

        slow_queue.enqueue(item(0)).unwrap();
        // the only worker is now busy in "slow", possibly with "target" still
        // ahead in its scan
        assert!(eventually(|| slow_queue.size() == 0));
        assert!(manager.deregister("target"));
        target_queue.enqueue(item(1)).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert!(slow_handled.load(Ordering::SeqCst) >= 1);
        assert_eq!(target_handled.load(Ordering::SeqCst), 0);
        assert_eq!(target_queue.size(), 1);
        manager.shutdown();
    }

    #[test]
    fn tpsp_grows_under_backlog_and_drains() {
        let manager = TpspThreadManager::new(
            "tuned",
            TpspConfig {
                min_threads: 1,
                max_threads: 3,
                threshold: 2,
                margin: 1,
                sleep_time_ms: 10,
                worker_sleep_time_ms: 1,
            },
        )
        .unwrap();
        // a pipeline is never run by two workers, so backlog spread over
        // several pipelines is what a bigger pool can absorb
        let mut counters = Vec::new();
        for name in ["a", "b", "c"] {
            let (pipeline, queue, handled) =
                counting_pipeline(name, Duration::from_millis(20), false);
            manager.register(pipeline);
            for i in 0..20 {
                queue.enqueue(item(i)).unwrap();
            }
            counters.push(handled);
        }
        manager.start().unwrap();
        assert!(eventually(|| manager.pool_size() > 1));
        assert!(eventually(|| counters
            .iter()
            .all(|c| c.load(Ordering::SeqCst) == 20)));
        assert!(eventually(|| manager.pool_size() == 1));
        manager.shutdown();
        assert_eq!(manager.pool_size(), 0);
    }

    #[test]
    fn builder_rejects_invalid_pools() {
        let build = |config| ThreadManagerBuilder::new("t", config).make();
        assert!(build(ThreadManagerConfig::Tpc(TpcConfig {
            processors: 0,
            ..TpcConfig::default()
        }))
        .is_err());
        assert!(build(ThreadManagerConfig::Tpsp(TpspConfig {
            min_threads: 4,
            max_threads: 2,
            ..TpspConfig::default()
        }))
        .is_err());
        assert!(build(ThreadManagerConfig::Tpsp(TpspConfig {
            threshold: 1,
            margin: 2,
            ..TpspConfig::default()
        }))
        .is_err());
        assert!(build(ThreadManagerConfig::default()).is_ok());
    }
}
