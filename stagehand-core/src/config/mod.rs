//! Topology description consumed by the stage manager.
//!
//! A topology is a list of stage groups. Each group shares one thread manager,
//! and each stage declares its queue, its handlers and its named sinks.
use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

// Idle sleep of a worker after an empty scan: 5 ms
const DEFAULT_SLEEP_TIME_MS: u64 = 5;
// Supervisor tick and backlog window of self-tuning pools
const DEFAULT_TPSP_SLEEP_TIME_MS: u64 = 100;
const DEFAULT_TPSP_MAX_THREADS: usize = 16;
const DEFAULT_TPSP_THRESHOLD: usize = 64;
const DEFAULT_TPSP_MARGIN: usize = 16;

pub const FALLBACK_PARALLELISM: NonZeroUsize = unsafe { NonZeroUsize::new_unchecked(1) };

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub groups: Vec<StageGroupConfig>,
}

impl Topology {
    pub fn stages(&self) -> impl Iterator<Item = &StageConfig> {
        self.groups.iter().flat_map(|g| g.stages.iter())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageGroupConfig {
    /// Name used for worker threads and log lines.
    #[serde(default = "default_group_name")]
    pub name: String,
    #[serde(default)]
    pub thread_manager: ThreadManagerConfig,
    pub stages: Vec<StageConfig>,
}

fn default_group_name() -> String {
    "stage".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ThreadManagerConfig {
    /// Fixed pool scanning every registered pipeline.
    Tpc(TpcConfig),
    /// Pool resized from the observed backlog.
    Tpsp(TpspConfig),
}

impl Default for ThreadManagerConfig {
    fn default() -> Self {
        Self::Tpc(TpcConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TpcConfig {
    #[serde(default = "default_processors")]
    pub processors: usize,
    #[serde(default = "default_threads_per_processor")]
    pub threads_per_processor: usize,
    #[serde(default = "default_sleep_time_ms")]
    pub sleep_time_ms: u64,
    #[serde(default = "default_cpu_affinity")]
    pub cpu_affinity: bool,
}

impl Default for TpcConfig {
    fn default() -> Self {
        Self {
            processors: default_processors(),
            threads_per_processor: default_threads_per_processor(),
            sleep_time_ms: default_sleep_time_ms(),
            cpu_affinity: default_cpu_affinity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TpspConfig {
    #[serde(default = "default_tpsp_min_threads")]
    pub min_threads: usize,
    #[serde(default = "default_tpsp_max_threads")]
    pub max_threads: usize,
    /// Backlog around which the pool is kept.
    #[serde(default = "default_tpsp_threshold")]
    pub threshold: usize,
    #[serde(default = "default_tpsp_margin")]
    pub margin: usize,
    /// Supervisor tick.
    #[serde(default = "default_tpsp_sleep_time_ms")]
    pub sleep_time_ms: u64,
    /// Idle sleep of a worker after an empty scan.
    #[serde(default = "default_sleep_time_ms")]
    pub worker_sleep_time_ms: u64,
}

impl Default for TpspConfig {
    fn default() -> Self {
        Self {
            min_threads: default_tpsp_min_threads(),
            max_threads: default_tpsp_max_threads(),
            threshold: default_tpsp_threshold(),
            margin: default_tpsp_margin(),
            sleep_time_ms: default_tpsp_sleep_time_ms(),
            worker_sleep_time_ms: default_sleep_time_ms(),
        }
    }
}

fn default_processors() -> usize {
    std::thread::available_parallelism()
        .unwrap_or(FALLBACK_PARALLELISM)
        .into()
}

define_const!(default_threads_per_processor, 1, usize);
define_const!(default_sleep_time_ms, DEFAULT_SLEEP_TIME_MS, u64);
define_const!(default_cpu_affinity, false, bool);
define_const!(default_tpsp_min_threads, 1, usize);
define_const!(default_tpsp_max_threads, DEFAULT_TPSP_MAX_THREADS, usize);
define_const!(default_tpsp_threshold, DEFAULT_TPSP_THRESHOLD, usize);
define_const!(default_tpsp_margin, DEFAULT_TPSP_MARGIN, usize);
define_const!(default_tpsp_sleep_time_ms, DEFAULT_TPSP_SLEEP_TIME_MS, u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    #[serde(default)]
    pub queue: QueueConfig,
    pub handlers: Vec<HandlerConfig>,
    #[serde(default)]
    pub sink_map: SinkMapConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    #[serde(default)]
    pub kind: QueueKind,
    /// Required for bounded queues, rejected for unbounded ones.
    #[serde(default)]
    pub capacity: Option<usize>,
    /// How long an idle dequeue may block.
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub predicate: Option<PredicateConfig>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Bounded,
    #[default]
    Unbounded,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PredicateConfig {
    Threshold { threshold: usize },
    RateLimiting { target_rate: f64, depth: usize },
}

/// Binds a service, or some of its handlers, to a stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Role under which the service was registered.
    pub service: String,
    #[serde(default)]
    pub hint: Option<String>,
    /// Binds only the handler with this signature; the whole handler table
    /// otherwise.
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub return_sink: Option<String>,
    #[serde(default)]
    pub exception_sink: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SinkMapConfig {
    /// Sink returned by `SinkMap::default_sink`; the stage's own queue if unset.
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub sinks: Vec<SinkEntryConfig>,
}

/// A named sink: either one stage or a set of stages with a delivery policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SinkEntryConfig {
    pub name: String,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub stages: Vec<String>,
    #[serde(default)]
    pub policy: DeliveryPolicy,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    #[default]
    All,
    One,
    AtLeastOne,
    ZeroOrMore,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_deserialize() {
        const TEST_CONFIG: &str = r#"
            [[groups]]
            name = "front"
            thread_manager = { policy = "tpc", processors = 2, sleep_time_ms = 1 }

            [[groups.stages]]
            name = "echo"
            queue = { kind = "bounded", capacity = 2, predicate = { type = "threshold", threshold = 1 } }
            handlers = [{ service = "echo", return_sink = "audit" }]

            [[groups.stages]]
            name = "audit"
            handlers = [{ service = "audit", hint = "file", signature = "record" }]

            [groups.stages.sink_map]
            default = "fanout"
            sinks = [
                { name = "fanout", stages = ["echo", "audit"], policy = "at_least_one" },
                { name = "loop", stage = "echo" },
            ]

            [[groups]]
            thread_manager = { policy = "tpsp", max_threads = 4 }
            stages = []
        "#;

        let topology: Topology = toml::from_str(TEST_CONFIG).unwrap();
        assert_eq!(topology.groups.len(), 2);
        let front = &topology.groups[0];
        assert_eq!(front.name, "front");
        assert_eq!(
            front.thread_manager,
            ThreadManagerConfig::Tpc(TpcConfig {
                processors: 2,
                threads_per_processor: 1,
                sleep_time_ms: 1,
                cpu_affinity: false,
            })
        );
        let echo = &front.stages[0];
        assert_eq!(echo.queue.kind, QueueKind::Bounded);
        assert_eq!(echo.queue.capacity, Some(2));
        assert_eq!(
            echo.queue.predicate,
            Some(PredicateConfig::Threshold { threshold: 1 })
        );
        assert_eq!(echo.handlers[0].return_sink.as_deref(), Some("audit"));

        let audit = &front.stages[1];
        assert_eq!(audit.queue, QueueConfig::default());
        assert_eq!(audit.sink_map.default.as_deref(), Some("fanout"));
        assert_eq!(audit.sink_map.sinks[0].policy, DeliveryPolicy::AtLeastOne);
        assert_eq!(audit.sink_map.sinks[1].stage.as_deref(), Some("echo"));
        assert_eq!(audit.sink_map.sinks[1].policy, DeliveryPolicy::All);

        let back = &topology.groups[1];
        assert_eq!(back.name, "stage");
        match &back.thread_manager {
            ThreadManagerConfig::Tpsp(tpsp) => {
                assert_eq!(tpsp.max_threads, 4);
                assert_eq!(tpsp.min_threads, 1);
            }
            other => panic!("unexpected thread manager {other:?}"),
        }
        assert_eq!(topology.stages().count(), 2);
    }

    #[test]
    fn test_json_deserialize() {
        const TEST_CONFIG: &str = r#"
            {
                "groups": [{
                    "stages": [{
                        "name": "limited",
                        "queue": {
                            "predicate": { "type": "rate_limiting", "target_rate": 100.0, "depth": 10 },
                            "timeout_ms": 20
                        },
                        "handlers": [{ "service": "sink" }]
                    }]
                }]
            }
        "#;

        let topology: Topology = serde_json::from_str(TEST_CONFIG).unwrap();
        let group = &topology.groups[0];
        assert!(matches!(group.thread_manager, ThreadManagerConfig::Tpc(_)));
        let stage = &group.stages[0];
        assert_eq!(stage.queue.kind, QueueKind::Unbounded);
        assert_eq!(stage.queue.timeout_ms, 20);
        assert_eq!(
            stage.queue.predicate,
            Some(PredicateConfig::RateLimiting {
                target_rate: 100.0,
                depth: 10
            })
        );
        assert_eq!(stage.handlers[0].service, "sink");
        assert!(stage.sink_map.sinks.is_empty());
    }
}
