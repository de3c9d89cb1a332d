#[macro_use]
pub mod event;
mod error;

pub mod config;
pub mod handler;
pub mod pipeline;
pub mod queue;
pub mod sink_map;
pub mod stage_manager;
pub mod thread;

pub use error::{AnyError, AnyResult, Error, Result, SinkError};
pub use event::{BoxedEvent, Event, EventType};
pub use queue::{Queue, Sink, SinkRef, Source};
pub use stage_manager::StageManager;

#[cfg(test)]
pub(crate) mod test_util {
    use std::time::{Duration, Instant};

    use crate::event::{BoxedEvent, EventType};

    pub static ITEM: EventType = EventType::root("test.item");

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Item(pub u32);
    impl_event!(Item, ITEM, clone);

    pub fn item(v: u32) -> BoxedEvent {
        Box::new(Item(v))
    }

    pub fn values(events: Vec<BoxedEvent>) -> Vec<u32> {
        events
            .into_iter()
            .map(|e| e.downcast_ref::<Item>().map(|i| i.0).unwrap_or(u32::MAX))
            .collect()
    }

    /// Polls `cond` until it holds or five seconds pass.
    pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }
}
