//! Named outputs of a stage.
//!
//! A [`SinkMap`] tells a service where it may send events: a stage queue or a
//! [`SinkSet`] fanning out over several stages. Two names are reserved for the
//! stage handler itself, [`RETURN_SINK`] and [`EXCEPTION_SINK`].
use std::{collections::BTreeMap, fmt, sync::Arc};

use rand::Rng;

use crate::{
    config::DeliveryPolicy,
    error::{Error, SinkError},
    event::BoxedEvent,
    queue::{PreparedEnqueue, Queue, Rejected, Sink, SinkRef},
};

/// Receives the value returned by a handler.
pub const RETURN_SINK: &str = "@return";
/// Receives a `HandlerFailedEvent` when a handler fails.
pub const EXCEPTION_SINK: &str = "@exceptions";

#[derive(Clone)]
pub enum SinkBinding {
    Stage(Queue),
    Set(SinkSet),
}

impl SinkBinding {
    pub fn sink(&self) -> SinkRef {
        match self {
            SinkBinding::Stage(queue) => queue.as_sink(),
            SinkBinding::Set(set) => Arc::new(set.clone()),
        }
    }

    fn target(&self) -> String {
        match self {
            SinkBinding::Stage(queue) => queue.name().to_string(),
            SinkBinding::Set(set) => {
                let members: Vec<_> = set.members.iter().map(Queue::name).collect();
                format!("{:?}{:?}", set.policy, members)
            }
        }
    }
}

impl fmt::Debug for SinkBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.target())
    }
}

#[derive(Clone, Default)]
pub struct SinkMap {
    sinks: BTreeMap<String, SinkBinding>,
    default: Option<SinkRef>,
}

impl SinkMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if `name` is already bound to a different target.
    pub fn insert(&mut self, name: impl Into<String>, binding: SinkBinding) -> Result<(), Error> {
        let name = name.into();
        if let Some(existing) = self.sinks.get(&name) {
            let (first, second) = (existing.target(), binding.target());
            if first != second {
                return Err(Error::ConflictingSink {
                    name,
                    first,
                    second,
                });
            }
            return Ok(());
        }
        self.sinks.insert(name, binding);
        Ok(())
    }

    pub fn set_default(&mut self, sink: SinkRef) {
        self.default = Some(sink);
    }

    pub fn default_sink(&self) -> Option<SinkRef> {
        self.default.clone()
    }

    pub fn sink(&self, name: &str) -> Result<SinkRef, SinkError> {
        self.sinks
            .get(name)
            .map(SinkBinding::sink)
            .ok_or_else(|| SinkError::NoSuchSink(name.to_string()))
    }

    /// The queue behind `name`; sink sets have none.
    pub fn queue(&self, name: &str) -> Result<Queue, SinkError> {
        match self.sinks.get(name) {
            Some(SinkBinding::Stage(queue)) => Ok(queue.clone()),
            _ => Err(SinkError::NoSuchSink(name.to_string())),
        }
    }

    pub fn binding(&self, name: &str) -> Option<&SinkBinding> {
        self.sinks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sinks.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sinks.keys().map(String::as_str)
    }

    /// Adds every entry of `other`; the existing default wins.
    pub fn merge(&mut self, other: &SinkMap) -> Result<(), Error> {
        for (name, binding) in &other.sinks {
            self.insert(name.clone(), binding.clone())?;
        }
        if self.default.is_none() {
            self.default = other.default.clone();
        }
        Ok(())
    }
}

impl fmt::Debug for SinkMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.sinks.iter()).finish()
    }
}

/// Several stages addressed as one sink.
#[derive(Clone)]
pub struct SinkSet {
    name: String,
    members: Vec<Queue>,
    policy: DeliveryPolicy,
}

impl SinkSet {
    pub fn new(name: impl Into<String>, members: Vec<Queue>, policy: DeliveryPolicy) -> Self {
        Self {
            name: name.into(),
            members,
            policy,
        }
    }

    pub fn policy(&self) -> DeliveryPolicy {
        self.policy
    }

    fn random_start(&self) -> usize {
        if self.members.len() < 2 {
            return 0;
        }
        rand::thread_rng().gen_range(0..self.members.len())
    }

    fn rotation(&self) -> impl Iterator<Item = &Queue> {
        let start = self.random_start();
        self.members.iter().cycle().skip(start).take(self.members.len())
    }

    fn empty_error(&self) -> SinkError {
        SinkError::NoSuchSink(self.name.clone())
    }

    fn offer_one(&self, mut event: BoxedEvent) -> Result<(), Rejected> {
        let mut last_error = None;
        for member in self.rotation() {
            match member.offer(event) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    last_error = Some(rejected.error);
                    event = rejected.event;
                }
            }
        }
        let error = last_error.unwrap_or_else(|| self.empty_error());
        Err(Rejected { error, event })
    }
}

fn replicate(events: &[BoxedEvent]) -> Result<Vec<BoxedEvent>, SinkError> {
    events
        .iter()
        .map(|e| {
            e.try_clone()
                .ok_or_else(|| SinkError::Unreplicable(e.event_type().name()))
        })
        .collect()
}

/// One copy of `events` per member, the originals going to the last one.
fn copies_for(members: usize, events: Vec<BoxedEvent>) -> Result<Vec<Vec<BoxedEvent>>, SinkError> {
    let mut copies = Vec::with_capacity(members);
    for _ in 1..members {
        copies.push(replicate(&events)?);
    }
    copies.push(events);
    Ok(copies)
}

impl Sink for SinkSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn offer(&self, event: BoxedEvent) -> Result<(), Rejected> {
        if self.members.is_empty() {
            return Err(Rejected {
                error: self.empty_error(),
                event,
            });
        }
        if self.policy == DeliveryPolicy::One {
            return self.offer_one(event);
        }

        // the original stays with us so it can be handed back on failure
        let copies = (0..self.members.len())
            .map(|_| {
                event
                    .try_clone()
                    .ok_or_else(|| SinkError::Unreplicable(event.event_type().name()))
            })
            .collect::<Result<Vec<_>, _>>();
        let copies = match copies {
            Ok(copies) => copies,
            Err(_) if self.members.len() == 1 => return self.members[0].offer(event),
            Err(error) => return Err(Rejected { error, event }),
        };

        if self.policy == DeliveryPolicy::All {
            let mut reservations = Vec::with_capacity(self.members.len());
            for member in &self.members {
                match member.reserve(1) {
                    Ok(r) => reservations.push(r),
                    Err(error) => return Err(Rejected { error, event }),
                }
            }
            let parts = reservations
                .into_iter()
                .zip(copies)
                .map(|(r, copy)| (r, vec![copy]))
                .collect();
            return PreparedEnqueue::new(parts)
                .commit()
                .map_err(|error| Rejected { error, event });
        }

        let mut first_error = None;
        let mut delivered = 0;
        for (member, copy) in self.members.iter().zip(copies) {
            match member.offer(copy) {
                Ok(()) => delivered += 1,
                Err(rejected) => {
                    first_error.get_or_insert(rejected.error);
                }
            }
        }
        match (self.policy, delivered, first_error) {
            (DeliveryPolicy::AtLeastOne, 0, Some(error)) => Err(Rejected { error, event }),
            _ => Ok(()),
        }
    }

    fn prepare_enqueue(&self, events: Vec<BoxedEvent>) -> Result<PreparedEnqueue, SinkError> {
        if self.members.is_empty() {
            return Err(self.empty_error());
        }
        let count = events.len();
        match self.policy {
            DeliveryPolicy::One => {
                let mut last_error = None;
                for member in self.rotation() {
                    match member.reserve(count) {
                        Ok(r) => return Ok(PreparedEnqueue::new(vec![(r, events)])),
                        Err(e) => last_error = Some(e),
                    }
                }
                Err(last_error.unwrap_or_else(|| self.empty_error()))
            }
            DeliveryPolicy::All => {
                let reservations = self
                    .members
                    .iter()
                    .map(|m| m.reserve(count))
                    .collect::<Result<Vec<_>, _>>()?;
                let copies = copies_for(self.members.len(), events)?;
                Ok(PreparedEnqueue::new(
                    reservations.into_iter().zip(copies).collect(),
                ))
            }
            DeliveryPolicy::AtLeastOne | DeliveryPolicy::ZeroOrMore => {
                let mut first_error = None;
                let reservations: Vec<_> = self
                    .members
                    .iter()
                    .filter_map(|m| match m.reserve(count) {
                        Ok(r) => Some(r),
                        Err(e) => {
                            first_error.get_or_insert(e);
                            None
                        }
                    })
                    .collect();
                if reservations.is_empty() && self.policy == DeliveryPolicy::AtLeastOne {
                    return Err(first_error.unwrap_or_else(|| self.empty_error()));
                }
                if reservations.is_empty() {
                    return Ok(PreparedEnqueue::new(Vec::new()));
                }
                let copies = copies_for(reservations.len(), events)?;
                Ok(PreparedEnqueue::new(
                    reservations.into_iter().zip(copies).collect(),
                ))
            }
        }
    }

    fn size(&self) -> usize {
        self.members.iter().map(Queue::size).sum()
    }

    fn capacity(&self) -> Option<usize> {
        self.members.iter().map(Queue::capacity).sum()
    }
}

impl fmt::Debug for SinkSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let members: Vec<_> = self.members.iter().map(Queue::name).collect();
        f.debug_struct("SinkSet")
            .field("name", &self.name)
            .field("members", &members)
            .field("policy", &self.policy)
            .finish()
    }
}
