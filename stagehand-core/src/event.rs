//! Events and their type tags.
//!
//! Every element travelling through a stage queue is a boxed [`Event`]. Events
//! carry a static [`EventType`] which places them in an explicit hierarchy, so
//! type-dispatching pipelines can route a derived event to the handler of one of
//! its ancestors without any runtime reflection.
use std::{
    any::Any,
    fmt,
    hash::{Hash, Hasher},
};

use crate::AnyError;

pub type BoxedEvent = Box<dyn Event>;

/// Static type tag of an event.
///
/// Tags are compared by name, which therefore has to be unique within a process.
pub struct EventType {
    name: &'static str,
    parent: Option<&'static EventType>,
}

impl EventType {
    pub const fn root(name: &'static str) -> Self {
        Self { name, parent: None }
    }

    pub const fn derived(name: &'static str, parent: &'static EventType) -> Self {
        Self {
            name,
            parent: Some(parent),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn parent(&self) -> Option<&'static EventType> {
        self.parent
    }

    /// Walks from this type up to its root, this type first.
    pub fn ancestors(&'static self) -> Ancestors {
        Ancestors { next: Some(self) }
    }

    /// Returns true if `other` is this type or one of its ancestors.
    pub fn is_a(&'static self, other: &EventType) -> bool {
        self.ancestors().any(|t| t == other)
    }
}

impl PartialEq for EventType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for EventType {}

impl Hash for EventType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state)
    }
}

impl fmt::Debug for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

pub struct Ancestors {
    next: Option<&'static EventType>,
}

impl Iterator for Ancestors {
    type Item = &'static EventType;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent;
        Some(current)
    }
}

/// An element that can be queued between stages.
///
/// Implement it with [`impl_event!`](crate::impl_event) rather than by hand.
pub trait Event: Any + Send + fmt::Debug {
    fn event_type(&self) -> &'static EventType;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;

    /// A copy used when one event has to reach several sinks. `None` means the
    /// event cannot be replicated.
    fn try_clone(&self) -> Option<BoxedEvent> {
        None
    }
}

impl dyn Event {
    #[inline]
    pub fn is<T: Event>(&self) -> bool {
        self.as_any().is::<T>()
    }

    #[inline]
    pub fn downcast_ref<T: Event>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast<T: Event>(self: Box<Self>) -> Result<Box<T>, Box<Self>> {
        if !self.is::<T>() {
            return Err(self);
        }
        match self.into_any().downcast::<T>() {
            Ok(event) => Ok(event),
            Err(_) => unreachable!(),
        }
    }
}

/// Implements [`Event`] for a type with the given static [`EventType`].
///
/// ```ignore
/// pub static PING: EventType = EventType::root("ping");
/// #[derive(Debug, Clone)]
/// pub struct Ping;
/// impl_event!(Ping, PING, clone);
/// ```
#[macro_export]
macro_rules! impl_event {
    ($ty: ty, $tag: expr) => {
        impl $crate::event::Event for $ty {
            fn event_type(&self) -> &'static $crate::event::EventType {
                &$tag
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn into_any(self: Box<Self>) -> Box<dyn ::std::any::Any + Send> {
                self
            }
        }
    };
    ($ty: ty, $tag: expr, clone) => {
        impl $crate::event::Event for $ty {
            fn event_type(&self) -> &'static $crate::event::EventType {
                &$tag
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn into_any(self: Box<Self>) -> Box<dyn ::std::any::Any + Send> {
                self
            }

            fn try_clone(&self) -> Option<$crate::event::BoxedEvent> {
                Some(Box::new(self.clone()))
            }
        }
    };
}

pub static HANDLER_FAILED: EventType = EventType::root("stage.handler-failed");

/// Forwarded to a handler's exception sink when the handler returns an error.
#[derive(Debug)]
pub struct HandlerFailedEvent {
    pub stage: String,
    pub signature: &'static str,
    pub error: AnyError,
}

impl_event!(HandlerFailedEvent, HANDLER_FAILED);

#[cfg(test)]
mod tests {
    use super::*;

    static ANIMAL: EventType = EventType::root("test.animal");
    static DOG: EventType = EventType::derived("test.animal.dog", &ANIMAL);
    static PUPPY: EventType = EventType::derived("test.animal.dog.puppy", &DOG);
    static ROCK: EventType = EventType::root("test.rock");

    #[derive(Debug, Clone, PartialEq)]
    struct Puppy(u32);
    impl_event!(Puppy, PUPPY, clone);

    #[derive(Debug)]
    struct Rock;
    impl_event!(Rock, ROCK);

    #[test]
    fn ancestors_walk_to_root() {
        let names: Vec<_> = PUPPY.ancestors().map(EventType::name).collect();
        assert_eq!(
            names,
            ["test.animal.dog.puppy", "test.animal.dog", "test.animal"]
        );
        assert!(PUPPY.is_a(&ANIMAL));
        assert!(!ANIMAL.is_a(&DOG));
        assert!(!ROCK.is_a(&ANIMAL));
    }

    #[test]
    fn downcast_boxed_event() {
        let event: BoxedEvent = Box::new(Puppy(3));
        assert!(event.is::<Puppy>());
        assert_eq!(event.downcast_ref::<Puppy>(), Some(&Puppy(3)));
        let event = match event.downcast::<Rock>() {
            Ok(_) => panic!("a puppy is not a rock"),
            Err(event) => event,
        };
        assert_eq!(*event.downcast::<Puppy>().unwrap(), Puppy(3));
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Pebble(&'static str);
    impl_event!(Pebble, ROCK, clone);

    #[test]
    fn downcast_checks_the_concrete_type_not_the_tag() {
        let event: BoxedEvent = Box::new(Pebble("granite"));
        assert_eq!(event.event_type(), Rock.event_type());
        let event = event.downcast::<Rock>().unwrap_err();
        let pebble = event.downcast::<Pebble>().unwrap();
        assert_eq!(pebble.0, "granite");
    }

    #[test]
    fn clone_only_when_declared() {
        let puppy: BoxedEvent = Box::new(Puppy(1));
        let rock: BoxedEvent = Box::new(Rock);
        assert!(puppy.try_clone().is_some());
        assert!(rock.try_clone().is_none());
    }
}
