//! Readiness multiplexing for the socket stages.
//!
//! A [`Selector`] wraps one `mio::Poll`. Channels are registered by raw file
//! descriptor, so one socket can sit in the read selector and in the write
//! selector at the same time, each registration being a [`SelectionKey`].
//!
//! mio reports readiness edge-triggered; keys turn that into level-triggered
//! readiness: a ready bit stays set until the handler clears it after hitting
//! `WouldBlock`, and [`Selector::select`] keeps returning the key meanwhile.
//! A key is handed out at most once at a time: it becomes selectable again
//! when the [`Readiness`] event carrying it is dropped.
use std::{
    collections::HashMap,
    fmt, io,
    ops::BitOr,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use mio::{event::Event as MioEvent, unix::SourceFd, Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use stagehand_core::{impl_event, EventType};
use tracing::debug;

use crate::socket::state::{ConnectSocketState, ListenSocketState, ReadWriteSocketState};

mod interceptor;

pub use interceptor::SelectorInterceptor;

const WAKE_TOKEN: Token = Token(0);

/// Interest and readiness bits of a selection key.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Ops(u8);

impl Ops {
    pub const EMPTY: Ops = Ops(0);
    pub const ACCEPT: Ops = Ops(1);
    pub const READ: Ops = Ops(1 << 1);
    pub const WRITE: Ops = Ops(1 << 2);
    pub const CONNECT: Ops = Ops(1 << 3);
    pub const ALL: Ops = Ops(0b1111);

    const READABLE: Ops = Ops(Self::ACCEPT.0 | Self::READ.0);
    const WRITABLE: Ops = Ops(Self::WRITE.0 | Self::CONNECT.0);

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, other: Ops) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: Ops) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn intersection(self, other: Ops) -> Ops {
        Ops(self.0 & other.0)
    }

    #[inline]
    pub fn difference(self, other: Ops) -> Ops {
        Ops(self.0 & !other.0)
    }

    fn interest(self) -> Option<Interest> {
        match (self.intersects(Self::READABLE), self.intersects(Self::WRITABLE)) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn from_event(event: &MioEvent) -> Ops {
        let mut ops = Ops::EMPTY;
        // errors and hang-ups wake both sides up; the handlers find out
        // what happened from the socket itself
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            ops = ops | Self::READABLE;
        }
        if event.is_writable() || event.is_write_closed() || event.is_error() {
            ops = ops | Self::WRITABLE;
        }
        ops
    }
}

impl BitOr for Ops {
    type Output = Ops;

    fn bitor(self, rhs: Ops) -> Ops {
        Ops(self.0 | rhs.0)
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Ops::ACCEPT, "ACCEPT"),
            (Ops::READ, "READ"),
            (Ops::WRITE, "WRITE"),
            (Ops::CONNECT, "CONNECT"),
        ];
        let set: Vec<_> = names
            .iter()
            .filter(|(op, _)| self.contains(*op))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", set.join("|"))
    }
}

/// Non-owning link from a key back to the socket state it serves.
#[derive(Clone)]
pub(crate) enum Attachment {
    Listen(Weak<ListenSocketState>),
    Connect(Weak<ConnectSocketState>),
    Stream(Weak<ReadWriteSocketState>),
}

struct SelectorShared {
    registry: Registry,
    waker: Waker,
    closed: AtomicBool,
    next_token: AtomicUsize,
    keys: Mutex<HashMap<Token, Arc<SelectionKey>>>,
}

impl SelectorShared {
    /// A wake that lands outside `select` makes the next one return at once.
    fn wakeup(&self) {
        if let Err(e) = self.waker.wake() {
            debug!("selector wakeup failed: {e}");
        }
    }

    fn keys(&self) -> Vec<Arc<SelectionKey>> {
        self.keys.lock().values().cloned().collect()
    }
}

pub struct Selector {
    poll: Mutex<(Poll, Events)>,
    shared: Arc<SelectorShared>,
}

impl Selector {
    /// `capacity` bounds the OS events collected by one poll.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            poll: Mutex::new((poll, Events::with_capacity(capacity.max(1)))),
            shared: Arc::new(SelectorShared {
                registry,
                waker,
                closed: AtomicBool::new(false),
                next_token: AtomicUsize::new(WAKE_TOKEN.0 + 1),
                keys: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Creates a key for `fd`. Nothing is registered with the OS until an
    /// interest bit is switched on.
    pub fn register(&self, fd: RawFd) -> io::Result<Arc<SelectionKey>> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::Other, "selector is closed"));
        }
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        let key = Arc::new(SelectionKey {
            token,
            fd,
            selector: Arc::downgrade(&self.shared),
            state: Mutex::new(KeyState::default()),
        });
        self.shared.keys.lock().insert(token, key.clone());
        Ok(key)
    }

    /// Waits up to `timeout` for readiness and returns one event per key with
    /// pending ready bits. Returns at once while such keys exist.
    pub fn select(&self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        if self.is_closed() {
            return Ok(Vec::new());
        }
        let pending = self.shared.keys().iter().any(|k| k.has_pending());
        let timeout = if pending { Some(Duration::ZERO) } else { timeout };

        {
            let mut guard = self.poll.lock();
            let (poll, events) = &mut *guard;
            match poll.poll(events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
            let keys = self.shared.keys.lock();
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                if let Some(key) = keys.get(&event.token()) {
                    key.mark_ready(Ops::from_event(event));
                }
            }
        }

        Ok(self
            .shared
            .keys()
            .into_iter()
            .filter_map(|key| key.take_pending().map(|ops| Readiness { key, ops }))
            .collect())
    }

    /// Interrupts a `select` blocked in another thread.
    pub fn wakeup(&self) {
        self.shared.wakeup();
    }

    /// Closes every key; later selects return nothing.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for key in self.shared.keys() {
            key.close();
        }
        if let Err(e) = self.shared.waker.wake() {
            debug!("selector wakeup failed: {e}");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of open keys.
    pub fn len(&self) -> usize {
        self.shared.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("keys", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Default)]
struct KeyState {
    interest: Ops,
    ready: Ops,
    registered: bool,
    // a Readiness event for this key is alive
    in_flight: bool,
    closed: bool,
    attachment: Option<Attachment>,
}

impl KeyState {
    fn pending(&self) -> Ops {
        if self.closed || self.in_flight {
            return Ops::EMPTY;
        }
        self.ready.intersection(self.interest)
    }
}

/// One channel registered with a [`Selector`].
pub struct SelectionKey {
    token: Token,
    fd: RawFd,
    selector: Weak<SelectorShared>,
    state: Mutex<KeyState>,
}

impl SelectionKey {
    pub fn subscribe_accept(&self, on: bool) -> io::Result<()> {
        self.subscribe(Ops::ACCEPT, on)
    }

    pub fn subscribe_read(&self, on: bool) -> io::Result<()> {
        self.subscribe(Ops::READ, on)
    }

    pub fn subscribe_write(&self, on: bool) -> io::Result<()> {
        self.subscribe(Ops::WRITE, on)
    }

    pub fn subscribe_connect(&self, on: bool) -> io::Result<()> {
        self.subscribe(Ops::CONNECT, on)
    }

    /// Switches `ops` on or off, leaving the other interest bits untouched.
    pub fn subscribe(&self, ops: Ops, on: bool) -> io::Result<()> {
        let Some(shared) = self.selector.upgrade() else {
            return Err(closed_key());
        };
        let mut state = self.state.lock();
        if state.closed {
            return Err(closed_key());
        }
        let interest = if on {
            state.interest | ops
        } else {
            state.interest.difference(ops)
        };
        let mut source = SourceFd(&self.fd);
        match (state.registered, interest.interest()) {
            (false, Some(i)) => {
                shared.registry.register(&mut source, self.token, i)?;
                state.registered = true;
            }
            (true, Some(i)) => shared.registry.reregister(&mut source, self.token, i)?,
            (true, None) => {
                shared.registry.deregister(&mut source)?;
                state.registered = false;
            }
            (false, None) => {}
        }
        state.interest = interest;
        let pending = !state.pending().is_empty();
        drop(state);
        if pending {
            shared.wakeup();
        }
        Ok(())
    }

    pub fn interest(&self) -> Ops {
        self.state.lock().interest
    }

    /// Ready bits that are also in the interest set.
    pub fn ready(&self) -> Ops {
        let state = self.state.lock();
        state.ready.intersection(state.interest)
    }

    /// Forgets readiness for `ops` until the OS reports it again.
    pub fn clear_ready(&self, ops: Ops) {
        let mut state = self.state.lock();
        state.ready = state.ready.difference(ops);
    }

    pub fn clear(&self) {
        self.clear_ready(Ops::ALL);
    }

    pub(crate) fn attach(&self, attachment: Attachment) {
        self.state.lock().attachment = Some(attachment);
    }

    pub(crate) fn attachment(&self) -> Option<Attachment> {
        self.state.lock().attachment.clone()
    }

    /// Deregisters the channel and invalidates the key. Idempotent.
    pub fn close(&self) {
        let registered = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.attachment = None;
            std::mem::take(&mut state.registered)
        };
        let Some(shared) = self.selector.upgrade() else {
            return;
        };
        if registered {
            if let Err(e) = shared.registry.deregister(&mut SourceFd(&self.fd)) {
                debug!(fd = self.fd, "deregister failed: {e}");
            }
        }
        shared.keys.lock().remove(&self.token);
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn has_pending(&self) -> bool {
        !self.state.lock().pending().is_empty()
    }

    fn mark_ready(&self, ops: Ops) {
        let mut state = self.state.lock();
        state.ready = state.ready | ops;
    }

    fn take_pending(&self) -> Option<Ops> {
        let mut state = self.state.lock();
        let pending = state.pending();
        if pending.is_empty() {
            return None;
        }
        state.in_flight = true;
        Some(pending)
    }

    fn release(&self) {
        let pending = {
            let mut state = self.state.lock();
            state.in_flight = false;
            !state.pending().is_empty()
        };
        if pending {
            if let Some(shared) = self.selector.upgrade() {
                shared.wakeup();
            }
        }
    }
}

impl fmt::Debug for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SelectionKey")
            .field("fd", &self.fd)
            .field("interest", &state.interest)
            .field("ready", &state.ready)
            .field("closed", &state.closed)
            .finish()
    }
}

fn closed_key() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "selection key is closed")
}

pub static READINESS: EventType = EventType::root("selector.readiness");

/// A key reported ready by [`Selector::select`].
///
/// Dropping the event makes the key selectable again.
pub struct Readiness {
    key: Arc<SelectionKey>,
    ops: Ops,
}

impl Readiness {
    #[inline]
    pub fn key(&self) -> &Arc<SelectionKey> {
        &self.key
    }

    /// Ready bits at selection time.
    #[inline]
    pub fn ops(&self) -> Ops {
        self.ops
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        self.key.release();
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("fd", &self.key.fd)
            .field("ops", &self.ops)
            .finish()
    }
}

impl_event!(Readiness, READINESS);

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        net::{TcpListener, TcpStream},
        os::fd::AsRawFd,
    };

    use super::*;

    const TICK: Option<Duration> = Some(Duration::from_millis(200));

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server)
    }

    #[test]
    fn readiness_is_sticky_until_cleared() {
        let selector = Selector::new(16).unwrap();
        let (mut client, server) = pair();
        let key = selector.register(server.as_raw_fd()).unwrap();
        key.subscribe_read(true).unwrap();
        assert!(selector.select(Some(Duration::ZERO)).unwrap().is_empty());

        client.write_all(b"ping").unwrap();
        let ready = selector.select(TICK).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].ops().contains(Ops::READ));

        // still in flight: not handed out twice
        assert!(selector.select(Some(Duration::ZERO)).unwrap().is_empty());
        drop(ready);
        assert_eq!(selector.select(Some(Duration::ZERO)).unwrap().len(), 1);

        key.clear_ready(Ops::READ);
        assert!(selector.select(Some(Duration::ZERO)).unwrap().is_empty());
    }

    #[test]
    fn interest_masks_readiness() {
        let selector = Selector::new(16).unwrap();
        let (_client, server) = pair();
        let key = selector.register(server.as_raw_fd()).unwrap();
        key.subscribe_write(true).unwrap();
        let ready = selector.select(TICK).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].ops(), Ops::WRITE);
        drop(ready);

        key.subscribe_write(false).unwrap();
        assert_eq!(key.interest(), Ops::EMPTY);
        assert!(selector.select(Some(Duration::ZERO)).unwrap().is_empty());
        key.subscribe_write(true).unwrap();
        assert_eq!(selector.select(Some(Duration::ZERO)).unwrap().len(), 1);
    }

    #[test]
    fn closed_keys_are_forgotten() {
        let selector = Selector::new(16).unwrap();
        let (_client, server) = pair();
        let key = selector.register(server.as_raw_fd()).unwrap();
        key.subscribe_write(true).unwrap();
        assert_eq!(selector.len(), 1);
        key.close();
        key.close();
        assert!(key.is_closed());
        assert!(selector.is_empty());
        assert!(key.subscribe_read(true).is_err());
        assert!(selector.select(Some(Duration::ZERO)).unwrap().is_empty());

        selector.close();
        assert!(selector.register(server.as_raw_fd()).is_err());
    }

    #[test]
    fn wakeup_interrupts_select() {
        let selector = Arc::new(Selector::new(16).unwrap());
        let waiter = {
            let selector = selector.clone();
            std::thread::spawn(move || {
                let started = std::time::Instant::now();
                selector.select(Some(Duration::from_secs(10))).unwrap();
                started.elapsed()
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        selector.wakeup();
        assert!(waiter.join().unwrap() < Duration::from_secs(5));
    }

    #[test]
    fn wakeup_before_select_is_not_lost() {
        let selector = Selector::new(16).unwrap();
        selector.wakeup();
        selector.wakeup();
        let started = std::time::Instant::now();
        assert!(selector.select(Some(Duration::from_secs(10))).unwrap().is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
