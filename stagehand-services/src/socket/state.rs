//! Per-socket state machines driven by the socket stages.
//!
//! Each state sits behind its own mutex: requests, readiness handling and close
//! of one socket are serialized, distinct sockets never contend.
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::Shutdown,
    os::fd::{AsRawFd, RawFd},
    sync::{Arc, Weak},
};

use bytes::BytesMut;
use mio::net::{TcpListener, TcpStream};
use parking_lot::Mutex;
use stagehand_core::{queue::Rejected, BoxedEvent, Sink, SinkRef};
use tracing::{debug, error, warn};

use super::{
    connection::{ConnectionContext, Origin},
    ClientSocket, ConnectionManager, IncomingPacket, ServerSocket, SocketId, TcpConnection,
    Tuning,
};
use crate::{
    buffer::Buffer,
    event::{
        ConnectFailedEvent, ConnectionClosedEvent, ConnectionDrainedEvent,
        ConnectionFlushedEvent, ServerSocketClosedEvent,
    },
    selector::{Attachment, Ops, SelectionKey, Selector},
};

/// Packet sequence numbers skip the "unspecified" value 0 when they wrap.
#[inline]
pub(crate) fn next_sequence(current: u64) -> u64 {
    current.checked_add(1).unwrap_or(1)
}

fn closed_socket() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket is closed")
}

fn register(
    selector: &Selector,
    fd: RawFd,
    attachment: Attachment,
    ops: Ops,
) -> io::Result<Arc<SelectionKey>> {
    let key = selector.register(fd)?;
    key.attach(attachment);
    if let Err(e) = key.subscribe(ops, true) {
        key.close();
        return Err(e);
    }
    Ok(key)
}

pub(crate) enum StreamRequest {
    Write(Buffer),
    Flush(Option<SinkRef>),
    Close(Option<SinkRef>),
}

/// Why [`ReadWriteSocketState::add_request`] handed a request back.
pub(crate) enum Refused {
    Clogged(StreamRequest),
    Closed(StreamRequest),
}

enum Progress {
    Done,
    Partial,
    Blocked,
    Failed(io::Error),
}

/// State of an established connection.
pub(crate) struct ReadWriteSocketState {
    connection: TcpConnection,
    manager: Weak<ConnectionManager>,
    tuning: Tuning,
    inner: Mutex<StreamState>,
}

struct StreamState {
    stream: Option<TcpStream>,
    closed: bool,
    read_key: Option<Arc<SelectionKey>>,
    write_key: Option<Arc<SelectionKey>>,

    completion: Option<SinkRef>,
    read_clog_tries: Option<usize>,
    clogged: Option<BoxedEvent>,
    clog_attempts: usize,
    sequence: u64,

    requests: VecDeque<StreamRequest>,
    write_offset: usize,
    empty_writes: usize,
    write_clog_threshold: Option<usize>,
}

impl StreamState {
    fn fd(&self) -> io::Result<RawFd> {
        self.stream
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(closed_socket)
    }
}

impl Drop for StreamState {
    fn drop(&mut self) {
        // keys go before the descriptor they were registered with
        for key in [self.read_key.take(), self.write_key.take()]
            .into_iter()
            .flatten()
        {
            key.close();
        }
    }
}

impl ReadWriteSocketState {
    /// Creates the state and attaches it to `connection`.
    pub fn new(
        connection: TcpConnection,
        stream: TcpStream,
        manager: Weak<ConnectionManager>,
        tuning: Tuning,
        write_clog_threshold: Option<usize>,
    ) -> Arc<Self> {
        let state = Arc::new(Self {
            connection: connection.clone(),
            manager,
            tuning,
            inner: Mutex::new(StreamState {
                stream: Some(stream),
                closed: false,
                read_key: None,
                write_key: None,
                completion: None,
                read_clog_tries: None,
                clogged: None,
                clog_attempts: 0,
                sequence: 0,
                requests: VecDeque::new(),
                write_offset: 0,
                empty_writes: 0,
                write_clog_threshold,
            }),
        });
        connection.attach(&state);
        state
    }

    #[inline]
    pub fn id(&self) -> SocketId {
        self.connection.id()
    }

    pub fn connection(&self) -> &TcpConnection {
        &self.connection
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Registers for read readiness; packets go to `completion` from now on.
    pub fn start_read(
        self: &Arc<Self>,
        selector: &Selector,
        completion: SinkRef,
        clog_tries: Option<usize>,
    ) -> io::Result<()> {
        let mut guard = self.inner.lock();
        let st = &mut *guard;
        if st.closed {
            return Err(closed_socket());
        }
        st.completion = Some(completion);
        st.read_clog_tries = clog_tries;
        if st.read_key.is_none() {
            let attachment = Attachment::Stream(Arc::downgrade(self));
            st.read_key = Some(register(selector, st.fd()?, attachment, Ops::READ)?);
        }
        Ok(())
    }

    /// Handles one read readiness.
    pub fn read(&self) {
        let mut guard = self.inner.lock();
        let st = &mut *guard;
        if st.closed {
            return;
        }
        let Some(completion) = st.completion.clone() else {
            return;
        };

        if let Some(packet) = st.clogged.take() {
            match completion.offer(packet) {
                Ok(()) => st.clog_attempts = 0,
                Err(Rejected { error, event }) if error.is_recoverable() => {
                    st.clog_attempts += 1;
                    if st.read_clog_tries.is_some_and(|max| st.clog_attempts >= max) {
                        warn!(
                            connection = %self.id(),
                            "dropping packet refused {} times by {}",
                            st.clog_attempts,
                            completion.name()
                        );
                        st.clog_attempts = 0;
                    } else {
                        st.clogged = Some(event);
                    }
                }
                Err(Rejected { error, .. }) => {
                    debug!(connection = %self.id(), "read completion unusable: {error}");
                    self.close_locked(st, None);
                }
            }
            return;
        }

        let Some(stream) = st.stream.as_mut() else {
            return;
        };
        let mut buf = BytesMut::zeroed(self.tuning.read_buffer_size);
        match stream.read(&mut buf) {
            Ok(0) => {
                debug!(connection = %self.id(), "peer closed the connection");
                self.close_locked(st, None);
            }
            Ok(n) => {
                buf.truncate(n);
                st.sequence = next_sequence(st.sequence);
                let packet = IncomingPacket {
                    connection: self.connection.clone(),
                    buffer: Buffer::new(buf.freeze()),
                    sequence: st.sequence,
                };
                match completion.offer(Box::new(packet)) {
                    Ok(()) => {}
                    Err(Rejected { error, event }) if error.is_recoverable() => {
                        st.clogged = Some(event);
                        st.clog_attempts = 0;
                    }
                    Err(Rejected { error, .. }) => {
                        debug!(connection = %self.id(), "read completion unusable: {error}");
                        self.close_locked(st, None);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!(connection = %self.id(), "spurious read wakeup");
                if let Some(key) = &st.read_key {
                    key.clear_ready(Ops::READ);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(connection = %self.id(), "read failed: {e}");
                self.close_locked(st, None);
            }
        }
    }

    /// Queues a write, flush or close behind the outstanding requests.
    ///
    /// A close request refused for clogging closes the connection at once.
    pub fn add_request(
        self: &Arc<Self>,
        request: StreamRequest,
        selector: &Selector,
    ) -> Result<(), Refused> {
        let mut guard = self.inner.lock();
        let st = &mut *guard;
        if st.closed {
            return Err(Refused::Closed(request));
        }
        if st
            .write_clog_threshold
            .is_some_and(|max| st.requests.len() > max)
        {
            if let StreamRequest::Close(completion) = request {
                warn!(connection = %self.id(), "clogged, closing without draining");
                self.close_locked(st, completion);
                return Ok(());
            }
            warn!(
                connection = %self.id(),
                "{} requests outstanding, refusing another",
                st.requests.len()
            );
            return Err(Refused::Clogged(request));
        }
        if let Err(e) = self.enable_writes(st, selector) {
            debug!(connection = %self.id(), "cannot watch for write readiness: {e}");
            self.close_locked(st, None);
            return Err(Refused::Closed(request));
        }
        st.requests.push_back(request);
        Ok(())
    }

    fn enable_writes(self: &Arc<Self>, st: &mut StreamState, selector: &Selector) -> io::Result<()> {
        match &st.write_key {
            Some(key) => {
                if !key.interest().contains(Ops::WRITE) {
                    st.empty_writes = 0;
                    key.subscribe_write(true)?;
                }
            }
            None => {
                let attachment = Attachment::Stream(Arc::downgrade(self));
                st.write_key = Some(register(selector, st.fd()?, attachment, Ops::WRITE)?);
            }
        }
        Ok(())
    }

    /// Handles one write readiness.
    pub fn write(&self) {
        let mut guard = self.inner.lock();
        let st = &mut *guard;
        if st.closed {
            return;
        }
        if st.requests.is_empty() {
            st.empty_writes += 1;
            if self
                .tuning
                .write_disable_threshold
                .is_some_and(|max| st.empty_writes >= max)
            {
                if let Some(key) = &st.write_key {
                    if let Err(e) = key.subscribe_write(false) {
                        debug!(connection = %self.id(), "cannot drop write interest: {e}");
                    }
                }
                st.empty_writes = 0;
            }
            return;
        }
        st.empty_writes = 0;

        let mut served = 0;
        while self.tuning.max_write_requests.map_or(true, |max| served < max) {
            let Some(request) = st.requests.pop_front() else {
                break;
            };
            served += 1;
            match request {
                StreamRequest::Write(buffer) => match self.drain(st, &buffer) {
                    Progress::Done => {
                        st.write_offset = 0;
                        let target = buffer
                            .completion()
                            .cloned()
                            .or_else(|| self.connection.completion().cloned());
                        if let Some(target) = target {
                            target.try_enqueue(Box::new(ConnectionDrainedEvent {
                                connection: self.connection.clone(),
                                buffer,
                            }));
                        }
                    }
                    Progress::Partial => {
                        st.requests.push_front(StreamRequest::Write(buffer));
                        return;
                    }
                    Progress::Blocked => {
                        st.requests.push_front(StreamRequest::Write(buffer));
                        if let Some(key) = &st.write_key {
                            key.clear_ready(Ops::WRITE);
                        }
                        return;
                    }
                    Progress::Failed(e) => {
                        debug!(connection = %self.id(), "write failed: {e}");
                        self.close_locked(st, None);
                        return;
                    }
                },
                StreamRequest::Flush(completion) => {
                    let target = completion.or_else(|| self.connection.completion().cloned());
                    if let Some(target) = target {
                        target.try_enqueue(Box::new(ConnectionFlushedEvent {
                            connection: self.connection.clone(),
                        }));
                    }
                }
                StreamRequest::Close(completion) => {
                    self.close_locked(st, completion);
                    return;
                }
            }
        }
    }

    fn drain(&self, st: &mut StreamState, buffer: &Buffer) -> Progress {
        let Some(stream) = st.stream.as_mut() else {
            return Progress::Failed(closed_socket());
        };
        let data = buffer.as_slice();
        for _ in 0..self.tuning.write_spin_count {
            if st.write_offset >= data.len() {
                break;
            }
            let end = data.len().min(st.write_offset + self.tuning.max_write_chunk);
            match stream.write(&data[st.write_offset..end]) {
                Ok(0) => return Progress::Failed(io::ErrorKind::WriteZero.into()),
                Ok(n) => st.write_offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Progress::Blocked,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Progress::Failed(e),
            }
        }
        if st.write_offset >= data.len() {
            Progress::Done
        } else {
            Progress::Partial
        }
    }

    /// Closes the connection; `completion`, else the read completion, else
    /// the connection's completion hears about it. Idempotent.
    pub fn close(&self, completion: Option<SinkRef>) {
        let mut guard = self.inner.lock();
        self.close_locked(&mut guard, completion);
    }

    fn close_locked(&self, st: &mut StreamState, completion: Option<SinkRef>) {
        if st.closed {
            return;
        }
        st.closed = true;
        for key in [st.read_key.take(), st.write_key.take()]
            .into_iter()
            .flatten()
        {
            key.close();
        }
        if let Some(stream) = st.stream.take() {
            if let Err(e) = stream.shutdown(Shutdown::Both) {
                debug!(connection = %self.id(), "shutdown failed: {e}");
            }
        }
        st.requests.clear();
        st.clogged = None;

        if let Some(manager) = self.manager.upgrade() {
            manager.forget(self.id());
        }
        let target = completion
            .or_else(|| st.completion.take())
            .or_else(|| self.connection.completion().cloned());
        if let Some(target) = target {
            target.try_enqueue(Box::new(ConnectionClosedEvent {
                connection: self.connection.clone(),
            }));
        }
    }
}

/// State of an outgoing connection until it is established.
pub(crate) struct ConnectSocketState {
    socket: ClientSocket,
    manager: Weak<ConnectionManager>,
    completion: SinkRef,
    context: ConnectionContext,
    tuning: Tuning,
    write_clog_threshold: Option<usize>,
    clog_tries: Option<usize>,
    inner: Mutex<ConnectState>,
}

struct ConnectState {
    stream: Option<TcpStream>,
    key: Option<Arc<SelectionKey>>,
    attempts: usize,
}

impl Drop for ConnectState {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            key.close();
        }
    }
}

pub(crate) struct ConnectParams {
    pub completion: SinkRef,
    pub context: ConnectionContext,
    pub tuning: Tuning,
    pub write_clog_threshold: Option<usize>,
    pub clog_tries: Option<usize>,
}

impl ConnectSocketState {
    pub fn new(
        socket: ClientSocket,
        stream: TcpStream,
        manager: Weak<ConnectionManager>,
        params: ConnectParams,
    ) -> Arc<Self> {
        Arc::new(Self {
            socket,
            manager,
            completion: params.completion,
            context: params.context,
            tuning: params.tuning,
            write_clog_threshold: params.write_clog_threshold,
            clog_tries: params.clog_tries,
            inner: Mutex::new(ConnectState {
                stream: Some(stream),
                key: None,
                attempts: 0,
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> SocketId {
        self.socket.id()
    }

    /// Waits for the connect to complete on `selector`.
    pub fn start(self: &Arc<Self>, selector: &Selector) -> io::Result<()> {
        let mut st = self.inner.lock();
        let fd = st
            .stream
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(closed_socket)?;
        let attachment = Attachment::Connect(Arc::downgrade(self));
        st.key = Some(register(selector, fd, attachment, Ops::CONNECT)?);
        Ok(())
    }

    /// Handles one connect readiness.
    pub fn connect(&self) {
        let mut guard = self.inner.lock();
        let st = &mut *guard;
        let Some(stream) = st.stream.as_ref() else {
            return;
        };
        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                self.fail_locked(st, e);
                return;
            }
        }

        let connection = TcpConnection::new(
            self.socket.id(),
            Origin::Connected(self.socket),
            self.socket.addr(),
            Some(self.completion.clone()),
            self.context.clone(),
        );
        let prepared = match self
            .completion
            .prepare_enqueue(vec![Box::new(connection.clone()) as BoxedEvent])
        {
            Ok(prepared) => prepared,
            Err(e) if e.is_recoverable() => {
                st.attempts += 1;
                if self.clog_tries.is_some_and(|max| st.attempts > max) {
                    warn!(
                        socket = %self.id(),
                        "{} refused the connection {} times, dropping it",
                        self.completion.name(),
                        st.attempts
                    );
                    self.close_locked(st);
                }
                return;
            }
            Err(e) => {
                warn!(socket = %self.id(), "cannot deliver connection: {e}");
                self.close_locked(st);
                return;
            }
        };

        match stream.peer_addr() {
            Ok(_) => {}
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                prepared.abort();
                if let Some(key) = &st.key {
                    key.clear_ready(Ops::CONNECT);
                }
                return;
            }
            Err(e) => {
                prepared.abort();
                self.fail_locked(st, e);
                return;
            }
        }

        let Some(stream) = st.stream.take() else {
            return;
        };
        if let Some(key) = st.key.take() {
            key.close();
        }
        let state = ReadWriteSocketState::new(
            connection,
            stream,
            self.manager.clone(),
            self.tuning,
            self.write_clog_threshold,
        );
        if let Some(manager) = self.manager.upgrade() {
            manager.forget_connect(self.id());
            manager.track(state.clone());
        }
        if let Err(e) = prepared.commit() {
            warn!(socket = %self.id(), "connection lost on commit: {e}");
            state.close(None);
        }
    }

    pub fn close(&self) {
        let mut guard = self.inner.lock();
        self.close_locked(&mut guard);
    }

    /// Abandons the attempt and reports `e` to the completion sink.
    pub fn fail(&self, e: io::Error) {
        let mut guard = self.inner.lock();
        self.fail_locked(&mut guard, e);
    }

    fn close_locked(&self, st: &mut ConnectState) {
        if let Some(key) = st.key.take() {
            key.close();
        }
        st.stream = None;
        if let Some(manager) = self.manager.upgrade() {
            manager.forget_connect(self.id());
        }
    }

    fn fail_locked(&self, st: &mut ConnectState, e: io::Error) {
        debug!(socket = %self.id(), addr = %self.socket.addr(), "connect failed: {e}");
        self.close_locked(st);
        self.completion.try_enqueue(Box::new(ConnectFailedEvent {
            socket: self.socket,
            message: e.to_string(),
        }));
    }
}

/// State of a listening socket.
pub(crate) struct ListenSocketState {
    server: ServerSocket,
    manager: Weak<ConnectionManager>,
    completion: SinkRef,
    context: ConnectionContext,
    tuning: Tuning,
    write_clog_threshold: Option<usize>,
    max_accepts: Option<usize>,
    inner: Mutex<ListenState>,
}

struct ListenState {
    listener: Option<TcpListener>,
    key: Option<Arc<SelectionKey>>,
}

impl Drop for ListenState {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            key.close();
        }
    }
}

pub(crate) struct ListenParams {
    pub completion: SinkRef,
    pub context: ConnectionContext,
    pub tuning: Tuning,
    pub write_clog_threshold: Option<usize>,
    pub max_accepts: Option<usize>,
}

// Accept failures worth retrying on the next readiness: the pending
// connection went away or the process ran out of descriptors.
fn is_transient(e: &io::Error) -> bool {
    const ENFILE: i32 = 23;
    const EMFILE: i32 = 24;
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    ) || matches!(e.raw_os_error(), Some(ENFILE | EMFILE))
}

impl ListenSocketState {
    pub fn new(
        server: ServerSocket,
        listener: TcpListener,
        manager: Weak<ConnectionManager>,
        params: ListenParams,
    ) -> Arc<Self> {
        Arc::new(Self {
            server,
            manager,
            completion: params.completion,
            context: params.context,
            tuning: params.tuning,
            write_clog_threshold: params.write_clog_threshold,
            max_accepts: params.max_accepts,
            inner: Mutex::new(ListenState {
                listener: Some(listener),
                key: None,
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> SocketId {
        self.server.id()
    }

    pub fn server(&self) -> &ServerSocket {
        &self.server
    }

    /// Watches for incoming connections on `selector`.
    pub fn start(self: &Arc<Self>, selector: &Selector) -> io::Result<()> {
        let mut st = self.inner.lock();
        let fd = st
            .listener
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(closed_socket)?;
        let attachment = Attachment::Listen(Arc::downgrade(self));
        st.key = Some(register(selector, fd, attachment, Ops::ACCEPT)?);
        Ok(())
    }

    /// Handles one accept readiness.
    pub fn accept(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let mut guard = self.inner.lock();
        let st = &mut *guard;
        let mut accepted = 0;
        while self.max_accepts.map_or(true, |max| accepted < max) {
            let Some(listener) = st.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((stream, peer)) => {
                    accepted += 1;
                    let connection = TcpConnection::new(
                        manager.next_id(),
                        Origin::Accepted(self.server.clone()),
                        peer,
                        Some(self.completion.clone()),
                        self.context.clone(),
                    );
                    let state = ReadWriteSocketState::new(
                        connection.clone(),
                        stream,
                        self.manager.clone(),
                        self.tuning,
                        self.write_clog_threshold,
                    );
                    manager.track(state.clone());
                    if let Err(e) = self.completion.enqueue(Box::new(connection)) {
                        error!(server = %self.id(), %peer, "cannot deliver accepted connection: {e}");
                        state.close(None);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Some(key) = &st.key {
                        key.clear_ready(Ops::ACCEPT);
                    }
                    break;
                }
                Err(e) if is_transient(&e) => {
                    warn!(server = %self.id(), "accept failed, retrying: {e}");
                    break;
                }
                Err(e) => {
                    error!(server = %self.id(), "accept failed, closing listener: {e}");
                    self.close_locked(st);
                    self.notify_closed();
                    return;
                }
            }
        }
    }

    /// Toggles accept interest.
    pub fn set_accepting(&self, on: bool) -> io::Result<()> {
        let st = self.inner.lock();
        match &st.key {
            Some(key) => key.subscribe_accept(on),
            None => Err(closed_socket()),
        }
    }

    pub fn close(&self, notify: bool) {
        let was_open = {
            let mut guard = self.inner.lock();
            let was_open = guard.listener.is_some();
            self.close_locked(&mut guard);
            was_open
        };
        if notify && was_open {
            self.notify_closed();
        }
    }

    fn close_locked(&self, st: &mut ListenState) {
        if let Some(key) = st.key.take() {
            key.close();
        }
        st.listener = None;
        if let Some(manager) = self.manager.upgrade() {
            manager.forget_listener(self.id());
        }
    }

    fn notify_closed(&self) {
        self.completion
            .try_enqueue(Box::new(ServerSocketClosedEvent {
                server: self.server.clone(),
            }));
    }
}
