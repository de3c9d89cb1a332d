use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, OnceLock, Weak},
};

use stagehand_core::{SinkError, SinkRef};
use tracing::warn;

use super::{state::ReadWriteSocketState, SocketId};
use crate::{
    buffer::Buffer,
    request::{
        CloseRequest, FlushRequest, ReadRequest, ResumeAcceptRequest, ServerSocketCloseRequest,
        SuspendAcceptRequest, WriteRequest,
    },
};

/// Where the socket stages of a connection live.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub read_sink: SinkRef,
    pub write_sink: SinkRef,
    pub read_clog_tries: Option<usize>,
}

/// How a connection came to be.
#[derive(Debug, Clone)]
pub enum Origin {
    Accepted(ServerSocket),
    Connected(ClientSocket),
}

/// Application handle of an established TCP connection.
///
/// All operations are requests enqueued to the socket stages; their outcome
/// arrives later as events. Cloning is cheap and clones compare equal.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: SocketId,
    origin: Origin,
    peer: SocketAddr,
    completion: Option<SinkRef>,
    context: ConnectionContext,
    state: OnceLock<Weak<ReadWriteSocketState>>,
}

impl TcpConnection {
    pub(crate) fn new(
        id: SocketId,
        origin: Origin,
        peer: SocketAddr,
        completion: Option<SinkRef>,
        context: ConnectionContext,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id,
                origin,
                peer,
                completion,
                context,
                state: OnceLock::new(),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> SocketId {
        self.inner.id
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    /// The sink given to the listen or connect request that produced this
    /// connection.
    pub fn completion(&self) -> Option<&SinkRef> {
        self.inner.completion.as_ref()
    }

    /// Starts delivering [`IncomingPacket`]s to `completion`.
    pub fn start_reading(&self, completion: SinkRef) -> Result<(), SinkError> {
        self.start_reading_with(completion, self.inner.context.read_clog_tries)
    }

    /// Like [`start_reading`](Self::start_reading) with an explicit ceiling
    /// of retries for a packet `completion` refused; `None` retries forever.
    pub fn start_reading_with(
        &self,
        completion: SinkRef,
        clog_tries: Option<usize>,
    ) -> Result<(), SinkError> {
        self.inner.context.read_sink.enqueue(Box::new(ReadRequest {
            connection: self.clone(),
            completion,
            clog_tries,
        }))
    }

    /// Queues `buffer` behind the writes already requested.
    pub fn write(&self, buffer: Buffer) -> Result<(), SinkError> {
        self.inner.context.write_sink.enqueue(Box::new(WriteRequest {
            connection: self.clone(),
            buffer,
        }))
    }

    /// Requests a `ConnectionFlushedEvent` once every earlier write drained.
    pub fn flush(&self, completion: Option<SinkRef>) -> Result<(), SinkError> {
        self.inner.context.write_sink.enqueue(Box::new(FlushRequest {
            connection: self.clone(),
            completion,
        }))
    }

    /// Closes the connection once every earlier write drained.
    pub fn close(&self, completion: Option<SinkRef>) -> Result<(), SinkError> {
        self.inner.context.write_sink.enqueue(Box::new(CloseRequest {
            connection: self.clone(),
            completion,
        }))
    }

    pub fn is_closed(&self) -> bool {
        self.state().map_or(true, |state| state.is_closed())
    }

    pub(crate) fn context(&self) -> &ConnectionContext {
        &self.inner.context
    }

    /// The first attached state stays; later ones are refused with a warning.
    pub(crate) fn attach(&self, state: &Arc<ReadWriteSocketState>) {
        if self.inner.state.set(Arc::downgrade(state)).is_err() {
            warn!(connection = %self.id(), "connection already has a socket state, keeping it");
        }
    }

    pub(crate) fn state(&self) -> Option<Arc<ReadWriteSocketState>> {
        self.inner.state.get().and_then(Weak::upgrade)
    }
}

impl PartialEq for TcpConnection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for TcpConnection {}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .finish()
    }
}

/// Target of an outgoing connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSocket {
    id: SocketId,
    addr: SocketAddr,
}

impl ClientSocket {
    pub(crate) fn new(id: SocketId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    #[inline]
    pub fn id(&self) -> SocketId {
        self.id
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Handle of a listening socket.
#[derive(Clone)]
pub struct ServerSocket {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    id: SocketId,
    addr: SocketAddr,
    listen_sink: SinkRef,
    local_addr: OnceLock<SocketAddr>,
}

impl ServerSocket {
    pub(crate) fn new(id: SocketId, addr: SocketAddr, listen_sink: SinkRef) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                id,
                addr,
                listen_sink,
                local_addr: OnceLock::new(),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> SocketId {
        self.inner.id
    }

    /// The address passed to the listen request.
    #[inline]
    pub fn requested_addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// The bound address, once listening succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    pub fn suspend_accept(&self) -> Result<(), SinkError> {
        self.inner
            .listen_sink
            .enqueue(Box::new(SuspendAcceptRequest { server: self.clone() }))
    }

    pub fn resume_accept(&self) -> Result<(), SinkError> {
        self.inner
            .listen_sink
            .enqueue(Box::new(ResumeAcceptRequest { server: self.clone() }))
    }

    pub fn close(&self) -> Result<(), SinkError> {
        self.inner
            .listen_sink
            .enqueue(Box::new(ServerSocketCloseRequest { server: self.clone() }))
    }

    pub(crate) fn set_local_addr(&self, addr: SocketAddr) {
        if let Err(addr) = self.inner.local_addr.set(addr) {
            warn!(server = %self.id(), "already bound, ignoring local address {addr}");
        }
    }
}

impl PartialEq for ServerSocket {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ServerSocket {}

impl fmt::Debug for ServerSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSocket")
            .field("id", &self.inner.id)
            .field("addr", &self.inner.addr)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// Bytes received on a connection.
///
/// `sequence` counts the packets of one connection from 1, skipping 0 when it
/// wraps.
#[derive(Debug, Clone)]
pub struct IncomingPacket {
    pub connection: TcpConnection,
    pub buffer: Buffer,
    pub sequence: u64,
}
