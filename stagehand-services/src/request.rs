//! Requests consumed by the socket stages.
//!
//! Applications rarely build these by hand: [`TcpConnection`],
//! [`ServerSocket`] and [`SocketFactory`](crate::SocketFactory) enqueue them.
use std::net::SocketAddr;

use stagehand_core::{impl_event, EventType, SinkRef};

use crate::{
    buffer::Buffer,
    socket::{ClientSocket, ServerSocket, TcpConnection},
};

pub static SOCKET_REQUEST: EventType = EventType::root("socket-request");

pub static LISTEN_REQUEST: EventType = EventType::derived("socket-request.listen", &SOCKET_REQUEST);
pub static SUSPEND_ACCEPT_REQUEST: EventType =
    EventType::derived("socket-request.suspend-accept", &SOCKET_REQUEST);
pub static RESUME_ACCEPT_REQUEST: EventType =
    EventType::derived("socket-request.resume-accept", &SOCKET_REQUEST);
pub static SERVER_CLOSE_REQUEST: EventType =
    EventType::derived("socket-request.server-close", &SOCKET_REQUEST);
pub static CONNECT_REQUEST: EventType =
    EventType::derived("socket-request.connect", &SOCKET_REQUEST);
pub static READ_REQUEST: EventType = EventType::derived("socket-request.read", &SOCKET_REQUEST);
pub static WRITE_REQUEST: EventType = EventType::derived("socket-request.write", &SOCKET_REQUEST);
pub static FLUSH_REQUEST: EventType = EventType::derived("socket-request.flush", &SOCKET_REQUEST);
pub static CLOSE_REQUEST: EventType = EventType::derived("socket-request.close", &SOCKET_REQUEST);

#[derive(Debug)]
pub struct ListenRequest {
    pub server: ServerSocket,
    pub addr: SocketAddr,
    /// Receives the listen outcome and every accepted connection.
    pub completion: SinkRef,
    /// Write clog threshold of the accepted connections.
    pub write_clog_threshold: Option<usize>,
}
impl_event!(ListenRequest, LISTEN_REQUEST);

#[derive(Debug)]
pub struct SuspendAcceptRequest {
    pub server: ServerSocket,
}
impl_event!(SuspendAcceptRequest, SUSPEND_ACCEPT_REQUEST);

#[derive(Debug)]
pub struct ResumeAcceptRequest {
    pub server: ServerSocket,
}
impl_event!(ResumeAcceptRequest, RESUME_ACCEPT_REQUEST);

#[derive(Debug)]
pub struct ServerSocketCloseRequest {
    pub server: ServerSocket,
}
impl_event!(ServerSocketCloseRequest, SERVER_CLOSE_REQUEST);

#[derive(Debug)]
pub struct ConnectRequest {
    pub socket: ClientSocket,
    /// Receives the established connection or a `ConnectFailedEvent`.
    pub completion: SinkRef,
    pub write_clog_threshold: Option<usize>,
    /// Readiness cycles during which `completion` may refuse the new
    /// connection before the attempt is dropped.
    pub clog_tries: Option<usize>,
}
impl_event!(ConnectRequest, CONNECT_REQUEST);

#[derive(Debug)]
pub struct ReadRequest {
    pub connection: TcpConnection,
    /// Receives incoming packets and the close notification.
    pub completion: SinkRef,
    /// Readiness cycles a packet refused by `completion` is retried before it
    /// is dropped.
    pub clog_tries: Option<usize>,
}
impl_event!(ReadRequest, READ_REQUEST);

#[derive(Debug)]
pub struct WriteRequest {
    pub connection: TcpConnection,
    pub buffer: Buffer,
}
impl_event!(WriteRequest, WRITE_REQUEST);

#[derive(Debug)]
pub struct FlushRequest {
    pub connection: TcpConnection,
    pub completion: Option<SinkRef>,
}
impl_event!(FlushRequest, FLUSH_REQUEST);

#[derive(Debug)]
pub struct CloseRequest {
    pub connection: TcpConnection,
    pub completion: Option<SinkRef>,
}
impl_event!(CloseRequest, CLOSE_REQUEST);
