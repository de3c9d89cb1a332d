//! Notifications emitted by the socket stages.
//!
//! All of them derive from [`SOCKET_EVENT`]; connection-scoped ones from
//! [`CONNECTION_EVENT`], so an application stage can bind a single handler to
//! every connection notification. A freshly established [`TcpConnection`] is
//! itself delivered as an event of type [`TCP_CONNECTION`].
use std::net::SocketAddr;

use stagehand_core::{impl_event, EventType};

use crate::{
    buffer::Buffer,
    socket::{ClientSocket, IncomingPacket, ServerSocket, TcpConnection},
};

pub static SOCKET_EVENT: EventType = EventType::root("socket");

pub static LISTEN_EVENT: EventType = EventType::derived("socket.listen", &SOCKET_EVENT);
pub static LISTEN_SUCCESS: EventType = EventType::derived("socket.listen.success", &LISTEN_EVENT);
pub static LISTEN_FAILED: EventType = EventType::derived("socket.listen.failed", &LISTEN_EVENT);
pub static SERVER_SOCKET_CLOSED: EventType =
    EventType::derived("socket.listen.closed", &LISTEN_EVENT);

pub static CONNECT_FAILED: EventType = EventType::derived("socket.connect-failed", &SOCKET_EVENT);

pub static CONNECTION_EVENT: EventType = EventType::derived("socket.connection", &SOCKET_EVENT);
pub static TCP_CONNECTION: EventType =
    EventType::derived("socket.connection.established", &CONNECTION_EVENT);
pub static CONNECTION_CLOSED: EventType =
    EventType::derived("socket.connection.closed", &CONNECTION_EVENT);
pub static CONNECTION_FLUSHED: EventType =
    EventType::derived("socket.connection.flushed", &CONNECTION_EVENT);
pub static CONNECTION_DRAINED: EventType =
    EventType::derived("socket.connection.drained", &CONNECTION_EVENT);
pub static CONNECTION_CLOGGED: EventType =
    EventType::derived("socket.connection.clogged", &CONNECTION_EVENT);
pub static INCOMING_PACKET: EventType =
    EventType::derived("socket.connection.packet", &CONNECTION_EVENT);

#[derive(Debug, Clone)]
pub struct ListenSuccessEvent {
    pub server: ServerSocket,
    pub local_addr: SocketAddr,
}
impl_event!(ListenSuccessEvent, LISTEN_SUCCESS, clone);

#[derive(Debug, Clone)]
pub struct ListenFailedEvent {
    pub server: ServerSocket,
    pub message: String,
}
impl_event!(ListenFailedEvent, LISTEN_FAILED, clone);

#[derive(Debug, Clone)]
pub struct ServerSocketClosedEvent {
    pub server: ServerSocket,
}
impl_event!(ServerSocketClosedEvent, SERVER_SOCKET_CLOSED, clone);

#[derive(Debug, Clone)]
pub struct ConnectFailedEvent {
    pub socket: ClientSocket,
    pub message: String,
}
impl_event!(ConnectFailedEvent, CONNECT_FAILED, clone);

impl_event!(TcpConnection, TCP_CONNECTION, clone);

#[derive(Debug, Clone)]
pub struct ConnectionClosedEvent {
    pub connection: TcpConnection,
}
impl_event!(ConnectionClosedEvent, CONNECTION_CLOSED, clone);

#[derive(Debug, Clone)]
pub struct ConnectionFlushedEvent {
    pub connection: TcpConnection,
}
impl_event!(ConnectionFlushedEvent, CONNECTION_FLUSHED, clone);

/// A write request finished: every byte of `buffer` reached the socket.
#[derive(Debug, Clone)]
pub struct ConnectionDrainedEvent {
    pub connection: TcpConnection,
    pub buffer: Buffer,
}
impl_event!(ConnectionDrainedEvent, CONNECTION_DRAINED, clone);

/// A write request was refused because too many were outstanding.
#[derive(Debug, Clone)]
pub struct ConnectionCloggedEvent {
    pub connection: TcpConnection,
    pub buffer: Buffer,
}
impl_event!(ConnectionCloggedEvent, CONNECTION_CLOGGED, clone);

impl_event!(IncomingPacket, INCOMING_PACKET, clone);
