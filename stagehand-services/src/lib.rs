//! Socket stages for Stagehand.
//!
//! Non-blocking TCP is expressed as ordinary stages: a listen stage accepts
//! connections, a read stage and a write stage move bytes. Readiness reported
//! by the OS reaches those stages as events, injected into their queues by a
//! [`selector::SelectorInterceptor`].
#![cfg(unix)]

pub mod buffer;
pub mod echo;
pub mod event;
pub mod request;
pub mod selector;
pub mod socket;

pub use buffer::Buffer;
pub use socket::{
    ClientSocket, ConnectionManager, IncomingPacket, ListenService, ServerSocket, SocketConfig,
    SocketFactory, SocketId, SocketService, TcpConnection,
};
