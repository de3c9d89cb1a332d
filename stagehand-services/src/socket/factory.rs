use std::{net::SocketAddr, sync::Arc};

use stagehand_core::{SinkError, SinkRef};

use super::{ClientSocket, ConnectionManager, ServerSocket};
use crate::request::{ConnectRequest, ListenRequest};

/// Entry point for applications opening sockets.
///
/// Listening and connecting are requests handled by the listen and write
/// stages; the outcome reaches the completion sink as events:
/// `ListenSuccessEvent`/`ListenFailedEvent` followed by one
/// [`TcpConnection`](super::TcpConnection) per accepted connection, or the
/// established connection/`ConnectFailedEvent` for a connect.
#[derive(Clone)]
pub struct SocketFactory {
    manager: Arc<ConnectionManager>,
    listen_sink: SinkRef,
    write_sink: SinkRef,
}

impl SocketFactory {
    pub fn new(manager: Arc<ConnectionManager>, listen_sink: SinkRef, write_sink: SinkRef) -> Self {
        Self {
            manager,
            listen_sink,
            write_sink,
        }
    }

    pub fn listen(&self, addr: SocketAddr, completion: SinkRef) -> Result<ServerSocket, SinkError> {
        self.listen_with(addr, completion, None)
    }

    /// `write_clog_threshold` overrides the configured one for the accepted
    /// connections.
    pub fn listen_with(
        &self,
        addr: SocketAddr,
        completion: SinkRef,
        write_clog_threshold: Option<usize>,
    ) -> Result<ServerSocket, SinkError> {
        let server = ServerSocket::new(self.manager.next_id(), addr, self.listen_sink.clone());
        self.listen_sink.enqueue(Box::new(ListenRequest {
            server: server.clone(),
            addr,
            completion,
            write_clog_threshold,
        }))?;
        Ok(server)
    }

    pub fn connect(&self, addr: SocketAddr, completion: SinkRef) -> Result<ClientSocket, SinkError> {
        self.connect_with(addr, completion, None, None)
    }

    /// Like [`connect`](Self::connect), overriding the configured write clog
    /// threshold and the number of times `completion` may refuse the
    /// connection.
    pub fn connect_with(
        &self,
        addr: SocketAddr,
        completion: SinkRef,
        write_clog_threshold: Option<usize>,
        clog_tries: Option<usize>,
    ) -> Result<ClientSocket, SinkError> {
        let socket = ClientSocket::new(self.manager.next_id(), addr);
        self.write_sink.enqueue(Box::new(ConnectRequest {
            socket,
            completion,
            write_clog_threshold,
            clog_tries,
        }))?;
        Ok(socket)
    }
}

#[cfg(test)]
mod tests {
    use stagehand_core::{Queue, Source};

    use super::*;
    use crate::socket::SocketConfig;

    #[test]
    fn requests_carry_fresh_ids() {
        let manager = Arc::new(ConnectionManager::new(&SocketConfig::default()));
        let listen = Queue::unbounded("listen");
        let write = Queue::bounded("write", 1);
        let app = Queue::unbounded("app");
        let factory = SocketFactory::new(manager, listen.as_sink(), write.as_sink());

        let server = factory
            .listen("127.0.0.1:0".parse().unwrap(), app.as_sink())
            .unwrap();
        let request = listen.dequeue().unwrap().downcast::<ListenRequest>().unwrap();
        assert_eq!(request.server, server);
        assert_eq!(request.write_clog_threshold, None);

        let socket = factory
            .connect_with("127.0.0.1:9".parse().unwrap(), app.as_sink(), Some(4), Some(2))
            .unwrap();
        assert_ne!(socket.id(), server.id());
        assert!(matches!(
            factory.connect("127.0.0.1:9".parse().unwrap(), app.as_sink()),
            Err(SinkError::Full { .. })
        ));
        let request = write.dequeue().unwrap().downcast::<ConnectRequest>().unwrap();
        assert_eq!(request.socket, socket);
        assert_eq!(request.clog_tries, Some(2));
    }
}
