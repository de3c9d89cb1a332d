use std::sync::{Arc, OnceLock};

use anyhow::anyhow;
use service_async::Param;
use stagehand_core::{
    handler::{HandlerEntry, StageService},
    sink_map::SinkMap,
    AnyResult, Sink,
};
use tracing::{debug, warn};

use super::{
    connection::ConnectionContext,
    limit,
    state::{ConnectParams, ConnectSocketState, Refused, StreamRequest},
    ConnectionManager, SocketConfig, TcpConnection, Tuning,
};
use crate::{
    event::{ConnectFailedEvent, ConnectionClosedEvent, ConnectionCloggedEvent},
    request::{
        CloseRequest, ConnectRequest, FlushRequest, ReadRequest, WriteRequest, CLOSE_REQUEST,
        CONNECT_REQUEST, FLUSH_REQUEST, READ_REQUEST, WRITE_REQUEST,
    },
    selector::{Attachment, Readiness, Selector, SelectorInterceptor, READINESS},
};

/// Hosts the read stage and the write stage.
///
/// Handler signatures, read stage: `start_read`, `read`. Write stage:
/// `connect`, `start_write`, `flush`, `close`, `write`. The service looks the
/// two stages up in its sink map under [`SocketConfig::read_sink`] and
/// [`SocketConfig::write_sink`] and installs a selector on each.
pub struct SocketService {
    config: SocketConfig,
    tuning: Tuning,
    manager: Arc<ConnectionManager>,
    wiring: OnceLock<Wiring>,
}

struct Wiring {
    read_selector: Arc<Selector>,
    write_selector: Arc<Selector>,
    context: ConnectionContext,
}

impl SocketService {
    pub fn new(config: SocketConfig, manager: Arc<ConnectionManager>) -> Self {
        Self {
            tuning: config.tuning(),
            config,
            manager,
            wiring: OnceLock::new(),
        }
    }

    pub fn from_param<C: Param<SocketConfig>>(config: &C, manager: Arc<ConnectionManager>) -> Self {
        Self::new(config.param(), manager)
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    fn wiring(&self) -> AnyResult<&Wiring> {
        self.wiring
            .get()
            .ok_or_else(|| anyhow!("socket service is not initialized"))
    }

    fn start_read(&self, request: ReadRequest) -> AnyResult<()> {
        let wiring = self.wiring()?;
        let ReadRequest {
            connection,
            completion,
            clog_tries,
        } = request;
        let Some(state) = connection.state().filter(|s| !s.is_closed()) else {
            completion.try_enqueue(Box::new(ConnectionClosedEvent { connection }));
            return Ok(());
        };
        if let Err(e) = state.start_read(&wiring.read_selector, completion.clone(), clog_tries) {
            debug!(connection = %connection.id(), "cannot start reading: {e}");
            state.close(Some(completion));
        }
        Ok(())
    }

    fn read(&self, readiness: Readiness) {
        match readiness.key().attachment() {
            Some(Attachment::Stream(state)) => match state.upgrade() {
                Some(state) => state.read(),
                None => readiness.key().close(),
            },
            Some(_) => warn!("unexpected key on the read selector"),
            None => readiness.key().close(),
        }
    }

    fn write(&self, ready: Vec<Readiness>) {
        let mut budget = limit(self.config.max_writes_per_cycle);
        for readiness in ready {
            match readiness.key().attachment() {
                Some(Attachment::Connect(state)) => match state.upgrade() {
                    Some(state) => state.connect(),
                    None => readiness.key().close(),
                },
                Some(Attachment::Stream(state)) => {
                    // keys past the budget are selected again next cycle
                    if budget == Some(0) {
                        continue;
                    }
                    budget = budget.map(|b| b - 1);
                    match state.upgrade() {
                        Some(state) => state.write(),
                        None => readiness.key().close(),
                    }
                }
                Some(Attachment::Listen(_)) => warn!("unexpected key on the write selector"),
                None => readiness.key().close(),
            }
        }
    }

    fn connect(&self, request: ConnectRequest) -> AnyResult<()> {
        let wiring = self.wiring()?;
        let ConnectRequest {
            socket,
            completion,
            write_clog_threshold,
            clog_tries,
        } = request;
        let stream = match mio::net::TcpStream::connect(socket.addr()) {
            Ok(stream) => stream,
            Err(e) => {
                debug!(addr = %socket.addr(), "connect failed: {e}");
                completion.try_enqueue(Box::new(ConnectFailedEvent {
                    socket,
                    message: e.to_string(),
                }));
                return Ok(());
            }
        };
        let state = ConnectSocketState::new(
            socket,
            stream,
            Arc::downgrade(&self.manager),
            ConnectParams {
                completion,
                context: wiring.context.clone(),
                tuning: self.tuning,
                write_clog_threshold: write_clog_threshold
                    .or(limit(self.config.write_clog_threshold)),
                clog_tries: clog_tries.or(limit(self.config.connect_clog_tries)),
            },
        );
        self.manager.track_connect(state.clone());
        if let Err(e) = state.start(&wiring.write_selector) {
            state.fail(e);
        }
        Ok(())
    }

    fn enqueue_request(
        &self,
        connection: &TcpConnection,
        request: StreamRequest,
    ) -> AnyResult<()> {
        let wiring = self.wiring()?;
        let Some(state) = connection.state() else {
            debug!(connection = %connection.id(), "request for a closed connection");
            return Ok(());
        };
        match state.add_request(request, &wiring.write_selector) {
            Ok(()) => {}
            Err(Refused::Clogged(StreamRequest::Write(buffer))) => {
                let target = buffer
                    .completion()
                    .cloned()
                    .or_else(|| connection.completion().cloned());
                if let Some(target) = target {
                    target.try_enqueue(Box::new(ConnectionCloggedEvent {
                        connection: connection.clone(),
                        buffer,
                    }));
                }
            }
            Err(Refused::Clogged(_)) => {}
            Err(Refused::Closed(_)) => {
                debug!(connection = %connection.id(), "request for a closed connection");
            }
        }
        Ok(())
    }
}

impl StageService for SocketService {
    fn handlers(self: Arc<Self>) -> Vec<HandlerEntry> {
        let read_starter = self.clone();
        let reader = self.clone();
        let connector = self.clone();
        let writer = self.clone();
        let flusher = self.clone();
        let closer = self.clone();
        vec![
            HandlerEntry::typed("start_read", &READ_REQUEST, move |r: ReadRequest| {
                read_starter.start_read(r)?;
                Ok(None)
            }),
            HandlerEntry::typed("read", &READINESS, move |r: Readiness| {
                reader.read(r);
                Ok(None)
            }),
            HandlerEntry::typed("connect", &CONNECT_REQUEST, move |r: ConnectRequest| {
                connector.connect(r)?;
                Ok(None)
            }),
            HandlerEntry::typed("start_write", &WRITE_REQUEST, move |r: WriteRequest| {
                writer.enqueue_request(&r.connection, StreamRequest::Write(r.buffer))?;
                Ok(None)
            }),
            HandlerEntry::typed("flush", &FLUSH_REQUEST, move |r: FlushRequest| {
                flusher.enqueue_request(&r.connection, StreamRequest::Flush(r.completion))?;
                Ok(None)
            }),
            HandlerEntry::typed("close", &CLOSE_REQUEST, move |r: CloseRequest| {
                closer.enqueue_request(&r.connection, StreamRequest::Close(r.completion))?;
                Ok(None)
            }),
            HandlerEntry::typed_batch("write", &READINESS, move |ready: Vec<Readiness>| {
                self.write(ready);
                Ok(None)
            }),
        ]
    }

    fn initialize(&self, sinks: &SinkMap) -> AnyResult<()> {
        let read = sinks.queue(&self.config.read_sink)?;
        let write = sinks.queue(&self.config.write_sink)?;
        let read_selector = self.manager.create_selector()?;
        let write_selector = self.manager.create_selector()?;
        read.set_dequeue_interceptor(Arc::new(SelectorInterceptor::new(
            read_selector.clone(),
            self.config.select_timeout(),
        )));
        write.set_dequeue_interceptor(Arc::new(SelectorInterceptor::new(
            write_selector.clone(),
            self.config.select_timeout(),
        )));
        let wiring = Wiring {
            read_selector,
            write_selector,
            context: ConnectionContext {
                read_sink: read.as_sink(),
                write_sink: write.as_sink(),
                read_clog_tries: limit(self.config.read_clog_tries),
            },
        };
        self.wiring
            .set(wiring)
            .map_err(|_| anyhow!("socket service initialized twice"))
    }

    fn dispose(&self) {
        self.manager.close_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        time::Duration,
    };

    use stagehand_core::{sink_map::SinkBinding, Queue, Source};

    use super::*;
    use crate::{
        buffer::Buffer,
        event::{ConnectionDrainedEvent, ConnectionFlushedEvent},
        socket::{
            state::ReadWriteSocketState, ClientSocket, IncomingPacket, Origin, SocketFactory,
        },
        test_util::{eventually, SocketStages},
    };

    #[test]
    fn connect_write_and_close_through_stages() {
        let stages = SocketStages::start(SocketConfig::default());
        let app = Queue::unbounded("app");
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let factory = stages.factory();
        factory
            .connect(listener.local_addr().unwrap(), app.as_sink())
            .unwrap();

        let (mut peer, _) = listener.accept().unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut event = None;
        assert!(eventually(|| {
            event = app.dequeue();
            event.is_some()
        }));
        let connection = event.unwrap().downcast::<TcpConnection>().unwrap();

        connection.write(Buffer::new("ping")).unwrap();
        connection.flush(None).unwrap();
        connection.close(None).unwrap();
        let mut buf = [0; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(peer.read(&mut buf).unwrap(), 0);

        let mut events = Vec::new();
        assert!(eventually(|| {
            events.extend(app.dequeue_all());
            events.len() == 3
        }));
        assert!(events[0].is::<ConnectionDrainedEvent>());
        assert!(events[1].is::<ConnectionFlushedEvent>());
        assert!(events[2].is::<ConnectionClosedEvent>());
        assert!(eventually(|| stages.manager.connections() == 0));
    }

    #[test]
    fn refused_connect_reports_failure() {
        let stages = SocketStages::start(SocketConfig::default());
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let app = Queue::unbounded("app");
        let socket = stages.factory().connect(addr, app.as_sink()).unwrap();

        let mut event = None;
        assert!(eventually(|| {
            event = app.dequeue();
            event.is_some()
        }));
        let failed = event.unwrap().downcast::<ConnectFailedEvent>().unwrap();
        assert_eq!(failed.socket, socket);
        assert_eq!(stages.manager.pending_connects(), 0);
    }

    #[test]
    fn reading_delivers_packets_until_peer_closes() {
        let stages = SocketStages::start(SocketConfig::default());
        let app = Queue::unbounded("app");
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        stages
            .factory()
            .connect(listener.local_addr().unwrap(), app.as_sink())
            .unwrap();
        let (mut peer, _) = listener.accept().unwrap();
        let mut event = None;
        assert!(eventually(|| {
            event = app.dequeue();
            event.is_some()
        }));
        let connection = event.unwrap().downcast::<TcpConnection>().unwrap();

        let packets = Queue::unbounded("packets");
        connection.start_reading(packets.as_sink()).unwrap();
        peer.write_all(b"abc").unwrap();
        let mut received = Vec::new();
        assert!(eventually(|| {
            for event in packets.dequeue_all() {
                if let Some(p) = event.downcast_ref::<IncomingPacket>() {
                    received.extend_from_slice(p.buffer.as_slice());
                }
            }
            received == b"abc"
        }));

        drop(peer);
        assert!(eventually(|| packets
            .dequeue()
            .is_some_and(|e| e.is::<ConnectionClosedEvent>())));
        assert!(connection.is_closed());
    }

    #[test]
    fn uninitialized_service_fails_requests() {
        let manager = Arc::new(ConnectionManager::new(&SocketConfig::default()));
        let service = SocketService::new(SocketConfig::default(), manager.clone());
        let app = Queue::unbounded("app");
        let listen = Queue::unbounded("listen");
        let write = Queue::unbounded("write");
        let factory = SocketFactory::new(manager, listen.as_sink(), write.as_sink());
        factory
            .connect("127.0.0.1:1".parse().unwrap(), app.as_sink())
            .unwrap();
        let request = write.dequeue().unwrap().downcast::<ConnectRequest>().unwrap();
        assert!(service.connect(*request).is_err());
    }

    #[test]
    fn clogged_write_is_reported_to_the_buffer_owner() {
        let manager = Arc::new(ConnectionManager::new(&SocketConfig::default()));
        let service = SocketService::new(SocketConfig::default(), manager.clone());
        let (read, write) = (Queue::unbounded("read"), Queue::unbounded("write"));
        let mut sinks = SinkMap::new();
        sinks.insert("read", SinkBinding::Stage(read)).unwrap();
        sinks.insert("write", SinkBinding::Stage(write)).unwrap();
        service.initialize(&sinks).unwrap();
        let context = service.wiring().unwrap().context.clone();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _peer = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, addr) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        let stream = mio::net::TcpStream::from_std(accepted);
        let app = Queue::unbounded("app");
        let connection = TcpConnection::new(
            manager.next_id(),
            Origin::Connected(ClientSocket::new(manager.next_id(), addr)),
            addr,
            Some(app.as_sink()),
            context,
        );
        let state = ReadWriteSocketState::new(
            connection.clone(),
            stream,
            Arc::downgrade(&manager),
            Tuning::default(),
            Some(1),
        );
        manager.track(state.clone());

        let owner = Queue::unbounded("owner");
        for chunk in ["x", "y"] {
            service
                .enqueue_request(&connection, StreamRequest::Write(Buffer::new(chunk)))
                .unwrap();
        }
        assert!(owner.dequeue().is_none() && app.dequeue().is_none());
        service
            .enqueue_request(
                &connection,
                StreamRequest::Write(Buffer::new("a").with_completion(owner.as_sink())),
            )
            .unwrap();
        service
            .enqueue_request(&connection, StreamRequest::Write(Buffer::new("b")))
            .unwrap();

        let clogged = owner
            .dequeue()
            .unwrap()
            .downcast::<ConnectionCloggedEvent>()
            .unwrap();
        assert_eq!(clogged.buffer.as_slice(), b"a");
        let clogged = app
            .dequeue()
            .unwrap()
            .downcast::<ConnectionCloggedEvent>()
            .unwrap();
        assert_eq!(clogged.buffer.as_slice(), b"b");
        assert!(!state.is_closed());

        // the close request still goes through and reports to the app
        service
            .enqueue_request(&connection, StreamRequest::Close(None))
            .unwrap();
        assert!(state.is_closed());
        assert!(app.dequeue().unwrap().is::<ConnectionClosedEvent>());
        service.dispose();
    }
}
