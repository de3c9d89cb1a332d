use std::sync::{Arc, OnceLock};

use anyhow::anyhow;
use service_async::Param;
use stagehand_core::{
    handler::{HandlerEntry, StageService},
    sink_map::SinkMap,
    AnyResult, Sink,
};
use tracing::{debug, info};

use super::{
    connection::ConnectionContext,
    limit,
    state::{ListenParams, ListenSocketState},
    ConnectionManager, ServerSocket, SocketConfig, Tuning,
};
use crate::{
    event::{ListenFailedEvent, ListenSuccessEvent},
    request::{
        ListenRequest, ResumeAcceptRequest, ServerSocketCloseRequest, SuspendAcceptRequest,
        LISTEN_REQUEST, RESUME_ACCEPT_REQUEST, SERVER_CLOSE_REQUEST, SUSPEND_ACCEPT_REQUEST,
    },
    selector::{Attachment, Readiness, Selector, SelectorInterceptor, READINESS},
};

/// Hosts the listen stage: handlers `listen`, `accept`, `suspend`, `resume`
/// and `close`.
///
/// Besides its own stage under [`SocketConfig::listen_sink`], the service
/// needs the read and write stages in its sink map: accepted connections
/// send their requests there.
pub struct ListenService {
    config: SocketConfig,
    tuning: Tuning,
    manager: Arc<ConnectionManager>,
    wiring: OnceLock<Wiring>,
}

struct Wiring {
    selector: Arc<Selector>,
    context: ConnectionContext,
}

impl ListenService {
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

    fn wiring(&self) -> AnyResult<&Wiring> {
        self.wiring
            .get()
            .ok_or_else(|| anyhow!("listen service is not initialized"))
    }

    fn listen(&self, request: ListenRequest) -> AnyResult<()> {
        let wiring = self.wiring()?;
        let ListenRequest {
            server,
            addr,
            completion,
            write_clog_threshold,
        } = request;
        let bound = mio::net::TcpListener::bind(addr)
            .and_then(|listener| listener.local_addr().map(|local| (listener, local)));
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                debug!(%addr, "listen failed: {e}");
                completion.try_enqueue(Box::new(ListenFailedEvent {
                    server,
                    message: e.to_string(),
                }));
                return Ok(());
            }
        };

        let state = ListenSocketState::new(
            server.clone(),
            listener,
            Arc::downgrade(&self.manager),
            ListenParams {
                completion: completion.clone(),
                context: wiring.context.clone(),
                tuning: self.tuning,
                write_clog_threshold: write_clog_threshold
                    .or(limit(self.config.write_clog_threshold)),
                max_accepts: limit(self.config.max_accepts_per_cycle),
            },
        );
        if let Err(e) = state.start(&wiring.selector) {
            debug!(%addr, "cannot watch listener: {e}");
            state.close(false);
            completion.try_enqueue(Box::new(ListenFailedEvent {
                server,
                message: e.to_string(),
            }));
            return Ok(());
        }
        self.manager.track_listener(state);
        server.set_local_addr(local_addr);
        info!(server = %server.id(), "listening on {local_addr}");
        completion.try_enqueue(Box::new(ListenSuccessEvent { server, local_addr }));
        Ok(())
    }

    fn accept(&self, readiness: Readiness) {
        match readiness.key().attachment() {
            Some(Attachment::Listen(state)) => match state.upgrade() {
                Some(state) => state.accept(),
                None => readiness.key().close(),
            },
            Some(_) => debug!("unexpected key on the listen selector"),
            None => readiness.key().close(),
        }
    }

    fn set_accepting(&self, server: &ServerSocket, on: bool) {
        let Some(state) = self.manager.listener(server.id()) else {
            debug!(server = %server.id(), "no such listener");
            return;
        };
        if let Err(e) = state.set_accepting(on) {
            debug!(server = %server.id(), "cannot toggle accepting: {e}");
        }
    }

    fn close(&self, server: &ServerSocket) {
        match self.manager.listener(server.id()) {
            Some(state) => state.close(true),
            None => debug!(server = %server.id(), "no such listener"),
        }
    }
}

impl StageService for ListenService {
    fn handlers(self: Arc<Self>) -> Vec<HandlerEntry> {
        let listener = self.clone();
        let acceptor = self.clone();
        let suspender = self.clone();
        let resumer = self.clone();
        vec![
            HandlerEntry::typed("listen", &LISTEN_REQUEST, move |r: ListenRequest| {
                listener.listen(r)?;
                Ok(None)
            }),
            HandlerEntry::typed("accept", &READINESS, move |r: Readiness| {
                acceptor.accept(r);
                Ok(None)
            }),
            HandlerEntry::typed(
                "suspend",
                &SUSPEND_ACCEPT_REQUEST,
                move |r: SuspendAcceptRequest| {
                    suspender.set_accepting(&r.server, false);
                    Ok(None)
                },
            ),
            HandlerEntry::typed(
                "resume",
                &RESUME_ACCEPT_REQUEST,
                move |r: ResumeAcceptRequest| {
                    resumer.set_accepting(&r.server, true);
                    Ok(None)
                },
            ),
            HandlerEntry::typed(
                "close",
                &SERVER_CLOSE_REQUEST,
                move |r: ServerSocketCloseRequest| {
                    self.close(&r.server);
                    Ok(None)
                },
            ),
        ]
    }

    fn initialize(&self, sinks: &SinkMap) -> AnyResult<()> {
        let listen = sinks.queue(&self.config.listen_sink)?;
        let context = ConnectionContext {
            read_sink: sinks.sink(&self.config.read_sink)?,
            write_sink: sinks.sink(&self.config.write_sink)?,
            read_clog_tries: limit(self.config.read_clog_tries),
        };
        let selector = self.manager.create_selector()?;
        listen.set_dequeue_interceptor(Arc::new(SelectorInterceptor::new(
            selector.clone(),
            self.config.select_timeout(),
        )));
        self.wiring
            .set(Wiring { selector, context })
            .map_err(|_| anyhow!("listen service initialized twice"))
    }

    fn dispose(&self) {
        self.manager.close_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Read,
        net::TcpStream,
        time::Duration,
    };

    use stagehand_core::{BoxedEvent, Queue, Source};

    use super::*;
    use crate::{
        event::ServerSocketClosedEvent,
        socket::TcpConnection,
        test_util::{eventually, SocketStages},
        Buffer,
    };

    fn next(queue: &Queue) -> BoxedEvent {
        let mut event = None;
        assert!(eventually(|| {
            event = queue.dequeue();
            event.is_some()
        }));
        event.unwrap()
    }

    #[test]
    fn listen_accept_and_talk() {
        let stages = SocketStages::start(SocketConfig::default());
        let app = Queue::unbounded("app");
        let server = stages
            .factory()
            .listen("127.0.0.1:0".parse().unwrap(), app.as_sink())
            .unwrap();

        let success = next(&app).downcast::<ListenSuccessEvent>().unwrap();
        assert_eq!(success.server, server);
        assert_eq!(server.local_addr(), Some(success.local_addr));
        assert_eq!(stages.manager.listeners(), 1);

        let mut client = TcpStream::connect(success.local_addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let connection = next(&app).downcast::<TcpConnection>().unwrap();
        assert_eq!(connection.peer_addr(), client.local_addr().unwrap());

        connection.write(Buffer::new("welcome")).unwrap();
        let mut buf = [0; 7];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"welcome");

        server.close().unwrap();
        let mut closed = false;
        assert!(eventually(|| {
            closed |= app
                .dequeue_all()
                .iter()
                .any(|e| e.is::<ServerSocketClosedEvent>());
            closed
        }));
        assert_eq!(stages.manager.listeners(), 0);
        assert!(TcpStream::connect(success.local_addr).is_err());
        // established connections outlive their listener
        assert!(!connection.is_closed());
    }

    #[test]
    fn suspended_listener_stops_accepting() {
        let stages = SocketStages::start(SocketConfig::default());
        let app = Queue::unbounded("app");
        let server = stages
            .factory()
            .listen("127.0.0.1:0".parse().unwrap(), app.as_sink())
            .unwrap();
        let addr = next(&app)
            .downcast::<ListenSuccessEvent>()
            .unwrap()
            .local_addr;

        server.suspend_accept().unwrap();
        // the suspend request is processed before the connection shows up
        assert!(eventually(|| stages.stages.queue("listen").unwrap().size() == 0));
        std::thread::sleep(Duration::from_millis(50));
        let _client = TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(app.size(), 0);

        server.resume_accept().unwrap();
        assert!(next(&app).is::<TcpConnection>());
    }

    #[test]
    fn occupied_address_fails_to_listen() {
        let stages = SocketStages::start(SocketConfig::default());
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let app = Queue::unbounded("app");
        stages
            .factory()
            .listen(taken.local_addr().unwrap(), app.as_sink())
            .unwrap();
        let failed = next(&app).downcast::<ListenFailedEvent>().unwrap();
        assert!(!failed.message.is_empty());
        assert_eq!(stages.manager.listeners(), 0);
    }

    #[test]
    fn dispose_closes_everything() {
        let stages = SocketStages::start(SocketConfig::default());
        let app = Queue::unbounded("app");
        stages
            .factory()
            .listen("127.0.0.1:0".parse().unwrap(), app.as_sink())
            .unwrap();
        let addr = next(&app)
            .downcast::<ListenSuccessEvent>()
            .unwrap()
            .local_addr;
        let mut client = TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let connection = next(&app).downcast::<TcpConnection>().unwrap();

        let manager = stages.manager.clone();
        drop(stages);
        assert_eq!(manager.connections(), 0);
        assert_eq!(manager.listeners(), 0);
        assert!(connection.is_closed());
        let mut buf = [0; 1];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    }
}
