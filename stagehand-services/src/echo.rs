//! A stage that writes back whatever its connections send.
use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use service_async::Param;
use stagehand_core::{
    handler::{HandlerEntry, StageService},
    sink_map::SinkMap,
    AnyResult, SinkRef,
};
use tracing::{debug, info, warn};

use crate::{
    event::{
        ConnectFailedEvent, ListenFailedEvent, ListenSuccessEvent, ServerSocketClosedEvent,
        CONNECTION_EVENT, CONNECT_FAILED, INCOMING_PACKET, LISTEN_EVENT, TCP_CONNECTION,
    },
    socket::{IncomingPacket, TcpConnection},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoConfig {
    /// Stage the echo service is bound to; listen notifications go there.
    #[serde(default = "default_stage")]
    pub stage: String,
    #[serde(default)]
    pub listen: Vec<SocketAddr>,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            stage: default_stage(),
            listen: Vec::new(),
        }
    }
}

fn default_stage() -> String {
    "echo".to_string()
}

/// Starts reading on every connection it receives and writes every packet
/// back on the connection it came from.
///
/// Handlers: `accepted`, `packet`, `connection` (other connection events),
/// `listen` (listen outcomes) and `connect_failed`.
pub struct EchoService {
    packets: OnceLock<SinkRef>,
}

impl EchoService {
    pub fn new() -> Self {
        Self {
            packets: OnceLock::new(),
        }
    }

    pub fn from_param<C: Param<EchoConfig>>(_config: &C) -> Self {
        Self::new()
    }

    fn accepted(&self, connection: TcpConnection) -> AnyResult<()> {
        let sink = self
            .packets
            .get()
            .ok_or_else(|| anyhow!("echo service is not initialized"))?;
        debug!(connection = %connection.id(), peer = %connection.peer_addr(), "echoing");
        connection.start_reading(sink.clone())?;
        Ok(())
    }

    fn packet(&self, packet: IncomingPacket) -> AnyResult<()> {
        let IncomingPacket {
            connection, buffer, ..
        } = packet;
        connection.write(buffer)?;
        Ok(())
    }
}

impl Default for EchoService {
    fn default() -> Self {
        Self::new()
    }
}

impl StageService for EchoService {
    fn handlers(self: Arc<Self>) -> Vec<HandlerEntry> {
        let accepting = self.clone();
        vec![
            HandlerEntry::typed("accepted", &TCP_CONNECTION, move |c: TcpConnection| {
                accepting.accepted(c)?;
                Ok(None)
            }),
            HandlerEntry::typed("packet", &INCOMING_PACKET, move |p: IncomingPacket| {
                self.packet(p)?;
                Ok(None)
            }),
            HandlerEntry::single("connection", &CONNECTION_EVENT, |event| {
                debug!("connection event: {event:?}");
                Ok(None)
            }),
            HandlerEntry::single("listen", &LISTEN_EVENT, |event| {
                if let Some(success) = event.downcast_ref::<ListenSuccessEvent>() {
                    info!(server = %success.server.id(), "echo listening on {}", success.local_addr);
                } else if let Some(failed) = event.downcast_ref::<ListenFailedEvent>() {
                    warn!(
                        addr = %failed.server.requested_addr(),
                        "echo cannot listen: {}", failed.message
                    );
                } else if let Some(closed) = event.downcast_ref::<ServerSocketClosedEvent>() {
                    info!(server = %closed.server.id(), "echo listener closed");
                }
                Ok(None)
            }),
            HandlerEntry::typed(
                "connect_failed",
                &CONNECT_FAILED,
                |e: ConnectFailedEvent| {
                    warn!("connect to {} failed: {}", e.socket.addr(), e.message);
                    Ok(None)
                },
            ),
        ]
    }

    fn initialize(&self, sinks: &SinkMap) -> AnyResult<()> {
        let sink = sinks
            .default_sink()
            .ok_or_else(|| anyhow!("echo stage has no default sink"))?;
        self.packets
            .set(sink)
            .map_err(|_| anyhow!("echo service initialized twice"))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpStream,
        time::Duration,
    };

    use super::*;
    use crate::{
        socket::SocketConfig,
        test_util::{eventually, SocketStages},
    };

    const ECHO_STAGE: &str = r#"
        [[groups]]
        name = "app"
        thread_manager = { policy = "tpc", processors = 1, sleep_time_ms = 1 }

        [[groups.stages]]
        name = "echo"
        queue = { timeout_ms = 10 }
        handlers = [{ service = "echo" }]

        [groups.stages.sink_map]
        sinks = [
            { name = "read", stage = "read" },
            { name = "write", stage = "write" },
        ]
    "#;

    #[test]
    fn config_defaults() {
        let config: EchoConfig = toml::from_str(r#"listen = ["127.0.0.1:7"]"#).unwrap();
        assert_eq!(config.stage, "echo");
        assert_eq!(config.listen, vec!["127.0.0.1:7".parse().unwrap()]);
    }

    #[test]
    fn echoes_over_loopback() {
        let stages = SocketStages::start_with(SocketConfig::default(), ECHO_STAGE, |registry| {
            registry.register("echo", None, Arc::new(EchoService::new()));
        });
        let server = stages
            .factory()
            .listen(
                "127.0.0.1:0".parse().unwrap(),
                stages.stages.sink("echo").unwrap(),
            )
            .unwrap();
        assert!(eventually(|| server.local_addr().is_some()));
        let addr = server.local_addr().unwrap();

        let mut clients: Vec<TcpStream> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
        for (i, client) in clients.iter_mut().enumerate() {
            client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let message = format!("hello {i}");
            client.write_all(message.as_bytes()).unwrap();
            let mut echoed = vec![0; message.len()];
            client.read_exact(&mut echoed).unwrap();
            assert_eq!(echoed, message.as_bytes());
        }
        assert!(eventually(|| stages.manager.connections() == 3));

        drop(clients);
        assert!(eventually(|| stages.manager.connections() == 0));
    }
}
