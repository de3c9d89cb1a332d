use std::path::Path;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use service_async::Param;
use stagehand_core::config::Topology;
use stagehand_services::{echo::EchoConfig, SocketConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub topology: Topology,
    #[serde(default = "default_sockets")]
    pub sockets: SocketConfig,
    #[serde(default)]
    pub echo: EchoConfig,
}

fn default_sockets() -> SocketConfig {
    SocketConfig::default()
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read(path)?;
        parse_from_slice(&content)
    }
}

impl Param<SocketConfig> for AppConfig {
    fn param(&self) -> SocketConfig {
        self.sockets.clone()
    }
}

impl Param<EchoConfig> for AppConfig {
    fn param(&self) -> EchoConfig {
        self.echo.clone()
    }
}

pub fn parse_from_slice<T: DeserializeOwned>(content: &[u8]) -> anyhow::Result<T> {
    // read first non-space u8
    let is_json = match content
        .iter()
        .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
    {
        Some(first) => *first == b'{',
        None => false,
    };
    match is_json {
        true => serde_json::from_slice::<T>(content).map_err(Into::into),
        false => toml::from_str::<T>(&String::from_utf8_lossy(content)).map_err(Into::into),
    }
}
