use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use service_async::Param;
use stagehand_core::{handler::ServiceRegistry, StageManager};
use stagehand_services::{
    echo::{EchoConfig, EchoService},
    ConnectionManager, ListenService, SocketFactory, SocketService,
};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use crate::config::AppConfig;

mod config;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: String,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;

    let sockets = Arc::new(ConnectionManager::new(&config.sockets));
    let mut registry = ServiceRegistry::new();
    registry
        .register(
            "socket",
            None,
            Arc::new(SocketService::from_param(&config, sockets.clone())),
        )
        .register(
            "listener",
            None,
            Arc::new(ListenService::from_param(&config, sockets.clone())),
        )
        .register("echo", None, Arc::new(EchoService::from_param(&config)));

    let stages = StageManager::assemble(&config.topology, &registry)?;
    stages.initialize()?;
    stages.start()?;
    tracing::info!("stages started");

    // the socket stages are named after the sinks they are known by
    let factory = SocketFactory::new(
        sockets,
        stages.sink(&config.sockets.listen_sink)?,
        stages.sink(&config.sockets.write_sink)?,
    );
    let echo: EchoConfig = config.param();
    let completion = stages.sink(&echo.stage)?;
    for addr in echo.listen {
        factory.listen(addr, completion.clone())?;
    }

    stages.wait();
    Ok(())
}
