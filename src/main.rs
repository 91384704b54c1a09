// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gt06::config::Config;
use gt06::publish::LogPublisher;
use gt06::server::GatewayServer;

const EXIT_CONFIG: u8 = 1;
const EXIT_BIND: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "gt06", about = "GT06 GPS tracker gateway")]
struct Args {
    /// Path to a YAML configuration file.
    #[arg(short, long, env = "GT06_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Overrides the configured listen port.
    #[arg(short, long, env = "GT06_PORT")]
    port: Option<u16>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let mut config = match args.config {
        Some(path) => match Config::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path.display(), error = %e, "configuration rejected");
                return ExitCode::from(EXIT_CONFIG);
            }
        },
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Err(e) = config.validate() {
        error!(error = %e, "configuration rejected");
        return ExitCode::from(EXIT_CONFIG);
    }

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if config.worker_threads > 0 {
        builder.worker_threads(config.worker_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "runtime build failed");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    runtime.block_on(async move {
        let server = GatewayServer::new(config, Arc::new(LogPublisher));

        let listener = match server.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "port bind failed");
                return ExitCode::from(EXIT_BIND);
            }
        };

        let serving = tokio::spawn(Arc::clone(&server).serve(listener));

        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!(error = %e, "signal listener failed"),
        }
        server.shutdown();
        let _ = serving.await;
        ExitCode::SUCCESS
    })
}
