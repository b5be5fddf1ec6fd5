// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use gpupgrade_cmd::LocalExecutor;
use gpupgrade_hub::server::{HubService, HubState};
use gpupgrade_idl::cli_to_hub_server::CliToHubServer;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use structopt::StructOpt;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

#[derive(Debug, StructOpt)]
#[structopt(name = "gpupgrade_hub")]
/// Coordinates a major-version upgrade across the cluster.
struct Opt {
    /// Port the hub listens on for the CLI
    #[structopt(long, default_value = "7527")]
    port: u16,

    /// Port the agents listen on
    #[structopt(long, default_value = "6416")]
    agent_port: u16,

    /// Per-cluster state directory
    #[structopt(long, parse(from_os_str))]
    state_dir: Option<PathBuf>,
}

async fn wait_for_termination() {
    let mut sigterm = signal(SignalKind::terminate()).expect("could not listen to SIGTERM");
    let mut sigint = signal(SignalKind::interrupt()).expect("could not listen to SIGINT");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opt = Opt::from_args();

    let state_dir = opt.state_dir.unwrap_or_else(gpupgrade_utils::state_dir);
    std::fs::create_dir_all(&state_dir)?;

    tracing::info!(state_dir = %state_dir.display(), "starting gpupgrade hub");

    let state = Arc::new(HubState::new(
        state_dir,
        opt.agent_port,
        Arc::new(LocalExecutor),
    ));

    let addr: SocketAddr = ([0, 0, 0, 0], opt.port).into();

    tonic::transport::Server::builder()
        .add_service(CliToHubServer::new(HubService::new(state)))
        .serve_with_shutdown(addr, wait_for_termination())
        .await?;

    tracing::info!("terminating on signal");

    Ok(())
}
