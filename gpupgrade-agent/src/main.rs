// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use gpupgrade_agent::{server::AgentService, HOSTNAME};
use gpupgrade_cmd::LocalExecutor;
use gpupgrade_idl::agent_server::AgentServer;
use std::{io, net::SocketAddr, path::PathBuf, sync::Arc};
use structopt::StructOpt;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

#[derive(Debug, StructOpt)]
#[structopt(name = "gpupgrade_agent")]
/// Runs the data directory operations the hub fans out to this host.
struct Opt {
    /// Port the agent listens on
    #[structopt(long, default_value = "6416")]
    port: u16,

    /// Per-cluster state directory
    #[structopt(long, parse(from_os_str))]
    state_dir: Option<PathBuf>,

    /// Detach from the launching terminal and run in the background
    #[structopt(long)]
    daemonize: bool,
}

fn daemonize() -> io::Result<()> {
    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|arg| arg != "--daemonize")
        .collect();

    std::process::Command::new(exe)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;

    Ok(())
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

    if opt.daemonize {
        daemonize()?;

        return Ok(());
    }

    tracing::info!("starting gpupgrade agent");

    let state_dir = opt.state_dir.unwrap_or_else(gpupgrade_utils::state_dir);
    let log_dir = gpupgrade_utils::log_dir()?;

    let service = AgentService::new(state_dir, log_dir, HOSTNAME.clone(), Arc::new(LocalExecutor));

    let addr: SocketAddr = ([0, 0, 0, 0], opt.port).into();

    tonic::transport::Server::builder()
        .add_service(AgentServer::new(service))
        .serve_with_shutdown(addr, wait_for_termination())
        .await?;

    tracing::info!("terminating on signal");

    Ok(())
}
