// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use gpupgrade_cli::{display_failure, display_success, render_stream, CliError};
use gpupgrade_idl::{
    cli_to_hub_client::CliToHubClient, response, ExecuteRequest, FinalizeRequest,
    InitializeRequest, RevertRequest,
};
use std::{path::PathBuf, process::exit, str::FromStr};
use structopt::StructOpt;
use tonic::transport::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Copy,
    Link,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copy" => Ok(Self::Copy),
            "link" => Ok(Self::Link),
            other => Err(format!("invalid mode {:?}; expected copy or link", other)),
        }
    }
}

#[derive(Debug, StructOpt)]
#[structopt(name = "gpupgrade")]
/// Drives an online, in-place major-version upgrade of the cluster.
enum App {
    /// Capture the source cluster and create an empty target next to it
    #[structopt(name = "initialize")]
    Initialize {
        #[structopt(long, parse(from_os_str))]
        source_gphome: PathBuf,
        #[structopt(long, parse(from_os_str))]
        target_gphome: PathBuf,
        #[structopt(long)]
        source_master_port: u16,
        /// copy (default) or link
        #[structopt(long, default_value = "copy")]
        mode: Mode,
        #[structopt(long)]
        use_hba_hostnames: bool,
        #[structopt(short, long)]
        verbose: bool,
    },
    /// Upgrade the coordinator and the primaries
    #[structopt(name = "execute")]
    Execute {
        #[structopt(short, long)]
        verbose: bool,
    },
    /// Swap the upgraded cluster into place and bring up the replicas
    #[structopt(name = "finalize")]
    Finalize {
        #[structopt(short, long)]
        verbose: bool,
    },
    /// Restore the source cluster, undoing any partial upgrade
    #[structopt(name = "revert")]
    Revert {
        #[structopt(short, long)]
        verbose: bool,
    },
}

async fn connect(port: u16) -> Result<CliToHubClient<Channel>, CliError> {
    Ok(CliToHubClient::connect(format!("http://localhost:{}", port)).await?)
}

async fn run(app: App, hub_port: u16) -> Result<(), CliError> {
    let mut client = connect(hub_port).await?;

    match app {
        App::Initialize {
            source_gphome,
            target_gphome,
            source_master_port,
            mode,
            use_hba_hostnames,
            verbose,
        } => {
            let stream = client
                .initialize(InitializeRequest {
                    source_gphome: source_gphome.display().to_string(),
                    target_gphome: target_gphome.display().to_string(),
                    source_port: source_master_port as i32,
                    use_link_mode: mode == Mode::Link,
                    use_hba_hostnames,
                })
                .await?
                .into_inner();

            let response = render_stream(stream, verbose).await?;

            if let Some(response::Contents::Initialize(x)) =
                response.and_then(|r| r.contents)
            {
                display_success(format!(
                    "initialize complete (mirrors: {}, standby: {})",
                    x.has_mirrors, x.has_standby,
                ));
            }
        }
        App::Execute { verbose } => {
            let stream = client.execute(ExecuteRequest {}).await?.into_inner();

            let response = render_stream(stream, verbose).await?;

            if let Some(response::Contents::Execute(x)) = response.and_then(|r| r.contents) {
                if let Some(target) = x.target {
                    display_success(format!(
                        "execute complete; target is running on port {} at {}",
                        target.port, target.master_data_directory,
                    ));
                }
            }
        }
        App::Finalize { verbose } => {
            let stream = client.finalize(FinalizeRequest {}).await?.into_inner();

            let response = render_stream(stream, verbose).await?;

            if let Some(response::Contents::Finalize(x)) = response.and_then(|r| r.contents) {
                if let Some(target) = x.target {
                    display_success(format!(
                        "finalize complete; version {} is running on port {} at {}",
                        target.version, target.port, target.master_data_directory,
                    ));
                }

                println!("log archive:         {}", x.log_archive_directory);
                println!(
                    "archived master:     {}",
                    x.archived_source_master_data_directory
                );
                println!("upgrade id:          {}", x.upgrade_id);
            }
        }
        App::Revert { verbose } => {
            let stream = client.revert(RevertRequest {}).await?.into_inner();

            let response = render_stream(stream, verbose).await?;

            if let Some(response::Contents::Revert(x)) = response.and_then(|r| r.contents) {
                if let Some(source) = x.source {
                    display_success(format!(
                        "revert complete; source is running on port {} at {}",
                        source.port, source.master_data_directory,
                    ));
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let hub_port = std::env::var("GPUPGRADE_HUB_PORT")
        .ok()
        .and_then(|x| x.parse().ok())
        .unwrap_or(7527);

    let app = App::from_args();

    if let Err(e) = run(app, hub_port).await {
        display_failure(&e);

        if e.exit_code() == 1 {
            eprintln!("Check the logs under ~/gpAdminLogs/gpupgrade, fix the reported problem, and re-run the step; completed substeps are skipped on the next attempt.");
        }

        exit(e.exit_code());
    }
}
