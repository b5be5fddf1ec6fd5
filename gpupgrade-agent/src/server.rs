// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! The per-host agent service. Every multi-entity RPC fans its entries out
//! concurrently and returns a composite error naming each failure, so the
//! hub sees all of a host's problems in one round trip.

use futures::future::join_all;
use gpupgrade_cmd::{CheckedCommandExt, Executor, OutputExt, Streams};
use gpupgrade_idl::{
    agent_server::Agent, ArchiveLogDirectoryReply, ArchiveLogDirectoryRequest,
    CheckFreePortsReply, CheckFreePortsRequest, CheckVersionsReply, CheckVersionsRequest,
    DeleteDataDirectoriesReply, DeleteDataDirectoriesRequest, DeleteStateDirectoryReply,
    DeleteStateDirectoryRequest, DeleteTablespaceDirectoriesReply,
    DeleteTablespaceDirectoriesRequest, RenameDirectoriesReply, RenameDirectoriesRequest,
    RestorePgControlReply, RestorePgControlRequest, RsyncReply, RsyncRequest,
    UpgradeMirrorsReply, UpgradeMirrorsRequest, UpgradePrimariesReply, UpgradePrimariesRequest,
};
use gpupgrade_upgrade::{mirror::upgrade_mirror, primary::upgrade_primary, UpgradeError};
use gpupgrade_utils::{collect_errors, ErrorList};
use std::{net::TcpListener, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

#[derive(Debug, thiserror::Error)]
enum AgentError {
    #[error("upgrade primary on host {host} with content {content}: {source}")]
    UpgradePrimary {
        host: String,
        content: i32,
        #[source]
        source: UpgradeError,
    },
    #[error("upgrade mirror on host {host} with content {content}: {source}")]
    UpgradeMirror {
        host: String,
        content: i32,
        #[source]
        source: UpgradeError,
    },
}

pub struct AgentService {
    state_dir: PathBuf,
    log_dir: PathBuf,
    hostname: String,
    executor: Arc<dyn Executor>,
}

impl AgentService {
    pub fn new(
        state_dir: PathBuf,
        log_dir: PathBuf,
        hostname: String,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            state_dir,
            log_dir,
            hostname,
            executor,
        }
    }

    /// Output of agent-side external commands goes to the agent log; the hub
    /// streams its own output, not the agents'.
    fn streams(&self) -> Streams {
        Streams::dev_null(CancellationToken::new())
    }
}

fn to_status(errors: ErrorList) -> Status {
    Status::internal(errors.to_string())
}

async fn rsync_pairs(
    executor: &dyn Executor,
    streams: &Streams,
    request: &RsyncRequest,
) -> Result<(), Status> {
    let tasks = request.pairs.iter().map(|pair| {
        let mut rsync = gpupgrade_cmd::rsync::Rsync::new()
            .source_contents(&pair.source)
            .destination(&pair.destination)
            .options(request.options.clone())
            .excludes(request.excludes.clone());

        if !pair.destination_host.is_empty() {
            rsync = rsync.destination_host(&pair.destination_host);
        }

        async move { rsync.run(executor, streams).await }
    });

    collect_errors(join_all(tasks).await)
        .map(drop)
        .map_err(to_status)
}

#[tonic::async_trait]
impl Agent for AgentService {
    async fn check_versions(
        &self,
        request: Request<CheckVersionsRequest>,
    ) -> Result<Response<CheckVersionsReply>, Status> {
        let CheckVersionsRequest { gphome } = request.into_inner();

        tracing::info!(%gphome, "agent received request to check versions");

        let postgres = PathBuf::from(&gphome).join("bin").join("postgres");

        let output = tokio::process::Command::new(postgres)
            .arg("--gp-version")
            .checked_output()
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        let gphome_version = gpupgrade_wire_types::parse_version_output(&output.stdout_string_lossy())
            .ok_or_else(|| {
                Status::internal(format!(
                    "could not parse version from {:?}",
                    output.stdout_string_lossy()
                ))
            })?;

        Ok(Response::new(CheckVersionsReply {
            gpupgrade_version: env!("CARGO_PKG_VERSION").to_string(),
            gphome_version: gphome_version.to_string(),
        }))
    }

    async fn check_free_ports(
        &self,
        request: Request<CheckFreePortsRequest>,
    ) -> Result<Response<CheckFreePortsReply>, Status> {
        let CheckFreePortsRequest { base, count } = request.into_inner();

        for port in base..base + count {
            if TcpListener::bind(("0.0.0.0", port as u16)).is_err() {
                return Ok(Response::new(CheckFreePortsReply {
                    free: false,
                    conflicting_port: port,
                }));
            }
        }

        Ok(Response::new(CheckFreePortsReply {
            free: true,
            conflicting_port: 0,
        }))
    }

    async fn rename_directories(
        &self,
        request: Request<RenameDirectoriesRequest>,
    ) -> Result<Response<RenameDirectoriesReply>, Status> {
        let RenameDirectoriesRequest { dirs } = request.into_inner();

        tracing::info!("agent received request to rename segment data directories");

        let tasks = dirs.iter().map(|dir| async move {
            gpupgrade_fs::archive_and_swap(
                dir.source.as_ref(),
                dir.archive.as_ref(),
                dir.target.as_ref(),
                dir.archive_only,
            )
            .await
        });

        collect_errors(join_all(tasks).await)
            .map(|_| Response::new(RenameDirectoriesReply {}))
            .map_err(to_status)
    }

    async fn delete_data_directories(
        &self,
        request: Request<DeleteDataDirectoriesRequest>,
    ) -> Result<Response<DeleteDataDirectoriesReply>, Status> {
        let DeleteDataDirectoriesRequest { datadirs } = request.into_inner();

        tracing::info!("agent received request to delete segment data directories");

        let tasks = datadirs
            .iter()
            .map(|dir| async move { gpupgrade_fs::delete_data_directory(dir.as_ref()).await });

        collect_errors(join_all(tasks).await)
            .map(|_| Response::new(DeleteDataDirectoriesReply {}))
            .map_err(to_status)
    }

    async fn delete_tablespace_directories(
        &self,
        request: Request<DeleteTablespaceDirectoriesRequest>,
    ) -> Result<Response<DeleteTablespaceDirectoriesReply>, Status> {
        let DeleteTablespaceDirectoriesRequest { dirs } = request.into_inner();

        tracing::info!("agent received request to delete tablespace directories");

        let tasks = dirs.iter().map(|x| async move {
            let location = PathBuf::from(&x.location);

            // Tablespace locations always end in an oid directory:
            // `<...>/<oid>`. Anything else is not ours to delete.
            let oid_component = location
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.parse::<u32>().ok());

            if oid_component.is_none() {
                return Err(gpupgrade_fs::FsError::NotALegacyTablespace(location));
            }

            let dbid_dir = location.join(x.dbid.to_string());

            if !gpupgrade_wire_types::is_legacy_tablespace_path(&dbid_dir, &location, x.dbid) {
                return Err(gpupgrade_fs::FsError::NotALegacyTablespace(dbid_dir));
            }

            // An empty suffix scopes the deletion to the legacy per-dbid
            // directory itself; a catalog suffix scopes it to the target
            // cluster's versioned subdirectory and nothing older.
            let doomed = if x.catalog_suffix.is_empty() {
                dbid_dir
            } else {
                dbid_dir.join(&x.catalog_suffix)
            };

            gpupgrade_fs::remove_dir_all_if_exists(&doomed).await
        });

        collect_errors(join_all(tasks).await)
            .map(|_| Response::new(DeleteTablespaceDirectoriesReply {}))
            .map_err(to_status)
    }

    async fn delete_state_directory(
        &self,
        _request: Request<DeleteStateDirectoryRequest>,
    ) -> Result<Response<DeleteStateDirectoryReply>, Status> {
        tracing::info!("agent received request to delete its state directory");

        gpupgrade_fs::remove_dir_all_if_exists(&self.state_dir)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(DeleteStateDirectoryReply {}))
    }

    async fn upgrade_primaries(
        &self,
        request: Request<UpgradePrimariesRequest>,
    ) -> Result<Response<UpgradePrimariesReply>, Status> {
        let request = request.into_inner();

        tracing::info!(
            check_only = request.check_only,
            "agent received request to upgrade primaries"
        );

        let streams = self.streams();

        let tasks = request.data_dir_pairs.iter().map(|pair| {
            let request = &request;
            let streams = &streams;

            async move {
                upgrade_primary(self.executor.as_ref(), &self.state_dir, request, pair, streams)
                    .await
                    .map_err(|source| AgentError::UpgradePrimary {
                        host: self.hostname.clone(),
                        content: pair.content,
                        source,
                    })
            }
        });

        collect_errors(join_all(tasks).await)
            .map(|_| Response::new(UpgradePrimariesReply {}))
            .map_err(to_status)
    }

    async fn upgrade_mirrors(
        &self,
        request: Request<UpgradeMirrorsRequest>,
    ) -> Result<Response<UpgradeMirrorsReply>, Status> {
        let UpgradeMirrorsRequest { pg_options } = request.into_inner();

        tracing::info!("agent received request to upgrade mirrors");

        let streams = self.streams();

        let tasks = pg_options.iter().map(|opt| {
            let streams = &streams;

            async move {
                upgrade_mirror(self.executor.as_ref(), &self.state_dir, opt, streams)
                    .await
                    .map_err(|source| AgentError::UpgradeMirror {
                        host: self.hostname.clone(),
                        content: opt.content,
                        source,
                    })
            }
        });

        collect_errors(join_all(tasks).await)
            .map(|_| Response::new(UpgradeMirrorsReply {}))
            .map_err(to_status)
    }

    async fn rsync_data_directories(
        &self,
        request: Request<RsyncRequest>,
    ) -> Result<Response<RsyncReply>, Status> {
        let request = request.into_inner();

        tracing::info!("agent received request to rsync data directories");

        rsync_pairs(self.executor.as_ref(), &self.streams(), &request).await?;

        Ok(Response::new(RsyncReply {}))
    }

    async fn rsync_tablespace_directories(
        &self,
        request: Request<RsyncRequest>,
    ) -> Result<Response<RsyncReply>, Status> {
        let request = request.into_inner();

        tracing::info!("agent received request to rsync tablespace directories");

        rsync_pairs(self.executor.as_ref(), &self.streams(), &request).await?;

        Ok(Response::new(RsyncReply {}))
    }

    async fn restore_primaries_pg_control(
        &self,
        request: Request<RestorePgControlRequest>,
    ) -> Result<Response<RestorePgControlReply>, Status> {
        let RestorePgControlRequest { datadirs } = request.into_inner();

        tracing::info!("agent received request to restore pg_control on primaries");

        let tasks = datadirs
            .iter()
            .map(|dir| async move { gpupgrade_fs::restore_pg_control(dir.as_ref()).await });

        collect_errors(join_all(tasks).await)
            .map(|_| Response::new(RestorePgControlReply {}))
            .map_err(to_status)
    }

    async fn archive_log_directory(
        &self,
        request: Request<ArchiveLogDirectoryRequest>,
    ) -> Result<Response<ArchiveLogDirectoryReply>, Status> {
        let ArchiveLogDirectoryRequest { new_dir } = request.into_inner();

        tracing::info!(%new_dir, "agent received request to archive its log directory");

        let moved = gpupgrade_fs::move_dir(&self.log_dir, new_dir.as_ref())
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        if !moved {
            tracing::debug!(log_dir = ?self.log_dir, "no log directory to archive");
        }

        Ok(Response::new(ArchiveLogDirectoryReply {}))
    }
}
