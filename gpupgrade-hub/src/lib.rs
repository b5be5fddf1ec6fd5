// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

pub mod agent_conns;
pub mod config;
pub mod db;
pub mod execute;
pub mod finalize;
pub mod greenplum;
pub mod initialize;
pub mod logs;
pub mod rename_data_directories;
pub mod restore_source_cluster;
pub mod revert;
pub mod rpc;
pub mod server;
pub mod standby_mirrors;
pub mod target_config;
pub mod update_catalog;
pub mod update_conf_files;
pub mod upgrade_mirrors;

use gpupgrade_utils::ErrorList;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("the connections to the following hosts were not ready: {0}")]
    AgentsNotReady(String),
    #[error("version mismatch across hosts:\n{0}")]
    VersionMismatch(String),
    #[error("could not find {count} consecutive free ports starting near {base}")]
    NoFreePorts { base: u16, count: u16 },
    #[error("source cluster does not have mirrors and/or standby. Cannot restore source cluster. Please contact support.")]
    MissingMirrorsAndStandby,
    #[error("source content ids are {source_content_ids:?}, database content ids are {database:?}")]
    ContentMismatch {
        source_content_ids: Vec<i32>,
        database: Vec<i32>,
    },
    #[error("updated {rows} rows for content {content}, expected 1")]
    UnexpectedCatalogRows { content: i32, rows: u64 },
    #[error("no target segment was generated for content {content}; re-run initialize")]
    MissingIntermediateSegment { content: i32 },
    #[error("the persisted upgrade state does not match this cluster; re-run initialize")]
    StaleFingerprint,
    #[error(transparent)]
    Cluster(#[from] gpupgrade_wire_types::ClusterError),
    #[error(transparent)]
    Cmd(#[from] gpupgrade_cmd::CmdError),
    #[error(transparent)]
    Fs(#[from] gpupgrade_fs::FsError),
    #[error(transparent)]
    Upgrade(#[from] gpupgrade_upgrade::UpgradeError),
    #[error(transparent)]
    Step(#[from] gpupgrade_step::StepError),
    #[error(transparent)]
    Sql(#[from] tokio_postgres::Error),
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
    #[error("agent request failed: {0}")]
    Rpc(#[from] tonic::Status),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Errors(#[from] ErrorList),
    #[error("could not parse version from {0:?}")]
    BadVersion(String),
}

impl HubError {
    /// Precondition violations are surfaced to the client distinctly so it
    /// can exit with the dedicated status code.
    pub fn is_precondition_violation(&self) -> bool {
        matches!(
            self,
            Self::MissingMirrorsAndStandby
                | Self::VersionMismatch(_)
                | Self::ContentMismatch { .. }
                | Self::StaleFingerprint
        )
    }
}
