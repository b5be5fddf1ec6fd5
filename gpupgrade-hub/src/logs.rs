// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! End-of-step housekeeping: archiving the admin log directories everywhere
//! and removing the agents' state directories.

use crate::{agent_conns::AgentConn, rpc::execute_rpc, HubError};
use chrono::Utc;
use gpupgrade_idl::{self as idl, Step};
use gpupgrade_utils::archive_log_directory_name;
use gpupgrade_wire_types::UpgradeId;
use std::path::{Path, PathBuf};
use tonic::Request;

/// The archive directory for this step's log rotation.
///
/// The name is chosen once and persisted next to the step's journal before
/// anything moves, so a resumed step reports the same path it started
/// archiving to.
pub async fn resolve_archive_dir(
    state_dir: &Path,
    step: Step,
    upgrade_id: UpgradeId,
) -> Result<PathBuf, HubError> {
    let marker = state_dir.join(step.name()).join("log-archive");

    if let Ok(saved) = tokio::fs::read_to_string(&marker).await {
        return Ok(PathBuf::from(saved.trim()));
    }

    let log_dir = gpupgrade_utils::log_dir()?;
    let parent = log_dir.parent().map(Path::to_path_buf).unwrap_or_default();
    let archive = parent.join(archive_log_directory_name(upgrade_id, Utc::now()));

    gpupgrade_utils::atomically_write(marker, archive.display().to_string().into_bytes()).await?;

    Ok(archive)
}

/// Moves the hub's log directory aside and asks every agent to do the same.
pub async fn archive_log_directories(
    archive: &Path,
    conns: &[AgentConn],
) -> Result<(), HubError> {
    let log_dir = gpupgrade_utils::log_dir()?;

    let moved = gpupgrade_fs::move_dir(&log_dir, archive).await?;
    if !moved {
        tracing::debug!(?log_dir, "no hub log directory to archive");
    }

    execute_rpc(conns, |mut conn| async move {
        conn.client
            .archive_log_directory(Request::new(idl::ArchiveLogDirectoryRequest {
                new_dir: archive.display().to_string(),
            }))
            .await?;

        Ok(())
    })
    .await?;

    Ok(())
}

pub async fn delete_segment_state_directories(conns: &[AgentConn]) -> Result<(), HubError> {
    execute_rpc(conns, |mut conn| async move {
        conn.client
            .delete_state_directory(Request::new(idl::DeleteStateDirectoryRequest {}))
            .await?;

        Ok(())
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_archive_dir_is_stable_across_resumption() {
        let tmp = TempDir::new().unwrap();
        let id = UpgradeId::from_raw(0xABC123);

        let first = resolve_archive_dir(tmp.path(), Step::Finalize, id)
            .await
            .unwrap();
        let second = resolve_archive_dir(tmp.path(), Step::Finalize, id)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert!(first
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("gpupgrade-00ABC123-"));
    }
}
