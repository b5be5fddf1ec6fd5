// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

pub mod proto {
    tonic::include_proto!("gpupgrade");
}

pub use proto::*;

use gpupgrade_wire_types as wire;
use std::{collections::HashMap, fmt};

impl Step {
    /// The stable name used for journal directories and client display.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UnknownStep => "unknown",
            Self::Initialize => "initialize",
            Self::Execute => "execute",
            Self::Finalize => "finalize",
            Self::Revert => "revert",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Substep {
    /// The stable name used for journal directories and client display.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UnknownSubstep => "unknown",
            Self::SavingSourceClusterConfig => "saving_source_cluster_config",
            Self::StartAgents => "start_agents",
            Self::EnsureVersionsMatch => "ensure_versions_match",
            Self::GenerateTargetConfig => "generate_target_config",
            Self::InitTargetCluster => "init_target_cluster",
            Self::ShutdownTargetCluster => "shutdown_target_cluster",
            Self::CheckUpgrade => "check_upgrade",
            Self::BackupTargetMaster => "backup_target_master",
            Self::ShutdownSourceCluster => "shutdown_source_cluster",
            Self::UpgradeMaster => "upgrade_master",
            Self::CopyMaster => "copy_master",
            Self::UpgradePrimaries => "upgrade_primaries",
            Self::MarkMirrorsDown => "mark_mirrors_down",
            Self::StartTargetCluster => "start_target_cluster",
            Self::UpgradeMirrors => "upgrade_mirrors",
            Self::UpdateTargetCatalogAndClusterConfig => "update_target_catalog_and_cluster_config",
            Self::UpdateDataDirectories => "update_data_directories",
            Self::UpdateTargetConfFiles => "update_target_conf_files",
            Self::UpgradeStandby => "upgrade_standby",
            Self::RecoversegTargetCluster => "recoverseg_target_cluster",
            Self::ArchiveLogDirectories => "archive_log_directories",
            Self::DeleteSegmentStatedirs => "delete_segment_statedirs",
            Self::DeleteTargetClusterDatadirs => "delete_target_cluster_datadirs",
            Self::DeleteTablespaces => "delete_tablespaces",
            Self::RestorePgcontrol => "restore_pgcontrol",
            Self::RestoreSourceCluster => "restore_source_cluster",
            Self::StartSourceCluster => "start_source_cluster",
            Self::RecoversegSourceCluster => "recoverseg_source_cluster",
        }
    }
}

impl fmt::Display for Substep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Status {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UnknownStatus => "unknown",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Message {
    pub fn chunk(r#type: chunk::Type, buffer: impl Into<Vec<u8>>) -> Self {
        Self {
            contents: Some(message::Contents::Chunk(Chunk {
                r#type: r#type as i32,
                buffer: buffer.into(),
            })),
        }
    }

    pub fn status(step: Step, substep: Substep, status: Status) -> Self {
        Self {
            contents: Some(message::Contents::Status(SubstepStatus {
                step: step as i32,
                substep: substep as i32,
                status: status as i32,
            })),
        }
    }

    pub fn response(contents: response::Contents) -> Self {
        Self {
            contents: Some(message::Contents::Response(Response {
                contents: Some(contents),
            })),
        }
    }
}

impl From<&wire::TablespaceInfo> for TablespaceInfo {
    fn from(x: &wire::TablespaceInfo) -> Self {
        Self {
            name: x.name.clone(),
            location: x.location.display().to_string(),
            user_defined: x.user_defined,
        }
    }
}

impl From<&TablespaceInfo> for wire::TablespaceInfo {
    fn from(x: &TablespaceInfo) -> Self {
        Self {
            name: x.name.clone(),
            location: x.location.clone().into(),
            user_defined: x.user_defined,
        }
    }
}

/// Converts one dbid's tablespaces into the wire map carried by agent RPCs.
pub fn tablespace_map(spaces: &wire::SegmentTablespaces) -> HashMap<u32, TablespaceInfo> {
    spaces.iter().map(|(oid, info)| (*oid, info.into())).collect()
}

/// The inverse of [`tablespace_map`], for agent-side consumers.
pub fn wire_tablespaces(map: &HashMap<u32, TablespaceInfo>) -> wire::SegmentTablespaces {
    map.iter().map(|(oid, info)| (*oid, info.into())).collect()
}
