// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Moves the upgraded directories onto the source paths: every source data
//! directory is archived with an `_old` suffix and the matching staged
//! target directory is renamed into its place.

use crate::{agent_conns::AgentConn, config::Config, rpc::execute_rpc, HubError};
use gpupgrade_idl::{self as idl, TablespaceDeletion};
use gpupgrade_wire_types::{archive_data_dir, user_defined, VersionPolicy, MASTER_CONTENT_ID};
use std::collections::BTreeMap;
use tonic::Request;

pub type RenameMap = BTreeMap<String, Vec<idl::RenameDirectories>>;

pub async fn update_data_directories(
    config: &Config,
    conns: &[AgentConn],
) -> Result<(), HubError> {
    let source_master = config.source.master();
    let staged_master = config
        .intermediate
        .master
        .as_ref()
        .ok_or(HubError::MissingIntermediateSegment {
            content: MASTER_CONTENT_ID,
        })?;

    gpupgrade_fs::archive_and_swap(
        &source_master.data_dir,
        &archive_data_dir(&source_master.data_dir),
        &staged_master.data_dir,
        false,
    )
    .await?;

    // In link mode the source mirror and standby directories share no fate
    // with the upgrade; they are deleted outright to save disk, and the
    // in-place-upgraded target mirrors take over their paths below.
    if config.use_link_mode {
        delete_mirror_and_standby_data_dirs(config, conns).await?;

        let policy = VersionPolicy::from_source(&config.source.version);

        if policy.legacy_tablespace_layout {
            delete_legacy_tablespaces_on_mirrors_and_standby(config, conns).await?;
        }
    }

    let renames = get_rename_map(config, !config.use_link_mode);

    rename_segment_data_dirs(conns, &renames).await
}

/// Maps each host to the renames it must perform. The standby is only
/// included in copy mode; in link mode its source directory was just
/// deleted and there is nothing staged to move onto it.
pub fn get_rename_map(config: &Config, include_standby: bool) -> RenameMap {
    let mut map = RenameMap::new();

    for staged in &config.intermediate.primaries {
        let source = match config.source.primaries.get(&staged.content_id) {
            Some(x) => x,
            None => continue,
        };

        map.entry(staged.hostname.clone()).or_default().push(idl::RenameDirectories {
            source: source.data_dir.display().to_string(),
            archive: archive_data_dir(&source.data_dir).display().to_string(),
            target: staged.data_dir.display().to_string(),
            archive_only: false,
        });
    }

    let mut staged_mirrors: Vec<_> = config.intermediate.mirrors.iter().collect();

    if include_standby {
        staged_mirrors.extend(config.intermediate.standby.iter());
    }

    for staged in staged_mirrors {
        let source = match config.source.mirrors.get(&staged.content_id) {
            Some(x) => x,
            None => continue,
        };

        map.entry(staged.hostname.clone()).or_default().push(idl::RenameDirectories {
            source: source.data_dir.display().to_string(),
            archive: archive_data_dir(&source.data_dir).display().to_string(),
            target: staged.data_dir.display().to_string(),
            archive_only: false,
        });
    }

    map
}

/// Issues the renames host by host; hosts with no entries get no RPC.
pub async fn rename_segment_data_dirs(
    conns: &[AgentConn],
    renames: &RenameMap,
) -> Result<(), HubError> {
    execute_rpc(conns, |mut conn| async move {
        let dirs = match renames.get(&conn.hostname) {
            Some(dirs) if !dirs.is_empty() => dirs.clone(),
            _ => return Ok(()),
        };

        conn.client
            .rename_directories(Request::new(idl::RenameDirectoriesRequest { dirs }))
            .await?;

        Ok(())
    })
    .await?;

    Ok(())
}

async fn delete_mirror_and_standby_data_dirs(
    config: &Config,
    conns: &[AgentConn],
) -> Result<(), HubError> {
    execute_rpc(conns, |mut conn| async move {
        let datadirs: Vec<String> = config
            .source
            .mirrors
            .values()
            .filter(|seg| seg.is_on_host(&conn.hostname))
            .map(|seg| seg.data_dir.display().to_string())
            .collect();

        if datadirs.is_empty() {
            return Ok(());
        }

        conn.client
            .delete_data_directories(Request::new(idl::DeleteDataDirectoriesRequest { datadirs }))
            .await?;

        Ok(())
    })
    .await?;

    Ok(())
}

/// Deletes the 5X per-dbid tablespace directories on mirror and standby
/// hosts. The deletion is scoped to the exact legacy layout so a 6X-or-newer
/// tree can never match.
async fn delete_legacy_tablespaces_on_mirrors_and_standby(
    config: &Config,
    conns: &[AgentConn],
) -> Result<(), HubError> {
    execute_rpc(conns, |mut conn| async move {
        let mut dirs = vec![];

        for seg in config.source.mirrors.values() {
            if !seg.is_on_host(&conn.hostname) {
                continue;
            }

            if let Some(spaces) = config.tablespaces.get(&seg.dbid) {
                for (_, info) in user_defined(spaces) {
                    dirs.push(TablespaceDeletion {
                        location: info.location.display().to_string(),
                        dbid: seg.dbid,
                        catalog_suffix: String::new(),
                    });
                }
            }
        }

        if dirs.is_empty() {
            return Ok(());
        }

        conn.client
            .delete_tablespace_directories(Request::new(
                idl::DeleteTablespaceDirectoriesRequest { dirs },
            ))
            .await?;

        Ok(())
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpupgrade_wire_types::{Cluster, InitializeConfig, Role, SegConfig, UpgradeId};

    fn seg(dbid: i32, content: i32, role: Role, host: &str, port: u16, dir: &str) -> SegConfig {
        SegConfig {
            dbid,
            content_id: content,
            role,
            hostname: host.into(),
            port,
            data_dir: dir.into(),
        }
    }

    fn config() -> Config {
        let mut config = Config::new(UpgradeId::from_raw(0xABC));

        config.source = Cluster::from_segments(
            semver::Version::new(5, 28, 6),
            "/usr/local/greenplum-db-5".into(),
            vec![
                seg(1, -1, Role::Primary, "mdw", 5432, "/data/master/gpseg-1"),
                seg(2, 0, Role::Primary, "sdw1", 25432, "/data/dbfast1/seg1"),
                seg(3, 1, Role::Primary, "sdw2", 25433, "/data/dbfast2/seg2"),
                seg(4, 0, Role::Mirror, "sdw2", 25434, "/data/dbfast_mirror1/seg1"),
                seg(5, 1, Role::Mirror, "sdw1", 25435, "/data/dbfast_mirror2/seg2"),
                seg(6, -1, Role::Mirror, "standby", 5433, "/data/standby"),
            ],
        )
        .unwrap();

        config.intermediate = InitializeConfig {
            master: Some(seg(1, -1, Role::Primary, "mdw", 6432, "/data/master/gpseg_00000ABC-1")),
            standby: Some(seg(6, -1, Role::Mirror, "standby", 6433, "/data/standby_00000ABC")),
            primaries: vec![
                seg(2, 0, Role::Primary, "sdw1", 6434, "/data/dbfast1/seg1_00000ABC"),
                seg(3, 1, Role::Primary, "sdw2", 6435, "/data/dbfast2/seg2_00000ABC"),
            ],
            mirrors: vec![
                seg(4, 0, Role::Mirror, "sdw2", 6436, "/data/dbfast_mirror1/seg1_00000ABC"),
                seg(5, 1, Role::Mirror, "sdw1", 6437, "/data/dbfast_mirror2/seg2_00000ABC"),
            ],
        };

        config
    }

    #[test]
    fn test_rename_map_in_copy_mode_includes_the_standby() {
        let map = get_rename_map(&config(), true);

        assert_eq!(
            map.keys().collect::<Vec<_>>(),
            vec!["sdw1", "sdw2", "standby"]
        );

        let standby = &map["standby"][0];
        assert_eq!(standby.source, "/data/standby");
        assert_eq!(standby.archive, "/data/standby_old");
        assert!(!standby.archive_only);
    }

    #[test]
    fn test_rename_map_in_link_mode_skips_the_standby() {
        let map = get_rename_map(&config(), false);

        assert!(!map.contains_key("standby"));

        // Each segment host carries its primary and the mirror it hosts.
        assert_eq!(map["sdw1"].len(), 2);
        assert_eq!(map["sdw2"].len(), 2);

        let primary = &map["sdw1"][0];
        assert_eq!(primary.source, "/data/dbfast1/seg1");
        assert_eq!(primary.archive, "/data/dbfast1/seg1_old");
        assert_eq!(primary.target, "/data/dbfast1/seg1_00000ABC");
    }
}
