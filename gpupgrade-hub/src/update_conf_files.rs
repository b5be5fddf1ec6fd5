// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Post-rename configuration file fixups. Each segment's `postgresql.conf`
//! is rewritten from its own old port to its own new port; a mirror's
//! `recovery.conf` follows its primary's port instead, since that file
//! points at the peer.

use crate::{config::Config, HubError};
use futures::future::join_all;
use gpupgrade_fs::conf;
use gpupgrade_utils::collect_errors;
use gpupgrade_wire_types::{Role, VersionPolicy, MASTER_CONTENT_ID};

pub async fn update_conf_files(config: &Config) -> Result<(), HubError> {
    let master = config.source.master();
    let new_master = config
        .intermediate
        .master
        .as_ref()
        .ok_or(HubError::MissingIntermediateSegment {
            content: MASTER_CONTENT_ID,
        })?;

    // The directories were renamed in the previous substep, so every file
    // now lives at the source path.
    let gpperfmon_conf = master
        .data_dir
        .join("gpperfmon")
        .join("conf")
        .join("gpperfmon.conf");

    if VersionPolicy::needs_gpperfmon_rewrite(config.target.version.major)
        && gpupgrade_fs::path_exists(&gpperfmon_conf).await
    {
        conf::update_gpperfmon_log_location(&master.data_dir).await?;
    }

    conf::update_postgresql_conf_port(&master.data_dir, master.port, new_master.port).await?;

    if config.use_link_mode && config.source.has_mirrors() {
        update_mirror_conf_files(config).await?;
    }

    Ok(())
}

async fn update_mirror_conf_files(config: &Config) -> Result<(), HubError> {
    let tasks = config
        .intermediate
        .mirrors
        .iter()
        .filter(|seg| seg.role == Role::Mirror && seg.content_id != MASTER_CONTENT_ID)
        .map(|new_mirror| async move {
            let old_mirror = config.source.mirrors.get(&new_mirror.content_id).ok_or(
                HubError::MissingIntermediateSegment {
                    content: new_mirror.content_id,
                },
            )?;
            let old_primary = config.source.primaries.get(&new_mirror.content_id).ok_or(
                HubError::MissingIntermediateSegment {
                    content: new_mirror.content_id,
                },
            )?;
            let new_primary = config
                .intermediate
                .primary_for_content(new_mirror.content_id)
                .ok_or(HubError::MissingIntermediateSegment {
                    content: new_mirror.content_id,
                })?;

            conf::update_postgresql_conf_port(
                &old_mirror.data_dir,
                old_mirror.port,
                new_mirror.port,
            )
            .await?;

            conf::update_recovery_conf_port(
                &old_mirror.data_dir,
                old_primary.port,
                new_primary.port,
            )
            .await?;

            Ok::<_, HubError>(())
        });

    collect_errors(join_all(tasks).await)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpupgrade_wire_types::{Cluster, InitializeConfig, SegConfig, UpgradeId};
    use tempfile::TempDir;

    fn seg(dbid: i32, content: i32, role: Role, host: &str, port: u16, dir: &std::path::Path) -> SegConfig {
        SegConfig {
            dbid,
            content_id: content,
            role,
            hostname: host.into(),
            port,
            data_dir: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn test_mirror_conf_rewrites_use_own_and_primary_ports() {
        let tmp = TempDir::new().unwrap();

        let master_dir = tmp.path().join("gpseg-1");
        let primary_dir = tmp.path().join("seg1");
        let mirror_dir = tmp.path().join("mirror1");

        for dir in [&master_dir, &primary_dir, &mirror_dir] {
            std::fs::create_dir_all(dir).unwrap();
        }

        std::fs::write(master_dir.join("postgresql.conf"), "port = 5432\n").unwrap();
        std::fs::write(mirror_dir.join("postgresql.conf"), "port = 25434\n").unwrap();
        std::fs::write(
            mirror_dir.join("recovery.conf"),
            "primary_conninfo = 'host=sdw1 port=25432'\n",
        )
        .unwrap();

        let mut config = Config::new(UpgradeId::from_raw(1));
        config.use_link_mode = true;

        config.source = Cluster::from_segments(
            semver::Version::new(5, 28, 6),
            "/usr/local/greenplum-db-5".into(),
            vec![
                seg(1, -1, Role::Primary, "mdw", 5432, &master_dir),
                seg(2, 0, Role::Primary, "sdw1", 25432, &primary_dir),
                seg(3, 0, Role::Mirror, "sdw2", 25434, &mirror_dir),
            ],
        )
        .unwrap();

        config.target = Cluster {
            version: semver::Version::new(6, 21, 0),
            ..Cluster::default()
        };

        config.intermediate = InitializeConfig {
            master: Some(seg(1, -1, Role::Primary, "mdw", 6432, &master_dir)),
            standby: None,
            primaries: vec![seg(2, 0, Role::Primary, "sdw1", 6434, &primary_dir)],
            mirrors: vec![seg(3, 0, Role::Mirror, "sdw2", 6435, &mirror_dir)],
        };

        update_conf_files(&config).await.unwrap();

        let master_conf = std::fs::read_to_string(master_dir.join("postgresql.conf")).unwrap();
        assert_eq!(master_conf, "port = 6432\n");

        let mirror_conf = std::fs::read_to_string(mirror_dir.join("postgresql.conf")).unwrap();
        assert_eq!(mirror_conf, "port = 6435\n");

        let recovery = std::fs::read_to_string(mirror_dir.join("recovery.conf")).unwrap();
        assert_eq!(recovery, "primary_conninfo = 'host=sdw1 port=6434'\n");
    }
}
