// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Brings the replicas back after the upgraded cluster is running: the
//! standby via the external standby-init script, and (in copy mode) the
//! mirrors via the external add-mirrors script. Both are recreated at the
//! source paths, which the data directory renames left free.

use crate::{config::Config, greenplum::GreenplumRunner, HubError};
use gpupgrade_cmd::{Executor, Streams};
use gpupgrade_wire_types::MASTER_CONTENT_ID;

pub async fn upgrade_standby(
    exec: &dyn Executor,
    config: &Config,
    streams: &Streams,
) -> Result<(), HubError> {
    let standby = config
        .source
        .standby()
        .ok_or(HubError::MissingMirrorsAndStandby)?;

    let port = config
        .intermediate
        .standby
        .as_ref()
        .map(|seg| seg.port)
        .ok_or(HubError::MissingIntermediateSegment {
            content: MASTER_CONTENT_ID,
        })?;

    let runner = GreenplumRunner::new(exec, &config.target);

    runner
        .gpinitstandby(
            &standby.hostname,
            port,
            &standby.data_dir,
            config.use_hba_hostnames,
            streams,
        )
        .await?;

    Ok(())
}

/// One line per mirror: `mirror<n>=<content>|<host>|<port>|<datadir>`,
/// recreating each mirror on its source host and path with the port
/// assigned at initialize.
pub fn render_gpaddmirrors_config(config: &Config) -> String {
    let mut out = String::new();

    for (i, (content, source_mirror)) in config
        .source
        .mirrors
        .iter()
        .filter(|(content, _)| **content != MASTER_CONTENT_ID)
        .enumerate()
    {
        let port = config
            .intermediate
            .mirrors
            .iter()
            .find(|seg| seg.content_id == *content)
            .map(|seg| seg.port)
            .unwrap_or(source_mirror.port);

        out.push_str(&format!(
            "mirror{}={}|{}|{}|{}\n",
            i,
            content,
            source_mirror.hostname,
            port,
            source_mirror.data_dir.display(),
        ));
    }

    out
}

pub async fn upgrade_mirrors_with_gpaddmirrors(
    exec: &dyn Executor,
    config: &Config,
    state_dir: &std::path::Path,
    streams: &Streams,
) -> Result<(), HubError> {
    let rendered = render_gpaddmirrors_config(config);

    let config_file = state_dir.join("add_mirrors_config");
    gpupgrade_utils::atomically_write(config_file.clone(), rendered.into_bytes()).await?;

    let runner = GreenplumRunner::new(exec, &config.target);

    runner
        .gpaddmirrors(&config_file, config.use_hba_hostnames, streams)
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

    #[test]
    fn test_gpaddmirrors_config_recreates_mirrors_on_source_paths() {
        let mut config = Config::new(UpgradeId::from_raw(1));

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
            master: None,
            standby: None,
            primaries: vec![],
            mirrors: vec![
                seg(4, 0, Role::Mirror, "sdw2", 6436, "/data/dbfast_mirror1/seg1_1"),
                seg(5, 1, Role::Mirror, "sdw1", 6437, "/data/dbfast_mirror2/seg2_1"),
            ],
        };

        assert_eq!(
            render_gpaddmirrors_config(&config),
            "mirror0=0|sdw2|6436|/data/dbfast_mirror1/seg1\n\
             mirror1=1|sdw1|6437|/data/dbfast_mirror2/seg2\n"
        );
    }
}
