// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Fans the link-mode in-place mirror upgrade out to the agents. Each
//! mirror is rebuilt from the template its primary produced during execute,
//! so this runs before the source mirror directories are deleted.

use crate::{agent_conns::AgentConn, config::Config, rpc::execute_rpc, HubError};
use gpupgrade_idl as idl;
use tonic::Request;

pub async fn upgrade_mirrors_in_place(
    config: &Config,
    conns: &[AgentConn],
) -> Result<(), HubError> {
    execute_rpc(conns, |mut conn| async move {
        let pg_options: Vec<idl::PgOptions> = config
            .intermediate
            .mirrors
            .iter()
            .filter(|seg| seg.is_on_host(&conn.hostname))
            .filter_map(|staged_mirror| pg_options(config, staged_mirror))
            .collect();

        if pg_options.is_empty() {
            return Ok(());
        }

        conn.client
            .upgrade_mirrors(Request::new(idl::UpgradeMirrorsRequest { pg_options }))
            .await?;

        Ok(())
    })
    .await?;

    Ok(())
}

fn pg_options(
    config: &Config,
    staged_mirror: &gpupgrade_wire_types::SegConfig,
) -> Option<idl::PgOptions> {
    let content = staged_mirror.content_id;

    let source_mirror = config.source.mirrors.get(&content)?;
    let staged_primary = config.intermediate.primary_for_content(content)?;

    Some(idl::PgOptions {
        primary_host: staged_primary.hostname.clone(),
        source_bindir: config.source.gphome.join("bin").display().to_string(),
        source_data_dir: source_mirror.data_dir.display().to_string(),
        source_port: source_mirror.port as i32,
        target_bindir: config.target.gphome.join("bin").display().to_string(),
        target_data_dir: staged_mirror.data_dir.display().to_string(),
        target_port: staged_mirror.port as i32,
        content,
        dbid: source_mirror.dbid,
        source_version: config.source.version.to_string(),
        target_version: config.target.version.to_string(),
        use_link_mode: config.use_link_mode,
        tablespaces_mapping_file_path: config
            .tablespaces_mapping_file_path
            .display()
            .to_string(),
        tablespaces: config
            .tablespaces
            .get(&source_mirror.dbid)
            .map(idl::tablespace_map)
            .unwrap_or_default(),
    })
}
