// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Rewrites the target's `gp_segment_configuration` so its topology mirrors
//! the source: every segment takes over the source data directory path
//! (the directories themselves are renamed in the next substep) while
//! keeping the port it was assigned at initialize.

use crate::{config::Config, HubError};
use gpupgrade_wire_types::{contents_match, Cluster, Role, SegConfig, MASTER_CONTENT_ID};
use std::collections::BTreeSet;
use std::path::Path;
use tokio_postgres::{Client, Transaction};

pub async fn update_gp_segment_configuration(
    client: &mut Client,
    config: &Config,
) -> Result<(), HubError> {
    let tx = client.transaction().await?;

    sanity_check_content_ids(&tx, &config.source).await?;

    for (content, source_primary) in &config.source.primaries {
        let port = target_port(config, *content, Role::Primary)?;

        update_row(&tx, *content, Role::Primary, port, &source_primary.data_dir).await?;

        // The standby does not exist on the target yet; it is created after
        // startup. Mirrors are only present in the catalog in link mode.
        if config.use_link_mode && *content != MASTER_CONTENT_ID {
            if let Some(source_mirror) = config.source.mirrors.get(content) {
                let port = target_port(config, *content, Role::Mirror)?;

                update_row(&tx, *content, Role::Mirror, port, &source_mirror.data_dir).await?;
            }
        }
    }

    tx.commit().await?;

    Ok(())
}

fn target_port(config: &Config, content: i32, role: Role) -> Result<u16, HubError> {
    let seg = match role {
        Role::Primary if content == MASTER_CONTENT_ID => config.intermediate.master.as_ref(),
        Role::Primary => config.intermediate.primary_for_content(content),
        Role::Mirror => config
            .intermediate
            .mirrors
            .iter()
            .find(|seg| seg.content_id == content),
    };

    seg.map(|seg| seg.port)
        .ok_or(HubError::MissingIntermediateSegment { content })
}

async fn update_row(
    tx: &Transaction<'_>,
    content: i32,
    role: Role,
    port: u16,
    data_dir: &Path,
) -> Result<(), HubError> {
    let rows = tx
        .execute(
            "UPDATE gp_segment_configuration SET port = $1, datadir = $2 \
             WHERE content = $3 AND role = $4::\"char\"",
            &[
                &(port as i32),
                &data_dir.display().to_string(),
                &content,
                &role.code(),
            ],
        )
        .await?;

    // More than one row means a primary and a mirror are both registered at
    // a role we expected to be unique; none means the catalog drifted.
    if rows != 1 {
        return Err(HubError::UnexpectedCatalogRows { content, rows });
    }

    Ok(())
}

/// Fails with the content-mismatch error class iff the target catalog's
/// content set differs from the source's.
async fn sanity_check_content_ids(
    tx: &Transaction<'_>,
    source: &Cluster,
) -> Result<(), HubError> {
    let rows = tx
        .query("SELECT content::int FROM gp_segment_configuration", &[])
        .await?;

    let contents: BTreeSet<i32> = rows.iter().map(|row| row.get::<_, i32>(0)).collect();

    if !contents_match(&source.primaries, &contents) {
        return Err(HubError::ContentMismatch {
            source_content_ids: source.content_ids(),
            database: contents.into_iter().collect(),
        });
    }

    Ok(())
}

/// The in-memory target cluster after a successful catalog commit: source
/// topology, initialize-assigned ports, target install.
pub fn rebuild_target_cluster(config: &Config) -> Result<Cluster, HubError> {
    let mut segments = vec![];

    for (content, source_primary) in &config.source.primaries {
        segments.push(SegConfig {
            port: target_port(config, *content, Role::Primary)?,
            ..source_primary.clone()
        });
    }

    if config.use_link_mode {
        for (content, source_mirror) in &config.source.mirrors {
            if *content == MASTER_CONTENT_ID {
                continue;
            }

            segments.push(SegConfig {
                port: target_port(config, *content, Role::Mirror)?,
                ..source_mirror.clone()
            });
        }
    }

    Ok(Cluster::from_segments(
        config.target.version.clone(),
        config.target.gphome.clone(),
        segments,
    )?)
}
