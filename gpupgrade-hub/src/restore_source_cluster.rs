// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Restores the source cluster from its replicas: the coordinator from the
//! standby, each primary from its mirror. Only possible while every primary
//! still has a healthy mirror and the coordinator a standby.

use crate::{agent_conns::AgentConn, config::Config, rpc::execute_rpc, HubError};
use futures::future;
use gpupgrade_cmd::{rsync::Rsync, rsync::ARCHIVE_OPTIONS, Executor, Streams};
use gpupgrade_idl as idl;
use gpupgrade_utils::ErrorList;
use gpupgrade_wire_types::user_defined;
use tonic::Request;

/// Per-segment files that must keep their local identity when a data
/// directory is rebuilt from its replica.
pub const RESTORE_EXCLUDES: &[&str] = &[
    "pg_hba.conf",
    "postmaster.opts",
    "postgresql.auto.conf",
    "internal.auto.conf",
    "gp_dbid",
    "postgresql.conf",
    "backup_label.old",
    "postmaster.pid",
    "recovery.conf",
];

/// Rsyncs the coordinator from the standby and, concurrently, every primary
/// from its mirror via the agents.
pub async fn rsync_master_and_primaries(
    exec: &dyn Executor,
    config: &Config,
    conns: &[AgentConn],
    streams: &Streams,
) -> Result<(), HubError> {
    if !config.source.has_all_mirrors_and_standby() {
        return Err(HubError::MissingMirrorsAndStandby);
    }

    let (master, primaries) = future::join(
        rsync_master(exec, config, streams),
        rsync_primaries(config, conns),
    )
    .await;

    let mut errors = ErrorList::new();
    if let Err(e) = master {
        errors.push(e);
    }
    if let Err(e) = primaries {
        errors.push(e);
    }

    errors.into_result().map_err(Into::into)
}

async fn rsync_master(
    exec: &dyn Executor,
    config: &Config,
    streams: &Streams,
) -> Result<(), HubError> {
    let standby = config
        .source
        .standby()
        .ok_or(HubError::MissingMirrorsAndStandby)?;

    Rsync::new()
        .source_host(&standby.hostname)
        .source_contents(&standby.data_dir)
        .destination(config.source.master_data_dir())
        .options(ARCHIVE_OPTIONS.to_vec())
        .excludes(RESTORE_EXCLUDES.to_vec())
        .run(exec, streams)
        .await?;

    Ok(())
}

async fn rsync_primaries(config: &Config, conns: &[AgentConn]) -> Result<(), HubError> {
    execute_rpc(conns, |mut conn| async move {
        let pairs: Vec<idl::RsyncPair> = config
            .source
            .mirrors
            .values()
            .filter(|seg| seg.is_mirror() && seg.is_on_host(&conn.hostname))
            .filter_map(|mirror| {
                let primary = config.source.primaries.get(&mirror.content_id)?;

                Some(idl::RsyncPair {
                    source: mirror.data_dir.display().to_string(),
                    destination_host: primary.hostname.clone(),
                    destination: primary.data_dir.display().to_string(),
                })
            })
            .collect();

        if pairs.is_empty() {
            return Ok(());
        }

        conn.client
            .rsync_data_directories(Request::new(idl::RsyncRequest {
                options: ARCHIVE_OPTIONS.iter().map(|x| x.to_string()).collect(),
                excludes: RESTORE_EXCLUDES.iter().map(|x| x.to_string()).collect(),
                pairs,
            }))
            .await?;

        Ok(())
    })
    .await?;

    Ok(())
}

/// Same shape for the user-defined tablespace trees.
pub async fn rsync_master_and_primaries_tablespaces(
    exec: &dyn Executor,
    config: &Config,
    conns: &[AgentConn],
    streams: &Streams,
) -> Result<(), HubError> {
    if !config.source.has_all_mirrors_and_standby() {
        return Err(HubError::MissingMirrorsAndStandby);
    }

    let (master, primaries) = future::join(
        rsync_master_tablespaces(exec, config, streams),
        rsync_primaries_tablespaces(config, conns),
    )
    .await;

    let mut errors = ErrorList::new();
    if let Err(e) = master {
        errors.push(e);
    }
    if let Err(e) = primaries {
        errors.push(e);
    }

    errors.into_result().map_err(Into::into)
}

async fn rsync_master_tablespaces(
    exec: &dyn Executor,
    config: &Config,
    streams: &Streams,
) -> Result<(), HubError> {
    let standby = config
        .source
        .standby()
        .ok_or(HubError::MissingMirrorsAndStandby)?;

    let master_dbid = config.source.master().dbid;

    let master_spaces = match config.tablespaces.get(&master_dbid) {
        Some(x) => x,
        None => return Ok(()),
    };

    let standby_spaces = config.tablespaces.get(&standby.dbid);

    for (oid, info) in user_defined(master_spaces) {
        let standby_location = standby_spaces
            .and_then(|spaces| spaces.get(&oid))
            .map(|x| x.location.clone());

        let standby_location = match standby_location {
            Some(x) => x,
            None => continue,
        };

        Rsync::new()
            .source_host(&standby.hostname)
            .source_contents(standby_location)
            .destination(&info.location)
            .options(ARCHIVE_OPTIONS.to_vec())
            .run(exec, streams)
            .await?;
    }

    Ok(())
}

async fn rsync_primaries_tablespaces(
    config: &Config,
    conns: &[AgentConn],
) -> Result<(), HubError> {
    execute_rpc(conns, |mut conn| async move {
        let mut pairs = vec![];

        for mirror in config.source.mirrors.values() {
            if !mirror.is_mirror() || !mirror.is_on_host(&conn.hostname) {
                continue;
            }

            let primary = match config.source.primaries.get(&mirror.content_id) {
                Some(x) => x,
                None => continue,
            };

            let mirror_spaces = match config.tablespaces.get(&mirror.dbid) {
                Some(x) => x,
                None => continue,
            };
            let primary_spaces = match config.tablespaces.get(&primary.dbid) {
                Some(x) => x,
                None => continue,
            };

            for (oid, mirror_info) in user_defined(mirror_spaces) {
                let primary_info = match primary_spaces.get(&oid) {
                    Some(x) => x,
                    None => continue,
                };

                pairs.push(idl::RsyncPair {
                    source: mirror_info.location.display().to_string(),
                    destination_host: primary.hostname.clone(),
                    destination: primary_info.location.display().to_string(),
                });
            }
        }

        if pairs.is_empty() {
            return Ok(());
        }

        conn.client
            .rsync_tablespace_directories(Request::new(idl::RsyncRequest {
                options: ARCHIVE_OPTIONS.iter().map(|x| x.to_string()).collect(),
                excludes: vec![],
                pairs,
            }))
            .await?;

        Ok(())
    })
    .await?;

    Ok(())
}

/// Puts back the `pg_control` files link-mode `pg_upgrade` renamed aside:
/// the coordinator's locally, every primary's via its host agent.
pub async fn restore_master_and_primaries_pg_control(
    config: &Config,
    conns: &[AgentConn],
) -> Result<(), HubError> {
    let (master, primaries) = future::join(
        gpupgrade_fs::restore_pg_control(config.source.master_data_dir()),
        restore_primaries_pg_control(config, conns),
    )
    .await;

    let mut errors = ErrorList::new();
    if let Err(e) = master {
        errors.push(e);
    }
    if let Err(e) = primaries {
        errors.push(e);
    }

    errors.into_result().map_err(Into::into)
}

async fn restore_primaries_pg_control(
    config: &Config,
    conns: &[AgentConn],
) -> Result<(), HubError> {
    execute_rpc(conns, |mut conn| async move {
        let datadirs: Vec<String> = config
            .source
            .primaries
            .values()
            .filter(|seg| seg.is_primary() && seg.is_on_host(&conn.hostname))
            .map(|seg| seg.data_dir.display().to_string())
            .collect();

        if datadirs.is_empty() {
            return Ok(());
        }

        conn.client
            .restore_primaries_pg_control(Request::new(idl::RestorePgControlRequest { datadirs }))
            .await?;

        Ok(())
    })
    .await?;

    Ok(())
}
