// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! REVERT: restore the source cluster, whatever partial forward progress
//! exists. Legal only before finalize's catalog update completes.
//!
//! The choice between the short revert (delete the target, restart the
//! source) and the full one (rsync the source back from its replicas)
//! hinges on whether the primaries were ever upgraded: in link mode a
//! started target has mutated inodes it shares with the source, so only the
//! persisted journal of the execute step can answer safely.

use crate::{
    config::Config,
    greenplum::GreenplumRunner,
    logs, restore_source_cluster, rpc::execute_rpc, server::HubState, HubError,
};
use gpupgrade_cmd::CmdError;
use gpupgrade_idl::{self as idl, response, Message, Substep, TablespaceDeletion};
use gpupgrade_step::{has_run, Step};
use gpupgrade_wire_types::{user_defined, VersionPolicy};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tonic::Request;

pub async fn revert(
    state: Arc<HubState>,
    sender: UnboundedSender<Message>,
) -> Result<(), HubError> {
    let config = Config::load(&state.state_dir)?;
    config.verify_fingerprint()?;

    if !config.source.has_all_mirrors_and_standby() {
        return Err(HubError::MissingMirrorsAndStandby);
    }

    let mut st = Step::begin(state.state_dir.clone(), idl::Step::Revert, sender).await?;

    let hosts = config.source.agent_hosts();
    let policy = VersionPolicy::from_source(&config.source.version);

    let target = config.intermediate_cluster()?;

    let target_running = match &target {
        Some(target) => {
            GreenplumRunner::new(state.executor.as_ref(), target)
                .is_master_running()
                .await?
        }
        None => false,
    };

    {
        let target = &target;
        let state = &state;

        st.run_conditionally(
            Substep::ShutdownTargetCluster,
            target_running,
            move |streams| async move {
                let target = target.as_ref().ok_or(HubError::MissingIntermediateSegment {
                    content: gpupgrade_wire_types::MASTER_CONTENT_ID,
                })?;

                GreenplumRunner::new(state.executor.as_ref(), target)
                    .stop(&streams)
                    .await?;

                Ok::<_, HubError>(())
            },
        )
        .await;
    }

    let has_target_layout =
        !config.intermediate.primaries.is_empty() && config.intermediate.master.is_some();

    {
        let config = &config;
        let state = &state;
        let hosts = &hosts;

        st.run_conditionally(
            Substep::DeleteTargetClusterDatadirs,
            has_target_layout,
            move |_| async move {
                let conns = state.agent_conns(hosts).await?;

                delete_target_data_dirs(config, &conns).await
            },
        )
        .await;
    }

    {
        let config = &config;
        let state = &state;
        let hosts = &hosts;

        st.run_conditionally(
            Substep::DeleteTablespaces,
            has_target_layout && !config.tablespaces.is_empty(),
            move |_| async move {
                let conns = state.agent_conns(hosts).await?;

                delete_target_tablespaces(config, &conns).await
            },
        )
        .await;
    }

    {
        let config = &config;
        let state = &state;
        let hosts = &hosts;

        st.run_conditionally(
            Substep::RestorePgcontrol,
            config.use_link_mode,
            move |_| async move {
                let conns = state.agent_conns(hosts).await?;

                restore_source_cluster::restore_master_and_primaries_pg_control(config, &conns)
                    .await
            },
        )
        .await;
    }

    // The source primaries were structurally damaged the moment they were
    // upgraded in link mode; only the execute journal knows whether that
    // point was ever reached.
    let primaries_upgraded = has_run(&state.state_dir, idl::Step::Execute, Substep::UpgradePrimaries)
        || has_run(&state.state_dir, idl::Step::Execute, Substep::StartTargetCluster);

    {
        let config = &config;
        let state = &state;
        let hosts = &hosts;

        st.run_conditionally(
            Substep::RestoreSourceCluster,
            config.use_link_mode && primaries_upgraded,
            move |streams| async move {
                let conns = state.agent_conns(hosts).await?;

                restore_source_cluster::rsync_master_and_primaries(
                    state.executor.as_ref(),
                    config,
                    &conns,
                    &streams,
                )
                .await?;

                restore_source_cluster::rsync_master_and_primaries_tablespaces(
                    state.executor.as_ref(),
                    config,
                    &conns,
                    &streams,
                )
                .await
            },
        )
        .await;
    }

    let mut tolerated_startup_failure = false;

    {
        let config = &config;
        let state = &state;
        let policy = &policy;
        let tolerated = &mut tolerated_startup_failure;

        st.run(Substep::StartSourceCluster, move |streams| async move {
            let result = GreenplumRunner::new(state.executor.as_ref(), &config.source)
                .start(&streams)
                .await;

            match result {
                // A 5X source whose primaries were upgraded in place starts
                // with its mirrors failing until recoverseg replays them;
                // gpstart reports that as exit code 1.
                Err(CmdError::Status(status))
                    if status.code() == Some(1) && policy.tolerates_mirror_startup_failure =>
                {
                    *tolerated = true;

                    Ok(())
                }
                other => other.map_err(HubError::from),
            }
        })
        .await;
    }

    {
        let config = &config;
        let state = &state;

        st.run_conditionally(
            Substep::RecoversegSourceCluster,
            tolerated_startup_failure,
            move |streams| async move {
                GreenplumRunner::new(state.executor.as_ref(), &config.source)
                    .recoverseg(config.use_hba_hostnames, &streams)
                    .await?;

                Ok::<_, HubError>(())
            },
        )
        .await;
    }

    let archive_dir =
        logs::resolve_archive_dir(&state.state_dir, idl::Step::Revert, config.upgrade_id).await?;

    {
        let archive_dir = &archive_dir;
        let state = &state;
        let hosts = &hosts;

        st.run(Substep::ArchiveLogDirectories, move |_| async move {
            let conns = state.agent_conns(hosts).await?;

            logs::archive_log_directories(archive_dir, &conns).await
        })
        .await;
    }

    {
        let state = &state;
        let hosts = &hosts;

        st.run(Substep::DeleteSegmentStatedirs, move |_| async move {
            let conns = state.agent_conns(hosts).await?;

            logs::delete_segment_state_directories(&conns).await
        })
        .await;
    }

    st.send(Message::response(response::Contents::Revert(
        idl::RevertResponse {
            source: Some(idl::ClusterSummary {
                port: config.source.master_port() as i32,
                master_data_directory: config.source.master_data_dir().display().to_string(),
                version: config.source.version.to_string(),
            }),
            log_archive_directory: archive_dir.display().to_string(),
        },
    )));

    st.finish().await?;

    Ok(())
}

async fn delete_target_data_dirs(
    config: &Config,
    conns: &[crate::agent_conns::AgentConn],
) -> Result<(), HubError> {
    execute_rpc(conns, |mut conn| async move {
        let datadirs: Vec<String> = config
            .intermediate
            .primaries
            .iter()
            .chain(config.intermediate.mirrors.iter())
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

    if let Some(master) = &config.intermediate.master {
        gpupgrade_fs::delete_data_directory(&master.data_dir).await?;
    }

    Ok(())
}

/// Deletes the tablespace trees the target cluster created. They live in a
/// catalog-versioned subdirectory of each per-dbid location, so the source's
/// own files are never in scope.
async fn delete_target_tablespaces(
    config: &Config,
    conns: &[crate::agent_conns::AgentConn],
) -> Result<(), HubError> {
    let catalog_suffix = match &config.target_catalog_version {
        Some(version) => format!("GPDB_{}_{}", config.target.version.major, version),
        None => return Ok(()),
    };

    // The coordinator's tablespaces are local to the hub host.
    let master_dbid = config.source.master().dbid;
    if let Some(spaces) = config.tablespaces.get(&master_dbid) {
        for (_, info) in user_defined(spaces) {
            let doomed = info
                .location
                .join(master_dbid.to_string())
                .join(&catalog_suffix);

            gpupgrade_fs::remove_dir_all_if_exists(&doomed).await?;
        }
    }

    let catalog_suffix = &catalog_suffix;

    execute_rpc(conns, |mut conn| async move {
        let mut dirs = vec![];

        for seg in config.source.primaries.values() {
            if !seg.is_primary() || !seg.is_on_host(&conn.hostname) {
                continue;
            }

            if let Some(spaces) = config.tablespaces.get(&seg.dbid) {
                for (_, info) in user_defined(spaces) {
                    dirs.push(TablespaceDeletion {
                        location: info.location.display().to_string(),
                        dbid: seg.dbid,
                        catalog_suffix: catalog_suffix.clone(),
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
