// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! EXECUTE: the actual data directory transformation. After UPGRADE_PRIMARIES
//! completes in link mode, the source shares inodes with the target; the
//! journal's `complete` marker is the only authority for resumption from
//! that point on.

use crate::{
    agent_conns::AgentConn,
    config::Config,
    db,
    greenplum::GreenplumRunner,
    rpc::execute_rpc,
    server::HubState,
    HubError,
};
use gpupgrade_cmd::{rsync::Rsync, rsync::ARCHIVE_OPTIONS, Streams};
use gpupgrade_idl::{self as idl, response, Message, Substep};
use gpupgrade_step::Step;
use gpupgrade_upgrade::{PgUpgradeOptions, Segment, SegmentMode, SegmentPair};
use gpupgrade_utils::upgraded_master_backup_dir;
use gpupgrade_wire_types::{user_defined, VersionPolicy, MASTER_CONTENT_ID};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tonic::Request;

pub async fn execute(
    state: Arc<HubState>,
    sender: UnboundedSender<Message>,
) -> Result<(), HubError> {
    let config = Config::load(&state.state_dir)?;
    config.verify_fingerprint()?;

    let mut st = Step::begin(state.state_dir.clone(), idl::Step::Execute, sender).await?;

    let hosts = config.source.agent_hosts();

    let target = config
        .intermediate_cluster()?
        .ok_or(HubError::MissingIntermediateSegment {
            content: MASTER_CONTENT_ID,
        })?;

    {
        let config = &config;
        let state = &state;

        st.run(Substep::ShutdownSourceCluster, move |streams| async move {
            GreenplumRunner::new(state.executor.as_ref(), &config.source)
                .stop(&streams)
                .await?;

            Ok::<_, HubError>(())
        })
        .await;
    }

    {
        let config = &config;
        let state = &state;

        st.run(Substep::UpgradeMaster, move |streams| async move {
            upgrade_master(state, config, false, &streams).await
        })
        .await;
    }

    {
        let config = &config;
        let state = &state;

        st.run(Substep::CopyMaster, move |streams| async move {
            copy_master(state, config, &streams).await
        })
        .await;
    }

    {
        let config = &config;
        let state = &state;
        let hosts = &hosts;

        st.run(Substep::UpgradePrimaries, move |_| async move {
            let conns = state.agent_conns(hosts).await?;

            upgrade_primaries(state, config, &conns, false).await
        })
        .await;
    }

    // In link mode the mirrors must not run until they are upgraded in
    // place during finalize; mark them down (and both halves of each pair
    // unsynchronized) before the cluster comes up.
    if config.use_link_mode {
        let config = &config;
        let state = &state;

        st.run(Substep::MarkMirrorsDown, move |streams| async move {
            mark_mirrors_down(state, config, &streams).await
        })
        .await;
    }

    {
        let target = &target;
        let state = &state;

        st.run(Substep::StartTargetCluster, move |streams| async move {
            GreenplumRunner::new(state.executor.as_ref(), target)
                .start(&streams)
                .await?;

            Ok::<_, HubError>(())
        })
        .await;
    }

    st.send(Message::response(response::Contents::Execute(
        idl::ExecuteResponse {
            target: Some(idl::ClusterSummary {
                port: target.master_port() as i32,
                master_data_directory: target.master_data_dir().display().to_string(),
                version: target.version.to_string(),
            }),
        },
    )));

    st.finish().await?;

    Ok(())
}

/// Runs `pg_upgrade` against the coordinator pair. For the real run (not
/// `--check`) the staged master is first restored from the clean backup so
/// a crashed attempt can be retried from scratch.
pub async fn upgrade_master(
    state: &HubState,
    config: &Config,
    check_only: bool,
    streams: &Streams,
) -> Result<(), HubError> {
    let source_master = config.source.master();
    let staged_master = config
        .intermediate
        .master
        .as_ref()
        .ok_or(HubError::MissingIntermediateSegment {
            content: MASTER_CONTENT_ID,
        })?;

    if !check_only {
        Rsync::new()
            .source_contents(gpupgrade_utils::original_master_backup_dir(&state.state_dir))
            .destination(&staged_master.data_dir)
            .options(vec!["--archive", "--delete"])
            .run(state.executor.as_ref(), streams)
            .await?;
    }

    let pair = SegmentPair {
        source: Segment {
            bindir: config.source.gphome.join("bin"),
            data_dir: source_master.data_dir.clone(),
            dbid: source_master.dbid,
            port: source_master.port,
        },
        target: Segment {
            bindir: config.target.gphome.join("bin"),
            data_dir: staged_master.data_dir.clone(),
            dbid: staged_master.dbid,
            port: staged_master.port,
        },
    };

    let policy = VersionPolicy::from_source(&config.source.version);

    let mut options = PgUpgradeOptions::new(SegmentMode::Dispatcher, policy.source_major);
    options.check_only = check_only;
    options.link_mode = config.use_link_mode;
    options.work_dir = Some(gpupgrade_upgrade::work_dir(
        &state.state_dir,
        source_master.dbid,
    ));

    if !config.tablespaces.is_empty() {
        options.tablespace_file = Some(config.tablespaces_mapping_file_path.clone());
    }

    gpupgrade_upgrade::run(
        state.executor.as_ref(),
        &pair,
        MASTER_CONTENT_ID,
        &options,
        streams,
    )
    .await?;

    Ok(())
}

/// Stages the upgraded coordinator on every segment host: the data
/// directory to each host's `upgraded-master.bak` and the coordinator's
/// user tablespace trees under each host's state dir, where the per-primary
/// pipeline picks them up locally.
async fn copy_master(
    state: &HubState,
    config: &Config,
    streams: &Streams,
) -> Result<(), HubError> {
    let staged_master = config
        .intermediate
        .master
        .as_ref()
        .ok_or(HubError::MissingIntermediateSegment {
            content: MASTER_CONTENT_ID,
        })?;

    let master_dbid = config.source.master().dbid;
    let policy = VersionPolicy::from_source(&config.source.version);

    let tasks = config.source.agent_hosts().into_iter().map(|host| {
        let staged_master = &staged_master.data_dir;
        let state_dir = &state.state_dir;
        let config = &config;
        let policy = &policy;

        async move {
            Rsync::new()
                .source_contents(staged_master)
                .destination_host(&host)
                .destination(upgraded_master_backup_dir(state_dir))
                .options(ARCHIVE_OPTIONS.to_vec())
                .run(state.executor.as_ref(), streams)
                .await?;

            if let Some(spaces) = config.tablespaces.get(&master_dbid) {
                for (oid, info) in user_defined(spaces) {
                    Rsync::new()
                        .source_contents(policy.tablespace_path(info, master_dbid))
                        .destination_host(&host)
                        .destination(
                            gpupgrade_utils::tablespaces_dir(state_dir).join(oid.to_string()),
                        )
                        .options(vec!["--archive", "--delete"])
                        .run(state.executor.as_ref(), streams)
                        .await?;
                }
            }

            Ok::<_, HubError>(())
        }
    });

    gpupgrade_utils::collect_errors(futures::future::join_all(tasks).await)?;

    Ok(())
}

/// The source/target directory pairs for the primaries on one host.
pub fn data_dir_pairs(config: &Config, hostname: &str) -> Vec<idl::DataDirPair> {
    config
        .intermediate
        .primaries
        .iter()
        .filter(|seg| seg.is_on_host(hostname))
        .filter_map(|staged| {
            let source = config.source.primaries.get(&staged.content_id)?;

            Some(idl::DataDirPair {
                source_data_dir: source.data_dir.display().to_string(),
                target_data_dir: staged.data_dir.display().to_string(),
                source_port: source.port as i32,
                target_port: staged.port as i32,
                content: staged.content_id,
                dbid: source.dbid,
                tablespaces: config
                    .tablespaces
                    .get(&source.dbid)
                    .map(idl::tablespace_map)
                    .unwrap_or_default(),
            })
        })
        .collect()
}

/// Fans the per-primary pipeline out to the agents, one request per host.
pub async fn upgrade_primaries(
    state: &HubState,
    config: &Config,
    conns: &[AgentConn],
    check_only: bool,
) -> Result<(), HubError> {
    execute_rpc(conns, |mut conn| {
        let master_backup_dir = upgraded_master_backup_dir(&state.state_dir);

        async move {
            let pairs = data_dir_pairs(config, &conn.hostname);

            if pairs.is_empty() {
                return Ok(());
            }

            conn.client
                .upgrade_primaries(Request::new(idl::UpgradePrimariesRequest {
                    source_bindir: config.source.gphome.join("bin").display().to_string(),
                    target_bindir: config.target.gphome.join("bin").display().to_string(),
                    source_version: config.source.version.to_string(),
                    target_version: config.target.version.to_string(),
                    check_only,
                    use_link_mode: config.use_link_mode,
                    tablespaces_mapping_file_path: config
                        .tablespaces_mapping_file_path
                        .display()
                        .to_string(),
                    master_backup_dir: master_backup_dir.display().to_string(),
                    data_dir_pairs: pairs,
                }))
                .await?;

            Ok(())
        }
    })
    .await?;

    Ok(())
}

/// Marks every mirror down and both halves of each pair unsynchronized, via
/// the coordinator alone in utility mode.
async fn mark_mirrors_down(
    state: &HubState,
    config: &Config,
    streams: &Streams,
) -> Result<(), HubError> {
    let target = config
        .intermediate_cluster()?
        .ok_or(HubError::MissingIntermediateSegment {
            content: MASTER_CONTENT_ID,
        })?;

    let runner = GreenplumRunner::new(state.executor.as_ref(), &target);

    runner.start_master_only(streams).await?;

    let result = async {
        let client = db::connect_utility(target.master_port(), true).await?;

        client
            .execute(
                "UPDATE gp_segment_configuration SET status = 'd', mode = 'n' \
                 WHERE preferred_role = 'm' AND content <> -1",
                &[],
            )
            .await?;

        client
            .execute(
                "UPDATE gp_segment_configuration SET mode = 'n' \
                 WHERE preferred_role = 'p' AND content <> -1",
                &[],
            )
            .await?;

        Ok::<_, HubError>(())
    }
    .await;

    runner.stop_master_only(streams).await?;

    result
}
