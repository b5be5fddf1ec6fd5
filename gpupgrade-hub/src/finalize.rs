// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! FINALIZE: swap the directories, point the catalog at them, start the new
//! cluster, and bring the replicas back. Once the catalog update commits,
//! revert is no longer legal.

use crate::{
    config::Config,
    db,
    greenplum::GreenplumRunner,
    logs, rename_data_directories, server::HubState, standby_mirrors, update_catalog,
    update_conf_files, upgrade_mirrors, HubError,
};
use gpupgrade_idl::{self as idl, response, Message, Substep};
use gpupgrade_step::Step;
use gpupgrade_wire_types::{archive_data_dir, MASTER_CONTENT_ID};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub async fn finalize(
    state: Arc<HubState>,
    sender: UnboundedSender<Message>,
) -> Result<(), HubError> {
    let mut config = Config::load(&state.state_dir)?;
    config.verify_fingerprint()?;

    let mut st = Step::begin(state.state_dir.clone(), idl::Step::Finalize, sender).await?;

    let hosts = config.source.agent_hosts();

    {
        let config = &config;
        let state = &state;

        st.run(Substep::ShutdownTargetCluster, move |streams| async move {
            let target = config
                .intermediate_cluster()?
                .ok_or(HubError::MissingIntermediateSegment {
                    content: MASTER_CONTENT_ID,
                })?;

            GreenplumRunner::new(state.executor.as_ref(), &target)
                .stop(&streams)
                .await?;

            Ok::<_, HubError>(())
        })
        .await;
    }

    // Upgrade the mirrors in place before the catalog and data directory
    // updates, while the source mirror directories still exist as a backup.
    if config.source.has_mirrors() && config.use_link_mode {
        let config = &config;
        let state = &state;
        let hosts = &hosts;

        st.run(Substep::UpgradeMirrors, move |_| async move {
            let conns = state.agent_conns(hosts).await?;

            upgrade_mirrors::upgrade_mirrors_in_place(config, &conns).await
        })
        .await;
    }

    {
        let config = &mut config;
        let state = &state;

        st.run(
            Substep::UpdateTargetCatalogAndClusterConfig,
            move |streams| async move {
                let target = config
                    .intermediate_cluster()?
                    .ok_or(HubError::MissingIntermediateSegment {
                        content: MASTER_CONTENT_ID,
                    })?;

                let runner = GreenplumRunner::new(state.executor.as_ref(), &target);

                runner.start_master_only(&streams).await?;

                let result = async {
                    let mut client = db::connect_utility(target.master_port(), true).await?;

                    update_catalog::update_gp_segment_configuration(&mut client, config).await
                }
                .await;

                runner.stop_master_only(&streams).await?;

                result?;

                // The catalog now describes the final topology; make the
                // in-memory target cluster match and persist it.
                let rebuilt = update_catalog::rebuild_target_cluster(config)?;
                config.target = rebuilt;
                config.save(&state.state_dir).await
            },
        )
        .await;
    }

    {
        let config = &config;
        let state = &state;
        let hosts = &hosts;

        st.run(Substep::UpdateDataDirectories, move |_| async move {
            let conns = state.agent_conns(hosts).await?;

            rename_data_directories::update_data_directories(config, &conns).await
        })
        .await;
    }

    {
        let config = &config;

        st.run(Substep::UpdateTargetConfFiles, move |_| async move {
            update_conf_files::update_conf_files(config).await
        })
        .await;
    }

    {
        let config = &config;
        let state = &state;

        st.run(Substep::StartTargetCluster, move |streams| async move {
            GreenplumRunner::new(state.executor.as_ref(), &config.target)
                .start(&streams)
                .await?;

            Ok::<_, HubError>(())
        })
        .await;
    }

    if config.source.has_standby() {
        let config = &config;
        let state = &state;

        st.run(Substep::UpgradeStandby, move |streams| async move {
            standby_mirrors::upgrade_standby(state.executor.as_ref(), config, &streams).await
        })
        .await;
    }

    if config.source.has_mirrors() && !config.use_link_mode {
        let config = &config;
        let state = &state;

        st.run(Substep::UpgradeMirrors, move |streams| async move {
            standby_mirrors::upgrade_mirrors_with_gpaddmirrors(
                state.executor.as_ref(),
                config,
                &state.state_dir,
                &streams,
            )
            .await
        })
        .await;
    }

    // The link-mode mirrors were marked down during execute to prevent
    // drift; recover them now that the standby exists.
    if config.use_link_mode {
        let config = &config;
        let state = &state;

        st.run(Substep::RecoversegTargetCluster, move |streams| async move {
            GreenplumRunner::new(state.executor.as_ref(), &config.target)
                .recoverseg(config.use_hba_hostnames, &streams)
                .await?;

            Ok::<_, HubError>(())
        })
        .await;
    }

    let archive_dir =
        logs::resolve_archive_dir(&state.state_dir, idl::Step::Finalize, config.upgrade_id).await?;

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

    st.send(Message::response(response::Contents::Finalize(
        idl::FinalizeResponse {
            target: Some(idl::ClusterSummary {
                port: config.target.master_port() as i32,
                master_data_directory: config.target.master_data_dir().display().to_string(),
                version: config.target.version.to_string(),
            }),
            log_archive_directory: archive_dir.display().to_string(),
            archived_source_master_data_directory: archive_data_dir(
                config.source.master_data_dir(),
            )
            .display()
            .to_string(),
            upgrade_id: config.upgrade_id.to_string(),
        },
    )));

    st.finish().await?;

    Ok(())
}
