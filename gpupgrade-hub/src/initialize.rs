// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! INITIALIZE: capture the source topology, bring the agents up, verify the
//! target install everywhere, and build an empty target cluster next to the
//! source.

use crate::{
    agent_conns::AgentConn,
    config::Config,
    db, execute,
    greenplum::{self, GreenplumRunner},
    rpc::execute_rpc,
    server::HubState,
    target_config::{self, PortProber},
    HubError,
};
use futures::{future::BoxFuture, FutureExt};
use gpupgrade_cmd::{rsync::Rsync, rsync::ARCHIVE_OPTIONS, CmdSpec, Streams};
use gpupgrade_idl::{self as idl, response, Message, Substep};
use gpupgrade_step::Step;
use gpupgrade_utils::collect_errors;
use gpupgrade_wire_types::{Cluster, VersionPolicy, MASTER_CONTENT_ID};
use std::{net::TcpListener, path::PathBuf, sync::Arc};
use tokio::sync::mpsc::UnboundedSender;
use tonic::Request;

pub async fn initialize(
    state: Arc<HubState>,
    request: idl::InitializeRequest,
    sender: UnboundedSender<Message>,
) -> Result<(), HubError> {
    let exec = state.executor.as_ref();

    let source_gphome = PathBuf::from(&request.source_gphome);
    let target_gphome = PathBuf::from(&request.target_gphome);

    let source_version = greenplum::local_version(exec, &source_gphome).await?;
    let target_version = greenplum::local_version(exec, &target_gphome).await?;

    let mut st = Step::begin(state.state_dir.clone(), idl::Step::Initialize, sender).await?;

    let mut config = Config::load_or_new(&state.state_dir)?;
    config.use_link_mode = request.use_link_mode;
    config.use_hba_hostnames = request.use_hba_hostnames;
    config.agent_port = state.agent_port;

    {
        let config = &mut config;
        let state = &state;
        let source_version = &source_version;
        let target_version = &target_version;
        let source_gphome = &source_gphome;
        let target_gphome = &target_gphome;

        st.run(Substep::SavingSourceClusterConfig, move |_| async move {
            let client = db::connect_utility(request.source_port as u16, false).await?;

            config.source =
                db::load_cluster(&client, source_version.clone(), source_gphome.clone()).await?;

            config.target = Cluster {
                version: target_version.clone(),
                gphome: target_gphome.clone(),
                ..Cluster::default()
            };

            let policy = VersionPolicy::from_source(source_version);
            config.tablespaces = db::load_tablespaces(&client, &policy).await?;

            let mapping = gpupgrade_utils::tablespaces_mapping_file_path(&state.state_dir);
            gpupgrade_utils::atomically_write(
                mapping.clone(),
                gpupgrade_wire_types::render_mapping_file(&config.tablespaces).into_bytes(),
            )
            .await?;
            config.tablespaces_mapping_file_path = mapping;

            config.stamp_fingerprint();
            config.save(&state.state_dir).await
        })
        .await;
    }

    let hosts = config.source.agent_hosts();

    {
        let hosts = &hosts;
        let state = &state;

        st.run(Substep::StartAgents, move |streams| async move {
            start_agents(state.executor.as_ref(), hosts, state.agent_port, &streams).await
        })
        .await;
    }

    {
        let hosts = &hosts;
        let state = &state;
        let target_gphome = &target_gphome;
        let target_version = &target_version;

        st.run(Substep::EnsureVersionsMatch, move |_| async move {
            let conns = state.agent_conns(hosts).await?;

            ensure_versions_match(&conns, target_gphome, target_version).await
        })
        .await;
    }

    {
        let hosts = &hosts;
        let state = &state;
        let config = &mut config;

        st.run(Substep::GenerateTargetConfig, move |_| async move {
            let conns = state.agent_conns(hosts).await?;
            let prober = AgentPortProber {
                conns: &conns,
            };

            let base = target_config::assign_port_base(&config.source, &prober).await?;
            config.intermediate =
                target_config::generate(&config.source, config.upgrade_id, base);

            config.save(&state.state_dir).await
        })
        .await;
    }

    {
        let hosts = &hosts;
        let state = &state;
        let config = &mut config;

        st.run(Substep::InitTargetCluster, move |streams| async move {
            let conns = state.agent_conns(hosts).await?;

            remove_prior_target(config, &conns).await?;
            create_target_cluster(state, config, &streams).await?;

            // The catalog version is needed to find (and on revert, delete)
            // the target's tablespace subdirectories; capture it right away
            // since during revert the state of the cluster is unknown.
            let master = config.intermediate.master.as_ref().ok_or(
                HubError::MissingIntermediateSegment {
                    content: MASTER_CONTENT_ID,
                },
            )?;

            config.target_catalog_version = Some(
                greenplum::catalog_version(
                    state.executor.as_ref(),
                    &config.target.gphome,
                    &master.data_dir,
                )
                .await?,
            );

            config.save(&state.state_dir).await
        })
        .await;
    }

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

    {
        let config = &config;
        let state = &state;
        let hosts = &hosts;

        st.always_run(Substep::CheckUpgrade, move |streams| async move {
            let conns = state.agent_conns(hosts).await?;

            execute::upgrade_master(state, config, true, &streams).await?;
            execute::upgrade_primaries(state, config, &conns, true).await?;

            Ok::<_, HubError>(())
        })
        .await;
    }

    {
        let config = &config;
        let state = &state;

        st.run(Substep::BackupTargetMaster, move |streams| async move {
            let master = config.intermediate.master.as_ref().ok_or(
                HubError::MissingIntermediateSegment {
                    content: MASTER_CONTENT_ID,
                },
            )?;

            Rsync::new()
                .source_contents(&master.data_dir)
                .destination(gpupgrade_utils::original_master_backup_dir(&state.state_dir))
                .options(ARCHIVE_OPTIONS.to_vec())
                .run(state.executor.as_ref(), &streams)
                .await?;

            Ok::<_, HubError>(())
        })
        .await;
    }

    st.send(Message::response(response::Contents::Initialize(
        idl::InitializeResponse {
            has_mirrors: config.source.has_mirrors(),
            has_standby: config.source.has_standby(),
        },
    )));

    st.finish().await?;

    Ok(())
}

/// Launches the agent daemon on every segment host.
async fn start_agents(
    exec: &dyn gpupgrade_cmd::Executor,
    hosts: &[String],
    agent_port: u16,
    streams: &Streams,
) -> Result<(), HubError> {
    let tasks = hosts.iter().map(|host| async move {
        let spec = CmdSpec::new("ssh")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(host)
            .arg(format!("gpupgrade_agent --daemonize --port {}", agent_port));

        exec.run_streamed(spec, streams).await
    });

    collect_errors(futures::future::join_all(tasks).await)?;

    Ok(())
}

/// Both the upgrade tooling and the target database binaries must report
/// identical versions on every host.
async fn ensure_versions_match(
    conns: &[AgentConn],
    target_gphome: &std::path::Path,
    target_version: &semver::Version,
) -> Result<(), HubError> {
    let replies = futures::future::join_all(conns.iter().map(|conn| {
        let mut client = conn.client.clone();
        let gphome = target_gphome.display().to_string();

        async move {
            let reply = client
                .check_versions(Request::new(idl::CheckVersionsRequest { gphome }))
                .await?
                .into_inner();

            Ok::<_, HubError>((conn.hostname.clone(), reply))
        }
    }))
    .await;

    let mut mismatches = vec![];

    for (hostname, reply) in collect_errors(replies)? {
        if reply.gpupgrade_version != env!("CARGO_PKG_VERSION") {
            mismatches.push(format!(
                "{}: gpupgrade version {} does not match hub version {}",
                hostname,
                reply.gpupgrade_version,
                env!("CARGO_PKG_VERSION"),
            ));
        }

        if reply.gphome_version != target_version.to_string() {
            mismatches.push(format!(
                "{}: target install version {} does not match {}",
                hostname, reply.gphome_version, target_version,
            ));
        }
    }

    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(HubError::VersionMismatch(mismatches.join("\n")))
    }
}

struct AgentPortProber<'a> {
    conns: &'a [AgentConn],
}

impl PortProber for AgentPortProber<'_> {
    fn check<'a>(
        &'a self,
        hostname: &'a str,
        base: u16,
        count: u16,
    ) -> BoxFuture<'a, Result<bool, HubError>> {
        async move {
            // The coordinator host usually has no agent; probe it locally.
            let conn = self.conns.iter().find(|c| c.hostname == hostname);

            match conn {
                Some(conn) => {
                    let mut client = conn.client.clone();

                    let reply = client
                        .check_free_ports(Request::new(idl::CheckFreePortsRequest {
                            base: base as i32,
                            count: count as i32,
                        }))
                        .await?
                        .into_inner();

                    Ok(reply.free)
                }
                None => Ok(local_ports_free(base, count)),
            }
        }
        .boxed()
    }
}

fn local_ports_free(base: u16, count: u16) -> bool {
    (base..base + count).all(|port| TcpListener::bind(("0.0.0.0", port)).is_ok())
}

/// Deletes any prior target left by an earlier initialize attempt, so the
/// cluster-init script starts from a clean slate.
async fn remove_prior_target(config: &Config, conns: &[AgentConn]) -> Result<(), HubError> {
    if let Some(master) = &config.intermediate.master {
        gpupgrade_fs::delete_data_directory(&master.data_dir).await.or_else(ignore_missing)?;
    }

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

    Ok(())
}

fn ignore_missing(e: gpupgrade_fs::FsError) -> Result<(), gpupgrade_fs::FsError> {
    match e {
        gpupgrade_fs::FsError::MissingSentinel { .. } => Ok(()),
        other => Err(other),
    }
}

async fn create_target_cluster(
    state: &HubState,
    config: &Config,
    streams: &Streams,
) -> Result<(), HubError> {
    let rendered =
        target_config::render_gpinitsystem_config(&config.intermediate, config.use_link_mode);

    let config_file = state.state_dir.join("gpinitsystem_config");
    gpupgrade_utils::atomically_write(config_file.clone(), rendered.into_bytes()).await?;

    let target = config
        .intermediate_cluster()?
        .ok_or(HubError::MissingIntermediateSegment {
            content: MASTER_CONTENT_ID,
        })?;

    GreenplumRunner::new(state.executor.as_ref(), &target)
        .gpinitsystem(&config_file, config.use_hba_hostnames, streams)
        .await?;

    Ok(())
}
