// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Wrappers around the database's own control scripts. Every invocation
//! sources the install's environment file and pins `MASTER_DATA_DIRECTORY`
//! and `PGPORT` to the cluster being driven; `PYTHONPATH` is inherited from
//! the hub's environment for the Python-based scripts.

use crate::HubError;
use gpupgrade_cmd::{CmdError, CmdSpec, Executor, OutputExt, Streams};
use gpupgrade_wire_types::Cluster;
use std::path::Path;

pub struct GreenplumRunner<'a> {
    exec: &'a dyn Executor,
    cluster: &'a Cluster,
}

impl<'a> GreenplumRunner<'a> {
    pub fn new(exec: &'a dyn Executor, cluster: &'a Cluster) -> Self {
        Self { exec, cluster }
    }

    fn script(&self, command: &str) -> CmdSpec {
        let gphome = self.cluster.gphome.display();

        CmdSpec::bash(format!(
            "source {gphome}/greenplum_path.sh && MASTER_DATA_DIRECTORY={mdd} PGPORT={port} {gphome}/bin/{command}",
            gphome = gphome,
            mdd = self.cluster.master_data_dir().display(),
            port = self.cluster.master_port(),
            command = command,
        ))
    }

    pub async fn start(&self, streams: &Streams) -> Result<(), CmdError> {
        self.exec.run_streamed(self.script("gpstart -a"), streams).await
    }

    pub async fn stop(&self, streams: &Streams) -> Result<(), CmdError> {
        self.exec.run_streamed(self.script("gpstop -a"), streams).await
    }

    pub async fn start_master_only(&self, streams: &Streams) -> Result<(), CmdError> {
        self.exec.run_streamed(self.script("gpstart -a -m"), streams).await
    }

    pub async fn stop_master_only(&self, streams: &Streams) -> Result<(), CmdError> {
        self.exec.run_streamed(self.script("gpstop -a -m"), streams).await
    }

    /// Probes whether the coordinator's postmaster is up without mutating
    /// anything.
    pub async fn is_master_running(&self) -> Result<bool, CmdError> {
        let spec = CmdSpec::new(self.cluster.gphome.join("bin").join("pg_ctl").display().to_string())
            .arg("status")
            .arg("-D")
            .arg(self.cluster.master_data_dir().display().to_string());

        match self.exec.run_output(spec).await {
            Ok(_) => Ok(true),
            Err(CmdError::Output(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn recoverseg(&self, use_hba_hostnames: bool, streams: &Streams) -> Result<(), CmdError> {
        let hba = if use_hba_hostnames { " --hba-hostnames" } else { "" };

        self.exec
            .run_streamed(self.script(&format!("gprecoverseg -a{}", hba)), streams)
            .await
    }

    pub async fn gpinitsystem(
        &self,
        config_file: &Path,
        use_hba_hostnames: bool,
        streams: &Streams,
    ) -> Result<(), CmdError> {
        let hba = if use_hba_hostnames { " --hba-hostnames" } else { "" };

        let result = self
            .exec
            .run_streamed(
                self.script(&format!("gpinitsystem -a -I {}{}", config_file.display(), hba)),
                streams,
            )
            .await;

        // gpinitsystem exits 1 on warnings; only 2 and above are fatal.
        match result {
            Err(CmdError::Status(status)) if status.code() == Some(1) => Ok(()),
            other => other,
        }
    }

    pub async fn gpinitstandby(
        &self,
        standby_host: &str,
        standby_port: u16,
        standby_data_dir: &Path,
        use_hba_hostnames: bool,
        streams: &Streams,
    ) -> Result<(), CmdError> {
        let hba = if use_hba_hostnames { " --hba-hostnames" } else { "" };

        self.exec
            .run_streamed(
                self.script(&format!(
                    "gpinitstandby -a -s {} -P {} -S {}{}",
                    standby_host,
                    standby_port,
                    standby_data_dir.display(),
                    hba,
                )),
                streams,
            )
            .await
    }

    pub async fn gpaddmirrors(
        &self,
        config_file: &Path,
        use_hba_hostnames: bool,
        streams: &Streams,
    ) -> Result<(), CmdError> {
        let hba = if use_hba_hostnames { " --hba-hostnames" } else { "" };

        self.exec
            .run_streamed(
                self.script(&format!("gpaddmirrors -a -i {}{}", config_file.display(), hba)),
                streams,
            )
            .await
    }
}

/// The version the given install reports, from `postgres --gp-version`.
pub async fn local_version(exec: &dyn Executor, gphome: &Path) -> Result<semver::Version, HubError> {
    let spec = CmdSpec::new(gphome.join("bin").join("postgres").display().to_string())
        .arg("--gp-version");

    let output = exec.run_output(spec).await?;
    let raw = output.stdout_string_lossy();

    gpupgrade_wire_types::parse_version_output(&raw).ok_or(HubError::BadVersion(raw))
}

/// The catalog version number stamped into a freshly initialized data
/// directory, from `pg_controldata`.
pub async fn catalog_version(
    exec: &dyn Executor,
    gphome: &Path,
    data_dir: &Path,
) -> Result<String, HubError> {
    let spec = CmdSpec::new(gphome.join("bin").join("pg_controldata").display().to_string())
        .arg(data_dir.display().to_string());

    let output = exec.run_output(spec).await?;
    let raw = output.stdout_string_lossy();

    raw.lines()
        .find_map(|line| line.strip_prefix("Catalog version number:"))
        .map(|x| x.trim().to_string())
        .ok_or(HubError::BadVersion(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{future::BoxFuture, FutureExt};
    use gpupgrade_wire_types::{Role, SegConfig};
    use std::{
        os::unix::process::ExitStatusExt,
        process::{ExitStatus, Output},
        sync::Mutex,
    };

    struct FakeExecutor {
        specs: Mutex<Vec<CmdSpec>>,
        stdout: &'static str,
    }

    impl FakeExecutor {
        fn new(stdout: &'static str) -> Self {
            Self {
                specs: Mutex::new(vec![]),
                stdout,
            }
        }
    }

    impl Executor for FakeExecutor {
        fn run_streamed<'a>(
            &'a self,
            spec: CmdSpec,
            _streams: &'a Streams,
        ) -> BoxFuture<'a, Result<(), CmdError>> {
            self.specs.lock().unwrap().push(spec);

            async { Ok(()) }.boxed()
        }

        fn run_output<'a>(&'a self, spec: CmdSpec) -> BoxFuture<'a, Result<Output, CmdError>> {
            self.specs.lock().unwrap().push(spec);

            async move {
                Ok(Output {
                    status: ExitStatus::from_raw(0),
                    stdout: self.stdout.as_bytes().to_vec(),
                    stderr: vec![],
                })
            }
            .boxed()
        }
    }

    fn cluster() -> Cluster {
        Cluster::from_segments(
            semver::Version::new(6, 21, 0),
            "/usr/local/greenplum-db-6".into(),
            vec![SegConfig {
                dbid: 1,
                content_id: -1,
                role: Role::Primary,
                hostname: "mdw".into(),
                port: 6432,
                data_dir: "/data/master/gpseg-1".into(),
            }],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_control_scripts_pin_the_cluster_environment() {
        let exec = FakeExecutor::new("");
        let cluster = cluster();
        let runner = GreenplumRunner::new(&exec, &cluster);
        let (streams, _rx) = Streams::channel();

        runner.start(&streams).await.unwrap();

        let specs = exec.specs.lock().unwrap();
        let script = &specs[0].args[1];

        assert_eq!(specs[0].program, "bash");
        assert!(script.contains("source /usr/local/greenplum-db-6/greenplum_path.sh"));
        assert!(script.contains("MASTER_DATA_DIRECTORY=/data/master/gpseg-1"));
        assert!(script.contains("PGPORT=6432"));
        assert!(script.ends_with("gpstart -a"));
    }

    #[tokio::test]
    async fn test_recoverseg_honors_hba_hostnames() {
        let exec = FakeExecutor::new("");
        let cluster = cluster();
        let runner = GreenplumRunner::new(&exec, &cluster);
        let (streams, _rx) = Streams::channel();

        runner.recoverseg(true, &streams).await.unwrap();

        let specs = exec.specs.lock().unwrap();
        assert!(specs[0].args[1].ends_with("gprecoverseg -a --hba-hostnames"));
    }

    #[tokio::test]
    async fn test_local_version_parses_gp_version_output() {
        let exec = FakeExecutor::new("postgres (Greenplum Database) 6.21.0 build commit:f7c6");

        let version = local_version(&exec, Path::new("/usr/local/greenplum-db-6"))
            .await
            .unwrap();

        assert_eq!(version, semver::Version::new(6, 21, 0));
    }

    #[tokio::test]
    async fn test_catalog_version_parses_pg_controldata() {
        let exec = FakeExecutor::new(
            "pg_control version number:            9420600\nCatalog version number:               301908232\n",
        );

        let version = catalog_version(
            &exec,
            Path::new("/usr/local/greenplum-db-6"),
            Path::new("/data/master/gpseg_ABC-1"),
        )
        .await
        .unwrap();

        assert_eq!(version, "301908232");
    }
}
