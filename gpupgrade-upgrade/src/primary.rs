// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! The per-primary upgrade pipeline.
//!
//! In copy mode the primary is upgraded directly from its source directory.
//! In link mode a clean template is produced first and `pg_upgrade` runs
//! against it, so the primary's tablespace files are only rewritten once;
//! the template is kept for the later in-place mirror upgrade.

use crate::{
    MASTER_BACKUP_EXCLUDES, PgUpgradeOptions, Segment, SegmentMode, SegmentPair, UpgradeError,
};
use gpupgrade_cmd::{rsync::Rsync, Executor, Streams};
use gpupgrade_fs::recreate_symlink;
use gpupgrade_idl as idl;
use gpupgrade_wire_types::{user_defined, SegmentTablespaces, VersionPolicy};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::fs;

pub async fn upgrade_primary(
    exec: &dyn Executor,
    state_dir: &Path,
    request: &idl::UpgradePrimariesRequest,
    pair: &idl::DataDirPair,
    streams: &Streams,
) -> Result<(), UpgradeError> {
    let tablespaces = idl::wire_tablespaces(&pair.tablespaces);
    let policy = VersionPolicy::from_source(&parse_version(&request.source_version)?);

    if request.check_only {
        return pg_upgrade(exec, state_dir, request, pair, &policy, None, streams).await;
    }

    restore_master_backup(exec, request, pair, streams).await?;
    restore_master_tablespaces(exec, request, pair, &tablespaces, &policy, streams).await?;

    if !request.use_link_mode {
        return pg_upgrade(exec, state_dir, request, pair, &policy, None, streams).await;
    }

    create_template(exec, state_dir, request, pair, &policy, streams).await?;
    backup_template(exec, state_dir, pair, streams).await?;
    backup_tablespaces(exec, state_dir, pair, &tablespaces, &policy, streams).await?;
    link_tablespaces_to_template(state_dir, pair, &tablespaces, &policy).await?;

    let template = gpupgrade_utils::template_working_dir(state_dir, pair.content);
    pg_upgrade(exec, state_dir, request, pair, &policy, Some(template), streams).await?;

    link_tablespaces_to_primary(state_dir, pair, &tablespaces, &policy).await?;

    // Keep the upgraded checkpoint around: the mirror gets a copy of it in
    // finalize, and revert needs it if the target was ever started.
    gpupgrade_fs::snapshot_pg_control(
        Path::new(&pair.target_data_dir),
        &gpupgrade_utils::backup_mirror_dir(state_dir, pair.content),
    )
    .await?;

    Ok(())
}

fn parse_version(raw: &str) -> Result<semver::Version, UpgradeError> {
    semver::Version::parse(raw).map_err(|_| UpgradeError::BadVersion(raw.to_string()))
}

fn segment_pair(request: &idl::UpgradePrimariesRequest, pair: &idl::DataDirPair) -> SegmentPair {
    SegmentPair {
        source: Segment {
            bindir: request.source_bindir.clone().into(),
            data_dir: pair.source_data_dir.clone().into(),
            dbid: pair.dbid,
            port: pair.source_port as u16,
        },
        target: Segment {
            bindir: request.target_bindir.clone().into(),
            data_dir: pair.target_data_dir.clone().into(),
            dbid: pair.dbid,
            port: pair.target_port as u16,
        },
    }
}

fn mapping_file(request: &idl::UpgradePrimariesRequest) -> Option<PathBuf> {
    if request.tablespaces_mapping_file_path.is_empty() {
        None
    } else {
        Some(request.tablespaces_mapping_file_path.clone().into())
    }
}

async fn pg_upgrade(
    exec: &dyn Executor,
    state_dir: &Path,
    request: &idl::UpgradePrimariesRequest,
    pair: &idl::DataDirPair,
    policy: &VersionPolicy,
    template: Option<PathBuf>,
    streams: &Streams,
) -> Result<(), UpgradeError> {
    let mut options = PgUpgradeOptions::new(SegmentMode::Segment, policy.source_major);
    options.check_only = request.check_only;
    options.link_mode = request.use_link_mode;
    options.work_dir = Some(crate::work_dir(state_dir, pair.dbid));

    if !request.check_only {
        options.tablespace_file = mapping_file(request);
    }

    if let Some(dir) = template {
        options.template_datadir = Some(dir);
        options.template_port = Some(pair.target_port as u16);
    }

    crate::run(exec, &segment_pair(request, pair), pair.content, &options, streams).await
}

async fn create_template(
    exec: &dyn Executor,
    state_dir: &Path,
    request: &idl::UpgradePrimariesRequest,
    pair: &idl::DataDirPair,
    policy: &VersionPolicy,
    streams: &Streams,
) -> Result<(), UpgradeError> {
    let mut options = PgUpgradeOptions::new(SegmentMode::Segment, policy.source_major);
    options.link_mode = request.use_link_mode;
    options.create_template = true;
    options.tablespace_file = mapping_file(request);
    options.work_dir = Some(crate::work_dir(state_dir, pair.dbid));

    crate::run(exec, &segment_pair(request, pair), pair.content, &options, streams).await
}

/// Restores the upgraded coordinator backup over the target primary,
/// leaving the per-segment configuration files alone.
async fn restore_master_backup(
    exec: &dyn Executor,
    request: &idl::UpgradePrimariesRequest,
    pair: &idl::DataDirPair,
    streams: &Streams,
) -> Result<(), UpgradeError> {
    Rsync::new()
        .source_contents(&request.master_backup_dir)
        .destination(&pair.target_data_dir)
        .options(vec!["--archive", "--delete"])
        .excludes(MASTER_BACKUP_EXCLUDES.to_vec())
        .run(exec, streams)
        .await?;

    Ok(())
}

/// Restores the coordinator-staged user tablespaces for this segment and
/// points the target's `pg_tblspc` entries at them.
async fn restore_master_tablespaces(
    exec: &dyn Executor,
    request: &idl::UpgradePrimariesRequest,
    pair: &idl::DataDirPair,
    tablespaces: &SegmentTablespaces,
    policy: &VersionPolicy,
    streams: &Streams,
) -> Result<(), UpgradeError> {
    let staging_root = match mapping_file(request) {
        Some(path) => path.parent().map(Path::to_path_buf).unwrap_or_default(),
        None => return Ok(()),
    };

    for (oid, info) in user_defined(tablespaces) {
        let target_dir = policy.tablespace_path(info, pair.dbid);

        Rsync::new()
            .source_contents(staging_root.join(oid.to_string()))
            .destination(&target_dir)
            .options(vec!["--archive", "--delete"])
            .run(exec, streams)
            .await?;

        let link = Path::new(&pair.target_data_dir)
            .join("pg_tblspc")
            .join(oid.to_string());
        ensure_parent(&link).await?;
        recreate_symlink(&target_dir, &link).await?;
    }

    Ok(())
}

/// Backs the clean template up twice: once as the pristine copy the mirror
/// upgrade pulls later, once as the working copy `pg_upgrade` consumes.
async fn backup_template(
    exec: &dyn Executor,
    state_dir: &Path,
    pair: &idl::DataDirPair,
    streams: &Streams,
) -> Result<(), UpgradeError> {
    for dest in [
        gpupgrade_utils::template_dir(state_dir, pair.content),
        gpupgrade_utils::template_working_dir(state_dir, pair.content),
    ] {
        fs::create_dir_all(&dest).await?;

        Rsync::new()
            .source_contents(&pair.target_data_dir)
            .destination(&dest)
            .options(vec!["--archive", "--delete"])
            .run(exec, streams)
            .await?;
    }

    Ok(())
}

async fn backup_tablespaces(
    exec: &dyn Executor,
    state_dir: &Path,
    pair: &idl::DataDirPair,
    tablespaces: &SegmentTablespaces,
    policy: &VersionPolicy,
    streams: &Streams,
) -> Result<(), UpgradeError> {
    let user = user_defined(tablespaces);

    if user.is_empty() {
        return Ok(());
    }

    let mut rsync = Rsync::new()
        .destination(gpupgrade_utils::backup_tablespace_dir_for_primary(
            state_dir,
            pair.content,
        ))
        .options(vec!["--archive", "--delete"]);

    for (_, info) in user {
        rsync = rsync.source_contents(policy.tablespace_path(info, pair.dbid));
    }

    rsync.run(exec, streams).await?;

    Ok(())
}

async fn link_tablespaces_to_template(
    state_dir: &Path,
    pair: &idl::DataDirPair,
    tablespaces: &SegmentTablespaces,
    policy: &VersionPolicy,
) -> Result<(), UpgradeError> {
    let template = gpupgrade_utils::template_working_dir(state_dir, pair.content);

    for (oid, info) in user_defined(tablespaces) {
        remove_if_exists(
            &Path::new(&pair.target_data_dir)
                .join("pg_tblspc")
                .join(oid.to_string()),
        )
        .await?;

        let link = template.join("pg_tblspc").join(oid.to_string());
        ensure_parent(&link).await?;
        recreate_symlink(&policy.tablespace_path(info, pair.dbid), &link).await?;
    }

    Ok(())
}

async fn link_tablespaces_to_primary(
    state_dir: &Path,
    pair: &idl::DataDirPair,
    tablespaces: &SegmentTablespaces,
    policy: &VersionPolicy,
) -> Result<(), UpgradeError> {
    let template = gpupgrade_utils::template_working_dir(state_dir, pair.content);

    for (oid, info) in user_defined(tablespaces) {
        remove_if_exists(&template.join("pg_tblspc").join(oid.to_string())).await?;

        let link = Path::new(&pair.target_data_dir)
            .join("pg_tblspc")
            .join(oid.to_string());
        ensure_parent(&link).await?;
        recreate_symlink(&policy.tablespace_path(info, pair.dbid), &link).await?;
    }

    Ok(())
}

async fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).await,
        None => Ok(()),
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use gpupgrade_cmd::{CmdError, CmdSpec};
    use std::{
        os::unix::process::ExitStatusExt,
        process::{ExitStatus, Output},
        sync::Mutex,
    };
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeExecutor {
        specs: Mutex<Vec<CmdSpec>>,
    }

    impl FakeExecutor {
        fn programs(&self) -> Vec<String> {
            self.specs.lock().unwrap().iter().map(|x| x.program.clone()).collect()
        }
    }

    impl Executor for FakeExecutor {
        fn run_streamed<'a>(
            &'a self,
            spec: CmdSpec,
            _streams: &'a Streams,
        ) -> futures::future::BoxFuture<'a, Result<(), CmdError>> {
            self.specs.lock().unwrap().push(spec);

            async { Ok(()) }.boxed()
        }

        fn run_output<'a>(
            &'a self,
            spec: CmdSpec,
        ) -> futures::future::BoxFuture<'a, Result<Output, CmdError>> {
            self.specs.lock().unwrap().push(spec);

            async {
                Ok(Output {
                    status: ExitStatus::from_raw(0),
                    stdout: vec![],
                    stderr: vec![],
                })
            }
            .boxed()
        }
    }

    fn request(tmp: &TempDir, check_only: bool, link: bool) -> idl::UpgradePrimariesRequest {
        idl::UpgradePrimariesRequest {
            source_bindir: "/usr/local/greenplum-db-5/bin".into(),
            target_bindir: "/usr/local/greenplum-db-6/bin".into(),
            source_version: "5.28.6".into(),
            target_version: "6.21.0".into(),
            check_only,
            use_link_mode: link,
            tablespaces_mapping_file_path: tmp
                .path()
                .join("tablespaces")
                .join("tablespaces.txt")
                .display()
                .to_string(),
            master_backup_dir: tmp.path().join("upgraded-master.bak").display().to_string(),
            data_dir_pairs: vec![],
        }
    }

    fn data_dir_pair(tmp: &TempDir) -> idl::DataDirPair {
        idl::DataDirPair {
            source_data_dir: tmp.path().join("seg1").display().to_string(),
            target_data_dir: tmp.path().join("seg1_ABC123").display().to_string(),
            source_port: 25432,
            target_port: 26432,
            content: 0,
            dbid: 2,
            tablespaces: Default::default(),
        }
    }

    fn with_tablespace(tmp: &TempDir, mut pair: idl::DataDirPair) -> idl::DataDirPair {
        pair.tablespaces.insert(
            16386,
            idl::TablespaceInfo {
                name: "batting".into(),
                location: tmp.path().join("user_ts").join("16386").display().to_string(),
                user_defined: true,
            },
        );

        pair
    }

    #[tokio::test]
    async fn test_check_only_runs_pg_upgrade_and_nothing_else() {
        let tmp = TempDir::new().unwrap();
        let exec = FakeExecutor::default();
        let (streams, _rx) = Streams::channel();

        upgrade_primary(
            &exec,
            tmp.path(),
            &request(&tmp, true, true),
            &data_dir_pair(&tmp),
            &streams,
        )
        .await
        .unwrap();

        let specs = exec.specs.lock().unwrap();

        assert_eq!(specs.len(), 1);
        assert!(specs[0].program.ends_with("pg_upgrade"));
        assert!(specs[0].args.contains(&"--check".to_string()));
        // No tablespace file is passed in check mode.
        assert!(!specs[0].args.iter().any(|x| x.starts_with("--old-tablespaces-file")));
    }

    #[tokio::test]
    async fn test_copy_mode_skips_the_template_dance() {
        let tmp = TempDir::new().unwrap();
        let exec = FakeExecutor::default();
        let (streams, _rx) = Streams::channel();

        upgrade_primary(
            &exec,
            tmp.path(),
            &request(&tmp, false, false),
            &data_dir_pair(&tmp),
            &streams,
        )
        .await
        .unwrap();

        let programs = exec.programs();
        assert_eq!(programs.len(), 2);
        assert_eq!(programs[0], "rsync");
        assert!(programs[1].ends_with("pg_upgrade"));

        let specs = exec.specs.lock().unwrap();
        let pg_upgrade = &specs[1];

        assert!(pg_upgrade.program.ends_with("pg_upgrade"));
        assert!(!pg_upgrade.args.contains(&"--link".to_string()));
        assert!(!pg_upgrade.args.iter().any(|x| x.starts_with("--template-datadir")));
    }

    #[tokio::test]
    async fn test_link_mode_runs_the_template_dance() {
        let tmp = TempDir::new().unwrap();
        let exec = FakeExecutor::default();
        let (streams, _rx) = Streams::channel();

        let pair = with_tablespace(&tmp, data_dir_pair(&tmp));

        // pg_control must exist for the snapshot at the end.
        let global = tmp.path().join("seg1_ABC123").join("global");
        std::fs::create_dir_all(&global).unwrap();
        std::fs::write(global.join("pg_control"), b"lsn").unwrap();

        upgrade_primary(
            &exec,
            tmp.path(),
            &request(&tmp, false, true),
            &pair,
            &streams,
        )
        .await
        .unwrap();

        let specs = exec.specs.lock().unwrap();

        // restore backup, restore tablespace, create template, two template
        // backups, tablespace backup, then the real upgrade.
        let pg_upgrades: Vec<_> = specs
            .iter()
            .filter(|x| x.program.ends_with("pg_upgrade"))
            .collect();

        assert_eq!(pg_upgrades.len(), 2);
        assert!(pg_upgrades[0].args.contains(&"--create-template".to_string()));
        assert!(pg_upgrades[1].args.iter().any(|x| x.starts_with("--template-datadir=")));
        assert!(pg_upgrades[1].args.contains(&"--link".to_string()));

        // The tablespace symlink ends up pointing at the primary's files.
        let link = tmp
            .path()
            .join("seg1_ABC123")
            .join("pg_tblspc")
            .join("16386");
        let dest = std::fs::read_link(&link).unwrap();
        assert_eq!(dest, tmp.path().join("user_ts").join("16386").join("2"));

        // And the upgraded pg_control was snapshotted for the mirror.
        let snapshot = gpupgrade_utils::backup_mirror_dir(tmp.path(), 0)
            .join("global")
            .join("pg_control");
        assert_eq!(std::fs::read(snapshot).unwrap(), b"lsn");
    }
}
