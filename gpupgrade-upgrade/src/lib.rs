// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

pub mod mirror;
pub mod primary;

use gpupgrade_cmd::{CmdError, CmdSpec, Executor, Streams};
use std::path::{Path, PathBuf};

/// Files that differ per segment and must never be clobbered when a data
/// directory is restored from the coordinator's backup.
pub const MASTER_BACKUP_EXCLUDES: &[&str] = &[
    "internal.auto.conf",
    "postgresql.conf",
    "pg_hba.conf",
    "postmaster.opts",
    "gp_dbid",
    "gpssh.conf",
    "gpperfmon",
];

/// Additional per-mirror state that must survive a template restore.
pub const MIRROR_TEMPLATE_EXCLUDES: &[&str] = &[
    "internal.auto.conf",
    "postgresql.conf",
    "pg_hba.conf",
    "postmaster.opts",
    "gp_dbid",
    "gpssh.conf",
    "gpperfmon",
    "pg_replslot",
    "postgresql.auto.conf",
    "recovery.conf",
];

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("pg_upgrade of content {content} (dbid {dbid}): {source}")]
    PgUpgrade {
        content: i32,
        dbid: i32,
        #[source]
        source: CmdError,
    },
    #[error("could not parse version {0:?}")]
    BadVersion(String),
    #[error(transparent)]
    Cmd(#[from] CmdError),
    #[error(transparent)]
    Fs(#[from] gpupgrade_fs::FsError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One side of a `pg_upgrade` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub bindir: PathBuf,
    pub data_dir: PathBuf,
    pub dbid: i32,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPair {
    pub source: Segment,
    pub target: Segment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentMode {
    Dispatcher,
    Segment,
}

impl SegmentMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Dispatcher => "dispatcher",
            Self::Segment => "segment",
        }
    }
}

/// The typed options bag `pg_upgrade` invocations are built from.
#[derive(Debug, Clone)]
pub struct PgUpgradeOptions {
    pub mode: SegmentMode,
    /// The source cluster's major version. Pre-6 servers do not record the
    /// dbid in the catalog, so it is handed to the old postmaster through
    /// `--old-options`.
    pub source_major: u64,
    pub check_only: bool,
    pub link_mode: bool,
    pub tablespace_file: Option<PathBuf>,
    pub create_template: bool,
    pub template_datadir: Option<PathBuf>,
    pub template_port: Option<u16>,
    pub work_dir: Option<PathBuf>,
}

impl PgUpgradeOptions {
    pub fn new(mode: SegmentMode, source_major: u64) -> Self {
        Self {
            mode,
            source_major,
            check_only: false,
            link_mode: false,
            tablespace_file: None,
            create_template: false,
            template_datadir: None,
            template_port: None,
            work_dir: None,
        }
    }
}

/// Builds the full argument list for one `pg_upgrade` invocation.
pub fn build_args(pair: &SegmentPair, options: &PgUpgradeOptions) -> Vec<String> {
    let mut args = vec![
        "--retain".to_string(),
        format!("--old-bindir={}", pair.source.bindir.display()),
        format!("--new-bindir={}", pair.target.bindir.display()),
        format!("--old-datadir={}", pair.source.data_dir.display()),
        format!("--new-datadir={}", pair.target.data_dir.display()),
        format!("--old-port={}", pair.source.port),
        format!("--new-port={}", pair.target.port),
        format!("--old-gp-dbid={}", pair.source.dbid),
        format!("--new-gp-dbid={}", pair.target.dbid),
        format!("--mode={}", options.mode.as_str()),
    ];

    if options.source_major == 5 {
        args.push("--old-options".to_string());
        args.push(format!("-x {}", pair.source.dbid));
    }

    if options.check_only {
        args.push("--check".to_string());
    }

    if options.link_mode {
        args.push("--link".to_string());
    }

    if let Some(file) = &options.tablespace_file {
        args.push(format!("--old-tablespaces-file={}", file.display()));
    }

    if options.create_template {
        args.push("--create-template".to_string());
    }

    if let Some(dir) = &options.template_datadir {
        args.push(format!("--template-datadir={}", dir.display()));
    }

    if let Some(port) = options.template_port {
        args.push(format!("--template-port={}", port));
    }

    args
}

/// Runs `pg_upgrade` for one segment pair, streaming its output.
///
/// The working directory is created first so the dump files of parallel
/// invocations land in per-dbid directories rather than colliding.
pub async fn run(
    exec: &dyn Executor,
    pair: &SegmentPair,
    content: i32,
    options: &PgUpgradeOptions,
    streams: &Streams,
) -> Result<(), UpgradeError> {
    let mut spec = CmdSpec::new(pair.target.bindir.join("pg_upgrade").display().to_string())
        .args(build_args(pair, options));

    if let Some(work_dir) = &options.work_dir {
        tokio::fs::create_dir_all(work_dir).await?;

        spec = spec.cwd(work_dir);
    }

    exec.run_streamed(spec, streams)
        .await
        .map_err(|source| UpgradeError::PgUpgrade {
            content,
            dbid: pair.target.dbid,
            source,
        })
}

/// The per-dbid working directory, created under the state dir.
pub fn work_dir(state_dir: &Path, dbid: i32) -> PathBuf {
    gpupgrade_utils::pg_upgrade_work_dir(state_dir, dbid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> SegmentPair {
        SegmentPair {
            source: Segment {
                bindir: "/usr/local/greenplum-db-5/bin".into(),
                data_dir: "/data/dbfast1/seg1".into(),
                dbid: 2,
                port: 25432,
            },
            target: Segment {
                bindir: "/usr/local/greenplum-db-6/bin".into(),
                data_dir: "/data/dbfast1/seg1_ABC123".into(),
                dbid: 2,
                port: 26432,
            },
        }
    }

    #[test]
    fn test_basic_segment_args() {
        let options = PgUpgradeOptions::new(SegmentMode::Segment, 6);

        assert_eq!(
            build_args(&pair(), &options),
            vec![
                "--retain",
                "--old-bindir=/usr/local/greenplum-db-5/bin",
                "--new-bindir=/usr/local/greenplum-db-6/bin",
                "--old-datadir=/data/dbfast1/seg1",
                "--new-datadir=/data/dbfast1/seg1_ABC123",
                "--old-port=25432",
                "--new-port=26432",
                "--old-gp-dbid=2",
                "--new-gp-dbid=2",
                "--mode=segment",
            ]
        );
    }

    #[test]
    fn test_five_x_source_passes_the_dbid_through_old_options() {
        let options = PgUpgradeOptions::new(SegmentMode::Segment, 5);

        let args = build_args(&pair(), &options);
        let at = args.iter().position(|x| x == "--old-options").unwrap();

        assert_eq!(args[at + 1], "-x 2");
    }

    #[test]
    fn test_check_only_adds_check_flag() {
        let mut options = PgUpgradeOptions::new(SegmentMode::Dispatcher, 6);
        options.check_only = true;

        let args = build_args(&pair(), &options);

        assert!(args.contains(&"--check".to_string()));
        assert!(args.contains(&"--mode=dispatcher".to_string()));
        assert!(!args.contains(&"--link".to_string()));
        assert!(!args.contains(&"--old-options".to_string()));
    }

    #[test]
    fn test_link_mode_template_args() {
        let mut options = PgUpgradeOptions::new(SegmentMode::Segment, 6);
        options.link_mode = true;
        options.tablespace_file = Some("/home/gpadmin/.gpupgrade/tablespaces/tablespaces.txt".into());
        options.template_datadir = Some("/home/gpadmin/.gpupgrade/template_working/0".into());
        options.template_port = Some(26432);

        let args = build_args(&pair(), &options);

        assert!(args.contains(&"--link".to_string()));
        assert!(args.contains(
            &"--old-tablespaces-file=/home/gpadmin/.gpupgrade/tablespaces/tablespaces.txt"
                .to_string()
        ));
        assert!(args
            .contains(&"--template-datadir=/home/gpadmin/.gpupgrade/template_working/0".to_string()));
        assert!(args.contains(&"--template-port=26432".to_string()));
    }

    #[test]
    fn test_create_template_flag() {
        let mut options = PgUpgradeOptions::new(SegmentMode::Segment, 6);
        options.create_template = true;

        assert!(build_args(&pair(), &options).contains(&"--create-template".to_string()));
    }
}
