// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

pub mod errorlist;

pub use errorlist::{collect_errors, BoxedError, ErrorList};

use chrono::{DateTime, SecondsFormat, Utc};
use lazy_static::lazy_static;
use std::{
    env, io,
    io::Write,
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tokio::task::spawn_blocking;

lazy_static! {
    /// The per-cluster state directory, `$GPUPGRADE_HOME` or `$HOME/.gpupgrade`.
    pub static ref STATE_DIR: PathBuf = {
        match env::var_os("GPUPGRADE_HOME") {
            Some(x) => PathBuf::from(x),
            None => {
                let home = env::var_os("HOME").expect("HOME environment variable is required.");

                Path::new(&home).join(".gpupgrade")
            }
        }
    };
}

pub fn state_dir() -> PathBuf {
    STATE_DIR.clone()
}

pub fn config_path(state_dir: &Path) -> PathBuf {
    state_dir.join("config.json")
}

/// Mapping file consumed by `pg_upgrade --old-tablespaces-file`.
pub fn tablespaces_mapping_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join("tablespaces").join("tablespaces.txt")
}

pub fn tablespaces_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("tablespaces")
}

/// Staged copy of a primary's user-defined tablespace files,
/// `$STATE_DIR/tablespaces/p<content>`.
pub fn backup_tablespace_dir_for_primary(state_dir: &Path, content: i32) -> PathBuf {
    state_dir.join("tablespaces").join(format!("p{}", content))
}

/// Clean link-mode template for one content id, `$STATE_DIR/template/<content>`.
pub fn template_dir(state_dir: &Path, content: i32) -> PathBuf {
    state_dir.join("template").join(content.to_string())
}

/// The working copy of the template that `pg_upgrade` consumes as its old
/// cluster, `$STATE_DIR/template_working/<content>`.
pub fn template_working_dir(state_dir: &Path, content: i32) -> PathBuf {
    state_dir.join("template_working").join(content.to_string())
}

/// pg_control snapshot taken from an upgraded primary, later pushed onto its
/// mirror, `$STATE_DIR/backup/mirror/<content>`.
pub fn backup_mirror_dir(state_dir: &Path, content: i32) -> PathBuf {
    state_dir.join("backup").join("mirror").join(content.to_string())
}

/// Per-dbid pg_upgrade working directory so parallel invocations do not
/// collide on dump files.
pub fn pg_upgrade_work_dir(state_dir: &Path, dbid: i32) -> PathBuf {
    state_dir.join("pg_upgrade").join(format!("seg-{}", dbid))
}

/// Staging copy of the upgraded coordinator data directory.
pub fn upgraded_master_backup_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("upgraded-master.bak")
}

/// Backup of the freshly initialized (pre-upgrade) coordinator data directory.
pub fn original_master_backup_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("original-master.bak")
}

/// The active admin log directory, `$HOME/gpAdminLogs/gpupgrade`.
pub fn log_dir() -> io::Result<PathBuf> {
    let home = env::var_os("HOME").ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "HOME environment variable is required")
    })?;

    Ok(Path::new(&home).join("gpAdminLogs").join("gpupgrade"))
}

/// Name used when archiving a log directory: `gpupgrade-<id>-<RFC3339>`.
pub fn archive_log_directory_name(upgrade_id: impl std::fmt::Display, at: DateTime<Utc>) -> String {
    format!(
        "gpupgrade-{}-{}",
        upgrade_id,
        at.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Writes `contents` to `path` through a temporary file in the same
/// directory followed by a rename, so readers never observe a torn file.
pub fn atomically_write_sync(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;

    std::fs::create_dir_all(dir)?;

    let mut f = NamedTempFile::new_in(dir)?;
    f.write_all(contents)?;
    f.as_file().sync_all()?;

    f.persist(path).map_err(|e| e.error)?;

    Ok(())
}

/// Async wrapper over [`atomically_write_sync`].
pub async fn atomically_write(path: PathBuf, contents: Vec<u8>) -> io::Result<()> {
    spawn_blocking(move || atomically_write_sync(&path, &contents)).await?
}
