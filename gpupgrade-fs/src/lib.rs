// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

pub mod conf;

use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::fs;

/// Files that must be present before a directory is trusted to be a segment
/// data directory and deleted recursively. Stray copies of the conf files
/// alone are not enough; a real data directory always carries its control
/// file under `global/`.
pub const POSTGRES_FILES: &[&str] = &["postgresql.conf", "PG_VERSION", "global/pg_control"];

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0} exists and is not a symbolic link")]
    NotASymlink(PathBuf),
    #[error("{dir} does not look like a segment data directory: missing {file}")]
    MissingSentinel { dir: PathBuf, file: String },
    #[error("{0} is outside the legacy tablespace layout; refusing to delete")]
    NotALegacyTablespace(PathBuf),
}

pub async fn path_exists(path: impl AsRef<Path>) -> bool {
    fs::symlink_metadata(path).await.is_ok()
}

pub async fn dir_exists(path: impl AsRef<Path>) -> bool {
    match fs::metadata(path).await {
        Ok(m) => m.is_dir(),
        Err(_) => false,
    }
}

/// Replaces `link` with a symlink pointing at `target`.
///
/// The link site is probed with an lstat first: an existing symlink is
/// removed and recreated, while an existing regular file or directory is a
/// fatal error since overwriting it would destroy data outside our control.
pub async fn recreate_symlink(target: &Path, link: &Path) -> Result<(), FsError> {
    match fs::symlink_metadata(link).await {
        Ok(meta) if meta.file_type().is_symlink() => {
            fs::remove_file(link).await?;
        }
        Ok(_) => return Err(FsError::NotASymlink(link.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    fs::symlink(target, link).await?;

    Ok(())
}

/// Archives `source` and, unless `archive_only`, moves `target` onto the
/// source path.
///
/// Both renames are guarded on the state already being in place, so the
/// operation can be re-run after a crash at any point:
///
/// - `source` → `archive` happens only while `archive` does not exist;
/// - `target` → `source` happens only while `target` still exists.
pub async fn archive_and_swap(
    source: &Path,
    archive: &Path,
    target: &Path,
    archive_only: bool,
) -> Result<(), FsError> {
    if !path_exists(archive).await {
        tracing::debug!(?source, ?archive, "archiving directory");

        fs::rename(source, archive).await?;
    }

    if archive_only {
        return Ok(());
    }

    if path_exists(target).await {
        tracing::debug!(?target, ?source, "swapping directory into place");

        fs::rename(target, source).await?;
    }

    Ok(())
}

/// Recursively deletes a segment data directory after verifying the sentinel
/// files that mark it as one. A directory that is already gone counts as
/// deleted.
pub async fn delete_data_directory(dir: &Path) -> Result<(), FsError> {
    if !path_exists(dir).await {
        tracing::debug!(?dir, "data directory already deleted");

        return Ok(());
    }

    for file in POSTGRES_FILES {
        if !path_exists(&dir.join(file)).await {
            return Err(FsError::MissingSentinel {
                dir: dir.to_path_buf(),
                file: (*file).to_string(),
            });
        }
    }

    fs::remove_dir_all(dir).await?;

    Ok(())
}

/// Deletes a directory tree without sentinel verification. Missing is fine.
pub async fn remove_dir_all_if_exists(dir: &Path) -> Result<(), FsError> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Renames a directory, distinguishing "nothing to move" from real failures.
pub async fn move_dir(old: &Path, new: &Path) -> Result<bool, FsError> {
    match fs::rename(old, new).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Copies `<datadir>/global/pg_control` into `<backup_dir>/global/pg_control`.
pub async fn snapshot_pg_control(data_dir: &Path, backup_dir: &Path) -> Result<(), FsError> {
    let contents = fs::read(data_dir.join("global").join("pg_control")).await?;

    let dest = backup_dir.join("global").join("pg_control");
    gpupgrade_utils::atomically_write(dest, contents).await?;

    Ok(())
}

/// Puts back the `pg_control` that link-mode `pg_upgrade` renamed to
/// `pg_control.old`, then removes the `.old` file.
///
/// Idempotent: once `pg_control` is live and the `.old` file is gone there
/// is nothing left to do.
pub async fn restore_pg_control(data_dir: &Path) -> Result<(), FsError> {
    let global = data_dir.join("global");
    let live = global.join("pg_control");
    let old = global.join("pg_control.old");

    let contents = match fs::read(&old).await {
        Ok(x) => x,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if path_exists(&live).await {
                tracing::debug!(?data_dir, "pg_control already restored");

                return Ok(());
            }

            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    gpupgrade_utils::atomically_write(live, contents).await?;
    fs::remove_file(&old).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    fn make_data_dir(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);

        for file in POSTGRES_FILES {
            touch(&dir.join(file));
        }

        dir
    }

    #[tokio::test]
    async fn test_recreate_symlink_creates_and_replaces() -> Result<(), FsError> {
        let tmp = TempDir::new().unwrap();
        let link = tmp.path().join("pg_tblspc").join("16386");
        std::fs::create_dir_all(link.parent().unwrap()).unwrap();

        recreate_symlink(Path::new("/tmp/ts/old"), &link).await?;
        recreate_symlink(Path::new("/tmp/ts/new"), &link).await?;

        assert_eq!(std::fs::read_link(&link).unwrap(), Path::new("/tmp/ts/new"));

        Ok(())
    }

    #[tokio::test]
    async fn test_recreate_symlink_refuses_regular_files() {
        let tmp = TempDir::new().unwrap();
        let link = tmp.path().join("16386");
        touch(&link);

        let err = recreate_symlink(Path::new("/tmp/ts"), &link).await.unwrap_err();

        assert!(matches!(err, FsError::NotASymlink(_)));
    }

    #[tokio::test]
    async fn test_archive_and_swap_round_trip() -> Result<(), FsError> {
        let tmp = TempDir::new().unwrap();

        let source = make_data_dir(tmp.path(), "seg1");
        std::fs::write(source.join("PG_VERSION"), b"5").unwrap();
        let target = make_data_dir(tmp.path(), "seg1_ABC123");
        std::fs::write(target.join("PG_VERSION"), b"6").unwrap();

        let archive = tmp.path().join("seg1_old");

        archive_and_swap(&source, &archive, &target, false).await?;

        assert_eq!(std::fs::read(source.join("PG_VERSION")).unwrap(), b"6");
        assert_eq!(std::fs::read(archive.join("PG_VERSION")).unwrap(), b"5");
        assert!(!target.exists());

        // The inverse rename restores the original layout byte for byte.
        archive_and_swap(&source, &target, &archive, false).await?;

        assert_eq!(std::fs::read(source.join("PG_VERSION")).unwrap(), b"5");
        assert!(!archive.exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_archive_only_is_idempotent() -> Result<(), FsError> {
        let tmp = TempDir::new().unwrap();

        let source = make_data_dir(tmp.path(), "standby");
        let archive = tmp.path().join("standby_old");

        archive_and_swap(&source, &archive, Path::new("/nonexistent"), true).await?;
        archive_and_swap(&source, &archive, Path::new("/nonexistent"), true).await?;

        assert!(!source.exists());
        assert!(archive.exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_archive_and_swap_resumes_after_partial_run() -> Result<(), FsError> {
        let tmp = TempDir::new().unwrap();

        // Crash happened after the archive rename: source is gone, target
        // still staged.
        let archive = make_data_dir(tmp.path(), "seg1_old");
        let target = make_data_dir(tmp.path(), "seg1_ABC123");
        let source = tmp.path().join("seg1");

        archive_and_swap(&source, &archive, &target, false).await?;

        assert!(source.exists());
        assert!(archive.exists());
        assert!(!target.exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_delete_data_directory_refuses_non_segment_dirs() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("not-a-segment");
        std::fs::create_dir(&dir).unwrap();

        let err = delete_data_directory(&dir).await.unwrap_err();

        assert!(matches!(err, FsError::MissingSentinel { .. }));
        assert!(dir.exists());
    }

    #[tokio::test]
    async fn test_delete_data_directory_requires_the_control_file() {
        let tmp = TempDir::new().unwrap();

        // Stray conf files alone do not make a data directory.
        let dir = tmp.path().join("seg1");
        touch(&dir.join("postgresql.conf"));
        touch(&dir.join("PG_VERSION"));

        let err = delete_data_directory(&dir).await.unwrap_err();

        match err {
            FsError::MissingSentinel { file, .. } => assert_eq!(file, "global/pg_control"),
            other => panic!("expected FsError::MissingSentinel, got {:?}", other),
        }
        assert!(dir.exists());
    }

    #[tokio::test]
    async fn test_delete_data_directory_tolerates_missing_dir() -> Result<(), FsError> {
        let tmp = TempDir::new().unwrap();

        delete_data_directory(&tmp.path().join("gone")).await?;

        let dir = make_data_dir(tmp.path(), "seg1");
        delete_data_directory(&dir).await?;
        delete_data_directory(&dir).await?;

        assert!(!dir.exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_restore_pg_control() -> Result<(), FsError> {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("seg1");
        let old = data_dir.join("global").join("pg_control.old");
        touch(&old);
        std::fs::write(&old, b"checkpoint").unwrap();

        restore_pg_control(&data_dir).await?;

        let live = data_dir.join("global").join("pg_control");
        assert_eq!(std::fs::read(&live).unwrap(), b"checkpoint");
        assert!(!old.exists());

        // Second run observes the restored state and succeeds.
        restore_pg_control(&data_dir).await?;

        Ok(())
    }

    #[tokio::test]
    async fn test_restore_pg_control_fails_when_neither_file_exists() {
        let tmp = TempDir::new().unwrap();

        assert!(restore_pg_control(&tmp.path().join("seg1")).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_pg_control() -> Result<(), FsError> {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("seg1");
        let control = data_dir.join("global").join("pg_control");
        touch(&control);
        std::fs::write(&control, b"lsn").unwrap();

        let backup = tmp.path().join("backup").join("mirror").join("0");
        snapshot_pg_control(&data_dir, &backup).await?;

        assert_eq!(
            std::fs::read(backup.join("global").join("pg_control")).unwrap(),
            b"lsn"
        );

        Ok(())
    }
}
