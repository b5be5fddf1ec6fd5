// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! The on-disk substep journal.
//!
//! Layout: `<state_dir>/<step>/<substep>/<status>`, where `<status>` is a
//! zero-byte sentinel file named `running`, `complete`, `failed`, or
//! `skipped`. Timestamps come from file mtimes. A new status is written
//! before stale ones are removed, so a crash between the two leaves the
//! stronger status in place and [`Journal::status`] resolves the ambiguity
//! by precedence.

use gpupgrade_idl::{Status, Substep};
use std::{fs, io, path::PathBuf};

/// Read precedence: a terminal status wins over `running` left behind by a
/// crash mid-transition.
const PRECEDENCE: &[Status] = &[Status::Complete, Status::Failed, Status::Skipped, Status::Running];

#[derive(Debug, Clone)]
pub struct Journal {
    dir: PathBuf,
}

impl Journal {
    /// Opens a journal directory without creating it; reads on a missing
    /// directory answer "never run".
    pub fn open(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Opens the journal directory for writing, creating it if needed.
    pub fn create(dir: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn mark(&self, substep: Substep, status: Status) -> io::Result<()> {
        let dir = self.dir.join(substep.name());
        fs::create_dir_all(&dir)?;

        fs::File::create(dir.join(status.name()))?;

        for other in PRECEDENCE {
            if *other == status {
                continue;
            }

            match fs::remove_file(dir.join(other.name())) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    pub fn status(&self, substep: Substep) -> Option<Status> {
        let dir = self.dir.join(substep.name());

        PRECEDENCE
            .iter()
            .find(|status| dir.join(status.name()).exists())
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_journal_reads_as_never_run() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::open(tmp.path().join("execute"));

        assert_eq!(journal.status(Substep::UpgradeMaster), None);
    }

    #[test]
    fn test_mark_replaces_prior_status() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::create(tmp.path().join("execute")).unwrap();

        journal.mark(Substep::UpgradeMaster, Status::Running).unwrap();
        assert_eq!(journal.status(Substep::UpgradeMaster), Some(Status::Running));

        journal.mark(Substep::UpgradeMaster, Status::Complete).unwrap();
        assert_eq!(journal.status(Substep::UpgradeMaster), Some(Status::Complete));

        let dir = tmp.path().join("execute").join("upgrade_master");
        assert!(!dir.join("running").exists());
        assert!(dir.join("complete").exists());
    }

    #[test]
    fn test_terminal_status_wins_over_stale_running() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("execute").join("upgrade_master");
        fs::create_dir_all(&dir).unwrap();

        // A crash between writing the new sentinel and removing the old one
        // leaves both behind.
        fs::File::create(dir.join("running")).unwrap();
        fs::File::create(dir.join("complete")).unwrap();

        let journal = Journal::open(tmp.path().join("execute"));

        assert_eq!(journal.status(Substep::UpgradeMaster), Some(Status::Complete));
    }
}
