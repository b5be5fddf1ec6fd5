// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::{TablespaceInfo, UpgradeId};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

/// Version-dependent behavior, selected once from the source cluster's
/// `major.minor` during initialize and carried in the persisted config.
///
/// The tablespace layout, the conf files that need rewriting, and the
/// startup quirks all differ between major versions; everything that varies
/// is gathered here so the step bodies stay version-agnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VersionPolicy {
    pub source_major: u64,
    /// Tablespace files live directly under `<location>/<dbid>` (5X) rather
    /// than the catalog-versioned layout the server manages itself (6X+).
    pub legacy_tablespace_layout: bool,
    /// `gpstart` on a 5X source exits 1 when mirrors fail to come up after
    /// primaries were upgraded in place; that exit is expected and tolerated.
    pub tolerates_mirror_startup_failure: bool,
}

impl VersionPolicy {
    pub fn from_source(version: &semver::Version) -> Self {
        Self {
            source_major: version.major,
            legacy_tablespace_layout: version.major == 5,
            tolerates_mirror_startup_failure: version.major == 5,
        }
    }

    /// The directory a segment's files for one tablespace live in. Both
    /// layouts root at `<location>/<dbid>`; 6X+ nests catalog-versioned
    /// subdirectories below that, which the server owns.
    pub fn tablespace_path(&self, info: &TablespaceInfo, dbid: i32) -> PathBuf {
        info.location.join(dbid.to_string())
    }

    /// Whether `gpperfmon.conf`'s `log_location` must be rewritten after the
    /// data directories move. Gone in 7.
    pub fn needs_gpperfmon_rewrite(target_major: u64) -> bool {
        target_major < 7
    }
}

/// Detects catalog drift between what was initialized and what a later step
/// observes: if the versions, the content set, or the upgrade id changed,
/// the persisted state no longer describes this cluster.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Fingerprint {
    pub source_version: String,
    pub target_version: String,
    pub contents: BTreeSet<i32>,
    pub upgrade_id: UpgradeId,
}

impl Fingerprint {
    pub fn new(
        source: &semver::Version,
        target: &semver::Version,
        contents: impl IntoIterator<Item = i32>,
        upgrade_id: UpgradeId,
    ) -> Self {
        Self {
            source_version: format!("{}.{}", source.major, source.minor),
            target_version: format!("{}.{}", target.major, target.minor),
            contents: contents.into_iter().collect(),
            upgrade_id,
        }
    }
}

/// Parses the version reported by `postgres --gp-version`-style output, e.g.
/// `postgres (Greenplum Database) 6.21.0 build commit:...` → `6.21.0`.
pub fn parse_version_output(output: &str) -> Option<semver::Version> {
    output
        .split_whitespace()
        .find_map(|word| semver::Version::parse(word.trim_start_matches('v')).ok())
}

/// True when `path` sits inside the 5X per-dbid tablespace layout for one of
/// the given locations: `<location>/<dbid>`. Used to scope legacy tablespace
/// deletion to exactly the old layout and nothing newer.
pub fn is_legacy_tablespace_path(path: &Path, location: &Path, dbid: i32) -> bool {
    path == location.join(dbid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_selection() {
        let five = VersionPolicy::from_source(&semver::Version::new(5, 28, 6));
        assert!(five.legacy_tablespace_layout);
        assert!(five.tolerates_mirror_startup_failure);

        let six = VersionPolicy::from_source(&semver::Version::new(6, 21, 0));
        assert!(!six.legacy_tablespace_layout);
        assert!(!six.tolerates_mirror_startup_failure);
    }

    #[test]
    fn test_tablespace_path_roots_at_dbid() {
        let policy = VersionPolicy::from_source(&semver::Version::new(5, 28, 6));
        let info = TablespaceInfo {
            name: "batting".into(),
            location: "/tmp/user_ts/p1/demoDataDir0/16386".into(),
            user_defined: true,
        };

        assert_eq!(
            policy.tablespace_path(&info, 2),
            Path::new("/tmp/user_ts/p1/demoDataDir0/16386/2")
        );
    }

    #[test]
    fn test_gpperfmon_rewrite_dropped_in_seven() {
        assert!(VersionPolicy::needs_gpperfmon_rewrite(6));
        assert!(!VersionPolicy::needs_gpperfmon_rewrite(7));
    }

    #[test]
    fn test_parse_version_output() {
        let out = "postgres (Greenplum Database) 6.21.0 build commit:f7c6eb5cc";

        assert_eq!(parse_version_output(out), Some(semver::Version::new(6, 21, 0)));
        assert_eq!(parse_version_output("garbage"), None);
    }

    #[test]
    fn test_fingerprint_detects_content_drift() {
        let id = UpgradeId::from_raw(1);
        let source = semver::Version::new(5, 28, 6);
        let target = semver::Version::new(6, 21, 0);

        let a = Fingerprint::new(&source, &target, vec![-1, 0, 1], id);
        let b = Fingerprint::new(&source, &target, vec![-1, 0, 1, 2], id);

        assert_ne!(a, b);
        assert_eq!(a, Fingerprint::new(&source, &target, vec![0, 1, -1], id));
    }

    #[test]
    fn test_is_legacy_tablespace_path() {
        let location = Path::new("/tmp/user_ts/m1/demoDataDir0/16386");

        assert!(is_legacy_tablespace_path(
            &location.join("4"),
            location,
            4
        ));
        assert!(!is_legacy_tablespace_path(
            &location.join("4").join("GPDB_6_301908232"),
            location,
            4
        ));
    }
}
