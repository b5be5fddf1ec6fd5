// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::HubError;
use gpupgrade_wire_types::{
    Cluster, Fingerprint, InitializeConfig, Tablespaces, UpgradeId,
};
use std::path::{Path, PathBuf};

/// Everything the hub persists about one upgrade, atomically rewritten on
/// every mutation so a crashed hub never reads a torn file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config {
    pub source: Cluster,
    pub target: Cluster,
    /// The prospective target layout produced during initialize, before the
    /// catalog rewrite. Deleted state on revert.
    pub intermediate: InitializeConfig,
    pub upgrade_id: UpgradeId,
    pub use_link_mode: bool,
    pub use_hba_hostnames: bool,
    pub agent_port: u16,
    /// Needed to find (and on revert, delete) the catalog-versioned target
    /// tablespace subdirectories.
    pub target_catalog_version: Option<String>,
    pub tablespaces: Tablespaces,
    pub tablespaces_mapping_file_path: PathBuf,
    pub fingerprint: Option<Fingerprint>,
}

impl Config {
    pub fn new(upgrade_id: UpgradeId) -> Self {
        Self {
            source: Cluster::default(),
            target: Cluster::default(),
            intermediate: InitializeConfig::default(),
            upgrade_id,
            use_link_mode: false,
            use_hba_hostnames: false,
            agent_port: 6416,
            target_catalog_version: None,
            tablespaces: Tablespaces::new(),
            tablespaces_mapping_file_path: PathBuf::new(),
            fingerprint: None,
        }
    }

    pub fn load(state_dir: &Path) -> Result<Self, HubError> {
        let raw = std::fs::read(gpupgrade_utils::config_path(state_dir))?;

        Ok(serde_json::from_slice(&raw)?)
    }

    /// Loads the persisted config, falling back to a fresh one when
    /// initialize has never saved it.
    pub fn load_or_new(state_dir: &Path) -> Result<Self, HubError> {
        match Self::load(state_dir) {
            Ok(x) => Ok(x),
            Err(HubError::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(Self::new(UpgradeId::generate()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, state_dir: &Path) -> Result<(), HubError> {
        let raw = serde_json::to_vec_pretty(self)?;

        gpupgrade_utils::atomically_write(gpupgrade_utils::config_path(state_dir), raw).await?;

        Ok(())
    }

    /// The target cluster as laid out at initialize: staged directories and
    /// assigned ports. Mirrors are present only in link mode (the target is
    /// born with them); the standby never is (it is added after finalize
    /// starts the cluster). `None` until initialize has generated a layout.
    pub fn intermediate_cluster(&self) -> Result<Option<Cluster>, HubError> {
        let master = match &self.intermediate.master {
            Some(x) => x.clone(),
            None => return Ok(None),
        };

        let mut segments = vec![master];
        segments.extend(self.intermediate.primaries.iter().cloned());

        if self.use_link_mode {
            segments.extend(self.intermediate.mirrors.iter().cloned());
        }

        Ok(Some(Cluster::from_segments(
            self.target.version.clone(),
            self.target.gphome.clone(),
            segments,
        )?))
    }

    /// Recomputes the fingerprint from the current source/target clusters.
    pub fn stamp_fingerprint(&mut self) {
        self.fingerprint = Some(Fingerprint::new(
            &self.source.version,
            &self.target.version,
            self.source.content_ids(),
            self.upgrade_id,
        ));
    }

    /// Detects catalog drift before destructive work: the persisted
    /// fingerprint must still describe the source cluster we captured.
    pub fn verify_fingerprint(&self) -> Result<(), HubError> {
        let expected = Fingerprint::new(
            &self.source.version,
            &self.target.version,
            self.source.content_ids(),
            self.upgrade_id,
        );

        match &self.fingerprint {
            Some(x) if *x == expected => Ok(()),
            _ => Err(HubError::StaleFingerprint),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpupgrade_wire_types::{Role, SegConfig};
    use tempfile::TempDir;

    fn seg(dbid: i32, content: i32, role: Role, host: &str, port: u16, dir: &str) -> SegConfig {
        SegConfig {
            dbid,
            content_id: content,
            role,
            hostname: host.into(),
            port,
            data_dir: dir.into(),
        }
    }

    #[tokio::test]
    async fn test_round_trip_through_disk() {
        let tmp = TempDir::new().unwrap();

        let mut config = Config::new(UpgradeId::from_raw(0xABCDEF12));
        config.use_link_mode = true;
        config.source = Cluster::from_segments(
            semver::Version::new(5, 28, 6),
            "/usr/local/greenplum-db-5".into(),
            vec![seg(1, -1, Role::Primary, "mdw", 5432, "/data/master/gpseg-1")],
        )
        .unwrap();
        config.stamp_fingerprint();

        config.save(tmp.path()).await.unwrap();

        let loaded = Config::load(tmp.path()).unwrap();

        assert_eq!(loaded.upgrade_id, config.upgrade_id);
        assert!(loaded.use_link_mode);
        assert_eq!(loaded.source, config.source);
        loaded.verify_fingerprint().unwrap();
    }

    #[test]
    fn test_load_or_new_without_a_saved_config() {
        let tmp = TempDir::new().unwrap();

        let config = Config::load_or_new(tmp.path()).unwrap();

        assert!(config.source.primaries.is_empty());
    }

    #[test]
    fn test_fingerprint_detects_drift() {
        let mut config = Config::new(UpgradeId::from_raw(1));
        config.source = Cluster::from_segments(
            semver::Version::new(5, 28, 6),
            "/usr/local/greenplum-db-5".into(),
            vec![seg(1, -1, Role::Primary, "mdw", 5432, "/data/master/gpseg-1")],
        )
        .unwrap();
        config.stamp_fingerprint();

        config.source.primaries.insert(
            0,
            seg(2, 0, Role::Primary, "sdw1", 25432, "/data/dbfast1/seg1"),
        );

        assert!(matches!(
            config.verify_fingerprint(),
            Err(HubError::StaleFingerprint)
        ));
    }
}
