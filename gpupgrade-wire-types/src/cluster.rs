// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
};

/// The coordinator's content id.
pub const MASTER_CONTENT_ID: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Mirror,
}

impl Role {
    /// The single-character role code used by `gp_segment_configuration`.
    pub fn code(self) -> &'static str {
        match self {
            Self::Primary => "p",
            Self::Mirror => "m",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// One segment's location within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SegConfig {
    pub dbid: i32,
    pub content_id: i32,
    pub role: Role,
    pub hostname: String,
    pub port: u16,
    pub data_dir: PathBuf,
}

impl SegConfig {
    pub fn is_master(&self) -> bool {
        self.content_id == MASTER_CONTENT_ID && self.role == Role::Primary
    }

    pub fn is_standby(&self) -> bool {
        self.content_id == MASTER_CONTENT_ID && self.role == Role::Mirror
    }

    pub fn is_primary(&self) -> bool {
        self.content_id != MASTER_CONTENT_ID && self.role == Role::Primary
    }

    pub fn is_mirror(&self) -> bool {
        self.content_id != MASTER_CONTENT_ID && self.role == Role::Mirror
    }

    pub fn is_on_host(&self, hostname: &str) -> bool {
        self.hostname == hostname
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("duplicate dbid {0} in segment configuration")]
    DuplicateDbid(i32),
    #[error("duplicate (content, role) pair ({content}, {role}) in segment configuration")]
    DuplicateContentRole { content: i32, role: Role },
    #[error("cluster has no coordinator (content id -1)")]
    NoMaster,
}

/// A snapshot of one running database topology.
///
/// `primaries` and `mirrors` are keyed by content id; the coordinator is
/// `primaries[-1]` and the standby, when present, is `mirrors[-1]`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Cluster {
    pub version: semver::Version,
    pub gphome: PathBuf,
    pub primaries: BTreeMap<i32, SegConfig>,
    pub mirrors: BTreeMap<i32, SegConfig>,
}

impl Default for Cluster {
    fn default() -> Self {
        Self {
            version: semver::Version::new(0, 0, 0),
            gphome: PathBuf::new(),
            primaries: BTreeMap::new(),
            mirrors: BTreeMap::new(),
        }
    }
}

impl Cluster {
    /// Builds a cluster from a flat segment list, enforcing dbid and
    /// (content, role) uniqueness.
    pub fn from_segments(
        version: semver::Version,
        gphome: PathBuf,
        segments: impl IntoIterator<Item = SegConfig>,
    ) -> Result<Self, ClusterError> {
        let mut primaries = BTreeMap::new();
        let mut mirrors = BTreeMap::new();
        let mut dbids = BTreeSet::new();

        for seg in segments {
            if !dbids.insert(seg.dbid) {
                return Err(ClusterError::DuplicateDbid(seg.dbid));
            }

            let map = match seg.role {
                Role::Primary => &mut primaries,
                Role::Mirror => &mut mirrors,
            };

            if let Some(old) = map.insert(seg.content_id, seg) {
                return Err(ClusterError::DuplicateContentRole {
                    content: old.content_id,
                    role: old.role,
                });
            }
        }

        if !primaries.contains_key(&MASTER_CONTENT_ID) {
            return Err(ClusterError::NoMaster);
        }

        Ok(Self {
            version,
            gphome,
            primaries,
            mirrors,
        })
    }

    pub fn master(&self) -> &SegConfig {
        &self.primaries[&MASTER_CONTENT_ID]
    }

    pub fn standby(&self) -> Option<&SegConfig> {
        self.mirrors.get(&MASTER_CONTENT_ID)
    }

    pub fn master_data_dir(&self) -> &Path {
        &self.master().data_dir
    }

    pub fn master_port(&self) -> u16 {
        self.master().port
    }

    pub fn master_hostname(&self) -> &str {
        &self.master().hostname
    }

    pub fn has_standby(&self) -> bool {
        self.standby().is_some()
    }

    pub fn has_mirrors(&self) -> bool {
        self.mirrors.keys().any(|content| *content != MASTER_CONTENT_ID)
    }

    /// Every primary must have a mirror and the coordinator a standby for the
    /// source to be restorable from replicas.
    pub fn has_all_mirrors_and_standby(&self) -> bool {
        self.primaries.keys().all(|content| self.mirrors.contains_key(content))
    }

    /// Content ids, coordinator included.
    pub fn content_ids(&self) -> Vec<i32> {
        self.primaries.keys().copied().collect()
    }

    pub fn select<'a>(&'a self, pred: impl Fn(&SegConfig) -> bool + 'a) -> Vec<&'a SegConfig> {
        self.primaries
            .values()
            .chain(self.mirrors.values())
            .filter(|seg| pred(seg))
            .collect()
    }

    /// The distinct hostnames an agent must run on: every host holding a
    /// segment other than the coordinator itself. The coordinator host is
    /// excluded unless it also holds primaries, mirrors, or the standby.
    pub fn agent_hosts(&self) -> Vec<String> {
        let hosts: BTreeSet<String> = self
            .primaries
            .values()
            .chain(self.mirrors.values())
            .filter(|seg| !seg.is_master())
            .map(|seg| seg.hostname.clone())
            .collect();

        hosts.into_iter().collect()
    }

    pub fn segments_on_host<'a>(&'a self, hostname: &'a str) -> Vec<&'a SegConfig> {
        self.select(move |seg| seg.is_on_host(hostname))
    }
}

/// The prospective target cluster layout produced during initialize, before
/// the catalog rewrite makes the target mirror the source topology.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InitializeConfig {
    pub master: Option<SegConfig>,
    pub standby: Option<SegConfig>,
    pub primaries: Vec<SegConfig>,
    pub mirrors: Vec<SegConfig>,
}

impl InitializeConfig {
    /// All assigned ports, used to compute the contiguous range to probe.
    pub fn ports(&self) -> Vec<u16> {
        self.master
            .iter()
            .chain(self.standby.iter())
            .chain(self.primaries.iter())
            .chain(self.mirrors.iter())
            .map(|seg| seg.port)
            .collect()
    }

    pub fn primary_for_content(&self, content: i32) -> Option<&SegConfig> {
        self.primaries.iter().find(|seg| seg.content_id == content)
    }
}

/// True when both maps contain exactly the same content ids.
pub fn contents_match(src: &BTreeMap<i32, SegConfig>, dst: &BTreeSet<i32>) -> bool {
    src.len() == dst.len() && src.keys().all(|content| dst.contains(content))
}
