// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use rand::Rng;
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// Suffix appended when archiving a source data directory in place.
pub const OLD_SUFFIX: &str = "_old";

/// A 32-bit random identifier stamped into every archive and staging path of
/// one upgrade, so concurrent or repeated upgrades never collide on names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UpgradeId(u32);

impl UpgradeId {
    pub fn generate() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for UpgradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// The staging name for a target data directory created next to its source:
/// `/data/dbfast1/seg1` → `/data/dbfast1/seg1_5A3B9C01`.
///
/// The coordinator's directory keeps its trailing `-1` segment marker so the
/// prefix stays recognizable: `/data/master/gpseg-1` →
/// `/data/master/gpseg_5A3B9C01-1`.
pub fn temp_data_dir(source: &Path, id: UpgradeId) -> PathBuf {
    let name = source
        .file_name()
        .map(|x| x.to_string_lossy().into_owned())
        .unwrap_or_default();

    let staged = match name.strip_suffix("-1") {
        Some(prefix) => format!("{}_{}-1", prefix, id),
        None => format!("{}_{}", name, id),
    };

    source.with_file_name(staged)
}

/// The archive name for a source data directory:
/// `/data/dbfast1/seg1` → `/data/dbfast1/seg1_old`.
pub fn archive_data_dir(source: &Path) -> PathBuf {
    let name = source
        .file_name()
        .map(|x| x.to_string_lossy().into_owned())
        .unwrap_or_default();

    source.with_file_name(format!("{}{}", name, OLD_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_fixed_width_hex() {
        assert_eq!(UpgradeId::from_raw(0x5A3B9C01).to_string(), "5A3B9C01");
        assert_eq!(UpgradeId::from_raw(7).to_string(), "00000007");
    }

    #[test]
    fn test_temp_data_dir_for_segment() {
        let id = UpgradeId::from_raw(0xABCDEF12);

        assert_eq!(
            temp_data_dir(Path::new("/data/dbfast1/seg1"), id),
            Path::new("/data/dbfast1/seg1_ABCDEF12")
        );
    }

    #[test]
    fn test_temp_data_dir_for_coordinator_keeps_segment_marker() {
        let id = UpgradeId::from_raw(0xABCDEF12);

        assert_eq!(
            temp_data_dir(Path::new("/data/master/gpseg-1"), id),
            Path::new("/data/master/gpseg_ABCDEF12-1")
        );
    }

    #[test]
    fn test_archive_data_dir() {
        assert_eq!(
            archive_data_dir(Path::new("/data/dbfast1/seg1")),
            Path::new("/data/dbfast1/seg1_old")
        );
    }
}
