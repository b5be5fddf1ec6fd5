// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Synthesizes the prospective target cluster: every segment gets a staging
//! data directory next to its source (suffixed with the upgrade id) and a
//! port out of a contiguous range probed free on every involved host.

use crate::HubError;
use futures::future::BoxFuture;
use gpupgrade_wire_types::{
    temp_data_dir, Cluster, InitializeConfig, SegConfig, UpgradeId, MASTER_CONTENT_ID,
};
use std::collections::BTreeSet;

const MAX_PORT_ATTEMPTS: u32 = 10;

/// Answers whether `[base, base + count)` is bindable on `hostname`.
/// Production probing goes through the agents (and a local bind for the
/// coordinator host); tests substitute a table.
pub trait PortProber: Send + Sync {
    fn check<'a>(
        &'a self,
        hostname: &'a str,
        base: u16,
        count: u16,
    ) -> BoxFuture<'a, Result<bool, HubError>>;
}

/// The number of ports the target layout needs.
fn ports_needed(source: &Cluster) -> u16 {
    let mut count = 1; // master

    if source.has_standby() {
        count += 1;
    }

    count += source.primaries.len() as u16 - 1;
    count += source
        .mirrors
        .keys()
        .filter(|content| **content != MASTER_CONTENT_ID)
        .count() as u16;

    count
}

/// Finds a contiguous free port range on every host of the cluster,
/// starting at `source master port + 1000` and advancing range by range.
pub async fn assign_port_base(
    source: &Cluster,
    prober: &dyn PortProber,
) -> Result<u16, HubError> {
    let count = ports_needed(source);
    let start = source.master_port() + 1000;

    let hosts: BTreeSet<&str> = source
        .primaries
        .values()
        .chain(source.mirrors.values())
        .map(|seg| seg.hostname.as_str())
        .collect();

    let mut base = start;

    for _ in 0..MAX_PORT_ATTEMPTS {
        let mut all_free = true;

        for host in &hosts {
            if !prober.check(host, base, count).await? {
                all_free = false;

                break;
            }
        }

        if all_free {
            return Ok(base);
        }

        base += count;
    }

    Err(HubError::NoFreePorts { base: start, count })
}

/// Builds the target layout from the source topology, an upgrade id, and an
/// assigned port base.
///
/// Port layout within the range: master, standby (if any), then primaries
/// and mirrors in content order.
pub fn generate(source: &Cluster, upgrade_id: UpgradeId, port_base: u16) -> InitializeConfig {
    let mut next_port = port_base;
    let mut take_port = || {
        let port = next_port;
        next_port += 1;

        port
    };

    let staged = |seg: &SegConfig, port: u16| SegConfig {
        port,
        data_dir: temp_data_dir(&seg.data_dir, upgrade_id),
        ..seg.clone()
    };

    let master = staged(source.master(), take_port());

    let standby = source.standby().map(|seg| staged(seg, take_port()));

    let primaries: Vec<SegConfig> = source
        .primaries
        .values()
        .filter(|seg| !seg.is_master())
        .map(|seg| staged(seg, take_port()))
        .collect();

    let mirrors: Vec<SegConfig> = source
        .mirrors
        .values()
        .filter(|seg| !seg.is_standby())
        .map(|seg| staged(seg, take_port()))
        .collect();

    InitializeConfig {
        master: Some(master),
        standby,
        primaries,
        mirrors,
    }
}

/// Renders the input file for the external cluster-init script. Mirrors are
/// included only in link mode, where the target is born with them marked
/// down rather than added afterwards.
pub fn render_gpinitsystem_config(
    intermediate: &InitializeConfig,
    include_mirrors: bool,
) -> String {
    let mut out = String::from("ARRAY_NAME=\"gpupgrade target cluster\"\nSEG_PREFIX=gpseg\nTRUSTED_SHELL=ssh\n");

    let line = |seg: &SegConfig| {
        format!(
            "{}~{}~{}~{}~{}",
            seg.hostname,
            seg.port,
            seg.data_dir.display(),
            seg.dbid,
            seg.content_id,
        )
    };

    if let Some(master) = &intermediate.master {
        out.push_str(&format!("QD_PRIMARY_ARRAY={}\n", line(master)));
    }

    out.push_str("declare -a PRIMARY_ARRAY=(\n");
    for seg in &intermediate.primaries {
        out.push_str(&format!("{}\n", line(seg)));
    }
    out.push_str(")\n");

    if include_mirrors && !intermediate.mirrors.is_empty() {
        out.push_str("declare -a MIRROR_ARRAY=(\n");
        for seg in &intermediate.mirrors {
            out.push_str(&format!("{}\n", line(seg)));
        }
        out.push_str(")\n");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use gpupgrade_wire_types::Role;
    use std::path::Path;
    use std::sync::Mutex;

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

    fn source() -> Cluster {
        Cluster::from_segments(
            semver::Version::new(5, 28, 6),
            "/usr/local/greenplum-db-5".into(),
            vec![
                seg(1, -1, Role::Primary, "mdw", 5432, "/data/master/gpseg-1"),
                seg(2, 0, Role::Primary, "sdw1", 25432, "/data/dbfast1/seg1"),
                seg(3, 1, Role::Primary, "sdw2", 25433, "/data/dbfast2/seg2"),
                seg(4, 0, Role::Mirror, "sdw2", 25434, "/data/dbfast_mirror1/seg1"),
                seg(5, 1, Role::Mirror, "sdw1", 25435, "/data/dbfast_mirror2/seg2"),
                seg(6, -1, Role::Mirror, "standby", 5433, "/data/standby"),
            ],
        )
        .unwrap()
    }

    struct TableProber {
        busy: Mutex<Vec<(String, u16)>>,
    }

    impl PortProber for TableProber {
        fn check<'a>(
            &'a self,
            hostname: &'a str,
            base: u16,
            count: u16,
        ) -> BoxFuture<'a, Result<bool, HubError>> {
            async move {
                let busy = self.busy.lock().unwrap();

                Ok(!busy
                    .iter()
                    .any(|(h, p)| h == hostname && *p >= base && *p < base + count))
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_port_base_starts_one_thousand_above_the_source() {
        let prober = TableProber {
            busy: Mutex::new(vec![]),
        };

        let base = assign_port_base(&source(), &prober).await.unwrap();

        assert_eq!(base, 6432);
    }

    #[tokio::test]
    async fn test_port_base_advances_past_a_busy_range() {
        // 6 ports are needed; one busy port on one host taints the whole
        // first range.
        let prober = TableProber {
            busy: Mutex::new(vec![("sdw2".to_string(), 6435)]),
        };

        let base = assign_port_base(&source(), &prober).await.unwrap();

        assert_eq!(base, 6438);
    }

    #[test]
    fn test_generated_layout_suffixes_directories_and_numbers_ports() {
        let id = UpgradeId::from_raw(0xABC123);

        let intermediate = generate(&source(), id, 6432);

        let master = intermediate.master.as_ref().unwrap();
        assert_eq!(master.port, 6432);
        assert_eq!(
            master.data_dir,
            Path::new("/data/master/gpseg_00ABC123-1")
        );

        let standby = intermediate.standby.as_ref().unwrap();
        assert_eq!(standby.port, 6433);

        assert_eq!(intermediate.primaries.len(), 2);
        assert_eq!(intermediate.primaries[0].port, 6434);
        assert_eq!(
            intermediate.primaries[0].data_dir,
            Path::new("/data/dbfast1/seg1_00ABC123")
        );

        assert_eq!(intermediate.mirrors.len(), 2);
        assert_eq!(intermediate.mirrors[1].port, 6437);
    }

    #[test]
    fn test_gpinitsystem_config_rendering() {
        let id = UpgradeId::from_raw(0xABC123);
        let intermediate = generate(&source(), id, 6432);

        let with_mirrors = render_gpinitsystem_config(&intermediate, true);
        assert!(with_mirrors.contains("QD_PRIMARY_ARRAY=mdw~6432~/data/master/gpseg_00ABC123-1~1~-1"));
        assert!(with_mirrors.contains("sdw1~6434~/data/dbfast1/seg1_00ABC123~2~0"));
        assert!(with_mirrors.contains("MIRROR_ARRAY"));

        let without_mirrors = render_gpinitsystem_config(&intermediate, false);
        assert!(!without_mirrors.contains("MIRROR_ARRAY"));
    }
}
