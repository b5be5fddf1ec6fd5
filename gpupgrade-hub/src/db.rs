// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Catalog access. Connections are always opened in utility mode so the
//! coordinator's distributed locking is bypassed; callers must ensure the
//! coordinator is running in that mode first.

use crate::HubError;
use gpupgrade_wire_types::{
    Cluster, Role, SegConfig, SegmentTablespaces, Tablespaces, TablespaceInfo, VersionPolicy,
};
use std::path::PathBuf;
use tokio_postgres::{Client, NoTls};

pub async fn connect_utility(port: u16, allow_system_mods: bool) -> Result<Client, HubError> {
    let user = std::env::var("PGUSER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "gpadmin".to_string());

    let mut options = String::from("-c gp_session_role=utility");
    if allow_system_mods {
        options.push_str(" -c allow_system_table_mods=on");
    }

    let mut config = tokio_postgres::Config::new();
    config
        .host("localhost")
        .port(port)
        .user(&user)
        .dbname("template1")
        .options(&options);

    let (client, connection) = config.connect(NoTls).await?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(?e, "database connection closed");
        }
    });

    Ok(client)
}

/// The segment configuration query, which differs across major versions:
/// before 6 the data directory lives in the filespace catalog.
pub fn segment_configuration_query(policy: &VersionPolicy) -> &'static str {
    if policy.legacy_tablespace_layout {
        "SELECT s.dbid::int, s.content::int, s.role::text, s.port::int, s.hostname::text, e.fselocation::text AS datadir \
         FROM gp_segment_configuration s \
         JOIN pg_filespace_entry e ON s.dbid = e.fsedbid \
         JOIN pg_filespace f ON e.fsefsoid = f.oid \
         WHERE f.fsname = 'pg_system' \
         ORDER BY s.content, s.role"
    } else {
        "SELECT dbid::int, content::int, role::text, port::int, hostname::text, datadir::text \
         FROM gp_segment_configuration \
         ORDER BY content, role"
    }
}

/// Captures the source topology from `gp_segment_configuration`.
pub async fn load_cluster(
    client: &Client,
    version: semver::Version,
    gphome: PathBuf,
) -> Result<Cluster, HubError> {
    let policy = VersionPolicy::from_source(&version);
    let rows = client.query(segment_configuration_query(&policy), &[]).await?;

    let mut segments = vec![];

    for row in rows {
        let role: String = row.get("role");

        segments.push(SegConfig {
            dbid: row.get::<_, i32>("dbid"),
            content_id: row.get::<_, i32>("content"),
            role: if role == "p" { Role::Primary } else { Role::Mirror },
            hostname: row.get("hostname"),
            port: row.get::<_, i32>("port") as u16,
            data_dir: PathBuf::from(row.get::<_, String>("datadir")),
        });
    }

    Ok(Cluster::from_segments(version, gphome, segments)?)
}

/// Captures the per-dbid tablespace map from the source catalog. Only the
/// pre-6 filespace catalog needs this; newer sources let `pg_upgrade` manage
/// tablespaces itself.
pub async fn load_tablespaces(
    client: &Client,
    policy: &VersionPolicy,
) -> Result<Tablespaces, HubError> {
    if !policy.legacy_tablespace_layout {
        return Ok(Tablespaces::new());
    }

    let rows = client
        .query(
            "SELECT e.fsedbid::int AS dbid, t.oid::int AS oid, t.spcname::text AS name, \
                    e.fselocation::text AS location, \
                    (t.spcname NOT IN ('pg_default', 'pg_global')) AS user_defined \
             FROM pg_tablespace t \
             JOIN pg_filespace_entry e ON t.spcfsoid = e.fsefsoid \
             ORDER BY e.fsedbid, t.oid",
            &[],
        )
        .await?;

    let mut tablespaces = Tablespaces::new();

    for row in rows {
        let dbid: i32 = row.get("dbid");
        let oid: i32 = row.get("oid");

        tablespaces
            .entry(dbid)
            .or_insert_with(SegmentTablespaces::new)
            .insert(
                oid as u32,
                TablespaceInfo {
                    name: row.get("name"),
                    location: PathBuf::from(row.get::<_, String>("location")),
                    user_defined: row.get("user_defined"),
                },
            );
    }

    Ok(tablespaces)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_selection_by_version() {
        let five = VersionPolicy::from_source(&semver::Version::new(5, 28, 6));
        let six = VersionPolicy::from_source(&semver::Version::new(6, 21, 0));

        assert!(segment_configuration_query(&five).contains("pg_filespace_entry"));
        assert!(!segment_configuration_query(&six).contains("pg_filespace_entry"));
    }
}
