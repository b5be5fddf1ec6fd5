// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! In-place rewrites of segment configuration files after the data
//! directories move. Every rewrite leaves a `.bak` copy of the original and
//! replaces the file through a rename, never a truncating write.

use crate::FsError;
use regex::Regex;
use std::path::Path;
use tokio::fs;

async fn rewrite(path: &Path, pattern: &str, replacement: &str) -> Result<(), FsError> {
    let contents = fs::read_to_string(path).await?;

    // The patterns are built from validated integers and fixed text, so
    // compilation cannot fail at runtime.
    let re = Regex::new(pattern).map_err(|e| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;

    let rewritten = re.replace_all(&contents, replacement).into_owned();

    let bak = path.with_extension("conf.bak");
    gpupgrade_utils::atomically_write(bak, contents.into_bytes()).await?;
    gpupgrade_utils::atomically_write(path.to_path_buf(), rewritten.into_bytes()).await?;

    Ok(())
}

/// Rewrites the `port = N` line of a segment's `postgresql.conf` from the
/// segment's own old port to its own new port.
pub async fn update_postgresql_conf_port(
    data_dir: &Path,
    old_port: u16,
    new_port: u16,
) -> Result<(), FsError> {
    let pattern = format!(r"(?m)^(port[ \t]*=[ \t]*){}([^0-9]|$)", old_port);
    let replacement = format!("${{1}}{}${{2}}", new_port);

    rewrite(&data_dir.join("postgresql.conf"), &pattern, &replacement).await
}

/// Rewrites the primary's port inside a mirror's `recovery.conf`. Unlike
/// `postgresql.conf` the port setting is not at the start of a line there.
pub async fn update_recovery_conf_port(
    data_dir: &Path,
    old_port: u16,
    new_port: u16,
) -> Result<(), FsError> {
    let pattern = format!(r"(port[ \t]*=[ \t]*){}([^0-9]|$)", old_port);
    let replacement = format!("${{1}}{}${{2}}", new_port);

    rewrite(&data_dir.join("recovery.conf"), &pattern, &replacement).await
}

/// Points `gpperfmon.conf`'s `log_location` at the moved coordinator data
/// directory. Only needed for targets older than 7.
pub async fn update_gpperfmon_log_location(master_data_dir: &Path) -> Result<(), FsError> {
    let log_dir = master_data_dir.join("gpperfmon").join("logs");
    let conf = master_data_dir
        .join("gpperfmon")
        .join("conf")
        .join("gpperfmon.conf");

    let replacement = format!("log_location = {}", log_dir.display());

    rewrite(&conf, r"(?m)^log_location = .*$", &replacement).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write_conf(dir: &Path, name: &str, contents: &str) {
        fs::create_dir_all(dir).await.unwrap();
        fs::write(dir.join(name), contents).await.unwrap();
    }

    #[tokio::test]
    async fn test_postgresql_conf_port_rewrite() -> Result<(), FsError> {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("seg1");

        write_conf(
            &data_dir,
            "postgresql.conf",
            "listen_addresses = '*'\nport=25432 # segment port\nmax_connections = 250\n",
        )
        .await;

        update_postgresql_conf_port(&data_dir, 25432, 26432).await?;

        let out = fs::read_to_string(data_dir.join("postgresql.conf")).await.unwrap();
        assert_eq!(
            out,
            "listen_addresses = '*'\nport=26432 # segment port\nmax_connections = 250\n"
        );

        // The original survives alongside for inspection.
        assert!(data_dir.join("postgresql.conf.bak").exists());

        Ok(())
    }

    #[tokio::test]
    async fn test_port_rewrite_only_touches_whole_numbers() -> Result<(), FsError> {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("seg1");

        write_conf(
            &data_dir,
            "postgresql.conf",
            "port = 5432\ngpperfmon_port = 54320\n",
        )
        .await;

        update_postgresql_conf_port(&data_dir, 5432, 6432).await?;

        let out = fs::read_to_string(data_dir.join("postgresql.conf")).await.unwrap();
        assert_eq!(out, "port = 6432\ngpperfmon_port = 54320\n");

        Ok(())
    }

    #[tokio::test]
    async fn test_recovery_conf_rewrite_is_not_line_anchored() -> Result<(), FsError> {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("mirror1");

        write_conf(
            &data_dir,
            "recovery.conf",
            "primary_conninfo = 'user=gpadmin host=sdw1 port=25432 sslmode=prefer'\n",
        )
        .await;

        update_recovery_conf_port(&data_dir, 25432, 26432).await?;

        let out = fs::read_to_string(data_dir.join("recovery.conf")).await.unwrap();
        assert_eq!(
            out,
            "primary_conninfo = 'user=gpadmin host=sdw1 port=26432 sslmode=prefer'\n"
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_gpperfmon_log_location_rewrite() -> Result<(), FsError> {
        let tmp = TempDir::new().unwrap();
        let master = tmp.path().join("gpseg-1");

        write_conf(
            &master.join("gpperfmon").join("conf"),
            "gpperfmon.conf",
            "[GPMMON]\nlog_location = /data/master/gpseg_ABC123-1/gpperfmon/logs\nquantum = 15\n",
        )
        .await;

        update_gpperfmon_log_location(&master).await?;

        let out = fs::read_to_string(
            master.join("gpperfmon").join("conf").join("gpperfmon.conf"),
        )
        .await
        .unwrap();

        assert_eq!(
            out,
            format!(
                "[GPMMON]\nlog_location = {}\nquantum = 15\n",
                master.join("gpperfmon").join("logs").display()
            )
        );

        Ok(())
    }
}
