// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! The in-place mirror upgrade used in link mode.
//!
//! Each mirror is rebuilt from the clean template its primary left behind,
//! upgraded with `pg_upgrade` against the working template, and finished by
//! restoring the primary's `pg_control` so the checkpoint LSNs line up with
//! what the primary shipped.

use crate::{MIRROR_TEMPLATE_EXCLUDES, PgUpgradeOptions, Segment, SegmentMode, SegmentPair, UpgradeError};
use gpupgrade_cmd::{rsync::Rsync, Executor, Streams};
use gpupgrade_fs::recreate_symlink;
use gpupgrade_idl as idl;
use gpupgrade_wire_types::{user_defined, SegmentTablespaces, VersionPolicy};
use std::{io, path::Path};
use tokio::fs;

pub async fn upgrade_mirror(
    exec: &dyn Executor,
    state_dir: &Path,
    opt: &idl::PgOptions,
    streams: &Streams,
) -> Result<(), UpgradeError> {
    let tablespaces = idl::wire_tablespaces(&opt.tablespaces);
    let policy = VersionPolicy::from_source(&parse_version(&opt.source_version)?);

    rsync_template_from_primary(exec, state_dir, opt, streams).await?;
    rsync_tablespaces_from_primary(exec, state_dir, opt, &tablespaces, &policy, streams).await?;
    link_tablespaces_to_template(state_dir, opt, &tablespaces, &policy).await?;
    pg_upgrade(exec, state_dir, opt, &policy, streams).await?;
    link_tablespaces_to_mirror(state_dir, opt, &tablespaces, &policy).await?;
    restore_primary_pg_control(exec, state_dir, opt, streams).await?;

    Ok(())
}

fn parse_version(raw: &str) -> Result<semver::Version, UpgradeError> {
    semver::Version::parse(raw).map_err(|_| UpgradeError::BadVersion(raw.to_string()))
}

/// Pulls the clean template over the mirror's data directory and the working
/// template next to it, both from the primary's host.
async fn rsync_template_from_primary(
    exec: &dyn Executor,
    state_dir: &Path,
    opt: &idl::PgOptions,
    streams: &Streams,
) -> Result<(), UpgradeError> {
    Rsync::new()
        .source_host(&opt.primary_host)
        .source_contents(gpupgrade_utils::template_dir(state_dir, opt.content))
        .destination(&opt.target_data_dir)
        .options(vec!["--archive", "--delete"])
        .excludes(MIRROR_TEMPLATE_EXCLUDES.to_vec())
        .run(exec, streams)
        .await?;

    let working = gpupgrade_utils::template_working_dir(state_dir, opt.content);
    fs::create_dir_all(&working).await?;

    Rsync::new()
        .source_host(&opt.primary_host)
        .source_contents(&working)
        .destination(&working)
        .options(vec!["--archive", "--delete"])
        .excludes(MIRROR_TEMPLATE_EXCLUDES.to_vec())
        .run(exec, streams)
        .await?;

    Ok(())
}

/// Pulls the primary's staged user tablespace files onto this mirror's
/// version-specific tablespace locations.
async fn rsync_tablespaces_from_primary(
    exec: &dyn Executor,
    state_dir: &Path,
    opt: &idl::PgOptions,
    tablespaces: &SegmentTablespaces,
    policy: &VersionPolicy,
    streams: &Streams,
) -> Result<(), UpgradeError> {
    for (_, info) in user_defined(tablespaces) {
        Rsync::new()
            .source_host(&opt.primary_host)
            .source_contents(gpupgrade_utils::backup_tablespace_dir_for_primary(
                state_dir,
                opt.content,
            ))
            .destination(policy.tablespace_path(info, opt.dbid))
            .options(vec!["--archive", "--delete"])
            .run(exec, streams)
            .await?;
    }

    Ok(())
}

async fn link_tablespaces_to_template(
    state_dir: &Path,
    opt: &idl::PgOptions,
    tablespaces: &SegmentTablespaces,
    policy: &VersionPolicy,
) -> Result<(), UpgradeError> {
    let template = gpupgrade_utils::template_working_dir(state_dir, opt.content);

    for (oid, info) in user_defined(tablespaces) {
        remove_if_exists(
            &Path::new(&opt.target_data_dir)
                .join("pg_tblspc")
                .join(oid.to_string()),
        )
        .await?;

        let link = template.join("pg_tblspc").join(oid.to_string());
        ensure_parent(&link).await?;
        recreate_symlink(&policy.tablespace_path(info, opt.dbid), &link).await?;
    }

    Ok(())
}

async fn pg_upgrade(
    exec: &dyn Executor,
    state_dir: &Path,
    opt: &idl::PgOptions,
    policy: &VersionPolicy,
    streams: &Streams,
) -> Result<(), UpgradeError> {
    let mut options = PgUpgradeOptions::new(SegmentMode::Segment, policy.source_major);
    options.link_mode = opt.use_link_mode;
    options.work_dir = Some(crate::work_dir(state_dir, opt.dbid));
    options.template_datadir = Some(gpupgrade_utils::template_working_dir(state_dir, opt.content));
    options.template_port = Some(opt.target_port as u16);

    if !opt.tablespaces_mapping_file_path.is_empty() {
        options.tablespace_file = Some(opt.tablespaces_mapping_file_path.clone().into());
    }

    let pair = SegmentPair {
        source: Segment {
            bindir: opt.source_bindir.clone().into(),
            data_dir: opt.source_data_dir.clone().into(),
            dbid: opt.dbid,
            port: opt.source_port as u16,
        },
        target: Segment {
            bindir: opt.target_bindir.clone().into(),
            data_dir: opt.target_data_dir.clone().into(),
            dbid: opt.dbid,
            port: opt.target_port as u16,
        },
    };

    crate::run(exec, &pair, opt.content, &options, streams).await
}

async fn link_tablespaces_to_mirror(
    state_dir: &Path,
    opt: &idl::PgOptions,
    tablespaces: &SegmentTablespaces,
    policy: &VersionPolicy,
) -> Result<(), UpgradeError> {
    let template = gpupgrade_utils::template_working_dir(state_dir, opt.content);

    for (oid, info) in user_defined(tablespaces) {
        remove_if_exists(&template.join("pg_tblspc").join(oid.to_string())).await?;

        let link = Path::new(&opt.target_data_dir)
            .join("pg_tblspc")
            .join(oid.to_string());
        ensure_parent(&link).await?;
        recreate_symlink(&policy.tablespace_path(info, opt.dbid), &link).await?;
    }

    Ok(())
}

/// Copies the pg_control the primary snapshotted after its own upgrade onto
/// this mirror.
async fn restore_primary_pg_control(
    exec: &dyn Executor,
    state_dir: &Path,
    opt: &idl::PgOptions,
    streams: &Streams,
) -> Result<(), UpgradeError> {
    Rsync::new()
        .source_host(&opt.primary_host)
        .source_path(
            gpupgrade_utils::backup_mirror_dir(state_dir, opt.content)
                .join("global")
                .join("pg_control"),
        )
        .destination(
            Path::new(&opt.target_data_dir)
                .join("global")
                .join("pg_control"),
        )
        .options(vec!["--archive"])
        .run(exec, streams)
        .await?;

    Ok(())
}

async fn ensure_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).await,
        None => Ok(()),
    }
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
