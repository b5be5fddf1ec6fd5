// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use crate::{CmdError, CmdSpec, Executor, Streams};
use std::path::Path;

/// The archive option set used whenever a data directory is copied whole.
pub const ARCHIVE_OPTIONS: &[&str] = &["--archive", "--compress", "--stats"];

/// Builds one `rsync` invocation. Sources and destination may carry a
/// `host:` prefix for pulls from or pushes to another host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rsync {
    sources: Vec<String>,
    source_host: Option<String>,
    destination: String,
    destination_host: Option<String>,
    options: Vec<String>,
    excludes: Vec<String>,
}

impl Rsync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a source whose *contents* are copied (trailing slash).
    pub fn source_contents(mut self, path: impl AsRef<Path>) -> Self {
        self.sources.push(format!("{}/", path.as_ref().display()));

        self
    }

    /// Adds a source copied as-is (no trailing slash).
    pub fn source_path(mut self, path: impl AsRef<Path>) -> Self {
        self.sources.push(path.as_ref().display().to_string());

        self
    }

    pub fn source_host(mut self, host: impl Into<String>) -> Self {
        self.source_host = Some(host.into());

        self
    }

    pub fn destination(mut self, path: impl AsRef<Path>) -> Self {
        self.destination = path.as_ref().display().to_string();

        self
    }

    pub fn destination_host(mut self, host: impl Into<String>) -> Self {
        self.destination_host = Some(host.into());

        self
    }

    pub fn options(mut self, options: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.options.extend(options.into_iter().map(Into::into));

        self
    }

    pub fn excludes(mut self, excludes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.excludes.extend(excludes.into_iter().map(Into::into));

        self
    }

    pub fn to_spec(&self) -> CmdSpec {
        let mut spec = CmdSpec::new("rsync").args(self.options.iter().cloned());

        for x in &self.excludes {
            spec = spec.arg(format!("--exclude={}", x));
        }

        for src in &self.sources {
            match &self.source_host {
                Some(host) => spec = spec.arg(format!("{}:{}", host, src)),
                None => spec = spec.arg(src.clone()),
            }
        }

        match &self.destination_host {
            Some(host) => spec.arg(format!("{}:{}", host, self.destination)),
            None => spec.arg(self.destination.clone()),
        }
    }

    pub async fn run(&self, exec: &dyn Executor, streams: &Streams) -> Result<(), CmdError> {
        exec.run_streamed(self.to_spec(), streams).await
    }
}
