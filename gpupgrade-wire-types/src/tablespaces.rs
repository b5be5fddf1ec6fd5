// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

use std::{collections::BTreeMap, path::PathBuf};

/// One tablespace as seen by one segment.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TablespaceInfo {
    pub name: String,
    pub location: PathBuf,
    pub user_defined: bool,
}

/// oid → tablespace, for a single dbid.
pub type SegmentTablespaces = BTreeMap<u32, TablespaceInfo>;

/// dbid → oid → tablespace, captured from the source catalog during
/// initialize and read-only thereafter.
pub type Tablespaces = BTreeMap<i32, SegmentTablespaces>;

/// Renders the mapping file consumed by `pg_upgrade --old-tablespaces-file`:
/// one `dbid,oid,location` line per entry, user-defined tablespaces only.
pub fn render_mapping_file(tablespaces: &Tablespaces) -> String {
    let mut out = String::new();

    for (dbid, spaces) in tablespaces {
        for (oid, info) in spaces {
            if !info.user_defined {
                continue;
            }

            out.push_str(&format!("{},{},{}\n", dbid, oid, info.location.display()));
        }
    }

    out
}

/// User-defined tablespaces for one dbid, in oid order.
pub fn user_defined(spaces: &SegmentTablespaces) -> Vec<(u32, &TablespaceInfo)> {
    spaces
        .iter()
        .filter(|(_, info)| info.user_defined)
        .map(|(oid, info)| (*oid, info))
        .collect()
}
