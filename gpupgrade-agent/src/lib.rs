// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

pub mod server;

use lazy_static::lazy_static;
use std::process::Command;

lazy_static! {
    /// The hostname agents report in error context, resolved once.
    pub static ref HOSTNAME: String = {
        let output = Command::new("hostname")
            .output()
            .expect("could not run hostname");

        String::from_utf8_lossy(&output.stdout).trim().to_string()
    };
}
