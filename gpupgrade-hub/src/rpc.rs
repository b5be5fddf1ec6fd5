// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Concurrent RPC fan-out with whole-fleet error aggregation.

use crate::HubError;
use futures::{future::join_all, Future};
use gpupgrade_utils::{collect_errors, ErrorList};

/// Runs `request` against every connection concurrently and aggregates all
/// independent failures, not just the first. No ordering between hosts.
///
/// Cancellation is inherited from the caller: dropping the returned future
/// drops every in-flight request.
pub async fn execute_rpc<C, F, Fut>(conns: &[C], request: F) -> Result<(), ErrorList>
where
    C: Clone,
    F: Fn(C) -> Fut,
    Fut: Future<Output = Result<(), HubError>>,
{
    let results = join_all(conns.iter().cloned().map(request)).await;

    collect_errors(results).map(drop)
}
