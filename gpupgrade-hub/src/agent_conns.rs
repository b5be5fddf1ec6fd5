// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! Lazily established, cached hub→agent connections.
//!
//! One persistent connection per distinct agent hostname. Cached
//! connections are health-checked on reuse with a short retry window;
//! hosts that never come ready surface as one distinguishable error class.

use crate::HubError;
use gpupgrade_idl::agent_client::AgentClient;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const READY_ATTEMPTS: u32 = 3;
const READY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct AgentConn {
    pub hostname: String,
    endpoint: Endpoint,
    pub client: AgentClient<Channel>,
}

fn endpoint(hostname: &str, port: u16) -> Result<Endpoint, HubError> {
    let endpoint = Endpoint::from_shared(format!("http://{}:{}", hostname, port))
        .map_err(HubError::Transport)?
        .connect_timeout(DIAL_TIMEOUT);

    Ok(endpoint)
}

/// Dials every host, retrying briefly; hosts that never come ready are
/// reported together in a single [`HubError::AgentsNotReady`].
pub async fn connect(hostnames: &[String], port: u16) -> Result<Vec<AgentConn>, HubError> {
    let mut conns = vec![];
    let mut unreachable = vec![];

    for hostname in hostnames {
        let endpoint = endpoint(hostname, port)?;

        match dial(hostname, &endpoint).await {
            Some(channel) => conns.push(AgentConn {
                hostname: hostname.clone(),
                endpoint,
                client: AgentClient::new(channel),
            }),
            None => unreachable.push(hostname.clone()),
        }
    }

    if !unreachable.is_empty() {
        return Err(HubError::AgentsNotReady(unreachable.join(",")));
    }

    Ok(conns)
}

/// Re-probes a cached connection set; every host must answer a fresh dial
/// within the retry window.
pub async fn ensure_ready(conns: &[AgentConn]) -> Result<(), HubError> {
    let mut unreachable = vec![];

    for conn in conns {
        if dial(&conn.hostname, &conn.endpoint).await.is_none() {
            unreachable.push(conn.hostname.clone());
        }
    }

    if !unreachable.is_empty() {
        return Err(HubError::AgentsNotReady(unreachable.join(",")));
    }

    Ok(())
}

async fn dial(hostname: &str, endpoint: &Endpoint) -> Option<Channel> {
    for attempt in 0..READY_ATTEMPTS {
        match endpoint.connect().await {
            Ok(channel) => return Some(channel),
            Err(e) => {
                tracing::debug!(?e, attempt, hostname, "agent not ready");

                tokio::time::sleep(READY_DELAY).await;
            }
        }
    }

    None
}
