//! One-time discovery of compute nodes when the broker starts. The node set
//! found here is fixed for the life of the broker.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    ops::RangeInclusive,
    sync::Arc,
    time::Duration,
};

use futures::future::join_all;
use hashbrown::HashSet;
use tokio::time::timeout;
use tracing::{debug, info};
use typed_builder::TypedBuilder;

use crate::{
    net::{ip_addr_to_socket_addr, Endpoint, NODE_PORT},
    node::{Compute, NodeClient},
};

#[derive(Debug, Clone, TypedBuilder)]
pub struct Discovery {
    /// Host whose ports are probed.
    #[builder(default = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,
    #[builder(default = NODE_PORT..=NODE_PORT + 10)]
    pub ports: RangeInclusive<u16>,
    /// Nodes to dial regardless of the probe.
    #[builder(default)]
    pub nodes: Vec<SocketAddr>,
    /// QUIC has no refusal, so a port without a node only shows up as a
    /// handshake that never completes.
    #[builder(default = Duration::from_millis(500))]
    pub probe_timeout: Duration,
}

impl Discovery {
    /// Every address to try, explicit nodes first, without duplicates.
    pub fn candidates(&self) -> Vec<SocketAddr> {
        let mut seen = HashSet::new();
        self.nodes
            .iter()
            .copied()
            .chain(
                self.ports
                    .clone()
                    .map(|port| ip_addr_to_socket_addr(self.host, port)),
            )
            .filter(|addr| seen.insert(*addr))
            .collect()
    }

    /// Dials every candidate concurrently and keeps the ones that answer,
    /// in candidate order. Unreachable addresses are skipped.
    pub async fn discover(&self, endpoint: &Endpoint) -> Vec<Arc<dyn Compute>> {
        let probes = self.candidates().into_iter().map(|addr| async move {
            match timeout(self.probe_timeout, endpoint.connect(addr)).await {
                Ok(Ok(link)) => {
                    info!(%addr, "connected to compute node");
                    Some(Arc::new(NodeClient::new(link)) as Arc<dyn Compute>)
                }
                Ok(Err(e)) => {
                    debug!(%addr, "no compute node: {e}");
                    None
                }
                Err(_) => {
                    debug!(%addr, "no compute node: probe timed out");
                    None
                }
            }
        });
        join_all(probes).await.into_iter().flatten().collect()
    }
}
