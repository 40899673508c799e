//! Pings every host in a subnet to find a machine the neighbor table doesn't know about yet.
//!
//! Pings run concurrently, bounded by [SweepOptions::concurrency]. Each reply is checked against
//! the neighbor table as soon as it arrives, and the sweep stops at the first host whose hardware
//! address matches. Dropping the sweep's [JoinSet] aborts every ping still in flight.

use super::arp::{self, Neighbor};
use super::probe::Probe;
use super::{or_cancel, Cancelled, MacAddress, Subnet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounds on a single subnet sweep.
#[derive(Clone, Debug)]
pub struct SweepOptions {
    /// Maximum pings in flight at once.
    pub concurrency: usize,
    /// Maximum hosts probed per subnet, counted from the bottom of the range.
    pub host_limit: usize,
    pub ping_timeout: Duration,
    /// Wall-clock limit for the whole subnet.
    pub subnet_timeout: Duration,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            concurrency: 32,
            host_limit: 254,
            ping_timeout: Duration::from_millis(1000),
            subnet_timeout: Duration::from_secs(20),
        }
    }
}

/// Sweeps `subnet` looking for any of `targets`.
///
/// Returns `Ok(None)` if no responsive host matched before the sweep finished or timed out.
///
/// # Errors
///
/// Returns [Cancelled] if `cancel` fires first.
pub async fn sweep_subnet(
    probe: Arc<dyn Probe>,
    subnet: Subnet,
    targets: &[MacAddress],
    options: &SweepOptions,
    cancel: &CancellationToken,
) -> Result<Option<Neighbor>, Cancelled> {
    if targets.is_empty() {
        return Ok(None);
    }
    debug!(%subnet, "sweeping subnet");

    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut pings: JoinSet<Option<Ipv4Addr>> = JoinSet::new();
    for address in subnet.hosts().take(options.host_limit) {
        let probe = probe.clone();
        let semaphore = semaphore.clone();
        let timeout = options.ping_timeout;
        pings.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok()?;
            probe.ping(address, timeout).await.then_some(address)
        });
    }

    let search = async {
        while let Some(joined) = pings.join_next().await {
            let Ok(Some(address)) = joined else {
                continue;
            };
            match probe.neighbors().await {
                Ok(neighbors) => match arp::hardware_for(&neighbors, address) {
                    Some(mac) if targets.contains(&mac) => {
                        return Some(Neighbor {
                            address,
                            hardware_address: mac,
                        });
                    }
                    _ => {}
                },
                Err(e) => warn!("{e:#}"),
            }
        }
        None
    };

    match or_cancel(tokio::time::timeout(options.subnet_timeout, search), cancel).await? {
        Ok(found) => Ok(found),
        Err(_) => {
            debug!(%subnet, "sweep timed out");
            Ok(None)
        }
    }
}
