//! Runs the address resolution chain for each machine.

use super::arp;
use super::probe::Probe;
use super::sweep::{sweep_subnet, SweepOptions};
use super::{
    is_usable, or_cancel, Cancelled, Confidence, LocationCache, MacAddress, MachineLocation,
    Subnet,
};
use crate::core::machine::{MachineId, MachineRecord, PowerState};
use crate::platform::Virtualization;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resolver policy.
#[derive(Clone, Debug)]
pub struct ResolverOptions {
    /// Start stopped machines to discover their addresses, then stop them again.
    pub auto_start: bool,
    /// How long to wait for a started machine to boot.
    pub boot_wait: Duration,
    /// Subnets to sweep. When empty, the /24 around the default gateway is swept.
    pub subnets: Vec<Subnet>,
    pub sweep: SweepOptions,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            auto_start: false,
            boot_wait: Duration::from_secs(30),
            subnets: Vec::new(),
            sweep: SweepOptions::default(),
        }
    }
}

/// Finds machine addresses, strongest technique first:
///
/// 1. the guest agent's report ([Confidence::AgentReported])
/// 2. an address from earlier in the run that still answers ([Confidence::Cached])
/// 3. the neighbor table, by hardware address ([Confidence::ArpMatch])
/// 4. a ping sweep followed by a neighbor table lookup ([Confidence::PingCorrelated])
///
/// A stopped machine is [Confidence::Unresolved] unless [ResolverOptions::auto_start] is set, in
/// which case it is started, resolved, and stopped again.
pub struct Resolver {
    probe: Arc<dyn Probe>,
    platform: Arc<dyn Virtualization>,
    options: ResolverOptions,
}

impl Resolver {
    pub fn new(
        probe: Arc<dyn Probe>,
        platform: Arc<dyn Virtualization>,
        options: ResolverOptions,
    ) -> Self {
        Self {
            probe,
            platform,
            options,
        }
    }

    /// Resolves a single machine.
    ///
    /// Failures in individual stages are logged and fall through to the next stage; the only error
    /// is cancellation. If this call started the machine, the machine is stopped again before it
    /// returns, cancelled or not.
    pub async fn resolve(
        &self,
        machine: &MachineRecord,
        cache: &LocationCache,
        cancel: &CancellationToken,
    ) -> Result<MachineLocation, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let macs = hardware_addresses(machine);
        let power = match or_cancel(self.platform.power_state(&machine.id), cancel).await? {
            Ok(power) => power,
            Err(e) => {
                debug!(machine = %machine.id, "could not read power state: {e:#}");
                machine.power
            }
        };

        if !power.is_off() {
            return self.resolve_running(machine, &macs, cache, cancel).await;
        }
        if !self.options.auto_start {
            debug!(machine = %machine.id, "machine is stopped; not resolving");
            return Ok(MachineLocation::unresolved(macs.first().copied()));
        }

        info!(machine = %machine.id, "starting machine to discover its address");
        if let Err(e) = self
            .platform
            .set_power_state(&machine.id, PowerState::Running)
            .await
        {
            warn!(machine = %machine.id, "could not start machine: {e:#}");
            return Ok(MachineLocation::unresolved(macs.first().copied()));
        }
        let guard = PowerGuard::new(self.platform.clone(), machine.id.clone());

        let outcome = async {
            match or_cancel(
                self.platform
                    .wait_until_reachable(&machine.id, self.options.boot_wait),
                cancel,
            )
            .await?
            {
                Ok(true) => {}
                Ok(false) => debug!(machine = %machine.id, "machine did not finish booting in time"),
                Err(e) => debug!(machine = %machine.id, "wait for boot failed: {e:#}"),
            }
            self.resolve_running(machine, &macs, cache, cancel).await
        }
        .await;

        guard.restore().await;
        outcome
    }

    async fn resolve_running(
        &self,
        machine: &MachineRecord,
        macs: &[MacAddress],
        cache: &LocationCache,
        cancel: &CancellationToken,
    ) -> Result<MachineLocation, Cancelled> {
        let id = &machine.id;
        let mac = macs.first().copied();

        match or_cancel(self.platform.reported_addresses(id), cancel).await? {
            Ok(addresses) => {
                if let Some(address) = first_usable(&addresses) {
                    debug!(machine = %id, %address, "guest agent reported address");
                    return Ok(MachineLocation::found(address, Confidence::AgentReported, mac));
                }
            }
            Err(e) => debug!(machine = %id, "guest agent unavailable: {e:#}"),
        }

        if let Some(address) = cache.get(id) {
            if self.still_answers(address, macs, cancel).await? {
                debug!(machine = %id, %address, "cached address still answers");
                return Ok(MachineLocation::found(address, Confidence::Cached, mac));
            }
        }

        if macs.is_empty() {
            debug!(machine = %id, "no hardware address to search for");
            return Ok(MachineLocation::unresolved(None));
        }

        match or_cancel(self.probe.neighbors(), cancel).await? {
            Ok(neighbors) => {
                if let Some(found) = arp::find_by_hardware(&neighbors, macs) {
                    debug!(machine = %id, address = %found.address, "found in neighbor table");
                    return Ok(MachineLocation::found(
                        found.address,
                        Confidence::ArpMatch,
                        Some(found.hardware_address),
                    ));
                }
            }
            Err(e) => warn!("{e:#}"),
        }

        let subnets = match self.options.subnets.is_empty() {
            false => self.options.subnets.clone(),
            true => or_cancel(self.probe.default_subnet(), cancel)
                .await?
                .into_iter()
                .collect(),
        };
        for subnet in subnets {
            let found = sweep_subnet(
                self.probe.clone(),
                subnet,
                macs,
                &self.options.sweep,
                cancel,
            )
            .await?;
            if let Some(found) = found {
                debug!(machine = %id, address = %found.address, "found by ping sweep");
                return Ok(MachineLocation::found(
                    found.address,
                    Confidence::PingCorrelated,
                    Some(found.hardware_address),
                ));
            }
        }

        info!(machine = %id, "could not resolve address");
        Ok(MachineLocation::unresolved(mac))
    }

    // A cached address is only trusted if it answers a ping and, when the neighbor table knows the
    // address, its hardware address still belongs to this machine.
    async fn still_answers(
        &self,
        address: Ipv4Addr,
        macs: &[MacAddress],
        cancel: &CancellationToken,
    ) -> Result<bool, Cancelled> {
        let timeout = self.options.sweep.ping_timeout;
        if !or_cancel(self.probe.ping(address, timeout), cancel).await? {
            return Ok(false);
        }
        if macs.is_empty() {
            return Ok(true);
        }
        match or_cancel(self.probe.neighbors(), cancel).await? {
            Ok(neighbors) => Ok(match arp::hardware_for(&neighbors, address) {
                Some(mac) => macs.contains(&mac),
                None => true,
            }),
            Err(_) => Ok(true),
        }
    }

    /// Resolves many machines with at most `workers` in flight.
    ///
    /// Results are returned in the order of `machines`. If `cancel` fires, in-flight workers are
    /// allowed to finish restoring power states before [Cancelled] is returned.
    pub async fn resolve_all(
        self: &Arc<Self>,
        machines: Vec<MachineRecord>,
        cache: Arc<LocationCache>,
        workers: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<(MachineId, MachineLocation)>, Cancelled> {
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut tasks = JoinSet::new();
        for (index, machine) in machines.into_iter().enumerate() {
            let resolver = self.clone();
            let cache = cache.clone();
            let cancel = cancel.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => resolver.resolve(&machine, &cache, &cancel).await,
                    Err(_) => Err(Cancelled),
                };
                (index, machine, result)
            });
        }

        let mut results = Vec::new();
        let mut cancelled = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, machine, Ok(location))) => results.push((index, machine.id, location)),
                Ok((_, _, Err(Cancelled))) => cancelled = true,
                Err(e) => warn!("address resolution worker failed: {e}"),
            }
        }
        if cancelled {
            return Err(Cancelled);
        }

        results.sort_by_key(|(index, _, _)| *index);
        Ok(results
            .into_iter()
            .map(|(_, id, location)| (id, location))
            .collect())
    }
}

fn hardware_addresses(machine: &MachineRecord) -> Vec<MacAddress> {
    machine
        .hardware_addresses
        .iter()
        .filter_map(|raw| match raw.parse() {
            Ok(mac) => Some(mac),
            Err(e) => {
                warn!(machine = %machine.id, "{e}");
                None
            }
        })
        .collect()
}

fn first_usable(addresses: &[IpAddr]) -> Option<Ipv4Addr> {
    addresses.iter().find_map(|address| match address {
        IpAddr::V4(v4) if is_usable(address) => Some(*v4),
        _ => None,
    })
}

// Stops a machine that resolution started. Call [PowerGuard::restore]; if the guard is dropped
// without it (the resolving future was dropped), restoration is spawned onto the runtime instead.
struct PowerGuard {
    platform: Arc<dyn Virtualization>,
    machine: MachineId,
    armed: bool,
}

impl PowerGuard {
    fn new(platform: Arc<dyn Virtualization>, machine: MachineId) -> Self {
        Self {
            platform,
            machine,
            armed: true,
        }
    }

    async fn restore(mut self) {
        self.armed = false;
        stop(self.platform.clone(), self.machine.clone()).await;
    }
}

impl Drop for PowerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(stop(self.platform.clone(), self.machine.clone()));
        } else {
            warn!(machine = %self.machine, "no runtime to stop machine; it was left running");
        }
    }
}

async fn stop(platform: Arc<dyn Virtualization>, machine: MachineId) {
    match platform.set_power_state(&machine, PowerState::Stopped).await {
        Ok(()) => info!(machine = %machine, "stopped machine again"),
        Err(e) => warn!(machine = %machine, "could not stop machine again: {e:#}"),
    }
}

#[cfg(test)]
mod test;
