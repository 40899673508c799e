//! Interfaces to the two remote systems: the virtualization platform that hosts the machines and
//! the remote-desktop broker that holds the connections.
//!
//! The library never talks HTTP itself. Callers supply implementations of [Virtualization] and
//! [Broker]; every remote side effect flows through them.

use crate::core::machine::{ActualConnection, ConnectionId, MachineId, MachineRecord, PowerState};
use crate::core::spec::{DesiredConnectionSpec, Protocol};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// The virtualization platform.
#[async_trait]
pub trait Virtualization: Send + Sync {
    async fn list_machines(&self) -> anyhow::Result<Vec<MachineRecord>>;

    /// Returns the machine's free-form annotation (its notes).
    async fn read_annotation(&self, machine: &MachineId) -> anyhow::Result<String>;

    async fn write_annotation(&self, machine: &MachineId, text: &str) -> anyhow::Result<()>;

    /// Returns every address the guest agent reports, unfiltered. An empty list means the agent
    /// reported nothing.
    async fn reported_addresses(&self, machine: &MachineId) -> anyhow::Result<Vec<IpAddr>>;

    async fn power_state(&self, machine: &MachineId) -> anyhow::Result<PowerState>;

    async fn set_power_state(&self, machine: &MachineId, state: PowerState) -> anyhow::Result<()>;

    /// Waits up to `timeout` for the machine to finish booting. Returns `false` on timeout.
    async fn wait_until_reachable(
        &self,
        machine: &MachineId,
        timeout: Duration,
    ) -> anyhow::Result<bool>;
}

/// Everything the broker needs to create or update a connection.
#[derive(Clone, PartialEq)]
pub struct ConnectionRequest {
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Protocol and wake-on-LAN parameters.
    pub parameters: IndexMap<String, String>,
    /// Identifier of the group to file the connection under, if any.
    pub group: Option<String>,
    /// The machine the connection is for. The broker should store this with the connection.
    pub source_tag: MachineId,
}

impl ConnectionRequest {
    pub fn new(spec: &DesiredConnectionSpec, password: String, group: Option<String>) -> Self {
        Self {
            name: spec.name.clone(),
            protocol: spec.protocol,
            host: spec.host_string(),
            port: spec.port,
            username: spec.username.clone(),
            password,
            parameters: spec.parameters(),
            group,
            source_tag: spec.owner.clone(),
        }
    }
}

impl fmt::Debug for ConnectionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRequest")
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"..")
            .field("parameters", &self.parameters)
            .field("group", &self.group)
            .field("source_tag", &self.source_tag)
            .finish()
    }
}

/// The remote-desktop broker.
///
/// Implementations must make [Broker::create] safe to retry: if a connection with the same name
/// and source tag already exists, return its ID instead of creating a second one.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Lists every connection the broker holds.
    async fn list_connections(&self) -> anyhow::Result<Vec<ActualConnection>>;

    async fn create(&self, request: &ConnectionRequest) -> anyhow::Result<ConnectionId>;

    async fn update(&self, id: &ConnectionId, request: &ConnectionRequest) -> anyhow::Result<()>;

    async fn delete(&self, id: &ConnectionId) -> anyhow::Result<()>;

    /// Returns the identifier of the group named `name`, creating it if needed.
    async fn ensure_group(&self, name: &str) -> anyhow::Result<String>;

    /// Returns the plaintext secret stored with a connection, if the broker will reveal it.
    async fn reveal_secret(&self, id: &ConnectionId) -> anyhow::Result<Option<String>>;
}

#[cfg(test)]
pub mod fixtures {
    use super::*;
    use crate::crypto;
    use anyhow::bail;
    use chrono::{TimeZone, Utc};
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex, MutexGuard};
    use tokio_util::sync::CancellationToken;

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub enum PlatformCall {
        WriteAnnotation(MachineId, String),
        SetPower(MachineId, PowerState),
        WaitUntilReachable(MachineId),
    }

    #[derive(Debug, Default)]
    struct PlatformState {
        machines: Vec<MachineRecord>,
        annotations: HashMap<MachineId, String>,
        reported: HashMap<MachineId, Vec<IpAddr>>,
        // Addresses the agent starts reporting once the machine is powered on.
        boot_addresses: HashMap<MachineId, Vec<IpAddr>>,
        power: HashMap<MachineId, PowerState>,
        calls: Vec<PlatformCall>,
        fail_reported: bool,
        fail_writes: bool,
        // Fired when any machine is powered on, to simulate a user abort mid-boot.
        cancel_on_start: Option<CancellationToken>,
    }

    // A fake virtualization platform. Records every mutating call.
    #[derive(Debug, Default)]
    pub struct TestPlatform {
        state: Mutex<PlatformState>,
    }

    impl TestPlatform {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn state(&self) -> MutexGuard<'_, PlatformState> {
            self.state.lock().unwrap()
        }

        pub fn machine(self: Arc<Self>, machine: MachineRecord, annotation: &str) -> Arc<Self> {
            {
                let mut state = self.state();
                state.power.insert(machine.id.clone(), machine.power);
                state
                    .annotations
                    .insert(machine.id.clone(), annotation.to_string());
                state.machines.push(machine);
            }
            self
        }

        pub fn reports(self: Arc<Self>, machine: &MachineId, addresses: &[&str]) -> Arc<Self> {
            let addresses = addresses.iter().map(|a| a.parse().unwrap()).collect();
            self.state().reported.insert(machine.clone(), addresses);
            self
        }

        pub fn reports_after_boot(self: Arc<Self>, machine: &MachineId, addresses: &[&str]) -> Arc<Self> {
            let addresses = addresses.iter().map(|a| a.parse().unwrap()).collect();
            self.state().boot_addresses.insert(machine.clone(), addresses);
            self
        }

        // Drops the machine's notes so reading them fails.
        pub fn unreadable(self: Arc<Self>, machine: &MachineId) -> Arc<Self> {
            self.state().annotations.remove(machine);
            self
        }

        pub fn failing_reports(self: Arc<Self>) -> Arc<Self> {
            self.state().fail_reported = true;
            self
        }

        pub fn failing_writes(self: Arc<Self>) -> Arc<Self> {
            self.state().fail_writes = true;
            self
        }

        pub fn cancel_on_start(self: Arc<Self>, token: CancellationToken) -> Arc<Self> {
            self.state().cancel_on_start = Some(token);
            self
        }

        pub fn calls(&self) -> Vec<PlatformCall> {
            self.state().calls.clone()
        }

        pub fn annotation(&self, machine: &MachineId) -> String {
            self.state()
                .annotations
                .get(machine)
                .cloned()
                .unwrap_or_default()
        }

        pub fn power(&self, machine: &MachineId) -> Option<PowerState> {
            self.state().power.get(machine).copied()
        }
    }

    #[async_trait]
    impl Virtualization for TestPlatform {
        async fn list_machines(&self) -> anyhow::Result<Vec<MachineRecord>> {
            let state = self.state();
            Ok(state
                .machines
                .iter()
                .cloned()
                .map(|mut m| {
                    m.power = state.power.get(&m.id).copied().unwrap_or(m.power);
                    m
                })
                .collect())
        }

        async fn read_annotation(&self, machine: &MachineId) -> anyhow::Result<String> {
            match self.state().annotations.get(machine) {
                Some(text) => Ok(text.clone()),
                None => bail!("no such machine: {machine}"),
            }
        }

        async fn write_annotation(&self, machine: &MachineId, text: &str) -> anyhow::Result<()> {
            let mut state = self.state();
            state
                .calls
                .push(PlatformCall::WriteAnnotation(machine.clone(), text.to_string()));
            if state.fail_writes {
                bail!("annotation write refused");
            }
            state.annotations.insert(machine.clone(), text.to_string());
            Ok(())
        }

        async fn reported_addresses(&self, machine: &MachineId) -> anyhow::Result<Vec<IpAddr>> {
            let state = self.state();
            if state.fail_reported {
                bail!("guest agent not running");
            }
            Ok(state.reported.get(machine).cloned().unwrap_or_default())
        }

        async fn power_state(&self, machine: &MachineId) -> anyhow::Result<PowerState> {
            Ok(self
                .state()
                .power
                .get(machine)
                .copied()
                .unwrap_or(PowerState::Unknown))
        }

        async fn set_power_state(&self, machine: &MachineId, power: PowerState) -> anyhow::Result<()> {
            let mut state = self.state();
            state
                .calls
                .push(PlatformCall::SetPower(machine.clone(), power));
            state.power.insert(machine.clone(), power);
            match power {
                PowerState::Running => {
                    if let Some(addresses) = state.boot_addresses.get(machine).cloned() {
                        state.reported.insert(machine.clone(), addresses);
                    }
                    if let Some(token) = &state.cancel_on_start {
                        token.cancel();
                    }
                }
                _ => {
                    state.reported.remove(machine);
                }
            }
            Ok(())
        }

        async fn wait_until_reachable(
            &self,
            machine: &MachineId,
            _timeout: Duration,
        ) -> anyhow::Result<bool> {
            self.state()
                .calls
                .push(PlatformCall::WaitUntilReachable(machine.clone()));
            Ok(true)
        }
    }

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub enum BrokerCall {
        Create(String),
        Update(ConnectionId, String),
        Delete(ConnectionId),
        EnsureGroup(String),
        RevealSecret(ConnectionId),
    }

    #[derive(Debug, Default)]
    struct BrokerState {
        connections: Vec<ActualConnection>,
        secrets: HashMap<ConnectionId, String>,
        next_id: u32,
        calls: Vec<BrokerCall>,
        // Connection names whose create or update fails.
        failing: HashSet<String>,
        fail_deletes: bool,
    }

    // A fake broker that keeps connections in memory.
    #[derive(Debug, Default)]
    pub struct TestBroker {
        state: Mutex<BrokerState>,
    }

    impl TestBroker {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn state(&self) -> MutexGuard<'_, BrokerState> {
            self.state.lock().unwrap()
        }

        // Seeds an existing connection. `created` orders duplicates: higher is newer.
        pub fn existing(
            self: Arc<Self>,
            mut connection: ActualConnection,
            secret: &str,
            created: i64,
        ) -> Arc<Self> {
            {
                let mut state = self.state();
                connection.secret_digest = crypto::digest(secret);
                connection.created = Utc.timestamp_opt(created, 0).single();
                state
                    .secrets
                    .insert(connection.id.clone(), secret.to_string());
                state.connections.push(connection);
            }
            self
        }

        pub fn failing(self: Arc<Self>, name: &str) -> Arc<Self> {
            self.state().failing.insert(name.to_string());
            self
        }

        pub fn failing_deletes(self: Arc<Self>) -> Arc<Self> {
            self.state().fail_deletes = true;
            self
        }

        pub fn calls(&self) -> Vec<BrokerCall> {
            self.state().calls.clone()
        }

        pub fn connections(&self) -> Vec<ActualConnection> {
            self.state().connections.clone()
        }
    }

    fn to_actual(id: ConnectionId, request: &ConnectionRequest) -> ActualConnection {
        ActualConnection {
            id,
            name: request.name.clone(),
            group: request.group.clone(),
            protocol: request.protocol,
            host: request.host.clone(),
            port: request.port,
            username: request.username.clone(),
            secret_digest: crypto::digest(&request.password),
            wake_enabled: request.parameters.get("wol-send-packet").map(String::as_str)
                == Some("true"),
            source_tag: Some(request.source_tag.clone()),
            created: Some(Utc::now()),
        }
    }

    #[async_trait]
    impl Broker for TestBroker {
        async fn list_connections(&self) -> anyhow::Result<Vec<ActualConnection>> {
            Ok(self.state().connections.clone())
        }

        async fn create(&self, request: &ConnectionRequest) -> anyhow::Result<ConnectionId> {
            let mut state = self.state();
            state.calls.push(BrokerCall::Create(request.name.clone()));
            if state.failing.contains(&request.name) {
                bail!("broker rejected {}", request.name);
            }
            if let Some(existing) = state
                .connections
                .iter()
                .find(|c| c.name == request.name && c.source_tag.as_ref() == Some(&request.source_tag))
            {
                return Ok(existing.id.clone());
            }
            state.next_id += 1;
            let id = ConnectionId(format!("new-{}", state.next_id));
            state.secrets.insert(id.clone(), request.password.clone());
            state.connections.push(to_actual(id.clone(), request));
            Ok(id)
        }

        async fn update(&self, id: &ConnectionId, request: &ConnectionRequest) -> anyhow::Result<()> {
            let mut state = self.state();
            state
                .calls
                .push(BrokerCall::Update(id.clone(), request.name.clone()));
            if state.failing.contains(&request.name) {
                bail!("broker rejected {}", request.name);
            }
            let Some(index) = state.connections.iter().position(|c| &c.id == id) else {
                bail!("no such connection: {id}");
            };
            let created = state.connections[index].created;
            let mut updated = to_actual(id.clone(), request);
            updated.created = created;
            state.connections[index] = updated;
            state.secrets.insert(id.clone(), request.password.clone());
            Ok(())
        }

        async fn delete(&self, id: &ConnectionId) -> anyhow::Result<()> {
            let mut state = self.state();
            state.calls.push(BrokerCall::Delete(id.clone()));
            if state.fail_deletes {
                bail!("delete refused");
            }
            state.connections.retain(|c| &c.id != id);
            state.secrets.remove(id);
            Ok(())
        }

        async fn ensure_group(&self, name: &str) -> anyhow::Result<String> {
            self.state()
                .calls
                .push(BrokerCall::EnsureGroup(name.to_string()));
            Ok(format!("group-{name}"))
        }

        async fn reveal_secret(&self, id: &ConnectionId) -> anyhow::Result<Option<String>> {
            let mut state = self.state();
            state.calls.push(BrokerCall::RevealSecret(id.clone()));
            Ok(state.secrets.get(id).cloned())
        }
    }
}
