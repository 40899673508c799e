use super::*;
use crate::network::fixtures::TestProbe;
use crate::platform::fixtures::{PlatformCall, TestPlatform};
use pretty_assertions::assert_eq;

const MAC: &str = "52:54:00:12:34:56";

fn mac() -> MacAddress {
    MAC.parse().unwrap()
}

fn machine(power: PowerState) -> MachineRecord {
    MachineRecord {
        id: MachineId::new("pve1", 101),
        name: "web01".to_string(),
        power,
        hardware_addresses: vec![MAC.to_uppercase()],
    }
}

fn options() -> ResolverOptions {
    ResolverOptions {
        auto_start: false,
        boot_wait: Duration::ZERO,
        subnets: vec!["10.0.0.0/28".parse().unwrap()],
        sweep: SweepOptions {
            concurrency: 4,
            host_limit: 254,
            ping_timeout: Duration::from_millis(10),
            subnet_timeout: Duration::from_secs(5),
        },
    }
}

struct Fixture {
    machine: MachineRecord,
    probe: Arc<TestProbe>,
    platform: Arc<TestPlatform>,
    options: ResolverOptions,
    cache: LocationCache,
    cancel: CancellationToken,
}

impl Fixture {
    fn new(power: PowerState) -> Self {
        let machine = machine(power);
        Self {
            platform: TestPlatform::new().machine(machine.clone(), ""),
            machine,
            probe: TestProbe::new(),
            options: options(),
            cache: LocationCache::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn resolver(&self) -> Resolver {
        Resolver::new(
            self.probe.clone(),
            self.platform.clone(),
            self.options.clone(),
        )
    }

    async fn resolve(&self) -> Result<MachineLocation, Cancelled> {
        self.resolver()
            .resolve(&self.machine, &self.cache, &self.cancel)
            .await
    }

    fn power_calls(&self) -> Vec<PlatformCall> {
        self.platform
            .calls()
            .into_iter()
            .filter(|c| matches!(c, PlatformCall::SetPower(..)))
            .collect()
    }
}

mod resolve {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn agent_report_wins() {
        let mut fixture = Fixture::new(PowerState::Running);
        fixture.platform = fixture
            .platform
            .clone()
            .reports(&fixture.machine.id, &["127.0.0.1", "fe80::1", "169.254.0.9", "10.0.0.5"]);

        let location = fixture.resolve().await.unwrap();

        assert_eq!(
            MachineLocation::found(Ipv4Addr::new(10, 0, 0, 5), Confidence::AgentReported, Some(mac())),
            location,
        );
        assert_eq!(0, fixture.probe.neighbor_reads());
    }

    #[tokio::test]
    async fn ipv6_only_agent_report_falls_through() {
        let mut fixture = Fixture::new(PowerState::Running);
        fixture.platform = fixture
            .platform
            .clone()
            .reports(&fixture.machine.id, &["fe80::1", "2001:db8::5"]);
        fixture.probe = TestProbe::new().in_table(Ipv4Addr::new(10, 0, 0, 9), mac());

        let location = fixture.resolve().await.unwrap();

        assert_eq!(Confidence::ArpMatch, location.confidence);
        assert_eq!(Some(Ipv4Addr::new(10, 0, 0, 9)), location.address);
    }

    #[tokio::test]
    async fn cached_address_is_revalidated() {
        let mut fixture = Fixture::new(PowerState::Running);
        fixture.probe = TestProbe::new().responder(Ipv4Addr::new(10, 0, 0, 4), mac());
        fixture
            .cache
            .insert(fixture.machine.id.clone(), Ipv4Addr::new(10, 0, 0, 4));

        let location = fixture.resolve().await.unwrap();

        assert_eq!(Confidence::Cached, location.confidence);
        assert_eq!(Some(Ipv4Addr::new(10, 0, 0, 4)), location.address);
    }

    #[tokio::test]
    async fn stale_cache_entry_is_ignored() {
        let mut fixture = Fixture::new(PowerState::Running);
        // The cached address now belongs to a different machine.
        fixture.probe = TestProbe::new()
            .responder(Ipv4Addr::new(10, 0, 0, 4), "52:54:00:00:00:01".parse().unwrap())
            .in_table(Ipv4Addr::new(10, 0, 0, 11), mac());
        fixture
            .cache
            .insert(fixture.machine.id.clone(), Ipv4Addr::new(10, 0, 0, 4));

        let location = fixture.resolve().await.unwrap();

        assert_eq!(Confidence::ArpMatch, location.confidence);
        assert_eq!(Some(Ipv4Addr::new(10, 0, 0, 11)), location.address);
    }

    #[tokio::test]
    async fn ping_sweep_correlates_hardware_address() {
        let mut fixture = Fixture::new(PowerState::Running);
        fixture.probe = TestProbe::new()
            .responder(Ipv4Addr::new(10, 0, 0, 2), "52:54:00:00:00:02".parse().unwrap())
            .responder(Ipv4Addr::new(10, 0, 0, 9), mac());

        let location = fixture.resolve().await.unwrap();

        assert_eq!(
            MachineLocation::found(Ipv4Addr::new(10, 0, 0, 9), Confidence::PingCorrelated, Some(mac())),
            location,
        );
    }

    #[tokio::test]
    async fn sweeps_default_subnet_when_none_configured() {
        let mut fixture = Fixture::new(PowerState::Running);
        fixture.options.subnets.clear();
        fixture.probe = TestProbe::new()
            .default_subnet_of("10.0.0.0/28".parse().unwrap())
            .responder(Ipv4Addr::new(10, 0, 0, 9), mac());

        let location = fixture.resolve().await.unwrap();

        assert_eq!(Confidence::PingCorrelated, location.confidence);
    }

    #[tokio::test]
    async fn every_stage_failing_is_unresolved() {
        let mut fixture = Fixture::new(PowerState::Running);
        fixture.platform = fixture.platform.clone().failing_reports();
        fixture.probe = TestProbe::new().failing_neighbors();

        let location = fixture.resolve().await.unwrap();

        assert_eq!(MachineLocation::unresolved(Some(mac())), location);
    }

    #[tokio::test]
    async fn stopped_machine_without_auto_start_is_unresolved() {
        let mut fixture = Fixture::new(PowerState::Stopped);
        fixture.probe = TestProbe::new().in_table(Ipv4Addr::new(10, 0, 0, 9), mac());

        let location = fixture.resolve().await.unwrap();

        assert_eq!(MachineLocation::unresolved(Some(mac())), location);
        assert!(fixture.power_calls().is_empty());
        assert_eq!(0, fixture.probe.neighbor_reads());
    }

    #[tokio::test]
    async fn auto_start_boots_resolves_and_restores() {
        let mut fixture = Fixture::new(PowerState::Stopped);
        fixture.options.auto_start = true;
        fixture.platform = fixture
            .platform
            .clone()
            .reports_after_boot(&fixture.machine.id, &["10.0.0.7"]);

        let location = fixture.resolve().await.unwrap();

        assert_eq!(Confidence::AgentReported, location.confidence);
        assert_eq!(Some(Ipv4Addr::new(10, 0, 0, 7)), location.address);
        let id = fixture.machine.id.clone();
        assert_eq!(
            vec![
                PlatformCall::SetPower(id.clone(), PowerState::Running),
                PlatformCall::SetPower(id.clone(), PowerState::Stopped),
            ],
            fixture.power_calls(),
        );
        assert_eq!(Some(PowerState::Stopped), fixture.platform.power(&id));
    }

    #[tokio::test]
    async fn auto_start_restores_power_when_resolution_fails() {
        let mut fixture = Fixture::new(PowerState::Stopped);
        fixture.options.auto_start = true;
        fixture.platform = fixture.platform.clone().failing_reports();
        fixture.probe = TestProbe::new().failing_neighbors();

        let location = fixture.resolve().await.unwrap();

        assert!(!location.is_resolved());
        assert_eq!(
            Some(PowerState::Stopped),
            fixture.platform.power(&fixture.machine.id),
        );
        assert_eq!(2, fixture.power_calls().len());
    }

    #[tokio::test]
    async fn auto_start_restores_power_when_cancelled_mid_boot() {
        let mut fixture = Fixture::new(PowerState::Stopped);
        fixture.options.auto_start = true;
        fixture.platform = fixture
            .platform
            .clone()
            .cancel_on_start(fixture.cancel.clone());

        let result = fixture.resolve().await;

        assert_eq!(Err(Cancelled), result);
        assert_eq!(
            Some(PowerState::Stopped),
            fixture.platform.power(&fixture.machine.id),
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_does_nothing() {
        let fixture = Fixture::new(PowerState::Running);
        fixture.cancel.cancel();

        assert_eq!(Err(Cancelled), fixture.resolve().await);
        assert_eq!(0, fixture.probe.neighbor_reads());
    }
}

mod resolve_all {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(vmid: u32, mac: &str) -> MachineRecord {
        MachineRecord {
            id: MachineId::new("pve1", vmid),
            name: format!("vm{vmid}"),
            power: PowerState::Running,
            hardware_addresses: vec![mac.to_string()],
        }
    }

    #[tokio::test]
    async fn preserves_input_order() {
        let machines: Vec<_> = (1..=6)
            .map(|i| record(100 + i, &format!("52:54:00:00:00:{i:02x}")))
            .collect();
        let mut probe = TestProbe::new();
        for i in 1..=6u8 {
            probe = probe.in_table(
                Ipv4Addr::new(10, 0, 0, 20 + i),
                format!("52:54:00:00:00:{i:02x}").parse().unwrap(),
            );
        }
        let platform = TestPlatform::new();
        let resolver = Arc::new(Resolver::new(probe, platform, options()));

        let results = resolver
            .resolve_all(
                machines.clone(),
                Arc::new(LocationCache::new()),
                3,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let ids: Vec<_> = results.iter().map(|(id, _)| id.clone()).collect();
        let expected: Vec<_> = machines.iter().map(|m| m.id.clone()).collect();
        assert_eq!(expected, ids);
        assert_eq!(Some(Ipv4Addr::new(10, 0, 0, 26)), results[5].1.address);
    }

    #[tokio::test]
    async fn cancellation_is_reported() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let resolver = Arc::new(Resolver::new(TestProbe::new(), TestPlatform::new(), options()));

        let result = resolver
            .resolve_all(
                vec![record(101, MAC)],
                Arc::new(LocationCache::new()),
                2,
                &cancel,
            )
            .await;

        assert_eq!(Err(Cancelled), result);
    }
}
