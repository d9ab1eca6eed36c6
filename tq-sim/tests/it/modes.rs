use std::time::Duration;

use tokio::sync::mpsc;
use tq_common::Level;
use tq_sim::{
    build_modes,
    emulator::EmulatorMode,
    realpath::DiscoveryOptions,
    testing::{write_scenario, FakeHost, RouteScript},
    ContMode, Event, Mode, OperationMode, RealPath, Stage, TabList,
};
use tq_trace::{DirectoryProvider, ScenarioProvider};

use crate::config;

#[tokio::test(start_paused = true)]
async fn emulator_replays_a_scenario_from_a_directory() {
    let _ = tracing_subscriber::fmt::try_init();

    let host = FakeHost::new();
    let dir = tempfile::tempdir().unwrap();
    let forward = ["250000,20000,5000000,0,100"; 4];
    write_scenario(dir.path(), "Commute", &forward, &["1000000,20000,1000000,0,100"]).unwrap();
    let provider = DirectoryProvider::new(dir.path(), host.event_sink());
    provider.refresh().await.unwrap();
    assert_eq!(provider.list(), vec!["Commute"]);

    let (tx, mut rx) = mpsc::channel(32);
    let mut emulator = EmulatorMode::new(config(), host.runner(), tx)
        .with_ingest(host.clone())
        .with_poll_interval(Duration::from_millis(200));

    emulator.enable().await;
    emulator.load_scenario(&provider, "Commute").await.unwrap();
    emulator.set_cont_mode(ContMode::Hold);
    assert!(emulator.start(false).await);

    let mut states = Vec::new();
    while states.len() < 3 {
        match rx.recv().await.unwrap() {
            Event::State(update) if update.stage == Stage::Run => states.push(update),
            Event::State(_) | Event::ScenarioLoaded { .. } => {}
            Event::ScenarioUnloaded => panic!("scenario unloaded while running"),
        }
    }
    assert!(states.iter().all(|s| s.total_time == 1_000_000_000));
    assert_eq!(host.qdisc("enp1s0").unwrap().mode, ContMode::Hold);

    emulator.disable().await;
    assert!(host.qdisc("enp2s0").is_none());
    let rest: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert_eq!(rest.last(), Some(&Event::ScenarioUnloaded));
}

#[tokio::test(start_paused = true)]
async fn extended_operation_end_to_end() {
    let host = FakeHost::new();
    let script = RouteScript::Appears {
        gateway: "10.22.0.1".into(),
        after: 2,
    };
    host.route("vlan22-d", script);
    let (tx, _rx) = mpsc::channel(32);

    let discovery = DiscoveryOptions {
        interval: Duration::from_millis(100),
        timeout: Duration::from_secs(1),
    };
    let orchestrator = RealPath::new(config(), host.runner()).with_discovery(discovery);
    let mut modes = build_modes(OperationMode::Extended, config(), host.runner(), tx, false)
        .with_orchestrator(orchestrator);

    let mut tabs = TabList::default();
    modes.attach(&mut tabs);
    assert_eq!(
        tabs.titles().collect::<Vec<_>>(),
        vec!["Emulator", "Passthrough", "Fiber", "Satellite"]
    );

    modes.prepare().await.unwrap();
    assert!(modes.real_paths.iter().all(|m| m.entry().is_ready()));

    host.clear_commands();
    assert!(modes.switch(3).await);
    assert_eq!(
        host.commands(),
        vec![
            "iptables -t mangle -A PREROUTING -i enp1s0.100 -j MARK --set-mark 22",
            "ip rule add fwmark 22 table 22",
            "conntrack -F",
        ]
    );
    assert!(host.events().contains(Level::Info, "Real path Satellite enabled"));

    host.clear_commands();
    assert!(modes.switch(1).await);
    let commands = host.commands();
    assert_eq!(
        commands[0],
        "iptables -t mangle -D PREROUTING -i enp1s0.100 -j MARK --set-mark 22"
    );
    assert_eq!(
        commands[2],
        "iptables -t nat -A PREROUTING -i enp1s0.100 -d 198.51.100.7 -j DNAT --to-destination 10.0.2.2"
    );

    modes.shutdown().await;
    assert!(host.events().contains(Level::Info, "Passthrough disabled"));
    assert_eq!(host.events().count(Level::Critical), 0);
}

#[tokio::test]
async fn dry_run_emulator_touches_nothing() {
    let host = FakeHost::new();
    let dir = tempfile::tempdir().unwrap();
    let rows = ["250000,20000,5000000,0,100"];
    write_scenario(dir.path(), "Commute", &rows, &rows).unwrap();
    let provider = DirectoryProvider::new(dir.path(), host.event_sink());
    provider.refresh().await.unwrap();

    let (tx, _rx) = mpsc::channel(32);
    let mut modes = build_modes(OperationMode::Routed, config(), host.runner(), tx, true);

    assert!(modes.switch(0).await);
    modes.emulator.load_scenario(&provider, "Commute").await.unwrap();
    assert!(modes.emulator.start(true).await);
    let status = modes.emulator.handler().unwrap().status().await.unwrap();
    assert_eq!(status.stage, Stage::Arm);

    modes.shutdown().await;
    assert!(host.commands().is_empty());
    assert!(host.ingested("enp2s0").is_empty());
}
