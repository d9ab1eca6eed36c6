use std::time::Duration;

use tokio::time::Instant;
use tq_common::Level;
use tq_sim::{
    realpath::DiscoveryOptions,
    testing::{FakeHost, RouteScript},
    RealPath,
};

use crate::config;

#[tokio::test(start_paused = true)]
async fn static_gateway_is_ready_while_discovery_times_out() {
    let _ = tracing_subscriber::fmt::try_init();

    let host = FakeHost::new();
    host.route("vlan22-d", RouteScript::Never);

    let realpath = RealPath::new(config(), host.runner());
    let started = Instant::now();
    let ready = realpath.config_interfaces().await.unwrap();

    assert_eq!(ready, 1);
    let [fiber, satellite] = realpath.entries() else {
        panic!("expected two entries");
    };
    assert!(fiber.is_ready());
    assert_eq!(fiber.gateway(), Some("203.0.113.1"));
    assert!(!satellite.is_ready());
    assert_eq!(satellite.gateway(), None);

    // Setup waited for the discovery deadline, not longer.
    let elapsed = started.elapsed();
    let window = Duration::from_secs(10)..Duration::from_secs(11);
    assert!(window.contains(&elapsed), "{elapsed:?}");
    assert!(host
        .events()
        .contains(Level::Info, "no gateway found within timeout"));
}

#[tokio::test(start_paused = true)]
async fn discoveries_run_concurrently() {
    let host = FakeHost::new();
    let script = RouteScript::Appears {
        gateway: "10.22.0.1".into(),
        after: 4,
    };
    host.route("vlan22-d", script);

    let options = DiscoveryOptions {
        interval: Duration::from_millis(250),
        timeout: Duration::from_secs(2),
    };
    let mut config = (*config()).clone();
    config.extended.configs[0].gateway = None;
    config.extended.configs[0].address = None;
    host.route("vlan21-d", RouteScript::Never);

    let realpath = RealPath::new(config.into(), host.runner()).with_discovery(options);
    let started = Instant::now();
    assert_eq!(realpath.config_interfaces().await.unwrap(), 1);

    // Both lookups were polled in parallel under one deadline.
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(host.route_polls("vlan22-d"), 5);
    assert!(host.route_polls("vlan21-d") >= 8);
    assert!(host
        .commands()
        .iter()
        .any(|c| c == "ip route add default via 10.22.0.1 dev vlan22-d table 22"));
}

#[tokio::test(start_paused = true)]
async fn teardown_after_setup_tolerates_everything() {
    let host = FakeHost::new();
    let script = RouteScript::Appears {
        gateway: "10.22.0.1".into(),
        after: 0,
    };
    host.route("vlan22-d", script);

    let realpath = RealPath::new(config(), host.runner());
    assert_eq!(realpath.config_interfaces().await.unwrap(), 2);

    host.clear_commands();
    host.fail_on("del");
    realpath.cleanup_old_config().await;

    let commands = host.commands();
    assert!(commands
        .iter()
        .any(|c| c == "ip route del default via 10.22.0.1 dev vlan22-d table 22"));
    assert!(commands.contains(&"ip netns del public".to_string()));
    assert_eq!(host.events().count(Level::Warning), 0);
    assert_eq!(host.events().count(Level::Error), 0);
}
