use std::time::Duration;

use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use tq::{
    common::format_mm_ss,
    emulator::EmulatorMode,
    testing::{write_scenario, FakeHost},
    ContMode, DirectoryProvider, Event, Mode, ScenarioProvider,
};

#[tokio::main]
async fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .try_init();

    // A scenario directory with one five second scenario.
    let dir = tempfile::tempdir().unwrap();
    let forward = ["1000000,15000,8000000,0,100"; 5];
    let reverse = ["1000000,15000,2000000,10000,100"; 5];
    write_scenario(dir.path(), "Train", &forward, &reverse).unwrap();

    // Commands run against an in-memory host, so this needs neither root nor theaterq.
    let host = FakeHost::new();
    let provider = DirectoryProvider::new(dir.path(), host.event_sink());
    provider.refresh().await.unwrap();
    tracing::info!(scenarios = ?provider.list(), "scenarios available");

    let config = r#"{
        "general": {
            "left_endpoint_ip": "10.0.1.2", "right_endpoint_ip": "10.0.2.2",
            "left_interface_address": "10.0.1.1/24", "right_interface_address": "10.0.2.1/24"
        },
        "extended": {
            "left_vlan": 100, "right_vlan": 200, "right_netns_address": "10.0.3.1/24",
            "public_interface": { "address": "192.0.2.10/24", "gateway": "192.0.2.1", "vlan": 300 }
        }
    }"#;

    let (tx, mut rx) = mpsc::channel(16);
    let config: tq::Config = config.parse().unwrap();
    let mut emulator = EmulatorMode::new(config.into(), host.runner(), tx)
        .with_ingest(host.clone())
        .with_poll_interval(Duration::from_millis(500));

    emulator.enable().await;
    emulator.load_scenario(&provider, "Train").await.unwrap();
    emulator.set_cont_mode(ContMode::Hold);
    emulator.start(false).await;

    let observer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                Event::ScenarioLoaded {
                    name,
                    description,
                    total_time,
                } => {
                    let duration = format_mm_ss(total_time);
                    tracing::info!("Loaded {name} ({description}), {duration}")
                }
                Event::State(update) => tracing::info!(
                    stage = %update.stage,
                    "{} / {}",
                    format_mm_ss(update.position_time),
                    format_mm_ss(update.total_time)
                ),
                Event::ScenarioUnloaded => tracing::info!("Scenario unloaded"),
            }
        }
    });

    tokio::time::sleep(Duration::from_secs(2)).await;
    emulator.disable().await;
    drop(emulator);
    observer.await.unwrap();

    for command in host.commands() {
        println!("{command}");
    }
}
