use std::sync::Arc;

use tq_sim::{
    testing::FakeHost, ContMode, DualLinkHandler, DualLinkSettings, HandlerOptions, Stage,
};
use tq_trace::{normalize, TraceRecord};

fn trace() -> Arc<[TraceRecord]> {
    let rows = ["1000,5000,1000000,0,50", "1000,6000,1000000,0,50", "1000,7000,2000000,0,50"];
    normalize(rows).unwrap().into()
}

async fn handler(host: &Arc<FakeHost>) -> DualLinkHandler {
    let options = HandlerOptions::default();
    DualLinkHandler::with_ingest(host.runner(), host.clone(), "enp2s0", "enp1s0", options)
        .await
        .unwrap()
}

#[test]
fn simple_rows_are_widened() {
    let records = trace();

    assert_eq!(records.len(), 3);
    for record in records.iter() {
        assert_eq!(
            (record.jitter, record.dup_prob, record.dup_delay, record.route_id),
            (0, 0, 0, 1)
        );
        assert_eq!(record.to_string().split(',').count(), 9);
    }

    // Six fields are neither format.
    assert!(normalize(["1000,5000,0,1000000,0,50"]).is_err());
}

#[tokio::test]
async fn start_runs_forward_and_syncs_return() {
    let _ = tracing_subscriber::fmt::try_init();

    let host = FakeHost::new();
    let handler = handler(&host).await;
    handler.load(DualLinkSettings::new(trace(), trace(), ContMode::Clean)).await.unwrap();

    assert!(handler.start(false).await.unwrap());

    let forward = host.qdisc("enp2s0").unwrap();
    let reverse = host.qdisc("enp1s0").unwrap();
    assert_eq!(forward.stage, Stage::Run);
    assert_eq!(forward.mode, ContMode::Clean);
    assert_eq!(reverse.mode, ContMode::Clean);
    assert_eq!(handler.status().await.unwrap().stage, Stage::Run);
}

#[tokio::test]
async fn second_start_issues_no_commands() {
    let host = FakeHost::new();
    let handler = handler(&host).await;
    handler.load(DualLinkSettings::new(trace(), trace(), ContMode::Loop)).await.unwrap();
    assert!(handler.start(true).await.unwrap());

    let issued = host.commands();
    assert!(!handler.start(true).await.unwrap());
    assert!(!handler.start(false).await.unwrap());
    assert_eq!(host.commands(), issued);
}

#[tokio::test]
async fn continuation_mode_follows_every_load() {
    let host = FakeHost::new();
    let handler = handler(&host).await;

    for mode in [ContMode::Hold, ContMode::Loop, ContMode::Clean, ContMode::Hold] {
        handler.stop().await.unwrap();
        handler.load(DualLinkSettings::new(trace(), trace(), mode)).await.unwrap();
        assert!(handler.start(false).await.unwrap());

        assert_eq!(host.qdisc("enp2s0").unwrap().mode, mode);
        assert_eq!(host.qdisc("enp1s0").unwrap().mode, mode);
        assert_eq!(handler.status().await.unwrap().mode, mode);
    }
}
