//! Control of a pair of `theaterq` qdiscs replaying a forward and a return trace.
//!
//! The two instances share a sync group: only the forward instance is started, the return instance
//! follows. Every change goes through `tc`, the traces are written to the character device the
//! qdisc exposes for ingestion.

use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use futures::SinkExt as _;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio_util::codec::FramedWrite;
use tq_common::{command, Command, EventSink, Runner};
use tq_trace::{codec, TraceCodec, TraceRecord};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("command error: {0}")]
    Command(#[from] command::Error),
    #[error("unable to load trace into {device}: {source}")]
    Ingest {
        device: String,
        #[source]
        source: codec::Error,
    },
    #[error("unable to parse qdisc stats of {device}: {source}")]
    Stats {
        device: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("no theaterq root qdisc found on {0}")]
    NotFound(String),
    #[error("unknown stage: {0:?}")]
    UnknownStage(String),
    #[error("unknown continuation mode: {0:?}")]
    UnknownMode(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stage of a `theaterq` instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    Load,
    Run,
    Clear,
    Finish,
    Arm,
    Unknown,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Load => "LOAD",
            Self::Run => "RUN",
            Self::Clear => "CLEAR",
            Self::Finish => "FINISH",
            Self::Arm => "ARM",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Whether the instance is replaying or about to.
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Run | Self::Arm | Self::Finish)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "LOAD" => Ok(Self::Load),
            "RUN" => Ok(Self::Run),
            "CLEAR" => Ok(Self::Clear),
            "FINISH" => Ok(Self::Finish),
            "ARM" => Ok(Self::Arm),
            "UNKNOWN" => Ok(Self::Unknown),
            _ => Err(Error::UnknownStage(s.to_string())),
        }
    }
}

/// What an instance does when it reaches the end of its trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContMode {
    /// Keep applying the last record.
    Hold,
    /// Start over.
    #[default]
    Loop,
    /// Stop shaping.
    Clean,
}

impl ContMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Hold => "HOLD",
            Self::Loop => "LOOP",
            Self::Clean => "CLEAN",
        }
    }
}

impl fmt::Display for ContMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "HOLD" => Ok(Self::Hold),
            "LOOP" => Ok(Self::Loop),
            "CLEAN" => Ok(Self::Clean),
            _ => Err(Error::UnknownMode(s.to_string())),
        }
    }
}

/// Traces and continuation mode for one replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualLinkSettings {
    pub forward: Arc<[TraceRecord]>,
    pub reverse: Arc<[TraceRecord]>,
    pub mode: ContMode,
}

impl DualLinkSettings {
    pub fn new(forward: Arc<[TraceRecord]>, reverse: Arc<[TraceRecord]>, mode: ContMode) -> Self {
        Self {
            forward,
            reverse,
            mode,
        }
    }
}

impl fmt::Display for DualLinkSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DualLinkSettings (forward={}, return={}, mode={})",
            self.forward.len(),
            self.reverse.len(),
            self.mode
        )
    }
}

/// Replay state, as reported by the qdiscs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    pub stage: Stage,
    pub mode: ContMode,
    /// Replay position, in nanoseconds.
    pub position_time: u64,
    pub position_count: u64,
    /// Trace length, in nanoseconds.
    pub total_time: u64,
    pub total_count: u64,
}

impl LinkState {
    /// Combines the state of both directions. Stage and mode come from the forward instance,
    /// positions and totals are the maximum of both.
    pub fn merge(forward: Self, reverse: Self) -> Self {
        Self {
            stage: forward.stage,
            mode: forward.mode,
            position_time: forward.position_time.max(reverse.position_time),
            position_count: forward.position_count.max(reverse.position_count),
            total_time: forward.total_time.max(reverse.total_time),
            total_count: forward.total_count.max(reverse.total_count),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QdiscInfo {
    kind: String,
    #[serde(default)]
    root: bool,
    #[serde(default)]
    options: Option<TheaterqOptions>,
}

#[derive(Debug, Deserialize)]
struct TheaterqOptions {
    stage: Stage,
    cont_mode: ContMode,
    position_time: u64,
    position: u64,
    entries_time: u64,
    entries: u64,
}

/// Parses the output of `tc -j qdisc show`.
fn parse_stats(device: &str, json: &str) -> Result<LinkState> {
    let qdiscs: Vec<QdiscInfo> = serde_json::from_str(json)
        .map_err(|source| Error::Stats {
            device: device.to_string(),
            source,
        })?;

    qdiscs
        .into_iter()
        .filter(|q| q.kind == "theaterq" && q.root)
        .find_map(|q| q.options)
        .map(|o| LinkState {
            stage: o.stage,
            mode: o.cont_mode,
            position_time: o.position_time,
            position_count: o.position,
            total_time: o.entries_time,
            total_count: o.entries,
        })
        .ok_or_else(|| Error::NotFound(device.to_string()))
}

/// Destination of trace records for a qdisc instance.
#[async_trait]
pub trait TraceIngest: Send + Sync + fmt::Debug + 'static {
    async fn ingest(
        &self,
        device: &str,
        handle: u32,
        records: &[TraceRecord],
    ) -> std::result::Result<(), codec::Error>;
}

/// Writes traces to the ingestion device of the qdisc, `/dev/theaterq:{dev}:{handle}:0`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceIngest;

impl DeviceIngest {
    pub fn path(device: &str, handle: u32) -> String {
        format!("/dev/theaterq:{device}:{handle}:0")
    }
}

#[async_trait]
impl TraceIngest for DeviceIngest {
    async fn ingest(
        &self,
        device: &str,
        handle: u32,
        records: &[TraceRecord],
    ) -> std::result::Result<(), codec::Error> {
        let path = Self::path(device, handle);
        let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;

        // `send` flushes, so the device sees one record per write.
        let mut framed = FramedWrite::new(file, TraceCodec::new());
        for record in records {
            framed.send(*record).await?;
        }

        tracing::debug!(path, records = records.len(), "trace written");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerOptions {
    pub handle: u32,
    pub syncgroup: u32,
    /// Skip trace ingestion and report a synthetic state. No command reaches the host.
    pub dry_run: bool,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            handle: 1,
            syncgroup: 1,
            dry_run: false,
        }
    }
}

#[derive(Debug, Default)]
struct HandlerState {
    running: bool,
    armed: bool,
    settings: Option<Arc<DualLinkSettings>>,
    skew_reported: bool,
}

/// Owns the forward and the return `theaterq` instance.
///
/// Control calls (`load`, `start`, `stop`, `teardown`) are expected from a single owner. The
/// handler is `Sync` so a status poller can share it.
#[derive(Debug)]
pub struct DualLinkHandler {
    forward: String,
    reverse: String,
    options: HandlerOptions,
    runner: Runner,
    ingest: Arc<dyn TraceIngest>,
    state: Mutex<HandlerState>,
}

impl DualLinkHandler {
    /// Replaces whatever qdisc is installed on both interfaces with a `theaterq` instance in stage
    /// `LOAD`.
    pub async fn construct(
        runner: Runner,
        forward: impl Into<String>,
        reverse: impl Into<String>,
        options: HandlerOptions,
    ) -> Result<Self> {
        Self::with_ingest(runner, Arc::new(DeviceIngest), forward, reverse, options).await
    }

    pub async fn with_ingest(
        runner: Runner,
        ingest: Arc<dyn TraceIngest>,
        forward: impl Into<String>,
        reverse: impl Into<String>,
        options: HandlerOptions,
    ) -> Result<Self> {
        let runner = if options.dry_run {
            Runner::dry_run(runner.events().clone())
        } else {
            runner
        };

        let handler = Self {
            forward: forward.into(),
            reverse: reverse.into(),
            options,
            runner,
            ingest,
            state: Mutex::default(),
        };

        handler.remove_instances().await;
        for device in [&handler.forward, &handler.reverse] {
            if let Err(e) = handler.runner.checked(handler.create_cmd(device)).await {
                // Drop whichever instance was already installed.
                handler.remove_instances().await;
                return Err(e.into());
            }
        }

        tracing::debug!(
            forward = %handler.forward,
            reverse = %handler.reverse,
            ?options,
            "dual link ready"
        );
        Ok(handler)
    }

    pub fn forward_interface(&self) -> &str {
        &self.forward
    }

    pub fn return_interface(&self) -> &str {
        &self.reverse
    }

    pub fn options(&self) -> HandlerOptions {
        self.options
    }

    /// Whether this handler started a replay that was not stopped since.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn settings(&self) -> Option<Arc<DualLinkSettings>> {
        self.state.lock().settings.clone()
    }

    /// Stops a running replay, then stores `settings` and writes both traces.
    pub async fn load(&self, settings: DualLinkSettings) -> Result<()> {
        if self.is_running() || self.is_active().await? {
            self.stop().await?;
        }

        let settings = Arc::new(settings);
        self.state.lock().settings = Some(Arc::clone(&settings));

        if self.options.dry_run {
            self.runner.events().debug(&format!("Update settings in dry run: {settings}"));
            return Ok(());
        }

        let traces = [
            (&self.forward, &settings.forward),
            (&self.reverse, &settings.reverse),
        ];
        for (device, records) in traces {
            let result = self.ingest.ingest(device, self.options.handle, records).await;
            if let Err(source) = result {
                // A half-written pair must not be started.
                self.state.lock().settings = None;
                return Err(Error::Ingest {
                    device: device.clone(),
                    source,
                });
            }
        }

        Ok(())
    }

    /// Starts the loaded replay, or arms it if `arm` is set. Returns `false` if nothing is loaded
    /// or a replay is already in progress.
    pub async fn start(&self, arm: bool) -> Result<bool> {
        let settings = {
            let state = self.state.lock();
            match &state.settings {
                Some(settings) if !state.running => Arc::clone(settings),
                _ => return Ok(false),
            }
        };

        if !self.options.dry_run && self.is_active().await? {
            return Ok(false);
        }

        self.runner.checked(self.prep_cmd(&self.reverse, settings.mode)).await?;
        let stage = if arm { Stage::Arm } else { Stage::Run };
        self.runner.checked(self.start_cmd(&self.forward, stage, settings.mode)).await?;

        let mut state = self.state.lock();
        state.running = true;
        state.armed = arm;
        Ok(true)
    }

    /// Clears both instances and discards the settings. Returns `false` if nothing was running.
    pub async fn stop(&self) -> Result<bool> {
        if !self.is_running() && !self.is_active().await? {
            return Ok(false);
        }

        for device in [&self.forward, &self.reverse] {
            self.runner.checked(self.stop_cmd(device)).await?;
        }

        let mut state = self.state.lock();
        state.settings = None;
        state.running = false;
        state.armed = false;
        Ok(true)
    }

    /// Queries both instances and merges their state.
    pub async fn status(&self) -> Result<LinkState> {
        let forward = self.query(&self.forward).await?;
        let reverse = self.query(&self.reverse).await?;
        self.check_skew(&forward, &reverse);

        Ok(LinkState::merge(forward, reverse))
    }

    /// Whether either instance reports `RUN`, `ARM` or `FINISH`.
    pub async fn is_active(&self) -> Result<bool> {
        for device in [&self.forward, &self.reverse] {
            if self.query(device).await?.stage.is_active() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Stops a running replay and removes both instances. Never fails.
    pub async fn teardown(&self) {
        if self.is_running() {
            if let Err(e) = self.stop().await {
                self.runner.events().error(&format!("Unable to stop replay: {e}"));
            }
        }
        self.remove_instances().await;
    }

    async fn remove_instances(&self) {
        for device in [&self.forward, &self.reverse] {
            self.runner.tolerant(self.remove_cmd(device).quiet()).await;
        }
    }

    async fn query(&self, device: &str) -> Result<LinkState> {
        let output = self.runner.checked(self.query_cmd(device)).await?;

        if self.options.dry_run {
            return Ok(self.synthetic_state());
        }

        parse_stats(device, &output.stdout)
    }

    fn synthetic_state(&self) -> LinkState {
        let state = self.state.lock();
        let stage = match (&state.settings, state.running, state.armed) {
            (_, true, true) => Stage::Arm,
            (_, true, false) => Stage::Run,
            (Some(_), false, _) => Stage::Load,
            (None, false, _) => Stage::Clear,
        };

        LinkState {
            stage,
            mode: state.settings.as_ref().map(|s| s.mode).unwrap_or_default(),
            position_time: 100_000_000,
            position_count: 100,
            total_time: 1_000_000_000,
            total_count: 1_000,
        }
    }

    /// Reports, once per occurrence, an instance that lost its trace while the other kept it.
    fn check_skew(&self, forward: &LinkState, reverse: &LinkState) {
        let skewed = (forward.total_count == 0) != (reverse.total_count == 0);

        let mut state = self.state.lock();
        if skewed && !state.skew_reported {
            self.runner.events().warning(&format!(
                "Link state skew: {} reports {} entries, {} reports {}",
                self.forward, forward.total_count, self.reverse, reverse.total_count
            ));
        }
        state.skew_reported = skewed;
    }

    fn create_cmd(&self, device: &str) -> Command {
        let handle = self.options.handle;
        let syncgroup = self.options.syncgroup;
        Command::sudo(format!(
            "tc qdisc add dev {device} root handle {handle} theaterq stage LOAD \
             syncgroup {syncgroup} ingest EXTENDED"
        ))
    }

    fn start_cmd(&self, device: &str, stage: Stage, mode: ContMode) -> Command {
        let handle = self.options.handle;
        Command::sudo(format!(
            "tc qdisc change dev {device} handle {handle} theaterq stage {stage} cont {mode}"
        ))
    }

    fn prep_cmd(&self, device: &str, mode: ContMode) -> Command {
        let handle = self.options.handle;
        Command::sudo(format!(
            "tc qdisc change dev {device} handle {handle} theaterq cont {mode}"
        ))
    }

    fn stop_cmd(&self, device: &str) -> Command {
        let handle = self.options.handle;
        Command::sudo(format!(
            "tc qdisc change dev {device} handle {handle} theaterq stage CLEAR"
        ))
    }

    fn remove_cmd(&self, device: &str) -> Command {
        let handle = self.options.handle;
        Command::sudo(format!("tc qdisc del dev {device} root handle {handle}"))
    }

    fn query_cmd(&self, device: &str) -> Command {
        let handle = self.options.handle;
        Command::sudo(format!("tc -j qdisc show dev {device} handle {handle}")).quiet()
    }
}

#[cfg(test)]
mod tests {
    use tq_common::{Level, MemorySink};

    use super::*;
    use crate::testing::FakeHost;

    fn record(interval: u64) -> TraceRecord {
        TraceRecord::simple(interval, 5_000, 1_000_000, 0, 50)
    }

    fn settings(mode: ContMode) -> DualLinkSettings {
        DualLinkSettings::new(
            vec![record(1_000), record(2_000)].into(),
            vec![record(500)].into(),
            mode,
        )
    }

    async fn handler(host: &Arc<FakeHost>, options: HandlerOptions) -> DualLinkHandler {
        DualLinkHandler::with_ingest(host.runner(), host.clone(), "eth1", "eth0", options)
            .await
            .unwrap()
    }

    #[test]
    fn stats_are_read_from_the_theaterq_root() {
        let json = r#"[
            {"kind": "noqueue", "handle": "0:", "root": true},
            {"kind": "theaterq", "handle": "1:", "root": false, "options": {"stage": "CLEAR",
             "cont_mode": "HOLD", "position_time": 0, "position": 0, "entries_time": 0, "entries": 0}},
            {"kind": "theaterq", "handle": "1:", "root": true, "options": {"stage": "RUN",
             "cont_mode": "LOOP", "position_time": 5, "position": 2, "entries_time": 9, "entries": 3}}
        ]"#;

        let state = parse_stats("eth1", json).unwrap();
        assert_eq!(state.stage, Stage::Run);
        assert_eq!(state.mode, ContMode::Loop);
        assert_eq!(state.position_count, 2);
        assert_eq!(state.total_time, 9);

        assert!(matches!(parse_stats("eth1", "[]"), Err(Error::NotFound(_))));
        assert!(matches!(parse_stats("eth1", ""), Err(Error::Stats { .. })));
    }

    #[test]
    fn merge_takes_stage_from_forward_and_max_positions() {
        let forward = LinkState {
            stage: Stage::Run,
            mode: ContMode::Hold,
            position_time: 10,
            position_count: 1,
            total_time: 100,
            total_count: 0,
        };
        let reverse = LinkState {
            stage: Stage::Finish,
            mode: ContMode::Clean,
            position_time: 20,
            position_count: 0,
            total_time: 50,
            total_count: 7,
        };

        let merged = LinkState::merge(forward, reverse);
        assert_eq!(merged.stage, Stage::Run);
        assert_eq!(merged.mode, ContMode::Hold);
        assert_eq!(merged.position_time, 20);
        assert_eq!(merged.position_count, 1);
        assert_eq!(merged.total_time, 100);
        assert_eq!(merged.total_count, 7);
    }

    #[test]
    fn stage_and_mode_names() {
        assert_eq!("FINISH".parse::<Stage>().unwrap(), Stage::Finish);
        assert!("run".parse::<Stage>().is_err());
        assert!(Stage::Arm.is_active() && Stage::Finish.is_active());
        assert!(!Stage::Load.is_active() && !Stage::Clear.is_active());
        assert_eq!(ContMode::default(), ContMode::Loop);
        assert_eq!("CLEAN".parse::<ContMode>().unwrap().to_string(), "CLEAN");
    }

    #[tokio::test]
    async fn construct_replaces_existing_qdiscs() {
        let host = FakeHost::new();
        let _handler = handler(&host, HandlerOptions::default()).await;

        assert_eq!(
            host.commands(),
            vec![
                "tc qdisc del dev eth1 root handle 1",
                "tc qdisc del dev eth0 root handle 1",
                "tc qdisc add dev eth1 root handle 1 theaterq stage LOAD syncgroup 1 ingest EXTENDED",
                "tc qdisc add dev eth0 root handle 1 theaterq stage LOAD syncgroup 1 ingest EXTENDED",
            ]
        );
        assert_eq!(host.qdisc("eth1").unwrap().stage, Stage::Load);
    }

    #[tokio::test]
    async fn construct_fails_when_create_fails() {
        let host = FakeHost::new();
        host.fail_on("qdisc add dev eth0");

        let result = DualLinkHandler::with_ingest(
            host.runner(),
            host.clone(),
            "eth1",
            "eth0",
            HandlerOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(Error::Command(command::Error::NonZero { .. }))));
    }

    #[tokio::test]
    async fn failed_construct_removes_the_forward_instance() {
        let host = FakeHost::new();
        host.fail_on("qdisc add dev eth0");

        let result = DualLinkHandler::with_ingest(
            host.runner(),
            host.clone(),
            "eth1",
            "eth0",
            HandlerOptions::default(),
        )
        .await;

        assert!(result.is_err());
        assert!(host.qdisc("eth1").is_none());
        assert_eq!(
            host.commands().last().map(String::as_str),
            Some("tc qdisc del dev eth0 root handle 1")
        );
    }

    #[tokio::test]
    async fn start_without_settings_is_refused() {
        let host = FakeHost::new();
        let handler = handler(&host, HandlerOptions::default()).await;
        let before = host.commands().len();

        assert!(!handler.start(false).await.unwrap());
        assert_eq!(host.commands().len(), before);
    }

    #[tokio::test]
    async fn load_writes_both_traces_in_extended_form() {
        let host = FakeHost::new();
        let handler = handler(&host, HandlerOptions::default()).await;

        handler.load(settings(ContMode::Loop)).await.unwrap();

        assert_eq!(
            host.ingested("eth1"),
            vec!["1000,5000,0,1000000,0,50,0,0,1", "2000,5000,0,1000000,0,50,0,0,1"]
        );
        assert_eq!(host.ingested("eth0"), vec!["500,5000,0,1000000,0,50,0,0,1"]);
        assert_eq!(handler.status().await.unwrap().total_count, 2);
    }

    #[tokio::test]
    async fn ingest_failure_is_reported() {
        let host = FakeHost::new();
        host.fail_ingest("eth0");
        let handler = handler(&host, HandlerOptions::default()).await;

        let err = handler.load(settings(ContMode::Loop)).await.unwrap_err();
        assert!(matches!(err, Error::Ingest { ref device, .. } if device == "eth0"));

        // Nothing is left to start.
        assert!(handler.settings().is_none());
        assert!(!handler.start(false).await.unwrap());
    }

    #[tokio::test]
    async fn start_preps_return_then_starts_forward() {
        let host = FakeHost::new();
        let handler = handler(&host, HandlerOptions::default()).await;
        handler.load(settings(ContMode::Hold)).await.unwrap();
        host.clear_commands();

        assert!(handler.start(true).await.unwrap());

        let changes: Vec<_> =
            host.commands().into_iter().filter(|c| c.starts_with("tc qdisc change")).collect();
        assert_eq!(
            changes,
            vec![
                "tc qdisc change dev eth0 handle 1 theaterq cont HOLD",
                "tc qdisc change dev eth1 handle 1 theaterq stage ARM cont HOLD",
            ]
        );
        assert!(handler.is_running());
        assert_eq!(handler.status().await.unwrap().stage, Stage::Arm);
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let host = FakeHost::new();
        let handler = handler(&host, HandlerOptions::default()).await;
        handler.load(settings(ContMode::Loop)).await.unwrap();
        assert!(handler.start(false).await.unwrap());

        let before = host.commands().len();
        assert!(!handler.start(false).await.unwrap());
        assert_eq!(host.commands().len(), before);
    }

    #[tokio::test]
    async fn start_is_refused_while_the_kernel_reports_activity() {
        let host = FakeHost::new();
        let handler = handler(&host, HandlerOptions::default()).await;
        handler.load(settings(ContMode::Loop)).await.unwrap();

        // Another process started the replay.
        host.set_stage("eth0", Stage::Finish);
        assert!(!handler.start(false).await.unwrap());
        assert!(!handler.is_running());
    }

    #[tokio::test]
    async fn stop_clears_both_and_discards_settings() {
        let host = FakeHost::new();
        let handler = handler(&host, HandlerOptions::default()).await;

        assert!(!handler.stop().await.unwrap());

        handler.load(settings(ContMode::Loop)).await.unwrap();
        handler.start(false).await.unwrap();
        assert!(handler.stop().await.unwrap());

        assert!(!handler.is_running());
        assert!(handler.settings().is_none());
        assert_eq!(host.qdisc("eth1").unwrap().stage, Stage::Clear);
        assert_eq!(host.qdisc("eth0").unwrap().stage, Stage::Clear);
        assert!(!handler.start(false).await.unwrap());
    }

    #[tokio::test]
    async fn load_stops_a_running_replay_first() {
        let host = FakeHost::new();
        let handler = handler(&host, HandlerOptions::default()).await;
        handler.load(settings(ContMode::Loop)).await.unwrap();
        handler.start(false).await.unwrap();
        host.clear_commands();

        handler.load(settings(ContMode::Clean)).await.unwrap();

        let commands = host.commands();
        assert!(commands
            .iter()
            .any(|c| c == "tc qdisc change dev eth1 handle 1 theaterq stage CLEAR"));
        assert!(!handler.is_running());
        assert_eq!(handler.settings().unwrap().mode, ContMode::Clean);

        assert!(handler.start(false).await.unwrap());
        assert_eq!(handler.status().await.unwrap().mode, ContMode::Clean);
    }

    #[tokio::test]
    async fn status_errors_propagate() {
        let host = FakeHost::new();
        let handler = handler(&host, HandlerOptions::default()).await;
        host.fail_on("tc -j qdisc show dev eth0");

        assert!(matches!(handler.status().await, Err(Error::Command(_))));
    }

    #[tokio::test]
    async fn skew_is_reported_once() {
        let host = FakeHost::new();
        let handler = handler(&host, HandlerOptions::default()).await;
        handler.load(settings(ContMode::Loop)).await.unwrap();
        host.clear_trace("eth0");

        handler.status().await.unwrap();
        handler.status().await.unwrap();
        assert_eq!(host.events().count(Level::Warning), 1);
    }

    #[tokio::test]
    async fn dry_run_reports_synthetic_state() {
        let host = FakeHost::new();
        let options = HandlerOptions {
            dry_run: true,
            ..Default::default()
        };
        let handler = handler(&host, options).await;
        assert!(host.commands().is_empty());

        assert_eq!(handler.status().await.unwrap().stage, Stage::Clear);

        handler.load(settings(ContMode::Hold)).await.unwrap();
        assert!(host.ingested("eth1").is_empty());
        let state = handler.status().await.unwrap();
        assert_eq!(state.stage, Stage::Load);
        assert_eq!(state.mode, ContMode::Hold);

        assert!(handler.start(true).await.unwrap());
        assert_eq!(handler.status().await.unwrap().stage, Stage::Arm);

        assert!(handler.stop().await.unwrap());
        let state = handler.status().await.unwrap();
        assert_eq!(state.stage, Stage::Clear);
        assert_eq!(state.mode, ContMode::Loop);
        assert_eq!(state.position_count, 100);
        assert_eq!(state.position_time, 100_000_000);
        assert_eq!(state.total_count, 1_000);
        assert_eq!(state.total_time, 1_000_000_000);
    }

    #[tokio::test]
    async fn teardown_stops_and_removes() {
        let host = FakeHost::new();
        let handler = handler(&host, HandlerOptions::default()).await;
        handler.load(settings(ContMode::Loop)).await.unwrap();
        handler.start(false).await.unwrap();

        handler.teardown().await;
        assert!(host.qdisc("eth1").is_none());
        assert!(host.qdisc("eth0").is_none());

        // Removing again is tolerated.
        handler.teardown().await;
        let sink: &MemorySink = host.events();
        assert_eq!(sink.count(Level::Error), 0);
    }
}
