//! An in-memory host for tests and demonstrations.
//!
//! [`FakeHost`] answers the commands the crate issues as a host with the `theaterq` module loaded
//! would: it keeps the qdiscs per device, accepts traces through [`TraceIngest`], and replies to
//! gateway lookups from a per-interface script. Everything else succeeds silently.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tq_common::{Command, Executor, MemorySink, Output, Runner};
use tq_trace::{codec, record, TraceRecord};

use crate::theaterq::{ContMode, Stage, TraceIngest};

/// A `theaterq` qdisc installed on the fake host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeQdisc {
    pub handle: String,
    pub syncgroup: String,
    pub stage: Stage,
    pub mode: ContMode,
    pub entries: u64,
    pub entries_time: u64,
}

/// How `ip route show dev <iface>` behaves for an interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteScript {
    /// A default route via `gateway` shows up after `after` unsuccessful lookups.
    Appears { gateway: String, after: usize },
    /// Routes without a default route. Used for unknown interfaces too.
    Never,
    /// The command exits with the given status.
    Fails(i32),
    /// The command cannot be started.
    Unavailable,
}

#[derive(Debug, Default)]
struct HostState {
    commands: Vec<String>,
    failures: Vec<String>,
    qdiscs: BTreeMap<String, FakeQdisc>,
    ingested: FxHashMap<String, Vec<String>>,
    ingest_failures: Vec<String>,
    routes: FxHashMap<String, RouteScript>,
    route_polls: FxHashMap<String, usize>,
}

#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
    events: Arc<MemorySink>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A runner executing on this host and logging into [`FakeHost::events`].
    pub fn runner(self: &Arc<Self>) -> Runner {
        Runner::new(self.clone(), self.events.clone())
    }

    pub fn events(&self) -> &MemorySink {
        &self.events
    }

    pub fn event_sink(&self) -> Arc<MemorySink> {
        Arc::clone(&self.events)
    }

    /// Every command executed so far, without `sudo`.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().commands.clear();
    }

    /// Commands containing `pattern` exit with status 2.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.state.lock().failures.push(pattern.into());
    }

    /// Trace ingestion into `device` fails.
    pub fn fail_ingest(&self, device: impl Into<String>) {
        self.state.lock().ingest_failures.push(device.into());
    }

    pub fn qdisc(&self, device: &str) -> Option<FakeQdisc> {
        self.state.lock().qdiscs.get(device).cloned()
    }

    /// Changes the stage of a qdisc behind the back of its handler.
    pub fn set_stage(&self, device: &str, stage: Stage) {
        if let Some(qdisc) = self.state.lock().qdiscs.get_mut(device) {
            qdisc.stage = stage;
        }
    }

    /// Drops the trace of a qdisc behind the back of its handler.
    pub fn clear_trace(&self, device: &str) {
        if let Some(qdisc) = self.state.lock().qdiscs.get_mut(device) {
            qdisc.entries = 0;
            qdisc.entries_time = 0;
        }
    }

    /// Rows written to the ingestion device of `device`.
    pub fn ingested(&self, device: &str) -> Vec<String> {
        self.state.lock().ingested.get(device).cloned().unwrap_or_default()
    }

    pub fn route(&self, interface: impl Into<String>, script: RouteScript) {
        self.state.lock().routes.insert(interface.into(), script);
    }

    /// Number of gateway lookups made for `interface`.
    pub fn route_polls(&self, interface: &str) -> usize {
        self.state.lock().route_polls.get(interface).copied().unwrap_or_default()
    }

    fn tc(state: &mut HostState, args: &[&str]) -> Output {
        match args {
            ["qdisc", "add", "dev", dev, "root", "handle", handle, "theaterq", rest @ ..] => {
                if state.qdiscs.contains_key(*dev) {
                    return Output::failed(2, "Error: Exclusivity flag on, cannot modify.\n");
                }
                let syncgroup = value_of(rest, "syncgroup").unwrap_or("0");
                state.qdiscs.insert(
                    dev.to_string(),
                    FakeQdisc {
                        handle: handle.to_string(),
                        syncgroup: syncgroup.to_string(),
                        stage: Stage::Load,
                        mode: ContMode::default(),
                        entries: 0,
                        entries_time: 0,
                    },
                );
                Output::empty()
            }
            ["qdisc", "del", "dev", dev, "root", "handle", _] => match state.qdiscs.remove(*dev) {
                Some(_) => Output::empty(),
                None => Output::failed(
                    2,
                    "Error: Cannot find specified qdisc on specified device.\n",
                ),
            },
            ["qdisc", "change", "dev", dev, "handle", _, "theaterq", rest @ ..] => {
                let Some(qdisc) = state.qdiscs.get_mut(*dev) else {
                    return Output::failed(2, "Error: Specified qdisc not found.\n");
                };

                if let Some(mode) = value_of(rest, "cont") {
                    match mode.parse() {
                        Ok(mode) => qdisc.mode = mode,
                        Err(_) => return Output::failed(1, "Illegal \"cont\"\n"),
                    }
                }

                let Some(stage) = value_of(rest, "stage") else {
                    return Output::empty();
                };
                let Ok(stage) = stage.parse::<Stage>() else {
                    return Output::failed(1, "Illegal \"stage\"\n");
                };

                qdisc.stage = stage;
                if stage == Stage::Clear {
                    qdisc.entries = 0;
                    qdisc.entries_time = 0;
                }

                // Members of the sync group follow a start.
                if matches!(stage, Stage::Run | Stage::Arm) {
                    let group = qdisc.syncgroup.clone();
                    for member in state.qdiscs.values_mut().filter(|q| q.syncgroup == group) {
                        member.stage = stage;
                    }
                }
                Output::empty()
            }
            ["-j", "qdisc", "show", "dev", dev, "handle", _] => {
                let Some(qdisc) = state.qdiscs.get(*dev) else {
                    return Output::with_stdout("[]");
                };
                let json = serde_json::json!([{
                    "kind": "theaterq",
                    "handle": format!("{}:", qdisc.handle),
                    "root": true,
                    "refcnt": 2,
                    "options": {
                        "stage": qdisc.stage.as_str(),
                        "cont_mode": qdisc.mode.as_str(),
                        "syncgroup": qdisc.syncgroup,
                        "position_time": 0,
                        "position": 0,
                        "entries_time": qdisc.entries_time,
                        "entries": qdisc.entries,
                    }
                }]);
                Output::with_stdout(json.to_string())
            }
            _ => Output::empty(),
        }
    }

    fn route_show(state: &mut HostState, interface: &str) -> io::Result<Output> {
        let polls = state.route_polls.entry(interface.to_string()).or_default();
        *polls += 1;
        let polls = *polls;

        let script = state.routes.get(interface).cloned().unwrap_or(RouteScript::Never);
        let link_route = "10.99.0.0/24 proto kernel scope link src 10.99.0.2\n";

        match script {
            RouteScript::Appears { gateway, after } if polls > after => Ok(Output::with_stdout(
                format!("default via {gateway} proto dhcp src 10.99.0.2 metric 100\n{link_route}"),
            )),
            RouteScript::Appears { .. } | RouteScript::Never => Ok(Output::with_stdout(link_route)),
            RouteScript::Fails(code) => {
                Ok(Output::failed(code, format!("Cannot find device \"{interface}\"\n")))
            }
            RouteScript::Unavailable => {
                Err(io::Error::new(io::ErrorKind::NotFound, "ip: not found"))
            }
        }
    }
}

/// Writes a scenario in the simple trace format into `dir` and returns the path of its JSON file.
/// The file is named after the scenario.
pub fn write_scenario(
    dir: &Path,
    name: &str,
    forward: &[&str],
    reverse: &[&str],
) -> io::Result<PathBuf> {
    let forward_file = format!("{name}-forward.csv");
    let return_file = format!("{name}-return.csv");
    std::fs::write(dir.join(&forward_file), forward.join("\n"))?;
    std::fs::write(dir.join(&return_file), reverse.join("\n"))?;

    let json = serde_json::json!({
        "name": name,
        "description": format!("{name} scenario"),
        "trace": { "format": "simple", "forward": forward_file, "return": return_file },
    });
    let path = dir.join(format!("{name}.json"));
    std::fs::write(&path, json.to_string())?;
    Ok(path)
}

fn value_of<'a>(args: &[&'a str], key: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| *arg == key)
        .and_then(|i| args.get(i + 1))
        .copied()
}

#[async_trait]
impl Executor for FakeHost {
    async fn execute(&self, command: &Command) -> io::Result<Output> {
        let line = command.to_string();
        let mut state = self.state.lock();
        state.commands.push(line.clone());

        if state.failures.iter().any(|pattern| line.contains(pattern.as_str())) {
            return Ok(Output::failed(2, "RTNETLINK answers: Operation not permitted\n"));
        }

        let args: Vec<&str> = command.get_args().iter().map(String::as_str).collect();
        match (command.program(), args.as_slice()) {
            ("tc", args) => Ok(Self::tc(&mut state, args)),
            ("ip", ["route", "show", "dev", interface]) => Self::route_show(&mut state, interface),
            _ => Ok(Output::empty()),
        }
    }
}

#[async_trait]
impl TraceIngest for FakeHost {
    async fn ingest(
        &self,
        device: &str,
        _handle: u32,
        records: &[TraceRecord],
    ) -> Result<(), codec::Error> {
        let mut state = self.state.lock();
        if state.ingest_failures.iter().any(|d| d == device) || !state.qdiscs.contains_key(device) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "No such device").into());
        }

        let rows = records.iter().map(ToString::to_string).collect();
        state.ingested.insert(device.to_string(), rows);

        if let Some(qdisc) = state.qdiscs.get_mut(device) {
            qdisc.entries = records.len() as u64;
            qdisc.entries_time = record::duration(records);
            if qdisc.stage == Stage::Clear {
                qdisc.stage = Stage::Load;
            }
        }
        Ok(())
    }
}
