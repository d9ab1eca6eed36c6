//! Trace replay on the interface pair.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tq_common::Runner;
use tq_trace::{ScenarioConfig, ScenarioProvider};

use crate::{
    config::Config,
    host,
    mode::{Mode, ModeHost},
    poller::{Event, StatusPoller, StatusUpdate},
    theaterq::{
        self, ContMode, DeviceIngest, DualLinkHandler, DualLinkSettings, HandlerOptions,
        TraceIngest,
    },
};

/// Replays a scenario: the forward trace shapes traffic leaving on the right interface, the return
/// trace traffic leaving on the left one.
///
/// The qdiscs exist while the mode is enabled. A status poller reports the replay progress to the
/// observer channel between [`EmulatorMode::start`] and [`EmulatorMode::stop`].
#[derive(Debug)]
pub struct EmulatorMode {
    config: Arc<Config>,
    runner: Runner,
    tx: mpsc::Sender<Event>,
    masquerade: bool,
    options: HandlerOptions,
    ingest: Arc<dyn TraceIngest>,
    poll_interval: Duration,

    handler: Option<Arc<DualLinkHandler>>,
    poller: Option<StatusPoller>,
    scenario: Option<ScenarioConfig>,
    cont_mode: ContMode,
}

impl EmulatorMode {
    pub fn new(config: Arc<Config>, runner: Runner, tx: mpsc::Sender<Event>) -> Self {
        Self {
            config,
            runner,
            tx,
            masquerade: false,
            options: HandlerOptions::default(),
            ingest: Arc::new(DeviceIngest),
            poll_interval: StatusPoller::INTERVAL,
            handler: None,
            poller: None,
            scenario: None,
            cont_mode: ContMode::default(),
        }
    }

    /// Forward the public address to the right endpoint while enabled.
    pub fn masquerade(mut self, masquerade: bool) -> Self {
        self.masquerade = masquerade;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.options.dry_run = dry_run;
        self
    }

    pub fn with_ingest(mut self, ingest: Arc<dyn TraceIngest>) -> Self {
        self.ingest = ingest;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The handler of both qdiscs, while enabled.
    pub fn handler(&self) -> Option<&Arc<DualLinkHandler>> {
        self.handler.as_ref()
    }

    pub fn scenario(&self) -> Option<&ScenarioConfig> {
        self.scenario.as_ref()
    }

    pub fn cont_mode(&self) -> ContMode {
        self.cont_mode
    }

    /// Continuation mode of the next start.
    pub fn set_cont_mode(&mut self, mode: ContMode) {
        self.cont_mode = mode;
    }

    /// Whether the replay progress is being reported.
    pub fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(|p| !p.is_finished())
    }

    /// Loads the scenario `name` for the next start.
    pub async fn load_scenario(
        &mut self,
        provider: &dyn ScenarioProvider,
        name: &str,
    ) -> tq_trace::Result<()> {
        let scenario = provider.load(name).await?;
        let total_time = scenario.total_duration();

        self.emit(Event::ScenarioLoaded {
            name: scenario.name().to_string(),
            description: scenario.description().to_string(),
            total_time,
        });
        self.emit(Event::State(StatusUpdate::idle(total_time)));

        tracing::debug!(%scenario, total_time, "scenario loaded");
        self.scenario = Some(scenario);
        Ok(())
    }

    /// Writes the loaded scenario and starts it, or arms it if `arm` is set. Returns whether the
    /// replay started.
    pub async fn start(&mut self, arm: bool) -> bool {
        let events = Arc::clone(self.runner.events());

        let Some(handler) = self.handler.clone() else {
            events.error("Unable to start replay: emulator is not enabled");
            return false;
        };
        let Some(scenario) = &self.scenario else {
            events.warning("Unable to start replay: no scenario loaded");
            return false;
        };

        let settings = DualLinkSettings::new(
            Arc::clone(scenario.forward()),
            Arc::clone(scenario.reverse()),
            self.cont_mode,
        );

        match load_and_start(&handler, settings, arm).await {
            Ok(true) => {}
            Ok(false) => {
                events.warning("Replay was not started, another replay is in progress");
                return false;
            }
            Err(e) => {
                events.error(&format!("Unable to start replay: {e}"));
                self.stop(false).await;
                return false;
            }
        }

        if !self.is_polling() {
            let poller =
                StatusPoller::with_interval(&handler, self.tx.clone(), events, self.poll_interval);
            self.poller = Some(poller);
        }
        true
    }

    /// Stops the replay. The scenario is discarded if `unload` is set.
    pub async fn stop(&mut self, unload: bool) {
        if let Some(poller) = self.poller.take() {
            poller.shutdown().await;
        }

        let total_time = self.scenario.as_ref().map_or(0, ScenarioConfig::total_duration);
        self.emit(Event::State(StatusUpdate::idle(total_time)));

        if let Some(handler) = &self.handler {
            if let Err(e) = handler.stop().await {
                self.runner.events().error(&format!("Unable to stop replay: {e}"));
            }
        }

        if unload {
            self.scenario = None;
            self.emit(Event::ScenarioUnloaded);
        }
    }

    fn emit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::debug!(?event, "observer is lagging, dropping event")
            }
            Err(TrySendError::Closed(_)) => tracing::trace!("observer is gone"),
        }
    }
}

async fn load_and_start(
    handler: &DualLinkHandler,
    settings: DualLinkSettings,
    arm: bool,
) -> theaterq::Result<bool> {
    handler.load(settings).await?;
    handler.start(arm).await
}

#[async_trait]
impl Mode for EmulatorMode {
    fn title(&self) -> &str {
        "Emulator"
    }

    fn attach(&self, host: &mut dyn ModeHost) {
        host.add_tab(self.title(), "Replays a scenario on both links.");
    }

    async fn enable(&mut self) {
        let events = Arc::clone(self.runner.events());

        if self.masquerade {
            if let Err(e) = host::add_public_dnat(&self.runner, &self.config).await {
                events.error(&format!("Unable to install iptables rule: {e}"));
            }
        }

        let handler = DualLinkHandler::with_ingest(
            self.runner.clone(),
            Arc::clone(&self.ingest),
            self.config.right_interface(),
            self.config.left_interface(),
            self.options,
        )
        .await;

        match handler {
            Ok(handler) => self.handler = Some(Arc::new(handler)),
            Err(e) => {
                events.error(&format!("Error preparing emulator: {e}"));
                return;
            }
        }
        events.info("Emulator enabled");
    }

    async fn disable(&mut self) {
        self.stop(true).await;

        if let Some(handler) = self.handler.take() {
            handler.teardown().await;
        }

        if self.masquerade {
            if let Err(e) = host::remove_public_dnat(&self.runner, &self.config).await {
                self.runner.events().error(&format!("Unable to remove iptables rule: {e}"));
            }
        }
        self.runner.events().info("Emulator disabled");
    }
}
