//! Operating modes and their assembly per [`OperationMode`].
//!
//! Exactly one mode is enabled at a time. The host (a UI, or the demo) switches between them with
//! [`ModeSet::switch`], which disables the previous mode before enabling the next one.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tq_common::{command, Runner};

use crate::{
    config::{Config, OperationMode},
    emulator::EmulatorMode,
    host,
    passthrough::PassthroughMode,
    poller::Event,
    realpath::{RealPath, RealPathEntry},
};

/// A way of forwarding traffic between the two interfaces.
///
/// `enable` and `disable` never fail: errors are reported to the event sink of the mode and leave
/// the mode in a state where it can be enabled again.
#[async_trait]
pub trait Mode: Send + Sync + fmt::Debug {
    fn title(&self) -> &str;

    /// Registers the mode with its host.
    fn attach(&self, host: &mut dyn ModeHost);

    async fn enable(&mut self);

    async fn disable(&mut self);
}

/// Where modes present themselves.
pub trait ModeHost {
    fn add_tab(&mut self, title: &str, summary: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tab {
    pub title: String,
    pub summary: String,
}

/// A [`ModeHost`] that only records the tabs.
#[derive(Debug, Default)]
pub struct TabList {
    tabs: Vec<Tab>,
}

impl TabList {
    pub fn tabs(&self) -> &[Tab] {
        &self.tabs
    }

    pub fn titles(&self) -> impl Iterator<Item = &str> {
        self.tabs.iter().map(|tab| tab.title.as_str())
    }
}

impl ModeHost for TabList {
    fn add_tab(&mut self, title: &str, summary: &str) {
        self.tabs.push(Tab {
            title: title.to_string(),
            summary: summary.to_string(),
        });
    }
}

/// Modes of one operation, in tab order: emulator, passthrough, then one mode per uplink.
#[derive(Debug)]
pub struct ModeSet {
    operation: OperationMode,
    config: Arc<Config>,
    runner: Runner,
    pub emulator: EmulatorMode,
    pub passthrough: PassthroughMode,
    pub real_paths: Vec<RealPathEntry>,
    orchestrator: Option<RealPath>,
    active: Option<usize>,
}

/// Assembles the modes for `operation`. Public address masquerading and uplinks exist in extended
/// operation only.
pub fn build_modes(
    operation: OperationMode,
    config: Arc<Config>,
    runner: Runner,
    tx: mpsc::Sender<Event>,
    dry_run: bool,
) -> ModeSet {
    let masquerade = operation == OperationMode::Extended;

    let emulator = EmulatorMode::new(Arc::clone(&config), runner.clone(), tx)
        .masquerade(masquerade)
        .dry_run(dry_run);
    let passthrough =
        PassthroughMode::new(Arc::clone(&config), runner.clone()).masquerade(masquerade);

    let orchestrator = masquerade.then(|| RealPath::new(Arc::clone(&config), runner.clone()));
    let real_paths = orchestrator
        .as_ref()
        .map(RealPath::modes)
        .unwrap_or_default();

    ModeSet {
        operation,
        config,
        runner,
        emulator,
        passthrough,
        real_paths,
        orchestrator,
        active: None,
    }
}

impl ModeSet {
    pub fn operation(&self) -> OperationMode {
        self.operation
    }

    /// The uplink orchestrator, in extended operation.
    pub fn orchestrator(&self) -> Option<&RealPath> {
        self.orchestrator.as_ref()
    }

    /// Replaces the orchestrator, keeping the uplink modes in sync with it.
    pub fn with_orchestrator(mut self, orchestrator: RealPath) -> Self {
        self.real_paths = orchestrator.modes();
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn len(&self) -> usize {
        2 + self.real_paths.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Index of the enabled mode.
    pub fn active(&self) -> Option<usize> {
        self.active
    }

    pub fn mode(&self, index: usize) -> Option<&dyn Mode> {
        match index {
            0 => Some(&self.emulator),
            1 => Some(&self.passthrough),
            i => self.real_paths.get(i - 2).map(|m| m as &dyn Mode),
        }
    }

    pub fn mode_mut(&mut self, index: usize) -> Option<&mut dyn Mode> {
        match index {
            0 => Some(&mut self.emulator),
            1 => Some(&mut self.passthrough),
            i => self.real_paths.get_mut(i - 2).map(|m| m as &mut dyn Mode),
        }
    }

    pub fn titles(&self) -> Vec<String> {
        (0..self.len())
            .filter_map(|i| self.mode(i))
            .map(|m| m.title().to_string())
            .collect()
    }

    pub fn attach(&self, host: &mut dyn ModeHost) {
        for mode in (0..self.len()).filter_map(|i| self.mode(i)) {
            mode.attach(host);
        }
    }

    /// Removes leftovers of previous runs, then wires the interfaces for the operation.
    ///
    /// In extended operation the uplinks are set up too; an uplink that fails is only logged.
    /// Failures of the shared wiring are reported as critical and returned, after removing what
    /// was applied up to the failure.
    pub async fn prepare(&self) -> command::Result<()> {
        self.cleanup().await;

        let bridged = self.operation == OperationMode::Bridged;
        let result = match &self.orchestrator {
            Some(orchestrator) => orchestrator.config_interfaces().await.map(drop),
            None => host::config_interfaces(&self.runner, &self.config, bridged).await,
        };

        if let Err(e) = &result {
            self.runner
                .events()
                .critical(&format!("Unable to set up interfaces: {e}"));
            self.cleanup().await;
        }
        result
    }

    async fn cleanup(&self) {
        host::cleanup_old_config(&self.runner, &self.config).await;
        if let Some(orchestrator) = &self.orchestrator {
            orchestrator.cleanup_old_config().await;
        }
    }

    /// Disables the enabled mode, then enables the mode at `index`. Returns `false` for an unknown
    /// index.
    pub async fn switch(&mut self, index: usize) -> bool {
        if index >= self.len() {
            return false;
        }

        if let Some(previous) = self.active.take() {
            if let Some(mode) = self.mode_mut(previous) {
                mode.disable().await;
            }
        }

        if let Some(mode) = self.mode_mut(index) {
            mode.enable().await;
        }
        self.active = Some(index);
        true
    }

    /// Disables the enabled mode, if any.
    pub async fn shutdown(&mut self) {
        if let Some(previous) = self.active.take() {
            if let Some(mode) = self.mode_mut(previous) {
                mode.disable().await;
            }
        }
    }
}
