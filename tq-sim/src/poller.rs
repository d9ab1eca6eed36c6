use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tq_common::EventSink;

use crate::theaterq::{DualLinkHandler, LinkState, Stage};

/// Replay progress as shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusUpdate {
    pub stage: Stage,
    /// Nanoseconds.
    pub position_time: u64,
    /// Nanoseconds.
    pub total_time: u64,
}

impl StatusUpdate {
    /// An update without a known stage, shown while nothing is replaying.
    pub fn idle(total_time: u64) -> Self {
        Self {
            stage: Stage::Unknown,
            position_time: 0,
            total_time,
        }
    }
}

impl From<LinkState> for StatusUpdate {
    fn from(state: LinkState) -> Self {
        Self {
            stage: state.stage,
            position_time: state.position_time,
            total_time: state.total_time,
        }
    }
}

/// Notifications for the observer of the emulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    State(StatusUpdate),
    ScenarioLoaded {
        name: String,
        description: String,
        total_time: u64,
    },
    ScenarioUnloaded,
}

/// Periodically queries a [`DualLinkHandler`] and forwards its state as [`Event::State`].
///
/// The poller only holds a weak reference and exits once the handler is dropped. Call
/// [`StatusPoller::shutdown`] before tearing the handler down.
#[derive(Debug)]
pub struct StatusPoller {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl StatusPoller {
    pub const INTERVAL: Duration = Duration::from_secs(1);

    pub fn spawn(
        handler: &Arc<DualLinkHandler>,
        tx: mpsc::Sender<Event>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self::with_interval(handler, tx, events, Self::INTERVAL)
    }

    pub fn with_interval(
        handler: &Arc<DualLinkHandler>,
        tx: mpsc::Sender<Event>,
        events: Arc<dyn EventSink>,
        period: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let task = tokio::spawn(poll(Arc::downgrade(handler), tx, events, token.clone(), period));

        Self { token, task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the poller and waits for it to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(?e, "status poller failed");
        }
    }
}

async fn poll(
    handler: Weak<DualLinkHandler>,
    tx: mpsc::Sender<Event>,
    events: Arc<dyn EventSink>,
    token: CancellationToken,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let Some(handler) = handler.upgrade() else {
            tracing::debug!("handler dropped, stopping status poller");
            break;
        };
        let result = handler.status().await;
        drop(handler);

        if token.is_cancelled() {
            break;
        }

        match result {
            Ok(state) => match tx.try_send(Event::State(state.into())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::debug!("observer is lagging, dropping state update")
                }
                Err(TrySendError::Closed(_)) => break,
            },
            Err(e) => events.warning(&format!("Unable to update replay feedback: {e}")),
        }
    }
}
