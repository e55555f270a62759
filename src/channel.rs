use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::stage::Stage;
use crate::store::ProgressStore;
use crate::telemetry::{SyncEvent, TelemetryClient};
use crate::transport::{FeedTransport, ReconnectPolicy};

/// Wire shape of a progress push. Everything is optional here so validation
/// can say precisely what was wrong.
#[derive(Debug, Deserialize)]
struct PushMessage {
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    job_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    stage: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    timestamp: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushStatus {
    Processing,
    Completed,
    Failed,
}

/// A validated stage update, ready for the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StageUpdate {
    pub entity_id: String,
    pub stage: Stage,
    pub progress: u8,
    pub message: Option<String>,
    pub error: Option<String>,
    /// Carried for diagnostics only; never used for ordering.
    pub timestamp: Option<f64>,
}

#[derive(Debug, Error, PartialEq)]
pub enum MessageRejection {
    #[error("payload is not a progress message: {0}")]
    InvalidJson(String),
    #[error("message has no entity identifier")]
    MissingEntityId,
    #[error("unrecognized stage `{0}`")]
    UnknownStage(String),
    #[error("unrecognized status `{0}`")]
    UnknownStatus(String),
    #[error("progress {0} is outside 0..=100")]
    ProgressOutOfRange(f64),
}

impl MessageRejection {
    fn kind(&self) -> &'static str {
        match self {
            MessageRejection::InvalidJson(_) => "invalid_json",
            MessageRejection::MissingEntityId => "missing_entity_id",
            MessageRejection::UnknownStage(_) => "unknown_stage",
            MessageRejection::UnknownStatus(_) => "unknown_status",
            MessageRejection::ProgressOutOfRange(_) => "progress_out_of_range",
        }
    }
}

pub fn decode_message(text: &str) -> Result<StageUpdate, MessageRejection> {
    let message: PushMessage = serde_json::from_str(text)
        .map_err(|err| MessageRejection::InvalidJson(err.to_string()))?;

    let entity_id = [message.entity_id.as_deref(), message.job_id.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|id| !id.is_empty())
        .ok_or(MessageRejection::MissingEntityId)?
        .to_string();

    let status = match message.status.as_deref().map(str::trim) {
        Some("processing") => PushStatus::Processing,
        Some("completed") => PushStatus::Completed,
        Some("failed") => PushStatus::Failed,
        other => {
            return Err(MessageRejection::UnknownStatus(
                other.unwrap_or_default().to_string(),
            ))
        }
    };

    let progress = match message.progress {
        Some(value) if value.is_finite() && (0.0..=100.0).contains(&value) => value.round() as u8,
        Some(value) => return Err(MessageRejection::ProgressOutOfRange(value)),
        None => return Err(MessageRejection::ProgressOutOfRange(f64::NAN)),
    };

    let stage = match message.stage.as_deref() {
        Some(raw) => raw
            .parse::<Stage>()
            .map_err(|_| MessageRejection::UnknownStage(raw.to_string()))?,
        None => match status {
            PushStatus::Completed => Stage::Complete,
            PushStatus::Failed => Stage::Error,
            PushStatus::Processing => Stage::from_progress(progress),
        },
    };

    Ok(StageUpdate {
        entity_id,
        stage,
        progress,
        message: message.message,
        error: message.error,
        timestamp: message.timestamp,
    })
}

/// Decodes one frame and forwards it to the store. Rejected frames are
/// logged and journaled, never forwarded.
pub fn handle_frame(
    text: &str,
    store: &ProgressStore,
    telemetry: &TelemetryClient,
) -> Result<StageUpdate, MessageRejection> {
    match decode_message(text) {
        Ok(update) => {
            if let Some(reason) = &update.error {
                warn!(entity_id = %update.entity_id, reason, "import reported failure");
            }
            let accepted = store.apply_update(
                &update.entity_id,
                update.progress,
                update.stage,
                update.error.clone(),
            );
            debug!(
                entity_id = %update.entity_id,
                stage = %update.stage,
                progress = update.progress,
                accepted,
                "progress push"
            );
            Ok(update)
        }
        Err(rejection) => {
            warn!(%rejection, "dropping malformed progress message");
            if let Err(err) = telemetry.record(
                SyncEvent::PushMessageDropped,
                json!({ "reason": rejection.kind() }),
            ) {
                warn!(?err, "failed to journal dropped message");
            }
            Err(rejection)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Uninstantiated,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Set while `Connecting` after a connection has been lost, as opposed
    /// to the first connect.
    pub reconnecting: bool,
    pub attempts: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Uninstantiated,
            reconnecting: false,
            attempts: 0,
        }
    }
}

pub struct RealtimeChannel;

impl RealtimeChannel {
    pub fn spawn(
        transport: Arc<dyn FeedTransport>,
        policy: ReconnectPolicy,
        store: ProgressStore,
        telemetry: TelemetryClient,
    ) -> ChannelHandle {
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        let state_tx = Arc::new(state_tx);
        let task = tokio::spawn(run(
            transport,
            policy,
            store,
            telemetry,
            Arc::clone(&state_tx),
        ));
        ChannelHandle {
            state_tx,
            state_rx,
            task,
        }
    }
}

async fn run(
    transport: Arc<dyn FeedTransport>,
    policy: ReconnectPolicy,
    store: ProgressStore,
    telemetry: TelemetryClient,
    state: Arc<watch::Sender<ConnectionState>>,
) {
    let _closed = PublishClosedOnExit(Arc::clone(&state));
    let jitter = policy.jitter();
    let mut attempts = 0_u32;
    let mut reconnecting = false;

    loop {
        state.send_replace(ConnectionState {
            status: ConnectionStatus::Connecting,
            reconnecting,
            attempts,
        });

        match transport.connect().await {
            Ok(mut frames) => {
                attempts = 0;
                state.send_replace(ConnectionState {
                    status: ConnectionStatus::Open,
                    reconnecting: false,
                    attempts,
                });
                info!("progress feed open");

                while let Some(frame) = frames.next().await {
                    match frame {
                        Ok(text) => {
                            let _ = handle_frame(&text, &store, &telemetry);
                        }
                        Err(err) => {
                            warn!(?err, "progress feed errored");
                            break;
                        }
                    }
                }
                info!("progress feed dropped");
            }
            Err(err) => {
                warn!(?err, attempts, "progress feed connect failed");
            }
        }

        if attempts >= policy.max_attempts {
            state.send_replace(ConnectionState {
                status: ConnectionStatus::Closed,
                reconnecting: false,
                attempts,
            });
            warn!(attempts, "giving up on progress feed; polling remains");
            let payload = json!({ "attempts": attempts });
            if let Err(err) = telemetry.record(SyncEvent::RealtimeClosed, payload) {
                warn!(?err, "failed to journal feed shutdown");
            }
            return;
        }

        attempts += 1;
        reconnecting = true;
        state.send_replace(ConnectionState {
            status: ConnectionStatus::Connecting,
            reconnecting,
            attempts,
        });
        sleep(policy.delay_for(attempts, &jitter)).await;
    }
}

/// Publishes `Closed` when the run loop ends, including when it is aborted
/// mid-poll, so no later `Connecting` can outlive a shutdown.
struct PublishClosedOnExit(Arc<watch::Sender<ConnectionState>>);

impl Drop for PublishClosedOnExit {
    fn drop(&mut self) {
        publish_closed(&self.0);
    }
}

fn publish_closed(state: &watch::Sender<ConnectionState>) {
    state.send_if_modified(|current| {
        if current.status == ConnectionStatus::Closed {
            return false;
        }
        current.status = ConnectionStatus::Closed;
        current.reconnecting = false;
        true
    });
}

/// Owns the channel task. Dropping it tears the connection down.
pub struct ChannelHandle {
    state_tx: Arc<watch::Sender<ConnectionState>>,
    state_rx: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// The task may still be mid-poll after `abort`; its exit guard publishes
    /// `Closed` again once it is actually dropped.
    pub fn shutdown(&self) {
        self.task.abort();
        publish_closed(&self.state_tx);
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
