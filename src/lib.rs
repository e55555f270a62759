mod catalog;
mod channel;
mod config;
mod errors;
mod ingestion;
mod presentation;
mod reconciler;
mod stage;
mod store;
mod telemetry;
mod transport;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use catalog::{BulkImportResult, FailedImport, HttpVideoApi, Video, VideoApi, VideoCache};
pub use channel::{
    decode_message, handle_frame, ChannelHandle, ConnectionState, ConnectionStatus,
    MessageRejection, RealtimeChannel, StageUpdate,
};
pub use config::{AppConfig, PublicAppConfig};
pub use errors::{AppError, AppResult};
pub use ingestion::{extract_urls, parse_url_csv};
pub use presentation::{
    overlay_percent, resolve_render_state, CardView, ClickOutcome, ConnectionBanner, RenderState,
};
pub use reconciler::{batch_settled, BatchHandle, BatchOutcome, BatchPoll, PollReconciler};
pub use stage::Stage;
pub use store::{AnimatorHandle, ProgressRecord, ProgressStore};
pub use telemetry::{SyncEvent, TelemetryClient};
pub use transport::{FeedTransport, FrameStream, Jitter, ReconnectPolicy, WebSocketTransport};

/// Result of submitting one bulk import.
pub struct SubmittedBatch {
    pub created: Vec<String>,
    pub failed: Vec<FailedImport>,
    pub poll: BatchPoll,
}

/// Composition root: one store, one entity cache, the push channel, the
/// display animator and the poll reconciler, wired together.
pub struct ImportSync {
    store: ProgressStore,
    cache: VideoCache,
    api: Arc<dyn VideoApi>,
    reconciler: PollReconciler,
    telemetry: TelemetryClient,
    channel: ChannelHandle,
    animator: AnimatorHandle,
}

impl ImportSync {
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &AppConfig,
        api: Arc<dyn VideoApi>,
        transport: Arc<dyn FeedTransport>,
        telemetry: TelemetryClient,
    ) -> Self {
        let store = ProgressStore::new();
        let cache = VideoCache::new();
        let channel = RealtimeChannel::spawn(
            transport,
            config.reconnect_policy(),
            store.clone(),
            telemetry.clone(),
        );
        let animator = store.spawn_animator(
            config.animation_frame(),
            config.animation_step,
            config.retire_grace(),
        );
        let reconciler = PollReconciler::new(
            Arc::clone(&api),
            cache.clone(),
            store.clone(),
            config.poll_interval(),
        );
        info!(config = ?config.public_profile(), "import sync started");

        Self {
            store,
            cache,
            api,
            reconciler,
            telemetry,
            channel,
            animator,
        }
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    pub fn cache(&self) -> &VideoCache {
        &self.cache
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.channel.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    /// Creates the videos through the REST layer and starts reconciling them.
    pub async fn submit_batch(&self, list_id: &str, urls: &[String]) -> AppResult<SubmittedBatch> {
        let result = self.api.bulk_import(list_id, urls).await?;
        let mut created = Vec::with_capacity(result.created.len());
        for mut video in result.created {
            if video.import_stage.is_none() {
                video.import_stage = Some(Stage::Created);
                video.import_progress = Some(Stage::Created.nominal_progress());
            }
            created.push(video.id.clone());
            self.cache.upsert(list_id, video);
        }
        for failure in &result.failed {
            warn!(url = %failure.url, error = %failure.error, "import rejected");
        }

        if let Err(err) = self.telemetry.record(
            SyncEvent::BatchSubmitted,
            json!({
                "list_id": list_id,
                "requested": urls.len(),
                "created": created.len(),
                "failed": result.failed.len(),
            }),
        ) {
            warn!(?err, "failed to journal batch submission");
        }

        let poll = self
            .reconciler
            .track(list_id, BatchHandle::new(created.iter().cloned()));
        Ok(SubmittedBatch {
            created,
            failed: result.failed,
            poll,
        })
    }

    /// `None` when the entity is not in the cache.
    pub fn render_state(&self, entity_id: &str) -> Option<RenderState> {
        let video = self.cache.get(entity_id)?;
        let record = self.store.get_progress(entity_id);
        Some(resolve_render_state(record.as_ref(), &video))
    }

    pub fn card(&self, entity_id: &str) -> Option<CardView> {
        self.render_state(entity_id)
            .map(|state| CardView::from_state(&state))
    }

    pub fn record_batch_outcome(&self, outcome: &BatchOutcome) {
        if let Err(err) = self.telemetry.record(
            SyncEvent::BatchSettled,
            json!({
                "list_id": outcome.list_id,
                "entities": outcome.entity_ids.len(),
                "polls": outcome.polls,
                "failed_polls": outcome.failed_polls,
            }),
        ) {
            warn!(?err, "failed to journal batch outcome");
        }
    }

    /// Tears down the push connection and the animator and flushes the
    /// journal. Running batch polls are owned by their `BatchPoll`.
    pub fn shutdown(&self) {
        self.channel.shutdown();
        self.animator.shutdown();
        if let Err(err) = self.telemetry.flush() {
            warn!(?err, "failed to flush telemetry journal");
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,catalog_import_sync=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
