use serde::Serialize;

use crate::catalog::Video;
use crate::channel::{ConnectionState, ConnectionStatus};
use crate::stage::Stage;
use crate::store::ProgressRecord;

/// What a video card or row shows for its import.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RenderState {
    Importing {
        stage: Stage,
        progress: f32,
        /// True when `progress` is the animated store value rather than a
        /// persisted snapshot.
        smoothed: bool,
    },
    Error {
        message: Option<String>,
    },
    Idle,
}

/// Merges push-fed store state with the entity's persisted fields.
///
/// A store record, when present, wins outright. Without one the persisted
/// stage decides, and a `None` stage is pre-tracking data rendered as idle.
pub fn resolve_render_state(record: Option<&ProgressRecord>, video: &Video) -> RenderState {
    if let Some(record) = record {
        return match record.stage {
            Stage::Error => RenderState::Error {
                message: record.error.clone().or_else(|| video.import_error.clone()),
            },
            Stage::Complete => RenderState::Idle,
            stage => RenderState::Importing {
                stage,
                progress: record.display_progress,
                smoothed: true,
            },
        };
    }

    match video.import_stage {
        None | Some(Stage::Complete) => RenderState::Idle,
        Some(Stage::Error) => RenderState::Error {
            message: video.import_error.clone(),
        },
        Some(stage) => RenderState::Importing {
            stage,
            progress: f32::from(
                video
                    .import_progress
                    .unwrap_or_else(|| stage.nominal_progress()),
            ),
            smoothed: false,
        },
    }
}

pub fn overlay_percent(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    value.clamp(0.0, 100.0).round() as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickOutcome {
    OpenDetail,
    Swallowed,
}

/// Display properties of one card, derived from its render state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CardView {
    pub overlay_percent: Option<u8>,
    pub stage_label: Option<&'static str>,
    pub grayscale: bool,
    pub clickable: bool,
    pub error_badge: Option<String>,
}

impl CardView {
    pub fn from_state(state: &RenderState) -> Self {
        match state {
            RenderState::Importing {
                stage, progress, ..
            } => Self {
                overlay_percent: Some(overlay_percent(*progress)),
                stage_label: Some(stage.label()),
                grayscale: true,
                clickable: false,
                error_badge: None,
            },
            RenderState::Error { message } => Self {
                overlay_percent: None,
                stage_label: Some(Stage::Error.label()),
                grayscale: false,
                clickable: true,
                error_badge: Some(
                    message
                        .clone()
                        .unwrap_or_else(|| Stage::Error.label().to_string()),
                ),
            },
            RenderState::Idle => Self {
                overlay_percent: None,
                stage_label: None,
                grayscale: false,
                clickable: true,
                error_badge: None,
            },
        }
    }

    /// Clicks on an importing card are dropped, not queued.
    pub fn click(&self) -> ClickOutcome {
        if self.clickable {
            ClickOutcome::OpenDetail
        } else {
            ClickOutcome::Swallowed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionBanner {
    Connecting,
    Reconnecting { attempt: u32 },
    Unavailable,
}

impl ConnectionBanner {
    pub fn from_state(state: ConnectionState) -> Option<Self> {
        match state.status {
            ConnectionStatus::Uninstantiated | ConnectionStatus::Open => None,
            ConnectionStatus::Connecting if state.reconnecting => Some(Self::Reconnecting {
                attempt: state.attempts,
            }),
            ConnectionStatus::Connecting => Some(Self::Connecting),
            ConnectionStatus::Closed => Some(Self::Unavailable),
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Connecting => "Connecting to live import updates".to_string(),
            Self::Reconnecting { attempt } => format!("Reconnecting (attempt {attempt})"),
            Self::Unavailable => "Live updates unavailable; refreshing periodically".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn video(stage: Option<Stage>, progress: Option<u8>) -> Video {
        Video {
            id: "v1".into(),
            title: Some("Talk".into()),
            url: None,
            import_stage: stage,
            import_progress: progress,
            import_error: None,
        }
    }

    fn record(stage: Stage, raw: u8, display: f32) -> ProgressRecord {
        ProgressRecord {
            entity_id: "v1".into(),
            stage,
            raw_progress: raw,
            display_progress: display,
            error: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn falls_back_to_persisted_fields() {
        assert_eq!(resolve_render_state(None, &video(None, None)), RenderState::Idle);
        assert_eq!(
            resolve_render_state(None, &video(Some(Stage::Complete), Some(100))),
            RenderState::Idle
        );
        assert_eq!(
            resolve_render_state(None, &video(Some(Stage::Error), None)),
            RenderState::Error { message: None }
        );
        assert_eq!(
            resolve_render_state(None, &video(Some(Stage::Metadata), Some(25))),
            RenderState::Importing {
                stage: Stage::Metadata,
                progress: 25.0,
                smoothed: false,
            }
        );
    }

    #[test]
    fn store_record_outranks_persisted_fields() {
        let persisted = video(Some(Stage::Complete), Some(100));
        let state = resolve_render_state(Some(&record(Stage::Captions, 50, 40.0)), &persisted);
        assert_eq!(
            state,
            RenderState::Importing {
                stage: Stage::Captions,
                progress: 40.0,
                smoothed: true,
            }
        );

        let behind_db = video(Some(Stage::Chapters), Some(75));
        assert_eq!(
            resolve_render_state(Some(&record(Stage::Complete, 100, 100.0)), &behind_db),
            RenderState::Idle
        );
        assert!(matches!(
            resolve_render_state(Some(&record(Stage::Error, 0, 0.0)), &behind_db),
            RenderState::Error { .. }
        ));
    }

    #[test]
    fn pushed_failure_reason_shows_before_the_next_poll() {
        let lagging = video(Some(Stage::Captions), Some(50));
        let mut failed = record(Stage::Error, 0, 0.0);
        failed.error = Some("video is private".into());

        let state = resolve_render_state(Some(&failed), &lagging);
        assert_eq!(
            state,
            RenderState::Error {
                message: Some("video is private".into())
            }
        );
        assert_eq!(
            CardView::from_state(&state).error_badge.as_deref(),
            Some("video is private")
        );

        let mut polled = lagging.clone();
        polled.import_error = Some("from backend".into());
        failed.error = None;
        assert_eq!(
            resolve_render_state(Some(&failed), &polled),
            RenderState::Error {
                message: Some("from backend".into())
            }
        );
    }

    #[test]
    fn clamps_overlay_percent() {
        assert_eq!(overlay_percent(150.0), 100);
        assert_eq!(overlay_percent(-10.0), 0);
        assert_eq!(overlay_percent(42.4), 42);
        assert_eq!(overlay_percent(f32::NAN), 0);
    }

    #[test]
    fn importing_cards_swallow_clicks() {
        let importing = CardView::from_state(&RenderState::Importing {
            stage: Stage::Chapters,
            progress: 80.0,
            smoothed: true,
        });
        assert!(importing.grayscale);
        assert_eq!(importing.overlay_percent, Some(80));
        assert_eq!(importing.click(), ClickOutcome::Swallowed);

        let failed = CardView::from_state(&RenderState::Error {
            message: Some("video unavailable".into()),
        });
        assert_eq!(failed.click(), ClickOutcome::OpenDetail);
        assert_eq!(failed.error_badge.as_deref(), Some("video unavailable"));

        assert_eq!(
            CardView::from_state(&RenderState::Idle).click(),
            ClickOutcome::OpenDetail
        );
    }

    #[test]
    fn banner_distinguishes_first_connect_from_reconnect() {
        let first = ConnectionState {
            status: ConnectionStatus::Connecting,
            reconnecting: false,
            attempts: 0,
        };
        assert_eq!(ConnectionBanner::from_state(first), Some(ConnectionBanner::Connecting));

        let retry = ConnectionState {
            reconnecting: true,
            attempts: 2,
            ..first
        };
        let banner = ConnectionBanner::from_state(retry).unwrap();
        assert_eq!(banner.message(), "Reconnecting (attempt 2)");

        let open = ConnectionState {
            status: ConnectionStatus::Open,
            ..ConnectionState::default()
        };
        assert_eq!(ConnectionBanner::from_state(open), None);
        let closed = ConnectionState {
            status: ConnectionStatus::Closed,
            ..ConnectionState::default()
        };
        assert_eq!(ConnectionBanner::from_state(closed), Some(ConnectionBanner::Unavailable));
    }
}
