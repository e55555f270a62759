use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Url};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::stage::Stage;

/// A catalogued video as the REST layer returns it. The `import_*` fields
/// are owned by the backend; `None` means the row predates import tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lenient_stage")]
    pub import_stage: Option<Stage>,
    #[serde(default, deserialize_with = "clamped_progress")]
    pub import_progress: Option<u8>,
    #[serde(default)]
    pub import_error: Option<String>,
}

impl Video {
    /// Whether the persisted fields say the import is finished. Untracked
    /// rows count as finished.
    pub fn is_settled(&self) -> bool {
        self.import_stage.map(Stage::is_terminal).unwrap_or(true)
    }
}

fn lenient_stage<'de, D>(deserializer: D) -> Result<Option<Stage>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|value| match value.parse::<Stage>() {
        Ok(stage) => Some(stage),
        Err(err) => {
            warn!(?err, "treating unrecognized persisted stage as untracked");
            None
        }
    }))
}

fn clamped_progress<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<f64> = Option::deserialize(deserializer)?;
    Ok(raw
        .filter(|value| value.is_finite())
        .map(|value| value.round().clamp(0.0, 100.0) as u8))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedImport {
    pub url: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkImportResult {
    #[serde(default)]
    pub created: Vec<Video>,
    #[serde(default)]
    pub failed: Vec<FailedImport>,
}

/// The REST collaborator the sync core reads entities from.
#[async_trait]
pub trait VideoApi: Send + Sync {
    async fn list_videos(&self, list_id: &str) -> AppResult<Vec<Video>>;

    async fn bulk_import(&self, list_id: &str, urls: &[String]) -> AppResult<BulkImportResult>;
}

pub struct HttpVideoApi {
    http: Client,
    base: Url,
}

impl HttpVideoApi {
    pub fn new(base_url: &str, timeout: Duration) -> AppResult<Self> {
        let base = Url::parse(base_url)
            .map_err(|err| AppError::Config(format!("invalid API base URL: {err}")))?;
        if base.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "API base URL cannot carry paths: {base_url}"
            )));
        }
        let http = Client::builder()
            .user_agent(concat!("catalog-import-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { http, base })
    }

    fn list_url(&self, list_id: &str, tail: &[&str]) -> AppResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::Config("invalid API base URL".into()))?
            .pop_if_empty()
            .push("lists")
            .push(list_id)
            .push("videos")
            .extend(tail);
        Ok(url)
    }
}

#[async_trait]
impl VideoApi for HttpVideoApi {
    async fn list_videos(&self, list_id: &str) -> AppResult<Vec<Video>> {
        let url = self.list_url(list_id, &[])?;
        let videos: Vec<Video> = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(list_id, count = videos.len(), "fetched list videos");
        Ok(videos)
    }

    async fn bulk_import(&self, list_id: &str, urls: &[String]) -> AppResult<BulkImportResult> {
        #[derive(Serialize)]
        struct RequestBody<'a> {
            urls: &'a [String],
        }

        let url = self.list_url(list_id, &["bulk"])?;
        let result: BulkImportResult = self
            .http
            .post(url)
            .json(&RequestBody { urls })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(result)
    }
}

/// Client-side copy of each list's videos, i.e. what the grid renders from.
#[derive(Clone, Default)]
pub struct VideoCache {
    inner: Arc<RwLock<CacheInner>>,
}

#[derive(Default)]
struct CacheInner {
    videos: HashMap<String, Video>,
    lists: HashMap<String, Vec<String>>,
}

impl VideoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_list(&self, list_id: &str, videos: Vec<Video>) {
        let mut inner = self.inner.write();
        let ids: Vec<String> = videos.iter().map(|video| video.id.clone()).collect();
        for video in videos {
            inner.videos.insert(video.id.clone(), video);
        }
        if let Some(previous) = inner.lists.insert(list_id.to_string(), ids) {
            let CacheInner { videos, lists } = &mut *inner;
            for id in previous {
                if !lists.values().any(|members| members.contains(&id)) {
                    videos.remove(&id);
                }
            }
        }
    }

    pub fn upsert(&self, list_id: &str, video: Video) {
        let mut inner = self.inner.write();
        let members = inner.lists.entry(list_id.to_string()).or_default();
        if !members.contains(&video.id) {
            members.push(video.id.clone());
        }
        inner.videos.insert(video.id.clone(), video);
    }

    pub fn get(&self, id: &str) -> Option<Video> {
        self.inner.read().videos.get(id).cloned()
    }

    pub fn list(&self, list_id: &str) -> Vec<Video> {
        let inner = self.inner.read();
        inner
            .lists
            .get(list_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.videos.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn video(id: &str, stage: Option<Stage>) -> Video {
        Video {
            id: id.into(),
            title: None,
            url: None,
            import_stage: stage,
            import_progress: stage.map(Stage::nominal_progress),
            import_error: None,
        }
    }

    #[test]
    fn decodes_persisted_fields_leniently() {
        let videos: Vec<Video> = serde_json::from_value(json!([
            { "id": "v1", "import_stage": "captions", "import_progress": 50 },
            { "id": "v2", "import_stage": null, "import_progress": null },
            { "id": "v3", "import_stage": "transcoding", "import_progress": 140.2 },
            { "id": "v4" }
        ]))
        .unwrap();

        assert_eq!(videos[0].import_stage, Some(Stage::Captions));
        assert_eq!(videos[0].import_progress, Some(50));
        assert_eq!(videos[1].import_stage, None);
        assert_eq!(videos[2].import_stage, None);
        assert_eq!(videos[2].import_progress, Some(100));
        assert_eq!(videos[3].import_progress, None);
    }

    #[test]
    fn untracked_rows_count_as_settled() {
        assert!(video("a", None).is_settled());
        assert!(video("b", Some(Stage::Error)).is_settled());
        assert!(!video("c", Some(Stage::Metadata)).is_settled());
    }

    #[test]
    fn replace_list_drops_rows_no_longer_listed() {
        let cache = VideoCache::new();
        cache.upsert("list", video("a", Some(Stage::Created)));
        cache.upsert("list", video("b", Some(Stage::Created)));
        cache.upsert("other", video("b", Some(Stage::Created)));

        cache.replace_list("list", vec![video("a", Some(Stage::Metadata))]);

        assert_eq!(cache.list("list").len(), 1);
        assert_eq!(
            cache.get("a").unwrap().import_stage,
            Some(Stage::Metadata)
        );
        assert!(cache.get("b").is_some(), "still listed elsewhere");
    }

    #[test]
    fn builds_list_urls_under_base_path() {
        let api = HttpVideoApi::new("http://localhost:9000/api/", Duration::from_secs(1)).unwrap();
        let url = api.list_url("watch later", &["bulk"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:9000/api/lists/watch%20later/videos/bulk"
        );
    }
}
