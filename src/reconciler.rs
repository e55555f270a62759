use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::catalog::{Video, VideoApi, VideoCache};
use crate::store::ProgressStore;

/// Entity ids created by one bulk-import submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchHandle {
    ids: Vec<String>,
}

impl BatchHandle {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut handle = Self::default();
        for id in ids {
            let id = id.into();
            if !handle.ids.contains(&id) {
                handle.ids.push(id);
            }
        }
        handle
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// True once every tracked id is present in `fetched` with a terminal
/// persisted stage. Ids missing from the fetch keep the batch open.
pub fn batch_settled(handle: &BatchHandle, fetched: &[Video]) -> bool {
    let by_id: HashMap<&str, &Video> = fetched.iter().map(|v| (v.id.as_str(), v)).collect();
    handle.ids.iter().all(|id| {
        by_id
            .get(id.as_str())
            .map(|video| video.is_settled())
            .unwrap_or(false)
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub list_id: String,
    pub entity_ids: Vec<String>,
    pub polls: u32,
    pub failed_polls: u32,
}

#[derive(Clone)]
pub struct PollReconciler {
    api: Arc<dyn VideoApi>,
    cache: VideoCache,
    store: ProgressStore,
    interval: Duration,
}

impl PollReconciler {
    pub fn new(
        api: Arc<dyn VideoApi>,
        cache: VideoCache,
        store: ProgressStore,
        interval: Duration,
    ) -> Self {
        Self {
            api,
            cache,
            store,
            interval,
        }
    }

    /// Starts polling `list_id` until every entity in `batch` is settled.
    pub fn track(&self, list_id: impl Into<String>, batch: BatchHandle) -> BatchPoll {
        let reconciler = self.clone();
        let list_id = list_id.into();
        self.store.pin(batch.ids());
        let task =
            tokio::spawn(async move { reconciler.poll_until_settled(list_id, batch).await });
        BatchPoll { task: Some(task) }
    }

    async fn poll_until_settled(&self, list_id: String, batch: BatchHandle) -> BatchOutcome {
        let mut polls = 0_u32;
        let mut failed_polls = 0_u32;

        if !batch.is_empty() {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                polls += 1;
                let videos = match self.api.list_videos(&list_id).await {
                    Ok(videos) => videos,
                    Err(err) => {
                        failed_polls += 1;
                        warn!(
                            ?err,
                            list_id = %list_id,
                            polls,
                            "batch poll failed; retrying next tick"
                        );
                        continue;
                    }
                };
                let settled = batch_settled(&batch, &videos);
                self.cache.replace_list(&list_id, videos);
                if settled {
                    break;
                }
                debug!(list_id = %list_id, polls, "batch still importing");
            }
        }

        self.store.settle(batch.ids());
        info!(list_id = %list_id, entities = batch.len(), polls, "import batch settled");
        BatchOutcome {
            list_id,
            entity_ids: batch.ids,
            polls,
            failed_polls,
        }
    }
}

/// A running batch poll. Dropping it cancels polling without touching the
/// progress store.
pub struct BatchPoll {
    task: Option<JoinHandle<BatchOutcome>>,
}

impl BatchPoll {
    pub async fn wait(mut self) -> Result<BatchOutcome, JoinError> {
        match self.task.take() {
            Some(task) => task.await,
            None => unreachable!("batch poll awaited twice"),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task
            .as_ref()
            .map(|task| task.is_finished())
            .unwrap_or(true)
    }

    pub fn cancel(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for BatchPoll {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::catalog::BulkImportResult;
    use crate::errors::{AppError, AppResult};
    use crate::stage::Stage;

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

    struct ScriptedApi {
        responses: Mutex<VecDeque<AppResult<Vec<Video>>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedApi {
        fn new(responses: Vec<AppResult<Vec<Video>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl VideoApi for ScriptedApi {
        async fn list_videos(&self, _list_id: &str) -> AppResult<Vec<Video>> {
            *self.calls.lock() += 1;
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(AppError::Config("script exhausted".into())))
        }

        async fn bulk_import(
            &self,
            _list_id: &str,
            _urls: &[String],
        ) -> AppResult<BulkImportResult> {
            Ok(BulkImportResult::default())
        }
    }

    #[test]
    fn batch_handle_deduplicates_in_order() {
        let handle = BatchHandle::new(["b", "a", "b"]);
        assert_eq!(handle.ids(), ["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn missing_ids_keep_batch_open() {
        let handle = BatchHandle::new(["a", "b"]);
        let fetched = vec![video("a", Some(Stage::Complete))];
        assert!(!batch_settled(&handle, &fetched));
    }

    #[test]
    fn settles_on_terminal_or_untracked_rows() {
        let handle = BatchHandle::new(["a", "b", "c"]);
        let fetched = vec![
            video("a", Some(Stage::Complete)),
            video("b", Some(Stage::Error)),
            video("c", None),
            video("unrelated", Some(Stage::Metadata)),
        ];
        assert!(batch_settled(&handle, &fetched));

        let pending = vec![
            video("a", Some(Stage::Complete)),
            video("b", Some(Stage::Chapters)),
            video("c", None),
        ];
        assert!(!batch_settled(&handle, &pending));
    }

    #[tokio::test]
    async fn polls_through_failures_until_settled() {
        let api = ScriptedApi::new(vec![
            Ok(vec![video("a", Some(Stage::Metadata))]),
            Err(AppError::Config("timeout".into())),
            Ok(vec![
                video("a", Some(Stage::Complete)),
                video("b", Some(Stage::Captions)),
            ]),
            Ok(vec![
                video("a", Some(Stage::Complete)),
                video("b", Some(Stage::Complete)),
            ]),
        ]);
        let cache = VideoCache::new();
        let store = ProgressStore::new();
        store.set_progress("a", 100, Stage::Complete);
        store.set_progress("b", 50, Stage::Captions);
        store.set_progress("elsewhere", 25, Stage::Metadata);

        let reconciler = PollReconciler::new(
            api.clone(),
            cache.clone(),
            store.clone(),
            Duration::from_millis(1),
        );
        let outcome = reconciler
            .track("list", BatchHandle::new(["a", "b"]))
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.polls, 4);
        assert_eq!(outcome.failed_polls, 1);
        assert_eq!(*api.calls.lock(), 4);
        assert!(store.get_progress("a").is_none());
        assert!(store.get_progress("b").is_none());
        assert!(store.get_progress("elsewhere").is_some());
        assert_eq!(cache.get("b").unwrap().import_stage, Some(Stage::Complete));

        // A redelivered progress push can no longer hold the card in importing.
        assert!(!store.set_progress("b", 50, Stage::Captions));
        assert!(store.get_progress("b").is_none());
    }

    #[tokio::test]
    async fn empty_batch_settles_without_fetching() {
        let api = ScriptedApi::new(vec![]);
        let reconciler = PollReconciler::new(
            api.clone(),
            VideoCache::new(),
            ProgressStore::new(),
            Duration::from_millis(1),
        );
        let outcome = reconciler
            .track("list", BatchHandle::default())
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.polls, 0);
        assert_eq!(*api.calls.lock(), 0);
    }

    #[tokio::test]
    async fn cancel_stops_polling_and_keeps_records() {
        let api = ScriptedApi::new(vec![]);
        let store = ProgressStore::new();
        store.set_progress("a", 25, Stage::Metadata);
        let reconciler = PollReconciler::new(
            api.clone(),
            VideoCache::new(),
            store.clone(),
            Duration::from_millis(5),
        );
        let poll = reconciler.track("list", BatchHandle::new(["a"]));
        tokio::time::sleep(Duration::from_millis(30)).await;
        poll.cancel();
        let calls_at_cancel = *api.calls.lock();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(*api.calls.lock(), calls_at_cancel);
        assert!(store.get_progress("a").is_some());
    }
}
