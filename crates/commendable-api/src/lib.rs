//! The recommendation engine: event application, the change queue,
//! collaborative-filtering reads, and the ingestion and refresh runtimes.

mod changes;
pub mod config;
pub mod keys;
mod mutation;
pub mod pipeline;
pub mod recommend;
pub mod scheduler;

use std::sync::Arc;

use anyhow::{Context, Result};
use commendable_core::{
    codec::decode_f64, Event, EventKind, Message, OrderedStore, RecommendationsRequest, ScanRange,
};
use time::OffsetDateTime;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

pub use config::EngineConfig;
pub use pipeline::{receive_datagrams, Backlog, Ingestor, MAX_DATAGRAM_SIZE};
pub use scheduler::RefreshScheduler;

/// Shared handle to the engine. Cloning is cheap; clones share the store, the
/// ingestion backlog and the change signal.
#[derive(Clone)]
pub struct CommendableApi {
    store: Arc<dyn OrderedStore>,
    config: EngineConfig,
    backlog: Arc<Backlog>,
    changed: Arc<Notify>,
}

impl CommendableApi {
    #[must_use]
    pub fn new(store: Arc<dyn OrderedStore>, config: EngineConfig) -> Self {
        Self { store, config, backlog: Arc::new(Backlog::new()), changed: Arc::new(Notify::new()) }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    pub(crate) fn changes_notified(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Decode and apply one ingestion payload.
    ///
    /// Malformed payloads are logged and dropped; the result is then
    /// `Ok(None)`.
    ///
    /// # Errors
    /// Returns an error when a store write fails.
    pub fn apply_message(&self, payload: &[u8]) -> Result<Option<EventKind>> {
        let event = match Event::decode(payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, size = payload.len(), "dropping ingestion payload");
                return Ok(None);
            }
        };
        self.apply(&event)?;
        Ok(Some(event.kind()))
    }

    /// Apply an event at the current time.
    ///
    /// # Errors
    /// Returns an error when a store write fails.
    pub fn apply(&self, event: &Event) -> Result<()> {
        self.apply_at(event, OffsetDateTime::now_utc())
    }

    /// Apply an event at clock reading `now`.
    ///
    /// # Errors
    /// Returns an error when a store write fails.
    pub fn apply_at(&self, event: &Event, now: OffsetDateTime) -> Result<()> {
        let queued =
            mutation::apply_event(self.store.as_ref(), self.config.retention, event, now)
                .with_context(|| format!("failed to apply {} event", event.kind()))?;
        if queued {
            self.changed.notify_one();
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the store scan fails or a weight does not decode.
    pub fn likes(&self, user: &str) -> Result<Vec<Message>> {
        let items = self
            .store
            .slice(&keys::user_likes(user), &ScanRange::all())
            .with_context(|| format!("failed to list likes of {user}"))?;
        items
            .into_iter()
            .map(|item| -> Result<Message> {
                Ok(Message {
                    user: user.to_string(),
                    object: String::from_utf8_lossy(&item.key).into_owned(),
                    weight: Some(decode_f64(&item.value)?),
                    ..Message::default()
                })
            })
            .collect()
    }

    /// # Errors
    /// Returns an error when the store scan fails.
    pub fn views(&self, user: &str) -> Result<Vec<Message>> {
        let items = self
            .store
            .slice(&keys::user_views(user), &ScanRange::all())
            .with_context(|| format!("failed to list views of {user}"))?;
        Ok(items
            .into_iter()
            .map(|item| Message {
                user: user.to_string(),
                object: String::from_utf8_lossy(&item.key).into_owned(),
                ..Message::default()
            })
            .collect())
    }

    /// # Errors
    /// Returns an error when the store scan fails.
    pub fn actives(&self) -> Result<Vec<Message>> {
        let items = self
            .store
            .slice(&keys::active_objects(), &ScanRange::all())
            .context("failed to list active objects")?;
        Ok(items
            .into_iter()
            .map(|item| Message {
                object: String::from_utf8_lossy(&item.key).into_owned(),
                ..Message::default()
            })
            .collect())
    }

    /// Top recommendations for `user`, heaviest first. Rebuilds the
    /// materialized range inline when it is empty.
    ///
    /// # Errors
    /// Returns an error when a store call fails or a stored weight does not
    /// decode.
    pub fn recommend(&self, user: &str, request: &RecommendationsRequest) -> Result<Vec<Message>> {
        recommend::read(self.store.as_ref(), user, request)
            .with_context(|| format!("failed to recommend for {user}"))
    }

    /// Recompute and materialize `user`'s recommendations.
    ///
    /// # Errors
    /// Returns an error when a store call fails or a stored weight does not
    /// decode.
    pub fn refresh(&self, user: &str) -> Result<usize> {
        recommend::refresh(self.store.as_ref(), user)
            .with_context(|| format!("failed to refresh recommendations for {user}"))
    }

    /// # Errors
    /// Returns an error when the change queue cannot be read or updated.
    pub fn pop_change(&self) -> Result<Option<String>> {
        changes::pop_oldest(self.store.as_ref()).context("failed to pop change queue")
    }

    /// # Errors
    /// Returns an error when the change queue cannot be counted.
    pub fn pending_changes(&self) -> Result<usize> {
        changes::pending(self.store.as_ref()).context("failed to count change queue")
    }
}

#[cfg(test)]
mod tests {
    use commendable_core::{FilterMode, MemoryStore};
    use commendable_store_sqlite::SqliteStore;
    use time::Duration;

    use super::*;

    fn memory_api() -> (Arc<MemoryStore>, CommendableApi) {
        let store = Arc::new(MemoryStore::new());
        let api = CommendableApi::new(store.clone(), EngineConfig::default());
        (store, api)
    }

    fn like(user: &str, object: &str, weight: f64) -> Event {
        Event::Like {
            user: user.to_string(),
            object: object.to_string(),
            weight,
            dont_activate: false,
        }
    }

    fn view(user: &str, object: &str) -> Event {
        Event::View { user: user.to_string(), object: object.to_string() }
    }

    fn request(num: usize, actives: FilterMode, viewed: FilterMode) -> RecommendationsRequest {
        RecommendationsRequest { num, actives, viewed }
    }

    fn objects(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|message| message.object.as_str()).collect()
    }

    fn weight(messages: &[Message], object: &str) -> f64 {
        messages
            .iter()
            .find(|message| message.object == object)
            .and_then(|message| message.weight)
            .unwrap_or_else(|| panic!("missing weight for {object}"))
    }

    // Test IDs: TAPI-001
    #[test]
    fn single_shared_like_recommends_at_ln_two() -> Result<()> {
        let (_, api) = memory_api();
        api.apply(&like("A", "X", 1.0))?;
        api.apply(&like("B", "X", 1.0))?;
        api.apply(&like("B", "Y", 1.0))?;

        let result = api.recommend("A", &request(10, FilterMode::None, FilterMode::None))?;
        assert_eq!(objects(&result), vec!["Y"]);
        assert!((weight(&result, "Y") - std::f64::consts::LN_2).abs() < 1e-12);
        assert_eq!(
            serde_json::to_value(&result)?,
            serde_json::json!([{ "Object": "Y", "Weight": std::f64::consts::LN_2 }])
        );
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn repeated_likes_keep_the_latest_weight() -> Result<()> {
        let (_, api) = memory_api();
        api.apply(&like("a", "x", 1.0))?;
        api.apply(&like("a", "y", 2.0))?;
        api.apply(&like("a", "x", 5.0))?;

        let likes = api.likes("a")?;
        assert_eq!(objects(&likes), vec!["x", "y"]);
        assert_eq!(weight(&likes, "x"), 5.0);
        assert_eq!(likes[0].user, "a");
        assert_eq!(api.pending_changes()?, 3);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn later_view_expires_old_views_and_actives() -> Result<()> {
        let (_, api) = memory_api();
        let start = OffsetDateTime::now_utc() - Duration::days(30);
        api.apply_at(&view("a", "old"), start)?;
        api.apply_at(&view("b", "other"), start)?;
        api.apply_at(&view("a", "fresh"), start + Duration::days(15))?;

        assert_eq!(objects(&api.views("a")?), vec!["fresh"]);
        assert_eq!(objects(&api.actives()?), vec!["fresh"]);
        // b's log is only swept by b's own views.
        assert_eq!(objects(&api.views("b")?), vec!["other"]);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn deactivate_leaves_history_alone() -> Result<()> {
        let (_, api) = memory_api();
        api.apply(&like("a", "x", 1.0))?;
        api.apply(&view("a", "x"))?;
        let likes_before = api.likes("a")?;
        let views_before = api.views("a")?;

        api.apply(&Event::Deactivate { object: "x".to_string() })?;
        assert!(api.actives()?.is_empty());
        assert_eq!(api.likes("a")?, likes_before);
        assert_eq!(api.views("a")?, views_before);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn never_recommends_own_likes_and_weights_follow_similarity() -> Result<()> {
        let (_, api) = memory_api();
        for object in ["x1", "x2"] {
            api.apply(&like("a", object, 1.0))?;
        }
        for object in ["x1", "p"] {
            api.apply(&like("b", object, 1.0))?;
        }
        for object in ["x1", "x2", "q"] {
            api.apply(&like("c", object, 1.0))?;
        }

        let result = api.recommend("a", &request(10, FilterMode::None, FilterMode::None))?;
        assert_eq!(objects(&result), vec!["q", "p"]);
        assert!((weight(&result, "q") - 3.0_f64.ln()).abs() < 1e-12);
        assert!((weight(&result, "p") - 2.0_f64.ln()).abs() < 1e-12);
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn filters_intersect_or_reject_actives_and_views() -> Result<()> {
        let (_, api) = memory_api();
        api.apply(&like("a", "x", 1.0))?;
        api.apply(&like("b", "x", 1.0))?;
        api.apply(&like("b", "y", 1.0))?;
        api.apply(&Event::Like {
            user: "b".to_string(),
            object: "z".to_string(),
            weight: 1.0,
            dont_activate: true,
        })?;
        api.apply(&view("a", "y"))?;

        let unfiltered = api.recommend("a", &request(10, FilterMode::None, FilterMode::None))?;
        // Equal weights come back in descending object order.
        assert_eq!(objects(&unfiltered), vec!["z", "y"]);

        let cases = [
            (FilterMode::Reject, FilterMode::None, vec!["z"]),
            (FilterMode::Intersect, FilterMode::None, vec!["y"]),
            (FilterMode::None, FilterMode::Reject, vec!["z"]),
            (FilterMode::None, FilterMode::Intersect, vec!["y"]),
            (FilterMode::Intersect, FilterMode::Reject, vec![]),
        ];
        for (actives, viewed, expected) in cases {
            let result = api.recommend("a", &request(10, actives, viewed))?;
            assert_eq!(objects(&result), expected, "actives={actives:?} viewed={viewed:?}");
        }

        // Filtering leaves the materialized range intact.
        let again = api.recommend("a", &request(10, FilterMode::None, FilterMode::None))?;
        assert_eq!(objects(&again), vec!["z", "y"]);
        Ok(())
    }

    // Test IDs: TAPI-007
    #[test]
    fn result_length_is_capped_by_num() -> Result<()> {
        let (_, api) = memory_api();
        api.apply(&like("a", "x", 1.0))?;
        for object in ["x", "p", "q", "r"] {
            api.apply(&like("b", object, 1.0))?;
        }

        assert_eq!(api.recommend("a", &request(2, FilterMode::None, FilterMode::None))?.len(), 2);
        assert_eq!(api.recommend("a", &request(50, FilterMode::None, FilterMode::None))?.len(), 3);
        assert!(api.recommend("a", &request(0, FilterMode::None, FilterMode::None))?.is_empty());
        let nobody = api.recommend("nobody", &request(5, FilterMode::None, FilterMode::None))?;
        assert!(nobody.is_empty());
        Ok(())
    }

    // Test IDs: TAPI-008
    #[test]
    fn reads_serve_the_materialized_range_until_refreshed() -> Result<()> {
        let (_, api) = memory_api();
        api.apply(&like("a", "x", 1.0))?;
        api.apply(&like("b", "x", 1.0))?;
        api.apply(&like("b", "y", 1.0))?;
        let unfiltered = request(10, FilterMode::None, FilterMode::None);
        assert_eq!(objects(&api.recommend("a", &unfiltered)?), vec!["y"]);

        api.apply(&like("c", "x", 1.0))?;
        api.apply(&like("c", "w", 1.0))?;
        assert_eq!(objects(&api.recommend("a", &unfiltered)?), vec!["y"]);

        assert_eq!(api.refresh("a")?, 2);
        assert_eq!(objects(&api.recommend("a", &unfiltered)?), vec!["y", "w"]);
        Ok(())
    }

    // Test IDs: TAPI-009
    #[test]
    fn non_numeric_weight_fails_the_request() -> Result<()> {
        let (store, api) = memory_api();
        api.apply(&like("a", "x", 1.0))?;
        api.apply(&like("b", "x", 1.0))?;
        store.put(&keys::user_likes("b"), b"y", b"not-a-float")?;

        let result = api.recommend("a", &request(10, FilterMode::None, FilterMode::None));
        assert!(result.is_err());
        Ok(())
    }

    // Test IDs: TAPI-010
    #[test]
    fn malformed_messages_are_dropped_without_error() -> Result<()> {
        let (_, api) = memory_api();
        assert_eq!(api.apply_message(b"{")?, None);
        assert_eq!(api.apply_message(br#"{"Type":"view","Object":"x"}"#)?, None);
        assert_eq!(
            api.apply_message(br#"{"Type":"like","User":"a","Object":"x","Weight":2.5}"#)?,
            Some(EventKind::Like)
        );
        assert_eq!(weight(&api.likes("a")?, "x"), 2.5);
        assert!(api.views("a")?.is_empty());
        Ok(())
    }

    // Test IDs: TAPI-011
    #[test]
    fn sqlite_backed_engine_matches_in_memory_results() -> Result<()> {
        let store = SqliteStore::open_in_memory()?;
        store.migrate()?;
        let api = CommendableApi::new(Arc::new(store), EngineConfig::default());
        api.apply(&like("A", "X", 1.0))?;
        api.apply(&like("B", "X", 1.0))?;
        api.apply(&like("B", "Y", 1.0))?;
        api.apply(&view("A", "Y"))?;

        let all = api.recommend("A", &request(10, FilterMode::None, FilterMode::None))?;
        assert_eq!(objects(&all), vec!["Y"]);
        let unseen = api.recommend("A", &request(10, FilterMode::None, FilterMode::Reject))?;
        assert!(unseen.is_empty());
        assert_eq!(api.likes("B")?.len(), 2);
        Ok(())
    }

    // Test IDs: TAPI-012
    #[test]
    fn liking_a_recommended_object_removes_it_before_refresh() -> Result<()> {
        let (store, api) = memory_api();
        api.apply(&like("A", "X", 1.0))?;
        api.apply(&like("B", "X", 1.0))?;
        api.apply(&like("B", "Y", 1.0))?;
        api.apply(&like("B", "Z", 1.0))?;
        let unfiltered = request(10, FilterMode::None, FilterMode::None);
        assert_eq!(objects(&api.recommend("A", &unfiltered)?), vec!["Z", "Y"]);

        api.apply(&like("A", "Y", 1.0))?;
        // The materialized range is stale until the queued change is processed.
        assert_eq!(store.count(&keys::user_recommended("A"))?, 2);
        assert_eq!(objects(&api.recommend("A", &unfiltered)?), vec!["Z"]);
        let unseen = api.recommend("A", &request(10, FilterMode::Intersect, FilterMode::Reject))?;
        assert_eq!(objects(&unseen), vec!["Z"]);
        Ok(())
    }
}
