use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::RelayError;

/// Last known values of the remote control document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteState {
    /// 1 = heart rate only, 2 = lateral raises, 3 = squats, 4 = bicep curls.
    pub exercise: i64,
    pub heart_rate: f64,
    pub rep_count: i64,
    pub start_flag: bool,
}

impl Default for RemoteState {
    fn default() -> Self {
        Self {
            exercise: 1,
            heart_rate: 0.0,
            rep_count: 0,
            start_flag: false,
        }
    }
}

impl RemoteState {
    /// Overlay the fields present in `document` onto this state.
    ///
    /// The store has been written with both camelCase and snake_case keys.
    /// Aliases are tried in order and the first truthy one wins; if none is
    /// truthy the last alias present decides.
    pub fn merged_with(&self, document: &Value) -> RemoteState {
        let mut next = self.clone();
        let Some(fields) = document.as_object() else {
            return next;
        };

        if let Some(exercise) = fields.get("exercise").and_then(as_integer) {
            next.exercise = exercise;
        }
        if let Some(value) = aliased(fields, &["heartRate", "heart_rate"]) {
            next.heart_rate = value.as_f64().unwrap_or(0.0);
        }
        if let Some(value) = aliased(fields, &["repCount", "rep_count"]) {
            next.rep_count = as_integer(value).unwrap_or(0);
        }
        if let Some(value) = aliased(fields, &["startFlag", "start_flag", "start"]) {
            next.start_flag = truthy(value);
        }
        next
    }
}

fn aliased<'a>(fields: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    if !keys.iter().any(|key| fields.contains_key(*key)) {
        return None;
    }
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .find(|value| truthy(value))
        .or_else(|| keys.iter().rev().find_map(|key| fields.get(*key)))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(flag) => Some(i64::from(*flag)),
        _ => None,
    }
}

/// Read side of the remote control store.
///
/// `fetch_document` may block; it is only ever called from the dedicated
/// polling thread. `Ok(None)` means the store has nothing to say and the
/// cached state stands.
pub trait RemoteStateSource: Send + 'static {
    fn fetch_document(&mut self) -> Result<Option<Value>, RelayError>;

    fn describe(&self) -> String;
}

impl RemoteStateSource for Box<dyn RemoteStateSource> {
    fn fetch_document(&mut self) -> Result<Option<Value>, RelayError> {
        (**self).fetch_document()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Source used when no store is configured: always empty.
#[derive(Debug, Default)]
pub struct DetachedSource;

impl RemoteStateSource for DetachedSource {
    fn fetch_document(&mut self) -> Result<Option<Value>, RelayError> {
        Ok(None)
    }

    fn describe(&self) -> String {
        "detached (cached defaults)".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct FirebaseSettings {
    pub database_url: String,
    pub path: String,
    pub auth_token: Option<String>,
    pub timeout: Duration,
}

/// Polls a Firebase Realtime Database node over its REST interface.
pub struct FirebaseSource {
    settings: FirebaseSettings,
    client: Option<reqwest::blocking::Client>,
}

impl FirebaseSource {
    pub fn new(settings: FirebaseSettings) -> Self {
        Self {
            settings,
            client: None,
        }
    }

    pub fn node_url(&self) -> String {
        format!(
            "{}/{}.json",
            self.settings.database_url.trim_end_matches('/'),
            self.settings.path.trim_matches('/')
        )
    }

    // The blocking client owns a runtime of its own, so it is built lazily on
    // the polling thread instead of inside the async server.
    fn client(&mut self) -> Result<&reqwest::blocking::Client, RelayError> {
        if self.client.is_none() {
            let client = reqwest::blocking::Client::builder()
                .timeout(self.settings.timeout)
                .build()
                .map_err(|err| RelayError::TransientFetch(err.to_string()))?;
            self.client = Some(client);
        }
        self.client
            .as_ref()
            .ok_or_else(|| RelayError::TransientFetch("http client unavailable".into()))
    }
}

impl RemoteStateSource for FirebaseSource {
    fn fetch_document(&mut self) -> Result<Option<Value>, RelayError> {
        let url = self.node_url();
        let auth = self.settings.auth_token.clone();
        let client = self.client()?;

        let mut request = client.get(&url);
        if let Some(token) = auth {
            request = request.query(&[("auth", token)]);
        }
        let document: Value = request
            .send()
            .and_then(|response| response.error_for_status())
            .and_then(|response| response.json())
            .map_err(|err| RelayError::TransientFetch(err.to_string()))?;

        debug!(%url, "fetched remote state document");
        Ok(document.is_object().then_some(document))
    }

    fn describe(&self) -> String {
        format!("firebase {}", self.node_url())
    }
}

/// Shared, read-consistent copy of the latest remote state.
///
/// Updates swap the whole snapshot; readers hold an `Arc` to a complete
/// state and never see a half-applied document.
#[derive(Clone, Default)]
pub struct RemoteStateCache {
    current: Arc<RwLock<Arc<RemoteState>>>,
}

impl RemoteStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<RemoteState> {
        Arc::clone(&*self.current.read())
    }

    pub fn replace(&self, state: RemoteState) {
        *self.current.write() = Arc::new(state);
    }

    /// Fetch from `source` and fold the result into the cache. On failure
    /// the previous snapshot is left untouched.
    pub fn refresh<S: RemoteStateSource + ?Sized>(
        &self,
        source: &mut S,
    ) -> Result<Arc<RemoteState>, RelayError> {
        let Some(document) = source.fetch_document()? else {
            return Ok(self.snapshot());
        };
        let next = Arc::new(self.snapshot().merged_with(&document));
        *self.current.write() = Arc::clone(&next);
        Ok(next)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Replays a fixed script of fetch results, then repeats the last one.
    pub(crate) struct ScriptedSource {
        script: VecDeque<Result<Option<Value>, String>>,
        last: Result<Option<Value>, String>,
        pub(crate) fetches: usize,
    }

    impl ScriptedSource {
        pub(crate) fn new(script: Vec<Result<Option<Value>, String>>) -> Self {
            Self {
                script: script.into(),
                last: Ok(None),
                fetches: 0,
            }
        }

        pub(crate) fn documents(documents: Vec<Value>) -> Self {
            Self::new(documents.into_iter().map(|d| Ok(Some(d))).collect())
        }
    }

    impl RemoteStateSource for ScriptedSource {
        fn fetch_document(&mut self) -> Result<Option<Value>, RelayError> {
            self.fetches += 1;
            if let Some(next) = self.script.pop_front() {
                self.last = next;
            }
            self.last.clone().map_err(RelayError::TransientFetch)
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    #[test_timeout::timeout]
    fn merge_prefers_primary_spelling() {
        let state = RemoteState::default().merged_with(&json!({
            "exercise": 3,
            "heartRate": 101,
            "repCount": 7,
            "startFlag": true
        }));
        assert_eq!(
            state,
            RemoteState {
                exercise: 3,
                heart_rate: 101.0,
                rep_count: 7,
                start_flag: true
            }
        );
    }

    #[test_timeout::timeout]
    fn merge_accepts_snake_case_and_short_aliases() {
        let state = RemoteState::default().merged_with(&json!({
            "heart_rate": 88.5,
            "rep_count": 2,
            "start": true
        }));
        assert_eq!(state.heart_rate, 88.5);
        assert_eq!(state.rep_count, 2);
        assert!(state.start_flag);
        assert_eq!(state.exercise, 1);
    }

    #[test_timeout::timeout]
    fn falsy_primary_falls_through_to_alias() {
        let state = RemoteState::default().merged_with(&json!({
            "heartRate": 0,
            "heart_rate": 95,
            "startFlag": false,
            "start": 1
        }));
        assert_eq!(state.heart_rate, 95.0);
        assert!(state.start_flag);
    }

    #[test_timeout::timeout]
    fn absent_fields_keep_cached_values() {
        let cached = RemoteState {
            exercise: 4,
            heart_rate: 120.0,
            rep_count: 9,
            start_flag: true,
        };
        assert_eq!(cached.merged_with(&json!({})), cached);
        let stopped = cached.merged_with(&json!({ "startFlag": false }));
        assert!(!stopped.start_flag);
        assert_eq!(stopped.rep_count, 9);
    }

    #[test_timeout::timeout]
    fn refresh_failure_keeps_previous_snapshot() {
        let cache = RemoteStateCache::new();
        let mut source = ScriptedSource::new(vec![
            Ok(Some(json!({ "exercise": 2, "heartRate": 90 }))),
            Err("network unreachable".into()),
        ]);

        let first = cache.refresh(&mut source).unwrap();
        assert_eq!(first.exercise, 2);

        let err = cache.refresh(&mut source).unwrap_err();
        assert!(matches!(err, RelayError::TransientFetch(_)));
        assert_eq!(cache.snapshot().exercise, 2);
        assert_eq!(cache.snapshot().heart_rate, 90.0);
    }

    #[test_timeout::timeout]
    fn detached_source_leaves_defaults() {
        let cache = RemoteStateCache::new();
        let state = cache.refresh(&mut DetachedSource).unwrap();
        assert_eq!(*state, RemoteState::default());
    }

    #[test_timeout::timeout]
    fn firebase_node_url_is_normalised() {
        let source = FirebaseSource::new(FirebaseSettings {
            database_url: "https://example.firebasedatabase.app/".into(),
            path: "/fitness/".into(),
            auth_token: None,
            timeout: Duration::from_secs(1),
        });
        assert_eq!(
            source.node_url(),
            "https://example.firebasedatabase.app/fitness.json"
        );
    }
}
