use std::collections::HashMap;
use std::sync::Arc;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Well-known key namespaces inside a [`WorkflowContext`].
///
/// - `global.*` belongs to the orchestration core and is shared by every topic
///   of a conversation.
/// - `subtopic.*` carries the hand-down protocol between a parent topic and the
///   sub-topic it waits on.
/// - Anything else is owned by the topic that writes it. Topics should prefix
///   their keys with their own lower-cased name (`profile.age`).
///
/// Prefer the typed accessors on [`WorkflowContext`] over using these strings
/// directly.
pub mod keys {
    pub const CONVERSATION_ACTIVE: &str = "global.conversation_active";
    pub const TOPIC_HISTORY: &str = "global.topic_history";
    pub const TOPIC_CHAIN: &str = "global.topic_chain";
    pub const CURRENT_TOPIC: &str = "global.current_topic";

    /// Completion payload of the last sub-topic a parent waited on.
    pub const SUBTOPIC_COMPLETION: &str = "subtopic.completion";
    /// Resume data the sub-topic handed back alongside its completion payload.
    pub const SUBTOPIC_RESUME_DATA: &str = "subtopic.resume_data";
    /// `true` when the last wait ran out of time instead of seeing a completion.
    pub const SUBTOPIC_TIMED_OUT: &str = "subtopic.timed_out";

    /// Correlation id a sub-topic must echo back when it completes.
    pub fn subtopic_correlation(topic: &str) -> String {
        format!("subtopic.{}.correlation_id", topic.to_lowercase())
    }

    /// Completion payload of a specific sub-topic.
    pub fn subtopic_completion(topic: &str) -> String {
        format!("subtopic.{}.completion", topic.to_lowercase())
    }

    /// Epoch milliseconds after which a parent stops waiting on the sub-topic.
    pub fn subtopic_deadline(topic: &str) -> String {
        format!("subtopic.{}.deadline", topic.to_lowercase())
    }
}

/// Topic history kept in the context is capped to this many entries.
const MAX_TOPIC_HISTORY: usize = 50;

/// Generic wire scalar stored in a [`WorkflowContext`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(untagged)]
pub enum StateValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    List(Vec<StateValue>),
    Map(HashMap<String, StateValue>),
    Null,
}

impl StateValue {
    pub fn as_str(&self) -> Option<&str> {
        if let StateValue::String(s) = self {
            Some(s)
        } else {
            None
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            StateValue::Integer(i) => Some(*i as f64),
            StateValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        if let StateValue::Boolean(b) = self {
            Some(*b)
        } else {
            None
        }
    }

    pub fn as_list(&self) -> Option<&Vec<StateValue>> {
        if let StateValue::List(l) = self {
            Some(l)
        } else {
            None
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, StateValue>> {
        if let StateValue::Map(m) = self {
            Some(m)
        } else {
            None
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    /// Null or an empty string; writing one removes a key.
    pub fn is_absent(&self) -> bool {
        match self {
            StateValue::Null => true,
            StateValue::String(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            StateValue::String(s) => json!(s),
            StateValue::Integer(i) => json!(i),
            StateValue::Float(f) => json!(f),
            StateValue::Boolean(b) => json!(b),
            StateValue::List(l) => json!(l.iter().map(|v| v.to_json()).collect::<Vec<_>>()),
            StateValue::Map(m) => {
                let mut map = serde_json::Map::new();
                for (k, v) in m {
                    map.insert(k.clone(), v.to_json());
                }
                Value::Object(map)
            }
            StateValue::Null => Value::Null,
        }
    }

    /// Unwraps the scalar into `T`, tolerating values that arrived as strings
    /// ("42", "true") or as numbers where a string was expected.
    pub fn coerce<T: DeserializeOwned>(&self) -> Option<T> {
        let json = self.to_json();
        if let Ok(v) = serde_json::from_value::<T>(json.clone()) {
            return Some(v);
        }
        match self {
            StateValue::String(s) => serde_json::from_str::<T>(s.trim()).ok(),
            StateValue::Float(f) if f.fract() == 0.0 && f.is_finite() => {
                serde_json::from_value::<T>(json!(*f as i64)).ok()
            }
            StateValue::Integer(_) | StateValue::Boolean(_) => {
                serde_json::from_value::<T>(Value::String(json.to_string())).ok()
            }
            _ => None,
        }
    }
}

impl From<Value> for StateValue {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => StateValue::String(s),
            Value::Number(n) => match n.as_i64() {
                Some(i) => StateValue::Integer(i),
                None => StateValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::Bool(b) => StateValue::Boolean(b),
            Value::Array(a) => StateValue::List(a.into_iter().map(StateValue::from).collect()),
            Value::Object(o) => StateValue::Map(o.into_iter().map(|(k, v)| (k, StateValue::from(v))).collect()),
            Value::Null => StateValue::Null,
        }
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::String(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::String(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        StateValue::Integer(value)
    }
}

impl From<i32> for StateValue {
    fn from(value: i32) -> Self {
        StateValue::Integer(value as i64)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        StateValue::Float(value)
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Boolean(value)
    }
}

impl<T: Into<StateValue>> From<Vec<T>> for StateValue {
    fn from(value: Vec<T>) -> Self {
        StateValue::List(value.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<StateValue>> From<Option<T>> for StateValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(StateValue::Null)
    }
}

/// Per-conversation key/value store shared by every activity and topic.
///
/// Keys are case-sensitive and the last write wins. Writing [`StateValue::Null`]
/// or an empty string removes the key. There is no transaction support: one
/// conversation turn is expected to be the only writer.
#[derive(Debug, Default)]
pub struct WorkflowContext {
    store: DashMap<String, StateValue>,
}

impl WorkflowContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sets or replaces the value for a key. A null or empty value removes
    /// the key.
    pub fn set(&self, key: &str, value: impl Into<StateValue>) {
        let value = value.into();
        if value.is_absent() {
            self.store.remove(key);
        } else {
            self.store.insert(key.to_string(), value);
        }
    }

    pub fn set_json(&self, key: &str, value: Value) {
        self.set(key, StateValue::from(value));
    }

    /// Tolerant typed read; returns `default` when the key is missing or the
    /// stored value cannot be unwrapped into `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.try_get(key).unwrap_or(default)
    }

    pub fn try_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.store.get(key).and_then(|v| v.value().coerce::<T>())
    }

    /// Raw stored value.
    pub fn value(&self, key: &str) -> Option<StateValue> {
        self.store.get(key).map(|v| v.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<StateValue> {
        self.store.remove(key).map(|(_, v)| v)
    }

    /// All keys, sorted so callers get a stable listing.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.store.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn snapshot(&self) -> HashMap<String, StateValue> {
        self.store
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// The whole store as one JSON object, used as template data.
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        for entry in self.store.iter() {
            map.insert(entry.key().clone(), entry.value().to_json());
        }
        Value::Object(map)
    }

    // --- global.* accessors ---

    pub fn conversation_active(&self) -> bool {
        self.get(keys::CONVERSATION_ACTIVE, false)
    }

    pub fn set_conversation_active(&self, active: bool) {
        self.set(keys::CONVERSATION_ACTIVE, active);
    }

    pub fn topic_history(&self) -> Vec<String> {
        self.get(keys::TOPIC_HISTORY, Vec::new())
    }

    pub fn push_topic_history(&self, topic: &str) {
        let mut history = self.topic_history();
        history.push(topic.to_string());
        if history.len() > MAX_TOPIC_HISTORY {
            let overflow = history.len() - MAX_TOPIC_HISTORY;
            history.drain(..overflow);
        }
        self.set(keys::TOPIC_HISTORY, history);
    }

    pub fn topic_chain(&self) -> Vec<String> {
        self.get(keys::TOPIC_CHAIN, Vec::new())
    }

    pub fn push_topic_chain(&self, topic: &str) {
        let mut chain = self.topic_chain();
        chain.push(topic.to_string());
        self.set(keys::TOPIC_CHAIN, chain);
    }

    /// Takes the oldest chained topic.
    pub fn pop_topic_chain(&self) -> Option<String> {
        let mut chain = self.topic_chain();
        if chain.is_empty() {
            return None;
        }
        let next = chain.remove(0);
        if chain.is_empty() {
            self.remove(keys::TOPIC_CHAIN);
        } else {
            self.set(keys::TOPIC_CHAIN, chain);
        }
        Some(next)
    }

    // --- subtopic.* accessors ---

    pub fn subtopic_correlation(&self, topic: &str) -> Option<String> {
        self.try_get(&keys::subtopic_correlation(topic))
    }

    pub fn set_subtopic_correlation(&self, topic: &str, correlation_id: &str) {
        self.set(&keys::subtopic_correlation(topic), correlation_id);
    }

    pub fn take_subtopic_correlation(&self, topic: &str) -> Option<String> {
        self.remove(&keys::subtopic_correlation(topic))
            .and_then(|v| v.as_str().map(str::to_string))
    }

    pub fn subtopic_timed_out(&self) -> bool {
        self.get(keys::SUBTOPIC_TIMED_OUT, false)
    }

    pub fn subtopic_deadline(&self, topic: &str) -> Option<i64> {
        self.try_get(&keys::subtopic_deadline(topic))
    }

    pub fn set_subtopic_deadline(&self, topic: &str, epoch_millis: i64) {
        self.set(&keys::subtopic_deadline(topic), epoch_millis);
    }

    pub fn clear_subtopic_deadline(&self, topic: &str) {
        self.remove(&keys::subtopic_deadline(topic));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let ctx = WorkflowContext::new();
        ctx.set("s", "hello");
        ctx.set("i", 42i64);
        ctx.set("f", 2.5f64);
        ctx.set("b", true);

        assert_eq!(ctx.get("s", String::new()), "hello");
        assert_eq!(ctx.get("i", 0i64), 42);
        assert_eq!(ctx.get("f", 0.0f64), 2.5);
        assert!(ctx.get("b", false));
    }

    #[test]
    fn null_removes_key() {
        let ctx = WorkflowContext::new();
        ctx.set("k", "v");
        assert!(ctx.contains("k"));
        ctx.set("k", StateValue::Null);
        assert!(!ctx.contains("k"));
        ctx.set("k", Option::<String>::None);
        assert!(ctx.is_empty());
    }

    #[test]
    fn empty_string_removes_key() {
        let ctx = WorkflowContext::new();
        ctx.set("profile.name", "Ada");
        ctx.set("profile.name", "");
        assert!(!ctx.contains("profile.name"));
        ctx.set_json("profile.name", Value::String(String::new()));
        assert!(ctx.is_empty());
        ctx.set("count", 0);
        assert!(ctx.contains("count"));
    }

    #[test]
    fn tolerant_reads_unwrap_strings() {
        let ctx = WorkflowContext::new();
        ctx.set("n", "42");
        ctx.set("flag", "true");
        ctx.set("whole", 3.0f64);
        ctx.set("num", 7i64);

        assert_eq!(ctx.get("n", 0i64), 42);
        assert!(ctx.get("flag", false));
        assert_eq!(ctx.get("whole", 0i64), 3);
        assert_eq!(ctx.get("num", String::new()), "7");
        assert_eq!(ctx.get("num", 0.0f64), 7.0);
    }

    #[test]
    fn failed_coercion_returns_default() {
        let ctx = WorkflowContext::new();
        ctx.set("word", "not a number");
        assert_eq!(ctx.get("word", -1i64), -1);
        assert_eq!(ctx.get("missing", 9u32), 9);
    }

    #[test]
    fn keys_are_case_sensitive_and_last_write_wins() {
        let ctx = WorkflowContext::new();
        ctx.set("Key", 1i64);
        ctx.set("key", 2i64);
        ctx.set("key", 3i64);
        assert_eq!(ctx.keys(), vec!["Key".to_string(), "key".to_string()]);
        assert_eq!(ctx.get("key", 0i64), 3);
        assert_eq!(ctx.get("Key", 0i64), 1);
    }

    #[test]
    fn json_values_convert_to_state() {
        let ctx = WorkflowContext::new();
        ctx.set_json("obj", json!({"street": "Main", "no": 5, "tags": ["a"]}));
        let v = ctx.value("obj").unwrap();
        let m = v.as_map().unwrap();
        assert_eq!(m.get("street"), Some(&StateValue::String("Main".into())));
        assert_eq!(m.get("no"), Some(&StateValue::Integer(5)));
        assert_eq!(ctx.to_json()["obj"]["tags"], json!(["a"]));
    }

    #[test]
    fn history_and_chain_accessors() {
        let ctx = WorkflowContext::new();
        ctx.push_topic_history("Greeting");
        ctx.push_topic_history("Profile");
        assert_eq!(ctx.topic_history(), vec!["Greeting", "Profile"]);

        ctx.push_topic_chain("A");
        ctx.push_topic_chain("B");
        assert_eq!(ctx.pop_topic_chain(), Some("A".to_string()));
        assert_eq!(ctx.pop_topic_chain(), Some("B".to_string()));
        assert_eq!(ctx.pop_topic_chain(), None);
        assert!(!ctx.contains(keys::TOPIC_CHAIN));
    }

    #[test]
    fn topic_history_is_capped() {
        let ctx = WorkflowContext::new();
        for i in 0..(MAX_TOPIC_HISTORY + 5) {
            ctx.push_topic_history(&format!("t{i}"));
        }
        let history = ctx.topic_history();
        assert_eq!(history.len(), MAX_TOPIC_HISTORY);
        assert_eq!(history[0], "t5");
    }

    #[test]
    fn subtopic_correlation_round_trip() {
        let ctx = WorkflowContext::new();
        ctx.set_subtopic_correlation("Address", "corr-1");
        assert_eq!(ctx.subtopic_correlation("address"), Some("corr-1".to_string()));
        assert_eq!(ctx.take_subtopic_correlation("ADDRESS"), Some("corr-1".to_string()));
        assert_eq!(ctx.subtopic_correlation("address"), None);

        ctx.set_subtopic_deadline("Address", 1_700_000_000_000);
        assert_eq!(ctx.subtopic_deadline("address"), Some(1_700_000_000_000));
        ctx.clear_subtopic_deadline("address");
        assert_eq!(ctx.subtopic_deadline("address"), None);
    }

    #[test]
    fn clear_empties_store() {
        let ctx = WorkflowContext::new();
        ctx.set("a", 1i64);
        ctx.set_conversation_active(true);
        assert!(ctx.conversation_active());
        ctx.clear();
        assert!(ctx.is_empty());
        assert!(!ctx.conversation_active());
    }
}
