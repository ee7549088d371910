//! Per-collection rules: snapshot ordering and document id resolution.
//!
//! The fan-out and the write path never match on collection names themselves;
//! they ask a [`CollectionRules`] registry injected at construction. New
//! collections get their behavior by registering a rule.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::document::{id_string, numeric_field, Record};

/// Collection names used by the storefront.
pub mod collections {
    pub const TREATMENTS: &str = "treatments";
    pub const CATEGORIES: &str = "categories";
    pub const ANNOUNCEMENTS: &str = "announcements";
    pub const ADS: &str = "ads";
    pub const ADMINS: &str = "admins";
    pub const ORDERS: &str = "orders";
    pub const ANALYTICS: &str = "analytics";
    pub const SITE_CONFIG: &str = "site_config";
    pub const BOT_STATES: &str = "bot_states";
    pub const SESSIONS: &str = "sessions";
    pub const TG_USERS: &str = "tg_users";
    pub const CHAT_MESSAGES: &str = "chat_messages";
    /// Per-session message collections are named `chat_<session id>`.
    pub const CHAT_PREFIX: &str = "chat_";

    /// The single document id of [`SITE_CONFIG`].
    pub const SITE_CONFIG_ID: &str = "hero_config";
}

/// Comparator for custom rules.
pub type Comparator = Arc<dyn Fn(&Record, &Record) -> Ordering + Send + Sync>;

/// How a collection snapshot is ordered before it reaches subscribers.
#[derive(Clone)]
pub enum SortRule {
    /// Ascending numeric `timestamp`, oldest first.
    Timeline,
    /// Descending `lastActive`, falling back to `lastMessageTime`.
    RecentActivity,
    /// Descending `createdAt` when every document has one, otherwise
    /// descending `id` as a recency proxy.
    NewestFirst,
    /// Ascending `id`.
    ById,
    Custom(Comparator),
}

impl SortRule {
    /// Sort `docs` in place. Sorting is stable.
    pub fn apply(&self, docs: &mut [Record]) {
        match self {
            SortRule::Timeline => docs.sort_by(|a, b| {
                let ta = numeric_field(a, "timestamp").unwrap_or(0.0);
                let tb = numeric_field(b, "timestamp").unwrap_or(0.0);
                ta.total_cmp(&tb)
            }),
            SortRule::RecentActivity => docs.sort_by(|a, b| activity(b).total_cmp(&activity(a))),
            SortRule::NewestFirst => {
                let all_created = docs.iter().all(|d| numeric_field(d, "createdAt").is_some());
                if all_created {
                    docs.sort_by(|a, b| {
                        let ca = numeric_field(a, "createdAt").unwrap_or(0.0);
                        let cb = numeric_field(b, "createdAt").unwrap_or(0.0);
                        cb.total_cmp(&ca)
                    });
                } else {
                    docs.sort_by(|a, b| id_string(b).cmp(&id_string(a)));
                }
            }
            SortRule::ById => docs.sort_by(|a, b| id_string(a).cmp(&id_string(b))),
            SortRule::Custom(cmp) => docs.sort_by(|a, b| cmp(a, b)),
        }
    }
}

impl std::fmt::Debug for SortRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortRule::Timeline => write!(f, "Timeline"),
            SortRule::RecentActivity => write!(f, "RecentActivity"),
            SortRule::NewestFirst => write!(f, "NewestFirst"),
            SortRule::ById => write!(f, "ById"),
            SortRule::Custom(_) => write!(f, "Custom"),
        }
    }
}

fn activity(record: &Record) -> f64 {
    numeric_field(record, "lastActive")
        .or_else(|| numeric_field(record, "lastMessageTime"))
        .unwrap_or(0.0)
}

/// Where a document's id comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdRule {
    /// The payload's own `id`.
    Payload,
    /// A fixed id; the collection holds a single document.
    Fixed(String),
    /// Another field coerced to a string, falling back to `id` when absent.
    Field(String),
}

impl IdRule {
    fn resolve(&self, record: &Record) -> Option<String> {
        let id = match self {
            IdRule::Payload => id_string(record),
            IdRule::Fixed(id) => id.clone(),
            IdRule::Field(field) => match record.get(field) {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => id_string(record),
            },
        };
        (!id.is_empty()).then_some(id)
    }
}

/// Registry of collection rules.
#[derive(Debug, Clone)]
pub struct CollectionRules {
    sorts: HashMap<String, SortRule>,
    sort_prefixes: Vec<(String, SortRule)>,
    ids: HashMap<String, IdRule>,
    default_sort: SortRule,
}

impl Default for CollectionRules {
    fn default() -> Self {
        Self {
            sorts: HashMap::new(),
            sort_prefixes: Vec::new(),
            ids: HashMap::new(),
            default_sort: SortRule::ById,
        }
    }
}

impl CollectionRules {
    /// An empty registry: every collection sorts by id and uses the payload id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules for the storefront collections.
    pub fn storefront() -> Self {
        use collections::*;

        Self::new()
            .sort(CHAT_MESSAGES, SortRule::Timeline)
            .sort_prefix(CHAT_PREFIX, SortRule::Timeline)
            .sort(SESSIONS, SortRule::RecentActivity)
            .sort(TG_USERS, SortRule::RecentActivity)
            .sort(TREATMENTS, SortRule::NewestFirst)
            .sort(ANNOUNCEMENTS, SortRule::NewestFirst)
            .sort(ADS, SortRule::NewestFirst)
            .id_rule(SITE_CONFIG, IdRule::Fixed(SITE_CONFIG_ID.to_string()))
            .id_rule(BOT_STATES, IdRule::Field("chatId".to_string()))
    }

    /// Register a sort rule for an exact collection name.
    pub fn sort(mut self, collection: impl Into<String>, rule: SortRule) -> Self {
        self.sorts.insert(collection.into(), rule);
        self
    }

    /// Register a sort rule for every collection whose name starts with `prefix`.
    ///
    /// Exact registrations win over prefixes; the first matching prefix wins.
    pub fn sort_prefix(mut self, prefix: impl Into<String>, rule: SortRule) -> Self {
        self.sort_prefixes.push((prefix.into(), rule));
        self
    }

    pub fn id_rule(mut self, collection: impl Into<String>, rule: IdRule) -> Self {
        self.ids.insert(collection.into(), rule);
        self
    }

    pub fn sort_rule(&self, collection: &str) -> &SortRule {
        if let Some(rule) = self.sorts.get(collection) {
            return rule;
        }
        self.sort_prefixes
            .iter()
            .find(|(prefix, _)| collection.starts_with(prefix.as_str()))
            .map(|(_, rule)| rule)
            .unwrap_or(&self.default_sort)
    }

    /// Order a snapshot for `collection`.
    pub fn order(&self, collection: &str, docs: &mut [Record]) {
        self.sort_rule(collection).apply(docs);
    }

    /// Resolve the document id for a record headed to `collection`.
    pub fn resolve_id(&self, collection: &str, record: &Record) -> Option<String> {
        self.ids
            .get(collection)
            .unwrap_or(&IdRule::Payload)
            .resolve(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs(values: Vec<Value>) -> Vec<Record> {
        values
            .into_iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn ids(docs: &[Record]) -> Vec<String> {
        docs.iter().map(id_string).collect()
    }

    #[test]
    fn test_sessions_most_recent_first() {
        let rules = CollectionRules::storefront();
        let mut d = docs(vec![
            json!({"id": "a", "lastActive": 100}),
            json!({"id": "b", "lastActive": 300}),
            json!({"id": "c", "lastMessageTime": 200}),
        ]);
        rules.order("sessions", &mut d);
        assert_eq!(ids(&d), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_chat_timeline_prefix() {
        let rules = CollectionRules::storefront();
        let mut d = docs(vec![
            json!({"id": "m2", "timestamp": 20}),
            json!({"id": "m0"}),
            json!({"id": "m1", "timestamp": 10}),
        ]);
        rules.order("chat_42", &mut d);
        assert_eq!(ids(&d), vec!["m0", "m1", "m2"]);
    }

    #[test]
    fn test_content_created_at_when_complete() {
        let rules = CollectionRules::storefront();
        let mut d = docs(vec![
            json!({"id": "z", "createdAt": 1}),
            json!({"id": "a", "createdAt": 3}),
            json!({"id": "m", "createdAt": 2}),
        ]);
        rules.order("treatments", &mut d);
        assert_eq!(ids(&d), vec!["a", "m", "z"]);
    }

    #[test]
    fn test_content_falls_back_to_id_desc() {
        let rules = CollectionRules::storefront();
        let mut d = docs(vec![
            json!({"id": "t-1", "createdAt": 9}),
            json!({"id": "t-3"}),
            json!({"id": "t-2", "createdAt": 5}),
        ]);
        rules.order("ads", &mut d);
        assert_eq!(ids(&d), vec!["t-3", "t-2", "t-1"]);
    }

    #[test]
    fn test_default_sorts_by_id() {
        let rules = CollectionRules::storefront();
        let mut d = docs(vec![json!({"id": "b"}), json!({"id": "a"}), json!({})]);
        rules.order("categories", &mut d);
        assert_eq!(ids(&d), vec!["", "a", "b"]);
    }

    #[test]
    fn test_exact_rule_beats_prefix() {
        let rules = CollectionRules::new()
            .sort_prefix("chat_", SortRule::Timeline)
            .sort("chat_index", SortRule::ById);
        assert!(matches!(rules.sort_rule("chat_index"), SortRule::ById));
        assert!(matches!(rules.sort_rule("chat_7"), SortRule::Timeline));
    }

    #[test]
    fn test_custom_comparator() {
        let rules = CollectionRules::new().sort(
            "orders",
            SortRule::Custom(Arc::new(|a, b| {
                let pa = a.get("total").and_then(Value::as_f64).unwrap_or(0.0);
                let pb = b.get("total").and_then(Value::as_f64).unwrap_or(0.0);
                pb.total_cmp(&pa)
            })),
        );
        let mut d = docs(vec![
            json!({"id": "1", "total": 5}),
            json!({"id": "2", "total": 50}),
        ]);
        rules.order("orders", &mut d);
        assert_eq!(ids(&d), vec!["2", "1"]);
    }

    #[test]
    fn test_id_resolution() {
        let rules = CollectionRules::storefront();
        let site = docs(vec![json!({"id": "ignored", "title": "Shop"})]);
        assert_eq!(rules.resolve_id("site_config", &site[0]).as_deref(), Some("hero_config"));

        let bot = docs(vec![json!({"chatId": 123456, "step": "menu"})]);
        assert_eq!(rules.resolve_id("bot_states", &bot[0]).as_deref(), Some("123456"));

        let bot_fallback = docs(vec![json!({"id": "x"})]);
        assert_eq!(rules.resolve_id("bot_states", &bot_fallback[0]).as_deref(), Some("x"));

        let missing = docs(vec![json!({"name": "no id"})]);
        assert_eq!(rules.resolve_id("treatments", &missing[0]), None);
    }
}
