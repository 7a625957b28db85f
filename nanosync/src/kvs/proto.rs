//! Messages exchanged between a [`KvsClient`](super::KvsClient) and a
//! [`KvsService`](super::KvsService).
//!
//! Requests travel client → service. The service answers range and point
//! reads with a `set` message carrying the entries found and mutations
//! with `null`. It also sends unsolicited `set`/`delete` notifications to
//! every connected client after each change.

use serde::{Deserialize, Serialize};

use super::MaybeEntry;
use crate::nanoservice::NanoPort;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "$type", rename_all = "camelCase")]
pub enum Message<K, V> {
    Get {
        keys: Vec<K>,
    },
    GetStartingFrom {
        #[serde(skip_serializing_if = "Option::is_none")]
        bound: Option<K>,
        limit: usize,
    },
    GetEndingAt {
        #[serde(skip_serializing_if = "Option::is_none")]
        bound: Option<K>,
        limit: usize,
    },
    Set {
        entries: Vec<MaybeEntry<K, V>>,
    },
    Delete {
        keys: Vec<K>,
    },
    DeleteAll,
}

/// `null` for mutations, `Some(Message::Set { .. })` for reads.
pub type Reply<K, V> = Option<Message<K, V>>;

/// Port type used on both sides of a KVS connection.
pub type KvsPort<K, V> = NanoPort<Message<K, V>, Reply<K, V>>;

/// Conventional registry name for the store called `store`.
pub fn service_name(store: &str) -> String {
    format!("kvs:{store}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    type Msg = Message<String, serde_json::Value>;

    #[test]
    fn messages_use_type_tags() {
        let get: Msg = Message::Get {
            keys: vec!["a".into()],
        };
        assert_eq!(
            serde_json::to_value(&get).unwrap(),
            json!({"$type": "get", "keys": ["a"]})
        );

        let scan: Msg = Message::GetStartingFrom {
            bound: None,
            limit: 10,
        };
        assert_eq!(
            serde_json::to_value(&scan).unwrap(),
            json!({"$type": "getStartingFrom", "limit": 10})
        );

        let wipe: Msg = Message::DeleteAll;
        assert_eq!(
            serde_json::to_value(&wipe).unwrap(),
            json!({"$type": "deleteAll"})
        );
    }

    #[test]
    fn parses_set_with_deletions() {
        let parsed: Msg = serde_json::from_value(json!({
            "$type": "set",
            "entries": [{"key": "a", "value": 1}, {"key": "b"}]
        }))
        .unwrap();
        assert_eq!(
            parsed,
            Message::Set {
                entries: vec![
                    MaybeEntry::set("a".into(), json!(1)),
                    MaybeEntry::deleted("b".into()),
                ]
            }
        );
    }

    #[test]
    fn null_reply_is_none() {
        let reply: Reply<String, i64> = serde_json::from_value(serde_json::Value::Null).unwrap();
        assert_eq!(reply, None);
        assert_eq!(service_name("settings"), "kvs:settings");
    }
}
