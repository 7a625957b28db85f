use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorInfo;

/// Everything that crosses a channel is one of these shapes.
///
/// Payloads stay as raw JSON here; the port decodes them into its typed
/// messages so a bad payload can be answered rather than lost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum Envelope {
    Notify { notify: Value },
    Request { tag: String, request: Value },
    Response { tag: String, response: Value },
    Error { tag: String, error: ErrorInfo },
}

impl Envelope {
    /// Anything that is not a recognizable envelope yields `None`.
    pub(crate) fn parse(message: Value) -> Option<Self> {
        serde_json::from_value(message).ok()
    }

    pub(crate) fn into_value(self) -> Value {
        // Every variant is a plain object of strings and JSON values.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
