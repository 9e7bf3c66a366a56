//! Wire protocol: newline-delimited JSON, one request per connection, an
//! optional `"processing"` heartbeat, then one terminal response.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::scheduler::Priority;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "embed")]
    Embed {
        text: String,
        priority: Option<Priority>,
        dims: Option<i64>,
        request_id: Option<String>,
    },
    #[serde(rename = "batch_embed")]
    BatchEmbed {
        texts: Vec<String>,
        priority: Option<Priority>,
        dims: Option<i64>,
        request_id: Option<String>,
    },
    #[serde(rename = "health")]
    Health { request_id: Option<String> },
    #[serde(rename = "ready")]
    Ready { request_id: Option<String> },
    #[serde(rename = "get_dimension")]
    GetDimension { request_id: Option<String> },
    #[serde(rename = "set_dimension")]
    SetDimension {
        dimension: i64,
        request_id: Option<String>,
    },
    #[serde(rename = "refresh_dimension")]
    RefreshDimension { request_id: Option<String> },
    #[serde(rename = "kys")]
    Kys { request_id: Option<String> },
    #[serde(rename = "process_codebase")]
    ProcessCodebase {
        batch_size: Option<usize>,
        limit: Option<usize>,
        project_path: Option<String>,
        request_id: Option<String>,
    },
    #[serde(rename = "process_memories")]
    ProcessMemories {
        batch_size: Option<usize>,
        limit: Option<usize>,
        project_path: Option<String>,
        request_id: Option<String>,
    },
    #[serde(rename = "process_code_definitions")]
    ProcessCodeDefinitions {
        batch_size: Option<usize>,
        limit: Option<usize>,
        project_path: Option<String>,
        request_id: Option<String>,
    },
}

impl Request {
    /// Some clients send `{"stats": true}` instead of `{"type": "health"}`;
    /// this is checked before tagged-union deserialisation is attempted.
    pub fn parse(line: &str) -> serde_json::Result<Request> {
        let raw: JsonValue = serde_json::from_str(line)?;
        if raw.get("stats").and_then(JsonValue::as_bool) == Some(true) {
            let request_id = raw
                .get("request_id")
                .and_then(JsonValue::as_str)
                .map(str::to_string);
            return Ok(Request::Health { request_id });
        }
        if raw.get("text").is_some() && raw.get("type").is_none() {
            return serde_json::from_value(merge_type(raw, "embed"));
        }
        if raw.get("texts").is_some() && raw.get("type").is_none() {
            return serde_json::from_value(merge_type(raw, "batch_embed"));
        }
        serde_json::from_value(raw)
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            Request::Embed { request_id, .. }
            | Request::BatchEmbed { request_id, .. }
            | Request::Health { request_id }
            | Request::Ready { request_id }
            | Request::GetDimension { request_id }
            | Request::SetDimension { request_id, .. }
            | Request::RefreshDimension { request_id }
            | Request::Kys { request_id }
            | Request::ProcessCodebase { request_id, .. }
            | Request::ProcessMemories { request_id, .. }
            | Request::ProcessCodeDefinitions { request_id, .. } => request_id.as_deref(),
        }
    }
}

fn merge_type(mut raw: JsonValue, type_name: &str) -> JsonValue {
    if let Some(obj) = raw.as_object_mut() {
        obj.insert("type".to_string(), JsonValue::String(type_name.to_string()));
    }
    raw
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    Processing {
        status: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Embed {
        embedding: Vec<f32>,
        dimensions: usize,
        target_dims: i64,
        query_type: &'static str,
        complexity: &'static str,
        priority: Priority,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    BatchEmbed {
        embeddings: Vec<Vec<f32>>,
        dimensions: usize,
        count: usize,
        target_dims: i64,
        priority: Priority,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Ready {
        ready: bool,
        model_loaded: bool,
        model_healthy: bool,
        status: &'static str,
    },
    Health(Box<crate::stats::HealthSnapshot>),
    Dimension {
        native: usize,
        target: i64,
    },
    ReembedSummary {
        table: &'static str,
        processed: u64,
        skipped: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

pub fn processing_heartbeat(request_id: Option<String>) -> Response {
    Response::Processing {
        status: "processing",
        request_id,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_text_as_embed() {
        let req = Request::parse(r#"{"text":"hello"}"#).expect("parse");
        assert!(matches!(req, Request::Embed { .. }));
    }

    #[test]
    fn parse_stats_shorthand_as_health() {
        let req = Request::parse(r#"{"stats":true}"#).expect("parse");
        assert!(matches!(req, Request::Health { .. }));
    }

    #[test]
    fn parse_typed_batch_embed() {
        let req = Request::parse(r#"{"type":"batch_embed","texts":["a","b"]}"#).expect("parse");
        assert!(matches!(req, Request::BatchEmbed { .. }));
    }

    #[test]
    fn parse_malformed_json_errors() {
        assert!(Request::parse("{not json").is_err());
    }
}
