use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Byte ceilings applied during sanitization.
pub const MAX_METHOD_BYTES: usize = 16;
pub const MAX_PATH_BYTES: usize = 2048;
pub const MAX_CONSUMER_ID_BYTES: usize = 256;

/// A single HTTP-request observation in wire form.
///
/// Serialization produces exactly the lowercase keys the ingestion endpoint
/// expects; optional fields are omitted when absent. Deserialization is
/// lenient (missing fields default) so overflow files written by older
/// versions still load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestEvent {
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub response_time_ms: f64,
    pub request_size: u64,
    pub response_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    /// ISO-8601 UTC with millisecond precision. Filled at admission when the
    /// caller leaves it empty; caller-supplied values are kept untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Free-form extra context. First to go when the event is oversize.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Coerces a submitted event into wire shape.
///
/// Returns `None` when the event cannot be admitted (still over the byte
/// ceiling after dropping `metadata`); the caller emits the diagnostic.
pub(crate) fn sanitize(mut event: RequestEvent, max_event_bytes: usize) -> Option<RequestEvent> {
    event.method = event.method.to_uppercase();
    truncate_to_bytes(&mut event.method, MAX_METHOD_BYTES);
    truncate_to_bytes(&mut event.path, MAX_PATH_BYTES);

    if let Some(consumer_id) = event.consumer_id.as_mut() {
        truncate_to_bytes(consumer_id, MAX_CONSUMER_ID_BYTES);
    }

    if !event.response_time_ms.is_finite() || event.response_time_ms < 0.0 {
        event.response_time_ms = 0.0;
    } else {
        event.response_time_ms = (event.response_time_ms * 100.0).round() / 100.0;
    }

    if event.timestamp.as_deref().is_none_or(str::is_empty) {
        event.timestamp = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
    }

    if serialized_len(&event)? > max_event_bytes {
        event.metadata = None;
        if serialized_len(&event)? > max_event_bytes {
            return None;
        }
    }

    Some(event)
}

fn serialized_len(event: &RequestEvent) -> Option<usize> {
    serde_json::to_vec(event).ok().map(|v| v.len())
}

/// Truncates to the longest prefix of at most `max` bytes that ends on a
/// character boundary.
fn truncate_to_bytes(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    const CEILING: usize = 64 * 1024;

    fn base_event() -> RequestEvent {
        RequestEvent {
            method: "get".to_string(),
            path: "/api/users".to_string(),
            status_code: 200,
            response_time_ms: 12.3456,
            request_size: 0,
            response_size: 512,
            consumer_id: None,
            timestamp: None,
            metadata: None,
        }
    }

    #[test]
    fn uppercases_and_bounds_method() {
        let mut event = base_event();
        event.method = "get-with-a-very-long-method-name".to_string();
        let out = sanitize(event, CEILING).unwrap();
        assert_eq!(out.method, "GET-WITH-A-VERY-");
        assert_eq!(out.method.len(), MAX_METHOD_BYTES);
    }

    #[test]
    fn bounds_path_and_consumer_id() {
        let mut event = base_event();
        event.path = format!("/{}", "x".repeat(4096));
        event.consumer_id = Some("c".repeat(400));
        let out = sanitize(event, CEILING).unwrap();
        assert_eq!(out.path.len(), MAX_PATH_BYTES);
        assert_eq!(out.consumer_id.unwrap().len(), MAX_CONSUMER_ID_BYTES);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut event = base_event();
        event.path = "é".repeat(2048); // 2 bytes per char
        let out = sanitize(event, CEILING).unwrap();
        assert_eq!(out.path.len(), MAX_PATH_BYTES);
        assert!(out.path.chars().all(|c| c == 'é'));
    }

    #[test]
    fn rounds_response_time_to_two_decimals() {
        let out = sanitize(base_event(), CEILING).unwrap();
        assert_eq!(out.response_time_ms, 12.35);

        let mut negative = base_event();
        negative.response_time_ms = -4.0;
        assert_eq!(sanitize(negative, CEILING).unwrap().response_time_ms, 0.0);
    }

    #[test]
    fn fills_timestamp_when_absent() {
        let out = sanitize(base_event(), CEILING).unwrap();
        let ts = out.timestamp.unwrap();
        assert!(ts.ends_with('Z'), "expected UTC suffix, got {ts}");
        assert!(ts.contains('.'), "expected millisecond precision, got {ts}");
    }

    #[test]
    fn preserves_caller_timestamp() {
        let mut event = base_event();
        event.timestamp = Some("2024-01-01T00:00:00.000Z".to_string());
        let out = sanitize(event, CEILING).unwrap();
        assert_eq!(out.timestamp.as_deref(), Some("2024-01-01T00:00:00.000Z"));
    }

    #[test]
    fn strips_metadata_under_size_pressure() {
        let mut metadata = serde_json::Map::new();
        metadata.insert("blob".to_string(), serde_json::Value::String("m".repeat(2048)));

        let mut event = base_event();
        event.metadata = Some(metadata);

        let out = sanitize(event, 1024).unwrap();
        assert!(out.metadata.is_none());
    }

    #[test]
    fn drops_event_still_oversize_without_metadata() {
        let mut event = base_event();
        event.path = "p".repeat(2000);
        assert!(sanitize(event, 128).is_none());
    }

    #[test]
    fn wire_form_omits_absent_fields() {
        let mut event = sanitize(base_event(), CEILING).unwrap();
        event.timestamp = None;
        let json = serde_json::to_value(&event).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("consumer_id"));
        assert!(!obj.contains_key("metadata"));
        assert_eq!(obj["method"], "GET");
        assert_eq!(obj["status_code"], 200);
    }
}
