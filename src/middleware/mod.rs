//! Framework-agnostic middleware contract.
//!
//! Web-framework adapters extract these two snapshots from a request and
//! its response, then hand [`build_event`]'s output to
//! [`ApilensClient::track`](crate::ApilensClient::track). An adapter must
//! wrap its own tracking code so that nothing here can disturb the host's
//! response or error flow, and when an application error propagates through
//! it, it still reports the request using [`ResponseInfo::error_response`]
//! before re-raising.

use crate::config::Options;
use crate::domain::consumer::default_identify_consumer;
use crate::domain::event::RequestEvent;
use std::collections::HashMap;

/// Request-side fields an adapter extracts before the handler runs.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    /// Path without the query string; [`build_event`] appends the sorted
    /// query when configured to.
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Header names lowercased by the adapter.
    pub headers: HashMap<String, String>,
    /// Request body size in bytes.
    pub size: u64,
}

/// Response-side fields captured once the handler finished (or failed).
#[derive(Debug, Clone, Default)]
pub struct ResponseInfo {
    pub status_code: u16,
    pub response_time_ms: f64,
    /// Response body size in bytes.
    pub size: u64,
}

impl ResponseInfo {
    /// The event shape for a request whose handler raised: status 500 with
    /// an empty body.
    pub fn error_response(response_time_ms: f64) -> Self {
        Self {
            status_code: 500,
            response_time_ms,
            size: 0,
        }
    }
}

/// Assembles the wire event for one observed request, applying consumer
/// identification and optional query-string collection.
pub fn build_event(request: &RequestInfo, response: &ResponseInfo, options: &Options) -> RequestEvent {
    let consumer_id = match &options.identify_consumer {
        Some(identify) => identify(&request.headers),
        None => default_identify_consumer(&request.headers),
    };

    let mut path = request.path.clone();
    if options.collect_query_string && !request.query.is_empty() {
        let mut pairs = request.query.clone();
        pairs.sort();
        let query: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        path.push('?');
        path.push_str(&query.join("&"));
    }

    RequestEvent {
        method: request.method.clone(),
        path,
        status_code: response.status_code,
        response_time_ms: response.response_time_ms,
        request_size: request.size,
        response_size: response.size,
        consumer_id,
        timestamp: None,
        metadata: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request() -> RequestInfo {
        RequestInfo {
            method: "GET".to_string(),
            path: "/api/items".to_string(),
            query: vec![
                ("page".to_string(), "2".to_string()),
                ("filter".to_string(), "active".to_string()),
            ],
            headers: HashMap::from([("x-api-key".to_string(), "ak_live_abc123".to_string())]),
            size: 128,
        }
    }

    fn response() -> ResponseInfo {
        ResponseInfo {
            status_code: 200,
            response_time_ms: 3.5,
            size: 2048,
        }
    }

    #[test]
    fn query_string_is_off_by_default() {
        let event = build_event(&request(), &response(), &Options::default());
        assert_eq!(event.path, "/api/items");
    }

    #[test]
    fn query_string_is_sorted_when_collected() {
        let options = Options {
            collect_query_string: true,
            ..Options::default()
        };
        let event = build_event(&request(), &response(), &options);
        assert_eq!(event.path, "/api/items?filter=active&page=2");
    }

    #[test]
    fn applies_default_consumer_identification() {
        let event = build_event(&request(), &response(), &Options::default());
        assert_eq!(event.consumer_id.as_deref(), Some("ak_live_abc123"));
    }

    #[test]
    fn custom_identify_consumer_wins() {
        let options = Options {
            identify_consumer: Some(Arc::new(|_| Some("tenant-7".to_string()))),
            ..Options::default()
        };
        let event = build_event(&request(), &response(), &options);
        assert_eq!(event.consumer_id.as_deref(), Some("tenant-7"));
    }

    #[test]
    fn error_response_contract() {
        let event = build_event(&request(), &ResponseInfo::error_response(9.9), &Options::default());
        assert_eq!(event.status_code, 500);
        assert_eq!(event.response_size, 0);
        assert_eq!(event.response_time_ms, 9.9);
    }
}
