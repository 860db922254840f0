/// Remote loading for FETCH_DATA.
///
/// The response body must be JSON. An optional dotted path (`data.items`,
/// `results.0.rows`) locates the row array inside it.

use crate::error::{EngineError, Result};
use crate::value::{row_from_json, Row};
use log::debug;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::time::Duration;

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSource {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Strings are sent as-is, anything else as a JSON body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_path: Option<String>,
}

impl RemoteSource {
    pub fn get(url: impl Into<String>) -> Self {
        RemoteSource {
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            body: None,
            data_path: None,
        }
    }
}

fn failed(message: impl Into<String>) -> EngineError {
    EngineError::RemoteLoadFailed(message.into())
}

/// Fetch and decode the rows described by `source`.
pub async fn fetch_rows(source: &RemoteSource, timeout: Duration) -> Result<Vec<Row>> {
    let method = Method::from_bytes(source.method.to_uppercase().as_bytes())
        .map_err(|_| failed(format!("unsupported method '{}'", source.method)))?;
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let mut request = client.request(method, &source.url);
    for (name, value) in &source.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request = match &source.body {
        Some(JsonValue::String(text)) => request.body(text.clone()),
        Some(body) => request.json(body),
        None => request,
    };

    let response = request
        .send()
        .await
        .map_err(|e| failed(format!("{}: {}", source.url, e)))?;
    let status = response.status();
    if !status.is_success() {
        return Err(failed(format!("{} returned {}", source.url, status)));
    }
    let body: JsonValue = response
        .json()
        .await
        .map_err(|e| failed(format!("{}: invalid JSON body: {}", source.url, e)))?;

    let rows = extract_rows(&body, source.data_path.as_deref())?;
    debug!("fetched {} rows from {}", rows.len(), source.url);
    Ok(rows)
}

/// Locate the row array in `body` by dotted `path` and decode it.
pub fn extract_rows(body: &JsonValue, path: Option<&str>) -> Result<Vec<Row>> {
    let mut target = body;
    if let Some(path) = path.filter(|p| !p.is_empty()) {
        for segment in path.split('.') {
            let next = match target {
                JsonValue::Object(map) => map.get(segment),
                JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            target = next.ok_or_else(|| failed(format!("path '{}' not found at '{}'", path, segment)))?;
        }
    }

    let items = target
        .as_array()
        .ok_or_else(|| failed(format!("expected an array of rows, got {}", kind_name(target))))?;
    items
        .iter()
        .map(|item| row_from_json(item).map_err(failed))
        .collect()
}

fn kind_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::value::ColumnValue;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer one HTTP request on a local port with a canned JSON response.
    /// Returns the URL to fetch.
    pub(crate) async fn serve_once(status: &str, body: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut request = [0u8; 4096];
                let _ = socket.read(&mut request).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}/rows", addr)
    }

    #[test]
    fn test_top_level_array() {
        let rows = extract_rows(&json!([{"a": 1}, {"a": 2}]), None).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].value("a"), &ColumnValue::Int(2));
    }

    #[test]
    fn test_dotted_path_with_index() {
        let body = json!({"results": [{"rows": [{"name": "x"}]}]});
        let rows = extract_rows(&body, Some("results.0.rows")).unwrap();
        assert_eq!(rows[0].value("name"), &ColumnValue::from("x"));
    }

    #[test]
    fn test_missing_path_fails() {
        let err = extract_rows(&json!({"data": {}}), Some("data.items")).unwrap_err();
        assert!(matches!(err, EngineError::RemoteLoadFailed(msg) if msg.contains("items")));
    }

    #[test]
    fn test_non_array_fails() {
        let err = extract_rows(&json!({"data": 5}), Some("data")).unwrap_err();
        assert!(matches!(err, EngineError::RemoteLoadFailed(_)));
        assert!(extract_rows(&json!([1, 2]), None).is_err());
    }

    #[test]
    fn test_source_defaults() {
        let source: RemoteSource = serde_json::from_str(r#"{"url":"http://x/rows","dataPath":"d"}"#).unwrap();
        assert_eq!(source.method, "GET");
        assert!(source.headers.is_empty());
        assert_eq!(source.data_path.as_deref(), Some("d"));
    }

    #[tokio::test]
    async fn test_bad_method_is_rejected() {
        let mut source = RemoteSource::get("http://127.0.0.1:9/rows");
        source.method = "NOT A METHOD".into();
        let err = fetch_rows(&source, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::RemoteLoadFailed(_)));
    }

    #[tokio::test]
    async fn test_non_success_status_fails() {
        let url = serve_once("500 Internal Server Error", r#"{"error":"boom"}"#).await;
        let err = fetch_rows(&RemoteSource::get(url), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, EngineError::RemoteLoadFailed(msg) if msg.contains("500")));
    }

    #[tokio::test]
    async fn test_fetch_rows_follows_data_path() {
        let url = serve_once("200 OK", r#"{"data":{"items":[{"a":1},{"a":2},{"a":3}]}}"#).await;
        let mut source = RemoteSource::get(url);
        source.data_path = Some("data.items".into());
        let rows = fetch_rows(&source, Duration::from_secs(5)).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].value("a"), &ColumnValue::Int(3));
    }
}
