/// Engine request/response messages.
///
/// `Request` and `Reply` are the typed messages the worker exchanges with
/// its client in-process. `RawRequest` and `WireResponse` are the JSON
/// envelope used over a transport:
///
/// request  `{"id": 7, "type": "FILTER", "payload": {...}}`
/// response `{"id": 7, "type": "SUCCESS", "result": ...}` or
///          `{"id": 7, "type": "ERROR", "error": "..."}`
use crate::aggregate::{AggregateResult, AggregateSpec};
use crate::engine::LoadSummary;
use crate::error::{EngineError, Result};
use crate::pivot::{PivotConfig, PivotOutcome};
use crate::query::{FilterPredicate, QueryResult, QuerySpec, SortKey};
use crate::remote::RemoteSource;
use crate::value::{ColumnValue, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub type RequestId = u64;

/// Requests understood by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Reset the engine
    Init,

    LoadData { rows: Vec<Row> },

    /// Load rows from a remote JSON endpoint
    FetchData(RemoteSource),

    Filter { filters: Vec<FilterPredicate> },

    Sort { sorts: Vec<SortKey> },

    Query(QuerySpec),

    Aggregate(AggregateSpec),

    Pivot {
        config: PivotConfig,
        generation: Option<u64>,
    },

    GetRows { indices: Vec<u32> },

    GetAllRows,

    GetUniqueValues { column_key: String },

    /// Windowed read over the current view
    FetchVisibleRows {
        start: usize,
        end: usize,
        expected_generation: Option<u64>,
    },

    Cleanup,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadDataPayload {
    rows: Vec<Row>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilterPayload {
    #[serde(default)]
    filters: Vec<FilterPredicate>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SortPayload {
    #[serde(default)]
    sorts: Vec<SortKey>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PivotPayload {
    config: PivotConfig,
    #[serde(default)]
    generation: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetRowsPayload {
    indices: Vec<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UniqueValuesPayload {
    column_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisibleRowsPayload {
    start: usize,
    end: usize,
    #[serde(default)]
    expected_generation: Option<u64>,
}

fn payload<T: DeserializeOwned>(kind: &str, payload: JsonValue) -> Result<T> {
    // A missing payload decodes like an empty object
    let payload = if payload.is_null() {
        JsonValue::Object(Default::default())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(|e| EngineError::InvalidPayload(format!("{}: {}", kind, e)))
}

impl Request {
    /// Wire name of the request type
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Init => "INIT",
            Request::LoadData { .. } => "LOAD_DATA",
            Request::FetchData(_) => "FETCH_DATA",
            Request::Filter { .. } => "FILTER",
            Request::Sort { .. } => "SORT",
            Request::Query(_) => "QUERY",
            Request::Aggregate(_) => "AGGREGATE",
            Request::Pivot { .. } => "PIVOT",
            Request::GetRows { .. } => "GET_ROWS",
            Request::GetAllRows => "GET_ALL_ROWS",
            Request::GetUniqueValues { .. } => "GET_UNIQUE_VALUES",
            Request::FetchVisibleRows { .. } => "FETCH_VISIBLE_ROWS",
            Request::Cleanup => "CLEANUP",
        }
    }

    /// Decode a request from its wire type name and payload
    pub fn decode(kind: &str, body: JsonValue) -> Result<Request> {
        let request = match kind {
            "INIT" => Request::Init,
            "LOAD_DATA" => {
                // A bare array is accepted as the row list
                let rows = match body {
                    JsonValue::Array(_) => payload(kind, body)?,
                    other => payload::<LoadDataPayload>(kind, other)?.rows,
                };
                Request::LoadData { rows }
            }
            "FETCH_DATA" => Request::FetchData(payload(kind, body)?),
            "FILTER" => Request::Filter {
                filters: payload::<FilterPayload>(kind, body)?.filters,
            },
            "SORT" => Request::Sort {
                sorts: payload::<SortPayload>(kind, body)?.sorts,
            },
            "QUERY" => Request::Query(payload(kind, body)?),
            "AGGREGATE" => Request::Aggregate(payload(kind, body)?),
            "PIVOT" => {
                let p: PivotPayload = payload(kind, body)?;
                Request::Pivot {
                    config: p.config,
                    generation: p.generation,
                }
            }
            "GET_ROWS" => Request::GetRows {
                indices: payload::<GetRowsPayload>(kind, body)?.indices,
            },
            "GET_ALL_ROWS" => Request::GetAllRows,
            "GET_UNIQUE_VALUES" => Request::GetUniqueValues {
                column_key: payload::<UniqueValuesPayload>(kind, body)?.column_key,
            },
            "FETCH_VISIBLE_ROWS" => {
                let p: VisibleRowsPayload = payload(kind, body)?;
                Request::FetchVisibleRows {
                    start: p.start,
                    end: p.end,
                    expected_generation: p.expected_generation,
                }
            }
            "CLEANUP" => Request::Cleanup,
            other => return Err(EngineError::UnknownRequestType(other.to_string())),
        };
        Ok(request)
    }
}

/// Successful results. Serialized untagged: the request type already says
/// which shape to expect.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reply {
    /// INIT and CLEANUP
    Done,
    Loaded(LoadSummary),
    /// FILTER, SORT and QUERY; the index buffer moves with the reply
    Indices(QueryResult),
    Aggregates(Vec<AggregateResult>),
    Pivot(PivotOutcome),
    Rows(Vec<Row>),
    Values(Vec<ColumnValue>),
}

/// Request envelope as received from a transport
#[derive(Debug, Deserialize)]
pub struct RawRequest {
    pub id: RequestId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: JsonValue,
}

impl RawRequest {
    pub fn into_request(self) -> (RequestId, Result<Request>) {
        let request = Request::decode(&self.kind, self.payload);
        (self.id, request)
    }
}

/// A response from the worker, before wire encoding
#[derive(Debug, Clone)]
pub struct Response {
    pub id: RequestId,
    pub result: Result<Reply>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Response envelope as sent over a transport
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireResponse {
    pub id: RequestId,
    #[serde(rename = "type")]
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Reply>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WireResponse {
    pub fn error(id: RequestId, error: &EngineError) -> Self {
        WireResponse {
            id,
            status: ResponseStatus::Error,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

impl From<Response> for WireResponse {
    fn from(response: Response) -> Self {
        match response.result {
            Ok(reply) => WireResponse {
                id: response.id,
                status: ResponseStatus::Success,
                result: Some(reply),
                error: None,
            },
            Err(e) => WireResponse::error(response.id, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::FilterOperator;
    use serde_json::json;

    fn decode(text: &str) -> Result<Request> {
        let raw: RawRequest = serde_json::from_str(text).unwrap();
        raw.into_request().1
    }

    #[test]
    fn test_decode_filter() {
        let request = decode(
            r#"{"id":1,"type":"FILTER","payload":{"filters":[
                {"columnKey":"age","operator":"gte","value":30}]}}"#,
        )
        .unwrap();
        match request {
            Request::Filter { filters } => {
                assert_eq!(filters[0].operator, FilterOperator::Gte);
                assert_eq!(filters[0].value, ColumnValue::Int(30));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_without_payload() {
        assert_eq!(decode(r#"{"id":2,"type":"GET_ALL_ROWS"}"#).unwrap(), Request::GetAllRows);
        assert_eq!(decode(r#"{"id":3,"type":"QUERY"}"#).unwrap(), Request::Query(QuerySpec::default()));
    }

    #[test]
    fn test_load_data_accepts_bare_array() {
        let request = decode(r#"{"id":4,"type":"LOAD_DATA","payload":[{"a":1},{"a":2}]}"#).unwrap();
        match request {
            Request::LoadData { rows } => assert_eq!(rows.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_and_bad_payload() {
        assert_eq!(
            decode(r#"{"id":5,"type":"EXPLODE"}"#).unwrap_err(),
            EngineError::UnknownRequestType("EXPLODE".into())
        );
        assert!(matches!(
            decode(r#"{"id":6,"type":"GET_ROWS","payload":{"indices":"all"}}"#).unwrap_err(),
            EngineError::InvalidPayload(_)
        ));
    }

    #[test]
    fn test_kind_matches_decode() {
        for kind in ["INIT", "GET_ALL_ROWS", "CLEANUP", "QUERY", "AGGREGATE"] {
            assert_eq!(Request::decode(kind, JsonValue::Null).unwrap().kind(), kind);
        }
    }

    #[test]
    fn test_wire_response_shapes() {
        let ok: WireResponse = Response {
            id: 9,
            result: Ok(Reply::Indices(QueryResult::new(vec![2, 0], 3))),
        }
        .into();
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"id": 9, "type": "SUCCESS", "result": {
                "indices": [2, 0], "totalCount": 3, "filteredCount": 2, "generation": 0}})
        );

        let err: WireResponse = Response {
            id: 10,
            result: Err(EngineError::EngineNotInitialized),
        }
        .into();
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["type"], json!("ERROR"));
        assert!(value.get("result").is_none());
        assert!(value["error"].as_str().unwrap().contains("not initialized"));

        let done = serde_json::to_value(WireResponse::from(Response { id: 1, result: Ok(Reply::Done) })).unwrap();
        assert_eq!(done["result"], JsonValue::Null);
    }
}
