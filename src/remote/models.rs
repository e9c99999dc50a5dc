// ABOUTME: Wire shapes for the remote sync API
// ABOUTME: Request bodies for meta/page calls and validation of meta, page and dump responses

use serde::Serialize;
use serde_json::{Map, Value};

use crate::cursor::DateWindow;
use crate::error::{Result, SyncError};

/// One raw record as returned by the remote API.
pub type Record = Map<String, Value>;

pub const META_FLOW: &str = "meta";
pub const PAGINATION_FLOW: &str = "pagination";

#[derive(Debug, Clone, Serialize)]
pub struct MetaRequest {
    pub start_date: String,
    pub end_date: String,
}

impl MetaRequest {
    pub fn new(window: &DateWindow) -> Self {
        Self {
            start_date: window.start_str(),
            end_date: window.end_str(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageRequest {
    pub start_date: String,
    pub end_date: String,
    #[serde(rename = "Page")]
    pub page: u32,
    #[serde(rename = "Pagesize")]
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(window: &DateWindow, page: u32, page_size: u32) -> Self {
        Self {
            start_date: window.start_str(),
            end_date: window.end_str(),
            page,
            page_size,
        }
    }
}

/// Extract the announced total from a meta response.
///
/// The response must carry `flow == "meta"`. A missing, non-numeric or
/// negative total is treated as zero.
pub fn parse_meta_total(endpoint: &str, body: &Value) -> Result<u64> {
    let flow = body.get("flow").and_then(Value::as_str);
    if flow != Some(META_FLOW) {
        return Err(SyncError::contract(
            endpoint,
            format!("expected flow '{}', got {:?}", META_FLOW, flow),
            body,
        ));
    }

    match body.get("total_no_of_records") {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(total) if total >= 0 => Ok(total as u64),
            _ => {
                tracing::warn!("{}: meta total {} is negative or not an integer, using 0", endpoint, n);
                Ok(0)
            }
        },
        Some(Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(total) if total >= 0 => Ok(total as u64),
            _ => {
                tracing::warn!("{}: meta total '{}' is not a valid count, using 0", endpoint, s);
                Ok(0)
            }
        },
        _ => {
            tracing::warn!("{}: meta response has no total_no_of_records, using 0", endpoint);
            Ok(0)
        }
    }
}

/// Extract records from a page response.
///
/// A `flow` other than `pagination` is only logged; a `records` value that is
/// present but not an array breaks the contract.
pub fn parse_page_records(endpoint: &str, body: &Value) -> Result<Vec<Record>> {
    if let Some(flow) = body.get("flow").and_then(Value::as_str) {
        if flow != PAGINATION_FLOW {
            tracing::warn!(
                "{}: page response tagged flow '{}', expected '{}'",
                endpoint,
                flow,
                PAGINATION_FLOW
            );
        }
    }
    extract_records(endpoint, body)
}

/// Extract records from a dump response: `{records: [...]}` or a bare array.
pub fn parse_dump_records(endpoint: &str, body: &Value) -> Result<Vec<Record>> {
    if let Value::Array(items) = body {
        return Ok(objects_only(endpoint, items));
    }
    extract_records(endpoint, body)
}

fn extract_records(endpoint: &str, body: &Value) -> Result<Vec<Record>> {
    if !body.is_object() {
        return Err(SyncError::contract(endpoint, "response is not a JSON object", body));
    }
    match body.get("records") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(objects_only(endpoint, items)),
        Some(_) => Err(SyncError::contract(endpoint, "'records' is not an array", body)),
    }
}

fn objects_only(endpoint: &str, items: &[Value]) -> Vec<Record> {
    let mut records = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::Object(map) => records.push(map.clone()),
            other => tracing::warn!("{}: skipping non-object record {}", endpoint, other),
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    #[test]
    fn test_page_request_uses_remote_field_names() {
        let window = DateWindow::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        );
        let body = serde_json::to_value(PageRequest::new(&window, 2, 1000)).unwrap();
        assert_eq!(
            body,
            json!({"start_date": "2024-01-01", "end_date": "2024-03-31", "Page": 2, "Pagesize": 1000})
        );
    }

    #[test]
    fn test_meta_requires_meta_flow() {
        let err = parse_meta_total("provision", &json!({"flow": "pagination", "records": []}))
            .unwrap_err();
        assert!(matches!(err, SyncError::ContractViolation { .. }));

        let err = parse_meta_total("provision", &json!({"total_no_of_records": 10})).unwrap_err();
        assert!(matches!(err, SyncError::ContractViolation { .. }));
    }

    #[test]
    fn test_meta_total_defaults_to_zero() {
        assert_eq!(parse_meta_total("p", &json!({"flow": "meta"})).unwrap(), 0);
        assert_eq!(
            parse_meta_total("p", &json!({"flow": "meta", "total_no_of_records": -5})).unwrap(),
            0
        );
        assert_eq!(
            parse_meta_total("p", &json!({"flow": "meta", "total_no_of_records": "2500"})).unwrap(),
            2500
        );
        assert_eq!(
            parse_meta_total("p", &json!({"flow": "meta", "total_no_of_records": 2500})).unwrap(),
            2500
        );
    }

    #[test]
    fn test_page_records_contract() {
        let records = parse_page_records(
            "citizen_master",
            &json!({"flow": "pagination", "records": [{"citizen_id": "C1"}, 7, {"citizen_id": "C2"}]}),
        )
        .unwrap();
        assert_eq!(records.len(), 2);

        let err = parse_page_records("citizen_master", &json!({"records": {"citizen_id": "C1"}}))
            .unwrap_err();
        assert!(matches!(err, SyncError::ContractViolation { .. }));

        // Wrong flow tag is tolerated
        let records =
            parse_page_records("citizen_master", &json!({"flow": "meta", "records": []})).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_dump_records_accepts_bare_array() {
        let records = parse_dump_records("district", &json!([{"district_id": 1}])).unwrap();
        assert_eq!(records.len(), 1);
        let records = parse_dump_records("district", &json!({"records": [{"district_id": 1}]})).unwrap();
        assert_eq!(records.len(), 1);
        assert!(parse_dump_records("district", &json!("oops")).is_err());
    }
}
