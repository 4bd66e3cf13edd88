// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Response normalization.
//!
//! Every data type comes back in one of three raw shapes. Normalization turns
//! any of them into the canonical `{ records: [...] }` form. It is pure: no
//! shared state, no logging, and it never fails. A payload that does not fit
//! its declared shape yields an empty record sequence; [`try_normalize`]
//! exposes the reason for callers that want to log it.

use crate::registry::{DataType, DataTypeDescriptor, ResponseShape};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// One normalized unit of medical data.
pub type Record = Value;

/// The two casings the upstream API uses for its record array.
const RECORD_FIELDS: [&str; 2] = ["rObject", "robject"];

/// Menu field listing granted authorization nodes.
const AUTH_FIELD: &str = "prsnAuth";

/// Canonical result for one data type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecordSet {
    pub data_type: DataType,
    pub records: Vec<Record>,
    pub captured_at: DateTime<Utc>,
}

impl NormalizedRecordSet {
    pub fn empty(data_type: DataType, captured_at: DateTime<Utc>) -> Self {
        Self {
            data_type,
            records: Vec::new(),
            captured_at,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// The output shape handed to consumers: always an array, possibly empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordView {
    pub records: Vec<Record>,
}

/// Why a payload did not match its declared shape.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeMismatch {
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload object is empty")]
    EmptyObject,
    #[error("record field (rObject/robject) is missing")]
    MissingRecordField,
    #[error("record field is not an array")]
    RecordFieldNotArray,
}

/// Normalize `raw` according to the descriptor's response shape.
pub fn normalize(
    raw: &Value,
    descriptor: &DataTypeDescriptor,
    captured_at: DateTime<Utc>,
) -> NormalizedRecordSet {
    let records = extract_records(raw, descriptor.response_shape).unwrap_or_default();
    NormalizedRecordSet {
        data_type: descriptor.data_type,
        records,
        captured_at,
    }
}

/// Like [`normalize`], but reports a shape mismatch instead of swallowing it.
pub fn try_normalize(
    raw: &Value,
    descriptor: &DataTypeDescriptor,
    captured_at: DateTime<Utc>,
) -> Result<NormalizedRecordSet, ShapeMismatch> {
    let records = extract_records(raw, descriptor.response_shape)?;
    Ok(NormalizedRecordSet {
        data_type: descriptor.data_type,
        records,
        captured_at,
    })
}

fn extract_records(raw: &Value, shape: ResponseShape) -> Result<Vec<Record>, ShapeMismatch> {
    match shape {
        ResponseShape::Array => {
            let obj = raw.as_object().ok_or(ShapeMismatch::NotAnObject)?;
            let field = RECORD_FIELDS
                .iter()
                .find_map(|name| obj.get(*name))
                .ok_or(ShapeMismatch::MissingRecordField)?;
            match field {
                Value::Array(items) => Ok(items.clone()),
                _ => Err(ShapeMismatch::RecordFieldNotArray),
            }
        }
        ResponseShape::SingleObject => {
            let obj = raw.as_object().ok_or(ShapeMismatch::NotAnObject)?;
            if obj.is_empty() {
                return Err(ShapeMismatch::EmptyObject);
            }
            Ok(vec![raw.clone()])
        }
        ResponseShape::WrappedEnvelope => {
            if !raw.is_object() {
                return Err(ShapeMismatch::NotAnObject);
            }
            Ok(vec![raw.clone()])
        }
    }
}

/// Authorization nodes granted by a normalized menu record.
///
/// Reads `prsnAuth` from the envelope, or from its record field when the
/// portal nests it. Entries may be strings, numbers, or objects carrying
/// `id`/`nodeId`. `None` when the record carries no usable list, which the
/// orchestrator treats as fail-open.
pub fn authorization_set(menu: &NormalizedRecordSet) -> Option<HashSet<String>> {
    let record = menu.records.first()?;
    let list = record.get(AUTH_FIELD).or_else(|| {
        RECORD_FIELDS
            .iter()
            .find_map(|name| record.get(*name))
            .and_then(|inner| inner.get(AUTH_FIELD))
    })?;

    let items = list.as_array()?;
    Some(items.iter().filter_map(node_id).collect())
}

fn node_id(item: &Value) -> Option<String> {
    match item {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(obj) => ["nodeId", "id"]
            .iter()
            .find_map(|k| obj.get(*k))
            .and_then(node_id),
        _ => None,
    }
}
