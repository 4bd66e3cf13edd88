// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Data type registry.
//!
//! Static table mapping each data type to its endpoint path fragment, the
//! shape its response comes back in, the authorization nodes that gate it,
//! and the query parameters it is requested with. The portal table is
//! [`Registry::standard`]; fixtures build their own with
//! [`Registry::from_descriptors`].

use crate::error::{HarvestError, HarvestResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// One medical-record category fetched and normalized independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataType {
    Medication,
    LabResults,
    LabGraphQuery,
    ChineseMedicine,
    Imaging,
    Allergy,
    Surgery,
    DischargeSummary,
    RemainingMedDays,
    PatientSummary,
    /// Authorization discovery only; never part of a completion tally.
    Menu,
    AdultHealthCheck,
    CancerScreening,
    HepatitisPanel,
}

impl DataType {
    pub const ALL: [DataType; 14] = [
        DataType::Medication,
        DataType::LabResults,
        DataType::LabGraphQuery,
        DataType::ChineseMedicine,
        DataType::Imaging,
        DataType::Allergy,
        DataType::Surgery,
        DataType::DischargeSummary,
        DataType::RemainingMedDays,
        DataType::PatientSummary,
        DataType::Menu,
        DataType::AdultHealthCheck,
        DataType::CancerScreening,
        DataType::HepatitisPanel,
    ];

    /// Wire key, as used in events and persisted snapshots.
    pub fn key(self) -> &'static str {
        match self {
            DataType::Medication => "medication",
            DataType::LabResults => "labResults",
            DataType::LabGraphQuery => "labGraphQuery",
            DataType::ChineseMedicine => "chineseMedicine",
            DataType::Imaging => "imaging",
            DataType::Allergy => "allergy",
            DataType::Surgery => "surgery",
            DataType::DischargeSummary => "dischargeSummary",
            DataType::RemainingMedDays => "remainingMedDays",
            DataType::PatientSummary => "patientSummary",
            DataType::Menu => "menu",
            DataType::AdultHealthCheck => "adultHealthCheck",
            DataType::CancerScreening => "cancerScreening",
            DataType::HepatitisPanel => "hepatitisPanel",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for DataType {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataType::ALL
            .iter()
            .copied()
            .find(|dt| dt.key() == s)
            .ok_or_else(|| HarvestError::UnsupportedDataType(s.to_string()))
    }
}

/// How a data type's raw payload maps onto a record sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseShape {
    /// Records live in the `rObject` (or `robject`) array.
    Array,
    /// The payload object is itself one record.
    SingleObject,
    /// The whole envelope, metadata included, is one record.
    WrappedEnvelope,
}

/// Query parameters attached when the orchestrator requests a data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryStyle {
    /// `_=<client millis>` cache buster.
    ClientTimestamp,
    /// Menu discovery: system id, no cache buster.
    Menu,
    /// Summary: cache buster plus the full-summary selector.
    Summary,
}

impl QueryStyle {
    /// Query pairs for a request issued at `now_millis`.
    pub fn params(self, now_millis: i64) -> Vec<(&'static str, String)> {
        match self {
            QueryStyle::ClientTimestamp => vec![("_", now_millis.to_string())],
            QueryStyle::Menu => vec![("sysId", "imu".to_string())],
            QueryStyle::Summary => vec![
                ("_", now_millis.to_string()),
                ("summaryType", "all".to_string()),
            ],
        }
    }
}

/// Immutable description of one data type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataTypeDescriptor {
    pub data_type: DataType,
    /// Path fragment matched against outbound URLs and appended to the base URL.
    pub endpoint_fragment: String,
    pub response_shape: ResponseShape,
    /// Empty means the type is never gated by the menu.
    pub auth_node_ids: BTreeSet<String>,
    pub query: QueryStyle,
}

impl DataTypeDescriptor {
    pub fn new(
        data_type: DataType,
        endpoint_fragment: &str,
        response_shape: ResponseShape,
        auth_node_ids: &[&str],
        query: QueryStyle,
    ) -> Self {
        Self {
            data_type,
            endpoint_fragment: endpoint_fragment.to_string(),
            response_shape,
            auth_node_ids: auth_node_ids.iter().map(|s| s.to_string()).collect(),
            query,
        }
    }

    /// Whether the authorization set permits this type.
    ///
    /// Ungated types are always permitted; gated types need any one of their
    /// nodes present.
    pub fn is_authorized(&self, granted: &std::collections::HashSet<String>) -> bool {
        self.auth_node_ids.is_empty() || self.auth_node_ids.iter().any(|n| granted.contains(n))
    }
}

/// The lookup table of all known data types.
#[derive(Debug, Clone)]
pub struct Registry {
    descriptors: Vec<DataTypeDescriptor>,
}

impl Registry {
    /// The portal's endpoint table.
    pub fn standard() -> Self {
        use QueryStyle::*;
        use ResponseShape::*;
        let d = DataTypeDescriptor::new;
        Self::from_descriptors(vec![
            d(DataType::Medication, "/imu/api/imue0008/imue0008s02/get-data", Array, &["1.1"], ClientTimestamp),
            d(DataType::LabResults, "/imu/api/imue0060/imue0060s02/get-data", Array, &["2.1"], ClientTimestamp),
            d(DataType::LabGraphQuery, "/imu/api/imue0060/imue0060s03/get-graph", SingleObject, &["2.1"], ClientTimestamp),
            d(DataType::ChineseMedicine, "/imu/api/imue0090/imue0090s02/get-data", Array, &["1.2"], ClientTimestamp),
            d(DataType::Imaging, "/imu/api/imue0130/imue0130s02/get-data", Array, &["3.1"], ClientTimestamp),
            d(DataType::Allergy, "/imu/api/imue0040/imue0040s02/get-data", Array, &["1.1"], ClientTimestamp),
            d(DataType::Surgery, "/imu/api/imue0020/imue0020s02/get-data", Array, &["4.1"], ClientTimestamp),
            d(DataType::DischargeSummary, "/imu/api/imue0070/imue0070s02/get-data", Array, &["5.1"], ClientTimestamp),
            d(DataType::RemainingMedDays, "/imu/api/imue0120/imue0120s01/pres-med-day", Array, &["1.1"], ClientTimestamp),
            d(DataType::PatientSummary, "/imu/api/imue2000/imue2000s01/get-summary", WrappedEnvelope, &[], Summary),
            d(DataType::Menu, "/imu/api/imue0000/imue0000s01/get-menu", WrappedEnvelope, &[], Menu),
            d(DataType::AdultHealthCheck, "/imu/api/imue0140/imue0140s02/get-data", Array, &["6.1"], ClientTimestamp),
            d(DataType::CancerScreening, "/imu/api/imue0150/imue0150s02/get-data", Array, &["6.2"], ClientTimestamp),
            d(DataType::HepatitisPanel, "/imu/api/imue0180/imue0180s02/get-data", Array, &["6.3"], ClientTimestamp),
        ])
    }

    /// Build a registry from an explicit descriptor list.
    pub fn from_descriptors(descriptors: Vec<DataTypeDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn get(&self, data_type: DataType) -> Option<&DataTypeDescriptor> {
        self.descriptors.iter().find(|d| d.data_type == data_type)
    }

    /// Resolve a wire key to its descriptor.
    pub fn lookup(&self, key: &str) -> HarvestResult<&DataTypeDescriptor> {
        let data_type: DataType = key.parse()?;
        self.get(data_type)
            .ok_or_else(|| HarvestError::UnsupportedDataType(key.to_string()))
    }

    /// Descriptor whose fragment appears in `url`. Longest fragment wins.
    pub fn match_url(&self, url: &str) -> Option<&DataTypeDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| !d.endpoint_fragment.is_empty() && url.contains(&d.endpoint_fragment))
            .max_by_key(|d| d.endpoint_fragment.len())
    }

    /// All descriptors except the menu, in registry order.
    pub fn data_descriptors(&self) -> impl Iterator<Item = &DataTypeDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| d.data_type != DataType::Menu)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataTypeDescriptor> {
        self.descriptors.iter()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::standard()
    }
}
