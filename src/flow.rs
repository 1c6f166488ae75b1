// 🌊 Flow records - the canonical Flow-By-Activity row and its sector-tagged form
//
// A FlowRecord is created once by the normalizer and never mutated in place
// afterwards; later stages produce new values (SectorFlow, AggregatedFlow).

use crate::location::LocationSystem;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

/// Keyword stored in place of a number when the source suppressed the value
pub const WITHDRAWN_KEYWORD: &str = "W";

// ============================================================================
// FLOW AMOUNT
// ============================================================================

/// A flow magnitude, or the marker that the source withheld it.
///
/// Withdrawn is NOT zero: it survives validation untouched and is skipped
/// (not summed) by aggregation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlowAmount {
    Value(f64),
    Withdrawn,
}

impl FlowAmount {
    pub fn value(&self) -> Option<f64> {
        match self {
            FlowAmount::Value(v) => Some(*v),
            FlowAmount::Withdrawn => None,
        }
    }

    pub fn is_withdrawn(&self) -> bool {
        matches!(self, FlowAmount::Withdrawn)
    }

    /// Multiply a real value; Withdrawn stays Withdrawn
    pub fn scaled(&self, factor: f64) -> FlowAmount {
        match self {
            FlowAmount::Value(v) => FlowAmount::Value(v * factor),
            FlowAmount::Withdrawn => FlowAmount::Withdrawn,
        }
    }
}

impl fmt::Display for FlowAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowAmount::Value(v) => write!(f, "{}", v),
            FlowAmount::Withdrawn => f.write_str(WITHDRAWN_KEYWORD),
        }
    }
}

impl Serialize for FlowAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FlowAmount::Value(v) => serializer.serialize_f64(*v),
            FlowAmount::Withdrawn => serializer.serialize_str(WITHDRAWN_KEYWORD),
        }
    }
}

struct FlowAmountVisitor;

impl<'de> Visitor<'de> for FlowAmountVisitor {
    type Value = FlowAmount;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a number or the withdrawn keyword \"{}\"", WITHDRAWN_KEYWORD)
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<FlowAmount, E> {
        Ok(FlowAmount::Value(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<FlowAmount, E> {
        Ok(FlowAmount::Value(v as f64))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<FlowAmount, E> {
        Ok(FlowAmount::Value(v as f64))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<FlowAmount, E> {
        let v = v.trim();
        if v == WITHDRAWN_KEYWORD {
            return Ok(FlowAmount::Withdrawn);
        }
        v.parse::<f64>()
            .map(FlowAmount::Value)
            .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for FlowAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<FlowAmount, D::Error> {
        deserializer.deserialize_any(FlowAmountVisitor)
    }
}

// ============================================================================
// FLOW TYPE
// ============================================================================

/// How a flow takes part in downstream mass-balance accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowType {
    ElementaryFlow,
    TechnosphereFlow,
    WasteFlow,
}

impl FlowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::ElementaryFlow => "ELEMENTARY_FLOW",
            FlowType::TechnosphereFlow => "TECHNOSPHERE_FLOW",
            FlowType::WasteFlow => "WASTE_FLOW",
        }
    }

    pub fn parse(s: &str) -> Option<FlowType> {
        match s.trim().to_uppercase().as_str() {
            "ELEMENTARY_FLOW" => Some(FlowType::ElementaryFlow),
            "TECHNOSPHERE_FLOW" => Some(FlowType::TechnosphereFlow),
            "WASTE_FLOW" => Some(FlowType::WasteFlow),
            _ => None,
        }
    }
}

impl Default for FlowType {
    fn default() -> Self {
        FlowType::ElementaryFlow
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// FLOW RECORD (Flow-By-Activity row)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    /// Category of flow: "Water", "Chemicals", "Land", "Money", ...
    #[serde(rename = "Class")]
    pub class: String,

    /// Provenance tag of the adapter that produced the row
    #[serde(rename = "SourceName")]
    pub source_name: String,

    #[serde(rename = "FlowName")]
    pub flow_name: String,

    #[serde(rename = "FlowAmount")]
    pub flow_amount: FlowAmount,

    #[serde(rename = "Unit")]
    pub unit: String,

    #[serde(rename = "FlowType")]
    pub flow_type: FlowType,

    #[serde(rename = "ActivityProducedBy")]
    pub activity_produced_by: Option<String>,

    #[serde(rename = "ActivityConsumedBy")]
    pub activity_consumed_by: Option<String>,

    #[serde(rename = "Compartment")]
    pub compartment: Option<String>,

    /// 5 digit FIPS code
    #[serde(rename = "Location")]
    pub location: String,

    /// Vintage of the code system `location` belongs to, e.g. "FIPS_2015"
    #[serde(rename = "LocationSystem")]
    pub location_system: String,

    #[serde(rename = "Year")]
    pub year: i32,

    /// Data-quality score, 1 (best) to 5
    #[serde(rename = "DataReliability")]
    pub data_reliability: Option<u8>,

    /// Data-quality score, 1 (best) to 5
    #[serde(rename = "DataCollection")]
    pub data_collection: Option<u8>,

    #[serde(rename = "Description")]
    pub description: Option<String>,
}

impl FlowRecord {
    /// Create a record with the required fields; the location system is
    /// derived from the year and the flow type defaults to elementary.
    pub fn new(
        class: &str,
        source_name: &str,
        flow_name: &str,
        amount: f64,
        unit: &str,
        location: &str,
        year: i32,
    ) -> Self {
        FlowRecord {
            class: class.to_string(),
            source_name: source_name.to_string(),
            flow_name: flow_name.to_string(),
            flow_amount: FlowAmount::Value(amount),
            unit: unit.to_string(),
            flow_type: FlowType::default(),
            activity_produced_by: None,
            activity_consumed_by: None,
            compartment: None,
            location: location.to_string(),
            location_system: LocationSystem::for_year(year).as_str().to_string(),
            year,
            data_reliability: None,
            data_collection: None,
            description: None,
        }
    }

    /// Builder: activity generating the flow
    pub fn with_produced_by(mut self, activity: &str) -> Self {
        self.activity_produced_by = Some(activity.to_string());
        self
    }

    /// Builder: activity using the flow
    pub fn with_consumed_by(mut self, activity: &str) -> Self {
        self.activity_consumed_by = Some(activity.to_string());
        self
    }

    pub fn with_flow_type(mut self, flow_type: FlowType) -> Self {
        self.flow_type = flow_type;
        self
    }

    pub fn with_compartment(mut self, compartment: &str) -> Self {
        self.compartment = Some(compartment.to_string());
        self
    }

    pub fn with_location_system(mut self, system: &str) -> Self {
        self.location_system = system.to_string();
        self
    }

    pub fn with_quality(mut self, reliability: u8, collection: u8) -> Self {
        self.data_reliability = Some(reliability);
        self.data_collection = Some(collection);
        self
    }

    /// Builder: mark the amount as suppressed by the source
    pub fn withdrawn(mut self) -> Self {
        self.flow_amount = FlowAmount::Withdrawn;
        self
    }

    /// Producing activity if present, otherwise the consuming one
    pub fn primary_activity(&self) -> Option<&str> {
        non_blank(&self.activity_produced_by).or_else(|| non_blank(&self.activity_consumed_by))
    }

    pub fn has_activity(&self) -> bool {
        self.primary_activity().is_some()
    }
}

pub(crate) fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

// ============================================================================
// SECTOR FLOW (mapped record)
// ============================================================================

/// A FlowRecord after crosswalk mapping.
///
/// The wrapped record's amount already includes the apportionment weight.
/// Unmapped activities leave the matching sector column empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorFlow {
    #[serde(flatten)]
    pub flow: FlowRecord,

    #[serde(rename = "SectorProducedBy")]
    pub sector_produced_by: Option<String>,

    #[serde(rename = "SectorConsumedBy")]
    pub sector_consumed_by: Option<String>,

    /// Classification system of the sector codes, e.g. "NAICS_2012_Code"
    #[serde(rename = "SectorSourceName")]
    pub sector_source_name: Option<String>,

    #[serde(rename = "SectorType")]
    pub sector_type: Option<String>,

    /// Weight applied when the activity was split across sectors
    #[serde(rename = "ApportionmentWeight")]
    pub apportionment_weight: Option<f64>,
}

impl SectorFlow {
    /// Representative sector: producing sector if present, else consuming
    pub fn sector(&self) -> Option<&str> {
        non_blank(&self.sector_produced_by).or_else(|| non_blank(&self.sector_consumed_by))
    }

    /// Consuming sector, only when a producing sector is also present
    pub fn secondary_sector(&self) -> Option<&str> {
        non_blank(&self.sector_produced_by).and(non_blank(&self.sector_consumed_by))
    }

    /// True when every populated activity column resolved to a sector
    pub fn is_mapped(&self) -> bool {
        let produced_ok = non_blank(&self.flow.activity_produced_by).is_none()
            || non_blank(&self.sector_produced_by).is_some();
        let consumed_ok = non_blank(&self.flow.activity_consumed_by).is_none()
            || non_blank(&self.sector_consumed_by).is_some();
        self.sector().is_some() && produced_ok && consumed_ok
    }
}

impl From<FlowRecord> for SectorFlow {
    fn from(flow: FlowRecord) -> Self {
        SectorFlow {
            flow,
            sector_produced_by: None,
            sector_consumed_by: None,
            sector_source_name: None,
            sector_type: None,
            apportionment_weight: None,
        }
    }
}

// ============================================================================
// TABLE FINGERPRINT
// ============================================================================

/// SHA-256 over the serialized rows, in order.
///
/// Two tables with the same fingerprint are byte-identical when written out,
/// which is what idempotence of normalization is checked against.
pub fn fingerprint<T: Serialize>(rows: &[T]) -> serde_json::Result<String> {
    let mut hasher = Sha256::new();
    for row in rows {
        hasher.update(serde_json::to_vec(row)?);
        hasher.update(b"\n");
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FlowRecord {
        FlowRecord::new("Land", "USDA_ERS_MLU", "Land Use", 120.5, "Acres", "00000", 2012)
            .with_produced_by("Cropland used for crops")
    }

    #[test]
    fn test_new_assigns_location_system_from_year() {
        let r = sample();
        assert_eq!(r.location_system, "FIPS_2010");
        assert_eq!(r.flow_type, FlowType::ElementaryFlow);
    }

    #[test]
    fn test_primary_activity_prefers_produced_by() {
        let r = sample().with_consumed_by("Households");
        assert_eq!(r.primary_activity(), Some("Cropland used for crops"));

        let mut r = r;
        r.activity_produced_by = Some("   ".to_string());
        assert_eq!(r.primary_activity(), Some("Households"));
    }

    #[test]
    fn test_withdrawn_is_not_zero() {
        let r = sample().withdrawn();
        assert!(r.flow_amount.is_withdrawn());
        assert_eq!(r.flow_amount.value(), None);
        assert_eq!(r.flow_amount.scaled(0.5), FlowAmount::Withdrawn);
        assert_ne!(r.flow_amount, FlowAmount::Value(0.0));
    }

    #[test]
    fn test_flow_amount_json_forms() {
        let json = serde_json::to_string(&sample().withdrawn()).unwrap();
        assert!(json.contains("\"FlowAmount\":\"W\""));

        let back: FlowRecord = serde_json::from_str(&json).unwrap();
        assert!(back.flow_amount.is_withdrawn());

        let amount: FlowAmount = serde_json::from_str("\"42.5\"").unwrap();
        assert_eq!(amount, FlowAmount::Value(42.5));

        let amount: FlowAmount = serde_json::from_str("7").unwrap();
        assert_eq!(amount, FlowAmount::Value(7.0));

        assert!(serde_json::from_str::<FlowAmount>("\"n/a\"").is_err());
    }

    #[test]
    fn test_flow_type_parse() {
        assert_eq!(FlowType::parse("waste_flow"), Some(FlowType::WasteFlow));
        assert_eq!(FlowType::parse("TECHNOSPHERE_FLOW"), Some(FlowType::TechnosphereFlow));
        assert_eq!(FlowType::parse("other"), None);
    }

    #[test]
    fn test_sector_flow_accessors() {
        let mut sf = SectorFlow::from(sample().with_consumed_by("Households"));
        assert_eq!(sf.sector(), None);
        assert!(!sf.is_mapped());

        sf.sector_consumed_by = Some("F010".to_string());
        assert_eq!(sf.sector(), Some("F010"));
        assert_eq!(sf.secondary_sector(), None);
        // producing activity still unresolved
        assert!(!sf.is_mapped());

        sf.sector_produced_by = Some("111".to_string());
        assert_eq!(sf.sector(), Some("111"));
        assert_eq!(sf.secondary_sector(), Some("F010"));
        assert!(sf.is_mapped());
    }

    #[test]
    fn test_fingerprint_is_order_sensitive() {
        let a = sample();
        let b = sample().with_compartment("ground");

        let f1 = fingerprint(&[a.clone(), b.clone()]).unwrap();
        let f2 = fingerprint(&[a.clone(), b.clone()]).unwrap();
        let f3 = fingerprint(&[b, a]).unwrap();

        assert_eq!(f1, f2);
        assert_ne!(f1, f3);
        assert_eq!(f1.len(), 64);
    }
}
