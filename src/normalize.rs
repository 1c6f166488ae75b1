// 🔄 Schema Normalizer - raw adapter rows → canonical Flow-By-Activity records
//
// Pure: no I/O, and the same table + config always yields the same records
// in the same order.

use crate::adapter::{RawRow, RawTable};
use crate::config::SourceConfig;
use crate::error::{FlowsaError, Result};
use crate::flow::{FlowAmount, FlowRecord, FlowType};
use crate::location::{pad_fips, LocationSystem};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Cell values meaning "the source suppressed this number"
pub const DEFAULT_WITHDRAWN_TOKENS: &[&str] = &["--", "W", "NA", "N/A", "(D)", "nan", ""];

// ============================================================================
// CANONICAL FIELDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CanonicalField {
    Class,
    SourceName,
    FlowName,
    FlowAmount,
    Unit,
    FlowType,
    ActivityProducedBy,
    ActivityConsumedBy,
    Compartment,
    Location,
    LocationSystem,
    Year,
    DataReliability,
    DataCollection,
    Description,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 15] = [
        CanonicalField::Class,
        CanonicalField::SourceName,
        CanonicalField::FlowName,
        CanonicalField::FlowAmount,
        CanonicalField::Unit,
        CanonicalField::FlowType,
        CanonicalField::ActivityProducedBy,
        CanonicalField::ActivityConsumedBy,
        CanonicalField::Compartment,
        CanonicalField::Location,
        CanonicalField::LocationSystem,
        CanonicalField::Year,
        CanonicalField::DataReliability,
        CanonicalField::DataCollection,
        CanonicalField::Description,
    ];

    /// Column name in the Flow-By-Activity format
    pub fn name(&self) -> &'static str {
        match self {
            CanonicalField::Class => "Class",
            CanonicalField::SourceName => "SourceName",
            CanonicalField::FlowName => "FlowName",
            CanonicalField::FlowAmount => "FlowAmount",
            CanonicalField::Unit => "Unit",
            CanonicalField::FlowType => "FlowType",
            CanonicalField::ActivityProducedBy => "ActivityProducedBy",
            CanonicalField::ActivityConsumedBy => "ActivityConsumedBy",
            CanonicalField::Compartment => "Compartment",
            CanonicalField::Location => "Location",
            CanonicalField::LocationSystem => "LocationSystem",
            CanonicalField::Year => "Year",
            CanonicalField::DataReliability => "DataReliability",
            CanonicalField::DataCollection => "DataCollection",
            CanonicalField::Description => "Description",
        }
    }

    /// Accepts "FlowAmount", "flow_amount", "flowamount"
    pub fn parse(name: &str) -> Option<CanonicalField> {
        let wanted = squash(name);
        CanonicalField::ALL
            .iter()
            .copied()
            .find(|f| squash(f.name()) == wanted)
    }
}

fn squash(name: &str) -> String {
    name.trim()
        .chars()
        .filter(|c| *c != '_' && *c != ' ')
        .collect::<String>()
        .to_lowercase()
}

// ============================================================================
// FLOW TYPE KEYWORDS
// ============================================================================

/// Keyword lists used to pick a flow type when the source does not state one.
/// Everything starts elementary; waste keywords win over technosphere ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowTypeKeywords {
    pub technosphere: Vec<String>,
    pub waste: Vec<String>,
}

impl FlowTypeKeywords {
    pub fn classify(&self, text: &str) -> FlowType {
        let text = text.to_lowercase();
        let hit = |words: &[String]| words.iter().any(|w| text.contains(&w.to_lowercase()));

        if hit(&self.waste) {
            FlowType::WasteFlow
        } else if hit(&self.technosphere) {
            FlowType::TechnosphereFlow
        } else {
            FlowType::ElementaryFlow
        }
    }
}

// ============================================================================
// OUTPUT
// ============================================================================

/// What the normalizer saw, for the end-of-run summary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizationReport {
    pub rows_in: usize,
    pub records_out: usize,
    pub withdrawn: usize,
    pub asserted_zero: usize,
    /// Source columns not named in the column mapping
    pub dropped_columns: Vec<String>,
    /// Tokens configured as "true zero" that are also suppression markers
    pub zero_token_conflicts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub records: Vec<FlowRecord>,
    pub report: NormalizationReport,
}

// ============================================================================
// NORMALIZER
// ============================================================================

pub struct Normalizer {
    /// canonical field → source column, in source-column order
    mapping: Vec<(String, CanonicalField)>,
    statics: BTreeMap<CanonicalField, Option<String>>,
    measure_column: Option<String>,
    withdrawn_tokens: Vec<String>,
    zero_tokens: Vec<String>,
    flow_type_keywords: FlowTypeKeywords,
}

impl Normalizer {
    /// Build a normalizer from a source configuration.
    ///
    /// Unknown canonical names in the mapping or static fields are a
    /// configuration error.
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let mut mapping = Vec::new();
        for (source, target) in &config.column_mapping {
            let field = CanonicalField::parse(target).ok_or_else(|| {
                FlowsaError::Config(format!(
                    "column {} maps to unknown canonical field {}",
                    source, target
                ))
            })?;
            mapping.push((source.clone(), field));
        }

        let mut statics = BTreeMap::new();
        for (name, value) in &config.static_fields {
            let field = CanonicalField::parse(name).ok_or_else(|| {
                FlowsaError::Config(format!("static field {} is not a canonical field", name))
            })?;
            let literal = match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            };
            statics.insert(field, literal);
        }

        let measure_column = config.measure_column.clone().or_else(|| {
            mapping
                .iter()
                .find(|(_, f)| *f == CanonicalField::FlowAmount)
                .map(|(s, _)| s.clone())
        });

        let withdrawn_tokens = match &config.withdrawn_tokens {
            Some(tokens) => tokens.clone(),
            None => DEFAULT_WITHDRAWN_TOKENS.iter().map(|t| t.to_string()).collect(),
        };

        Ok(Normalizer {
            mapping,
            statics,
            measure_column,
            withdrawn_tokens,
            zero_tokens: config.zero_tokens.clone(),
            flow_type_keywords: config.flow_type_keywords.clone(),
        })
    }

    /// Map every raw row to a FlowRecord.
    ///
    /// Fails with `SchemaMapping` when FlowAmount or Location cannot be
    /// populated, or when a value cannot be parsed. Year falls back to the
    /// table's context year.
    pub fn normalize(&self, table: &RawTable) -> Result<Normalized> {
        let dataset = table.context.dataset_id.as_str();
        let year = table.context.year;

        let mut report = NormalizationReport {
            rows_in: table.len(),
            ..Default::default()
        };

        report.zero_token_conflicts = self
            .zero_tokens
            .iter()
            .filter(|z| self.withdrawn_tokens.iter().any(|w| w.trim() == z.trim()))
            .cloned()
            .collect();
        for token in &report.zero_token_conflicts {
            warn!(
                dataset,
                year,
                token = %token,
                "source asserts zero for a token that usually marks suppressed data"
            );
        }

        report.dropped_columns = table
            .columns
            .iter()
            .filter(|c| !self.mapping.iter().any(|(s, _)| s == *c))
            .filter(|c| self.measure_column.as_deref() != Some(c.as_str()))
            .cloned()
            .collect();

        let amount_is_static = self.statics.contains_key(&CanonicalField::FlowAmount);
        match &self.measure_column {
            Some(col) if table.has_column(col) => {}
            _ if amount_is_static => {}
            Some(col) => {
                return Err(FlowsaError::schema(
                    dataset,
                    year,
                    table.len(),
                    format!("measure column {} not present in source table", col),
                ))
            }
            None => {
                return Err(FlowsaError::schema(
                    dataset,
                    year,
                    table.len(),
                    "no column mapped to FlowAmount",
                ))
            }
        }

        let mut records = Vec::with_capacity(table.len());
        let mut missing_location = 0usize;

        for row in &table.rows {
            let fields = self.collect_fields(row);

            let location = match fields.get(&CanonicalField::Location) {
                Some(loc) if !loc.trim().is_empty() => pad_fips(loc),
                _ => {
                    missing_location += 1;
                    continue;
                }
            };

            let amount = self.parse_amount(fields.get(&CanonicalField::FlowAmount), &mut report)
                .map_err(|reason| {
                    FlowsaError::schema(dataset, year, 1, format!("line {}: {}", row.line_number, reason))
                })?;

            let record_year = match fields.get(&CanonicalField::Year) {
                Some(y) if !y.trim().is_empty() => parse_year(y).ok_or_else(|| {
                    FlowsaError::schema(
                        dataset,
                        year,
                        1,
                        format!("line {}: unparseable Year {:?}", row.line_number, y),
                    )
                })?,
                _ => year,
            };

            let text = |f: CanonicalField| {
                fields
                    .get(&f)
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
            };

            let flow_name = text(CanonicalField::FlowName).unwrap_or_default();
            let activity_produced_by = text(CanonicalField::ActivityProducedBy);
            let activity_consumed_by = text(CanonicalField::ActivityConsumedBy);

            let flow_type = match text(CanonicalField::FlowType) {
                Some(ft) => FlowType::parse(&ft).ok_or_else(|| {
                    FlowsaError::schema(
                        dataset,
                        year,
                        1,
                        format!("line {}: unknown FlowType {:?}", row.line_number, ft),
                    )
                })?,
                None => {
                    let haystack = format!(
                        "{} {} {}",
                        flow_name,
                        activity_produced_by.as_deref().unwrap_or_default(),
                        activity_consumed_by.as_deref().unwrap_or_default()
                    );
                    self.flow_type_keywords.classify(&haystack)
                }
            };

            let score = |f: CanonicalField| -> Result<Option<u8>> {
                match text(f) {
                    None => Ok(None),
                    Some(s) => parse_score(&s).map(Some).ok_or_else(|| {
                        FlowsaError::schema(
                            dataset,
                            year,
                            1,
                            format!("line {}: unparseable {} {:?}", row.line_number, f.name(), s),
                        )
                    }),
                }
            };

            let record = FlowRecord {
                class: text(CanonicalField::Class).unwrap_or_default(),
                source_name: text(CanonicalField::SourceName).unwrap_or_else(|| dataset.to_string()),
                flow_name,
                flow_amount: amount,
                unit: text(CanonicalField::Unit).unwrap_or_default(),
                flow_type,
                activity_produced_by,
                activity_consumed_by,
                compartment: text(CanonicalField::Compartment),
                location,
                location_system: text(CanonicalField::LocationSystem)
                    .unwrap_or_else(|| LocationSystem::for_year(record_year).as_str().to_string()),
                year: record_year,
                data_reliability: score(CanonicalField::DataReliability)?,
                data_collection: score(CanonicalField::DataCollection)?,
                description: text(CanonicalField::Description),
            };
            records.push(record);
        }

        if missing_location > 0 {
            return Err(FlowsaError::schema(
                dataset,
                year,
                missing_location,
                "Location could not be populated",
            ));
        }

        report.records_out = records.len();
        info!(
            dataset,
            year,
            records = report.records_out,
            withdrawn = report.withdrawn,
            "normalized source table"
        );

        Ok(Normalized { records, report })
    }

    /// Canonical field → raw value for one row; static fields win
    fn collect_fields(&self, row: &RawRow) -> BTreeMap<CanonicalField, String> {
        let mut fields = BTreeMap::new();

        for (source, field) in &self.mapping {
            if let Some(value) = row.get(source) {
                let existing_blank = fields
                    .get(field)
                    .map(|v: &String| v.trim().is_empty())
                    .unwrap_or(true);
                if existing_blank {
                    fields.insert(*field, value.to_string());
                }
            }
        }

        if let Some(col) = &self.measure_column {
            if let Some(value) = row.get(col) {
                fields.insert(CanonicalField::FlowAmount, value.to_string());
            } else {
                fields.entry(CanonicalField::FlowAmount).or_default();
            }
        }

        for (field, literal) in &self.statics {
            match literal {
                Some(v) => {
                    fields.insert(*field, v.clone());
                }
                None => {
                    fields.remove(field);
                }
            }
        }

        fields
    }

    fn parse_amount(
        &self,
        raw: Option<&String>,
        report: &mut NormalizationReport,
    ) -> std::result::Result<FlowAmount, String> {
        let raw = raw.map(|s| s.trim()).unwrap_or("");

        if self.zero_tokens.iter().any(|z| z.trim() == raw) {
            report.asserted_zero += 1;
            return Ok(FlowAmount::Value(0.0));
        }

        if self.withdrawn_tokens.iter().any(|w| w.trim() == raw) {
            report.withdrawn += 1;
            return Ok(FlowAmount::Withdrawn);
        }

        parse_number(raw)
            .map(FlowAmount::Value)
            .ok_or_else(|| format!("unparseable FlowAmount {:?}", raw))
    }
}

/// Parse "1,234.5", " 42 ", "-3e2"
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn parse_year(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    let raw = raw.strip_suffix(".0").unwrap_or(raw);
    raw.parse::<i32>().ok()
}

fn parse_score(raw: &str) -> Option<u8> {
    let raw = raw.trim();
    let raw = raw.strip_suffix(".0").unwrap_or(raw);
    raw.parse::<u8>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{RawTableBuilder, SourceContext};
    use crate::flow::fingerprint;
    use serde_json::json;

    fn mica_config() -> SourceConfig {
        let mut config = SourceConfig::default();
        config.column_mapping.insert("Production".to_string(), "ActivityProducedBy".to_string());
        config.column_mapping.insert("Amount".to_string(), "FlowAmount".to_string());
        config.column_mapping.insert("FIPS".to_string(), "Location".to_string());
        config.static_fields.insert("Class".to_string(), json!("Geological"));
        config.static_fields.insert("Unit".to_string(), json!("Metric Tons"));
        config.static_fields.insert("FlowName".to_string(), json!("Mica production"));
        config.static_fields.insert("DataReliability".to_string(), json!(5));
        config
    }

    fn mica_table(amounts: &[&str]) -> RawTable {
        let mut builder = RawTableBuilder::new(
            SourceContext::new("USGS_MYB_Mica", 2016),
            &["Production", "Amount", "FIPS", "Notes"],
        );
        for amount in amounts {
            builder.push_row(vec![
                ("Production", "Mica, scrap and flake"),
                ("Amount", *amount),
                ("FIPS", "0"),
                ("Notes", "ignored"),
            ]);
        }
        builder.build()
    }

    #[test]
    fn test_canonical_field_parse() {
        assert_eq!(CanonicalField::parse("FlowAmount"), Some(CanonicalField::FlowAmount));
        assert_eq!(CanonicalField::parse("flow_amount"), Some(CanonicalField::FlowAmount));
        assert_eq!(
            CanonicalField::parse("activity_produced_by"),
            Some(CanonicalField::ActivityProducedBy)
        );
        assert_eq!(CanonicalField::parse("Sector"), None);
    }

    #[test]
    fn test_normalize_applies_mapping_and_statics() {
        let normalizer = Normalizer::new(&mica_config()).unwrap();
        let out = normalizer.normalize(&mica_table(&["1,250"])).unwrap();

        assert_eq!(out.records.len(), 1);
        let r = &out.records[0];
        assert_eq!(r.class, "Geological");
        assert_eq!(r.source_name, "USGS_MYB_Mica");
        assert_eq!(r.flow_amount, FlowAmount::Value(1250.0));
        assert_eq!(r.unit, "Metric Tons");
        assert_eq!(r.activity_produced_by.as_deref(), Some("Mica, scrap and flake"));
        assert_eq!(r.location, "00000");
        assert_eq!(r.location_system, "FIPS_2015");
        assert_eq!(r.year, 2016);
        assert_eq!(r.data_reliability, Some(5));
        assert_eq!(out.report.dropped_columns, vec!["Notes".to_string()]);
    }

    #[test]
    fn test_withheld_cell_becomes_withdrawn_not_zero() {
        let normalizer = Normalizer::new(&mica_config()).unwrap();
        let out = normalizer.normalize(&mica_table(&["W", "--", "", "NA"])).unwrap();

        assert_eq!(out.report.withdrawn, 4);
        for r in &out.records {
            assert_eq!(r.flow_amount, FlowAmount::Withdrawn);
            assert_ne!(r.flow_amount, FlowAmount::Value(0.0));
        }
    }

    #[test]
    fn test_zero_token_is_honoured_and_flagged() {
        let mut config = mica_config();
        config.zero_tokens = vec!["--".to_string()];
        let normalizer = Normalizer::new(&config).unwrap();

        let out = normalizer.normalize(&mica_table(&["--", "W"])).unwrap();
        assert_eq!(out.records[0].flow_amount, FlowAmount::Value(0.0));
        assert_eq!(out.records[1].flow_amount, FlowAmount::Withdrawn);
        assert_eq!(out.report.asserted_zero, 1);
        assert_eq!(out.report.zero_token_conflicts, vec!["--".to_string()]);
    }

    #[test]
    fn test_missing_location_is_schema_error() {
        let mut config = mica_config();
        config.column_mapping.remove("FIPS");
        let normalizer = Normalizer::new(&config).unwrap();

        let err = normalizer.normalize(&mica_table(&["10", "20"])).unwrap_err();
        match err {
            FlowsaError::SchemaMapping { dataset, year, rows, .. } => {
                assert_eq!(dataset, "USGS_MYB_Mica");
                assert_eq!(year, 2016);
                assert_eq!(rows, 2);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_missing_measure_column_is_schema_error() {
        let mut config = mica_config();
        config.column_mapping.remove("Amount");
        let normalizer = Normalizer::new(&config).unwrap();

        let err = normalizer.normalize(&mica_table(&["10"])).unwrap_err();
        assert!(matches!(err, FlowsaError::SchemaMapping { .. }));
    }

    #[test]
    fn test_unparseable_amount_is_schema_error() {
        let normalizer = Normalizer::new(&mica_config()).unwrap();
        let err = normalizer.normalize(&mica_table(&["(3)"])).unwrap_err();
        assert!(err.to_string().contains("unparseable FlowAmount"));
    }

    #[test]
    fn test_unknown_canonical_field_is_config_error() {
        let mut config = mica_config();
        config.column_mapping.insert("X".to_string(), "Sector".to_string());
        assert!(matches!(Normalizer::new(&config), Err(FlowsaError::Config(_))));
    }

    #[test]
    fn test_flow_type_keywords() {
        let mut config = mica_config();
        config.static_fields.insert("FlowName".to_string(), json!("Public Supply wastewater"));
        config.flow_type_keywords = FlowTypeKeywords {
            technosphere: vec!["public supply".to_string()],
            waste: vec!["wastewater".to_string()],
        };
        let out = Normalizer::new(&config)
            .unwrap()
            .normalize(&mica_table(&["5"]))
            .unwrap();
        assert_eq!(out.records[0].flow_type, FlowType::WasteFlow);

        let keywords = FlowTypeKeywords {
            technosphere: vec!["consumptive".to_string()],
            waste: vec![],
        };
        assert_eq!(keywords.classify("Irrigation consumptive use"), FlowType::TechnosphereFlow);
        assert_eq!(keywords.classify("Irrigation withdrawals"), FlowType::ElementaryFlow);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let normalizer = Normalizer::new(&mica_config()).unwrap();
        let table = mica_table(&["10", "W", "1,000.5"]);

        let first = normalizer.normalize(&table).unwrap();
        let second = normalizer.normalize(&table).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            fingerprint(&first.records).unwrap(),
            fingerprint(&second.records).unwrap()
        );
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("1,234.5"), Some(1234.5));
        assert_eq!(parse_number(" 42 "), Some(42.0));
        assert_eq!(parse_number("-3e2"), Some(-300.0));
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("inf"), None);
    }
}
