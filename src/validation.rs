// ✅ Validator - invariant checks on FBA and mapped records
//
// Every rule is checked independently so one row can collect several issues.
// Withdrawn amounts are never subject to the numeric rules.

use crate::aggregation::AggregatedFlow;
use crate::error::{FlowsaError, Result};
use crate::flow::{FlowRecord, SectorFlow};
use crate::location::LocationSystem;
use crate::units::UnitTable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

// ============================================================================
// MODE + RULES
// ============================================================================

/// What happens to rows that violate a critical rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Abort the batch with a `Validation` error
    Strict,
    /// Keep every row, report the offenders
    Permissive,
    /// Remove offending rows, record each removal
    PermissiveDrop,
}

impl Default for ValidationMode {
    fn default() -> Self {
        ValidationMode::Strict
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    NegativeAmount,
    NonFiniteAmount,
    MissingUnit,
    UnknownUnit,
    InvalidLocation,
    UnknownLocationSystem,
    MissingActivity,
    MissingSector,
    QualityScoreOutOfRange,
}

impl Rule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rule::NegativeAmount => "negative_amount",
            Rule::NonFiniteAmount => "non_finite_amount",
            Rule::MissingUnit => "missing_unit",
            Rule::UnknownUnit => "unknown_unit",
            Rule::InvalidLocation => "invalid_location",
            Rule::UnknownLocationSystem => "unknown_location_system",
            Rule::MissingActivity => "missing_activity",
            Rule::MissingSector => "missing_sector",
            Rule::QualityScoreOutOfRange => "quality_score_out_of_range",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Critical, // row violates an invariant
    Warning,  // row is questionable but usable
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Position of the row in the validated batch
    pub row: usize,
    pub rule: Rule,
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    fn critical(row: usize, rule: Rule, field: &str, message: String) -> Self {
        ValidationIssue {
            row,
            rule,
            field: field.to_string(),
            message,
            severity: Severity::Critical,
        }
    }

    fn warning(row: usize, rule: Rule, field: &str, message: String) -> Self {
        ValidationIssue {
            row,
            rule,
            field: field.to_string(),
            message,
            severity: Severity::Warning,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub mode: ValidationMode,
    pub total_rows: usize,
    pub issues: Vec<ValidationIssue>,
    /// Rows removed in `PermissiveDrop` mode, by original position
    pub dropped_rows: Vec<usize>,
}

impl ValidationReport {
    /// Rows with at least one critical issue, ascending
    pub fn offending_rows(&self) -> Vec<usize> {
        let mut rows: Vec<usize> = self
            .issues
            .iter()
            .filter(|i| i.severity == Severity::Critical)
            .map(|i| i.row)
            .collect();
        rows.sort_unstable();
        rows.dedup();
        rows
    }

    pub fn is_clean(&self) -> bool {
        self.issues.iter().all(|i| i.severity != Severity::Critical)
    }

    pub fn issues_for(&self, row: usize) -> Vec<&ValidationIssue> {
        self.issues.iter().filter(|i| i.row == row).collect()
    }

    pub fn count_by_rule(&self) -> BTreeMap<Rule, usize> {
        let mut counts = BTreeMap::new();
        for issue in &self.issues {
            *counts.entry(issue.rule).or_insert(0) += 1;
        }
        counts
    }

    pub fn summary(&self) -> String {
        format!(
            "Rows: {}, Issues: {} ({} offending rows), Dropped: {}",
            self.total_rows,
            self.issues.len(),
            self.offending_rows().len(),
            self.dropped_rows.len()
        )
    }
}

/// Records that made it through validation, plus what was found
#[derive(Debug, Clone, PartialEq)]
pub struct Validated<T> {
    pub records: Vec<T>,
    pub report: ValidationReport,
}

// ============================================================================
// VALIDATOR
// ============================================================================

pub struct Validator {
    mode: ValidationMode,
    allow_negative: bool,
    require_sectors: bool,
    units: UnitTable,
}

impl Validator {
    pub fn new(mode: ValidationMode) -> Self {
        Validator {
            mode,
            allow_negative: false,
            require_sectors: false,
            units: UnitTable::new(),
        }
    }

    /// Builder: accept negative amounts (net flows)
    pub fn allow_negative(mut self, allow: bool) -> Self {
        self.allow_negative = allow;
        self
    }

    /// Builder: mapped records must carry a sector
    pub fn require_sectors(mut self, require: bool) -> Self {
        self.require_sectors = require;
        self
    }

    pub fn with_units(mut self, units: UnitTable) -> Self {
        self.units = units;
        self
    }

    pub fn validate(&self, records: &[FlowRecord]) -> Result<Validated<FlowRecord>> {
        let mut issues = Vec::new();
        for (row, record) in records.iter().enumerate() {
            self.check_flow(row, record, &mut issues);
        }
        self.finish(records, issues, |r| r)
    }

    pub fn validate_mapped(&self, records: &[SectorFlow]) -> Result<Validated<SectorFlow>> {
        let mut issues = Vec::new();
        for (row, record) in records.iter().enumerate() {
            self.check_flow(row, &record.flow, &mut issues);
            if self.require_sectors && record.sector().is_none() {
                issues.push(ValidationIssue::critical(
                    row,
                    Rule::MissingSector,
                    "Sector",
                    format!(
                        "no sector for activity {:?}",
                        record.flow.primary_activity().unwrap_or_default()
                    ),
                ));
            }
        }
        self.finish(records, issues, |r| &r.flow)
    }

    fn check_flow(&self, row: usize, record: &FlowRecord, issues: &mut Vec<ValidationIssue>) {
        if let Some(amount) = record.flow_amount.value() {
            if !amount.is_finite() {
                issues.push(ValidationIssue::critical(
                    row,
                    Rule::NonFiniteAmount,
                    "FlowAmount",
                    format!("amount {} is not finite", amount),
                ));
            } else if amount < 0.0 && !self.allow_negative {
                issues.push(ValidationIssue::critical(
                    row,
                    Rule::NegativeAmount,
                    "FlowAmount",
                    format!("negative amount {}", amount),
                ));
            }
        }

        if record.unit.trim().is_empty() {
            issues.push(ValidationIssue::critical(
                row,
                Rule::MissingUnit,
                "Unit",
                "unit is empty".to_string(),
            ));
        } else if !self.units.is_known(&record.unit) {
            issues.push(ValidationIssue::critical(
                row,
                Rule::UnknownUnit,
                "Unit",
                format!("unit {:?} is not recognized", record.unit),
            ));
        }

        match LocationSystem::parse(&record.location_system) {
            None => issues.push(ValidationIssue::critical(
                row,
                Rule::UnknownLocationSystem,
                "LocationSystem",
                format!("unknown location system {:?}", record.location_system),
            )),
            Some(system) if !system.is_valid_code(&record.location) => {
                issues.push(ValidationIssue::critical(
                    row,
                    Rule::InvalidLocation,
                    "Location",
                    format!("{:?} is not a {} code", record.location, system),
                ))
            }
            Some(_) => {}
        }

        if !record.has_activity() {
            issues.push(ValidationIssue::critical(
                row,
                Rule::MissingActivity,
                "ActivityProducedBy",
                "neither ActivityProducedBy nor ActivityConsumedBy is populated".to_string(),
            ));
        }

        for (field, score) in [
            ("DataReliability", record.data_reliability),
            ("DataCollection", record.data_collection),
        ] {
            if let Some(s) = score {
                if !(1..=5).contains(&s) {
                    issues.push(ValidationIssue::warning(
                        row,
                        Rule::QualityScoreOutOfRange,
                        field,
                        format!("score {} outside 1-5", s),
                    ));
                }
            }
        }
    }

    fn finish<T: Clone>(
        &self,
        records: &[T],
        issues: Vec<ValidationIssue>,
        flow_of: impl Fn(&T) -> &FlowRecord,
    ) -> Result<Validated<T>> {
        let mut report = ValidationReport {
            mode: self.mode,
            total_rows: records.len(),
            issues,
            dropped_rows: Vec::new(),
        };

        let offending = report.offending_rows();
        let (dataset, year) = records
            .first()
            .map(|r| {
                let flow = flow_of(r);
                (flow.source_name.clone(), flow.year)
            })
            .unwrap_or_default();

        if offending.is_empty() {
            info!(dataset = %dataset, year, rows = records.len(), "validation passed");
            return Ok(Validated {
                records: records.to_vec(),
                report,
            });
        }

        match self.mode {
            ValidationMode::Strict => Err(FlowsaError::Validation {
                dataset,
                year,
                report: Box::new(report),
            }),
            ValidationMode::Permissive => {
                warn!(
                    dataset = %dataset,
                    year,
                    offending = offending.len(),
                    "rows violate invariants, keeping them flagged"
                );
                Ok(Validated {
                    records: records.to_vec(),
                    report,
                })
            }
            ValidationMode::PermissiveDrop => {
                let kept = records
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| offending.binary_search(i).is_err())
                    .map(|(_, r)| r.clone())
                    .collect();
                warn!(
                    dataset = %dataset,
                    year,
                    dropped = offending.len(),
                    "dropped rows that violate invariants"
                );
                report.dropped_rows = offending;
                Ok(Validated {
                    records: kept,
                    report,
                })
            }
        }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidationMode::default())
    }
}

// ============================================================================
// FLOW-BY-SECTOR CHECKS
// ============================================================================

/// Aggregated rows with a negative summed amount
pub fn check_negative_amounts(flows: &[AggregatedFlow]) -> Vec<ValidationIssue> {
    flows
        .iter()
        .enumerate()
        .filter_map(|(row, f)| {
            let amount = f.flow_amount.value()?;
            (amount < 0.0).then(|| {
                ValidationIssue::warning(
                    row,
                    Rule::NegativeAmount,
                    "FlowAmount",
                    format!("aggregated amount {} is negative", amount),
                )
            })
        })
        .collect()
}

/// Aggregated rows that carry no sector at all
pub fn check_null_sectors(flows: &[AggregatedFlow]) -> Vec<ValidationIssue> {
    flows
        .iter()
        .enumerate()
        .filter(|(_, f)| !f.has_sector())
        .map(|(row, f)| {
            ValidationIssue::warning(
                row,
                Rule::MissingSector,
                "Sector",
                format!(
                    "{} {} has no sector",
                    f.flow_name.as_deref().unwrap_or_default(),
                    f.location.as_deref().unwrap_or_default()
                ),
            )
        })
        .collect()
}
