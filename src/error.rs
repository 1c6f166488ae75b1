// 🚨 Error taxonomy for the FBA/FBS pipeline
// Fatal errors always name the dataset, the year and how many rows were involved.

use crate::validation::ValidationReport;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowsaError {
    /// Adapter produced nothing, or the store has no table for the key
    #[error("source {dataset} unavailable for {year}: {reason}")]
    SourceUnavailable {
        dataset: String,
        year: i32,
        reason: String,
    },

    /// A required canonical field could not be populated
    #[error("schema mapping failed for {dataset} {year} ({rows} rows): {reason}")]
    SchemaMapping {
        dataset: String,
        year: i32,
        rows: usize,
        reason: String,
    },

    #[error(
        "validation failed for {dataset} {year}: {} of {} rows violate invariants",
        .report.offending_rows().len(),
        .report.total_rows
    )]
    Validation {
        dataset: String,
        year: i32,
        report: Box<ValidationReport>,
    },

    /// Bad apportionment weights or roll-up across mismatched units/systems
    #[error("crosswalk configuration error for {dataset} {year} ({rows} rows): {reason}")]
    CrosswalkConfiguration {
        dataset: String,
        year: i32,
        rows: usize,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    /// Stored table unreadable or store lock poisoned
    #[error("Store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl FlowsaError {
    /// Fatal errors abort the current (dataset, year) unit; everything else is plumbing
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            FlowsaError::SourceUnavailable { .. }
                | FlowsaError::SchemaMapping { .. }
                | FlowsaError::Validation { .. }
                | FlowsaError::CrosswalkConfiguration { .. }
        )
    }

    pub(crate) fn crosswalk(
        dataset: &str,
        year: i32,
        rows: usize,
        reason: impl Into<String>,
    ) -> Self {
        FlowsaError::CrosswalkConfiguration {
            dataset: dataset.to_string(),
            year,
            rows,
            reason: reason.into(),
        }
    }

    pub(crate) fn schema(dataset: &str, year: i32, rows: usize, reason: impl Into<String>) -> Self {
        FlowsaError::SchemaMapping {
            dataset: dataset.to_string(),
            year,
            rows,
            reason: reason.into(),
        }
    }

    pub(crate) fn unavailable(dataset: &str, year: i32, reason: impl Into<String>) -> Self {
        FlowsaError::SourceUnavailable {
            dataset: dataset.to_string(),
            year,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowsaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_dataset_year_and_rows() {
        let err = FlowsaError::schema("USGS_MYB_Zinc", 2016, 12, "no Location column");
        let msg = err.to_string();

        assert!(msg.contains("USGS_MYB_Zinc"));
        assert!(msg.contains("2016"));
        assert!(msg.contains("12 rows"));
        assert!(err.is_data_error());
    }

    #[test]
    fn test_plumbing_errors_are_not_data_errors() {
        let err = FlowsaError::Config("missing method dir".to_string());
        assert!(!err.is_data_error());
    }
}
