// 🏗️ Source Adapters - one plugin per government dataset
//
// An adapter turns a (dataset, year) pair into a raw table of string cells
// in whatever layout the source uses. Everything source-specific (URLs,
// spreadsheet offsets, zip handling) lives behind this trait; the core only
// sees RawTable.

use crate::error::{FlowsaError, Result};
use anyhow::Context as AnyhowContext;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::PathBuf;
use tracing::{debug, info};

// ============================================================================
// CORE TYPES
// ============================================================================

/// Which dataset and vintage a table belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceContext {
    pub dataset_id: String,
    pub year: i32,
}

impl SourceContext {
    pub fn new(dataset_id: &str, year: i32) -> Self {
        SourceContext {
            dataset_id: dataset_id.to_string(),
            year,
        }
    }
}

/// One row of source data. Missing cells are simply absent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawRow {
    pub cells: BTreeMap<String, String>,

    /// Position in the original file (1-indexed, header excluded), for reports
    pub line_number: usize,
}

impl RawRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.cells.get(column).map(String::as_str)
    }
}

/// A source table: ordered column names plus rows
#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    pub context: SourceContext,
    pub columns: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl RawTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Reshape wide to long.
    ///
    /// Every row produces one output row per `value_vars` column, carrying the
    /// `id_vars` cells, the value column name under `var_name` and its cell
    /// under `value_name`. Typical use: year columns "Y2016", "Y2017", ...
    pub fn melt(
        &self,
        id_vars: &[&str],
        value_vars: &[&str],
        var_name: &str,
        value_name: &str,
    ) -> RawTable {
        let mut columns: Vec<&str> = id_vars.to_vec();
        columns.push(var_name);
        columns.push(value_name);

        let mut builder = RawTableBuilder::new(self.context.clone(), &columns);
        for row in &self.rows {
            for value_var in value_vars {
                let mut cells: Vec<(String, String)> = id_vars
                    .iter()
                    .filter_map(|id| row.get(id).map(|v| (id.to_string(), v.to_string())))
                    .collect();
                cells.push((var_name.to_string(), value_var.to_string()));
                if let Some(v) = row.get(value_var) {
                    cells.push((value_name.to_string(), v.to_string()));
                }
                builder.push_row_at(row.line_number, cells);
            }
        }
        builder.build()
    }

    /// Join several columns into one, skipping blanks and repeated values.
    ///
    /// E.g. sector / subsector / category columns → "Energy - Transportation - Fuel".
    pub fn concat_columns(&self, sources: &[&str], separator: &str, target: &str) -> RawTable {
        let mut table = self.clone();
        if !table.has_column(target) {
            table.columns.push(target.to_string());
        }

        for row in &mut table.rows {
            let mut parts: Vec<&str> = Vec::new();
            for column in sources {
                if let Some(v) = row.cells.get(*column).map(|s| s.trim()) {
                    if !v.is_empty() && !parts.contains(&v) {
                        parts.push(v);
                    }
                }
            }
            let joined = parts.join(separator);
            row.cells.insert(target.to_string(), joined);
        }
        table
    }
}

// ============================================================================
// TABLE BUILDER
// ============================================================================

/// Collect rows first, build the table once
pub struct RawTableBuilder {
    context: SourceContext,
    columns: Vec<String>,
    rows: Vec<RawRow>,
}

impl RawTableBuilder {
    pub fn new(context: SourceContext, columns: &[&str]) -> Self {
        RawTableBuilder {
            context,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Add a row; line numbers follow insertion order
    pub fn push_row<I, K, V>(&mut self, cells: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let line = self.rows.len() + 1;
        self.push_row_at(line, cells)
    }

    pub fn push_row_at<I, K, V>(&mut self, line_number: usize, cells: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut row = RawRow {
            cells: BTreeMap::new(),
            line_number,
        };
        for (k, v) in cells {
            let k = k.into();
            if !self.columns.contains(&k) {
                self.columns.push(k.clone());
            }
            row.cells.insert(k, v.into());
        }
        self.rows.push(row);
        self
    }

    pub fn build(self) -> RawTable {
        RawTable {
            context: self.context,
            columns: self.columns,
            rows: self.rows,
        }
    }
}

// ============================================================================
// ADAPTER TRAIT
// ============================================================================

/// SourceAdapter - the only capability a dataset plugin must provide
///
/// Adapters are black boxes: they report failures with `anyhow` and the core
/// turns those into `SourceUnavailable`. Retries and timeouts are the
/// adapter's own business.
pub trait SourceAdapter: Send + Sync {
    /// Dataset identifier this adapter is registered under
    fn dataset_id(&self) -> &str;

    /// Produce the raw table for one year
    fn fetch(&self, context: &SourceContext) -> anyhow::Result<RawTable>;

    /// Adapter version (provenance)
    fn version(&self) -> &str {
        "1.0.0"
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Adapters keyed by dataset identifier
pub struct AdapterRegistry {
    adapters: HashMap<String, Box<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        AdapterRegistry {
            adapters: HashMap::new(),
        }
    }

    /// Register an adapter under its own dataset id (replaces any previous one)
    pub fn register(&mut self, adapter: Box<dyn SourceAdapter>) {
        let id = adapter.dataset_id().to_string();
        debug!(dataset = %id, version = adapter.version(), "registered source adapter");
        self.adapters.insert(id, adapter);
    }

    pub fn get(&self, dataset_id: &str) -> Option<&dyn SourceAdapter> {
        self.adapters.get(dataset_id).map(|a| a.as_ref())
    }

    /// Sorted list of registered dataset ids
    pub fn list_sources(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Run the adapter registered as `adapter_id` for a context.
    ///
    /// Unknown adapters, adapter failures and empty tables all surface as
    /// `SourceUnavailable`.
    pub fn fetch(&self, adapter_id: &str, context: &SourceContext) -> Result<RawTable> {
        let adapter = self.get(adapter_id).ok_or_else(|| {
            FlowsaError::unavailable(
                &context.dataset_id,
                context.year,
                format!("no adapter registered as {}", adapter_id),
            )
        })?;

        let table = adapter.fetch(context).map_err(|e| {
            FlowsaError::unavailable(&context.dataset_id, context.year, format!("{:#}", e))
        })?;

        if table.is_empty() {
            return Err(FlowsaError::unavailable(
                &context.dataset_id,
                context.year,
                "adapter produced zero rows",
            ));
        }

        info!(
            dataset = %context.dataset_id,
            year = context.year,
            rows = table.len(),
            "fetched source table"
        );
        Ok(table)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// BUILT-IN ADAPTERS
// ============================================================================

/// Reads a local CSV file; `{year}` in the path is replaced by the data year
pub struct CsvFileAdapter {
    dataset_id: String,
    path_template: String,
}

impl CsvFileAdapter {
    pub fn new(dataset_id: &str, path_template: impl Into<String>) -> Self {
        CsvFileAdapter {
            dataset_id: dataset_id.to_string(),
            path_template: path_template.into(),
        }
    }

    pub fn path_for(&self, year: i32) -> PathBuf {
        PathBuf::from(self.path_template.replace("{year}", &year.to_string()))
    }
}

impl SourceAdapter for CsvFileAdapter {
    fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    fn fetch(&self, context: &SourceContext) -> anyhow::Result<RawTable> {
        let path = self.path_for(context.year);
        let file = File::open(&path)
            .with_context(|| format!("Failed to open file: {}", path.display()))?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(file);

        let headers: Vec<String> = reader
            .headers()
            .with_context(|| format!("Failed to read CSV header in {}", path.display()))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        let header_refs: Vec<&str> = headers.iter().map(String::as_str).collect();

        let mut builder = RawTableBuilder::new(context.clone(), &header_refs);
        for (line_num, result) in reader.records().enumerate() {
            let record = result.with_context(|| {
                format!("Failed to parse CSV line {} in {}", line_num + 2, path.display())
            })?;

            let cells = headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.clone(), v.to_string()));
            builder.push_row_at(line_num + 1, cells);
        }

        Ok(builder.build())
    }
}

/// Serves tables held in memory, one per year
pub struct StaticTableAdapter {
    dataset_id: String,
    tables: HashMap<i32, RawTable>,
}

impl StaticTableAdapter {
    pub fn new(dataset_id: &str) -> Self {
        StaticTableAdapter {
            dataset_id: dataset_id.to_string(),
            tables: HashMap::new(),
        }
    }

    /// Builder: serve `table` for its context year
    pub fn with_table(mut self, table: RawTable) -> Self {
        self.tables.insert(table.context.year, table);
        self
    }
}

impl SourceAdapter for StaticTableAdapter {
    fn dataset_id(&self) -> &str {
        &self.dataset_id
    }

    fn fetch(&self, context: &SourceContext) -> anyhow::Result<RawTable> {
        match self.tables.get(&context.year) {
            Some(table) => Ok(RawTable {
                context: context.clone(),
                ..table.clone()
            }),
            None => Ok(RawTableBuilder::new(context.clone(), &[]).build()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ghg_table() -> RawTable {
        let mut builder = RawTableBuilder::new(
            SourceContext::new("EPA_StateGHGI", 2017),
            &["STATE", "ECON_SECTOR", "SUBSECTOR", "GHG", "Y2016", "Y2017"],
        );
        builder
            .push_row(vec![
                ("STATE", "ME"),
                ("ECON_SECTOR", "Transportation"),
                ("SUBSECTOR", "Transportation"),
                ("GHG", "CO2"),
                ("Y2016", "1.5"),
                ("Y2017", "1.7"),
            ])
            .push_row(vec![
                ("STATE", "VT"),
                ("ECON_SECTOR", "Agriculture"),
                ("SUBSECTOR", "Enteric"),
                ("GHG", "CH4"),
                ("Y2016", "0.4"),
                ("Y2017", "0.5"),
            ]);
        builder.build()
    }

    #[test]
    fn test_builder_tracks_columns_and_lines() {
        let table = ghg_table();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[1].line_number, 2);
        assert_eq!(table.rows[0].get("GHG"), Some("CO2"));
        assert!(table.has_column("Y2017"));
    }

    #[test]
    fn test_melt_year_columns() {
        let long = ghg_table().melt(&["STATE", "GHG"], &["Y2017"], "Year", "FlowAmount");

        assert_eq!(long.len(), 2);
        assert_eq!(long.columns, vec!["STATE", "GHG", "Year", "FlowAmount"]);
        assert_eq!(long.rows[0].get("Year"), Some("Y2017"));
        assert_eq!(long.rows[0].get("FlowAmount"), Some("1.7"));
        assert_eq!(long.rows[1].get("STATE"), Some("VT"));
    }

    #[test]
    fn test_concat_columns_skips_repeats() {
        let table = ghg_table().concat_columns(&["ECON_SECTOR", "SUBSECTOR"], " - ", "Activity");

        assert_eq!(table.rows[0].get("Activity"), Some("Transportation"));
        assert_eq!(table.rows[1].get("Activity"), Some("Agriculture - Enteric"));
    }

    #[test]
    fn test_registry_reports_missing_adapter() {
        let registry = AdapterRegistry::new();
        let err = registry
            .fetch("nope", &SourceContext::new("nope", 2015))
            .unwrap_err();
        assert!(matches!(err, FlowsaError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_registry_rejects_empty_table() {
        let mut registry = AdapterRegistry::new();
        registry.register(Box::new(StaticTableAdapter::new("BEA_Make")));

        let err = registry
            .fetch("BEA_Make", &SourceContext::new("BEA_Make", 2002))
            .unwrap_err();
        assert!(err.to_string().contains("zero rows"));
    }

    #[test]
    fn test_static_adapter_serves_year() {
        let mut registry = AdapterRegistry::new();
        registry.register(Box::new(StaticTableAdapter::new("EPA_StateGHGI").with_table(ghg_table())));

        let table = registry
            .fetch("EPA_StateGHGI", &SourceContext::new("EPA_StateGHGI", 2017))
            .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(registry.list_sources(), vec!["EPA_StateGHGI"]);
    }

    #[test]
    fn test_csv_file_adapter_reads_year_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BEA_Make_2002.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "Industry,IndustryDescription,ProVal").unwrap();
        writeln!(file, "1111A0,Oilseed farming,12.5").unwrap();
        writeln!(file, "1111B0,Grain farming,40").unwrap();

        let template = dir.path().join("BEA_Make_{year}.csv");
        let adapter = CsvFileAdapter::new("BEA_Make", template.to_string_lossy().to_string());

        let table = adapter.fetch(&SourceContext::new("BEA_Make", 2002)).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.rows[1].get("ProVal"), Some("40"));
        assert_eq!(table.rows[0].line_number, 1);

        let missing = adapter.fetch(&SourceContext::new("BEA_Make", 2003));
        assert!(missing.is_err());
    }
}
