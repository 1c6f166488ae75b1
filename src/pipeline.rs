// 🏭 Pipeline - adapters → FBA → sectors → FBS, with a table store in front
//
// Each (dataset, year) or (method, year) unit is independent and runs start
// to finish on one thread; `generate_many` fans units out over rayon. The
// store is the only shared state.

use crate::adapter::{AdapterRegistry, SourceAdapter, SourceContext};
use crate::aggregation::{AggregatedFlow, Aggregator, ConservationCheck, UnitBalance};
use crate::config::{list_config_names, MethodConfig, MethodOverrides, Settings, SourceConfig};
use crate::crosswalk::{ApportionmentTable, Crosswalk};
use crate::error::{FlowsaError, Result};
use crate::flow::{fingerprint, non_blank, FlowRecord};
use crate::location::{filter_by_geoscale, GeoScale};
use crate::mapper::{SectorMapper, UnmappedActivity};
use crate::normalize::Normalizer;
use crate::store::{FlowStore, MemoryStore, SqliteStore, StoreKey, TableKind};
use crate::units::UnitTable;
use crate::validation::{check_negative_amounts, check_null_sectors, Rule, Validator};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

// ============================================================================
// RUN SUMMARY
// ============================================================================

/// Non-fatal anomalies of one generated table, logged once at the end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub kind: TableKind,
    pub name: String,
    pub year: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows_in: usize,
    pub rows_out: usize,
    pub withdrawn: usize,
    pub asserted_zero: usize,
    pub issues_by_rule: BTreeMap<Rule, usize>,
    pub dropped_rows: usize,
    pub unmapped: Vec<UnmappedActivity>,
    pub conservation_discrepancies: Vec<UnitBalance>,
    /// Negative or sector-less rows found in the finished FBS
    pub output_warnings: usize,
    pub fingerprint: String,
}

impl RunSummary {
    fn start(kind: TableKind, name: &str, year: i32) -> Self {
        let now = Utc::now();
        RunSummary {
            run_id: Uuid::new_v4(),
            kind,
            name: name.to_string(),
            year,
            started_at: now,
            finished_at: now,
            rows_in: 0,
            rows_out: 0,
            withdrawn: 0,
            asserted_zero: 0,
            issues_by_rule: BTreeMap::new(),
            dropped_rows: 0,
            unmapped: Vec::new(),
            conservation_discrepancies: Vec::new(),
            output_warnings: 0,
            fingerprint: String::new(),
        }
    }

    pub fn has_anomalies(&self) -> bool {
        !self.issues_by_rule.is_empty()
            || self.dropped_rows > 0
            || !self.unmapped.is_empty()
            || !self.conservation_discrepancies.is_empty()
            || self.output_warnings > 0
    }

    pub fn log(&self) {
        info!(
            run_id = %self.run_id,
            kind = self.kind.as_str(),
            name = %self.name,
            year = self.year,
            rows_in = self.rows_in,
            rows_out = self.rows_out,
            withdrawn = self.withdrawn,
            "run complete"
        );

        if !self.has_anomalies() {
            return;
        }

        let issues: Vec<String> = self
            .issues_by_rule
            .iter()
            .map(|(rule, n)| format!("{}={}", rule.as_str(), n))
            .collect();
        let unmapped: Vec<&str> = self.unmapped.iter().map(|u| u.activity.as_str()).collect();
        let unbalanced: Vec<&str> = self
            .conservation_discrepancies
            .iter()
            .map(|u| u.unit.as_str())
            .collect();

        warn!(
            run_id = %self.run_id,
            name = %self.name,
            year = self.year,
            issues = %issues.join(","),
            dropped = self.dropped_rows,
            unmapped = ?unmapped,
            unbalanced_units = ?unbalanced,
            output_warnings = self.output_warnings,
            "run finished with anomalies"
        );
    }
}

#[derive(Debug, Clone)]
pub struct FbaRun {
    pub records: Vec<FlowRecord>,
    pub summary: RunSummary,
}

#[derive(Debug, Clone)]
pub struct FbsRun {
    pub flows: Vec<AggregatedFlow>,
    pub summary: RunSummary,
}

/// Outcome of one unit in a parallel batch
#[derive(Debug)]
pub struct UnitResult {
    pub dataset: String,
    pub year: i32,
    pub result: Result<RunSummary>,
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    settings: Settings,
    adapters: AdapterRegistry,
    store: Box<dyn FlowStore>,
    units: UnitTable,
    source_configs: HashMap<String, SourceConfig>,
    methods: HashMap<String, MethodConfig>,
    crosswalks: HashMap<String, Crosswalk>,
}

impl Pipeline {
    /// Pipeline with the store named in the settings (in-memory if none)
    pub fn new(settings: Settings) -> Result<Self> {
        let store: Box<dyn FlowStore> = match &settings.store_path {
            Some(path) => Box::new(SqliteStore::open(path)?),
            None => Box::new(MemoryStore::new()),
        };
        Ok(Self::with_store(settings, store))
    }

    pub fn with_store(settings: Settings, store: Box<dyn FlowStore>) -> Self {
        Pipeline {
            settings,
            adapters: AdapterRegistry::new(),
            store,
            units: UnitTable::new(),
            source_configs: HashMap::new(),
            methods: HashMap::new(),
            crosswalks: HashMap::new(),
        }
    }

    pub fn register_adapter(&mut self, adapter: Box<dyn SourceAdapter>) {
        self.adapters.register(adapter);
    }

    /// Source config used instead of `<source_config_dir>/<dataset>.json`
    pub fn register_source(&mut self, dataset: &str, config: SourceConfig) {
        self.source_configs.insert(dataset.to_string(), config);
    }

    /// Method config used instead of `<method_dir>/<method>.json`
    pub fn register_method(&mut self, method: &str, config: MethodConfig) {
        self.methods.insert(method.to_string(), config);
    }

    /// Crosswalk used instead of `<crosswalk_dir>/<name>.csv`
    pub fn register_crosswalk(&mut self, name: &str, crosswalk: Crosswalk) {
        self.crosswalks.insert(name.to_string(), crosswalk);
    }

    pub fn with_units(mut self, units: UnitTable) -> Self {
        self.units = units;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &dyn FlowStore {
        self.store.as_ref()
    }

    // ------------------------------------------------------------------------
    // config lookup
    // ------------------------------------------------------------------------

    fn source_config(&self, dataset: &str) -> Result<SourceConfig> {
        if let Some(config) = self.source_configs.get(dataset) {
            return Ok(config.clone());
        }
        let path = self.settings.source_config_path(dataset);
        if !path.exists() {
            return Err(FlowsaError::Config(format!("no source config for {}", dataset)));
        }
        SourceConfig::from_file(path)
    }

    fn method_config(&self, method: &str) -> Result<MethodConfig> {
        if let Some(config) = self.methods.get(method) {
            return Ok(config.clone());
        }
        let path = self.settings.method_path(method);
        if !path.exists() {
            return Err(FlowsaError::Config(format!("no method config for {}", method)));
        }
        MethodConfig::from_file(path)
    }

    fn crosswalk(&self, name: &str) -> Result<Crosswalk> {
        if let Some(crosswalk) = self.crosswalks.get(name) {
            return Ok(crosswalk.clone());
        }
        let path = self.settings.crosswalk_path(name);
        if !path.exists() {
            return Err(FlowsaError::Config(format!("no crosswalk named {}", name)));
        }
        Crosswalk::from_csv(path)
    }

    /// Datasets with a registered or on-disk source config
    pub fn available_sources(&self) -> Result<Vec<String>> {
        let mut names = list_config_names(&self.settings.source_config_dir, "json")?;
        names.extend(self.source_configs.keys().cloned());
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Methods with a registered or on-disk method config
    pub fn available_methods(&self) -> Result<Vec<String>> {
        let mut names = list_config_names(&self.settings.method_dir, "json")?;
        names.extend(self.methods.keys().cloned());
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn key(&self, name: &str, year: i32) -> StoreKey {
        StoreKey::new(name, year, &self.settings.format_version)
    }

    // ------------------------------------------------------------------------
    // Flow-By-Activity
    // ------------------------------------------------------------------------

    /// Fetch, normalize, validate and store one dataset-year
    pub fn generate_flow_by_activity(&self, dataset: &str, year: i32) -> Result<FbaRun> {
        let config = self.source_config(dataset)?;
        if !config.years.is_empty() && !config.years.contains(&year) {
            return Err(FlowsaError::unavailable(
                dataset,
                year,
                format!("source publishes {:?}", config.years),
            ));
        }

        let mut summary = RunSummary::start(TableKind::FlowByActivity, dataset, year);

        let context = SourceContext::new(dataset, year);
        let table = self.adapters.fetch(config.adapter_id(dataset), &context)?;

        let normalized = Normalizer::new(&config)?.normalize(&table)?;
        summary.rows_in = normalized.report.rows_in;
        summary.withdrawn = normalized.report.withdrawn;
        summary.asserted_zero = normalized.report.asserted_zero;

        let validated = Validator::new(config.validation_mode)
            .allow_negative(config.allow_negative)
            .with_units(self.units.clone())
            .validate(&normalized.records)?;
        summary.issues_by_rule = validated.report.count_by_rule();
        summary.dropped_rows = validated.report.dropped_rows.len();

        let meta = self
            .store
            .save_fba(&self.key(dataset, year), &validated.records, summary.run_id)?;
        summary.rows_out = meta.row_count;
        summary.fingerprint = meta.fingerprint;
        summary.finished_at = Utc::now();
        summary.log();

        Ok(FbaRun {
            records: validated.records,
            summary,
        })
    }

    /// Stored Flow-By-Activity table, generated on a miss.
    ///
    /// Filters apply after loading, so the stored table stays complete.
    /// An empty `classes` slice keeps every class.
    pub fn get_flow_by_activity(
        &self,
        dataset: &str,
        year: i32,
        classes: &[&str],
        geo_filter: Option<GeoScale>,
    ) -> Result<Vec<FlowRecord>> {
        let records = match self.store.load_fba(&self.key(dataset, year))? {
            Some(records) => {
                debug!(dataset, year, rows = records.len(), "loaded FBA from store");
                records
            }
            None => self.generate_flow_by_activity(dataset, year)?.records,
        };

        if records.is_empty() {
            return Err(FlowsaError::unavailable(dataset, year, "table has no rows"));
        }

        let mut records = if classes.is_empty() {
            records
        } else {
            records
                .into_iter()
                .filter(|r| classes.contains(&r.class.as_str()))
                .collect()
        };
        if let Some(scale) = geo_filter {
            records = filter_by_geoscale(records, scale);
        }
        Ok(records)
    }

    /// Run `generate_flow_by_activity` for many units in parallel.
    ///
    /// One failing unit does not stop the others; results keep input order.
    pub fn generate_many(&self, units: &[(String, i32)]) -> Vec<UnitResult> {
        units
            .par_iter()
            .map(|(dataset, year)| UnitResult {
                dataset: dataset.clone(),
                year: *year,
                result: self
                    .generate_flow_by_activity(dataset, *year)
                    .map(|run| run.summary),
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Flow-By-Sector
    // ------------------------------------------------------------------------

    /// Stored Flow-By-Sector table for a method, generated on a miss.
    ///
    /// Overridden runs are stored under their own name so they never
    /// replace the method's own table.
    pub fn get_flow_by_sector(&self, method: &str, overrides: &MethodOverrides) -> Result<Vec<AggregatedFlow>> {
        let mut config = self.method_config(method)?;
        config.apply(overrides);

        let name = if overrides.is_empty() {
            method.to_string()
        } else {
            let tag = fingerprint(std::slice::from_ref(overrides))?;
            format!("{}__{}", method, &tag[..12])
        };

        if let Some(flows) = self.store.load_fbs(&self.key(&name, config.year))? {
            debug!(method, year = config.year, rows = flows.len(), "loaded FBS from store");
            return Ok(flows);
        }

        Ok(self.generate_flow_by_sector(&name, &config)?.flows)
    }

    /// Flow-By-Sector with one Sector column in place of the
    /// producing/consuming pair
    pub fn collapse_flow_by_sector(&self, method: &str) -> Result<Vec<AggregatedFlow>> {
        let overrides = MethodOverrides {
            collapse: Some(true),
            ..Default::default()
        };
        let flows = self.get_flow_by_sector(method, &overrides)?;

        let null_sectors = check_null_sectors(&flows);
        if !null_sectors.is_empty() {
            warn!(method, rows = null_sectors.len(), "collapsed FBS has rows without a sector");
        }
        let negative = check_negative_amounts(&flows);
        if !negative.is_empty() {
            warn!(method, rows = negative.len(), "collapsed FBS has negative amounts");
        }

        Ok(flows)
    }

    /// Build and store a Flow-By-Sector table from a method config
    pub fn generate_flow_by_sector(&self, name: &str, config: &MethodConfig) -> Result<FbsRun> {
        let mut summary = RunSummary::start(TableKind::FlowBySector, name, config.year);

        let classes: Vec<&str> = config.class_filter.iter().map(String::as_str).collect();
        let mut fba = self.get_flow_by_activity(&config.source, config.year, &classes, config.geo_filter)?;
        summary.rows_in = fba.len();
        summary.withdrawn = fba.iter().filter(|r| r.flow_amount.is_withdrawn()).count();

        if config.standardize_units {
            fba = self.units.standardize_all(&fba);
        }

        let mut crosswalk = self.crosswalk(config.crosswalk_name())?;
        if let Some(target) = &config.target_sector_source {
            crosswalk = crosswalk.for_sector_source(target);
        }
        let activities: HashSet<String> = fba
            .iter()
            .flat_map(|r| [non_blank(&r.activity_produced_by), non_blank(&r.activity_consumed_by)])
            .flatten()
            .map(str::to_string)
            .collect();
        let crosswalk = crosswalk.retain_activities(&activities);

        let mut mapper = SectorMapper::new(crosswalk.clone()).with_activity_source(config.activity_source());
        if config.is_apportioned() {
            let table = match &config.apportionment {
                Some(aux) => {
                    let aux_year = aux.year.unwrap_or(config.year);
                    let aux_fba = self.get_flow_by_activity(&aux.fba_source, aux_year, &[], None)?;
                    ApportionmentTable::from_flow_ratios(
                        &crosswalk,
                        &aux_fba,
                        aux.flow_ratio_source.as_deref(),
                    )?
                }
                None => ApportionmentTable::from_crosswalk(&crosswalk),
            };
            mapper = mapper.with_apportionment(table);
        }

        let outcome = mapper.map_to_sectors(&fba)?;
        summary.unmapped = outcome.unmapped.clone();

        if config.is_apportioned() {
            let mapped_balance = ConservationCheck::new().check(&fba, &outcome.flows);
            summary
                .conservation_discrepancies
                .extend(mapped_balance.discrepancies().into_iter().cloned());
        }

        let validated = Validator::new(config.validation_mode)
            .allow_negative(config.allow_negative)
            .require_sectors(config.require_sectors)
            .with_units(self.units.clone())
            .validate_mapped(&outcome.flows)?;
        summary.issues_by_rule = validated.report.count_by_rule();
        summary.dropped_rows = validated.report.dropped_rows.len();

        let flows = Aggregator::new(&config.group_keys)
            .collapse(config.collapse)
            .rollup_to(config.geo_rollup_target)
            .aggregate(&validated.records)?;

        let balance = ConservationCheck::new().check(&validated.records, &flows);
        summary
            .conservation_discrepancies
            .extend(balance.discrepancies().into_iter().cloned());

        summary.output_warnings = check_negative_amounts(&flows).len() + check_null_sectors(&flows).len();

        let meta = self
            .store
            .save_fbs(&self.key(name, config.year), &flows, summary.run_id)?;
        summary.rows_out = meta.row_count;
        summary.fingerprint = meta.fingerprint;
        summary.finished_at = Utc::now();
        summary.log();

        Ok(FbsRun { flows, summary })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{CsvFileAdapter, RawTableBuilder, StaticTableAdapter};
    use crate::aggregation::GroupKey;
    use crate::config::ApportionmentConfig;
    use crate::crosswalk::SectorMapping;
    use crate::flow::FlowAmount;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn source_config() -> SourceConfig {
        let mut config = SourceConfig::default();
        for (from, to) in [("Activity", "ActivityProducedBy"), ("Amount", "FlowAmount"), ("FIPS", "Location")] {
            config.column_mapping.insert(from.to_string(), to.to_string());
        }
        config.static_fields.insert("Class".to_string(), json!("Chemicals"));
        config.static_fields.insert("FlowName".to_string(), json!("Zinc"));
        config.static_fields.insert("Unit".to_string(), json!("kg"));
        config
    }

    fn raw_table(rows: &[(&str, &str, &str)]) -> crate::adapter::RawTable {
        let mut builder = RawTableBuilder::new(SourceContext::new("Test", 2015), &["Activity", "Amount", "FIPS"]);
        for (activity, amount, fips) in rows {
            builder.push_row(vec![("Activity", *activity), ("Amount", *amount), ("FIPS", *fips)]);
        }
        builder.build()
    }

    fn pipeline(rows: &[(&str, &str, &str)]) -> Pipeline {
        let mut settings = Settings::from_root("/nonexistent/flowsa");
        settings.store_path = None;
        let mut pipeline = Pipeline::new(settings).unwrap();

        pipeline.register_adapter(Box::new(StaticTableAdapter::new("Test").with_table(raw_table(rows))));
        pipeline.register_source("Test", source_config());
        pipeline.register_crosswalk(
            "Test",
            Crosswalk::from_entries(vec![
                SectorMapping::new("Test", "A", "111", "NAICS_2012_Code"),
                SectorMapping::new("Test", "B", "112", "NAICS_2012_Code").with_weight(0.6),
                SectorMapping::new("Test", "B", "113", "NAICS_2012_Code").with_weight(0.4),
            ]),
        );
        let mut method = MethodConfig::new("Test", 2015);
        method.apportion = true;
        pipeline.register_method("Test_national_2015", method);
        pipeline
    }

    #[test]
    fn test_flow_by_sector_end_to_end() {
        let pipeline = pipeline(&[("A", "100", "0"), ("B", "50", "0")]);

        let fbs = pipeline
            .get_flow_by_sector("Test_national_2015", &MethodOverrides::default())
            .unwrap();

        let got: Vec<(Option<&str>, f64)> = fbs
            .iter()
            .map(|f| (f.sector_produced_by.as_deref(), f.flow_amount.value().unwrap_or(0.0)))
            .collect();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0], (Some("111"), 100.0));
        assert!((got[1].1 - 30.0).abs() < 1e-9);
        assert!((got[2].1 - 20.0).abs() < 1e-9);
        let total: f64 = got.iter().map(|(_, v)| v).sum();
        assert!((total - 150.0).abs() < 1e-9);

        println!("✅ FBS end-to-end PASSED");
    }

    #[test]
    fn test_tables_are_cached_in_store() {
        let pipeline = pipeline(&[("A", "100", "0")]);

        pipeline.get_flow_by_sector("Test_national_2015", &MethodOverrides::default()).unwrap();
        pipeline.get_flow_by_sector("Test_national_2015", &MethodOverrides::default()).unwrap();

        let tables = pipeline.store().list_tables().unwrap();
        assert_eq!(tables.len(), 2);
        assert!(tables.iter().any(|t| t.kind == TableKind::FlowByActivity && t.key.name == "Test"));
        assert!(tables
            .iter()
            .any(|t| t.kind == TableKind::FlowBySector && t.key.name == "Test_national_2015"));
    }

    #[test]
    fn test_fba_filters_and_withdrawn() {
        let pipeline = pipeline(&[("A", "100", "0"), ("A", "W", "6"), ("B", "5", "6037")]);

        let all = pipeline.get_flow_by_activity("Test", 2015, &[], None).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[1].flow_amount.is_withdrawn());
        assert_eq!(all[2].location, "06037");

        let states = pipeline
            .get_flow_by_activity("Test", 2015, &[], Some(GeoScale::State))
            .unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].location, "06000");

        let none = pipeline.get_flow_by_activity("Test", 2015, &["Water"], None).unwrap();
        assert!(none.is_empty());

        let either = pipeline
            .get_flow_by_activity("Test", 2015, &["Water", "Chemicals"], None)
            .unwrap();
        assert_eq!(either.len(), 3);
    }

    #[test]
    fn test_strict_fba_validation_aborts_unit() {
        let pipeline = pipeline(&[("A", "-3", "0")]);
        let err = pipeline.generate_flow_by_activity("Test", 2015).unwrap_err();
        assert!(matches!(err, FlowsaError::Validation { .. }));
        assert!(pipeline.store().list_tables().unwrap().is_empty());
    }

    #[test]
    fn test_collapse_and_overrides_use_separate_tables() {
        let pipeline = pipeline(&[("A", "100", "0"), ("B", "50", "0")]);

        let collapsed = pipeline.collapse_flow_by_sector("Test_national_2015").unwrap();
        assert!(collapsed.iter().all(|f| f.collapsed));
        assert_eq!(collapsed[0].sector.as_deref(), Some("111"));
        assert_eq!(collapsed[0].sector_produced_by, None);

        let plain = pipeline
            .get_flow_by_sector("Test_national_2015", &MethodOverrides::default())
            .unwrap();
        assert!(plain.iter().all(|f| !f.collapsed));

        let fbs_tables = pipeline
            .store()
            .list_tables()
            .unwrap()
            .into_iter()
            .filter(|t| t.kind == TableKind::FlowBySector)
            .count();
        assert_eq!(fbs_tables, 2);
    }

    #[test]
    fn test_unmapped_activity_survives_to_fbs() {
        let pipeline = pipeline(&[("A", "100", "0"), ("Mystery", "9", "0")]);
        let fbs = pipeline
            .get_flow_by_sector("Test_national_2015", &MethodOverrides::default())
            .unwrap();

        let orphan = fbs.iter().find(|f| !f.has_sector()).unwrap();
        assert_eq!(orphan.flow_amount, FlowAmount::Value(9.0));
    }

    #[test]
    fn test_geo_rollup_override() {
        let pipeline = pipeline(&[("A", "10", "6037"), ("A", "20", "6001"), ("A", "30", "6075")]);
        let overrides = MethodOverrides {
            geo_rollup_target: Some(GeoScale::State),
            ..Default::default()
        };

        let fbs = pipeline.get_flow_by_sector("Test_national_2015", &overrides).unwrap();
        assert_eq!(fbs.len(), 1);
        assert_eq!(fbs[0].location.as_deref(), Some("06000"));
        assert_eq!(fbs[0].flow_amount, FlowAmount::Value(60.0));
    }

    #[test]
    fn test_rollup_needs_one_reported_scale() {
        let mut pipeline = pipeline(&[("A", "60", "6"), ("A", "10", "6037"), ("A", "20", "6001"), ("A", "30", "6075")]);
        let overrides = MethodOverrides {
            geo_rollup_target: Some(GeoScale::State),
            ..Default::default()
        };

        // state total and its counties together would double count
        let err = pipeline.get_flow_by_sector("Test_national_2015", &overrides).unwrap_err();
        assert!(matches!(err, FlowsaError::CrosswalkConfiguration { .. }));

        let mut method = MethodConfig::new("Test", 2015);
        method.geo_filter = Some(GeoScale::County);
        pipeline.register_method("Test_county_2015", method);

        let fbs = pipeline.get_flow_by_sector("Test_county_2015", &overrides).unwrap();
        assert_eq!(fbs.len(), 1);
        assert_eq!(fbs[0].location.as_deref(), Some("06000"));
        assert_eq!(fbs[0].flow_amount, FlowAmount::Value(60.0));
    }

    #[test]
    fn test_apportionment_from_auxiliary_dataset() {
        let mut pipeline = pipeline(&[("B", "50", "0")]);

        let mut aux_config = SourceConfig::default();
        aux_config.column_mapping.insert("Industry".to_string(), "ActivityProducedBy".to_string());
        aux_config.column_mapping.insert("Output".to_string(), "FlowAmount".to_string());
        aux_config.static_fields.insert("Location".to_string(), json!("00000"));
        aux_config.static_fields.insert("Class".to_string(), json!("Money"));
        aux_config.static_fields.insert("Unit".to_string(), json!("USD"));

        let mut builder = RawTableBuilder::new(SourceContext::new("BEA_Make", 2015), &["Industry", "Output"]);
        builder.push_row(vec![("Industry", "112"), ("Output", "1")]);
        builder.push_row(vec![("Industry", "113"), ("Output", "4")]);
        pipeline.register_adapter(Box::new(StaticTableAdapter::new("BEA_Make").with_table(builder.build())));
        pipeline.register_source("BEA_Make", aux_config);

        let mut method = MethodConfig::new("Test", 2015);
        method.apportionment = Some(ApportionmentConfig {
            fba_source: "BEA_Make".to_string(),
            year: None,
            flow_ratio_source: None,
        });
        method.group_keys = vec![GroupKey::SectorProducedBy];
        pipeline.register_method("Test_ratio", method);

        let fbs = pipeline.get_flow_by_sector("Test_ratio", &MethodOverrides::default()).unwrap();
        assert_eq!(fbs.len(), 2);
        assert!((fbs[0].flow_amount.value().unwrap() - 10.0).abs() < 1e-9);
        assert!((fbs[1].flow_amount.value().unwrap() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_generate_many_isolates_failures() {
        let pipeline = pipeline(&[("A", "1", "0")]);
        let units = vec![("Test".to_string(), 2015), ("Missing".to_string(), 2015)];

        let results = pipeline.generate_many(&units);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].dataset, "Test");
        assert!(results[0].result.is_ok());
        assert!(results[1].result.is_err());
    }

    #[test]
    fn test_missing_adapter_is_source_unavailable() {
        let mut pipeline = pipeline(&[("A", "1", "0")]);
        pipeline.register_source("Orphan", source_config());

        let err = pipeline.get_flow_by_activity("Orphan", 2015, &[], None).unwrap_err();
        assert!(matches!(err, FlowsaError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_file_based_configuration() {
        let root = tempdir().unwrap();
        let settings = Settings::from_root(root.path());
        for dir in [&settings.data_dir, &settings.source_config_dir, &settings.method_dir, &settings.crosswalk_dir] {
            fs::create_dir_all(dir).unwrap();
        }

        fs::write(
            settings.data_dir.join("USGS_NWIS_WU_2015.csv"),
            "State,Category,Mgal\n6,Irrigation,\"1,200\"\n6,Public Supply,300\n41,Irrigation,--\n",
        )
        .unwrap();
        fs::write(
            settings.source_config_path("USGS_NWIS_WU"),
            json!({
                "column_mapping": {"State": "Location", "Category": "ActivityConsumedBy", "Mgal": "FlowAmount"},
                "static_fields": {"Class": "Water", "FlowName": "fresh", "Unit": "Mgal", "Compartment": "ground"},
                "flow_type_keywords": {"technosphere": ["Public Supply"]},
                "years": [2010, 2015]
            })
            .to_string(),
        )
        .unwrap();
        fs::write(
            settings.crosswalk_path("USGS_NWIS_WU"),
            "ActivitySourceName,Activity,Sector,SectorType,SectorSourceName\n\
             USGS_NWIS_WU,Irrigation,111,I,NAICS_2012_Code\n\
             USGS_NWIS_WU,Public Supply,221310,I,NAICS_2012_Code\n",
        )
        .unwrap();
        fs::write(
            settings.method_path("Water_state_2015"),
            json!({"source": "USGS_NWIS_WU", "year": 2015, "group_keys": ["SectorConsumedBy", "Location", "FlowType"]})
                .to_string(),
        )
        .unwrap();

        let mut pipeline = Pipeline::new(settings.clone()).unwrap();
        let template = settings.data_dir.join("USGS_NWIS_WU_{year}.csv");
        pipeline.register_adapter(Box::new(CsvFileAdapter::new(
            "USGS_NWIS_WU",
            template.to_string_lossy().to_string(),
        )));

        assert_eq!(pipeline.available_sources().unwrap(), vec!["USGS_NWIS_WU".to_string()]);
        assert_eq!(pipeline.available_methods().unwrap(), vec!["Water_state_2015".to_string()]);

        let fbs = pipeline
            .get_flow_by_sector("Water_state_2015", &MethodOverrides::default())
            .unwrap();
        assert_eq!(fbs.len(), 3);
        assert_eq!(fbs[0].sector_consumed_by.as_deref(), Some("111"));
        assert_eq!(fbs[0].location.as_deref(), Some("06000"));
        assert_eq!(fbs[0].flow_amount, FlowAmount::Value(1200.0));
        assert_eq!(fbs[1].flow_type, Some(crate::flow::FlowType::TechnosphereFlow));
        // Oregon's withheld value stays withheld
        assert_eq!(fbs[2].location.as_deref(), Some("41000"));
        assert!(fbs[2].flow_amount.is_withdrawn());

        // a year the source does not publish
        let err = pipeline.generate_flow_by_activity("USGS_NWIS_WU", 2012).unwrap_err();
        assert!(matches!(err, FlowsaError::SourceUnavailable { .. }));

        // the sqlite store under the root now holds both tables
        assert!(settings.store_path.as_ref().unwrap().exists());
        assert_eq!(pipeline.store().list_tables().unwrap().len(), 2);
    }
}
