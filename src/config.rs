// ⚙️ Configuration - run settings, per-source and per-method configs
//
// Settings come from TOML and are passed down explicitly. Source and method
// configs are JSON files, one per dataset / method, named after it.

use crate::aggregation::{GroupKey, DEFAULT_GROUP_KEYS};
use crate::error::{FlowsaError, Result};
use crate::location::GeoScale;
use crate::normalize::FlowTypeKeywords;
use crate::validation::ValidationMode;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Version tag written with every stored table
pub const FORMAT_VERSION: &str = "1.0.0";

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where adapters find downloaded source files
    pub data_dir: PathBuf,

    /// `<dataset>.json` source configs
    pub source_config_dir: PathBuf,

    /// `<method>.json` Flow-By-Sector method configs
    pub method_dir: PathBuf,

    /// `<name>.csv` activity-to-sector crosswalks
    pub crosswalk_dir: PathBuf,

    /// SQLite file for generated tables; None keeps them in memory
    pub store_path: Option<PathBuf>,

    pub format_version: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings::from_root(".")
    }
}

impl Settings {
    /// Conventional layout under one root directory
    pub fn from_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Settings {
            data_dir: root.join("data"),
            source_config_dir: root.join("config/sources"),
            method_dir: root.join("config/methods"),
            crosswalk_dir: root.join("crosswalks"),
            store_path: Some(root.join("output/flowsa.db")),
            format_version: FORMAT_VERSION.to_string(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            FlowsaError::Config(format!(
                "Failed to read settings file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        let settings: Settings = toml::from_str(&content)?;
        Ok(settings)
    }

    pub fn source_config_path(&self, dataset: &str) -> PathBuf {
        self.source_config_dir.join(format!("{}.json", dataset))
    }

    pub fn method_path(&self, method: &str) -> PathBuf {
        self.method_dir.join(format!("{}.json", method))
    }

    pub fn crosswalk_path(&self, name: &str) -> PathBuf {
        self.crosswalk_dir.join(format!("{}.csv", name))
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path, what: &str) -> Result<T> {
    let content = fs::read_to_string(path)
        .map_err(|e| FlowsaError::Config(format!("Failed to read {} {:?}: {}", what, path, e)))?;
    Ok(serde_json::from_str(&content)?)
}

/// File stems of `*.<extension>` files in a directory, sorted
pub fn list_config_names(dir: &Path, extension: &str) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}

// ============================================================================
// SOURCE CONFIG (per Flow-By-Activity dataset)
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Registered adapter id; defaults to the dataset name
    pub adapter: Option<String>,

    /// Source column → canonical field
    pub column_mapping: BTreeMap<String, String>,

    /// Canonical field → literal applied to every record
    pub static_fields: BTreeMap<String, serde_json::Value>,

    /// Source column holding the amount, if not mapped to FlowAmount
    pub measure_column: Option<String>,

    pub allow_negative: bool,

    /// How invalid Flow-By-Activity rows are handled
    pub validation_mode: ValidationMode,

    /// Suppression markers; None uses the defaults
    pub withdrawn_tokens: Option<Vec<String>>,

    /// Tokens this source uses for a true zero
    pub zero_tokens: Vec<String>,

    pub flow_type_keywords: FlowTypeKeywords,

    /// Years the source publishes
    pub years: Vec<i32>,
}

impl SourceConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_json(path.as_ref(), "source config")
    }

    pub fn adapter_id<'a>(&'a self, dataset: &'a str) -> &'a str {
        self.adapter.as_deref().unwrap_or(dataset)
    }
}

// ============================================================================
// METHOD CONFIG (per Flow-By-Sector method)
// ============================================================================

/// Where apportionment weights come from when the crosswalk has none
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApportionmentConfig {
    /// Auxiliary Flow-By-Activity dataset reporting by sector
    pub fba_source: String,

    /// Defaults to the method year
    #[serde(default)]
    pub year: Option<i32>,

    /// Only auxiliary records with this FlowName count
    #[serde(default)]
    pub flow_ratio_source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodConfig {
    /// Flow-By-Activity dataset the method starts from
    pub source: String,

    pub year: i32,

    /// ActivitySourceName to join on in the crosswalk; defaults to `source`
    #[serde(default)]
    pub activity_source_name: Option<String>,

    /// Keep only FBA records of these classes; empty keeps all.
    /// Accepts a single class or a list.
    #[serde(default, deserialize_with = "one_or_many")]
    pub class_filter: Vec<String>,

    /// Keep only FBA records at this scale
    #[serde(default)]
    pub geo_filter: Option<GeoScale>,

    /// Crosswalk file stem; defaults to `source`
    #[serde(default)]
    pub crosswalk: Option<String>,

    /// Sector classification to keep, e.g. "NAICS_2012_Code"
    #[serde(default)]
    pub target_sector_source: Option<String>,

    #[serde(default)]
    pub apportionment: Option<ApportionmentConfig>,

    /// Split by crosswalk weights; false fans out full amounts
    #[serde(default)]
    pub apportion: bool,

    #[serde(default = "default_group_keys")]
    pub group_keys: Vec<GroupKey>,

    #[serde(default)]
    pub collapse: bool,

    #[serde(default)]
    pub geo_rollup_target: Option<GeoScale>,

    #[serde(default)]
    pub validation_mode: ValidationMode,

    #[serde(default)]
    pub allow_negative: bool,

    #[serde(default)]
    pub require_sectors: bool,

    #[serde(default)]
    pub standardize_units: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(class) => vec![class],
        OneOrMany::Many(classes) => classes,
    })
}

fn default_group_keys() -> Vec<GroupKey> {
    DEFAULT_GROUP_KEYS.to_vec()
}

impl MethodConfig {
    pub fn new(source: &str, year: i32) -> Self {
        MethodConfig {
            source: source.to_string(),
            year,
            activity_source_name: None,
            class_filter: Vec::new(),
            geo_filter: None,
            crosswalk: None,
            target_sector_source: None,
            apportionment: None,
            apportion: false,
            group_keys: default_group_keys(),
            collapse: false,
            geo_rollup_target: None,
            validation_mode: ValidationMode::default(),
            allow_negative: false,
            require_sectors: false,
            standardize_units: false,
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        read_json(path.as_ref(), "method config")
    }

    pub fn activity_source(&self) -> &str {
        self.activity_source_name.as_deref().unwrap_or(&self.source)
    }

    pub fn crosswalk_name(&self) -> &str {
        self.crosswalk.as_deref().unwrap_or(&self.source)
    }

    /// Weights are used when requested or when derived from an auxiliary dataset
    pub fn is_apportioned(&self) -> bool {
        self.apportion || self.apportionment.is_some()
    }

    pub fn apply(&mut self, overrides: &MethodOverrides) {
        if let Some(year) = overrides.year {
            self.year = year;
        }
        if let Some(mode) = overrides.validation_mode {
            self.validation_mode = mode;
        }
        if let Some(collapse) = overrides.collapse {
            self.collapse = collapse;
        }
        if let Some(target) = overrides.geo_rollup_target {
            self.geo_rollup_target = Some(target);
        }
        if let Some(keys) = &overrides.group_keys {
            self.group_keys = keys.clone();
        }
    }
}

/// Caller-supplied changes to a method config for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodOverrides {
    pub year: Option<i32>,
    pub validation_mode: Option<ValidationMode>,
    pub collapse: Option<bool>,
    pub geo_rollup_target: Option<GeoScale>,
    pub group_keys: Option<Vec<GroupKey>>,
}

impl MethodOverrides {
    pub fn is_empty(&self) -> bool {
        *self == MethodOverrides::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_settings_from_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "data_dir = \"/srv/flowsa/data\"").unwrap();
        writeln!(file, "method_dir = \"/srv/flowsa/methods\"").unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.data_dir, PathBuf::from("/srv/flowsa/data"));
        assert_eq!(settings.method_path("Water_2015"), PathBuf::from("/srv/flowsa/methods/Water_2015.json"));
        // unspecified keys keep their defaults
        assert_eq!(settings.format_version, FORMAT_VERSION);
    }

    #[test]
    fn test_settings_missing_file_is_config_error() {
        let err = Settings::load("/nonexistent/flowsa.toml").unwrap_err();
        assert!(matches!(err, FlowsaError::Config(_)));
    }

    #[test]
    fn test_source_config_json() {
        let json = r#"{
            "column_mapping": {"Withdrawal": "FlowAmount", "FIPS": "Location"},
            "static_fields": {"Class": "Water", "Unit": "Mgal"},
            "zero_tokens": ["--"],
            "flow_type_keywords": {"technosphere": ["Public Supply"]}
        }"#;
        let config: SourceConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.column_mapping.get("FIPS").map(String::as_str), Some("Location"));
        assert_eq!(config.zero_tokens, vec!["--".to_string()]);
        assert_eq!(config.withdrawn_tokens, None);
        assert!(config.flow_type_keywords.waste.is_empty());
        assert_eq!(config.adapter_id("USGS_NWIS_WU"), "USGS_NWIS_WU");
    }

    #[test]
    fn test_method_config_defaults_and_overrides() {
        let json = r#"{
            "source": "USGS_NWIS_WU",
            "year": 2015,
            "geo_rollup_target": "state",
            "validation_mode": "permissive_drop"
        }"#;
        let mut method: MethodConfig = serde_json::from_str(json).unwrap();

        assert_eq!(method.group_keys, DEFAULT_GROUP_KEYS.to_vec());
        assert_eq!(method.geo_rollup_target, Some(GeoScale::State));
        assert_eq!(method.validation_mode, ValidationMode::PermissiveDrop);
        assert_eq!(method.crosswalk_name(), "USGS_NWIS_WU");
        assert!(!method.is_apportioned());
        assert!(method.class_filter.is_empty());

        let overrides = MethodOverrides {
            year: Some(2010),
            collapse: Some(true),
            ..Default::default()
        };
        assert!(!overrides.is_empty());
        method.apply(&overrides);
        assert_eq!(method.year, 2010);
        assert!(method.collapse);
    }

    #[test]
    fn test_class_filter_accepts_one_or_many() {
        let one: MethodConfig =
            serde_json::from_str(r#"{"source": "BLS_QCEW", "year": 2017, "class_filter": "Employment"}"#).unwrap();
        assert_eq!(one.class_filter, vec!["Employment".to_string()]);

        let many: MethodConfig = serde_json::from_str(
            r#"{"source": "BLS_QCEW", "year": 2017, "class_filter": ["Employment", "Chemicals"]}"#,
        )
        .unwrap();
        assert_eq!(many.class_filter, vec!["Employment".to_string(), "Chemicals".to_string()]);
    }

    #[test]
    fn test_list_config_names() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.json"), "{}").unwrap();
        fs::write(dir.path().join("a.json"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();

        let names = list_config_names(dir.path(), "json").unwrap();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        assert!(list_config_names(&dir.path().join("missing"), "json").unwrap().is_empty());
    }
}
