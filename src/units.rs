// 📏 Unit Table - recognized units of measure and their canonical forms
//
// Each unit is defined once, independently of any source. A definition says
// which canonical unit it converts to and by what factor. Aggregation never
// coerces units on its own; conversion only happens through `standardize`.

use crate::flow::FlowRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// UNIT DEFINITION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDefinition {
    /// Unit as written by sources, e.g. "Thousand USD"
    pub name: String,

    /// Canonical unit this converts to, e.g. "USD"
    pub canonical: String,

    /// Multiply an amount in `name` by this to get `canonical`
    pub factor: f64,

    /// Other spellings sources use for the same unit
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl UnitDefinition {
    /// A canonical unit (factor 1, converts to itself)
    pub fn canonical(name: &str) -> Self {
        UnitDefinition {
            name: name.to_string(),
            canonical: name.to_string(),
            factor: 1.0,
            aliases: Vec::new(),
        }
    }

    pub fn converts(name: &str, canonical: &str, factor: f64) -> Self {
        UnitDefinition {
            name: name.to_string(),
            canonical: canonical.to_string(),
            factor,
            aliases: Vec::new(),
        }
    }

    /// Builder: add an alternative spelling
    pub fn with_alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }
}

// ============================================================================
// UNIT TABLE
// ============================================================================

#[derive(Debug, Clone)]
pub struct UnitTable {
    /// Keyed by lowercased, trimmed spelling
    units: HashMap<String, UnitDefinition>,
}

impl UnitTable {
    /// Empty table; every unit is unknown until registered
    pub fn empty() -> Self {
        UnitTable {
            units: HashMap::new(),
        }
    }

    /// Table with the units used by the statistical sources
    pub fn new() -> Self {
        let mut table = UnitTable::empty();
        table.register_standard_units();
        table
    }

    fn register_standard_units(&mut self) {
        // ====================================================================
        // MASS
        // ====================================================================
        self.register(UnitDefinition::canonical("kg"));
        self.register(
            UnitDefinition::converts("Metric Tons", "kg", 1_000.0)
                .with_alias("MT")
                .with_alias("t")
                .with_alias("tonnes"),
        );
        self.register(UnitDefinition::converts("Thousand Metric Tons", "kg", 1.0e6));
        self.register(UnitDefinition::converts("Million Metric Tons", "kg", 1.0e9).with_alias("MMT"));
        self.register(UnitDefinition::converts("Short tons", "kg", 907.184_74));
        self.register(UnitDefinition::converts("Thousand short tons", "kg", 907_184.74));
        self.register(UnitDefinition::converts("lb", "kg", 0.453_592_37).with_alias("Pounds"));

        // ====================================================================
        // GREENHOUSE GAS (kept apart from plain mass)
        // ====================================================================
        self.register(UnitDefinition::canonical("kg CO2e"));
        self.register(UnitDefinition::converts("MMT CO2e", "kg CO2e", 1.0e9));
        self.register(UnitDefinition::converts("MT CO2e", "kg CO2e", 1_000.0));

        // ====================================================================
        // MONEY
        // ====================================================================
        self.register(UnitDefinition::canonical("USD"));
        self.register(UnitDefinition::converts("Thousand USD", "USD", 1_000.0));
        self.register(UnitDefinition::converts("Million USD", "USD", 1.0e6));

        // ====================================================================
        // AREA
        // ====================================================================
        self.register(UnitDefinition::canonical("m2"));
        self.register(UnitDefinition::converts("Acres", "m2", 4_046.856_422_4));
        self.register(UnitDefinition::converts("Thousand Acres", "m2", 4_046_856.422_4));
        self.register(UnitDefinition::converts("million sq ft", "m2", 92_903.04));

        // ====================================================================
        // VOLUME
        // ====================================================================
        self.register(UnitDefinition::canonical("m3"));
        self.register(UnitDefinition::converts("gal", "m3", 0.003_785_411_784));
        self.register(UnitDefinition::converts("Mgal", "m3", 3_785.411_784));
        self.register(UnitDefinition::converts("Bgal", "m3", 3_785_411.784));

        // ====================================================================
        // ENERGY
        // ====================================================================
        self.register(UnitDefinition::canonical("MJ"));
        self.register(UnitDefinition::converts("GJ", "MJ", 1_000.0));
        self.register(UnitDefinition::converts("kWh", "MJ", 3.6));
        self.register(UnitDefinition::converts("MMBtu", "MJ", 1_055.056));

        // ====================================================================
        // COUNTS
        // ====================================================================
        self.register(UnitDefinition::canonical("p").with_alias("persons"));
        self.register(UnitDefinition::canonical("count").with_alias("Number"));
    }

    /// Register a definition under its name and every alias
    pub fn register(&mut self, definition: UnitDefinition) {
        for alias in &definition.aliases {
            self.units.insert(key(alias), definition.clone());
        }
        self.units.insert(key(&definition.name), definition);
    }

    pub fn get(&self, unit: &str) -> Option<&UnitDefinition> {
        self.units.get(&key(unit))
    }

    pub fn is_known(&self, unit: &str) -> bool {
        self.get(unit).is_some()
    }

    /// Canonical unit and conversion factor for a recognized unit
    pub fn canonical(&self, unit: &str) -> Option<(&str, f64)> {
        self.get(unit).map(|d| (d.canonical.as_str(), d.factor))
    }

    /// Convert a record to its canonical unit.
    ///
    /// Unknown units are left untouched so the validator can report them;
    /// withdrawn amounts stay withdrawn.
    pub fn standardize(&self, record: &FlowRecord) -> FlowRecord {
        let mut out = record.clone();
        if let Some((canonical, factor)) = self.canonical(&record.unit) {
            out.flow_amount = record.flow_amount.scaled(factor);
            out.unit = canonical.to_string();
        }
        out
    }

    pub fn standardize_all(&self, records: &[FlowRecord]) -> Vec<FlowRecord> {
        records.iter().map(|r| self.standardize(r)).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl Default for UnitTable {
    fn default() -> Self {
        Self::new()
    }
}

fn key(unit: &str) -> String {
    unit.trim().to_lowercase()
}
