// ➕ Aggregator - sector flows → Flow-By-Sector rows
//
// Groups keep first-appearance order. Withdrawn amounts are skipped by the
// sums, never treated as zero. Units are never coerced: a group mixing
// units is a configuration error.

use crate::error::{FlowsaError, Result};
use crate::flow::{FlowAmount, FlowRecord, FlowType, SectorFlow};
use crate::location::{rollup_code, GeoScale};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

// ============================================================================
// GROUP KEYS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupKey {
    /// Representative sector (producing, else consuming)
    Sector,
    SectorProducedBy,
    SectorConsumedBy,
    SectorSourceName,
    SectorType,
    Location,
    LocationSystem,
    FlowName,
    FlowType,
    Class,
    Compartment,
    Year,
    Unit,
}

/// Flow-By-Sector grouping
pub const DEFAULT_GROUP_KEYS: [GroupKey; 11] = [
    GroupKey::SectorProducedBy,
    GroupKey::SectorConsumedBy,
    GroupKey::SectorSourceName,
    GroupKey::SectorType,
    GroupKey::Location,
    GroupKey::LocationSystem,
    GroupKey::FlowName,
    GroupKey::FlowType,
    GroupKey::Class,
    GroupKey::Compartment,
    GroupKey::Year,
];

// ============================================================================
// AGGREGATED FLOW (Flow-By-Sector row)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedFlow {
    /// Representative sector: producing sector if present, else consuming
    #[serde(rename = "Sector")]
    pub sector: Option<String>,

    #[serde(rename = "SectorProducedBy")]
    pub sector_produced_by: Option<String>,

    #[serde(rename = "SectorConsumedBy")]
    pub sector_consumed_by: Option<String>,

    #[serde(rename = "SectorSourceName")]
    pub sector_source_name: Option<String>,

    #[serde(rename = "SectorType")]
    pub sector_type: Option<String>,

    #[serde(rename = "Location")]
    pub location: Option<String>,

    #[serde(rename = "LocationSystem")]
    pub location_system: Option<String>,

    #[serde(rename = "FlowName")]
    pub flow_name: Option<String>,

    #[serde(rename = "FlowType")]
    pub flow_type: Option<FlowType>,

    #[serde(rename = "Class")]
    pub class: Option<String>,

    #[serde(rename = "Compartment")]
    pub compartment: Option<String>,

    #[serde(rename = "Year")]
    pub year: Option<i32>,

    #[serde(rename = "Unit")]
    pub unit: String,

    #[serde(rename = "FlowAmount")]
    pub flow_amount: FlowAmount,

    #[serde(rename = "RecordCount")]
    pub record_count: usize,

    #[serde(rename = "WithdrawnCount")]
    pub withdrawn_count: usize,

    #[serde(rename = "Collapsed")]
    pub collapsed: bool,
}

impl AggregatedFlow {
    pub fn has_sector(&self) -> bool {
        [&self.sector, &self.sector_produced_by, &self.sector_consumed_by]
            .iter()
            .any(|s| s.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false))
    }
}

/// Value seen across a group: nothing yet, one value, or conflicting values
#[derive(Debug, Clone, PartialEq)]
enum Uniform<T> {
    Unset,
    Same(T),
    Mixed,
}

impl<T: PartialEq> Uniform<T> {
    fn observe(&mut self, value: T) {
        match self {
            Uniform::Unset => *self = Uniform::Same(value),
            Uniform::Same(current) if *current == value => {}
            Uniform::Same(_) => *self = Uniform::Mixed,
            Uniform::Mixed => {}
        }
    }

    fn is_mixed(&self) -> bool {
        matches!(self, Uniform::Mixed)
    }
}

impl<T> Uniform<Option<T>> {
    fn value(self) -> Option<T> {
        match self {
            Uniform::Same(v) => v,
            _ => None,
        }
    }
}

struct Group {
    sector: Uniform<Option<String>>,
    sector_produced_by: Uniform<Option<String>>,
    sector_consumed_by: Uniform<Option<String>>,
    sector_source_name: Uniform<Option<String>>,
    sector_type: Uniform<Option<String>>,
    location: Uniform<Option<String>>,
    /// Scale the contributing codes were reported at, before roll-up
    source_scale: Uniform<Option<GeoScale>>,
    location_system: Uniform<Option<String>>,
    flow_name: Uniform<Option<String>>,
    flow_type: Uniform<Option<FlowType>>,
    class: Uniform<Option<String>>,
    compartment: Uniform<Option<String>>,
    year: Uniform<Option<i32>>,
    unit: Uniform<Option<String>>,
    sum: f64,
    values: usize,
    record_count: usize,
    withdrawn_count: usize,
}

impl Group {
    fn new() -> Self {
        Group {
            sector: Uniform::Unset,
            sector_produced_by: Uniform::Unset,
            sector_consumed_by: Uniform::Unset,
            sector_source_name: Uniform::Unset,
            sector_type: Uniform::Unset,
            location: Uniform::Unset,
            source_scale: Uniform::Unset,
            location_system: Uniform::Unset,
            flow_name: Uniform::Unset,
            flow_type: Uniform::Unset,
            class: Uniform::Unset,
            compartment: Uniform::Unset,
            year: Uniform::Unset,
            unit: Uniform::Unset,
            sum: 0.0,
            values: 0,
            record_count: 0,
            withdrawn_count: 0,
        }
    }

    fn add(&mut self, flow: &SectorFlow, location: &str) {
        let f = &flow.flow;
        self.sector.observe(flow.sector().map(str::to_string));
        self.sector_produced_by.observe(flow.sector_produced_by.clone());
        self.sector_consumed_by.observe(flow.sector_consumed_by.clone());
        self.sector_source_name.observe(flow.sector_source_name.clone());
        self.sector_type.observe(flow.sector_type.clone());
        self.location.observe(Some(location.to_string()));
        self.source_scale.observe(GeoScale::of(&f.location));
        self.location_system.observe(Some(f.location_system.clone()));
        self.flow_name.observe(Some(f.flow_name.clone()));
        self.flow_type.observe(Some(f.flow_type));
        self.class.observe(Some(f.class.clone()));
        self.compartment.observe(f.compartment.clone());
        self.year.observe(Some(f.year));
        self.unit.observe(Some(f.unit.clone()));

        self.record_count += 1;
        match f.flow_amount {
            FlowAmount::Value(v) => {
                self.sum += v;
                self.values += 1;
            }
            FlowAmount::Withdrawn => self.withdrawn_count += 1,
        }
    }

    fn finish(self, collapsed: bool) -> AggregatedFlow {
        let (sector_produced_by, sector_consumed_by) = if collapsed {
            (None, None)
        } else {
            (self.sector_produced_by.value(), self.sector_consumed_by.value())
        };

        AggregatedFlow {
            sector: self.sector.value(),
            sector_produced_by,
            sector_consumed_by,
            sector_source_name: self.sector_source_name.value(),
            sector_type: self.sector_type.value(),
            location: self.location.value(),
            location_system: self.location_system.value(),
            flow_name: self.flow_name.value(),
            flow_type: self.flow_type.value(),
            class: self.class.value(),
            compartment: self.compartment.value(),
            year: self.year.value(),
            unit: self.unit.value().unwrap_or_default(),
            flow_amount: if self.values > 0 {
                FlowAmount::Value(self.sum)
            } else {
                FlowAmount::Withdrawn
            },
            record_count: self.record_count,
            withdrawn_count: self.withdrawn_count,
            collapsed,
        }
    }
}

// ============================================================================
// AGGREGATOR
// ============================================================================

pub struct Aggregator {
    group_keys: Vec<GroupKey>,
    collapse: bool,
    rollup: Option<GeoScale>,
}

impl Aggregator {
    pub fn new(group_keys: &[GroupKey]) -> Self {
        Aggregator {
            group_keys: group_keys.to_vec(),
            collapse: false,
            rollup: None,
        }
    }

    /// Builder: replace producing/consuming sector keys with the representative sector
    pub fn collapse(mut self, collapse: bool) -> Self {
        self.collapse = collapse;
        self
    }

    /// Builder: roll locations up to a coarser scale before grouping
    pub fn rollup_to(mut self, target: Option<GeoScale>) -> Self {
        self.rollup = target;
        self
    }

    /// Keys actually used for grouping
    pub fn effective_keys(&self) -> Vec<GroupKey> {
        let mut keys = Vec::new();
        for key in &self.group_keys {
            let key = match key {
                GroupKey::SectorProducedBy | GroupKey::SectorConsumedBy if self.collapse => {
                    GroupKey::Sector
                }
                other => *other,
            };
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    pub fn aggregate(&self, flows: &[SectorFlow]) -> Result<Vec<AggregatedFlow>> {
        let keys = self.effective_keys();
        let (dataset, year) = flows
            .first()
            .map(|f| (f.flow.source_name.clone(), f.flow.year))
            .unwrap_or_default();

        if self.collapse {
            info!(dataset = %dataset, year, "collapsing producing and consuming sectors into Sector");
        }

        let mut index: HashMap<Vec<Option<String>>, usize> = HashMap::new();
        let mut groups: Vec<Group> = Vec::new();

        for flow in flows {
            let location = match self.rollup {
                Some(target) => rollup_code(&flow.flow.location, target).unwrap_or_else(|| {
                    warn!(location = %flow.flow.location, "malformed location left as is during roll-up");
                    flow.flow.location.clone()
                }),
                None => flow.flow.location.clone(),
            };

            let key: Vec<Option<String>> = keys.iter().map(|k| key_value(*k, flow, &location)).collect();
            let pos = *index.entry(key).or_insert_with(|| {
                groups.push(Group::new());
                groups.len() - 1
            });
            groups[pos].add(flow, &location);
        }

        let mixed_units = groups.iter().filter(|g| g.unit.is_mixed()).count();
        if mixed_units > 0 {
            return Err(FlowsaError::crosswalk(
                &dataset,
                year,
                mixed_units,
                "groups mix units; standardize units before aggregating",
            ));
        }

        if self.rollup.is_some() {
            let mixed = groups
                .iter()
                .filter(|g| g.location_system.is_mixed() || g.flow_type.is_mixed())
                .count();
            if mixed > 0 {
                return Err(FlowsaError::crosswalk(
                    &dataset,
                    year,
                    mixed,
                    "geographic roll-up across differing location systems or flow types",
                ));
            }

            // a state total next to its own counties would be counted twice
            let mixed_scales = groups.iter().filter(|g| g.source_scale.is_mixed()).count();
            if mixed_scales > 0 {
                return Err(FlowsaError::crosswalk(
                    &dataset,
                    year,
                    mixed_scales,
                    "geographic roll-up over records reported at different scales; filter to one scale first",
                ));
            }
        }

        let out: Vec<AggregatedFlow> = groups
            .into_iter()
            .map(|g| g.finish(self.collapse))
            .collect();

        info!(
            dataset = %dataset,
            year,
            records_in = flows.len(),
            groups = out.len(),
            "aggregated sector flows"
        );

        Ok(out)
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(&DEFAULT_GROUP_KEYS)
    }
}

fn key_value(key: GroupKey, flow: &SectorFlow, location: &str) -> Option<String> {
    let f = &flow.flow;
    match key {
        GroupKey::Sector => flow.sector().map(str::to_string),
        GroupKey::SectorProducedBy => flow.sector_produced_by.clone(),
        GroupKey::SectorConsumedBy => flow.sector_consumed_by.clone(),
        GroupKey::SectorSourceName => flow.sector_source_name.clone(),
        GroupKey::SectorType => flow.sector_type.clone(),
        GroupKey::Location => Some(location.to_string()),
        GroupKey::LocationSystem => Some(f.location_system.clone()),
        GroupKey::FlowName => Some(f.flow_name.clone()),
        GroupKey::FlowType => Some(f.flow_type.as_str().to_string()),
        GroupKey::Class => Some(f.class.clone()),
        GroupKey::Compartment => f.compartment.clone(),
        GroupKey::Year => Some(f.year.to_string()),
        GroupKey::Unit => Some(f.unit.clone()),
    }
}

// ============================================================================
// CONSERVATION CHECK
// ============================================================================

/// Anything carrying a unit and an amount
pub trait Measured {
    fn unit(&self) -> &str;
    fn amount(&self) -> FlowAmount;
}

impl Measured for FlowRecord {
    fn unit(&self) -> &str {
        &self.unit
    }
    fn amount(&self) -> FlowAmount {
        self.flow_amount
    }
}

impl Measured for SectorFlow {
    fn unit(&self) -> &str {
        &self.flow.unit
    }
    fn amount(&self) -> FlowAmount {
        self.flow.flow_amount
    }
}

impl Measured for AggregatedFlow {
    fn unit(&self) -> &str {
        &self.unit
    }
    fn amount(&self) -> FlowAmount {
        self.flow_amount
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitBalance {
    pub unit: String,
    pub before: f64,
    pub after: f64,
    pub difference: f64,
    pub balanced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConservationReport {
    pub units: Vec<UnitBalance>,
    pub checked_at: DateTime<Utc>,
}

impl ConservationReport {
    pub fn is_balanced(&self) -> bool {
        self.units.iter().all(|u| u.balanced)
    }

    pub fn discrepancies(&self) -> Vec<&UnitBalance> {
        self.units.iter().filter(|u| !u.balanced).collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "Units: {}, Balanced: {}, Discrepancies: {}",
            self.units.len(),
            self.is_balanced(),
            self.discrepancies().len()
        )
    }
}

/// Compares per-unit totals of non-withdrawn amounts across a stage
pub struct ConservationCheck {
    /// Relative tolerance
    tolerance: f64,
}

impl ConservationCheck {
    pub fn new() -> Self {
        ConservationCheck { tolerance: 1e-9 }
    }

    pub fn with_tolerance(tolerance: f64) -> Self {
        ConservationCheck { tolerance }
    }

    pub fn check<A: Measured, B: Measured>(&self, before: &[A], after: &[B]) -> ConservationReport {
        let before_totals = totals(before);
        let after_totals = totals(after);

        let mut units: Vec<&String> = before_totals.keys().chain(after_totals.keys()).collect();
        units.sort();
        units.dedup();

        let units = units
            .into_iter()
            .map(|unit| {
                let b = before_totals.get(unit).copied().unwrap_or(0.0);
                let a = after_totals.get(unit).copied().unwrap_or(0.0);
                let difference = a - b;
                UnitBalance {
                    unit: unit.clone(),
                    before: b,
                    after: a,
                    difference,
                    balanced: difference.abs() <= self.tolerance * b.abs().max(1.0),
                }
            })
            .collect();

        ConservationReport {
            units,
            checked_at: Utc::now(),
        }
    }
}

impl Default for ConservationCheck {
    fn default() -> Self {
        Self::new()
    }
}

fn totals<M: Measured>(rows: &[M]) -> BTreeMap<String, f64> {
    let mut totals = BTreeMap::new();
    for row in rows {
        if let Some(v) = row.amount().value() {
            *totals.entry(row.unit().to_string()).or_insert(0.0) += v;
        }
    }
    totals
}
