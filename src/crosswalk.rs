// 🔀 Activity-to-Sector Crosswalk - mapping tables as data
//
// A crosswalk is loaded wholesale, never row by row, and indexed by
// (activity source, activity). Entries for one activity keep file order.

use crate::error::{FlowsaError, Result};
use crate::flow::{non_blank, FlowRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Apportionment weights for one activity must sum to 1 within this
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

// ============================================================================
// CROSSWALK ROW
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorMapping {
    #[serde(rename = "ActivitySourceName")]
    pub activity_source_name: String,

    #[serde(rename = "Activity")]
    pub activity: String,

    /// Sector code, e.g. NAICS "111"
    #[serde(rename = "Sector")]
    pub sector: String,

    /// "I" (industry) or "C" (commodity)
    #[serde(rename = "SectorType", default)]
    pub sector_type: Option<String>,

    #[serde(rename = "SectorSourceName")]
    pub sector_source_name: String,

    /// Share of the activity's amount going to this sector
    #[serde(rename = "Weight", default)]
    pub weight: Option<f64>,
}

impl SectorMapping {
    pub fn new(activity_source_name: &str, activity: &str, sector: &str, sector_source_name: &str) -> Self {
        SectorMapping {
            activity_source_name: activity_source_name.to_string(),
            activity: activity.to_string(),
            sector: sector.to_string(),
            sector_type: None,
            sector_source_name: sector_source_name.to_string(),
            weight: None,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_sector_type(mut self, sector_type: &str) -> Self {
        self.sector_type = Some(sector_type.to_string());
        self
    }
}

// ============================================================================
// CROSSWALK
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Crosswalk {
    entries: Vec<SectorMapping>,
    index: HashMap<(String, String), Vec<usize>>,
}

impl Crosswalk {
    /// Build from rows; rows with a blank sector are skipped
    pub fn from_entries(rows: Vec<SectorMapping>) -> Self {
        let mut crosswalk = Crosswalk::default();
        for mut row in rows {
            row.activity_source_name = row.activity_source_name.trim().to_string();
            row.activity = row.activity.trim().to_string();
            row.sector = row.sector.trim().to_string();
            if row.sector.is_empty() {
                continue;
            }

            let key = (row.activity_source_name.clone(), row.activity.clone());
            crosswalk.index.entry(key).or_default().push(crosswalk.entries.len());
            crosswalk.entries.push(row);
        }
        crosswalk
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let rows = csv_reader
            .deserialize::<SectorMapping>()
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Crosswalk::from_entries(rows))
    }

    /// Load a crosswalk CSV file
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let crosswalk = Crosswalk::from_reader(file)?;
        debug!(path = ?path.as_ref(), entries = crosswalk.len(), "loaded crosswalk");
        Ok(crosswalk)
    }

    /// Entries for an activity, in file order
    pub fn matches(&self, activity_source_name: &str, activity: &str) -> Vec<&SectorMapping> {
        let key = (activity_source_name.trim().to_string(), activity.trim().to_string());
        self.index
            .get(&key)
            .map(|positions| positions.iter().map(|&i| &self.entries[i]).collect())
            .unwrap_or_default()
    }

    /// Keep only entries targeting one sector classification, e.g. "NAICS_2012_Code"
    pub fn for_sector_source(&self, sector_source_name: &str) -> Crosswalk {
        Crosswalk::from_entries(
            self.entries
                .iter()
                .filter(|e| e.sector_source_name == sector_source_name)
                .cloned()
                .collect(),
        )
    }

    /// Keep only entries for the given activities
    pub fn retain_activities(&self, activities: &HashSet<String>) -> Crosswalk {
        Crosswalk::from_entries(
            self.entries
                .iter()
                .filter(|e| activities.contains(&e.activity))
                .cloned()
                .collect(),
        )
    }

    pub fn entries(&self) -> &[SectorMapping] {
        &self.entries
    }

    /// (activity source, activity) pairs in first-appearance order
    pub fn activities(&self) -> Vec<(&str, &str)> {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .filter(|e| seen.insert((e.activity_source_name.as_str(), e.activity.as_str())))
            .map(|e| (e.activity_source_name.as_str(), e.activity.as_str()))
            .collect()
    }

    pub fn has_weights(&self) -> bool {
        self.entries.iter().any(|e| e.weight.is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by source, activity, sector, sector type
    pub fn sorted(&self) -> Vec<SectorMapping> {
        let mut rows = self.entries.clone();
        rows.sort_by(|a, b| {
            (&a.activity_source_name, &a.activity, &a.sector, &a.sector_type).cmp(&(
                &b.activity_source_name,
                &b.activity,
                &b.sector,
                &b.sector_type,
            ))
        });
        rows
    }

    /// Write the crosswalk back out in sorted order
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        for row in self.sorted() {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Activities present in `records` that have no crosswalk entry
    pub fn coverage(&self, activity_source_name: &str, records: &[FlowRecord]) -> CoverageReport {
        let mut activities = BTreeSet::new();
        for record in records {
            for activity in [
                non_blank(&record.activity_produced_by),
                non_blank(&record.activity_consumed_by),
            ]
            .into_iter()
            .flatten()
            {
                activities.insert(activity.to_string());
            }
        }

        let missing = activities
            .iter()
            .filter(|a| self.matches(activity_source_name, a).is_empty())
            .cloned()
            .collect();

        CoverageReport {
            activity_source_name: activity_source_name.to_string(),
            activities_total: activities.len(),
            missing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub activity_source_name: String,
    pub activities_total: usize,
    /// Sorted activity names with no crosswalk entry
    pub missing: Vec<String>,
}

impl CoverageReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

// ============================================================================
// APPORTIONMENT TABLE
// ============================================================================

/// Per-activity sector weights. An activity that maps to one sector and has
/// no entry here implicitly carries weight 1.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApportionmentTable {
    /// (activity source, activity) → sector → weight
    weights: HashMap<(String, String), BTreeMap<String, f64>>,
}

impl ApportionmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, activity_source_name: &str, activity: &str, sector: &str, weight: f64) {
        self.weights
            .entry((activity_source_name.to_string(), activity.to_string()))
            .or_default()
            .insert(sector.to_string(), weight);
    }

    /// Weights taken from the crosswalk's Weight column
    pub fn from_crosswalk(crosswalk: &Crosswalk) -> Self {
        let mut table = ApportionmentTable::new();
        for entry in crosswalk.entries() {
            if let Some(w) = entry.weight {
                table.insert(&entry.activity_source_name, &entry.activity, &entry.sector, w);
            }
        }
        table
    }

    /// Weights proportional to an auxiliary dataset's amounts per sector.
    ///
    /// The auxiliary records report by sector code in ActivityProducedBy
    /// (e.g. an input-output make table). `flow_name` narrows them to one
    /// flow. Withdrawn amounts do not count. A multi-sector activity whose
    /// sectors total zero in the auxiliary data is a configuration error.
    pub fn from_flow_ratios(
        crosswalk: &Crosswalk,
        auxiliary: &[FlowRecord],
        flow_name: Option<&str>,
    ) -> Result<Self> {
        let mut totals: HashMap<&str, f64> = HashMap::new();
        for record in auxiliary {
            if let Some(name) = flow_name {
                if record.flow_name != name {
                    continue;
                }
            }
            if let (Some(sector), Some(v)) =
                (non_blank(&record.activity_produced_by), record.flow_amount.value())
            {
                *totals.entry(sector).or_insert(0.0) += v;
            }
        }

        let mut table = ApportionmentTable::new();
        for (source, activity) in crosswalk.activities() {
            let sectors = crosswalk.matches(source, activity);
            if sectors.len() < 2 {
                continue;
            }

            let amounts: Vec<f64> = sectors
                .iter()
                .map(|m| totals.get(m.sector.as_str()).copied().unwrap_or(0.0))
                .collect();
            let total: f64 = amounts.iter().sum();

            if total <= 0.0 {
                let aux_dataset = auxiliary
                    .first()
                    .map(|r| (r.source_name.as_str(), r.year))
                    .unwrap_or(("auxiliary", 0));
                return Err(FlowsaError::crosswalk(
                    aux_dataset.0,
                    aux_dataset.1,
                    sectors.len(),
                    format!("no auxiliary amounts to apportion activity {:?}", activity),
                ));
            }

            for (mapping, amount) in sectors.iter().zip(amounts) {
                table.insert(source, activity, &mapping.sector, amount / total);
            }
        }

        Ok(table)
    }

    pub fn weight(&self, activity_source_name: &str, activity: &str, sector: &str) -> Option<f64> {
        self.weights
            .get(&(activity_source_name.to_string(), activity.to_string()))
            .and_then(|sectors| sectors.get(sector))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Every activity with more than one sector, or with any weight, must
    /// have a finite, non-negative weight for each of its sectors summing
    /// to 1.
    pub fn validate(&self, crosswalk: &Crosswalk, dataset: &str, year: i32) -> Result<()> {
        let mut problems = Vec::new();
        let mut rows = 0usize;

        for (source, activity) in crosswalk.activities() {
            let sectors = crosswalk.matches(source, activity);
            let weighted = self
                .weights
                .contains_key(&(source.to_string(), activity.to_string()));
            if sectors.len() < 2 && !weighted {
                continue;
            }

            let weights: Vec<Option<f64>> = sectors
                .iter()
                .map(|m| self.weight(source, activity, &m.sector))
                .collect();

            if weights.iter().any(Option::is_none) {
                problems.push(format!("{:?} is missing weights", activity));
                rows += sectors.len();
                continue;
            }

            if weights.iter().flatten().any(|w| !w.is_finite() || *w < 0.0) {
                problems.push(format!("{:?} has non-finite or negative weights", activity));
                rows += sectors.len();
                continue;
            }

            let sum: f64 = weights.iter().flatten().sum();
            if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
                problems.push(format!("{:?} weights sum to {}", activity, sum));
                rows += sectors.len();
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(FlowsaError::crosswalk(dataset, year, rows, problems.join("; ")))
        }
    }
}
