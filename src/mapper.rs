// 🧭 Sector Mapper - attach industry sectors to activity records
//
// Each activity column is joined against the crosswalk on its own: the
// producing activity fills SectorProducedBy, the consuming one fills
// SectorConsumedBy. An activity matching N sectors yields N children; with
// both columns populated the children are the cross product.

use crate::crosswalk::{ApportionmentTable, Crosswalk, SectorMapping};
use crate::error::Result;
use crate::flow::{non_blank, FlowRecord, SectorFlow};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Which activity column failed to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityColumn {
    ActivityProducedBy,
    ActivityConsumedBy,
}

/// An activity with no crosswalk entry. Its rows were kept with a null
/// sector so the amount stays visible downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmappedActivity {
    pub activity_source_name: String,
    pub activity: String,
    pub column: ActivityColumn,
    pub rows: usize,
    /// Sum of the non-withdrawn amounts carried by those rows
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappingOutcome {
    pub flows: Vec<SectorFlow>,
    /// In order of first appearance
    pub unmapped: Vec<UnmappedActivity>,
}

impl MappingOutcome {
    pub fn unmapped_rows(&self) -> usize {
        self.unmapped.iter().map(|u| u.rows).sum()
    }
}

#[derive(Default)]
struct UnmappedLog {
    entries: Vec<UnmappedActivity>,
    index: HashMap<(String, String, ActivityColumn), usize>,
}

impl UnmappedLog {
    fn record(&mut self, source: &str, activity: &str, column: ActivityColumn, record: &FlowRecord) {
        let key = (source.to_string(), activity.to_string(), column);
        let entries = &mut self.entries;
        let pos = *self.index.entry(key).or_insert_with(|| {
            entries.push(UnmappedActivity {
                activity_source_name: source.to_string(),
                activity: activity.to_string(),
                column,
                rows: 0,
                amount: 0.0,
            });
            entries.len() - 1
        });
        self.entries[pos].rows += 1;
        self.entries[pos].amount += record.flow_amount.value().unwrap_or(0.0);
    }
}

// ============================================================================
// SECTOR MAPPER
// ============================================================================

pub struct SectorMapper {
    crosswalk: Crosswalk,
    apportionment: Option<ApportionmentTable>,
    activity_source_name: Option<String>,
}

impl SectorMapper {
    /// Fan-out mapper: every matched sector receives the full amount
    pub fn new(crosswalk: Crosswalk) -> Self {
        SectorMapper {
            crosswalk,
            apportionment: None,
            activity_source_name: None,
        }
    }

    /// Builder: split amounts by weight instead of fanning out
    pub fn with_apportionment(mut self, table: ApportionmentTable) -> Self {
        self.apportionment = Some(table);
        self
    }

    /// Builder: join on this activity source instead of each record's SourceName
    pub fn with_activity_source(mut self, name: &str) -> Self {
        self.activity_source_name = Some(name.to_string());
        self
    }

    pub fn crosswalk(&self) -> &Crosswalk {
        &self.crosswalk
    }

    /// Map records to sectors.
    ///
    /// Output keeps input order; the children of one record sit at its
    /// position in crosswalk order. With an apportionment table the weights
    /// are checked first and a bad table produces no output at all.
    pub fn map_to_sectors(&self, records: &[FlowRecord]) -> Result<MappingOutcome> {
        if let (Some(table), Some(first)) = (&self.apportionment, records.first()) {
            table.validate(&self.crosswalk, &first.source_name, first.year)?;
        }

        let mut flows = Vec::with_capacity(records.len());
        let mut unmapped = UnmappedLog::default();

        for record in records {
            let source = self
                .activity_source_name
                .as_deref()
                .unwrap_or(&record.source_name);

            let produced = self.resolve(
                source,
                record,
                ActivityColumn::ActivityProducedBy,
                &mut unmapped,
            );
            let consumed = self.resolve(
                source,
                record,
                ActivityColumn::ActivityConsumedBy,
                &mut unmapped,
            );

            for p in &produced {
                for c in &consumed {
                    flows.push(self.child(record, source, *p, *c));
                }
            }
        }

        let outcome = MappingOutcome {
            flows,
            unmapped: unmapped.entries,
        };

        if !outcome.unmapped.is_empty() {
            warn!(
                activities = outcome.unmapped.len(),
                rows = outcome.unmapped_rows(),
                "activities without crosswalk entries kept with null sector"
            );
        }
        info!(
            records_in = records.len(),
            records_out = outcome.flows.len(),
            apportioned = self.apportionment.is_some(),
            "mapped activities to sectors"
        );

        Ok(outcome)
    }

    /// Crosswalk entries for one activity column; `[None]` when the column
    /// is empty or the activity is unknown
    fn resolve<'a>(
        &'a self,
        source: &str,
        record: &FlowRecord,
        column: ActivityColumn,
        unmapped: &mut UnmappedLog,
    ) -> Vec<Option<&'a SectorMapping>> {
        let activity = match column {
            ActivityColumn::ActivityProducedBy => non_blank(&record.activity_produced_by),
            ActivityColumn::ActivityConsumedBy => non_blank(&record.activity_consumed_by),
        };
        let Some(activity) = activity else {
            return vec![None];
        };

        let matches = self.crosswalk.matches(source, activity);
        if matches.is_empty() {
            unmapped.record(source, activity, column, record);
            return vec![None];
        }
        matches.into_iter().map(Some).collect()
    }

    fn child(
        &self,
        record: &FlowRecord,
        source: &str,
        produced: Option<&SectorMapping>,
        consumed: Option<&SectorMapping>,
    ) -> SectorFlow {
        let weight = self.apportionment.as_ref().map(|table| {
            [produced, consumed]
                .into_iter()
                .flatten()
                .map(|m| table.weight(source, &m.activity, &m.sector).unwrap_or(1.0))
                .product::<f64>()
        });

        let mut flow = record.clone();
        if let Some(w) = weight {
            flow.flow_amount = record.flow_amount.scaled(w);
        }

        let lead = produced.or(consumed);
        SectorFlow {
            flow,
            sector_produced_by: produced.map(|m| m.sector.clone()),
            sector_consumed_by: consumed.map(|m| m.sector.clone()),
            sector_source_name: lead.map(|m| m.sector_source_name.clone()),
            sector_type: lead.and_then(|m| m.sector_type.clone()),
            apportionment_weight: weight,
        }
    }
}
