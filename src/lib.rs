// flowsa - Flow-By-Activity / Flow-By-Sector core library
// Source adapters feed normalization, validation, sector mapping and aggregation

pub mod adapter;
pub mod aggregation;
pub mod config;
pub mod crosswalk;
pub mod error;
pub mod flow;
pub mod location;
pub mod logging;
pub mod mapper;
pub mod normalize;
pub mod pipeline;
pub mod store;
pub mod units;
pub mod validation;

// Re-export commonly used types
pub use adapter::{
    AdapterRegistry, CsvFileAdapter, RawRow, RawTable, RawTableBuilder,
    SourceAdapter, SourceContext, StaticTableAdapter,
};
pub use aggregation::{
    AggregatedFlow, Aggregator, ConservationCheck, ConservationReport,
    GroupKey, UnitBalance, DEFAULT_GROUP_KEYS,
};
pub use config::{
    ApportionmentConfig, MethodConfig, MethodOverrides, Settings, SourceConfig,
    FORMAT_VERSION,
};
pub use crosswalk::{ApportionmentTable, CoverageReport, Crosswalk, SectorMapping};
pub use error::{FlowsaError, Result};
pub use flow::{fingerprint, FlowAmount, FlowRecord, FlowType, SectorFlow};
pub use location::{filter_by_geoscale, GeoScale, LocationSystem};
pub use logging::init_logging;
pub use mapper::{MappingOutcome, SectorMapper, UnmappedActivity};
pub use normalize::{CanonicalField, FlowTypeKeywords, NormalizationReport, Normalizer};
pub use pipeline::{FbaRun, FbsRun, Pipeline, RunSummary, UnitResult};
pub use store::{FlowStore, MemoryStore, SqliteStore, StoreKey, TableKind, TableMeta};
pub use units::{UnitDefinition, UnitTable};
pub use validation::{
    Rule, Severity, ValidationIssue, ValidationMode, ValidationReport, Validator,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
