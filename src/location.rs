// 🗺️ Geography - FIPS codes, code-system vintages and geographic scales
//
// Codes are 5 digits: national = 00000, state = SS000, county = SSCCC.
// The code system changes between vintages, so every record carries a
// location-system tag next to its code.

use crate::flow::FlowRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// FIPS code of the United States as a whole
pub const US_FIPS: &str = "00000";

// ============================================================================
// LOCATION SYSTEM
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LocationSystem {
    #[serde(rename = "FIPS_2010")]
    Fips2010,
    #[serde(rename = "FIPS_2013")]
    Fips2013,
    #[serde(rename = "FIPS_2015")]
    Fips2015,
}

impl LocationSystem {
    /// Vintage of the FIPS code system that applies to data of a given year
    pub fn for_year(year: i32) -> Self {
        if year >= 2015 {
            LocationSystem::Fips2015
        } else if year >= 2013 {
            LocationSystem::Fips2013
        } else {
            if year < 2010 {
                warn!(year, "no FIPS vintage before 2010, assigning FIPS_2010");
            }
            LocationSystem::Fips2010
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LocationSystem::Fips2010 => "FIPS_2010",
            LocationSystem::Fips2013 => "FIPS_2013",
            LocationSystem::Fips2015 => "FIPS_2015",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim() {
            "FIPS_2010" => Some(LocationSystem::Fips2010),
            "FIPS_2013" => Some(LocationSystem::Fips2013),
            "FIPS_2015" => Some(LocationSystem::Fips2015),
            _ => None,
        }
    }

    /// All FIPS vintages share the same zero-padded 5 digit layout
    pub fn is_valid_code(&self, code: &str) -> bool {
        code.len() == 5 && code.bytes().all(|b| b.is_ascii_digit())
    }
}

impl fmt::Display for LocationSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// GEOGRAPHIC SCALE
// ============================================================================

/// Ordered from coarsest to finest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeoScale {
    National,
    State,
    County,
}

impl GeoScale {
    /// Scale of a well-formed 5 digit FIPS code
    pub fn of(code: &str) -> Option<GeoScale> {
        if code.len() != 5 || !code.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        if code == US_FIPS {
            Some(GeoScale::National)
        } else if code.ends_with("000") {
            Some(GeoScale::State)
        } else {
            Some(GeoScale::County)
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GeoScale::National => "national",
            GeoScale::State => "state",
            GeoScale::County => "county",
        }
    }

    pub fn parse(name: &str) -> Option<GeoScale> {
        match name.trim().to_lowercase().as_str() {
            "national" => Some(GeoScale::National),
            "state" => Some(GeoScale::State),
            "county" => Some(GeoScale::County),
            _ => None,
        }
    }
}

impl fmt::Display for GeoScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CODE HELPERS
// ============================================================================

/// Zero-pad a FIPS code as it comes out of a spreadsheet.
///
/// - "6" / "06" → "06000" (state)
/// - "6037" / "6037.0" → "06037" (county)
/// - anything else is returned trimmed and left for the validator to reject
pub fn pad_fips(raw: &str) -> String {
    let trimmed = raw.trim();
    let code = trimmed.strip_suffix(".0").unwrap_or(trimmed);

    if code.is_empty() || !code.bytes().all(|b| b.is_ascii_digit()) {
        return code.to_string();
    }

    match code.len() {
        1 | 2 => format!("{:0>2}000", code),
        3 | 4 => format!("{:0>5}", code),
        _ => code.to_string(),
    }
}

/// Code of the enclosing area at `target` scale.
///
/// Codes already at or above the target scale are returned unchanged.
/// Returns None for malformed codes.
pub fn rollup_code(code: &str, target: GeoScale) -> Option<String> {
    let scale = GeoScale::of(code)?;
    if scale <= target {
        return Some(code.to_string());
    }

    match target {
        GeoScale::National => Some(US_FIPS.to_string()),
        GeoScale::State => Some(format!("{}000", &code[..2])),
        GeoScale::County => Some(code.to_string()),
    }
}

/// Keep only records reported at exactly the requested scale
pub fn filter_by_geoscale(records: Vec<FlowRecord>, scale: GeoScale) -> Vec<FlowRecord> {
    records
        .into_iter()
        .filter(|r| GeoScale::of(&r.location) == Some(scale))
        .collect()
}
