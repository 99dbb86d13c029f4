//! Core domain model and eligibility rules for vacmon.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "vacmon-core";

/// One published teaching position as reported by the upstream listing API.
///
/// `id`, `district`, `level` and `area_codes` drive filtering and
/// deduplication; every other field is carried through untouched for the
/// notification message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VacancyRecord {
    /// Stable identifier assigned by the upstream source. The same vacancy
    /// keeps the same id across polls.
    pub id: String,
    pub position: String,
    pub position_description: String,
    /// Area/incumbency codes, normalized. A candidate must hold at least one.
    pub area_codes: BTreeSet<String>,
    pub level: String,
    pub district: String,
    pub school: String,
    pub address: String,
    pub shift: String,
    pub workload: String,
    pub start_date: Option<String>,
    pub offer_closes: Option<String>,
    /// Weekday -> assigned hours, only days that have any.
    pub schedule: BTreeMap<String, String>,
    pub replaced_teacher: Option<String>,
    pub replacement_reason: Option<String>,
}

impl VacancyRecord {
    /// A record without a stable upstream id cannot be deduplicated.
    pub fn has_valid_id(&self) -> bool {
        !self.id.trim().is_empty()
    }
}

/// Allowed district and level values, fixed for the duration of a run.
///
/// Matching is exact string equality against the values the upstream source
/// provides; no normalization is applied here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCriteria {
    pub districts: BTreeSet<String>,
    pub levels: BTreeSet<String>,
}

impl FilterCriteria {
    pub fn new<D, L>(districts: D, levels: L) -> Self
    where
        D: IntoIterator,
        D::Item: Into<String>,
        L: IntoIterator,
        L::Item: Into<String>,
    {
        Self {
            districts: districts.into_iter().map(Into::into).collect(),
            levels: levels.into_iter().map(Into::into).collect(),
        }
    }
}

/// The user's oblea credential codes, normalized once at load time and
/// immutable for the rest of the run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityCodes {
    codes: BTreeSet<String>,
}

impl EligibilityCodes {
    pub fn new<I>(codes: I) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Self {
            codes: codes
                .into_iter()
                .map(|c| normalize_code(c.as_ref()))
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains(&normalize_code(code))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.codes.iter().map(String::as_str)
    }
}

/// Canonical form for comparing oblea codes: trimmed, uppercased.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Decides whether a single vacancy qualifies under the configured criteria
/// and the user's code set. Pure; callers count and log rejects themselves.
///
/// A record missing `district` or `level` is ineligible, not an error.
/// Code matching is match-any: one shared code with the oblea is enough,
/// and a vacancy listing no codes at all can never match.
pub fn is_eligible(
    record: &VacancyRecord,
    criteria: &FilterCriteria,
    codes: &EligibilityCodes,
) -> bool {
    if record.district.is_empty() || record.level.is_empty() {
        return false;
    }
    if !criteria.districts.contains(&record.district) {
        return false;
    }
    if !criteria.levels.contains(&record.level) {
        return false;
    }
    record.area_codes.iter().any(|code| codes.contains(code))
}
