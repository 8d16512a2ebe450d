//! Fingerprints: grouping keys built from canonical hashes
//!
//! ```text
//! dataset_id _ [sketch_type _] hash(group_fields) _ hash(filter) _ lookback _ hash(interval)
//! ```
//!
//! Two requests that share a fingerprint can be answered by the same query.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::canonical::list::hash_list;
use crate::canonical::predicate::hash_predicate;
use crate::error::ParseError;
use crate::types::IndicatorRequest;

/// Default fingerprint separator
pub const DEFAULT_SEPARATOR: &str = "_";

/// Grouping key for requests that can share one query
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw fingerprint inputs
#[derive(Debug, Clone, Copy, Default)]
pub struct FingerprintParts<'a> {
    /// Dataset identifier, rendered as text
    pub dataset_id: &'a str,
    /// Optional isolation component
    pub sketch_type: Option<&'a str>,
    /// Comma-separated group-by columns
    pub group_fields: &'a str,
    /// Filter predicate
    pub filter: &'a str,
    /// Lookback window, rendered as text
    pub lookback_window: &'a str,
    /// Evaluation interval
    pub evaluation_interval: &'a str,
}

/// Builds fingerprints with a fixed separator
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    separator: String,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATOR)
    }
}

impl Fingerprinter {
    /// Create a fingerprinter with the given separator
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }

    /// Separator in use
    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// Fingerprint raw parts
    ///
    /// Fails only when the filter is not a valid predicate.
    pub fn fingerprint(&self, parts: &FingerprintParts<'_>) -> Result<Fingerprint, ParseError> {
        let group_hash = hash_list(parts.group_fields);
        let filter_hash = hash_predicate(parts.filter)?;
        let interval_hash = hash_list(parts.evaluation_interval);

        let mut components = Vec::with_capacity(6);
        components.push(parts.dataset_id);
        if let Some(sketch) = parts.sketch_type {
            components.push(sketch);
        }
        components.push(&group_hash);
        components.push(&filter_hash);
        components.push(parts.lookback_window);
        components.push(&interval_hash);

        Ok(Fingerprint(components.join(&self.separator)))
    }

    /// Fingerprint a request, optionally with an isolation component
    pub fn fingerprint_request(
        &self,
        request: &IndicatorRequest,
        sketch_type: Option<&str>,
    ) -> Result<Fingerprint, ParseError> {
        let dataset_id = request.dataset_id.to_string();
        let lookback_window = request.lookback_window.to_string();
        let group_fields = request.group_fields.join(",");

        self.fingerprint(&FingerprintParts {
            dataset_id: &dataset_id,
            sketch_type,
            group_fields: &group_fields,
            filter: &request.filter,
            lookback_window: &lookback_window,
            evaluation_interval: &request.evaluation_interval,
        })
    }
}
