//! Compute families
//!
//! A compute family is the set of requests that can be answered by a single
//! query: same fingerprint, same evaluation time, same tenant.
//!
//! ```text
//!   requests ──fingerprint──> (fingerprint, evaluation_time, tenant) ──> ComputeFamily
//!                                                                         ├─ shared fields (first member)
//!                                                                         └─ [(calculation, indicator_id), ...]
//! ```
//!
//! Shared fields (dataset query, timestamp column, filter text) are taken
//! from the first member. Members whose own text differs only in ways the
//! fingerprint considers equivalent are folded in silently; a differing
//! dataset query or timestamp column is logged.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::canonical::{Fingerprint, Fingerprinter};
use crate::dialect::calculation::sketch_kind;
use crate::error::ParseError;
use crate::types::{IndicatorId, IndicatorRequest};

/// Isolation component for plain aggregates
pub const NO_SKETCH: &str = "NONE";

/// Grouping key of a compute family
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FamilyKey {
    /// Canonical fingerprint of the shared fields
    pub fingerprint: Fingerprint,
    /// Evaluation time in epoch seconds
    pub evaluation_time: i64,
    /// Owning tenant
    pub tenant_id: String,
}

/// One indicator inside a family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyMember {
    /// Aggregate expression
    pub calculation: String,
    /// Indicator identifier
    pub indicator_id: IndicatorId,
}

/// Requests that share one query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeFamily {
    /// Grouping key
    pub key: FamilyKey,
    /// Source sub-query with the statement terminator removed
    pub dataset_query: String,
    /// Group-by columns
    pub group_fields: Vec<String>,
    /// Filter predicate
    pub filter: String,
    /// Timestamp column, possibly empty
    pub timestamp_field: String,
    /// Evaluation time in epoch seconds
    pub evaluation_time: i64,
    /// Lookback window in seconds
    pub lookback_window: i64,
    /// Members in first-seen order
    pub members: Vec<FamilyMember>,
}

impl ComputeFamily {
    fn from_representative(key: FamilyKey, request: &IndicatorRequest) -> Self {
        Self {
            key,
            dataset_query: request.source_query().to_string(),
            group_fields: request.group_fields.clone(),
            filter: request.filter.trim().to_string(),
            timestamp_field: request.timestamp_field.trim().to_string(),
            evaluation_time: request.evaluation_time,
            lookback_window: request.lookback_window,
            members: Vec::new(),
        }
    }

    /// Indicator ids in member order
    pub fn indicator_ids(&self) -> Vec<IndicatorId> {
        self.members.iter().map(|m| m.indicator_id).collect()
    }

    /// Lower bound (inclusive) of the evaluation window
    pub fn lookback_start(&self) -> i64 {
        self.evaluation_time - self.lookback_window
    }
}

/// Isolation component for a request
///
/// An explicit sketch type wins. Otherwise plain aggregates share `NONE`
/// and each sketch calculation is keyed by its own text.
pub fn isolation_component(request: &IndicatorRequest) -> String {
    if let Some(sketch) = &request.sketch_type {
        return sketch.clone();
    }
    if sketch_kind(&request.calculation).is_sketch() {
        request.calculation.trim().to_string()
    } else {
        NO_SKETCH.to_string()
    }
}

/// Partitions request batches into compute families
#[derive(Debug, Clone, Default)]
pub struct FamilyGrouper {
    fingerprinter: Fingerprinter,
    sketch_isolation: bool,
}

impl FamilyGrouper {
    /// Create a grouper
    pub fn new(fingerprinter: Fingerprinter, sketch_isolation: bool) -> Self {
        Self {
            fingerprinter,
            sketch_isolation,
        }
    }

    /// Whether sketch calculations are isolated into their own families
    pub fn sketch_isolation(&self) -> bool {
        self.sketch_isolation
    }

    /// Fingerprint of one request under this grouper's settings
    pub fn fingerprint(&self, request: &IndicatorRequest) -> Result<Fingerprint, ParseError> {
        if self.sketch_isolation {
            let sketch = isolation_component(request);
            self.fingerprinter.fingerprint_request(request, Some(&sketch))
        } else {
            self.fingerprinter
                .fingerprint_request(request, request.sketch_type.as_deref())
        }
    }

    /// Group a batch into families, in order of first appearance
    ///
    /// Any malformed filter fails the whole batch before anything is dispatched.
    pub fn group(&self, requests: &[IndicatorRequest]) -> Result<Vec<ComputeFamily>, ParseError> {
        let mut families: Vec<ComputeFamily> = Vec::new();
        let mut index: HashMap<FamilyKey, usize> = HashMap::new();

        for request in requests {
            let key = FamilyKey {
                fingerprint: self.fingerprint(request)?,
                evaluation_time: request.evaluation_time,
                tenant_id: request.tenant_id.clone(),
            };

            let position = match index.get(&key) {
                Some(&position) => {
                    warn_on_divergence(&families[position], request);
                    position
                }
                None => {
                    families.push(ComputeFamily::from_representative(key.clone(), request));
                    index.insert(key, families.len() - 1);
                    families.len() - 1
                }
            };

            families[position].members.push(FamilyMember {
                calculation: request.calculation.clone(),
                indicator_id: request.id,
            });
        }

        debug!(
            requests = requests.len(),
            families = families.len(),
            "Grouped requests into compute families"
        );
        Ok(families)
    }
}

fn warn_on_divergence(family: &ComputeFamily, request: &IndicatorRequest) {
    if family.dataset_query != request.source_query() {
        warn!(
            indicator_id = request.id,
            fingerprint = %family.key.fingerprint,
            "Dataset query differs from family representative; using representative"
        );
    }
    if family.timestamp_field != request.timestamp_field.trim() {
        warn!(
            indicator_id = request.id,
            fingerprint = %family.key.fingerprint,
            "Timestamp field differs from family representative; using representative"
        );
    }
}
