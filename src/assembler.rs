//! Fused query assembly
//!
//! Builds one statement per compute family:
//!
//! ```sql
//! SELECT country as "country",
//!        SUM(x) as _indicator_1, approx_distinct(u) as _indicator_2,
//!        MIN(ts) as _result_min_ts, MAX(ts) as _result_max_ts,
//!        1654646400 as _lookback_range_end_ts, 1654642800 as _lookback_range_start_ts
//! FROM (<dataset query>)
//! WHERE ts >= 1654642800 AND ts < 1654646400 AND (<filter>)
//! GROUP BY country
//! ```
//!
//! The `_indicator_<id>` aliases and the `_lookback_range_end_ts` literal are
//! what the demultiplexer reads back, so their spelling is fixed.

use tracing::debug;

use crate::dialect::{embedded, Dialect, ResolvedExpression};
use crate::family::ComputeFamily;
use crate::types::{strip_statement_terminator, IndicatorId};

/// Prefix of per-indicator output columns
pub const INDICATOR_COLUMN_PREFIX: &str = "_indicator_";
/// Earliest timestamp seen in the window
pub const RESULT_MIN_TS: &str = "_result_min_ts";
/// Latest timestamp seen in the window
pub const RESULT_MAX_TS: &str = "_result_max_ts";
/// Window end literal (the evaluation time)
pub const LOOKBACK_RANGE_END_TS: &str = "_lookback_range_end_ts";
/// Window start literal
pub const LOOKBACK_RANGE_START_TS: &str = "_lookback_range_start_ts";

/// Time-metadata columns every fused query carries when it has a timestamp field
pub const RESERVED_COLUMNS: &[&str] = &[
    RESULT_MIN_TS,
    RESULT_MAX_TS,
    LOOKBACK_RANGE_END_TS,
    LOOKBACK_RANGE_START_TS,
];

/// Output column of an indicator
pub fn indicator_column(indicator_id: IndicatorId) -> String {
    format!("{}{}", INDICATOR_COLUMN_PREFIX, indicator_id)
}

/// Time-metadata select items
///
/// When raw timestamps are not available (warehouse sketch UDFs), the
/// observed min/max are replaced by the window bounds.
pub fn time_metadata_columns(
    timestamp_field: &str,
    evaluation_time: i64,
    lookback_window: i64,
    window_bounds_only: bool,
) -> String {
    let start = evaluation_time - lookback_window;
    let (min, max) = if window_bounds_only {
        (start.to_string(), evaluation_time.to_string())
    } else {
        (
            format!("MIN({})", timestamp_field),
            format!("MAX({})", timestamp_field),
        )
    };
    format!(
        "{} as {}, {} as {}, {} as {}, {} as {}",
        min,
        RESULT_MIN_TS,
        max,
        RESULT_MAX_TS,
        evaluation_time,
        LOOKBACK_RANGE_END_TS,
        start,
        LOOKBACK_RANGE_START_TS
    )
}

/// A statement ready for dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FusedQuery {
    /// Statement text
    pub sql: String,
    /// Indicators computed by the statement, in select order
    pub indicator_ids: Vec<IndicatorId>,
    /// Evaluation time in epoch seconds
    pub evaluation_time: i64,
    /// Group-by columns, for result demultiplexing
    pub group_fields: Vec<String>,
}

/// Builds fused statements for one dialect
#[derive(Debug, Clone)]
pub struct QueryAssembler {
    dialect: Dialect,
    sketch_mode: bool,
}

impl QueryAssembler {
    /// Create an assembler
    pub fn new(dialect: Dialect, sketch_mode: bool) -> Self {
        Self {
            dialect,
            sketch_mode,
        }
    }

    /// Target dialect
    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    /// Whether sketch objects are emitted instead of approximate values
    pub fn sketch_mode(&self) -> bool {
        self.sketch_mode
    }

    /// Resolve every member of a family
    pub fn resolve(&self, family: &ComputeFamily) -> Vec<ResolvedExpression> {
        family
            .members
            .iter()
            .map(|member| {
                self.dialect.resolve(
                    &member.calculation,
                    member.indicator_id,
                    &family.group_fields,
                    self.sketch_mode,
                )
            })
            .collect()
    }

    /// Assemble the fused statement for a family
    pub fn assemble(&self, family: &ComputeFamily) -> FusedQuery {
        let resolved = self.resolve(family);
        let suppress_group_by = resolved.iter().any(|r| r.suppress_group_by);

        let mut fragments: Vec<&str> = Vec::new();
        for fragment in resolved.iter().filter_map(|r| r.from_fragment.as_deref()) {
            if !fragments.contains(&fragment) {
                fragments.push(fragment);
            }
        }

        let mut select: Vec<String> = family
            .group_fields
            .iter()
            .map(|field| group_projection(field))
            .collect();
        select.extend(resolved.iter().map(|r| r.select_item.clone()));
        if !family.timestamp_field.is_empty() {
            select.push(time_metadata_columns(
                &family.timestamp_field,
                family.evaluation_time,
                family.lookback_window,
                suppress_group_by,
            ));
        }

        let source = match self.dialect {
            Dialect::Embedded => embedded::retarget_dataset_query(&family.dataset_query),
            _ => family.dataset_query.clone(),
        };
        let where_clause = where_clause(family);

        let mut sql = format!("SELECT {} FROM ", select.join(","));
        if suppress_group_by {
            match &where_clause {
                Some(predicate) => {
                    sql.push_str(&format!("(SELECT * FROM ({}) WHERE {})", source, predicate))
                }
                None => sql.push_str(&format!("({})", source)),
            }
            for fragment in &fragments {
                sql.push_str(", ");
                sql.push_str(fragment);
            }
        } else {
            sql.push_str(&format!("({})", source));
            for fragment in &fragments {
                sql.push_str(", ");
                sql.push_str(fragment);
            }
            if let Some(predicate) = &where_clause {
                sql.push_str(" WHERE ");
                sql.push_str(predicate);
            }
            if !family.group_fields.is_empty() {
                sql.push_str(" GROUP BY ");
                sql.push_str(&family.group_fields.join(","));
            }
        }

        let mut sql = strip_statement_terminator(&sql).to_string();
        if let Dialect::Embedded = self.dialect {
            sql = embedded::adapt_statement(&sql);
        }

        debug!(
            fingerprint = %family.key.fingerprint,
            indicators = family.members.len(),
            "Assembled fused query: {}",
            sql
        );

        FusedQuery {
            sql,
            indicator_ids: family.indicator_ids(),
            evaluation_time: family.evaluation_time,
            group_fields: family.group_fields.clone(),
        }
    }
}

fn group_projection(field: &str) -> String {
    let field = field.trim();
    format!("{} as \"{}\"", field, field)
}

/// Window predicate plus filter; the filter is parenthesised when combined
fn where_clause(family: &ComputeFamily) -> Option<String> {
    let filter = family.filter.trim();
    if !family.timestamp_field.is_empty() {
        let ts = &family.timestamp_field;
        let mut predicate = format!(
            "{} >= {} AND {} < {}",
            ts,
            family.lookback_start(),
            ts,
            family.evaluation_time
        );
        if !filter.is_empty() {
            predicate.push_str(&format!(" AND ({})", filter));
        }
        Some(predicate)
    } else if !filter.is_empty() {
        Some(filter.to_string())
    } else {
        None
    }
}
