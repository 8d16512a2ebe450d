//! Result demultiplexing
//!
//! Maps a fused statement, or the rows it produced, back to the indicators
//! it was built from. The patterns here are a contract with
//! [`assembler`](crate::assembler): every indicator is projected as
//! `... as _indicator_<id>` and the evaluation time as
//! `<seconds> as _lookback_range_end_ts`.

use std::collections::{BTreeMap, HashSet};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use super::ResultRow;
use crate::assembler::{
    INDICATOR_COLUMN_PREFIX, LOOKBACK_RANGE_END_TS, LOOKBACK_RANGE_START_TS, RESERVED_COLUMNS,
    RESULT_MAX_TS, RESULT_MIN_TS,
};
use crate::types::{IndicatorId, IndicatorStatus, StatusMetadata};

lazy_static! {
    static ref INDICATOR_ALIAS: Regex = Regex::new(r"(?i)\bas\s+_indicator_(\d+)").unwrap();
    static ref LOOKBACK_END: Regex =
        Regex::new(r"(?i)(\d+)\s+as\s+_lookback_range_end_ts").unwrap();
}

/// Indicators and evaluation time recovered from statement text
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryIndicators {
    /// Indicator ids in projection order, without duplicates
    pub indicator_ids: Vec<IndicatorId>,
    /// Lookback-range end in epoch milliseconds
    pub evaluation_time_ms: Option<i64>,
}

impl QueryIndicators {
    /// One status per indicator, all carrying the same metadata
    ///
    /// `fallback_ms` is used when the statement carried no lookback literal.
    pub fn statuses(&self, fallback_ms: i64, metadata: &StatusMetadata) -> Vec<IndicatorStatus> {
        let evaluation_time = self.evaluation_time_ms.unwrap_or(fallback_ms);
        self.indicator_ids
            .iter()
            .map(|&indicator_id| IndicatorStatus {
                indicator_id,
                evaluation_time,
                metadata: metadata.clone(),
            })
            .collect()
    }
}

/// Extract indicator ids and the evaluation time from statement text
pub fn parse_query_indicators(query: &str) -> QueryIndicators {
    let mut seen = HashSet::new();
    let indicator_ids = INDICATOR_ALIAS
        .captures_iter(query)
        .filter_map(|caps| caps[1].parse::<IndicatorId>().ok())
        .filter(|id| seen.insert(*id))
        .collect();

    let evaluation_time_ms = LOOKBACK_END
        .captures(query)
        .and_then(|caps| caps[1].parse::<i64>().ok())
        .map(|seconds| seconds * 1000);

    QueryIndicators {
        indicator_ids,
        evaluation_time_ms,
    }
}

/// Statuses for every indicator named in a statement
///
/// Statements assembled without a timestamp field carry no lookback
/// literal; `fallback_ms` supplies the evaluation time for those.
pub fn statuses_from_query(
    query: &str,
    fallback_ms: Option<i64>,
    metadata: &StatusMetadata,
) -> Vec<IndicatorStatus> {
    let parsed = parse_query_indicators(query);
    if parsed.evaluation_time_ms.is_none() && fallback_ms.is_none() && !parsed.indicator_ids.is_empty() {
        warn!(
            indicators = parsed.indicator_ids.len(),
            "Statement has no lookback range literal; reporting evaluation time 0"
        );
    }
    parsed.statuses(fallback_ms.unwrap_or(0), metadata)
}

/// One indicator value from one result row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorValue {
    /// Indicator identifier
    pub indicator_id: IndicatorId,
    /// Evaluation time in epoch milliseconds
    pub evaluation_time: Option<i64>,
    /// Group column to value
    pub group_values: BTreeMap<String, Value>,
    /// The aggregate (or encoded sketch)
    pub value: Value,
    /// Earliest timestamp seen
    pub result_min_ts: Value,
    /// Latest timestamp seen
    pub result_max_ts: Value,
    /// Window start, epoch seconds
    pub lookback_range_start_ts: Option<i64>,
    /// Window end, epoch seconds
    pub lookback_range_end_ts: Option<i64>,
}

/// Lowercase reserved and indicator column names
///
/// Some warehouses return identifiers upper-cased.
pub fn normalize_row(row: &ResultRow) -> ResultRow {
    row.iter()
        .map(|(column, value)| {
            let lower = column.to_ascii_lowercase();
            let key = if RESERVED_COLUMNS.contains(&lower.as_str())
                || lower.starts_with(INDICATOR_COLUMN_PREFIX)
            {
                lower
            } else {
                column.clone()
            };
            (key, value.clone())
        })
        .collect()
}

/// Split result rows into per-indicator values
///
/// Values come out row by row, ascending indicator id within a row.
pub fn demux_rows(rows: &[ResultRow], group_fields: &[String]) -> Vec<IndicatorValue> {
    let mut values = Vec::new();

    for raw in rows {
        let row = normalize_row(raw);
        let group_values: BTreeMap<String, Value> = group_fields
            .iter()
            .map(|field| (field.clone(), lookup(&row, field).cloned().unwrap_or(Value::Null)))
            .collect();

        let end = row.get(LOOKBACK_RANGE_END_TS).and_then(as_i64);
        let start = row.get(LOOKBACK_RANGE_START_TS).and_then(as_i64);
        let min_ts = row.get(RESULT_MIN_TS).cloned().unwrap_or(Value::Null);
        let max_ts = row.get(RESULT_MAX_TS).cloned().unwrap_or(Value::Null);

        let indicators: BTreeMap<IndicatorId, &Value> = row
            .iter()
            .filter_map(|(column, value)| {
                column
                    .strip_prefix(INDICATOR_COLUMN_PREFIX)
                    .and_then(|id| id.parse().ok())
                    .map(|id| (id, value))
            })
            .collect();

        for (indicator_id, value) in indicators {
            values.push(IndicatorValue {
                indicator_id,
                evaluation_time: end.map(|s| s * 1000),
                group_values: group_values.clone(),
                value: value.clone(),
                result_min_ts: min_ts.clone(),
                result_max_ts: max_ts.clone(),
                lookback_range_start_ts: start,
                lookback_range_end_ts: end,
            });
        }
    }

    values
}

fn lookup<'a>(row: &'a ResultRow, field: &str) -> Option<&'a Value> {
    row.get(field).or_else(|| {
        row.iter()
            .find(|(column, _)| column.eq_ignore_ascii_case(field))
            .map(|(_, value)| value)
    })
}

// Backends return numbers as JSON numbers or as strings
fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
