//! DuckDB-like dialect for locally registered frames
//!
//! Queries run against an in-process frame registered as `df`, so the
//! dataset query's table reference is rewritten before assembly. The
//! assembled statement then goes through a small adaptation pass for
//! Postgres-isms the engine does not accept.

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use crate::dialect::calculation::AggregateShape;

/// Name under which the source frame is registered
pub const FRAME_NAME: &str = "df";

lazy_static! {
    /// `FROM <table>` where table may be qualified and quoted
    static ref FROM_TABLE: Regex = Regex::new(
        r#"(?i)(\bEXTRACT\s*\(\s*\w+\s+)?\bFROM\s+((?:"[^"]+"|[A-Za-z_][\w$]*)(?:\.(?:"[^"]+"|[A-Za-z_][\w$]*))*)"#
    )
    .expect("valid FROM regex");

    /// `EPOCH FROM <column>`
    static ref EPOCH_FROM: Regex =
        Regex::new(r#"(?i)\bEPOCH\s+FROM\s+("[^"]+"|[A-Za-z_][\w.$]*)"#).expect("valid EPOCH regex");
}

/// Expression for one calculation, without alias
pub(crate) fn expression(calculation: &str, shape: AggregateShape<'_>, sketch_mode: bool) -> String {
    match (shape, sketch_mode) {
        (AggregateShape::CountDistinct { operand }, true) => format!(
            "TO_BASE64(CAST(CAST(COUNT(DISTINCT {}) AS varchar) AS bytea))",
            operand
        ),
        (AggregateShape::CountDistinct { operand }, false) => {
            format!("COUNT(DISTINCT {})", operand)
        }
        (AggregateShape::Decile { operand, percentile }, true) => format!(
            "TO_BASE64(CAST(PERCENTILE_CONT({}) WITHIN GROUP (ORDER BY {}) AS bytea))",
            percentile, operand
        ),
        (AggregateShape::Decile { operand, percentile }, false) => {
            format!("approx_quantile({}, {})", operand, percentile)
        }
        (AggregateShape::Plain, _) => calculation.trim().to_string(),
    }
}

/// Point every table reference of the dataset query at the registered frame
///
/// Also unquotes the `"T"` date-format separator, which only dataset
/// queries carry.
pub fn retarget_dataset_query(dataset_query: &str) -> String {
    FROM_TABLE
        .replace_all(dataset_query, |caps: &Captures<'_>| {
            if caps.get(1).is_some() {
                caps[0].to_string()
            } else {
                format!("FROM {}", FRAME_NAME)
            }
        })
        .replace("\"T\"", "T")
}

/// Rewrite an assembled statement for the embedded engine
///
/// Makes epoch extraction tolerant of text columns. Applying the pass twice
/// changes nothing.
pub fn adapt_statement(statement: &str) -> String {
    EPOCH_FROM
        .replace_all(statement, |caps: &Captures<'_>| {
            let column = &caps[1];
            if column.eq_ignore_ascii_case("TRY_CAST") {
                caps[0].to_string()
            } else {
                format!("EPOCH FROM TRY_CAST({} AS DATE)", column)
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;

    #[test]
    fn test_sketch_mode() {
        let resolved = Dialect::Embedded.resolve("COUNT(DISTINCT user_id)", 1, &[], true);
        assert_eq!(
            resolved.select_item,
            "TO_BASE64(CAST(CAST(COUNT(DISTINCT user_id) AS varchar) AS bytea)) as _indicator_1"
        );
        let resolved = Dialect::Embedded.resolve("approx_percentile(price, 0.25)", 2, &[], true);
        assert_eq!(
            resolved.select_item,
            "TO_BASE64(CAST(PERCENTILE_CONT(0.25) WITHIN GROUP (ORDER BY price) AS bytea)) as _indicator_2"
        );
    }

    #[test]
    fn test_value_mode() {
        let resolved = Dialect::Embedded.resolve("COUNT(DISTINCT user_id)", 1, &[], false);
        assert_eq!(resolved.select_item, "COUNT(DISTINCT user_id) as _indicator_1");
        let resolved = Dialect::Embedded.resolve("approx_percentile(price, 0.25)", 2, &[], false);
        assert_eq!(resolved.select_item, "approx_quantile(price, 0.25) as _indicator_2");
    }

    #[test]
    fn test_retarget_dataset_query() {
        assert_eq!(
            retarget_dataset_query("SELECT a, b FROM \"raw\".events WHERE a > 1"),
            "SELECT a, b FROM df WHERE a > 1"
        );
        assert_eq!(
            retarget_dataset_query("SELECT EXTRACT(EPOCH FROM created_at) AS ts FROM events"),
            "SELECT EXTRACT(EPOCH FROM created_at) AS ts FROM df"
        );
        assert_eq!(
            retarget_dataset_query("SELECT * FROM (SELECT 1)"),
            "SELECT * FROM (SELECT 1)"
        );
        assert_eq!(
            retarget_dataset_query("SELECT strptime(d, '%Y-%m-%d\"T\"%H') AS ts FROM events"),
            "SELECT strptime(d, '%Y-%m-%dT%H') AS ts FROM df"
        );
    }

    #[test]
    fn test_adapt_statement() {
        let statement = "SELECT T as \"T\", EXTRACT(EPOCH FROM created_at) AS ts FROM df";
        let adapted = adapt_statement(statement);
        assert_eq!(
            adapted,
            "SELECT T as \"T\", EXTRACT(EPOCH FROM TRY_CAST(created_at AS DATE)) AS ts FROM df"
        );
        assert_eq!(adapt_statement(&adapted), adapted);
    }
}
