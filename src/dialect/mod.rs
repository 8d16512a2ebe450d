//! Per-backend aggregate expression resolution
//!
//! Each backend has its own spelling for approximate distinct counts and
//! percentiles, and its own serialisable sketch objects. A [`Dialect`]
//! rewrites one indicator calculation into the select item (and, for the
//! warehouse, the extra FROM fragment) that computes it.
//!
//! | Dialect   | Engine             | Sketch objects                  |
//! |-----------|--------------------|---------------------------------|
//! | Presto    | Athena / Trino     | HLL and qdigest, base64 encoded |
//! | Warehouse | Snowflake          | table-valued UDFs               |
//! | Embedded  | DuckDB over frames | exact values, base64 encoded    |

pub mod calculation;
pub mod embedded;
pub mod presto;
pub mod warehouse;

use serde::{Deserialize, Serialize};

pub use calculation::{classify, safe_cast, sketch_kind, AggregateShape, SketchKind};
pub use warehouse::WarehouseUdf;

use crate::assembler::indicator_column;
use crate::types::IndicatorId;

/// Dialect selector used in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    /// Athena-like engine
    Presto,
    /// Snowflake-like warehouse
    Warehouse,
    /// DuckDB-like local engine
    Embedded,
}

/// Target backend dialect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dialect {
    /// Athena-like engine
    Presto,
    /// Snowflake-like warehouse with sketch UDFs
    Warehouse(WarehouseUdf),
    /// DuckDB-like local engine
    Embedded,
}

/// One indicator's contribution to a fused query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedExpression {
    /// Indicator this expression computes
    pub indicator_id: IndicatorId,
    /// `<expr> as _indicator_<id>`
    pub select_item: String,
    /// Extra FROM fragment (warehouse sketch UDFs)
    pub from_fragment: Option<String>,
    /// The fused query must not carry a GROUP BY
    pub suppress_group_by: bool,
    /// Sketch family of the source calculation
    pub sketch: SketchKind,
}

impl Dialect {
    /// Selector for this dialect
    pub fn kind(&self) -> DialectKind {
        match self {
            Dialect::Presto => DialectKind::Presto,
            Dialect::Warehouse(_) => DialectKind::Warehouse,
            Dialect::Embedded => DialectKind::Embedded,
        }
    }

    /// Warehouse sketch UDFs cannot share a query with other aggregates
    pub fn requires_sketch_isolation(&self, sketch_mode: bool) -> bool {
        sketch_mode && matches!(self, Dialect::Warehouse(_))
    }

    /// Rewrite one calculation for this dialect
    pub fn resolve(
        &self,
        calculation: &str,
        indicator_id: IndicatorId,
        group_fields: &[String],
        sketch_mode: bool,
    ) -> ResolvedExpression {
        let shape = classify(calculation);
        let column = indicator_column(indicator_id);

        let (expression, from_fragment, suppress_group_by) = match self {
            Dialect::Presto => (presto::expression(calculation, shape, sketch_mode), None, false),
            Dialect::Embedded => (embedded::expression(calculation, shape, sketch_mode), None, false),
            Dialect::Warehouse(udf) => {
                let resolved = udf.expression(calculation, shape, group_fields, sketch_mode);
                let suppress = resolved.from_fragment.is_some();
                (resolved.select, resolved.from_fragment, suppress)
            }
        };

        ResolvedExpression {
            indicator_id,
            select_item: format!("{} as {}", safe_cast(&expression), column),
            from_fragment,
            suppress_group_by,
            sketch: shape.sketch_kind(),
        }
    }
}
