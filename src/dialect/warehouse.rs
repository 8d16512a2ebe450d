//! Snowflake-like dialect
//!
//! Distinct-count sketches come from table-valued UDFs installed in a
//! configurable database and schema:
//!
//! ```text
//! SELECT to_char("db"."schema".hll_merge(array_agg(to_char(_sketch_ab12cd34.sketch, 'base64'))), 'base64') as _indicator_1, ...
//! FROM (SELECT * FROM (<dataset>) WHERE <window and filter>),
//!      table("db"."schema".hllpp_count_strings_sketch(device_id::string)) as _sketch_ab12cd34
//! ```
//!
//! A UDF expression supplies its own FROM fragment and the fused query then
//! carries no GROUP BY: grouping happens through the UDF's partitioning.

use crate::canonical::sha1_hex;
use crate::dialect::calculation::AggregateShape;

/// Location of the sketch UDFs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseUdf {
    database: String,
    schema: String,
}

/// Select expression plus optional FROM fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WarehouseExpression {
    pub select: String,
    pub from_fragment: Option<String>,
}

impl WarehouseUdf {
    /// Create a UDF location; surrounding double quotes are normalised
    pub fn new(database: impl AsRef<str>, schema: impl AsRef<str>) -> Self {
        Self {
            database: quote_identifier(database.as_ref()),
            schema: quote_identifier(schema.as_ref()),
        }
    }

    /// Fully qualified UDF name
    pub fn qualified(&self, function: &str) -> String {
        format!("{}.{}.{}", self.database, self.schema, function)
    }

    pub(crate) fn expression(
        &self,
        calculation: &str,
        shape: AggregateShape<'_>,
        group_fields: &[String],
        sketch_mode: bool,
    ) -> WarehouseExpression {
        let select = match (shape, sketch_mode) {
            (AggregateShape::CountDistinct { operand }, true) => {
                return self.distinct_sketch(operand, group_fields);
            }
            (AggregateShape::CountDistinct { operand }, false) => {
                format!("approx_count_distinct({})", operand)
            }
            (AggregateShape::Decile { operand, .. }, true) => {
                format!("approx_percentile_accumulate({})", operand)
            }
            (AggregateShape::Decile { operand, percentile }, false) => {
                format!("approx_percentile({},{})", operand, percentile)
            }
            (AggregateShape::Plain, _) => calculation.trim().to_string(),
        };

        WarehouseExpression {
            select,
            from_fragment: None,
        }
    }

    fn distinct_sketch(&self, operand: &str, group_fields: &[String]) -> WarehouseExpression {
        // Identical operands share one table function within a query
        let alias = format!("_sketch_{}", &sha1_hex(operand)[..8]);
        let sketch_udf = self.qualified("hllpp_count_strings_sketch");

        if group_fields.is_empty() {
            WarehouseExpression {
                select: format!(
                    "to_char({}(array_agg(to_char({}.sketch, 'base64'))), 'base64')",
                    self.qualified("hll_merge"),
                    alias
                ),
                from_fragment: Some(format!(
                    "table({}({}::string)) as {}",
                    sketch_udf, operand, alias
                )),
            }
        } else {
            WarehouseExpression {
                select: format!("to_char({}.sketch,'base64')", alias),
                from_fragment: Some(format!(
                    "table({}({}::string) OVER (PARTITION BY {})) as {}",
                    sketch_udf,
                    operand,
                    group_fields.join(","),
                    alias
                )),
            }
        }
    }
}

fn quote_identifier(name: &str) -> String {
    let bare = name.trim();
    let bare = bare.strip_prefix('"').unwrap_or(bare);
    let bare = bare.strip_suffix('"').unwrap_or(bare);
    format!("\"{}\"", bare)
}
