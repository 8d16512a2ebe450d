//! Athena-like dialect
//!
//! Sketches are HyperLogLog (`APPROX_SET`) and quantile digests
//! (`qdigest_agg`), serialised to base64 so they can be merged downstream.

use crate::dialect::calculation::AggregateShape;

/// Expression for one calculation, without alias
pub(crate) fn expression(calculation: &str, shape: AggregateShape<'_>, sketch_mode: bool) -> String {
    match (shape, sketch_mode) {
        (AggregateShape::CountDistinct { operand }, true) => {
            format!("to_base64(CAST(APPROX_SET({}) as varbinary))", operand)
        }
        (AggregateShape::CountDistinct { operand }, false) => {
            format!("approx_distinct({})", operand)
        }
        (AggregateShape::Decile { operand, .. }, true) => {
            format!("to_base64(CAST(qdigest_agg({}) as varbinary))", operand)
        }
        (AggregateShape::Decile { operand, percentile }, false) => {
            format!("approx_percentile({},{})", operand, percentile)
        }
        (AggregateShape::Plain, _) => calculation.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;

    #[test]
    fn test_sketch_mode() {
        let resolved = Dialect::Presto.resolve("COUNT(DISTINCT device_id)", 1, &[], true);
        assert_eq!(
            resolved.select_item,
            "to_base64(CAST(APPROX_SET(device_id) as varbinary)) as _indicator_1"
        );

        let resolved = Dialect::Presto.resolve("APPROX_PERCENTILE(price, 0.9)", 2, &[], true);
        assert_eq!(
            resolved.select_item,
            "to_base64(CAST(qdigest_agg(price) as varbinary)) as _indicator_2"
        );
    }

    #[test]
    fn test_value_mode() {
        let resolved = Dialect::Presto.resolve("count(distinct device_id)", 1, &[], false);
        assert_eq!(resolved.select_item, "approx_distinct(device_id) as _indicator_1");

        let resolved = Dialect::Presto.resolve("approx_percentile(price, 0.5)", 2, &[], false);
        assert_eq!(resolved.select_item, "approx_percentile(price,0.5) as _indicator_2");
    }

    #[test]
    fn test_plain_passthrough() {
        let resolved = Dialect::Presto.resolve(" 100.0 * COUNT(x)/COUNT(*) ", 9, &[], true);
        assert_eq!(resolved.select_item, "100.0 * COUNT(x)/COUNT(*) as _indicator_9");
    }
}
