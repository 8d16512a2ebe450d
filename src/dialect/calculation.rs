//! Calculation classification
//!
//! Recognises the aggregate shapes that have approximate or sketch
//! equivalents. Only a calculation that is exactly one top-level function
//! call is classified; anything else (arithmetic, nested expressions) is
//! treated as a plain aggregate and passed through untouched.

use std::fmt;

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::{char, multispace0, multispace1},
    combinator::peek,
    error::{Error as NomError, ErrorKind},
    IResult, Parser,
};
use serde::{Deserialize, Serialize};

/// Single-argument functions whose argument is cast to double before aggregation
pub const SAFE_CAST_TO_DOUBLE: &[&str] = &["stddev"];

/// Sketch family of a calculation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SketchKind {
    /// Plain aggregate
    None,
    /// `COUNT(DISTINCT x)`
    CountDistinct,
    /// `APPROX_PERCENTILE(x, p)`
    Decile,
}

impl SketchKind {
    /// Wire name used in fingerprints and metadata
    pub fn as_str(&self) -> &'static str {
        match self {
            SketchKind::None => "NONE",
            SketchKind::CountDistinct => "COUNT_DISTINCT",
            SketchKind::Decile => "DECILE",
        }
    }

    /// True for anything other than a plain aggregate
    pub fn is_sketch(&self) -> bool {
        !matches!(self, SketchKind::None)
    }
}

impl fmt::Display for SketchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recognised shape of a calculation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateShape<'a> {
    /// Anything without a sketch equivalent
    Plain,
    /// `COUNT(DISTINCT operand)`
    CountDistinct {
        /// Counted expression
        operand: &'a str,
    },
    /// `APPROX_PERCENTILE(operand, percentile)`
    Decile {
        /// Ranked expression
        operand: &'a str,
        /// Percentile literal, kept as written
        percentile: &'a str,
    },
}

impl AggregateShape<'_> {
    /// Sketch family of this shape
    pub fn sketch_kind(&self) -> SketchKind {
        match self {
            AggregateShape::Plain => SketchKind::None,
            AggregateShape::CountDistinct { .. } => SketchKind::CountDistinct,
            AggregateShape::Decile { .. } => SketchKind::Decile,
        }
    }
}

/// A single function call with its raw argument text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionCall<'a> {
    /// Function name as written
    pub name: &'a str,
    /// Text between the outer parentheses
    pub args: &'a str,
}

/// Classify a calculation
pub fn classify(calculation: &str) -> AggregateShape<'_> {
    let call = match single_call(calculation) {
        Some(call) => call,
        None => return AggregateShape::Plain,
    };

    if call.name.eq_ignore_ascii_case("COUNT") {
        if let Ok((operand, _)) = distinct_keyword(call.args) {
            let operand = operand.trim();
            if !operand.is_empty() {
                return AggregateShape::CountDistinct { operand };
            }
        }
    }

    if call.name.eq_ignore_ascii_case("APPROX_PERCENTILE") {
        let args = split_arguments(call.args);
        if let [operand, percentile] = args[..] {
            if !operand.is_empty() && !percentile.is_empty() {
                return AggregateShape::Decile {
                    operand,
                    percentile,
                };
            }
        }
    }

    AggregateShape::Plain
}

/// Sketch family of a calculation
pub fn sketch_kind(calculation: &str) -> SketchKind {
    classify(calculation).sketch_kind()
}

/// Parse text that is exactly one function call
pub fn single_call(input: &str) -> Option<FunctionCall<'_>> {
    match function_call(input) {
        Ok((rest, call)) if rest.is_empty() => Some(call),
        _ => None,
    }
}

/// Wrap the argument of an allow-listed single-argument function in a double cast
///
/// `stddev(latency)` becomes `stddev(CAST(latency as double))`. Other
/// expressions are returned unchanged.
pub fn safe_cast(expression: &str) -> String {
    if let Some(call) = single_call(expression) {
        let allowed = SAFE_CAST_TO_DOUBLE
            .iter()
            .any(|name| call.name.eq_ignore_ascii_case(name));
        let args = split_arguments(call.args);
        if allowed && args.len() == 1 && !args[0].is_empty() {
            return format!("{}(CAST({} as double))", call.name, args[0]);
        }
    }
    expression.trim().to_string()
}

/// Split argument text on top-level commas, trimming each argument
pub fn split_arguments(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in args.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(args[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(args[start..].trim());
    parts
}

fn function_call(input: &str) -> IResult<&str, FunctionCall<'_>> {
    let (input, _) = multispace0.parse(input)?;
    let (input, name) = take_while1(|c: char| c.is_alphanumeric() || c == '_').parse(input)?;
    let (input, _) = multispace0.parse(input)?;
    let (input, _) = char('(').parse(input)?;
    let (input, args) = balanced(input)?;
    let (input, _) = char(')').parse(input)?;
    let (input, _) = multispace0.parse(input)?;
    Ok((input, FunctionCall { name, args }))
}

fn distinct_keyword(input: &str) -> IResult<&str, &str> {
    let (input, _) = multispace0.parse(input)?;
    let (input, keyword) = tag_no_case("DISTINCT").parse(input)?;
    let (input, _) = alt((multispace1, peek(tag("(")))).parse(input)?;
    Ok((input, keyword))
}

/// Text up to the parenthesis that closes the current level
fn balanced(input: &str) -> IResult<&str, &str> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;

    for (i, c) in input.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') if depth == 0 => return Ok((&input[i..], &input[..i])),
            (None, ')') => depth -= 1,
            _ => {}
        }
    }

    Err(nom::Err::Error(NomError::new(input, ErrorKind::TakeUntil)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_distinct() {
        assert_eq!(
            classify("COUNT(DISTINCT device_id)"),
            AggregateShape::CountDistinct {
                operand: "device_id"
            }
        );
        assert_eq!(
            classify("count(distinct partnerid)"),
            AggregateShape::CountDistinct {
                operand: "partnerid"
            }
        );
        assert_eq!(
            classify("COUNT(DISTINCT(user_id))"),
            AggregateShape::CountDistinct {
                operand: "(user_id)"
            }
        );
    }

    #[test]
    fn test_plain_aggregates() {
        assert_eq!(classify("SUM(device_id)"), AggregateShape::Plain);
        assert_eq!(classify("COUNT(device_id)"), AggregateShape::Plain);
        assert_eq!(classify("COUNT(distinctive)"), AggregateShape::Plain);
        assert_eq!(classify("100.0 * COUNT(test)/COUNT(*)"), AggregateShape::Plain);
        assert_eq!(classify("COUNT(DISTINCT a) + 1"), AggregateShape::Plain);
    }

    #[test]
    fn test_decile() {
        assert_eq!(
            classify("APPROX_percentile(device_id, 0.5)"),
            AggregateShape::Decile {
                operand: "device_id",
                percentile: "0.5"
            }
        );
        assert_eq!(classify("approx_percentile(price)"), AggregateShape::Plain);
    }

    #[test]
    fn test_sketch_kind_names() {
        assert_eq!(sketch_kind("100.0 * COUNT(test)/COUNT(*)").as_str(), "NONE");
        assert_eq!(sketch_kind("COUNT(distinct partnerid)").as_str(), "COUNT_DISTINCT");
        assert_eq!(sketch_kind("approx_percentile(price, 0.5)").as_str(), "DECILE");
    }

    #[test]
    fn test_safe_cast() {
        assert_eq!(safe_cast("stddev(latency)"), "stddev(CAST(latency as double))");
        assert_eq!(safe_cast("STDDEV( latency )"), "STDDEV(CAST(latency as double))");
        assert_eq!(safe_cast("stddev(latency) / 2"), "stddev(latency) / 2");
        assert_eq!(safe_cast("avg(latency)"), "avg(latency)");
    }

    #[test]
    fn test_single_call_respects_quotes() {
        let call = single_call("max(coalesce(name, ')'))").unwrap();
        assert_eq!(call.name, "max");
        assert_eq!(call.args, "coalesce(name, ')')");
        assert_eq!(split_arguments("a, f(b, c), 'x,y'"), vec!["a", "f(b, c)", "'x,y'"]);
    }
}
