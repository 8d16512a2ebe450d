//! Predicate canonicalization
//!
//! Turns a boolean WHERE-clause fragment into a normal form where sibling
//! terms joined by `AND`/`OR` are sorted, so that filters which differ only
//! in the order of their terms hash to the same value.
//!
//! # Normal form
//!
//! ```text
//!   "B = 2 AND (Y > 1 OR X = 1)"
//!        |
//!        v  parse
//!   Group[ Term("B = 2"), " AND ", Group[ "(", Term("Y > 1"), " OR ", Term("X = 1"), ")" ] ]
//!        |
//!        v  render children first, sort siblings by byte order
//!   "(X = 1 OR Y > 1) AND B = 2"
//! ```
//!
//! Terms are kept verbatim, including any `NOT`, `IS NOT`, `NOT IN` or
//! `NOT BETWEEN` they contain, so negation always moves with its comparison.
//! The literal text between siblings (connectives and whitespace) stays in
//! place. Only the siblings themselves are permuted.

use crate::canonical::lexer::{tokenize, Token, TokenKind};
use crate::canonical::sha1_hex;
use crate::error::ParseError;

/// Keywords that may follow a left operand
const COMPARISON_KEYWORDS: &[&str] = &["BETWEEN", "ILIKE", "IN", "IS", "LIKE", "NOT", "RLIKE"];

/// Keywords that cannot end a comparison
const DANGLING_KEYWORDS: &[&str] = &[
    "AND", "BETWEEN", "ILIKE", "IN", "IS", "LIKE", "NOT", "RLIKE",
];

/// Canonical string for a predicate
///
/// Whitespace-only input yields an empty string.
pub fn canonical_predicate(predicate: &str) -> Result<String, ParseError> {
    if predicate.trim().is_empty() {
        return Ok(String::new());
    }

    let mut parser = PredicateParser::new(predicate)?;
    let root = parser.parse()?;
    Ok(root.render())
}

/// SHA-1 (lowercase hex) of the canonical predicate
///
/// Empty or whitespace-only predicates hash to `""` without invoking SHA-1.
pub fn hash_predicate(predicate: &str) -> Result<String, ParseError> {
    let canonical = canonical_predicate(predicate)?;
    if canonical.is_empty() {
        return Ok(String::new());
    }
    Ok(sha1_hex(&canonical))
}

/// Parsed predicate tree borrowing from the source text
#[derive(Debug, Clone, PartialEq, Eq)]
enum Node<'a> {
    /// A single comparison, kept verbatim
    Term(&'a str),
    /// Children interleaved with the literal text around them
    Group(Vec<Piece<'a>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece<'a> {
    Literal(&'a str),
    Child(Node<'a>),
}

impl Node<'_> {
    fn render(&self) -> String {
        match self {
            Node::Term(text) => (*text).to_string(),
            Node::Group(pieces) => {
                let mut children: Vec<String> = pieces
                    .iter()
                    .filter_map(|piece| match piece {
                        Piece::Child(node) => Some(node.render()),
                        Piece::Literal(_) => None,
                    })
                    .collect();
                children.sort();

                let mut sorted = children.into_iter();
                let mut out = String::new();
                for piece in pieces {
                    match piece {
                        Piece::Literal(text) => out.push_str(text),
                        Piece::Child(_) => {
                            if let Some(child) = sorted.next() {
                                out.push_str(&child);
                            }
                        }
                    }
                }
                out
            }
        }
    }
}

/// Recursive-descent parser over the token stream
struct PredicateParser<'a> {
    input: &'a str,
    tokens: Vec<Token<'a>>,
    pos: usize,
}

impl<'a> PredicateParser<'a> {
    fn new(input: &'a str) -> Result<Self, ParseError> {
        Ok(Self {
            input,
            tokens: tokenize(input)?,
            pos: 0,
        })
    }

    fn parse(&mut self) -> Result<Node<'a>, ParseError> {
        let pieces = self.sequence()?;
        if let Some(token) = self.peek() {
            return Err(ParseError::new(token.offset, "unmatched ')'"));
        }
        Ok(Node::Group(pieces))
    }

    fn peek(&self) -> Option<Token<'a>> {
        self.tokens.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(t) if t.kind == TokenKind::Whitespace) {
            self.pos += 1;
        }
    }

    /// Source text covered by tokens `from..to`
    fn span(&self, from: usize, to: usize) -> &'a str {
        if from >= to {
            return "";
        }
        &self.input[self.tokens[from].offset..self.tokens[to - 1].end()]
    }

    /// Items joined by connectives, up to a closing parenthesis or end of input
    fn sequence(&mut self) -> Result<Vec<Piece<'a>>, ParseError> {
        let mut pieces = Vec::new();
        let mut items = 0usize;

        loop {
            let start = self.pos;
            self.skip_whitespace();

            let mut connective = None;
            if items > 0 {
                match self.peek() {
                    Some(token) if token.is_connective() => {
                        connective = Some(token);
                        self.pos += 1;
                        self.skip_whitespace();
                    }
                    Some(token) if token.kind != TokenKind::CloseParen => {
                        return Err(ParseError::new(
                            token.offset,
                            format!("expected AND or OR before '{}'", token.text),
                        ));
                    }
                    _ => {}
                }
            }

            if self.pos > start {
                pieces.push(Piece::Literal(self.span(start, self.pos)));
            }

            match self.peek() {
                None => {
                    if let Some(token) = connective {
                        return Err(ParseError::new(token.offset, "dangling connective"));
                    }
                    break;
                }
                Some(token) if token.kind == TokenKind::CloseParen => {
                    if let Some(token) = connective {
                        return Err(ParseError::new(token.offset, "dangling connective"));
                    }
                    break;
                }
                Some(_) => {}
            }

            pieces.push(Piece::Child(self.item()?));
            items += 1;
        }

        Ok(pieces)
    }

    fn item(&mut self) -> Result<Node<'a>, ParseError> {
        let token = match self.peek() {
            Some(token) => token,
            None => return Err(ParseError::new(self.input.len(), "expected a comparison")),
        };

        if token.kind == TokenKind::OpenParen && !self.parenthesis_starts_term() {
            return self.parenthesized();
        }

        if token.is_keyword("NOT") {
            let mut next = self.pos + 1;
            while matches!(self.tokens.get(next), Some(t) if t.kind == TokenKind::Whitespace) {
                next += 1;
            }
            if matches!(self.tokens.get(next), Some(t) if t.kind == TokenKind::OpenParen) {
                let prefix = self.span(self.pos, next);
                self.pos = next;
                let inner = self.parenthesized()?;
                return Ok(Node::Group(vec![Piece::Literal(prefix), Piece::Child(inner)]));
            }
        }

        self.term()
    }

    /// `(a + b) > 3` is an operand, not a sub-expression
    fn parenthesis_starts_term(&self) -> bool {
        let mut depth = 0usize;
        let mut index = self.pos;
        while let Some(token) = self.tokens.get(index) {
            match token.kind {
                TokenKind::OpenParen => depth += 1,
                TokenKind::CloseParen => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            index += 1;
        }
        if depth != 0 {
            return false;
        }

        let next = self.tokens[index + 1..]
            .iter()
            .find(|t| t.kind != TokenKind::Whitespace);
        match next {
            Some(t) if t.kind == TokenKind::Operator => true,
            Some(t) => COMPARISON_KEYWORDS.iter().any(|kw| t.is_keyword(kw)),
            None => false,
        }
    }

    fn parenthesized(&mut self) -> Result<Node<'a>, ParseError> {
        let open = match self.peek() {
            Some(token) if token.kind == TokenKind::OpenParen => token,
            Some(token) => return Err(ParseError::new(token.offset, "expected '('")),
            None => return Err(ParseError::new(self.input.len(), "expected '('")),
        };

        let mut pieces = vec![Piece::Literal(open.text)];
        self.pos += 1;

        let inner = self.sequence()?;
        if !inner.iter().any(|p| matches!(p, Piece::Child(_))) {
            let message = match self.peek() {
                Some(close) if close.kind == TokenKind::CloseParen => "empty parentheses",
                _ => "unbalanced parenthesis",
            };
            return Err(ParseError::new(open.offset, message));
        }
        pieces.extend(inner);

        match self.peek() {
            Some(close) if close.kind == TokenKind::CloseParen => {
                pieces.push(Piece::Literal(close.text));
                self.pos += 1;
                Ok(Node::Group(pieces))
            }
            _ => Err(ParseError::new(open.offset, "unbalanced parenthesis")),
        }
    }

    /// A comparison: tokens up to the next top-level connective or unmatched `)`
    ///
    /// The `AND` of `BETWEEN a AND b` belongs to the comparison. Trailing
    /// whitespace is left for the surrounding literal.
    fn term(&mut self) -> Result<Node<'a>, ParseError> {
        let start = self.pos;
        let mut end = start;
        let mut depth = 0usize;
        let mut open_between: Option<Token<'a>> = None;

        while let Some(token) = self.peek() {
            match token.kind {
                TokenKind::OpenParen => depth += 1,
                TokenKind::CloseParen => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
                TokenKind::Comma if depth == 0 => {
                    return Err(ParseError::new(token.offset, "unexpected ','"));
                }
                TokenKind::Word if depth == 0 => {
                    if token.is_keyword("BETWEEN") {
                        open_between = Some(token);
                    } else if token.is_connective() {
                        if open_between.is_some() && token.is_keyword("AND") {
                            open_between = None;
                        } else {
                            break;
                        }
                    }
                }
                _ => {}
            }
            if token.kind != TokenKind::Whitespace {
                end = self.pos + 1;
            }
            self.pos += 1;
        }

        if depth > 0 {
            return Err(ParseError::new(
                self.tokens[start].offset,
                "unbalanced parenthesis",
            ));
        }
        self.pos = end;

        if end == start {
            let offset = self.peek().map_or(self.input.len(), |t| t.offset);
            return Err(ParseError::new(offset, "expected a comparison"));
        }
        if let Some(between) = open_between {
            return Err(ParseError::new(between.offset, "BETWEEN without AND"));
        }

        let first = self.tokens[start];
        if first.kind == TokenKind::Operator {
            return Err(ParseError::new(
                first.offset,
                format!("missing left operand for '{}'", first.text),
            ));
        }
        let last = self.tokens[end - 1];
        let dangling = last.kind == TokenKind::Operator
            || DANGLING_KEYWORDS.iter().any(|kw| last.is_keyword(kw));
        if dangling {
            return Err(ParseError::new(
                last.offset,
                format!("missing right operand for '{}'", last.text),
            ));
        }

        Ok(Node::Term(self.span(start, end)))
    }
}
