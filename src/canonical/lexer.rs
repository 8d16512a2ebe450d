//! Tokenizer for predicate text
//!
//! Splits a WHERE-clause fragment into contiguous tokens. Every byte of the
//! input belongs to exactly one token, so any run of tokens maps back to a
//! verbatim slice of the original text.

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_while1},
    character::complete::{char, multispace1},
    combinator::{map, recognize},
    multi::many0,
    IResult, Parser,
};

use crate::error::ParseError;

/// Token categories recognised by the predicate lexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Whitespace,
    Quoted,
    Operator,
    OpenParen,
    CloseParen,
    Comma,
    Word,
}

/// A token and its byte offset into the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub offset: usize,
}

impl Token<'_> {
    /// Case-insensitive keyword match on bare words
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    /// `AND` or `OR`
    pub fn is_connective(&self) -> bool {
        self.is_keyword("AND") || self.is_keyword("OR")
    }

    /// End offset (exclusive) of this token
    pub fn end(&self) -> usize {
        self.offset + self.text.len()
    }
}

/// Tokenize predicate text
pub(crate) fn tokenize(input: &str) -> Result<Vec<Token<'_>>, ParseError> {
    let mut tokens = Vec::new();
    let mut rest = input;

    while !rest.is_empty() {
        let offset = input.len() - rest.len();
        match token(rest) {
            Ok((remaining, (kind, text))) => {
                tokens.push(Token { kind, text, offset });
                rest = remaining;
            }
            Err(_) => {
                let message = match rest.chars().next() {
                    Some(quote @ ('\'' | '"' | '`')) => format!("unterminated {} quote", quote),
                    Some(other) => format!("unexpected character '{}'", other),
                    None => "unexpected end of input".to_string(),
                };
                return Err(ParseError::new(offset, message));
            }
        }
    }

    Ok(tokens)
}

fn token(input: &str) -> IResult<&str, (TokenKind, &str)> {
    alt((
        map(multispace1, |t| (TokenKind::Whitespace, t)),
        map(quoted, |t| (TokenKind::Quoted, t)),
        map(operator, |t| (TokenKind::Operator, t)),
        map(tag("("), |t| (TokenKind::OpenParen, t)),
        map(tag(")"), |t| (TokenKind::CloseParen, t)),
        map(tag(","), |t| (TokenKind::Comma, t)),
        map(take_while1(is_word_char), |t| (TokenKind::Word, t)),
    ))
    .parse(input)
}

/// Single-quoted strings use `''` as an escaped quote
fn quoted(input: &str) -> IResult<&str, &str> {
    alt((
        recognize((char('\''), many0(alt((tag("''"), is_not("'")))), char('\''))),
        recognize((char('"'), many0(is_not("\"")), char('"'))),
        recognize((char('`'), many0(is_not("`")), char('`'))),
    ))
    .parse(input)
}

fn operator(input: &str) -> IResult<&str, &str> {
    alt((
        tag("<>"),
        tag("!="),
        tag(">="),
        tag("<="),
        tag("="),
        tag("<"),
        tag(">"),
    ))
    .parse(input)
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || "_.$:*+-/%@#|".contains(c)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_simple_comparison() {
        use TokenKind::*;
        assert_eq!(
            kinds("A >= 1"),
            vec![Word, Whitespace, Operator, Whitespace, Word]
        );
    }

    #[test]
    fn test_tokens_cover_input() {
        let input = "(X = 12 OR WQWE = 'qwe') AND Y  > 12";
        let tokens = tokenize(input).unwrap();
        let rebuilt: String = tokens.iter().map(|t| t.text).collect();
        assert_eq!(rebuilt, input);
        for pair in tokens.windows(2) {
            assert_eq!(pair[0].end(), pair[1].offset);
        }
    }

    #[test]
    fn test_escaped_single_quote() {
        let tokens = tokenize("name = 'it''s'").unwrap();
        assert_eq!(tokens.last().unwrap().text, "'it''s'");
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Quoted);
    }

    #[test]
    fn test_double_quoted_identifier() {
        let tokens = tokenize("\"deviceid\" = 'x'").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Quoted);
        assert_eq!(tokens[0].text, "\"deviceid\"");
    }

    #[test]
    fn test_unterminated_quote() {
        let err = tokenize("A = 'abc").unwrap_err();
        assert_eq!(err.position, 4);
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn test_unknown_character() {
        let err = tokenize("A = 1 ; B").unwrap_err();
        assert_eq!(err.position, 6);
    }

    #[test]
    fn test_keywords_are_case_insensitive() {
        let tokens = tokenize("a and b Or c").unwrap();
        assert!(tokens[2].is_connective());
        assert!(tokens[6].is_connective());
        assert!(!tokens[0].is_connective());
    }
}
