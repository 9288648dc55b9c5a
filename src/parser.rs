use crate::Span;
use crate::lexer::{LexerError, Token, TokenKind};
use crate::types::{Node, Sexpr};
use std::iter::Peekable;
use std::vec::IntoIter;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("Parse Error [at {}]: Unexpected token '{}', expected {expected}", .found.span, .found.kind)]
    UnexpectedToken { found: Token, expected: String },
    #[error("Parse Error: Unexpected end of input. Expected {0}")]
    UnexpectedEof(String),
    #[error("Lexer Error: {0}")]
    LexerError(#[from] LexerError),
    #[error("Parse Error: Invalid syntax for dotted pair at [{0}]")]
    InvalidDotSyntax(Span),
}

impl ParseError {
    /// Source location of the error, if it has one. End-of-input errors do not.
    pub fn span(&self) -> Option<Span> {
        match self {
            ParseError::UnexpectedToken { found, .. } => Some(found.span),
            ParseError::UnexpectedEof(_) => None,
            ParseError::LexerError(lex_err) => Some(lex_err.span),
            ParseError::InvalidDotSyntax(span) => Some(*span),
        }
    }
}

type ParseResult<T> = Result<T, ParseError>;

pub struct Parser {
    tokens: Peekable<IntoIter<Token>>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens: tokens.into_iter().peekable(),
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        self.tokens.next()
    }

    pub fn is_at_end(&mut self) -> bool {
        self.tokens.peek().is_none()
    }

    /// Parses a single datum starting with `token`.
    pub fn parse_expr_with_token(&mut self, token: Option<Token>) -> ParseResult<Node> {
        let Some(token) = token else {
            return Err(ParseError::UnexpectedEof("an expression".to_string()));
        };
        match token.kind {
            TokenKind::LParen => self.parse_list(token.span),
            TokenKind::Quote => self.parse_quoted_expr("quote", token.span),
            TokenKind::QuasiQuote => self.parse_quoted_expr("quasiquote", token.span),
            TokenKind::Unquote => self.parse_quoted_expr("unquote", token.span),
            TokenKind::UnquoteSplicing => self.parse_quoted_expr("unquote-splicing", token.span),
            TokenKind::Dot => Err(ParseError::InvalidDotSyntax(token.span)),
            _ => self.parse_atom(token),
        }
    }

    pub fn parse_expr(&mut self) -> ParseResult<Node> {
        let token = self.next_token();
        self.parse_expr_with_token(token)
    }

    fn parse_atom(&mut self, token: Token) -> ParseResult<Node> {
        let kind = match token.kind {
            TokenKind::Symbol(s) => Sexpr::Symbol(s),
            TokenKind::Number(n) => Sexpr::Number(n),
            TokenKind::Boolean(b) => Sexpr::Boolean(b),
            TokenKind::String(s) => Sexpr::String(s),
            _ => {
                return Err(ParseError::UnexpectedToken {
                    found: token,
                    expected: "an atom or '(' or '''".to_string(),
                });
            }
        };
        Ok(Node::new(kind, token.span))
    }

    /// Parses the rest of a list after its opening paren.
    ///
    /// Elements are collected first and the pairs built back to front, so
    /// long lists do not recurse once per element. Each pair spans from its
    /// car to the closing paren; the outermost starts at the opening paren.
    fn parse_list(&mut self, lparen_span: Span) -> ParseResult<Node> {
        let mut items = Vec::new();
        let (tail, end) = loop {
            match self.next_token() {
                Some(Token {
                    kind: TokenKind::RParen,
                    span,
                }) => {
                    let nil_span = if items.is_empty() {
                        lparen_span.merge(&span)
                    } else {
                        span
                    };
                    break (Node::new_nil(nil_span), span.end);
                }
                Some(Token {
                    kind: TokenKind::Dot,
                    span,
                }) => {
                    if items.is_empty() {
                        return Err(ParseError::InvalidDotSyntax(span));
                    }
                    let cdr_node = self.parse_expr()?;
                    match self.next_token() {
                        Some(Token {
                            kind: TokenKind::RParen,
                            span: rparen_span,
                        }) => break (cdr_node, rparen_span.end),
                        Some(found) => {
                            return Err(ParseError::UnexpectedToken {
                                found,
                                expected: "')' after dotted pair".to_string(),
                            });
                        }
                        None => {
                            return Err(ParseError::UnexpectedEof(
                                "')' after dotted pair".to_string(),
                            ));
                        }
                    }
                }
                Some(token) => items.push(self.parse_expr_with_token(Some(token))?),
                None => return Err(ParseError::UnexpectedEof("')'".to_string())),
            }
        };

        Ok(items
            .into_iter()
            .enumerate()
            .rev()
            .fold(tail, |cdr, (index, car)| {
                let start = if index == 0 {
                    lparen_span.start
                } else {
                    car.span.start
                };
                Node::new_pair(car, cdr, Span::new(start, end))
            }))
    }

    /// Parses `'expr` and friends into `(quote expr)` style lists.
    fn parse_quoted_expr(&mut self, quote_symbol: &str, quote_span: Span) -> ParseResult<Node> {
        let quoted_expr = self.parse_expr()?;
        Ok(Node::new_quoted_expr(quoted_expr, quote_symbol, quote_span))
    }

    /// Parses exactly one datum, rejecting trailing tokens.
    pub fn parse(mut self) -> ParseResult<Node> {
        let expr = self.parse_expr()?;
        match self.next_token() {
            Some(found) => Err(ParseError::UnexpectedToken {
                found,
                expected: "end of input".to_string(),
            }),
            None => Ok(expr),
        }
    }

    /// Parses every top-level datum until the tokens run out.
    pub fn parse_all(mut self) -> ParseResult<Vec<Node>> {
        let mut expressions = Vec::new();
        while !self.is_at_end() {
            expressions.push(self.parse_expr()?);
        }
        Ok(expressions)
    }
}

/// Lexes and parses a single datum.
pub fn parse_str(input: &str) -> ParseResult<Node> {
    let tokens = crate::lexer::tokenize(input)?;
    Parser::new(tokens).parse()
}

/// Lexes and parses a whole program: zero or more top-level data.
pub fn parse_program(input: &str) -> ParseResult<Vec<Node>> {
    let tokens = crate::lexer::tokenize(input)?;
    Parser::new(tokens).parse_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::LexerErrorKind;

    fn assert_parse(input: &str, expected: Node) {
        match parse_str(input) {
            Ok(result) => assert_eq!(result, expected, "Input: '{}'", input),
            Err(e) => panic!("Parsing failed for input '{}': {}", input, e),
        }
    }

    // Compares enum variants only
    fn assert_parse_error(input: &str, expected_error_variant: ParseError) {
        match parse_str(input) {
            Ok(result) => panic!(
                "Expected parsing to fail for input '{}', but got: {:?}",
                input, result
            ),
            Err(e) => {
                assert_eq!(
                    std::mem::discriminant(&e),
                    std::mem::discriminant(&expected_error_variant),
                    "Input: '{}', Expected error variant like {:?}, got: {:?}",
                    input,
                    expected_error_variant,
                    e
                );
            }
        }
    }

    fn assert_parsed_sexpr_string(input: &str, expected_output: &str) {
        let node = match parse_str(input) {
            Ok(result) => result,
            Err(e) => panic!("Parsing failed for input '{}': {}", input, e),
        };
        assert_eq!(node.to_string(), expected_output, "Input: '{}'", input);
    }

    fn node_number(n: f64, start: usize, end: usize) -> Node {
        Node::new_number(n, Span::new(start, end))
    }

    fn node_bool(b: bool, start: usize, end: usize) -> Node {
        Node::new_bool(b, Span::new(start, end))
    }

    fn node_string(s: &str, start: usize, end: usize) -> Node {
        Node::new_string(s, Span::new(start, end))
    }

    fn node_nil(start: usize, end: usize) -> Node {
        Node::new_nil(Span::new(start, end))
    }

    fn node_symbol(s: &str, start: usize, end: usize) -> Node {
        Node::new_symbol(s.to_string(), Span::new(start, end))
    }

    fn node_pair(car: Node, cdr: Node, start: usize, end: usize) -> Node {
        Node::new_pair(car, cdr, Span::new(start, end))
    }

    fn node_list(nodes: &[Node], start: usize, end: usize) -> Node {
        match nodes {
            [] => node_nil(end - 1, end),
            [last] => node_pair(last.clone(), node_nil(end - 1, end), start, end),
            [first, rest @ ..] => node_pair(
                first.clone(),
                node_list(rest, rest[0].span.start, end),
                start,
                end,
            ),
        }
    }

    fn dummy_token() -> Token {
        Token {
            kind: TokenKind::RParen,
            span: Span::default(),
        }
    }

    #[test]
    fn test_parse_atoms() {
        assert_parse("123", node_number(123.0, 0, 3));
        assert_parse("-4.5", node_number(-4.5, 0, 4));
        assert_parse("mu", node_symbol("mu", 0, 2));
        assert_parse("+", node_symbol("+", 0, 1));
        assert_parse("#t", node_bool(true, 0, 2));
        assert_parse(
            r#""with \"quotes\"""#,
            node_string("with \"quotes\"", 0, 17),
        );
    }

    #[test]
    fn test_parse_empty_list() {
        assert_parse("()", node_nil(0, 2));
        assert_parse("( )", node_nil(0, 3));
    }

    #[test]
    fn test_parse_simple_list() {
        assert_parse(
            "(+ 10 20)",
            node_list(
                &[
                    node_symbol("+", 1, 2),
                    node_number(10.0, 3, 5),
                    node_number(20.0, 6, 8),
                ],
                0,
                9,
            ),
        );
    }

    #[test]
    fn test_parse_dotted_list() {
        assert_parse(
            "(1 . 2)",
            node_pair(node_number(1.0, 1, 2), node_number(2.0, 5, 6), 0, 7),
        );
        assert_parse(
            "(1 2 . 3)",
            node_pair(
                node_number(1.0, 1, 2),
                node_pair(node_number(2.0, 3, 4), node_number(3.0, 7, 8), 3, 9),
                0,
                9,
            ),
        );
    }

    #[test]
    fn test_parse_nested_list() {
        assert_parse(
            "(a (b c) d)",
            node_list(
                &[
                    node_symbol("a", 1, 2),
                    node_list(&[node_symbol("b", 4, 5), node_symbol("c", 6, 7)], 3, 8),
                    node_symbol("d", 9, 10),
                ],
                0,
                11,
            ),
        );
        assert_parse(
            "(()())",
            node_list(&[node_nil(1, 3), node_nil(3, 5)], 0, 6),
        );
    }

    #[test]
    fn test_parse_quote_sugar() {
        assert_parse(
            "'a",
            Node::new_quote(node_symbol("a", 1, 2), Span::new(0, 1)),
        );
        assert_parse("'()", Node::new_quote(node_nil(1, 3), Span::new(0, 1)));
        assert_parse(
            "(list 'a 'b)",
            node_list(
                &[
                    node_symbol("list", 1, 5),
                    Node::new_quote(node_symbol("a", 7, 8), Span::new(6, 7)),
                    Node::new_quote(node_symbol("b", 10, 11), Span::new(9, 10)),
                ],
                0,
                12,
            ),
        );
    }

    #[test]
    fn test_parse_quasiquote_family() {
        assert_parsed_sexpr_string("`(a ,b ,@c)", "(quasiquote (a (unquote b) (unquote-splicing c)))");
        assert_parsed_sexpr_string(
            "`(a ,`(b ,c) d)",
            "(quasiquote (a (unquote (quasiquote (b (unquote c)))) d))",
        );
        assert_parsed_sexpr_string("`(a . ,b)", "(quasiquote (a unquote b))");
    }

    #[test]
    fn test_parse_lambda_and_mu_forms() {
        assert_parsed_sexpr_string(
            "(mu (x . rest) (f x) rest)",
            "(mu (x . rest) (f x) rest)",
        );
        assert_parsed_sexpr_string("(lambda args args)", "(lambda args args)");
    }

    #[test]
    fn test_parse_errors() {
        assert_parse_error("(1 2", ParseError::UnexpectedEof(String::new()));
        assert_parse_error("(", ParseError::UnexpectedEof(String::new()));
        assert_parse_error("", ParseError::UnexpectedEof(String::new()));
        assert_parse_error("'", ParseError::UnexpectedEof(String::new()));
        assert_parse_error(",@", ParseError::UnexpectedEof(String::new()));
        assert_parse_error(
            ")",
            ParseError::UnexpectedToken {
                found: dummy_token(),
                expected: String::new(),
            },
        );
        assert_parse_error(
            "(1))",
            ParseError::UnexpectedToken {
                found: dummy_token(),
                expected: String::new(),
            },
        );
        assert_parse_error(
            "(1 . 2 3)",
            ParseError::UnexpectedToken {
                found: dummy_token(),
                expected: String::new(),
            },
        );
    }

    #[test]
    fn test_parse_invalid_dot() {
        assert_parse_error("( . 1)", ParseError::InvalidDotSyntax(Span::default()));
        assert_parse_error(".", ParseError::InvalidDotSyntax(Span::default()));
        let err = parse_str("(. a)").unwrap_err();
        assert_eq!(err.span(), Some(Span::new(1, 2)));
    }

    #[test]
    fn test_parse_lexer_error_propagation() {
        let err = parse_str("(1 \"abc").unwrap_err();
        match err {
            ParseError::LexerError(LexerError { error, .. }) => {
                assert_eq!(error, LexerErrorKind::UnterminatedString)
            }
            other => panic!("Expected a lexer error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_program_multiple_data() {
        let nodes = parse_program("(define x 1) ; set up\n x 'y").expect("parse failed");
        let rendered: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
        assert_eq!(rendered, vec!["(define x 1)", "x", "(quote y)"]);
        assert!(parse_program("  ; nothing here\n").unwrap().is_empty());
        assert!(parse_program("(a) (b").is_err());
    }

    #[test]
    fn test_parse_long_list_is_iterative() {
        let source = format!("({})", "1 ".repeat(10_000));
        let node = parse_str(&source).expect("parse failed");
        assert_eq!(node.iter().count(), 10_000);
    }
}
