pub mod environment;
pub mod evaluator;
pub mod lexer;
pub mod parser;
pub mod pretty_print;
pub mod primitives;
pub mod source;
pub mod special_forms;
pub mod types;

pub use environment::{EnvError, Environment};
pub use evaluator::{
    DEFAULT_MAX_EVAL_DEPTH, EvalError, evaluate, evaluate_all, set_max_eval_depth,
};
pub use lexer::{LexerError, Token, TokenKind, tokenize};
pub use parser::{ParseError, Parser, parse_program, parse_str};
pub use source::Span;
pub use types::{Node, Procedure, Sexpr};
