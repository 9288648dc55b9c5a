use crate::{EnvError, EvalError, ParseError};
use ariadne::{Color, Label, Report, ReportKind, Source};
use log::warn;
use std::ops::Range;

fn print_report(source_id: &str, input: &str, range: Range<usize>, message: String, label: String) {
    let result = Report::build(ReportKind::Error, (source_id, range.clone()))
        .with_message(message)
        .with_label(
            Label::new((source_id, range))
                .with_message(label)
                .with_color(Color::Red),
        )
        .finish()
        .eprint((source_id, Source::from(input)));
    if let Err(err) = result {
        warn!("Failed to render diagnostic: {}", err);
    }
}

impl EvalError {
    /// Headline and label text for a diagnostic.
    fn describe(&self) -> (String, String) {
        match self {
            EvalError::EnvError(EnvError::UnboundName(name, _)) => (
                format!("Unbound name `{}`", name),
                "This name is not bound in any enclosing frame".to_string(),
            ),
            EvalError::MalformedCombination(sexpr, _) => (
                format!("Malformed combination: {}", sexpr),
                "A combination must be a proper list".to_string(),
            ),
            EvalError::NotApplicable(sexpr, _) => (
                format!("Not applicable: {}", sexpr),
                format!("A {} cannot be called as a procedure", sexpr.type_name()),
            ),
            EvalError::ArityMismatch(message, _) => {
                ("Wrong number of arguments".to_string(), message.clone())
            }
            EvalError::InvalidSpecialForm(message, _) => (
                format!("Invalid special form: {}", message),
                "This special form is malformed or incomplete".to_string(),
            ),
            EvalError::TypeMismatch {
                expected, found, ..
            } => (
                "Type mismatch".to_string(),
                format!("Expected {}, found {}", expected, found.type_name()),
            ),
            EvalError::InvalidArguments(message, _) => {
                ("Invalid arguments".to_string(), message.clone())
            }
            EvalError::UserError(message, _) => (
                format!("Error: {}", message),
                "Raised here".to_string(),
            ),
            EvalError::RecursionDepthExceeded(limit, _) => (
                format!("Maximum recursion depth of {} exceeded", limit),
                "Nested evaluation went this deep without returning".to_string(),
            ),
        }
    }

    pub fn pretty_print(&self, source_id: &str, input: &str) {
        let (message, label) = self.describe();
        print_report(source_id, input, self.span().to_range(), message, label);
    }
}

impl ParseError {
    pub fn pretty_print(&self, source_id: &str, input: &str) {
        let (range, message, label) = match self {
            ParseError::UnexpectedToken { found, expected } => (
                found.span.to_range(),
                format!("Unexpected token: {}", found.kind),
                format!("Expected {expected}"),
            ),
            ParseError::UnexpectedEof(expected) => {
                let end = input.len();
                (
                    end.saturating_sub(1)..end,
                    "Unexpected end of input".to_string(),
                    format!("Expected {expected}"),
                )
            }
            ParseError::LexerError(lex_err) => (
                lex_err.span.to_range(),
                "Lexer Error".to_string(),
                lex_err.error.to_string(),
            ),
            ParseError::InvalidDotSyntax(span) => (
                span.to_range(),
                "Invalid Dot Syntax".to_string(),
                "Unexpected dot".to_string(),
            ),
        };
        print_report(source_id, input, range, message, label);
    }
}
