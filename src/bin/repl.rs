use std::borrow::Cow;
use std::env;
use std::io;
use std::thread;

use log::{LevelFilter, debug};
use muscheme::environment::Env;
use muscheme::special_forms::special_form_identifiers;
use muscheme::{
    Environment, Sexpr, TokenKind, evaluate, parse_program, set_max_eval_depth, tokenize,
};
use rustyline::error::ReadlineError;
use rustyline::highlight::{CmdKind, Highlighter};
use rustyline::validate::{ValidationContext, ValidationResult, Validator};
use rustyline::{Cmd, Completer, Context, EditMode, Editor, EventHandler, KeyCode, KeyEvent, Modifiers};
use rustyline::{Helper, Highlighter, Hinter, Validator};
use simple_logger::SimpleLogger;

const DEFAULT_HISTORY_FILE: &str = ".muscheme_history";
const EVAL_STACK_SIZE: usize = 256 * 1024 * 1024;
const MAX_EVAL_DEPTH: usize = 10_000;

/// REPL settings read from `MUSCHEME_EDIT_MODE` and `MUSCHEME_HISTORY`.
struct ReplConfig {
    edit_mode: EditMode,
    history_file: String,
}

impl ReplConfig {
    fn from_env() -> Self {
        let edit_mode = match env::var("MUSCHEME_EDIT_MODE") {
            Ok(mode) if mode.eq_ignore_ascii_case("vi") => EditMode::Vi,
            _ => EditMode::Emacs,
        };
        let history_file =
            env::var("MUSCHEME_HISTORY").unwrap_or_else(|_| DEFAULT_HISTORY_FILE.to_string());
        ReplConfig {
            edit_mode,
            history_file,
        }
    }
}

struct MuschemeCompleter {
    env: Env,
}

impl rustyline::completion::Completer for MuschemeCompleter {
    type Candidate = String;
    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        let prefix = match tokenize(&line[..pos]) {
            Ok(tokens) => match tokens.last().map(|t| &t.kind) {
                Some(TokenKind::Symbol(prefix)) => prefix.clone(),
                _ => return Ok((pos, vec![])),
            },
            Err(_) => return Ok((pos, vec![])),
        };
        let mut candidates: Vec<String> = self
            .env
            .borrow()
            .get_identifiers()
            .union(&special_form_identifiers())
            .filter_map(|id| id.strip_prefix(prefix.as_str()).map(str::to_string))
            .collect();
        candidates.sort();
        Ok((pos, candidates))
    }
}

#[derive(Completer, Helper, Highlighter, Hinter, Validator)]
struct InputHelper {
    #[rustyline(Validator)]
    validator: ParenValidator,
    #[rustyline(Highlighter)]
    highlighter: ParenHighlighter,
    #[rustyline(Completer)]
    completer: MuschemeCompleter,
}

/// Tracks string and comment state while scanning a line of input.
#[derive(Default)]
struct Scanner {
    in_string: bool,
    escape: bool,
    in_comment: bool,
}

impl Scanner {
    /// Returns true when `c` is program text rather than part of a string
    /// or comment.
    fn is_code(&mut self, c: char) -> bool {
        if self.in_comment {
            if c == '\n' {
                self.in_comment = false;
            }
            return false;
        }
        if self.in_string {
            if self.escape {
                self.escape = false;
            } else if c == '\\' {
                self.escape = true;
            } else if c == '"' {
                self.in_string = false;
            }
            return false;
        }
        match c {
            '"' => {
                self.in_string = true;
                false
            }
            ';' => {
                self.in_comment = true;
                false
            }
            _ => true,
        }
    }
}

struct ParenValidator;

impl Validator for ParenValidator {
    fn validate(&self, ctx: &mut ValidationContext) -> rustyline::Result<ValidationResult> {
        let mut scanner = Scanner::default();
        let mut depth = 0usize;

        for (i, c) in ctx.input().chars().enumerate() {
            if !scanner.is_code(c) {
                continue;
            }
            match c {
                '(' => depth += 1,
                ')' => {
                    if depth == 0 {
                        return Ok(ValidationResult::Invalid(Some(format!(
                            "  - Unmatched ')' at position {}",
                            i
                        ))));
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }

        if scanner.in_string || depth > 0 {
            Ok(ValidationResult::Incomplete)
        } else {
            Ok(ValidationResult::Valid(None))
        }
    }
}

struct ParenHighlighter;

impl Highlighter for ParenHighlighter {
    fn highlight<'l>(&self, line: &'l str, pos: usize) -> Cow<'l, str> {
        let mut scanner = Scanner::default();
        let mut open: Vec<usize> = Vec::new();
        let mut highlighted = String::new();
        let cursor = pos.checked_sub(1);

        for (i, c) in line.chars().enumerate() {
            if !scanner.is_code(c) {
                if scanner.in_comment {
                    highlighted.push_str(&format!("\x1b[90m{}\x1b[0m", c)); // Grey for comments
                } else {
                    highlighted.push_str(&format!("\x1b[32m{}\x1b[0m", c)); // Green for strings
                }
                continue;
            }
            match c {
                '(' => {
                    open.push(highlighted.len());
                    highlighted.push(c);
                }
                ')' => match open.pop() {
                    Some(matching_pos) => {
                        if Some(i) == cursor {
                            highlighted.push_str("\x1b[34m)\x1b[0m");
                            highlighted
                                .replace_range(matching_pos..=matching_pos, "\x1b[1;34m(\x1b[0m");
                        } else {
                            highlighted.push(c);
                        }
                    }
                    None => highlighted.push_str("\x1b[31m)\x1b[0m"), // Red when unmatched
                },
                _ => highlighted.push(c),
            }
        }

        Cow::Owned(highlighted)
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _kind: CmdKind) -> bool {
        true
    }
}

fn main() -> rustyline::Result<()> {
    if let Err(err) = SimpleLogger::new()
        .with_level(LevelFilter::Warn)
        .env()
        .init()
    {
        eprintln!("Failed to initialise logging: {}", err);
    }

    // Deep non-tail recursion needs more stack than the main thread has.
    let handle = thread::Builder::new()
        .name("muscheme-repl".to_string())
        .stack_size(EVAL_STACK_SIZE)
        .spawn(run_repl)?;
    handle
        .join()
        .map_err(|_| io::Error::other("REPL thread panicked"))?
}

fn run_repl() -> rustyline::Result<()> {
    set_max_eval_depth(MAX_EVAL_DEPTH);
    println!("muscheme REPL v{}", env!("CARGO_PKG_VERSION"));
    println!("Type 'exit' or press Ctrl-D to quit.");

    let repl_config = ReplConfig::from_env();
    let global_env = Environment::new_global_populated();
    let helper = InputHelper {
        validator: ParenValidator,
        highlighter: ParenHighlighter,
        completer: MuschemeCompleter {
            env: global_env.clone(),
        },
    };
    let config = rustyline::config::Config::builder()
        .edit_mode(repl_config.edit_mode)
        .auto_add_history(true)
        .build();
    let mut rl = Editor::with_config(config)?;
    rl.set_helper(Some(helper));
    rl.bind_sequence(
        KeyEvent(KeyCode::Char('s'), Modifiers::CTRL),
        EventHandler::Simple(Cmd::Newline),
    );
    if rl.load_history(&repl_config.history_file).is_err() {
        debug!("No history at {}", repl_config.history_file);
    }

    loop {
        match rl.readline("muscheme> ") {
            Ok(line) => {
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                if input.eq_ignore_ascii_case("exit") {
                    break;
                }
                let expressions = match parse_program(input) {
                    Ok(expressions) => expressions,
                    Err(err) => {
                        err.pretty_print("repl", input);
                        continue;
                    }
                };
                for expr in &expressions {
                    match evaluate(expr, &global_env) {
                        Ok(result) => {
                            if !matches!(result.kind, Sexpr::Void) {
                                println!("{}", result);
                            }
                        }
                        Err(err) => {
                            err.pretty_print("repl", input);
                            break;
                        }
                    }
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("Interrupted. Type 'exit' or Ctrl-D to quit.");
            }
            Err(ReadlineError::Eof) => {
                println!("\nExiting.");
                break;
            }
            Err(err) => {
                eprintln!("Readline Error: {:?}", err);
                break;
            }
        }
    }
    rl.save_history(&repl_config.history_file)
}
