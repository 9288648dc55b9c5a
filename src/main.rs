use log::{LevelFilter, debug, error};
use muscheme::{Environment, Sexpr, evaluate, parse_program, set_max_eval_depth};
use simple_logger::SimpleLogger;
use std::env;
use std::fs;
use std::process::ExitCode;
use std::thread;

const EVAL_STACK_SIZE: usize = 256 * 1024 * 1024;
const MAX_EVAL_DEPTH: usize = 10_000;

fn main() -> ExitCode {
    if let Err(err) = SimpleLogger::new()
        .with_level(LevelFilter::Warn)
        .env()
        .init()
    {
        eprintln!("Failed to initialise logging: {}", err);
    }

    let Some(path) = env::args().nth(1) else {
        eprintln!("Usage: muscheme <file.scm>");
        return ExitCode::from(2);
    };

    // Deep non-tail recursion needs more stack than the main thread has.
    let worker = thread::Builder::new()
        .name("muscheme-eval".to_string())
        .stack_size(EVAL_STACK_SIZE)
        .spawn(move || {
            set_max_eval_depth(MAX_EVAL_DEPTH);
            run_file(&path)
        });
    match worker.map(|handle| handle.join()) {
        Ok(Ok(code)) => code,
        Ok(Err(_)) => {
            error!("Evaluator thread panicked");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!("Could not start evaluator thread: {}", err);
            ExitCode::FAILURE
        }
    }
}

fn run_file(path: &str) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            error!("Could not read '{}': {}", path, err);
            eprintln!("Could not read '{}': {}", path, err);
            return ExitCode::FAILURE;
        }
    };
    debug!("Loaded {} bytes from {}", source.len(), path);

    let expressions = match parse_program(&source) {
        Ok(expressions) => expressions,
        Err(err) => {
            err.pretty_print(path, &source);
            return ExitCode::FAILURE;
        }
    };

    let global_env = Environment::new_global_populated();
    for expr in &expressions {
        match evaluate(expr, &global_env) {
            Ok(result) => {
                if !matches!(result.kind, Sexpr::Void) {
                    println!("{}", result);
                }
            }
            Err(err) => {
                err.pretty_print(path, &source);
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}
