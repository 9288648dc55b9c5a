use crate::environment::{EnvError, Env, Environment};
use crate::source::Span;
use crate::special_forms;
use crate::types::{Node, Procedure, Sexpr};
use log::trace;
use std::cell::Cell;
use std::fmt;
use thiserror::Error;

// --- Evaluation Error ---
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error(transparent)]
    EnvError(#[from] EnvError), // Errors from environment lookup
    #[error("Evaluation Error: Malformed combination: {0}")]
    MalformedCombination(Sexpr, Span), // Combination is not a proper list
    #[error("Evaluation Error: Object is not applicable: {0}")]
    NotApplicable(Sexpr, Span), // Tried to call something that isn't a procedure
    #[error("Evaluation Error: Wrong number of arguments - {0}")]
    ArityMismatch(String, Span),
    #[error("Evaluation Error: Invalid special form - {0}")]
    InvalidSpecialForm(String, Span), // Malformed special form (e.g., (if cond))
    #[error("Evaluation Error: Expected {expected}, found {}", .found.type_name())]
    TypeMismatch {
        expected: String,
        found: Sexpr,
        span: Span,
    },
    #[error("Evaluation Error: Invalid arguments - {0}")]
    InvalidArguments(String, Span), // e.g. division by zero
    #[error("Error: {0}")]
    UserError(String, Span), // Raised by the `error` primitive
    #[error("Evaluation Error: Maximum recursion depth of {0} exceeded")]
    RecursionDepthExceeded(usize, Span),
}

impl EvalError {
    pub fn span(&self) -> Span {
        match self {
            EvalError::EnvError(EnvError::UnboundName(_, span))
            | EvalError::MalformedCombination(_, span)
            | EvalError::NotApplicable(_, span)
            | EvalError::ArityMismatch(_, span)
            | EvalError::InvalidSpecialForm(_, span)
            | EvalError::TypeMismatch { span, .. }
            | EvalError::InvalidArguments(_, span)
            | EvalError::UserError(_, span)
            | EvalError::RecursionDepthExceeded(_, span) => *span,
        }
    }
}

// Result type alias for convenience
pub type EvalResult<T = Node> = Result<T, EvalError>;

// --- Trampoline ---

/// An expression and the environment it still has to be evaluated in.
/// Only ever travels between trampoline iterations.
pub struct Unevaluated {
    pub expr: Node,
    pub env: Env,
}

impl fmt::Debug for Unevaluated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unevaluated({})", self.expr)
    }
}

/// Result of a tail-aware evaluation step.
#[derive(Debug)]
pub enum Outcome {
    Value(Node),
    Deferred(Unevaluated),
}

impl Outcome {
    /// Drives a deferred outcome to a value.
    pub fn resolve(self) -> EvalResult {
        match self {
            Outcome::Value(value) => Ok(value),
            Outcome::Deferred(thunk) => evaluate(&thunk.expr, &thunk.env),
        }
    }
}

// --- Depth Guard ---

/// Nesting limit for non-tail evaluation on a thread that has not raised it.
/// Sized for the 2 MiB stack of a spawned thread in a debug build.
pub const DEFAULT_MAX_EVAL_DEPTH: usize = 250;

thread_local! {
    static EVAL_DEPTH: Cell<usize> = const { Cell::new(0) };
    static MAX_EVAL_DEPTH: Cell<usize> = const { Cell::new(DEFAULT_MAX_EVAL_DEPTH) };
}

/// Sets the nesting limit for evaluations on the current thread. Raise it
/// only on a thread whose stack was sized to match.
pub fn set_max_eval_depth(limit: usize) {
    MAX_EVAL_DEPTH.with(|max| max.set(limit));
}

/// One level of `evaluate` nesting, released on drop.
struct DepthGuard;

impl DepthGuard {
    fn enter(span: Span) -> EvalResult<DepthGuard> {
        let limit = MAX_EVAL_DEPTH.with(Cell::get);
        EVAL_DEPTH.with(|depth| {
            if depth.get() >= limit {
                return Err(EvalError::RecursionDepthExceeded(limit, span));
            }
            depth.set(depth.get() + 1);
            Ok(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        EVAL_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

// --- Evaluate Function ---

/// Evaluates a node to a value. This is the non-tail entry point: it runs the
/// trampoline until no deferred work remains, so the native stack only grows
/// with non-tail nesting.
pub fn evaluate(node: &Node, env: &Env) -> EvalResult {
    let _depth = DepthGuard::enter(node.span)?;
    let mut outcome = eval_step(node, env)?;
    loop {
        match outcome {
            Outcome::Value(value) => return Ok(value),
            Outcome::Deferred(thunk) => {
                trace!("trampoline resumes {}", thunk.expr);
                outcome = eval_step(&thunk.expr, &thunk.env)?;
            }
        }
    }
}

/// Evaluates a node that may sit in tail position. In tail position a
/// combination is not evaluated at all but handed back as a thunk.
pub fn evaluate_tail(node: &Node, env: &Env, tail: bool) -> EvalResult<Outcome> {
    if tail && matches!(node.kind, Sexpr::Pair(_, _)) {
        return Ok(Outcome::Deferred(Unevaluated {
            expr: node.clone(),
            env: env.clone(),
        }));
    }
    evaluate(node, env).map(Outcome::Value)
}

/// Evaluates each top-level node in turn, returning the last value.
pub fn evaluate_all(nodes: &[Node], env: &Env) -> EvalResult {
    let mut result = Node::new_void(Span::default());
    for node in nodes {
        result = evaluate(node, env)?;
    }
    Ok(result)
}

// One level of evaluation. Applications run in tail mode because the
// caller's loop resolves whatever they defer.
fn eval_step(node: &Node, env: &Env) -> EvalResult<Outcome> {
    match &node.kind {
        // 1. Symbols: Look up in the environment
        Sexpr::Symbol(name) => Ok(Outcome::Value(env.borrow().get(name, node.span)?)),

        // 2. Combinations: special forms or procedure calls
        Sexpr::Pair(first, rest) => {
            if !node.is_list() {
                return Err(EvalError::MalformedCombination(
                    node.kind.clone(),
                    node.span,
                ));
            }
            if let Some(handler) = first.as_symbol().and_then(special_forms::lookup) {
                return handler(rest, env, node.span);
            }

            let operator = evaluate(first, env)?;
            let args = rest
                .iter()
                .map(|operand| evaluate(operand, env))
                .collect::<EvalResult<Vec<Node>>>()?;
            apply(&operator, args, env, node.span, true)
        }

        // 3. Everything else evaluates to itself
        _ => Ok(Outcome::Value(node.clone())),
    }
}

// --- Apply ---

/// Applies `procedure` to already evaluated `args`. `env` is the calling
/// environment: a `mu` body runs under it and `WithEnv` primitives receive it.
/// When `tail` is set the last body expression may come back deferred.
pub fn apply(
    procedure: &Node,
    args: Vec<Node>,
    env: &Env,
    span: Span,
    tail: bool,
) -> EvalResult<Outcome> {
    let Sexpr::Procedure(procedure) = &procedure.kind else {
        return Err(EvalError::NotApplicable(procedure.kind.clone(), span));
    };
    trace!("apply {} to {} arguments", procedure, args.len());

    match procedure {
        Procedure::Primitive(primitive) => primitive.call(args, env, span).map(Outcome::Value),
        Procedure::Lambda(lambda) => {
            let frame = Environment::make_child_frame(&lambda.env, &lambda.formals, args, span)?;
            eval_sequence(&lambda.body, &frame, tail)
        }
        Procedure::Mu(mu) => {
            let frame = Environment::make_child_frame(env, &mu.formals, args, span)?;
            eval_sequence(&mu.body, &frame, tail)
        }
    }
}

/// Applies and guarantees a resolved value.
pub fn complete_apply(procedure: &Node, args: Vec<Node>, env: &Env, span: Span) -> EvalResult {
    apply(procedure, args, env, span, true)?.resolve()
}

// --- Sequencing ---

/// Evaluates `expressions` (a proper list) in order and returns the last
/// result, which stays deferred if `tail` is set. An empty sequence has no value.
pub fn eval_sequence(expressions: &Node, env: &Env, tail: bool) -> EvalResult<Outcome> {
    if !expressions.is_list() {
        return Err(EvalError::MalformedCombination(
            expressions.kind.clone(),
            expressions.span,
        ));
    }
    let mut remaining = expressions.iter().peekable();
    while let Some(expr) = remaining.next() {
        if remaining.peek().is_none() {
            return evaluate_tail(expr, env, tail);
        }
        evaluate(expr, env)?;
    }
    Ok(Outcome::Value(Node::new_void(expressions.span)))
}
