use crate::environment::{Env, Environment};
use crate::evaluator::{EvalError, EvalResult, complete_apply, evaluate};
use crate::source::Span;
use crate::types::{Arity, Node, Primitive, PrimitiveFunc, Sexpr};

/// Binds every primitive into `env`.
pub fn register(env: &mut Environment) {
    use PrimitiveFunc::{Pure, WithEnv};

    let table: &[(&'static str, PrimitiveFunc, Arity)] = &[
        // Arithmetic
        ("+", Pure(prim_add), Arity::at_least(0)),
        ("-", Pure(prim_sub), Arity::at_least(1)),
        ("*", Pure(prim_mul), Arity::at_least(0)),
        ("/", Pure(prim_div), Arity::at_least(1)),
        ("abs", Pure(prim_abs), Arity::exactly(1)),
        ("remainder", Pure(prim_remainder), Arity::exactly(2)),
        // Comparison
        ("=", Pure(prim_equals), Arity::at_least(1)),
        ("<", Pure(prim_less_than), Arity::at_least(1)),
        ("<=", Pure(prim_less_than_or_equals), Arity::at_least(1)),
        (">", Pure(prim_greater_than), Arity::at_least(1)),
        (">=", Pure(prim_greater_than_or_equals), Arity::at_least(1)),
        ("not", Pure(prim_not), Arity::exactly(1)),
        ("eq?", Pure(prim_is_eq), Arity::exactly(2)),
        ("equal?", Pure(prim_is_equal), Arity::exactly(2)),
        // Lists
        ("cons", Pure(prim_cons), Arity::exactly(2)),
        ("car", Pure(prim_car), Arity::exactly(1)),
        ("cdr", Pure(prim_cdr), Arity::exactly(1)),
        ("list", Pure(prim_list), Arity::at_least(0)),
        ("length", Pure(prim_length), Arity::exactly(1)),
        // Type predicates
        ("null?", Pure(prim_is_null), Arity::exactly(1)),
        ("pair?", Pure(prim_is_pair), Arity::exactly(1)),
        ("list?", Pure(prim_is_list), Arity::exactly(1)),
        ("number?", Pure(prim_is_number), Arity::exactly(1)),
        ("boolean?", Pure(prim_is_boolean), Arity::exactly(1)),
        ("symbol?", Pure(prim_is_symbol), Arity::exactly(1)),
        ("string?", Pure(prim_is_string), Arity::exactly(1)),
        ("procedure?", Pure(prim_is_procedure), Arity::exactly(1)),
        // Output and errors
        ("display", Pure(prim_display), Arity::exactly(1)),
        ("newline", Pure(prim_newline), Arity::exactly(0)),
        ("error", Pure(prim_error), Arity::at_least(0)),
        // Need the calling environment
        ("eval", WithEnv(prim_eval), Arity::exactly(1)),
        ("apply", WithEnv(prim_apply), Arity::exactly(2)),
    ];

    for &(name, func, arity) in table {
        env.add_primitive(Primitive::new(name, func, arity));
    }
}

// Extracts a number from a Node or returns a TypeMismatch error
fn expect_number(node: &Node) -> EvalResult<f64> {
    match node.kind {
        Sexpr::Number(n) => Ok(n),
        _ => Err(EvalError::TypeMismatch {
            expected: "number".to_string(),
            found: node.kind.clone(),
            span: node.span,
        }),
    }
}

fn expect_list(node: &Node) -> EvalResult<Vec<Node>> {
    node.list_elements().ok_or_else(|| EvalError::TypeMismatch {
        expected: "list".to_string(),
        found: node.kind.clone(),
        span: node.span,
    })
}

fn number(n: f64, span: Span) -> EvalResult {
    Ok(Node::new_number(n, span))
}

fn boolean(b: bool, span: Span) -> EvalResult {
    Ok(Node::new_bool(b, span))
}

fn fold_numbers<F: Fn(f64, f64) -> f64>(
    args: &[Node],
    span: Span,
    start: f64,
    func: F,
) -> EvalResult {
    let mut acc = start;
    for node in args {
        acc = func(acc, expect_number(node)?);
    }
    number(acc, span)
}

pub fn prim_add(args: Vec<Node>, span: Span) -> EvalResult {
    // (+) -> 0
    // (+ 1 2 3) -> 6
    fold_numbers(&args, span, 0.0, |acc, val| acc + val)
}

pub fn prim_sub(args: Vec<Node>, span: Span) -> EvalResult {
    // (- x) -> -x
    // (- x y z) -> x - y - z
    let first = expect_number(&args[0])?;
    if args.len() == 1 {
        return number(-first, span);
    }
    fold_numbers(&args[1..], span, first, |acc, val| acc - val)
}

pub fn prim_mul(args: Vec<Node>, span: Span) -> EvalResult {
    fold_numbers(&args, span, 1.0, |acc, val| acc * val)
}

pub fn prim_div(args: Vec<Node>, span: Span) -> EvalResult {
    // (/ x) -> 1/x
    // (/ x y z) -> x / y / z
    let (mut result, divisors) = if args.len() == 1 {
        (1.0, &args[..])
    } else {
        (expect_number(&args[0])?, &args[1..])
    };
    for node in divisors {
        let divisor = expect_number(node)?;
        if divisor == 0.0 {
            return Err(EvalError::InvalidArguments(
                "Division by zero".to_string(),
                node.span,
            ));
        }
        result /= divisor;
    }
    number(result, span)
}

pub fn prim_abs(args: Vec<Node>, span: Span) -> EvalResult {
    number(expect_number(&args[0])?.abs(), span)
}

pub fn prim_remainder(args: Vec<Node>, span: Span) -> EvalResult {
    let dividend = expect_number(&args[0])?;
    let divisor = expect_number(&args[1])?;
    if divisor == 0.0 {
        return Err(EvalError::InvalidArguments(
            "Division by zero".to_string(),
            args[1].span,
        ));
    }
    number(dividend % divisor, span)
}

fn compare_numbers<F: Fn(f64, f64) -> bool>(args: &[Node], span: Span, compare: F) -> EvalResult {
    // Every argument is type checked, even after the chain has failed
    let numbers = args.iter().map(expect_number).collect::<EvalResult<Vec<f64>>>()?;
    boolean(numbers.windows(2).all(|pair| compare(pair[0], pair[1])), span)
}

pub fn prim_equals(args: Vec<Node>, span: Span) -> EvalResult {
    compare_numbers(&args, span, |left, right| left == right)
}

pub fn prim_less_than(args: Vec<Node>, span: Span) -> EvalResult {
    compare_numbers(&args, span, |left, right| left < right)
}

pub fn prim_less_than_or_equals(args: Vec<Node>, span: Span) -> EvalResult {
    compare_numbers(&args, span, |left, right| left <= right)
}

pub fn prim_greater_than(args: Vec<Node>, span: Span) -> EvalResult {
    compare_numbers(&args, span, |left, right| left > right)
}

pub fn prim_greater_than_or_equals(args: Vec<Node>, span: Span) -> EvalResult {
    compare_numbers(&args, span, |left, right| left >= right)
}

pub fn prim_not(args: Vec<Node>, span: Span) -> EvalResult {
    boolean(!args[0].is_truthy(), span)
}

pub fn prim_is_eq(args: Vec<Node>, span: Span) -> EvalResult {
    boolean(args[0].kind.eqv(&args[1].kind), span)
}

pub fn prim_is_equal(args: Vec<Node>, span: Span) -> EvalResult {
    boolean(args[0].kind.equal(&args[1].kind), span)
}

// --- List Primitives ---

pub fn prim_cons(args: Vec<Node>, span: Span) -> EvalResult {
    // (cons a b) => (a . b)
    Ok(Node::new_pair(args[0].clone(), args[1].clone(), span))
}

fn expect_pair(node: &Node, operator: &str) -> EvalResult<(Node, Node)> {
    match &node.kind {
        Sexpr::Pair(car, cdr) => Ok(((**car).clone(), (**cdr).clone())),
        other => Err(EvalError::TypeMismatch {
            expected: format!("pair for {}", operator),
            found: other.clone(),
            span: node.span,
        }),
    }
}

pub fn prim_car(args: Vec<Node>, _span: Span) -> EvalResult {
    expect_pair(&args[0], "car").map(|(car, _)| car)
}

pub fn prim_cdr(args: Vec<Node>, _span: Span) -> EvalResult {
    expect_pair(&args[0], "cdr").map(|(_, cdr)| cdr)
}

pub fn prim_list(args: Vec<Node>, span: Span) -> EvalResult {
    // (list item1 item2 ...) -> new list containing items
    Ok(Node::new_list(args, span))
}

pub fn prim_length(args: Vec<Node>, span: Span) -> EvalResult {
    number(expect_list(&args[0])?.len() as f64, span)
}

// --- Type Predicates ---

macro_rules! is_type {
    ($args:expr, $type:pat, $span:expr) => {
        boolean(matches!($args[0].kind, $type), $span)
    };
}

pub fn prim_is_null(args: Vec<Node>, span: Span) -> EvalResult {
    is_type!(args, Sexpr::Nil, span)
}

pub fn prim_is_pair(args: Vec<Node>, span: Span) -> EvalResult {
    is_type!(args, Sexpr::Pair(_, _), span)
}

pub fn prim_is_list(args: Vec<Node>, span: Span) -> EvalResult {
    boolean(args[0].is_list(), span)
}

pub fn prim_is_number(args: Vec<Node>, span: Span) -> EvalResult {
    is_type!(args, Sexpr::Number(_), span)
}

pub fn prim_is_boolean(args: Vec<Node>, span: Span) -> EvalResult {
    is_type!(args, Sexpr::Boolean(_), span)
}

pub fn prim_is_symbol(args: Vec<Node>, span: Span) -> EvalResult {
    is_type!(args, Sexpr::Symbol(_), span)
}

pub fn prim_is_string(args: Vec<Node>, span: Span) -> EvalResult {
    is_type!(args, Sexpr::String(_), span)
}

pub fn prim_is_procedure(args: Vec<Node>, span: Span) -> EvalResult {
    is_type!(args, Sexpr::Procedure(_), span)
}

// --- Output ---

/// Text written by `display`: strings without quotes, everything else as printed.
pub fn display_text(node: &Node) -> String {
    match &node.kind {
        Sexpr::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn prim_display(args: Vec<Node>, span: Span) -> EvalResult {
    print!("{}", display_text(&args[0]));
    Ok(Node::new_void(span))
}

pub fn prim_newline(_args: Vec<Node>, span: Span) -> EvalResult {
    println!();
    Ok(Node::new_void(span))
}

pub fn prim_error(args: Vec<Node>, span: Span) -> EvalResult {
    let message = args.iter().map(display_text).collect::<Vec<_>>().join(" ");
    Err(EvalError::UserError(message, span))
}

// --- Environment-aware ---

pub fn prim_eval(args: Vec<Node>, env: &Env, _span: Span) -> EvalResult {
    // (eval expr) -> evaluates a quoted expression in the caller's environment
    evaluate(&args[0], env)
}

pub fn prim_apply(args: Vec<Node>, env: &Env, span: Span) -> EvalResult {
    // (apply procedure list)
    let arguments = expect_list(&args[1])?;
    complete_apply(&args[0], arguments, env, span)
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::evaluate_all;
    use crate::parser::parse_program;

    // Helper to evaluate input string and check result kind (ignores span)
    fn assert_eval_kind(input: &str, expected_kind: Sexpr) {
        let env = Environment::new_global_populated();
        let nodes = parse_program(input).expect("parse failed");
        match evaluate_all(&nodes, &env) {
            Ok(result) => assert_eq!(result.kind, expected_kind, "Input: '{}'", input),
            Err(e) => panic!("Evaluation failed for input '{}': {}", input, e),
        }
    }

    // Compares only the error variant
    fn assert_eval_error(input: &str, expected_error_variant: &EvalError) {
        let env = Environment::new_global_populated();
        let nodes = parse_program(input).expect("parse failed");
        match evaluate_all(&nodes, &env) {
            Ok(result) => panic!(
                "Expected evaluation to fail for input '{}', but got: {:?}",
                input, result
            ),
            Err(e) => assert_eq!(
                std::mem::discriminant(&e),
                std::mem::discriminant(expected_error_variant),
                "Input: '{}', got: {:?}",
                input,
                e
            ),
        }
    }

    fn type_error() -> EvalError {
        EvalError::TypeMismatch {
            expected: String::new(),
            found: Sexpr::Nil,
            span: Span::default(),
        }
    }

    fn arity_error() -> EvalError {
        EvalError::ArityMismatch(String::new(), Span::default())
    }

    #[test]
    fn test_arithmetic() {
        assert_eval_kind("(+ 1 2)", Sexpr::Number(3.0));
        assert_eval_kind("(+ 10 20 30 40)", Sexpr::Number(100.0));
        assert_eval_kind("(+)", Sexpr::Number(0.0)); // Add identity
        assert_eval_kind("(- 10 3)", Sexpr::Number(7.0));
        assert_eval_kind("(- 5)", Sexpr::Number(-5.0));
        assert_eval_kind("(- 10 3 2)", Sexpr::Number(5.0));
        assert_eval_kind("(* 2 3 4)", Sexpr::Number(24.0));
        assert_eval_kind("(*)", Sexpr::Number(1.0)); // Multiply identity
        assert_eval_kind("(/ 10 4)", Sexpr::Number(2.5));
        assert_eval_kind("(/ 20 2 5)", Sexpr::Number(2.0));
        assert_eval_kind("(/ 5)", Sexpr::Number(0.2)); // 1/5
        assert_eval_kind("(abs -3)", Sexpr::Number(3.0));
        assert_eval_kind("(remainder 7 3)", Sexpr::Number(1.0));
    }

    #[test]
    fn test_arithmetic_errors() {
        let invalid = EvalError::InvalidArguments(String::new(), Span::default());
        assert_eval_error("(/ 1 0)", &invalid);
        assert_eval_error("(/ 0)", &invalid);
        assert_eval_error("(remainder 1 0)", &invalid);
        assert_eval_error("(/)", &arity_error());
        assert_eval_error("(-)", &arity_error());
        assert_eval_error("(+ 1 #t)", &type_error());
        assert_eval_error("(/ 1 \"hello\")", &type_error());
    }

    #[test]
    fn test_comparison() {
        assert_eval_kind("(= 5 5 5 5)", Sexpr::Boolean(true));
        assert_eval_kind("(= 5 5 6)", Sexpr::Boolean(false));
        assert_eval_kind("(< 4 5 6)", Sexpr::Boolean(true));
        assert_eval_kind("(< 5 5 6)", Sexpr::Boolean(false));
        assert_eval_kind("(<= 5 5 6)", Sexpr::Boolean(true));
        assert_eval_kind("(>= 5 5 4 4 4 3)", Sexpr::Boolean(true));
        assert_eval_kind("(> 6 5 5)", Sexpr::Boolean(false));
        assert_eval_kind("(= 1)", Sexpr::Boolean(true));
        assert_eval_error("(=)", &arity_error());
        assert_eval_error("(= 1 #f)", &type_error());
        assert_eval_error("(< 2 1 'x)", &type_error());
    }

    #[test]
    fn test_equality() {
        assert_eval_kind("(eq? 'a 'a)", Sexpr::Boolean(true));
        assert_eval_kind("(eq? '(1) '(1))", Sexpr::Boolean(false));
        assert_eval_kind("(define l '(1)) (eq? l l)", Sexpr::Boolean(true));
        assert_eval_kind("(equal? '(1 (2)) (list 1 (list 2)))", Sexpr::Boolean(true));
        assert_eval_kind("(eq? car car)", Sexpr::Boolean(true));
        assert_eval_kind("(not #f)", Sexpr::Boolean(true));
        assert_eval_kind("(not 0)", Sexpr::Boolean(false));
    }

    #[test]
    fn test_list_operations() {
        assert_eval_kind("(car '(1 2))", Sexpr::Number(1.0));
        assert_eval_kind("(car (cdr '(1 2)))", Sexpr::Number(2.0));
        assert_eval_kind("(cdr '(1))", Sexpr::Nil);
        assert_eval_kind("(length '(1 2 3))", Sexpr::Number(3.0));
        assert_eval_kind("(length '())", Sexpr::Number(0.0));
        assert_eval_kind("(list)", Sexpr::Nil);
        assert_eval_error("(car '())", &type_error());
        assert_eval_error("(cdr 5)", &type_error());
        assert_eval_error("(length '(1 . 2))", &type_error());
    }

    #[test]
    fn test_cons_display() {
        let env = Environment::new_global_populated();
        let nodes = parse_program("(cons 1 (cons 2 '())) (cons 1 2)").unwrap();
        assert_eq!(evaluate(&nodes[0], &env).unwrap().to_string(), "(1 2)");
        assert_eq!(evaluate(&nodes[1], &env).unwrap().to_string(), "(1 . 2)");
    }

    #[test]
    fn test_type_predicates() {
        assert_eval_kind("(null? '())", Sexpr::Boolean(true));
        assert_eval_kind("(null? '(1))", Sexpr::Boolean(false));
        assert_eval_kind("(pair? '(1))", Sexpr::Boolean(true));
        assert_eval_kind("(list? '(1 . 2))", Sexpr::Boolean(false));
        assert_eval_kind("(list? '())", Sexpr::Boolean(true));
        assert_eval_kind("(number? 1)", Sexpr::Boolean(true));
        assert_eval_kind("(boolean? #f)", Sexpr::Boolean(true));
        assert_eval_kind("(symbol? 'a)", Sexpr::Boolean(true));
        assert_eval_kind("(string? \"a\")", Sexpr::Boolean(true));
        assert_eval_kind("(procedure? car)", Sexpr::Boolean(true));
        assert_eval_kind("(procedure? (lambda () 1))", Sexpr::Boolean(true));
        assert_eval_kind("(procedure? 'car)", Sexpr::Boolean(false));
    }

    #[test]
    fn test_eval_uses_calling_environment() {
        assert_eval_kind("(eval '(+ 1 2))", Sexpr::Number(3.0));
        assert_eval_kind("((lambda (x) (eval 'x)) 9)", Sexpr::Number(9.0));
    }

    #[test]
    fn test_apply() {
        assert_eval_kind("(apply + '(1 2 3))", Sexpr::Number(6.0));
        assert_eval_kind(
            "(define (loop n) (if (= n 0) 'ok (loop (- n 1)))) (apply loop '(100000))",
            Sexpr::Symbol("ok".to_string()),
        );
        assert_eval_error("(apply + 1)", &type_error());
        assert_eval_error(
            "(apply 1 '())",
            &EvalError::NotApplicable(Sexpr::Nil, Span::default()),
        );
    }

    #[test]
    fn test_error_primitive() {
        assert_eval_error(
            "(error \"bad thing:\" 42)",
            &EvalError::UserError(String::new(), Span::default()),
        );
        let env = Environment::new_global_populated();
        let nodes = parse_program("(error \"bad thing:\" 42)").unwrap();
        let err = evaluate(&nodes[0], &env).unwrap_err();
        assert_eq!(err.to_string(), "Error: bad thing: 42");
    }

    #[test]
    fn test_display_returns_void() {
        assert_eval_kind("(display \"hi\")", Sexpr::Void);
        assert_eval_kind("(newline)", Sexpr::Void);
        assert_eq!(
            display_text(&Node::new_string("a\"b", Span::default())),
            "a\"b"
        );
    }
}
