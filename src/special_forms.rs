use crate::environment::{Env, Environment};
use crate::evaluator::{EvalError, EvalResult, Outcome, eval_sequence, evaluate, evaluate_tail};
use crate::source::Span;
use crate::types::{Formals, Lambda, Mu, Node, Procedure, Sexpr};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::LazyLock;

/// Handler for a special form: receives the operand list (everything after
/// the operator), the current environment and the span of the whole form.
/// Handlers may defer their final expression to the trampoline.
pub type SpecialForm = fn(&Node, &Env, Span) -> EvalResult<Outcome>;

static SPECIAL_FORMS: LazyLock<HashMap<&'static str, SpecialForm>> = LazyLock::new(|| {
    let mut forms: HashMap<&'static str, SpecialForm> = HashMap::new();
    forms.insert("quote", evaluate_quote);
    forms.insert("quasiquote", evaluate_quasiquote);
    forms.insert("unquote", evaluate_bare_unquote);
    forms.insert("unquote-splicing", evaluate_bare_unquote);
    forms.insert("if", evaluate_if);
    forms.insert("define", evaluate_define);
    forms.insert("set!", evaluate_set);
    forms.insert("lambda", evaluate_lambda);
    forms.insert("mu", evaluate_mu);
    forms.insert("begin", evaluate_begin);
    forms.insert("and", evaluate_and);
    forms.insert("or", evaluate_or);
    forms.insert("cond", evaluate_cond);
    forms.insert("let", evaluate_let);
    forms
});

pub fn lookup(name: &str) -> Option<SpecialForm> {
    SPECIAL_FORMS.get(name).copied()
}

/// Names of every special form, for completion.
pub fn special_form_identifiers() -> HashSet<String> {
    SPECIAL_FORMS.keys().map(|name| name.to_string()).collect()
}

fn invalid(message: &str, span: Span) -> EvalError {
    EvalError::InvalidSpecialForm(message.to_string(), span)
}

fn value(node: Node) -> EvalResult<Outcome> {
    Ok(Outcome::Value(node))
}

fn evaluate_quote(operands: &Node, _env: &Env, span: Span) -> EvalResult<Outcome> {
    match operands.iter().collect::<Vec<_>>()[..] {
        [expr] => value(expr.clone()),
        _ => Err(invalid("quote expects exactly one argument", span)),
    }
}

fn evaluate_if(operands: &Node, env: &Env, span: Span) -> EvalResult<Outcome> {
    match operands.iter().collect::<Vec<_>>()[..] {
        [condition, consequent, ref maybe_alternate @ ..] if maybe_alternate.len() <= 1 => {
            if evaluate(condition, env)?.is_truthy() {
                evaluate_tail(consequent, env, true)
            } else if let [alternate] = maybe_alternate {
                evaluate_tail(alternate, env, true)
            } else {
                value(Node::new_void(span))
            }
        }
        _ => Err(invalid(
            "if expects condition, consequent, and optional alternate",
            span,
        )),
    }
}

fn evaluate_define(operands: &Node, env: &Env, span: Span) -> EvalResult<Outcome> {
    let Sexpr::Pair(target, rest) = &operands.kind else {
        return Err(invalid("define expects a name and a value", span));
    };
    match &target.kind {
        // (define name value)
        Sexpr::Symbol(name) => match rest.iter().collect::<Vec<_>>()[..] {
            [value_expr] => {
                let value_node = evaluate(value_expr, env)?;
                debug!("define {}", name);
                env.borrow_mut().define(name.clone(), value_node);
                value(Node::new_symbol(name.clone(), target.span))
            }
            _ => Err(invalid("define expects exactly one value expression", span)),
        },
        // (define (name . formals) body...)
        Sexpr::Pair(name_node, formals) => {
            let Some(name) = name_node.as_symbol() else {
                return Err(EvalError::TypeMismatch {
                    expected: "symbol".to_string(),
                    found: name_node.kind.clone(),
                    span: name_node.span,
                });
            };
            let lambda = make_lambda(formals, rest, env, span)?;
            debug!("define procedure {}", name);
            env.borrow_mut().define(name.to_string(), lambda);
            value(Node::new_symbol(name.to_string(), name_node.span))
        }
        _ => Err(EvalError::TypeMismatch {
            expected: "symbol or list".to_string(),
            found: target.kind.clone(),
            span: target.span,
        }),
    }
}

fn evaluate_set(operands: &Node, env: &Env, span: Span) -> EvalResult<Outcome> {
    match operands.iter().collect::<Vec<_>>()[..] {
        [target, value_expr] => {
            let Some(name) = target.as_symbol() else {
                return Err(EvalError::TypeMismatch {
                    expected: "symbol".to_string(),
                    found: target.kind.clone(),
                    span: target.span,
                });
            };
            let value_node = evaluate(value_expr, env)?;
            env.borrow_mut().set(name, value_node, target.span)?;
            value(Node::new_void(span))
        }
        _ => Err(invalid("set! expects a name and a value", span)),
    }
}

fn check_body(body: &Node, form: &str, span: Span) -> EvalResult<()> {
    if matches!(body.kind, Sexpr::Nil) {
        Err(EvalError::InvalidSpecialForm(
            format!("{} expects a body", form),
            span,
        ))
    } else {
        Ok(())
    }
}

fn make_lambda(formals: &Node, body: &Node, env: &Env, span: Span) -> EvalResult {
    check_body(body, "lambda", span)?;
    let lambda = Lambda {
        formals: Formals::from_node(formals)?,
        body: body.clone(),
        env: env.clone(),
    };
    Ok(Node::new(
        Sexpr::Procedure(Procedure::Lambda(Rc::new(lambda))),
        span,
    ))
}

fn evaluate_lambda(operands: &Node, env: &Env, span: Span) -> EvalResult<Outcome> {
    let Sexpr::Pair(formals, body) = &operands.kind else {
        return Err(invalid("lambda expects formals and a body", span));
    };
    make_lambda(formals, body, env, span).map(Outcome::Value)
}

fn evaluate_mu(operands: &Node, _env: &Env, span: Span) -> EvalResult<Outcome> {
    let Sexpr::Pair(formals, body) = &operands.kind else {
        return Err(invalid("mu expects formals and a body", span));
    };
    check_body(body, "mu", span)?;
    let mu = Mu {
        formals: Formals::from_node(formals)?,
        body: (**body).clone(),
    };
    value(Node::new(Sexpr::Procedure(Procedure::Mu(Rc::new(mu))), span))
}

fn evaluate_begin(operands: &Node, env: &Env, span: Span) -> EvalResult<Outcome> {
    check_body(operands, "begin", span)?;
    eval_sequence(operands, env, true)
}

fn evaluate_and(operands: &Node, env: &Env, span: Span) -> EvalResult<Outcome> {
    let mut remaining = operands.iter().peekable();
    while let Some(expr) = remaining.next() {
        if remaining.peek().is_none() {
            return evaluate_tail(expr, env, true);
        }
        let result = evaluate(expr, env)?;
        if !result.is_truthy() {
            return value(result);
        }
    }
    value(Node::new_bool(true, span))
}

fn evaluate_or(operands: &Node, env: &Env, span: Span) -> EvalResult<Outcome> {
    let mut remaining = operands.iter().peekable();
    while let Some(expr) = remaining.next() {
        if remaining.peek().is_none() {
            return evaluate_tail(expr, env, true);
        }
        let result = evaluate(expr, env)?;
        if result.is_truthy() {
            return value(result);
        }
    }
    value(Node::new_bool(false, span))
}

fn evaluate_cond(operands: &Node, env: &Env, span: Span) -> EvalResult<Outcome> {
    let clauses: Vec<&Node> = operands.iter().collect();
    for (index, clause) in clauses.iter().enumerate() {
        let Sexpr::Pair(test, body) = &clause.kind else {
            return Err(invalid("cond clause must be a list", clause.span));
        };
        if !body.is_list() {
            return Err(invalid("cond clause must be a proper list", clause.span));
        }
        let test_value = if test.as_symbol() == Some("else") {
            if index + 1 != clauses.len() {
                return Err(invalid("else must be the last cond clause", clause.span));
            }
            Node::new_bool(true, test.span)
        } else {
            evaluate(test, env)?
        };
        if test_value.is_truthy() {
            if matches!(body.kind, Sexpr::Nil) {
                return value(test_value);
            }
            return eval_sequence(body, env, true);
        }
    }
    value(Node::new_void(span))
}

fn evaluate_let(operands: &Node, env: &Env, span: Span) -> EvalResult<Outcome> {
    let Sexpr::Pair(bindings, body) = &operands.kind else {
        return Err(invalid("let expects bindings and a body", span));
    };
    check_body(body, "let", span)?;
    if !bindings.is_list() {
        return Err(invalid("let bindings must be a list", bindings.span));
    }

    let mut names = Vec::new();
    let mut values = Vec::new();
    for binding in bindings.iter() {
        match binding.iter().collect::<Vec<_>>()[..] {
            [name_node, value_expr] if binding.is_list() => {
                let Some(name) = name_node.as_symbol() else {
                    return Err(EvalError::TypeMismatch {
                        expected: "symbol".to_string(),
                        found: name_node.kind.clone(),
                        span: name_node.span,
                    });
                };
                names.push(name.to_string());
                // Evaluated in the enclosing environment
                values.push(evaluate(value_expr, env)?);
            }
            _ => return Err(invalid("let binding must be (name value)", binding.span)),
        }
    }

    let frame = Environment::new_enclosed(env.clone());
    for (name, value_node) in names.into_iter().zip(values) {
        frame.borrow_mut().define(name, value_node);
    }
    eval_sequence(body, &frame, true)
}

// --- Quasiquote ---

fn evaluate_quasiquote(operands: &Node, env: &Env, span: Span) -> EvalResult<Outcome> {
    match operands.iter().collect::<Vec<_>>()[..] {
        [template] => expand_quasiquote(template, env, 1).map(Outcome::Value),
        _ => Err(invalid("quasiquote expects exactly one argument", span)),
    }
}

fn evaluate_bare_unquote(_operands: &Node, _env: &Env, span: Span) -> EvalResult<Outcome> {
    Err(invalid("unquote outside of quasiquote", span))
}

fn single_operand<'a>(operands: &'a Node, form: &str, span: Span) -> EvalResult<&'a Node> {
    match operands.iter().collect::<Vec<_>>()[..] {
        [operand] if operands.is_list() => Ok(operand),
        _ => Err(EvalError::InvalidSpecialForm(
            format!("{} expects exactly one argument", form),
            span,
        )),
    }
}

// Rebuilds `(form inner)` one quasiquote level away from evaluation.
fn rewrap(form: &Node, operands: &Node, env: &Env, depth: usize, span: Span) -> EvalResult {
    let operand = single_operand(operands, form.as_symbol().unwrap_or(""), span)?;
    let inner = expand_quasiquote(operand, env, depth)?;
    Ok(Node::new_list(vec![form.clone(), inner], span))
}

fn expand_quasiquote(template: &Node, env: &Env, depth: usize) -> EvalResult {
    let Sexpr::Pair(first, rest) = &template.kind else {
        return Ok(template.clone());
    };
    match first.as_symbol() {
        Some("unquote") if depth == 1 => {
            return evaluate(single_operand(rest, "unquote", template.span)?, env);
        }
        Some("unquote") | Some("unquote-splicing") if depth > 1 => {
            return rewrap(first, rest, env, depth - 1, template.span);
        }
        Some("unquote-splicing") => {
            return Err(invalid(
                "unquote-splicing must appear inside a list",
                template.span,
            ));
        }
        Some("quasiquote") => {
            return rewrap(first, rest, env, depth + 1, template.span);
        }
        _ => {}
    }

    if depth == 1 {
        if let Sexpr::Pair(head, head_operands) = &first.kind {
            if head.as_symbol() == Some("unquote-splicing") {
                let operand = single_operand(head_operands, "unquote-splicing", first.span)?;
                let spliced = evaluate(operand, env)?;
                let Some(items) = spliced.list_elements() else {
                    return Err(EvalError::TypeMismatch {
                        expected: "list".to_string(),
                        found: spliced.kind.clone(),
                        span: first.span,
                    });
                };
                let tail = expand_quasiquote(rest, env, depth)?;
                return Ok(items.into_iter().rev().fold(tail, |acc, item| {
                    Node::new_pair(item, acc, template.span)
                }));
            }
        }
    }

    let car = expand_quasiquote(first, env, depth)?;
    let cdr = expand_quasiquote(rest, env, depth)?;
    Ok(Node::new_pair(car, cdr, template.span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::evaluate_all;
    use crate::parser::parse_program;

    fn eval_str(input: &str) -> EvalResult {
        let env = Environment::new_global_populated();
        let nodes = parse_program(input).expect("parse failed");
        evaluate_all(&nodes, &env)
    }

    fn assert_eval_kind(input: &str, expected_kind: Sexpr) {
        match eval_str(input) {
            Ok(result) => assert_eq!(result.kind, expected_kind, "Input: '{}'", input),
            Err(e) => panic!("Evaluation failed for input '{}': {}", input, e),
        }
    }

    fn assert_eval_display(input: &str, expected: &str) {
        match eval_str(input) {
            Ok(result) => assert_eq!(result.to_string(), expected, "Input: '{}'", input),
            Err(e) => panic!("Evaluation failed for input '{}': {}", input, e),
        }
    }

    fn assert_invalid_form(input: &str) {
        assert!(
            matches!(eval_str(input), Err(EvalError::InvalidSpecialForm(_, _))),
            "Input: '{}' should be an invalid special form",
            input
        );
    }

    #[test]
    fn test_registry_lookup() {
        assert!(lookup("if").is_some());
        assert!(lookup("mu").is_some());
        assert!(lookup("car").is_none());
        let identifiers = special_form_identifiers();
        assert!(identifiers.contains("lambda"));
        assert!(identifiers.contains("quasiquote"));
    }

    #[test]
    fn test_quote() {
        assert_eval_kind("'1", Sexpr::Number(1.0));
        assert_eval_kind("'a", Sexpr::Symbol("a".to_string()));
        assert_eval_kind("(quote ())", Sexpr::Nil);
        assert_eval_display("'(1 (2 3))", "(1 (2 3))");
        assert_invalid_form("(quote a b)");
        assert_invalid_form("(quote)");
    }

    #[test]
    fn test_if() {
        assert_eval_kind("(if #t 1 2)", Sexpr::Number(1.0));
        assert_eval_kind("(if 0 1 2)", Sexpr::Number(1.0)); // 0 is true
        assert_eval_kind("(if '() 1 2)", Sexpr::Number(1.0));
        assert_eval_kind("(if #f 1 2)", Sexpr::Number(2.0));
        assert_eval_kind("(if #f 1)", Sexpr::Void);
        assert_eval_kind("(if #t 'good unbound-variable)", Sexpr::Symbol("good".to_string()));
        assert_invalid_form("(if)");
        assert_invalid_form("(if #t)");
        assert_invalid_form("(if #t 1 2 3)");
    }

    #[test]
    fn test_define_returns_name() {
        assert_eval_kind("(define x 10)", Sexpr::Symbol("x".to_string()));
        assert_eval_kind("(define (f) 1)", Sexpr::Symbol("f".to_string()));
        assert_eval_kind("(define x 10) (define y (+ x 1)) y", Sexpr::Number(11.0));
        assert_invalid_form("(define x)");
        assert_invalid_form("(define (f))");
        assert!(matches!(
            eval_str("(define 5 1)"),
            Err(EvalError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_set() {
        assert_eval_kind("(define x 1) (set! x 2) x", Sexpr::Number(2.0));
        assert_eval_kind(
            "(define x 1) (define (bump) (set! x (+ x 1))) (bump) (bump) x",
            Sexpr::Number(3.0),
        );
        assert_eval_kind("(define x 1) (set! x 2)", Sexpr::Void);
        assert!(matches!(
            eval_str("(set! nowhere 1)"),
            Err(EvalError::EnvError(_))
        ));
    }

    #[test]
    fn test_lambda_and_mu_display() {
        assert_eval_display("(lambda (x y) (+ x y))", "(lambda (x y) (+ x y))");
        assert_eval_display("(mu (x . ys) x ys)", "(mu (x . ys) x ys)");
        assert_invalid_form("(lambda (x))");
        assert_invalid_form("(lambda)");
        assert_invalid_form("(mu (1) 1)");
    }

    #[test]
    fn test_begin() {
        assert_eval_kind("(begin 1 2 3)", Sexpr::Number(3.0));
        assert_eval_kind("(begin (define z 4) (* z z))", Sexpr::Number(16.0));
        assert_invalid_form("(begin)");
    }

    #[test]
    fn test_and_or() {
        assert_eval_kind("(and)", Sexpr::Boolean(true));
        assert_eval_kind("(and 1 2 3)", Sexpr::Number(3.0));
        assert_eval_kind("(and 1 #f unbound)", Sexpr::Boolean(false));
        assert_eval_kind("(or)", Sexpr::Boolean(false));
        assert_eval_kind("(or #f 2 unbound)", Sexpr::Number(2.0));
        assert_eval_kind("(or #f #f)", Sexpr::Boolean(false));
    }

    #[test]
    fn test_cond() {
        assert_eval_kind("(cond (#f 1) (#t 2) (else 3))", Sexpr::Number(2.0));
        assert_eval_kind("(cond (#f 1) (else 3))", Sexpr::Number(3.0));
        assert_eval_kind("(cond (#f 1))", Sexpr::Void);
        assert_eval_kind("(cond ((+ 1 1)))", Sexpr::Number(2.0));
        assert_invalid_form("(cond (else 1) (#t 2))");
        assert_invalid_form("(cond 5)");
    }

    #[test]
    fn test_let() {
        assert_eval_kind("(let ((x 2) (y 3)) (* x y))", Sexpr::Number(6.0));
        // Bindings see the outer x, not each other
        assert_eval_kind(
            "(define x 10) (let ((x 1) (y x)) y)",
            Sexpr::Number(10.0),
        );
        assert_eval_kind("(define x 10) (let ((x 1)) x) x", Sexpr::Number(10.0));
        assert_invalid_form("(let ((x)) x)");
        assert_invalid_form("(let ((x 1)))");
    }

    #[test]
    fn test_quasiquote() {
        assert_eval_display("`(a b)", "(a b)");
        assert_eval_display("(define b 2) `(a ,b c)", "(a 2 c)");
        assert_eval_display("(define b '(1 2)) `(a ,@b c)", "(a 1 2 c)");
        assert_eval_display("`(a ,@'() c)", "(a c)");
        assert_eval_display("(define b 2) `(a . ,b)", "(a . 2)");
        assert_eval_display("(define b 2) `(a `(c ,(d ,b)))", "(a (quasiquote (c (unquote (d 2)))))");
        assert_invalid_form("`,@x");
        assert_invalid_form("(unquote x)");
        assert!(matches!(
            eval_str("`(a ,@5)"),
            Err(EvalError::TypeMismatch { .. })
        ));
    }
}
