use crate::environment::Env;
use crate::evaluator::{EvalError, EvalResult};
use crate::source::Span;
use std::fmt;
use std::mem;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: Sexpr, // The actual S-expression data
    pub span: Span,  // The source span it covers
}

impl Node {
    pub fn new(kind: Sexpr, span: Span) -> Self {
        Node { kind, span }
    }

    pub fn new_number(n: f64, span: Span) -> Self {
        Node::new(Sexpr::Number(n), span)
    }

    pub fn new_bool(b: bool, span: Span) -> Self {
        Node::new(Sexpr::Boolean(b), span)
    }

    pub fn new_string(s: &str, span: Span) -> Self {
        Node::new(Sexpr::String(s.to_string()), span)
    }

    pub fn new_symbol(s: String, span: Span) -> Self {
        Node::new(Sexpr::Symbol(s), span)
    }

    pub fn new_nil(span: Span) -> Self {
        Node::new(Sexpr::Nil, span)
    }

    pub fn new_void(span: Span) -> Self {
        Node::new(Sexpr::Void, span)
    }

    pub fn new_pair(car: Node, cdr: Node, span: Span) -> Self {
        Node::new(Sexpr::Pair(Rc::new(car), Rc::new(cdr)), span)
    }

    /// Builds a proper list from `items`, every pair carrying `span`.
    pub fn new_list(items: Vec<Node>, span: Span) -> Self {
        items
            .into_iter()
            .rev()
            .fold(Node::new_nil(span), |tail, item| {
                Node::new_pair(item, tail, span)
            })
    }

    /// `(quote expr)`, the expansion of the `'expr` reader shorthand.
    pub fn new_quote(expr: Node, quote_span: Span) -> Self {
        Node::new_quoted_expr(expr, "quote", quote_span)
    }

    pub fn new_quoted_expr(expr: Node, quote_symbol: &str, quote_span: Span) -> Self {
        let span = quote_span.merge(&expr.span);
        let tail = Node::new_pair(expr, Node::new_nil(span), span);
        Node::new_pair(
            Node::new_symbol(quote_symbol.to_string(), quote_span),
            tail,
            span,
        )
    }

    pub fn new_primitive(primitive: Primitive, span: Span) -> Self {
        Node::new(Sexpr::Procedure(Procedure::Primitive(primitive)), span)
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match &self.kind {
            Sexpr::Symbol(name) => Some(name),
            _ => None,
        }
    }

    /// Only `#f` is false.
    pub fn is_truthy(&self) -> bool {
        !matches!(self.kind, Sexpr::Boolean(false))
    }

    /// True for `()` and for pair chains that end in `()`.
    pub fn is_list(&self) -> bool {
        let mut iter = self.iter();
        for _ in iter.by_ref() {}
        matches!(iter.tail().kind, Sexpr::Nil)
    }

    /// Iterates over the cars of a pair chain. Stops at the first non-pair.
    pub fn iter(&self) -> ListIter<'_> {
        ListIter { current: self }
    }

    /// Elements of a proper list, or `None` if the chain is improper.
    pub fn list_elements(&self) -> Option<Vec<Node>> {
        if self.is_list() {
            Some(self.iter().cloned().collect())
        } else {
            None
        }
    }
}

// Frees the cdr spine in a loop. Dropping a long list field by field would
// take one native frame per element.
impl Drop for Node {
    fn drop(&mut self) {
        let mut next = match mem::replace(&mut self.kind, Sexpr::Nil) {
            Sexpr::Pair(_, cdr) => cdr,
            _ => return,
        };
        while let Ok(mut node) = Rc::try_unwrap(next) {
            match mem::replace(&mut node.kind, Sexpr::Nil) {
                Sexpr::Pair(_, cdr) => next = cdr,
                _ => break,
            }
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

pub struct ListIter<'a> {
    current: &'a Node,
}

impl<'a> ListIter<'a> {
    /// Whatever terminates the chain once iteration is exhausted.
    pub fn tail(&self) -> &'a Node {
        self.current
    }
}

impl<'a> Iterator for ListIter<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<&'a Node> {
        match &self.current.kind {
            Sexpr::Pair(car, cdr) => {
                self.current = &**cdr;
                Some(&**car)
            }
            _ => None,
        }
    }
}

/// A Scheme S-expression. Serves as both program text and runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Sexpr {
    Symbol(String),            // e.g., +, variable-name, quote
    Number(f64),               // All numbers are f64
    Boolean(bool),             // #t or #f
    String(String),            // For string literals "hello\n"
    Pair(Rc<Node>, Rc<Node>),  // car and cdr; lists end in Nil
    Nil,                       // The empty list '()
    Procedure(Procedure),
    Void,                      // "No value": result of define, display, empty bodies
}

impl Sexpr {
    pub fn type_name(&self) -> &'static str {
        match self {
            Sexpr::Number(_) => "number",
            Sexpr::Symbol(_) => "symbol",
            Sexpr::Boolean(_) => "boolean",
            Sexpr::String(_) => "string",
            Sexpr::Pair(_, _) => "pair",
            Sexpr::Nil => "nil",
            Sexpr::Procedure(_) => "procedure",
            Sexpr::Void => "void",
        }
    }

    /// Structural equality that ignores source spans (`equal?`).
    /// Walks the cdr spine in a loop; only nested cars recurse.
    pub fn equal(&self, other: &Sexpr) -> bool {
        let (mut left, mut right) = (self, other);
        loop {
            match (left, right) {
                (Sexpr::Pair(car1, cdr1), Sexpr::Pair(car2, cdr2)) => {
                    if !car1.kind.equal(&car2.kind) {
                        return false;
                    }
                    left = &cdr1.kind;
                    right = &cdr2.kind;
                }
                _ => return left.eqv(right),
            }
        }
    }

    /// Identity for pairs and closures, value equality for atoms (`eq?`).
    pub fn eqv(&self, other: &Sexpr) -> bool {
        match (self, other) {
            (Sexpr::Pair(car1, cdr1), Sexpr::Pair(car2, cdr2)) => {
                Rc::ptr_eq(car1, car2) && Rc::ptr_eq(cdr1, cdr2)
            }
            _ => self == other,
        }
    }
}

impl fmt::Display for Sexpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sexpr::Symbol(s) => write!(f, "{}", s),
            Sexpr::Number(n) => write!(f, "{}", n),
            Sexpr::Boolean(b) => write!(f, "{}", if *b { "#t" } else { "#f" }),
            Sexpr::Pair(car, cdr) => {
                write!(f, "({}", car)?;
                let mut rest: &Node = cdr;
                loop {
                    match &rest.kind {
                        Sexpr::Pair(car, cdr) => {
                            write!(f, " {}", car)?;
                            rest = &**cdr;
                        }
                        Sexpr::Nil => break,
                        other => {
                            write!(f, " . {}", other)?;
                            break;
                        }
                    }
                }
                write!(f, ")")
            }
            Sexpr::Nil => write!(f, "()"),
            Sexpr::String(str) => {
                write!(
                    f,
                    "\"{}\"",
                    str.chars().fold(String::new(), |mut acc, char| {
                        match char {
                            '"' => acc.push_str("\\\""),
                            '\\' => acc.push_str("\\\\"),
                            '\n' => acc.push_str("\\n"),
                            '\r' => acc.push_str("\\r"),
                            '\t' => acc.push_str("\\t"),
                            c => acc.push(c),
                        }
                        acc
                    })
                )
            }
            Sexpr::Procedure(procedure) => write!(f, "{}", procedure),
            Sexpr::Void => Ok(()),
        }
    }
}

// --- Procedures ---

/// How many arguments a procedure accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: Option<usize>, // None means variadic
}

impl Arity {
    pub fn exactly(n: usize) -> Self {
        Arity {
            min: n,
            max: Some(n),
        }
    }

    pub fn at_least(n: usize) -> Self {
        Arity { min: n, max: None }
    }

    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min && self.max.is_none_or(|max| count <= max)
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) if max == self.min => write!(f, "exactly {}", max),
            Some(max) => write!(f, "between {} and {}", self.min, max),
            None => write!(f, "at least {}", self.min),
        }
    }
}

/// Host function behind a primitive. `WithEnv` functions are handed the
/// calling environment after their positional arguments.
#[derive(Clone, Copy)]
pub enum PrimitiveFunc {
    Pure(fn(Vec<Node>, Span) -> EvalResult),
    WithEnv(fn(Vec<Node>, &Env, Span) -> EvalResult),
}

impl PrimitiveFunc {
    pub fn needs_env(&self) -> bool {
        matches!(self, PrimitiveFunc::WithEnv(_))
    }
}

#[derive(Clone)]
pub struct Primitive {
    pub name: &'static str,
    pub func: PrimitiveFunc,
    pub arity: Arity,
}

impl Primitive {
    pub fn new(name: &'static str, func: PrimitiveFunc, arity: Arity) -> Self {
        Primitive { name, func, arity }
    }

    /// Calls the host function. The argument count is checked here so that
    /// host functions can index their arguments freely.
    pub fn call(&self, args: Vec<Node>, env: &Env, span: Span) -> EvalResult {
        if !self.arity.accepts(args.len()) {
            return Err(EvalError::ArityMismatch(
                format!(
                    "'{}' expects {} arguments, got {}",
                    self.name,
                    self.arity,
                    args.len()
                ),
                span,
            ));
        }
        match self.func {
            PrimitiveFunc::Pure(func) => func(args, span),
            PrimitiveFunc::WithEnv(func) => func(args, env, span),
        }
    }
}

/// Parameter list of a closure: `(a b)`, `(a . rest)` or a bare `args`.
#[derive(Debug, Clone, PartialEq)]
pub struct Formals {
    pub required: Vec<String>,
    pub rest: Option<String>,
}

impl Formals {
    pub fn from_node(node: &Node) -> EvalResult<Formals> {
        let mut required = Vec::new();
        let mut iter = node.iter();
        for param in iter.by_ref() {
            required.push(Formals::param_name(param)?);
        }
        let rest = match &iter.tail().kind {
            Sexpr::Nil => None,
            _ => Some(Formals::param_name(iter.tail())?),
        };

        let mut seen: Vec<&String> = Vec::new();
        for name in required.iter().chain(rest.iter()) {
            if seen.contains(&name) {
                return Err(EvalError::InvalidSpecialForm(
                    format!("duplicate parameter '{}'", name),
                    node.span,
                ));
            }
            seen.push(name);
        }
        Ok(Formals { required, rest })
    }

    fn param_name(node: &Node) -> EvalResult<String> {
        node.as_symbol().map(str::to_string).ok_or_else(|| {
            EvalError::InvalidSpecialForm(
                format!("parameter must be a symbol, got {}", node.kind.type_name()),
                node.span,
            )
        })
    }

    pub fn arity(&self) -> Arity {
        match self.rest {
            Some(_) => Arity::at_least(self.required.len()),
            None => Arity::exactly(self.required.len()),
        }
    }
}

impl fmt::Display for Formals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.rest, self.required.is_empty()) {
            (Some(rest), true) => write!(f, "{}", rest),
            (Some(rest), false) => write!(f, "({} . {})", self.required.join(" "), rest),
            (None, _) => write!(f, "({})", self.required.join(" ")),
        }
    }
}

/// A lexically scoped closure.
pub struct Lambda {
    pub formals: Formals,
    pub body: Node, // Proper list of expressions
    pub env: Env,   // Defining environment
}

/// A dynamically scoped closure: free names resolve in the caller's frame.
///
/// Each call's frame extends the caller's frame, and a tail call keeps that
/// frame alive as the next caller. A mu that tail-calls itself `n` times
/// therefore builds a chain of `n` frames, and a lookup of a name bound near
/// the top walks the whole chain: O(n) per lookup and O(n²) for the loop.
/// The trampoline keeps the native stack flat, so only time grows.
pub struct Mu {
    pub formals: Formals,
    pub body: Node,
}

#[derive(Clone)]
pub enum Procedure {
    Primitive(Primitive),
    Lambda(Rc<Lambda>),
    /// Frame chains grow with each tail call; see [`Mu`] for the cost.
    Mu(Rc<Mu>),
}

fn write_body(f: &mut fmt::Formatter<'_>, body: &Node) -> fmt::Result {
    for expr in body.iter() {
        write!(f, " {}", expr)?;
    }
    write!(f, ")")
}

impl fmt::Display for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Procedure::Primitive(primitive) => write!(f, "#<primitive:{}>", primitive.name),
            Procedure::Lambda(lambda) => {
                write!(f, "(lambda {}", lambda.formals)?;
                write_body(f, &lambda.body)
            }
            Procedure::Mu(mu) => {
                write!(f, "(mu {}", mu.formals)?;
                write_body(f, &mu.body)
            }
        }
    }
}

// Environments are left out: a closure's frame usually holds the closure.
impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Procedure::Primitive(primitive) => write!(f, "Primitive({})", primitive.name),
            Procedure::Lambda(lambda) => write!(f, "Lambda({})", lambda.formals),
            Procedure::Mu(mu) => write!(f, "Mu({})", mu.formals),
        }
    }
}

// Primitives compare by name, closures by identity.
impl PartialEq for Procedure {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Procedure::Primitive(p1), Procedure::Primitive(p2)) => p1.name == p2.name,
            (Procedure::Lambda(l1), Procedure::Lambda(l2)) => Rc::ptr_eq(l1, l2),
            (Procedure::Mu(m1), Procedure::Mu(m2)) => Rc::ptr_eq(m1, m2),
            _ => false,
        }
    }
}
