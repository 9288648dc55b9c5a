use crate::evaluator::{EvalError, EvalResult};
use crate::source::Span;
use crate::types::{Formals, Node, Primitive};
use log::debug;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use thiserror::Error;

/// Shared handle to a frame. Frames are never copied, only referenced.
pub type Env = Rc<RefCell<Environment>>;

// --- Environment Error ---
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvError {
    #[error("Unbound name: '{0}'")]
    UnboundName(String, Span), // Symbol name, span where lookup happened
}

// --- Environment Definition ---

#[derive(Debug, Default)]
pub struct Environment {
    // Parent links only ever point outward, toward the frame's creator.
    outer: Option<Env>,
    bindings: HashMap<String, Node>, // Maps variable names to Nodes
}

impl Environment {
    /// Creates a new, top-level (global) environment.
    pub fn new() -> Env {
        Rc::new(RefCell::new(Environment::default()))
    }

    /// Global environment with every primitive bound.
    pub fn new_global_populated() -> Env {
        let env_ptr = Environment::new();
        crate::primitives::register(&mut env_ptr.borrow_mut());
        debug!(
            "global frame created with {} primitives",
            env_ptr.borrow().bindings.len()
        );
        env_ptr
    }

    /// Creates a new environment enclosed within an outer one.
    pub fn new_enclosed(outer_env: Env) -> Env {
        Rc::new(RefCell::new(Environment {
            outer: Some(outer_env),
            bindings: HashMap::new(),
        }))
    }

    /// New frame under `parent` with `args` bound to `formals`.
    /// Surplus arguments go to the rest parameter as a list.
    pub fn make_child_frame(
        parent: &Env,
        formals: &Formals,
        args: Vec<Node>,
        span: Span,
    ) -> EvalResult<Env> {
        let arity = formals.arity();
        if !arity.accepts(args.len()) {
            return Err(EvalError::ArityMismatch(
                format!(
                    "procedure {} expects {} arguments, got {}",
                    formals,
                    arity,
                    args.len()
                ),
                span,
            ));
        }

        let mut frame = Environment {
            outer: Some(parent.clone()),
            bindings: HashMap::with_capacity(args.len()),
        };
        let mut args = args.into_iter();
        for name in &formals.required {
            // Count was checked above
            if let Some(value) = args.next() {
                frame.define(name.clone(), value);
            }
        }
        if let Some(rest) = &formals.rest {
            frame.define(rest.clone(), Node::new_list(args.collect(), span));
        }
        Ok(Rc::new(RefCell::new(frame)))
    }

    /// Defines a variable in the *current* environment frame.
    /// Replaces the value if the variable already exists in this frame.
    pub fn define(&mut self, name: String, value_node: Node) {
        self.bindings.insert(name, value_node);
    }

    /// Looks up a variable's value.
    /// Checks the current environment first, then walks up the outer environment chain.
    /// `lookup_span` is the location where the variable was referenced, used for error reporting.
    pub fn get(&self, name: &str, lookup_span: Span) -> Result<Node, EnvError> {
        if let Some(value_node) = self.bindings.get(name) {
            return Ok(value_node.clone());
        }
        // Walk iteratively: dynamic frames chain as deep as the call stack.
        let mut current = self.outer.clone();
        while let Some(env_ptr) = current {
            let env = env_ptr.borrow();
            if let Some(value_node) = env.bindings.get(name) {
                return Ok(value_node.clone());
            }
            current = env.outer.clone();
        }
        Err(EnvError::UnboundName(name.to_string(), lookup_span))
    }

    /// Sets the value of an *existing* variable in the environment chain.
    /// Searches outward from the current environment and updates the first frame
    /// where the variable is found. Errors if the variable is not defined.
    /// `set_span` is the location of the `set!` expression.
    pub fn set(&mut self, name: &str, value_node: Node, set_span: Span) -> Result<(), EnvError> {
        if let Some(value_mut) = self.bindings.get_mut(name) {
            *value_mut = value_node;
            return Ok(());
        }
        let mut current = self.outer.clone();
        while let Some(env_ptr) = current {
            let mut env = env_ptr.borrow_mut();
            if let Some(value_mut) = env.bindings.get_mut(name) {
                *value_mut = value_node;
                return Ok(());
            }
            current = env.outer.clone();
        }
        Err(EnvError::UnboundName(name.to_string(), set_span))
    }

    /// Helper to add a primitive procedure to the environment.
    pub fn add_primitive(&mut self, primitive: Primitive) {
        let name = primitive.name.to_string();
        self.define(name, Node::new_primitive(primitive, Span::default()));
    }

    /// Gets a list of all identifiers visible from this environment
    pub fn get_identifiers(&self) -> HashSet<String> {
        let mut identifiers: HashSet<String> = self.bindings.keys().cloned().collect();
        let mut current = self.outer.clone();
        while let Some(env_ptr) = current {
            let env = env_ptr.borrow();
            identifiers.extend(env.bindings.keys().cloned());
            current = env.outer.clone();
        }
        identifiers
    }
}

// Unlinks the parent chain iteratively so a long chain of otherwise
// unreferenced frames does not recurse once per frame when dropped.
impl Drop for Environment {
    fn drop(&mut self) {
        let mut next = self.outer.take();
        while let Some(env_ptr) = next {
            match Rc::try_unwrap(env_ptr) {
                Ok(cell) => next = cell.into_inner().outer.take(),
                Err(_) => break,
            }
        }
    }
}
