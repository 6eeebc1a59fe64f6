//! Independent VM runtime state.
//!
//! A context owns the execution stack, the scope chain and the instruction
//! pointers. Several contexts can coexist on one VM (futures run on their
//! own), but a context is only ever advanced from one place at a time.

use std::cell::RefCell;
use std::rc::Rc;

use crate::vm::scope::Scope;
use crate::vm::value::Value;

/// Fixed operand-stack size, in slots.
pub const VM_STACK_SIZE: usize = 8192;

/// One execution context: stack, scope chain, pointers and frame count.
#[derive(Debug)]
pub struct ExecutionContext {
    /// Instruction pointer, a byte offset inside the current page.
    pub ip: usize,
    /// Page pointer, an index into the code pages.
    pub pp: usize,
    /// Frame count; 1 while running top-level code.
    pub fc: usize,
    pub stack: Vec<Value>,
    /// Scope chain, innermost last. Slot 0 is the global scope.
    pub locals: Vec<Rc<RefCell<Scope>>>,
    /// Per call frame: the closure scope spliced under the frame's scope,
    /// if the callee was a closure. Keeps captured scopes alive and tells
    /// the return path how many scopes to pop.
    pub stacked_closure_scopes: Vec<Option<Rc<RefCell<Scope>>>>,
    /// Capture scope being filled by `CAPTURE` words, consumed by the next
    /// `MAKE_CLOSURE`.
    pub saved_scope: Option<Scope>,
    /// Last symbol id touched by `LOAD_SYMBOL`, for error messages.
    pub last_symbol: u16,
}

impl ExecutionContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ip: 0,
            pp: 0,
            fc: 1,
            stack: Vec::with_capacity(64),
            locals: vec![Rc::new(RefCell::new(Scope::new()))],
            stacked_closure_scopes: Vec::new(),
            saved_scope: None,
            last_symbol: 0,
        }
    }

    /// A context sharing this one's global scope, for futures.
    #[must_use]
    pub fn fork_globals(&self) -> Self {
        let mut context = Self::new();
        context.locals = vec![Rc::clone(&self.locals[0])];
        context
    }

    /// Current stack height.
    #[must_use]
    pub fn sp(&self) -> usize {
        self.stack.len()
    }

    /// Scans the scope chain from innermost outward.
    #[must_use]
    pub fn find_variable(&self, id: u16) -> Option<(Rc<RefCell<Scope>>, Value)> {
        for scope in self.locals.iter().rev() {
            if let Some(value) = scope.borrow().get(id) {
                return Some((Rc::clone(scope), value.clone()));
            }
        }
        None
    }

    #[must_use]
    pub fn global_scope(&self) -> Rc<RefCell<Scope>> {
        Rc::clone(&self.locals[0])
    }

    #[must_use]
    pub fn innermost_scope(&self) -> Rc<RefCell<Scope>> {
        Rc::clone(self.locals.last().expect("locals always holds the global scope"))
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_innermost_outward() {
        let mut context = ExecutionContext::new();
        context.locals[0].borrow_mut().insert(1, Value::Number(1.0));
        let inner = Rc::new(RefCell::new(Scope::new()));
        inner.borrow_mut().insert(1, Value::Number(2.0));
        context.locals.push(inner);

        let (_, value) = context.find_variable(1).expect("variable should resolve");
        assert_eq!(value, Value::Number(2.0));
    }

    #[test]
    fn fork_shares_the_global_scope() {
        let context = ExecutionContext::new();
        context.locals[0].borrow_mut().insert(9, Value::True);
        let fork = context.fork_globals();
        assert_eq!(fork.locals[0].borrow().get(9), Some(&Value::True));
    }
}
