//! Stack-based virtual machine.
//!
//! Single-threaded cooperative evaluator over the decoded bytecode held in
//! [`State`]. The dispatch loop is one tight `match` on the opcode (the
//! compiler turns it into a jump table); runtime faults travel as values
//! through [`RunResult`] and are decided once, at the loop's exit.

pub mod context;
pub mod plugin;
pub mod scope;
pub mod value;

use std::cell::RefCell;
use std::rc::Rc;

use crate::builtins;
use crate::bytecode::{Opcode, Word};
use crate::error::{Error, ErrorKind, RunResult};
use crate::state::State;
use crate::tracer::{NoopTracer, VmTracer};
use crate::vm::context::{ExecutionContext, VM_STACK_SIZE};
use crate::vm::plugin::{ModuleRegistry, NativeModule};
use crate::vm::scope::Scope;
use crate::vm::value::{Closure, Value, ValueRef};

/// Handle to a pending future created by [`Vm::create_future`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FutureId(usize);

#[derive(Debug)]
struct VmFuture {
    function: Value,
    args: Vec<Value>,
    resolved: Option<Value>,
}

/// The virtual machine: execution contexts over one shared [`State`].
pub struct Vm<'s> {
    state: &'s State,
    contexts: Vec<ExecutionContext>,
    futures: Vec<Option<VmFuture>>,
    registry: ModuleRegistry,
    tracer: Box<dyn VmTracer>,
    exit_code: i32,
    running: bool,
    fail_with_exception: bool,
}

impl<'s> Vm<'s> {
    #[must_use]
    pub fn new(state: &'s State) -> Self {
        Self {
            state,
            contexts: vec![ExecutionContext::new()],
            futures: Vec::new(),
            registry: ModuleRegistry::new(),
            tracer: Box::new(NoopTracer),
            exit_code: 0,
            running: false,
            fail_with_exception: false,
        }
    }

    /// Rethrow runtime errors to the caller instead of printing a backtrace.
    #[must_use]
    pub fn with_exceptions(mut self) -> Self {
        self.fail_with_exception = true;
        self
    }

    pub fn set_tracer(&mut self, tracer: Box<dyn VmTracer>) {
        self.tracer = tracer;
    }

    pub fn register_module(&mut self, module: Box<dyn NativeModule>) {
        self.registry.register(module);
    }

    #[must_use]
    pub fn symbols(&self) -> &[String] {
        self.state.symbols()
    }

    /// Asks the VM to stop at the next dispatch boundary.
    pub fn exit(&mut self, code: i32) {
        self.exit_code = code;
        self.running = false;
    }

    // ------------------------------------------------------------------
    // public entry points
    // ------------------------------------------------------------------

    /// Runs the program to completion and returns the exit code.
    ///
    /// With `with_exceptions` set, runtime errors propagate as `Err`;
    /// otherwise the error and a backtrace are printed and the exit code
    /// is 1.
    pub fn run(&mut self) -> RunResult<i32> {
        self.init();
        match self.safe_run(0, 0) {
            Ok(()) => Ok(self.exit_code),
            Err(error) => {
                if self.fail_with_exception {
                    return Err(error);
                }
                eprintln!("{error}");
                self.backtrace(0);
                self.exit_code = 1;
                Ok(self.exit_code)
            }
        }
    }

    /// Runs the program and returns the value left by its last top-level
    /// expression, `nil` when there is none. Errors always propagate.
    pub fn run_value(&mut self) -> RunResult<Value> {
        self.init();
        self.safe_run(0, 0)?;
        let value = match self.contexts[0].stack.pop() {
            Some(value) => value.resolved(),
            None => Value::Nil,
        };
        Ok(value)
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Reads a global by name after a run; `nil` when absent.
    #[must_use]
    pub fn get(&self, name: &str) -> Value {
        let Some(id) = self.state.symbol_id(name) else {
            return Value::Nil;
        };
        self.contexts[0]
            .find_variable(id)
            .map_or(Value::Nil, |(_, value)| value)
    }

    /// Looks a function up by name and calls it with `args` on the primary
    /// context.
    pub fn call_by_name(&mut self, name: &str, args: Vec<Value>) -> RunResult<Value> {
        let function = self.get(name);
        self.call_value(0, function, args)
    }

    // ------------------------------------------------------------------
    // futures
    // ------------------------------------------------------------------

    /// Schedules `function(args)` for execution on a separate context.
    pub fn create_future(&mut self, function: Value, args: Vec<Value>) -> FutureId {
        self.futures.push(Some(VmFuture {
            function,
            args,
            resolved: None,
        }));
        FutureId(self.futures.len() - 1)
    }

    /// Drives a future to completion and returns its value. Resolving an
    /// already-resolved future returns the cached value.
    pub fn resolve_future(&mut self, id: FutureId) -> RunResult<Value> {
        let future = self
            .futures
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or_else(|| Error::new(ErrorKind::Vm, "unknown or deleted future"))?;
        if let Some(value) = future.resolved {
            self.futures[id.0] = Some(VmFuture {
                resolved: Some(value.clone()),
                ..future_placeholder()
            });
            return Ok(value);
        }

        // futures run on their own context, sharing only the globals
        let context = self.contexts[0].fork_globals();
        self.contexts.push(context);
        let ctx = self.contexts.len() - 1;
        let result = self.call_value(ctx, future.function.clone(), future.args.clone());
        self.contexts.truncate(ctx);

        match result {
            Ok(value) => {
                self.futures[id.0] = Some(VmFuture {
                    function: future.function,
                    args: future.args,
                    resolved: Some(value.clone()),
                });
                Ok(value)
            }
            Err(error) => Err(error),
        }
    }

    pub fn delete_future(&mut self, id: FutureId) {
        if let Some(slot) = self.futures.get_mut(id.0) {
            *slot = None;
        }
    }

    // ------------------------------------------------------------------
    // initialization
    // ------------------------------------------------------------------

    fn init(&mut self) {
        self.exit_code = 0;
        self.contexts.truncate(1);
        let context = &mut self.contexts[0];
        context.ip = 0;
        context.pp = 0;
        context.fc = 1;
        context.stack.clear();
        context.locals.clear();
        context
            .locals
            .push(Rc::new(RefCell::new(Scope::new())));
        context.stacked_closure_scopes.clear();
        context.saved_scope = None;

        // host bindings land in the global scope when the program names them
        for (name, value) in self.state.binded() {
            if let Some(id) = self.state.symbol_id(name) {
                self.contexts[0].locals[0]
                    .borrow_mut()
                    .insert(id, value.clone());
            }
        }
    }

    // ------------------------------------------------------------------
    // dispatch loop
    // ------------------------------------------------------------------

    /// Executes until `HALT`, an error, or `fc` dropping to
    /// `until_frame_count` (for nested invocations).
    fn safe_run(&mut self, ctx: usize, until_frame_count: usize) -> RunResult<()> {
        self.running = true;
        while self.running {
            let word = self.fetch(ctx);
            self.contexts[ctx].ip += 4;
            self.tracer.on_instruction(
                self.contexts[ctx].pp,
                self.contexts[ctx].ip - 4,
                word.opcode,
                word.arg,
            );
            let arg = word.arg;

            match word.opcode {
                Opcode::Nop => {}

                Opcode::LoadSymbol => {
                    self.contexts[ctx].last_symbol = arg;
                    match self.contexts[ctx].find_variable(arg) {
                        Some((scope, _)) => {
                            self.push(ctx, Value::Reference(ValueRef { scope, id: arg }))?;
                        }
                        None => {
                            return Err(self.scope_error(format!(
                                "unbound variable `{}'",
                                self.state.symbol_name(arg)
                            )));
                        }
                    }
                }

                Opcode::LoadConst => {
                    let value = self.constant(arg)?;
                    self.push(ctx, value)?;
                }

                Opcode::PopJumpIfTrue => {
                    if self.pop_resolved(ctx)?.is_truthy() {
                        self.contexts[ctx].ip = usize::from(arg) * 4;
                    }
                }

                Opcode::Store => {
                    let value = self.pop_resolved(ctx)?;
                    self.contexts[ctx]
                        .innermost_scope()
                        .borrow_mut()
                        .insert(arg, value);
                }

                Opcode::SetVal => {
                    let value = self.pop_resolved(ctx)?;
                    match self.contexts[ctx].find_variable(arg) {
                        Some((scope, _)) => scope.borrow_mut().insert(arg, value),
                        None => {
                            return Err(self.scope_error(format!(
                                "unbound variable `{}', can not change its value to {}",
                                self.state.symbol_name(arg),
                                value.to_display_string(self.state.symbols())
                            )));
                        }
                    }
                }

                Opcode::PopJumpIfFalse => {
                    if !self.pop_resolved(ctx)?.is_truthy() {
                        self.contexts[ctx].ip = usize::from(arg) * 4;
                    }
                }

                Opcode::Jump => {
                    self.contexts[ctx].ip = usize::from(arg) * 4;
                }

                Opcode::Ret => {
                    self.instruction_ret(ctx)?;
                    self.tracer.on_return(self.contexts[ctx].fc);
                    if self.contexts[ctx].fc <= until_frame_count {
                        return Ok(());
                    }
                }

                Opcode::Halt => {
                    self.running = false;
                }

                Opcode::Call => {
                    self.instruction_call(ctx, arg)?;
                    // sys:exit inside a builtin stops at this boundary
                }

                Opcode::Capture => {
                    let Some((_, value)) = self.contexts[ctx].find_variable(arg) else {
                        return Err(self.scope_error(format!(
                            "couldn't capture `{}' as it is currently unbound",
                            self.state.symbol_name(arg)
                        )));
                    };
                    let context = &mut self.contexts[ctx];
                    context
                        .saved_scope
                        .get_or_insert_with(Scope::new)
                        .insert(arg, value.resolved());
                }

                Opcode::Builtin => {
                    let value = builtins::builtin_value(arg).ok_or_else(|| {
                        Error::new(ErrorKind::Vm, format!("unknown builtin id {arg}"))
                    })?;
                    self.push(ctx, value)?;
                }

                Opcode::Del => {
                    let mut removed = false;
                    for scope in self.contexts[ctx].locals.iter().rev() {
                        if scope.borrow_mut().remove(arg) {
                            removed = true;
                            break;
                        }
                    }
                    if !removed {
                        return Err(self.scope_error(format!(
                            "can not delete unbound variable `{}'",
                            self.state.symbol_name(arg)
                        )));
                    }
                }

                Opcode::MakeClosure => {
                    let Value::PageAddr(page_addr) = self.constant(arg)? else {
                        return Err(Error::new(
                            ErrorKind::Vm,
                            "MAKE_CLOSURE expects a page-address constant",
                        ));
                    };
                    let captured = self.contexts[ctx].saved_scope.take().unwrap_or_default();
                    self.push(ctx, Value::Closure(Closure::new(captured, page_addr)))?;
                }

                Opcode::GetField => self.instruction_get_field(ctx, arg)?,

                Opcode::Plugin => self.load_plugin(ctx, arg)?,

                Opcode::List => {
                    let mut items = Vec::with_capacity(usize::from(arg));
                    for _ in 0..arg {
                        items.push(self.pop_resolved(ctx)?);
                    }
                    self.push(ctx, Value::List(items))?;
                }

                Opcode::Append => {
                    let mut items = match self.pop_resolved(ctx)? {
                        Value::List(items) => items,
                        other => {
                            return Err(contract_error("append", "(list: List, ...)", &other));
                        }
                    };
                    items.reserve(usize::from(arg));
                    for _ in 0..arg {
                        items.push(self.pop_resolved(ctx)?);
                    }
                    self.push(ctx, Value::List(items))?;
                }

                Opcode::Concat => {
                    let mut items = match self.pop_resolved(ctx)? {
                        Value::List(items) => items,
                        other => {
                            return Err(contract_error("concat", "(dst: List, src: List, ...)", &other));
                        }
                    };
                    for _ in 0..arg {
                        match self.pop_resolved(ctx)? {
                            Value::List(other) => items.extend(other),
                            other => {
                                return Err(contract_error(
                                    "concat",
                                    "(dst: List, src: List, ...)",
                                    &other,
                                ));
                            }
                        }
                    }
                    self.push(ctx, Value::List(items))?;
                }

                Opcode::AppendInPlace => {
                    let target = self.pop(ctx)?;
                    let Value::Reference(slot) = &target else {
                        return Err(contract_error("append!", "(list: List, ...)", &target));
                    };
                    let mut appended = Vec::with_capacity(usize::from(arg));
                    for _ in 0..arg {
                        appended.push(self.pop_resolved(ctx)?);
                    }
                    let mut scope = slot.scope.borrow_mut();
                    match scope.get_mut(slot.id) {
                        Some(Value::List(items)) => items.extend(appended),
                        Some(other) => {
                            return Err(contract_error("append!", "(list: List, ...)", other));
                        }
                        None => return Err(self.scope_error("append! on an unbound variable")),
                    }
                }

                Opcode::ConcatInPlace => {
                    let target = self.pop(ctx)?;
                    let Value::Reference(slot) = &target else {
                        return Err(contract_error("concat!", "(dst: List, src: List, ...)", &target));
                    };
                    let mut concatenated = Vec::new();
                    for _ in 0..arg {
                        match self.pop_resolved(ctx)? {
                            Value::List(other) => concatenated.extend(other),
                            other => {
                                return Err(contract_error(
                                    "concat!",
                                    "(dst: List, src: List, ...)",
                                    &other,
                                ));
                            }
                        }
                    }
                    let mut scope = slot.scope.borrow_mut();
                    match scope.get_mut(slot.id) {
                        Some(Value::List(items)) => items.extend(concatenated),
                        Some(other) => {
                            return Err(contract_error("concat!", "(dst: List, src: List, ...)", other));
                        }
                        None => return Err(self.scope_error("concat! on an unbound variable")),
                    }
                }

                Opcode::PopList => {
                    let list = self.pop_resolved(ctx)?;
                    let index = self.pop_resolved(ctx)?;
                    let (Value::List(mut items), Value::Number(n)) = (list, index) else {
                        return Err(Error::new(
                            ErrorKind::Type,
                            "pop expected (list: List, index: Number)",
                        ));
                    };
                    let at = normalize_index(n, items.len()).ok_or_else(|| {
                        index_error(format!(
                            "pop index ({n}) out of range (list size: {})",
                            items.len()
                        ))
                    })?;
                    items.remove(at);
                    self.push(ctx, Value::List(items))?;
                }

                Opcode::PopListInPlace => {
                    let target = self.pop(ctx)?;
                    let index = self.pop_resolved(ctx)?;
                    let Value::Reference(slot) = &target else {
                        return Err(contract_error("pop!", "(list: List, index: Number)", &target));
                    };
                    let Value::Number(n) = &index else {
                        return Err(contract_error("pop!", "(list: List, index: Number)", &index));
                    };
                    let mut scope = slot.scope.borrow_mut();
                    match scope.get_mut(slot.id) {
                        Some(Value::List(items)) => {
                            let at = normalize_index(*n, items.len()).ok_or_else(|| {
                                index_error(format!(
                                    "pop! index ({n}) out of range (list size: {})",
                                    items.len()
                                ))
                            })?;
                            items.remove(at);
                        }
                        Some(other) => {
                            return Err(contract_error("pop!", "(list: List, index: Number)", other));
                        }
                        None => return Err(self.scope_error("pop! on an unbound variable")),
                    }
                }

                Opcode::Pop => {
                    self.pop(ctx)?;
                }

                Opcode::Dup => {
                    let top = self
                        .contexts[ctx]
                        .stack
                        .last()
                        .cloned()
                        .ok_or_else(|| self.underflow())?;
                    self.push(ctx, top)?;
                }

                // ------------------------- operators -------------------------
                Opcode::Add => {
                    let (a, b) = self.pop_pair(ctx)?;
                    let result = match (&a, &b) {
                        (Value::Number(x), Value::Number(y)) => Value::Number(x + y),
                        (Value::String(x), Value::String(y)) => Value::String(format!("{x}{y}")),
                        _ => {
                            return Err(contract_error_2(
                                "+",
                                "(a: Number, b: Number) or (a: String, b: String)",
                                &a,
                                &b,
                            ));
                        }
                    };
                    self.push(ctx, result)?;
                }

                Opcode::Sub => self.numeric_op(ctx, "-", |x, y| x - y)?,
                Opcode::Mul => self.numeric_op(ctx, "*", |x, y| x * y)?,

                Opcode::Div => {
                    let (a, b) = self.pop_pair(ctx)?;
                    let (Value::Number(x), Value::Number(y)) = (&a, &b) else {
                        return Err(contract_error_2("/", "(a: Number, b: Number)", &a, &b));
                    };
                    if *y == 0.0 {
                        return Err(Error::new(
                            ErrorKind::DivisionByZero,
                            format!("can not compute expression (/ {x} {y})"),
                        ));
                    }
                    self.push(ctx, Value::Number(x / y))?;
                }

                Opcode::Gt => self.compare(ctx, |a, b| a != b && !less(a, b))?,
                Opcode::Lt => self.compare(ctx, |a, b| less(a, b))?,
                Opcode::Le => self.compare(ctx, |a, b| less(a, b) || a == b)?,
                Opcode::Ge => self.compare(ctx, |a, b| !less(a, b))?,
                Opcode::Neq => self.compare(ctx, |a, b| a != b)?,
                Opcode::Eq => self.compare(ctx, |a, b| a == b)?,

                Opcode::Len => {
                    let a = self.pop_resolved(ctx)?;
                    let length = match &a {
                        Value::List(items) => items.len(),
                        Value::String(text) => text.chars().count(),
                        _ => return Err(contract_error("len", "(value: List) or (value: String)", &a)),
                    };
                    self.push(ctx, Value::Number(length as f64))?;
                }

                Opcode::Empty => {
                    let a = self.pop_resolved(ctx)?;
                    let empty = match &a {
                        Value::List(items) => items.is_empty(),
                        Value::String(text) => text.is_empty(),
                        _ => {
                            return Err(contract_error(
                                "empty?",
                                "(value: List) or (value: String)",
                                &a,
                            ));
                        }
                    };
                    self.push(ctx, Value::from_bool(empty))?;
                }

                Opcode::Tail => {
                    let a = self.pop_resolved(ctx)?;
                    let tail = match &a {
                        Value::List(items) if items.len() < 2 => Value::List(vec![]),
                        Value::List(items) => Value::List(items[1..].to_vec()),
                        Value::String(text) => {
                            let mut chars = text.chars();
                            chars.next();
                            Value::String(chars.as_str().to_owned())
                        }
                        _ => return Err(contract_error("tail", "(value: List) or (value: String)", &a)),
                    };
                    self.push(ctx, tail)?;
                }

                Opcode::Head => {
                    let a = self.pop_resolved(ctx)?;
                    let head = match &a {
                        Value::List(items) => items.first().cloned().unwrap_or(Value::Nil),
                        Value::String(text) => Value::String(
                            text.chars().next().map(String::from).unwrap_or_default(),
                        ),
                        _ => return Err(contract_error("head", "(value: List) or (value: String)", &a)),
                    };
                    self.push(ctx, head)?;
                }

                Opcode::IsNil => {
                    let a = self.pop_resolved(ctx)?;
                    self.push(ctx, Value::from_bool(a == Value::Nil))?;
                }

                Opcode::Assert => {
                    let message = self.pop_resolved(ctx)?;
                    let condition = self.pop_resolved(ctx)?;
                    let Value::String(text) = &message else {
                        return Err(contract_error_2(
                            "assert",
                            "(expr: Any, message: String)",
                            &condition,
                            &message,
                        ));
                    };
                    if condition == Value::False {
                        return Err(Error::new(ErrorKind::Assertion, text.clone()));
                    }
                }

                Opcode::ToNum => {
                    let a = self.pop_resolved(ctx)?;
                    let Value::String(text) = &a else {
                        return Err(contract_error("toNumber", "(value: String)", &a));
                    };
                    let value = text
                        .trim()
                        .parse::<f64>()
                        .map_or(Value::Nil, Value::Number);
                    self.push(ctx, value)?;
                }

                Opcode::ToStr => {
                    let a = self.pop_resolved(ctx)?;
                    let text = a.to_display_string(self.state.symbols());
                    self.push(ctx, Value::String(text))?;
                }

                Opcode::At => {
                    let index = self.pop_resolved(ctx)?;
                    let collection = self.pop_resolved(ctx)?;
                    let Value::Number(n) = &index else {
                        return Err(contract_error_2(
                            "@",
                            "(src: List, idx: Number) or (src: String, idx: Number)",
                            &collection,
                            &index,
                        ));
                    };
                    let value = match &collection {
                        Value::List(items) => {
                            let at = normalize_index(*n, items.len()).ok_or_else(|| {
                                index_error(format!(
                                    "{n} out of range {} (length {})",
                                    collection.to_display_string(self.state.symbols()),
                                    items.len()
                                ))
                            })?;
                            items[at].clone()
                        }
                        Value::String(text) => {
                            let chars: Vec<char> = text.chars().collect();
                            let at = normalize_index(*n, chars.len()).ok_or_else(|| {
                                index_error(format!(
                                    "{n} out of range \"{text}\" (length {})",
                                    chars.len()
                                ))
                            })?;
                            Value::String(chars[at].to_string())
                        }
                        _ => {
                            return Err(contract_error_2(
                                "@",
                                "(src: List, idx: Number) or (src: String, idx: Number)",
                                &collection,
                                &index,
                            ));
                        }
                    };
                    self.push(ctx, value)?;
                }

                Opcode::Mod => {
                    let (a, b) = self.pop_pair(ctx)?;
                    let (Value::Number(x), Value::Number(y)) = (&a, &b) else {
                        return Err(contract_error_2("mod", "(a: Number, b: Number)", &a, &b));
                    };
                    self.push(ctx, Value::Number(x % y))?;
                }

                Opcode::Type => {
                    let a = self.pop_resolved(ctx)?;
                    if a == Value::Undefined {
                        return Err(contract_error("type", "(value: Any)", &a));
                    }
                    self.push(ctx, Value::String(a.type_name().to_owned()))?;
                }

                Opcode::HasField => {
                    let field = self.pop_resolved(ctx)?;
                    let closure = self.pop_resolved(ctx)?;
                    let (Value::Closure(c), Value::String(name)) = (&closure, &field) else {
                        return Err(contract_error_2(
                            "hasField",
                            "(closure: Closure, field: String)",
                            &closure,
                            &field,
                        ));
                    };
                    let has = self
                        .state
                        .symbol_id(name)
                        .is_some_and(|id| c.scope.borrow().get(id).is_some());
                    self.push(ctx, Value::from_bool(has))?;
                }

                Opcode::Not => {
                    let a = self.pop_resolved(ctx)?;
                    self.push(ctx, Value::from_bool(!a.is_truthy()))?;
                }

                Opcode::And => {
                    let (a, b) = self.pop_pair(ctx)?;
                    self.push(ctx, Value::from_bool(a.is_truthy() && b.is_truthy()))?;
                }

                Opcode::Or => {
                    let (a, b) = self.pop_pair(ctx)?;
                    self.push(ctx, Value::from_bool(a.is_truthy() || b.is_truthy()))?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // call machinery
    // ------------------------------------------------------------------

    fn instruction_call(&mut self, ctx: usize, argc: u16) -> RunResult<()> {
        let callee = self.pop(ctx)?.resolved();
        self.enter_call(ctx, callee, argc)
    }

    /// Function call protocol: closures and bare pages get a frame, native
    /// procedures run inline without frame bookkeeping.
    fn enter_call(&mut self, ctx: usize, callee: Value, argc: u16) -> RunResult<()> {
        match callee {
            Value::Closure(closure) => {
                self.push_frame(ctx, argc, Some(Rc::clone(&closure.scope)))?;
                self.tracer.on_call(closure.page_addr, argc);
                let context = &mut self.contexts[ctx];
                context.pp = usize::from(closure.page_addr);
                context.ip = 0;
                context.fc += 1;
                Ok(())
            }
            Value::PageAddr(page) => {
                self.push_frame(ctx, argc, None)?;
                self.tracer.on_call(page, argc);
                let context = &mut self.contexts[ctx];
                context.pp = usize::from(page);
                context.ip = 0;
                context.fc += 1;
                Ok(())
            }
            Value::CProc(proc) => {
                let mut args = Vec::with_capacity(usize::from(argc));
                for _ in 0..argc {
                    args.push(self.pop_resolved(ctx)?);
                }
                args.reverse();
                let result = proc(self, args)?;
                self.push(ctx, result)
            }
            other => {
                let name = self.state.symbol_name(self.contexts[ctx].last_symbol);
                Err(Error::new(
                    ErrorKind::Type,
                    format!("`{name}' is a {}, not a Function, and can not be called", other.type_name()),
                ))
            }
        }
    }

    /// Rearranges `[... arg1..argN]` into `[... pp ip argN..arg1]` and
    /// pushes the callee scopes.
    fn push_frame(
        &mut self,
        ctx: usize,
        argc: u16,
        closure_scope: Option<Rc<RefCell<Scope>>>,
    ) -> RunResult<()> {
        if self.contexts[ctx].sp() + 2 >= VM_STACK_SIZE {
            let name = self.state.symbol_name(self.contexts[ctx].last_symbol);
            return Err(Error::new(
                ErrorKind::Vm,
                format!(
                    "maximum recursion depth exceeded; consider rewriting `{name}' to use tail-call optimization"
                ),
            ));
        }

        let mut args = Vec::with_capacity(usize::from(argc));
        for _ in 0..argc {
            args.push(self.pop(ctx)?);
        }
        let context = &mut self.contexts[ctx];
        let pp = u16::try_from(context.pp).expect("page count fits u16");
        let ip = u16::try_from(context.ip).expect("page size fits u16");
        context.stack.push(Value::InstPtr(pp));
        context.stack.push(Value::InstPtr(ip));
        // args were popped top-first, so pushing back reverses them: the
        // first argument ends up on top for the callee's prologue
        for arg in args {
            context.stack.push(arg);
        }

        if let Some(scope) = closure_scope {
            context.locals.push(Rc::clone(&scope));
            context.stacked_closure_scopes.push(Some(scope));
        } else {
            context.stacked_closure_scopes.push(None);
        }
        context.locals.push(Rc::new(RefCell::new(Scope::new())));
        Ok(())
    }

    fn instruction_ret(&mut self, ctx: usize) -> RunResult<()> {
        let first = self.pop(ctx)?;
        if let Value::InstPtr(addr) = first {
            // no return value above the frame marker
            let pp = self.pop_inst_ptr(ctx)?;
            let context = &mut self.contexts[ctx];
            context.ip = usize::from(addr);
            context.pp = usize::from(pp);
            self.return_from_call(ctx);
            return self.push(ctx, Value::Nil);
        }

        let value = first.resolved();
        let addr = loop {
            match self.pop(ctx)? {
                Value::InstPtr(addr) => break addr,
                _ => continue,
            }
        };
        let pp = self.pop_inst_ptr(ctx)?;
        let context = &mut self.contexts[ctx];
        context.ip = usize::from(addr);
        context.pp = usize::from(pp);
        self.return_from_call(ctx);
        self.push(ctx, value)
    }

    fn return_from_call(&mut self, ctx: usize) {
        let context = &mut self.contexts[ctx];
        context.locals.pop();
        if let Some(Some(_)) = context.stacked_closure_scopes.pop() {
            // the closure scope spliced under the frame scope
            context.locals.pop();
        }
        context.fc -= 1;
    }

    /// Calls `function` with `args` on `ctx`, driving the VM until the
    /// call frame unwinds.
    fn call_value(&mut self, ctx: usize, function: Value, args: Vec<Value>) -> RunResult<Value> {
        let argc = u16::try_from(args.len())
            .map_err(|_| Error::new(ErrorKind::Vm, "too many call arguments"))?;
        for arg in args {
            self.push(ctx, arg)?;
        }
        let frames_before = self.contexts[ctx].fc;
        let is_frame_call = matches!(function, Value::Closure(_) | Value::PageAddr(_));
        self.enter_call(ctx, function, argc)?;
        if is_frame_call {
            self.safe_run(ctx, frames_before)?;
        }
        Ok(self
            .contexts[ctx]
            .stack
            .pop()
            .map_or(Value::Nil, Value::resolved))
    }

    // ------------------------------------------------------------------
    // fields and plugins
    // ------------------------------------------------------------------

    fn instruction_get_field(&mut self, ctx: usize, arg: u16) -> RunResult<()> {
        let target = self.pop_resolved(ctx)?;
        let Value::Closure(closure) = &target else {
            let symbol = self.state.symbol_name(self.contexts[ctx].last_symbol);
            return Err(Error::new(
                ErrorKind::Type,
                format!(
                    "`{symbol}' is a {}, not a Closure, can not get the field `{}' from it",
                    target.type_name(),
                    self.state.symbol_name(arg)
                ),
            ));
        };

        let field = closure.scope.borrow().get(arg).cloned();
        let Some(field) = field else {
            return Err(self.scope_error(format!(
                "`{}' isn't in the closure environment: {}",
                self.state.symbol_name(arg),
                target.to_display_string(self.state.symbols())
            )));
        };

        // a page-valued field called right away becomes a method: it runs
        // inside its parent closure's scope
        let next_is_call = self.peek_opcode(ctx) == Some(Opcode::Call);
        let value = match field {
            Value::PageAddr(page) if next_is_call => Value::Closure(Closure {
                scope: Rc::clone(&closure.scope),
                page_addr: page,
            }),
            other => other,
        };
        self.push(ctx, value)
    }

    fn load_plugin(&mut self, ctx: usize, arg: u16) -> RunResult<()> {
        let Value::String(file) = self.constant(arg)? else {
            return Err(Error::new(
                ErrorKind::Vm,
                "PLUGIN expects a string constant",
            ));
        };
        if self.registry.is_loaded(&file) {
            return Ok(());
        }

        let stem = std::path::Path::new(&file)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.clone());
        let Some(module) = self.registry.find(&stem) else {
            return Err(Error::new(
                ErrorKind::Module,
                format!("could not find module '{file}' among the registered native modules"),
            ));
        };

        // bind every exported function the program names into the globals
        let mappings = module.functions();
        self.registry.mark_loaded(&file);
        let global = self.contexts[ctx].global_scope();
        for (name, function) in mappings {
            if let Some(id) = self.state.symbol_id(&name) {
                global.borrow_mut().insert(id, Value::CProc(function));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // stack helpers
    // ------------------------------------------------------------------

    fn fetch(&self, ctx: usize) -> Word {
        let context = &self.contexts[ctx];
        // running off a page behaves like the encoder's trailing guard
        self.state
            .pages()
            .get(context.pp)
            .and_then(|page| page.get(context.ip / 4))
            .copied()
            .unwrap_or(Word::bare(Opcode::Halt))
    }

    fn peek_opcode(&self, ctx: usize) -> Option<Opcode> {
        let context = &self.contexts[ctx];
        self.state
            .pages()
            .get(context.pp)
            .and_then(|page| page.get(context.ip / 4))
            .map(|word| word.opcode)
    }

    fn constant(&self, id: u16) -> RunResult<Value> {
        self.state
            .constants()
            .get(usize::from(id))
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::Vm, format!("constant id {id} out of range")))
    }

    fn push(&mut self, ctx: usize, value: Value) -> RunResult<()> {
        let context = &mut self.contexts[ctx];
        if context.stack.len() >= VM_STACK_SIZE {
            return Err(Error::new(ErrorKind::Vm, "stack overflow"));
        }
        context.stack.push(value);
        Ok(())
    }

    fn pop(&mut self, ctx: usize) -> RunResult<Value> {
        self.contexts[ctx]
            .stack
            .pop()
            .ok_or_else(|| self.underflow())
    }

    fn pop_resolved(&mut self, ctx: usize) -> RunResult<Value> {
        Ok(self.pop(ctx)?.resolved())
    }

    fn pop_pair(&mut self, ctx: usize) -> RunResult<(Value, Value)> {
        let b = self.pop_resolved(ctx)?;
        let a = self.pop_resolved(ctx)?;
        Ok((a, b))
    }

    fn pop_inst_ptr(&mut self, ctx: usize) -> RunResult<u16> {
        match self.pop(ctx)? {
            Value::InstPtr(addr) => Ok(addr),
            other => Err(Error::new(
                ErrorKind::Vm,
                format!("corrupted frame: expected an InstPtr, got {}", other.type_name()),
            )),
        }
    }

    fn numeric_op(&mut self, ctx: usize, name: &str, op: fn(f64, f64) -> f64) -> RunResult<()> {
        let (a, b) = self.pop_pair(ctx)?;
        let (Value::Number(x), Value::Number(y)) = (&a, &b) else {
            return Err(contract_error_2(name, "(a: Number, b: Number)", &a, &b));
        };
        self.push(ctx, Value::Number(op(*x, *y)))
    }

    fn compare(&mut self, ctx: usize, predicate: fn(&Value, &Value) -> bool) -> RunResult<()> {
        let (a, b) = self.pop_pair(ctx)?;
        self.push(ctx, Value::from_bool(predicate(&a, &b)))
    }

    fn underflow(&self) -> Error {
        Error::new(ErrorKind::Vm, "stack underflow")
    }

    fn scope_error(&self, message: impl Into<String>) -> Error {
        Error::new(ErrorKind::Scope, message)
    }

    // ------------------------------------------------------------------
    // diagnostics
    // ------------------------------------------------------------------

    /// Prints the call stack, resolving each page back to the nearest
    /// variable holding it, then dumps the innermost scope.
    fn backtrace(&mut self, ctx: usize) {
        let context = &self.contexts[ctx];
        let saved_ip = context.ip;
        let saved_pp = context.pp;
        let saved_sp = context.sp();
        let original_frame_count = context.fc;

        if original_frame_count > 1 {
            let current_scope = context.innermost_scope();

            while self.contexts[ctx].fc > 1 {
                let frame = self.contexts[ctx].fc;
                let pp = self.contexts[ctx].pp;
                if pp == 0 {
                    eprintln!("[{frame}] in the global scope");
                    break;
                }
                let name = self.function_name_for_page(ctx, pp);
                eprintln!("[{frame}] in function `{name}'");

                // unwind one frame by replaying the return path
                if self.unwind_one_frame(ctx).is_err() {
                    break;
                }
                if original_frame_count - self.contexts[ctx].fc > 7 {
                    eprintln!("...");
                    break;
                }
            }

            eprintln!("\ncurrent scope variables:");
            for (id, value) in current_scope.borrow().iter() {
                eprintln!(
                    "{} = {}",
                    self.state.symbol_name(*id),
                    value.to_display_string(self.state.symbols())
                );
            }
        }

        eprintln!("at ip: {}, pp: {saved_pp}, sp: {saved_sp}", saved_ip / 4);
    }

    fn unwind_one_frame(&mut self, ctx: usize) -> RunResult<()> {
        let addr = loop {
            match self.pop(ctx)? {
                Value::InstPtr(addr) => break addr,
                _ => continue,
            }
        };
        let pp = self.pop_inst_ptr(ctx)?;
        let context = &mut self.contexts[ctx];
        context.ip = usize::from(addr);
        context.pp = usize::from(pp);
        self.return_from_call(ctx);
        Ok(())
    }

    fn function_name_for_page(&self, ctx: usize, pp: usize) -> String {
        let needle = Value::PageAddr(u16::try_from(pp).unwrap_or(u16::MAX));
        for scope in self.contexts[ctx].locals.iter().rev() {
            if let Some(id) = scope.borrow().id_of(&needle) {
                return self.state.symbol_name(id).to_owned();
            }
        }
        "???".to_owned()
    }
}

impl std::fmt::Debug for Vm<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm")
            .field("contexts", &self.contexts.len())
            .field("exit_code", &self.exit_code)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

fn future_placeholder() -> VmFuture {
    VmFuture {
        function: Value::Nil,
        args: Vec::new(),
        resolved: None,
    }
}

/// Normalizes a possibly negative index; `None` when out of range.
fn normalize_index(n: f64, len: usize) -> Option<usize> {
    #[expect(clippy::cast_possible_truncation, reason = "indices are small integers")]
    let raw = n as i64;
    let index = if raw < 0 { raw + len as i64 } else { raw };
    (index >= 0 && (index as usize) < len).then_some(index as usize)
}

fn less(a: &Value, b: &Value) -> bool {
    matches!(a.partial_cmp(b), Some(std::cmp::Ordering::Less))
}

fn contract_error(name: &str, contract: &str, got: &Value) -> Error {
    Error::new(
        ErrorKind::Type,
        format!("{name} expected {contract}, got {}", got.type_name()),
    )
}

fn contract_error_2(name: &str, contract: &str, a: &Value, b: &Value) -> Error {
    Error::new(
        ErrorKind::Type,
        format!(
            "{name} expected {contract}, got ({}, {})",
            a.type_name(),
            b.type_name()
        ),
    )
}

fn index_error(message: String) -> Error {
    Error::new(ErrorKind::Index, message)
}
