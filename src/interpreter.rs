//! Tree-walking evaluator over the preprocessed token stream.
//!
//! The interpreter owns the context: root scope, scope stack, constant
//! singletons, built-in prototypes, the heap registry and the pending
//! control-flow signal. Evaluation is recursive descent over a
//! [`TokenStream`]; an `exec` flag is threaded through every function so
//! that short-circuiting and pending signals can skip sub-expressions
//! while still consuming their tokens.

use std::mem;
use std::rc::Rc;

use tracing::debug;

use crate::error::{ErrorKind, ScriptError, ScriptResult};
use crate::gc::{GcStats, Heap};
use crate::lexer::Lexer;
use crate::object::{
    enumerable_keys, find_in_scopes, prototype_would_cycle, scope_let_target, scope_var_target,
    LinkFlags, Slot, ACCESSOR_GET, ACCESSOR_SET, ARGUMENTS, CONSTRUCTOR, PROTOTYPE, THIS,
};
use crate::token::{
    DestructuringData, FncData, ForwardData, LiteralMode, Token, TokenKind,
};
use crate::tokenizer::tokenize;
use crate::value::{
    number_kind, strict_equals, NativeFunction, ScopeKind, ScriptFunction, ScriptVar, VarKind,
    VarPtr,
};

/// Cursor over a preprocessed token vector.
pub struct TokenStream<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> TokenStream<'a> {
    /// Create a cursor at the start of a token vector.
    pub fn new(tokens: &'a [Token]) -> Self {
        TokenStream { tokens, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    /// Current kind; Eof past the end.
    fn kind(&self) -> TokenKind {
        self.tokens.get(self.pos).map(|t| t.kind.clone()).unwrap_or(TokenKind::Eof)
    }

    fn is(&self, kind: &TokenKind) -> bool {
        match self.tokens.get(self.pos) {
            Some(t) => t.kind.same_kind(kind),
            None => matches!(kind, TokenKind::Eof),
        }
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    /// Advance past a token the tokenizer guarantees to be here.
    fn expect(&mut self, kind: &TokenKind) {
        debug_assert!(self.is(kind), "stream expected {:?}, found {:?}", kind, self.kind());
        self.pos += 1;
    }

    fn save(&self) -> usize {
        self.pos
    }

    fn set_pos(&mut self, pos: usize) {
        self.pos = pos;
    }

    fn line(&self) -> u32 {
        self.tokens.get(self.pos.min(self.tokens.len().saturating_sub(1))).map_or(0, |t| t.line as u32)
    }

    fn column(&self) -> u32 {
        self.tokens
            .get(self.pos.min(self.tokens.len().saturating_sub(1)))
            .map_or(0, |t| t.column as u32)
    }
}

/// Pending non-local control flow. The evaluator keeps walking tokens
/// while a signal is set, but stops materialising values until a loop,
/// switch, call boundary or try handler consumes it.
#[derive(Debug, Clone)]
pub(crate) enum Signal {
    None,
    Break(Option<String>),
    Continue(Option<String>),
    Return(VarPtr),
    Throw(VarPtr),
}

impl Signal {
    fn is_none(&self) -> bool {
        matches!(self, Signal::None)
    }
}

/// The per-context constant singletons.
pub struct Constants {
    pub undefined: VarPtr,
    pub null: VarPtr,
    pub nan: VarPtr,
    pub true_v: VarPtr,
    pub false_v: VarPtr,
    pub infinity_positive: VarPtr,
    pub infinity_negative: VarPtr,
    pub zero: VarPtr,
    pub one: VarPtr,
}

/// Built-in class prototypes, one per value kind plus the six error
/// kinds. Instances are wired to these at allocation.
pub struct Prototypes {
    pub object: VarPtr,
    pub array: VarPtr,
    pub string: VarPtr,
    pub number: VarPtr,
    pub boolean: VarPtr,
    pub function: VarPtr,
    pub regexp: VarPtr,
    pub error: [VarPtr; 6],
}

impl Prototypes {
    /// Prototype for the given error kind.
    pub fn error_proto(&self, kind: ErrorKind) -> &VarPtr {
        let idx = ErrorKind::all().iter().position(|k| *k == kind).unwrap_or(0);
        &self.error[idx]
    }
}

/// The interpreter context.
pub struct Interpreter {
    root: VarPtr,
    scopes: Vec<VarPtr>,
    pub(crate) sig: Signal,
    heap: Heap,
    pub consts: Constants,
    pub protos: Prototypes,
    call_depth: usize,
    max_call_depth: usize,
    /// Set while evaluating a `typeof` operand: unresolved identifiers
    /// read as undefined instead of raising ReferenceError.
    ref_suppressed: bool,
    current_file: String,
}

impl Interpreter {
    /// Create a context: heap, root scope, constant singletons, class
    /// prototypes, and the built-in globals.
    pub fn new() -> Self {
        let mut heap = Heap::new();

        let track = |heap: &mut Heap, v: VarPtr| {
            heap.track(&v);
            v
        };

        let root = track(&mut heap, ScriptVar::new(VarKind::Scope(ScopeKind::Root)));

        let consts = Constants {
            undefined: track(&mut heap, ScriptVar::new(VarKind::Undefined)),
            null: track(&mut heap, ScriptVar::new(VarKind::Null)),
            nan: track(&mut heap, ScriptVar::new(VarKind::NaN)),
            true_v: track(&mut heap, ScriptVar::new(VarKind::Bool(true))),
            false_v: track(&mut heap, ScriptVar::new(VarKind::Bool(false))),
            infinity_positive: track(&mut heap, ScriptVar::new(VarKind::Infinity(1))),
            infinity_negative: track(&mut heap, ScriptVar::new(VarKind::Infinity(-1))),
            zero: track(&mut heap, ScriptVar::new(VarKind::Int(0))),
            one: track(&mut heap, ScriptVar::new(VarKind::Int(1))),
        };

        let object_proto = track(&mut heap, ScriptVar::new(VarKind::Object));
        let proto = |heap: &mut Heap| {
            let p = ScriptVar::new(VarKind::Object);
            p.borrow_mut().prototype = Some(object_proto.clone());
            heap.track(&p);
            p
        };
        let error_base = proto(&mut heap);
        let mut error_protos = vec![error_base.clone()];
        for _ in 1..6 {
            let p = ScriptVar::new(VarKind::Object);
            p.borrow_mut().prototype = Some(error_base.clone());
            heap.track(&p);
            error_protos.push(p);
        }
        let protos = Prototypes {
            array: proto(&mut heap),
            string: proto(&mut heap),
            number: proto(&mut heap),
            boolean: proto(&mut heap),
            function: proto(&mut heap),
            regexp: proto(&mut heap),
            object: object_proto,
            error: error_protos.try_into().expect("six error prototypes"),
        };

        let mut interp = Interpreter {
            scopes: vec![root.clone()],
            root,
            sig: Signal::None,
            heap,
            consts,
            protos,
            call_depth: 0,
            max_call_depth: 128,
            ref_suppressed: false,
            current_file: String::new(),
        };
        crate::builtin::init(&mut interp);
        interp
    }

    // ---- factories ----

    /// Allocate a value, wire its class prototype, register it with the
    /// heap.
    pub fn alloc(&mut self, kind: VarKind) -> VarPtr {
        let proto = match &kind {
            VarKind::Object | VarKind::Accessor => Some(self.protos.object.clone()),
            VarKind::Array => Some(self.protos.array.clone()),
            VarKind::RegExp { .. } => Some(self.protos.regexp.clone()),
            VarKind::Function(_) | VarKind::Native(_) => Some(self.protos.function.clone()),
            VarKind::Error(k) => Some(self.protos.error_proto(*k).clone()),
            _ => None,
        };
        let v = ScriptVar::new(kind);
        v.borrow_mut().prototype = proto;
        self.heap.track(&v);
        v
    }

    /// The undefined singleton.
    pub fn undefined(&self) -> VarPtr {
        self.consts.undefined.clone()
    }

    /// A boolean singleton.
    pub fn new_bool(&self, b: bool) -> VarPtr {
        if b {
            self.consts.true_v.clone()
        } else {
            self.consts.false_v.clone()
        }
    }

    /// An integer value (0 and 1 come from the singletons).
    pub fn new_int(&mut self, n: i32) -> VarPtr {
        match n {
            0 => self.consts.zero.clone(),
            1 => self.consts.one.clone(),
            _ => self.alloc(VarKind::Int(n)),
        }
    }

    /// A number value, normalised into Int-free Double/Infinity/NaN.
    pub fn new_number(&mut self, n: f64) -> VarPtr {
        match number_kind(n) {
            VarKind::NaN => self.consts.nan.clone(),
            VarKind::Infinity(s) => {
                if s >= 0 {
                    self.consts.infinity_positive.clone()
                } else {
                    self.consts.infinity_negative.clone()
                }
            }
            kind => self.alloc(kind),
        }
    }

    /// A string value.
    pub fn new_string<S: Into<String>>(&mut self, s: S) -> VarPtr {
        self.alloc(VarKind::Str(s.into()))
    }

    /// A plain object.
    pub fn new_object(&mut self) -> VarPtr {
        self.alloc(VarKind::Object)
    }

    /// An empty array.
    pub fn new_array(&mut self) -> VarPtr {
        self.alloc(VarKind::Array)
    }

    /// An error value carrying message and position properties.
    pub fn new_error(&mut self, kind: ErrorKind, message: &str, line: u32, column: u32) -> VarPtr {
        let err = self.alloc(VarKind::Error(kind));
        let msg = self.new_string(message);
        let file = self.new_string(self.current_file.clone());
        let line_v = self.new_number(line as f64);
        let col_v = self.new_number(column as f64);
        let flags = LinkFlags::WRITABLE | LinkFlags::DELETABLE;
        let mut e = err.borrow_mut();
        e.add_child("message", msg, flags);
        e.add_child("fileName", file, flags);
        e.add_child("lineNumber", line_v, flags);
        e.add_child("column", col_v, flags);
        drop(e);
        err
    }

    /// A scripted function closing over the current scope; its
    /// `prototype` and the prototype's `constructor` are mutually
    /// installed.
    pub fn new_function(&mut self, data: Rc<FncData>) -> VarPtr {
        let closure = Some(self.scope().clone());
        let fnc = self.alloc(VarKind::Function(ScriptFunction { data, closure }));
        self.install_prototype_pair(&fnc);
        fnc
    }

    /// A native function value.
    pub fn new_native<F>(&mut self, name: &str, callback: F) -> VarPtr
    where
        F: Fn(&mut Interpreter, &VarPtr, &[VarPtr]) -> ScriptResult<VarPtr> + 'static,
    {
        let fnc = self.alloc(VarKind::Native(NativeFunction {
            name: name.into(),
            callback: Rc::new(callback),
        }));
        self.install_prototype_pair(&fnc);
        fnc
    }

    fn install_prototype_pair(&mut self, fnc: &VarPtr) {
        let proto = self.new_object();
        proto
            .borrow_mut()
            .add_child(CONSTRUCTOR, fnc.clone(), LinkFlags::WRITABLE | LinkFlags::DELETABLE);
        fnc.borrow_mut().add_child(PROTOTYPE, proto, LinkFlags::WRITABLE);
    }

    /// An accessor value with optional getter/setter slots.
    pub fn new_accessor(&mut self, getter: Option<VarPtr>, setter: Option<VarPtr>) -> VarPtr {
        let acc = self.alloc(VarKind::Accessor);
        if let Some(g) = getter {
            acc.borrow_mut().add_child(ACCESSOR_GET, g, LinkFlags::empty());
        }
        if let Some(s) = setter {
            acc.borrow_mut().add_child(ACCESSOR_SET, s, LinkFlags::empty());
        }
        acc
    }

    // ---- context access ----

    /// The global scope.
    pub fn root(&self) -> VarPtr {
        self.root.clone()
    }

    fn scope(&self) -> &VarPtr {
        self.scopes.last().unwrap_or(&self.root)
    }

    fn executing(&self, exec: bool) -> bool {
        exec && self.sig.is_none()
    }

    /// Raise a script exception at the current stream position.
    fn throw_error(&mut self, kind: ErrorKind, message: String, t: &TokenStream) {
        let v = self.new_error(kind, &message, t.line(), t.column());
        self.sig = Signal::Throw(v);
    }

    /// Run the garbage collector. `extra_roots` keeps caller-held values
    /// alive in addition to the context roots.
    pub fn collect_garbage(&mut self, extra_roots: &[VarPtr]) -> GcStats {
        let mut roots: Vec<VarPtr> = vec![
            self.root.clone(),
            self.consts.undefined.clone(),
            self.consts.null.clone(),
            self.consts.nan.clone(),
            self.consts.true_v.clone(),
            self.consts.false_v.clone(),
            self.consts.infinity_positive.clone(),
            self.consts.infinity_negative.clone(),
            self.consts.zero.clone(),
            self.consts.one.clone(),
            self.protos.object.clone(),
            self.protos.array.clone(),
            self.protos.string.clone(),
            self.protos.number.clone(),
            self.protos.boolean.clone(),
            self.protos.function.clone(),
            self.protos.regexp.clone(),
        ];
        roots.extend(self.protos.error.iter().cloned());
        roots.extend(self.scopes.iter().cloned());
        match &self.sig {
            Signal::Return(v) | Signal::Throw(v) => roots.push(v.clone()),
            _ => {}
        }
        roots.extend(extra_roots.iter().cloned());
        self.heap.collect(&roots)
    }

    // ---- host API ----

    /// Execute a program, returning the last statement value.
    pub fn execute(&mut self, code: &str, file: &str, line: u32) -> ScriptResult<VarPtr> {
        let tokens = tokenize(code, file, line)?;
        self.current_file = file.into();
        debug!(file, bytes = code.len(), "executing script");
        self.run_tokens(&tokens)
    }

    /// Execute and return the last expression's value.
    pub fn evaluate_complex(&mut self, code: &str, file: &str, line: u32) -> ScriptResult<VarPtr> {
        self.execute(code, file, line)
    }

    /// Execute and return the string coercion of the result.
    pub fn evaluate(&mut self, code: &str, file: &str, line: u32) -> ScriptResult<String> {
        let value = self.execute(code, file, line)?;
        let s = self.to_string_value(&value);
        match self.take_exception() {
            Some(err) => Err(err),
            None => Ok(s),
        }
    }

    /// Run an already-preprocessed token vector in the current scope
    /// chain (also the backend of `eval`).
    pub fn run_tokens(&mut self, tokens: &[Token]) -> ScriptResult<VarPtr> {
        let mut t = TokenStream::new(tokens);
        let mut last = self.undefined();
        while !t.at_end() {
            if let Some(v) = self.execute_statement(&mut t, true) {
                last = v;
            }
            match &self.sig {
                Signal::None => {}
                Signal::Return(v) => {
                    last = v.clone();
                    self.sig = Signal::None;
                    break;
                }
                _ => break,
            }
        }
        match self.take_exception() {
            Some(err) => Err(err),
            None => {
                self.sig = Signal::None;
                Ok(last)
            }
        }
    }

    /// Run a token vector in the current scope chain, leaving any
    /// pending signal in place (the backend of `eval`).
    pub(crate) fn run_statements(&mut self, tokens: &[Token]) -> VarPtr {
        let mut t = TokenStream::new(tokens);
        let mut last = self.undefined();
        while !t.at_end() {
            if let Some(v) = self.execute_statement(&mut t, true) {
                last = v;
            }
            if !self.sig.is_none() {
                break;
            }
        }
        last
    }

    /// Convert a pending thrown exception into a host error.
    fn take_exception(&mut self) -> Option<ScriptError> {
        if let Signal::Throw(v) = mem::replace(&mut self.sig, Signal::None) {
            Some(self.error_from_value(&v))
        } else {
            None
        }
    }

    fn error_from_value(&mut self, v: &VarPtr) -> ScriptError {
        let kind = match v.borrow().kind {
            VarKind::Error(k) => k,
            _ => ErrorKind::Error,
        };
        if v.borrow().is_error() {
            let message = v
                .borrow()
                .find_own("message")
                .map(|l| l.value.borrow().to_string_prim())
                .unwrap_or_default();
            let file = v
                .borrow()
                .find_own("fileName")
                .map(|l| l.value.borrow().to_string_prim())
                .unwrap_or_default();
            let line = v.borrow().find_own("lineNumber").map_or(0.0, |l| l.value.borrow().to_number());
            let column = v.borrow().find_own("column").map_or(0.0, |l| l.value.borrow().to_number());
            ScriptError::at(kind, message, file, line as u32, column as u32)
        } else {
            let message = self.to_string_value(v);
            ScriptError::new(ErrorKind::Error, message)
        }
    }

    /// Register a native function from a signature of the form
    /// `function [Class.]name(a, b)`. A `Class.` prefix installs the
    /// function on that class's prototype.
    pub fn add_native<F>(&mut self, signature: &str, callback: F) -> ScriptResult<VarPtr>
    where
        F: Fn(&mut Interpreter, &VarPtr, &[VarPtr]) -> ScriptResult<VarPtr> + 'static,
    {
        let mut lexer = Lexer::new(signature, "native", 0)?;
        lexer.match_tok(&TokenKind::Function, None)?;
        let mut first = match &lexer.tok.kind {
            TokenKind::Ident(n) => n.to_string(),
            _ => return Err(ScriptError::syntax("expected a function name")),
        };
        lexer.advance()?;
        let mut class: Option<String> = None;
        if matches!(lexer.tok.kind, TokenKind::Dot) {
            lexer.advance()?;
            let member = match &lexer.tok.kind {
                TokenKind::Ident(n) => n.to_string(),
                _ => return Err(ScriptError::syntax("expected a member name")),
            };
            lexer.advance()?;
            class = Some(mem::replace(&mut first, member));
        }
        lexer.match_tok(&TokenKind::LeftParen, None)?;
        while matches!(lexer.tok.kind, TokenKind::Ident(_)) {
            lexer.advance()?;
            if matches!(lexer.tok.kind, TokenKind::Comma) {
                lexer.advance()?;
            }
        }
        lexer.match_tok(&TokenKind::RightParen, None)?;

        let fnc = self.new_native(&first, callback);
        let target = match class {
            Some(class_name) => {
                let class_var = self
                    .root
                    .borrow()
                    .find_own(&class_name)
                    .map(|l| l.value)
                    .ok_or_else(|| {
                        ScriptError::reference(format!("class '{}' not found", class_name))
                    })?;
                let proto = class_var.borrow().find_own(PROTOTYPE).map(|l| l.value);
                proto.ok_or_else(|| {
                    ScriptError::type_error(format!("'{}' has no prototype", class_name))
                })?
            }
            None => self.root.clone(),
        };
        target
            .borrow_mut()
            .add_child_or_replace(&first, fnc.clone(), LinkFlags::NATIVE_DEFAULT);
        debug!(name = %first, "registered native");
        Ok(fnc)
    }

    /// Install a value as a global.
    pub fn set_global(&mut self, name: &str, value: VarPtr) {
        self.root.borrow_mut().add_child_or_replace(name, value, LinkFlags::VAR_DEFAULT);
    }

    // ---- coercions needing the context ----

    /// ToPrimitive: `valueOf` then `toString` through the prototype
    /// chain (reverse order for the string hint).
    pub fn to_primitive(&mut self, v: &VarPtr, string_hint: bool) -> VarPtr {
        if v.borrow().is_primitive() {
            return v.clone();
        }
        let order: [&str; 2] =
            if string_hint { ["toString", "valueOf"] } else { ["valueOf", "toString"] };
        for method in order {
            if let Some((link, _)) = self.find_prop(v, method) {
                if link.value.borrow().is_function() {
                    let r = self.call_function(&link.value, Vec::new(), v.clone(), None);
                    if !self.sig.is_none() {
                        return self.undefined();
                    }
                    if r.borrow().is_primitive() {
                        return r;
                    }
                }
            }
        }
        let v2 = self.new_error(ErrorKind::TypeError, "cannot convert object to primitive", 0, 0);
        self.sig = Signal::Throw(v2);
        self.undefined()
    }

    /// ToString through `to_primitive`.
    pub fn to_string_value(&mut self, v: &VarPtr) -> String {
        let p = self.to_primitive(v, true);
        let result = p.borrow().to_string_prim();
        result
    }

    /// ToNumber through `to_primitive`.
    pub fn to_number_value(&mut self, v: &VarPtr) -> f64 {
        let p = self.to_primitive(v, false);
        let result = p.borrow().to_number();
        result
    }

    /// Property lookup that falls back to the kind's class prototype
    /// for primitives (method dispatch on bare literals).
    pub fn find_prop(&self, v: &VarPtr, name: &str) -> Option<(crate::object::VarLink, bool)> {
        if let Some(link) = v.borrow().find_own(name) {
            return Some((link, true));
        }
        let mut current = match v.borrow().prototype.clone() {
            Some(p) => Some(p),
            None => self.default_proto(v),
        };
        while let Some(proto) = current {
            if let Some(link) = proto.borrow().find_own(name) {
                return Some((link, false));
            }
            current = proto.borrow().prototype.clone();
        }
        None
    }

    fn default_proto(&self, v: &VarPtr) -> Option<VarPtr> {
        match v.borrow().kind {
            VarKind::Bool(_) => Some(self.protos.boolean.clone()),
            VarKind::Int(_) | VarKind::Double(_) | VarKind::Infinity(_) | VarKind::NaN => {
                Some(self.protos.number.clone())
            }
            VarKind::Str(_) => Some(self.protos.string.clone()),
            _ => None,
        }
    }

    // ---- function invocation ----

    /// Call a function value. `pos` is the (line, column) of the call
    /// site, for diagnostics.
    pub fn call_function(
        &mut self,
        func: &VarPtr,
        args: Vec<VarPtr>,
        this: VarPtr,
        pos: Option<(u32, u32)>,
    ) -> VarPtr {
        if self.call_depth >= self.max_call_depth {
            let (line, column) = pos.unwrap_or((0, 0));
            let v = self.new_error(
                ErrorKind::RangeError,
                "maximum call stack size exceeded",
                line,
                column,
            );
            self.sig = Signal::Throw(v);
            return self.undefined();
        }

        let kind = func.borrow().kind.clone();
        match kind {
            VarKind::Native(native) => {
                self.call_depth += 1;
                let result = (native.callback)(self, &this, &args);
                self.call_depth -= 1;
                match result {
                    Ok(v) => v,
                    Err(err) => {
                        let (line, column) = pos.unwrap_or((err.line, err.column));
                        let v = self.new_error(err.kind, &err.message, line, column);
                        self.sig = Signal::Throw(v);
                        self.undefined()
                    }
                }
            }
            VarKind::Function(sf) => {
                self.call_depth += 1;
                let result = self.call_scripted(&sf, args, this);
                self.call_depth -= 1;
                result
            }
            _ => {
                let (line, column) = pos.unwrap_or((0, 0));
                let v = self.new_error(
                    ErrorKind::TypeError,
                    &format!("'{}' is not a function", func.borrow().to_string_prim()),
                    line,
                    column,
                );
                self.sig = Signal::Throw(v);
                self.undefined()
            }
        }
    }

    fn call_scripted(&mut self, sf: &ScriptFunction, args: Vec<VarPtr>, this: VarPtr) -> VarPtr {
        let closure = sf.closure.clone().or_else(|| Some(self.root.clone()));
        let scope = self.alloc(VarKind::Scope(ScopeKind::Fnc { closure }));

        // Bind parameters and `arguments`.
        for (i, arg_tok) in sf.data.args.iter().enumerate() {
            let value = args.get(i).cloned().unwrap_or_else(|| self.undefined());
            match &arg_tok.kind {
                TokenKind::Ident(name) => {
                    scope
                        .borrow_mut()
                        .add_child_or_replace(name.as_str(), value, LinkFlags::VAR_DEFAULT);
                }
                TokenKind::DestructuringVar(data) => {
                    let data = data.clone();
                    self.bind_destructuring(&scope, &data, &value);
                }
                _ => {}
            }
        }
        let args_array = self.new_array();
        for (i, arg) in args.iter().enumerate() {
            args_array
                .borrow_mut()
                .add_child(i.to_string(), arg.clone(), LinkFlags::DEFAULT);
        }
        scope.borrow_mut().add_child(ARGUMENTS, args_array, LinkFlags::VAR_DEFAULT);
        scope.borrow_mut().add_child(THIS, this, LinkFlags::NATIVE_DEFAULT);

        let depth = self.scopes.len();
        self.scopes.push(scope);
        let saved_file = mem::replace(&mut self.current_file, sf.data.file.clone());

        let data = sf.data.clone();
        let mut t = TokenStream::new(&data.body);
        while !t.at_end() {
            self.execute_statement(&mut t, true);
            if !self.sig.is_none() {
                break;
            }
        }

        self.current_file = saved_file;
        self.scopes.truncate(depth);

        match mem::replace(&mut self.sig, Signal::None) {
            Signal::Return(v) => v,
            Signal::Throw(v) => {
                self.sig = Signal::Throw(v);
                self.undefined()
            }
            _ => self.undefined(),
        }
    }

    /// `new F(args)`.
    fn construct(&mut self, func: &VarPtr, args: Vec<VarPtr>, pos: Option<(u32, u32)>) -> VarPtr {
        if !func.borrow().is_function() {
            let (line, column) = pos.unwrap_or((0, 0));
            let v = self.new_error(ErrorKind::TypeError, "not a constructor", line, column);
            self.sig = Signal::Throw(v);
            return self.undefined();
        }
        let obj = self.new_object();
        if let Some(link) = func.borrow().find_own(PROTOTYPE) {
            if !link.value.borrow().is_primitive() {
                obj.borrow_mut().prototype = Some(link.value.clone());
            }
        }
        let result = self.call_function(func, args, obj.clone(), pos);
        if !self.sig.is_none() {
            return self.undefined();
        }
        if result.borrow().is_primitive() {
            obj
        } else {
            result
        }
    }

    /// Assign the flattened pattern bindings out of `value` into a
    /// scope.
    fn bind_destructuring(&mut self, scope: &VarPtr, data: &DestructuringData, value: &VarPtr) {
        for target in &data.targets {
            if target.name.is_empty() {
                continue;
            }
            let mut current = value.clone();
            for key in &target.path {
                let next = match self.find_prop(&current, key) {
                    Some((link, _)) => {
                        if link.value.borrow().is_accessor() {
                            self.call_accessor_get(&link.value, &current)
                        } else {
                            link.value
                        }
                    }
                    None => self.undefined(),
                };
                current = next;
            }
            scope
                .borrow_mut()
                .add_child_or_replace(&target.name, current, LinkFlags::VAR_DEFAULT);
        }
    }

    fn call_accessor_get(&mut self, accessor: &VarPtr, this: &VarPtr) -> VarPtr {
        let getter = accessor.borrow().find_own(ACCESSOR_GET).map(|l| l.value);
        match getter {
            Some(g) if g.borrow().is_function() => {
                self.call_function(&g, Vec::new(), this.clone(), None)
            }
            _ => self.undefined(),
        }
    }

    fn call_accessor_set(&mut self, accessor: &VarPtr, this: &VarPtr, value: VarPtr) {
        let setter = accessor.borrow().find_own(ACCESSOR_SET).map(|l| l.value);
        if let Some(s) = setter {
            if s.borrow().is_function() {
                self.call_function(&s, vec![value], this.clone(), None);
            }
        }
    }

    // ---- forwarder application ----

    fn apply_forwarder(&mut self, data: &ForwardData) {
        let var_scope = scope_var_target(self.scope());
        for name in &data.vars {
            if var_scope.borrow().find_own(name).is_none() {
                let undef = self.undefined();
                var_scope.borrow_mut().add_child(name, undef, LinkFlags::VAR_DEFAULT);
            }
        }
        let let_scope = scope_let_target(self.scope());
        for name in &data.lets {
            if let_scope.borrow().find_own(name).is_none() {
                let undef = self.undefined();
                let_scope.borrow_mut().add_child(name, undef, LinkFlags::VAR_DEFAULT);
            }
        }
        for fnc_data in &data.functions {
            let fnc = self.new_function(fnc_data.clone());
            var_scope
                .borrow_mut()
                .add_child_or_replace(&fnc_data.name, fnc, LinkFlags::VAR_DEFAULT);
        }
    }

    // ---- statements ----

    /// Execute one statement; expression statements report their value.
    fn execute_statement(&mut self, t: &mut TokenStream, exec: bool) -> Option<VarPtr> {
        // Leading loop labels and statement labels.
        let mut loop_labels: Vec<String> = Vec::new();
        let mut stmt_labels: Vec<String> = Vec::new();
        loop {
            match t.kind() {
                TokenKind::LoopLabel(l) => {
                    loop_labels.push(l.to_string());
                    t.advance();
                }
                TokenKind::Label(l) => {
                    stmt_labels.push(l.to_string());
                    t.advance();
                }
                _ => break,
            }
        }
        if !stmt_labels.is_empty() {
            let result = self.execute_statement(t, exec);
            if let Signal::Break(Some(label)) = &self.sig {
                if stmt_labels.iter().any(|l| l == label) {
                    self.sig = Signal::None;
                }
            }
            return result;
        }

        match t.kind() {
            TokenKind::Semicolon => {
                t.advance();
                None
            }
            TokenKind::Forward(data) => {
                t.advance();
                if self.executing(exec) {
                    let data = data.borrow();
                    self.apply_forwarder(&data);
                }
                None
            }
            TokenKind::FunctionDecl(_) => {
                // already instantiated via the forwarder
                t.advance();
                None
            }
            TokenKind::LeftBrace => {
                self.execute_block(t, exec);
                None
            }
            TokenKind::Var | TokenKind::Let => {
                self.execute_declaration(t, exec);
                None
            }
            TokenKind::If => {
                self.execute_if(t, exec);
                None
            }
            TokenKind::While => {
                self.execute_while(t, exec, &loop_labels);
                None
            }
            TokenKind::Do => {
                self.execute_do_while(t, exec, &loop_labels);
                None
            }
            TokenKind::For => {
                self.execute_for(t, exec, &loop_labels);
                None
            }
            TokenKind::ForIn | TokenKind::ForEachIn => {
                self.execute_for_in(t, exec, &loop_labels);
                None
            }
            TokenKind::Return => {
                t.expect(&TokenKind::Return);
                let value = if t.is(&TokenKind::Semicolon) {
                    self.undefined()
                } else {
                    let slot = self.eval_expression(t, exec);
                    if self.executing(exec) {
                        self.use_value(&slot, t)
                    } else {
                        self.undefined()
                    }
                };
                if self.executing(exec) {
                    self.sig = Signal::Return(value);
                }
                t.expect(&TokenKind::Semicolon);
                None
            }
            TokenKind::Break | TokenKind::Continue => {
                let is_break = t.is(&TokenKind::Break);
                t.advance();
                let label = match t.kind() {
                    TokenKind::Ident(name) => {
                        t.advance();
                        Some(name.to_string())
                    }
                    _ => None,
                };
                if self.executing(exec) {
                    self.sig =
                        if is_break { Signal::Break(label) } else { Signal::Continue(label) };
                }
                t.expect(&TokenKind::Semicolon);
                None
            }
            TokenKind::Throw => {
                t.expect(&TokenKind::Throw);
                let slot = self.eval_expression(t, exec);
                if self.executing(exec) {
                    let value = self.use_value(&slot, t);
                    if self.sig.is_none() {
                        self.sig = Signal::Throw(value);
                    }
                }
                t.expect(&TokenKind::Semicolon);
                None
            }
            TokenKind::Try => {
                self.execute_try(t, exec);
                None
            }
            TokenKind::Switch => {
                self.execute_switch(t, exec, &stmt_labels);
                None
            }
            TokenKind::With => {
                self.execute_with(t, exec);
                None
            }
            _ => {
                let slot = self.eval_expression(t, exec);
                let value = if self.executing(exec) {
                    Some(self.use_value(&slot, t))
                } else {
                    None
                };
                t.expect(&TokenKind::Semicolon);
                value.filter(|_| self.sig.is_none())
            }
        }
    }

    fn execute_block(&mut self, t: &mut TokenStream, exec: bool) {
        t.expect(&TokenKind::LeftBrace);
        let depth = self.scopes.len();
        // A leading forwarder with lets means this block is a let scope.
        if let TokenKind::Forward(data) = t.kind() {
            if self.executing(exec) && !data.borrow().lets.is_empty() {
                let parent = self.scope().clone();
                let scope = self.alloc(VarKind::Scope(ScopeKind::Let { parent }));
                self.scopes.push(scope);
            }
        }
        while !t.is(&TokenKind::RightBrace) && !t.at_end() {
            self.execute_statement(t, exec);
        }
        self.scopes.truncate(depth);
        t.expect(&TokenKind::RightBrace);
    }

    fn execute_declaration(&mut self, t: &mut TokenStream, exec: bool) {
        t.advance(); // var / let
        loop {
            match t.kind() {
                TokenKind::Ident(name) => {
                    t.advance();
                    if t.is(&TokenKind::Assign) {
                        t.advance();
                        let slot = self.eval_assignment(t, exec);
                        if self.executing(exec) {
                            let value = self.use_value(&slot, t);
                            if self.sig.is_none() {
                                self.assign_to_name(&name, value);
                            }
                        }
                    }
                }
                TokenKind::DestructuringVar(data) => {
                    t.advance();
                    t.expect(&TokenKind::Assign);
                    let slot = self.eval_assignment(t, exec);
                    if self.executing(exec) {
                        let value = self.use_value(&slot, t);
                        if self.sig.is_none() {
                            let scope = self.scope().clone();
                            self.bind_destructuring_names(&scope, &data, &value);
                        }
                    }
                }
                _ => break,
            }
            if t.is(&TokenKind::Comma) {
                t.advance();
                continue;
            }
            break;
        }
        t.expect(&TokenKind::Semicolon);
    }

    /// Destructuring in a declaration: names were hoisted, so resolve
    /// them through the scope chain before assigning.
    fn bind_destructuring_names(
        &mut self,
        scope: &VarPtr,
        data: &DestructuringData,
        value: &VarPtr,
    ) {
        for target in &data.targets {
            if target.name.is_empty() {
                continue;
            }
            let mut current = value.clone();
            for key in &target.path {
                let next = match self.find_prop(&current, key) {
                    Some((link, _)) => {
                        if link.value.borrow().is_accessor() {
                            self.call_accessor_get(&link.value, &current)
                        } else {
                            link.value
                        }
                    }
                    None => self.undefined(),
                };
                current = next;
            }
            match find_in_scopes(scope, &target.name) {
                Some(slot) => {
                    if let Some(owner) = slot.owner {
                        self.set_property(&owner, &target.name, current, None);
                    }
                }
                None => {
                    scope
                        .borrow_mut()
                        .add_child_or_replace(&target.name, current, LinkFlags::VAR_DEFAULT);
                }
            }
        }
    }

    /// Assign to a name through the scope chain; unresolved names are
    /// created on the root (sloppy-mode global).
    fn assign_to_name(&mut self, name: &str, value: VarPtr) {
        match find_in_scopes(self.scope(), name) {
            Some(slot) => {
                let owner = slot.owner.expect("scope slots always have owners");
                self.set_property(&owner, name, value, None);
            }
            None => {
                self.root.borrow_mut().add_child_or_replace(name, value, LinkFlags::DEFAULT);
            }
        }
    }

    fn execute_if(&mut self, t: &mut TokenStream, exec: bool) {
        t.expect(&TokenKind::If);
        t.expect(&TokenKind::LeftParen);
        let cond = self.eval_expression(t, exec);
        let truthy = if self.executing(exec) {
            let v = self.use_value(&cond, t);
            self.sig.is_none() && v.borrow().to_boolean()
        } else {
            false
        };
        t.expect(&TokenKind::RightParen);
        self.execute_statement(t, exec && truthy);
        if t.is(&TokenKind::Else) {
            t.advance();
            self.execute_statement(t, exec && !truthy);
        }
    }

    /// Consume a pending break/continue if it targets this loop.
    /// Returns (stop_loop, consumed_continue).
    fn loop_signal(&mut self, labels: &[String]) -> (bool, bool) {
        match &self.sig {
            Signal::Break(label) => {
                let matches = match label {
                    None => true,
                    Some(l) => labels.iter().any(|x| x == l),
                };
                if matches {
                    self.sig = Signal::None;
                }
                (true, false)
            }
            Signal::Continue(label) => {
                let matches = match label {
                    None => true,
                    Some(l) => labels.iter().any(|x| x == l),
                };
                if matches {
                    self.sig = Signal::None;
                    (false, true)
                } else {
                    (true, false)
                }
            }
            Signal::Return(_) | Signal::Throw(_) => (true, false),
            Signal::None => (false, false),
        }
    }

    fn execute_while(&mut self, t: &mut TokenStream, exec: bool, labels: &[String]) {
        t.expect(&TokenKind::While);
        t.expect(&TokenKind::LeftParen);
        let cond_pos = t.save();
        loop {
            t.set_pos(cond_pos);
            let cond = self.eval_expression(t, exec);
            let truthy = if self.executing(exec) {
                let v = self.use_value(&cond, t);
                self.sig.is_none() && v.borrow().to_boolean()
            } else {
                false
            };
            t.expect(&TokenKind::RightParen);
            let run = self.executing(exec) && truthy;
            self.execute_statement(t, run);
            if !run {
                break;
            }
            let (stop, _) = self.loop_signal(labels);
            if stop {
                break;
            }
        }
    }

    fn execute_do_while(&mut self, t: &mut TokenStream, exec: bool, labels: &[String]) {
        t.expect(&TokenKind::Do);
        let body_pos = t.save();
        let mut run = self.executing(exec);
        loop {
            t.set_pos(body_pos);
            self.execute_statement(t, run);
            let mut stop = false;
            if run {
                let (s, _) = self.loop_signal(labels);
                stop = s;
            }
            t.expect(&TokenKind::While);
            t.expect(&TokenKind::LeftParen);
            let cond_exec = run && !stop;
            let cond = self.eval_expression(t, cond_exec);
            let truthy = if self.executing(cond_exec) {
                let v = self.use_value(&cond, t);
                self.sig.is_none() && v.borrow().to_boolean()
            } else {
                false
            };
            t.expect(&TokenKind::RightParen);
            t.expect(&TokenKind::Semicolon);
            if !cond_exec || !truthy {
                break;
            }
            run = self.executing(exec);
            if !run {
                break;
            }
        }
    }

    fn execute_for(&mut self, t: &mut TokenStream, exec: bool, labels: &[String]) {
        t.expect(&TokenKind::For);
        t.expect(&TokenKind::LeftParen);

        // init: either a declaration statement (which eats its `;`) or
        // an expression.
        if t.is(&TokenKind::Var) || t.is(&TokenKind::Let) {
            self.execute_declaration(t, exec);
        } else {
            if !t.is(&TokenKind::Semicolon) {
                self.eval_expression(t, exec);
            }
            t.expect(&TokenKind::Semicolon);
        }

        let cond_pos = t.save();
        let first_cond = if t.is(&TokenKind::Semicolon) {
            true
        } else {
            let c = self.eval_expression(t, exec);
            if self.executing(exec) {
                let v = self.use_value(&c, t);
                self.sig.is_none() && v.borrow().to_boolean()
            } else {
                false
            }
        };
        t.expect(&TokenKind::Semicolon);

        let update_pos = t.save();
        if !t.is(&TokenKind::RightParen) {
            self.eval_expression(t, false); // position-only walk
        }
        t.expect(&TokenKind::RightParen);
        let body_pos = t.save();

        let run = self.executing(exec) && first_cond;
        self.execute_statement(t, run);
        let end_pos = t.save();

        if run {
            loop {
                let (stop, _) = self.loop_signal(labels);
                if stop {
                    break;
                }
                // update
                t.set_pos(update_pos);
                if !t.is(&TokenKind::RightParen) {
                    self.eval_expression(t, true);
                }
                if !self.sig.is_none() {
                    break;
                }
                // condition
                t.set_pos(cond_pos);
                let cond = if t.is(&TokenKind::Semicolon) {
                    true
                } else {
                    let c = self.eval_expression(t, true);
                    if self.sig.is_none() {
                        let v = self.use_value(&c, t);
                        self.sig.is_none() && v.borrow().to_boolean()
                    } else {
                        false
                    }
                };
                if !cond || !self.sig.is_none() {
                    break;
                }
                // body
                t.set_pos(body_pos);
                self.execute_statement(t, true);
            }
        }
        t.set_pos(end_pos);
    }

    fn execute_for_in(&mut self, t: &mut TokenStream, exec: bool, labels: &[String]) {
        let each = t.is(&TokenKind::ForEachIn);
        t.advance(); // ForIn / ForEachIn
        t.expect(&TokenKind::LeftParen);
        if t.is(&TokenKind::Var) || t.is(&TokenKind::Let) {
            t.advance();
        }
        let lhs = t.kind();
        t.advance();
        t.expect(&TokenKind::In);
        let subject_slot = self.eval_expression(t, exec);
        let subject = if self.executing(exec) {
            self.use_value(&subject_slot, t)
        } else {
            self.undefined()
        };
        t.expect(&TokenKind::RightParen);

        let keys: Vec<String> = if self.executing(exec) && !subject.borrow().is_nullish() {
            enumerable_keys(&subject)
        } else {
            Vec::new()
        };

        let body_pos = t.save();
        let mut end_pos = None;
        for key in keys {
            // The key may have been deleted while iterating.
            if self.find_prop(&subject, &key).is_none() {
                continue;
            }
            let bound = if each {
                match self.find_prop(&subject, &key) {
                    Some((link, _)) => {
                        if link.value.borrow().is_accessor() {
                            self.call_accessor_get(&link.value, &subject)
                        } else {
                            link.value
                        }
                    }
                    None => self.undefined(),
                }
            } else {
                self.new_string(key.clone())
            };
            match &lhs {
                TokenKind::Ident(name) => self.assign_to_name(name, bound),
                TokenKind::DestructuringVar(data) => {
                    let scope = self.scope().clone();
                    self.bind_destructuring_names(&scope, data, &bound);
                }
                _ => {}
            }
            t.set_pos(body_pos);
            self.execute_statement(t, true);
            end_pos = Some(t.save());
            let (stop, _) = self.loop_signal(labels);
            if stop {
                break;
            }
        }
        match end_pos {
            Some(end) => t.set_pos(end),
            None => {
                // body never ran; walk it once to pass it
                t.set_pos(body_pos);
                self.execute_statement(t, false);
            }
        }
    }

    fn execute_try(&mut self, t: &mut TokenStream, exec: bool) {
        t.expect(&TokenKind::Try);
        // Whether this try actually runs; a pre-set signal means the
        // whole statement is being skipped.
        let active = self.executing(exec);
        self.execute_block(t, exec);

        // A throw raised by this try block is the only signal a catch
        // eats.
        let mut pending_throw: Option<VarPtr> = None;
        if active {
            if let Signal::Throw(v) = &self.sig {
                pending_throw = Some(v.clone());
            }
        }

        if t.is(&TokenKind::Catch) {
            t.advance();
            t.expect(&TokenKind::LeftParen);
            let param = match t.kind() {
                TokenKind::Ident(name) => name.to_string(),
                _ => String::new(),
            };
            t.advance();
            t.expect(&TokenKind::RightParen);
            if let Some(exception) = pending_throw.take() {
                self.sig = Signal::None;
                let parent = self.scope().clone();
                let scope = self.alloc(VarKind::Scope(ScopeKind::Let { parent }));
                scope.borrow_mut().add_child(&param, exception, LinkFlags::DEFAULT);
                let depth = self.scopes.len();
                self.scopes.push(scope);
                self.execute_block(t, true);
                self.scopes.truncate(depth);
            } else {
                self.execute_block(t, false);
            }
        }

        if t.is(&TokenKind::Finally) {
            t.advance();
            // The finally block runs exactly once whenever the try ran,
            // with any pending signal stashed; its own signal wins.
            let saved = mem::replace(&mut self.sig, Signal::None);
            self.execute_block(t, active);
            if self.sig.is_none() {
                self.sig = saved;
            }
        }
    }

    fn execute_switch(&mut self, t: &mut TokenStream, exec: bool, labels: &[String]) {
        t.expect(&TokenKind::Switch);
        t.expect(&TokenKind::LeftParen);
        let subject_slot = self.eval_expression(t, exec);
        let subject = if self.executing(exec) {
            self.use_value(&subject_slot, t)
        } else {
            self.undefined()
        };
        t.expect(&TokenKind::RightParen);
        t.expect(&TokenKind::LeftBrace);

        let mut matched = false;
        let mut done = false;
        let mut default_pos: Option<usize> = None;

        while !t.is(&TokenKind::RightBrace) && !t.at_end() {
            if t.is(&TokenKind::Case) {
                t.advance();
                let try_match = self.executing(exec) && !matched && !done;
                let case_slot = self.eval_expression(t, try_match);
                if try_match && self.sig.is_none() {
                    let case_value = self.use_value(&case_slot, t);
                    if self.sig.is_none() && strict_equals(&subject, &case_value) {
                        matched = true;
                    }
                }
                t.expect(&TokenKind::Colon);
            } else if t.is(&TokenKind::Default) {
                t.advance();
                t.expect(&TokenKind::Colon);
                default_pos = Some(t.save());
            } else {
                let run = self.executing(exec) && matched && !done;
                self.execute_statement(t, run);
                if run {
                    if let Signal::Break(label) = &self.sig {
                        let consumed = match label {
                            None => true,
                            Some(l) => labels.iter().any(|x| x == l),
                        };
                        if consumed {
                            self.sig = Signal::None;
                            done = true;
                        } else {
                            done = true;
                        }
                    } else if !self.sig.is_none() {
                        done = true;
                    }
                }
            }
        }
        let end_pos = t.save();

        // No case matched: run from default (fall-through included).
        if self.executing(exec) && !matched && !done {
            if let Some(start) = default_pos {
                t.set_pos(start);
                let mut finished = false;
                while !t.is(&TokenKind::RightBrace) && !t.at_end() && !finished {
                    if t.is(&TokenKind::Case) {
                        t.advance();
                        self.eval_expression(t, false);
                        t.expect(&TokenKind::Colon);
                        continue;
                    }
                    self.execute_statement(t, true);
                    if let Signal::Break(label) = &self.sig {
                        let consumed = match label {
                            None => true,
                            Some(l) => labels.iter().any(|x| x == l),
                        };
                        if consumed {
                            self.sig = Signal::None;
                        }
                        finished = true;
                    } else if !self.sig.is_none() {
                        finished = true;
                    }
                }
            }
        }
        t.set_pos(end_pos);
        t.expect(&TokenKind::RightBrace);
    }

    fn execute_with(&mut self, t: &mut TokenStream, exec: bool) {
        t.expect(&TokenKind::With);
        t.expect(&TokenKind::LeftParen);
        let target_slot = self.eval_expression(t, exec);
        let target = if self.executing(exec) {
            self.use_value(&target_slot, t)
        } else {
            self.undefined()
        };
        t.expect(&TokenKind::RightParen);
        if self.executing(exec) {
            let parent = self.scope().clone();
            let scope = self.alloc(VarKind::Scope(ScopeKind::With { parent, target }));
            let depth = self.scopes.len();
            self.scopes.push(scope);
            self.execute_statement(t, true);
            self.scopes.truncate(depth);
        } else {
            self.execute_statement(t, false);
        }
    }

    // ---- expressions ----

    /// Read a slot's value for computation. Reading an identifier that
    /// resolved nowhere is the ReferenceError point; assignment targets,
    /// `typeof` and `delete` never come through here.
    fn use_value(&mut self, slot: &Slot, t: &TokenStream) -> VarPtr {
        if slot.owner.is_none()
            && !slot.resolved
            && !slot.name.is_empty()
            && self.sig.is_none()
            && !self.ref_suppressed
        {
            self.throw_error(
                ErrorKind::ReferenceError,
                format!("{} is not defined", slot.name),
                t,
            );
            return self.undefined();
        }
        slot.value.clone()
    }

    /// Comma expression.
    fn eval_expression(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        let mut slot = self.eval_assignment(t, exec);
        while t.is(&TokenKind::Comma) {
            if self.executing(exec) {
                self.use_value(&slot, t);
            }
            t.advance();
            slot = self.eval_assignment(t, exec);
        }
        slot
    }

    /// Assignment (right-associative); compound forms dispatch through
    /// `maths_op`.
    fn eval_assignment(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        let lhs = self.eval_conditional(t, exec);
        let op = t.kind();
        if !op.is_assignment() {
            return lhs;
        }
        t.advance();
        let rhs = self.eval_assignment(t, exec);
        if !self.executing(exec) {
            return Slot::temp(self.undefined());
        }
        let value = match op.assignment_base() {
            None => self.use_value(&rhs, t),
            Some(base) => {
                let lv = self.use_value(&lhs, t);
                let rv = self.use_value(&rhs, t);
                self.maths_op(&lv, &rv, &base, t)
            }
        };
        if !self.sig.is_none() {
            return Slot::temp(self.undefined());
        }
        self.assign_slot(&lhs, value.clone(), t);
        Slot::temp(value)
    }

    /// `?:`.
    fn eval_conditional(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        let cond = self.eval_logical_or(t, exec);
        if !t.is(&TokenKind::Question) {
            return cond;
        }
        t.advance();
        let truthy = if self.executing(exec) {
            self.use_value(&cond, t).borrow().to_boolean() && self.sig.is_none()
        } else {
            false
        };
        let yes = self.eval_assignment(t, exec && truthy);
        t.expect(&TokenKind::Colon);
        let no = self.eval_assignment(t, exec && !truthy);
        if !self.executing(exec) {
            return Slot::temp(self.undefined());
        }
        if truthy {
            yes
        } else {
            no
        }
    }

    fn eval_logical_or(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        let mut lhs = self.eval_logical_and(t, exec);
        while t.is(&TokenKind::OrOr) {
            t.advance();
            let take_rhs = if self.executing(exec) {
                let lv = self.use_value(&lhs, t);
                self.sig.is_none() && !lv.borrow().to_boolean()
            } else {
                false
            };
            let rhs = self.eval_logical_and(t, exec && take_rhs);
            if self.executing(exec) && take_rhs {
                let rv = self.use_value(&rhs, t);
                lhs = Slot::temp(rv);
            }
        }
        lhs
    }

    fn eval_logical_and(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        let mut lhs = self.eval_bit_or(t, exec);
        while t.is(&TokenKind::AndAnd) {
            t.advance();
            let take_rhs = if self.executing(exec) {
                let lv = self.use_value(&lhs, t);
                self.sig.is_none() && lv.borrow().to_boolean()
            } else {
                false
            };
            let rhs = self.eval_bit_or(t, exec && take_rhs);
            if self.executing(exec) && take_rhs {
                let rv = self.use_value(&rhs, t);
                lhs = Slot::temp(rv);
            }
        }
        lhs
    }

    fn eval_binary_level(
        &mut self,
        t: &mut TokenStream,
        exec: bool,
        ops: &[TokenKind],
        next: fn(&mut Interpreter, &mut TokenStream, bool) -> Slot,
    ) -> Slot {
        let mut lhs = next(self, t, exec);
        loop {
            let op = t.kind();
            if !ops.iter().any(|o| op.same_kind(o)) {
                return lhs;
            }
            t.advance();
            let rhs = next(self, t, exec);
            if self.executing(exec) {
                let lv = self.use_value(&lhs, t);
                let rv = self.use_value(&rhs, t);
                let value = self.maths_op(&lv, &rv, &op, t);
                lhs = Slot::temp(value);
            }
        }
    }

    fn eval_bit_or(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        self.eval_binary_level(t, exec, &[TokenKind::Pipe], Interpreter::eval_bit_xor)
    }

    fn eval_bit_xor(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        self.eval_binary_level(t, exec, &[TokenKind::Caret], Interpreter::eval_bit_and)
    }

    fn eval_bit_and(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        self.eval_binary_level(t, exec, &[TokenKind::Ampersand], Interpreter::eval_equality)
    }

    fn eval_equality(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        self.eval_binary_level(
            t,
            exec,
            &[
                TokenKind::Equal,
                TokenKind::NotEqual,
                TokenKind::StrictEqual,
                TokenKind::StrictNotEqual,
            ],
            Interpreter::eval_relational,
        )
    }

    fn eval_relational(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        self.eval_binary_level(
            t,
            exec,
            &[
                TokenKind::LessThan,
                TokenKind::LessEqual,
                TokenKind::GreaterThan,
                TokenKind::GreaterEqual,
                TokenKind::In,
                TokenKind::Instanceof,
            ],
            Interpreter::eval_shift,
        )
    }

    fn eval_shift(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        self.eval_binary_level(
            t,
            exec,
            &[TokenKind::LeftShift, TokenKind::RightShift, TokenKind::UnsignedRightShift],
            Interpreter::eval_additive,
        )
    }

    fn eval_additive(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        self.eval_binary_level(
            t,
            exec,
            &[TokenKind::Plus, TokenKind::Minus],
            Interpreter::eval_multiplicative,
        )
    }

    fn eval_multiplicative(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        self.eval_binary_level(
            t,
            exec,
            &[TokenKind::Star, TokenKind::Slash, TokenKind::Percent],
            Interpreter::eval_unary,
        )
    }

    fn eval_unary(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        match t.kind() {
            TokenKind::Bang => {
                t.advance();
                let operand = self.eval_unary(t, exec);
                if !self.executing(exec) {
                    return Slot::temp(self.undefined());
                }
                let value = self.use_value(&operand, t);
                let b = !value.borrow().to_boolean();
                Slot::temp(self.new_bool(b))
            }
            TokenKind::Tilde => {
                t.advance();
                let operand = self.eval_unary(t, exec);
                if !self.executing(exec) {
                    return Slot::temp(self.undefined());
                }
                let value = self.use_value(&operand, t);
                let n = {
                    let p = self.to_primitive(&value, false);
                    let result = p.borrow().to_int32();
                    result
                };
                Slot::temp(self.new_int(!n))
            }
            TokenKind::Plus => {
                t.advance();
                let operand = self.eval_unary(t, exec);
                if !self.executing(exec) {
                    return Slot::temp(self.undefined());
                }
                let value = self.use_value(&operand, t);
                let n = self.to_number_value(&value);
                Slot::temp(self.new_number(n))
            }
            TokenKind::Minus => {
                t.advance();
                let operand = self.eval_unary(t, exec);
                if !self.executing(exec) {
                    return Slot::temp(self.undefined());
                }
                let value = self.use_value(&operand, t);
                let int_operand = match value.borrow().kind {
                    VarKind::Int(n) if n != i32::MIN => Some(n),
                    _ => None,
                };
                match int_operand {
                    Some(n) => Slot::temp(self.new_int(-n)),
                    None => {
                        let n = self.to_number_value(&value);
                        Slot::temp(self.new_number(-n))
                    }
                }
            }
            TokenKind::Typeof => {
                t.advance();
                let saved = self.ref_suppressed;
                self.ref_suppressed = true;
                let operand = self.eval_unary(t, exec);
                self.ref_suppressed = saved;
                if !self.executing(exec) {
                    return Slot::temp(self.undefined());
                }
                let name = if operand.owner.is_none() && !operand.resolved {
                    "undefined"
                } else {
                    operand.value.borrow().type_of()
                };
                Slot::temp(self.new_string(name))
            }
            TokenKind::Void => {
                t.advance();
                self.eval_unary(t, exec);
                Slot::temp(self.undefined())
            }
            TokenKind::Delete => {
                t.advance();
                let operand = self.eval_unary(t, exec);
                if !self.executing(exec) {
                    return Slot::temp(self.undefined());
                }
                let removed = match &operand.owner {
                    Some(owner) if operand.resolved => {
                        owner.borrow_mut().remove_child(&operand.name)
                    }
                    _ => true,
                };
                Slot::temp(self.new_bool(removed))
            }
            TokenKind::PlusPlus | TokenKind::MinusMinus => {
                let inc = t.is(&TokenKind::PlusPlus);
                t.advance();
                let operand = self.eval_unary(t, exec);
                if !self.executing(exec) {
                    return Slot::temp(self.undefined());
                }
                let value = self.use_value(&operand, t);
                let n = self.to_number_value(&value);
                let new_value = self.new_number(if inc { n + 1.0 } else { n - 1.0 });
                self.assign_slot(&operand, new_value.clone(), t);
                Slot::temp(new_value)
            }
            TokenKind::New => {
                t.advance();
                let pos = (t.line(), t.column());
                let callee = self.eval_member_chain(t, exec);
                let mut args = Vec::new();
                if t.is(&TokenKind::LeftParen) {
                    args = self.eval_arguments(t, exec);
                }
                if !self.executing(exec) {
                    // keep walking the trailing suffixes to stay aligned
                    let skipped = Slot::temp(self.undefined());
                    return self.eval_suffixes(t, exec, skipped);
                }
                let callee_value = self.use_value(&callee, t);
                if !self.sig.is_none() {
                    let skipped = Slot::temp(self.undefined());
                    return self.eval_suffixes(t, exec, skipped);
                }
                let obj = self.construct(&callee_value, args, Some(pos));
                let slot = Slot::temp(obj);
                self.eval_suffixes(t, exec, slot)
            }
            _ => self.eval_factor(t, exec),
        }
    }

    /// Primary expression plus member/call/postfix suffixes.
    fn eval_factor(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        let base = self.eval_primary(t, exec);
        self.eval_suffixes(t, exec, base)
    }

    /// Member chain that stops before a call: the callee of `new`.
    fn eval_member_chain(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        let mut slot = self.eval_primary(t, exec);
        loop {
            if t.is(&TokenKind::Dot) {
                t.advance();
                let name = match t.kind() {
                    TokenKind::Ident(n) => n.to_string(),
                    _ => String::new(),
                };
                t.advance();
                slot = self.member_access(slot, &name, t, exec);
            } else if t.is(&TokenKind::LeftBracket) {
                t.advance();
                let index = self.eval_expression(t, exec);
                t.expect(&TokenKind::RightBracket);
                if self.executing(exec) {
                    let idx = self.use_value(&index, t);
                    let key = self.to_string_value(&idx);
                    slot = self.member_access(slot, &key, t, exec);
                } else {
                    slot = Slot::temp(self.undefined());
                }
            } else {
                return slot;
            }
        }
    }

    fn eval_suffixes(&mut self, t: &mut TokenStream, exec: bool, mut slot: Slot) -> Slot {
        loop {
            if t.is(&TokenKind::Dot) || t.is(&TokenKind::LeftBracket) || t.is(&TokenKind::LeftParen)
            {
                if t.is(&TokenKind::LeftParen) {
                    slot = self.eval_call(t, exec, slot);
                } else if t.is(&TokenKind::Dot) {
                    t.advance();
                    let name = match t.kind() {
                        TokenKind::Ident(n) => n.to_string(),
                        _ => String::new(),
                    };
                    t.advance();
                    slot = self.member_access(slot, &name, t, exec);
                } else {
                    t.advance();
                    let index = self.eval_expression(t, exec);
                    t.expect(&TokenKind::RightBracket);
                    if self.executing(exec) {
                        let idx = self.use_value(&index, t);
                        let key = self.to_string_value(&idx);
                        slot = self.member_access(slot, &key, t, exec);
                    } else {
                        slot = Slot::temp(self.undefined());
                    }
                }
            } else if t.is(&TokenKind::PlusPlus) || t.is(&TokenKind::MinusMinus) {
                let inc = t.is(&TokenKind::PlusPlus);
                t.advance();
                if self.executing(exec) {
                    let value = self.use_value(&slot, t);
                    let n = self.to_number_value(&value);
                    let new_value = self.new_number(if inc { n + 1.0 } else { n - 1.0 });
                    self.assign_slot(&slot, new_value, t);
                    slot = Slot::temp(self.new_number(n));
                }
            } else {
                return slot;
            }
        }
    }

    fn eval_arguments(&mut self, t: &mut TokenStream, exec: bool) -> Vec<VarPtr> {
        t.expect(&TokenKind::LeftParen);
        let mut args = Vec::new();
        while !t.is(&TokenKind::RightParen) && !t.at_end() {
            let arg = self.eval_assignment(t, exec);
            if self.executing(exec) {
                let value = self.use_value(&arg, t);
                args.push(value);
            }
            if t.is(&TokenKind::Comma) {
                t.advance();
            }
        }
        t.expect(&TokenKind::RightParen);
        args
    }

    fn eval_call(&mut self, t: &mut TokenStream, exec: bool, callee: Slot) -> Slot {
        let pos = (t.line(), t.column());
        let args = self.eval_arguments(t, exec);
        if !self.executing(exec) {
            return Slot::temp(self.undefined());
        }
        let func = self.use_value(&callee, t);
        if !self.sig.is_none() {
            return Slot::temp(self.undefined());
        }
        // `this` is the object the function was read off, when there was
        // one; plain calls get the root.
        let this = match &callee.owner {
            Some(owner) if !owner.borrow().is_scope() => owner.clone(),
            _ => self.root.clone(),
        };
        if !func.borrow().is_function() {
            let what = if callee.name.is_empty() {
                "expression".to_string()
            } else {
                format!("'{}'", callee.name)
            };
            self.throw_error(ErrorKind::TypeError, format!("{} is not a function", what), t);
            return Slot::temp(self.undefined());
        }
        let result = self.call_function(&func, args, this, Some(pos));
        Slot::temp(result)
    }

    fn eval_primary(&mut self, t: &mut TokenStream, exec: bool) -> Slot {
        match t.kind() {
            TokenKind::Int(n) => {
                t.advance();
                if self.executing(exec) {
                    Slot::temp(self.new_int(n))
                } else {
                    Slot::temp(self.undefined())
                }
            }
            TokenKind::Float(f) => {
                t.advance();
                if self.executing(exec) {
                    Slot::temp(self.new_number(f))
                } else {
                    Slot::temp(self.undefined())
                }
            }
            TokenKind::Str(s) => {
                t.advance();
                if self.executing(exec) {
                    Slot::temp(self.new_string(s.as_str()))
                } else {
                    Slot::temp(self.undefined())
                }
            }
            TokenKind::True => {
                t.advance();
                Slot::temp(self.new_bool(true))
            }
            TokenKind::False => {
                t.advance();
                Slot::temp(self.new_bool(false))
            }
            TokenKind::Null => {
                t.advance();
                Slot::temp(self.consts.null.clone())
            }
            TokenKind::RegExp { pattern, flags } => {
                t.advance();
                if self.executing(exec) {
                    let v = self.alloc(VarKind::RegExp {
                        pattern: pattern.to_string(),
                        flags: flags.to_string(),
                    });
                    Slot::temp(v)
                } else {
                    Slot::temp(self.undefined())
                }
            }
            TokenKind::Ident(name) => {
                t.advance();
                if !self.executing(exec) {
                    return Slot::unresolved(name.as_str(), self.undefined());
                }
                match find_in_scopes(self.scope(), &name) {
                    Some(slot) => {
                        // with-scope targets may hold accessors
                        if slot.value.borrow().is_accessor() {
                            let owner = slot.owner.clone().unwrap_or_else(|| self.root.clone());
                            let value = self.call_accessor_get(&slot.value, &owner);
                            Slot::reference(slot.name, value, owner, true)
                        } else {
                            slot
                        }
                    }
                    None if name.as_str() == THIS => Slot::temp(self.root.clone()),
                    // Unresolved: the error is raised where the value is
                    // actually read, so `typeof x` and `x = 1` still work.
                    None => Slot::unresolved(name.as_str(), self.undefined()),
                }
            }
            TokenKind::FunctionOperator(data) | TokenKind::FunctionDecl(data) => {
                t.advance();
                if self.executing(exec) {
                    Slot::temp(self.new_function(data))
                } else {
                    Slot::temp(self.undefined())
                }
            }
            TokenKind::ObjectLiteral(data) => {
                t.advance();
                if self.executing(exec) {
                    Slot::temp(self.eval_object_literal(&data))
                } else {
                    Slot::temp(self.undefined())
                }
            }
            TokenKind::LeftParen => {
                t.advance();
                let slot = self.eval_expression(t, exec);
                t.expect(&TokenKind::RightParen);
                slot
            }
            other => {
                // A well-formed stream never reaches this.
                t.advance();
                if self.executing(exec) {
                    self.throw_error(
                        ErrorKind::SyntaxError,
                        format!("unexpected token '{}'", other),
                        t,
                    );
                }
                Slot::temp(self.undefined())
            }
        }
    }

    fn eval_object_literal(&mut self, data: &crate::token::ObjectLiteralData) -> VarPtr {
        let result = match data.mode {
            LiteralMode::Object => self.new_object(),
            LiteralMode::Array => self.new_array(),
        };
        for element in &data.elements {
            if element.value.is_empty() {
                continue; // array hole
            }
            // Accessor members install getter/setter slots.
            match &element.value[0].kind {
                TokenKind::Getter(fnc) => {
                    let getter = self.new_function(fnc.clone());
                    self.install_accessor(&result, &element.id, Some(getter), None);
                    continue;
                }
                TokenKind::Setter(fnc) => {
                    let setter = self.new_function(fnc.clone());
                    self.install_accessor(&result, &element.id, None, Some(setter));
                    continue;
                }
                _ => {}
            }
            let mut sub = TokenStream::new(&element.value);
            let slot = self.eval_assignment(&mut sub, true);
            let value = self.use_value(&slot, &sub);
            if !self.sig.is_none() {
                return result;
            }
            result.borrow_mut().add_child_or_replace(&element.id, value, LinkFlags::DEFAULT);
        }
        result
    }

    fn install_accessor(
        &mut self,
        obj: &VarPtr,
        name: &str,
        getter: Option<VarPtr>,
        setter: Option<VarPtr>,
    ) {
        let existing = obj.borrow().find_own(name).map(|l| l.value);
        match existing {
            Some(acc) if acc.borrow().is_accessor() => {
                let mut a = acc.borrow_mut();
                if let Some(g) = getter {
                    a.add_child_or_replace(ACCESSOR_GET, g, LinkFlags::empty());
                }
                if let Some(s) = setter {
                    a.add_child_or_replace(ACCESSOR_SET, s, LinkFlags::empty());
                }
            }
            _ => {
                let acc = self.new_accessor(getter, setter);
                obj.borrow_mut().add_child_or_replace(name, acc, LinkFlags::DEFAULT);
            }
        }
    }

    // ---- property access ----

    /// Read `base.name`, invoking accessors and handling the special
    /// `__proto__` and array/string `length` views.
    fn member_access(&mut self, base: Slot, name: &str, t: &TokenStream, exec: bool) -> Slot {
        if !self.executing(exec) {
            return Slot::temp(self.undefined());
        }
        let value = self.use_value(&base, t);
        if !self.sig.is_none() {
            return Slot::temp(self.undefined());
        }
        if value.borrow().is_nullish() {
            let what = value.borrow().to_string_prim();
            self.throw_error(
                ErrorKind::TypeError,
                format!("cannot read property '{}' of {}", name, what),
                t,
            );
            return Slot::temp(self.undefined());
        }

        if name == "__proto__" {
            let proto = value
                .borrow()
                .prototype
                .clone()
                .or_else(|| self.default_proto(&value))
                .unwrap_or_else(|| self.consts.null.clone());
            return Slot::reference(name, proto, value, true);
        }

        if name == "length" {
            let v = value.borrow();
            match &v.kind {
                VarKind::Array => {
                    let len = v.array_length();
                    drop(v);
                    let len_v = self.new_number(len as f64);
                    return Slot::reference(name, len_v, value.clone(), true);
                }
                VarKind::Str(s) => {
                    let len = s.len();
                    drop(v);
                    let len_v = self.new_number(len as f64);
                    return Slot::reference(name, len_v, value.clone(), true);
                }
                _ => {}
            }
        }

        // byte indexing into strings
        let string_byte = match (&value.borrow().kind, name.parse::<usize>()) {
            (VarKind::Str(s), Ok(idx)) => Some(s.as_bytes().get(idx).copied()),
            _ => None,
        };
        match string_byte {
            Some(Some(byte)) => {
                let ch = self.new_string((byte as char).to_string());
                return Slot::reference(name, ch, value, true);
            }
            Some(None) => {
                return Slot::reference(name, self.undefined(), value, false);
            }
            None => {}
        }

        match self.find_prop(&value, name) {
            Some((link, _own)) => {
                if link.value.borrow().is_accessor() {
                    let got = self.call_accessor_get(&link.value, &value);
                    Slot::reference(name, got, value, true)
                } else {
                    Slot::reference(name, link.value, value, true)
                }
            }
            None => Slot::reference(name, self.undefined(), value, false),
        }
    }

    /// Write through a slot produced by expression evaluation.
    fn assign_slot(&mut self, slot: &Slot, value: VarPtr, t: &TokenStream) {
        match &slot.owner {
            Some(owner) => {
                self.set_property(&owner.clone(), &slot.name, value, Some(t));
            }
            None if !slot.name.is_empty() => {
                // implicit global
                self.root.borrow_mut().add_child_or_replace(&slot.name, value, LinkFlags::DEFAULT);
            }
            None => {
                self.throw_error(
                    ErrorKind::ReferenceError,
                    "invalid assignment left-hand side".into(),
                    t,
                );
            }
        }
    }

    /// Property write: honors accessors, writability, extensibility,
    /// the array `length` view and `__proto__`.
    fn set_property(
        &mut self,
        owner: &VarPtr,
        name: &str,
        value: VarPtr,
        t: Option<&TokenStream>,
    ) {
        if name == "__proto__" && !owner.borrow().is_scope() {
            if value.borrow().is_nullish() {
                owner.borrow_mut().prototype = None;
                return;
            }
            if prototype_would_cycle(owner, &value) {
                let v = self.new_error(
                    ErrorKind::TypeError,
                    "cyclic __proto__ value",
                    t.map_or(0, |t| t.line()),
                    t.map_or(0, |t| t.column()),
                );
                self.sig = Signal::Throw(v);
                return;
            }
            owner.borrow_mut().prototype = Some(value);
            return;
        }

        if owner.borrow().is_array() && name == "length" {
            let n = self.to_number_value(&value);
            if n < 0.0 || !n.is_finite() {
                let v = self.new_error(
                    ErrorKind::RangeError,
                    "invalid array length",
                    t.map_or(0, |t| t.line()),
                    t.map_or(0, |t| t.column()),
                );
                self.sig = Signal::Throw(v);
                return;
            }
            owner.borrow_mut().set_array_length(n as u32);
            return;
        }

        // Writes on primitives are silently dropped (non-extensible).
        if owner.borrow().is_primitive() {
            return;
        }

        // Existing own property.
        let own = owner.borrow().find_own(name);
        if let Some(link) = own {
            if link.value.borrow().is_accessor() {
                self.call_accessor_set(&link.value, owner, value);
                return;
            }
            if !link.is_writable() {
                return;
            }
            let idx = owner.borrow().find_own_index(name);
            if let Some(idx) = idx {
                owner.borrow_mut().childs[idx].value = value;
            }
            return;
        }

        // An accessor anywhere on the chain intercepts the write.
        if let Some((link, false)) = self.find_prop(owner, name) {
            if link.value.borrow().is_accessor() {
                self.call_accessor_set(&link.value, owner, value);
                return;
            }
        }

        if !owner.borrow().extensible {
            return;
        }
        owner.borrow_mut().add_child(name, value, LinkFlags::DEFAULT);
    }

    // ---- operators ----

    /// Binary operator semantics.
    pub fn maths_op(&mut self, a: &VarPtr, b: &VarPtr, op: &TokenKind, t: &TokenStream) -> VarPtr {
        match op {
            TokenKind::StrictEqual => return self.new_bool(strict_equals(a, b)),
            TokenKind::StrictNotEqual => return self.new_bool(!strict_equals(a, b)),
            TokenKind::Equal => {
                let eq = self.abstract_equals(a, b);
                return self.new_bool(eq);
            }
            TokenKind::NotEqual => {
                let eq = self.abstract_equals(a, b);
                return self.new_bool(!eq);
            }
            TokenKind::In => {
                if b.borrow().is_primitive() {
                    self.throw_error(
                        ErrorKind::TypeError,
                        "'in' needs an object operand".into(),
                        t,
                    );
                    return self.undefined();
                }
                let key = self.to_string_value(a);
                let found = self.find_prop(b, &key).is_some();
                return self.new_bool(found);
            }
            TokenKind::Instanceof => {
                if !b.borrow().is_function() {
                    self.throw_error(
                        ErrorKind::TypeError,
                        "right-hand side of 'instanceof' is not callable".into(),
                        t,
                    );
                    return self.undefined();
                }
                let proto = b.borrow().find_own(PROTOTYPE).map(|l| l.value);
                let mut found = false;
                if let Some(proto) = proto {
                    let mut chain = a.borrow().prototype.clone();
                    while let Some(p) = chain {
                        if Rc::ptr_eq(&p, &proto) {
                            found = true;
                            break;
                        }
                        chain = p.borrow().prototype.clone();
                    }
                }
                return self.new_bool(found);
            }
            _ => {}
        }

        let pa = self.to_primitive(a, false);
        let pb = self.to_primitive(b, false);
        if !self.sig.is_none() {
            return self.undefined();
        }

        // `+` with a string operand concatenates.
        if matches!(op, TokenKind::Plus)
            && (pa.borrow().is_string() || pb.borrow().is_string())
        {
            let s = format!("{}{}", pa.borrow().to_string_prim(), pb.borrow().to_string_prim());
            return self.new_string(s);
        }

        // String relational comparison is byte-lexicographic.
        if pa.borrow().is_string() && pb.borrow().is_string() {
            let sa = pa.borrow().to_string_prim();
            let sb = pb.borrow().to_string_prim();
            match op {
                TokenKind::LessThan => return self.new_bool(sa < sb),
                TokenKind::LessEqual => return self.new_bool(sa <= sb),
                TokenKind::GreaterThan => return self.new_bool(sa > sb),
                TokenKind::GreaterEqual => return self.new_bool(sa >= sb),
                _ => {}
            }
        }

        // Integer-preserving arithmetic.
        let int_pair = match (&pa.borrow().kind, &pb.borrow().kind) {
            (VarKind::Int(x), VarKind::Int(y)) => Some((*x as i64, *y as i64)),
            _ => None,
        };
        if let Some((x, y)) = int_pair {
            match op {
                TokenKind::Plus => return self.int_result(x + y),
                TokenKind::Minus => return self.int_result(x - y),
                TokenKind::Star => return self.int_result(x * y),
                TokenKind::Slash if y != 0 && x % y == 0 => return self.int_result(x / y),
                TokenKind::Percent if y != 0 => return self.int_result(x % y),
                _ => {}
            }
        }

        let na = pa.borrow().to_number();
        let nb = pb.borrow().to_number();
        match op {
            TokenKind::Plus => self.new_number(na + nb),
            TokenKind::Minus => self.new_number(na - nb),
            TokenKind::Star => self.new_number(na * nb),
            TokenKind::Slash => self.new_number(na / nb),
            TokenKind::Percent => self.new_number(na % nb),
            TokenKind::Ampersand => {
                let r = pa.borrow().to_int32() & pb.borrow().to_int32();
                self.new_int(r)
            }
            TokenKind::Pipe => {
                let r = pa.borrow().to_int32() | pb.borrow().to_int32();
                self.new_int(r)
            }
            TokenKind::Caret => {
                let r = pa.borrow().to_int32() ^ pb.borrow().to_int32();
                self.new_int(r)
            }
            TokenKind::LeftShift => {
                let r = pa.borrow().to_int32() << (pb.borrow().to_uint32() & 0x1f);
                self.new_int(r)
            }
            TokenKind::RightShift => {
                let r = pa.borrow().to_int32() >> (pb.borrow().to_uint32() & 0x1f);
                self.new_int(r)
            }
            TokenKind::UnsignedRightShift => {
                let r = pa.borrow().to_uint32() >> (pb.borrow().to_uint32() & 0x1f);
                self.new_number(r as f64)
            }
            TokenKind::LessThan => self.new_bool(na < nb),
            TokenKind::LessEqual => self.new_bool(na <= nb),
            TokenKind::GreaterThan => self.new_bool(na > nb),
            TokenKind::GreaterEqual => self.new_bool(na >= nb),
            _ => self.undefined(),
        }
    }

    fn int_result(&mut self, n: i64) -> VarPtr {
        match i32::try_from(n) {
            Ok(v) => self.new_int(v),
            Err(_) => self.new_number(n as f64),
        }
    }

    /// The `==` lattice.
    fn abstract_equals(&mut self, a: &VarPtr, b: &VarPtr) -> bool {
        let (a_prim, b_prim) = (a.borrow().is_primitive(), b.borrow().is_primitive());
        if !a_prim && !b_prim {
            return Rc::ptr_eq(a, b);
        }
        if !a_prim {
            let pa = self.to_primitive(a, false);
            return self.abstract_equals(&pa, b);
        }
        if !b_prim {
            let pb = self.to_primitive(b, false);
            return self.abstract_equals(a, &pb);
        }

        let ka = a.borrow();
        let kb = b.borrow();
        match (&ka.kind, &kb.kind) {
            (VarKind::Undefined | VarKind::Null, VarKind::Undefined | VarKind::Null) => true,
            (VarKind::Str(x), VarKind::Str(y)) => x == y,
            (VarKind::Str(_), _) | (_, VarKind::Str(_)) | (VarKind::Bool(_), _)
            | (_, VarKind::Bool(_)) => {
                let na = ka.to_number();
                let nb = kb.to_number();
                if (ka.is_nullish() && !kb.is_nullish()) || (kb.is_nullish() && !ka.is_nullish()) {
                    return false;
                }
                na == nb
            }
            _ if ka.is_number() && kb.is_number() => ka.to_number() == kb.to_number(),
            _ => false,
        }
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}
