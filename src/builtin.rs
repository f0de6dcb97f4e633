//! Built-in classes and core globals.
//!
//! Wires the constructors, prototypes and the handful of methods the
//! core owns (`eval`, `parseInt`, `JSON`, the error classes, regex
//! matching). The wider standard library is the host's business and is
//! registered through [`Interpreter::add_native`].

use std::rc::Rc;

use regex::Regex;

use crate::error::{ErrorKind, ScriptError, ScriptResult};
use crate::interpreter::Interpreter;
use crate::lexer::Lexer;
use crate::object::{LinkFlags, CONSTRUCTOR, PROTOTYPE};
use crate::token::{get_js_string, TokenKind};
use crate::tokenizer::tokenize;
use crate::value::{VarKind, VarPtr};

/// Install the built-ins into a fresh context.
pub fn init(interp: &mut Interpreter) {
    init_object(interp);
    init_array(interp);
    init_string(interp);
    init_number(interp);
    init_boolean(interp);
    init_function(interp);
    init_regexp(interp);
    init_errors(interp);
    init_globals(interp);
    init_json(interp);
}

fn arg(args: &[VarPtr], i: usize, interp: &Interpreter) -> VarPtr {
    args.get(i).cloned().unwrap_or_else(|| interp.consts.undefined.clone())
}

/// Register a constructor whose `prototype` is one of the wired class
/// prototypes, with the back `constructor` link.
fn register_class<F>(interp: &mut Interpreter, name: &str, proto: VarPtr, ctor: F) -> VarPtr
where
    F: Fn(&mut Interpreter, &VarPtr, &[VarPtr]) -> ScriptResult<VarPtr> + 'static,
{
    let ctor_var = interp.new_native(name, ctor);
    ctor_var
        .borrow_mut()
        .add_child_or_replace(PROTOTYPE, proto.clone(), LinkFlags::empty());
    proto
        .borrow_mut()
        .add_child_or_replace(CONSTRUCTOR, ctor_var.clone(), LinkFlags::WRITABLE | LinkFlags::DELETABLE);
    let root = interp.root();
    root.borrow_mut()
        .add_child_or_replace(name, ctor_var.clone(), LinkFlags::NATIVE_DEFAULT);
    ctor_var
}

fn method<F>(interp: &mut Interpreter, target: &VarPtr, name: &str, f: F)
where
    F: Fn(&mut Interpreter, &VarPtr, &[VarPtr]) -> ScriptResult<VarPtr> + 'static,
{
    let fnc = interp.new_native(name, f);
    target.borrow_mut().add_child_or_replace(name, fnc, LinkFlags::NATIVE_DEFAULT);
}

// ---- Object ----

fn init_object(interp: &mut Interpreter) {
    let proto = interp.protos.object.clone();
    register_class(interp, "Object", proto.clone(), |i, _this, args| {
        match args.first() {
            Some(v) if !v.borrow().is_nullish() => Ok(v.clone()),
            _ => Ok(i.new_object()),
        }
    });

    method(interp, &proto, "toString", |i, _this, _args| {
        Ok(i.new_string("[object Object]"))
    });
    method(interp, &proto, "valueOf", |_i, this, _args| Ok(this.clone()));
    method(interp, &proto, "hasOwnProperty", |i, this, args| {
        let name = i.to_string_value(&arg(args, 0, i));
        let found = this.borrow().find_own(&name).is_some();
        Ok(i.new_bool(found))
    });
}

// ---- Array ----

fn init_array(interp: &mut Interpreter) {
    let proto = interp.protos.array.clone();
    register_class(interp, "Array", proto.clone(), |i, _this, args| {
        let array = i.new_array();
        for (idx, value) in args.iter().enumerate() {
            array
                .borrow_mut()
                .add_child(idx.to_string(), value.clone(), LinkFlags::DEFAULT);
        }
        Ok(array)
    });

    method(interp, &proto, "push", |i, this, args| {
        for value in args {
            let idx = this.borrow().array_length();
            this.borrow_mut()
                .add_child_or_replace(idx.to_string(), value.clone(), LinkFlags::DEFAULT);
        }
        let len = this.borrow().array_length();
        Ok(i.new_number(len as f64))
    });
    method(interp, &proto, "join", |i, this, args| {
        let sep = match args.first() {
            Some(s) if !s.borrow().is_undefined() => i.to_string_value(s),
            _ => ",".into(),
        };
        let joined = join_array(i, this, &sep);
        Ok(i.new_string(joined))
    });
    method(interp, &proto, "toString", |i, this, _args| {
        let joined = join_array(i, this, ",");
        Ok(i.new_string(joined))
    });
}

fn join_array(interp: &mut Interpreter, array: &VarPtr, sep: &str) -> String {
    let len = array.borrow().array_length();
    let mut parts = Vec::with_capacity(len as usize);
    for idx in 0..len {
        let element = array.borrow().find_own(&idx.to_string()).map(|l| l.value);
        let text = match element {
            Some(v) if !v.borrow().is_nullish() => interp.to_string_value(&v),
            _ => String::new(),
        };
        parts.push(text);
    }
    parts.join(sep)
}

// ---- String ----

fn init_string(interp: &mut Interpreter) {
    let proto = interp.protos.string.clone();
    register_class(interp, "String", proto.clone(), |i, _this, args| {
        let s = match args.first() {
            Some(v) => i.to_string_value(v),
            None => String::new(),
        };
        Ok(i.new_string(s))
    });

    method(interp, &proto, "toString", |i, this, _args| {
        let s = this.borrow().to_string_prim();
        Ok(i.new_string(s))
    });
    method(interp, &proto, "valueOf", |_i, this, _args| Ok(this.clone()));
    method(interp, &proto, "charAt", |i, this, args| {
        let s = this.borrow().to_string_prim();
        let idx = i.to_number_value(&arg(args, 0, i));
        let ch = if idx >= 0.0 {
            s.as_bytes().get(idx as usize).map(|b| (*b as char).to_string())
        } else {
            None
        };
        Ok(i.new_string(ch.unwrap_or_default()))
    });
    method(interp, &proto, "indexOf", |i, this, args| {
        let s = this.borrow().to_string_prim();
        let needle = i.to_string_value(&arg(args, 0, i));
        let idx = s.find(&needle).map(|p| p as f64).unwrap_or(-1.0);
        Ok(i.new_number(idx))
    });
    method(interp, &proto, "substring", |i, this, args| {
        let s = this.borrow().to_string_prim();
        let len = s.len() as f64;
        let mut lo = i.to_number_value(&arg(args, 0, i));
        let mut hi = match args.get(1) {
            Some(v) if !v.borrow().is_undefined() => i.to_number_value(v),
            _ => len,
        };
        if lo.is_nan() || lo < 0.0 {
            lo = 0.0;
        }
        if hi.is_nan() || hi < 0.0 {
            hi = 0.0;
        }
        let (lo, hi) = (lo.min(len) as usize, hi.min(len) as usize);
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        Ok(i.new_string(s[lo..hi].to_string()))
    });
}

// ---- Number / Boolean ----

fn init_number(interp: &mut Interpreter) {
    let proto = interp.protos.number.clone();
    register_class(interp, "Number", proto.clone(), |i, _this, args| {
        let n = match args.first() {
            Some(v) => i.to_number_value(v),
            None => 0.0,
        };
        Ok(i.new_number(n))
    });

    method(interp, &proto, "toString", |i, this, args| {
        let radix = match args.first() {
            Some(v) if !v.borrow().is_undefined() => i.to_number_value(v) as i64,
            _ => 10,
        };
        if !(2..=36).contains(&radix) {
            return Err(ScriptError::range("radix must be between 2 and 36"));
        }
        if radix == 10 {
            let s = this.borrow().to_string_prim();
            return Ok(i.new_string(s));
        }
        let n = this.borrow().to_number();
        Ok(i.new_string(int_to_radix(n as i64, radix as u32)))
    });
    method(interp, &proto, "valueOf", |_i, this, _args| Ok(this.clone()));
}

fn int_to_radix(mut n: i64, radix: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".into();
    }
    let negative = n < 0;
    if negative {
        n = -n;
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % radix as i64) as usize]);
        n /= radix as i64;
    }
    if negative {
        out.push(b'-');
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn init_boolean(interp: &mut Interpreter) {
    let proto = interp.protos.boolean.clone();
    register_class(interp, "Boolean", proto.clone(), |i, _this, args| {
        let b = match args.first() {
            Some(v) => v.borrow().to_boolean(),
            None => false,
        };
        Ok(i.new_bool(b))
    });
    method(interp, &proto, "toString", |i, this, _args| {
        let s = this.borrow().to_string_prim();
        Ok(i.new_string(s))
    });
    method(interp, &proto, "valueOf", |_i, this, _args| Ok(this.clone()));
}

// ---- Function ----

fn init_function(interp: &mut Interpreter) {
    let proto = interp.protos.function.clone();
    register_class(interp, "Function", proto.clone(), |i, _this, args| {
        // Function(arg..., body): assembled into source and evaluated.
        let mut params = Vec::new();
        let mut body = String::new();
        for (idx, a) in args.iter().enumerate() {
            let text = i.to_string_value(a);
            if idx + 1 == args.len() {
                body = text;
            } else {
                params.push(text);
            }
        }
        let source = format!("(function ({}) {{ {} }});", params.join(", "), body);
        i.execute(&source, "Function", 0)
    });

    method(interp, &proto, "call", |i, this, args| {
        let call_this = arg(args, 0, i);
        let rest: Vec<VarPtr> = args.iter().skip(1).cloned().collect();
        Ok(i.call_function(this, rest, call_this, None))
    });
    method(interp, &proto, "apply", |i, this, args| {
        let call_this = arg(args, 0, i);
        let mut rest = Vec::new();
        if let Some(list) = args.get(1) {
            if !list.borrow().is_nullish() {
                let len = list.borrow().array_length();
                for idx in 0..len {
                    let element = list
                        .borrow()
                        .find_own(&idx.to_string())
                        .map(|l| l.value)
                        .unwrap_or_else(|| i.consts.undefined.clone());
                    rest.push(element);
                }
            }
        }
        Ok(i.call_function(this, rest, call_this, None))
    });
    method(interp, &proto, "toString", |i, this, _args| {
        let s = this.borrow().to_string_prim();
        Ok(i.new_string(s))
    });
}

// ---- RegExp ----

fn init_regexp(interp: &mut Interpreter) {
    let proto = interp.protos.regexp.clone();
    register_class(interp, "RegExp", proto.clone(), |i, _this, args| {
        let pattern = match args.first() {
            Some(v) => match &v.borrow().kind {
                VarKind::RegExp { pattern, .. } => pattern.clone(),
                _ => i.to_string_value(v),
            },
            None => String::new(),
        };
        let flags = match args.get(1) {
            Some(v) if !v.borrow().is_undefined() => i.to_string_value(v),
            _ => String::new(),
        };
        Ok(i.alloc(VarKind::RegExp { pattern, flags }))
    });

    method(interp, &proto, "exec", |i, this, args| {
        let subject = i.to_string_value(&arg(args, 0, i));
        let matcher = compile_regex(this)?;
        match matcher.captures(&subject) {
            Some(caps) => {
                let result = i.new_array();
                for (idx, group) in caps.iter().enumerate() {
                    let value = match group {
                        Some(m) => i.new_string(m.as_str().to_string()),
                        None => i.consts.undefined.clone(),
                    };
                    result
                        .borrow_mut()
                        .add_child(idx.to_string(), value, LinkFlags::DEFAULT);
                }
                let whole = caps.get(0).expect("capture 0 always present");
                let index = i.new_number(whole.start() as f64);
                let input = i.new_string(subject.clone());
                result.borrow_mut().add_child("index", index, LinkFlags::DEFAULT);
                result.borrow_mut().add_child("input", input, LinkFlags::DEFAULT);
                Ok(result)
            }
            None => Ok(i.consts.null.clone()),
        }
    });
    method(interp, &proto, "test", |i, this, args| {
        let subject = i.to_string_value(&arg(args, 0, i));
        let matcher = compile_regex(this)?;
        Ok(i.new_bool(matcher.is_match(&subject)))
    });
    method(interp, &proto, "toString", |i, this, _args| {
        let s = this.borrow().to_string_prim();
        Ok(i.new_string(s))
    });
}

/// Build the backend matcher. The `m` flag is accepted but multiline is
/// always on; `g`/`y` only affect iteration the core does not do.
fn compile_regex(value: &VarPtr) -> ScriptResult<Regex> {
    let (pattern, flags) = match &value.borrow().kind {
        VarKind::RegExp { pattern, flags } => (pattern.clone(), flags.clone()),
        _ => return Err(ScriptError::type_error("receiver is not a RegExp")),
    };
    let mut opts = String::from("m");
    if flags.contains('i') {
        opts.push('i');
    }
    let full = format!("(?{}){}", opts, pattern);
    Regex::new(&full)
        .map_err(|e| ScriptError::new(ErrorKind::SyntaxError, format!("invalid regular expression: {}", e)))
}

// ---- Errors ----

fn init_errors(interp: &mut Interpreter) {
    for kind in ErrorKind::all() {
        let proto = interp.protos.error_proto(kind).clone();
        let name = interp.new_string(kind.name());
        proto
            .borrow_mut()
            .add_child_or_replace("name", name, LinkFlags::WRITABLE | LinkFlags::DELETABLE);
        register_class(interp, kind.name(), proto.clone(), move |i, _this, args| {
            let message = match args.first() {
                Some(v) if !v.borrow().is_undefined() => i.to_string_value(v),
                _ => String::new(),
            };
            Ok(i.new_error(kind, &message, 0, 0))
        });
    }

    let base = interp.protos.error_proto(ErrorKind::Error).clone();
    let empty = interp.new_string("");
    base.borrow_mut()
        .add_child_or_replace("message", empty, LinkFlags::WRITABLE | LinkFlags::DELETABLE);
    method(interp, &base, "toString", |i, this, _args| {
        let name = i
            .find_prop(this, "name")
            .map(|(l, _)| l.value.borrow().to_string_prim())
            .unwrap_or_else(|| "Error".into());
        let message = i
            .find_prop(this, "message")
            .map(|(l, _)| l.value.borrow().to_string_prim())
            .unwrap_or_default();
        let text = if message.is_empty() { name } else { format!("{}: {}", name, message) };
        Ok(i.new_string(text))
    });
}

// ---- free globals ----

fn init_globals(interp: &mut Interpreter) {
    let root = interp.root();

    method(interp, &root, "eval", |i, _this, args| {
        let subject = arg(args, 0, i);
        let code = match &subject.borrow().kind {
            VarKind::Str(s) => s.clone(),
            _ => return Ok(subject.clone()),
        };
        let tokens = tokenize(&code, "eval", 0)?;
        Ok(i.run_statements(&tokens))
    });

    method(interp, &root, "parseInt", |i, this_arg, args| {
        let _ = this_arg;
        let text = i.to_string_value(&arg(args, 0, i));
        let radix = match args.get(1) {
            Some(v) if !v.borrow().is_undefined() => i.to_number_value(v) as i64,
            _ => 0,
        };
        if radix != 0 && !(2..=36).contains(&radix) {
            return Err(ScriptError::range("radix must be between 2 and 36"));
        }
        Ok(parse_int(i, &text, radix as u32))
    });

    method(interp, &root, "parseFloat", |i, _this, args| {
        let text = i.to_string_value(&arg(args, 0, i));
        let text = text.trim();
        // longest numeric prefix
        let mut end = 0;
        let bytes = text.as_bytes();
        let mut seen_dot = false;
        let mut seen_exp = false;
        while end < bytes.len() {
            let b = bytes[end];
            let ok = b.is_ascii_digit()
                || (b == b'.' && !seen_dot && !seen_exp)
                || ((b == b'e' || b == b'E') && !seen_exp && end > 0)
                || ((b == b'+' || b == b'-')
                    && (end == 0 || bytes[end - 1] == b'e' || bytes[end - 1] == b'E'));
            if !ok {
                break;
            }
            seen_dot |= b == b'.';
            seen_exp |= b == b'e' || b == b'E';
            end += 1;
        }
        let n = text[..end].parse::<f64>().unwrap_or(f64::NAN);
        Ok(i.new_number(n))
    });

    method(interp, &root, "isNaN", |i, _this, args| {
        let n = i.to_number_value(&arg(args, 0, i));
        Ok(i.new_bool(n.is_nan()))
    });

    method(interp, &root, "isFinite", |i, _this, args| {
        let n = i.to_number_value(&arg(args, 0, i));
        Ok(i.new_bool(n.is_finite()))
    });
}

fn parse_int(interp: &mut Interpreter, text: &str, mut radix: u32) -> VarPtr {
    let mut s = text.trim();
    let mut negative = false;
    if let Some(rest) = s.strip_prefix('-') {
        negative = true;
        s = rest;
    } else if let Some(rest) = s.strip_prefix('+') {
        s = rest;
    }
    if radix == 0 || radix == 16 {
        if let Some(rest) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            s = rest;
            radix = 16;
        }
    }
    if radix == 0 {
        radix = 10;
    }
    let mut value: f64 = 0.0;
    let mut digits = 0;
    for ch in s.chars() {
        match ch.to_digit(radix) {
            Some(d) => {
                value = value * radix as f64 + d as f64;
                digits += 1;
            }
            None => break,
        }
    }
    if digits == 0 {
        return interp.consts.nan.clone();
    }
    if negative {
        value = -value;
    }
    if value.fract() == 0.0 && value.abs() <= i32::MAX as f64 {
        interp.new_int(value as i32)
    } else {
        interp.new_number(value)
    }
}

// ---- JSON ----

fn init_json(interp: &mut Interpreter) {
    let json = interp.new_object();
    method(interp, &json, "stringify", |i, _this, args| {
        let subject = arg(args, 0, i);
        let mut visited = Vec::new();
        let text = json_stringify(i, &subject, &mut visited)?;
        Ok(i.new_string(text))
    });
    method(interp, &json, "parse", |i, _this, args| {
        let text = i.to_string_value(&arg(args, 0, i));
        let mut lexer = Lexer::new(&text, "JSON", 0)?;
        let value = json_parse_value(i, &mut lexer)?;
        if !lexer.tok.is_eof() {
            return Err(ScriptError::syntax("unexpected trailing JSON input"));
        }
        Ok(value)
    });
    let root = interp.root();
    root.borrow_mut().add_child_or_replace("JSON", json, LinkFlags::NATIVE_DEFAULT);
}

fn json_stringify(
    interp: &mut Interpreter,
    value: &VarPtr,
    visited: &mut Vec<*const ()>,
) -> ScriptResult<String> {
    let ptr = Rc::as_ptr(value) as *const ();
    let v = value.borrow();
    match &v.kind {
        VarKind::Undefined | VarKind::Null | VarKind::NaN | VarKind::Infinity(_) => {
            Ok("null".into())
        }
        VarKind::Bool(b) => Ok(if *b { "true" } else { "false" }.into()),
        VarKind::Int(n) => Ok(n.to_string()),
        VarKind::Double(n) => Ok(n.to_string()),
        VarKind::Str(s) => Ok(get_js_string(s)),
        VarKind::Function(_) | VarKind::Native(_) => Ok("null".into()),
        VarKind::Array => {
            if visited.contains(&ptr) {
                return Err(ScriptError::type_error("converting circular structure to JSON"));
            }
            visited.push(ptr);
            let len = v.array_length();
            drop(v);
            let mut parts = Vec::with_capacity(len as usize);
            for idx in 0..len {
                let element = value.borrow().find_own(&idx.to_string()).map(|l| l.value);
                let text = match element {
                    Some(e) => json_stringify(interp, &e, visited)?,
                    None => "null".into(),
                };
                parts.push(text);
            }
            visited.pop();
            Ok(format!("[{}]", parts.join(",")))
        }
        _ => {
            if visited.contains(&ptr) {
                return Err(ScriptError::type_error("converting circular structure to JSON"));
            }
            visited.push(ptr);
            let links: Vec<(String, VarPtr)> = v
                .childs
                .iter()
                .filter(|l| l.is_enumerable())
                .map(|l| (l.name.clone(), l.value.clone()))
                .collect();
            drop(v);
            let mut parts = Vec::with_capacity(links.len());
            for (name, child) in links {
                if child.borrow().is_function() || child.borrow().is_undefined() {
                    continue;
                }
                let text = json_stringify(interp, &child, visited)?;
                parts.push(format!("{}:{}", get_js_string(&name), text));
            }
            visited.pop();
            Ok(format!("{{{}}}", parts.join(",")))
        }
    }
}

fn json_parse_value(interp: &mut Interpreter, lexer: &mut Lexer<'_>) -> ScriptResult<VarPtr> {
    let kind = lexer.tok.kind.clone();
    match kind {
        TokenKind::Str(s) => {
            lexer.advance()?;
            Ok(interp.new_string(s.as_str()))
        }
        TokenKind::Int(n) => {
            lexer.advance()?;
            Ok(interp.new_int(n))
        }
        TokenKind::Float(f) => {
            lexer.advance()?;
            Ok(interp.new_number(f))
        }
        TokenKind::Minus => {
            lexer.advance()?;
            let inner = json_parse_value(interp, lexer)?;
            let n = inner.borrow().to_number();
            Ok(interp.new_number(-n))
        }
        TokenKind::True => {
            lexer.advance()?;
            Ok(interp.new_bool(true))
        }
        TokenKind::False => {
            lexer.advance()?;
            Ok(interp.new_bool(false))
        }
        TokenKind::Null => {
            lexer.advance()?;
            Ok(interp.consts.null.clone())
        }
        TokenKind::LeftBracket => {
            lexer.advance()?;
            let array = interp.new_array();
            let mut idx = 0u32;
            while !matches!(lexer.tok.kind, TokenKind::RightBracket) {
                let element = json_parse_value(interp, lexer)?;
                array
                    .borrow_mut()
                    .add_child(idx.to_string(), element, LinkFlags::DEFAULT);
                idx += 1;
                if matches!(lexer.tok.kind, TokenKind::Comma) {
                    lexer.advance()?;
                } else {
                    break;
                }
            }
            lexer.match_tok(&TokenKind::RightBracket, None)?;
            Ok(array)
        }
        TokenKind::LeftBrace => {
            lexer.advance()?;
            let object = interp.new_object();
            while !matches!(lexer.tok.kind, TokenKind::RightBrace) {
                let key = match &lexer.tok.kind {
                    TokenKind::Str(s) => s.to_string(),
                    TokenKind::Ident(n) => n.to_string(),
                    other => {
                        return Err(ScriptError::syntax(format!(
                            "got '{}' expected a JSON member name",
                            other
                        )))
                    }
                };
                lexer.advance()?;
                lexer.match_tok(&TokenKind::Colon, None)?;
                let value = json_parse_value(interp, lexer)?;
                object.borrow_mut().add_child_or_replace(&key, value, LinkFlags::DEFAULT);
                if matches!(lexer.tok.kind, TokenKind::Comma) {
                    lexer.advance()?;
                } else {
                    break;
                }
            }
            lexer.match_tok(&TokenKind::RightBrace, None)?;
            Ok(object)
        }
        other => Err(ScriptError::syntax(format!("got '{}' expected a JSON value", other))),
    }
}
