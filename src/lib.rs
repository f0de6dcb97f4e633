//! minijs — an embeddable ECMAScript-like interpreter.
//!
//! Source text is scanned, pre-parsed into a flat token vector with
//! structured payloads, and evaluated in a tree-walking style against a
//! dynamically typed, prototype-based object graph. Host programs drive
//! it: instantiate a context, register native callbacks, execute
//! scripts, read results back.
//!
//! # Architecture
//!
//! The engine is organized into:
//!
//! - `lexer`: character-level scanning with ASI line-break tracking
//! - `tokenizer`: pre-parser producing the preprocessed token vector
//! - `token`: token kinds and the structured payload side-tables
//! - `interpreter`: tree-walking evaluator and the context/host API
//! - `value`: runtime value representation (tagged sum + properties)
//! - `object`: property links, link flags and scope resolution
//! - `builtin`: built-in classes, `eval`, `parseInt`, `JSON`, regex
//! - `gc`: stamp-based cycle collector over the heap registry
//! - `error`: script error kinds and host-facing errors
//!
//! # Usage
//!
//! ```
//! use minijs::Interpreter;
//!
//! let mut engine = Interpreter::new();
//! let result = engine.evaluate("var a = 1; var b = 2; a + b", "demo", 1).unwrap();
//! assert_eq!(result, "3");
//! ```
//!
//! Native callbacks are registered with a signature string; a `Class.`
//! prefix installs the function on that class's prototype:
//!
//! ```
//! use minijs::Interpreter;
//!
//! let mut engine = Interpreter::new();
//! engine
//!     .add_native("function double(x)", |i, _this, args| {
//!         let n = i.to_number_value(&args[0]);
//!         Ok(i.new_number(n * 2.0))
//!     })
//!     .unwrap();
//! assert_eq!(engine.evaluate("double(21)", "demo", 1).unwrap(), "42");
//! ```

pub mod builtin;
pub mod error;
pub mod gc;
pub mod interpreter;
pub mod lexer;
pub mod object;
pub mod token;
pub mod tokenizer;
pub mod value;

pub use error::{ErrorKind, ScriptError, ScriptResult};
pub use gc::GcStats;
pub use interpreter::Interpreter;
pub use value::{ScriptVar, VarKind, VarPtr};

/// Engine version.
pub const VERSION: &str = "0.1.0";

/// Quick evaluation of a script in a fresh context.
pub fn eval(source: &str) -> ScriptResult<String> {
    let mut engine = Interpreter::new();
    engine.evaluate(source, "eval", 1)
}

/// Quick evaluation with preset globals.
pub fn eval_with_globals(source: &str, globals: &[(&str, VarPtr)]) -> ScriptResult<String> {
    let mut engine = Interpreter::new();
    for (name, value) in globals {
        engine.set_global(name, value.clone());
    }
    engine.evaluate(source, "eval", 1)
}
