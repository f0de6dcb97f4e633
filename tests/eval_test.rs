//! End-to-end interpreter tests: literal scripts in, observed output of
//! `evaluate` out.

use minijs::{ErrorKind, Interpreter};

fn eval(source: &str) -> String {
    let mut engine = Interpreter::new();
    engine.evaluate(source, "test", 1).expect("script failed")
}

#[test]
fn test_arithmetic_and_vars() {
    assert_eq!(eval("var a = 1; var b = 2; a + b"), "3");
    assert_eq!(eval("1 + 2 * 3"), "7");
    assert_eq!(eval("(1 + 2) * 3"), "9");
    assert_eq!(eval("10 % 3"), "1");
    assert_eq!(eval("2 + 2 + 'x'"), "4x");
    assert_eq!(eval("'x' + 1 + 2"), "x12");
}

#[test]
fn test_number_edges() {
    assert_eq!(eval("1 / 0"), "Infinity");
    assert_eq!(eval("-1 / 0"), "-Infinity");
    assert_eq!(eval("0 / 0"), "NaN");
    assert_eq!(eval("3 % 0"), "NaN");
    assert_eq!(eval("0.1 + 0.2 > 0.3"), "true");
    assert_eq!(eval("7 / 2"), "3.5");
    assert_eq!(eval("6 / 2"), "3");
}

#[test]
fn test_equality_lattice() {
    assert_eq!(eval("1 == '1'"), "true");
    assert_eq!(eval("1 === '1'"), "false");
    assert_eq!(eval("null == undefined"), "true");
    assert_eq!(eval("null === undefined"), "false");
    assert_eq!(eval("NaN === NaN"), "false");
    assert_eq!(eval("true == 1"), "true");
    assert_eq!(eval("'b' > 'a'"), "true");
}

#[test]
fn test_closure_capture() {
    let src = "function f(x){ return function(y){ return x+y; }; } var g = f(10); g(5)";
    assert_eq!(eval(src), "15");
}

#[test]
fn test_array_length_view() {
    assert_eq!(eval("var a = []; a[3] = 'x'; a.length + ',' + a[0]"), "4,undefined");
    assert_eq!(eval("var a = [1,2,3]; a.length = 1; a.length + ',' + a[0]"), "1,1");
    assert_eq!(eval("var a = [1,2]; a.push(9); a.join('-')"), "1-2-9");
}

#[test]
fn test_try_catch_type_error() {
    let src = "var out; try { null.x; } catch (e) { out = e.message; } out";
    assert!(!eval(src).is_empty());
    assert_eq!(eval("var t; try { null.x; } catch (e) { t = typeof e; } t"), "object");
    assert_eq!(eval("var r; try { null.x; } catch (e) { r = e instanceof TypeError; } r"), "true");
    assert_eq!(eval("var r; try { null.x; } catch (e) { r = e instanceof Error; } r"), "true");
}

#[test]
fn test_for_in_insertion_order() {
    let src = "var o = {}; Object.defineProperty && 'ok'; o.a = 1; var k=''; for (var n in o) k+=n; k";
    assert_eq!(eval(src), "a");
    let src = "var o = {b:1, a:2, c:3}; var k=''; for (var n in o) k+=n; k";
    assert_eq!(eval(src), "bac");
}

#[test]
fn test_for_loop() {
    assert_eq!(eval("(function(){ var s=''; for(var i=0;i<3;i++) s+=i; return s; })()"), "012");
    assert_eq!(eval("var s=''; for (var i = 9; false; i++) s += i; s"), "");
    assert_eq!(eval("var n=0; for (;;) { n++; if (n > 4) break; } n"), "5");
}

#[test]
fn test_object_destructuring() {
    assert_eq!(eval("var a={x:1,y:2}; var {x,y}=a; x*10+y"), "12");
    assert_eq!(eval("var {a: q, pos: {left}} = {a: 7, pos: {left: 3}}; q + left"), "10");
    assert_eq!(eval("var [p, , r] = [1, 2, 3]; p + r"), "4");
    assert_eq!(eval("function f({x, y}) { return x - y; } f({x: 9, y: 4})"), "5");
}

#[test]
fn test_regex_exec() {
    assert_eq!(eval("var r = /ab+c/i.exec('ZAABBCQ'); r && r[0]"), "ABBC");
    assert_eq!(eval("/\\d+/.test('abc123')"), "true");
    assert_eq!(eval("/\\d+/.test('abc')"), "false");
    assert_eq!(eval("var m = /a(b+)/.exec('xabbby'); m[1] + ':' + m.index"), "bbb:1");
}

#[test]
fn test_json_round_trip() {
    let src = r#"
        var o = { a: 1, b: [1, 2, 3], c: { d: 'x' }, e: null, f: true };
        var s = JSON.stringify(o);
        JSON.stringify(JSON.parse(s)) == s
    "#;
    assert_eq!(eval(src), "true");
    assert_eq!(eval("JSON.stringify([1, 'a', null])"), "[1,\"a\",null]");
    assert_eq!(eval("JSON.parse('{\"k\": [1, 2]}').k[1]"), "2");
}

#[test]
fn test_labeled_break_exits_only_labeled_loop() {
    let src = "
        var s = '';
        outer: for (var i = 0; i < 3; i++) {
            for (var j = 0; j < 3; j++) {
                if (j == 1 && i == 1) break outer;
                s += '' + i + j;
            }
        }
        s + '|done'
    ";
    assert_eq!(eval(src), "000102 10|done".replace(' ', ""));
}

#[test]
fn test_labeled_continue() {
    let src = "
        var s = '';
        outer: for (var i = 0; i < 3; i++) {
            for (var j = 0; j < 3; j++) {
                if (j == 1) continue outer;
                s += '' + i + j;
            }
        }
        s
    ";
    assert_eq!(eval(src), "001020");
}

#[test]
fn test_finally_runs_exactly_once() {
    let src = "
        var n = 0;
        function f() {
            try { return 'r'; } finally { n++; }
        }
        f();
        try { try { throw 'x'; } finally { n++; } } catch (e) { }
        try { } finally { n++; }
        n
    ";
    assert_eq!(eval(src), "3");
}

#[test]
fn test_finally_preserves_pending_signal() {
    assert_eq!(
        eval("function f() { try { return 1; } finally { var x = 2; } } f()"),
        "1"
    );
    assert_eq!(
        eval("function f() { try { return 1; } finally { return 2; } } f()"),
        "2"
    );
    let src = "var r; try { try { throw 'boom'; } finally { } } catch (e) { r = e; } r";
    assert_eq!(eval(src), "boom");
}

#[test]
fn test_switch_fall_through() {
    let src = "
        function pick(x) {
            var s = '';
            switch (x) {
                case 1: s += 'a';
                case 2: s += 'b'; break;
                case 3: s += 'c'; break;
                default: s += 'd';
            }
            return s;
        }
        pick(1) + ' ' + pick(2) + ' ' + pick(3) + ' ' + pick(9)
    ";
    assert_eq!(eval(src), "ab b c d");
}

#[test]
fn test_switch_default_before_cases() {
    let src = "
        function pick(x) {
            var s = '';
            switch (x) {
                default: s += 'd'; break;
                case 1: s += 'a'; break;
            }
            return s;
        }
        pick(1) + pick(5)
    ";
    assert_eq!(eval(src), "ad");
}

#[test]
fn test_while_and_do_while() {
    assert_eq!(eval("var n = 0; while (n < 5) n++; n"), "5");
    assert_eq!(eval("var n = 9; do { n++; } while (false); n"), "10");
    assert_eq!(eval("var s = ''; var i = 0; do { s += i; i++; } while (i < 3); s"), "012");
}

#[test]
fn test_with_scope() {
    assert_eq!(eval("var o = { a: 41 }; with (o) { a++; } o.a"), "42");
    assert_eq!(eval("var a = 1; var o = { a: 2 }; var r; with (o) { r = a; } r"), "2");
}

#[test]
fn test_for_each_in_iterates_values() {
    assert_eq!(eval("var o = {a: 1, b: 2, c: 3}; var n = 0; for each (v in o) n += v; n"), "6");
}

#[test]
fn test_accessors() {
    let src = "
        var backing = 1;
        var o = {
            get x() { return backing; },
            set x(v) { backing = v * 2; }
        };
        o.x = 21;
        o.x
    ";
    assert_eq!(eval(src), "42");
}

#[test]
fn test_eval_in_current_scope() {
    assert_eq!(eval("var a = 1; eval('a = a + 41'); a"), "42");
    assert_eq!(eval("eval('1 + 2')"), "3");
    let src = "var r; try { eval('var ='); } catch (e) { r = e instanceof SyntaxError; } r";
    assert_eq!(eval(src), "true");
}

#[test]
fn test_arguments_object() {
    assert_eq!(eval("function f() { return arguments.length; } f(1, 2, 3)"), "3");
    assert_eq!(eval("function f(a) { arguments[0] = 9; return a; } f(1)"), "1");
    assert_eq!(eval("function f() { return arguments[1]; } f('x', 'y')"), "y");
}

#[test]
fn test_new_and_prototypes() {
    let src = "
        function Point(x, y) { this.x = x; this.y = y; }
        Point.prototype.norm1 = function () { return this.x + this.y; };
        var p = new Point(3, 4);
        p.norm1()
    ";
    assert_eq!(eval(src), "7");
    assert_eq!(
        eval("function C() {} var c = new C(); c instanceof C"),
        "true"
    );
    assert_eq!(
        eval("function C() {} var c = new C(); c.constructor == C"),
        "true"
    );
    assert_eq!(
        eval("function C() { return { replaced: true }; } new C().replaced"),
        "true"
    );
}

#[test]
fn test_proto_access() {
    assert_eq!(eval("var o = {}; o.__proto__ == Object.prototype"), "true");
    let src = "var a = {}; var b = {}; b.__proto__ = a; var r; \
               try { a.__proto__ = b; } catch (e) { r = e instanceof TypeError; } r";
    assert_eq!(eval(src), "true");
}

#[test]
fn test_typeof_and_delete() {
    assert_eq!(eval("typeof neverDeclared"), "undefined");
    assert_eq!(eval("typeof null"), "object");
    assert_eq!(eval("typeof 'x'"), "string");
    assert_eq!(eval("typeof function(){}"), "function");
    assert_eq!(eval("var o = {a: 1}; delete o.a; 'a' in o"), "false");
    assert_eq!(eval("var a = 1; delete a"), "false");
}

#[test]
fn test_reference_errors() {
    let mut engine = Interpreter::new();
    let err = engine.evaluate("missing + 1", "test", 1).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ReferenceError);
    // assignment to an undeclared name creates a global instead
    assert_eq!(eval("implicit = 5; implicit"), "5");
}

#[test]
fn test_uncaught_error_surfaces_with_position() {
    let mut engine = Interpreter::new();
    let err = engine.evaluate("var a = 1;\nnull.x;", "boot.js", 1).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeError);
    assert_eq!(err.file, "boot.js");
    assert_eq!(err.line, 2);
    assert!(err.to_string().starts_with("TypeError:"));
}

#[test]
fn test_parse_int_radix_range() {
    assert_eq!(eval("parseInt('ff', 16)"), "255");
    assert_eq!(eval("parseInt('0x10')"), "16");
    assert_eq!(eval("parseInt('  42abc ')"), "42");
    assert_eq!(eval("parseInt('zz')"), "NaN");
    let src = "var r; try { parseInt('10', 40); } catch (e) { r = e instanceof RangeError; } r";
    assert_eq!(eval(src), "true");
}

#[test]
fn test_recursion_limit() {
    let mut engine = Interpreter::new();
    let err = engine.evaluate("function f() { return f(); } f()", "test", 1).unwrap_err();
    assert_eq!(err.kind, ErrorKind::RangeError);
}

#[test]
fn test_short_circuit() {
    assert_eq!(eval("var n = 0; function bump() { n++; return true; } false && bump(); n"), "0");
    assert_eq!(eval("var n = 0; function bump() { n++; return true; } true || bump(); n"), "0");
    assert_eq!(eval("true ? 'a' : neverDeclared"), "a");
    assert_eq!(eval("1 || 2"), "1");
    assert_eq!(eval("0 || 'fallback'"), "fallback");
    assert_eq!(eval("1 && 2"), "2");
}

#[test]
fn test_let_scoping() {
    assert_eq!(eval("var x = 1; { let x = 2; } x"), "1");
    assert_eq!(eval("let y = 1; { let y = 2; y++; } y"), "1");
}

#[test]
fn test_compound_assignment_and_updates() {
    assert_eq!(eval("var a = 8; a += 2; a *= 3; a -= 5; a /= 5; a"), "5");
    assert_eq!(eval("var a = 5; a++ + a"), "11");
    assert_eq!(eval("var a = 5; ++a + a"), "12");
    assert_eq!(eval("var o = {n: 1}; o.n += 9; o.n"), "10");
}

#[test]
fn test_bitwise_and_shifts() {
    assert_eq!(eval("(5 & 3) + ',' + (5 | 3) + ',' + (5 ^ 3)"), "1,7,6");
    assert_eq!(eval("1 << 4"), "16");
    assert_eq!(eval("-8 >> 1"), "-4");
    assert_eq!(eval("-8 >>> 28"), "15");
    assert_eq!(eval("~5"), "-6");
}

#[test]
fn test_string_methods() {
    assert_eq!(eval("'hello'.charAt(1)"), "e");
    assert_eq!(eval("'hello'.indexOf('ll')"), "2");
    assert_eq!(eval("'hello'.substring(1, 3)"), "el");
    assert_eq!(eval("'hello'.length"), "5");
    assert_eq!(eval("'abc'[1]"), "b");
}

#[test]
fn test_function_call_and_apply() {
    let src = "function f(a, b) { return this.base + a + b; } \
               f.call({base: 100}, 1, 2)";
    assert_eq!(eval(src), "103");
    let src = "function f(a, b) { return this.base + a + b; } \
               f.apply({base: 200}, [3, 4])";
    assert_eq!(eval(src), "207");
}

#[test]
fn test_arrow_and_short_functions() {
    assert_eq!(eval("var f = (a, b) => a + b; f(2, 3)"), "5");
    assert_eq!(eval("var g = x => x * 2; g(21)"), "42");
    assert_eq!(eval("var h = function (x) x + 1; h(41)"), "42");
}

#[test]
fn test_hoisting() {
    assert_eq!(eval("function outer() { return inner(); function inner() { return 7; } } outer()"), "7");
    assert_eq!(eval("typeof hoisted; var hoisted = 1; typeof hoisted"), "number");
}

#[test]
fn test_throw_any_value() {
    assert_eq!(eval("var r; try { throw 42; } catch (e) { r = e + 1; } r"), "43");
    assert_eq!(eval("var r; try { throw {code: 'E'}; } catch (e) { r = e.code; } r"), "E");
}

#[test]
fn test_garbage_collection_of_cycles() {
    let mut engine = Interpreter::new();
    engine
        .execute(
            "var keep = {}; (function () { var a = {}; var b = {}; a.other = b; b.other = a; })();",
            "test",
            1,
        )
        .unwrap();
    let stats = engine.collect_garbage(&[]);
    assert!(stats.collected >= 2, "cycle not collected: {:?}", stats);
    // reachable data survives
    assert_eq!(engine.evaluate("typeof keep", "test", 1).unwrap(), "object");
}

#[test]
fn test_native_registration_on_prototype() {
    let mut engine = Interpreter::new();
    engine
        .add_native("function String.shout(x)", |i, this, _args| {
            let s = i.to_string_value(this);
            Ok(i.new_string(s.to_uppercase()))
        })
        .unwrap();
    assert_eq!(engine.evaluate("'abc'.shout()", "test", 1).unwrap(), "ABC");
}

#[test]
fn test_native_error_is_catchable() {
    let mut engine = Interpreter::new();
    engine
        .add_native("function explode()", |_i, _this, _args| {
            Err(minijs::ScriptError::type_error("boom"))
        })
        .unwrap();
    let src = "var r; try { explode(); } catch (e) { r = e instanceof TypeError && e.message == 'boom'; } r";
    assert_eq!(engine.evaluate(src, "test", 1).unwrap(), "true");
}
