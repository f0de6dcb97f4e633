//! Property tests: tokenizer reconstruction is stable after one round,
//! and finite doubles survive the string round trip.

use minijs::token::parsable_string;
use minijs::tokenizer::tokenize;
use minijs::Interpreter;
use proptest::prelude::*;

/// Strategy for small well-formed statements (identifiers and literals
/// only — the goal is coverage of token shapes, not of the grammar).
fn arb_statement() -> impl Strategy<Value = String> {
    // `q` prefix keeps generated names clear of every keyword
    let ident = "q[a-z]{0,5}";
    let number = prop_oneof![
        (0u32..100000).prop_map(|n| n.to_string()),
        (0.001f64..1000.0).prop_map(|f| format!("{}", f)),
    ];
    (ident, number, "[a-zA-Z ]{0,10}").prop_flat_map(|(name, num, text)| {
        prop_oneof![
            Just(format!("var {} = {};", name, num)),
            Just(format!("{} = {} + 1;", name, num)),
            Just(format!("if ({} > 1) {{ {} = 0; }} else {{ {} = '{}'; }}", num, name, name, text)),
            Just(format!("for (var i = 0; i < {}; i++) {{ {} = i; }}", num, name)),
            Just(format!("function {}(a, b) {{ return a + b; }}", name)),
            Just(format!("{} = {{ k: {}, s: '{}' }};", name, num, text)),
            Just(format!("{} = [{}, , '{}'];", name, num, text)),
            Just(format!("while ({} < 0) {{ break; }}", num)),
        ]
    })
}

proptest! {
    #[test]
    fn prop_tokenizer_round_trip_stable(statements in proptest::collection::vec(arb_statement(), 1..5)) {
        let source = statements.join(" ");
        let tokens = tokenize(&source, "prop", 1).expect("generated source tokenizes");
        let once = parsable_string(&tokens);
        let tokens2 = tokenize(&once, "prop", 1).expect("reconstruction tokenizes");
        let twice = parsable_string(&tokens2);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_number_string_round_trip(x in proptest::num::f64::NORMAL) {
        let mut engine = Interpreter::new();
        let v = engine.new_number(x);
        let s = v.borrow().to_string_prim();
        let back: f64 = s.parse().expect("number strings parse");
        prop_assert_eq!(back, x);
    }

    #[test]
    fn prop_evaluate_arithmetic_matches(a in -1000i64..1000, b in 1i64..1000) {
        let mut engine = Interpreter::new();
        let sum = engine.evaluate(&format!("{} + {}", a, b), "prop", 1).unwrap();
        prop_assert_eq!(sum, (a + b).to_string());
        let rem = engine.evaluate(&format!("{} % {}", a, b), "prop", 1).unwrap();
        prop_assert_eq!(rem, (a % b).to_string());
    }
}
