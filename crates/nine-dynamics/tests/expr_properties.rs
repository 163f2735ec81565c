use nine_dynamics::{BinOp, Expr, Piece};
use proptest::prelude::*;
use proptest::sample::select;

const SYMBOLS: &[&str] = &["v", "tau", "g_L", "E_rev", "w"];
const OPS: &[BinOp] = &[
    BinOp::Add,
    BinOp::Sub,
    BinOp::Mul,
    BinOp::Div,
    BinOp::Pow,
    BinOp::Lt,
    BinOp::Ge,
    BinOp::Eq,
    BinOp::And,
    BinOp::Or,
];

fn leaf() -> impl Strategy<Value = Expr> {
    prop_oneof![
        (0u32..10_000).prop_map(|n| Expr::num(n as f64 / 8.0)),
        select(SYMBOLS).prop_map(Expr::sym),
    ]
}

fn expr() -> impl Strategy<Value = Expr> {
    leaf().prop_recursive(4, 48, 3, |inner| {
        prop_oneof![
            inner.clone().prop_map(Expr::neg),
            inner.clone().prop_map(Expr::not),
            (select(OPS), inner.clone(), inner.clone()).prop_map(|(op, a, b)| Expr::binary(op, a, b)),
            (select(&["exp", "abs", "sqrt"][..]), inner.clone())
                .prop_map(|(f, a)| Expr::call(f, vec![a])),
            (inner.clone(), inner.clone(), inner).prop_map(|(cond, a, b)| Expr::Piecewise(vec![
                Piece::When { cond, value: a },
                Piece::Otherwise { value: b },
            ])),
        ]
    })
}

fn env(name: &str) -> Option<f64> {
    match name {
        "v" => Some(-65.0),
        "tau" => Some(20.0),
        "g_L" => Some(0.3),
        "E_rev" => Some(-70.0),
        "w" => Some(1.5),
        _ => None,
    }
}

/// Largest finite magnitude of any subexpression; bounds rounding differences
fn magnitude(e: &Expr) -> f64 {
    let mut largest = 1.0f64;
    e.visit(&mut |sub| {
        if let Ok(x) = sub.eval(&env) {
            if x.is_finite() {
                largest = largest.max(x.abs());
            }
        }
    });
    largest
}

proptest! {
    #[test]
    fn printed_expressions_reparse_identically(e in expr()) {
        let text = e.to_string();
        let back = Expr::parse(&text).expect("printed expression must parse");
        prop_assert_eq!(back, e, "{}", text);
    }

    #[test]
    fn simplification_preserves_value(e in expr()) {
        let original = e.eval(&env);
        prop_assume!(matches!(original, Ok(x) if x.is_finite()));
        let before = original.unwrap();
        let after = e.simplify().eval(&env).expect("simplified expression must evaluate");
        let tolerance = 1e-9 * magnitude(&e);
        prop_assert!((before - after).abs() <= tolerance, "{} -> {}: {} vs {}", e, e.simplify(), before, after);
    }

    #[test]
    fn simplification_never_adds_symbols(e in expr()) {
        prop_assert!(e.simplify().symbols().is_subset(&e.symbols()));
    }
}
