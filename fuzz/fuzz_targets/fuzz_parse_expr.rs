#![no_main]

use dq_expr::{EvalContext, evaluate, parse_expr};
use dq_runtime::RuntimePolicy;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(source) = std::str::from_utf8(data) else {
        return;
    };
    let policy = RuntimePolicy::strict();
    if let Ok(expr) = parse_expr(source, &policy) {
        let mut ctx = EvalContext::new();
        ctx.insert("a", 3.0);
        ctx.insert("b", 0.0);
        // Unknown fields are errors and division by zero is IEEE; neither panics.
        let _ = evaluate(&expr, &ctx);
    }
});
