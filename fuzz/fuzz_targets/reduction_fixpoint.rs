#![no_main]

use frankenengine_reducer::finder::OpportunityFinder;
use frankenengine_reducer::oracle::Verdict;
use frankenengine_reducer::program_tree::{
    AstDecl, AstExpr, AstStmt, BinaryOp, ProgramAst, ProgramTree,
};
use frankenengine_reducer::reducer::{ReductionConfig, Reducer, Termination};
use libfuzzer_sys::fuzz_target;

const MAX_STATEMENTS: usize = 24;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let ast = build_program(data);
    let tree = ProgramTree::from_ast(&ast);
    let keep_byte = data[0];

    // Interesting while some `discard` survives and, when the first byte is
    // odd, while the global is still declared.
    let mut oracle = |program: &str| {
        let discards = program.contains("\"discard\"");
        let global = keep_byte % 2 == 0 || program.contains("\"g0\"");
        if discards && global {
            Verdict::Interesting
        } else {
            Verdict::NotInteresting
        }
    };

    let mut config = ReductionConfig::with_defaults("fuzz", "glsl-310es");
    config.budget.max_oracle_calls = Some(4_096);
    let reducer = Reducer::new(OpportunityFinder::default(), config);
    let Ok(outcome) = reducer.reduce(tree, &mut oracle) else {
        panic!("reduction failed on a well-formed tree");
    };

    let stats = &outcome.report.stats;
    assert!(stats.final_nodes <= stats.initial_nodes);
    for commit in &outcome.report.commits {
        assert!(commit.nodes_after < commit.nodes_before);
    }
    if outcome.commit_count() == 0 {
        assert_eq!(stats.original_hash, stats.reduced_hash);
    }

    if outcome.termination() == Termination::Fixpoint {
        let Ok(again) = reducer.reduce(outcome.tree.clone(), &mut oracle) else {
            panic!("second reduction failed");
        };
        assert_eq!(again.commit_count(), 0);
    }
});

fn build_program(data: &[u8]) -> ProgramAst {
    let body = data
        .iter()
        .skip(1)
        .take(MAX_STATEMENTS)
        .map(|byte| statement(*byte))
        .collect();
    ProgramAst::new(vec![
        AstDecl::global("float", "g0", Some(AstExpr::float("1.0"))),
        AstDecl::function("void", "main", Vec::new(), body),
    ])
}

fn statement(byte: u8) -> AstStmt {
    let value = AstExpr::binary(
        BinaryOp::Add,
        AstExpr::ident("g0"),
        AstExpr::int(i64::from(byte >> 3)),
    );
    match byte % 6 {
        0 => AstStmt::Discard,
        1 => AstStmt::Empty,
        2 => AstStmt::expr(value),
        3 => AstStmt::if_else(
            AstExpr::binary(BinaryOp::Gt, AstExpr::ident("g0"), AstExpr::float("0.5")),
            AstStmt::block(vec![AstStmt::Discard]),
            None,
        ),
        4 => AstStmt::while_loop(AstExpr::boolean(false), AstStmt::Empty),
        _ => AstStmt::var("float", "t", Some(value)),
    }
}
