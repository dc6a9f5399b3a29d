//! Whole-pipeline tests: program in, encoded module and protocol table out.

use tarnc::config::CompileOptions;
use tarnc::effects::EffectRow;
use tarnc::hir::{op, tail_op, BodyBuilder, Program, ProgramBuilder, Type};
use tarnc::protocol::{PayloadKind, ProtocolTable, PROTOCOL_SECTION};
use tarnc::target;

/// `main() { let a = await(1); log(a); a }`
fn program() -> Program {
    let mut pb = ProgramBuilder::new("app");
    let async_fx = pb.effect("Async", vec![op("await", vec![Type::I32], Type::I32)]);
    let log = pb.effect("Log", vec![tail_op("log", vec![Type::I32], Type::Unit)]);
    let main = pb.fresh_def();
    let b = BodyBuilder::new();
    let a = b.constant("a", Type::I32);
    let body = b.block(
        vec![
            b.let_(a, b.perform(async_fx, 0, Type::I32, vec![b.int(1)])),
            b.stmt(b.perform(log, 0, Type::Unit, vec![b.var(a)])),
        ],
        Some(b.var(a)),
    );
    pb.function(b.finish(main, "main", Type::I32, body).exported("main"));
    pb.finish()
}

#[test]
fn test_encoded_module_carries_protocol() {
    let compiled = tarnc::compile_program(&program(), &CompileOptions::default()).unwrap();
    let module = target::decode(&compiled.to_bytes()).unwrap();
    assert_eq!(module, compiled.module);

    let section = module.custom_section(PROTOCOL_SECTION).expect("protocol section");
    let protocol = ProtocolTable::from_json(section).unwrap();
    assert_eq!(protocol, compiled.protocol);

    let labels: Vec<_> = protocol.ops.iter().map(|op| op.display_label()).collect();
    assert_eq!(labels, vec!["Async.await", "Log.log"]);
    assert_eq!(protocol.ops[1].resume_kind.as_str(), "tail");
    assert_eq!(protocol.ops[0].params, vec![PayloadKind::I32]);

    let main = protocol.export("main").unwrap();
    assert!(main.effectful);
    assert_eq!(main.result, PayloadKind::I32);
}

#[test]
fn test_protocol_embedding_can_be_disabled() {
    let options = CompileOptions {
        embed_protocol: false,
        ..CompileOptions::default()
    };
    let compiled = tarnc::compile_program(&program(), &options).unwrap();
    assert!(compiled.module.custom_section(PROTOCOL_SECTION).is_none());
    assert_eq!(compiled.protocol.ops.len(), 2);
}

#[test]
fn test_compilation_is_deterministic() {
    let a = tarnc::compile_program(&program(), &CompileOptions::default()).unwrap();
    let b = tarnc::compile_program(&program(), &CompileOptions::default()).unwrap();
    assert_eq!(a.to_bytes(), b.to_bytes());
}

#[test]
fn test_undeclared_effect_stops_compilation() {
    let mut pb = ProgramBuilder::new("app");
    let log = pb.effect("Log", vec![op("log", vec![], Type::Unit)]);
    let main = pb.fresh_def();
    let b = BodyBuilder::new();
    let body = b.perform(log, 0, Type::Unit, vec![]);
    pb.function(
        b.finish(main, "main", Type::Unit, body)
            .exported("main")
            .with_effects(EffectRow::empty()),
    );

    let errors = tarnc::compile_program(&pb.finish(), &CompileOptions::default()).unwrap_err();
    assert!(errors.iter().any(|d| d.code.as_deref() == Some("E0400")));
}

#[test]
fn test_generic_export_is_rejected() {
    let mut pb = ProgramBuilder::new("app");
    let id = pb.fresh_def();
    let b = BodyBuilder::new();
    let x = b.param("x", Type::Param(0));
    let body = b.var(x);
    pb.function(b.finish(id, "id", Type::Param(0), body).with_generics(1).exported("id"));

    let errors = tarnc::compile_program(&pb.finish(), &CompileOptions::default()).unwrap_err();
    assert!(errors.iter().any(|d| d.code.as_deref() == Some("E0406")));
}
