//! Code generation context tests.
//!
//! These drive [`CodegenContext`] directly, without going through
//! `compile_program`, to observe its caches and the module it builds.

use super::*;
use crate::effects::{analyze_program, EffectRef};
use crate::hir::{op, BodyBuilder, ProgramBuilder};

struct Analyzed {
    program: Program,
    table: EffectTable,
    effects: EffectsIr,
    options: CompileOptions,
}

impl Analyzed {
    fn new(program: Program) -> Self {
        let table = EffectTable::build(&program);
        let effects = analyze_program(&program, &table).expect("analysis succeeds");
        Self {
            program,
            table,
            effects,
            options: CompileOptions::default(),
        }
    }

    fn context(&self) -> CodegenContext<'_> {
        CodegenContext::new(&self.program, &self.table, &self.effects, &self.options)
    }
}

/// `effect Put<T> { put(T) -> T }` and `relay<T>(x: T) -> T { put(x) }`.
fn generic_put_program() -> (Program, DefId, DefId) {
    let mut pb = ProgramBuilder::new("app");
    let put = pb.effect_with("Put", None, 1, vec![op("put", vec![Type::Param(0)], Type::Param(0))]);
    let relay = pb.fresh_def();
    let b = BodyBuilder::new();
    let x = b.param("x", Type::Param(0));
    let body = b.perform_generic(put, vec![Type::Param(0)], 0, Type::Param(0), vec![b.var(x)]);
    pb.function(b.finish(relay, "relay", Type::Param(0), body).with_generics(1));
    (pb.finish(), put, relay)
}

fn simple_program(effect_name: &str, explicit_id: Option<&str>) -> Program {
    let mut pb = ProgramBuilder::new("app");
    let log = pb.effect_with(effect_name, explicit_id, 0, vec![op("write", vec![Type::I32], Type::Unit)]);
    let main = pb.fresh_def();
    let b = BodyBuilder::new();
    let body = b.perform(log, 0, Type::Unit, vec![b.int(1)]);
    pb.function(b.finish(main, "main", Type::Unit, body).exported("main"));
    pb.finish()
}

#[test]
fn test_support_function_is_memoized() {
    let analyzed = Analyzed::new(simple_program("Log", None));
    let mut cx = analyzed.context();
    let first = cx.support(SupportSymbol::EffectStatus);
    let second = cx.support(SupportSymbol::EffectStatus);
    assert_eq!(first, second);

    let (module, _) = cx.finish().unwrap();
    let exported = module
        .exports
        .iter()
        .filter(|e| e.name == "effect_status")
        .count();
    assert_eq!(exported, 1);
    assert_eq!(module.export("effect_status"), Some(first));
}

#[test]
fn test_shared_exports_present() {
    let analyzed = Analyzed::new(simple_program("Log", None));
    let mut cx = analyzed.context();
    cx.compile_exports().unwrap();
    let (module, protocol) = cx.finish().unwrap();
    for name in [
        "effect_status",
        "effect_cont",
        "effect_len",
        "init_effects",
        "read_value",
        "effect_resume",
        "main",
    ] {
        assert!(module.export(name).is_some(), "missing export {}", name);
    }
    assert!(module.function_named("main$export").is_some());
    assert_eq!(protocol.export("main").map(|e| e.effectful), Some(true));
    assert!(module.custom_section(PROTOCOL_SECTION).is_some());
}

#[test]
fn test_generic_effect_instances_are_distinct() {
    let (program, put, _) = generic_put_program();
    let analyzed = Analyzed::new(program);
    let mut cx = analyzed.context();

    let put_i32 = EffectRef::new(put, vec![Type::I32]);
    let put_u32 = EffectRef::new(put, vec![Type::U32]);
    let a = cx.effect_instance(&put_i32).unwrap();
    let b = cx.effect_instance(&put_u32).unwrap();
    assert_ne!(a, b);
    assert_eq!(cx.effect_instance(&put_i32).unwrap(), a);

    let ops: Vec<_> = cx.op_instances().map(|(_, op)| (op.op_index, op.label.clone(), op.hash)).collect();
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].1, "Put<i32>.put");
    assert_eq!(ops[1].1, "Put<u32>.put");
    assert_ne!(ops[0].0, ops[1].0);
    assert_ne!(ops[0].2, ops[1].2);

    let (module, _) = cx.finish().unwrap();
    let i32_args = module.type_named("Put<i32>.put$args");
    let u32_args = module.type_named("Put<u32>.put$args");
    assert!(i32_args.is_some());
    assert!(u32_args.is_some());
    assert_ne!(i32_args, u32_args);
}

#[test]
fn test_generic_function_instances_are_memoized_per_type_list() {
    let (program, _, relay) = generic_put_program();
    let analyzed = Analyzed::new(program);
    let mut cx = analyzed.context();

    let a = cx.instance(relay, vec![Type::I32]);
    let b = cx.instance(relay, vec![Type::U32]);
    assert_ne!(a, b);
    assert_eq!(cx.instance(relay, vec![Type::I32]), a);

    let (module, _) = cx.finish().unwrap();
    assert_eq!(module.function_named("relay<i32>"), Some(a));
    assert_eq!(module.function_named("relay<u32>"), Some(b));
}

#[test]
fn test_explicit_effect_id_survives_rename() {
    let compile = |name: &str| {
        let analyzed = Analyzed::new(simple_program(name, Some("com.example.log")));
        let mut cx = analyzed.context();
        cx.compile_exports().unwrap();
        cx.finish().unwrap().1
    };
    let before = compile("Log");
    let after = compile("Journal");

    assert_eq!(before.ops[0].effect_id.as_str(), "com.example.log");
    assert_eq!(before.ops[0].effect_id, after.ops[0].effect_id);
    assert_eq!(before.ops[0].signature_hash, after.ops[0].signature_hash);
    assert_eq!(before.ops[0].op_id, after.ops[0].op_id);
    assert_eq!(after.ops[0].display_label(), "Journal.write");
}

#[test]
fn test_derived_effect_id_uses_declaration_order() {
    let analyzed = Analyzed::new(simple_program("Log", None));
    let mut cx = analyzed.context();
    cx.compile_exports().unwrap();
    let (_, protocol) = cx.finish().unwrap();
    assert_eq!(protocol.ops[0].effect_id.as_str(), "app#0");
}

#[test]
fn test_struct_argument_without_serializer_is_rejected() {
    let mut pb = ProgramBuilder::new("app");
    let point = pb.structure("Point", 0, vec![("x", Type::I32)]);
    let point_ty = Type::structure(point, vec![]);
    let draw = pb.effect("Draw", vec![op("draw", vec![point_ty], Type::Unit)]);
    let main = pb.fresh_def();
    let b = BodyBuilder::new();
    let body = b.perform(draw, 0, Type::Unit, vec![b.struct_lit(point, vec![], vec![b.int(3)])]);
    pb.function(b.finish(main, "main", Type::Unit, body).exported("main"));

    let analyzed = Analyzed::new(pb.finish());
    let mut cx = analyzed.context();
    let errors = cx.compile_exports().unwrap_err();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("unsupported type `Point`"));
    assert_eq!(errors[0].code.as_deref(), Some("CG0001"));
}

#[test]
fn test_in_module_handler_keeps_op_off_the_host() {
    let mut pb = ProgramBuilder::new("app");
    let ask = pb.effect("Ask", vec![op("ask", vec![], Type::I32)]);
    let main = pb.fresh_def();
    let b = BodyBuilder::new();
    let k = b.constant("k", Type::cont(Type::I32, Type::I32));
    let body = b.handle(
        b.perform(ask, 0, Type::I32, vec![]),
        ask,
        vec![],
        vec![b.clause(0, vec![], k, b.resume(k, b.int(5)))],
    );
    pb.function(b.finish(main, "main", Type::I32, body).exported("main"));

    let analyzed = Analyzed::new(pb.finish());
    let mut cx = analyzed.context();
    cx.compile_exports().unwrap();
    cx.instance(main, Vec::new());
    assert!(cx.op_instances().all(|(_, op)| !op.host));
    let (_, protocol) = cx.finish().unwrap();
    assert_eq!(protocol.export("main").map(|e| e.effectful), Some(false));
}

#[test]
fn test_shared_local_and_early_return_support() {
    // let total = 0; handle { total = total + ask(); return total } with ask(k) => resume k(5); 0
    let mut pb = ProgramBuilder::new("app");
    let ask = pb.effect("Ask", vec![op("ask", vec![], Type::I32)]);
    let main = pb.fresh_def();
    let b = BodyBuilder::new();
    let total = b.local("total", Type::I32);
    let k = b.constant("k", Type::cont(Type::I32, Type::Unit));
    let handled = b.block(
        vec![b.stmt(b.assign(total, b.add(b.var(total), b.perform(ask, 0, Type::I32, vec![]))))],
        Some(b.ret(b.var(total))),
    );
    let body = b.block(
        vec![
            b.let_(total, b.int(0)),
            b.stmt(b.handle(handled, ask, vec![], vec![b.clause(0, vec![], k, b.resume(k, b.int(5)))])),
        ],
        Some(b.int(0)),
    );
    pb.function(b.finish(main, "main", Type::I32, body).exported("main"));

    let analyzed = Analyzed::new(pb.finish());
    let mut cx = analyzed.context();
    cx.compile_exports().unwrap();
    let (module, _) = cx.finish().unwrap();
    assert!(module.type_named("$Cell<I32>").is_some());
    assert!(module.function_named("$make_returned").is_some());
    assert!(module.function_named("$owns_return").is_some());
}
