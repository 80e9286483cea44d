use std::sync::Arc;

use crate::tests::{expect_runtime_error, run_source};
use crate::{CompilerPipeline, HeapAllocator, NoxProgram, SourceMap, Vm};

fn compile_line(vm: &mut Vm, source: &str) -> NoxProgram {
    let source_map = Arc::new(SourceMap::new(source.to_string()));
    CompilerPipeline::new()
        .compile(&source_map, &mut vm.alloc)
        .expect("compile")
}

#[test]
fn test_arithmetic_precedence() {
    assert_eq!(run_source("print 1 + 2 * 3;"), vec!["7"]);
    assert_eq!(run_source("print (1 + 2) * 3;"), vec!["9"]);
    assert_eq!(run_source("print 10 - 4 / 2;"), vec!["8"]);
    assert_eq!(run_source("print -3 + 5;"), vec!["2"]);
    assert_eq!(run_source("print -(1 + 2);"), vec!["-3"]);
}

#[test]
fn test_division_by_zero_is_ieee() {
    assert_eq!(run_source("print 1 / 0;"), vec!["inf"]);
    assert_eq!(run_source("print -1 / 0;"), vec!["-inf"]);
    assert_eq!(run_source("print 0 / 0 == 0 / 0;"), vec!["false"]);
}

#[test]
fn test_number_formatting() {
    assert_eq!(run_source("print 100;"), vec!["100"]);
    assert_eq!(run_source("print 2.5;"), vec!["2.5"]);
    assert_eq!(run_source("print -0.125;"), vec!["-0.125"]);
}

#[test]
fn test_string_concatenation() {
    assert_eq!(
        run_source("var a = \"foo\"; var b = \"bar\"; print a + b;"),
        vec!["foobar"]
    );
}

#[test]
fn test_comparison_and_equality() {
    assert_eq!(run_source("print 1 < 2;"), vec!["true"]);
    assert_eq!(run_source("print 2 <= 2;"), vec!["true"]);
    assert_eq!(run_source("print 3 > 4;"), vec!["false"]);
    assert_eq!(run_source("print 4 >= 5;"), vec!["false"]);
    assert_eq!(run_source("print 1 == 1;"), vec!["true"]);
    assert_eq!(run_source("print 1 != 1;"), vec!["false"]);
    assert_eq!(run_source("print \"a\" == \"a\";"), vec!["true"]);
    assert_eq!(run_source("print \"a\" == \"b\";"), vec!["false"]);
    assert_eq!(run_source("print nil == false;"), vec!["false"]);
    assert_eq!(run_source("print nil == nil;"), vec!["true"]);
    assert_eq!(run_source("print 1 == \"1\";"), vec!["false"]);
}

#[test]
fn test_truthiness_of_not() {
    assert_eq!(run_source("print !nil;"), vec!["true"]);
    assert_eq!(run_source("print !false;"), vec!["true"]);
    assert_eq!(run_source("print !0;"), vec!["false"]);
    assert_eq!(run_source("print !\"\";"), vec!["false"]);
}

#[test]
fn test_short_circuit_logic_yields_operand() {
    assert_eq!(run_source("print nil or \"yes\";"), vec!["yes"]);
    assert_eq!(run_source("print false or false;"), vec!["false"]);
    assert_eq!(run_source("print nil and \"no\";"), vec!["nil"]);
    assert_eq!(run_source("print 1 and 2;"), vec!["2"]);
}

#[test]
fn test_short_circuit_skips_side_effects() {
    let source = r#"
        var called = false;
        fun effect() { called = true; return true; }
        false and effect();
        print called;
        true or effect();
        print called;
    "#;
    assert_eq!(run_source(source), vec!["false", "false"]);
}

#[test]
fn test_global_scoping_and_shadowing() {
    let source = r#"
        var a = "global";
        {
            var a = "local";
            print a;
        }
        print a;
    "#;
    assert_eq!(run_source(source), vec!["local", "global"]);
}

#[test]
fn test_global_redefinition_permits_self_reference() {
    assert_eq!(run_source("var a; var a = a; print a;"), vec!["nil"]);
}

#[test]
fn test_while_loop() {
    let source = r#"
        var i = 0;
        var s = 0;
        while (i < 5) { s = s + i; i = i + 1; }
        print s;
    "#;
    assert_eq!(run_source(source), vec!["10"]);
}

#[test]
fn test_for_loop() {
    let source = r#"
        var s = 0;
        for (var i = 0; i < 5; i = i + 1) { s = s + i; }
        print s;
    "#;
    assert_eq!(run_source(source), vec!["10"]);
}

#[test]
fn test_for_loop_with_condition_only() {
    let source = r#"
        var i = 0;
        for (; i < 3;) { i = i + 1; }
        print i;
    "#;
    assert_eq!(run_source(source), vec!["3"]);
}

#[test]
fn test_for_loop_increment_runs_after_each_iteration() {
    let source = r#"
        var log = "";
        for (var i = 1; i < 3; i = i + 1) { log = log + "b"; }
        print log;
    "#;
    assert_eq!(run_source(source), vec!["bb"]);
}

#[test]
fn test_if_else_branches() {
    assert_eq!(
        run_source("if (1 < 2) { print \"then\"; } else { print \"else\"; }"),
        vec!["then"]
    );
    assert_eq!(
        run_source("if (1 > 2) { print \"then\"; } else { print \"else\"; }"),
        vec!["else"]
    );
    assert_eq!(run_source("if (false) { print \"skipped\"; } print \"after\";"), vec!["after"]);
}

#[test]
fn test_functions_and_recursion() {
    let source = r#"
        fun fib(n) {
            if (n < 2) { return n; }
            return fib(n - 1) + fib(n - 2);
        }
        print fib(10);
    "#;
    assert_eq!(run_source(source), vec!["55"]);
}

#[test]
fn test_function_without_return_yields_nil() {
    assert_eq!(run_source("fun f() {} print f();"), vec!["nil"]);
}

#[test]
fn test_print_forms() {
    assert_eq!(run_source("print clock;"), vec!["<native fn>"]);
    assert_eq!(run_source("fun f() {} print f;"), vec!["<fn f>"]);
    assert_eq!(run_source("class A {} print A;"), vec!["A"]);
    assert_eq!(run_source("class A {} print A();"), vec!["A instance"]);
    assert_eq!(
        run_source("class A { m() {} } print A().m;"),
        vec!["<fn m>"]
    );
    assert_eq!(run_source("print nil; print true; print false;"), vec!["nil", "true", "false"]);
}

#[test]
fn test_clock_native() {
    assert_eq!(run_source("print clock() >= 0;"), vec!["true"]);
    assert_eq!(
        run_source("var before = clock(); var after = clock(); print after >= before;"),
        vec!["true"]
    );
}

#[test]
fn test_undefined_variable_error() {
    let error = expect_runtime_error("print a;");
    assert!(error.message.contains("Undefined variable 'a'."));
}

#[test]
fn test_assignment_to_undefined_global_leaves_globals_unchanged() {
    let allocator = HeapAllocator::new();
    let mut vm = Vm::new(allocator).capture_prints();

    let program = compile_line(&mut vm, "b = 2;");
    let error = vm.interpret(program).expect_err("expected runtime error");
    assert!(error.message.contains("Undefined variable 'b'."));

    // The failed assignment must not have defined `b` as a side effect.
    let program = compile_line(&mut vm, "print b;");
    let error = vm.interpret(program).expect_err("expected runtime error");
    assert!(error.message.contains("Undefined variable 'b'."));
}

#[test]
fn test_globals_persist_across_interprets() {
    let allocator = HeapAllocator::new();
    let mut vm = Vm::new(allocator).capture_prints();

    let program = compile_line(&mut vm, "var counter = 41;");
    vm.interpret(program).expect("first line");

    let program = compile_line(&mut vm, "counter = counter + 1; print counter;");
    vm.interpret(program).expect("second line");

    assert_eq!(vm.take_prints(), vec!["42"]);
}

#[test]
fn test_runtime_error_does_not_poison_the_vm() {
    let allocator = HeapAllocator::new();
    let mut vm = Vm::new(allocator).capture_prints();

    let program = compile_line(&mut vm, "print missing;");
    assert!(vm.interpret(program).is_err());

    let program = compile_line(&mut vm, "print \"still alive\";");
    vm.interpret(program).expect("vm recovered");
    assert_eq!(vm.take_prints(), vec!["still alive"]);
}

#[test]
fn test_operand_type_errors() {
    let error = expect_runtime_error("print -\"hello\";");
    assert!(error.message.contains("Operand must be a number."));

    let error = expect_runtime_error("print 1 + \"one\";");
    assert!(
        error
            .message
            .contains("Operands must be two numbers or two strings.")
    );

    let error = expect_runtime_error("print 1 < \"two\";");
    assert!(error.message.contains("Operands must be numbers."));

    let error = expect_runtime_error("var a; a = a + 1;");
    assert!(
        error
            .message
            .contains("Operands must be two numbers or two strings.")
    );
}

#[test]
fn test_calling_a_non_callable() {
    let error = expect_runtime_error("var x = 1; x();");
    assert!(error.message.contains("Can only call functions and classes."));

    let error = expect_runtime_error("\"text\"();");
    assert!(error.message.contains("Can only call functions and classes."));
}

#[test]
fn test_arity_mismatch() {
    let error = expect_runtime_error("fun f(a) {} f();");
    assert!(error.message.contains("Expected 1 arguments but got 0."));

    let error = expect_runtime_error("fun g() {} g(1, 2);");
    assert!(error.message.contains("Expected 0 arguments but got 2."));
}

#[test]
fn test_deep_recursion_overflows_frames() {
    let error = expect_runtime_error("fun f() { f(); } f();");
    assert!(error.message.contains("Stack overflow."));
}

#[test]
fn test_stack_trace_newest_frame_first() {
    let source = "fun a() {\n  b();\n}\nfun b() {\n  print c;\n}\na();";
    let error = expect_runtime_error(source);

    assert!(error.message.contains("Undefined variable 'c'."));
    let rendered = error.to_string();

    let b_at = rendered.find("[line 5] in b()").expect("b frame");
    let a_at = rendered.find("[line 2] in a()").expect("a frame");
    let script_at = rendered.find("[line 7] in script").expect("script frame");
    assert!(b_at < a_at && a_at < script_at);
}
