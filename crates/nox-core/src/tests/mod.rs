use std::sync::Arc;

use crate::{
    CompilerPipeline, HeapAllocator, NoxPipelineError, NoxRuntimeError, SourceMap, Vm,
};

pub mod vm_class_tests;
pub mod vm_closure_tests;
pub mod vm_tests;

fn interpret_with(source: &str, configure: impl FnOnce(Vm) -> Vm) -> Result<Vec<String>, NoxRuntimeError> {
    let source_map = Arc::new(SourceMap::new(source.to_string()));
    let mut allocator = HeapAllocator::new();

    let program = match CompilerPipeline::new().compile(&source_map, &mut allocator) {
        Ok(program) => program,
        Err(errors) => {
            for error in errors.all() {
                eprintln!("{}", error);
            }
            panic!("Unexpected compile errors.");
        }
    };

    let mut vm = configure(Vm::new(allocator).capture_prints());
    vm.interpret(program)?;

    // Between runs the machine must be at rest: nothing left on the value
    // stack and no live frames.
    assert_eq!(vm.state.stack_top, 0, "value stack not empty after run");
    assert_eq!(vm.state.frame_count, 0, "frames remain after run");

    Ok(vm.take_prints())
}

pub fn interpret_source(source: &str) -> Result<Vec<String>, NoxRuntimeError> {
    interpret_with(source, |vm| vm)
}

/// Compiles and runs `source`, panicking on any error, and returns the
/// captured `print` output, one entry per statement.
pub fn run_source(source: &str) -> Vec<String> {
    match interpret_source(source) {
        Ok(prints) => prints,
        Err(error) => panic!("{}", error),
    }
}

/// Same as `run_source` but with a collection at every allocation
/// checkpoint, to shake out rooting mistakes.
pub fn run_source_stressed(source: &str) -> Vec<String> {
    match interpret_with(source, |vm| vm.set_gc_stress(true)) {
        Ok(prints) => prints,
        Err(error) => panic!("{}", error),
    }
}

pub fn expect_runtime_error(source: &str) -> NoxRuntimeError {
    match interpret_source(source) {
        Ok(prints) => panic!("Expected runtime error, got output: {:?}", prints),
        Err(error) => error,
    }
}

pub fn compile_errors(source: &str) -> NoxPipelineError {
    let source_map = Arc::new(SourceMap::new(source.to_string()));
    let mut allocator = HeapAllocator::new();

    match CompilerPipeline::new().compile(&source_map, &mut allocator) {
        Ok(_) => panic!("Expected compile errors but compilation succeeded."),
        Err(errors) => errors,
    }
}

pub fn assert_compile_error(source: &str, expected_message: &str) {
    let errors = compile_errors(source);
    let error_text = errors
        .all()
        .iter()
        .map(|e| e.message.clone())
        .collect::<Vec<String>>()
        .join("\n");

    assert!(
        error_text.contains(expected_message),
        "Expected error message '{}' but got: {}",
        expected_message,
        error_text
    );
}
