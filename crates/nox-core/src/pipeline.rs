use std::sync::Arc;

use crate::{
    SourceMap,
    compiler::Compiler,
    error::NoxPipelineError,
    memory::{FunctionHandle, HeapAllocator},
};

/// A compiled program: a handle to the top-level script function, ready to
/// be handed to `Vm::interpret`.
#[derive(Debug, Clone, Copy)]
pub struct NoxProgram(FunctionHandle);

impl NoxProgram {
    pub fn new(handle: FunctionHandle) -> Self {
        Self(handle)
    }

    pub fn handle(&self) -> FunctionHandle {
        self.0
    }
}

/// The compile half of `interpret`: source text in, bytecode out. Kept
/// separate from the VM so a REPL can reuse one heap across many compiles.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompilerPipeline;

impl CompilerPipeline {
    pub fn new() -> Self {
        Self
    }

    pub fn compile(
        &self,
        source_map: &Arc<SourceMap>,
        alloc: &mut HeapAllocator,
    ) -> Result<NoxProgram, NoxPipelineError> {
        let compiler = Compiler::new(source_map.clone(), alloc);
        let handle = compiler.compile()?;
        Ok(NoxProgram::new(handle))
    }
}
