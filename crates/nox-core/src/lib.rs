pub mod chunk;
pub mod compiler;
mod debug;
mod error;
pub mod memory;
mod nox_std;
mod object;
mod pipeline;
mod source;
mod tokenizer;
mod value;
mod vm;

pub use chunk::{Chunk, OpCode, SourceLocation};
pub use compiler::Compiler;
pub use debug::{
    disassemble_chunk, disassemble_chunk_to_string, disassemble_instruction, disassemble_program,
};
pub use error::{
    ErrorReporter, NativeFunctionError, NoxCompilerError, NoxPipelineError, NoxRuntimeError, Trace,
};
pub use memory::{HeapAllocator, StringInterner, Table};
pub use object::{
    BoundMethodObject, ClassObject, ClosureObject, FunctionObject, InstanceObject, NativeFn,
    NativeFunctionObject, UpvalueObject, UpvalueState,
};
pub use pipeline::{CompilerPipeline, NoxProgram};
pub use source::SourceMap;
pub use tokenizer::{Token, TokenType, Tokenizer};
pub use value::{Value, ValueKind};
pub use vm::{BinaryOperationError, RuntimeResult, Vm};

#[cfg(test)]
pub mod tests;
