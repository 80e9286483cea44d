mod arena;
mod heap;
mod string_interner;
mod table;

pub use arena::Arena;
pub use heap::{
    BoundMethodHandle, ClassHandle, ClosureHandle, FunctionHandle, HeapAllocator, InstanceHandle,
    NativeFunctionHandle, UpvalueHandle,
};
pub use string_interner::{StringHandle, StringInterner};
pub use table::Table;
