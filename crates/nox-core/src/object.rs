use crate::{
    Value, Vm,
    chunk::Chunk,
    error::NativeFunctionError,
    memory::{ClassHandle, ClosureHandle, FunctionHandle, StringHandle, Table, UpvalueHandle},
};

/// A compiled function body. Created by the compiler, sealed once the body
/// has been emitted, and never mutated afterwards. A `name` of `None` marks
/// the implicit top-level script function.
#[derive(Debug, Clone, Default)]
pub struct FunctionObject {
    pub arity: usize,
    pub name: Option<StringHandle>,
    pub chunk: Chunk,
    pub upvalue_count: usize,
    pub is_marked: bool,
}

impl FunctionObject {
    pub fn new(name: Option<StringHandle>) -> Self {
        Self {
            arity: 0,
            name,
            chunk: Chunk::new(),
            upvalue_count: 0,
            is_marked: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClosureObject {
    pub function: FunctionHandle,
    pub upvalues: Vec<UpvalueHandle>,
    pub is_marked: bool,
}

impl ClosureObject {
    pub fn new(function: FunctionHandle, upvalue_count: usize) -> Self {
        Self {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
            is_marked: false,
        }
    }
}

/// A captured variable. Open while the variable still lives in its stack
/// slot; closed once the owning frame unwinds and the value moves into the
/// upvalue itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Debug, Clone)]
pub struct UpvalueObject {
    pub state: UpvalueState,
    pub is_marked: bool,
}

impl UpvalueObject {
    pub fn open(stack_slot: usize) -> Self {
        Self {
            state: UpvalueState::Open(stack_slot),
            is_marked: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClassObject {
    pub name: StringHandle,
    pub methods: Table,
    pub is_marked: bool,
}

impl ClassObject {
    pub fn new(name: StringHandle) -> Self {
        Self {
            name,
            methods: Table::new(),
            is_marked: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstanceObject {
    pub class: ClassHandle,
    pub fields: Table,
    pub is_marked: bool,
}

impl InstanceObject {
    pub fn new(class: ClassHandle) -> Self {
        Self {
            class,
            fields: Table::new(),
            is_marked: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BoundMethodObject {
    pub receiver: Value,
    pub method: ClosureHandle,
    pub is_marked: bool,
}

impl BoundMethodObject {
    pub fn new(receiver: Value, method: ClosureHandle) -> Self {
        Self {
            receiver,
            method,
            is_marked: false,
        }
    }
}

pub type NativeFn = fn(arg_count: usize, vm: &mut Vm) -> Result<Option<Value>, NativeFunctionError>;

#[derive(Debug, Clone)]
pub struct NativeFunctionObject {
    pub function: NativeFn,
    pub arity: usize,
    pub name: StringHandle,
}
