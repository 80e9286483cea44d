use std::collections::VecDeque;
use std::time::Instant;

#[cfg(debug_assertions)]
use crate::debug::disassemble_instruction;
use crate::{
    NoxProgram, Value, ValueKind,
    chunk::{OpCode, SourceLocation},
    compiler::{FRAME_MAX, STACK_MAX},
    error::{NativeFunctionError, NoxRuntimeError, Trace},
    memory::{
        ClassHandle, ClosureHandle, HeapAllocator, NativeFunctionHandle, StringHandle, Table,
        UpvalueHandle,
    },
    nox_std::nox_clock,
    object::{
        BoundMethodObject, ClassObject, ClosureObject, FunctionObject, InstanceObject, NativeFn,
        NativeFunctionObject, UpvalueObject, UpvalueState,
    },
};

#[derive(Debug, Clone)]
pub struct BinaryOperationError(pub String);

impl BinaryOperationError {
    pub fn new(message: &str) -> Self {
        Self(message.to_string())
    }

    fn into_runtime_error(self, loc: SourceLocation) -> NoxRuntimeError {
        NoxRuntimeError::new(self.0, loc.line)
    }
}

impl From<&'_ str> for BinaryOperationError {
    fn from(value: &'_ str) -> Self {
        BinaryOperationError::new(value)
    }
}

pub type RuntimeResult<T> = Result<T, NoxRuntimeError>;

#[macro_export]
macro_rules! push_value {
    ($vm:expr, $value:expr) => {
        if $vm.state.stack_top >= $crate::compiler::STACK_MAX {
            Err($crate::NoxRuntimeError::new(
                format!(
                    "Stack overflow: maximum stack size of {} exceeded.",
                    $crate::compiler::STACK_MAX
                ),
                $vm.state.get_current_loc().line,
            ))
        } else {
            $vm.state.stack[$vm.state.stack_top] = $value;
            $vm.state.stack_top += 1;
            Ok(())
        }
    };
}

#[macro_export]
macro_rules! pop_value {
    ($vm:expr) => {{
        debug_assert!(
            $vm.state.stack_top > 0,
            "Stack underflow: unexpected empty stack."
        );
        $vm.state.stack_top -= 1;
        $vm.state.stack[$vm.state.stack_top]
    }};
}

#[macro_export]
macro_rules! peek_value {
    ($vm:expr, $distance:expr) => {
        if $vm.state.stack_top > $distance {
            $vm.state
                .stack
                .get($vm.state.stack_top - 1 - $distance)
                .copied()
                .unwrap_or($crate::Value::nil())
        } else {
            $crate::Value::nil()
        }
    };
}

#[macro_export]
macro_rules! read_string {
    ($vm:expr) => {
        match $vm.state.read_constant().as_string() {
            Some(handle) => handle,
            _ => panic!("Expected string constant"),
        }
    };
}

#[derive(Debug, Clone, Default)]
pub(crate) struct CallFrame {
    pub closure: ClosureHandle,
    pub ip: usize,
    pub value_slot: usize,
}

pub(crate) struct VmState {
    pub stack: Vec<Value>,
    pub stack_top: usize,
    pub frames: [CallFrame; FRAME_MAX],
    pub frame_count: usize,
    pub globals: Table,
    pub open_upvalues: Vec<UpvalueHandle>,
    pub init_string: StringHandle,
    current_function_ptr: *const FunctionObject,
}

impl VmState {
    fn new(init_string: StringHandle) -> Self {
        Self {
            stack: vec![Value::default(); STACK_MAX],
            stack_top: 0,
            frames: std::array::from_fn(|_| CallFrame::default()),
            frame_count: 0,
            globals: Table::new(),
            open_upvalues: Vec::with_capacity(8),
            init_string,
            current_function_ptr: std::ptr::null(),
        }
    }

    fn get_current_function(&self) -> &FunctionObject {
        debug_assert!(
            !self.current_function_ptr.is_null(),
            "Function pointer is null"
        );
        unsafe { &*self.current_function_ptr }
    }

    pub fn get_current_loc(&self) -> SourceLocation {
        if self.frame_count == 0 {
            return SourceLocation::default();
        }
        self.get_loc_at(self.frames[self.frame_count - 1].ip)
    }

    pub fn get_previous_loc(&self) -> SourceLocation {
        if self.frame_count > 0 && self.frames[self.frame_count - 1].ip > 0 {
            self.get_loc_at(self.frames[self.frame_count - 1].ip - 1)
        } else {
            SourceLocation::default()
        }
    }

    fn get_loc_at(&self, index: usize) -> SourceLocation {
        self.get_current_function()
            .chunk
            .locs
            .get(index)
            .copied()
            .unwrap_or_default()
    }

    fn read_byte(&mut self) -> u8 {
        let frame = unsafe { self.frames.get_unchecked_mut(self.frame_count - 1) };
        debug_assert!(
            !self.current_function_ptr.is_null(),
            "Function pointer is null"
        );

        let code = unsafe { &(*self.current_function_ptr).chunk.code };
        debug_assert!(frame.ip < code.len(), "IP out of bounds");
        let byte = unsafe { *code.get_unchecked(frame.ip) };
        frame.ip += 1;
        byte
    }

    pub fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let constants = unsafe { &(*self.current_function_ptr).chunk.constants };
        debug_assert!(index < constants.len(), "Constant index out of bounds");
        constants[index]
    }

    fn read_short(&mut self) -> usize {
        let high_byte = self.read_byte() as usize;
        let low_byte = self.read_byte() as usize;
        (high_byte << 8) | low_byte
    }
}

/// The interpreter: a value stack, a call-frame stack, and the decode loop.
/// One `Vm` owns its whole world (globals, heap, intern table), so several
/// can coexist in a process.
pub struct Vm {
    pub is_debug: bool,
    pub is_gc_enabled: bool,
    pub is_gc_stress: bool,
    pub(crate) state: VmState,
    pub alloc: HeapAllocator,
    print_capture: Option<Vec<String>>,
    started_at: Instant,
}

impl Vm {
    pub fn new(mut alloc: HeapAllocator) -> Self {
        let init_string = alloc.strings.intern("init");

        let vm = Self {
            is_debug: false,
            is_gc_enabled: true,
            is_gc_stress: false,
            state: VmState::new(init_string),
            alloc,
            print_capture: None,
            started_at: Instant::now(),
        };

        vm.add_native_function("clock", 0, nox_clock)
    }

    pub fn set_debug(mut self, is_debug: bool) -> Self {
        self.is_debug = is_debug;
        self
    }

    pub fn set_gc_status(mut self, is_enabled: bool) -> Self {
        self.is_gc_enabled = is_enabled;
        self
    }

    /// Collect at every allocation checkpoint instead of waiting for the
    /// byte threshold. Slow, but flushes out rooting mistakes immediately.
    pub fn set_gc_stress(mut self, is_stress: bool) -> Self {
        self.is_gc_stress = is_stress;
        self
    }

    /// Routes `print` output into an internal buffer instead of stdout.
    pub fn capture_prints(mut self) -> Self {
        self.print_capture = Some(Vec::new());
        self
    }

    pub fn take_prints(&mut self) -> Vec<String> {
        match &mut self.print_capture {
            Some(lines) => std::mem::take(lines),
            None => Vec::new(),
        }
    }

    pub fn add_native_function(mut self, name: &str, arity: usize, function: NativeFn) -> Self {
        let name_handle = self.alloc.strings.intern(name);
        let handle = self.alloc.allocate_native_function(NativeFunctionObject {
            function,
            arity,
            name: name_handle,
        });

        self.state
            .globals
            .set(name_handle, Value::native_function(handle));

        self
    }

    pub fn uptime(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn native_args(&self, arg_count: usize) -> &[Value] {
        &self.state.stack[self.state.stack_top - arg_count..self.state.stack_top]
    }

    pub(crate) fn with_gc_check<T>(&mut self, op: impl FnOnce(&mut HeapAllocator) -> T) -> T {
        if self.is_gc_enabled && (self.is_gc_stress || self.alloc.should_collect_garbage()) {
            self.collect_garbage();
        }
        op(&mut self.alloc)
    }

    /// Gathers the root set and hands it to the allocator: every live stack
    /// slot, every frame's closure, the globals (keys and values), the
    /// cached `init` string, and the open-upvalue list.
    pub fn collect_garbage(&mut self) {
        let mut roots: VecDeque<Value> = VecDeque::with_capacity(self.state.stack_top + 16);

        for i in 0..self.state.stack_top {
            roots.push_back(self.state.stack[i]);
        }
        for i in 0..self.state.frame_count {
            roots.push_back(Value::closure(self.state.frames[i].closure));
        }
        for (key, value) in self.state.globals.iter() {
            roots.push_back(Value::string(key));
            roots.push_back(value);
        }
        roots.push_back(Value::string(self.state.init_string));

        let open_upvalues = self.state.open_upvalues.clone();
        self.alloc.collect_garbage(roots, &open_upvalues);
    }

    pub fn interpret(&mut self, program: NoxProgram) -> RuntimeResult<()> {
        let function_handle = program.handle();
        let upvalue_count = self.alloc.get_function(function_handle).upvalue_count;

        let closure_handle = self
            .alloc
            .allocate_closure(ClosureObject::new(function_handle, upvalue_count));
        push_value!(self, Value::closure(closure_handle))?;
        self.call(closure_handle, 0)?;

        match self.run() {
            Ok(()) => Ok(()),
            Err(error) => {
                let error = error.with_stack_trace(self.get_stack_trace());
                self.reset();
                Err(error)
            }
        }
    }

    fn reset(&mut self) {
        self.state.stack_top = 0;
        self.state.frame_count = 0;
        self.state.open_upvalues.clear();
        self.state.current_function_ptr = std::ptr::null();
    }

    pub(crate) fn get_stack_trace(&self) -> Vec<Trace> {
        let mut traces = Vec::with_capacity(self.state.frame_count);

        for i in (0..self.state.frame_count).rev() {
            let frame = &self.state.frames[i];
            let closure = self.alloc.get_closure(frame.closure);
            let function = self.alloc.get_function(closure.function);
            let line = function
                .chunk
                .locs
                .get(frame.ip.saturating_sub(1))
                .copied()
                .unwrap_or_default()
                .line;

            let callee = match function.name {
                Some(name) => format!("{}()", self.alloc.strings.get_string(name)),
                None => "script".to_string(),
            };
            traces.push(Trace::new(&callee, line));
        }

        traces
    }

    fn runtime_error(&self, message: String) -> NoxRuntimeError {
        NoxRuntimeError::new(message, self.state.get_previous_loc().line)
    }

    #[cfg(debug_assertions)]
    fn debug_print(&self) {
        print!("          ");
        for i in 0..self.state.stack_top {
            print!("[ {} ]", self.state.stack[i].to_display_string(&self.alloc));
        }
        println!();

        let frame = &self.state.frames[self.state.frame_count - 1];
        let function = self.state.get_current_function();
        disassemble_instruction(&function.chunk, &self.alloc, frame.ip);
    }

    fn run(&mut self) -> RuntimeResult<()> {
        loop {
            #[cfg(debug_assertions)]
            {
                if self.is_debug {
                    self.debug_print();
                }
            }

            let opcode: OpCode = self.state.read_byte().into();

            match opcode {
                OpCode::Constant => {
                    let constant = self.state.read_constant();
                    push_value!(self, constant)?;
                }
                OpCode::Nil => {
                    push_value!(self, Value::nil())?;
                }
                OpCode::True => {
                    push_value!(self, Value::boolean(true))?;
                }
                OpCode::False => {
                    push_value!(self, Value::boolean(false))?;
                }
                OpCode::Pop => {
                    pop_value!(self);
                }
                OpCode::GetLocal => {
                    let slot = self.state.read_byte() as usize;
                    let absolute_slot =
                        self.state.frames[self.state.frame_count - 1].value_slot + slot;
                    debug_assert!(
                        absolute_slot < STACK_MAX,
                        "Local slot {} out of bounds",
                        absolute_slot
                    );

                    let value = self.state.stack[absolute_slot];
                    push_value!(self, value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.state.read_byte() as usize;
                    let value = peek_value!(self, 0);
                    let absolute_slot =
                        self.state.frames[self.state.frame_count - 1].value_slot + slot;

                    self.state.stack[absolute_slot] = value;
                }
                OpCode::GetGlobal => {
                    let name = read_string!(self);
                    match self.state.globals.get(name) {
                        Some(value) => push_value!(self, value)?,
                        None => {
                            return Err(self.runtime_error(format!(
                                "Undefined variable '{}'.",
                                self.alloc.strings.get_string(name)
                            )));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = read_string!(self);
                    let value = peek_value!(self, 0);
                    self.state.globals.set(name, value);
                    pop_value!(self);
                }
                OpCode::SetGlobal => {
                    let name = read_string!(self);
                    let value = peek_value!(self, 0);
                    // Assignment never creates a global: if the insert made a
                    // new entry, take it right back out and report the miss.
                    if self.state.globals.set(name, value) {
                        self.state.globals.delete(name);
                        return Err(self.runtime_error(format!(
                            "Undefined variable '{}'.",
                            self.alloc.strings.get_string(name)
                        )));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.state.read_byte() as usize;
                    let closure_handle = self.state.frames[self.state.frame_count - 1].closure;
                    let upvalue_handle = self.alloc.get_closure(closure_handle).upvalues[slot];

                    let value = match self.alloc.get_upvalue(upvalue_handle).state {
                        UpvalueState::Open(stack_slot) => self.state.stack[stack_slot],
                        UpvalueState::Closed(value) => value,
                    };
                    push_value!(self, value)?;
                }
                OpCode::SetUpvalue => {
                    let slot = self.state.read_byte() as usize;
                    let value = peek_value!(self, 0);
                    let closure_handle = self.state.frames[self.state.frame_count - 1].closure;
                    let upvalue_handle = self.alloc.get_closure(closure_handle).upvalues[slot];

                    match self.alloc.get_upvalue(upvalue_handle).state {
                        UpvalueState::Open(stack_slot) => {
                            self.state.stack[stack_slot] = value;
                        }
                        UpvalueState::Closed(_) => {
                            self.alloc.get_upvalue_mut(upvalue_handle).state =
                                UpvalueState::Closed(value);
                        }
                    }
                }
                OpCode::GetProperty => {
                    let name = read_string!(self);
                    let receiver = peek_value!(self, 0);

                    let Some(instance_handle) = receiver.as_instance() else {
                        return Err(
                            self.runtime_error("Only instances have properties.".to_string())
                        );
                    };

                    let field = self.alloc.get_instance(instance_handle).fields.get(name);
                    if let Some(value) = field {
                        pop_value!(self);
                        push_value!(self, value)?;
                    } else {
                        let class = self.alloc.get_instance(instance_handle).class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let name = read_string!(self);

                    let Some(instance_handle) = peek_value!(self, 1).as_instance() else {
                        return Err(self.runtime_error("Only instances have fields.".to_string()));
                    };

                    let value = peek_value!(self, 0);
                    self.alloc
                        .get_instance_mut(instance_handle)
                        .fields
                        .set(name, value);

                    let value = pop_value!(self);
                    pop_value!(self); // receiver
                    push_value!(self, value)?;
                }
                OpCode::GetSuper => {
                    let name = read_string!(self);
                    let superclass = pop_value!(self);

                    let Some(superclass_handle) = superclass.as_class() else {
                        return Err(
                            self.runtime_error("Superclass must be a class.".to_string())
                        );
                    };
                    self.bind_method(superclass_handle, name)?;
                }
                OpCode::Equal => {
                    let b = pop_value!(self);
                    let a = pop_value!(self);
                    push_value!(self, Value::boolean(a == b))?;
                }
                OpCode::Greater => self.binary_operation(|a, b| {
                    match (a.as_number(), b.as_number()) {
                        (Some(num1), Some(num2)) => Ok((num1 > num2).into()),
                        _ => Err(BinaryOperationError::new("Operands must be numbers.")),
                    }
                })?,
                OpCode::Less => self.binary_operation(|a, b| {
                    match (a.as_number(), b.as_number()) {
                        (Some(num1), Some(num2)) => Ok((num1 < num2).into()),
                        _ => Err(BinaryOperationError::new("Operands must be numbers.")),
                    }
                })?,
                OpCode::Add => {
                    let b = peek_value!(self, 0);
                    let a = peek_value!(self, 1);

                    match (a.kind(), b.kind()) {
                        (ValueKind::Number(num1), ValueKind::Number(num2)) => {
                            pop_value!(self);
                            pop_value!(self);
                            push_value!(self, Value::number(num1 + num2))?;
                        }
                        (ValueKind::String(handle1), ValueKind::String(handle2)) => {
                            // Operands stay on the stack across the
                            // allocation so a collection here cannot free
                            // them mid-concatenation.
                            let result = self
                                .with_gc_check(|alloc| alloc.strings.concat(handle1, handle2));
                            pop_value!(self);
                            pop_value!(self);
                            push_value!(self, Value::string(result))?;
                        }
                        _ => {
                            return Err(self.runtime_error(
                                "Operands must be two numbers or two strings.".to_string(),
                            ));
                        }
                    }
                }
                OpCode::Subtract => self.binary_operation(|a, b| {
                    match (a.as_number(), b.as_number()) {
                        (Some(num1), Some(num2)) => Ok((num1 - num2).into()),
                        _ => Err(BinaryOperationError::new("Operands must be numbers.")),
                    }
                })?,
                OpCode::Multiply => self.binary_operation(|a, b| {
                    match (a.as_number(), b.as_number()) {
                        (Some(num1), Some(num2)) => Ok((num1 * num2).into()),
                        _ => Err(BinaryOperationError::new("Operands must be numbers.")),
                    }
                })?,
                OpCode::Divide => self.binary_operation(|a, b| {
                    match (a.as_number(), b.as_number()) {
                        // Division by zero is not an error; it produces the
                        // IEEE infinity or NaN.
                        (Some(num1), Some(num2)) => Ok((num1 / num2).into()),
                        _ => Err(BinaryOperationError::new("Operands must be numbers.")),
                    }
                })?,
                OpCode::Not => {
                    let value = peek_value!(self, 0);
                    if let Some(stack_value) = self.state.stack.get_mut(self.state.stack_top - 1) {
                        *stack_value = (!value.is_truthy()).into();
                    }
                }
                OpCode::Negate => {
                    if let Some(number) = peek_value!(self, 0).as_number() {
                        if let Some(stack_value) =
                            self.state.stack.get_mut(self.state.stack_top - 1)
                        {
                            *stack_value = Value::number(-number);
                        }
                    } else {
                        return Err(self.runtime_error("Operand must be a number.".to_string()));
                    }
                }
                OpCode::Print => {
                    let value = pop_value!(self);
                    let text = value.to_display_string(&self.alloc);
                    self.write_print(text);
                }
                OpCode::Jump => {
                    let offset = self.state.read_short();
                    self.state.frames[self.state.frame_count - 1].ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.state.read_short();
                    if !peek_value!(self, 0).is_truthy() {
                        self.state.frames[self.state.frame_count - 1].ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.state.read_short();
                    self.state.frames[self.state.frame_count - 1].ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.state.read_byte() as usize;
                    let callee = peek_value!(self, arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = read_string!(self);
                    let arg_count = self.state.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = read_string!(self);
                    let arg_count = self.state.read_byte() as usize;
                    let superclass = pop_value!(self);

                    let Some(superclass_handle) = superclass.as_class() else {
                        return Err(
                            self.runtime_error("Superclass must be a class.".to_string())
                        );
                    };
                    self.invoke_from_class(superclass_handle, name, arg_count)?;
                }
                OpCode::Closure => {
                    let constant = self.state.read_constant();
                    self.create_closure(constant)?;
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.state.stack_top - 1);
                    pop_value!(self);
                }
                OpCode::Return => {
                    let result = pop_value!(self);
                    let value_slot = self.state.frames[self.state.frame_count - 1].value_slot;

                    self.close_upvalues(value_slot);
                    self.state.frame_count -= 1;
                    self.state.stack_top = value_slot;

                    if self.state.frame_count == 0 {
                        return Ok(());
                    }

                    push_value!(self, result)?;

                    let previous_frame = &self.state.frames[self.state.frame_count - 1];
                    let previous_closure = self.alloc.get_closure(previous_frame.closure);
                    let previous_function = self.alloc.get_function(previous_closure.function);
                    self.state.current_function_ptr = previous_function as *const FunctionObject;
                }
                OpCode::Class => {
                    let name = read_string!(self);
                    let class_handle =
                        self.with_gc_check(|alloc| alloc.allocate_class(ClassObject::new(name)));
                    push_value!(self, Value::class(class_handle))?;
                }
                OpCode::Inherit => {
                    let superclass = peek_value!(self, 1);

                    let Some(superclass_handle) = superclass.as_class() else {
                        return Err(
                            self.runtime_error("Superclass must be a class.".to_string())
                        );
                    };
                    let subclass_handle = peek_value!(self, 0)
                        .as_class()
                        .expect("subclass slot holds a class");

                    // Copy the superclass's methods down. Method declarations
                    // for the subclass run after this, so overrides simply
                    // overwrite the copied entries.
                    let methods = self.alloc.get_class(superclass_handle).methods.clone();
                    self.alloc
                        .get_class_mut(subclass_handle)
                        .methods
                        .add_all_from(&methods);

                    pop_value!(self); // subclass; superclass stays for `super` binding
                }
                OpCode::Method => {
                    let name = read_string!(self);
                    self.define_method(name);
                }
            }
        }
    }

    fn write_print(&mut self, text: String) {
        match &mut self.print_capture {
            Some(lines) => lines.push(text),
            None => println!("{}", text),
        }
    }

    fn binary_operation<F>(&mut self, op: F) -> RuntimeResult<()>
    where
        F: FnOnce(Value, Value) -> Result<Value, BinaryOperationError>,
    {
        let b = pop_value!(self);
        let a = pop_value!(self);

        let value = op(a, b).map_err(|e: BinaryOperationError| {
            e.into_runtime_error(self.state.get_previous_loc())
        })?;

        push_value!(self, value)?;
        Ok(())
    }

    pub(crate) fn call_value(&mut self, callee: Value, arg_count: usize) -> RuntimeResult<()> {
        match callee.kind() {
            ValueKind::Closure(handle) => self.call(handle, arg_count),
            ValueKind::NativeFunction(handle) => self.call_native_function(handle, arg_count),
            ValueKind::Class(handle) => {
                let instance_handle = self.with_gc_check(|alloc| {
                    alloc.allocate_instance(InstanceObject::new(handle))
                });
                self.state.stack[self.state.stack_top - arg_count - 1] =
                    Value::instance(instance_handle);

                let initializer = self
                    .alloc
                    .get_class(handle)
                    .methods
                    .get(self.state.init_string)
                    .and_then(|v| v.as_closure());

                if let Some(initializer) = initializer {
                    self.call(initializer, arg_count)
                } else if arg_count != 0 {
                    Err(self
                        .runtime_error(format!("Expected 0 arguments but got {}.", arg_count)))
                } else {
                    Ok(())
                }
            }
            ValueKind::BoundMethod(handle) => {
                let bound = self.alloc.get_bound_method(handle);
                let receiver = bound.receiver;
                let method = bound.method;

                self.state.stack[self.state.stack_top - arg_count - 1] = receiver;
                self.call(method, arg_count)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.".to_string())),
        }
    }

    fn call(&mut self, closure_handle: ClosureHandle, arg_count: usize) -> RuntimeResult<()> {
        let closure = self.alloc.get_closure(closure_handle);
        let function = self.alloc.get_function(closure.function);

        if arg_count != function.arity {
            let arity = function.arity;
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                arity, arg_count
            )));
        }

        if self.state.frame_count >= FRAME_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }

        let function_ptr = function as *const FunctionObject;
        let value_slot = self.state.stack_top - arg_count - 1;

        self.state.frame_count += 1;
        let frame = &mut self.state.frames[self.state.frame_count - 1];
        frame.closure = closure_handle;
        frame.ip = 0;
        frame.value_slot = value_slot;
        self.state.current_function_ptr = function_ptr;

        Ok(())
    }

    fn call_native_function(
        &mut self,
        handle: NativeFunctionHandle,
        arg_count: usize,
    ) -> RuntimeResult<()> {
        let native = self.alloc.get_native_function(handle).function;

        // Arguments stay on the stack while the native runs, so they remain
        // rooted if the native allocates.
        let value = native(arg_count, self)
            .map_err(|e: NativeFunctionError| {
                let line = self.state.get_previous_loc().line;
                e.into_runtime_error(line)
            })?
            .unwrap_or_default();

        self.state.stack_top -= arg_count + 1;
        push_value!(self, value)?;

        Ok(())
    }

    fn invoke(&mut self, name: StringHandle, arg_count: usize) -> RuntimeResult<()> {
        let receiver = peek_value!(self, arg_count);

        let Some(instance_handle) = receiver.as_instance() else {
            return Err(self.runtime_error("Only instances have methods.".to_string()));
        };

        // A field shadows any method of the same name, so it gets first say.
        let field = self.alloc.get_instance(instance_handle).fields.get(name);
        if let Some(field) = field {
            self.state.stack[self.state.stack_top - arg_count - 1] = field;
            return self.call_value(field, arg_count);
        }

        let class = self.alloc.get_instance(instance_handle).class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class_handle: ClassHandle,
        name: StringHandle,
        arg_count: usize,
    ) -> RuntimeResult<()> {
        let method = self
            .alloc
            .get_class(class_handle)
            .methods
            .get(name)
            .and_then(|v| v.as_closure());

        match method {
            Some(closure) => self.call(closure, arg_count),
            None => Err(self.runtime_error(format!(
                "Undefined property '{}'.",
                self.alloc.strings.get_string(name)
            ))),
        }
    }

    fn bind_method(&mut self, class_handle: ClassHandle, name: StringHandle) -> RuntimeResult<()> {
        let method = self
            .alloc
            .get_class(class_handle)
            .methods
            .get(name)
            .and_then(|v| v.as_closure());

        match method {
            Some(closure) => {
                let receiver = peek_value!(self, 0);
                let bound = BoundMethodObject::new(receiver, closure);
                let handle = self.with_gc_check(|alloc| alloc.allocate_bound_method(bound));

                pop_value!(self);
                push_value!(self, Value::bound_method(handle))?;
                Ok(())
            }
            None => Err(self.runtime_error(format!(
                "Undefined property '{}'.",
                self.alloc.strings.get_string(name)
            ))),
        }
    }

    fn define_method(&mut self, name: StringHandle) {
        let method = peek_value!(self, 0);
        let class_value = peek_value!(self, 1);

        if let (Some(_), Some(class_handle)) = (method.as_closure(), class_value.as_class()) {
            self.alloc
                .get_class_mut(class_handle)
                .methods
                .set(name, method);
            pop_value!(self);
        }
    }

    fn create_closure(&mut self, constant: Value) -> RuntimeResult<()> {
        let Some(function_handle) = constant.as_function() else {
            return Err(self.runtime_error("Expected function.".to_string()));
        };

        let upvalue_count = self.alloc.get_function(function_handle).upvalue_count;
        let closure_handle = self.with_gc_check(|alloc| {
            alloc.allocate_closure(ClosureObject::new(function_handle, upvalue_count))
        });

        // The closure is pushed before its upvalues are captured, so it is
        // already rooted if a capture allocation collects.
        push_value!(self, Value::closure(closure_handle))?;

        for _ in 0..upvalue_count {
            let is_local = self.state.read_byte() != 0;
            let index = self.state.read_byte() as usize;

            let upvalue_handle = if is_local {
                let stack_slot = self.state.frames[self.state.frame_count - 1].value_slot + index;
                self.capture_upvalue(stack_slot)
            } else {
                let enclosing = self.state.frames[self.state.frame_count - 1].closure;
                self.alloc.get_closure(enclosing).upvalues[index]
            };

            self.alloc
                .get_closure_mut(closure_handle)
                .upvalues
                .push(upvalue_handle);
        }

        Ok(())
    }

    /// Reuses the open upvalue for `stack_slot` if one exists; otherwise
    /// creates one and inserts it in order. The list is sorted by descending
    /// stack slot so `close_upvalues` can stop at the first survivor.
    fn capture_upvalue(&mut self, stack_slot: usize) -> UpvalueHandle {
        let mut insert_at = self.state.open_upvalues.len();

        for (i, &handle) in self.state.open_upvalues.iter().enumerate() {
            if let UpvalueState::Open(slot) = self.alloc.get_upvalue(handle).state {
                if slot == stack_slot {
                    return handle;
                }
                if slot < stack_slot {
                    insert_at = i;
                    break;
                }
            }
        }

        let handle =
            self.with_gc_check(|alloc| alloc.allocate_upvalue(UpvalueObject::open(stack_slot)));
        self.state.open_upvalues.insert(insert_at, handle);
        handle
    }

    /// Closes every open upvalue pointing at `last_slot` or above: the
    /// current stack value moves into the upvalue, which leaves the list.
    fn close_upvalues(&mut self, last_slot: usize) {
        while let Some(&handle) = self.state.open_upvalues.first() {
            let slot = match self.alloc.get_upvalue(handle).state {
                UpvalueState::Open(slot) => slot,
                UpvalueState::Closed(_) => {
                    self.state.open_upvalues.remove(0);
                    continue;
                }
            };

            if slot < last_slot {
                break;
            }

            let value = self.state.stack[slot];
            self.alloc.get_upvalue_mut(handle).state = UpvalueState::Closed(value);
            self.state.open_upvalues.remove(0);
        }
    }
}
