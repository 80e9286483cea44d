use std::collections::VecDeque;

use crate::memory::arena::Arena;
use crate::memory::string_interner::StringInterner;
use crate::object::{
    BoundMethodObject, ClassObject, ClosureObject, FunctionObject, InstanceObject,
    NativeFunctionObject, UpvalueObject, UpvalueState,
};
use crate::{Value, ValueKind, debug_log};

pub type FunctionHandle = u32;
pub type ClosureHandle = u32;
pub type UpvalueHandle = u32;
pub type ClassHandle = u32;
pub type InstanceHandle = u32;
pub type BoundMethodHandle = u32;
pub type NativeFunctionHandle = u32;

const GC_HEAP_GROW_FACTOR: usize = 2;

/// Owns every heap object the interpreter creates: typed slot arenas for the
/// object variants, the string intern table, and the byte accounting that
/// drives the collector. The VM decides *when* to collect (it knows the
/// roots); this type knows *how*.
#[derive(Debug, Clone, Default)]
pub struct HeapAllocator {
    pub strings: StringInterner,
    functions: Arena<FunctionObject>,
    closures: Arena<ClosureObject>,
    upvalues: Arena<UpvalueObject>,
    classes: Arena<ClassObject>,
    instances: Arena<InstanceObject>,
    bound_methods: Arena<BoundMethodObject>,
    native_functions: Vec<NativeFunctionObject>,
    is_debug: bool,
    bytes_until_gc: usize,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    pub fn with_capacity(initial_capacity: usize) -> Self {
        Self {
            strings: StringInterner::with_capacity(initial_capacity),
            functions: Arena::with_capacity(initial_capacity),
            closures: Arena::with_capacity(initial_capacity),
            upvalues: Arena::with_capacity(initial_capacity),
            classes: Arena::with_capacity(initial_capacity),
            instances: Arena::with_capacity(initial_capacity),
            bound_methods: Arena::with_capacity(initial_capacity),
            native_functions: Vec::new(),
            is_debug: false,
            bytes_until_gc: 1024 * 1024,
        }
    }

    pub fn set_debug(mut self, is_debug: bool) -> Self {
        self.is_debug = is_debug;
        self
    }

    pub fn set_bytes_until_gc(mut self, bytes: usize) -> Self {
        self.bytes_until_gc = bytes;
        self
    }

    pub fn allocate_function(&mut self, function: FunctionObject) -> FunctionHandle {
        let handle = self.functions.insert(function);
        debug_log!(self.is_debug, "Allocated function: {:?}", handle);
        handle
    }

    pub fn get_function(&self, handle: FunctionHandle) -> &FunctionObject {
        &self.functions[handle]
    }

    pub fn iter_functions(&self) -> impl Iterator<Item = (u32, &FunctionObject)> {
        self.functions.iter()
    }

    pub fn allocate_closure(&mut self, closure: ClosureObject) -> ClosureHandle {
        let handle = self.closures.insert(closure);
        debug_log!(self.is_debug, "Allocated closure: {:?}", handle);
        handle
    }

    pub fn get_closure(&self, handle: ClosureHandle) -> &ClosureObject {
        &self.closures[handle]
    }

    pub fn get_closure_mut(&mut self, handle: ClosureHandle) -> &mut ClosureObject {
        &mut self.closures[handle]
    }

    pub fn allocate_upvalue(&mut self, upvalue: UpvalueObject) -> UpvalueHandle {
        let handle = self.upvalues.insert(upvalue);
        debug_log!(self.is_debug, "Allocated upvalue: {:?}", handle);
        handle
    }

    pub fn get_upvalue(&self, handle: UpvalueHandle) -> &UpvalueObject {
        &self.upvalues[handle]
    }

    pub fn get_upvalue_mut(&mut self, handle: UpvalueHandle) -> &mut UpvalueObject {
        &mut self.upvalues[handle]
    }

    pub fn allocate_class(&mut self, class: ClassObject) -> ClassHandle {
        let handle = self.classes.insert(class);
        debug_log!(self.is_debug, "Allocated class: {:?}", handle);
        handle
    }

    pub fn get_class(&self, handle: ClassHandle) -> &ClassObject {
        &self.classes[handle]
    }

    pub fn get_class_mut(&mut self, handle: ClassHandle) -> &mut ClassObject {
        &mut self.classes[handle]
    }

    pub fn allocate_instance(&mut self, instance: InstanceObject) -> InstanceHandle {
        let handle = self.instances.insert(instance);
        debug_log!(self.is_debug, "Allocated instance: {:?}", handle);
        handle
    }

    pub fn get_instance(&self, handle: InstanceHandle) -> &InstanceObject {
        &self.instances[handle]
    }

    pub fn get_instance_mut(&mut self, handle: InstanceHandle) -> &mut InstanceObject {
        &mut self.instances[handle]
    }

    pub fn allocate_bound_method(&mut self, bound: BoundMethodObject) -> BoundMethodHandle {
        let handle = self.bound_methods.insert(bound);
        debug_log!(self.is_debug, "Allocated bound method: {:?}", handle);
        handle
    }

    pub fn get_bound_method(&self, handle: BoundMethodHandle) -> &BoundMethodObject {
        &self.bound_methods[handle]
    }

    pub fn allocate_native_function(
        &mut self,
        function: NativeFunctionObject,
    ) -> NativeFunctionHandle {
        self.native_functions.push(function);
        (self.native_functions.len() - 1) as NativeFunctionHandle
    }

    pub fn get_native_function(&self, handle: NativeFunctionHandle) -> &NativeFunctionObject {
        &self.native_functions[handle as usize]
    }

    pub fn should_collect_garbage(&self) -> bool {
        self.total_allocated_bytes() > self.bytes_until_gc
    }

    pub fn total_allocated_bytes(&self) -> usize {
        let string_bytes = self.strings.get_allocated_bytes();
        let function_bytes = self.functions.len() * std::mem::size_of::<FunctionObject>();
        let closure_bytes = self.closures.len() * std::mem::size_of::<ClosureObject>();
        let upvalue_bytes = self.upvalues.len() * std::mem::size_of::<UpvalueObject>();
        let class_bytes = self.classes.len() * std::mem::size_of::<ClassObject>();
        let instance_bytes = self.instances.len() * std::mem::size_of::<InstanceObject>();
        let bound_method_bytes =
            self.bound_methods.len() * std::mem::size_of::<BoundMethodObject>();

        string_bytes
            + function_bytes
            + closure_bytes
            + upvalue_bytes
            + class_bytes
            + instance_bytes
            + bound_method_bytes
    }

    pub fn object_count(&self) -> usize {
        self.strings.len()
            + self.functions.len()
            + self.closures.len()
            + self.upvalues.len()
            + self.classes.len()
            + self.instances.len()
            + self.bound_methods.len()
    }

    /// One full mark-sweep cycle. `gray_list` seeds the trace with the VM's
    /// roots; `open_upvalues` are rooted separately because open upvalues are
    /// reached through closures whose capture loop may still be mid-flight.
    ///
    /// Phases: trace and blacken, evict unmarked intern entries (the intern
    /// table is weak), then sweep each arena and clear survivor marks.
    pub fn collect_garbage(
        &mut self,
        mut gray_list: VecDeque<Value>,
        open_upvalues: &[UpvalueHandle],
    ) {
        let bytes_before = self.total_allocated_bytes();

        for &handle in open_upvalues {
            let upvalue = &mut self.upvalues[handle];
            upvalue.is_marked = true;
            if let UpvalueState::Closed(value) = upvalue.state {
                gray_list.push_back(value);
            }
        }

        // Registered natives are permanent; keep their names interned.
        for i in 0..self.native_functions.len() {
            let name = self.native_functions[i].name;
            self.strings.mark(name);
        }

        self.trace_references(gray_list);

        self.strings.sweep_unmarked();

        let mut dead: Vec<u32> = Vec::new();

        macro_rules! sweep_arena {
            ($arena:expr) => {
                for (handle, object) in $arena.iter_mut() {
                    if object.is_marked {
                        object.is_marked = false;
                    } else {
                        dead.push(handle);
                    }
                }
                for handle in dead.drain(..) {
                    $arena.remove(handle);
                }
            };
        }

        sweep_arena!(self.upvalues);
        sweep_arena!(self.closures);
        sweep_arena!(self.bound_methods);
        sweep_arena!(self.instances);
        sweep_arena!(self.classes);
        sweep_arena!(self.functions);

        let bytes_after = self.total_allocated_bytes();
        self.bytes_until_gc = bytes_after * GC_HEAP_GROW_FACTOR;

        debug_log!(
            self.is_debug,
            "Collected {} bytes. Next collection at {} bytes.",
            bytes_before.saturating_sub(bytes_after),
            self.bytes_until_gc
        );
    }

    fn trace_references(&mut self, mut gray_list: VecDeque<Value>) {
        while let Some(value) = gray_list.pop_front() {
            match value.kind() {
                ValueKind::String(handle) => {
                    self.strings.mark(handle);
                }
                ValueKind::Function(handle) => {
                    let function = &mut self.functions[handle];
                    if !function.is_marked {
                        debug_log!(self.is_debug, "Blackening function: {:?}", handle);
                        function.is_marked = true;
                        if let Some(name) = function.name {
                            gray_list.push_back(Value::string(name));
                        }
                        for constant in &function.chunk.constants {
                            gray_list.push_back(*constant);
                        }
                    }
                }
                ValueKind::Closure(handle) => {
                    let closure = &mut self.closures[handle];
                    if !closure.is_marked {
                        debug_log!(self.is_debug, "Blackening closure: {:?}", handle);
                        closure.is_marked = true;
                        let function = closure.function;
                        let upvalues = closure.upvalues.clone();
                        gray_list.push_back(Value::function(function));

                        for upvalue_handle in upvalues {
                            let upvalue = &mut self.upvalues[upvalue_handle];
                            if !upvalue.is_marked {
                                upvalue.is_marked = true;
                                if let UpvalueState::Closed(value) = upvalue.state {
                                    gray_list.push_back(value);
                                }
                            }
                        }
                    }
                }
                ValueKind::Class(handle) => {
                    let class = &mut self.classes[handle];
                    if !class.is_marked {
                        debug_log!(self.is_debug, "Blackening class: {:?}", handle);
                        class.is_marked = true;
                        gray_list.push_back(Value::string(class.name));
                        for (method_name, method) in class.methods.iter() {
                            gray_list.push_back(Value::string(method_name));
                            gray_list.push_back(method);
                        }
                    }
                }
                ValueKind::Instance(handle) => {
                    let instance = &mut self.instances[handle];
                    if !instance.is_marked {
                        debug_log!(self.is_debug, "Blackening instance: {:?}", handle);
                        instance.is_marked = true;
                        gray_list.push_back(Value::class(instance.class));
                        for (field_name, field) in instance.fields.iter() {
                            gray_list.push_back(Value::string(field_name));
                            gray_list.push_back(field);
                        }
                    }
                }
                ValueKind::BoundMethod(handle) => {
                    let bound = &mut self.bound_methods[handle];
                    if !bound.is_marked {
                        debug_log!(self.is_debug, "Blackening bound method: {:?}", handle);
                        bound.is_marked = true;
                        gray_list.push_back(bound.receiver);
                        gray_list.push_back(Value::closure(bound.method));
                    }
                }
                ValueKind::NativeFunction(handle) => {
                    let name = self.native_functions[handle as usize].name;
                    self.strings.mark(name);
                }
                ValueKind::Nil
                | ValueKind::True
                | ValueKind::False
                | ValueKind::Number(_) => {}
            }
        }
    }
}
