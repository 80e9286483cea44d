use crate::{NativeFunctionError, Value, Vm};

/// Wall-clock seconds since the interpreter started, as a Number. The one
/// built-in, registered under the global name `clock` at VM construction.
pub fn nox_clock(_arg_count: usize, vm: &mut Vm) -> Result<Option<Value>, NativeFunctionError> {
    Ok(Some(Value::number(vm.uptime())))
}
