use std::fmt::Write;

use crate::{
    HeapAllocator, Value,
    chunk::{Chunk, OpCode},
};

pub fn disassemble_chunk(chunk: &Chunk, allocator: &HeapAllocator, name: &str) {
    print!("{}", disassemble_chunk_to_string(chunk, allocator, name));
}

/// String-returning variant so tests can pin the exact instruction stream.
pub fn disassemble_chunk_to_string(chunk: &Chunk, allocator: &HeapAllocator, name: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "== {} ==", name);

    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = write_instruction(chunk, allocator, offset, &mut out);
    }

    out
}

pub fn disassemble_instruction(chunk: &Chunk, allocator: &HeapAllocator, offset: usize) -> usize {
    let mut out = String::new();
    let next = write_instruction(chunk, allocator, offset, &mut out);
    print!("{}", out);
    next
}

fn write_instruction(
    chunk: &Chunk,
    allocator: &HeapAllocator,
    offset: usize,
    out: &mut String,
) -> usize {
    let _ = write!(out, "{:04} ", offset);

    if offset > 0 && chunk.locs[offset].line == chunk.locs[offset - 1].line {
        let _ = write!(out, "   | ");
    } else {
        let _ = write!(out, "{:4} ", chunk.locs[offset].line);
    }

    let opcode = OpCode::from(chunk.code[offset]);

    match opcode {
        OpCode::Constant => constant_instruction("OP_CONSTANT", chunk, allocator, offset, out),
        OpCode::Nil => simple_instruction("OP_NIL", offset, out),
        OpCode::True => simple_instruction("OP_TRUE", offset, out),
        OpCode::False => simple_instruction("OP_FALSE", offset, out),
        OpCode::Pop => simple_instruction("OP_POP", offset, out),
        OpCode::GetLocal => byte_instruction("OP_GET_LOCAL", chunk, offset, out),
        OpCode::SetLocal => byte_instruction("OP_SET_LOCAL", chunk, offset, out),
        OpCode::GetGlobal => constant_instruction("OP_GET_GLOBAL", chunk, allocator, offset, out),
        OpCode::DefineGlobal => {
            constant_instruction("OP_DEFINE_GLOBAL", chunk, allocator, offset, out)
        }
        OpCode::SetGlobal => constant_instruction("OP_SET_GLOBAL", chunk, allocator, offset, out),
        OpCode::GetUpvalue => byte_instruction("OP_GET_UPVALUE", chunk, offset, out),
        OpCode::SetUpvalue => byte_instruction("OP_SET_UPVALUE", chunk, offset, out),
        OpCode::GetProperty => {
            constant_instruction("OP_GET_PROPERTY", chunk, allocator, offset, out)
        }
        OpCode::SetProperty => {
            constant_instruction("OP_SET_PROPERTY", chunk, allocator, offset, out)
        }
        OpCode::GetSuper => constant_instruction("OP_GET_SUPER", chunk, allocator, offset, out),
        OpCode::Equal => simple_instruction("OP_EQUAL", offset, out),
        OpCode::Greater => simple_instruction("OP_GREATER", offset, out),
        OpCode::Less => simple_instruction("OP_LESS", offset, out),
        OpCode::Add => simple_instruction("OP_ADD", offset, out),
        OpCode::Subtract => simple_instruction("OP_SUBTRACT", offset, out),
        OpCode::Multiply => simple_instruction("OP_MULTIPLY", offset, out),
        OpCode::Divide => simple_instruction("OP_DIVIDE", offset, out),
        OpCode::Not => simple_instruction("OP_NOT", offset, out),
        OpCode::Negate => simple_instruction("OP_NEGATE", offset, out),
        OpCode::Print => simple_instruction("OP_PRINT", offset, out),
        OpCode::Jump => jump_instruction("OP_JUMP", 1, chunk, offset, out),
        OpCode::JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset, out),
        OpCode::Loop => jump_instruction("OP_LOOP", -1, chunk, offset, out),
        OpCode::Call => byte_instruction("OP_CALL", chunk, offset, out),
        OpCode::Invoke => invoke_instruction("OP_INVOKE", chunk, allocator, offset, out),
        OpCode::SuperInvoke => invoke_instruction("OP_SUPER_INVOKE", chunk, allocator, offset, out),
        OpCode::Closure => {
            let mut offset = offset + 1;
            let constant = chunk.code[offset];
            offset += 1;

            let value = chunk.constants[constant as usize];
            let _ = writeln!(
                out,
                "{:<16} {:4} '{}'",
                "OP_CLOSURE",
                constant,
                value.to_display_string(allocator)
            );

            if let Some(function_handle) = value.as_function() {
                let function = allocator.get_function(function_handle);
                for _ in 0..function.upvalue_count {
                    let is_local = chunk.code[offset];
                    let index = chunk.code[offset + 1];
                    let _ = writeln!(
                        out,
                        "{:04}      |                     {} {}",
                        offset,
                        if is_local != 0 { "local" } else { "upvalue" },
                        index
                    );
                    offset += 2;
                }
            }

            offset
        }
        OpCode::CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset, out),
        OpCode::Return => simple_instruction("OP_RETURN", offset, out),
        OpCode::Class => constant_instruction("OP_CLASS", chunk, allocator, offset, out),
        OpCode::Inherit => simple_instruction("OP_INHERIT", offset, out),
        OpCode::Method => constant_instruction("OP_METHOD", chunk, allocator, offset, out),
    }
}

fn constant_instruction(
    name: &str,
    chunk: &Chunk,
    allocator: &HeapAllocator,
    offset: usize,
    out: &mut String,
) -> usize {
    let constant = chunk.code[offset + 1] as usize;
    let value = chunk
        .constants
        .get(constant)
        .copied()
        .unwrap_or(Value::nil());
    let _ = writeln!(
        out,
        "{:<16} {:4} '{}'",
        name,
        constant,
        value.to_display_string(allocator)
    );
    offset + 2
}

fn simple_instruction(name: &str, offset: usize, out: &mut String) -> usize {
    let _ = writeln!(out, "{}", name);
    offset + 1
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    let _ = writeln!(out, "{:<16} {:4}", name, slot);
    offset + 2
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let jump = ((chunk.code[offset + 1] as u16) << 8) | (chunk.code[offset + 2] as u16);
    let target = offset as i32 + 3 + sign * (jump as i32);
    let _ = writeln!(out, "{:<16} {:4} -> {}", name, offset, target);
    offset + 3
}

fn invoke_instruction(
    name: &str,
    chunk: &Chunk,
    allocator: &HeapAllocator,
    offset: usize,
    out: &mut String,
) -> usize {
    let constant = chunk.code[offset + 1];
    let arg_count = chunk.code[offset + 2];
    let value = chunk
        .constants
        .get(constant as usize)
        .copied()
        .unwrap_or(Value::nil());
    let _ = writeln!(
        out,
        "{:<16} ({} args) {:4} '{}'",
        name,
        arg_count,
        constant,
        value.to_display_string(allocator)
    );
    offset + 3
}

pub fn disassemble_program(allocator: &HeapAllocator) {
    println!("=== PROGRAM DISASSEMBLY ===");
    println!();

    let mut function_count = 0;

    for (index, function) in allocator.iter_functions() {
        function_count += 1;

        let function_name = match function.name {
            Some(name) => allocator.strings.get_string(name).to_string(),
            None => "script".to_string(),
        };

        println!("Function #{} - {}:", index, function_name);
        println!("  Arity: {}", function.arity);
        disassemble_chunk(&function.chunk, allocator, &function_name);
        println!();
    }

    if function_count == 0 {
        println!("No functions found in the program.");
    } else {
        println!(
            "=== END PROGRAM DISASSEMBLY ({} functions) ===",
            function_count
        );
    }
}

#[macro_export]
macro_rules! debug_log {
    ($is_debug:expr, $($arg:tt)*) => {{
        #[cfg(debug_assertions)]
        {
            if $is_debug {
                println!($($arg)*);
            }
        }
    }};
}
