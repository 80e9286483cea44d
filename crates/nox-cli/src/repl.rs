use std::io::{self, Write};
use std::sync::Arc;

use nox_core::{CompilerPipeline, HeapAllocator, SourceMap, Vm};

/// One VM for the whole session: globals and the heap persist across lines,
/// and errors report without tearing the loop down.
pub fn run_repl(debug: bool) {
    let allocator = HeapAllocator::new().set_debug(debug);
    let mut vm = Vm::new(allocator).set_debug(debug);

    loop {
        print!("> ");
        io::stdout().flush().expect("flush stdout");

        let mut input = String::new();
        match io::stdin().read_line(&mut input) {
            Ok(0) => {
                // EOF: leave the prompt on its own line.
                println!();
                break;
            }
            Ok(_) => {
                let input = input.trim();
                if input == "exit" {
                    break;
                }
                if !input.is_empty() {
                    execute_repl_line(input, &mut vm);
                }
            }
            Err(err) => {
                eprintln!("Error reading input: {}", err);
                break;
            }
        }
    }
}

pub fn execute_repl_line(source: &str, vm: &mut Vm) {
    let source_map = Arc::new(SourceMap::new(source.to_string()));

    let program = match CompilerPipeline::new().compile(&source_map, &mut vm.alloc) {
        Ok(program) => program,
        Err(errors) => {
            for error in errors.all() {
                eprintln!("{}", error);
            }
            return;
        }
    };

    match vm.interpret(program) {
        Ok(_) => (),
        Err(error) => {
            eprintln!("{}", error);
        }
    }
}
