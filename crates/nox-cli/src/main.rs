mod repl;

use std::sync::Arc;

use clap::{ArgAction, Parser, error::ErrorKind};
use nox_core::{CompilerPipeline, HeapAllocator, SourceMap, Vm, disassemble_program};
use repl::run_repl;

#[derive(Parser)]
#[command(name = "nox")]
#[command(version, about = "The Nox interpreter", long_about = None)]
struct NoxCli {
    /// Script to run; omit to start the REPL
    script: Option<String>,

    #[arg(short, long, action = ArgAction::SetTrue, help = "Trace execution and collections")]
    debug: bool,

    #[arg(short = 'm', long, action = ArgAction::SetTrue, help = "Dump compiled bytecode before execution")]
    disassemble: bool,
}

fn main() {
    let cli = match NoxCli::try_parse() {
        Ok(cli) => cli,
        Err(err)
            if err.kind() == ErrorKind::DisplayHelp || err.kind() == ErrorKind::DisplayVersion =>
        {
            let _ = err.print();
            return;
        }
        Err(_) => {
            eprintln!("Usage: nox [script]");
            std::process::exit(64);
        }
    };

    match cli.script {
        Some(path) => run_script(&path, cli.debug, cli.disassemble),
        None => run_repl(cli.debug),
    }
}

fn run_script(filename: &str, debug_mode: bool, dump_bytecode: bool) {
    let source = match std::fs::read_to_string(filename) {
        Ok(source) => source,
        Err(_) => {
            eprintln!("Could not open file \"{}\".", filename);
            std::process::exit(74);
        }
    };

    let source_map = Arc::new(SourceMap::from_source(filename, source));
    let mut allocator = HeapAllocator::new().set_debug(debug_mode);

    let program = match CompilerPipeline::new().compile(&source_map, &mut allocator) {
        Ok(program) => program,
        Err(errors) => {
            for error in errors.all() {
                eprintln!("{}", error);
            }
            std::process::exit(65);
        }
    };

    if dump_bytecode {
        disassemble_program(&allocator);
    }

    match Vm::new(allocator).set_debug(debug_mode).interpret(program) {
        Ok(_) => (),
        Err(error) => {
            eprintln!("{}", error);
            std::process::exit(70);
        }
    }
}
