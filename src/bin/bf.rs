use std::{error, fs, io, process};

use bfkit::vm::VM;
use bfkit::{MAX_SOURCE_INTERP, VERSION_BANNER};
use clap::Parser;

/// Optimizing brainfuck bytecode interpreter.
#[derive(Debug, Parser)]
#[command(author, about)]
struct Args {
    /// Print the IR to stdout instead of executing
    #[arg(short = 'p', long = "print-ast")]
    print_ast: bool,

    /// Print the version banner and exit
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Brainfuck source file
    filename: Option<String>,
}

fn _main() -> Result<(), Box<dyn error::Error>> {
    let args = Args::parse();

    if args.version {
        println!("{VERSION_BANNER}");
        return Ok(());
    }

    let Some(filename) = args.filename else {
        eprintln!("Usage: bf [options] <infile>");
        return Err("no input file".into());
    };

    let source = fs::read(filename)?;
    let program = bfkit::compile(&source, MAX_SOURCE_INTERP)?;

    if args.print_ast {
        print!("{program}");
        return Ok(());
    }

    let mut vm = VM::new();
    vm.run(&program, &mut io::stdin().lock(), &mut io::stdout().lock())?;
    Ok(())
}

fn main() -> process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    match _main() {
        Ok(_) => process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            process::ExitCode::FAILURE
        }
    }
}
