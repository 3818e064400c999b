use std::{error, fs, io, process};

use bfkit::codegen::Jit;
use bfkit::vm::TAPE_SIZE;
use bfkit::{MAX_SOURCE_COMPILE, VERSION_BANNER};
use clap::Parser;

/// Brainfuck JIT compiler: lowers the IR to native code and runs it in
/// process.
#[derive(Debug, Parser)]
#[command(author, about)]
struct Args {
    /// Print the lowered Cranelift instructions
    #[arg(short = 'p', long = "print")]
    print: bool,

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
        eprintln!("Usage: bfjit [options] <infile>");
        return Err("no input file".into());
    };

    let source = fs::read(filename)?;
    let program = bfkit::compile(&source, MAX_SOURCE_COMPILE)?;
    let jit = Jit::compile(&program)?;

    if args.print {
        print!("{}", jit.clif());
    }

    let mut tape = vec![0u8; TAPE_SIZE];
    jit.run(&mut tape);
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
