use std::path::PathBuf;
use std::{error, fs, io, process};

use bfkit::codegen::{Aot, Jit};
use bfkit::vm::TAPE_SIZE;
use bfkit::{MAX_SOURCE_COMPILE, VERSION_BANNER};
use clap::Parser;

/// Ahead-of-time brainfuck compiler: emits a standalone executable, or JIT
/// interprets with `--execute`.
#[derive(Debug, Parser)]
#[command(author, about)]
struct Args {
    /// Print the generated code
    #[arg(short = 'd', long = "dump")]
    dump: bool,

    /// JIT interpret without creating an executable
    #[arg(short = 'e', long = "execute")]
    execute: bool,

    /// Target executable filename
    #[arg(short = 'o', long = "outfile", default_value = "bf.out")]
    outfile: PathBuf,

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
        eprintln!("Usage: bfaot [options] [-o outfile] <infile>");
        return Err("no input file".into());
    };

    let source = fs::read(filename)?;
    let program = bfkit::compile(&source, MAX_SOURCE_COMPILE)?;

    if args.execute {
        let jit = Jit::compile(&program)?;
        if args.dump {
            print!("{}", jit.clif());
        }
        let mut tape = vec![0u8; TAPE_SIZE];
        jit.run(&mut tape);
    } else {
        let aot = Aot::compile(&program)?;
        if args.dump {
            print!("{}", aot.clif());
        }
        aot.link(&args.outfile)?;
    }
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
