//! Brainfuck execution toolkit: a tokenizing, peephole-optimizing front end
//! shared by a bytecode interpreter, a Cranelift JIT, and an ahead-of-time
//! compiler that links standalone executables.

use std::{error, io};

pub mod codegen;
pub mod ir;
pub mod parser;
pub mod token;
pub mod vm;

pub use ir::{Op, Program};
pub use parser::ParseError;

/// Source caps, matching the historical read limits of each mode.
pub const MAX_SOURCE_INTERP: usize = 8 * 1024 * 1024;
pub const MAX_SOURCE_COMPILE: usize = 1024 * 1024;

/// The version banner: a brainfuck program that prints the crate version.
pub const VERSION_BANNER: &str = "++++++++[>++++++<-]>.--.+++.---.++.>++++++++++.";

/// Parse `source` into the optimized IR, rejecting oversize buffers.
pub fn compile(source: &[u8], max_size: usize) -> Result<Program, ParseError> {
    if source.len() > max_size {
        return Err(ParseError::SourceTooLarge {
            size: source.len(),
            limit: max_size,
        });
    }
    let tokens = token::tokenize(source);
    parser::compile(&tokens)
}

/// Interpret `source` over a fresh tape, reading from `reader` and writing
/// to `writer`.
pub fn run<R: io::Read, W: io::Write>(
    source: &[u8],
    reader: &mut R,
    writer: &mut W,
) -> Result<(), Box<dyn error::Error>> {
    let program = compile(source, MAX_SOURCE_INTERP)?;
    let mut vm = vm::VM::new();
    vm.run(&program, reader, writer)?;
    Ok(())
}

/// JIT-compile `source` and run it over a fresh tape, with I/O on the
/// process's stdin and stdout.
pub fn run_with_jit(source: &[u8]) -> Result<(), Box<dyn error::Error>> {
    let program = compile(source, MAX_SOURCE_COMPILE)?;
    let jit = codegen::Jit::compile(&program)?;
    let mut tape = vec![0u8; vm::TAPE_SIZE];
    jit.run(&mut tape);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_drives_the_full_pipeline() {
        let mut input: &[u8] = b"hi\0";
        let mut output = Vec::new();
        run(b",[.,]", &mut input, &mut output).unwrap();
        assert_eq!(output, b"hi");
    }

    #[test]
    fn version_banner_prints_the_crate_version() {
        let program = compile(VERSION_BANNER.as_bytes(), MAX_SOURCE_COMPILE).unwrap();
        let mut input: &[u8] = b"";
        let mut output = Vec::new();
        let mut vm = vm::VM::new();
        vm.run(&program, &mut input, &mut output).unwrap();
        assert_eq!(output, format!("{}\n", env!("CARGO_PKG_VERSION")).into_bytes());
    }

    #[test]
    fn oversize_source_is_rejected() {
        let big = vec![b'+'; 17];
        match compile(&big, 16) {
            Err(ParseError::SourceTooLarge { size: 17, limit: 16 }) => (),
            other => panic!("expected SourceTooLarge, got {other:?}"),
        }
    }
}
