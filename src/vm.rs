use std::io;

use crate::ir::{Op, Program};

pub const TAPE_SIZE: usize = 30000;

// getchar's -1 stored into an unsigned cell.
const EOF_CELL: u8 = 0xff;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("tape pointer out of range")]
    PointerOutOfRange,

    #[error("cell overflow")]
    Overflow,

    #[error("cell underflow")]
    Underflow,
}

pub struct VM {
    tape: [u8; TAPE_SIZE],
    ptr: usize,
    pc: usize,
}

impl Default for VM {
    fn default() -> Self {
        Self {
            tape: [0; TAPE_SIZE],
            ptr: 0,
            pc: 0,
        }
    }
}

impl VM {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tape(&self) -> &[u8] {
        &self.tape
    }

    /// Execute `program` to its `End`, reading from `reader` and writing to
    /// `writer`. Output is flushed once, at termination.
    pub fn run<R: io::Read, W: io::Write>(
        &mut self,
        program: &Program,
        reader: &mut R,
        writer: &mut W,
    ) -> Result<(), RuntimeError> {
        let ops = program.ops();
        let mut buf = [0u8; 1];

        loop {
            match ops[self.pc] {
                Op::End => break,
                Op::Add(n, off) => {
                    self.ptr = advance(self.ptr, off)?;
                    self.tape[self.ptr] = add_cell(self.tape[self.ptr], n)?;
                }
                Op::Sub(n, off) => {
                    self.ptr = advance(self.ptr, off)?;
                    self.tape[self.ptr] = sub_cell(self.tape[self.ptr], n)?;
                }
                Op::Zero(off) => {
                    self.ptr = advance(self.ptr, off)?;
                    self.tape[self.ptr] = 0;
                }
                Op::Put(off) => {
                    self.ptr = advance(self.ptr, off)?;
                    writer.write_all(&[self.tape[self.ptr]])?;
                }
                Op::Read(off) => {
                    self.ptr = advance(self.ptr, off)?;
                    self.tape[self.ptr] = match reader.read_exact(&mut buf) {
                        Ok(()) => buf[0],
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => EOF_CELL,
                        Err(e) => return Err(e.into()),
                    };
                }
                Op::Scan(stride, off) => {
                    self.ptr = advance(self.ptr, off)?;
                    while self.tape[self.ptr] != 0 {
                        self.ptr = advance(self.ptr, stride)?;
                    }
                }
                Op::JmpFwd(target, off) => {
                    self.ptr = advance(self.ptr, off)?;
                    if self.tape[self.ptr] == 0 {
                        self.pc = target;
                        continue;
                    }
                }
                Op::JmpBck(target, off) => {
                    self.ptr = advance(self.ptr, off)?;
                    if self.tape[self.ptr] != 0 {
                        self.pc = target;
                        continue;
                    }
                }
            }
            self.pc += 1;
        }

        writer.flush()?;
        Ok(())
    }
}

// Pointer excursions wrap around the tape, as on a torus.
#[cfg(not(feature = "strict"))]
fn advance(ptr: usize, delta: isize) -> Result<usize, RuntimeError> {
    Ok((ptr as isize + delta).rem_euclid(TAPE_SIZE as isize) as usize)
}

#[cfg(feature = "strict")]
fn advance(ptr: usize, delta: isize) -> Result<usize, RuntimeError> {
    let next = ptr as isize + delta;
    if (0..TAPE_SIZE as isize).contains(&next) {
        Ok(next as usize)
    } else {
        Err(RuntimeError::PointerOutOfRange)
    }
}

#[cfg(not(feature = "strict"))]
fn add_cell(cell: u8, n: u8) -> Result<u8, RuntimeError> {
    Ok(cell.wrapping_add(n))
}

#[cfg(feature = "strict")]
fn add_cell(cell: u8, n: u8) -> Result<u8, RuntimeError> {
    cell.checked_add(n).ok_or(RuntimeError::Overflow)
}

#[cfg(not(feature = "strict"))]
fn sub_cell(cell: u8, n: u8) -> Result<u8, RuntimeError> {
    Ok(cell.wrapping_sub(n))
}

#[cfg(feature = "strict")]
fn sub_cell(cell: u8, n: u8) -> Result<u8, RuntimeError> {
    cell.checked_sub(n).ok_or(RuntimeError::Underflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{parser, token};

    fn parse(source: &str) -> Program {
        parser::compile(&token::tokenize(source.as_bytes())).unwrap()
    }

    fn run(source: &str, input: &[u8]) -> Vec<u8> {
        let program = parse(source);
        let mut vm = VM::new();
        let mut input = input;
        let mut output = Vec::new();
        vm.run(&program, &mut input, &mut output).unwrap();
        output
    }

    #[test]
    fn empty_program_is_a_noop() {
        assert!(run("", b"").is_empty());
        assert!(run("only comments", b"").is_empty());
    }

    #[test]
    fn echoes_until_zero_byte() {
        assert_eq!(run(",[.,]", b"abc\0xyz"), b"abc");
    }

    #[test]
    fn read_on_eof_stores_0xff() {
        assert_eq!(run(",.", b""), [0xff]);
    }

    #[test]
    fn scan_lands_on_first_zero_cell() {
        // Three cells hold 3; the scan walks to the zero at index 3, which
        // is then bumped and printed.
        assert_eq!(run("+++>+++>+++<<[>]+.", b""), [0x01]);
    }

    #[test]
    fn fresh_tapes_yield_identical_output() {
        let a = run("++[>+++<-]>.", b"");
        let b = run("++[>+++<-]>.", b"");
        assert_eq!(a, [6]);
        assert_eq!(a, b);
    }

    #[cfg(not(feature = "strict"))]
    mod wrapping {
        use super::*;

        #[test]
        fn hello_world_short_form() {
            let source = "++++++++[>++++[>++>+++>+++>+<<<<-]>+>+>->>+[<]<-]>>.\
                          >---.+++++++..+++.>>.<-.<.+++.------.--------.>>+.>++.";
            assert_eq!(run(source, b""), b"Hello World!\n");
        }

        #[test]
        fn cells_wrap_modulo_256() {
            assert_eq!(run("-.", b""), [0xff]);
            assert_eq!(run("--+.", b""), [0xff]);
        }

        #[test]
        fn pointer_wraps_around_the_tape() {
            // One step left of cell 0 is the last cell.
            assert_eq!(run("<-.", b""), [0xff]);
        }
    }

    #[cfg(feature = "strict")]
    mod strict {
        use super::*;

        fn run_err(source: &str) -> RuntimeError {
            let program = parse(source);
            let mut vm = VM::new();
            let mut input: &[u8] = b"";
            let mut output = Vec::new();
            vm.run(&program, &mut input, &mut output).unwrap_err()
        }

        #[test]
        fn underflow_traps() {
            assert!(matches!(run_err("-"), RuntimeError::Underflow));
        }

        #[test]
        fn overflow_traps() {
            // The dot splits the run so the second add crosses 255 at
            // runtime rather than folding at parse time.
            let source = format!("{}.+", "+".repeat(255));
            assert!(matches!(run_err(&source), RuntimeError::Overflow));
        }

        #[test]
        fn pointer_excursion_traps() {
            assert!(matches!(run_err("<+"), RuntimeError::PointerOutOfRange));
        }
    }
}
