use crate::ir::{Op, Program};
use crate::token::Token;
use tracing::debug;

/// Maximum loop nesting depth. Mirrors the fixed-size bracket stack of the
/// runtime this compiler targets.
pub const MAX_NESTING: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("missing opening '['")]
    MissingOpen,

    #[error("missing closing ']'")]
    MissingClose,

    #[error("nested loops exceeded stack size")]
    TooDeep,

    #[error("source exceeds read limit ({size} > {limit} bytes)")]
    SourceTooLarge { size: usize, limit: usize },
}

/// Compile a token stream into the optimized IR.
///
/// Pointer moves are never emitted: `>`/`<` accumulate into `pending`, which
/// the next emitted instruction carries as its offset. A trailing run of
/// moves with no instruction after it is discarded. `[-]` collapses to
/// `Zero` and loops whose body is nothing but moves collapse to `Scan`;
/// every other bracket pair becomes a back-patched `JmpFwd`/`JmpBck` pair.
pub fn compile(tokens: &[Token]) -> Result<Program, ParseError> {
    let mut ops: Vec<Op> = Vec::new();
    let mut stack: Vec<usize> = Vec::new();
    let mut pending: isize = 0;
    let mut i = 0;

    while i < tokens.len() {
        match tokens[i] {
            Token::Right => pending += 1,
            Token::Left => pending -= 1,
            Token::Inc => match ops.last_mut() {
                Some(Op::Add(n, _)) if pending == 0 => *n = n.wrapping_add(1),
                _ => {
                    ops.push(Op::Add(1, pending));
                    pending = 0;
                }
            },
            Token::Dec => match ops.last_mut() {
                Some(Op::Sub(n, _)) if pending == 0 => *n = n.wrapping_add(1),
                _ => {
                    ops.push(Op::Sub(1, pending));
                    pending = 0;
                }
            },
            Token::Get => {
                ops.push(Op::Read(pending));
                pending = 0;
            }
            Token::Put => {
                ops.push(Op::Put(pending));
                pending = 0;
            }
            Token::Open => {
                if let [Token::Dec, Token::Close, ..] = &tokens[i + 1..] {
                    ops.push(Op::Zero(pending));
                    pending = 0;
                    i += 3;
                    continue;
                }
                if stack.len() == MAX_NESTING {
                    return Err(ParseError::TooDeep);
                }
                stack.push(ops.len());
                ops.push(Op::JmpFwd(0, pending)); // target patched at ']'
                pending = 0;
            }
            Token::Close => {
                let open = stack.pop().ok_or(ParseError::MissingOpen)?;
                let Op::JmpFwd(_, entry) = ops[open] else {
                    unreachable!("bracket stack only holds JmpFwd indices");
                };
                if open == ops.len() - 1 {
                    // The body produced no instructions, only a pointer
                    // delta: the loop is a scan.
                    ops[open] = Op::Scan(pending, entry);
                } else {
                    ops.push(Op::JmpBck(open + 1, pending));
                    ops[open] = Op::JmpFwd(ops.len(), entry);
                }
                pending = 0;
            }
        }
        i += 1;
    }

    if !stack.is_empty() {
        return Err(ParseError::MissingClose);
    }
    ops.push(Op::End);

    debug!(ops = ops.len(), "parse complete");
    Ok(Program::new(ops))
}
