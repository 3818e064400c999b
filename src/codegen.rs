//! Lowers the frozen IR to native code through Cranelift.
//!
//! The same lowering serves both backends: `JITModule` for compile-and-call
//! in process and `ObjectModule` for the ahead-of-time path, which also
//! generates a `main` so the linked artifact runs standalone. All
//! brainfuck-level optimization happened in the parser; Cranelift is a dumb
//! lowering target with its own optimizer downstream.

use std::fs;
use std::mem;
use std::path::Path;
use std::process::Command;

use cranelift::codegen::ir::UserFuncName;
use cranelift::codegen::isa::OwnedTargetIsa;
use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, FuncId, Linkage, Module, ModuleError};
use cranelift_object::{ObjectBuilder, ObjectModule};
use tracing::debug;

use crate::ir::{Op, Program};
use crate::vm::TAPE_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("native codegen unavailable: {0}")]
    Isa(String),

    #[error(transparent)]
    Module(#[from] ModuleError),

    #[error("object emission failed: {0}")]
    Object(String),

    #[error("linker failed: {0}")]
    Link(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

fn native_isa(pic: bool) -> Result<OwnedTargetIsa, CodegenError> {
    let mut flags = settings::builder();
    flags
        .set("opt_level", "speed")
        .map_err(|e| CodegenError::Isa(e.to_string()))?;
    if pic {
        flags
            .set("is_pic", "true")
            .map_err(|e| CodegenError::Isa(e.to_string()))?;
    }
    cranelift_native::builder()
        .map_err(|e| CodegenError::Isa(e.to_string()))?
        .finish(settings::Flags::new(flags))
        .map_err(|e| CodegenError::Isa(e.to_string()))
}

struct IoFns {
    putchar: FuncId,
    getchar: FuncId,
}

fn declare_io(module: &mut impl Module) -> Result<IoFns, ModuleError> {
    let mut put_sig = module.make_signature();
    put_sig.params.push(AbiParam::new(types::I32));
    put_sig.returns.push(AbiParam::new(types::I32));
    let putchar = module.declare_function("putchar", Linkage::Import, &put_sig)?;

    let mut get_sig = module.make_signature();
    get_sig.returns.push(AbiParam::new(types::I32));
    let getchar = module.declare_function("getchar", Linkage::Import, &get_sig)?;

    Ok(IoFns { putchar, getchar })
}

// Every op moves the index before its effect; a zero delta emits nothing.
fn bump_index(builder: &mut FunctionBuilder, index: Variable, delta: isize) {
    if delta != 0 {
        let i = builder.use_var(index);
        let moved = builder.ins().iadd_imm(i, delta as i64);
        builder.def_var(index, moved);
    }
}

fn cell_addr(builder: &mut FunctionBuilder, tape: Value, index: Variable) -> Value {
    let i = builder.use_var(index);
    builder.ins().iadd(tape, i)
}

fn load_cell(builder: &mut FunctionBuilder, tape: Value, index: Variable) -> (Value, Value) {
    let addr = cell_addr(builder, tape, index);
    let cell = builder.ins().load(types::I8, MemFlags::trusted(), addr, 0);
    (addr, cell)
}

// Open loops, the codegen twin of the parser's bracket stack.
struct LoopBlocks {
    cond: Block,
    end: Block,
}

/// Build `bf_program(tape: *mut u8)` into `ctx` and declare it in `module`.
fn lower_program(
    module: &mut impl Module,
    ctx: &mut cranelift::codegen::Context,
    io: &IoFns,
    program: &Program,
) -> Result<FuncId, CodegenError> {
    let ptr_type = module.target_config().pointer_type();

    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(ptr_type));
    let func_id = module.declare_function("bf_program", Linkage::Export, &sig)?;
    ctx.func.signature = sig;
    ctx.func.name = UserFuncName::testcase("bf_program");

    let mut fbc = FunctionBuilderContext::new();
    let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fbc);

    let putchar = module.declare_func_in_func(io.putchar, builder.func);
    let getchar = module.declare_func_in_func(io.getchar, builder.func);

    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    builder.seal_block(entry);

    let tape = builder.block_params(entry)[0];
    let index = Variable::new(0);
    builder.declare_var(index, ptr_type);
    let zero = builder.ins().iconst(ptr_type, 0);
    builder.def_var(index, zero);

    let mut loops: Vec<LoopBlocks> = Vec::new();

    for &op in program.ops() {
        match op {
            Op::Add(n, off) => {
                bump_index(&mut builder, index, off);
                let (addr, cell) = load_cell(&mut builder, tape, index);
                // i8 immediates must be sign-extended for the verifier.
                let amount = builder.ins().iconst(types::I8, n as i8 as i64);
                let sum = builder.ins().iadd(cell, amount);
                builder.ins().store(MemFlags::trusted(), sum, addr, 0);
            }
            Op::Sub(n, off) => {
                bump_index(&mut builder, index, off);
                let (addr, cell) = load_cell(&mut builder, tape, index);
                let amount = builder.ins().iconst(types::I8, n as i8 as i64);
                let diff = builder.ins().isub(cell, amount);
                builder.ins().store(MemFlags::trusted(), diff, addr, 0);
            }
            Op::Zero(off) => {
                bump_index(&mut builder, index, off);
                let addr = cell_addr(&mut builder, tape, index);
                let nil = builder.ins().iconst(types::I8, 0);
                builder.ins().store(MemFlags::trusted(), nil, addr, 0);
            }
            Op::Put(off) => {
                bump_index(&mut builder, index, off);
                let (_, cell) = load_cell(&mut builder, tape, index);
                let arg = builder.ins().uextend(types::I32, cell);
                builder.ins().call(putchar, &[arg]);
            }
            Op::Read(off) => {
                bump_index(&mut builder, index, off);
                let call = builder.ins().call(getchar, &[]);
                let ret = builder.inst_results(call)[0];
                // getchar's EOF (-1) truncates to 0xff.
                let byte = builder.ins().ireduce(types::I8, ret);
                let addr = cell_addr(&mut builder, tape, index);
                builder.ins().store(MemFlags::trusted(), byte, addr, 0);
            }
            Op::Scan(stride, off) => {
                bump_index(&mut builder, index, off);

                let cond = builder.create_block();
                let body = builder.create_block();
                let exit = builder.create_block();

                builder.ins().jump(cond, &[]);
                builder.switch_to_block(cond);
                let (_, cell) = load_cell(&mut builder, tape, index);
                builder.ins().brif(cell, body, &[], exit, &[]);

                builder.switch_to_block(body);
                builder.seal_block(body);
                bump_index(&mut builder, index, stride);
                builder.ins().jump(cond, &[]);
                builder.seal_block(cond);

                builder.switch_to_block(exit);
                builder.seal_block(exit);
            }
            Op::JmpFwd(_, off) => {
                bump_index(&mut builder, index, off);

                let cond = builder.create_block();
                let body = builder.create_block();
                let end = builder.create_block();

                builder.ins().jump(cond, &[]);
                builder.switch_to_block(cond);
                let (_, cell) = load_cell(&mut builder, tape, index);
                builder.ins().brif(cell, body, &[], end, &[]);

                builder.switch_to_block(body);
                builder.seal_block(body);
                loops.push(LoopBlocks { cond, end });
            }
            Op::JmpBck(_, off) => {
                let LoopBlocks { cond, end } = loops
                    .pop()
                    .expect("parser emits balanced jump pairs");
                bump_index(&mut builder, index, off);
                builder.ins().jump(cond, &[]);
                builder.seal_block(cond);

                builder.switch_to_block(end);
                builder.seal_block(end);
            }
            Op::End => {
                builder.ins().return_(&[]);
            }
        }
    }

    debug_assert!(loops.is_empty());
    builder.finalize();
    Ok(func_id)
}

/// Build the standalone `main`: zero a stack tape, call `bf_program`,
/// return 0.
fn lower_main(
    module: &mut ObjectModule,
    ctx: &mut cranelift::codegen::Context,
    bf_program: FuncId,
) -> Result<FuncId, CodegenError> {
    let ptr_type = module.target_config().pointer_type();

    let mut sig = module.make_signature();
    sig.returns.push(AbiParam::new(types::I32));
    let main_id = module.declare_function("main", Linkage::Export, &sig)?;
    ctx.func.signature = sig;
    ctx.func.name = UserFuncName::testcase("main");

    // void *memset(void *s, int c, size_t n)
    let mut memset_sig = module.make_signature();
    memset_sig.params.push(AbiParam::new(ptr_type));
    memset_sig.params.push(AbiParam::new(types::I32));
    memset_sig.params.push(AbiParam::new(ptr_type));
    memset_sig.returns.push(AbiParam::new(ptr_type));
    let memset_id = module.declare_function("memset", Linkage::Import, &memset_sig)?;

    let mut fbc = FunctionBuilderContext::new();
    let mut builder = FunctionBuilder::new(&mut ctx.func, &mut fbc);

    let memset = module.declare_func_in_func(memset_id, builder.func);
    let bf = module.declare_func_in_func(bf_program, builder.func);

    let block = builder.create_block();
    builder.switch_to_block(block);
    builder.seal_block(block);

    let slot = builder.create_sized_stack_slot(StackSlotData::new(
        StackSlotKind::ExplicitSlot,
        TAPE_SIZE as u32,
        0,
    ));
    let tape = builder.ins().stack_addr(ptr_type, slot, 0);
    let fill = builder.ins().iconst(types::I32, 0);
    let size = builder.ins().iconst(ptr_type, TAPE_SIZE as i64);
    builder.ins().call(memset, &[tape, fill, size]);
    builder.ins().call(bf, &[tape]);

    let status = builder.ins().iconst(types::I32, 0);
    builder.ins().return_(&[status]);
    builder.finalize();
    Ok(main_id)
}

/// An in-process compilation: the generated function plus the module that
/// owns its memory.
pub struct Jit {
    module: JITModule,
    entry: FuncId,
    clif: String,
}

impl Jit {
    pub fn compile(program: &Program) -> Result<Self, CodegenError> {
        let isa = native_isa(false)?;
        let mut jb = JITBuilder::with_isa(isa, default_libcall_names());
        jb.symbol("putchar", libc::putchar as *const u8);
        jb.symbol("getchar", libc::getchar as *const u8);
        let mut module = JITModule::new(jb);

        let io = declare_io(&mut module)?;
        let mut ctx = module.make_context();
        let entry = lower_program(&mut module, &mut ctx, &io, program)?;
        let clif = ctx.func.display().to_string();
        module.define_function(entry, &mut ctx)?;
        module.clear_context(&mut ctx);
        module.finalize_definitions()?;

        debug!(ops = program.ops().len(), "jit compilation finished");
        Ok(Self {
            module,
            entry,
            clif,
        })
    }

    /// Textual Cranelift IR of the generated function.
    pub fn clif(&self) -> &str {
        &self.clif
    }

    /// Invoke the generated function over `tape`. The tape must span
    /// `TAPE_SIZE` cells; the generated code performs no bounds checks.
    pub fn run(&self, tape: &mut [u8]) {
        assert!(tape.len() >= TAPE_SIZE);
        let code = self.module.get_finalized_function(self.entry);
        let bf_program: unsafe extern "C" fn(*mut u8) = unsafe { mem::transmute(code) };
        unsafe { bf_program(tape.as_mut_ptr()) }
    }
}

/// An ahead-of-time compilation: a relocatable object holding `bf_program`
/// and a `main` that drives it.
pub struct Aot {
    object: Vec<u8>,
    clif: String,
}

impl Aot {
    pub fn compile(program: &Program) -> Result<Self, CodegenError> {
        let isa = native_isa(true)?;
        let ob = ObjectBuilder::new(isa, "bf", default_libcall_names())?;
        let mut module = ObjectModule::new(ob);

        let io = declare_io(&mut module)?;
        let mut ctx = module.make_context();
        let entry = lower_program(&mut module, &mut ctx, &io, program)?;
        let mut clif = ctx.func.display().to_string();
        module.define_function(entry, &mut ctx)?;
        module.clear_context(&mut ctx);

        let main_id = lower_main(&mut module, &mut ctx, entry)?;
        clif.push('\n');
        clif.push_str(&ctx.func.display().to_string());
        module.define_function(main_id, &mut ctx)?;
        module.clear_context(&mut ctx);

        let object = module
            .finish()
            .emit()
            .map_err(|e| CodegenError::Object(e.to_string()))?;

        debug!(bytes = object.len(), "object emitted");
        Ok(Self { object, clif })
    }

    /// Textual Cranelift IR of `bf_program` and the generated `main`.
    pub fn clif(&self) -> &str {
        &self.clif
    }

    pub fn object(&self) -> &[u8] {
        &self.object
    }

    /// Link the object into a standalone executable at `outfile` with the
    /// system C compiler, which also resolves putchar/getchar/memset.
    pub fn link(&self, outfile: &Path) -> Result<(), CodegenError> {
        let dir = tempfile::tempdir()?;
        let obj_path = dir.path().join("bf.o");
        fs::write(&obj_path, &self.object)?;

        let status = Command::new("cc")
            .arg(&obj_path)
            .arg("-o")
            .arg(outfile)
            .status()?;
        if !status.success() {
            return Err(CodegenError::Link(format!("cc exited with {status}")));
        }

        debug!(outfile = %outfile.display(), "executable linked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::VM;
    use crate::{parser, token};

    fn parse(source: &str) -> Program {
        parser::compile(&token::tokenize(source.as_bytes())).unwrap()
    }

    fn jit_tape(source: &str) -> Vec<u8> {
        let jit = Jit::compile(&parse(source)).unwrap();
        let mut tape = vec![0u8; TAPE_SIZE];
        jit.run(&mut tape);
        tape
    }

    #[test]
    fn jit_applies_offsets_and_runs() {
        let tape = jit_tape("+++>++");
        assert_eq!(&tape[..3], &[3, 2, 0]);
    }

    #[test]
    fn jit_zeroes_cells() {
        let jit = Jit::compile(&parse("+++++[-]>++")).unwrap();
        let mut tape = vec![0u8; TAPE_SIZE];
        jit.run(&mut tape);
        assert_eq!(&tape[..2], &[0, 2]);
    }

    #[test]
    fn jit_scan_lands_on_first_zero_cell() {
        let tape = jit_tape("+++>+++>+++<<[>]+");
        assert_eq!(&tape[..5], &[3, 3, 3, 1, 0]);
    }

    #[test]
    fn jit_and_interpreter_agree_on_tape_state() {
        let source = "++[>+++<-]>+[<++>-]";
        let program = parse(source);

        let mut vm = VM::new();
        let mut input: &[u8] = b"";
        let mut output = Vec::new();
        vm.run(&program, &mut input, &mut output).unwrap();

        let jit = Jit::compile(&program).unwrap();
        let mut tape = vec![0u8; TAPE_SIZE];
        jit.run(&mut tape);

        assert_eq!(vm.tape()[..8], tape[..8]);
    }

    #[test]
    fn clif_calls_host_io_and_branches() {
        let jit = Jit::compile(&parse(",[.,]")).unwrap();
        let clif = jit.clif();
        assert!(clif.contains("%bf_program"));
        assert!(clif.contains("call"));
        assert!(clif.contains("brif"));
    }

    #[test]
    fn aot_emits_object_with_main() {
        let aot = Aot::compile(&parse("+[>+<-]")).unwrap();
        assert!(!aot.object().is_empty());
        assert!(aot.clif().contains("%bf_program"));
        assert!(aot.clif().contains("%main"));
        assert!(aot.clif().contains("explicit_slot 30000"));
    }
}
