/// Lowers a parsed Script to position-fixed x86-64 machine code.
///
/// All mutable compilation state lives on one aggregate: the code buffer,
/// the string pool, the relocation list, and the BSS cursor. BSS slots get
/// absolute `BSS_BASE + offset` addresses at emission time; string addresses
/// are emitted as zeroed placeholders and patched by the ELF writer once the
/// rodata base is final.
use tracing::debug;

use super::buffer::CodeBuf;
use super::instructions as insn;
use super::strings::StringPool;
use crate::ast::{Builtin, Pipeline, Script, Stage};

/// Base virtual address of the zero-initialized RW segment.
pub const BSS_BASE: u64 = 0x600000;

// openat(2) values used for redirections
const AT_FDCWD: i64 = -100;
const O_WRONLY: u64 = 1;
const O_CREAT: u64 = 64;
const O_TRUNC: u64 = 512;
const O_APPEND: u64 = 1024;

fn bss_addr(off: usize) -> u64 {
    BSS_BASE + off as u64
}

/// An 8-byte slot in the code stream to be patched with the runtime address
/// of a pooled string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StringRelocation {
    pub offset: usize,
    pub index: usize,
}

/// Everything the ELF writer needs: finished code, the rodata image, the
/// slots to patch, and the BSS high-water mark.
#[derive(Debug)]
pub struct GeneratedCode {
    pub code: Vec<u8>,
    pub pool: StringPool,
    pub relocations: Vec<StringRelocation>,
    pub bss_size: usize,
}

/// Compile a script to machine code plus its relocation records.
pub fn generate(script: &Script) -> GeneratedCode {
    let mut gen = X86CodeGen::new();
    gen.generate(script);
    gen.into_generated_code()
}

struct X86CodeGen {
    code: CodeBuf,
    pool: StringPool,
    relocations: Vec<StringRelocation>,
    bss_off: usize,
}

impl X86CodeGen {
    fn new() -> Self {
        X86CodeGen {
            code: CodeBuf::new(),
            pool: StringPool::new(),
            relocations: Vec::new(),
            bss_off: 0,
        }
    }

    fn generate(&mut self, script: &Script) {
        for pipeline in &script.pipelines {
            if pipeline.stages.len() == 1 {
                self.emit_single(&pipeline.stages[0]);
            } else {
                self.emit_pipeline(pipeline);
            }
        }
        insn::mov_rdi_imm64(&mut self.code, 0);
        insn::emit_syscall(&mut self.code, insn::SYS_EXIT);
        debug!(
            code_bytes = self.code.len(),
            strings = self.pool.count(),
            rodata_bytes = self.pool.len(),
            bss_bytes = self.bss_off,
            relocations = self.relocations.len(),
            "generated script code"
        );
    }

    fn into_generated_code(self) -> GeneratedCode {
        GeneratedCode {
            code: self.code.finish(),
            pool: self.pool,
            relocations: self.relocations,
            bss_size: self.bss_off,
        }
    }

    fn alloc_bss(&mut self, size: usize) -> usize {
        let off = self.bss_off;
        self.bss_off += size;
        off
    }

    fn load_str_rdi(&mut self, index: usize) {
        let offset = insn::mov_rdi_imm64_slot(&mut self.code);
        self.relocations.push(StringRelocation { offset, index });
    }

    fn load_str_rsi(&mut self, index: usize) {
        let offset = insn::mov_rsi_imm64_slot(&mut self.code);
        self.relocations.push(StringRelocation { offset, index });
    }

    fn load_str_rax(&mut self, index: usize) {
        let offset = insn::mov_rax_imm64_slot(&mut self.code);
        self.relocations.push(StringRelocation { offset, index });
    }

    /// write(1, s, len(s)) with s placed in the pool
    fn write_literal(&mut self, s: &[u8]) {
        let index = self.pool.add(s);
        self.load_str_rsi(index);
        insn::mov_rdi_imm64(&mut self.code, 1);
        insn::mov_rdx_imm64(&mut self.code, s.len() as u64);
        insn::emit_syscall(&mut self.code, insn::SYS_WRITE);
    }

    /// One-stage pipeline. Builtins run inline in the main process so that
    /// `cd` and `exit` affect everything that follows; a builtin carrying a
    /// redirection runs in a child instead, keeping the dup2 away from the
    /// parent's descriptors.
    fn emit_single(&mut self, stage: &Stage) {
        match Builtin::lookup(&stage.argv[0]) {
            Some(builtin) if !stage.has_redir() => self.emit_builtin(builtin, stage),
            Some(builtin) => self.emit_forked_builtin(builtin, stage),
            None => self.emit_simple_command(stage),
        }
    }

    fn emit_builtin(&mut self, builtin: Builtin, stage: &Stage) {
        match builtin {
            Builtin::Echo => {
                let args = &stage.argv[1..];
                for (i, arg) in args.iter().enumerate() {
                    self.write_literal(arg);
                    if i + 1 < args.len() {
                        self.write_literal(b" ");
                    }
                }
                self.write_literal(b"\n");
            }
            Builtin::Cd => {
                if let Some(dir) = stage.argv.get(1) {
                    let index = self.pool.add(dir);
                    self.load_str_rdi(index);
                    insn::emit_syscall(&mut self.code, insn::SYS_CHDIR);
                }
            }
            Builtin::Exit => {
                insn::mov_rdi_imm64(&mut self.code, 0);
                insn::emit_syscall(&mut self.code, insn::SYS_EXIT);
            }
        }
    }

    fn emit_forked_builtin(&mut self, builtin: Builtin, stage: &Stage) {
        insn::emit_syscall(&mut self.code, insn::SYS_FORK);
        insn::cmp_rax_imm8(&mut self.code, 0);
        let parent = insn::jne(&mut self.code);
        self.emit_redirs(stage);
        self.emit_builtin(builtin, stage);
        insn::mov_rdi_imm64(&mut self.code, 0);
        insn::emit_syscall(&mut self.code, insn::SYS_EXIT);
        self.code.bind(parent);
        self.emit_wait_on_rax();
    }

    /// Fork; the child applies redirections and execs, the parent waits on
    /// the pid still sitting in rax.
    fn emit_simple_command(&mut self, stage: &Stage) {
        let envp_off = self.alloc_bss(8);
        let argv_off = self.alloc_bss(8 * (stage.argv.len() + 1));
        insn::emit_syscall(&mut self.code, insn::SYS_FORK);
        insn::cmp_rax_imm8(&mut self.code, 0);
        let parent = insn::jne(&mut self.code);
        self.emit_redirs(stage);
        self.emit_exec(stage, argv_off, envp_off);
        self.code.bind(parent);
        self.emit_wait_on_rax();
    }

    /// wait4(rax, 0, 0, 0), status discarded
    fn emit_wait_on_rax(&mut self) {
        insn::mov_rdi_rax(&mut self.code);
        insn::xor_rsi_rsi(&mut self.code);
        insn::xor_rdx_rdx(&mut self.code);
        insn::xor_r10_r10(&mut self.code);
        insn::emit_syscall(&mut self.code, insn::SYS_WAIT4);
    }

    /// Per-stage stdin/stdout redirections. Open results are not checked; a
    /// failed openat hands a negative fd to dup2, which fails silently. The
    /// kernel preserves rdi across syscall, so the close after each dup2
    /// still takes the opened descriptor, not the dup2 return.
    fn emit_redirs(&mut self, stage: &Stage) {
        if let Some(path) = &stage.in_redir {
            let index = self.pool.add(path);
            insn::mov_rdi_imm64(&mut self.code, AT_FDCWD as u64);
            self.load_str_rsi(index);
            insn::mov_rdx_imm64(&mut self.code, 0);
            insn::xor_r10_r10(&mut self.code);
            insn::emit_syscall(&mut self.code, insn::SYS_OPENAT);
            insn::mov_rdi_rax(&mut self.code);
            insn::mov_rsi_imm64(&mut self.code, 0);
            insn::emit_syscall(&mut self.code, insn::SYS_DUP2);
            insn::emit_syscall(&mut self.code, insn::SYS_CLOSE);
        }
        if let Some(path) = &stage.out_redir {
            let index = self.pool.add(path);
            let flags =
                O_WRONLY | O_CREAT | if stage.out_append { O_APPEND } else { O_TRUNC };
            insn::mov_rdi_imm64(&mut self.code, AT_FDCWD as u64);
            self.load_str_rsi(index);
            insn::mov_rdx_imm64(&mut self.code, flags);
            insn::mov_r10_imm64(&mut self.code, 0o644);
            insn::emit_syscall(&mut self.code, insn::SYS_OPENAT);
            insn::mov_rdi_rax(&mut self.code);
            insn::mov_rsi_imm64(&mut self.code, 1);
            insn::emit_syscall(&mut self.code, insn::SYS_DUP2);
            insn::emit_syscall(&mut self.code, insn::SYS_CLOSE);
        }
    }

    /// Fill the stage's BSS argv vector with relocated string addresses and
    /// a NULL terminator, leaving the vector address in rsi.
    fn build_argv(&mut self, argv_off: usize, args: &[usize]) {
        insn::mov_rdi_imm64(&mut self.code, bss_addr(argv_off));
        for (i, &index) in args.iter().enumerate() {
            self.load_str_rax(index);
            insn::mov_mem_rdi_disp32_rax(&mut self.code, (i * 8) as u32);
        }
        insn::mov_rax_imm32(&mut self.code, 0);
        insn::mov_mem_rdi_disp32_rax(&mut self.code, (args.len() * 8) as u32);
        insn::mov_rsi_rdi(&mut self.code);
    }

    /// execve with an empty environment. Commands containing a slash exec
    /// directly; anything else tries /bin/<cmd> and then /usr/bin/<cmd>.
    /// Either way a return from the last execve falls through to the failure
    /// report and exit(127).
    fn emit_exec(&mut self, stage: &Stage, argv_off: usize, envp_off: usize) {
        let args: Vec<usize> = stage.argv.iter().map(|a| self.pool.add(a)).collect();
        self.build_argv(argv_off, &args);
        insn::mov_rdx_imm64(&mut self.code, bss_addr(envp_off));
        let cmd = &stage.argv[0];
        if cmd.contains(&b'/') {
            let path = self.pool.add(cmd);
            self.load_str_rdi(path);
            insn::emit_syscall(&mut self.code, insn::SYS_EXECVE);
        } else {
            let first = self.pool.add(&[&b"/bin/"[..], cmd.as_slice()].concat());
            let second = self.pool.add(&[&b"/usr/bin/"[..], cmd.as_slice()].concat());
            self.load_str_rdi(first);
            insn::emit_syscall(&mut self.code, insn::SYS_EXECVE);
            // execve only returns on failure, and the branch target is the
            // very next instruction, so both candidates are always tried.
            insn::test_rax_rax(&mut self.code);
            let next = insn::jne(&mut self.code);
            self.code.bind(next);
            self.load_str_rdi(second);
            insn::emit_syscall(&mut self.code, insn::SYS_EXECVE);
        }
        self.write_literal(b"exec failed\n");
        insn::mov_rdi_imm64(&mut self.code, 127);
        insn::emit_syscall(&mut self.code, insn::SYS_EXIT);
    }

    fn emit_pipeline(&mut self, pipeline: &Pipeline) {
        let n = pipeline.stages.len();
        let envp_off = self.alloc_bss(8);
        let prev_read_off = self.alloc_bss(8);
        let pid_arr_off = self.alloc_bss(8 * n);
        let pipe_off = self.alloc_bss(2 * 4);

        // envp = NULL-terminated empty environment, prev_read = -1 sentinel
        insn::mov_rdi_imm64(&mut self.code, bss_addr(envp_off));
        insn::mov_rax_imm32(&mut self.code, 0);
        insn::mov_mem_rdi_rax(&mut self.code);
        insn::mov_rdi_imm64(&mut self.code, bss_addr(prev_read_off));
        insn::mov_rax_imm32(&mut self.code, u32::MAX);
        insn::mov_mem_rdi_rax(&mut self.code);

        for (i, stage) in pipeline.stages.iter().enumerate() {
            let has_next = i + 1 < n;
            if has_next {
                insn::mov_rdi_imm64(&mut self.code, bss_addr(pipe_off));
                insn::emit_syscall(&mut self.code, insn::SYS_PIPE);
            }
            insn::emit_syscall(&mut self.code, insn::SYS_FORK);
            insn::cmp_rax_imm8(&mut self.code, 0);
            let parent = insn::jne(&mut self.code);

            // child: wire stdin to the previous read end, stdout into the
            // fresh pipe, then drop every pipe fd this stage does not own
            if i > 0 {
                insn::mov_rdi_imm64(&mut self.code, bss_addr(prev_read_off));
                insn::mov_rax_mem_rdi(&mut self.code);
                insn::mov_rdi_rax(&mut self.code);
                insn::mov_rsi_imm64(&mut self.code, 0);
                insn::emit_syscall(&mut self.code, insn::SYS_DUP2);
                insn::mov_rdi_imm64(&mut self.code, bss_addr(prev_read_off));
                insn::mov_rax_mem_rdi(&mut self.code);
                insn::mov_rdi_rax(&mut self.code);
                insn::emit_syscall(&mut self.code, insn::SYS_CLOSE);
            }
            if has_next {
                insn::mov_rdi_imm64(&mut self.code, bss_addr(pipe_off + 4));
                insn::mov_eax_mem_rdi(&mut self.code);
                insn::mov_rdi_rax(&mut self.code);
                insn::mov_rsi_imm64(&mut self.code, 1);
                insn::emit_syscall(&mut self.code, insn::SYS_DUP2);
                insn::mov_rdi_imm64(&mut self.code, bss_addr(pipe_off));
                insn::mov_eax_mem_rdi(&mut self.code);
                insn::mov_rdi_rax(&mut self.code);
                insn::emit_syscall(&mut self.code, insn::SYS_CLOSE);
                insn::mov_rdi_imm64(&mut self.code, bss_addr(pipe_off + 4));
                insn::mov_eax_mem_rdi(&mut self.code);
                insn::mov_rdi_rax(&mut self.code);
                insn::emit_syscall(&mut self.code, insn::SYS_CLOSE);
            }
            self.emit_redirs(stage);
            match Builtin::lookup(&stage.argv[0]) {
                Some(builtin) => {
                    self.emit_builtin(builtin, stage);
                    insn::mov_rdi_imm64(&mut self.code, 0);
                    insn::emit_syscall(&mut self.code, insn::SYS_EXIT);
                }
                None => {
                    let argv_off = self.alloc_bss(8 * (stage.argv.len() + 1));
                    self.emit_exec(stage, argv_off, envp_off);
                }
            }

            // parent: record the pid, then roll the pipe's read end into
            // prev_read and drop the write end
            self.code.bind(parent);
            insn::mov_rdi_imm64(&mut self.code, bss_addr(pid_arr_off + i * 8));
            insn::mov_mem_rdi_rax(&mut self.code);
            if has_next {
                if i > 0 {
                    // the child owns its copy of the old read end now
                    insn::mov_rdi_imm64(&mut self.code, bss_addr(prev_read_off));
                    insn::mov_rax_mem_rdi(&mut self.code);
                    insn::mov_rdi_rax(&mut self.code);
                    insn::emit_syscall(&mut self.code, insn::SYS_CLOSE);
                }
                insn::mov_rdi_imm64(&mut self.code, bss_addr(pipe_off));
                insn::mov_eax_mem_rdi(&mut self.code);
                insn::mov_rdi_imm64(&mut self.code, bss_addr(prev_read_off));
                insn::mov_mem_rdi_rax(&mut self.code);
                insn::mov_rdi_imm64(&mut self.code, bss_addr(pipe_off + 4));
                insn::mov_eax_mem_rdi(&mut self.code);
                insn::mov_rdi_rax(&mut self.code);
                insn::emit_syscall(&mut self.code, insn::SYS_CLOSE);
            }
        }

        // close the final read end unless the sentinel survived
        insn::mov_rdi_imm64(&mut self.code, bss_addr(prev_read_off));
        insn::mov_rax_mem_rdi(&mut self.code);
        insn::cmp_rax_imm8(&mut self.code, -1);
        let skip = insn::je(&mut self.code);
        insn::mov_rdi_rax(&mut self.code);
        insn::emit_syscall(&mut self.code, insn::SYS_CLOSE);
        self.code.bind(skip);

        // reap every stage in fork order
        for i in 0..n {
            insn::mov_rdi_imm64(&mut self.code, bss_addr(pid_arr_off + i * 8));
            insn::mov_rax_mem_rdi(&mut self.code);
            self.emit_wait_on_rax();
        }
    }
}
