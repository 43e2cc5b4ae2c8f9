/// x86-64 instruction emitters
///
/// Each helper appends one fixed encoding to the code buffer. Registers are
/// baked into the opcode bytes; only the handful of forms the generator
/// needs exist here.
use super::buffer::{CodeBuf, Label};

// Linux x86-64 syscall numbers
pub const SYS_WRITE: u32 = 1;
pub const SYS_CLOSE: u32 = 3;
pub const SYS_PIPE: u32 = 22;
pub const SYS_DUP2: u32 = 33;
pub const SYS_FORK: u32 = 57;
pub const SYS_EXECVE: u32 = 59;
pub const SYS_EXIT: u32 = 60;
pub const SYS_WAIT4: u32 = 61;
pub const SYS_CHDIR: u32 = 80;
pub const SYS_OPENAT: u32 = 257;

/// mov rax, imm32 (sign-extended)
pub fn mov_rax_imm32(code: &mut CodeBuf, imm: u32) {
    code.extend(&[0x48, 0xc7, 0xc0]);
    code.push_u32(imm);
}

pub fn mov_rdi_imm64(code: &mut CodeBuf, imm: u64) {
    code.extend(&[0x48, 0xbf]);
    code.push_u64(imm);
}

pub fn mov_rsi_imm64(code: &mut CodeBuf, imm: u64) {
    code.extend(&[0x48, 0xbe]);
    code.push_u64(imm);
}

pub fn mov_rdx_imm64(code: &mut CodeBuf, imm: u64) {
    code.extend(&[0x48, 0xba]);
    code.push_u64(imm);
}

pub fn mov_r10_imm64(code: &mut CodeBuf, imm: u64) {
    code.extend(&[0x49, 0xba]);
    code.push_u64(imm);
}

/// mov rdi, imm64 with a zeroed immediate. Returns the offset of the 8-byte
/// slot so the caller can record a string relocation against it.
pub fn mov_rdi_imm64_slot(code: &mut CodeBuf) -> usize {
    code.extend(&[0x48, 0xbf]);
    let at = code.len();
    code.push_u64(0);
    at
}

pub fn mov_rsi_imm64_slot(code: &mut CodeBuf) -> usize {
    code.extend(&[0x48, 0xbe]);
    let at = code.len();
    code.push_u64(0);
    at
}

pub fn mov_rax_imm64_slot(code: &mut CodeBuf) -> usize {
    code.extend(&[0x48, 0xb8]);
    let at = code.len();
    code.push_u64(0);
    at
}

pub fn xor_rsi_rsi(code: &mut CodeBuf) {
    code.extend(&[0x48, 0x31, 0xf6]);
}

pub fn xor_rdx_rdx(code: &mut CodeBuf) {
    code.extend(&[0x48, 0x31, 0xd2]);
}

pub fn xor_r10_r10(code: &mut CodeBuf) {
    code.extend(&[0x4d, 0x31, 0xd2]);
}

pub fn mov_rdi_rax(code: &mut CodeBuf) {
    code.extend(&[0x48, 0x89, 0xc7]);
}

pub fn mov_rsi_rdi(code: &mut CodeBuf) {
    code.extend(&[0x48, 0x89, 0xfe]);
}

/// mov eax, dword [rdi] (zero-extends into rax)
pub fn mov_eax_mem_rdi(code: &mut CodeBuf) {
    code.extend(&[0x8b, 0x07]);
}

/// mov rax, qword [rdi]
pub fn mov_rax_mem_rdi(code: &mut CodeBuf) {
    code.extend(&[0x48, 0x8b, 0x07]);
}

/// mov qword [rdi], rax
pub fn mov_mem_rdi_rax(code: &mut CodeBuf) {
    code.extend(&[0x48, 0x89, 0x07]);
}

/// mov qword [rdi + disp32], rax
pub fn mov_mem_rdi_disp32_rax(code: &mut CodeBuf, disp: u32) {
    code.extend(&[0x48, 0x89, 0x87]);
    code.push_u32(disp);
}

/// cmp rax, imm8 (sign-extended)
pub fn cmp_rax_imm8(code: &mut CodeBuf, imm: i8) {
    code.extend(&[0x48, 0x83, 0xf8, imm as u8]);
}

pub fn test_rax_rax(code: &mut CodeBuf) {
    code.extend(&[0x48, 0x85, 0xc0]);
}

pub fn syscall(code: &mut CodeBuf) {
    code.extend(&[0x0f, 0x05]);
}

/// mov rax, nr; syscall
pub fn emit_syscall(code: &mut CodeBuf, nr: u32) {
    mov_rax_imm32(code, nr);
    syscall(code);
}

/// je rel32 with the displacement left for the returned label
pub fn je(code: &mut CodeBuf) -> Label {
    code.extend(&[0x0f, 0x84]);
    code.reserve_rel32()
}

/// jne rel32 with the displacement left for the returned label
pub fn jne(code: &mut CodeBuf) -> Label {
    code.extend(&[0x0f, 0x85]);
    code.reserve_rel32()
}
