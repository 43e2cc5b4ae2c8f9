/// x86-64 Linux code generation
///
/// Submodules:
/// - `buffer`: growable little-endian byte buffer with forward-jump labels
/// - `strings`: append-only pool of NUL-terminated rodata strings
/// - `instructions`: fixed x86-64 instruction encodings and syscall numbers
/// - `generator`: lowers a parsed Script to position-fixed machine code
mod buffer;
mod generator;
mod instructions;
mod strings;

pub use buffer::CodeBuf;
pub use generator::{generate, GeneratedCode, StringRelocation, BSS_BASE};
pub use strings::StringPool;
