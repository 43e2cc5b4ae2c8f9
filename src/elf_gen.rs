/// ELF64 executable emission
///
/// The output is a fixed two-segment image: an R-X segment holding the ELF
/// header, both program headers, the code, and the rodata string pool, and
/// an RW zero-fill segment for the scratch memory the generated code
/// addresses. String relocations are resolved here, once the rodata base is
/// final. No section header table is emitted.
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::debug;

use crate::codegen::{CodeBuf, GeneratedCode, BSS_BASE};

/// Base virtual address of the R-X segment.
pub const TEXT_BASE: u64 = 0x400000;

const EHDR_SIZE: usize = 0x40;
const PHDR_SIZE: usize = 0x38;
/// File offset of the first code byte: ELF header plus two program headers.
pub const CODE_OFFSET: usize = EHDR_SIZE + 2 * PHDR_SIZE;

/// Serialize the program and write it to `path` with mode 0755.
pub fn write_executable(program: &GeneratedCode, path: &Path) -> io::Result<()> {
    let image = build_image(program);
    let mut file = fs::File::create(path)?;
    file.write_all(&image)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

/// Lay out the complete file image and patch every string relocation.
pub fn build_image(program: &GeneratedCode) -> Vec<u8> {
    let code_len = program.code.len();
    let ro_len = program.pool.len();
    let ro_off = CODE_OFFSET + code_len;
    let ro_base_vaddr = TEXT_BASE + ro_off as u64;
    let entry = TEXT_BASE + CODE_OFFSET as u64;
    let bss_memsz = (program.bss_size as u64).max(0x1000);

    debug!(code_len, ro_len, bss_memsz, entry, "laying out ELF image");

    let mut image = CodeBuf::new();

    // ELF header
    image.extend(&[0x7f, b'E', b'L', b'F']);
    image.push(2); // EI_CLASS: 64-bit
    image.push(1); // EI_DATA: little endian
    image.push(1); // EI_VERSION
    image.extend(&[0; 9]); // EI_OSABI (System V) and padding
    image.push_u16(2); // e_type: ET_EXEC
    image.push_u16(0x3e); // e_machine: EM_X86_64
    image.push_u32(1); // e_version
    image.push_u64(entry); // e_entry
    image.push_u64(EHDR_SIZE as u64); // e_phoff
    image.push_u64(0); // e_shoff
    image.push_u32(0); // e_flags
    image.push_u16(EHDR_SIZE as u16); // e_ehsize
    image.push_u16(PHDR_SIZE as u16); // e_phentsize
    image.push_u16(2); // e_phnum
    image.push_u16(0); // e_shentsize
    image.push_u16(0); // e_shnum
    image.push_u16(0); // e_shstrndx

    // Program header 1: R-X text + rodata, mapped from file offset 0 so the
    // headers land inside the segment
    image.push_u32(1); // p_type: PT_LOAD
    image.push_u32(5); // p_flags: PF_R | PF_X
    image.push_u64(0); // p_offset
    image.push_u64(TEXT_BASE); // p_vaddr
    image.push_u64(TEXT_BASE); // p_paddr
    image.push_u64((code_len + ro_len) as u64); // p_filesz
    image.push_u64((code_len + ro_len) as u64); // p_memsz
    image.push_u64(0x1000); // p_align

    // Program header 2: RW zero-fill scratch segment, no file backing
    image.push_u32(1); // p_type: PT_LOAD
    image.push_u32(6); // p_flags: PF_R | PF_W
    image.push_u64(0); // p_offset
    image.push_u64(BSS_BASE); // p_vaddr
    image.push_u64(BSS_BASE); // p_paddr
    image.push_u64(0); // p_filesz
    image.push_u64(bss_memsz); // p_memsz
    image.push_u64(0x1000); // p_align

    image.extend(&program.code);
    image.extend(program.pool.as_bytes());

    // Patch every recorded slot with its string's final virtual address.
    for reloc in &program.relocations {
        let addr = ro_base_vaddr + program.pool.offset(reloc.index) as u64;
        image.put_u64_at(CODE_OFFSET + reloc.offset, addr);
    }

    image.finish()
}
