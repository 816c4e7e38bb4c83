use elf::abi::{
    R_X86_64_32, R_X86_64_64, R_X86_64_COPY, R_X86_64_DTPMOD64, R_X86_64_DTPOFF64,
    R_X86_64_GLOB_DAT, R_X86_64_IRELATIVE, R_X86_64_JUMP_SLOT, R_X86_64_NONE, R_X86_64_PC32,
    R_X86_64_RELATIVE, R_X86_64_TPOFF64,
};

use super::{write_half, write_word, Applied, RelocBackend, RelocEntry, RelocSite, Resolver};
use crate::{tls::TlsVariant, RtldError};

pub(crate) const MINIMUM_TLS_ALIGNMENT: usize = 32;
pub(crate) const TLS_VARIANT: TlsVariant = TlsVariant::Variant2;
pub(crate) const MACHINE: u16 = elf::abi::EM_X86_64;

pub use elf::abi::R_X86_64_JUMP_SLOT as REL_PLT;

// Entered from PLT0 with the module cookie (GOT[1]) and the JMPREL index (pushed by the PLT
// stub) on the stack, above the caller's return address. Everything the callee may read as an
// argument is preserved across the call into the resolver.
core::arch::global_asm!(
    ".pushsection .text.__rtld_lazy_trampoline,\"ax\",@progbits",
    ".globl __rtld_lazy_trampoline",
    ".hidden __rtld_lazy_trampoline",
    ".type __rtld_lazy_trampoline,@function",
    ".p2align 4",
    "__rtld_lazy_trampoline:",
    "push rax",
    "push rcx",
    "push rdx",
    "push rsi",
    "push rdi",
    "push r8",
    "push r9",
    "push r10",
    "sub rsp, 136",
    "movdqu [rsp + 0], xmm0",
    "movdqu [rsp + 16], xmm1",
    "movdqu [rsp + 32], xmm2",
    "movdqu [rsp + 48], xmm3",
    "movdqu [rsp + 64], xmm4",
    "movdqu [rsp + 80], xmm5",
    "movdqu [rsp + 96], xmm6",
    "movdqu [rsp + 112], xmm7",
    "mov rdi, [rsp + 200]",
    "mov rsi, [rsp + 208]",
    "call {bind}",
    "mov r11, rax",
    "movdqu xmm0, [rsp + 0]",
    "movdqu xmm1, [rsp + 16]",
    "movdqu xmm2, [rsp + 32]",
    "movdqu xmm3, [rsp + 48]",
    "movdqu xmm4, [rsp + 64]",
    "movdqu xmm5, [rsp + 80]",
    "movdqu xmm6, [rsp + 96]",
    "movdqu xmm7, [rsp + 112]",
    "add rsp, 136",
    "pop r10",
    "pop r9",
    "pop r8",
    "pop rdi",
    "pop rsi",
    "pop rdx",
    "pop rcx",
    "pop rax",
    "add rsp, 16",
    "jmp r11",
    ".size __rtld_lazy_trampoline, . - __rtld_lazy_trampoline",
    ".popsection",
    bind = sym crate::context::rtld_lazy_bind,
);

extern "C" {
    fn __rtld_lazy_trampoline();
}

pub(crate) struct Backend;

impl RelocBackend for Backend {
    unsafe fn init_lazy(&self, got: *mut usize, cookie: usize) {
        got.add(1).write(cookie);
        got.add(2).write(__rtld_lazy_trampoline as usize);
    }

    unsafe fn apply(
        &self,
        rel: &RelocEntry,
        site: &RelocSite,
        resolve: &mut Resolver<'_>,
    ) -> Result<Applied, RtldError> {
        let target = site.target;
        let addend = site.addend;
        // This is where the magic happens.
        match rel.r_type {
            R_X86_64_NONE => {}
            R_X86_64_RELATIVE => {
                write_word(target, (site.bias as u64).wrapping_add_signed(addend));
            }
            R_X86_64_64 => {
                let sym = resolve()?;
                if sym.ifunc {
                    return Ok(Applied::Ifunc {
                        target: target as *mut usize,
                        resolver: sym.value,
                        addend,
                    });
                }
                write_word(target, (sym.value as u64).wrapping_add_signed(addend));
            }
            R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => {
                let sym = resolve()?;
                if sym.ifunc {
                    return Ok(Applied::Ifunc {
                        target: target as *mut usize,
                        resolver: sym.value,
                        addend: 0,
                    });
                }
                write_word(target, sym.value as u64);
            }
            R_X86_64_PC32 => {
                let sym = resolve()?;
                let val = (sym.value as i64)
                    .wrapping_add(addend)
                    .wrapping_sub(target as i64);
                let Ok(val) = i32::try_from(val) else {
                    return Ok(Applied::Unsupported);
                };
                write_half(target, val as u32);
            }
            R_X86_64_32 => {
                let sym = resolve()?;
                let val = (sym.value as u64).wrapping_add_signed(addend);
                let Ok(val) = u32::try_from(val) else {
                    return Ok(Applied::Unsupported);
                };
                write_half(target, val);
            }
            R_X86_64_COPY => return Ok(Applied::Copy),
            R_X86_64_IRELATIVE => {
                return Ok(Applied::Ifunc {
                    target: target as *mut usize,
                    resolver: (site.bias as u64).wrapping_add_signed(addend) as usize,
                    addend: 0,
                });
            }
            R_X86_64_DTPMOD64 => {
                // See the TLS module for understanding where the TLS index is coming from.
                let slot = if rel.r_sym == 0 {
                    site.own_tls
                } else {
                    resolve()?.tls
                };
                let Some(slot) = slot else {
                    return Ok(Applied::MissingTls);
                };
                write_word(target, slot.index as u64);
            }
            R_X86_64_DTPOFF64 => {
                let val = if rel.r_sym == 0 {
                    0
                } else {
                    resolve()?.value as u64
                };
                write_word(target, val.wrapping_add_signed(addend));
            }
            R_X86_64_TPOFF64 => {
                let (val, slot) = if rel.r_sym == 0 {
                    (0, site.own_tls)
                } else {
                    let sym = resolve()?;
                    (sym.value as u64, sym.tls)
                };
                let Some(offset) = slot.and_then(|s| s.static_offset) else {
                    return Ok(Applied::MissingTls);
                };
                // Variant II: the block sits below the thread pointer.
                write_word(
                    target,
                    val.wrapping_sub(offset as u64).wrapping_add_signed(addend),
                );
            }
            _ => return Ok(Applied::Unsupported),
        }
        Ok(Applied::Done)
    }

    unsafe fn apply_plt(&self, slot: *mut usize, value: usize) {
        slot.write(value);
    }

    unsafe fn call0(&self, func: usize) -> usize {
        let f: extern "C" fn() -> usize = core::mem::transmute(func);
        f()
    }
}

/// Human readable names for the relocation types we log.
pub(crate) fn reloc_name(r_type: u32) -> &'static str {
    match r_type {
        R_X86_64_NONE => "R_X86_64_NONE",
        R_X86_64_64 => "R_X86_64_64",
        R_X86_64_PC32 => "R_X86_64_PC32",
        R_X86_64_32 => "R_X86_64_32",
        R_X86_64_COPY => "R_X86_64_COPY",
        R_X86_64_GLOB_DAT => "R_X86_64_GLOB_DAT",
        R_X86_64_JUMP_SLOT => "R_X86_64_JUMP_SLOT",
        R_X86_64_RELATIVE => "R_X86_64_RELATIVE",
        R_X86_64_DTPMOD64 => "R_X86_64_DTPMOD64",
        R_X86_64_DTPOFF64 => "R_X86_64_DTPOFF64",
        R_X86_64_TPOFF64 => "R_X86_64_TPOFF64",
        R_X86_64_IRELATIVE => "R_X86_64_IRELATIVE",
        _ => "unknown",
    }
}
