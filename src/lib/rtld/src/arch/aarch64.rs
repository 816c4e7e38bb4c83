use elf::abi::{
    R_AARCH64_ABS64, R_AARCH64_COPY, R_AARCH64_GLOB_DAT, R_AARCH64_IRELATIVE,
    R_AARCH64_JUMP_SLOT, R_AARCH64_NONE, R_AARCH64_RELATIVE, R_AARCH64_TLS_DTPMOD,
    R_AARCH64_TLS_DTPREL, R_AARCH64_TLS_TPREL,
};

use super::{write_word, Applied, RelocBackend, RelocEntry, RelocSite, Resolver};
use crate::{tls::TlsVariant, RtldError};

pub(crate) const MINIMUM_TLS_ALIGNMENT: usize = 8;
pub(crate) const TLS_VARIANT: TlsVariant = TlsVariant::Variant1;
pub(crate) const MACHINE: u16 = elf::abi::EM_AARCH64;

pub use elf::abi::R_AARCH64_JUMP_SLOT as REL_PLT;

// PLT0 leaves &GOT[2] in x16 and pushes (&GOT[n], lr). The slot index is recovered from the
// slot address, relative to the first PLT slot at GOT[3].
core::arch::global_asm!(
    ".pushsection .text.__rtld_lazy_trampoline,\"ax\",%progbits",
    ".globl __rtld_lazy_trampoline",
    ".hidden __rtld_lazy_trampoline",
    ".type __rtld_lazy_trampoline,%function",
    ".p2align 4",
    "__rtld_lazy_trampoline:",
    "stp x0, x1, [sp, #-208]!",
    "stp x2, x3, [sp, #16]",
    "stp x4, x5, [sp, #32]",
    "stp x6, x7, [sp, #48]",
    "str x8, [sp, #64]",
    "stp q0, q1, [sp, #80]",
    "stp q2, q3, [sp, #112]",
    "stp q4, q5, [sp, #144]",
    "stp q6, q7, [sp, #176]",
    "ldr x0, [x16, #-8]",
    "ldr x1, [sp, #208]",
    "sub x1, x1, x16",
    "sub x1, x1, #8",
    "lsr x1, x1, #3",
    "bl {bind}",
    "mov x17, x0",
    "ldp q6, q7, [sp, #176]",
    "ldp q4, q5, [sp, #144]",
    "ldp q2, q3, [sp, #112]",
    "ldp q0, q1, [sp, #80]",
    "ldr x8, [sp, #64]",
    "ldp x6, x7, [sp, #48]",
    "ldp x4, x5, [sp, #32]",
    "ldp x2, x3, [sp, #16]",
    "ldp x0, x1, [sp], #208",
    "ldp x16, x30, [sp], #16",
    "br x17",
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
        match rel.r_type {
            R_AARCH64_NONE => {}
            R_AARCH64_RELATIVE => {
                write_word(target, (site.bias as u64).wrapping_add_signed(addend));
            }
            R_AARCH64_ABS64 | R_AARCH64_GLOB_DAT | R_AARCH64_JUMP_SLOT => {
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
            R_AARCH64_COPY => return Ok(Applied::Copy),
            R_AARCH64_IRELATIVE => {
                return Ok(Applied::Ifunc {
                    target: target as *mut usize,
                    resolver: (site.bias as u64).wrapping_add_signed(addend) as usize,
                    addend: 0,
                });
            }
            R_AARCH64_TLS_DTPMOD => {
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
            R_AARCH64_TLS_DTPREL => {
                let val = if rel.r_sym == 0 {
                    0
                } else {
                    resolve()?.value as u64
                };
                write_word(target, val.wrapping_add_signed(addend));
            }
            R_AARCH64_TLS_TPREL => {
                let (val, slot) = if rel.r_sym == 0 {
                    (0, site.own_tls)
                } else {
                    let sym = resolve()?;
                    (sym.value as u64, sym.tls)
                };
                let Some(offset) = slot.and_then(|s| s.static_offset) else {
                    return Ok(Applied::MissingTls);
                };
                // Variant I: the block sits above the thread control block.
                write_word(
                    target,
                    val.wrapping_add(offset as u64).wrapping_add_signed(addend),
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

pub(crate) fn reloc_name(r_type: u32) -> &'static str {
    match r_type {
        R_AARCH64_NONE => "R_AARCH64_NONE",
        R_AARCH64_ABS64 => "R_AARCH64_ABS64",
        R_AARCH64_COPY => "R_AARCH64_COPY",
        R_AARCH64_GLOB_DAT => "R_AARCH64_GLOB_DAT",
        R_AARCH64_JUMP_SLOT => "R_AARCH64_JUMP_SLOT",
        R_AARCH64_RELATIVE => "R_AARCH64_RELATIVE",
        R_AARCH64_TLS_DTPMOD => "R_AARCH64_TLS_DTPMOD",
        R_AARCH64_TLS_DTPREL => "R_AARCH64_TLS_DTPREL",
        R_AARCH64_TLS_TPREL => "R_AARCH64_TLS_TPREL",
        R_AARCH64_IRELATIVE => "R_AARCH64_IRELATIVE",
        _ => "unknown",
    }
}
