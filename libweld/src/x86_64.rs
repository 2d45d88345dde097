//! x86-64 specific parts of the engine: instruction rewrites for GOT load conversion and TLS
//! model transitions, plus the PLT entry templates. Some of the rewrites are notionally optional
//! optimisations but are load-bearing in practice. A static executable has no runtime that could
//! resolve a TLS descriptor or a general-dynamic call, so those accesses must be rewritten out.

use crate::arch::Arch;
use crate::arch::PltEntryContext;
use crate::arch::PltGotOperand;
use crate::arch::PltLayout;
use crate::args::Args;
use crate::args::OutputKind;
use crate::args::TargetOs;
use crate::error::Result;
use crate::symbol_db::ValueFlags;
use anyhow::Context as _;
use anyhow::anyhow;
use linker_utils::elf::DynamicRelocationKind;
use linker_utils::elf::RelocationKindInfo;
use linker_utils::elf::SectionFlags;
use linker_utils::elf::x86_64_rel_type_to_string;
use linker_utils::relaxation::RelocationModifier;
use linker_utils::x86_64::RelaxationKind;
use object::LittleEndian;

pub(crate) struct X86_64;

const LAZY_PLT0_TEMPLATE: &[u8] = &[
    0xff, 0x35, 0x08, 0, 0, 0, // push GOT+8(%rip)
    0xff, 0x25, 0x10, 0, 0, 0, // jmp *GOT+16(%rip)
    0x0f, 0x1f, 0x40, 0x00, // nopl 0x0(%rax)
];

const LAZY_PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xff, 0x25, 0, 0, 0, 0, // jmp *{GOT entry}(%rip)
    0x68, 0, 0, 0, 0, // push {relocation index}
    0xe9, 0, 0, 0, 0, // jmp {PLT0}
];

const LAZY_IBT_PLT0_TEMPLATE: &[u8] = &[
    0xff, 0x35, 0x08, 0, 0, 0, // push GOT+8(%rip)
    0xf2, 0xff, 0x25, 0x10, 0, 0, 0, // bnd jmp *GOT+16(%rip)
    0x0f, 0x1f, 0x00, // nopl (%rax)
];

const LAZY_IBT_PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xf3, 0x0f, 0x1e, 0xfa, // endbr64
    0x68, 0, 0, 0, 0, // push {relocation index}
    0xf2, 0xe9, 0, 0, 0, 0, // bnd jmp {PLT0}
    0x90, // nop
];

const NON_LAZY_PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xff, 0x25, 0, 0, 0, 0, // jmp *{GOT entry}(%rip)
    0x66, 0x90, // xchg %ax,%ax
];

const NON_LAZY_IBT_PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xf3, 0x0f, 0x1e, 0xfa, // endbr64
    0xf2, 0xff, 0x25, 0, 0, 0, 0, // bnd jmp *{GOT entry}(%rip)
    0x0f, 0x1f, 0x44, 0x00, 0x00, // nopl 0x0(%rax,%rax,1)
];

const TLSDESC_PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xf3, 0x0f, 0x1e, 0xfa, // endbr64
    0xff, 0x35, 0x08, 0, 0, 0, // push GOT+8(%rip)
    0xff, 0x25, 0x10, 0, 0, 0, // jmp *{TLS descriptor resolver GOT entry}(%rip)
];

static LAZY_PLT: PltLayout = PltLayout {
    plt0_template: Some(LAZY_PLT0_TEMPLATE),
    plt0_got1_offset: 2,
    plt0_got2_offset: 8,
    entry_template: LAZY_PLT_ENTRY_TEMPLATE,
    got_offset: Some(2),
    reloc_offset: Some(7),
    plt0_branch_offset: Some(12),
    lazy_resume_offset: 6,
    got_operand: PltGotOperand::PcRelative,
    tlsdesc_template: Some(TLSDESC_PLT_ENTRY_TEMPLATE),
};

static LAZY_IBT_PLT: PltLayout = PltLayout {
    plt0_template: Some(LAZY_IBT_PLT0_TEMPLATE),
    plt0_got1_offset: 2,
    plt0_got2_offset: 9,
    entry_template: LAZY_IBT_PLT_ENTRY_TEMPLATE,
    got_offset: None,
    reloc_offset: Some(5),
    plt0_branch_offset: Some(11),
    lazy_resume_offset: 0,
    got_operand: PltGotOperand::PcRelative,
    tlsdesc_template: Some(TLSDESC_PLT_ENTRY_TEMPLATE),
};

static NON_LAZY_PLT: PltLayout = PltLayout {
    plt0_template: None,
    plt0_got1_offset: 0,
    plt0_got2_offset: 0,
    entry_template: NON_LAZY_PLT_ENTRY_TEMPLATE,
    got_offset: Some(2),
    reloc_offset: None,
    plt0_branch_offset: None,
    lazy_resume_offset: 0,
    got_operand: PltGotOperand::PcRelative,
    tlsdesc_template: None,
};

static NON_LAZY_IBT_PLT: PltLayout = PltLayout {
    plt0_template: None,
    plt0_got1_offset: 0,
    plt0_got2_offset: 0,
    entry_template: NON_LAZY_IBT_PLT_ENTRY_TEMPLATE,
    got_offset: Some(7),
    reloc_offset: None,
    plt0_branch_offset: None,
    lazy_resume_offset: 0,
    got_operand: PltGotOperand::PcRelative,
    tlsdesc_template: None,
};

impl crate::arch::Arch for X86_64 {
    type Relaxation = Relaxation;
    type GotEntry = u64;
    type RelocationRecord = crate::elf::Rela64;

    const GOT_ENTRY_SIZE: u64 = 8;
    const USES_RELA: bool = true;

    fn got_entry(value: u64) -> u64 {
        value
    }

    fn set_relocation(
        record: &mut crate::elf::Rela64,
        offset: u64,
        r_type: u32,
        symbol_index: u32,
        addend: i64,
    ) {
        let e = LittleEndian;
        record.r_offset.set(e, offset);
        record
            .r_info
            .set(e, u64::from(symbol_index) << 32 | u64::from(r_type));
        record.r_addend.set(e, addend);
    }

    fn get_dynamic_relocation_type(relocation: DynamicRelocationKind) -> Result<u32> {
        relocation
            .x86_64_r_type()
            .ok_or_else(|| anyhow!("x86_64 has no {relocation:?} dynamic relocation"))
    }

    #[inline(always)]
    fn relocation_from_raw(r_type: u32) -> Result<RelocationKindInfo> {
        linker_utils::x86_64::relocation_from_raw(r_type).ok_or_else(|| {
            anyhow!(
                "Unsupported relocation type {}",
                Self::rel_type_to_string(r_type)
            )
        })
    }

    fn rel_type_to_string(r_type: u32) -> std::borrow::Cow<'static, str> {
        x86_64_rel_type_to_string(r_type)
    }

    fn plt_layout(args: &Args) -> &'static PltLayout {
        match (args.bind_now, args.ibt_plt) {
            (false, false) => &LAZY_PLT,
            (false, true) => &LAZY_IBT_PLT,
            (true, false) => &NON_LAZY_PLT,
            (true, true) => &NON_LAZY_IBT_PLT,
        }
    }

    fn write_plt_header(
        layout: &PltLayout,
        out: &mut [u8],
        got_base_address: u64,
        plt_address: u64,
    ) -> Result {
        let template = layout.plt0_template.context("PLT family has no header")?;
        out[..template.len()].copy_from_slice(template);
        write_pc_rel(
            out,
            layout.plt0_got1_offset,
            got_base_address + Self::GOT_ENTRY_SIZE,
            plt_address,
        )?;
        write_pc_rel(
            out,
            layout.plt0_got2_offset,
            got_base_address + 2 * Self::GOT_ENTRY_SIZE,
            plt_address,
        )
    }

    fn write_plt_entry(layout: &PltLayout, out: &mut [u8], ctx: &PltEntryContext) -> Result {
        out.copy_from_slice(layout.entry_template);
        if let Some(field_offset) = layout.got_offset {
            write_pc_rel(
                out,
                field_offset,
                ctx.got_entry_address,
                ctx.plt_entry_address,
            )?;
        }
        if let Some(field_offset) = layout.reloc_offset {
            let index = ctx
                .relocation_index
                .context("Missing relocation index for lazy PLT entry")?;
            out[field_offset..field_offset + 4].copy_from_slice(&index.to_le_bytes());
        }
        if let Some(field_offset) = layout.plt0_branch_offset {
            let plt0_address = ctx
                .plt0_address
                .context("Missing header address for lazy PLT entry")?;
            write_pc_rel(out, field_offset, plt0_address, ctx.plt_entry_address)?;
        }
        Ok(())
    }

    fn write_tlsdesc_plt_entry(
        layout: &PltLayout,
        out: &mut [u8],
        got_base_address: u64,
        tlsdesc_got_address: u64,
        plt_address: u64,
    ) -> Result {
        let template = layout
            .tlsdesc_template
            .context("PLT family has no TLS descriptor trampoline")?;
        out.copy_from_slice(template);
        write_pc_rel(out, 6, got_base_address + Self::GOT_ENTRY_SIZE, plt_address)?;
        write_pc_rel(out, 12, tlsdesc_got_address, plt_address)
    }

    fn check_got_reference(
        _r_type: u32,
        _section_bytes: &[u8],
        _offset_in_section: u64,
        _output_kind: OutputKind,
    ) -> Result {
        Ok(())
    }
}

/// Patches the 4-byte field at `field_offset` with a RIP-relative displacement to `target`. All
/// the patched fields in the templates sit at the end of their instruction, so the next
/// instruction starts 4 bytes after the field.
fn write_pc_rel(out: &mut [u8], field_offset: usize, target: u64, base_address: u64) -> Result {
    let insn_end = base_address + field_offset as u64 + 4;
    let displacement: i32 = (target.wrapping_sub(insn_end) as i64)
        .try_into()
        .map_err(|_| anyhow!("PLT is more than 2GiB away from GOT"))?;
    out[field_offset..field_offset + 4].copy_from_slice(&displacement.to_le_bytes());
    Ok(())
}

#[derive(Debug, Clone)]
pub(crate) struct Relaxation {
    kind: RelaxationKind,
    rel_info: RelocationKindInfo,
    r_type: u32,
    mandatory: bool,
    got_load: bool,
}

#[allow(clippy::unnecessary_wraps)]
fn create(kind: RelaxationKind, new_r_type: u32) -> Option<Relaxation> {
    // This only fails for relocation types that we don't support and if we relax to a type we
    // don't support, then that's a bug.
    let rel_info = X86_64::relocation_from_raw(new_r_type).unwrap();
    Some(Relaxation {
        kind,
        rel_info,
        r_type: new_r_type,
        mandatory: false,
        got_load: false,
    })
}

fn create_got_load(kind: RelaxationKind, new_r_type: u32) -> Option<Relaxation> {
    create(kind, new_r_type).map(|r| Relaxation {
        got_load: true,
        ..r
    })
}

fn create_tls(kind: RelaxationKind, new_r_type: u32, output_kind: OutputKind) -> Option<Relaxation> {
    // A static executable has no runtime support for the dynamic TLS models, so there the
    // rewrite stops being optional.
    create(kind, new_r_type).map(|r| Relaxation {
        mandatory: output_kind.is_static_executable(),
        ..r
    })
}

impl crate::arch::Relaxation for Relaxation {
    #[inline(always)]
    fn new(
        relocation_kind: u32,
        section_bytes: &[u8],
        offset_in_section: u64,
        value_flags: ValueFlags,
        output_kind: OutputKind,
        _target_os: TargetOs,
        section_flags: SectionFlags,
        non_zero_address: bool,
    ) -> Option<Self> {
        let is_known_address = value_flags.contains(ValueFlags::ADDRESS);
        let is_absolute = value_flags.contains(ValueFlags::ABSOLUTE)
            && !value_flags.contains(ValueFlags::DYNAMIC);
        let non_relocatable = !output_kind.is_relocatable();
        let is_absolute_address = is_known_address && non_relocatable;
        let can_bypass_got = value_flags.contains(ValueFlags::CAN_BYPASS_GOT);

        // IFuncs cannot be referenced directly. They always need to go via the GOT. So a direct
        // reference like PC32 has to be redirected to the PLT instead, which is kind of the
        // opposite of relaxation.
        if value_flags.contains(ValueFlags::IFUNC) {
            return match relocation_kind {
                object::elf::R_X86_64_PC32 => {
                    create(RelaxationKind::NoOp, object::elf::R_X86_64_PLT32)
                        .map(|r| Relaxation {
                            mandatory: true,
                            ..r
                        })
                }
                _ => None,
            };
        }

        // All relaxations below only apply to executable code, so we shouldn't attempt them if a
        // relocation is in a non-executable section.
        if !section_flags.is_executable() {
            return None;
        }

        let offset = offset_in_section as usize;
        match relocation_kind {
            object::elf::R_X86_64_REX_GOTPCRELX => {
                if offset < 3 {
                    return None;
                }
                let b1 = section_bytes[offset - 2];
                let rex = section_bytes[offset - 3];

                // REX prefixed instruction with W=1, R=0/1, X=0, B=0
                if rex != 0x48 && rex != 0x4c {
                    return None;
                }

                if is_absolute || is_absolute_address {
                    // The REX.W forms take a sign-extended 32 bit immediate.
                    match b1 {
                        // mov *x(%rip), reg
                        0x8b => {
                            return create_got_load(
                                RelaxationKind::RexMovIndirectToAbsolute,
                                object::elf::R_X86_64_32S,
                            );
                        }
                        // sub *x(%rip), reg
                        0x2b => {
                            return create_got_load(
                                RelaxationKind::RexSubIndirectToAbsolute,
                                object::elf::R_X86_64_32S,
                            );
                        }
                        // cmp *x(%rip), reg
                        0x3b => {
                            return create_got_load(
                                RelaxationKind::RexCmpIndirectToAbsolute,
                                object::elf::R_X86_64_32S,
                            );
                        }
                        _ => return None,
                    }
                } else if can_bypass_got {
                    match b1 {
                        // mov *x(%rip), reg
                        0x8b => {
                            return create_got_load(
                                RelaxationKind::MovIndirectToLea,
                                object::elf::R_X86_64_PC32,
                            );
                        }
                        _ => return None,
                    }
                }
            }
            object::elf::R_X86_64_GOTPCRELX => {
                if offset < 2 {
                    return None;
                }
                match section_bytes.get(offset - 2)? {
                    // mov *x(%rip), reg
                    0x8b => {
                        if is_absolute || is_absolute_address {
                            return create_got_load(
                                RelaxationKind::MovIndirectToAbsolute,
                                object::elf::R_X86_64_32,
                            );
                        } else if can_bypass_got {
                            return create_got_load(
                                RelaxationKind::MovIndirectToLea,
                                object::elf::R_X86_64_PC32,
                            );
                        }
                    }
                    _ => {}
                }
                // A branch through a zero GOT entry can't become a direct branch in a
                // relocatable output, since a direct branch to address zero isn't expressible
                // with a PC-relative displacement there.
                if can_bypass_got && (non_zero_address || non_relocatable) {
                    match section_bytes.get(offset - 2..offset)? {
                        // call *x(%rip)
                        [0xff, 0x15] => {
                            return create_got_load(
                                RelaxationKind::CallIndirectToRelative,
                                object::elf::R_X86_64_PC32,
                            );
                        }
                        // jmp *x(%rip)
                        [0xff, 0x25] => {
                            return create_got_load(
                                RelaxationKind::JmpIndirectToRelative,
                                object::elf::R_X86_64_PC32,
                            );
                        }
                        _ => return None,
                    }
                }
                return None;
            }
            object::elf::R_X86_64_GOTPCREL if can_bypass_got && offset >= 2 => {
                // Without the X suffix, only the mov form may be rewritten, since the REX byte
                // can't be assumed to be part of the instruction.
                match section_bytes.get(offset - 2)? {
                    // mov *x(%rip), reg
                    0x8b => {
                        return create_got_load(
                            RelaxationKind::MovIndirectToLea,
                            object::elf::R_X86_64_PC32,
                        );
                    }
                    _ => {}
                }
                return None;
            }
            object::elf::R_X86_64_GOTTPOFF if can_bypass_got && output_kind.is_executable() => {
                let rex_offset = offset.checked_sub(3)?;
                match section_bytes.get(rex_offset..offset - 1)? {
                    // mov *x(%rip), reg
                    [0x48 | 0x4c, 0x8b] => {
                        return create(
                            RelaxationKind::RexMovIndirectToAbsolute,
                            object::elf::R_X86_64_TPOFF32,
                        );
                    }
                    // add *x(%rip), reg
                    [0x48 | 0x4c, 0x03] => {
                        let modrm = *section_bytes.get(offset - 1)?;
                        // %rsp and %r12 can't be the base of a lea without a SIB byte, so for
                        // those the instruction stays an add.
                        let kind = if (modrm >> 3) & 0x7 == 0x4 {
                            RelaxationKind::RexAddIndirectToAbsolute
                        } else {
                            RelaxationKind::RexAddIndirectToLea
                        };
                        return create(kind, object::elf::R_X86_64_TPOFF32);
                    }
                    _ => {}
                }
            }
            object::elf::R_X86_64_PLT32 if can_bypass_got => {
                return create(RelaxationKind::NoOp, object::elf::R_X86_64_PC32);
            }
            object::elf::R_X86_64_PLTOFF64 if can_bypass_got => {
                return create(RelaxationKind::NoOp, object::elf::R_X86_64_GOTOFF64);
            }
            object::elf::R_X86_64_TLSGD if can_bypass_got && output_kind.is_executable() => {
                let kind = match TlsGdForm::identify(section_bytes, offset)? {
                    TlsGdForm::Regular => RelaxationKind::TlsGdToLocalExec,
                    TlsGdForm::Large => RelaxationKind::TlsGdToLocalExecLarge,
                };
                return create_tls(kind, object::elf::R_X86_64_TPOFF32, output_kind);
            }
            object::elf::R_X86_64_TLSGD if output_kind.is_executable() => {
                let kind = match TlsGdForm::identify(section_bytes, offset)? {
                    TlsGdForm::Regular => RelaxationKind::TlsGdToInitialExec,
                    TlsGdForm::Large => return None,
                };
                return create_tls(kind, object::elf::R_X86_64_GOTTPOFF, output_kind);
            }
            object::elf::R_X86_64_TLSLD if output_kind.is_executable() && offset >= 3 => {
                // lea x@tlsld(%rip),%rdi
                if section_bytes.get(offset - 3..offset)? == [0x48, 0x8d, 0x3d] {
                    if section_bytes.get(offset + 4..offset + 6) == Some(&[0x48, 0xb8]) {
                        // The call is through a 64 bit absolute address, so we use a slightly
                        // different relaxation with extra padding.
                        return create_tls(
                            RelaxationKind::TlsLdToLocalExec64,
                            object::elf::R_X86_64_NONE,
                            output_kind,
                        );
                    }
                    if section_bytes.get(offset + 4) == Some(&0xff) {
                        // The call is indirect, which takes one byte more than the direct form.
                        return create_tls(
                            RelaxationKind::TlsLdToLocalExecNoPlt,
                            object::elf::R_X86_64_NONE,
                            output_kind,
                        );
                    }
                    return create_tls(
                        RelaxationKind::TlsLdToLocalExec,
                        object::elf::R_X86_64_NONE,
                        output_kind,
                    );
                }
            }
            object::elf::R_X86_64_GOTPC32_TLSDESC if output_kind.is_executable() => {
                // lea x@tlsdesc(%rip), %reg
                let rex_offset = offset.checked_sub(3)?;
                let &[rex, opcode, modrm] = section_bytes.get(rex_offset..offset)? else {
                    return None;
                };
                if (rex != 0x48 && rex != 0x4c) || opcode != 0x8d || modrm & 0xc7 != 0x05 {
                    return None;
                }
                if can_bypass_got {
                    return create_tls(
                        RelaxationKind::TlsDescToLocalExec,
                        object::elf::R_X86_64_TPOFF32,
                        output_kind,
                    );
                }
                return create_tls(
                    RelaxationKind::TlsDescToInitialExec,
                    object::elf::R_X86_64_GOTTPOFF,
                    output_kind,
                );
            }
            object::elf::R_X86_64_TLSDESC_CALL if output_kind.is_executable() => {
                // call *(%rax), the invocation paired with the descriptor load. Once the
                // descriptor is rewritten away the call must go too.
                if section_bytes.get(offset..offset + 2)? == [0xff, 0x10] {
                    return create_tls(
                        RelaxationKind::SkipTlsDescCall,
                        object::elf::R_X86_64_NONE,
                        output_kind,
                    );
                }
            }
            _ => return None,
        };
        None
    }

    fn apply(&self, section_bytes: &mut [u8], offset_in_section: &mut u64, addend: &mut i64) {
        self.kind.apply(section_bytes, offset_in_section, addend);
    }

    fn rel_info(&self) -> RelocationKindInfo {
        self.rel_info
    }

    fn new_r_type(&self) -> u32 {
        self.r_type
    }

    fn debug_kind(&self) -> impl std::fmt::Debug {
        &self.kind
    }

    fn next_modifier(&self) -> RelocationModifier {
        self.kind.next_modifier()
    }

    fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    fn is_got_load_conversion(&self) -> bool {
        self.got_load
    }
}

enum TlsGdForm {
    Regular,
    Large,
}

impl TlsGdForm {
    fn identify(bytes: &[u8], offset: usize) -> Option<Self> {
        // data16 lea x@tlsgd(%rip),%rdi
        // data16 data16 rex.W call __tls_get_addr@plt
        if offset >= 4
            && bytes.get(offset - 4..offset) == Some(&[0x66, 0x48, 0x8d, 0x3d])
            && bytes.get(offset + 4..offset + 8) == Some(&[0x66, 0x66, 0x48, 0xe8])
        {
            return Some(Self::Regular);
        }

        // lea x@tlsgd(%rip),%rdi
        // movabs $__tls_get_addr@pltoff,%rax
        // add %rbx,%rax
        // call *%rax
        if offset >= 3
            && bytes.get(offset - 3..offset) == Some(&[0x48, 0x8d, 0x3d])
            && bytes.get(offset + 4..offset + 6) == Some(&[0x48, 0xb8])
            && bytes.get(offset + 14..offset + 19) == Some(&[0x48, 0x01, 0xd8, 0xff, 0xd0])
        {
            return Some(Self::Large);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Relaxation as _;
    use crate::args::RelocationModel;

    const EXEC_FLAGS: SectionFlags =
        SectionFlags::from_u64(object::elf::SHF_EXECINSTR as u64);

    fn relax(
        relocation_kind: u32,
        bytes: &[u8],
        offset: u64,
        value_flags: ValueFlags,
        output_kind: OutputKind,
    ) -> Option<Relaxation> {
        Relaxation::new(
            relocation_kind,
            bytes,
            offset,
            value_flags,
            output_kind,
            TargetOs::Gnu,
            EXEC_FLAGS,
            true,
        )
    }

    #[track_caller]
    fn check_rewrite(
        relocation_kind: u32,
        bytes_in: &[u8],
        mut offset: u64,
        value_flags: ValueFlags,
        output_kind: OutputKind,
        expected: &[u8],
        expected_r_type: u32,
    ) {
        let mut out = bytes_in.to_owned();
        let mut addend = -4;
        let r = relax(relocation_kind, bytes_in, offset, value_flags, output_kind)
            .expect("expected a relaxation");
        r.apply(&mut out, &mut offset, &mut addend);
        assert_eq!(out, expected, "expected {expected:x?}, got {out:x?}");
        assert_eq!(r.new_r_type(), expected_r_type);
    }

    #[test]
    fn test_got_load_conversion() {
        let pde = OutputKind::DynamicExecutable(RelocationModel::NonRelocatable);
        let pie = OutputKind::DynamicExecutable(RelocationModel::Relocatable);

        // mov x@gotpcrel(%rip),%rbp with a known local address becomes a lea in a PIE and an
        // absolute mov in a non-PIE.
        check_rewrite(
            object::elf::R_X86_64_REX_GOTPCRELX,
            &[0x48, 0x8b, 0x2d, 0, 0, 0, 0],
            3,
            ValueFlags::ADDRESS | ValueFlags::CAN_BYPASS_GOT,
            pie,
            &[0x48, 0x8d, 0x2d, 0, 0, 0, 0],
            object::elf::R_X86_64_PC32,
        );
        check_rewrite(
            object::elf::R_X86_64_REX_GOTPCRELX,
            &[0x48, 0x8b, 0x2d, 0, 0, 0, 0],
            3,
            ValueFlags::ADDRESS | ValueFlags::CAN_BYPASS_GOT,
            pde,
            &[0x48, 0xc7, 0xc5, 0, 0, 0, 0],
            object::elf::R_X86_64_32S,
        );

        // call *x@gotpcrel(%rip) and jmp *x@gotpcrel(%rip).
        check_rewrite(
            object::elf::R_X86_64_GOTPCRELX,
            &[0xff, 0x15, 0, 0, 0, 0],
            2,
            ValueFlags::ADDRESS | ValueFlags::CAN_BYPASS_GOT,
            pie,
            &[0x67, 0xe8, 0, 0, 0, 0],
            object::elf::R_X86_64_PC32,
        );
        check_rewrite(
            object::elf::R_X86_64_GOTPCRELX,
            &[0xff, 0x25, 0, 0, 0, 0],
            2,
            ValueFlags::ADDRESS | ValueFlags::CAN_BYPASS_GOT,
            pie,
            &[0xe9, 0, 0, 0, 0, 0x90],
            object::elf::R_X86_64_PC32,
        );

        // The flag that tells the scan pass to persist these rewrites is set.
        let r = relax(
            object::elf::R_X86_64_GOTPCRELX,
            &[0xff, 0x15, 0, 0, 0, 0],
            2,
            ValueFlags::ADDRESS | ValueFlags::CAN_BYPASS_GOT,
            pie,
        )
        .unwrap();
        assert!(r.is_got_load_conversion());
        assert!(!r.is_mandatory());
    }

    #[test]
    fn test_branch_to_undefined_weak_stays_indirect() {
        let pie = OutputKind::DynamicExecutable(RelocationModel::Relocatable);
        // An undefined weak resolves to zero, which a direct branch can't reach in a
        // relocatable output.
        let r = Relaxation::new(
            object::elf::R_X86_64_GOTPCRELX,
            &[0xff, 0x15, 0, 0, 0, 0],
            2,
            ValueFlags::ABSOLUTE | ValueFlags::CAN_BYPASS_GOT,
            pie,
            TargetOs::Gnu,
            EXEC_FLAGS,
            false,
        );
        assert!(r.is_none());

        // A load of the same symbol does convert, to mov $0.
        let r = Relaxation::new(
            object::elf::R_X86_64_GOTPCRELX,
            &[0x8b, 0x05, 0, 0, 0, 0],
            2,
            ValueFlags::ABSOLUTE | ValueFlags::CAN_BYPASS_GOT,
            pie,
            TargetOs::Gnu,
            EXEC_FLAGS,
            false,
        );
        assert!(r.is_some());
    }

    #[test]
    fn test_initial_exec_to_local_exec() {
        let exe = OutputKind::DynamicExecutable(RelocationModel::NonRelocatable);
        let flags = ValueFlags::ADDRESS | ValueFlags::CAN_BYPASS_GOT;

        // mov x@gottpoff(%rip),%rax
        check_rewrite(
            object::elf::R_X86_64_GOTTPOFF,
            &[0x48, 0x8b, 0x05, 0, 0, 0, 0],
            3,
            flags,
            exe,
            &[0x48, 0xc7, 0xc0, 0, 0, 0, 0],
            object::elf::R_X86_64_TPOFF32,
        );

        // add x@gottpoff(%rip),%rsp has to stay an add.
        check_rewrite(
            object::elf::R_X86_64_GOTTPOFF,
            &[0x48, 0x03, 0x25, 0, 0, 0, 0],
            3,
            flags,
            exe,
            &[0x48, 0x81, 0xc4, 0, 0, 0, 0],
            object::elf::R_X86_64_TPOFF32,
        );

        // add x@gottpoff(%rip),%rbx becomes lea x(%rbx),%rbx.
        check_rewrite(
            object::elf::R_X86_64_GOTTPOFF,
            &[0x48, 0x03, 0x1d, 0, 0, 0, 0],
            3,
            flags,
            exe,
            &[0x48, 0x8d, 0x9b, 0, 0, 0, 0],
            object::elf::R_X86_64_TPOFF32,
        );
    }

    #[test]
    fn test_tls_gd_transitions() {
        let gd_bytes = [
            0x66, 0x48, 0x8d, 0x3d, 0, 0, 0, 0, // data16 lea x@tlsgd(%rip),%rdi
            0x66, 0x66, 0x48, 0xe8, 0, 0, 0, 0, // data16 data16 rex.W call
        ];
        let static_exe = OutputKind::StaticExecutable(RelocationModel::NonRelocatable);
        let exe = OutputKind::DynamicExecutable(RelocationModel::NonRelocatable);
        let so = OutputKind::SharedObject;

        // Local symbol in an executable goes to local-exec and the rewrite is mandatory in a
        // static link.
        let r = relax(
            object::elf::R_X86_64_TLSGD,
            &gd_bytes,
            4,
            ValueFlags::ADDRESS | ValueFlags::CAN_BYPASS_GOT,
            static_exe,
        )
        .unwrap();
        assert_eq!(r.new_r_type(), object::elf::R_X86_64_TPOFF32);
        assert!(r.is_mandatory());
        assert!(!r.is_got_load_conversion());
        assert_eq!(r.next_modifier(), RelocationModifier::SkipNextRelocation);

        // A symbol from a shared object in a dynamic executable goes to initial-exec.
        let r = relax(
            object::elf::R_X86_64_TLSGD,
            &gd_bytes,
            4,
            ValueFlags::DYNAMIC,
            exe,
        )
        .unwrap();
        assert_eq!(r.new_r_type(), object::elf::R_X86_64_GOTTPOFF);
        assert!(!r.is_mandatory());

        // Shared objects keep the general-dynamic model.
        assert!(
            relax(
                object::elf::R_X86_64_TLSGD,
                &gd_bytes,
                4,
                ValueFlags::ADDRESS,
                so,
            )
            .is_none()
        );

        // An unrecognised instruction sequence is refused.
        assert!(
            relax(
                object::elf::R_X86_64_TLSGD,
                &[0x90; 16],
                4,
                ValueFlags::ADDRESS | ValueFlags::CAN_BYPASS_GOT,
                exe,
            )
            .is_none()
        );
    }

    #[test]
    fn test_tls_desc_transitions() {
        let desc_bytes = [
            0x48, 0x8d, 0x05, 0, 0, 0, 0, // lea x@tlsdesc(%rip),%rax
            0xff, 0x10, // call *(%rax)
        ];
        let exe = OutputKind::DynamicExecutable(RelocationModel::NonRelocatable);

        let r = relax(
            object::elf::R_X86_64_GOTPC32_TLSDESC,
            &desc_bytes,
            3,
            ValueFlags::ADDRESS | ValueFlags::CAN_BYPASS_GOT,
            exe,
        )
        .unwrap();
        assert_eq!(r.new_r_type(), object::elf::R_X86_64_TPOFF32);

        let r = relax(
            object::elf::R_X86_64_GOTPC32_TLSDESC,
            &desc_bytes,
            3,
            ValueFlags::DYNAMIC,
            exe,
        )
        .unwrap();
        assert_eq!(r.new_r_type(), object::elf::R_X86_64_GOTTPOFF);

        // The paired call gets nopped out.
        let mut out = desc_bytes.to_vec();
        let mut offset = 7;
        let mut addend = 0;
        let r = relax(
            object::elf::R_X86_64_TLSDESC_CALL,
            &desc_bytes,
            7,
            ValueFlags::ADDRESS | ValueFlags::CAN_BYPASS_GOT,
            exe,
        )
        .unwrap();
        r.apply(&mut out, &mut offset, &mut addend);
        assert_eq!(&out[7..9], &[0x66, 0x90]);
    }

    #[test]
    fn test_ifunc_reference_goes_via_plt() {
        let exe = OutputKind::DynamicExecutable(RelocationModel::NonRelocatable);
        let r = relax(
            object::elf::R_X86_64_PC32,
            &[0xe8, 0, 0, 0, 0],
            1,
            ValueFlags::ADDRESS | ValueFlags::IFUNC,
            exe,
        )
        .unwrap();
        assert_eq!(r.new_r_type(), object::elf::R_X86_64_PLT32);
        assert!(r.is_mandatory());
    }

    #[test]
    fn test_plt_instantiation() {
        let layout = &LAZY_PLT;
        let mut plt0 = vec![0u8; layout.header_size() as usize];
        X86_64::write_plt_header(layout, &mut plt0, 0x3000, 0x1000).unwrap();
        // push *GOT+8(%rip): 0x3008 - 0x1006
        assert_eq!(&plt0[..2], &[0xff, 0x35]);
        assert_eq!(&plt0[2..6], &0x2002i32.to_le_bytes());
        // jmp *GOT+16(%rip): 0x3010 - 0x100c
        assert_eq!(&plt0[8..12], &0x2004i32.to_le_bytes());

        let mut entry = vec![0u8; layout.entry_size() as usize];
        let ctx = PltEntryContext {
            plt_entry_address: 0x1010,
            got_entry_address: 0x3018,
            got_base_address: 0x3000,
            plt0_address: Some(0x1000),
            relocation_index: Some(2),
        };
        X86_64::write_plt_entry(layout, &mut entry, &ctx).unwrap();
        // jmp *{GOT entry}(%rip): 0x3018 - 0x1016
        assert_eq!(&entry[..2], &[0xff, 0x25]);
        assert_eq!(&entry[2..6], &0x2002i32.to_le_bytes());
        assert_eq!(&entry[7..11], &2u32.to_le_bytes());
        // jmp PLT0: 0x1000 - 0x1020
        assert_eq!(&entry[12..16], &(-0x20i32).to_le_bytes());

        let layout = &NON_LAZY_PLT;
        let mut entry = vec![0u8; layout.entry_size() as usize];
        let ctx = PltEntryContext {
            plt_entry_address: 0x1000,
            got_entry_address: 0x3000,
            got_base_address: 0x3000,
            plt0_address: None,
            relocation_index: None,
        };
        X86_64::write_plt_entry(layout, &mut entry, &ctx).unwrap();
        assert_eq!(&entry[2..6], &0x1ffai32.to_le_bytes());
        assert_eq!(&entry[6..8], &[0x66, 0x90]);
    }

    #[test]
    fn test_tlsdesc_trampoline() {
        let layout = &LAZY_PLT;
        let mut entry = vec![0u8; 16];
        X86_64::write_tlsdesc_plt_entry(layout, &mut entry, 0x3000, 0x3040, 0x1000).unwrap();
        assert_eq!(&entry[..4], &[0xf3, 0x0f, 0x1e, 0xfa]);
        // push GOT+8(%rip): 0x3008 - 0x100a
        assert_eq!(&entry[6..10], &0x1ffei32.to_le_bytes());
        // jmp *{descriptor GOT entry}(%rip): 0x3040 - 0x1010
        assert_eq!(&entry[12..16], &0x2030i32.to_le_bytes());
    }
}
