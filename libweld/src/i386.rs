//! i386 specific parts of the engine. The 32-bit ABI differs from x86-64 in three load-bearing
//! ways: dynamic relocations are Rel records with the addend stored in the relocated field,
//! position-independent code addresses the GOT through %ebx rather than %rip, and the TLS
//! transitions come in two flavours because the GNU and Solaris toolchains assign different
//! successor relocation numbers to the same instruction rewrites.

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
use anyhow::bail;
use linker_utils::elf::DynamicRelocationKind;
use linker_utils::elf::RelocationKindInfo;
use linker_utils::elf::SectionFlags;
use linker_utils::elf::i386_rel_type_to_string;
use linker_utils::i386::RelaxationKind;
use linker_utils::relaxation::RelocationModifier;
use object::LittleEndian;

pub(crate) struct I386;

const LAZY_PLT0_TEMPLATE: &[u8] = &[
    0xff, 0x35, 0, 0, 0, 0, // push GOT+4
    0xff, 0x25, 0, 0, 0, 0, // jmp *GOT+8
    0x0f, 0x1f, 0x40, 0x00, // nopl 0x0(%eax)
];

const LAZY_PIC_PLT0_TEMPLATE: &[u8] = &[
    0xff, 0xb3, 0x04, 0, 0, 0, // push 0x4(%ebx)
    0xff, 0xa3, 0x08, 0, 0, 0, // jmp *0x8(%ebx)
    0x0f, 0x1f, 0x40, 0x00, // nopl 0x0(%eax)
];

const LAZY_PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xff, 0x25, 0, 0, 0, 0, // jmp *{GOT entry}
    0x68, 0, 0, 0, 0, // push {relocation offset}
    0xe9, 0, 0, 0, 0, // jmp {PLT0}
];

const LAZY_PIC_PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xff, 0xa3, 0, 0, 0, 0, // jmp *{GOT entry}(%ebx)
    0x68, 0, 0, 0, 0, // push {relocation offset}
    0xe9, 0, 0, 0, 0, // jmp {PLT0}
];

const LAZY_IBT_PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xf3, 0x0f, 0x1e, 0xfb, // endbr32
    0x68, 0, 0, 0, 0, // push {relocation offset}
    0xe9, 0, 0, 0, 0, // jmp {PLT0}
    0x66, 0x90, // xchg %ax,%ax
];

const NON_LAZY_PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xff, 0x25, 0, 0, 0, 0, // jmp *{GOT entry}
    0x66, 0x90, // xchg %ax,%ax
];

const NON_LAZY_PIC_PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xff, 0xa3, 0, 0, 0, 0, // jmp *{GOT entry}(%ebx)
    0x66, 0x90, // xchg %ax,%ax
];

const NON_LAZY_IBT_PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xf3, 0x0f, 0x1e, 0xfb, // endbr32
    0xff, 0x25, 0, 0, 0, 0, // jmp *{GOT entry}
    0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00, // nopw 0x0(%eax,%eax,1)
];

const NON_LAZY_IBT_PIC_PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xf3, 0x0f, 0x1e, 0xfb, // endbr32
    0xff, 0xa3, 0, 0, 0, 0, // jmp *{GOT entry}(%ebx)
    0x66, 0x0f, 0x1f, 0x44, 0x00, 0x00, // nopw 0x0(%eax,%eax,1)
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
    got_operand: PltGotOperand::Absolute,
    tlsdesc_template: None,
};

static LAZY_PIC_PLT: PltLayout = PltLayout {
    plt0_template: Some(LAZY_PIC_PLT0_TEMPLATE),
    plt0_got1_offset: 2,
    plt0_got2_offset: 8,
    entry_template: LAZY_PIC_PLT_ENTRY_TEMPLATE,
    got_offset: Some(2),
    reloc_offset: Some(7),
    plt0_branch_offset: Some(12),
    lazy_resume_offset: 6,
    got_operand: PltGotOperand::GotBaseRelative,
    tlsdesc_template: None,
};

static LAZY_IBT_PLT: PltLayout = PltLayout {
    plt0_template: Some(LAZY_PLT0_TEMPLATE),
    plt0_got1_offset: 2,
    plt0_got2_offset: 8,
    entry_template: LAZY_IBT_PLT_ENTRY_TEMPLATE,
    got_offset: None,
    reloc_offset: Some(5),
    plt0_branch_offset: Some(10),
    lazy_resume_offset: 0,
    got_operand: PltGotOperand::Absolute,
    tlsdesc_template: None,
};

static LAZY_IBT_PIC_PLT: PltLayout = PltLayout {
    plt0_template: Some(LAZY_PIC_PLT0_TEMPLATE),
    plt0_got1_offset: 2,
    plt0_got2_offset: 8,
    entry_template: LAZY_IBT_PLT_ENTRY_TEMPLATE,
    got_offset: None,
    reloc_offset: Some(5),
    plt0_branch_offset: Some(10),
    lazy_resume_offset: 0,
    got_operand: PltGotOperand::GotBaseRelative,
    tlsdesc_template: None,
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
    got_operand: PltGotOperand::Absolute,
    tlsdesc_template: None,
};

static NON_LAZY_PIC_PLT: PltLayout = PltLayout {
    plt0_template: None,
    plt0_got1_offset: 0,
    plt0_got2_offset: 0,
    entry_template: NON_LAZY_PIC_PLT_ENTRY_TEMPLATE,
    got_offset: Some(2),
    reloc_offset: None,
    plt0_branch_offset: None,
    lazy_resume_offset: 0,
    got_operand: PltGotOperand::GotBaseRelative,
    tlsdesc_template: None,
};

static NON_LAZY_IBT_PLT: PltLayout = PltLayout {
    plt0_template: None,
    plt0_got1_offset: 0,
    plt0_got2_offset: 0,
    entry_template: NON_LAZY_IBT_PLT_ENTRY_TEMPLATE,
    got_offset: Some(6),
    reloc_offset: None,
    plt0_branch_offset: None,
    lazy_resume_offset: 0,
    got_operand: PltGotOperand::Absolute,
    tlsdesc_template: None,
};

static NON_LAZY_IBT_PIC_PLT: PltLayout = PltLayout {
    plt0_template: None,
    plt0_got1_offset: 0,
    plt0_got2_offset: 0,
    entry_template: NON_LAZY_IBT_PIC_PLT_ENTRY_TEMPLATE,
    got_offset: Some(6),
    reloc_offset: None,
    plt0_branch_offset: None,
    lazy_resume_offset: 0,
    got_operand: PltGotOperand::GotBaseRelative,
    tlsdesc_template: None,
};

impl crate::arch::Arch for I386 {
    type Relaxation = Relaxation;
    type GotEntry = u32;
    type RelocationRecord = crate::elf::Rel32;

    const GOT_ENTRY_SIZE: u64 = 4;
    const USES_RELA: bool = false;

    fn got_entry(value: u64) -> u32 {
        value as u32
    }

    fn set_relocation(
        record: &mut crate::elf::Rel32,
        offset: u64,
        r_type: u32,
        symbol_index: u32,
        _addend: i64,
    ) {
        let e = LittleEndian;
        record.r_offset.set(e, offset as u32);
        record.r_info.set(e, symbol_index << 8 | (r_type & 0xff));
    }

    fn get_dynamic_relocation_type(relocation: DynamicRelocationKind) -> Result<u32> {
        relocation
            .i386_r_type()
            .ok_or_else(|| anyhow!("i386 has no {relocation:?} dynamic relocation"))
    }

    #[inline(always)]
    fn relocation_from_raw(r_type: u32) -> Result<RelocationKindInfo> {
        linker_utils::i386::relocation_from_raw(r_type).ok_or_else(|| {
            anyhow!(
                "Unsupported relocation type {}",
                Self::rel_type_to_string(r_type)
            )
        })
    }

    fn rel_type_to_string(r_type: u32) -> std::borrow::Cow<'static, str> {
        i386_rel_type_to_string(r_type)
    }

    fn plt_layout(args: &Args) -> &'static PltLayout {
        let pic = args.output_kind().is_relocatable();
        match (pic, args.bind_now, args.ibt_plt) {
            (false, false, false) => &LAZY_PLT,
            (false, false, true) => &LAZY_IBT_PLT,
            (false, true, false) => &NON_LAZY_PLT,
            (false, true, true) => &NON_LAZY_IBT_PLT,
            (true, false, false) => &LAZY_PIC_PLT,
            (true, false, true) => &LAZY_IBT_PIC_PLT,
            (true, true, false) => &NON_LAZY_PIC_PLT,
            (true, true, true) => &NON_LAZY_IBT_PIC_PLT,
        }
    }

    fn write_plt_header(
        layout: &PltLayout,
        out: &mut [u8],
        got_base_address: u64,
        _plt_address: u64,
    ) -> Result {
        let template = layout.plt0_template.context("PLT family has no header")?;
        out[..template.len()].copy_from_slice(template);
        let (got1, got2) = match layout.got_operand {
            PltGotOperand::Absolute => (
                got_base_address + Self::GOT_ENTRY_SIZE,
                got_base_address + 2 * Self::GOT_ENTRY_SIZE,
            ),
            PltGotOperand::GotBaseRelative => {
                (Self::GOT_ENTRY_SIZE, 2 * Self::GOT_ENTRY_SIZE)
            }
            PltGotOperand::PcRelative => bail!("i386 has no RIP-relative PLT header"),
        };
        write_value(out, layout.plt0_got1_offset, got1)?;
        write_value(out, layout.plt0_got2_offset, got2)
    }

    fn write_plt_entry(layout: &PltLayout, out: &mut [u8], ctx: &PltEntryContext) -> Result {
        out.copy_from_slice(layout.entry_template);
        if let Some(field_offset) = layout.got_offset {
            let value = match layout.got_operand {
                PltGotOperand::Absolute => ctx.got_entry_address,
                PltGotOperand::GotBaseRelative => {
                    ctx.got_entry_address - ctx.got_base_address
                }
                PltGotOperand::PcRelative => bail!("i386 has no RIP-relative PLT entry"),
            };
            write_value(out, field_offset, value)?;
        }
        if let Some(field_offset) = layout.reloc_offset {
            // The lazy resolver takes the byte offset of the entry's record within the PLT
            // relocation section, not its index.
            let index = ctx
                .relocation_index
                .context("Missing relocation index for lazy PLT entry")?;
            write_value(
                out,
                field_offset,
                u64::from(index) * crate::elf::REL32_ENTRY_SIZE,
            )?;
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
        _layout: &PltLayout,
        _out: &mut [u8],
        _got_base_address: u64,
        _tlsdesc_got_address: u64,
        _plt_address: u64,
    ) -> Result {
        bail!("i386 has no TLS descriptor trampoline");
    }

    fn check_got_reference(
        r_type: u32,
        section_bytes: &[u8],
        offset_in_section: u64,
        output_kind: OutputKind,
    ) -> Result {
        if r_type != object::elf::R_386_GOT32X || !output_kind.is_relocatable() {
            return Ok(());
        }
        let offset = offset_in_section as usize;
        // The baseless form computes the absolute address of the GOT slot, which doesn't exist
        // in a relocatable output.
        let baseless = offset >= 1
            && section_bytes
                .get(offset - 1)
                .is_some_and(|&modrm| modrm & 0xc7 == 0x05);
        if baseless {
            bail!(
                "R_386_GOT32X without a base register can't be used in a position-independent \
                 output"
            );
        }
        Ok(())
    }
}

/// Patches the 4-byte field at `field_offset` with an absolute value or a displacement from the
/// GOT base.
fn write_value(out: &mut [u8], field_offset: usize, value: u64) -> Result {
    let value: u32 = value
        .try_into()
        .map_err(|_| anyhow!("PLT operand doesn't fit in 32 bits"))?;
    out[field_offset..field_offset + 4].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn write_pc_rel(out: &mut [u8], field_offset: usize, target: u64, base_address: u64) -> Result {
    let insn_end = base_address + field_offset as u64 + 4;
    let displacement = target.wrapping_sub(insn_end) as u32;
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
    let rel_info = I386::relocation_from_raw(new_r_type).unwrap();
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
        target_os: TargetOs,
        section_flags: SectionFlags,
        non_zero_address: bool,
    ) -> Option<Self> {
        let is_known_address = value_flags.contains(ValueFlags::ADDRESS);
        let is_absolute = value_flags.contains(ValueFlags::ABSOLUTE)
            && !value_flags.contains(ValueFlags::DYNAMIC);
        let non_relocatable = !output_kind.is_relocatable();
        let is_absolute_address = is_known_address && non_relocatable;
        let can_bypass_got = value_flags.contains(ValueFlags::CAN_BYPASS_GOT);

        // IFuncs cannot be referenced directly, so a direct reference has to be redirected to
        // the PLT instead.
        if value_flags.contains(ValueFlags::IFUNC) {
            return match relocation_kind {
                object::elf::R_386_PC32 => {
                    create(RelaxationKind::NoOp, object::elf::R_386_PLT32).map(|r| Relaxation {
                        mandatory: true,
                        ..r
                    })
                }
                _ => None,
            };
        }

        if !section_flags.is_executable() {
            return None;
        }

        let offset = offset_in_section as usize;
        match relocation_kind {
            object::elf::R_386_GOT32X => {
                if offset < 2 {
                    return None;
                }
                let opcode = *section_bytes.get(offset - 2)?;
                let modrm = *section_bytes.get(offset - 1)?;
                let baseless = modrm & 0xc7 == 0x05;
                match opcode {
                    // mov x@GOT(%reg1), %reg2
                    0x8b => {
                        if is_absolute || is_absolute_address {
                            return create_got_load(
                                RelaxationKind::MovIndirectToAbsolute,
                                object::elf::R_386_32,
                            );
                        }
                        // In a relocatable output the base register holds the GOT address, so
                        // the load can become a GOT-relative lea. The baseless form has no
                        // register to be relative to.
                        if can_bypass_got && is_known_address && !baseless {
                            return create_got_load(
                                RelaxationKind::MovIndirectToLea,
                                object::elf::R_386_GOTOFF,
                            );
                        }
                    }
                    // test %reg1, x@GOT(%reg2)
                    0x85 if is_absolute || is_absolute_address => {
                        return create_got_load(
                            RelaxationKind::TestIndirectToAbsolute,
                            object::elf::R_386_32,
                        );
                    }
                    // add, or, adc, sbb, and, sub, xor, cmp against a GOT slot.
                    0x03 | 0x0b | 0x13 | 0x1b | 0x23 | 0x2b | 0x33 | 0x3b
                        if is_absolute || is_absolute_address =>
                    {
                        return create_got_load(
                            RelaxationKind::BinopIndirectToAbsolute,
                            object::elf::R_386_32,
                        );
                    }
                    // A branch through a zero GOT entry can't become a direct branch in a
                    // relocatable output.
                    0xff if can_bypass_got && (non_zero_address || non_relocatable) => {
                        match (modrm >> 3) & 0x7 {
                            // call *x@GOT(%reg)
                            2 => {
                                return create_got_load(
                                    RelaxationKind::CallIndirectToDirect,
                                    object::elf::R_386_PC32,
                                );
                            }
                            // jmp *x@GOT(%reg)
                            4 => {
                                return create_got_load(
                                    RelaxationKind::JmpIndirectToDirect,
                                    object::elf::R_386_PC32,
                                );
                            }
                            _ => {}
                        }
                    }
                    _ => {}
                }
                None
            }
            object::elf::R_386_PLT32 if can_bypass_got => {
                create(RelaxationKind::NoOp, object::elf::R_386_PC32)
            }
            object::elf::R_386_TLS_GD if output_kind.is_executable() => {
                if !is_tls_gd_sequence(section_bytes, offset) {
                    return None;
                }
                if can_bypass_got {
                    match target_os {
                        TargetOs::Gnu => create_tls(
                            RelaxationKind::TlsGdToLocalExec,
                            object::elf::R_386_TLS_LE_32,
                            output_kind,
                        ),
                        TargetOs::Solaris => create_tls(
                            RelaxationKind::TlsGdToLocalExecNeg,
                            object::elf::R_386_TLS_LE,
                            output_kind,
                        ),
                    }
                } else {
                    match target_os {
                        TargetOs::Gnu => create_tls(
                            RelaxationKind::TlsGdToInitialExec,
                            object::elf::R_386_TLS_IE_32,
                            output_kind,
                        ),
                        TargetOs::Solaris => create_tls(
                            RelaxationKind::TlsGdToInitialExecPos,
                            object::elf::R_386_TLS_IE,
                            output_kind,
                        ),
                    }
                }
            }
            object::elf::R_386_TLS_LDM if output_kind.is_executable() => {
                if !is_tls_ld_sequence(section_bytes, offset) {
                    return None;
                }
                create_tls(
                    RelaxationKind::TlsLdToLocalExec,
                    object::elf::R_386_NONE,
                    output_kind,
                )
            }
            object::elf::R_386_TLS_IE if can_bypass_got && output_kind.is_executable() => {
                // mov x@indntpoff,%eax or mov/add x@indntpoff,%reg.
                let prev = *section_bytes.get(offset.checked_sub(1)?)?;
                if prev == 0xa1
                    || (offset >= 2
                        && matches!(section_bytes.get(offset - 2), Some(0x8b | 0x03)))
                {
                    return create_tls(
                        RelaxationKind::TlsIeToLocalExec,
                        object::elf::R_386_TLS_LE,
                        output_kind,
                    );
                }
                None
            }
            object::elf::R_386_TLS_GOTIE
                if can_bypass_got && output_kind.is_executable() && offset >= 2 =>
            {
                // mov/add x@gotntpoff(%reg1),%reg2, loading the negated offset.
                if matches!(section_bytes.get(offset - 2), Some(0x8b | 0x03)) {
                    return create_tls(
                        RelaxationKind::TlsGotIeToLocalExec,
                        object::elf::R_386_TLS_LE,
                        output_kind,
                    );
                }
                None
            }
            object::elf::R_386_TLS_IE_32
                if can_bypass_got && output_kind.is_executable() && offset >= 2 =>
            {
                // mov/sub x@gottpoff(%reg1),%reg2, working with the non-negated offset.
                if matches!(section_bytes.get(offset - 2), Some(0x8b | 0x2b)) {
                    return create_tls(
                        RelaxationKind::TlsGotIeToLocalExec,
                        object::elf::R_386_TLS_LE_32,
                        output_kind,
                    );
                }
                None
            }
            object::elf::R_386_TLS_GOTDESC if output_kind.is_executable() && offset >= 2 => {
                // lea x@tlsdesc(%ebx),%reg
                if *section_bytes.get(offset - 2)? != 0x8d
                    || section_bytes.get(offset - 1)? & 0xc7 != 0x83
                {
                    return None;
                }
                if can_bypass_got {
                    return create_tls(
                        RelaxationKind::TlsDescToLocalExec,
                        object::elf::R_386_TLS_LE,
                        output_kind,
                    );
                }
                // The descriptor becomes an initial-exec load. The GNU numbering reads the
                // non-negated offset, which the paired call then negates; the Solaris numbering
                // reads the negated offset directly.
                match target_os {
                    TargetOs::Gnu => create_tls(
                        RelaxationKind::TlsDescToInitialExec,
                        object::elf::R_386_TLS_IE_32,
                        output_kind,
                    ),
                    TargetOs::Solaris => create_tls(
                        RelaxationKind::TlsDescToInitialExec,
                        object::elf::R_386_TLS_GOTIE,
                        output_kind,
                    ),
                }
            }
            object::elf::R_386_TLS_DESC_CALL if output_kind.is_executable() => {
                // call *(%eax), the invocation paired with the descriptor load.
                if section_bytes.get(offset..offset + 2)? != [0xff, 0x10] {
                    return None;
                }
                if can_bypass_got {
                    return create_tls(
                        RelaxationKind::SkipTlsDescCall,
                        object::elf::R_386_NONE,
                        output_kind,
                    );
                }
                match target_os {
                    TargetOs::Gnu => create_tls(
                        RelaxationKind::TlsDescCallToNeg,
                        object::elf::R_386_NONE,
                        output_kind,
                    ),
                    TargetOs::Solaris => create_tls(
                        RelaxationKind::SkipTlsDescCall,
                        object::elf::R_386_NONE,
                        output_kind,
                    ),
                }
            }
            _ => None,
        }
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

/// Recognises the two forms of the general-dynamic call sequence. The rewrite consumes both the
/// lea and the following call to the TLS helper, so both have to look the way the transition
/// expects.
fn is_tls_gd_sequence(bytes: &[u8], offset: usize) -> bool {
    // leal x@tlsgd(,%ebx,1),%eax; call ___tls_get_addr@plt
    if offset >= 3
        && bytes.get(offset - 3..offset) == Some(&[0x8d, 0x04, 0x1d])
        && bytes.get(offset + 4) == Some(&0xe8)
        && bytes.get(offset + 8).is_some()
    {
        return true;
    }
    // leal x@tlsgd(%reg),%eax; call ___tls_get_addr@plt; nop
    offset >= 2
        && bytes.get(offset - 2) == Some(&0x8d)
        && bytes
            .get(offset - 1)
            .is_some_and(|&modrm| modrm & 0xf8 == 0x80 && modrm & 0x7 != 0x4)
        && bytes.get(offset + 4) == Some(&0xe8)
        && bytes.get(offset + 9).is_some()
}

fn is_tls_ld_sequence(bytes: &[u8], offset: usize) -> bool {
    // leal x@tlsldm(%reg),%eax followed by a direct, addr32-prefixed or indirect call to the
    // TLS helper.
    offset >= 2
        && bytes.get(offset - 2) == Some(&0x8d)
        && bytes
            .get(offset - 1)
            .is_some_and(|&modrm| modrm & 0xf8 == 0x80 && modrm & 0x7 != 0x4)
        && match bytes.get(offset + 4) {
            Some(0xe8) => bytes.get(offset + 8).is_some(),
            Some(0xff | 0x67) => bytes.get(offset + 9).is_some(),
            _ => false,
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
        target_os: TargetOs,
    ) -> Option<Relaxation> {
        Relaxation::new(
            relocation_kind,
            bytes,
            offset,
            value_flags,
            output_kind,
            target_os,
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
        target_os: TargetOs,
        expected: &[u8],
        expected_r_type: u32,
    ) {
        let mut out = bytes_in.to_owned();
        let mut addend = 0;
        let r = relax(
            relocation_kind,
            bytes_in,
            offset,
            value_flags,
            output_kind,
            target_os,
        )
        .expect("expected a relaxation");
        r.apply(&mut out, &mut offset, &mut addend);
        assert_eq!(out, expected, "expected {expected:x?}, got {out:x?}");
        assert_eq!(r.new_r_type(), expected_r_type);
    }

    #[test]
    fn test_got_load_conversion() {
        let pde = OutputKind::DynamicExecutable(RelocationModel::NonRelocatable);
        let pie = OutputKind::DynamicExecutable(RelocationModel::Relocatable);
        let flags = ValueFlags::ADDRESS | ValueFlags::CAN_BYPASS_GOT;

        // mov x@GOT(%ebx),%eax becomes a GOT-relative lea in a PIE and an absolute mov in a
        // non-PIE.
        check_rewrite(
            object::elf::R_386_GOT32X,
            &[0x8b, 0x83, 0, 0, 0, 0],
            2,
            flags,
            pie,
            TargetOs::Gnu,
            &[0x8d, 0x83, 0, 0, 0, 0],
            object::elf::R_386_GOTOFF,
        );
        check_rewrite(
            object::elf::R_386_GOT32X,
            &[0x8b, 0x83, 0, 0, 0, 0],
            2,
            flags,
            pde,
            TargetOs::Gnu,
            &[0xc7, 0xc0, 0, 0, 0, 0],
            object::elf::R_386_32,
        );

        // The baseless form has no register to be GOT-relative to, so in a PIE it stays via
        // the GOT.
        assert!(
            relax(
                object::elf::R_386_GOT32X,
                &[0x8b, 0x05, 0, 0, 0, 0],
                2,
                flags,
                pie,
                TargetOs::Gnu,
            )
            .is_none()
        );

        // call *x@GOT(%ebx) and jmp *x@GOT(%ebx).
        check_rewrite(
            object::elf::R_386_GOT32X,
            &[0xff, 0x93, 0, 0, 0, 0],
            2,
            flags,
            pie,
            TargetOs::Gnu,
            &[0x90, 0xe8, 0, 0, 0, 0],
            object::elf::R_386_PC32,
        );
        check_rewrite(
            object::elf::R_386_GOT32X,
            &[0xff, 0xa3, 0, 0, 0, 0],
            2,
            flags,
            pie,
            TargetOs::Gnu,
            &[0xe9, 0xa3, 0, 0, 0, 0x90],
            object::elf::R_386_PC32,
        );

        // test and binop forms only work where the value is a link-time constant.
        check_rewrite(
            object::elf::R_386_GOT32X,
            &[0x85, 0x93, 0, 0, 0, 0],
            2,
            flags,
            pde,
            TargetOs::Gnu,
            &[0xf7, 0xc2, 0, 0, 0, 0],
            object::elf::R_386_32,
        );
        assert!(
            relax(
                object::elf::R_386_GOT32X,
                &[0x85, 0x93, 0, 0, 0, 0],
                2,
                flags,
                pie,
                TargetOs::Gnu,
            )
            .is_none()
        );
    }

    #[test]
    fn test_baseless_got_reference_rejected_in_pic() {
        let pie = OutputKind::DynamicExecutable(RelocationModel::Relocatable);
        let pde = OutputKind::DynamicExecutable(RelocationModel::NonRelocatable);
        let bytes = [0x8b, 0x05, 0, 0, 0, 0];
        assert!(I386::check_got_reference(object::elf::R_386_GOT32X, &bytes, 2, pie).is_err());
        assert!(I386::check_got_reference(object::elf::R_386_GOT32X, &bytes, 2, pde).is_ok());

        let based = [0x8b, 0x83, 0, 0, 0, 0];
        assert!(I386::check_got_reference(object::elf::R_386_GOT32X, &based, 2, pie).is_ok());
    }

    #[test]
    fn test_tls_gd_transitions() {
        // leal x@tlsgd(,%ebx,1),%eax; call ___tls_get_addr@plt
        let gd_bytes = [0x8d, 0x04, 0x1d, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0];
        let static_exe = OutputKind::StaticExecutable(RelocationModel::NonRelocatable);
        let exe = OutputKind::DynamicExecutable(RelocationModel::NonRelocatable);
        let so = OutputKind::SharedObject;
        let local = ValueFlags::ADDRESS | ValueFlags::CAN_BYPASS_GOT;

        // Local symbol goes to local-exec: a subtract of the non-negated offset under the GNU
        // numbering, an add of the negated one under Solaris.
        let r = relax(object::elf::R_386_TLS_GD, &gd_bytes, 3, local, static_exe, TargetOs::Gnu)
            .unwrap();
        assert_eq!(r.new_r_type(), object::elf::R_386_TLS_LE_32);
        assert!(r.is_mandatory());
        assert_eq!(r.next_modifier(), RelocationModifier::SkipNextRelocation);

        let r = relax(
            object::elf::R_386_TLS_GD,
            &gd_bytes,
            3,
            local,
            exe,
            TargetOs::Solaris,
        )
        .unwrap();
        assert_eq!(r.new_r_type(), object::elf::R_386_TLS_LE);
        assert!(!r.is_mandatory());

        // A symbol from a shared object goes to initial-exec.
        let r = relax(
            object::elf::R_386_TLS_GD,
            &gd_bytes,
            3,
            ValueFlags::DYNAMIC,
            exe,
            TargetOs::Gnu,
        )
        .unwrap();
        assert_eq!(r.new_r_type(), object::elf::R_386_TLS_IE_32);

        let r = relax(
            object::elf::R_386_TLS_GD,
            &gd_bytes,
            3,
            ValueFlags::DYNAMIC,
            exe,
            TargetOs::Solaris,
        )
        .unwrap();
        assert_eq!(r.new_r_type(), object::elf::R_386_TLS_IE);

        // Shared objects keep the general-dynamic model.
        assert!(relax(object::elf::R_386_TLS_GD, &gd_bytes, 3, local, so, TargetOs::Gnu).is_none());

        // An unrecognised instruction sequence is refused.
        assert!(
            relax(object::elf::R_386_TLS_GD, &[0x90; 12], 3, local, exe, TargetOs::Gnu).is_none()
        );
    }

    #[test]
    fn test_tls_ld_transition() {
        // leal x@tlsldm(%ebx),%eax; call ___tls_get_addr@plt
        let ld_bytes = [0x8d, 0x83, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0];
        let exe = OutputKind::DynamicExecutable(RelocationModel::NonRelocatable);
        let r = relax(
            object::elf::R_386_TLS_LDM,
            &ld_bytes,
            2,
            ValueFlags::ADDRESS | ValueFlags::CAN_BYPASS_GOT,
            exe,
            TargetOs::Gnu,
        )
        .unwrap();
        assert_eq!(r.new_r_type(), object::elf::R_386_NONE);
        assert_eq!(r.next_modifier(), RelocationModifier::SkipNextRelocation);
    }

    #[test]
    fn test_initial_exec_to_local_exec() {
        let exe = OutputKind::DynamicExecutable(RelocationModel::NonRelocatable);
        let flags = ValueFlags::ADDRESS | ValueFlags::CAN_BYPASS_GOT;

        // mov x@indntpoff,%eax
        check_rewrite(
            object::elf::R_386_TLS_IE,
            &[0xa1, 0, 0, 0, 0],
            1,
            flags,
            exe,
            TargetOs::Gnu,
            &[0xb8, 0, 0, 0, 0],
            object::elf::R_386_TLS_LE,
        );

        // mov x@gotntpoff(%ebx),%edx
        check_rewrite(
            object::elf::R_386_TLS_GOTIE,
            &[0x8b, 0x93, 0, 0, 0, 0],
            2,
            flags,
            exe,
            TargetOs::Gnu,
            &[0xc7, 0xc2, 0, 0, 0, 0],
            object::elf::R_386_TLS_LE,
        );

        // sub x@gottpoff(%ebx),%eax keeps the non-negated convention.
        check_rewrite(
            object::elf::R_386_TLS_IE_32,
            &[0x2b, 0x83, 0, 0, 0, 0],
            2,
            flags,
            exe,
            TargetOs::Gnu,
            &[0x81, 0xe8, 0, 0, 0, 0],
            object::elf::R_386_TLS_LE_32,
        );

        // No transition in a shared object, where the thread-pointer offset isn't known.
        assert!(
            relax(
                object::elf::R_386_TLS_GOTIE,
                &[0x8b, 0x93, 0, 0, 0, 0],
                2,
                flags,
                OutputKind::SharedObject,
                TargetOs::Gnu,
            )
            .is_none()
        );
    }

    #[test]
    fn test_tls_desc_transitions() {
        let desc_bytes = [
            0x8d, 0x83, 0, 0, 0, 0, // leal x@tlsdesc(%ebx),%eax
            0xff, 0x10, // call *(%eax)
        ];
        let exe = OutputKind::DynamicExecutable(RelocationModel::NonRelocatable);
        let local = ValueFlags::ADDRESS | ValueFlags::CAN_BYPASS_GOT;

        // Local symbol: the lea becomes an absolute lea of the negated offset and the call is
        // nopped out.
        check_rewrite(
            object::elf::R_386_TLS_GOTDESC,
            &desc_bytes,
            2,
            local,
            exe,
            TargetOs::Gnu,
            &[0x8d, 0x05, 0, 0, 0, 0, 0xff, 0x10],
            object::elf::R_386_TLS_LE,
        );
        check_rewrite(
            object::elf::R_386_TLS_DESC_CALL,
            &desc_bytes,
            6,
            local,
            exe,
            TargetOs::Gnu,
            &[0x8d, 0x83, 0, 0, 0, 0, 0x66, 0x90],
            object::elf::R_386_NONE,
        );

        // Interposable symbol under the GNU numbering: load the non-negated offset, then the
        // call becomes a negation.
        check_rewrite(
            object::elf::R_386_TLS_GOTDESC,
            &desc_bytes,
            2,
            ValueFlags::DYNAMIC,
            exe,
            TargetOs::Gnu,
            &[0x8b, 0x83, 0, 0, 0, 0, 0xff, 0x10],
            object::elf::R_386_TLS_IE_32,
        );
        check_rewrite(
            object::elf::R_386_TLS_DESC_CALL,
            &desc_bytes,
            6,
            ValueFlags::DYNAMIC,
            exe,
            TargetOs::Gnu,
            &[0x8d, 0x83, 0, 0, 0, 0, 0xf7, 0xd8],
            object::elf::R_386_NONE,
        );

        // Under the Solaris numbering the load reads the negated offset directly and the call
        // is just skipped.
        let r = relax(
            object::elf::R_386_TLS_GOTDESC,
            &desc_bytes,
            2,
            ValueFlags::DYNAMIC,
            exe,
            TargetOs::Solaris,
        )
        .unwrap();
        assert_eq!(r.new_r_type(), object::elf::R_386_TLS_GOTIE);
        let r = relax(
            object::elf::R_386_TLS_DESC_CALL,
            &desc_bytes,
            6,
            ValueFlags::DYNAMIC,
            exe,
            TargetOs::Solaris,
        )
        .unwrap();
        let mut out = desc_bytes.to_vec();
        let mut offset = 6;
        let mut addend = 0;
        r.apply(&mut out, &mut offset, &mut addend);
        assert_eq!(&out[6..8], &[0x66, 0x90]);
    }

    #[test]
    fn test_ifunc_reference_goes_via_plt() {
        let exe = OutputKind::DynamicExecutable(RelocationModel::NonRelocatable);
        let r = relax(
            object::elf::R_386_PC32,
            &[0xe8, 0, 0, 0, 0],
            1,
            ValueFlags::ADDRESS | ValueFlags::IFUNC,
            exe,
            TargetOs::Gnu,
        )
        .unwrap();
        assert_eq!(r.new_r_type(), object::elf::R_386_PLT32);
        assert!(r.is_mandatory());
    }

    #[test]
    fn test_plt_instantiation() {
        let layout = &LAZY_PLT;
        let mut plt0 = vec![0u8; layout.header_size() as usize];
        I386::write_plt_header(layout, &mut plt0, 0x3000, 0x1000).unwrap();
        assert_eq!(&plt0[..2], &[0xff, 0x35]);
        assert_eq!(&plt0[2..6], &0x3004u32.to_le_bytes());
        assert_eq!(&plt0[6..8], &[0xff, 0x25]);
        assert_eq!(&plt0[8..12], &0x3008u32.to_le_bytes());

        let mut entry = vec![0u8; layout.entry_size() as usize];
        let ctx = PltEntryContext {
            plt_entry_address: 0x1010,
            got_entry_address: 0x300c,
            got_base_address: 0x3000,
            plt0_address: Some(0x1000),
            relocation_index: Some(2),
        };
        I386::write_plt_entry(layout, &mut entry, &ctx).unwrap();
        assert_eq!(&entry[..2], &[0xff, 0x25]);
        assert_eq!(&entry[2..6], &0x300cu32.to_le_bytes());
        // The resolver operand is the byte offset into the PLT relocation section.
        assert_eq!(&entry[7..11], &16u32.to_le_bytes());
        // jmp PLT0: 0x1000 - 0x1020
        assert_eq!(&entry[12..16], &(-0x20i32).to_le_bytes());

        // The position-independent family addresses everything relative to %ebx.
        let layout = &LAZY_PIC_PLT;
        let mut plt0 = vec![0u8; layout.header_size() as usize];
        I386::write_plt_header(layout, &mut plt0, 0x3000, 0x1000).unwrap();
        assert_eq!(&plt0[..2], &[0xff, 0xb3]);
        assert_eq!(&plt0[2..6], &4u32.to_le_bytes());
        assert_eq!(&plt0[8..12], &8u32.to_le_bytes());

        let mut entry = vec![0u8; layout.entry_size() as usize];
        I386::write_plt_entry(layout, &mut entry, &ctx).unwrap();
        assert_eq!(&entry[..2], &[0xff, 0xa3]);
        assert_eq!(&entry[2..6], &0xcu32.to_le_bytes());
    }

    #[test]
    fn test_no_tlsdesc_trampoline() {
        let mut out = [0u8; 16];
        assert!(
            I386::write_tlsdesc_plt_entry(&LAZY_PLT, &mut out, 0x3000, 0x3040, 0x1000).is_err()
        );
    }
}
