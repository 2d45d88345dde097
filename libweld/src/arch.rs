//! Abstraction over the two supported CPU architectures. Both are x86 family, so they share the
//! overall GOT/PLT scheme and differ in word size, relocation numbering, instruction encodings and
//! the on-disk dynamic relocation format.

use crate::args::Args;
use crate::args::OutputKind;
use crate::args::TargetOs;
use crate::error::Result;
use crate::symbol_db::ValueFlags;
use anyhow::bail;
use linker_utils::elf::DynamicRelocationKind;
use linker_utils::elf::RelocationKindInfo;
use linker_utils::elf::SectionFlags;
use linker_utils::relaxation::RelocationModifier;
use std::borrow::Cow;
use std::str::FromStr;

pub(crate) trait Arch {
    type Relaxation: Relaxation;

    /// GOT slot for the architecture. A pointer-sized little-endian word.
    type GotEntry: bytemuck::Pod;

    /// On-disk dynamic relocation record. Rela with an explicit addend on x86-64, Rel with the
    /// addend stored in the patched field on i386.
    type RelocationRecord: object::pod::Pod;

    /// Size in bytes of one GOT slot.
    const GOT_ENTRY_SIZE: u64;

    /// Whether dynamic relocations carry an explicit addend. When false, the applier stores the
    /// addend in the field being relocated instead.
    const USES_RELA: bool;

    /// Encodes a GOT word, truncating to the architecture's pointer width.
    fn got_entry(value: u64) -> Self::GotEntry;

    /// Fills in one dynamic relocation record. On i386 the addend is ignored; the caller is
    /// responsible for storing it in the field being relocated.
    fn set_relocation(
        record: &mut Self::RelocationRecord,
        offset: u64,
        r_type: u32,
        symbol_index: u32,
        addend: i64,
    );

    // Get dynamic relocation value specific for the architecture. Fails for kinds the
    // architecture has no encoding for.
    fn get_dynamic_relocation_type(relocation: DynamicRelocationKind) -> Result<u32>;

    // Make architecture-specific parsing of the relocation types.
    fn relocation_from_raw(r_type: u32) -> Result<RelocationKindInfo>;

    // Get string representation of a relocation specific for the architecture.
    fn rel_type_to_string(r_type: u32) -> Cow<'static, str>;

    /// Selects the PLT family for the supplied options.
    fn plt_layout(args: &Args) -> &'static PltLayout;

    /// Instantiates the PLT header entry that lazy families dispatch through.
    fn write_plt_header(
        layout: &PltLayout,
        out: &mut [u8],
        got_base_address: u64,
        plt_address: u64,
    ) -> Result;

    /// Instantiates one PLT entry.
    fn write_plt_entry(layout: &PltLayout, out: &mut [u8], ctx: &PltEntryContext) -> Result;

    /// Instantiates the TLS descriptor trampoline. Only called for families whose layout
    /// carries one.
    fn write_tlsdesc_plt_entry(
        layout: &PltLayout,
        out: &mut [u8],
        got_base_address: u64,
        tlsdesc_got_address: u64,
        plt_address: u64,
    ) -> Result;

    /// Validates a GOT-forming reference before any demand is recorded for it. The i386
    /// `R_386_GOT32X` form without a base register encodes the absolute address of the GOT
    /// slot, which cannot exist in a position-independent output.
    fn check_got_reference(
        r_type: u32,
        section_bytes: &[u8],
        offset_in_section: u64,
        output_kind: OutputKind,
    ) -> Result;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    I386,
}

impl FromStr for Architecture {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "elf_x86_64" => Ok(Architecture::X86_64),
            "elf_i386" => Ok(Architecture::I386),
            _ => bail!("-m {s} is not yet supported"),
        }
    }
}

pub(crate) trait Relaxation {
    /// Tries to create a relaxation for the relocation of the specified kind, to be applied at the
    /// specified offset in the supplied section. `target_os` selects between OS variants where
    /// the successor relocation numbering differs.
    fn new(
        relocation_kind: u32,
        section_bytes: &[u8],
        offset_in_section: u64,
        value_flags: ValueFlags,
        output_kind: OutputKind,
        target_os: TargetOs,
        section_flags: SectionFlags,
        non_zero_address: bool,
    ) -> Option<Self>
    where
        Self: std::marker::Sized;

    fn apply(&self, section_bytes: &mut [u8], offset_in_section: &mut u64, addend: &mut i64);

    fn rel_info(&self) -> RelocationKindInfo;

    /// The raw relocation type left at the site once this relaxation has been applied.
    fn new_r_type(&self) -> u32;

    fn debug_kind(&self) -> impl std::fmt::Debug;

    fn next_modifier(&self) -> RelocationModifier;

    /// Relaxations that must be performed even when optimisation is disabled: TLS model
    /// transitions whose GOT form cannot be represented in the output kind and redirection of
    /// direct ifunc references to the PLT.
    fn is_mandatory(&self) -> bool;

    /// True for rewrites of GOT-indirect loads to direct operands. These are applied to the
    /// section bytes during the scan pass and the relocation record is rewritten to the new
    /// type, so a second scan sees an already-converted site and requests nothing further.
    fn is_got_load_conversion(&self) -> bool;
}

/// Byte templates and patch offsets for one PLT family. The templates and the offsets within
/// them are fixed by the psABI and must be reproduced exactly; instantiation copies the
/// template then patches the listed offsets. All patched fields are 4 bytes wide and sit at
/// the end of their instruction.
pub(crate) struct PltLayout {
    /// Template for the header entry. None for the non-lazy families, which have no header.
    pub(crate) plt0_template: Option<&'static [u8]>,

    /// Offsets within the header of its references to the second and third reserved GOT words.
    pub(crate) plt0_got1_offset: usize,
    pub(crate) plt0_got2_offset: usize,

    pub(crate) entry_template: &'static [u8],

    /// Offset within an entry of its GOT operand. None for the lazy IBT entries, which carry
    /// only the push and the branch to the header.
    pub(crate) got_offset: Option<usize>,

    /// Offset within a lazy entry of the relocation-table operand pushed for the resolver.
    pub(crate) reloc_offset: Option<usize>,

    /// Offset within a lazy entry of the displacement branching back to the header.
    pub(crate) plt0_branch_offset: Option<usize>,

    /// Added to an entry's address to form the initial value of its jump slot. The first call
    /// has to land on the entry's push instruction, or on its landing pad for the IBT families.
    pub(crate) lazy_resume_offset: u64,

    /// How an entry's GOT operand is encoded.
    pub(crate) got_operand: PltGotOperand,

    /// Trampoline dispatching lazily bound TLS descriptor calls. x86-64 lazy families only.
    pub(crate) tlsdesc_template: Option<&'static [u8]>,
}

impl PltLayout {
    pub(crate) fn entry_size(&self) -> u64 {
        self.entry_template.len() as u64
    }

    pub(crate) fn header_size(&self) -> u64 {
        self.plt0_template.map_or(0, |t| t.len() as u64)
    }

    pub(crate) fn is_lazy(&self) -> bool {
        self.plt0_template.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PltGotOperand {
    /// Absolute address of the GOT slot. i386 position-dependent output.
    Absolute,

    /// Displacement from the GOT base register (%ebx). i386 position-independent output.
    GotBaseRelative,

    /// RIP-relative displacement. All x86-64 families.
    PcRelative,
}

/// Addresses needed to instantiate one PLT entry.
pub(crate) struct PltEntryContext {
    pub(crate) plt_entry_address: u64,
    pub(crate) got_entry_address: u64,
    pub(crate) got_base_address: u64,

    /// Address of the family's header entry. None for non-lazy families.
    pub(crate) plt0_address: Option<u64>,

    /// Index of the entry's record within the PLT relocation section. None for non-lazy
    /// families, whose GOT slots are filled by regular GOT relocations.
    pub(crate) relocation_index: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_emulation_names() {
        assert_eq!(
            Architecture::from_str("elf_x86_64").unwrap(),
            Architecture::X86_64
        );
        assert_eq!(
            Architecture::from_str("elf_i386").unwrap(),
            Architecture::I386
        );
        assert!(Architecture::from_str("aarch64elf").is_err());
    }
}
