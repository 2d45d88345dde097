//! Walks every relocation in the inputs and records, per symbol, how the output must make that
//! symbol reachable: directly, via a GOT slot, via a PLT entry, via one of the TLS entry shapes,
//! through a copy relocation, and so on. Objects are scanned in parallel; the demand bits merge
//! through atomic ors.
//!
//! The scan is also where GOT-load conversions happen. Rewrites like `mov x@GOT(%rip),%reg` to
//! `lea x(%rip),%reg` change which demands a site makes, so they're applied here, and they're
//! applied permanently: the section bytes and the relocation record are both rewritten, so
//! scanning an already-converted site a second time finds an ordinary non-GOT relocation and
//! records the same demands again. Every other relaxation leaves the input untouched and is
//! re-derived when relocations are applied.

use crate::arch::Arch;
use crate::arch::Relaxation as _;
use crate::args::Args;
use crate::args::OutputKind;
use crate::error::Result;
use crate::layout::AtomicResolutionFlags;
use crate::layout::ResolutionFlags;
use crate::model::FileId;
use crate::model::InputObject;
use crate::model::Relocation;
use crate::model::Section;
use crate::model::SymbolPlacement;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crate::symbol_db::ValueFlags;
use anyhow::Context as _;
use anyhow::bail;
use linker_utils::elf::RelocationKind;
use linker_utils::elf::SectionFlags;
use linker_utils::relaxation::RelocationModifier;
use rayon::prelude::*;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

pub(crate) struct ScanOutputs {
    /// Whether any input used the local-dynamic TLS model and kept it, which makes the output
    /// carry one shared (module, offset) GOT pair.
    pub(crate) uses_tlsld: bool,
}

#[tracing::instrument(skip_all, name = "Scan relocations")]
pub(crate) fn scan_references<A: Arch>(
    objects: &mut [InputObject],
    symbol_db: &mut SymbolDb,
) -> Result<ScanOutputs> {
    let flags: Vec<AtomicResolutionFlags> = (0..symbol_db.num_symbols())
        .map(|_| AtomicResolutionFlags::empty())
        .collect();
    let uses_tlsld = AtomicBool::new(false);

    {
        let db: &SymbolDb = symbol_db;
        objects
            .par_iter_mut()
            .enumerate()
            .try_for_each(|(file_number, object)| {
                scan_object::<A>(
                    FileId::new(file_number as u32),
                    object,
                    db,
                    &flags,
                    &uses_tlsld,
                )
            })?;
    }

    for (id, atomic) in symbol_db.symbol_ids().zip(flags) {
        let merged = atomic.into_non_atomic();
        if !merged.is_empty() {
            symbol_db.symbol_mut(id).resolution_flags |= merged;
        }
    }

    Ok(ScanOutputs {
        uses_tlsld: uses_tlsld.into_inner(),
    })
}

fn scan_object<A: Arch>(
    file_id: FileId,
    object: &mut InputObject,
    db: &SymbolDb,
    flags: &[AtomicResolutionFlags],
    uses_tlsld: &AtomicBool,
) -> Result {
    let InputObject {
        name,
        sections,
        symbols,
    } = object;

    for section in sections.iter_mut() {
        if !section.retained || section.relocations.is_empty() {
            continue;
        }
        let section_flags = section.flags;
        let section_writable = section.is_writable();
        let Section {
            name: section_name,
            data,
            relocations,
            ..
        } = section;

        let mut modifier = RelocationModifier::Normal;
        for rel in relocations.iter_mut() {
            if modifier == RelocationModifier::SkipNextRelocation {
                modifier = RelocationModifier::Normal;
                continue;
            }
            let symbol_id = db.resolve_ref(file_id, symbols, name, rel.symbol_index)?;
            modifier = scan_relocation::<A>(
                rel,
                data,
                section_flags,
                section_writable,
                symbol_id,
                db,
                flags,
                uses_tlsld,
            )
            .with_context(|| {
                format!(
                    "processing {} at offset 0x{:x} in section `{section_name}` of {name}",
                    A::rel_type_to_string(rel.r_type),
                    rel.offset,
                )
            })?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn scan_relocation<A: Arch>(
    rel: &mut Relocation,
    data: &mut [u8],
    section_flags: SectionFlags,
    section_writable: bool,
    symbol_id: SymbolId,
    db: &SymbolDb,
    flags: &[AtomicResolutionFlags],
    uses_tlsld: &AtomicBool,
) -> Result<RelocationModifier> {
    let args = db.args;
    let output_kind = args.output_kind();
    let binding = db.symbol(symbol_id);

    if let Some(relaxation) = plan_relaxation::<A>(
        rel.r_type,
        data,
        rel.offset,
        rel.addend,
        binding.value_flags,
        non_zero_address(binding.placement),
        db.is_dynamic_marker(symbol_id),
        args,
        section_flags,
    )? {
        let modifier = relaxation.next_modifier();
        let new_info = relaxation.rel_info();
        if relaxation.is_got_load_conversion() {
            let mut offset = rel.offset;
            let mut addend = rel.addend;
            relaxation.apply(data, &mut offset, &mut addend);
            tracing::trace!(
                kind = ?relaxation.debug_kind(),
                new_r_type = %A::rel_type_to_string(relaxation.new_r_type()),
                "converted GOT load"
            );
            rel.offset = offset;
            rel.addend = addend;
            rel.r_type = relaxation.new_r_type();
        }
        record_demands::<A>(
            new_info.kind,
            new_info.byte_size,
            symbol_id,
            db,
            flags,
            uses_tlsld,
            section_writable,
        )?;
        return Ok(modifier);
    }

    let rel_info = A::relocation_from_raw(rel.r_type)?;
    if matches!(
        rel_info.kind,
        RelocationKind::Got | RelocationKind::GotRelative
    ) {
        A::check_got_reference(rel.r_type, data, rel.offset, output_kind)?;
    }
    record_demands::<A>(
        rel_info.kind,
        rel_info.byte_size,
        symbol_id,
        db,
        flags,
        uses_tlsld,
        section_writable,
    )?;
    Ok(RelocationModifier::Normal)
}

pub(crate) fn non_zero_address(placement: SymbolPlacement) -> bool {
    match placement {
        SymbolPlacement::Section { .. } => true,
        SymbolPlacement::Absolute(value) => value != 0,
        SymbolPlacement::Undefined | SymbolPlacement::Dynamic => false,
    }
}

/// Decides whether a site gets relaxed, applying the gates that are common to the scan and
/// apply passes. Both passes must reach the same decision for the same site, so everything the
/// decision depends on has to be stable across them.
pub(crate) fn plan_relaxation<A: Arch>(
    r_type: u32,
    section_bytes: &[u8],
    offset: u64,
    addend: i64,
    value_flags: ValueFlags,
    non_zero_address: bool,
    is_dynamic_marker: bool,
    args: &Args,
    section_flags: SectionFlags,
) -> Result<Option<A::Relaxation>> {
    // Startup code loads the address of _DYNAMIC through the GOT before the GOT base register
    // is usable for anything else. Those loads must survive as-is.
    if is_dynamic_marker {
        return Ok(None);
    }
    let Some(relaxation) = A::Relaxation::new(
        r_type,
        section_bytes,
        offset,
        value_flags,
        args.output_kind(),
        args.target_os,
        section_flags,
        non_zero_address,
    ) else {
        return Ok(None);
    };
    if !args.relax && !relaxation.is_mandatory() {
        return Ok(None);
    }

    // Rewrites assume the standard in-place addend: -4 for the PC-relative forms (the field
    // sits 4 bytes before the end of the instruction), 0 for everything else. A site with any
    // other addend computes an address partway into somewhere and can't be rewritten.
    let original = A::relocation_from_raw(r_type)?;
    let expected_addend = if original.kind.is_pc_relative() { -4 } else { 0 };
    if addend != expected_addend {
        if relaxation.is_mandatory() {
            bail!(
                "Cannot apply required rewrite of {} with addend {addend}",
                A::rel_type_to_string(r_type)
            );
        }
        return Ok(None);
    }

    Ok(Some(relaxation))
}

fn record_demands<A: Arch>(
    kind: RelocationKind,
    byte_size: usize,
    symbol_id: SymbolId,
    db: &SymbolDb,
    flags: &[AtomicResolutionFlags],
    uses_tlsld: &AtomicBool,
    section_writable: bool,
) -> Result {
    let args = db.args;
    let output_kind = args.output_kind();
    let binding = db.symbol(symbol_id);
    let value_flags = binding.value_flags;

    let mut demand = ResolutionFlags::empty();
    match kind {
        RelocationKind::None | RelocationKind::TlsDescCall | RelocationKind::GotBaseRelative => {}
        RelocationKind::Absolute => {
            demand |= ResolutionFlags::DIRECT;
            demand |= absolute_demands::<A>(
                byte_size,
                symbol_id,
                db,
                section_writable,
                output_kind,
            )?;
        }
        RelocationKind::Relative => {
            demand |= ResolutionFlags::DIRECT;
            if value_flags.is_dynamic() && !value_flags.is_absolute() {
                // A direct PC-relative reference to something in a shared object has to bind at
                // link time, so the definition is pulled towards the output: functions via a
                // canonical PLT entry, data via a copy relocation.
                demand |= dynamic_definition_demands(symbol_id, db, output_kind)?;
            }
        }
        RelocationKind::SymRelGotBase | RelocationKind::Size => {
            demand |= ResolutionFlags::DIRECT;
        }
        RelocationKind::Got | RelocationKind::GotRelative => {
            demand |= ResolutionFlags::GOT;
            if value_flags.is_interposable() && value_flags.is_function() {
                // A call through the GOT to an interposable function shares its slot with the
                // PLT's jump slot, so the address handed out everywhere is the PLT entry.
                demand |= ResolutionFlags::PLT;
            }
        }
        RelocationKind::PltRelative | RelocationKind::PltRelGotBase => {
            demand |= ResolutionFlags::PLT | ResolutionFlags::GOT;
        }
        RelocationKind::TlsGd | RelocationKind::TlsGdGotBase => {
            demand |= ResolutionFlags::GOT_TLS_MODULE;
        }
        RelocationKind::TlsLd | RelocationKind::TlsLdGotBase => {
            uses_tlsld.store(true, Ordering::Relaxed);
        }
        RelocationKind::DtpOff => {}
        RelocationKind::GotTpOff
        | RelocationKind::GotTpOffGotBase
        | RelocationKind::GotTpOffAbsolute => {
            demand |= ResolutionFlags::GOT_TLS_OFFSET;
        }
        RelocationKind::GotTpOffPositiveGotBase => {
            demand |= ResolutionFlags::GOT_TLS_OFFSET_POSITIVE;
        }
        RelocationKind::TpOff | RelocationKind::TpOffPositive => {
            if output_kind.is_shared_object() {
                bail!(
                    "Local-exec TLS access to {} is not valid in a shared object",
                    db.symbol_debug(symbol_id)
                );
            }
        }
        RelocationKind::TlsDesc | RelocationKind::TlsDescGotBase => {
            demand |= ResolutionFlags::GOT_TLS_DESCRIPTOR;
        }
    }
    if !demand.is_empty() {
        flags[symbol_id.as_usize()].fetch_or(demand);
    }
    Ok(())
}

/// Policy for a word of absolute address data.
fn absolute_demands<A: Arch>(
    byte_size: usize,
    symbol_id: SymbolId,
    db: &SymbolDb,
    section_writable: bool,
    output_kind: OutputKind,
) -> Result<ResolutionFlags> {
    let binding = db.symbol(symbol_id);
    let value_flags = binding.value_flags;

    if value_flags.is_dynamic() && !value_flags.is_absolute() {
        if section_writable && byte_size as u64 == A::GOT_ENTRY_SIZE {
            // The loader can fill in a writable word at startup.
            return Ok(ResolutionFlags::EXPORT_DYNAMIC);
        }
        // Read-only data can't take a dynamic relocation.
        return dynamic_definition_demands(symbol_id, db, output_kind);
    }

    if value_flags.is_address()
        && output_kind.is_relocatable()
        && byte_size as u64 != A::GOT_ENTRY_SIZE
    {
        bail!(
            "{}-byte absolute reference to {} cannot be adjusted for the load address",
            byte_size,
            db.symbol_debug(symbol_id)
        );
    }
    Ok(ResolutionFlags::empty())
}

fn dynamic_definition_demands(
    symbol_id: SymbolId,
    db: &SymbolDb,
    output_kind: OutputKind,
) -> Result<ResolutionFlags> {
    let binding = db.symbol(symbol_id);
    if binding.value_flags.is_function() {
        return Ok(ResolutionFlags::PLT | ResolutionFlags::GOT);
    }
    if output_kind.is_executable() && db.args.allow_copy_relocations {
        return Ok(ResolutionFlags::COPY_RELOCATION | ResolutionFlags::DIRECT);
    }
    bail!(
        "Direct reference to {} requires a copy relocation, which isn't available here; \
         recompile with -fPIC",
        db.symbol_debug(symbol_id)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Architecture;
    use crate::args::RelocationModel;
    use crate::model::Binding;
    use crate::model::InputSymbol;
    use crate::model::SymbolKind;
    use crate::model::Visibility;
    use crate::x86_64::X86_64;

    fn code_section(data: Vec<u8>, relocations: Vec<Relocation>) -> Section {
        Section {
            name: ".text".to_owned(),
            data,
            flags: SectionFlags::from_u64(
                u64::from(object::elf::SHF_ALLOC) | u64::from(object::elf::SHF_EXECINSTR),
            ),
            alignment: 16,
            relocations,
            retained: true,
        }
    }

    fn defined_symbol(name: &str) -> InputSymbol {
        InputSymbol {
            name: name.to_owned(),
            kind: SymbolKind::Function,
            binding: Binding::Global,
            visibility: Visibility::Default,
            placement: SymbolPlacement::Section {
                section_index: 0,
                offset: 0,
            },
            size: 0,
        }
    }

    #[test]
    fn got_load_conversion_is_idempotent() {
        let args = Args::new(
            Architecture::X86_64,
            OutputKind::DynamicExecutable(RelocationModel::Relocatable),
        );
        // mov foo@gotpcrel(%rip),%rax
        let mut objects = vec![InputObject {
            name: "test.o".to_owned(),
            sections: vec![code_section(
                vec![0x48, 0x8b, 0x05, 0, 0, 0, 0],
                vec![Relocation {
                    offset: 3,
                    r_type: object::elf::R_X86_64_REX_GOTPCRELX,
                    symbol_index: 0,
                    addend: -4,
                }],
            )],
            symbols: vec![defined_symbol("foo")],
        }];

        let mut symbol_db = SymbolDb::build(&objects, &args).unwrap();
        scan_references::<X86_64>(&mut objects, &mut symbol_db).unwrap();

        // The load was rewritten to a lea and the record now carries the converted type.
        assert_eq!(&objects[0].sections[0].data, &[0x48, 0x8d, 0x05, 0, 0, 0, 0]);
        assert_eq!(
            objects[0].sections[0].relocations[0].r_type,
            object::elf::R_X86_64_PC32
        );
        let id = symbol_db.global("foo").unwrap();
        let first_flags = symbol_db.symbol(id).resolution_flags;
        assert!(first_flags.contains(ResolutionFlags::DIRECT));
        assert!(!first_flags.needs_got());

        // A second scan sees the converted site and changes nothing.
        let data_before = objects[0].sections[0].data.clone();
        scan_references::<X86_64>(&mut objects, &mut symbol_db).unwrap();
        assert_eq!(objects[0].sections[0].data, data_before);
        assert_eq!(symbol_db.symbol(id).resolution_flags, first_flags);
    }

    #[test]
    fn tls_pair_skips_the_helper_call() {
        let args = Args::new(
            Architecture::X86_64,
            OutputKind::DynamicExecutable(RelocationModel::NonRelocatable),
        );
        // data16 lea foo@tlsgd(%rip),%rdi; data16 data16 rex.W call __tls_get_addr@plt
        let data = vec![
            0x66, 0x48, 0x8d, 0x3d, 0, 0, 0, 0, 0x66, 0x66, 0x48, 0xe8, 0, 0, 0, 0,
        ];
        let mut tls_sym = defined_symbol("tls_var");
        tls_sym.kind = SymbolKind::Tls;
        let mut objects = vec![InputObject {
            name: "test.o".to_owned(),
            sections: vec![code_section(
                data,
                vec![
                    Relocation {
                        offset: 4,
                        r_type: object::elf::R_X86_64_TLSGD,
                        symbol_index: 0,
                        addend: -4,
                    },
                    Relocation {
                        offset: 12,
                        r_type: object::elf::R_X86_64_PLT32,
                        symbol_index: 1,
                        addend: -4,
                    },
                ],
            )],
            symbols: vec![
                tls_sym,
                InputSymbol {
                    name: "__tls_get_addr".to_owned(),
                    kind: SymbolKind::Function,
                    binding: Binding::Global,
                    visibility: Visibility::Default,
                    placement: SymbolPlacement::Dynamic,
                    size: 0,
                },
            ],
        }];

        let mut symbol_db = SymbolDb::build(&objects, &args).unwrap();
        scan_references::<X86_64>(&mut objects, &mut symbol_db).unwrap();

        // The transition to local-exec consumed the pair, so the helper needs no PLT.
        let tls = symbol_db.global("tls_var").unwrap();
        assert!(symbol_db.symbol(tls).resolution_flags.is_empty());
        let helper = symbol_db.global("__tls_get_addr").unwrap();
        assert!(!symbol_db.symbol(helper).resolution_flags.needs_plt());
    }

    #[test]
    fn read_only_data_reference_to_shared_object_needs_copy_relocation() {
        let args = Args::new(
            Architecture::X86_64,
            OutputKind::DynamicExecutable(RelocationModel::NonRelocatable),
        );
        let mut data_section = code_section(
            vec![0; 8],
            vec![Relocation {
                offset: 0,
                r_type: object::elf::R_X86_64_64,
                symbol_index: 0,
                addend: 0,
            }],
        );
        data_section.name = ".rodata".to_owned();
        data_section.flags = SectionFlags::from_u64(u64::from(object::elf::SHF_ALLOC));
        let mut objects = vec![InputObject {
            name: "test.o".to_owned(),
            sections: vec![data_section],
            symbols: vec![InputSymbol {
                name: "shared_data".to_owned(),
                kind: SymbolKind::Object,
                binding: Binding::Global,
                visibility: Visibility::Default,
                placement: SymbolPlacement::Dynamic,
                size: 16,
            }],
        }];

        let mut symbol_db = SymbolDb::build(&objects, &args).unwrap();
        scan_references::<X86_64>(&mut objects, &mut symbol_db).unwrap();
        let id = symbol_db.global("shared_data").unwrap();
        assert!(symbol_db.symbol(id).resolution_flags.needs_copy_relocation());
    }
}
