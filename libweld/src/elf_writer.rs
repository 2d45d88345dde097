//! Populates the synthesised output: the GOT, the PLT, the dynamic relocation tables and the
//! packed relative-relocation section, then applies every relocation to the section images.
//!
//! Table sizes were settled during layout, so each table is carved into fixed-size records up
//! front and writing walks a cursor through them. Running out of records, or finishing with
//! records to spare, means layout and the writer disagreed about what gets emitted, and either is
//! reported as an internal error rather than papered over.

use crate::arch::Arch;
use crate::arch::PltEntryContext;
use crate::arch::PltLayout;
use crate::arch::Relaxation as _;
use crate::elf::CURRENT_EXE_TLS_MOD;
use crate::error::Result;
use crate::layout::AbsoluteDisposition;
use crate::layout::GotSlot;
use crate::layout::Layout;
use crate::layout::absolute_word_disposition;
use crate::layout::needs_jump_slot;
use crate::model::FileId;
use crate::model::InputObject;
use crate::model::Relocation;
use crate::model::Section;
use crate::relr;
use crate::scan::non_zero_address;
use crate::scan::plan_relaxation;
use crate::symbol_db::SymbolBinding;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use anyhow::Context as _;
use anyhow::anyhow;
use anyhow::bail;
use linker_utils::elf::DynamicRelocationKind;
use linker_utils::elf::RelocationKind;
use linker_utils::elf::SectionFlags;
use linker_utils::relaxation::RelocationModifier;

/// Everything the engine produced, handed back to the host for assembly into the output file.
#[derive(Debug)]
pub struct LinkOutput {
    pub got: Vec<u8>,
    pub got_address: u64,
    pub plt: Vec<u8>,
    pub plt_address: u64,
    pub rela_dyn: Vec<u8>,
    pub rela_dyn_address: u64,
    pub rela_plt: Vec<u8>,
    pub rela_plt_address: u64,
    pub relr: Vec<u8>,
    pub relr_address: u64,
    pub tls_start: u64,
    pub tls_end: u64,

    /// Address of each input section, indexed by file then section. None for discarded sections.
    pub section_addresses: Vec<Vec<Option<u64>>>,

    pub symbols: Vec<SymbolSummary>,
}

#[derive(Debug)]
pub struct SymbolSummary {
    pub name: String,
    pub value: u64,
    pub got_address: Option<u64>,
    pub plt_address: Option<u64>,
}

impl LinkOutput {
    #[must_use]
    pub fn symbol(&self, name: &str) -> Option<&SymbolSummary> {
        self.symbols.iter().find(|s| s.name == name)
    }
}

#[tracing::instrument(skip_all, name = "Write output")]
pub(crate) fn write_output<A: Arch>(
    objects: &mut [InputObject],
    symbol_db: &mut SymbolDb,
    layout: &Layout,
) -> Result<LinkOutput> {
    let args = symbol_db.args;
    let output_kind = args.output_kind();
    let word = A::GOT_ENTRY_SIZE;
    let record_size = size_of::<A::RelocationRecord>() as u64;

    let mut got = vec![0u8; layout.got_size as usize];
    let mut plt = vec![0u8; layout.plt_size as usize];
    let mut rela_dyn_bytes = vec![0u8; (layout.rela_dyn_count * record_size) as usize];
    let mut rela_plt_bytes = vec![0u8; (layout.rela_plt_count * record_size) as usize];
    let mut relr_candidates: Vec<u64> = Vec::new();

    let mut rela_dyn = TableWriter::<A>::new(".rela.dyn", &mut rela_dyn_bytes)?;
    let mut rela_plt = TableWriter::<A>::new(".rela.plt", &mut rela_plt_bytes)?;

    // The first reserved slot holds the link-time address of _DYNAMIC; the loader uses it to find
    // the dynamic section before any relocations have been applied.
    if output_kind.needs_dynamic() {
        if let Some(id) = symbol_db.global("_DYNAMIC") {
            let value = layout.symbol_value(symbol_db.symbol(id));
            write_got_entry::<A>(&mut got, 0, value)?;
        }
    }

    let plt_layout = A::plt_layout(args);
    write_plt_and_jump_slots::<A>(symbol_db, layout, plt_layout, &mut plt, &mut got, &mut rela_plt)?;
    write_symbol_got_entries::<A>(symbol_db, layout, &mut got, &mut rela_dyn, &mut relr_candidates)?;

    if let Some(offset) = layout.tlsld_got_offset {
        if output_kind.is_shared_object() {
            rela_dyn.write(layout.got_address + offset, DynamicRelocationKind::DtpMod, 0, 0)?;
        } else {
            write_got_entry::<A>(&mut got, offset, CURRENT_EXE_TLS_MOD)?;
        }
        write_got_entry::<A>(&mut got, offset + word, 0)?;
    }

    apply_relocations::<A>(objects, symbol_db, layout, &mut rela_dyn, &mut relr_candidates)?;

    rela_dyn.finish()?;
    rela_plt.finish()?;
    for id in symbol_db.symbol_ids() {
        let binding = symbol_db.symbol(id);
        if matches!(binding.got, GotSlot::Assigned(_)) {
            bail!("GOT slots for `{}` were never initialised", binding.name);
        }
    }

    let relr_words = relr::finish(&mut relr_candidates, word, layout.relr_sized_words)?;

    let symbols = symbol_db
        .symbol_ids()
        .map(|id| {
            let binding = symbol_db.symbol(id);
            SymbolSummary {
                name: binding.name.clone(),
                value: layout.symbol_value(binding),
                got_address: binding.got.offset().map(|o| layout.got_address + o),
                plt_address: binding.plt_offset.map(|o| layout.plt_address + o),
            }
        })
        .collect();

    Ok(LinkOutput {
        got,
        got_address: layout.got_address,
        plt,
        plt_address: layout.plt_address,
        rela_dyn: rela_dyn_bytes,
        rela_dyn_address: layout.rela_dyn_address,
        rela_plt: rela_plt_bytes,
        rela_plt_address: layout.rela_plt_address,
        relr: relr_to_bytes(&relr_words, word),
        relr_address: layout.relr_address,
        tls_start: layout.tls_start,
        tls_end: layout.tls_end,
        section_addresses: layout.section_addresses.clone(),
        symbols,
    })
}

/// Walks a cursor through a table of fixed-size dynamic relocation records.
struct TableWriter<'out, A: Arch> {
    name: &'static str,
    records: &'out mut [A::RelocationRecord],
    next: usize,
}

impl<'out, A: Arch> TableWriter<'out, A> {
    fn new(name: &'static str, bytes: &'out mut [u8]) -> Result<TableWriter<'out, A>> {
        let records = object::pod::slice_from_all_bytes_mut(bytes)
            .map_err(|()| anyhow!("Misaligned or odd-sized {name} table"))?;
        Ok(TableWriter {
            name,
            records,
            next: 0,
        })
    }

    /// Index the next record will get. Lazy PLT entries encode this for the resolver.
    fn next_index(&self) -> u32 {
        self.next as u32
    }

    fn write(
        &mut self,
        offset: u64,
        kind: DynamicRelocationKind,
        symbol_index: u32,
        addend: i64,
    ) -> Result {
        let r_type = A::get_dynamic_relocation_type(kind)?;
        let record = self
            .records
            .get_mut(self.next)
            .ok_or_else(|| anyhow!("Insufficient space allocated for {}", self.name))?;
        A::set_relocation(record, offset, r_type, symbol_index, addend);
        self.next += 1;
        Ok(())
    }

    fn finish(self) -> Result {
        if self.next != self.records.len() {
            bail!(
                "Allocated {} records for {} but wrote {}",
                self.records.len(),
                self.name,
                self.next
            );
        }
        Ok(())
    }
}

fn write_got_entry<A: Arch>(got: &mut [u8], offset: u64, value: u64) -> Result {
    let entry = A::got_entry(value);
    let bytes = bytemuck::bytes_of(&entry);
    let start = offset as usize;
    got.get_mut(start..start + bytes.len())
        .ok_or_else(|| anyhow!("GOT entry at 0x{offset:x} is outside the GOT"))?
        .copy_from_slice(bytes);
    Ok(())
}

fn required_dynsym_index(binding: &SymbolBinding) -> Result<u32> {
    binding
        .dynamic_symbol_index
        .map(|index| index.get())
        .ok_or_else(|| anyhow!("Missing dynamic symbol index for `{}`", binding.name))
}

fn write_plt_and_jump_slots<A: Arch>(
    symbol_db: &SymbolDb,
    layout: &Layout,
    plt_layout: &PltLayout,
    plt: &mut [u8],
    got: &mut [u8],
    rela_plt: &mut TableWriter<A>,
) -> Result {
    if plt.is_empty() {
        return Ok(());
    }
    if plt_layout.is_lazy() && !layout.plt_entries.is_empty() {
        let header = plt_layout.header_size() as usize;
        A::write_plt_header(
            plt_layout,
            &mut plt[..header],
            layout.got_address,
            layout.plt_address,
        )?;
    }

    for &id in &layout.plt_entries {
        let binding = symbol_db.symbol(id);
        let plt_offset = binding
            .plt_offset
            .ok_or_else(|| anyhow!("Missing PLT offset for `{}`", binding.name))?;
        let run = layout.got_run_of::<A>(binding)?;
        let got_offset = run
            .plain
            .ok_or_else(|| anyhow!("PLT entry for `{}` has no GOT slot", binding.name))?;
        let plt_entry_address = layout.plt_address + plt_offset;
        let got_entry_address = layout.got_address + got_offset;

        // Jump slots land in the relocation table in PLT entry order, which the lazy resolver
        // relies on. The ifunc entries form a contiguous tail after them.
        let mut record_index = None;
        if binding.value_flags.is_ifunc() {
            let resolver = layout.symbol_value(binding);
            record_index = Some(rela_plt.next_index());
            rela_plt.write(
                got_entry_address,
                DynamicRelocationKind::Irelative,
                0,
                resolver as i64,
            )?;
            let initial = if A::USES_RELA { 0 } else { resolver };
            write_got_entry::<A>(got, got_offset, initial)?;
        } else if needs_jump_slot(binding) {
            record_index = Some(rela_plt.next_index());
            rela_plt.write(
                got_entry_address,
                DynamicRelocationKind::JumpSlot,
                required_dynsym_index(binding)?,
                0,
            )?;
            // Until the resolver has run, the slot sends the first call back into the entry,
            // landing just past the initial indirect jump. Eager binding starts from zero and
            // the loader fills the slot before anything runs.
            let initial = if plt_layout.is_lazy() {
                plt_entry_address + plt_layout.lazy_resume_offset
            } else {
                0
            };
            write_got_entry::<A>(got, got_offset, initial)?;
        } else {
            // Resolved at link time. The entry still dispatches through its slot, which we fill
            // ourselves.
            write_got_entry::<A>(got, got_offset, layout.symbol_value(binding))?;
        }

        let ctx = PltEntryContext {
            plt_entry_address,
            got_entry_address,
            got_base_address: layout.got_address,
            plt0_address: plt_layout.is_lazy().then_some(layout.plt_address),
            relocation_index: Some(record_index.unwrap_or(0)),
        };
        let entry_end = (plt_offset + plt_layout.entry_size()) as usize;
        A::write_plt_entry(plt_layout, &mut plt[plt_offset as usize..entry_end], &ctx)?;
    }

    if let Some(offset) = layout.tlsdesc_plt_offset {
        let template_len = plt_layout.tlsdesc_template.map_or(0, <[u8]>::len);
        let tlsdesc_got_offset = layout
            .tlsdesc_got_offset
            .ok_or_else(|| anyhow!("TLS descriptor trampoline has no GOT slot"))?;
        A::write_tlsdesc_plt_entry(
            plt_layout,
            &mut plt[offset as usize..offset as usize + template_len],
            layout.got_address,
            layout.got_address + tlsdesc_got_offset,
            layout.plt_address + offset,
        )?;
    }
    Ok(())
}

/// Fills each symbol's GOT run and emits the dynamic records that go with it. Plain slots owned
/// by PLT entries were already written as jump slots and are skipped here; everything else in a
/// run belongs to this pass, which also flips the symbol's write-once latch.
fn write_symbol_got_entries<A: Arch>(
    symbol_db: &mut SymbolDb,
    layout: &Layout,
    got: &mut [u8],
    rela_dyn: &mut TableWriter<A>,
    relr_candidates: &mut Vec<u64>,
) -> Result {
    let args = symbol_db.args;
    let output_kind = args.output_kind();
    let relocatable = output_kind.is_relocatable();
    let pack = args.pack_relative_relocs && relocatable;
    let word = A::GOT_ENTRY_SIZE;

    for id in symbol_db.symbol_ids().collect::<Vec<_>>() {
        let binding = symbol_db.symbol(id);
        let flags = binding.resolution_flags;

        if flags.needs_copy_relocation() {
            let address = binding.copy_relocation_address.ok_or_else(|| {
                anyhow!("Missing copy relocation address for `{}`", binding.name)
            })?;
            rela_dyn.write(
                address,
                DynamicRelocationKind::Copy,
                required_dynsym_index(binding)?,
                0,
            )?;
        }

        if binding.got.offset().is_none() {
            continue;
        }
        let run = layout.got_run_of::<A>(binding)?;
        let value = layout.symbol_value(binding);
        let interposable = binding.value_flags.is_interposable();
        let dynamic = binding.value_flags.is_dynamic();
        let sym_index = binding.dynamic_symbol_index.map_or(0, |index| index.get());

        // Offset of the symbol within its module's TLS block. Records bound to no dynamic symbol
        // carry it as their addend.
        let module_offset = value.wrapping_sub(layout.tls_start);
        let runtime_tls = interposable || output_kind.is_shared_object();

        if let Some(offset) = run.tp_off {
            if runtime_tls {
                let addend = if sym_index == 0 { module_offset as i64 } else { 0 };
                rela_dyn.write(
                    layout.got_address + offset,
                    DynamicRelocationKind::TpOff,
                    sym_index,
                    addend,
                )?;
                write_got_entry::<A>(got, offset, rel_slot_addend::<A>(addend))?;
            } else {
                write_got_entry::<A>(got, offset, value.wrapping_sub(layout.tls_end))?;
            }
        }
        if let Some(offset) = run.tp_off_positive {
            if runtime_tls {
                let addend = if sym_index == 0 { module_offset as i64 } else { 0 };
                rela_dyn.write(
                    layout.got_address + offset,
                    DynamicRelocationKind::TpOffPositive,
                    sym_index,
                    addend,
                )?;
                write_got_entry::<A>(got, offset, rel_slot_addend::<A>(addend))?;
            } else {
                write_got_entry::<A>(got, offset, layout.tls_end.wrapping_sub(value))?;
            }
        }
        if let Some(offset) = run.tls_module {
            if output_kind.is_executable() && !dynamic {
                // Module IDs are 1-based; the main executable is always module 1.
                write_got_entry::<A>(got, offset, CURRENT_EXE_TLS_MOD)?;
            } else {
                rela_dyn.write(
                    layout.got_address + offset,
                    DynamicRelocationKind::DtpMod,
                    sym_index,
                    0,
                )?;
                write_got_entry::<A>(got, offset, 0)?;
            }
            let offset_slot = offset + word;
            if interposable {
                rela_dyn.write(
                    layout.got_address + offset_slot,
                    DynamicRelocationKind::DtpOff,
                    sym_index,
                    0,
                )?;
                write_got_entry::<A>(got, offset_slot, 0)?;
            } else {
                write_got_entry::<A>(got, offset_slot, module_offset)?;
            }
        }
        if let Some(offset) = run.tls_descriptor {
            let addend = if sym_index == 0 { module_offset as i64 } else { 0 };
            rela_dyn.write(
                layout.got_address + offset,
                DynamicRelocationKind::TlsDesc,
                sym_index,
                addend,
            )?;
            write_got_entry::<A>(got, offset, 0)?;
            // With implicit addends the descriptor's argument word carries the addend.
            write_got_entry::<A>(got, offset + word, rel_slot_addend::<A>(addend))?;
        }
        if let Some(offset) = run.plain {
            if !flags.needs_plt() {
                let address = layout.got_address + offset;
                if dynamic && !binding.value_flags.is_absolute() {
                    rela_dyn.write(address, DynamicRelocationKind::GotEntry, sym_index, 0)?;
                    write_got_entry::<A>(got, offset, 0)?;
                } else if binding.value_flags.is_address() && relocatable {
                    if pack && address % word == 0 {
                        relr_candidates.push(address);
                    } else {
                        rela_dyn.write(address, DynamicRelocationKind::Relative, 0, value as i64)?;
                    }
                    write_got_entry::<A>(got, offset, value)?;
                } else {
                    write_got_entry::<A>(got, offset, value)?;
                }
            }
        }

        symbol_db.symbol_mut(id).got.mark_initialized()?;
    }
    Ok(())
}

/// The value stored in a slot covered by a dynamic record: the addend when records don't carry
/// one, zero otherwise.
fn rel_slot_addend<A: Arch>(addend: i64) -> u64 {
    if A::USES_RELA { 0 } else { addend as u64 }
}

#[tracing::instrument(skip_all, name = "Apply relocations")]
fn apply_relocations<A: Arch>(
    objects: &mut [InputObject],
    symbol_db: &SymbolDb,
    layout: &Layout,
    rela_dyn: &mut TableWriter<A>,
    relr_candidates: &mut Vec<u64>,
) -> Result {
    for (file_number, object) in objects.iter_mut().enumerate() {
        let file_id = FileId::new(file_number as u32);
        let InputObject {
            name,
            sections,
            symbols,
        } = object;
        for (section_index, section) in sections.iter_mut().enumerate() {
            if !section.retained {
                continue;
            }
            let Some(section_address) = layout.section_address(file_id, section_index) else {
                continue;
            };
            let section_flags = section.flags;
            let section_writable = section.is_writable();
            let Section {
                name: section_name,
                data,
                relocations,
                ..
            } = section;

            let mut modifier = RelocationModifier::Normal;
            for rel in relocations.iter() {
                if modifier == RelocationModifier::SkipNextRelocation {
                    modifier = RelocationModifier::Normal;
                    continue;
                }
                let symbol_id = symbol_db.resolve_ref(file_id, symbols, name, rel.symbol_index)?;
                modifier = apply_relocation::<A>(
                    rel,
                    data,
                    section_address,
                    section_flags,
                    section_writable,
                    symbol_id,
                    symbol_db,
                    layout,
                    rela_dyn,
                    relr_candidates,
                )
                .with_context(|| {
                    format!(
                        "applying {} at offset 0x{:x} in section `{section_name}` of {name}",
                        A::rel_type_to_string(rel.r_type),
                        rel.offset,
                    )
                })?;
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_relocation<A: Arch>(
    rel: &Relocation,
    data: &mut [u8],
    section_address: u64,
    section_flags: SectionFlags,
    section_writable: bool,
    symbol_id: SymbolId,
    symbol_db: &SymbolDb,
    layout: &Layout,
    rela_dyn: &mut TableWriter<A>,
    relr_candidates: &mut Vec<u64>,
) -> Result<RelocationModifier> {
    let args = symbol_db.args;
    let output_kind = args.output_kind();
    let relocatable = output_kind.is_relocatable();
    let pack = args.pack_relative_relocs && relocatable;
    let binding = symbol_db.symbol(symbol_id);
    let value_flags = binding.value_flags;
    let resolution_flags = binding.resolution_flags;

    // TLS transitions and other non-persisted rewrites are re-derived here and applied to the
    // output image. GOT-load conversions were already folded into the input during scanning, so
    // re-planning those sites finds an ordinary relocation.
    let mut offset = rel.offset;
    let mut addend = rel.addend;
    let rel_info;
    let mut modifier = RelocationModifier::Normal;
    if let Some(relaxation) = plan_relaxation::<A>(
        rel.r_type,
        data,
        offset,
        addend,
        value_flags,
        non_zero_address(binding.placement),
        symbol_db.is_dynamic_marker(symbol_id),
        args,
        section_flags,
    )? {
        relaxation.apply(data, &mut offset, &mut addend);
        rel_info = relaxation.rel_info();
        modifier = relaxation.next_modifier();
    } else {
        rel_info = A::relocation_from_raw(rel.r_type)?;
    }

    if matches!(
        rel_info.kind,
        RelocationKind::None | RelocationKind::TlsDescCall
    ) {
        return Ok(modifier);
    }

    let place = section_address + offset;
    // References to an interposable function bind to its PLT entry; that's the address the
    // symbol resolves to everywhere in this link.
    let symbol_value = if value_flags.is_dynamic() && resolution_flags.needs_plt() {
        layout.plt_address_of(binding)?
    } else {
        layout.symbol_value(binding)
    };

    let s = symbol_value as i64;
    let a = addend;
    let p = place as i64;
    let got_base = layout.got_address as i64;
    let tls_start = layout.tls_start as i64;
    let tls_end = layout.tls_end as i64;

    let field_start = offset as usize;
    let field = data
        .get_mut(field_start..field_start + rel_info.byte_size)
        .ok_or_else(|| anyhow!("Relocation is outside its section"))?;

    let value: i64 = match rel_info.kind {
        RelocationKind::None | RelocationKind::TlsDescCall => return Ok(modifier),
        RelocationKind::Absolute => {
            if rel_info.byte_size as u64 == A::GOT_ENTRY_SIZE {
                match absolute_word_disposition(
                    value_flags,
                    resolution_flags,
                    section_writable,
                    relocatable,
                ) {
                    AbsoluteDisposition::Value => s.wrapping_add(a),
                    AbsoluteDisposition::GeneralRecord => {
                        rela_dyn.write(
                            place,
                            DynamicRelocationKind::Absolute,
                            required_dynsym_index(binding)?,
                            a,
                        )?;
                        rel_info.write_value(a as u64, field);
                        return Ok(modifier);
                    }
                    AbsoluteDisposition::RelativeRecord => {
                        let value = s.wrapping_add(a);
                        if pack && place % A::GOT_ENTRY_SIZE == 0 {
                            relr_candidates.push(place);
                        } else {
                            rela_dyn.write(place, DynamicRelocationKind::Relative, 0, value)?;
                        }
                        rel_info.write_value(value as u64, field);
                        return Ok(modifier);
                    }
                }
            } else {
                s.wrapping_add(a)
            }
        }
        RelocationKind::Relative => s.wrapping_add(a).wrapping_sub(p),
        RelocationKind::SymRelGotBase => s.wrapping_add(a).wrapping_sub(got_base),
        RelocationKind::GotBaseRelative => got_base + a - p,
        RelocationKind::PltRelative => {
            let l = if binding.plt_offset.is_some() {
                layout.plt_address_of(binding)? as i64
            } else {
                s
            };
            l.wrapping_add(a).wrapping_sub(p)
        }
        RelocationKind::PltRelGotBase => {
            let l = if binding.plt_offset.is_some() {
                layout.plt_address_of(binding)? as i64
            } else {
                s
            };
            l.wrapping_add(a).wrapping_sub(got_base)
        }
        RelocationKind::Got => {
            let slot = got_slot::<A>(layout, binding, |run| run.plain, "address")?;
            slot as i64 + a
        }
        RelocationKind::GotRelative => {
            let slot = got_slot::<A>(layout, binding, |run| run.plain, "address")?;
            got_base + slot as i64 + a - p
        }
        RelocationKind::TlsGd => {
            let slot = got_slot::<A>(layout, binding, |run| run.tls_module, "general-dynamic")?;
            got_base + slot as i64 + a - p
        }
        RelocationKind::TlsGdGotBase => {
            let slot = got_slot::<A>(layout, binding, |run| run.tls_module, "general-dynamic")?;
            slot as i64 + a
        }
        RelocationKind::TlsLd => tlsld_offset(layout)? + got_base + a - p,
        RelocationKind::TlsLdGotBase => tlsld_offset(layout)? + a,
        RelocationKind::DtpOff => {
            // In executables the local-dynamic sequence has been rewritten to local-exec, so the
            // offsets it feeds are thread-pointer relative. Shared objects keep the model and the
            // offsets stay relative to the module's TLS block.
            if output_kind.is_shared_object() {
                s + a - tls_start
            } else {
                s + a - tls_end
            }
        }
        RelocationKind::GotTpOff => {
            let slot = got_slot::<A>(layout, binding, |run| run.tp_off, "initial-exec")?;
            got_base + slot as i64 + a - p
        }
        RelocationKind::GotTpOffGotBase => {
            let slot = got_slot::<A>(layout, binding, |run| run.tp_off, "initial-exec")?;
            slot as i64 + a
        }
        RelocationKind::GotTpOffAbsolute => {
            let slot = got_slot::<A>(layout, binding, |run| run.tp_off, "initial-exec")?;
            got_base + slot as i64 + a
        }
        RelocationKind::GotTpOffPositiveGotBase => {
            let slot = got_slot::<A>(layout, binding, |run| run.tp_off_positive, "initial-exec")?;
            slot as i64 + a
        }
        RelocationKind::TpOff => s + a - tls_end,
        RelocationKind::TpOffPositive => tls_end - s - a,
        RelocationKind::TlsDesc => {
            let slot = got_slot::<A>(layout, binding, |run| run.tls_descriptor, "descriptor")?;
            got_base + slot as i64 + a - p
        }
        RelocationKind::TlsDescGotBase => {
            let slot = got_slot::<A>(layout, binding, |run| run.tls_descriptor, "descriptor")?;
            slot as i64 + a
        }
        RelocationKind::Size => binding.size as i64 + a,
    };

    if !args.skip_overflow_checks {
        rel_info
            .verify(value)
            .with_context(|| format!("relocation against {}", symbol_db.symbol_debug(symbol_id)))?;
    }
    rel_info.write_value(value as u64, field);
    Ok(modifier)
}

fn got_slot<A: Arch>(
    layout: &Layout,
    binding: &SymbolBinding,
    select: impl FnOnce(&crate::layout::GotRun) -> Option<u64>,
    what: &str,
) -> Result<u64> {
    let run = layout.got_run_of::<A>(binding)?;
    select(&run).ok_or_else(|| anyhow!("Missing {what} GOT entry for `{}`", binding.name))
}

fn tlsld_offset(layout: &Layout) -> Result<i64> {
    layout
        .tlsld_got_offset
        .map(|offset| offset as i64)
        .ok_or_else(|| anyhow!("Local-dynamic TLS access without a module GOT pair"))
}

fn relr_to_bytes(words: &[u64], word_size: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * word_size as usize);
    for &word in words {
        if word_size == 8 {
            out.extend_from_slice(&word.to_le_bytes());
        } else {
            out.extend_from_slice(&(word as u32).to_le_bytes());
        }
    }
    out
}
