//! Turns the demands recorded by the scan pass into concrete addresses: where each input section
//! lands, which GOT/PLT slots each symbol owns, how many dynamic relocation records the output
//! tables need and, when relative relocations are packed, how many words the packed section
//! occupies.
//!
//! The packed section's size feeds back into the addresses of everything placed after it, so
//! sizing runs as an explicit fixed-point loop with an iteration cap. The word count never
//! shrinks between iterations; a final encoding that comes up short is padded with filler words.

use crate::arch::Arch;
use crate::elf::RESERVED_GOT_PLT_ENTRIES;
use crate::error::Result;
use crate::model::FileId;
use crate::model::InputObject;
use crate::model::SymbolPlacement;
use crate::relr;
use crate::scan::ScanOutputs;
use crate::symbol_db::SymbolBinding;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crate::symbol_db::ValueFlags;
use anyhow::bail;
use bitflags::bitflags;
use linker_utils::elf::RelocationKind;
use smallvec::SmallVec;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;

bitflags! {
    /// The union of the ways in which references demanded that a symbol be reachable. Merged
    /// atomically during the scan, then read-only from layout onward.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct ResolutionFlags: u16 {
        /// The symbol's value is used directly, e.g. via an absolute or PC-relative relocation.
        const DIRECT = 1 << 0;

        const GOT = 1 << 1;

        const PLT = 1 << 2;

        /// A general-dynamic (module, offset) GOT pair.
        const GOT_TLS_MODULE = 1 << 3;

        /// An initial-exec GOT entry holding the negative thread-pointer offset.
        const GOT_TLS_OFFSET = 1 << 4;

        /// An initial-exec GOT entry holding the positive offset. i386 only; the two forms can
        /// coexist for one symbol.
        const GOT_TLS_OFFSET_POSITIVE = 1 << 5;

        /// A TLS descriptor GOT pair.
        const GOT_TLS_DESCRIPTOR = 1 << 6;

        /// The symbol must appear in the dynamic symbol table.
        const EXPORT_DYNAMIC = 1 << 7;

        /// Space in the executable plus a copy relocation pulling the definition out of its
        /// shared object.
        const COPY_RELOCATION = 1 << 8;
    }
}

impl ResolutionFlags {
    pub(crate) fn needs_got(self) -> bool {
        self.contains(ResolutionFlags::GOT)
    }

    pub(crate) fn needs_plt(self) -> bool {
        self.contains(ResolutionFlags::PLT)
    }

    pub(crate) fn needs_copy_relocation(self) -> bool {
        self.contains(ResolutionFlags::COPY_RELOCATION)
    }

    pub(crate) fn needs_export_dynamic(self) -> bool {
        self.contains(ResolutionFlags::EXPORT_DYNAMIC)
    }

    pub(crate) fn needs_tls_offset(self) -> bool {
        self.contains(ResolutionFlags::GOT_TLS_OFFSET)
    }

    pub(crate) fn needs_tls_offset_positive(self) -> bool {
        self.contains(ResolutionFlags::GOT_TLS_OFFSET_POSITIVE)
    }

    pub(crate) fn needs_tls_module(self) -> bool {
        self.contains(ResolutionFlags::GOT_TLS_MODULE)
    }

    pub(crate) fn needs_tls_descriptor(self) -> bool {
        self.contains(ResolutionFlags::GOT_TLS_DESCRIPTOR)
    }
}

impl std::fmt::Display for ResolutionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        bitflags::parser::to_writer(self, f)
    }
}

/// Demand bits shared between scan workers. Writes merge with a check-then-CAS so that the
/// common case, where the bits are already set, stays a plain load.
pub(crate) struct AtomicResolutionFlags {
    value: AtomicU16,
}

impl AtomicResolutionFlags {
    pub(crate) fn empty() -> Self {
        Self {
            value: AtomicU16::new(ResolutionFlags::empty().bits()),
        }
    }

    pub(crate) fn fetch_or(&self, flags: ResolutionFlags) {
        // Relaxed is fine, we don't need any ordering relative to other operations and atomic
        // or-operations still work with relaxed ordering.
        let current = self.value.load(Ordering::Relaxed);
        if current & flags.bits() == flags.bits() {
            return;
        }
        self.value.fetch_or(flags.bits(), Ordering::Relaxed);
    }

    pub(crate) fn into_non_atomic(self) -> ResolutionFlags {
        ResolutionFlags::from_bits_retain(self.value.into_inner())
    }
}

/// A symbol's GOT allocation. The offset is the byte offset of the symbol's first slot within the
/// GOT; TLS symbols may own a run of several slots starting there. The initialized state is a
/// write-once latch: the writer moves each assigned slot to initialized exactly once, and the
/// final consistency check fails on any slot left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GotSlot {
    Unassigned,
    Assigned(u64),
    AssignedAndInitialized(u64),
}

impl GotSlot {
    pub(crate) fn offset(self) -> Option<u64> {
        match self {
            GotSlot::Unassigned => None,
            GotSlot::Assigned(offset) | GotSlot::AssignedAndInitialized(offset) => Some(offset),
        }
    }

    pub(crate) fn assign(&mut self, offset: u64) -> Result {
        match *self {
            GotSlot::Unassigned => {
                *self = GotSlot::Assigned(offset);
                Ok(())
            }
            _ => bail!("GOT slot assigned twice"),
        }
    }

    pub(crate) fn mark_initialized(&mut self) -> Result<u64> {
        match *self {
            GotSlot::Assigned(offset) => {
                *self = GotSlot::AssignedAndInitialized(offset);
                Ok(offset)
            }
            GotSlot::Unassigned => bail!("Attempted to initialise an unassigned GOT slot"),
            GotSlot::AssignedAndInitialized(_) => bail!("GOT slot initialised twice"),
        }
    }
}

/// Byte offsets of the individual entries within a symbol's GOT run. The order is fixed:
/// initial-exec offset entries first, then the general-dynamic pair, then the descriptor pair,
/// then the plain address entry.
pub(crate) struct GotRun {
    pub(crate) tp_off: Option<u64>,
    pub(crate) tp_off_positive: Option<u64>,
    pub(crate) tls_module: Option<u64>,
    pub(crate) tls_descriptor: Option<u64>,
    pub(crate) plain: Option<u64>,
    pub(crate) len: u64,
}

pub(crate) fn got_run(flags: ResolutionFlags, start_offset: u64, entry_size: u64) -> GotRun {
    let mut next = start_offset;
    let mut take = |slots: u64, wanted: bool| {
        if !wanted {
            return None;
        }
        let offset = next;
        next += slots * entry_size;
        Some(offset)
    };
    GotRun {
        tp_off: take(1, flags.needs_tls_offset()),
        tp_off_positive: take(1, flags.needs_tls_offset_positive()),
        tls_module: take(2, flags.needs_tls_module()),
        tls_descriptor: take(2, flags.needs_tls_descriptor()),
        plain: take(1, flags.needs_got()),
        len: next - start_offset,
    }
}

/// What the applier does with a word-sized absolute relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AbsoluteDisposition {
    /// Patch the final value. Covers link-time constants, copy-relocated data and canonical PLT
    /// addresses.
    Value,

    /// Emit a symbolic dynamic relocation; the runtime value isn't known at link time.
    GeneralRecord,

    /// Emit a relative relocation (packed or as a table record) carrying the link-time value.
    RelativeRecord,
}

pub(crate) fn absolute_word_disposition(
    value_flags: ValueFlags,
    resolution_flags: ResolutionFlags,
    section_is_writable: bool,
    relocatable: bool,
) -> AbsoluteDisposition {
    if resolution_flags.needs_copy_relocation() || resolution_flags.needs_plt() {
        return AbsoluteDisposition::Value;
    }
    if value_flags.is_dynamic() && value_flags.is_interposable() && section_is_writable {
        return AbsoluteDisposition::GeneralRecord;
    }
    if value_flags.is_address() && relocatable {
        return AbsoluteDisposition::RelativeRecord;
    }
    AbsoluteDisposition::Value
}

/// Whether a symbol's plain GOT entry is a jump slot filled in by the runtime loader rather than
/// by us.
pub(crate) fn needs_jump_slot(binding: &SymbolBinding) -> bool {
    binding.resolution_flags.needs_plt()
        && !binding.value_flags.is_ifunc()
        && (binding.value_flags.is_dynamic() || binding.value_flags.is_interposable())
}

/// Everything the write pass needs to know about where things go.
pub(crate) struct Layout {
    /// Address of each section, indexed by file then section. None for discarded sections.
    pub(crate) section_addresses: Vec<Vec<Option<u64>>>,

    pub(crate) tls_start: u64,
    pub(crate) tls_end: u64,

    pub(crate) rela_dyn_address: u64,
    pub(crate) rela_dyn_count: u64,
    pub(crate) rela_plt_address: u64,
    pub(crate) rela_plt_count: u64,

    pub(crate) relr_address: u64,

    /// Number of packed words the section was sized for. The finishing encode must not exceed
    /// this and pads up to it.
    pub(crate) relr_sized_words: usize,

    pub(crate) plt_address: u64,
    pub(crate) plt_size: u64,
    pub(crate) got_address: u64,
    pub(crate) got_size: u64,

    /// PLT owners in entry order: regular entries first, then the ifunc tail.
    pub(crate) plt_entries: Vec<SymbolId>,

    /// Offset within the PLT of the TLS descriptor trampoline, when one is needed.
    pub(crate) tlsdesc_plt_offset: Option<u64>,

    /// Offset within the GOT of the module's local-dynamic (module, offset) pair.
    pub(crate) tlsld_got_offset: Option<u64>,

    /// Offset within the GOT of the slot the TLS descriptor trampoline dispatches through.
    pub(crate) tlsdesc_got_offset: Option<u64>,
}

impl Layout {
    pub(crate) fn section_address(&self, file_id: FileId, section_index: usize) -> Option<u64> {
        self.section_addresses[file_id.as_usize()][section_index]
    }

    /// The link-time value of a symbol: its address, its absolute value, its copy-relocation
    /// home, or zero for values only the runtime knows.
    pub(crate) fn symbol_value(&self, binding: &SymbolBinding) -> u64 {
        if let Some(address) = binding.copy_relocation_address {
            return address;
        }
        match binding.placement {
            SymbolPlacement::Absolute(value) => value,
            SymbolPlacement::Section {
                section_index,
                offset,
            } => self
                .section_address(binding.file_id, section_index)
                .map_or(0, |address| address + offset),
            SymbolPlacement::Undefined | SymbolPlacement::Dynamic => 0,
        }
    }

    pub(crate) fn plt_address_of(&self, binding: &SymbolBinding) -> Result<u64> {
        let offset = binding
            .plt_offset
            .ok_or_else(|| anyhow::anyhow!("Missing PLT entry for `{}`", binding.name))?;
        Ok(self.plt_address + offset)
    }

    pub(crate) fn got_run_of<A: Arch>(&self, binding: &SymbolBinding) -> Result<GotRun> {
        let start = binding
            .got
            .offset()
            .ok_or_else(|| anyhow::anyhow!("Missing GOT allocation for `{}`", binding.name))?;
        Ok(got_run(binding.resolution_flags, start, A::GOT_ENTRY_SIZE))
    }
}

const MAX_SIZING_ITERATIONS: usize = 8;

struct Addresses {
    rela_dyn_address: u64,
    rela_plt_address: u64,
    relr_address: u64,
    plt_address: u64,
    got_address: u64,
    section_addresses: Vec<Vec<Option<u64>>>,
    tls_start: u64,
    tls_end: u64,
    copy_region_address: u64,
}

struct Sizes {
    rela_dyn_count: u64,
    rela_plt_count: u64,
    relr_words: usize,
    plt_size: u64,
    got_size: u64,
}

#[tracing::instrument(skip_all, name = "Layout")]
pub(crate) fn compute_layout<A: Arch>(
    objects: &[InputObject],
    symbol_db: &mut SymbolDb,
    scan: &ScanOutputs,
) -> Result<Layout> {
    let args = symbol_db.args;
    let output_kind = args.output_kind();
    let relocatable = output_kind.is_relocatable();

    finalise_resolutions(symbol_db);
    assign_dynamic_symbol_indexes(symbol_db);

    let plt_layout = A::plt_layout(args);

    // PLT entries, regular first so that the ifunc relocations form a contiguous tail run.
    let mut plt_entries: Vec<SymbolId> = Vec::new();
    let mut ifunc_entries: Vec<SymbolId> = Vec::new();
    for id in symbol_db.symbol_ids() {
        let binding = symbol_db.symbol(id);
        if !binding.resolution_flags.needs_plt() {
            continue;
        }
        if binding.value_flags.is_ifunc() {
            ifunc_entries.push(id);
        } else {
            plt_entries.push(id);
        }
    }
    plt_entries.append(&mut ifunc_entries);

    for (index, &id) in plt_entries.iter().enumerate() {
        symbol_db.symbol_mut(id).plt_offset =
            Some(plt_layout.header_size() + index as u64 * plt_layout.entry_size());
    }

    let needs_tlsdesc_trampoline = plt_layout.tlsdesc_template.is_some()
        && symbol_db
            .symbol_ids()
            .any(|id| symbol_db.symbol(id).resolution_flags.needs_tls_descriptor());
    let mut plt_size = if plt_entries.is_empty() {
        0
    } else {
        plt_layout.header_size() + plt_entries.len() as u64 * plt_layout.entry_size()
    };
    let tlsdesc_plt_offset = needs_tlsdesc_trampoline.then(|| {
        let offset = plt_size;
        plt_size += plt_layout
            .tlsdesc_template
            .map_or(0, |template| template.len() as u64);
        offset
    });

    // GOT slots. Jump slots must land in PLT entry order for the lazy resolver, so PLT owners
    // are assigned before everything else.
    let entry_size = A::GOT_ENTRY_SIZE;
    let mut got_cursor = RESERVED_GOT_PLT_ENTRIES * entry_size;
    for &id in &plt_entries {
        let binding = symbol_db.symbol_mut(id);
        let run = got_run(binding.resolution_flags, got_cursor, entry_size);
        binding.got.assign(got_cursor)?;
        got_cursor += run.len;
    }
    for id in symbol_db.symbol_ids().collect::<Vec<_>>() {
        let binding = symbol_db.symbol_mut(id);
        if binding.got.offset().is_some() {
            continue;
        }
        let run = got_run(binding.resolution_flags, got_cursor, entry_size);
        if run.len == 0 {
            continue;
        }
        binding.got.assign(got_cursor)?;
        got_cursor += run.len;
    }
    let tlsld_got_offset = scan.uses_tlsld.then(|| {
        let offset = got_cursor;
        got_cursor += 2 * entry_size;
        offset
    });
    let tlsdesc_got_offset = needs_tlsdesc_trampoline.then(|| {
        let offset = got_cursor;
        got_cursor += entry_size;
        offset
    });
    let got_size = got_cursor;

    // Copy-relocation space, as offsets into a region whose address is settled below. Most links
    // have no copy relocations at all.
    let mut copy_offsets: SmallVec<[(SymbolId, u64); 4]> = SmallVec::new();
    let mut copy_region_size = 0u64;
    for id in symbol_db.symbol_ids() {
        let binding = symbol_db.symbol(id);
        if !binding.resolution_flags.needs_copy_relocation() {
            continue;
        }
        copy_region_size = copy_region_size.next_multiple_of(8);
        copy_offsets.push((id, copy_region_size));
        copy_region_size += binding.size.max(1);
    }

    let rela_plt_count = count_plt_relocations(symbol_db, &plt_entries);

    // Relative-relocation candidates: plain GOT entries holding link-time addresses, and
    // word-sized absolute fields in the section images. Which of them pack depends only on
    // address alignment, so the sites can be collected once up front.
    let relative_got_offsets = collect_relative_got_offsets::<A>(symbol_db);
    let section_record_sites = collect_section_record_sites::<A>(objects, symbol_db)?;
    let section_sites = section_record_sites.relative;

    let base_rela_dyn_count =
        count_symbol_relocations(symbol_db, scan)? + section_record_sites.general_count;

    let pack = args.pack_relative_relocs && relocatable;
    let mut sizes = Sizes {
        rela_dyn_count: 0,
        rela_plt_count,
        relr_words: 0,
        plt_size,
        got_size,
    };

    let mut iteration = 0;
    let (addresses, relr_sized_words) = loop {
        if iteration == MAX_SIZING_ITERATIONS {
            bail!("Relative relocation packing failed to converge");
        }
        iteration += 1;

        let addresses = place::<A>(objects, output_kind, &sizes);

        let mut packed: Vec<u64> = Vec::new();
        let mut unpacked = 0u64;
        let mut add_candidate = |address: u64| {
            if pack && address % entry_size == 0 {
                packed.push(address);
            } else {
                unpacked += 1;
            }
        };
        for &offset in &relative_got_offsets {
            add_candidate(addresses.got_address + offset);
        }
        for &(file, section_index, offset) in &section_sites {
            if let Some(base) = addresses.section_addresses[file][section_index] {
                add_candidate(base + offset);
            }
        }
        packed.sort_unstable();

        // The packed section never shrinks; a later encode that comes up short is padded.
        let relr_words = if pack {
            sizes.relr_words.max(relr::encode(&packed, entry_size).len())
        } else {
            0
        };
        let rela_dyn_count = base_rela_dyn_count + unpacked;

        if relr_words == sizes.relr_words && rela_dyn_count == sizes.rela_dyn_count {
            break (addresses, relr_words);
        }
        sizes.relr_words = relr_words;
        sizes.rela_dyn_count = rela_dyn_count;
    };

    for (id, offset) in copy_offsets {
        symbol_db.symbol_mut(id).copy_relocation_address =
            Some(addresses.copy_region_address + offset);
    }

    tracing::debug!(
        plt_entries = plt_entries.len(),
        got_size = sizes.got_size,
        rela_dyn = sizes.rela_dyn_count,
        rela_plt = sizes.rela_plt_count,
        relr_words = relr_sized_words,
        "layout complete"
    );

    Ok(Layout {
        section_addresses: addresses.section_addresses,
        tls_start: addresses.tls_start,
        tls_end: addresses.tls_end,
        rela_dyn_address: addresses.rela_dyn_address,
        rela_dyn_count: sizes.rela_dyn_count,
        rela_plt_address: addresses.rela_plt_address,
        rela_plt_count: sizes.rela_plt_count,
        relr_address: addresses.relr_address,
        relr_sized_words,
        plt_address: addresses.plt_address,
        plt_size: sizes.plt_size,
        got_address: addresses.got_address,
        got_size: sizes.got_size,
        plt_entries,
        tlsdesc_plt_offset,
        tlsld_got_offset,
        tlsdesc_got_offset,
    })
}

/// Settles each symbol's final demand set. Ifuncs can only be reached via their PLT, and a PLT
/// entry always dispatches through a GOT slot.
fn finalise_resolutions(symbol_db: &mut SymbolDb) {
    let output_kind = symbol_db.args.output_kind();
    for id in symbol_db.symbol_ids().collect::<Vec<_>>() {
        let binding = symbol_db.symbol_mut(id);
        let mut flags = binding.resolution_flags;
        if flags.is_empty() {
            continue;
        }
        if binding.value_flags.is_ifunc() {
            flags |= ResolutionFlags::GOT | ResolutionFlags::PLT;
        }
        if flags.needs_plt() {
            flags |= ResolutionFlags::GOT;
        }
        if flags.needs_copy_relocation() {
            flags |= ResolutionFlags::DIRECT;
        }
        if output_kind.is_shared_object()
            && binding.value_flags.is_address()
            && binding.value_flags.is_interposable()
        {
            flags |= ResolutionFlags::EXPORT_DYNAMIC;
        }
        binding.resolution_flags = flags;
    }
}

fn assign_dynamic_symbol_indexes(symbol_db: &mut SymbolDb) {
    if !symbol_db.args.output_kind().needs_dynamic() {
        return;
    }
    let mut next_index = 1u32;
    for id in symbol_db.symbol_ids().collect::<Vec<_>>() {
        let binding = symbol_db.symbol_mut(id);
        let flags = binding.resolution_flags;
        if flags.is_empty() {
            continue;
        }
        let needed = (binding.value_flags.is_dynamic() && !binding.value_flags.is_absolute())
            || (binding.value_flags.is_dynamic() && flags.needs_got())
            || flags.needs_export_dynamic()
            || flags.needs_copy_relocation();
        if needed {
            binding.dynamic_symbol_index = std::num::NonZeroU32::new(next_index);
            next_index += 1;
        }
    }
}

fn count_plt_relocations(symbol_db: &SymbolDb, plt_entries: &[SymbolId]) -> u64 {
    plt_entries
        .iter()
        .filter(|&&id| {
            let binding = symbol_db.symbol(id);
            binding.value_flags.is_ifunc() || needs_jump_slot(binding)
        })
        .count() as u64
}

/// Counts the dynamic relocation records driven by per-symbol state: GOT entries the loader must
/// fill, TLS entries, copy relocations. Word-sized absolute fields in section images are counted
/// by the sizing loop, since their packing eligibility depends on addresses.
fn count_symbol_relocations(symbol_db: &SymbolDb, scan: &ScanOutputs) -> Result<u64> {
    let output_kind = symbol_db.args.output_kind();
    let mut count = 0u64;
    for id in symbol_db.symbol_ids() {
        let binding = symbol_db.symbol(id);
        let flags = binding.resolution_flags;
        let value_flags = binding.value_flags;
        let interposable = value_flags.is_interposable();

        if flags.needs_got()
            && !needs_jump_slot(binding)
            && !value_flags.is_ifunc()
            && value_flags.is_dynamic()
            && !value_flags.is_absolute()
        {
            count += 1; // glob-dat
        }
        if flags.needs_tls_offset() && (interposable || output_kind.is_shared_object()) {
            count += 1;
        }
        if flags.needs_tls_offset_positive() && (interposable || output_kind.is_shared_object()) {
            count += 1;
        }
        if flags.needs_tls_module() {
            if !(output_kind.is_executable() && !value_flags.is_dynamic()) {
                count += 1; // dtpmod
            }
            if interposable {
                count += 1; // dtpoff
            }
        }
        if flags.needs_tls_descriptor() {
            if output_kind.is_static_executable() {
                bail!(
                    "Cannot use a TLS descriptor for {} in a static executable",
                    symbol_db.symbol_debug(id)
                );
            }
            count += 1;
        }
        if flags.needs_copy_relocation() {
            count += 1;
        }
    }
    if scan.uses_tlsld && output_kind.is_shared_object() {
        count += 1; // dtpmod for the local-dynamic module entry
    }
    Ok(count)
}

fn collect_relative_got_offsets<A: Arch>(symbol_db: &SymbolDb) -> Vec<u64> {
    if !symbol_db.args.is_relocatable() {
        return Vec::new();
    }
    let mut offsets = Vec::new();
    for id in symbol_db.symbol_ids() {
        let binding = symbol_db.symbol(id);
        if !binding.resolution_flags.needs_got()
            || needs_jump_slot(binding)
            || binding.value_flags.is_ifunc()
            || !binding.value_flags.is_address()
        {
            continue;
        }
        let Some(start) = binding.got.offset() else {
            continue;
        };
        let run = got_run(binding.resolution_flags, start, A::GOT_ENTRY_SIZE);
        if let Some(plain) = run.plain {
            offsets.push(plain);
        }
    }
    offsets
}

/// Word-sized absolute fields in the section images that become dynamic records. Relative sites
/// are kept individually since whether each one packs depends on its final address; symbolic
/// records only contribute a count.
struct SectionRecordSites {
    relative: Vec<(usize, usize, u64)>,
    general_count: u64,
}

fn collect_section_record_sites<A: Arch>(
    objects: &[InputObject],
    symbol_db: &SymbolDb,
) -> Result<SectionRecordSites> {
    let relocatable = symbol_db.args.is_relocatable();
    let mut sites = SectionRecordSites {
        relative: Vec::new(),
        general_count: 0,
    };
    for (file_number, object) in objects.iter().enumerate() {
        let file_id = FileId::new(file_number as u32);
        for (section_index, section) in object.sections.iter().enumerate() {
            if !section.retained {
                continue;
            }
            for rel in &section.relocations {
                let rel_info = A::relocation_from_raw(rel.r_type)?;
                if rel_info.kind != RelocationKind::Absolute
                    || rel_info.byte_size as u64 != A::GOT_ENTRY_SIZE
                {
                    continue;
                }
                let symbol_id =
                    symbol_db.resolve_ref(file_id, &object.symbols, &object.name, rel.symbol_index)?;
                let binding = symbol_db.symbol(symbol_id);
                match absolute_word_disposition(
                    binding.value_flags,
                    binding.resolution_flags,
                    section.is_writable(),
                    relocatable,
                ) {
                    AbsoluteDisposition::RelativeRecord => {
                        sites.relative.push((file_number, section_index, rel.offset));
                    }
                    AbsoluteDisposition::GeneralRecord => sites.general_count += 1,
                    AbsoluteDisposition::Value => {}
                }
            }
        }
    }
    Ok(sites)
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.next_multiple_of(alignment.max(1))
}

/// Lays out the address space for one set of table sizes. Synthetic tables come first, in the
/// order they'd land in a read-only then executable then writable segment sequence, followed by
/// the input sections (non-TLS then a contiguous TLS run) and the copy-relocation region.
fn place<A: Arch>(objects: &[InputObject], output_kind: crate::args::OutputKind, sizes: &Sizes) -> Addresses {
    let record_size = size_of::<A::RelocationRecord>() as u64;
    let word = A::GOT_ENTRY_SIZE;

    let mut cursor = output_kind.base_address();

    cursor = align_up(cursor, 8);
    let rela_dyn_address = cursor;
    cursor += sizes.rela_dyn_count * record_size;

    cursor = align_up(cursor, 8);
    let rela_plt_address = cursor;
    cursor += sizes.rela_plt_count * record_size;

    cursor = align_up(cursor, word);
    let relr_address = cursor;
    cursor += sizes.relr_words as u64 * word;

    cursor = align_up(cursor, 16);
    let plt_address = cursor;
    cursor += sizes.plt_size;

    cursor = align_up(cursor, word);
    let got_address = cursor;
    cursor += sizes.got_size;

    let mut section_addresses: Vec<Vec<Option<u64>>> = objects
        .iter()
        .map(|object| vec![None; object.sections.len()])
        .collect();
    for (file_number, object) in objects.iter().enumerate() {
        for (section_index, section) in object.sections.iter().enumerate() {
            if !section.retained || section.flags.is_tls() {
                continue;
            }
            cursor = align_up(cursor, section.alignment);
            section_addresses[file_number][section_index] = Some(cursor);
            cursor += section.data.len() as u64;
        }
    }

    let tls_start = align_up(cursor, word);
    cursor = tls_start;
    for (file_number, object) in objects.iter().enumerate() {
        for (section_index, section) in object.sections.iter().enumerate() {
            if !section.retained || !section.flags.is_tls() {
                continue;
            }
            cursor = align_up(cursor, section.alignment);
            section_addresses[file_number][section_index] = Some(cursor);
            cursor += section.data.len() as u64;
        }
    }
    let tls_end = cursor;

    cursor = align_up(cursor, 8);
    let copy_region_address = cursor;

    Addresses {
        rela_dyn_address,
        rela_plt_address,
        relr_address,
        plt_address,
        got_address,
        section_addresses,
        tls_start,
        tls_end,
        copy_region_address,
    }
}
