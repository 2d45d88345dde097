//! Tracks every linker-visible symbol: which input defines it, what kind of value it resolves to
//! and, once layout has run, which GOT/PLT slots and dynamic-table entries it was assigned.
//!
//! All records live in one arena (`symbols`). Global names and (file, local-index) pairs are both
//! just indexes into that arena; neither map owns anything.

use crate::args::Args;
use crate::error::Result;
use crate::layout::GotSlot;
use crate::layout::ResolutionFlags;
use crate::model::FileId;
use crate::model::InputObject;
use crate::model::InputSymbol;
use crate::model::SymbolKind;
use crate::model::SymbolPlacement;
use crate::model::Visibility;
use ahash::AHashMap;
use anyhow::bail;
use bitflags::bitflags;
use std::num::NonZeroU32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SymbolId(u32);

impl SymbolId {
    pub(crate) fn from_usize(raw: usize) -> SymbolId {
        SymbolId(raw as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

bitflags! {
    /// What kind of value a symbol resolves to. Computed once the winning definition is known,
    /// then read-only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct ValueFlags: u8 {
        /// Something with an address, i.e. a definition in one of our input sections.
        const ADDRESS = 1 << 0;

        /// An absolute value that won't change depending on load address. This could be a symbol
        /// with an absolute value or an undefined symbol, which needs to always resolve to 0
        /// regardless of load address.
        const ABSOLUTE = 1 << 1;

        /// The value is from a shared object, so although it may have an address, it won't be
        /// known until runtime. If combined with `ABSOLUTE`, then the symbol isn't actually
        /// defined by any shared object and we emit dynamic relocations for it on a best-effort
        /// basis only.
        const DYNAMIC = 1 << 2;

        /// The value refers to an ifunc. The actual address won't be known until runtime.
        const IFUNC = 1 << 3;

        /// Whether the GOT can be bypassed for this value. Set when the symbol cannot be
        /// interposed at runtime.
        const CAN_BYPASS_GOT = 1 << 4;

        /// Set when the value is a function. Currently only set for dynamic symbols, since that's
        /// all we need it for.
        const FUNCTION = 1 << 5;
    }
}

impl ValueFlags {
    pub(crate) fn is_address(self) -> bool {
        self.contains(ValueFlags::ADDRESS)
    }

    pub(crate) fn is_absolute(self) -> bool {
        self.contains(ValueFlags::ABSOLUTE)
    }

    pub(crate) fn is_dynamic(self) -> bool {
        self.contains(ValueFlags::DYNAMIC)
    }

    pub(crate) fn is_ifunc(self) -> bool {
        self.contains(ValueFlags::IFUNC)
    }

    pub(crate) fn is_function(self) -> bool {
        self.contains(ValueFlags::FUNCTION)
    }

    pub(crate) fn can_bypass_got(self) -> bool {
        self.contains(ValueFlags::CAN_BYPASS_GOT)
    }

    pub(crate) fn is_interposable(self) -> bool {
        !self.can_bypass_got()
    }
}

impl std::fmt::Display for ValueFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        bitflags::parser::to_writer(self, f)
    }
}

/// One record per linker-visible symbol. Created when the symbol database is built, mutated as
/// layout assigns slots and indexes, then frozen before relocations are applied.
pub(crate) struct SymbolBinding {
    pub(crate) name: String,
    pub(crate) file_id: FileId,
    pub(crate) placement: SymbolPlacement,
    pub(crate) is_weak: bool,
    pub(crate) size: u64,
    pub(crate) value_flags: ValueFlags,

    /// The union of the demands that scanning saw for this symbol.
    pub(crate) resolution_flags: ResolutionFlags,

    /// Byte offset of the symbol's first GOT slot within the GOT, once assigned. TLS symbols may
    /// own a run of several slots starting here.
    pub(crate) got: GotSlot,

    /// Byte offset of the symbol's PLT entry within the PLT, once assigned.
    pub(crate) plt_offset: Option<u64>,

    pub(crate) dynamic_symbol_index: Option<NonZeroU32>,

    /// Address reserved for the symbol when a copy relocation is needed.
    pub(crate) copy_relocation_address: Option<u64>,
}

impl SymbolBinding {
    fn new(
        name: &str,
        file_id: FileId,
        sym: &InputSymbol,
        value_flags: ValueFlags,
    ) -> SymbolBinding {
        SymbolBinding {
            name: name.to_owned(),
            file_id,
            placement: sym.placement,
            is_weak: sym.is_weak(),
            size: sym.size,
            value_flags,
            resolution_flags: ResolutionFlags::empty(),
            got: GotSlot::Unassigned,
            plt_offset: None,
            dynamic_symbol_index: None,
            copy_relocation_address: None,
        }
    }
}

pub(crate) struct SymbolDb<'args> {
    pub(crate) args: &'args Args,

    /// The arena. Owns every record; `globals` and `locals` only index into it.
    symbols: Vec<SymbolBinding>,

    globals: AHashMap<String, SymbolId>,
    locals: AHashMap<(FileId, usize), SymbolId>,

    /// Names of the input files, for diagnostics.
    file_names: Vec<String>,

    /// The `_DYNAMIC` marker symbol if any input references it. Loads of its address through the
    /// GOT are how position-independent startup code finds the dynamic section, so it's exempt
    /// from GOT-load conversion.
    dynamic_marker: Option<SymbolId>,
}

/// How strongly a symbol table entry claims to define its symbol. Higher ranks replace lower ones
/// as objects are ingested.
fn definition_rank(sym: &InputSymbol) -> u8 {
    match sym.placement {
        SymbolPlacement::Undefined => 0,
        SymbolPlacement::Dynamic => 1,
        SymbolPlacement::Absolute(_) | SymbolPlacement::Section { .. } => {
            if sym.is_weak() { 2 } else { 3 }
        }
    }
}

impl<'args> SymbolDb<'args> {
    #[tracing::instrument(skip_all, name = "Build symbol DB")]
    pub(crate) fn build(objects: &[InputObject], args: &'args Args) -> Result<SymbolDb<'args>> {
        let mut db = SymbolDb {
            args,
            symbols: Vec::new(),
            globals: AHashMap::new(),
            locals: AHashMap::new(),
            file_names: objects.iter().map(|o| o.name.clone()).collect(),
            dynamic_marker: None,
        };

        for (file_number, object) in objects.iter().enumerate() {
            let file_id = FileId::new(file_number as u32);
            for (symbol_index, sym) in object.symbols.iter().enumerate() {
                db.add_symbol(file_id, symbol_index, sym, object)?;
            }
        }

        db.dynamic_marker = db.globals.get("_DYNAMIC").copied();

        tracing::debug!(num_symbols = db.symbols.len(), "symbol DB built");
        Ok(db)
    }

    fn add_symbol(
        &mut self,
        file_id: FileId,
        symbol_index: usize,
        sym: &InputSymbol,
        object: &InputObject,
    ) -> Result {
        if sym.is_local() {
            let value_flags = compute_value_flags(sym, self.args);
            let id = self.push_record(SymbolBinding::new(&sym.name, file_id, sym, value_flags));
            self.locals.insert((file_id, symbol_index), id);
            return Ok(());
        }

        match self.globals.get(sym.name.as_str()) {
            None => {
                let value_flags = compute_value_flags(sym, self.args);
                let id = self.push_record(SymbolBinding::new(&sym.name, file_id, sym, value_flags));
                self.globals.insert(sym.name.clone(), id);
            }
            Some(&existing_id) => {
                let existing = &self.symbols[existing_id.as_usize()];
                let old_rank = definition_rank_of(existing);
                let new_rank = definition_rank(sym);
                if old_rank == 3 && new_rank == 3 {
                    bail!(
                        "Duplicate definition of `{}` in {} and {}",
                        sym.name,
                        self.file_name(existing.file_id),
                        object.name,
                    );
                }
                if new_rank > old_rank {
                    let value_flags = compute_value_flags(sym, self.args);
                    self.symbols[existing_id.as_usize()] =
                        SymbolBinding::new(&sym.name, file_id, sym, value_flags);
                } else if sym.visibility != Visibility::Default {
                    // Visibility is the most constraining one seen across all references, so a
                    // hidden reference locks in GOT bypass even when the definition is default.
                    self.symbols[existing_id.as_usize()].value_flags |=
                        ValueFlags::CAN_BYPASS_GOT;
                }
            }
        }
        Ok(())
    }

    fn push_record(&mut self, record: SymbolBinding) -> SymbolId {
        let id = SymbolId::from_usize(self.symbols.len());
        self.symbols.push(record);
        id
    }

    /// Resolves a relocation's symbol reference to the record it binds to. Takes the symbol
    /// table rather than the whole object so that callers can hold mutable borrows of the
    /// object's sections at the same time.
    pub(crate) fn resolve_ref(
        &self,
        file_id: FileId,
        symbols: &[InputSymbol],
        object_name: &str,
        symbol_index: usize,
    ) -> Result<SymbolId> {
        let sym = symbols
            .get(symbol_index)
            .ok_or_else(|| anyhow::anyhow!("Invalid symbol index {symbol_index} in {object_name}"))?;
        if sym.is_local() {
            return self
                .locals
                .get(&(file_id, symbol_index))
                .copied()
                .ok_or_else(|| {
                    anyhow::anyhow!("Invalid symbol index {symbol_index} in {object_name}")
                });
        }
        self.globals.get(sym.name.as_str()).copied().ok_or_else(|| {
            anyhow::anyhow!("Unresolved symbol reference `{}` in {object_name}", sym.name)
        })
    }

    pub(crate) fn symbol(&self, id: SymbolId) -> &SymbolBinding {
        &self.symbols[id.as_usize()]
    }

    pub(crate) fn symbol_mut(&mut self, id: SymbolId) -> &mut SymbolBinding {
        &mut self.symbols[id.as_usize()]
    }

    pub(crate) fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub(crate) fn symbol_ids(&self) -> impl Iterator<Item = SymbolId> + use<> {
        (0..self.symbols.len()).map(SymbolId::from_usize)
    }

    pub(crate) fn global(&self, name: &str) -> Option<SymbolId> {
        self.globals.get(name).copied()
    }

    pub(crate) fn is_dynamic_marker(&self, id: SymbolId) -> bool {
        self.dynamic_marker == Some(id)
    }

    pub(crate) fn file_name(&self, file_id: FileId) -> &str {
        &self.file_names[file_id.as_usize()]
    }

    pub(crate) fn symbol_debug(&self, id: SymbolId) -> SymbolDebug<'_> {
        let binding = self.symbol(id);
        SymbolDebug {
            name: &binding.name,
            file: self.file_name(binding.file_id),
            placement: binding.placement,
        }
    }
}

fn definition_rank_of(binding: &SymbolBinding) -> u8 {
    match binding.placement {
        SymbolPlacement::Undefined => 0,
        SymbolPlacement::Dynamic => 1,
        SymbolPlacement::Absolute(_) | SymbolPlacement::Section { .. } => {
            if binding.is_weak { 2 } else { 3 }
        }
    }
}

fn compute_value_flags(sym: &InputSymbol, args: &Args) -> ValueFlags {
    let output_kind = args.output_kind();
    let is_undefined = sym.is_undefined();
    let is_from_shared_object = sym.placement == SymbolPlacement::Dynamic;

    let non_interposable = !is_from_shared_object
        && (sym.visibility != Visibility::Default
            || sym.is_local()
            || output_kind.is_static_executable()
            // Symbols defined in an executable cannot be interposed since the executable is
            // always the first place checked for a symbol by the dynamic loader.
            || (output_kind.is_executable() && !is_undefined));

    let mut flags = if let SymbolPlacement::Absolute(_) = sym.placement {
        ValueFlags::ABSOLUTE
    } else if sym.is_ifunc() {
        ValueFlags::IFUNC
    } else if is_from_shared_object {
        ValueFlags::DYNAMIC
    } else if is_undefined {
        if non_interposable {
            ValueFlags::ABSOLUTE
        } else {
            // If we can't bypass the GOT, then an undefined symbol might be able to be defined
            // at runtime by a dynamic library that gets loaded.
            ValueFlags::DYNAMIC | ValueFlags::ABSOLUTE
        }
    } else {
        ValueFlags::ADDRESS
    };

    if non_interposable {
        flags |= ValueFlags::CAN_BYPASS_GOT;
    }
    if is_from_shared_object && sym.kind == SymbolKind::Function {
        flags |= ValueFlags::FUNCTION;
    }
    flags
}

pub(crate) struct SymbolDebug<'db> {
    name: &'db str,
    file: &'db str,
    placement: SymbolPlacement,
}

impl std::fmt::Display for SymbolDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = if self.name.is_empty() {
            "<unnamed>"
        } else {
            self.name
        };
        match self.placement {
            SymbolPlacement::Undefined => write!(f, "undefined symbol `{name}` (from {})", self.file),
            SymbolPlacement::Dynamic => write!(f, "dynamic symbol `{name}` (from {})", self.file),
            _ => write!(f, "symbol `{name}` (defined in {})", self.file),
        }
    }
}
