//! The in-memory form in which input objects arrive. Container parsing happens upstream; by the
//! time objects get here, sections are byte buffers and symbols have already been through name
//! resolution.

use linker_utils::elf::SectionFlags;

/// Identifies one input object for the duration of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(u32);

impl FileId {
    #[must_use]
    pub(crate) fn new(raw: u32) -> FileId {
        FileId(raw)
    }

    #[must_use]
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

pub struct InputObject {
    /// Name used in diagnostics, usually the path the object was read from.
    pub name: String,

    pub sections: Vec<Section>,
    pub symbols: Vec<InputSymbol>,
}

pub struct Section {
    pub name: String,
    pub data: Vec<u8>,
    pub flags: SectionFlags,
    pub alignment: u64,
    pub relocations: Vec<Relocation>,

    /// False when an earlier pass (e.g. dead code elimination) dropped the section. Discarded
    /// sections get no address and references into them resolve as no-ops.
    pub retained: bool,
}

/// One relocation as it arrives from the input. The scan pass rewrites `r_type`, `offset` and
/// `addend` in place when it converts an instruction, so these records are the engine's working
/// state, not a read-only view.
#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    pub offset: u64,
    pub r_type: u32,
    pub symbol_index: usize,
    pub addend: i64,
}

#[derive(Clone)]
pub struct InputSymbol {
    pub name: String,
    pub kind: SymbolKind,
    pub binding: Binding,
    pub visibility: Visibility,
    pub placement: SymbolPlacement,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    NoType,
    Object,
    Function,
    Tls,
    /// The symbol's address is computed at runtime by calling a resolver function.
    IfuncResolver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Local,
    Global,
    Weak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Default,
    Protected,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolPlacement {
    Undefined,

    /// A value that doesn't change with the load address.
    Absolute(u64),

    /// Defined in one of this object's sections.
    Section { section_index: usize, offset: u64 },

    /// Defined by a shared object that will only be resolved at runtime.
    Dynamic,
}

impl Section {
    pub(crate) fn is_writable(&self) -> bool {
        self.flags.is_writable()
    }
}

impl InputSymbol {
    pub(crate) fn is_undefined(&self) -> bool {
        matches!(self.placement, SymbolPlacement::Undefined)
    }

    pub(crate) fn is_weak(&self) -> bool {
        self.binding == Binding::Weak
    }

    pub(crate) fn is_local(&self) -> bool {
        self.binding == Binding::Local
    }

    pub(crate) fn is_ifunc(&self) -> bool {
        self.kind == SymbolKind::IfuncResolver
    }
}
