//! Link-time options consumed by the relocation engine. Option parsing belongs to the host; this
//! is the already-decoded form.

use crate::arch::Architecture;
use std::num::NonZeroUsize;

pub struct Args {
    pub arch: Architecture,
    pub output_kind: OutputKind,
    pub target_os: TargetOs,

    pub num_threads: NonZeroUsize,

    /// Whether to apply optional relaxations. Mandatory rewrites, e.g. TLS transitions that the
    /// output kind forces, are applied regardless.
    pub relax: bool,

    /// Disables lazy PLT binding (-z now). Jump slots then point straight at their targets and no
    /// PLT0 header is emitted.
    pub bind_now: bool,

    /// Emit PLT entries with an endbr landing pad (-z ibtplt).
    pub ibt_plt: bool,

    /// Pack relative relocations into a compact bitmap-encoded section instead of emitting one
    /// table entry each.
    pub pack_relative_relocs: bool,

    pub allow_copy_relocations: bool,

    /// Escape hatch for values that a checked relocation rejects.
    pub skip_overflow_checks: bool,
}

impl Args {
    pub fn new(arch: Architecture, output_kind: OutputKind) -> Args {
        Args {
            arch,
            output_kind,
            target_os: TargetOs::Gnu,
            num_threads: std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
            relax: true,
            bind_now: false,
            ibt_plt: false,
            pack_relative_relocs: false,
            allow_copy_relocations: true,
            skip_overflow_checks: false,
        }
    }

    pub(crate) fn output_kind(&self) -> OutputKind {
        self.output_kind
    }

    pub(crate) fn is_relocatable(&self) -> bool {
        self.output_kind.is_relocatable()
    }

    #[must_use]
    pub fn available_threads(&self) -> NonZeroUsize {
        if cfg!(feature = "single-threaded") {
            NonZeroUsize::MIN
        } else {
            self.num_threads
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    StaticExecutable(RelocationModel),
    DynamicExecutable(RelocationModel),
    SharedObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationModel {
    NonRelocatable,
    Relocatable,
}

/// Selects between the successor relocation types that the i386 TLS transitions produce. The GNU
/// tools use the `_32` forms; Solaris assemblers and runtimes expect the older non-`_32` numbers
/// for the same transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    Gnu,
    Solaris,
}

impl OutputKind {
    pub(crate) fn is_executable(self) -> bool {
        !matches!(self, OutputKind::SharedObject)
    }

    pub(crate) fn is_shared_object(self) -> bool {
        matches!(self, OutputKind::SharedObject)
    }

    pub(crate) fn is_static_executable(self) -> bool {
        matches!(self, OutputKind::StaticExecutable(_))
    }

    pub(crate) fn is_relocatable(self) -> bool {
        matches!(
            self,
            OutputKind::StaticExecutable(RelocationModel::Relocatable)
                | OutputKind::DynamicExecutable(RelocationModel::Relocatable)
                | OutputKind::SharedObject
        )
    }

    pub(crate) fn needs_dynamic(self) -> bool {
        self != OutputKind::StaticExecutable(RelocationModel::NonRelocatable)
    }

    pub(crate) fn base_address(self) -> u64 {
        if self.is_relocatable() {
            0
        } else {
            crate::elf::NON_PIE_START_MEM_ADDRESS
        }
    }
}
