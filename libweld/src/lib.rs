//! The machine-dependent half of a static linker for x86-64 and i386 ELF: relocation scanning
//! and instruction relaxation, GOT/PLT synthesis, TLS model transitions, dynamic relocation
//! emission and final relocation application.
//!
//! The host drives it through [`link`]: hand over the decoded input objects and the link
//! options, get back the synthesised tables and the relocated section images. Container
//! parsing, section merging and output file assembly stay on the host's side of the fence.

pub(crate) mod arch;
pub mod args;
pub(crate) mod elf;
pub(crate) mod elf_writer;
pub(crate) mod error;
pub(crate) mod i386;
pub(crate) mod layout;
pub mod model;
pub mod relr;
pub(crate) mod scan;
pub(crate) mod symbol_db;
pub(crate) mod x86_64;

use crate::arch::Arch;
pub use crate::arch::Architecture;
pub use crate::args::Args;
pub use crate::args::OutputKind;
pub use crate::args::RelocationModel;
pub use crate::args::TargetOs;
pub use crate::elf_writer::LinkOutput;
pub use crate::elf_writer::SymbolSummary;
pub use crate::error::Result;
use crate::model::InputObject;
use crate::symbol_db::SymbolDb;

/// Runs the whole engine over the supplied objects. Section data is relocated in place; the
/// synthesised tables come back in the returned [`LinkOutput`].
pub fn link(args: &Args, objects: &mut [InputObject]) -> Result<LinkOutput> {
    match args.arch {
        Architecture::X86_64 => link_for_arch::<x86_64::X86_64>(args, objects),
        Architecture::I386 => link_for_arch::<i386::I386>(args, objects),
    }
}

fn link_for_arch<A: Arch>(args: &Args, objects: &mut [InputObject]) -> Result<LinkOutput> {
    let mut symbol_db = SymbolDb::build(objects, args)?;

    let thread_pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.available_threads().get())
        .build()?;
    let scan_outputs =
        thread_pool.install(|| scan::scan_references::<A>(objects, &mut symbol_db))?;

    let layout = layout::compute_layout::<A>(objects, &mut symbol_db, &scan_outputs)?;
    elf_writer::write_output::<A>(objects, &mut symbol_db, &layout)
}

/// Installs a global tracing subscriber that reads its filter from the `WELD_LOG` environment
/// variable. Hosts embedding the engine in a larger program will usually install their own
/// instead.
pub fn init_tracing() -> Result {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    let filter = tracing_subscriber::EnvFilter::try_from_env("WELD_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .map_err(|error| anyhow::anyhow!("Failed to install tracing subscriber: {error}"))
}
