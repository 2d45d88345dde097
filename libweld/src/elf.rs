//! Constants and on-disk record types shared by the output-side passes.

use object::LittleEndian;

/// Memory address of the first byte of the binary when not relocatable.
pub(crate) const NON_PIE_START_MEM_ADDRESS: u64 = 0x400_000;

pub(crate) type Rela64 = object::elf::Rela64<LittleEndian>;
pub(crate) type Rel32 = object::elf::Rel32<LittleEndian>;

pub(crate) const REL32_ENTRY_SIZE: u64 = size_of::<Rel32>() as u64;

/// Slots at the start of .got.plt that don't belong to any symbol. The first holds the link-time
/// address of _DYNAMIC; the runtime loader fills in the other two for the lazy resolver.
pub(crate) const RESERVED_GOT_PLT_ENTRIES: u64 = 3;

/// The module number of the binary we're writing. TLS module IDs are 1-based.
pub(crate) const CURRENT_EXE_TLS_MOD: u64 = 1;
