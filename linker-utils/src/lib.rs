pub mod elf;
pub mod i386;
pub mod relaxation;
pub mod utils;
pub mod x86_64;
