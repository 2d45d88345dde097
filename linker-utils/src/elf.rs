use anyhow::Result;
use std::borrow::Cow;
use std::fmt;

/// Matches the supplied numeric constant against the named constants from `object::elf`, returning
/// the name of whichever matches.
macro_rules! const_name_by_value {
    ($needle: expr, $( $const:ident ),*) => {
        match $needle {
            $(object::elf::$const => Some(stringify!($const)),)*
            _ => None,
        }
    };
}

#[must_use]
pub fn x86_64_rel_type_to_string(r_type: u32) -> Cow<'static, str> {
    if let Some(name) = const_name_by_value![
        r_type,
        R_X86_64_NONE,
        R_X86_64_64,
        R_X86_64_PC32,
        R_X86_64_GOT32,
        R_X86_64_PLT32,
        R_X86_64_COPY,
        R_X86_64_GLOB_DAT,
        R_X86_64_JUMP_SLOT,
        R_X86_64_RELATIVE,
        R_X86_64_GOTPCREL,
        R_X86_64_32,
        R_X86_64_32S,
        R_X86_64_16,
        R_X86_64_PC16,
        R_X86_64_8,
        R_X86_64_PC8,
        R_X86_64_DTPMOD64,
        R_X86_64_DTPOFF64,
        R_X86_64_TPOFF64,
        R_X86_64_TLSGD,
        R_X86_64_TLSLD,
        R_X86_64_DTPOFF32,
        R_X86_64_GOTTPOFF,
        R_X86_64_TPOFF32,
        R_X86_64_PC64,
        R_X86_64_GOTOFF64,
        R_X86_64_GOTPC32,
        R_X86_64_GOT64,
        R_X86_64_GOTPCREL64,
        R_X86_64_GOTPC64,
        R_X86_64_GOTPLT64,
        R_X86_64_PLTOFF64,
        R_X86_64_SIZE32,
        R_X86_64_SIZE64,
        R_X86_64_GOTPC32_TLSDESC,
        R_X86_64_TLSDESC_CALL,
        R_X86_64_TLSDESC,
        R_X86_64_IRELATIVE,
        R_X86_64_RELATIVE64,
        R_X86_64_GOTPCRELX,
        R_X86_64_REX_GOTPCRELX
    ] {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("Unknown x86_64 relocation type 0x{r_type:x}"))
    }
}

#[must_use]
pub fn i386_rel_type_to_string(r_type: u32) -> Cow<'static, str> {
    if let Some(name) = const_name_by_value![
        r_type,
        R_386_NONE,
        R_386_32,
        R_386_PC32,
        R_386_GOT32,
        R_386_PLT32,
        R_386_COPY,
        R_386_GLOB_DAT,
        R_386_JMP_SLOT,
        R_386_RELATIVE,
        R_386_GOTOFF,
        R_386_GOTPC,
        R_386_TLS_TPOFF,
        R_386_TLS_IE,
        R_386_TLS_GOTIE,
        R_386_TLS_LE,
        R_386_TLS_GD,
        R_386_TLS_LDM,
        R_386_16,
        R_386_PC16,
        R_386_8,
        R_386_PC8,
        R_386_TLS_LDO_32,
        R_386_TLS_IE_32,
        R_386_TLS_LE_32,
        R_386_TLS_DTPMOD32,
        R_386_TLS_DTPOFF32,
        R_386_TLS_TPOFF32,
        R_386_SIZE32,
        R_386_TLS_GOTDESC,
        R_386_TLS_DESC_CALL,
        R_386_TLS_DESC,
        R_386_IRELATIVE,
        R_386_GOT32X
    ] {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("Unknown i386 relocation type 0x{r_type:x}"))
    }
}

/// The semantic effect of a relocation, independent of its encoded width. `S` is the symbol's
/// value, `A` the addend, `P` the place being patched, `G` the offset of the symbol's GOT entry
/// from the GOT base and `GOT` the GOT base address (which on x86 is where
/// `_GLOBAL_OFFSET_TABLE_` points).
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    /// S + A
    Absolute,

    /// S + A - P
    Relative,

    /// S + A - GOT
    SymRelGotBase,

    /// G + A
    Got,

    /// GOT + G + A - P
    GotRelative,

    /// GOT + A - P
    GotBaseRelative,

    /// L + A - P, where L is the address of the symbol's PLT entry
    PltRelative,

    /// L + A - GOT
    PltRelGotBase,

    /// Address of the symbol's general-dynamic (module, offset) GOT pair, relative to P
    TlsGd,

    /// Offset of the symbol's general-dynamic GOT pair from the GOT base
    TlsGdGotBase,

    /// Address of the module's local-dynamic GOT pair, relative to P
    TlsLd,

    /// Offset of the module's local-dynamic GOT pair from the GOT base
    TlsLdGotBase,

    /// Offset of the symbol within its module's TLS block
    DtpOff,

    /// Address of the symbol's initial-exec GOT entry (negative form), relative to P
    GotTpOff,

    /// Offset of the symbol's initial-exec GOT entry (negative form) from the GOT base
    GotTpOffGotBase,

    /// Offset of the symbol's initial-exec GOT entry (positive form) from the GOT base
    GotTpOffPositiveGotBase,

    /// Absolute address of the symbol's initial-exec GOT entry (negative form)
    GotTpOffAbsolute,

    /// S + A - TLS-end. A negative offset from the thread pointer.
    TpOff,

    /// TLS-end - S - A. A positive offset, subtracted from the thread pointer by the consuming
    /// instruction.
    TpOffPositive,

    /// Address of the symbol's TLS descriptor GOT pair, relative to P
    TlsDesc,

    /// Offset of the symbol's TLS descriptor GOT pair from the GOT base
    TlsDescGotBase,

    /// Marks the call through a TLS descriptor so that it can be rewritten when the descriptor is
    /// optimised away
    TlsDescCall,

    /// The size of the symbol plus A
    Size,

    /// No effect
    None,
}

impl RelocationKind {
    #[must_use]
    pub fn is_tls(self) -> bool {
        matches!(
            self,
            RelocationKind::TlsGd
                | RelocationKind::TlsGdGotBase
                | RelocationKind::TlsLd
                | RelocationKind::TlsLdGotBase
                | RelocationKind::DtpOff
                | RelocationKind::GotTpOff
                | RelocationKind::GotTpOffGotBase
                | RelocationKind::GotTpOffPositiveGotBase
                | RelocationKind::GotTpOffAbsolute
                | RelocationKind::TpOff
                | RelocationKind::TpOffPositive
                | RelocationKind::TlsDesc
                | RelocationKind::TlsDescGotBase
                | RelocationKind::TlsDescCall
        )
    }

    /// Whether the computed value is relative to the place being patched.
    #[must_use]
    pub fn is_pc_relative(self) -> bool {
        matches!(
            self,
            RelocationKind::Relative
                | RelocationKind::GotRelative
                | RelocationKind::GotBaseRelative
                | RelocationKind::PltRelative
                | RelocationKind::TlsGd
                | RelocationKind::TlsLd
                | RelocationKind::GotTpOff
                | RelocationKind::TlsDesc
        )
    }
}

/// Relocation kinds that can appear in the output file's dynamic relocation tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DynamicRelocationKind {
    Copy,
    Irelative,
    DtpMod,
    DtpOff,
    TpOff,
    /// The positive thread-pointer offset form. Only i386 has this.
    TpOffPositive,
    TlsDesc,
    Relative,
    GotEntry,
    JumpSlot,
    Absolute,
}

impl DynamicRelocationKind {
    #[must_use]
    pub fn from_x86_64_r_type(r_type: u32) -> Option<DynamicRelocationKind> {
        let kind = match r_type {
            object::elf::R_X86_64_COPY => DynamicRelocationKind::Copy,
            object::elf::R_X86_64_IRELATIVE => DynamicRelocationKind::Irelative,
            object::elf::R_X86_64_DTPMOD64 => DynamicRelocationKind::DtpMod,
            object::elf::R_X86_64_DTPOFF64 => DynamicRelocationKind::DtpOff,
            object::elf::R_X86_64_TPOFF64 => DynamicRelocationKind::TpOff,
            object::elf::R_X86_64_TLSDESC => DynamicRelocationKind::TlsDesc,
            object::elf::R_X86_64_RELATIVE => DynamicRelocationKind::Relative,
            object::elf::R_X86_64_GLOB_DAT => DynamicRelocationKind::GotEntry,
            object::elf::R_X86_64_JUMP_SLOT => DynamicRelocationKind::JumpSlot,
            object::elf::R_X86_64_64 => DynamicRelocationKind::Absolute,
            _ => return None,
        };

        Some(kind)
    }

    #[must_use]
    pub fn x86_64_r_type(self) -> Option<u32> {
        let r_type = match self {
            DynamicRelocationKind::Copy => object::elf::R_X86_64_COPY,
            DynamicRelocationKind::Irelative => object::elf::R_X86_64_IRELATIVE,
            DynamicRelocationKind::DtpMod => object::elf::R_X86_64_DTPMOD64,
            DynamicRelocationKind::DtpOff => object::elf::R_X86_64_DTPOFF64,
            DynamicRelocationKind::TpOff => object::elf::R_X86_64_TPOFF64,
            DynamicRelocationKind::TpOffPositive => return None,
            DynamicRelocationKind::TlsDesc => object::elf::R_X86_64_TLSDESC,
            DynamicRelocationKind::Relative => object::elf::R_X86_64_RELATIVE,
            DynamicRelocationKind::GotEntry => object::elf::R_X86_64_GLOB_DAT,
            DynamicRelocationKind::JumpSlot => object::elf::R_X86_64_JUMP_SLOT,
            DynamicRelocationKind::Absolute => object::elf::R_X86_64_64,
        };

        Some(r_type)
    }

    #[must_use]
    pub fn from_i386_r_type(r_type: u32) -> Option<DynamicRelocationKind> {
        let kind = match r_type {
            object::elf::R_386_COPY => DynamicRelocationKind::Copy,
            object::elf::R_386_IRELATIVE => DynamicRelocationKind::Irelative,
            object::elf::R_386_TLS_DTPMOD32 => DynamicRelocationKind::DtpMod,
            object::elf::R_386_TLS_DTPOFF32 => DynamicRelocationKind::DtpOff,
            object::elf::R_386_TLS_TPOFF => DynamicRelocationKind::TpOff,
            object::elf::R_386_TLS_TPOFF32 => DynamicRelocationKind::TpOffPositive,
            object::elf::R_386_TLS_DESC => DynamicRelocationKind::TlsDesc,
            object::elf::R_386_RELATIVE => DynamicRelocationKind::Relative,
            object::elf::R_386_GLOB_DAT => DynamicRelocationKind::GotEntry,
            object::elf::R_386_JMP_SLOT => DynamicRelocationKind::JumpSlot,
            object::elf::R_386_32 => DynamicRelocationKind::Absolute,
            _ => return None,
        };

        Some(kind)
    }

    #[must_use]
    pub fn i386_r_type(self) -> Option<u32> {
        let r_type = match self {
            DynamicRelocationKind::Copy => object::elf::R_386_COPY,
            DynamicRelocationKind::Irelative => object::elf::R_386_IRELATIVE,
            DynamicRelocationKind::DtpMod => object::elf::R_386_TLS_DTPMOD32,
            DynamicRelocationKind::DtpOff => object::elf::R_386_TLS_DTPOFF32,
            DynamicRelocationKind::TpOff => object::elf::R_386_TLS_TPOFF,
            DynamicRelocationKind::TpOffPositive => object::elf::R_386_TLS_TPOFF32,
            DynamicRelocationKind::TlsDesc => object::elf::R_386_TLS_DESC,
            DynamicRelocationKind::Relative => object::elf::R_386_RELATIVE,
            DynamicRelocationKind::GotEntry => object::elf::R_386_GLOB_DAT,
            DynamicRelocationKind::JumpSlot => object::elf::R_386_JMP_SLOT,
            DynamicRelocationKind::Absolute => object::elf::R_386_32,
        };

        Some(r_type)
    }
}

/// The overflow-complaint class of a relocation. Determines the range of computed values accepted
/// for a given encoded width.
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum OverflowCheck {
    /// Silent truncation is permitted.
    None,

    /// The value must fit when interpreted as a signed quantity of the encoded width.
    Signed,

    /// The value must fit when interpreted as an unsigned quantity of the encoded width.
    Unsigned,

    /// The value must fit in the encoded width under either interpretation.
    Bitfield,
}

impl OverflowCheck {
    #[must_use]
    pub const fn allowed_range(self, byte_size: usize) -> AllowedRange {
        let bits = byte_size as u32 * 8;
        if bits == 0 || bits >= 64 {
            return AllowedRange::no_check();
        }

        match self {
            OverflowCheck::None => AllowedRange::no_check(),
            OverflowCheck::Signed => AllowedRange::new(-(1 << (bits - 1)), 1 << (bits - 1)),
            OverflowCheck::Unsigned => AllowedRange::new(0, 1 << bits),
            OverflowCheck::Bitfield => AllowedRange::new(-(1 << (bits - 1)), 1 << bits),
        }
    }
}

/// Allowed range (half-open) of a computed relocation value.
#[derive(Clone, Debug, Copy)]
pub struct AllowedRange {
    pub min: i64,
    pub max: i64,
}

impl AllowedRange {
    #[must_use]
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    #[must_use]
    pub const fn no_check() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }
}

#[derive(Clone, Debug, Copy)]
pub struct RelocationKindInfo {
    pub kind: RelocationKind,

    /// Number of bytes patched at the relocation's offset. Always a whole number of bytes on x86.
    pub byte_size: usize,

    pub overflow: OverflowCheck,

    pub range: AllowedRange,

    pub alignment: usize,
}

impl RelocationKindInfo {
    #[must_use]
    pub const fn new(kind: RelocationKind, byte_size: usize, overflow: OverflowCheck) -> Self {
        Self {
            kind,
            byte_size,
            overflow,
            range: overflow.allowed_range(byte_size),
            alignment: 1,
        }
    }

    #[inline(always)]
    pub fn verify(&self, value: i64) -> Result<()> {
        anyhow::ensure!(
            (value as usize) & (self.alignment - 1) == 0,
            "Relocation {value} not aligned to {} bytes",
            self.alignment
        );
        anyhow::ensure!(
            self.range.min <= value && value < self.range.max,
            format!(
                "Relocation {value} outside of bounds [{}, {})",
                self.range.min, self.range.max
            )
        );
        Ok(())
    }

    /// Writes the low `byte_size` bytes of `value` at the start of `out`.
    pub fn write_value(&self, value: u64, out: &mut [u8]) {
        let bytes = value.to_le_bytes();
        out[..self.byte_size].copy_from_slice(&bytes[..self.byte_size]);
    }

    /// Reads back a previously written value, sign-extending from the encoded width.
    #[must_use]
    pub fn read_value(&self, data: &[u8]) -> i64 {
        let mut bytes = [0u8; 8];
        bytes[..self.byte_size].copy_from_slice(&data[..self.byte_size]);
        let unsigned = u64::from_le_bytes(bytes);
        if self.byte_size == 8 || self.byte_size == 0 {
            return unsigned as i64;
        }

        let bits = self.byte_size as u32 * 8;
        let shift = 64 - bits;
        ((unsigned << shift) as i64) >> shift
    }
}

/// Named section flags that this engine cares about, from `SHF_*`.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionFlags(u64);

impl SectionFlags {
    #[must_use]
    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn contains(self, flag: u64) -> bool {
        self.0 & flag != 0
    }

    #[must_use]
    pub const fn with(self, flag: u32) -> Self {
        Self(self.0 | flag as u64)
    }

    #[must_use]
    pub fn is_writable(self) -> bool {
        self.contains(object::elf::SHF_WRITE as u64)
    }

    #[must_use]
    pub fn is_alloc(self) -> bool {
        self.contains(object::elf::SHF_ALLOC as u64)
    }

    #[must_use]
    pub fn is_executable(self) -> bool {
        self.contains(object::elf::SHF_EXECINSTR as u64)
    }

    #[must_use]
    pub fn is_tls(self) -> bool {
        self.contains(object::elf::SHF_TLS as u64)
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SectionFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_writable() {
            f.write_str("W")?;
        }
        if self.is_alloc() {
            f.write_str("A")?;
        }
        if self.is_executable() {
            f.write_str("X")?;
        }
        if self.is_tls() {
            f.write_str("T")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SectionFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
