use crate::elf::OverflowCheck;
use crate::elf::RelocationKind;
use crate::elf::RelocationKindInfo;
use crate::relaxation::RelocationModifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaxationKind {
    /// Transforms a GOT load like `mov x@GOT(%reg1), %reg2` -> `lea x@GOTOFF(%reg1), %reg2`.
    /// Usable under PIC, since the GOT base register stays in play.
    MovIndirectToLea,

    /// Transforms a GOT load into a load of an absolute value:
    /// `mov x@GOT(%reg1), %reg2` -> `mov $x, %reg2`.
    MovIndirectToAbsolute,

    /// Transforms `test %reg1, x@GOT(%reg2)` -> `test $x, %reg1`.
    TestIndirectToAbsolute,

    /// Transforms `binop x@GOT(%reg1), %reg2` -> `binop $x, %reg2` for add, sub, and, or, xor,
    /// sbb, adc and cmp, which all fold into the 0x81 opcode with the operation in ModRM bits
    /// 3-5.
    BinopIndirectToAbsolute,

    /// Transform a call instruction like `call *x@GOT(%reg)` -> `nop; call x`.
    CallIndirectToDirect,

    /// As above, but with an address-size prefix instead of a leading nop: `addr32 call x`. Used
    /// for calls to the TLS helper so that TLS sequences keep their expected length.
    CallIndirectToAddr32Direct,

    /// Transform a jump instruction like `jmp *x@GOT(%reg)` -> `jmp x; nop`.
    JmpIndirectToDirect,

    /// Leave the instruction alone. Used when we only want to change the kind of relocation used.
    NoOp,

    /// Transform general dynamic (GD) into local exec.
    TlsGdToLocalExec,

    /// As above, but with an add of the non-negated offset in place of the subtract. Used for
    /// targets whose local-exec immediates are the plain negative thread-pointer offset.
    TlsGdToLocalExecNeg,

    /// Transform general dynamic (GD) into initial exec, reading the GOT entry that holds the
    /// negated thread-pointer offset.
    TlsGdToInitialExec,

    /// As above, but with an add of the entry at an absolute GOT address in place of the
    /// base-relative subtract. The entry holds the plain negative offset.
    TlsGdToInitialExecPos,

    /// Transform local dynamic (LD) into local exec.
    TlsLdToLocalExec,

    /// Transform an initial-exec access with an absolute GOT address (`mov x@indntpoff, %eax`
    /// and friends) into local exec.
    TlsIeToLocalExec,

    /// Transform an initial-exec access made through a base register into local exec.
    TlsGotIeToLocalExec,

    /// Transform a TLSDESC address load into local exec.
    TlsDescToLocalExec,

    /// Transform a TLSDESC address load into initial exec.
    TlsDescToInitialExec,

    /// Convert a TLSDESC_CALL to a no-op.
    SkipTlsDescCall,

    /// Convert a TLSDESC_CALL to a negation of the loaded offset. Used when the descriptor was
    /// downgraded to an initial-exec load of the non-negated offset.
    TlsDescCallToNeg,
}

impl RelaxationKind {
    pub fn apply(self, section_bytes: &mut [u8], offset_in_section: &mut u64, addend: &mut i64) {
        let offset = *offset_in_section as usize;
        match self {
            RelaxationKind::MovIndirectToLea => {
                section_bytes[offset - 2] = 0x8d;
            }
            RelaxationKind::MovIndirectToAbsolute => {
                let mod_rm = section_bytes[offset - 1];
                section_bytes[offset - 2] = 0xc7;
                section_bytes[offset - 1] = 0xc0 | (mod_rm & 0x38) >> 3;
                *addend = 0;
            }
            RelaxationKind::TestIndirectToAbsolute => {
                let mod_rm = section_bytes[offset - 1];
                section_bytes[offset - 2] = 0xf7;
                section_bytes[offset - 1] = 0xc0 | (mod_rm & 0x38) >> 3;
                *addend = 0;
            }
            RelaxationKind::BinopIndirectToAbsolute => {
                // The immediate forms of these instructions all share opcode 0x81, with bits 2-5
                // of the original opcode carrying the operation into ModRM bits 3-5.
                let opcode = section_bytes[offset - 2];
                let mod_rm = section_bytes[offset - 1];
                section_bytes[offset - 2] = 0x81;
                section_bytes[offset - 1] = 0xc0 | (mod_rm & 0x38) >> 3 | (opcode & 0x3c);
                *addend = 0;
            }
            RelaxationKind::CallIndirectToDirect => {
                section_bytes[offset - 2..offset].copy_from_slice(&[
                    // nop; call
                    0x90, 0xe8,
                ]);
                *addend = -4;
            }
            RelaxationKind::CallIndirectToAddr32Direct => {
                section_bytes[offset - 2..offset].copy_from_slice(&[
                    // addr32 call
                    0x67, 0xe8,
                ]);
                *addend = -4;
            }
            RelaxationKind::JmpIndirectToDirect => {
                section_bytes[offset - 2] = 0xe9;
                section_bytes[offset + 3] = 0x90;
                *offset_in_section -= 1; // Instruction is 1 byte shorter
                *addend = -4;
            }
            RelaxationKind::TlsGdToLocalExec | RelaxationKind::TlsGdToLocalExecNeg => {
                // ModRM 0x04 at offset - 2 means the lea used a SIB byte, putting the call one
                // byte closer to the field.
                let roff = if section_bytes[offset - 2] == 0x04 {
                    offset + 5
                } else {
                    offset + 6
                };
                let mod_rm = if matches!(self, RelaxationKind::TlsGdToLocalExecNeg) {
                    0xc0
                } else {
                    0xe8
                };
                section_bytes[roff - 8..roff + 4].copy_from_slice(&[
                    0x65, 0xa1, 0, 0, 0, 0, // mov %gs:0,%eax
                    0x81, mod_rm, 0, 0, 0, 0, // sub/add {offset},%eax
                ]);
                *offset_in_section = roff as u64;
                *addend = 0;
            }
            RelaxationKind::TlsGdToInitialExec | RelaxationKind::TlsGdToInitialExecPos => {
                let (roff, base_reg) = if section_bytes[offset - 2] == 0x04 {
                    // SIB form. The GOT base register is the SIB index.
                    (offset + 5, (section_bytes[offset - 1] >> 3) & 0x7)
                } else {
                    (offset + 6, section_bytes[offset - 1] & 0x7)
                };
                let (opcode, mod_rm) = if matches!(self, RelaxationKind::TlsGdToInitialExecPos) {
                    // add x,%eax with an absolute GOT address.
                    (0x03, 0x05)
                } else {
                    // sub x(%reg),%eax against the GOT base register.
                    (0x2b, 0x80 | base_reg)
                };
                section_bytes[roff - 8..roff + 4].copy_from_slice(&[
                    0x65, 0xa1, 0, 0, 0, 0, // mov %gs:0,%eax
                    opcode, mod_rm, 0, 0, 0, 0,
                ]);
                *offset_in_section = roff as u64;
                *addend = 0;
            }
            RelaxationKind::TlsLdToLocalExec => {
                // An indirect or addr32-prefixed call to the TLS helper is one byte longer than
                // the plain form, so the padding differs.
                if matches!(section_bytes[offset + 4], 0xff | 0x67) {
                    section_bytes[offset - 2..offset + 10].copy_from_slice(&[
                        0x65, 0xa1, 0, 0, 0, 0, // mov %gs:0,%eax
                        0x8d, 0xb6, 0, 0, 0, 0, // lea 0x0(%esi),%esi
                    ]);
                } else {
                    section_bytes[offset - 2..offset + 9].copy_from_slice(&[
                        0x65, 0xa1, 0, 0, 0, 0, // mov %gs:0,%eax
                        0x90, // nop
                        0x8d, 0x74, 0x26, 0x00, // lea 0x0(%esi,%eiz,1),%esi
                    ]);
                }
                *addend = 0;
            }
            RelaxationKind::TlsIeToLocalExec => {
                let val = section_bytes[offset - 1];
                if val == 0xa1 {
                    // mov x,%eax -> mov $x,%eax
                    section_bytes[offset - 1] = 0xb8;
                } else {
                    let reg = (val >> 3) & 0x7;
                    let opcode = section_bytes[offset - 2];
                    // mov x,%reg -> mov $x,%reg or add x,%reg -> add $x,%reg
                    section_bytes[offset - 2] = if opcode == 0x8b { 0xc7 } else { 0x81 };
                    section_bytes[offset - 1] = 0xc0 | reg;
                }
                *addend = 0;
            }
            RelaxationKind::TlsGotIeToLocalExec => {
                let reg = (section_bytes[offset - 1] >> 3) & 0x7;
                match section_bytes[offset - 2] {
                    // mov x(%reg1),%reg2 -> mov $x,%reg2
                    0x8b => {
                        section_bytes[offset - 2] = 0xc7;
                        section_bytes[offset - 1] = 0xc0 | reg;
                    }
                    // sub x(%reg1),%reg2 -> sub $x,%reg2
                    0x2b => {
                        section_bytes[offset - 2] = 0x81;
                        section_bytes[offset - 1] = 0xe8 | reg;
                    }
                    // add x(%reg1),%reg2 -> add $x,%reg2
                    _ => {
                        section_bytes[offset - 2] = 0x81;
                        section_bytes[offset - 1] = 0xc0 | reg;
                    }
                }
                *addend = 0;
            }
            RelaxationKind::TlsDescToLocalExec => {
                // Flipping ModRM's mod to 0 and rm to 101 turns `lea x@tlsdesc(%ebx), %reg` into
                // `lea x@ntpoff, %reg`, keeping the destination register bits.
                section_bytes[offset - 1] ^= 0x86;
                *addend = 0;
            }
            RelaxationKind::TlsDescToInitialExec => {
                // lea -> mov, loading the offset from the GOT entry.
                section_bytes[offset - 2] = 0x8b;
                *addend = 0;
            }
            RelaxationKind::SkipTlsDescCall => {
                section_bytes[offset..offset + 2].copy_from_slice(&[
                    // xchg %ax,%ax
                    0x66, 0x90,
                ]);
            }
            RelaxationKind::TlsDescCallToNeg => {
                section_bytes[offset..offset + 2].copy_from_slice(&[
                    // neg %eax
                    0xf7, 0xd8,
                ]);
            }
            RelaxationKind::NoOp => {}
        }
    }

    #[must_use]
    pub fn next_modifier(self) -> RelocationModifier {
        match self {
            RelaxationKind::TlsGdToLocalExec
            | RelaxationKind::TlsGdToLocalExecNeg
            | RelaxationKind::TlsGdToInitialExec
            | RelaxationKind::TlsGdToInitialExecPos
            | RelaxationKind::TlsLdToLocalExec => RelocationModifier::SkipNextRelocation,
            RelaxationKind::MovIndirectToLea
            | RelaxationKind::MovIndirectToAbsolute
            | RelaxationKind::TestIndirectToAbsolute
            | RelaxationKind::BinopIndirectToAbsolute
            | RelaxationKind::CallIndirectToDirect
            | RelaxationKind::CallIndirectToAddr32Direct
            | RelaxationKind::JmpIndirectToDirect
            | RelaxationKind::TlsIeToLocalExec
            | RelaxationKind::TlsGotIeToLocalExec
            | RelaxationKind::TlsDescToLocalExec
            | RelaxationKind::TlsDescToInitialExec
            | RelaxationKind::SkipTlsDescCall
            | RelaxationKind::TlsDescCallToNeg
            | RelaxationKind::NoOp => RelocationModifier::Normal,
        }
    }
}

/// Returns the descriptor for the supplied i386 relocation, or `None` if the r_type isn't one
/// that can appear in a relocatable input. i386 stores addends in the relocated field, so the
/// classic 32-bit types never overflow-check.
#[must_use]
pub const fn relocation_from_raw(r_type: u32) -> Option<RelocationKindInfo> {
    let (kind, size, overflow) = match r_type {
        object::elf::R_386_NONE => (RelocationKind::None, 0, OverflowCheck::None),
        object::elf::R_386_32 => (RelocationKind::Absolute, 4, OverflowCheck::None),
        object::elf::R_386_PC32 => (RelocationKind::Relative, 4, OverflowCheck::None),
        object::elf::R_386_16 => (RelocationKind::Absolute, 2, OverflowCheck::Bitfield),
        object::elf::R_386_PC16 => (RelocationKind::Relative, 2, OverflowCheck::Bitfield),
        object::elf::R_386_8 => (RelocationKind::Absolute, 1, OverflowCheck::Bitfield),
        object::elf::R_386_PC8 => (RelocationKind::Relative, 1, OverflowCheck::Signed),
        object::elf::R_386_GOT32 | object::elf::R_386_GOT32X => {
            (RelocationKind::Got, 4, OverflowCheck::None)
        }
        object::elf::R_386_PLT32 => (RelocationKind::PltRelative, 4, OverflowCheck::None),
        object::elf::R_386_GOTOFF => (RelocationKind::SymRelGotBase, 4, OverflowCheck::None),
        object::elf::R_386_GOTPC => (RelocationKind::GotBaseRelative, 4, OverflowCheck::None),
        object::elf::R_386_SIZE32 => (RelocationKind::Size, 4, OverflowCheck::None),
        object::elf::R_386_TLS_GD => (RelocationKind::TlsGdGotBase, 4, OverflowCheck::None),
        object::elf::R_386_TLS_LDM => (RelocationKind::TlsLdGotBase, 4, OverflowCheck::None),
        object::elf::R_386_TLS_LDO_32 => (RelocationKind::DtpOff, 4, OverflowCheck::None),
        object::elf::R_386_TLS_IE => {
            (RelocationKind::GotTpOffAbsolute, 4, OverflowCheck::None)
        }
        object::elf::R_386_TLS_GOTIE => {
            (RelocationKind::GotTpOffGotBase, 4, OverflowCheck::None)
        }
        object::elf::R_386_TLS_IE_32 => {
            (RelocationKind::GotTpOffPositiveGotBase, 4, OverflowCheck::None)
        }
        object::elf::R_386_TLS_LE => (RelocationKind::TpOff, 4, OverflowCheck::None),
        object::elf::R_386_TLS_LE_32 => (RelocationKind::TpOffPositive, 4, OverflowCheck::None),
        object::elf::R_386_TLS_GOTDESC => {
            (RelocationKind::TlsDescGotBase, 4, OverflowCheck::None)
        }
        object::elf::R_386_TLS_DESC_CALL => {
            (RelocationKind::TlsDescCall, 0, OverflowCheck::None)
        }
        _ => return None,
    };

    Some(RelocationKindInfo::new(kind, size, overflow))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn apply_rewrite(kind: RelaxationKind, bytes: &[u8], offset: u64) -> (Vec<u8>, u64, i64) {
        let mut out = bytes.to_owned();
        let mut offset = offset;
        let mut addend = 0;
        kind.apply(&mut out, &mut offset, &mut addend);
        (out, offset, addend)
    }

    #[test]
    fn test_load_rewrites() {
        // mov x@GOT(%ebx),%eax
        let (out, _, _) = apply_rewrite(RelaxationKind::MovIndirectToLea, &[0x8b, 0x83], 2);
        assert_eq!(out, &[0x8d, 0x83]);

        let (out, _, _) = apply_rewrite(RelaxationKind::MovIndirectToAbsolute, &[0x8b, 0x83], 2);
        assert_eq!(out, &[0xc7, 0xc0]);

        // test %edx, x@GOT(%ebx)
        let (out, _, _) = apply_rewrite(RelaxationKind::TestIndirectToAbsolute, &[0x85, 0x93], 2);
        assert_eq!(out, &[0xf7, 0xc2]);

        // add x@GOT(%ebx),%ecx: 0x03 carries operation bits 0, ModRM reg 1.
        let (out, _, _) = apply_rewrite(RelaxationKind::BinopIndirectToAbsolute, &[0x03, 0x8b], 2);
        assert_eq!(out, &[0x81, 0xc1]);

        // and x@GOT(%ebx),%ecx: 0x23 folds to ModRM /4.
        let (out, _, _) = apply_rewrite(RelaxationKind::BinopIndirectToAbsolute, &[0x23, 0x8b], 2);
        assert_eq!(out, &[0x81, 0xe1]);
    }

    #[test]
    fn test_branch_rewrites() {
        let (out, offset, addend) = apply_rewrite(
            RelaxationKind::CallIndirectToDirect,
            &[0xff, 0x93, 0, 0, 0, 0],
            2,
        );
        assert_eq!(out, &[0x90, 0xe8, 0, 0, 0, 0]);
        assert_eq!(offset, 2);
        assert_eq!(addend, -4);

        let (out, offset, addend) = apply_rewrite(
            RelaxationKind::JmpIndirectToDirect,
            &[0xff, 0xa3, 0, 0, 0, 0],
            2,
        );
        assert_eq!(out, &[0xe9, 0xa3, 0, 0, 0, 0x90]);
        assert_eq!(offset, 1);
        assert_eq!(addend, -4);
    }

    #[test]
    fn test_tls_gd_rewrites() {
        // leal x@tlsgd(,%ebx,1),%eax; call ___tls_get_addr@PLT
        let sib_form = [0x8d, 0x04, 0x1d, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0];
        let (out, offset, _) = apply_rewrite(RelaxationKind::TlsGdToLocalExec, &sib_form, 3);
        assert_eq!(
            out,
            &[0x65, 0xa1, 0, 0, 0, 0, 0x81, 0xe8, 0, 0, 0, 0]
        );
        assert_eq!(offset, 8);

        let (out, offset, _) = apply_rewrite(RelaxationKind::TlsGdToLocalExecNeg, &sib_form, 3);
        assert_eq!(
            out,
            &[0x65, 0xa1, 0, 0, 0, 0, 0x81, 0xc0, 0, 0, 0, 0]
        );
        assert_eq!(offset, 8);

        let (out, offset, _) = apply_rewrite(RelaxationKind::TlsGdToInitialExec, &sib_form, 3);
        assert_eq!(
            out,
            &[0x65, 0xa1, 0, 0, 0, 0, 0x2b, 0x83, 0, 0, 0, 0]
        );
        assert_eq!(offset, 8);

        // leal x@tlsgd(%ebx),%eax; call; nop
        let reg_form = [0x8d, 0x83, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0, 0x90];
        let (out, offset, _) = apply_rewrite(RelaxationKind::TlsGdToInitialExecPos, &reg_form, 2);
        assert_eq!(
            out,
            &[0x65, 0xa1, 0, 0, 0, 0, 0x03, 0x05, 0, 0, 0, 0]
        );
        assert_eq!(offset, 8);
    }

    #[test]
    fn test_tls_ld_rewrites() {
        // leal x@tlsldm(%ebx),%eax; call ___tls_get_addr@PLT (direct form)
        let direct = [0x8d, 0x83, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0];
        let (out, _, _) = apply_rewrite(RelaxationKind::TlsLdToLocalExec, &direct, 2);
        assert_eq!(
            out,
            &[0x65, 0xa1, 0, 0, 0, 0, 0x90, 0x8d, 0x74, 0x26, 0x00]
        );

        // Same, calling through the GOT.
        let indirect = [0x8d, 0x83, 0, 0, 0, 0, 0xff, 0x93, 0, 0, 0, 0];
        let (out, _, _) = apply_rewrite(RelaxationKind::TlsLdToLocalExec, &indirect, 2);
        assert_eq!(
            out,
            &[0x65, 0xa1, 0, 0, 0, 0, 0x8d, 0xb6, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_tls_ie_rewrites() {
        // mov x@indntpoff,%eax
        let (out, _, _) = apply_rewrite(RelaxationKind::TlsIeToLocalExec, &[0xa1], 1);
        assert_eq!(out, &[0xb8]);

        // add x@indntpoff,%ecx
        let (out, _, _) = apply_rewrite(RelaxationKind::TlsIeToLocalExec, &[0x03, 0x0d], 2);
        assert_eq!(out, &[0x81, 0xc1]);

        // mov x@gotntpoff(%ebx),%edx
        let (out, _, _) = apply_rewrite(RelaxationKind::TlsGotIeToLocalExec, &[0x8b, 0x93], 2);
        assert_eq!(out, &[0xc7, 0xc2]);

        // sub x@gottpoff(%ebx),%edx
        let (out, _, _) = apply_rewrite(RelaxationKind::TlsGotIeToLocalExec, &[0x2b, 0x93], 2);
        assert_eq!(out, &[0x81, 0xea]);
    }

    #[test]
    fn test_tls_desc_rewrites() {
        // leal x@tlsdesc(%ebx),%eax
        let (out, _, _) = apply_rewrite(RelaxationKind::TlsDescToLocalExec, &[0x8d, 0x83], 2);
        assert_eq!(out, &[0x8d, 0x05]);

        let (out, _, _) = apply_rewrite(RelaxationKind::TlsDescToInitialExec, &[0x8d, 0x83], 2);
        assert_eq!(out, &[0x8b, 0x83]);

        // call *(%eax)
        let (out, _, _) = apply_rewrite(RelaxationKind::SkipTlsDescCall, &[0xff, 0x10], 0);
        assert_eq!(out, &[0x66, 0x90]);

        let (out, _, _) = apply_rewrite(RelaxationKind::TlsDescCallToNeg, &[0xff, 0x10], 0);
        assert_eq!(out, &[0xf7, 0xd8]);
    }

    #[test]
    fn test_catalog() {
        let info = relocation_from_raw(object::elf::R_386_GOT32X).unwrap();
        assert_eq!(info.kind, RelocationKind::Got);

        // The in-place addend means 32-bit values wrap rather than overflow-check.
        let info = relocation_from_raw(object::elf::R_386_PC32).unwrap();
        assert!(info.verify(i64::from(i32::MAX) + 1).is_ok());

        let info = relocation_from_raw(object::elf::R_386_16).unwrap();
        assert!(info.verify(0x1_0000).is_err());

        assert!(relocation_from_raw(object::elf::R_386_JMP_SLOT).is_none());
    }
}
