//! End-to-end runs of the relocation engine over small hand-assembled inputs. Expected
//! displacements and table contents are computed from the addresses the engine reports rather
//! than hard-coded, so the assertions hold even if the layout order changes.

use libweld::Architecture;
use libweld::Args;
use libweld::OutputKind;
use libweld::RelocationModel;
use libweld::link;
use libweld::model::Binding;
use libweld::model::InputObject;
use libweld::model::InputSymbol;
use libweld::model::Relocation;
use libweld::model::Section;
use libweld::model::SymbolKind;
use libweld::model::SymbolPlacement;
use libweld::model::Visibility;
use linker_utils::elf::SectionFlags;
use object::LittleEndian;

fn section(
    name: &str,
    flags: u64,
    alignment: u64,
    data: Vec<u8>,
    relocations: Vec<Relocation>,
) -> Section {
    Section {
        name: name.to_owned(),
        data,
        flags: SectionFlags::from_u64(flags),
        alignment,
        relocations,
        retained: true,
    }
}

fn text_section(data: Vec<u8>, relocations: Vec<Relocation>) -> Section {
    section(
        ".text",
        u64::from(object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR),
        16,
        data,
        relocations,
    )
}

fn symbol(name: &str, kind: SymbolKind, placement: SymbolPlacement) -> InputSymbol {
    InputSymbol {
        name: name.to_owned(),
        kind,
        binding: Binding::Global,
        visibility: Visibility::Default,
        placement,
        size: 0,
    }
}

fn defined(name: &str, kind: SymbolKind, section_index: usize, offset: u64) -> InputSymbol {
    symbol(
        name,
        kind,
        SymbolPlacement::Section {
            section_index,
            offset,
        },
    )
}

fn weak_undefined(name: &str) -> InputSymbol {
    let mut sym = symbol(name, SymbolKind::NoType, SymbolPlacement::Undefined);
    sym.binding = Binding::Weak;
    sym
}

fn object_file(sections: Vec<Section>, symbols: Vec<InputSymbol>) -> InputObject {
    InputObject {
        name: "test.o".to_owned(),
        sections,
        symbols,
    }
}

fn rela(offset: u64, r_type: u32, symbol_index: usize, addend: i64) -> Relocation {
    Relocation {
        offset,
        r_type,
        symbol_index,
        addend,
    }
}

#[track_caller]
fn read_u32(data: &[u8], offset: u64) -> u32 {
    let offset = offset as usize;
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}

#[track_caller]
fn read_u64(data: &[u8], offset: u64) -> u64 {
    let offset = offset as usize;
    u64::from_le_bytes(data[offset..offset + 8].try_into().unwrap())
}

fn rela_entries(bytes: &[u8]) -> &[object::elf::Rela64<LittleEndian>] {
    object::pod::slice_from_all_bytes(bytes).unwrap()
}

#[test]
fn static_executable_bypasses_the_got_entirely() {
    let args = Args::new(
        Architecture::X86_64,
        OutputKind::StaticExecutable(RelocationModel::NonRelocatable),
    );
    // call *helper@gotpcrel(%rip); mov missing@gotpcrel(%rip),%rax; then helper's body.
    let code = vec![
        0xff, 0x15, 0, 0, 0, 0, //
        0x48, 0x8b, 0x05, 0, 0, 0, 0, //
        0x90, 0x90, 0x90, //
        0xc3,
    ];
    let mut objects = vec![object_file(
        vec![text_section(
            code,
            vec![
                rela(2, object::elf::R_X86_64_GOTPCRELX, 0, -4),
                rela(9, object::elf::R_X86_64_REX_GOTPCRELX, 1, -4),
            ],
        )],
        vec![
            defined("helper", SymbolKind::Function, 0, 16),
            weak_undefined("missing"),
        ],
    )];

    let out = link(&args, &mut objects).unwrap();

    let text = out.section_addresses[0][0].unwrap();
    let helper = out.symbol("helper").unwrap();
    assert_eq!(helper.value, text + 16);
    assert_eq!(helper.got_address, None);
    assert_eq!(helper.plt_address, None);

    // The indirect call went direct: addr32 call helper.
    let data = &objects[0].sections[0].data;
    assert_eq!(&data[..2], &[0x67, 0xe8]);
    assert_eq!(read_u32(data, 2), (helper.value - (text + 6)) as u32);

    // The undefined weak resolves to zero, loaded as an immediate.
    assert_eq!(&data[6..9], &[0x48, 0xc7, 0xc0]);
    assert_eq!(read_u32(data, 9), 0);

    // Nothing was left needing the PLT or the dynamic tables.
    assert!(out.plt.is_empty());
    assert!(out.rela_dyn.is_empty());
    assert!(out.rela_plt.is_empty());
    assert!(out.got.iter().all(|&b| b == 0));
}

#[test]
fn shared_object_routes_interposable_calls_through_the_plt() {
    let args = Args::new(Architecture::X86_64, OutputKind::SharedObject);
    // call ext_func; padding; ext_func's body.
    let code = vec![0xe8, 0, 0, 0, 0, 0x90, 0x90, 0x90, 0xc3];
    let mut objects = vec![object_file(
        vec![text_section(
            code,
            vec![rela(1, object::elf::R_X86_64_PLT32, 0, -4)],
        )],
        vec![defined("ext_func", SymbolKind::Function, 0, 8)],
    )];

    let out = link(&args, &mut objects).unwrap();

    let ext = out.symbol("ext_func").unwrap();
    let plt_entry = ext.plt_address.unwrap();
    let got_slot = ext.got_address.unwrap();

    // A lazy header followed by one entry.
    assert_eq!(&out.plt[..2], &[0xff, 0x35]);
    assert_eq!(plt_entry, out.plt_address + 16);

    // The call lands on the PLT entry even though the definition is local to this object.
    let text = out.section_addresses[0][0].unwrap();
    let data = &objects[0].sections[0].data;
    assert_eq!(read_u32(data, 1), plt_entry.wrapping_sub(text + 5) as u32);

    // One jump slot, initialised so the first call resumes past the entry's indirect jump.
    let entries = rela_entries(&out.rela_plt);
    assert_eq!(entries.len(), 1);
    let info = entries[0].r_info.get(LittleEndian);
    assert_eq!(entries[0].r_offset.get(LittleEndian), got_slot);
    assert_eq!(info as u32, object::elf::R_X86_64_JUMP_SLOT);
    assert_eq!((info >> 32) as u32, 1);
    assert_eq!(read_u64(&out.got, got_slot - out.got_address), plt_entry + 6);

    assert!(out.rela_dyn.is_empty());
}

#[test]
fn tls_gd_against_a_shared_symbol_relaxes_to_initial_exec() {
    let args = Args::new(
        Architecture::X86_64,
        OutputKind::DynamicExecutable(RelocationModel::Relocatable),
    );
    // data16 lea tvar@tlsgd(%rip),%rdi; data16 data16 rex.W call __tls_get_addr@plt
    let code = vec![
        0x66, 0x48, 0x8d, 0x3d, 0, 0, 0, 0, 0x66, 0x66, 0x48, 0xe8, 0, 0, 0, 0,
    ];
    let mut objects = vec![object_file(
        vec![text_section(
            code,
            vec![
                rela(4, object::elf::R_X86_64_TLSGD, 0, -4),
                rela(12, object::elf::R_X86_64_PLT32, 1, -4),
            ],
        )],
        vec![
            symbol("tvar", SymbolKind::Tls, SymbolPlacement::Dynamic),
            symbol("__tls_get_addr", SymbolKind::Function, SymbolPlacement::Dynamic),
        ],
    )];

    let out = link(&args, &mut objects).unwrap();

    let slot = out.symbol("tvar").unwrap().got_address.unwrap();
    let text = out.section_addresses[0][0].unwrap();
    let data = &objects[0].sections[0].data;

    // mov %fs:0,%rax; add tvar@gottpoff(%rip),%rax
    assert_eq!(
        &data[..12],
        &[0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, 0x48, 0x03, 0x05]
    );
    assert_eq!(read_u32(data, 12), slot.wrapping_sub(text + 16) as u32);

    // The thread-pointer offset comes from the loader; the slot itself starts as zero.
    let entries = rela_entries(&out.rela_dyn);
    assert_eq!(entries.len(), 1);
    let info = entries[0].r_info.get(LittleEndian);
    assert_eq!(entries[0].r_offset.get(LittleEndian), slot);
    assert_eq!(info as u32, object::elf::R_X86_64_TPOFF64);
    assert_eq!((info >> 32) as u32, 1);
    assert_eq!(entries[0].r_addend.get(LittleEndian), 0);
    assert_eq!(read_u64(&out.got, slot - out.got_address), 0);

    // The transition consumed the helper call, so no PLT was built for it.
    assert!(out.plt.is_empty());
    assert!(out.rela_plt.is_empty());
}

#[test]
fn tls_gd_in_a_static_executable_relaxes_to_local_exec() {
    let args = Args::new(
        Architecture::X86_64,
        OutputKind::StaticExecutable(RelocationModel::NonRelocatable),
    );
    let code = vec![
        0x66, 0x48, 0x8d, 0x3d, 0, 0, 0, 0, 0x66, 0x66, 0x48, 0xe8, 0, 0, 0, 0,
    ];
    let tdata = section(
        ".tdata",
        u64::from(object::elf::SHF_ALLOC | object::elf::SHF_WRITE | object::elf::SHF_TLS),
        8,
        vec![0; 16],
        vec![],
    );
    let mut objects = vec![object_file(
        vec![
            text_section(
                code,
                vec![
                    rela(4, object::elf::R_X86_64_TLSGD, 0, -4),
                    rela(12, object::elf::R_X86_64_PLT32, 1, -4),
                ],
            ),
            tdata,
        ],
        vec![
            defined("tvar", SymbolKind::Tls, 1, 8),
            symbol(
                "__tls_get_addr",
                SymbolKind::Function,
                SymbolPlacement::Undefined,
            ),
        ],
    )];

    let out = link(&args, &mut objects).unwrap();

    let tvar = out.symbol("tvar").unwrap();
    assert_eq!(out.tls_end - out.tls_start, 16);
    assert_eq!(tvar.value, out.tls_start + 8);
    assert_eq!(tvar.got_address, None);

    // mov %fs:0,%rax; lea tvar@tpoff(%rax),%rax with the offset resolved at link time.
    let data = &objects[0].sections[0].data;
    assert_eq!(
        &data[..12],
        &[0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, 0x48, 0x8d, 0x80]
    );
    assert_eq!(read_u32(data, 12), (-8i32) as u32);
    assert!(out.got.iter().all(|&b| b == 0));
}

#[test]
fn packed_relative_relocations_replace_the_rela_table() {
    let mut args = Args::new(
        Architecture::X86_64,
        OutputKind::DynamicExecutable(RelocationModel::Relocatable),
    );
    args.pack_relative_relocs = true;
    let data = section(
        ".data",
        u64::from(object::elf::SHF_ALLOC | object::elf::SHF_WRITE),
        8,
        vec![0; 16],
        vec![
            rela(0, object::elf::R_X86_64_64, 0, 0),
            rela(8, object::elf::R_X86_64_64, 0, 4),
        ],
    );
    let mut objects = vec![object_file(
        vec![data],
        vec![defined("blob", SymbolKind::Object, 0, 0)],
    )];

    let out = link(&args, &mut objects).unwrap();

    let addr = out.section_addresses[0][0].unwrap();
    assert_eq!(out.symbol("blob").unwrap().value, addr);

    let words: Vec<u64> = out
        .relr
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    assert_eq!(libweld::relr::decode(&words, 8), vec![addr, addr + 8]);

    // The fields hold the link-time values; the loader only adds the load bias.
    let data = &objects[0].sections[0].data;
    assert_eq!(read_u64(data, 0), addr);
    assert_eq!(read_u64(data, 8), addr + 4);
    assert!(out.rela_dyn.is_empty());
}

#[test]
fn i386_got_load_with_base_register_becomes_got_relative_lea() {
    let args = Args::new(
        Architecture::I386,
        OutputKind::DynamicExecutable(RelocationModel::Relocatable),
    );
    // mov target@GOT(%ebx),%eax
    let code = vec![0x8b, 0x83, 0, 0, 0, 0];
    let data = section(
        ".data",
        u64::from(object::elf::SHF_ALLOC | object::elf::SHF_WRITE),
        4,
        vec![0; 4],
        vec![],
    );
    let mut objects = vec![object_file(
        vec![
            text_section(code, vec![rela(2, object::elf::R_386_GOT32X, 0, 0)]),
            data,
        ],
        vec![defined("target", SymbolKind::Object, 1, 0)],
    )];

    let out = link(&args, &mut objects).unwrap();

    let target = out.symbol("target").unwrap();
    assert_eq!(target.got_address, None);

    // The base register holds the GOT address, so the load became a GOT-relative lea.
    let code = &objects[0].sections[0].data;
    assert_eq!(&code[..2], &[0x8d, 0x83]);
    assert_eq!(
        read_u32(code, 2),
        target.value.wrapping_sub(out.got_address) as u32
    );

    // Only the three reserved entries remain.
    assert_eq!(out.got.len(), 12);
}

#[test]
fn i386_baseless_got_load_is_rejected_in_a_shared_object() {
    let args = Args::new(Architecture::I386, OutputKind::SharedObject);
    // mov ext@GOT,%eax with no base register.
    let code = vec![0x8b, 0x05, 0, 0, 0, 0];
    let mut objects = vec![object_file(
        vec![text_section(
            code,
            vec![rela(2, object::elf::R_386_GOT32X, 0, 0)],
        )],
        vec![symbol("ext", SymbolKind::Object, SymbolPlacement::Dynamic)],
    )];

    let err = link(&args, &mut objects).unwrap_err();
    assert!(format!("{err:#}").contains("base register"));
}

#[test]
fn out_of_range_values_are_rejected_unless_overflow_checks_are_skipped() {
    fn inputs() -> Vec<InputObject> {
        let far = section(
            ".data",
            u64::from(object::elf::SHF_ALLOC | object::elf::SHF_WRITE),
            1 << 32,
            vec![0; 8],
            vec![],
        );
        let user = section(
            ".rodata",
            u64::from(object::elf::SHF_ALLOC),
            4,
            vec![0; 4],
            vec![rela(0, object::elf::R_X86_64_32S, 0, 0)],
        );
        vec![object_file(
            vec![far, user],
            vec![defined("far", SymbolKind::Object, 0, 0)],
        )]
    }

    let mut args = Args::new(
        Architecture::X86_64,
        OutputKind::StaticExecutable(RelocationModel::NonRelocatable),
    );

    // The section's alignment pushes its address past what a sign-extended 32-bit field holds.
    let err = link(&args, &mut inputs()).unwrap_err();
    assert!(format!("{err:#}").contains("R_X86_64_32S"));

    args.skip_overflow_checks = true;
    let mut objects = inputs();
    let out = link(&args, &mut objects).unwrap();
    assert_eq!(out.symbol("far").unwrap().value, 1 << 32);
    assert_eq!(read_u32(&objects[0].sections[1].data, 0), 0);
}
