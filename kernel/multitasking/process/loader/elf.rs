// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides functionality to parse and validate ELF64 binaries.

use crate::{Image, LoadError, Relocation, RelocationKind, Segment};
use alloc::vec::Vec;
use memory::constants::{USERSPACE, USER_IMAGE_BASE};
use memory::{PageTableFlags, VirtAddr, VirtAddrRange, PAGE_SIZE};
use xmas_elf::header::{sanity_check, Class, Data, Machine, Version};
use xmas_elf::program::{ProgramHeader, Type};
use xmas_elf::ElfFile;

// Dynamic section entry tags.
//
const DT_NULL: i64 = 0;
const DT_RELA: i64 = 7;
const DT_RELASZ: i64 = 8;
const DT_RELAENT: i64 = 9;

// Relocation types in the low word of r_info.
//
const R_X86_64_NONE: u32 = 0;
const R_X86_64_64: u32 = 1;
const R_X86_64_GLOB_DAT: u32 = 6;
const R_X86_64_JUMP_SLOT: u32 = 7;
const R_X86_64_RELATIVE: u32 = 8;

/// The size of one Elf64_Rela entry.
///
const RELA_ENTRY_SIZE: u64 = 24;

/// Determines whether the given binary is likely an ELF
/// binary.
///
pub fn is_elf(content: &[u8]) -> bool {
    content.starts_with(&[0x7f, b'E', b'L', b'F'])
}

// A loadable segment with its link-time addresses, before
// the image's displacement is chosen.
//
struct RawSegment<'data> {
    vaddr: u64,
    mem_size: u64,
    data: &'data [u8],
    flags: PageTableFlags,
}

/// Parse an ELF binary, validating its structure.
///
/// If `parse_elf` returns an `Ok` result, no further checks
/// will be necessary before loading.
///
pub fn parse_elf(binary: &[u8]) -> Result<Image, LoadError> {
    const GNU_STACK: Type = Type::OsSpecific(1685382481); // GNU stack segment.

    let elf = ElfFile::new(binary).map_err(LoadError::Invalid)?;
    sanity_check(&elf).map_err(LoadError::Invalid)?;

    match elf.header.pt1.class() {
        Class::SixtyFour => {}
        Class::ThirtyTwo => return Err(LoadError::Invalid("32-bit binaries are not supported")),
        _ => return Err(LoadError::Invalid("unknown binary class")),
    }

    match elf.header.pt1.data() {
        Data::LittleEndian => {}
        Data::BigEndian => {
            return Err(LoadError::Invalid("big endian binaries are not supported"))
        }
        _ => return Err(LoadError::Invalid("unknown binary data")),
    }

    match elf.header.pt1.version() {
        Version::Current => {}
        _ => return Err(LoadError::Invalid("unknown binary version")),
    }

    // We ignore the OS ABI.

    match elf.header.pt2.machine().as_machine() {
        Machine::X86_64 => {}
        _ => return Err(LoadError::Invalid("unsupported instruction set architecture")),
    }

    let is_library = match elf.header.pt2.type_().as_type() {
        xmas_elf::header::Type::Executable => false,
        xmas_elf::header::Type::SharedObject => true,
        _ => return Err(LoadError::Invalid("not an executable or shared object")),
    };

    // Collect the load segments with their link-time
    // addresses, checking that none of them overlap, and
    // find the dynamic section while we're at it.
    let mut raw_segments: Vec<RawSegment> = Vec::new();
    let mut dynamic: Option<&[u8]> = None;
    for prog in elf.program_iter() {
        match prog {
            ProgramHeader::Ph64(header) => {
                let typ = header.get_type().map_err(LoadError::Invalid)?;
                match typ {
                    Type::Load => {
                        if header.mem_size < header.file_size {
                            return Err(LoadError::Invalid(
                                "program segment is larger on disk than in memory",
                            ));
                        }
                        if header.mem_size == 0 {
                            continue;
                        }

                        let end = header
                            .virtual_addr
                            .checked_add(header.mem_size)
                            .ok_or(LoadError::Invalid("invalid memory size in program segment"))?;
                        for other in raw_segments.iter() {
                            if header.virtual_addr < other.vaddr + other.mem_size
                                && other.vaddr < end
                            {
                                return Err(LoadError::Invalid("program segments overlap"));
                            }
                        }

                        let mut flags =
                            PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
                        if !header.flags.is_execute() {
                            flags |= PageTableFlags::NO_EXECUTE;
                        }
                        if header.flags.is_write() {
                            flags |= PageTableFlags::WRITABLE;
                        }

                        raw_segments.push(RawSegment {
                            vaddr: header.virtual_addr,
                            mem_size: header.mem_size,
                            data: header.raw_data(&elf),
                            flags,
                        });
                    }
                    Type::Dynamic => {
                        dynamic = Some(header.raw_data(&elf));
                    }
                    Type::Tls => {
                        return Err(LoadError::NotSupported(
                            "thread-local storage is not yet supported",
                        ));
                    }
                    Type::Interp => {
                        return Err(LoadError::NotSupported(
                            "interpreted binaries are not yet supported",
                        ));
                    }
                    GNU_STACK => {
                        if header.flags.is_execute() {
                            return Err(LoadError::Invalid("executable stacks are not supported"));
                        }
                    }
                    _ => {} // Ignore for now.
                }
            }
            ProgramHeader::Ph32(_) => {
                return Err(LoadError::Invalid("32-bit binaries are not supported"))
            }
        }
    }

    if raw_segments.is_empty() {
        return Err(LoadError::Invalid("no loadable segments"));
    }

    // Pick the image's placement. Executables keep their
    // fixed link addresses; position-independent binaries
    // land at the deterministic user image base.
    let min_vaddr = raw_segments.iter().map(|s| s.vaddr).min().unwrap_or(0);
    let max_end = raw_segments
        .iter()
        .map(|s| s.vaddr + s.mem_size)
        .max()
        .unwrap_or(0);
    let link_base = min_vaddr & !(PAGE_SIZE as u64 - 1);
    let displacement = if is_library {
        USER_IMAGE_BASE.as_usize() as u64
    } else {
        0
    };

    let place = |addr: u64| -> Result<VirtAddr, LoadError> {
        let moved = addr
            .checked_add(displacement)
            .ok_or(LoadError::Invalid("segment address overflows"))?;
        VirtAddr::try_new(moved as usize)
            .map_err(|_| LoadError::Invalid("segment address is not canonical"))
    };

    let mut segments = Vec::with_capacity(raw_segments.len());
    let mut regions: Vec<VirtAddrRange> = Vec::new();
    for raw in raw_segments.iter() {
        let start = place(raw.vaddr)?;
        let end = place(raw.vaddr + raw.mem_size)?;
        let range = VirtAddrRange::new(start, end - 1);
        if !USERSPACE.contains(&range) {
            return Err(LoadError::Invalid("program segment is outside userspace"));
        }

        regions.push(range);
        segments.push(Segment {
            start,
            end,
            data: raw.data,
            flags: raw.flags,
        });
    }

    // Check that the entry point lands in one of the
    // segments.
    let entry_point = place(elf.header.pt2.entry_point())?;
    regions
        .iter()
        .find(|region| region.contains_addr(entry_point))
        .ok_or(LoadError::Invalid("entry point is not in any program segment"))?;

    // Process the dynamic section's relocation table, if
    // there is one.
    let mut relocations = Vec::new();
    let mut skipped_relocations = 0;
    if let Some(dyn_data) = dynamic {
        let table = rela_table(dyn_data, &raw_segments)?;
        if let Some(rela) = table {
            for entry in rela.chunks_exact(RELA_ENTRY_SIZE as usize) {
                let r_offset = read_u64(entry, 0);
                let r_info = read_u64(entry, 8);
                let r_addend = read_u64(entry, 16);

                match (r_info & 0xffff_ffff) as u32 {
                    R_X86_64_NONE => {}
                    R_X86_64_RELATIVE => relocations.push(Relocation {
                        addr: r_offset,
                        kind: RelocationKind::Relative { addend: r_addend },
                    }),
                    // These need a symbol resolver, which
                    // the kernel does not provide.
                    R_X86_64_64 | R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT => {
                        skipped_relocations += 1;
                    }
                    _ => skipped_relocations += 1,
                }
            }
        }
    }

    Ok(Image {
        entry_point,
        image_base: place(link_base)?,
        link_base,
        image_size: (max_end - link_base) as usize,
        is_library,
        segments,
        relocations,
        skipped_relocations,
        unbound_imports: 0,
    })
}

// Locates the DT_RELA table described by the dynamic
// section, returning its bytes.
//
fn rela_table<'data>(
    dyn_data: &[u8],
    segments: &[RawSegment<'data>],
) -> Result<Option<&'data [u8]>, LoadError> {
    let mut rela_addr: Option<u64> = None;
    let mut rela_size: u64 = 0;
    let mut rela_ent: u64 = RELA_ENTRY_SIZE;

    for entry in dyn_data.chunks_exact(16) {
        let d_tag = read_u64(entry, 0) as i64;
        let d_val = read_u64(entry, 8);

        match d_tag {
            DT_NULL => break,
            DT_RELA => rela_addr = Some(d_val),
            DT_RELASZ => rela_size = d_val,
            DT_RELAENT => rela_ent = d_val,
            _ => {}
        }
    }

    let rela_addr = match rela_addr {
        Some(addr) => addr,
        None => return Ok(None),
    };

    if rela_ent != RELA_ENTRY_SIZE || rela_size % RELA_ENTRY_SIZE != 0 {
        return Err(LoadError::Invalid("malformed relocation table"));
    }

    // The table lives inside one of the load segments'
    // file data.
    for segment in segments.iter() {
        if rela_addr >= segment.vaddr
            && rela_addr + rela_size <= segment.vaddr + segment.data.len() as u64
        {
            let offset = (rela_addr - segment.vaddr) as usize;
            return Ok(Some(&segment.data[offset..offset + rela_size as usize]));
        }
    }

    Err(LoadError::Invalid("relocation table is not in any segment"))
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}
