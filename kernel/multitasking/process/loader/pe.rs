// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides functionality to parse and validate PE32 and PE32+
//! binaries.

use crate::{Image, LoadError, Relocation, RelocationKind, Segment};
use alloc::vec::Vec;
use memory::{PageTableFlags, VirtAddr};

// COFF machine types.
//
const IMAGE_FILE_MACHINE_I386: u16 = 0x014c;
const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

// COFF characteristics.
//
const IMAGE_FILE_DLL: u16 = 0x2000;

// Optional header magics.
//
const PE32_MAGIC: u16 = 0x10b;
const PE32_PLUS_MAGIC: u16 = 0x20b;

// Section characteristics.
//
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

// Base relocation types, from the high 4 bits of each
// relocation entry.
//
const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
const IMAGE_REL_BASED_HIGHLOW: u16 = 3;
const IMAGE_REL_BASED_DIR64: u16 = 10;

// Data directory indices.
//
const DIRECTORY_IMPORT: usize = 1;
const DIRECTORY_BASE_RELOC: usize = 5;

/// Determines whether the given binary is likely a PE
/// binary.
///
pub fn is_pe(content: &[u8]) -> bool {
    content.starts_with(b"MZ")
}

// A section's placement, used to translate relative virtual
// addresses into file offsets.
//
struct SectionExtent {
    rva: u32,
    raw_size: u32,
    raw_ptr: u32,
}

/// Parse a PE binary, validating its structure.
///
/// Both PE32 and PE32+ optional headers are accepted, for the
/// i386 and amd64 machine types. The base relocation
/// directory is parsed into the image's relocation list; the
/// import directory is parsed only far enough to count its
/// entries, since name binding needs a dynamic linker.
///
pub fn parse_pe(binary: &[u8]) -> Result<Image, LoadError> {
    if !is_pe(binary) {
        return Err(LoadError::Invalid("missing DOS magic"));
    }

    let lfanew = read_u32(binary, 0x3c)? as usize;
    if binary.len() < lfanew + 4 + 20 {
        return Err(LoadError::Invalid("truncated PE headers"));
    }
    if &binary[lfanew..lfanew + 4] != b"PE\0\0" {
        return Err(LoadError::Invalid("missing PE signature"));
    }

    // The COFF file header.
    let coff = lfanew + 4;
    let machine = read_u16(binary, coff)?;
    match machine {
        IMAGE_FILE_MACHINE_I386 | IMAGE_FILE_MACHINE_AMD64 => {}
        _ => return Err(LoadError::Invalid("unsupported machine type")),
    }

    let num_sections = read_u16(binary, coff + 2)? as usize;
    let optional_size = read_u16(binary, coff + 16)? as usize;
    let characteristics = read_u16(binary, coff + 18)?;
    let is_library = characteristics & IMAGE_FILE_DLL != 0;

    // The optional header, whose layout depends on its
    // magic.
    let opt = coff + 20;
    if binary.len() < opt + optional_size {
        return Err(LoadError::Invalid("truncated optional header"));
    }

    let magic = read_u16(binary, opt)?;
    let (image_base, entry_rva, size_of_image, num_directories, directories) = match magic {
        PE32_PLUS_MAGIC => {
            let entry_rva = read_u32(binary, opt + 16)?;
            let image_base = read_u64(binary, opt + 24)?;
            let size_of_image = read_u32(binary, opt + 56)?;
            let count = read_u32(binary, opt + 108)? as usize;
            (image_base, entry_rva, size_of_image, count, opt + 112)
        }
        PE32_MAGIC => {
            let entry_rva = read_u32(binary, opt + 16)?;
            let image_base = read_u32(binary, opt + 28)? as u64;
            let size_of_image = read_u32(binary, opt + 56)?;
            let count = read_u32(binary, opt + 92)? as usize;
            (image_base, entry_rva, size_of_image, count, opt + 96)
        }
        _ => return Err(LoadError::Invalid("unrecognised optional header magic")),
    };

    let base = VirtAddr::try_new(image_base as usize)
        .map_err(|_| LoadError::Invalid("image base is not canonical"))?;

    let directory = |index: usize| -> Result<(u32, u32), LoadError> {
        if index >= num_directories {
            return Ok((0, 0));
        }

        let at = directories + index * 8;
        Ok((read_u32(binary, at)?, read_u32(binary, at + 4)?))
    };
    let import_dir = directory(DIRECTORY_IMPORT)?;
    let reloc_dir = directory(DIRECTORY_BASE_RELOC)?;

    // The section table.
    let mut extents = Vec::with_capacity(num_sections);
    let mut segments = Vec::with_capacity(num_sections);
    let mut image_end = size_of_image as u64;
    let section_table = opt + optional_size;
    for index in 0..num_sections {
        let at = section_table + index * 40;
        let virtual_size = read_u32(binary, at + 8)?;
        let rva = read_u32(binary, at + 12)?;
        let raw_size = read_u32(binary, at + 16)?;
        let raw_ptr = read_u32(binary, at + 20)?;
        let section_chars = read_u32(binary, at + 36)?;

        let mem_size = if virtual_size > 0 {
            virtual_size
        } else {
            raw_size
        };
        if mem_size == 0 {
            continue;
        }

        let data_len = raw_size.min(mem_size) as usize;
        let data_start = raw_ptr as usize;
        if binary.len() < data_start + data_len {
            return Err(LoadError::Invalid("section data extends past end of file"));
        }

        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if section_chars & IMAGE_SCN_MEM_EXECUTE == 0 {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        if section_chars & IMAGE_SCN_MEM_WRITE != 0 {
            flags |= PageTableFlags::WRITABLE;
        }

        let start = base
            .checked_add(rva as usize)
            .ok_or(LoadError::Invalid("section address overflows"))?;
        let end = start
            .checked_add(mem_size as usize)
            .ok_or(LoadError::Invalid("section size overflows"))?;

        image_end = image_end.max(rva as u64 + mem_size as u64);
        extents.push(SectionExtent {
            rva,
            raw_size,
            raw_ptr,
        });
        segments.push(Segment {
            start,
            end,
            data: &binary[data_start..data_start + data_len],
            flags,
        });
    }

    if segments.is_empty() {
        return Err(LoadError::Invalid("no loadable sections"));
    }

    // The base relocation directory: blocks of 16-bit
    // entries, each covering one page.
    let mut relocations = Vec::new();
    let mut skipped_relocations = 0;
    if reloc_dir.0 != 0 && reloc_dir.1 != 0 {
        let table = rva_to_slice(binary, &extents, reloc_dir.0, reloc_dir.1)?;
        let mut pos = 0;
        while pos + 8 <= table.len() {
            let page_rva = read_u32(table, pos)?;
            let block_size = read_u32(table, pos + 4)? as usize;
            if block_size < 8 || pos + block_size > table.len() {
                return Err(LoadError::Invalid("malformed base relocation block"));
            }

            let mut entry = pos + 8;
            while entry + 2 <= pos + block_size {
                let value = read_u16(table, entry)?;
                let kind = value >> 12;
                let offset = (value & 0xfff) as u64;
                let addr = image_base + page_rva as u64 + offset;

                match kind {
                    IMAGE_REL_BASED_ABSOLUTE => {} // Alignment padding.
                    IMAGE_REL_BASED_DIR64 => relocations.push(Relocation {
                        addr,
                        kind: RelocationKind::Dir64,
                    }),
                    IMAGE_REL_BASED_HIGHLOW => relocations.push(Relocation {
                        addr,
                        kind: RelocationKind::HighLow,
                    }),
                    _ => skipped_relocations += 1,
                }

                entry += 2;
            }

            pos += block_size;
        }
    }

    // The import directory: descriptors are parsed so their
    // count is known, but names are never bound to
    // addresses.
    let mut unbound_imports = 0;
    if import_dir.0 != 0 && import_dir.1 != 0 {
        let table = rva_to_slice(binary, &extents, import_dir.0, import_dir.1)?;
        let mut pos = 0;
        while pos + 20 <= table.len() {
            let descriptor = &table[pos..pos + 20];
            if descriptor.iter().all(|&b| b == 0) {
                break;
            }

            unbound_imports += 1;
            pos += 20;
        }
    }

    Ok(Image {
        entry_point: base
            .checked_add(entry_rva as usize)
            .ok_or(LoadError::Invalid("entry point overflows"))?,
        image_base: base,
        link_base: image_base,
        image_size: image_end as usize,
        is_library,
        segments,
        relocations,
        skipped_relocations,
        unbound_imports,
    })
}

// Translates a relative virtual address range into the file
// bytes of the section containing it.
//
fn rva_to_slice<'data>(
    binary: &'data [u8],
    extents: &[SectionExtent],
    rva: u32,
    size: u32,
) -> Result<&'data [u8], LoadError> {
    for extent in extents.iter() {
        if rva >= extent.rva && rva + size <= extent.rva + extent.raw_size {
            let start = (extent.raw_ptr + (rva - extent.rva)) as usize;
            let end = start + size as usize;
            if binary.len() < end {
                return Err(LoadError::Invalid("directory extends past end of file"));
            }

            return Ok(&binary[start..end]);
        }
    }

    Err(LoadError::Invalid("directory is not in any section"))
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, LoadError> {
    if data.len() < offset + 2 {
        return Err(LoadError::Invalid("truncated PE headers"));
    }

    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&data[offset..offset + 2]);
    Ok(u16::from_le_bytes(bytes))
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, LoadError> {
    if data.len() < offset + 4 {
        return Err(LoadError::Invalid("truncated PE headers"));
    }

    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64, LoadError> {
    if data.len() < offset + 8 {
        return Err(LoadError::Invalid("truncated PE headers"));
    }

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    Ok(u64::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::{rebase, LoadedImage};
    use alloc::vec;

    struct SectionSpec {
        virtual_size: u32,
        rva: u32,
        raw_size: u32,
        raw_ptr: u32,
        characteristics: u32,
    }

    // Builds a PE image with the given optional header
    // magic, sections, and raw contents.
    //
    fn build_pe(
        magic: u16,
        machine: u16,
        characteristics: u16,
        image_base: u64,
        entry_rva: u32,
        size_of_image: u32,
        reloc_dir: (u32, u32),
        import_dir: (u32, u32),
        sections: &[SectionSpec],
        contents: &[(usize, Vec<u8>)],
    ) -> Vec<u8> {
        let lfanew = 0x40usize;
        let optional_size: usize = if magic == PE32_PLUS_MAGIC {
            112 + 16 * 8
        } else {
            96 + 16 * 8
        };

        let mut pe = vec![0u8; lfanew];
        pe[0] = b'M';
        pe[1] = b'Z';
        pe[0x3c..0x40].copy_from_slice(&(lfanew as u32).to_le_bytes());

        // PE signature and COFF header.
        pe.extend_from_slice(b"PE\0\0");
        pe.extend_from_slice(&machine.to_le_bytes());
        pe.extend_from_slice(&(sections.len() as u16).to_le_bytes());
        pe.extend_from_slice(&[0u8; 12]); // timestamp, symbols
        pe.extend_from_slice(&(optional_size as u16).to_le_bytes());
        pe.extend_from_slice(&characteristics.to_le_bytes());

        // Optional header.
        let opt_start = pe.len();
        pe.extend_from_slice(&magic.to_le_bytes());
        pe.resize(opt_start + 16, 0);
        pe.extend_from_slice(&entry_rva.to_le_bytes());
        if magic == PE32_PLUS_MAGIC {
            pe.resize(opt_start + 24, 0);
            pe.extend_from_slice(&image_base.to_le_bytes());
        } else {
            pe.resize(opt_start + 28, 0);
            pe.extend_from_slice(&(image_base as u32).to_le_bytes());
        }
        pe.extend_from_slice(&0x1000u32.to_le_bytes()); // section alignment
        pe.extend_from_slice(&0x200u32.to_le_bytes()); // file alignment
        pe.resize(opt_start + 56, 0);
        pe.extend_from_slice(&size_of_image.to_le_bytes());
        pe.extend_from_slice(&0x200u32.to_le_bytes()); // size of headers

        let dirs_at = if magic == PE32_PLUS_MAGIC {
            pe.resize(opt_start + 108, 0);
            pe.extend_from_slice(&16u32.to_le_bytes());
            opt_start + 112
        } else {
            pe.resize(opt_start + 92, 0);
            pe.extend_from_slice(&16u32.to_le_bytes());
            opt_start + 96
        };
        pe.resize(dirs_at + 16 * 8, 0);
        pe[dirs_at + DIRECTORY_IMPORT * 8..dirs_at + DIRECTORY_IMPORT * 8 + 4]
            .copy_from_slice(&import_dir.0.to_le_bytes());
        pe[dirs_at + DIRECTORY_IMPORT * 8 + 4..dirs_at + DIRECTORY_IMPORT * 8 + 8]
            .copy_from_slice(&import_dir.1.to_le_bytes());
        pe[dirs_at + DIRECTORY_BASE_RELOC * 8..dirs_at + DIRECTORY_BASE_RELOC * 8 + 4]
            .copy_from_slice(&reloc_dir.0.to_le_bytes());
        pe[dirs_at + DIRECTORY_BASE_RELOC * 8 + 4..dirs_at + DIRECTORY_BASE_RELOC * 8 + 8]
            .copy_from_slice(&reloc_dir.1.to_le_bytes());

        // Section table.
        for section in sections {
            let at = pe.len();
            pe.resize(at + 40, 0);
            pe[at + 8..at + 12].copy_from_slice(&section.virtual_size.to_le_bytes());
            pe[at + 12..at + 16].copy_from_slice(&section.rva.to_le_bytes());
            pe[at + 16..at + 20].copy_from_slice(&section.raw_size.to_le_bytes());
            pe[at + 20..at + 24].copy_from_slice(&section.raw_ptr.to_le_bytes());
            pe[at + 36..at + 40].copy_from_slice(&section.characteristics.to_le_bytes());
        }

        // Raw section contents.
        for (at, bytes) in contents {
            if pe.len() < at + bytes.len() {
                pe.resize(at + bytes.len(), 0);
            }
            pe[*at..at + bytes.len()].copy_from_slice(bytes);
        }

        pe
    }

    const TEXT: u32 = 0x6000_0020; // code | execute | read
    const DATA: u32 = 0xc000_0040; // initialised data | read | write

    // A PE32+ executable at base 0x1_4000_0000 with a DIR64
    // relocation covering an absolute pointer in .data.
    //
    fn pe64_with_reloc() -> Vec<u8> {
        // .data holds a pointer at rva 0x2000 and the
        // relocation table at rva 0x2010.
        let mut data = vec![0u8; 0x20];
        data[..8].copy_from_slice(&0x1_4000_1234u64.to_le_bytes());
        data[0x10..0x14].copy_from_slice(&0x2000u32.to_le_bytes()); // block page rva
        data[0x14..0x18].copy_from_slice(&12u32.to_le_bytes()); // block size
        let dir64: u16 = (IMAGE_REL_BASED_DIR64 << 12) | 0x000;
        data[0x18..0x1a].copy_from_slice(&dir64.to_le_bytes());
        // The final entry is ABSOLUTE padding.
        data.resize(0x200, 0);

        build_pe(
            PE32_PLUS_MAGIC,
            IMAGE_FILE_MACHINE_AMD64,
            0x0022, // executable image
            0x1_4000_0000,
            0x1000,
            0x3000,
            (0x2010, 12),
            (0, 0),
            &[
                SectionSpec {
                    virtual_size: 0x1000,
                    rva: 0x1000,
                    raw_size: 0x200,
                    raw_ptr: 0x200,
                    characteristics: TEXT,
                },
                SectionSpec {
                    virtual_size: 0x1000,
                    rva: 0x2000,
                    raw_size: 0x200,
                    raw_ptr: 0x400,
                    characteristics: DATA,
                },
            ],
            &[(0x200, vec![0x90u8; 0x200]), (0x400, data)],
        )
    }

    #[test]
    fn test_parse_pe64() {
        let bytes = pe64_with_reloc();
        let image = parse_pe(&bytes).unwrap();

        assert_eq!(image.image_base, VirtAddr::new(0x1_4000_0000));
        assert_eq!(image.entry_point, VirtAddr::new(0x1_4000_1000));
        assert_eq!(image.image_size, 0x3000);
        assert!(!image.is_library);
        assert_eq!(image.segments.len(), 2);

        let text = &image.segments[0];
        assert_eq!(text.start, VirtAddr::new(0x1_4000_1000));
        assert_eq!(text.end, VirtAddr::new(0x1_4000_2000));
        assert!(text.flags.executable());
        assert!(!text.flags.writable());

        let data = &image.segments[1];
        assert!(!data.flags.executable());
        assert!(data.flags.writable());

        assert_eq!(
            image.relocations,
            vec![Relocation {
                addr: 0x1_4000_2000,
                kind: RelocationKind::Dir64,
            }]
        );
        assert_eq!(image.skipped_relocations, 0);
    }

    #[test]
    fn test_rebase_and_load_applies_dir64() {
        use crate::tests::{user_space, TestMemory};

        let bytes = pe64_with_reloc();
        let mut image = parse_pe(&bytes).unwrap();

        // Load at 0x1_8000_0000 instead of the preferred
        // 0x1_4000_0000.
        rebase(&mut image, VirtAddr::new(0x1_8000_0000)).unwrap();

        let mem = TestMemory::new(512);
        let mut alloc = mem.allocator();
        let (_kernel, mut space) = user_space(&mut alloc);
        let loaded = unsafe { crate::load(&image, &mut space, &mut alloc) }.unwrap();

        assert_eq!(
            loaded,
            LoadedImage {
                entry_point: VirtAddr::new(0x1_8000_1000),
                image_base: VirtAddr::new(0x1_8000_0000),
                image_size: 0x3000,
                is_library: false,
            }
        );

        // Each DIR64 target was incremented by the base
        // delta.
        let phys = space.translate(VirtAddr::new(0x1_8000_2000)).unwrap();
        let value = unsafe { *(phys.as_usize() as *const u64) };
        assert_eq!(value, 0x1_8000_1234);
    }

    #[test]
    fn test_parse_pe32_highlow() {
        // A PE32 image with a HIGHLOW relocation.
        let mut data = vec![0u8; 0x20];
        data[..4].copy_from_slice(&0x0040_2040u32.to_le_bytes());
        data[0x10..0x14].copy_from_slice(&0x2000u32.to_le_bytes());
        data[0x14..0x18].copy_from_slice(&10u32.to_le_bytes());
        let highlow: u16 = (IMAGE_REL_BASED_HIGHLOW << 12) | 0x000;
        data[0x18..0x1a].copy_from_slice(&highlow.to_le_bytes());
        data.resize(0x200, 0);

        let bytes = build_pe(
            PE32_MAGIC,
            IMAGE_FILE_MACHINE_I386,
            0x0102,
            0x40_0000,
            0x1000,
            0x3000,
            (0x2010, 10),
            (0, 0),
            &[
                SectionSpec {
                    virtual_size: 0x1000,
                    rva: 0x1000,
                    raw_size: 0x200,
                    raw_ptr: 0x200,
                    characteristics: TEXT,
                },
                SectionSpec {
                    virtual_size: 0x1000,
                    rva: 0x2000,
                    raw_size: 0x200,
                    raw_ptr: 0x400,
                    characteristics: DATA,
                },
            ],
            &[(0x400, data)],
        );

        let image = parse_pe(&bytes).unwrap();
        assert_eq!(image.image_base, VirtAddr::new(0x40_0000));
        assert_eq!(
            image.relocations,
            vec![Relocation {
                addr: 0x40_2000,
                kind: RelocationKind::HighLow,
            }]
        );
    }

    #[test]
    fn test_dll_is_library_with_imports() {
        // One import descriptor, then an all-zero
        // terminator.
        let mut data = vec![0u8; 0x200];
        for b in data[..20].iter_mut() {
            *b = 1;
        }

        let bytes = build_pe(
            PE32_PLUS_MAGIC,
            IMAGE_FILE_MACHINE_AMD64,
            0x2022, // executable image | DLL
            0x1_4000_0000,
            0x1000,
            0x3000,
            (0, 0),
            (0x2000, 40),
            &[
                SectionSpec {
                    virtual_size: 0x1000,
                    rva: 0x1000,
                    raw_size: 0x200,
                    raw_ptr: 0x200,
                    characteristics: TEXT,
                },
                SectionSpec {
                    virtual_size: 0x1000,
                    rva: 0x2000,
                    raw_size: 0x200,
                    raw_ptr: 0x400,
                    characteristics: DATA,
                },
            ],
            &[(0x400, data)],
        );

        let image = parse_pe(&bytes).unwrap();
        assert!(image.is_library);
        assert_eq!(image.unbound_imports, 1);
    }

    #[test]
    fn test_validation_rejects() {
        // Missing DOS magic.
        assert_eq!(
            parse_pe(b"ZM oops").unwrap_err(),
            LoadError::Invalid("missing DOS magic")
        );

        // Missing PE signature.
        let mut bytes = pe64_with_reloc();
        bytes[0x41] = b'L';
        assert_eq!(
            parse_pe(&bytes).unwrap_err(),
            LoadError::Invalid("missing PE signature")
        );

        // Unsupported machine.
        let mut bytes = pe64_with_reloc();
        bytes[0x44] = 0xc0; // ARM64
        bytes[0x45] = 0xaa;
        assert_eq!(
            parse_pe(&bytes).unwrap_err(),
            LoadError::Invalid("unsupported machine type")
        );

        // Unknown optional header magic.
        let mut bytes = pe64_with_reloc();
        bytes[0x58] = 0x07;
        assert_eq!(
            parse_pe(&bytes).unwrap_err(),
            LoadError::Invalid("unrecognised optional header magic")
        );

        // Truncated headers.
        let bytes = pe64_with_reloc();
        assert!(parse_pe(&bytes[..0x50]).is_err());
    }
}
