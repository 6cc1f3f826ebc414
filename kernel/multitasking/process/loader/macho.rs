// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides functionality to parse and validate Mach-O binaries.
//!
//! Both 32-bit and 64-bit Mach-O files are accepted, in either
//! byte order: the CIGAM magics indicate a file written in the
//! opposite byte order, and every header field is read through
//! one byte-order-aware reader so the same code path handles
//! native and swapped inputs. Fat (multi-architecture) files are
//! rejected as unsupported.
//!
//! Dynamic symbol binding belongs to a dynamic linker; this
//! loader lays out `LC_SEGMENT`/`LC_SEGMENT_64` segments and
//! takes the entry point from `LC_MAIN` when present.

use crate::{Image, LoadError, Segment};
use alloc::vec::Vec;
use memory::constants::USERSPACE;
use memory::{PageTableFlags, VirtAddr, VirtAddrRange, PAGE_SIZE};

// Magic numbers, as read in little-endian order.
//
const MH_MAGIC: u32 = 0xfeed_face;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const MH_CIGAM: u32 = 0xcefa_edfe;
const MH_CIGAM_64: u32 = 0xcffa_edfe;
const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_CIGAM: u32 = 0xbeba_feca;

// File types.
//
const MH_EXECUTE: u32 = 2;
const MH_DYLIB: u32 = 6;

// CPU types.
//
const CPU_TYPE_X86: u32 = 7;
const CPU_TYPE_X86_64: u32 = 0x0100_0007;

// Load commands.
//
const LC_SEGMENT: u32 = 0x1;
const LC_SEGMENT_64: u32 = 0x19;
const LC_MAIN: u32 = 0x8000_0028;

// Segment protection bits.
//
const VM_PROT_WRITE: u32 = 0x2;
const VM_PROT_EXECUTE: u32 = 0x4;

/// Determines whether the given binary is likely a Mach-O
/// binary (including a fat binary, which will then be
/// rejected as unsupported).
///
pub fn is_macho(content: &[u8]) -> bool {
    if content.len() < 4 {
        return false;
    }

    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&content[..4]);
    matches!(
        u32::from_le_bytes(bytes),
        MH_MAGIC | MH_MAGIC_64 | MH_CIGAM | MH_CIGAM_64 | FAT_MAGIC | FAT_CIGAM
    )
}

// A byte-order-aware reader. All header fields go through
// this, so a swapped file takes exactly the same code path
// as a native one.
//
struct Reader<'data> {
    data: &'data [u8],
    swap: bool,
}

impl<'data> Reader<'data> {
    fn u32_at(&self, offset: usize) -> Result<u32, LoadError> {
        if self.data.len() < offset + 4 {
            return Err(LoadError::Invalid("truncated Mach-O headers"));
        }

        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[offset..offset + 4]);
        let value = u32::from_le_bytes(bytes);

        Ok(if self.swap { value.swap_bytes() } else { value })
    }

    fn u64_at(&self, offset: usize) -> Result<u64, LoadError> {
        if self.data.len() < offset + 8 {
            return Err(LoadError::Invalid("truncated Mach-O headers"));
        }

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[offset..offset + 8]);
        let value = u64::from_le_bytes(bytes);

        Ok(if self.swap { value.swap_bytes() } else { value })
    }
}

// One parsed load segment, before validation.
//
struct RawSegment {
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    initprot: u32,
}

/// Parse a Mach-O binary, validating its structure.
///
pub fn parse_macho(binary: &[u8]) -> Result<Image, LoadError> {
    if binary.len() < 4 {
        return Err(LoadError::Invalid("truncated Mach-O headers"));
    }

    let mut magic_bytes = [0u8; 4];
    magic_bytes.copy_from_slice(&binary[..4]);
    let magic = u32::from_le_bytes(magic_bytes);

    let (is_64bit, swap) = match magic {
        MH_MAGIC => (false, false),
        MH_MAGIC_64 => (true, false),
        MH_CIGAM => (false, true),
        MH_CIGAM_64 => (true, true),
        FAT_MAGIC | FAT_CIGAM => {
            return Err(LoadError::NotSupported("fat binaries are not supported"))
        }
        _ => return Err(LoadError::Invalid("bad Mach-O magic")),
    };

    let reader = Reader { data: binary, swap };

    let cputype = reader.u32_at(4)?;
    match cputype {
        CPU_TYPE_X86 | CPU_TYPE_X86_64 => {}
        _ => return Err(LoadError::Invalid("unsupported instruction set architecture")),
    }

    let filetype = reader.u32_at(12)?;
    let is_library = match filetype {
        MH_EXECUTE => false,
        MH_DYLIB => true,
        _ => return Err(LoadError::NotSupported("unsupported Mach-O file type")),
    };

    let ncmds = reader.u32_at(16)? as usize;
    let sizeofcmds = reader.u32_at(20)? as usize;
    let header_size = if is_64bit { 32 } else { 28 };
    if binary.len() < header_size + sizeofcmds {
        return Err(LoadError::Invalid("truncated load commands"));
    }

    // Walk the load commands, collecting segments and the
    // entry point.
    let mut raw_segments: Vec<RawSegment> = Vec::new();
    let mut entry_offset: Option<u64> = None;
    let mut at = header_size;
    for _ in 0..ncmds {
        let cmd = reader.u32_at(at)?;
        let cmdsize = reader.u32_at(at + 4)? as usize;
        if cmdsize < 8 || at + cmdsize > header_size + sizeofcmds {
            return Err(LoadError::Invalid("malformed load command"));
        }

        match cmd {
            LC_SEGMENT if !is_64bit => {
                if cmdsize < 56 {
                    return Err(LoadError::Invalid("malformed segment command"));
                }

                // Fields follow the 16-byte segment name.
                raw_segments.push(RawSegment {
                    vmaddr: reader.u32_at(at + 24)? as u64,
                    vmsize: reader.u32_at(at + 28)? as u64,
                    fileoff: reader.u32_at(at + 32)? as u64,
                    filesize: reader.u32_at(at + 36)? as u64,
                    initprot: reader.u32_at(at + 44)?,
                });
            }
            LC_SEGMENT_64 if is_64bit => {
                if cmdsize < 72 {
                    return Err(LoadError::Invalid("malformed segment command"));
                }

                raw_segments.push(RawSegment {
                    vmaddr: reader.u64_at(at + 24)?,
                    vmsize: reader.u64_at(at + 32)?,
                    fileoff: reader.u64_at(at + 40)?,
                    filesize: reader.u64_at(at + 48)?,
                    initprot: reader.u32_at(at + 60)?,
                });
            }
            LC_MAIN => {
                if cmdsize < 24 {
                    return Err(LoadError::Invalid("malformed entry point command"));
                }

                entry_offset = Some(reader.u64_at(at + 8)?);
            }
            _ => {} // Symbol tables, dyld info, and the rest.
        }

        at += cmdsize;
    }

    // Keep the segments that actually occupy memory.
    // __PAGEZERO has no protection and is only there to
    // reserve the null region.
    let mut segments = Vec::new();
    let mut regions: Vec<VirtAddrRange> = Vec::new();
    let mut min_vmaddr = u64::MAX;
    let mut max_end = 0u64;
    for raw in raw_segments.iter() {
        if raw.vmsize == 0 || raw.initprot == 0 {
            continue;
        }
        if raw.filesize > raw.vmsize {
            return Err(LoadError::Invalid(
                "segment is larger on disk than in memory",
            ));
        }

        let file_end = raw
            .fileoff
            .checked_add(raw.filesize)
            .ok_or(LoadError::Invalid("segment file range overflows"))?;
        if file_end > binary.len() as u64 {
            return Err(LoadError::Invalid("segment data extends past end of file"));
        }

        let start = VirtAddr::try_new(raw.vmaddr as usize)
            .map_err(|_| LoadError::Invalid("segment address is not canonical"))?;
        let end_addr = raw
            .vmaddr
            .checked_add(raw.vmsize)
            .ok_or(LoadError::Invalid("segment size overflows"))?;
        let end = VirtAddr::try_new(end_addr as usize)
            .map_err(|_| LoadError::Invalid("segment size overflows"))?;

        let range = VirtAddrRange::new(start, end - 1);
        for other in regions.iter() {
            if range.overlaps_with(other) {
                return Err(LoadError::Invalid("segments overlap"));
            }
        }
        if !USERSPACE.contains(&range) {
            return Err(LoadError::Invalid("segment is outside userspace"));
        }

        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if raw.initprot & VM_PROT_EXECUTE == 0 {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        if raw.initprot & VM_PROT_WRITE != 0 {
            flags |= PageTableFlags::WRITABLE;
        }

        regions.push(range);
        segments.push(Segment {
            start,
            end,
            data: &binary[raw.fileoff as usize..file_end as usize],
            flags,
        });

        min_vmaddr = min_vmaddr.min(raw.vmaddr);
        max_end = max_end.max(end_addr);
    }

    if segments.is_empty() {
        return Err(LoadError::Invalid("no loadable segments"));
    }

    let link_base = min_vmaddr & !(PAGE_SIZE as u64 - 1);
    let image_base = VirtAddr::new(link_base as usize);

    // The entry point comes from LC_MAIN; without one, the
    // binary has no usable entry and the caller decides
    // whether that matters.
    let entry_point = match entry_offset {
        Some(offset) => image_base
            .checked_add(offset as usize)
            .ok_or(LoadError::Invalid("entry point overflows"))?,
        None => VirtAddr::zero(),
    };

    Ok(Image {
        entry_point,
        image_base,
        link_base,
        image_size: (max_end - link_base) as usize,
        is_library,
        segments,
        relocations: Vec::new(),
        skipped_relocations: 0,
        unbound_imports: 0,
    })
}
