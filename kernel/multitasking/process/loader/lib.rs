// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides functionality to parse, validate, and load executable
//! binaries.
//!
//! The three front ends, [`elf`], [`pe`], and [`macho`],
//! validate their formats and parse them into one common
//! [`Image`]: the entry point, the image's base and size, its
//! loadable [`Segment`]s, and the [`Relocation`]s to apply. The
//! format is sniffed from the leading magic by [`Image::parse`].
//!
//! The shared back end, [`load`], places an image into a target
//! address space: every page of the image's range is backed by a
//! zeroed frame mapped read-write, segment bytes are copied in
//! (bytes past a segment's file data stay zero), relocations are
//! applied, and finally each segment's pages are tightened to the
//! protection the segment declared. [`rebase`] moves a parsed
//! image to a different base address before loading, updating its
//! entry point and segment addresses.
//!
//! Dynamic symbol resolution is out of scope: relocation types
//! that need a symbol lookup are counted on the image and
//! skipped, and import tables are parsed but never bound.

#![no_std]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]

extern crate alloc;

pub mod elf;
pub mod macho;
pub mod pe;

use alloc::vec::Vec;
use core::fmt;
use memory::{
    FrameAllocator, FrameDeallocator, PageTableFlags, VirtAddr, VirtAddrRange, VirtPage,
    PAGE_SIZE,
};
use syscalls::Error;
use virtmem::{AddressSpace, RegionKind};

/// Describes why a binary was rejected.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoadError {
    /// The binary is malformed or violates a validation
    /// rule.
    Invalid(&'static str),

    /// The binary is recognised but uses a feature this
    /// kernel does not support, such as a fat Mach-O.
    NotSupported(&'static str),
}

impl LoadError {
    /// Maps the rejection onto the kernel's error taxonomy.
    ///
    pub fn as_error(&self) -> Error {
        match self {
            LoadError::Invalid(_) => Error::Invalid,
            LoadError::NotSupported(_) => Error::NotSupported,
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LoadError::Invalid(why) => write!(f, "invalid binary: {}", why),
            LoadError::NotSupported(why) => write!(f, "unsupported binary: {}", why),
        }
    }
}

/// An area of memory described by a loadable segment.
///
/// `start` and `end` delimit the segment's memory range;
/// `data` holds its on-disk bytes, which may be shorter than
/// the range. The bytes between `data.len()` and the range's
/// size are zero-filled (BSS).
///
#[derive(Debug, PartialEq)]
pub struct Segment<'data> {
    /// The first address of the segment.
    pub start: VirtAddr,

    /// The first address after the segment.
    pub end: VirtAddr,

    /// The segment's on-disk bytes.
    pub data: &'data [u8],

    /// The protection the segment's pages carry once
    /// loading completes.
    pub flags: PageTableFlags,
}

impl<'data> Segment<'data> {
    /// Returns the segment's size in memory.
    ///
    pub fn mem_size(&self) -> usize {
        self.end - self.start
    }
}

/// A relocation recorded by a front end.
///
/// `addr` is the link-time address of the relocation target;
/// the address actually patched is `addr` plus the image's
/// displacement from its link base.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Relocation {
    /// The link-time address of the target.
    pub addr: u64,

    /// How the target is patched.
    pub kind: RelocationKind,
}

/// The supported relocation kinds.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RelocationKind {
    /// Store `base + addend` as a 64-bit value, where
    /// `base` is the image's displacement from its link
    /// base.
    Relative {
        /// The link-time value to displace.
        addend: u64,
    },

    /// Add the image's displacement to the 64-bit value at
    /// the target.
    Dir64,

    /// Add the low 32 bits of the image's displacement to
    /// the 32-bit value at the target.
    HighLow,
}

/// The parsed form of an executable binary.
///
#[derive(Debug, PartialEq)]
pub struct Image<'data> {
    /// The virtual address at which execution starts.
    pub entry_point: VirtAddr,

    /// The current base address of the image: the first
    /// address of its lowest segment.
    pub image_base: VirtAddr,

    /// The base address the binary was linked at. The
    /// difference between `image_base` and `link_base` is
    /// the displacement relocations apply.
    pub link_base: u64,

    /// The image's size in memory, from `image_base` to the
    /// end of its highest segment.
    pub image_size: usize,

    /// Whether the binary is a library rather than a
    /// standalone executable.
    pub is_library: bool,

    /// The loadable segments, with their final protections.
    pub segments: Vec<Segment<'data>>,

    /// The relocations to apply after segment bytes are
    /// copied in.
    pub relocations: Vec<Relocation>,

    /// The number of relocations that needed a symbol
    /// resolver and were skipped.
    pub skipped_relocations: usize,

    /// The number of import table entries parsed but left
    /// unbound.
    pub unbound_imports: usize,
}

impl<'data> Image<'data> {
    /// Parses the executable binary in `content`, sniffing
    /// its format from the leading magic.
    ///
    pub fn parse(content: &'data [u8]) -> Result<Image<'data>, LoadError> {
        if elf::is_elf(content) {
            return elf::parse_elf(content);
        }
        if pe::is_pe(content) {
            return pe::parse_pe(content);
        }
        if macho::is_macho(content) {
            return macho::parse_macho(content);
        }

        Err(LoadError::Invalid("unrecognised binary format"))
    }

    /// Returns the image's displacement from its link base.
    ///
    pub fn displacement(&self) -> u64 {
        (self.image_base.as_usize() as u64).wrapping_sub(self.link_base)
    }
}

/// The result of loading an image into an address space.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LoadedImage {
    /// The virtual address at which execution starts.
    pub entry_point: VirtAddr,

    /// The base address the image was placed at.
    pub image_base: VirtAddr,

    /// The image's size in memory.
    pub image_size: usize,

    /// Whether the binary is a library.
    pub is_library: bool,
}

/// Moves a parsed image to a new base address.
///
/// Segment addresses and the entry point shift by the move;
/// the recorded relocations pick up the displacement when the
/// image is loaded. Fails with [`LoadError::Invalid`] if any
/// shifted address leaves the canonical address space.
///
pub fn rebase(image: &mut Image, new_base: VirtAddr) -> Result<(), LoadError> {
    let old_base = image.image_base.as_usize();
    let new = new_base.as_usize();

    let shift = |addr: VirtAddr| -> Result<VirtAddr, LoadError> {
        let moved = (addr.as_usize() - old_base)
            .checked_add(new)
            .ok_or(LoadError::Invalid("rebase moves image out of range"))?;
        VirtAddr::try_new(moved)
            .map_err(|_| LoadError::Invalid("rebase moves image out of range"))
    };

    let entry_point = shift(image.entry_point)?;
    let mut moved = Vec::with_capacity(image.segments.len());
    for segment in image.segments.iter() {
        moved.push((shift(segment.start)?, shift(segment.end)?));
    }

    for (segment, (start, end)) in image.segments.iter_mut().zip(moved) {
        segment.start = start;
        segment.end = end;
    }

    image.entry_point = entry_point;
    image.image_base = new_base;
    Ok(())
}

/// Loads a parsed image into the target address space.
///
/// Every page in the image's range is backed by a zeroed frame
/// and mapped read-write for the copy; segment bytes are copied
/// in, relocations applied, and each segment's pages are then
/// re-protected with the segment's declared flags. The segments
/// are recorded as code and data regions of the address space.
///
/// # Safety
///
/// The caller must ensure that frames returned by `allocator`
/// can be dereferenced at the address space's physical memory
/// offset.
///
pub unsafe fn load<A>(
    image: &Image,
    space: &mut AddressSpace,
    allocator: &mut A,
) -> Result<LoadedImage, Error>
where
    A: FrameAllocator + FrameDeallocator + ?Sized,
{
    if image.segments.is_empty() {
        return Err(Error::Invalid);
    }

    // Back the image's whole range with zeroed, writable
    // pages.
    let first = VirtPage::containing_address(image.image_base);
    let last = VirtPage::containing_address(image.image_base + (image.image_size - 1));
    let pages = VirtPage::range_inclusive(first, last);
    let initial = PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    space.allocate_and_map(pages, initial, allocator)?;

    // Copy each segment's file bytes. Memory past the file
    // data, up to the segment's end, stays zero.
    for segment in image.segments.iter() {
        write_virt(space, segment.start, segment.data)?;
    }

    // Apply the recorded relocations.
    let displacement = image.displacement();
    for relocation in image.relocations.iter() {
        let target = VirtAddr::try_new(relocation.addr.wrapping_add(displacement) as usize)
            .map_err(|_| Error::Invalid)?;

        match relocation.kind {
            RelocationKind::Relative { addend } => {
                let value = addend.wrapping_add(displacement);
                write_virt(space, target, &value.to_le_bytes())?;
            }
            RelocationKind::Dir64 => {
                let mut bytes = [0u8; 8];
                read_virt(space, target, &mut bytes)?;
                let value = u64::from_le_bytes(bytes).wrapping_add(displacement);
                write_virt(space, target, &value.to_le_bytes())?;
            }
            RelocationKind::HighLow => {
                let mut bytes = [0u8; 4];
                read_virt(space, target, &mut bytes)?;
                let value = u32::from_le_bytes(bytes).wrapping_add(displacement as u32);
                write_virt(space, target, &value.to_le_bytes())?;
            }
        }
    }

    // Tighten each segment's pages to its declared
    // protection, and record the segment as a region.
    for segment in image.segments.iter() {
        space.protect(
            segment.start.align_down(PAGE_SIZE),
            segment.mem_size() + segment.start.page_offset(),
            segment.flags,
        )?;

        let kind = if segment.flags.executable() {
            RegionKind::Code
        } else {
            RegionKind::Data
        };
        let range = VirtAddrRange::new(segment.start, segment.end - 1);
        space.add_region(range, kind, segment.flags)?;
    }

    Ok(LoadedImage {
        entry_point: image.entry_point,
        image_base: image.image_base,
        image_size: image.image_size,
        is_library: image.is_library,
    })
}

// Copies bytes into an address space through its physical
// frames, one page at a time.
//
unsafe fn write_virt(space: &AddressSpace, addr: VirtAddr, data: &[u8]) -> Result<(), Error> {
    let offset = space.physmem_offset();
    let mut done = 0;
    while done < data.len() {
        let addr = addr + done;
        let phys = space.translate(addr).ok_or(Error::NotFound)?;
        let virt = offset
            .checked_add(phys.as_usize())
            .ok_or(Error::Invalid)?;

        let chunk = (PAGE_SIZE - addr.page_offset()).min(data.len() - done);
        core::ptr::copy_nonoverlapping(
            data[done..done + chunk].as_ptr(),
            virt.as_mut_ptr::<u8>(),
            chunk,
        );

        done += chunk;
    }

    Ok(())
}

// Reads bytes out of an address space through its physical
// frames, one page at a time.
//
unsafe fn read_virt(space: &AddressSpace, addr: VirtAddr, data: &mut [u8]) -> Result<(), Error> {
    let offset = space.physmem_offset();
    let mut done = 0;
    while done < data.len() {
        let addr = addr + done;
        let phys = space.translate(addr).ok_or(Error::NotFound)?;
        let virt = offset
            .checked_add(phys.as_usize())
            .ok_or(Error::Invalid)?;

        let chunk = (PAGE_SIZE - addr.page_offset()).min(data.len() - done);
        core::ptr::copy_nonoverlapping(
            virt.as_mut_ptr::<u8>() as *const u8,
            data[done..done + chunk].as_mut_ptr(),
            chunk,
        );

        done += chunk;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use alloc::vec;
    use memory::PhysAddr;
    use physmem::BitmapFrameAllocator;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    pub(crate) struct TestMemory {
        ptr: *mut u8,
        layout: Layout,
    }

    impl TestMemory {
        pub(crate) fn new(frames: usize) -> TestMemory {
            let layout = Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());

            TestMemory { ptr, layout }
        }

        pub(crate) fn allocator(&self) -> BitmapFrameAllocator {
            BitmapFrameAllocator::new(PhysAddr::new(self.ptr as usize), self.layout.size())
                .unwrap()
        }
    }

    impl Drop for TestMemory {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    pub(crate) fn user_space(
        alloc: &mut BitmapFrameAllocator,
    ) -> (AddressSpace, AddressSpace) {
        let kernel = unsafe { AddressSpace::new_kernel(alloc, VirtAddr::zero()) }.unwrap();
        let user = unsafe { AddressSpace::new_user(&kernel, alloc) }.unwrap();
        (kernel, user)
    }

    pub(crate) fn read_user_byte(space: &AddressSpace, addr: usize) -> u8 {
        let phys = space.translate(VirtAddr::new(addr)).expect("mapped");
        unsafe { *(phys.as_usize() as *const u8) }
    }

    fn leaf_flags(space: &AddressSpace, addr: usize) -> PageTableFlags {
        let table =
            unsafe { memory::PageTable::at_offset(space.page_table().start_address(), VirtAddr::zero()) };
        match table.translate(VirtAddr::new(addr)) {
            memory::PageMapping::Mapping { flags, .. } => flags,
            other => panic!("address not mapped: {:?}", other),
        }
    }

    #[test]
    fn test_load_copies_zeroes_and_protects() {
        let mem = TestMemory::new(512);
        let mut alloc = mem.allocator();
        let (_kernel, mut space) = user_space(&mut alloc);

        // One read-execute segment with 0x1000 bytes of file
        // data and 0x2000 bytes of memory, plus a writable
        // data segment right after.
        let text: Vec<u8> = (0..0x1000).map(|i| (i % 251) as u8).collect();
        let data = vec![0x5au8; 0x80];
        let image = Image {
            entry_point: VirtAddr::new(0x40_0000),
            image_base: VirtAddr::new(0x40_0000),
            link_base: 0x40_0000,
            image_size: 0x3000,
            is_library: false,
            segments: vec![
                Segment {
                    start: VirtAddr::new(0x40_0000),
                    end: VirtAddr::new(0x40_2000),
                    data: &text,
                    flags: PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE,
                },
                Segment {
                    start: VirtAddr::new(0x40_2000),
                    end: VirtAddr::new(0x40_3000),
                    data: &data,
                    flags: PageTableFlags::PRESENT
                        | PageTableFlags::USER_ACCESSIBLE
                        | PageTableFlags::WRITABLE
                        | PageTableFlags::NO_EXECUTE,
                },
            ],
            relocations: Vec::new(),
            skipped_relocations: 0,
            unbound_imports: 0,
        };

        let loaded = unsafe { load(&image, &mut space, &mut alloc) }.unwrap();
        assert_eq!(loaded.entry_point, VirtAddr::new(0x40_0000));
        assert_eq!(loaded.image_size, 0x3000);

        // File bytes are in place.
        assert_eq!(read_user_byte(&space, 0x40_0000), 0);
        assert_eq!(read_user_byte(&space, 0x40_0001), 1);
        assert_eq!(read_user_byte(&space, 0x40_0fff), (0xfff % 251) as u8);

        // The BSS page is zero.
        for probe in [0x40_1000usize, 0x40_1234, 0x40_1fff].iter() {
            assert_eq!(read_user_byte(&space, *probe), 0);
        }

        // The data segment's bytes follow.
        assert_eq!(read_user_byte(&space, 0x40_2000), 0x5a);
        assert_eq!(read_user_byte(&space, 0x40_207f), 0x5a);
        assert_eq!(read_user_byte(&space, 0x40_2080), 0);

        // Permissions: text is read-execute, data is
        // read-write no-execute, both user-accessible.
        let text_flags = leaf_flags(&space, 0x40_1000);
        assert!(text_flags.executable());
        assert!(!text_flags.writable());
        assert!(text_flags.user());

        let data_flags = leaf_flags(&space, 0x40_2000);
        assert!(!data_flags.executable());
        assert!(data_flags.writable());

        // The segments were recorded as regions.
        assert_eq!(
            space
                .region_containing(VirtAddr::new(0x40_0123))
                .unwrap()
                .kind(),
            RegionKind::Code
        );
        assert_eq!(
            space
                .region_containing(VirtAddr::new(0x40_2123))
                .unwrap()
                .kind(),
            RegionKind::Data
        );
    }

    #[test]
    fn test_rebase_applies_dir64() {
        let mem = TestMemory::new(512);
        let mut alloc = mem.allocator();
        let (_kernel, mut space) = user_space(&mut alloc);

        // A segment containing one absolute pointer at
        // offset 0x100, pointing at link-time address
        // 0x1_4000_0220.
        let mut data = vec![0u8; 0x400];
        data[0x100..0x108].copy_from_slice(&0x1_4000_0220u64.to_le_bytes());

        let mut image = Image {
            entry_point: VirtAddr::new(0x1_4000_0050),
            image_base: VirtAddr::new(0x1_4000_0000),
            link_base: 0x1_4000_0000,
            image_size: 0x1000,
            is_library: false,
            segments: vec![Segment {
                start: VirtAddr::new(0x1_4000_0000),
                end: VirtAddr::new(0x1_4000_1000),
                data: &data,
                flags: PageTableFlags::PRESENT
                    | PageTableFlags::USER_ACCESSIBLE
                    | PageTableFlags::WRITABLE
                    | PageTableFlags::NO_EXECUTE,
            }],
            relocations: vec![Relocation {
                addr: 0x1_4000_0100,
                kind: RelocationKind::Dir64,
            }],
            skipped_relocations: 0,
            unbound_imports: 0,
        };

        rebase(&mut image, VirtAddr::new(0x1_8000_0000)).unwrap();
        assert_eq!(image.entry_point, VirtAddr::new(0x1_8000_0050));
        assert_eq!(image.displacement(), 0x4000_0000);

        let loaded = unsafe { load(&image, &mut space, &mut alloc) }.unwrap();
        assert_eq!(loaded.image_base, VirtAddr::new(0x1_8000_0000));

        // The pointer was displaced by the move.
        let mut bytes = [0u8; 8];
        unsafe { read_virt(&space, VirtAddr::new(0x1_8000_0100), &mut bytes) }.unwrap();
        assert_eq!(u64::from_le_bytes(bytes), 0x1_8000_0220);
    }

    #[test]
    fn test_relative_relocation() {
        let mem = TestMemory::new(512);
        let mut alloc = mem.allocator();
        let (_kernel, mut space) = user_space(&mut alloc);

        // An image linked at 0 and placed at 0x40_0000,
        // with a RELATIVE relocation at link address 0x88
        // whose addend is 0x1000.
        let data = vec![0u8; 0x200];
        let image = Image {
            entry_point: VirtAddr::new(0x40_0000),
            image_base: VirtAddr::new(0x40_0000),
            link_base: 0,
            image_size: 0x1000,
            is_library: false,
            segments: vec![Segment {
                start: VirtAddr::new(0x40_0000),
                end: VirtAddr::new(0x40_1000),
                data: &data,
                flags: PageTableFlags::PRESENT
                    | PageTableFlags::USER_ACCESSIBLE
                    | PageTableFlags::WRITABLE
                    | PageTableFlags::NO_EXECUTE,
            }],
            relocations: vec![Relocation {
                addr: 0x88,
                kind: RelocationKind::Relative { addend: 0x1000 },
            }],
            skipped_relocations: 0,
            unbound_imports: 0,
        };

        unsafe { load(&image, &mut space, &mut alloc) }.unwrap();

        let mut bytes = [0u8; 8];
        unsafe { read_virt(&space, VirtAddr::new(0x40_0088), &mut bytes) }.unwrap();
        assert_eq!(u64::from_le_bytes(bytes), 0x40_1000);
    }

    #[test]
    fn test_unknown_format_is_rejected() {
        assert_eq!(
            Image::parse(b"#!/bin/sh\n").unwrap_err(),
            LoadError::Invalid("unrecognised binary format")
        );
        assert_eq!(
            Image::parse(b"").unwrap_err(),
            LoadError::Invalid("unrecognised binary format")
        );
    }
}
