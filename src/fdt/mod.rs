// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A read-only API for parsing and traversing a [Flattened Device Tree
//! (FDT)].
//!
//! This module provides the [`Fdt`] struct, which is the entry point for
//! inspecting an FDT blob. The API performs no memory allocation and
//! provides a zero-copy view of the FDT data; the blob is treated as
//! untrusted and every access is bounds-checked, so no malformed header
//! field, tag, or length can cause a read outside the caller's buffer.
//!
//! [Flattened Device Tree (FDT)]: https://devicetree-specification.readthedocs.io/en/latest/chapter5-flattened-format.html

use core::mem::offset_of;
use core::ptr;

use zerocopy::byteorder::big_endian;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{FdtError, FdtErrorKind};
use crate::memreserve::MemoryReservation;

mod node;
mod property;
mod strings;
mod walk;

pub use node::FdtNode;
pub use property::{FdtProperty, RawProperty, stringlist_contains};
pub use strings::find_string;
pub use walk::FdtToken;

/// Oldest structure version this library accepts.
const FDT_FIRST_SUPPORTED_VERSION: u32 = 2;
/// Newest `last_comp_version` this library accepts.
const FDT_LAST_SUPPORTED_VERSION: u32 = 17;

pub(crate) const FDT_TAGSIZE: usize = size_of::<u32>();
pub(crate) const FDT_MAGIC: u32 = 0xd00d_feed;
/// Magic of an in-flight sequential-write blob (bitwise complement of
/// [`FDT_MAGIC`]).
pub(crate) const FDT_SW_MAGIC: u32 = !FDT_MAGIC;
pub(crate) const FDT_BEGIN_NODE: u32 = 0x1;
pub(crate) const FDT_END_NODE: u32 = 0x2;
pub(crate) const FDT_PROP: u32 = 0x3;
pub(crate) const FDT_NOP: u32 = 0x4;
pub(crate) const FDT_END: u32 = 0x9;

const FDT_V1_SIZE: usize = 7 * FDT_TAGSIZE;
const FDT_V2_SIZE: usize = FDT_V1_SIZE + FDT_TAGSIZE;
const FDT_V3_SIZE: usize = FDT_V2_SIZE + FDT_TAGSIZE;
const FDT_V16_SIZE: usize = FDT_V3_SIZE;
const FDT_V17_SIZE: usize = FDT_V16_SIZE + FDT_TAGSIZE;

/// Returns the header size used by the given structure version.
#[must_use]
pub fn header_size(version: u32) -> usize {
    if version <= 1 {
        FDT_V1_SIZE
    } else if version <= 2 {
        FDT_V2_SIZE
    } else if version <= 3 {
        FDT_V3_SIZE
    } else if version <= 16 {
        FDT_V16_SIZE
    } else {
        FDT_V17_SIZE
    }
}

/// The full (version 17) device tree header, exactly as stored.
///
/// Older versions use a prefix of this layout; fields past
/// [`header_size`]`(version)` do not exist in those blobs, and the
/// [`Fdt`] accessors never read them there.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct FdtHeader {
    /// Magic number of the device tree.
    pub magic: big_endian::U32,
    /// Total size of the device tree.
    pub totalsize: big_endian::U32,
    /// Offset of the structure block.
    pub off_dt_struct: big_endian::U32,
    /// Offset of the strings block.
    pub off_dt_strings: big_endian::U32,
    /// Offset of the memory reservation map.
    pub off_mem_rsvmap: big_endian::U32,
    /// Version of the device tree.
    pub version: big_endian::U32,
    /// Last compatible version of the device tree.
    pub last_comp_version: big_endian::U32,
    /// Physical ID of the boot CPU (version 2 and later).
    pub boot_cpuid_phys: big_endian::U32,
    /// Size of the strings block (version 3 and later).
    pub size_dt_strings: big_endian::U32,
    /// Size of the structure block (version 17 and later).
    pub size_dt_struct: big_endian::U32,
}

/// One raw entry of the memory reservation block, exactly as stored.
#[repr(C)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
struct ReserveEntry {
    address: big_endian::U64,
    size: big_endian::U64,
}

impl ReserveEntry {
    fn reservation(&self) -> MemoryReservation {
        MemoryReservation::new(self.address.get(), self.size.get())
    }
}

/// A flattened device tree.
///
/// `Fdt` borrows the caller's buffer and never copies or mutates it. The
/// buffer does not have to match the header's `totalsize`: a short buffer
/// is reported by [`Fdt::check_full`] and never read past, and bytes past
/// `totalsize` are never touched.
#[derive(Debug, Clone, Copy)]
pub struct Fdt<'a> {
    pub(crate) data: &'a [u8],
}

impl<'a> Fdt<'a> {
    /// Creates a new `Fdt` from the given byte slice.
    ///
    /// Only the quick probe runs here: the magic word, the supported
    /// version window, and (for an in-flight sequential-write blob) the
    /// writer state. The deep validators [`Fdt::check_header`] and
    /// [`Fdt::check_full`] are opt-in; every accessor bounds-checks its own
    /// reads regardless.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::Truncated`] if `data` is too short to hold
    /// the base header, [`FdtErrorKind::BadMagic`] if the first word is
    /// neither magic, [`FdtErrorKind::BadVersion`] if the version window is
    /// unsupported, or [`FdtErrorKind::BadState`] for an unfinished
    /// sequential-write blob.
    ///
    /// # Examples
    ///
    /// ```
    /// use fdt_view::Fdt;
    ///
    /// // A minimal version-17 blob: empty root node, terminated
    /// // reservation map, empty strings block.
    /// let blob = [
    ///     0xd0, 0x0d, 0xfe, 0xed, // magic
    ///     0x00, 0x00, 0x00, 0x48, // totalsize = 72
    ///     0x00, 0x00, 0x00, 0x38, // off_dt_struct = 56
    ///     0x00, 0x00, 0x00, 0x48, // off_dt_strings = 72
    ///     0x00, 0x00, 0x00, 0x28, // off_mem_rsvmap = 40
    ///     0x00, 0x00, 0x00, 0x11, // version = 17
    ///     0x00, 0x00, 0x00, 0x10, // last_comp_version = 16
    ///     0x00, 0x00, 0x00, 0x00, // boot_cpuid_phys = 0
    ///     0x00, 0x00, 0x00, 0x00, // size_dt_strings = 0
    ///     0x00, 0x00, 0x00, 0x10, // size_dt_struct = 16
    ///     0x00, 0x00, 0x00, 0x00, // reservation map terminator
    ///     0x00, 0x00, 0x00, 0x00, // ...
    ///     0x00, 0x00, 0x00, 0x00, // ...
    ///     0x00, 0x00, 0x00, 0x00, // ...
    ///     0x00, 0x00, 0x00, 0x01, // FDT_BEGIN_NODE
    ///     0x00, 0x00, 0x00, 0x00, // root node name ""
    ///     0x00, 0x00, 0x00, 0x02, // FDT_END_NODE
    ///     0x00, 0x00, 0x00, 0x09, // FDT_END
    /// ];
    /// let fdt = Fdt::new(&blob).unwrap();
    /// assert_eq!(fdt.version(), 17);
    /// fdt.check_full().unwrap();
    /// ```
    pub fn new(data: &'a [u8]) -> Result<Self, FdtError> {
        let fdt = Fdt { data };
        fdt.ro_probe()?;
        Ok(fdt)
    }

    /// Creates a new `Fdt` from the given pointer.
    ///
    /// # Safety
    ///
    /// The `data` pointer must point to a memory region that is valid and
    /// accessible for reading for at least `size_of::<FdtHeader>()` bytes
    /// and for the `totalsize` bytes the header declares.
    ///
    /// # Errors
    ///
    /// This function can return the same errors as [`Fdt::new`].
    pub unsafe fn from_raw(data: *const u8) -> Result<Self, FdtError> {
        // SAFETY: The caller guarantees `data` is readable for a full
        // header, which contains the `totalsize` field.
        let header = unsafe { ptr::read_unaligned(data.cast::<FdtHeader>()) };
        let size = header.totalsize.get();
        // SAFETY: The caller guarantees the region spans `totalsize` bytes.
        let slice = unsafe { core::slice::from_raw_parts(data, size as usize) };
        Fdt::new(slice)
    }

    /// Runs the quick sanity probe over the header.
    ///
    /// A complete tree passes if its magic and version window are
    /// supported; an in-flight sequential-write blob passes once its
    /// structure size has been fixed up by the writer.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`Fdt::new`].
    pub fn ro_probe(&self) -> Result<(), FdtError> {
        match self.header_u32(offset_of!(FdtHeader, magic))? {
            FDT_MAGIC => {
                // Complete tree.
                let version = self.header_u32(offset_of!(FdtHeader, version))?;
                let last_comp = self.header_u32(offset_of!(FdtHeader, last_comp_version))?;
                if version < FDT_FIRST_SUPPORTED_VERSION || last_comp > FDT_LAST_SUPPORTED_VERSION {
                    return Err(FdtError::new(
                        FdtErrorKind::BadVersion,
                        offset_of!(FdtHeader, version),
                    ));
                }
                Ok(())
            }
            FDT_SW_MAGIC => {
                // Unfinished sequential-write blob.
                if self.header_u32(offset_of!(FdtHeader, size_dt_struct))? == 0 {
                    return Err(FdtError::new(
                        FdtErrorKind::BadState,
                        offset_of!(FdtHeader, size_dt_struct),
                    ));
                }
                Ok(())
            }
            _ => Err(FdtError::new(
                FdtErrorKind::BadMagic,
                offset_of!(FdtHeader, magic),
            )),
        }
    }

    /// Runs the deep header check: magic, version window, and the bounds of
    /// every declared region.
    ///
    /// Unlike [`Fdt::ro_probe`] this rejects sequential-write blobs; a
    /// complete tree is required.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadMagic`] or [`FdtErrorKind::BadVersion`]
    /// for the probe conditions, and [`FdtErrorKind::Truncated`] when
    /// `totalsize` or a region offset/size falls outside the blob.
    pub fn check_header(&self) -> Result<(), FdtError> {
        if self.magic() != FDT_MAGIC {
            return Err(FdtError::new(
                FdtErrorKind::BadMagic,
                offset_of!(FdtHeader, magic),
            ));
        }

        let version = self.version();
        let last_comp = self.last_comp_version();
        let hdrsize = u32::try_from(header_size(version))
            .map_err(|_| FdtError::new(FdtErrorKind::Internal, 0))?;

        if version < FDT_FIRST_SUPPORTED_VERSION || last_comp > FDT_LAST_SUPPORTED_VERSION {
            return Err(FdtError::new(
                FdtErrorKind::BadVersion,
                offset_of!(FdtHeader, version),
            ));
        }
        if version < last_comp {
            return Err(FdtError::new(
                FdtErrorKind::BadVersion,
                offset_of!(FdtHeader, last_comp_version),
            ));
        }

        let totalsize = self.totalsize();
        if totalsize < hdrsize || totalsize > i32::MAX as u32 {
            return Err(FdtError::new(
                FdtErrorKind::Truncated,
                offset_of!(FdtHeader, totalsize),
            ));
        }

        // Bounds check the memory reservation block.
        if !check_off(hdrsize, totalsize, self.off_mem_rsvmap()) {
            return Err(FdtError::new(
                FdtErrorKind::Truncated,
                offset_of!(FdtHeader, off_mem_rsvmap),
            ));
        }

        // Bounds check the structure block. Only version 17 declares its
        // size; older blobs are bounded by `totalsize` alone.
        if version < 17 {
            if !check_off(hdrsize, totalsize, self.off_dt_struct()) {
                return Err(FdtError::new(
                    FdtErrorKind::Truncated,
                    offset_of!(FdtHeader, off_dt_struct),
                ));
            }
        } else if !check_block(
            hdrsize,
            totalsize,
            self.off_dt_struct(),
            self.size_dt_struct()?,
        ) {
            return Err(FdtError::new(
                FdtErrorKind::Truncated,
                offset_of!(FdtHeader, off_dt_struct),
            ));
        }

        // Bounds check the strings block. Its size field exists from
        // version 3 on.
        if version < 3 {
            if !check_off(hdrsize, totalsize, self.off_dt_strings()) {
                return Err(FdtError::new(
                    FdtErrorKind::Truncated,
                    offset_of!(FdtHeader, off_dt_strings),
                ));
            }
        } else if !check_block(
            hdrsize,
            totalsize,
            self.off_dt_strings(),
            self.size_dt_strings()?,
        ) {
            return Err(FdtError::new(
                FdtErrorKind::Truncated,
                offset_of!(FdtHeader, off_dt_strings),
            ));
        }

        Ok(())
    }

    /// Runs the full structural sweep: [`Fdt::check_header`], the buffer
    /// size against `totalsize`, reservation map termination, and a walk of
    /// the entire tag stream with depth tracking and per-property name
    /// resolution.
    ///
    /// Passing this check guarantees that every traversal primitive
    /// succeeds on every reachable offset of the blob.
    ///
    /// # Errors
    ///
    /// Any error of [`Fdt::check_header`]; [`FdtErrorKind::Truncated`] when
    /// the buffer is shorter than `totalsize` or the reservation map is
    /// unterminated; [`FdtErrorKind::BadStructure`] for unbalanced nodes or
    /// a missing end tag; any walker or string-table error for a damaged
    /// tag stream.
    pub fn check_full(&self) -> Result<(), FdtError> {
        if self.data.len() < FDT_V1_SIZE {
            return Err(FdtError::new(FdtErrorKind::Truncated, 0));
        }
        self.check_header()?;
        if self.data.len() < self.totalsize() as usize {
            return Err(FdtError::new(
                FdtErrorKind::Truncated,
                offset_of!(FdtHeader, totalsize),
            ));
        }

        self.num_mem_rsv()?;

        let mut depth: u32 = 0;
        let mut nextoffset = 0;
        loop {
            let offset = nextoffset;
            let (token, next) = self.next_tag(offset)?;
            nextoffset = next;
            match token {
                FdtToken::Nop => {}
                FdtToken::End => {
                    if depth != 0 {
                        return Err(FdtError::new(FdtErrorKind::BadStructure, offset));
                    }
                    return Ok(());
                }
                FdtToken::BeginNode => {
                    depth += 1;
                    if depth > i32::MAX as u32 {
                        return Err(FdtError::new(FdtErrorKind::BadStructure, offset));
                    }
                }
                FdtToken::EndNode => {
                    if depth == 0 {
                        return Err(FdtError::new(FdtErrorKind::BadStructure, offset));
                    }
                    depth -= 1;
                }
                FdtToken::Prop => {
                    self.getprop_by_offset(offset)?;
                }
            }
        }
    }

    /// Returns the underlying data slice of the FDT.
    #[must_use]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Reads a header word, bounds-checked against the buffer.
    fn header_u32(&self, field_offset: usize) -> Result<u32, FdtError> {
        let bytes = self
            .data
            .get(field_offset..field_offset + FDT_TAGSIZE)
            .ok_or_else(|| FdtError::new(FdtErrorKind::Truncated, field_offset))?;
        big_endian::U32::ref_from_bytes(bytes)
            .map(|value| value.get())
            .map_err(|_| FdtError::new(FdtErrorKind::Internal, field_offset))
    }

    /// Reads one of the seven base header words present in every version.
    fn header_word(&self, field_offset: usize) -> u32 {
        debug_assert!(field_offset + FDT_TAGSIZE <= FDT_V1_SIZE);
        self.header_u32(field_offset)
            .expect("Fdt::new() verifies the base header is readable")
    }

    /// Reads a header word that only exists from `min_version` on.
    fn versioned_header_u32(&self, min_version: u32, field_offset: usize) -> Result<u32, FdtError> {
        if self.version() < min_version {
            return Err(FdtError::new(FdtErrorKind::Truncated, field_offset));
        }
        self.header_u32(field_offset)
    }

    pub(crate) fn magic(&self) -> u32 {
        self.header_word(offset_of!(FdtHeader, magic))
    }

    /// Returns the total size of the blob as declared by the header.
    #[must_use]
    pub fn totalsize(&self) -> u32 {
        self.header_word(offset_of!(FdtHeader, totalsize))
    }

    /// Returns the offset of the structure block.
    #[must_use]
    pub fn off_dt_struct(&self) -> u32 {
        self.header_word(offset_of!(FdtHeader, off_dt_struct))
    }

    /// Returns the offset of the strings block.
    #[must_use]
    pub fn off_dt_strings(&self) -> u32 {
        self.header_word(offset_of!(FdtHeader, off_dt_strings))
    }

    /// Returns the offset of the memory reservation map.
    #[must_use]
    pub fn off_mem_rsvmap(&self) -> u32 {
        self.header_word(offset_of!(FdtHeader, off_mem_rsvmap))
    }

    /// Returns the structure version of the blob.
    #[must_use]
    pub fn version(&self) -> u32 {
        self.header_word(offset_of!(FdtHeader, version))
    }

    /// Returns the oldest version this blob is backwards compatible with.
    #[must_use]
    pub fn last_comp_version(&self) -> u32 {
        self.header_word(offset_of!(FdtHeader, last_comp_version))
    }

    /// Returns the physical ID of the boot CPU.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::Truncated`] if the blob's version predates
    /// this field (version 2) or the buffer ends before it.
    pub fn boot_cpuid_phys(&self) -> Result<u32, FdtError> {
        self.versioned_header_u32(2, offset_of!(FdtHeader, boot_cpuid_phys))
    }

    /// Returns the size of the strings block.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::Truncated`] if the blob's version predates
    /// this field (version 3) or the buffer ends before it.
    pub fn size_dt_strings(&self) -> Result<u32, FdtError> {
        self.versioned_header_u32(3, offset_of!(FdtHeader, size_dt_strings))
    }

    /// Returns the size of the structure block.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::Truncated`] if the blob's version predates
    /// this field (version 17) or the buffer ends before it.
    pub fn size_dt_struct(&self) -> Result<u32, FdtError> {
        self.versioned_header_u32(17, offset_of!(FdtHeader, size_dt_struct))
    }

    /// Returns the number of readable bytes: the buffer, capped by the
    /// declared `totalsize`. No accessor dereferences past this.
    pub(crate) fn limit(&self) -> usize {
        self.data.len().min(self.totalsize() as usize)
    }

    /// Returns the `n`-th reservation entry, if it lies inside the blob.
    fn mem_rsv(&self, n: usize) -> Option<MemoryReservation> {
        let offset = n.checked_mul(size_of::<ReserveEntry>())?;
        let absoffset = (self.off_mem_rsvmap() as usize).checked_add(offset)?;
        let end = absoffset.checked_add(size_of::<ReserveEntry>())?;
        let bytes = self.data.get(..self.limit())?.get(absoffset..end)?;
        ReserveEntry::ref_from_bytes(bytes)
            .ok()
            .map(ReserveEntry::reservation)
    }

    /// Returns the number of entries in the memory reservation map, not
    /// counting the all-zero terminator.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::Truncated`] if the map runs off the end of
    /// the blob without a terminator.
    pub fn num_mem_rsv(&self) -> Result<usize, FdtError> {
        for n in 0.. {
            match self.mem_rsv(n) {
                Some(entry) if entry.is_terminator() => return Ok(n),
                Some(_) => {}
                None => {
                    return Err(FdtError::new(
                        FdtErrorKind::Truncated,
                        self.off_mem_rsvmap() as usize + n * size_of::<ReserveEntry>(),
                    ));
                }
            }
        }
        unreachable!()
    }

    /// Returns the `n`-th entry of the memory reservation map.
    ///
    /// Entries at or past the terminator are still readable as long as
    /// they lie inside the blob; use [`Fdt::num_mem_rsv`] for the live
    /// count.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadOffset`] if entry `n` lies outside the
    /// blob.
    pub fn get_mem_rsv(&self, n: usize) -> Result<MemoryReservation, FdtError> {
        self.mem_rsv(n).ok_or_else(|| {
            FdtError::new(
                FdtErrorKind::BadOffset,
                self.off_mem_rsvmap() as usize + n.saturating_mul(size_of::<ReserveEntry>()),
            )
        })
    }

    /// Returns an iterator over the memory reservation block, up to its
    /// terminator or the end of readable data.
    pub fn memory_reservations(&self) -> impl Iterator<Item = MemoryReservation> + '_ {
        let mut n = 0;
        core::iter::from_fn(move || {
            let entry = self.mem_rsv(n)?;
            n += 1;
            if entry.is_terminator() {
                return None;
            }
            Some(entry)
        })
    }

    /// Copies the blob's `totalsize` bytes into `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NoSpace`] if `buf` is smaller than
    /// `totalsize`, or [`FdtErrorKind::Truncated`] if the source buffer
    /// itself is.
    pub fn move_to(&self, buf: &mut [u8]) -> Result<(), FdtError> {
        let totalsize = self.totalsize() as usize;
        if buf.len() < totalsize {
            return Err(FdtError::new(FdtErrorKind::NoSpace, 0));
        }
        let src = self
            .data
            .get(..totalsize)
            .ok_or_else(|| FdtError::new(FdtErrorKind::Truncated, self.data.len()))?;
        buf[..totalsize].copy_from_slice(src);
        Ok(())
    }

    /// Returns the root node of the device tree.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadOffset`] if the structure block does not
    /// open with a readable `FDT_BEGIN_NODE`.
    pub fn root(&self) -> Result<FdtNode<'_>, FdtError> {
        self.check_node_offset(0)?;
        Ok(FdtNode {
            fdt: self,
            offset: 0,
        })
    }

    /// Finds a node by its path.
    ///
    /// A path that does not begin with `/` is resolved through the
    /// `/aliases` node first. Lookup performance is linear in the size of
    /// the blob for every path component; nothing is cached.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadPath`] if an alias fails to resolve, or
    /// any walker error for a damaged tag stream. A well-formed path whose
    /// target simply does not exist is `Ok(None)`.
    pub fn find_node(&self, path: &str) -> Result<Option<FdtNode<'_>>, FdtError> {
        match self.path_offset(path) {
            Ok(offset) => Ok(Some(FdtNode { fdt: self, offset })),
            Err(e) if e.kind() == FdtErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn align_tag_offset(offset: usize) -> usize {
        offset.next_multiple_of(FDT_TAGSIZE)
    }
}

/// Checks that `off` lies between the end of the header and the end of the
/// blob.
fn check_off(hdrsize: u32, totalsize: u32, off: u32) -> bool {
    off >= hdrsize && off <= totalsize
}

/// Checks that the block `[base, base + size)` lies between the end of the
/// header and the end of the blob, without overflow.
fn check_block(hdrsize: u32, totalsize: u32, base: u32, size: u32) -> bool {
    if !check_off(hdrsize, totalsize, base) {
        return false; // block start out of bounds
    }
    match base.checked_add(size) {
        Some(end) => check_off(hdrsize, totalsize, end),
        None => false, // overflow
    }
}
