// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Property lookup and the read-only property view.

use core::ffi::CStr;

use zerocopy::byteorder::big_endian;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{FDT_PROP, FDT_TAGSIZE, Fdt, FdtToken};
use crate::error::{FdtError, FdtErrorKind};

/// The fixed prefix of a property record in the structure block.
#[repr(C, packed)]
#[derive(Debug, Copy, Clone, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
struct PropHeader {
    tag: big_endian::U32,
    len: big_endian::U32,
    nameoff: big_endian::U32,
}

/// A raw property record: the name offset into the strings block and the
/// value bytes, exactly as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawProperty<'a> {
    nameoff: u32,
    value: &'a [u8],
}

impl<'a> RawProperty<'a> {
    /// Returns the offset of the property name in the strings block.
    #[must_use]
    pub fn nameoff(&self) -> u32 {
        self.nameoff
    }

    /// Returns the value bytes.
    #[must_use]
    pub fn value(&self) -> &'a [u8] {
        self.value
    }

    /// Returns the length of the value in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.value.len()
    }

    /// Returns `true` if the value is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl<'a> Fdt<'a> {
    /// Skips `Nop` records until the next property record.
    fn nextprop(&self, mut offset: usize) -> Result<usize, FdtError> {
        loop {
            match self.next_tag(offset)? {
                (FdtToken::End, _) => {
                    return Err(FdtError::new(FdtErrorKind::BadStructure, offset));
                }
                (FdtToken::Prop, _) => return Ok(offset),
                (FdtToken::Nop, next) => offset = next,
                // The node's property block ended.
                _ => return Err(FdtError::new(FdtErrorKind::NotFound, offset)),
            }
        }
    }

    /// Returns the offset of the first property of the node at
    /// `nodeoffset`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadOffset`] if `nodeoffset` does not point
    /// at a node, or [`FdtErrorKind::NotFound`] if the node has no
    /// properties.
    pub fn first_property_offset(&self, nodeoffset: usize) -> Result<usize, FdtError> {
        let offset = self.check_node_offset(nodeoffset)?;
        self.nextprop(offset)
    }

    /// Returns the offset of the property following the one at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadOffset`] if `offset` does not point at a
    /// property, or [`FdtErrorKind::NotFound`] at the end of the node's
    /// property block.
    pub fn next_property_offset(&self, offset: usize) -> Result<usize, FdtError> {
        let offset = self.check_prop_offset(offset)?;
        self.nextprop(offset)
    }

    fn prop_header(&self, offset: usize) -> Result<PropHeader, FdtError> {
        let bytes = self.offset_bytes(offset, size_of::<PropHeader>())?;
        let header = PropHeader::read_from_bytes(bytes)
            .map_err(|_| FdtError::new(FdtErrorKind::Internal, offset))?;
        if header.tag.get() != FDT_PROP {
            return Err(FdtError::new(FdtErrorKind::BadOffset, offset));
        }
        Ok(header)
    }

    /// Returns the name offset and value of the property record at
    /// `offset`, with the pre-version-16 value realignment applied.
    fn property_value(&self, offset: usize) -> Result<(u32, &'a [u8]), FdtError> {
        self.check_prop_offset(offset)?;
        let header = self.prop_header(offset)?;
        let len = header.len.get() as usize;
        let mut value_offset = offset + size_of::<PropHeader>();
        // Emitters before version 16 pad values of 8 bytes or more out to
        // an 8-byte boundary.
        if self.version() < 16 && !value_offset.is_multiple_of(8) && len >= 8 {
            value_offset += FDT_TAGSIZE;
        }
        let value = self.offset_bytes(value_offset, len)?;
        Ok((header.nameoff.get(), value))
    }

    /// Returns the raw property record at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadVersion`] for blobs older than version
    /// 16: their values may be realigned relative to the record, which this
    /// strict accessor cannot express. [`Fdt::getprop_by_offset`] handles
    /// those. Otherwise [`FdtErrorKind::BadOffset`] if `offset` does not
    /// point at a property record.
    pub fn get_property_by_offset(&self, offset: usize) -> Result<RawProperty<'a>, FdtError> {
        if self.version() < 16 {
            return Err(FdtError::new(FdtErrorKind::BadVersion, offset));
        }
        self.check_prop_offset(offset)?;
        let header = self.prop_header(offset)?;
        let value =
            self.offset_bytes(offset + size_of::<PropHeader>(), header.len.get() as usize)?;
        Ok(RawProperty {
            nameoff: header.nameoff.get(),
            value,
        })
    }

    /// Returns the raw record of the property named `name` of the node at
    /// `nodeoffset`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadVersion`] for blobs older than version 16
    /// (see [`Fdt::get_property_by_offset`]), [`FdtErrorKind::NotFound`] if
    /// the node has no such property.
    pub fn get_property(&self, nodeoffset: usize, name: &str) -> Result<RawProperty<'a>, FdtError> {
        if self.version() < 16 {
            return Err(FdtError::new(FdtErrorKind::BadVersion, nodeoffset));
        }
        let offset = self.find_property(nodeoffset, name)?;
        self.get_property_by_offset(offset)
    }

    /// Returns the offset of the property named `name` of the node at
    /// `nodeoffset`, matching through the strings block.
    pub(crate) fn find_property(&self, nodeoffset: usize, name: &str) -> Result<usize, FdtError> {
        let mut offset = self.first_property_offset(nodeoffset)?;
        loop {
            let header = self
                .prop_header(offset)
                .map_err(|e| FdtError::new(FdtErrorKind::Internal, e.offset()))?;
            if self.string_eq(header.nameoff.get(), name) {
                return Ok(offset);
            }
            offset = self.next_property_offset(offset)?;
        }
    }

    /// Returns the value of the property named `name` of the node at
    /// `nodeoffset`.
    ///
    /// Unlike [`Fdt::get_property`] this works for every supported
    /// version; values realigned by pre-version-16 emitters come back at
    /// their padded position.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NotFound`] if the node has no such property,
    /// or [`FdtErrorKind::BadOffset`] if `nodeoffset` does not point at a
    /// node.
    pub fn getprop(&self, nodeoffset: usize, name: &str) -> Result<&'a [u8], FdtError> {
        let offset = self.find_property(nodeoffset, name)?;
        let (_nameoff, value) = self.property_value(offset)?;
        Ok(value)
    }

    /// Returns the resolved name and value of the property record at
    /// `offset`, for every supported version.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadOffset`] if `offset` does not point at a
    /// property record, or a string-table error if its name offset is
    /// damaged.
    pub fn getprop_by_offset(&self, offset: usize) -> Result<(&'a str, &'a [u8]), FdtError> {
        let (nameoff, value) = self.property_value(offset)?;
        let stroffset = i32::try_from(nameoff)
            .map_err(|_| FdtError::new(FdtErrorKind::BadOffset, offset))?;
        let name = self.get_string(stroffset)?;
        Ok((name, value))
    }

    /// Returns the number of strings in the stringlist property `property`
    /// of the node at `nodeoffset`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadValue`] if the value is not a sequence of
    /// NUL-terminated strings, or any [`Fdt::getprop`] error.
    pub fn stringlist_count(&self, nodeoffset: usize, property: &str) -> Result<usize, FdtError> {
        let list = self.getprop(nodeoffset, property)?;
        let mut rest = list;
        let mut count = 0;
        while !rest.is_empty() {
            let Some(nul) = rest.iter().position(|&b| b == 0) else {
                return Err(FdtError::new(FdtErrorKind::BadValue, nodeoffset));
            };
            rest = &rest[nul + 1..];
            count += 1;
        }
        Ok(count)
    }

    /// Returns the index of `string` within the stringlist property
    /// `property` of the node at `nodeoffset`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NotFound`] if the list does not contain
    /// `string`, or [`FdtErrorKind::BadValue`] for a malformed list.
    pub fn stringlist_search(
        &self,
        nodeoffset: usize,
        property: &str,
        string: &str,
    ) -> Result<usize, FdtError> {
        let list = self.getprop(nodeoffset, property)?;
        let mut rest = list;
        let mut index = 0;
        while !rest.is_empty() {
            let Some(nul) = rest.iter().position(|&b| b == 0) else {
                return Err(FdtError::new(FdtErrorKind::BadValue, nodeoffset));
            };
            if &rest[..nul] == string.as_bytes() {
                return Ok(index);
            }
            rest = &rest[nul + 1..];
            index += 1;
        }
        Err(FdtError::new(FdtErrorKind::NotFound, nodeoffset))
    }

    /// Returns the `index`-th string of the stringlist property `property`
    /// of the node at `nodeoffset`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NotFound`] if the list has no `index`-th
    /// element, or [`FdtErrorKind::BadValue`] for a malformed list.
    pub fn stringlist_get(
        &self,
        nodeoffset: usize,
        property: &str,
        index: usize,
    ) -> Result<&'a str, FdtError> {
        let list = self.getprop(nodeoffset, property)?;
        let mut rest = list;
        let mut remaining = index;
        while !rest.is_empty() {
            let Some(nul) = rest.iter().position(|&b| b == 0) else {
                return Err(FdtError::new(FdtErrorKind::BadValue, nodeoffset));
            };
            if remaining == 0 {
                return core::str::from_utf8(&rest[..nul])
                    .map_err(|_| FdtError::new(FdtErrorKind::BadStructure, nodeoffset));
            }
            rest = &rest[nul + 1..];
            remaining -= 1;
        }
        Err(FdtError::new(FdtErrorKind::NotFound, nodeoffset))
    }
}

/// Checks whether a NUL-separated stringlist value contains `s`.
#[must_use]
pub fn stringlist_contains(strlist: &[u8], s: &str) -> bool {
    let needle = s.as_bytes();
    let mut rest = strlist;
    while rest.len() > needle.len() {
        if &rest[..needle.len()] == needle && rest[needle.len()] == 0 {
            return true;
        }
        match rest.iter().position(|&b| b == 0) {
            Some(nul) => rest = &rest[nul + 1..],
            None => return false, // malformed stringlist
        }
    }
    false
}

/// A property of a device tree node, with its name resolved through the
/// strings block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdtProperty<'a> {
    name: &'a str,
    value: &'a [u8],
    offset: usize,
}

impl<'a> FdtProperty<'a> {
    /// Returns the name of this property.
    #[must_use]
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Returns the value of this property.
    #[must_use]
    pub fn value(&self) -> &'a [u8] {
        self.value
    }

    /// Returns the structure block offset of this property's record.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the value of this property as a `u32`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadValue`] if the value is not exactly 4
    /// bytes long.
    pub fn as_u32(&self) -> Result<u32, FdtError> {
        big_endian::U32::read_from_bytes(self.value)
            .map(|value| value.get())
            .map_err(|_| FdtError::new(FdtErrorKind::BadValue, self.offset))
    }

    /// Returns the value of this property as a `u64`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadValue`] if the value is not exactly 8
    /// bytes long.
    pub fn as_u64(&self) -> Result<u64, FdtError> {
        big_endian::U64::read_from_bytes(self.value)
            .map(|value| value.get())
            .map_err(|_| FdtError::new(FdtErrorKind::BadValue, self.offset))
    }

    /// Returns the value of this property as a string.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadValue`] if the value is not a single
    /// NUL-terminated string, or [`FdtErrorKind::BadStructure`] if it is
    /// not valid UTF-8.
    pub fn as_str(&self) -> Result<&'a str, FdtError> {
        let cstr = CStr::from_bytes_with_nul(self.value)
            .map_err(|_| FdtError::new(FdtErrorKind::BadValue, self.offset))?;
        cstr.to_str()
            .map_err(|_| FdtError::new(FdtErrorKind::BadStructure, self.offset))
    }

    /// Returns an iterator over the strings in this property.
    pub fn as_str_list(&self) -> impl Iterator<Item = &'a str> {
        FdtStringListIterator { value: self.value }
    }
}

/// An iterator over the properties of a device tree node.
#[derive(Clone, Copy)]
pub(crate) enum FdtPropIter<'a> {
    Start { fdt: &'a Fdt<'a>, offset: usize },
    Running { fdt: &'a Fdt<'a>, offset: usize },
    Done,
}

impl<'a> Iterator for FdtPropIter<'a> {
    type Item = Result<FdtProperty<'a>, FdtError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (fdt, step) = match *self {
            Self::Start { fdt, offset } => (fdt, fdt.first_property_offset(offset)),
            Self::Running { fdt, offset } => (fdt, fdt.next_property_offset(offset)),
            Self::Done => return None,
        };
        match step {
            Ok(offset) => {
                *self = Self::Running { fdt, offset };
                match fdt.getprop_by_offset(offset) {
                    Ok((name, value)) => Some(Ok(FdtProperty {
                        name,
                        value,
                        offset,
                    })),
                    Err(e) => {
                        *self = Self::Done;
                        Some(Err(e))
                    }
                }
            }
            Err(e) if e.kind() == FdtErrorKind::NotFound => {
                *self = Self::Done;
                None
            }
            Err(e) => {
                *self = Self::Done;
                Some(Err(e))
            }
        }
    }
}

struct FdtStringListIterator<'a> {
    value: &'a [u8],
}

impl<'a> Iterator for FdtStringListIterator<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        if self.value.is_empty() {
            return None;
        }
        let cstr = CStr::from_bytes_until_nul(self.value).ok()?;
        let s = cstr.to_str().ok()?;
        self.value = &self.value[s.len() + 1..];
        Some(s)
    }
}
