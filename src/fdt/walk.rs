// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The tag-stream walker.
//!
//! Every traversal in the crate flows through [`Fdt::next_tag`] and the
//! [`Fdt::offset_bytes`] bounds check, so a malformed stream can cut a walk
//! short but never push a read outside the blob.

use zerocopy::FromBytes;
use zerocopy::byteorder::big_endian;

use super::{FDT_BEGIN_NODE, FDT_END, FDT_END_NODE, FDT_NOP, FDT_PROP, FDT_TAGSIZE, Fdt};
use crate::error::{FdtError, FdtErrorKind};

/// A token in the device tree structure block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdtToken {
    /// Opens a node; followed by the NUL-terminated node name.
    BeginNode,
    /// Closes the most recently opened node.
    EndNode,
    /// A property record; followed by its length, name offset, and value.
    Prop,
    /// Skipped transparently by every traversal.
    Nop,
    /// Terminates the structure block.
    End,
}

impl TryFrom<u32> for FdtToken {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            FDT_BEGIN_NODE => Ok(FdtToken::BeginNode),
            FDT_END_NODE => Ok(FdtToken::EndNode),
            FDT_PROP => Ok(FdtToken::Prop),
            FDT_NOP => Ok(FdtToken::Nop),
            FDT_END => Ok(FdtToken::End),
            _ => Err(value),
        }
    }
}

impl<'a> Fdt<'a> {
    /// Returns `len` bytes of the structure block starting at `offset`.
    ///
    /// This is the sole conversion from a structure offset to bytes. The
    /// whole range must lie inside the blob and, for version 17 blobs,
    /// inside the declared structure block size.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::Truncated`] if any part of the range is
    /// outside those bounds.
    pub fn offset_bytes(&self, offset: usize, len: usize) -> Result<&'a [u8], FdtError> {
        let truncated = || FdtError::new(FdtErrorKind::Truncated, offset);
        let end = offset.checked_add(len).ok_or_else(truncated)?;
        let base = self.off_dt_struct() as usize;
        let abs_start = base.checked_add(offset).ok_or_else(truncated)?;
        let abs_end = base.checked_add(end).ok_or_else(truncated)?;
        if abs_end > self.limit() {
            return Err(truncated());
        }
        if self.version() >= 17 && end > self.size_dt_struct()? as usize {
            return Err(truncated());
        }
        Ok(&self.data[abs_start..abs_end])
    }

    /// Reads the big-endian word at `offset` of the structure block.
    pub(crate) fn struct_u32(&self, offset: usize) -> Result<u32, FdtError> {
        let bytes = self.offset_bytes(offset, FDT_TAGSIZE)?;
        big_endian::U32::ref_from_bytes(bytes)
            .map(|value| value.get())
            .map_err(|_| FdtError::new(FdtErrorKind::Internal, offset))
    }

    /// Reads the NUL-terminated string starting at `offset` of the
    /// structure block.
    pub(crate) fn struct_cstr(&self, offset: usize) -> Result<&'a str, FdtError> {
        let mut end = offset;
        loop {
            let byte = self.offset_bytes(end, 1)?;
            if byte[0] == 0 {
                break;
            }
            end += 1;
        }
        let bytes = self.offset_bytes(offset, end - offset)?;
        core::str::from_utf8(bytes).map_err(|_| FdtError::new(FdtErrorKind::BadStructure, offset))
    }

    /// Reads the tag at `startoffset` and returns it together with the
    /// offset of the record that follows it.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::Truncated`] if the record runs past the end
    /// of the structure block, or [`FdtErrorKind::BadStructure`] for an
    /// unknown tag value.
    pub fn next_tag(&self, startoffset: usize) -> Result<(FdtToken, usize), FdtError> {
        let raw = self.struct_u32(startoffset)?;
        let token = FdtToken::try_from(raw)
            .map_err(|_| FdtError::new(FdtErrorKind::BadStructure, startoffset))?;
        let mut offset = startoffset + FDT_TAGSIZE;

        match token {
            FdtToken::BeginNode => {
                // Skip the NUL-terminated name.
                loop {
                    let byte = self.offset_bytes(offset, 1)?;
                    offset += 1;
                    if byte[0] == 0 {
                        break;
                    }
                }
            }
            FdtToken::Prop => {
                let len = self.struct_u32(offset)? as usize;
                // Skip the length word, the name offset word, and the value.
                offset = offset
                    .checked_add(2 * FDT_TAGSIZE)
                    .and_then(|cursor| cursor.checked_add(len))
                    .ok_or_else(|| FdtError::new(FdtErrorKind::Truncated, startoffset))?;
                // Emitters before version 16 pad values of 8 bytes or more
                // out to an 8-byte boundary.
                if self.version() < 16 && len >= 8 && !(offset - len).is_multiple_of(8) {
                    offset += FDT_TAGSIZE;
                }
            }
            FdtToken::EndNode | FdtToken::Nop | FdtToken::End => {}
        }

        self.offset_bytes(startoffset, offset - startoffset)?;
        Ok((token, Fdt::align_tag_offset(offset)))
    }

    /// Checks that `offset` points at a `BeginNode` tag and returns the
    /// offset following the record.
    pub(crate) fn check_node_offset(&self, offset: usize) -> Result<usize, FdtError> {
        if !offset.is_multiple_of(FDT_TAGSIZE) {
            return Err(FdtError::new(FdtErrorKind::BadOffset, offset));
        }
        match self.next_tag(offset) {
            Ok((FdtToken::BeginNode, nextoffset)) => Ok(nextoffset),
            _ => Err(FdtError::new(FdtErrorKind::BadOffset, offset)),
        }
    }

    /// Checks that `offset` points at a `Prop` tag and returns the offset
    /// following the record.
    pub(crate) fn check_prop_offset(&self, offset: usize) -> Result<usize, FdtError> {
        if !offset.is_multiple_of(FDT_TAGSIZE) {
            return Err(FdtError::new(FdtErrorKind::BadOffset, offset));
        }
        match self.next_tag(offset) {
            Ok((FdtToken::Prop, nextoffset)) => Ok(nextoffset),
            _ => Err(FdtError::new(FdtErrorKind::BadOffset, offset)),
        }
    }

    /// Advances to the next node in the tag stream.
    ///
    /// `None` starts a root-inclusive walk at the beginning of the
    /// structure block. When `depth` is supplied it is incremented on every
    /// node opened and decremented on every node closed; a walk that
    /// ascends past its starting node returns the offset it stopped at with
    /// `*depth` negative.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NotFound`] once the end of the stream is
    /// reached, [`FdtErrorKind::BadOffset`] if `offset` does not point at a
    /// node, or a walker error for a damaged stream. A depth-less walk
    /// reports a stream that ends without an end tag as
    /// [`FdtErrorKind::NotFound`], since an in-flight sequential-write blob
    /// legitimately has none.
    pub fn next_node(
        &self,
        offset: Option<usize>,
        mut depth: Option<&mut i32>,
    ) -> Result<usize, FdtError> {
        let mut nextoffset = match offset {
            Some(offset) => self.check_node_offset(offset)?,
            None => 0,
        };

        loop {
            let offset = nextoffset;
            match self.next_tag(offset) {
                Ok((token, next)) => {
                    nextoffset = next;
                    match token {
                        FdtToken::Prop | FdtToken::Nop => {}
                        FdtToken::BeginNode => {
                            if let Some(depth) = depth.as_deref_mut() {
                                *depth += 1;
                            }
                            return Ok(offset);
                        }
                        FdtToken::EndNode => {
                            if let Some(depth) = depth.as_deref_mut() {
                                *depth -= 1;
                                if *depth < 0 {
                                    // Ascended past the starting node.
                                    return Ok(nextoffset);
                                }
                            }
                        }
                        FdtToken::End => {
                            return Err(FdtError::new(FdtErrorKind::NotFound, offset));
                        }
                    }
                }
                Err(e) => {
                    if e.kind() == FdtErrorKind::Truncated && depth.is_none() {
                        return Err(FdtError::new(FdtErrorKind::NotFound, e.offset()));
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Returns the offset of the first direct subnode of the node at
    /// `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NotFound`] if the node has no subnodes.
    pub fn first_subnode(&self, offset: usize) -> Result<usize, FdtError> {
        let mut depth = 0;
        let subnode = self
            .next_node(Some(offset), Some(&mut depth))
            .map_err(|e| FdtError::new(FdtErrorKind::NotFound, e.offset()))?;
        if depth != 1 {
            return Err(FdtError::new(FdtErrorKind::NotFound, offset));
        }
        Ok(subnode)
    }

    /// Returns the offset of the next sibling of the node at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NotFound`] if the node is the last subnode
    /// of its parent.
    pub fn next_subnode(&self, offset: usize) -> Result<usize, FdtError> {
        // Relative to the parent, the depth of the next subnode is the same
        // as this one's.
        let mut depth = 1;
        let mut offset = offset;
        loop {
            offset = self
                .next_node(Some(offset), Some(&mut depth))
                .map_err(|e| FdtError::new(FdtErrorKind::NotFound, e.offset()))?;
            if depth < 1 {
                return Err(FdtError::new(FdtErrorKind::NotFound, offset));
            }
            if depth == 1 {
                return Ok(offset);
            }
        }
    }
}
