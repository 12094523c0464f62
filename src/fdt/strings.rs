// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Access to the strings block.

use super::{FDT_MAGIC, FDT_SW_MAGIC, Fdt};
use crate::error::{FdtError, FdtErrorKind};

impl<'a> Fdt<'a> {
    /// Retrieves a property name from the strings block.
    ///
    /// For a complete tree `stroffset` is a non-negative byte offset into
    /// the strings block. An in-flight sequential-write blob inverts the
    /// convention: its writer emits strings backwards from the end of the
    /// buffer, so `stroffset` is negative and counts back from
    /// `off_dt_strings`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadOffset`] if `stroffset` falls outside the
    /// strings region for the blob's convention,
    /// [`FdtErrorKind::Truncated`] if no NUL terminator appears before the
    /// region ends, and [`FdtErrorKind::BadStructure`] if the name is not
    /// valid UTF-8.
    pub fn get_string(&self, stroffset: i32) -> Result<&'a str, FdtError> {
        let limit = self.limit();
        let signed_absoffset = i64::from(self.off_dt_strings()) + i64::from(stroffset);
        let absoffset = usize::try_from(signed_absoffset)
            .map_err(|_| FdtError::new(FdtErrorKind::BadOffset, 0))?;
        if absoffset >= limit {
            return Err(FdtError::new(FdtErrorKind::BadOffset, absoffset));
        }
        let mut len = limit - absoffset;

        match self.magic() {
            FDT_MAGIC => {
                let stroffset = usize::try_from(stroffset)
                    .map_err(|_| FdtError::new(FdtErrorKind::BadOffset, absoffset))?;
                if self.version() >= 17 {
                    let size = self.size_dt_strings()? as usize;
                    if stroffset >= size {
                        return Err(FdtError::new(FdtErrorKind::BadOffset, absoffset));
                    }
                    len = len.min(size - stroffset);
                }
            }
            FDT_SW_MAGIC => {
                let size = i64::from(self.size_dt_strings()?);
                if stroffset >= 0 || i64::from(stroffset) < -size {
                    return Err(FdtError::new(FdtErrorKind::BadOffset, absoffset));
                }
                let back = usize::try_from(-i64::from(stroffset))
                    .map_err(|_| FdtError::new(FdtErrorKind::Internal, absoffset))?;
                len = len.min(back);
            }
            _ => return Err(FdtError::new(FdtErrorKind::Internal, 0)),
        }

        let bytes = self
            .data
            .get(absoffset..absoffset + len)
            .ok_or_else(|| FdtError::new(FdtErrorKind::Internal, absoffset))?;
        let Some(nul) = bytes.iter().position(|&b| b == 0) else {
            // Missing terminating NUL.
            return Err(FdtError::new(FdtErrorKind::Truncated, absoffset));
        };
        core::str::from_utf8(&bytes[..nul])
            .map_err(|_| FdtError::new(FdtErrorKind::BadStructure, absoffset))
    }

    /// Compares the string at `stroffset` with `s`.
    ///
    /// Any lookup failure compares unequal.
    pub(crate) fn string_eq(&self, stroffset: u32, s: &str) -> bool {
        i32::try_from(stroffset)
            .is_ok_and(|offset| self.get_string(offset).is_ok_and(|stored| stored == s))
    }
}

/// Scans a strings table for the NUL-terminated string `s` and returns the
/// byte offset of its first occurrence.
///
/// The scan is linear and byte-wise; no index is built. A match may land
/// inside a longer string (its NUL-terminated tail), which is exactly the
/// sharing the format encourages.
#[must_use]
pub fn find_string(strtab: &[u8], s: &str) -> Option<usize> {
    let needle = s.as_bytes();
    let len = needle.len() + 1; // include the terminator
    if strtab.len() < len {
        return None;
    }
    (0..=strtab.len() - len).find(|&offset| {
        strtab[offset..offset + needle.len()] == *needle && strtab[offset + needle.len()] == 0
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Empty root node; strings block holds "reg\0model\0".
    const STRINGS: &[u8] = &[
        0xd0, 0x0d, 0xfe, 0xed, // magic
        0x00, 0x00, 0x00, 0x52, // totalsize = 82
        0x00, 0x00, 0x00, 0x38, // off_dt_struct = 56
        0x00, 0x00, 0x00, 0x48, // off_dt_strings = 72
        0x00, 0x00, 0x00, 0x28, // off_mem_rsvmap = 40
        0x00, 0x00, 0x00, 0x11, // version = 17
        0x00, 0x00, 0x00, 0x10, // last_comp_version = 16
        0x00, 0x00, 0x00, 0x00, // boot_cpuid_phys = 0
        0x00, 0x00, 0x00, 0x0a, // size_dt_strings = 10
        0x00, 0x00, 0x00, 0x10, // size_dt_struct = 16
        0x00, 0x00, 0x00, 0x00, // reservation map terminator
        0x00, 0x00, 0x00, 0x00, // ...
        0x00, 0x00, 0x00, 0x00, // ...
        0x00, 0x00, 0x00, 0x00, // ...
        0x00, 0x00, 0x00, 0x01, // FDT_BEGIN_NODE (root)
        0x00, 0x00, 0x00, 0x00, // name ""
        0x00, 0x00, 0x00, 0x02, // FDT_END_NODE
        0x00, 0x00, 0x00, 0x09, // FDT_END
        b'r', b'e', b'g', 0x00, // strings block
        b'm', b'o', b'd', b'e', // ...
        b'l', 0x00, // ...
    ];

    // A sequential-write blob: off_dt_strings points at the end of the
    // buffer and the writer has emitted "reg\0" then "ok\0" behind it.
    const SEQUENTIAL: &[u8] = &[
        0x2f, 0xf2, 0x01, 0x12, // sequential-write magic (!0xd00dfeed)
        0x00, 0x00, 0x00, 0x44, // totalsize = 68
        0x00, 0x00, 0x00, 0x38, // off_dt_struct = 56
        0x00, 0x00, 0x00, 0x44, // off_dt_strings = 68 (end of buffer)
        0x00, 0x00, 0x00, 0x28, // off_mem_rsvmap = 40
        0x00, 0x00, 0x00, 0x11, // version = 17
        0x00, 0x00, 0x00, 0x10, // last_comp_version = 16
        0x00, 0x00, 0x00, 0x00, // boot_cpuid_phys = 0
        0x00, 0x00, 0x00, 0x08, // size_dt_strings = 8
        0x00, 0x00, 0x00, 0x04, // size_dt_struct = 4
        0x00, 0x00, 0x00, 0x00, // reservation map terminator
        0x00, 0x00, 0x00, 0x00, // ...
        0x00, 0x00, 0x00, 0x00, // ...
        0x00, 0x00, 0x00, 0x00, // ...
        0x00, 0x00, 0x00, 0x01, // in-flight structure block
        b'r', b'e', b'g', 0x00, // strings, growing down from the end
        b'o', b'k', 0x00, 0x00, // ...
    ];

    #[test]
    fn strings_are_resolved_by_offset() {
        let fdt = Fdt::new(STRINGS).unwrap();
        assert_eq!(fdt.get_string(0).unwrap(), "reg");
        assert_eq!(fdt.get_string(4).unwrap(), "model");
        // A tail of a longer string is itself a valid string.
        assert_eq!(fdt.get_string(6).unwrap(), "del");
    }

    #[test]
    fn out_of_range_offsets_are_rejected() {
        let fdt = Fdt::new(STRINGS).unwrap();
        assert!(matches!(
            fdt.get_string(10),
            Err(e) if e.kind() == FdtErrorKind::BadOffset
        ));
        assert!(matches!(
            fdt.get_string(-1),
            Err(e) if e.kind() == FdtErrorKind::BadOffset
        ));
    }

    #[test]
    fn unterminated_string_is_truncated() {
        let mut blob = STRINGS.to_vec();
        blob[35] = 0x09; // size_dt_strings = 9, cutting the final NUL
        let fdt = Fdt::new(&blob).unwrap();
        assert!(matches!(
            fdt.get_string(4),
            Err(e) if e.kind() == FdtErrorKind::Truncated
        ));
    }

    #[test]
    fn sequential_write_blobs_index_from_the_end() {
        let fdt = Fdt::new(SEQUENTIAL).unwrap();
        assert_eq!(fdt.get_string(-8).unwrap(), "reg");
        assert_eq!(fdt.get_string(-4).unwrap(), "ok");
        // Non-negative offsets and offsets before the emitted strings are
        // invalid in this convention.
        assert!(matches!(
            fdt.get_string(0),
            Err(e) if e.kind() == FdtErrorKind::BadOffset
        ));
        assert!(matches!(
            fdt.get_string(-12),
            Err(e) if e.kind() == FdtErrorKind::BadOffset
        ));
    }

    #[test]
    fn find_string_scans_linearly() {
        let table = b"reg\0model\0";
        assert_eq!(find_string(table, "reg"), Some(0));
        assert_eq!(find_string(table, "model"), Some(4));
        assert_eq!(find_string(table, "del"), Some(6));
        assert_eq!(find_string(table, "mode"), None);
        assert_eq!(find_string(table, "phandle"), None);
        assert_eq!(find_string(&[], ""), None);
        assert_eq!(find_string(&[0], ""), Some(0));
    }
}
