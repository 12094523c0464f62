// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Node lookup and the read-only node view.

use zerocopy::FromBytes;
use zerocopy::byteorder::big_endian;

use super::property::FdtPropIter;
use super::{FDT_TAGSIZE, Fdt, FdtProperty, stringlist_contains};
use crate::error::{FdtError, FdtErrorKind};

impl<'a> Fdt<'a> {
    /// Returns the name of the node at `nodeoffset`.
    ///
    /// Blobs older than version 16 store full paths as node names; for
    /// those only the leaf component is returned, matching the version 16
    /// convention.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadOffset`] if `nodeoffset` does not point
    /// at a node, or [`FdtErrorKind::BadStructure`] if an old blob's name
    /// carries no path separator.
    pub fn get_name(&self, nodeoffset: usize) -> Result<&'a str, FdtError> {
        self.check_node_offset(nodeoffset)?;
        let name = self.struct_cstr(nodeoffset + FDT_TAGSIZE)?;
        if self.version() < 16 {
            let Some(slash) = name.rfind('/') else {
                return Err(FdtError::new(FdtErrorKind::BadStructure, nodeoffset));
            };
            return Ok(&name[slash + 1..]);
        }
        Ok(name)
    }

    /// Compares the name of the node at `offset` with `name` under the
    /// unit-address rule: the stored name matches either exactly, or up to
    /// its own `@` suffix when the search key carries no unit address.
    ///
    /// Any lookup failure compares unequal.
    fn nodename_eq(&self, offset: usize, name: &str) -> bool {
        let Ok(stored) = self.get_name(offset) else {
            return false;
        };
        let stored = stored.as_bytes();
        let key = name.as_bytes();
        if stored.len() < key.len() {
            // short match
            return false;
        }
        if &stored[..key.len()] != key {
            return false;
        }
        if stored.len() == key.len() {
            return true;
        }
        !key.contains(&b'@') && stored[key.len()] == b'@'
    }

    /// Returns the offset of the direct child of `parentoffset` named
    /// `name`.
    ///
    /// `name` may omit the unit address; the first child matching in
    /// traversal order wins.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NotFound`] if no direct child matches, or
    /// [`FdtErrorKind::BadOffset`] if `parentoffset` does not point at a
    /// node.
    pub fn subnode_offset(&self, parentoffset: usize, name: &str) -> Result<usize, FdtError> {
        let mut depth: i32 = 0;
        let mut offset = parentoffset;
        loop {
            if depth == 1 && self.nodename_eq(offset, name) {
                return Ok(offset);
            }
            match self.next_node(Some(offset), Some(&mut depth)) {
                Ok(next) if depth >= 0 => offset = next,
                // Ascended out of the parent: no child matched.
                Ok(_) => return Err(FdtError::new(FdtErrorKind::NotFound, parentoffset)),
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns the offset of the node at `path`.
    ///
    /// A path not beginning with `/` starts with an alias name, which is
    /// resolved through `/aliases` and re-entered as a path. Repeated
    /// separators are skipped and a trailing separator is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadPath`] if an alias fails to resolve or
    /// the alias chain is deeper than the supported bound, and
    /// [`FdtErrorKind::NotFound`] if a path component does not exist.
    pub fn path_offset(&self, path: &str) -> Result<usize, FdtError> {
        self.path_offset_bounded(path, 0)
    }

    fn path_offset_bounded(&self, path: &str, alias_depth: usize) -> Result<usize, FdtError> {
        // A malformed blob can chain aliases into a cycle; no sane tree
        // nests them deeper than this.
        const MAX_ALIAS_DEPTH: usize = 8;

        let mut rest = path;
        let mut offset = 0;

        if !path.starts_with('/') {
            let alias_end = path.find('/').unwrap_or(path.len());
            if alias_depth >= MAX_ALIAS_DEPTH {
                return Err(FdtError::new(FdtErrorKind::BadPath, 0));
            }
            let alias = self
                .get_alias(&path[..alias_end])
                .map_err(|e| FdtError::new(FdtErrorKind::BadPath, e.offset()))?;
            offset = self.path_offset_bounded(alias, alias_depth + 1)?;
            rest = &path[alias_end..];
        }

        for component in rest.split('/') {
            if component.is_empty() {
                continue;
            }
            offset = self.subnode_offset(offset, component)?;
        }

        Ok(offset)
    }

    /// Returns the value of the alias `name` under `/aliases`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NotFound`] if there is no `/aliases` node or
    /// no such property, or [`FdtErrorKind::BadValue`] if the value is not
    /// a NUL-terminated string.
    pub fn get_alias(&self, name: &str) -> Result<&'a str, FdtError> {
        let aliasoffset = self.path_offset("/aliases")?;
        let value = self.getprop(aliasoffset, name)?;
        let nul = value
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| FdtError::new(FdtErrorKind::BadValue, aliasoffset))?;
        core::str::from_utf8(&value[..nul])
            .map_err(|_| FdtError::new(FdtErrorKind::BadStructure, aliasoffset))
    }

    /// Reconstructs the full path of the node at `nodeoffset` into `buf`
    /// and returns it, re-walking the tree from the root.
    ///
    /// The root path is `/`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NoSpace`] if `buf` cannot hold the path,
    /// [`FdtErrorKind::BadOffset`] if `nodeoffset` is not a node boundary,
    /// or [`FdtErrorKind::BadStructure`] for a damaged stream.
    pub fn get_path<'b>(&self, nodeoffset: usize, buf: &'b mut [u8]) -> Result<&'b str, FdtError> {
        if buf.len() < 2 {
            return Err(FdtError::new(FdtErrorKind::NoSpace, nodeoffset));
        }

        let mut pdepth: i32 = 0;
        let mut p: usize = 0;
        let mut depth: i32 = 0;
        let mut offset = 0_usize;

        loop {
            // Back out of components the walk has ascended past.
            while pdepth > depth {
                while p > 0 {
                    p -= 1;
                    if p == 0 || buf[p - 1] == b'/' {
                        break;
                    }
                }
                pdepth -= 1;
            }

            if pdepth >= depth {
                let name = self.get_name(offset)?;
                if p + name.len() + 1 <= buf.len() {
                    buf[p..p + name.len()].copy_from_slice(name.as_bytes());
                    p += name.len();
                    buf[p] = b'/';
                    p += 1;
                    pdepth += 1;
                }
            }

            if offset == nodeoffset {
                if pdepth < depth + 1 {
                    return Err(FdtError::new(FdtErrorKind::NoSpace, nodeoffset));
                }
                // Keep the slash for the root, drop the trailing one
                // everywhere else.
                if p > 1 {
                    p -= 1;
                }
                return core::str::from_utf8(&buf[..p])
                    .map_err(|_| FdtError::new(FdtErrorKind::Internal, nodeoffset));
            }

            match self.next_node(Some(offset), Some(&mut depth)) {
                Ok(next) if next <= nodeoffset => offset = next,
                // Walked past the target without landing on it.
                Ok(_) => return Err(FdtError::new(FdtErrorKind::BadOffset, nodeoffset)),
                Err(e) => {
                    return Err(match e.kind() {
                        FdtErrorKind::NotFound => {
                            FdtError::new(FdtErrorKind::BadOffset, nodeoffset)
                        }
                        FdtErrorKind::BadOffset => {
                            FdtError::new(FdtErrorKind::BadStructure, e.offset())
                        }
                        _ => e,
                    });
                }
            }
        }
    }

    /// Walks from the root towards `nodeoffset`, recording the last offset
    /// seen at `supernodedepth`, and returns it together with the depth of
    /// the target node.
    fn supernode_atdepth(
        &self,
        nodeoffset: usize,
        supernodedepth: i32,
    ) -> Result<(usize, i32), FdtError> {
        if supernodedepth < 0 {
            return Err(FdtError::new(FdtErrorKind::NotFound, nodeoffset));
        }

        let mut offset = 0_usize;
        let mut depth: i32 = 0;
        let mut supernodeoffset = None;

        loop {
            if depth == supernodedepth {
                supernodeoffset = Some(offset);
            }

            if offset == nodeoffset {
                if supernodedepth > depth {
                    return Err(FdtError::new(FdtErrorKind::NotFound, nodeoffset));
                }
                let supernodeoffset = supernodeoffset
                    .ok_or_else(|| FdtError::new(FdtErrorKind::Internal, nodeoffset))?;
                return Ok((supernodeoffset, depth));
            }

            match self.next_node(Some(offset), Some(&mut depth)) {
                Ok(next) if next <= nodeoffset => offset = next,
                Ok(_) => return Err(FdtError::new(FdtErrorKind::BadOffset, nodeoffset)),
                Err(e) => {
                    return Err(match e.kind() {
                        FdtErrorKind::NotFound => {
                            FdtError::new(FdtErrorKind::BadOffset, nodeoffset)
                        }
                        FdtErrorKind::BadOffset => {
                            FdtError::new(FdtErrorKind::BadStructure, e.offset())
                        }
                        _ => e,
                    });
                }
            }
        }
    }

    /// Returns the ancestor of the node at `nodeoffset` that sits at
    /// `supernodedepth` below the root.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NotFound`] if `supernodedepth` is deeper
    /// than the node itself, or [`FdtErrorKind::BadOffset`] if
    /// `nodeoffset` is not a node boundary.
    pub fn supernode_atdepth_offset(
        &self,
        nodeoffset: usize,
        supernodedepth: usize,
    ) -> Result<usize, FdtError> {
        let supernodedepth = i32::try_from(supernodedepth)
            .map_err(|_| FdtError::new(FdtErrorKind::NotFound, nodeoffset))?;
        self.supernode_atdepth(nodeoffset, supernodedepth)
            .map(|(offset, _depth)| offset)
    }

    /// Returns the depth of the node at `nodeoffset` below the root.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadOffset`] if `nodeoffset` is not a node
    /// boundary.
    pub fn node_depth(&self, nodeoffset: usize) -> Result<usize, FdtError> {
        let (supernodeoffset, depth) = self.supernode_atdepth(nodeoffset, 0)?;
        if supernodeoffset != 0 {
            return Err(FdtError::new(FdtErrorKind::Internal, nodeoffset));
        }
        usize::try_from(depth).map_err(|_| FdtError::new(FdtErrorKind::Internal, nodeoffset))
    }

    /// Returns the offset of the parent of the node at `nodeoffset`.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NotFound`] for the root node.
    pub fn parent_offset(&self, nodeoffset: usize) -> Result<usize, FdtError> {
        let depth = self.node_depth(nodeoffset)?;
        if depth == 0 {
            return Err(FdtError::new(FdtErrorKind::NotFound, nodeoffset));
        }
        self.supernode_atdepth_offset(nodeoffset, depth - 1)
    }

    /// Returns the phandle of the node at `nodeoffset`, or 0 if it has
    /// none.
    ///
    /// Both the `phandle` and the legacy `linux,phandle` spellings are
    /// honored; either must be a 4-byte value to count.
    #[must_use]
    pub fn get_phandle(&self, nodeoffset: usize) -> u32 {
        for name in ["phandle", "linux,phandle"] {
            if let Ok(value) = self.getprop(nodeoffset, name) {
                if let Ok(value) = big_endian::U32::read_from_bytes(value) {
                    return value.get();
                }
            }
        }
        0
    }

    /// Returns the offset of the node whose phandle is `phandle`, sweeping
    /// the whole tree.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::BadPhandle`] for the reserved values 0 and
    /// 0xffffffff, or [`FdtErrorKind::NotFound`] if no node carries the
    /// phandle.
    pub fn node_offset_by_phandle(&self, phandle: u32) -> Result<usize, FdtError> {
        if phandle == 0 || phandle == u32::MAX {
            return Err(FdtError::new(FdtErrorKind::BadPhandle, 0));
        }
        let mut offset = self.next_node(None, None)?;
        loop {
            if self.get_phandle(offset) == phandle {
                return Ok(offset);
            }
            offset = self.next_node(Some(offset), None)?;
        }
    }

    /// Returns the highest phandle in use anywhere in the tree, ignoring
    /// the invalid 0xffffffff value; 0 if no node has one.
    ///
    /// # Errors
    ///
    /// Propagates walker errors for a damaged stream.
    pub fn get_max_phandle(&self) -> Result<u32, FdtError> {
        let mut max_phandle = 0;
        let mut cursor = self.next_node(None, None);
        loop {
            match cursor {
                Ok(offset) => {
                    let phandle = self.get_phandle(offset);
                    if phandle != u32::MAX && phandle > max_phandle {
                        max_phandle = phandle;
                    }
                    cursor = self.next_node(Some(offset), None);
                }
                Err(e) if e.kind() == FdtErrorKind::NotFound => return Ok(max_phandle),
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns the offset of the first node at or after `startoffset`
    /// whose property `propname` equals `propval` byte for byte.
    ///
    /// `None` sweeps the whole tree. The scan re-reads each node's
    /// properties; worst case is quadratic in the blob size.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NotFound`] once the sweep is exhausted.
    pub fn node_offset_by_prop_value(
        &self,
        startoffset: Option<usize>,
        propname: &str,
        propval: &[u8],
    ) -> Result<usize, FdtError> {
        let mut offset = self.next_node(startoffset, None)?;
        loop {
            if self
                .getprop(offset, propname)
                .is_ok_and(|value| value == propval)
            {
                return Ok(offset);
            }
            offset = self.next_node(Some(offset), None)?;
        }
    }

    /// Checks whether the node at `nodeoffset` lists `compatible` in its
    /// `compatible` property.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NotFound`] if the node has no `compatible`
    /// property.
    pub fn node_check_compatible(
        &self,
        nodeoffset: usize,
        compatible: &str,
    ) -> Result<bool, FdtError> {
        let value = self.getprop(nodeoffset, "compatible")?;
        Ok(stringlist_contains(value, compatible))
    }

    /// Returns the offset of the first node at or after `startoffset`
    /// compatible with `compatible`.
    ///
    /// `None` sweeps the whole tree. Nodes without a `compatible` property
    /// are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`FdtErrorKind::NotFound`] once the sweep is exhausted.
    pub fn node_offset_by_compatible(
        &self,
        startoffset: Option<usize>,
        compatible: &str,
    ) -> Result<usize, FdtError> {
        let mut offset = self.next_node(startoffset, None)?;
        loop {
            match self.node_check_compatible(offset, compatible) {
                Ok(true) => return Ok(offset),
                Ok(false) => {}
                Err(e) if e.kind() == FdtErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            offset = self.next_node(Some(offset), None)?;
        }
    }

    /// Returns a depth-first iterator over every node in the tree.
    pub fn nodes(&self) -> impl Iterator<Item = Result<FdtNode<'_>, FdtError>> {
        FdtNodeIter::Start { fdt: self }
    }
}

/// A node in a flattened device tree.
#[derive(Debug, Clone, Copy)]
pub struct FdtNode<'a> {
    pub(crate) fdt: &'a Fdt<'a>,
    pub(crate) offset: usize,
}

impl<'a> FdtNode<'a> {
    /// Returns the structure block offset of this node, usable with the
    /// offset-level API.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the name of this node.
    ///
    /// # Errors
    ///
    /// See [`Fdt::get_name`].
    pub fn name(&self) -> Result<&'a str, FdtError> {
        self.fdt.get_name(self.offset)
    }

    /// Returns a property by its name.
    ///
    /// # Errors
    ///
    /// Propagates walker and string-table errors for a damaged blob.
    pub fn property(&self, name: &str) -> Result<Option<FdtProperty<'a>>, FdtError> {
        for property in self.properties() {
            let property = property?;
            if property.name() == name {
                return Ok(Some(property));
            }
        }
        Ok(None)
    }

    /// Returns an iterator over the properties of this node.
    pub fn properties(&self) -> impl Iterator<Item = Result<FdtProperty<'a>, FdtError>> + use<'a> {
        FdtPropIter::Start {
            fdt: self.fdt,
            offset: self.offset,
        }
    }

    /// Returns a child node by its name, honoring the unit-address rule.
    ///
    /// # Errors
    ///
    /// Propagates walker errors for a damaged blob.
    pub fn child(&self, name: &str) -> Result<Option<FdtNode<'a>>, FdtError> {
        match self.fdt.subnode_offset(self.offset, name) {
            Ok(offset) => Ok(Some(FdtNode {
                fdt: self.fdt,
                offset,
            })),
            Err(e) if e.kind() == FdtErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns an iterator over the direct children of this node.
    pub fn children(&self) -> impl Iterator<Item = Result<FdtNode<'a>, FdtError>> + use<'a> {
        FdtChildIter::First {
            fdt: self.fdt,
            offset: self.offset,
        }
    }

    /// Returns the parent of this node, or `None` for the root.
    ///
    /// # Errors
    ///
    /// Propagates walker errors for a damaged blob.
    pub fn parent(&self) -> Result<Option<FdtNode<'a>>, FdtError> {
        match self.fdt.parent_offset(self.offset) {
            Ok(offset) => Ok(Some(FdtNode {
                fdt: self.fdt,
                offset,
            })),
            Err(e) if e.kind() == FdtErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns the depth of this node below the root.
    ///
    /// # Errors
    ///
    /// See [`Fdt::node_depth`].
    pub fn depth(&self) -> Result<usize, FdtError> {
        self.fdt.node_depth(self.offset)
    }

    /// Returns this node's phandle, or 0 if it has none.
    #[must_use]
    pub fn phandle(&self) -> u32 {
        self.fdt.get_phandle(self.offset)
    }

    /// Checks this node's `compatible` list for `compatible`.
    ///
    /// # Errors
    ///
    /// See [`Fdt::node_check_compatible`].
    pub fn is_compatible(&self, compatible: &str) -> Result<bool, FdtError> {
        self.fdt.node_check_compatible(self.offset, compatible)
    }
}

/// An iterator over the direct children of a device tree node.
#[derive(Clone, Copy)]
enum FdtChildIter<'a> {
    First { fdt: &'a Fdt<'a>, offset: usize },
    Next { fdt: &'a Fdt<'a>, offset: usize },
    Done,
}

impl<'a> Iterator for FdtChildIter<'a> {
    type Item = Result<FdtNode<'a>, FdtError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (fdt, step) = match *self {
            Self::First { fdt, offset } => (fdt, fdt.first_subnode(offset)),
            Self::Next { fdt, offset } => (fdt, fdt.next_subnode(offset)),
            Self::Done => return None,
        };
        match step {
            Ok(offset) => {
                *self = Self::Next { fdt, offset };
                Some(Ok(FdtNode { fdt, offset }))
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

/// A depth-first iterator over every node of a device tree.
#[derive(Clone, Copy)]
enum FdtNodeIter<'a> {
    Start { fdt: &'a Fdt<'a> },
    Running { fdt: &'a Fdt<'a>, offset: usize },
    Done,
}

impl<'a> Iterator for FdtNodeIter<'a> {
    type Item = Result<FdtNode<'a>, FdtError>;

    fn next(&mut self) -> Option<Self::Item> {
        let (fdt, step) = match *self {
            Self::Start { fdt } => (fdt, fdt.next_node(None, None)),
            Self::Running { fdt, offset } => (fdt, fdt.next_node(Some(offset), None)),
            Self::Done => return None,
        };
        match step {
            Ok(offset) => {
                *self = Self::Running { fdt, offset };
                Some(Ok(FdtNode { fdt, offset }))
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
