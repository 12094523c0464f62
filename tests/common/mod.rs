// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Test support: assembles flattened device tree blobs in memory the same
//! way an emitter does, so tests can produce well-formed, malformed, and
//! old-version fixtures byte for byte.

#![allow(dead_code)]

pub const FDT_MAGIC: u32 = 0xd00d_feed;
pub const FDT_BEGIN_NODE: u32 = 0x1;
pub const FDT_END_NODE: u32 = 0x2;
pub const FDT_PROP: u32 = 0x3;
pub const FDT_NOP: u32 = 0x4;
pub const FDT_END: u32 = 0x9;

const HEADER_SIZE: usize = 40;

pub struct BlobBuilder {
    version: u32,
    last_comp_version: u32,
    boot_cpuid_phys: u32,
    reservations: Vec<(u64, u64)>,
    terminate_reservations: bool,
    struct_block: Vec<u8>,
    strings_block: Vec<u8>,
    string_offsets: Vec<(String, u32)>,
    emit_end: bool,
}

impl Default for BlobBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobBuilder {
    pub fn new() -> Self {
        Self {
            version: 17,
            last_comp_version: 16,
            boot_cpuid_phys: 0,
            reservations: Vec::new(),
            terminate_reservations: true,
            struct_block: Vec::new(),
            strings_block: Vec::new(),
            string_offsets: Vec::new(),
            emit_end: true,
        }
    }

    pub fn version(&mut self, version: u32, last_comp_version: u32) -> &mut Self {
        self.version = version;
        self.last_comp_version = last_comp_version;
        self
    }

    pub fn memreserve(&mut self, address: u64, size: u64) -> &mut Self {
        self.reservations.push((address, size));
        self
    }

    /// Leaves the reservation map without its all-zero terminator.
    pub fn unterminated_reservations(&mut self) -> &mut Self {
        self.terminate_reservations = false;
        self
    }

    /// Leaves the structure block without its end tag, as a sequential
    /// writer would mid-flight.
    pub fn without_end_tag(&mut self) -> &mut Self {
        self.emit_end = false;
        self
    }

    pub fn begin_node(&mut self, name: &str) -> &mut Self {
        self.struct_block.extend_from_slice(&FDT_BEGIN_NODE.to_be_bytes());
        self.struct_block.extend_from_slice(name.as_bytes());
        self.struct_block.push(0);
        self.align();
        self
    }

    pub fn end_node(&mut self) -> &mut Self {
        self.struct_block.extend_from_slice(&FDT_END_NODE.to_be_bytes());
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.struct_block.extend_from_slice(&FDT_NOP.to_be_bytes());
        self
    }

    pub fn prop(&mut self, name: &str, value: &[u8]) -> &mut Self {
        let nameoff = self.string_offset(name);
        self.struct_block.extend_from_slice(&FDT_PROP.to_be_bytes());
        self.struct_block
            .extend_from_slice(&u32::try_from(value.len()).unwrap().to_be_bytes());
        self.struct_block.extend_from_slice(&nameoff.to_be_bytes());
        // Emitters before version 16 pad values of 8 bytes or more out to
        // an 8-byte boundary.
        if self.version < 16 && value.len() >= 8 && self.struct_block.len() % 8 != 0 {
            self.struct_block.extend_from_slice(&[0; 4]);
        }
        self.struct_block.extend_from_slice(value);
        self.align();
        self
    }

    pub fn prop_u32(&mut self, name: &str, value: u32) -> &mut Self {
        self.prop(name, &value.to_be_bytes())
    }

    pub fn prop_str(&mut self, name: &str, value: &str) -> &mut Self {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.prop(name, &bytes)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut struct_block = self.struct_block.clone();
        if self.emit_end {
            struct_block.extend_from_slice(&FDT_END.to_be_bytes());
        }

        let mut reservations = Vec::new();
        for &(address, size) in &self.reservations {
            reservations.extend_from_slice(&address.to_be_bytes());
            reservations.extend_from_slice(&size.to_be_bytes());
        }
        if self.terminate_reservations {
            reservations.extend_from_slice(&[0; 16]);
        }

        let off_mem_rsvmap = HEADER_SIZE;
        let off_dt_struct = off_mem_rsvmap + reservations.len();
        let off_dt_strings = off_dt_struct + struct_block.len();
        let totalsize = off_dt_strings + self.strings_block.len();

        let mut blob = Vec::with_capacity(totalsize);
        for field in [
            FDT_MAGIC,
            u32::try_from(totalsize).unwrap(),
            u32::try_from(off_dt_struct).unwrap(),
            u32::try_from(off_dt_strings).unwrap(),
            u32::try_from(off_mem_rsvmap).unwrap(),
            self.version,
            self.last_comp_version,
            self.boot_cpuid_phys,
            u32::try_from(self.strings_block.len()).unwrap(),
            u32::try_from(struct_block.len()).unwrap(),
        ] {
            blob.extend_from_slice(&field.to_be_bytes());
        }
        blob.extend_from_slice(&reservations);
        blob.extend_from_slice(&struct_block);
        blob.extend_from_slice(&self.strings_block);
        blob
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        if let Some(&(_, offset)) = self
            .string_offsets
            .iter()
            .find(|(stored, _)| stored == name)
        {
            return offset;
        }
        let offset = u32::try_from(self.strings_block.len()).unwrap();
        self.strings_block.extend_from_slice(name.as_bytes());
        self.strings_block.push(0);
        self.string_offsets.push((name.to_owned(), offset));
        offset
    }

    fn align(&mut self) {
        let len = self.struct_block.len().next_multiple_of(4);
        self.struct_block.resize(len, 0);
    }
}

/// Builds the tree most tests share:
///
/// ```text
/// /
/// ├── aliases { serial0 = "/soc/uart@7000" }
/// ├── soc
/// │   ├── uart@7000 { compatible = "ns16550a"; phandle = <5> }
/// │   └── uart@8000 { compatible = "arm,pl011"; phandle = <7> }
/// └── cpu@0 { compatible = "arm,cortex-a9" }
/// ```
pub fn sample_tree() -> Vec<u8> {
    let mut builder = BlobBuilder::new();
    builder
        .begin_node("")
        .begin_node("aliases")
        .prop_str("serial0", "/soc/uart@7000")
        .end_node()
        .begin_node("soc")
        .begin_node("uart@7000")
        .prop_str("compatible", "ns16550a")
        .prop_u32("phandle", 5)
        .end_node()
        .begin_node("uart@8000")
        .prop_str("compatible", "arm,pl011")
        .prop_u32("phandle", 7)
        .end_node()
        .end_node()
        .begin_node("cpu@0")
        .prop_str("compatible", "arm,cortex-a9")
        .end_node()
        .end_node();
    builder.build()
}
