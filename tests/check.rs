// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

mod common;

use common::BlobBuilder;
use fdt_view::{Fdt, FdtErrorKind};

fn minimal_blob() -> Vec<u8> {
    let mut builder = BlobBuilder::new();
    builder.begin_node("").end_node();
    builder.build()
}

#[test]
fn minimal_blob_passes_the_full_check() {
    let blob = minimal_blob();
    let fdt = Fdt::new(&blob).unwrap();
    fdt.check_full().unwrap();
    assert_eq!(fdt.path_offset("/").unwrap(), 0);
    assert!(matches!(
        fdt.first_subnode(0),
        Err(e) if e.kind() == FdtErrorKind::NotFound
    ));
}

#[test]
fn the_sample_tree_passes_the_full_check() {
    let blob = common::sample_tree();
    Fdt::new(&blob).unwrap().check_full().unwrap();
}

#[test]
fn a_lying_totalsize_is_caught_against_the_buffer() {
    let mut blob = minimal_blob();
    // The header claims 0x100 bytes but the buffer holds only 0x40.
    blob[4..8].copy_from_slice(&0x100_u32.to_be_bytes());
    blob.truncate(0x40);
    let fdt = Fdt::new(&blob).unwrap();
    assert!(matches!(
        fdt.check_full(),
        Err(e) if e.kind() == FdtErrorKind::Truncated
    ));
}

#[test]
fn every_truncation_is_detected() {
    let blob = common::sample_tree();
    for len in 28..blob.len() {
        let cut = &blob[..len];
        match Fdt::new(cut) {
            Ok(fdt) => {
                let err = fdt.check_full().expect_err("truncated blob must not verify");
                assert!(
                    matches!(
                        err.kind(),
                        FdtErrorKind::Truncated | FdtErrorKind::BadStructure
                    ),
                    "unexpected error for length {len}: {err}"
                );
            }
            Err(e) => assert_eq!(e.kind(), FdtErrorKind::Truncated),
        }
    }
}

#[test]
fn corrupting_the_magic_is_always_caught() {
    for index in 0..4 {
        let mut blob = minimal_blob();
        blob[index] ^= 0xff;
        let result = Fdt::new(&blob);
        assert!(matches!(result, Err(e) if e.kind() == FdtErrorKind::BadMagic));
    }
}

#[test]
fn corrupting_the_version_window_is_caught() {
    // Version below the supported window.
    let mut blob = minimal_blob();
    blob[20..24].copy_from_slice(&1_u32.to_be_bytes());
    assert!(matches!(
        Fdt::new(&blob),
        Err(e) if e.kind() == FdtErrorKind::BadVersion
    ));

    // last_comp_version above the supported window.
    let mut blob = minimal_blob();
    blob[24..28].copy_from_slice(&18_u32.to_be_bytes());
    assert!(matches!(
        Fdt::new(&blob),
        Err(e) if e.kind() == FdtErrorKind::BadVersion
    ));

    // A version older than its own last_comp_version is inconsistent.
    let mut blob = minimal_blob();
    blob[20..24].copy_from_slice(&16_u32.to_be_bytes());
    blob[24..28].copy_from_slice(&17_u32.to_be_bytes());
    assert!(matches!(
        Fdt::new(&blob).unwrap().check_header(),
        Err(e) if e.kind() == FdtErrorKind::BadVersion
    ));
}

#[test]
fn corrupting_size_fields_is_caught() {
    let pristine = minimal_blob();

    // totalsize smaller than the blocks it must contain.
    let mut blob = pristine.clone();
    blob[4..8].copy_from_slice(&39_u32.to_be_bytes());
    assert!(Fdt::new(&blob).unwrap().check_full().is_err());

    // totalsize above the signed ceiling.
    let mut blob = pristine.clone();
    blob[4..8].copy_from_slice(&0x8000_0000_u32.to_be_bytes());
    assert!(matches!(
        Fdt::new(&blob).unwrap().check_full(),
        Err(e) if e.kind() == FdtErrorKind::Truncated
    ));

    // A structure block size that cuts the end tag off.
    let mut blob = pristine.clone();
    blob[36..40].copy_from_slice(&12_u32.to_be_bytes());
    assert!(matches!(
        Fdt::new(&blob).unwrap().check_full(),
        Err(e) if e.kind() == FdtErrorKind::Truncated
    ));

    // A structure block size overflowing the blob.
    let mut blob = pristine.clone();
    blob[36..40].copy_from_slice(&0x1000_u32.to_be_bytes());
    assert!(matches!(
        Fdt::new(&blob).unwrap().check_full(),
        Err(e) if e.kind() == FdtErrorKind::Truncated
    ));

    // A strings block size overflowing the blob.
    let blob = common::sample_tree();
    let mut corrupted = blob.clone();
    corrupted[32..36].copy_from_slice(&0x1000_u32.to_be_bytes());
    assert!(matches!(
        Fdt::new(&corrupted).unwrap().check_full(),
        Err(e) if e.kind() == FdtErrorKind::Truncated
    ));

    // A strings block size cutting off a referenced property name.
    let mut corrupted = blob;
    corrupted[32..36].copy_from_slice(&1_u32.to_be_bytes());
    assert!(Fdt::new(&corrupted).unwrap().check_full().is_err());
}

#[test]
fn unbalanced_streams_are_structural_damage() {
    // An extra END_NODE underflows the depth counter.
    let mut builder = BlobBuilder::new();
    builder.begin_node("").end_node().end_node();
    let blob = builder.build();
    assert!(matches!(
        Fdt::new(&blob).unwrap().check_full(),
        Err(e) if e.kind() == FdtErrorKind::BadStructure
    ));

    // A missing END_NODE leaves the depth counter high at the end tag.
    let mut builder = BlobBuilder::new();
    builder.begin_node("").begin_node("child").end_node();
    let blob = builder.build();
    assert!(matches!(
        Fdt::new(&blob).unwrap().check_full(),
        Err(e) if e.kind() == FdtErrorKind::BadStructure
    ));

    // An unknown tag value in the stream.
    let mut builder = BlobBuilder::new();
    builder.begin_node("").end_node();
    let mut blob = builder.build();
    let struct_offset = 40 + 16; // header + terminated reservation map
    blob[struct_offset + 11] = 0x06; // END_NODE tag word becomes tag 6
    assert!(matches!(
        Fdt::new(&blob).unwrap().check_full(),
        Err(e) if e.kind() == FdtErrorKind::BadStructure
    ));
}

#[test]
fn an_unterminated_reservation_map_is_truncated() {
    let mut builder = BlobBuilder::new();
    builder
        .memreserve(0x8000_0000, 0x10_0000)
        .unterminated_reservations()
        .begin_node("")
        .end_node();
    let blob = builder.build();
    let fdt = Fdt::new(&blob).unwrap();
    assert!(matches!(
        fdt.num_mem_rsv(),
        Err(e) if e.kind() == FdtErrorKind::Truncated
    ));
    assert!(matches!(
        fdt.check_full(),
        Err(e) if e.kind() == FdtErrorKind::Truncated
    ));
}

#[test]
fn reservations_are_read_back_in_order() {
    let mut builder = BlobBuilder::new();
    builder
        .memreserve(0x8000_0000, 0x10_0000)
        .memreserve(0x9000_0000, 0x20_0000)
        .begin_node("")
        .end_node();
    let blob = builder.build();
    let fdt = Fdt::new(&blob).unwrap();
    fdt.check_full().unwrap();

    assert_eq!(fdt.num_mem_rsv().unwrap(), 2);
    let second = fdt.get_mem_rsv(1).unwrap();
    assert_eq!((second.address(), second.size()), (0x9000_0000, 0x20_0000));

    let all: Vec<_> = fdt
        .memory_reservations()
        .map(|rsv| (rsv.address(), rsv.size()))
        .collect();
    assert_eq!(all, [(0x8000_0000, 0x10_0000), (0x9000_0000, 0x20_0000)]);

    // The terminator is not an entry.
    assert!(matches!(
        fdt.get_mem_rsv(4),
        Err(e) if e.kind() == FdtErrorKind::BadOffset
    ));
}

#[test]
fn move_to_round_trips_the_blob() {
    let blob = common::sample_tree();
    let fdt = Fdt::new(&blob).unwrap();
    let mut copy = vec![0_u8; blob.len()];
    fdt.move_to(&mut copy).unwrap();
    assert_eq!(copy, blob);
    Fdt::new(&copy).unwrap().check_full().unwrap();
}
