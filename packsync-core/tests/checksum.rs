use packsync_core::checksum::{compute_checksum, Checksum};
use proptest::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

#[test]
fn missing_file_has_no_checksum() {
    let td = tempfile::tempdir().unwrap();
    assert!(compute_checksum(&td.path().join("nope.bin")).is_none());
}

#[test]
fn file_checksum_matches_in_memory_digest() {
    let td = tempfile::tempdir().unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    // Spans several read blocks and ends mid-block.
    let data: Vec<u8> = (0..200_000).map(|_| rng.gen()).collect();
    let p = td.path().join("blob.bin");
    std::fs::write(&p, &data).unwrap();

    let c = compute_checksum(&p).unwrap();
    assert_eq!(c, Checksum::of_bytes(&data));
    assert_eq!(c.as_str().len(), 64);
    assert!(c.as_str().chars().all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch)));
}

#[test]
fn hex_parsing_normalizes_case() {
    let lower = Checksum::of_bytes(b"hello");
    let upper = Checksum::from_hex(&lower.as_str().to_uppercase()).unwrap();
    assert_eq!(lower, upper);
    assert!(Checksum::from_hex("abc").is_none());
    assert!(Checksum::from_hex(&"zz".repeat(32)).is_none());
}

#[test]
fn checksum_deserialization_rejects_garbage() {
    let ok: Checksum = serde_json::from_str(&format!("\"{}\"", "AB".repeat(32))).unwrap();
    assert_eq!(ok.as_str(), "ab".repeat(32));
    assert!(serde_json::from_str::<Checksum>("\"not-a-digest\"").is_err());
}

proptest! {
    #[test]
    fn identical_content_gives_identical_digest(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
        let copy = data.clone();
        prop_assert_eq!(Checksum::of_bytes(&data), Checksum::of_bytes(&copy));
    }

    #[test]
    fn one_byte_change_changes_digest(
        data in proptest::collection::vec(any::<u8>(), 1..4096),
        idx in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let mut other = data.clone();
        let i = idx.index(other.len());
        other[i] ^= flip;
        prop_assert_ne!(Checksum::of_bytes(&data), Checksum::of_bytes(&other));
    }
}
