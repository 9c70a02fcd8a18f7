//! Bloom filter unit tests: membership, sizing, serialization.

use super::*;

#[test]
fn inserted_keys_are_always_maybe_present() {
    let mut bloom = BloomFilter::with_capacity(100);
    for i in 0..100 {
        bloom.insert(format!("key-{i}").as_bytes());
    }
    // No false negatives, ever.
    for i in 0..100 {
        assert!(bloom.may_contain(format!("key-{i}").as_bytes()));
    }
}

#[test]
fn absent_keys_are_mostly_excluded() {
    let mut bloom = BloomFilter::with_capacity(1000);
    for i in 0..1000 {
        bloom.insert(format!("member-{i}").as_bytes());
    }

    let false_positives = (0..1000)
        .filter(|i| bloom.may_contain(format!("outsider-{i}").as_bytes()))
        .count();

    // 10 bits/key with k=3 lands well under a 5% false positive rate;
    // allow generous slack to keep the test deterministic-in-practice.
    assert!(
        false_positives < 100,
        "false positive rate too high: {false_positives}/1000"
    );
}

#[test]
fn empty_filter_excludes_everything() {
    let bloom = BloomFilter::with_capacity(10);
    assert!(!bloom.may_contain(b"anything"));
}

#[test]
fn sizing_heuristic_is_word_aligned_with_floor() {
    // Tiny filters clamp to the 64-bit floor.
    assert_eq!(BloomFilter::with_capacity(0).bit_count(), 64);
    assert_eq!(BloomFilter::with_capacity(3).bit_count(), 64);

    // 100 keys → 1000 bits → rounded up to 1024.
    assert_eq!(BloomFilter::with_capacity(100).bit_count(), 1024);
    assert_eq!(BloomFilter::with_capacity(100).num_hashes(), 3);
}

#[test]
fn serialization_round_trip() {
    let mut bloom = BloomFilter::with_capacity(50);
    for i in 0..50 {
        bloom.insert(format!("k{i}").as_bytes());
    }

    let bytes = bloom.to_bytes();
    let decoded = BloomFilter::from_bytes(&bytes).unwrap();

    assert_eq!(decoded, bloom);
    for i in 0..50 {
        assert!(decoded.may_contain(format!("k{i}").as_bytes()));
    }
}

#[test]
fn serialized_layout_prefix() {
    let bloom = BloomFilter::with_capacity(1);
    let bytes = bloom.to_bytes();

    assert_eq!(u64::from_le_bytes(bytes[0..8].try_into().unwrap()), 3);
    assert_eq!(u64::from_le_bytes(bytes[8..16].try_into().unwrap()), 64);
    assert_eq!(bytes.len(), 16 + 8);
}

#[test]
fn decode_rejects_truncated_input() {
    let bloom = BloomFilter::with_capacity(10);
    let bytes = bloom.to_bytes();

    assert!(matches!(
        BloomFilter::from_bytes(&bytes[..10]),
        Err(BloomError::Truncated(_))
    ));
    assert!(matches!(
        BloomFilter::from_bytes(&bytes[..bytes.len() - 1]),
        Err(BloomError::Truncated(_))
    ));
}

#[test]
fn decode_rejects_bad_parameters() {
    let mut bytes = BloomFilter::with_capacity(10).to_bytes();
    bytes[8..16].copy_from_slice(&0u64.to_le_bytes()); // bit_count = 0
    assert!(matches!(
        BloomFilter::from_bytes(&bytes),
        Err(BloomError::InvalidParameters)
    ));
}
