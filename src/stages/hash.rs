//! Hashing and deduplication stages
//!
//! Perceptual hash (8x8 average hash), Merkle tree over the file bytes,
//! exact-dedup key emission, and simhash-based near-dedup.

use super::results::{put_str8, StageStatus};
use super::{StageContext, StageOutcome};
use crate::abi::ContentKind;
use sha2::{Digest, Sha256};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Merkle leaf size
const MERKLE_LEAF_BYTES: usize = 4096;

// ---------------------------------------------------------------------------
// Perceptual hash
// ---------------------------------------------------------------------------

/// 8x8 average hash of the decoded image: grayscale, resize to 8x8, threshold
/// against the mean, row-major bit order. Payload: str8, 16 hex chars.
pub fn perceptual_hash(ctx: &StageContext<'_>) -> StageOutcome {
    if ctx.kind != ContentKind::Image {
        return StageOutcome::DependencyUnmet;
    }
    let hash = match average_hash(ctx.data) {
        Some(h) => h,
        None => return StageOutcome::Field(StageStatus::Failed, Vec::new()),
    };
    let mut out = Vec::new();
    put_str8(&mut out, &format!("{:016x}", hash));
    StageOutcome::Field(StageStatus::Ok, out)
}

fn average_hash(data: &[u8]) -> Option<u64> {
    let img = image::load_from_memory(data).ok()?;
    let gray = img.to_luma8();
    let small = image::imageops::resize(&gray, 8, 8, image::imageops::FilterType::Triangle);
    let pixels: Vec<u64> = small.pixels().map(|p| p.0[0] as u64).collect();
    let mean = pixels.iter().sum::<u64>() / 64;
    let mut bits = 0u64;
    for (i, &p) in pixels.iter().enumerate() {
        if p > mean {
            bits |= 1 << (63 - i);
        }
    }
    Some(bits)
}

// ---------------------------------------------------------------------------
// Merkle proof
// ---------------------------------------------------------------------------

/// Merkle root over the file: 4 KiB leaves, SHA-256 nodes, parent = hash of
/// the big-endian concatenation of its children, odd node duplicated at each
/// level. Payload: str8, 64 hex chars.
pub fn merkle_root(ctx: &StageContext<'_>) -> StageOutcome {
    let root = compute_merkle_root(ctx.data);
    let mut out = Vec::new();
    put_str8(&mut out, &root);
    StageOutcome::Field(StageStatus::Ok, out)
}

pub fn compute_merkle_root(data: &[u8]) -> String {
    let mut level: Vec<[u8; 32]> = if data.is_empty() {
        vec![Sha256::digest([]).into()]
    } else {
        data.chunks(MERKLE_LEAF_BYTES)
            .map(|leaf| Sha256::digest(leaf).into())
            .collect()
    };

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = *level.last().unwrap();
            level.push(last);
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut h = Sha256::new();
                h.update(pair[0]);
                h.update(pair[1]);
                h.finalize().into()
            })
            .collect();
    }

    let mut hex = String::with_capacity(64);
    for b in level[0] {
        hex.push_str(&format!("{:02x}", b));
    }
    hex
}

// ---------------------------------------------------------------------------
// Exact dedup
// ---------------------------------------------------------------------------

/// Emits the content-hash dedup key. Cross-document resolution happens in the
/// caches and downstream tooling; the stage itself holds no shared state.
/// Payload: str8, 64 hex chars.
pub fn exact_dedup(ctx: &StageContext<'_>) -> StageOutcome {
    if ctx.content_hash.len() != 64 {
        return StageOutcome::Field(StageStatus::Failed, Vec::new());
    }
    let mut out = Vec::new();
    put_str8(&mut out, ctx.content_hash);
    StageOutcome::Field(StageStatus::Ok, out)
}

// ---------------------------------------------------------------------------
// Near dedup
// ---------------------------------------------------------------------------

/// 64-bit simhash over word 3-shingles. Near-duplicate documents land within
/// a small Hamming distance of each other. Payload: str8, 16 hex chars.
pub fn near_dedup(text: &str) -> Result<Vec<u8>, String> {
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();
    if words.is_empty() {
        return Err("no words".into());
    }

    let mut weights = [0i64; 64];
    let shingle_count = words.len().saturating_sub(2).max(1);
    for i in 0..shingle_count {
        let end = (i + 3).min(words.len());
        let shingle = words[i..end].join(" ");
        let mut hasher = DefaultHasher::new();
        shingle.hash(&mut hasher);
        let h = hasher.finish();
        for (bit, weight) in weights.iter_mut().enumerate() {
            if h & (1 << bit) != 0 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    }

    let mut sim = 0u64;
    for (bit, &weight) in weights.iter().enumerate() {
        if weight > 0 {
            sim |= 1 << bit;
        }
    }

    let mut out = Vec::new();
    put_str8(&mut out, &format!("{:016x}", sim));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::results::get_str8;

    #[test]
    fn merkle_single_leaf_equals_plain_hash() {
        let data = b"small document";
        let root = compute_merkle_root(data);
        let mut expected = String::new();
        for b in Sha256::digest(data) {
            expected.push_str(&format!("{:02x}", b));
        }
        assert_eq!(root, expected);
    }

    #[test]
    fn merkle_two_leaves_hash_concatenation() {
        let data = vec![0xAAu8; MERKLE_LEAF_BYTES + 10];
        let left: [u8; 32] = Sha256::digest(&data[..MERKLE_LEAF_BYTES]).into();
        let right: [u8; 32] = Sha256::digest(&data[MERKLE_LEAF_BYTES..]).into();
        let mut h = Sha256::new();
        h.update(left);
        h.update(right);
        let parent: [u8; 32] = h.finalize().into();
        let mut expected = String::new();
        for b in parent {
            expected.push_str(&format!("{:02x}", b));
        }
        assert_eq!(compute_merkle_root(&data), expected);
    }

    #[test]
    fn merkle_odd_leaf_duplicated() {
        // Three leaves: root = H(H(l0|l1) | H(l2|l2))
        let data = vec![7u8; MERKLE_LEAF_BYTES * 2 + 1];
        let l: Vec<[u8; 32]> = data
            .chunks(MERKLE_LEAF_BYTES)
            .map(|c| Sha256::digest(c).into())
            .collect();
        let pair = |a: [u8; 32], b: [u8; 32]| -> [u8; 32] {
            let mut h = Sha256::new();
            h.update(a);
            h.update(b);
            h.finalize().into()
        };
        let root = pair(pair(l[0], l[1]), pair(l[2], l[2]));
        let mut expected = String::new();
        for b in root {
            expected.push_str(&format!("{:02x}", b));
        }
        assert_eq!(compute_merkle_root(&data), expected);
    }

    #[test]
    fn merkle_deterministic_and_input_sensitive() {
        assert_eq!(compute_merkle_root(b"abc"), compute_merkle_root(b"abc"));
        assert_ne!(compute_merkle_root(b"abc"), compute_merkle_root(b"abd"));
        assert_eq!(compute_merkle_root(b"").len(), 64);
    }

    #[test]
    fn simhash_similar_texts_are_close() {
        let a = payload_hash(near_dedup("the quick brown fox jumps over the lazy dog today").unwrap());
        let b = payload_hash(near_dedup("the quick brown fox jumps over the lazy cat today").unwrap());
        let c = payload_hash(near_dedup("completely unrelated text about maritime law precedent").unwrap());
        let near = (a ^ b).count_ones();
        let far = (a ^ c).count_ones();
        assert!(near < far, "near={} far={}", near, far);
    }

    fn payload_hash(payload: Vec<u8>) -> u64 {
        let mut at = 0;
        u64::from_str_radix(&get_str8(&payload, &mut at).unwrap(), 16).unwrap()
    }

    #[test]
    fn average_hash_from_png() {
        // 64x64 half-black half-white image through the real encoder
        let mut img = image::GrayImage::new(64, 64);
        for (x, _y, p) in img.enumerate_pixels_mut() {
            p.0[0] = if x < 32 { 0 } else { 255 };
        }
        let mut png = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let hash = average_hash(&png).unwrap();
        // Right half above mean: each row contributes 4 set bits
        assert_eq!(hash.count_ones(), 32);
    }
}
