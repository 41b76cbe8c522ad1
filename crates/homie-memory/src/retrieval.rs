//! Rank fusion for hybrid retrieval.
//!
//! FTS and vector search each produce a ranked id list; reciprocal rank
//! fusion combines them, and a recency term keeps fresh memories competitive
//! even when their lexical match is weak.

use std::collections::HashMap;

use homie_core::config::RetrievalConfig;

/// score = fts_weight * 1/(k + fts_rank)
///       + vec_weight * 1/(k + vec_rank)
///       + recency_weight * exp(-age_days / half_life_days)
///
/// Ranks are 1-based; an id absent from a list contributes nothing for that
/// list. Returns ids sorted by descending score.
pub fn fuse_ranks(
    fts_ranked: &[i64],
    vec_ranked: &[i64],
    age_days: &HashMap<i64, f64>,
    cfg: &RetrievalConfig,
) -> Vec<(i64, f64)> {
    let mut scores: HashMap<i64, f64> = HashMap::new();

    for (i, id) in fts_ranked.iter().enumerate() {
        *scores.entry(*id).or_insert(0.0) += cfg.fts_weight / (cfg.rrf_k + (i + 1) as f64);
    }
    for (i, id) in vec_ranked.iter().enumerate() {
        *scores.entry(*id).or_insert(0.0) += cfg.vec_weight / (cfg.rrf_k + (i + 1) as f64);
    }
    for (id, score) in scores.iter_mut() {
        if let Some(age) = age_days.get(id) {
            *score += cfg.recency_weight * (-age / cfg.half_life_days).exp();
        }
    }

    let mut out: Vec<(i64, f64)> = scores.into_iter().collect();
    out.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    out
}

/// Cosine similarity; 0.0 when either vector is empty, zero, or lengths differ.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Encode an embedding as little-endian f32 bytes for BLOB storage.
pub fn encode_embedding(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

/// Decode a BLOB back to f32s. Trailing partial chunks are dropped.
pub fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> RetrievalConfig {
        RetrievalConfig {
            rrf_k: 60.0,
            fts_weight: 1.0,
            vec_weight: 1.0,
            recency_weight: 0.0,
            half_life_days: 30.0,
        }
    }

    #[test]
    fn item_in_both_lists_wins() {
        let fused = fuse_ranks(&[1, 2, 3], &[2, 4], &HashMap::new(), &cfg());
        assert_eq!(fused[0].0, 2);
    }

    #[test]
    fn recency_breaks_ties() {
        let mut cfg = cfg();
        cfg.recency_weight = 1.0;
        let mut ages = HashMap::new();
        ages.insert(1, 100.0);
        ages.insert(2, 0.5);
        // Same rank position in disjoint lists; the fresher one wins.
        let fused = fuse_ranks(&[1], &[2], &ages, &cfg);
        assert_eq!(fused[0].0, 2);
    }

    #[test]
    fn cosine_identity_and_orthogonal() {
        assert!((cosine(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine(&[], &[]), 0.0);
        assert_eq!(cosine(&[1.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn embedding_roundtrip() {
        let v = vec![0.1f32, -2.5, 1000.0];
        assert_eq!(decode_embedding(&encode_embedding(&v)), v);
    }
}
