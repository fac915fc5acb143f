//! Core memory engine — storage, extraction, graph, recall, consolidation,
//! lifecycle, and derived operations.
//!
//! The write path lives in [`store`], the read path in [`recall`], the edge
//! graph and spreading activation in [`graph`], rule-based extraction in
//! [`extract`], the merge/contradiction cycle in [`consolidate`], decay and
//! archival in [`lifecycle`], and the compositions (briefing, surface, ask,
//! alerts) in [`ops`]. Type definitions live in [`types`].

pub mod consolidate;
pub mod extract;
pub mod forget;
pub mod graph;
pub mod lifecycle;
pub mod ops;
pub mod recall;
pub mod stats;
pub mod store;
pub mod types;

/// Convert an f32 embedding slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            embedding.len() * std::mem::size_of::<f32>(),
        )
    }
}

/// Convert raw bytes back to an f32 embedding.
pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect()
}

/// Convert a cosine similarity threshold to L2 distance threshold.
///
/// sqlite-vec defaults to L2 distance. For L2-normalized vectors:
///   L2_dist = sqrt(2 * (1 - cosine_similarity))
pub fn cosine_threshold_to_l2(cosine_threshold: f64) -> f64 {
    (2.0 * (1.0 - cosine_threshold)).sqrt()
}

/// Cosine similarity from an L2 distance between normalized vectors.
pub fn l2_to_cosine(distance: f64) -> f64 {
    1.0 - (distance * distance) / 2.0
}

/// Jaccard similarity of two string sets.
pub fn jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let set_a: std::collections::HashSet<&str> = a.iter().map(|s| s.as_str()).collect();
    let set_b: std::collections::HashSet<&str> = b.iter().map(|s| s.as_str()).collect();
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Truncate content to max_chars, appending "..." if truncated.
pub fn truncate_preview(content: &str, max_chars: usize) -> String {
    if content.len() <= max_chars {
        content.to_string()
    } else {
        let end = content
            .char_indices()
            .take_while(|(i, _)| *i < max_chars)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(max_chars);
        format!("{}...", &content[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_byte_round_trip() {
        let v = vec![0.5f32, -1.0, 0.25];
        let bytes = embedding_to_bytes(&v).to_vec();
        assert_eq!(bytes_to_embedding(&bytes), v);
    }

    #[test]
    fn cosine_l2_conversions_agree() {
        let d = cosine_threshold_to_l2(0.85);
        assert!((l2_to_cosine(d) - 0.85).abs() < 1e-9);
    }

    #[test]
    fn jaccard_basics() {
        let a = vec!["priya".to_string(), "atlas".to_string()];
        let b = vec!["atlas".to_string(), "ml".to_string()];
        assert!((jaccard(&a, &b) - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(jaccard(&[], &[]), 0.0);
        assert!((jaccard(&a, &a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn truncate_preserves_short_content() {
        assert_eq!(truncate_preview("short", 80), "short");
        assert!(truncate_preview(&"a".repeat(100), 80).ends_with("..."));
    }
}
