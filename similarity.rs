use crate::fingerprint::{hamming_distance, Fingerprint, FingerprintGenerator};

/// Scores two images by the Hamming distance of their perceptual hashes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimilarityComparator {
    fingerprints: FingerprintGenerator,
}

impl SimilarityComparator {
    pub fn new(fingerprints: FingerprintGenerator) -> Self {
        Self { fingerprints }
    }

    /// `1 - distance / bits`, in `[0, 1]`. Any failure scores `0`.
    pub fn similarity(&self, a: &[u8], b: &[u8]) -> f64 {
        let (fa, fb) = match (self.fingerprints.fingerprint(a), self.fingerprints.fingerprint(b)) {
            (Ok(fa), Ok(fb)) => (fa, fb),
            (Err(err), _) | (_, Err(err)) => {
                log::warn!("Similarity scored 0; fingerprint failed: {err}");
                return 0.0;
            }
        };
        fingerprint_similarity(&fa, &fb).unwrap_or(0.0)
    }
}

/// `None` when either side is volatile or the digests are incomparable.
pub fn fingerprint_similarity(a: &Fingerprint, b: &Fingerprint) -> Option<f64> {
    if !a.is_content_stable() || !b.is_content_stable() {
        return None;
    }
    let bits = a.bit_len();
    if bits == 0 {
        return None;
    }
    let distance = hamming_distance(a.as_str(), b.as_str())?;
    Some(1.0 - distance as f64 / bits as f64)
}
