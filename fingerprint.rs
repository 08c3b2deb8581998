//! Perceptual (average) hashing of image content.
//!
//! The image is shrunk to a `grid × grid` greyscale thumbnail and each cell
//! contributes one bit: set when the cell is at least as bright as the mean.
//! The packed bits are rendered as lowercase hex, most significant bit first,
//! so visually similar images differ in few hex nibbles.

use crate::error::FingerprintError;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

/// Prefix carried by fingerprints that are not derived from image content.
pub const VOLATILE_PREFIX: &str = "volatile-";

pub const DEFAULT_GRID_SIZE: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// False for the timestamp-derived fallback; such values must not be
    /// used as cache keys or compared for similarity.
    pub fn is_content_stable(&self) -> bool {
        !self.0.starts_with(VOLATILE_PREFIX)
    }

    /// Number of bits encoded by the hex digest.
    pub fn bit_len(&self) -> usize {
        self.0.len() * 4
    }

    /// A one-off fingerprint from the current time and a random salt. It
    /// never collides with a content digest because of its prefix.
    pub fn volatile() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let mut seed = Vec::with_capacity(32);
        seed.extend_from_slice(&nanos.to_le_bytes());
        seed.extend_from_slice(Uuid::new_v4().as_bytes());
        Self(format!("{VOLATILE_PREFIX}{:016x}", xxh3_64(&seed)))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FingerprintGenerator {
    grid: u32,
}

impl Default for FingerprintGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_GRID_SIZE)
    }
}

impl FingerprintGenerator {
    /// `grid` is clamped to `[2, 32]` and rounded down to even, so
    /// `grid * grid` bits always pack into whole hex nibbles.
    pub fn new(grid: u32) -> Self {
        Self {
            grid: grid.clamp(2, 32) & !1,
        }
    }

    pub fn grid(&self) -> u32 {
        self.grid
    }

    pub fn fingerprint(&self, bytes: &[u8]) -> Result<Fingerprint, FingerprintError> {
        let img = image::load_from_memory(bytes)?;
        self.fingerprint_image(&img)
    }

    /// Like [`fingerprint`](Self::fingerprint) but never fails; undecodable
    /// input yields a [`Fingerprint::volatile`] value.
    pub fn fingerprint_or_volatile(&self, bytes: &[u8]) -> Fingerprint {
        self.fingerprint(bytes).unwrap_or_else(|err| {
            log::warn!("Fingerprint fell back to a volatile value: {err}");
            Fingerprint::volatile()
        })
    }

    pub fn fingerprint_image(&self, img: &DynamicImage) -> Result<Fingerprint, FingerprintError> {
        let (w, h) = img.dimensions();
        if w == 0 || h == 0 {
            return Err(FingerprintError::EmptyImage);
        }
        let grey = img.to_luma8();
        let cells = image::imageops::resize(&grey, self.grid, self.grid, FilterType::Triangle);
        let values: Vec<u64> = cells.pixels().map(|p| p[0] as u64).collect();
        let count = values.len() as u64;
        let sum: u64 = values.iter().sum();
        // cell >= sum / count, kept in integers
        let bits: Vec<bool> = values.iter().map(|v| v * count >= sum).collect();
        Ok(Fingerprint(pack_hex(&bits)))
    }
}

fn pack_hex(bits: &[bool]) -> String {
    bits.chunks(4)
        .map(|nibble| {
            let mut value = 0u32;
            for (i, bit) in nibble.iter().enumerate() {
                if *bit {
                    value |= 1 << (3 - i);
                }
            }
            std::char::from_digit(value, 16).unwrap_or('0')
        })
        .collect()
}

/// Bitwise Hamming distance between two hex digests of equal length.
/// `None` when lengths differ or either side holds a non-hex character.
pub fn hamming_distance(a: &str, b: &str) -> Option<u32> {
    if a.len() != b.len() {
        return None;
    }
    a.chars().zip(b.chars()).try_fold(0u32, |acc, (x, y)| {
        let x = x.to_digit(16)?;
        let y = y.to_digit(16)?;
        Some(acc + (x ^ y).count_ones())
    })
}
