//! Short authentication strings for out-of-band key verification.
//!
//! Two people read a short emoji sequence to each other; if both devices
//! derived it from the same pair of public keys, they match. Keys are sorted
//! before hashing so both sides get the same sequence regardless of who is
//! "A" and who is "B".

use crate::error::CryptoError;
use crate::primitives::{self, PublicKey, DIGEST_SIZE};

/// Default number of symbols shown to users.
pub const DEFAULT_SYMBOL_COUNT: usize = veilbox_shared::constants::DEFAULT_SAS_SYMBOLS;

/// Each symbol consumes two digest bytes.
pub const MAX_SYMBOL_COUNT: usize = DIGEST_SIZE / 2;

/// Bytes of the digest kept for the hex key fingerprint.
const KEY_FINGERPRINT_BYTES: usize = 16;

/// Fixed symbol alphabet. Order is part of the protocol; never reorder.
pub const EMOJI_ALPHABET: [&str; 56] = [
    "🐶", "🐱", "🦁", "🐴", "🦄", "🐷", "🐘", "🐰", "🐼", "🐓", "🐧", "🐢", "🐟", "🐙",
    "🦋", "🌷", "🌳", "🌵", "🍄", "🌏", "🌙", "☁️", "🔥", "🍌", "🍎", "🍓", "🌽", "🍕",
    "🎂", "❤️", "😀", "🤖", "🎩", "👓", "🔧", "🎅", "👍", "☂️", "⌛", "⏰", "🎁", "💡",
    "📕", "✏️", "📎", "✂️", "🔒", "🔑", "🔨", "☎️", "🏁", "🚂", "🚲", "✈️", "🚀", "🏆",
];

/// A derived emoji sequence plus the key fingerprint it was computed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasFingerprint {
    indices: Vec<usize>,
    key_fingerprint: String,
}

impl SasFingerprint {
    pub fn symbols(&self) -> Vec<&'static str> {
        self.indices.iter().map(|&i| EMOJI_ALPHABET[i]).collect()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Uppercase hex fingerprint of the two public keys this sequence covers.
    pub fn key_fingerprint(&self) -> &str {
        &self.key_fingerprint
    }

    pub fn to_display_string(&self) -> String {
        self.symbols().join(" ")
    }
}

/// Outcome of comparing two symbol sequences.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequenceComparison {
    pub matches: bool,
    /// Fraction of positions that agree; 0.0 when lengths differ.
    pub confidence: f64,
}

/// Derive the default-length emoji sequence for two public keys.
pub fn derive_fingerprint(
    public_key_a: &PublicKey,
    public_key_b: &PublicKey,
    session_context: Option<&str>,
) -> SasFingerprint {
    derive_indices(public_key_a, public_key_b, session_context, DEFAULT_SYMBOL_COUNT)
}

/// Like [`derive_fingerprint`] with a caller-chosen length in `1..=32`.
pub fn derive_fingerprint_with_length(
    public_key_a: &PublicKey,
    public_key_b: &PublicKey,
    session_context: Option<&str>,
    symbol_count: usize,
) -> Result<SasFingerprint, CryptoError> {
    if symbol_count == 0 || symbol_count > MAX_SYMBOL_COUNT {
        return Err(CryptoError::InvalidKey(format!(
            "SAS length must be between 1 and {MAX_SYMBOL_COUNT}, got {symbol_count}"
        )));
    }
    Ok(derive_indices(
        public_key_a,
        public_key_b,
        session_context,
        symbol_count,
    ))
}

/// Uppercase hex of the first 16 bytes of `hash(sorted keys)`; used to detect
/// silent key changes between sessions.
pub fn derive_key_fingerprint(public_key_a: &PublicKey, public_key_b: &PublicKey) -> String {
    let digest = primitives::hash(&sorted_concat(public_key_a, public_key_b));
    digest[..KEY_FINGERPRINT_BYTES]
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect()
}

pub fn compare_sequences(a: &[&str], b: &[&str]) -> SequenceComparison {
    if a.len() != b.len() || a.is_empty() {
        return SequenceComparison {
            matches: false,
            confidence: 0.0,
        };
    }
    let agreeing = a.iter().zip(b).filter(|(x, y)| x == y).count();
    SequenceComparison {
        matches: agreeing == a.len(),
        confidence: agreeing as f64 / a.len() as f64,
    }
}

fn derive_indices(
    public_key_a: &PublicKey,
    public_key_b: &PublicKey,
    session_context: Option<&str>,
    symbol_count: usize,
) -> SasFingerprint {
    let mut input = sorted_concat(public_key_a, public_key_b);
    if let Some(context) = session_context {
        input.extend_from_slice(context.as_bytes());
    }
    let digest = primitives::hash(&input);

    let indices = (0..symbol_count)
        .map(|i| {
            let value = u16::from_be_bytes([digest[2 * i], digest[2 * i + 1]]);
            value as usize % EMOJI_ALPHABET.len()
        })
        .collect();

    SasFingerprint {
        indices,
        key_fingerprint: derive_key_fingerprint(public_key_a, public_key_b),
    }
}

fn sorted_concat(a: &PublicKey, b: &PublicKey) -> Vec<u8> {
    let (first, second) = if a.as_bytes() <= b.as_bytes() {
        (a, b)
    } else {
        (b, a)
    };
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(first.as_bytes());
    out.extend_from_slice(second.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::KeyPair;
    use std::collections::HashSet;

    fn public() -> PublicKey {
        KeyPair::generate().unwrap().public
    }

    #[test]
    fn alphabet_has_no_duplicates() {
        let unique: HashSet<_> = EMOJI_ALPHABET.iter().collect();
        assert_eq!(unique.len(), EMOJI_ALPHABET.len());
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let (a, b) = (public(), public());
        assert_eq!(
            derive_fingerprint(&a, &b, Some("session-42")),
            derive_fingerprint(&b, &a, Some("session-42"))
        );
        assert_eq!(derive_key_fingerprint(&a, &b), derive_key_fingerprint(&b, &a));
    }

    #[test]
    fn default_length_is_five_symbols_from_alphabet() {
        let fp = derive_fingerprint(&public(), &public(), Some("session-42"));
        assert_eq!(fp.len(), 5);
        for symbol in fp.symbols() {
            assert!(EMOJI_ALPHABET.contains(&symbol));
        }
    }

    #[test]
    fn session_context_changes_sequence() {
        let (a, b) = (public(), public());
        let x = derive_fingerprint_with_length(&a, &b, Some("one"), 16).unwrap();
        let y = derive_fingerprint_with_length(&a, &b, Some("two"), 16).unwrap();
        assert_ne!(x.indices(), y.indices());
        // The key fingerprint ignores the session context.
        assert_eq!(x.key_fingerprint(), y.key_fingerprint());
    }

    #[test]
    fn single_byte_mutation_changes_sequence() {
        let mut samples = 0;
        let mut changed = 0;
        for _ in 0..8 {
            let a = public();
            let b = public();
            let base = derive_fingerprint(&a, &b, Some("session-42"));
            assert_eq!(base.len(), DEFAULT_SYMBOL_COUNT);

            for i in 0..32 {
                let mut mutated_a = *a.as_bytes();
                mutated_a[i] ^= 0x01;
                let mut mutated_b = *b.as_bytes();
                mutated_b[i] ^= 0x80;

                for fp in [
                    derive_fingerprint(&PublicKey::from_bytes(mutated_a), &b, Some("session-42")),
                    derive_fingerprint(&a, &PublicKey::from_bytes(mutated_b), Some("session-42")),
                ] {
                    samples += 1;
                    if fp.indices() != base.indices() {
                        changed += 1;
                    }
                }
            }
        }
        assert!(changed * 100 >= samples * 99, "{changed}/{samples} sequences changed");
    }

    #[test]
    fn reduction_follows_big_endian_pairs() {
        let a = PublicKey::from_bytes([1u8; 32]);
        let b = PublicKey::from_bytes([2u8; 32]);
        let mut input = Vec::new();
        input.extend_from_slice(a.as_bytes());
        input.extend_from_slice(b.as_bytes());
        input.extend_from_slice(b"ctx");
        let digest = primitives::hash(&input);

        let fp = derive_fingerprint(&b, &a, Some("ctx"));
        let expected: Vec<usize> = (0..5)
            .map(|i| u16::from_be_bytes([digest[2 * i], digest[2 * i + 1]]) as usize % 56)
            .collect();
        assert_eq!(fp.indices(), expected.as_slice());
    }

    #[test]
    fn key_fingerprint_is_32_uppercase_hex_chars() {
        let fp = derive_key_fingerprint(&public(), &public());
        assert_eq!(fp.len(), 32);
        assert!(fp
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
    }

    #[test]
    fn length_bounds_are_enforced() {
        let (a, b) = (public(), public());
        assert!(derive_fingerprint_with_length(&a, &b, None, 0).is_err());
        assert!(derive_fingerprint_with_length(&a, &b, None, 33).is_err());
        assert_eq!(
            derive_fingerprint_with_length(&a, &b, None, 32).unwrap().len(),
            32
        );
    }

    #[test]
    fn compare_sequences_reports_partial_agreement() {
        let full = compare_sequences(&["🐶", "🐱", "🦁"], &["🐶", "🐱", "🦁"]);
        assert!(full.matches);
        assert_eq!(full.confidence, 1.0);

        let partial = compare_sequences(&["🐶", "🐱", "🦁", "🐴"], &["🐶", "🐱", "🦁", "🐷"]);
        assert!(!partial.matches);
        assert_eq!(partial.confidence, 0.75);

        let mismatched_len = compare_sequences(&["🐶"], &["🐶", "🐱"]);
        assert!(!mismatched_len.matches);
        assert_eq!(mismatched_len.confidence, 0.0);
    }

    #[test]
    fn display_string_joins_symbols() {
        let fp = derive_fingerprint(&public(), &public(), None);
        assert_eq!(fp.to_display_string().split(' ').count(), 5);
    }
}
