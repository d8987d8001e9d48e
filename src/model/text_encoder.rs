use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::math::matrix::Matrix;

/// Bag-of-words text encoder with hashed, seeded token embeddings.
///
/// Each lowercase word maps to a fixed Gaussian vector (seeded by the FNV-1a
/// hash of the word); a sentence is the mean of its word vectors. Two texts
/// sharing words therefore share direction, which is all the caption branch
/// needs to compare a caption against "A photo of {class}".
#[derive(Debug, Clone)]
pub struct HashedTextEncoder {
    pub dim: usize,
    pub seed: u64,
}

impl HashedTextEncoder {
    pub fn new(dim: usize, seed: u64) -> Self {
        HashedTextEncoder { dim, seed }
    }

    /// Splits on anything that is not alphanumeric (so `a_photo_of_a` is four
    /// tokens) and lowercases.
    pub fn tokenize(text: &str) -> Vec<String> {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect()
    }

    pub fn token_embedding(&self, token: &str) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(fnv1a(token.as_bytes()) ^ self.seed);
        let scale = 1.0 / (self.dim as f64).sqrt();
        Matrix::gaussian(1, self.dim, scale, &mut rng).data.remove(0)
    }

    /// Mean token embedding; all zeros for text without tokens.
    pub fn encode(&self, text: &str) -> Vec<f64> {
        let tokens = Self::tokenize(text);
        let mut acc = vec![0.0; self.dim];
        if tokens.is_empty() {
            return acc;
        }
        for token in &tokens {
            for (a, x) in acc.iter_mut().zip(self.token_embedding(token)) {
                *a += x;
            }
        }
        let inv = 1.0 / tokens.len() as f64;
        acc.iter_mut().for_each(|a| *a *= inv);
        acc
    }

    pub fn encode_batch(&self, texts: &[String]) -> Matrix {
        Matrix {
            rows: texts.len(),
            cols: self.dim,
            data: texts.iter().map(|t| self.encode(t)).collect(),
        }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::matrix::{dot, normalize};

    #[test]
    fn tokenizer_splits_underscores_and_case() {
        assert_eq!(HashedTextEncoder::tokenize("A_photo of-a Dog"), vec!["a", "photo", "of", "a", "dog"]);
    }

    #[test]
    fn encoding_is_deterministic() {
        let enc = HashedTextEncoder::new(16, 7);
        assert_eq!(enc.encode("a goldfish"), enc.encode("a goldfish"));
    }

    #[test]
    fn shared_words_are_more_similar() {
        let enc = HashedTextEncoder::new(512, 3);
        let caption = normalize(&enc.encode("a photo of a goldfish in water"));
        let right = normalize(&enc.encode("A photo of goldfish"));
        let wrong = normalize(&enc.encode("A photo of tractor"));
        assert!(dot(&caption, &right) > dot(&caption, &wrong));
    }
}
