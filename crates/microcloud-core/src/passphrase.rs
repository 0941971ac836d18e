//! Passphrase generation for trust establishment sessions.
//!
//! A passphrase is four words drawn from the embedded wordlist and joined
//! with single spaces. It is transferred out-of-band (read aloud, copied)
//! and feeds the HMAC key derivation in [`crate::auth`].

use thiserror::Error;

/// Embedded wordlist, one `"<index>\t<word>"` entry per line.
const WORDLIST: &str = include_str!("wordlist.txt");

/// Number of words in a passphrase.
const PASSPHRASE_WORDS: usize = 4;

#[derive(Debug, Error)]
pub enum PassphraseError {
    #[error("Invalid wordlist line: {0:?}")]
    InvalidLine(String),
    #[error("Wordlist is empty")]
    EmptyWordlist,
}

/// Generate a four-word passphrase from the embedded wordlist.
///
/// Uses cryptographically secure randomness (`rand::rng()` is a CSPRNG).
/// Each word is drawn independently and uniformly, so the passphrase
/// carries `4 * log2(N)` bits of entropy for an `N`-entry wordlist.
pub fn generate() -> Result<String, PassphraseError> {
    use rand::Rng;

    let lines: Vec<&str> = WORDLIST.lines().collect();
    if lines.is_empty() {
        return Err(PassphraseError::EmptyWordlist);
    }

    let mut rng = rand::rng();
    let mut words = Vec::with_capacity(PASSPHRASE_WORDS);
    for _ in 0..PASSPHRASE_WORDS {
        let line = lines[rng.random_range(0..lines.len())];
        let (_, word) = line
            .split_once('\t')
            .ok_or_else(|| PassphraseError::InvalidLine(line.to_string()))?;
        if word.is_empty() {
            return Err(PassphraseError::InvalidLine(line.to_string()));
        }

        words.push(word);
    }

    Ok(words.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_four_words_joined_by_spaces() {
        let passphrase = generate().unwrap();
        let words: Vec<&str> = passphrase.split(' ').collect();

        assert_eq!(words.len(), PASSPHRASE_WORDS);
        for word in words {
            assert!(!word.is_empty());
            assert!(word.chars().all(|c| c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn test_words_come_from_wordlist() {
        let known: HashSet<&str> = WORDLIST
            .lines()
            .map(|line| line.split_once('\t').unwrap().1)
            .collect();

        let passphrase = generate().unwrap();
        for word in passphrase.split(' ') {
            assert!(known.contains(word), "unknown word {word:?}");
        }
    }

    #[test]
    fn test_wordlist_is_well_formed() {
        let mut seen = HashSet::new();
        for line in WORDLIST.lines() {
            let (index, word) = line.split_once('\t').expect("line must contain a tab");
            index.parse::<usize>().expect("index must be numeric");
            assert!(!word.is_empty());
            assert!(seen.insert(word), "duplicate word {word:?}");
        }
        // Four draws from anything smaller would make passphrases guessable.
        assert!(seen.len() >= 1024, "wordlist too small: {}", seen.len());
    }

    #[test]
    fn test_generated_passphrases_differ() {
        // With >=1024 words the chance of two identical passphrases is
        // negligible; a repeat here would point at a broken RNG.
        let a = generate().unwrap();
        let b = generate().unwrap();
        assert_ne!(a, b);
    }
}
