use crate::crypto::fill_random;
use crate::kdf::KdfParams;
use crate::vault::{self, WrappedPrivateKey};
use crate::{Error, IdentityKeyPair};
use bip39::{Language, Mnemonic};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// Number of words in a recovery phrase.
pub const WORD_COUNT: usize = 24;

const ENTROPY_BYTES: usize = 32;

/// A 24-word BIP39 phrase that can unlock the private key when the password
/// is lost.
///
/// The normalized phrase is used as the password of a second vault record
/// for the same private key. Show it to the user once; never log or store it.
pub struct RecoveryPhrase {
    phrase: Zeroizing<String>,
}

impl RecoveryPhrase {
    /// Draws 256 bits of entropy from the OS CSPRNG.
    pub fn generate() -> Result<Self, Error> {
        let mut entropy = [0u8; ENTROPY_BYTES];
        fill_random(&mut entropy)?;

        let mnemonic = Mnemonic::from_entropy(&entropy);
        entropy.zeroize();
        let mnemonic = mnemonic
            .map_err(|err| Error::KeyGeneration(format!("Failed to generate phrase: {err}")))?;

        Ok(Self {
            phrase: Zeroizing::new(mnemonic.to_string()),
        })
    }

    /// Parses a phrase as a user typed it.
    ///
    /// Case and surrounding or repeated whitespace are ignored. Anything but 24
    /// valid English words with a correct checksum is rejected.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let normalized = Zeroizing::new(
            input
                .split_whitespace()
                .map(str::to_lowercase)
                .collect::<Vec<_>>()
                .join(" "),
        );

        let mnemonic = Mnemonic::parse_in_normalized(Language::English, &normalized)
            .map_err(|_| Error::RecoveryPhrase)?;
        if mnemonic.word_count() != WORD_COUNT {
            return Err(Error::RecoveryPhrase);
        }

        Ok(Self { phrase: normalized })
    }

    /// The phrase, words separated by single spaces. Only for display.
    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    pub fn words(&self) -> Vec<&str> {
        self.phrase.split(' ').collect()
    }

    /// Whether `word` is in the BIP39 English word list.
    pub fn is_valid_word(word: &str) -> bool {
        let word = word.to_lowercase();
        Language::English.word_list().contains(&word.as_str())
    }

    /// Seals `identity` under this phrase.
    pub fn seal(
        &self,
        identity: &IdentityKeyPair,
        kdf: KdfParams,
        salt_len: usize,
    ) -> Result<WrappedPrivateKey, Error> {
        vault::seal_with_password(identity, &self.phrase, kdf, salt_len)
    }

    /// Opens a record sealed with [`RecoveryPhrase::seal`].
    ///
    /// A different phrase fails like a wrong password, with
    /// [`Error::Decryption`].
    pub fn open(&self, record: &WrappedPrivateKey) -> Result<IdentityKeyPair, Error> {
        vault::open_with_password(record, &self.phrase)
    }
}

impl fmt::Debug for RecoveryPhrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryPhrase(***)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::MIN_SALT_LEN;

    #[test]
    fn test_generated_phrase_has_24_words() {
        let phrase = RecoveryPhrase::generate().unwrap();

        assert_eq!(phrase.words().len(), WORD_COUNT);
        assert!(phrase.words().iter().all(|word| RecoveryPhrase::is_valid_word(word)));
        assert_ne!(phrase.phrase(), RecoveryPhrase::generate().unwrap().phrase());
    }

    #[test]
    fn test_parse_normalizes_user_input() {
        let phrase = RecoveryPhrase::generate().unwrap();
        let sloppy = format!("  {}  ", phrase.phrase().to_uppercase().replace(' ', "   "));

        let parsed = RecoveryPhrase::parse(&sloppy).unwrap();
        assert_eq!(parsed.phrase(), phrase.phrase());
    }

    #[test]
    fn test_parse_rejects_bad_phrases() {
        let phrase = RecoveryPhrase::generate().unwrap();
        let words = phrase.words();

        let short = words[..12].join(" ");
        assert_eq!(RecoveryPhrase::parse(&short).unwrap_err(), Error::RecoveryPhrase);

        let mut unknown = words;
        unknown[3] = "notaword";
        assert_eq!(
            RecoveryPhrase::parse(&unknown.join(" ")).unwrap_err(),
            Error::RecoveryPhrase
        );

        assert_eq!(RecoveryPhrase::parse("").unwrap_err(), Error::RecoveryPhrase);
    }

    #[test]
    fn test_phrase_unlocks_the_identity() {
        let identity = IdentityKeyPair::generate().unwrap();
        let phrase = RecoveryPhrase::generate().unwrap();
        let record = phrase.seal(&identity, KdfParams::default(), MIN_SALT_LEN).unwrap();

        let reparsed = RecoveryPhrase::parse(phrase.phrase()).unwrap();
        assert_eq!(reparsed.open(&record).unwrap().public_key(), identity.public_key());

        let other = RecoveryPhrase::generate().unwrap();
        assert_eq!(other.open(&record).unwrap_err(), Error::Decryption);
    }

    #[test]
    fn test_debug_hides_the_phrase() {
        let phrase = RecoveryPhrase::generate().unwrap();
        let debug = format!("{phrase:?}");

        assert_eq!(debug, "RecoveryPhrase(***)");
        assert!(!debug.contains(phrase.words()[0]));
    }
}
