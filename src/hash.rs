//! Content fingerprints for blocks and documents.
//!
//! [`ContentHash`] is a 32-bit FNV-1a digest folded over the UTF-16 code units of a string and
//! rendered as 8 lowercase hex digits. It is an identity and change-detection primitive, not a
//! cryptographic one: collisions are possible and simply cause a block to be mis-identified.

use crate::error::SupertagError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ContentHash(pub u32);

impl ContentHash {
    pub fn of(text: &str) -> ContentHash {
        let digest = text.encode_utf16().fold(FNV_OFFSET_BASIS, |acc, unit| {
            (acc ^ u32::from(unit)).wrapping_mul(FNV_PRIME)
        });
        ContentHash(digest)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

/// Fingerprint `text`. Shorthand for [`ContentHash::of`].
pub fn hash(text: &str) -> ContentHash {
    ContentHash::of(text)
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.to_be_bytes()))
    }
}

impl FromStr for ContentHash {
    type Err = SupertagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 4];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(ContentHash(u32::from_be_bytes(bytes)))
    }
}

impl TryFrom<&str> for ContentHash {
    type Error = SupertagError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        ContentHash::from_str(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        ContentHash::from_str(&token).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_empty_string_hashes_to_offset_basis() {
        assert_eq!(hash("").to_string(), "811c9dc5");
    }

    #[test]
    fn test_known_fnv1a_vectors() {
        assert_eq!(hash("a").to_string(), "e40c292c");
        assert_eq!(hash("foobar").to_string(), "bf9cf968");
    }

    #[test]
    fn test_identical_text_hashes_identically() {
        let block = "Line1 #a\nsecond line";
        assert_eq!(hash(block), hash(&block.to_string()));
        assert_ne!(hash(block), hash("Line1 #a\nsecond line "));
    }

    #[test]
    fn test_token_is_eight_hex_digits() {
        for text in ["", "x", "中文标签", "a much longer block of text\nwith lines"] {
            let token = hash(text).to_string();
            assert_eq!(token.len(), 8);
            assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
        }
    }

    #[test]
    fn test_parse_display_agree() {
        let digest = hash("#project");
        let parsed: ContentHash = digest.to_string().parse().unwrap();
        assert_eq!(parsed, digest);
        assert!("not-hex".parse::<ContentHash>().is_err());
        assert!("abc".parse::<ContentHash>().is_err());
    }

    #[test]
    fn test_non_bmp_text_hashes_surrogate_pairs() {
        // Characters outside the BMP contribute two UTF-16 units.
        let expected = [0xd83du32, 0xde00]
            .iter()
            .fold(FNV_OFFSET_BASIS, |acc, unit| (acc ^ unit).wrapping_mul(FNV_PRIME));
        assert_eq!(hash("😀"), ContentHash(expected));
    }
}
