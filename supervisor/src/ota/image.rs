use sha2::{Digest, Sha256};

pub const IMAGE_MAGIC: &[u8; 4] = b"FGAP";
pub const IMAGE_FORMAT: u8 = 1;

const HEADER_LEN: usize = IMAGE_MAGIC.len() + 1 + 4;
const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Invalid(String),
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Structural check run on a staged payload and on the live image at boot.
pub trait Validator: Send + Sync {
    fn validate(&self, payload: &[u8]) -> Validation;
}

/// Validates the `FGAP` container: magic, format, body length and trailing body digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageValidator;

impl Validator for ImageValidator {
    fn validate(&self, payload: &[u8]) -> Validation {
        if payload.len() < HEADER_LEN + DIGEST_LEN {
            return Validation::Invalid(format!("image truncated at {} bytes", payload.len()));
        }
        if &payload[..4] != IMAGE_MAGIC {
            return Validation::Invalid("bad image magic".to_string());
        }
        if payload[4] != IMAGE_FORMAT {
            return Validation::Invalid(format!("unsupported image format {}", payload[4]));
        }

        let declared =
            u32::from_le_bytes([payload[5], payload[6], payload[7], payload[8]]) as usize;
        let actual = payload.len() - HEADER_LEN - DIGEST_LEN;
        if declared != actual {
            return Validation::Invalid(format!(
                "body length mismatch (header {declared}, found {actual})"
            ));
        }

        let (body, digest) = payload[HEADER_LEN..].split_at(actual);
        if Sha256::digest(body).as_slice() != digest {
            return Validation::Invalid("body digest mismatch".to_string());
        }
        Validation::Valid
    }
}

/// Wraps `body` in the image container.
pub fn encode_image(body: &[u8]) -> Vec<u8> {
    let mut image = Vec::with_capacity(HEADER_LEN + body.len() + DIGEST_LEN);
    image.extend_from_slice(IMAGE_MAGIC);
    image.push(IMAGE_FORMAT);
    image.extend_from_slice(&(body.len() as u32).to_le_bytes());
    image.extend_from_slice(body);
    image.extend_from_slice(&Sha256::digest(body));
    image
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let digest = Sha256::digest(bytes);
    let mut hex = String::with_capacity(64);
    for byte in digest {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_encoded_image() {
        let image = encode_image(b"fridge app v2");
        assert_eq!(ImageValidator.validate(&image), Validation::Valid);
    }

    #[test]
    fn accepts_empty_body() {
        assert!(ImageValidator.validate(&encode_image(b"")).is_valid());
    }

    #[test]
    fn rejects_truncated_image() {
        let image = encode_image(b"fridge app v2");
        let truncated = &image[..image.len() - 5];
        assert!(matches!(
            ImageValidator.validate(truncated),
            Validation::Invalid(reason) if reason.contains("length mismatch")
        ));
        assert!(!ImageValidator.validate(&image[..10]).is_valid());
    }

    #[test]
    fn rejects_bad_magic_and_format() {
        let mut image = encode_image(b"body");
        image[0] = b'X';
        assert_eq!(
            ImageValidator.validate(&image),
            Validation::Invalid("bad image magic".to_string())
        );

        let mut image = encode_image(b"body");
        image[4] = 9;
        assert!(!ImageValidator.validate(&image).is_valid());
    }

    #[test]
    fn rejects_corrupted_body() {
        let mut image = encode_image(b"fridge app v2");
        image[HEADER_LEN] ^= 0xff;
        assert_eq!(
            ImageValidator.validate(&image),
            Validation::Invalid("body digest mismatch".to_string())
        );
    }

    #[test]
    fn hex_digest_is_lowercase() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
