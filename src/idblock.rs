//! On-flash device identity record
//!
//! A 4 KiB block at a fixed flash offset identifying the device to its
//! cloud service: 20 bytes of SHA-1 over the JSON payload, the payload
//! itself, a single 0x00 terminator and 0xFF padding up to the block size.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use sha1::{Digest, Sha1};

/// Flash offset of the identity block
pub const ID_BLOCK_OFFSET: u32 = 0x10000;
/// Size of the identity block, one flash sector
pub const ID_BLOCK_SIZE: usize = 4096;

const SHA1_LENGTH: usize = 20;

/// Bytes of entropy drawn per identity: 5 for the device id, 7 for the
/// pre-shared key
const ID_RAW_LENGTH: usize = 5;
const RAW_LENGTH: usize = 12;

#[derive(Serialize)]
struct IdPayload {
    id: String,
    key: String,
}

/// Generates a fresh identity block for a device registering with `hostname`.
///
/// Both the id and the key are drawn from the OS CSPRNG. The key is a
/// secret, so a weaker generator is not an option here.
pub fn generate(hostname: &str) -> Vec<u8> {
    let mut raw = [0u8; RAW_LENGTH];
    OsRng.fill_bytes(&mut raw);
    build(hostname, &raw)
}

fn build(hostname: &str, raw: &[u8; RAW_LENGTH]) -> Vec<u8> {
    let id = URL_SAFE_NO_PAD.encode(&raw[..ID_RAW_LENGTH]);
    let key = URL_SAFE_NO_PAD.encode(&raw[ID_RAW_LENGTH..]);

    let payload = IdPayload {
        id: format!("//{}/d/{}", hostname, id),
        key,
    };
    // Serializing two plain strings cannot fail.
    let payload = serde_json::to_vec(&payload).unwrap();

    let mut block = Vec::with_capacity(ID_BLOCK_SIZE);
    block.extend_from_slice(&Sha1::digest(&payload));
    block.extend_from_slice(&payload);
    block.push(0x00);
    block.resize(ID_BLOCK_SIZE, 0xff);
    block
}

/// Checks whether `block` holds a valid identity record: a terminator
/// after the hash, and the hash matching the payload in front of it.
pub fn is_present(block: &[u8]) -> bool {
    if block.len() <= SHA1_LENGTH {
        return false;
    }

    let terminator = match block[SHA1_LENGTH..].iter().position(|b| *b == 0x00) {
        Some(position) => SHA1_LENGTH + position,
        None => return false,
    };

    block[..SHA1_LENGTH] == Sha1::digest(&block[SHA1_LENGTH..terminator])[..]
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: [u8; RAW_LENGTH] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    #[test]
    fn generated_block_is_detected() {
        let block = build("api.example", &RAW);
        assert_eq!(block.len(), ID_BLOCK_SIZE);
        assert!(is_present(&block));
    }

    #[test]
    fn payload_shape() {
        let block = build("api.example", &RAW);
        let terminator = SHA1_LENGTH
            + block[SHA1_LENGTH..]
                .iter()
                .position(|b| *b == 0x00)
                .unwrap();
        let payload: serde_json::Value =
            serde_json::from_slice(&block[SHA1_LENGTH..terminator]).unwrap();

        let id = payload["id"].as_str().unwrap();
        assert!(id.starts_with("//api.example/d/"));
        // 5 and 7 entropy bytes encode to 7 and 10 base64 characters
        assert_eq!(id.len(), "//api.example/d/".len() + 7);
        assert_eq!(payload["key"].as_str().unwrap().len(), 10);
    }

    #[test]
    fn padding_after_terminator_is_all_ff() {
        let block = build("api.example", &RAW);
        let terminator = SHA1_LENGTH
            + block[SHA1_LENGTH..]
                .iter()
                .position(|b| *b == 0x00)
                .unwrap();
        assert!(block[terminator + 1..].iter().all(|b| *b == 0xff));
    }

    #[test]
    fn corrupted_hash_is_not_detected() {
        for position in 0..SHA1_LENGTH {
            let mut block = build("api.example", &RAW);
            block[position] ^= 0x01;
            assert!(!is_present(&block));
        }
    }

    #[test]
    fn missing_terminator_is_not_detected() {
        let mut block = build("api.example", &RAW);
        for byte in block[SHA1_LENGTH..].iter_mut() {
            if *byte == 0x00 {
                *byte = 0xff;
            }
        }
        assert!(!is_present(&block));
    }

    #[test]
    fn blank_flash_is_not_detected() {
        assert!(!is_present(&[0xff; ID_BLOCK_SIZE]));
        assert!(!is_present(&[]));
    }

    #[test]
    fn fresh_identities_differ() {
        assert_ne!(generate("api.example"), generate("api.example"));
    }
}
