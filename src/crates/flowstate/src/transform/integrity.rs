//! HMAC-SHA256 integrity transform
//!
//! Encoding appends a tag over the data; decoding checks and strips it.
//! Confidentiality is not provided: the data itself stays readable.

use super::{Coder, Transform};
use crate::error::{CheckpointError, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Length of the appended tag
pub const TAG_LEN: usize = 32;

/// Signs and verifies data with a shared secret key
#[derive(Clone)]
pub struct Integrity {
    mac: HmacSha256,
}

impl Integrity {
    pub fn new(key: impl AsRef<[u8]>) -> Result<Self> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(CheckpointError::Config(
                "integrity key must not be empty".to_string(),
            ));
        }
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|e| CheckpointError::Config(format!("invalid integrity key: {}", e)))?;
        Ok(Self { mac })
    }
}

impl std::fmt::Debug for Integrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Integrity(HMAC-SHA256)")
    }
}

impl Transform for Integrity {
    fn name(&self) -> &str {
        "integrity"
    }

    fn encoder(&self) -> Result<Box<dyn Coder>> {
        Ok(Box::new(Signer(self.mac.clone())))
    }

    fn decoder(&self) -> Result<Box<dyn Coder>> {
        Ok(Box::new(Verifier(self.mac.clone())))
    }
}

struct Signer(HmacSha256);

impl Coder for Signer {
    fn code(&mut self, mut data: Vec<u8>) -> Result<Vec<u8>> {
        let mut mac = self.0.clone();
        mac.update(&data);
        data.extend_from_slice(&mac.finalize().into_bytes());
        Ok(data)
    }
}

struct Verifier(HmacSha256);

impl Coder for Verifier {
    fn code(&mut self, mut data: Vec<u8>) -> Result<Vec<u8>> {
        if data.len() < TAG_LEN {
            return Err(CheckpointError::IntegrityViolation);
        }
        let tag = data.split_off(data.len() - TAG_LEN);
        let mut mac = self.0.clone();
        mac.update(&data);
        mac.verify_slice(&tag)
            .map_err(|_| CheckpointError::IntegrityViolation)?;
        Ok(data)
    }
}
