use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

/// When a task is issued, and the bucket its seed is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuanceContext {
    pub issued_at: DateTime<Utc>,
    pub time_bucket: String,
}

impl IssuanceContext {
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    /// Bucket derived from the UTC hour of `issued_at`.
    pub fn at(issued_at: DateTime<Utc>) -> Self {
        Self {
            issued_at,
            time_bucket: time_bucket(issued_at),
        }
    }

    pub fn with_bucket(issued_at: DateTime<Utc>, time_bucket: impl Into<String>) -> Self {
        Self {
            issued_at,
            time_bucket: time_bucket.into(),
        }
    }
}

/// `%Y-%m-%d-%H` of the UTC hour.
pub fn time_bucket(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d-%H").to_string()
}

/// Per-recipient seed: SHA-256 of `email:time_bucket`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seed([u8; 32]);

impl Seed {
    pub fn derive(email: &str, time_bucket: &str) -> Self {
        let digest = Sha256::digest(format!("{email}:{time_bucket}").as_bytes());
        Self(digest.into())
    }

    /// Hex token of the first `len` characters of the seed.
    pub fn token(&self, len: usize) -> String {
        let mut hex = hex::encode(self.0);
        hex.truncate(len.min(64));
        hex
    }

    /// Independent 64-bit stream for `label`, stable regardless of the order
    /// in which labels are drawn.
    pub fn draw(&self, label: &str) -> u64 {
        let bytes = self.sub_digest(label);
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        u64::from_be_bytes(word)
    }

    /// Hex token derived for `label`.
    pub fn sub_token(&self, label: &str, len: usize) -> String {
        let mut hex = hex::encode(self.sub_digest(label));
        hex.truncate(len.min(64));
        hex
    }

    fn sub_digest(&self, label: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update(b":");
        hasher.update(label.as_bytes());
        hasher.finalize().into()
    }
}

/// Single-use opaque nonce: 32 bytes from the OS RNG, hex encoded.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `"{template_id}-{8 hex}"` from the recipient, round and issuance time.
pub fn task_id_for(template_id: &str, email: &str, round: u8, issued_at: DateTime<Utc>) -> String {
    let digest = Sha256::digest(format!("{email}:{round}:{}", issued_at.to_rfc3339()).as_bytes());
    let mut short = hex::encode(digest);
    short.truncate(8);
    format!("{template_id}-{short}")
}
