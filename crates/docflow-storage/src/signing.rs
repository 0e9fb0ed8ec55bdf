//! Signed retrieval URLs.
//!
//! URL shape: `{base}/{key}?expires={unix_seconds}&signature={hex}` where the
//! signature is HMAC-SHA256(secret, "{key}:{expires}").

use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

use crate::traits::{StorageError, StorageResult};

type HmacSha256 = Hmac<Sha256>;

/// A retrieval URL together with its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Signs and verifies retrieval URLs for one base URL.
#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
    base_url: String,
}

impl UrlSigner {
    pub fn new(secret: impl AsRef<[u8]>, base_url: impl Into<String>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn mac(&self) -> StorageResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| StorageError::SigningFailed(format!("Invalid signing key: {}", e)))
    }

    /// Hex signature for `key` expiring at `expires` (unix seconds).
    pub fn signature(&self, key: &str, expires: i64) -> StorageResult<String> {
        let mut mac = self.mac()?;
        mac.update(format!("{}:{}", key, expires).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    pub fn sign(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> StorageResult<SignedUrl> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StorageError::SigningFailed(format!("Invalid TTL: {}", e)))?;
        let expires_at = now + ttl;
        let expires = expires_at.timestamp();
        let signature = self.signature(key, expires)?;
        Ok(SignedUrl {
            url: format!(
                "{}/{}?expires={}&signature={}",
                self.base_url, key, expires, signature
            ),
            // Truncate to whole seconds so the value matches what the URL carries.
            expires_at: Utc
                .timestamp_opt(expires, 0)
                .single()
                .unwrap_or(expires_at),
        })
    }

    /// Check a signed URL issued by this signer. Returns the object key on success.
    pub fn verify(&self, url: &str, now: DateTime<Utc>) -> StorageResult<String> {
        let rest = url
            .strip_prefix(&self.base_url)
            .and_then(|r| r.strip_prefix('/'))
            .ok_or_else(|| StorageError::InvalidKey("URL was not issued by this storage".to_string()))?;
        let (key, query) = rest
            .split_once('?')
            .ok_or_else(|| StorageError::InvalidKey("URL is not signed".to_string()))?;

        let mut expires: Option<i64> = None;
        let mut signature: Option<&str> = None;
        for pair in query.split('&') {
            match pair.split_once('=') {
                Some(("expires", value)) => expires = value.parse().ok(),
                Some(("signature", value)) => signature = Some(value),
                _ => {}
            }
        }
        let (expires, signature) = match (expires, signature) {
            (Some(e), Some(s)) => (e, s),
            _ => {
                return Err(StorageError::InvalidKey(
                    "URL is missing expires or signature".to_string(),
                ))
            }
        };

        let provided = hex::decode(signature)
            .map_err(|_| StorageError::InvalidKey("Malformed signature".to_string()))?;
        let mut mac = self.mac()?;
        mac.update(format!("{}:{}", key, expires).as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| StorageError::InvalidKey("Signature mismatch".to_string()))?;

        if now.timestamp() > expires {
            return Err(StorageError::InvalidKey("Signed URL has expired".to_string()));
        }

        Ok(key.to_string())
    }
}
