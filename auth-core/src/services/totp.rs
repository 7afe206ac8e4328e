//! TOTP secret lifecycle: generation, at-rest encryption, and validation.
//!
//! Secrets are encrypted with ChaCha20-Poly1305 before they reach storage;
//! the AAD binds each ciphertext to its owning user and device so a row
//! copied between records fails to decrypt. Validation tolerates one step
//! of clock skew either side of the current window.

use crate::error::CoreError;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP: u64 = 30;
const NONCE_LEN: usize = 12;

/// Material handed back to the enrolling user exactly once.
#[derive(Debug, Clone)]
pub struct TotpProvisioning {
    pub secret_base32: String,
    pub otpauth_url: String,
}

#[derive(Clone)]
pub struct TotpService {
    issuer: String,
    cipher: SecretCipher,
}

impl TotpService {
    pub fn new(issuer: String, key: [u8; 32]) -> Self {
        Self {
            issuer,
            cipher: SecretCipher { key },
        }
    }

    pub fn from_hex_key(issuer: String, hex_key: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| CoreError::Config(anyhow::anyhow!("secret key is not hex: {}", e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::Config(anyhow::anyhow!("secret key must be 32 bytes")))?;
        Ok(Self::new(issuer, key))
    }

    /// Generate a fresh secret for a pending device. Returns the
    /// provisioning material for the user and the encrypted secret for
    /// storage; the plaintext secret is never persisted.
    pub fn begin_enrollment(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        account: &str,
    ) -> Result<(TotpProvisioning, String), CoreError> {
        let secret = Secret::generate_secret();
        let secret_bytes = secret
            .to_bytes()
            .map_err(|e| CoreError::Crypto(anyhow::anyhow!("secret generation: {:?}", e)))?;

        let totp = self.build(secret_bytes.clone(), account)?;
        let provisioning = TotpProvisioning {
            secret_base32: totp.get_secret_base32(),
            otpauth_url: totp.get_url(),
        };

        let secret_enc = self.cipher.encrypt(&secret_bytes, user_id, device_id)?;
        Ok((provisioning, secret_enc))
    }

    /// Check a submitted code against a stored encrypted secret.
    pub fn verify(
        &self,
        secret_enc: &str,
        user_id: Uuid,
        device_id: Uuid,
        code: &str,
    ) -> Result<bool, CoreError> {
        let secret_bytes = self.cipher.decrypt(secret_enc, user_id, device_id)?;
        let totp = self.build(secret_bytes, "account")?;
        Ok(totp.check_current(code).unwrap_or(false))
    }

    fn build(&self, secret_bytes: Vec<u8>, account: &str) -> Result<TOTP, CoreError> {
        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP,
            secret_bytes,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| CoreError::Crypto(anyhow::anyhow!("TOTP init: {}", e)))
    }
}

/// At-rest encryption for TOTP secrets: `nonce || ciphertext`, hex encoded.
#[derive(Clone)]
struct SecretCipher {
    key: [u8; 32],
}

impl SecretCipher {
    fn encrypt(&self, plaintext: &[u8], user_id: Uuid, device_id: Uuid) -> Result<String, CoreError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let aad = Self::aad(user_id, device_id);
        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| CoreError::Crypto(anyhow::anyhow!("secret encryption: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(hex::encode(combined))
    }

    fn decrypt(&self, encoded: &str, user_id: Uuid, device_id: Uuid) -> Result<Vec<u8>, CoreError> {
        let data = hex::decode(encoded)
            .map_err(|e| CoreError::Crypto(anyhow::anyhow!("secret ciphertext: {}", e)))?;
        if data.len() < NONCE_LEN {
            return Err(CoreError::Crypto(anyhow::anyhow!(
                "secret ciphertext too short"
            )));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let aad = Self::aad(user_id, device_id);

        cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|e| CoreError::Crypto(anyhow::anyhow!("secret decryption: {}", e)))
    }

    fn aad(user_id: Uuid, device_id: Uuid) -> Vec<u8> {
        format!("mfa-secret:v1|{}|{}", user_id, device_id).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TotpService {
        TotpService::new("auth-core-test".to_string(), [7u8; 32])
    }

    fn current_code(secret_base32: &str) -> String {
        let bytes = Secret::Encoded(secret_base32.to_string()).to_bytes().unwrap();
        let totp = TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP,
            bytes,
            Some("auth-core-test".to_string()),
            "account".to_string(),
        )
        .unwrap();
        totp.generate_current().unwrap()
    }

    #[test]
    fn enrollment_produces_verifiable_secret() {
        let service = service();
        let (user_id, device_id) = (Uuid::new_v4(), Uuid::new_v4());

        let (provisioning, secret_enc) = service
            .begin_enrollment(user_id, device_id, "user@example.com")
            .unwrap();
        assert!(provisioning.otpauth_url.starts_with("otpauth://totp/"));

        let code = current_code(&provisioning.secret_base32);
        assert!(service.verify(&secret_enc, user_id, device_id, &code).unwrap());
        assert!(!service
            .verify(&secret_enc, user_id, device_id, "000000")
            .unwrap());
    }

    #[test]
    fn ciphertext_is_bound_to_user_and_device() {
        let service = service();
        let (user_id, device_id) = (Uuid::new_v4(), Uuid::new_v4());

        let (provisioning, secret_enc) = service
            .begin_enrollment(user_id, device_id, "user@example.com")
            .unwrap();
        let code = current_code(&provisioning.secret_base32);

        // Same ciphertext under a different device must not decrypt.
        let result = service.verify(&secret_enc, user_id, Uuid::new_v4(), &code);
        assert!(matches!(result, Err(CoreError::Crypto(_))));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let service = service();
        let (user_id, device_id) = (Uuid::new_v4(), Uuid::new_v4());

        let (_, secret_enc) = service
            .begin_enrollment(user_id, device_id, "user@example.com")
            .unwrap();
        let mut bytes = hex::decode(&secret_enc).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = hex::encode(bytes);

        let result = service.verify(&tampered, user_id, device_id, "123456");
        assert!(matches!(result, Err(CoreError::Crypto(_))));
    }
}
