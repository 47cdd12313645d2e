//! Secret decryption and injection.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tether_core::ports::SecretDecryptor;
use tether_core::secrets::ExpressionContext;
use tether_core::task::{EncryptedSecretRef, EncryptionConfig, TaskPackage};
use tether_core::{Error, Result};
use tracing::debug;

const NONCE_LEN: usize = 12;

/// AES-256-GCM with the key derived from the config's master key.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmDecryptor;

impl AesGcmDecryptor {
    fn cipher(config: &EncryptionConfig) -> Result<Aes256Gcm> {
        let key: [u8; 32] = Sha256::digest(config.key.as_bytes()).into();
        Aes256Gcm::new_from_slice(&key).map_err(|e| Error::SecretDecryption(e.to_string()))
    }

    /// Encrypt a value into the `nonce || ciphertext` base64 form.
    pub fn encrypt(config: &EncryptionConfig, plaintext: &str) -> Result<String> {
        let cipher = Self::cipher(config)?;
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| Error::Internal(format!("Encryption failed: {e}")))?;
        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }
}

impl SecretDecryptor for AesGcmDecryptor {
    fn decrypt(&self, secret: &EncryptedSecretRef, config: &EncryptionConfig) -> Result<String> {
        let raw = BASE64
            .decode(secret.encrypted_value.as_bytes())
            .map_err(|e| Error::SecretDecryption(format!("{}: {e}", secret.name)))?;
        if raw.len() <= NONCE_LEN {
            return Err(Error::SecretDecryption(format!(
                "{}: value too short",
                secret.name
            )));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = Self::cipher(config)?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::SecretDecryption(format!("{}: authentication failed", secret.name)))?;
        String::from_utf8(plaintext)
            .map_err(|e| Error::SecretDecryption(format!("{}: {e}", secret.name)))
    }
}

/// Decrypts a package's secret references into an expression context.
pub struct SecretInjector {
    decryptor: Arc<dyn SecretDecryptor>,
}

impl SecretInjector {
    pub fn new(decryptor: Arc<dyn SecretDecryptor>) -> Self {
        Self { decryptor }
    }

    /// Decrypt every reference, expose it to expressions and add it to the
    /// package's redaction set.
    pub fn inject(&self, package: &mut TaskPackage) -> Result<ExpressionContext> {
        let mut context = ExpressionContext::new();
        for secret in &package.secret_references {
            let config = package
                .encryption_configs
                .get(&secret.encryption_config_id)
                .ok_or_else(|| Error::EncryptionConfigNotFound(secret.encryption_config_id.clone()))?;
            let value = self.decryptor.decrypt(secret, config)?;
            context.insert_secret(secret.name.clone(), value);
        }
        context.extend_redactions(&mut package.secrets);
        if !context.is_empty() {
            debug!(
                task_id = %package.task_id,
                count = package.secret_references.len(),
                "Secrets injected"
            );
        }
        Ok(context)
    }
}
