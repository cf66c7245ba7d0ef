//! Key derivation, frame encryption and integrity tags.
//!
//! Keys are re-derived for every job from the policy's key source and a fresh
//! random salt. Only the salt is persisted on the backup record; the derived
//! cipher and MAC keys are zeroized when dropped.

use super::{BackupError, IntegrityAlgorithm, IntegrityTag, Result};
use aes_gcm::aead::{Aead, AeadCore, KeyInit, Nonce, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use async_trait::async_trait;
use chacha20poly1305::ChaCha20Poly1305;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Debug;
use std::path::PathBuf;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_SIZE: usize = 12;
pub const SALT_SIZE: usize = 16;

const MASTER_CONTEXT: &[u8] = b"backup-core/master";
const CIPHER_CONTEXT: &[u8] = b"backup-core/cipher";
const MAC_CONTEXT: &[u8] = b"backup-core/integrity";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionAlgorithm {
    #[default]
    None,
    Aes256Gcm,
    Aes128Gcm,
    ChaCha20Poly1305,
}

impl EncryptionAlgorithm {
    pub fn key_len(self) -> usize {
        match self {
            EncryptionAlgorithm::None => 0,
            EncryptionAlgorithm::Aes128Gcm => 16,
            EncryptionAlgorithm::Aes256Gcm | EncryptionAlgorithm::ChaCha20Poly1305 => 32,
        }
    }
}

/// Where the secret a job key is derived from comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum KeySource {
    /// Password given inline or through an environment variable; Argon2id
    Password {
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        env: Option<String>,
    },
    /// Raw key material read from a file; HMAC-SHA256
    Keyfile { path: PathBuf },
    /// External KMS / vault reference such as `vault://backup/primary`; HMAC-SHA256
    Kms { reference: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeyDerivation {
    Argon2id,
    HmacSha256,
}

impl KeySource {
    pub fn kdf(&self) -> KeyDerivation {
        match self {
            KeySource::Password { .. } => KeyDerivation::Argon2id,
            KeySource::Keyfile { .. } | KeySource::Kms { .. } => KeyDerivation::HmacSha256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Argon2Settings {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for Argon2Settings {
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EncryptionSettings {
    pub algorithm: EncryptionAlgorithm,
    pub key_source: Option<KeySource>,
    pub argon2: Argon2Settings,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self::disabled()
    }
}

impl EncryptionSettings {
    pub fn disabled() -> Self {
        Self {
            algorithm: EncryptionAlgorithm::None,
            key_source: None,
            argon2: Argon2Settings::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.algorithm != EncryptionAlgorithm::None && self.key_source.is_none() {
            return Err(BackupError::config(format!(
                "encryption algorithm {:?} requires a key_source",
                self.algorithm
            )));
        }
        if let Some(KeySource::Password {
            password: None,
            env: None,
        }) = &self.key_source
        {
            return Err(BackupError::config(
                "password key source needs either `password` or `env`",
            ));
        }
        Ok(())
    }
}

/// Turns a [`KeySource`] into secret bytes.
#[async_trait]
pub trait SecretResolver: Send + Sync + Debug {
    async fn resolve(&self, source: &KeySource) -> Result<Zeroizing<Vec<u8>>>;
}

/// Resolves passwords and KMS references through environment variables and
/// keyfiles through the filesystem.
///
/// A KMS reference maps to `BACKUP_KMS_<REFERENCE>` with every non
/// alphanumeric character replaced by `_`, so `vault://backup/primary` reads
/// `BACKUP_KMS_VAULT___BACKUP_PRIMARY`.
#[derive(Debug, Default, Clone)]
pub struct EnvSecretResolver;

impl EnvSecretResolver {
    pub fn kms_variable(reference: &str) -> String {
        let normalized: String = reference
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("BACKUP_KMS_{normalized}")
    }

    fn read_env(name: &str) -> Result<Zeroizing<Vec<u8>>> {
        std::env::var(name)
            .map(|v| Zeroizing::new(v.into_bytes()))
            .map_err(|_| BackupError::Encryption {
                message: format!("secret variable {name} is not set"),
            })
    }
}

#[async_trait]
impl SecretResolver for EnvSecretResolver {
    async fn resolve(&self, source: &KeySource) -> Result<Zeroizing<Vec<u8>>> {
        match source {
            KeySource::Password {
                password: Some(password),
                ..
            } => Ok(Zeroizing::new(password.as_bytes().to_vec())),
            KeySource::Password { env: Some(env), .. } => Self::read_env(env),
            KeySource::Password { .. } => Err(BackupError::config("password key source is empty")),
            KeySource::Keyfile { path } => {
                let bytes = tokio::fs::read(path).await.map_err(|e| BackupError::Encryption {
                    message: format!("failed to read keyfile {}: {e}", path.display()),
                })?;
                if bytes.is_empty() {
                    return Err(BackupError::Encryption {
                        message: format!("keyfile {} is empty", path.display()),
                    });
                }
                Ok(Zeroizing::new(bytes))
            }
            KeySource::Kms { reference } => Self::read_env(&Self::kms_variable(reference)),
        }
    }
}

/// Per-job key material, never persisted.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    cipher_key: Vec<u8>,
    mac_key: Vec<u8>,
}

impl Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKeys")
            .field("cipher_key_len", &self.cipher_key.len())
            .field("has_mac_key", &!self.mac_key.is_empty())
            .finish()
    }
}

impl DerivedKeys {
    /// Keys for a policy without encryption and without a key source
    pub fn none() -> Self {
        Self {
            cipher_key: Vec::new(),
            mac_key: Vec::new(),
        }
    }

    pub fn mac_key(&self) -> Option<&[u8]> {
        (!self.mac_key.is_empty()).then_some(self.mac_key.as_slice())
    }
}

pub fn random_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

fn hmac(key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|e| BackupError::Encryption {
        message: format!("invalid HMAC key: {e}"),
    })?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

fn derive_master(
    kdf: KeyDerivation,
    argon2: &Argon2Settings,
    secret: &[u8],
    salt: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    match kdf {
        KeyDerivation::Argon2id => {
            let params = argon2::Params::new(
                argon2.memory_kib,
                argon2.iterations,
                argon2.parallelism,
                Some(32),
            )
            .map_err(|e| BackupError::Encryption {
                message: format!("invalid Argon2 parameters: {e}"),
            })?;
            let argon = argon2::Argon2::new(
                argon2::Algorithm::Argon2id,
                argon2::Version::V0x13,
                params,
            );
            let mut out = Zeroizing::new(vec![0u8; 32]);
            argon
                .hash_password_into(secret, salt, &mut out)
                .map_err(|e| BackupError::Encryption {
                    message: format!("key derivation failed: {e}"),
                })?;
            Ok(out)
        }
        KeyDerivation::HmacSha256 => Ok(Zeroizing::new(hmac(secret, &[salt, MASTER_CONTEXT])?)),
    }
}

/// Derives the cipher and MAC keys of one job.
///
/// Argon2id runs on the blocking pool.
pub async fn derive_keys(
    settings: &EncryptionSettings,
    resolver: &dyn SecretResolver,
    salt: &[u8],
) -> Result<DerivedKeys> {
    let Some(source) = &settings.key_source else {
        if settings.algorithm != EncryptionAlgorithm::None {
            return Err(BackupError::config("encryption enabled without a key source"));
        }
        return Ok(DerivedKeys::none());
    };

    let secret = resolver.resolve(source).await?;
    let kdf = source.kdf();
    let argon2 = settings.argon2.clone();
    let salt = salt.to_vec();
    let key_len = settings.algorithm.key_len();

    debug!(kdf = ?kdf, algorithm = ?settings.algorithm, "Deriving job keys");

    tokio::task::spawn_blocking(move || -> Result<DerivedKeys> {
        let master = derive_master(kdf, &argon2, &secret, &salt)?;
        let mut cipher_key = hmac(&master, &[CIPHER_CONTEXT])?;
        cipher_key.truncate(key_len);
        let mac_key = hmac(&master, &[MAC_CONTEXT])?;
        Ok(DerivedKeys {
            cipher_key,
            mac_key,
        })
    })
    .await
    .map_err(|e| BackupError::Encryption {
        message: format!("key derivation task failed: {e}"),
    })?
}

enum CipherImpl {
    None,
    Aes256(Box<Aes256Gcm>),
    Aes128(Box<Aes128Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

/// AEAD over frames; each sealed frame is `nonce || ciphertext`, with the
/// frame index bound in as associated data so frames cannot be reordered.
pub struct FrameCipher {
    inner: CipherImpl,
}

fn cipher_error(context: &str) -> impl Fn(aes_gcm::aead::Error) -> BackupError + '_ {
    move |_| BackupError::Encryption {
        message: context.to_string(),
    }
}

fn seal_with<C: Aead + AeadCore>(cipher: &C, index: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    let aad = index.to_be_bytes();
    let ciphertext = cipher
        .encrypt(
            Nonce::<C>::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(cipher_error("frame encryption failed"))?;

    let mut frame = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

fn open_with<C: Aead + AeadCore>(cipher: &C, index: u64, frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < NONCE_SIZE {
        return Err(BackupError::Encryption {
            message: format!("frame {index} is shorter than its nonce"),
        });
    }
    let (nonce, ciphertext) = frame.split_at(NONCE_SIZE);
    let aad = index.to_be_bytes();
    cipher
        .decrypt(
            Nonce::<C>::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(cipher_error("frame decryption failed"))
}

impl FrameCipher {
    pub fn new(algorithm: EncryptionAlgorithm, keys: &DerivedKeys) -> Result<Self> {
        let invalid = |_| BackupError::Encryption {
            message: format!("derived key has the wrong length for {algorithm:?}"),
        };
        let key = keys.cipher_key.as_slice();
        let inner = match algorithm {
            EncryptionAlgorithm::None => CipherImpl::None,
            EncryptionAlgorithm::Aes256Gcm => {
                CipherImpl::Aes256(Box::new(Aes256Gcm::new_from_slice(key).map_err(invalid)?))
            }
            EncryptionAlgorithm::Aes128Gcm => {
                CipherImpl::Aes128(Box::new(Aes128Gcm::new_from_slice(key).map_err(invalid)?))
            }
            EncryptionAlgorithm::ChaCha20Poly1305 => CipherImpl::ChaCha(Box::new(
                ChaCha20Poly1305::new_from_slice(key).map_err(invalid)?,
            )),
        };
        Ok(Self { inner })
    }

    pub fn seal(&self, index: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        match &self.inner {
            CipherImpl::None => Ok(plaintext.to_vec()),
            CipherImpl::Aes256(c) => seal_with(c.as_ref(), index, plaintext),
            CipherImpl::Aes128(c) => seal_with(c.as_ref(), index, plaintext),
            CipherImpl::ChaCha(c) => seal_with(c.as_ref(), index, plaintext),
        }
    }

    pub fn open(&self, index: u64, frame: &[u8]) -> Result<Vec<u8>> {
        match &self.inner {
            CipherImpl::None => Ok(frame.to_vec()),
            CipherImpl::Aes256(c) => open_with(c.as_ref(), index, frame),
            CipherImpl::Aes128(c) => open_with(c.as_ref(), index, frame),
            CipherImpl::ChaCha(c) => open_with(c.as_ref(), index, frame),
        }
    }
}

/// Running integrity tag over the stored bytes. HMAC-SHA256 when a MAC key
/// is available, plain SHA-256 otherwise.
pub enum IntegrityHasher {
    Hmac(Box<HmacSha256>),
    Plain(Sha256),
}

impl IntegrityHasher {
    pub fn new(keys: &DerivedKeys) -> Result<Self> {
        match keys.mac_key() {
            Some(key) => {
                let mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|e| {
                    BackupError::Encryption {
                        message: format!("invalid HMAC key: {e}"),
                    }
                })?;
                Ok(IntegrityHasher::Hmac(Box::new(mac)))
            }
            None => Ok(IntegrityHasher::Plain(Sha256::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            IntegrityHasher::Hmac(mac) => mac.update(data),
            IntegrityHasher::Plain(hasher) => hasher.update(data),
        }
    }

    pub fn finalize(self) -> IntegrityTag {
        match self {
            IntegrityHasher::Hmac(mac) => IntegrityTag {
                algorithm: IntegrityAlgorithm::HmacSha256,
                value: hex::encode(mac.finalize().into_bytes()),
            },
            IntegrityHasher::Plain(hasher) => IntegrityTag {
                algorithm: IntegrityAlgorithm::Sha256,
                value: hex::encode(hasher.finalize()),
            },
        }
    }

    /// Compares against a stored tag; HMAC tags are compared in constant time.
    pub fn verify(self, expected: &IntegrityTag) -> Result<()> {
        let expected_bytes = hex::decode(&expected.value)
            .map_err(|e| BackupError::integrity(format!("stored tag is not valid hex: {e}")))?;

        let matches = match (self, expected.algorithm) {
            (IntegrityHasher::Hmac(mac), IntegrityAlgorithm::HmacSha256) => {
                mac.verify_slice(&expected_bytes).is_ok()
            }
            (IntegrityHasher::Plain(hasher), IntegrityAlgorithm::Sha256) => {
                hasher.finalize().as_slice() == expected_bytes.as_slice()
            }
            (_, algorithm) => {
                return Err(BackupError::integrity(format!(
                    "stored tag uses {algorithm:?} but no matching key is available"
                )))
            }
        };

        if matches {
            Ok(())
        } else {
            Err(BackupError::integrity("integrity tag does not match stored payload"))
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_argon2() -> Argon2Settings {
        Argon2Settings {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn password_settings(algorithm: EncryptionAlgorithm) -> EncryptionSettings {
        EncryptionSettings {
            algorithm,
            key_source: Some(KeySource::Password {
                password: Some("correct horse".to_string()),
                env: None,
            }),
            argon2: fast_argon2(),
        }
    }

    #[tokio::test]
    async fn test_frames_roundtrip_for_every_algorithm() {
        let salt = random_salt();
        for algorithm in [
            EncryptionAlgorithm::Aes256Gcm,
            EncryptionAlgorithm::Aes128Gcm,
            EncryptionAlgorithm::ChaCha20Poly1305,
        ] {
            let keys = derive_keys(&password_settings(algorithm), &EnvSecretResolver, &salt)
                .await
                .unwrap();
            let cipher = FrameCipher::new(algorithm, &keys).unwrap();
            let sealed = cipher.seal(3, b"appointment rows").unwrap();
            assert_ne!(&sealed[NONCE_SIZE..], b"appointment rows");
            assert_eq!(cipher.open(3, &sealed).unwrap(), b"appointment rows");
        }
    }

    #[tokio::test]
    async fn test_frame_index_is_authenticated() {
        let settings = password_settings(EncryptionAlgorithm::Aes256Gcm);
        let keys = derive_keys(&settings, &EnvSecretResolver, &random_salt())
            .await
            .unwrap();
        let cipher = FrameCipher::new(settings.algorithm, &keys).unwrap();
        let sealed = cipher.seal(0, b"block zero").unwrap();
        assert!(cipher.open(1, &sealed).is_err());
    }

    #[tokio::test]
    async fn test_same_secret_and_salt_rederive_same_keys() {
        let settings = password_settings(EncryptionAlgorithm::Aes256Gcm);
        let salt = random_salt();
        let first = derive_keys(&settings, &EnvSecretResolver, &salt).await.unwrap();
        let second = derive_keys(&settings, &EnvSecretResolver, &salt).await.unwrap();

        let cipher = FrameCipher::new(settings.algorithm, &first).unwrap();
        let sealed = cipher.seal(0, b"payload").unwrap();
        let reopened = FrameCipher::new(settings.algorithm, &second).unwrap();
        assert_eq!(reopened.open(0, &sealed).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_keyfile_source_uses_hmac_kdf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.key");
        std::fs::write(&path, [7u8; 32]).unwrap();

        let settings = EncryptionSettings {
            algorithm: EncryptionAlgorithm::ChaCha20Poly1305,
            key_source: Some(KeySource::Keyfile { path }),
            argon2: Argon2Settings::default(),
        };
        assert_eq!(
            settings.key_source.as_ref().unwrap().kdf(),
            KeyDerivation::HmacSha256
        );
        let keys = derive_keys(&settings, &EnvSecretResolver, &random_salt())
            .await
            .unwrap();
        assert!(keys.mac_key().is_some());
    }

    #[test]
    fn test_kms_reference_maps_to_env_variable() {
        assert_eq!(
            EnvSecretResolver::kms_variable("vault://backup/primary"),
            "BACKUP_KMS_VAULT___BACKUP_PRIMARY"
        );
    }

    #[test]
    fn test_hmac_tag_detects_tampering() {
        let keys = DerivedKeys {
            cipher_key: Vec::new(),
            mac_key: vec![1u8; 32],
        };
        let mut hasher = IntegrityHasher::new(&keys).unwrap();
        hasher.update(b"stored bytes");
        let tag = hasher.finalize();
        assert_eq!(tag.algorithm, IntegrityAlgorithm::HmacSha256);

        let mut same = IntegrityHasher::new(&keys).unwrap();
        same.update(b"stored bytes");
        assert!(same.verify(&tag).is_ok());

        let mut tampered = IntegrityHasher::new(&keys).unwrap();
        tampered.update(b"stored bytez");
        assert!(matches!(
            tampered.verify(&tag),
            Err(BackupError::IntegrityViolation { .. })
        ));
    }

    #[test]
    fn test_encryption_without_key_source_is_invalid() {
        let settings = EncryptionSettings {
            algorithm: EncryptionAlgorithm::Aes256Gcm,
            key_source: None,
            argon2: Argon2Settings::default(),
        };
        assert!(settings.validate().is_err());
        assert!(EncryptionSettings::disabled().validate().is_ok());
    }
}
