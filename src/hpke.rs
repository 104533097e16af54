//! Hybrid decryption of report payloads.
//!
//! Reports are sealed with HPKE (X25519-HKDF-SHA256 / HKDF-SHA256 /
//! AES-128-GCM) against a public key registered with the key-management
//! service under the report's `key_id`. The verbatim `shared_info` string is
//! bound as associated data, so any tampering with the envelope makes the
//! ciphertext undecryptable.

use crate::report::{self, EncryptedReport, Report, SharedInfo};
use async_trait::async_trait;
use hpke::{
    aead::AesGcm128, kdf::HkdfSha256, kem::X25519HkdfSha256, Deserializable, Kem, OpModeR,
    OpModeS, Serializable,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Domain-separation string for the HPKE context.
const APPLICATION_INFO: &[u8] = b"aggregation-worker";

/// X25519 encapsulated keys are always this long.
pub const ENCAPSULATED_KEY_LENGTH: usize = 32;

pub type PrivateKey = <X25519HkdfSha256 as Kem>::PrivateKey;
pub type PublicKey = <X25519HkdfSha256 as Kem>::PublicKey;

/// Failures talking to the key-management service. The three variants fan out
/// to distinct job outcomes, so the distinction matters.
#[derive(Debug, thiserror::Error)]
pub enum KeyFetchError {
    #[error("access to key {0} denied")]
    PermissionDenied(String),
    #[error("key service unavailable: {0}")]
    Unavailable(String),
    #[error("key service failure: {0}")]
    Service(String),
}

/// Capability for looking up private key material by id.
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    async fn fetch(&self, key_id: &str) -> Result<Vec<u8>, KeyFetchError>;
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("payload shorter than an encapsulated key")]
    TruncatedPayload,
    #[error("key material is not a valid private key")]
    KeyMaterial,
    #[error("HPKE open failed")]
    Open(#[source] hpke::HpkeError),
    #[error("HPKE seal failed")]
    Seal(#[source] hpke::HpkeError),
    #[error(transparent)]
    Payload(#[from] report::Error),
    #[error(transparent)]
    KeyFetch(#[from] KeyFetchError),
}

/// Decrypts encrypted reports using keys resolved through a [`KeyFetcher`].
#[derive(Clone)]
pub struct Decryptor {
    keys: Arc<dyn KeyFetcher>,
}

impl Decryptor {
    pub fn new(keys: Arc<dyn KeyFetcher>) -> Self {
        Self { keys }
    }

    /// Decrypt and decode one report.
    pub async fn decrypt(&self, encrypted: &EncryptedReport) -> Result<Report, Error> {
        let shared_info = SharedInfo::from_json(&encrypted.shared_info)?;

        let key_bytes = self.keys.fetch(&encrypted.key_id).await?;
        let private_key =
            PrivateKey::from_bytes(&key_bytes).map_err(|_| Error::KeyMaterial)?;

        if encrypted.payload.len() < ENCAPSULATED_KEY_LENGTH {
            return Err(Error::TruncatedPayload);
        }
        let (encapsulated, ciphertext) = encrypted.payload.split_at(ENCAPSULATED_KEY_LENGTH);
        let encapsulated = <X25519HkdfSha256 as Kem>::EncappedKey::from_bytes(encapsulated)
            .map_err(|_| Error::TruncatedPayload)?;

        let plaintext = hpke::single_shot_open::<AesGcm128, HkdfSha256, X25519HkdfSha256>(
            &OpModeR::Base,
            &private_key,
            &encapsulated,
            APPLICATION_INFO,
            ciphertext,
            encrypted.shared_info.as_bytes(),
        )
        .map_err(Error::Open)?;

        let contributions = report::decode_payload(&plaintext)?;
        Ok(Report {
            shared_info,
            contributions,
        })
    }
}

/// Seal a plaintext payload for `public_key`, binding `shared_info` as
/// associated data. Returns encapsulated key followed by ciphertext, the
/// layout [`Decryptor::decrypt`] expects. Used by report-generation tooling.
pub fn seal(
    public_key: &PublicKey,
    shared_info: &str,
    plaintext: &[u8],
) -> Result<Vec<u8>, Error> {
    let (encapsulated, ciphertext) =
        hpke::single_shot_seal::<AesGcm128, HkdfSha256, X25519HkdfSha256, _>(
            &OpModeS::Base,
            public_key,
            APPLICATION_INFO,
            plaintext,
            shared_info.as_bytes(),
            &mut rand::rngs::OsRng,
        )
        .map_err(Error::Seal)?;

    let mut payload = encapsulated.to_bytes().to_vec();
    payload.extend_from_slice(&ciphertext);
    Ok(payload)
}

/// Generate a fresh recipient key pair.
pub fn generate_key_pair() -> (PrivateKey, PublicKey) {
    X25519HkdfSha256::gen_keypair(&mut rand::rngs::OsRng)
}

/// Key fetcher backed by a fixed in-memory map, for tests and local runs.
#[derive(Default)]
pub struct StaticKeyFetcher {
    keys: HashMap<String, Vec<u8>>,
}

impl StaticKeyFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key_id: impl Into<String>, private_key: &PrivateKey) {
        self.keys
            .insert(key_id.into(), private_key.to_bytes().to_vec());
    }
}

#[async_trait]
impl KeyFetcher for StaticKeyFetcher {
    async fn fetch(&self, key_id: &str) -> Result<Vec<u8>, KeyFetchError> {
        self.keys
            .get(key_id)
            .cloned()
            .ok_or_else(|| KeyFetchError::Service(format!("no key registered for {key_id}")))
    }
}

/// Key fetcher talking to an HTTP key-management service.
///
/// `GET {endpoint}/keys/{key_id}` must answer `{"key": "<hex private key>"}`.
pub struct HttpKeyFetcher {
    client: reqwest::Client,
    endpoint: String,
}

static KEY_FETCHER_USER_AGENT: &str = concat!(
    env!("CARGO_PKG_NAME"),
    "/",
    env!("CARGO_PKG_VERSION"),
    "/",
    "key-fetcher"
);

#[derive(serde::Deserialize)]
struct KeyResponse {
    key: String,
}

impl HttpKeyFetcher {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, KeyFetchError> {
        let client = reqwest::Client::builder()
            .user_agent(KEY_FETCHER_USER_AGENT)
            .build()
            .map_err(|e| KeyFetchError::Service(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl KeyFetcher for HttpKeyFetcher {
    async fn fetch(&self, key_id: &str) -> Result<Vec<u8>, KeyFetchError> {
        use http::StatusCode;

        let url = format!("{}/keys/{}", self.endpoint, key_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| KeyFetchError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(KeyFetchError::PermissionDenied(key_id.to_string()));
        }
        if status.is_server_error() {
            return Err(KeyFetchError::Unavailable(format!(
                "key service answered {status}"
            )));
        }
        if !status.is_success() {
            return Err(KeyFetchError::Service(format!(
                "key service answered {status}"
            )));
        }

        let body: KeyResponse = response
            .json()
            .await
            .map_err(|e| KeyFetchError::Service(e.to_string()))?;
        hex::decode(&body.key).map_err(|e| KeyFetchError::Service(e.to_string()))
    }
}
