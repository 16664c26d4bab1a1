//! Persistent Ed25519 device identity.
//!
//! The identity lives in a JSON file with owner-only permissions. The device
//! ID is the lowercase hex of SHA-256 over the raw public key; if the stored
//! ID disagrees with the derived value, the derived value wins and the file
//! is rewritten. Keys are parsed once at load time.

use std::{
    fs, io,
    io::Write,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    base64::Engine,
    ed25519_dalek::{
        pkcs8::{
            spki::der::pem::LineEnding, DecodePrivateKey, DecodePublicKey, EncodePrivateKey,
            EncodePublicKey,
        },
        Signer, SigningKey, VerifyingKey,
    },
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
};

const DEVICE_IDENTITY_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("gateway: identity missing keys")]
    MissingKeys,

    #[error("gateway: invalid identity key: {0}")]
    InvalidKey(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct DeviceIdentityFile {
    version: u32,
    #[serde(rename = "deviceId", default)]
    device_id: String,
    #[serde(rename = "publicKeyPem", default)]
    public_key_pem: String,
    #[serde(rename = "privateKeyPem", default)]
    private_key_pem: String,
    #[serde(rename = "createdAtMs", default)]
    created_at_ms: i64,
}

/// Long-lived device keypair plus the derived device ID.
#[derive(Debug)]
pub struct DeviceIdentity {
    device_id: String,
    public_key_pem: String,
    private_key_pem: String,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl DeviceIdentity {
    /// Load the identity at `path`, creating and persisting a fresh keypair
    /// if the file does not exist.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref();
        match fs::read(path) {
            Ok(data) => Self::load(path, &data),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Self::create(path),
            Err(err) => Err(err.into()),
        }
    }

    fn load(path: &Path, data: &[u8]) -> Result<Self, IdentityError> {
        let mut stored: DeviceIdentityFile = serde_json::from_slice(data)?;
        if stored.public_key_pem.is_empty() || stored.private_key_pem.is_empty() {
            return Err(IdentityError::MissingKeys);
        }
        let verifying_key = VerifyingKey::from_public_key_pem(&stored.public_key_pem)
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        let signing_key = SigningKey::from_pkcs8_pem(&stored.private_key_pem)
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        let derived_id = device_id_from_public_key(&verifying_key);
        if stored.device_id != derived_id {
            stored.device_id = derived_id.clone();
            // The derived ID wins; rewrite is best-effort.
            if let Ok(encoded) = serde_json::to_vec_pretty(&stored) {
                let _ = write_owner_only(path, &encoded);
            }
        }
        Ok(Self {
            device_id: derived_id,
            public_key_pem: stored.public_key_pem,
            private_key_pem: stored.private_key_pem,
            signing_key,
            verifying_key,
        })
    }

    fn create(path: &Path) -> Result<Self, IdentityError> {
        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let verifying_key = signing_key.verifying_key();
        let public_key_pem = verifying_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        let private_key_pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?
            .to_string();
        let device_id = device_id_from_public_key(&verifying_key);
        let stored = DeviceIdentityFile {
            version: DEVICE_IDENTITY_VERSION,
            device_id: device_id.clone(),
            public_key_pem: public_key_pem.clone(),
            private_key_pem: private_key_pem.clone(),
            created_at_ms: now_ms(),
        };
        write_owner_only(path, &serde_json::to_vec_pretty(&stored)?)?;
        Ok(Self {
            device_id,
            public_key_pem,
            private_key_pem,
            signing_key,
            verifying_key,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Raw 32-byte public key as base64url without padding.
    pub fn public_key_base64url(&self) -> String {
        base64url(self.verifying_key.as_bytes())
    }

    /// Ed25519 signature over the UTF-8 payload bytes, base64url without
    /// padding.
    pub fn sign(&self, payload: &str) -> String {
        base64url(&self.signing_key.sign(payload.as_bytes()).to_bytes())
    }
}

/// Canonical device-auth payload signed during the handshake.
///
/// `v2|deviceId|clientId|clientMode|role|scopeCsv|signedAtMs|token|nonce`
/// when a nonce is present, the `v1|…|token` prefix form otherwise. Empty and
/// absent scope lists are indistinguishable.
pub fn build_device_auth_payload(
    device_id: &str,
    client_id: &str,
    client_mode: &str,
    role: &str,
    scopes: &[String],
    signed_at_ms: i64,
    token: &str,
    nonce: &str,
) -> String {
    let scope_csv = scopes.join(",");
    let version = if nonce.is_empty() { "v1" } else { "v2" };
    let mut parts = vec![
        version.to_string(),
        device_id.to_string(),
        client_id.to_string(),
        client_mode.to_string(),
        role.to_string(),
        scope_csv,
        signed_at_ms.to_string(),
        token.to_string(),
    ];
    if version == "v2" {
        parts.push(nonce.to_string());
    }
    parts.join("|")
}

fn base64url(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn device_id_from_public_key(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn write_owner_only(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    // An existing file keeps its old mode; force 0600 either way.
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}
