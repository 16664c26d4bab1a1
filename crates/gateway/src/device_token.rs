//! Persisted gateway-issued device token.
//!
//! The token is a bearer credential; the file is owner-only and removed
//! outright when the gateway reports a token mismatch.

use std::{
    fs, io,
    io::Write,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct DeviceTokenFile {
    token: String,
    #[serde(rename = "savedAtMs")]
    saved_at_ms: i64,
}

/// Load the persisted token. A missing file is not an error; it simply means
/// no token has been issued yet.
pub fn load(path: impl AsRef<Path>) -> Result<Option<String>, io::Error> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let stored: DeviceTokenFile = serde_json::from_slice(&data)?;
    Ok(Some(stored.token).filter(|t| !t.is_empty()))
}

pub fn save(path: impl AsRef<Path>, token: &str) -> Result<(), io::Error> {
    let stored = DeviceTokenFile {
        token: token.to_string(),
        saved_at_ms: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64,
    };
    let encoded = serde_json::to_vec_pretty(&stored)?;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path.as_ref())?;
    file.write_all(&encoded)?;
    fs::set_permissions(path.as_ref(), fs::Permissions::from_mode(0o600))
}

/// Remove the token file. Missing files are fine.
pub fn clear(path: impl AsRef<Path>) -> Result<(), io::Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
