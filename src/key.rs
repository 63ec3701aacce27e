//! Host key management.

use log::info;
use russh_keys::HashAlg;

use crate::error::GatewayError;

/// Load the PEM-encoded RSA host key. Generation is an operator concern;
/// a missing or undecodable key is fatal at startup.
pub fn load_host_key(path: &str) -> Result<russh_keys::PrivateKey, GatewayError> {
    let key = russh_keys::load_secret_key(path, None)
        .map_err(|e| GatewayError::Config(format!("cannot load host key '{}': {}", path, e)))?;
    info!(
        "Host key fingerprint: {}",
        key.public_key().fingerprint(HashAlg::Sha256)
    );
    Ok(key)
}
