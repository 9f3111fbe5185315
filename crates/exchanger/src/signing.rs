use crate::ProviderError;
use hmac::{Hmac, Mac};
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

/// Lowercase hex HMAC-SHA512 of `body` keyed with `secret`.
pub(crate) fn hmac_sha512_hex(secret: &str, body: &[u8]) -> Result<String, ProviderError> {
    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|e| ProviderError::Signing(e.to_string()))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}
