//! Three-line PEM-like key envelope.
//!
//! ```text
//! -----BEGIN EC PUBLIC KEY-----
//! <base64url body, one line>
//! -----END EC PUBLIC KEY-----
//! ```
//!
//! Unlike RFC 7468 PEM the body is URL-safe base64 on a single line, which
//! keeps key files usable as-is inside bundle archives.

use crate::CryptoError;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Envelope type of a public key file.
pub const PUBLIC_KEY: &str = "EC PUBLIC KEY";
/// Envelope type of a private key file.
pub const PRIVATE_KEY: &str = "EC PRIVATE KEY";

pub(crate) fn header(kind: &str) -> String {
    format!("-----BEGIN {kind}-----")
}

pub(crate) fn footer(kind: &str) -> String {
    format!("-----END {kind}-----")
}

/// Encode raw key bytes into an envelope of the given type.
#[must_use]
pub fn encode(kind: &str, body: &[u8]) -> String {
    format!(
        "{}\n{}\n{}\n",
        header(kind),
        URL_SAFE_NO_PAD.encode(body),
        footer(kind)
    )
}

/// Decode an envelope, checking its type.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKeyFormat`] if the text is not exactly three
/// lines, the header or footer does not match `kind`, or the body is not
/// base64url.
pub fn decode(kind: &str, text: &str) -> Result<Vec<u8>, CryptoError> {
    let lines = envelope_lines(kind, text, 3)?;
    decode_line(lines[1])
}

/// Decode an envelope whose body must be a 32-byte key.
///
/// # Errors
///
/// As [`decode`], plus [`CryptoError::InvalidKeyFormat`] for a body of the
/// wrong length.
pub fn decode_key(kind: &str, text: &str) -> Result<[u8; 32], CryptoError> {
    let body = decode(kind, text)?;
    body.as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyFormat(format!("{kind}: {} byte body", body.len())))
}

/// Split an envelope of `expected` lines and check its framing.
pub(crate) fn envelope_lines<'a>(
    kind: &str,
    text: &'a str,
    expected: usize,
) -> Result<Vec<&'a str>, CryptoError> {
    let lines: Vec<&str> = text.trim_end().lines().map(str::trim_end).collect();
    if lines.len() != expected {
        return Err(CryptoError::InvalidKeyFormat(format!(
            "{kind}: expected {expected} lines, found {}",
            lines.len()
        )));
    }
    if lines[0] != header(kind) || lines[expected - 1] != footer(kind) {
        return Err(CryptoError::InvalidKeyFormat(format!(
            "{kind}: header/footer mismatch"
        )));
    }
    Ok(lines)
}

pub(crate) fn decode_line(line: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(line)
        .map_err(|e| CryptoError::InvalidKeyFormat(format!("body: {e}")))
}
