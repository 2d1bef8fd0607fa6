//! Resumption version strings (RFC 4253 Section 4.2 compatible).
//!
//! The server opens every connection with a single identification line:
//!
//! ```text
//! SSH-2.0-Teleport resume-v1 <base64(pubkey)> <hostID>\r\n
//! ```
//!
//! where `<base64(pubkey)>` is the unpadded standard-alphabet base64 of the
//! 65-byte uncompressed P-256 public key and `<hostID>` is an opaque ASCII
//! host identifier. The prefix is a valid RFC 4253 server identification
//! string, so plain SSH clients accept it as the server version and proceed
//! normally.
//!
//! Clients that support resumption reply with a fixed 29-byte prelude,
//! `SSH-2.0-\x00teleport-resume-v1`. The NUL byte after the SSH prefix is
//! the disambiguator: it never appears in a legacy client version string.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use limpet_platform::{LimpetError, LimpetResult};

/// SSH identification prefix shared with legacy clients.
pub const SSH_VERSION_PREFIX: &str = "SSH-2.0-Teleport";

/// Server protocol identifier for resumption v1.
pub const SERVER_PROTOCOL_V1: &str = "SSH-2.0-Teleport resume-v1";

/// Client protocol identifier quoted inside the prelude.
pub const CLIENT_PROTOCOL_V1: &str = "teleport-resume-v1";

/// Length of an uncompressed P-256 public key on the wire.
pub const ECDH_P256_UNCOMPRESSED_LEN: usize = 65;

/// Maximum accepted length of a server identification line (RFC 4253).
pub const MAX_VERSION_LINE: usize = 255;

/// Returns the fixed client prelude, `SSH-2.0-\x00teleport-resume-v1`.
///
/// # Example
///
/// ```rust
/// use limpet_proto::resume::client_prelude;
///
/// let prelude = client_prelude();
/// assert_eq!(prelude.len(), 29);
/// assert_eq!(prelude[8], 0);
/// ```
pub fn client_prelude() -> &'static [u8] {
    b"SSH-2.0-\x00teleport-resume-v1"
}

/// Builds the server identification line, including the trailing CRLF.
///
/// # Arguments
///
/// * `public_key` - 65-byte uncompressed P-256 public key
/// * `host_id` - opaque ASCII host identifier
///
/// # Example
///
/// ```rust
/// use limpet_proto::resume::server_banner;
///
/// let banner = server_banner(&[4u8; 65], "host-1");
/// assert!(banner.starts_with("SSH-2.0-Teleport resume-v1 "));
/// assert!(banner.ends_with("\r\n"));
/// ```
pub fn server_banner(public_key: &[u8], host_id: &str) -> String {
    format!(
        "{} {} {}\r\n",
        SERVER_PROTOCOL_V1,
        STANDARD_NO_PAD.encode(public_key),
        host_id
    )
}

/// Plain identification line used when resumption is unavailable.
pub fn plain_banner() -> String {
    format!("{}\r\n", SSH_VERSION_PREFIX)
}

/// Parses a resumption server banner into its public key and host ID.
///
/// Used by clients (and the test suite) to recover the server's ephemeral
/// key from the identification line.
///
/// # Errors
///
/// Returns [`LimpetError::Protocol`] if the line is too long, is not a
/// resumption banner, or carries a key of the wrong length.
pub fn parse_server_banner(line: &str) -> LimpetResult<(Vec<u8>, String)> {
    let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

    if line.len() > MAX_VERSION_LINE {
        return Err(LimpetError::Protocol(format!(
            "Version line too long: {} bytes (max {})",
            line.len(),
            MAX_VERSION_LINE
        )));
    }

    let rest = line.strip_prefix(SERVER_PROTOCOL_V1).ok_or_else(|| {
        LimpetError::Protocol(format!("Not a resumption banner: '{}'", line))
    })?;

    let mut parts = rest.trim_start().splitn(2, ' ');
    let key_b64 = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LimpetError::Protocol("Banner is missing the public key".to_string()))?;
    let host_id = parts
        .next()
        .ok_or_else(|| LimpetError::Protocol("Banner is missing the host ID".to_string()))?;

    let key = STANDARD_NO_PAD
        .decode(key_b64)
        .map_err(|e| LimpetError::Protocol(format!("Invalid banner key encoding: {}", e)))?;

    if key.len() != ECDH_P256_UNCOMPRESSED_LEN {
        return Err(LimpetError::Protocol(format!(
            "Banner key has {} bytes (expected {})",
            key.len(),
            ECDH_P256_UNCOMPRESSED_LEN
        )));
    }

    Ok((key, host_id.to_string()))
}
