//! HTTP Digest Authentication against recorder firmware.
//!
//! The device answers the first unauthenticated request with a
//! `WWW-Authenticate: Digest ...` challenge; we answer exactly once with the
//! computed `Authorization` header and treat a second 401 as bad credentials.

use std::collections::HashMap;

use md5::{Digest, Md5};

use crate::Error;

const NONCE_COUNT: &str = "00000001";

/// Parses the parameter list of a `WWW-Authenticate: Digest ...` header.
pub(crate) fn parse_challenge(header: &str) -> HashMap<String, String> {
    let params_str = header.strip_prefix("Digest ").unwrap_or(header).trim();

    let mut params = HashMap::new();
    for part in params_str.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            params.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    params
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", Md5::digest(input.as_bytes()))
}

/// Computes the digest `response` value for a parsed challenge.
///
/// Uses the `qop=auth` form when the challenge advertises it, otherwise the
/// two-part form from the original RFC 2069 scheme.
pub(crate) fn digest_response(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    realm: &str,
    nonce: &str,
    qop: &str,
    cnonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));

    if qop.contains("auth") {
        md5_hex(&format!(
            "{}:{}:{}:{}:auth:{}",
            ha1, nonce, NONCE_COUNT, cnonce, ha2
        ))
    } else {
        md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2))
    }
}

/// Builds the full `Authorization: Digest ...` header value for the retry.
pub(crate) fn authorization_header(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    challenge: &str,
) -> Result<String, Error> {
    let params = parse_challenge(challenge);
    let realm = params
        .get("realm")
        .ok_or_else(|| Error::Auth(format!("missing realm in challenge: {}", challenge)))?;
    let nonce = params
        .get("nonce")
        .ok_or_else(|| Error::Auth(format!("missing nonce in challenge: {}", challenge)))?;
    let qop = params.get("qop").map(String::as_str).unwrap_or("");

    let cnonce = format!("{:08x}", rand::random::<u32>());
    let response = digest_response(username, password, method, uri, realm, nonce, qop, &cnonce);

    let mut value = format!(
        r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{}""#,
        username, realm, nonce, uri, response
    );
    if qop.contains("auth") {
        value.push_str(&format!(r#", qop=auth, nc={}, cnonce="{}""#, NONCE_COUNT, cnonce));
    }
    if let Some(opaque) = params.get("opaque") {
        value.push_str(&format!(r#", opaque="{}""#, opaque));
    }
    Ok(value)
}
