//! Presigned URL verification.
//!
//! Two query-string signing schemes are accepted:
//! - the native scheme (`X-Stowry-Credential`, `X-Stowry-Date`,
//!   `X-Stowry-Expires`, `X-Stowry-Signature`), a single HMAC over the
//!   method, path and validity window;
//! - AWS Signature Version 4 presigned URLs (`X-Amz-*`), so stock S3 SDK
//!   presigners work unchanged.
//!
//! [`SignatureVerifier`] picks the scheme from the query parameters.  When
//! both are present the native scheme wins.
//!
//! The SigV4 pipeline follows the AWS specification:
//! 1. Build a canonical request
//! 2. Build a string-to-sign
//! 3. Derive a signing key via HMAC chain
//! 4. Compute and compare the signature

use std::sync::Arc;

use axum::http::{HeaderMap, Method, Uri};
use chrono::{NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::keys::SecretStore;

type HmacSha256 = Hmac<Sha256>;

/// Maximum validity window of a presigned URL (7 days).
pub const MAX_EXPIRES_SECONDS: i64 = 604_800;

pub const AWS_ALGORITHM: &str = "AWS4-HMAC-SHA256";

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
const AWS_DATE_TIME_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const AWS_DATE_FORMAT: &str = "%Y%m%d";

pub const STOWRY_CREDENTIAL_PARAM: &str = "X-Stowry-Credential";
pub const STOWRY_DATE_PARAM: &str = "X-Stowry-Date";
pub const STOWRY_EXPIRES_PARAM: &str = "X-Stowry-Expires";
pub const STOWRY_SIGNATURE_PARAM: &str = "X-Stowry-Signature";

pub const AWS_ALGORITHM_PARAM: &str = "X-Amz-Algorithm";
pub const AWS_CREDENTIAL_PARAM: &str = "X-Amz-Credential";
pub const AWS_DATE_PARAM: &str = "X-Amz-Date";
pub const AWS_EXPIRES_PARAM: &str = "X-Amz-Expires";
pub const AWS_SIGNED_HEADERS_PARAM: &str = "X-Amz-SignedHeaders";
pub const AWS_SIGNATURE_PARAM: &str = "X-Amz-Signature";

/// RFC 3986 unreserved characters stay literal; everything else is encoded.
const URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

// ── Errors ──────────────────────────────────────────────────────────

/// Why a presigned request was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("no supported signature found")]
    NoSupportedSignature,

    #[error("missing required signature parameters")]
    MissingParameters,

    #[error("invalid algorithm: expected {AWS_ALGORITHM}, got {0}")]
    InvalidAlgorithm(String),

    #[error("invalid date format")]
    InvalidDateFormat,

    #[error("invalid expires: must be between 1 and {MAX_EXPIRES_SECONDS}")]
    InvalidExpires,

    #[error("signature expired")]
    SignatureExpired,

    #[error("invalid credential format")]
    InvalidCredentialFormat,

    #[error("invalid credential terminator: expected aws4_request")]
    InvalidTerminator,

    #[error("credential date mismatch")]
    CredentialDateMismatch,

    #[error("region mismatch: expected {expected}, got {actual}")]
    RegionMismatch { expected: String, actual: String },

    #[error("service mismatch: expected {expected}, got {actual}")]
    ServiceMismatch { expected: String, actual: String },

    #[error("access key not found")]
    AccessKeyNotFound,

    #[error("signature mismatch")]
    SignatureMismatch,
}

// ── Request view ────────────────────────────────────────────────────

/// The parts of an HTTP request that signatures cover.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Upper-case HTTP method.
    pub method: String,
    /// Path exactly as received (still percent-encoded).
    pub raw_path: String,
    /// Query string without the leading `?`.
    pub raw_query: String,
    /// Lower-case header names with their values.
    pub headers: Vec<(String, String)>,
}

impl RequestInfo {
    pub fn new(
        method: impl Into<String>,
        raw_path: impl Into<String>,
        raw_query: impl Into<String>,
        headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            method: method.into(),
            raw_path: raw_path.into(),
            raw_query: raw_query.into(),
            headers,
        }
    }

    /// Build from the pieces of an inbound `axum` request.
    ///
    /// HTTP/2 requests carry the host in the URI authority rather than a
    /// `Host` header; it is copied over so `host` can be a signed header.
    pub fn from_parts(method: &Method, uri: &Uri, header_map: &HeaderMap) -> Self {
        let mut headers = extract_headers_for_signing(header_map);
        if !headers.iter().any(|(n, _)| n == "host") {
            if let Some(authority) = uri.authority() {
                headers.push(("host".to_string(), authority.to_string()));
                headers.sort();
            }
        }
        Self {
            method: method.as_str().to_string(),
            raw_path: uri.path().to_string(),
            raw_query: uri.query().unwrap_or("").to_string(),
            headers,
        }
    }

    /// Decoded query parameters in their original order.
    pub fn query_params(&self) -> Vec<(String, String)> {
        parse_query_string(&self.raw_query)
    }

    /// `true` if the query carries `name`, even with an empty value.
    pub fn has_param(&self, name: &str) -> bool {
        self.query_params().iter().any(|(k, _)| k == name)
    }

    /// First value of `name`, if present and non-empty.
    fn param(&self, name: &str) -> Option<String> {
        self.query_params()
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
            .filter(|v| !v.is_empty())
    }

    fn decoded_path(&self) -> String {
        percent_decode(&self.raw_path)
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

// ── Facade ──────────────────────────────────────────────────────────

/// Verifies either signing scheme, chosen by which signature parameter is
/// present.
pub struct SignatureVerifier {
    native: NativeVerifier,
    aws: AwsVerifier,
}

impl SignatureVerifier {
    pub fn new(
        region: impl Into<String>,
        service: impl Into<String>,
        store: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            native: NativeVerifier::new(store.clone()),
            aws: AwsVerifier::new(region, service, store),
        }
    }

    pub fn verify(&self, req: &RequestInfo) -> Result<(), SignatureError> {
        self.verify_at(req, Utc::now().timestamp())
    }

    /// Verify against an explicit clock (unix seconds).
    pub fn verify_at(&self, req: &RequestInfo, now: i64) -> Result<(), SignatureError> {
        if req.has_param(STOWRY_SIGNATURE_PARAM) {
            return self.native.verify_at(req, now);
        }
        if req.has_param(AWS_SIGNATURE_PARAM) {
            return self.aws.verify_at(req, now);
        }
        Err(SignatureError::NoSupportedSignature)
    }
}

// ── Native scheme ───────────────────────────────────────────────────

/// Verifier for `X-Stowry-*` presigned URLs.
pub struct NativeVerifier {
    store: Arc<dyn SecretStore>,
}

impl NativeVerifier {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    pub fn verify(&self, req: &RequestInfo) -> Result<(), SignatureError> {
        self.verify_at(req, Utc::now().timestamp())
    }

    pub fn verify_at(&self, req: &RequestInfo, now: i64) -> Result<(), SignatureError> {
        let (credential, date, expires, signature) = match (
            req.param(STOWRY_CREDENTIAL_PARAM),
            req.param(STOWRY_DATE_PARAM),
            req.param(STOWRY_EXPIRES_PARAM),
            req.param(STOWRY_SIGNATURE_PARAM),
        ) {
            (Some(c), Some(d), Some(e), Some(s)) => (c, d, e, s),
            _ => return Err(SignatureError::MissingParameters),
        };

        let expires = parse_expires(&expires)?;

        let timestamp: i64 = date
            .parse()
            .map_err(|_| SignatureError::InvalidDateFormat)?;

        if now > timestamp.saturating_add(expires) {
            return Err(SignatureError::SignatureExpired);
        }

        let secret = self
            .store
            .lookup(&credential)
            .ok_or(SignatureError::AccessKeyNotFound)?;

        let expected = sign_native(&secret, &req.method, &req.decoded_path(), timestamp, expires);
        if !constant_time_eq(&expected, &signature) {
            return Err(SignatureError::SignatureMismatch);
        }

        Ok(())
    }
}

/// Native request signature.
///
/// `hex(HMAC-SHA256(secret, "{METHOD}\n{path}\n{timestamp}\n{expires}"))`
/// where `path` is the decoded URL path including its leading `/`.
pub fn sign_native(secret: &str, method: &str, path: &str, timestamp: i64, expires: i64) -> String {
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        method.to_ascii_uppercase(),
        path,
        timestamp,
        expires
    );
    hex::encode(hmac_sha256(secret.as_bytes(), string_to_sign.as_bytes()))
}

/// Build the query string of a native presigned URL for `path`.
pub fn presign_native(
    access_key: &str,
    secret: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    expires: i64,
) -> String {
    let signature = sign_native(secret, method, path, timestamp, expires);
    format!(
        "{STOWRY_CREDENTIAL_PARAM}={}&{STOWRY_DATE_PARAM}={timestamp}&{STOWRY_EXPIRES_PARAM}={expires}&{STOWRY_SIGNATURE_PARAM}={signature}",
        uri_encode(access_key, true),
    )
}

// ── AWS SigV4 scheme ────────────────────────────────────────────────

/// Verifier for SigV4 presigned URLs (`X-Amz-*`).
pub struct AwsVerifier {
    region: String,
    service: String,
    store: Arc<dyn SecretStore>,
}

impl AwsVerifier {
    pub fn new(
        region: impl Into<String>,
        service: impl Into<String>,
        store: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            region: region.into(),
            service: service.into(),
            store,
        }
    }

    pub fn verify(&self, req: &RequestInfo) -> Result<(), SignatureError> {
        self.verify_at(req, Utc::now().timestamp())
    }

    pub fn verify_at(&self, req: &RequestInfo, now: i64) -> Result<(), SignatureError> {
        let (algorithm, credential, amz_date, expires, signed_headers, signature) = match (
            req.param(AWS_ALGORITHM_PARAM),
            req.param(AWS_CREDENTIAL_PARAM),
            req.param(AWS_DATE_PARAM),
            req.param(AWS_EXPIRES_PARAM),
            req.param(AWS_SIGNED_HEADERS_PARAM),
            req.param(AWS_SIGNATURE_PARAM),
        ) {
            (Some(a), Some(c), Some(d), Some(e), Some(h), Some(s)) => (a, c, d, e, h, s),
            _ => return Err(SignatureError::MissingParameters),
        };

        if algorithm != AWS_ALGORITHM {
            return Err(SignatureError::InvalidAlgorithm(algorithm));
        }

        let request_time = NaiveDateTime::parse_from_str(&amz_date, AWS_DATE_TIME_FORMAT)
            .map_err(|_| SignatureError::InvalidDateFormat)?
            .and_utc();

        let expires = parse_expires(&expires)?;

        if now > request_time.timestamp().saturating_add(expires) {
            return Err(SignatureError::SignatureExpired);
        }

        let cred_parts: Vec<&str> = credential.split('/').collect();
        if cred_parts.len() != 5 {
            return Err(SignatureError::InvalidCredentialFormat);
        }
        if cred_parts[4] != "aws4_request" {
            return Err(SignatureError::InvalidTerminator);
        }
        let (access_key, date_stamp, region, service) =
            (cred_parts[0], cred_parts[1], cred_parts[2], cred_parts[3]);

        if date_stamp != request_time.format(AWS_DATE_FORMAT).to_string() {
            return Err(SignatureError::CredentialDateMismatch);
        }
        if region != self.region {
            return Err(SignatureError::RegionMismatch {
                expected: self.region.clone(),
                actual: region.to_string(),
            });
        }
        if service != self.service {
            return Err(SignatureError::ServiceMismatch {
                expected: self.service.clone(),
                actual: service.to_string(),
            });
        }

        let secret = self
            .store
            .lookup(access_key)
            .ok_or(SignatureError::AccessKeyNotFound)?;

        let canonical_request = build_canonical_request(
            &req.method,
            &req.raw_path,
            &req.raw_query,
            &req.headers,
            &signed_headers,
            UNSIGNED_PAYLOAD,
        );
        let credential_scope = format!("{date_stamp}/{region}/{service}/aws4_request");
        let string_to_sign = build_string_to_sign(&amz_date, &credential_scope, &canonical_request);
        let signing_key = derive_signing_key(&secret, date_stamp, region, service);
        let expected = compute_signature(&signing_key, &string_to_sign);

        if !constant_time_eq(&expected, &signature) {
            return Err(SignatureError::SignatureMismatch);
        }

        Ok(())
    }
}

/// Build the query string of a SigV4 presigned URL signing only `host`.
#[allow(clippy::too_many_arguments)]
pub fn presign_aws(
    access_key: &str,
    secret: &str,
    region: &str,
    service: &str,
    method: &str,
    host: &str,
    raw_path: &str,
    amz_date: &str,
    expires: i64,
) -> String {
    let date_stamp = amz_date.get(..8).unwrap_or(amz_date);
    let credential = format!("{access_key}/{date_stamp}/{region}/{service}/aws4_request");
    let query = format!(
        "{AWS_ALGORITHM_PARAM}={AWS_ALGORITHM}&{AWS_CREDENTIAL_PARAM}={}&{AWS_DATE_PARAM}={amz_date}&{AWS_EXPIRES_PARAM}={expires}&{AWS_SIGNED_HEADERS_PARAM}=host",
        uri_encode(&credential, true),
    );
    let headers = vec![("host".to_string(), host.to_string())];
    let canonical_request =
        build_canonical_request(method, raw_path, &query, &headers, "host", UNSIGNED_PAYLOAD);
    let scope = format!("{date_stamp}/{region}/{service}/aws4_request");
    let string_to_sign = build_string_to_sign(amz_date, &scope, &canonical_request);
    let signing_key = derive_signing_key(secret, date_stamp, region, service);
    let signature = compute_signature(&signing_key, &string_to_sign);
    format!("{query}&{AWS_SIGNATURE_PARAM}={signature}")
}

// ── Canonical request construction ──────────────────────────────────

/// Build the canonical request string.
///
/// ```text
/// HTTPMethod + '\n' +
/// CanonicalURI + '\n' +
/// CanonicalQueryString + '\n' +
/// CanonicalHeaders + '\n' +
/// SignedHeaders + '\n' +
/// HashedPayload
/// ```
pub fn build_canonical_request(
    method: &str,
    raw_path: &str,
    query_string: &str,
    headers: &[(String, String)],
    signed_headers: &str,
    payload_hash: &str,
) -> String {
    let canonical_uri = uri_encode_path(raw_path);
    let canonical_query = build_canonical_query_string(query_string);
    let canonical_headers = build_canonical_headers(headers, signed_headers);

    format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
    )
}

/// Canonical headers: the signed header names in sorted order, each as
/// `name:value\n` with the value trimmed and inner whitespace collapsed.
/// A signed header missing from the request contributes an empty value.
fn build_canonical_headers(headers: &[(String, String)], signed_headers: &str) -> String {
    let mut names: Vec<&str> = signed_headers.split(';').collect();
    names.sort_unstable();

    let mut canonical = String::new();
    for name in names {
        let value = headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| collapse_whitespace(v))
            .unwrap_or_default();
        canonical.push_str(name);
        canonical.push(':');
        canonical.push_str(&value);
        canonical.push('\n');
    }
    canonical
}

/// Build the canonical query string from the raw query string.
///
/// Parameters are decoded, re-encoded with RFC 3986 rules and sorted by
/// name then value.  `X-Amz-Signature` is excluded.
pub fn build_canonical_query_string(query_string: &str) -> String {
    let mut params: Vec<(String, String)> = parse_query_string(query_string)
        .into_iter()
        .filter(|(k, _)| k != AWS_SIGNATURE_PARAM)
        .map(|(k, v)| (uri_encode(&k, true), uri_encode(&v, true)))
        .collect();

    params.sort();

    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Build the string to sign.
///
/// ```text
/// AWS4-HMAC-SHA256 + '\n' +
/// Timestamp + '\n' +
/// CredentialScope + '\n' +
/// HexEncode(SHA256(CanonicalRequest))
/// ```
pub fn build_string_to_sign(
    timestamp: &str,
    credential_scope: &str,
    canonical_request: &str,
) -> String {
    let hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!("{AWS_ALGORITHM}\n{timestamp}\n{credential_scope}\n{hash}")
}

/// Derive the signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC-SHA256("AWS4" + secret, dateStamp)
/// kRegion  = HMAC-SHA256(kDate, region)
/// kService = HMAC-SHA256(kRegion, service)
/// kSigning = HMAC-SHA256(kService, "aws4_request")
/// ```
pub fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Vec<u8> {
    let k_secret = format!("AWS4{secret_key}");
    let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// HexEncode(HMAC-SHA256(SigningKey, StringToSign)).
pub fn compute_signature(signing_key: &[u8], string_to_sign: &str) -> String {
    hex::encode(hmac_sha256(signing_key, string_to_sign.as_bytes()))
}

/// Compare two signature strings in constant time.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// ── Helper functions ────────────────────────────────────────────────

fn parse_expires(raw: &str) -> Result<i64, SignatureError> {
    match raw.parse::<i64>() {
        Ok(n) if n > 0 && n <= MAX_EXPIRES_SECONDS => Ok(n),
        _ => Err(SignatureError::InvalidExpires),
    }
}

/// RFC 3986 encoding; `/` is kept literal unless `encode_slash` is set.
pub fn uri_encode(input: &str, encode_slash: bool) -> String {
    if encode_slash {
        return utf8_percent_encode(input, URI_ENCODE_SET).to_string();
    }
    input
        .split('/')
        .map(|seg| utf8_percent_encode(seg, URI_ENCODE_SET).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Canonical form of a request path: decoded once, then each segment
/// re-encoded, so the result does not depend on how the client escaped it.
pub fn uri_encode_path(raw_path: &str) -> String {
    if raw_path.is_empty() || raw_path == "/" {
        return "/".to_string();
    }
    let encoded = uri_encode(&percent_decode(raw_path), false);
    if encoded.starts_with('/') {
        encoded
    } else {
        format!("/{encoded}")
    }
}

/// Split and decode a raw query string.  `+` decodes to a space.
pub fn parse_query_string(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (k, v) = part.split_once('=').unwrap_or((part, ""));
            (form_decode(k), form_decode(v))
        })
        .collect()
}

fn form_decode(s: &str) -> String {
    percent_decode(&s.replace('+', " "))
}

fn percent_decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Collapse consecutive whitespace in a header value to a single space,
/// and trim leading/trailing whitespace.
fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract headers from a `HeaderMap` as sorted (lowercase-name, value)
/// pairs.  Repeated headers are joined with commas.
pub fn extract_headers_for_signing(header_map: &HeaderMap) -> Vec<(String, String)> {
    let mut grouped: std::collections::BTreeMap<String, Vec<String>> = Default::default();
    for (name, value) in header_map.iter() {
        grouped
            .entry(name.as_str().to_lowercase())
            .or_default()
            .push(value.to_str().unwrap_or("").to_string());
    }
    grouped
        .into_iter()
        .map(|(name, values)| (name, values.join(",")))
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────
