//! AWS Signature Version 4 请求签名

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("sigv4 {0} is required")]
    MissingField(&'static str),

    #[error("sigv4 invalid url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("sigv4 invalid hmac key")]
    InvalidKey,
}

#[derive(Debug, Clone)]
pub struct SigV4Timestamp {
    pub amz_date: String,
    pub date: String,
}

impl SigV4Timestamp {
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    pub fn from_datetime(datetime: DateTime<Utc>) -> Self {
        Self {
            amz_date: datetime.format("%Y%m%dT%H%M%SZ").to_string(),
            date: datetime.format("%Y%m%d").to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SigV4Signer {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
    region: String,
    service: String,
}

impl SigV4Signer {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: Option<String>,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Result<Self, SigningError> {
        let access_key = access_key.into();
        let secret_key = secret_key.into();
        let region = region.into();
        let service = service.into();

        if access_key.trim().is_empty() {
            return Err(SigningError::MissingField("access_key"));
        }
        if secret_key.trim().is_empty() {
            return Err(SigningError::MissingField("secret_key"));
        }
        if region.trim().is_empty() {
            return Err(SigningError::MissingField("region"));
        }
        if service.trim().is_empty() {
            return Err(SigningError::MissingField("service"));
        }

        Ok(Self {
            access_key,
            secret_key,
            session_token: session_token.filter(|t| !t.trim().is_empty()),
            region,
            service,
        })
    }

    pub fn sign(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        payload: &[u8],
        timestamp: &SigV4Timestamp,
    ) -> Result<SignedRequest, SigningError> {
        let method = method.trim();
        if method.is_empty() {
            return Err(SigningError::MissingField("method"));
        }

        let parsed = Url::parse(url).map_err(|e| SigningError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let host = parsed.host_str().ok_or_else(|| SigningError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        })?;
        let host = match parsed.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let payload_hash = sha256_hex(payload);
        let signed_map = prepare_headers(
            headers,
            &host,
            &timestamp.amz_date,
            &payload_hash,
            self.session_token.as_deref(),
        );
        let (canonical_headers, signed_headers) = canonical_headers(&signed_map);
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method,
            canonical_uri(&parsed),
            canonical_query(&parsed),
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let scope = format!(
            "{}/{}/{}/aws4_request",
            timestamp.date, self.region, self.service
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            timestamp.amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );
        let signature = self.signature(&timestamp.date, &string_to_sign)?;
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, signed_headers, signature
        );

        Ok(SignedRequest {
            authorization,
            amz_date: timestamp.amz_date.clone(),
            content_sha256: payload_hash,
            security_token: self.session_token.clone(),
            canonical_request,
        })
    }

    fn signature(&self, date: &str, string_to_sign: &str) -> Result<String, SigningError> {
        let k_date = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), date)?;
        let k_region = hmac_sha256(&k_date, &self.region)?;
        let k_service = hmac_sha256(&k_region, &self.service)?;
        let k_signing = hmac_sha256(&k_service, "aws4_request")?;
        Ok(hex::encode(hmac_sha256(&k_signing, string_to_sign)?))
    }
}

/// 签名结果，`apply` 写回请求头
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
    pub security_token: Option<String>,
    pub canonical_request: String,
}

impl SignedRequest {
    pub fn apply(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let req = req
            .header("authorization", &self.authorization)
            .header("x-amz-date", &self.amz_date)
            .header("x-amz-content-sha256", &self.content_sha256);
        match self.security_token.as_ref() {
            Some(token) => req.header("x-amz-security-token", token),
            None => req,
        }
    }
}

fn prepare_headers(
    headers: &BTreeMap<String, String>,
    host: &str,
    amz_date: &str,
    payload_hash: &str,
    session_token: Option<&str>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let value = normalize_header_value(value);
        out.entry(name.to_ascii_lowercase())
            .and_modify(|existing: &mut String| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert_with(|| value.clone());
    }

    out.entry("host".to_string())
        .or_insert_with(|| host.to_string());
    out.insert("x-amz-date".to_string(), amz_date.to_string());
    out.entry("x-amz-content-sha256".to_string())
        .or_insert_with(|| payload_hash.to_string());
    if let Some(token) = session_token {
        out.insert(
            "x-amz-security-token".to_string(),
            normalize_header_value(token),
        );
    }
    out
}

fn canonical_headers(headers: &BTreeMap<String, String>) -> (String, String) {
    let mut canonical = String::new();
    for (name, value) in headers {
        canonical.push_str(name);
        canonical.push(':');
        canonical.push_str(value);
        canonical.push('\n');
    }
    let signed = headers.keys().cloned().collect::<Vec<_>>().join(";");
    (canonical, signed)
}

/// 非 S3 服务要求路径再编码一次（`%3A` → `%253A`）
fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        "/".to_string()
    } else {
        aws_percent_encode(path, false)
    }
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (aws_percent_encode(&k, true), aws_percent_encode(&v, true)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn aws_percent_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for &byte in value.as_bytes() {
        let unreserved =
            matches!(byte, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~');
        if unreserved || (!encode_slash && byte == b'/') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn normalize_header_value(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>, SigningError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SigningError::InvalidKey)?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
