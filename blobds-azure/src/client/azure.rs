//! Azure Blob Storage client.
//!
//! Talks to the Blob service REST API with reqwest and signs every request
//! with Shared Key authorization, so no Azure SDK dependency is needed.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use sha2::Sha256;
use tracing::{debug, info};

use super::{BlobClient, BlobError, BlobItem, BlobPage, BlobProperties, ServiceCode};
use crate::config::AzureConfig;

type HmacSha256 = Hmac<Sha256>;

const API_VERSION: &str = "2021-08-06";

pub struct AzureBlobClient {
    account_name: String,
    account_key: Vec<u8>,
    container: String,
    endpoint: String,
    client: Client,
}

/// A request relative to the account endpoint, before signing.
struct BlobRequest<'a> {
    method: Method,
    /// Already percent-encoded, starting with `/{container}`.
    resource: String,
    query: Vec<(&'a str, String)>,
    /// `x-ms-*` headers other than date and version.
    headers: BTreeMap<String, String>,
    content_type: Option<&'a str>,
    body: Option<Bytes>,
    /// Code reported for a 404 that carries no error code (HEAD responses).
    missing: ServiceCode,
}

impl<'a> BlobRequest<'a> {
    fn new(method: Method, resource: String, missing: ServiceCode) -> Self {
        Self {
            method,
            resource,
            query: Vec::new(),
            headers: BTreeMap::new(),
            content_type: None,
            body: None,
            missing,
        }
    }

    fn query(mut self, name: &'a str, value: impl Into<String>) -> Self {
        self.query.push((name, value.into()));
        self
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }
}

impl AzureBlobClient {
    pub fn new(config: &AzureConfig) -> Result<Self, BlobError> {
        let account_key = STANDARD
            .decode(config.account_key.trim())
            .map_err(|e| BlobError::Credential(format!("account key is not valid base64: {}", e)))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            account_name: config.account_name.clone(),
            account_key,
            container: config.container.clone(),
            endpoint: config.endpoint(),
            client,
        })
    }

    fn container_resource(&self) -> String {
        format!("/{}", urlencoding::encode(&self.container))
    }

    fn blob_resource(&self, name: &str) -> String {
        format!("{}/{}", self.container_resource(), encode_blob_name(name))
    }

    fn authorization(&self, string_to_sign: &str) -> Result<String, BlobError> {
        let mut mac = HmacSha256::new_from_slice(&self.account_key)
            .map_err(|e| BlobError::Credential(e.to_string()))?;
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());
        Ok(format!("SharedKey {}:{}", self.account_name, signature))
    }

    async fn send(&self, request: BlobRequest<'_>) -> Result<Response, BlobError> {
        let BlobRequest {
            method,
            resource,
            query,
            mut headers,
            content_type,
            body,
            missing,
        } = request;

        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        headers.insert("x-ms-date".to_string(), date);
        headers.insert("x-ms-version".to_string(), API_VERSION.to_string());

        let content_length = body.as_ref().map(|b| b.len()).unwrap_or(0);
        let path = format!("{}{}", url_path(&self.endpoint), resource);
        let to_sign = string_to_sign(
            method.as_str(),
            content_length,
            content_type.unwrap_or(""),
            &headers,
            &canonical_resource(&self.account_name, &path, &query),
        );
        let auth = self.authorization(&to_sign)?;

        let mut url = format!("{}{}", self.endpoint, resource);
        if !query.is_empty() {
            let qs: Vec<String> = query
                .iter()
                .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
                .collect();
            url.push('?');
            url.push_str(&qs.join("&"));
        }

        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", auth);
        for (name, value) in &headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(ct) = content_type {
            req = req.header("Content-Type", ct);
        }
        req = match body {
            Some(body) => req.body(body),
            None if method == Method::PUT => req.header("Content-Length", "0"),
            None => req,
        };

        let resp = req.send().await?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        Err(service_error(resp, missing).await)
    }
}

#[async_trait]
impl BlobClient for AzureBlobClient {
    async fn create_container(&self) -> Result<(), BlobError> {
        let request = BlobRequest::new(
            Method::PUT,
            self.container_resource(),
            ServiceCode::ContainerNotFound,
        )
        .query("restype", "container");
        self.send(request).await?;
        info!(container = %self.container, "Created container");
        Ok(())
    }

    async fn upload(&self, name: &str, data: Bytes) -> Result<(), BlobError> {
        let size = data.len();
        let mut request = BlobRequest::new(
            Method::PUT,
            self.blob_resource(name),
            ServiceCode::BlobNotFound,
        )
        .header("x-ms-blob-type", "BlockBlob");
        request.content_type = Some("application/octet-stream");
        request.body = Some(data);
        self.send(request).await?;
        debug!(blob = %name, size, "Blob upload complete");
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<Bytes, BlobError> {
        let request = BlobRequest::new(
            Method::GET,
            self.blob_resource(name),
            ServiceCode::BlobNotFound,
        );
        let resp = self.send(request).await?;
        Ok(resp.bytes().await?)
    }

    async fn get_properties(&self, name: &str) -> Result<BlobProperties, BlobError> {
        let request = BlobRequest::new(
            Method::HEAD,
            self.blob_resource(name),
            ServiceCode::BlobNotFound,
        );
        let resp = self.send(request).await?;
        // HEAD bodies are empty, so read the header rather than the body size.
        let content_length = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| BlobError::Protocol(format!("missing Content-Length for {}", name)))?;
        Ok(BlobProperties { content_length })
    }

    async fn delete(&self, name: &str) -> Result<(), BlobError> {
        let request = BlobRequest::new(
            Method::DELETE,
            self.blob_resource(name),
            ServiceCode::BlobNotFound,
        )
        .header("x-ms-delete-snapshots", "include");
        self.send(request).await?;
        debug!(blob = %name, "Blob delete complete");
        Ok(())
    }

    async fn list_blobs(
        &self,
        prefix: Option<&str>,
        marker: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<BlobPage, BlobError> {
        let mut request = BlobRequest::new(
            Method::GET,
            self.container_resource(),
            ServiceCode::ContainerNotFound,
        )
        .query("restype", "container")
        .query("comp", "list");
        if let Some(prefix) = prefix {
            request = request.query("prefix", prefix);
        }
        if let Some(marker) = marker {
            request = request.query("marker", marker);
        }
        if let Some(max) = max_results {
            request = request.query("maxresults", max.to_string());
        }

        let resp = self.send(request).await?;
        let body = resp.text().await?;
        let page = parse_list_blobs(&body)?;
        debug!(
            blobs = page.items.len(),
            more = page.next_marker.is_some(),
            "Listed blob page"
        );
        Ok(page)
    }
}

async fn service_error(resp: Response, missing: ServiceCode) -> BlobError {
    let status = resp.status().as_u16();
    let header_code = resp
        .headers()
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let body = resp.text().await.unwrap_or_default();

    let code = match header_code.or_else(|| xml_element(&body, "Code")) {
        Some(code) => ServiceCode::from(code.as_str()),
        None if status == 404 => missing,
        None => ServiceCode::Other(format!("HTTP{}", status)),
    };
    let message = xml_element(&body, "Message").unwrap_or_default();
    BlobError::Service {
        status,
        code,
        message,
    }
}

/// Build the Shared Key string-to-sign. Only `Content-Length` and
/// `Content-Type` are ever sent among the standard headers; the rest are
/// empty lines.
fn string_to_sign(
    method: &str,
    content_length: usize,
    content_type: &str,
    ms_headers: &BTreeMap<String, String>,
    canonical_resource: &str,
) -> String {
    let length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };
    let canonical_headers: String = ms_headers
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k.to_ascii_lowercase(), v.trim()))
        .collect();
    format!(
        "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n{}{}",
        method, length, content_type, canonical_headers, canonical_resource
    )
}

fn canonical_resource(account: &str, path: &str, query: &[(&str, String)]) -> String {
    let mut params: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for (name, value) in query {
        params
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.as_str());
    }

    let mut resource = format!("/{}{}", account, path);
    for (name, mut values) in params {
        values.sort_unstable();
        resource.push('\n');
        resource.push_str(&name);
        resource.push(':');
        resource.push_str(&values.join(","));
    }
    resource
}

/// Percent-encode each segment of a blob name, keeping the separators.
fn encode_blob_name(name: &str) -> String {
    name.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Path component of an endpoint URL, without a trailing slash. Empty for
/// host-style endpoints, `/{account}` for path-style emulators.
fn url_path(url: &str) -> &str {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    match without_scheme.find('/') {
        Some(idx) => without_scheme[idx..].trim_end_matches('/'),
        None => "",
    }
}

/// Parse a List Blobs response body.
fn parse_list_blobs(xml: &str) -> Result<BlobPage, BlobError> {
    let mut items = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find("<Blob>") {
        remaining = &remaining[start + "<Blob>".len()..];
        let end = remaining
            .find("</Blob>")
            .ok_or_else(|| BlobError::Protocol("unterminated <Blob> element".to_string()))?;
        let blob = &remaining[..end];

        let name = xml_element(blob, "Name")
            .ok_or_else(|| BlobError::Protocol("blob without <Name>".to_string()))?;
        let content_length = match xml_element(blob, "Content-Length") {
            Some(len) => len.parse::<u64>().map_err(|e| {
                BlobError::Protocol(format!("bad Content-Length for {}: {}", name, e))
            })?,
            None => 0,
        };
        items.push(BlobItem {
            name,
            content_length,
        });
        remaining = &remaining[end + "</Blob>".len()..];
    }

    let next_marker = xml_element(xml, "NextMarker").filter(|m| !m.is_empty());
    Ok(BlobPage { items, next_marker })
}

/// Text content of the first `<tag>` element, entity-unescaped. A
/// self-closing element yields an empty string.
fn xml_element(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut search = xml;
    loop {
        let start = search.find(&open)?;
        let after = &search[start + open.len()..];
        match after.chars().next() {
            Some('>') | Some(' ') | Some('/') => {
                let gt = after.find('>')?;
                if after[..gt].ends_with('/') {
                    return Some(String::new());
                }
                let content = &after[gt + 1..];
                let end = content.find(&close)?;
                return Some(unescape_xml(&content[..end]));
            }
            _ => search = after,
        }
    }
}

fn unescape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .map(|hex| u32::from_str_radix(hex, 16).ok())
                .unwrap_or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => out.push(c),
            None => out.push_str(&tail[..=semi]),
        }
        rest = &tail[semi + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AzureConfig {
        AzureConfig::new("myaccount", STANDARD.encode(b"not-a-real-key"), "blocks")
    }

    #[test]
    fn test_string_to_sign_layout() {
        let mut headers = BTreeMap::new();
        headers.insert("x-ms-version".to_string(), "2021-08-06".to_string());
        headers.insert("x-ms-date".to_string(), "Mon, 01 Jan 2024 00:00:00 GMT".to_string());
        headers.insert("x-ms-blob-type".to_string(), "BlockBlob".to_string());

        let s = string_to_sign(
            "PUT",
            5,
            "application/octet-stream",
            &headers,
            "/myaccount/blocks/a",
        );
        assert_eq!(
            s,
            "PUT\n\n\n5\n\napplication/octet-stream\n\n\n\n\n\n\n\
             x-ms-blob-type:BlockBlob\n\
             x-ms-date:Mon, 01 Jan 2024 00:00:00 GMT\n\
             x-ms-version:2021-08-06\n\
             /myaccount/blocks/a"
        );
    }

    #[test]
    fn test_string_to_sign_omits_zero_length() {
        let s = string_to_sign("GET", 0, "", &BTreeMap::new(), "/acct/c");
        assert_eq!(s, "GET\n\n\n\n\n\n\n\n\n\n\n\n/acct/c");
    }

    #[test]
    fn test_canonical_resource_sorts_query() {
        let query = vec![
            ("restype", "container".to_string()),
            ("comp", "list".to_string()),
            ("marker", "2!88!abc".to_string()),
        ];
        assert_eq!(
            canonical_resource("myaccount", "/blocks", &query),
            "/myaccount/blocks\ncomp:list\nmarker:2!88!abc\nrestype:container"
        );
    }

    #[test]
    fn test_encode_blob_name_keeps_separators() {
        assert_eq!(encode_blob_name("/a b/c?d"), "/a%20b/c%3Fd");
        assert_eq!(encode_blob_name("plain/name"), "plain/name");
    }

    #[test]
    fn test_url_path() {
        assert_eq!(url_path("https://acct.blob.core.windows.net"), "");
        assert_eq!(url_path("https://acct.blob.core.windows.net/"), "");
        assert_eq!(url_path("http://127.0.0.1:10000/devstoreaccount1"), "/devstoreaccount1");
    }

    #[test]
    fn test_parse_list_blobs() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://myaccount.blob.core.windows.net/" ContainerName="blocks">
  <Prefix>/a/</Prefix>
  <MaxResults>2</MaxResults>
  <Blobs>
    <Blob><Name>/a/b</Name><Properties><Content-Length>5</Content-Length><BlobType>BlockBlob</BlobType></Properties></Blob>
    <Blob><Name>/a/x&amp;y</Name><Properties><Content-Length>11</Content-Length></Properties></Blob>
  </Blobs>
  <NextMarker>2!72!MDAwMDE0IS9hL3gmeSEwMDAwMjgh</NextMarker>
</EnumerationResults>"#;
        let page = parse_list_blobs(xml).unwrap();
        assert_eq!(
            page.items,
            vec![
                BlobItem { name: "/a/b".to_string(), content_length: 5 },
                BlobItem { name: "/a/x&y".to_string(), content_length: 11 },
            ]
        );
        assert_eq!(page.next_marker.as_deref(), Some("2!72!MDAwMDE0IS9hL3gmeSEwMDAwMjgh"));
    }

    #[test]
    fn test_parse_last_page() {
        let xml = r#"<EnumerationResults><Blobs /><NextMarker /></EnumerationResults>"#;
        let page = parse_list_blobs(xml).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.next_marker, None);
    }

    #[test]
    fn test_parse_rejects_truncated_body() {
        let xml = "<EnumerationResults><Blobs><Blob><Name>x</Name>";
        assert!(matches!(parse_list_blobs(xml), Err(BlobError::Protocol(_))));
    }

    #[test]
    fn test_xml_error_body() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?><Error><Code>ContainerAlreadyExists</Code><Message>The specified container already exists.</Message></Error>"#;
        assert_eq!(xml_element(body, "Code").as_deref(), Some("ContainerAlreadyExists"));
        assert_eq!(
            xml_element(body, "Message").as_deref(),
            Some("The specified container already exists.")
        );
        assert_eq!(xml_element(body, "Missing"), None);
    }

    #[test]
    fn test_unescape_xml() {
        assert_eq!(unescape_xml("a&lt;b&gt;&quot;c&apos;&amp;"), "a<b>\"c'&");
        assert_eq!(unescape_xml("&#65;&#x42;"), "AB");
        assert_eq!(unescape_xml("&bogus; & tail"), "&bogus; & tail");
    }

    #[test]
    fn test_authorization_header_shape() {
        let client = AzureBlobClient::new(&test_config()).unwrap();
        let auth = client.authorization("GET\n").unwrap();
        let signature = auth.strip_prefix("SharedKey myaccount:").unwrap();
        assert_eq!(STANDARD.decode(signature).unwrap().len(), 32);
        assert_eq!(auth, client.authorization("GET\n").unwrap());
        assert_ne!(auth, client.authorization("PUT\n").unwrap());
    }

    #[test]
    fn test_rejects_non_base64_key() {
        let mut config = test_config();
        config.account_key = "%%%".to_string();
        assert!(matches!(
            AzureBlobClient::new(&config),
            Err(BlobError::Credential(_))
        ));
    }

    #[test]
    fn test_blob_resource() {
        let client = AzureBlobClient::new(&test_config()).unwrap();
        assert_eq!(client.blob_resource("/a/b"), "/blocks//a/b");
        assert_eq!(client.container_resource(), "/blocks");
    }
}
