//! Embedded client configuration rewriting
//!
//! The UI document carries its client configuration as a base64-encoded JSON
//! object assigned to a script variable:
//!
//! ```text
//! window.chatParams = 'eyJsYW5ndWFnZVNlcnZlclVybCI6Li4ufQ==';
//! ```
//!
//! The RPC base URLs inside it point at the backend's loopback port, which a
//! remote browser cannot reach. The rewriter points them at the proxy instead.
//! This is a narrow text substitution for that one assignment; the document is
//! never parsed as HTML.
//!
//! Only the first assignment in a document is rewritten.

use crate::config::RewriteConfig;
use crate::error::RewriteError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};
use std::ops::Range;
use tracing::{debug, warn};

/// Result of rewriting a UI document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub body: Vec<u8>,
    /// Backend RPC port the document pointed at before rewriting
    pub upstream_port: Option<u16>,
    /// Auth token carried by the document
    pub token: Option<String>,
}

/// Values read from an embedded configuration without changing it
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EmbeddedConfig {
    pub upstream_port: Option<u16>,
    pub token: Option<String>,
}

pub struct ConfigRewriter {
    variable: String,
    url_fields: Vec<String>,
    token_field: String,
    head_marker: String,
}

impl ConfigRewriter {
    pub fn new(config: &RewriteConfig) -> Self {
        Self {
            variable: config.variable.clone(),
            url_fields: config.url_fields.clone(),
            token_field: config.token_field.clone(),
            head_marker: config.head_marker.clone(),
        }
    }

    /// Inject `assets` and point the embedded configuration at `proxy_base_url`.
    ///
    /// Injection is not idempotent: rewriting an already rewritten document
    /// injects the assets a second time. When the blob cannot be decoded the
    /// original input is returned untouched.
    pub fn rewrite(&self, body: &[u8], assets: &str, proxy_base_url: &str) -> Rewrite {
        let injected = self.inject_assets(body, assets);

        let Some(span) = self.find_blob(&injected) else {
            debug!("No embedded configuration in document");
            return Rewrite {
                body: injected,
                upstream_port: None,
                token: None,
            };
        };

        let mut config = match decode_blob(&injected[span.clone()]) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Embedded configuration could not be decoded, passing document through");
                return Rewrite {
                    body: body.to_vec(),
                    upstream_port: None,
                    token: None,
                };
            }
        };

        let embedded = self.read_values(&config);
        for field in &self.url_fields {
            config.insert(field.clone(), Value::String(proxy_base_url.to_string()));
        }

        let encoded = encode_blob(&config);
        let mut out = Vec::with_capacity(injected.len() + encoded.len());
        out.extend_from_slice(&injected[..span.start]);
        out.extend_from_slice(encoded.as_bytes());
        out.extend_from_slice(&injected[span.end..]);

        debug!(
            upstream_port = ?embedded.upstream_port,
            proxy_base_url,
            "Embedded configuration rewritten"
        );

        Rewrite {
            body: out,
            upstream_port: embedded.upstream_port,
            token: embedded.token,
        }
    }

    /// Insert `assets` right after the first head marker, or at the start of
    /// the document when there is none.
    pub fn inject_assets(&self, body: &[u8], assets: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(body.len() + assets.len());
        match find_bytes(body, self.head_marker.as_bytes(), 0) {
            Some(idx) => {
                let split = idx + self.head_marker.len();
                out.extend_from_slice(&body[..split]);
                out.extend_from_slice(assets.as_bytes());
                out.extend_from_slice(&body[split..]);
            }
            None => {
                out.extend_from_slice(assets.as_bytes());
                out.extend_from_slice(body);
            }
        }
        out
    }

    /// Byte range of the base64 payload of the first well-formed assignment
    pub fn find_blob(&self, body: &[u8]) -> Option<Range<usize>> {
        let variable = self.variable.as_bytes();
        let mut from = 0;

        while let Some(idx) = find_bytes(body, variable, from) {
            from = idx + variable.len();
            if let Some(span) = assignment_payload(body, from) {
                return Some(span);
            }
        }
        None
    }

    /// Read the upstream port and token without rewriting anything
    pub fn extract(&self, body: &[u8]) -> Result<Option<EmbeddedConfig>, RewriteError> {
        let Some(span) = self.find_blob(body) else {
            return Ok(None);
        };
        let config = decode_blob(&body[span])?;
        Ok(Some(self.read_values(&config)))
    }

    fn read_values(&self, config: &Map<String, Value>) -> EmbeddedConfig {
        let upstream_port = self
            .url_fields
            .iter()
            .find_map(|f| config.get(f).and_then(Value::as_str))
            .and_then(port_from_url);
        let token = config
            .get(&self.token_field)
            .and_then(Value::as_str)
            .map(String::from);
        EmbeddedConfig {
            upstream_port,
            token,
        }
    }
}

/// `\s* = \s* quote base64 quote`, starting right after the variable name
fn assignment_payload(body: &[u8], mut pos: usize) -> Option<Range<usize>> {
    pos = skip_whitespace(body, pos);
    if body.get(pos) != Some(&b'=') {
        return None;
    }
    pos = skip_whitespace(body, pos + 1);
    if !matches!(body.get(pos), Some(b'\'') | Some(b'"')) {
        return None;
    }

    let start = pos + 1;
    let end = start
        + body[start..]
            .iter()
            .take_while(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
            .count();
    if end == start || !matches!(body.get(end), Some(b'\'') | Some(b'"')) {
        return None;
    }
    Some(start..end)
}

fn skip_whitespace(body: &[u8], mut pos: usize) -> usize {
    while body.get(pos).is_some_and(u8::is_ascii_whitespace) {
        pos += 1;
    }
    pos
}

fn find_bytes(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

/// Decode standard padded base64 into a JSON object
pub fn decode_blob(payload: &[u8]) -> Result<Map<String, Value>, RewriteError> {
    let json = STANDARD.decode(payload)?;
    match serde_json::from_slice(&json)? {
        Value::Object(map) => Ok(map),
        _ => Err(RewriteError::NotObject),
    }
}

/// Encode a JSON object as standard padded base64, keeping key order
pub fn encode_blob(config: &Map<String, Value>) -> String {
    STANDARD.encode(Value::Object(config.clone()).to_string())
}

/// Port of an `http://host:port/...` URL
pub fn port_from_url(url: &str) -> Option<u16> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split('/').next()?;
    let (_, port) = authority.rsplit_once(':')?;
    port.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> ConfigRewriter {
        ConfigRewriter::new(&RewriteConfig::default())
    }

    fn page(blob: &str) -> String {
        format!(
            "<html><head><title>x</title></head><body><script>window.chatParams = '{}';</script></body></html>",
            blob
        )
    }

    fn blob_of(body: &[u8]) -> Map<String, Value> {
        let span = rewriter().find_blob(body).unwrap();
        decode_blob(&body[span]).unwrap()
    }

    #[test]
    fn test_rewrite_points_urls_at_proxy() {
        let blob = STANDARD.encode(r#"{"languageServerUrl":"http://127.0.0.1:37417/"}"#);
        let result = rewriter().rewrite(page(&blob).as_bytes(), "", "http://1.2.3.4:8891/");

        let config = blob_of(&result.body);
        assert_eq!(config["languageServerUrl"], "http://1.2.3.4:8891/");
        assert_eq!(config["httpLanguageServerUrl"], "http://1.2.3.4:8891/");
        assert_eq!(result.upstream_port, Some(37417));
        assert_eq!(result.token, None);
    }

    #[test]
    fn test_rewrite_preserves_other_keys_in_order() {
        let original = r#"{"zeta":1,"languageServerUrl":"http://127.0.0.1:4000/","csrfToken":"ab12","alpha":{"nested":[1,2]},"httpLanguageServerUrl":"http://127.0.0.1:4000/"}"#;
        let blob = STANDARD.encode(original);
        let result = rewriter().rewrite(page(&blob).as_bytes(), "", "http://proxy:8891/");

        let config = blob_of(&result.body);
        let keys: Vec<&str> = config.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["zeta", "languageServerUrl", "csrfToken", "alpha", "httpLanguageServerUrl"]
        );

        let mut expected: Map<String, Value> = serde_json::from_str(original).unwrap();
        expected.insert("languageServerUrl".into(), "http://proxy:8891/".into());
        expected.insert("httpLanguageServerUrl".into(), "http://proxy:8891/".into());
        assert_eq!(config, expected);
        assert_eq!(result.token.as_deref(), Some("ab12"));
    }

    #[test]
    fn test_numbers_survive_verbatim() {
        let original = r#"{"sessionId":123456789012345678901234567890,"ratio":0.1000000000000000055511151231257827,"languageServerUrl":"http://127.0.0.1:4000/"}"#;
        let blob = STANDARD.encode(original);
        let result = rewriter().rewrite(page(&blob).as_bytes(), "", "http://proxy:8891/");

        let span = rewriter().find_blob(&result.body).unwrap();
        let json = String::from_utf8(STANDARD.decode(&result.body[span]).unwrap()).unwrap();
        assert!(json.contains(r#""sessionId":123456789012345678901234567890"#), "{}", json);
        assert!(json.contains(r#""ratio":0.1000000000000000055511151231257827"#), "{}", json);
    }

    #[test]
    fn test_assets_injected_after_head() {
        let blob = STANDARD.encode(r#"{"languageServerUrl":"http://127.0.0.1:1/"}"#);
        let result = rewriter().rewrite(page(&blob).as_bytes(), "<script>p()</script>", "http://h:1/");
        let text = String::from_utf8(result.body).unwrap();
        assert!(text.starts_with("<html><head><script>p()</script><title>"));
    }

    #[test]
    fn test_no_blob_only_injects() {
        let body = b"<html><head></head><body>plain</body></html>";
        let result = rewriter().rewrite(body, "<x>", "http://h:1/");
        assert_eq!(result.body, b"<html><head><x></head><body>plain</body></html>".to_vec());
        assert_eq!(result.upstream_port, None);
    }

    #[test]
    fn test_no_head_marker_prepends() {
        let result = rewriter().rewrite(b"<body>plain</body>", "<x>", "http://h:1/");
        assert_eq!(result.body, b"<x><body>plain</body>".to_vec());
    }

    #[test]
    fn test_undecodable_blob_passes_original_through() {
        let body = page("bm90IGpzb24=");
        let result = rewriter().rewrite(body.as_bytes(), "<x>", "http://h:1/");
        assert_eq!(result.body, body.as_bytes().to_vec());
        assert_eq!(result.upstream_port, None);
    }

    #[test]
    fn test_non_object_blob_is_an_error() {
        let payload = STANDARD.encode("[1,2,3]");
        assert!(matches!(
            decode_blob(payload.as_bytes()),
            Err(RewriteError::NotObject)
        ));
    }

    #[test]
    fn test_double_quotes_and_whitespace() {
        let blob = STANDARD.encode(r#"{"languageServerUrl":"http://127.0.0.1:5555/"}"#);
        let body = format!("<script>window.chatParams\n  =\t\"{}\"</script>", blob);
        let result = rewriter().rewrite(body.as_bytes(), "", "http://p:1/");
        assert_eq!(result.upstream_port, Some(5555));
        let text = String::from_utf8(result.body).unwrap();
        assert!(text.starts_with("<script>window.chatParams\n  =\t\""));
    }

    #[test]
    fn test_only_first_blob_rewritten() {
        let first = STANDARD.encode(r#"{"languageServerUrl":"http://127.0.0.1:1111/"}"#);
        let second = STANDARD.encode(r#"{"languageServerUrl":"http://127.0.0.1:2222/"}"#);
        let body = format!(
            "window.chatParams = '{}'; window.chatParams = '{}';",
            first, second
        );
        let result = rewriter().rewrite(body.as_bytes(), "", "http://p:1/");
        let text = String::from_utf8(result.body).unwrap();
        assert!(text.ends_with(&format!("window.chatParams = '{}';", second)));
        assert!(!text.contains(&first));
        assert_eq!(result.upstream_port, Some(1111));
    }

    #[test]
    fn test_malformed_assignment_skipped() {
        let blob = STANDARD.encode(r#"{"languageServerUrl":"http://127.0.0.1:3333/"}"#);
        let body = format!("if (window.chatParams) {{}} window.chatParams = '{}'", blob);
        let found = rewriter().extract(body.as_bytes()).unwrap().unwrap();
        assert_eq!(found.upstream_port, Some(3333));
    }

    #[test]
    fn test_extract_without_blob() {
        assert_eq!(rewriter().extract(b"<html></html>").unwrap(), None);
    }

    #[test]
    fn test_port_from_url() {
        assert_eq!(port_from_url("http://127.0.0.1:37417/"), Some(37417));
        assert_eq!(port_from_url("http://127.0.0.1:37417/exa.foo"), Some(37417));
        assert_eq!(port_from_url("http://localhost/"), None);
        assert_eq!(port_from_url("not a url"), None);
    }
}
