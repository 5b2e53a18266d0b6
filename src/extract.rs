//! Content extractors: PDF bytes, uploaded text files, and remote URLs.
//!
//! Each variant produces the same shape — a title and normalized plain
//! text — so the rest of the pipeline never cares where a source came
//! from. The URL extractor refuses private-network hosts before any
//! network I/O happens.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::normalize::{normalize, truncate_chars};

/// File extensions accepted by the text extractor in addition to any
/// `text/*` MIME type.
pub const TEXT_EXTENSIONS: &[&str] = &["txt", "md", "csv"];

/// Upper bound on extracted URL body text.
const URL_TEXT_MAX_CHARS: usize = 50_000;
/// Upper bound on a page title taken from `<title>`.
const URL_TITLE_MAX_CHARS: usize = 120;

/// Extractor output: a display title plus normalized body text.
#[derive(Debug, Clone)]
pub struct Extracted {
    pub title: String,
    pub text: String,
}

// ============ PDF ============

/// Decode a PDF byte stream into normalized text. Page walking and
/// text-run joining happen inside the decoder; the concatenated output
/// is then normalized so per-page joins collapse to single spaces.
pub fn extract_pdf(file_name: &str, bytes: &[u8]) -> Result<Extracted> {
    let raw = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| Error::Extraction(format!("invalid PDF: {}", e)))?;
    Ok(Extracted {
        title: file_name.trim().to_string(),
        text: normalize(&raw),
    })
}

// ============ Text files ============

/// Accept an uploaded file as plain text when its MIME type is in the
/// text family or its extension is on the small allow-list.
pub fn extract_text_file(file_name: &str, mime: &str, content: &str) -> Result<Extracted> {
    if !is_text_like(file_name, mime) {
        return Err(Error::Validation(format!(
            "unsupported file type: {} ({})",
            file_name, mime
        )));
    }
    Ok(Extracted {
        title: file_name.trim().to_string(),
        text: normalize(content),
    })
}

fn is_text_like(file_name: &str, mime: &str) -> bool {
    if mime.to_ascii_lowercase().starts_with("text/") {
        return true;
    }
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| TEXT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

// ============ URLs ============

/// Fetch an HTTP(S) URL and extract its readable text and title.
///
/// Rejects non-http(s) schemes and private/loopback/link-local hosts
/// before any network fetch. Requires a 2xx response with a `text/html`
/// family content type.
pub async fn extract_url(client: &reqwest::Client, url: &str) -> Result<Extracted> {
    let parsed =
        reqwest::Url::parse(url).map_err(|_| Error::Fetch(format!("invalid URL: {}", url)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::Fetch(format!(
                "only http(s) URLs are supported, got {}",
                other
            )))
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| Error::Fetch("URL has no host".to_string()))?
        .to_string();
    if host_is_disallowed(&host) {
        return Err(Error::Fetch(format!("host is not allowed: {}", host)));
    }

    let resp = client
        .get(parsed)
        .send()
        .await
        .map_err(|e| Error::Fetch(format!("request failed: {}", e)))?;

    let status = resp.status();
    if !status.is_success() {
        return Err(Error::Fetch(format!("request failed with status {}", status)));
    }

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if !content_type.starts_with("text/html") && !content_type.contains("xhtml") {
        return Err(Error::Fetch(format!(
            "not an HTML page: content-type {}",
            if content_type.is_empty() {
                "missing"
            } else {
                content_type.as_str()
            }
        )));
    }

    let html = resp
        .text()
        .await
        .map_err(|e| Error::Fetch(format!("failed to read response body: {}", e)))?;

    let title = html_title(&html)
        .map(|t| normalize(&t))
        .filter(|t| !t.is_empty())
        .map(|t| truncate_chars(&t, URL_TITLE_MAX_CHARS))
        .unwrap_or(host);

    let text = truncate_chars(&normalize(&html_to_text(&html)), URL_TEXT_MAX_CHARS);

    Ok(Extracted { title, text })
}

/// SSRF guard: exact `localhost`/`0.0.0.0`, any `*.local` suffix, and
/// the private/loopback IPv4 prefixes 127.*, 10.*, 192.168.* and
/// 172.16.0.0–172.31.255.255.
pub fn host_is_disallowed(host: &str) -> bool {
    let h = host.to_ascii_lowercase();
    if h == "localhost" || h == "0.0.0.0" {
        return true;
    }
    if h.ends_with(".local") {
        return true;
    }
    if h.starts_with("127.") || h.starts_with("10.") || h.starts_with("192.168.") {
        return true;
    }
    if let Some(rest) = h.strip_prefix("172.") {
        if let Some((second, _)) = rest.split_once('.') {
            if let Ok(n) = second.parse::<u16>() {
                if (16..=31).contains(&n) {
                    return true;
                }
            }
        }
    }
    false
}

// ============ HTML stripping ============

fn block_strip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|noscript|svg)\b[^>]*>.*?</(script|style|noscript|svg)\s*>")
            .expect("block strip regex")
    })
}

fn tag_strip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("tag strip regex"))
}

fn title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title regex"))
}

/// Drop script/style/noscript/svg blocks wholesale, then every remaining
/// tag, then decode the minimal entity set the scraper cares about.
fn html_to_text(html: &str) -> String {
    let without_blocks = block_strip_re().replace_all(html, " ");
    let without_tags = tag_strip_re().replace_all(&without_blocks, " ");
    decode_entities(&without_tags)
}

fn html_title(html: &str) -> Option<String> {
    title_re()
        .captures(html)
        .map(|c| decode_entities(&tag_strip_re().replace_all(&c[1], " ")))
}

fn decode_entities(s: &str) -> String {
    // &amp; last so freshly produced ampersands are not re-decoded.
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
