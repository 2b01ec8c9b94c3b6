//! Response representation and wire serialization.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::fs::File;
use std::io::BufRead;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::status::StatusCode;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=UTF-8";
/// Payload bytes per chunk when a body is sent with chunked coding.
const RESPONSE_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: StatusCode,
    /// Extra header fields, in order. Framing fields are added on serialization.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// File the body came from; its extension picks the Content-Type when
    /// none was set explicitly.
    pub target_resource: String,
    /// Body length was not known up front; use chunked coding when the
    /// client supports it.
    pub chunked: bool,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            target_resource: String::new(),
            chunked: false,
        }
    }

    /// Generated HTML page.
    pub fn html(status: StatusCode, page: String) -> Self {
        let mut response = Self::new(status);
        response.set_header("Content-Type", HTML_CONTENT_TYPE);
        response.body = page.into_bytes();
        response
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        match self
            .headers
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = value.to_string(),
            None => self.headers.push((name.to_string(), value.to_string())),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Serializes responses with the headers every reply carries.
#[derive(Debug)]
pub struct ResponseBuilder<'a> {
    pub mime_map: &'a MimeMap,
    pub server_id: bool,
    /// Advertised in the Keep-Alive header.
    pub keep_alive_timeout: Duration,
}

impl<'a> ResponseBuilder<'a> {
    /// Status line, headers and body as sent on the wire.
    pub fn serialize(
        &self,
        response: &HttpResponse,
        close: bool,
        chunked_allowed: bool,
        now: SystemTime,
    ) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {}\r\n\
            Date: {}\r\n",
            response.status,
            HttpDate(now),
        );
        if self.server_id {
            head.push_str(&format!("Server: {}\r\n", server_signature()));
        }
        for (name, value) in &response.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }

        let has_body = response.status != StatusCode::NoContent;
        if has_body && response.header("Content-Type").is_none() {
            head.push_str(&format!(
                "Content-Type: {}\r\n",
                self.mime_map.url_content_type(&response.target_resource)
            ));
        }
        let chunked = has_body && response.chunked && chunked_allowed;
        if chunked {
            head.push_str("Transfer-Encoding: chunked\r\n");
        } else if has_body {
            head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
        }
        if close {
            head.push_str("Connection: close\r\n");
        } else {
            head.push_str(&format!(
                "Connection: keep-alive\r\n\
                Keep-Alive: timeout={}\r\n",
                self.keep_alive_timeout.as_secs()
            ));
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        if chunked {
            bytes.extend(encode_chunked(&response.body, RESPONSE_CHUNK_SIZE));
        } else if has_body {
            bytes.extend_from_slice(&response.body);
        }
        bytes
    }
}

/// `webserv/<version>`.
pub fn server_signature() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Encode `body` with chunked transfer coding, ending with the last chunk.
pub fn encode_chunked(body: &[u8], chunk_size: usize) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(body.len() + 16);
    for chunk in body.chunks(chunk_size.max(1)) {
        encoded.extend(format!("{:X}\r\n", chunk.len()).into_bytes());
        encoded.extend_from_slice(chunk);
        encoded.extend_from_slice(b"\r\n");
    }
    encoded.extend_from_slice(b"0\r\n\r\n");
    encoded
}

/// Built-in extension map, in the `mime.types` format `--mimetypes` reads.
const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/json        json",
    "application/ogg         ogg",
    "application/pdf         pdf",
    "application/wasm        wasm",
    "application/xml         xsl xml",
    "application/xml-dtd     dtd",
    "application/xslt+xml    xslt",
    "application/zip         zip",
    "audio/mpeg              mp2 mp3 mpga",
    "image/gif               gif",
    "image/jpeg              jpeg jpe jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "image/x-icon            ico",
    "text/css                css",
    "text/html               html htm",
    "text/javascript         js",
    "text/plain              txt asc",
    "video/mpeg              mpeg mpe mpg",
    "video/quicktime         qt mov",
    "video/x-msvideo         avi",
    "video/mp4               mp4",
];

#[derive(Debug)]
pub struct MimeMap {
    mimetypes: HashMap<String, String>,
    pub default_mimetype: String,
}

impl MimeMap {
    /// Add extension map from a file.
    pub fn parse_extension_map_file(&mut self, filename: &OsStr) -> Result<()> {
        let file = File::open(filename)
            .with_context(|| format!("failed to open {}", filename.to_string_lossy()))?;
        for line in std::io::BufReader::new(file).lines() {
            let line =
                line.with_context(|| format!("failed to read {}", filename.to_string_lossy()))?;
            self.add_mimetype_line(&line);
        }
        Ok(())
    }

    /// Add line from an extension map.
    pub fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c: char| c.is_ascii_whitespace())
            .filter(|field| !field.is_empty());
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype,
            None => return, // empty line
        };
        if mimetype.starts_with('#') {
            return; // comment
        }
        for extension in fields {
            self.mimetypes
                .insert(extension.to_string(), mimetype.to_string());
        }
    }

    /// Get content type for a path.
    pub fn url_content_type(&self, url: &str) -> &str {
        let name = url.rsplit('/').next().unwrap_or(url);
        name.rsplit_once('.')
            .and_then(|(_, extension)| self.mimetypes.get(extension))
            .unwrap_or(&self.default_mimetype)
    }
}

impl Default for MimeMap {
    /// Create MimeMap using the default extension map.
    fn default() -> Self {
        let mut mime_map = Self {
            mimetypes: HashMap::new(),
            default_mimetype: DEFAULT_MIME_TYPE.to_string(),
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }
}

/// RFC1123 formatted date.
pub struct HttpDate(pub SystemTime);

impl fmt::Display for HttpDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime = DateTime::<Utc>::from(self.0);
        write!(f, "{}", datetime.format("%a, %d %b %Y %H:%M:%S GMT"))
    }
}

/// "Generated by" line at the bottom of generated pages.
pub struct GeneratedOn {
    pub server_id: bool,
    pub now: SystemTime,
}

impl fmt::Display for GeneratedOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.server_id {
            writeln!(f, "Generated by {} on {}", server_signature(), HttpDate(self.now))?;
        }
        Ok(())
    }
}

/// Encode string to be an RFC3986-compliant URL part.
pub struct UrlEncoded<'a>(pub &'a str);

impl<'a> fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
                write!(f, "{}", c)?;
            } else {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for b in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", b)?;
                }
            }
        }
        Ok(())
    }
}

/// Escape < > & ' " into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

/// Escape a string for use inside a JSON string literal.
pub struct JsonEscaped<'a>(pub &'a str);

impl<'a> fmt::Display for JsonEscaped<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '"' => write!(f, "\\\"")?,
                '\\' => write!(f, "\\\\")?,
                '\n' => write!(f, "\\n")?,
                '\r' => write!(f, "\\r")?,
                '\t' => write!(f, "\\t")?,
                c if c.is_control() => write!(f, "\\u{:04x}", c as u32)?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}
