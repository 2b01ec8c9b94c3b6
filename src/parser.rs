//! HTTP/1.x request parsing: the header section in one pass once it is
//! complete, and the body incrementally as bytes arrive.

use std::cmp::{max, min};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use thiserror::Error;

use crate::request::{Headers, HttpRequest, Method, Uri, Version};
use crate::status::StatusCode;

/// Longest chunk-size or trailer line accepted in a chunked body.
const MAX_CHUNK_LINE_LENGTH: usize = 4096;
const MAX_LABEL_LENGTH: usize = 63;
const MAX_HOST_NAME_LENGTH: usize = 253;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("header section is not valid UTF-8")]
    InvalidEncoding,
    #[error("missing request line")]
    MissingRequestLine,
    #[error("malformed method")]
    MalformedMethod,
    #[error("method {0} is not implemented")]
    MethodNotImplemented(String),
    #[error("request line parts must be separated by a single space")]
    MissingSingleSpace,
    #[error("request target must start with `/'")]
    UriMissingSlash,
    #[error("invalid character in request target")]
    UriInvalidChar,
    #[error("more than one `?' in request target")]
    MultipleQuery,
    #[error("more than one `#' in request target")]
    MultipleFragment,
    #[error("incomplete percent encoding")]
    PercentIncomplete,
    #[error("invalid hex digit in percent encoding")]
    PercentInvalidHex,
    #[error("percent-encoded NUL byte")]
    PercentNul,
    #[error("decoded path is not valid UTF-8")]
    PathNotUtf8,
    #[error("path escapes the document root")]
    DirectoryTraversal,
    #[error("malformed HTTP version")]
    InvalidVersionFormat,
    #[error("HTTP version is not supported")]
    UnsupportedVersion,
    #[error("obsolete line folding in header section")]
    ObsoleteLineFolding,
    #[error("missing colon in header line")]
    HeaderMissingColon,
    #[error("whitespace between header name and colon")]
    HeaderColonWhitespace,
    #[error("invalid character in header name")]
    HeaderNameInvalidChar,
    #[error("invalid character in header value")]
    HeaderValueInvalidChar,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("conflicting Content-Length values")]
    MultipleContentLength,
    #[error("missing Host header")]
    MissingHost,
    #[error("empty Host header")]
    EmptyHost,
    #[error("conflicting Host headers")]
    MultipleHost,
    #[error("invalid Host header")]
    InvalidHost,
    #[error("empty Transfer-Encoding")]
    EmptyTransferEncoding,
    #[error("chunked is not the final transfer coding")]
    NonFinalChunked,
    #[error("unsupported transfer coding")]
    UnsupportedTransferCoding,
    #[error("{0} request must not have a body")]
    UnexpectedBody(Method),
    #[error("invalid chunk size")]
    InvalidChunkSize,
    #[error("chunk exceeds the size limit")]
    ChunkTooLarge,
    #[error("missing CRLF in chunked body")]
    MissingChunkCrlf,
    #[error("chunked trailer section is too large")]
    TrailerTooLarge,
}

impl ParseError {
    /// Status code of the error response.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MethodNotImplemented(_) | Self::UnsupportedTransferCoding => {
                StatusCode::NotImplemented
            }
            Self::UnsupportedVersion => StatusCode::HttpVersionNotSupported,
            Self::UnexpectedBody(_) => StatusCode::MethodNotAllowed,
            Self::ChunkTooLarge => StatusCode::PayloadTooLarge,
            Self::TrailerTooLarge => StatusCode::RequestHeaderFieldsTooLarge,
            _ => StatusCode::BadRequest,
        }
    }
}

/// Find the end of the header section, resuming the search at `from`.
///
/// Returns the index just past the terminating blank line.
pub fn find_header_end(buf: &[u8], from: usize) -> Option<usize> {
    let start = max(from, 3) - 3;
    buf.get(start..)?
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| start + pos + 4)
}

/// Parse a complete header section, including its terminating blank line.
pub fn parse_header(head: &[u8]) -> Result<HttpRequest, ParseError> {
    let text = std::str::from_utf8(head).map_err(|_| ParseError::InvalidEncoding)?;
    let text = text.strip_suffix("\r\n\r\n").unwrap_or(text);
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    let (method, raw_target, uri, version) = parse_request_line(request_line)?;

    let mut headers = Headers::default();
    let mut content_length = None;
    for line in lines {
        parse_header_line(line, &mut headers, &mut content_length)?;
    }

    match headers.get("host") {
        None if version == Version::Http11 => return Err(ParseError::MissingHost),
        None => {}
        Some("") => return Err(ParseError::EmptyHost),
        Some(host) => validate_host(host)?,
    }

    let mut shall_close_connection = false;
    let mut is_chunked = false;
    if let Some(encoding) = headers.get("transfer-encoding") {
        let codings: Vec<String> = encoding
            .split(',')
            .map(|coding| coding.trim().to_ascii_lowercase())
            .filter(|coding| !coding.is_empty())
            .collect();
        match codings.last() {
            None => return Err(ParseError::EmptyTransferEncoding),
            Some(last) if last != "chunked" => return Err(ParseError::NonFinalChunked),
            Some(_) if codings.len() > 1 => return Err(ParseError::UnsupportedTransferCoding),
            Some(_) => {}
        }
        is_chunked = true;
        if content_length.take().is_some() {
            // The framing is ambiguous, so do not reuse the connection.
            headers.remove("content-length");
            shall_close_connection = true;
        }
    }

    if (is_chunked || content_length.map_or(false, |length| length > 0)) && !method.allows_body() {
        return Err(ParseError::UnexpectedBody(method));
    }

    let connection = headers
        .get("connection")
        .unwrap_or("")
        .to_ascii_lowercase();
    let has_token = |token: &str| connection.split(',').any(|t| t.trim() == token);
    shall_close_connection |= match version {
        Version::Http10 => !has_token("keep-alive"),
        Version::Http11 => has_token("close"),
    };

    Ok(HttpRequest {
        method,
        uri,
        raw_target,
        version,
        headers,
        body: Vec::new(),
        content_length,
        is_chunked,
        shall_close_connection,
        target_resource: String::new(),
    })
}

fn parse_request_line(line: &str) -> Result<(Method, String, Uri, Version), ParseError> {
    if line.is_empty() {
        return Err(ParseError::MissingRequestLine);
    }

    let method_end = line.find(' ').unwrap_or_else(|| line.len());
    let method_name = &line[..method_end];
    if method_name.is_empty() || !method_name.bytes().all(is_tchar) {
        return Err(ParseError::MalformedMethod);
    }
    let method = Method::from_str(method_name)
        .map_err(|_| ParseError::MethodNotImplemented(method_name.to_string()))?;

    let rest = single_space(&line[method_end..])?;
    let target_end = rest.find(' ').ok_or(ParseError::MissingSingleSpace)?;
    let raw_target = &rest[..target_end];
    let version = single_space(&rest[target_end..])?;

    let uri = parse_uri(raw_target)?;
    let version = parse_version(version)?;
    Ok((method, raw_target.to_string(), uri, version))
}

/// Strip exactly one leading space.
fn single_space(s: &str) -> Result<&str, ParseError> {
    match s.strip_prefix(' ') {
        Some(rest) if !rest.is_empty() && !rest.starts_with(' ') => Ok(rest),
        _ => Err(ParseError::MissingSingleSpace),
    }
}

/// Parse an origin-form request target into decoded path, query and fragment.
pub fn parse_uri(raw: &str) -> Result<Uri, ParseError> {
    if !raw.starts_with('/') {
        return Err(ParseError::UriMissingSlash);
    }
    if !raw.bytes().all(is_uri_char) {
        return Err(ParseError::UriInvalidChar);
    }

    let (before_fragment, fragment) = match raw.split_once('#') {
        Some((_, fragment)) if fragment.contains('#') => {
            return Err(ParseError::MultipleFragment)
        }
        Some((before, fragment)) => (before, fragment),
        None => (raw, ""),
    };
    let (path, query) = match before_fragment.split_once('?') {
        Some((_, query)) if query.contains('?') => return Err(ParseError::MultipleQuery),
        Some((path, query)) => (path, query),
        None => (before_fragment, ""),
    };

    let path = String::from_utf8(percent_decode(path)?).map_err(|_| ParseError::PathNotUtf8)?;
    // Query and fragment stay encoded, but their escapes must be well formed.
    percent_decode(query)?;
    percent_decode(fragment)?;

    Ok(Uri {
        path: remove_dot_segments(&path)?,
        query: query.to_string(),
        fragment: fragment.to_string(),
    })
}

fn parse_version(version: &str) -> Result<Version, ParseError> {
    let digits = version
        .strip_prefix("HTTP/")
        .ok_or(ParseError::InvalidVersionFormat)?
        .as_bytes();
    match digits.first() {
        Some(major) if major.is_ascii_digit() => {}
        _ => return Err(ParseError::InvalidVersionFormat),
    }
    if digits[0] != b'1' {
        return Err(ParseError::UnsupportedVersion);
    }
    if digits.get(1) != Some(&b'.') {
        return Err(ParseError::InvalidVersionFormat);
    }
    match digits.get(2) {
        Some(minor) if minor.is_ascii_digit() && digits.len() == 3 => match minor {
            b'0' => Ok(Version::Http10),
            b'1' => Ok(Version::Http11),
            _ => Err(ParseError::UnsupportedVersion),
        },
        _ => Err(ParseError::InvalidVersionFormat),
    }
}

fn parse_header_line(
    line: &str,
    headers: &mut Headers,
    content_length: &mut Option<u64>,
) -> Result<(), ParseError> {
    if line.starts_with(' ') || line.starts_with('\t') {
        return Err(ParseError::ObsoleteLineFolding);
    }
    let (name, value) = line.split_once(':').ok_or(ParseError::HeaderMissingColon)?;
    if name.ends_with(' ') || name.ends_with('\t') {
        return Err(ParseError::HeaderColonWhitespace);
    }
    if name.is_empty() || !name.bytes().all(is_tchar) {
        return Err(ParseError::HeaderNameInvalidChar);
    }
    let value = value.trim_matches(|c| c == ' ' || c == '\t');
    if value
        .bytes()
        .any(|b| (b < 0x20 && b != b'\t') || b == 0x7f)
    {
        return Err(ParseError::HeaderValueInvalidChar);
    }

    let name = name.to_ascii_lowercase();
    match name.as_str() {
        "content-length" => {
            let length = parse_content_length(value)?;
            match content_length {
                Some(existing) if *existing != length => {
                    return Err(ParseError::MultipleContentLength)
                }
                Some(_) => {}
                None => {
                    *content_length = Some(length);
                    headers.insert(&name, &length.to_string());
                }
            }
        }
        "host" => match headers.get("host") {
            Some(existing) if existing != value => return Err(ParseError::MultipleHost),
            Some(_) => {}
            None => headers.insert(&name, value),
        },
        _ => headers.append(&name, value),
    }
    Ok(())
}

/// Parse a Content-Length value. A list of identical values is accepted.
fn parse_content_length(value: &str) -> Result<u64, ParseError> {
    let mut length = None;
    for part in value.split(',') {
        let part = part.trim_matches(|c| c == ' ' || c == '\t');
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidContentLength);
        }
        let parsed = part
            .parse::<u64>()
            .map_err(|_| ParseError::InvalidContentLength)?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(ParseError::MultipleContentLength)
            }
            _ => length = Some(parsed),
        }
    }
    length.ok_or(ParseError::InvalidContentLength)
}

/// Validate a Host header: an IP literal or DNS name, with optional port.
pub fn validate_host(host: &str) -> Result<(), ParseError> {
    if let Some(rest) = host.strip_prefix('[') {
        let (address, rest) = rest.split_once(']').ok_or(ParseError::InvalidHost)?;
        Ipv6Addr::from_str(address).map_err(|_| ParseError::InvalidHost)?;
        return match rest {
            "" => Ok(()),
            rest => rest
                .strip_prefix(':')
                .ok_or(ParseError::InvalidHost)
                .and_then(validate_port),
        };
    }
    let name = match host.rsplit_once(':') {
        Some((name, port)) => {
            validate_port(port)?;
            name
        }
        None => host,
    };
    if name.bytes().all(|b| b.is_ascii_digit() || b == b'.') {
        Ipv4Addr::from_str(name)
            .map(|_| ())
            .map_err(|_| ParseError::InvalidHost)
    } else {
        validate_host_name(name)
    }
}

fn validate_port(port: &str) -> Result<(), ParseError> {
    if port.is_empty() {
        return Ok(());
    }
    if !port.bytes().all(|b| b.is_ascii_digit()) || port.parse::<u16>().is_err() {
        return Err(ParseError::InvalidHost);
    }
    Ok(())
}

fn validate_host_name(name: &str) -> Result<(), ParseError> {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > MAX_HOST_NAME_LENGTH {
        return Err(ParseError::InvalidHost);
    }
    let mut has_letter = false;
    for label in name.split('.') {
        if label.is_empty()
            || label.len() > MAX_LABEL_LENGTH
            || label.starts_with('-')
            || label.ends_with('-')
            || !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return Err(ParseError::InvalidHost);
        }
        has_letter |= label.bytes().any(|b| b.is_ascii_alphabetic());
    }
    if !has_letter {
        return Err(ParseError::InvalidHost);
    }
    Ok(())
}

/// RFC 9110 token character.
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}

/// Unreserved and reserved URI characters, plus `%`.
fn is_uri_char(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'-' | b'.'
                | b'_'
                | b'~'
                | b':'
                | b'/'
                | b'?'
                | b'#'
                | b'['
                | b']'
                | b'@'
                | b'!'
                | b'$'
                | b'&'
                | b'\''
                | b'('
                | b')'
                | b'*'
                | b'+'
                | b','
                | b';'
                | b'='
                | b'%'
        )
}

/// Decode %XX escapes. Incomplete or non-hex escapes and `%00` are rejected.
pub fn percent_decode(input: &str) -> Result<Vec<u8>, ParseError> {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'%' {
            decoded.push(bytes[i]);
            i += 1;
            continue;
        }
        if i + 2 >= bytes.len() {
            return Err(ParseError::PercentIncomplete);
        }
        if !bytes[i + 1].is_ascii_hexdigit() || !bytes[i + 2].is_ascii_hexdigit() {
            return Err(ParseError::PercentInvalidHex);
        }
        let value = hex_to_digit(bytes[i + 1]) * 16 + hex_to_digit(bytes[i + 2]);
        if value == 0 {
            return Err(ParseError::PercentNul);
        }
        decoded.push(value);
        i += 3;
    }
    Ok(decoded)
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if (b'A'..=b'F').contains(&hex) {
        hex - b'A' + 10
    } else if (b'a'..=b'f').contains(&hex) {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}

/// Resolve //, /./, and /../ in a path.
///
/// Fails if the path climbs above the root.
pub fn remove_dot_segments(path: &str) -> Result<String, ParseError> {
    let mut url = path.as_bytes().to_vec();

    if !url.starts_with(&[b'/']) {
        return Err(ParseError::UriMissingSlash);
    }

    let mut src_index = 0;
    let mut dst_index = 0;
    while src_index < url.len() {
        if url[src_index] == b'/' && url.get(src_index + 1) == Some(&b'/') {
            // skip slash
            src_index += 1;
        } else if url[src_index] == b'/'
            && url.get(src_index + 1) == Some(&b'.')
            && matches!(url.get(src_index + 2), Some(&b'/') | None)
        {
            // skip slash dot slash
            src_index += 2;
        } else if url[src_index] == b'/'
            && url.get(src_index + 1) == Some(&b'.')
            && url.get(src_index + 2) == Some(&b'.')
            && matches!(url.get(src_index + 3), Some(&b'/') | None)
        {
            // skip slash dot dot slash
            src_index += 3;
            // overwrite previous component
            loop {
                if dst_index == 0 {
                    return Err(ParseError::DirectoryTraversal);
                }
                dst_index -= 1;
                if url[dst_index] == b'/' {
                    break;
                }
            }
        } else {
            url[dst_index] = url[src_index];
            src_index += 1;
            dst_index += 1;
        }
    }

    // Always preserve leading slash
    dst_index = max(dst_index, 1);
    url.truncate(dst_index);

    // Only whole ASCII segments were removed.
    String::from_utf8(url).map_err(|_| ParseError::PathNotUtf8)
}

/// Result of feeding bytes to a `BodyDecoder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Input bytes used. The rest belongs to the next request.
    pub consumed: usize,
    pub done: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    /// Trailer bytes read so far.
    Trailer(usize),
    Done,
}

/// Incremental request body decoder for Content-Length and chunked framing.
#[derive(Debug)]
pub struct BodyDecoder(Framing);

#[derive(Debug)]
enum Framing {
    Fixed {
        remaining: u64,
    },
    Chunked {
        state: ChunkState,
        line: Vec<u8>,
        max_chunk_size: u64,
        max_trailer_size: usize,
    },
}

impl BodyDecoder {
    pub fn fixed(length: u64) -> Self {
        Self(Framing::Fixed { remaining: length })
    }

    pub fn chunked(max_chunk_size: u64) -> Self {
        Self(Framing::Chunked {
            state: ChunkState::Size,
            line: Vec::new(),
            max_chunk_size,
            max_trailer_size: MAX_CHUNK_LINE_LENGTH,
        })
    }

    /// Cap the total size of the trailer section of a chunked body.
    pub fn with_trailer_limit(mut self, limit: usize) -> Self {
        if let Framing::Chunked {
            max_trailer_size, ..
        } = &mut self.0
        {
            *max_trailer_size = limit;
        }
        self
    }

    /// Decoder for the body announced by `request`, if it has one. Chunked
    /// trailers share `max_header_size` with the header section.
    pub fn for_request(
        request: &HttpRequest,
        max_chunk_size: u64,
        max_header_size: usize,
    ) -> Option<Self> {
        if request.is_chunked {
            Some(Self::chunked(max_chunk_size).with_trailer_limit(max_header_size))
        } else {
            match request.content_length {
                Some(length) if length > 0 => Some(Self::fixed(length)),
                _ => None,
            }
        }
    }

    /// Append the payload found in `input` to `body`.
    pub fn decode(&mut self, input: &[u8], body: &mut Vec<u8>) -> Result<Decoded, ParseError> {
        match &mut self.0 {
            Framing::Fixed { remaining } => {
                let take = min(*remaining, input.len() as u64) as usize;
                body.extend_from_slice(&input[..take]);
                *remaining -= take as u64;
                Ok(Decoded {
                    consumed: take,
                    done: *remaining == 0,
                })
            }
            Framing::Chunked {
                state,
                line,
                max_chunk_size,
                max_trailer_size,
            } => decode_chunked(state, line, *max_chunk_size, *max_trailer_size, input, body),
        }
    }
}

fn decode_chunked(
    state: &mut ChunkState,
    line: &mut Vec<u8>,
    max_chunk_size: u64,
    max_trailer_size: usize,
    input: &[u8],
    body: &mut Vec<u8>,
) -> Result<Decoded, ParseError> {
    let mut pos = 0;
    loop {
        match *state {
            ChunkState::Done => {
                return Ok(Decoded {
                    consumed: pos,
                    done: true,
                })
            }
            ChunkState::Data(remaining) => {
                let take = min(remaining, (input.len() - pos) as u64) as usize;
                if take == 0 {
                    break;
                }
                body.extend_from_slice(&input[pos..pos + take]);
                pos += take;
                *state = match remaining - take as u64 {
                    0 => ChunkState::DataEnd,
                    remaining => ChunkState::Data(remaining),
                };
            }
            ChunkState::Size | ChunkState::DataEnd | ChunkState::Trailer(_) => {
                let newline = match input[pos..].iter().position(|&b| b == b'\n') {
                    Some(newline) => newline,
                    None => {
                        line.extend_from_slice(&input[pos..]);
                        pos = input.len();
                        if let ChunkState::Trailer(read) = *state {
                            if read + line.len() > max_trailer_size {
                                return Err(ParseError::TrailerTooLarge);
                            }
                        } else if line.len() > MAX_CHUNK_LINE_LENGTH {
                            return Err(ParseError::InvalidChunkSize);
                        }
                        break;
                    }
                };
                line.extend_from_slice(&input[pos..pos + newline + 1]);
                pos += newline + 1;
                let text = std::mem::take(line);
                let content = text
                    .strip_suffix(b"\r\n")
                    .ok_or(ParseError::MissingChunkCrlf)?;
                *state = match *state {
                    ChunkState::Size => match parse_chunk_size(content)? {
                        0 => ChunkState::Trailer(0),
                        size if size > max_chunk_size => return Err(ParseError::ChunkTooLarge),
                        size => ChunkState::Data(size),
                    },
                    ChunkState::DataEnd if content.is_empty() => ChunkState::Size,
                    ChunkState::DataEnd => return Err(ParseError::MissingChunkCrlf),
                    // trailer fields are read and dropped
                    ChunkState::Trailer(_) if content.is_empty() => ChunkState::Done,
                    ChunkState::Trailer(read) => {
                        let read = read + text.len();
                        if read > max_trailer_size {
                            return Err(ParseError::TrailerTooLarge);
                        }
                        ChunkState::Trailer(read)
                    }
                    _ => return Err(ParseError::MissingChunkCrlf),
                };
            }
        }
    }
    Ok(Decoded {
        consumed: pos,
        done: false,
    })
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let size = line.split(|&b| b == b';').next().unwrap_or(b"");
    let end = size
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(0, |i| i + 1);
    let size = &size[..end];
    if size.is_empty() || size.len() > 15 || !size.iter().all(u8::is_ascii_hexdigit) {
        return Err(ParseError::InvalidChunkSize);
    }
    Ok(size
        .iter()
        .fold(0, |acc, &b| acc * 16 + u64::from(hex_to_digit(b))))
}
