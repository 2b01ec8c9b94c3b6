use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Request methods the server implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }

    /// Whether a request with this method may carry a body.
    pub fn allows_body(self) -> bool {
        !matches!(self, Self::Get)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ();

    /// Method names are case-sensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "DELETE" => Ok(Self::Delete),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http10 => f.write_str("HTTP/1.0"),
            Self::Http11 => f.write_str("HTTP/1.1"),
        }
    }
}

/// Decoded request target. `path` has had dot segments removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uri {
    pub path: String,
    pub query: String,
    pub fragment: String,
}

/// Header map keyed by lowercased field name.
#[derive(Debug, Clone, Default)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    /// Insert a field. A repeated field is combined into a comma separated list.
    pub fn append(&mut self, name: &str, value: &str) {
        self.0
            .entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.0.insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: Uri,
    /// Request target exactly as it appeared on the request line.
    pub raw_target: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub content_length: Option<u64>,
    pub is_chunked: bool,
    pub shall_close_connection: bool,
    /// Filesystem path the request resolved to, filled in by target resolution.
    pub target_resource: String,
}

impl HttpRequest {
    pub fn new(method: Method, path: &str) -> Self {
        Self {
            method,
            uri: Uri {
                path: path.to_string(),
                ..Default::default()
            },
            raw_target: path.to_string(),
            version: Version::Http11,
            headers: Headers::default(),
            body: Vec::new(),
            content_length: None,
            is_chunked: false,
            shall_close_connection: false,
            target_resource: String::new(),
        }
    }

    /// Whether body bytes follow the header section.
    pub fn expects_body(&self) -> bool {
        self.is_chunked || self.content_length.map_or(false, |length| length > 0)
    }

    /// Host header value without a port.
    pub fn host_name(&self) -> Option<&str> {
        let host = self.headers.get("host")?;
        if host.starts_with('[') {
            return host.split(']').next().map(|h| &h[1..]);
        }
        host.rsplit_once(':')
            .map(|(name, _port)| name)
            .or(Some(host))
    }
}
