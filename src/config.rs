//! Server configuration: virtual servers, their locations, and the runtime
//! tunables shared by every connection.
//!
//! The configuration file uses an nginx-like block syntax:
//!
//! ```text
//! server {
//!     listen 127.0.0.1:8080;
//!     server_name example.com;
//!     root html;
//!     location /cgi-bin/ {
//!         allow_methods GET POST;
//!         cgi_ext .py;
//!         cgi_path /usr/bin/python3;
//!     }
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::fs::read_to_string;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;

use crate::request::Method;
use crate::status::StatusCode;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_ROOT: &str = "html";
pub const DEFAULT_INDEX_NAME: &str = "index.html";
pub const DEFAULT_MAX_BODY_SIZE: u64 = 1 << 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("line {line}: unexpected `{found}', expected {expected}")]
    Unexpected {
        line: usize,
        found: String,
        expected: &'static str,
    },
    #[error("unexpected end of file, expected {0}")]
    UnexpectedEof(&'static str),
    #[error("line {line}: unknown directive `{name}' in {context} block")]
    UnknownDirective {
        line: usize,
        name: String,
        context: &'static str,
    },
    #[error("line {line}: invalid `{directive}': {reason}")]
    InvalidValue {
        line: usize,
        directive: String,
        reason: String,
    },
    #[error("line {line}: duplicate location `{path}'")]
    DuplicateLocation { line: usize, path: String },
    #[error("no server blocks defined")]
    NoServers,
}

/// Runtime limits and switches. Passed explicitly to the server instead of
/// living in globals.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Bytes read from a socket or pipe per readiness event.
    pub buffer_size: usize,
    /// Largest accepted header section; larger ones get 431.
    pub client_header_buffer_size: usize,
    pub client_timeout: Duration,
    pub cgi_timeout: Duration,
    pub epoll_timeout: Duration,
    pub max_events: usize,
    /// Largest single chunk of a chunked request body; larger ones get 413.
    pub max_chunk_size: u64,
    /// Depth limit when resolving index files through locations.
    pub max_recursion: usize,
    /// Most bytes a CGI script may print; more gets 502.
    pub max_cgi_output: usize,
    pub shutdown_grace: Duration,
    pub keep_alive: bool,
    /// Whether to send a `Server` header and sign generated pages.
    pub server_id: bool,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            client_header_buffer_size: 8 * 1024,
            client_timeout: Duration::from_secs(60),
            cgi_timeout: Duration::from_secs(60),
            epoll_timeout: Duration::from_secs(1),
            max_events: 64,
            max_chunk_size: 1 << 20,
            max_recursion: 10,
            max_cgi_output: 16 << 20,
            shutdown_grace: Duration::from_secs(5),
            keep_alive: true,
            server_id: true,
        }
    }
}

/// Routing rule for a URI prefix inside a virtual server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: String,
    pub allowed_methods: Vec<Method>,
    pub root: String,
    /// Replaces the matched prefix instead of appending the path to `root`.
    pub alias: Option<String>,
    pub index: Vec<String>,
    pub autoindex: bool,
    pub cgi_ext: Option<String>,
    pub cgi_path: Option<String>,
    /// Configured `return`: status plus target (possibly empty).
    pub redirect: Option<(StatusCode, String)>,
    pub max_body_size: u64,
    pub error_pages: HashMap<StatusCode, String>,
}

impl Location {
    pub fn allows(&self, method: Method) -> bool {
        self.allowed_methods.contains(&method)
    }

    /// Script name and path info of `path` when a URI prefix of it names a
    /// script handled by CGI here.
    pub fn split_cgi_path<'a>(&self, path: &'a str) -> Option<(&'a str, &'a str)> {
        match (&self.cgi_ext, &self.cgi_path) {
            (Some(ext), Some(_)) => split_script_path(path, ext),
            _ => None,
        }
    }
}

/// Split a URI path into the script part (ending in `ext`) and the trailing
/// path info, e.g. `/cgi/a.py/x/y` into `/cgi/a.py` and `/x/y`.
pub fn split_script_path<'a>(path: &'a str, ext: &str) -> Option<(&'a str, &'a str)> {
    let mut search_from = 0;
    while let Some(found) = path[search_from..].find(ext) {
        let end = search_from + found + ext.len();
        let rest = &path[end..];
        if rest.is_empty() || rest.starts_with('/') {
            return Some((&path[..end], rest));
        }
        search_from = end;
    }
    None
}

/// One virtual server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub server_names: Vec<String>,
    pub root: String,
    pub max_body_size: u64,
    pub error_pages: HashMap<StatusCode, String>,
    pub locations: Vec<Location>,
}

impl ServerConfig {
    pub fn is_wildcard(&self) -> bool {
        self.listen.ip().is_unspecified()
    }

    pub fn matches_name(&self, host: &str) -> bool {
        self.server_names
            .iter()
            .any(|name| name.eq_ignore_ascii_case(host))
    }
}

impl Default for ServerConfig {
    /// A single catch-all server on port 8080 serving `html`.
    fn default() -> Self {
        ServerBuilder::default().finish()
    }
}

/// Read and parse a configuration file.
pub fn load_config_file(path: &Path) -> Result<Vec<ServerConfig>> {
    let text = read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config(&text).with_context(|| format!("invalid config file {}", path.display()))
}

/// Parse configuration text into virtual servers.
pub fn parse_config(text: &str) -> Result<Vec<ServerConfig>, ConfigError> {
    let mut parser = Parser {
        tokens: tokenize(text),
        pos: 0,
    };
    let mut servers = Vec::new();
    let wrapped = parser.peek_is("http");
    if wrapped {
        parser.next_token("http")?;
        parser.expect("{")?;
    }
    loop {
        let token = match parser.peek() {
            Some(token) => token.clone(),
            None if wrapped => return Err(ConfigError::UnexpectedEof("`}'")),
            None => break,
        };
        match token.text.as_str() {
            "server" => {
                parser.pos += 1;
                servers.push(parser.parse_server()?.finish());
            }
            "}" if wrapped => {
                parser.pos += 1;
                break;
            }
            name => {
                return Err(ConfigError::UnknownDirective {
                    line: token.line,
                    name: name.to_string(),
                    context: if wrapped { "http" } else { "main" },
                })
            }
        }
    }
    if let Some(token) = parser.peek() {
        return Err(ConfigError::Unexpected {
            line: token.line,
            found: token.text.clone(),
            expected: "end of file",
        });
    }
    if servers.is_empty() {
        return Err(ConfigError::NoServers);
    }
    Ok(servers)
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    text: String,
    line: usize,
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for (index, line) in text.lines().enumerate() {
        let line_number = index + 1;
        let line = line.split('#').next().unwrap_or("");
        let mut current = String::new();
        for c in line.chars() {
            if c.is_whitespace() || matches!(c, '{' | '}' | ';') {
                if !current.is_empty() {
                    tokens.push(Token {
                        text: std::mem::take(&mut current),
                        line: line_number,
                    });
                }
                if !c.is_whitespace() {
                    tokens.push(Token {
                        text: c.to_string(),
                        line: line_number,
                    });
                }
            } else {
                current.push(c);
            }
        }
        if !current.is_empty() {
            tokens.push(Token {
                text: current,
                line: line_number,
            });
        }
    }
    tokens
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_is(&self, text: &str) -> bool {
        matches!(self.peek(), Some(token) if token.text == text)
    }

    fn next_token(&mut self, expected: &'static str) -> Result<Token, ConfigError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(ConfigError::UnexpectedEof(expected))?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, text: &'static str) -> Result<(), ConfigError> {
        let token = self.next_token(text)?;
        if token.text != text {
            return Err(ConfigError::Unexpected {
                line: token.line,
                found: token.text,
                expected: text,
            });
        }
        Ok(())
    }

    /// Collect the arguments of a directive up to its terminating `;`.
    fn arguments(&mut self) -> Result<Vec<String>, ConfigError> {
        let mut args = Vec::new();
        loop {
            let token = self.next_token("`;'")?;
            match token.text.as_str() {
                ";" => return Ok(args),
                "{" | "}" => {
                    return Err(ConfigError::Unexpected {
                        line: token.line,
                        found: token.text,
                        expected: "`;'",
                    })
                }
                _ => args.push(token.text),
            }
        }
    }

    fn parse_server(&mut self) -> Result<ServerBuilder, ConfigError> {
        self.expect("{")?;
        let mut server = ServerBuilder::default();
        loop {
            let token = self.next_token("`}'")?;
            let line = token.line;
            match token.text.as_str() {
                "}" => return Ok(server),
                "location" => {
                    let path = self.next_token("location path")?;
                    if !path.text.starts_with('/') {
                        return Err(invalid(line, "location", "path must start with `/'"));
                    }
                    if server.locations.iter().any(|l| l.path == path.text) {
                        return Err(ConfigError::DuplicateLocation {
                            line,
                            path: path.text,
                        });
                    }
                    let location = self.parse_location(path.text)?;
                    server.locations.push(location);
                }
                "listen" => {
                    let value = single(line, "listen", self.arguments()?)?;
                    server.listen =
                        Some(parse_listen(&value).map_err(|r| invalid(line, "listen", &r))?);
                }
                "server_name" => {
                    let names = self.arguments()?;
                    if names.is_empty() {
                        return Err(invalid(line, "server_name", "missing name"));
                    }
                    server
                        .server_names
                        .extend(names.into_iter().map(|n| n.to_ascii_lowercase()));
                }
                "root" => {
                    server.root = Some(parse_root(&single(line, "root", self.arguments()?)?));
                }
                "client_max_body_size" => {
                    let value = single(line, "client_max_body_size", self.arguments()?)?;
                    server.max_body_size = Some(
                        parse_size(&value)
                            .map_err(|r| invalid(line, "client_max_body_size", &r))?,
                    );
                }
                "error_page" => {
                    parse_error_pages(line, self.arguments()?, &mut server.error_pages)?;
                }
                name => {
                    return Err(ConfigError::UnknownDirective {
                        line,
                        name: name.to_string(),
                        context: "server",
                    })
                }
            }
        }
    }

    fn parse_location(&mut self, path: String) -> Result<LocationBuilder, ConfigError> {
        self.expect("{")?;
        let mut location = LocationBuilder {
            path,
            ..Default::default()
        };
        loop {
            let token = self.next_token("`}'")?;
            let line = token.line;
            match token.text.as_str() {
                "}" => break,
                "allow_methods" => {
                    let mut methods = Vec::new();
                    for name in self.arguments()? {
                        let method = Method::from_str(&name).map_err(|_| {
                            invalid(line, "allow_methods", &format!("unknown method {}", name))
                        })?;
                        if !methods.contains(&method) {
                            methods.push(method);
                        }
                    }
                    location.methods = Some(methods);
                }
                "root" => {
                    location.root = Some(parse_root(&single(line, "root", self.arguments()?)?));
                }
                "alias" => {
                    location.alias = Some(single(line, "alias", self.arguments()?)?);
                }
                "index" => {
                    let index = self.arguments()?;
                    if index.is_empty() {
                        return Err(invalid(line, "index", "missing file name"));
                    }
                    location.index = Some(index);
                }
                "autoindex" => {
                    location.autoindex = match single(line, "autoindex", self.arguments()?)?.as_str()
                    {
                        "on" => true,
                        "off" => false,
                        _ => return Err(invalid(line, "autoindex", "expected on or off")),
                    };
                }
                "cgi_ext" => {
                    let ext = single(line, "cgi_ext", self.arguments()?)?;
                    if !ext.starts_with('.') || ext.len() < 2 {
                        return Err(invalid(line, "cgi_ext", "extension must start with `.'"));
                    }
                    location.cgi_ext = Some(ext);
                }
                "cgi_path" => {
                    location.cgi_path = Some(single(line, "cgi_path", self.arguments()?)?);
                }
                "return" => {
                    location.redirect = Some(parse_return(line, self.arguments()?)?);
                }
                "client_max_body_size" => {
                    let value = single(line, "client_max_body_size", self.arguments()?)?;
                    location.max_body_size = Some(
                        parse_size(&value)
                            .map_err(|r| invalid(line, "client_max_body_size", &r))?,
                    );
                }
                "error_page" => {
                    parse_error_pages(line, self.arguments()?, &mut location.error_pages)?;
                }
                name => {
                    return Err(ConfigError::UnknownDirective {
                        line,
                        name: name.to_string(),
                        context: "location",
                    })
                }
            }
        }
        if location.root.is_some() && location.alias.is_some() {
            return Err(invalid(
                self.tokens[self.pos - 1].line,
                "alias",
                "alias and root are mutually exclusive",
            ));
        }
        Ok(location)
    }
}

fn invalid(line: usize, directive: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        line,
        directive: directive.to_string(),
        reason: reason.to_string(),
    }
}

fn single(line: usize, directive: &str, mut args: Vec<String>) -> Result<String, ConfigError> {
    match args.len() {
        1 => Ok(args.remove(0)),
        0 => Err(invalid(line, directive, "missing value")),
        _ => Err(invalid(line, directive, "expected exactly one value")),
    }
}

fn parse_root(root: &str) -> String {
    root.strip_suffix('/').unwrap_or(root).to_string()
}

/// Parse `port`, `host`, `host:port` or `[v6]:port`. `localhost` is treated as
/// the IPv4 loopback address.
pub fn parse_listen(value: &str) -> Result<SocketAddr, String> {
    let (host, port) = if let Some(rest) = value.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| "unterminated IPv6 address".to_string())?;
        match rest {
            "" => (host, None),
            _ => match rest.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None => return Err(format!("unexpected `{}' after address", rest)),
            },
        }
    } else if value.bytes().all(|b| b.is_ascii_digit()) {
        ("", Some(value))
    } else {
        match value.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (value, None),
        }
    };
    let port = match port {
        Some(port) => match port.parse::<u16>() {
            Ok(port) if port != 0 => port,
            _ => return Err(format!("invalid port {}", port)),
        },
        None => DEFAULT_PORT,
    };
    let ip = match host {
        "" | "*" => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
        host => IpAddr::from_str(host).map_err(|_| format!("invalid host {}", host))?,
    };
    Ok(SocketAddr::new(ip, port))
}

/// Parse a byte size with an optional `k`, `m` or `g` suffix.
pub fn parse_size(value: &str) -> Result<u64, String> {
    let (digits, multiplier) = match value.chars().last() {
        Some('k') | Some('K') => (&value[..value.len() - 1], 1 << 10),
        Some('m') | Some('M') => (&value[..value.len() - 1], 1 << 20),
        Some('g') | Some('G') => (&value[..value.len() - 1], 1 << 30),
        _ => (value, 1),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid size {}", value));
    }
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| format!("size {} is too large", value))
}

fn parse_error_pages(
    line: usize,
    mut args: Vec<String>,
    pages: &mut HashMap<StatusCode, String>,
) -> Result<(), ConfigError> {
    if args.len() < 2 {
        return Err(invalid(line, "error_page", "expected status codes and a URI"));
    }
    let uri = args.pop().unwrap_or_default();
    if !uri.starts_with('/') {
        return Err(invalid(line, "error_page", "URI must start with `/'"));
    }
    for code in args {
        let status = code
            .parse()
            .ok()
            .and_then(StatusCode::from_code)
            .filter(|status| status.is_error())
            .ok_or_else(|| invalid(line, "error_page", &format!("invalid status {}", code)))?;
        pages.insert(status, uri.clone());
    }
    Ok(())
}

fn parse_return(line: usize, args: Vec<String>) -> Result<(StatusCode, String), ConfigError> {
    match args.as_slice() {
        [target] if target.parse::<u16>().is_err() => Ok((StatusCode::Found, target.clone())),
        [code] | [code, _] => {
            let status = code
                .parse()
                .ok()
                .and_then(StatusCode::from_code)
                .ok_or_else(|| invalid(line, "return", &format!("invalid status {}", code)))?;
            Ok((status, args.get(1).cloned().unwrap_or_default()))
        }
        _ => Err(invalid(line, "return", "expected a status and a target")),
    }
}

#[derive(Debug, Default)]
struct ServerBuilder {
    listen: Option<SocketAddr>,
    server_names: Vec<String>,
    root: Option<String>,
    max_body_size: Option<u64>,
    error_pages: HashMap<StatusCode, String>,
    locations: Vec<LocationBuilder>,
}

impl ServerBuilder {
    /// Fill in defaults and push server-level settings down into locations.
    fn finish(self) -> ServerConfig {
        let ServerBuilder {
            listen,
            server_names,
            root,
            max_body_size,
            error_pages,
            mut locations,
        } = self;
        let root = root.unwrap_or_else(|| DEFAULT_ROOT.to_string());
        let max_body_size = max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE);
        if locations.is_empty() {
            locations.push(LocationBuilder {
                path: "/".to_string(),
                ..Default::default()
            });
        }
        let locations = locations
            .into_iter()
            .map(|location| {
                let mut location_error_pages = error_pages.clone();
                location_error_pages.extend(location.error_pages);
                Location {
                    path: location.path,
                    allowed_methods: location.methods.unwrap_or_else(|| vec![Method::Get]),
                    root: location.root.unwrap_or_else(|| root.clone()),
                    alias: location.alias,
                    index: location
                        .index
                        .unwrap_or_else(|| vec![DEFAULT_INDEX_NAME.to_string()]),
                    autoindex: location.autoindex,
                    cgi_ext: location.cgi_ext,
                    cgi_path: location.cgi_path,
                    redirect: location.redirect,
                    max_body_size: location.max_body_size.unwrap_or(max_body_size),
                    error_pages: location_error_pages,
                }
            })
            .collect();
        ServerConfig {
            listen: listen
                .unwrap_or_else(|| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), DEFAULT_PORT)),
            server_names,
            root,
            max_body_size,
            error_pages,
            locations,
        }
    }
}

#[derive(Debug, Default)]
struct LocationBuilder {
    path: String,
    methods: Option<Vec<Method>>,
    root: Option<String>,
    alias: Option<String>,
    index: Option<Vec<String>>,
    autoindex: bool,
    cgi_ext: Option<String>,
    cgi_path: Option<String>,
    redirect: Option<(StatusCode, String)>,
    max_body_size: Option<u64>,
    error_pages: HashMap<StatusCode, String>,
}

/// Reject virtual servers that are identical in listen address and names.
pub fn check_duplicate_servers(configs: &[ServerConfig]) -> Result<(), String> {
    let mut seen = HashSet::new();
    for config in configs {
        let mut names = config.server_names.clone();
        names.sort();
        if !seen.insert((config.listen, names)) {
            return Err(format!(
                "duplicate server for {} with names [{}]",
                config.listen,
                config.server_names.join(" ")
            ));
        }
    }
    Ok(())
}
