use std::collections::HashMap;
use std::fs::{create_dir_all, File};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("127.0.0.1", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
    _config_dir: TempDir,
}

impl Server {
    /// Start the binary with one server rooted in a fresh tempdir. `directives`
    /// are added to the server block, e.g. location blocks.
    pub fn with_config(directives: &str, args: &[&str]) -> Self {
        let root = tempdir().expect("failed to create tempdir");
        let config_dir = tempdir().expect("failed to create tempdir");

        // Get an unused port. Assumes the port won't be reused before the server starts.
        let port = get_unused_port().expect("failed to get unused port");

        let config_path = config_dir.path().join("webserv.conf");
        let mut config = File::create(&config_path).expect("failed to create config file");
        write!(
            config,
            "server {{\n    listen 127.0.0.1:{};\n    server_name localhost;\n    root {};\n{}\n}}\n",
            port,
            root.path().to_str().expect("path is not valid UTF-8"),
            directives,
        )
        .expect("failed to write config file");

        let child = Command::new(env!("CARGO_BIN_EXE_webserv"))
            .arg(&config_path)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn webserv")
            .into();

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to webserv");

        Self {
            _child: child,
            port,
            root,
            _config_dir: config_dir,
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn create_dir(&self, name: &str) {
        create_dir_all(self.root().join(name)).expect("failed to create directory");
    }

    pub fn create_file(&self, name: &str, content: &[u8]) {
        let path = self.root().join(name);
        if let Some(parent) = path.parent() {
            create_dir_all(parent).expect("failed to create directory");
        }
        File::create(path)
            .and_then(|mut file| file.write_all(content))
            .expect("failed to create file");
    }

    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to webserv");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Send raw request bytes on a new connection and read one response.
    pub fn send(&self, request: &[u8]) -> Response {
        let mut stream = self.stream();
        stream.write_all(request).unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }

    pub fn request(&self, method: &str, path: &str, headers: HashMap<&str, &str>, body: &[u8]) -> Response {
        let mut request = format!("{} {} HTTP/1.1\r\nHost: localhost\r\n", method, path);
        for (name, value) in headers {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !body.is_empty() {
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        request.push_str("Connection: close\r\n\r\n");
        let mut request = request.into_bytes();
        request.extend_from_slice(body);
        self.send(&request)
    }

    pub fn get(&self, path: &str) -> Response {
        self.request("GET", path, HashMap::new(), b"")
    }
}

/// HTTP Response from webserv.
pub struct Response {
    response_line: String,
    headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        let body = if headers
            .get("transfer-encoding")
            .map_or(false, |value| value == "chunked")
        {
            Some(Self::read_chunked_body(reader)?)
        } else {
            headers
                .get("content-length")
                .map(|length| length.parse::<usize>().expect("invalid content length"))
                .map(|length| Self::read_body(reader, length))
                .transpose()?
        };
        Ok(Self {
            response_line,
            headers,
            body,
        })
    }

    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_ascii_lowercase();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }

    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }

    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }

    fn read_chunked_body<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let size_line = Self::read_header(reader)?;
            let size = usize::from_str_radix(size_line.trim(), 16).expect("invalid chunk size");
            if size == 0 {
                Self::read_header(reader)?;
                return Ok(body);
            }
            body.extend(Self::read_body(reader, size)?);
            Self::read_header(reader)?;
        }
    }

    pub fn status(&self) -> &str {
        self.response_line
            .splitn(2, ' ')
            .nth(1)
            .expect("invalid response line")
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|value| value.as_str())
    }

    pub fn text(&self) -> Option<&str> {
        self.body
            .as_ref()
            .map(|body| std::str::from_utf8(body).expect("body is not valid UTF-8"))
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
