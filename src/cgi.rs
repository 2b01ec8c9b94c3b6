//! CGI/1.1 script execution: environment, process pipes and output parsing.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use thiserror::Error;
use tracing::debug;

use crate::config::Location;
use crate::request::HttpRequest;
use crate::response::{server_signature, HttpResponse};
use crate::status::StatusCode;
use crate::target::LocatingInfo;

#[derive(Debug, Error)]
pub enum CgiError {
    #[error("location has no CGI interpreter")]
    NoInterpreter,
    #[error("failed to start CGI process: {0}")]
    Spawn(#[from] io::Error),
    #[error("CGI pipe failed: {0}")]
    Pipe(io::Error),
    #[error("CGI script exited with status {0}")]
    Exited(i32),
    #[error("CGI output exceeds {0} bytes")]
    OutputTooLarge(usize),
    #[error("CGI output is empty")]
    EmptyOutput,
    #[error("CGI output has no end of headers")]
    MissingHeaderEnd,
    #[error("malformed CGI header line: {0:?}")]
    MalformedHeader(String),
    #[error("invalid CGI status: {0:?}")]
    InvalidStatus(String),
    #[error("CGI output has no Content-Type, Location or Status")]
    MissingContentType,
}

impl CgiError {
    /// Status code of the error response.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoInterpreter | Self::Spawn(_) | Self::Pipe(_) | Self::Exited(_) => {
                StatusCode::InternalServerError
            }
            _ => StatusCode::BadGateway,
        }
    }
}

/// How to start a CGI script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: String,
}

/// A running CGI process with non-blocking pipes.
pub trait CgiProcess {
    fn pid(&self) -> u32;
    /// Write end of the script's stdin, until closed.
    fn stdin_fd(&self) -> Option<RawFd>;
    /// Read end of the script's stdout, until closed.
    fn stdout_fd(&self) -> Option<RawFd>;
    fn write_stdin(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn close_stdin(&mut self);
    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn close_stdout(&mut self);
    /// Reap the process if it exited. Returns its exit code, or -1 when it
    /// was killed by a signal.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;
    fn kill(&mut self) -> io::Result<()>;
}

/// Starts CGI processes.
pub trait ProcessOps {
    fn spawn(&self, command: &CgiCommand) -> io::Result<Box<dyn CgiProcess>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessOps;

impl ProcessOps for SystemProcessOps {
    fn spawn(&self, command: &CgiCommand) -> io::Result<Box<dyn CgiProcess>> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .env_clear()
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .current_dir(&command.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let fds = stdin
            .iter()
            .map(AsRawFd::as_raw_fd)
            .chain(stdout.iter().map(AsRawFd::as_raw_fd));
        for fd in fds {
            if let Err(e) = set_nonblocking(fd) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        }
        debug!(pid = child.id(), program = %command.program, "spawned CGI process");
        Ok(Box::new(SystemProcess {
            child,
            stdin,
            stdout,
        }))
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

struct SystemProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
}

impl CgiProcess for SystemProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn stdin_fd(&self) -> Option<RawFd> {
        self.stdin.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn stdout_fd(&self) -> Option<RawFd> {
        self.stdout.as_ref().map(AsRawFd::as_raw_fd)
    }

    fn write_stdin(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.stdin {
            Some(stdin) => stdin.write(buf),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn close_stdin(&mut self) {
        self.stdin = None;
    }

    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.stdout {
            Some(stdout) => stdout.read(buf),
            None => Ok(0),
        }
    }

    fn close_stdout(&mut self) {
        self.stdout = None;
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.code().unwrap_or(-1)))
    }

    fn kill(&mut self) -> io::Result<()> {
        self.stdin = None;
        self.stdout = None;
        self.child.kill()
    }
}

/// Addresses of the connection a CGI request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct Peers {
    pub client: SocketAddr,
    pub local: SocketAddr,
}

/// Command line, environment and working directory for running the script
/// `info` resolved to.
pub fn build_command(
    request: &HttpRequest,
    info: &LocatingInfo,
    location: &Location,
    peers: Peers,
    server_name: &str,
) -> Result<CgiCommand, CgiError> {
    let program = location.cgi_path.clone().ok_or(CgiError::NoInterpreter)?;
    let script = Path::new(&info.target_resource);
    let script = if script.is_absolute() {
        script.to_path_buf()
    } else {
        std::env::current_dir()?.join(script)
    };
    let working_dir = script
        .parent()
        .map(|dir| dir.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string());
    let script_file = script
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut env = vec![
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("REDIRECT_STATUS".to_string(), "200".to_string()),
        ("REQUEST_METHOD".to_string(), request.method.to_string()),
        ("REQUEST_URI".to_string(), request.raw_target.clone()),
        ("QUERY_STRING".to_string(), request.uri.query.clone()),
        ("SCRIPT_NAME".to_string(), info.script_name.clone()),
        (
            "SCRIPT_FILENAME".to_string(),
            script.to_string_lossy().into_owned(),
        ),
        ("PATH_INFO".to_string(), info.path_info.clone()),
        ("REMOTE_ADDR".to_string(), peers.client.ip().to_string()),
        ("REMOTE_PORT".to_string(), peers.client.port().to_string()),
        ("SERVER_ADDR".to_string(), peers.local.ip().to_string()),
        ("SERVER_PORT".to_string(), peers.local.port().to_string()),
        ("SERVER_NAME".to_string(), server_name.to_string()),
        ("SERVER_PROTOCOL".to_string(), request.version.to_string()),
        ("SERVER_SOFTWARE".to_string(), server_signature()),
    ];
    if !info.path_info.is_empty() {
        let root = location.alias.as_deref().unwrap_or(&location.root);
        env.push((
            "PATH_TRANSLATED".to_string(),
            format!("{}{}", root, info.path_info),
        ));
    }
    if !request.is_chunked {
        if let Some(length) = request.content_length {
            env.push(("CONTENT_LENGTH".to_string(), length.to_string()));
        }
    }
    if let Some(content_type) = request.headers.get("content-type") {
        env.push(("CONTENT_TYPE".to_string(), content_type.to_string()));
    }

    let mut http_env: Vec<(String, String)> = request
        .headers
        .iter()
        .filter(|(name, _)| !matches!(*name, "content-length" | "content-type" | "proxy"))
        .map(|(name, value)| {
            (
                format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_")),
                value.to_string(),
            )
        })
        .collect();
    http_env.sort();
    env.extend(http_env);

    Ok(CgiCommand {
        program,
        args: vec![script_file],
        env,
        working_dir,
    })
}

/// Turn the output of a finished script into a response.
pub fn parse_cgi_output(output: &[u8]) -> Result<HttpResponse, CgiError> {
    if output.is_empty() {
        return Err(CgiError::EmptyOutput);
    }
    let (head_end, body_start) = header_end(output).ok_or(CgiError::MissingHeaderEnd)?;
    let head = std::str::from_utf8(&output[..head_end])
        .map_err(|_| CgiError::MalformedHeader(String::from_utf8_lossy(&output[..head_end]).into()))?;

    let mut response = HttpResponse::new(StatusCode::Ok);
    let mut status = None;
    let mut has_content_type = false;
    let mut has_location = false;
    let mut content_length = None;

    let mut lines = head.split('\n').map(|line| line.strip_suffix('\r').unwrap_or(line));
    let mut first = lines.next();
    // Non-parsed-header scripts start with a status line.
    if let Some(line) = first.filter(|line| line.starts_with("HTTP/")) {
        status = Some(parse_status(line.split_whitespace().nth(1).unwrap_or(""), line)?);
        first = None;
    }
    for line in first.into_iter().chain(lines) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| CgiError::MalformedHeader(line.to_string()))?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return Err(CgiError::MalformedHeader(line.to_string()));
        }
        match name.to_ascii_lowercase().as_str() {
            "status" => {
                status = Some(parse_status(value.split_whitespace().next().unwrap_or(""), value)?)
            }
            "content-length" => content_length = value.parse::<usize>().ok(),
            "connection" | "keep-alive" | "transfer-encoding" => {}
            lowercase => {
                has_content_type |= lowercase == "content-type";
                has_location |= lowercase == "location";
                response.headers.push((name.to_string(), value.to_string()));
            }
        }
    }
    if status.is_none() && !has_content_type && !has_location {
        return Err(CgiError::MissingContentType);
    }
    response.status = status.unwrap_or(if has_location {
        StatusCode::Found
    } else {
        StatusCode::Ok
    });

    let body = &output[body_start..];
    match content_length {
        Some(length) => response.body = body[..length.min(body.len())].to_vec(),
        None => {
            response.body = body.to_vec();
            response.chunked = true;
        }
    }
    Ok(response)
}

fn parse_status(code: &str, line: &str) -> Result<StatusCode, CgiError> {
    match code.parse::<u16>() {
        Ok(code) if (100..600).contains(&code) => Ok(StatusCode::from_code_lossy(code)),
        _ => Err(CgiError::InvalidStatus(line.to_string())),
    }
}

/// End of the header block and start of the body, accepting bare LF lines.
fn header_end(output: &[u8]) -> Option<(usize, usize)> {
    let crlf = output
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| (pos, pos + 4));
    let lf = output
        .windows(2)
        .position(|window| window == b"\n\n")
        .map(|pos| (pos, pos + 2));
    match (crlf, lf) {
        (Some(crlf), Some(lf)) => Some(if crlf.0 <= lf.0 { crlf } else { lf }),
        (crlf, lf) => crlf.or(lf),
    }
}

/// Script I/O for one request: feeds the body in, collects the output.
pub struct CgiExchange {
    pub process: Box<dyn CgiProcess>,
    input: Vec<u8>,
    written: usize,
    output: Vec<u8>,
}

impl CgiExchange {
    pub fn start(
        processes: &dyn ProcessOps,
        command: &CgiCommand,
        input: Vec<u8>,
    ) -> Result<Self, CgiError> {
        let mut process = processes.spawn(command)?;
        if input.is_empty() {
            process.close_stdin();
        }
        Ok(Self {
            process,
            input,
            written: 0,
            output: Vec::new(),
        })
    }

    /// Whether request body bytes are still to be written.
    pub fn has_pending_input(&self) -> bool {
        self.process.stdin_fd().is_some()
    }

    /// Write as much pending input as the pipe takes. Returns true once all
    /// of it was written and stdin is closed. A script that exits or closes
    /// stdin before taking the whole body fails the exchange.
    pub fn write_input(&mut self) -> Result<bool, CgiError> {
        while self.written < self.input.len() {
            match self.process.write_stdin(&self.input[self.written..]) {
                Ok(0) => return Err(CgiError::Pipe(io::ErrorKind::WriteZero.into())),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CgiError::Pipe(e)),
            }
        }
        self.process.close_stdin();
        Ok(true)
    }

    /// Read what the script has written so far. Returns true at end of output.
    pub fn read_output(&mut self, buffer_size: usize, max_output: usize) -> Result<bool, CgiError> {
        let mut buf = vec![0; buffer_size];
        match self.process.read_stdout(&mut buf) {
            Ok(0) => {
                self.process.close_stdout();
                Ok(true)
            }
            Ok(n) if self.output.len() + n > max_output => {
                Err(CgiError::OutputTooLarge(max_output))
            }
            Ok(n) => {
                self.output.extend_from_slice(&buf[..n]);
                Ok(false)
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(false)
            }
            Err(e) => Err(CgiError::Pipe(e)),
        }
    }

    pub fn response(&self) -> Result<HttpResponse, CgiError> {
        parse_cgi_output(&self.output)
    }

    /// Kill the script and hand back the process for reaping.
    pub fn abort(mut self) -> Box<dyn CgiProcess> {
        if let Err(e) = self.process.kill() {
            debug!(pid = self.process.pid(), error = %e, "failed to kill CGI process");
        }
        self.process
    }
}
