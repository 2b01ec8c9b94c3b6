//! Per-client connection state machine.

use std::io::{self, Read, Write};
use std::mem;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::body::ResponseBodyHandler;
use crate::cgi::{build_command, CgiError, CgiExchange, CgiProcess, Peers, ProcessOps};
use crate::config::{ServerConfig, Tunables};
use crate::fs::FileSystem;
use crate::log::AccessRecord;
use crate::parser::{find_header_end, parse_header, BodyDecoder};
use crate::poller::Interest;
use crate::request::{HttpRequest, Version};
use crate::response::{HttpResponse, MimeMap, ResponseBuilder};
use crate::server::select_server;
use crate::status::StatusCode;
use crate::target::{match_location, LocatingInfo, TargetResourceHandler};

/// Byte stream to a client.
pub trait ClientStream: Read + Write + AsRawFd {}

impl ClientStream for TcpStream {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Keep-alive connection between requests.
    Idle,
    ReceivingHeader,
    ReceivingBody,
    SendingToCgi,
    ReceivingFromCgi,
    /// Script output is complete; its exit status is still pending.
    AwaitingCgiExit,
    BuildingResponse,
    SendingResponse,
    Closed,
}

/// Server-wide state a connection needs while handling an event.
pub struct Context<'a> {
    pub configs: &'a [ServerConfig],
    pub tunables: &'a Tunables,
    pub fs: &'a dyn FileSystem,
    pub processes: &'a dyn ProcessOps,
    pub mime_map: &'a MimeMap,
    pub now: SystemTime,
}

enum PipeProgress {
    Pending,
    InputDone,
    OutputDone,
}

pub struct Connection {
    stream: Box<dyn ClientStream>,
    client: SocketAddr,
    local: SocketAddr,
    /// Virtual servers reachable through the socket that accepted the client.
    candidates: Vec<usize>,
    state: ConnectionState,
    last_active: SystemTime,
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched for the end of the header section.
    scanned: usize,
    server: Option<usize>,
    request: Option<HttpRequest>,
    decoder: Option<BodyDecoder>,
    body_limit: u64,
    located: Option<LocatingInfo>,
    cgi: Option<CgiExchange>,
    response: Vec<u8>,
    sent: usize,
    status: Option<StatusCode>,
    close_after_response: bool,
    records: Vec<AccessRecord>,
    orphans: Vec<Box<dyn CgiProcess>>,
    /// Interest currently registered for the client socket.
    pub(crate) registered: Option<Interest>,
    /// CGI pipe currently registered on behalf of this connection.
    pub(crate) registered_pipe: Option<RawFd>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Connection {
    pub fn new(
        stream: Box<dyn ClientStream>,
        client: SocketAddr,
        local: SocketAddr,
        candidates: Vec<usize>,
        now: SystemTime,
    ) -> Self {
        Self {
            stream,
            client,
            local,
            candidates,
            state: ConnectionState::Idle,
            last_active: now,
            buffer: Vec::new(),
            scanned: 0,
            server: None,
            request: None,
            decoder: None,
            body_limit: 0,
            located: None,
            cgi: None,
            response: Vec::new(),
            sent: 0,
            status: None,
            close_after_response: false,
            records: Vec::new(),
            orphans: Vec::new(),
            registered: None,
            registered_pipe: None,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// What the client socket should be polled for.
    pub fn interest(&self) -> Interest {
        match self.state {
            ConnectionState::Idle
            | ConnectionState::ReceivingHeader
            | ConnectionState::ReceivingBody => Interest::Readable,
            ConnectionState::SendingResponse => Interest::Writable,
            _ => Interest::Suspended,
        }
    }

    /// CGI pipe to poll, if the connection is waiting on its script.
    pub fn pipe_interest(&self) -> Option<(RawFd, Interest)> {
        let exchange = self.cgi.as_ref()?;
        match self.state {
            ConnectionState::SendingToCgi => exchange
                .process
                .stdin_fd()
                .map(|fd| (fd, Interest::Writable)),
            ConnectionState::ReceivingFromCgi => exchange
                .process
                .stdout_fd()
                .map(|fd| (fd, Interest::Readable)),
            _ => None,
        }
    }

    /// Whether the script's exit status has to be polled for.
    pub fn awaiting_cgi_exit(&self) -> bool {
        self.state == ConnectionState::AwaitingCgiExit
    }

    /// Completed requests not yet written to the access log.
    pub fn take_records(&mut self) -> Vec<AccessRecord> {
        mem::take(&mut self.records)
    }

    /// CGI processes that still have to be reaped.
    pub fn take_orphans(&mut self) -> Vec<Box<dyn CgiProcess>> {
        mem::take(&mut self.orphans)
    }

    pub fn on_readable(&mut self, ctx: &Context) {
        if !matches!(
            self.state,
            ConnectionState::Idle | ConnectionState::ReceivingHeader | ConnectionState::ReceivingBody
        ) {
            return;
        }
        let mut buf = vec![0; ctx.tunables.buffer_size.max(1)];
        match self.stream.read(&mut buf) {
            Ok(0) => {
                debug!(client = %self.client, "client closed connection");
                self.state = ConnectionState::Closed;
            }
            Ok(n) => {
                self.buffer.extend_from_slice(&buf[..n]);
                self.bytes_in += n as u64;
                self.last_active = ctx.now;
                if self.state == ConnectionState::Idle {
                    self.state = ConnectionState::ReceivingHeader;
                }
                self.process_input(ctx);
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(client = %self.client, error = %e, "recv failed");
                self.state = ConnectionState::Closed;
            }
        }
    }

    pub fn on_writable(&mut self, ctx: &Context) {
        if self.state != ConnectionState::SendingResponse {
            return;
        }
        self.flush(ctx);
        self.process_input(ctx);
    }

    /// The client socket reported a hangup or an error.
    pub fn on_hangup(&mut self, ctx: &Context) {
        match self.interest() {
            Interest::Readable => self.on_readable(ctx),
            Interest::Writable => self.on_writable(ctx),
            Interest::Suspended => {
                debug!(client = %self.client, "client hung up");
                self.close();
            }
        }
    }

    /// The CGI pipe returned by `pipe_interest` is ready.
    pub fn on_pipe_ready(&mut self, ctx: &Context) {
        let progress = match (self.state, self.cgi.as_mut()) {
            (ConnectionState::SendingToCgi, Some(exchange)) => {
                exchange.write_input().map(|done| {
                    if done {
                        PipeProgress::InputDone
                    } else {
                        PipeProgress::Pending
                    }
                })
            }
            (ConnectionState::ReceivingFromCgi, Some(exchange)) => exchange
                .read_output(ctx.tunables.buffer_size.max(1), ctx.tunables.max_cgi_output)
                .map(|eof| {
                    if eof {
                        PipeProgress::OutputDone
                    } else {
                        PipeProgress::Pending
                    }
                }),
            _ => return,
        };
        self.last_active = ctx.now;
        match progress {
            Ok(PipeProgress::Pending) => {}
            Ok(PipeProgress::InputDone) => self.state = ConnectionState::ReceivingFromCgi,
            Ok(PipeProgress::OutputDone) => self.finish_cgi(ctx),
            Err(e) => {
                warn!(client = %self.client, error = %e, "CGI exchange failed");
                self.abort_cgi();
                self.respond_error(e.status(), ctx);
            }
        }
        // A pipelined request may be waiting behind the CGI one.
        self.process_input(ctx);
    }

    /// Enforce the client and CGI timeouts, and collect the exit status of a
    /// script that finished its output.
    pub fn check_timeout(&mut self, ctx: &Context) {
        if self.state == ConnectionState::AwaitingCgiExit {
            self.finish_cgi(ctx);
            if self.state != ConnectionState::AwaitingCgiExit {
                self.process_input(ctx);
                return;
            }
        }
        let limit = match self.state {
            ConnectionState::Closed => return,
            ConnectionState::SendingToCgi
            | ConnectionState::ReceivingFromCgi
            | ConnectionState::AwaitingCgiExit => ctx.tunables.cgi_timeout,
            _ => ctx.tunables.client_timeout,
        };
        let elapsed = ctx
            .now
            .duration_since(self.last_active)
            .unwrap_or_else(|_| Duration::from_secs(0));
        if elapsed < limit {
            return;
        }
        match self.state {
            ConnectionState::SendingToCgi
            | ConnectionState::ReceivingFromCgi
            | ConnectionState::AwaitingCgiExit => {
                warn!(client = %self.client, "CGI script timed out");
                self.abort_cgi();
                self.close_after_response = true;
                self.last_active = ctx.now;
                self.respond_error(StatusCode::GatewayTimeout, ctx);
            }
            ConnectionState::Idle
            | ConnectionState::ReceivingHeader
            | ConnectionState::ReceivingBody => {
                debug!(client = %self.client, "client timed out");
                // Best effort: whatever part of the 408 fits is sent now.
                self.fail(StatusCode::RequestTimeout, ctx);
                self.state = ConnectionState::Closed;
            }
            _ => {
                debug!(client = %self.client, "send timed out");
                self.state = ConnectionState::Closed;
            }
        }
    }

    /// Stop all work, killing a running script.
    pub fn close(&mut self) {
        self.abort_cgi();
        self.state = ConnectionState::Closed;
    }

    fn process_input(&mut self, ctx: &Context) {
        loop {
            let progressed = match self.state {
                ConnectionState::ReceivingHeader => self.receive_header(ctx),
                ConnectionState::ReceivingBody => self.receive_body(ctx),
                _ => false,
            };
            if !progressed {
                return;
            }
        }
    }

    /// Returns false when more input is needed.
    fn receive_header(&mut self, ctx: &Context) -> bool {
        // Empty lines before a request line are ignored.
        while self.buffer.starts_with(b"\r\n") {
            self.buffer.drain(..2);
            self.scanned = 0;
        }
        if self.buffer.is_empty() {
            self.state = ConnectionState::Idle;
            return false;
        }
        let limit = ctx.tunables.client_header_buffer_size;
        let end = match find_header_end(&self.buffer, self.scanned) {
            Some(end) => end,
            None if self.buffer.len() > limit => {
                debug!(client = %self.client, "request header too large");
                self.fail(StatusCode::RequestHeaderFieldsTooLarge, ctx);
                return true;
            }
            None => {
                self.scanned = self.buffer.len();
                return false;
            }
        };
        self.scanned = 0;
        if end > limit {
            debug!(client = %self.client, "request header too large");
            self.fail(StatusCode::RequestHeaderFieldsTooLarge, ctx);
            return true;
        }
        let head: Vec<u8> = self.buffer.drain(..end).collect();
        match parse_header(&head) {
            Ok(request) => self.start_request(request, ctx),
            Err(e) => {
                debug!(client = %self.client, error = %e, "rejecting request");
                self.fail(e.status(), ctx);
            }
        }
        true
    }

    fn start_request(&mut self, request: HttpRequest, ctx: &Context) {
        let server = select_server(ctx.configs, &self.candidates, self.local, request.host_name());
        self.server = Some(server);
        self.close_after_response = request.shall_close_connection || !ctx.tunables.keep_alive;
        debug!(
            client = %self.client,
            method = %request.method,
            target = %request.raw_target,
            "received request"
        );
        self.body_limit = match ctx.configs.get(server) {
            Some(config) => match_location(&config.locations, &request.uri.path)
                .map_or(config.max_body_size, |index| {
                    config.locations[index].max_body_size
                }),
            None => 0,
        };
        let oversized = request
            .content_length
            .map_or(false, |length| length > self.body_limit);
        self.decoder = BodyDecoder::for_request(
            &request,
            ctx.tunables.max_chunk_size,
            ctx.tunables.client_header_buffer_size,
        );
        self.request = Some(request);
        if oversized {
            self.fail(StatusCode::PayloadTooLarge, ctx);
        } else if self.decoder.is_some() {
            self.state = ConnectionState::ReceivingBody;
        } else {
            self.dispatch(ctx);
        }
    }

    /// Returns false when more input is needed.
    fn receive_body(&mut self, ctx: &Context) -> bool {
        let decoded = match (&mut self.decoder, &mut self.request) {
            (Some(decoder), Some(request)) => decoder
                .decode(&self.buffer, &mut request.body)
                .map(|decoded| (decoded, request.body.len() as u64)),
            _ => return false,
        };
        match decoded {
            Err(e) => {
                debug!(client = %self.client, error = %e, "invalid request body");
                self.fail(e.status(), ctx);
            }
            Ok((decoded, body_length)) => {
                self.buffer.drain(..decoded.consumed);
                if body_length > self.body_limit {
                    self.fail(StatusCode::PayloadTooLarge, ctx);
                } else if decoded.done {
                    self.decoder = None;
                    self.dispatch(ctx);
                } else {
                    return false;
                }
            }
        }
        true
    }

    fn dispatch(&mut self, ctx: &Context) {
        let config = match self.server.and_then(|index| ctx.configs.get(index)) {
            Some(config) => config,
            None => return self.fail(StatusCode::InternalServerError, ctx),
        };
        let request = match self.request.as_mut() {
            Some(request) => request,
            None => return,
        };
        let targets = TargetResourceHandler::new(ctx.fs, ctx.tunables.max_recursion);
        let info = targets.execute(request, config);
        if info.is_cgi && info.status == StatusCode::Ok {
            return self.start_cgi(info, config, ctx);
        }
        self.state = ConnectionState::BuildingResponse;
        let handler = ResponseBodyHandler::new(ctx.fs, &targets, ctx.tunables.server_id, ctx.now);
        let response = handler.execute(request, &info, config);
        self.located = Some(info);
        self.send(response, ctx);
    }

    fn start_cgi(&mut self, info: LocatingInfo, config: &ServerConfig, ctx: &Context) {
        let location = match info.location.and_then(|index| config.locations.get(index)) {
            Some(location) => location,
            None => return self.fail(StatusCode::InternalServerError, ctx),
        };
        let peers = Peers {
            client: self.client,
            local: self.local,
        };
        let request = match self.request.as_mut() {
            Some(request) => request,
            None => return,
        };
        let server_name = request
            .host_name()
            .map(str::to_string)
            .or_else(|| config.server_names.first().cloned())
            .unwrap_or_else(|| peers.local.ip().to_string());
        let started = build_command(request, &info, location, peers, &server_name).and_then(
            |command| CgiExchange::start(ctx.processes, &command, mem::take(&mut request.body)),
        );
        match started {
            Ok(exchange) => {
                debug!(
                    pid = exchange.process.pid(),
                    script = %info.target_resource,
                    "started CGI script"
                );
                self.state = if exchange.has_pending_input() {
                    ConnectionState::SendingToCgi
                } else {
                    ConnectionState::ReceivingFromCgi
                };
                self.cgi = Some(exchange);
                self.located = Some(info);
                self.last_active = ctx.now;
            }
            Err(e) => {
                warn!(script = %info.target_resource, error = %e, "failed to run CGI script");
                self.located = Some(info);
                self.respond_error(e.status(), ctx);
            }
        }
    }

    /// Answer from the script's output once it exited successfully.
    fn finish_cgi(&mut self, ctx: &Context) {
        let waited = match self.cgi.as_mut() {
            Some(exchange) => exchange.process.try_wait(),
            None => return,
        };
        let code = match waited {
            Ok(Some(code)) => code,
            Ok(None) => {
                self.state = ConnectionState::AwaitingCgiExit;
                return;
            }
            Err(e) => {
                warn!(client = %self.client, error = %e, "failed to reap CGI script");
                self.abort_cgi();
                return self.respond_error(StatusCode::InternalServerError, ctx);
            }
        };
        let exchange = match self.cgi.take() {
            Some(exchange) => exchange,
            None => return,
        };
        debug!(pid = exchange.process.pid(), code, "CGI script exited");
        let result = if code == 0 {
            exchange.response()
        } else {
            Err(CgiError::Exited(code))
        };
        match result {
            Ok(response) => {
                self.state = ConnectionState::BuildingResponse;
                self.send(response, ctx);
            }
            Err(e) => {
                warn!(client = %self.client, error = %e, "CGI script failed");
                self.respond_error(e.status(), ctx);
            }
        }
    }

    fn abort_cgi(&mut self) {
        if let Some(exchange) = self.cgi.take() {
            self.orphans.push(exchange.abort());
        }
    }

    /// Reply with an error and close the connection afterwards.
    fn fail(&mut self, status: StatusCode, ctx: &Context) {
        self.close_after_response = true;
        self.decoder = None;
        self.respond_error(status, ctx);
    }

    fn respond_error(&mut self, status: StatusCode, ctx: &Context) {
        let server = self
            .server
            .unwrap_or_else(|| select_server(ctx.configs, &self.candidates, self.local, None));
        let targets = TargetResourceHandler::new(ctx.fs, ctx.tunables.max_recursion);
        let handler = ResponseBodyHandler::new(ctx.fs, &targets, ctx.tunables.server_id, ctx.now);
        let response = match ctx.configs.get(server) {
            Some(config) => {
                let location = self
                    .located
                    .as_ref()
                    .and_then(|info| info.location)
                    .or_else(|| {
                        self.request
                            .as_ref()
                            .and_then(|request| match_location(&config.locations, &request.uri.path))
                    });
                handler.error_response(status, location, config)
            }
            None => handler.default_page(status),
        };
        self.send(response, ctx);
    }

    fn send(&mut self, response: HttpResponse, ctx: &Context) {
        let version = self
            .request
            .as_ref()
            .map_or(Version::Http11, |request| request.version);
        let builder = ResponseBuilder {
            mime_map: ctx.mime_map,
            server_id: ctx.tunables.server_id,
            keep_alive_timeout: ctx.tunables.client_timeout,
        };
        self.status = Some(response.status);
        self.response = builder.serialize(
            &response,
            self.close_after_response,
            version == Version::Http11,
            ctx.now,
        );
        self.sent = 0;
        self.state = ConnectionState::SendingResponse;
        self.flush(ctx);
    }

    fn flush(&mut self, ctx: &Context) {
        while self.sent < self.response.len() {
            match self.stream.write(&self.response[self.sent..]) {
                Ok(0) => {
                    self.state = ConnectionState::Closed;
                    return;
                }
                Ok(n) => {
                    self.sent += n;
                    self.bytes_out += n as u64;
                    self.last_active = ctx.now;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(client = %self.client, error = %e, "send failed");
                    self.state = ConnectionState::Closed;
                    return;
                }
            }
        }
        self.finish_exchange(ctx);
    }

    fn finish_exchange(&mut self, ctx: &Context) {
        if let Some(request) = self.request.take() {
            self.records.push(AccessRecord {
                client: self.client.ip(),
                when: ctx.now,
                method: request.method,
                referer: request.headers.get("referer").map(str::to_string),
                user_agent: request.headers.get("user-agent").map(str::to_string),
                target: request.raw_target,
                version: request.version,
                status: self.status.unwrap_or(StatusCode::Ok),
                bytes_sent: self.sent as u64,
            });
        }
        self.response = Vec::new();
        self.sent = 0;
        self.status = None;
        self.server = None;
        self.located = None;
        self.decoder = None;
        if self.close_after_response {
            self.state = ConnectionState::Closed;
        } else if self.buffer.is_empty() {
            self.state = ConnectionState::Idle;
        } else {
            self.state = ConnectionState::ReceivingHeader;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    use crate::config::parse_config;
    use crate::test_support::{FakeFileSystem, FakeProcessOps, FakeStream};

    const CONFIG: &str = "server {
        listen 8080;
        root www;
        client_max_body_size 64;
        location / { allow_methods GET POST DELETE; }
        location /cgi/ { allow_methods GET POST; cgi_ext .sh; cgi_path /bin/sh; }
    }
    server {
        listen 8080;
        server_name other.test;
        root other;
    }";

    struct Harness {
        configs: Vec<ServerConfig>,
        tunables: Tunables,
        fs: FakeFileSystem,
        processes: FakeProcessOps,
        mime_map: MimeMap,
        now: SystemTime,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_processes(FakeProcessOps::new(b"Content-Type: text/plain\r\n\r\ncgi output"))
        }

        fn with_processes(processes: FakeProcessOps) -> Self {
            Self {
                configs: parse_config(CONFIG).unwrap(),
                tunables: Tunables {
                    client_header_buffer_size: 256,
                    ..Default::default()
                },
                fs: FakeFileSystem::new()
                    .with_file("www/index.html", b"home")
                    .with_dir("www/uploads")
                    .with_file("www/cgi/run.sh", b"")
                    .with_file("other/index.html", b"other home"),
                processes,
                mime_map: MimeMap::default(),
                now: SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000),
            }
        }

        fn context(&self) -> Context<'_> {
            Context {
                configs: &self.configs,
                tunables: &self.tunables,
                fs: &self.fs,
                processes: &self.processes,
                mime_map: &self.mime_map,
                now: self.now,
            }
        }

        fn connect(&self, stream: &FakeStream) -> Connection {
            Connection::new(
                Box::new(stream.clone()),
                "127.0.0.1:40000".parse().unwrap(),
                "127.0.0.1:8080".parse().unwrap(),
                (0..self.configs.len()).collect(),
                self.now,
            )
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
        }
    }

    fn send(harness: &Harness, conn: &mut Connection, stream: &FakeStream, data: &[u8]) {
        stream.push_input(data);
        conn.on_readable(&harness.context());
    }

    #[test]
    fn serves_get_and_keeps_alive() {
        let harness = Harness::new();
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        assert_eq!(conn.interest(), Interest::Readable);

        send(&harness, &mut conn, &stream, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let output = stream.output_string();
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(output.contains("Keep-Alive: timeout=60\r\n"));
        assert!(output.ends_with("\r\n\r\nhome"));
        assert_eq!(conn.state(), ConnectionState::Idle);

        let records = conn.take_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, "/");
        assert_eq!(records[0].status, StatusCode::Ok);
        assert_eq!(records[0].bytes_sent, output.len() as u64);
    }

    #[test]
    fn header_split_across_reads() {
        let harness = Harness::new();
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(&harness, &mut conn, &stream, b"GET / HTTP/1.1\r\nHo");
        assert_eq!(conn.state(), ConnectionState::ReceivingHeader);
        send(&harness, &mut conn, &stream, b"st: x\r\n\r");
        assert_eq!(conn.state(), ConnectionState::ReceivingHeader);
        assert!(stream.output().is_empty());
        send(&harness, &mut conn, &stream, b"\n");
        assert!(stream.output_string().starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn pipelined_requests_and_leading_empty_lines() {
        let harness = Harness::new();
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(
            &harness,
            &mut conn,
            &stream,
            b"\r\n\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\nGET /nope HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        let output = stream.output_string();
        let first = output.find("HTTP/1.1 200 OK").unwrap();
        let second = output.find("HTTP/1.1 404 Not Found").unwrap();
        assert!(first < second);
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(conn.take_records().len(), 2);
    }

    #[test]
    fn virtual_host_by_name() {
        let harness = Harness::new();
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(&harness, &mut conn, &stream, b"GET / HTTP/1.1\r\nHost: other.test:8080\r\n\r\n");
        assert!(stream.output_string().ends_with("other home"));
    }

    #[test]
    fn bad_request_closes() {
        let harness = Harness::new();
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(&harness, &mut conn, &stream, b"GET / HTTP/1.1\r\n\r\n");
        let output = stream.output_string();
        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(output.contains("Connection: close\r\n"));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn unknown_method() {
        let harness = Harness::new();
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(&harness, &mut conn, &stream, b"BREW / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(stream
            .output_string()
            .starts_with("HTTP/1.1 501 Not Implemented\r\n"));
    }

    #[test]
    fn header_too_large() {
        let harness = Harness::new();
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        let mut request = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        request.extend(vec![b'a'; 300]);
        send(&harness, &mut conn, &stream, &request);
        assert!(stream
            .output_string()
            .starts_with("HTTP/1.1 431 Request Header Fields Too Large\r\n"));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn declared_body_too_large() {
        let harness = Harness::new();
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(
            &harness,
            &mut conn,
            &stream,
            b"POST /uploads/a HTTP/1.1\r\nHost: x\r\nContent-Length: 65\r\n\r\n",
        );
        assert!(stream
            .output_string()
            .starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn chunked_body_too_large() {
        let harness = Harness::new();
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        let mut request =
            b"POST /uploads/a HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n41\r\n"
                .to_vec();
        request.extend(vec![b'a'; 65]);
        send(&harness, &mut conn, &stream, &request);
        assert!(stream
            .output_string()
            .starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[test]
    fn chunked_upload() {
        let harness = Harness::new();
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(
            &harness,
            &mut conn,
            &stream,
            b"POST /uploads/a.txt HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n",
        );
        assert_eq!(conn.state(), ConnectionState::ReceivingBody);
        send(&harness, &mut conn, &stream, b"6\r\n world\r\n0\r\n\r\n");
        assert!(stream.output_string().starts_with("HTTP/1.1 201 Created\r\n"));
        assert_eq!(harness.fs.file("www/uploads/a.txt").unwrap(), b"hello world");
    }

    #[test]
    fn http10_closes_after_response() {
        let harness = Harness::new();
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(&harness, &mut conn, &stream, b"GET / HTTP/1.0\r\n\r\n");
        let output = stream.output_string();
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(output.contains("Connection: close\r\n"));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn partial_writes_resume() {
        let harness = Harness::new();
        let stream = FakeStream::new(5);
        stream.set_write_limit(Some(10));
        let mut conn = harness.connect(&stream);
        send(&harness, &mut conn, &stream, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(conn.state(), ConnectionState::SendingResponse);
        assert_eq!(conn.interest(), Interest::Writable);
        assert_eq!(stream.output().len(), 10);

        stream.set_write_limit(None);
        conn.on_writable(&harness.context());
        assert!(stream.output_string().ends_with("home"));
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[test]
    fn client_eof_closes() {
        let harness = Harness::new();
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        stream.push_eof();
        conn.on_readable(&harness.context());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn idle_timeout_sends_408() {
        let mut harness = Harness::new();
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        conn.check_timeout(&harness.context());
        assert_eq!(conn.state(), ConnectionState::Idle);

        harness.advance(Duration::from_secs(61));
        conn.check_timeout(&harness.context());
        assert!(stream
            .output_string()
            .starts_with("HTTP/1.1 408 Request Timeout\r\n"));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn cgi_request_round_trip() {
        let harness = Harness::new();
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(
            &harness,
            &mut conn,
            &stream,
            b"POST /cgi/run.sh?q=1 HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nping",
        );
        assert_eq!(conn.state(), ConnectionState::SendingToCgi);
        assert_eq!(conn.interest(), Interest::Suspended);
        let (_, interest) = conn.pipe_interest().unwrap();
        assert_eq!(interest, Interest::Writable);

        conn.on_pipe_ready(&harness.context());
        assert_eq!(conn.state(), ConnectionState::ReceivingFromCgi);
        assert_eq!(harness.processes.stdin(), b"ping");
        let spawned = harness.processes.spawned();
        assert!(spawned[0]
            .env
            .contains(&("QUERY_STRING".to_string(), "q=1".to_string())));

        while conn.state() == ConnectionState::ReceivingFromCgi {
            conn.on_pipe_ready(&harness.context());
        }
        let output = stream.output_string();
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(output.contains("Transfer-Encoding: chunked\r\n"));
        assert!(output.ends_with("A\r\ncgi output\r\n0\r\n\r\n"));
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    fn run_cgi(harness: &Harness, conn: &mut Connection) {
        while conn.state() == ConnectionState::ReceivingFromCgi {
            conn.on_pipe_ready(&harness.context());
        }
    }

    #[test]
    fn request_pipelined_behind_cgi_is_served() {
        let harness = Harness::new();
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(
            &harness,
            &mut conn,
            &stream,
            b"GET /cgi/run.sh HTTP/1.1\r\nHost: x\r\n\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\n",
        );
        assert_eq!(conn.state(), ConnectionState::ReceivingFromCgi);
        run_cgi(&harness, &mut conn);
        let output = stream.output_string();
        assert!(output.contains("cgi output"));
        assert!(output.ends_with("\r\n\r\nhome"));
        assert_eq!(conn.take_records().len(), 2);
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[test_case(3 ; "failure exit")]
    #[test_case(-1 ; "killed by signal")]
    fn cgi_script_failure_is_internal_error(code: i32) {
        let processes =
            FakeProcessOps::new(b"Content-Type: text/plain\r\n\r\npartial").with_exit_code(code);
        let harness = Harness::with_processes(processes);
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(&harness, &mut conn, &stream, b"GET /cgi/run.sh HTTP/1.1\r\nHost: x\r\n\r\n");
        run_cgi(&harness, &mut conn);
        let output = stream.output_string();
        assert!(output.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(!output.contains("partial"));
    }

    #[test]
    fn cgi_response_waits_for_exit() {
        let processes =
            FakeProcessOps::new(b"Content-Type: text/plain\r\n\r\nok").with_exit_delay(2);
        let harness = Harness::with_processes(processes);
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(&harness, &mut conn, &stream, b"GET /cgi/run.sh HTTP/1.1\r\nHost: x\r\n\r\n");
        run_cgi(&harness, &mut conn);
        assert_eq!(conn.state(), ConnectionState::AwaitingCgiExit);
        assert!(conn.awaiting_cgi_exit());
        assert_eq!(conn.interest(), Interest::Suspended);
        assert_eq!(conn.pipe_interest(), None);
        assert!(stream.output().is_empty());

        conn.check_timeout(&harness.context());
        assert_eq!(conn.state(), ConnectionState::AwaitingCgiExit);
        conn.check_timeout(&harness.context());
        assert!(stream.output_string().starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[test]
    fn cgi_closing_stdin_early_is_internal_error() {
        let harness = Harness::with_processes(FakeProcessOps::refusing_input(
            b"Content-Type: text/plain\r\n\r\nok",
        ));
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(
            &harness,
            &mut conn,
            &stream,
            b"POST /cgi/run.sh HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nping",
        );
        assert_eq!(conn.state(), ConnectionState::SendingToCgi);
        conn.on_pipe_ready(&harness.context());
        assert!(stream
            .output_string()
            .starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert_eq!(harness.processes.killed(), 1);
        assert_eq!(conn.take_orphans().len(), 1);
    }

    #[test]
    fn cgi_output_over_limit_is_bad_gateway() {
        let mut harness = Harness::new();
        harness.tunables.max_cgi_output = 16;
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(&harness, &mut conn, &stream, b"GET /cgi/run.sh HTTP/1.1\r\nHost: x\r\n\r\n");
        run_cgi(&harness, &mut conn);
        assert!(stream.output_string().starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert_eq!(harness.processes.killed(), 1);
    }

    #[test]
    fn chunked_cgi_request_is_reassembled() {
        let harness = Harness::new();
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(
            &harness,
            &mut conn,
            &stream,
            b"POST /cgi/run.sh HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
            4\r\ntest\r\n0\r\n\r\n",
        );
        assert_eq!(conn.state(), ConnectionState::SendingToCgi);
        conn.on_pipe_ready(&harness.context());
        assert_eq!(harness.processes.stdin(), b"test");
        let env = &harness.processes.spawned()[0].env;
        assert!(env.iter().all(|(name, _)| name != "CONTENT_LENGTH"));
    }

    #[test]
    fn cgi_invalid_output_is_bad_gateway() {
        let harness = Harness::with_processes(FakeProcessOps::new(b"not a header block"));
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(&harness, &mut conn, &stream, b"GET /cgi/run.sh HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(conn.state(), ConnectionState::ReceivingFromCgi);
        while conn.state() == ConnectionState::ReceivingFromCgi {
            conn.on_pipe_ready(&harness.context());
        }
        assert!(stream.output_string().starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    }

    #[test]
    fn cgi_spawn_failure() {
        let harness = Harness::with_processes(FakeProcessOps::failing());
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(&harness, &mut conn, &stream, b"GET /cgi/run.sh HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(stream
            .output_string()
            .starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
    }

    #[test]
    fn cgi_timeout_kills_script() {
        let mut harness = Harness::with_processes(FakeProcessOps::hanging());
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(&harness, &mut conn, &stream, b"GET /cgi/run.sh HTTP/1.1\r\nHost: x\r\n\r\n");
        conn.on_pipe_ready(&harness.context());
        assert_eq!(conn.state(), ConnectionState::ReceivingFromCgi);

        harness.advance(Duration::from_secs(61));
        conn.check_timeout(&harness.context());
        let output = stream.output_string();
        assert!(output.starts_with("HTTP/1.1 504 Gateway Timeout\r\n"));
        assert!(output.contains("Connection: close\r\n"));
        assert_eq!(harness.processes.killed(), 1);
        assert_eq!(conn.take_orphans().len(), 1);
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn hangup_during_cgi_kills_script() {
        let harness = Harness::with_processes(FakeProcessOps::hanging());
        let stream = FakeStream::new(5);
        let mut conn = harness.connect(&stream);
        send(&harness, &mut conn, &stream, b"GET /cgi/run.sh HTTP/1.1\r\nHost: x\r\n\r\n");
        conn.on_hangup(&harness.context());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(harness.processes.killed(), 1);
    }
}
