//! Listening sockets and the event loop that drives connections.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{anyhow, Context as _, Result};
use tracing::{debug, error, info, warn};

use crate::cgi::{CgiProcess, ProcessOps, SystemProcessOps};
use crate::config::{check_duplicate_servers, ServerConfig, Tunables};
use crate::connection::{ClientStream, Connection, ConnectionState, Context};
use crate::fs::{FileSystem, RealFileSystem};
use crate::log::{LogSink, ServerStats};
use crate::poller::{Event, Interest, Poller};
use crate::response::MimeMap;

/// How long shutdown waits for killed CGI processes to be reaped.
const REAP_GRACE: Duration = Duration::from_secs(1);

/// Poll interval while a finished script's exit status is outstanding.
const EXIT_POLL: Duration = Duration::from_millis(10);

/// A client taken off a listening socket.
pub struct Accepted {
    pub stream: Box<dyn ClientStream>,
    pub client: SocketAddr,
    pub local: SocketAddr,
}

/// Non-blocking listening socket.
pub trait Acceptor {
    fn fd(&self) -> RawFd;
    /// Next pending client, with its stream already non-blocking.
    fn accept_client(&self) -> io::Result<Accepted>;
}

impl Acceptor for TcpListener {
    fn fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn accept_client(&self) -> io::Result<Accepted> {
        let (stream, client) = self.accept()?;
        stream.set_nonblocking(true)?;
        let local = match stream.local_addr() {
            Ok(local) => local,
            Err(_) => self.local_addr()?,
        };
        Ok(Accepted {
            stream: Box::new(stream),
            client,
            local,
        })
    }
}

struct Listener {
    socket: Box<dyn Acceptor>,
    addr: SocketAddr,
    /// Virtual servers served on this socket.
    configs: Vec<usize>,
}

pub struct Server {
    configs: Vec<ServerConfig>,
    tunables: Tunables,
    mime_map: MimeMap,
    fs: Box<dyn FileSystem>,
    processes: Box<dyn ProcessOps>,
    poller: Box<dyn Poller>,
    log_sink: LogSink,
    listeners: HashMap<RawFd, Listener>,
    connections: HashMap<RawFd, Connection>,
    /// CGI pipe fd to the client fd it belongs to.
    pipes: HashMap<RawFd, RawFd>,
    orphans: Vec<Box<dyn CgiProcess>>,
    accepting: bool,
    pub stats: ServerStats,
}

impl Server {
    pub fn new(configs: Vec<ServerConfig>, tunables: Tunables, poller: Box<dyn Poller>) -> Self {
        Self {
            configs,
            tunables,
            mime_map: MimeMap::default(),
            fs: Box::new(RealFileSystem),
            processes: Box::new(SystemProcessOps),
            poller,
            log_sink: LogSink::default(),
            listeners: HashMap::new(),
            connections: HashMap::new(),
            pipes: HashMap::new(),
            orphans: Vec::new(),
            accepting: true,
            stats: ServerStats::default(),
        }
    }

    pub fn with_mime_map(mut self, mime_map: MimeMap) -> Self {
        self.mime_map = mime_map;
        self
    }

    pub fn with_log_sink(mut self, log_sink: LogSink) -> Self {
        self.log_sink = log_sink;
        self
    }

    pub fn with_file_system(mut self, fs: Box<dyn FileSystem>) -> Self {
        self.fs = fs;
        self
    }

    pub fn with_process_ops(mut self, processes: Box<dyn ProcessOps>) -> Self {
        self.processes = processes;
        self
    }

    /// Bind one socket per distinct listen address.
    pub fn init_listeners(&mut self) -> Result<()> {
        for (addr, configs) in group_listeners(&self.configs).map_err(|e| anyhow!(e))? {
            let socket = TcpListener::bind(addr)
                .with_context(|| format!("failed to create listening socket for {}", addr))?;
            socket
                .set_nonblocking(true)
                .context("failed to set listening socket non-blocking")?;
            let addr = socket.local_addr().unwrap_or(addr);
            self.add_listener(Box::new(socket), addr, configs)
                .context("failed to watch listening socket")?;
            info!("listening on: http://{}/", addr);
        }
        Ok(())
    }

    /// Serve the virtual servers `configs` on an already bound socket.
    pub fn add_listener(
        &mut self,
        socket: Box<dyn Acceptor>,
        addr: SocketAddr,
        configs: Vec<usize>,
    ) -> io::Result<()> {
        let fd = socket.fd();
        if self.accepting {
            self.poller.add(fd, Interest::Readable)?;
        }
        self.listeners.insert(
            fd,
            Listener {
                socket,
                addr,
                configs,
            },
        );
        Ok(())
    }

    /// Addresses actually bound, e.g. to learn a port picked by the OS.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.values().map(|listener| listener.addr).collect()
    }

    pub fn num_connections(&self) -> usize {
        self.connections.len()
    }

    /// Start tracking a client connection.
    pub fn register_connection(&mut self, mut conn: Connection) -> io::Result<()> {
        let fd = conn.fd();
        if self.connections.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd {} is already registered", fd),
            ));
        }
        let interest = conn.interest();
        self.poller.add(fd, interest)?;
        conn.registered = Some(interest);
        debug!(client = %conn.client(), fd, "accepted connection");
        self.connections.insert(fd, conn);
        Ok(())
    }

    /// Serve until `is_running` returns false, then shut down.
    pub fn run(&mut self, is_running: impl Fn() -> bool) -> Result<()> {
        while is_running() {
            self.poll_once()?;
        }
        self.shutdown();
        Ok(())
    }

    /// Wait for events once and handle them, then enforce timeouts.
    pub fn poll_once(&mut self) -> Result<()> {
        let timeout = if self.connections.values().any(Connection::awaiting_cgi_exit) {
            EXIT_POLL.min(self.tunables.epoll_timeout)
        } else {
            self.tunables.epoll_timeout
        };
        let events = self
            .poller
            .wait(timeout)
            .context("failed to wait for events")?;
        for event in events {
            self.dispatch(event);
        }
        self.check_timeouts();
        self.reap_orphans();
        Ok(())
    }

    /// Stop accepting, let in-flight requests finish within the grace period,
    /// then close everything and reap CGI processes.
    pub fn shutdown(&mut self) {
        info!("shutting down");
        for (fd, _listener) in self.listeners.drain() {
            let _ = self.poller.remove(fd);
        }
        self.close_idle();
        let deadline = Instant::now() + self.tunables.shutdown_grace;
        while !self.connections.is_empty() && Instant::now() < deadline {
            if let Err(e) = self.poll_once() {
                warn!("{:#}", e);
                break;
            }
            self.close_idle();
        }
        let remaining: Vec<RawFd> = self.connections.keys().copied().collect();
        if !remaining.is_empty() {
            info!(count = remaining.len(), "closing unfinished connections");
        }
        for fd in remaining {
            if let Some(conn) = self.connections.get_mut(&fd) {
                conn.close();
            }
            self.close_connection(fd);
        }
        for orphan in &mut self.orphans {
            let _ = orphan.kill();
        }
        let deadline = Instant::now() + REAP_GRACE;
        while !self.orphans.is_empty() && Instant::now() < deadline {
            self.reap_orphans();
            thread::sleep(Duration::from_millis(10));
        }
        if !self.orphans.is_empty() {
            warn!(count = self.orphans.len(), "CGI processes left unreaped");
        }
    }

    fn close_idle(&mut self) {
        let idle: Vec<RawFd> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.state() == ConnectionState::Idle)
            .map(|(&fd, _)| fd)
            .collect();
        for fd in idle {
            self.close_connection(fd);
        }
    }

    fn dispatch(&mut self, event: Event) {
        if self.listeners.contains_key(&event.fd) {
            self.accept(event.fd);
            return;
        }
        let (client_fd, from_pipe) = if self.connections.contains_key(&event.fd) {
            (event.fd, false)
        } else if let Some(&client_fd) = self.pipes.get(&event.fd) {
            (client_fd, true)
        } else {
            debug!(fd = event.fd, "event for unknown fd");
            return;
        };

        let ctx = Context {
            configs: &self.configs,
            tunables: &self.tunables,
            fs: &*self.fs,
            processes: &*self.processes,
            mime_map: &self.mime_map,
            now: SystemTime::now(),
        };
        let conn = match self.connections.get_mut(&client_fd) {
            Some(conn) => conn,
            None => return,
        };
        if from_pipe {
            conn.on_pipe_ready(&ctx);
        } else if event.readable {
            conn.on_readable(&ctx);
        } else if event.writable {
            conn.on_writable(&ctx);
        } else if event.hangup || event.error {
            conn.on_hangup(&ctx);
        }
        self.after_event(client_fd);
    }

    /// Accept every pending connection on a listening socket.
    fn accept(&mut self, listener_fd: RawFd) {
        loop {
            let listener = match self.listeners.get(&listener_fd) {
                Some(listener) => listener,
                None => return,
            };
            let accepted = match listener.socket.accept_client() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
                        warn!("out of file descriptors, pausing accept");
                        self.pause_accepting();
                    } else {
                        warn!("accept() failed: {}", e);
                    }
                    return;
                }
            };
            let conn = Connection::new(
                accepted.stream,
                accepted.client,
                accepted.local,
                listener.configs.clone(),
                SystemTime::now(),
            );
            if let Err(e) = self.register_connection(conn) {
                warn!("failed to register connection: {}", e);
            }
        }
    }

    fn pause_accepting(&mut self) {
        if !self.accepting {
            return;
        }
        for fd in self.listeners.keys() {
            let _ = self.poller.remove(*fd);
        }
        self.accepting = false;
    }

    fn resume_accepting(&mut self) {
        if self.accepting {
            return;
        }
        for fd in self.listeners.keys() {
            if let Err(e) = self.poller.add(*fd, Interest::Readable) {
                error!("failed to resume accepting: {}", e);
            }
        }
        self.accepting = true;
    }

    fn check_timeouts(&mut self) {
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();
        for fd in fds {
            let ctx = Context {
                configs: &self.configs,
                tunables: &self.tunables,
                fs: &*self.fs,
                processes: &*self.processes,
                mime_map: &self.mime_map,
                now: SystemTime::now(),
            };
            if let Some(conn) = self.connections.get_mut(&fd) {
                conn.check_timeout(&ctx);
            }
            self.after_event(fd);
        }
    }

    /// Collect what a connection produced and update its registrations.
    fn after_event(&mut self, fd: RawFd) {
        let conn = match self.connections.get_mut(&fd) {
            Some(conn) => conn,
            None => return,
        };
        for record in conn.take_records() {
            self.stats.num_requests += 1;
            if let Err(e) = self.log_sink.log(&record.to_string()) {
                error!("failed to write access log: {}", e);
            }
        }
        self.orphans.extend(conn.take_orphans());
        if conn.state() == ConnectionState::Closed {
            self.close_connection(fd);
            return;
        }

        let interest = conn.interest();
        if conn.registered != Some(interest) {
            match self.poller.modify(fd, interest) {
                Ok(()) => conn.registered = Some(interest),
                Err(e) => {
                    error!(fd, "failed to update poll interest: {}", e);
                    conn.close();
                }
            }
        }

        let wanted = conn.pipe_interest();
        if wanted.map(|(pipe, _)| pipe) != conn.registered_pipe {
            if let Some(old) = conn.registered_pipe.take() {
                let _ = self.poller.remove(old);
                self.pipes.remove(&old);
            }
            if let Some((pipe, interest)) = wanted {
                match self.poller.add(pipe, interest) {
                    Ok(()) => {
                        self.pipes.insert(pipe, fd);
                        conn.registered_pipe = Some(pipe);
                    }
                    Err(e) => {
                        error!(fd, pipe, "failed to watch CGI pipe: {}", e);
                        conn.close();
                    }
                }
            }
        }
        if conn.state() == ConnectionState::Closed {
            self.close_connection(fd);
        }
    }

    fn close_connection(&mut self, fd: RawFd) {
        let mut conn = match self.connections.remove(&fd) {
            Some(conn) => conn,
            None => return,
        };
        conn.close();
        if let Some(pipe) = conn.registered_pipe.take() {
            let _ = self.poller.remove(pipe);
            self.pipes.remove(&pipe);
        }
        if let Err(e) = self.poller.remove(fd) {
            debug!(fd, "failed to unwatch client socket: {}", e);
        }
        for record in conn.take_records() {
            self.stats.num_requests += 1;
            if let Err(e) = self.log_sink.log(&record.to_string()) {
                error!("failed to write access log: {}", e);
            }
        }
        self.orphans.extend(conn.take_orphans());
        self.stats.total_in += conn.bytes_in;
        self.stats.total_out += conn.bytes_out;
        debug!(client = %conn.client(), fd, "closed connection");
        drop(conn);
        self.resume_accepting();
    }

    fn reap_orphans(&mut self) {
        let mut index = 0;
        while index < self.orphans.len() {
            match self.orphans[index].try_wait() {
                Ok(None) => index += 1,
                Ok(Some(code)) => {
                    debug!(pid = self.orphans[index].pid(), code, "reaped CGI process");
                    self.orphans.swap_remove(index);
                }
                Err(e) => {
                    warn!("failed to reap CGI process: {}", e);
                    self.orphans.swap_remove(index);
                }
            }
        }
    }
}

/// Group virtual servers by the socket that serves them. A wildcard address
/// on a port takes in every specific address of the same family on that port.
pub fn group_listeners(configs: &[ServerConfig]) -> Result<Vec<(SocketAddr, Vec<usize>)>, String> {
    if configs.is_empty() {
        return Err("no servers configured".to_string());
    }
    check_duplicate_servers(configs)?;
    let wildcards: HashSet<(bool, u16)> = configs
        .iter()
        .filter(|config| config.is_wildcard())
        .map(|config| (config.listen.is_ipv4(), config.listen.port()))
        .collect();

    let mut groups: Vec<(SocketAddr, Vec<usize>)> = Vec::new();
    for (index, config) in configs.iter().enumerate() {
        let listen = config.listen;
        let addr = if wildcards.contains(&(listen.is_ipv4(), listen.port())) {
            let unspecified: IpAddr = if listen.is_ipv4() {
                Ipv4Addr::UNSPECIFIED.into()
            } else {
                Ipv6Addr::UNSPECIFIED.into()
            };
            SocketAddr::new(unspecified, listen.port())
        } else {
            listen
        };
        match groups.iter_mut().find(|(group_addr, _)| *group_addr == addr) {
            Some((_, members)) => members.push(index),
            None => groups.push((addr, vec![index])),
        }
    }
    Ok(groups)
}

/// Pick the virtual server for a request among `candidates`: a server_name
/// match on `host`, else one bound to the exact local address, else a
/// wildcard one, else the first.
pub fn select_server(
    configs: &[ServerConfig],
    candidates: &[usize],
    local: SocketAddr,
    host: Option<&str>,
) -> usize {
    let reachable = || {
        candidates
            .iter()
            .copied()
            .filter(move |&index| index < configs.len())
    };
    if let Some(host) = host {
        if let Some(index) = reachable().find(|&index| configs[index].matches_name(host)) {
            return index;
        }
    }
    reachable()
        .find(|&index| configs[index].listen.ip() == local.ip())
        .or_else(|| reachable().find(|&index| configs[index].is_wildcard()))
        .or_else(|| reachable().next())
        .unwrap_or(0)
}
