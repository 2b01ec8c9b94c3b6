//! In-memory stand-ins for sockets, the filesystem, CGI processes and the
//! poller.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use crate::cgi::{CgiCommand, CgiProcess, ProcessOps};
use crate::connection::ClientStream;
use crate::fs::{DirEntry, FileSystem, FileType};
use crate::poller::{Event, Interest, Poller};
use crate::server::{Accepted, Acceptor};

/// Largest read a fake CGI process returns at once.
const PIPE_CHUNK: usize = 8;

#[derive(Default)]
struct StreamState {
    input: VecDeque<u8>,
    eof: bool,
    output: Vec<u8>,
    write_limit: Option<usize>,
}

/// Client socket fed by the test. Clones share the same buffers.
#[derive(Clone)]
pub struct FakeStream {
    fd: RawFd,
    state: Rc<RefCell<StreamState>>,
}

impl FakeStream {
    pub fn new(fd: RawFd) -> Self {
        Self {
            fd,
            state: Rc::default(),
        }
    }

    pub fn push_input(&self, data: &[u8]) {
        self.state.borrow_mut().input.extend(data);
    }

    /// Reads return 0 once the pending input is consumed.
    pub fn push_eof(&self) {
        self.state.borrow_mut().eof = true;
    }

    pub fn output(&self) -> Vec<u8> {
        self.state.borrow().output.clone()
    }

    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.state.borrow().output).into_owned()
    }

    /// Cap the total bytes the stream accepts. Writes past it would block.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.state.borrow_mut().write_limit = limit;
    }
}

impl Read for FakeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.input.is_empty() {
            return if state.eof {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let n = buf.len().min(state.input.len());
        for (slot, byte) in buf.iter_mut().zip(state.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for FakeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        let room = match state.write_limit {
            Some(limit) => limit.saturating_sub(state.output.len()),
            None => buf.len(),
        };
        if room == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(room);
        state.output.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for FakeStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl ClientStream for FakeStream {}

enum Node {
    File(Vec<u8>),
    Dir,
    Other,
}

/// In-memory directory tree.
#[derive(Default)]
pub struct FakeFileSystem {
    nodes: RefCell<BTreeMap<String, Node>>,
    forbidden: HashSet<String>,
}

fn normalize(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len());
    for c in path.chars() {
        if c == '/' && normalized.ends_with('/') {
            continue;
        }
        normalized.push(c);
    }
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

fn parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        _ if path == "/" => None,
        Some(0) => Some("/"),
        Some(index) => Some(&path[..index]),
        None => None,
    }
}

fn not_found(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path))
}

fn permission_denied(path: &str) -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, format!("{} is forbidden", path))
}

impl FakeFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.insert(path, Node::File(content.to_vec()))
    }

    pub fn with_dir(self, path: &str) -> Self {
        self.insert(path, Node::Dir)
    }

    /// A special file such as a FIFO.
    pub fn with_other(self, path: &str) -> Self {
        self.insert(path, Node::Other)
    }

    /// A path whose every access fails with a permission error.
    pub fn with_forbidden(mut self, path: &str) -> Self {
        let path = normalize(path);
        if let Some(dir) = parent(&path) {
            self = self.with_dir(dir);
        }
        self.forbidden.insert(path);
        self
    }

    /// Current content of a regular file.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.nodes.borrow().get(&normalize(path)) {
            Some(Node::File(content)) => Some(content.clone()),
            _ => None,
        }
    }

    fn insert(self, path: &str, node: Node) -> Self {
        let path = normalize(path);
        {
            let mut nodes = self.nodes.borrow_mut();
            let mut dir = parent(&path);
            while let Some(current) = dir {
                nodes.insert(current.to_string(), Node::Dir);
                dir = parent(current);
            }
            nodes.insert(path, node);
        }
        self
    }

    fn check_allowed(&self, path: &str) -> io::Result<()> {
        if self.forbidden.contains(path) {
            return Err(permission_denied(path));
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn file_type(&self, path: &str) -> io::Result<FileType> {
        let path = normalize(path);
        self.check_allowed(&path)?;
        Ok(match self.nodes.borrow().get(&path) {
            Some(Node::File(_)) => FileType::Regular,
            Some(Node::Dir) => FileType::Directory,
            Some(Node::Other) => FileType::Other,
            None => FileType::NotFound,
        })
    }

    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        let path = normalize(path);
        self.check_allowed(&path)?;
        match self.nodes.borrow().get(&path) {
            Some(Node::File(content)) => Ok(content.clone()),
            Some(_) => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is not a regular file", path),
            )),
            None => Err(not_found(&path)),
        }
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let path = normalize(path);
        self.check_allowed(&path)?;
        let nodes = self.nodes.borrow();
        match nodes.get(&path) {
            Some(Node::Dir) => {}
            Some(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("{} is not a directory", path),
                ))
            }
            None => return Err(not_found(&path)),
        }
        Ok(nodes
            .iter()
            .filter(|(child, _)| parent(child) == Some(path.as_str()))
            .map(|(child, node)| DirEntry {
                name: child.rsplit('/').next().unwrap_or(child).to_string(),
                is_dir: matches!(node, Node::Dir),
                size: match node {
                    Node::File(content) => content.len() as u64,
                    _ => 0,
                },
                modified: SystemTime::UNIX_EPOCH,
            })
            .collect())
    }

    fn append_file(&self, path: &str, content: &[u8]) -> io::Result<()> {
        let path = normalize(path);
        self.check_allowed(&path)?;
        let mut nodes = self.nodes.borrow_mut();
        if let Some(dir) = parent(&path) {
            if !matches!(nodes.get(dir), Some(Node::Dir)) {
                return Err(not_found(dir));
            }
        }
        match nodes.entry(path.clone()).or_insert_with(|| Node::File(Vec::new())) {
            Node::File(existing) => {
                existing.extend_from_slice(content);
                Ok(())
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is not a regular file", path),
            )),
        }
    }

    fn remove_file(&self, path: &str) -> io::Result<()> {
        let path = normalize(path);
        self.check_allowed(&path)?;
        let mut nodes = self.nodes.borrow_mut();
        let is_dir = match nodes.get(&path) {
            Some(node) => matches!(node, Node::Dir),
            None => return Err(not_found(&path)),
        };
        if is_dir {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{} is a directory", path),
            ));
        }
        nodes.remove(&path);
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Normal,
    Failing,
    Hanging,
    /// Stdin is closed before the body is written.
    RefusesInput,
}

struct ProcessState {
    behavior: Behavior,
    output: Vec<u8>,
    stdin: Vec<u8>,
    spawned: Vec<CgiCommand>,
    killed: usize,
    exit_code: i32,
    /// `try_wait` calls that still see the process running after its
    /// stdout closed.
    exit_delay: usize,
}

/// Spawns fake scripts that print a fixed output. Clones share state.
#[derive(Clone)]
pub struct FakeProcessOps {
    state: Rc<RefCell<ProcessState>>,
}

impl FakeProcessOps {
    fn with_behavior(behavior: Behavior, output: &[u8]) -> Self {
        Self {
            state: Rc::new(RefCell::new(ProcessState {
                behavior,
                output: output.to_vec(),
                stdin: Vec::new(),
                spawned: Vec::new(),
                killed: 0,
                exit_code: 0,
                exit_delay: 0,
            })),
        }
    }

    pub fn new(output: &[u8]) -> Self {
        Self::with_behavior(Behavior::Normal, output)
    }

    /// Every spawn fails.
    pub fn failing() -> Self {
        Self::with_behavior(Behavior::Failing, b"")
    }

    /// Scripts never produce output.
    pub fn hanging() -> Self {
        Self::with_behavior(Behavior::Hanging, b"")
    }

    /// Scripts print `output` but never read their stdin.
    pub fn refusing_input(output: &[u8]) -> Self {
        Self::with_behavior(Behavior::RefusesInput, output)
    }

    pub fn with_exit_code(self, code: i32) -> Self {
        self.state.borrow_mut().exit_code = code;
        self
    }

    /// Scripts keep running for `polls` calls of `try_wait` after closing
    /// their stdout.
    pub fn with_exit_delay(self, polls: usize) -> Self {
        self.state.borrow_mut().exit_delay = polls;
        self
    }

    /// Everything written to the scripts' stdin.
    pub fn stdin(&self) -> Vec<u8> {
        self.state.borrow().stdin.clone()
    }

    pub fn spawned(&self) -> Vec<CgiCommand> {
        self.state.borrow().spawned.clone()
    }

    /// Number of processes killed.
    pub fn killed(&self) -> usize {
        self.state.borrow().killed
    }

    /// Stdin descriptor of the most recently spawned process.
    pub fn stdin_fd(&self) -> RawFd {
        pipe_fds(self.state.borrow().spawned.len().saturating_sub(1)).0
    }

    /// Stdout descriptor of the most recently spawned process.
    pub fn stdout_fd(&self) -> RawFd {
        pipe_fds(self.state.borrow().spawned.len().saturating_sub(1)).1
    }
}

fn pipe_fds(index: usize) -> (RawFd, RawFd) {
    let base = 100 + 2 * index as RawFd;
    (base, base + 1)
}

impl ProcessOps for FakeProcessOps {
    fn spawn(&self, command: &CgiCommand) -> io::Result<Box<dyn CgiProcess>> {
        let mut state = self.state.borrow_mut();
        if state.behavior == Behavior::Failing {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", command.program),
            ));
        }
        let index = state.spawned.len();
        state.spawned.push(command.clone());
        let (stdin, stdout) = pipe_fds(index);
        Ok(Box::new(FakeProcess {
            state: Rc::clone(&self.state),
            pid: 1000 + index as u32,
            stdin: Some(stdin),
            stdout: Some(stdout),
            read: 0,
            killed: false,
            exit_delay: state.exit_delay,
        }))
    }
}

struct FakeProcess {
    state: Rc<RefCell<ProcessState>>,
    pid: u32,
    stdin: Option<RawFd>,
    stdout: Option<RawFd>,
    /// Bytes of the output already read.
    read: usize,
    killed: bool,
    exit_delay: usize,
}

impl CgiProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn stdin_fd(&self) -> Option<RawFd> {
        self.stdin
    }

    fn stdout_fd(&self) -> Option<RawFd> {
        self.stdout
    }

    fn write_stdin(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if self.stdin.is_none() || self.killed || state.behavior == Behavior::RefusesInput {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        state.stdin.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn close_stdin(&mut self) {
        self.stdin = None;
    }

    fn read_stdout(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let state = self.state.borrow();
        if self.stdout.is_none() {
            return Err(io::Error::new(io::ErrorKind::Other, "stdout is closed"));
        }
        if state.behavior == Behavior::Hanging && !self.killed {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let rest = &state.output[self.read.min(state.output.len())..];
        let n = rest.len().min(buf.len()).min(PIPE_CHUNK);
        buf[..n].copy_from_slice(&rest[..n]);
        self.read += n;
        Ok(n)
    }

    fn close_stdout(&mut self) {
        self.stdout = None;
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        if self.killed {
            Ok(Some(-1))
        } else if self.stdout.is_some() {
            Ok(None)
        } else if self.exit_delay > 0 {
            self.exit_delay -= 1;
            Ok(None)
        } else {
            Ok(Some(self.state.borrow().exit_code))
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        if !self.killed {
            self.killed = true;
            self.state.borrow_mut().killed += 1;
        }
        Ok(())
    }
}

/// Listening socket with a queue of pending clients and errors. Clones
/// share the queue.
#[derive(Clone)]
pub struct FakeAcceptor {
    fd: RawFd,
    local: SocketAddr,
    pending: Rc<RefCell<VecDeque<io::Result<(FakeStream, SocketAddr)>>>>,
}

impl FakeAcceptor {
    pub fn new(fd: RawFd, local: SocketAddr) -> Self {
        Self {
            fd,
            local,
            pending: Rc::default(),
        }
    }

    pub fn push_client(&self, stream: &FakeStream, client: SocketAddr) {
        self.pending
            .borrow_mut()
            .push_back(Ok((stream.clone(), client)));
    }

    /// Make a later accept fail with the OS error `errno`.
    pub fn push_error(&self, errno: i32) {
        self.pending
            .borrow_mut()
            .push_back(Err(io::Error::from_raw_os_error(errno)));
    }
}

impl Acceptor for FakeAcceptor {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn accept_client(&self) -> io::Result<Accepted> {
        match self.pending.borrow_mut().pop_front() {
            Some(Ok((stream, client))) => Ok(Accepted {
                stream: Box::new(stream),
                client,
                local: self.local,
            }),
            Some(Err(e)) => Err(e),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

#[derive(Default)]
struct PollerState {
    registered: HashMap<RawFd, Interest>,
    pending: VecDeque<Vec<Event>>,
}

/// Poller that returns events queued by the test. Clones share state.
#[derive(Clone, Default)]
pub struct FakePoller {
    state: Rc<RefCell<PollerState>>,
}

impl FakePoller {
    /// Queue the events returned by the next `wait`.
    pub fn push_events(&self, events: Vec<Event>) {
        self.state.borrow_mut().pending.push_back(events);
    }

    pub fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.state.borrow().registered.get(&fd).copied()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.state.borrow().registered.is_empty()
    }
}

impl Poller for FakePoller {
    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.registered.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd {} is already registered", fd),
            ));
        }
        state.registered.insert(fd, interest);
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self.state.borrow_mut().registered.get_mut(&fd) {
            Some(current) => {
                *current = interest;
                Ok(())
            }
            None => Err(not_registered(fd)),
        }
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        match self.state.borrow_mut().registered.remove(&fd) {
            Some(_) => Ok(()),
            None => Err(not_registered(fd)),
        }
    }

    fn wait(&mut self, _timeout: Duration) -> io::Result<Vec<Event>> {
        Ok(self.state.borrow_mut().pending.pop_front().unwrap_or_default())
    }
}

fn not_registered(fd: RawFd) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("fd {} is not registered", fd))
}
