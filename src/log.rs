//! Access log, diagnostics setup and shutdown statistics.

use std::ffi::CString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::mem::MaybeUninit;
use std::net::IpAddr;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing_subscriber::filter::LevelFilter;

use crate::request::{Method, Version};
use crate::status::StatusCode;

/// Where to put the access log.
#[derive(Debug)]
pub enum LogSink {
    Stdout,
    Syslog,
    File(BufWriter<File>),
}

impl LogSink {
    /// Append to the access log at `path`.
    pub fn open_file(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path))?;
        Ok(Self::File(BufWriter::new(file)))
    }

    pub fn log(&mut self, message: &str) -> io::Result<()> {
        match self {
            Self::Stdout => {
                print!("{}", message);
            }
            Self::Syslog => {
                let message = CString::new(message.trim_end())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                unsafe {
                    libc::syslog(
                        libc::LOG_INFO,
                        b"%s\0".as_ptr() as *const libc::c_char,
                        message.as_ptr(),
                    )
                };
            }
            Self::File(file) => {
                write!(file, "{}", message)?;
                file.flush()?;
            }
        }
        Ok(())
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::Stdout
    }
}

/// One completed request, as written to the access log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    pub client: IpAddr,
    pub when: SystemTime,
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub status: StatusCode,
    pub bytes_sent: u64,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
}

impl fmt::Display for AccessRecord {
    /// Combined log format line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} - - {} \"{} {} {}\" {} {} \"{}\" \"{}\"",
            self.client,
            ClfDate(self.when),
            self.method,
            LogEncoded(&self.target),
            self.version,
            self.status.code(),
            self.bytes_sent,
            LogEncoded(self.referer.as_deref().unwrap_or("")),
            LogEncoded(self.user_agent.as_deref().unwrap_or("")),
        )
    }
}

/// Common Log Format date.
pub struct ClfDate(pub SystemTime);

impl fmt::Display for ClfDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let datetime = DateTime::<Local>::from(self.0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// Encode string for logging.
pub struct LogEncoded<'a>(pub &'a str);

impl<'a> fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if !c.is_ascii() || c.is_ascii_control() || c == '"' {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for b in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", b)?;
                }
            } else {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

/// Parse a diagnostics level such as `info` or `debug`.
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    level
        .parse::<LevelFilter>()
        .with_context(|| format!("invalid log level {:?}", level))
}

/// Install the diagnostics subscriber, writing to stderr.
pub fn init_tracing(max_level: LevelFilter) {
    tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_writer(io::stderr)
        .init();
}

/// Totals reported at shutdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub num_requests: u64,
    pub total_in: u64,
    pub total_out: u64,
}

impl ServerStats {
    pub fn print(&self) -> Result<()> {
        let rusage = getrusage().context("failed to get resource usage")?;
        println!(
            "CPU time used: {}.{:02} user, {}.{:02} system",
            rusage.ru_utime.tv_sec,
            rusage.ru_utime.tv_usec / 10000,
            rusage.ru_stime.tv_sec,
            rusage.ru_stime.tv_usec / 10000,
        );
        println!("Requests: {}", self.num_requests);
        println!("Bytes: {} in, {} out", self.total_in, self.total_out);
        Ok(())
    }
}

/// Safe wrapper for `libc::getrusage`.
fn getrusage() -> io::Result<libc::rusage> {
    let mut rusage = MaybeUninit::<libc::rusage>::zeroed();
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, rusage.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { rusage.assume_init() })
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Read;
    use std::time::Duration;

    use tempfile::tempdir;
    use test_case::test_case;

    fn record() -> AccessRecord {
        AccessRecord {
            client: "127.0.0.1".parse().unwrap(),
            when: SystemTime::UNIX_EPOCH + Duration::from_secs(1622040683),
            method: Method::Get,
            target: "/a b\"c".to_string(),
            version: Version::Http11,
            status: StatusCode::NotFound,
            bytes_sent: 123,
            referer: None,
            user_agent: Some("curl/7.0".to_string()),
        }
    }

    #[test]
    fn access_record_format() {
        let line = record().to_string();
        assert!(line.starts_with("127.0.0.1 - - ["));
        assert!(line.ends_with("] \"GET /a b%22c HTTP/1.1\" 404 123 \"\" \"curl/7.0\"\n"));
    }

    #[test]
    fn log_encoded_works() {
        assert_eq!(
            LogEncoded("\x00\x01\"\u{1F980}abc").to_string(),
            "%00%01%22%F0%9F%A6%80abc"
        );
    }

    #[test]
    fn file_sink_appends() {
        let dir = tempdir().expect("failed to create tempdir");
        let path = dir.path().join("access.log");
        let path = path.to_str().unwrap();
        let mut sink = LogSink::open_file(path).unwrap();
        sink.log("one\n").unwrap();
        sink.log("two\n").unwrap();

        let mut contents = String::new();
        File::open(path)
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "one\ntwo\n");
    }

    #[test_case("debug" => Some(LevelFilter::DEBUG) ; "debug")]
    #[test_case("WARN" => Some(LevelFilter::WARN) ; "uppercase")]
    #[test_case("off" => Some(LevelFilter::OFF) ; "off")]
    #[test_case("loud" => None ; "invalid")]
    fn parse_level_works(level: &str) -> Option<LevelFilter> {
        parse_level(level).ok()
    }
}
