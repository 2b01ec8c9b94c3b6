use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::time::SystemTime;

use crate::status::StatusCode;

/// What a path refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Other,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: SystemTime,
}

/// Filesystem access used while serving requests, so handlers can be tested
/// without touching the disk.
pub trait FileSystem {
    /// Type of `path`. A missing path is `FileType::NotFound`, not an error.
    fn file_type(&self, path: &str) -> io::Result<FileType>;
    fn read_file(&self, path: &str) -> io::Result<Vec<u8>>;
    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>>;
    /// Append to `path`, creating it if needed.
    fn append_file(&self, path: &str, content: &[u8]) -> io::Result<()>;
    fn remove_file(&self, path: &str) -> io::Result<()>;
}

/// Status of the response to a failed filesystem operation.
pub fn error_status(err: &io::Error) -> StatusCode {
    match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NotFound,
        io::ErrorKind::PermissionDenied => StatusCode::Forbidden,
        _ => StatusCode::InternalServerError,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn file_type(&self, path: &str) -> io::Result<FileType> {
        match fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => Ok(FileType::Regular),
            Ok(metadata) if metadata.is_dir() => Ok(FileType::Directory),
            Ok(_) => Ok(FileType::Other),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(FileType::NotFound),
            Err(e) => Err(e),
        }
    }

    fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(entries)
    }

    fn append_file(&self, path: &str, content: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new().append(true).create(true).open(path)?;
        file.write_all(content)
    }

    fn remove_file(&self, path: &str) -> io::Result<()> {
        fs::remove_file(path)
    }
}
