//! Maps a request URI onto a location and a filesystem path.

use tracing::{debug, warn};

use crate::config::{Location, ServerConfig};
use crate::fs::{error_status, FileSystem, FileType};
use crate::request::{HttpRequest, Method};
use crate::status::StatusCode;

/// Outcome of resolving a request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatingInfo {
    pub status: StatusCode,
    /// URI path being resolved; an index file's path after index lookup.
    pub path: String,
    /// Filesystem path, or the redirect target when `has_return` is set or
    /// the status is a redirection.
    pub target_resource: String,
    /// Index of the matched location in the server's locations.
    pub location: Option<usize>,
    pub is_directory: bool,
    pub autoindex: bool,
    pub has_return: bool,
    pub is_cgi: bool,
    /// URI path of the CGI script.
    pub script_name: String,
    /// Path following the script name.
    pub path_info: String,
}

impl LocatingInfo {
    fn new(path: &str) -> Self {
        Self {
            status: StatusCode::Ok,
            path: path.to_string(),
            target_resource: String::new(),
            location: None,
            is_directory: false,
            autoindex: false,
            has_return: false,
            is_cgi: false,
            script_name: String::new(),
            path_info: String::new(),
        }
    }
}

/// Resolves URI paths against a virtual server's locations.
pub struct TargetResourceHandler<'a> {
    fs: &'a dyn FileSystem,
    max_recursion: usize,
}

impl<'a> TargetResourceHandler<'a> {
    pub fn new(fs: &'a dyn FileSystem, max_recursion: usize) -> Self {
        Self { fs, max_recursion }
    }

    /// Resolve `request` and record the result in its `target_resource`.
    pub fn execute(&self, request: &mut HttpRequest, server: &ServerConfig) -> LocatingInfo {
        let info = self.resolve(request.method, &request.uri.path, server);
        request.target_resource = info.target_resource.clone();
        debug!(
            path = %request.uri.path,
            target = %info.target_resource,
            status = %info.status,
            "resolved target"
        );
        info
    }

    pub fn resolve(&self, method: Method, path: &str, server: &ServerConfig) -> LocatingInfo {
        let mut info = LocatingInfo::new(path);
        let index = match match_location(&server.locations, path) {
            Some(index) => index,
            None => {
                info.status = StatusCode::NotFound;
                return info;
            }
        };
        info.location = Some(index);
        if !server.locations[index].allows(method) {
            info.status = StatusCode::MethodNotAllowed;
            return info;
        }
        self.locate(info, method, server, 0)
    }

    fn locate(
        &self,
        mut info: LocatingInfo,
        method: Method,
        server: &ServerConfig,
        depth: usize,
    ) -> LocatingInfo {
        if depth >= self.max_recursion {
            warn!(path = %info.path, "index resolution recursed too deep");
            info.status = StatusCode::InternalServerError;
            return info;
        }
        let index = match match_location(&server.locations, &info.path) {
            Some(index) => index,
            None => {
                info.status = StatusCode::NotFound;
                return info;
            }
        };
        info.location = Some(index);
        let location = &server.locations[index];

        if let Some((status, target)) = &location.redirect {
            info.status = *status;
            info.target_resource = target.clone();
            info.has_return = true;
            return info;
        }

        let resource = match location.split_cgi_path(&info.path) {
            Some((script_name, path_info)) => {
                info.is_cgi = true;
                info.script_name = script_name.to_string();
                info.path_info = path_info.to_string();
                map_to_filesystem(location, script_name)
            }
            None => map_to_filesystem(location, &info.path),
        };
        info.target_resource = resource;

        match self.fs.file_type(&info.target_resource) {
            Ok(FileType::Regular) => {}
            Ok(FileType::Directory) => {
                info.is_cgi = false;
                return self.handle_directory(info, method, server, depth);
            }
            Ok(FileType::Other) => info.status = StatusCode::Forbidden,
            // An upload creates the file.
            Ok(FileType::NotFound) if method == Method::Post && !info.is_cgi => {}
            Ok(FileType::NotFound) => info.status = StatusCode::NotFound,
            Err(e) => {
                debug!(target = %info.target_resource, error = %e, "stat failed");
                info.status = error_status(&e);
            }
        }
        info
    }

    fn handle_directory(
        &self,
        mut info: LocatingInfo,
        method: Method,
        server: &ServerConfig,
        depth: usize,
    ) -> LocatingInfo {
        info.is_directory = true;
        if !info.path.ends_with('/') {
            info.status = StatusCode::MovedPermanently;
            info.target_resource = format!("{}/", info.path);
            return info;
        }
        if method != Method::Get {
            info.status = StatusCode::Forbidden;
            return info;
        }
        let location = match info.location.and_then(|index| server.locations.get(index)) {
            Some(location) => location,
            None => {
                info.status = StatusCode::NotFound;
                return info;
            }
        };
        for name in &location.index {
            let candidate = LocatingInfo::new(&format!("{}{}", info.path, name));
            let found = self.locate(candidate, method, server, depth + 1);
            if found.status != StatusCode::NotFound && !found.has_return {
                return found;
            }
        }
        if location.autoindex {
            info.autoindex = true;
        } else {
            info.status = StatusCode::Forbidden;
        }
        info
    }
}

/// Longest location prefix matching `path` on a segment boundary, or the
/// first location when none match.
pub fn match_location(locations: &[Location], path: &str) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (index, location) in locations.iter().enumerate() {
        if prefix_matches(&location.path, path)
            && best.map_or(true, |(_, len)| location.path.len() > len)
        {
            best = Some((index, location.path.len()));
        }
    }
    match best {
        Some((index, _)) => Some(index),
        None if locations.is_empty() => None,
        None => Some(0),
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    path.starts_with(prefix)
        && (prefix.ends_with('/')
            || path.len() == prefix.len()
            || path.as_bytes()[prefix.len()] == b'/')
}

fn map_to_filesystem(location: &Location, path: &str) -> String {
    match &location.alias {
        Some(alias) => format!("{}{}", alias, &path[location.path.len().min(path.len())..]),
        None => format!("{}{}", location.root, path),
    }
}
