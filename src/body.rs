//! Produces the response for a resolved request target.

use std::time::SystemTime;

use tracing::{debug, warn};

use crate::autoindex;
use crate::config::ServerConfig;
use crate::fs::{error_status, FileSystem, FileType};
use crate::request::{HttpRequest, Method};
use crate::response::{GeneratedOn, HtmlEscaped, HttpResponse, JsonEscaped};
use crate::status::StatusCode;
use crate::target::{LocatingInfo, TargetResourceHandler};

const JSON_CONTENT_TYPE: &str = "application/json";

pub struct ResponseBodyHandler<'a> {
    fs: &'a dyn FileSystem,
    targets: &'a TargetResourceHandler<'a>,
    server_id: bool,
    now: SystemTime,
}

impl<'a> ResponseBodyHandler<'a> {
    pub fn new(
        fs: &'a dyn FileSystem,
        targets: &'a TargetResourceHandler<'a>,
        server_id: bool,
        now: SystemTime,
    ) -> Self {
        Self {
            fs,
            targets,
            server_id,
            now,
        }
    }

    /// Build the response for a request that is not handled by CGI.
    pub fn execute(
        &self,
        request: &HttpRequest,
        info: &LocatingInfo,
        server: &ServerConfig,
    ) -> HttpResponse {
        if info.status.is_error() {
            return self.error_response(info.status, info.location, server);
        }
        if info.status.is_redirection() || info.has_return {
            return self.redirect(info.status, &info.target_resource);
        }
        if info.autoindex {
            return self.listing(info, server);
        }
        match request.method {
            Method::Get => self.serve_file(info, server),
            Method::Post => self.upload(request, info, server),
            Method::Delete => self.delete(request, info, server),
        }
    }

    /// Error response using the configured error page for `status` when one
    /// can be served, else a generated page.
    pub fn error_response(
        &self,
        status: StatusCode,
        location: Option<usize>,
        server: &ServerConfig,
    ) -> HttpResponse {
        let page = location
            .and_then(|index| server.locations.get(index))
            .and_then(|location| location.error_pages.get(&status))
            .or_else(|| server.error_pages.get(&status));
        if let Some(uri) = page {
            if let Some((body, resource)) = self.custom_error_page(uri, server) {
                let mut response = HttpResponse::new(status);
                response.body = body;
                response.target_resource = resource;
                return response;
            }
        }
        self.default_page(status)
    }

    fn custom_error_page(&self, uri: &str, server: &ServerConfig) -> Option<(Vec<u8>, String)> {
        let info = self.targets.resolve(Method::Get, uri, server);
        if info.status != StatusCode::Ok || info.is_directory || info.is_cgi || info.autoindex {
            debug!(uri, status = %info.status, "error page unavailable");
            return None;
        }
        match self.fs.read_file(&info.target_resource) {
            Ok(body) => Some((body, info.target_resource)),
            Err(e) => {
                warn!(uri, error = %e, "failed to read error page");
                None
            }
        }
    }

    /// Generated error page.
    pub fn default_page(&self, status: StatusCode) -> HttpResponse {
        let page = format!(
            "<html><head><title>{}</title></head><body>\n\
            <h1>{}</h1>\n\
            {}\n\
            <hr>\n\
            {}\
            </body></html>\n",
            status,
            status.reason(),
            default_reason(status),
            self.generated_on(),
        );
        HttpResponse::html(status, page)
    }

    fn redirect(&self, status: StatusCode, location: &str) -> HttpResponse {
        // A bare `return <code>;` has no target to point at.
        if location.is_empty() {
            return self.default_page(status);
        }
        let page = format!(
            "<html><head><title>{}</title></head><body>\n\
            <h1>{}</h1>\n\
            Moved to: <a href=\"{}\">{}</a>\n\
            <hr>\n\
            {}\
            </body></html>\n",
            status,
            status.reason(),
            HtmlEscaped(location),
            HtmlEscaped(location),
            self.generated_on(),
        );
        let mut response = HttpResponse::html(status, page);
        response.set_header("Location", location);
        response
    }

    fn listing(&self, info: &LocatingInfo, server: &ServerConfig) -> HttpResponse {
        match autoindex::render(
            self.fs,
            &info.target_resource,
            &info.path,
            &self.generated_on(),
        ) {
            Ok(page) => HttpResponse::html(StatusCode::Ok, page),
            Err(e) => {
                warn!(dir = %info.target_resource, error = %e, "couldn't list directory");
                self.error_response(error_status(&e), info.location, server)
            }
        }
    }

    fn serve_file(&self, info: &LocatingInfo, server: &ServerConfig) -> HttpResponse {
        match self.fs.read_file(&info.target_resource) {
            Ok(body) => {
                let mut response = HttpResponse::new(StatusCode::Ok);
                response.body = body;
                response.target_resource = info.target_resource.clone();
                response
            }
            Err(e) => {
                debug!(file = %info.target_resource, error = %e, "failed to read file");
                self.error_response(error_status(&e), info.location, server)
            }
        }
    }

    fn upload(
        &self,
        request: &HttpRequest,
        info: &LocatingInfo,
        server: &ServerConfig,
    ) -> HttpResponse {
        let existed = matches!(
            self.fs.file_type(&info.target_resource),
            Ok(FileType::Regular)
        );
        if let Err(e) = self.fs.append_file(&info.target_resource, &request.body) {
            warn!(file = %info.target_resource, error = %e, "upload failed");
            return self.error_response(error_status(&e), info.location, server);
        }
        debug!(file = %info.target_resource, bytes = request.body.len(), "stored upload");
        if existed {
            json(StatusCode::Ok, "updated", &request.uri.path)
        } else {
            let mut response = json(StatusCode::Created, "created", &request.uri.path);
            response.set_header("Location", &request.uri.path);
            response
        }
    }

    fn delete(
        &self,
        request: &HttpRequest,
        info: &LocatingInfo,
        server: &ServerConfig,
    ) -> HttpResponse {
        let status = match self.fs.file_type(&info.target_resource) {
            Ok(FileType::Regular) => match self.fs.remove_file(&info.target_resource) {
                Ok(()) => return json(StatusCode::Ok, "deleted", &request.uri.path),
                Err(e) => {
                    warn!(file = %info.target_resource, error = %e, "delete failed");
                    error_status(&e)
                }
            },
            Ok(FileType::NotFound) => StatusCode::NotFound,
            Ok(_) => StatusCode::Forbidden,
            Err(e) => error_status(&e),
        };
        self.error_response(status, info.location, server)
    }

    fn generated_on(&self) -> GeneratedOn {
        GeneratedOn {
            server_id: self.server_id,
            now: self.now,
        }
    }
}

fn json(status: StatusCode, result: &str, path: &str) -> HttpResponse {
    let mut response = HttpResponse::new(status);
    response.set_header("Content-Type", JSON_CONTENT_TYPE);
    response.body = format!(
        "{{\"status\":\"{}\",\"path\":\"{}\"}}\n",
        result,
        JsonEscaped(path)
    )
    .into_bytes();
    response
}

fn default_reason(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BadRequest => "You sent a request that the server couldn't understand.",
        StatusCode::Forbidden => "You don't have permission to access this URL.",
        StatusCode::NotFound => "The URL you requested was not found.",
        StatusCode::MethodNotAllowed => "The method is not allowed for the requested URL.",
        StatusCode::RequestTimeout => "The server timed out waiting for the request.",
        StatusCode::PayloadTooLarge => "Your request was dropped because it was too long.",
        StatusCode::RequestHeaderFieldsTooLarge => "Your request headers were too large.",
        StatusCode::InternalServerError => "The server encountered an internal error.",
        StatusCode::NotImplemented => "The method you specified is not implemented.",
        StatusCode::BadGateway => "The CGI program sent an invalid response.",
        StatusCode::GatewayTimeout => "The CGI program did not respond in time.",
        StatusCode::HttpVersionNotSupported => {
            "The HTTP version you specified is not supported."
        }
        _ => "",
    }
}
