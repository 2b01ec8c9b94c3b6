//! A non-blocking HTTP/1.1 server with virtual hosts, static files, uploads,
//! directory listings and CGI, driven by a single epoll loop.

pub mod autoindex;
pub mod body;
pub mod cgi;
pub mod config;
pub mod connection;
pub mod fs;
pub mod log;
pub mod parser;
pub mod poller;
pub mod request;
pub mod response;
pub mod server;
pub mod status;
pub mod target;

#[cfg(test)]
mod test_support;
