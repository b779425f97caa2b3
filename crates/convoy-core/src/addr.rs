//! `[HOST]:PORT` listen-address parsing shared by both binaries.

use std::net::{SocketAddr, ToSocketAddrs};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddrError {
    #[error("invalid listen address `{0}`")]
    Invalid(String),
    #[error("could not resolve `{0}`: {1}")]
    Resolve(String, std::io::Error),
}

/// Parse a listen address. A bare leading colon (`:8080`) binds all
/// interfaces; otherwise the host part is resolved and the first result wins.
pub fn parse_listen_addr(input: &str) -> Result<SocketAddr, AddrError> {
    let full = match input.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => input.to_string(),
    };
    full.to_socket_addrs()
        .map_err(|e| AddrError::Resolve(input.to_string(), e))?
        .next()
        .ok_or_else(|| AddrError::Invalid(input.to_string()))
}
