//! Parsing of the `host[:port]` strings carried by `Connect` notifications.
//!
//! Accepted forms:
//!
//! | Input              | Host            | Port         |
//! |--------------------|-----------------|--------------|
//! | `""`               | default host    | default port |
//! | `host`             | `host`          | default port |
//! | `host:4000`        | `host`          | 4000         |
//! | `[::1]:4000`       | `::1`           | 4000         |
//! | `[::1]`            | `::1`           | default port |
//! | `fe80::1` (bare)   | `fe80::1`       | default port |

use thiserror::Error;

/// TCP port the server listens on unless configured otherwise.
pub const DEFAULT_GAME_PORT: u16 = 11223;

/// UDP port used for server announcements and client discovery.
pub const DEFAULT_ANNOUNCE_PORT: u16 = 11224;

/// Host used when a `Connect` carries an empty address.
pub const DEFAULT_HOST: &str = "localhost";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid port '{port}' in address '{address}'")]
    InvalidPort { address: String, port: String },

    #[error("unterminated '[' in address '{0}'")]
    UnterminatedBracket(String),

    #[error("unexpected text after ']' in address '{0}'")]
    TrailingGarbage(String),
}

/// Splits `address` into host and port, filling in the defaults.
///
/// # Errors
///
/// Returns [`AddressError`] when the port is not a valid `u16` or the
/// bracketed IPv6 form is malformed.
pub fn parse_address(
    address: &str,
    default_host: &str,
    default_port: u16,
) -> Result<(String, u16), AddressError> {
    let address = address.trim();
    if address.is_empty() {
        return Ok((default_host.to_string(), default_port));
    }

    if let Some(rest) = address.strip_prefix('[') {
        let close = rest
            .find(']')
            .ok_or_else(|| AddressError::UnterminatedBracket(address.to_string()))?;
        let host = &rest[..close];
        let after = &rest[close + 1..];
        if after.is_empty() {
            return Ok((host.to_string(), default_port));
        }
        let port = after
            .strip_prefix(':')
            .ok_or_else(|| AddressError::TrailingGarbage(address.to_string()))?;
        return Ok((host.to_string(), parse_port(address, port)?));
    }

    // More than one colon and no brackets: a bare IPv6 literal.
    if address.matches(':').count() > 1 {
        return Ok((address.to_string(), default_port));
    }

    match address.split_once(':') {
        Some((host, port)) => {
            let host = if host.is_empty() { default_host } else { host };
            Ok((host.to_string(), parse_port(address, port)?))
        }
        None => Ok((address.to_string(), default_port)),
    }
}

fn parse_port(address: &str, port: &str) -> Result<u16, AddressError> {
    port.parse::<u16>().map_err(|_| AddressError::InvalidPort {
        address: address.to_string(),
        port: port.to_string(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
