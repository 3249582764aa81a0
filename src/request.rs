//! Request parser (C9): finds the header terminator, splits the request
//! line into its three tokens, and resolves + vets the requested resource
//! against the server root.
//!
//! Grounded in the original `extr_req_params` / `verify_cli_resource` /
//! `verify_double_line` in `server.c`, but the resource-escape check here
//! follows the spec's safer rule (canonicalize both sides, compare with
//! `Path::starts_with`) rather than the original's `strstr(resource, "../")`
//! substring check, which the spec flags as an open question resolved in
//! DESIGN.md.

use std::path::{Path, PathBuf};

use crate::connection::{Method, Protocol, METHOD_MAX, PROTOCOL_MAX, RESOURCE_MAX};

/// Returns the offset just past the header terminator, if the buffer
/// contains one. Prefers `\r\n\r\n`; falls back to `\n\n`.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    find_subslice(buf, b"\r\n\r\n")
        .map(|pos| pos + 4)
        .or_else(|| find_subslice(buf, b"\n\n").map(|pos| pos + 2))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// The three tokens off a parsed request line, before method/protocol/
/// resource validation.
pub struct RequestLine {
    pub method: String,
    pub resource: String,
    pub protocol: String,
}

/// Splits `METHOD SP RESOURCE SP PROTOCOL` out of the request line.
///
/// Returns `None` if the line does not contain exactly three
/// whitespace-delimited tokens, or if any token exceeds its bounded width.
pub fn parse_request_line(buf: &[u8], header_end: usize) -> Option<RequestLine> {
    let line_end = buf[..header_end]
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(header_end);
    let line = std::str::from_utf8(&buf[..line_end]).ok()?;

    let mut tokens = line.split_ascii_whitespace();
    let method = tokens.next()?;
    let resource = tokens.next()?;
    let protocol = tokens.next()?;
    if tokens.next().is_some() {
        return None;
    }

    if method.len() > METHOD_MAX || resource.len() > RESOURCE_MAX || protocol.len() > PROTOCOL_MAX
    {
        return None;
    }

    Some(RequestLine {
        method: method.to_string(),
        resource: resource.to_string(),
        protocol: protocol.to_string(),
    })
}

/// Matches a request-line method token against the supported set.
pub fn parse_method(token: &str) -> Option<Method> {
    match token {
        "GET" => Some(Method::Get),
        "PUT" => Some(Method::Put),
        _ => None,
    }
}

/// Matches a request-line protocol token against the supported set.
pub fn parse_protocol(token: &str) -> Option<Protocol> {
    match token {
        "HTTP/1.0" => Some(Protocol::Http10),
        "HTTP/1.1" => Some(Protocol::Http11),
        _ => None,
    }
}

/// Errors resolving a requested resource against the server root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveError {
    /// The canonicalized path escapes the canonicalized root.
    Forbidden,
}

/// Joins `root` with the requested `resource` and canonicalizes the
/// result, rejecting anything that would resolve outside `root`.
///
/// For GET the path must already exist to canonicalize; for PUT the
/// parent directory must exist but the file itself may not yet. Both
/// cases canonicalize the parent directory and rebuild the final
/// component, so a PUT of a brand-new file is not penalized for not
/// existing yet.
pub fn resolve_resource(root: &Path, resource: &str) -> Result<PathBuf, ResolveError> {
    let relative = resource.trim_start_matches('/');
    let joined = root.join(relative);

    let (dir, file_name) = match (joined.parent(), joined.file_name()) {
        (Some(dir), Some(name)) => (dir, name),
        _ => return Err(ResolveError::Forbidden),
    };

    let canonical_root = std::fs::canonicalize(root).map_err(|_| ResolveError::Forbidden)?;
    let canonical_dir = std::fs::canonicalize(dir).map_err(|_| ResolveError::Forbidden)?;

    if !canonical_dir.starts_with(&canonical_root) {
        return Err(ResolveError::Forbidden);
    }

    Ok(canonical_dir.join(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn finds_crlf_terminator() {
        let buf = b"GET / HTTP/1.0\r\n\r\nbody";
        assert_eq!(find_header_end(buf), Some(18));
    }

    #[test]
    fn finds_lf_terminator_when_no_crlf_present() {
        let buf = b"GET / HTTP/1.0\n\nbody";
        assert_eq!(find_header_end(buf), Some(16));
    }

    #[test]
    fn no_terminator_returns_none() {
        let buf = b"GET / HTTP/1.0\r\n";
        assert_eq!(find_header_end(buf), None);
    }

    #[test]
    fn parses_three_tokens() {
        let buf = b"GET /hello.txt HTTP/1.0\r\n\r\n";
        let end = find_header_end(buf).unwrap();
        let line = parse_request_line(buf, end).unwrap();
        assert_eq!(line.method, "GET");
        assert_eq!(line.resource, "/hello.txt");
        assert_eq!(line.protocol, "HTTP/1.0");
    }

    #[test]
    fn rejects_wrong_token_count() {
        let buf = b"GET /a\r\n\r\n";
        let end = find_header_end(buf).unwrap();
        assert!(parse_request_line(buf, end).is_none());
    }

    #[test]
    fn rejects_oversized_resource_token() {
        let long_resource = "/".to_string() + &"a".repeat(RESOURCE_MAX);
        let line = format!("GET {long_resource} HTTP/1.0\r\n\r\n");
        let end = find_header_end(line.as_bytes()).unwrap();
        assert!(parse_request_line(line.as_bytes(), end).is_none());
    }

    #[test]
    fn resolves_resource_under_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hello.txt"), b"hi").unwrap();

        let resolved = resolve_resource(dir.path(), "/hello.txt").unwrap();
        assert_eq!(resolved.file_name().unwrap(), "hello.txt");
    }

    #[test]
    fn rejects_escape_above_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_resource(dir.path(), "/../../etc/passwd").unwrap_err();
        assert_eq!(err, ResolveError::Forbidden);
    }

    #[test]
    fn allows_new_file_under_existing_directory_for_put() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_resource(dir.path(), "/new-upload.bin").unwrap();
        assert_eq!(resolved.file_name().unwrap(), "new-upload.bin");
    }
}
