//! Status-line formatting (C6 step 4): the only response header this
//! server ever emits.

use crate::connection::{Protocol, Status};

/// Formats `"<protocol> <code> <reason>\r\n\r\n"` into `buf`, starting at
/// offset 0, and returns the number of bytes written.
///
/// Panics if `buf` is too small to hold the formatted line; in practice
/// the connection buffer (>= 8 KiB) dwarfs the longest possible status
/// line by several orders of magnitude.
pub fn format_status_line(buf: &mut [u8], protocol: Protocol, status: Status) -> usize {
    use std::io::Write;

    let mut cursor = &mut buf[..];
    write!(
        cursor,
        "{} {} {}\r\n\r\n",
        protocol.as_str(),
        status.code(),
        status.reason()
    )
    .expect("status line fits in the connection buffer");

    let remaining = cursor.len();
    buf.len() - remaining
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_ok_status_line() {
        let mut buf = [0u8; 64];
        let n = format_status_line(&mut buf, Protocol::Http10, Status::Ok);
        assert_eq!(&buf[..n], b"HTTP/1.0 200 OK\r\n\r\n");
    }

    #[test]
    fn formats_not_found_on_http11() {
        let mut buf = [0u8; 64];
        let n = format_status_line(&mut buf, Protocol::Http11, Status::NotFound);
        assert_eq!(&buf[..n], b"HTTP/1.1 404 NOT FOUND\r\n\r\n");
    }
}
