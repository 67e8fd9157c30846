//! HTTP/1.x request-head parsing.
//!
//! Fills the stream's `Rx` from a raw head block. Both CRLF and bare-LF line
//! endings are accepted, header names are lowercased in place of a header
//! map lookup table, and the handful of headers the pipeline itself consumes
//! are peeled off as they stream past.

use crate::{
    errors::ErrorKind,
    filters::range::parse_range_header,
    pipeline::stream::{Stream, StreamState},
    uri,
};
use memchr::memchr;

/// Parses a request head from `buf`. Returns `Ok(None)` when the head is
/// still incomplete, or `Ok(Some(consumed))` with the number of bytes the
/// head occupied.
pub(crate) fn parse_request_head(stream: &mut Stream, buf: &[u8]) -> Result<Option<usize>, ErrorKind> {
    let Some(head_len) = find_head_end(buf) else {
        if buf.len() > stream.limits().uri_size + stream.limits().header_size {
            return Err(ErrorKind::InvalidHeader);
        }
        return Ok(None);
    };
    let head = &buf[..head_len];

    let line_end = memchr(b'\n', head).ok_or(ErrorKind::InvalidMethod)?;
    parse_request_line(stream, trim_cr(&head[..line_end]))?;
    stream.set_state(StreamState::First);

    let mut at = line_end + 1;
    let mut count = 0;
    while at < head.len() {
        let line_end = match memchr(b'\n', &head[at..]) {
            Some(i) => at + i,
            None => head.len(),
        };
        let line = trim_cr(&head[at..line_end]);
        at = line_end + 1;
        if line.is_empty() {
            break;
        }
        count += 1;
        if count > stream.limits().header_count {
            return Err(ErrorKind::TooManyHeaders);
        }
        parse_header_line(stream, line)?;
    }
    stream.set_state(StreamState::Parsed);
    Ok(Some(head_len))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    let mut at = 0;
    while let Some(i) = memchr(b'\n', &buf[at..]) {
        let nl = at + i;
        if buf.get(nl + 1) == Some(&b'\n') {
            return Some(nl + 2);
        }
        if buf.get(nl + 1) == Some(&b'\r') && buf.get(nl + 2) == Some(&b'\n') {
            return Some(nl + 3);
        }
        at = nl + 1;
    }
    None
}

#[inline(always)]
fn trim_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

const METHODS: [&str; 8] = [
    "GET", "HEAD", "POST", "PUT", "DELETE", "OPTIONS", "TRACE", "PATCH",
];

fn parse_request_line(stream: &mut Stream, line: &[u8]) -> Result<(), ErrorKind> {
    let sp1 = memchr(b' ', line).ok_or(ErrorKind::InvalidMethod)?;
    let method = std::str::from_utf8(&line[..sp1]).map_err(|_| ErrorKind::InvalidMethod)?;
    if !METHODS.contains(&method) {
        return Err(ErrorKind::InvalidMethod);
    }
    let rest = &line[sp1 + 1..];
    let sp2 = memchr(b' ', rest).ok_or(ErrorKind::InvalidUrl)?;
    let target = std::str::from_utf8(&rest[..sp2]).map_err(|_| ErrorKind::InvalidUrl)?;
    if target.is_empty() || target.len() > stream.limits().uri_size {
        return Err(ErrorKind::InvalidUrl);
    }
    let path = target.split('?').next().unwrap_or(target);
    let path = uri::validate_uri_path(path).ok_or(ErrorKind::InvalidUrl)?;

    let version = std::str::from_utf8(&rest[sp2 + 1..]).map_err(|_| ErrorKind::InvalidVersion)?;
    match version {
        "HTTP/1.1" => {}
        "HTTP/1.0" => stream.keep_alive_count = 0,
        v if v.starts_with("HTTP/") => return Err(ErrorKind::UnsupportedVersion),
        _ => return Err(ErrorKind::InvalidVersion),
    }

    stream.rx.method = method.to_string();
    stream.rx.uri = target.to_string();
    stream.rx.path_info = path;
    stream.rx.version = version.to_string();
    Ok(())
}

fn parse_header_line(stream: &mut Stream, line: &[u8]) -> Result<(), ErrorKind> {
    let colon = memchr(b':', line).ok_or(ErrorKind::InvalidHeader)?;
    if colon == 0 {
        return Err(ErrorKind::InvalidHeader);
    }
    let name = std::str::from_utf8(&line[..colon])
        .map_err(|_| ErrorKind::InvalidHeader)?
        .to_ascii_lowercase();
    if name.contains(' ') {
        return Err(ErrorKind::InvalidHeader);
    }
    let value = std::str::from_utf8(&line[colon + 1..])
        .map_err(|_| ErrorKind::InvalidHeader)?
        .trim()
        .to_string();

    match name.as_str() {
        "content-length" => {
            let length: u64 = value.parse().map_err(|_| ErrorKind::InvalidContentLength)?;
            stream.rx.content_length = Some(length);
        }
        "connection" => match value.to_ascii_lowercase().as_str() {
            "keep-alive" => {}
            "close" => stream.keep_alive_count = 0,
            _ => {}
        },
        "authorization" => {
            if let Some((scheme, details)) = value.split_once(' ') {
                if scheme.eq_ignore_ascii_case("basic") {
                    stream.rx.auth_details = Some(details.trim().to_string());
                    stream.encoded = true;
                }
            }
        }
        "accept" => stream.rx.accept = Some(value.clone()),
        "range" => {
            if let Some(ranges) = parse_range_header(&value) {
                stream.tx.output_ranges = ranges;
            }
        }
        "content-type" => {
            stream.rx.form = value.starts_with("application/x-www-form-urlencoded");
            if stream.rx.form {
                stream.rx.streaming = false;
            }
        }
        _ => {}
    }
    stream.rx.headers.add(&name, value);
    Ok(())
}

#[cfg(test)]
mod http1 {
    use super::*;
    use crate::{
        limits::HttpLimits,
        net::connection::Protocol,
        runtime::Http,
    };

    fn parse(req: &str) -> (Stream, Result<Option<usize>, ErrorKind>) {
        let http = Http::new(HttpLimits::default());
        let mut s = Stream::new_server(&http, Protocol::Http1);
        let result = parse_request_head(&mut s, req.as_bytes());
        (s, result)
    }

    #[test]
    fn valid_requests() {
        #[rustfmt::skip]
        let cases = [
            ("GET / HTTP/1.1\r\n\r\n",                        "GET", "/", "HTTP/1.1"),
            ("GET /api/users?id=3 HTTP/1.1\r\n\r\n",          "GET", "/api/users?id=3", "HTTP/1.1"),
            ("POST /submit HTTP/1.0\r\n\r\n",                 "POST", "/submit", "HTTP/1.0"),
            ("OPTIONS / HTTP/1.1\n\n",                        "OPTIONS", "/", "HTTP/1.1"),
            ("TRACE /x HTTP/1.1\r\nHost: h\r\n\r\n",          "TRACE", "/x", "HTTP/1.1"),
        ];

        for (req, method, uri, version) in cases {
            let (s, result) = parse(req);
            assert_eq!(result, Ok(Some(req.len())), "{req:?}");
            assert_eq!(s.rx.method, method);
            assert_eq!(s.rx.uri, uri);
            assert_eq!(s.rx.version, version);
            assert_eq!(s.state(), StreamState::Parsed);
        }
    }

    #[test]
    fn invalid_requests() {
        #[rustfmt::skip]
        let cases = [
            ("PYU / HTTP/1.1\r\n\r\n",           ErrorKind::InvalidMethod),
            ("GET\r\n\r\n",                      ErrorKind::InvalidMethod),
            ("GET  HTTP/1.1\r\n\r\n",            ErrorKind::InvalidUrl),
            ("GET ../etc HTTP/1.1\r\n\r\n",      ErrorKind::InvalidUrl),
            ("GET /../etc HTTP/1.1\r\n\r\n",     ErrorKind::InvalidUrl),
            ("GET / HTTP/2.0\r\n\r\n",           ErrorKind::UnsupportedVersion),
            ("GET / TOAST\r\n\r\n",              ErrorKind::InvalidVersion),
            ("GET / HTTP/1.1\r\nNoColon\r\n\r\n", ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\n: v\r\n\r\n",    ErrorKind::InvalidHeader),
            (
                "GET / HTTP/1.1\r\ncontent-length: ten\r\n\r\n",
                ErrorKind::InvalidContentLength,
            ),
        ];

        for (req, expected) in cases {
            let (_, result) = parse(req);
            assert_eq!(result, Err(expected), "{req:?}");
        }
    }

    #[test]
    fn incomplete_head() {
        let (_, result) = parse("GET / HTTP/1.1\r\nHost: h\r\n");
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn headers_are_lowercased_and_kept() {
        let (s, result) =
            parse("GET / HTTP/1.1\r\nHOST: example.com\r\nX-Custom: Value\r\n\r\n");
        assert_eq!(result, Ok(Some(54)));
        assert_eq!(s.rx.headers.get("host"), Some("example.com"));
        assert_eq!(s.rx.headers.get("x-custom"), Some("Value"));
    }

    #[test]
    fn special_headers() {
        let (s, _) = parse(
            "POST /form HTTP/1.1\r\n\
             Content-Length: 12\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Authorization: basic YWxpY2U6czNjcmV0\r\n\
             Accept: text/plain\r\n\
             Range: bytes=0-99\r\n\r\n",
        );

        assert_eq!(s.rx.content_length, Some(12));
        assert!(s.rx.form);
        assert!(!s.rx.streaming);
        assert_eq!(s.rx.auth_details.as_deref(), Some("YWxpY2U6czNjcmV0"));
        assert!(s.encoded);
        assert_eq!(s.rx.accept.as_deref(), Some("text/plain"));
        assert_eq!(s.tx.output_ranges.len(), 1);
    }

    #[test]
    fn connection_close_disables_keep_alive() {
        let (s, _) = parse("GET / HTTP/1.1\r\nConnection: close\r\n\r\n");
        assert_eq!(s.keep_alive_count, 0);

        let (s, _) = parse("GET / HTTP/1.0\r\n\r\n");
        assert_eq!(s.keep_alive_count, 0);

        let (s, _) = parse("GET / HTTP/1.1\r\n\r\n");
        assert!(s.keep_alive_count > 0);
    }

    #[test]
    fn consumed_offset_marks_body_start() {
        let req = b"POST /u HTTP/1.1\r\ncontent-length: 4\r\n\r\nbody";
        let http = Http::new(HttpLimits::default());
        let mut s = Stream::new_server(&http, Protocol::Http1);

        let consumed = parse_request_head(&mut s, req).unwrap().unwrap();
        assert_eq!(&req[consumed..], b"body");
    }
}
