//! Common Log Format (NCSA) access-line formatting.
//!
//! The sink that receives formatted lines is an external collaborator; the
//! core only renders the directive string when an exchange completes.

use crate::pipeline::stream::Stream;

/// Default NCSA common log format.
pub const COMMON_LOG_FORMAT: &str = "%h %l %u %t \"%r\" %>s %b";

/// Addressing details the stream does not carry itself.
#[derive(Debug, Clone, Default)]
pub struct LogPeer {
    pub remote_ip: String,
    pub local_ip: String,
}

/// Renders one access-log line for a completed exchange.
///
/// Directives: `%a` remote IP, `%A` local IP, `%b` body bytes or `-`,
/// `%B` bytes minus headers, `%h` remote host, `%l` identity (`-`),
/// `%n` local host, `%O` total bytes, `%r` request line, `%s`/`%>s` status,
/// `%t` bracketed local time, `%u` user, `%{Header}i` request header.
pub fn format_access_log(stream: &Stream, peer: &LogPeer, fmt: &str) -> String {
    let mut out = String::with_capacity(fmt.len() + 128);
    let mut chars = fmt.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let Some(directive) = chars.next() else {
            out.push('%');
            break;
        };
        match directive {
            '%' => out.push('%'),
            'a' | 'h' => out.push_str(&peer.remote_ip),
            'A' => out.push_str(&peer.local_ip),
            'b' => {
                if stream.tx.bytes_written == 0 {
                    out.push('-');
                } else {
                    out.push_str(&stream.tx.bytes_written.to_string());
                }
            }
            'B' => {
                let body = stream
                    .tx
                    .bytes_written
                    .saturating_sub(stream.tx.header_size as u64);
                out.push_str(&body.to_string());
            }
            'l' => out.push('-'),
            'n' => out.push_str(stream.rx.headers.get("host").unwrap_or("-")),
            'O' => out.push_str(&stream.tx.bytes_written.to_string()),
            'r' => {
                out.push_str(&format!(
                    "{} {} {}",
                    stream.rx.method, stream.rx.uri, stream.rx.version
                ));
            }
            's' => out.push_str(&stream.tx.status.to_string()),
            't' => {
                out.push('[');
                out.push_str(
                    &jiff::Zoned::now()
                        .strftime("%d/%b/%Y:%H:%M:%S %z")
                        .to_string(),
                );
                out.push(']');
            }
            'u' => {
                let user = stream.user.as_ref().map(|u| u.name.as_str()).unwrap_or("-");
                out.push_str(user);
            }
            '{' => {
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                match chars.next() {
                    Some('i') => {
                        out.push_str(stream.rx.headers.get(&name).unwrap_or("-"));
                    }
                    _ => out.push_str(&name),
                }
            }
            '>' => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    out.push_str(&stream.tx.status.to_string());
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod clf {
    use super::*;
    use crate::{
        limits::HttpLimits, net::connection::Protocol, route::Route, runtime::Http, Stream,
    };
    use std::sync::Arc;

    fn stream() -> Stream {
        let http = Http::new(HttpLimits::default());
        let mut s = Stream::new_server(&http, Protocol::Http1);
        s.build_pipeline(Arc::new(Route::default()));
        s.rx.method = "GET".into();
        s.rx.uri = "/index.html".into();
        s.rx.headers.add("host", "example.com");
        s.rx.headers.add("user-agent", "curl/8.0");
        s.tx.status = 200;
        s.tx.bytes_written = 1234;
        s.tx.header_size = 234;
        s
    }

    fn peer() -> LogPeer {
        LogPeer {
            remote_ip: "192.0.2.7".into(),
            local_ip: "10.0.0.1".into(),
        }
    }

    #[test]
    fn common_format() {
        let line = format_access_log(&stream(), &peer(), COMMON_LOG_FORMAT);
        assert!(line.starts_with("192.0.2.7 - - ["));
        assert!(line.ends_with("\"GET /index.html HTTP/1.1\" 200 1234"));
    }

    #[test]
    fn directives() {
        let s = stream();
        let p = peer();

        #[rustfmt::skip]
        let cases = [
            ("%a",            "192.0.2.7"),
            ("%A",            "10.0.0.1"),
            ("%h",            "192.0.2.7"),
            ("%B",            "1000"),
            ("%O",            "1234"),
            ("%n",            "example.com"),
            ("%s",            "200"),
            ("%>s",           "200"),
            ("%u",            "-"),
            ("%l",            "-"),
            ("%%",            "%"),
            ("%{user-agent}i", "curl/8.0"),
            ("%{missing}i",   "-"),
        ];

        for (fmt, expected) in cases {
            assert_eq!(format_access_log(&s, &p, fmt), expected, "{fmt}");
        }
    }

    #[test]
    fn blank_bytes_written_is_dash() {
        let mut s = stream();
        s.tx.bytes_written = 0;
        assert_eq!(format_access_log(&s, &peer(), "%b"), "-");

        s.tx.bytes_written = 99;
        assert_eq!(format_access_log(&s, &peer(), "%b"), "99");
    }

    #[test]
    fn time_is_bracketed() {
        let line = format_access_log(&stream(), &peer(), "%t");
        assert!(line.starts_with('['));
        assert!(line.ends_with(']'));
    }
}
