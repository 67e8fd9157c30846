//! Basic Authorization (RFC 7617).
//!
//! Wire form: `Authorization: basic base64(user:pass)`. The decoder requires
//! a single `:` separator with non-empty fields on both sides.

use crate::{
    errors::{status, ErrorKind, Fault},
    pipeline::stream::Stream,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use memchr::memchr;

/// Decodes Basic credential details into `(username, password)`.
pub fn decode_credentials(details: &str) -> Result<(String, String), ErrorKind> {
    let decoded = BASE64
        .decode(details.trim())
        .map_err(|_| ErrorKind::BadCredentials)?;
    let decoded = String::from_utf8(decoded).map_err(|_| ErrorKind::BadCredentials)?;
    let sep = memchr(b':', decoded.as_bytes()).ok_or(ErrorKind::BadCredentials)?;
    let (username, password) = (&decoded[..sep], &decoded[sep + 1..]);
    if username.is_empty() || password.is_empty() {
        return Err(ErrorKind::BadCredentials);
    }
    Ok((username.to_string(), password.to_string()))
}

impl Stream {
    /// Parses the request's Basic credentials. Clears the `encoded` marker
    /// once the credentials are in cleartext form.
    pub fn parse_basic_credentials(&mut self) -> Result<(String, String), ErrorKind> {
        let details = self
            .rx
            .auth_details
            .clone()
            .ok_or(ErrorKind::BadCredentials)?;
        let parsed = decode_credentials(&details)?;
        self.encoded = false;
        Ok(parsed)
    }

    /// Challenges the client for credentials. Only called when not logged in.
    pub fn basic_login(&mut self) {
        let realm = self.auth().map(|a| a.realm.clone()).unwrap_or_default();
        self.tx
            .headers
            .set("www-authenticate", format!("Basic realm=\"{realm}\""));
        self.error(
            Fault::status(status::UNAUTHORIZED),
            "Access Denied. Login required",
        );
    }

    /// Client side: attaches the `Authorization` header. May be sent without
    /// waiting for a 401 challenge.
    pub fn basic_set_headers(&mut self, username: &str, password: &str) {
        let encoded = BASE64.encode(format!("{username}:{password}"));
        self.tx
            .headers
            .set("authorization", format!("basic {encoded}"));
        self.encoded = true;
    }
}

#[cfg(test)]
mod basic {
    use super::*;
    use crate::{
        auth::user::Auth, limits::HttpLimits, net::connection::Protocol, route::Route,
        runtime::Http,
    };
    use std::sync::Arc;

    #[test]
    fn decode_forms() {
        #[rustfmt::skip]
        let cases = [
            // alice:s3cret
            ("YWxpY2U6czNjcmV0",     Ok(("alice", "s3cret"))),
            // user:pa:ss, extra separators belong to the password
            ("dXNlcjpwYTpzcw==",     Ok(("user", "pa:ss"))),
            // alice: with empty password
            ("YWxpY2U6",             Err(ErrorKind::BadCredentials)),
            // :pass with empty user
            ("OnBhc3M=",             Err(ErrorKind::BadCredentials)),
            // nocolon
            ("bm9jb2xvbg==",         Err(ErrorKind::BadCredentials)),
            ("not base64!!",         Err(ErrorKind::BadCredentials)),
        ];

        for (details, expected) in cases {
            let got = decode_credentials(details);
            match expected {
                Ok((user, pass)) => {
                    assert_eq!(got, Ok((user.to_string(), pass.to_string())), "{details}");
                }
                Err(e) => assert_eq!(got, Err(e), "{details}"),
            }
        }
    }

    #[test]
    fn challenge_sets_realm_and_401() {
        let http = Http::new(HttpLimits::default());
        let mut s = crate::Stream::new_server(&http, Protocol::Http1);
        let route = Route {
            auth: Some(Arc::new(Auth::new("private area"))),
            ..Route::default()
        };
        s.build_pipeline(Arc::new(route));

        s.basic_login();
        assert_eq!(
            s.tx.headers.get("www-authenticate"),
            Some("Basic realm=\"private area\"")
        );
        assert_eq!(s.tx.status, status::UNAUTHORIZED);
    }

    #[test]
    fn client_header_round_trips() {
        let http = Http::new(HttpLimits::default());
        let mut s = crate::Stream::new_client(&http, Protocol::Http1);
        s.build_pipeline(Arc::new(Route::default()));
        s.basic_set_headers("alice", "s3cret");

        let header = s.tx.headers.get("authorization").unwrap();
        let details = header.strip_prefix("basic ").unwrap();
        assert_eq!(
            decode_credentials(details),
            Ok(("alice".to_string(), "s3cret".to_string()))
        );
        assert!(s.encoded);
    }

    #[test]
    fn stream_parse_uses_request_details() {
        let http = Http::new(HttpLimits::default());
        let mut s = crate::Stream::new_server(&http, Protocol::Http1);
        s.build_pipeline(Arc::new(Route::default()));
        s.rx.auth_details = Some("YWxpY2U6czNjcmV0".to_string());
        s.encoded = true;

        let (user, pass) = s.parse_basic_credentials().unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "s3cret");
        assert!(!s.encoded);
    }
}
