//! URL path normalisation and validation.
//!
//! `normalize_uri_path` resolves `.`/`..`/duplicate-slash segments and
//! permits relative results; `validate_uri_path` percent-decodes and accepts
//! only absolute paths that stay rooted at `/`.

pub fn normalize_uri_path(path: &str) -> String {
    if path.is_empty() {
        return String::new();
    }
    if !path.contains('/') && !path.contains('.') {
        return path.to_string();
    }
    let segs: Vec<&str> = path.split('/').collect();
    let mut stack: Vec<&str> = Vec::with_capacity(segs.len());
    let mut trailing = false;

    for (i, seg) in segs.iter().enumerate() {
        let last = i == segs.len() - 1;
        match *seg {
            "." => {
                trailing = last;
            }
            "" if i == 0 => {
                // Leading empty segment marks an absolute path. A later `..`
                // may pop it, dropping the root.
                stack.push("");
            }
            "" => {
                trailing = last;
            }
            ".." => {
                stack.pop();
                trailing = false;
            }
            seg => {
                stack.push(seg);
                trailing = false;
            }
        }
    }
    if stack.is_empty() {
        return String::new();
    }
    if stack == [""] {
        return "/".to_string();
    }
    let mut out = stack.join("/");
    if trailing {
        out.push('/');
    }
    out
}

/// Percent-decodes and normalises a request path. Returns `None` unless the
/// result is an absolute path still rooted at `/`. Raw backslashes are
/// rejected before decoding.
pub fn validate_uri_path(uri: &str) -> Option<String> {
    if !uri.starts_with('/') || uri.contains('\\') {
        return None;
    }
    let decoded = percent_decode(uri)?;
    let normalized = normalize_uri_path(&decoded);
    if !normalized.starts_with('/') {
        return None;
    }
    Some(normalized)
}

fn percent_decode(src: &str) -> Option<String> {
    let bytes = src.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3)?;
            let hex = std::str::from_utf8(hex).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod uri {
    use super::*;

    #[test]
    fn normalize() {
        #[rustfmt::skip]
        let cases = [
            ("",            ""),
            ("/",           "/"),
            ("..",          ""),
            ("../",         ""),
            ("/..",         ""),
            ("./",          ""),
            ("./.",         ""),
            ("././",        ""),

            ("a",           "a"),
            ("/a",          "/a"),
            ("a/",          "a/"),
            ("../a",        "a"),
            ("/a/..",       "/"),
            ("/a/../",      "/"),
            ("a/..",        ""),
            ("/../a",       "a"),
            ("../../a",     "a"),
            ("../a/b/..",   "a"),

            ("/b/a",        "/b/a"),
            ("/b/../a",     "/a"),
            ("/a/../b/..",  "/"),

            ("/a/./",       "/a/"),
            ("/a/./.",      "/a/"),
            ("/a/././",     "/a/"),
            ("/a/.",        "/a/"),

            ("/*a////b/",   "/*a/b/"),
            ("/*a/////b/",  "/*a/b/"),

            ("\\a\\b\\",    "\\a\\b\\"),
            ("/..server.conf",  "/..server.conf"),
        ];

        for (input, expected) in cases {
            assert_eq!(normalize_uri_path(input), expected, "{input:?}");
        }
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in ["/a/../b/", "/x/./y", "../a", "/*a////b/", "/a/.."] {
            let once = normalize_uri_path(input);
            assert_eq!(normalize_uri_path(&once), once, "{input:?}");
        }
    }

    #[test]
    fn validate() {
        #[rustfmt::skip]
        let cases = [
            ("",              None),
            ("/",             Some("/")),
            ("..",            None),
            ("/..",           None),
            ("./",            None),
            ("a",             None),
            ("/a",            Some("/a")),
            ("a/",            None),
            ("/a/..",         Some("/")),
            ("/a/../",        Some("/")),
            ("/../a",         None),
            ("/b/../a",       Some("/a")),
            ("/a/./",         Some("/a/")),
            ("/*a////b/",     Some("/*a/b/")),

            ("\\a\\b\\",      None),
            ("/\\server.conf", None),
            ("/..%5Cserver.conf", Some("/..\\server.conf")),

            ("/extra%20long/a/..",        Some("/extra long")),
            ("/extra%20long/../path/a/..", Some("/path")),
        ];

        for (input, expected) in cases {
            assert_eq!(
                validate_uri_path(input).as_deref(),
                expected,
                "{input:?}"
            );
        }
    }

    #[test]
    fn bad_percent_escapes_are_rejected() {
        assert_eq!(validate_uri_path("/a%"), None);
        assert_eq!(validate_uri_path("/a%2"), None);
        assert_eq!(validate_uri_path("/a%zz"), None);
    }
}
