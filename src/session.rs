//! Cookie-identified per-client session state over a shared TTL cache.
//!
//! A session is a key/value map attached to the stream; the persisted form
//! is a serialised snapshot stored in the cache under the session id. Ids are
//! 128-bit CSPRNG values rendered as hex: an identity cookie, not a
//! credential, but unpredictable all the same.

use crate::{
    errors::{status, ErrorKind, Fault},
    pipeline::stream::Stream,
};
use rand::RngCore;
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

/// Session cookie name. Compile-time constant; the value is the hex id.
pub const SESSION_COOKIE: &str = "-web-session-";

#[derive(Debug)]
struct CacheEntry {
    value: String,
    expires: Instant,
}

/// Shared TTL cache backing the session store. Mutations take the inner
/// lock; expiry is enforced lazily on access and during [`prune`](Self::prune).
#[derive(Debug, Default)]
pub struct TtlCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl TtlCache {
    pub fn new() -> Self {
        TtlCache::default()
    }

    pub fn read(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().expect("cache poisoned");
        match entries.get(key) {
            Some(entry) if entry.expires > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn write(&self, key: &str, value: &str, lifespan: Duration) {
        let mut entries = self.entries.lock().expect("cache poisoned");
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires: Instant::now() + lifespan,
            },
        );
    }

    pub fn expire(&self, key: &str) {
        self.entries.lock().expect("cache poisoned").remove(key);
    }

    /// Live (non-expired) entry count.
    pub fn active_count(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("cache poisoned");
        entries.retain(|_, e| e.expires > now);
        entries.len()
    }

    /// Drops expired entries. The periodic sweep owned by the service layer
    /// calls this.
    pub fn prune(&self) {
        self.active_count();
    }
}

/// In-memory session state bound to one stream.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub lifespan: Duration,
    data: HashMap<String, String>,
}

impl Session {
    fn new(id: String, lifespan: Duration, data: HashMap<String, String>) -> Self {
        Session { id, lifespan, data }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn generate_id() -> String {
    let mut raw = [0u8; 16];
    rand::rng().fill_bytes(&mut raw);
    raw.iter().map(|b| format!("{:02x}", b)).collect()
}

impl Stream {
    /// Resolves the session id: a bound session wins, otherwise the request
    /// cookies are scanned once for the session cookie.
    pub fn session_id(&mut self) -> Option<String> {
        if let Some(session) = &self.rx.session {
            return Some(session.id.clone());
        }
        if self.rx.session_probed {
            return None;
        }
        self.rx.session_probed = true;
        let cookies = self.rx.headers.get("cookie")?;
        parse_session_cookie(cookies, SESSION_COOKIE)
    }

    /// Returns the stream's session, looking it up from the shared cache by
    /// cookie, or creating one when `create` is set.
    pub fn get_session(&mut self, create: bool) -> Option<&mut Session> {
        if self.rx.session.is_none() {
            if let Some(id) = self.session_id() {
                if let Some(snapshot) = self.http.session_cache.read(&id) {
                    let data = serde_json::from_str(&snapshot).unwrap_or_default();
                    self.rx.session =
                        Some(Session::new(id, self.http.limits.session_lifespan, data));
                }
            }
            if self.rx.session.is_none() && create {
                self.create_session();
            }
        }
        self.rx.session.as_mut()
    }

    fn create_session(&mut self) {
        let http = self.http.clone();
        {
            let _guard = http.session_lock.lock().expect("session lock poisoned");
            let active = http.session_cache.active_count();
            if active >= http.limits.session_max {
                self.error(
                    Fault::status(status::SERVICE_UNAVAILABLE),
                    format!("Too many sessions {}/{}", active, http.limits.session_max),
                );
                return;
            }
        }
        let id = generate_id();
        // The cookie can only be set while headers are unsent; a session
        // created after that point will not survive the exchange.
        if !self.tx.headers_created {
            self.tx
                .headers
                .add("set-cookie", format!("{}={}; path=/", SESSION_COOKIE, id));
        }
        self.rx.session = Some(Session::new(
            id,
            self.http.limits.session_lifespan,
            HashMap::new(),
        ));
    }

    /// Reads a session value, falling back to `default`. Never creates.
    pub fn session_var(&mut self, key: &str, default: &str) -> String {
        match self.get_session(false).and_then(|s| s.get(key)) {
            Some(value) => value.to_string(),
            None => default.to_string(),
        }
    }

    /// Writes a session value, creating the session on demand. A `None`
    /// value removes the key.
    pub fn set_session_var(&mut self, key: &str, value: Option<&str>) {
        let Some(session) = self.get_session(true) else {
            return;
        };
        match value {
            Some(value) => {
                session.data.insert(key.to_string(), value.to_string());
            }
            None => {
                session.data.remove(key);
            }
        }
    }

    pub fn remove_session_var(&mut self, key: &str) {
        if let Some(session) = self.get_session(false) {
            session.data.remove(key);
        }
    }

    /// Serialises the whole session map into the shared cache under the
    /// session's lifespan.
    pub fn write_session(&mut self) -> Result<(), ErrorKind> {
        let cache = self.http.session_cache.clone();
        if let Some(session) = &self.rx.session {
            let snapshot = serde_json::to_string(&session.data).map_err(|e| {
                tracing::error!(error = %e, "cannot persist session cache");
                ErrorKind::SessionWrite
            })?;
            cache.write(&session.id, &snapshot, session.lifespan);
        }
        Ok(())
    }

    /// Destroys the session: removes the cookie, expires the cache entry,
    /// and detaches it from the stream.
    pub fn destroy_session(&mut self) {
        let http = self.http.clone();
        let _guard = http.session_lock.lock().expect("session lock poisoned");
        if let Some(session) = self.rx.session.take() {
            self.tx.headers.remove("set-cookie");
            http.session_cache.expire(&session.id);
        }
        self.rx.session_probed = false;
    }
}

/// Scans a `Cookie` header for `name`, accepting quoted and unquoted values
/// terminated by `,`, `;`, or end of string, honouring backslash escapes.
pub(crate) fn parse_session_cookie(cookies: &str, name: &str) -> Option<String> {
    let bytes = cookies.as_bytes();
    let mut search = 0;
    while let Some(found) = cookies[search..].find(name) {
        let mut at = search + found + name.len();
        search = at;
        let rest = bytes.get(at..)?;
        let mut i = 0;
        while i < rest.len() && (rest[i] == b' ' || rest[i] == b'\t' || rest[i] == b'=') {
            i += 1;
        }
        at += i;
        let quoted = bytes.get(at) == Some(&b'"');
        if quoted {
            at += 1;
        }
        let mut end = at;
        let mut escaped = false;
        while end < bytes.len() {
            let c = bytes[end];
            if escaped {
                escaped = false;
            } else if c == b'\\' {
                escaped = true;
            } else if quoted && c == b'"' {
                break;
            } else if !quoted && (c == b',' || c == b';') {
                break;
            }
            end += 1;
        }
        let raw = &cookies[at..end];
        if raw.is_empty() {
            continue;
        }
        return Some(unescape(raw));
    }
    None
}

fn unescape(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut chars = src.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}
