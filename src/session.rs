//! Cookie sessions.
//!
//! [`sessions`] builds the middleware: it attaches a [`Session`] loaded from
//! a [`Store`] to every request, saves it right before the response is
//! committed so the cookie can still be sent, and saves it once more after
//! the handler returns to persist late changes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::app::lock;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::handler::{Handler, Middleware};

/// Session key holding the remembered cookie max-age, in seconds.
pub const COOKIE_MAX_AGE_KEY: &str = "CookieMaxAge";

/// Remembered max-ages at or below this many seconds are not enforced on save.
const MIN_REMEMBERED_MAX_AGE: i64 = 3600;

/// The `SameSite` cookie attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

/// Attributes of the session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieOptions {
    pub path: String,
    pub domain: String,
    /// Seconds; 0 makes a browser-session cookie, negative deletes it
    pub max_age: i64,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            path: "/".to_owned(),
            domain: String::new(),
            max_age: 0,
            secure: false,
            http_only: true,
            same_site: Some(SameSite::Lax),
        }
    }
}

impl CookieOptions {
    /// Formats a `Set-Cookie` header value.
    pub fn format(&self, name: &str, value: &str) -> String {
        let mut cookie = format!("{name}={value}");
        if !self.path.is_empty() {
            cookie.push_str("; Path=");
            cookie.push_str(&self.path);
        }
        if !self.domain.is_empty() {
            cookie.push_str("; Domain=");
            cookie.push_str(&self.domain);
        }
        if self.max_age > 0 {
            cookie.push_str(&format!("; Max-Age={}", self.max_age));
        } else if self.max_age < 0 {
            cookie.push_str("; Max-Age=0");
        }
        if self.secure {
            cookie.push_str("; Secure");
        }
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        match self.same_site {
            Some(SameSite::Strict) => cookie.push_str("; SameSite=Strict"),
            Some(SameSite::Lax) => cookie.push_str("; SameSite=Lax"),
            Some(SameSite::None) => cookie.push_str("; SameSite=None"),
            None => {}
        }
        cookie
    }
}

/// Session cookie name and attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub name: String,
    pub cookie: CookieOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            name: "SID".to_owned(),
            cookie: CookieOptions::default(),
        }
    }
}

/// Runs before a session is persisted, with the values about to be saved.
pub type PreSaveHook = Box<dyn Fn(&mut Context, &Map<String, Value>) -> Result<()> + Send>;

/// A request's session as seen by handlers.
pub trait Sessioner: Send {
    fn id(&self) -> &str;
    fn get(&self, key: &str) -> Option<&Value>;
    fn set(&mut self, key: &str, value: Value);
    fn delete(&mut self, key: &str);
    fn clear(&mut self);
    fn set_pre_save_hook(&mut self, hook: PreSaveHook);
    /// Persists pending changes and sends the cookie.
    fn save(&mut self, c: &mut Context) -> Result<()>;
}

/// Session storage.
pub trait Store: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<Map<String, Value>>>;
    fn save(&self, id: &str, values: &Map<String, Value>, max_age: i64) -> Result<()>;
    fn delete(&self, id: &str) -> Result<()>;
}

/// Lifetime of entries saved for a browser-session cookie (max-age 0).
const DEFAULT_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Minimum time between two sweeps of expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct Entry {
    values: Map<String, Value>,
    expires: Instant,
}

#[derive(Debug)]
struct Entries {
    map: HashMap<String, Entry>,
    swept: Instant,
}

/// An in-process [`Store`].
///
/// Entries expire after the cookie max-age they were saved with, or after a
/// day for browser-session cookies. Expired entries are dropped when loaded
/// and swept from the map at most once a minute while saving.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<Entries>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Entries {
                map: HashMap::new(),
                swept: Instant::now(),
            }),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones not yet swept included.
    pub fn len(&self) -> usize {
        lock(&self.entries).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired entry.
    pub fn purge_expired(&self) {
        let mut entries = lock(&self.entries);
        let now = Instant::now();
        entries.map.retain(|_, entry| entry.expires > now);
        entries.swept = now;
    }
}

impl Store for MemoryStore {
    fn load(&self, id: &str) -> Result<Option<Map<String, Value>>> {
        let mut entries = lock(&self.entries);
        match entries.map.get(id) {
            Some(entry) if entry.expires > Instant::now() => Ok(Some(entry.values.clone())),
            Some(_) => {
                entries.map.remove(id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn save(&self, id: &str, values: &Map<String, Value>, max_age: i64) -> Result<()> {
        let lifetime = u64::try_from(max_age)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_LIFETIME);
        let now = Instant::now();

        let mut entries = lock(&self.entries);
        if now.duration_since(entries.swept) >= SWEEP_INTERVAL {
            entries.map.retain(|_, entry| entry.expires > now);
            entries.swept = now;
        }
        entries.map.insert(
            id.to_owned(),
            Entry {
                values: values.clone(),
                expires: now + lifetime,
            },
        );
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        lock(&self.entries).map.remove(id);
        Ok(())
    }
}

/// A store-backed session identified by a cookie.
pub struct Session {
    store: Arc<dyn Store>,
    name: String,
    id: String,
    values: Map<String, Value>,
    is_new: bool,
    dirty: bool,
    hooks: Vec<PreSaveHook>,
}

impl Session {
    /// Loads the session named by the request cookie `name`, or starts a new
    /// one when the cookie is missing or unknown to the store.
    pub fn start(store: Arc<dyn Store>, name: &str, c: &Context) -> Self {
        let existing = c.cookie(name).and_then(|id| match store.load(&id) {
            Ok(Some(values)) => Some((id, values)),
            Ok(None) => None,
            Err(err) => {
                log::warn!("loading session {id}: {err}");
                None
            }
        });
        let (id, values, is_new) = match existing {
            Some((id, values)) => (id, values, false),
            None => (Uuid::new_v4().simple().to_string(), Map::new(), true),
        };
        Self {
            store,
            name: name.to_owned(),
            id,
            values,
            is_new,
            dirty: false,
            hooks: Vec::new(),
        }
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }
}

impl Sessioner for Session {
    fn id(&self) -> &str {
        &self.id
    }

    fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_owned(), value);
        self.dirty = true;
    }

    fn delete(&mut self, key: &str) {
        if self.values.remove(key).is_some() {
            self.dirty = true;
        }
    }

    fn clear(&mut self) {
        if !self.values.is_empty() {
            self.values.clear();
            self.dirty = true;
        }
    }

    fn set_pre_save_hook(&mut self, hook: PreSaveHook) {
        self.hooks.push(hook);
    }

    fn save(&mut self, c: &mut Context) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        for hook in &self.hooks {
            hook(c, &self.values)?;
        }

        let mut options = c.cookie_options().clone();
        if self.values.is_empty() {
            self.store.delete(&self.id)?;
            options.max_age = -1;
        } else {
            self.store.save(&self.id, &self.values, options.max_age)?;
        }
        c.set_cookie(&self.name, &self.id, &options)?;

        self.dirty = false;
        self.is_new = false;
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("is_new", &self.is_new)
            .field("dirty", &self.dirty)
            .finish()
    }
}

/// Keeps the session cookie for `max_age` seconds on this and later
/// requests; a non-positive value forgets the remembered age.
pub fn remember_max_age(c: &mut Context, max_age: i64) {
    if max_age > 0 {
        c.cookie_options_mut().max_age = max_age;
        if let Some(session) = c.session() {
            session.set(COOKIE_MAX_AGE_KEY, Value::from(max_age));
        }
    } else if let Some(session) = c.session() {
        if session.get(COOKIE_MAX_AGE_KEY).is_some() {
            session.delete(COOKIE_MAX_AGE_KEY);
        }
    }
}

/// Session middleware over `store`. `options`, when given, replace the
/// app's session options for the requests it handles.
pub fn sessions(options: Option<SessionOptions>, store: Arc<dyn Store>) -> Middleware {
    Middleware::from_fn(move |c: &mut Context, next: &Handler| {
        if let Some(options) = &options {
            c.set_session_options(options.clone());
        }
        let name = c.session_options().name.clone();
        let mut session = Session::start(store.clone(), &name, c);
        session.set_pre_save_hook(Box::new(enforce_remembered_max_age));
        c.set_sessioner(Box::new(session));

        // A failed save before commit already reached the handler's result.
        let hook_failed = Arc::new(AtomicBool::new(false));
        let failed = hook_failed.clone();
        c.add_pre_response_hook(move |c: &mut Context| {
            c.save_session().map_err(|err| {
                failed.store(true, Ordering::Relaxed);
                err
            })
        });

        let result = next.handle(c);
        let saved = if hook_failed.load(Ordering::Relaxed) {
            Ok(())
        } else {
            c.save_session()
        };
        match (result, saved) {
            (result, Ok(())) => result,
            (Ok(()), Err(err)) => {
                log::error!("{err}");
                Err(err)
            }
            (Err(err), Err(save_err)) => {
                let err = Error::combine(err, save_err);
                log::error!("{err}");
                Err(err)
            }
        }
    })
}

/// Session middleware backed by a fresh [`MemoryStore`].
pub fn middleware(options: Option<SessionOptions>) -> Middleware {
    sessions(options, Arc::new(MemoryStore::new()))
}

fn enforce_remembered_max_age(c: &mut Context, values: &Map<String, Value>) -> Result<()> {
    let remembered = match values.get(COOKIE_MAX_AGE_KEY).and_then(Value::as_i64) {
        Some(max_age) => max_age,
        None => return Ok(()),
    };
    if remembered > MIN_REMEMBERED_MAX_AGE && c.cookie_options().max_age != remembered {
        c.cookie_options_mut().max_age = remembered;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Body, Request};
    use hyper::header::SET_COOKIE;

    struct FailingStore;

    impl Store for FailingStore {
        fn load(&self, _id: &str) -> Result<Option<Map<String, Value>>> {
            Ok(None)
        }

        fn save(&self, _id: &str, _values: &Map<String, Value>, _max_age: i64) -> Result<()> {
            Err(Error::Session("disk full".into()))
        }

        fn delete(&self, _id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn request_with_cookie(cookie: &str) -> Request {
        hyper::Request::builder()
            .uri("/")
            .header("cookie", cookie)
            .body(Body::empty())
            .unwrap()
    }

    fn set_cookie(c: &Context) -> String {
        c.response().headers()[SET_COOKIE].to_str().unwrap().to_owned()
    }

    /// Tests that a value set by the handler is stored and the cookie is sent
    /// before the response is committed.
    #[test]
    fn test_saved_before_commit() {
        let store = Arc::new(MemoryStore::new());
        let chain = sessions(None, store.clone()).handle(Handler::from_fn(|c: &mut Context| {
            c.session().unwrap().set("user", Value::from("alice"));
            c.string(200, "hi")
        }));

        let mut c = Context::new(Request::default());
        chain.handle(&mut c).unwrap();

        assert_eq!(store.len(), 1);
        let cookie = set_cookie(&c);
        assert!(cookie.starts_with("SID="));
        assert!(cookie.contains("HttpOnly"));

        let id = c.session().unwrap().id().to_owned();
        assert_eq!(store.load(&id).unwrap().unwrap()["user"], "alice");
    }

    /// Tests that an existing session is loaded from its cookie.
    #[test]
    fn test_load_existing() {
        let store = Arc::new(MemoryStore::new());
        let mut values = Map::new();
        values.insert("user".into(), Value::from("bob"));
        store.save("abc", &values, 0).unwrap();

        let c = Context::new(request_with_cookie("SID=abc"));
        let session = Session::start(store, "SID", &c);
        assert!(!session.is_new());
        assert_eq!(session.get("user"), Some(&Value::from("bob")));
    }

    /// Tests that handler and save errors are merged in order.
    #[test]
    fn test_combined_errors() {
        let chain = sessions(None, Arc::new(FailingStore)).handle(Handler::from_fn(
            |c: &mut Context| {
                c.session().unwrap().set("k", Value::from(1));
                Err(Error::custom("handler failed"))
            },
        ));

        let err = chain.handle(&mut Context::new(Request::default())).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Multiple errors:\n1. handler failed\n2. session error: disk full"
        );
    }

    /// Tests that a save failing before commit is reported once.
    #[test]
    fn test_failed_save_before_commit() {
        let chain = sessions(None, Arc::new(FailingStore)).handle(Handler::from_fn(
            |c: &mut Context| {
                c.session().unwrap().set("k", Value::from(1));
                c.string(200, "hi")
            },
        ));

        let mut c = Context::new(Request::default());
        let err = chain.handle(&mut c).unwrap_err();
        assert_eq!(err.to_string(), "session error: disk full");
        assert!(!c.response().committed());
    }

    /// Tests that memory store entries expire with their max-age.
    #[test]
    fn test_memory_store_expiry() {
        let store = MemoryStore::new();
        let mut values = Map::new();
        values.insert("user".into(), Value::from("carol"));
        store.save("short", &values, 1).unwrap();
        store.save("long", &values, 3600).unwrap();
        store.save("browser", &values, 0).unwrap();
        assert!(store.load("short").unwrap().is_some());

        std::thread::sleep(Duration::from_millis(1100));
        assert!(store.load("short").unwrap().is_none());
        assert_eq!(store.len(), 2);
        assert!(store.load("long").unwrap().is_some());

        store.save("short", &values, 1).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        store.purge_expired();
        assert_eq!(store.len(), 2);
        assert!(store.load("browser").unwrap().is_some());
    }

    /// Tests that a remembered max-age above one hour overrides the cookie.
    #[test]
    fn test_remembered_max_age() {
        let store = Arc::new(MemoryStore::new());
        let mut values = Map::new();
        values.insert(COOKIE_MAX_AGE_KEY.into(), Value::from(7200));
        store.save("abc", &values, 7200).unwrap();

        let chain = sessions(None, store.clone()).handle(Handler::from_fn(|c: &mut Context| {
            c.session().unwrap().set("seen", Value::from(true));
            c.no_content(204)
        }));
        let mut c = Context::new(request_with_cookie("SID=abc"));
        chain.handle(&mut c).unwrap();

        assert_eq!(c.cookie_options().max_age, 7200);
        assert!(set_cookie(&c).contains("Max-Age=7200"));
    }

    /// Tests that short remembered ages are left alone and that
    /// remember_max_age forgets the value when given 0.
    #[test]
    fn test_remember_max_age() {
        let mut c = Context::new(Request::default());
        let session = Session::start(Arc::new(MemoryStore::new()), "SID", &c);
        c.set_sessioner(Box::new(session));

        remember_max_age(&mut c, 600);
        assert_eq!(c.cookie_options().max_age, 600);
        assert_eq!(c.session().unwrap().get(COOKIE_MAX_AGE_KEY), Some(&Value::from(600)));

        c.cookie_options_mut().max_age = 0;
        let mut values = Map::new();
        values.insert(COOKIE_MAX_AGE_KEY.into(), Value::from(600));
        enforce_remembered_max_age(&mut c, &values).unwrap();
        assert_eq!(c.cookie_options().max_age, 0);

        remember_max_age(&mut c, 0);
        assert!(c.session().unwrap().get(COOKIE_MAX_AGE_KEY).is_none());
    }

    /// Tests the Set-Cookie formatting.
    #[test]
    fn test_cookie_format() {
        let options = CookieOptions {
            domain: "example.com".into(),
            max_age: 60,
            secure: true,
            same_site: Some(SameSite::Strict),
            ..CookieOptions::default()
        };
        assert_eq!(
            options.format("SID", "v"),
            "SID=v; Path=/; Domain=example.com; Max-Age=60; Secure; HttpOnly; SameSite=Strict"
        );
    }
}
