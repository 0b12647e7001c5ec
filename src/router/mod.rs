//! Route table with exact-match mapping from (method, path) to handler.
//!
//! This module provides [`RouteTable`], which holds one map per route method
//! keyword (`GET`, `POST`, `PUT`, `DELETE` and the `WS` upgrade keyword), the
//! global middleware list and the not-found handler.
//!
//! Paths are normalized on registration and on lookup: leading and trailing
//! slashes are trimmed and a single leading slash is put back, so `"/a/b"`,
//! `"a/b"` and `"a/b/"` all name the same entry. There are no patterns or
//! wildcards; a request for `/a/b/c` never matches a route registered at `/a/b`.
//!
//! The table is built before serving starts and is only read afterwards.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;
use tracing::trace;

use crate::chain::{Handler, handler};
use crate::context::Context;
use crate::error::HandlerResult;
use crate::http::Method;

/// Returned by [`RouteTable::lookup`] when nothing is registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no route registered for {method} {path}")]
    NotRegistered { method: String, path: String },
}

/// The method keywords a route can be registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteMethod {
    Get,
    Post,
    Put,
    Delete,
    /// Protocol-upgrade (websocket) requests, whatever their HTTP method.
    Ws,
}

impl RouteMethod {
    pub const ALL: [Self; 5] = [Self::Get, Self::Post, Self::Put, Self::Delete, Self::Ws];

    /// Parses a keyword, ignoring ASCII case. Unknown keywords yield `None`.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(keyword))
    }

    /// The route method for a plain (non-upgrade) request.
    pub fn from_method(method: &Method) -> Option<Self> {
        match method {
            Method::Get => Some(Self::Get),
            Method::Post => Some(Self::Post),
            Method::Put => Some(Self::Put),
            Method::Delete => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Ws => "WS",
        }
    }
}

impl fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How handler names become path segments in the registration passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PathStyle {
    /// `UserInfo` → `user-info`.
    #[default]
    Connector,
    /// `UserInfo` stays `UserInfo`.
    Hump,
}

impl PathStyle {
    fn segment(self, name: &str) -> String {
        let converted = match self {
            Self::Hump => name.to_owned(),
            Self::Connector => {
                let mut out = String::with_capacity(name.len() + 4);
                let mut in_upper_run = false;
                for ch in name.chars() {
                    if ch.is_ascii_uppercase() {
                        if !in_upper_run {
                            out.push('-');
                        }
                        out.push(ch.to_ascii_lowercase());
                        in_upper_run = true;
                    } else {
                        out.push(ch);
                        in_upper_run = false;
                    }
                }
                out
            }
        };
        converted.trim_matches('-').to_owned()
    }
}

/// Normalizes a route or request path: `"a/b/"` → `"/a/b"`, `""` → `"/"`.
///
/// ```
/// use trellis::router::normalize_path;
///
/// assert_eq!(normalize_path("/a/b"), "/a/b");
/// assert_eq!(normalize_path("a/b/"), "/a/b");
/// assert_eq!(normalize_path("//"), "/");
/// ```
pub fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}

// Method keyword prefixes recognized by `prefix_fill_routes`.
const NAME_PREFIXES: [(&str, RouteMethod); 10] = [
    ("POST", RouteMethod::Post),
    ("Post", RouteMethod::Post),
    ("GET", RouteMethod::Get),
    ("Get", RouteMethod::Get),
    ("WS", RouteMethod::Ws),
    ("Ws", RouteMethod::Ws),
    ("PUT", RouteMethod::Put),
    ("Put", RouteMethod::Put),
    ("DELETE", RouteMethod::Delete),
    ("Delete", RouteMethod::Delete),
];

struct Route {
    handler: Handler,
    name: String,
}

/// Exact-match route table plus global middleware and the not-found handler.
///
/// # Examples
///
/// ```rust
/// use trellis::router::RouteTable;
///
/// let mut routes = RouteTable::new();
/// routes.get("/ping", |ctx| {
///     ctx.write_str("pong")?;
///     Ok(())
/// });
///
/// assert!(routes.lookup("GET", "ping/").is_ok());
/// assert!(routes.lookup("POST", "/ping").is_err());
/// ```
pub struct RouteTable {
    routes: HashMap<RouteMethod, HashMap<String, Route>>,
    middleware: Vec<Handler>,
    not_found: Option<Handler>,
    path_style: PathStyle,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    /// Create an empty table with one map per [`RouteMethod`].
    pub fn new() -> Self {
        let routes = RouteMethod::ALL
            .into_iter()
            .map(|m| (m, HashMap::with_capacity(10)))
            .collect();
        Self {
            routes,
            middleware: Vec::new(),
            not_found: None,
            path_style: PathStyle::default(),
        }
    }

    /// Register `handler` for `method` at `path`.
    ///
    /// `method` is one of `GET`, `POST`, `PUT`, `DELETE` or `WS` (any ASCII
    /// case). A registration under any other keyword is dropped without an
    /// error. Registering the same method and path twice keeps the later handler.
    ///
    /// # Arguments
    ///
    /// - `method`: the route method keyword.
    /// - `path`: exact path; surrounding slashes are ignored.
    /// - `handler`: the handler to run.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use trellis::chain::handler;
    /// use trellis::router::RouteTable;
    ///
    /// let mut routes = RouteTable::new();
    /// routes.register("PUT", "items/", handler(|_ctx| Ok(())));
    /// routes.register("PATCH", "items", handler(|_ctx| Ok(())));
    ///
    /// assert!(routes.lookup("PUT", "/items").is_ok());
    /// assert_eq!(routes.len(), 1);
    /// ```
    pub fn register(&mut self, method: &str, path: &str, handler: Handler) {
        match RouteMethod::from_keyword(method) {
            Some(m) => self.insert(m, path, handler, "handler".to_owned()),
            None => trace!(method, path, "registration under unknown method ignored"),
        }
    }

    /// Register a `GET` handler at `path`.
    pub fn get<F>(&mut self, path: &str, f: F)
    where
        F: Fn(&mut Context) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert_fn(RouteMethod::Get, path, f);
    }

    /// Register a `POST` handler at `path`.
    pub fn post<F>(&mut self, path: &str, f: F)
    where
        F: Fn(&mut Context) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert_fn(RouteMethod::Post, path, f);
    }

    /// Register a `PUT` handler at `path`.
    pub fn put<F>(&mut self, path: &str, f: F)
    where
        F: Fn(&mut Context) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert_fn(RouteMethod::Put, path, f);
    }

    /// Register a `DELETE` handler at `path`.
    pub fn delete<F>(&mut self, path: &str, f: F)
    where
        F: Fn(&mut Context) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert_fn(RouteMethod::Delete, path, f);
    }

    /// Register a handler for upgrade (websocket) requests at `path`.
    pub fn ws<F>(&mut self, path: &str, f: F)
    where
        F: Fn(&mut Context) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert_fn(RouteMethod::Ws, path, f);
    }

    /// Append a middleware handler. Middleware runs, in order, ahead of
    /// whichever handler the engine selects, including the not-found handler.
    pub fn use_middleware<F>(&mut self, f: F)
    where
        F: Fn(&mut Context) -> HandlerResult + Send + Sync + 'static,
    {
        self.middleware.push(handler(f));
    }

    /// Append an already-erased middleware handler.
    pub fn add_middleware(&mut self, middleware: Handler) {
        self.middleware.push(middleware);
    }

    /// Set the handler that runs when nothing else matches.
    pub fn set_not_found<F>(&mut self, f: F)
    where
        F: Fn(&mut Context) -> HandlerResult + Send + Sync + 'static,
    {
        self.not_found = Some(handler(f));
    }

    pub fn middleware(&self) -> &[Handler] {
        &self.middleware
    }

    pub fn not_found(&self) -> Option<&Handler> {
        self.not_found.as_ref()
    }

    /// Look up the handler registered for `method` at `path`.
    ///
    /// # Errors
    ///
    /// [`RouteError::NotRegistered`] naming the method and normalized path when
    /// there is no exact match (including for unknown method keywords).
    pub fn lookup(&self, method: &str, path: &str) -> Result<Handler, RouteError> {
        let path = normalize_path(path);
        RouteMethod::from_keyword(method)
            .and_then(|m| self.routes.get(&m))
            .and_then(|table| table.get(&path))
            .map(|route| route.handler.clone())
            .ok_or_else(|| RouteError::NotRegistered {
                method: method.to_owned(),
                path,
            })
    }

    /// Number of registered routes across all methods.
    pub fn len(&self) -> usize {
        self.routes.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Choose how names become paths in [`fill_routes`](Self::fill_routes)
    /// and [`prefix_fill_routes`](Self::prefix_fill_routes).
    pub fn set_path_style(&mut self, style: PathStyle) {
        self.path_style = style;
    }

    /// Register every `(name, handler)` pair under `method` at `prefix/<name>`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use trellis::chain::handler;
    /// use trellis::router::RouteTable;
    ///
    /// let mut routes = RouteTable::new();
    /// routes.fill_routes("GET", "user", &[("ShowProfile", handler(|_ctx| Ok(())))]);
    /// assert!(routes.lookup("GET", "/user/show-profile").is_ok());
    /// ```
    pub fn fill_routes(&mut self, method: &str, prefix: &str, pairs: &[(&str, Handler)]) {
        let Some(method) = RouteMethod::from_keyword(method) else {
            trace!(method, prefix, "fill under unknown method ignored");
            return;
        };
        for (name, h) in pairs {
            let path = self.join(prefix, name);
            self.insert(method, &path, h.clone(), format!("{prefix}.{name}"));
        }
    }

    /// Register `(name, handler)` pairs, taking the method from the name.
    ///
    /// `GetUserInfo` registers `GET prefix/user-info`; a name that is just a
    /// keyword (`Get`) registers the prefix itself. Names without a method
    /// prefix are skipped.
    pub fn prefix_fill_routes(&mut self, prefix: &str, pairs: &[(&str, Handler)]) {
        for (name, h) in pairs {
            let Some((method, rest)) = split_method_prefix(name) else {
                trace!(name, "no method prefix, skipped");
                continue;
            };
            let path = self.join(prefix, rest);
            self.insert(method, &path, h.clone(), format!("{prefix}.{name}"));
        }
    }

    /// Registered routes as display lines, `METHOD  /path --> name`, sorted by path.
    pub fn routes(&self) -> Vec<String> {
        let mut entries: Vec<_> = self
            .routes
            .iter()
            .flat_map(|(method, table)| {
                table
                    .iter()
                    .map(move |(path, route)| (path.as_str(), *method, route.name.as_str()))
            })
            .collect();
        entries.sort();
        entries
            .into_iter()
            .map(|(path, method, name)| format!("{:<6}  {:<10} --> {}", method.as_str(), path, name))
            .collect()
    }

    fn join(&self, prefix: &str, name: &str) -> String {
        format!("{}/{}", prefix.trim_matches('/'), self.path_style.segment(name))
    }

    fn insert_fn<F>(&mut self, method: RouteMethod, path: &str, f: F)
    where
        F: Fn(&mut Context) -> HandlerResult + Send + Sync + 'static,
    {
        let name = std::any::type_name::<F>().to_owned();
        self.insert(method, path, handler(f), name);
    }

    fn insert(&mut self, method: RouteMethod, path: &str, handler: Handler, name: String) {
        let path = normalize_path(path);
        trace!(method = method.as_str(), path = %path, "route registered");
        self.routes
            .entry(method)
            .or_default()
            .insert(path, Route { handler, name });
    }
}

fn split_method_prefix(name: &str) -> Option<(RouteMethod, &str)> {
    NAME_PREFIXES.iter().find_map(|(keyword, method)| {
        if name == *keyword {
            Some((*method, ""))
        } else {
            name.strip_prefix(keyword).map(|rest| (*method, rest))
        }
    })
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.routes())
            .field("middleware", &self.middleware.len())
            .field("not_found", &self.not_found.is_some())
            .finish()
    }
}
