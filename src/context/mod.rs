//! Per-request context binding the request, its response writer and its handler
//! chain together for the lifetime of one dispatch.
//!
//! A [`Context`] is created once when a request enters the engine and closed
//! once when dispatch ends. Form decoding happens at construction; anything
//! that fails there is recorded as a [`ParseError`] and dispatch carries on.

use std::fmt;
use std::io;

use thiserror::Error;
use url::form_urlencoded;

use crate::chain::HandlerChain;
use crate::config::EngineConfig;
use crate::error::{Error, HandlerResult};
use crate::http::{Headers, Method, Request, Response, StatusCode};

mod writer;

pub use writer::{Encoding, ResponseWriter};

/// Non-fatal failures met while building a context.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("form body of {size} bytes exceeds the {limit} byte limit")]
    FormTooLarge { size: usize, limit: usize },

    #[error("form body is not valid UTF-8: {0}")]
    FormEncoding(#[from] std::str::Utf8Error),
}

/// A `Set-Cookie` value.
///
/// ```
/// use trellis::context::Cookie;
///
/// let c = Cookie::new("session", "abc").path("/").http_only(true);
/// assert_eq!(c.to_string(), "session=abc; Path=/; HttpOnly");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    path: Option<String>,
    domain: Option<String>,
    max_age: Option<i64>,
    http_only: bool,
    secure: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            path: None,
            domain: None,
            max_age: None,
            http_only: false,
            secure: false,
        }
    }

    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    #[must_use]
    pub fn max_age(mut self, seconds: i64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    #[must_use]
    pub fn http_only(mut self, on: bool) -> Self {
        self.http_only = on;
        self
    }

    #[must_use]
    pub fn secure(mut self, on: bool) -> Self {
        self.secure = on;
        self
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(path) = &self.path {
            write!(f, "; Path={path}")?;
        }
        if let Some(domain) = &self.domain {
            write!(f, "; Domain={domain}")?;
        }
        if let Some(age) = self.max_age {
            write!(f, "; Max-Age={age}")?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        Ok(())
    }
}

/// Per-request context handed to every handler.
pub struct Context {
    request: Request,
    writer: ResponseWriter,
    chain: HandlerChain,
    query: Vec<(String, String)>,
    post: Vec<(String, String)>,
    errors: Vec<ParseError>,
}

impl Context {
    /// Builds the context for `request`.
    ///
    /// Decodes query parameters and urlencoded form bodies, and switches the
    /// writer to a compressed stream when `config.compression` is on and the
    /// client accepts it.
    pub fn new(request: Request, config: &EngineConfig) -> Self {
        let mut writer = ResponseWriter::new();
        if config.compression {
            if let Some(encoding) = request
                .headers()
                .get("accept-encoding")
                .and_then(Encoding::negotiate)
            {
                writer.enable_compression(encoding);
            }
        }

        let query = request
            .query_string()
            .map(|q| form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        let mut ctx = Self {
            request,
            writer,
            chain: HandlerChain::new(),
            query,
            post: Vec::new(),
            errors: Vec::new(),
        };
        if let Err(e) = ctx.parse_form(config.max_form_size) {
            ctx.errors.push(e);
        }
        ctx
    }

    fn parse_form(&mut self, limit: usize) -> Result<(), ParseError> {
        let is_form = self
            .request
            .headers()
            .get("content-type")
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|mime| {
                mime.trim()
                    .eq_ignore_ascii_case("application/x-www-form-urlencoded")
            });
        if !is_form {
            return Ok(());
        }
        let body = self.request.body();
        if body.len() > limit {
            return Err(ParseError::FormTooLarge {
                size: body.len(),
                limit,
            });
        }
        let text = std::str::from_utf8(body)?;
        self.post = form_urlencoded::parse(text.as_bytes()).into_owned().collect();
        Ok(())
    }

    // ── Request side ─────────────────────────────────────────────────────────

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub(crate) fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn path(&self) -> &str {
        self.request.path()
    }

    /// Path plus query string, as the client sent it.
    pub fn url(&self) -> String {
        match self.request.query_string() {
            Some(q) if !q.is_empty() => format!("{}?{q}", self.request.path()),
            _ => self.request.path().to_owned(),
        }
    }

    pub fn query_string(&self) -> Option<&str> {
        self.request.query_string()
    }

    /// First decoded value for `key` in the query string.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        lookup(&self.query, key)
    }

    /// First decoded value for `key` in an urlencoded form body.
    pub fn post_param(&self, key: &str) -> Option<&str> {
        lookup(&self.post, key)
    }

    /// Every value for `key`, form body values first, then query values.
    pub fn form_values(&self, key: &str) -> Vec<&str> {
        self.post
            .iter()
            .chain(self.query.iter())
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// First value for `key`, preferring the form body over the query string.
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.post_param(key).or_else(|| self.query_param(key))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.headers().get(name)
    }

    pub fn headers(&self) -> &Headers {
        self.request.headers()
    }

    pub fn host(&self) -> Option<&str> {
        self.request.host()
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.request.user_agent()
    }

    /// Best guess at the client address.
    ///
    /// Checks the first `X-Forwarded-For` hop, then `X-Real-Ip`, then
    /// `X-Appengine-Remote-Addr`, and finally the peer address of the connection.
    pub fn client_ip(&self) -> Option<String> {
        let forwarded = self
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return Some(ip.to_owned());
        }
        let real = self.header("x-real-ip").map(str::trim).filter(|v| !v.is_empty());
        if let Some(ip) = real {
            return Some(ip.to_owned());
        }
        if let Some(addr) = self.header("x-appengine-remote-addr").filter(|v| !v.is_empty()) {
            return Some(addr.to_owned());
        }
        self.request.peer_addr().map(|addr| addr.ip().to_string())
    }

    /// Value of the request cookie named `name`.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.request
            .headers()
            .get_all("cookie")
            .flat_map(|line| line.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.trim_matches('"'))
    }

    pub fn raw_body(&self) -> &[u8] {
        self.request.body()
    }

    /// Decodes the request body as JSON.
    ///
    /// # Errors
    ///
    /// Any [`serde_json::Error`] from decoding.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }

    /// Failures recorded while the context was built.
    pub fn errors(&self) -> &[ParseError] {
        &self.errors
    }

    // ── Response side ────────────────────────────────────────────────────────

    pub fn writer(&self) -> &ResponseWriter {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut ResponseWriter {
        &mut self.writer
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.writer.set_status(status);
    }

    /// Pending or committed status; `None` while unset.
    pub fn status(&self) -> Option<StatusCode> {
        self.writer.status()
    }

    pub fn byte_count(&self) -> usize {
        self.writer.byte_count()
    }

    /// Replaces a response header. Ignored after commit.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.writer.set_header(name, value);
    }

    /// Adds a `Set-Cookie` response header. Ignored after commit.
    pub fn set_cookie(&mut self, cookie: &Cookie) {
        self.writer.add_header("Set-Cookie", cookie.to_string());
    }

    /// Writes body bytes, committing the status line first if needed.
    ///
    /// # Errors
    ///
    /// Any I/O failure from the response stream.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.writer.write(data)
    }

    /// Writes a string body fragment.
    ///
    /// # Errors
    ///
    /// Any I/O failure from the response stream.
    pub fn write_str(&mut self, s: &str) -> io::Result<usize> {
        self.writer.write_str(s)
    }

    /// Commits status and headers with no body.
    pub fn commit_now(&mut self) {
        self.writer.commit_now();
    }

    /// Ends the response with a `302 Found` to `url`.
    pub fn redirect(&mut self, url: &str) {
        self.writer.set_status(StatusCode::FOUND);
        self.writer.set_header("Location", url);
        self.writer.commit_now();
    }

    // ── Chain control ────────────────────────────────────────────────────────

    pub fn chain(&self) -> &HandlerChain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut HandlerChain {
        &mut self.chain
    }

    /// Runs the remaining handlers in order.
    ///
    /// - On an aborted chain this does nothing and succeeds.
    /// - A handler error halts the chain and is returned unchanged.
    /// - Calling this on a chain that has nothing left to run aborts it and
    ///   returns [`Error::ChainEnd`]; the end of the chain reached while
    ///   running handlers is reported as success.
    ///
    /// # Errors
    ///
    /// The first error a handler returns, or [`Error::ChainEnd`] as above.
    pub fn next(&mut self) -> HandlerResult {
        if self.chain.is_aborted() {
            return Ok(());
        }
        let Some(handler) = self.chain.advance() else {
            self.chain.abort();
            return Err(Error::ChainEnd);
        };
        handler(self)?;
        match self.next() {
            Err(Error::ChainEnd) => Ok(()),
            other => other,
        }
    }

    /// Stops later handlers from running. Not an error.
    pub fn abort(&mut self) {
        self.chain.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.chain.is_aborted()
    }

    /// Finalizes the response: commits if nothing was written, closes any
    /// compression stream and returns the sink.
    ///
    /// # Errors
    ///
    /// Any I/O failure while flushing the compression stream.
    pub fn close(self) -> io::Result<Response> {
        self.writer.finish()
    }
}

fn lookup<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;
    use serde::Deserialize;

    use super::*;

    fn make_context(raw: &[u8], config: &EngineConfig) -> Context {
        let (req, _) = Request::parse(raw).unwrap();
        Context::new(req, config)
    }

    #[test]
    fn request_accessors() {
        let raw = b"GET /test?id=1&name=a+b HTTP/1.1\r\nHost: localhost\r\nUser-Agent: trellis-test/1.0\r\n\r\n";
        let ctx = make_context(raw, &EngineConfig::default());
        assert_eq!(ctx.method(), &Method::Get);
        assert_eq!(ctx.path(), "/test");
        assert_eq!(ctx.url(), "/test?id=1&name=a+b");
        assert_eq!(ctx.query_param("id"), Some("1"));
        assert_eq!(ctx.query_param("name"), Some("a b"));
        assert_eq!(ctx.host(), Some("localhost"));
        assert_eq!(ctx.user_agent(), Some("trellis-test/1.0"));
        assert!(ctx.errors().is_empty());
    }

    #[test]
    fn urlencoded_form_body() {
        let raw = b"POST /test?id=1 HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded; charset=utf-8\r\nContent-Length: 29\r\n\r\nkey1=string1&key1=string2&t=1";
        let ctx = make_context(raw, &EngineConfig::default());
        assert_eq!(ctx.post_param("key1"), Some("string1"));
        assert_eq!(ctx.form_values("key1"), vec!["string1", "string2"]);
        assert_eq!(ctx.form_value("t"), Some("1"));
        assert_eq!(ctx.form_value("id"), Some("1"));
        assert_eq!(ctx.post_param("id"), None);
    }

    #[test]
    fn oversized_form_is_recorded_not_fatal() {
        let raw = b"POST / HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 11\r\n\r\na=123456789";
        let config = EngineConfig::default().max_form_size(4);
        let ctx = make_context(raw, &config);
        assert_eq!(ctx.errors().len(), 1);
        assert!(matches!(
            ctx.errors()[0],
            ParseError::FormTooLarge { size: 11, limit: 4 }
        ));
        assert_eq!(ctx.post_param("a"), None);
    }

    #[test]
    fn non_utf8_form_is_recorded() {
        let raw = b"POST / HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 3\r\n\r\na=\xff";
        let ctx = make_context(raw, &EngineConfig::default());
        assert!(matches!(ctx.errors(), [ParseError::FormEncoding(_)]));
    }

    #[test]
    fn client_ip_precedence() {
        let raw = b"GET / HTTP/1.1\r\nX-Forwarded-For: 1.1.1.1, 2.2.2.2\r\nX-Real-Ip: 3.3.3.3\r\n\r\n";
        assert_eq!(
            make_context(raw, &EngineConfig::default()).client_ip().as_deref(),
            Some("1.1.1.1")
        );

        let raw = b"GET / HTTP/1.1\r\nX-Real-Ip:  3.3.3.3 \r\n\r\n";
        assert_eq!(
            make_context(raw, &EngineConfig::default()).client_ip().as_deref(),
            Some("3.3.3.3")
        );

        let (req, _) = Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let req = req.with_peer_addr("127.0.0.1:9000".parse().unwrap());
        let ctx = Context::new(req, &EngineConfig::default());
        assert_eq!(ctx.client_ip().as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn cookies_in_and_out() {
        let raw = b"GET / HTTP/1.1\r\nCookie: testing=\"hello world\"; theme=dark\r\n\r\n";
        let mut ctx = make_context(raw, &EngineConfig::default());
        assert_eq!(ctx.cookie("testing"), Some("hello world"));
        assert_eq!(ctx.cookie("theme"), Some("dark"));
        assert_eq!(ctx.cookie("missing"), None);

        ctx.set_cookie(&Cookie::new("a", "1").max_age(60).secure(true));
        ctx.set_cookie(&Cookie::new("b", "2").domain("localhost"));
        let resp = ctx.close().unwrap();
        let set: Vec<_> = resp.headers().get_all("set-cookie").collect();
        assert_eq!(set, vec!["a=1; Max-Age=60; Secure", "b=2; Domain=localhost"]);
    }

    #[test]
    fn redirect_commits_without_body() {
        let mut ctx = make_context(b"GET /old HTTP/1.1\r\n\r\n", &EngineConfig::default());
        ctx.redirect("/new");
        ctx.set_status(StatusCode::OK);
        let resp = ctx.close().unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers().get("location"), Some("/new"));
        assert!(resp.body_bytes().is_empty());
    }

    #[test]
    fn json_body() {
        #[derive(Deserialize)]
        struct Pet {
            name: String,
        }
        let raw = b"POST /pets HTTP/1.1\r\nContent-Length: 16\r\n\r\n{\"name\":\"Fido\"}\n";
        let ctx = make_context(raw, &EngineConfig::default());
        let pet: Pet = ctx.json().unwrap();
        assert_eq!(pet.name, "Fido");
        assert_eq!(ctx.raw_body().len(), 16);
    }

    #[test]
    fn compression_follows_config_and_accept_encoding() {
        let raw = b"GET / HTTP/1.1\r\nAccept-Encoding: gzip, deflate\r\n\r\n";

        let ctx = make_context(raw, &EngineConfig::default());
        assert_eq!(ctx.writer().encoding(), None);

        let mut ctx = make_context(raw, &EngineConfig::default().compression(true));
        assert_eq!(ctx.writer().encoding(), Some(Encoding::Gzip));
        ctx.write_str("compressed").unwrap();
        assert_eq!(ctx.byte_count(), 10);
        let resp = ctx.close().unwrap();
        assert_eq!(resp.headers().get("content-encoding"), Some("gzip"));
        let mut out = String::new();
        GzDecoder::new(resp.body_bytes()).read_to_string(&mut out).unwrap();
        assert_eq!(out, "compressed");
    }

    #[test]
    fn close_commits_untouched_response() {
        let mut ctx = make_context(b"GET / HTTP/1.1\r\n\r\n", &EngineConfig::default());
        ctx.set_header("X-Only", "headers");
        assert_eq!(ctx.status(), None);
        let resp = ctx.close().unwrap();
        assert!(resp.is_committed());
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("x-only"), Some("headers"));
    }
}
