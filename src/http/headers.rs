//! Header fields for both directions of an exchange.
//!
//! The same [`Headers`] type carries the fields of an inbound [`Request`] and
//! the pending fields a handler stages on the response writer before commit.
//! Names compare ASCII case-insensitively; entries keep arrival order so that
//! repeated fields such as `Set-Cookie` go out in the order they were added.
//!
//! [`Request`]: super::Request

use std::fmt;

/// Ordered multi-map of header fields.
///
/// ```
/// use trellis::http::Headers;
///
/// let mut pending = Headers::new();
/// pending.insert("Set-Cookie", "session=abc");
/// pending.insert("Set-Cookie", "theme=dark");
/// pending.set("Content-Type", "text/plain");
/// pending.set("content-type", "application/json");
///
/// assert_eq!(pending.get("CONTENT-TYPE"), Some("application/json"));
/// assert_eq!(pending.get_all("set-cookie").count(), 2);
/// assert!(pending.has_token("content-type", "application/json"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Appends a field, keeping any earlier fields with the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Replaces every field named `name` with a single `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.fields.push((name, value.into()));
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).next()
    }

    pub fn get_all<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a str> + use<'a, 'n> {
        self.fields
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `true` if any `name` field lists `token` in its comma-separated value,
    /// e.g. `Connection: keep-alive, Upgrade` has the token `upgrade`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Drops every field named `name`; returns whether one existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.fields.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of fields, counting repeats.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Writes the fields in wire form, one `Name: value\r\n` line each.
impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.iter()
            .try_for_each(|(name, value)| write!(f, "{name}: {value}\r\n"))
    }
}
