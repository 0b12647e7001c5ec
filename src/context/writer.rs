//! Response-writing state: pending status, pending headers, one-shot commit and
//! byte accounting in front of the [`Response`] sink.

use std::io::{self, Write};

use flate2::Compression;
use flate2::write::{DeflateEncoder, GzEncoder};
use tracing::debug;

use crate::http::{Headers, Response, StatusCode};

/// Content codings the writer can apply to the body stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Gzip,
    Deflate,
}

impl Encoding {
    /// Picks a coding from an `Accept-Encoding` value. gzip wins over deflate;
    /// codings listed with `q=0` are refused.
    pub fn negotiate(accept_encoding: &str) -> Option<Self> {
        let mut deflate = false;
        for item in accept_encoding.split(',') {
            let mut parts = item.split(';');
            let coding = parts.next().unwrap_or("").trim();
            let refused = parts.any(|p| {
                p.trim()
                    .strip_prefix("q=")
                    .and_then(|q| q.trim().parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            });
            if refused {
                continue;
            }
            if coding.eq_ignore_ascii_case("gzip") {
                return Some(Self::Gzip);
            }
            deflate |= coding.eq_ignore_ascii_case("deflate");
        }
        deflate.then_some(Self::Deflate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }
}

enum Stream {
    Identity(Response),
    Gzip(GzEncoder<Response>),
    Deflate(DeflateEncoder<Response>),
}

impl Stream {
    fn sink_mut(&mut self) -> &mut Response {
        match self {
            Self::Identity(sink) => sink,
            Self::Gzip(enc) => enc.get_mut(),
            Self::Deflate(enc) => enc.get_mut(),
        }
    }

    fn wrap(self, encoding: Encoding) -> Self {
        match (self, encoding) {
            (Self::Identity(sink), Encoding::Gzip) => {
                Self::Gzip(GzEncoder::new(sink, Compression::default()))
            }
            (Self::Identity(sink), Encoding::Deflate) => {
                Self::Deflate(DeflateEncoder::new(sink, Compression::default()))
            }
            (wrapped, _) => wrapped,
        }
    }

    fn finish(self) -> io::Result<Response> {
        match self {
            Self::Identity(sink) => Ok(sink),
            Self::Gzip(enc) => enc.finish(),
            Self::Deflate(enc) => enc.finish(),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Self::Identity(sink) => sink.write(data),
            Self::Gzip(enc) => enc.write(data),
            Self::Deflate(enc) => enc.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Identity(sink) => sink.flush(),
            Self::Gzip(enc) => enc.flush(),
            Self::Deflate(enc) => enc.flush(),
        }
    }
}

/// Tracks what has been written for one response.
///
/// The status line and headers are committed exactly once: lazily on the first
/// body write, or explicitly through [`commit_now`](Self::commit_now). Until then
/// status and headers are pending and freely overwritten; afterwards changes to
/// either are ignored.
///
/// # Examples
///
/// ```
/// use trellis::context::ResponseWriter;
/// use trellis::http::StatusCode;
///
/// let mut w = ResponseWriter::new();
/// w.set_status(StatusCode::MOVED_PERMANENTLY);
/// w.write(b"hello").unwrap();
/// w.set_status(StatusCode::NOT_FOUND);
///
/// assert_eq!(w.status(), Some(StatusCode::MOVED_PERMANENTLY));
/// assert_eq!(w.byte_count(), 5);
/// ```
pub struct ResponseWriter {
    stream: Stream,
    headers: Headers,
    status: Option<StatusCode>,
    encoding: Option<Encoding>,
    size: usize,
    committed: bool,
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseWriter {
    /// Creates a writer in front of an empty [`Response`] with no status set.
    pub fn new() -> Self {
        Self {
            stream: Stream::Identity(Response::default()),
            headers: Headers::new(),
            status: None,
            encoding: None,
            size: 0,
            committed: false,
        }
    }

    /// Records `status` as the pending status. Ignored once committed.
    pub fn set_status(&mut self, status: StatusCode) {
        if self.committed {
            debug!(status = status.as_u16(), "status change after commit ignored");
            return;
        }
        if self.status != Some(status) {
            self.status = Some(status);
        }
    }

    /// The pending or committed status; `None` while unset.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// The status that is (or would be) committed: the pending one, or 200.
    pub fn effective_status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    /// Body bytes accepted so far, before any compression.
    pub fn byte_count(&self) -> usize {
        self.size
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// The pending (or committed) response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Replaces a response header. Returns `false` if the response is already committed.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        if self.committed {
            debug!("header change after commit ignored");
            return false;
        }
        self.headers.set(name, value);
        true
    }

    /// Appends a response header. Returns `false` if the response is already committed.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        if self.committed {
            debug!("header change after commit ignored");
            return false;
        }
        self.headers.insert(name, value);
        true
    }

    /// The coding the body will be (or is being) compressed with.
    pub fn encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    /// Compresses the body with `encoding` and announces it in `Content-Encoding`.
    ///
    /// Must be decided before the first write; returns `false` and changes
    /// nothing once the response is committed.
    pub fn enable_compression(&mut self, encoding: Encoding) -> bool {
        if self.committed {
            debug!(encoding = encoding.as_str(), "compression requested after commit");
            return false;
        }
        self.encoding = Some(encoding);
        self.headers.set("Content-Encoding", encoding.as_str());
        self.headers.set("Vary", "Accept-Encoding");
        true
    }

    /// Reverts [`enable_compression`](Self::enable_compression). Returns `false` once committed.
    pub fn disable_compression(&mut self) -> bool {
        if self.committed {
            return false;
        }
        if self.encoding.take().is_some() {
            self.headers.remove("content-encoding");
            self.headers.remove("vary");
        }
        true
    }

    /// Commits the status line and headers without writing body bytes.
    pub fn commit_now(&mut self) {
        self.commit();
    }

    /// Writes body bytes, committing first if needed.
    ///
    /// # Errors
    ///
    /// Any I/O failure from the sink or the compression stream.
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.commit();
        self.stream.write_all(data)?;
        self.size += data.len();
        Ok(data.len())
    }

    /// Writes the UTF-8 bytes of `s`.
    ///
    /// # Errors
    ///
    /// As [`write`](Self::write).
    pub fn write_str(&mut self, s: &str) -> io::Result<usize> {
        self.write(s.as_bytes())
    }

    /// Commits if nothing was committed yet, closes the compression stream and
    /// hands back the sink.
    ///
    /// # Errors
    ///
    /// Any I/O failure while flushing the compression stream.
    pub fn finish(mut self) -> io::Result<Response> {
        self.commit();
        self.stream.finish()
    }

    fn commit(&mut self) {
        if self.committed {
            return;
        }
        self.committed = true;
        let status = self.effective_status();
        self.status = Some(status);
        if let Some(encoding) = self.encoding {
            let stream = std::mem::replace(&mut self.stream, Stream::Identity(Response::default()));
            self.stream = stream.wrap(encoding);
        }
        self.stream.sink_mut().commit(status, &self.headers);
    }
}

impl Write for ResponseWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        ResponseWriter::write(self, data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::{DeflateDecoder, GzDecoder};

    use super::*;

    #[test]
    fn status_is_unset_until_set_or_written() {
        let mut w = ResponseWriter::new();
        assert_eq!(w.status(), None);
        assert_eq!(w.effective_status(), StatusCode::OK);
        w.write_str("x").unwrap();
        assert_eq!(w.status(), Some(StatusCode::OK));
    }

    #[test]
    fn pending_status_is_overwritten_before_commit() {
        let mut w = ResponseWriter::new();
        w.set_status(StatusCode::CREATED);
        w.set_status(StatusCode::ACCEPTED);
        assert!(!w.is_committed());
        let sink = w.finish().unwrap();
        assert_eq!(sink.status(), StatusCode::ACCEPTED);
    }

    #[test]
    fn status_after_commit_is_ignored() {
        let mut w = ResponseWriter::new();
        w.set_status(StatusCode::MOVED_PERMANENTLY);
        w.write(b"data").unwrap();
        w.set_status(StatusCode::NOT_FOUND);
        assert_eq!(w.status(), Some(StatusCode::MOVED_PERMANENTLY));
        let sink = w.finish().unwrap();
        assert_eq!(sink.status(), StatusCode::MOVED_PERMANENTLY);
    }

    #[test]
    fn byte_count_accumulates() {
        let mut w = ResponseWriter::new();
        assert_eq!(w.write(b"hello").unwrap(), 5);
        assert_eq!(w.write(b"goodbye").unwrap(), 7);
        assert_eq!(w.byte_count(), 12);
        assert_eq!(w.finish().unwrap().body_bytes(), b"hellogoodbye");
    }

    #[test]
    fn headers_freeze_at_commit() {
        let mut w = ResponseWriter::new();
        assert!(w.set_header("Location", "/next"));
        w.set_status(StatusCode::FOUND);
        w.commit_now();
        assert!(!w.set_header("X-Late", "1"));
        assert!(!w.add_header("X-Late", "1"));
        let sink = w.finish().unwrap();
        assert_eq!(sink.status(), StatusCode::FOUND);
        assert_eq!(sink.headers().get("location"), Some("/next"));
        assert!(!sink.headers().contains("x-late"));
        assert!(sink.body_bytes().is_empty());
    }

    #[test]
    fn gzip_stream() {
        let mut w = ResponseWriter::new();
        assert!(w.enable_compression(Encoding::Gzip));
        w.write_str("hello hello hello hello").unwrap();
        assert_eq!(w.byte_count(), 23);
        assert!(!w.enable_compression(Encoding::Deflate));
        let sink = w.finish().unwrap();
        assert_eq!(sink.headers().get("content-encoding"), Some("gzip"));
        let mut plain = String::new();
        GzDecoder::new(sink.body_bytes()).read_to_string(&mut plain).unwrap();
        assert_eq!(plain, "hello hello hello hello");
    }

    #[test]
    fn deflate_stream() {
        let mut w = ResponseWriter::new();
        w.enable_compression(Encoding::Deflate);
        w.write_str("abc").unwrap();
        let sink = w.finish().unwrap();
        let mut plain = String::new();
        DeflateDecoder::new(sink.body_bytes()).read_to_string(&mut plain).unwrap();
        assert_eq!(plain, "abc");
    }

    #[test]
    fn compression_can_be_withdrawn_before_commit() {
        let mut w = ResponseWriter::new();
        w.enable_compression(Encoding::Gzip);
        assert!(w.disable_compression());
        assert_eq!(w.encoding(), None);
        w.write_str("raw").unwrap();
        let sink = w.finish().unwrap();
        assert!(!sink.headers().contains("content-encoding"));
        assert_eq!(sink.body_bytes(), b"raw");
    }

    #[test]
    fn negotiate() {
        assert_eq!(Encoding::negotiate("gzip, deflate, br"), Some(Encoding::Gzip));
        assert_eq!(Encoding::negotiate("deflate, GZIP"), Some(Encoding::Gzip));
        assert_eq!(Encoding::negotiate("br, deflate"), Some(Encoding::Deflate));
        assert_eq!(Encoding::negotiate("gzip;q=0, deflate"), Some(Encoding::Deflate));
        assert_eq!(Encoding::negotiate("identity"), None);
        assert_eq!(Encoding::negotiate(""), None);
    }
}
