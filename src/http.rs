use core::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::{cmp, debug_assert, io};

use futures::Stream;
use hyper::body::HttpBody;

pub use hyper::body::Bytes;
pub use hyper::{HeaderMap, Method, StatusCode};

/// An HTTP request type that wraps hyper's Request with our custom Body type.
pub type Request = hyper::Request<Body>;

/// An HTTP response.
///
/// Handlers never build this directly; the dispatch loop turns the
/// [`ResponseWriter`](crate::ResponseWriter) of a request context into one.
///
/// ```
/// # use weft::{Response, Body};
/// let response = Response::new(Body::new("Hello world!"));
/// ```
pub type Response = hyper::Response<Body>;

/// A builder for constructing HTTP responses with a fluent API.
///
/// ```rust
/// use weft::{ResponseBuilder, Body};
///
/// let response = ResponseBuilder::new()
///     .status(404)
///     .header("X-Custom-Foo", "Bar")
///     .body(Body::new("Page not found."))
///     .unwrap();
/// ```
pub type ResponseBuilder = hyper::http::response::Builder;

/// A streaming HTTP body that can be used for both requests and responses.
///
/// Handlers run on blocking worker threads, so the body can be consumed
/// synchronously: as an [`Iterator`] of chunks, through [`Body::reader`], or
/// all at once with [`Body::read_all`].
///
/// ```rust
/// # use weft::Body;
/// let mut body = Body::new("Hello world!");
/// assert_eq!(&body.read_all().unwrap()[..], b"Hello world!");
/// ```
pub struct Body(pub(crate) hyper::Body);

impl Body {
    /// Create a body from a string or bytes.
    pub fn new(data: impl Into<Bytes>) -> Body {
        Body(hyper::Body::from(data.into()))
    }

    /// Create an empty body.
    pub fn empty() -> Body {
        Body(hyper::Body::empty())
    }

    /// Create a body from an implementor of [`io::Read`].
    ///
    /// The reader is pulled in chunks while the response is being sent, which
    /// is how files are served without loading them into memory.
    pub fn wrap_reader<R>(reader: R) -> Body
    where
        R: io::Read + Send + 'static,
    {
        Body(hyper::Body::wrap_stream(ReaderStream::new(reader)))
    }

    /// Creates a [`BodyReader`] that implements [`std::io::Read`].
    pub fn reader(&mut self) -> BodyReader<'_> {
        BodyReader {
            body: self,
            prev_bytes: Bytes::new(),
        }
    }

    /// Reads every remaining chunk and returns them as one buffer.
    ///
    /// # Errors
    /// Returns the first error raised while polling the underlying stream.
    pub fn read_all(&mut self) -> io::Result<Bytes> {
        let mut buf = Vec::new();
        for chunk in self.by_ref() {
            buf.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(buf))
    }
}

impl<T> From<T> for Body
where
    Bytes: From<T>,
{
    fn from(data: T) -> Body {
        Body::new(data)
    }
}

impl Iterator for Body {
    type Item = io::Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        futures::executor::block_on(self.0.data())
            .map(|res| res.map_err(|err| io::Error::new(io::ErrorKind::Other, err)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        Stream::size_hint(&self.0)
    }
}

/// A synchronous reader interface for [`Body`].
///
/// It keeps the unread tail of the last chunk so reads of any size work.
pub struct BodyReader<'b> {
    body: &'b mut Body,
    prev_bytes: Bytes,
}

impl<'b> std::io::Read for BodyReader<'b> {
    fn read(&mut self, mut buf: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        loop {
            if buf.is_empty() {
                return Ok(written);
            }

            if !self.prev_bytes.is_empty() {
                let chunk_size = cmp::min(buf.len(), self.prev_bytes.len());
                let prev_bytes_start = self.prev_bytes.split_to(chunk_size);
                buf[..chunk_size].copy_from_slice(&prev_bytes_start[..]);
                buf = &mut buf[chunk_size..];
                written += chunk_size;
                continue;
            }

            if written != 0 {
                return Ok(written);
            }

            debug_assert!(self.prev_bytes.is_empty());
            debug_assert!(written == 0);

            self.prev_bytes = if let Some(next) = self.body.next() {
                next?
            } else {
                return Ok(written);
            }
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_data(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        Pin::new(&mut self.0).poll_data(cx)
    }

    fn poll_trailers(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<hyper::HeaderMap>, Self::Error>> {
        Pin::new(&mut self.0).poll_trailers(cx)
    }
}

/// A stream adapter that converts a [`std::io::Read`] into a [`Stream`].
///
/// Used by [`Body::wrap_reader`]; reads data in chunks of [`CAP`] bytes.
struct ReaderStream<R> {
    reader: Option<R>,
    buf: Vec<u8>,
}

/// Default capacity for reader buffer chunks.
const CAP: usize = 4096;

impl<R> ReaderStream<R> {
    fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
            buf: vec![0; CAP],
        }
    }
}

impl<R> Unpin for ReaderStream<R> {}

impl<R> Stream for ReaderStream<R>
where
    R: io::Read,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let ReaderStream { reader, buf } = &mut *self;

        let reader = match reader {
            Some(reader) => reader,
            None => return Poll::Ready(None),
        };

        if buf.capacity() == 0 {
            buf.extend_from_slice(&[0; CAP]);
        }

        match reader.read(buf) {
            Err(err) => {
                self.reader.take();
                Poll::Ready(Some(Err(err)))
            }
            Ok(0) => {
                self.reader.take();
                Poll::Ready(None)
            }
            Ok(n) => {
                let remaining = buf.split_off(n);
                let chunk = std::mem::replace(buf, remaining);
                Poll::Ready(Some(Ok(Bytes::from(chunk))))
            }
        }
    }
}

/// A cancellation flag carried in the request extensions.
///
/// The engine raises it when the client goes away before the handler has
/// finished; long-running handlers can poll
/// [`Context::is_cancelled`](crate::Context::is_cancelled).
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns a guard that cancels the flag when dropped.
    pub(crate) fn on_drop(&self) -> CancelOnDrop {
        CancelOnDrop(self.clone())
    }
}

/// Raises a [`Cancellation`] when dropped.
pub(crate) struct CancelOnDrop(Cancellation);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}
