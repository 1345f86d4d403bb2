use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use http::header::CONTENT_LENGTH;
use http::{HeaderMap, HeaderValue, Method, Request, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame, Incoming};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::content_encoding::ContentDecoder;
use crate::error::{BoxError, Error};

pub(crate) type ReqBody = UnsyncBoxBody<Bytes, BoxError>;

/// A caller-supplied body stream. It is sent at most once.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    Stream {
        stream: ByteStream,
        /// Forwarded as `content-length` when known, otherwise the body is chunked.
        length: Option<u64>,
    },
}

impl RequestBody {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Bytes(bytes) => bytes.is_empty(),
            Self::Stream { .. } => false,
        }
    }

    pub fn is_replayable(&self) -> bool {
        !matches!(self, Self::Stream { .. })
    }

    pub fn content_length(&self) -> Option<u64> {
        match self {
            Self::Empty => None,
            Self::Bytes(bytes) => Some(bytes.len() as u64),
            Self::Stream { length, .. } => *length,
        }
    }

    /// Copies a finite body. Streams cannot be copied and yield `None`.
    pub(crate) fn try_clone(&self) -> Option<Self> {
        match self {
            Self::Empty => Some(Self::Empty),
            Self::Bytes(bytes) => Some(Self::Bytes(bytes.clone())),
            Self::Stream { .. } => None,
        }
    }

    fn into_req_body(self) -> ReqBody {
        match self {
            Self::Empty => Empty::<Bytes>::new()
                .map_err(map_infallible_to_box_error)
                .boxed_unsync(),
            Self::Bytes(bytes) => Full::new(bytes)
                .map_err(map_infallible_to_box_error)
                .boxed_unsync(),
            Self::Stream { stream, .. } => {
                StreamBody::new(stream.map(|item| item.map(Frame::data))).boxed_unsync()
            }
        }
    }
}

fn map_infallible_to_box_error(never: Infallible) -> BoxError {
    match never {}
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::Empty
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => formatter.write_str("Empty"),
            Self::Bytes(bytes) => formatter
                .debug_struct("Bytes")
                .field("len", &bytes.len())
                .finish(),
            Self::Stream { length, .. } => formatter
                .debug_struct("Stream")
                .field("length", length)
                .finish_non_exhaustive(),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl From<String> for RequestBody {
    fn from(text: String) -> Self {
        Self::Bytes(Bytes::from(text))
    }
}

impl From<&'static str> for RequestBody {
    fn from(text: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(text.as_bytes()))
    }
}

/// Builds the wire request for one hop, setting `content-length` for bodies of known size.
pub(crate) fn build_http_request(
    method: Method,
    uri: Uri,
    headers: &HeaderMap,
    body: RequestBody,
) -> Result<Request<ReqBody>, Error> {
    let mut request_builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        if name == CONTENT_LENGTH {
            continue;
        }
        request_builder = request_builder.header(name, value);
    }
    if let Some(length) = body.content_length() {
        request_builder = request_builder.header(CONTENT_LENGTH, HeaderValue::from(length));
    }
    request_builder
        .body(body.into_req_body())
        .map_err(|source| Error::RequestBuild { source })
}

/// How a buffered body is surfaced on the response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseEncoding {
    /// Lossy UTF-8 text, parsed as JSON when the server says it is JSON.
    #[default]
    Text,
    /// The decoded bytes, untouched.
    Raw,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Decoded bytes delivered so far.
    pub loaded: u64,
    /// The response `content-length`, when the server sent one.
    pub total: Option<u64>,
    /// Size of the chunk that triggered this report.
    pub bytes: usize,
}

impl DownloadProgress {
    pub fn fraction(&self) -> Option<f64> {
        self.total
            .filter(|total| *total > 0)
            .map(|total| self.loaded as f64 / total as f64)
    }
}

pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// A live, decompressed response body.
pub struct BodyStream {
    body: Incoming,
    decoder: Option<ContentDecoder>,
    progress: Option<ProgressCallback>,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
    loaded: u64,
    total: Option<u64>,
    method: Method,
    uri: String,
    finished: bool,
}

impl BodyStream {
    pub(crate) fn new(
        body: Incoming,
        decoder: Option<ContentDecoder>,
        total: Option<u64>,
        method: Method,
        uri: String,
    ) -> Self {
        Self {
            body,
            decoder,
            progress: None,
            cancelled: None,
            loaded: 0,
            total,
            method,
            uri,
            finished: false,
        }
    }

    pub(crate) fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    pub(crate) fn with_cancellation(mut self, token: Option<&CancellationToken>) -> Self {
        self.cancelled = token.map(|token| Box::pin(token.clone().cancelled_owned()));
        self
    }

    pub fn content_length(&self) -> Option<u64> {
        self.total
    }

    /// Collects the remaining body, failing once more than `limit` decoded bytes arrive.
    pub async fn bytes(mut self, limit: Option<usize>) -> Result<Bytes, Error> {
        let mut collected = BytesMut::new();
        while let Some(chunk) = self.next().await {
            let chunk = chunk?;
            if let Some(limit) = limit
                && collected.len().saturating_add(chunk.len()) > limit
            {
                return Err(Error::ResponseTooLarge {
                    limit_bytes: limit,
                    method: self.method.clone(),
                    uri: self.uri.clone(),
                });
            }
            collected.extend_from_slice(&chunk);
        }
        Ok(collected.freeze())
    }

    /// Writes the remaining body into `writer` and returns the number of bytes written.
    pub async fn drain_to<W>(mut self, writer: &mut W) -> Result<u64, Error>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut written = 0_u64;
        while let Some(chunk) = self.next().await {
            let chunk = chunk?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|source| Error::Sink { source })?;
            written = written.saturating_add(chunk.len() as u64);
        }
        writer
            .flush()
            .await
            .map_err(|source| Error::Sink { source })?;
        Ok(written)
    }

    fn read_error(&self, source: BoxError) -> Error {
        Error::ReadBody {
            method: self.method.clone(),
            uri: self.uri.clone(),
            source,
        }
    }

    fn decode_error(&self, encoding: String, message: String) -> Error {
        Error::DecodeContentEncoding {
            encoding,
            method: self.method.clone(),
            uri: self.uri.clone(),
            message,
        }
    }

    fn deliver(&mut self, chunk: Bytes) -> Bytes {
        self.loaded = self.loaded.saturating_add(chunk.len() as u64);
        if let Some(progress) = &self.progress {
            progress(DownloadProgress {
                loaded: self.loaded,
                total: self.total,
                bytes: chunk.len(),
            });
        }
        chunk
    }
}

impl fmt::Debug for BodyStream {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("BodyStream")
            .field("loaded", &self.loaded)
            .field("total", &self.total)
            .field("decoding", &self.decoder.is_some())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Stream for BodyStream {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if let Some(cancelled) = this.cancelled.as_mut()
            && cancelled.as_mut().poll(cx).is_ready()
        {
            this.finished = true;
            return Poll::Ready(Some(Err(Error::Cancelled {
                method: this.method.clone(),
                uri: this.uri.clone(),
            })));
        }

        loop {
            match Pin::new(&mut this.body).poll_frame(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.finished = true;
                    let Some(decoder) = this.decoder.as_mut() else {
                        return Poll::Ready(None);
                    };
                    return match decoder.finish() {
                        Ok(tail) if tail.is_empty() => Poll::Ready(None),
                        Ok(tail) => Poll::Ready(Some(Ok(this.deliver(tail)))),
                        Err(error) => Poll::Ready(Some(Err(
                            this.decode_error(error.encoding, error.message)
                        ))),
                    };
                }
                Poll::Ready(Some(Err(error))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(this.read_error(Box::new(error)))));
                }
                Poll::Ready(Some(Ok(frame))) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    let chunk = match this.decoder.as_mut() {
                        Some(decoder) => match decoder.decode(&data) {
                            Ok(decoded) => decoded,
                            Err(error) => {
                                this.finished = true;
                                return Poll::Ready(Some(Err(
                                    this.decode_error(error.encoding, error.message)
                                )));
                            }
                        },
                        None => data,
                    };
                    if chunk.is_empty() {
                        continue;
                    }
                    return Poll::Ready(Some(Ok(this.deliver(chunk))));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finite_bodies_are_replayable_and_sized() {
        let body = RequestBody::from("hello");
        assert!(body.is_replayable());
        assert_eq!(body.content_length(), Some(5));
        assert!(body.try_clone().is_some());
        assert_eq!(RequestBody::Empty.content_length(), None);
    }

    #[test]
    fn stream_bodies_are_sent_once() {
        let stream: ByteStream = Box::pin(futures_util::stream::iter(vec![Ok(
            Bytes::from_static(b"chunk"),
        )]));
        let body = RequestBody::Stream {
            stream,
            length: Some(5),
        };
        assert!(!body.is_replayable());
        assert!(body.try_clone().is_none());
        assert_eq!(body.content_length(), Some(5));
    }

    #[test]
    fn build_http_request_sets_content_length_for_finite_body() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("999"));
        let request = build_http_request(
            Method::POST,
            "http://h/upload".parse().expect("uri"),
            &headers,
            RequestBody::from("abc"),
        )
        .expect("request");
        assert_eq!(
            request
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|value| value.to_str().ok()),
            Some("3")
        );
    }

    #[test]
    fn progress_fraction_needs_total() {
        let progress = DownloadProgress {
            loaded: 50,
            total: Some(200),
            bytes: 50,
        };
        assert_eq!(progress.fraction(), Some(0.25));
        let unknown = DownloadProgress {
            total: None,
            ..progress
        };
        assert_eq!(unknown.fraction(), None);
    }
}
