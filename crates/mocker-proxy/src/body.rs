//! Lazy, shareable message bodies.
//!
//! A [`MessageBody`] wraps the body of one request or response. Nothing is
//! read until a consumer asks for it. The first consumer starts a pump task
//! that drains the source into a [`BodyBuffer`]; every consumer then reads the
//! buffered chunks through its own [`BodyReader`] cursor, so a body can be
//! inspected by several rule handlers and still be forwarded.
//!
//! A consuming reader releases chunks once it has read them. After that,
//! opening another reader fails with [`BodyError::AlreadyConsumed`].
//!
//! Decoded views (gzip or deflate) are another buffer fed from a reader on the
//! raw one.

use std::collections::VecDeque;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use flate2::write::{DeflateDecoder, GzDecoder, ZlibDecoder};
use futures::{Stream, TryStreamExt};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{HeaderMap, CONTENT_ENCODING};
use hyper::{Method, StatusCode};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::BodyError;

/// Boxed error used by body streams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type flowing through the proxy in both directions.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// An empty body.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// A body holding `bytes`.
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// How a body accessor reads the body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BodyOptions {
    /// Release chunks after reading them. Later readers fail.
    pub consume: bool,
    /// Apply the message's content-encoding.
    pub decode: bool,
}

impl BodyOptions {
    /// Non-consuming, raw access.
    pub fn raw() -> Self {
        Self::default()
    }

    /// Non-consuming, decoded access.
    pub fn decoded() -> Self {
        Self {
            consume: false,
            decode: true,
        }
    }

    /// Sets the consume flag.
    pub fn consume(mut self) -> Self {
        self.consume = true;
        self
    }
}

/// Content codings the proxy can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Identity,
    Gzip,
    Deflate,
}

impl ContentCoding {
    /// Reads the coding from a `content-encoding` header. Unknown codings
    /// are passed through as identity.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let value = headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase());

        match value.as_deref() {
            Some("gzip") | Some("x-gzip") => ContentCoding::Gzip,
            Some("deflate") | Some("x-deflate") => ContentCoding::Deflate,
            _ => ContentCoding::Identity,
        }
    }

    /// Coding of a response body. HEAD responses and 204/304 never carry
    /// a body to decode.
    pub fn for_response(method: &Method, status: StatusCode, headers: &HeaderMap) -> Self {
        if method == Method::HEAD
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            ContentCoding::Identity
        } else {
            Self::from_headers(headers)
        }
    }
}

#[derive(Default)]
struct BufferState {
    chunks: VecDeque<Bytes>,
    /// Absolute index of `chunks[0]`.
    released: usize,
    finished: bool,
    error: Option<BodyError>,
    consumed: bool,
}

/// Chunks of one body, shared between readers.
pub struct BodyBuffer {
    state: Mutex<BufferState>,
    notify: Notify,
}

impl BodyBuffer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BufferState::default()),
            notify: Notify::new(),
        })
    }

    /// Starts draining `source` in a background task.
    pub fn capture<B>(source: B) -> Arc<Self>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError>,
    {
        let buffer = Self::new();
        tokio::spawn(pump(buffer.clone(), source));
        buffer
    }

    /// A finished buffer holding `bytes`.
    pub fn from_bytes(bytes: Bytes) -> Arc<Self> {
        let buffer = Self::new();
        {
            let mut state = buffer.state.lock();
            if !bytes.is_empty() {
                state.chunks.push_back(bytes);
            }
            state.finished = true;
        }
        buffer
    }

    /// A buffer whose source was handed off without buffering.
    fn handed_off() -> Arc<Self> {
        let buffer = Self::new();
        {
            let mut state = buffer.state.lock();
            state.finished = true;
            state.consumed = true;
        }
        buffer
    }

    /// Opens a reader at the first chunk.
    pub fn reader(self: &Arc<Self>, consume: bool) -> Result<BodyReader, BodyError> {
        let mut state = self.state.lock();
        if state.consumed {
            return Err(BodyError::AlreadyConsumed);
        }
        if consume {
            state.consumed = true;
        }
        Ok(BodyReader {
            buffer: self.clone(),
            cursor: state.released,
            consume,
            done: false,
        })
    }

    /// Whether the source has been fully read.
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    fn push(&self, chunk: Bytes) {
        self.state.lock().chunks.push_back(chunk);
        self.notify.notify_waiters();
    }

    fn finish(&self) {
        self.state.lock().finished = true;
        self.notify.notify_waiters();
    }

    fn fail(&self, error: BodyError) {
        {
            let mut state = self.state.lock();
            state.error = Some(error);
            state.finished = true;
        }
        self.notify.notify_waiters();
    }
}

impl fmt::Debug for BodyBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BodyBuffer")
            .field("chunks", &state.chunks.len())
            .field("finished", &state.finished)
            .field("consumed", &state.consumed)
            .finish()
    }
}

async fn pump<B>(buffer: Arc<BodyBuffer>, mut source: B)
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    loop {
        match source.frame().await {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    if !data.is_empty() {
                        buffer.push(data);
                    }
                }
            }
            Some(Err(e)) => {
                let e: BoxError = e.into();
                buffer.fail(BodyError::Source(e.to_string()));
                return;
            }
            None => {
                buffer.finish();
                return;
            }
        }
    }
}

/// One consumer's cursor over a [`BodyBuffer`].
#[derive(Debug)]
pub struct BodyReader {
    buffer: Arc<BodyBuffer>,
    cursor: usize,
    consume: bool,
    done: bool,
}

impl BodyReader {
    /// Next chunk, waiting for the pump if needed. `None` at end of body.
    /// An error is yielded once and ends the reader.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, BodyError>> {
        if self.done {
            return None;
        }
        loop {
            let notified = self.buffer.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.buffer.state.lock();
                if self.cursor < state.released {
                    self.done = true;
                    return Some(Err(BodyError::AlreadyConsumed));
                }

                let index = self.cursor - state.released;
                if index < state.chunks.len() {
                    self.cursor += 1;
                    if self.consume {
                        // Only the consuming reader drops chunks, from the front
                        let chunk = state.chunks.pop_front()?;
                        state.released += 1;
                        return Some(Ok(chunk));
                    }
                    return Some(Ok(state.chunks[index].clone()));
                }

                if let Some(error) = &state.error {
                    self.done = true;
                    return Some(Err(error.clone()));
                }
                if state.finished {
                    self.done = true;
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Reads every remaining chunk into one buffer.
    pub async fn read_to_end(mut self) -> Result<Bytes, BodyError> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }

    /// Converts the reader into a chunk stream.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, BodyError>> + Send + 'static {
        futures::stream::unfold(self, |mut reader| async move {
            reader.next_chunk().await.map(|item| (item, reader))
        })
    }

    /// Converts the reader into an HTTP body.
    pub fn into_body(self) -> ProxyBody {
        let stream = self
            .into_stream()
            .map_ok(Frame::data)
            .map_err(|e| -> BoxError { Box::new(e) });
        StreamBody::new(stream).boxed_unsync()
    }
}

enum Inflater {
    Gzip(GzDecoder<Vec<u8>>),
    Zlib(ZlibDecoder<Vec<u8>>),
    Raw(DeflateDecoder<Vec<u8>>),
}

impl Inflater {
    fn new(coding: ContentCoding, first_byte: u8) -> Option<Self> {
        match coding {
            ContentCoding::Gzip => Some(Inflater::Gzip(GzDecoder::new(Vec::new()))),
            // zlib-wrapped streams start with a CMF byte whose low nibble is 8
            ContentCoding::Deflate if first_byte & 0x0f == 0x08 => {
                Some(Inflater::Zlib(ZlibDecoder::new(Vec::new())))
            }
            ContentCoding::Deflate => Some(Inflater::Raw(DeflateDecoder::new(Vec::new()))),
            ContentCoding::Identity => None,
        }
    }

    fn write(&mut self, chunk: &[u8]) -> std::io::Result<Bytes> {
        match self {
            Inflater::Gzip(d) => d.write_all(chunk).and_then(|_| d.flush())?,
            Inflater::Zlib(d) => d.write_all(chunk).and_then(|_| d.flush())?,
            Inflater::Raw(d) => d.write_all(chunk).and_then(|_| d.flush())?,
        }
        Ok(self.take_output())
    }

    /// Flushes remaining output. The error, if any, comes with whatever was
    /// decoded before it.
    fn finish(&mut self) -> (Bytes, std::io::Result<()>) {
        let result = match self {
            Inflater::Gzip(d) => d.try_finish(),
            Inflater::Zlib(d) => d.try_finish(),
            Inflater::Raw(d) => d.try_finish(),
        };
        (self.take_output(), result)
    }

    fn take_output(&mut self) -> Bytes {
        let output = match self {
            Inflater::Gzip(d) => d.get_mut(),
            Inflater::Zlib(d) => d.get_mut(),
            Inflater::Raw(d) => d.get_mut(),
        };
        Bytes::from(std::mem::take(output))
    }
}

fn spawn_decoder(mut reader: BodyReader, coding: ContentCoding) -> Arc<BodyBuffer> {
    let buffer = BodyBuffer::new();
    let output = buffer.clone();

    tokio::spawn(async move {
        let mut inflater: Option<Inflater> = None;

        while let Some(chunk) = reader.next_chunk().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    output.fail(e);
                    return;
                }
            };

            if inflater.is_none() {
                inflater = Inflater::new(coding, chunk[0]);
            }
            let decoded = match inflater.as_mut() {
                Some(inflater) => inflater.write(&chunk),
                None => Ok(chunk),
            };
            match decoded {
                Ok(bytes) if !bytes.is_empty() => output.push(bytes),
                Ok(_) => {}
                Err(e) => {
                    output.fail(BodyError::Decode(e.to_string()));
                    return;
                }
            }
        }

        if let Some(mut inflater) = inflater {
            let (bytes, result) = inflater.finish();
            if !bytes.is_empty() {
                output.push(bytes);
            }
            // Truncated streams still yield what was decoded
            if let Err(e) = result {
                debug!("Ignoring incomplete {:?} stream: {}", coding, e);
            }
        }
        output.finish();
    });

    buffer
}

/// The body of one request or response.
pub struct MessageBody {
    source: Mutex<Option<ProxyBody>>,
    raw: OnceCell<Arc<BodyBuffer>>,
    decoded: OnceCell<Arc<BodyBuffer>>,
}

impl MessageBody {
    /// Wraps an unread body.
    pub fn new<B>(body: B) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        Self {
            source: Mutex::new(Some(body.map_err(Into::into).boxed_unsync())),
            raw: OnceCell::new(),
            decoded: OnceCell::new(),
        }
    }

    /// A body with known contents.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            source: Mutex::new(None),
            raw: OnceCell::with_value(BodyBuffer::from_bytes(bytes.into())),
            decoded: OnceCell::new(),
        }
    }

    /// An empty body.
    pub fn empty() -> Self {
        Self::from_bytes(Bytes::new())
    }

    /// Whether any consumer has started reading.
    pub fn is_touched(&self) -> bool {
        self.raw.get().is_some()
    }

    fn raw(&self) -> &Arc<BodyBuffer> {
        self.raw.get_or_init(|| match self.source.lock().take() {
            Some(source) => BodyBuffer::capture(source),
            None => BodyBuffer::from_bytes(Bytes::new()),
        })
    }

    fn decoded(
        &self,
        coding: ContentCoding,
        consume: bool,
    ) -> Result<&Arc<BodyBuffer>, BodyError> {
        self.decoded.get_or_try_init(|| {
            let reader = self.raw().reader(consume)?;
            Ok(spawn_decoder(reader, coding))
        })
    }

    /// Opens a reader. `coding` applies only when `options.decode` is set.
    pub fn stream(
        &self,
        options: BodyOptions,
        coding: ContentCoding,
    ) -> Result<BodyReader, BodyError> {
        if options.decode && coding != ContentCoding::Identity {
            self.decoded(coding, options.consume)?
                .reader(options.consume)
        } else {
            self.raw().reader(options.consume)
        }
    }

    /// Reads the whole body.
    pub async fn buffer(
        &self,
        options: BodyOptions,
        coding: ContentCoding,
    ) -> Result<Bytes, BodyError> {
        self.stream(options, coding)?.read_to_end().await
    }

    /// Reads the body as UTF-8 text, replacing invalid sequences.
    pub async fn text(
        &self,
        options: BodyOptions,
        coding: ContentCoding,
    ) -> Result<String, BodyError> {
        let bytes = self.buffer(options, coding).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Reads and parses the body as JSON.
    pub async fn json<T: DeserializeOwned>(
        &self,
        options: BodyOptions,
        coding: ContentCoding,
    ) -> Result<T, BodyError> {
        let bytes = self.buffer(options, coding).await?;
        serde_json::from_slice(&bytes).map_err(|e| BodyError::Json(e.to_string()))
    }

    /// Converts into an HTTP body for forwarding.
    ///
    /// An untouched body read raw and consuming is handed over as-is, with no
    /// buffering.
    pub fn into_http_body(
        &self,
        options: BodyOptions,
        coding: ContentCoding,
    ) -> Result<ProxyBody, BodyError> {
        let passthrough = options.consume && (!options.decode || coding == ContentCoding::Identity);
        if passthrough && self.raw.get().is_none() {
            let mut source = self.source.lock();
            if let Some(body) = source.take() {
                let _ = self.raw.set(BodyBuffer::handed_off());
                return Ok(body);
            }
        }
        Ok(self.stream(options, coding)?.into_body())
    }
}

impl Default for MessageBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for MessageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBody")
            .field("touched", &self.is_touched())
            .field("decoded", &self.decoded.get().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use futures::StreamExt;
    use hyper::header::HeaderValue;

    fn chunked(parts: &[&'static [u8]]) -> MessageBody {
        let chunks: Vec<Result<Frame<Bytes>, BoxError>> = parts
            .iter()
            .map(|p| Ok(Frame::data(Bytes::from_static(p))))
            .collect();
        MessageBody::new(StreamBody::new(futures::stream::iter(chunks)))
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[tokio::test]
    async fn buffer_twice_returns_same_bytes() {
        let body = chunked(&[b"hello ", b"world"]);

        let first = body
            .buffer(BodyOptions::raw(), ContentCoding::Identity)
            .await
            .unwrap();
        let second = body
            .buffer(BodyOptions::raw(), ContentCoding::Identity)
            .await
            .unwrap();

        assert_eq!(&first[..], b"hello world");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn untouched_body_reads_nothing() {
        let body = chunked(&[b"data"]);
        assert!(!body.is_touched());
        body.stream(BodyOptions::raw(), ContentCoding::Identity)
            .unwrap();
        assert!(body.is_touched());
    }

    #[tokio::test]
    async fn concurrent_readers_see_every_chunk() {
        let body = chunked(&[b"a", b"b", b"c"]);
        let first = body
            .stream(BodyOptions::raw(), ContentCoding::Identity)
            .unwrap();
        let second = body
            .stream(BodyOptions::raw(), ContentCoding::Identity)
            .unwrap();

        let (a, b) = tokio::join!(first.read_to_end(), second.read_to_end());
        assert_eq!(&a.unwrap()[..], b"abc");
        assert_eq!(&b.unwrap()[..], b"abc");
    }

    #[tokio::test]
    async fn reader_after_consume_fails() {
        let body = chunked(&[b"once"]);
        let consumed = body
            .stream(BodyOptions::raw().consume(), ContentCoding::Identity)
            .unwrap();
        assert_eq!(&consumed.read_to_end().await.unwrap()[..], b"once");

        let err = body
            .stream(BodyOptions::raw(), ContentCoding::Identity)
            .unwrap_err();
        assert_eq!(err, BodyError::AlreadyConsumed);
    }

    #[tokio::test]
    async fn lagging_reader_errors_when_chunks_released() {
        let body = chunked(&[b"one", b"two"]);
        let mut lagging = body
            .stream(BodyOptions::raw(), ContentCoding::Identity)
            .unwrap();
        let consumer = body
            .stream(BodyOptions::raw().consume(), ContentCoding::Identity)
            .unwrap();

        consumer.read_to_end().await.unwrap();
        assert_eq!(
            lagging.next_chunk().await,
            Some(Err(BodyError::AlreadyConsumed))
        );
        assert_eq!(lagging.next_chunk().await, None);
    }

    #[tokio::test]
    async fn gzip_is_decoded_on_request() {
        let compressed = gzip(b"compressed text");
        let body = MessageBody::from_bytes(compressed.clone());

        let text = body
            .text(BodyOptions::decoded(), ContentCoding::Gzip)
            .await
            .unwrap();
        assert_eq!(text, "compressed text");

        let raw = body
            .buffer(BodyOptions::raw(), ContentCoding::Gzip)
            .await
            .unwrap();
        assert_eq!(&raw[..], &compressed[..]);
    }

    #[tokio::test]
    async fn deflate_accepts_zlib_and_raw() {
        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(b"zlib wrapped").unwrap();
        let body = MessageBody::from_bytes(zlib.finish().unwrap());
        let text = body
            .text(BodyOptions::decoded(), ContentCoding::Deflate)
            .await
            .unwrap();
        assert_eq!(text, "zlib wrapped");

        let mut raw = DeflateEncoder::new(Vec::new(), Compression::default());
        raw.write_all(b"raw deflate").unwrap();
        let body = MessageBody::from_bytes(raw.finish().unwrap());
        let text = body
            .text(BodyOptions::decoded(), ContentCoding::Deflate)
            .await
            .unwrap();
        assert_eq!(text, "raw deflate");
    }

    #[tokio::test]
    async fn truncated_gzip_yields_partial_output() {
        let compressed = gzip(b"partial payload that is long enough to matter");
        let truncated = compressed[..compressed.len() - 8].to_vec();
        let body = MessageBody::from_bytes(truncated);

        let text = body
            .text(BodyOptions::decoded(), ContentCoding::Gzip)
            .await
            .unwrap();
        assert!("partial payload that is long enough to matter".starts_with(&text));
    }

    #[tokio::test]
    async fn json_parses() {
        let body = MessageBody::from_bytes(r#"{"ok":true}"#);
        let value: serde_json::Value = body
            .json(BodyOptions::decoded(), ContentCoding::Identity)
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn untouched_body_passes_through() {
        let body = chunked(&[b"stream"]);
        let http_body = body
            .into_http_body(BodyOptions::raw().consume(), ContentCoding::Identity)
            .unwrap();
        let bytes = http_body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"stream");

        assert_eq!(
            body.stream(BodyOptions::raw(), ContentCoding::Identity)
                .unwrap_err(),
            BodyError::AlreadyConsumed
        );
    }

    #[tokio::test]
    async fn inspected_body_is_still_forwarded() {
        let body = chunked(&[b"inspect ", b"me"]);
        let seen = body
            .text(BodyOptions::raw(), ContentCoding::Identity)
            .await
            .unwrap();
        assert_eq!(seen, "inspect me");

        let forwarded = body
            .into_http_body(BodyOptions::raw().consume(), ContentCoding::Identity)
            .unwrap()
            .collect()
            .await
            .unwrap()
            .to_bytes();
        assert_eq!(&forwarded[..], b"inspect me");
    }

    #[tokio::test]
    async fn source_errors_reach_readers() {
        let chunks: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from_static(b"ok"))),
            Err("connection reset".into()),
        ];
        let body = MessageBody::new(StreamBody::new(futures::stream::iter(chunks)));

        let stream = body
            .stream(BodyOptions::raw(), ContentCoding::Identity)
            .unwrap()
            .into_stream();
        let items: Vec<_> = stream.take(10).collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(b"ok"));
        assert!(matches!(items[1], Err(BodyError::Source(_))));

        // Every reader sees the error once, then the end of the body
        let mut reader = body
            .stream(BodyOptions::raw(), ContentCoding::Identity)
            .unwrap();
        assert!(reader.next_chunk().await.unwrap().is_ok());
        assert!(reader.next_chunk().await.unwrap().is_err());
        assert!(reader.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn decoder_stops_after_source_error() {
        let chunks: Vec<Result<Frame<Bytes>, BoxError>> = vec![
            Ok(Frame::data(Bytes::from(gzip(b"partial")[..4].to_vec()))),
            Err("connection reset".into()),
        ];
        let body = MessageBody::new(StreamBody::new(futures::stream::iter(chunks)));

        let items: Vec<_> = body
            .stream(BodyOptions::decoded(), ContentCoding::Gzip)
            .unwrap()
            .into_stream()
            .take(10)
            .collect()
            .await;
        assert!(matches!(items.last(), Some(Err(BodyError::Source(_)))));
        assert!(items.len() <= 2);
    }

    #[test]
    fn coding_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(ContentCoding::from_headers(&headers), ContentCoding::Identity);

        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("GZIP"));
        assert_eq!(ContentCoding::from_headers(&headers), ContentCoding::Gzip);

        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
        assert_eq!(ContentCoding::from_headers(&headers), ContentCoding::Identity);
    }

    #[test]
    fn bodyless_responses_are_identity() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        assert_eq!(
            ContentCoding::for_response(&Method::HEAD, StatusCode::OK, &headers),
            ContentCoding::Identity
        );
        assert_eq!(
            ContentCoding::for_response(&Method::GET, StatusCode::NOT_MODIFIED, &headers),
            ContentCoding::Identity
        );
        assert_eq!(
            ContentCoding::for_response(&Method::GET, StatusCode::OK, &headers),
            ContentCoding::Gzip
        );
    }
}
