//! Decoding of fully buffered responses into typed values.
//!
//! A [`ResponseBuilder`] chains a [`BodyCodec`] onto an underlying request. When the exchange
//! completes, the raw buffer is decoded once up front and retained, so the resulting
//! [`HttpResponse`] can re-decode it on demand without touching the stream again.


use std::{
    fmt,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use encoding_rs::{Encoding, UTF_8};
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// A decoder from a fully buffered response body into a typed value.
///
/// Codecs are cheap to clone and reusable across requests.
#[derive(Clone)]
pub struct BodyCodec<T> {
    inner: Arc<dyn Fn(&Bytes) -> Result<T> + Send + Sync>,
}

impl<T> BodyCodec<T> {
    fn from_fn(decode: impl Fn(&Bytes) -> Result<T> + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(decode),
        }
    }

    /// Decodes one buffer.
    pub fn decode(&self, buffer: &Bytes) -> Result<T> {
        (self.inner)(buffer)
    }
}

impl<T> fmt::Debug for BodyCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyCodec").finish()
    }
}

impl BodyCodec<Bytes> {
    /// Passes the raw body buffer through unchanged.
    pub fn buffer() -> Self {
        Self::from_fn(|buffer| Ok(buffer.clone()))
    }
}

impl BodyCodec<String> {
    /// Decodes the body as UTF-8, substituting replacement characters for invalid sequences.
    pub fn string() -> Self {
        Self::from_fn(|buffer| decode_utf8(buffer))
    }

    /// Decodes the body with the encoding named by `label`, a WHATWG encoding label such as
    /// `"iso-8859-1"`. An unknown label fails the decode.
    pub fn string_with_charset(label: impl Into<String>) -> Self {
        let label = label.into();
        Self::from_fn(move |buffer| decode_charset(&label, buffer))
    }
}

impl BodyCodec<serde_json::Value> {
    /// Parses the body as a JSON document.
    pub fn json_value() -> Self {
        Self::from_fn(|buffer| parse_json(buffer))
    }
}

impl<T: DeserializeOwned> BodyCodec<T> {
    /// Deserializes the body from JSON into `T`.
    pub fn json() -> Self {
        Self::from_fn(|buffer| parse_json(buffer))
    }
}

fn decode_utf8(buffer: &Bytes) -> Result<String> {
    let (text, _, _) = UTF_8.decode(buffer);
    Ok(text.into_owned())
}

fn decode_charset(label: &str, buffer: &Bytes) -> Result<String> {
    let encoding = Encoding::for_label(label.as_bytes())
        .ok_or_else(|| Error::decode(format!("unknown encoding label {:?}", label)))?;
    let (text, _, _) = encoding.decode(buffer);
    Ok(text.into_owned())
}

fn parse_json<T: DeserializeOwned>(buffer: &Bytes) -> Result<T> {
    serde_json::from_slice(buffer).map_err(|e| Error::decode(format!("invalid JSON body: {}", e)))
}

/// The status line and headers of a response, as delivered by the protocol codec.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ResponseHead {
    /// The protocol version of the response.
    pub version: Version,

    /// The response status code.
    pub status: StatusCode,

    /// The reason phrase from the status line. Empty when the protocol carries none.
    pub status_message: String,

    /// The response headers.
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Creates a response head.
    pub fn new(
        version: Version,
        status: StatusCode,
        status_message: impl Into<String>,
        headers: HeaderMap,
    ) -> Self {
        Self {
            version,
            status,
            status_message: status_message.into(),
            headers,
        }
    }
}

/// A response whose body has been fully read into memory, before decoding.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct RawResponse {
    /// The status line and headers.
    pub head: ResponseHead,

    /// The complete body.
    pub body: Bytes,
}

impl RawResponse {
    /// Creates a raw response from its head and complete body.
    pub fn new(head: ResponseHead, body: Bytes) -> Self {
        Self { head, body }
    }
}

type RawCallback = Box<dyn FnOnce(Result<RawResponse>) + Send>;

/// The completion surface handed to the underlying request: an exception handler and a
/// full-body handler sharing a single one-shot callback.
///
/// Whichever of [`fail`](Self::fail) and [`complete`](Self::complete) fires first wins; later
/// events are dropped.
#[derive(Clone)]
pub struct ResponseEvents {
    callback: Arc<Mutex<Option<RawCallback>>>,
}

impl ResponseEvents {
    fn new(callback: RawCallback) -> Self {
        Self {
            callback: Arc::new(Mutex::new(Some(callback))),
        }
    }

    /// Delivers the buffered response. A no-op if the exchange already completed.
    pub fn complete(&self, response: RawResponse) {
        if let Some(callback) = self.take() {
            callback(Ok(response));
        }
    }

    /// Fails the exchange. A no-op if the exchange already completed.
    pub fn fail(&self, error: Error) {
        if let Some(callback) = self.take() {
            callback(Err(error));
        }
    }

    /// Whether a terminal event has already been delivered.
    pub fn is_complete(&self) -> bool {
        self.callback.lock().unwrap().is_none()
    }

    fn take(&self) -> Option<RawCallback> {
        self.callback.lock().unwrap().take()
    }
}

impl fmt::Debug for ResponseEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseEvents")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// The interface of the underlying request the response builder drives.
///
/// Implemented by the protocol codec: `dispatch` writes the request (with `body`, if any),
/// buffers the full response, and reports exactly one terminal event through `events`: the
/// buffered response, or the first error encountered.
pub trait DispatchRequest: Send + 'static {
    /// Starts the exchange.
    fn dispatch(self, body: Option<Bytes>, events: ResponseEvents);
}

/// Configures how a response body is decoded before the request is sent.
///
/// The builder is created over an underlying request with a pass-through buffer codec and
/// re-targeted by the `as_*` methods, each returning a builder that produces a different body
/// type. [`send`](Self::send) dispatches the request and decodes the buffered response.
#[derive(Debug)]
pub struct ResponseBuilder<R, T> {
    request: R,
    codec: BodyCodec<T>,
}

impl<R: DispatchRequest> ResponseBuilder<R, Bytes> {
    /// Wraps `request`, initially decoding bodies as raw buffers.
    pub fn new(request: R) -> Self {
        Self {
            request,
            codec: BodyCodec::buffer(),
        }
    }
}

impl<R: DispatchRequest, T: 'static> ResponseBuilder<R, T> {
    /// Re-targets the builder to decode bodies as UTF-8 strings.
    pub fn as_string(self) -> ResponseBuilder<R, String> {
        self.decode_with(BodyCodec::string())
    }

    /// Re-targets the builder to decode bodies with the named encoding.
    pub fn as_string_with_charset(self, label: impl Into<String>) -> ResponseBuilder<R, String> {
        self.decode_with(BodyCodec::string_with_charset(label))
    }

    /// Re-targets the builder to parse bodies as JSON documents.
    pub fn as_json_object(self) -> ResponseBuilder<R, serde_json::Value> {
        self.decode_with(BodyCodec::json_value())
    }

    /// Re-targets the builder to deserialize JSON bodies into `U`.
    pub fn as_type<U: DeserializeOwned>(self) -> ResponseBuilder<R, U> {
        self.decode_with(BodyCodec::json())
    }

    /// Re-targets the builder to an arbitrary codec.
    pub fn decode_with<U>(self, codec: BodyCodec<U>) -> ResponseBuilder<R, U> {
        ResponseBuilder {
            request: self.request,
            codec,
        }
    }

    /// Dispatches the request and invokes `callback` with the decoded, fully buffered
    /// response.
    ///
    /// The callback is invoked exactly once: with the decoded response, with the first error
    /// the exchange reported, or with the decode failure.
    pub fn send<F>(self, body: Option<Bytes>, callback: F)
    where
        F: FnOnce(Result<HttpResponse<T>>) + Send + 'static,
    {
        let ResponseBuilder { request, codec } = self;
        let events = ResponseEvents::new(Box::new(move |result| {
            let outcome = result.and_then(|raw| {
                let body = codec.decode(&raw.body)?;
                Ok(HttpResponse {
                    head: raw.head,
                    buffer: raw.body,
                    body,
                })
            });
            callback(outcome);
        }));
        request.dispatch(body, events);
    }
}

/// A fully buffered, decoded response.
///
/// The raw body buffer is retained alongside the decoded value, so the `body_as_*` accessors
/// can re-decode it on demand; they never touch the stream again.
#[derive(Clone, Debug)]
pub struct HttpResponse<T> {
    head: ResponseHead,
    buffer: Bytes,
    body: T,
}

impl<T> HttpResponse<T> {
    /// The protocol version.
    pub fn version(&self) -> Version {
        self.head.version
    }

    /// The status code.
    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    /// The reason phrase of the status line.
    pub fn status_message(&self) -> &str {
        &self.head.status_message
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// The decoded body.
    pub fn body(&self) -> &T {
        &self.body
    }

    /// Consumes the response, returning the decoded body.
    pub fn into_body(self) -> T {
        self.body
    }

    /// The raw body buffer.
    pub fn body_as_buffer(&self) -> &Bytes {
        &self.buffer
    }

    /// Re-decodes the raw buffer as a UTF-8 string.
    pub fn body_as_string(&self) -> Result<String> {
        decode_utf8(&self.buffer)
    }

    /// Re-decodes the raw buffer with the named encoding.
    pub fn body_as_string_with_charset(&self, label: &str) -> Result<String> {
        decode_charset(label, &self.buffer)
    }

    /// Re-parses the raw buffer as a JSON document.
    pub fn body_as_json_object(&self) -> Result<serde_json::Value> {
        parse_json(&self.buffer)
    }

    /// Re-deserializes the raw buffer from JSON into `U`.
    pub fn body_as<U: DeserializeOwned>(&self) -> Result<U> {
        parse_json(&self.buffer)
    }
}
