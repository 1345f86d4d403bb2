use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;

use crate::body::BodyStream;
use crate::error::Error;
use crate::util::{redact_uri_for_logs, truncate_body};

#[derive(Debug)]
pub enum ResponseBody {
    /// Text that parsed as JSON because the server labelled it `application/json`.
    Json(serde_json::Value),
    Text(String),
    Bytes(Bytes),
    Stream(BodyStream),
}

/// The hop that produced the response, after redirects.
#[derive(Clone, Debug)]
pub struct RequestEcho {
    pub uri: String,
    pub method: Method,
    pub headers: HeaderMap,
}

#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    /// Every header instance as received, including repeated `set-cookie`.
    pub headers: HeaderMap,
    pub body: ResponseBody,
    pub request: RequestEcho,
}

impl Response {
    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn json<T>(&self) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let parsed = match &self.body {
            ResponseBody::Json(value) => T::deserialize(value),
            ResponseBody::Text(text) => serde_json::from_str(text),
            ResponseBody::Bytes(bytes) => serde_json::from_slice(bytes),
            ResponseBody::Stream(_) => {
                return Err(Error::Validation {
                    message: "streamed response bodies must be collected before decoding"
                        .to_owned(),
                });
            }
        };
        parsed.map_err(|source| Error::Deserialize { source })
    }

    /// The buffered body as text. `None` for streamed responses.
    pub fn text(&self) -> Option<String> {
        match &self.body {
            ResponseBody::Json(value) => Some(value.to_string()),
            ResponseBody::Text(text) => Some(text.clone()),
            ResponseBody::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            ResponseBody::Stream(_) => None,
        }
    }

    /// The buffered body as bytes. `None` for streamed responses.
    pub fn bytes(&self) -> Option<Bytes> {
        match &self.body {
            ResponseBody::Json(value) => Some(Bytes::from(value.to_string())),
            ResponseBody::Text(text) => Some(Bytes::from(text.clone())),
            ResponseBody::Bytes(bytes) => Some(bytes.clone()),
            ResponseBody::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<BodyStream> {
        match self.body {
            ResponseBody::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    /// Turns 4xx and 5xx responses into [`Error::HttpStatus`].
    pub fn error_for_status(self) -> Result<Self, Error> {
        if !(self.status.is_client_error() || self.status.is_server_error()) {
            return Ok(self);
        }
        Err(self.status_error())
    }

    pub(crate) fn status_error(&self) -> Error {
        let body = self
            .bytes()
            .map(|bytes| truncate_body(&bytes))
            .unwrap_or_default();
        Error::HttpStatus {
            status: self.status.as_u16(),
            method: self.request.method.clone(),
            uri: redact_uri_for_logs(&self.request.uri),
            body,
        }
    }
}
