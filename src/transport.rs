use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};

use crate::{
    request::{FormField, ProgressCallback, RedactedHeaders},
    Method, MultipartForm, TransportError,
};

/// Encoded request body as handed to the transport.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportBody {
    Bytes(Vec<u8>),
    /// The transport chooses the boundary and `Content-Type`.
    Multipart(MultipartForm),
}

impl TransportBody {
    /// Body size in bytes, file parts and text fields included.
    pub fn len(&self) -> u64 {
        match self {
            Self::Bytes(bytes) => bytes.len() as u64,
            Self::Multipart(form) => form.byte_len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One network attempt.
#[derive(Clone)]
pub struct TransportRequest {
    pub url: String,
    pub method: Method,
    pub headers: BTreeMap<String, String>,
    pub body: Option<TransportBody>,
    pub on_download_progress: Option<ProgressCallback>,
}

impl TransportRequest {
    /// Looks a header up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl fmt::Debug for TransportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRequest")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("headers", &RedactedHeaders(&self.headers))
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

/// Raw response with the body fully read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub status_text: String,
    /// Lower-cased header names; repeated headers are joined with `, `.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Fetch-like boundary between the engine and the network.
///
/// Timeouts and cancellation are applied by the engine, which drops the
/// returned future when either fires.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// Default [`Transport`] backed by `reqwest`.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    /// Wraps a preconfigured `reqwest` client.
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let TransportRequest {
            url,
            method,
            headers,
            body,
            on_download_progress,
        } = request;

        let mut builder = self.http.request(method.to_reqwest(), &url);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match body {
            Some(TransportBody::Bytes(bytes)) => builder.body(bytes),
            Some(TransportBody::Multipart(form)) => builder.multipart(build_form(form)?),
            None => builder,
        };

        let mut response = builder.send().await?;
        let status = response.status();

        let mut response_headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else {
                continue;
            };
            response_headers
                .entry(name.as_str().to_owned())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_owned());
        }

        let total = response.content_length();
        let mut body = Vec::with_capacity(total.unwrap_or_default().min(1 << 20) as usize);
        while let Some(chunk) = response.chunk().await? {
            body.extend_from_slice(&chunk);
            if let Some(progress) = &on_download_progress {
                progress(body.len() as u64, total);
            }
        }

        Ok(TransportResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            headers: response_headers,
            body,
        })
    }
}

fn build_form(form: MultipartForm) -> Result<Form, TransportError> {
    let mut multipart = Form::new();
    for (name, field) in form.fields {
        multipart = match field {
            FormField::Text(value) => multipart.text(name, value),
            FormField::File(file) => {
                let mut part = Part::bytes(file.data).file_name(file.file_name);
                if let Some(content_type) = file.content_type {
                    part = part.mime_str(&content_type)?;
                }
                multipart.part(name, part)
            }
        };
    }
    Ok(multipart)
}
