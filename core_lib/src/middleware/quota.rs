//! Daily traffic quota middleware

use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use bytes::Bytes;
use chrono::Utc;
use futures_util::Stream;
use tracing::debug;

use crate::error::AppError;
use crate::usage::{client_identifier, UsageTracker};

pub const TRAFFIC_UPLOADED_HEADER: &str = "x-traffic-uploaded";

/// Charges the declared `Content-Length` against the upload quota before the
/// body is read. A client understating its size is not caught here. Admitted
/// responses advertise the configured daily limit.
pub async fn upload_limiter(
    State(tracker): State<UsageTracker>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let client = client_identifier(request.headers(), peer_addr(&request));
    let declared = declared_length(request.headers());

    let counted = tracker
        .admit_upload(&client, declared, Utc::now())
        .map_err(|rejection| AppError::QuotaExceeded(rejection.to_string()))?;

    debug!(client = %client, counted, "Upload admitted");

    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(TRAFFIC_UPLOADED_HEADER, HeaderValue::from(tracker.limit()));

    Ok(response)
}

/// Rejects clients already over the download quota and meters the bytes of
/// file responses as they are streamed out.
pub async fn download_limiter(
    State(tracker): State<UsageTracker>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let client = client_identifier(request.headers(), peer_addr(&request));

    let day = tracker
        .admit_download(&client, Utc::now())
        .map_err(|rejection| AppError::QuotaExceeded(rejection.to_string()))?;

    let response = next.run(request).await;
    if !should_count_bytes(response.headers()) {
        return Ok(response);
    }

    let (parts, body) = response.into_parts();
    let metered = MeteredStream::new(body.into_data_stream(), move |sent| {
        debug!(client = %client, bytes = sent, "Download completed");
        tracker.record(&client, &day, sent);
    });

    Ok(Response::from_parts(parts, Body::from_stream(metered)))
}

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

fn declared_length(headers: &HeaderMap) -> u64 {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Only file content is charged: responses without a content type, and JSON
/// bodies (errors, acknowledgements), are free.
pub fn should_count_bytes(headers: &HeaderMap) -> bool {
    let Some(content_type) = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    match content_type.to_ascii_lowercase().parse::<mime::Mime>() {
        Ok(parsed) => parsed.subtype() != mime::JSON && parsed.suffix() != Some(mime::JSON),
        Err(_) => true,
    }
}

type CompletionHook = Box<dyn FnOnce(u64) + Send>;

/// Wraps a body stream, tallies the bytes that pass through it and reports
/// the total exactly once, when the stream ends or is dropped early.
pub struct MeteredStream<S> {
    inner: S,
    sent: u64,
    on_complete: Option<CompletionHook>,
}

impl<S> MeteredStream<S> {
    pub fn new<F>(inner: S, on_complete: F) -> Self
    where
        F: FnOnce(u64) + Send + 'static,
    {
        Self {
            inner,
            sent: 0,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    fn finish(&mut self) {
        if let Some(report) = self.on_complete.take() {
            report(self.sent);
        }
    }
}

impl<S, E> Stream for MeteredStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl<S> Drop for MeteredStream<S> {
    fn drop(&mut self) {
        self.finish();
    }
}
