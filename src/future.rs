use crate::body::{CompressedBody, CompressionBody};
use crate::codec::LZ4_ENCODING;
use crate::policy;
use crate::pool::CompressorPool;
use http::{Response, StatusCode, header};
use http_body::Body;
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// What an eligible request needs to compress its response.
#[derive(Debug, Clone)]
pub(crate) struct CompressSettings {
    pub(crate) pool: Arc<CompressorPool>,
    pub(crate) buffer_limit: usize,
}

pin_project! {
    /// Future for [`Lz4Service`](crate::Lz4Service) responses.
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        compress: Option<CompressSettings>,
    }
}

impl<F> ResponseFuture<F> {
    pub(crate) fn new(inner: F, compress: Option<CompressSettings>) -> Self {
        Self { inner, compress }
    }
}

impl<F, B, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<B>, E>>,
    B: Body,
    B::Error: Into<crate::BoxError>,
{
    type Output = Result<Response<CompressionBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match this.inner.poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(response)) => {
                let response = match this.compress.take() {
                    Some(settings) => wrap_response(response, &settings, cx),
                    None => response.map(CompressionBody::passthrough),
                };
                Poll::Ready(Ok(response))
            }
        }
    }
}

/// Wraps the response body with an LZ4 compressor if the response allows it.
fn wrap_response<B>(
    response: Response<B>,
    settings: &CompressSettings,
    cx: &mut Context<'_>,
) -> Response<CompressionBody<B>>
where
    B: Body,
    B::Error: Into<crate::BoxError>,
{
    let (mut parts, body) = response.into_parts();

    if !can_carry_body(parts.status)
        || has_content_encoding(&parts.headers)
        || has_content_range(&parts.headers)
        || policy::is_event_stream(&parts.headers)
    {
        return Response::from_parts(parts, CompressionBody::passthrough(body));
    }

    let always_flush = parts
        .headers
        .get("x-accel-buffering")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("no"));

    parts.headers.insert(
        header::CONTENT_ENCODING,
        header::HeaderValue::from_static(LZ4_ENCODING),
    );
    // The inner length describes the uncompressed body
    parts.headers.remove(header::CONTENT_LENGTH);
    parts.headers.remove(header::ACCEPT_RANGES);
    add_vary_accept_encoding(&mut parts.headers);

    let mut state = CompressedBody::new(body, settings.pool.acquire(), always_flush);
    if let Some(len) = state.prebuffer(cx, settings.buffer_limit) {
        parts.headers.insert(header::CONTENT_LENGTH, len.into());
    }

    Response::from_parts(parts, CompressionBody::compressed(state))
}

/// Returns false for statuses that never carry a body.
fn can_carry_body(status: StatusCode) -> bool {
    !(status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}

/// Checks if Content-Encoding header is already present.
fn has_content_encoding(headers: &header::HeaderMap) -> bool {
    headers.contains_key(header::CONTENT_ENCODING)
}

/// Checks if Content-Range header is present (range response).
fn has_content_range(headers: &header::HeaderMap) -> bool {
    headers.contains_key(header::CONTENT_RANGE)
}

/// Adds Accept-Encoding to the Vary header if not already present.
fn add_vary_accept_encoding(headers: &mut header::HeaderMap) {
    let listed = headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| {
            let v = v.trim();
            v == "*" || v.eq_ignore_ascii_case("accept-encoding")
        });

    if !listed {
        headers.append(
            header::VARY,
            header::HeaderValue::from_static("Accept-Encoding"),
        );
    }
}
