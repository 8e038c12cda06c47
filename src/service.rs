use crate::body::CompressionBody;
use crate::codec;
use crate::decompress::DecompressionBody;
use crate::future::{CompressSettings, ResponseFuture};
use crate::layer::Config;
use crate::pool::CompressorPool;
use http::{Method, Request, Response};
use http_body::Body;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;

/// A Tower service that compresses HTTP response bodies with LZ4.
///
/// Built by [`Lz4Layer`](crate::Lz4Layer). Clones share the configuration and the compressor
/// pool.
#[derive(Debug, Clone)]
pub struct Lz4Service<S> {
    inner: S,
    config: Arc<Config>,
    pool: Arc<CompressorPool>,
}

impl<S> Lz4Service<S> {
    pub(crate) fn new(inner: S, config: Arc<Config>, pool: Arc<CompressorPool>) -> Self {
        Self {
            inner,
            config,
            pool,
        }
    }

    /// Returns a reference to the inner service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner service.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes this service, returning the inner service.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Runs the decompression hook and swaps in a decoding body if it asks for one.
    fn prepare_request<B>(&self, req: Request<B>) -> Request<DecompressionBody<B>>
    where
        B: Body,
    {
        let hook = match &self.config.decompress {
            Some(hook) if codec::is_lz4_encoded(req.headers()) => hook,
            _ => return req.map(DecompressionBody::passthrough),
        };

        let (mut parts, body) = req.into_parts();
        let body_is_empty = body.is_end_stream() || body.size_hint().exact() == Some(0);
        let body = if hook.call(&mut parts, body_is_empty) {
            tracing::debug!(path = parts.uri.path(), "decompressing lz4 request body");
            DecompressionBody::decompressed(body)
        } else {
            DecompressionBody::passthrough(body)
        };
        Request::from_parts(parts, body)
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for Lz4Service<S>
where
    S: Service<Request<DecompressionBody<ReqBody>>, Response = Response<ResBody>>,
    ReqBody: Body,
    ResBody: Body,
    ResBody::Error: Into<crate::BoxError>,
{
    type Response = Response<CompressionBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let req = self.prepare_request(req);

        // HEAD responses carry the length of a body that is never sent
        let compress = if *req.method() != Method::HEAD && self.config.policy.eligible(&req) {
            Some(CompressSettings {
                pool: Arc::clone(&self.pool),
                buffer_limit: self.config.buffer_limit,
            })
        } else {
            tracing::debug!(path = req.uri().path(), "lz4 compression skipped");
            None
        };

        let inner = self.inner.call(req);

        ResponseFuture::new(inner, compress)
    }
}
