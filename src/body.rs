use crate::pool::PooledCompressor;
use bytes::{Buf, Bytes};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

pin_project! {
    /// A response body that may be compressed.
    ///
    /// This type wraps an inner body and either streams it through a pooled LZ4 frame
    /// compressor or passes it through unchanged.
    #[project = CompressionBodyProj]
    #[allow(missing_docs)]
    pub enum CompressionBody<B> {
        /// Compressed body with encoder.
        Compressed {
            state: CompressedBody<B>,
        },
        /// Passthrough body without compression.
        Passthrough {
            #[pin]
            inner: B,
        },
    }
}

/// State and buffers for an actively compressed body.
///
/// The inner body is boxed so the response future can drive it before handing the response
/// back.
pub(crate) struct CompressedBody<B> {
    inner: Pin<Box<B>>,
    compressor: Option<PooledCompressor>,
    always_flush: bool,
    state: CompressState,
    /// Output left in the compressor when the frame was closed.
    tail: Bytes,
    error: Option<io::Error>,
    pending_trailers: Option<http::HeaderMap>,
    bytes_sent: u64,
}

/// State machine for compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompressState {
    /// Reading data from inner body and compressing.
    Reading,
    /// Frame closed; emitting the tail, then buffered trailers.
    Trailers,
    /// Compression is complete.
    Done,
}

impl<B> CompressedBody<B>
where
    B: Body,
    B::Error: Into<crate::BoxError>,
{
    /// Creates a new compressed body state writing through `compressor`.
    pub(crate) fn new(inner: B, compressor: PooledCompressor, always_flush: bool) -> Self {
        Self {
            inner: Box::pin(inner),
            compressor: Some(compressor),
            always_flush,
            state: CompressState::Reading,
            tail: Bytes::new(),
            error: None,
            pending_trailers: None,
            bytes_sent: 0,
        }
    }

    /// Drives the inner body into the compressor without emitting anything.
    ///
    /// Stops once `limit` compressed bytes are waiting, the inner body would block, or the
    /// frame is closed. Returns the exact compressed length when the whole body fits, which is
    /// the only case where the response head can still carry a `Content-Length`.
    pub(crate) fn prebuffer(&mut self, cx: &mut Context<'_>, limit: usize) -> Option<u64> {
        while self.state == CompressState::Reading {
            if self.buffered_len() >= limit {
                return None;
            }
            match self.advance(cx) {
                Poll::Pending => return None,
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => {
                    self.abort();
                    self.error = Some(e);
                    return None;
                }
            }
        }

        if self.error.is_some() || self.pending_trailers.is_some() {
            return None;
        }
        Some(self.tail.len() as u64)
    }

    /// Pulls one frame from the inner body into the compressor.
    fn advance(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(self.inner.as_mut().poll_frame(cx)) {
            None => {
                self.close();
                Poll::Ready(Ok(()))
            }
            Some(Err(e)) => Poll::Ready(Err(into_io_error(e))),
            Some(Ok(frame)) => match frame.into_data() {
                Ok(mut data) => Poll::Ready(self.compress_chunk(&mut data)),
                Err(frame) => {
                    // Buffer trailers and finish compression first
                    self.pending_trailers = frame.into_trailers().ok();
                    self.close();
                    Poll::Ready(Ok(()))
                }
            },
        }
    }

    /// Writes a chunk of input into the compressor.
    fn compress_chunk<D: Buf>(&mut self, data: &mut D) -> io::Result<()> {
        let Some(compressor) = self.compressor.as_mut() else {
            return Ok(());
        };
        while data.has_remaining() {
            let chunk = data.chunk();
            let len = chunk.len();
            compressor.write(chunk)?;
            data.advance(len);
        }
        // Flush if always_flush is enabled
        if self.always_flush {
            compressor.flush()?;
        }
        Ok(())
    }

    /// Terminates the frame and returns the compressor to the pool.
    fn close(&mut self) {
        self.state = CompressState::Trailers;
        let Some(mut compressor) = self.compressor.take() else {
            return;
        };
        match compressor.close() {
            Ok(()) => {
                self.tail = compressor.take_output();
                tracing::debug!(
                    compressed_bytes = self.bytes_sent + self.tail.len() as u64,
                    "lz4 response finalized"
                );
            }
            Err(e) => {
                // The response has already started; log and end it.
                tracing::warn!(error = %e, "failed to close lz4 frame");
            }
        }
    }

    /// Gives up on the frame after an error.
    fn abort(&mut self) {
        self.state = CompressState::Done;
        self.compressor = None;
        self.pending_trailers = None;
    }

    fn buffered_len(&self) -> usize {
        self.compressor.as_ref().map_or(0, |c| c.buffered_len())
    }

    fn take_output(&mut self) -> Option<Bytes> {
        let output = self.compressor.as_mut()?.take_output();
        (!output.is_empty()).then_some(output)
    }

    fn emit(&mut self, data: Bytes) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        self.bytes_sent += data.len() as u64;
        Poll::Ready(Some(Ok(Frame::data(data))))
    }

    /// Polls the inner body and compresses data.
    fn poll_compressed(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        if let Some(e) = self.error.take() {
            return Poll::Ready(Some(Err(e)));
        }

        loop {
            match self.state {
                CompressState::Done => return Poll::Ready(None),

                CompressState::Trailers => {
                    if !self.tail.is_empty() {
                        let tail = std::mem::take(&mut self.tail);
                        return self.emit(tail);
                    }
                    self.state = CompressState::Done;
                    if let Some(trailers) = self.pending_trailers.take() {
                        return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                    }
                }

                CompressState::Reading => {
                    if let Some(output) = self.take_output() {
                        return self.emit(output);
                    }
                    if let Err(e) = ready!(self.advance(cx)) {
                        self.abort();
                        return Poll::Ready(Some(Err(e)));
                    }
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.state == CompressState::Done && self.error.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        match self.state {
            // Compressed size is unknown until the frame is closed
            CompressState::Reading => SizeHint::default(),
            CompressState::Trailers | CompressState::Done => {
                SizeHint::with_exact(self.tail.len() as u64)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> CompressState {
        self.state
    }
}

fn into_io_error<E: Into<crate::BoxError>>(error: E) -> io::Error {
    io::Error::other(error.into())
}

impl<B> CompressionBody<B> {
    /// Creates a passthrough body without compression.
    pub fn passthrough(inner: B) -> Self {
        Self::Passthrough { inner }
    }

    pub(crate) fn compressed(state: CompressedBody<B>) -> Self {
        Self::Compressed { state }
    }
}

impl<B> Body for CompressionBody<B>
where
    B: Body,
    B::Error: Into<crate::BoxError>,
{
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            CompressionBodyProj::Passthrough { inner } => {
                // Pass through frames, converting data to Bytes
                match inner.poll_frame(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(None) => Poll::Ready(None),
                    Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(
                        frame.map_data(|mut data| data.copy_to_bytes(data.remaining())),
                    ))),
                    Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(into_io_error(e)))),
                }
            }
            CompressionBodyProj::Compressed { state } => state.poll_compressed(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            CompressionBody::Passthrough { inner } => inner.is_end_stream(),
            CompressionBody::Compressed { state } => state.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            CompressionBody::Passthrough { inner } => inner.size_hint(),
            CompressionBody::Compressed { state } => state.size_hint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{CompressorPool, DEFAULT_POOL_CAPACITY};
    use http::HeaderMap;
    use lz4_flex::frame::FrameDecoder;
    use std::collections::VecDeque;
    use std::io::Read;
    use std::sync::Arc;

    /// A test body that yields predefined frames.
    struct TestBody {
        frames: VecDeque<Poll<Frame<Bytes>>>,
    }

    impl TestBody {
        fn new(frames: Vec<Frame<Bytes>>) -> Self {
            Self {
                frames: frames.into_iter().map(Poll::Ready).collect(),
            }
        }

        /// Yields `Pending` once before each listed frame.
        fn slow(frames: Vec<Frame<Bytes>>) -> Self {
            Self {
                frames: frames
                    .into_iter()
                    .flat_map(|frame| [Poll::Pending, Poll::Ready(frame)])
                    .collect(),
            }
        }
    }

    impl Body for TestBody {
        type Data = Bytes;
        type Error = std::convert::Infallible;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            match self.frames.pop_front() {
                Some(Poll::Pending) => Poll::Pending,
                Some(Poll::Ready(frame)) => Poll::Ready(Some(Ok(frame))),
                None => Poll::Ready(None),
            }
        }
    }

    fn pool() -> Arc<CompressorPool> {
        Arc::new(CompressorPool::new(DEFAULT_POOL_CAPACITY))
    }

    fn cx() -> Context<'static> {
        Context::from_waker(std::task::Waker::noop())
    }

    fn poll_body<B: Body + Unpin>(body: &mut B) -> Poll<Option<Result<Frame<B::Data>, B::Error>>> {
        Pin::new(body).poll_frame(&mut cx())
    }

    /// Polls until the end of the body, skipping `Pending`, returning data and trailers.
    fn drain<B>(body: &mut B) -> (Vec<u8>, Option<HeaderMap>)
    where
        B: Body<Data = Bytes, Error = io::Error> + Unpin,
    {
        let mut data = Vec::new();
        let mut trailers = None;
        for _ in 0..10_000 {
            match poll_body(body) {
                Poll::Pending => continue,
                Poll::Ready(None) => return (data, trailers),
                Poll::Ready(Some(frame)) => match frame.unwrap().into_data() {
                    Ok(chunk) => data.extend_from_slice(&chunk),
                    Err(frame) => trailers = frame.into_trailers().ok(),
                },
            }
        }
        panic!("body did not finish");
    }

    fn decode(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        FrameDecoder::new(data).read_to_end(&mut out).unwrap();
        out
    }

    fn compressed(inner: TestBody, pool: &Arc<CompressorPool>) -> CompressionBody<TestBody> {
        CompressionBody::compressed(CompressedBody::new(inner, pool.acquire(), false))
    }

    #[test]
    fn test_passthrough_data() {
        let inner = TestBody::new(vec![Frame::data(Bytes::from("hello world"))]);
        let mut body = CompressionBody::passthrough(inner);

        let (data, _) = drain(&mut body);
        assert_eq!(data, b"hello world");
    }

    #[test]
    fn test_passthrough_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc123".parse().unwrap());

        let inner = TestBody::new(vec![
            Frame::data(Bytes::from("data")),
            Frame::trailers(trailers.clone()),
        ]);
        let mut body = CompressionBody::passthrough(inner);

        let (data, received) = drain(&mut body);
        assert_eq!(data, b"data");
        assert_eq!(received.unwrap().get("x-checksum").unwrap(), "abc123");
    }

    #[test]
    fn test_compressed_round_trip() {
        let pool = pool();
        let inner = TestBody::new(vec![
            Frame::data(Bytes::from("Lz4 Test ")),
            Frame::data(Bytes::from("Response ")),
        ]);
        let mut body = compressed(inner, &pool);

        let (data, _) = drain(&mut body);
        assert_ne!(data, b"Lz4 Test Response ");
        assert_eq!(decode(&data), b"Lz4 Test Response ");
        assert!(body.is_end_stream());
        assert_eq!(pool.idle_len(), 1);
    }

    #[test]
    fn test_compressed_empty_body() {
        let pool = pool();
        let mut body = compressed(TestBody::new(vec![]), &pool);

        let (data, _) = drain(&mut body);
        assert!(!data.is_empty());
        assert_eq!(decode(&data), b"");
    }

    #[test]
    fn test_compressed_large_body_spans_blocks() {
        let pool = pool();
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 97) as u8).collect();
        let frames = payload
            .chunks(10_000)
            .map(|chunk| Frame::data(Bytes::copy_from_slice(chunk)))
            .collect();
        let mut body = compressed(TestBody::new(frames), &pool);

        let (data, _) = drain(&mut body);
        assert_eq!(decode(&data), payload);
    }

    #[test]
    fn test_compressed_with_trailers() {
        let pool = pool();
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc123".parse().unwrap());

        let inner = TestBody::new(vec![
            Frame::data(Bytes::from("hello world")),
            Frame::trailers(trailers),
        ]);
        let mut body = compressed(inner, &pool);

        let (data, received) = drain(&mut body);
        assert_eq!(decode(&data), b"hello world");
        assert_eq!(received.unwrap().get("x-checksum").unwrap(), "abc123");
    }

    #[test]
    fn test_always_flush_emits_each_chunk() {
        let pool = pool();
        let inner = TestBody::slow(vec![
            Frame::data(Bytes::from("event: one\n\n")),
            Frame::data(Bytes::from("event: two\n\n")),
        ]);
        let mut body =
            CompressionBody::compressed(CompressedBody::new(inner, pool.acquire(), true));

        assert!(poll_body(&mut body).is_pending());
        // The first chunk leaves as soon as it is written, before the inner body ends.
        let frame = match poll_body(&mut body) {
            Poll::Ready(Some(Ok(frame))) => frame,
            other => panic!("expected data frame, got {other:?}"),
        };
        assert!(!frame.into_data().unwrap().is_empty());
    }

    #[test]
    fn test_prebuffer_complete_body() {
        let pool = pool();
        let inner = TestBody::new(vec![Frame::data(Bytes::from("Lz4 Test Response "))]);
        let mut state = CompressedBody::new(inner, pool.acquire(), false);

        let len = state.prebuffer(&mut cx(), 8 * 1024).unwrap();
        assert_eq!(state.state(), CompressState::Trailers);
        // The compressor went back to the pool as soon as the frame was closed.
        assert_eq!(pool.idle_len(), 1);

        let mut body = CompressionBody::compressed(state);
        assert_eq!(body.size_hint().exact(), Some(len));
        let (data, _) = drain(&mut body);
        assert_eq!(data.len() as u64, len);
        assert_eq!(decode(&data), b"Lz4 Test Response ");
    }

    #[test]
    fn test_prebuffer_stops_on_pending() {
        let pool = pool();
        let inner = TestBody::slow(vec![Frame::data(Bytes::from("later"))]);
        let mut state = CompressedBody::new(inner, pool.acquire(), false);

        assert_eq!(state.prebuffer(&mut cx(), 8 * 1024), None);
        assert_eq!(state.state(), CompressState::Reading);

        let mut body = CompressionBody::compressed(state);
        let (data, _) = drain(&mut body);
        assert_eq!(decode(&data), b"later");
    }

    #[test]
    fn test_prebuffer_stops_at_limit() {
        let pool = pool();
        // Poorly compressible input so the output outgrows the limit.
        let mut seed = 0x2545_f491u32;
        let payload: Vec<u8> = (0..200_000)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                seed as u8
            })
            .collect();
        let frames = payload
            .chunks(70_000)
            .map(|chunk| Frame::data(Bytes::copy_from_slice(chunk)))
            .collect();
        let mut state = CompressedBody::new(TestBody::new(frames), pool.acquire(), false);

        assert_eq!(state.prebuffer(&mut cx(), 1024), None);
        assert_eq!(state.state(), CompressState::Reading);

        let mut body = CompressionBody::compressed(state);
        let (data, _) = drain(&mut body);
        assert_eq!(decode(&data), payload);
    }

    #[test]
    fn test_dropped_body_releases_compressor() {
        let pool = pool();
        let inner = TestBody::slow(vec![Frame::data(Bytes::from("never finished"))]);
        let mut body = compressed(inner, &pool);
        assert!(poll_body(&mut body).is_pending());
        assert_eq!(pool.idle_len(), 0);

        drop(body);
        assert_eq!(pool.idle_len(), 1);
    }

    /// A body that yields one chunk and then fails.
    struct FailingBody {
        frames: VecDeque<Result<Frame<Bytes>, io::Error>>,
    }

    impl FailingBody {
        fn new() -> Self {
            Self {
                frames: VecDeque::from([
                    Ok(Frame::data(Bytes::from("partial"))),
                    Err(io::Error::other("upstream reset")),
                ]),
            }
        }
    }

    impl Body for FailingBody {
        type Data = Bytes;
        type Error = io::Error;

        fn poll_frame(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            Poll::Ready(self.frames.pop_front())
        }
    }

    #[test]
    fn test_inner_error_after_prebuffer() {
        let pool = pool();
        let mut state = CompressedBody::new(FailingBody::new(), pool.acquire(), false);

        assert_eq!(state.prebuffer(&mut cx(), 8 * 1024), None);
        assert_eq!(pool.idle_len(), 1);

        let mut body = CompressionBody::compressed(state);
        match poll_body(&mut body) {
            Poll::Ready(Some(Err(e))) => assert_eq!(e.to_string(), "upstream reset"),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(body.is_end_stream());
        assert!(matches!(poll_body(&mut body), Poll::Ready(None)));
    }

    #[test]
    fn test_inner_error_while_streaming() {
        let pool = pool();
        let state = CompressedBody::new(FailingBody::new(), pool.acquire(), false);
        let mut body = CompressionBody::compressed(state);

        let error = loop {
            match poll_body(&mut body) {
                Poll::Ready(Some(Ok(_))) | Poll::Pending => continue,
                Poll::Ready(Some(Err(e))) => break e,
                Poll::Ready(None) => panic!("body ended without an error"),
            }
        };
        assert_eq!(error.to_string(), "upstream reset");
        assert!(body.is_end_stream());
        assert_eq!(pool.idle_len(), 1);
    }
}
