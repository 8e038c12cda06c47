use crate::codec;
use crate::error::DecompressError;
use bytes::{Buf, Bytes};
use compression_codecs::DecodeV2;
use compression_codecs::lz4::Lz4Decoder;
use compression_core::util::{PartialBuffer, WriteBuffer};
use http::header;
use http::request::Parts;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

const OUTPUT_BUFFER_SIZE: usize = 8 * 1024; // 8KB output buffer

type HookFn = dyn Fn(&mut Parts, bool) -> bool + Send + Sync;

/// Pre-processing step run on requests whose `Content-Encoding` is `lz4`.
///
/// The hook receives the request head and whether the body is known to be empty. It may
/// rewrite headers; returning `true` replaces the body with a [`DecompressionBody`] that
/// decodes it lazily.
#[derive(Clone)]
pub struct DecompressHook(Arc<HookFn>);

impl DecompressHook {
    /// Creates a hook from a function.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut Parts, bool) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self, parts: &mut Parts, body_is_empty: bool) -> bool {
        (self.0)(parts, body_is_empty)
    }
}

impl Default for DecompressHook {
    /// Returns a hook running [`default_decompress`].
    fn default() -> Self {
        Self::new(default_decompress)
    }
}

impl fmt::Debug for DecompressHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DecompressHook").finish_non_exhaustive()
    }
}

/// The default decompression hook.
///
/// Bodiless requests are left alone, so a stray `Content-Encoding` on a health check does not
/// turn into a read error. Otherwise `Content-Encoding` and `Content-Length` are removed, since
/// neither describes the decoded body, and decompression is requested.
pub fn default_decompress(parts: &mut Parts, body_is_empty: bool) -> bool {
    if body_is_empty {
        return false;
    }
    parts.headers.remove(header::CONTENT_ENCODING);
    parts.headers.remove(header::CONTENT_LENGTH);
    true
}

pin_project! {
    /// A request body that may be decompressed.
    ///
    /// Decoding happens as the body is read: nothing is buffered up front, and malformed input
    /// is reported by the read that reaches it.
    #[project = DecompressionBodyProj]
    #[allow(missing_docs)]
    pub enum DecompressionBody<B> {
        /// Body decoded from an LZ4 frame.
        Decompressed {
            #[pin]
            inner: B,
            state: DecodeState,
        },
        /// Body handed through unchanged.
        Passthrough {
            #[pin]
            inner: B,
        },
    }
}

/// Where the decoder is in the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Reading data from the inner body and decoding it.
    Reading,
    /// Inner body is done; draining the decoder.
    Finishing,
    /// Emitting buffered trailers.
    Trailers,
    /// Decoding is complete.
    Done,
}

/// Decoder and buffers for a decompressed body.
pub(crate) struct DecodeState {
    decoder: Lz4Decoder,
    input: Bytes,
    output_buffer: Vec<u8>,
    /// The last decode filled the output buffer; the decoder may hold more.
    output_full: bool,
    /// The decoder reached the end of the current frame.
    frame_done: bool,
    seen_input: bool,
    stage: Stage,
    pending_trailers: Option<http::HeaderMap>,
}

impl fmt::Debug for DecodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeState")
            .field("stage", &self.stage)
            .field("frame_done", &self.frame_done)
            .finish_non_exhaustive()
    }
}

impl DecodeState {
    fn new() -> Self {
        Self {
            decoder: codec::decoder(),
            input: Bytes::new(),
            output_buffer: vec![0u8; OUTPUT_BUFFER_SIZE],
            output_full: false,
            frame_done: false,
            seen_input: false,
            stage: Stage::Reading,
            pending_trailers: None,
        }
    }

    fn poll_decoded<B>(
        &mut self,
        cx: &mut Context<'_>,
        mut inner: Pin<&mut B>,
    ) -> Poll<Option<Result<Frame<Bytes>, DecompressError>>>
    where
        B: Body,
        B::Error: Into<crate::BoxError>,
    {
        loop {
            match self.stage {
                Stage::Done => return Poll::Ready(None),

                Stage::Trailers => {
                    self.stage = Stage::Done;
                    if let Some(trailers) = self.pending_trailers.take() {
                        return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                    }
                }

                Stage::Finishing => {
                    if !self.seen_input {
                        // Nothing was sent; an empty body decodes to an empty body.
                        self.stage = Stage::Trailers;
                        continue;
                    }
                    let mut output =
                        WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
                    let flushed = match self.decoder.flush(&mut output) {
                        Ok(flushed) => flushed,
                        Err(e) => {
                            let error = self.fail(DecompressError::Corrupt(e));
                            return Poll::Ready(Some(Err(error)));
                        }
                    };
                    let written = output.written_len();
                    if written > 0 {
                        let data = Bytes::copy_from_slice(&self.output_buffer[..written]);
                        return Poll::Ready(Some(Ok(Frame::data(data))));
                    }
                    if !flushed {
                        continue;
                    }
                    if !self.frame_done {
                        return Poll::Ready(Some(Err(self.fail(DecompressError::Truncated))));
                    }
                    self.stage = Stage::Trailers;
                }

                Stage::Reading => {
                    if !self.input.is_empty() || self.output_full {
                        match self.decode_input() {
                            Ok(Some(data)) => return Poll::Ready(Some(Ok(Frame::data(data)))),
                            Ok(None) => continue,
                            Err(e) => return Poll::Ready(Some(Err(self.fail(e)))),
                        }
                    }

                    match inner.as_mut().poll_frame(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(None) => {
                            self.stage = Stage::Finishing;
                        }
                        Poll::Ready(Some(Err(e))) => {
                            let error = self.fail(DecompressError::Body(e.into()));
                            return Poll::Ready(Some(Err(error)));
                        }
                        Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                            Ok(mut data) => {
                                self.input = data.copy_to_bytes(data.remaining());
                                self.seen_input |= !self.input.is_empty();
                            }
                            Err(frame) => {
                                // Trailers end the body; drain the decoder before sending them.
                                self.pending_trailers = frame.into_trailers().ok();
                                self.stage = Stage::Finishing;
                            }
                        },
                    }
                }
            }
        }
    }

    /// Runs the decoder over the buffered input.
    fn decode_input(&mut self) -> Result<Option<Bytes>, DecompressError> {
        if self.frame_done && !self.input.is_empty() {
            // Another frame follows the one just finished.
            self.decoder.reinit().map_err(DecompressError::Corrupt)?;
            self.frame_done = false;
        }

        let mut input = PartialBuffer::new(&self.input[..]);
        let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
        let done = self
            .decoder
            .decode(&mut input, &mut output)
            .map_err(DecompressError::Corrupt)?;
        let consumed = input.written_len();
        let written = output.written_len();

        // Safety check to prevent infinite loop
        if consumed == 0 && written == 0 && !self.input.is_empty() {
            return Err(DecompressError::Corrupt(io::Error::other(
                "lz4 decoder made no progress",
            )));
        }

        self.input.advance(consumed);
        self.output_full = output.has_no_spare_space();
        if done {
            self.frame_done = true;
        }

        if written > 0 {
            Ok(Some(Bytes::copy_from_slice(&self.output_buffer[..written])))
        } else {
            Ok(None)
        }
    }

    fn fail(&mut self, error: DecompressError) -> DecompressError {
        tracing::debug!(error = %error, "lz4 request body rejected");
        self.stage = Stage::Done;
        self.input.clear();
        error
    }
}

impl<B> DecompressionBody<B> {
    /// Creates a body that decodes `inner` as an LZ4 frame.
    pub fn decompressed(inner: B) -> Self {
        Self::Decompressed {
            inner,
            state: DecodeState::new(),
        }
    }

    /// Creates a body that hands `inner` through unchanged.
    pub fn passthrough(inner: B) -> Self {
        Self::Passthrough { inner }
    }
}

impl<B> Body for DecompressionBody<B>
where
    B: Body,
    B::Error: Into<crate::BoxError>,
{
    type Data = Bytes;
    type Error = DecompressError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            DecompressionBodyProj::Passthrough { inner } => match inner.poll_frame(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Ready(Some(Ok(frame))) => Poll::Ready(Some(Ok(
                    frame.map_data(|mut data| data.copy_to_bytes(data.remaining())),
                ))),
                Poll::Ready(Some(Err(e))) => {
                    Poll::Ready(Some(Err(DecompressError::Body(e.into()))))
                }
            },
            DecompressionBodyProj::Decompressed { inner, state } => state.poll_decoded(cx, inner),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            DecompressionBody::Passthrough { inner } => inner.is_end_stream(),
            DecompressionBody::Decompressed { state, .. } => state.stage == Stage::Done,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            DecompressionBody::Passthrough { inner } => inner.size_hint(),
            // Decoded size is unknown
            DecompressionBody::Decompressed { .. } => SizeHint::default(),
        }
    }
}
