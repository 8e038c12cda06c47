use crate::codec;
use bytes::{Bytes, BytesMut};
use lz4_flex::frame::FrameEncoder;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::mem::{self, ManuallyDrop};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Default number of idle compressors kept by a pool.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Where a compressor's output goes.
#[derive(Debug)]
enum Sink {
    /// Idle compressors write here; everything is dropped.
    Discard,
    /// The output of the response currently owning the compressor.
    Buffer(BytesMut),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Sink::Buffer(output) = self {
            output.extend_from_slice(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A reusable LZ4 frame compressor.
pub(crate) struct Compressor {
    encoder: FrameEncoder<Sink>,
    /// A frame has been started and not yet terminated.
    frame_open: bool,
    /// The encoder has terminated at least one frame.
    reused: bool,
    /// Closing failed; the encoder state can no longer be trusted.
    broken: bool,
}

impl Compressor {
    fn new() -> Self {
        Self {
            encoder: FrameEncoder::with_frame_info(codec::frame_info(), Sink::Discard),
            frame_open: false,
            reused: false,
            broken: false,
        }
    }

    fn bind(&mut self, sink: Sink) {
        *self.encoder.get_mut() = sink;
    }

    /// Feeds uncompressed bytes into the current frame.
    pub(crate) fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.frame_open = true;
        self.encoder.write_all(data)
    }

    /// Compresses whatever is buffered into a complete block.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }

    /// Terminates the current frame, writing the end mark to the sink.
    pub(crate) fn close(&mut self) -> io::Result<()> {
        if !self.frame_open && self.reused {
            // lz4_flex only writes an empty frame from an encoder that never finished one.
            let sink = mem::replace(self.encoder.get_mut(), Sink::Discard);
            self.encoder = FrameEncoder::with_frame_info(codec::frame_info(), sink);
        }
        let result = self.encoder.try_finish().map_err(io::Error::from);
        self.frame_open = false;
        self.reused = true;
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    /// Takes the compressed bytes produced so far.
    pub(crate) fn take_output(&mut self) -> Bytes {
        match self.encoder.get_mut() {
            Sink::Buffer(output) => output.split().freeze(),
            Sink::Discard => Bytes::new(),
        }
    }

    /// Number of compressed bytes waiting in the sink.
    pub(crate) fn buffered_len(&self) -> usize {
        match self.encoder.get_ref() {
            Sink::Buffer(output) => output.len(),
            Sink::Discard => 0,
        }
    }

    /// Detaches the compressor from its response.
    ///
    /// Returns false if the compressor must not be reused.
    fn reset(&mut self) -> bool {
        self.bind(Sink::Discard);
        if self.frame_open && !self.broken {
            // The response went away mid-frame; close it into the discard sink so the next
            // checkout starts a fresh frame.
            if let Err(e) = self.close() {
                tracing::warn!(error = %e, "failed to reset lz4 compressor");
            }
        }
        !self.broken
    }
}

/// A pool of idle compressors shared by every request of a service.
#[derive(Debug)]
pub(crate) struct CompressorPool {
    idle: Mutex<Vec<Compressor>>,
    capacity: usize,
}

impl CompressorPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Checks out a compressor bound to a fresh output buffer.
    ///
    /// The pool never runs dry: a new compressor is built when no idle one is available.
    pub(crate) fn acquire(self: &Arc<Self>) -> PooledCompressor {
        let mut compressor = self.idle.lock().pop().unwrap_or_else(Compressor::new);
        compressor.bind(Sink::Buffer(BytesMut::new()));
        PooledCompressor {
            compressor: ManuallyDrop::new(compressor),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, mut compressor: Compressor) {
        if !compressor.reset() {
            tracing::warn!("dropping broken lz4 compressor");
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            idle.push(compressor);
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A compressor checked out of a [`CompressorPool`].
///
/// Dropping the guard returns the compressor to the pool, whatever the exit path.
pub(crate) struct PooledCompressor {
    compressor: ManuallyDrop<Compressor>,
    pool: Arc<CompressorPool>,
}

impl Deref for PooledCompressor {
    type Target = Compressor;

    fn deref(&self) -> &Compressor {
        &self.compressor
    }
}

impl DerefMut for PooledCompressor {
    fn deref_mut(&mut self) -> &mut Compressor {
        &mut self.compressor
    }
}

impl Drop for PooledCompressor {
    fn drop(&mut self) {
        // SAFETY: the compressor is taken exactly once, here, and never touched again.
        let compressor = unsafe { ManuallyDrop::take(&mut self.compressor) };
        self.pool.release(compressor);
    }
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("frame_open", &self.frame_open)
            .field("reused", &self.reused)
            .field("broken", &self.broken)
            .finish()
    }
}
