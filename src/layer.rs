use crate::decompress::DecompressHook;
use crate::policy::ExclusionPolicy;
use crate::pool::{CompressorPool, DEFAULT_POOL_CAPACITY};
use crate::service::Lz4Service;
use http::request::Parts;
use regex::Regex;
use std::sync::Arc;
use tower::Layer;

/// Default number of compressed bytes held back to compute an exact `Content-Length`.
pub const DEFAULT_BUFFER_LIMIT: usize = 8 * 1024;

/// Settings shared read-only by every clone of an [`Lz4Service`].
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) policy: ExclusionPolicy,
    pub(crate) decompress: Option<DecompressHook>,
    pub(crate) buffer_limit: usize,
    pub(crate) pool_capacity: usize,
}

/// A Tower layer that compresses HTTP response bodies with LZ4.
///
/// Responses are compressed when the client lists `lz4` in `Accept-Encoding` and the request
/// is not excluded. Optionally, `lz4` encoded request bodies are decompressed before they reach
/// the inner service.
///
/// ```
/// use http_lz4_compression::Lz4Layer;
///
/// let layer = Lz4Layer::new()
///     .excluded_extensions([".png", ".jpg"])
///     .excluded_paths(["/metrics"])
///     .decompress_requests();
/// ```
#[derive(Debug, Clone)]
pub struct Lz4Layer {
    config: Config,
}

impl Lz4Layer {
    /// Creates a new layer that compresses every eligible response and leaves request bodies
    /// alone.
    pub fn new() -> Self {
        Self {
            config: Config {
                policy: ExclusionPolicy::new(),
                decompress: None,
                buffer_limit: DEFAULT_BUFFER_LIMIT,
                pool_capacity: DEFAULT_POOL_CAPACITY,
            },
        }
    }

    /// Skips compression for request paths ending in one of these extensions.
    ///
    /// A missing leading dot is added, so `"png"` and `".png"` are the same entry.
    pub fn excluded_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.policy.exclude_extensions(extensions);
        self
    }

    /// Skips compression for these exact request paths.
    pub fn excluded_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.policy.exclude_paths(paths);
        self
    }

    /// Skips compression for request paths starting with any of these prefixes.
    pub fn excluded_path_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.policy.exclude_path_prefixes(prefixes);
        self
    }

    /// Skips compression for request paths matching any of these patterns.
    pub fn excluded_path_regexes<I>(mut self, regexes: I) -> Self
    where
        I: IntoIterator<Item = Regex>,
    {
        self.config.policy.exclude_path_regexes(regexes);
        self
    }

    /// Decompresses `lz4` encoded request bodies using [`default_decompress`].
    ///
    /// [`default_decompress`]: crate::default_decompress
    pub fn decompress_requests(mut self) -> Self {
        self.config.decompress = Some(DecompressHook::default());
        self
    }

    /// Decompresses `lz4` encoded request bodies whenever `hook` returns true.
    ///
    /// The hook receives the request head and whether the body is known to be empty. It may
    /// rewrite headers before the request reaches the inner service.
    pub fn decompress_with<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Parts, bool) -> bool + Send + Sync + 'static,
    {
        self.config.decompress = Some(DecompressHook::new(hook));
        self
    }

    /// Sets how many compressed bytes may be held back before the response head is sent.
    ///
    /// Bodies whose compressed form fits in this limit get an exact `Content-Length`; larger
    /// or slower bodies are streamed without one. Zero disables the look-ahead.
    pub fn buffer_limit(mut self, limit: usize) -> Self {
        self.config.buffer_limit = limit;
        self
    }

    /// Sets how many idle compressors are kept for reuse.
    pub fn pool_capacity(mut self, capacity: usize) -> Self {
        self.config.pool_capacity = capacity;
        self
    }
}

impl Default for Lz4Layer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for Lz4Layer {
    type Service = Lz4Service<S>;

    fn layer(&self, inner: S) -> Self::Service {
        let pool = Arc::new(CompressorPool::new(self.config.pool_capacity));
        Lz4Service::new(inner, Arc::new(self.config.clone()), pool)
    }
}
