//! LZ4 HTTP compression middleware for Tower.
//!
//! This crate provides a Tower layer that compresses HTTP response bodies into the LZ4 frame
//! format when the client lists `lz4` in its `Accept-Encoding` header, and can decompress
//! `lz4` encoded request bodies before they reach the inner service.
//!
//! # Example
//!
//! ```ignore
//! use http_lz4_compression::Lz4Layer;
//! use tower::ServiceBuilder;
//!
//! let service = ServiceBuilder::new()
//!     .layer(
//!         Lz4Layer::new()
//!             .excluded_extensions([".png", ".jpg"])
//!             .decompress_requests(),
//!     )
//!     .service(my_service);
//! ```
//!
//! # Compression Rules
//!
//! The middleware will **not** compress responses when:
//! - `Accept-Encoding` does not list `lz4` with a non-zero quality
//! - the request method is `HEAD`
//! - `Connection` requests a protocol upgrade
//! - the request or response `Content-Type` is `text/event-stream`
//! - the request path has an excluded extension, is an excluded path, starts with an excluded
//!   prefix or matches an excluded pattern
//! - `Content-Encoding` or `Content-Range` is already set on the response
//! - the response status never carries a body (1xx, 204, 304)
//!
//! Compressors are pooled and reused across requests. Each response gets a complete frame of
//! its own.
//!
//! # Response Modifications
//!
//! When compression is applied:
//! - `Content-Encoding` is set to `lz4`
//! - `Content-Length` is replaced by the compressed length when the whole body was available
//!   within the buffer limit, and removed otherwise
//! - `Accept-Ranges` is removed
//! - `Vary` includes `Accept-Encoding`
//!
//! # Request Decompression
//!
//! With [`Lz4Layer::decompress_requests`] or [`Lz4Layer::decompress_with`], requests carrying
//! `Content-Encoding: lz4` reach the inner service with a [`DecompressionBody`]. Decoding is
//! lazy: a malformed body surfaces as a [`DecompressError`] from the read that reaches it, and
//! [`DecompressError::status`] gives the status to answer with.

#![deny(missing_docs)]

mod body;
mod codec;
mod decompress;
mod error;
mod future;
mod layer;
mod policy;
mod pool;
mod service;

pub use body::CompressionBody;
pub use codec::LZ4_ENCODING;
pub use decompress::{DecompressHook, DecompressionBody, default_decompress};
pub use error::{BoxError, DecompressError};
pub use future::ResponseFuture;
pub use layer::{DEFAULT_BUFFER_LIMIT, Lz4Layer};
pub use policy::ExclusionPolicy;
pub use pool::DEFAULT_POOL_CAPACITY;
pub use service::Lz4Service;
