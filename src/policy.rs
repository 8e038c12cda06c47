use crate::codec;
use http::Request;
use http::header::{self, HeaderMap};
use regex::Regex;
use std::collections::HashSet;

/// Decides which requests may have their responses compressed.
///
/// The policy is built once by [`Lz4Layer`](crate::Lz4Layer) and shared read-only by every
/// request afterwards.
#[derive(Debug, Clone, Default)]
pub struct ExclusionPolicy {
    extensions: HashSet<String>,
    paths: HashSet<String>,
    prefixes: Vec<String>,
    regexes: Vec<Regex>,
}

impl ExclusionPolicy {
    /// Creates a policy that excludes nothing beyond the header checks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the response to `req` may be compressed.
    ///
    /// Checks run in order and stop at the first exclusion:
    /// - `Accept-Encoding` must list `lz4`
    /// - `Connection` must not request a protocol upgrade
    /// - `Content-Type` must not be `text/event-stream`
    /// - the path extension, exact path, path prefix and path patterns must not be excluded
    pub fn eligible<B>(&self, req: &Request<B>) -> bool {
        let headers = req.headers();
        if !codec::accepts_lz4(headers) || is_upgrade(headers) || is_event_stream(headers) {
            return false;
        }

        let path = req.uri().path();
        if extension(path).is_some_and(|ext| self.extensions.contains(ext)) {
            return false;
        }
        if self.paths.contains(path) {
            return false;
        }
        if self.prefixes.iter().any(|prefix| path.starts_with(prefix.as_str())) {
            return false;
        }
        if self.regexes.iter().any(|re| re.is_match(path)) {
            return false;
        }

        true
    }

    pub(crate) fn exclude_extensions<I, S>(&mut self, extensions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions.extend(extensions.into_iter().map(|ext| {
            let ext = ext.into();
            if ext.starts_with('.') {
                ext
            } else {
                format!(".{ext}")
            }
        }));
    }

    pub(crate) fn exclude_paths<I, S>(&mut self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths.extend(paths.into_iter().map(Into::into));
    }

    pub(crate) fn exclude_path_prefixes<I, S>(&mut self, prefixes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefixes.extend(prefixes.into_iter().map(Into::into));
    }

    pub(crate) fn exclude_path_regexes<I>(&mut self, regexes: I)
    where
        I: IntoIterator<Item = Regex>,
    {
        self.regexes.extend(regexes);
    }
}

/// Returns the extension of the last path segment, dot included (`/a/b.png` -> `.png`).
fn extension(path: &str) -> Option<&str> {
    let segment = path.rsplit('/').next().unwrap_or(path);
    segment.rfind('.').map(|idx| &segment[idx..])
}

/// Checks if the `Connection` header asks for a protocol upgrade.
fn is_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Checks if the `Content-Type` header names an event stream.
pub(crate) fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("text/event-stream"))
}
