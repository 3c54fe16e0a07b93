//! Static file serving with byte-range support

use crate::error::{empty, json_error_response, BoxError, ProxyBody, ProxyErrorCode};
use futures::TryStreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Method, Response, StatusCode, Uri};
use percent_encoding::percent_decode_str;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};

/// Outcome of parsing a `Range` header against a file size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// No usable range, serve the whole file
    Full,
    /// Inclusive byte span
    Partial { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parse a single `bytes=start-end` range.
///
/// Malformed and multi-range headers are ignored and yield [`ByteRange::Full`].
pub fn parse_range(header: Option<&str>, size: u64) -> ByteRange {
    let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return ByteRange::Full;
    };
    if spec.contains(',') {
        return ByteRange::Full;
    }
    let Some((start, end)) = spec.split_once('-') else {
        return ByteRange::Full;
    };
    let (start, end) = (start.trim(), end.trim());

    let Some(last) = size.checked_sub(1) else {
        // Nothing can be satisfied in an empty file
        return if start.is_empty() && end.is_empty() {
            ByteRange::Full
        } else {
            ByteRange::Unsatisfiable
        };
    };

    if start.is_empty() {
        // Suffix range: the last N bytes
        return match end.parse::<u64>() {
            Ok(0) => ByteRange::Unsatisfiable,
            Ok(n) => ByteRange::Partial {
                start: size.saturating_sub(n),
                end: last,
            },
            Err(_) => ByteRange::Full,
        };
    }

    let Ok(start) = start.parse::<u64>() else {
        return ByteRange::Full;
    };
    let end = if end.is_empty() {
        last
    } else {
        match end.parse::<u64>() {
            Ok(end) => end.min(last),
            Err(_) => return ByteRange::Full,
        }
    };

    if start > end {
        ByteRange::Unsatisfiable
    } else {
        ByteRange::Partial { start, end }
    }
}

/// Lexically normalize a request path into a path relative to the served root.
/// `..` never climbs above the root.
fn normalize_request_path(raw: &str) -> PathBuf {
    let decoded = percent_decode_str(raw).decode_utf8_lossy();
    let mut normalized = PathBuf::new();
    for component in Path::new(decoded.as_ref()).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    normalized
}

fn io_error_response(path: &Path, e: &std::io::Error) -> Response<ProxyBody> {
    if e.kind() == ErrorKind::NotFound || is_not_a_directory(e) {
        return json_error_response(ProxyErrorCode::NotFound, "Not found");
    }
    error!(path = %path.display(), error = %e, "Failed to access file");
    json_error_response(ProxyErrorCode::InternalError, "Failed to read file")
}

#[cfg(unix)]
fn is_not_a_directory(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::ENOTDIR)
}

#[cfg(not(unix))]
fn is_not_a_directory(_e: &std::io::Error) -> bool {
    false
}

/// Serve `uri` from under `root`
pub async fn serve_path(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    root: &Path,
    index_names: &[String],
) -> Response<ProxyBody> {
    let root = match tokio::fs::canonicalize(root).await {
        Ok(root) => root,
        Err(e) => return io_error_response(root, &e),
    };

    let candidate = root.join(normalize_request_path(uri.path()));
    let resolved = match tokio::fs::canonicalize(&candidate).await {
        Ok(resolved) => resolved,
        Err(e) => return io_error_response(&candidate, &e),
    };

    // Symlinks may point anywhere; check the resolved absolute path
    if !resolved.starts_with(&root) {
        warn!(path = %resolved.display(), root = %root.display(), "Refusing path outside served root");
        return json_error_response(ProxyErrorCode::Forbidden, "Forbidden");
    }

    let metadata = match tokio::fs::metadata(&resolved).await {
        Ok(metadata) => metadata,
        Err(e) => return io_error_response(&resolved, &e),
    };

    if metadata.is_dir() {
        if !uri.path().ends_with('/') {
            let location = match uri.query() {
                Some(query) => format!("{}/?{}", uri.path(), query),
                None => format!("{}/", uri.path()),
            };
            return directory_redirect(&location);
        }
        return serve_index(method, headers, &root, &resolved, index_names).await;
    }

    if metadata.is_file() {
        return serve_file(method, headers, &resolved, metadata.len()).await;
    }

    error!(path = %resolved.display(), "Not a file or directory");
    json_error_response(ProxyErrorCode::InternalError, "Not a file or directory")
}

async fn serve_index(
    method: &Method,
    headers: &HeaderMap,
    root: &Path,
    dir: &Path,
    index_names: &[String],
) -> Response<ProxyBody> {
    for name in index_names {
        let Ok(index) = tokio::fs::canonicalize(dir.join(name)).await else {
            continue;
        };
        if !index.starts_with(root) {
            continue;
        }
        if let Ok(metadata) = tokio::fs::metadata(&index).await {
            if metadata.is_file() {
                return serve_file(method, headers, &index, metadata.len()).await;
            }
        }
    }
    debug!(path = %dir.display(), "No index file");
    json_error_response(ProxyErrorCode::NotFound, "Not found")
}

fn directory_redirect(location: &str) -> Response<ProxyBody> {
    match HeaderValue::from_str(location) {
        Ok(value) => Response::builder()
            .status(StatusCode::FOUND)
            .header(hyper::header::LOCATION, value)
            .body(empty())
            .expect("valid response builder"),
        Err(_) => json_error_response(ProxyErrorCode::NotFound, "Not found"),
    }
}

async fn serve_file(
    method: &Method,
    headers: &HeaderMap,
    path: &Path,
    size: u64,
) -> Response<ProxyBody> {
    let range_header = headers
        .get(hyper::header::RANGE)
        .and_then(|v| v.to_str().ok());

    let (status, start, len) = match parse_range(range_header, size) {
        ByteRange::Full => (StatusCode::OK, 0, size),
        ByteRange::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end - start + 1),
        ByteRange::Unsatisfiable => {
            let mut response = json_error_response(
                ProxyErrorCode::RangeNotSatisfiable,
                "Requested range not satisfiable",
            );
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", size)) {
                response
                    .headers_mut()
                    .insert(hyper::header::CONTENT_RANGE, value);
            }
            return response;
        }
    };

    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let mut builder = Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, mime.as_ref())
        .header(hyper::header::CONTENT_LENGTH, len)
        .header(hyper::header::ACCEPT_RANGES, "bytes");

    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            hyper::header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, start + len - 1, size),
        );
    }

    if method == Method::HEAD {
        return builder.body(empty()).expect("valid response builder");
    }

    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) => return io_error_response(path, &e),
    };
    if start > 0 {
        if let Err(e) = file.seek(SeekFrom::Start(start)).await {
            return io_error_response(path, &e);
        }
    }

    let stream = ReaderStream::new(file.take(len)).map_ok(Frame::data);
    let body = BodyExt::map_err(StreamBody::new(stream), BoxError::from).boxed();

    builder.body(body).expect("valid response builder")
}
