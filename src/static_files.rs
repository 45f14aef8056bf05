//! Static file serving for [`RouteRegister::static_files`] and
//! [`RouteRegister::file`](crate::RouteRegister::file).
//!
//! [`RouteRegister::static_files`]: crate::RouteRegister::static_files

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use hyper::header;

use crate::context::Context;
use crate::error::{Error, HttpError, Result};
use crate::handler::Handler;
use crate::http::Body;

const INDEX_FILE: &str = "index.html";

/// A handler serving the wildcard parameter `*` as a path below `root`.
pub(crate) fn handler(root: PathBuf) -> Handler {
    Handler::named("weft::static_files", move |c: &mut Context| {
        let path = resolve(&root, c.param("*")).ok_or_else(HttpError::not_found)?;
        serve_file(c, &path)
    })
}

/// Joins a request-supplied relative path onto `root`, refusing anything
/// that could leave it.
pub(crate) fn resolve(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(path)
}

/// Streams the file at `path`; a directory serves its `index.html`.
pub(crate) fn serve_file(c: &mut Context, path: &Path) -> Result<()> {
    let mut path = path.to_path_buf();
    let mut metadata = fs::metadata(&path).map_err(not_found)?;
    if metadata.is_dir() {
        path.push(INDEX_FILE);
        metadata = fs::metadata(&path).map_err(not_found)?;
    }
    if !metadata.is_file() {
        return Err(HttpError::not_found().into());
    }

    let file = File::open(&path).map_err(not_found)?;
    c.response_mut().headers_mut().insert(
        header::CONTENT_LENGTH,
        header::HeaderValue::from(metadata.len()),
    );
    c.stream(200, content_type(&path), Body::wrap_reader(file))
}

fn not_found(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => HttpError::not_found().into(),
        _ => err.into(),
    }
}

/// Content type by file extension.
pub(crate) fn content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match extension.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml; charset=utf-8",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}
