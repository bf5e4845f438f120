use std::io::{Error, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use url::Url;

use crate::*;

/// A handler which reads files below a given root directory, as raw bytes (`Vec<u8>`).
///
/// The location is everything after `scheme://`, percent-decoded, so `res://textures/grass%20tile.png` reads
/// `<root>/textures/grass tile.png`.  As with any relative path, `/` is the separator (behavior with `\` is undefined),
/// and a best effort is made to disallow locations which use `..` to escape the root, primarily as a measure to detect
/// bugs.
#[derive(Debug)]
pub struct FilesystemHandler {
    root_path: PathBuf,
    location: Option<PathBuf>,
    loaded: AtomicBool,
}

fn conv_path(location: &str) -> Result<relative_path::RelativePathBuf, HandlerError> {
    let decoded = percent_decode_str(location)
        .decode_utf8()
        .map_err(|_| HandlerError::InvalidLocation(format!("`{}` is not valid utf-8", location)))?;
    let trimmed = decoded.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(HandlerError::InvalidLocation("empty path".into()));
    }
    Ok(relative_path::RelativePathBuf::from(trimmed))
}

impl FilesystemHandler {
    pub fn new(root_path: &Path) -> FilesystemHandler {
        FilesystemHandler {
            root_path: root_path.to_path_buf(),
            location: None,
            loaded: AtomicBool::new(false),
        }
    }

    /// A factory for [SchemeTable::register_with], producing handlers rooted at `root_path`.
    pub fn factory(root_path: &Path) -> impl Fn() -> Box<dyn ResourceHandler> + Send + Sync + 'static {
        let root_path = root_path.to_path_buf();
        move || -> Box<dyn ResourceHandler> { Box::new(FilesystemHandler::new(&root_path)) }
    }

    /// The file this handler reads, once initialized.
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Whether a load has succeeded since the last release.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    fn path(&self) -> Result<&Path, HandlerError> {
        self.location
            .as_deref()
            .ok_or_else(|| HandlerError::Io(Error::new(ErrorKind::Other, "handler was never initialized")))
    }

    fn finish(&self, bytes: Vec<u8>) -> Resource {
        self.loaded.store(true, Ordering::Release);
        Arc::new(bytes)
    }
}

#[async_trait]
impl ResourceHandler for FilesystemHandler {
    fn initialize(&mut self, uri: &Url) -> Result<(), HandlerError> {
        // For `res://a/b`, `a` parses as the host, but it's still part of the path for us.
        let location = format!("{}{}", uri.host_str().unwrap_or(""), uri.path());

        // Go via `RelativePathBuf` to clean up `.` and `..` segments before checking we're still under the root.
        let absolute = conv_path(&location)?.to_logical_path(&self.root_path);
        if !absolute.starts_with(&self.root_path) || absolute == self.root_path {
            return Err(HandlerError::InvalidLocation(format!(
                "`{}` is outside the root directory",
                location
            )));
        }

        self.location = Some(absolute);
        Ok(())
    }

    fn load(&self) -> Result<Resource, HandlerError> {
        let bytes = std::fs::read(self.path()?)?;
        Ok(self.finish(bytes))
    }

    async fn load_async(&self) -> Result<Resource, HandlerError> {
        let bytes = tokio::fs::read(self.path()?).await?;
        Ok(self.finish(bytes))
    }

    fn release(&self) {
        // The bytes are owned by the cache and its callers, so there's nothing to hand back; just forget we loaded.
        self.loaded.store(false, Ordering::Release);
    }
}
