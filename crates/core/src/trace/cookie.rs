//! Append-only cookie log.
//!
//! One cookie token per line. The file is only ever appended to, so every
//! historical cookie stays inspectable; the last line is the resume point.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::models::Cookie;

#[derive(Debug, Clone)]
pub struct CookieFile {
    path: PathBuf,
}

impl CookieFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The most recently appended cookie, if the file exists and has one.
    pub fn last(&self) -> std::io::Result<Option<Cookie>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .and_then(Cookie::from_token))
    }

    /// Append `cookie` as a new line, creating the file if needed.
    pub fn append(&self, cookie: &Cookie) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", cookie.to_token())?;
        file.flush()?;
        debug!(path = %self.path.display(), "appended cookie");
        Ok(())
    }
}
