use super::{FromString, HostInfoList, Provider, ResolveError};
use crate::util;

/// Reads a host list from a file; parsing is delegated to the `string`
/// provider.
pub struct FromFile {
    path: String,
}

impl FromFile {
    pub fn new(spec: &str) -> Self {
        Self {
            path: spec.to_string(),
        }
    }
}

impl Provider for FromFile {
    fn name(&self) -> &'static str {
        "file"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn fetch(&self) -> Result<HostInfoList, ResolveError> {
        let path = std::path::Path::new(&self.path);
        if !path.exists() {
            return Err(ResolveError::NoSuchFile(self.path.clone()));
        }
        let real = util::file_path(path).map_err(|_| ResolveError::NoSuchFile(self.path.clone()))?;
        let content = std::fs::read_to_string(&real).map_err(|source| ResolveError::Read {
            path: self.path.clone(),
            source,
        })?;
        FromString::new(&content).fetch()
    }

    /// A single-token spec that starts with "./", "/", "~/" or ".." can only
    /// mean a filename; in that case the chain must not fall through.
    fn should_break(&self) -> bool {
        let tokens = util::split_by_space(&self.path);
        tokens.len() == 1
            && (self.path.starts_with("./")
                || self.path.starts_with('/')
                || self.path.starts_with("~/")
                || self.path.starts_with(".."))
    }
}
