// This module contains the host list resolver: a priority-sorted chain of
// providers that turn one opaque spec string into a `HostInfoList`.
mod file;
mod string;

// Re-exports.
pub use file::FromFile;
pub use string::FromString;

use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_PORT: &str = "22";

/// Describes a single target host.
///
/// `host` is the network target, `alias` the display/dedup key (they may
/// differ); `user` and `cmd` override the job-wide defaults when set.
/// `index` is the position after dedup and is what presenters key on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInfo {
    pub host: String,
    pub alias: String,
    pub port: String,
    pub user: Option<String>,
    pub cmd: Option<String>,
    pub index: usize,
}

/// Ordered, alias-deduplicated collection of `HostInfo`.
pub type HostInfoList = Vec<HostInfo>;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Use `{prefer}` to get hostlist is not implemented.\nAvailable: {available}")]
    UnknownPrefer { prefer: String, available: String },
    #[error("List is empty.")]
    EmptyList,
    #[error("Cannot Get Host List!")]
    NoProvider,
    #[error("No such file: {0}")]
    NoSuchFile(String),
    #[error("read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
}

/// A provider turns the spec string it was built from into a host list.
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// `0` has a higher priority over `1`.
    fn priority(&self) -> i32;

    fn fetch(&self) -> Result<HostInfoList, ResolveError>;

    /// When true, the chain stops here even on failure. A provider should
    /// return true when the spec can only be meant for it, e.g. a spec that
    /// is clearly a filename.
    fn should_break(&self) -> bool {
        false
    }

    /// Optional post-processing once the common filter has run.
    fn post_filter(&self, list: HostInfoList) -> HostInfoList {
        list
    }
}

pub type ProviderCtor = fn(&str) -> Box<dyn Provider>;

/// Removes entries with an empty or `#`-prefixed alias, dedups by alias and
/// reassigns `index` by surviving position. Applying it twice equals
/// applying it once.
pub fn filter(list: HostInfoList) -> HostInfoList {
    let mut seen = HashSet::new();
    let mut out = HostInfoList::with_capacity(list.len());
    for mut info in list {
        if info.alias.is_empty() || info.alias.starts_with('#') {
            continue;
        }
        if !seen.insert(info.alias.clone()) {
            continue;
        }
        info.index = out.len();
        out.push(info);
    }
    out
}

fn reindex(list: &mut HostInfoList) {
    for (index, info) in list.iter_mut().enumerate() {
        info.index = index;
    }
}

/// Resolves host specs through registered providers. Bundled providers are
/// `file` and `string`; site-specific ones are added with `register`. The
/// first successful resolution is cached for the lifetime of the value.
pub struct Resolver {
    ctors: Vec<(&'static str, ProviderCtor)>,
    cache: Option<HostInfoList>,
}

impl Resolver {
    pub fn new() -> Self {
        let mut resolver = Self {
            ctors: Vec::new(),
            cache: None,
        };
        resolver.register("file", |spec| Box::new(FromFile::new(spec)));
        resolver.register("string", |spec| Box::new(FromString::new(spec)));
        resolver
    }

    /// Adds a provider constructor. Registration happens before the first
    /// resolution; later registrations simply never get a chance to win the
    /// cached result.
    pub fn register(&mut self, name: &'static str, ctor: ProviderCtor) {
        self.ctors.push((name, ctor));
    }

    /// Returns `name(priority)` for every registered provider, sorted by
    /// priority.
    pub fn available(&self) -> Vec<String> {
        let mut instances: Vec<_> = self
            .ctors
            .iter()
            .map(|(name, ctor)| (*name, ctor("").priority()))
            .collect();
        instances.sort_by_key(|(_, priority)| *priority);
        instances
            .into_iter()
            .map(|(name, priority)| format!("{}({})", name, priority))
            .collect()
    }

    /// Returns the final host list, using the cached result if there is one.
    pub fn resolve(
        &mut self,
        spec: &str,
        prefer: Option<&str>,
    ) -> Result<HostInfoList, ResolveError> {
        if let Some(list) = &self.cache {
            if !list.is_empty() {
                return Ok(list.clone());
            }
        }
        let list = self.resolve_uncached(spec, prefer)?;
        self.cache = Some(list.clone());
        Ok(list)
    }

    /// Returns the final host list, bypassing the cache.
    pub fn resolve_uncached(
        &self,
        spec: &str,
        prefer: Option<&str>,
    ) -> Result<HostInfoList, ResolveError> {
        if let Some(prefer) = prefer.filter(|p| !p.is_empty()) {
            // the preferred provider is authoritative
            let ctor = self
                .ctors
                .iter()
                .find(|(name, _)| *name == prefer)
                .map(|(_, ctor)| ctor)
                .ok_or_else(|| ResolveError::UnknownPrefer {
                    prefer: prefer.to_string(),
                    available: self.available().join(", "),
                })?;
            return Self::attempt(&*ctor(spec));
        }

        let mut providers: Vec<_> = self.ctors.iter().map(|(_, ctor)| ctor(spec)).collect();
        providers.sort_by_key(|provider| provider.priority());

        let mut last_err = ResolveError::NoProvider;
        for provider in providers {
            match Self::attempt(&*provider) {
                Ok(list) => {
                    debug!(provider = provider.name(), hosts = list.len(), "resolved");
                    return Ok(list);
                }
                Err(err) => {
                    if provider.should_break() {
                        return Err(err);
                    }
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    fn attempt(provider: &dyn Provider) -> Result<HostInfoList, ResolveError> {
        let list = provider.fetch()?;
        let list = filter(list);
        let mut list = provider.post_filter(list);
        reindex(&mut list);
        if list.is_empty() {
            return Err(ResolveError::EmptyList);
        }
        Ok(list)
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}
