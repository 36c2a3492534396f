//! Matching errors by kind.
//!
//! Predicates (breaker ignore-lists, retry include/exclude filters, fallback
//! selection) classify failures by the concrete type of an error or of any
//! error in its `source()` chain. The position in that chain is the "depth"
//! of a match: depth zero is the error itself, and a smaller depth is a
//! closer match.

use std::borrow::Cow;
use std::error::Error;
use std::fmt;

use dashmap::DashMap;
use tracing::warn;

type Test = fn(&(dyn Error + 'static)) -> bool;

/// Recognises one kind of error.
#[derive(Clone)]
pub struct ErrorMatcher {
    name: Cow<'static, str>,
    test: Test,
}

impl ErrorMatcher {
    /// Matches errors whose concrete type is `E`.
    pub fn of<E: Error + 'static>() -> Self {
        Self {
            name: Cow::Borrowed(std::any::type_name::<E>()),
            test: |err| err.is::<E>(),
        }
    }

    /// Matches errors accepted by an arbitrary test, e.g. an `io::ErrorKind`.
    pub fn new(name: impl Into<Cow<'static, str>>, test: Test) -> Self {
        Self {
            name: name.into(),
            test,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The last path segment of the name, e.g. `Timeout` for `my_crate::io::Timeout`.
    pub fn short_name(&self) -> &str {
        let name = self.name.split('<').next().unwrap_or(&self.name);
        name.rsplit("::").next().unwrap_or(name)
    }

    /// Returns how far down the `source()` chain of `err` this matcher first matches.
    pub fn depth_in(&self, err: &(dyn Error + 'static)) -> Option<usize> {
        let mut current = Some(err);
        let mut depth = 0;
        while let Some(e) = current {
            if (self.test)(e) {
                return Some(depth);
            }
            current = e.source();
            depth += 1;
        }
        None
    }

    pub fn matches(&self, err: &(dyn Error + 'static)) -> bool {
        self.depth_in(err).is_some()
    }
}

impl fmt::Debug for ErrorMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ErrorMatcher").field(&self.name).finish()
    }
}

impl PartialEq for ErrorMatcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ErrorMatcher {}

/// An order-independent set of [`ErrorMatcher`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorSet {
    matchers: Vec<ErrorMatcher>,
}

impl ErrorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of<E: Error + 'static>() -> Self {
        Self::new().with::<E>()
    }

    pub fn with<E: Error + 'static>(self) -> Self {
        self.with_matcher(ErrorMatcher::of::<E>())
    }

    pub fn with_matcher(mut self, matcher: ErrorMatcher) -> Self {
        if let Err(pos) = self
            .matchers
            .binary_search_by(|m| m.name.as_ref().cmp(matcher.name()))
        {
            self.matchers.insert(pos, matcher);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.matchers.iter().map(ErrorMatcher::name)
    }

    /// The smallest depth at which any member matches `err`.
    pub fn closest(&self, err: &(dyn Error + 'static)) -> Option<usize> {
        self.matchers.iter().filter_map(|m| m.depth_in(err)).min()
    }

    pub fn matches(&self, err: &(dyn Error + 'static)) -> bool {
        self.matchers.iter().any(|m| m.matches(err))
    }
}

impl FromIterator<ErrorMatcher> for ErrorSet {
    fn from_iter<I: IntoIterator<Item = ErrorMatcher>>(iter: I) -> Self {
        iter.into_iter()
            .fold(ErrorSet::new(), |set, m| set.with_matcher(m))
    }
}

/// Resolves error kind names supplied by configuration.
///
/// Applications register the error types they want to refer to by name;
/// both the full type path and its last segment resolve.
#[derive(Debug, Default)]
pub struct ErrorCatalog {
    by_name: DashMap<String, ErrorMatcher>,
}

impl ErrorCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: Error + 'static>(&self) -> &Self {
        self.register_matcher(ErrorMatcher::of::<E>())
    }

    pub fn register_matcher(&self, matcher: ErrorMatcher) -> &Self {
        let short = matcher.short_name().to_owned();
        if short != matcher.name() {
            self.by_name.insert(short, matcher.clone());
        }
        self.by_name.insert(matcher.name().to_owned(), matcher);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<ErrorMatcher> {
        self.by_name.get(name.trim()).map(|m| m.value().clone())
    }

    /// Resolves every name, skipping (and logging) names nobody registered.
    pub fn resolve_all<'a>(&self, names: impl IntoIterator<Item = &'a String>) -> ErrorSet {
        names
            .into_iter()
            .filter_map(|name| {
                let resolved = self.resolve(name);
                if resolved.is_none() {
                    warn!(error_kind = %name, "unknown error kind in configuration, ignored");
                }
                resolved
            })
            .collect()
    }
}
