pub mod registry;
pub mod scheduled;

mod error;

use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::tree::CallError;

pub use error::FixtureError;
pub use registry::FixtureRegistry;
pub use scheduled::{FixturePair, ScheduledFixtures};

/// Reserved parameter name: a fixture declaring it receives its own name.
pub const FIXTURE_NAME_PARAM: &str = "fixture_name";

/// Lifetime level at which a fixture value is shared.
///
/// Variants are declared narrowest first, so the derived ordering matches
/// scope levels: `Test < Suite < Session < PreRun`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Test,
    Suite,
    Session,
    PreRun,
}

impl Scope {
    /// All scopes, broadest first.
    pub const BROADEST_FIRST: [Scope; 4] = [Scope::PreRun, Scope::Session, Scope::Suite, Scope::Test];

    /// Numeric level: 1 for `test` up to 4 for `pre_run`.
    pub fn level(self) -> u8 {
        match self {
            Self::Test => 1,
            Self::Suite => 2,
            Self::Session => 3,
            Self::PreRun => 4,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Test => write!(f, "test"),
            Self::Suite => write!(f, "suite"),
            Self::Session => write!(f, "session"),
            Self::PreRun => write!(f, "pre_run"),
        }
    }
}

impl FromStr for Scope {
    type Err = FixtureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test" => Ok(Self::Test),
            "suite" => Ok(Self::Suite),
            "session" => Ok(Self::Session),
            "pre_run" => Ok(Self::PreRun),
            other => Err(FixtureError::ConstraintViolation(format!(
                "invalid fixture scope '{other}' (expected: test, suite, session, pre_run)"
            ))),
        }
    }
}

/// A computed fixture value, shared between every consumer of its scope instance.
pub type FixtureValue = Arc<dyn Any + Send + Sync>;

/// Release action of a two-phase fixture, run once at teardown.
pub type Release = Box<dyn FnOnce() -> Result<(), CallError> + Send>;

/// Callable producing a fixture value from its resolved parameters.
pub type Provider = Arc<dyn Fn(&FixtureArgs) -> Result<Provided, CallError> + Send + Sync>;

/// What a provider hands back.
///
/// A `Resource` carries the release action that pairs with its setup; the
/// action is `FnOnce`, so a fixture can never be released twice.
pub enum Provided {
    Immediate(FixtureValue),
    Resource(FixtureValue, Option<Release>),
}

impl Provided {
    /// Wrap a plain value.
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Self::Immediate(Arc::new(value))
    }

    /// Wrap a value together with the action that releases it.
    pub fn resource<T, F>(value: T, release: F) -> Self
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<(), CallError> + Send + 'static,
    {
        Self::Resource(Arc::new(value), Some(Box::new(release)))
    }

    pub(crate) fn into_parts(self) -> (FixtureValue, Option<Release>) {
        match self {
            Self::Immediate(value) => (value, None),
            Self::Resource(value, release) => (value, release),
        }
    }
}

impl fmt::Debug for Provided {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Immediate(_) => write!(f, "Provided::Immediate(..)"),
            Self::Resource(_, release) => {
                write!(f, "Provided::Resource(.., release: {})", release.is_some())
            }
        }
    }
}

/// A fixture definition.
#[derive(Clone)]
pub struct Fixture {
    pub name: String,
    /// Extra names under which the same provider is registered.
    pub aliases: Vec<String>,
    pub scope: Scope,
    /// Parameter names, in declaration order.
    pub params: Vec<String>,
    /// Computed once per worker thread instead of once per scope instance.
    pub thread_affined: bool,
    builtin: bool,
    provider: Provider,
}

impl Fixture {
    /// Create a fixture from its provider.
    pub fn new<P, F>(name: impl Into<String>, scope: Scope, params: P, provider: F) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        F: Fn(&FixtureArgs) -> Result<Provided, CallError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            scope,
            params: params.into_iter().map(Into::into).collect(),
            thread_affined: false,
            builtin: false,
            provider: Arc::new(provider),
        }
    }

    /// A `pre_run` constant that user fixtures cannot shadow.
    pub(crate) fn builtin(name: impl Into<String>, value: FixtureValue) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            scope: Scope::PreRun,
            params: Vec::new(),
            thread_affined: false,
            builtin: true,
            provider: Arc::new(move |_| Ok(Provided::Immediate(value.clone()))),
        }
    }

    /// Register the provider under additional names.
    pub fn with_aliases<A>(mut self, aliases: A) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
    {
        self.aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    /// Compute one value per worker thread.
    pub fn with_thread_affinity(mut self) -> Self {
        self.thread_affined = true;
        self
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    /// Parameters naming other fixtures (everything but `fixture_name`).
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.params
            .iter()
            .map(String::as_str)
            .filter(|p| *p != FIXTURE_NAME_PARAM)
    }

    /// Every name this definition is registered under.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    pub(crate) fn renamed(&self, name: &str) -> Self {
        Self {
            name: name.to_owned(),
            aliases: Vec::new(),
            ..self.clone()
        }
    }

    pub(crate) fn provide(&self, args: &FixtureArgs) -> Result<Provided, CallError> {
        (self.provider)(args)
    }
}

impl fmt::Debug for Fixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fixture")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("scope", &self.scope)
            .field("params", &self.params)
            .field("thread_affined", &self.thread_affined)
            .field("builtin", &self.builtin)
            .finish_non_exhaustive()
    }
}

/// Fixture values bound by parameter name.
#[derive(Clone, Default)]
pub struct FixtureArgs {
    values: BTreeMap<String, FixtureValue>,
}

impl FixtureArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FixtureValue) {
        self.values.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// The raw, type-erased value.
    pub fn value(&self, name: &str) -> Option<&FixtureValue> {
        self.values.get(name)
    }

    /// Downcast the value bound to `name`.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Failed`] if nothing is bound under `name` or the
    /// value is not a `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, CallError> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| CallError::failed(format!("no fixture value bound to '{name}'")))?;
        Arc::clone(value).downcast::<T>().map_err(|_| {
            CallError::failed(format!(
                "fixture '{name}' does not hold a value of type {}",
                type_name::<T>()
            ))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for FixtureArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}
