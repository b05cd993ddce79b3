use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::registry::push_unique;
use super::{FIXTURE_NAME_PARAM, Fixture, FixtureArgs, FixtureError, FixtureRegistry, FixtureValue, Release, Scope};
use crate::task::WorkerId;

struct Resolved {
    value: FixtureValue,
    release: Option<Release>,
}

enum Slot {
    Idle,
    Ready(Resolved),
    /// Thread-affined fixture: one value per worker, created on first use.
    PerWorker(Vec<(WorkerId, Resolved)>),
}

enum Lookup {
    Found(FixtureValue),
    Create(Arc<Fixture>),
    NotSetUp,
    NotOwned,
}

/// The fixtures of one scope instance, in dependency order, with their
/// computed values.
///
/// Sets form a chain (test → suite → session → pre_run) through weak parent
/// links: a value the set does not own is looked up in its ancestors.
pub struct ScheduledFixtures {
    scope: Scope,
    fixtures: Vec<Arc<Fixture>>,
    parent: Option<Weak<ScheduledFixtures>>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl ScheduledFixtures {
    /// Schedule the fixtures of `scope` needed by `direct`: the direct names
    /// and their transitive dependencies, filtered to `scope`.
    pub fn for_scope(
        registry: &FixtureRegistry,
        scope: Scope,
        direct: &[String],
        parent: Option<&Arc<ScheduledFixtures>>,
    ) -> Result<Arc<Self>, FixtureError> {
        let mut names = Vec::new();
        for name in direct {
            for dep in registry.dependencies_of(name)? {
                push_unique(&mut names, dep);
            }
        }
        for name in direct {
            push_unique(&mut names, name.clone());
        }

        let fixtures: Vec<Arc<Fixture>> = names
            .iter()
            .filter_map(|name| registry.get(name))
            .filter(|fixture| fixture.scope == scope)
            .cloned()
            .collect();
        let slots = fixtures
            .iter()
            .map(|fixture| (fixture.name.clone(), Slot::Idle))
            .collect();

        Ok(Arc::new(Self {
            scope,
            fixtures,
            parent: parent.map(Arc::downgrade),
            slots: Mutex::new(slots),
        }))
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Owned fixture names in dependency order.
    pub fn fixture_names(&self) -> Vec<&str> {
        self.fixtures.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn has_fixture(&self, name: &str) -> bool {
        self.fixtures.iter().any(|f| f.name == name)
    }

    pub fn len(&self) -> usize {
        self.fixtures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }

    /// One setup/teardown pair per owned fixture, in dependency order.
    ///
    /// Callers set up in list order and tear down in reverse.
    pub fn setup_teardown_pairs(self: &Arc<Self>) -> Vec<FixturePair> {
        self.fixtures
            .iter()
            .map(|fixture| FixturePair {
                owner: Arc::clone(self),
                name: fixture.name.clone(),
            })
            .collect()
    }

    /// Value of `name` for `worker`, searching the parent chain when this
    /// set does not own the fixture.
    pub fn get(&self, name: &str, worker: WorkerId) -> Result<FixtureValue, FixtureError> {
        let lookup = {
            let slots = self.slots.lock();
            match slots.get(name) {
                None => Lookup::NotOwned,
                Some(Slot::Idle) => Lookup::NotSetUp,
                Some(Slot::Ready(resolved)) => Lookup::Found(Arc::clone(&resolved.value)),
                Some(Slot::PerWorker(values)) => {
                    match values.iter().find(|(owner, _)| *owner == worker) {
                        Some((_, resolved)) => Lookup::Found(Arc::clone(&resolved.value)),
                        None => match self.owned(name) {
                            Some(fixture) => Lookup::Create(Arc::clone(fixture)),
                            None => Lookup::NotOwned,
                        },
                    }
                }
            }
        };

        match lookup {
            Lookup::Found(value) => Ok(value),
            Lookup::Create(fixture) => self.create_for_worker(&fixture, worker),
            Lookup::NotSetUp => Err(FixtureError::Internal(format!(
                "fixture '{name}' ({} scope) has not been set up",
                self.scope
            ))),
            Lookup::NotOwned => match self.parent()? {
                Some(parent) => parent.get(name, worker),
                None => Err(FixtureError::Lookup(format!(
                    "cannot find fixture '{name}' in any scheduled scope"
                ))),
            },
        }
    }

    /// Values for `names` keyed by name.
    pub fn get_many<S: AsRef<str>>(
        &self,
        names: &[S],
        worker: WorkerId,
    ) -> Result<FixtureArgs, FixtureError> {
        let mut args = FixtureArgs::new();
        for name in names {
            let name = name.as_ref();
            args.insert(name, self.get(name, worker)?);
        }
        Ok(args)
    }

    fn parent(&self) -> Result<Option<Arc<ScheduledFixtures>>, FixtureError> {
        match &self.parent {
            None => Ok(None),
            Some(weak) => weak.upgrade().map(Some).ok_or_else(|| {
                FixtureError::Internal(format!(
                    "parent of the {} fixture set is gone",
                    self.scope
                ))
            }),
        }
    }

    fn owned(&self, name: &str) -> Option<&Arc<Fixture>> {
        self.fixtures.iter().find(|f| f.name == name)
    }

    fn setup(&self, name: &str, worker: WorkerId) -> Result<(), FixtureError> {
        let Some(fixture) = self.owned(name) else {
            return Err(FixtureError::Internal(format!(
                "fixture '{name}' is not scheduled in the {} scope",
                self.scope
            )));
        };
        if !matches!(self.slots.lock().get(name), Some(Slot::Idle)) {
            return Err(FixtureError::Internal(format!(
                "fixture '{name}' has already been set up"
            )));
        }

        let slot = if fixture.thread_affined {
            Slot::PerWorker(Vec::new())
        } else {
            Slot::Ready(self.compute(fixture, worker)?)
        };
        debug!(fixture = name, scope = %self.scope, "fixture set up");
        self.slots.lock().insert(name.to_owned(), slot);
        Ok(())
    }

    fn teardown(&self, name: &str) -> Result<(), FixtureError> {
        let previous = {
            let mut slots = self.slots.lock();
            match slots.get_mut(name) {
                None => {
                    return Err(FixtureError::Internal(format!(
                        "fixture '{name}' is not scheduled in the {} scope",
                        self.scope
                    )));
                }
                Some(slot) => std::mem::replace(slot, Slot::Idle),
            }
        };

        let result = match previous {
            Slot::Idle => Err(FixtureError::Internal(format!(
                "cannot tear down fixture '{name}', it has not been set up"
            ))),
            Slot::Ready(resolved) => release(name, resolved),
            Slot::PerWorker(values) => values
                .into_iter()
                .rev()
                .map(|(_, resolved)| release(name, resolved))
                .fold(Ok(()), |acc, r| acc.and(r)),
        };
        debug!(fixture = name, scope = %self.scope, "fixture torn down");
        result
    }

    /// Resolve the fixture's parameters and call its provider.
    ///
    /// Runs without holding the slot lock, since parameters may live in this
    /// same set.
    fn compute(&self, fixture: &Fixture, worker: WorkerId) -> Result<Resolved, FixtureError> {
        let mut args = FixtureArgs::new();
        for param in &fixture.params {
            if param == FIXTURE_NAME_PARAM {
                args.insert(param.as_str(), Arc::new(fixture.name.clone()));
            } else {
                args.insert(param.as_str(), self.get(param, worker)?);
            }
        }
        let (value, release) = fixture
            .provide(&args)
            .map_err(|e| FixtureError::Setup {
                fixture: fixture.name.clone(),
                message: e.to_string(),
            })?
            .into_parts();
        Ok(Resolved { value, release })
    }

    fn create_for_worker(
        &self,
        fixture: &Fixture,
        worker: WorkerId,
    ) -> Result<FixtureValue, FixtureError> {
        let resolved = self.compute(fixture, worker)?;
        let value = Arc::clone(&resolved.value);
        let mut slots = self.slots.lock();
        match slots.get_mut(&fixture.name) {
            Some(Slot::PerWorker(values)) => {
                debug!(fixture = %fixture.name, %worker, "thread-affined fixture created");
                values.push((worker, resolved));
                Ok(value)
            }
            _ => {
                drop(slots);
                release(&fixture.name, resolved)?;
                Err(FixtureError::Internal(format!(
                    "fixture '{}' was torn down while being created",
                    fixture.name
                )))
            }
        }
    }
}

fn release(name: &str, resolved: Resolved) -> Result<(), FixtureError> {
    match resolved.release {
        Some(action) => action().map_err(|e| FixtureError::Teardown {
            fixture: name.to_owned(),
            message: e.to_string(),
        }),
        None => Ok(()),
    }
}

impl Drop for ScheduledFixtures {
    fn drop(&mut self) {
        let slots = self.slots.get_mut();
        for fixture in self.fixtures.iter().rev() {
            let leftover = match slots.remove(&fixture.name) {
                Some(Slot::Ready(resolved)) => vec![resolved],
                Some(Slot::PerWorker(values)) => values.into_iter().rev().map(|(_, r)| r).collect(),
                _ => continue,
            };
            for resolved in leftover {
                if resolved.release.is_some() {
                    warn!(fixture = %fixture.name, "releasing fixture that was never torn down");
                }
                if let Err(e) = release(&fixture.name, resolved) {
                    warn!(error = %e, "fixture release failed");
                }
            }
        }
    }
}

impl fmt::Debug for ScheduledFixtures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledFixtures")
            .field("scope", &self.scope)
            .field("fixtures", &self.fixture_names())
            .finish_non_exhaustive()
    }
}

/// Setup and teardown handle for one fixture of a scheduled set.
#[derive(Debug, Clone)]
pub struct FixturePair {
    owner: Arc<ScheduledFixtures>,
    name: String,
}

impl FixturePair {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> Scope {
        self.owner.scope
    }

    /// Compute the value. Fails with [`FixtureError::Internal`] if it is
    /// already set up.
    pub fn setup(&self, worker: WorkerId) -> Result<(), FixtureError> {
        self.owner.setup(&self.name, worker)
    }

    /// Release the value. Fails with [`FixtureError::Internal`] if it is not
    /// set up.
    pub fn teardown(&self) -> Result<(), FixtureError> {
        self.owner.teardown(&self.name)
    }
}
