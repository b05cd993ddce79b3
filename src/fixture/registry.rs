use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::{FIXTURE_NAME_PARAM, Fixture, FixtureError, Scope, ScheduledFixtures};
use crate::tree::Suite;

/// Name → definition map of every fixture known to a run.
#[derive(Debug, Default, Clone)]
pub struct FixtureRegistry {
    fixtures: BTreeMap<String, Arc<Fixture>>,
}

impl FixtureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fixture under its name and each of its aliases.
    ///
    /// Re-registering an ordinary fixture replaces it; a builtin cannot be
    /// replaced.
    pub fn add(&mut self, fixture: Fixture) -> Result<(), FixtureError> {
        if let Some(name) = fixture.names().find(|n| self.is_builtin(n)) {
            return Err(FixtureError::ConstraintViolation(format!(
                "'{name}' is a builtin fixture name"
            )));
        }
        for name in fixture.names() {
            if self.fixtures.contains_key(name) {
                warn!(fixture = name, "overriding previously registered fixture");
            }
            self.fixtures
                .insert(name.to_owned(), Arc::new(fixture.renamed(name)));
        }
        Ok(())
    }

    /// Register a `pre_run` constant that no later fixture may shadow.
    pub fn add_builtin<T: Any + Send + Sync>(&mut self, name: &str, value: T) {
        debug!(fixture = name, "registering builtin fixture");
        self.fixtures
            .insert(name.to_owned(), Arc::new(Fixture::builtin(name, Arc::new(value))));
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Fixture>> {
        self.fixtures.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fixtures.contains_key(name)
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.fixtures.get(name).is_some_and(|f| f.is_builtin())
    }

    pub fn scope_of(&self, name: &str) -> Option<Scope> {
        self.fixtures.get(name).map(|f| f.scope)
    }

    /// Registered names in lexicographic order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fixtures.keys().map(String::as_str)
    }

    pub fn fixtures(&self) -> impl Iterator<Item = &Arc<Fixture>> {
        self.fixtures.values()
    }

    pub fn len(&self) -> usize {
        self.fixtures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixtures.is_empty()
    }

    /// Transitive dependencies of `name`, each listed after its own
    /// dependencies, duplicates removed keeping the first occurrence.
    ///
    /// `name` itself is not part of the result.
    pub fn dependencies_of(&self, name: &str) -> Result<Vec<String>, FixtureError> {
        if !self.fixtures.contains_key(name) {
            return Err(FixtureError::ConstraintViolation(format!(
                "fixture '{name}' does not exist"
            )));
        }
        let mut path = Vec::new();
        self.collect_dependencies(name, &mut path)
    }

    fn collect_dependencies(
        &self,
        name: &str,
        path: &mut Vec<String>,
    ) -> Result<Vec<String>, FixtureError> {
        let Some(fixture) = self.fixtures.get(name) else {
            return Err(FixtureError::ConstraintViolation(format!(
                "fixture '{name}' does not exist"
            )));
        };
        path.push(name.to_owned());

        let mut ordered: Vec<String> = Vec::new();
        for param in fixture.dependencies() {
            if path.iter().any(|p| p == param) {
                let mut cycle = path.clone();
                cycle.push(param.to_owned());
                return Err(FixtureError::ConstraintViolation(format!(
                    "fixture '{}' has a circular dependency: {}",
                    path[0],
                    cycle.join(" -> ")
                )));
            }
            if !self.fixtures.contains_key(param) {
                return Err(FixtureError::ConstraintViolation(format!(
                    "fixture '{param}' used by fixture '{name}' does not exist"
                )));
            }
            for dep in self.collect_dependencies(param, path)? {
                push_unique(&mut ordered, dep);
            }
        }
        for param in fixture.dependencies() {
            push_unique(&mut ordered, param.to_owned());
        }

        path.pop();
        Ok(ordered)
    }

    /// Check the registry as a whole.
    ///
    /// Checks run in order and stop at the first problem: reserved names,
    /// missing and circular dependencies, then per fixture its thread
    /// affinity and the scope of each direct dependency.
    pub fn validate(&self) -> Result<(), FixtureError> {
        if self.fixtures.contains_key(FIXTURE_NAME_PARAM) {
            return Err(FixtureError::ConstraintViolation(format!(
                "'{FIXTURE_NAME_PARAM}' is a reserved fixture name"
            )));
        }

        for name in self.fixtures.keys() {
            self.dependencies_of(name)?;
        }

        for fixture in self.fixtures.values() {
            if fixture.thread_affined && fixture.scope != Scope::Session {
                return Err(FixtureError::ConstraintViolation(format!(
                    "thread-affined fixture '{}' must have scope 'session', not '{}'",
                    fixture.name, fixture.scope
                )));
            }
            for dep_name in fixture.dependencies() {
                let Some(dep) = self.fixtures.get(dep_name) else {
                    continue;
                };
                if dep.scope < fixture.scope {
                    return Err(FixtureError::ConstraintViolation(format!(
                        "fixture '{}' with scope '{}' is incompatible with scope '{}' of fixture '{}'",
                        fixture.name, fixture.scope, dep.scope, dep.name
                    )));
                }
                if dep.thread_affined && fixture.scope != Scope::Test {
                    return Err(FixtureError::ConstraintViolation(format!(
                        "fixture '{}' with scope '{}' cannot depend on thread-affined fixture '{}'",
                        fixture.name, fixture.scope, dep.name
                    )));
                }
            }
        }

        debug!(fixtures = self.fixtures.len(), "fixture registry is valid");
        Ok(())
    }

    /// Fixture names referenced directly by the suites, their tests, and
    /// their sub-suites, in first-seen order.
    pub fn fixtures_used_by(suites: &[Suite], include_disabled: bool) -> Vec<String> {
        let mut used = Vec::new();
        for suite in suites {
            for name in suite.fixtures_used(include_disabled) {
                push_unique(&mut used, name);
            }
        }
        used
    }

    /// Check that every fixture referenced by the tree exists and is
    /// usable where it is referenced.
    pub fn check_fixtures_in_suites(&self, suites: &[Suite]) -> Result<(), FixtureError> {
        for suite in suites {
            self.check_fixtures_in_suite(suite)?;
        }
        Ok(())
    }

    fn check_fixtures_in_suite(&self, suite: &Suite) -> Result<(), FixtureError> {
        for name in suite.suite_fixtures() {
            let Some(fixture) = self.fixtures.get(&name) else {
                return Err(FixtureError::ConstraintViolation(format!(
                    "unknown fixture '{name}' used in suite '{}'",
                    suite.path()
                )));
            };
            if fixture.scope < Scope::Suite {
                return Err(FixtureError::ConstraintViolation(format!(
                    "fixture '{name}' with scope '{}' cannot be used at the level of suite '{}'",
                    fixture.scope,
                    suite.path()
                )));
            }
            if fixture.thread_affined {
                return Err(FixtureError::ConstraintViolation(format!(
                    "thread-affined fixture '{name}' cannot be used at the level of suite '{}'",
                    suite.path()
                )));
            }
        }

        for test in suite.tests() {
            if let Some(name) = test.params.iter().find(|p| !self.contains(p)) {
                return Err(FixtureError::ConstraintViolation(format!(
                    "unknown fixture '{name}' used in test '{}'",
                    test.path()
                )));
            }
        }

        for sub in suite.suites() {
            self.check_fixtures_in_suite(sub)?;
        }
        Ok(())
    }

    /// The `pre_run` set for a whole run.
    pub fn scheduled_for_pre_run(
        &self,
        suites: &[Suite],
        include_disabled: bool,
    ) -> Result<Arc<ScheduledFixtures>, FixtureError> {
        let used = Self::fixtures_used_by(suites, include_disabled);
        ScheduledFixtures::for_scope(self, Scope::PreRun, &used, None)
    }

    /// The `session` set for a whole run, chained to the `pre_run` set.
    pub fn scheduled_for_session(
        &self,
        suites: &[Suite],
        pre_run: &Arc<ScheduledFixtures>,
        include_disabled: bool,
    ) -> Result<Arc<ScheduledFixtures>, FixtureError> {
        let used = Self::fixtures_used_by(suites, include_disabled);
        ScheduledFixtures::for_scope(self, Scope::Session, &used, Some(pre_run))
    }

    /// The `suite` set for one suite level, chained to the session set.
    pub fn scheduled_for_suite(
        &self,
        suite: &Suite,
        session: &Arc<ScheduledFixtures>,
        include_disabled: bool,
    ) -> Result<Arc<ScheduledFixtures>, FixtureError> {
        let used = suite.level_fixtures(include_disabled);
        ScheduledFixtures::for_scope(self, Scope::Suite, &used, Some(session))
    }

    /// The `test` set for one test, chained to its suite's set.
    pub fn scheduled_for_test(
        &self,
        params: &[String],
        suite: &Arc<ScheduledFixtures>,
    ) -> Result<Arc<ScheduledFixtures>, FixtureError> {
        ScheduledFixtures::for_scope(self, Scope::Test, params, Some(suite))
    }
}

pub(crate) fn push_unique(list: &mut Vec<String>, name: String) {
    if !list.contains(&name) {
        list.push(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::Provided;
    use crate::tree::{Suite, Test};

    fn fixture(name: &str, scope: Scope, params: &[&str]) -> Fixture {
        Fixture::new(name, scope, params.iter().copied(), |_| Ok(Provided::value(())))
    }

    fn registry(fixtures: Vec<Fixture>) -> FixtureRegistry {
        let mut registry = FixtureRegistry::new();
        for f in fixtures {
            registry.add(f).unwrap();
        }
        registry
    }

    fn err_message(result: Result<(), FixtureError>) -> String {
        result.unwrap_err().to_string()
    }

    #[test]
    fn dependencies_are_ordered_and_deduplicated() {
        let registry = registry(vec![
            fixture("a", Scope::Test, &["b", "c"]),
            fixture("b", Scope::Test, &["d"]),
            fixture("c", Scope::Test, &["d"]),
            fixture("d", Scope::Test, &[]),
        ]);
        assert_eq!(registry.dependencies_of("a").unwrap(), vec!["d", "b", "c"]);
        assert_eq!(registry.dependencies_of("d").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn dependencies_ignore_fixture_name_param() {
        let registry = registry(vec![
            fixture("a", Scope::Test, &["fixture_name", "b"]),
            fixture("b", Scope::Test, &[]),
        ]);
        assert_eq!(registry.dependencies_of("a").unwrap(), vec!["b"]);
    }

    #[test]
    fn missing_dependency_names_both_fixtures() {
        let registry = registry(vec![fixture("a", Scope::Test, &["b"])]);
        let err = registry.dependencies_of("a").unwrap_err();
        assert_eq!(
            err,
            FixtureError::ConstraintViolation(
                "fixture 'b' used by fixture 'a' does not exist".into()
            )
        );
    }

    #[test]
    fn circular_dependency_reports_path() {
        let registry = registry(vec![
            fixture("a", Scope::Test, &["b"]),
            fixture("b", Scope::Test, &["c"]),
            fixture("c", Scope::Test, &["a"]),
        ]);
        let err = registry.dependencies_of("a").unwrap_err().to_string();
        assert!(err.contains("circular dependency"), "{err}");
        assert!(err.contains("a -> b -> c -> a"), "{err}");
    }

    #[test]
    fn self_dependency_is_circular() {
        let registry = registry(vec![fixture("a", Scope::Test, &["a"])]);
        assert!(
            registry
                .dependencies_of("a")
                .unwrap_err()
                .to_string()
                .contains("a -> a")
        );
    }

    #[test]
    fn aliases_register_every_name() {
        let registry = registry(vec![
            fixture("user", Scope::Session, &[]).with_aliases(["admin"]),
        ]);
        assert!(registry.contains("user"));
        assert_eq!(registry.get("admin").unwrap().name, "admin");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn adding_twice_overrides() {
        let registry = registry(vec![
            fixture("db", Scope::Test, &[]),
            fixture("db", Scope::Session, &[]),
        ]);
        assert_eq!(registry.scope_of("db"), Some(Scope::Session));
    }

    #[test]
    fn builtin_cannot_be_overridden() {
        let mut registry = FixtureRegistry::new();
        registry.add_builtin("cli_args", vec!["--fast".to_string()]);
        assert_eq!(registry.scope_of("cli_args"), Some(Scope::PreRun));
        let err = registry.add(fixture("cli_args", Scope::Test, &[])).unwrap_err();
        assert!(err.to_string().contains("builtin"));
        let err = registry
            .add(fixture("other", Scope::Test, &[]).with_aliases(["cli_args"]))
            .unwrap_err();
        assert!(err.to_string().contains("builtin"));
        assert!(!registry.contains("other"));
    }

    #[test]
    fn validate_rejects_reserved_name() {
        let registry = registry(vec![fixture("fixture_name", Scope::Test, &[])]);
        assert!(err_message(registry.validate()).contains("reserved"));
    }

    #[test]
    fn validate_rejects_narrower_dependency() {
        let registry = registry(vec![
            fixture("a", Scope::Session, &["b"]),
            fixture("b", Scope::Test, &[]),
        ]);
        assert_eq!(
            err_message(registry.validate()),
            "constraint violation: fixture 'a' with scope 'session' is incompatible with scope 'test' of fixture 'b'"
        );
    }

    #[test]
    fn validate_reports_missing_before_scope() {
        let registry = registry(vec![
            fixture("a", Scope::Session, &["b", "missing"]),
            fixture("b", Scope::Test, &[]),
        ]);
        assert!(err_message(registry.validate()).contains("'missing' used by fixture 'a'"));
    }

    #[test]
    fn validate_accepts_broader_dependency() {
        let registry = registry(vec![
            fixture("a", Scope::Test, &["b"]),
            fixture("b", Scope::Session, &["c"]),
            fixture("c", Scope::PreRun, &[]),
        ]);
        registry.validate().unwrap();
    }

    #[test]
    fn thread_affined_fixture_requires_session_scope() {
        let registry = registry(vec![fixture("conn", Scope::Suite, &[]).with_thread_affinity()]);
        assert!(err_message(registry.validate()).contains("must have scope 'session'"));
    }

    #[test]
    fn validate_reports_missing_before_thread_affinity() {
        let registry = registry(vec![
            fixture("conn", Scope::Suite, &[]).with_thread_affinity(),
            fixture("cursor", Scope::Test, &["missing"]),
        ]);
        assert!(err_message(registry.validate()).contains("'missing' used by fixture 'cursor'"));
    }

    #[test]
    fn only_test_fixtures_may_depend_on_thread_affined() {
        let ok = registry(vec![
            fixture("conn", Scope::Session, &[]).with_thread_affinity(),
            fixture("cursor", Scope::Test, &["conn"]),
        ]);
        ok.validate().unwrap();

        let bad = registry(vec![
            fixture("conn", Scope::Session, &[]).with_thread_affinity(),
            fixture("pool", Scope::Session, &["conn"]),
        ]);
        assert!(err_message(bad.validate()).contains("thread-affined fixture 'conn'"));
    }

    fn tree() -> Vec<Suite> {
        vec![
            Suite::new("a")
                .with_setup_suite(["db"], |_| Ok(()))
                .with_test(Test::new("t1", |_| Ok(())).with_params(["user"]))
                .with_test(Test::new("t2", |_| Ok(())).with_params(["tmp"]).disabled())
                .with_suite(
                    Suite::new("b")
                        .with_inject(["cache"])
                        .with_test(Test::new("t3", |_| Ok(())).with_params(["user", "db"])),
                ),
        ]
    }

    #[test]
    fn fixtures_used_by_walks_tree() {
        assert_eq!(
            FixtureRegistry::fixtures_used_by(&tree(), false),
            vec!["db", "user", "cache"]
        );
        assert_eq!(
            FixtureRegistry::fixtures_used_by(&tree(), true),
            vec!["db", "user", "tmp", "cache"]
        );
    }

    #[test]
    fn check_fixtures_in_suites_reports_unknown_test_fixture() {
        let registry = registry(vec![
            fixture("db", Scope::Session, &[]),
            fixture("cache", Scope::Suite, &[]),
            fixture("tmp", Scope::Test, &[]),
        ]);
        assert_eq!(
            err_message(registry.check_fixtures_in_suites(&tree())),
            "constraint violation: unknown fixture 'user' used in test 'a.t1'"
        );
    }

    #[test]
    fn check_fixtures_in_suites_rejects_test_scope_at_suite_level() {
        let registry = registry(vec![
            fixture("db", Scope::Session, &[]),
            fixture("cache", Scope::Test, &[]),
            fixture("user", Scope::Test, &[]),
            fixture("tmp", Scope::Test, &[]),
        ]);
        let err = err_message(registry.check_fixtures_in_suites(&tree()));
        assert!(err.contains("fixture 'cache' with scope 'test'"), "{err}");
        assert!(err.contains("suite 'a.b'"), "{err}");
    }

    #[test]
    fn check_fixtures_in_suites_rejects_thread_affined_at_suite_level() {
        let registry = registry(vec![
            fixture("db", Scope::Session, &[]).with_thread_affinity(),
            fixture("cache", Scope::Suite, &[]),
            fixture("user", Scope::Test, &[]),
            fixture("tmp", Scope::Test, &[]),
        ]);
        assert!(err_message(registry.check_fixtures_in_suites(&tree())).contains("thread-affined"));
    }

    #[test]
    fn scheduled_sets_filter_by_scope() {
        let registry = registry(vec![
            fixture("cli", Scope::PreRun, &[]),
            fixture("db", Scope::Session, &["cli"]),
            fixture("cache", Scope::Suite, &["db"]),
            fixture("user", Scope::Test, &["cache"]),
            fixture("tmp", Scope::Test, &[]),
        ]);
        let suites = tree();
        let pre_run = registry.scheduled_for_pre_run(&suites, false).unwrap();
        assert_eq!(pre_run.fixture_names(), vec!["cli"]);
        let session = registry
            .scheduled_for_session(&suites, &pre_run, false)
            .unwrap();
        assert_eq!(session.fixture_names(), vec!["db"]);
        let suite = registry
            .scheduled_for_suite(&suites[0], &session, false)
            .unwrap();
        assert_eq!(suite.fixture_names(), vec!["cache"]);
        let nested = registry
            .scheduled_for_suite(&suites[0].suites()[0], &session, false)
            .unwrap();
        assert_eq!(nested.fixture_names(), vec!["cache"]);
        let test = registry
            .scheduled_for_test(&["user".to_string()], &nested)
            .unwrap();
        assert_eq!(test.fixture_names(), vec!["user"]);
    }
}
