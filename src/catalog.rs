//! Declarative catalogue of fixtures and suites.
//!
//! A catalogue describes the shape of a test project (fixtures with their
//! scopes and dependencies, the suite tree, hooks, explicit dependencies)
//! without any real test code. Each callable is replaced by a scripted
//! [`Outcome`], which makes a catalogue enough to validate, plan and dry-run
//! a schedule.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fixture::{Fixture, FixtureError, FixtureRegistry, Provided, Scope};
use crate::runner::executor::RunConfig;
use crate::tree::{CallError, CallResult, Suite, Test};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML catalogue: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid JSON catalogue: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Fixture(#[from] FixtureError),
}

/// What a scripted callable does when invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    #[default]
    Pass,
    Fail,
    AbortSuite,
    AbortRun,
}

impl Outcome {
    fn result(self, what: &str) -> CallResult {
        match self {
            Self::Pass => Ok(()),
            Self::Fail => Err(CallError::failed(format!("{what} failed"))),
            Self::AbortSuite => Err(CallError::abort_suite(format!("{what} aborted its suite"))),
            Self::AbortRun => Err(CallError::abort_run(format!("{what} aborted the run"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureDecl {
    pub name: String,
    pub scope: Scope,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub thread_affined: bool,
    #[serde(default)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookDecl {
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestDecl {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteDecl {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub inject: Vec<String>,
    #[serde(default)]
    pub setup_suite: Option<HookDecl>,
    #[serde(default)]
    pub teardown_suite: Option<Outcome>,
    #[serde(default)]
    pub setup_test: Option<Outcome>,
    #[serde(default)]
    pub teardown_test: Option<Outcome>,
    #[serde(default)]
    pub tests: Vec<TestDecl>,
    #[serde(default)]
    pub suites: Vec<SuiteDecl>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Catalog {
    #[serde(default)]
    pub config: RunConfig,
    /// Builtin `pre_run` fixtures; each holds its own name as value.
    #[serde(default)]
    pub builtins: Vec<String>,
    #[serde(default)]
    pub fixtures: Vec<FixtureDecl>,
    #[serde(default)]
    pub suites: Vec<SuiteDecl>,
}

impl Catalog {
    /// Load a catalogue file; `.json` files are read as JSON, anything else
    /// as YAML.
    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let source = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_str(&source)
        } else {
            Self::from_yaml_str(&source)
        }
    }

    pub fn from_yaml_str(source: &str) -> Result<Self, CatalogError> {
        let catalog: Self = serde_yaml::from_str(source)?;
        catalog.checked()
    }

    pub fn from_json_str(source: &str) -> Result<Self, CatalogError> {
        let catalog: Self = serde_json::from_str(source)?;
        catalog.checked()
    }

    fn checked(self) -> Result<Self, CatalogError> {
        self.config
            .check()
            .map_err(|e| CatalogError::Config(e.to_string()))?;
        Ok(self)
    }

    /// Build a registry whose providers yield each fixture's name as a
    /// `String`, or fail as scripted.
    pub fn registry(&self) -> Result<FixtureRegistry, CatalogError> {
        let mut registry = FixtureRegistry::new();
        for name in &self.builtins {
            registry.add_builtin(name, name.clone());
        }
        for decl in &self.fixtures {
            let name = decl.name.clone();
            let outcome = decl.outcome;
            let mut fixture = Fixture::new(&decl.name, decl.scope, &decl.params, move |_| {
                outcome.result(&format!("fixture '{name}'"))?;
                Ok(Provided::value(name.clone()))
            })
            .with_aliases(&decl.aliases);
            if decl.thread_affined {
                fixture = fixture.with_thread_affinity();
            }
            registry.add(fixture)?;
        }
        Ok(registry)
    }

    pub fn suites(&self) -> Vec<Suite> {
        self.suites.iter().map(build_suite).collect()
    }

    pub fn test_count(&self) -> usize {
        fn count(suite: &SuiteDecl) -> usize {
            suite.tests.len() + suite.suites.iter().map(count).sum::<usize>()
        }
        self.suites.iter().map(count).sum()
    }
}

fn build_suite(decl: &SuiteDecl) -> Suite {
    let mut suite = Suite::new(&decl.name).with_inject(&decl.inject);
    if let Some(description) = &decl.description {
        suite = suite.with_description(description);
    }
    if let Some(hook) = &decl.setup_suite {
        let outcome = hook.outcome;
        suite = suite.with_setup_suite(&hook.params, move |_| outcome.result("suite setup"));
    }
    if let Some(outcome) = decl.teardown_suite {
        suite = suite.with_teardown_suite(move |_| outcome.result("suite teardown"));
    }
    if let Some(outcome) = decl.setup_test {
        suite = suite.with_setup_test(move |_, test| outcome.result(&format!("setup of test '{test}'")));
    }
    if let Some(outcome) = decl.teardown_test {
        suite = suite
            .with_teardown_test(move |_, test| outcome.result(&format!("teardown of test '{test}'")));
    }
    for test in &decl.tests {
        suite = suite.with_test(build_test(test));
    }
    for sub in &decl.suites {
        suite = suite.with_suite(build_suite(sub));
    }
    suite
}

fn build_test(decl: &TestDecl) -> Test {
    let outcome = decl.outcome;
    let label = format!("test '{}'", decl.name);
    let mut test = Test::new(&decl.name, move |_| outcome.result(&label))
        .with_params(&decl.params)
        .with_dependencies(&decl.depends_on);
    if let Some(description) = &decl.description {
        test = test.with_description(description);
    }
    if decl.disabled {
        test = test.disabled();
    }
    test
}
