use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::catalog::Catalog;
use crate::fixture::{FixtureRegistry, Scope};
use crate::graph::analysis::dependency_order;
use crate::runner::context::RunContext;
use crate::runner::display::{format_event, format_run_header, format_summary};
use crate::runner::events::{EventLog, TracingSink};
use crate::runner::executor::TestRunner;
use crate::runner::reporter::Reporter;
use crate::runner::tasks::{TaskEnv, build_tasks};
use crate::task::TaskGraph;
use crate::tree::Suite;

/// Options for the `run` command.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub file: PathBuf,
    /// Overrides the catalogue's `max_parallelism`.
    pub jobs: Option<usize>,
    pub stop_on_failure: bool,
    pub force_disabled: bool,
    pub json: bool,
}

/// Output of the `run` command.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub text: String,
    pub success: bool,
}

#[derive(Debug, Serialize)]
struct FixtureInfo<'a> {
    name: &'a str,
    scope: Scope,
    dependencies: Vec<String>,
    builtin: bool,
    thread_affined: bool,
    used: usize,
}

#[derive(Debug, Serialize)]
struct PlanEntry {
    task: String,
    after_success_of: Vec<String>,
    after_completion_of: Vec<String>,
}

fn load(file: &Path) -> Result<(Catalog, FixtureRegistry), String> {
    let catalog = Catalog::from_path(file).map_err(|e| e.to_string())?;
    let registry = catalog
        .registry()
        .map_err(|e| located(file, e))?;
    Ok((catalog, registry))
}

fn located(file: &Path, error: impl std::fmt::Display) -> String {
    format!("{}: {error}", file.display())
}

/// Validate the registry and the suites, then build the task graph.
fn plan(
    file: &Path,
    catalog: &Catalog,
    registry: FixtureRegistry,
    suites: &[Suite],
) -> Result<TaskGraph<RunContext>, String> {
    registry.validate().map_err(|e| located(file, e))?;
    registry
        .check_fixtures_in_suites(suites)
        .map_err(|e| located(file, e))?;

    let include_disabled = catalog.config.force_disabled;
    let pre_run = registry
        .scheduled_for_pre_run(suites, include_disabled)
        .map_err(|e| located(file, e))?;
    let session = registry
        .scheduled_for_session(suites, &pre_run, include_disabled)
        .map_err(|e| located(file, e))?;
    let env = Arc::new(TaskEnv {
        registry: Arc::new(registry),
        reporter: Arc::new(Reporter::new(Arc::new(TracingSink))),
        force_disabled: include_disabled,
    });
    let graph = build_tasks(suites, &env, &session).map_err(|e| located(file, e))?;
    graph.check_dependencies().map_err(|e| located(file, e))?;
    Ok(graph)
}

/// Number of direct references to each fixture from tests and suite levels.
fn usage_counts(suites: &[Suite]) -> BTreeMap<String, usize> {
    fn walk(suite: &Suite, counts: &mut BTreeMap<String, usize>) {
        for name in suite.suite_fixtures() {
            *counts.entry(name).or_default() += 1;
        }
        for test in suite.tests() {
            for name in &test.params {
                *counts.entry(name.clone()).or_default() += 1;
            }
        }
        for sub in suite.suites() {
            walk(sub, counts);
        }
    }
    let mut counts = BTreeMap::new();
    for suite in suites {
        walk(suite, &mut counts);
    }
    counts
}

/// Run the `fixtures` command: list fixtures by scope, broadest first.
///
/// # Errors
///
/// Returns an error string if the catalogue cannot be loaded or a fixture
/// has an invalid dependency.
pub fn run_fixtures(file: &Path, json: bool) -> Result<String, String> {
    let (catalog, registry) = load(file)?;
    let counts = usage_counts(&catalog.suites());

    let mut infos = Vec::new();
    for scope in Scope::BROADEST_FIRST {
        for fixture in registry.fixtures().filter(|f| f.scope == scope) {
            let dependencies = registry
                .dependencies_of(&fixture.name)
                .map_err(|e| located(file, e))?;
            infos.push(FixtureInfo {
                name: &fixture.name,
                scope,
                dependencies,
                builtin: fixture.is_builtin(),
                thread_affined: fixture.thread_affined,
                used: counts.get(&fixture.name).copied().unwrap_or(0),
            });
        }
    }

    if json {
        return serde_json::to_string_pretty(&infos)
            .map_err(|e| format!("json serialization failed: {e}"));
    }

    let mut out = String::new();
    let mut current = None;
    for info in &infos {
        if current != Some(info.scope) {
            let _ = writeln!(out, "Fixtures with scope {}:", info.scope);
            current = Some(info.scope);
        }
        let mut line = format!("  {}", info.name);
        if info.builtin {
            line.push_str(" (builtin)");
        }
        if info.thread_affined {
            line.push_str(" (per worker)");
        }
        if !info.dependencies.is_empty() {
            let _ = write!(line, " -> {}", info.dependencies.join(", "));
        }
        let _ = writeln!(out, "{line}  used {} time(s)", info.used);
    }
    if infos.is_empty() {
        out.push_str("No fixtures.\n");
    }
    Ok(out)
}

/// Run the `check` command: validate fixtures, their usage, and the task
/// graph without running anything.
///
/// # Errors
///
/// Returns the first problem found.
pub fn run_check(file: &Path) -> Result<String, String> {
    let (catalog, registry) = load(file)?;
    let fixtures = registry.len();
    let suites = catalog.suites();
    let graph = plan(file, &catalog, registry, &suites)?;
    Ok(format!(
        "ok: {fixtures} fixture(s), {} test(s), {} task(s)",
        catalog.test_count(),
        graph.len()
    ))
}

/// Run the `plan` command: print the task graph, dependencies first.
///
/// # Errors
///
/// Returns an error string if validation or graph construction fails.
pub fn run_plan(file: &Path, json: bool) -> Result<String, String> {
    let (catalog, registry) = load(file)?;
    let suites = catalog.suites();
    let graph = plan(file, &catalog, registry, &suites)?;
    let order = dependency_order(&graph.dependency_graph())
        .map_err(|task| format!("{}: circular dependency through {task}", file.display()))?;

    let ids: Vec<_> = graph.ids().collect();
    let entries: Vec<PlanEntry> = order
        .into_iter()
        .map(|index| {
            let id = ids[index];
            PlanEntry {
                task: graph.label(id),
                after_success_of: graph.success_deps(id).iter().map(|&d| graph.label(d)).collect(),
                after_completion_of: graph
                    .completion_deps(id)
                    .iter()
                    .map(|&d| graph.label(d))
                    .collect(),
            }
        })
        .collect();

    if json {
        return serde_json::to_string_pretty(&entries)
            .map_err(|e| format!("json serialization failed: {e}"));
    }

    let mut out = String::new();
    for (i, entry) in entries.iter().enumerate() {
        let _ = writeln!(out, "[{}] {}", i + 1, entry.task);
        if !entry.after_success_of.is_empty() {
            let _ = writeln!(out, "      after success of: {}", entry.after_success_of.join(", "));
        }
        if !entry.after_completion_of.is_empty() {
            let _ = writeln!(
                out,
                "      after completion of: {}",
                entry.after_completion_of.join(", ")
            );
        }
    }
    Ok(out)
}

/// Run the `run` command: execute the catalogue's scripted callables on the
/// worker pool.
///
/// # Errors
///
/// Returns an error string if the catalogue is invalid or the run ends
/// abnormally. Test failures are reported through [`RunOutput::success`].
pub fn run_run(options: &RunOptions) -> Result<RunOutput, String> {
    let (catalog, registry) = load(&options.file)?;
    let mut config = catalog.config.clone();
    if let Some(jobs) = options.jobs {
        config.max_parallelism = jobs;
    }
    config.stop_on_failure |= options.stop_on_failure;
    config.force_disabled |= options.force_disabled;

    let suites = catalog.suites();
    let log = Arc::new(EventLog::new());
    let runner = TestRunner::with_sink(config, log.clone());
    let result = runner
        .run(&suites, registry)
        .map_err(|e| format!("run error: {e}"))?;

    let text = if options.json {
        serde_json::to_string_pretty(&result).map_err(|e| format!("json serialization failed: {e}"))?
    } else {
        let mut out = format_run_header(suites.len(), runner.config().max_parallelism);
        for line in log.events().iter().filter_map(format_event) {
            let _ = writeln!(out, "{line}");
        }
        out.push_str(&format_summary(&result));
        out.push('\n');
        out
    };
    Ok(RunOutput {
        text,
        success: result.success(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_catalog(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    const CATALOG: &str = r#"
fixtures:
  - name: db
    scope: session
  - name: user
    scope: test
    params: [db]
suites:
  - name: auth
    tests:
      - name: login
        params: [user]
      - name: logout
        depends_on: [auth.login]
"#;

    #[test]
    fn usage_counts_walk_the_tree() {
        let suites = Catalog::from_yaml_str(CATALOG).unwrap().suites();
        let counts = usage_counts(&suites);
        assert_eq!(counts.get("user"), Some(&1));
        assert_eq!(counts.get("db"), None);
    }

    #[test]
    fn fixtures_listed_broadest_first() {
        let dir = TempDir::new().unwrap();
        let path = write_catalog(&dir, "c.yaml", CATALOG);
        let output = run_fixtures(&path, false).unwrap();
        let session = output.find("scope session").unwrap();
        let test = output.find("scope test").unwrap();
        assert!(session < test);
        assert!(output.contains("  user -> db  used 1 time(s)"));
    }

    #[test]
    fn check_reports_counts() {
        let dir = TempDir::new().unwrap();
        let path = write_catalog(&dir, "c.yaml", CATALOG);
        let output = run_check(&path).unwrap();
        assert!(output.starts_with("ok: 2 fixture(s), 2 test(s)"));
    }

    #[test]
    fn plan_lists_dependencies_first() {
        let dir = TempDir::new().unwrap();
        let path = write_catalog(&dir, "c.yaml", CATALOG);
        let output = run_plan(&path, false).unwrap();
        let begin = output.find("beginning of suite 'auth'").unwrap();
        let login = output.find("] test 'auth.login'").unwrap();
        let logout = output.find("] test 'auth.logout'").unwrap();
        assert!(begin < login && login < logout);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = run_check(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(err.contains("failed to read"));
    }
}
