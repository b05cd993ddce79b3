//! Property tests for fixture dependency resolution over random acyclic
//! registries.

use std::collections::HashSet;

use proptest::prelude::*;

use quiche::{Fixture, FixtureRegistry, Provided, Scope};

fn name(index: usize) -> String {
    format!("f{index:02}")
}

/// Fixture `i` may only depend on fixtures `0..i`, so the graph is acyclic.
fn arb_dependencies() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1usize..12).prop_flat_map(|count| {
        (0..count)
            .map(|i| proptest::sample::subsequence((0..i).collect::<Vec<_>>(), 0..=i))
            .collect::<Vec<_>>()
    })
}

fn registry(dependencies: &[Vec<usize>]) -> FixtureRegistry {
    let mut registry = FixtureRegistry::new();
    for (i, deps) in dependencies.iter().enumerate() {
        let fixture = Fixture::new(
            name(i),
            Scope::Session,
            deps.iter().map(|&d| name(d)),
            |_| Ok(Provided::value(())),
        );
        registry.add(fixture).unwrap();
    }
    registry
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn acyclic_registries_validate(dependencies in arb_dependencies()) {
        prop_assert!(registry(&dependencies).validate().is_ok());
    }

    #[test]
    fn dependencies_are_unique_and_ordered(dependencies in arb_dependencies()) {
        let registry = registry(&dependencies);
        for i in 0..dependencies.len() {
            let resolved = registry.dependencies_of(&name(i)).unwrap();

            let unique: HashSet<_> = resolved.iter().collect();
            prop_assert_eq!(unique.len(), resolved.len());
            prop_assert!(!resolved.contains(&name(i)));

            for (position, dependency) in resolved.iter().enumerate() {
                for inner in registry.dependencies_of(dependency).unwrap() {
                    let inner_position = resolved.iter().position(|r| *r == inner);
                    prop_assert!(
                        inner_position.is_some_and(|p| p < position),
                        "{} must precede {} in {:?}",
                        inner,
                        dependency,
                        resolved
                    );
                }
            }
        }
    }

    #[test]
    fn direct_dependencies_are_always_resolved(dependencies in arb_dependencies()) {
        let registry = registry(&dependencies);
        for (i, deps) in dependencies.iter().enumerate() {
            let resolved = registry.dependencies_of(&name(i)).unwrap();
            for &d in deps {
                prop_assert!(resolved.contains(&name(d)));
            }
        }
    }
}
