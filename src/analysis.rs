//! Build-time dependency analysis.
//!
//! Runs exactly once, when the container materializes. Links every declared
//! dependency to its record (the topmost decorator of the target type),
//! verifies the scope hierarchy, rejects cycles, computes the transitive
//! context flags, assigns dense per-role ids, and emits the
//! should-be-Singleton advisory.

use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;
use tracing::warn;

use crate::constructor::ConstructorSpec;
use crate::error::{AnalysisFault, BuildError};
use crate::key::{DepKey, ServiceKey};
use crate::lifetime::Lifetime;
use crate::locator::{DepRef, LocatorRecord};

/// How a registration participates in resolution.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Role {
    Service,
    Decorator,
}

/// A validated registration awaiting analysis.
#[derive(Clone)]
pub(crate) struct PendingRecord {
    pub(crate) spec: ConstructorSpec,
    pub(crate) lifetime: Lifetime,
    pub(crate) role: Role,
    pub(crate) seq: u64,
}

/// The frozen outcome of analysis, ready to start a locator.
pub(crate) struct BuildPlan {
    pub(crate) records: Vec<Arc<LocatorRecord>>,
    pub(crate) entry: HashMap<ServiceKey, usize, RandomState>,
    pub(crate) singleton_count: usize,
    pub(crate) per_context_count: usize,
}

pub(crate) fn analyze(
    pending: Vec<PendingRecord>,
    silence: bool,
) -> Result<BuildPlan, BuildError> {
    let count = pending.len();

    let mut base_of: HashMap<ServiceKey, usize> = HashMap::with_capacity(count);
    let mut decorators_of: HashMap<ServiceKey, Vec<usize>> = HashMap::new();
    for (index, record) in pending.iter().enumerate() {
        match record.role {
            Role::Service => {
                base_of.insert(record.spec.key, index);
            }
            Role::Decorator => {
                decorators_of.entry(record.spec.key).or_default().push(index);
            }
        }
    }

    for (key, decorators) in &decorators_of {
        if !base_of.contains_key(key) {
            let record = &pending[decorators[0]];
            return Err(analysis_error(
                record,
                AnalysisFault::NothingToDecorate(key.type_name()),
            ));
        }
    }

    // Chain per type: base first, then decorators in registration order.
    // The topmost decorator is the resolution entry for the type.
    let mut chain_of: HashMap<ServiceKey, Vec<usize>> = HashMap::with_capacity(base_of.len());
    let mut entry: HashMap<ServiceKey, usize, RandomState> =
        HashMap::with_capacity_and_hasher(base_of.len(), RandomState::new());
    for (&key, &base) in &base_of {
        let mut chain = vec![base];
        if let Some(decorators) = decorators_of.get(&key) {
            chain.extend(decorators.iter().copied());
        }
        if let Some(&top) = chain.last() {
            entry.insert(key, top);
        }
        chain_of.insert(key, chain);
    }

    let linked = link_dependencies(&pending, &chain_of, &entry)?;

    if !silence {
        check_hierarchy(&pending, &linked)?;
    }
    check_cycles(&pending, &linked)?;

    let flags = context_flags(&pending, &linked);
    if !silence {
        for (index, record) in pending.iter().enumerate() {
            let (depends_on_context, all_singleton) = flags[index];
            if record.lifetime < Lifetime::Singleton && !depends_on_context && all_singleton {
                warn!(
                    service = record.spec.key.type_name(),
                    lifetime = %record.lifetime,
                    "service ignores its scope and only depends on Singletons; \
                     it should be a Singleton"
                );
            }
        }
    }

    let mut singleton_count = 0u32;
    let mut per_context_count = 0u32;
    let mut records = Vec::with_capacity(count);
    for ((index, record), dependencies) in pending.into_iter().enumerate().zip(linked) {
        let slot = match record.lifetime {
            Lifetime::Singleton => {
                let slot = singleton_count;
                singleton_count += 1;
                slot
            }
            Lifetime::PerContext => {
                let slot = per_context_count;
                per_context_count += 1;
                slot
            }
            Lifetime::Transient => 0,
        };
        records.push(Arc::new(LocatorRecord {
            key: record.spec.key,
            lifetime: record.lifetime,
            kind: record.spec.kind,
            index,
            slot,
            dependencies,
            depends_on_context: flags[index].0,
            call: record.spec.call,
        }));
    }

    Ok(BuildPlan {
        records,
        entry,
        singleton_count: singleton_count as usize,
        per_context_count: per_context_count as usize,
    })
}

fn link_dependencies(
    pending: &[PendingRecord],
    chain_of: &HashMap<ServiceKey, Vec<usize>>,
    entry: &HashMap<ServiceKey, usize, RandomState>,
) -> Result<Vec<Vec<DepRef>>, BuildError> {
    let mut linked = Vec::with_capacity(pending.len());

    for (index, record) in pending.iter().enumerate() {
        let mut dependencies = Vec::with_capacity(record.spec.dependencies.len());
        for dep in &record.spec.dependencies {
            match dep {
                DepKey::Scope => dependencies.push(DepRef::Scope),
                DepKey::Service(key) if is_self_dependency(record, *key) => {
                    // A decorator's dependency on its own type resolves to
                    // the next lower link, never back to the chain top.
                    let link = chain_of
                        .get(key)
                        .and_then(|chain| {
                            let position = chain.iter().position(|&i| i == index)?;
                            chain.get(position.checked_sub(1)?).copied()
                        });
                    match link {
                        Some(lower) => dependencies.push(DepRef::Record(lower)),
                        None => {
                            return Err(analysis_error(
                                record,
                                AnalysisFault::NothingToDecorate(key.type_name()),
                            ))
                        }
                    }
                }
                DepKey::Service(key) => match entry.get(key) {
                    Some(&target) => dependencies.push(DepRef::Record(target)),
                    None => {
                        return Err(analysis_error(
                            record,
                            AnalysisFault::NotFound(key.type_name()),
                        ))
                    }
                },
            }
        }
        linked.push(dependencies);
    }

    Ok(linked)
}

fn is_self_dependency(record: &PendingRecord, key: ServiceKey) -> bool {
    matches!(record.role, Role::Decorator) && key == record.spec.key
}

fn check_hierarchy(
    pending: &[PendingRecord],
    linked: &[Vec<DepRef>],
) -> Result<(), BuildError> {
    for (index, record) in pending.iter().enumerate() {
        for dep in &linked[index] {
            if let DepRef::Record(target) = dep {
                let required = &pending[*target];
                if record.lifetime > required.lifetime {
                    return Err(analysis_error(
                        record,
                        AnalysisFault::ScopeHierarchy {
                            dependent: record.spec.key.type_name(),
                            dependent_lifetime: record.lifetime,
                            required: required.spec.key.type_name(),
                            required_lifetime: required.lifetime,
                        },
                    ));
                }
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    White,
    Gray,
    Black,
}

fn check_cycles(pending: &[PendingRecord], linked: &[Vec<DepRef>]) -> Result<(), BuildError> {
    let mut colors = vec![Visit::White; pending.len()];
    for root in 0..pending.len() {
        if colors[root] == Visit::White {
            visit(root, pending, linked, &mut colors)?;
        }
    }
    Ok(())
}

fn visit(
    node: usize,
    pending: &[PendingRecord],
    linked: &[Vec<DepRef>],
    colors: &mut Vec<Visit>,
) -> Result<(), BuildError> {
    colors[node] = Visit::Gray;
    for dep in &linked[node] {
        if let DepRef::Record(target) = dep {
            match colors[*target] {
                Visit::Gray => {
                    return Err(analysis_error(
                        &pending[node],
                        AnalysisFault::Circular {
                            type_name: pending[node].spec.key.type_name(),
                            dependency: pending[*target].spec.key.type_name(),
                        },
                    ));
                }
                Visit::White => visit(*target, pending, linked, colors)?,
                Visit::Black => {}
            }
        }
    }
    colors[node] = Visit::Black;
    Ok(())
}

/// Per record: (transitively depends on the scope, all transitive
/// dependencies are Singletons). Requires an acyclic graph.
fn context_flags(pending: &[PendingRecord], linked: &[Vec<DepRef>]) -> Vec<(bool, bool)> {
    let mut memo: Vec<Option<(bool, bool)>> = vec![None; pending.len()];
    for index in 0..pending.len() {
        flags_of(index, pending, linked, &mut memo);
    }
    memo.into_iter().map(|f| f.unwrap_or((false, true))).collect()
}

fn flags_of(
    node: usize,
    pending: &[PendingRecord],
    linked: &[Vec<DepRef>],
    memo: &mut Vec<Option<(bool, bool)>>,
) -> (bool, bool) {
    if let Some(flags) = memo[node] {
        return flags;
    }

    let mut depends_on_context = false;
    let mut all_singleton = true;
    for dep in &linked[node] {
        match dep {
            DepRef::Scope => depends_on_context = true,
            DepRef::Record(target) => {
                let (ctx, singleton) = flags_of(*target, pending, linked, memo);
                depends_on_context |= ctx;
                all_singleton &=
                    pending[*target].lifetime == Lifetime::Singleton && singleton;
            }
        }
    }

    memo[node] = Some((depends_on_context, all_singleton));
    (depends_on_context, all_singleton)
}

fn analysis_error(record: &PendingRecord, cause: AnalysisFault) -> BuildError {
    BuildError::Analysis {
        lifetime: record.lifetime,
        type_name: record.spec.key.type_name(),
        cause,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::container::ContainerOptions;
    use std::sync::Arc as StdArc;

    struct NameService(&'static str);
    struct Hero {
        name: &'static str,
    }
    struct Impostor;
    struct TableTimer;

    #[test]
    fn test_missing_dependency_fails() {
        let err = Container::new()
            .add(Lifetime::Singleton, |name: StdArc<NameService>| Hero {
                name: name.0,
            })
            .build()
            .expect_err("NameService is not registered");
        assert!(matches!(
            err.analysis_fault(),
            Some(AnalysisFault::NotFound(_))
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let err = Container::new()
            .add(Lifetime::Transient, |_h: StdArc<Hero>| NameService("Bob"))
            .add(Lifetime::Transient, |_i: StdArc<Impostor>| Hero {
                name: "Bob",
            })
            .add(Lifetime::Transient, |_h: StdArc<Hero>| Impostor)
            .build()
            .expect_err("three-node cycle");
        assert!(matches!(
            err.analysis_fault(),
            Some(AnalysisFault::Circular { .. })
        ));
    }

    #[test]
    fn test_direct_self_dependency_rejected() {
        let err = Container::new()
            .add(Lifetime::Transient, |_h: StdArc<Hero>| Hero { name: "Bob" })
            .build()
            .expect_err("self cycle");
        assert!(matches!(
            err.analysis_fault(),
            Some(AnalysisFault::Circular { .. })
        ));
    }

    #[test]
    fn test_scope_hierarchy_violation() {
        let err = Container::new()
            .add(Lifetime::PerContext, |_scope: crate::Scope| TableTimer)
            .add(Lifetime::Singleton, |_t: StdArc<TableTimer>| Hero {
                name: "Bob",
            })
            .build()
            .expect_err("Singleton cannot depend on PerContext");
        assert!(matches!(
            err.analysis_fault(),
            Some(AnalysisFault::ScopeHierarchy { .. })
        ));
    }

    #[test]
    fn test_silencing_permits_hierarchy_violation() {
        let locator =
            Container::with_options(ContainerOptions::new().silence_scope_analysis())
                .add(Lifetime::PerContext, |_scope: crate::Scope| TableTimer)
                .add(Lifetime::Singleton, |_t: StdArc<TableTimer>| Hero {
                    name: "Bob",
                })
                .build()
                .expect("silenced analyzer accepts the graph");
        drop(locator);
    }

    #[test]
    fn test_decorator_without_base_fails() {
        let err = Container::new()
            .decorate(Lifetime::Singleton, |inner: StdArc<Hero>| Hero {
                name: inner.name,
            })
            .build()
            .expect_err("no base Hero registered");
        assert!(matches!(
            err.analysis_fault(),
            Some(AnalysisFault::NothingToDecorate(_))
        ));
    }

    #[test]
    fn test_valid_diamond_graph_builds() {
        struct Left;
        struct Right;
        struct Root;

        let locator = Container::new()
            .add(Lifetime::Singleton, || NameService("shared"))
            .add(Lifetime::Singleton, |_n: StdArc<NameService>| Left)
            .add(Lifetime::Singleton, |_n: StdArc<NameService>| Right)
            .add(Lifetime::Singleton, |_l: StdArc<Left>, _r: StdArc<Right>| Root)
            .build()
            .expect("diamonds are not cycles");
        drop(locator);
    }
}
