//! Whole-program call graph
//!
//! Built after every function's type graph exists. Its strongly connected
//! components are the groups of functions whose types depend on each other;
//! a failure resolving one of them is reported against all of them.

use crate::typegraph::scc::tarjan;
use crate::typegraph::ProgramGraph;
use fxhash::FxHashMap;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Functions that call each other, directly or through others
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionComponent {
    pub functions: Vec<String>,
    /// More than one function, or a function calling itself
    pub recursive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallGraph {
    /// caller -> local callees, in first-call order
    calls: IndexMap<String, Vec<String>>,
    /// Components, callees first
    components: Vec<FunctionComponent>,
    component_of: FxHashMap<String, usize>,
}

impl CallGraph {
    pub fn new<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let mut calls: IndexMap<String, Vec<String>> = edges.into_iter().collect();
        // Drop calls to names outside the program
        let known: Vec<String> = calls.keys().cloned().collect();
        for callees in calls.values_mut() {
            callees.retain(|c| known.contains(c));
        }

        let index: FxHashMap<&str, usize> =
            calls.keys().enumerate().map(|(i, name)| (name.as_str(), i)).collect();
        let successors: Vec<Vec<usize>> = calls
            .values()
            .map(|callees| callees.iter().filter_map(|c| index.get(c.as_str()).copied()).collect())
            .collect();

        let raw = tarjan(calls.len(), |i| successors[i].clone());
        let mut components = Vec::with_capacity(raw.len());
        let mut component_of = FxHashMap::default();
        for (c, members) in raw.into_iter().enumerate() {
            let recursive = members.len() > 1
                || members.iter().any(|m| successors[*m].contains(m));
            let functions: Vec<String> = members
                .iter()
                .filter_map(|m| calls.get_index(*m).map(|(name, _)| name.clone()))
                .collect();
            for name in &functions {
                component_of.insert(name.clone(), c);
            }
            components.push(FunctionComponent { functions, recursive });
        }

        Self {
            calls,
            components,
            component_of,
        }
    }

    pub fn from_program(program: &ProgramGraph) -> Self {
        Self::new(program.functions.values().map(|f| {
            let callees = f.local_callees(program).map(str::to_string).collect();
            (f.function.clone(), callees)
        }))
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn callees(&self, function: &str) -> &[String] {
        self.calls.get(function).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn callers(&self, function: &str) -> Vec<&str> {
        self.calls
            .iter()
            .filter(|(_, callees)| callees.iter().any(|c| c == function))
            .map(|(caller, _)| caller.as_str())
            .collect()
    }

    /// Components ordered so callees come before their callers
    pub fn components(&self) -> &[FunctionComponent] {
        &self.components
    }

    pub fn component_of(&self, function: &str) -> Option<&FunctionComponent> {
        self.component_of
            .get(function)
            .and_then(|c| self.components.get(*c))
    }

    /// Every function sharing a component with `function`, itself included
    pub fn component_members(&self, function: &str) -> &[String] {
        self.component_of(function)
            .map(|c| c.functions.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_recursive(&self, function: &str) -> bool {
        self.component_of(function).is_some_and(|c| c.recursive)
    }

    pub fn recursive_components(&self) -> impl Iterator<Item = &FunctionComponent> {
        self.components.iter().filter(|c| c.recursive)
    }

    /// Functions reachable from `start` through calls, `start` included
    pub fn reachable_from(&self, start: &str) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        if let Some((name, _)) = self.calls.get_key_value(start) {
            queue.push_back(name.as_str());
        }
        while let Some(f) = queue.pop_front() {
            if seen.contains(&f) {
                continue;
            }
            seen.push(f);
            queue.extend(self.callees(f).iter().map(String::as_str));
        }
        seen
    }
}

impl fmt::Display for CallGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (caller, callees) in &self.calls {
            writeln!(f, "{} -> [{}]", caller, callees.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> CallGraph {
        CallGraph::new(edges.iter().map(|(caller, callees)| {
            (caller.to_string(), callees.iter().map(|c| c.to_string()).collect())
        }))
    }

    #[test]
    fn test_mutual_recursion_component() {
        let cg = graph(&[("main", &["even"]), ("even", &["odd"]), ("odd", &["even", "print"])]);

        assert!(cg.is_recursive("even"));
        assert!(cg.is_recursive("odd"));
        assert!(!cg.is_recursive("main"));
        assert_eq!(cg.component_members("odd"), ["even".to_string(), "odd".to_string()]);
        // builtins are not part of the program
        assert_eq!(cg.callees("odd"), ["even".to_string()]);

        // callees first
        let order: Vec<&FunctionComponent> = cg.components().iter().collect();
        assert_eq!(order.len(), 2);
        assert_eq!(order[1].functions, vec!["main".to_string()]);
    }

    #[test]
    fn test_self_recursion_and_reachability() {
        let cg = graph(&[("fact", &["fact"]), ("main", &["fact"]), ("lonely", &[])]);
        assert!(cg.is_recursive("fact"));
        assert!(!cg.is_recursive("lonely"));
        assert_eq!(cg.recursive_components().count(), 1);
        assert_eq!(cg.callers("fact"), vec!["fact", "main"]);
        assert_eq!(cg.reachable_from("main"), vec!["main", "fact"]);
        assert!(cg.component_members("missing").is_empty());
    }
}
