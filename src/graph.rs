use std::collections::{BTreeSet, HashMap};

use crate::error::CycleError;

/// References between steps, by declaration index. Raw channels and
/// constants are not nodes. Rebuilt wholesale whenever a step changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    names: Vec<String>,
    /// `deps[i]`: steps that step `i` references, sorted, deduplicated.
    deps: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

impl DependencyGraph {
    pub fn new(names: Vec<String>, mut deps: Vec<Vec<usize>>) -> Self {
        deps.resize(names.len(), Vec::new());
        for d in &mut deps {
            d.retain(|&j| j < names.len());
            d.sort_unstable();
            d.dedup();
        }
        Self { names, deps }
    }

    /// Build from `(step name, referenced names)` pairs in declaration
    /// order. Names that are not steps are ignored.
    pub fn from_references<'a, I, R>(steps: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, R)>,
        R: IntoIterator<Item = &'a str>,
    {
        let steps: Vec<(&str, Vec<&str>)> = steps
            .into_iter()
            .map(|(name, refs)| (name, refs.into_iter().collect()))
            .collect();
        let index: HashMap<&str, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (*name, i))
            .collect();
        let deps = steps
            .iter()
            .map(|(_, refs)| refs.iter().filter_map(|r| index.get(r).copied()).collect())
            .collect();
        Self::new(steps.iter().map(|(n, _)| n.to_string()).collect(), deps)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, i: usize) -> &str {
        &self.names[i]
    }

    pub fn dependencies(&self, i: usize) -> &[usize] {
        &self.deps[i]
    }

    /// Steps that reference step `i` directly.
    pub fn dependents(&self, i: usize) -> Vec<usize> {
        (0..self.len()).filter(|&j| self.deps[j].contains(&i)).collect()
    }

    /// Whether `from` depends on `to`, directly or transitively.
    pub fn reaches(&self, from: usize, to: usize) -> bool {
        let mut seen = vec![false; self.len()];
        let mut stack = vec![from];
        while let Some(i) = stack.pop() {
            for &j in &self.deps[i] {
                if j == to {
                    return true;
                }
                if !seen[j] {
                    seen[j] = true;
                    stack.push(j);
                }
            }
        }
        false
    }

    // -- Cycle detection --

    /// First circular dependency found by a depth-first walk in declaration
    /// order, as a closed path `[a, b, …, a]`.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks = vec![Mark::Unvisited; self.len()];
        let mut stack = Vec::new();
        for start in 0..self.len() {
            if marks[start] == Mark::Unvisited {
                if let Some(path) = self.visit(start, &mut marks, &mut stack) {
                    return Some(path.into_iter().map(|i| self.names[i].clone()).collect());
                }
            }
        }
        None
    }

    fn visit(&self, i: usize, marks: &mut [Mark], stack: &mut Vec<usize>) -> Option<Vec<usize>> {
        marks[i] = Mark::OnStack;
        stack.push(i);
        for &j in &self.deps[i] {
            match marks[j] {
                Mark::OnStack => {
                    let pos = stack.iter().position(|&s| s == j).unwrap_or(0);
                    let mut path = stack[pos..].to_vec();
                    path.push(j);
                    return Some(path);
                }
                Mark::Unvisited => {
                    if let Some(path) = self.visit(j, marks, stack) {
                        return Some(path);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[i] = Mark::Done;
        None
    }

    // -- Ordering --

    /// Every step after all steps it references; ties go to the step
    /// declared first.
    pub fn topo_order(&self) -> Result<Vec<usize>, CycleError> {
        if let Some(path) = self.find_cycle() {
            return Err(CycleError { path });
        }
        let mut pending: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.len()).filter(|&i| pending[i] == 0).collect();
        let dependents: Vec<Vec<usize>> = (0..self.len()).map(|i| self.dependents(i)).collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &j in &dependents[i] {
                pending[j] -= 1;
                if pending[j] == 0 {
                    ready.insert(j);
                }
            }
        }
        Ok(order)
    }
}

/// Topological order of steps given as `(name, referenced names)`.
pub fn build<'a, I, R>(steps: I) -> Result<Vec<usize>, CycleError>
where
    I: IntoIterator<Item = (&'a str, R)>,
    R: IntoIterator<Item = &'a str>,
{
    DependencyGraph::from_references(steps).topo_order()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaration_order_breaks_ties() {
        let order = build([
            ("c", vec!["a"]),
            ("a", vec![]),
            ("b", vec![]),
            ("d", vec!["c", "b"]),
        ])
        .unwrap();
        // c becomes ready once a is done and outranks b by declaration
        assert_eq!(order, vec![1, 0, 2, 3]);
    }

    #[test]
    fn self_reference_is_one_node_cycle() {
        let err = build([("a", vec!["a", "Pb206"])]).unwrap_err();
        assert_eq!(err.path, vec!["a", "a"]);
    }

    #[test]
    fn reports_full_cycle_path() {
        let err = build([
            ("x", vec![]),
            ("a", vec!["b"]),
            ("b", vec!["c", "x"]),
            ("c", vec!["a"]),
        ])
        .unwrap_err();
        assert_eq!(err.path, vec!["a", "b", "c", "a"]);
        assert_eq!(err.to_string(), "circular step dependency: a -> b -> c -> a");
    }

    #[test]
    fn reachability() {
        let g = DependencyGraph::from_references([
            ("a", vec![]),
            ("b", vec!["a"]),
            ("c", vec!["b"]),
        ]);
        assert!(g.reaches(2, 0));
        assert!(!g.reaches(0, 2));
        assert_eq!(g.dependents(0), vec![1]);
    }
}
