use proptest::collection::vec;
use proptest::prelude::*;

use rusty_ratio::graph::DependencyGraph;
use rusty_ratio::CycleError;

const N: usize = 8;

fn graph(edges: &[(usize, usize)]) -> DependencyGraph {
    let mut deps = vec![Vec::new(); N];
    for &(from, to) in edges {
        deps[from].push(to);
    }
    DependencyGraph::new((0..N).map(|i| format!("s{i}")).collect(), deps)
}

fn index(name: &str) -> usize {
    name[1..].parse().unwrap()
}

proptest! {
    #[test]
    fn order_respects_edges_or_reports_a_real_cycle(edges in vec((0..N, 0..N), 0..24)) {
        let g = graph(&edges);
        match g.topo_order() {
            Ok(order) => {
                let mut sorted = order.clone();
                sorted.sort_unstable();
                prop_assert_eq!(sorted, (0..N).collect::<Vec<_>>());
                let pos = |i: usize| order.iter().position(|&o| o == i).unwrap();
                for &(from, to) in &edges {
                    prop_assert!(pos(to) < pos(from));
                }
            }
            Err(CycleError { path }) => {
                prop_assert!(path.len() >= 2);
                prop_assert_eq!(path.first(), path.last());
                for pair in path.windows(2) {
                    let (a, b) = (index(&pair[0]), index(&pair[1]));
                    prop_assert!(g.dependencies(a).contains(&b));
                }
            }
        }
    }

    #[test]
    fn downward_edges_never_cycle(edges in vec((0..N, 0..N), 0..24)) {
        let down: Vec<(usize, usize)> = edges.into_iter().filter(|(a, b)| a > b).collect();
        let order = graph(&down).topo_order();
        prop_assert!(order.is_ok());
    }

    #[test]
    fn order_is_deterministic(edges in vec((0..N, 0..N), 0..24)) {
        prop_assert_eq!(graph(&edges).topo_order(), graph(&edges).topo_order());
    }
}

#[test]
fn independent_steps_keep_declaration_order() {
    assert_eq!(graph(&[]).topo_order().unwrap(), (0..N).collect::<Vec<_>>());
}
