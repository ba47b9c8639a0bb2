use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{Propagation, StepConfig};
use crate::data::context::{Symbol, SymbolTable};
use crate::data::model::Constant;
use crate::error::DefinitionError;
use crate::eval::shape;
use crate::formula::{self, Expr};
use crate::graph::DependencyGraph;

/// What one evaluation of a step produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    /// One value for the whole session.
    Scalar,
    /// One value per cycle of every block.
    PerCycle,
    /// One value per block.
    PerBlock,
}

/// A named formula as authored by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub formula: String,
    pub shape: OutputShape,
    #[serde(default)]
    pub config: StepConfig,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, formula: impl Into<String>, shape: OutputShape) -> Self {
        Self {
            name: name.into(),
            formula: formula.into(),
            shape,
            config: StepConfig::default(),
        }
    }

    pub fn with_config(mut self, config: StepConfig) -> Self {
        self.config = config;
        self
    }
}

/// A step with its parsed formula and its names resolved once.
#[derive(Debug, Clone)]
pub struct CompiledStep {
    pub def: StepDefinition,
    pub expr: Expr,
    pub bindings: BTreeMap<String, Symbol>,
}

/// A validated step set: compiled steps in declaration order plus the
/// dependency graph and evaluation order.
#[derive(Debug, Clone)]
pub struct Program {
    pub steps: Vec<CompiledStep>,
    pub graph: DependencyGraph,
    pub order: Vec<usize>,
}

impl Program {
    pub fn empty() -> Self {
        Self {
            steps: Vec::new(),
            graph: DependencyGraph::new(Vec::new(), Vec::new()),
            order: Vec::new(),
        }
    }

    pub fn shapes(&self) -> Vec<OutputShape> {
        self.steps.iter().map(|s| s.def.shape).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.def.name.clone()).collect()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.def.name == name)
    }
}

/// Validate a whole step set against the available names.
///
/// Checks run in a fixed order and stop at the first failure: syntax,
/// step configuration, name collisions, unknown names, shapes, forward
/// leakage, then dependency cycles.
pub fn compile(
    channel_names: &[String],
    constants: &[Constant],
    defs: &[StepDefinition],
) -> Result<Program, DefinitionError> {
    let mut exprs = Vec::with_capacity(defs.len());
    for def in defs {
        let expr = formula::parse(&def.formula).map_err(|source| DefinitionError::Syntax {
            step: def.name.clone(),
            source,
        })?;
        check_config(def)?;
        exprs.push(expr);
    }

    let table = SymbolTable::build(channel_names, constants, defs)?;
    let mut steps = Vec::with_capacity(defs.len());
    for (def, expr) in defs.iter().zip(exprs) {
        let bindings = table.bind(&def.name, &expr)?;
        steps.push(CompiledStep {
            def: def.clone(),
            expr,
            bindings,
        });
    }

    let shapes: Vec<OutputShape> = defs.iter().map(|d| d.shape).collect();
    for step in &steps {
        shape::check_step(&step.expr, step.def.shape, &step.bindings, &shapes).map_err(
            |source| DefinitionError::Shape {
                step: step.def.name.clone(),
                source,
            },
        )?;
    }

    let deps = steps
        .iter()
        .map(|s| {
            s.bindings
                .values()
                .filter_map(|sym| match sym {
                    Symbol::Step(j) => Some(*j),
                    _ => None,
                })
                .collect()
        })
        .collect();
    let graph = DependencyGraph::new(defs.iter().map(|d| d.name.clone()).collect(), deps);

    shape::check_leakage(&graph, &shapes).map_err(|source| {
        let step = match &source {
            crate::error::ShapeError::ForwardLeakage { step, .. } => step.clone(),
            _ => String::new(),
        };
        DefinitionError::Shape { step, source }
    })?;

    let order = graph.topo_order()?;
    log::debug!("compiled {} steps, order {:?}", steps.len(), order);
    Ok(Program {
        steps,
        graph,
        order,
    })
}

fn check_config(def: &StepDefinition) -> Result<(), DefinitionError> {
    if let Propagation::MonteCarlo { samples, .. } = def.config.propagation {
        if samples < 2 {
            return Err(DefinitionError::Config {
                step: def.name.clone(),
                message: format!("Monte Carlo needs at least 2 samples, got {samples}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CycleError, ShapeError};

    fn channels() -> Vec<String> {
        vec!["Pb204".into(), "Pb206".into()]
    }

    #[test]
    fn compiles_in_dependency_order() {
        let defs = [
            StepDefinition::new("mean_r", "wmean(r)", OutputShape::PerBlock),
            StepDefinition::new("r", "Pb206 / Pb204", OutputShape::PerCycle),
            StepDefinition::new("session_r", "wmean(mean_r)", OutputShape::Scalar),
        ];
        let p = compile(&channels(), &[], &defs).unwrap();
        assert_eq!(p.order, vec![1, 0, 2]);
        assert_eq!(p.steps[0].bindings["r"], Symbol::Step(1));
        assert_eq!(p.index_of("session_r"), Some(2));
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let defs = [StepDefinition::new("a", "a + 1", OutputShape::Scalar)];
        assert_eq!(
            compile(&[], &[], &defs).unwrap_err(),
            DefinitionError::Cycle(CycleError {
                path: vec!["a".into(), "a".into()]
            })
        );
    }

    #[test]
    fn first_failure_names_the_step() {
        let defs = [
            StepDefinition::new("ok", "Pb206", OutputShape::PerCycle),
            StepDefinition::new("bad", "Pb206 +", OutputShape::PerCycle),
        ];
        assert!(matches!(
            compile(&channels(), &[], &defs),
            Err(DefinitionError::Syntax { step, .. }) if step == "bad"
        ));

        let defs = [StepDefinition::new("u", "U238 / Pb206", OutputShape::PerCycle)];
        assert_eq!(
            compile(&channels(), &[], &defs).unwrap_err(),
            DefinitionError::UnknownName {
                step: "u".into(),
                name: "U238".into()
            }
        );
    }

    #[test]
    fn leakage_is_reported_before_cycles() {
        let defs = [
            StepDefinition::new("r", "Pb206 / Pb204 - m", OutputShape::PerCycle),
            StepDefinition::new("m", "mean(r)", OutputShape::PerBlock),
        ];
        assert_eq!(
            compile(&channels(), &[], &defs).unwrap_err(),
            DefinitionError::Shape {
                step: "r".into(),
                source: ShapeError::ForwardLeakage {
                    step: "r".into(),
                    aggregate: "m".into()
                }
            }
        );
    }

    #[test]
    fn monte_carlo_needs_two_samples() {
        let defs = [StepDefinition::new("x", "1", OutputShape::Scalar)
            .with_config(StepConfig::monte_carlo(1, 7))];
        assert!(matches!(
            compile(&[], &[], &defs),
            Err(DefinitionError::Config { .. })
        ));
    }

    #[test]
    fn definitions_deserialize_with_default_config() {
        let json = r#"{"name":"r","formula":"Pb206/Pb204","shape":"per_cycle"}"#;
        let def: StepDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(def.shape, OutputShape::PerCycle);
        assert_eq!(def.config, StepConfig::default());
    }
}
