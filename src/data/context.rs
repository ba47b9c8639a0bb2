use std::collections::{BTreeMap, HashMap};

use crate::error::{DefinitionError, EvalError};
use crate::eval::Scope;
use crate::formula::{Builtin, Expr, RESERVED_WORDS};
use crate::quantity::{Axis, Operand, Quantity, Series, SourceId};
use crate::reduce::BlockResults;
use crate::step::{OutputShape, StepDefinition};

use super::model::{Constant, Dataset};

// ---------------------------------------------------------------------------
// Symbol table
// ---------------------------------------------------------------------------

/// What a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol {
    /// Index into the dataset's channel names.
    RawChannel(usize),
    /// Index into the session's constants.
    Constant(usize),
    /// Declaration index of a step.
    Step(usize),
    NotFound,
}

/// Names are unique across raw channels, constants and steps.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    names: HashMap<String, Symbol>,
}

impl SymbolTable {
    pub fn build(
        channel_names: &[String],
        constants: &[Constant],
        steps: &[StepDefinition],
    ) -> Result<Self, DefinitionError> {
        let mut table = SymbolTable::default();
        for (i, name) in channel_names.iter().enumerate() {
            table.insert(name, Symbol::RawChannel(i))?;
        }
        for (i, c) in constants.iter().enumerate() {
            table.insert(&c.name, Symbol::Constant(i))?;
        }
        for (i, s) in steps.iter().enumerate() {
            table.insert(&s.name, Symbol::Step(i))?;
        }
        Ok(table)
    }

    fn insert(&mut self, name: &str, symbol: Symbol) -> Result<(), DefinitionError> {
        check_identifier(name)?;
        if let Some(existing) = self.names.get(name) {
            return Err(DefinitionError::NameCollision {
                name: name.to_string(),
                existing: kind_name(*existing),
            });
        }
        self.names.insert(name.to_string(), symbol);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Symbol {
        self.names.get(name).copied().unwrap_or(Symbol::NotFound)
    }

    /// Resolve every free name of `expr` once. The first unknown name is
    /// an error.
    pub fn bind(&self, step: &str, expr: &Expr) -> Result<BTreeMap<String, Symbol>, DefinitionError> {
        let mut out = BTreeMap::new();
        for name in expr.references() {
            match self.resolve(name) {
                Symbol::NotFound => {
                    return Err(DefinitionError::UnknownName {
                        step: step.to_string(),
                        name: name.to_string(),
                    })
                }
                symbol => {
                    out.insert(name.to_string(), symbol);
                }
            }
        }
        Ok(out)
    }
}

fn kind_name(symbol: Symbol) -> &'static str {
    match symbol {
        Symbol::RawChannel(_) => "raw channel",
        Symbol::Constant(_) => "constant",
        Symbol::Step(_) => "step",
        Symbol::NotFound => "name",
    }
}

/// Names must be formula identifiers that are neither keywords nor
/// function names.
fn check_identifier(name: &str) -> Result<(), DefinitionError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(DefinitionError::NameCollision {
            name: name.to_string(),
            existing: "non-identifier",
        });
    }
    if RESERVED_WORDS.contains(&name) {
        return Err(DefinitionError::NameCollision {
            name: name.to_string(),
            existing: "reserved word",
        });
    }
    if Builtin::from_name(name).is_some() {
        return Err(DefinitionError::NameCollision {
            name: name.to_string(),
            existing: "built-in function",
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Data context – one step's bindings in one frame
// ---------------------------------------------------------------------------

/// The frame a context is bound to, with the results visible from it.
#[derive(Clone, Copy)]
pub enum Frame<'a> {
    Cycle {
        block: usize,
        cycle: usize,
        results: &'a BlockResults,
    },
    Block {
        block: usize,
        results: &'a BlockResults,
    },
    Session {
        blocks: &'a [BlockResults],
    },
}

/// Session-wide inputs shared by every frame of a run.
#[derive(Clone, Copy)]
pub struct Inputs<'a> {
    pub dataset: &'a Dataset,
    pub constants: &'a [Constant],
    pub step_names: &'a [String],
    pub step_shapes: &'a [OutputShape],
    pub scalars: &'a BTreeMap<usize, Quantity>,
}

/// Lookup for one step in one frame, using the step's cached bindings.
pub struct DataContext<'a> {
    pub inputs: Inputs<'a>,
    pub bindings: &'a BTreeMap<String, Symbol>,
    pub frame: Frame<'a>,
}

impl DataContext<'_> {
    fn symbol(&self, name: &str) -> Symbol {
        self.bindings.get(name).copied().unwrap_or(Symbol::NotFound)
    }

    fn step_name(&self, step: usize) -> String {
        self.inputs
            .step_names
            .get(step)
            .cloned()
            .unwrap_or_else(|| format!("#{step}"))
    }

    /// Blocks whose values feed session-level steps.
    fn session_blocks<'r>(&self, blocks: &'r [BlockResults]) -> Vec<(usize, &'r BlockResults)> {
        blocks
            .iter()
            .enumerate()
            .filter(|(b, r)| {
                r.failed.is_none()
                    && self
                        .inputs
                        .dataset
                        .blocks
                        .get(*b)
                        .is_some_and(|blk| !blk.rejected)
            })
            .collect()
    }

    // -- Raw channels --

    fn sample(
        &self,
        block: usize,
        channel: usize,
        name: &str,
        cycle: usize,
        time: bool,
    ) -> Result<Quantity, EvalError> {
        let blk = self
            .inputs
            .dataset
            .blocks
            .get(block)
            .ok_or_else(|| EvalError::UnresolvedName(name.to_string()))?;
        let ch = blk
            .channel(name)
            .ok_or_else(|| EvalError::UnresolvedName(name.to_string()))?;
        let s = ch
            .samples
            .get(cycle)
            .ok_or_else(|| EvalError::UnresolvedName(format!("{name}[{cycle}]")))?;
        if time {
            return Ok(Quantity::exact(s.time));
        }
        Ok(Quantity::measured(
            s.intensity,
            ch.sigma(cycle),
            SourceId::Sample {
                block,
                channel,
                cycle,
            },
        ))
    }

    /// One block's samples of a channel; user-rejected cycles excluded.
    fn channel_items(
        &self,
        block: usize,
        channel: usize,
        name: &str,
        time: bool,
    ) -> Result<Vec<Option<Quantity>>, EvalError> {
        let blk = self
            .inputs
            .dataset
            .blocks
            .get(block)
            .ok_or_else(|| EvalError::UnresolvedName(name.to_string()))?;
        (0..blk.cycle_count())
            .map(|c| {
                if blk.is_cycle_rejected(c) {
                    Ok(None)
                } else {
                    self.sample(block, channel, name, c, time).map(Some)
                }
            })
            .collect()
    }

    fn channel(&self, channel: usize, name: &str, time: bool) -> Result<Operand, EvalError> {
        match self.frame {
            Frame::Cycle { block, cycle, .. } => self
                .sample(block, channel, name, cycle, time)
                .map(Operand::Scalar),
            Frame::Block { block, .. } => Ok(Operand::Series(Series::new(
                Axis::Cycles,
                self.channel_items(block, channel, name, time)?,
            ))),
            Frame::Session { blocks } => {
                let mut items = Vec::new();
                for (b, _) in self.session_blocks(blocks) {
                    items.extend(self.channel_items(b, channel, name, time)?);
                }
                Ok(Operand::Series(Series::new(Axis::Cycles, items)))
            }
        }
    }

    // -- Step results --

    fn step(&self, step: usize) -> Result<Operand, EvalError> {
        let failed = || EvalError::DependencyFailed(self.step_name(step));
        let shape = self
            .inputs
            .step_shapes
            .get(step)
            .copied()
            .ok_or_else(failed)?;

        if shape == OutputShape::Scalar {
            return self
                .inputs
                .scalars
                .get(&step)
                .cloned()
                .map(Operand::Scalar)
                .ok_or_else(failed);
        }

        match (self.frame, shape) {
            (Frame::Cycle { cycle, results, .. }, OutputShape::PerCycle) => results
                .cycles
                .get(&step)
                .and_then(|cv| cv.values.get(cycle).cloned().flatten())
                .map(Operand::Scalar)
                .ok_or_else(failed),
            (Frame::Block { results, .. }, OutputShape::PerCycle) => {
                let cv = results.cycles.get(&step).ok_or_else(failed)?;
                Ok(Operand::Series(Series::new(Axis::Cycles, cv.included_values())))
            }
            (Frame::Cycle { results, .. } | Frame::Block { results, .. }, _) => results
                .values
                .get(&step)
                .cloned()
                .map(Operand::Scalar)
                .ok_or_else(failed),
            (Frame::Session { blocks }, OutputShape::PerCycle) => {
                let mut items = Vec::new();
                for (_, r) in self.session_blocks(blocks) {
                    let cv = r.cycles.get(&step).ok_or_else(failed)?;
                    items.extend(cv.included_values());
                }
                Ok(Operand::Series(Series::new(Axis::Cycles, items)))
            }
            (Frame::Session { blocks }, _) => {
                let mut items = Vec::new();
                for (_, r) in self.session_blocks(blocks) {
                    let q = r.values.get(&step).ok_or_else(failed)?;
                    items.push((!r.screened_out.contains(&step)).then(|| q.clone()));
                }
                Ok(Operand::Series(Series::new(Axis::Blocks, items)))
            }
        }
    }
}

impl Scope for DataContext<'_> {
    fn operand(&self, name: &str) -> Result<Operand, EvalError> {
        match self.symbol(name) {
            Symbol::RawChannel(i) => self.channel(i, name, false),
            Symbol::Constant(i) => {
                let c = self
                    .inputs
                    .constants
                    .get(i)
                    .ok_or_else(|| EvalError::UnresolvedName(name.to_string()))?;
                Ok(Operand::Scalar(Quantity::measured(
                    c.value,
                    c.sigma,
                    SourceId::Constant(i),
                )))
            }
            Symbol::Step(i) => self.step(i),
            Symbol::NotFound => Err(EvalError::UnresolvedName(name.to_string())),
        }
    }

    fn times(&self, channel: &str) -> Result<Operand, EvalError> {
        match self.symbol(channel) {
            Symbol::RawChannel(i) => self.channel(i, channel, true),
            _ => Err(EvalError::UnresolvedName(channel.to_string())),
        }
    }
}
