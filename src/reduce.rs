use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{ReductionConfig, ScreenMethod};
use crate::data::context::{DataContext, Frame, Inputs};
use crate::data::model::{Constant, Dataset};
use crate::error::{BlockEvalError, EvalError, ReduceError, SessionEvalError};
use crate::eval::{evaluate_step, Coord, EvalSettings};
use crate::quantity::Quantity;
use crate::result::RunReport;
use crate::stats;
use crate::step::{OutputShape, Program};

// ---------------------------------------------------------------------------
// Per-block run state
// ---------------------------------------------------------------------------

/// One per-cycle step's values in one block, by cycle position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleValues {
    /// `None` for user-rejected cycles.
    pub values: Vec<Option<Quantity>>,
    /// User inclusion combined with the step's own screening.
    pub included: Vec<bool>,
}

impl CycleValues {
    /// Values with screened-out cycles masked.
    pub fn included_values(&self) -> Vec<Option<Quantity>> {
        self.values
            .iter()
            .zip(&self.included)
            .map(|(q, &inc)| if inc { q.clone() } else { None })
            .collect()
    }
}

/// Everything computed for one block. A failed block keeps only its error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockResults {
    pub cycles: BTreeMap<usize, CycleValues>,
    pub values: BTreeMap<usize, Quantity>,
    /// Per-block steps whose value in this block was screened out.
    pub screened_out: BTreeSet<usize>,
    pub failed: Option<BlockEvalError>,
}

/// Shared cancellation flag, checked between blocks.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    /// Per-cycle and per-block steps, run block by block.
    Blocks(Vec<usize>),
    /// Scalar steps, run once.
    Session(Vec<usize>),
}

/// Split an evaluation order into maximal runs of block-level steps and
/// runs of scalar steps.
pub fn stages(order: &[usize], shapes: &[OutputShape]) -> Vec<Stage> {
    let mut out: Vec<Stage> = Vec::new();
    for &s in order {
        let scalar = shapes.get(s) == Some(&OutputShape::Scalar);
        match (out.last_mut(), scalar) {
            (Some(Stage::Session(steps)), true) | (Some(Stage::Blocks(steps)), false) => {
                steps.push(s)
            }
            (_, true) => out.push(Stage::Session(vec![s])),
            (_, false) => out.push(Stage::Blocks(vec![s])),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Evaluate a compiled program over a dataset.
pub fn run(
    program: &Program,
    dataset: &Dataset,
    constants: &[Constant],
    config: &ReductionConfig,
    cancel: &CancelFlag,
) -> Result<RunReport, ReduceError> {
    let names = program.names();
    let shapes = program.shapes();
    let plan = stages(&program.order, &shapes);
    log::info!(
        "reducing {} blocks through {} steps in {} stages{}",
        dataset.len(),
        program.steps.len(),
        plan.len(),
        if config.parallel_blocks { " (parallel)" } else { "" }
    );

    let mut blocks = vec![BlockResults::default(); dataset.len()];
    let mut scalars: BTreeMap<usize, Quantity> = BTreeMap::new();
    let mut session_errors = Vec::new();

    for stage in &plan {
        match stage {
            Stage::Blocks(steps) => {
                let runner = BlockRunner {
                    program,
                    config,
                    steps,
                    inputs: Inputs {
                        dataset,
                        constants,
                        step_names: &names,
                        step_shapes: &shapes,
                        scalars: &scalars,
                    },
                };
                if config.parallel_blocks {
                    runner.run_parallel(&mut blocks, cancel)?;
                } else {
                    runner.run_sequential(&mut blocks, cancel)?;
                }
                screen_blocks(program, dataset, config, steps, &mut blocks);
            }
            Stage::Session(steps) => {
                for &s in steps {
                    let step = &program.steps[s];
                    let outcome = {
                        let ctx = DataContext {
                            inputs: Inputs {
                                dataset,
                                constants,
                                step_names: &names,
                                step_shapes: &shapes,
                                scalars: &scalars,
                            },
                            bindings: &step.bindings,
                            frame: Frame::Session { blocks: &blocks },
                        };
                        evaluate_step(
                            &step.expr,
                            step.def.config.propagation,
                            EvalSettings::for_step(config, &step.def.config),
                            Coord {
                                step: s,
                                block: None,
                                cycle: None,
                            },
                            &ctx,
                        )
                    };
                    match outcome {
                        Ok(q) => {
                            log::debug!("{} = {q}", step.def.name);
                            scalars.insert(s, q);
                        }
                        Err(error) => {
                            let err = SessionEvalError {
                                step: step.def.name.clone(),
                                error,
                            };
                            log::warn!("{err}");
                            session_errors.push(err);
                        }
                    }
                }
            }
        }
    }

    let block_errors: Vec<BlockEvalError> =
        blocks.iter().filter_map(|b| b.failed.clone()).collect();
    log::info!(
        "run finished: {} block errors, {} session errors",
        block_errors.len(),
        session_errors.len()
    );
    Ok(RunReport {
        steps: names.into_iter().zip(shapes).collect(),
        order: program.order.iter().map(|&s| program.steps[s].def.name.clone()).collect(),
        block_numbers: dataset.blocks.iter().map(|b| b.number).collect(),
        block_rejected: dataset.blocks.iter().map(|b| b.rejected).collect(),
        blocks,
        scalars,
        block_errors,
        session_errors,
    })
}

/// Evaluates one block-level stage.
struct BlockRunner<'a> {
    program: &'a Program,
    config: &'a ReductionConfig,
    steps: &'a [usize],
    inputs: Inputs<'a>,
}

impl BlockRunner<'_> {
    fn run_sequential(&self, blocks: &mut [BlockResults], cancel: &CancelFlag) -> Result<(), ReduceError> {
        for (b, results) in blocks.iter_mut().enumerate() {
            if cancel.is_cancelled() {
                return Err(ReduceError::Cancelled);
            }
            self.run_block(b, results);
        }
        Ok(())
    }

    /// Blocks are split into contiguous chunks, one scoped thread each.
    /// Every worker writes only its own slots, so the outcome does not
    /// depend on scheduling.
    fn run_parallel(&self, blocks: &mut [BlockResults], cancel: &CancelFlag) -> Result<(), ReduceError> {
        if blocks.is_empty() {
            return Ok(());
        }
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(blocks.len());
        let chunk = blocks.len().div_ceil(workers);

        let cancelled = std::thread::scope(|scope| {
            let handles: Vec<_> = blocks
                .chunks_mut(chunk)
                .enumerate()
                .map(|(k, slots)| {
                    scope.spawn(move || {
                        for (i, results) in slots.iter_mut().enumerate() {
                            if cancel.is_cancelled() {
                                return true;
                            }
                            self.run_block(k * chunk + i, results);
                        }
                        false
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .fold(false, |acc, c| acc || c)
        });

        if cancelled {
            Err(ReduceError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run the stage's steps on one block. The first failure discards
    /// everything the block computed.
    fn run_block(&self, b: usize, results: &mut BlockResults) {
        if results.failed.is_some() {
            return;
        }
        for &s in self.steps {
            if let Err(err) = self.run_step(b, s, results) {
                log::warn!("{err}");
                *results = BlockResults {
                    failed: Some(err),
                    ..BlockResults::default()
                };
                return;
            }
        }
    }

    fn run_step(&self, b: usize, s: usize, results: &mut BlockResults) -> Result<(), BlockEvalError> {
        let step = &self.program.steps[s];
        let block = &self.inputs.dataset.blocks[b];
        let settings = EvalSettings::for_step(self.config, &step.def.config);
        let propagation = step.def.config.propagation;
        let fail = |cycle: Option<usize>| {
            move |error: EvalError| BlockEvalError {
                block: block.number,
                step: step.def.name.clone(),
                cycle,
                error,
            }
        };

        match step.def.shape {
            OutputShape::PerCycle => {
                let n = block.cycle_count();
                let mut values = Vec::with_capacity(n);
                for c in 0..n {
                    if block.is_cycle_rejected(c) {
                        values.push(None);
                        continue;
                    }
                    let ctx = DataContext {
                        inputs: self.inputs,
                        bindings: &step.bindings,
                        frame: Frame::Cycle {
                            block: b,
                            cycle: c,
                            results: &*results,
                        },
                    };
                    let coord = Coord {
                        step: s,
                        block: Some(b),
                        cycle: Some(c),
                    };
                    let q = evaluate_step(&step.expr, propagation, settings, coord, &ctx)
                        .map_err(fail(Some(c)))?;
                    values.push(Some(q));
                }
                let user: Vec<bool> = values.iter().map(Option::is_some).collect();
                let included = match step.def.config.screen {
                    Some(method) => {
                        let nominal: Vec<f64> = values
                            .iter()
                            .map(|q| q.as_ref().map_or(0.0, |q| q.value))
                            .collect();
                        screen(method, &nominal, &user, self.config)
                    }
                    None => user,
                };
                results.cycles.insert(s, CycleValues { values, included });
            }
            OutputShape::PerBlock => {
                let ctx = DataContext {
                    inputs: self.inputs,
                    bindings: &step.bindings,
                    frame: Frame::Block {
                        block: b,
                        results: &*results,
                    },
                };
                let coord = Coord {
                    step: s,
                    block: Some(b),
                    cycle: None,
                };
                let q = evaluate_step(&step.expr, propagation, settings, coord, &ctx)
                    .map_err(fail(None))?;
                results.values.insert(s, q);
            }
            OutputShape::Scalar => {}
        }
        Ok(())
    }
}

fn screen(method: ScreenMethod, values: &[f64], included: &[bool], config: &ReductionConfig) -> Vec<bool> {
    let screening = match method {
        ScreenMethod::Robust => stats::robust_screen(values, included, &config.outlier),
        ScreenMethod::Chauvenet => stats::chauvenet_screen(values, included, &config.chauvenet),
    };
    screening.included
}

/// Screen per-block steps across the blocks that feed session steps.
fn screen_blocks(
    program: &Program,
    dataset: &Dataset,
    config: &ReductionConfig,
    steps: &[usize],
    blocks: &mut [BlockResults],
) {
    for &s in steps {
        let step = &program.steps[s];
        let Some(method) = step.def.config.screen else {
            continue;
        };
        if step.def.shape != OutputShape::PerBlock {
            continue;
        }
        let eligible: Vec<usize> = (0..blocks.len())
            .filter(|&b| blocks[b].failed.is_none() && !dataset.blocks[b].rejected)
            .collect();
        let values: Vec<f64> = eligible
            .iter()
            .map(|&b| blocks[b].values.get(&s).map_or(0.0, |q| q.value))
            .collect();
        let included = screen(method, &values, &vec![true; values.len()], config);
        for (&b, keep) in eligible.iter().zip(included) {
            if !keep {
                blocks[b].screened_out.insert(s);
            }
        }
        log::debug!(
            "{}: {} of {} blocks screened out",
            step.def.name,
            eligible.iter().filter(|&&b| blocks[b].screened_out.contains(&s)).count(),
            eligible.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StepConfig;
    use crate::data::model::{Block, RawChannel, Sample};
    use crate::step::{compile, StepDefinition};

    fn channel(name: &str, values: &[f64]) -> RawChannel {
        RawChannel::new(
            name,
            values
                .iter()
                .enumerate()
                .map(|(i, &v)| Sample {
                    cycle: i + 1,
                    intensity: v,
                    time: i as f64,
                })
                .collect(),
        )
    }

    fn dataset() -> Dataset {
        Dataset::from_blocks(vec![
            Block::new(
                1,
                [
                    channel("Pb206", &[100.0, 102.0, 98.0, 101.0]),
                    channel("Pb204", &[5.0, 5.0, 5.0, 5.0]),
                ],
            ),
            Block::new(
                2,
                [
                    channel("Pb206", &[200.0, 210.0, 190.0, 205.0]),
                    channel("Pb204", &[10.0, 10.0, 10.0, 0.0]),
                ],
            ),
            Block::new(
                3,
                [
                    channel("Pb206", &[150.0, 150.0, 150.0, 150.0]),
                    channel("Pb204", &[10.0, 10.0, 10.0, 10.0]),
                ],
            ),
        ])
    }

    fn defs() -> Vec<StepDefinition> {
        vec![
            StepDefinition::new("r", "Pb206 / Pb204", OutputShape::PerCycle),
            StepDefinition::new("m", "mean(r)", OutputShape::PerBlock),
            StepDefinition::new("grand", "mean(m)", OutputShape::Scalar),
            StepDefinition::new("dev", "m - grand", OutputShape::PerBlock),
        ]
    }

    fn run_defs(ds: &Dataset, defs: &[StepDefinition], config: &ReductionConfig) -> RunReport {
        let program = compile(&ds.channel_names, &[], defs).unwrap();
        run(&program, ds, &[], config, &CancelFlag::new()).unwrap()
    }

    #[test]
    fn stage_partition_keeps_scalar_barriers() {
        use OutputShape::*;
        let shapes = [PerCycle, PerBlock, Scalar, PerBlock, Scalar, Scalar];
        assert_eq!(
            stages(&[0, 1, 2, 3, 4, 5], &shapes),
            vec![
                Stage::Blocks(vec![0, 1]),
                Stage::Session(vec![2]),
                Stage::Blocks(vec![3]),
                Stage::Session(vec![4, 5]),
            ]
        );
        assert!(stages(&[], &[]).is_empty());
    }

    #[test]
    fn failing_block_is_isolated() {
        let ds = dataset();
        let report = run_defs(&ds, &defs(), &ReductionConfig::default());
        assert_eq!(report.block_errors.len(), 1);
        let err = &report.block_errors[0];
        assert_eq!(err.block, 2);
        assert_eq!(err.step, "r");
        assert_eq!(err.cycle, Some(3));
        assert_eq!(err.error, EvalError::DivisionByZero);

        // failed block holds nothing, others complete
        assert!(report.blocks[1].values.is_empty());
        assert!(report.blocks[1].cycles.is_empty());
        assert!((report.blocks[0].values[&1].value - 20.05).abs() < 1e-12);
        assert_eq!(report.blocks[2].values[&1].value, 15.0);
        // grand mean over the surviving blocks
        assert!((report.scalars[&2].value - 17.525).abs() < 1e-12);
        assert!(report.session_errors.is_empty());
    }

    #[test]
    fn parallel_matches_sequential() {
        let ds = dataset();
        let seq = run_defs(&ds, &defs(), &ReductionConfig::default());
        let par = run_defs(
            &ds,
            &defs(),
            &ReductionConfig {
                parallel_blocks: true,
                ..ReductionConfig::default()
            },
        );
        assert_eq!(seq.blocks, par.blocks);
        assert_eq!(seq.scalars, par.scalars);
        assert_eq!(seq.block_errors, par.block_errors);
    }

    #[test]
    fn cancelled_before_first_block() {
        let ds = dataset();
        let program = compile(&ds.channel_names, &[], &defs()).unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();
        assert_eq!(
            run(&program, &ds, &[], &ReductionConfig::default(), &cancel).unwrap_err(),
            ReduceError::Cancelled
        );
    }

    #[test]
    fn session_failures_propagate_to_dependents() {
        let ds = Dataset::from_blocks(vec![Block::new(1, [channel("Pb206", &[1.0, 2.0])])]);
        let defs = [
            StepDefinition::new("z", "0", OutputShape::Scalar),
            StepDefinition::new("bad", "1 / z", OutputShape::Scalar),
            StepDefinition::new("after", "bad + 1", OutputShape::Scalar),
        ];
        let report = run_defs(&ds, &defs, &ReductionConfig::default());
        assert_eq!(report.session_errors.len(), 2);
        assert_eq!(
            report.session_errors[1].error,
            EvalError::DependencyFailed("bad".into())
        );
    }

    #[test]
    fn per_cycle_screening_is_stored_on_results() {
        let ds = Dataset::from_blocks(vec![Block::new(
            1,
            [channel("Pb206", &[10.0, 10.0, 10.0, 100.0])],
        )]);
        let defs = [
            StepDefinition::new("x", "Pb206", OutputShape::PerCycle).with_config(StepConfig {
                screen: Some(ScreenMethod::Robust),
                ..StepConfig::default()
            }),
            StepDefinition::new("m", "mean(x)", OutputShape::PerBlock),
        ];
        let report = run_defs(&ds, &defs, &ReductionConfig::default());
        let cv = &report.blocks[0].cycles[&0];
        assert_eq!(cv.included, vec![true, true, true, false]);
        assert!(cv.values[3].is_some());
        assert_eq!(report.blocks[0].values[&1].value, 10.0);
    }
}
