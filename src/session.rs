use serde::{Deserialize, Serialize};

use crate::config::ReductionConfig;
use crate::data::filter;
use crate::data::model::{Block, Constant, Dataset};
use crate::data::BlockSource;
use crate::error::{DefinitionError, ReduceError};
use crate::result::{EvaluationResult, RunReport};
use crate::step::{compile, OutputShape, Program, StepDefinition};

pub use crate::reduce::CancelFlag;

// ---------------------------------------------------------------------------
// SessionState – what persists
// ---------------------------------------------------------------------------

/// Persisted form of a session: blocks with their user rejection flags,
/// constants, step definitions and configuration. Results never persist.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(default)]
    pub config: ReductionConfig,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub constants: Vec<Constant>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

impl SessionState {
    /// Swap in freshly loaded blocks, carrying user rejection flags over by
    /// block number.
    pub fn replace_blocks(&mut self, blocks: Vec<Block>) {
        let previous = Dataset::from_blocks(std::mem::take(&mut self.blocks));
        let mut dataset = Dataset::from_blocks(blocks);
        filter::apply_rejections(&mut dataset, &filter::rejection_state(&previous));
        self.blocks = dataset.blocks;
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Owns the data, the step set and the result of the most recent run.
///
/// Every edit is validated against the whole step set before it is
/// applied; a rejected edit leaves the session unchanged. Any applied edit
/// discards the cached run.
#[derive(Debug)]
pub struct Session {
    config: ReductionConfig,
    dataset: Dataset,
    constants: Vec<Constant>,
    steps: Vec<StepDefinition>,
    program: Program,
    report: Option<RunReport>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(ReductionConfig::default())
    }
}

impl Session {
    pub fn new(config: ReductionConfig) -> Self {
        Self {
            config,
            dataset: Dataset::default(),
            constants: Vec::new(),
            steps: Vec::new(),
            program: Program::empty(),
            report: None,
        }
    }

    pub fn config(&self) -> &ReductionConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: ReductionConfig) {
        if self.config != config {
            self.config = config;
            self.invalidate();
        }
    }

    pub fn blocks(&self) -> &[Block] {
        &self.dataset.blocks
    }

    pub fn channel_names(&self) -> &[String] {
        &self.dataset.channel_names
    }

    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Steps in evaluation order.
    pub fn evaluation_order(&self) -> Vec<&str> {
        self.program
            .order
            .iter()
            .map(|&i| self.steps[i].name.as_str())
            .collect()
    }

    fn invalidate(&mut self) {
        if self.report.take().is_some() {
            log::debug!("cached results invalidated");
        }
    }

    /// Compile a candidate state and adopt it only if it validates.
    fn commit(
        &mut self,
        dataset: Option<Dataset>,
        constants: Option<Vec<Constant>>,
        steps: Option<Vec<StepDefinition>>,
    ) -> Result<(), DefinitionError> {
        let program = compile(
            &dataset.as_ref().unwrap_or(&self.dataset).channel_names,
            constants.as_deref().unwrap_or(&self.constants),
            steps.as_deref().unwrap_or(&self.steps),
        )?;
        if let Some(d) = dataset {
            self.dataset = d;
        }
        if let Some(c) = constants {
            self.constants = c;
        }
        if let Some(s) = steps {
            self.steps = s;
        }
        self.program = program;
        self.invalidate();
        Ok(())
    }

    // -- Blocks --

    /// Replace the loaded blocks. User flags already set for a block
    /// number carry over to the new block with that number.
    pub fn set_blocks(&mut self, blocks: Vec<Block>) -> Result<(), DefinitionError> {
        check_blocks(&blocks)?;
        let mut dataset = Dataset::from_blocks(blocks);
        filter::apply_rejections(&mut dataset, &filter::rejection_state(&self.dataset));
        log::info!(
            "loaded {} blocks with channels {:?}",
            dataset.len(),
            dataset.channel_names
        );
        self.commit(Some(dataset), None, None)
    }

    /// Load blocks for `session_id` from a source.
    pub fn load_blocks(&mut self, source: &dyn BlockSource, session_id: &str) -> anyhow::Result<()> {
        let blocks = source.load_blocks(session_id)?;
        self.set_blocks(blocks)?;
        Ok(())
    }

    /// Returns whether the flag changed.
    pub fn set_block_rejected(&mut self, block: usize, rejected: bool) -> Result<bool, DefinitionError> {
        let changed = filter::set_block_rejected(&mut self.dataset, block, rejected)
            .ok_or(DefinitionError::UnknownBlock { block, cycle: None })?;
        if changed {
            log::info!("block {block} {}", if rejected { "rejected" } else { "restored" });
            self.invalidate();
        }
        Ok(changed)
    }

    /// `cycle` is the 0-based position within the block.
    pub fn set_cycle_rejected(
        &mut self,
        block: usize,
        cycle: usize,
        rejected: bool,
    ) -> Result<bool, DefinitionError> {
        let changed = filter::set_cycle_rejected(&mut self.dataset, block, cycle, rejected).ok_or(
            DefinitionError::UnknownBlock {
                block,
                cycle: Some(cycle),
            },
        )?;
        if changed {
            self.invalidate();
        }
        Ok(changed)
    }

    // -- Constants --

    /// Define or redefine a constant.
    pub fn define_constant(&mut self, constant: Constant) -> Result<(), DefinitionError> {
        let mut constants = self.constants.clone();
        match constants.iter_mut().find(|c| c.name == constant.name) {
            Some(existing) => *existing = constant,
            None => constants.push(constant),
        }
        self.commit(None, Some(constants), None)
    }

    pub fn remove_constant(&mut self, name: &str) -> Result<(), DefinitionError> {
        let pos = self
            .constants
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| DefinitionError::UnknownConstant(name.to_string()))?;
        self.check_unreferenced(name)?;
        let mut constants = self.constants.clone();
        constants.remove(pos);
        self.commit(None, Some(constants), None)
    }

    // -- Steps --

    pub fn define_step(&mut self, def: StepDefinition) -> Result<(), DefinitionError> {
        let mut steps = self.steps.clone();
        let name = def.name.clone();
        steps.push(def);
        self.commit(None, None, Some(steps))?;
        log::info!("defined step '{name}'");
        Ok(())
    }

    /// Replace the definition of the step with the same name, keeping its
    /// declaration position.
    pub fn update_step(&mut self, def: StepDefinition) -> Result<(), DefinitionError> {
        let pos = self
            .position(&def.name)
            .ok_or_else(|| DefinitionError::UnknownStep(def.name.clone()))?;
        let mut steps = self.steps.clone();
        steps[pos] = def;
        self.commit(None, None, Some(steps))
    }

    pub fn remove_step(&mut self, name: &str) -> Result<(), DefinitionError> {
        let pos = self
            .position(name)
            .ok_or_else(|| DefinitionError::UnknownStep(name.to_string()))?;
        self.check_unreferenced(name)?;
        let mut steps = self.steps.clone();
        steps.remove(pos);
        self.commit(None, None, Some(steps))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    fn check_unreferenced(&self, name: &str) -> Result<(), DefinitionError> {
        match self
            .program
            .steps
            .iter()
            .find(|s| s.def.name != name && s.bindings.contains_key(name))
        {
            Some(by) => Err(DefinitionError::StillReferenced {
                name: name.to_string(),
                by: by.def.name.clone(),
            }),
            None => Ok(()),
        }
    }

    pub fn step_shape(&self, name: &str) -> Option<OutputShape> {
        self.position(name).map(|i| self.steps[i].shape)
    }

    // -- Running --

    /// Run the reduction, or return the cached report if nothing changed
    /// since the last run.
    pub fn reduce(&mut self) -> Result<&RunReport, ReduceError> {
        self.reduce_with_cancel(&CancelFlag::new())
    }

    pub fn reduce_with_cancel(&mut self, cancel: &CancelFlag) -> Result<&RunReport, ReduceError> {
        let report = match self.report.take() {
            Some(report) => report,
            None => crate::reduce::run(
                &self.program,
                &self.dataset,
                &self.constants,
                &self.config,
                cancel,
            )?,
        };
        Ok(self.report.insert(report))
    }

    /// The cached report, if the session has not changed since it ran.
    pub fn report(&self) -> Option<&RunReport> {
        self.report.as_ref()
    }

    /// Look up a result of the most recent run; see [`RunReport::result`].
    pub fn result(&self, step: &str, block: Option<usize>, cycle: Option<usize>) -> Option<EvaluationResult> {
        self.report.as_ref()?.result(step, block, cycle)
    }

    // -- Persistence --

    pub fn to_state(&self) -> SessionState {
        SessionState {
            config: self.config.clone(),
            blocks: self.dataset.blocks.clone(),
            constants: self.constants.clone(),
            steps: self.steps.clone(),
        }
    }

    pub fn from_state(state: SessionState) -> Result<Self, DefinitionError> {
        let mut session = Session::new(state.config);
        check_blocks(&state.blocks)?;
        session.commit(
            Some(Dataset::from_blocks(state.blocks)),
            Some(state.constants),
            Some(state.steps),
        )?;
        Ok(session)
    }
}

fn check_blocks(blocks: &[Block]) -> Result<(), DefinitionError> {
    for block in blocks {
        block.check()?;
    }
    let mut numbers: Vec<usize> = blocks.iter().map(|b| b.number).collect();
    numbers.sort_unstable();
    match numbers.windows(2).find(|w| w[0] == w[1]) {
        Some(w) => Err(DefinitionError::DuplicateBlock(w[0])),
        None => Ok(()),
    }
}
