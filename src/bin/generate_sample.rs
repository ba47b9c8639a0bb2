use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use rusty_ratio::config::{ScreenMethod, StepConfig};
use rusty_ratio::data::loader;
use rusty_ratio::stats::NormalSampler;
use rusty_ratio::{
    Block, Constant, OutputShape, RawChannel, ReductionConfig, Sample, SessionState,
    StepDefinition,
};

/// Counting-statistics noise: σ = √intensity.
fn counts(noise: &mut NormalSampler, expected: f64) -> (f64, f64) {
    let sigma = expected.sqrt();
    (noise.gauss(expected, sigma), sigma)
}

fn main() -> Result<()> {
    let mut noise = NormalSampler::new(42);
    // spike placement
    let mut rng = StdRng::seed_from_u64(43);

    // Common lead, normalised to 204Pb
    let abundances = [("Pb204", 1.0), ("Pb206", 18.7), ("Pb207", 15.6), ("Pb208", 38.6)];
    let n_blocks = 6;
    let n_cycles = 30;
    let base_204 = 2000.0;

    let mut blocks = Vec::with_capacity(n_blocks);
    for number in 1..=n_blocks {
        // slow beam decay within each block
        let scale = 1.0 + 0.05 * (number as f64 - 1.0);
        let mut channels = BTreeMap::new();
        for &(name, ratio) in &abundances {
            let mut samples = Vec::with_capacity(n_cycles);
            let mut sigmas = Vec::with_capacity(n_cycles);
            for cycle in 0..n_cycles {
                let time = cycle as f64 * 4.2;
                let decay = (-time / 600.0).exp();
                let (intensity, sigma) = counts(&mut noise, base_204 * ratio * scale * decay);
                samples.push(Sample {
                    cycle: cycle + 1,
                    intensity,
                    time,
                });
                sigmas.push(sigma);
            }
            channels.insert(name, RawChannel::new(name, samples).with_sigmas(sigmas));
        }
        // one spike per block on 206 to give the screening something to do
        if let Some(ch) = channels.get_mut("Pb206") {
            let at = rng.random_range(0..n_cycles);
            ch.samples[at].intensity *= 1.5;
        }
        blocks.push(Block::new(number, channels.into_values()));
    }

    let robust = StepConfig {
        screen: Some(ScreenMethod::Robust),
        ..StepConfig::default()
    };
    let steps = vec![
        StepDefinition::new("r206_204", "Pb206 / Pb204", OutputShape::PerCycle).with_config(robust),
        StepDefinition::new("r207_206", "Pb207 / Pb206", OutputShape::PerCycle),
        StepDefinition::new("r208_204", "Pb208 / Pb204", OutputShape::PerCycle),
        StepDefinition::new("b206_204", "wmean(r206_204)", OutputShape::PerBlock),
        StepDefinition::new("b207_206", "filtered_mean(r207_206)", OutputShape::PerBlock),
        StepDefinition::new("drift", "slope(r208_204, time(Pb208))", OutputShape::PerBlock),
        StepDefinition::new("s206_204", "wmean(b206_204)", OutputShape::Scalar),
        StepDefinition::new("mswd206_204", "mswd(b206_204)", OutputShape::Scalar),
        StepDefinition::new("s207_206", "mean(b207_206)", OutputShape::Scalar),
        StepDefinition::new("bias", "s206_204 / r206_204_ref", OutputShape::Scalar),
        StepDefinition::new("r206_204_mc", "Pb206 / Pb204", OutputShape::PerCycle)
            .with_config(StepConfig::monte_carlo(500, 7)),
    ];

    let state = SessionState {
        config: ReductionConfig::default(),
        blocks,
        constants: vec![Constant::new("r206_204_ref", 18.7, 0.01)],
        steps,
    };

    let output_path = std::path::Path::new("sample_session.json");
    loader::save_session_file(output_path, &state).context("writing sample session")?;

    println!(
        "Wrote {n_blocks} blocks ({n_cycles} cycles, {} channels each) to {}",
        abundances.len(),
        output_path.display()
    );
    Ok(())
}
