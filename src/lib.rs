#![allow(clippy::too_many_arguments)]

pub mod appraisal;
mod compare_floats;
pub mod core;
pub mod errors;
pub mod input;
pub mod optimisation;
pub mod output;
pub mod simulation;
pub mod simulation_time;
mod statistics;

use crate::input::ingest_for_processing;
use crate::optimisation::{multiple_optimisation_step, OptimisationContext};
use crate::output::{
    write_appraisals, write_simulation_results, write_system_details, Output,
};
use crate::simulation::{run_simulation, SystemSizes};
use anyhow::anyhow;
use std::io::Read;

/// What to do with an ingested input document.
#[derive(Clone, Debug)]
pub enum RunMode {
    /// Simulate every declared window at the given fixed component sizes.
    Simulation(SystemSizes),
    /// Search the declared optimisation bounds for the optimum system.
    Optimisation,
}

/// Run one project end to end: ingest the input document, simulate or
/// optimise, and write the results through the supplied output.
pub fn run_project(
    input: impl Read,
    output: impl Output,
    mode: RunMode,
) -> anyhow::Result<()> {
    let input = ingest_for_processing(input)?;

    match mode {
        RunMode::Simulation(sizes) => {
            for (index, simulation) in input.simulations.iter().enumerate() {
                let (outputs, details) = run_simulation(
                    &input.energy_system,
                    &input.scenario,
                    &input.converters,
                    &input.profiles,
                    *simulation,
                    &sizes,
                )?;
                write_simulation_results(
                    &output,
                    &format!("simulation_{index}_results.csv"),
                    &outputs,
                )?;
                write_system_details(
                    &output,
                    &format!("simulation_{index}_details.json"),
                    &details,
                )?;
            }
        }
        RunMode::Optimisation => {
            let parameters = input.optimisation_parameters.as_ref().ok_or_else(|| {
                anyhow!("Optimisation requested but the input declares no optimisation parameters")
            })?;
            let context = OptimisationContext {
                minigrid: &input.energy_system,
                scenario: &input.scenario,
                converters: &input.converters,
                profiles: &input.profiles,
                impact: input.impact.as_ref(),
            };
            let appraisals = multiple_optimisation_step(context, parameters)?;
            write_appraisals(&output, "optimisation_appraisals.json", &appraisals)?;
        }
    }

    Ok(())
}
