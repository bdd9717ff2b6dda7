//! Step-search optimisation over component sizes: sweep a bounded grid of
//! candidate systems, simulate each in parallel, filter by threshold
//! criteria, and rank the survivors by the optimisation criterion. Bounds
//! expand when the optimum lands on an upper bound, and successive periods
//! chain the degraded final sizes of one period into the floor of the next.

use crate::appraisal::{appraise_system, Criterion, ImpactInputs, SystemAppraisal};
use crate::core::conversion::Converter;
use crate::errors::MinigridError;
use crate::input::{EnergySystem, Profiles, Scenario};
use crate::simulation::{run_simulation, SystemSizes};
use crate::simulation_time::Simulation;
use indexmap::IndexMap;
use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Bound on how many times the search grid may be re-centred after the
/// optimum lands on an upper bound.
const MAX_BOUND_EXPANSIONS: usize = 10;

/// An inclusive search range with a fixed step.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BoundedRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl BoundedRange {
    /// The candidate values of the range, endpoints included.
    pub fn values(&self) -> Vec<f64> {
        if self.step <= 0. || self.max < self.min {
            return vec![self.min];
        }
        let mut values = Vec::new();
        let mut value = self.min;
        while value < self.max - 1e-9 {
            values.push(value);
            value += self.step;
        }
        values.push(self.max);
        values
    }

    /// Re-centre the range on a value that hit the upper bound, keeping the
    /// span and step.
    fn expanded_from(&self, lower: f64) -> Self {
        Self {
            min: lower,
            max: lower + (self.max - self.min),
            step: self.step,
        }
    }

    /// Raise the floor of the range so it never searches below sizes
    /// already installed.
    fn floored_at(&self, floor: f64) -> Self {
        Self {
            min: self.min.max(floor),
            max: self.max.max(floor),
            step: self.step,
        }
    }
}

/// The declarative search space and target for one optimisation run.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OptimisationParameters {
    pub pv_sizes: Option<BoundedRange>,
    pub storage_sizes: Option<BoundedRange>,
    pub pvt_sizes: Option<BoundedRange>,
    pub solar_thermal_sizes: Option<BoundedRange>,
    pub clean_water_tanks: Option<BoundedRange>,
    pub hot_water_tanks: Option<BoundedRange>,
    #[serde(default)]
    pub converter_sizes: IndexMap<String, BoundedRange>,
    /// Years simulated per optimisation period.
    pub iteration_length: u32,
    /// Number of chained optimisation periods.
    pub number_of_iterations: u32,
    /// Criteria any acceptable system must satisfy, keyed by criterion with
    /// the bound as value.
    #[serde(default)]
    pub threshold_criteria: IndexMap<Criterion, f64>,
    /// The criterion the surviving systems are ranked by.
    pub optimisation_criterion: Criterion,
}

impl OptimisationParameters {
    /// All candidate size combinations of the current bounds, fixed sizes
    /// passing through unchanged.
    fn candidate_sizes(&self, fixed: &SystemSizes) -> Vec<SystemSizes> {
        let axis = |range: &Option<BoundedRange>, fixed_value: f64| match range {
            Some(range) => range.values(),
            None => vec![fixed_value],
        };
        let axes = vec![
            axis(&self.pv_sizes, fixed.pv),
            axis(&self.storage_sizes, fixed.storage),
            axis(&self.pvt_sizes, fixed.pvt),
            axis(&self.solar_thermal_sizes, fixed.solar_thermal),
            axis(&self.clean_water_tanks, fixed.clean_water_tanks),
            axis(&self.hot_water_tanks, fixed.hot_water_tanks),
        ];
        let converter_axes: Vec<(String, Vec<f64>)> = self
            .converter_sizes
            .iter()
            .map(|(name, range)| (name.clone(), range.values()))
            .collect();

        let mut all_axes = axes;
        all_axes.extend(converter_axes.iter().map(|(_, values)| values.clone()));

        all_axes
            .into_iter()
            .multi_cartesian_product()
            .map(|point| {
                let mut converters = fixed.converters.clone();
                for (offset, (name, _)) in converter_axes.iter().enumerate() {
                    converters.insert(name.clone(), point[6 + offset]);
                }
                SystemSizes {
                    pv: point[0],
                    storage: point[1],
                    pvt: point[2],
                    solar_thermal: point[3],
                    clean_water_tanks: point[4],
                    hot_water_tanks: point[5],
                    buffer_tanks: fixed.buffer_tanks,
                    converters,
                }
            })
            .collect()
    }

    /// Whether the optimum sits on the upper bound of any searched axis, in
    /// which case the search space was too small.
    fn on_upper_bound(&self, optimum: &SystemSizes) -> bool {
        let at_max = |range: &Option<BoundedRange>, value: f64| {
            range.is_some_and(|range| range.max > range.min && value >= range.max - 1e-9)
        };
        at_max(&self.pv_sizes, optimum.pv)
            || at_max(&self.storage_sizes, optimum.storage)
            || at_max(&self.pvt_sizes, optimum.pvt)
            || at_max(&self.solar_thermal_sizes, optimum.solar_thermal)
            || at_max(&self.clean_water_tanks, optimum.clean_water_tanks)
            || at_max(&self.hot_water_tanks, optimum.hot_water_tanks)
            || self.converter_sizes.iter().any(|(name, range)| {
                range.max > range.min
                    && optimum.converters.get(name).copied().unwrap_or_default()
                        >= range.max - 1e-9
            })
    }

    /// The bounds re-centred so the previous optimum becomes the new floor.
    fn expanded_around(&self, optimum: &SystemSizes) -> Self {
        let expand = |range: &Option<BoundedRange>, value: f64| {
            range.map(|range| {
                if range.max > range.min && value >= range.max - 1e-9 {
                    range.expanded_from(value)
                } else {
                    range
                }
            })
        };
        let mut expanded = self.clone();
        expanded.pv_sizes = expand(&self.pv_sizes, optimum.pv);
        expanded.storage_sizes = expand(&self.storage_sizes, optimum.storage);
        expanded.pvt_sizes = expand(&self.pvt_sizes, optimum.pvt);
        expanded.solar_thermal_sizes = expand(&self.solar_thermal_sizes, optimum.solar_thermal);
        expanded.clean_water_tanks = expand(&self.clean_water_tanks, optimum.clean_water_tanks);
        expanded.hot_water_tanks = expand(&self.hot_water_tanks, optimum.hot_water_tanks);
        for (name, range) in expanded.converter_sizes.iter_mut() {
            let value = optimum.converters.get(name).copied().unwrap_or_default();
            if range.max > range.min && value >= range.max - 1e-9 {
                *range = range.expanded_from(value);
            }
        }
        expanded
    }

    /// The bounds floored at sizes carried over from an earlier period.
    fn floored_at(&self, installed: &SystemSizes) -> Self {
        let mut floored = self.clone();
        floored.pv_sizes = self.pv_sizes.map(|range| range.floored_at(installed.pv));
        floored.storage_sizes = self
            .storage_sizes
            .map(|range| range.floored_at(installed.storage));
        floored.pvt_sizes = self.pvt_sizes.map(|range| range.floored_at(installed.pvt));
        floored.solar_thermal_sizes = self
            .solar_thermal_sizes
            .map(|range| range.floored_at(installed.solar_thermal));
        floored.clean_water_tanks = self
            .clean_water_tanks
            .map(|range| range.floored_at(installed.clean_water_tanks));
        floored.hot_water_tanks = self
            .hot_water_tanks
            .map(|range| range.floored_at(installed.hot_water_tanks));
        for (name, range) in floored.converter_sizes.iter_mut() {
            *range =
                range.floored_at(installed.converters.get(name).copied().unwrap_or_default());
        }
        floored
    }
}

/// All static context one optimisation step needs besides its bounds.
#[derive(Clone, Copy)]
pub struct OptimisationContext<'a> {
    pub minigrid: &'a EnergySystem,
    pub scenario: &'a Scenario,
    pub converters: &'a [Converter],
    pub profiles: &'a Profiles,
    pub impact: Option<&'a ImpactInputs>,
}

/// Sweep the candidate grid over one period and return the appraisal of the
/// optimum system, expanding the bounds whenever the optimum lands on an
/// upper bound.
pub fn optimisation_step(
    context: OptimisationContext,
    parameters: &OptimisationParameters,
    simulation: Simulation,
    previously_installed: &SystemSizes,
) -> anyhow::Result<SystemAppraisal> {
    let mut bounds = parameters.floored_at(previously_installed);
    for expansion in 0..=MAX_BOUND_EXPANSIONS {
        let candidates = bounds.candidate_sizes(previously_installed);
        info!(
            candidates = candidates.len(),
            expansion, "sweeping candidate systems"
        );

        let appraisals: Vec<anyhow::Result<SystemAppraisal>> = candidates
            .into_par_iter()
            .map(|sizes| {
                let (outputs, details) = run_simulation(
                    context.minigrid,
                    context.scenario,
                    context.converters,
                    context.profiles,
                    simulation,
                    &sizes,
                )?;
                Ok(appraise_system(
                    &outputs,
                    &details,
                    context.impact,
                    previously_installed,
                ))
            })
            .collect();

        let mut optimum: Option<SystemAppraisal> = None;
        let mut feasible = 0_usize;
        for appraisal in appraisals {
            let appraisal = appraisal?;
            if !meets_thresholds(&appraisal, &bounds.threshold_criteria) {
                continue;
            }
            feasible += 1;
            let value = appraisal
                .criterion_value(bounds.optimisation_criterion)
                .ok_or_else(|| {
                    MinigridError::input_structure(format!(
                        "Optimisation criterion '{}' was not computed; impact inputs may be \
                         missing",
                        bounds.optimisation_criterion
                    ))
                })?;
            let replace = match &optimum {
                Some(incumbent) => {
                    let incumbent_value = incumbent
                        .criterion_value(bounds.optimisation_criterion)
                        .unwrap_or(f64::NAN);
                    bounds
                        .optimisation_criterion
                        .prefers(value, incumbent_value)
                }
                None => true,
            };
            if replace {
                optimum = Some(appraisal);
            }
        }
        debug!(feasible, "threshold filter applied");

        let Some(optimum) = optimum else {
            return Err(MinigridError::input_structure(
                "No candidate system satisfied the threshold criteria; consider widening the \
                 optimisation bounds or relaxing the thresholds",
            )
            .into());
        };

        if !bounds.on_upper_bound(&optimum.system_details.initial_sizes) {
            return Ok(optimum);
        }
        if expansion == MAX_BOUND_EXPANSIONS {
            warn!(
                "optimum still on an upper bound after {MAX_BOUND_EXPANSIONS} expansions; \
                 returning it as found"
            );
            return Ok(optimum);
        }
        bounds = bounds.expanded_around(&optimum.system_details.initial_sizes);
    }
    unreachable!("the expansion loop always returns");
}

/// Run every chained optimisation period, the degraded final sizes of each
/// period becoming the installed floor of the next.
pub fn multiple_optimisation_step(
    context: OptimisationContext,
    parameters: &OptimisationParameters,
) -> anyhow::Result<Vec<SystemAppraisal>> {
    let mut appraisals = Vec::with_capacity(parameters.number_of_iterations as usize);
    let mut installed = SystemSizes::default();
    for iteration in 0..parameters.number_of_iterations {
        let start_year = iteration * parameters.iteration_length;
        let simulation = Simulation::new(start_year, start_year + parameters.iteration_length);
        info!(
            iteration,
            start_year, "starting optimisation period"
        );
        let appraisal = optimisation_step(context, parameters, simulation, &installed)?;
        installed = appraisal.system_details.final_sizes.clone();
        appraisals.push(appraisal);
    }
    Ok(appraisals)
}

fn meets_thresholds(
    appraisal: &SystemAppraisal,
    thresholds: &IndexMap<Criterion, f64>,
) -> bool {
    thresholds.iter().all(|(criterion, threshold)| {
        appraisal
            .criterion_value(*criterion)
            .is_some_and(|value| criterion.meets_threshold(value, *threshold))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diesel::DieselMode;
    use crate::core::solar::performance::PvPanel;
    use crate::core::storage::battery::BatteryInput;
    use crate::input::{DemandTable, DistributionNetwork, ResourceProfile};
    use approx::assert_relative_eq;
    use rstest::*;

    #[rstest]
    #[case(BoundedRange { min: 0., max: 4., step: 2. }, vec![0., 2., 4.])]
    #[case(BoundedRange { min: 1., max: 1., step: 1. }, vec![1.])]
    #[case(BoundedRange { min: 0., max: 5., step: 2. }, vec![0., 2., 4., 5.])]
    fn bounded_ranges_include_their_endpoints(
        #[case] range: BoundedRange,
        #[case] expected: Vec<f64>,
    ) {
        assert_eq!(range.values(), expected);
    }

    #[rstest]
    fn expansion_re_centres_on_the_old_maximum() {
        let range = BoundedRange {
            min: 0.,
            max: 10.,
            step: 5.,
        };
        let expanded = range.expanded_from(10.);
        assert_relative_eq!(expanded.min, 10.);
        assert_relative_eq!(expanded.max, 20.);
        assert_relative_eq!(expanded.step, 5.);
    }

    fn parameters() -> OptimisationParameters {
        OptimisationParameters {
            pv_sizes: Some(BoundedRange {
                min: 1.,
                max: 5.,
                step: 2.,
            }),
            storage_sizes: Some(BoundedRange {
                min: 1.,
                max: 3.,
                step: 1.,
            }),
            pvt_sizes: None,
            solar_thermal_sizes: None,
            clean_water_tanks: None,
            hot_water_tanks: None,
            converter_sizes: IndexMap::new(),
            iteration_length: 1,
            number_of_iterations: 1,
            threshold_criteria: IndexMap::from([(Criterion::Blackouts, 0.5)]),
            optimisation_criterion: Criterion::Blackouts,
        }
    }

    #[rstest]
    fn candidate_grid_is_the_cartesian_product() {
        let candidates = parameters().candidate_sizes(&SystemSizes::default());
        // 3 PV values x 3 storage values
        assert_eq!(candidates.len(), 9);
        assert!(candidates
            .iter()
            .any(|sizes| sizes.pv == 3. && sizes.storage == 2.));
        // unsearched axes pass the fixed sizes through
        assert!(candidates.iter().all(|sizes| sizes.pvt == 0.));
    }

    fn scenario() -> Scenario {
        Scenario {
            battery: true,
            diesel_mode: DieselMode::Disabled,
            diesel_backup_threshold: None,
            grid: false,
            pv: true,
            pv_t: false,
            solar_thermal: false,
            distribution_network: DistributionNetwork::Dc,
            resource_types: vec![crate::core::conversion::ResourceType::Electric],
            desalination: None,
            hot_water: None,
        }
    }

    fn energy_system() -> EnergySystem {
        EnergySystem {
            dc_transmission_efficiency: Some(1.0),
            battery: Some(BatteryInput {
                capacity: 5.,
                charge_rate: 1.0,
                discharge_rate: 1.0,
                conversion_in: 0.95,
                conversion_out: 0.95,
                leakage: 0.005,
                maximum_charge: 1.0,
                minimum_charge: 0.,
                lifetime_loss: 0.3,
                cycle_lifetime: 1_500.,
            }),
            pv_panel: Some(PvPanel {
                pv_unit: 1.,
                lifetime: 20,
                lifetime_loss: 0.1,
            }),
            ..Default::default()
        }
    }

    fn profiles() -> Profiles {
        let irradiance: Vec<f64> = (0..8760)
            .map(|hour| {
                if (8..16).contains(&(hour % 24)) {
                    900.
                } else {
                    0.
                }
            })
            .collect();
        Profiles {
            electric_load: DemandTable {
                columns: IndexMap::from([("domestic".to_string(), vec![1.; 8760])]),
            },
            clean_water_demand: None,
            hot_water_demand: None,
            solar_irradiance: ResourceProfile::new(irradiance),
            ambient_temperature: ResourceProfile::new(vec![25.; 8760]),
            wind_speed: ResourceProfile::new(vec![3.; 8760]),
            grid_availability: None,
            kerosene_usage: None,
        }
    }

    #[rstest]
    fn optimisation_prefers_the_most_reliable_system() {
        let minigrid = energy_system();
        let scenario = scenario();
        let profiles = profiles();
        let context = OptimisationContext {
            minigrid: &minigrid,
            scenario: &scenario,
            converters: &[],
            profiles: &profiles,
            impact: None,
        };
        let mut parameters = parameters();
        parameters.threshold_criteria = IndexMap::new();
        let optimum = optimisation_step(
            context,
            &parameters,
            Simulation::new(0, 1),
            &SystemSizes::default(),
        )
        .unwrap();
        // minimising blackouts expands the storage bound past its original
        // maximum of 3 until reliability stops improving
        assert!(optimum.system_details.initial_sizes.storage > 3.);
        assert!(optimum.system_details.initial_sizes.pv >= 3.);
        assert!(optimum.technical.blackouts < 0.1);
    }

    #[rstest]
    fn infeasible_thresholds_are_reported() {
        let minigrid = energy_system();
        let scenario = scenario();
        let profiles = profiles();
        let context = OptimisationContext {
            minigrid: &minigrid,
            scenario: &scenario,
            converters: &[],
            profiles: &profiles,
            impact: None,
        };
        let mut parameters = parameters();
        parameters.pv_sizes = Some(BoundedRange {
            min: 0.,
            max: 0.,
            step: 0.,
        });
        parameters.storage_sizes = Some(BoundedRange {
            min: 0.,
            max: 0.,
            step: 0.,
        });
        parameters.threshold_criteria = IndexMap::from([(Criterion::Blackouts, 0.)]);
        let result = optimisation_step(
            context,
            &parameters,
            Simulation::new(0, 1),
            &SystemSizes::default(),
        );
        assert!(result.is_err());
    }

    #[rstest]
    fn re_entry_reproduces_the_same_optimum() {
        let minigrid = energy_system();
        let scenario = scenario();
        let profiles = profiles();
        let context = OptimisationContext {
            minigrid: &minigrid,
            scenario: &scenario,
            converters: &[],
            profiles: &profiles,
            impact: None,
        };
        let mut parameters = parameters();
        parameters.threshold_criteria = IndexMap::new();
        let first = optimisation_step(
            context,
            &parameters,
            Simulation::new(0, 1),
            &SystemSizes::default(),
        )
        .unwrap();
        // re-entering the search floored at the sizes it already settled on
        // settles on those same sizes; nothing drifts
        let second = optimisation_step(
            context,
            &parameters,
            Simulation::new(0, 1),
            &first.system_details.initial_sizes,
        )
        .unwrap();
        assert_eq!(
            first.system_details.initial_sizes,
            second.system_details.initial_sizes
        );
        assert_eq!(
            first.system_details.final_sizes,
            second.system_details.final_sizes
        );
    }

    #[rstest]
    fn chained_periods_carry_degraded_sizes_forward() {
        let minigrid = energy_system();
        let scenario = scenario();
        let profiles = profiles();
        let context = OptimisationContext {
            minigrid: &minigrid,
            scenario: &scenario,
            converters: &[],
            profiles: &profiles,
            impact: None,
        };
        let mut parameters = parameters();
        parameters.threshold_criteria = IndexMap::new();
        parameters.number_of_iterations = 2;
        let appraisals = multiple_optimisation_step(context, &parameters).unwrap();
        assert_eq!(appraisals.len(), 2);
        assert_eq!(appraisals[0].system_details.start_year, 0);
        assert_eq!(appraisals[1].system_details.start_year, 1);
        // the second period never searches below what the first installed
        let first_final = &appraisals[0].system_details.final_sizes;
        let second_initial = &appraisals[1].system_details.initial_sizes;
        assert!(second_initial.pv >= first_final.pv - 1e-9);
        assert!(second_initial.storage >= first_final.storage - 1e-9);
    }
}
