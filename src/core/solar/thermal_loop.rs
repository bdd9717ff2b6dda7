use crate::compare_floats::{clamp, max_of_2};
use crate::core::solar::performance::ThermalCollector;
use crate::core::storage::water_tank::HotWaterTank;
use crate::core::units::{celsius_to_kelvin, kelvin_to_celsius, SECONDS_PER_HOUR};
use crate::errors::MinigridError;
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Absolute change in the guessed collector input temperature below which
/// the fixed-point iteration is considered converged, in Celsius.
pub const CONVERGENCE_TOLERANCE: f64 = 1.44;
/// Iteration count past which a slow-convergence diagnostic is logged.
const SLOW_CONVERGENCE_ITERATIONS: usize = 10;
/// Hard bound on the fixed-point iteration; exceeding it is a reportable
/// non-convergence error rather than an unbounded loop.
pub const MAX_SOLVER_ITERATIONS: usize = 50;

/// Irradiance at or below which the collector is assumed to be thermally at
/// equilibrium with its surroundings, in W/m2. The steady-state
/// approximation is justified by the coarse one-hour time resolution.
const MINIMUM_IRRADIANCE: f64 = 0.;

/// A heat exchanger coupling the collector HTF loop to the buffer tank.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HeatExchanger {
    /// Fraction of the HTF/tank temperature difference exchanged per pass.
    pub efficiency: f64,
    pub lifetime: u32,
}

/// The circulation pump driving HTF through the collector array.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WaterPump {
    /// Electric power drawn while running, in kW.
    pub power: f64,
    /// Total HTF throughput, in litres/hour.
    pub throughput: f64,
    pub lifetime: u32,
}

/// The downstream thermal consumer drawing on the buffer tank.
#[derive(Clone, Copy, Debug)]
pub enum ThermalLoad<'a> {
    /// A thermal desalination plant with a minimum operating HTF
    /// temperature and a rated HTF draw while running.
    Desalination {
        minimum_operating_temperature: f64,
        htf_volume_per_hour: f64,
    },
    /// Hot-water demand served directly from the tank at a required
    /// delivery temperature.
    HotWater {
        demand_temperature: f64,
        demand_volume: &'a [f64],
    },
}

impl ThermalLoad<'_> {
    /// The volume drawn from the tank this hour, in litres, given the tank
    /// temperature at the end of the previous hour.
    fn volume_withdrawn(&self, hour_index: usize, previous_tank_temperature: f64) -> f64 {
        match self {
            ThermalLoad::Desalination {
                minimum_operating_temperature,
                htf_volume_per_hour,
            } => {
                if previous_tank_temperature > *minimum_operating_temperature {
                    *htf_volume_per_hour
                } else {
                    0.
                }
            }
            ThermalLoad::HotWater {
                demand_temperature,
                demand_volume,
            } => {
                if previous_tank_temperature > *demand_temperature {
                    demand_volume[hour_index]
                } else {
                    0.
                }
            }
        }
    }
}

/// The static description of one collector/tank loop.
#[derive(Clone, Copy, Debug)]
pub struct ThermalLoopSpec<'a> {
    pub collector: ThermalCollector<'a>,
    /// Number of collectors installed.
    pub system_size: f64,
    pub heat_exchanger: &'a HeatExchanger,
    /// Specific heat capacity of the HTF, in J/kg*K.
    pub htf_heat_capacity: f64,
    pub tank: &'a HotWaterTank,
    pub number_of_tanks: f64,
    pub pump: &'a WaterPump,
    pub load: ThermalLoad<'a>,
}

/// The time-indexed series produced by solving one collector/tank loop over
/// a simulation window. Every series has one value per hour, written once,
/// in monotonically increasing hour order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThermalLoopProfiles {
    /// HTF temperature entering the collector, in Celsius.
    pub collector_input_temperature: Vec<f64>,
    /// HTF temperature leaving the collector, in Celsius.
    pub collector_output_temperature: Vec<f64>,
    /// 1.0 in hours where the circulation pump ran, else 0.0.
    pub pump_times: Vec<f64>,
    /// Buffer-tank temperature, in Celsius.
    pub tank_temperature: Vec<f64>,
    /// Volume supplied from the tank to the downstream consumer, in litres.
    pub tank_volume_supplied: Vec<f64>,
    /// Fractional electric performance per unit PV-T capacity installed
    /// (zero for purely thermal collectors).
    pub electric_power_per_unit: Vec<f64>,
}

/// Solve the coupled collector/tank system hour by hour over the window
/// covered by the supplied condition series.
///
/// The collector model depends nonlinearly on the input temperature being
/// solved for, so each closed-loop hour is a fixed-point iteration: guess
/// the collector input temperature, evaluate the collector, solve the 2x2
/// linear system (tank energy balance plus heat-exchanger relation) for the
/// input and tank temperatures in Kelvin, and repeat with the newly solved
/// input temperature until the change is within tolerance.
pub fn solve_thermal_loop(
    spec: &ThermalLoopSpec,
    irradiances: &[f64],
    ambient_temperatures: &[f64],
    wind_speeds: &[f64],
) -> Result<ThermalLoopProfiles, MinigridError> {
    if spec.system_size <= 0. || spec.number_of_tanks <= 0. {
        return Err(MinigridError::input_structure(
            "Solar-thermal loop requested with no collectors or no buffer tanks installed",
        ));
    }
    if irradiances.len() != ambient_temperatures.len() || irradiances.len() != wind_speeds.len() {
        return Err(MinigridError::internal(
            "Condition series passed to the thermal loop have mismatched lengths",
        ));
    }

    let total_hours = irradiances.len();
    let mut profiles = ThermalLoopProfiles {
        collector_input_temperature: Vec::with_capacity(total_hours),
        collector_output_temperature: Vec::with_capacity(total_hours),
        pump_times: Vec::with_capacity(total_hours),
        tank_temperature: Vec::with_capacity(total_hours),
        tank_volume_supplied: Vec::with_capacity(total_hours),
        electric_power_per_unit: Vec::with_capacity(total_hours),
    };

    // HTF flow split across the collector array, in litres/hour.
    let flow_per_collector = collector_mass_flow_rate(spec);
    // Total HTF mass flow through the heat exchanger, in kg/s.
    let mass_flow_rate_kg_s =
        flow_per_collector * spec.system_size / SECONDS_PER_HOUR as f64;

    for hour_index in 0..total_hours {
        let irradiance = irradiances[hour_index];
        let ambient_temperature = ambient_temperatures[hour_index];
        let wind_speed = wind_speeds[hour_index];

        // Cold start from the tank replacement temperature.
        let (previous_input, previous_output, previous_tank) = if hour_index == 0 {
            (
                ambient_temperature,
                ambient_temperature,
                spec.tank.replacement_temperature,
            )
        } else {
            (
                profiles.collector_input_temperature[hour_index - 1],
                profiles.collector_output_temperature[hour_index - 1],
                profiles.tank_temperature[hour_index - 1],
            )
        };

        let volume_withdrawn = spec.load.volume_withdrawn(hour_index, previous_tank);
        let collector_flow_on =
            previous_output > previous_tank && irradiance > MINIMUM_IRRADIANCE;

        let hour_solution = if irradiance <= MINIMUM_IRRADIANCE {
            // Overnight the collector equilibrates with the warmer of the
            // ambient air or the tank's replacement supply.
            let equilibrium =
                max_of_2(ambient_temperature, spec.tank.replacement_temperature);
            let tank_temperature = solve_tank_only(
                spec,
                previous_tank,
                ambient_temperature,
                volume_withdrawn,
            )?;
            HourSolution {
                input_temperature: equilibrium,
                output_temperature: equilibrium,
                tank_temperature,
                electric_performance: 0.,
                pump_on: false,
            }
        } else if !collector_flow_on {
            // The collector sees sun but its output is no warmer than the
            // tank, so the loop is not circulated and the two decouple.
            let (electric_performance, output_temperature) =
                spec.collector.calculate_performance(
                    ambient_temperature,
                    spec.htf_heat_capacity,
                    previous_input,
                    flow_per_collector,
                    irradiance,
                    wind_speed,
                )?;
            let tank_temperature = solve_tank_only(
                spec,
                previous_tank,
                ambient_temperature,
                volume_withdrawn,
            )?;
            HourSolution {
                input_temperature: previous_input,
                output_temperature,
                tank_temperature,
                electric_performance: electric_performance.unwrap_or_default(),
                pump_on: false,
            }
        } else {
            solve_closed_loop_hour(
                spec,
                hour_index,
                ClosedLoopConditions {
                    ambient_temperature,
                    irradiance,
                    wind_speed,
                    flow_per_collector,
                    mass_flow_rate_kg_s,
                    previous_input,
                    previous_tank,
                    volume_withdrawn,
                },
            )?
        };

        profiles
            .collector_input_temperature
            .push(hour_solution.input_temperature);
        profiles
            .collector_output_temperature
            .push(hour_solution.output_temperature);
        profiles
            .pump_times
            .push(if hour_solution.pump_on { 1. } else { 0. });
        profiles.tank_temperature.push(hour_solution.tank_temperature);
        profiles.tank_volume_supplied.push(volume_withdrawn);
        profiles
            .electric_power_per_unit
            .push(hour_solution.electric_performance);
    }

    Ok(profiles)
}

struct HourSolution {
    input_temperature: f64,
    output_temperature: f64,
    tank_temperature: f64,
    electric_performance: f64,
    pump_on: bool,
}

struct ClosedLoopConditions {
    ambient_temperature: f64,
    irradiance: f64,
    wind_speed: f64,
    flow_per_collector: f64,
    mass_flow_rate_kg_s: f64,
    previous_input: f64,
    previous_tank: f64,
    volume_withdrawn: f64,
}

/// One closed-loop hour: fixed-point iteration over the collector input
/// temperature.
fn solve_closed_loop_hour(
    spec: &ThermalLoopSpec,
    hour_index: usize,
    conditions: ClosedLoopConditions,
) -> Result<HourSolution, MinigridError> {
    let mut best_guess_input = conditions.previous_input;
    let mut iterations = 0;

    loop {
        iterations += 1;
        if iterations > MAX_SOLVER_ITERATIONS {
            return Err(MinigridError::NonConvergence {
                hour: hour_index,
                iterations: MAX_SOLVER_ITERATIONS,
            });
        }
        if iterations == SLOW_CONVERGENCE_ITERATIONS {
            warn!(
                hour = hour_index,
                "collector/tank solver has not converged after {SLOW_CONVERGENCE_ITERATIONS} \
                 iterations"
            );
        }

        let (electric_performance, output_temperature) = spec.collector.calculate_performance(
            conditions.ambient_temperature,
            spec.htf_heat_capacity,
            best_guess_input,
            conditions.flow_per_collector,
            conditions.irradiance,
            conditions.wind_speed,
        )?;

        let (input_temperature, tank_temperature) = solve_coupled_system(
            spec,
            &conditions,
            output_temperature,
        )?;

        if (input_temperature - best_guess_input).abs() < CONVERGENCE_TOLERANCE {
            return Ok(HourSolution {
                input_temperature,
                output_temperature,
                tank_temperature,
                electric_performance: electric_performance.unwrap_or_default(),
                pump_on: true,
            });
        }
        best_guess_input = input_temperature;
    }
}

/// Solve the 2x2 linear system coupling the collector input temperature and
/// the tank temperature, in Kelvin, for a fixed collector output
/// temperature.
///
/// Row 0 is the heat-exchanger relation
/// `T_in = (1 - eff) * T_out + eff * T_tank`; row 1 is the tank energy
/// balance over the hour (thermal mass, heat exchanged, surface losses, and
/// volume withdrawn replaced at the replacement temperature).
fn solve_coupled_system(
    spec: &ThermalLoopSpec,
    conditions: &ClosedLoopConditions,
    output_temperature: f64,
) -> Result<(f64, f64), MinigridError> {
    let seconds_per_hour = SECONDS_PER_HOUR as f64;
    let efficiency = spec.heat_exchanger.efficiency;

    let output_temperature_k =
        celsius_to_kelvin(output_temperature).map_err(|e| MinigridError::internal(e.to_string()))?;
    let previous_tank_k = celsius_to_kelvin(conditions.previous_tank)
        .map_err(|e| MinigridError::internal(e.to_string()))?;
    let ambient_k = celsius_to_kelvin(conditions.ambient_temperature)
        .map_err(|e| MinigridError::internal(e.to_string()))?;
    let replacement_k = celsius_to_kelvin(spec.tank.replacement_temperature)
        .map_err(|e| MinigridError::internal(e.to_string()))?;

    // All coefficients in W/K.
    let thermal_mass_per_second =
        spec.tank.thermal_mass() * spec.number_of_tanks / seconds_per_hour;
    let heat_exchange = efficiency * conditions.mass_flow_rate_kg_s * spec.htf_heat_capacity;
    let surface_losses = spec.tank.heat_transfer_coefficient() * spec.number_of_tanks;
    let withdrawal = conditions.volume_withdrawn * spec.tank.heat_capacity / seconds_per_hour;

    let tank_coefficient =
        thermal_mass_per_second + heat_exchange + surface_losses + withdrawal;

    let matrix = Matrix2::new(
        1.,
        -efficiency,
        0.,
        tank_coefficient,
    );
    let rhs = Vector2::new(
        (1. - efficiency) * output_temperature_k,
        thermal_mass_per_second * previous_tank_k
            + heat_exchange * output_temperature_k
            + surface_losses * ambient_k
            + withdrawal * replacement_k,
    );

    let solution = matrix.lu().solve(&rhs).ok_or_else(|| {
        MinigridError::internal("Collector/tank matrix was singular and could not be solved")
    })?;

    let tank_temperature =
        kelvin_to_celsius(solution[1]).map_err(|e| MinigridError::internal(e.to_string()))?;
    let input_temperature =
        kelvin_to_celsius(solution[0]).map_err(|e| MinigridError::internal(e.to_string()))?;

    Ok((input_temperature, tank_temperature))
}

/// Tank evolution for hours where the collector loop is not circulating:
/// only surface losses and the withdrawn volume act on the tank.
fn solve_tank_only(
    spec: &ThermalLoopSpec,
    previous_tank: f64,
    ambient_temperature: f64,
    volume_withdrawn: f64,
) -> Result<f64, MinigridError> {
    let seconds_per_hour = SECONDS_PER_HOUR as f64;
    let previous_tank_k = celsius_to_kelvin(previous_tank)
        .map_err(|e| MinigridError::internal(e.to_string()))?;
    let ambient_k = celsius_to_kelvin(ambient_temperature)
        .map_err(|e| MinigridError::internal(e.to_string()))?;
    let replacement_k = celsius_to_kelvin(spec.tank.replacement_temperature)
        .map_err(|e| MinigridError::internal(e.to_string()))?;

    let thermal_mass_per_second =
        spec.tank.thermal_mass() * spec.number_of_tanks / seconds_per_hour;
    let surface_losses = spec.tank.heat_transfer_coefficient() * spec.number_of_tanks;
    let withdrawal = volume_withdrawn * spec.tank.heat_capacity / seconds_per_hour;

    let tank_k = (thermal_mass_per_second * previous_tank_k
        + surface_losses * ambient_k
        + withdrawal * replacement_k)
        / (thermal_mass_per_second + surface_losses + withdrawal);

    kelvin_to_celsius(tank_k).map_err(|e| MinigridError::internal(e.to_string()))
}

/// HTF flow through one collector, clamped into the panel's permitted range
/// where it declares one.
fn collector_mass_flow_rate(spec: &ThermalLoopSpec) -> f64 {
    let flow = spec.pump.throughput / spec.system_size;
    match spec.collector {
        ThermalCollector::Pvt(panel) => {
            clamp(flow, panel.min_mass_flow_rate, panel.max_mass_flow_rate)
        }
        ThermalCollector::SolarThermal(_) => flow,
    }
}
