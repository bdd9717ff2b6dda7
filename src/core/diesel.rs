use crate::compare_floats::max_of_2;
use crate::statistics::{mean, percentile};
use serde::{Deserialize, Serialize};

/// How the diesel generator participates in the system.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DieselMode {
    /// The generator covers the worst unmet-energy hours so that the system
    /// meets a target reliability.
    Backup,
    /// Present in the input vocabulary but rejected as unsupported before
    /// the hourly loop runs.
    CycleCharging,
    Disabled,
}

/// Static parameters of the backup diesel generator.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DieselGenerator {
    /// Fuel consumed per kWh generated at full load, in litres/kWh.
    pub diesel_consumption: f64,
    /// Lowest load factor at which the engine can run efficiently; load
    /// factors below this are clamped up when computing fuel usage.
    pub minimum_load: f64,
    pub lifetime: u32,
}

/// The result of sizing and dispatching the diesel backup over a horizon.
#[derive(Clone, Debug, PartialEq)]
pub struct DieselDispatch {
    /// Unmet energy at or above which the generator activates, in kWh.
    pub energy_threshold: f64,
    /// Energy generated in each hour, in kWh.
    pub diesel_energy: Vec<f64>,
    /// 1.0 in hours where the generator ran, else 0.0.
    pub diesel_times: Vec<f64>,
}

/// Determine the energy-deficit threshold above which the generator
/// activates, then dispatch it for every hour at or above that threshold.
///
/// The threshold is chosen so that the generator shaves off just enough of
/// the worst deficit hours to close the gap between the observed blackout
/// fraction and the target reliability threshold. If the target is already
/// met, the threshold is set above the worst deficit and the generator
/// never runs.
pub fn diesel_dispatch(
    unmet_energy: &[f64],
    blackouts: &[f64],
    backup_threshold: f64,
) -> DieselDispatch {
    let blackout_fraction = mean(blackouts);
    let reliability_difference = blackout_fraction - backup_threshold;

    let energy_threshold = if reliability_difference > 0. {
        percentile(unmet_energy, 100. * (1. - reliability_difference))
    } else {
        unmet_energy.iter().cloned().fold(0., max_of_2) + 1.
    };

    let diesel_times: Vec<f64> = unmet_energy
        .iter()
        .map(|unmet| if *unmet >= energy_threshold { 1. } else { 0. })
        .collect();
    let diesel_energy: Vec<f64> = unmet_energy
        .iter()
        .zip(diesel_times.iter())
        .map(|(unmet, on)| unmet * on)
        .collect();

    DieselDispatch {
        energy_threshold,
        diesel_energy,
        diesel_times,
    }
}

impl DieselGenerator {
    /// Hourly fuel consumption in litres for a generator of the given rated
    /// capacity producing the given energy series.
    ///
    /// Diesel engines cannot idle below a minimum efficient load, so load
    /// factors under `minimum_load` are clamped up before converting to
    /// litres.
    pub fn fuel_usage(&self, capacity: f64, diesel_energy: &[f64], diesel_times: &[f64]) -> Vec<f64> {
        diesel_energy
            .iter()
            .zip(diesel_times.iter())
            .map(|(energy, on)| {
                if *on == 0. || capacity == 0. {
                    return 0.;
                }
                let load_factor = max_of_2(energy / capacity, self.minimum_load);
                load_factor * capacity * self.diesel_consumption
            })
            .collect()
    }
}

/// The installed generator capacity needed to cover the dispatched energy.
pub fn diesel_capacity(diesel_energy: &[f64]) -> f64 {
    diesel_energy.iter().cloned().fold(0., max_of_2).ceil()
}
