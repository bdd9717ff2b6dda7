use crate::compare_floats::{clamp, max_of_2, min_of_2};
use crate::core::conversion::{Converter, ResourceType};
use serde::{Deserialize, Serialize};

/// The policy governing when electric desalination may run.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanWaterMode {
    /// Electric desalination only consumes surplus renewable energy.
    Backup,
    /// Remaining water demand is always met by electric desalination,
    /// drawing on storage, treating water reliability as higher priority
    /// than minimising battery draw.
    Prioritise,
    /// Electric desalination is bypassed entirely; clean water comes from
    /// the thermal desalination plant alone.
    ThermalOnly,
}

/// Static parameters of one clean-water storage tank.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CleanWaterTank {
    /// Volume of one tank, in litres.
    pub capacity: f64,
    /// Fraction of the stored volume lost per hour.
    pub leakage: f64,
    /// Highest permitted fill fraction.
    pub maximum_water: f64,
    /// Lowest permitted fill fraction.
    pub minimum_water: f64,
    pub lifetime: u32,
}

impl CleanWaterTank {
    /// Storage bounds in litres for a bank of `number_of_tanks` tanks.
    pub fn storage_bounds(&self, number_of_tanks: f64) -> (f64, f64) {
        (
            self.capacity * number_of_tanks * self.minimum_water,
            self.capacity * number_of_tanks * self.maximum_water,
        )
    }
}

/// A hot-water or HTF buffer tank decoupling collector output from its
/// downstream thermal consumer.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HotWaterTank {
    /// Volume of one tank, in litres.
    pub capacity: f64,
    /// Fraction of the stored volume lost per hour.
    pub leakage: f64,
    /// External surface area of one tank, in m2.
    pub area: f64,
    /// Heat loss through the tank surface, in W/m2*K.
    pub heat_loss_coefficient: f64,
    /// Specific heat capacity of the tank contents, in J/kg*K.
    pub heat_capacity: f64,
    /// Temperature of the mains water replacing any volume withdrawn, in
    /// Celsius.
    pub replacement_temperature: f64,
    pub lifetime: u32,
}

impl HotWaterTank {
    /// Heat transfer coefficient of the whole tank surface, in W/K.
    pub fn heat_transfer_coefficient(&self) -> f64 {
        self.area * self.heat_loss_coefficient
    }

    /// Thermal mass of the tank contents, in J/K, taking the density of the
    /// contents as that of water.
    pub fn thermal_mass(&self) -> f64 {
        self.capacity * self.heat_capacity
    }
}

/// The inputs to one hour of the clean-water tank cascade.
#[derive(Clone, Copy, Debug)]
pub struct CleanWaterStep {
    /// Tank level at the end of the previous hour, in litres.
    pub previous_level: f64,
    /// Renewably produced clean water this hour (thermal desalination and
    /// any renewably powered sources), in litres.
    pub water_produced: f64,
    /// Clean-water demand this hour, in litres.
    pub water_demand: f64,
    /// Surplus electric energy reported by the battery accounting, in kWh.
    pub excess_energy: f64,
    /// Electric energy available from storage above its minimum, in kWh.
    pub battery_energy_available: f64,
    pub mode: CleanWaterMode,
    /// Electric energy needed to desalinate one litre, in kWh/l.
    pub energy_per_desalinated_litre: f64,
    /// Maximum output of the electric desalinator, in litres/hour.
    pub maximum_water_throughput: f64,
    pub minimum_storage: f64,
    pub maximum_storage: f64,
    /// Fraction of the stored volume lost this hour.
    pub leakage: f64,
}

/// The per-hour accounting produced by the clean-water cascade.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CleanWaterStepResult {
    /// Clamped tank level at the end of the hour, in litres.
    pub new_level: f64,
    /// Surplus electric energy left after desalination consumed its share,
    /// fed back into the battery surplus accounting for the hour.
    pub excess_energy_remaining: f64,
    pub excess_energy_used_desalinating: f64,
    pub excess_energy_water_desalinated: f64,
    pub backup_desalinator_water_supplied: f64,
    /// Electric energy the backup desalinator drew from storage, in kWh.
    pub backup_desalination_energy: f64,
    pub conventional_water_supplied: f64,
    pub storage_water_supplied: f64,
    pub unmet_water: f64,
    pub water_surplus: f64,
}

/// Advance the clean-water tank by one hour.
///
/// The sequence is a priority cascade and the order is load-bearing:
/// excess-energy desalination tops the tank up first (BACKUP policy), backup
/// desalination then meets any remaining deficit (PRIORITISE policy),
/// conventional sources are the final fallback, and whatever deficit
/// survives is reported as unmet. Both desalination steps read the same
/// battery state within the hour; the excess-energy step runs first.
pub fn clean_water_tank_step(
    step: CleanWaterStep,
    conventional_sources: &[&Converter],
) -> CleanWaterStepResult {
    let mut result = CleanWaterStepResult {
        excess_energy_remaining: step.excess_energy,
        ..Default::default()
    };

    let retained = step.previous_level * (1. - step.leakage);
    let mut net_level = retained + step.water_produced - step.water_demand;

    // Excess-energy desalination: soak up surplus renewable electricity as
    // stored clean water, bounded by the desalinator throughput and the
    // remaining tank headroom.
    if step.excess_energy > 0.
        && step.mode == CleanWaterMode::Backup
        && step.energy_per_desalinated_litre > 0.
    {
        let headroom = max_of_2(step.maximum_storage - net_level, 0.);
        let desalinated = min_of_2(
            min_of_2(
                step.excess_energy / step.energy_per_desalinated_litre,
                step.maximum_water_throughput,
            ),
            headroom,
        );
        if desalinated > 0. {
            let energy_used = desalinated * step.energy_per_desalinated_litre;
            net_level += desalinated;
            result.excess_energy_water_desalinated = desalinated;
            result.excess_energy_used_desalinating = energy_used;
            result.excess_energy_remaining = step.excess_energy - energy_used;
        }
    }

    // Backup desalination: meet the remaining deficit exactly, limited only
    // by the energy available from storage.
    let mut deficit = max_of_2(step.minimum_storage - net_level, 0.);
    if deficit > 0.
        && step.mode == CleanWaterMode::Prioritise
        && step.energy_per_desalinated_litre > 0.
    {
        let supplied = min_of_2(
            deficit,
            step.battery_energy_available / step.energy_per_desalinated_litre,
        );
        if supplied > 0. {
            net_level += supplied;
            result.backup_desalinator_water_supplied = supplied;
            result.backup_desalination_energy = supplied * step.energy_per_desalinated_litre;
        }
    }

    // Conventional sources as the final fallback.
    deficit = max_of_2(step.minimum_storage - net_level, 0.);
    if deficit > 0. {
        let availability: f64 = conventional_sources
            .iter()
            .filter(|source| source.output_resource_type() == ResourceType::CleanWater)
            .map(|source| source.maximum_output_capacity())
            .sum();
        let supplied = min_of_2(deficit, availability);
        if supplied > 0. {
            net_level += supplied;
            result.conventional_water_supplied = supplied;
        }
    }

    result.unmet_water = max_of_2(step.minimum_storage - net_level, 0.);
    result.water_surplus = max_of_2(net_level - step.maximum_storage, 0.);
    result.new_level = clamp(net_level, step.minimum_storage, step.maximum_storage);
    result.storage_water_supplied = max_of_2(retained - result.new_level, 0.);

    result
}

impl CleanWaterStep {
    pub fn leakage(mut self, leakage: f64) -> Self {
        self.leakage = leakage;
        self
    }
}
