//! Post-simulation appraisal: condensing the hourly result table into the
//! technical, financial and environmental figures that optimisation ranks
//! candidate systems by.

use crate::simulation::{ColumnHeader, SimulationOutputs, SystemDetails, SystemSizes};
use crate::statistics::mean;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// A figure of merit computed for every simulated system.
///
/// Each criterion has an intrinsic direction: a system is better when a
/// `Minimise` criterion is lower and when a `Maximise` criterion is higher.
/// Threshold filters and the optimisation ranking both read this direction.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Criterion {
    Blackouts,
    UnmetEnergyFraction,
    RenewablesFraction,
    TotalSystemCost,
    LcueEstimate,
    TotalEmissions,
    CleanWaterBlackouts,
    UnmetCleanWaterFraction,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CriterionDirection {
    Minimise,
    Maximise,
}

impl Criterion {
    pub fn direction(&self) -> CriterionDirection {
        match self {
            Criterion::RenewablesFraction => CriterionDirection::Maximise,
            Criterion::Blackouts
            | Criterion::UnmetEnergyFraction
            | Criterion::TotalSystemCost
            | Criterion::LcueEstimate
            | Criterion::TotalEmissions
            | Criterion::CleanWaterBlackouts
            | Criterion::UnmetCleanWaterFraction => CriterionDirection::Minimise,
        }
    }

    /// Whether `candidate` is at least as good as `incumbent` under this
    /// criterion's direction.
    pub fn prefers(&self, candidate: f64, incumbent: f64) -> bool {
        match self.direction() {
            CriterionDirection::Minimise => candidate < incumbent,
            CriterionDirection::Maximise => candidate > incumbent,
        }
    }

    /// Whether `value` satisfies a threshold under this criterion's
    /// direction: an upper bound for `Minimise` criteria, a lower bound for
    /// `Maximise` criteria.
    pub fn meets_threshold(&self, value: f64, threshold: f64) -> bool {
        match self.direction() {
            CriterionDirection::Minimise => value <= threshold,
            CriterionDirection::Maximise => value >= threshold,
        }
    }
}

/// Cost and emissions coefficients for one unit of one component.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentImpact {
    /// Capital cost per unit installed, in currency units.
    pub cost: f64,
    /// Embodied emissions per unit installed, in kgCO2eq.
    pub emissions: f64,
}

/// Cost and emissions coefficients for the whole system, supplied with the
/// input document.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ImpactInputs {
    #[serde(default)]
    pub pv: ComponentImpact,
    #[serde(default)]
    pub pvt: ComponentImpact,
    #[serde(default)]
    pub solar_thermal: ComponentImpact,
    #[serde(default)]
    pub storage: ComponentImpact,
    #[serde(default)]
    pub clean_water_tank: ComponentImpact,
    #[serde(default)]
    pub hot_water_tank: ComponentImpact,
    /// Per kW of installed diesel capacity.
    #[serde(default)]
    pub diesel_generator: ComponentImpact,
    /// Per unit capacity of each named converter.
    #[serde(default)]
    pub converters: IndexMap<String, ComponentImpact>,
    /// Diesel fuel cost per litre.
    #[serde(default)]
    pub diesel_fuel_cost: f64,
    /// Diesel fuel emissions per litre, in kgCO2eq.
    #[serde(default)]
    pub diesel_fuel_emissions: f64,
    /// Grid electricity cost per kWh.
    #[serde(default)]
    pub grid_cost: f64,
    /// Grid electricity emissions per kWh, in kgCO2eq.
    #[serde(default)]
    pub grid_emissions: f64,
}

/// Reliability and energy-mix figures for one simulated period.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TechnicalAppraisal {
    pub blackouts: f64,
    pub total_load_energy: f64,
    pub unmet_energy: f64,
    pub unmet_energy_fraction: f64,
    pub renewable_energy_used: f64,
    pub renewables_fraction: f64,
    pub diesel_energy: f64,
    pub diesel_fuel_usage: f64,
    pub grid_energy: f64,
    pub clean_water_blackouts: Option<f64>,
    pub total_clean_water_demand: Option<f64>,
    pub unmet_clean_water: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FinancialAppraisal {
    pub new_equipment_costs: f64,
    pub diesel_fuel_cost: f64,
    pub grid_cost: f64,
    pub total_system_cost: f64,
    /// Levelised cost of used electricity over the period, in currency
    /// units per kWh actually supplied.
    pub lcue_estimate: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EnvironmentalAppraisal {
    pub new_equipment_emissions: f64,
    pub diesel_fuel_emissions: f64,
    pub grid_emissions: f64,
    pub total_emissions: f64,
}

/// The complete appraisal of one simulated system, carrying everything the
/// optimisation needs to filter, rank and chain periods.
#[derive(Clone, Debug, Serialize)]
pub struct SystemAppraisal {
    pub system_details: SystemDetails,
    pub technical: TechnicalAppraisal,
    pub financial: FinancialAppraisal,
    pub environmental: EnvironmentalAppraisal,
    pub criteria: IndexMap<Criterion, f64>,
}

impl SystemAppraisal {
    pub fn criterion_value(&self, criterion: Criterion) -> Option<f64> {
        self.criteria.get(&criterion).copied()
    }
}

fn column_sum(outputs: &SimulationOutputs, header: ColumnHeader) -> f64 {
    outputs
        .series(header)
        .map(|series| series.iter().sum())
        .unwrap_or_default()
}

fn column_mean(outputs: &SimulationOutputs, header: ColumnHeader) -> Option<f64> {
    outputs.series(header).map(mean)
}

/// Appraise one completed simulation.
///
/// `previously_installed` carries the component sizes already paid for in
/// earlier periods; only the increment counts as new equipment here.
/// Without impact coefficients the financial and environmental figures stay
/// at zero and only the technical criteria are populated.
pub fn appraise_system(
    outputs: &SimulationOutputs,
    details: &SystemDetails,
    impact: Option<&ImpactInputs>,
    previously_installed: &SystemSizes,
) -> SystemAppraisal {
    let total_load_energy = column_sum(outputs, ColumnHeader::LoadEnergy);
    let unmet_energy = column_sum(outputs, ColumnHeader::UnmetEnergy);
    let energy_used = (total_load_energy - unmet_energy).max(0.);
    let renewable_energy_used = column_sum(outputs, ColumnHeader::RenewablesEnergyUsedDirectly)
        + column_sum(outputs, ColumnHeader::BatteryEnergySupplied);

    let technical = TechnicalAppraisal {
        blackouts: column_mean(outputs, ColumnHeader::Blackouts).unwrap_or_default(),
        total_load_energy,
        unmet_energy,
        unmet_energy_fraction: if total_load_energy > 0. {
            unmet_energy / total_load_energy
        } else {
            0.
        },
        renewable_energy_used,
        renewables_fraction: if energy_used > 0. {
            renewable_energy_used / energy_used
        } else {
            0.
        },
        diesel_energy: column_sum(outputs, ColumnHeader::DieselEnergy),
        diesel_fuel_usage: column_sum(outputs, ColumnHeader::DieselFuelUsage),
        grid_energy: column_sum(outputs, ColumnHeader::GridEnergy),
        clean_water_blackouts: column_mean(outputs, ColumnHeader::CleanWaterBlackouts),
        total_clean_water_demand: outputs
            .series(ColumnHeader::TotalCleanWaterDemand)
            .map(|series| series.iter().sum()),
        unmet_clean_water: outputs
            .series(ColumnHeader::UnmetCleanWater)
            .map(|series| series.iter().sum()),
    };

    let (financial, environmental) = match impact {
        Some(impact) => {
            let increment = new_equipment(&details.initial_sizes, previously_installed);
            let mut equipment_cost = increment.pv * impact.pv.cost
                + increment.storage * impact.storage.cost
                + increment.pvt * impact.pvt.cost
                + increment.solar_thermal * impact.solar_thermal.cost
                + increment.clean_water_tanks * impact.clean_water_tank.cost
                + increment.hot_water_tanks * impact.hot_water_tank.cost
                + details.diesel_capacity * impact.diesel_generator.cost;
            let mut equipment_emissions = increment.pv * impact.pv.emissions
                + increment.storage * impact.storage.emissions
                + increment.pvt * impact.pvt.emissions
                + increment.solar_thermal * impact.solar_thermal.emissions
                + increment.clean_water_tanks * impact.clean_water_tank.emissions
                + increment.hot_water_tanks * impact.hot_water_tank.emissions
                + details.diesel_capacity * impact.diesel_generator.emissions;
            for (name, size) in &increment.converters {
                if let Some(coefficients) = impact.converters.get(name) {
                    equipment_cost += size * coefficients.cost;
                    equipment_emissions += size * coefficients.emissions;
                }
            }

            let diesel_fuel_cost = technical.diesel_fuel_usage * impact.diesel_fuel_cost;
            let grid_cost = technical.grid_energy * impact.grid_cost;
            let total_system_cost = equipment_cost + diesel_fuel_cost + grid_cost;
            let financial = FinancialAppraisal {
                new_equipment_costs: equipment_cost,
                diesel_fuel_cost,
                grid_cost,
                total_system_cost,
                lcue_estimate: if energy_used > 0. {
                    total_system_cost / energy_used
                } else {
                    0.
                },
            };

            let diesel_fuel_emissions =
                technical.diesel_fuel_usage * impact.diesel_fuel_emissions;
            let grid_emissions = technical.grid_energy * impact.grid_emissions;
            let environmental = EnvironmentalAppraisal {
                new_equipment_emissions: equipment_emissions,
                diesel_fuel_emissions,
                grid_emissions,
                total_emissions: equipment_emissions + diesel_fuel_emissions + grid_emissions,
            };

            (financial, environmental)
        }
        None => (Default::default(), Default::default()),
    };

    let mut criteria = IndexMap::from([
        (Criterion::Blackouts, technical.blackouts),
        (
            Criterion::UnmetEnergyFraction,
            technical.unmet_energy_fraction,
        ),
        (
            Criterion::RenewablesFraction,
            technical.renewables_fraction,
        ),
    ]);
    if impact.is_some() {
        criteria.insert(Criterion::TotalSystemCost, financial.total_system_cost);
        criteria.insert(Criterion::LcueEstimate, financial.lcue_estimate);
        criteria.insert(Criterion::TotalEmissions, environmental.total_emissions);
    }
    if let Some(water_blackouts) = technical.clean_water_blackouts {
        criteria.insert(Criterion::CleanWaterBlackouts, water_blackouts);
        if let (Some(demand), Some(unmet)) = (
            technical.total_clean_water_demand,
            technical.unmet_clean_water,
        ) {
            criteria.insert(
                Criterion::UnmetCleanWaterFraction,
                if demand > 0. { unmet / demand } else { 0. },
            );
        }
    }

    SystemAppraisal {
        system_details: details.clone(),
        technical,
        financial,
        environmental,
        criteria,
    }
}

/// The sizes newly installed this period: the increment over what was
/// already in place, floored at zero since equipment is never resold.
fn new_equipment(installed: &SystemSizes, previously_installed: &SystemSizes) -> SystemSizes {
    let mut converters = IndexMap::new();
    for (name, size) in &installed.converters {
        let previous = previously_installed
            .converters
            .get(name)
            .copied()
            .unwrap_or_default();
        converters.insert(name.clone(), (size - previous).max(0.));
    }
    SystemSizes {
        pv: (installed.pv - previously_installed.pv).max(0.),
        storage: (installed.storage - previously_installed.storage).max(0.),
        pvt: (installed.pvt - previously_installed.pvt).max(0.),
        solar_thermal: (installed.solar_thermal - previously_installed.solar_thermal).max(0.),
        clean_water_tanks: (installed.clean_water_tanks
            - previously_installed.clean_water_tanks)
            .max(0.),
        hot_water_tanks: (installed.hot_water_tanks - previously_installed.hot_water_tanks)
            .max(0.),
        buffer_tanks: (installed.buffer_tanks - previously_installed.buffer_tanks).max(0.),
        converters,
    }
}
