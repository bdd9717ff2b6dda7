use crate::appraisal::ImpactInputs;
use crate::core::conversion::{Converter, HtfMode, ResourceType};
use crate::core::diesel::{DieselGenerator, DieselMode};
use crate::core::solar::performance::{HybridPvtPanel, PvPanel, SolarThermalPanel};
use crate::core::solar::thermal_loop::{HeatExchanger, WaterPump};
use crate::core::storage::battery::BatteryInput;
use crate::core::storage::water_tank::{CleanWaterMode, CleanWaterTank, HotWaterTank};
use crate::errors::MinigridError;
use crate::optimisation::OptimisationParameters;
use crate::simulation_time::Simulation;
use anyhow::bail;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::io::Read;

pub fn ingest_for_processing(json: impl Read) -> anyhow::Result<Input> {
    let input: Input = serde_json::from_reader(json)?;
    input.validate()?;
    Ok(input)
}

/// The complete input document for one invocation. Everything the engine
/// consumes arrives through here, already expressed in the engine's units
/// (kW, kWh, litres, Celsius); the core performs no file I/O of its own.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Input {
    pub scenario: Scenario,
    pub energy_system: EnergySystem,
    #[serde(default)]
    pub converters: Vec<Converter>,
    pub simulations: Vec<Simulation>,
    pub profiles: Profiles,
    pub optimisation_parameters: Option<OptimisationParameters>,
    pub impact: Option<ImpactInputs>,
}

impl Input {
    fn validate(&self) -> anyhow::Result<()> {
        if self.simulations.is_empty() {
            bail!("At least one simulation window must be supplied");
        }
        for simulation in &self.simulations {
            if simulation.start_year >= simulation.end_year {
                bail!(
                    "Simulation window ({}, {}) is empty or reversed",
                    simulation.start_year,
                    simulation.end_year
                );
            }
        }
        self.profiles.validate()?;
        Ok(())
    }
}

/// The type of electricity distribution network between generation and
/// demand.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionNetwork {
    Ac,
    Dc,
}

/// The declarative configuration of which subsystems are active. Built once
/// at ingest and immutable for the duration of a run.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub battery: bool,
    pub diesel_mode: DieselMode,
    /// Fraction of time blackouts are tolerated once diesel backup is
    /// added; required when `diesel_mode` is `backup`.
    pub diesel_backup_threshold: Option<f64>,
    pub grid: bool,
    pub pv: bool,
    pub pv_t: bool,
    pub solar_thermal: bool,
    pub distribution_network: DistributionNetwork,
    pub resource_types: Vec<ResourceType>,
    pub desalination: Option<DesalinationScenario>,
    pub hot_water: Option<HotWaterScenario>,
}

impl Scenario {
    pub fn models_resource(&self, resource: ResourceType) -> bool {
        self.resource_types.contains(&resource)
    }
}

/// Scenario settings for the clean-water/desalination subsystem.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DesalinationScenario {
    pub mode: CleanWaterMode,
    /// Electric energy needed to desalinate one litre, in kWh/l. Unused in
    /// `thermal_only` mode.
    pub energy_per_desalinated_litre: f64,
    /// Maximum output of the electric desalinator, in litres/hour.
    pub maximum_water_throughput: f64,
    /// Names of converters usable as conventional (non-desalinated)
    /// fallback sources.
    #[serde(default)]
    pub conventional_sources: Vec<String>,
    pub htf_mode: HtfMode,
}

/// Scenario settings for the hot-water subsystem.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HotWaterScenario {
    /// Required delivery temperature, in Celsius.
    pub demand_temperature: f64,
    pub htf_mode: HtfMode,
}

/// The assembled set of physical components available to the system, each
/// with static technical parameters. Constructed once at ingest; read-only
/// during simulation.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EnergySystem {
    pub ac_transmission_efficiency: Option<f64>,
    pub dc_transmission_efficiency: Option<f64>,
    pub battery: Option<BatteryInput>,
    pub buffer_tank: Option<HotWaterTank>,
    pub clean_water_tank: Option<CleanWaterTank>,
    pub diesel_generator: Option<DieselGenerator>,
    pub heat_exchanger: Option<HeatExchanger>,
    pub hot_water_tank: Option<HotWaterTank>,
    pub pv_panel: Option<PvPanel>,
    pub pvt_panel: Option<HybridPvtPanel>,
    pub solar_thermal_panel: Option<SolarThermalPanel>,
    pub water_pump: Option<WaterPump>,
}

impl EnergySystem {
    /// Transmission efficiency of the distribution network in use.
    pub fn transmission_efficiency(
        &self,
        network: DistributionNetwork,
    ) -> Result<f64, MinigridError> {
        match network {
            DistributionNetwork::Ac => self.ac_transmission_efficiency,
            DistributionNetwork::Dc => self.dc_transmission_efficiency,
        }
        .ok_or_else(|| {
            MinigridError::input_structure(format!(
                "No transmission efficiency defined for the {network:?} distribution network"
            ))
        })
    }
}

/// A per-resource demand table: hour-indexed rows, one column per demand
/// category (e.g. domestic, commercial, public).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DemandTable {
    pub columns: IndexMap<String, Vec<f64>>,
}

impl DemandTable {
    pub fn profile_length(&self) -> usize {
        self.columns
            .values()
            .map(|column| column.len())
            .min()
            .unwrap_or(0)
    }

    /// Total demand at the given absolute hour, tiling the profile when the
    /// simulated horizon exceeds its length.
    pub fn total(&self, hour: usize) -> f64 {
        self.columns
            .values()
            .map(|column| column[hour % column.len()])
            .sum()
    }
}

/// An hour-indexed resource series (irradiance, temperature, wind speed,
/// grid availability), tiled when the simulated horizon exceeds its length.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ResourceProfile(Vec<f64>);

impl ResourceProfile {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn get(&self, hour: usize) -> f64 {
        self.0[hour % self.0.len()]
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Materialise the profile over a window of absolute hours.
    pub fn window(&self, start_hour: usize, end_hour: usize) -> Vec<f64> {
        (start_hour..end_hour).map(|hour| self.get(hour)).collect()
    }
}

/// All demand and renewable-resource series consumed by the core, validated
/// and unit-normalised at ingest.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profiles {
    /// Electric load in kW per demand category.
    pub electric_load: DemandTable,
    /// Clean-water demand in litres/hour per demand category.
    pub clean_water_demand: Option<DemandTable>,
    /// Hot-water demand in litres/hour per demand category.
    pub hot_water_demand: Option<DemandTable>,
    /// Global horizontal irradiance, in W/m2.
    pub solar_irradiance: ResourceProfile,
    /// Ambient air temperature, in Celsius.
    pub ambient_temperature: ResourceProfile,
    /// Wind speed, in m/s.
    pub wind_speed: ResourceProfile,
    /// 1.0 in hours where the grid is available, else 0.0.
    pub grid_availability: Option<ResourceProfile>,
    /// Kerosene lamps in use per hour, the baseline the system displaces.
    pub kerosene_usage: Option<ResourceProfile>,
}

impl Profiles {
    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if self.electric_load.profile_length() == 0 {
            bail!(MinigridError::ResourceProfileUnavailable(
                "electric load".to_string()
            ));
        }
        for (name, table) in [
            ("clean-water demand", &self.clean_water_demand),
            ("hot-water demand", &self.hot_water_demand),
        ] {
            if let Some(table) = table {
                if table.columns.values().any(|column| column.is_empty()) {
                    bail!(MinigridError::ResourceProfileUnavailable(name.to_string()));
                }
            }
        }
        for (name, profile) in [
            ("solar irradiance", &self.solar_irradiance),
            ("ambient temperature", &self.ambient_temperature),
            ("wind speed", &self.wind_speed),
        ] {
            if profile.is_empty() {
                bail!(MinigridError::ResourceProfileUnavailable(name.to_string()));
            }
        }
        for (name, profile) in [
            ("grid availability", &self.grid_availability),
            ("kerosene usage", &self.kerosene_usage),
        ] {
            if let Some(profile) = profile {
                if profile.is_empty() {
                    bail!(MinigridError::ResourceProfileUnavailable(name.to_string()));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[fixture]
    fn minimal_input_json() -> serde_json::Value {
        serde_json::json!({
            "scenario": {
                "battery": true,
                "diesel_mode": "disabled",
                "diesel_backup_threshold": null,
                "grid": false,
                "pv": true,
                "pv_t": false,
                "solar_thermal": false,
                "distribution_network": "dc",
                "resource_types": ["electric"],
                "desalination": null,
                "hot_water": null
            },
            "energy_system": {
                "dc_transmission_efficiency": 0.95,
                "battery": {
                    "capacity": 1.0,
                    "charge_rate": 1.0,
                    "discharge_rate": 1.0,
                    "conversion_in": 0.95,
                    "conversion_out": 0.95,
                    "leakage": 0.005,
                    "maximum_charge": 0.9,
                    "minimum_charge": 0.1,
                    "lifetime_loss": 0.35,
                    "cycle_lifetime": 1500.0
                },
                "pv_panel": {
                    "pv_unit": 0.3,
                    "lifetime": 20,
                    "lifetime_loss": 0.1
                }
            },
            "simulations": [{"start_year": 0, "end_year": 1}],
            "profiles": {
                "electric_load": {"columns": {"domestic": [1.0, 2.0, 1.5]}},
                "solar_irradiance": [0.0, 500.0, 800.0],
                "ambient_temperature": [20.0, 25.0, 30.0],
                "wind_speed": [2.0, 3.0, 4.0]
            }
        })
    }

    #[rstest]
    fn ingests_a_minimal_document(minimal_input_json: serde_json::Value) {
        let input =
            ingest_for_processing(minimal_input_json.to_string().as_bytes()).unwrap();
        assert!(input.scenario.battery);
        assert_eq!(input.simulations.len(), 1);
        assert!(input.energy_system.battery.is_some());
        assert_eq!(input.profiles.electric_load.total(1), 2.0);
    }

    #[rstest]
    fn rejects_empty_simulation_windows(mut minimal_input_json: serde_json::Value) {
        minimal_input_json["simulations"] = serde_json::json!([
            {"start_year": 2, "end_year": 2}
        ]);
        assert!(ingest_for_processing(minimal_input_json.to_string().as_bytes()).is_err());
    }

    #[rstest]
    fn rejects_missing_resource_profiles(mut minimal_input_json: serde_json::Value) {
        minimal_input_json["profiles"]["solar_irradiance"] = serde_json::json!([]);
        assert!(ingest_for_processing(minimal_input_json.to_string().as_bytes()).is_err());
    }

    #[rstest]
    fn rejects_empty_optional_profiles(mut minimal_input_json: serde_json::Value) {
        minimal_input_json["profiles"]["grid_availability"] = serde_json::json!([]);
        assert!(ingest_for_processing(minimal_input_json.to_string().as_bytes()).is_err());
    }

    #[rstest]
    fn rejects_empty_demand_columns(mut minimal_input_json: serde_json::Value) {
        minimal_input_json["profiles"]["clean_water_demand"] =
            serde_json::json!({"columns": {"domestic": []}});
        assert!(ingest_for_processing(minimal_input_json.to_string().as_bytes()).is_err());
    }

    #[rstest]
    fn rejects_unknown_fields(mut minimal_input_json: serde_json::Value) {
        minimal_input_json["scenario"]["unexpected"] = serde_json::json!(true);
        assert!(ingest_for_processing(minimal_input_json.to_string().as_bytes()).is_err());
    }

    #[test]
    fn profiles_tile_beyond_their_length() {
        let profile = ResourceProfile::new(vec![1., 2., 3.]);
        assert_eq!(profile.get(0), 1.);
        assert_eq!(profile.get(4), 2.);
        assert_eq!(profile.window(2, 5), vec![3., 1., 2.]);
    }

    #[test]
    fn demand_tables_sum_across_categories() {
        let table = DemandTable {
            columns: IndexMap::from([
                ("domestic".to_string(), vec![1., 2.]),
                ("commercial".to_string(), vec![0.5, 0.5]),
            ]),
        };
        assert_eq!(table.total(0), 1.5);
        assert_eq!(table.total(3), 2.5);
    }

    #[test]
    fn transmission_efficiency_is_required_for_the_network_in_use() {
        let system = EnergySystem {
            dc_transmission_efficiency: Some(0.95),
            ..Default::default()
        };
        assert_eq!(
            system
                .transmission_efficiency(DistributionNetwork::Dc)
                .unwrap(),
            0.95
        );
        assert!(system
            .transmission_efficiency(DistributionNetwork::Ac)
            .is_err());
    }
}
