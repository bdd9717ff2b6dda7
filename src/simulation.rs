use crate::compare_floats::{clamp, max_of_2, min_of_2};
use crate::core::conversion::{
    required_feedwater_sources, thermal_desalination_plant, Converter, HtfMode, ResourceType,
};
use crate::core::diesel::{diesel_capacity, diesel_dispatch, DieselMode};
use crate::core::solar::performance::ThermalCollector;
use crate::core::solar::thermal_loop::{
    solve_thermal_loop, ThermalLoad, ThermalLoopProfiles, ThermalLoopSpec,
};
use crate::core::storage::battery::Battery;
use crate::core::storage::water_tank::{clean_water_tank_step, CleanWaterStep};
use crate::core::units::{HEAT_CAPACITY_OF_WATER, REFERENCE_IRRADIANCE};
use crate::errors::MinigridError;
use crate::input::{EnergySystem, Profiles, Scenario};
use crate::simulation_time::Simulation;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};
use tracing::info;

/// Unmet energy or water below this is treated as fully met; avoids float
/// noise registering as blackouts.
const SUPPLY_TOLERANCE: f64 = 1e-9;

/// The named columns of the aligned result table exposed to output
/// consumers.
#[derive(Clone, Copy, Debug, Display, EnumIter, Eq, Hash, PartialEq)]
pub enum ColumnHeader {
    #[strum(serialize = "Load energy (kWh)")]
    LoadEnergy,
    #[strum(serialize = "Renewables energy supplied (kWh)")]
    RenewablesEnergySupplied,
    #[strum(serialize = "Renewables energy used directly (kWh)")]
    RenewablesEnergyUsedDirectly,
    #[strum(serialize = "PV energy supplied (kWh)")]
    PvEnergySupplied,
    #[strum(serialize = "PV-T electric energy supplied (kWh)")]
    PvtElectricEnergySupplied,
    #[strum(serialize = "Grid energy (kWh)")]
    GridEnergy,
    #[strum(serialize = "Storage profile (kWh)")]
    StorageProfile,
    #[strum(serialize = "Battery storage profile (kWh)")]
    BatteryStorageProfile,
    #[strum(serialize = "Battery energy supplied (kWh)")]
    BatteryEnergySupplied,
    #[strum(serialize = "Battery health")]
    BatteryHealth,
    #[strum(serialize = "Dumped electricity (kWh)")]
    DumpedElectricity,
    #[strum(serialize = "Unmet energy (kWh)")]
    UnmetEnergy,
    #[strum(serialize = "Blackouts")]
    Blackouts,
    #[strum(serialize = "Diesel energy (kWh)")]
    DieselEnergy,
    #[strum(serialize = "Diesel times")]
    DieselTimes,
    #[strum(serialize = "Diesel fuel usage (l)")]
    DieselFuelUsage,
    #[strum(serialize = "Kerosene lamps in use")]
    KeroseneLamps,
    #[strum(serialize = "Kerosene mitigation")]
    KeroseneMitigation,
    #[strum(serialize = "Total clean water demand (l)")]
    TotalCleanWaterDemand,
    #[strum(serialize = "Clean water supplied (l)")]
    CleanWaterSupplied,
    #[strum(serialize = "Renewable clean water produced (l)")]
    RenewableCleanWaterProduced,
    #[strum(serialize = "Clean water storage profile (l)")]
    CleanWaterStorageProfile,
    #[strum(serialize = "Water supplied from storage (l)")]
    StorageWaterSupplied,
    #[strum(serialize = "Excess power consumed desalinating (kWh)")]
    ExcessPowerConsumedDesalinating,
    #[strum(serialize = "Excess energy desalinated water (l)")]
    ExcessEnergyDesalinatedWater,
    #[strum(serialize = "Backup desalinator water supplied (l)")]
    BackupDesalinatorWaterSupplied,
    #[strum(serialize = "Conventional water supplied (l)")]
    ConventionalWaterSupplied,
    #[strum(serialize = "Unmet clean water (l)")]
    UnmetCleanWater,
    #[strum(serialize = "Clean water blackouts")]
    CleanWaterBlackouts,
    #[strum(serialize = "Water surplus (l)")]
    WaterSurplus,
    #[strum(serialize = "Buffer tank temperature (C)")]
    BufferTankTemperature,
    #[strum(serialize = "Collector input temperature (C)")]
    CollectorInputTemperature,
    #[strum(serialize = "Collector output temperature (C)")]
    CollectorOutputTemperature,
    #[strum(serialize = "Collector pump times")]
    CollectorPumpTimes,
    #[strum(serialize = "Hot water tank temperature (C)")]
    HotWaterTankTemperature,
    #[strum(serialize = "Hot water supplied (l)")]
    HotWaterSupplied,
    #[strum(serialize = "Unmet hot water (l)")]
    UnmetHotWater,
}

/// The installed size of every variable system component for one run.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SystemSizes {
    /// Number of PV units installed.
    pub pv: f64,
    /// Number of battery units installed.
    pub storage: f64,
    /// Number of PV-T collectors installed.
    pub pvt: f64,
    /// Number of solar-thermal collectors installed.
    pub solar_thermal: f64,
    /// Number of clean-water storage tanks installed.
    pub clean_water_tanks: f64,
    /// Number of hot-water tanks installed.
    pub hot_water_tanks: f64,
    /// Number of HTF buffer tanks installed.
    pub buffer_tanks: f64,
    /// Capacity multiple installed per named converter.
    #[serde(default)]
    pub converters: IndexMap<String, f64>,
}

/// Summary record of one completed simulation: component sizes going in,
/// degraded sizes coming out, and the diesel capacity the run required.
/// Immutable after creation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SystemDetails {
    pub start_year: u32,
    pub end_year: u32,
    pub initial_sizes: SystemSizes,
    pub final_sizes: SystemSizes,
    pub diesel_capacity: f64,
}

/// The aligned, column-labelled result table of one simulation. Rows are
/// hour offsets within the simulated window, in monotonically increasing
/// order; every column has exactly one value per hour.
#[derive(Clone, Debug, Default)]
pub struct SimulationOutputs {
    pub columns: IndexMap<ColumnHeader, Vec<f64>>,
    pub total_hours: usize,
}

impl SimulationOutputs {
    pub fn series(&self, header: ColumnHeader) -> Option<&[f64]> {
        self.columns.get(&header).map(|column| column.as_slice())
    }

    fn insert(&mut self, header: ColumnHeader, series: Vec<f64>) {
        debug_assert_eq!(series.len(), self.total_hours);
        self.columns.insert(header, series);
    }
}

/// The mutable per-hour state of the sequential loop, gathered into one
/// place so every accumulator is named and append-only: each series gets
/// exactly one value per advancing hour and is never retroactively mutated.
#[derive(Debug, Default)]
struct SimulationState {
    battery_storage: Vec<f64>,
    battery_energy_supplied: Vec<f64>,
    battery_health: Vec<f64>,
    dumped_electricity: Vec<f64>,
    unmet_energy: Vec<f64>,
    blackouts: Vec<f64>,
    tank_storage: Vec<f64>,
    storage_water_supplied: Vec<f64>,
    excess_power_consumed: Vec<f64>,
    excess_water_desalinated: Vec<f64>,
    backup_water_supplied: Vec<f64>,
    conventional_water_supplied: Vec<f64>,
    unmet_water: Vec<f64>,
    water_blackouts: Vec<f64>,
    water_surplus: Vec<f64>,
    clean_water_supplied: Vec<f64>,
}

/// Run the hour-by-hour energy/water balance over one simulation window.
///
/// All dependencies arrive as already-resolved arguments; no global state
/// and no file I/O. Missing structurally required components are fatal
/// before the loop starts, as are explicitly unsupported modes.
pub fn run_simulation(
    minigrid: &EnergySystem,
    scenario: &Scenario,
    converters: &[Converter],
    profiles: &Profiles,
    simulation: Simulation,
    sizes: &SystemSizes,
) -> anyhow::Result<(SimulationOutputs, SystemDetails)> {
    check_scenario(minigrid, scenario, converters)?;
    profiles.validate()?;

    let start_hour = simulation.start_hour();
    let end_hour = simulation.end_hour();
    let total_hours = simulation.total_hours();
    info!(
        start_year = simulation.start_year,
        end_year = simulation.end_year,
        "running simulation over {total_hours} hours"
    );

    let irradiances = profiles.solar_irradiance.window(start_hour, end_hour);
    let ambient_temperatures = profiles.ambient_temperature.window(start_hour, end_hour);
    let wind_speeds = profiles.wind_speed.window(start_hour, end_hour);
    let transmission_efficiency =
        minigrid.transmission_efficiency(scenario.distribution_network)?;

    // Phase 1: state-independent renewable generation for the whole horizon.
    let load_energy: Vec<f64> = simulation
        .iter()
        .map(|hour| profiles.electric_load.total(hour.hour))
        .collect();

    let pv_energy: Vec<f64> = if scenario.pv {
        let panel = minigrid
            .pv_panel
            .as_ref()
            .ok_or_else(|| MinigridError::input_structure("PV enabled but no PV panel defined"))?;
        (0..total_hours)
            .map(|index| {
                sizes.pv
                    * panel.pv_unit
                    * (irradiances[index] / REFERENCE_IRRADIANCE)
                    * panel.fractional_performance(start_hour + index)
                    * transmission_efficiency
            })
            .collect()
    } else {
        vec![0.; total_hours]
    };

    let thermal = solve_thermal_subsystem(
        minigrid,
        scenario,
        converters,
        profiles,
        simulation,
        sizes,
        &irradiances,
        &ambient_temperatures,
        &wind_speeds,
    )?;

    // One collector array drives at most one loop's electric accounting;
    // with both loops active the desalination loop carries it.
    let pvt_electric: Vec<f64> = match thermal
        .desalination_loop
        .as_ref()
        .or(thermal.hot_water_loop.as_ref())
    {
        Some(loop_profiles) if scenario.pv_t => {
            let panel = minigrid.pvt_panel.as_ref().ok_or_else(|| {
                MinigridError::internal("PV-T loop solved without a PV-T panel defined")
            })?;
            loop_profiles
                .electric_power_per_unit
                .iter()
                .map(|fraction| {
                    fraction * panel.pv_unit * sizes.pvt * transmission_efficiency
                })
                .collect()
        }
        _ => vec![0.; total_hours],
    };

    // Auxiliary electric demand of the thermal desalination plant and the
    // circulation pump is part of the load it causes.
    let auxiliary_load: Vec<f64> = (0..total_hours)
        .map(|index| thermal.auxiliary_electric_load(index))
        .collect();

    // Phase 2: stateless allocation of renewables, grid and the pre-battery
    // storage profile. No path dependence here, so no sequential iteration.
    let mut renewables_supplied = vec![0.; total_hours];
    let mut renewables_direct = vec![0.; total_hours];
    let mut grid_energy = vec![0.; total_hours];
    let mut storage_profile = vec![0.; total_hours];
    for index in 0..total_hours {
        let renewables = pv_energy[index] + pvt_electric[index];
        let load = load_energy[index] + auxiliary_load[index];
        renewables_supplied[index] = renewables;
        renewables_direct[index] = min_of_2(renewables, load);
        let deficit = max_of_2(load - renewables, 0.);
        let grid = if scenario.grid {
            let availability = profiles
                .grid_availability
                .as_ref()
                .map(|profile| profile.get(start_hour + index))
                .unwrap_or(1.);
            deficit * availability
        } else {
            0.
        };
        grid_energy[index] = grid;
        storage_profile[index] = renewables - load + grid;
    }

    // Phase 3: the sequential hourly loop over battery and clean-water
    // state. Hour t reads hour t-1's clamped, degraded state, so this
    // cannot be parallelised across hours.
    let state = run_hourly_loop(
        minigrid,
        scenario,
        converters,
        sizes,
        &storage_profile,
        &thermal,
        simulation,
        profiles,
    )?;

    // Phase 4: diesel dispatch against the unmet-energy history, then
    // blackout figures net of the diesel contribution.
    let mut unmet_energy = state.unmet_energy.clone();
    let mut blackouts = state.blackouts.clone();
    let mut diesel_energy = vec![0.; total_hours];
    let mut diesel_times = vec![0.; total_hours];
    let mut diesel_fuel = vec![0.; total_hours];
    let mut diesel_size = 0.;
    if scenario.diesel_mode == DieselMode::Backup {
        let generator = minigrid.diesel_generator.as_ref().ok_or_else(|| {
            MinigridError::input_structure("Diesel backup enabled but no generator defined")
        })?;
        let backup_threshold = scenario.diesel_backup_threshold.ok_or_else(|| {
            MinigridError::input_structure("Diesel backup enabled but no threshold given")
        })?;
        let dispatch = diesel_dispatch(&unmet_energy, &blackouts, backup_threshold);
        diesel_size = diesel_capacity(&dispatch.diesel_energy);
        diesel_fuel = generator.fuel_usage(diesel_size, &dispatch.diesel_energy, &dispatch.diesel_times);
        for index in 0..total_hours {
            unmet_energy[index] -= dispatch.diesel_energy[index];
            if dispatch.diesel_times[index] == 1. {
                blackouts[index] = 0.;
            }
        }
        diesel_energy = dispatch.diesel_energy;
        diesel_times = dispatch.diesel_times;
    }

    // Phase 5: assemble the aligned result table and the summary record.
    let mut outputs = SimulationOutputs {
        columns: IndexMap::new(),
        total_hours,
    };
    outputs.insert(ColumnHeader::LoadEnergy, load_energy);
    outputs.insert(ColumnHeader::RenewablesEnergySupplied, renewables_supplied);
    outputs.insert(ColumnHeader::RenewablesEnergyUsedDirectly, renewables_direct);
    outputs.insert(ColumnHeader::PvEnergySupplied, pv_energy);
    outputs.insert(ColumnHeader::PvtElectricEnergySupplied, pvt_electric);
    outputs.insert(ColumnHeader::GridEnergy, grid_energy);
    outputs.insert(ColumnHeader::StorageProfile, storage_profile);
    if scenario.battery {
        outputs.insert(ColumnHeader::BatteryStorageProfile, state.battery_storage);
        outputs.insert(
            ColumnHeader::BatteryEnergySupplied,
            state.battery_energy_supplied,
        );
        outputs.insert(ColumnHeader::BatteryHealth, state.battery_health);
    }
    outputs.insert(ColumnHeader::DumpedElectricity, state.dumped_electricity);
    outputs.insert(ColumnHeader::UnmetEnergy, unmet_energy);
    outputs.insert(ColumnHeader::Blackouts, blackouts.clone());
    if scenario.diesel_mode == DieselMode::Backup {
        outputs.insert(ColumnHeader::DieselEnergy, diesel_energy);
        outputs.insert(ColumnHeader::DieselTimes, diesel_times);
        outputs.insert(ColumnHeader::DieselFuelUsage, diesel_fuel);
    }
    if let Some(kerosene) = &profiles.kerosene_usage {
        let lamps: Vec<f64> = (0..total_hours)
            .map(|index| kerosene.get(start_hour + index) * blackouts[index])
            .collect();
        let mitigation: Vec<f64> = (0..total_hours)
            .map(|index| kerosene.get(start_hour + index) * (1. - blackouts[index]))
            .collect();
        outputs.insert(ColumnHeader::KeroseneLamps, lamps);
        outputs.insert(ColumnHeader::KeroseneMitigation, mitigation);
    }
    if scenario.desalination.is_some()
        && scenario.models_resource(ResourceType::CleanWater)
    {
        let demand: Vec<f64> = (0..total_hours)
            .map(|index| {
                profiles
                    .clean_water_demand
                    .as_ref()
                    .map(|table| table.total(start_hour + index))
                    .unwrap_or_default()
            })
            .collect();
        outputs.insert(ColumnHeader::TotalCleanWaterDemand, demand);
        outputs.insert(ColumnHeader::CleanWaterSupplied, state.clean_water_supplied);
        outputs.insert(
            ColumnHeader::RenewableCleanWaterProduced,
            thermal.renewable_water_produced.clone(),
        );
        outputs.insert(ColumnHeader::CleanWaterStorageProfile, state.tank_storage);
        outputs.insert(
            ColumnHeader::StorageWaterSupplied,
            state.storage_water_supplied,
        );
        outputs.insert(
            ColumnHeader::ExcessPowerConsumedDesalinating,
            state.excess_power_consumed,
        );
        outputs.insert(
            ColumnHeader::ExcessEnergyDesalinatedWater,
            state.excess_water_desalinated,
        );
        outputs.insert(
            ColumnHeader::BackupDesalinatorWaterSupplied,
            state.backup_water_supplied,
        );
        outputs.insert(
            ColumnHeader::ConventionalWaterSupplied,
            state.conventional_water_supplied,
        );
        outputs.insert(ColumnHeader::UnmetCleanWater, state.unmet_water);
        outputs.insert(ColumnHeader::CleanWaterBlackouts, state.water_blackouts);
        outputs.insert(ColumnHeader::WaterSurplus, state.water_surplus);
    }
    if let Some(loop_profiles) = &thermal.desalination_loop {
        outputs.insert(
            ColumnHeader::BufferTankTemperature,
            loop_profiles.tank_temperature.clone(),
        );
        outputs.insert(
            ColumnHeader::CollectorInputTemperature,
            loop_profiles.collector_input_temperature.clone(),
        );
        outputs.insert(
            ColumnHeader::CollectorOutputTemperature,
            loop_profiles.collector_output_temperature.clone(),
        );
        outputs.insert(
            ColumnHeader::CollectorPumpTimes,
            loop_profiles.pump_times.clone(),
        );
    }
    if let Some(loop_profiles) = &thermal.hot_water_loop {
        outputs.insert(
            ColumnHeader::HotWaterTankTemperature,
            loop_profiles.tank_temperature.clone(),
        );
        outputs.insert(
            ColumnHeader::HotWaterSupplied,
            loop_profiles.tank_volume_supplied.clone(),
        );
        let unmet_hot_water: Vec<f64> = (0..total_hours)
            .map(|index| {
                let demand = profiles
                    .hot_water_demand
                    .as_ref()
                    .map(|table| table.total(start_hour + index))
                    .unwrap_or_default();
                max_of_2(demand - loop_profiles.tank_volume_supplied[index], 0.)
            })
            .collect();
        outputs.insert(ColumnHeader::UnmetHotWater, unmet_hot_water);
    }

    let final_sizes = final_sizes(minigrid, scenario, sizes, end_hour, &outputs);
    let details = SystemDetails {
        start_year: simulation.start_year,
        end_year: simulation.end_year,
        initial_sizes: sizes.clone(),
        final_sizes,
        diesel_capacity: diesel_size,
    };

    Ok((outputs, details))
}

/// Eagerly reject misconfigured or unsupported scenario/component
/// combinations before any expensive computation begins.
fn check_scenario(
    minigrid: &EnergySystem,
    scenario: &Scenario,
    converters: &[Converter],
) -> anyhow::Result<()> {
    if scenario.diesel_mode == DieselMode::CycleCharging {
        return Err(MinigridError::unsupported_mode(
            "Cycle-charging diesel operation is not supported",
        )
        .into());
    }
    if scenario.battery && minigrid.battery.is_none() {
        return Err(MinigridError::input_structure(
            "Battery scenario enabled but no battery defined on the energy system",
        )
        .into());
    }
    if scenario.pv && minigrid.pv_panel.is_none() {
        return Err(
            MinigridError::input_structure("PV enabled but no PV panel defined").into(),
        );
    }
    if scenario.pv_t && minigrid.pvt_panel.is_none() {
        return Err(
            MinigridError::input_structure("PV-T enabled but no PV-T panel defined").into(),
        );
    }
    if scenario.solar_thermal && minigrid.solar_thermal_panel.is_none() {
        return Err(MinigridError::input_structure(
            "Solar-thermal enabled but no collector defined",
        )
        .into());
    }
    if let Some(desalination) = &scenario.desalination {
        if desalination.htf_mode == HtfMode::ColdWaterHeating {
            return Err(MinigridError::unsupported_mode(
                "Cold-water HTF heating is not supported for desalination",
            )
            .into());
        }
        if minigrid.clean_water_tank.is_none() {
            return Err(MinigridError::input_structure(
                "Desalination enabled but no clean-water tank defined",
            )
            .into());
        }
        if let Some(plant) = thermal_desalination_plant(converters)? {
            if minigrid.buffer_tank.is_none() {
                return Err(MinigridError::input_structure(
                    "Thermal desalination requires a buffer tank",
                )
                .into());
            }
            if minigrid.heat_exchanger.is_none() || minigrid.water_pump.is_none() {
                return Err(MinigridError::input_structure(
                    "Thermal desalination requires a heat exchanger and a water pump",
                )
                .into());
            }
            // The feedwater selection is validated even though its result is
            // only consumed via availability accounting.
            required_feedwater_sources(converters, plant)?;
        }
    }
    if let Some(hot_water) = &scenario.hot_water {
        if hot_water.htf_mode == HtfMode::ColdWaterHeating {
            return Err(MinigridError::unsupported_mode(
                "Cold-water HTF heating is not supported for hot water",
            )
            .into());
        }
        if minigrid.hot_water_tank.is_none() {
            return Err(MinigridError::input_structure(
                "Hot-water scenario enabled but no hot-water tank defined",
            )
            .into());
        }
    }
    Ok(())
}

/// The precomputed thermal-side series: collector/tank loop solutions and
/// the renewable clean water they produce.
struct ThermalSubsystem {
    desalination_loop: Option<ThermalLoopProfiles>,
    hot_water_loop: Option<ThermalLoopProfiles>,
    renewable_water_produced: Vec<f64>,
    /// Electric drawn per litre of thermal-plant output, in kWh/l.
    plant_electric_consumption: f64,
    pump_power: f64,
}

impl ThermalSubsystem {
    fn auxiliary_electric_load(&self, index: usize) -> f64 {
        let mut load = self.renewable_water_produced[index] * self.plant_electric_consumption;
        if let Some(loop_profiles) = &self.desalination_loop {
            load += loop_profiles.pump_times[index] * self.pump_power;
        }
        if let Some(loop_profiles) = &self.hot_water_loop {
            load += loop_profiles.pump_times[index] * self.pump_power;
        }
        load
    }
}

fn solve_thermal_subsystem(
    minigrid: &EnergySystem,
    scenario: &Scenario,
    converters: &[Converter],
    profiles: &Profiles,
    simulation: Simulation,
    sizes: &SystemSizes,
    irradiances: &[f64],
    ambient_temperatures: &[f64],
    wind_speeds: &[f64],
) -> anyhow::Result<ThermalSubsystem> {
    let total_hours = simulation.total_hours();
    let mut subsystem = ThermalSubsystem {
        desalination_loop: None,
        hot_water_loop: None,
        renewable_water_produced: vec![0.; total_hours],
        plant_electric_consumption: 0.,
        pump_power: minigrid
            .water_pump
            .as_ref()
            .map(|pump| pump.power)
            .unwrap_or_default(),
    };

    let collector = if scenario.pv_t {
        minigrid.pvt_panel.as_ref().map(ThermalCollector::Pvt)
    } else if scenario.solar_thermal {
        minigrid
            .solar_thermal_panel
            .as_ref()
            .map(ThermalCollector::SolarThermal)
    } else {
        None
    };
    let collector_size = if scenario.pv_t {
        sizes.pvt
    } else {
        sizes.solar_thermal
    };

    // Closed-HTF loop feeding the thermal desalination plant.
    if scenario.desalination.is_some() {
        if let (Some(plant), Some(collector)) =
            (thermal_desalination_plant(converters)?, collector)
        {
            let Converter::ThermalDesalinationPlant {
                name,
                input_resource_consumption,
                maximum_output,
                minimum_htf_temperature,
                ..
            } = plant
            else {
                return Err(MinigridError::internal(
                    "Thermal desalination plant selection returned a different variant",
                )
                .into());
            };
            let buffer_tank = minigrid.buffer_tank.as_ref().ok_or_else(|| {
                MinigridError::input_structure("Thermal desalination requires a buffer tank")
            })?;
            let heat_exchanger = minigrid.heat_exchanger.as_ref().ok_or_else(|| {
                MinigridError::input_structure("Thermal desalination requires a heat exchanger")
            })?;
            let pump = minigrid.water_pump.as_ref().ok_or_else(|| {
                MinigridError::input_structure("Thermal desalination requires a water pump")
            })?;

            let plant_capacity =
                maximum_output * sizes.converters.get(name).copied().unwrap_or(1.);
            let htf_consumption = input_resource_consumption
                .get(&ResourceType::HotWater)
                .copied()
                .unwrap_or_default()
                * plant_capacity;
            let spec = ThermalLoopSpec {
                collector,
                system_size: collector_size,
                heat_exchanger,
                htf_heat_capacity: HEAT_CAPACITY_OF_WATER,
                tank: buffer_tank,
                number_of_tanks: max_of_2(sizes.buffer_tanks, 1.),
                pump,
                load: ThermalLoad::Desalination {
                    minimum_operating_temperature: *minimum_htf_temperature,
                    htf_volume_per_hour: htf_consumption,
                },
            };
            let loop_profiles =
                solve_thermal_loop(&spec, irradiances, ambient_temperatures, wind_speeds)?;
            for index in 0..total_hours {
                if loop_profiles.tank_volume_supplied[index] > 0. {
                    subsystem.renewable_water_produced[index] = plant_capacity;
                }
            }
            subsystem.plant_electric_consumption = input_resource_consumption
                .get(&ResourceType::Electric)
                .copied()
                .unwrap_or_default();
            subsystem.desalination_loop = Some(loop_profiles);
        }
    }

    // Hot-water loop served directly from its own tank.
    if let Some(hot_water) = &scenario.hot_water {
        if let (Some(collector), Some(tank), Some(heat_exchanger), Some(pump)) = (
            collector,
            minigrid.hot_water_tank.as_ref(),
            minigrid.heat_exchanger.as_ref(),
            minigrid.water_pump.as_ref(),
        ) {
            let demand_volume: Vec<f64> = (0..total_hours)
                .map(|index| {
                    profiles
                        .hot_water_demand
                        .as_ref()
                        .map(|table| table.total(simulation.start_hour() + index))
                        .unwrap_or_default()
                })
                .collect();
            let spec = ThermalLoopSpec {
                collector,
                system_size: collector_size,
                heat_exchanger,
                htf_heat_capacity: HEAT_CAPACITY_OF_WATER,
                tank,
                number_of_tanks: max_of_2(sizes.hot_water_tanks, 1.),
                pump,
                load: ThermalLoad::HotWater {
                    demand_temperature: hot_water.demand_temperature,
                    demand_volume: &demand_volume,
                },
            };
            subsystem.hot_water_loop = Some(solve_thermal_loop(
                &spec,
                irradiances,
                ambient_temperatures,
                wind_speeds,
            )?);
        }
    }

    Ok(subsystem)
}

#[allow(clippy::too_many_arguments)]
fn run_hourly_loop(
    minigrid: &EnergySystem,
    scenario: &Scenario,
    converters: &[Converter],
    sizes: &SystemSizes,
    storage_profile: &[f64],
    thermal: &ThermalSubsystem,
    simulation: Simulation,
    profiles: &Profiles,
) -> anyhow::Result<SimulationState> {
    let mut state = SimulationState::default();

    let battery = if scenario.battery {
        let params = minigrid.battery.as_ref().ok_or_else(|| {
            MinigridError::input_structure("Battery stepper invoked with no battery configured")
        })?;
        Some(Battery::new(params.clone(), sizes.storage))
    } else {
        None
    };

    let water = scenario
        .desalination
        .as_ref()
        .filter(|_| scenario.models_resource(ResourceType::CleanWater));
    let tank = water
        .map(|_| {
            minigrid.clean_water_tank.as_ref().ok_or_else(|| {
                MinigridError::input_structure(
                    "Clean-water stepper invoked with no tank configured",
                )
            })
        })
        .transpose()?;
    let conventional_sources: Vec<&Converter> = water
        .map(|desalination| {
            converters
                .iter()
                .filter(|converter| {
                    desalination
                        .conventional_sources
                        .iter()
                        .any(|name| name == converter.name())
                })
                .collect()
        })
        .unwrap_or_default();

    let mut previous_battery_level = battery
        .as_ref()
        .map(|battery| battery.initial_storage())
        .unwrap_or_default();
    let mut previous_tank_level = tank
        .map(|tank| tank.storage_bounds(sizes.clean_water_tanks).1)
        .unwrap_or_default();

    for hour in simulation.iter() {
        let net_flow_request = storage_profile[hour.index];

        // Battery state advance.
        let (mut battery_level, battery_supplied, mut dumped, unmet) = match &battery {
            Some(battery) => {
                let (min_storage, max_storage) = battery.storage_bounds();
                let result = battery.step(
                    net_flow_request,
                    previous_battery_level,
                    max_storage,
                    min_storage,
                );
                let clamped = clamp(result.new_stored_energy, min_storage, max_storage);
                if net_flow_request >= 0. {
                    // Surplus beyond the charge-rate limit joins the
                    // above-maximum overflow as dumped energy.
                    let rate_limited = net_flow_request - result.net_flow;
                    (clamped, 0., result.excess_energy + rate_limited, 0.)
                } else {
                    // gross drawdown after clamping, converted back to the
                    // energy actually delivered to the load
                    let retained = previous_battery_level
                        * (1. - battery.parameters().leakage);
                    let drawdown = max_of_2(retained - clamped, 0.);
                    let delivered = min_of_2(
                        -result.net_flow,
                        drawdown * battery.parameters().conversion_out,
                    );
                    let shortfall = -net_flow_request - delivered;
                    (clamped, delivered, 0., max_of_2(shortfall, 0.))
                }
            }
            None => {
                if net_flow_request >= 0. {
                    (0., 0., net_flow_request, 0.)
                } else {
                    (0., 0., 0., -net_flow_request)
                }
            }
        };

        // Clean-water state advance, coupled to the battery surplus.
        if let (Some(tank), Some(desalination)) = (tank, water) {
            let (min_storage, max_storage) = tank.storage_bounds(sizes.clean_water_tanks);
            let demand = profiles
                .clean_water_demand
                .as_ref()
                .map(|table| table.total(hour.hour))
                .unwrap_or_default();
            let battery_energy_available = battery
                .as_ref()
                .map(|battery| {
                    let (battery_min, _) = battery.storage_bounds();
                    max_of_2(battery_level - battery_min, 0.)
                })
                .unwrap_or_default();

            let result = clean_water_tank_step(
                CleanWaterStep {
                    previous_level: previous_tank_level,
                    water_produced: thermal.renewable_water_produced[hour.index],
                    water_demand: demand,
                    excess_energy: dumped,
                    battery_energy_available,
                    mode: desalination.mode,
                    energy_per_desalinated_litre: desalination.energy_per_desalinated_litre,
                    maximum_water_throughput: desalination.maximum_water_throughput,
                    minimum_storage: min_storage,
                    maximum_storage: max_storage,
                    leakage: tank.leakage,
                },
                &conventional_sources,
            );

            dumped = result.excess_energy_remaining;
            if result.backup_desalination_energy > 0. {
                if let Some(battery) = &battery {
                    let (battery_min, _) = battery.storage_bounds();
                    battery_level = max_of_2(
                        battery_level - result.backup_desalination_energy,
                        battery_min,
                    );
                }
            }

            let supplied = demand - result.unmet_water;
            state.tank_storage.push(result.new_level);
            state.storage_water_supplied.push(result.storage_water_supplied);
            state
                .excess_power_consumed
                .push(result.excess_energy_used_desalinating);
            state
                .excess_water_desalinated
                .push(result.excess_energy_water_desalinated);
            state
                .backup_water_supplied
                .push(result.backup_desalinator_water_supplied);
            state
                .conventional_water_supplied
                .push(result.conventional_water_supplied);
            state.unmet_water.push(result.unmet_water);
            state
                .water_blackouts
                .push(if result.unmet_water > SUPPLY_TOLERANCE {
                    1.
                } else {
                    0.
                });
            state.water_surplus.push(result.water_surplus);
            state.clean_water_supplied.push(max_of_2(supplied, 0.));
            previous_tank_level = result.new_level;
        }

        if let Some(battery) = &battery {
            battery.degrade(previous_battery_level, battery_level);
            state.battery_health.push(battery.health());
        }
        state.battery_storage.push(battery_level);
        state.battery_energy_supplied.push(battery_supplied);
        state.dumped_electricity.push(dumped);
        state.unmet_energy.push(unmet);
        state
            .blackouts
            .push(if unmet > SUPPLY_TOLERANCE { 1. } else { 0. });
        previous_battery_level = battery_level;
    }

    Ok(state)
}

/// Post-degradation component sizes: the "final" sizes of this run become
/// the "initial" sizes of the next optimisation period.
fn final_sizes(
    minigrid: &EnergySystem,
    scenario: &Scenario,
    sizes: &SystemSizes,
    end_hour: usize,
    outputs: &SimulationOutputs,
) -> SystemSizes {
    let mut final_sizes = sizes.clone();
    if scenario.pv {
        if let Some(panel) = &minigrid.pv_panel {
            final_sizes.pv = sizes.pv * panel.fractional_performance(end_hour);
        }
    }
    if scenario.battery {
        if let Some(health) = outputs
            .series(ColumnHeader::BatteryHealth)
            .and_then(|series| series.last())
        {
            final_sizes.storage = sizes.storage * health;
        }
    }
    final_sizes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diesel::DieselGenerator;
    use crate::core::solar::performance::HybridPvtPanel;
    use crate::core::solar::regression::{PvtModelSet, RegressionModel};
    use crate::core::solar::thermal_loop::{HeatExchanger, WaterPump};
    use crate::core::storage::battery::BatteryInput;
    use crate::core::storage::water_tank::{CleanWaterMode, CleanWaterTank, HotWaterTank};
    use crate::input::{DemandTable, DistributionNetwork, HotWaterScenario, ResourceProfile};
    use approx::assert_relative_eq;
    use rstest::*;

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
            resource_types: vec![ResourceType::Electric],
            desalination: None,
            hot_water: None,
        }
    }

    fn energy_system() -> EnergySystem {
        EnergySystem {
            dc_transmission_efficiency: Some(1.0),
            battery: Some(BatteryInput {
                capacity: 10.,
                charge_rate: 1.0,
                discharge_rate: 1.0,
                conversion_in: 1.0,
                conversion_out: 1.0,
                leakage: 0.,
                maximum_charge: 1.0,
                minimum_charge: 0.,
                lifetime_loss: 0.3,
                cycle_lifetime: 1_500.,
            }),
            pv_panel: Some(crate::core::solar::performance::PvPanel {
                pv_unit: 1.,
                lifetime: 20,
                lifetime_loss: 0.,
            }),
            ..Default::default()
        }
    }

    fn profiles(hours: usize) -> Profiles {
        // a repeating day: sun for the middle third
        let irradiance: Vec<f64> = (0..hours)
            .map(|hour| {
                if (8..16).contains(&(hour % 24)) {
                    1_000.
                } else {
                    0.
                }
            })
            .collect();
        Profiles {
            electric_load: DemandTable {
                columns: IndexMap::from([("domestic".to_string(), vec![1.; hours])]),
            },
            clean_water_demand: None,
            hot_water_demand: None,
            solar_irradiance: ResourceProfile::new(irradiance),
            ambient_temperature: ResourceProfile::new(vec![25.; hours]),
            wind_speed: ResourceProfile::new(vec![3.; hours]),
            grid_availability: None,
            kerosene_usage: None,
        }
    }

    fn sizes() -> SystemSizes {
        SystemSizes {
            pv: 3.,
            storage: 1.,
            ..Default::default()
        }
    }

    fn regression(intercept: f64, coefficients: [f64; 5]) -> RegressionModel {
        RegressionModel {
            intercept,
            coefficients,
        }
    }

    fn pvt_panel() -> HybridPvtPanel {
        let thermal = PvtModelSet {
            low_irradiance_low_temperature: regression(5., [0., 0.9, 0., 0., 0.]),
            low_irradiance_high_temperature: regression(5., [0., 0.9, 0., 0., 0.]),
            standard_low_temperature: regression(20., [0., 0.8, 0., 0.01, 0.]),
            standard_high_temperature: regression(20., [0., 0.8, 0., 0.01, 0.]),
        };
        HybridPvtPanel {
            pv_unit: 0.3,
            reference_efficiency: Some(0.15),
            reference_temperature: Some(25.),
            thermal_coefficient: Some(0.0044),
            max_mass_flow_rate: 120.,
            min_mass_flow_rate: 10.,
            lifetime: 20,
            lifetime_loss: 0.1,
            electric_models: Some(PvtModelSet {
                low_irradiance_low_temperature: regression(0.05, [0.; 5]),
                low_irradiance_high_temperature: regression(0.04, [0.; 5]),
                standard_low_temperature: regression(0.12, [0.; 5]),
                standard_high_temperature: regression(0.1, [0.; 5]),
            }),
            thermal_models: Some(thermal),
        }
    }

    fn hot_water_tank() -> HotWaterTank {
        HotWaterTank {
            capacity: 1_000.,
            leakage: 0.,
            area: 5.5,
            heat_loss_coefficient: 1.9,
            heat_capacity: HEAT_CAPACITY_OF_WATER,
            replacement_temperature: 25.,
            lifetime: 20,
        }
    }

    #[rstest]
    fn battery_absorbs_daytime_surplus_and_covers_evenings() {
        let (outputs, details) = run_simulation(
            &energy_system(),
            &scenario(),
            &[],
            &profiles(48),
            Simulation::new(0, 1),
            &sizes(),
        )
        .unwrap();

        let storage = outputs.series(ColumnHeader::BatteryStorageProfile).unwrap();
        let unmet = outputs.series(ColumnHeader::UnmetEnergy).unwrap();
        let blackouts = outputs.series(ColumnHeader::Blackouts).unwrap();

        // daytime: 3 kWh PV against 1 kWh load charges 2 kWh/hour
        assert!(storage[9] > storage[8]);
        // evening: battery discharges 1 kWh/hour into the load
        assert!(storage[17] < storage[15]);
        assert_eq!(unmet[9], 0.);
        // all hours are monotonic appends
        assert_eq!(storage.len(), outputs.total_hours);
        assert_eq!(blackouts.len(), outputs.total_hours);
        assert_eq!(details.initial_sizes.pv, 3.);
    }

    #[rstest]
    fn storage_stays_within_bounds() {
        let (outputs, _) = run_simulation(
            &energy_system(),
            &scenario(),
            &[],
            &profiles(8760),
            Simulation::new(0, 1),
            &sizes(),
        )
        .unwrap();
        let storage = outputs.series(ColumnHeader::BatteryStorageProfile).unwrap();
        for level in storage {
            assert!(*level >= 0. - 1e-9);
            assert!(*level <= 10. + 1e-9);
        }
    }

    #[rstest]
    fn no_battery_scenario_reports_deficits_as_unmet() {
        let mut scenario = scenario();
        scenario.battery = false;
        let (outputs, _) = run_simulation(
            &energy_system(),
            &scenario,
            &[],
            &profiles(24),
            Simulation::new(0, 1),
            &sizes(),
        )
        .unwrap();
        let unmet = outputs.series(ColumnHeader::UnmetEnergy).unwrap();
        let dumped = outputs.series(ColumnHeader::DumpedElectricity).unwrap();
        // night hours are fully unmet, sunlit hours dump the surplus
        assert_relative_eq!(unmet[0], 1.);
        assert_relative_eq!(dumped[10], 2.);
        assert!(outputs
            .series(ColumnHeader::BatteryStorageProfile)
            .is_none());
    }

    #[rstest]
    fn missing_battery_definition_is_fatal() {
        let mut system = energy_system();
        system.battery = None;
        let result = run_simulation(
            &system,
            &scenario(),
            &[],
            &profiles(24),
            Simulation::new(0, 1),
            &sizes(),
        );
        assert!(result.is_err());
    }

    #[rstest]
    fn cycle_charging_diesel_is_rejected_eagerly() {
        let mut scenario = scenario();
        scenario.diesel_mode = DieselMode::CycleCharging;
        let result = run_simulation(
            &energy_system(),
            &scenario,
            &[],
            &profiles(24),
            Simulation::new(0, 1),
            &sizes(),
        );
        assert!(result.is_err());
    }

    #[rstest]
    fn diesel_backup_reduces_blackouts_to_the_target() {
        let mut scenario = scenario();
        scenario.battery = false;
        scenario.diesel_mode = DieselMode::Backup;
        scenario.diesel_backup_threshold = Some(0.1);
        let mut system = energy_system();
        system.diesel_generator = Some(DieselGenerator {
            diesel_consumption: 0.4,
            minimum_load: 0.3,
            lifetime: 10,
        });
        let (outputs, details) = run_simulation(
            &system,
            &scenario,
            &[],
            &profiles(8760),
            Simulation::new(0, 1),
            &sizes(),
        )
        .unwrap();
        let blackouts = outputs.series(ColumnHeader::Blackouts).unwrap();
        let blackout_fraction =
            blackouts.iter().sum::<f64>() / blackouts.len() as f64;
        assert!(
            blackout_fraction <= 0.35,
            "diesel left a blackout fraction of {blackout_fraction}"
        );
        assert!(details.diesel_capacity >= 1.);
        let fuel = outputs.series(ColumnHeader::DieselFuelUsage).unwrap();
        assert!(fuel.iter().sum::<f64>() > 0.);
    }

    #[rstest]
    fn grid_covers_deficits_when_available() {
        let mut scenario = scenario();
        scenario.battery = false;
        scenario.grid = true;
        let mut system = energy_system();
        system.battery = None;
        let mut profiles = profiles(24);
        profiles.grid_availability = Some(ResourceProfile::new(
            (0..24).map(|hour| if hour < 12 { 1. } else { 0. }).collect(),
        ));
        let (outputs, _) = run_simulation(
            &system,
            &scenario,
            &[],
            &profiles,
            Simulation::new(0, 1),
            &sizes(),
        )
        .unwrap();
        let grid = outputs.series(ColumnHeader::GridEnergy).unwrap();
        let unmet = outputs.series(ColumnHeader::UnmetEnergy).unwrap();
        // pre-sunrise hours are met by the grid while it is up
        assert_relative_eq!(grid[2], 1.);
        assert_relative_eq!(unmet[2], 0.);
        // evening hours have no grid and no battery
        assert_relative_eq!(grid[20], 0.);
        assert_relative_eq!(unmet[20], 1.);
    }

    #[rstest]
    fn pvt_electricity_reaches_the_balance_in_a_hot_water_scenario() {
        let mut scenario = scenario();
        scenario.battery = false;
        scenario.pv = false;
        scenario.pv_t = true;
        scenario.hot_water = Some(HotWaterScenario {
            demand_temperature: 40.,
            htf_mode: HtfMode::ClosedHtf,
        });
        let mut system = energy_system();
        system.battery = None;
        system.pv_panel = None;
        system.pvt_panel = Some(pvt_panel());
        system.hot_water_tank = Some(hot_water_tank());
        system.heat_exchanger = Some(HeatExchanger {
            efficiency: 0.6,
            lifetime: 20,
        });
        system.water_pump = Some(WaterPump {
            power: 0.05,
            throughput: 720.,
            lifetime: 10,
        });
        let mut profiles = profiles(24);
        profiles.hot_water_demand = Some(DemandTable {
            columns: IndexMap::from([("domestic".to_string(), vec![5.; 24])]),
        });
        let sizes = SystemSizes {
            pvt: 2.,
            hot_water_tanks: 1.,
            ..Default::default()
        };

        let (outputs, _) = run_simulation(
            &system,
            &scenario,
            &[],
            &profiles,
            Simulation::new(0, 1),
            &sizes,
        )
        .unwrap();

        // the same panels that warm the tank feed the electric balance
        let tank_temperatures = outputs
            .series(ColumnHeader::HotWaterTankTemperature)
            .unwrap();
        assert!(tank_temperatures[12] > tank_temperatures[0]);
        let electric = outputs
            .series(ColumnHeader::PvtElectricEnergySupplied)
            .unwrap();
        assert!(
            electric.iter().sum::<f64>() > 0.,
            "PV-T panels heated the tank but supplied no electricity"
        );
    }

    #[rstest]
    fn empty_optional_profiles_are_rejected_before_the_loop() {
        let mut profiles = profiles(24);
        profiles.grid_availability = Some(ResourceProfile::new(vec![]));
        let result = run_simulation(
            &energy_system(),
            &scenario(),
            &[],
            &profiles,
            Simulation::new(0, 1),
            &sizes(),
        );
        assert!(result.is_err());
    }

    #[rstest]
    fn clean_water_cascade_is_driven_by_surplus() {
        let mut scenario = scenario();
        scenario.resource_types.push(ResourceType::CleanWater);
        scenario.desalination = Some(crate::input::DesalinationScenario {
            mode: CleanWaterMode::Backup,
            energy_per_desalinated_litre: 0.01,
            maximum_water_throughput: 100.,
            conventional_sources: vec![],
            htf_mode: HtfMode::ClosedHtf,
        });
        let mut system = energy_system();
        system.clean_water_tank = Some(CleanWaterTank {
            capacity: 1_000.,
            leakage: 0.,
            maximum_water: 1.,
            minimum_water: 0.,
            lifetime: 15,
        });
        let mut profiles = profiles(48);
        profiles.clean_water_demand = Some(DemandTable {
            columns: IndexMap::from([("domestic".to_string(), vec![10.; 48])]),
        });
        let mut sizes = sizes();
        sizes.clean_water_tanks = 1.;

        let (outputs, _) = run_simulation(
            &system,
            &scenario,
            &[],
            &profiles,
            Simulation::new(0, 1),
            &sizes,
        )
        .unwrap();
        let desalinated = outputs
            .series(ColumnHeader::ExcessEnergyDesalinatedWater)
            .unwrap();
        let dumped = outputs.series(ColumnHeader::DumpedElectricity).unwrap();
        // once the battery is full, surplus sunlit energy makes water
        // instead of being dumped
        assert!(desalinated.iter().sum::<f64>() > 0.);
        let tank_levels = outputs
            .series(ColumnHeader::CleanWaterStorageProfile)
            .unwrap();
        for level in tank_levels {
            assert!(*level >= 0. && *level <= 1_000.);
        }
        // conservation: desalination consumed energy that was surplus
        for (index, volume) in desalinated.iter().enumerate() {
            if *volume > 0. {
                assert!(dumped[index] >= 0.);
            }
        }
    }
}
