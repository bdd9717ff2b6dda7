use crate::errors::MinigridError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use strum_macros::Display;

/// The resource vocabulary understood by the engine. Profiles, demands and
/// converter inputs/outputs are all keyed by one of these.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceType {
    Electric,
    CleanWater,
    HotWater,
    Feedwater,
}

/// The heat-transfer-fluid mode coupling a PV-T/solar-thermal collector to
/// its downstream thermal consumer.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HtfMode {
    ClosedHtf,
    /// Present in the input vocabulary but rejected as unsupported before the
    /// hourly loop runs.
    ColdWaterHeating,
}

/// A polymorphic resource-transformation unit.
///
/// The variant is an explicit discriminant in the serialized input (a `type`
/// tag) rather than being inferred by trial parsing, so a misdeclared
/// converter fails loudly at ingest.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Converter {
    /// A single-input water source, e.g. a borehole pump or a river intake.
    WaterSource {
        name: String,
        input_resource: ResourceType,
        /// Input consumed per litre of output.
        consumption: f64,
        output_resource: ResourceType,
        /// Maximum output in litres/hour.
        maximum_output: f64,
    },
    /// A converter drawing on several input resources at once.
    MultiInput {
        name: String,
        /// Input consumed per unit of output, keyed by resource.
        input_resource_consumption: IndexMap<ResourceType, f64>,
        output_resource: ResourceType,
        maximum_output: f64,
    },
    /// A thermal desalination plant driven by hot HTF from the buffer tank.
    ThermalDesalinationPlant {
        name: String,
        input_resource_consumption: IndexMap<ResourceType, f64>,
        maximum_output: f64,
        /// Minimum HTF temperature at which the plant can operate, in Celsius.
        minimum_htf_temperature: f64,
        htf_mode: HtfMode,
    },
}

impl Converter {
    pub fn name(&self) -> &str {
        match self {
            Converter::WaterSource { name, .. }
            | Converter::MultiInput { name, .. }
            | Converter::ThermalDesalinationPlant { name, .. } => name,
        }
    }

    pub fn output_resource_type(&self) -> ResourceType {
        match self {
            Converter::WaterSource {
                output_resource, ..
            }
            | Converter::MultiInput {
                output_resource, ..
            } => *output_resource,
            Converter::ThermalDesalinationPlant { .. } => ResourceType::CleanWater,
        }
    }

    pub fn maximum_output_capacity(&self) -> f64 {
        match self {
            Converter::WaterSource { maximum_output, .. }
            | Converter::MultiInput { maximum_output, .. }
            | Converter::ThermalDesalinationPlant { maximum_output, .. } => *maximum_output,
        }
    }

    /// Input consumed per unit of output, keyed by resource type.
    pub fn input_resource_consumption(&self) -> IndexMap<ResourceType, f64> {
        match self {
            Converter::WaterSource {
                input_resource,
                consumption,
                ..
            } => IndexMap::from([(*input_resource, *consumption)]),
            Converter::MultiInput {
                input_resource_consumption,
                ..
            }
            | Converter::ThermalDesalinationPlant {
                input_resource_consumption,
                ..
            } => input_resource_consumption.clone(),
        }
    }
}

// Name is the equality/ordering key so converters can be kept in sorted,
// deduplicated selections.
impl PartialEq for Converter {
    fn eq(&self, other: &Self) -> bool {
        self.name() == other.name()
    }
}

impl Eq for Converter {}

impl PartialOrd for Converter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Converter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name().cmp(other.name())
    }
}

/// Select, from the available converters, the thermal desalination plant in
/// use (at most one may be required at a time) together with the feedwater
/// sources that supply it.
///
/// The combined capacity of the feedwater sources must cover the plant's
/// rated feedwater consumption at full output.
pub fn required_feedwater_sources<'a>(
    available_converters: &'a [Converter],
    plant: &Converter,
) -> Result<Vec<&'a Converter>, MinigridError> {
    let feedwater_consumption = plant
        .input_resource_consumption()
        .get(&ResourceType::Feedwater)
        .copied()
        .unwrap_or_default()
        * plant.maximum_output_capacity();

    let mut sources: Vec<&Converter> = available_converters
        .iter()
        .filter(|converter| converter.output_resource_type() == ResourceType::Feedwater)
        .collect();
    sources.sort();

    let combined_capacity: f64 = sources
        .iter()
        .map(|source| source.maximum_output_capacity())
        .sum();
    if combined_capacity < feedwater_consumption {
        return Err(MinigridError::input_structure(format!(
            "Feedwater sources supply {combined_capacity} l/hour but thermal desalination plant \
             '{}' requires {feedwater_consumption} l/hour at rated output",
            plant.name(),
        )));
    }

    Ok(sources)
}

/// Find the single thermal desalination plant among the available converters.
pub fn thermal_desalination_plant(
    available_converters: &[Converter],
) -> Result<Option<&Converter>, MinigridError> {
    let mut plants = available_converters
        .iter()
        .filter(|converter| matches!(converter, Converter::ThermalDesalinationPlant { .. }));
    let plant = plants.next();
    if plants.next().is_some() {
        return Err(MinigridError::input_structure(
            "At most one thermal desalination plant may be required at a time",
        ));
    }
    Ok(plant)
}
