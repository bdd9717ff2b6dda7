use serde::{Deserialize, Serialize};

/// Number of features consumed by the pre-trained collector models.
pub const MODEL_FEATURE_COUNT: usize = 5;

/// The fixed feature row consumed by the pre-trained collector models:
/// ambient temperature (Celsius), collector input temperature (Celsius),
/// HTF mass flow rate (litres/hour), solar irradiance (W/m2) and wind
/// speed (m/s), in that order.
pub type ModelFeatures = [f64; MODEL_FEATURE_COUNT];

/// A pre-fit linear regression model over the fixed collector feature row.
///
/// Models are fitted offline against collector test data and shipped as
/// coefficients in the input document; nothing is fitted at runtime.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegressionModel {
    pub intercept: f64,
    pub coefficients: [f64; MODEL_FEATURE_COUNT],
}

impl RegressionModel {
    pub fn predict(&self, features: &ModelFeatures) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(features.iter())
                .map(|(coefficient, feature)| coefficient * feature)
                .sum::<f64>()
    }
}

/// The operating regime of a PV-T collector, selected by two thresholds on
/// the conditions at the current hour.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PvtRegime {
    LowIrradianceLowTemperature,
    LowIrradianceHighTemperature,
    StandardLowTemperature,
    StandardHighTemperature,
}

/// Irradiance below which the dedicated low-irradiance models apply, in W/m2.
pub const LOW_IRRADIANCE_THRESHOLD: f64 = 25.;
/// Collector input temperature below which the low-temperature models apply,
/// in Celsius.
pub const LOW_TEMPERATURE_THRESHOLD: f64 = 50.;

impl PvtRegime {
    pub fn select(solar_irradiance: f64, input_temperature: f64) -> Self {
        match (
            solar_irradiance < LOW_IRRADIANCE_THRESHOLD,
            input_temperature < LOW_TEMPERATURE_THRESHOLD,
        ) {
            (true, true) => Self::LowIrradianceLowTemperature,
            (true, false) => Self::LowIrradianceHighTemperature,
            (false, true) => Self::StandardLowTemperature,
            (false, false) => Self::StandardHighTemperature,
        }
    }
}

/// One regression model per PV-T operating regime.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PvtModelSet {
    pub low_irradiance_low_temperature: RegressionModel,
    pub low_irradiance_high_temperature: RegressionModel,
    pub standard_low_temperature: RegressionModel,
    pub standard_high_temperature: RegressionModel,
}

impl PvtModelSet {
    pub fn model_for(&self, regime: PvtRegime) -> &RegressionModel {
        match regime {
            PvtRegime::LowIrradianceLowTemperature => &self.low_irradiance_low_temperature,
            PvtRegime::LowIrradianceHighTemperature => &self.low_irradiance_high_temperature,
            PvtRegime::StandardLowTemperature => &self.standard_low_temperature,
            PvtRegime::StandardHighTemperature => &self.standard_high_temperature,
        }
    }
}
