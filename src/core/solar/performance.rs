use crate::core::solar::regression::{ModelFeatures, PvtModelSet, PvtRegime};
use crate::core::units::REFERENCE_IRRADIANCE;
use crate::errors::MinigridError;
use crate::simulation_time::HOURS_IN_YEAR;
use serde::{Deserialize, Serialize};

/// A plain photovoltaic panel.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PvPanel {
    /// Peak power per installed unit, in kWp.
    pub pv_unit: f64,
    /// Panel lifetime in years.
    pub lifetime: u32,
    /// Fraction of rated output lost over the panel lifetime.
    pub lifetime_loss: f64,
}

impl PvPanel {
    /// Linear lifetime degradation factor applied to rated output, clamped
    /// at zero for panels simulated beyond their lifetime.
    pub fn fractional_performance(&self, hour: usize) -> f64 {
        let fraction_of_lifetime = hour as f64 / (HOURS_IN_YEAR as f64 * self.lifetime as f64);
        (1. - self.lifetime_loss * fraction_of_lifetime).max(0.)
    }
}

/// A hybrid PV-T panel producing electricity and heat from the same area.
///
/// Electric and thermal behaviour come from pre-trained regression models,
/// one per operating regime; the reference parameters normalise the modelled
/// electric efficiency into a fractional performance per unit installed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HybridPvtPanel {
    /// Peak electric power per installed unit, in kWp.
    pub pv_unit: f64,
    /// Electric efficiency at reference conditions.
    pub reference_efficiency: Option<f64>,
    /// Cell temperature at reference conditions, in Celsius.
    pub reference_temperature: Option<f64>,
    /// Fractional loss of electric efficiency per Kelvin above reference.
    pub thermal_coefficient: Option<f64>,
    /// Maximum HTF flow rate through one collector, in litres/hour.
    pub max_mass_flow_rate: f64,
    /// Minimum HTF flow rate through one collector, in litres/hour.
    pub min_mass_flow_rate: f64,
    pub lifetime: u32,
    pub lifetime_loss: f64,
    pub electric_models: Option<PvtModelSet>,
    pub thermal_models: Option<PvtModelSet>,
}

/// A solar-thermal collector with a closed-form performance curve,
/// `eta = eta0 + c1 * (Tc - Ta) / G + c2 * (Tc - Ta)^2 / G`,
/// where `Tc` is the mean of the collector input and output temperatures.
/// The loss coefficients `c1` and `c2` are negative by convention.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SolarThermalPanel {
    /// Aperture area of one collector, in m2.
    pub area: f64,
    /// Nominal HTF flow rate through one collector, in litres/hour.
    pub nominal_mass_flow_rate: f64,
    /// Zero-loss collector efficiency, eta0.
    pub zero_loss_efficiency: f64,
    /// First-order heat-loss coefficient, c1, in W/m2*K.
    pub first_order_loss_coefficient: f64,
    /// Second-order heat-loss coefficient, c2, in W/m2*K^2.
    pub second_order_loss_coefficient: f64,
    pub lifetime: u32,
}

const SECONDS_PER_HOUR_F: f64 = 3_600.;

/// A thermal collector for which hourly performance can be computed.
#[derive(Clone, Copy, Debug)]
pub enum ThermalCollector<'a> {
    Pvt(&'a HybridPvtPanel),
    SolarThermal(&'a SolarThermalPanel),
}

impl ThermalCollector<'_> {
    /// Compute the fractional electric performance (None for purely thermal
    /// collectors) and HTF output temperature (Celsius) of the collector at
    /// the given conditions.
    ///
    /// Arguments:
    /// * `ambient_temperature` - in Celsius
    /// * `htf_heat_capacity` - specific heat capacity of the HTF, in J/kg*K
    /// * `input_temperature` - HTF temperature entering the collector, in Celsius
    /// * `mass_flow_rate` - HTF flow through one collector, in litres/hour
    /// * `solar_irradiance` - in W/m2
    /// * `wind_speed` - in m/s
    pub fn calculate_performance(
        &self,
        ambient_temperature: f64,
        htf_heat_capacity: f64,
        input_temperature: f64,
        mass_flow_rate: f64,
        solar_irradiance: f64,
        wind_speed: f64,
    ) -> Result<(Option<f64>, f64), MinigridError> {
        match self {
            ThermalCollector::Pvt(panel) => panel.calculate_performance(
                ambient_temperature,
                input_temperature,
                mass_flow_rate,
                solar_irradiance,
                wind_speed,
            ),
            ThermalCollector::SolarThermal(panel) => panel.calculate_performance(
                ambient_temperature,
                htf_heat_capacity,
                input_temperature,
                mass_flow_rate,
                solar_irradiance,
            ),
        }
    }
}

impl HybridPvtPanel {
    fn calculate_performance(
        &self,
        ambient_temperature: f64,
        input_temperature: f64,
        mass_flow_rate: f64,
        solar_irradiance: f64,
        wind_speed: f64,
    ) -> Result<(Option<f64>, f64), MinigridError> {
        let reference_efficiency = self.reference_efficiency.ok_or_else(|| {
            MinigridError::input_structure(
                "PV-T panel performance requested without a reference efficiency",
            )
        })?;
        if self.reference_temperature.is_none() || self.thermal_coefficient.is_none() {
            return Err(MinigridError::input_structure(
                "PV-T panel performance requested without reference temperature or thermal \
                 coefficient",
            ));
        }
        let (electric_models, thermal_models) =
            match (&self.electric_models, &self.thermal_models) {
                (Some(electric), Some(thermal)) => (electric, thermal),
                _ => {
                    return Err(MinigridError::input_structure(
                        "PV-T panel performance requested without its regression models loaded",
                    ))
                }
            };

        let regime = PvtRegime::select(solar_irradiance, input_temperature);
        let features: ModelFeatures = [
            ambient_temperature,
            input_temperature,
            mass_flow_rate,
            solar_irradiance,
            wind_speed,
        ];

        let electric_efficiency = electric_models.model_for(regime).predict(&features);
        let output_temperature = thermal_models.model_for(regime).predict(&features);

        // Normalise to a fractional performance per unit installed, relative
        // to the reference efficiency at 1000 W/m2.
        let fractional_electric_performance = (electric_efficiency / reference_efficiency)
            * (solar_irradiance / REFERENCE_IRRADIANCE);

        Ok((Some(fractional_electric_performance), output_temperature))
    }
}

impl SolarThermalPanel {
    /// Solve the quadratic form of the performance-curve equation for the
    /// HTF output temperature.
    ///
    /// Substituting the mean collector temperature `(Tin + Tout) / 2` into
    /// the performance curve and equating collected heat with the HTF
    /// enthalpy rise `mdot * cp * (Tout - Tin)` gives a quadratic in `Tout`.
    fn calculate_performance(
        &self,
        ambient_temperature: f64,
        htf_heat_capacity: f64,
        input_temperature: f64,
        mass_flow_rate: f64,
        solar_irradiance: f64,
    ) -> Result<(Option<f64>, f64), MinigridError> {
        // litres/hour to kg/s, HTF density taken as that of water.
        let mass_flow_rate_kg_s = mass_flow_rate / SECONDS_PER_HOUR_F;
        let mdot_cp = mass_flow_rate_kg_s * htf_heat_capacity;

        let area = self.area;
        let eta0 = self.zero_loss_efficiency;
        let c1 = self.first_order_loss_coefficient;
        let c2 = self.second_order_loss_coefficient;
        // (Tc - Ta) = (Tin - 2*Ta + Tout) / 2
        let k = input_temperature - 2. * ambient_temperature;

        let a = -c2 * area / 4.;
        let b = mdot_cp - c1 * area / 2. - c2 * area * k / 2.;
        let c = -(mdot_cp * input_temperature
            + eta0 * solar_irradiance * area
            + c1 * area * k / 2.
            + c2 * area * k.powi(2) / 4.);

        let output_temperature = if a.abs() < f64::EPSILON {
            // Degenerate linear case when the second-order loss is zero.
            -c / b
        } else {
            let discriminant = b.powi(2) - 4. * a * c;
            if discriminant < 0. {
                return Err(MinigridError::internal(format!(
                    "Solar-thermal performance curve has no real solution \
                     (input temperature {input_temperature} C, irradiance {solar_irradiance} W/m2)"
                )));
            }
            let sqrt_discriminant = discriminant.sqrt();
            let roots = [
                (-b + sqrt_discriminant) / (2. * a),
                (-b - sqrt_discriminant) / (2. * a),
            ];
            // The physically valid root heats the fluid whenever irradiance
            // is available; when the fluid enters hotter than the collector
            // can sustain, the root nearest the input temperature applies.
            *roots
                .iter()
                .filter(|root| **root >= input_temperature)
                .min_by(|a, b| a.partial_cmp(b).unwrap())
                .unwrap_or_else(|| {
                    roots
                        .iter()
                        .min_by(|a, b| {
                            (*a - input_temperature)
                                .abs()
                                .partial_cmp(&(*b - input_temperature).abs())
                                .unwrap()
                        })
                        .unwrap()
                })
        };

        // No PV layer on a purely thermal collector.
        Ok((None, output_temperature))
    }
}
