use thiserror::Error;

pub const JOULES_PER_KILOWATT_HOUR: u32 = 3_600_000;
pub const WATTS_PER_KILOWATT: u32 = 1_000;
pub const LITRES_PER_CUBIC_METRE: u32 = 1_000;
pub const SECONDS_PER_HOUR: u32 = 3_600;
/// Reference solar irradiance at which panel peak outputs are rated, in W/m2.
pub const REFERENCE_IRRADIANCE: f64 = 1_000.;
/// Density of water, in kg/m3.
pub const DENSITY_OF_WATER: f64 = 1_000.;
/// Specific heat capacity of water, in J/kg*K.
pub const HEAT_CAPACITY_OF_WATER: f64 = 4_182.;

pub(crate) fn celsius_to_kelvin(temp_c: f64) -> Result<f64, BelowAbsoluteZeroError> {
    if temp_c < -273.15 {
        Err(BelowAbsoluteZeroError::from_c(temp_c))
    } else {
        Ok(temp_c + 273.15)
    }
}

pub(crate) fn kelvin_to_celsius(temp_k: f64) -> Result<f64, BelowAbsoluteZeroError> {
    if temp_k < 0.0 {
        Err(BelowAbsoluteZeroError::from_k(temp_k))
    } else {
        Ok(temp_k - 273.15)
    }
}

#[derive(Debug, Error)]
#[error("A temperature of {temperature} {unit} was below absolute zero")]
pub struct BelowAbsoluteZeroError {
    temperature: f64,
    unit: &'static str,
}

impl BelowAbsoluteZeroError {
    fn from_c(temperature: f64) -> Self {
        Self {
            temperature,
            unit: "Celsius",
        }
    }

    fn from_k(temperature: f64) -> Self {
        Self {
            temperature,
            unit: "Kelvin",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_celsius_to_kelvin() {
        assert_eq!(celsius_to_kelvin(20.).unwrap(), 293.15);
        assert!(celsius_to_kelvin(-300.).is_err());
    }

    #[test]
    fn test_kelvin_to_celsius() {
        assert_eq!(kelvin_to_celsius(293.15).unwrap(), 20.);
        assert!(kelvin_to_celsius(-1.).is_err());
    }
}
