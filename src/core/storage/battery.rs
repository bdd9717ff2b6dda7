use crate::compare_floats::{max_of_2, min_of_2};
use atomic_float::AtomicF64;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;

/// Static technical parameters of one battery unit.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BatteryInput {
    /// Nominal capacity of one unit, in kWh.
    pub capacity: f64,
    /// Maximum charge per hour as a fraction of usable capacity.
    pub charge_rate: f64,
    /// Maximum discharge per hour as a fraction of usable capacity.
    pub discharge_rate: f64,
    /// Conversion efficiency into storage.
    pub conversion_in: f64,
    /// Conversion efficiency out of storage.
    pub conversion_out: f64,
    /// Fraction of stored energy lost per hour.
    pub leakage: f64,
    /// Highest permitted state of charge.
    pub maximum_charge: f64,
    /// Lowest permitted state of charge.
    pub minimum_charge: f64,
    /// Fraction of capacity lost at end of cycle life.
    pub lifetime_loss: f64,
    /// Number of full charge/discharge cycles over the battery lifetime.
    pub cycle_lifetime: f64,
}

/// An electric battery bank, sized as a multiple of one unit.
#[derive(Debug)]
pub struct Battery {
    params: BatteryInput,
    /// Installed storage size, in kWh of nominal capacity.
    size: f64,
    /// Lifetime energy throughput at which the full lifetime capacity loss
    /// has accrued, in kWh.
    maximum_throughput: f64,
    /// Cumulative discharge throughput so far, in kWh.
    cumulative_throughput: AtomicF64,
}

/// The outcome of advancing a battery by one hour.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatteryStepResult {
    /// The energy flow actually applied, after rate limiting, in kWh.
    pub net_flow: f64,
    /// Energy that could not be absorbed and must be reported as surplus
    /// upstream, in kWh.
    pub excess_energy: f64,
    /// Stored energy before clamping, in kWh.
    pub new_stored_energy: f64,
}

impl Battery {
    pub fn new(params: BatteryInput, size: f64) -> Self {
        let maximum_throughput = params.cycle_lifetime * params.capacity * size;
        Self {
            params,
            size,
            maximum_throughput,
            cumulative_throughput: Default::default(),
        }
    }

    /// Usable storage bounds in kWh, degraded by the throughput so far.
    ///
    /// Degradation is monotonic: the bounds only shrink as throughput
    /// accumulates, and a recalculation affects subsequent hours only.
    pub fn storage_bounds(&self) -> (f64, f64) {
        let degradation_factor = 1. - self.params.lifetime_loss * self.throughput_fraction();
        let nominal = self.params.capacity * self.size;
        (
            nominal * self.params.minimum_charge * degradation_factor,
            nominal * self.params.maximum_charge * degradation_factor,
        )
    }

    pub fn initial_storage(&self) -> f64 {
        self.params.capacity * self.size * self.params.maximum_charge
    }

    /// Advance the stored-energy level by one hour.
    ///
    /// Positive `net_energy_flow` charges the battery, negative discharges
    /// it. Rate limits apply to the usable band `max_storage - min_storage`.
    /// Clamping into the storage bounds is done by the caller, which must
    /// then report `excess_energy` as dumped and any shortfall as unmet.
    pub fn step(
        &self,
        net_energy_flow: f64,
        previous_stored_energy: f64,
        max_storage: f64,
        min_storage: f64,
    ) -> BatteryStepResult {
        let usable_band = max_storage - min_storage;
        let retained = previous_stored_energy * (1. - self.params.leakage);

        let (net_flow, new_stored_energy) = if net_energy_flow >= 0. {
            let admitted = min_of_2(net_energy_flow, self.params.charge_rate * usable_band);
            (admitted, retained + self.params.conversion_in * admitted)
        } else {
            let released = max_of_2(net_energy_flow, -self.params.discharge_rate * usable_band);
            (released, retained + released / self.params.conversion_out)
        };

        BatteryStepResult {
            net_flow,
            excess_energy: max_of_2(new_stored_energy - max_storage, 0.),
            new_stored_energy,
        }
    }

    /// Record the discharge throughput of one hour, after clamping.
    ///
    /// The degraded storage bounds returned by [`Self::storage_bounds`]
    /// change for subsequent hours only; there is no retroactive effect.
    pub fn degrade(&self, previous_stored_energy: f64, clamped_new_stored_energy: f64) {
        let discharged = max_of_2(
            previous_stored_energy * (1. - self.params.leakage) - clamped_new_stored_energy,
            0.,
        );
        self.cumulative_throughput
            .fetch_add(discharged, Ordering::SeqCst);
    }

    pub fn cumulative_throughput(&self) -> f64 {
        self.cumulative_throughput.load(Ordering::SeqCst)
    }

    /// Remaining fraction of nominal capacity, for end-of-run reporting.
    pub fn health(&self) -> f64 {
        1. - self.params.lifetime_loss * self.throughput_fraction()
    }

    /// Fraction of the lifetime throughput consumed so far; zero for a
    /// zero-size bank, which has no throughput to consume.
    fn throughput_fraction(&self) -> f64 {
        if self.maximum_throughput <= 0. {
            return 0.;
        }
        self.cumulative_throughput.load(Ordering::SeqCst) / self.maximum_throughput
    }

    pub fn size(&self) -> f64 {
        self.size
    }

    pub fn parameters(&self) -> &BatteryInput {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::*;

    #[fixture]
    fn battery_input() -> BatteryInput {
        BatteryInput {
            capacity: 1.,
            charge_rate: 1.0,
            discharge_rate: 1.0,
            conversion_in: 0.95,
            conversion_out: 0.95,
            leakage: 0.005,
            maximum_charge: 0.9,
            minimum_charge: 0.1,
            lifetime_loss: 0.35,
            cycle_lifetime: 1_500.,
        }
    }

    #[fixture]
    fn battery(battery_input: BatteryInput) -> Battery {
        Battery::new(battery_input, 1.)
    }

    #[rstest]
    fn charging_respects_rate_limit_and_reports_excess(battery: Battery) {
        // net flow +0.5 kWh at an initial storage of 0.9 kWh: the full flow
        // fits within the rate limit of 1.0 * (0.9 - 0.1) = 0.8 kWh, so
        // 0.9 * 0.995 + 0.95 * 0.5 = 1.3705 kWh before clamping.
        let result = battery.step(0.5, 0.9, 0.9, 0.1);
        assert_relative_eq!(result.net_flow, 0.5);
        assert_relative_eq!(result.new_stored_energy, 1.3705, max_relative = 1e-9);
        assert_relative_eq!(result.excess_energy, 0.4705, max_relative = 1e-9);
    }

    #[rstest]
    fn charging_is_rate_limited(battery: Battery) {
        let result = battery.step(2., 0.1, 0.9, 0.1);
        assert_relative_eq!(result.net_flow, 0.8);
        assert_relative_eq!(
            result.new_stored_energy,
            0.1 * 0.995 + 0.95 * 0.8,
            max_relative = 1e-9
        );
    }

    #[rstest]
    fn discharging_is_rate_limited_and_amplified_by_conversion_loss(battery: Battery) {
        let result = battery.step(-2., 0.9, 0.9, 0.1);
        assert_relative_eq!(result.net_flow, -0.8);
        assert_relative_eq!(
            result.new_stored_energy,
            0.9 * 0.995 - 0.8 / 0.95,
            max_relative = 1e-9
        );
        assert_relative_eq!(result.excess_energy, 0.);
    }

    #[rstest]
    fn conservation_of_unabsorbed_energy(battery: Battery) {
        // whatever exceeds max storage before clamping is exactly the
        // reported excess
        let result = battery.step(0.3, 0.85, 0.9, 0.1);
        let clamped = result.new_stored_energy.min(0.9);
        assert_relative_eq!(
            result.new_stored_energy - clamped,
            result.excess_energy,
            max_relative = 1e-9
        );
    }

    #[rstest]
    fn degradation_shrinks_bounds_monotonically(battery: Battery) {
        let (min_before, max_before) = battery.storage_bounds();
        assert_relative_eq!(min_before, 0.1);
        assert_relative_eq!(max_before, 0.9);

        battery.degrade(0.9, 0.3);
        let (min_after, max_after) = battery.storage_bounds();
        assert!(max_after < max_before);
        assert!(min_after < min_before);
        assert_relative_eq!(
            battery.cumulative_throughput(),
            0.9 * 0.995 - 0.3,
            max_relative = 1e-9
        );

        // charging hours add no throughput
        battery.degrade(0.3, 0.8);
        assert_relative_eq!(
            battery.cumulative_throughput(),
            0.9 * 0.995 - 0.3,
            max_relative = 1e-9
        );
    }

    #[rstest]
    fn health_declines_with_throughput(battery: Battery) {
        assert_relative_eq!(battery.health(), 1.);
        battery.degrade(0.9, 0.1);
        assert!(battery.health() < 1.);
        assert!(battery.health() > 0.);
    }
}
