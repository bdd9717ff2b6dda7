use serde::{Deserialize, Serialize};

pub const HOURS_IN_DAY: u32 = 24;
pub const DAYS_IN_YEAR: u32 = 365;
pub const HOURS_IN_YEAR: u32 = HOURS_IN_DAY * DAYS_IN_YEAR;

/// One contiguous multi-year window to simulate, expressed in whole years
/// from the installation date of the system.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Simulation {
    pub start_year: u32,
    pub end_year: u32,
}

impl Simulation {
    pub fn new(start_year: u32, end_year: u32) -> Self {
        Self {
            start_year,
            end_year,
        }
    }

    pub fn start_hour(&self) -> usize {
        (self.start_year * HOURS_IN_YEAR) as usize
    }

    pub fn end_hour(&self) -> usize {
        (self.end_year * HOURS_IN_YEAR) as usize
    }

    pub fn total_hours(&self) -> usize {
        self.end_hour() - self.start_hour()
    }

    pub fn iter(&self) -> SimulationHourIterator {
        SimulationHourIterator::from(*self)
    }
}

/// Iterator over the hours of a simulation window.
///
/// Hour indices are absolute offsets from the installation date, so that
/// age-dependent factors (PV degradation, battery health) line up across
/// chained optimisation periods.
#[derive(Clone)]
pub struct SimulationHourIterator {
    current_hour: usize,
    end_hour: usize,
    started: bool,
    simulation: Simulation,
}

impl SimulationHourIterator {
    fn from(simulation: Simulation) -> Self {
        Self {
            current_hour: simulation.start_hour(),
            end_hour: simulation.end_hour(),
            started: false,
            simulation,
        }
    }

    pub fn start_hour(&self) -> usize {
        self.simulation.start_hour()
    }
}

/// A single hour within a simulation window.
#[derive(Clone, Copy, Debug)]
pub struct SimulationHour {
    /// Offset within the simulated window, starting at zero. Series produced
    /// by the simulation are indexed by this value.
    pub index: usize,
    /// Absolute hour offset from the installation date; age-dependent
    /// factors (PV degradation, profile tiling) key off this.
    pub hour: usize,
}

impl Iterator for SimulationHourIterator {
    type Item = SimulationHour;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.started {
            if self.current_hour >= self.end_hour {
                return None;
            }
            self.started = true;
            return Some(SimulationHour {
                index: 0,
                hour: self.current_hour,
            });
        }
        if self.current_hour + 1 < self.end_hour {
            self.current_hour += 1;
            Some(SimulationHour {
                index: self.current_hour - self.simulation.start_hour(),
                hour: self.current_hour,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[fixture]
    fn simulation() -> Simulation {
        Simulation::new(4, 8)
    }

    #[rstest]
    fn should_have_correct_hour_bounds(simulation: Simulation) {
        assert_eq!(simulation.start_hour(), 35_040);
        assert_eq!(simulation.end_hour(), 70_080);
        assert_eq!(simulation.total_hours(), 35_040);
    }

    #[rstest]
    fn should_iterate_in_monotonic_hour_order(simulation: Simulation) {
        let mut expected_index = 0;
        for hour in simulation.iter() {
            assert_eq!(hour.index, expected_index);
            assert_eq!(hour.hour, simulation.start_hour() + expected_index);
            expected_index += 1;
        }
        assert_eq!(expected_index, simulation.total_hours());
    }

    #[test]
    fn empty_window_yields_no_hours() {
        assert_eq!(Simulation::new(3, 3).iter().count(), 0);
    }
}
