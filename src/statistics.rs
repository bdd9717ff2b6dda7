/// A simple statistics module with some utility functions such as calculation of percentiles.
use statrs::statistics::{Data, OrderStatistics};

/// The given percentile of the series, with linear interpolation between
/// order statistics. Fractional percentiles are honoured rather than being
/// truncated to the integer below.
pub fn percentile(numbers: &[f64], percentile: f64) -> f64 {
    let numbers = numbers.to_vec();
    let mut data = Data::new(numbers);

    data.quantile(percentile / 100.)
}

pub fn mean(numbers: &[f64]) -> f64 {
    if numbers.is_empty() {
        return 0.;
    }
    numbers.iter().sum::<f64>() / numbers.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::*;

    #[fixture]
    fn numbers() -> [f64; 10] {
        [9.0, 3.0, 3.0, 4.0, 5.0, 4.9, 8.0, 3.3, 2.0, 0.1]
    }

    #[rstest]
    fn test_percentile(numbers: [f64; 10]) {
        assert_relative_eq!(percentile(&numbers, 70.), 4.95, max_relative = 1e-2);
        assert_relative_eq!(percentile(&numbers, 50.), 3.65, max_relative = 1e-2);
    }

    #[rstest]
    fn fractional_percentiles_interpolate(numbers: [f64; 10]) {
        let lower = percentile(&numbers, 70.);
        let upper = percentile(&numbers, 71.);
        let between = percentile(&numbers, 70.5);
        assert!(lower < between && between < upper);
    }

    #[rstest]
    fn test_mean(numbers: [f64; 10]) {
        assert_relative_eq!(mean(&numbers), 4.23, max_relative = 1e-9);
    }

    #[test]
    fn test_mean_of_empty_slice_is_zero() {
        assert_eq!(mean(&[]), 0.);
    }
}
