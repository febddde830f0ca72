use log::debug;

use crate::model::RouteLeg;

/// About 30 mph, in meters per second
pub const MAX_PLAUSIBLE_SPEED: f64 = 13.4;

/// Legs faster than three standard deviations above the mean leg speed, or
/// faster than `MAX_PLAUSIBLE_SPEED`, are flagged. Flagged legs are kept.
///
/// Legs without a finite speed (zero observed duration) are always flagged
/// and left out of the mean and deviation.
pub fn mark_speed_outliers(legs: &mut [RouteLeg]) {
    if legs.is_empty() {
        return;
    }

    let speeds: Vec<f64> = legs
        .iter()
        .map(|leg| leg.speed)
        .filter(|speed| speed.is_finite())
        .collect();
    let (mean, stdev) = mean_and_stdev(&speeds);
    let threshold = if speeds.is_empty() {
        f64::INFINITY
    } else {
        mean + 3.0 * stdev
    };

    for leg in legs.iter_mut() {
        leg.speed_outlier = !leg.speed.is_finite()
            || leg.speed > threshold
            || leg.speed > MAX_PLAUSIBLE_SPEED;
    }

    debug!(
        "Speed outliers: {} of {} legs (mean {:.2} m/s, stdev {:.2})",
        legs.iter().filter(|leg| leg.speed_outlier).count(),
        legs.len(),
        mean,
        stdev
    );
}

// Population standard deviation
fn mean_and_stdev(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RouteType;
    use geo::LineString;

    fn legs_with_speeds(speeds: &[f64]) -> Vec<RouteLeg> {
        speeds
            .iter()
            .enumerate()
            .map(|(i, speed)| RouteLeg {
                matching: 0,
                leg: i,
                distance: speed * 10.0,
                duration: 10.0,
                speed: *speed,
                nodes: Vec::new(),
                geometry: LineString::new(Vec::new()),
                route_type: RouteType::Match,
                trip_id: 1,
                start_point_id: None,
                end_point_id: None,
                speed_outlier: false,
            })
            .collect()
    }

    fn flags(legs: &[RouteLeg]) -> Vec<bool> {
        legs.iter().map(|leg| leg.speed_outlier).collect()
    }

    #[test]
    fn test_fast_leg_is_flagged() {
        let mut legs = legs_with_speeds(&[1.0, 2.0, 3.0, 4.0, 100.0]);
        mark_speed_outliers(&mut legs);
        assert_eq!(flags(&legs), vec![false, false, false, false, true]);
    }

    #[test]
    fn test_uniform_speeds_are_not_flagged() {
        let mut legs = legs_with_speeds(&[5.0; 5]);
        mark_speed_outliers(&mut legs);
        assert_eq!(flags(&legs), vec![false; 5]);
    }

    #[test]
    fn test_statistical_outlier_below_absolute_cap() {
        let mut speeds = vec![4.0; 20];
        speeds.push(12.0);
        let mut legs = legs_with_speeds(&speeds);
        mark_speed_outliers(&mut legs);
        assert!(legs[20].speed_outlier);
        assert_eq!(legs.iter().filter(|leg| leg.speed_outlier).count(), 1);
    }

    #[test]
    fn test_absolute_cap_applies_to_every_leg() {
        let mut legs = legs_with_speeds(&[14.0, 14.0, 14.0]);
        mark_speed_outliers(&mut legs);
        assert_eq!(flags(&legs), vec![true; 3]);
    }

    #[test]
    fn test_zero_duration_legs_do_not_mask_statistical_outliers() {
        let mut speeds = vec![4.0; 20];
        speeds.extend([12.0, f64::NAN, f64::INFINITY]);
        let mut legs = legs_with_speeds(&speeds);
        mark_speed_outliers(&mut legs);

        assert!(legs[20].speed_outlier);
        assert!(legs[21].speed_outlier);
        assert!(legs[22].speed_outlier);
        assert_eq!(legs.iter().filter(|leg| leg.speed_outlier).count(), 3);
    }

    #[test]
    fn test_only_non_finite_speeds() {
        let mut legs = legs_with_speeds(&[f64::NAN, f64::NAN]);
        mark_speed_outliers(&mut legs);
        assert_eq!(flags(&legs), vec![true, true]);
    }

    #[test]
    fn test_empty_leg_set() {
        let mut legs: Vec<RouteLeg> = Vec::new();
        mark_speed_outliers(&mut legs);
        assert!(legs.is_empty());
    }
}
