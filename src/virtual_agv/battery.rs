//! Linear battery discharge/charge model (§4.7.3 of the virtual AGV
//! simulator). Pure functions so the tick loop can stay a thin driver.

/// `charge -= dist * 100 / batteryMaxReach`, floored at 0.
pub fn discharge(charge: f32, distance: f32, battery_max_reach: f32) -> f32 {
    if battery_max_reach <= 0.0 {
        return charge;
    }
    (charge - distance * 100.0 / battery_max_reach).max(0.0)
}

/// Percent per second while charging: `100 / (3600 * fullBatteryChargeTime)`.
pub fn charge_rate_per_second(full_battery_charge_time_hours: f32) -> f32 {
    if full_battery_charge_time_hours <= 0.0 {
        return 100.0;
    }
    100.0 / (3600.0 * full_battery_charge_time_hours)
}

/// Linear-in-time charge accumulation, capped at 100%.
pub fn charge(current: f32, rate_per_second: f32, dt: f32) -> f32 {
    (current + rate_per_second * dt).min(100.0)
}

/// `floor(batteryMaxReach * charge / 100)`.
pub fn reach(charge: f32, battery_max_reach: f32) -> u32 {
    (battery_max_reach * charge / 100.0).floor().max(0.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discharge_is_linear_in_distance() {
        let c = discharge(100.0, 288.0, 28800.0);
        assert!((c - 99.0).abs() < 1e-4);
    }

    #[test]
    fn discharge_floors_at_zero() {
        assert_eq!(discharge(0.5, 1000.0, 100.0), 0.0);
    }

    #[test]
    fn full_charge_in_one_hour_reaches_100_percent_per_hour() {
        let rate = charge_rate_per_second(1.0);
        let after_one_hour = charge(0.0, rate, 3600.0);
        assert!((after_one_hour - 100.0).abs() < 1e-3);
    }

    #[test]
    fn charge_caps_at_100() {
        assert_eq!(charge(99.9, 50.0, 10.0), 100.0);
    }

    #[test]
    fn reach_scales_with_charge() {
        assert_eq!(reach(50.0, 28800.0), 14400);
        assert_eq!(reach(0.0, 28800.0), 0);
    }
}
