//! Solar altitude and observing-night boundaries.
//!
//! The scheduler only needs to know when the sun crosses the configured
//! altitude limit, so a full ephemeris stack is overkill. This module
//! implements the standard NOAA solar position approximation (good to a
//! fraction of a degree, i.e. well under a minute of crossing time) and a
//! noon-to-noon scan for the crossings.

use chrono::{DateTime, Duration, NaiveDate, Utc};

/// Observatory site coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Site {
    /// Latitude in decimal degrees, north positive.
    pub latitude: f64,
    /// Longitude in decimal degrees, east positive.
    pub longitude: f64,
    /// Elevation above sea level in metres.
    pub elevation: f64,
}

/// Start and end of an observing night: the first and last instants in the
/// noon-to-noon window where the sun sits below the altitude limit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NightWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl NightWindow {
    /// Returns true if the sun never drops below the limit on this night.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns true if the instant falls inside the window.
    pub fn contains(&self, time: DateTime<Utc>) -> bool {
        self.start <= time && time <= self.end
    }
}

/// Returns the apparent solar altitude in degrees at the given instant.
pub fn solar_altitude(time: DateTime<Utc>, site: &Site) -> f64 {
    // NOAA solar calculator formulae, all angles in degrees.
    let jd = time.timestamp() as f64 / 86400.0 + 2440587.5;
    let jc = (jd - 2451545.0) / 36525.0;

    let mean_long = (280.46646 + jc * (36000.76983 + jc * 0.0003032)).rem_euclid(360.0);
    let mean_anom = 357.52911 + jc * (35999.05029 - 0.0001537 * jc);
    let eccentricity = 0.016708634 - jc * (0.000042037 + 0.0000001267 * jc);

    let eq_of_center = sin_d(mean_anom) * (1.914602 - jc * (0.004817 + 0.000014 * jc))
        + sin_d(2.0 * mean_anom) * (0.019993 - 0.000101 * jc)
        + sin_d(3.0 * mean_anom) * 0.000289;

    let true_long = mean_long + eq_of_center;
    let apparent_long = true_long - 0.00569 - 0.00478 * sin_d(125.04 - 1934.136 * jc);

    let mean_obliquity = 23.0
        + (26.0 + (21.448 - jc * (46.815 + jc * (0.00059 - jc * 0.001813))) / 60.0) / 60.0;
    let obliquity = mean_obliquity + 0.00256 * cos_d(125.04 - 1934.136 * jc);

    let declination = asin_d(sin_d(obliquity) * sin_d(apparent_long));

    let var_y = tan_d(obliquity / 2.0).powi(2);
    let eq_of_time_minutes = 4.0
        * (var_y * sin_d(2.0 * mean_long) - 2.0 * eccentricity * sin_d(mean_anom)
            + 4.0 * eccentricity * var_y * sin_d(mean_anom) * cos_d(2.0 * mean_long)
            - 0.5 * var_y * var_y * sin_d(4.0 * mean_long)
            - 1.25 * eccentricity * eccentricity * sin_d(2.0 * mean_anom))
        .to_degrees();

    let minutes_of_day = (time.timestamp().rem_euclid(86400)) as f64 / 60.0
        + time.timestamp_subsec_micros() as f64 / 60e6;
    let true_solar_minutes =
        (minutes_of_day + eq_of_time_minutes + 4.0 * site.longitude).rem_euclid(1440.0);
    let hour_angle = if true_solar_minutes / 4.0 < 0.0 {
        true_solar_minutes / 4.0 + 180.0
    } else {
        true_solar_minutes / 4.0 - 180.0
    };

    asin_d(
        sin_d(site.latitude) * sin_d(declination)
            + cos_d(site.latitude) * cos_d(declination) * cos_d(hour_angle),
    )
}

/// Computes the observing night for the given date.
///
/// The search window runs from civil noon UTC on `night` to noon the next
/// day. If the sun never rises above the limit the whole window is returned;
/// if it never sets below the limit the window is empty (`start == end`) and
/// schedule validation will reject any dome window on that night.
pub fn night_start_end(night: NaiveDate, site: &Site, sun_altitude_limit: f64) -> NightWindow {
    let noon = night
        .and_hms_opt(12, 0, 0)
        .expect("noon is a valid time")
        .and_utc();
    let next_noon = noon + Duration::hours(24);

    const STEP_SECS: i64 = 60;
    let below = |t: DateTime<Utc>| solar_altitude(t, site) < sun_altitude_limit;

    let steps = 24 * 60;
    let mut first_below = None;
    let mut last_below = None;
    for i in 0..=steps {
        let t = noon + Duration::seconds(i * STEP_SECS);
        if below(t) {
            if first_below.is_none() {
                first_below = Some(i);
            }
            last_below = Some(i);
        }
    }

    let (Some(first), Some(last)) = (first_below, last_below) else {
        // Sun never sets below the limit: empty interval.
        return NightWindow {
            start: noon,
            end: noon,
        };
    };

    let start = if first == 0 {
        noon
    } else {
        refine_crossing(
            noon + Duration::seconds((first - 1) * STEP_SECS),
            noon + Duration::seconds(first * STEP_SECS),
            &below,
        )
    };
    let end = if last == steps {
        next_noon
    } else {
        refine_crossing(
            noon + Duration::seconds(last * STEP_SECS),
            noon + Duration::seconds((last + 1) * STEP_SECS),
            &below,
        )
    };

    NightWindow { start, end }
}

/// Bisects a one-minute bracket down to one second. One side of the bracket
/// is below the limit, the other above.
fn refine_crossing(
    mut lo: DateTime<Utc>,
    mut hi: DateTime<Utc>,
    below: &impl Fn(DateTime<Utc>) -> bool,
) -> DateTime<Utc> {
    let lo_below = below(lo);
    while (hi - lo).num_seconds() > 1 {
        let mid = lo + (hi - lo) / 2;
        if below(mid) == lo_below {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    hi
}

fn sin_d(deg: f64) -> f64 {
    deg.to_radians().sin()
}

fn cos_d(deg: f64) -> f64 {
    deg.to_radians().cos()
}

fn tan_d(deg: f64) -> f64 {
    deg.to_radians().tan()
}

fn asin_d(value: f64) -> f64 {
    value.clamp(-1.0, 1.0).asin().to_degrees()
}
