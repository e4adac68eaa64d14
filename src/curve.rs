//! Scoring curves.
//!
//! A [`ScoreCurve`] maps a raw measurement (a latency in seconds or microseconds, or a
//! throughput such as TEPS) to a fraction in `[0, 1]`. The fraction is then scaled by the
//! case weight to obtain points, see [`ScoreCurve::points`].
//!
//! Every family saturates exactly at its anchors: a measurement equal to the full-score
//! threshold yields exactly `1.0`, one equal to the zero-score threshold yields exactly `0.0`.
//! The interpolation formulas are the ones the grading keys were calibrated with, so they must
//! not be "simplified" into each other.

use serde::Deserialize;

/// One curve family, with its thresholds. Chosen per test case in the suite file.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ScoreCurve {
    /// `(tmin/t)^0.5 * (tmax-t)/(tmax-tmin)` between the anchors.
    PowerLaw {
        /// Full marks at or below this time.
        tmin: f64,
        /// Zero at or above this time.
        tmax: f64,
    },
    /// `((base-x)/(base-full))^2`, ratio clamped to `[0, 1]`.
    ///
    /// Works for both directions: `full < base` for timings, `full > base` for throughputs.
    QuadraticRatio {
        /// Full-score threshold.
        full: f64,
        /// Zero-score threshold.
        base: f64,
    },
    /// `(ln(base)-ln(x))/(ln(base)-ln(full))`, clamped to `[0, 1]`. Direction-agnostic.
    LogInterp {
        /// Full-score threshold.
        full: f64,
        /// Zero-score threshold.
        base: f64,
    },
    /// Logarithmic from `(t_full, 1)` to `(t_mid, mid)`, then quadratic decay to `(t_low, 0)`.
    PiecewiseLogQuadratic {
        /// Full marks at or below this time.
        t_full: f64,
        /// Knee of the curve.
        t_mid: f64,
        /// Zero at or above this time.
        t_low: f64,
        /// Fraction awarded at `t_mid`.
        mid: f64,
    },
    /// `1 - ((x-full)/(base-full))^exponent`, ratio clamped to `[0, 1]`.
    ClampedPower {
        /// Full-score threshold.
        full: f64,
        /// Zero-score threshold.
        base: f64,
        /// Shape of the decay.
        exponent: f64,
    },
}

impl ScoreCurve {
    /// Fraction of the case weight earned by `x`. Always within `[0, 1]`.
    ///
    /// Non-positive and NaN measurements are worth nothing.
    pub fn fraction(&self, x: f64) -> f64 {
        if x.is_nan() || x <= 0.0 {
            return 0.0;
        }
        let value = match *self {
            ScoreCurve::PowerLaw { tmin, tmax } => {
                if x <= tmin {
                    1.0
                } else if x >= tmax {
                    0.0
                } else {
                    (tmin / x).sqrt() * (tmax - x) / (tmax - tmin)
                }
            }
            ScoreCurve::QuadraticRatio { full, base } => {
                if reached(x, full, base) {
                    1.0
                } else if reached(x, base, full) {
                    0.0
                } else {
                    clamp_unit((base - x) / (base - full)).powi(2)
                }
            }
            ScoreCurve::LogInterp { full, base } => {
                if reached(x, full, base) {
                    1.0
                } else if reached(x, base, full) {
                    0.0
                } else {
                    clamp_unit((base.ln() - x.ln()) / (base.ln() - full.ln()))
                }
            }
            ScoreCurve::PiecewiseLogQuadratic {
                t_full,
                t_mid,
                t_low,
                mid,
            } => {
                if x <= t_full {
                    1.0
                } else if x >= t_low {
                    0.0
                } else if x <= t_mid {
                    (1.0 - mid) * (x.ln() - t_mid.ln()) / (t_full.ln() - t_mid.ln()) + mid
                } else {
                    let r = (x - t_mid) / (t_low - t_mid);
                    mid * (1.0 - r * r)
                }
            }
            ScoreCurve::ClampedPower {
                full,
                base,
                exponent,
            } => {
                if reached(x, full, base) {
                    1.0
                } else if reached(x, base, full) {
                    0.0
                } else {
                    1.0 - clamp_unit((x - full) / (base - full)).powf(exponent)
                }
            }
        };
        clamp_unit(value)
    }

    /// Points earned by `x` for a case worth `weight` points.
    pub fn points(&self, x: f64, weight: f64) -> f64 {
        self.fraction(x) * weight
    }

    /// True when larger measurements are better (throughput-like curves).
    pub fn higher_is_better(&self) -> bool {
        match *self {
            ScoreCurve::QuadraticRatio { full, base }
            | ScoreCurve::LogInterp { full, base }
            | ScoreCurve::ClampedPower { full, base, .. } => full > base,
            ScoreCurve::PowerLaw { .. } | ScoreCurve::PiecewiseLogQuadratic { .. } => false,
        }
    }

    /// Checks that the thresholds describe a usable curve.
    pub fn validate(&self) -> Result<(), String> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(format!("{name} must be a positive number, got {v}"))
            }
        };
        match *self {
            ScoreCurve::PowerLaw { tmin, tmax } => {
                positive("tmin", tmin)?;
                positive("tmax", tmax)?;
                if tmin >= tmax {
                    return Err(format!("tmin ({tmin}) must be lower than tmax ({tmax})"));
                }
            }
            ScoreCurve::QuadraticRatio { full, base } | ScoreCurve::LogInterp { full, base } => {
                positive("full", full)?;
                positive("base", base)?;
                if full == base {
                    return Err(format!("full and base must differ (both {full})"));
                }
            }
            ScoreCurve::PiecewiseLogQuadratic {
                t_full,
                t_mid,
                t_low,
                mid,
            } => {
                positive("t_full", t_full)?;
                if !(t_full < t_mid && t_mid < t_low) {
                    return Err(format!(
                        "anchors must be increasing, got {t_full} < {t_mid} < {t_low}"
                    ));
                }
                if !(0.0..=1.0).contains(&mid) {
                    return Err(format!("mid must be within [0, 1], got {mid}"));
                }
            }
            ScoreCurve::ClampedPower {
                full,
                base,
                exponent,
            } => {
                positive("exponent", exponent)?;
                if full == base {
                    return Err(format!("full and base must differ (both {full})"));
                }
            }
        }
        Ok(())
    }
}

/// `x` is at or past `anchor`, looking from `other` towards `anchor`.
fn reached(x: f64, anchor: f64, other: f64) -> bool {
    if anchor < other {
        x <= anchor
    } else {
        x >= anchor
    }
}

fn clamp_unit(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

#[cfg(test)]
mod curve_tests {
    use super::*;

    fn families() -> Vec<(ScoreCurve, f64, f64)> {
        vec![
            (ScoreCurve::PowerLaw { tmin: 9.5, tmax: 237.5 }, 9.5, 237.5),
            (ScoreCurve::QuadraticRatio { full: 0.84, base: 8.4 }, 0.84, 8.4),
            (ScoreCurve::LogInterp { full: 1200.0, base: 27500.0 }, 1200.0, 27500.0),
            (
                ScoreCurve::PiecewiseLogQuadratic {
                    t_full: 14.8,
                    t_mid: 420.0,
                    t_low: 2000.0,
                    mid: 0.73,
                },
                14.8,
                2000.0,
            ),
            (
                ScoreCurve::ClampedPower {
                    full: 5.0,
                    base: 25.0,
                    exponent: 1.5,
                },
                5.0,
                25.0,
            ),
        ]
    }

    #[test]
    fn anchors_saturate_exactly() {
        for (curve, full, base) in families() {
            assert_eq!(curve.fraction(full), 1.0, "{curve:?} at full");
            assert_eq!(curve.fraction(base), 0.0, "{curve:?} at base");
            assert_eq!(curve.points(full, 25.0), 25.0);
            assert_eq!(curve.points(base, 25.0), 0.0);
        }
    }

    #[test]
    fn lower_time_never_scores_less() {
        for (curve, full, base) in families() {
            let mut previous = f64::INFINITY;
            let steps = 500;
            for i in 0..=steps {
                // sweep from half the full threshold to twice the zero threshold
                let t = full * 0.5 + (base * 2.0 - full * 0.5) * i as f64 / steps as f64;
                let f = curve.fraction(t);
                assert!((0.0..=1.0).contains(&f), "{curve:?}({t}) = {f}");
                assert!(f <= previous + 1e-12, "{curve:?} not monotonic at {t}");
                previous = f;
            }
        }
    }

    #[test]
    fn power_law_matches_reference_formula() {
        let curve = ScoreCurve::PowerLaw { tmin: 9.5, tmax: 237.5 };
        let expected = (9.5f64 / 50.0).powf(0.5) * (237.5 - 50.0) / (237.5 - 9.5);
        assert!((curve.fraction(50.0) - expected).abs() < 1e-12);
    }

    #[test]
    fn throughput_curves_reward_higher_values() {
        let bfs = ScoreCurve::QuadraticRatio { full: 1.4e9, base: 3.0e8 };
        assert!(bfs.higher_is_better());
        assert_eq!(bfs.fraction(1.4e9), 1.0);
        assert_eq!(bfs.fraction(2.0e9), 1.0);
        assert_eq!(bfs.fraction(3.0e8), 0.0);
        assert_eq!(bfs.fraction(1.0e8), 0.0);
        let x: f64 = 5.28466e8;
        let expected = ((x - 3.0e8) / (1.4e9 - 3.0e8)).powi(2);
        assert!((bfs.fraction(x) - expected).abs() < 1e-12);

        let log = ScoreCurve::LogInterp { full: 1.0e9, base: 1.0e8 };
        assert!(log.fraction(5.0e8) > log.fraction(2.0e8));
    }

    #[test]
    fn log_interp_matches_calculation_key() {
        let curve = ScoreCurve::LogInterp { full: 1200.0, base: 27500.0 };
        let t: f64 = 5000.0;
        let expected = (27500f64.ln() - t.ln()) / (27500f64.ln() - 1200f64.ln());
        assert!((curve.points(t, 25.0) - expected * 25.0).abs() < 1e-9);
    }

    #[test]
    fn piecewise_is_continuous_at_the_knee() {
        let curve = ScoreCurve::PiecewiseLogQuadratic {
            t_full: 14.8,
            t_mid: 420.0,
            t_low: 2000.0,
            mid: 0.73,
        };
        assert!((curve.fraction(420.0) - 0.73).abs() < 1e-12);
        assert!((curve.fraction(420.0 + 1e-9) - 0.73).abs() < 1e-6);
    }

    #[test]
    fn garbage_measurements_score_zero() {
        for (curve, _, _) in families() {
            assert_eq!(curve.fraction(f64::NAN), 0.0);
            assert_eq!(curve.fraction(0.0), 0.0);
            assert_eq!(curve.fraction(-3.0), 0.0);
        }
    }

    #[test]
    fn rejects_inverted_power_law() {
        assert!(ScoreCurve::PowerLaw { tmin: 10.0, tmax: 5.0 }.validate().is_err());
        assert!(ScoreCurve::LogInterp { full: 1.0, base: 1.0 }.validate().is_err());
        assert!(ScoreCurve::PowerLaw { tmin: 9.5, tmax: 237.5 }.validate().is_ok());
    }
}
