//! Rounding and free-area percentage rules.
//!
//! Each rule exists twice: as a Rust function used for in-process
//! computation and as a SQL expression builder used inside the batch
//! `INSERT ... SELECT`. Null and `NaN` inputs become `0` in both forms.

/// Significant digits `PostgreSQL` keeps when casting `float8` to `numeric`.
const NUMERIC_CAST_DIGITS: usize = 15;

/// Rounds to 2 decimal places, half away from zero, with the same result
/// as [`round2_expr`]: the value is first cut to the 15 significant digits
/// of a `float8::numeric` cast, so `1.005` rounds to `1.01`.
///
/// `None`, `NaN`, and infinities yield `0.0`.
#[must_use]
pub fn round2(value: Option<f64>) -> f64 {
    match value {
        Some(v) if v.is_finite() => round_numeric(v),
        _ => 0.0,
    }
}

#[allow(clippy::cast_precision_loss)]
fn round_numeric(v: f64) -> f64 {
    let text = format!("{:.*e}", NUMERIC_CAST_DIGITS - 1, v.abs());
    let Some((mantissa, exponent)) = text.split_once('e') else {
        return v;
    };
    let (Ok(digits), Ok(exponent)) = (
        mantissa.replace('.', "").parse::<u64>(),
        exponent.parse::<i32>(),
    ) else {
        return v;
    };

    // |v| = digits * 10^(exponent - 14), so hundredths need this many
    // trailing digits dropped.
    let Ok(shift) = u32::try_from(12 - exponent) else {
        return text.parse::<f64>().map_or(v, |abs| abs.copysign(v));
    };
    let Some(scale) = 10u64.checked_pow(shift) else {
        return 0.0;
    };

    let mut hundredths = digits / scale;
    if (digits % scale) * 2 >= scale {
        hundredths += 1;
    }
    (hundredths as f64 / 100.0).copysign(v)
}

/// Free area as a percentage of parcel area, rounded to 2 decimals.
///
/// Zero, null, or `NaN` parcel area yields `0.0` rather than propagating a
/// division by zero into responses.
#[must_use]
pub fn free_pct(parcel_area: Option<f64>, free_area: Option<f64>) -> f64 {
    match (parcel_area, free_area) {
        (Some(parcel), Some(free)) if parcel != 0.0 && parcel.is_finite() => {
            round2(Some(free / parcel * 100.0))
        }
        _ => 0.0,
    }
}

/// SQL expression rounding `expr` to 2 decimals, mapping null and `NaN` to 0.
#[must_use]
pub fn round2_expr(expr: &str) -> String {
    format!(
        "CASE WHEN ({expr}) IS NULL OR ({expr})::float8 = 'NaN'::float8 THEN 0 \
         ELSE ROUND(({expr})::numeric, 2) END"
    )
}

/// SQL expression for the free-area percentage of `parcel` and `free`.
#[must_use]
pub fn free_pct_expr(parcel: &str, free: &str) -> String {
    round2_expr(&format!(
        "({free})::float8 / NULLIF(({parcel})::float8, 0) * 100"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_two_decimals() {
        assert!((round2(Some(1234.5678)) - 1234.57).abs() < f64::EPSILON);
        assert!((round2(Some(0.125)) - 0.13).abs() < f64::EPSILON);
        assert!((round2(Some(-7.126)) - -7.13).abs() < 1e-9);
        assert!((round2(Some(10.0)) - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn halfway_values_round_like_numeric() {
        assert!((round2(Some(1.005)) - 1.01).abs() < f64::EPSILON);
        assert!((round2(Some(-1.005)) - -1.01).abs() < f64::EPSILON);
        assert!((round2(Some(2.675)) - 2.68).abs() < f64::EPSILON);
        assert!((round2(Some(1.004_999)) - 1.0).abs() < f64::EPSILON);
        assert!(round2(Some(1e-9)).abs() < f64::EPSILON);
        assert!((round2(Some(1e20)) - 1e20).abs() < 1.0);
    }

    #[test]
    fn null_and_nan_round_to_zero() {
        assert!(round2(None).abs() < f64::EPSILON);
        assert!(round2(Some(f64::NAN)).abs() < f64::EPSILON);
        assert!(round2(Some(f64::INFINITY)).abs() < f64::EPSILON);
    }

    #[test]
    fn free_pct_of_normal_parcel() {
        let pct = free_pct(Some(1000.0), Some(405.0));
        assert!((pct - 40.5).abs() < f64::EPSILON);

        let pct = free_pct(Some(3.0), Some(1.0));
        assert!((pct - 33.33).abs() < f64::EPSILON);
    }

    #[test]
    fn free_pct_zero_or_null_parcel_area_is_zero() {
        assert!(free_pct(Some(0.0), Some(12.0)).abs() < f64::EPSILON);
        assert!(free_pct(None, Some(12.0)).abs() < f64::EPSILON);
        assert!(free_pct(Some(100.0), None).abs() < f64::EPSILON);
        assert!(free_pct(Some(f64::NAN), Some(1.0)).abs() < f64::EPSILON);
    }

    #[test]
    fn sql_expressions_guard_nulls() {
        let expr = round2_expr("src.parcelarea");
        assert!(expr.starts_with("CASE WHEN (src.parcelarea) IS NULL"));
        assert!(expr.contains("ROUND((src.parcelarea)::numeric, 2)"));

        let pct = free_pct_expr("src.parcelarea", "src.freearea");
        assert!(pct.contains("NULLIF((src.parcelarea)::float8, 0)"));
    }
}
