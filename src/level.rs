//! Level computation.
//!
//! The monitor's authoritative level is the linear product of the endpoint's
//! peak meter and its master volume scalar, so a muted or attenuated device
//! reports near-silence even at full digital peak. The dB SPL mapping is a
//! display heuristic only.

// =============================================================================
// Constants
// =============================================================================

/// Multiplier for linear to dB conversion (20 * log10)
const DB_CONVERSION_FACTOR: f32 = 20.0;

/// Default offset added to dBFS to estimate dB SPL
pub const DEFAULT_CALIBRATION_DB: f32 = 90.0;

/// Lower bound of the dB SPL estimate
const DB_SPL_MIN: f32 = 0.0;

/// Upper bound of the dB SPL estimate (realistic maximum)
const DB_SPL_MAX: f32 = 140.0;

/// Combines a peak meter value and a volume scalar into a level in [0, 1].
///
/// NaN inputs produce 0.
pub fn compute_level(peak: f32, volume_scalar: f32) -> f32 {
    let level = peak * volume_scalar;
    if level.is_nan() {
        0.0
    } else {
        level.clamp(0.0, 1.0)
    }
}

/// Converts a linear level to dB relative to full scale.
///
/// The level is floored at `f32::EPSILON` so silence maps to a finite value.
pub fn level_to_db_fs(level: f32) -> f32 {
    let floored = if level.is_nan() {
        f32::EPSILON
    } else {
        level.max(f32::EPSILON)
    };
    DB_CONVERSION_FACTOR * floored.log10()
}

/// Estimates sound pressure level from a linear level.
///
/// `dbSPL = clamp(dbFS + calibration, 0, 140)`. Monotonically non-decreasing in
/// `level`; never infinite.
pub fn level_to_db_spl(level: f32, calibration_db: f32) -> f32 {
    (level_to_db_fs(level) + calibration_db).clamp(DB_SPL_MIN, DB_SPL_MAX)
}

/// [`level_to_db_spl`] with [`DEFAULT_CALIBRATION_DB`].
pub fn db_spl(level: f32) -> f32 {
    level_to_db_spl(level, DEFAULT_CALIBRATION_DB)
}

/// Converts a level to the integer percentage shown on the volume bar.
pub fn level_to_percent(level: f32) -> u8 {
    if level.is_nan() {
        return 0;
    }
    (level.clamp(0.0, 1.0) * 100.0) as u8
}
