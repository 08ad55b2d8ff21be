//! Shared normalization helpers applied by every source adapter before
//! enqueue (spec §4.3, CRITICAL): unit conversion, callsign trimming, and
//! shallow validation. Centralized here so the three adapters can't drift
//! on the conversion constants.

use tracing::debug;

use crate::state::{FEET_TO_METRES, MPS_TO_KNOTS, NormalizedState};

/// Sane bound for a converted velocity in knots; anything beyond this is
/// almost certainly a units bug upstream (spec §9 open question (b)).
const MAX_PLAUSIBLE_VELOCITY_KNOTS: f64 = 1000.0;

/// Convert a feet altitude to metres, as every altitude field must be
/// stored in metres per §4.3.
pub fn feet_to_metres(feet: f64) -> f64 {
    feet * FEET_TO_METRES
}

/// Convert a metres-per-second velocity to knots, as velocity must be
/// stored in knots per §4.3.
pub fn mps_to_knots(mps: f64) -> f64 {
    mps * MPS_TO_KNOTS
}

/// Apply trimming + shallow validation to a state fresh off an adapter's
/// unit conversion. Returns `Err` with a reason if the observation should
/// be dropped; callers increment their own per-source drop counter.
pub fn finish_normalizing(mut state: NormalizedState) -> Result<NormalizedState, String> {
    state.trim_callsign();

    if let Some(v) = state.velocity
        && !(0.0..=MAX_PLAUSIBLE_VELOCITY_KNOTS).contains(&v)
    {
        metrics::counter!("ingest.normalization.velocity_out_of_range").increment(1);
        debug!(icao24 = %state.icao24, velocity = v, "velocity out of plausible range after conversion");
        return Err(format!("velocity out of range after conversion: {v} kn"));
    }

    state.validate()?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feet_to_metres_matches_known_conversion() {
        assert!((feet_to_metres(10_000.0) - 3048.0).abs() < 0.01);
    }

    #[test]
    fn mps_to_knots_matches_known_conversion() {
        assert!((mps_to_knots(100.0) - 194.384).abs() < 0.01);
    }

    #[test]
    fn finish_normalizing_rejects_implausible_velocity() {
        let state = NormalizedState {
            icao24: "a12b34".to_string(),
            callsign: None,
            country: None,
            latitude: Some(0.0),
            longitude: Some(0.0),
            baro_altitude: Some(1000.0),
            geo_altitude: None,
            on_ground: false,
            velocity: Some(5000.0),
            true_track: None,
            vertical_rate: None,
            last_contact: 0,
            category: None,
            squawk: None,
            emergency: false,
        };
        assert!(finish_normalizing(state).is_err());
    }

    #[test]
    fn finish_normalizing_trims_callsign_and_passes_valid_state() {
        let state = NormalizedState {
            icao24: "a12b34".to_string(),
            callsign: Some("N12345  ".to_string()),
            country: None,
            latitude: Some(0.0),
            longitude: Some(0.0),
            baro_altitude: Some(1000.0),
            geo_altitude: None,
            on_ground: false,
            velocity: Some(120.0),
            true_track: None,
            vertical_rate: None,
            last_contact: 0,
            category: None,
            squawk: None,
            emergency: false,
        };
        let normalized = finish_normalizing(state).unwrap();
        assert_eq!(normalized.callsign.as_deref(), Some("N12345"));
    }
}
