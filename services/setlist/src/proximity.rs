//!
//! src/proximity.rs  Andrew Belles  Oct 17th, 2026
//!
//! Finds active global sets within walking distance of a position
//!

use tracing::debug;

use crate::errors::SetListError;
use crate::persistent::{Persistent, SetList};
use crate::types::Coordinates;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters
pub fn haversine_distance(a: Coordinates, b: Coordinates) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

#[derive(Debug, Clone)]
pub struct NearbySet {
    pub set: SetList,
    pub distance_m: f64
}

/// Keeps sets with coordinates inside `radius_m` (inclusive), closest first
pub fn rank_nearby(origin: Coordinates, sets: Vec<SetList>, radius_m: f64) -> Vec<NearbySet> {
    let mut nearby: Vec<NearbySet> = sets.into_iter()
        .filter_map(|set| {
            let at = set.coordinates()?;
            let distance_m = haversine_distance(origin, at);
            (distance_m <= radius_m).then_some(NearbySet { set, distance_m })
        })
        .collect();
    nearby.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
    nearby
}

pub async fn find_nearby(
    store: &Persistent,
    latitude: f64,
    longitude: f64,
    radius_m: f64
) -> Result<Vec<NearbySet>, SetListError> {
    let origin = Coordinates::new(latitude, longitude)?;
    if !radius_m.is_finite() || radius_m < 0.0 {
        return Err(SetListError::Config(format!("invalid radius: {radius_m}")));
    }

    let active = store.active_global_sets().await?;
    let scanned = active.len();
    let nearby = rank_nearby(origin, active, radius_m);
    debug!(latitude, longitude, radius_m, scanned, found = nearby.len(), "nearby.scan");
    Ok(nearby)
}
