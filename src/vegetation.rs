use crate::config::VegetationConfig;
use crate::domain::{DateWindow, GeoPoint, ObservationDate, Vegetation, round_to};
use crate::error::WildError;
use crate::session::EarthSession;

/// MOD13A1 stores NDVI as an integer scaled by 10000.
pub const NDVI_SCALE: f64 = 10_000.0;

/// Walks back from the observation year (raised to the sensor floor) and
/// returns the first year with a usable value. A year whose lookup errors is
/// skipped; only a closed session aborts the walk.
pub fn lookup_vegetation<S: EarthSession + ?Sized>(
    session: &S,
    point: GeoPoint,
    date: ObservationDate,
    config: &VegetationConfig,
) -> Result<Vegetation, WildError> {
    let base_year = date.year().max(config.floor_year);
    for offset in 0..config.lookback_years {
        let year = base_year - offset as i32;
        if year < config.floor_year {
            break;
        }
        let window = DateWindow::around(date.in_year(year), config.window_days);
        match session.ndvi_mean(point, window) {
            Ok(Some(raw)) => {
                let ndvi = round_to(raw / NDVI_SCALE, 4);
                tracing::debug!(year, ndvi, "vegetation index resolved");
                return Ok(Vegetation::from_ndvi(ndvi, year));
            }
            Ok(None) => tracing::debug!(year, "no imagery in window"),
            Err(WildError::SessionClosed) => return Err(WildError::SessionClosed),
            Err(err) => tracing::debug!(year, error = %err, "vegetation lookup failed; trying previous year"),
        }
    }
    Ok(Vegetation::no_data())
}

pub fn lookup_water_distance<S: EarthSession + ?Sized>(
    session: &S,
    point: GeoPoint,
) -> Result<Option<f64>, WildError> {
    Ok(session.stream_distance(point)?.map(|metres| round_to(metres, 2)))
}
