/// 지구 반지름 (km)
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// 두 `[lat, lng]` 좌표 사이의 대원 거리 (haversine, km)
pub fn haversine_km(from: [f64; 2], to: [f64; 2]) -> f64 {
    let [lat1, lng1] = from;
    let [lat2, lng2] = to;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}
