use crate::types::GeoPoint;

const MAX_LAT_E5: i64 = 90 * 100_000;
const MAX_LNG_E5: i64 = 180 * 100_000;

/// Decodes a Google encoded polyline (precision 1e5) into coordinates.
///
/// Routes come from the backend in this format. A truncated or malformed
/// chunk ends decoding, as does a running sum that overflows or leaves the
/// valid coordinate range; the points decoded so far are returned.
pub fn decode_polyline(encoded: &str) -> Vec<GeoPoint> {
    let bytes = encoded.as_bytes();
    let mut index = 0;
    let mut lat: i64 = 0;
    let mut lng: i64 = 0;
    let mut points = Vec::new();

    while index < bytes.len() {
        let Some(dlat) = next_value(bytes, &mut index) else {
            break;
        };
        let Some(dlng) = next_value(bytes, &mut index) else {
            break;
        };
        let (Some(next_lat), Some(next_lng)) = (lat.checked_add(dlat), lng.checked_add(dlng)) else {
            break;
        };
        if !(-MAX_LAT_E5..=MAX_LAT_E5).contains(&next_lat) || !(-MAX_LNG_E5..=MAX_LNG_E5).contains(&next_lng) {
            break;
        }
        lat = next_lat;
        lng = next_lng;
        points.push(GeoPoint::new(lat as f64 / 1e5, lng as f64 / 1e5));
    }

    points
}

fn next_value(bytes: &[u8], index: &mut usize) -> Option<i64> {
    let mut result: i64 = 0;
    let mut shift = 0;

    loop {
        let byte = *bytes.get(*index)? as i64 - 63;
        *index += 1;
        if !(0..64).contains(&byte) || shift > 60 {
            return None;
        }
        result |= (byte & 0x1f) << shift;
        shift += 5;
        if byte < 0x20 {
            break;
        }
    }

    Some(if result & 1 != 0 { !(result >> 1) } else { result >> 1 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_decode_reference_polyline() {
        let points = decode_polyline("_p~iF~ps|U_ulLnnqC_mqNvxq`@");

        assert_eq!(points.len(), 3);
        assert_relative_eq!(points[0].lat, 38.5, epsilon = 1e-9);
        assert_relative_eq!(points[0].lng, -120.2, epsilon = 1e-9);
        assert_relative_eq!(points[1].lat, 40.7, epsilon = 1e-9);
        assert_relative_eq!(points[1].lng, -120.95, epsilon = 1e-9);
        assert_relative_eq!(points[2].lat, 43.252, epsilon = 1e-9);
        assert_relative_eq!(points[2].lng, -126.453, epsilon = 1e-9);
    }

    #[test]
    fn test_decode_empty_and_truncated() {
        assert!(decode_polyline("").is_empty());

        // Latitude chunk without a longitude chunk
        let points = decode_polyline("_p~iF~ps|U_ulL");
        assert_eq!(points.len(), 1);
    }

    #[test]
    fn test_oversized_chunks_stop_decoding() {
        // Every chunk decodes to a huge delta; the sum would overflow i64
        let garbage = "~~~~~~~~~~~~?".repeat(64);
        assert!(decode_polyline(&garbage).is_empty());

        // Valid points before the garbage survive
        let points = decode_polyline(&format!("_p~iF~ps|U_ulLnnqC_mqNvxq`@{}", garbage));
        assert_eq!(points.len(), 3);
        assert_relative_eq!(points[2].lat, 43.252, epsilon = 1e-9);
        assert_relative_eq!(points[2].lng, -126.453, epsilon = 1e-9);
    }

    #[test]
    fn test_out_of_range_coordinate_stops_decoding() {
        // Latitude delta of +100 degrees (10_000_000 in 1e-5 units), longitude 0
        let mut encoded = String::new();
        for value in [10_000_000i64, 0] {
            let mut v = (value << 1) as u64;
            while v >= 0x20 {
                encoded.push((((v & 0x1f) | 0x20) as u8 + 63) as char);
                v >>= 5;
            }
            encoded.push((v as u8 + 63) as char);
        }

        assert!(decode_polyline(&encoded).is_empty());
    }
}
