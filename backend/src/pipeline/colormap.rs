use image::Rgb;

/// Jet colormap: blue at 0, through cyan, green and yellow, to red at 255.
pub fn jet(level: u8) -> Rgb<u8> {
    let v = level as f32 / 255.0;
    let channel = |center: f32| {
        let c = (1.5 - (4.0 * v - center).abs()).clamp(0.0, 1.0);
        (c * 255.0).round() as u8
    };
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Quantizes a unit-interval value before lookup.
pub fn jet_unit(value: f32) -> Rgb<u8> {
    jet((value.clamp(0.0, 1.0) * 255.0) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ends_are_cool_and_warm() {
        let low = jet(0);
        let high = jet(255);
        assert!(low[2] > low[0] && low[0] == 0);
        assert!(high[0] > high[2] && high[2] == 0);
    }

    #[test]
    fn middle_is_green() {
        let mid = jet(128);
        assert_eq!(mid[1], 255);
        assert!(mid[0] < 255 && mid[2] < 255);
    }

    #[test]
    fn unit_values_are_clamped() {
        assert_eq!(jet_unit(-1.0), jet(0));
        assert_eq!(jet_unit(2.0), jet(255));
    }
}
