//! Click coordinates to icon slot.

use crate::compositor::CANVAS_HEIGHT;

/// Map a click on the rendered challenge to a 1-based slot.
///
/// `rendered_width` is the width the widget displayed the image at. Returns
/// `None` for clicks outside the image. A click exactly on a boundary
/// belongs to the slot on its left (`ceil`), and `x == 0` maps to slot 1.
pub fn determine_clicked_icon(x: f64, y: f64, rendered_width: f64, icon_count: u32) -> Option<u32> {
    if icon_count == 0 || !(rendered_width.is_finite() && rendered_width > 0.0) {
        return None;
    }
    if !(x.is_finite() && y.is_finite()) {
        return None;
    }
    if x < 0.0 || x > rendered_width || y < 0.0 || y > f64::from(CANVAS_HEIGHT) {
        return None;
    }

    let slot_width = rendered_width / f64::from(icon_count);
    let position = (x / slot_width).ceil() as u32;
    Some(position.clamp(1, icon_count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edges() {
        assert_eq!(determine_clicked_icon(0.0, 10.0, 320.0, 5), Some(1));
        assert_eq!(determine_clicked_icon(320.0, 10.0, 320.0, 5), Some(5));
        assert_eq!(determine_clicked_icon(0.5, 0.0, 320.0, 5), Some(1));
        assert_eq!(determine_clicked_icon(319.9, 50.0, 320.0, 5), Some(5));
    }

    #[test]
    fn test_boundary_goes_left() {
        assert_eq!(determine_clicked_icon(64.0, 10.0, 320.0, 5), Some(1));
        assert_eq!(determine_clicked_icon(64.01, 10.0, 320.0, 5), Some(2));
        assert_eq!(determine_clicked_icon(128.0, 10.0, 320.0, 5), Some(2));
        assert_eq!(determine_clicked_icon(40.0, 10.0, 320.0, 8), Some(1));
        assert_eq!(determine_clicked_icon(41.0, 10.0, 320.0, 8), Some(2));
    }

    #[test]
    fn test_out_of_bounds() {
        assert_eq!(determine_clicked_icon(10.0, 51.0, 320.0, 5), None);
        assert_eq!(determine_clicked_icon(-1.0, 10.0, 320.0, 5), None);
        assert_eq!(determine_clicked_icon(321.0, 10.0, 320.0, 5), None);
        assert_eq!(determine_clicked_icon(10.0, -0.1, 320.0, 5), None);
        assert_eq!(determine_clicked_icon(f64::NAN, 10.0, 320.0, 5), None);
        assert_eq!(determine_clicked_icon(10.0, 10.0, 0.0, 5), None);
        assert_eq!(determine_clicked_icon(10.0, 10.0, 320.0, 0), None);
    }

    #[test]
    fn test_scaled_widget() {
        // Widget shown at half size: 160px wide, 6 icons.
        let slot = 160.0 / 6.0;
        assert_eq!(determine_clicked_icon(slot * 2.5, 20.0, 160.0, 6), Some(3));
        assert_eq!(determine_clicked_icon(159.0, 20.0, 160.0, 6), Some(6));
    }
}
