use super::Position;

/// Distance kept from the image edge for edge-anchored positions.
pub const MARGIN: i64 = 10;

/// Top-left corner of the watermark for a named anchor.
///
/// Unknown anchors land at the top-left margin. Results can be negative when
/// the watermark is larger than the image; compositing clips them.
pub fn calculate_position(
    position: &str,
    img_width: u32,
    img_height: u32,
    mark_width: u32,
    mark_height: u32,
) -> (i64, i64) {
    let (w, h) = (img_width as i64, img_height as i64);
    let (mw, mh) = (mark_width as i64, mark_height as i64);

    let left = MARGIN;
    let right = w - mw - MARGIN;
    let top = MARGIN;
    let bottom = h - mh - MARGIN;
    let center_x = (w - mw) / 2;
    let center_y = (h - mh) / 2;

    match Position::parse(position) {
        Some(Position::TopLeft) | None => (left, top),
        Some(Position::TopCenter) => (center_x, top),
        Some(Position::TopRight) => (right, top),
        Some(Position::MiddleLeft) => (left, center_y),
        Some(Position::Center) => (center_x, center_y),
        Some(Position::MiddleRight) => (right, center_y),
        Some(Position::BottomLeft) => (left, bottom),
        Some(Position::BottomCenter) => (center_x, bottom),
        Some(Position::BottomRight) => (right, bottom),
    }
}

/// Length of the watermark's longer side: `size` percent of the image's
/// shorter side, floored.
pub fn watermark_target_size(img_width: u32, img_height: u32, size: u8) -> u32 {
    let shorter = img_width.min(img_height) as u64;
    (shorter * size as u64 / 100) as u32
}

/// Scale the watermark so its longer side equals `target`, keeping the
/// aspect ratio. Never returns a zero dimension.
pub fn scaled_dimensions(mark_width: u32, mark_height: u32, target: u32) -> (u32, u32) {
    let longer = mark_width.max(mark_height).max(1) as u64;
    let width = (mark_width as u64 * target as u64 / longer).max(1);
    let height = (mark_height as u64 * target as u64 / longer).max(1);
    (width as u32, height as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corner_and_center_positions() {
        assert_eq!(calculate_position("bottom-right", 1000, 800, 100, 50), (890, 740));
        assert_eq!(calculate_position("center", 1000, 800, 100, 50), (450, 375));
        assert_eq!(calculate_position("top-left", 1000, 800, 100, 50), (10, 10));
        assert_eq!(calculate_position("top-right", 1000, 800, 100, 50), (890, 10));
        assert_eq!(calculate_position("bottom-left", 1000, 800, 100, 50), (10, 740));
    }

    #[test]
    fn test_unknown_position_falls_back_to_top_left() {
        assert_eq!(calculate_position("nowhere", 1000, 800, 100, 50), (10, 10));
        assert_eq!(calculate_position("", 1000, 800, 100, 50), (10, 10));
        assert_eq!(calculate_position("Bottom-Right", 1000, 800, 100, 50), (10, 10));
    }

    #[test]
    fn test_grid_positions() {
        assert_eq!(calculate_position("top-center", 1000, 800, 100, 50), (450, 10));
        assert_eq!(calculate_position("middle-left", 1000, 800, 100, 50), (10, 375));
        assert_eq!(calculate_position("middle-center", 1000, 800, 100, 50), (450, 375));
        assert_eq!(calculate_position("middle-right", 1000, 800, 100, 50), (890, 375));
        assert_eq!(calculate_position("bottom-center", 1000, 800, 100, 50), (450, 740));
    }

    #[test]
    fn test_center_truncates() {
        assert_eq!(calculate_position("center", 101, 101, 10, 10), (45, 45));
        // Oversized marks truncate toward zero
        assert_eq!(calculate_position("center", 10, 10, 13, 13), (-1, -1));
    }

    #[test]
    fn test_target_size_floors() {
        assert_eq!(watermark_target_size(1000, 800, 50), 400);
        assert_eq!(watermark_target_size(333, 999, 10), 33);
        assert_eq!(watermark_target_size(1, 1, 50), 0);
    }

    #[test]
    fn test_scaled_dimensions_keep_aspect() {
        assert_eq!(scaled_dimensions(200, 100, 400), (400, 200));
        assert_eq!(scaled_dimensions(100, 300, 150), (50, 150));
        assert_eq!(scaled_dimensions(50, 50, 0), (1, 1));
    }
}
