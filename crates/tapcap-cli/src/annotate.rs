//! Screenshot annotation.
//!
//! The boxed screenshot is the raw capture with the resolved control
//! outlined in red. The outline is four nested one-pixel rectangles so it
//! stays visible on high-density screens without obscuring the control.

use std::io::Cursor;

use image::{ImageFormat, Rgba, RgbaImage};
use tapcap_core::error::ApiError;
use tapcap_core::hierarchy::BoundingRect;

const OUTLINE_COLOR: Rgba<u8> = Rgba([255, 0, 0, 255]);
const OUTLINE_THICKNESS: i32 = 4;

/// Decode a PNG, outline the rectangle, and re-encode. Rectangles that
/// spill past the image edges are clamped, never an error.
pub fn annotate_png(png: &[u8], rect: BoundingRect) -> Result<Vec<u8>, ApiError> {
    let mut img = image::load_from_memory(png)
        .map_err(|e| ApiError::capture(format!("screenshot is not a decodable image: {e}")))?
        .to_rgba8();
    for inset in 0..OUTLINE_THICKNESS {
        draw_rect_outline(
            &mut img,
            rect.left + inset,
            rect.top + inset,
            rect.right - inset,
            rect.bottom - inset,
        );
    }
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .map_err(|e| ApiError::capture(format!("cannot encode annotated screenshot: {e}")))?;
    Ok(out)
}

fn draw_rect_outline(img: &mut RgbaImage, left: i32, top: i32, right: i32, bottom: i32) {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let max_x = (width - 1) as i32;
    let max_y = (height - 1) as i32;
    let l = left.clamp(0, max_x);
    let r = right.clamp(0, max_x);
    let t = top.clamp(0, max_y);
    let b = bottom.clamp(0, max_y);
    if l > r || t > b {
        return;
    }
    for x in l..=r {
        img.put_pixel(x as u32, t as u32, OUTLINE_COLOR);
        img.put_pixel(x as u32, b as u32, OUTLINE_COLOR);
    }
    for y in t..=b {
        img.put_pixel(l as u32, y as u32, OUTLINE_COLOR);
        img.put_pixel(r as u32, y as u32, OUTLINE_COLOR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn white_png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn decode(png: &[u8]) -> RgbaImage {
        image::load_from_memory(png).unwrap().to_rgba8()
    }

    #[test]
    fn outline_is_drawn_and_interior_untouched() {
        let rect = BoundingRect::parse("[10,10][40,40]").unwrap();
        let annotated = decode(&annotate_png(&white_png(60, 60), rect).unwrap());
        // Outermost ring is red.
        assert_eq!(*annotated.get_pixel(10, 10), OUTLINE_COLOR);
        assert_eq!(*annotated.get_pixel(25, 10), OUTLINE_COLOR);
        assert_eq!(*annotated.get_pixel(40, 40), OUTLINE_COLOR);
        // Thickness reaches 4 pixels in.
        assert_eq!(*annotated.get_pixel(25, 13), OUTLINE_COLOR);
        // Interior and exterior keep their color.
        assert_eq!(*annotated.get_pixel(25, 25), Rgba([255, 255, 255, 255]));
        assert_eq!(*annotated.get_pixel(5, 5), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn out_of_bounds_rect_is_clamped() {
        let rect = BoundingRect::parse("[-20,-20][200,200]").unwrap();
        let annotated = decode(&annotate_png(&white_png(30, 30), rect).unwrap());
        assert_eq!(*annotated.get_pixel(0, 0), OUTLINE_COLOR);
        assert_eq!(*annotated.get_pixel(29, 29), OUTLINE_COLOR);
    }

    #[test]
    fn undecodable_bytes_are_a_capture_error() {
        let rect = BoundingRect::parse("[0,0][5,5]").unwrap();
        let err = annotate_png(b"definitely not a png", rect).unwrap_err();
        assert_eq!(err.code, tapcap_core::error::ErrorCode::Capture);
    }

    #[test]
    fn annotation_preserves_dimensions() {
        let rect = BoundingRect::parse("[2,2][8,8]").unwrap();
        let annotated = decode(&annotate_png(&white_png(12, 17), rect).unwrap());
        assert_eq!(annotated.dimensions(), (12, 17));
    }
}
