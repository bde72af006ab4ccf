use anyhow::{ensure, Result};
use image::{imageops, GrayImage, Luma};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

use crate::detection::TagDetection;
use crate::geometry::{rotation_about_center, transform_point, Quadrilateral};

/// Background of the binarized sub-image: tag ink is dark, paper is white.
const BACKGROUND: Luma<u8> = Luma([255u8]);

/// Extra pixels added around the marker envelope when erasing.
const ERASE_MARGIN: f64 = 5.0;

/// Rotates an image by a multiple of 90 degrees about its center onto a
/// same-size canvas, filling exposed corners with background.
///
/// Uses inverse mapping per output pixel; for quarter turns the mapping is
/// exact, so no interpolation is involved. Always returns a new buffer.
pub fn rotate_quarter(image: &GrayImage, quarter_turns: u32) -> GrayImage {
    let turns = quarter_turns % 4;
    if turns == 0 {
        return image.clone();
    }

    let (width, height) = image.dimensions();
    let (cx, cy) = (width as f64 / 2.0, height as f64 / 2.0);
    let inverse = rotation_about_center(-(turns as f64) * 90.0, cx, cy);

    let mut output = GrayImage::new(width, height);

    for out_y in 0..height {
        for out_x in 0..width {
            // Map the output pixel center back to its source pixel.
            let (src_x, src_y) =
                transform_point(&inverse, out_x as f64 + 0.5, out_y as f64 + 0.5);
            let src_x = (src_x - 0.5).round() as i64;
            let src_y = (src_y - 0.5).round() as i64;

            let pixel = if src_x >= 0
                && src_x < width as i64
                && src_y >= 0
                && src_y < height as i64
            {
                *image.get_pixel(src_x as u32, src_y as u32)
            } else {
                BACKGROUND
            };

            output.put_pixel(out_x, out_y, pixel);
        }
    }

    output
}

/// Rewrites the sub-image into its canonical upright form.
///
/// Applies the detected quarter-turn rotation and horizontal flip, then
/// optionally erases the marker bars and crops (or blanks) the adaptive
/// padding. The input buffer is never touched; every step produces a fresh
/// owned image and the caller owns the result exclusively.
pub fn normalize_image(
    image: &GrayImage,
    detection: &TagDetection,
    remove_padding: bool,
    remove_markers: bool,
    verbose: bool,
) -> Result<GrayImage> {
    let (width, height) = image.dimensions();
    ensure!(width > 0 && height > 0, "cannot normalize an empty image");

    let mut working = rotate_quarter(image, detection.image_rotation);
    if detection.flipped_horizontally {
        working = imageops::flip_horizontal(&working);
    }

    let padding = adaptive_padding(detection, width, height);

    if verbose {
        eprintln!(
            "Normalize: rotation={}x90°, flip={}, padding={}px",
            detection.image_rotation, detection.flipped_horizontally, padding
        );
    }

    if remove_markers {
        erase_markers(&mut working, detection, padding);
        if !remove_padding {
            blank_border(&mut working, padding);
        }
    }

    if remove_padding && padding > 0 {
        working = imageops::crop_imm(
            &working,
            padding,
            padding,
            width - 2 * padding,
            height - 2 * padding,
        )
        .to_image();
    }

    Ok(working)
}

/// Minimal symmetric border width that contains every marker close to the
/// sub-image edge.
///
/// Compensates for the upstream crop not being perfectly centered on the
/// tag: a marker that crept into the near-edge band contributes its far
/// extent measured from that edge, so blanking or cropping a border of the
/// returned width removes it entirely.
fn adaptive_padding(detection: &TagDetection, width: u32, height: u32) -> u32 {
    let long_side = width.max(height) as f64;
    let min_edge = long_side * 0.1;
    let max_edge = long_side - min_edge;

    let mut padding = 0.0f64;

    for marker in detection.markers.iter().flatten() {
        if marker.min_x() < min_edge {
            padding = padding.max(marker.max_x());
        }
        if marker.min_y() < min_edge {
            padding = padding.max(marker.max_y());
        }
        if marker.max_x() > max_edge {
            padding = padding.max(width as f64 - marker.min_x());
        }
        if marker.max_y() > max_edge {
            padding = padding.max(height as f64 - marker.min_y());
        }
    }

    // The border must leave a non-empty interior to crop to.
    let limit = (width.min(height) - 1) / 2;
    (padding.ceil() as u32).min(limit)
}

/// Paints background rectangles over the four marker positions at the
/// corners of the padded interior.
///
/// The upright tag carries vertical bars along its top edge and horizontal
/// bars along the bottom, so the envelope's long axis follows the corner.
fn erase_markers(image: &mut GrayImage, detection: &TagDetection, padding: u32) {
    let (width, height) = image.dimensions();

    let mut narrow = 0.0f64;
    let mut wide = 0.0f64;
    for marker in detection.markers.iter().flatten() {
        narrow = narrow.max(marker.width().min(marker.height()));
        wide = wide.max(marker.width().max(marker.height()));
    }
    if wide == 0.0 {
        return;
    }

    let narrow = (narrow + ERASE_MARGIN).ceil() as u32;
    let wide = (wide + ERASE_MARGIN).ceil() as u32;

    let left = padding as i32;
    let top = padding as i32;
    let right = (width - padding) as i32;
    let bottom = (height - padding) as i32;

    let rects = [
        Rect::at(left, top).of_size(narrow, wide),
        Rect::at(right - narrow as i32, top).of_size(narrow, wide),
        Rect::at(left, bottom - narrow as i32).of_size(wide, narrow),
        Rect::at(right - wide as i32, bottom - narrow as i32).of_size(wide, narrow),
    ];

    for rect in rects {
        draw_filled_rect_mut(image, rect, BACKGROUND);
    }
}

/// Blanks the four border strips of the given thickness instead of cropping
/// them away.
fn blank_border(image: &mut GrayImage, padding: u32) {
    if padding == 0 {
        return;
    }

    let (width, height) = image.dimensions();

    let strips = [
        Rect::at(0, 0).of_size(width, padding),
        Rect::at(0, (height - padding) as i32).of_size(width, padding),
        Rect::at(0, 0).of_size(padding, height),
        Rect::at((width - padding) as i32, 0).of_size(padding, height),
    ];

    for strip in strips {
        draw_filled_rect_mut(image, strip, BACKGROUND);
    }
}

/// Repositions the detected markers to match the normalized image, for
/// overlay rendering: rotate by the marker re-alignment turns, then mirror
/// if the image was flipped. Empty slots pass through unchanged.
pub fn normalize_markers(
    detection: &TagDetection,
    width: u32,
    height: u32,
) -> Vec<Option<Quadrilateral>> {
    let (cx, cy) = (width as f64 / 2.0, height as f64 / 2.0);
    let rotation = rotation_about_center(detection.markers_rotation as f64 * 90.0, cx, cy);

    detection
        .markers
        .iter()
        .map(|slot| {
            slot.map(|marker| {
                let rotated = marker.transformed(&rotation);
                if detection.flipped_horizontally {
                    rotated.mirrored_horizontally(width as f64)
                } else {
                    rotated
                }
            })
        })
        .collect()
}
