use anyhow::{Context, Result};
use clap::Parser;
use image::ImageReader;

use tagnorm::{
    cli::load_candidates, normalize_image, normalize_markers, Cli, Quadrilateral, TagDetector,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load the sub-image
    let img = ImageReader::open(&cli.image)
        .with_context(|| format!("Failed to open input file: {:?}", cli.image))?
        .decode()
        .with_context(|| format!("Failed to decode image: {:?}", cli.image))?;
    let gray = img.to_luma8();
    let (width, height) = gray.dimensions();

    let candidates = load_candidates(&cli.candidates)?;

    if cli.verbose {
        eprintln!("Loaded image: {:?} ({}x{})", cli.image, width, height);
        eprintln!("Loaded {} candidate quadrilaterals", candidates.len());
        eprintln!();
    }

    // Without an explicit source quadrilateral, assume an unrotated,
    // unflipped unwarp of the whole sub-image.
    let source_quad = cli
        .source_quad
        .unwrap_or_else(|| Quadrilateral::upright(width as f64, height as f64));

    let detector = TagDetector::new(width, height)?;

    let Some(detection) = detector.detect(&candidates, &source_quad) else {
        eprintln!("No tag found among {} candidates", candidates.len());
        return Ok(());
    };

    eprintln!(
        "Tag detected: angle={:.2}°, rotation={}x90°, flipped={}, confidence={:.2}",
        detection.rotation_angle,
        detection.image_rotation,
        detection.flipped_horizontally,
        detection.confidence
    );

    if cli.verbose {
        eprintln!();
        eprintln!("Markers in normalized frame:");
        let markers = normalize_markers(&detection, width, height);
        for (index, slot) in markers.iter().enumerate() {
            match slot {
                Some(marker) => {
                    let (min_x, min_y, max_x, max_y) = marker.bounding_box();
                    eprintln!(
                        "  [{}] ({:.1}, {:.1}) - ({:.1}, {:.1})",
                        index, min_x, min_y, max_x, max_y
                    );
                }
                None => eprintln!("  [{}] not a marker", index),
            }
        }
        eprintln!();
    }

    let normalized = normalize_image(
        &gray,
        &detection,
        cli.remove_padding,
        cli.remove_markers,
        cli.verbose,
    )?;

    let output_path = cli.output_path();
    normalized
        .save(&output_path)
        .with_context(|| format!("Failed to save output: {:?}", output_path))?;

    eprintln!("Saved normalized tag image: {:?}", output_path);
    eprintln!(
        "Dimensions: {}x{} -> {}x{}",
        width,
        height,
        normalized.width(),
        normalized.height()
    );

    Ok(())
}
