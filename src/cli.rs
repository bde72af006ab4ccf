use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::geometry::Quadrilateral;

#[derive(Parser, Debug)]
#[command(name = "tagnorm")]
#[command(version, about = "Detect fiducial tag orientation and emit an upright, marker-free crop")]
pub struct Cli {
    /// Sub-image containing the suspected tag (decoded to grayscale)
    #[arg(required = true)]
    pub image: PathBuf,

    /// File with candidate quadrilaterals, one per line: "x0,y0 x1,y1 x2,y2 x3,y3"
    #[arg(required = true)]
    pub candidates: PathBuf,

    /// Quadrilateral the sub-image was unwarped from, same format as a
    /// candidate line [default: the upright frame of the sub-image]
    #[arg(short, long, value_parser = parse_quad)]
    pub source_quad: Option<Quadrilateral>,

    /// Output path [default: input_normalized.png]
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Crop the adaptive padding away
    #[arg(long)]
    pub remove_padding: bool,

    /// Erase the marker bars from the output
    #[arg(long)]
    pub remove_markers: bool,

    /// Show detection details
    #[arg(long)]
    pub verbose: bool,
}

impl Cli {
    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            let stem = self.image.file_stem().unwrap_or_default().to_string_lossy();
            let parent = self.image.parent().unwrap_or(Path::new("."));
            parent.join(format!("{}_normalized.png", stem))
        })
    }
}

/// Parses "x0,y0 x1,y1 x2,y2 x3,y3" into a quadrilateral.
pub fn parse_quad(s: &str) -> Result<Quadrilateral, String> {
    let corners: Vec<&str> = s.split_whitespace().collect();
    if corners.len() != 4 {
        return Err(format!(
            "expected 4 corners 'x0,y0 x1,y1 x2,y2 x3,y3', got {} in '{}'",
            corners.len(),
            s
        ));
    }

    let mut coords = [(0.0, 0.0); 4];
    for (i, corner) in corners.iter().enumerate() {
        let (x, y) = corner
            .split_once(',')
            .ok_or_else(|| format!("invalid corner '{}', expected x,y", corner))?;
        let x: f64 = x
            .trim()
            .parse()
            .map_err(|_| format!("invalid x value: {}", x))?;
        let y: f64 = y
            .trim()
            .parse()
            .map_err(|_| format!("invalid y value: {}", y))?;
        coords[i] = (x, y);
    }

    Ok(Quadrilateral::from_coords(coords))
}

/// Loads candidate quadrilaterals from a text file, one per line.
/// Blank lines and `#` comments are skipped.
pub fn load_candidates(path: &Path) -> Result<Vec<Quadrilateral>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read candidates file: {:?}", path))?;

    let mut candidates = Vec::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let quad = parse_quad(line)
            .map_err(|e| anyhow::anyhow!("{}:{}: {}", path.display(), number + 1, e))?;
        candidates.push(quad);
    }

    Ok(candidates)
}
