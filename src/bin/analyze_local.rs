//! Run the banner pipeline on local image files, without the HTTP server
//! Run with: cargo run --release --bin analyze_local -- <image_path>...

use anyhow::{Context, Result};
use banner_analyzer::{core::Config, orchestration::BannerPipeline, utils::Metrics};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("banner_analyzer=info,ort=off")
        .with_target(false)
        .init();

    let paths: Vec<String> = std::env::args().skip(1).collect();
    if paths.is_empty() {
        eprintln!("Usage: analyze_local <image_path>...");
        std::process::exit(2);
    }

    let config = Arc::new(Config::new().context("Failed to load configuration")?);
    let pipeline = BannerPipeline::from_config(config, Metrics::new()).await?;
    info!("Models loaded ({})", pipeline.backend_type());

    for path in &paths {
        if !Path::new(path).exists() {
            eprintln!("Image not found: {}", path);
            continue;
        }

        let image = Arc::new(image::open(path).with_context(|| format!("Failed to open {}", path))?);
        info!("Image {}: {}x{}", path, image.width(), image.height());

        let records = pipeline.process_image(&image).await?;

        println!("\n=== {} ===", path);
        if records.is_empty() {
            println!("  (no banners)");
        }
        for (i, record) in records.iter().enumerate() {
            let b = record.region.bounding_box;
            println!(
                "  {}. [{},{} {}x{}] det={:.2}  {} ({:.2})  \"{}\"",
                i + 1,
                b.x,
                b.y,
                b.w,
                b.h,
                record.region.confidence,
                record.label,
                record.label_confidence,
                record.text
            );
        }
    }

    Ok(())
}
