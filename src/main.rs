//! bioimage-streamer - inspect and convert microscopy images.
//!
//! This binary wires the CLI to the reader and writer APIs.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bioimage_streamer::{
    array::Selection,
    config::{Cli, Command, ConvertConfig, InfoConfig},
    io::open_sink,
    metadata::Metadata,
    source::{BioReader, ImageSource},
    writer::{write, OutputCompression, OutputFormat, WriteOptions},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Info(config) => run_info(config).await,
        Command::Convert(config) => run_convert(config).await,
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "bioimage_streamer=debug"
    } else {
        "bioimage_streamer=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Open a source and select a scene, logging any failure.
async fn open_scene(reader: &BioReader, uri: &str, scene: usize) -> Option<ImageSource> {
    let mut source = match reader.open(uri).await {
        Ok(source) => source,
        Err(e) => {
            error!("Failed to open {}: {}", uri, e);
            return None;
        }
    };
    if let Err(e) = source.set_scene(scene).await {
        error!("{}", e);
        return None;
    }
    Some(source)
}

// =============================================================================
// Info Command
// =============================================================================

async fn run_info(config: InfoConfig) -> ExitCode {
    init_logging(config.reader.verbose);

    let reader_config = match config.reader.to_reader_config() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let reader = BioReader::new(reader_config);
    let Some(source) = open_scene(&reader, &config.uri, config.scene).await else {
        return ExitCode::FAILURE;
    };

    if config.json {
        match serde_json::to_string_pretty(source.metadata()) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!("Failed to serialize metadata: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        print_metadata(source.source_id(), source.metadata());
    }

    ExitCode::SUCCESS
}

fn print_metadata(source_id: &str, metadata: &Metadata) {
    let dims = metadata.dims;
    let sizes = metadata.physical_pixel_sizes;
    let size = |v: Option<f64>| v.map_or_else(|| "unknown".to_string(), |v| format!("{} µm", v));

    println!("Source:       {}", source_id);
    println!("Format:       {}", metadata.format);
    println!("Scenes:       {}", metadata.scenes.len());
    for scene in &metadata.scenes {
        let marker = if scene.index == metadata.current_scene {
            "*"
        } else {
            " "
        };
        println!(
            "  {} {:>3}  {}",
            marker,
            scene.index,
            scene.name.as_deref().unwrap_or("-")
        );
    }
    println!(
        "Dimensions:   T={} C={} Z={} Y={} X={} ({})",
        dims.t,
        dims.c,
        dims.z,
        dims.y,
        dims.x,
        metadata.dimension_order()
    );
    println!("Data type:    {}", metadata.dtype);
    println!(
        "Pixel size:   Z={} Y={} X={}",
        size(sizes.z),
        size(sizes.y),
        size(sizes.x)
    );
    println!("Channels:");
    for (index, channel) in metadata.channels.iter().enumerate() {
        let color = channel
            .color
            .map_or_else(|| "-".to_string(), |c| format!("#{:08X}", c));
        let emission = channel
            .emission_wavelength
            .map_or_else(|| "-".to_string(), |w| format!("{} nm", w));
        println!(
            "  {:>3}  {:<24} color {:<10} emission {}",
            index,
            channel.name.as_deref().unwrap_or("-"),
            color,
            emission
        );
    }
    println!(
        "Acquired:     {}",
        metadata.acquisition_time.as_deref().unwrap_or("unknown")
    );
}

// =============================================================================
// Convert Command
// =============================================================================

async fn run_convert(config: ConvertConfig) -> ExitCode {
    init_logging(config.reader.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }
    let reader_config = match config.reader.to_reader_config() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let format: OutputFormat = match config.format.parse() {
        Ok(f) => f,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let compression: OutputCompression = match config.compression.parse() {
        Ok(c) => c,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let reader = BioReader::new(reader_config);
    let Some(source) = open_scene(&reader, &config.input, config.scene).await else {
        return ExitCode::FAILURE;
    };

    let mut sink = match open_sink(&config.output, reader.config()).await {
        Ok(sink) => sink,
        Err(e) => {
            error!("Failed to create {}: {}", config.output, e);
            return ExitCode::FAILURE;
        }
    };

    let options = WriteOptions {
        tile_size: config.tile_size,
        levels: config.levels,
        compression,
        force_bigtiff: false,
    };

    match write(
        source.array(),
        &Selection::all(),
        source.metadata(),
        sink.as_mut(),
        format,
        &options,
    )
    .await
    {
        Ok(summary) => {
            let stats = source.cache_stats().await;
            info!(
                fetches = stats.fetches,
                hits = stats.hits,
                "chunk cache"
            );
            println!(
                "Wrote {} ({}): {} pages, {} reduced levels, {} bytes{}",
                summary.destination,
                summary.format,
                summary.pages,
                summary.levels,
                summary.bytes_written,
                if summary.bigtiff { ", BigTIFF" } else { "" }
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Conversion failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
