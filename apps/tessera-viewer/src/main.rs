//! Tessera Engine Demo Viewer
//!
//! Clears every swapchain image to an animated color through the full
//! acquire / record / submit / present loop, rebuilding render targets
//! whenever the swapchain is recreated.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p tessera-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--frames-in-flight <N>`: Frames recorded ahead of the GPU (default: 2)
//! - `--fps <N>`: Frame rate cap (default: uncapped)
//! - `--no-vsync`: Present without waiting for vertical blank
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use tessera_app::{run_app, AppConfig};

use crate::app::Viewer;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    run_app::<Viewer>(parse_config(&args)?)
}

fn parse_config(args: &[String]) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::new("Tessera Engine - Viewer").with_size(WIDTH, HEIGHT);

    let mut args = args.iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--frames-in-flight" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--frames-in-flight needs a value"))?;
                config = config.with_frames_in_flight(value.parse()?);
            }
            "--fps" => {
                let value = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--fps needs a value"))?;
                config = config.with_target_fps(value.parse()?);
            }
            "--no-vsync" => config = config.with_vsync(false),
            other => anyhow::bail!("Unknown argument '{other}' (see --help)"),
        }
    }

    Ok(config)
}

fn print_help() {
    eprintln!(
        "Tessera Engine Demo Viewer

USAGE:
    cargo run -p tessera-viewer -- [OPTIONS]

OPTIONS:
    --frames-in-flight <N>  Frames recorded ahead of the GPU, 1 to 3 (default: 2)
    --fps <N>               Frame rate cap (default: uncapped)
    --no-vsync              Present without waiting for vertical blank
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
