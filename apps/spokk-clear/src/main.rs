//! spokk clear sample
//!
//! Clears the swapchain to a color that cycles over time. The color is
//! written each frame into that frame slot's host-visible uniform buffer,
//! so the sample exercises the whole frames-in-flight path without any
//! pipelines.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p spokk-clear -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--frames-in-flight <N>`: Frames recorded ahead of the GPU, 1 to 3 (default: 2)
//! - `--allocator <dedicated|pooling|managed>`: Device memory policy (default: pooling)
//! - `--shaders <DIR>`: Watch a shader directory and log reloads
//! - `--no-vsync`: Present without waiting for vertical blank
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use std::time::Duration;

use spokk_app::{run_app, AllocatorPolicy, AppConfig};
use spokk_gpu::PoolingAllocatorConfig;

use crate::app::ClearApp;

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;
const SHADER_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let config = parse_args(&args)?;
    run_app::<ClearApp>(config)
}

fn parse_args(args: &[String]) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::new("spokk - clear")
        .with_size(WIDTH, HEIGHT)
        .with_allocator(AllocatorPolicy::Pooling(PoolingAllocatorConfig::default()));

    let mut i = 0;
    while i < args.len() {
        let value = args.get(i + 1);
        match (args[i].as_str(), value) {
            ("--frames-in-flight", Some(v)) => {
                config = config.with_frames_in_flight(v.parse()?);
                i += 1;
            }
            ("--allocator", Some(v)) => {
                let policy = match v.as_str() {
                    "dedicated" => AllocatorPolicy::Dedicated,
                    "pooling" => AllocatorPolicy::Pooling(PoolingAllocatorConfig::default()),
                    "managed" => AllocatorPolicy::Managed,
                    other => anyhow::bail!("unknown allocator '{other}'"),
                };
                config = config.with_allocator(policy);
                i += 1;
            }
            ("--shaders", Some(v)) => {
                config = config.with_shader_watch(v, SHADER_POLL_INTERVAL);
                i += 1;
            }
            ("--no-vsync", _) => config = config.with_vsync(false),
            (other, _) => anyhow::bail!("unrecognized argument '{other}' (see --help)"),
        }
        i += 1;
    }
    Ok(config)
}

fn print_help() {
    eprintln!(
        "spokk clear sample

USAGE:
    cargo run -p spokk-clear -- [OPTIONS]

OPTIONS:
    --frames-in-flight <N>      Frames recorded ahead of the GPU, 1 to 3 (default: 2)
    --allocator <POLICY>        dedicated, pooling or managed (default: pooling)
    --shaders <DIR>             Watch a shader directory and log reloads
    --no-vsync                  Present without waiting for vertical blank
    -h, --help                  Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                    Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn parses_options() {
        let config = parse_args(&args(&[
            "--frames-in-flight",
            "3",
            "--allocator",
            "managed",
            "--shaders",
            "assets/shaders",
            "--no-vsync",
        ]))
        .unwrap();
        assert_eq!(config.frames_in_flight, 3);
        assert!(matches!(config.allocator, AllocatorPolicy::Managed));
        assert_eq!(
            config.shader_dir.as_deref(),
            Some(std::path::Path::new("assets/shaders"))
        );
        assert!(!config.vsync);
    }

    #[test]
    fn defaults_to_pooling() {
        let config = parse_args(&[]).unwrap();
        assert!(matches!(config.allocator, AllocatorPolicy::Pooling(_)));
        assert_eq!(config.frames_in_flight, spokk_gpu::FRAMES_IN_FLIGHT);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_args(&args(&["--allocator", "buddy"])).is_err());
        assert!(parse_args(&args(&["--frames-in-flight", "two"])).is_err());
        assert!(parse_args(&args(&["--fullscreen"])).is_err());
    }
}
