// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

mod config;
mod discover;

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mm_kms::{
    drm::DirectLauncher, Device, DpmsState, GammaRamp, Kms, KmsFeedback, KmsUpdate, PlaneType,
    Transform,
};
use tracing::{debug, info, warn};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Parser)]
#[command(name = "mmkmsctl")]
#[command(about = "Inspect and configure DRM display devices", long_about = None)]
struct Cli {
    /// The path to a config file. By default, /etc/magic-mirror/mmkmsctl.toml is used (if present).
    #[arg(short = 'C', long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Additionally write a full trace log to a file.
    #[arg(long, value_name = "FILE")]
    trace_log: Option<PathBuf>,
    /// The DRM node to open. May be specified multiple times. Overrides the
    /// configured devices.
    #[arg(short, long = "device", value_name = "PATH")]
    devices: Vec<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the connectors, CRTCs and planes of every device. This is the
    /// default.
    Info,
    /// Set the power saving mode of every connector.
    Dpms {
        #[arg(value_enum)]
        state: PowerState,
    },
    /// Write a power-law gamma ramp to every active CRTC.
    Gamma {
        /// The exponent of the curve. Defaults to the configured value.
        exponent: Option<f64>,
    },
    /// Set the underscan borders of a connector.
    Underscan {
        /// The connector name, for example HDMI-1.
        connector: String,
        #[arg(required_unless_present = "off")]
        hborder: Option<u64>,
        #[arg(required_unless_present = "off")]
        vborder: Option<u64>,
        /// Disable underscan instead.
        #[arg(long, conflicts_with_all = ["hborder", "vborder"])]
        off: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PowerState {
    On,
    Standby,
    Suspend,
    Off,
}

impl From<PowerState> for DpmsState {
    fn from(state: PowerState) -> Self {
        match state {
            PowerState::On => DpmsState::On,
            PowerState::Standby => DpmsState::Standby,
            PowerState::Suspend => DpmsState::Suspend,
            PowerState::Off => DpmsState::Off,
        }
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    init_logging(args.trace_log.as_ref())?;
    debug!(version = env!("CARGO_PKG_VERSION"), "starting up");

    // Load config.
    let mut cfg = config::Config::new(args.config.as_ref()).context("failed to read config")?;

    // Override with command line flags.
    if !args.devices.is_empty() {
        cfg.devices.paths = args.devices.clone();
    }

    let paths = if cfg.devices.paths.is_empty() {
        discover::card_nodes()?
    } else {
        cfg.devices.paths.clone()
    };

    if paths.is_empty() {
        bail!("no DRM devices found");
    }

    let mut kms = Kms::new(Box::new(DirectLauncher), (&cfg.kms).into())
        .context("failed to initialize KMS")?;

    for path in &paths {
        let flags = discover::device_flags(path);
        let id = kms
            .create_device(path, flags)
            .context(format!("failed to open {}", path.display()))?;

        debug!(%id, path = %path.display(), ?flags, "opened device");
    }

    match args.command.unwrap_or(Command::Info) {
        Command::Info => {
            for device in kms.devices() {
                print_device(device);
            }

            Ok(())
        }
        Command::Dpms { state } => report(kms.set_power_save(state.into())),
        Command::Gamma { exponent } => {
            let exponent = exponent.unwrap_or(cfg.gamma.default_exponent);
            config::validate_exponent(exponent)?;
            set_gamma(&mut kms, exponent)
        }
        Command::Underscan {
            connector,
            hborder,
            vborder,
            off,
        } => {
            let borders = if off {
                None
            } else {
                Some((hborder.unwrap_or_default(), vborder.unwrap_or_default()))
            };

            set_underscan(&mut kms, &connector, borders)
        }
    }
}

fn set_gamma(kms: &mut Kms, exponent: f64) -> Result<()> {
    let mut update = KmsUpdate::new();
    for device in kms.devices() {
        for crtc in device.crtcs() {
            let state = crtc.current_state();
            let size = state.gamma.size();
            if state.drm_mode.is_none() || size == 0 {
                continue;
            }

            debug!(crtc_id = crtc.id(), size, exponent, "setting gamma");
            crtc.set_gamma(&mut update, GammaRamp::from_exponent(size, exponent));
        }
    }

    if update.is_empty() {
        warn!("no active CRTCs");
        return Ok(());
    }

    report(kms.post_update_sync(update))
}

fn set_underscan(kms: &mut Kms, name: &str, borders: Option<(u64, u64)>) -> Result<()> {
    let Some(connector) = kms
        .devices()
        .iter()
        .find_map(|dev| dev.connector_by_name(name))
        .cloned()
    else {
        bail!("connector {:?} not found", name);
    };

    if !connector.supports_underscanning() {
        bail!("connector {} does not support underscan", name);
    }

    let mut update = KmsUpdate::new();
    match borders {
        Some((hborder, vborder)) => connector.set_underscanning(&mut update, hborder, vborder),
        None => connector.unset_underscanning(&mut update),
    }

    report(kms.post_update_sync(update))
}

fn report(feedback: KmsFeedback) -> Result<()> {
    for plane_feedback in feedback.failed_planes() {
        warn!(
            plane_id = ?plane_feedback.plane.id(),
            crtc_id = plane_feedback.crtc.id(),
            err = %plane_feedback.error,
            "plane assignment failed"
        );
    }

    if let Some(err) = feedback.error() {
        return Err(err.clone()).context("KMS update failed");
    }

    info!("update applied");
    Ok(())
}

fn print_device(device: &Device) {
    let caps = device.caps();
    println!("{} ({})", device.id(), device.path().display());
    println!("  flags: {:?}", device.flags());
    if let (Some(w), Some(h)) = (caps.cursor_width, caps.cursor_height) {
        println!("  cursor size: {}x{}", w, h);
    }

    for connector in device.connectors() {
        let Some(state) = connector.current_state() else {
            println!("  connector {} ({}): disconnected", connector.name(), connector.id());
            continue;
        };

        println!(
            "  connector {} ({}): connected, {}x{}mm",
            connector.name(),
            connector.id(),
            state.width_mm,
            state.height_mm
        );

        if let Some(edid) = &state.edid {
            println!("    EDID: {} bytes", edid.len());
        }

        if state.tile_info.group_id != 0 {
            println!("    tile: {:?}", state.tile_info);
        }

        println!(
            "    subpixel: {:?}, orientation: {:?}",
            state.subpixel, state.panel_orientation_transform
        );
        println!(
            "    dpms: {}, underscan: {}",
            connector.supports_dpms(),
            connector.supports_underscanning()
        );

        for mode in &state.modes {
            let preferred = if mode.is_preferred() {
                " (preferred)"
            } else {
                ""
            };

            println!("    mode {}{}", mode, preferred);
        }
    }

    for crtc in device.crtcs() {
        let state = crtc.current_state();
        let mode = match &state.drm_mode {
            Some(mode) => mode.to_string(),
            None => "off".to_string(),
        };

        println!(
            "  crtc {} (index {}): {}, gamma size {}",
            crtc.id(),
            crtc.index(),
            mode,
            state.gamma.size()
        );
    }

    for plane in device.planes() {
        let id = match plane.id() {
            Some(id) => id.to_string(),
            None => "fake".to_string(),
        };

        let formats: Vec<u32> = plane.formats().collect();
        let modifiers: usize = formats
            .iter()
            .filter_map(|f| plane.modifiers_for_format(*f))
            .map(|m| m.len())
            .sum();

        let rotations: Vec<Transform> = Transform::ALL
            .into_iter()
            .filter(|t| *t != Transform::Normal && plane.is_transform_handled(*t))
            .collect();

        println!(
            "  plane {}: {}, crtcs {:#b}, {} formats, {} modifiers, rotations {:?}",
            id,
            plane_type_name(plane.plane_type()),
            plane.possible_crtcs(),
            formats.len(),
            modifiers,
            rotations
        );
    }
}

fn plane_type_name(plane_type: PlaneType) -> &'static str {
    match plane_type {
        PlaneType::Primary => "primary",
        PlaneType::Cursor => "cursor",
        PlaneType::Overlay => "overlay",
    }
}

fn init_logging(trace_log: Option<impl AsRef<Path>>) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    let trace_log = if let Some(path) = trace_log {
        let file = std::fs::File::create(path.as_ref())
            .context(format!("creating {}", path.as_ref().display()))?;
        let trace_filter = EnvFilter::new("mmkmsctl=trace,mm_kms=trace");

        let trace_log = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_filter(trace_filter);

        Some(trace_log)
    } else {
        None
    };

    let printed_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("mmkmsctl=info,mm_kms=info"))?;
    let printed_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(printed_filter);

    tracing_subscriber::registry()
        .with(trace_log)
        .with(printed_log)
        .init();

    Ok(())
}
