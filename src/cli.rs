//! Command-line surface. Flags are turned into a [`SessionConfig`] once;
//! nothing downstream looks at them again.

use std::{path::PathBuf, time::Duration};

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};

use crate::{
    pipeline::{
        SessionConfig, SourceIdentity,
        controller::DEFAULT_QUIT_KEY,
        tracking::{SensorOrientation, TrackerConfig},
        views::{View, ViewSet},
    },
    types::Timeout,
};

#[derive(Debug, Parser)]
#[command(name = "depth-view", version, about = "Depth camera viewer and recorder")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Stream from a live device.
    View(SessionArgs),
    /// Replay a recorded capture file.
    Playback {
        /// `.dcap` file written by `record`.
        #[arg(value_name = "PATH")]
        path: PathBuf,
        #[command(flatten)]
        args: SessionArgs,
    },
    /// Stream from a live device and write every capture to `--out`.
    Record(SessionArgs),
}

#[derive(Clone, Debug, Args)]
pub struct SessionArgs {
    /// Index of the live device to open.
    #[arg(long, default_value_t = 0)]
    pub device: u32,
    /// Views to present, comma separated.
    #[arg(
        long = "view",
        value_enum,
        value_delimiter = ',',
        default_values_t = [View::Color, View::Depth]
    )]
    pub views: Vec<View>,
    /// Run body tracking on every capture.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub tracking: bool,
    /// Mounting orientation passed to the body tracker.
    #[arg(long, value_enum, default_value_t = SensorOrientation::Default)]
    pub orientation: SensorOrientation,
    /// Bounded wait for each blocking call; waits forever when omitted.
    #[arg(long = "timeout-ms", value_name = "MS")]
    pub timeout_ms: Option<u64>,
    /// Directory for snapshots and recordings.
    #[arg(long = "out", value_name = "DIR", default_value = "captures")]
    pub out_dir: PathBuf,
    /// Write snapshots every N ticks.
    #[arg(long = "snapshot-every", value_name = "N", default_value_t = 30)]
    pub snapshot_every: u64,
    /// Key that ends the session.
    #[arg(long = "quit-key", default_value_t = DEFAULT_QUIT_KEY)]
    pub quit_key: char,
}

impl TryFrom<Cli> for SessionConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self> {
        let (source, record, args) = match cli.command {
            Command::View(args) => (SourceIdentity::Device(args.device), false, args),
            Command::Playback { path, args } => (SourceIdentity::Playback(path), false, args),
            Command::Record(args) => (SourceIdentity::Device(args.device), true, args),
        };

        let views = ViewSet::new(args.views.iter().copied());
        if views.is_empty() {
            bail!("--view needs at least one view");
        }
        if views.needs_tracking() && !args.tracking {
            let names: Vec<&str> = views
                .iter()
                .filter(|view| view.needs_tracking())
                .map(View::name)
                .collect();
            bail!("--view {} requires --tracking", names.join(","));
        }
        if args.snapshot_every == 0 {
            bail!("--snapshot-every must be at least 1");
        }
        let timeout = match args.timeout_ms {
            None => Timeout::Infinite,
            Some(0) => bail!("--timeout-ms must be positive"),
            Some(ms) => Timeout::Bounded(Duration::from_millis(ms)),
        };
        let tracking = args.tracking.then(|| TrackerConfig {
            orientation: args.orientation,
            ..TrackerConfig::default()
        });

        Ok(Self {
            source,
            record,
            views,
            tracking,
            timeout,
            out_dir: args.out_dir,
            snapshot_every: args.snapshot_every,
            quit_key: args.quit_key,
        })
    }
}
