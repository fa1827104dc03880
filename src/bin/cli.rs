// MP3fy - Audio Transcode and Tag Engine
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use mp3fy::logging::{init_with_format, LogFormat};
use mp3fy::{AlbumArt, Engine, EngineConfig, MetadataRecord, SessionState};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "mp3fy-cli")]
#[command(about = "MP3fy CLI - Desktop testing tool", long_about = None)]
struct Cli {
    /// Engine configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert an audio file to MP3
    Convert {
        input: PathBuf,
        output: PathBuf,
        /// CBR bitrate in kbps
        #[arg(short, long)]
        bitrate: Option<u32>,
        /// Run on the engine's worker pool and poll for progress
        #[arg(long = "async")]
        run_async: bool,
        /// Do not copy tags and cover art from the input
        #[arg(long)]
        no_tags: bool,
    },
    /// Print every tag of a file
    Metadata {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print duration, bitrate, and tags
    Info { path: PathBuf },
    /// Save the embedded cover art as an image
    Art { path: PathBuf, output: PathBuf },
    /// Rewrite tags into a copy of a file
    Edit {
        input: PathBuf,
        output: PathBuf,
        /// Field to write, as key=value
        #[arg(long = "set", value_name = "KEY=VALUE")]
        fields: Vec<String>,
        /// Cover art image to embed
        #[arg(long)]
        art: Option<PathBuf>,
        /// Check that the audio is unchanged afterwards
        #[arg(long)]
        verify: bool,
    },
}

fn print_progress(pct: i32) {
    print!("\rProgress: {:>3}%", pct);
    let _ = std::io::stdout().flush();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json_logs { LogFormat::Json } else { LogFormat::Pretty };
    init_with_format(format, if cli.verbose { "mp3fy=debug" } else { "mp3fy=warn" });

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Convert {
            input,
            output,
            bitrate,
            run_async,
            no_tags,
        } => {
            if let Some(kbps) = bitrate {
                config.conversion.bitrate_kbps = kbps;
            }
            if no_tags {
                config.conversion.preserve_metadata = false;
                config.conversion.preserve_album_art = false;
            }
            let engine = Engine::new(config)?;

            let handle = engine.try_initialize(&input, &output)?.to_raw();
            if run_async {
                let mut task = engine.submit(handle);
                let result = loop {
                    if let Some(result) = task.try_result() {
                        break result;
                    }
                    print_progress(engine.get_percentage(handle));
                    std::thread::sleep(Duration::from_millis(100));
                };
                print_progress(engine.get_percentage(handle));
                println!();
                result?;
            } else {
                engine.try_convert_with_progress(handle, Arc::new(print_progress))?;
                println!();
            }

            let status = engine
                .session_status(handle)
                .ok_or_else(|| anyhow!("session {} vanished", handle))?;
            if status.state != SessionState::Succeeded {
                bail!("conversion ended {}", status.state);
            }
            println!("{}", status.display_string());
            engine.release(handle);
        }
        Commands::Metadata { path, json } => {
            let engine = Engine::new(config)?;
            let record = engine.try_read_metadata(&path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record.fields)?);
            } else {
                for (key, value) in &record.fields {
                    println!("{:>16}: {}", key, value);
                }
                if let Some(art) = &record.album_art {
                    println!("{:>16}: {}x{} {:?}", "album art", art.width, art.height, art.encoding);
                }
            }
        }
        Commands::Info { path } => {
            let engine = Engine::new(config)?;
            let info = engine.try_read_info(&path)?;
            println!("Duration: {:.3} s", info.duration_micros as f64 / 1_000_000.0);
            println!("Bitrate:  {} bps", info.bitrate_bps);
            println!("Rate:     {} Hz, {} ch", info.sample_rate, info.channels);
            for (key, value) in &info.metadata.fields {
                println!("{:>16}: {}", key, value);
            }
        }
        Commands::Art { path, output } => {
            let engine = Engine::new(config)?;
            let art = engine
                .get_album_art(&path)
                .ok_or_else(|| anyhow!("{} has no readable cover art", path.display()))?;
            let image = image::RgbaImage::from_raw(art.width, art.height, art.pixels)
                .ok_or_else(|| anyhow!("cover art buffer does not match its size"))?;
            image
                .save(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Saved {}x{} cover to {}", art.width, art.height, output.display());
        }
        Commands::Edit {
            input,
            output,
            fields,
            art,
            verify,
        } => {
            let engine = Engine::new(config)?;
            let mut record = MetadataRecord::new();
            for field in &fields {
                let (key, value) = field
                    .split_once('=')
                    .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{}'", field))?;
                record.set(key, value);
            }
            if let Some(art_path) = art {
                let bytes = std::fs::read(&art_path)
                    .with_context(|| format!("reading {}", art_path.display()))?;
                record.album_art = Some(AlbumArt::from_encoded(bytes)?);
            }

            let dropped = if verify {
                engine.try_edit_metadata_verified(&input, &record, &output)?
            } else {
                engine.try_edit_metadata(&input, &record, &output)?
            };
            for key in dropped {
                eprintln!("warning: '{}' cannot be stored in {}", key, output.display());
            }
            println!("Wrote {} field(s) to {}", record.fields.len(), output.display());
        }
    }

    Ok(())
}
