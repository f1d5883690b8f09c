//! # Lamprey
//!
//! A minimal command-line BitTorrent leecher written in Rust.
//!
//! ## Features
//!
//! - Single-file torrent downloads over the peer wire protocol
//! - Multi-peer concurrent downloading with per-piece SHA-1 verification
//! - Basic multitracker support (BEP 12 announce-list)
//! - Progress tracking with a visual progress bar
//!
//! ## Usage
//!
//! ```bash
//! lamprey <torrent_file>
//! lamprey <torrent_file> -o <output_file>
//! ```
//!
//! ## Architecture
//!
//! - **Main thread**: parses arguments, loads the torrent, collects and
//!   assembles downloaded pieces
//! - **Worker threads**: one per peer, each owning its peer session
//! - **Channels**: a bounded work queue and a result queue between them

#[macro_use]
extern crate log;

mod client;
mod handshake;
mod message;
mod peer;
mod piece;
mod torrent;
mod worker;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::Parser;
use torrent::*;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A minimal command-line BitTorrent leecher, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    torrent: String,

    /// Output filename (defaults to name from torrent)
    #[arg(short = 'o', long)]
    output: Option<String>,
}

/// Sanitize a filename so a hostile metainfo cannot escape the working
/// directory.
fn sanitize_filename(filename: &str) -> String {
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}

fn run(args: Args) -> Result<()> {
    let torrent_path = &args.torrent;

    if !Path::new(torrent_path).exists() {
        return Err(anyhow!("could not find torrent file: {}", torrent_path));
    }

    // Load the torrent: metainfo parsing plus tracker announce
    let mut torrent = Torrent::new();
    torrent.open(PathBuf::from(torrent_path))?;

    let default_filename = sanitize_filename(torrent.name());
    let output_filename = args.output.as_deref().unwrap_or(&default_filename);
    let output_filepath = PathBuf::from(output_filename);

    if output_filepath.exists() {
        println!("Output file '{}' already exists.", output_filename);
        print!("Do you want to overwrite it? (y/N): ");
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let input = input.trim().to_lowercase();

        if input != "y" && input != "yes" {
            println!("Download cancelled.");
            return Ok(());
        }
    }

    let mut output_file = match File::create(&output_filepath) {
        Ok(file) => file,
        Err(e) => {
            return Err(anyhow!(
                "could not create output file '{}': {}",
                output_filename,
                e
            ))
        }
    };

    let data: Vec<u8> = torrent.download()?;

    if let Err(e) = output_file.write_all(&data) {
        return Err(anyhow!(
            "could not write data to file '{}': {}",
            output_filename,
            e
        ));
    }

    println!("Saved in \"{}\".", output_filename);

    Ok(())
}

fn main() {
    pretty_env_logger::init_timed();

    let args = Args::parse();

    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }

    std::process::exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_path_separators() {
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename("a\\b"), "a_b");
        assert_eq!(sanitize_filename("plain.iso"), "plain.iso");
    }

    #[test]
    fn sanitize_defaults_empty_names() {
        assert_eq!(sanitize_filename(""), "download");
        assert_eq!(sanitize_filename("   "), "download");
    }
}
