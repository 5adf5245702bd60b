//! mkfs command for creating ext2 images

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::info;
use std::io::Write;
use std::path::PathBuf;

use extfs::format_image;

/// Create a single-group ext2 image with 1 KiB blocks
#[derive(Parser, Debug)]
#[command(about = "Create an ext2 image")]
pub struct MkfsArgs {
    /// Image file to create
    pub image: PathBuf,

    /// Size of the image in 1 KiB blocks (at most 8192)
    #[arg(short, long, default_value_t = 1440)]
    pub blocks: u32,

    /// Number of inodes, rounded up to a multiple of 8
    #[arg(short, long, default_value_t = 184)]
    pub inodes: u32,

    /// Overwrite an existing file without confirmation
    #[arg(short, long)]
    pub force: bool,
}

pub async fn run(args: MkfsArgs) -> Result<()> {
    if args.image.is_dir() {
        return Err(anyhow!("{:?} is a directory", args.image));
    }

    if args.image.exists() && !args.force {
        println!("WARNING: {} already exists.", args.image.display());
        println!("This operation will DESTROY ALL DATA in it!");
        print!("Are you sure you want to continue? [y/N] ");
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Operation cancelled.");
            return Ok(());
        }
    }

    info!(
        "Formatting {} with {} blocks and {} inodes...",
        args.image.display(),
        args.blocks,
        args.inodes
    );

    format_image(&args.image, args.blocks, args.inodes)
        .await
        .with_context(|| format!("Failed to format image: {}", args.image.display()))?;

    println!(
        "Created {} ({} KiB, {} inodes)",
        args.image.display(),
        args.blocks,
        (args.inodes + 7) / 8 * 8
    );
    Ok(())
}
