//! Build script.
//!
//! Use `cargo xtask` to execute.

use anyhow::Context;
use clap::Parser;
use devx_cmd::cmd;
use flate2::{write::GzEncoder, Compression};
use std::{
    env, fs,
    io::Write,
    path::{Path, PathBuf},
};

/// Build the nasups firmware image.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Build without LTO for debugging.
    #[arg(short, long)]
    devrel: bool,

    /// Disable the hardware watchdog.
    #[arg(long)]
    no_watchdog: bool,
}

fn project_root() -> PathBuf {
    Path::new(&env!("CARGO_MANIFEST_DIR")).ancestors().nth(1).unwrap().to_path_buf()
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let profile = if args.devrel { "devrel" } else { "release" };
    let firmware_dir = project_root().join("nasups-firmware");
    let image_dir = project_root().join("image");

    fs::create_dir_all(&image_dir)?;

    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());

    let mut build = cmd!(&cargo, "build", "--profile", profile);
    build.current_dir(&firmware_dir);
    if args.no_watchdog {
        build.env("DISABLE_WATCHDOG", "1");
    }
    build.run()?;

    let bin = image_dir.join("nasups.bin");
    let mut objcopy = cmd!(&cargo, "objcopy", "--profile", profile, "--", "-O", "binary", &bin);
    objcopy.current_dir(&firmware_dir);
    if args.no_watchdog {
        objcopy.env("DISABLE_WATCHDOG", "1");
    }
    objcopy.run()?;

    let crc = crc32fast::hash(&fs::read(&bin)?);
    let final_bin = image_dir.join(format!("nasups_{crc:08x}.bin"));
    fs::rename(&bin, &final_bin)?;

    // Keep the ELF next to the image for decoding the defmt log.
    let elf = firmware_dir.join("target").join("thumbv6m-none-eabi").join(profile).join("nasups-firmware");
    let elf_data = fs::read(&elf).with_context(|| format!("cannot read {}", elf.display()))?;
    let elf_gz = fs::File::create(image_dir.join(format!("nasups_{crc:08x}.elf.gz")))?;
    let mut gz = GzEncoder::new(elf_gz, Compression::best());
    gz.write_all(&elf_data)?;
    gz.finish()?;

    println!();
    println!(
        "Built {}firmware image/nasups_{crc:08x}.bin{}",
        if args.devrel { "debug " } else { "" },
        if args.no_watchdog { " with watchdog disabled" } else { "" }
    );

    Ok(())
}
