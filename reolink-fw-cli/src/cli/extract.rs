use crate::input;
use anyhow::{Context, Result};
use clap::Args;
use reolink_fw_core::Firmware;
use std::path::PathBuf;
use tracing::info;

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Don't use the on-disk cache for remote files (URLs)
    #[arg(long)]
    no_cache: bool,
    /// Destination directory. Default: current directory
    #[arg(short = 'd', long)]
    dest: Option<PathBuf>,
    /// Overwrite existing files. Does not apply to UBIFS.
    #[arg(short = 'f', long)]
    force: bool,
    /// URL or on-disk file
    file_or_url: String,
}

impl ExtractArgs {
    pub fn run(self) -> Result<()> {
        let resolved = input::resolve(&self.file_or_url, !self.no_cache)?;
        let dest_root = input::cwd_or(self.dest)?;

        for pak in &resolved {
            let fw = Firmware::open(pak.source.clone())
                .context("opening PAK for extraction")?;
            let sha256 = fw.sha256()?.to_string();
            let name = input::dest_dir_name(pak, &sha256);
            let dest = dest_root.join(&name);
            info!(dest = %dest.display(), "extracting PAK");
            fw.extract(&dest, self.force)?;
        }
        Ok(())
    }
}
