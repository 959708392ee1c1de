mod protect;
mod select;

use anyhow::{anyhow, Result};
use clap::builder::FalseyValueParser;
use clap::Parser;
use native_cache::obfuscation::ObfuscationKey;
use native_cache::Platform;
use rayon::prelude::*;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::protect::protect_file;
use crate::select::find_modules;

#[derive(Parser, Debug)]
#[command(author, version, about = "Lumen native module protection tool", long_about = None)]
struct Cli {
    /// Module file, or directory to search for modules
    path: Option<PathBuf>,
    /// Remove each original once its .encrypted artifact is written
    #[arg(long, env = "LUMEN_PROTECT_DELETE_ORIGINAL", value_parser = FalseyValueParser::new())]
    delete_original: bool,
    /// Directory mode: only file names containing this are protected
    #[arg(long, default_value = "lumen")]
    module_substring: String,
    /// Directory mode: platform whose native extensions are selected
    #[arg(long)]
    platform: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let path = cli.path.ok_or_else(|| anyhow!("no input path given"))?;
    if !path.exists() {
        return Err(anyhow!("input not found: {}", path.display()));
    }
    let platform = match cli.platform.as_deref() {
        Some(name) => Platform::from_os_name(name)?,
        None => Platform::current()?,
    };

    let targets = if path.is_dir() {
        find_modules(&path, &cli.module_substring, platform)?
    } else {
        vec![path]
    };
    if targets.is_empty() {
        info!("no native modules selected");
        return Ok(());
    }

    let key = ObfuscationKey::builtin();
    let results: Vec<_> = targets
        .par_iter()
        .map(|target| (target, protect_file(target, &key, cli.delete_original)))
        .collect();

    let mut failed = 0usize;
    for (target, result) in results {
        match result {
            Ok(artifact) => println!("{}", artifact.display()),
            Err(e) => {
                eprintln!("{}: {e:#}", target.display());
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(anyhow!(
            "encryption failed for {failed} of {} file(s)",
            targets.len()
        ));
    }
    Ok(())
}
