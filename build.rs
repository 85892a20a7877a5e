//! Renders the `muxframe(1)` man page from the clap definition.

use std::{env, fs, path::PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli.rs"]
mod cli;

const MAN_DIR_VAR: &str = "MUXFRAME_MAN_DIR";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=src/cli.rs");
    println!("cargo:rerun-if-env-changed={MAN_DIR_VAR}");

    let out_dir = env::var_os(MAN_DIR_VAR)
        .map_or_else(|| PathBuf::from("target/generated-man"), PathBuf::from);
    fs::create_dir_all(&out_dir)?;

    let cmd = cli::Cli::command();
    let page = format!("{}.1", cmd.get_name());
    let mut buf = Vec::new();
    Man::new(cmd).render(&mut buf)?;
    fs::write(out_dir.join(page), buf)?;
    Ok(())
}
