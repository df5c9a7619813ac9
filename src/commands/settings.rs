//! `settings`: print the resolved site settings

use anyhow::{Context as AnyhowContext, Result};

use crate::Context;
use crate::ui;

pub fn run(ctx: &Context) -> Result<()> {
    if !ctx.quiet {
        match &ctx.settings_path {
            Some(path) => ui::info(&format!("Settings from {}", path.display())),
            None => ui::info("No settings file, using built-in defaults"),
        }
        println!();
    }
    let rendered =
        toml::to_string_pretty(&ctx.settings).context("Failed to serialize settings")?;
    print!("{rendered}");
    Ok(())
}
