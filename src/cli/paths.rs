//! CLI subcommand: `bootstrap-sandbox paths`
//!
//! Prints all resolved XDG-compliant paths for debugging and scripting.

use anyhow::Result;

use crate::config::Config;

pub fn run(config_path: Option<&str>) -> Result<()> {
    let config = Config::load_from(config_path)?;
    let paths = &config.paths;

    println!("bootstrap-sandbox Paths (XDG Base Directory)");
    println!("============================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!();
    match paths.runtime_dir {
        Some(ref dir) => println!("Runtime:    {}", dir.display()),
        None => println!("Runtime:    (not available)"),
    }
    match config.namespace() {
        Ok(namespace) => match namespace.dir() {
            Some(dir) => println!("  namespace:      {}", dir.display()),
            None => println!("  namespace:      (abstract)"),
        },
        Err(e) => println!("  namespace:      ({})", e),
    }

    Ok(())
}
