//! `sandsmith init`: write the default configuration and create the database.

use std::path::Path;

use anyhow::Result;
use sandsmith::config::{Config, SandsmithToml};
use sandsmith::store::StoreDb;

pub fn cmd_init(project_dir: &Path, force: bool) -> Result<()> {
    let config = Config::load(project_dir.to_path_buf(), false)?;
    config.ensure_directories()?;

    let config_file = config.config_file();
    if config_file.exists() && !force {
        println!(
            "Config already exists at {} (use --force to overwrite)",
            config_file.display()
        );
    } else {
        SandsmithToml::default().save(&config_file)?;
        println!("Wrote {}", config_file.display());
    }

    StoreDb::new(&config.db_path)?;
    println!("Database ready at {}", config.db_path.display());
    Ok(())
}
