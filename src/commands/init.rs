use anyhow::{bail, Context, Result};
use stackload::config::Config;
use std::path::PathBuf;

pub fn init_config(path: PathBuf, force: bool) -> Result<()> {
    let config_path = path.join("stackload.toml");
    if config_path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        );
    }

    let mut config = Config::default();
    config.source.path = PathBuf::from("dumps");
    let content = format!(
        "# stackload configuration\n# Command line flags override these values.\n\n{}",
        config.to_toml()?
    );

    std::fs::create_dir_all(&path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    std::fs::write(&config_path, content)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    println!("Created configuration at: {}", config_path.display());
    Ok(())
}
