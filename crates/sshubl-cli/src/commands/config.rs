//! Config command implementations

use std::path::Path;

use anyhow::{Context, Result};

use crate::output::{print_error, print_info, print_success, print_warning};
use sshubl_core::config;
use sshubl_core::Settings;

/// Show the configuration in effect
pub fn config_show(path: &Path) -> Result<()> {
    if !path.exists() {
        print_warning(&format!("No configuration file found at {}", path.display()));
        print_info("Run 'sshubl config init' to create one, showing defaults");
        println!();
    } else {
        print_info(&format!("Configuration file: {}", path.display()));
        println!();
    }

    let settings = config::load_settings(path)
        .with_context(|| format!("Failed to load config file: {}", path.display()))?;
    let rendered = toml::to_string_pretty(&settings).context("Failed to render configuration")?;
    println!("{}", rendered);

    Ok(())
}

/// Initialize default configuration
pub fn config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        print_error(&format!("Config file already exists: {}", path.display()));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
            print_success(&format!("Created config directory: {}", dir.display()));
        }
    }

    let content = generate_default_config()?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;

    print_success(&format!("Created configuration file: {}", path.display()));
    Ok(())
}

/// Default settings rendered as commented TOML
fn generate_default_config() -> Result<String> {
    let body = toml::to_string_pretty(&Settings::default())
        .context("Failed to render default configuration")?;
    Ok(format!(
        "# sshubl configuration\n\
         #\n\
         # Durations are in seconds. Unset binary paths are searched on PATH.\n\
         # Entries under [ssh_options] are passed to ssh as -o<key>=<value>.\n\n{}",
        body
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_writes_loadable_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        config_init(&path, false).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# sshubl configuration"));
        let settings = config::load_settings(&path).unwrap();
        assert_eq!(settings.reconnect.max_retries, Settings::default().reconnect.max_retries);
    }

    #[test]
    fn test_init_keeps_existing_file_without_force() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "follow_symlinks = false\n").unwrap();

        config_init(&path, false).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "follow_symlinks = false\n"
        );

        config_init(&path, true).unwrap();
        assert!(config::load_settings(&path).unwrap().follow_symlinks);
    }
}
