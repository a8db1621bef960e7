//! `cnp config`: effective configuration as TOML plus its validation result

use std::path::Path;

use crate::config::AppConfig;
use crate::error::Result;

pub fn show_config(dir: &Path) -> Result<()> {
    let config = AppConfig::load_from(dir)?;
    println!("# effective configuration (from {})", dir.display());
    println!("{}", render(&config)?);
    Ok(())
}

/// TOML body followed by a validation section
pub fn render(config: &AppConfig) -> Result<String> {
    let mut out = toml::to_string_pretty(config)?;
    out.push('\n');
    match config.validate() {
        Ok(()) => out.push_str("# validation: ok\n"),
        Err(errors) => {
            out.push_str(&format!("# validation: {} problem(s)\n", errors.len()));
            for e in errors {
                out.push_str(&format!("#   - {e}\n"));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_renders_valid() {
        let out = render(&AppConfig::default()).unwrap();
        assert!(out.contains("[award]"));
        assert!(out.contains("tie_epsilon"));
        assert!(out.ends_with("# validation: ok\n"));
    }

    #[test]
    fn invalid_config_lists_problems() {
        let mut config = AppConfig::default();
        config.award.tie_epsilon = 0.0;
        config.coordinator.bidding_window_ms = 0;

        let out = render(&config).unwrap();
        assert!(out.contains("# validation: 2 problem(s)"));
        assert!(out.contains("tie_epsilon"));
        assert!(out.contains("bidding_window_ms"));
    }
}
