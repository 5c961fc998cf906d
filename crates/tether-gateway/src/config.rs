use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use tether_types::config::TetherConfig;

/// Returns the Tether home directory (`$TETHER_HOME`, or `~/.tether/`).
pub fn tether_home() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os("TETHER_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".tether"))
}

/// Returns the path to the config file (`~/.tether/config.toml`).
pub fn config_path() -> Result<PathBuf> {
    Ok(tether_home()?.join("config.toml"))
}

/// Returns the database path (`~/.tether/tether.db`).
pub fn db_path() -> Result<PathBuf> {
    Ok(tether_home()?.join("tether.db"))
}

/// Load config from disk, creating a default file if none exists, then apply
/// environment overrides and make paths absolute.
pub fn load_config() -> Result<TetherConfig> {
    let home = tether_home()?;
    let path = home.join("config.toml");

    let mut config = if path.exists() {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?
    } else {
        std::fs::create_dir_all(&home)
            .with_context(|| format!("Failed to create {}", home.display()))?;
        let default = TetherConfig::default();
        write_config(&path, &default)?;
        default
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    resolve_paths(&mut config, &home);

    std::fs::create_dir_all(&config.workspace.home).with_context(|| {
        format!("Failed to create home workspace {}", config.workspace.home.display())
    })?;
    Ok(config)
}

/// The config as it would be written to disk.
pub fn render_config(config: &TetherConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to serialize config")
}

fn write_config(path: &Path, config: &TetherConfig) -> Result<()> {
    std::fs::write(path, render_config(config)?)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;
    Ok(())
}

/// Secrets and deployment knobs that may come from the environment instead of
/// the config file.
pub fn apply_env_overrides(
    config: &mut TetherConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(token) = lookup("TETHER_TELEGRAM_TOKEN") {
        config.telegram.bot_token = token.trim().to_string();
    }
    if let Some(users) = lookup("TETHER_ALLOWED_USERS") {
        config.telegram.allowed_user_ids = users
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<i64>()
                    .with_context(|| format!("Invalid user id in TETHER_ALLOWED_USERS: {s:?}"))
            })
            .collect::<Result<_>>()?;
    }
    if let Some(model) = lookup("TETHER_MODEL") {
        config.agent.default_model = model.parse().context("Invalid TETHER_MODEL")?;
    }
    if let Some(base) = lookup("TETHER_WORKSPACE_BASE") {
        config.workspace.base = Some(PathBuf::from(base.trim()));
    }
    Ok(())
}

/// Relative workspace paths are taken relative to the Tether home directory.
pub fn resolve_paths(config: &mut TetherConfig, home: &Path) {
    if config.workspace.home.is_relative() {
        config.workspace.home = home.join(&config.workspace.home);
    }
    if let Some(base) = config.workspace.base.as_mut() {
        if base.is_relative() {
            *base = home.join(&*base);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tether_types::model::Model;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_roundtrips() {
        let config = TetherConfig::default();
        let toml_str = render_config(&config).unwrap();
        let parsed: TetherConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.agent.default_model, Model::Sonnet);
        assert_eq!(parsed.agent.timeout_secs, 360);
        assert_eq!(parsed.gateway.edit_interval_ms, 2_000);
        assert!(parsed.workspace.base.is_none());
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let parsed: TetherConfig = toml::from_str(
            r#"
            [telegram]
            bot_token = "123:abc"

            [agent]
            default_model = "opus"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.telegram.bot_token, "123:abc");
        assert!(parsed.telegram.allowed_user_ids.is_empty());
        assert_eq!(parsed.agent.default_model, Model::Opus);
        assert_eq!(parsed.agent.timeout_secs, 360);
        assert_eq!(parsed.agent.executable, PathBuf::from("claude"));
        assert_eq!(parsed.workspace.home, PathBuf::from("workspace"));
        assert_eq!(parsed.gateway.log_level, "info");
        assert_eq!(parsed.validate(), Ok(()));

        let empty: TetherConfig = toml::from_str("").unwrap();
        assert_eq!(empty.gateway.edit_interval_ms, 2_000);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = TetherConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("TETHER_TELEGRAM_TOKEN", " 123:abc "),
                ("TETHER_ALLOWED_USERS", "42, 7,"),
                ("TETHER_MODEL", "Opus"),
                ("TETHER_WORKSPACE_BASE", "/srv/projects"),
            ]),
        )
        .unwrap();
        assert_eq!(config.telegram.bot_token, "123:abc");
        assert_eq!(config.telegram.allowed_user_ids, vec![42, 7]);
        assert_eq!(config.agent.default_model, Model::Opus);
        assert_eq!(config.workspace.base, Some(PathBuf::from("/srv/projects")));
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut config = TetherConfig::default();
        config.telegram.bot_token = "from-file".into();
        apply_env_overrides(&mut config, env(&[("TETHER_TELEGRAM_TOKEN", "  ")])).unwrap();
        assert_eq!(config.telegram.bot_token, "from-file");
    }

    #[test]
    fn bad_env_values_are_errors() {
        let mut config = TetherConfig::default();
        assert!(apply_env_overrides(&mut config, env(&[("TETHER_ALLOWED_USERS", "abc")])).is_err());
        assert!(apply_env_overrides(&mut config, env(&[("TETHER_MODEL", "gpt")])).is_err());
    }

    #[test]
    fn relative_paths_resolve_under_home() {
        let mut config = TetherConfig::default();
        config.workspace.base = Some(PathBuf::from("projects"));
        resolve_paths(&mut config, Path::new("/opt/tether"));
        assert_eq!(config.workspace.home, PathBuf::from("/opt/tether/workspace"));
        assert_eq!(config.workspace.base, Some(PathBuf::from("/opt/tether/projects")));

        config.workspace.home = PathBuf::from("/abs/home");
        resolve_paths(&mut config, Path::new("/opt/tether"));
        assert_eq!(config.workspace.home, PathBuf::from("/abs/home"));
    }
}
