use std::{fs, path::Path};

use anyhow::{anyhow, Context};
use list_binder::{config::DEFAULT_EVENT_CAPACITY, BinderConfig, Preset};
use serde::Deserialize;
use url::Url;

pub const DEFAULT_CONFIG_PATH: &str = "binder.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub preset: String,
    pub parent_id: String,
    pub link_base_url: Option<String>,
    pub log_filter: String,
    pub event_capacity: usize,
    pub seed_rows: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            preset: Preset::QuoteLineItemsWithFlow.name().into(),
            parent_id: "0Q0000000000001".into(),
            link_base_url: None,
            log_filter: "info".into(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            seed_rows: 3,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    preset: Option<String>,
    parent_id: Option<String>,
    link_base_url: Option<String>,
    log_filter: Option<String>,
    event_capacity: Option<usize>,
    seed_rows: Option<usize>,
}

/// Defaults, then `path` if it exists, then environment overrides.
pub fn load_settings(path: &Path) -> Settings {
    let settings = read_file_settings(path);
    apply_env_overrides(settings, |key| std::env::var(key).ok())
}

fn read_file_settings(path: &Path) -> Settings {
    let mut settings = Settings::default();

    let Ok(raw) = fs::read_to_string(path) else {
        return settings;
    };
    let file_cfg = match toml::from_str::<FileSettings>(&raw) {
        Ok(file_cfg) => file_cfg,
        Err(err) => {
            eprintln!("ignoring unreadable {}: {err}", path.display());
            return settings;
        }
    };

    if let Some(v) = file_cfg.preset {
        settings.preset = v;
    }
    if let Some(v) = file_cfg.parent_id {
        settings.parent_id = v;
    }
    if let Some(v) = file_cfg.link_base_url {
        settings.link_base_url = Some(v);
    }
    if let Some(v) = file_cfg.log_filter {
        settings.log_filter = v;
    }
    if let Some(v) = file_cfg.event_capacity {
        settings.event_capacity = v;
    }
    if let Some(v) = file_cfg.seed_rows {
        settings.seed_rows = v;
    }

    settings
}

fn apply_env_overrides(mut settings: Settings, var: impl Fn(&str) -> Option<String>) -> Settings {
    if let Some(v) = var("BINDER_PRESET") {
        settings.preset = v;
    }
    if let Some(v) = var("APP__PRESET") {
        settings.preset = v;
    }

    if let Some(v) = var("BINDER_PARENT_ID") {
        settings.parent_id = v;
    }
    if let Some(v) = var("APP__PARENT_ID") {
        settings.parent_id = v;
    }

    if let Some(v) = var("APP__LINK_BASE_URL") {
        settings.link_base_url = Some(v);
    }

    if let Some(v) = var("APP__LOG_FILTER") {
        settings.log_filter = v;
    }

    if let Some(v) = var("APP__EVENT_CAPACITY") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.event_capacity = parsed;
        }
    }
    if let Some(v) = var("APP__SEED_ROWS") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.seed_rows = parsed;
        }
    }

    settings
}

impl Settings {
    pub fn binder_config(&self) -> anyhow::Result<BinderConfig> {
        let preset: Preset = self.preset.parse().map_err(|err: String| anyhow!(err))?;
        let mut config = preset.config();
        config.event_capacity = self.event_capacity;

        if let Some(raw) = self.link_base_url.as_deref().filter(|raw| !raw.trim().is_empty()) {
            let base = Url::parse(raw.trim())
                .with_context(|| format!("invalid link_base_url `{raw}`"))?;
            config.projection = config.projection.with_link_base(base);
        }

        Ok(config)
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
