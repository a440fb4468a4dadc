use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::Context;
use commissioning::SessionOptions;
use serde::Deserialize;
use shared::domain::{PumpColor, RegionCode};

pub const CONFIG_FILE: &str = "pump_setup.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub pump_id: Option<String>,
    pub region_code: String,
    pub pump_color: String,
    pub exchange_timeout_ms: u64,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pump_id: None,
            region_code: RegionCode::ALL[0].code().into(),
            pump_color: PumpColor::default().as_str().into(),
            exchange_timeout_ms: 10_000,
            log_filter: "info".into(),
        }
    }
}

impl Settings {
    pub fn region(&self) -> anyhow::Result<RegionCode> {
        self.region_code
            .parse()
            .with_context(|| format!("invalid region code '{}'", self.region_code))
    }

    pub fn color(&self) -> anyhow::Result<PumpColor> {
        self.pump_color
            .parse()
            .with_context(|| format!("invalid pump color '{}'", self.pump_color))
    }

    pub fn session_options(&self) -> anyhow::Result<SessionOptions> {
        Ok(SessionOptions {
            exchange_timeout: Duration::from_millis(self.exchange_timeout_ms.max(1)),
            pump_color: self.color()?,
            ..SessionOptions::default()
        })
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    apply_file(&mut settings, Path::new(CONFIG_FILE));
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut Settings, path: &Path) {
    let Ok(raw) = fs::read_to_string(path) else {
        return;
    };
    let Ok(file_cfg) = toml::from_str::<HashMap<String, toml::Value>>(&raw) else {
        return;
    };

    if let Some(v) = file_cfg.get("pump_id").and_then(toml::Value::as_str) {
        settings.pump_id = Some(v.to_string());
    }
    if let Some(v) = file_cfg.get("region").and_then(toml::Value::as_str) {
        settings.region_code = v.to_string();
    }
    if let Some(v) = file_cfg.get("color").and_then(toml::Value::as_str) {
        settings.pump_color = v.to_string();
    }
    if let Some(v) = file_cfg
        .get("exchange_timeout_ms")
        .and_then(toml::Value::as_integer)
        .and_then(|v| u64::try_from(v).ok())
    {
        settings.exchange_timeout_ms = v;
    }
    if let Some(v) = file_cfg.get("log_filter").and_then(toml::Value::as_str) {
        settings.log_filter = v.to_string();
    }
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("PUMP_ID") {
        settings.pump_id = Some(v);
    }
    if let Some(v) = var("APP__PUMP_ID") {
        settings.pump_id = Some(v);
    }

    if let Some(v) = var("PUMP_REGION") {
        settings.region_code = v;
    }
    if let Some(v) = var("APP__PUMP_REGION") {
        settings.region_code = v;
    }

    if let Some(v) = var("PUMP_COLOR") {
        settings.pump_color = v;
    }
    if let Some(v) = var("APP__PUMP_COLOR") {
        settings.pump_color = v;
    }

    if let Some(v) = var("APP__EXCHANGE_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.exchange_timeout_ms = parsed;
        }
    }

    if let Some(v) = var("APP__LOG_FILTER") {
        settings.log_filter = v;
    }
}
