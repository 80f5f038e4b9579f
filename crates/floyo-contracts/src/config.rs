//! API key and endpoint resolution.
//!
//! Every setting is looked up in the process environment first, then in the
//! `[API]` section of a local INI-style config file, then falls back to a
//! built-in default. The API key has no default. Resolution happens once; the
//! resulting [`Flux2Config`] is never mutated afterwards.

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{Flux2Error, Result};
use crate::variants::Flux2Variant;

pub const DEFAULT_CONFIG_FILE: &str = "config.ini";
pub const CONFIG_PATH_ENV: &str = "FLOYO_CONFIG";
pub const API_KEY_ENV: &str = "BFL_API_KEY";
pub const TIMEOUT_ENV: &str = "BFL_TIMEOUT_SECONDS";
pub const POLL_INTERVAL_ENV: &str = "BFL_POLL_INTERVAL";
pub const REQUEST_TIMEOUT_ENV: &str = "BFL_REQUEST_TIMEOUT";

const CONFIG_SECTION: &str = "api";
const PLACEHOLDER_KEY: &str = "<your_bfl_api_key_here>";
const PLACEHOLDER_MARKER: &str = "your_bfl_api_key";

const DEFAULT_TIMEOUT_S: f64 = 600.0;
const DEFAULT_POLL_INTERVAL_S: f64 = 1.0;
const DEFAULT_REQUEST_TIMEOUT_S: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingSource {
    Environment,
    ConfigFile,
    Default,
}

impl fmt::Display for SettingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Environment => "environment",
            Self::ConfigFile => "config file",
            Self::Default => "default",
        })
    }
}

/// Sections of an INI-style file. Section and key names are stored lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigFile {
    path: Option<PathBuf>,
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl ConfigFile {
    pub fn parse(raw: &str) -> Self {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current: Option<String> = None;
        for raw_line in raw.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line
                .strip_prefix('[')
                .and_then(|rest| rest.strip_suffix(']'))
            {
                let name = name.trim().to_ascii_lowercase();
                sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            let Some(section) = current.as_ref() else {
                continue;
            };
            let split = match (line.find('='), line.find(':')) {
                (Some(eq), Some(colon)) => Some(eq.min(colon)),
                (Some(idx), None) | (None, Some(idx)) => Some(idx),
                (None, None) => None,
            };
            let Some(idx) = split else { continue };
            let key = line[..idx].trim().to_ascii_lowercase();
            if key.is_empty() {
                continue;
            }
            let value = line[idx + 1..].trim().to_string();
            sections
                .entry(section.clone())
                .or_default()
                .insert(key, value);
        }
        Self {
            path: None,
            sections,
        }
    }

    /// Reads `path`; a missing or unreadable file yields an empty config.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let mut parsed = Self::parse(&raw);
                parsed.path = Some(path.to_path_buf());
                parsed
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "config file unreadable; ignoring it");
                Self::default()
            }
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Non-blank value for `key` in `section`.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(&section.to_ascii_lowercase())?
            .get(&key.to_ascii_lowercase())
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }
}

#[derive(Clone)]
pub struct Flux2Config {
    api_key: Option<String>,
    api_key_source: Option<SettingSource>,
    pro_base_url: (String, SettingSource),
    flex_base_url: (String, SettingSource),
    poll_timeout: (Duration, SettingSource),
    poll_interval: (Duration, SettingSource),
    request_timeout: (Duration, SettingSource),
}

impl Flux2Config {
    /// Resolves every setting from `env`, then `file`, then defaults.
    pub fn resolve<F>(env: F, file: &ConfigFile) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup(&env, file, API_KEY_ENV);
        match &api_key {
            Some((_, source)) => info!(%source, "{API_KEY_ENV} loaded"),
            None => warn!(
                "no {API_KEY_ENV} found; set it in {DEFAULT_CONFIG_FILE} or as an environment variable"
            ),
        }
        if let Some((key, _)) = &api_key {
            if is_placeholder_key(key) {
                warn!(
                    "{API_KEY_ENV} is still the placeholder value; replace it with a real key from https://api.bfl.ai"
                );
            }
        }

        let base_url = |variant: Flux2Variant| {
            let (value, source) = lookup(&env, file, variant.base_url_env())
                .map(|(value, source)| (value.trim_end_matches('/').to_string(), source))
                .unwrap_or_else(|| {
                    (
                        variant.default_base_url().to_string(),
                        SettingSource::Default,
                    )
                });
            info!(variant = %variant, url = %value, %source, "FLUX.2 endpoint resolved");
            (value, source)
        };
        let pro_base_url = base_url(Flux2Variant::Pro);
        let flex_base_url = base_url(Flux2Variant::Flex);

        Self {
            api_key_source: api_key.as_ref().map(|(_, source)| *source),
            api_key: api_key.map(|(value, _)| value),
            pro_base_url,
            flex_base_url,
            poll_timeout: lookup_seconds(&env, file, TIMEOUT_ENV, DEFAULT_TIMEOUT_S),
            poll_interval: lookup_seconds(&env, file, POLL_INTERVAL_ENV, DEFAULT_POLL_INTERVAL_S),
            request_timeout: lookup_seconds(
                &env,
                file,
                REQUEST_TIMEOUT_ENV,
                DEFAULT_REQUEST_TIMEOUT_S,
            ),
        }
    }

    /// Resolves from the process environment and the config file at
    /// `config_path`, `$FLOYO_CONFIG`, or `./config.ini`, in that order.
    pub fn from_process_env(config_path: Option<&Path>) -> Self {
        let path = config_path
            .map(Path::to_path_buf)
            .or_else(|| non_empty_env(CONFIG_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        let file = ConfigFile::load(&path);
        Self::resolve(non_empty_env, &file)
    }

    /// Default endpoints and timings with an explicitly supplied key.
    pub fn with_api_key(api_key: Option<String>) -> Self {
        let key = api_key.filter(|value| !value.trim().is_empty());
        Self::resolve(
            move |name| {
                if name == API_KEY_ENV {
                    key.clone()
                } else {
                    None
                }
            },
            &ConfigFile::default(),
        )
    }

    /// The configured key; a missing key is a configuration error.
    pub fn api_key(&self) -> Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            Flux2Error::Config(format!(
                "{API_KEY_ENV} is not set. Define it in {DEFAULT_CONFIG_FILE} or export {API_KEY_ENV}."
            ))
        })
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn has_placeholder_key(&self) -> bool {
        self.api_key.as_deref().map(is_placeholder_key).unwrap_or(false)
    }

    pub fn base_url(&self, variant: Flux2Variant) -> &str {
        match variant {
            Flux2Variant::Pro => &self.pro_base_url.0,
            Flux2Variant::Flex => &self.flex_base_url.0,
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout.0
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval.0
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout.0
    }

    /// Resolved values and where each came from, with the key masked.
    pub fn describe(&self) -> Value {
        json!({
            "api_key": {
                "value": self.api_key.as_deref().map(mask_secret),
                "source": self.api_key_source,
                "placeholder": self.has_placeholder_key(),
            },
            "pro_base_url": {"value": self.pro_base_url.0, "source": self.pro_base_url.1},
            "flex_base_url": {"value": self.flex_base_url.0, "source": self.flex_base_url.1},
            "timeout_seconds": {"value": self.poll_timeout.0.as_secs_f64(), "source": self.poll_timeout.1},
            "poll_interval_seconds": {"value": self.poll_interval.0.as_secs_f64(), "source": self.poll_interval.1},
            "request_timeout_seconds": {"value": self.request_timeout.0.as_secs_f64(), "source": self.request_timeout.1},
        })
    }
}

impl fmt::Debug for Flux2Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flux2Config")
            .field("api_key", &self.api_key.as_deref().map(mask_secret))
            .field("pro_base_url", &self.pro_base_url.0)
            .field("flex_base_url", &self.flex_base_url.0)
            .field("poll_timeout", &self.poll_timeout.0)
            .field("poll_interval", &self.poll_interval.0)
            .field("request_timeout", &self.request_timeout.0)
            .finish()
    }
}

pub fn is_placeholder_key(key: &str) -> bool {
    let trimmed = key.trim();
    trimmed == PLACEHOLDER_KEY
        || trimmed
            .to_ascii_lowercase()
            .contains(PLACEHOLDER_MARKER)
}

pub fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 8 {
        return "****".to_string();
    }
    format!("{visible}****")
}

fn lookup<F>(env: &F, file: &ConfigFile, key: &str) -> Option<(String, SettingSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = env(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        return Some((value, SettingSource::Environment));
    }
    file.get(CONFIG_SECTION, key)
        .map(|value| (value.to_string(), SettingSource::ConfigFile))
}

fn lookup_seconds<F>(
    env: &F,
    file: &ConfigFile,
    key: &str,
    default: f64,
) -> (Duration, SettingSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some((raw, source)) = lookup(env, file, key) {
        match raw.parse::<f64>() {
            Ok(seconds) if seconds.is_finite() && seconds > 0.0 => {
                return (Duration::from_secs_f64(seconds), source);
            }
            _ => warn!(%key, value = %raw, %source, "expected a positive number of seconds; using {default}"),
        }
    }
    (Duration::from_secs_f64(default), SettingSource::Default)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::{ConfigFile, Flux2Config, SettingSource};
    use crate::error::Flux2Error;
    use crate::variants::Flux2Variant;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn parses_sections_comments_and_separators() {
        let file = ConfigFile::parse(
            "# leading comment\nstray = ignored\n[API]\nBFL_API_KEY = abc123\n; note\nBFL_BASE_URL: https://example.test/v1/pro\nEMPTY =\n[other]\nkey=value\n",
        );
        assert_eq!(file.get("api", "bfl_api_key"), Some("abc123"));
        assert_eq!(
            file.get("API", "BFL_BASE_URL"),
            Some("https://example.test/v1/pro")
        );
        assert_eq!(file.get("api", "EMPTY"), None);
        assert_eq!(file.get("api", "stray"), None);
        assert_eq!(file.get("other", "key"), Some("value"));
    }

    #[test]
    fn environment_wins_over_file_and_file_over_default() {
        let file = ConfigFile::parse(
            "[API]\nBFL_API_KEY = from-file\nBFL_BASE_URL = https://file.test/pro/\n",
        );
        let config = Flux2Config::resolve(
            env_from(&[("BFL_API_KEY", "from-env"), ("BFL_FLEX_BASE_URL", "  ")]),
            &file,
        );
        assert_eq!(config.api_key().ok(), Some("from-env"));
        assert_eq!(config.base_url(Flux2Variant::Pro), "https://file.test/pro");
        assert_eq!(
            config.base_url(Flux2Variant::Flex),
            "https://api.bfl.ai/v1/flux-2-flex"
        );
        let described = config.describe();
        assert_eq!(described["api_key"]["source"], "environment");
        assert_eq!(described["pro_base_url"]["source"], "config_file");
        assert_eq!(described["flex_base_url"]["source"], "default");
    }

    #[test]
    fn missing_key_fails_only_when_requested() {
        let config = Flux2Config::resolve(env_from(&[]), &ConfigFile::default());
        assert!(!config.has_api_key());
        assert!(matches!(config.api_key(), Err(Flux2Error::Config(_))));
        assert_eq!(
            config.base_url(Flux2Variant::Pro),
            "https://api.bfl.ai/v1/flux-2-pro"
        );
    }

    #[test]
    fn placeholder_key_is_detected_but_kept() {
        let config = Flux2Config::with_api_key(Some("<your_bfl_api_key_here>".to_string()));
        assert!(config.has_placeholder_key());
        assert_eq!(config.api_key().ok(), Some("<your_bfl_api_key_here>"));

        let other = Flux2Config::with_api_key(Some("YOUR_BFL_API_KEY".to_string()));
        assert!(other.has_placeholder_key());

        let real = Flux2Config::with_api_key(Some("bfl-live-key-0001".to_string()));
        assert!(!real.has_placeholder_key());
    }

    #[test]
    fn timing_settings_parse_and_fall_back() {
        let file = ConfigFile::parse("[api]\nBFL_TIMEOUT_SECONDS = 120\nBFL_POLL_INTERVAL = fast\n");
        let config = Flux2Config::resolve(env_from(&[("BFL_REQUEST_TIMEOUT", "12.5")]), &file);
        assert_eq!(config.poll_timeout(), Duration::from_secs(120));
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.request_timeout(), Duration::from_secs_f64(12.5));
        assert_eq!(config.describe()["poll_interval_seconds"]["source"], "default");
    }

    #[test]
    fn load_reads_file_and_tolerates_missing_one() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.ini");
        std::fs::write(&path, "[API]\nBFL_API_KEY = disk-key-12345\n")?;
        let file = ConfigFile::load(&path);
        assert_eq!(file.path(), Some(path.as_path()));
        assert_eq!(file.get("api", "BFL_API_KEY"), Some("disk-key-12345"));

        let missing = ConfigFile::load(&temp.path().join("absent.ini"));
        assert_eq!(missing, ConfigFile::default());
        Ok(())
    }

    #[test]
    fn debug_output_masks_key() {
        let config = Flux2Config::with_api_key(Some("secret-key-value".to_string()));
        let text = format!("{config:?}");
        assert!(text.contains("secr****"));
        assert!(!text.contains("secret-key-value"));
        assert_eq!(
            config.describe()["api_key"]["source"],
            serde_json::to_value(SettingSource::Environment).unwrap_or_default()
        );
    }
}
