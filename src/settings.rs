use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "pricepaid.toml";
const ENV_PREFIX: &str = "PRICEPAID";

const DEFAULT_CATALOG_PAGES: [&str; 2] = [
    "https://www.data.gov.uk/dataset/314f77b3-e702-4545-8bcb-9ef8262ea0fd/archived-price-paid-information-residential-property-1995-2017",
    "https://www.gov.uk/government/statistical-data-sets/price-paid-data-downloads",
];

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database_path: PathBuf,
    pub raw_dir: PathBuf,
    pub catalog_pages: Vec<String>,
    pub page_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub busy_timeout_secs: u64,
    pub batch_size: usize,
    pub download_concurrency: usize,
}

impl Settings {
    /// Defaults, then the TOML file at `path` if it exists, then `PRICEPAID_*` env vars.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings: Settings = Self::defaults()?
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("catalog_pages"),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Config::builder()
            .set_default("database_path", "data/housing.sqlite")?
            .set_default("raw_dir", "data/raw")?
            .set_default(
                "catalog_pages",
                DEFAULT_CATALOG_PAGES
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>(),
            )?
            .set_default("page_timeout_secs", 30)?
            .set_default("download_timeout_secs", 600)?
            .set_default("connect_timeout_secs", 30)?
            .set_default("busy_timeout_secs", 30)?
            .set_default("batch_size", 5000)?
            .set_default("download_concurrency", 4)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Message("batch_size must be at least 1".into()));
        }
        if self.download_concurrency == 0 {
            return Err(ConfigError::Message(
                "download_concurrency must be at least 1".into(),
            ));
        }
        let timeouts = [
            ("page_timeout_secs", self.page_timeout_secs),
            ("download_timeout_secs", self.download_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("busy_timeout_secs", self.busy_timeout_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Message(format!("{} must be non-zero", name)));
        }
        Ok(())
    }

    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(s.batch_size, 5000);
        assert_eq!(s.catalog_pages.len(), 2);
        assert_eq!(s.raw_dir, PathBuf::from("data/raw"));
        assert_eq!(s.download_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pricepaid.toml");
        std::fs::write(
            &path,
            "batch_size = 250\nraw_dir = \"/tmp/pp\"\ncatalog_pages = [\"https://example.org/a\"]\n",
        )
        .unwrap();

        let s = Settings::load(&path).unwrap();
        assert_eq!(s.batch_size, 250);
        assert_eq!(s.raw_dir, PathBuf::from("/tmp/pp"));
        assert_eq!(s.catalog_pages, vec!["https://example.org/a".to_string()]);
        assert_eq!(s.download_concurrency, 4);
    }

    #[test]
    fn zero_batch_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pricepaid.toml");
        std::fs::write(&path, "batch_size = 0\n").unwrap();
        assert!(Settings::load(&path).is_err());
    }
}
