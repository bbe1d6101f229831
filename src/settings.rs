// src/settings.rs

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Parser, Subcommand};
use config::{builder::DefaultState, ConfigBuilder, ConfigError, File};
use directories::ProjectDirs;
use reqwest::Url;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://data.nhm.ac.uk";
const DEFAULT_TIMEOUT_SECS: i64 = 20;
const DEFAULT_PAGE_SIZE: i64 = 100;
const DEFAULT_BUFFER_SIZE: i64 = 10;
const DEFAULT_FAILURE_RATIO: f64 = 0.5;
const DEFAULT_CATALOG_LIMIT: i64 = 10_000;
const DEFAULT_GUESS_FIELDS_SIZE: i64 = 15;
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Parser, Debug)]
#[command(version, about = "Query the data portal's multisearch API")]
pub struct Args {
    /// Path to the local configuration TOML file.
    #[arg(short, value_name = "CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// Raise the log level; repeat for more detail.
    #[arg(short, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stream matching records as JSON lines.
    Search {
        #[command(flatten)]
        query: QueryArgs,

        /// Stop after this many pages.
        #[arg(long, value_name = "N")]
        pages: Option<usize>,
    },
    /// Print the number of matching records.
    Count {
        #[command(flatten)]
        query: QueryArgs,
    },
    /// List the searchable resources in the catalog.
    Resources,
    /// Print the stored query behind a slug.
    Resolve { slug: String },
    /// Create a slug for a query.
    Slug {
        #[command(flatten)]
        query: QueryArgs,

        /// Reserve this slug for the created query.
        #[arg(long, value_name = "NAME")]
        reserve: Option<String>,
    },
    /// List the values of a field, optionally starting with a prefix.
    Autocomplete {
        #[command(flatten)]
        query: QueryArgs,

        #[arg(long)]
        field: String,

        #[arg(long, default_value = "")]
        prefix: String,

        /// Maximum number of values to print.
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Load the images of matching records.
    Images {
        #[command(flatten)]
        query: QueryArgs,

        /// Additional batches to request after the initial load.
        #[arg(long, default_value_t = 0)]
        more: usize,
    },
}

#[derive(clap::Args, Debug, Default)]
pub struct QueryArgs {
    /// Free-text search.
    #[arg(long, value_name = "TEXT")]
    pub text: Option<String>,

    /// Resource to search; repeat for several. All resources when omitted.
    #[arg(long = "resource", value_name = "ID")]
    pub resources: Vec<String>,

    /// Filter tree as the JSON the multisearch action accepts.
    #[arg(long, value_name = "JSON")]
    pub filters: Option<String>,

    /// Start from the query stored under this slug.
    #[arg(long, value_name = "SLUG", conflicts_with_all = ["text", "filters"])]
    pub slug: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalSettings {
    #[serde(deserialize_with = "deserialize_base_url")]
    pub base_url: String,
    pub timeout_secs: u64,
}

impl PortalSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSettings {
    pub page_size: u32,
    pub buffer_size: usize,
    pub autoload_failure_ratio: f64,
    pub autoload_min_sample: usize,
    pub catalog_limit: u32,
    pub guess_fields_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub portal: PortalSettings,
    pub search: SearchSettings,
}

impl Settings {
    /// Load settings from the given TOML file, with sane defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let cfg = Self::builder()?.add_source(File::from(path)).build()?;

        cfg.try_deserialize()
    }

    /// Load settings from `path`, or from the platform config directory when
    /// no path is given. A missing default file leaves the defaults in place.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        let mut builder = Self::builder()?;
        if let Some(default_path) = default_config_path() {
            builder = builder.add_source(File::from(default_path).required(false));
        }
        builder.build()?.try_deserialize()
    }

    /// The built-in defaults, with no file source.
    pub fn defaults() -> Result<Self, ConfigError> {
        Self::builder()?.build()?.try_deserialize()
    }

    fn builder() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        ConfigBuilder::<DefaultState>::default()
            .set_default("portal.base_url", DEFAULT_BASE_URL)?
            .set_default("portal.timeout_secs", DEFAULT_TIMEOUT_SECS)?
            .set_default("search.page_size", DEFAULT_PAGE_SIZE)?
            .set_default("search.buffer_size", DEFAULT_BUFFER_SIZE)?
            .set_default("search.autoload_failure_ratio", DEFAULT_FAILURE_RATIO)?
            .set_default("search.autoload_min_sample", DEFAULT_BUFFER_SIZE)?
            .set_default("search.catalog_limit", DEFAULT_CATALOG_LIMIT)?
            .set_default("search.guess_fields_size", DEFAULT_GUESS_FIELDS_SIZE)
    }
}

fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("uk.ac", "nhm", "portal-search")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

fn deserialize_base_url<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let url = Url::parse(&s).map_err(serde::de::Error::custom)?;
    if url.cannot_be_a_base() {
        return Err(serde::de::Error::custom(format!(
            "`{s}` cannot be used as a base URL"
        )));
    }
    Ok(s.trim_end_matches('/').to_string())
}
