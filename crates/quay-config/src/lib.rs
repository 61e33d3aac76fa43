//! Configuration loading for quay services.
//!
//! Services in the fleet share one INI configuration file. This crate loads
//! it, parses the common command line flags, and provides the typed handles
//! (`Config`, `ServiceName`, `Options`) that the rest of the core reads out
//! of the request context.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use ini::Ini;
use thiserror::Error;

use quay_core::Context;

/// Paths searched for the configuration file, in order.
const CONFIG_PATHS: &[&str] = &["config.ini", "../config.ini", "/etc/sr.ht/config.ini"];

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config.ini found (searched {0})")]
    NotFound(String),

    #[error("failed to parse config file: {0}")]
    Parse(String),

    #[error("expected [{section}] {key} in config")]
    MissingKey { section: String, key: String },
}

/// Command line options common to every quay service daemon.
#[derive(Debug, Clone, Parser)]
pub struct Options {
    /// Address to bind the GraphQL server to.
    #[arg(short = 'b')]
    pub addr: Option<String>,

    /// Enable debug mode: serves the playground and prints errors instead of
    /// emailing them.
    #[arg(short = 'd', default_value_t = false)]
    pub debug: bool,
}

impl Options {
    /// Parse options from the process arguments, falling back to
    /// `default_addr` when `-b` is not given.
    #[must_use]
    pub fn parse_or_default(default_addr: &str) -> Self {
        let mut opts = Options::parse();
        if opts.addr.is_none() {
            opts.addr = Some(default_addr.to_string());
        }
        opts
    }

    /// The effective bind address.
    #[must_use]
    pub fn bind_addr(&self) -> &str {
        self.addr.as_deref().unwrap_or("127.0.0.1:8080")
    }
}

/// The loaded INI configuration.
#[derive(Debug, Clone)]
pub struct Config {
    ini: Ini,
}

impl Config {
    /// Load the configuration from the standard search paths.
    pub fn load() -> Result<Self, ConfigError> {
        for path in CONFIG_PATHS {
            if Path::new(path).exists() {
                let ini = Ini::load_from_file(path)
                    .map_err(|e| ConfigError::Parse(format!("{path}: {e}")))?;
                return Ok(Self { ini });
            }
        }
        Err(ConfigError::NotFound(CONFIG_PATHS.join(", ")))
    }

    /// Parse configuration from a string. Used by tests and tooling.
    pub fn from_ini(source: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(Self { ini })
    }

    /// Look up `key` in `[section]`.
    #[must_use]
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.ini.get_from(Some(section), key)
    }

    /// Look up `key` in `[section]`, with a fallback value.
    #[must_use]
    pub fn get_or<'a>(&'a self, section: &str, key: &str, fallback: &'a str) -> &'a str {
        self.get(section, key).unwrap_or(fallback)
    }

    /// Look up `key` in `[section]`, erroring when absent.
    pub fn require(&self, section: &str, key: &str) -> Result<&str, ConfigError> {
        self.get(section, key).ok_or_else(|| ConfigError::MissingKey {
            section: section.to_string(),
            key: key.to_string(),
        })
    }

    /// Look up `key` in the service's `[<service>::api]` section.
    #[must_use]
    pub fn get_api(&self, service: &str, key: &str) -> Option<&str> {
        self.ini.get_from(Some(&format!("{service}::api")), key)
    }

    /// Resolve the HTTP origin for `svc`.
    ///
    /// External callers get `[svc] origin`. Internal callers prefer
    /// `internal-origin` and fall back to `origin`.
    #[must_use]
    pub fn origin(&self, svc: &str, external: bool) -> Option<&str> {
        if external {
            return self.get(svc, "origin");
        }
        self.get(svc, "internal-origin").or_else(|| self.get(svc, "origin"))
    }
}

/// The name of the service this process runs as, e.g. `todo.example.org`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceName(pub String);

/// Attach the configuration and service name to a context.
#[must_use]
pub fn context(ctx: &Context, config: Arc<Config>, service: &str) -> Context {
    ctx.with_shared(config)
        .with(ServiceName(service.to_string()))
}

/// Returns the configuration for this context.
#[must_use]
pub fn for_context(ctx: &Context) -> &Config {
    ctx.expect::<Config>("config")
}

/// Returns the name of the service handling this request.
#[must_use]
pub fn service_name(ctx: &Context) -> &str {
    &ctx.expect::<ServiceName>("service name").0
}

/// Attach the parsed CLI options to a context.
#[must_use]
pub fn options_context(ctx: &Context, options: Options) -> Context {
    ctx.with(options)
}

/// Returns the CLI options for this context.
#[must_use]
pub fn options(ctx: &Context) -> &Options {
    ctx.expect::<Options>("options")
}

/// True when the process runs in debug mode.
#[must_use]
pub fn debug(ctx: &Context) -> bool {
    ctx.get::<Options>().is_some_and(|o| o.debug)
}
