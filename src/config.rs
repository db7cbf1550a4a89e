use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// URL prefix under which stored photos are reachable.
    pub public_base_url: String,
    /// Largest accepted request body (a whole upload batch).
    pub max_body_bytes: usize,
    /// Per-attempt object store timeout.
    pub store_timeout: Duration,
    /// Object store attempts before an item is given up on.
    pub store_attempts: u32,
    pub db_max_connections: u32,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Guest photo collection service")]
pub struct Args {
    /// Host to bind to (overrides GUEST_PHOTOS_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides GUEST_PHOTOS_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where photos are stored (overrides GUEST_PHOTOS_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides GUEST_PHOTOS_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public URL prefix for stored photos (overrides GUEST_PHOTOS_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Maximum request body in bytes (overrides GUEST_PHOTOS_MAX_BODY_BYTES)
    #[arg(long)]
    pub max_body_bytes: Option<usize>,

    /// Object store timeout in milliseconds (overrides GUEST_PHOTOS_STORE_TIMEOUT_MS)
    #[arg(long)]
    pub store_timeout_ms: Option<u64>,

    /// Object store attempts per item (overrides GUEST_PHOTOS_STORE_ATTEMPTS)
    #[arg(long)]
    pub store_attempts: Option<u32>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

/// Read `name` and parse it, falling back to `default` when unset.
fn env_parsed<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args)?, migrate))
    }

    fn merge(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("GUEST_PHOTOS_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parsed("GUEST_PHOTOS_PORT", 3000u16)?;
        let env_storage =
            env::var("GUEST_PHOTOS_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("GUEST_PHOTOS_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/guest_photos.db".into());
        let env_max_body = env_parsed("GUEST_PHOTOS_MAX_BODY_BYTES", 256 * 1024 * 1024usize)?;
        let env_timeout = env_parsed("GUEST_PHOTOS_STORE_TIMEOUT_MS", 30_000u64)?;
        let env_attempts = env_parsed("GUEST_PHOTOS_STORE_ATTEMPTS", 3u32)?;
        let env_connections = env_parsed("GUEST_PHOTOS_DB_MAX_CONNECTIONS", 8u32)?;

        let host = args.host.unwrap_or(env_host);
        let port = args.port.unwrap_or(env_port);
        let env_public = env::var("GUEST_PHOTOS_PUBLIC_BASE_URL")
            .unwrap_or_else(|_| format!("http://localhost:{}/objects", port));

        // --- Merge ---
        Ok(Self {
            host,
            port,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            public_base_url: args.public_base_url.unwrap_or(env_public),
            max_body_bytes: args.max_body_bytes.unwrap_or(env_max_body),
            store_timeout: Duration::from_millis(args.store_timeout_ms.unwrap_or(env_timeout)),
            store_attempts: args.store_attempts.unwrap_or(env_attempts).max(1),
            db_max_connections: env_connections.max(1),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
