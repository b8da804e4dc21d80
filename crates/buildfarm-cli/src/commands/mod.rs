//! CLI command implementations.

pub mod agent;
pub mod mail;
pub mod requests;
pub mod validate;

use anyhow::{Context, Result};
use buildfarm_config::load_agent_config;
use buildfarm_db::{PgWorkStore, create_pool, run_migrations};
use std::path::PathBuf;

/// Where to find the work store.
pub struct StoreOptions {
    pub config: PathBuf,
    pub database_url: Option<String>,
}

impl StoreOptions {
    /// The explicit URL, else the one in the configuration file.
    fn database_url(&self) -> Result<String> {
        if let Some(url) = &self.database_url {
            return Ok(url.clone());
        }
        let config = load_agent_config(&self.config)
            .with_context(|| format!("Failed to read config file: {}", self.config.display()))?;
        config
            .database_url
            .context("No database URL: pass --database-url or set database-url in the config")
    }

    pub async fn store(&self) -> Result<PgWorkStore> {
        let url = self.database_url()?;
        let pool = create_pool(&url).await.context("Failed to connect to the work store")?;
        Ok(PgWorkStore::new(pool))
    }
}

pub async fn migrate(options: &StoreOptions) -> Result<()> {
    let url = options.database_url()?;
    let pool = create_pool(&url).await.context("Failed to connect to the work store")?;
    run_migrations(&pool).await.context("Failed to apply migrations")?;
    println!("Migrations applied");
    Ok(())
}
