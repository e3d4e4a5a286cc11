use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlflow_core::{ExecutorConfig, MemoryConnectionProvider, MemoryDatabase, SqlValue};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

/// An in-memory database registered under a connection id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub id: String,

    /// Every request to this connection fails as unreachable.
    #[serde(default)]
    pub unreachable: bool,

    /// Statements containing any of these fragments are rejected.
    #[serde(default)]
    pub fail_on: Vec<String>,

    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<SqlValue>>,
}

impl CliConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        if !config_path.exists() {
            tracing::info!("Configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(config_path).context("Failed to read configuration file")?;
        let config: Self = toml::from_str(&content).context("Failed to parse configuration file")?;
        tracing::debug!(
            "Loaded {} connection(s) from {}",
            config.connections.len(),
            config_path.display()
        );
        Ok(config)
    }

    /// Build the connection provider the executor runs against.
    pub fn provider(&self) -> Result<MemoryConnectionProvider> {
        let mut provider = MemoryConnectionProvider::new();
        for conn in &self.connections {
            let mut db = MemoryDatabase::new(conn.id.clone())
                .with_context(|| format!("Failed to open database for connection {}", conn.id))?;
            for table in &conn.tables {
                let columns: Vec<&str> = table.columns.iter().map(String::as_str).collect();
                db = db
                    .with_table(&table.name, &columns, table.rows.clone())
                    .with_context(|| {
                        format!("Failed to seed table {} on {}", table.name, conn.id)
                    })?;
            }
            if conn.unreachable {
                db.set_reachable(false);
            }
            for fragment in &conn.fail_on {
                db.fail_on(fragment.clone());
            }
            provider.insert(conn.id.clone(), Arc::new(db));
        }
        Ok(provider)
    }
}
