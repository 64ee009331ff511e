//! Warehouse access: company dimension, connection fact table and CRM id lookup.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use opstat_core::{DimensionMapping, FactRow, Platform, StampKey};
use serde::Deserialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Rows per multi-value INSERT; keeps bind counts under the Postgres limit.
const INSERT_CHUNK: usize = 5_000;

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("warehouse query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Table names inside each schema, overridable through a YAML registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WarehouseTables {
    pub dim_company: String,
    pub fact_connection: String,
    pub crm_company_ref: String,
}

impl Default for WarehouseTables {
    fn default() -> Self {
        Self {
            dim_company: "dim_company".to_string(),
            fact_connection: "fact_open_platform_connection".to_string(),
            crm_company_ref: "company_ref".to_string(),
        }
    }
}

impl WarehouseTables {
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Fully qualified table locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarehouseLayout {
    pub dimension_schema: String,
    pub fact_schema: String,
    pub crm_schema: String,
    pub tables: WarehouseTables,
}

impl WarehouseLayout {
    pub fn dim_company(&self) -> String {
        format!("{}.{}", self.dimension_schema, self.tables.dim_company)
    }

    pub fn fact_connection(&self) -> String {
        format!("{}.{}", self.fact_schema, self.tables.fact_connection)
    }

    pub fn crm_company_ref(&self) -> String {
        format!("{}.{}", self.crm_schema, self.tables.crm_company_ref)
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Surrogate keys for the given natural company ids that are already registered.
    async fn company_keys(&self, natural_keys: &[i64]) -> Result<DimensionMapping, WarehouseError>;

    /// The whole company dimension.
    async fn all_company_keys(&self) -> Result<DimensionMapping, WarehouseError>;

    /// Registers natural ids; surrogate keys are assigned by the store.
    async fn register_companies(&self, natural_keys: &[i64]) -> Result<u64, WarehouseError>;

    /// Most recent fact per `(company_key, platform)`.
    async fn current_connection_status(&self) -> Result<Vec<FactRow>, WarehouseError>;

    async fn append_facts(&self, rows: &[FactRow]) -> Result<u64, WarehouseError>;

    /// Natural company id -> CRM record id.
    async fn crm_ids(&self, natural_keys: &[i64]) -> Result<BTreeMap<i64, i64>, WarehouseError>;
}

pub struct PgWarehouse {
    pool: PgPool,
    layout: WarehouseLayout,
}

impl PgWarehouse {
    pub fn new(pool: PgPool, layout: WarehouseLayout) -> Self {
        Self { pool, layout }
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        layout: WarehouseLayout,
    ) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, layout))
    }

    async fn key_mapping(&self, sql: &str, keys: Option<&[i64]>) -> Result<DimensionMapping, WarehouseError> {
        let query = sqlx::query(sql);
        let query = match keys {
            Some(keys) => query.bind(keys.to_vec()),
            None => query,
        };
        let rows = query.fetch_all(&self.pool).await?;
        let mapping = rows
            .iter()
            .map(|row| Ok((row.try_get::<i64, _>(0)?, row.try_get::<i64, _>(1)?)))
            .collect::<Result<DimensionMapping, sqlx::Error>>()?;
        Ok(mapping)
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn company_keys(&self, natural_keys: &[i64]) -> Result<DimensionMapping, WarehouseError> {
        if natural_keys.is_empty() {
            return Ok(DimensionMapping::new());
        }
        let sql = format!(
            "SELECT dynamodb_key, company_key FROM {} WHERE dynamodb_key = ANY($1)",
            self.layout.dim_company()
        );
        self.key_mapping(&sql, Some(natural_keys)).await
    }

    async fn all_company_keys(&self) -> Result<DimensionMapping, WarehouseError> {
        let sql = format!(
            "SELECT dynamodb_key, company_key FROM {}",
            self.layout.dim_company()
        );
        self.key_mapping(&sql, None).await
    }

    async fn register_companies(&self, natural_keys: &[i64]) -> Result<u64, WarehouseError> {
        let mut inserted = 0;
        let mut tx = self.pool.begin().await?;
        for chunk in natural_keys.chunks(INSERT_CHUNK) {
            let mut builder = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {} (dynamodb_key) ",
                self.layout.dim_company()
            ));
            builder.push_values(chunk, |mut row, key| {
                row.push_bind(*key);
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        debug!(inserted, "registered companies");
        Ok(inserted)
    }

    async fn current_connection_status(&self) -> Result<Vec<FactRow>, WarehouseError> {
        let sql = format!(
            "SELECT company_key, platform, status, date_key, time_key FROM (\
                SELECT company_key, platform, status, date_key, time_key, \
                ROW_NUMBER() OVER (PARTITION BY company_key, platform \
                                   ORDER BY date_key DESC, time_key DESC) AS rn \
                FROM {}) latest WHERE rn = 1",
            self.layout.fact_connection()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut current = Vec::with_capacity(rows.len());
        for row in rows {
            let platform: String = row.try_get("platform")?;
            let Some(category) = Platform::from_display_name(&platform) else {
                warn!(platform = %platform, "skipping fact row with unknown platform");
                continue;
            };
            current.push(FactRow {
                entity_key: row.try_get("company_key")?,
                category,
                status: row.try_get("status")?,
                as_of: StampKey::new(row.try_get("date_key")?, row.try_get("time_key")?),
            });
        }
        Ok(current)
    }

    async fn append_facts(&self, rows: &[FactRow]) -> Result<u64, WarehouseError> {
        let mut inserted = 0;
        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut builder = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {} (date_key, time_key, company_key, platform, status) ",
                self.layout.fact_connection()
            ));
            builder.push_values(chunk, |mut b, fact| {
                b.push_bind(fact.as_of.date_key)
                    .push_bind(fact.as_of.time_key)
                    .push_bind(fact.entity_key)
                    .push_bind(fact.category.display_name())
                    .push_bind(fact.status);
            });
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn crm_ids(&self, natural_keys: &[i64]) -> Result<BTreeMap<i64, i64>, WarehouseError> {
        if natural_keys.is_empty() {
            return Ok(BTreeMap::new());
        }
        let sql = format!(
            "SELECT flowaccount_id, hubspot_id FROM {} WHERE flowaccount_id = ANY($1)",
            self.layout.crm_company_ref()
        );
        self.key_mapping(&sql, Some(natural_keys)).await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    companies: DimensionMapping,
    facts: Vec<FactRow>,
    crm_ids: BTreeMap<i64, i64>,
}

/// In-process warehouse for dry runs and tests. Surrogate keys count up from 1.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_companies(companies: DimensionMapping) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                companies,
                ..MemoryState::default()
            }),
        }
    }

    pub async fn set_crm_ids(&self, crm_ids: BTreeMap<i64, i64>) {
        self.state.lock().await.crm_ids = crm_ids;
    }

    pub async fn companies(&self) -> DimensionMapping {
        self.state.lock().await.companies.clone()
    }

    pub async fn facts(&self) -> Vec<FactRow> {
        self.state.lock().await.facts.clone()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn company_keys(&self, natural_keys: &[i64]) -> Result<DimensionMapping, WarehouseError> {
        let state = self.state.lock().await;
        Ok(natural_keys
            .iter()
            .filter_map(|key| state.companies.get(key).map(|value| (*key, *value)))
            .collect())
    }

    async fn all_company_keys(&self) -> Result<DimensionMapping, WarehouseError> {
        Ok(self.state.lock().await.companies.clone())
    }

    async fn register_companies(&self, natural_keys: &[i64]) -> Result<u64, WarehouseError> {
        let mut state = self.state.lock().await;
        let mut inserted = 0;
        for key in natural_keys {
            if state.companies.contains_key(key) {
                continue;
            }
            let next = state.companies.values().max().copied().unwrap_or(0) + 1;
            state.companies.insert(*key, next);
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn current_connection_status(&self) -> Result<Vec<FactRow>, WarehouseError> {
        let state = self.state.lock().await;
        let mut latest: BTreeMap<(i64, Platform), FactRow> = BTreeMap::new();
        for fact in &state.facts {
            let pair = (fact.entity_key, fact.category);
            if latest.get(&pair).map_or(true, |seen| fact.as_of >= seen.as_of) {
                latest.insert(pair, fact.clone());
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn append_facts(&self, rows: &[FactRow]) -> Result<u64, WarehouseError> {
        let mut state = self.state.lock().await;
        state.facts.extend_from_slice(rows);
        Ok(rows.len() as u64)
    }

    async fn crm_ids(&self, natural_keys: &[i64]) -> Result<BTreeMap<i64, i64>, WarehouseError> {
        let state = self.state.lock().await;
        Ok(natural_keys
            .iter()
            .filter_map(|key| state.crm_ids.get(key).map(|id| (*key, *id)))
            .collect())
    }
}
