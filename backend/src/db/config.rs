use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgPool, Executor, Postgres, Row};

use super::{app_id, corrupt, db_id};
use crate::config_store::{
    open_credentials, seal_credentials, validate_mapping, ApiCredentials, ConfigStore,
    ProductMapping, SealedCredentials, Settings, SettingsUpdate,
};
use crate::crypto::CredentialCipher;
use crate::error::ProvisioningResult;
use crate::store::ProductId;

const CREDENTIALS_KEY: &str = "api_credentials";
const SETTINGS_KEY: &str = "settings";

/// Configuration rows: sealed API credentials and settings live in a key-value
/// table, product mappings in their own.
pub struct PgConfigStore {
    pool: PgPool,
    cipher: Arc<dyn CredentialCipher>,
}

impl PgConfigStore {
    pub fn new(pool: PgPool, cipher: Arc<dyn CredentialCipher>) -> Self {
        Self { pool, cipher }
    }
}

async fn read_value<'c, E>(executor: E, key: &str, lock: bool) -> ProvisioningResult<Option<Value>>
where
    E: Executor<'c, Database = Postgres>,
{
    let sql = if lock {
        "SELECT value FROM provisioner_settings WHERE key = $1 FOR UPDATE"
    } else {
        "SELECT value FROM provisioner_settings WHERE key = $1"
    };
    let value = sqlx::query_scalar::<_, Value>(sql)
        .bind(key)
        .fetch_optional(executor)
        .await?;
    Ok(value)
}

async fn write_value<'c, E>(executor: E, key: &str, value: Value) -> ProvisioningResult<()>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"INSERT INTO provisioner_settings (key, value, updated_at)
           VALUES ($1, $2, NOW())
           ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()"#,
    )
    .bind(key)
    .bind(value)
    .execute(executor)
    .await?;
    Ok(())
}

fn parse_settings(value: Option<Value>) -> ProvisioningResult<Settings> {
    match value {
        Some(value) => serde_json::from_value(value).map_err(|err| corrupt("settings", err)),
        None => Ok(Settings::default()),
    }
}

#[async_trait]
impl ConfigStore for PgConfigStore {
    async fn save_credentials(&self, credentials: &ApiCredentials) -> ProvisioningResult<()> {
        let sealed = seal_credentials(self.cipher.as_ref(), credentials)?;
        let value = serde_json::to_value(&sealed).map_err(|err| corrupt("credentials", err))?;
        write_value(&self.pool, CREDENTIALS_KEY, value).await
    }

    async fn credentials(&self) -> ProvisioningResult<Option<ApiCredentials>> {
        let Some(value) = read_value(&self.pool, CREDENTIALS_KEY, false).await? else {
            return Ok(None);
        };
        let sealed: SealedCredentials =
            serde_json::from_value(value).map_err(|err| corrupt("credentials", err))?;
        Ok(open_credentials(
            self.cipher.as_ref(),
            sealed.api_url,
            &sealed.api_token_encrypted,
        ))
    }

    async fn save_product_mapping(
        &self,
        product_id: ProductId,
        mapping: ProductMapping,
    ) -> ProvisioningResult<()> {
        let mapping = validate_mapping(mapping)?;
        sqlx::query(
            r#"INSERT INTO product_mappings (product_id, plan_id, auto_provision, updated_at)
               VALUES ($1, $2, $3, NOW())
               ON CONFLICT (product_id) DO UPDATE SET
                   plan_id = EXCLUDED.plan_id,
                   auto_provision = EXCLUDED.auto_provision,
                   updated_at = NOW()"#,
        )
        .bind(db_id(product_id)?)
        .bind(&mapping.plan_id)
        .bind(mapping.auto_provision)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn product_mapping(
        &self,
        product_id: ProductId,
    ) -> ProvisioningResult<Option<ProductMapping>> {
        let row = sqlx::query(
            "SELECT plan_id, auto_provision FROM product_mappings WHERE product_id = $1",
        )
        .bind(db_id(product_id)?)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| ProductMapping {
            plan_id: row.get("plan_id"),
            auto_provision: row.get("auto_provision"),
        }))
    }

    async fn product_mappings(&self) -> ProvisioningResult<BTreeMap<ProductId, ProductMapping>> {
        let rows = sqlx::query(
            "SELECT product_id, plan_id, auto_provision FROM product_mappings ORDER BY product_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| -> ProvisioningResult<(ProductId, ProductMapping)> {
                let product_id = app_id(row.try_get("product_id")?)?;
                Ok((
                    product_id,
                    ProductMapping {
                        plan_id: row.try_get("plan_id")?,
                        auto_provision: row.try_get("auto_provision")?,
                    },
                ))
            })
            .collect()
    }

    async fn delete_product_mapping(&self, product_id: ProductId) -> ProvisioningResult<bool> {
        let result = sqlx::query("DELETE FROM product_mappings WHERE product_id = $1")
            .bind(db_id(product_id)?)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn settings(&self) -> ProvisioningResult<Settings> {
        parse_settings(read_value(&self.pool, SETTINGS_KEY, false).await?)
    }

    async fn update_settings(&self, update: &SettingsUpdate) -> ProvisioningResult<Settings> {
        let mut tx = self.pool.begin().await?;
        let current = parse_settings(read_value(&mut *tx, SETTINGS_KEY, true).await?)?;
        let updated = current.apply(update);
        let value = serde_json::to_value(updated).map_err(|err| corrupt("settings", err))?;
        write_value(&mut *tx, SETTINGS_KEY, value).await?;
        tx.commit().await?;
        Ok(updated)
    }
}
