//! Per-operator key-value settings, backed by the `user_setting` table.
//! Injected into the components that need it rather than read as ambient
//! global state.

use sqlx::PgPool;

use crate::gateway::EvolutionSettings;

const EVOLUTION_BASE_URL_KEY: &str = "evolution.base_url";
const EVOLUTION_API_KEY_KEY: &str = "evolution.api_key";
const EVOLUTION_INSTANCE_KEY: &str = "evolution.instance";

#[derive(Clone)]
pub struct SettingsStore {
    db: PgPool,
}

impl SettingsStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn get(&self, scope: &str, key: &str) -> Result<Option<String>, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT value
            FROM user_setting
            WHERE scope = $1 AND key = $2
            "#,
        )
        .bind(scope)
        .bind(key)
        .fetch_optional(&self.db)
        .await
    }

    pub async fn set(&self, scope: &str, key: &str, value: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO user_setting (scope, key, value, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (scope, key)
            DO UPDATE SET value = EXCLUDED.value, updated_at = now()
            "#,
        )
        .bind(scope)
        .bind(key)
        .bind(value)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, scope: &str, key: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            DELETE FROM user_setting
            WHERE scope = $1 AND key = $2
            "#,
        )
        .bind(scope)
        .bind(key)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Load the Evolution connection if all three keys are present.
    pub async fn evolution(&self, scope: &str) -> Result<Option<EvolutionSettings>, sqlx::Error> {
        let base_url = self.get(scope, EVOLUTION_BASE_URL_KEY).await?;
        let api_key = self.get(scope, EVOLUTION_API_KEY_KEY).await?;
        let instance = self.get(scope, EVOLUTION_INSTANCE_KEY).await?;

        Ok(match (base_url, api_key, instance) {
            (Some(base_url), Some(api_key), Some(instance)) => Some(EvolutionSettings {
                base_url,
                api_key,
                instance,
            }),
            _ => None,
        })
    }

    pub async fn save_evolution(
        &self,
        scope: &str,
        settings: &EvolutionSettings,
    ) -> Result<(), sqlx::Error> {
        self.set(scope, EVOLUTION_BASE_URL_KEY, settings.base_url.trim())
            .await?;
        self.set(scope, EVOLUTION_API_KEY_KEY, settings.api_key.trim())
            .await?;
        self.set(scope, EVOLUTION_INSTANCE_KEY, settings.instance.trim())
            .await?;
        Ok(())
    }

    pub async fn clear_evolution(&self, scope: &str) -> Result<(), sqlx::Error> {
        self.remove(scope, EVOLUTION_BASE_URL_KEY).await?;
        self.remove(scope, EVOLUTION_API_KEY_KEY).await?;
        self.remove(scope, EVOLUTION_INSTANCE_KEY).await?;
        Ok(())
    }
}
