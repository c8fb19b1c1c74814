//! The `config` key/value table: persisted runtime overrides set via the
//! command surface (distinct from the file/env/CLI layering in
//! `crate::config`, which only runs at startup).

use super::Store;
use crate::error::Result;

impl Store {
    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(value,)| value))
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn config_all(&self) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM config")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_and_enumerate() {
        let store = Store::open_in_memory().await.expect("open");
        assert_eq!(store.config_get("max_workers").await.expect("get"), None);

        store.config_set("max_workers", "6").await.expect("set");
        assert_eq!(
            store.config_get("max_workers").await.expect("get"),
            Some("6".to_string())
        );

        store.config_set("max_workers", "8").await.expect("overwrite");
        let all = store.config_all().await.expect("all");
        assert_eq!(all, vec![("max_workers".to_string(), "8".to_string())]);
    }
}
