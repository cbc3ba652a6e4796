use carebill_core::BillingSettings;
use serde_json::Value;

use crate::db::DbPool;
use crate::error::Result;

/// Values are stored as JSON text so numbers, booleans and dates keep their type.
pub async fn get_setting(pool: &DbPool, key: &str) -> Result<Option<Value>> {
    let raw = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    raw.map(|r| serde_json::from_str(&r).map_err(Into::into)).transpose()
}

pub async fn set_setting(pool: &DbPool, key: &str, value: &Value) -> Result<()> {
    sqlx::query("INSERT INTO settings (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn all_settings(pool: &DbPool) -> Result<Vec<(String, Value)>> {
    let rows = sqlx::query_as::<_, (String, String)>("SELECT key, value FROM settings ORDER BY key")
        .fetch_all(pool)
        .await?;
    let mut settings = Vec::with_capacity(rows.len());
    for (key, raw) in rows {
        match serde_json::from_str(&raw) {
            Ok(value) => settings.push((key, value)),
            Err(e) => tracing::warn!(key, error = %e, "Skipping unreadable setting"),
        }
    }
    Ok(settings)
}

/// Typed billing settings; missing or malformed keys take their defaults.
pub async fn load_settings(pool: &DbPool) -> Result<BillingSettings> {
    let pairs = all_settings(pool).await?;
    Ok(BillingSettings::from_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::fresh_db;
    use carebill_core::settings::{KEY_AUTO_GENERATE_INVOICES, KEY_DEFAULT_BILLING_RATE};
    use carebill_core::Money;
    use serde_json::json;

    #[tokio::test]
    async fn set_overwrites_and_loads_typed() {
        let (_dir, pool) = fresh_db().await;
        assert_eq!(get_setting(&pool, KEY_DEFAULT_BILLING_RATE).await.unwrap(), None);
        assert_eq!(load_settings(&pool).await.unwrap(), BillingSettings::default());

        set_setting(&pool, KEY_DEFAULT_BILLING_RATE, &json!(80)).await.unwrap();
        set_setting(&pool, KEY_DEFAULT_BILLING_RATE, &json!(90)).await.unwrap();
        set_setting(&pool, KEY_AUTO_GENERATE_INVOICES, &json!(true)).await.unwrap();

        assert_eq!(get_setting(&pool, KEY_DEFAULT_BILLING_RATE).await.unwrap(), Some(json!(90)));
        let settings = load_settings(&pool).await.unwrap();
        assert_eq!(settings.default_billing_rate, Money::from_dollars(90));
        assert!(settings.auto_generate_invoices);
    }
}
