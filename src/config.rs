use regex::Regex;
use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub env_name: String,

    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,

    pub db_url: String,
    pub db_schema: Option<String>,

    pub require_internal_secret: bool,
    pub internal_secret: Option<String>,

    pub allowed_origins: Vec<String>,

    pub default_currency: String,
    pub driver_share_percent: i64,
    pub minimum_withdrawal_cents: i64,
    pub allow_direct_bonus: bool,
    pub platform_wallet_user_id: String,

    pub card_gateway_base_url: Option<String>,
    pub card_gateway_api_key: Option<String>,
    pub card_webhook_secret: Option<String>,

    pub payout_base_url: Option<String>,
    pub payout_api_key: Option<String>,
    pub payout_webhook_secret: Option<String>,

    pub webhook_tolerance_secs: i64,
    pub idempotency_retention_days: i64,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) => {
            let v = v.trim().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        }
        Err(_) => None,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    let v = raw.trim().to_lowercase();
    if v.is_empty() {
        return None;
    }
    if matches!(v.as_str(), "0" | "false" | "no" | "off") {
        Some(false)
    } else {
        Some(true)
    }
}

fn normalize_db_url(raw: &str) -> String {
    // Accept SQLAlchemy-style URLs like "postgresql+psycopg://..." by dropping
    // the "+driver" portion.
    if let Some(colon) = raw.find(':') {
        let (scheme, rest) = raw.split_at(colon);
        if let Some(plus) = scheme.find('+') {
            return format!("{}{}", &scheme[..plus], rest);
        }
    }
    raw.to_string()
}

fn validate_postgres_url(url: &str) -> Result<(), String> {
    let scheme = url
        .split_once(':')
        .map(|(s, _)| s.trim().to_lowercase())
        .unwrap_or_default();
    match scheme.as_str() {
        "postgres" | "postgresql" => Ok(()),
        _ => Err("SETTLEMENT_DB_URL (or DB_URL) must be a postgres URL".to_string()),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let env_name = env_or("ENV", "dev");
        let env_lower = env_name.trim().to_lowercase();
        let prod_like = matches!(env_lower.as_str(), "prod" | "production" | "staging");

        let host = env_or("APP_HOST", "0.0.0.0");
        let port: u16 = env_or("APP_PORT", "8084")
            .parse()
            .map_err(|_| "APP_PORT must be a valid u16".to_string())?;

        let db_raw = env_opt("SETTLEMENT_DB_URL")
            .or_else(|| env_opt("DB_URL"))
            .unwrap_or_else(|| {
                "postgresql://mishwar:mishwar@db:5432/mishwar_settlement".to_string()
            });
        let db_url = normalize_db_url(&db_raw);
        validate_postgres_url(&db_url)?;

        let db_schema = env_opt("DB_SCHEMA");
        if let Some(s) = &db_schema {
            let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").map_err(|e| e.to_string())?;
            if !re.is_match(s) {
                return Err("DB_SCHEMA must match ^[A-Za-z_][A-Za-z0-9_]*$".to_string());
            }
        }

        let require_internal_secret = {
            let raw = env_or("SETTLEMENT_REQUIRE_INTERNAL_SECRET", "");
            match parse_bool_like(&raw) {
                Some(v) => v,
                None => prod_like,
            }
        };
        if prod_like && !require_internal_secret {
            return Err(
                "SETTLEMENT_REQUIRE_INTERNAL_SECRET must be true in prod/staging".to_string(),
            );
        }

        let internal_secret =
            env_opt("INTERNAL_API_SECRET").or_else(|| env_opt("SETTLEMENT_INTERNAL_SECRET"));
        if require_internal_secret && internal_secret.as_deref().unwrap_or("").is_empty() {
            return Err(
                "INTERNAL_API_SECRET must be set when SETTLEMENT_REQUIRE_INTERNAL_SECRET is enabled"
                    .to_string(),
            );
        }

        let mut allowed_origins = parse_csv(&env_or("ALLOWED_ORIGINS", ""));
        if allowed_origins.is_empty() {
            allowed_origins = vec![
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ];
        }
        if prod_like && allowed_origins.iter().any(|o| o.trim() == "*") {
            return Err("ALLOWED_ORIGINS must not contain '*' in prod/staging".to_string());
        }
        if prod_like
            && allowed_origins
                .iter()
                .any(|o| !o.trim().starts_with("https://"))
        {
            return Err("ALLOWED_ORIGINS must use https:// origins in prod/staging".to_string());
        }

        let max_body_bytes: usize = env_or("SETTLEMENT_MAX_BODY_BYTES", "1048576")
            .parse()
            .map_err(|_| "SETTLEMENT_MAX_BODY_BYTES must be an integer".to_string())?;
        let max_body_bytes = max_body_bytes.clamp(16 * 1024, 10 * 1024 * 1024);

        let mut default_currency = env_or("DEFAULT_CURRENCY", "USD").trim().to_uppercase();
        if default_currency.is_empty() {
            default_currency = "USD".to_string();
        }
        if default_currency.len() > 3 {
            default_currency.truncate(3);
        }

        let driver_share_percent: i64 = env_or("DRIVER_SHARE_PERCENT", "90")
            .parse()
            .map_err(|_| "DRIVER_SHARE_PERCENT must be an integer".to_string())?;
        let driver_share_percent = driver_share_percent.clamp(0, 100);

        let minimum_withdrawal_cents: i64 = env_or("MIN_WITHDRAWAL_CENTS", "500")
            .parse()
            .map_err(|_| "MIN_WITHDRAWAL_CENTS must be an integer".to_string())?;
        let minimum_withdrawal_cents = minimum_withdrawal_cents.max(0);

        let allow_direct_bonus = {
            let raw = env_or("SETTLEMENT_ALLOW_DIRECT_BONUS", "");
            match parse_bool_like(&raw) {
                Some(v) => v,
                None => matches!(env_lower.as_str(), "dev" | "test"),
            }
        };

        let platform_wallet_user_id = env_or("PLATFORM_WALLET_USER_ID", "platform-fees")
            .trim()
            .to_string();
        if platform_wallet_user_id.is_empty() {
            return Err("PLATFORM_WALLET_USER_ID must not be empty".to_string());
        }

        let card_gateway_base_url = env_opt("CARD_GATEWAY_BASE_URL");
        let card_gateway_api_key = env_opt("CARD_GATEWAY_API_KEY");
        let card_webhook_secret = env_opt("CARD_WEBHOOK_SECRET");
        if card_gateway_base_url.is_some() {
            if card_gateway_api_key.is_none() {
                return Err(
                    "CARD_GATEWAY_API_KEY must be set when CARD_GATEWAY_BASE_URL is set"
                        .to_string(),
                );
            }
            if prod_like && card_webhook_secret.is_none() {
                return Err(
                    "CARD_WEBHOOK_SECRET must be set in prod/staging when the card gateway is configured"
                        .to_string(),
                );
            }
        }

        let payout_base_url = env_opt("PAYOUT_BASE_URL");
        let payout_api_key = env_opt("PAYOUT_API_KEY");
        let payout_webhook_secret = env_opt("PAYOUT_WEBHOOK_SECRET");
        if payout_base_url.is_some() {
            if payout_api_key.is_none() {
                return Err(
                    "PAYOUT_API_KEY must be set when PAYOUT_BASE_URL is set".to_string(),
                );
            }
            if prod_like && payout_webhook_secret.is_none() {
                return Err(
                    "PAYOUT_WEBHOOK_SECRET must be set in prod/staging when the payout processor is configured"
                        .to_string(),
                );
            }
        }

        let webhook_tolerance_secs: i64 = env_or("WEBHOOK_TOLERANCE_SECS", "300")
            .parse()
            .map_err(|_| "WEBHOOK_TOLERANCE_SECS must be an integer".to_string())?;
        let webhook_tolerance_secs = webhook_tolerance_secs.clamp(30, 3600);

        let idempotency_retention_days: i64 = env_or("IDEMPOTENCY_RETENTION_DAYS", "30")
            .parse()
            .map_err(|_| "IDEMPOTENCY_RETENTION_DAYS must be an integer".to_string())?;
        let idempotency_retention_days = idempotency_retention_days.clamp(1, 365);

        Ok(Self {
            env_name,
            host,
            port,
            max_body_bytes,
            db_url,
            db_schema,
            require_internal_secret,
            internal_secret,
            allowed_origins,
            default_currency,
            driver_share_percent,
            minimum_withdrawal_cents,
            allow_direct_bonus,
            platform_wallet_user_id,
            card_gateway_base_url,
            card_gateway_api_key,
            card_webhook_secret,
            payout_base_url,
            payout_api_key,
            payout_webhook_secret,
            webhook_tolerance_secs,
            idempotency_retention_days,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    const ALL_KEYS: &[&str] = &[
        "ENV",
        "APP_HOST",
        "APP_PORT",
        "SETTLEMENT_DB_URL",
        "DB_URL",
        "DB_SCHEMA",
        "SETTLEMENT_REQUIRE_INTERNAL_SECRET",
        "INTERNAL_API_SECRET",
        "SETTLEMENT_INTERNAL_SECRET",
        "ALLOWED_ORIGINS",
        "SETTLEMENT_MAX_BODY_BYTES",
        "DEFAULT_CURRENCY",
        "DRIVER_SHARE_PERCENT",
        "MIN_WITHDRAWAL_CENTS",
        "SETTLEMENT_ALLOW_DIRECT_BONUS",
        "PLATFORM_WALLET_USER_ID",
        "CARD_GATEWAY_BASE_URL",
        "CARD_GATEWAY_API_KEY",
        "CARD_WEBHOOK_SECRET",
        "PAYOUT_BASE_URL",
        "PAYOUT_API_KEY",
        "PAYOUT_WEBHOOK_SECRET",
        "WEBHOOK_TOLERANCE_SECS",
        "IDEMPOTENCY_RETENTION_DAYS",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            let mut saved = Vec::with_capacity(ALL_KEYS.len());
            for k in ALL_KEYS {
                let existing = env::var(k).ok();
                saved.push((k.to_string(), existing));
                env::remove_var(k);
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in self.saved.drain(..) {
                match v {
                    Some(val) => env::set_var(k, val),
                    None => env::remove_var(k),
                }
            }
        }
    }

    fn set_dev_baseline() {
        env::set_var("ENV", "dev");
        env::set_var(
            "SETTLEMENT_DB_URL",
            "postgresql://u:p@localhost:5432/settlement",
        );
        env::set_var("SETTLEMENT_REQUIRE_INTERNAL_SECRET", "false");
    }

    #[test]
    fn rejects_non_postgres_url() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();

        env::set_var("SETTLEMENT_DB_URL", "sqlite:////tmp/settlement.db");
        env::set_var("SETTLEMENT_REQUIRE_INTERNAL_SECRET", "false");

        assert!(Config::from_env().is_err());
    }

    #[test]
    fn normalizes_sqlalchemy_driver_suffix() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();

        set_dev_baseline();
        env::set_var(
            "SETTLEMENT_DB_URL",
            "postgresql+psycopg://u:p@localhost:5432/settlement",
        );

        let cfg = Config::from_env().expect("config");
        assert!(cfg.db_url.starts_with("postgresql://"));
    }

    #[test]
    fn prod_requires_internal_secret() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();

        env::set_var("ENV", "prod");
        env::set_var(
            "SETTLEMENT_DB_URL",
            "postgresql://u:p@localhost:5432/settlement",
        );

        let err = Config::from_env().expect_err("missing internal secret must be rejected");
        assert!(err.contains("INTERNAL_API_SECRET"));
    }

    #[test]
    fn prod_rejects_internal_secret_toggle_off() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();

        env::set_var("ENV", "prod");
        env::set_var(
            "SETTLEMENT_DB_URL",
            "postgresql://u:p@localhost:5432/settlement",
        );
        env::set_var("SETTLEMENT_REQUIRE_INTERNAL_SECRET", "false");

        let err = Config::from_env().expect_err("disabled secret gate must be rejected in prod");
        assert!(err.contains("SETTLEMENT_REQUIRE_INTERNAL_SECRET"));
    }

    #[test]
    fn prod_rejects_wildcard_and_non_https_origins() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();

        env::set_var("ENV", "prod");
        env::set_var(
            "SETTLEMENT_DB_URL",
            "postgresql://u:p@localhost:5432/settlement",
        );
        env::set_var("INTERNAL_API_SECRET", "settlement-secret-0123456789");

        env::set_var("ALLOWED_ORIGINS", "*");
        assert!(Config::from_env().is_err());

        env::set_var("ALLOWED_ORIGINS", "http://app.mishwar.example");
        let err = Config::from_env().expect_err("non-https origin must be rejected");
        assert!(err.contains("https://"));
    }

    #[test]
    fn prod_requires_webhook_secret_when_gateway_configured() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();

        env::set_var("ENV", "prod");
        env::set_var(
            "SETTLEMENT_DB_URL",
            "postgresql://u:p@localhost:5432/settlement",
        );
        env::set_var("INTERNAL_API_SECRET", "settlement-secret-0123456789");
        env::set_var("ALLOWED_ORIGINS", "https://app.mishwar.example");
        env::set_var("CARD_GATEWAY_BASE_URL", "https://gateway.example");
        env::set_var("CARD_GATEWAY_API_KEY", "sk_live_x");

        let err = Config::from_env().expect_err("missing webhook secret must be rejected");
        assert!(err.contains("CARD_WEBHOOK_SECRET"));
    }

    #[test]
    fn gateway_base_url_requires_api_key() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();

        set_dev_baseline();
        env::set_var("CARD_GATEWAY_BASE_URL", "https://gateway.example");

        let err = Config::from_env().expect_err("missing api key must be rejected");
        assert!(err.contains("CARD_GATEWAY_API_KEY"));
    }

    #[test]
    fn body_limit_is_clamped_to_safe_bounds() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();

        set_dev_baseline();

        env::set_var("SETTLEMENT_MAX_BODY_BYTES", "1");
        let cfg = Config::from_env().expect("config");
        assert_eq!(cfg.max_body_bytes, 16 * 1024);

        env::set_var("SETTLEMENT_MAX_BODY_BYTES", "999999999");
        let cfg = Config::from_env().expect("config");
        assert_eq!(cfg.max_body_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn driver_share_is_clamped_and_defaults_hold() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();

        set_dev_baseline();

        let cfg = Config::from_env().expect("config");
        assert_eq!(cfg.driver_share_percent, 90);
        assert_eq!(cfg.minimum_withdrawal_cents, 500);
        assert_eq!(cfg.idempotency_retention_days, 30);
        assert!(cfg.allow_direct_bonus);

        env::set_var("DRIVER_SHARE_PERCENT", "250");
        let cfg = Config::from_env().expect("config");
        assert_eq!(cfg.driver_share_percent, 100);
    }

    #[test]
    fn prod_defaults_direct_bonus_to_disabled() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();

        env::set_var("ENV", "prod");
        env::set_var(
            "SETTLEMENT_DB_URL",
            "postgresql://u:p@localhost:5432/settlement",
        );
        env::set_var("INTERNAL_API_SECRET", "settlement-secret-0123456789");
        env::set_var("ALLOWED_ORIGINS", "https://app.mishwar.example");

        let cfg = Config::from_env().expect("config");
        assert!(!cfg.allow_direct_bonus);
    }

    #[test]
    fn rejects_invalid_db_schema() {
        let _g = ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap();
        let _env = EnvGuard::new();

        set_dev_baseline();
        env::set_var("DB_SCHEMA", "bad-schema;drop");

        assert!(Config::from_env().is_err());
    }
}
