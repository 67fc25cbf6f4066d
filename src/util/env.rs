//! Environment helpers: dotenv loading and typed getters.
//! Every getter calls `init_env()` so a `.env` file is honoured regardless of call order.
use std::str::FromStr;
use std::sync::Once;
use tracing::info;

static INIT: Once = Once::new();

/// Load `.env` from the working directory, falling back to the crate root. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        if dotenv::dotenv().is_ok() {
            return;
        }
        let candidate = format!("{}/.env", env!("CARGO_MANIFEST_DIR"));
        let _ = dotenv::from_filename(candidate);
    });
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Get parsed value with default fallback. Unparseable values fall back too.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match env_opt(key) {
        Some(raw) => raw.trim().parse::<T>().unwrap_or(default),
        None => default,
    }
}

/// Boolean flag; accepts 1/true/on/yes (case-insensitive) as true.
pub fn env_flag(key: &str, default: bool) -> bool {
    match env_opt(key) {
        Some(raw) => {
            let v = raw.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "on" | "yes")
        }
        None => default,
    }
}

/// Database URL: `DATABASE_URL`, then `DB_URL`, then one composed from `DB_*` parts.
pub fn db_url() -> anyhow::Result<String> {
    for k in ["DATABASE_URL", "DB_URL"] {
        if let Some(v) = env_opt(k) {
            info!(target = "env", source = k, "using database url");
            return Ok(v);
        }
    }
    if let Some(dsn) = build_dsn_from_parts() {
        info!(target = "env", "using database url composed from DB_* vars");
        return Ok(dsn);
    }
    Err(anyhow::anyhow!(
        "no database URL env vars set (DATABASE_URL, DB_URL or DB_HOST/DB_USERNAME)"
    ))
}

fn build_dsn_from_parts() -> Option<String> {
    let host = env_opt("DB_HOST")?;
    let user = env_opt("DB_USERNAME")?;
    let password = env_opt("DB_PASSWORD");
    let database = env_opt("DB_DATABASE").unwrap_or_else(|| "vinyl".into());
    let port: u16 = env_parse("DB_PORT", 5432u16);
    let ssl_mode = env_opt("DB_SSLMODE").unwrap_or_else(|| "prefer".into());

    // Url handles percent-encoding of credentials.
    let mut out = url::Url::parse("postgresql://localhost").ok()?;
    out.set_username(&user).ok()?;
    if let Some(pass) = password {
        out.set_password(Some(&pass)).ok()?;
    }
    let host_trimmed = host.trim().trim_matches(|c| c == '[' || c == ']');
    if host_trimmed.contains(':') {
        out.set_host(Some(&format!("[{host_trimmed}]"))).ok()?;
    } else {
        out.set_host(Some(host_trimmed)).ok()?;
    }
    out.set_port(Some(port)).ok()?;
    out.set_path(&format!("/{database}"));
    if ssl_mode != "disable" {
        out.query_pairs_mut().append_pair("sslmode", &ssl_mode);
    }
    Some(out.to_string())
}

/// Mask credentials before a value reaches the logs.
pub fn redact_value(key: &str, val: &str) -> String {
    let k = key.to_ascii_uppercase();
    if k.contains("PASSWORD") || k.contains("SECRET") || k.contains("TOKEN") || k.contains("KEY") {
        return "***".to_string();
    }
    let val_trim = val.trim();
    if let Ok(mut u) = url::Url::parse(val_trim) {
        let scheme = u.scheme().to_ascii_lowercase();
        if scheme == "postgres" || scheme == "postgresql" {
            let _ = u.set_username("***");
            let _ = u.set_password(Some("***"));
            return u.to_string();
        }
    }
    val_trim.to_string()
}

/// Validate required keys and log a redacted snapshot of the given keys.
pub fn preflight_check(title: &str, required: &[&str], also_log: &[&str]) -> anyhow::Result<()> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|k| env_opt(k).is_none())
        .collect();
    let snapshot: Vec<(String, String)> = also_log
        .iter()
        .map(|k| {
            let v = env_opt(k).unwrap_or_default();
            (k.to_string(), redact_value(k, &v))
        })
        .collect();
    info!(target = "preflight", title, snapshot = ?snapshot, "configuration snapshot");
    if !missing.is_empty() {
        return Err(anyhow::anyhow!("missing required env: {:?}", missing));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_secrets_and_dsn_credentials() {
        assert_eq!(redact_value("NOTIFY_WEBHOOK_TOKEN", "abc"), "***");
        let dsn = redact_value("DATABASE_URL", "postgres://vinyl:hunter2@db:5432/vinyl");
        assert!(!dsn.contains("hunter2"));
        assert!(dsn.contains("db:5432"));
        assert_eq!(redact_value("SCAN_QUEUE_NAME", " q "), "q");
    }

    #[test]
    fn env_parse_falls_back_on_garbage() {
        std::env::set_var("VINYL_TEST_PARSE_GARBAGE", "twelve");
        assert_eq!(env_parse("VINYL_TEST_PARSE_GARBAGE", 12u64), 12);
        std::env::set_var("VINYL_TEST_PARSE_OK", " 42 ");
        assert_eq!(env_parse("VINYL_TEST_PARSE_OK", 0u64), 42);
    }

    #[test]
    fn env_flag_accepts_common_truthy_values() {
        std::env::set_var("VINYL_TEST_FLAG_ON", "Yes");
        assert!(env_flag("VINYL_TEST_FLAG_ON", false));
        std::env::set_var("VINYL_TEST_FLAG_OFF", "0");
        assert!(!env_flag("VINYL_TEST_FLAG_OFF", true));
        assert!(env_flag("VINYL_TEST_FLAG_UNSET", true));
    }
}
