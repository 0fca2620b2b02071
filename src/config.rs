use crate::error::{PollError, PollResult};
use std::{env, fmt::Display, str::FromStr, time::Duration};
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct RateRule {
    pub max: u64,
    pub window: Duration,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub redis_url: Option<String>,
    pub jwt_secret: String,
    pub cache_ttl_active: Duration,
    pub cache_ttl_closed: Duration,
    pub vote_rate: RateRule,
    pub api_rate: RateRule,
    pub sweep_interval: Duration,
    pub io_timeout: Duration,
    pub bus_backoff_base: Duration,
    pub bus_backoff_max: Duration,
    pub bus_max_retries: Option<u32>,
}

impl Config {
    /// Reads `.env` if present, then the process environment.
    pub fn load() -> PollResult<Self> {
        dotenv::dotenv().ok();
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Builds the config from `lookup`, applying defaults for unset keys.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> PollResult<Self> {
        let vars = Vars(lookup);
        let jwt_secret = vars
            .optional("JWT_SECRET")
            .ok_or_else(|| PollError::Fatal("JWT_SECRET must be set".to_owned()))?;

        Ok(Self {
            host: vars.try_load("HOST", "0.0.0.0")?,
            port: vars.try_load("PORT", "5000")?,
            database_url: vars.optional("DATABASE_URL"),
            db_max_connections: vars.try_load("DB_MAX_CONNECTIONS", "5")?,
            redis_url: vars.optional("REDIS_URL"),
            jwt_secret,
            cache_ttl_active: vars.duration("CACHE_TTL_ACTIVE_SECS", "30", Duration::from_secs)?,
            cache_ttl_closed: vars.duration("CACHE_TTL_CLOSED_SECS", "3600", Duration::from_secs)?,
            vote_rate: RateRule {
                max: vars.try_load("VOTE_RATE_MAX", "5")?,
                window: vars.duration("VOTE_RATE_WINDOW_MS", "10000", Duration::from_millis)?,
            },
            api_rate: RateRule {
                max: vars.try_load("API_RATE_MAX", "100")?,
                window: vars.duration("API_RATE_WINDOW_MS", "60000", Duration::from_millis)?,
            },
            sweep_interval: vars.duration("SWEEP_INTERVAL_SECS", "60", Duration::from_secs)?,
            io_timeout: vars.duration("IO_TIMEOUT_MS", "2000", Duration::from_millis)?,
            bus_backoff_base: vars.duration("BUS_BACKOFF_BASE_MS", "250", Duration::from_millis)?,
            bus_backoff_max: vars.duration("BUS_BACKOFF_MAX_MS", "10000", Duration::from_millis)?,
            bus_max_retries: vars
                .optional("BUS_MAX_RETRIES")
                .map(|raw| parse("BUS_MAX_RETRIES", &raw))
                .transpose()?,
        })
    }

    /// Defaults for running everything in-process, used by tests.
    pub fn local(jwt_secret: impl Into<String>) -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 0,
            database_url: None,
            db_max_connections: 5,
            redis_url: None,
            jwt_secret: jwt_secret.into(),
            cache_ttl_active: Duration::from_secs(30),
            cache_ttl_closed: Duration::from_secs(3600),
            vote_rate: RateRule {
                max: 5,
                window: Duration::from_secs(10),
            },
            api_rate: RateRule {
                max: 100,
                window: Duration::from_secs(60),
            },
            sweep_interval: Duration::from_secs(60),
            io_timeout: Duration::from_secs(2),
            bus_backoff_base: Duration::from_millis(250),
            bus_backoff_max: Duration::from_secs(10),
            bus_max_retries: None,
        }
    }
}

struct Vars<F>(F);

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn optional(&self, key: &str) -> Option<String> {
        match (self.0)(key) {
            Some(value) if !value.trim().is_empty() => Some(value),
            _ => {
                debug!("{key} not set");
                None
            }
        }
    }

    fn try_load<T: FromStr>(&self, key: &str, default: &str) -> PollResult<T>
    where
        T::Err: Display,
    {
        let raw = self.optional(key).unwrap_or_else(|| {
            info!("{key} not set, using default: {default}");
            default.to_owned()
        });
        parse(key, &raw)
    }

    /// A zero interval, window or timeout is always a mistake.
    fn duration(&self, key: &str, default: &str, unit: fn(u64) -> Duration) -> PollResult<Duration> {
        match self.try_load::<u64>(key, default)? {
            0 => Err(PollError::Fatal(format!("{key} must be greater than zero"))),
            value => Ok(unit(value)),
        }
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> PollResult<T>
where
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e| PollError::Fatal(format!("Invalid {key} value {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rejects_garbage_as_fatal() {
        let err = parse::<u16>("PORT", "eighty").unwrap_err();
        assert!(matches!(err, PollError::Fatal(_)));
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let pairs: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| {
            pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        }
    }

    #[test]
    fn defaults_apply_to_unset_keys() {
        let config = Config::from_vars(vars(&[("JWT_SECRET", "s"), ("VOTE_RATE_MAX", "7")])).unwrap();
        assert_eq!(config.vote_rate.max, 7);
        assert_eq!(config.vote_rate.window, Duration::from_secs(10));
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.database_url, None);
    }

    #[test]
    fn zero_durations_are_fatal() {
        for key in [
            "SWEEP_INTERVAL_SECS",
            "VOTE_RATE_WINDOW_MS",
            "API_RATE_WINDOW_MS",
            "IO_TIMEOUT_MS",
            "CACHE_TTL_ACTIVE_SECS",
        ] {
            let err = Config::from_vars(vars(&[("JWT_SECRET", "s"), (key, "0")])).unwrap_err();
            assert!(matches!(err, PollError::Fatal(ref message) if message.contains(key)), "{key}");
        }
    }

    #[test]
    fn missing_secret_is_fatal() {
        assert!(matches!(
            Config::from_vars(vars(&[])),
            Err(PollError::Fatal(_))
        ));
    }

    #[test]
    fn local_config_keeps_vote_bucket_tighter_than_api() {
        let config = Config::local("secret");
        assert!(config.vote_rate.max < config.api_rate.max);
        assert!(config.vote_rate.window <= config.api_rate.window);
    }
}
