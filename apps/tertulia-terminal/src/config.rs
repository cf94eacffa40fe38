//! Environment-backed configuration for `tertulia-terminal`.

use std::{env, error::Error, fmt, path::PathBuf};

use tertulia_core::{AutoReplyConfig, MAX_BODY_LEN, RuntimeConfig, ViewerContext};

const DEFAULT_USER_ID: &str = "local-user";
const DEFAULT_DISPLAY_NAME: &str = "Usuario";
const DEFAULT_DATA_DIR_ROOT: &str = "./.tertulia-store";
const DEFAULT_INITIAL_ROOM: &str = "General";
const MAX_HISTORY_LIMIT: u16 = 500;

/// Room directory offered by the front end. Other keys are accepted too.
pub const ROOMS: &[&str] = &[
    "General", "España", "Francia", "Italia", "Alemania", "Portugal", "Noticias", "Eventos",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalConfig {
    /// Identity of the person at the keyboard.
    pub viewer: ViewerContext,
    /// Root directory of the file store holding pending messages.
    pub data_dir: PathBuf,
    /// Room entered at startup.
    pub initial_room: String,
    /// Tuning forwarded to the sync runtime.
    pub runtime: RuntimeConfig,
}

impl TerminalConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let user_id = optional_trimmed_env("TERTULIA_USER_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_USER_ID.to_owned());
        let display_name = optional_trimmed_env("TERTULIA_DISPLAY_NAME", &mut lookup)
            .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_owned());
        let data_dir = optional_trimmed_env("TERTULIA_DATA_DIR", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR_ROOT));
        let initial_room = optional_trimmed_env("TERTULIA_INITIAL_ROOM", &mut lookup)
            .unwrap_or_else(|| DEFAULT_INITIAL_ROOM.to_owned());

        let defaults = RuntimeConfig::default();
        let history_limit =
            parse_or("TERTULIA_HISTORY_LIMIT", defaults.history_limit, &mut lookup)?;
        check_range("TERTULIA_HISTORY_LIMIT", history_limit, 1, MAX_HISTORY_LIMIT)?;
        let timeline_max_items = parse_or(
            "TERTULIA_TIMELINE_MAX_ITEMS",
            defaults.timeline_max_items,
            &mut lookup,
        )?;
        if timeline_max_items == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TERTULIA_TIMELINE_MAX_ITEMS",
                value: timeline_max_items.to_string(),
                reason: "must be at least 1".to_owned(),
            });
        }
        let reconcile_window_ms = parse_or(
            "TERTULIA_RECONCILE_WINDOW_MS",
            defaults.reconcile_window_ms,
            &mut lookup,
        )?;
        let max_body_len = parse_or("TERTULIA_MAX_BODY_LEN", defaults.max_body_len, &mut lookup)?;
        check_range("TERTULIA_MAX_BODY_LEN", max_body_len, 1, MAX_BODY_LEN)?;

        let auto_reply = if parse_bool_or("TERTULIA_AUTO_REPLY", true, &mut lookup)? {
            Some(auto_reply_from_lookup(&mut lookup)?)
        } else {
            None
        };

        Ok(Self {
            viewer: ViewerContext::new(user_id, display_name),
            data_dir,
            initial_room,
            runtime: RuntimeConfig {
                history_limit,
                timeline_max_items,
                reconcile_window_ms,
                max_body_len,
                auto_reply,
            },
        })
    }

    /// Namespace for this viewer's keys in the shared file store.
    pub fn store_namespace(&self) -> String {
        format!("user-{}", self.viewer.user_id)
    }
}

fn auto_reply_from_lookup<F>(lookup: &mut F) -> Result<AutoReplyConfig, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let defaults = AutoReplyConfig::default();
    let trigger = optional_trimmed_env("TERTULIA_AUTO_REPLY_TRIGGER", lookup)
        .unwrap_or(defaults.trigger.clone());
    let min_delay_ms = parse_or(
        "TERTULIA_AUTO_REPLY_MIN_DELAY_MS",
        defaults.min_delay_ms,
        lookup,
    )?;
    let max_delay_ms = parse_or(
        "TERTULIA_AUTO_REPLY_MAX_DELAY_MS",
        defaults.max_delay_ms,
        lookup,
    )?;
    if min_delay_ms > max_delay_ms {
        return Err(ConfigError::InvalidValue {
            key: "TERTULIA_AUTO_REPLY_MIN_DELAY_MS",
            value: min_delay_ms.to_string(),
            reason: format!("must not exceed TERTULIA_AUTO_REPLY_MAX_DELAY_MS ({max_delay_ms})"),
        });
    }

    Ok(AutoReplyConfig {
        trigger,
        min_delay_ms,
        max_delay_ms,
        ..defaults
    })
}

/// Errors produced while parsing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed or is out of range.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_bool_or<F>(key: &'static str, default: bool, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected true or false".to_owned(),
        }),
    }
}

fn check_range<T>(key: &'static str, value: T, min: T, max: T) -> Result<(), ConfigError>
where
    T: PartialOrd + fmt::Display,
{
    if value < min || value > max {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: format!("must be between {min} and {max}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<TerminalConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        TerminalConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_the_runtime_defaults() {
        let cfg = config_from_pairs(&[]).expect("empty environment should parse");

        assert_eq!(cfg.viewer, ViewerContext::new("local-user", "Usuario"));
        assert_eq!(cfg.data_dir, PathBuf::from("./.tertulia-store"));
        assert_eq!(cfg.initial_room, "General");
        assert_eq!(cfg.runtime, RuntimeConfig::default());
        assert_eq!(cfg.store_namespace(), "user-local-user");
    }

    #[test]
    fn parses_identity_and_tuning() {
        let cfg = config_from_pairs(&[
            ("TERTULIA_USER_ID", " u-42 "),
            ("TERTULIA_DISPLAY_NAME", "María"),
            ("TERTULIA_DATA_DIR", "/tmp/tertulia"),
            ("TERTULIA_INITIAL_ROOM", "España"),
            ("TERTULIA_HISTORY_LIMIT", "50"),
            ("TERTULIA_TIMELINE_MAX_ITEMS", "300"),
            ("TERTULIA_RECONCILE_WINDOW_MS", "5000"),
            ("TERTULIA_MAX_BODY_LEN", "280"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.viewer.user_id, "u-42");
        assert_eq!(cfg.viewer.display_name, "María");
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/tertulia"));
        assert_eq!(cfg.initial_room, "España");
        assert_eq!(cfg.runtime.history_limit, 50);
        assert_eq!(cfg.runtime.timeline_max_items, 300);
        assert_eq!(cfg.runtime.reconcile_window_ms, 5_000);
        assert_eq!(cfg.runtime.max_body_len, 280);
    }

    #[test]
    fn auto_reply_can_be_tuned_or_disabled() {
        let cfg = config_from_pairs(&[
            ("TERTULIA_AUTO_REPLY_TRIGGER", "@asistente"),
            ("TERTULIA_AUTO_REPLY_MIN_DELAY_MS", "10"),
            ("TERTULIA_AUTO_REPLY_MAX_DELAY_MS", "20"),
        ])
        .expect("config should parse");
        let auto = cfg.runtime.auto_reply.expect("auto reply enabled by default");
        assert_eq!(auto.trigger, "@asistente");
        assert_eq!((auto.min_delay_ms, auto.max_delay_ms), (10, 20));
        assert_eq!(auto.author.id, "bot");

        let cfg = config_from_pairs(&[("TERTULIA_AUTO_REPLY", "off")]).expect("config should parse");
        assert!(cfg.runtime.auto_reply.is_none());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = config_from_pairs(&[("TERTULIA_HISTORY_LIMIT", "0")])
            .expect_err("zero history limit must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "TERTULIA_HISTORY_LIMIT",
                ..
            }
        ));

        let err = config_from_pairs(&[("TERTULIA_MAX_BODY_LEN", "501")])
            .expect_err("body cap above 500 must fail");
        assert_eq!(
            err.to_string(),
            "invalid TERTULIA_MAX_BODY_LEN='501': must be between 1 and 500"
        );

        let err = config_from_pairs(&[("TERTULIA_TIMELINE_MAX_ITEMS", "0")])
            .expect_err("zero cap must fail");
        assert_eq!(
            err.to_string(),
            "invalid TERTULIA_TIMELINE_MAX_ITEMS='0': must be at least 1"
        );
    }

    #[test]
    fn rejects_unparseable_values() {
        let err = config_from_pairs(&[("TERTULIA_RECONCILE_WINDOW_MS", "soon")])
            .expect_err("non-numeric window must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "TERTULIA_RECONCILE_WINDOW_MS",
                ..
            }
        ));

        let err = config_from_pairs(&[("TERTULIA_AUTO_REPLY", "maybe")])
            .expect_err("non-boolean flag must fail");
        assert!(err.to_string().contains("expected true or false"));
    }

    #[test]
    fn rejects_inverted_reply_delays() {
        let err = config_from_pairs(&[
            ("TERTULIA_AUTO_REPLY_MIN_DELAY_MS", "5000"),
            ("TERTULIA_AUTO_REPLY_MAX_DELAY_MS", "100"),
        ])
        .expect_err("min above max must fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "TERTULIA_AUTO_REPLY_MIN_DELAY_MS",
                ..
            }
        ));
    }

    #[test]
    fn room_directory_starts_with_default_room() {
        assert_eq!(ROOMS.first().copied(), Some(DEFAULT_INITIAL_ROOM));
        assert_eq!(ROOMS.len(), 8);
    }
}
