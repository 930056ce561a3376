use crate::error::AppError;
use std::{env, path::PathBuf, time::Duration};
use teloxide::types::{ChatId, UserId};

const DEFAULT_MIRRORS: &str = "https://libgen.is,https://libgen.rs";
const DEFAULT_SESSION_TTL_SECS: u64 = 60 * 60;
const DEFAULT_UPLOAD_LIMIT_MB: u64 = 50;

#[derive(Clone, Debug)]
pub struct KeepAlive {
    pub url: String,
    pub interval: Duration,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub admins: Vec<UserId>,
    pub log_channel: ChatId,
    pub db_channel: ChatId,
    pub file_store_channels: Vec<ChatId>,
    pub public_file_store: bool,
    /// Base URL of the web shortcut page, present only when `WEBSITE_URL_MODE` is on.
    pub website_url: Option<String>,
    pub auto_delete: Option<Duration>,
    /// `None` keeps search sessions for the lifetime of the process.
    pub session_ttl: Option<Duration>,
    pub keepalive: Option<KeepAlive>,
    pub libgen_mirrors: Vec<String>,
    pub libgen_send_by_url: bool,
    /// Largest file the bot will try to upload; 50 MB unless a local Bot API server lifts it.
    pub upload_limit: u64,
    pub ytdlp_cookies: Option<PathBuf>,
    pub ytdlp_player_client: String,
    pub ytdlp_force_ipv4: bool,
    pub data_dir: PathBuf,
    pub download_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let admins = parse_list::<u64>("ADMINS", get("ADMINS"))?
            .into_iter()
            .map(UserId)
            .collect();
        let log_channel = ChatId(required("LOG_CHANNEL", get("LOG_CHANNEL"))?);
        let db_channel = ChatId(required("DB_CHANNEL", get("DB_CHANNEL"))?);
        let file_store_channels = parse_list::<i64>("FILE_STORE_CHANNEL", get("FILE_STORE_CHANNEL"))?
            .into_iter()
            .map(ChatId)
            .collect();

        let website_url = if parse_bool("WEBSITE_URL_MODE", get("WEBSITE_URL_MODE"))? {
            Some(
                get("WEBSITE_URL")
                    .ok_or(AppError::Config {
                        key: "WEBSITE_URL",
                        reason: "required when WEBSITE_URL_MODE is enabled".into(),
                    })?
                    .trim_end_matches('/')
                    .to_string(),
            )
        } else {
            None
        };

        let auto_delete = optional::<u64>("AUTO_DELETE_TIME", get("AUTO_DELETE_TIME"))?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let session_ttl = match optional::<u64>("SESSION_TTL", get("SESSION_TTL"))? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(Duration::from_secs(DEFAULT_SESSION_TTL_SECS)),
        };

        let keepalive = match (
            optional::<u64>("PING_INTERVAL", get("PING_INTERVAL"))?,
            get("URL"),
        ) {
            (Some(secs), Some(url)) if secs > 0 => Some(KeepAlive {
                url,
                interval: Duration::from_secs(secs),
            }),
            _ => None,
        };

        let libgen_mirrors = get("LIBGEN_MIRRORS")
            .unwrap_or_else(|| DEFAULT_MIRRORS.to_string())
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|m| !m.is_empty())
            .map(|m| m.trim_end_matches('/').to_string())
            .collect::<Vec<_>>();
        if libgen_mirrors.is_empty() {
            return Err(AppError::Config {
                key: "LIBGEN_MIRRORS",
                reason: "at least one mirror is required".into(),
            });
        }

        Ok(Self {
            admins,
            log_channel,
            db_channel,
            file_store_channels,
            public_file_store: parse_bool("PUBLIC_FILE_STORE", get("PUBLIC_FILE_STORE"))?,
            website_url,
            auto_delete,
            session_ttl,
            keepalive,
            libgen_mirrors,
            libgen_send_by_url: parse_bool("LIBGEN_SEND_BY_URL", get("LIBGEN_SEND_BY_URL"))?,
            upload_limit: optional::<u64>("UPLOAD_LIMIT_MB", get("UPLOAD_LIMIT_MB"))?
                .unwrap_or(DEFAULT_UPLOAD_LIMIT_MB)
                * 1024
                * 1024,
            ytdlp_cookies: get("YTDLP_COOKIES").map(PathBuf::from),
            ytdlp_player_client: get("YTDLP_PLAYER_CLIENT").unwrap_or_else(|| "android".to_string()),
            ytdlp_force_ipv4: parse_bool("YTDLP_FORCE_IPV4", get("YTDLP_FORCE_IPV4"))?,
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("data")),
            download_dir: get("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("downloads")),
        })
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        self.admins.contains(&user)
    }

    pub fn is_file_store(&self, chat: ChatId) -> bool {
        self.file_store_channels.contains(&chat)
    }

    pub fn can_store_files(&self, user: Option<UserId>) -> bool {
        self.public_file_store || user.is_some_and(|u| self.is_admin(u))
    }

    /// Destination for deduplicated archive copies.
    pub fn archive_channel(&self) -> Option<ChatId> {
        self.file_store_channels.first().copied()
    }
}

fn required<T: std::str::FromStr>(key: &'static str, value: Option<String>) -> Result<T, AppError> {
    optional(key, value)?.ok_or(AppError::Config {
        key,
        reason: "missing".into(),
    })
}

fn optional<T: std::str::FromStr>(key: &'static str, value: Option<String>) -> Result<Option<T>, AppError> {
    value
        .map(|raw| {
            raw.parse::<T>().map_err(|_| AppError::Config {
                key,
                reason: format!("cannot parse {raw:?}"),
            })
        })
        .transpose()
}

fn parse_list<T: std::str::FromStr>(key: &'static str, value: Option<String>) -> Result<Vec<T>, AppError> {
    let Some(raw) = value else {
        return Ok(Vec::new());
    };
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<T>().map_err(|_| AppError::Config {
                key,
                reason: format!("cannot parse list item {part:?}"),
            })
        })
        .collect()
}

fn parse_bool(key: &'static str, value: Option<String>) -> Result<bool, AppError> {
    match value.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(false),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(AppError::Config {
            key,
            reason: format!("expected a boolean, got {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn minimal() -> Vec<(&'static str, &'static str)> {
        vec![
            ("ADMINS", "11 22,33"),
            ("LOG_CHANNEL", "-1001"),
            ("DB_CHANNEL", "-1002"),
        ]
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = Config::from_lookup(lookup(&minimal())).unwrap();
        assert_eq!(config.admins, vec![UserId(11), UserId(22), UserId(33)]);
        assert_eq!(config.log_channel, ChatId(-1001));
        assert_eq!(config.session_ttl, Some(Duration::from_secs(3600)));
        assert!(config.auto_delete.is_none());
        assert!(config.keepalive.is_none());
        assert_eq!(config.libgen_mirrors.len(), 2);
        assert!(!config.public_file_store);
        assert_eq!(config.upload_limit, 50 * 1024 * 1024);
    }

    #[test]
    fn missing_log_channel_names_the_key() {
        let err = Config::from_lookup(lookup(&[("DB_CHANNEL", "-1")])).unwrap_err();
        assert!(matches!(err, AppError::Config { key: "LOG_CHANNEL", .. }));
    }

    #[test]
    fn zero_ttl_disables_expiry_and_zero_auto_delete_disables_deletion() {
        let mut pairs = minimal();
        pairs.push(("SESSION_TTL", "0"));
        pairs.push(("AUTO_DELETE_TIME", "0"));
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert!(config.session_ttl.is_none());
        assert!(config.auto_delete.is_none());
    }

    #[test]
    fn website_mode_requires_url() {
        let mut pairs = minimal();
        pairs.push(("WEBSITE_URL_MODE", "true"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
        pairs.push(("WEBSITE_URL", "https://example.org/"));
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.website_url.as_deref(), Some("https://example.org"));
    }

    #[test]
    fn file_store_permissions() {
        let mut pairs = minimal();
        pairs.push(("FILE_STORE_CHANNEL", "-1005 -1006"));
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert!(config.is_file_store(ChatId(-1006)));
        assert_eq!(config.archive_channel(), Some(ChatId(-1005)));
        assert!(config.can_store_files(Some(UserId(22))));
        assert!(!config.can_store_files(Some(UserId(99))));
        assert!(!config.can_store_files(None));
    }

    #[test]
    fn rejects_bad_boolean() {
        let mut pairs = minimal();
        pairs.push(("PUBLIC_FILE_STORE", "maybe"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
    }
}
