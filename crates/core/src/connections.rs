use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::identity::{ConnectionIdentity, LocalId};

const SQLITE_URL_PREFIX: &str = "sqlite:///";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DbType {
    Sqlite,
    Postgres,
    Mysql,
    Mssql,
}

impl DbType {
    pub const ALL: [Self; 4] = [Self::Sqlite, Self::Postgres, Self::Mysql, Self::Mssql];

    #[must_use]
    pub fn default_port(self) -> Option<u16> {
        match self {
            Self::Sqlite => None,
            Self::Postgres => Some(5432),
            Self::Mysql => Some(3306),
            Self::Mssql => Some(1433),
        }
    }

    #[must_use]
    pub fn is_file_based(self) -> bool {
        matches!(self, Self::Sqlite)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Mssql => "mssql",
        }
    }

    fn url_scheme(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgresql",
            Self::Mysql => "mysql",
            Self::Mssql => "mssql",
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported database type `{0}`")]
pub struct UnknownDbType(String);

impl FromStr for DbType {
    type Err = UnknownDbType;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" => Ok(Self::Mysql),
            "mssql" | "sqlserver" => Ok(Self::Mssql),
            other => Err(UnknownDbType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Connected,
    Failed,
}

/// A saved connection as held by the store and mirrored into the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionRecord {
    #[serde(flatten)]
    pub identity: ConnectionIdentity,
    pub name: String,
    pub db_type: DbType,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(alias = "database_path", alias = "databasePath")]
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Lives in the credential vault, never in the cache blob.
    #[serde(skip)]
    pub password: Option<String>,
    pub url: String,
    #[serde(default)]
    pub status: ConnectionStatus,
    #[serde(default)]
    pub last_latency_ms: Option<u64>,
    #[serde(default)]
    pub last_connected: Option<DateTime<Utc>>,
}

impl ConnectionRecord {
    /// Builds a fresh record from a payload that already passed validation.
    #[must_use]
    pub fn from_payload(identity: ConnectionIdentity, payload: &ConnectionPayload) -> Self {
        Self {
            identity,
            name: payload.name.clone(),
            db_type: payload.db_type,
            host: payload.host.clone(),
            port: payload.port,
            database: payload.database.clone(),
            username: payload.username.clone(),
            password: payload.password.clone(),
            url: payload.url.clone(),
            status: ConnectionStatus::Unknown,
            last_latency_ms: None,
            last_connected: None,
        }
    }

    #[must_use]
    pub fn local_id(&self) -> &LocalId {
        &self.identity.local
    }

    /// Drops fields a record of this type must not carry.
    pub fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        if self.db_type.is_file_based() {
            self.host = None;
            self.port = None;
            self.username = None;
            self.password = None;
        } else if self.port.is_none() {
            self.port = self.db_type.default_port();
        }
        self.url = derive_url(
            self.db_type,
            self.host.as_deref(),
            self.port,
            &self.database,
            self.username.as_deref(),
        );
    }

    /// File name shown for sqlite records, the database name otherwise.
    #[must_use]
    pub fn display_target(&self) -> String {
        if self.db_type.is_file_based() {
            display_filename(&self.url).unwrap_or_else(|| self.database.clone())
        } else {
            format!(
                "{}/{}",
                self.host.as_deref().unwrap_or("?"),
                self.database
            )
        }
    }
}

/// Raw form state; every field is text until validation parses it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionDraft {
    pub name: String,
    pub db_type: Option<DbType>,
    pub host: String,
    pub port: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl ConnectionDraft {
    #[must_use]
    pub fn from_record(record: &ConnectionRecord) -> Self {
        Self {
            name: record.name.clone(),
            db_type: Some(record.db_type),
            host: record.host.clone().unwrap_or_default(),
            port: record.port.map(|port| port.to_string()).unwrap_or_default(),
            database: record.database.clone(),
            username: record.username.clone().unwrap_or_default(),
            password: record.password.clone().unwrap_or_default(),
        }
    }

    #[must_use]
    pub fn signature(&self) -> FormSignature {
        FormSignature::of(self)
    }
}

/// Normalized body sent to the backend for test and save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionPayload {
    pub name: String,
    pub db_type: DbType,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub url: String,
}

/// Fingerprint of the normalized form values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FormSignature(String);

impl FormSignature {
    #[must_use]
    pub fn of(draft: &ConnectionDraft) -> Self {
        let db_type = draft.db_type;
        let file_based = db_type.is_some_and(DbType::is_file_based);
        let text = |value: &str| {
            if file_based {
                String::new()
            } else {
                value.trim().to_string()
            }
        };
        let port = if file_based {
            String::new()
        } else {
            match (draft.port.trim(), db_type.and_then(DbType::default_port)) {
                ("", Some(default_port)) => default_port.to_string(),
                (raw, _) => raw.to_string(),
            }
        };

        let password = if file_based { "" } else { draft.password.as_str() };

        let fields = json!([
            draft.name.trim(),
            db_type.map(DbType::as_str),
            text(&draft.host),
            port,
            draft.database.trim(),
            text(&draft.username),
            password,
        ]);
        Self(fields.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Tracks which form configuration was last tested and how it went.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveGate {
    tested: Option<FormSignature>,
    status: ConnectionStatus,
}

impl SaveGate {
    pub fn record_test(&mut self, signature: FormSignature, succeeded: bool) {
        self.tested = Some(signature);
        self.status = if succeeded {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Failed
        };
    }

    pub fn reset(&mut self) {
        self.tested = None;
        self.status = ConnectionStatus::Unknown;
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    #[must_use]
    pub fn can_save(&self, current: &FormSignature) -> bool {
        self.status == ConnectionStatus::Connected && self.tested.as_ref() == Some(current)
    }
}

#[must_use]
pub fn derive_url(
    db_type: DbType,
    host: Option<&str>,
    port: Option<u16>,
    database: &str,
    username: Option<&str>,
) -> String {
    if db_type.is_file_based() {
        let path = database.trim().replace('\\', "/");
        return format!("{SQLITE_URL_PREFIX}{}", path.trim_start_matches('/'));
    }

    let authority = match (username.filter(|user| !user.is_empty()), host) {
        (Some(user), Some(host)) => format!("{user}@{host}"),
        (None, Some(host)) => host.to_string(),
        (Some(user), None) => format!("{user}@"),
        (None, None) => String::new(),
    };
    let port = port
        .or_else(|| db_type.default_port())
        .map(|port| format!(":{port}"))
        .unwrap_or_default();

    format!(
        "{}://{authority}{port}/{}",
        db_type.url_scheme(),
        database.trim()
    )
}

/// Last path segment of a sqlite URL.
#[must_use]
pub fn display_filename(url: &str) -> Option<String> {
    let path = url.strip_prefix(SQLITE_URL_PREFIX)?;
    path.rsplit(['/', '\\'])
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
}
