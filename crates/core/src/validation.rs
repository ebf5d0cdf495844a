use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::connections::{derive_url, ConnectionDraft, ConnectionPayload, DbType};
use crate::identity::LocalId;

pub const NAME_MAX_CHARS: usize = 80;

/// Form fields in display order; the derived `Ord` decides focus order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    Name,
    DbType,
    Host,
    Port,
    Database,
    Username,
    Password,
}

impl Field {
    pub const ALL: [Self; 7] = [
        Self::Name,
        Self::DbType,
        Self::Host,
        Self::Port,
        Self::Database,
        Self::Username,
        Self::Password,
    ];

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Name => "Name",
            Self::DbType => "Type",
            Self::Host => "Host",
            Self::Port => "Port",
            Self::Database => "Database",
            Self::Username => "Username",
            Self::Password => "Password",
        }
    }

    #[must_use]
    pub fn next(self) -> Self {
        let index = Self::ALL.iter().position(|field| *field == self).unwrap_or(0);
        Self::ALL[(index + 1) % Self::ALL.len()]
    }

    #[must_use]
    pub fn previous(self) -> Self {
        let index = Self::ALL.iter().position(|field| *field == self).unwrap_or(0);
        Self::ALL[(index + Self::ALL.len() - 1) % Self::ALL.len()]
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldErrorKind {
    #[error("is required")]
    Required,
    #[error("must be at most {max} characters")]
    TooLong { max: usize },
    #[error("must be a whole number")]
    NotAnInteger,
    #[error("must be between 1 and 65535 (got {value})")]
    OutOfRange { value: i64 },
    #[error("is already used by another connection")]
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field} {kind}")]
pub struct FieldError {
    pub field: Field,
    pub kind: FieldErrorKind,
}

/// Field-scoped errors, one per field, ordered by form position.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValidationReport {
    errors: BTreeMap<Field, FieldErrorKind>,
}

impl ValidationReport {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn error(&self, field: Field) -> Option<&FieldErrorKind> {
        self.errors.get(&field)
    }

    /// Field that receives focus on a blocked submit.
    #[must_use]
    pub fn first_invalid(&self) -> Option<Field> {
        self.errors.keys().next().copied()
    }

    pub fn insert(&mut self, field: Field, kind: FieldErrorKind) {
        self.errors.entry(field).or_insert(kind);
    }

    pub fn errors(&self) -> impl Iterator<Item = FieldError> + '_ {
        self.errors.iter().map(|(field, kind)| FieldError {
            field: *field,
            kind: kind.clone(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Parses the port text. Empty means the type default; anything else must be
/// an integer in range.
pub fn coerce_port(raw: &str, db_type: DbType) -> Result<Option<u16>, FieldErrorKind> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(db_type.default_port());
    }

    let value = trimmed
        .parse::<i64>()
        .map_err(|_| FieldErrorKind::NotAnInteger)?;
    u16::try_from(value)
        .ok()
        .filter(|port| *port >= 1)
        .map(Some)
        .ok_or(FieldErrorKind::OutOfRange { value })
}

/// Structural and cross-field rules. Returns the normalized payload when the
/// draft is valid.
pub fn validate_draft(draft: &ConnectionDraft) -> Result<ConnectionPayload, ValidationReport> {
    let mut report = ValidationReport::default();

    let name = draft.name.trim();
    if name.is_empty() {
        report.insert(Field::Name, FieldErrorKind::Required);
    } else if name.chars().count() > NAME_MAX_CHARS {
        report.insert(
            Field::Name,
            FieldErrorKind::TooLong {
                max: NAME_MAX_CHARS,
            },
        );
    }

    let Some(db_type) = draft.db_type else {
        report.insert(Field::DbType, FieldErrorKind::Required);
        if draft.database.trim().is_empty() {
            report.insert(Field::Database, FieldErrorKind::Required);
        }
        return Err(report);
    };

    let database = draft.database.trim();
    if database.is_empty() {
        report.insert(Field::Database, FieldErrorKind::Required);
    }

    if db_type.is_file_based() {
        if !report.is_valid() {
            return Err(report);
        }
        return Ok(ConnectionPayload {
            name: name.to_string(),
            db_type,
            host: None,
            port: None,
            database: database.to_string(),
            username: None,
            password: None,
            url: derive_url(db_type, None, None, database, None),
        });
    }

    let host = draft.host.trim();
    if host.is_empty() {
        report.insert(Field::Host, FieldErrorKind::Required);
    }
    let port = match coerce_port(&draft.port, db_type) {
        Ok(port) => port,
        Err(kind) => {
            report.insert(Field::Port, kind);
            None
        }
    };
    let username = draft.username.trim();
    if username.is_empty() {
        report.insert(Field::Username, FieldErrorKind::Required);
    }
    if draft.password.is_empty() {
        report.insert(Field::Password, FieldErrorKind::Required);
    }

    if !report.is_valid() {
        return Err(report);
    }

    Ok(ConnectionPayload {
        name: name.to_string(),
        db_type,
        host: Some(host.to_string()),
        port,
        database: database.to_string(),
        username: Some(username.to_string()),
        password: Some(draft.password.clone()),
        url: derive_url(db_type, Some(host), port, database, Some(username)),
    })
}

fn folded(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Case-insensitive name clash against saved connections. While editing, the
/// record's own entry is skipped and keeping its saved name never clashes,
/// even when another record differs from it only by case.
pub fn is_duplicate_name<'a>(
    candidate: &str,
    saved: impl IntoIterator<Item = (&'a LocalId, &'a str)>,
    editing: Option<(&LocalId, &str)>,
) -> bool {
    let candidate = folded(candidate);
    if candidate.is_empty() {
        return false;
    }
    if editing.is_some_and(|(_, original)| folded(original) == candidate) {
        return false;
    }

    let own = editing.map(|(id, _)| id);
    saved
        .into_iter()
        .filter(|(id, _)| Some(*id) != own)
        .any(|(_, name)| folded(name) == candidate)
}
