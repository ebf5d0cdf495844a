pub mod api;
pub mod cache;
pub mod config;
pub mod connection_manager;
pub mod connections;
pub mod credentials;
pub mod dashboard;
pub mod debounce;
pub mod fencing;
pub mod health;
pub mod history;
pub mod identity;
pub mod notices;
pub mod optimistic;
pub mod query_builder;
pub mod reports;
pub mod schema;
pub mod store;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support;

#[must_use]
pub fn domain_name() -> &'static str {
    "repdash-core"
}
