pub mod credentials;
pub mod export;
pub mod http;
pub mod mock;

#[must_use]
pub fn adapter_name() -> &'static str {
    "repdash-adapters"
}
