//! Configuration store.
//!
//! Settings are `(key, scope) -> value` rows. Framework-wide keys live in the
//! global scope; module settings live under the module's package name.

pub mod keys;
pub mod store;

pub use keys::GLOBAL_SCOPE;
pub use store::{Setting, SettingsStore};
