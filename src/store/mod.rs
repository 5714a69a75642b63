//! Typed accessors over the host document store and secret vault.

pub mod accounts;
pub mod processed;
pub mod registry;
pub mod settings;

pub const ACCOUNTS: &str = "accounts";
pub const PROCESSED: &str = "processed";
pub const SETTINGS: &str = "settings";
pub const USERS: &str = "users";
