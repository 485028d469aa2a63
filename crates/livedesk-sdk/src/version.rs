//! SDK 版本元信息
//!
//! SDK Version 的唯一权威源是 Cargo.toml，禁止手写版本号。

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
