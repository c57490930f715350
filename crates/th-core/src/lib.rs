//! Shared configuration for the termhost services.
//!
//! The configuration is a single TOML document split into `[server]`,
//! `[terminal]` and `[logging]` sections. Every field has a default so a
//! missing file, or a partial one, still yields a usable [`config::Config`].

pub mod config;
