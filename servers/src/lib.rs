//! Shared wiring for the `collector` and `processor` binaries.

pub mod app_logic;
