//! Purpose: Shared core library crate used by the `scriptworker` CLI and tests.
//! Exports: `core` (script execution, path guard, cache, plugins, errors) and `api`.
//! Role: Internal library backing the binary; not yet a stable public SDK.
//! Invariants: All script/plugin execution goes through `core::dispatch::Worker`.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
pub mod serve;
