//! Workspace root package.
//!
//! Exists to host repository-wide tooling (git hooks via cargo-husky); the
//! functional crates live under `crates/`.
