//! End-to-end tests of installable resolution and realisation through the
//! public API.

mod common;
mod flake_tests;
mod realise_tests;
