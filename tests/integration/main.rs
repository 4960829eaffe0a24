//! Engine integration tests

mod common;
mod conflict_tests;
mod engine_tests;
mod postgres_tests;
