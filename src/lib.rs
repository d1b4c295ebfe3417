//! Cross-crate integration tests for the poolkit workspace live in `tests/`.
