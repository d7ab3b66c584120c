//! Cross-crate integration tests for Cadenza

#[cfg(test)]
mod editor_integration;
