//! Process-level glue: binding and spawning the configured listeners.

pub mod listeners;
