//! Bundle CLI - loads an OCI source bundle into a directory.

pub mod commands;
