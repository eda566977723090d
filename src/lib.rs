//! Streaming download service for research compendia: exposes compendium
//! directories as ZIP or TAR(.gz) archives over HTTP, materializing the
//! associated container image on demand before the first archive that
//! includes it.

pub mod archive;
pub mod config;
pub mod engine;
pub mod server;
pub mod store;
