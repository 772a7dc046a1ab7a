//! The handle and descriptor layer of a library OS: reference-counted handles, per-process
//! descriptor tables, and a socket layer with a UNIX domain backend built on platform named
//! streams.

// modules with macros must be included before other modules
#[macro_use]
pub mod utility;

pub mod core;
pub mod host;
