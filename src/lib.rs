//! Sandbox adapter facade and embedded script evaluator for agent tooling.
//!
//! [`sandbox`] gives agents one API over interchangeable sandbox providers;
//! [`script`] runs small Lua programs under a deadline with a restricted
//! standard library.

pub mod config;
pub mod sandbox;
pub mod script;
