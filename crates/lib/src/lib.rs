//! nbuild-lib: orchestration engine for building native library stacks from source.
//!
//! The crate is organised leaves first:
//! - `recipe` / `project`: declarative build descriptions and the registered project record
//! - `registry` / `graph`: name index, dependency validation and build ordering
//! - `fetch` / `patch`: source acquisition, integrity checks and patch application
//! - `builder` / `hooks` / `context`: toolchain adapters, per-project extension points and
//!   the layered build environment
//! - `orchestrate` / `install`: the driver loop and the installed artifact manifest

pub mod builder;
pub mod config;
pub mod consts;
pub mod context;
pub mod fetch;
pub mod graph;
pub mod hooks;
pub mod install;
pub mod lock;
pub mod orchestrate;
pub mod outdated;
pub mod patch;
pub mod platform;
pub mod process;
pub mod project;
pub mod recipe;
pub mod registry;
pub mod util;
