pub mod canon;
pub mod config;
pub mod damage;
pub mod db;
pub mod densemap;
pub mod depfile;
pub mod entry;
pub mod error;
pub mod fs;
pub mod generate;
pub mod graph;
pub mod ipc;
pub mod load;
mod logging;
pub mod master;
pub mod message;
pub mod progress;
pub mod run;
pub mod scanner;
pub mod show;
pub mod showincludes;
pub mod signal;
pub mod store;
pub mod trace;
pub mod tree;
pub mod worker;

#[cfg(not(any(windows, target_arch = "wasm32")))]
use jemallocator::Jemalloc;

#[cfg(not(any(windows, target_arch = "wasm32")))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
