pub mod backend;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod metrics;

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
