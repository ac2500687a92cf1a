//! Compile-time defaults generated by `build.rs`
//!
//! Override with a file named by `STRAND_CONFIG_RS` at build time.

include!(concat!(env!("OUT_DIR"), "/strand_merged_config.rs"));
