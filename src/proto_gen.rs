//! Generated protobuf types for the host wire protocol.
//!
//! The `.proto` schema lives at `proto/host.proto` and is compiled by
//! `build.rs` via `prost-build`, mirroring how the corpus's own generated
//! protocol crates are produced from `.proto` sources.

pub mod host {
    include!(concat!(env!("OUT_DIR"), "/host.rs"));
}
