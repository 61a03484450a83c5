//! Bluetooth Mesh decoder: key derivation, network and upper transport
//! decryption, and segment reassembly for captured mesh traffic.

pub mod config;
pub mod error;
pub mod mesh;
pub mod report;
pub mod trace;
pub mod udp;
