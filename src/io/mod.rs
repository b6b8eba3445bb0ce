// src/io/mod.rs
//
// Device IO. SocketCAN is the only transport.

pub mod socketcan;
