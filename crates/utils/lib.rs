//! Byte, hashing and HTTP-scanning helpers shared by the WebSocket layer

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bytes;
pub mod crypto;
pub mod parsing;
