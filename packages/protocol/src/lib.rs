//! Wire-level types shared between the build engine and the distributed
//! execution layer.
//!
//! This crate is deliberately small: it defines the content-address [`Key`],
//! the framed binary codec, and the messages that flow between coordinator,
//! workers, and peers. It performs no I/O of its own beyond encoding and
//! decoding frames on a provided stream.

mod key;

pub mod wire;

pub use key::Key;
