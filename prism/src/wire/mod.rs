//! Bit-exact layout of everything that crosses the wire. All integers are
//! little-endian and structs are packed; every type carries an explicit
//! `encode`/`decode` pair and a `SIZE` constant instead of aliasing bytes.

pub mod geometry;
pub mod tcp;
pub mod udp;
