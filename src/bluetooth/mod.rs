//! Bluetooth layer: address types, the transport contract and its BlueZ
//! implementation.

pub mod address;
pub mod rfcomm;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;
