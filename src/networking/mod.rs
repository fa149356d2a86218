//! PBFT-rs' interface into pluggable peer-to-peer networking.

pub mod network;

pub(crate) mod receiving;

pub(crate) mod sending;
