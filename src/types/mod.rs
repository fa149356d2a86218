/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types common across the subprotocols of PBFT-rs.
//!
//! Types specific to a single subprotocol live in that subprotocol's `types` module instead.

pub mod basic;

pub mod keypair;

pub mod principals;
