// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tilt Level Contributors 2024.

//! Foundation crate for the tilt-level firmware.
//!
//! This crate holds everything the driver capsules share but that is not
//! specific to any one device: the hardware interface layer (HIL) traits
//! that chip crates implement, interior-mutability cell types for the
//! single-threaded cooperative execution model, bounded collections, the
//! fixed-block allocators used for interrupt-safe storage, and the debug
//! buffer behind the `debug!` macro.
//!
//! No code in this crate performs dynamic allocation. All storage is
//! provided by the caller, typically as `&'static mut` buffers handed over
//! at board initialization.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod collections;
pub mod config;
pub mod debug;
pub mod errorcode;
pub mod hil;
pub mod utilities;

pub use errorcode::ErrorCode;
