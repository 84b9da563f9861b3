// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tilt Level Contributors 2024.

//! Compile-time configuration.
//!
//! Boards select configuration by enabling cargo features on this crate, as
//! explained in the crate manifest. Fields are read through the `CONFIG`
//! constant so disabled paths constant-fold away.

/// Global compile-time configuration struct.
pub struct Config {
    /// Whether the SPI arbiter logs every transfer start, completion, and
    /// timeout through `debug!`. Off by default; enable with the
    /// `trace_bus` feature when bringing up a board.
    pub trace_bus: bool,

    /// Whether fatal assertions carry a formatted message. Disabling this
    /// (feature `no_debug_panics`) meaningfully shrinks the binary on
    /// flash-constrained parts at the cost of anonymous panics.
    pub debug_panics: bool,
}

/// The global configuration constant. Values are driven by cargo features.
pub const CONFIG: Config = Config {
    trace_bus: cfg!(feature = "trace_bus"),
    debug_panics: !cfg!(feature = "no_debug_panics"),
};
