// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tilt Level Contributors 2024.

//! Standard error codes used at HIL boundaries.

/// Enumeration of the errors a hardware layer or capsule can report.
///
/// Error codes are only used at synchronous call boundaries (for example, a
/// refused transfer submission). Cross-capsule failure of an asynchronous
/// operation is modelled as a distinct callback, never as an error return
/// threaded through a callback chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(usize)]
pub enum ErrorCode {
    /// Generic failure condition.
    FAIL = 1,
    /// Underlying system is busy; retry.
    BUSY = 2,
    /// The state requested is already set.
    ALREADY = 3,
    /// The component is powered down.
    OFF = 4,
    /// Reservation required before use.
    RESERVE = 5,
    /// An invalid parameter was passed.
    INVAL = 6,
    /// Parameter passed was too large.
    SIZE = 7,
    /// Operation cancelled by a call.
    CANCEL = 8,
    /// Memory required not available.
    NOMEM = 9,
    /// Operation is not supported.
    NOSUPPORT = 10,
    /// Device is not available.
    NODEVICE = 11,
    /// Device is not physically installed.
    UNINSTALLED = 12,
    /// Packet transmission not acknowledged.
    NOACK = 13,
}
