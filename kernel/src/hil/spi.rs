// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tilt Level Contributors 2024.

//! Interface for a SPI master controller.
//!
//! The controller performs full-duplex transfers without blocking: a call
//! to [`SpiMaster::read_write_bytes`] starts the transfer and returns, and
//! the controller's interrupt path invokes
//! [`SpiMasterClient::read_write_done`] once the last byte has clocked
//! out. Buffer ownership moves with the transfer: the controller holds
//! both buffers while it is busy and returns them through the completion
//! callback (or through [`SpiMaster::abort_transfer`]).
//!
//! Chip select is not handled at this layer; whoever serializes access to
//! the bus drives the select line of the addressed device around each
//! transfer.

use crate::ErrorCode;

/// Client of a SPI master controller.
pub trait SpiMasterClient {
    /// Called when a read/write operation finishes.
    fn read_write_done(
        &self,
        write_buffer: &'static mut [u8],
        read_buffer: Option<&'static mut [u8]>,
        len: usize,
        status: Result<(), ErrorCode>,
    );
}

/// A SPI master controller performing interrupt-driven transfers.
pub trait SpiMaster<'a> {
    /// Registers the completion client.
    fn set_client(&self, client: &'a dyn SpiMasterClient);

    /// Whether a transfer is currently in flight.
    fn is_busy(&self) -> bool;

    /// Starts a full-duplex transfer of `len` bytes.
    ///
    /// Writes `len` bytes of `write_buffer` out the bus while reading into
    /// `read_buffer` if one is given (both buffers must hold at least
    /// `len` bytes). On refusal the buffers are handed back in the error.
    fn read_write_bytes(
        &self,
        write_buffer: &'static mut [u8],
        read_buffer: Option<&'static mut [u8]>,
        len: usize,
    ) -> Result<
        (),
        (
            ErrorCode,
            &'static mut [u8],
            Option<&'static mut [u8]>,
        ),
    >;

    /// Terminates an in-flight transfer, returning the buffers that were
    /// handed to `read_write_bytes`. After an abort no completion callback
    /// is delivered for the aborted transfer. Returns `None` if no
    /// transfer was in flight.
    fn abort_transfer(&self) -> Option<(&'static mut [u8], Option<&'static mut [u8]>)>;
}
