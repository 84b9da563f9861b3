// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tilt Level Contributors 2024.

//! Hand-written hardware fakes shared by the capsule unit tests.

use core::cell::Cell;

use kernel::hil::gpio;
use kernel::hil::spi::{SpiMaster, SpiMasterClient};
use kernel::hil::time::{Alarm, AlarmClient, Freq1KHz, Ticks, Ticks32, Time};
use kernel::utilities::cells::{NumericCellExt, OptionalCell, TakeCell};
use kernel::ErrorCode;

use std::boxed::Box;
use std::vec;

/// Leaks a zeroed buffer so it satisfies the HIL's `'static` bound.
pub(crate) fn leak_buffer(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

/// A hardware alarm the test advances by hand.
pub(crate) struct FakeAlarm<'a> {
    now: Cell<u32>,
    reference: Cell<u32>,
    dt: Cell<u32>,
    armed: Cell<bool>,
    client: OptionalCell<&'a dyn AlarmClient>,
}

impl FakeAlarm<'_> {
    pub fn new() -> Self {
        FakeAlarm {
            now: Cell::new(0),
            reference: Cell::new(0),
            dt: Cell::new(0),
            armed: Cell::new(false),
            client: OptionalCell::empty(),
        }
    }

    /// The programmed dt in ticks, if the alarm is armed.
    pub fn armed_dt(&self) -> Option<u32> {
        if self.armed.get() {
            Some(self.dt.get())
        } else {
            None
        }
    }

    /// Fast-forwards time to just past the programmed expiry and delivers
    /// the callback, as the compare interrupt would.
    pub fn trigger(&self) {
        assert!(self.armed.get(), "trigger on a disarmed alarm");
        self.now.set(
            self.reference
                .get()
                .wrapping_add(self.dt.get())
                .wrapping_add(1),
        );
        self.armed.set(false);
        self.client.map(|client| client.alarm());
    }
}

impl Time for FakeAlarm<'_> {
    type Frequency = Freq1KHz;
    type Ticks = Ticks32;

    fn now(&self) -> Ticks32 {
        Ticks32::from(self.now.get())
    }
}

impl<'a> Alarm<'a> for FakeAlarm<'a> {
    fn set_alarm_client(&self, client: &'a dyn AlarmClient) {
        self.client.set(client);
    }

    fn set_alarm(&self, reference: Self::Ticks, dt: Self::Ticks) {
        self.reference.set(reference.into_u32());
        self.dt.set(dt.into_u32());
        self.armed.set(true);
    }

    fn get_alarm(&self) -> Self::Ticks {
        Ticks32::from(self.reference.get().wrapping_add(self.dt.get()))
    }

    fn disarm(&self) -> Result<(), ErrorCode> {
        self.armed.set(false);
        Ok(())
    }

    fn is_armed(&self) -> bool {
        self.armed.get()
    }

    fn minimum_dt(&self) -> Self::Ticks {
        Ticks32::from(0)
    }
}

/// A chip-select pin recording its level.
pub(crate) struct FakePin {
    level: Cell<bool>,
    selects: Cell<usize>,
}

impl FakePin {
    pub fn new() -> Self {
        // Deselected (high) out of reset, matching board pin setup.
        FakePin {
            level: Cell::new(true),
            selects: Cell::new(0),
        }
    }

    pub fn is_high(&self) -> bool {
        self.level.get()
    }

    /// How many times the pin was driven low.
    pub fn selects(&self) -> usize {
        self.selects.get()
    }
}

impl gpio::Output for FakePin {
    fn set(&self) {
        self.level.set(true);
    }

    fn clear(&self) {
        self.level.set(false);
        self.selects.increment();
    }

    fn toggle(&self) -> bool {
        let new = !self.level.get();
        self.level.set(new);
        new
    }
}

const FAKE_SPI_MAX: usize = 16;

/// A SPI controller the test completes by hand.
///
/// Starting a transfer while one is already in flight panics, so every
/// arbiter test doubles as a bus mutual-exclusion check.
pub(crate) struct FakeSpi<'a> {
    client: OptionalCell<&'a dyn SpiMasterClient>,
    tx: TakeCell<'static, [u8]>,
    rx: TakeCell<'static, [u8]>,
    len: Cell<usize>,
    busy: Cell<bool>,
    starts: Cell<usize>,
    aborts: Cell<usize>,
    last_tx: Cell<[u8; FAKE_SPI_MAX]>,
    response: Cell<[u8; FAKE_SPI_MAX]>,
}

impl FakeSpi<'_> {
    pub fn new() -> Self {
        FakeSpi {
            client: OptionalCell::empty(),
            tx: TakeCell::empty(),
            rx: TakeCell::empty(),
            len: Cell::new(0),
            busy: Cell::new(false),
            starts: Cell::new(0),
            aborts: Cell::new(0),
            last_tx: Cell::new([0; FAKE_SPI_MAX]),
            response: Cell::new([0; FAKE_SPI_MAX]),
        }
    }

    /// Sets the bytes the device will answer with on the next completion.
    pub fn set_response(&self, bytes: &[u8]) {
        let mut response = [0u8; FAKE_SPI_MAX];
        response[..bytes.len()].copy_from_slice(bytes);
        self.response.set(response);
    }

    /// Completes the in-flight transfer, copying the scripted response
    /// into the receive buffer and invoking the client callback.
    pub fn complete(&self) {
        assert!(self.busy.get(), "complete without a transfer in flight");
        self.busy.set(false);
        let tx = self.tx.take().unwrap();
        let len = self.len.get();
        let rx = self.rx.take().map(|buf| {
            let response = self.response.get();
            let n = len.min(buf.len()).min(FAKE_SPI_MAX);
            buf[..n].copy_from_slice(&response[..n]);
            buf
        });
        self.client
            .map(|client| client.read_write_done(tx, rx, len, Ok(())));
    }

    /// The first bytes of the most recently started transmit buffer.
    pub fn last_tx(&self) -> [u8; FAKE_SPI_MAX] {
        self.last_tx.get()
    }

    pub fn last_len(&self) -> usize {
        self.len.get()
    }

    pub fn starts(&self) -> usize {
        self.starts.get()
    }

    pub fn aborts(&self) -> usize {
        self.aborts.get()
    }
}

impl<'a> SpiMaster<'a> for FakeSpi<'a> {
    fn set_client(&self, client: &'a dyn SpiMasterClient) {
        self.client.set(client);
    }

    fn is_busy(&self) -> bool {
        self.busy.get()
    }

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
    > {
        assert!(!self.busy.get(), "two transfers in flight on one bus");
        let mut observed = [0u8; FAKE_SPI_MAX];
        let n = len.min(write_buffer.len()).min(FAKE_SPI_MAX);
        observed[..n].copy_from_slice(&write_buffer[..n]);
        self.last_tx.set(observed);
        self.len.set(len);
        self.tx.put(Some(write_buffer));
        self.rx.put(read_buffer);
        self.busy.set(true);
        self.starts.increment();
        Ok(())
    }

    fn abort_transfer(&self) -> Option<(&'static mut [u8], Option<&'static mut [u8]>)> {
        if !self.busy.get() {
            return None;
        }
        self.busy.set(false);
        self.aborts.increment();
        Some((self.tx.take().unwrap(), self.rx.take()))
    }
}

/// Counts alarm callbacks.
pub(crate) struct ClientCounter(Cell<usize>);

impl ClientCounter {
    pub fn new() -> Self {
        ClientCounter(Cell::new(0))
    }

    pub fn count(&self) -> usize {
        self.0.get()
    }
}

impl AlarmClient for ClientCounter {
    fn alarm(&self) {
        self.0.increment();
    }
}
