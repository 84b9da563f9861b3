// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tilt Level Contributors 2024.

//! Driver for the ST LIS3DSH MEMS 3-axis accelerometer on a shared SPI
//! bus.
//!
//! <https://www.st.com/resource/en/datasheet/lis3dsh.pdf>
//!
//! The driver brings the device up, proves the configuration stuck, and
//! then polls it: CTRL4 is written, read back, and compared, with up to
//! three attempts before the driver declares the part broken and enters
//! `Fault`. Once verified, a poll alarm fires every few milliseconds and
//! each fire burst-reads the six output registers in one 7-byte bus
//! transaction. The freshest sample is available through [`Lis3dsh::sample`]
//! at any time.
//!
//! All bus traffic goes through the SPI arbiter; the driver is one
//! requester among possibly many and owns a single [`Transfer`] plus the
//! two buffers loaned out with it. While a transaction is outstanding the
//! buffers are gone from the driver, which is what makes a second
//! concurrent transaction impossible to express.
//!
//! Usage
//! -----
//! ```ignore
//! // TRANSFER, TX, and RX live in static storage next to the driver.
//! let lis3dsh = Lis3dsh::new(spi_arbiter, poll_alarm, &TRANSFER, &mut TX, &mut RX);
//! TRANSFER.set_client(lis3dsh);
//! poll_alarm.set_alarm_client(lis3dsh);
//! lis3dsh.start();
//! ```

use core::cell::Cell;

use bitflags::bitflags;
use kernel::debug;
use kernel::hil::time::{Alarm, AlarmClient, ConvertTicks};
use kernel::utilities::cells::{NumericCellExt, TakeCell};
use kernel::ErrorCode;

use crate::spi_arbiter::{BusArbiter, Transfer, TransferClient};

/// Minimum length of the driver's transmit and receive buffers.
pub const BUFFER_LEN: usize = 16;

const SPI_TIMEOUT_MS: u32 = 10;
const MAX_INIT_ATTEMPTS: u8 = 3;
const POLL_INTERVAL_MS: u32 = 10;

/* Bit 7 of the address byte selects a register read. */
const LIS3DSH_READ: u8 = 0x01 << 7;

/* Register addresses */
// const LIS3DSH_OUT_T: u8 = 0x0C;
// const LIS3DSH_INFO1: u8 = 0x0D;
// const LIS3DSH_INFO2: u8 = 0x0E;
// const LIS3DSH_WHO_AM_I: u8 = 0x0F;
// const LIS3DSH_STAT: u8 = 0x18;
const LIS3DSH_CTRL4: u8 = 0x20;
// const LIS3DSH_CTRL1: u8 = 0x21;
// const LIS3DSH_CTRL2: u8 = 0x22;
// const LIS3DSH_CTRL3: u8 = 0x23;
// const LIS3DSH_CTRL5: u8 = 0x24;
// const LIS3DSH_CTRL6: u8 = 0x25;
// const LIS3DSH_STATUS: u8 = 0x27;
const LIS3DSH_OUT_X_L: u8 = 0x28;
/*
const LIS3DSH_OUT_X_H: u8 = 0x29;
const LIS3DSH_OUT_Y_L: u8 = 0x2A;
const LIS3DSH_OUT_Y_H: u8 = 0x2B;
const LIS3DSH_OUT_Z_L: u8 = 0x2C;
const LIS3DSH_OUT_Z_H: u8 = 0x2D;
*/

const CTRL4_ODR_SHIFT: u8 = 4;

bitflags! {
    /// Axis-enable and block-data-update bits of CTRL4.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Ctrl4: u8 {
        const XEN = 0b0000_0001;
        const YEN = 0b0000_0010;
        const ZEN = 0b0000_0100;
        const BDU = 0b0000_1000;
    }
}

/// Output data rate codes for CTRL4 bits 7:4.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OutputDataRate {
    PowerDown = 0,
    Hz3_125 = 1,
    Hz6_25 = 2,
    Hz12_5 = 3,
    Hz25 = 4,
    Hz50 = 5,
    Hz100 = 6,
    Hz400 = 7,
    Hz800 = 8,
    Hz1600 = 9,
}

fn ctrl4_value(rate: OutputDataRate, flags: Ctrl4) -> u8 {
    ((rate as u8) << CTRL4_ODR_SHIFT) | flags.bits()
}

/// One accelerometer sample.
///
/// At the default ±2 g full scale each component is a Q14 fixed-point
/// fraction of a g. The three components are snapshot without locking, so
/// they may come from different polls; each individual axis is always a
/// coherent low/high byte pair from a single read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reading {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum State {
    Initialising,
    Idle,
    Reading,
    Fault,
}

/// Which configuration transaction the init sequence is waiting on.
#[derive(Clone, Copy, PartialEq, Debug)]
enum InitStage {
    ConfigWrite,
    ConfigReadBack,
}

pub struct Lis3dsh<'a, A: Alarm<'a>> {
    bus: &'a dyn BusArbiter<'a>,
    alarm: &'a A,
    transfer: &'a Transfer<'a>,
    txbuffer: TakeCell<'static, [u8]>,
    rxbuffer: TakeCell<'static, [u8]>,
    state: Cell<State>,
    init_stage: Cell<InitStage>,
    init_attempts: Cell<u8>,
    ctrl4: Cell<u8>,
    x: Cell<i16>,
    y: Cell<i16>,
    z: Cell<i16>,
}

impl<'a, A: Alarm<'a>> Lis3dsh<'a, A> {
    /// Creates the driver. `transfer` must be bound to the device's
    /// chip-select pin, and the caller must register the driver as the
    /// transfer's client and the alarm's client before calling `start`.
    pub fn new(
        bus: &'a dyn BusArbiter<'a>,
        alarm: &'a A,
        transfer: &'a Transfer<'a>,
        txbuffer: &'static mut [u8],
        rxbuffer: &'static mut [u8],
    ) -> Lis3dsh<'a, A> {
        assert!(txbuffer.len() >= BUFFER_LEN && rxbuffer.len() >= BUFFER_LEN);
        Lis3dsh {
            bus,
            alarm,
            transfer,
            txbuffer: TakeCell::new(txbuffer),
            rxbuffer: TakeCell::new(rxbuffer),
            state: Cell::new(State::Initialising),
            init_stage: Cell::new(InitStage::ConfigWrite),
            init_attempts: Cell::new(0),
            ctrl4: Cell::new(ctrl4_value(
                OutputDataRate::Hz100,
                Ctrl4::XEN.union(Ctrl4::YEN).union(Ctrl4::ZEN),
            )),
            x: Cell::new(0),
            y: Cell::new(0),
            z: Cell::new(0),
        }
    }

    /// Overrides the power-up device configuration. Only meaningful
    /// before `start`.
    pub fn configure(&self, rate: OutputDataRate, flags: Ctrl4) {
        debug_assert_eq!(self.state.get(), State::Initialising);
        self.ctrl4.set(ctrl4_value(rate, flags));
    }

    /// Begins device initialisation: write CTRL4, read it back, verify.
    pub fn start(&self) {
        debug_assert_eq!(self.state.get(), State::Initialising);
        self.init_attempts.set(0);
        self.write_config();
    }

    /// Snapshot of the most recent sample, zero while initialising or
    /// faulted. See [`Reading`] for the tearing caveat.
    pub fn sample(&self) -> Reading {
        Reading {
            x: self.x.get(),
            y: self.y.get(),
            z: self.z.get(),
        }
    }

    /// Whether the driver has given up on the device.
    pub fn is_faulted(&self) -> bool {
        self.state.get() == State::Fault
    }

    fn write_config(&self) {
        self.init_stage.set(InitStage::ConfigWrite);
        self.start_transaction(&[LIS3DSH_CTRL4, self.ctrl4.get()]);
    }

    fn read_back_config(&self) {
        self.init_stage.set(InitStage::ConfigReadBack);
        self.start_transaction(&[LIS3DSH_READ | LIS3DSH_CTRL4, 0x00]);
    }

    fn verify_config(&self) {
        let verified = self
            .rxbuffer
            .map_or(false, |rx| rx[1] == self.ctrl4.get());
        if verified {
            self.state.set(State::Idle);
            // First poll one millisecond out; the steady cadence starts
            // from the alarm callback.
            self.alarm
                .set_alarm(self.alarm.now(), self.alarm.ticks_from_ms(1));
        } else {
            self.init_attempts.increment();
            if self.init_attempts.get() >= MAX_INIT_ATTEMPTS {
                self.enter_fault();
            } else {
                debug!("lis3dsh: ctrl4 readback mismatch, retrying");
                self.write_config();
            }
        }
    }

    fn start_poll_read(&self) {
        // One address byte, then six don't-care bytes clocking out
        // OUT_X_L through OUT_Z_H.
        self.state.set(State::Reading);
        self.start_transaction(&[LIS3DSH_READ | LIS3DSH_OUT_X_L, 0, 0, 0, 0, 0, 0]);
    }

    fn store_sample(&self) {
        self.rxbuffer.map(|rx| {
            self.x.set(i16::from_le_bytes([rx[1], rx[2]]));
            self.y.set(i16::from_le_bytes([rx[3], rx[4]]));
            self.z.set(i16::from_le_bytes([rx[5], rx[6]]));
        });
        self.state.set(State::Idle);
    }

    fn start_transaction(&self, request: &[u8]) {
        match (self.txbuffer.take(), self.rxbuffer.take()) {
            (Some(tx), Some(rx)) => {
                for (i, byte) in request.iter().enumerate() {
                    tx[i] = *byte;
                    rx[i] = 0;
                }
                self.transfer.load(tx, rx, request.len(), SPI_TIMEOUT_MS);
                self.bus.submit(self.transfer);
            }
            (tx, rx) => {
                // Buffers still loaned to the bus; drop the request.
                self.txbuffer.put(tx);
                self.rxbuffer.put(rx);
            }
        }
    }

    fn enter_fault(&self) {
        debug!("lis3dsh: entering fault");
        self.state.set(State::Fault);
        self.x.set(0);
        self.y.set(0);
        self.z.set(0);
        let _ = self.alarm.disarm();
    }
}

impl<'a, A: Alarm<'a>> TransferClient for Lis3dsh<'a, A> {
    fn transfer_complete(&self, status: Result<(), ErrorCode>) {
        let (tx, rx) = self.transfer.reclaim();
        self.txbuffer.put(tx);
        self.rxbuffer.put(rx);

        if status.is_err() {
            // The controller gave up mid-transfer; same consequence as a
            // timeout.
            if self.state.get() != State::Fault {
                self.enter_fault();
            }
            return;
        }

        match self.state.get() {
            State::Initialising => match self.init_stage.get() {
                InitStage::ConfigWrite => self.read_back_config(),
                InitStage::ConfigReadBack => self.verify_config(),
            },
            State::Reading => self.store_sample(),
            // A completion that no state is waiting on carries nothing to
            // act on.
            State::Idle => {}
            State::Fault => {}
        }
    }

    fn transfer_timeout(&self) {
        let (tx, rx) = self.transfer.reclaim();
        self.txbuffer.put(tx);
        self.rxbuffer.put(rx);
        if self.state.get() != State::Fault {
            self.enter_fault();
        }
    }
}

impl<'a, A: Alarm<'a>> AlarmClient for Lis3dsh<'a, A> {
    fn alarm(&self) {
        match self.state.get() {
            State::Idle => {
                self.alarm.set_alarm(
                    self.alarm.now(),
                    self.alarm.ticks_from_ms(POLL_INTERVAL_MS),
                );
                self.start_poll_read();
            }
            State::Reading => {
                // The previous read is still on the bus and owns the
                // buffers. Skip this poll, keep the cadence.
                self.alarm.set_alarm(
                    self.alarm.now(),
                    self.alarm.ticks_from_ms(POLL_INTERVAL_MS),
                );
            }
            // A poll that fired before the timer was disarmed.
            State::Initialising => {}
            State::Fault => {}
        }
    }
}
