// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tilt Level Contributors 2024.

//! Arbitrates one SPI controller among multiple requesting capsules.
//!
//! The arbiter is the only component allowed to touch the bus. Requesters
//! describe a transaction with a [`Transfer`] they own, hand it over with
//! [`BusArbiter::submit`], and receive exactly one terminal callback:
//! [`TransferClient::transfer_complete`] or
//! [`TransferClient::transfer_timeout`]. Submissions that arrive while a
//! transfer is in flight wait in a FIFO and enter service in arrival
//! order, so completions reach each requester in its submission order.
//!
//! For every transfer the arbiter asserts the job's chip-select line low,
//! starts the controller, and arms a one-shot timeout alarm from the job's
//! timeout field. A transfer that outlives its timeout is aborted and
//! reported to its requester, who decides whether to reissue; the arbiter
//! itself never retries.
//!
//! While a transfer is submitted, its buffers belong to the arbiter and
//! the controller below it. The buffers travel inside the `Transfer`, so
//! the requester physically gives them up at `load()` and gets them back
//! with `reclaim()` after the terminal callback. A full pending queue, a
//! completion or timeout in the wrong state, and a controller that refuses
//! a transfer are all capacity or wiring defects, and fatal.

use core::array;
use core::cell::Cell;

use kernel::config::CONFIG;
use kernel::debug;
use kernel::hil::gpio;
use kernel::hil::spi::{SpiMaster, SpiMasterClient};
use kernel::hil::time::{Alarm, AlarmClient, ConvertTicks};
use kernel::utilities::cells::{OptionalCell, TakeCell};
use kernel::ErrorCode;

/// Number of slots in the pending-transfer ring. One slot discriminates
/// empty from full, so at most `TRANSFER_QUEUE_SIZE - 1` transfers can
/// wait behind the one in flight.
pub const TRANSFER_QUEUE_SIZE: usize = 16;

/// Requester-side callbacks for a submitted transfer. Exactly one of the
/// two is invoked per submission.
pub trait TransferClient {
    /// The transfer clocked out fully; the receive buffer is valid and
    /// back inside the `Transfer`.
    fn transfer_complete(&self, status: Result<(), ErrorCode>);

    /// The transfer was aborted after its timeout elapsed. Buffer contents
    /// are unspecified.
    fn transfer_timeout(&self);
}

/// One SPI transaction, embedded in and owned by the requesting capsule.
///
/// A `Transfer` must be loaded with buffers and a client before it is
/// submitted, and must not be reloaded until the terminal callback has
/// been delivered.
pub struct Transfer<'a> {
    chip_select: &'a dyn gpio::Output,
    client: OptionalCell<&'a dyn TransferClient>,
    tx: TakeCell<'static, [u8]>,
    rx: TakeCell<'static, [u8]>,
    len: Cell<usize>,
    timeout_ms: Cell<u32>,
}

impl<'a> Transfer<'a> {
    /// Creates a transfer bound to a chip-select pin. The pin is driven
    /// low for the duration of each transaction.
    pub fn new(chip_select: &'a dyn gpio::Output) -> Transfer<'a> {
        Transfer {
            chip_select,
            client: OptionalCell::empty(),
            tx: TakeCell::empty(),
            rx: TakeCell::empty(),
            len: Cell::new(0),
            timeout_ms: Cell::new(0),
        }
    }

    /// Registers the capsule notified when this transfer terminates.
    pub fn set_client(&self, client: &'a dyn TransferClient) {
        self.client.set(client);
    }

    /// Loans `len` bytes of `tx` and `rx` to the bus for one transaction.
    pub fn load(
        &self,
        tx: &'static mut [u8],
        rx: &'static mut [u8],
        len: usize,
        timeout_ms: u32,
    ) {
        assert!(len > 0 && len <= tx.len() && len <= rx.len());
        debug_assert!(self.tx.is_none() && self.rx.is_none());
        self.len.set(len);
        self.timeout_ms.set(timeout_ms);
        self.tx.put(Some(tx));
        self.rx.put(Some(rx));
    }

    /// Takes the buffers back after a terminal callback.
    pub fn reclaim(&self) -> (Option<&'static mut [u8]>, Option<&'static mut [u8]>) {
        (self.tx.take(), self.rx.take())
    }
}

/// Submission interface of the arbiter, callable from any capsule.
pub trait BusArbiter<'a> {
    /// Queues `transfer` for the bus. The transfer must be loaded and have
    /// a client. The arbiter guarantees in-order delivery of exactly one
    /// terminal callback to the transfer's client.
    fn submit(&self, transfer: &'a Transfer<'a>);
}

#[derive(Clone, Copy, PartialEq, Debug)]
enum State {
    Ready,
    Busy,
}

pub struct SpiArbiter<'a, S: SpiMaster<'a>, A: Alarm<'a>> {
    spi: &'a S,
    alarm: &'a A,
    state: Cell<State>,
    current: OptionalCell<&'a Transfer<'a>>,
    pending: [Cell<Option<&'a Transfer<'a>>>; TRANSFER_QUEUE_SIZE],
    head: Cell<usize>,
    tail: Cell<usize>,
}

impl<'a, S: SpiMaster<'a>, A: Alarm<'a>> SpiArbiter<'a, S, A> {
    /// Creates an arbiter over `spi`. The caller must register the arbiter
    /// as the controller's client and as the alarm's client.
    pub fn new(spi: &'a S, alarm: &'a A) -> SpiArbiter<'a, S, A> {
        SpiArbiter {
            spi,
            alarm,
            state: Cell::new(State::Ready),
            current: OptionalCell::empty(),
            pending: array::from_fn(|_| Cell::new(None)),
            head: Cell::new(0),
            tail: Cell::new(0),
        }
    }

    fn start_transfer(&self, transfer: &'a Transfer<'a>) {
        let tx = match transfer.tx.take() {
            Some(tx) => tx,
            None => fatal("transfer lost its buffers while queued"),
        };
        let rx = transfer.rx.take();
        let len = transfer.len.get();

        transfer.chip_select.clear();
        self.current.set(transfer);
        self.state.set(State::Busy);
        if CONFIG.trace_bus {
            debug!(
                "spi-arbiter: start len={} timeout_ms={}",
                len,
                transfer.timeout_ms.get()
            );
        }
        if self.spi.read_write_bytes(tx, rx, len).is_err() {
            fatal("controller refused transfer");
        }
        self.alarm.set_alarm(
            self.alarm.now(),
            self.alarm.ticks_from_ms(transfer.timeout_ms.get()),
        );
    }

    fn enqueue_transfer(&self, transfer: &'a Transfer<'a>) {
        let head = self.head.get();
        let next = (head + 1) % TRANSFER_QUEUE_SIZE;
        if next == self.tail.get() {
            fatal("transfer queue overflow");
        }
        self.pending[head].set(Some(transfer));
        self.head.set(next);
    }

    fn dequeue_transfer(&self) -> Option<&'a Transfer<'a>> {
        let tail = self.tail.get();
        if self.head.get() == tail {
            return None;
        }
        let transfer = self.pending[tail].replace(None);
        self.tail.set((tail + 1) % TRANSFER_QUEUE_SIZE);
        transfer
    }
}

impl<'a, S: SpiMaster<'a>, A: Alarm<'a>> BusArbiter<'a> for SpiArbiter<'a, S, A> {
    fn submit(&self, transfer: &'a Transfer<'a>) {
        if transfer.client.is_none() || transfer.tx.is_none() || transfer.rx.is_none() {
            fatal("submitted transfer is not loaded");
        }
        match self.state.get() {
            State::Ready => self.start_transfer(transfer),
            State::Busy => self.enqueue_transfer(transfer),
        }
    }
}

impl<'a, S: SpiMaster<'a>, A: Alarm<'a>> SpiMasterClient for SpiArbiter<'a, S, A> {
    fn read_write_done(
        &self,
        write_buffer: &'static mut [u8],
        read_buffer: Option<&'static mut [u8]>,
        _len: usize,
        status: Result<(), ErrorCode>,
    ) {
        if self.state.get() != State::Busy {
            fatal("completion while ready");
        }
        let transfer = match self.current.take() {
            Some(transfer) => transfer,
            None => fatal("busy without a current transfer"),
        };

        transfer.chip_select.set();
        transfer.tx.put(Some(write_buffer));
        transfer.rx.put(read_buffer);
        // Disarm before the client runs: a resubmission from inside the
        // callback must not race the old timeout timer.
        let _ = self.alarm.disarm();
        if CONFIG.trace_bus {
            debug!("spi-arbiter: complete");
        }
        transfer.client.map(|client| client.transfer_complete(status));

        // Service the next queued transfer without passing through Ready.
        match self.dequeue_transfer() {
            Some(next) => self.start_transfer(next),
            None => self.state.set(State::Ready),
        }
    }
}

impl<'a, S: SpiMaster<'a>, A: Alarm<'a>> AlarmClient for SpiArbiter<'a, S, A> {
    fn alarm(&self) {
        if self.state.get() != State::Busy {
            fatal("timeout while ready");
        }
        let transfer = match self.current.take() {
            Some(transfer) => transfer,
            None => fatal("busy without a current transfer"),
        };

        // The bus must be left deselected even on the abort path.
        transfer.chip_select.set();
        if let Some((tx, rx)) = self.spi.abort_transfer() {
            transfer.tx.put(Some(tx));
            transfer.rx.put(rx);
        }
        if CONFIG.trace_bus {
            debug!(
                "spi-arbiter: timeout after {} ms",
                transfer.timeout_ms.get()
            );
        }
        // Queued transfers stay pending; service resumes with the next
        // submission.
        self.state.set(State::Ready);
        transfer.client.map(|client| client.transfer_timeout());
    }
}

#[inline(never)]
fn fatal(msg: &'static str) -> ! {
    if CONFIG.debug_panics {
        panic!("spi-arbiter: {}", msg);
    } else {
        panic!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{leak_buffer, FakeAlarm, FakePin, FakeSpi};
    use kernel::utilities::cells::NumericCellExt;
    use std::boxed::Box;

    struct Requester {
        completions: Cell<usize>,
        timeouts: Cell<usize>,
        seq: &'static Cell<usize>,
        completed_at: Cell<Option<usize>>,
    }

    impl Requester {
        fn new(seq: &'static Cell<usize>) -> &'static Requester {
            Box::leak(Box::new(Requester {
                completions: Cell::new(0),
                timeouts: Cell::new(0),
                seq,
                completed_at: Cell::new(None),
            }))
        }
    }

    impl TransferClient for Requester {
        fn transfer_complete(&self, status: Result<(), ErrorCode>) {
            assert!(status.is_ok());
            self.completions.increment();
            self.completed_at.set(Some(self.seq.get_and_increment()));
        }

        fn transfer_timeout(&self) {
            self.timeouts.increment();
        }
    }

    fn rig() -> (
        &'static FakeSpi<'static>,
        &'static FakeAlarm<'static>,
        &'static SpiArbiter<'static, FakeSpi<'static>, FakeAlarm<'static>>,
    ) {
        let spi: &'static FakeSpi<'static> = Box::leak(Box::new(FakeSpi::new()));
        let alarm: &'static FakeAlarm<'static> = Box::leak(Box::new(FakeAlarm::new()));
        let arbiter: &'static SpiArbiter<'static, FakeSpi<'static>, FakeAlarm<'static>> =
            Box::leak(Box::new(SpiArbiter::new(spi, alarm)));
        spi.set_client(arbiter);
        alarm.set_alarm_client(arbiter);
        (spi, alarm, arbiter)
    }

    fn seq_counter() -> &'static Cell<usize> {
        Box::leak(Box::new(Cell::new(0)))
    }

    fn loaded_transfer(
        client: &'static dyn TransferClient,
        pin: &'static FakePin,
        first_byte: u8,
        timeout_ms: u32,
    ) -> &'static Transfer<'static> {
        let transfer = Box::leak(Box::new(Transfer::new(pin)));
        transfer.set_client(client);
        let tx = leak_buffer(16);
        tx[0] = first_byte;
        transfer.load(tx, leak_buffer(16), 2, timeout_ms);
        transfer
    }

    #[test]
    fn single_transfer_completes_once_and_returns_to_ready() {
        let (spi, alarm, arbiter) = rig();
        let pin: &'static FakePin = Box::leak(Box::new(FakePin::new()));
        let requester = Requester::new(seq_counter());
        let transfer = loaded_transfer(requester, pin, 0xA0, 10);
        spi.set_response(&[0x00, 0x67]);

        arbiter.submit(transfer);
        assert_eq!(spi.starts(), 1);
        assert!(!pin.is_high());
        assert_eq!(alarm.armed_dt(), Some(10));

        spi.complete();
        assert_eq!(requester.completions.get(), 1);
        assert_eq!(requester.timeouts.get(), 0);
        assert!(pin.is_high());
        assert_eq!(alarm.armed_dt(), None);

        let (tx, rx) = transfer.reclaim();
        assert_eq!(tx.unwrap()[0], 0xA0);
        assert_eq!(rx.unwrap()[1], 0x67);

        // Back in Ready: a reloaded transfer starts immediately.
        transfer.load(leak_buffer(16), leak_buffer(16), 2, 10);
        arbiter.submit(transfer);
        assert_eq!(spi.starts(), 2);
    }

    #[test]
    fn queued_transfer_starts_after_current_completes() {
        let (spi, _alarm, arbiter) = rig();
        let seq = seq_counter();
        let r1 = Requester::new(seq);
        let r2 = Requester::new(seq);
        let pin1: &'static FakePin = Box::leak(Box::new(FakePin::new()));
        let pin2: &'static FakePin = Box::leak(Box::new(FakePin::new()));
        let t1 = loaded_transfer(r1, pin1, 0x01, 10);
        let t2 = loaded_transfer(r2, pin2, 0x02, 10);

        arbiter.submit(t1);
        arbiter.submit(t2);
        // Only one transfer may be on the bus.
        assert_eq!(spi.starts(), 1);

        spi.complete();
        // t2 entered service without the arbiter passing through Ready.
        assert_eq!(spi.starts(), 2);
        assert!(spi.is_busy());
        assert_eq!(r1.completed_at.get(), Some(0));
        assert_eq!(r2.completions.get(), 0);

        spi.complete();
        assert_eq!(r2.completed_at.get(), Some(1));
        assert_eq!(r1.completions.get() + r2.completions.get(), 2);
    }

    #[test]
    fn back_to_back_transfers_complete_in_submission_order() {
        let (spi, _alarm, arbiter) = rig();
        let seq = seq_counter();
        let ra = Requester::new(seq);
        let rb = Requester::new(seq);
        let pin: &'static FakePin = Box::leak(Box::new(FakePin::new()));
        let a = loaded_transfer(ra, pin, 0x0A, 10);
        let b = loaded_transfer(rb, pin, 0x0B, 10);

        arbiter.submit(a);
        arbiter.submit(b);
        spi.complete();
        spi.complete();

        assert!(ra.completed_at.get().unwrap() < rb.completed_at.get().unwrap());
    }

    #[test]
    fn timeout_aborts_reports_and_frees_the_bus() {
        let (spi, alarm, arbiter) = rig();
        let pin: &'static FakePin = Box::leak(Box::new(FakePin::new()));
        let requester = Requester::new(seq_counter());
        let transfer = loaded_transfer(requester, pin, 0xA0, 5);

        arbiter.submit(transfer);
        assert_eq!(alarm.armed_dt(), Some(5));

        alarm.trigger();
        assert_eq!(spi.aborts(), 1);
        assert_eq!(requester.timeouts.get(), 1);
        assert_eq!(requester.completions.get(), 0);
        // Chip select is released on the abort path.
        assert!(pin.is_high());

        // The arbiter is Ready again and accepts new work.
        let transfer2 = loaded_transfer(requester, pin, 0xA2, 5);
        arbiter.submit(transfer2);
        assert_eq!(spi.starts(), 2);
    }

    #[test]
    fn each_submission_gets_exactly_one_response() {
        let (spi, alarm, arbiter) = rig();
        let seq = seq_counter();
        let pin: &'static FakePin = Box::leak(Box::new(FakePin::new()));
        let requesters = [
            Requester::new(seq),
            Requester::new(seq),
            Requester::new(seq),
        ];

        arbiter.submit(loaded_transfer(requesters[0], pin, 0x01, 10));
        spi.complete();
        arbiter.submit(loaded_transfer(requesters[1], pin, 0x02, 10));
        alarm.trigger();
        arbiter.submit(loaded_transfer(requesters[2], pin, 0x03, 10));
        spi.complete();

        for requester in requesters {
            assert_eq!(requester.completions.get() + requester.timeouts.get(), 1);
        }
    }

    #[test]
    #[should_panic(expected = "transfer queue overflow")]
    fn overflowing_the_pending_queue_is_fatal() {
        let (_spi, _alarm, arbiter) = rig();
        let pin: &'static FakePin = Box::leak(Box::new(FakePin::new()));
        let requester = Requester::new(seq_counter());

        // One in flight plus TRANSFER_QUEUE_SIZE - 1 pending fit.
        for _ in 0..TRANSFER_QUEUE_SIZE {
            arbiter.submit(loaded_transfer(requester, pin, 0x00, 10));
        }
        arbiter.submit(loaded_transfer(requester, pin, 0x00, 10));
    }

    #[test]
    #[should_panic(expected = "completion while ready")]
    fn completion_in_ready_is_fatal() {
        let (_spi, _alarm, arbiter) = rig();
        arbiter.read_write_done(leak_buffer(2), Some(leak_buffer(2)), 2, Ok(()));
    }

    #[test]
    #[should_panic(expected = "submitted transfer is not loaded")]
    fn submitting_an_unloaded_transfer_is_fatal() {
        let (_spi, _alarm, arbiter) = rig();
        let pin: &'static FakePin = Box::leak(Box::new(FakePin::new()));
        let transfer: &'static Transfer<'static> = Box::leak(Box::new(Transfer::new(pin)));
        arbiter.submit(transfer);
    }
}
