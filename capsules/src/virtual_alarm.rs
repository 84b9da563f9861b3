// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tilt Level Contributors 2024.

//! Virtualize a single hardware alarm into one alarm per client.
//!
//! Every task-level timer in the system (the arbiter's transfer timeout,
//! the sensor's poll cadence, the LED task's tick) is a [`VirtualAlarm`]
//! node in a list multiplexed over the one hardware compare channel. All
//! alarms at this level are one-shot; a periodic schedule is a client that
//! re-arms its alarm inside the `alarm()` callback. `disarm()` takes
//! effect synchronously: after it returns, no callback is delivered until
//! the alarm is armed again, so clients only need state checks to reject
//! polls that were already in flight when they shut a timer down.

use core::cell::Cell;

use kernel::collections::list::{List, ListLink, ListNode};
use kernel::hil::time::{Alarm, AlarmClient, Ticks, Time};
use kernel::utilities::cells::OptionalCell;
use kernel::ErrorCode;

/// One client's one-shot alarm, multiplexed over the mux's hardware alarm.
pub struct VirtualAlarm<'a, A: Alarm<'a>> {
    mux: &'a MuxAlarm<'a, A>,
    reference: Cell<A::Ticks>,
    dt: Cell<A::Ticks>,
    armed: Cell<bool>,
    next: ListLink<'a, VirtualAlarm<'a, A>>,
    client: OptionalCell<&'a dyn AlarmClient>,
}

impl<'a, A: Alarm<'a>> ListNode<'a, VirtualAlarm<'a, A>> for VirtualAlarm<'a, A> {
    fn next(&'a self) -> &'a ListLink<'a, VirtualAlarm<'a, A>> {
        &self.next
    }
}

impl<'a, A: Alarm<'a>> VirtualAlarm<'a, A> {
    pub fn new(mux: &'a MuxAlarm<'a, A>) -> VirtualAlarm<'a, A> {
        let zero = A::Ticks::from(0);
        VirtualAlarm {
            mux,
            reference: Cell::new(zero),
            dt: Cell::new(zero),
            armed: Cell::new(false),
            next: ListLink::empty(),
            client: OptionalCell::empty(),
        }
    }

    /// Links this alarm into the mux. Must be called once, right after
    /// construction, or the alarm will never fire.
    pub fn setup(&'a self) {
        self.mux.virtual_alarms.push_head(self);
    }

    fn expiry(&self) -> A::Ticks {
        self.reference.get().wrapping_add(self.dt.get())
    }

    fn expired(&self, now: A::Ticks) -> bool {
        !now.within_range(self.reference.get(), self.expiry())
    }
}

impl<'a, A: Alarm<'a>> Time for VirtualAlarm<'a, A> {
    type Frequency = A::Frequency;
    type Ticks = A::Ticks;

    fn now(&self) -> Self::Ticks {
        self.mux.alarm.now()
    }
}

impl<'a, A: Alarm<'a>> Alarm<'a> for VirtualAlarm<'a, A> {
    fn set_alarm_client(&self, client: &'a dyn AlarmClient) {
        self.client.set(client);
    }

    fn set_alarm(&self, reference: Self::Ticks, dt: Self::Ticks) {
        self.reference.set(reference);
        self.dt.set(dt);
        self.armed.set(true);
        // While the mux is distributing an expiry it reprograms once at
        // the end, covering alarms set from inside callbacks.
        if !self.mux.firing.get() {
            self.mux.reprogram();
        }
    }

    fn get_alarm(&self) -> Self::Ticks {
        self.expiry()
    }

    fn disarm(&self) -> Result<(), ErrorCode> {
        if !self.armed.get() {
            return Ok(());
        }
        self.armed.set(false);
        if !self.mux.firing.get() {
            self.mux.reprogram();
        }
        Ok(())
    }

    fn is_armed(&self) -> bool {
        self.armed.get()
    }

    fn minimum_dt(&self) -> Self::Ticks {
        self.mux.alarm.minimum_dt()
    }
}

impl<'a, A: Alarm<'a>> AlarmClient for VirtualAlarm<'a, A> {
    fn alarm(&self) {
        self.client.map(|client| client.alarm());
    }
}

/// Multiplexer distributing one hardware alarm to a list of
/// [`VirtualAlarm`]s.
pub struct MuxAlarm<'a, A: Alarm<'a>> {
    virtual_alarms: List<'a, VirtualAlarm<'a, A>>,
    alarm: &'a A,
    firing: Cell<bool>,
}

impl<'a, A: Alarm<'a>> MuxAlarm<'a, A> {
    /// Creates a mux over `alarm`. The caller must register the mux as the
    /// hardware alarm's client.
    pub const fn new(alarm: &'a A) -> MuxAlarm<'a, A> {
        MuxAlarm {
            virtual_alarms: List::new(),
            alarm,
            firing: Cell::new(false),
        }
    }

    /// Programs the hardware alarm for the soonest armed virtual alarm,
    /// or disarms it when none remain. An already-expired alarm counts as
    /// due immediately.
    fn reprogram(&self) {
        let now = self.alarm.now();
        let next = self
            .virtual_alarms
            .iter()
            .filter(|valarm| valarm.armed.get())
            .min_by_key(|valarm| {
                if valarm.expired(now) {
                    A::Ticks::from(0)
                } else {
                    valarm.expiry().wrapping_sub(now)
                }
            });
        match next {
            Some(valarm) => self
                .alarm
                .set_alarm(valarm.reference.get(), valarm.dt.get()),
            None => {
                let _ = self.alarm.disarm();
            }
        }
    }
}

impl<'a, A: Alarm<'a>> AlarmClient for MuxAlarm<'a, A> {
    fn alarm(&self) {
        // Expired alarms are one-shot: disarm before the callback so a
        // client re-arming from inside it is not immediately clobbered.
        self.firing.set(true);
        self.virtual_alarms
            .iter()
            .filter(|valarm| valarm.armed.get() && valarm.expired(self.alarm.now()))
            .for_each(|valarm| {
                valarm.armed.set(false);
                valarm.alarm();
            });
        self.firing.set(false);
        self.reprogram();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{ClientCounter, FakeAlarm};
    use kernel::hil::time::Ticks32;
    use kernel::utilities::cells::NumericCellExt;
    use std::boxed::Box;

    type Valarm = VirtualAlarm<'static, FakeAlarm<'static>>;

    fn mux_rig() -> (
        &'static FakeAlarm<'static>,
        &'static MuxAlarm<'static, FakeAlarm<'static>>,
    ) {
        let fake: &'static FakeAlarm<'static> = Box::leak(Box::new(FakeAlarm::new()));
        let mux: &'static MuxAlarm<'static, FakeAlarm<'static>> =
            Box::leak(Box::new(MuxAlarm::new(fake)));
        fake.set_alarm_client(mux);
        (fake, mux)
    }

    fn valarm(mux: &'static MuxAlarm<'static, FakeAlarm<'static>>) -> &'static Valarm {
        let valarm: &'static Valarm = Box::leak(Box::new(VirtualAlarm::new(mux)));
        valarm.setup();
        valarm
    }

    fn counter() -> &'static ClientCounter {
        Box::leak(Box::new(ClientCounter::new()))
    }

    #[test]
    fn alarms_fire_in_deadline_order() {
        let (fake, mux) = mux_rig();
        let (a, b) = (valarm(mux), valarm(mux));
        let (ca, cb) = (counter(), counter());
        a.set_alarm_client(ca);
        b.set_alarm_client(cb);

        a.set_alarm(a.now(), Ticks32::from(10));
        b.set_alarm(b.now(), Ticks32::from(100));
        // The hardware alarm tracks the soonest client.
        assert_eq!(fake.armed_dt(), Some(10));

        fake.trigger();
        assert_eq!(ca.count(), 1);
        assert_eq!(cb.count(), 0);
        assert_eq!(fake.armed_dt(), Some(100));

        fake.trigger();
        assert_eq!(cb.count(), 1);
        // Nothing armed anymore: the mux released the hardware alarm.
        assert_eq!(fake.armed_dt(), None);
    }

    #[test]
    fn rearming_in_the_callback_gives_a_period() {
        struct Repeater {
            valarm: &'static Valarm,
            fires: core::cell::Cell<usize>,
        }
        impl AlarmClient for Repeater {
            fn alarm(&self) {
                self.fires.increment();
                if self.fires.get() < 3 {
                    self.valarm.set_alarm(self.valarm.now(), Ticks32::from(10));
                }
            }
        }

        let (fake, mux) = mux_rig();
        let v = valarm(mux);
        let repeater: &'static Repeater = Box::leak(Box::new(Repeater {
            valarm: v,
            fires: core::cell::Cell::new(0),
        }));
        v.set_alarm_client(repeater);

        v.set_alarm(v.now(), Ticks32::from(10));
        fake.trigger();
        fake.trigger();
        fake.trigger();
        assert_eq!(repeater.fires.get(), 3);
        assert_eq!(fake.armed_dt(), None);
    }

    #[test]
    fn disarm_is_synchronous() {
        let (fake, mux) = mux_rig();
        let (a, b) = (valarm(mux), valarm(mux));
        let (ca, cb) = (counter(), counter());
        a.set_alarm_client(ca);
        b.set_alarm_client(cb);

        a.set_alarm(a.now(), Ticks32::from(10));
        b.set_alarm(b.now(), Ticks32::from(10));
        a.disarm().unwrap();
        assert!(!a.is_armed());

        fake.trigger();
        assert_eq!(ca.count(), 0);
        assert_eq!(cb.count(), 1);
    }

    #[test]
    fn disarming_the_last_alarm_releases_the_hardware() {
        let (fake, mux) = mux_rig();
        let a = valarm(mux);
        a.set_alarm_client(counter());

        a.set_alarm(a.now(), Ticks32::from(5));
        assert_eq!(fake.armed_dt(), Some(5));
        a.disarm().unwrap();
        assert_eq!(fake.armed_dt(), None);
    }
}
