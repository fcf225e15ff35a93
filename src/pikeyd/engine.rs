/*! Polling, debounce, and key-repeat engines.
 *
 * One cycle every 4 ms services every group in index order: group 0
 * (direct pins) first, then each matrix group behind its strobe
 * line. A change must be seen stable for two consecutive samples
 * before it is believed; a debounced press then walks the pin's key
 * chain, emitting one down/up pair per binding. Pins marked for
 * repeat get the four-phase repeat cycle on top, timed off the same
 * 4 ms tick.
 *
 * Everything runs on the caller's thread. The only blocking points
 * are the cadence tick and the microsecond settle after driving a
 * strobe low.
 */

use std::thread;
use std::time::Duration;

use crate::pikeyd::hw_specific::{
    BOUNCE_TIME, NUM_GPIO, POLL_TICK_MS, REPEAT_NEXT_PHASE, REPEAT_TIME_MS, STROBE_SETTLE_US,
};
use crate::pikeyd::model::NO_KEY;
use crate::pikeyd::{BindingModel, ExpanderBus, KeySink, PinBus};

pub struct Engine<B, X, S> {
    model: BindingModel,
    pins: B,
    xio_bus: X,
    sink: S,
    /// Apply the repeat cycle to every pin, configured or not.
    force_repeat: bool,
}

impl<B: PinBus, X: ExpanderBus, S: KeySink> Engine<B, X, S> {
    pub fn new(model: BindingModel, pins: B, xio_bus: X, sink: S) -> Self {
        Engine {
            model,
            pins,
            xio_bus,
            sink,
            force_repeat: false,
        }
    }

    pub fn set_force_repeat(&mut self, on: bool) {
        self.force_repeat = on;
    }

    pub fn model(&self) -> &BindingModel {
        &self.model
    }

    /// Poll forever on the fixed cadence. Only returns if the tick
    /// source dies, which does not happen in practice; the daemon is
    /// stopped by a signal between iterations.
    pub fn run(&mut self) {
        let ticker = crossbeam_channel::tick(Duration::from_millis(POLL_TICK_MS));
        while ticker.recv().is_ok() {
            self.poll_cycle();
        }
    }

    /// One iteration of the main loop: service every group once.
    pub fn poll_cycle(&mut self) {
        for grp in 0..self.model.groups.len() {
            self.poll_group(grp);
        }
    }

    /// Sample, debounce, and dispatch for one group.
    pub fn poll_group(&mut self, grp: usize) {
        let strobe = self.model.groups[grp].strobe;
        let mask = self.model.groups[grp].pin_mask;

        // A matrix group's switches only conduct to ground while its
        // strobe is low.
        if let Some(pin) = strobe {
            self.pins.drive(pin, false);
            thread::sleep(Duration::from_micros(STROBE_SETTLE_US));
        }
        let raw = self.pins.read_levels() & mask;
        if let Some(pin) = strobe {
            self.pins.drive(pin, true);
        }

        {
            let group = &mut self.model.groups[grp];
            if raw != group.last_raw {
                group.bounce_cnt = 0;
                group.pending |= raw ^ group.last_raw;
            }
            group.last_raw = raw;
            crate::debug_poll!(
                "[{}] raw {:08x} pending {:08x}\n",
                grp,
                raw,
                group.pending
            );
        }

        if self.model.groups[grp].bounce_cnt >= BOUNCE_TIME {
            for pin in 0..NUM_GPIO as u8 {
                let bit = 1u32 << pin;
                if grp == 0 && self.model.groups[0].keys.is_routed(pin) {
                    // Expander interrupt line, serviced for as long
                    // as the chip holds it low.
                    if raw & bit == 0 {
                        self.dispatch_pin(grp, pin);
                    }
                } else if self.model.groups[grp].pending & bit != 0 && raw & bit == 0 {
                    // Debounced press edge (switches are active low).
                    self.dispatch_pin(grp, pin);
                }
            }
            self.model.groups[grp].pending = 0;
        }
        if self.model.groups[grp].bounce_cnt < BOUNCE_TIME {
            self.model.groups[grp].bounce_cnt += 1;
        }

        let held = !raw & mask;
        self.handle_repeat(grp, held);
    }

    /// One dispatch episode: walk the pin's chain in declaration
    /// order, emitting a down/up pair per bound key. A routed binding
    /// instead services the expander behind the pin.
    fn dispatch_pin(&mut self, grp: usize, pin: u8) {
        self.model.groups[grp].keys.restart();
        while self.model.groups[grp].keys.has_more(pin) {
            let code = self.model.groups[grp].keys.next_key(pin);
            let routed = self.model.groups[grp]
                .keys
                .current_binding()
                .and_then(|b| b.xio);
            if let Some(dev) = routed {
                self.service_expander(dev);
            } else if code != NO_KEY {
                self.tap(code);
            }
        }
    }

    fn tap(&mut self, code: u16) {
        for pressed in [true, false] {
            if let Err(e) = self.sink.send_key(code, pressed) {
                log::error!("key emit failed: {e}");
            }
        }
    }

    /// Read an expander's input register and decode it. A failed
    /// read only costs this cycle's update.
    fn service_expander(&mut self, dev: usize) {
        let (addr, reg) = {
            let d = &self.model.expanders[dev];
            (d.addr, d.kind.input_register())
        };
        match self.xio_bus.read_register(addr, reg) {
            Ok(value) => self.model.expanders[dev].handle_event(value, &mut self.sink),
            Err(e) => log::warn!(
                "expander {}: input read failed: {e}",
                self.model.expanders[dev].name
            ),
        }
    }

    /// Advance the repeat cycle for every repeat-enabled pin of the
    /// group. `held` is the active-low pressed mask from this cycle;
    /// a pin only accumulates repeat time once it has been held for
    /// two consecutive cycles.
    fn handle_repeat(&mut self, grp: usize, held: u32) {
        let (armed, repeat_mask) = {
            let group = &mut self.model.groups[grp];
            let armed = held & group.prev_held;
            group.prev_held = held;
            (armed, group.repeat_mask)
        };

        for pin in 0..NUM_GPIO as u8 {
            let bit = 1u32 << pin;
            if repeat_mask & bit == 0 && !self.force_repeat {
                continue;
            }
            if armed & bit != 0 {
                let fire = {
                    let state = &mut self.model.groups[grp].repeat[pin as usize];
                    if state.phase < 0 {
                        // New hold: arm the initial delay.
                        state.phase = 0;
                        state.deadline_ms = REPEAT_TIME_MS[0];
                        state.elapsed_ms = 0;
                        false
                    } else {
                        state.elapsed_ms += POLL_TICK_MS as u32;
                        if state.elapsed_ms >= state.deadline_ms {
                            let next = REPEAT_NEXT_PHASE[state.phase as usize];
                            state.phase = next as i8;
                            state.deadline_ms = REPEAT_TIME_MS[next];
                            state.elapsed_ms = 0;
                            true
                        } else {
                            false
                        }
                    }
                };
                if fire {
                    self.dispatch_pin(grp, pin);
                }
            } else {
                let state = &mut self.model.groups[grp].repeat[pin as usize];
                state.phase = -1;
                state.elapsed_ms = 0;
                state.deadline_ms = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use evdev::Key;

    use super::*;
    use crate::pikeyd::config;
    use crate::pikeyd::hw::fake::{FakeExpanderBus, FakePinBus, FakeSink};

    struct Rig {
        engine: Engine<FakePinBus, FakeExpanderBus, FakeSink>,
        pins: FakePinBus,
        xio: FakeExpanderBus,
        sink: FakeSink,
    }

    fn rig(config_text: &str) -> Rig {
        let pins = FakePinBus::new();
        let xio = FakeExpanderBus::new();
        let sink = FakeSink::new();
        let (mut pin_bus, mut xio_bus) = (pins.clone(), xio.clone());
        let (model, _) =
            config::parse_reader("test.conf", config_text.as_bytes(), &mut pin_bus, &mut xio_bus)
                .unwrap();
        Rig {
            engine: Engine::new(model, pin_bus, xio_bus, sink.clone()),
            pins,
            xio,
            sink,
        }
    }

    #[test]
    fn stable_press_dispatches_exactly_once() {
        let mut r = rig("KEY_A 4\n");
        let a = Key::KEY_A.code();

        r.pins.set_level(4, false);
        for _ in 0..6 {
            r.engine.poll_cycle();
        }
        assert_eq!(r.sink.events(), vec![(a, true), (a, false)]);
    }

    #[test]
    fn releases_do_not_dispatch() {
        let mut r = rig("KEY_A 4\n");

        r.pins.set_level(4, false);
        for _ in 0..4 {
            r.engine.poll_cycle();
        }
        let after_press = r.sink.events().len();
        r.pins.set_level(4, true);
        for _ in 0..4 {
            r.engine.poll_cycle();
        }
        assert_eq!(r.sink.events().len(), after_press);
    }

    #[test]
    fn bouncing_input_is_suppressed_until_stable() {
        let mut r = rig("KEY_A 4\n");
        let a = Key::KEY_A.code();

        // Toggle every cycle: never two consecutive identical
        // samples, so nothing may fire.
        for cycle in 0..6 {
            r.pins.set_level(4, cycle % 2 == 0);
            r.engine.poll_cycle();
        }
        assert!(r.sink.events().is_empty());

        // Now settle low; one dispatch episode once stable.
        r.pins.set_level(4, false);
        for _ in 0..4 {
            r.engine.poll_cycle();
        }
        assert_eq!(r.sink.events(), vec![(a, true), (a, false)]);
    }

    #[test]
    fn chained_keys_fire_in_declaration_order() {
        let mut r = rig("KEY_LEFTSHIFT 4\nKEY_A 4\n");
        let (shift, a) = (Key::KEY_LEFTSHIFT.code(), Key::KEY_A.code());

        r.pins.set_level(4, false);
        for _ in 0..4 {
            r.engine.poll_cycle();
        }
        assert_eq!(
            r.sink.events(),
            vec![(shift, true), (shift, false), (a, true), (a, false)]
        );
    }

    #[test]
    fn matrix_groups_strobe_around_the_sample() {
        let mut r = rig("MATRIX1 GPIO18\nKEY_A MATRIX1:22\n");

        r.engine.poll_cycle();
        // Group 0 has no strobe; the matrix drives 18 low then high
        // once per cycle.
        assert_eq!(r.pins.0.borrow().drives, vec![(18, false), (18, true)]);

        r.pins.set_level(22, false);
        for _ in 0..4 {
            r.engine.poll_cycle();
        }
        assert_eq!(
            r.sink.events(),
            vec![(Key::KEY_A.code(), true), (Key::KEY_A.code(), false)]
        );
    }

    #[test]
    fn repeat_cadence_follows_the_phase_table() {
        let mut r = rig("KEY_A 4\nREPEAT GPIO4\n");
        let a = Key::KEY_A.code();

        r.pins.set_level(4, false);
        let mut episodes: Vec<u64> = Vec::new();
        let mut last_len = 0;
        for tick in 0u64..250 {
            r.engine.poll_cycle();
            let len = r.sink.events().len();
            if len != last_len {
                episodes.push(tick);
                last_len = len;
            }
        }

        // Press dispatch once stable, then repeats 80 ms after the
        // hold is armed, then 200 ms, then 40/40/40...
        assert!(episodes.len() >= 6, "episodes: {episodes:?}");
        let gaps: Vec<u64> = episodes.windows(2).map(|w| w[1] - w[0]).collect();
        let ms_per_tick = POLL_TICK_MS;
        assert_eq!(gaps[1] * ms_per_tick, 200);
        assert_eq!(gaps[2] * ms_per_tick, 40);
        assert_eq!(gaps[3] * ms_per_tick, 40);
        assert_eq!(gaps[4] * ms_per_tick, 40);

        // Every episode is one full down/up pair.
        assert!(r.sink.events().iter().all(|&(code, _)| code == a));

        // Releasing resets the cycle.
        r.pins.set_level(4, true);
        for _ in 0..30 {
            r.engine.poll_cycle();
        }
        let settled = r.sink.events().len();
        for _ in 0..30 {
            r.engine.poll_cycle();
        }
        assert_eq!(r.sink.events().len(), settled);
    }

    #[test]
    fn first_repeat_comes_80ms_after_arming() {
        let mut r = rig("KEY_A 4\nREPEAT GPIO4\n");

        r.pins.set_level(4, false);
        // Cycle 0 sees the change (arming happens on cycle 1, once
        // the pin has been held twice); the press dispatch lands on
        // cycle 2 when the debounce threshold is met.
        let mut first_repeat = None;
        let mut dispatches = 0;
        for tick in 0..60 {
            r.engine.poll_cycle();
            let len = r.sink.events().len();
            if len != dispatches {
                dispatches = len;
                if len > 2 {
                    first_repeat = Some(tick);
                    break;
                }
            }
        }
        // Armed on tick 1, repeat fires 80 ms = 20 ticks later.
        assert_eq!(first_repeat, Some(21));
    }

    #[test]
    fn unmarked_pins_do_not_repeat_unless_forced() {
        let mut r = rig("KEY_A 4\n");
        r.pins.set_level(4, false);
        for _ in 0..100 {
            r.engine.poll_cycle();
        }
        // Only the single press dispatch.
        assert_eq!(r.sink.events().len(), 2);

        let mut forced = rig("KEY_A 4\n");
        forced.engine.set_force_repeat(true);
        forced.pins.set_level(4, false);
        for _ in 0..100 {
            forced.engine.poll_cycle();
        }
        assert!(forced.sink.events().len() > 2);
    }

    #[test]
    fn expander_interrupt_line_triggers_a_read_and_decode() {
        let mut r = rig("XIO1 7/0x20/MCP23008\nKEY_D XIO1:3\n");
        let d = Key::KEY_D.code();

        // Chip asserts its interrupt: line low, input register shows
        // pin 3 low.
        r.xio.0.borrow_mut().read_value = 0b1111_0111;
        r.pins.set_level(7, false);
        for _ in 0..4 {
            r.engine.poll_cycle();
        }
        assert_eq!(r.sink.events(), vec![(d, true), (d, false)]);

        // Line stays low but the register is unchanged: re-read,
        // nothing new dispatched.
        let reads_before = r.xio.0.borrow().reads;
        r.engine.poll_cycle();
        assert!(r.xio.0.borrow().reads > reads_before);
        assert_eq!(r.sink.events(), vec![(d, true), (d, false)]);
    }

    #[test]
    fn failed_expander_reads_are_not_fatal() {
        let mut r = rig("XIO1 7/0x20/MCP23008\nKEY_D XIO1:3\nKEY_A 4\n");

        r.xio.0.borrow_mut().fail_reads = true;
        r.pins.set_level(7, false);
        r.pins.set_level(4, false);
        for _ in 0..4 {
            r.engine.poll_cycle();
        }
        // The direct key still went through.
        assert_eq!(
            r.sink.events(),
            vec![(Key::KEY_A.code(), true), (Key::KEY_A.code(), false)]
        );
    }
}
