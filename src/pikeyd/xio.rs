/*! Expander bring-up and input-event decode.
 *
 * The MCP23008 and the two MCP23017 ports share one register layout
 * apart from a bank offset, so [`ExpanderKind`](crate::pikeyd::ExpanderKind)
 * reduces to a pair of register constants and everything else here is
 * chip-independent.
 */

use crate::pikeyd::hw_specific::NUM_XIO_PINS;
use crate::pikeyd::model::NO_KEY;
use crate::pikeyd::{ExpanderBus, ExpanderDevice, HwError, KeySink};

impl ExpanderDevice {
    /// One-time register bring-up: all lines inputs with pull-ups,
    /// change interrupts enabled on the bound pins, interrupt line
    /// open-collector.
    pub fn init_registers<X: ExpanderBus>(&self, bus: &mut X) -> Result<(), HwError> {
        // Force the bank bit to a known value first, then clear the
        // IOCON byte again in case the chip was addressed under the
        // other layout before.
        bus.write_registers(self.addr, 0x0a, &[0x84])?;
        bus.write_registers(self.addr, 0x0a, &[0x00])?;

        let cfg = [
            0xff,            // IODIR: everything an input
            0x00,            // IPOL: no polarity inversion
            self.input_mask, // GPINTEN: interrupts for bound pins
            0x00,            // DEFVAL
            0x00,            // INTCON: interrupt on any change
            0x84,            // IOCON: open-collector interrupt line
            0xff,            // GPPU: pull-ups on
        ];
        match self.kind.config_offset() {
            Some(offset) => {
                bus.write_registers(self.addr, offset, &cfg)?;
                log::info!("Configured {} ({:?} at {:#04x})", self.name, self.kind, self.addr);
            }
            None => log::warn!(
                "expander {}: unknown chip variant, register setup skipped",
                self.name
            ),
        }
        Ok(())
    }

    /// Decode one freshly read input-register byte. Every pin whose
    /// masked level changed gets a full dispatch episode: one
    /// down/up pair per bound key, in chain order. Both rising and
    /// falling edges count as taps.
    pub fn handle_event<S: KeySink>(&mut self, raw: u8, sink: &mut S) {
        let value = raw & self.input_mask;
        let changed = value ^ self.last_value;
        self.last_value = value;

        for pin in 0..NUM_XIO_PINS as u8 {
            if changed & (1 << pin) == 0 {
                continue;
            }
            self.keys.restart();
            while self.keys.has_more(pin) {
                let code = self.keys.next_key(pin);
                if code == NO_KEY {
                    continue;
                }
                for pressed in [true, false] {
                    if let Err(e) = sink.send_key(code, pressed) {
                        log::error!("key emit failed: {e}");
                    }
                }
            }
        }
    }
}
