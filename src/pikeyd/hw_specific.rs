/*! Hardware constants for the Raspberry Pi target.
 *
 * Pin counts, poll timing, the key-repeat phase table, and the
 * P1/P5 header lookup tables that map connector pin numbers to BCM
 * GPIO numbers. Positions occupied by power and ground have no GPIO
 * and resolve to `None`.
 */

use static_assertions::const_assert_eq;

/// Usable GPIO lines; everything works on the first bank of 32.
pub const NUM_GPIO: usize = 32;

/// Pins per I2C expander chip.
pub const NUM_XIO_PINS: usize = 8;

/// Expander device table capacity.
pub const MAX_XIO_DEVS: usize = 8;

/// Named matrix group capacity (the implicit direct group not counted).
pub const MAX_MATRIX_GROUPS: usize = 8;

/// Consecutive stable samples required before a change is believed.
pub const BOUNCE_TIME: u8 = 2;

/// Poll loop cadence.
pub const POLL_TICK_MS: u64 = 4;

/// Settle delay after driving a matrix strobe line low, before
/// sampling the group's inputs.
pub const STROBE_SETTLE_US: u64 = 5;

/// Key codes at or above this are not plain keyboard keys and are
/// never bound nor registered on the output device.
pub const MAX_KEY_CODE: u16 = 0x300;

pub const UINPUT_DEVICE_NAME: &str = "pikeyd";
pub const CONFIG_FILENAME: &str = "pikeyd.conf";

/// Key-repeat phase thresholds in milliseconds, indexed by phase.
/// Phase 0 is the initial delay before the first repeat; after a
/// phase fires, [`REPEAT_NEXT_PHASE`] selects the next one, so the
/// steady state cycles 2 -> 3 -> 2 at 40 ms.
pub const REPEAT_TIME_MS: [u32; 4] = [80, 200, 40, 40];
pub const REPEAT_NEXT_PHASE: [usize; 4] = [1, 2, 3, 2];

/// P1 header positions 1..=26 to BCM GPIO numbers.
const P1_CONNECTOR: [Option<u8>; 26] = [
    None,
    None,
    Some(2),
    None,
    Some(3),
    None,
    Some(4),
    Some(14),
    None,
    Some(15),
    Some(17),
    Some(18),
    Some(27),
    None,
    Some(22),
    Some(23),
    None,
    Some(24),
    Some(10),
    None,
    Some(9),
    Some(25),
    Some(11),
    Some(8),
    None,
    Some(7),
];

/// P5 header positions 1..=8 (rev. 2 boards).
const P5_CONNECTOR: [Option<u8>; 8] = [
    None,
    None,
    Some(28),
    Some(29),
    Some(30),
    Some(31),
    None,
    None,
];

const_assert_eq!(P1_CONNECTOR.len(), 26);
const_assert_eq!(P5_CONNECTOR.len(), 8);

/// Resolve a textual pin specification to a BCM GPIO number.
///
/// Accepts a plain number (`17`), a `GPIO<n>` reference, or a
/// connector position: `PIN<n>`/`P1-<n>` on the P1 header, `P5-<n>`
/// on the P5 header. Returns `None` for malformed text, power/ground
/// positions, and pins outside the usable bank.
pub fn resolve_pin_spec(spec: &str) -> Option<u8> {
    let pin = if let Some(rest) = spec.strip_prefix("GPIO") {
        rest.parse::<u8>().ok()?
    } else if let Some(rest) = spec
        .strip_prefix("PIN")
        .or_else(|| spec.strip_prefix("P1-"))
    {
        let position: usize = rest.parse().ok()?;
        P1_CONNECTOR.get(position.checked_sub(1)?).copied().flatten()?
    } else if let Some(rest) = spec.strip_prefix("P5-") {
        let position: usize = rest.parse().ok()?;
        P5_CONNECTOR.get(position.checked_sub(1)?).copied().flatten()?
    } else {
        spec.parse::<u8>().ok()?
    };

    (pin < NUM_GPIO as u8).then_some(pin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_and_gpio_forms() {
        assert_eq!(resolve_pin_spec("17"), Some(17));
        assert_eq!(resolve_pin_spec("GPIO4"), Some(4));
        assert_eq!(resolve_pin_spec("GPIO31"), Some(31));
    }

    #[test]
    fn connector_positions_map_through_the_tables() {
        // P1 position 7 carries GPIO4, position 12 carries GPIO18.
        assert_eq!(resolve_pin_spec("PIN7"), Some(4));
        assert_eq!(resolve_pin_spec("P1-12"), Some(18));
        assert_eq!(resolve_pin_spec("P5-3"), Some(28));
    }

    #[test]
    fn power_and_ground_positions_are_invalid() {
        assert_eq!(resolve_pin_spec("PIN1"), None);
        assert_eq!(resolve_pin_spec("P1-2"), None);
        assert_eq!(resolve_pin_spec("P5-8"), None);
    }

    #[test]
    fn malformed_and_out_of_range_specs_are_invalid() {
        assert_eq!(resolve_pin_spec("GPIO99"), None);
        assert_eq!(resolve_pin_spec("GPIO4x"), None);
        assert_eq!(resolve_pin_spec("PIN0"), None);
        assert_eq!(resolve_pin_spec("P1-27"), None);
        assert_eq!(resolve_pin_spec("fourteen"), None);
        assert_eq!(resolve_pin_spec(""), None);
    }
}
