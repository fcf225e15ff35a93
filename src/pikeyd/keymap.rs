/*! Key-name resolution.
 *
 * The configuration file names keys by their kernel input names
 * (`KEY_A`, `KEY_LEFTSHIFT`, `BTN_LEFT`, ...). The evdev crate
 * carries the full name table, so resolution is a straight lookup
 * plus a range check against the codes the virtual keyboard
 * registers.
 */

use std::str::FromStr;

use evdev::Key;

use crate::pikeyd::hw_specific::MAX_KEY_CODE;

/// Resolve a symbolic key name to its input-event code. `None` for
/// unknown names and for codes outside the emittable range.
pub fn lookup(name: &str) -> Option<u16> {
    let key = Key::from_str(name).ok()?;
    (key.code() < MAX_KEY_CODE).then_some(key.code())
}

/// Human-readable label for a bound key code, for configuration
/// dumps.
pub fn label(code: u16) -> String {
    format!("{:?}", Key::new(code))
}
