/*! In-memory binding model.
 *
 * Built once by the configuration parser and never grown afterwards:
 * per-pin chains of bound keys, one chain set per matrix group and
 * per expander device. The poll and repeat engines step the mutable
 * parts (cursor, debounce counters, repeat timers) every cycle.
 *
 * A chain is an ordered sequence: one physical switch may be mapped
 * to several logical keys, and a dispatch episode walks them in
 * declaration order. Traversal goes through a restartable cursor so
 * the engines can treat a chain as a finite "next key" sequence.
 */

use crate::pikeyd::hw_specific::{NUM_GPIO, NUM_XIO_PINS};

/// Sentinel returned by [`KeyChains::next_key`] when a chain is
/// exhausted or empty. Key code 0 is reserved by the input layer.
pub const NO_KEY: u16 = 0;

/// One key bound to one pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBinding {
    pub pin: u8,
    /// Position within the pin's chain, in declaration order.
    pub seq: usize,
    pub code: u16,
    /// Set when the binding routes the pin to an expander's interrupt
    /// line instead of a direct key; `code` is [`NO_KEY`] then.
    pub xio: Option<usize>,
}

/// Per-pin ordered key chains plus the traversal cursor, shared by
/// matrix groups and expander devices.
#[derive(Debug, Clone)]
pub struct KeyChains {
    chains: Vec<Vec<KeyBinding>>,
    /// Last visited (pin, chain index), `None` when before the first
    /// binding or after the last.
    cursor: Option<(u8, usize)>,
}

impl KeyChains {
    pub fn new(pin_count: usize) -> Self {
        KeyChains {
            chains: vec![Vec::new(); pin_count],
            cursor: None,
        }
    }

    /// Append a binding to the tail of a pin's chain.
    pub fn add(&mut self, pin: u8, code: u16, xio: Option<usize>) {
        let chain = &mut self.chains[pin as usize];
        let seq = chain.len();
        chain.push(KeyBinding {
            pin,
            seq,
            code,
            xio,
        });
    }

    /// Reset the cursor to "before first".
    pub fn restart(&mut self) {
        self.cursor = None;
    }

    /// Whether another binding remains unvisited in `pin`'s chain.
    pub fn has_more(&self, pin: u8) -> bool {
        match self.cursor {
            Some((p, idx)) if p == pin => idx + 1 < self.chains[pin as usize].len(),
            _ => !self.chains[pin as usize].is_empty(),
        }
    }

    /// Advance the cursor and return the bound key code, or [`NO_KEY`]
    /// once the chain is exhausted (or was empty). Starting a new pin,
    /// or calling without a prior [`restart`](Self::restart), begins
    /// at the chain head; exhaustion resets the cursor so the next
    /// call starts over.
    pub fn next_key(&mut self, pin: u8) -> u16 {
        let idx = match self.cursor {
            Some((p, idx)) if p == pin => idx + 1,
            _ => 0,
        };
        match self.chains[pin as usize].get(idx) {
            Some(binding) => {
                self.cursor = Some((pin, idx));
                binding.code
            }
            None => {
                self.cursor = None;
                NO_KEY
            }
        }
    }

    /// Key code at the cursor's current position, without advancing.
    pub fn current_key(&self) -> u16 {
        self.current_binding().map_or(NO_KEY, |b| b.code)
    }

    /// Binding at the cursor's current position.
    pub fn current_binding(&self) -> Option<&KeyBinding> {
        let (pin, idx) = self.cursor?;
        self.chains[pin as usize].get(idx)
    }

    /// The whole chain for one pin, in declaration order.
    pub fn chain(&self, pin: u8) -> &[KeyBinding] {
        &self.chains[pin as usize]
    }

    /// Whether the pin's first binding routes to an expander rather
    /// than a direct key.
    pub fn is_routed(&self, pin: u8) -> bool {
        self.routed_expander(pin).is_some()
    }

    /// The expander behind a routed pin.
    pub fn routed_expander(&self, pin: u8) -> Option<usize> {
        self.chains[pin as usize].first()?.xio
    }

    /// Pins with at least one binding.
    pub fn bound_pins(&self) -> impl Iterator<Item = u8> + '_ {
        self.chains
            .iter()
            .enumerate()
            .filter(|(_, chain)| !chain.is_empty())
            .map(|(pin, _)| pin as u8)
    }
}

/// Key-repeat timing state for one pin.
#[derive(Debug, Clone, Copy)]
pub struct RepeatState {
    /// Index into the repeat phase table, -1 while idle.
    pub phase: i8,
    pub elapsed_ms: u32,
    pub deadline_ms: u32,
}

impl Default for RepeatState {
    fn default() -> Self {
        RepeatState {
            phase: -1,
            elapsed_ms: 0,
            deadline_ms: 0,
        }
    }
}

/// One polled unit of input pins. Group 0 is the implicit direct
/// group (no name, no strobe); every `MATRIX` declaration adds a
/// group whose pins are only readable while its strobe line is driven
/// low.
#[derive(Debug, Clone)]
pub struct MatrixGroup {
    pub name: Option<String>,
    pub strobe: Option<u8>,
    /// Union of pins with at least one binding.
    pub pin_mask: u32,
    pub keys: KeyChains,
    pub last_raw: u32,
    /// Bits that changed since the last stable state, awaiting
    /// debounce.
    pub pending: u32,
    pub bounce_cnt: u8,
    pub repeat_mask: u32,
    /// Pins held on the previous cycle; a pin must be held two cycles
    /// running before the repeat timer advances.
    pub prev_held: u32,
    pub repeat: Vec<RepeatState>,
}

impl MatrixGroup {
    /// The implicit direct-GPIO group.
    pub fn direct() -> Self {
        Self::with(None, None)
    }

    /// A named matrix group with its strobe line.
    pub fn matrix(name: String, strobe: u8) -> Self {
        Self::with(Some(name), Some(strobe))
    }

    fn with(name: Option<String>, strobe: Option<u8>) -> Self {
        MatrixGroup {
            name,
            strobe,
            pin_mask: 0,
            keys: KeyChains::new(NUM_GPIO),
            last_raw: 0,
            pending: 0,
            bounce_cnt: 0,
            repeat_mask: 0,
            prev_held: 0,
            repeat: vec![RepeatState::default(); NUM_GPIO],
        }
    }

    /// Bind a key to one of the group's pins.
    pub fn bind(&mut self, pin: u8, code: u16) {
        self.keys.add(pin, code, None);
        self.pin_mask |= 1 << pin;
    }

    /// Mark a pin as expander `dev`'s interrupt line.
    pub fn bind_route(&mut self, pin: u8, dev: usize) {
        self.keys.add(pin, NO_KEY, Some(dev));
        self.pin_mask |= 1 << pin;
    }
}

/// Chip variant of an I2C expander. The variant only selects register
/// numbers; behavior is identical across chips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpanderKind {
    Mcp23008,
    Mcp23017A,
    Mcp23017B,
    Unknown,
}

impl ExpanderKind {
    pub fn from_label(label: &str) -> Self {
        if label.starts_with("MCP23017A") {
            ExpanderKind::Mcp23017A
        } else if label.starts_with("MCP23017B") {
            ExpanderKind::Mcp23017B
        } else if label.starts_with("MCP23008") {
            ExpanderKind::Mcp23008
        } else {
            ExpanderKind::Unknown
        }
    }

    /// Register holding the chip's input port (GPIO register, in the
    /// bank the variant uses).
    pub fn input_register(self) -> u8 {
        match self {
            ExpanderKind::Mcp23008 | ExpanderKind::Mcp23017A => 0x09,
            ExpanderKind::Mcp23017B => 0x19,
            ExpanderKind::Unknown => 0,
        }
    }

    /// Base offset of the configuration register block, `None` when
    /// the chip is unknown and must not be written blind.
    pub fn config_offset(self) -> Option<u8> {
        match self {
            ExpanderKind::Mcp23008 | ExpanderKind::Mcp23017A => Some(0x00),
            ExpanderKind::Mcp23017B => Some(0x10),
            ExpanderKind::Unknown => None,
        }
    }
}

/// One I2C port expander and its key bindings.
#[derive(Debug, Clone)]
pub struct ExpanderDevice {
    pub name: String,
    pub kind: ExpanderKind,
    pub addr: u16,
    /// Union of pins with at least one binding; only these bits of
    /// the input register are watched.
    pub input_mask: u8,
    pub last_value: u8,
    pub keys: KeyChains,
}

impl ExpanderDevice {
    pub fn new(name: String, kind: ExpanderKind, addr: u16) -> Self {
        ExpanderDevice {
            name,
            kind,
            addr,
            input_mask: 0,
            // All lines idle high (pull-ups) until the first read.
            last_value: 0xff,
            keys: KeyChains::new(NUM_XIO_PINS),
        }
    }
}

/// Everything the parser produced: group 0 plus any matrix groups,
/// and any expander devices. Chains are disjoint namespaces per
/// group/device.
#[derive(Debug, Clone)]
pub struct BindingModel {
    pub groups: Vec<MatrixGroup>,
    pub expanders: Vec<ExpanderDevice>,
}

impl Default for BindingModel {
    fn default() -> Self {
        Self::new()
    }
}

impl BindingModel {
    pub fn new() -> Self {
        BindingModel {
            groups: vec![MatrixGroup::direct()],
            expanders: Vec::new(),
        }
    }

    /// Index of a named matrix group. The direct group is unnamed and
    /// never matches.
    pub fn find_group(&self, name: &str) -> Option<usize> {
        self.groups
            .iter()
            .position(|g| g.name.as_deref() == Some(name))
    }

    pub fn find_expander(&self, name: &str) -> Option<usize> {
        self.expanders.iter().position(|d| d.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chains_preserve_declaration_order() {
        let mut keys = KeyChains::new(NUM_GPIO);
        keys.add(4, 30, None);
        keys.add(4, 42, None);
        keys.add(4, 46, None);

        for _ in 0..3 {
            keys.restart();
            let mut seen = Vec::new();
            while keys.has_more(4) {
                seen.push(keys.next_key(4));
            }
            assert_eq!(seen, vec![30, 42, 46]);
        }
    }

    #[test]
    fn next_key_without_restart_starts_at_the_head() {
        let mut keys = KeyChains::new(NUM_GPIO);
        keys.add(7, 17, None);
        assert_eq!(keys.next_key(7), 17);
        assert_eq!(keys.current_key(), 17);
        // Exhausted; the cursor resets so the next call starts over.
        assert_eq!(keys.next_key(7), NO_KEY);
        assert_eq!(keys.next_key(7), 17);
    }

    #[test]
    fn switching_pins_restarts_traversal() {
        let mut keys = KeyChains::new(NUM_GPIO);
        keys.add(1, 10, None);
        keys.add(1, 11, None);
        keys.add(2, 20, None);

        keys.restart();
        assert_eq!(keys.next_key(1), 10);
        assert_eq!(keys.next_key(2), 20);
        assert_eq!(keys.next_key(1), 10);
    }

    #[test]
    fn empty_chain_yields_the_sentinel() {
        let mut keys = KeyChains::new(NUM_GPIO);
        assert!(!keys.has_more(3));
        assert_eq!(keys.next_key(3), NO_KEY);
        assert_eq!(keys.current_key(), NO_KEY);
    }

    #[test]
    fn routed_pins_are_detected_by_their_first_binding() {
        let mut group = MatrixGroup::direct();
        group.bind_route(5, 0);
        group.bind(6, 30);

        assert!(group.keys.is_routed(5));
        assert_eq!(group.keys.routed_expander(5), Some(0));
        assert!(!group.keys.is_routed(6));
        assert_eq!(group.pin_mask, (1 << 5) | (1 << 6));
    }

    #[test]
    fn expander_kinds_map_to_register_layouts() {
        assert_eq!(ExpanderKind::from_label("MCP23008"), ExpanderKind::Mcp23008);
        assert_eq!(
            ExpanderKind::from_label("MCP23017A"),
            ExpanderKind::Mcp23017A
        );
        assert_eq!(
            ExpanderKind::from_label("MCP23017B"),
            ExpanderKind::Mcp23017B
        );
        assert_eq!(ExpanderKind::from_label("PCF8574"), ExpanderKind::Unknown);

        assert_eq!(ExpanderKind::Mcp23008.input_register(), 0x09);
        assert_eq!(ExpanderKind::Mcp23017B.input_register(), 0x19);
        assert_eq!(ExpanderKind::Mcp23017B.config_offset(), Some(0x10));
        assert_eq!(ExpanderKind::Unknown.config_offset(), None);
    }
}
