/*! Configuration-file tokenizer and parser.
 *
 * The format is line-oriented: one declaration per line, `#` starts
 * a comment, blank lines are no-ops. The first token of a line picks
 * the declaration and is itself the name being declared or bound
 * (`KEY_A`, `XIO1`, `MATRIX_LEFT`, ...):
 *
 * ```text
 * # a direct button, a matrix, an expander
 * KEY_A        GPIO4
 * MATRIX1      GPIO18
 * KEY_LEFT     MATRIX1:22
 * XIO1         7/0x20/MCP23008
 * KEY_ENTER    XIO1:3
 * PULL_UP      GPIO4
 * REPEAT       GPIO4,MATRIX1:22
 * ```
 *
 * Parsing is strict: the first malformed line aborts with the file
 * name and line number, and the daemon never starts polling. As pins
 * are referenced they are claimed from the pin bus (inputs for
 * buttons, outputs for matrix strobes), so direction conflicts also
 * surface here.
 */

use std::env;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;

use crate::pikeyd::hw_specific::{
    self, resolve_pin_spec, MAX_MATRIX_GROUPS, MAX_XIO_DEVS, NUM_GPIO, NUM_XIO_PINS,
};
use crate::pikeyd::{
    keymap, BindingModel, ConfigError, ConfigSummary, ExpanderBus, ExpanderDevice, ExpanderKind,
    MatrixGroup, PinBus, PinDirection, PinSetup, PullMode,
};

/// Read granularity for the token stream.
const CHUNK: usize = 512;

enum Token {
    Word(String),
    Newline,
}

/// Streaming tokenizer over any byte source. A token is a maximal
/// run of non-whitespace, non-`#` characters; newlines are tokens of
/// their own so the parser can group one command per line.
struct Tokenizer<R> {
    src: R,
    buf: [u8; CHUNK],
    len: usize,
    pos: usize,
    newlines: usize,
}

impl<R: Read> Tokenizer<R> {
    fn new(src: R) -> Self {
        Tokenizer {
            src,
            buf: [0; CHUNK],
            len: 0,
            pos: 0,
            newlines: 0,
        }
    }

    fn peek(&mut self) -> io::Result<Option<u8>> {
        if self.pos == self.len {
            self.len = self.src.read(&mut self.buf)?;
            self.pos = 0;
            if self.len == 0 {
                return Ok(None);
            }
        }
        Ok(Some(self.buf[self.pos]))
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    fn next_token(&mut self) -> io::Result<Option<Token>> {
        // Chew through whitespace and comments to the next token.
        loop {
            match self.peek()? {
                None => return Ok(None),
                Some(b'#') => {
                    // Comments run to end of line; the newline itself
                    // still gets reported.
                    self.bump();
                    while let Some(c) = self.peek()? {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b' ') | Some(b'\t') | Some(b'\r') => self.bump(),
                Some(b'\n') => {
                    self.bump();
                    self.newlines += 1;
                    return Ok(Some(Token::Newline));
                }
                Some(_) => break,
            }
        }

        // Gobble up the token.
        let mut word = Vec::new();
        while let Some(c) = self.peek()? {
            if matches!(c, b' ' | b'\t' | b'\r' | b'#' | b'\n') {
                break;
            }
            word.push(c);
            self.bump();
        }
        Ok(Some(Token::Word(
            String::from_utf8_lossy(&word).into_owned(),
        )))
    }

    /// Collect the next line's tokens. Returns the 1-based line
    /// number alongside; an empty token list is a blank or
    /// comment-only line. `None` at end of input.
    fn next_command(&mut self) -> io::Result<Option<(usize, Vec<String>)>> {
        let mut cmd = Vec::new();
        let mut line = self.newlines + 1;
        loop {
            match self.next_token()? {
                None => {
                    return Ok(if cmd.is_empty() {
                        None
                    } else {
                        Some((line, cmd))
                    });
                }
                Some(Token::Newline) => return Ok(Some((line, cmd))),
                Some(Token::Word(w)) => {
                    if cmd.is_empty() {
                        line = self.newlines + 1;
                    }
                    cmd.push(w);
                }
            }
        }
    }
}

/// A parsed pin reference: direct pin, matrix-group pin, or expander
/// pin.
enum PinRef {
    Direct(u8),
    Matrix { grp: usize, pin: u8 },
    Xio { dev: usize, pin: u8 },
}

/// Search the standard locations and parse the first file found.
pub fn load<B: PinBus, X: ExpanderBus>(
    pins: &mut B,
    xio_bus: &mut X,
) -> Result<(BindingModel, ConfigSummary), ConfigError> {
    for path in candidate_paths() {
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(_) => continue,
        };
        log::info!("Config file is {}", path.display());
        return parse_reader(&path.display().to_string(), file, pins, xio_bus);
    }
    Err(ConfigError::NotFound)
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(format!("./{}", hw_specific::CONFIG_FILENAME))];
    if let Ok(home) = env::var("HOME") {
        paths.push(PathBuf::from(format!(
            "{home}/.{}",
            hw_specific::CONFIG_FILENAME
        )));
    }
    paths.push(PathBuf::from(format!(
        "/etc/{}",
        hw_specific::CONFIG_FILENAME
    )));
    paths
}

/// Parse a configuration from any byte source. `file` only labels
/// diagnostics.
pub fn parse_reader<R: Read, B: PinBus, X: ExpanderBus>(
    file: &str,
    src: R,
    pins: &mut B,
    xio_bus: &mut X,
) -> Result<(BindingModel, ConfigSummary), ConfigError> {
    let parser = Parser {
        file: file.to_string(),
        pins,
        xio_bus,
        model: BindingModel::new(),
    };
    parser.run(src)
}

struct Parser<'a, B, X> {
    file: String,
    pins: &'a mut B,
    xio_bus: &'a mut X,
    model: BindingModel,
}

impl<B: PinBus, X: ExpanderBus> Parser<'_, B, X> {
    fn run<R: Read>(mut self, src: R) -> Result<(BindingModel, ConfigSummary), ConfigError> {
        let mut tokens = Tokenizer::new(src);
        loop {
            let next = tokens.next_command().map_err(|e| ConfigError::Io {
                file: self.file.clone(),
                source: e,
            })?;
            let (line, cmd) = match next {
                Some(c) => c,
                None => break,
            };
            if cmd.is_empty() {
                continue;
            }
            self.command(line, &cmd)?;
        }
        self.finish()
    }

    fn fail<T>(&self, line: usize, msg: String) -> Result<T, ConfigError> {
        Err(ConfigError::Parse {
            file: self.file.clone(),
            line,
            msg,
        })
    }

    fn command(&mut self, line: usize, cmd: &[String]) -> Result<(), ConfigError> {
        let word = cmd[0].as_str();
        if word.starts_with("KEY") {
            self.key_decl(line, cmd)
        } else if word.starts_with("XIO") {
            self.xio_decl(line, cmd)
        } else if word.starts_with("MATRIX") {
            self.matrix_decl(line, cmd)
        } else if word.starts_with("PULL") {
            self.pull_decl(line, cmd)
        } else if word.starts_with("REPEAT") {
            self.repeat_decl(line, cmd)
        } else {
            self.fail(line, format!("Unknown configuration item: {word}"))
        }
    }

    /// Every declaration takes exactly one value token.
    fn one_value<'c>(
        &self,
        line: usize,
        cmd: &'c [String],
        what: &str,
    ) -> Result<&'c str, ConfigError> {
        if cmd.len() != 2 {
            return self.fail(
                line,
                format!(
                    "'{what}' definition requires 1 value. ({} given)",
                    cmd.len() - 1
                ),
            );
        }
        Ok(&cmd[1])
    }

    fn key_decl(&mut self, line: usize, cmd: &[String]) -> Result<(), ConfigError> {
        let value = self.one_value(line, cmd, "KEY")?;

        let code = match keymap::lookup(&cmd[0]) {
            Some(code) => code,
            None => return self.fail(line, format!("Unknown KEY value ({})", cmd[0])),
        };

        match self.pin_ref(line, value)? {
            PinRef::Xio { dev, pin } => {
                self.model.expanders[dev].keys.add(pin, code, None);
            }
            PinRef::Matrix { grp, pin } => {
                self.configure_input(line, pin)?;
                self.model.groups[grp].bind(pin, code);
            }
            PinRef::Direct(pin) => {
                self.configure_input(line, pin)?;
                self.model.groups[0].bind(pin, code);
            }
        }
        Ok(())
    }

    fn xio_decl(&mut self, line: usize, cmd: &[String]) -> Result<(), ConfigError> {
        let value = self.one_value(line, cmd, "XIO")?;
        let name = cmd[0].as_str();

        if self.model.find_expander(name).is_some() {
            return self.fail(line, format!("Duplicate 'XIO' expander definition: {name}"));
        }
        if self.model.expanders.len() >= MAX_XIO_DEVS {
            return self.fail(
                line,
                format!("Too many 'XIO' expander devices ({MAX_XIO_DEVS} maximum)"),
            );
        }

        // <interrupt pin>/<bus address>/<chip variant>
        let mut fields = value.splitn(3, '/');
        let parsed = (|| {
            let pin = fields.next()?.parse::<u8>().ok()?;
            let addr = parse_int(fields.next()?)?;
            let label = fields.next()?;
            if (pin as usize) < NUM_GPIO && (0..=0x7f).contains(&addr) {
                Some((pin, addr as u16, label))
            } else {
                None
            }
        })();
        let (pin, addr, label) = match parsed {
            Some(p) => p,
            None => return self.fail(line, format!("Invalid XIO data for {name} [{value}]")),
        };

        let kind = ExpanderKind::from_label(label);
        let dev = self.model.expanders.len();
        self.model
            .expanders
            .push(ExpanderDevice::new(name.to_string(), kind, addr));

        // The chip's interrupt line is an ordinary input pin of the
        // direct group, marked so polling routes it to the device.
        self.configure_input(line, pin)?;
        self.model.groups[0].bind_route(pin, dev);
        Ok(())
    }

    fn matrix_decl(&mut self, line: usize, cmd: &[String]) -> Result<(), ConfigError> {
        let value = self.one_value(line, cmd, "MATRIX")?;
        let name = cmd[0].as_str();

        if self.model.find_group(name).is_some() {
            return self.fail(line, format!("Duplicate 'MATRIX' group definition: {name}"));
        }
        if self.model.groups.len() > MAX_MATRIX_GROUPS {
            return self.fail(
                line,
                format!("Too many 'MATRIX' groups ({MAX_MATRIX_GROUPS} maximum)"),
            );
        }

        let pin = match resolve_pin_spec(value) {
            Some(pin) => pin,
            None => return self.fail(line, format!("Invalid GPIO PIN reference ({value})")),
        };

        // The strobe line must be exclusively ours.
        match self.pins.configure_pin(pin, PinDirection::Output) {
            Ok(PinSetup::Configured) => {}
            Ok(PinSetup::AlreadyConfigured) => {
                return self.fail(line, format!("Matrix driver GPIO{pin:02} already configured."));
            }
            Err(e) => return self.fail(line, e.to_string()),
        }

        self.model
            .groups
            .push(MatrixGroup::matrix(name.to_string(), pin));
        Ok(())
    }

    fn pull_decl(&mut self, line: usize, cmd: &[String]) -> Result<(), ConfigError> {
        let value = self.one_value(line, cmd, "PULL")?;

        let mode = match cmd[0].as_str() {
            "PULL_DOWN" => PullMode::Down,
            "PULL_UP" => PullMode::Up,
            "PULL_FLOAT" => PullMode::Float,
            other => return self.fail(line, format!("Invalid PULL command ({other})")),
        };

        let pin = match resolve_pin_spec(value) {
            Some(pin) => pin,
            None => return self.fail(line, format!("Invalid GPIO PIN reference ({value})")),
        };

        match self.pins.set_pull(pin, mode) {
            Ok(()) => Ok(()),
            Err(e) => self.fail(line, e.to_string()),
        }
    }

    fn repeat_decl(&mut self, line: usize, cmd: &[String]) -> Result<(), ConfigError> {
        let value = self.one_value(line, cmd, "REPEAT")?;

        for part in value.split(',') {
            if part.is_empty() {
                continue;
            }
            match self.pin_ref(line, part)? {
                PinRef::Matrix { grp, pin } => {
                    self.model.groups[grp].repeat_mask |= 1 << pin;
                }
                PinRef::Xio { .. } => {
                    log::warn!("Repeat not implemented for XIO ({part})");
                }
                PinRef::Direct(pin) => {
                    self.model.groups[0].repeat_mask |= 1 << pin;
                }
            }
        }
        Ok(())
    }

    /// Resolve a pin reference token: `XIO<name>:<pin>`,
    /// `MATRIX<name>:<pin-spec>`, or a direct pin spec.
    fn pin_ref(&self, line: usize, s: &str) -> Result<PinRef, ConfigError> {
        if s.starts_with("XIO") {
            let Some((name, pin_str)) = s.split_once(':') else {
                return self.fail(line, format!("Invalid expander definition: {s}"));
            };
            let Some(dev) = self.model.find_expander(name) else {
                return self.fail(line, format!("Unknown expander: {s}"));
            };
            let pin = parse_int(pin_str).filter(|&p| (0..NUM_XIO_PINS as i64).contains(&p));
            match pin {
                Some(pin) => Ok(PinRef::Xio {
                    dev,
                    pin: pin as u8,
                }),
                None => self.fail(line, format!("Invalid expander definition: {s}")),
            }
        } else if s.starts_with("MATRIX") {
            let Some((name, pin_str)) = s.split_once(':') else {
                return self.fail(line, format!("Invalid Matrix definition: {s}"));
            };
            let Some(grp) = self.model.find_group(name) else {
                return self.fail(line, format!("Matrix group not defined ({s})"));
            };
            match resolve_pin_spec(pin_str) {
                Some(pin) => Ok(PinRef::Matrix { grp, pin }),
                None => self.fail(line, format!("Invalid GPIO PIN reference ({pin_str})")),
            }
        } else {
            match resolve_pin_spec(s) {
                Some(pin) => Ok(PinRef::Direct(pin)),
                None => self.fail(line, format!("Invalid GPIO PIN reference ({s})")),
            }
        }
    }

    fn configure_input(&mut self, line: usize, pin: u8) -> Result<(), ConfigError> {
        match self.pins.configure_pin(pin, PinDirection::Input) {
            Ok(_) => Ok(()),
            Err(e) => self.fail(line, e.to_string()),
        }
    }

    /// Finalize after the stream is exhausted: seed per-group state,
    /// derive expander input masks, bring the chips up, and classify
    /// the configuration.
    fn finish(mut self) -> Result<(BindingModel, ConfigSummary), ConfigError> {
        // Idle state is all-released (lines high under pull-ups), so
        // start-up does not look like a burst of transitions.
        for group in &mut self.model.groups {
            group.last_raw = group.pin_mask;
        }

        for dev in &mut self.model.expanders {
            dev.input_mask = dev
                .keys
                .bound_pins()
                .fold(0u8, |mask, pin| mask | (1 << pin));
            dev.init_registers(&mut *self.xio_bus)?;
            match self.xio_bus.read_register(dev.addr, dev.kind.input_register()) {
                Ok(value) => log::debug!("expander {}: probe read {value:#04x}", dev.name),
                Err(e) => log::warn!("expander {}: probe read failed: {e}", dev.name),
            }
        }

        if log::log_enabled!(log::Level::Debug) {
            dump_model(&self.model);
        }

        let summary = if self.model.groups.len() > 1 {
            ConfigSummary::Matrix
        } else if !self.model.expanders.is_empty() {
            ConfigSummary::Expander
        } else {
            ConfigSummary::Direct
        };
        Ok((self.model, summary))
    }
}

/// Integer with optional `0x` prefix, as bus addresses are usually
/// written in hex.
fn parse_int(s: &str) -> Option<i64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Log the parsed configuration, one line per bound pin.
fn dump_model(model: &BindingModel) {
    for (idx, group) in model.groups.iter().enumerate() {
        let label = group.name.as_deref().unwrap_or("direct");
        for pin in group.keys.bound_pins() {
            let keys: Vec<String> = group
                .keys
                .chain(pin)
                .iter()
                .map(|b| match b.xio {
                    Some(dev) => format!("-> {}", model.expanders[dev].name),
                    None => keymap::label(b.code),
                })
                .collect();
            log::debug!("group {idx} ({label}) GPIO{pin:02}: {}", keys.join(", "));
        }
    }
    for dev in &model.expanders {
        for pin in dev.keys.bound_pins() {
            let keys: Vec<String> = dev
                .keys
                .chain(pin)
                .iter()
                .map(|b| keymap::label(b.code))
                .collect();
            log::debug!(
                "expander {} ({:?} at {:#04x}) pin {pin}: {}",
                dev.name,
                dev.kind,
                dev.addr,
                keys.join(", ")
            );
        }
    }
}
