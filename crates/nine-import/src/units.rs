//! Unit text of mechanism files: sanitising, local aliases and dimensions.

use std::collections::BTreeMap;

use log::debug;
use nine_dynamics::units::{lookup_symbol, NAMED_DIMENSIONS};
use nine_dynamics::{Dimension, Unit};

use crate::{ImportError, Result};

/// Unit names that may annotate numbers inside expressions without an alias
const IMPLICIT_ANNOTATIONS: &[&str] = &["degC", "kelvin"];

/// Spelled-out prefixes and their symbols
const LONG_PREFIXES: &[(&str, &str)] = &[
    ("milli", "m"),
    ("micro", "u"),
    ("nano", "n"),
    ("pico", "p"),
    ("femto", "f"),
    ("centi", "c"),
    ("deci", "d"),
    ("kilo", "k"),
    ("mega", "M"),
];

/// Dimensions outside the named table that mechanism files commonly use
fn extra_dimensions() -> [Dimension; 6] {
    [
        Dimension::CURRENT / Dimension::TIME,
        Dimension::CHARGE / Dimension::VOLUME,
        Dimension::AMOUNT / Dimension::AREA,
        Dimension::CONCENTRATION / Dimension::TIME,
        Dimension::ENERGY / Dimension::TEMPERATURE,
        Dimension::AMOUNT / Dimension::TIME,
    ]
}

/// Whether `d` is one of the dimensions imported quantities may have
pub fn is_known_dimension(d: Dimension) -> bool {
    NAMED_DIMENSIONS.iter().any(|(_, known)| *known == d) || extra_dimensions().contains(&d)
}

/// Normalise NMODL unit spelling into the grammar of [`Unit::parse`]
///
/// `1` stays dimensionless, `mv` becomes `mV`, a leading `/` gets a `1`,
/// trailing digits become powers (`cm2` → `cm^2`) and a hyphen divides
/// (`ohm-cm` → `(ohm)/cm`).
pub fn sanitize(text: &str) -> String {
    let mut units = text.trim().to_string();
    if units.is_empty() || units == "1" {
        return "1".to_string();
    }
    if units == "mv" {
        units = "mV".to_string();
    }
    if units.starts_with('/') {
        units.insert(0, '1');
    }
    let mut powered = String::with_capacity(units.len() + 4);
    let chars: Vec<char> = units.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if c.is_ascii_digit() && i > 0 && chars[i - 1].is_ascii_alphabetic() {
            powered.push('^');
        }
        powered.push(*c);
    }
    if let Some((begin, end)) = powered.split_once('-') {
        let letters = |s: &str, last: bool| {
            let c = if last { s.chars().last() } else { s.chars().next() };
            c.map_or(false, |c| c.is_ascii_alphabetic())
        };
        // a hyphen between letters joins two units; `^-1` is an exponent
        if letters(begin, true) && letters(end, false) {
            return format!("({})/{}", begin, end);
        }
    }
    powered
}

/// Rewrite spelled-out prefixes (`milliamp` → `mamp`) where the remainder is a unit
fn shorten_prefixes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut word = String::new();
    let flush = |word: &mut String, out: &mut String| {
        if !word.is_empty() {
            let mut replaced = None;
            if lookup_symbol(word).is_none() {
                for (long, short) in LONG_PREFIXES {
                    if let Some(rest) = word.strip_prefix(long) {
                        if !rest.is_empty() && lookup_symbol(rest).is_some() {
                            replaced = Some(format!("{}{}", short, rest));
                            break;
                        }
                    }
                }
            }
            out.push_str(replaced.as_deref().unwrap_or(word));
            word.clear();
        }
    };
    for c in text.chars() {
        if c.is_alphabetic() || c == '_' {
            word.push(c);
        } else {
            flush(&mut word, &mut out);
            out.push(c);
        }
    }
    flush(&mut word, &mut out);
    out
}

/// Units known to one mechanism file: built-in symbols plus its UNITS aliases
#[derive(Debug, Clone, Default)]
pub struct UnitTable {
    aliases: BTreeMap<String, String>,
    declared: Vec<String>,
}

impl UnitTable {
    /// Table with no local aliases
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `(alias) = (definition)` from a UNITS block
    ///
    /// An alias that already names a unit keeps its built-in meaning.
    pub fn define(&mut self, alias: &str, definition: &str) -> Result<()> {
        let alias = alias.trim();
        self.declared.push(alias.to_string());
        if Unit::parse(&sanitize(alias)).is_ok() {
            return Ok(());
        }
        let expanded = shorten_prefixes(&self.substitute_aliases(&sanitize(definition)));
        Unit::parse(&expanded).map_err(|e| ImportError::unknown_dimension(definition, e.to_string()))?;
        debug!("unit alias '{}' = '{}'", alias, expanded);
        self.aliases.insert(alias.to_string(), expanded);
        Ok(())
    }

    fn substitute_aliases(&self, text: &str) -> String {
        if self.aliases.is_empty() {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        let mut word = String::new();
        let flush = |word: &mut String, out: &mut String| {
            match self.aliases.get(word.as_str()) {
                Some(def) => {
                    out.push('(');
                    out.push_str(def);
                    out.push(')');
                }
                None => out.push_str(word),
            }
            word.clear();
        };
        for c in text.chars() {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
            } else {
                flush(&mut word, &mut out);
                out.push(c);
            }
        }
        flush(&mut word, &mut out);
        out
    }

    /// Resolve unit text to a unit with a known dimension
    pub fn resolve(&self, text: &str) -> Result<Unit> {
        let sanitized = sanitize(text);
        let expanded = shorten_prefixes(&self.substitute_aliases(&sanitized));
        let mut unit =
            Unit::parse(&expanded).map_err(|e| ImportError::unknown_dimension(text.trim(), e.to_string()))?;
        if !is_known_dimension(unit.dimension) {
            return Err(ImportError::unknown_dimension(
                text.trim(),
                format!("dimension {} is not supported", unit.dimension),
            ));
        }
        unit.name = sanitized;
        Ok(unit)
    }

    /// Dimension of unit text
    pub fn dimension(&self, text: &str) -> Result<Dimension> {
        Ok(self.resolve(text)?.dimension)
    }

    /// Unit names that may appear as `(name)` annotations inside expressions
    pub fn annotation_names(&self) -> impl Iterator<Item = &str> {
        self.declared
            .iter()
            .map(String::as_str)
            .chain(IMPLICIT_ANNOTATIONS.iter().copied())
    }
}
