//! Physical dimensions, units and dimensioned quantities.
//!
//! A [`Dimension`] is a vector of exponents over the seven SI base
//! quantities. A [`Unit`] pairs a dimension with a decimal power relative to
//! the coherent SI unit (kg, m, s, A, mol, K, cd) and an optional offset, so
//! `mV` is `(voltage, -3)` and `degC` is `(temperature, 0, +273.15)`.

use std::fmt::{self, Display, Formatter};
use std::ops::{Div, Mul};

use serde::{Deserialize, Serialize};

use crate::{DynamicsError, Result};

fn is_zero(v: &i8) -> bool {
    *v == 0
}

/// Exponents over the SI base quantities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Dimension {
    /// Mass
    #[serde(default, skip_serializing_if = "is_zero")]
    pub m: i8,
    /// Length
    #[serde(default, skip_serializing_if = "is_zero")]
    pub l: i8,
    /// Time
    #[serde(default, skip_serializing_if = "is_zero")]
    pub t: i8,
    /// Electric current
    #[serde(default, skip_serializing_if = "is_zero")]
    pub i: i8,
    /// Amount of substance
    #[serde(default, skip_serializing_if = "is_zero")]
    pub n: i8,
    /// Temperature
    #[serde(default, skip_serializing_if = "is_zero")]
    pub k: i8,
    /// Luminous intensity
    #[serde(default, skip_serializing_if = "is_zero")]
    pub j: i8,
}

/// SI symbols of the base quantities, in [`Dimension::exponents`] order
pub const SI_BASE_SYMBOLS: [&str; 7] = ["kg", "m", "s", "A", "mol", "K", "cd"];

const fn dim(m: i8, l: i8, t: i8, i: i8, n: i8, k: i8, j: i8) -> Dimension {
    Dimension { m, l, t, i, n, k, j }
}

impl Dimension {
    /// No dimension
    pub const DIMENSIONLESS: Dimension = dim(0, 0, 0, 0, 0, 0, 0);
    /// Mass
    pub const MASS: Dimension = dim(1, 0, 0, 0, 0, 0, 0);
    /// Length
    pub const LENGTH: Dimension = dim(0, 1, 0, 0, 0, 0, 0);
    /// Area
    pub const AREA: Dimension = dim(0, 2, 0, 0, 0, 0, 0);
    /// Volume
    pub const VOLUME: Dimension = dim(0, 3, 0, 0, 0, 0, 0);
    /// Time
    pub const TIME: Dimension = dim(0, 0, 1, 0, 0, 0, 0);
    /// Inverse time
    pub const PER_TIME: Dimension = dim(0, 0, -1, 0, 0, 0, 0);
    /// Current
    pub const CURRENT: Dimension = dim(0, 0, 0, 1, 0, 0, 0);
    /// Amount of substance
    pub const AMOUNT: Dimension = dim(0, 0, 0, 0, 1, 0, 0);
    /// Temperature
    pub const TEMPERATURE: Dimension = dim(0, 0, 0, 0, 0, 1, 0);
    /// Luminous intensity
    pub const LUMINOUS_INTENSITY: Dimension = dim(0, 0, 0, 0, 0, 0, 1);
    /// Voltage
    pub const VOLTAGE: Dimension = dim(1, 2, -3, -1, 0, 0, 0);
    /// Inverse voltage
    pub const PER_VOLTAGE: Dimension = dim(-1, -2, 3, 1, 0, 0, 0);
    /// Capacitance
    pub const CAPACITANCE: Dimension = dim(-1, -2, 4, 2, 0, 0, 0);
    /// Conductance
    pub const CONDUCTANCE: Dimension = dim(-1, -2, 3, 2, 0, 0, 0);
    /// Resistance
    pub const RESISTANCE: Dimension = dim(1, 2, -3, -2, 0, 0, 0);
    /// Charge
    pub const CHARGE: Dimension = dim(0, 0, 1, 1, 0, 0, 0);
    /// Energy
    pub const ENERGY: Dimension = dim(1, 2, -2, 0, 0, 0, 0);
    /// Concentration
    pub const CONCENTRATION: Dimension = dim(0, -3, 0, 0, 1, 0, 0);
    /// Current per membrane area
    pub const CURRENT_DENSITY: Dimension = dim(0, -2, 0, 1, 0, 0, 0);
    /// Capacitance per membrane area
    pub const SPECIFIC_CAPACITANCE: Dimension = dim(-1, -4, 4, 2, 0, 0, 0);
    /// Conductance per membrane area
    pub const CONDUCTANCE_DENSITY: Dimension = dim(-1, -4, 3, 2, 0, 0, 0);
    /// Resistance times length (axial resistivity)
    pub const RESISTIVITY: Dimension = dim(1, 3, -3, -2, 0, 0, 0);
    /// Molar gas constant dimension
    pub const MOLAR_ENERGY_PER_TEMPERATURE: Dimension = dim(1, 2, -2, 0, -1, -1, 0);
    /// Charge per amount (Faraday constant)
    pub const CHARGE_PER_AMOUNT: Dimension = dim(0, 0, 1, 1, -1, 0, 0);
    /// Inverse concentration-time (second-order rate)
    pub const PER_CONCENTRATION_PER_TIME: Dimension = dim(0, 3, -1, 0, -1, 0, 0);

    /// Exponents as an array ordered `m, l, t, i, n, k, j`
    pub fn exponents(&self) -> [i8; 7] {
        [self.m, self.l, self.t, self.i, self.n, self.k, self.j]
    }

    /// Build from an exponent array
    pub fn from_exponents(e: [i8; 7]) -> Self {
        dim(e[0], e[1], e[2], e[3], e[4], e[5], e[6])
    }

    /// True if all exponents are zero
    pub fn is_dimensionless(&self) -> bool {
        *self == Self::DIMENSIONLESS
    }

    /// Raise to an integer power
    pub fn powi(&self, p: i8) -> Self {
        let mut e = self.exponents();
        e.iter_mut().for_each(|x| *x *= p);
        Self::from_exponents(e)
    }

    /// Reciprocal
    pub fn recip(&self) -> Self {
        self.powi(-1)
    }

    /// Well-known name, if any
    pub fn name(&self) -> Option<&'static str> {
        NAMED_DIMENSIONS
            .iter()
            .find(|(_, d)| d == self)
            .map(|(n, _)| *n)
    }

    /// Look a dimension up by its well-known name
    pub fn from_name(name: &str) -> Result<Self> {
        NAMED_DIMENSIONS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, d)| *d)
            .ok_or_else(|| DynamicsError::unknown_unit(name, "no dimension of that name"))
    }
}

/// Dimension names as used in dynamics documents
pub const NAMED_DIMENSIONS: &[(&str, Dimension)] = &[
    ("dimensionless", Dimension::DIMENSIONLESS),
    ("mass", Dimension::MASS),
    ("length", Dimension::LENGTH),
    ("area", Dimension::AREA),
    ("volume", Dimension::VOLUME),
    ("time", Dimension::TIME),
    ("per_time", Dimension::PER_TIME),
    ("current", Dimension::CURRENT),
    ("amount", Dimension::AMOUNT),
    ("temperature", Dimension::TEMPERATURE),
    ("luminous_intensity", Dimension::LUMINOUS_INTENSITY),
    ("voltage", Dimension::VOLTAGE),
    ("per_voltage", Dimension::PER_VOLTAGE),
    ("capacitance", Dimension::CAPACITANCE),
    ("conductance", Dimension::CONDUCTANCE),
    ("resistance", Dimension::RESISTANCE),
    ("charge", Dimension::CHARGE),
    ("energy", Dimension::ENERGY),
    ("concentration", Dimension::CONCENTRATION),
    ("current_density", Dimension::CURRENT_DENSITY),
    ("specific_capacitance", Dimension::SPECIFIC_CAPACITANCE),
    ("conductance_density", Dimension::CONDUCTANCE_DENSITY),
    ("resistivity", Dimension::RESISTIVITY),
    ("molar_energy_per_temperature", Dimension::MOLAR_ENERGY_PER_TEMPERATURE),
    ("charge_per_amount", Dimension::CHARGE_PER_AMOUNT),
    ("per_concentration_per_time", Dimension::PER_CONCENTRATION_PER_TIME),
];

impl Mul for Dimension {
    type Output = Dimension;

    fn mul(self, rhs: Dimension) -> Dimension {
        let (a, b) = (self.exponents(), rhs.exponents());
        let mut out = [0i8; 7];
        for k in 0..7 {
            out[k] = a[k] + b[k];
        }
        Dimension::from_exponents(out)
    }
}

impl Div for Dimension {
    type Output = Dimension;

    fn div(self, rhs: Dimension) -> Dimension {
        self * rhs.recip()
    }
}

impl Display for Dimension {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.name() {
            return write!(f, "{}", name);
        }
        let parts: Vec<String> = self
            .exponents()
            .iter()
            .zip(SI_BASE_SYMBOLS)
            .filter(|(e, _)| **e != 0)
            .map(|(e, s)| if *e == 1 { s.to_string() } else { format!("{}^{}", s, e) })
            .collect();
        write!(f, "[{}]", parts.join("*"))
    }
}

/// A unit: dimension, decimal power relative to SI and offset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    /// Symbol as written
    pub name: String,
    /// Physical dimension
    pub dimension: Dimension,
    /// Value in SI = value * 10^power + offset
    pub power: i32,
    /// Additive offset (temperatures)
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub offset: f64,
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

impl Unit {
    /// Unit with no offset
    pub fn new(name: impl Into<String>, dimension: Dimension, power: i32) -> Self {
        Self {
            name: name.into(),
            dimension,
            power,
            offset: 0.0,
        }
    }

    /// The unit "1"
    pub fn dimensionless() -> Self {
        Self::new("unitless", Dimension::DIMENSIONLESS, 0)
    }

    /// Parse a unit expression such as `mV`, `mA/cm2`, `ohm cm`, `uS/um^2`
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == "1" {
            return Ok(Self::dimensionless());
        }
        let mut p = UnitParser {
            chars: trimmed.chars().collect(),
            pos: 0,
            source: trimmed,
        };
        let (dimension, power, offset) = p.product()?;
        if p.pos < p.chars.len() {
            return Err(DynamicsError::unknown_unit(trimmed, "trailing characters"));
        }
        Ok(Self {
            name: trimmed.to_string(),
            dimension,
            power,
            offset,
        })
    }

    /// Multiplier from this unit to SI (ignoring offset)
    pub fn si_factor(&self) -> f64 {
        10f64.powi(self.power)
    }
}

impl Display for Unit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A value with a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    /// Magnitude in `unit`
    pub value: f64,
    /// Unit of `value`
    pub unit: Unit,
}

impl Quantity {
    /// Construct a quantity
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    /// Dimensionless quantity
    pub fn dimensionless(value: f64) -> Self {
        Self::new(value, Unit::dimensionless())
    }

    /// Parse `"<value> <unit>"` (unit optional)
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let split = text.find(char::is_whitespace).unwrap_or(text.len());
        let value = text[..split]
            .parse::<f64>()
            .map_err(|_| DynamicsError::unknown_unit(text, "quantity must start with a number"))?;
        Ok(Self::new(value, Unit::parse(&text[split..])?))
    }

    /// Dimension of the quantity
    pub fn dimension(&self) -> Dimension {
        self.unit.dimension
    }

    /// Value in coherent SI units
    pub fn to_si(&self) -> f64 {
        self.value * self.unit.si_factor() + self.unit.offset
    }

    /// Value expressed in `unit`; fails if dimensions differ
    pub fn value_in(&self, unit: &Unit) -> Result<f64> {
        if unit.dimension != self.unit.dimension {
            return Err(DynamicsError::unknown_unit(
                &unit.name,
                format!("cannot express '{}' ({}) in it", self, self.unit.dimension),
            ));
        }
        Ok((self.to_si() - unit.offset) / unit.si_factor())
    }
}

impl Display for Quantity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.unit.dimension.is_dimensionless() && self.unit.power == 0 {
            write!(f, "{}", self.value)
        } else {
            write!(f, "{} {}", self.value, self.unit)
        }
    }
}

const PREFIXES: &[(&str, i32)] = &[
    ("da", 1),
    ("Y", 24),
    ("Z", 21),
    ("E", 18),
    ("P", 15),
    ("T", 12),
    ("G", 9),
    ("M", 6),
    ("k", 3),
    ("h", 2),
    ("d", -1),
    ("c", -2),
    ("m", -3),
    ("u", -6),
    ("µ", -6),
    ("n", -9),
    ("p", -12),
    ("f", -15),
    ("a", -18),
];

/// (symbol, dimension, power, offset)
const BASE_UNITS: &[(&str, Dimension, i32, f64)] = &[
    ("g", Dimension::MASS, -3, 0.0),
    ("m", Dimension::LENGTH, 0, 0.0),
    ("micron", Dimension::LENGTH, -6, 0.0),
    ("s", Dimension::TIME, 0, 0.0),
    ("sec", Dimension::TIME, 0, 0.0),
    ("A", Dimension::CURRENT, 0, 0.0),
    ("amp", Dimension::CURRENT, 0, 0.0),
    ("mol", Dimension::AMOUNT, 0, 0.0),
    ("mole", Dimension::AMOUNT, 0, 0.0),
    ("K", Dimension::TEMPERATURE, 0, 0.0),
    ("degK", Dimension::TEMPERATURE, 0, 0.0),
    ("kelvin", Dimension::TEMPERATURE, 0, 0.0),
    ("degC", Dimension::TEMPERATURE, 0, 273.15),
    ("cd", Dimension::LUMINOUS_INTENSITY, 0, 0.0),
    ("V", Dimension::VOLTAGE, 0, 0.0),
    ("volt", Dimension::VOLTAGE, 0, 0.0),
    ("F", Dimension::CAPACITANCE, 0, 0.0),
    ("farad", Dimension::CAPACITANCE, 0, 0.0),
    ("S", Dimension::CONDUCTANCE, 0, 0.0),
    ("siemens", Dimension::CONDUCTANCE, 0, 0.0),
    ("mho", Dimension::CONDUCTANCE, 0, 0.0),
    ("ohm", Dimension::RESISTANCE, 0, 0.0),
    ("Ohm", Dimension::RESISTANCE, 0, 0.0),
    ("M", Dimension::CONCENTRATION, 3, 0.0),
    ("molar", Dimension::CONCENTRATION, 3, 0.0),
    ("L", Dimension::VOLUME, -3, 0.0),
    ("l", Dimension::VOLUME, -3, 0.0),
    ("liter", Dimension::VOLUME, -3, 0.0),
    ("Hz", Dimension::PER_TIME, 0, 0.0),
    ("C", Dimension::CHARGE, 0, 0.0),
    ("coulomb", Dimension::CHARGE, 0, 0.0),
    ("J", Dimension::ENERGY, 0, 0.0),
    ("joule", Dimension::ENERGY, 0, 0.0),
];

struct UnitParser<'a> {
    chars: Vec<char>,
    pos: usize,
    source: &'a str,
}

type Partial = (Dimension, i32, f64);

impl UnitParser<'_> {
    fn err(&self, reason: impl Into<String>) -> DynamicsError {
        DynamicsError::unknown_unit(self.source, reason)
    }

    fn skip_spaces(&mut self) -> bool {
        let start = self.pos;
        while self.pos < self.chars.len() && self.chars[self.pos] == ' ' {
            self.pos += 1;
        }
        self.pos > start
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    /// factor (('*' | '/' | ' ') factor)*
    fn product(&mut self) -> Result<Partial> {
        let (mut d, mut p, mut offset) = self.factor()?;
        let mut factors = 1;
        loop {
            let spaced = self.skip_spaces();
            let divide = match self.peek() {
                Some('*') => false,
                Some('/') => true,
                Some(')') | None => break,
                Some(_) if spaced => {
                    // implicit multiplication: "ohm cm"
                    let (fd, fp, _) = self.factor()?;
                    d = d * fd;
                    p += fp;
                    factors += 1;
                    continue;
                }
                Some(c) => return Err(self.err(format!("unexpected '{}'", c))),
            };
            self.pos += 1;
            if !divide && self.peek() == Some('*') {
                // "**" power spelled after a whole product is not supported
                return Err(self.err("dangling '**'"));
            }
            self.skip_spaces();
            let (fd, fp, _) = self.factor()?;
            if divide {
                d = d / fd;
                p -= fp;
            } else {
                d = d * fd;
                p += fp;
            }
            factors += 1;
        }
        if factors > 1 {
            offset = 0.0;
        }
        Ok((d, p, offset))
    }

    /// atom exponent?
    fn factor(&mut self) -> Result<Partial> {
        let (d, p, offset) = self.atom()?;
        let exp = self.exponent()?;
        match exp {
            Some(e) => Ok((d.powi(e), p * e as i32, 0.0)),
            None => Ok((d, p, offset)),
        }
    }

    fn exponent(&mut self) -> Result<Option<i8>> {
        let save = self.pos;
        if self.peek() == Some('^') {
            self.pos += 1;
        } else if self.peek() == Some('*') && self.chars.get(self.pos + 1) == Some(&'*') {
            self.pos += 2;
        }
        let explicit = self.pos != save;
        let start = self.pos;
        if self.peek() == Some('-') || self.peek() == Some('+') {
            self.pos += 1;
        }
        while self.peek().map_or(false, |c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        if text.is_empty() || text == "-" || text == "+" {
            if explicit {
                return Err(self.err("missing exponent"));
            }
            self.pos = save;
            return Ok(None);
        }
        text.parse::<i8>()
            .map(Some)
            .map_err(|_| self.err(format!("bad exponent '{}'", text)))
    }

    fn atom(&mut self) -> Result<Partial> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                self.skip_spaces();
                let inner = self.product()?;
                self.skip_spaces();
                if self.peek() != Some(')') {
                    return Err(self.err("unbalanced parenthesis"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some('1') => {
                self.pos += 1;
                Ok((Dimension::DIMENSIONLESS, 0, 0.0))
            }
            _ => {
                let start = self.pos;
                while self
                    .peek()
                    .map_or(false, |c| c.is_alphabetic() || c == 'µ' || c == '_')
                {
                    self.pos += 1;
                }
                let word: String = self.chars[start..self.pos].iter().collect();
                if word.is_empty() {
                    return Err(self.err("expected a unit symbol"));
                }
                lookup_symbol(&word).ok_or_else(|| self.err(format!("unknown unit symbol '{}'", word)))
            }
        }
    }
}

/// Resolve a single (possibly prefixed) unit symbol
pub fn lookup_symbol(word: &str) -> Option<(Dimension, i32, f64)> {
    if let Some((_, d, p, o)) = BASE_UNITS.iter().find(|(s, ..)| *s == word) {
        return Some((*d, *p, *o));
    }
    for (prefix, pp) in PREFIXES {
        if let Some(rest) = word.strip_prefix(prefix) {
            if let Some((_, d, p, o)) = BASE_UNITS.iter().find(|(s, ..)| *s == rest) {
                if *o != 0.0 {
                    return None;
                }
                return Some((*d, p + pp, 0.0));
            }
        }
    }
    None
}
