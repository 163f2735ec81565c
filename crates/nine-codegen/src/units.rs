//! Back-end unit tables: projecting dimensions onto canonical simulator units
//! and scaling values across the abstract/native boundary.

use std::collections::HashMap;
use std::sync::OnceLock;

use log::trace;
use nine_dynamics::{Dimension, Quantity, Unit};
use parking_lot::Mutex;

use crate::backend::BackendKind;
use crate::error::{PipelineError, Result};

/// Exponent range tried for each basis unit of a combination
const MAX_EXPONENT: i8 = 3;
/// Largest number of distinct basis units in a combination
const MAX_FACTORS: usize = 4;

/// How a back-end writes compound unit strings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStyle {
    /// NMODL: space separated, exponent glued on (`um2`), one `/`
    Nmodl,
    /// C++ comments and NEST docs: `*` and `^`
    Caret,
}

/// A dimension expressed as a product of table units raised to powers
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    /// `(unit, exponent)` factors in table order
    pub factors: Vec<(Unit, i8)>,
}

impl Projection {
    /// Decimal power relative to SI of the composite unit
    pub fn power(&self) -> i32 {
        self.factors
            .iter()
            .map(|(u, e)| u.power * i32::from(*e))
            .sum()
    }
}

/// Canonical unit table of one back-end
#[derive(Debug)]
pub struct UnitHandler {
    backend: BackendKind,
    basis: Vec<Unit>,
    compounds: Vec<Unit>,
    style: UnitStyle,
    cache: Mutex<HashMap<Dimension, Projection>>,
}

fn unit(name: &str, dimension: Dimension, power: i32) -> Unit {
    Unit::new(name, dimension, power)
}

fn si_factor_count(d: &Dimension) -> u32 {
    d.exponents().iter().map(|e| e.unsigned_abs() as u32).sum()
}

impl UnitHandler {
    /// NEURON: ms, mV, nA, mM, nF, um, uS, K, cd plus density compounds
    pub fn neuron() -> &'static UnitHandler {
        static HANDLER: OnceLock<UnitHandler> = OnceLock::new();
        HANDLER.get_or_init(|| UnitHandler {
            backend: BackendKind::Neuron,
            basis: vec![
                unit("ms", Dimension::TIME, -3),
                unit("mV", Dimension::VOLTAGE, -3),
                unit("nA", Dimension::CURRENT, -9),
                unit("mM", Dimension::CONCENTRATION, 0),
                unit("nF", Dimension::CAPACITANCE, -9),
                unit("um", Dimension::LENGTH, -6),
                unit("uS", Dimension::CONDUCTANCE, -6),
                unit("K", Dimension::TEMPERATURE, 0),
                unit("cd", Dimension::LUMINOUS_INTENSITY, 0),
            ],
            compounds: vec![
                unit("mA/cm2", Dimension::CURRENT_DENSITY, 1),
                unit("uF/cm2", Dimension::SPECIFIC_CAPACITANCE, -2),
                unit("S/cm2", Dimension::CONDUCTANCE_DENSITY, 4),
                unit("ohm cm", Dimension::RESISTIVITY, -2),
            ],
            style: UnitStyle::Nmodl,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// NEST: ms, mV, pA, mM, pF, um, nS, K, cd
    pub fn nest() -> &'static UnitHandler {
        static HANDLER: OnceLock<UnitHandler> = OnceLock::new();
        HANDLER.get_or_init(|| UnitHandler {
            backend: BackendKind::Nest,
            basis: vec![
                unit("ms", Dimension::TIME, -3),
                unit("mV", Dimension::VOLTAGE, -3),
                unit("pA", Dimension::CURRENT, -12),
                unit("mM", Dimension::CONCENTRATION, 0),
                unit("pF", Dimension::CAPACITANCE, -12),
                unit("um", Dimension::LENGTH, -6),
                unit("nS", Dimension::CONDUCTANCE, -9),
                unit("K", Dimension::TEMPERATURE, 0),
                unit("cd", Dimension::LUMINOUS_INTENSITY, 0),
            ],
            compounds: Vec::new(),
            style: UnitStyle::Caret,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Handler of a back-end
    pub fn for_backend(kind: BackendKind) -> &'static UnitHandler {
        match kind {
            BackendKind::Neuron => Self::neuron(),
            BackendKind::Nest => Self::nest(),
        }
    }

    /// Back-end of this table
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Basis units in table order
    pub fn basis(&self) -> &[Unit] {
        &self.basis
    }

    /// Compound units
    pub fn compounds(&self) -> &[Unit] {
        &self.compounds
    }

    /// Project a dimension onto the table (cached)
    pub fn project(&self, dimension: Dimension) -> Result<Projection> {
        if let Some(hit) = self.cache.lock().get(&dimension) {
            return Ok(hit.clone());
        }
        let projection = self.search(dimension)?;
        trace!(
            "{} projects {} onto {:?}",
            self.backend,
            dimension,
            projection.factors.iter().map(|(u, e)| (u.name.as_str(), *e)).collect::<Vec<_>>()
        );
        self.cache.lock().insert(dimension, projection.clone());
        Ok(projection)
    }

    fn search(&self, dimension: Dimension) -> Result<Projection> {
        if dimension.is_dimensionless() {
            return Ok(Projection { factors: Vec::new() });
        }
        if let Some(c) = self.compounds.iter().find(|c| c.dimension == dimension) {
            return Ok(Projection {
                factors: vec![(c.clone(), 1)],
            });
        }
        // single unit raised to an integer power
        for exp in [1, -1, 2, -2, 3, -3] {
            if let Some(b) = self.basis.iter().find(|b| b.dimension.powi(exp) == dimension) {
                return Ok(Projection {
                    factors: vec![(b.clone(), exp)],
                });
            }
        }
        for size in 2..=MAX_FACTORS {
            let mut best: Option<(u32, Vec<(usize, i8)>)> = None;
            let mut indices: Vec<usize> = (0..size).collect();
            loop {
                self.try_exponents(&indices, dimension, &mut best);
                if !next_combination(&mut indices, self.basis.len()) {
                    break;
                }
            }
            if let Some((_, chosen)) = best {
                return Ok(Projection {
                    factors: chosen
                        .into_iter()
                        .map(|(i, e)| (self.basis[i].clone(), e))
                        .collect(),
                });
            }
        }
        Err(PipelineError::unit_conversion(
            dimension.to_string(),
            self.backend.to_string(),
            format!(
                "no product of at most {} basis units with exponents within ±{} matches",
                MAX_FACTORS, MAX_EXPONENT
            ),
        ))
    }

    fn try_exponents(
        &self,
        indices: &[usize],
        target: Dimension,
        best: &mut Option<(u32, Vec<(usize, i8)>)>,
    ) {
        let choices: Vec<i8> = (-MAX_EXPONENT..=MAX_EXPONENT).filter(|e| *e != 0).collect();
        let mut slots = vec![0usize; indices.len()];
        loop {
            let mut product = Dimension::DIMENSIONLESS;
            for (idx, slot) in indices.iter().zip(&slots) {
                product = product * self.basis[*idx].dimension.powi(choices[*slot]);
            }
            if product == target {
                let cost: u32 = indices.iter().map(|i| si_factor_count(&self.basis[*i].dimension)).sum();
                // combinations arrive in lexicographic index order, so only a
                // strictly cheaper one replaces the current best
                if best.as_ref().map_or(true, |(c, _)| cost < *c) {
                    let picked = indices.iter().zip(&slots).map(|(i, s)| (*i, choices[*s])).collect();
                    *best = Some((cost, picked));
                }
            }
            // odometer over exponent choices
            let mut pos = 0;
            loop {
                if pos == slots.len() {
                    return;
                }
                slots[pos] += 1;
                if slots[pos] < choices.len() {
                    break;
                }
                slots[pos] = 0;
                pos += 1;
            }
        }
    }

    /// Canonical unit of a dimension
    pub fn canonical_unit(&self, dimension: Dimension) -> Result<Unit> {
        let projection = self.project(dimension)?;
        Ok(Unit::new(self.format(&projection), dimension, projection.power()))
    }

    /// Textual form of the canonical unit of a dimension
    pub fn unit_str(&self, dimension: Dimension) -> Result<String> {
        Ok(self.format(&self.project(dimension)?))
    }

    /// Value of `quantity` in the canonical unit of its dimension
    pub fn scale_value(&self, quantity: &Quantity) -> Result<f64> {
        let target = self.canonical_unit(quantity.dimension())?;
        Ok(quantity.value_in(&target)?)
    }

    /// Attach the canonical unit of `dimension` to a native value
    pub fn assign_units(&self, value: f64, dimension: Dimension) -> Result<Quantity> {
        Ok(Quantity::new(value, self.canonical_unit(dimension)?))
    }

    /// Dimension of a unit expression, failing on anything unparsable
    pub fn dimension_of(&self, unit_text: &str) -> Result<Dimension> {
        Unit::parse(unit_text)
            .map(|u| u.dimension)
            .map_err(|e| PipelineError::UnknownDimension {
                unit: unit_text.to_string(),
                reason: e.to_string(),
            })
    }

    fn format(&self, projection: &Projection) -> String {
        if projection.factors.is_empty() {
            return "1".to_string();
        }
        let part = |u: &Unit, e: i8| -> String {
            match (self.style, e) {
                (_, 1) => u.name.clone(),
                (UnitStyle::Nmodl, e) => format!("{}{}", u.name, e),
                (UnitStyle::Caret, e) => format!("{}^{}", u.name, e),
            }
        };
        let num: Vec<String> = projection
            .factors
            .iter()
            .filter(|(_, e)| *e > 0)
            .map(|(u, e)| part(u, *e))
            .collect();
        let den: Vec<String> = projection
            .factors
            .iter()
            .filter(|(_, e)| *e < 0)
            .map(|(u, e)| part(u, -*e))
            .collect();
        let (sep, numerator) = match self.style {
            UnitStyle::Nmodl => (" ", num.join(" ")),
            UnitStyle::Caret => ("*", num.join("*")),
        };
        let numerator = if numerator.is_empty() { "1".to_string() } else { numerator };
        match (den.len(), self.style) {
            (0, _) => numerator,
            // NMODL divides by everything after the slash
            (_, UnitStyle::Nmodl) => format!("{}/{}", numerator, den.join(sep)),
            (1, UnitStyle::Caret) => format!("{}/{}", numerator, den[0]),
            (_, UnitStyle::Caret) => format!("{}/({})", numerator, den.join(sep)),
        }
    }
}

/// Advance `indices` to the next k-combination of `0..n` in lexicographic order
fn next_combination(indices: &mut [usize], n: usize) -> bool {
    let k = indices.len();
    let mut i = k;
    while i > 0 {
        i -= 1;
        if indices[i] < n - k + i {
            indices[i] += 1;
            for j in i + 1..k {
                indices[j] = indices[j - 1] + 1;
            }
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handlers_print_their_backend() {
        let text = format!("{:?}", UnitHandler::for_backend(BackendKind::Nest));
        assert!(text.contains("Nest"), "{}", text);
    }

    #[test]
    fn basis_and_compound_strings() {
        let neuron = UnitHandler::neuron();
        assert_eq!(neuron.unit_str(Dimension::VOLTAGE).unwrap(), "mV");
        assert_eq!(neuron.unit_str(Dimension::CURRENT_DENSITY).unwrap(), "mA/cm2");
        assert_eq!(neuron.unit_str(Dimension::PER_TIME).unwrap(), "1/ms");
        assert_eq!(neuron.unit_str(Dimension::AREA).unwrap(), "um2");
        assert_eq!(neuron.unit_str(Dimension::DIMENSIONLESS).unwrap(), "1");

        let nest = UnitHandler::nest();
        assert_eq!(nest.unit_str(Dimension::CURRENT).unwrap(), "pA");
        assert_eq!(nest.unit_str(Dimension::CURRENT_DENSITY).unwrap(), "pA/um^2");
        assert_eq!(nest.unit_str(Dimension::AREA).unwrap(), "um^2");
    }

    #[test]
    fn voltage_per_time_combines_two_units() {
        let nest = UnitHandler::nest();
        assert_eq!(nest.unit_str(Dimension::VOLTAGE / Dimension::TIME).unwrap(), "mV/ms");
        let neuron = UnitHandler::neuron();
        assert_eq!(neuron.unit_str(Dimension::VOLTAGE / Dimension::TIME).unwrap(), "mV/ms");
    }

    #[test]
    fn scaling_uses_canonical_units() {
        let neuron = UnitHandler::neuron();
        let g = Quantity::parse("1e8 uS").unwrap();
        assert!((neuron.scale_value(&g).unwrap() - 1e8).abs() < 1e-3);
        let nest = UnitHandler::nest();
        assert!((nest.scale_value(&g).unwrap() - 1e11).abs() < 1.0);

        let c = Quantity::parse("1 nF").unwrap();
        assert!((nest.scale_value(&c).unwrap() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn unrepresentable_dimension_is_an_error() {
        let nest = UnitHandler::nest();
        let err = nest
            .scale_value(&Quantity::new(1.0, Unit::new("m5", Dimension::from_exponents([0, 5, 0, 0, 0, 0, 0]), 0)))
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnitConversion { .. }), "{}", err);
    }

    #[test]
    fn combinations_enumerate_in_order() {
        let mut idx = vec![0, 1];
        let mut seen = vec![idx.clone()];
        while next_combination(&mut idx, 4) {
            seen.push(idx.clone());
        }
        assert_eq!(seen.len(), 6);
        assert_eq!(seen.last().unwrap(), &vec![2, 3]);
    }
}
