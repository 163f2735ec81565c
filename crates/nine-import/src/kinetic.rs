//! Kinetic schemes: reaction parsing and mass-action expansion.

use indexmap::IndexMap;
use nine_dynamics::Expr;

use crate::stmt::{matching_paren, split_args};
use crate::{ImportError, Result};

/// A species with its stoichiometric coefficient
pub type Term = (String, u32);

/// Reaction as written, rates still unparsed
#[derive(Debug, Clone, PartialEq)]
pub enum ReactionText {
    /// `~ A + B <-> C (kf, kb)`
    Reversible {
        /// Left-hand species
        lhs: Vec<Term>,
        /// Right-hand species
        rhs: Vec<Term>,
        /// Forward rate text
        forward: String,
        /// Backward rate text
        backward: String,
    },
    /// `~ A << (flux)`
    Influx {
        /// Species
        species: String,
        /// Flux text
        rate: String,
    },
    /// `~ A -> (rate)`
    Outflux {
        /// Species
        species: String,
        /// Rate text
        rate: String,
    },
}

/// Reaction with lifted rate expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Reaction {
    /// Reversible mass-action reaction
    Reversible {
        /// Left-hand species
        lhs: Vec<Term>,
        /// Right-hand species
        rhs: Vec<Term>,
        /// Forward rate
        forward: Expr,
        /// Backward rate
        backward: Expr,
    },
    /// Constant flux into a species
    Influx {
        /// Species
        species: String,
        /// Flux
        rate: Expr,
    },
    /// First-order decay of a species
    Outflux {
        /// Species
        species: String,
        /// Rate
        rate: Expr,
    },
}

fn species_name(text: &str) -> String {
    match text.find('[') {
        Some(open) => {
            let index = text[open + 1..].trim_end_matches(']').trim();
            format!("{}__elem{}", text[..open].trim(), index)
        }
        None => text.trim().to_string(),
    }
}

fn parse_terms(text: &str, reaction: &str) -> Result<Vec<Term>> {
    text.split('+')
        .map(|part| {
            let part = part.trim();
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            let coefficient = if digits.is_empty() {
                1
            } else {
                digits
                    .parse::<u32>()
                    .map_err(|e| ImportError::syntax(reaction, e.to_string()))?
            };
            let name = species_name(&part[digits.len()..]);
            if name.is_empty() {
                return Err(ImportError::syntax(reaction, "empty species"));
            }
            Ok((name, coefficient))
        })
        .collect()
}

/// Strip one pair of enclosing parentheses
fn unparen(text: &str) -> &str {
    let t = text.trim();
    if t.starts_with('(') && matching_paren(t, 0) == Some(t.len() - 1) {
        &t[1..t.len() - 1]
    } else {
        t
    }
}

impl ReactionText {
    /// Parse the text after `~`
    pub fn parse(text: &str) -> Result<Self> {
        if let Some((left, right)) = text.split_once("<->") {
            // the rate pair is the trailing parenthesised group
            let right = right.trim_end();
            let open = (0..right.len())
                .rev()
                .filter(|i| right.as_bytes()[*i] == b'(')
                .find(|i| matching_paren(right, *i) == Some(right.len() - 1))
                .ok_or_else(|| ImportError::syntax(text, "missing rate constants"))?;
            let rates = split_args(&right[open + 1..right.len() - 1]);
            let [forward, backward]: [String; 2] = rates
                .try_into()
                .map_err(|_| ImportError::syntax(text, "expected two rate constants"))?;
            return Ok(Self::Reversible {
                lhs: parse_terms(left, text)?,
                rhs: parse_terms(&right[..open], text)?,
                forward,
                backward,
            });
        }
        if let Some((species, rate)) = text.split_once("<<") {
            return Ok(Self::Influx {
                species: species_name(species),
                rate: unparen(rate).to_string(),
            });
        }
        if let Some((species, rate)) = text.split_once("->") {
            return Ok(Self::Outflux {
                species: species_name(species),
                rate: unparen(rate).to_string(),
            });
        }
        Err(ImportError::syntax(text, "unrecognised reaction"))
    }
}

fn mass_action(rate: &Expr, terms: &[Term]) -> Expr {
    let mut factors = vec![rate.clone()];
    for (species, power) in terms {
        factors.push(match power {
            1 => Expr::sym(species),
            p => Expr::pow(Expr::sym(species), Expr::num(f64::from(*p))),
        });
    }
    Expr::product(factors)
}

fn scaled(coefficient: u32, flux: &Expr) -> Expr {
    if coefficient == 1 {
        flux.clone()
    } else {
        Expr::mul(Expr::num(f64::from(coefficient)), flux.clone())
    }
}

impl Reaction {
    /// Forward and backward flux of a reversible reaction
    pub fn fluxes(&self) -> Option<(Expr, Expr)> {
        match self {
            Reaction::Reversible {
                lhs,
                rhs,
                forward,
                backward,
            } => Some((mass_action(forward, lhs), mass_action(backward, rhs))),
            _ => None,
        }
    }
}

/// Time derivatives implied by a set of reactions, species in first-seen order
pub fn derivatives(reactions: &[Reaction]) -> IndexMap<String, Expr> {
    let mut terms: IndexMap<String, Vec<Expr>> = IndexMap::new();
    for reaction in reactions {
        match reaction {
            Reaction::Reversible { lhs, rhs, .. } => {
                let (f_flux, b_flux) = match reaction.fluxes() {
                    Some(fluxes) => fluxes,
                    None => continue,
                };
                let net = Expr::sub(f_flux, b_flux);
                for (species, coefficient) in lhs {
                    terms
                        .entry(species.clone())
                        .or_default()
                        .push(Expr::neg(scaled(*coefficient, &net)));
                }
                for (species, coefficient) in rhs {
                    terms
                        .entry(species.clone())
                        .or_default()
                        .push(scaled(*coefficient, &net));
                }
            }
            Reaction::Influx { species, rate } => {
                terms.entry(species.clone()).or_default().push(rate.clone());
            }
            Reaction::Outflux { species, rate } => {
                terms
                    .entry(species.clone())
                    .or_default()
                    .push(Expr::neg(Expr::mul(rate.clone(), Expr::sym(species))));
            }
        }
    }
    terms
        .into_iter()
        .map(|(species, terms)| (species, Expr::sum(terms).simplify()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(s: &str) -> Expr {
        Expr::parse(s).unwrap()
    }

    fn eval(expr: &Expr, values: &[(&str, f64)]) -> f64 {
        expr.eval(&|name| values.iter().find(|(n, _)| *n == name).map(|(_, v)| *v))
            .unwrap()
    }

    #[test]
    fn parses_reactions() {
        match ReactionText::parse("C1 + 2 Ca <-> O (kon*(1+x), koff)").unwrap() {
            ReactionText::Reversible {
                lhs,
                rhs,
                forward,
                backward,
            } => {
                assert_eq!(lhs, vec![("C1".to_string(), 1), ("Ca".to_string(), 2)]);
                assert_eq!(rhs, vec![("O".to_string(), 1)]);
                assert_eq!(forward, "kon*(1+x)");
                assert_eq!(backward, "koff");
            }
            other => panic!("unexpected reaction {:?}", other),
        }
        assert_eq!(
            ReactionText::parse("cai << (-ica*k)").unwrap(),
            ReactionText::Influx {
                species: "cai".into(),
                rate: "-ica*k".into()
            }
        );
        assert!(ReactionText::parse("A <-> B").is_err());
    }

    #[test]
    fn mass_action_derivatives() {
        let reactions = vec![Reaction::Reversible {
            lhs: vec![("A".into(), 1)],
            rhs: vec![("B".into(), 1)],
            forward: e("f"),
            backward: e("b"),
        }];
        let derivs = derivatives(&reactions);
        let values = [("A", 0.3), ("B", 0.7), ("f", 2.0), ("b", 5.0)];
        let expected = -2.0 * 0.3 + 5.0 * 0.7;
        assert!((eval(&derivs["A"], &values) - expected).abs() < 1e-12);
        assert!((eval(&derivs["B"], &values) + expected).abs() < 1e-12);
    }

    #[test]
    fn stoichiometry_and_fluxes() {
        let reactions = vec![
            Reaction::Reversible {
                lhs: vec![("Ca".into(), 2)],
                rhs: vec![("X".into(), 1)],
                forward: e("kf"),
                backward: e("kb"),
            },
            Reaction::Outflux {
                species: "X".into(),
                rate: e("d"),
            },
        ];
        let derivs = derivatives(&reactions);
        let values = [("Ca", 2.0), ("X", 1.0), ("kf", 1.0), ("kb", 3.0), ("d", 0.5)];
        // net flux kf*Ca^2 - kb*X = 1
        assert!((eval(&derivs["Ca"], &values) + 2.0).abs() < 1e-12);
        assert!((eval(&derivs["X"], &values) - 0.5).abs() < 1e-12);
    }
}
