//! Point-neuron (NEST) rewrite: the regime becomes an explicit state so the
//! generated model can switch between regimes inside its update loop.

use log::debug;
use nine_dynamics::{keys, Dimension, Dynamics, Quantity, BUILD_NS};

use super::{annotate_src, Pass, ReceptorIndices, TimeDerivativeCounts};
use crate::error::{PipelineError, Result};
use crate::options::BuildOptions;

/// State holding the index of the active regime
pub const REGIME_STATE: &str = "__regime__";

/// Passes of the event variant
pub fn passes(options: &BuildOptions) -> Vec<Box<dyn Pass>> {
    vec![
        Box::new(DefaultRegime {
            requested: options.default_regime.clone(),
        }),
        Box::new(RegimeState),
        Box::new(ReceptorIndices),
        Box::new(TimeDerivativeCounts),
    ]
}

/// Record the regime a fresh cell starts in
pub struct DefaultRegime {
    requested: Option<String>,
}

impl Pass for DefaultRegime {
    fn name(&self) -> &'static str {
        "default_regime"
    }

    fn run(&self, d: &mut Dynamics) -> Result<()> {
        let chosen = match &self.requested {
            Some(name) => {
                d.regime(name)
                    .map_err(|_| PipelineError::transform(&d.name, format!("default regime '{}' does not exist", name)))?;
                name.clone()
            }
            None => {
                // most derivatives wins, first on ties
                let mut best: Option<(&str, usize)> = None;
                for regime in d.regimes.values() {
                    let n = regime.time_derivatives.len();
                    if best.map_or(true, |(_, m)| n > m) {
                        best = Some((&regime.name, n));
                    }
                }
                best.map(|(name, _)| name.to_string())
                    .ok_or_else(|| PipelineError::transform(&d.name, "class has no regimes"))?
            }
        };
        debug!("default regime of '{}' is '{}'", d.name, chosen);
        d.annotations_mut().set(BUILD_NS, keys::DEFAULT_REGIME, chosen);
        Ok(())
    }
}

/// Regime index of the default regime
pub fn default_regime_index(d: &Dynamics) -> usize {
    d.annotations()
        .get_str(BUILD_NS, keys::DEFAULT_REGIME)
        .and_then(|name| d.regime_index(name))
        .unwrap_or(0)
}

/// Add the `__regime__` state
pub struct RegimeState;

impl Pass for RegimeState {
    fn name(&self) -> &'static str {
        "regime_state"
    }

    fn run(&self, d: &mut Dynamics) -> Result<()> {
        if d.element_kind(REGIME_STATE).is_some() {
            return Err(PipelineError::transform(
                &d.name,
                format!("'{}' is reserved for the regime index", REGIME_STATE),
            ));
        }
        let index = default_regime_index(d);
        d.add_state(REGIME_STATE, Dimension::DIMENSIONLESS).initial = Some(Quantity::dimensionless(index as f64));
        annotate_src(d, REGIME_STATE, None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::transform::{annotated_list, receptor_index, transform_for_build};
    use nine_dynamics::{Expr, OnCondition, OnEvent, Regime};

    fn e(s: &str) -> Expr {
        Expr::parse(s).unwrap()
    }

    fn izhikevich() -> Dynamics {
        Dynamics::new("IzhikevichFS")
            .with_parameter("a", Dimension::PER_TIME)
            .with_parameter("Vpeak", Dimension::VOLTAGE)
            .with_state("V", Dimension::VOLTAGE)
            .with_state("U", Dimension::DIMENSIONLESS)
            .with_analog_reduce("iSyn", Dimension::CURRENT)
            .with_event_receive("reset")
            .with_event_send("spike")
            .with_regime(
                Regime::new("subVb")
                    .with_derivative("U", e("-a * U"))
                    .with_on_condition(OnCondition::new(e("V > Vpeak")).with_target("subthreshold")),
            )
            .with_regime(
                Regime::new("subthreshold")
                    .with_derivative("V", e("-a * V"))
                    .with_derivative("U", e("-a * U"))
                    .with_on_condition(
                        OnCondition::new(e("V > Vpeak"))
                            .with_output_event("spike")
                            .with_target("subVb"),
                    )
                    .with_on_event(OnEvent::new("reset").with_assignment("U", e("0"))),
            )
    }

    #[test]
    fn richest_regime_is_default() {
        let t = transform_for_build(&izhikevich(), BackendKind::Nest, &BuildOptions::default()).unwrap();
        assert_eq!(
            t.annotations().get_str(BUILD_NS, keys::DEFAULT_REGIME),
            Some("subthreshold")
        );
        let state = &t.state_variables[REGIME_STATE];
        assert_eq!(state.initial, Some(Quantity::dimensionless(1.0)));
        assert_eq!(receptor_index(&t, "iSyn"), Some(1));
        assert_eq!(receptor_index(&t, "reset"), Some(2));
        let lacking = annotated_list(&t, keys::NO_TIME_DERIVS);
        assert!(lacking.contains(&"V".to_string()));
        assert!(lacking.contains(&REGIME_STATE.to_string()));
    }

    #[test]
    fn requested_default_regime() {
        let options = BuildOptions {
            default_regime: Some("subVb".into()),
            ..BuildOptions::default()
        };
        let t = transform_for_build(&izhikevich(), BackendKind::Nest, &options).unwrap();
        assert_eq!(default_regime_index(&t), 0);

        let options = BuildOptions {
            default_regime: Some("bursting".into()),
            ..BuildOptions::default()
        };
        let err = transform_for_build(&izhikevich(), BackendKind::Nest, &options).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bursting"), "unexpected error: {}", msg);
    }

    #[test]
    fn regime_state_name_is_reserved() {
        let d = izhikevich().with_parameter(REGIME_STATE, Dimension::DIMENSIONLESS);
        assert!(transform_for_build(&d, BackendKind::Nest, &BuildOptions::default()).is_err());
    }
}
