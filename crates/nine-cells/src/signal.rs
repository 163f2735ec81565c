//! Signals played into cells and recordings taken from them. Times are in
//! milliseconds from the simulation start.

use nine_dynamics::{Quantity, Unit};
use serde::{Deserialize, Serialize};

use crate::error::{CellError, Result};

/// Tolerance used when matching times to sample points
pub(crate) const TIME_EPSILON: f64 = 1e-9;

/// Regularly sampled analog signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogSignal {
    /// Time of the first sample (ms)
    pub t_start: f64,
    /// Sampling interval (ms)
    pub interval: f64,
    /// Samples
    pub values: Vec<f64>,
    /// Unit of the samples
    pub unit: Unit,
}

impl AnalogSignal {
    /// Create a signal
    pub fn new(t_start: f64, interval: f64, values: Vec<f64>, unit: Unit) -> Self {
        Self {
            t_start,
            interval,
            values,
            unit,
        }
    }

    /// Square pulse of `amplitude` from `onset` lasting `duration`, zero elsewhere,
    /// sampled every `interval` over `[0, t_stop)`
    pub fn pulse(amplitude: &Quantity, onset: f64, duration: f64, interval: f64, t_stop: f64) -> Self {
        let n = (t_stop / interval).round() as usize;
        let values = (0..n)
            .map(|i| {
                let t = i as f64 * interval;
                if t + TIME_EPSILON >= onset && t + TIME_EPSILON < onset + duration {
                    amplitude.value
                } else {
                    0.0
                }
            })
            .collect();
        Self::new(0.0, interval, values, amplitude.unit.clone())
    }

    /// Time just after the last sample
    pub fn t_stop(&self) -> f64 {
        self.t_start + self.interval * self.values.len() as f64
    }

    /// Sample times
    pub fn times(&self) -> Vec<f64> {
        (0..self.values.len())
            .map(|i| self.t_start + i as f64 * self.interval)
            .collect()
    }

    /// Value held at time `t` (zero-order hold); `None` outside the signal
    pub fn value_at(&self, t: f64) -> Option<f64> {
        if t + TIME_EPSILON < self.t_start || t >= self.t_stop() - TIME_EPSILON {
            return None;
        }
        let index = ((t - self.t_start) / self.interval + TIME_EPSILON).floor() as usize;
        self.values.get(index).copied()
    }

    /// Samples expressed in `unit`
    pub fn converted(&self, unit: &Unit) -> Result<AnalogSignal> {
        let values = self
            .values
            .iter()
            .map(|v| Quantity::new(*v, self.unit.clone()).value_in(unit))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self::new(self.t_start, self.interval, values, unit.clone()))
    }

    /// The signal from `t_start` on; `t_start` must fall on a sample
    pub fn trimmed(&self, t_start: f64) -> Result<AnalogSignal> {
        let offset = (t_start - self.t_start) / self.interval;
        if offset < -TIME_EPSILON || (offset - offset.round()).abs() > 1e-6 {
            return Err(CellError::usage(format!(
                "t_start {} ms is not a whole number of {} ms intervals from {} ms",
                t_start, self.interval, self.t_start
            )));
        }
        let skip = (offset.round() as usize).min(self.values.len());
        Ok(Self::new(
            t_start,
            self.interval,
            self.values[skip..].to_vec(),
            self.unit.clone(),
        ))
    }

    /// Largest sample
    pub fn max(&self) -> Option<f64> {
        self.values.iter().copied().fold(None, |m, v| Some(m.map_or(v, |m: f64| m.max(v))))
    }

    /// Largest sample within `[from, to)` together with its time
    pub fn max_between(&self, from: f64, to: f64) -> Option<(f64, f64)> {
        self.times()
            .into_iter()
            .zip(self.values.iter().copied())
            .filter(|(t, _)| *t + TIME_EPSILON >= from && *t < to)
            .fold(None, |best, (t, v)| match best {
                Some((_, b)) if b >= v => best,
                _ => Some((t, v)),
            })
    }
}

/// Event times
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeTrain {
    /// Event times (ms), ascending
    pub times: Vec<f64>,
    /// Start of the observed period (ms)
    pub t_start: f64,
    /// End of the observed period (ms)
    pub t_stop: f64,
}

impl SpikeTrain {
    /// Create a train, sorting the times
    pub fn new(mut times: Vec<f64>, t_start: f64, t_stop: f64) -> Self {
        times.sort_by(f64::total_cmp);
        Self { times, t_start, t_stop }
    }

    /// Events from `t_start` on
    pub fn trimmed(&self, t_start: f64) -> SpikeTrain {
        Self {
            times: self.times.iter().copied().filter(|t| *t >= t_start).collect(),
            t_start,
            t_stop: self.t_stop,
        }
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Whether no event was recorded
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Mean rate over the observed period (Hz)
    pub fn firing_rate(&self) -> f64 {
        let duration_s = (self.t_stop - self.t_start) / 1000.0;
        if duration_s <= 0.0 {
            return 0.0;
        }
        self.times.len() as f64 / duration_s
    }
}

/// A recording of one port, state or the regime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Recording {
    /// Sampled values
    Analog(AnalogSignal),
    /// Emitted events
    Spikes(SpikeTrain),
}

impl Recording {
    /// The analog signal, if this is one
    pub fn analog(&self) -> Option<&AnalogSignal> {
        match self {
            Recording::Analog(signal) => Some(signal),
            Recording::Spikes(_) => None,
        }
    }

    /// The spike train, if this is one
    pub fn spikes(&self) -> Option<&SpikeTrain> {
        match self {
            Recording::Spikes(train) => Some(train),
            Recording::Analog(_) => None,
        }
    }

    /// The recording from `t_start` on
    pub fn trimmed(&self, t_start: f64) -> Result<Recording> {
        Ok(match self {
            Recording::Analog(signal) => Recording::Analog(signal.trimmed(t_start)?),
            Recording::Spikes(train) => Recording::Spikes(train.trimmed(t_start)),
        })
    }
}

/// A period spent in one regime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epoch {
    /// Regime name
    pub regime: String,
    /// Entry time (ms)
    pub start: f64,
    /// Time spent (ms)
    pub duration: f64,
}

/// Periods of constant regime index in a sampled regime recording
pub fn epochs(signal: &AnalogSignal, t_stop: f64, name_of: impl Fn(usize) -> String) -> Vec<Epoch> {
    let mut out: Vec<Epoch> = Vec::new();
    let mut current: Option<(usize, f64)> = None;
    for (t, value) in signal.times().into_iter().zip(signal.values.iter()) {
        let index = value.round().max(0.0) as usize;
        match current {
            Some((i, _)) if i == index => {}
            Some((i, start)) => {
                out.push(Epoch {
                    regime: name_of(i),
                    start,
                    duration: t - start,
                });
                current = Some((index, t));
            }
            None => current = Some((index, t)),
        }
    }
    if let Some((i, start)) = current {
        out.push(Epoch {
            regime: name_of(i),
            start,
            duration: t_stop - start,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms_signal(values: Vec<f64>) -> AnalogSignal {
        AnalogSignal::new(0.0, 0.5, values, Unit::dimensionless())
    }

    #[test]
    fn zero_order_hold() {
        let s = ms_signal(vec![1.0, 2.0, 3.0]);
        assert_eq!(s.value_at(0.0), Some(1.0));
        assert_eq!(s.value_at(0.7), Some(2.0));
        assert_eq!(s.value_at(1.0), Some(3.0));
        assert_eq!(s.value_at(1.5), None);
        assert_eq!(s.value_at(-0.1), None);
    }

    #[test]
    fn trimming_requires_sample_alignment() {
        let s = ms_signal(vec![1.0, 2.0, 3.0, 4.0]);
        let t = s.trimmed(1.0).unwrap();
        assert_eq!(t.values, vec![3.0, 4.0]);
        assert_eq!(t.t_start, 1.0);
        let err = s.trimmed(0.75).unwrap_err();
        assert!(matches!(err, CellError::Usage { .. }), "unexpected error: {}", err);
    }

    #[test]
    fn pulses() {
        let amplitude = Quantity::new(0.1, Unit::parse("nA").unwrap());
        let p = AnalogSignal::pulse(&amplitude, 2.0, 1.0, 0.5, 5.0);
        assert_eq!(p.values, vec![0.0, 0.0, 0.0, 0.0, 0.1, 0.1, 0.0, 0.0, 0.0, 0.0]);
        let pa = p.converted(&Unit::parse("pA").unwrap()).unwrap();
        assert!((pa.values[4] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn regime_epochs() {
        let s = ms_signal(vec![0.0, 0.0, 1.0, 1.0, 0.0]);
        let names = ["sub", "refractory"];
        let e = epochs(&s, 2.5, |i| names[i].to_string());
        assert_eq!(e.len(), 3);
        assert_eq!(e[0].regime, "sub");
        assert_eq!(e[1], Epoch { regime: "refractory".into(), start: 1.0, duration: 1.0 });
        assert!((e[2].duration - 0.5).abs() < 1e-12);
    }

    #[test]
    fn spike_rates() {
        let train = SpikeTrain::new(vec![30.0, 10.0, 20.0], 0.0, 1000.0);
        assert_eq!(train.times, vec![10.0, 20.0, 30.0]);
        assert_eq!(train.firing_rate(), 3.0);
        assert_eq!(train.trimmed(15.0).len(), 2);
    }
}
