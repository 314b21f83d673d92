//! Synaptic plasticity descriptors and the per-synapse update rules
//! backends run when spikes arrive.

use serde::{Deserialize, Serialize};

use crate::{Delay, PynnError, Result, Time, Weight};

/// Tsodyks-Markram short-term depression / facilitation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TsodyksMarkram {
    /// Utilisation increment (release probability of a rested synapse)
    pub u: f64,
    /// Recovery time constant (ms)
    pub tau_rec: f64,
    /// Facilitation time constant (ms), 0 disables facilitation
    pub tau_facil: f64,
    /// Initial utilisation when facilitating
    pub u0: f64,
}

impl Default for TsodyksMarkram {
    fn default() -> Self {
        Self {
            u: 0.5,
            tau_rec: 100.0,
            tau_facil: 0.0,
            u0: 0.0,
        }
    }
}

impl TsodyksMarkram {
    pub fn validate(&self) -> Result<()> {
        if !(self.u > 0.0 && self.u <= 1.0) {
            return Err(PynnError::InvalidArgument(format!("U must be in (0, 1], got {}", self.u)));
        }
        if self.tau_rec <= 0.0 || self.tau_facil < 0.0 {
            return Err(PynnError::InvalidArgument(format!(
                "time constants must be positive (tau_rec={}, tau_facil={})",
                self.tau_rec, self.tau_facil
            )));
        }
        Ok(())
    }
}

/// Resource / utilisation state of one short-term plastic synapse
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShortTermState {
    pub u: f64,
    pub x: f64,
    pub last_spike: Option<Time>,
}

impl ShortTermState {
    pub fn new(params: &TsodyksMarkram) -> Self {
        Self {
            u: params.u0,
            x: 1.0,
            last_spike: None,
        }
    }

    /// Fraction of the synaptic weight released by a spike arriving at `t`
    pub fn on_spike(&mut self, params: &TsodyksMarkram, t: Time) -> f64 {
        let isi = self.last_spike.map(|last| t - last);

        if let Some(isi) = isi {
            self.x = 1.0 - (1.0 - self.x) * (-isi / params.tau_rec).exp();
        }
        if params.tau_facil > 0.0 {
            if let Some(isi) = isi {
                self.u *= (-isi / params.tau_facil).exp();
            }
            self.u += params.u * (1.0 - self.u);
        } else {
            self.u = params.u;
        }

        let release = self.u * self.x;
        self.x -= release;
        self.last_spike = Some(t);
        release
    }
}

/// Exponential pair-based timing window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpikePairRule {
    pub tau_plus: f64,
    pub tau_minus: f64,
}

impl Default for SpikePairRule {
    fn default() -> Self {
        Self {
            tau_plus: 20.0,
            tau_minus: 20.0,
        }
    }
}

/// How the size of a weight change depends on the current weight
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WeightDependence {
    Additive {
        w_min: Weight,
        w_max: Weight,
        a_plus: f64,
        a_minus: f64,
    },
    Multiplicative {
        w_min: Weight,
        w_max: Weight,
        a_plus: f64,
        a_minus: f64,
    },
}

impl Default for WeightDependence {
    fn default() -> Self {
        Self::Additive {
            w_min: 0.0,
            w_max: 1.0,
            a_plus: 0.01,
            a_minus: 0.01,
        }
    }
}

impl WeightDependence {
    fn bounds(&self) -> (Weight, Weight) {
        match *self {
            Self::Additive { w_min, w_max, .. } | Self::Multiplicative { w_min, w_max, .. } => (w_min, w_max),
        }
    }

    fn potentiate(&self, w: Weight, window: f64) -> Weight {
        let (w_min, w_max) = self.bounds();
        let dw = match *self {
            Self::Additive { w_max, a_plus, .. } => a_plus * w_max * window,
            Self::Multiplicative { w_max, a_plus, .. } => a_plus * (w_max - w) * window,
        };
        (w + dw).clamp(w_min, w_max)
    }

    fn depress(&self, w: Weight, window: f64) -> Weight {
        let (w_min, w_max) = self.bounds();
        let dw = match *self {
            Self::Additive { w_max, a_minus, .. } => a_minus * w_max * window,
            Self::Multiplicative { w_min, a_minus, .. } => a_minus * (w - w_min) * window,
        };
        (w - dw).clamp(w_min, w_max)
    }
}

/// Long-term (STDP) plasticity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StdpMechanism {
    pub timing_dependence: SpikePairRule,
    pub weight_dependence: WeightDependence,
    /// Share of the total delay placed on the postsynaptic side
    pub dendritic_delay_fraction: f64,
}

impl Default for StdpMechanism {
    fn default() -> Self {
        Self {
            timing_dependence: SpikePairRule::default(),
            weight_dependence: WeightDependence::default(),
            dendritic_delay_fraction: 1.0,
        }
    }
}

impl StdpMechanism {
    pub fn new(
        timing_dependence: SpikePairRule,
        weight_dependence: WeightDependence,
        dendritic_delay_fraction: f64,
    ) -> Result<Self> {
        let mechanism = Self {
            timing_dependence,
            weight_dependence,
            dendritic_delay_fraction,
        };
        mechanism.validate()?;
        Ok(mechanism)
    }

    pub fn validate(&self) -> Result<()> {
        let ddf = self.dendritic_delay_fraction;
        if !(0.0..=1.0).contains(&ddf) {
            return Err(PynnError::InvalidArgument(format!(
                "dendritic_delay_fraction must be in [0, 1], got {}",
                ddf
            )));
        }
        Ok(())
    }

    /// `(pre_delay, post_delay)` for a connection with total delay `delay`
    pub fn split_delay(&self, delay: Delay) -> (Delay, Delay) {
        split_delay(delay, self.dendritic_delay_fraction)
    }
}

/// Split a delay between the pre->adjuster and post->adjuster links.
///
/// The post part is taken as the remainder so the two sum back to `delay`.
pub fn split_delay(delay: Delay, ddf: f64) -> (Delay, Delay) {
    let pre = delay * (1.0 - ddf);
    (pre, delay - pre)
}

/// Fast and slow plasticity attached to a projection
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SynapseDynamics {
    #[serde(default)]
    pub fast: Option<TsodyksMarkram>,
    #[serde(default)]
    pub slow: Option<StdpMechanism>,
}

impl SynapseDynamics {
    pub fn is_static(&self) -> bool {
        self.fast.is_none() && self.slow.is_none()
    }
}

/// Spike-pair bookkeeping of one plastic connection
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WeightAdjuster {
    pub last_pre: Option<Time>,
    pub last_post: Option<Time>,
}

impl WeightAdjuster {
    /// Presynaptic spike reaches the adjuster: depress against the last post spike.
    pub fn on_pre(&mut self, mechanism: &StdpMechanism, t: Time, w: Weight) -> Weight {
        self.last_pre = Some(t);
        match self.last_post {
            Some(post) if t >= post => {
                let window = (-(t - post) / mechanism.timing_dependence.tau_minus).exp();
                mechanism.weight_dependence.depress(w, window)
            }
            _ => w,
        }
    }

    /// Postsynaptic spike reaches the adjuster: potentiate against the last pre spike.
    pub fn on_post(&mut self, mechanism: &StdpMechanism, t: Time, w: Weight) -> Weight {
        self.last_post = Some(t);
        match self.last_pre {
            Some(pre) if t >= pre => {
                let window = (-(t - pre) / mechanism.timing_dependence.tau_plus).exp();
                mechanism.weight_dependence.potentiate(w, window)
            }
            _ => w,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_split() {
        let (pre, post) = split_delay(5.0, 0.3);
        assert!((pre - 3.5).abs() < 1e-12);
        assert!((post - 1.5).abs() < 1e-12);

        for &ddf in &[0.0, 0.1, 0.37, 0.5, 0.99, 1.0] {
            for &d in &[0.1, 1.0, 2.7, 13.3] {
                let (pre, post) = split_delay(d, ddf);
                assert!((pre + post - d).abs() < 1e-12);
                assert!(pre >= 0.0 && post >= 0.0);
            }
        }
    }

    #[test]
    fn test_ddf_range() {
        let bad = StdpMechanism::new(SpikePairRule::default(), WeightDependence::default(), 1.5);
        assert!(matches!(bad, Err(PynnError::InvalidArgument(_))));
    }

    #[test]
    fn test_depressing_synapse() {
        let params = TsodyksMarkram { u: 0.5, tau_rec: 100.0, tau_facil: 0.0, u0: 0.0 };
        let mut state = ShortTermState::new(&params);
        let first = state.on_spike(&params, 10.0);
        let second = state.on_spike(&params, 12.0);
        assert!((first - 0.5).abs() < 1e-12);
        assert!(second < first);

        // fully recovered after a long pause
        let later = state.on_spike(&params, 10_000.0);
        assert!((later - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_pair_rule() {
        let mech = StdpMechanism::default();
        let mut adj = WeightAdjuster::default();

        // pre then post: potentiation
        let w = adj.on_pre(&mech, 10.0, 0.5);
        assert_eq!(w, 0.5);
        let w = adj.on_post(&mech, 15.0, w);
        assert!(w > 0.5);

        // post then pre: depression
        let w2 = adj.on_pre(&mech, 20.0, w);
        assert!(w2 < w);
    }

    #[test]
    fn test_weights_clipped() {
        let mech = StdpMechanism {
            weight_dependence: WeightDependence::Additive { w_min: 0.0, w_max: 1.0, a_plus: 10.0, a_minus: 10.0 },
            ..Default::default()
        };
        let mut adj = WeightAdjuster::default();
        adj.on_pre(&mech, 0.0, 0.5);
        assert_eq!(adj.on_post(&mech, 0.0, 0.5), 1.0);
        assert_eq!(adj.on_pre(&mech, 0.0, 0.5), 0.0);
    }
}
