use crate::params::ModelParameters;
use serde::{Deserialize, Serialize};

/// Sensitive and resistant population sizes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TumorState {
    pub sensitive: f64,
    pub resistant: f64,
}

impl TumorState {
    pub fn new(sensitive: f64, resistant: f64) -> Self {
        Self {
            sensitive,
            resistant,
        }
    }

    /// Total tumour burden.
    pub fn burden(&self) -> f64 {
        self.sensitive + self.resistant
    }

    pub fn resistant_fraction(&self) -> f64 {
        let burden = self.burden();
        if burden > 0.0 {
            self.resistant / burden
        } else {
            f64::NAN
        }
    }

    pub fn to_array(self) -> [f64; 2] {
        [self.sensitive, self.resistant]
    }

    pub fn from_array([sensitive, resistant]: [f64; 2]) -> Self {
        Self::new(sensitive, resistant)
    }

    /// Linear interpolation between `self` (at `u = 0`) and `other` (at `u = 1`).
    pub fn lerp(&self, other: &Self, u: f64) -> Self {
        Self::new(
            self.sensitive + u * (other.sensitive - self.sensitive),
            self.resistant + u * (other.resistant - self.resistant),
        )
    }
}

/// Instantaneous growth of both populations at drug level `drug`.
///
/// Both populations grow logistically towards a shared carrying capacity.
/// The drug only kills dividing sensitive cells, so the sensitive growth term
/// is scaled by `1 - drug_kill * drug`.
pub fn derivative(state: [f64; 2], params: &ModelParameters, drug: f64) -> [f64; 2] {
    let [s, r] = state;
    let crowding = 1.0 - (s + r) / params.capacity;
    let ds = params.r_s * crowding * (1.0 - params.drug_kill * drug) * s - params.d_s() * s;
    let dr = params.r_r() * crowding * r - params.d_r() * r;
    [ds, dr]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::test_parameter_set;

    #[test]
    fn drug_only_affects_sensitive_cells() {
        let params = test_parameter_set().resolve().unwrap();
        let state = [0.3, 0.1];
        let off = derivative(state, &params, 0.0);
        let on = derivative(state, &params, 1.0);
        assert!(on[0] < off[0]);
        assert!(on[0] < 0.0);
        assert_eq!(on[1], off[1]);
    }

    #[test]
    fn populations_stop_growing_at_capacity() {
        let mut set = test_parameter_set();
        set.turnover.value = 0.0;
        let params = set.resolve().unwrap();
        let rates = derivative([0.6, 0.4], &params, 0.0);
        assert!(rates[0].abs() < 1e-15);
        assert!(rates[1].abs() < 1e-15);
    }

    #[test]
    fn extinct_populations_stay_extinct() {
        let params = test_parameter_set().resolve().unwrap();
        assert_eq!(derivative([0.0, 0.0], &params, 1.0), [0.0, 0.0]);
        assert_eq!(derivative([0.5, 0.0], &params, 0.0)[1], 0.0);
    }
}
