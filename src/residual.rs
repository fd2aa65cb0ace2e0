use crate::config::SolverConfig;
use crate::data::PatientRecord;
use crate::error::SimulationFailure;
use crate::params::{ModelParameters, ParameterSet};
use crate::policy::TreatmentPolicy;
use crate::simulator::{RunSpec, Simulator, Trajectory};

pub struct ResidualFunction<'a> {
    record: &'a PatientRecord,
    template: &'a ParameterSet,
    solver: &'a SolverConfig,
    interval: f64,
    eps_data: f64,
}

impl<'a> ResidualFunction<'a> {
    /// `template` supplies the fixed fields; the free ones come from each evaluation.
    pub fn new(
        record: &'a PatientRecord,
        template: &'a ParameterSet,
        solver: &'a SolverConfig,
        interval: f64,
        eps_data: f64,
    ) -> Self {
        Self {
            record,
            template,
            solver,
            interval,
            eps_data,
        }
    }

    /// Number of residuals (one per observation).
    pub fn len(&self) -> usize {
        self.record.observations.len()
    }

    /// Simulate the record's time span: replaying its dosing history when
    /// known, under continuous therapy otherwise.
    pub fn simulate(&self, params: &ModelParameters) -> Result<Trajectory, SimulationFailure> {
        let mut policy = match &self.record.schedule {
            Some(schedule) => TreatmentPolicy::Replay(schedule.clone()),
            None => TreatmentPolicy::Continuous,
        };
        let spec = RunSpec {
            start: self.record.start_time(),
            end: self.record.end_time(),
            interval: self.interval,
            thresholds: None,
        };
        Simulator::new(params, self.solver).run(params.initial_state(), &mut policy, &spec)
    }

    /// Residuals of an already simulated trajectory.
    pub fn residuals_of(&self, params: &ModelParameters, trajectory: &Trajectory) -> Vec<f64> {
        self.record
            .observations
            .iter()
            .map(|obs| {
                let burden = trajectory.burden_at(obs.time).unwrap_or(f64::NAN);
                (params.scale * burden - obs.value) / self.eps_data
            })
            .collect()
    }

    /// Residuals at the given free-field values. Every entry is NaN when the
    /// parameters are invalid or the simulation fails.
    pub fn evaluate(&self, free: &[f64]) -> Vec<f64> {
        let params = match self.template.with_free_values(free).resolve() {
            Ok(params) => params,
            Err(error) => {
                log::debug!("patient {}: {error}", self.record.id);
                return vec![f64::NAN; self.len()];
            }
        };
        match self.simulate(&params) {
            Ok(trajectory) => self.residuals_of(&params, &trajectory),
            Err(error) => {
                log::debug!("patient {}: {error}", self.record.id);
                vec![f64::NAN; self.len()]
            }
        }
    }
}
