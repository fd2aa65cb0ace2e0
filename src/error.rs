use crate::params::Field;
use serde::Serialize;
use std::fmt;

/// Reason a numerical integration could not produce a trajectory.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulationFailure {
    /// The adaptive step shrank below the representable minimum.
    StepSizeUnderflow { time: f64, step: f64 },
    /// The solver exhausted its step budget within one segment.
    MaxStepsExceeded { time: f64, max_steps: usize },
    /// The state or its derivative became NaN or infinite.
    NonFiniteState { time: f64 },
}

impl fmt::Display for SimulationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StepSizeUnderflow { time, step } => {
                write!(f, "step size underflow ({step:e}) at t = {time}")
            }
            Self::MaxStepsExceeded { time, max_steps } => {
                write!(f, "exceeded {max_steps} solver steps at t = {time}")
            }
            Self::NonFiniteState { time } => write!(f, "non-finite state at t = {time}"),
        }
    }
}

impl std::error::Error for SimulationFailure {}

/// A parameter value lies outside its declared interval.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidParameters {
    pub field: Field,
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

impl fmt::Display for InvalidParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} must be in the range [{}, {}], but is {}",
            self.field.name(),
            self.min,
            self.max,
            self.value
        )
    }
}

impl std::error::Error for InvalidParameters {}

/// Coarse failure class used to tally abandoned jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum FailureKind {
    Load,
    Initialization,
    InvalidParameters,
    Optimization,
    Simulation,
    Store,
}

/// Why a single fit attempt was abandoned.
#[derive(Debug)]
pub enum FitError {
    Load(anyhow::Error),
    /// Seeding or perturbing the initial guess failed.
    Initialization(String),
    InvalidParameters(InvalidParameters),
    Optimization(String),
    Simulation(SimulationFailure),
    Store(anyhow::Error),
}

impl FitError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Load(_) => FailureKind::Load,
            Self::Initialization(_) => FailureKind::Initialization,
            Self::InvalidParameters(_) => FailureKind::InvalidParameters,
            Self::Optimization(_) => FailureKind::Optimization,
            Self::Simulation(_) => FailureKind::Simulation,
            Self::Store(_) => FailureKind::Store,
        }
    }
}

impl fmt::Display for FitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load(error) => write!(f, "failed to load observations: {error:#}"),
            Self::Initialization(msg) => write!(f, "failed to initialize attempt: {msg}"),
            Self::InvalidParameters(error) => write!(f, "invalid parameters: {error}"),
            Self::Optimization(msg) => write!(f, "optimization failed: {msg}"),
            Self::Simulation(error) => write!(f, "simulation failed: {error}"),
            Self::Store(error) => write!(f, "failed to store result: {error:#}"),
        }
    }
}

impl std::error::Error for FitError {}

impl From<InvalidParameters> for FitError {
    fn from(error: InvalidParameters) -> Self {
        Self::InvalidParameters(error)
    }
}

impl From<SimulationFailure> for FitError {
    fn from(error: SimulationFailure) -> Self {
        Self::Simulation(error)
    }
}
