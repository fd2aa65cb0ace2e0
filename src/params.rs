use crate::error::InvalidParameters;
use crate::model::TumorState;
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand_distr::LogNormal;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Source fields of the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    GrowthRate,
    Cost,
    Turnover,
    DrugKill,
    Capacity,
    Scale,
    DrugMax,
    InitialSize,
    ResistantFraction,
}

impl Field {
    pub const ALL: [Field; 9] = [
        Field::GrowthRate,
        Field::Cost,
        Field::Turnover,
        Field::DrugKill,
        Field::Capacity,
        Field::Scale,
        Field::DrugMax,
        Field::InitialSize,
        Field::ResistantFraction,
    ];

    /// Name used in configuration files and exports.
    pub fn name(self) -> &'static str {
        match self {
            Field::GrowthRate => "r_s",
            Field::Cost => "cost",
            Field::Turnover => "turnover",
            Field::DrugKill => "drug_kill",
            Field::Capacity => "capacity",
            Field::Scale => "scale",
            Field::DrugMax => "drug_max",
            Field::InitialSize => "n0",
            Field::ResistantFraction => "f_r",
        }
    }
}

/// Value, closed interval and free/fixed flag of one field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub value: f64,
    #[serde(default = "unbounded_min")]
    pub min: f64,
    #[serde(default = "unbounded_max")]
    pub max: f64,
    #[serde(default)]
    pub vary: bool,
}

fn unbounded_min() -> f64 {
    f64::NEG_INFINITY
}

fn unbounded_max() -> f64 {
    f64::INFINITY
}

impl ParamSpec {
    #[cfg(test)]
    pub fn new(value: f64, min: f64, max: f64, vary: bool) -> Self {
        Self {
            value,
            min,
            max,
            vary,
        }
    }

    #[cfg(test)]
    pub fn fixed(value: f64) -> Self {
        Self::new(value, unbounded_min(), unbounded_max(), false)
    }

    fn contains(&self, value: f64) -> bool {
        value.is_finite() && self.min <= value && value <= self.max
    }
}

/// Parameter template: one spec per source field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    /// Growth rate of the sensitive population.
    pub r_s: ParamSpec,
    /// Fitness cost of resistance.
    pub cost: ParamSpec,
    /// Ratio of death rate to growth rate.
    pub turnover: ParamSpec,
    /// Drug kill strength on dividing sensitive cells.
    pub drug_kill: ParamSpec,
    /// Carrying capacity.
    pub capacity: ParamSpec,
    /// Biomarker units per unit of tumour burden.
    pub scale: ParamSpec,
    /// Drug level while treatment is administered.
    pub drug_max: ParamSpec,
    /// Initial tumour burden.
    pub n0: ParamSpec,
    /// Initial fraction of resistant cells.
    pub f_r: ParamSpec,
}

impl ParameterSet {
    pub fn spec(&self, field: Field) -> &ParamSpec {
        match field {
            Field::GrowthRate => &self.r_s,
            Field::Cost => &self.cost,
            Field::Turnover => &self.turnover,
            Field::DrugKill => &self.drug_kill,
            Field::Capacity => &self.capacity,
            Field::Scale => &self.scale,
            Field::DrugMax => &self.drug_max,
            Field::InitialSize => &self.n0,
            Field::ResistantFraction => &self.f_r,
        }
    }

    pub fn spec_mut(&mut self, field: Field) -> &mut ParamSpec {
        match field {
            Field::GrowthRate => &mut self.r_s,
            Field::Cost => &mut self.cost,
            Field::Turnover => &mut self.turnover,
            Field::DrugKill => &mut self.drug_kill,
            Field::Capacity => &mut self.capacity,
            Field::Scale => &mut self.scale,
            Field::DrugMax => &mut self.drug_max,
            Field::InitialSize => &mut self.n0,
            Field::ResistantFraction => &mut self.f_r,
        }
    }

    /// Fix `field` at `value`, removing it from the optimization.
    pub fn fix(&mut self, field: Field, value: f64) {
        let spec = self.spec_mut(field);
        spec.value = value;
        spec.vary = false;
    }

    pub fn free_fields(&self) -> Vec<Field> {
        Field::ALL
            .into_iter()
            .filter(|&field| self.spec(field).vary)
            .collect()
    }

    pub fn free_values(&self) -> Vec<f64> {
        self.free_fields()
            .into_iter()
            .map(|field| self.spec(field).value)
            .collect()
    }

    /// Lower and upper bounds of the free fields, in [`Self::free_fields`] order.
    pub fn free_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        self.free_fields()
            .into_iter()
            .map(|field| (self.spec(field).min, self.spec(field).max))
            .unzip()
    }

    /// Copy of `self` with the free fields replaced by `values`.
    pub fn with_free_values(&self, values: &[f64]) -> Self {
        let mut set = self.clone();
        for (field, &value) in self.free_fields().into_iter().zip(values) {
            set.spec_mut(field).value = value;
        }
        set
    }

    pub fn apply_variant(&mut self, variant: &ModelVariant) {
        if variant.fix_cost {
            self.fix(Field::Cost, 0.0);
        }
        if variant.fix_turnover {
            self.fix(Field::Turnover, 0.0);
        }
    }

    /// Multiply each free value by independent log-normal noise and clamp
    /// the result back into the field's interval.
    pub fn perturb<R: Rng>(&mut self, rng: &mut R, std_dev: f64) -> Result<()> {
        let noise = LogNormal::new(0.0, std_dev).context("invalid perturbation std dev")?;
        for field in self.free_fields() {
            let spec = self.spec_mut(field);
            spec.value = (spec.value * noise.sample(rng)).clamp(spec.min, spec.max);
        }
        Ok(())
    }

    /// Check every value against its interval and build [`ModelParameters`].
    pub fn resolve(&self) -> Result<ModelParameters, InvalidParameters> {
        for field in Field::ALL {
            let spec = self.spec(field);
            if !spec.contains(spec.value) {
                return Err(InvalidParameters {
                    field,
                    value: spec.value,
                    min: spec.min,
                    max: spec.max,
                });
            }
        }
        Ok(ModelParameters {
            r_s: self.r_s.value,
            cost: self.cost.value,
            turnover: self.turnover.value,
            drug_kill: self.drug_kill.value,
            capacity: self.capacity.value,
            scale: self.scale.value,
            drug_max: self.drug_max.value,
            n0: self.n0.value,
            f_r: self.f_r.value,
        })
    }

    /// Structural checks on the template itself.
    pub fn validate(&self) -> Result<()> {
        for field in Field::ALL {
            let spec = self.spec(field);
            let name = field.name();
            if spec.min.is_nan() || spec.max.is_nan() || spec.min > spec.max {
                bail!("{name} has an empty interval [{}, {}]", spec.min, spec.max);
            }
            if spec.vary && !(spec.min.is_finite() && spec.max.is_finite()) {
                bail!("{name} is free but its interval is unbounded");
            }
        }
        self.resolve().context("invalid initial parameter values")?;

        if self.capacity.value <= 0.0 {
            bail!("capacity must be positive");
        }
        if self.cost.min < 0.0 || self.cost.max > 1.0 {
            bail!("cost interval must lie within [0, 1]");
        }
        if self.f_r.min < 0.0 || self.f_r.max > 1.0 {
            bail!("f_r interval must lie within [0, 1]");
        }
        for field in [Field::GrowthRate, Field::Turnover, Field::InitialSize] {
            if self.spec(field).min < 0.0 {
                bail!("{} must be non-negative", field.name());
            }
        }
        Ok(())
    }
}

/// Fully resolved model parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelParameters {
    pub r_s: f64,
    pub cost: f64,
    pub turnover: f64,
    pub drug_kill: f64,
    pub capacity: f64,
    pub scale: f64,
    pub drug_max: f64,
    pub n0: f64,
    pub f_r: f64,
}

impl ModelParameters {
    /// Growth rate of the resistant population.
    pub fn r_r(&self) -> f64 {
        (1.0 - self.cost) * self.r_s
    }

    /// Death rate of the sensitive population.
    pub fn d_s(&self) -> f64 {
        self.turnover * self.r_s
    }

    /// Death rate of the resistant population (equal to the sensitive one).
    pub fn d_r(&self) -> f64 {
        self.d_s()
    }

    pub fn s0(&self) -> f64 {
        self.n0 * (1.0 - self.f_r)
    }

    pub fn r0(&self) -> f64 {
        self.n0 * self.f_r
    }

    pub fn initial_state(&self) -> TumorState {
        TumorState::new(self.s0(), self.r0())
    }

    pub fn get(&self, field: Field) -> f64 {
        match field {
            Field::GrowthRate => self.r_s,
            Field::Cost => self.cost,
            Field::Turnover => self.turnover,
            Field::DrugKill => self.drug_kill,
            Field::Capacity => self.capacity,
            Field::Scale => self.scale,
            Field::DrugMax => self.drug_max,
            Field::InitialSize => self.n0,
            Field::ResistantFraction => self.f_r,
        }
    }
}

/// Which of cost and turnover a calibration estimates.
///
/// Parsed from names such as `4params`, `3params_noCost`,
/// `3params_noTurnover` or `2params_noCost_noTurnover`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelVariant {
    name: String,
    fix_cost: bool,
    fix_turnover: bool,
}

impl ModelVariant {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for ModelVariant {
    type Err = anyhow::Error;

    fn from_str(name: &str) -> Result<Self> {
        let mut tokens = name.split('_');
        let label = tokens.next().unwrap_or_default();
        let n_params = label
            .strip_suffix("params")
            .with_context(|| format!("variant {name:?} must start with <n>params"))?;
        n_params
            .parse::<usize>()
            .with_context(|| format!("variant {name:?} has an invalid parameter count"))?;

        let mut variant = Self {
            name: name.to_string(),
            fix_cost: false,
            fix_turnover: false,
        };
        for setting in tokens {
            match setting {
                "noCost" => variant.fix_cost = true,
                "noTurnover" => variant.fix_turnover = true,
                _ => bail!("unknown setting {setting:?} in variant {name:?}"),
            }
        }
        Ok(variant)
    }
}

impl TryFrom<String> for ModelVariant {
    type Error = anyhow::Error;

    fn try_from(name: String) -> Result<Self> {
        name.parse()
    }
}

impl From<ModelVariant> for String {
    fn from(variant: ModelVariant) -> Self {
        variant.name
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
pub(crate) fn test_parameter_set() -> ParameterSet {
    ParameterSet {
        r_s: ParamSpec::new(0.027, 1e-4, 0.1, false),
        cost: ParamSpec::new(0.3, 0.0, 1.0, true),
        turnover: ParamSpec::new(0.4, 0.0, 1.0, true),
        drug_kill: ParamSpec::new(1.5, 1.0, 2.0, false),
        capacity: ParamSpec::fixed(1.0),
        scale: ParamSpec::fixed(1.0),
        drug_max: ParamSpec::fixed(1.0),
        n0: ParamSpec::new(0.5, 0.1, 1.0, true),
        f_r: ParamSpec::new(0.01, 1e-5, 0.25, true),
    }
}
