use crate::error::{EngineError, EngineResult};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// A resolved parameter value. Integers stay integers so that period-like
/// parameters never pick up float rounding noise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) if value.is_finite() => Some(*value),
            Self::Float(_) => None,
            Self::Text(raw) => raw.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{}", value),
            Self::Float(value) => {
                let formatted = format!("{:.4}", value);
                let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
                if trimmed.is_empty() || trimmed == "-0" {
                    write!(f, "0")
                } else {
                    write!(f, "{}", trimmed)
                }
            }
            Self::Text(value) => write!(f, "{}", value),
        }
    }
}

pub type ParameterValues = BTreeMap<String, ParamValue>;

/// Render a parameter set as `name: value, ...` for logs.
pub fn describe_params(params: &ParameterValues) -> String {
    params
        .iter()
        .map(|(name, value)| format!("{}: {}", name, value))
        .collect::<Vec<String>>()
        .join(", ")
}

/// Extract a required parameter as f64
pub fn require_param_f64(params: &ParameterValues, key: &str) -> EngineResult<f64> {
    let value = params
        .get(key)
        .ok_or_else(|| EngineError::invalid(format!("missing parameter {}", key)))?;
    value.as_f64().ok_or_else(|| {
        EngineError::invalid(format!("parameter {} must be a finite number ({:?})", key, value))
    })
}

/// Extract a required parameter as usize, rounded, with a lower bound
pub fn require_param_usize(params: &ParameterValues, key: &str, min: usize) -> EngineResult<usize> {
    let value = require_param_f64(params, key)?;
    let rounded = value.round();
    if rounded < min as f64 {
        return Err(EngineError::invalid(format!(
            "parameter {} must be >= {} (value: {})",
            key, min, value
        )));
    }
    Ok(rounded as usize)
}

/// Extract an optional parameter as usize with a default value
pub fn get_param_usize(params: &ParameterValues, key: &str, default: usize) -> usize {
    params
        .get(key)
        .and_then(ParamValue::as_f64)
        .map(|v| v.round().max(0.0) as usize)
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamCategory {
    #[default]
    Basic,
    Advanced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ParamDomain {
    Int { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    Categorical { choices: Vec<ParamValue> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    pub name: String,
    #[serde(flatten)]
    pub domain: ParamDomain,
    #[serde(default = "default_optimise")]
    pub optimise: bool,
    #[serde(default)]
    pub category: ParamCategory,
    /// Value used when the parameter is not searched.
    #[serde(default)]
    pub value: Option<ParamValue>,
}

fn default_optimise() -> bool {
    true
}

impl ParameterSpec {
    fn validate(&self) -> EngineResult<()> {
        match &self.domain {
            ParamDomain::Int { min, max } if min > max => Err(EngineError::invalid(format!(
                "parameter {} has min {} above max {}",
                self.name, min, max
            ))),
            ParamDomain::Float { min, max } if !min.is_finite() || !max.is_finite() => Err(
                EngineError::invalid(format!("parameter {} bounds must be finite", self.name)),
            ),
            ParamDomain::Float { min, max } if min > max => Err(EngineError::invalid(format!(
                "parameter {} has min {} above max {}",
                self.name, min, max
            ))),
            ParamDomain::Categorical { choices } if choices.is_empty() => Err(
                EngineError::invalid(format!("parameter {} has no choices", self.name)),
            ),
            _ if !self.optimise && self.value.is_none() => Err(EngineError::invalid(format!(
                "fixed parameter {} needs a value",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamValue {
        match &self.domain {
            ParamDomain::Int { min, max } => ParamValue::Int(rng.gen_range(*min..=*max)),
            ParamDomain::Float { min, max } if min == max => ParamValue::Float(*min),
            ParamDomain::Float { min, max } => ParamValue::Float(rng.gen_range(*min..=*max)),
            ParamDomain::Categorical { choices } => {
                choices[rng.gen_range(0..choices.len())].clone()
            }
        }
    }

    /// Move `steps` grid steps away from `current`, or `None` when that leaves the domain.
    fn step_from(&self, current: &ParamValue, steps: f64) -> Option<ParamValue> {
        match &self.domain {
            ParamDomain::Int { min, max } => {
                let step = (((max - min) as f64) / 10.0).round().max(1.0);
                let candidate = (current.as_f64()? + steps * step).round();
                if candidate < *min as f64 || candidate > *max as f64 {
                    return None;
                }
                Some(ParamValue::Int(candidate as i64))
            }
            ParamDomain::Float { min, max } => {
                let step = (max - min) / 10.0;
                if step <= 0.0 {
                    return None;
                }
                let candidate = current.as_f64()? + steps * step;
                if candidate < min - 1e-9 || candidate > max + 1e-9 {
                    return None;
                }
                Some(ParamValue::Float(candidate.clamp(*min, *max)))
            }
            ParamDomain::Categorical { choices } => {
                let index = choices.iter().position(|choice| choice == current)? as f64;
                let candidate = index + steps.round();
                if candidate < 0.0 || candidate >= choices.len() as f64 {
                    return None;
                }
                Some(choices[candidate as usize].clone())
            }
        }
    }
}

/// Typed description of what an optimisation run may vary.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterSpec>,
}

impl SearchSpace {
    pub fn validate(&self) -> EngineResult<()> {
        let mut names = HashSet::new();
        for spec in &self.parameters {
            if !names.insert(spec.name.as_str()) {
                return Err(EngineError::invalid(format!(
                    "parameter {} declared twice",
                    spec.name
                )));
            }
            spec.validate()?;
        }
        Ok(())
    }

    pub fn searched(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.parameters.iter().filter(|spec| spec.optimise)
    }

    pub fn fixed_values(&self) -> ParameterValues {
        self.parameters
            .iter()
            .filter(|spec| !spec.optimise)
            .filter_map(|spec| spec.value.clone().map(|value| (spec.name.clone(), value)))
            .collect()
    }

    pub fn category_of(&self, name: &str) -> ParamCategory {
        self.parameters
            .iter()
            .find(|spec| spec.name == name)
            .map(|spec| spec.category)
            .unwrap_or_default()
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> ParameterValues {
        self.searched()
            .map(|spec| (spec.name.clone(), spec.sample(rng)))
            .collect()
    }

    /// Split parameters into (basic, advanced) by their declared category.
    pub fn split_by_category(&self, params: &ParameterValues) -> (ParameterValues, ParameterValues) {
        params
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .partition(|(name, _)| self.category_of(name) == ParamCategory::Basic)
    }
}

pub fn variation_key(params: &ParameterValues) -> String {
    format!("{:?}", params)
}

/// Add neighbor parameter variations by adjusting one searched parameter at a time
pub fn add_single_parameter_neighbor_variations(
    space: &SearchSpace,
    step_multipliers: &[f64],
    current_params: &ParameterValues,
    seen_variations: &mut HashSet<String>,
    neighbor_variations: &mut Vec<ParameterValues>,
) {
    for spec in space.searched() {
        let current_value = match current_params.get(&spec.name) {
            Some(v) => v,
            None => continue,
        };

        for &multiplier in step_multipliers {
            let new_value = match spec.step_from(current_value, multiplier) {
                Some(value) if &value != current_value => value,
                _ => continue,
            };

            let mut neighbor_params = current_params.clone();
            neighbor_params.insert(spec.name.clone(), new_value);
            if seen_variations.insert(variation_key(&neighbor_params)) {
                neighbor_variations.push(neighbor_params);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn space() -> SearchSpace {
        serde_json::from_value(serde_json::json!({
            "parameters": [
                {"name": "lookback", "type": "int", "min": 5, "max": 25},
                {"name": "entryZ", "type": "float", "min": 1.0, "max": 3.0, "category": "advanced"},
                {"name": "mode", "type": "categorical", "choices": ["a", "b"], "optimise": false, "value": "a"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn parses_tagged_domains_and_fixed_values() {
        let space = space();
        space.validate().unwrap();
        assert_eq!(space.searched().count(), 2);
        let fixed = space.fixed_values();
        assert_eq!(fixed.get("mode"), Some(&ParamValue::Text("a".to_string())));
    }

    #[test]
    fn rejects_inverted_bounds_and_unvalued_fixed_parameters() {
        let mut inverted = space();
        inverted.parameters[0].domain = ParamDomain::Int { min: 9, max: 3 };
        assert!(inverted.validate().is_err());

        let mut unvalued = space();
        unvalued.parameters[2].value = None;
        assert!(unvalued.validate().is_err());
    }

    #[test]
    fn samples_stay_inside_bounds() {
        let space = space();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let sample = space.sample(&mut rng);
            let lookback = require_param_usize(&sample, "lookback", 0).unwrap();
            assert!((5..=25).contains(&lookback));
            let entry = require_param_f64(&sample, "entryZ").unwrap();
            assert!((1.0..=3.0).contains(&entry));
            assert!(!sample.contains_key("mode"));
        }
    }

    #[test]
    fn neighbor_variations_step_one_parameter_within_bounds() {
        let space = space();
        let mut current = ParameterValues::new();
        current.insert("lookback".to_string(), ParamValue::Int(5));
        current.insert("entryZ".to_string(), ParamValue::Float(2.0));

        let mut seen = HashSet::new();
        let mut variations = Vec::new();
        add_single_parameter_neighbor_variations(
            &space,
            &[-1.0, 1.0],
            &current,
            &mut seen,
            &mut variations,
        );

        // lookback can only move up from its lower bound; entryZ moves both ways.
        assert_eq!(variations.len(), 3);
        assert!(variations
            .iter()
            .any(|v| v.get("lookback") == Some(&ParamValue::Int(7))));
        for variation in &variations {
            let changed = variation
                .iter()
                .filter(|(name, value)| current.get(*name) != Some(value))
                .count();
            assert_eq!(changed, 1);
        }
    }

    #[test]
    fn splits_best_params_by_category() {
        let space = space();
        let mut params = ParameterValues::new();
        params.insert("lookback".to_string(), ParamValue::Int(10));
        params.insert("entryZ".to_string(), ParamValue::Float(2.5));
        let (basic, advanced) = space.split_by_category(&params);
        assert!(basic.contains_key("lookback"));
        assert!(advanced.contains_key("entryZ"));
    }
}
