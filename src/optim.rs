//! AdamW with named parameter groups, and learning-rate schedules.

use crate::error::ConfigError;
use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::Tensor;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// Overrides applied to every parameter whose name matches the group's patterns
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParameterGroupOptions {
    #[serde(default)]
    pub weight_decay: Option<f32>,
}

/// `[[patterns...], {options}]`, matched with regex search against parameter names
pub type ParameterGroup = (Vec<String>, ParameterGroupOptions);

fn default_betas() -> (f32, f32) {
    (0.9, 0.999)
}

fn default_eps() -> f32 {
    1e-6
}

fn default_weight_decay() -> f32 {
    0.1
}

/// Biases and LayerNorm weights are excluded from weight decay
pub fn default_parameter_groups() -> Vec<ParameterGroup> {
    vec![(
        vec!["bias".to_string(), "LayerNorm\\.weight".to_string()],
        ParameterGroupOptions {
            weight_decay: Some(0.0),
        },
    )]
}

/// AdamW hyper-parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub lr: f64,
    #[serde(default = "default_betas")]
    pub betas: (f32, f32),
    #[serde(default = "default_eps")]
    pub eps: f32,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
    #[serde(default = "default_parameter_groups")]
    pub parameter_groups: Vec<ParameterGroup>,
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.lr > 0.0) {
            return Err(ConfigError::invalid_parameter(format!(
                "optimizer lr must be > 0, got {}",
                self.lr
            )));
        }
        self.compiled_groups().map(|_| ())
    }

    fn compiled_groups(&self) -> Result<Vec<(Vec<Regex>, f32)>, ConfigError> {
        self.parameter_groups
            .iter()
            .map(|(patterns, options)| {
                let regexes = patterns
                    .iter()
                    .map(|p| {
                        Regex::new(p).map_err(|e| {
                            ConfigError::invalid_parameter(format!(
                                "invalid parameter group pattern '{p}': {e}"
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok((regexes, options.weight_decay.unwrap_or(self.weight_decay)))
            })
            .collect()
    }
}

/// Parameters split into the configured groups plus the default group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupAssignment<T> {
    /// One entry per configured group, in configuration order
    pub groups: Vec<Vec<T>>,
    /// Parameters matching no group
    pub default: Vec<T>,
}

/// Assign each named parameter to the single group whose patterns match its name.
///
/// A parameter matching more than one group is a configuration error.
pub fn assign_parameter_groups<T: Clone>(
    named: &[(String, T)],
    patterns: &[Vec<Regex>],
) -> Result<GroupAssignment<T>, ConfigError> {
    let mut groups = vec![Vec::new(); patterns.len()];
    let mut default = Vec::new();

    for (name, id) in named {
        let matching: Vec<usize> = patterns
            .iter()
            .enumerate()
            .filter(|(_, regexes)| regexes.iter().any(|r| r.is_match(name)))
            .map(|(i, _)| i)
            .collect();
        match matching.as_slice() {
            [] => default.push(id.clone()),
            [group] => groups[*group].push(id.clone()),
            _ => {
                return Err(ConfigError::invalid_parameter(format!(
                    "parameter '{name}' matches more than one parameter group"
                )))
            }
        }
    }

    for (i, group) in groups.iter().enumerate() {
        if group.is_empty() {
            tracing::warn!("Parameter group {} matched no parameters", i);
        }
    }

    Ok(GroupAssignment { groups, default })
}

/// One AdamW instance per parameter group; each only sees its own gradients.
pub struct GroupedOptimizer<B, M, O> {
    groups: Vec<(Vec<ParamId>, O)>,
    default: O,
    grad_norm: Option<f32>,
    _module: PhantomData<(B, M)>,
}

impl OptimizerConfig {
    /// Build the grouped optimizer for a module whose parameters are listed in `named`.
    ///
    /// `grad_norm` rescales all gradients together so their global L2 norm stays under it.
    pub fn init<B: AutodiffBackend, M: AutodiffModule<B>>(
        &self,
        named: &[(String, ParamId)],
        grad_norm: Option<f32>,
    ) -> Result<GroupedOptimizer<B, M, impl Optimizer<M, B>>, ConfigError> {
        let compiled = self.compiled_groups()?;
        let patterns: Vec<Vec<Regex>> = compiled.iter().map(|(r, _)| r.clone()).collect();
        let assignment = assign_parameter_groups(named, &patterns)?;

        let adamw = |weight_decay: f32| {
            AdamWConfig::new()
                .with_beta_1(self.betas.0)
                .with_beta_2(self.betas.1)
                .with_epsilon(self.eps)
                .with_weight_decay(weight_decay)
                .init::<B, M>()
        };

        tracing::info!(
            "Optimizer groups: {} (default weight decay {}: {} parameters)",
            compiled
                .iter()
                .zip(&assignment.groups)
                .map(|((_, wd), ids)| format!("weight decay {wd}: {} parameters", ids.len()))
                .collect::<Vec<_>>()
                .join(", "),
            self.weight_decay,
            assignment.default.len()
        );

        let groups = compiled
            .iter()
            .zip(assignment.groups)
            .map(|((_, weight_decay), ids)| (ids, adamw(*weight_decay)))
            .collect();

        Ok(GroupedOptimizer {
            groups,
            default: adamw(self.weight_decay),
            grad_norm,
            _module: PhantomData,
        })
    }
}

impl<B, M, O> GroupedOptimizer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    /// Apply one update with learning rate `lr` using the raw gradients of a backward pass.
    pub fn step(&mut self, lr: f64, model: M, mut grads: B::Gradients) -> M {
        // Split every group's gradients off before any update replaces the parameter tensors
        let mut group_grads: Vec<GradientsParams> = self
            .groups
            .iter()
            .map(|(ids, _)| GradientsParams::from_params(&mut grads, &model, ids))
            .collect();
        group_grads.push(GradientsParams::from_grads(grads, &model));

        if let Some(max_norm) = self.grad_norm {
            clip_grad_norm::<B, M>(&model, &mut group_grads, max_norm as f64);
        }
        let default_grads = group_grads.pop().unwrap_or_else(GradientsParams::new);

        let mut model = model;
        for ((_, optim), grads) in self.groups.iter_mut().zip(group_grads) {
            model = optim.step(lr, model, grads);
        }
        self.default.step(lr, model, default_grads)
    }
}

struct GradNormVisitor<'a, B> {
    grads: &'a [GradientsParams],
    sum_sq: f64,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradNormVisitor<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        for grads in self.grads {
            if let Some(grad) = grads.get::<B::InnerBackend, D>(id) {
                let sq: f64 = grad.powf_scalar(2.0).sum().into_scalar().elem();
                self.sum_sq += sq;
            }
        }
    }
}

struct GradScaleVisitor<'a> {
    grads: &'a mut [GradientsParams],
    scale: f64,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradScaleVisitor<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        for grads in self.grads.iter_mut() {
            if let Some(grad) = grads.remove::<B::InnerBackend, D>(id) {
                grads.register::<B::InnerBackend, D>(id, grad.mul_scalar(self.scale));
            }
        }
    }
}

/// Rescale the gradients of `model` spread over `grads` so that their global L2 norm is at
/// most `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm<B: AutodiffBackend, M: AutodiffModule<B>>(
    model: &M,
    grads: &mut [GradientsParams],
    max_norm: f64,
) -> f64 {
    let mut norm = GradNormVisitor::<B> {
        grads: &*grads,
        sum_sq: 0.0,
        _backend: PhantomData,
    };
    model.visit(&mut norm);
    let total = norm.sum_sq.sqrt();

    if total > max_norm {
        let mut scale = GradScaleVisitor {
            grads,
            scale: max_norm / (total + 1e-6),
        };
        model.visit(&mut scale);
    }
    total
}

fn default_cut_frac() -> f64 {
    0.1
}

fn default_ratio() -> f64 {
    32.0
}

/// Learning rate scheduling strategies, evaluated per optimizer step
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum LearningRateScheduler {
    /// Fixed learning rate (no scheduling)
    #[default]
    Constant,
    /// Linear warmup to the base rate, then linear decay to zero
    LinearWithWarmup { warmup_steps: usize },
    /// Short linear increase over `cut_frac` of training, long linear decay.
    /// The lowest rate is `base_lr / ratio`.
    SlantedTriangular { cut_frac: f64, ratio: f64 },
    /// Linear warmup, then cosine decay to `min_lr_ratio * base_lr`
    Cosine { warmup_steps: usize, min_lr_ratio: f64 },
}

#[derive(Debug, Deserialize)]
pub(crate) struct WarmupParams {
    #[serde(default)]
    pub warmup_steps: usize,
    #[serde(default)]
    pub min_lr_ratio: f64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SlantedTriangularParams {
    #[serde(default = "default_cut_frac")]
    pub cut_frac: f64,
    #[serde(default = "default_ratio")]
    pub ratio: f64,
}

impl LearningRateScheduler {
    pub fn slanted_triangular() -> Self {
        LearningRateScheduler::SlantedTriangular {
            cut_frac: default_cut_frac(),
            ratio: default_ratio(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            LearningRateScheduler::SlantedTriangular { cut_frac, ratio } => {
                if !(*cut_frac > 0.0 && *cut_frac < 1.0) {
                    return Err(ConfigError::invalid_parameter(format!(
                        "slanted_triangular cut_frac must be in (0, 1), got {cut_frac}"
                    )));
                }
                if !(*ratio >= 1.0) {
                    return Err(ConfigError::invalid_parameter(format!(
                        "slanted_triangular ratio must be >= 1, got {ratio}"
                    )));
                }
            }
            LearningRateScheduler::Cosine { min_lr_ratio, .. } => {
                if !(0.0..=1.0).contains(min_lr_ratio) {
                    return Err(ConfigError::invalid_parameter(format!(
                        "cosine min_lr_ratio must be in [0, 1], got {min_lr_ratio}"
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Learning rate for the 0-based optimizer `step` out of `total_steps`
    pub fn get_learning_rate(&self, step: usize, base_lr: f64, total_steps: usize) -> f64 {
        let step = step as f64;
        let total = total_steps.max(1) as f64;
        match self {
            LearningRateScheduler::Constant => base_lr,
            LearningRateScheduler::LinearWithWarmup { warmup_steps } => {
                let warmup = *warmup_steps as f64;
                if step < warmup {
                    base_lr * step / warmup
                } else {
                    base_lr * ((total - step) / (total - warmup).max(1.0)).max(0.0)
                }
            }
            LearningRateScheduler::SlantedTriangular { cut_frac, ratio } => {
                let cut = (total * cut_frac).floor().max(1.0);
                let p = if step < cut {
                    step / cut
                } else {
                    1.0 - (step - cut) / (cut * (1.0 / cut_frac - 1.0)).max(1.0)
                };
                base_lr * (1.0 + p.max(0.0) * (ratio - 1.0)) / ratio
            }
            LearningRateScheduler::Cosine {
                warmup_steps,
                min_lr_ratio,
            } => {
                let warmup = *warmup_steps as f64;
                if step < warmup {
                    return base_lr * step / warmup;
                }
                let progress = ((step - warmup) / (total - warmup).max(1.0)).min(1.0);
                let min_lr = base_lr * min_lr_ratio;
                min_lr + (base_lr - min_lr) * (1.0 + (std::f64::consts::PI * progress).cos()) / 2.0
            }
        }
    }
}
