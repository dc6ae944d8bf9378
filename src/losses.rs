use crate::error::LossError;
use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use serde::{Deserialize, Serialize};

/// Default NT-Xent temperature
pub const DEFAULT_TEMPERATURE: f32 = 0.05;

/// Loss section of the model configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossConfig {
    NtXent {
        #[serde(default = "default_temperature")]
        temperature: f32,
    },
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

impl Default for LossConfig {
    fn default() -> Self {
        LossConfig::NtXent {
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

impl LossConfig {
    pub fn init(&self) -> Result<NtXentLoss, LossError> {
        match self {
            LossConfig::NtXent { temperature } => NtXentLoss::new(*temperature),
        }
    }
}

/// Normalized temperature-scaled cross entropy (NT-Xent).
///
/// Embeddings sharing a label are positives of each other; every embedding with a different
/// label is a negative. For each ordered positive pair `(i, j)` the loss term is
///
/// ```text
/// -log( exp(s_ij / τ) / (exp(s_ij / τ) + Σ_{k: label_k ≠ label_i} exp(s_ik / τ)) )
/// ```
///
/// with `s` the cosine similarity. The returned loss is the mean over all positive pairs.
#[derive(Debug, Clone, Copy)]
pub struct NtXentLoss {
    temperature: f32,
}

impl NtXentLoss {
    pub fn new(temperature: f32) -> Result<Self, LossError> {
        // NaN fails the comparison too
        if !(temperature > 0.0) {
            return Err(LossError::NonPositiveTemperature(temperature));
        }
        Ok(Self { temperature })
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// Loss over `embeddings` ([m, d]) with one label per row.
    pub fn forward<B: Backend>(
        &self,
        embeddings: Tensor<B, 2>,
        labels: &[usize],
    ) -> Result<Tensor<B, 1>, LossError> {
        let [m, _] = embeddings.dims();
        if labels.len() != m {
            return Err(LossError::LabelCountMismatch {
                expected: m,
                actual: labels.len(),
            });
        }
        let masks = PairMasks::from_labels(labels)?;
        let device = embeddings.device();

        let normalized = l2_normalize(embeddings);
        let inv_temperature = 1.0 / self.temperature;
        let logits = normalized
            .clone()
            .matmul(normalized.transpose())
            .mul_scalar(inv_temperature);
        // Cosine similarity is at most 1, so shifting by 1/τ keeps every exponent <= 0
        let shifted = logits.sub_scalar(inv_temperature);
        let exp_shifted = shifted.clone().exp();

        let negatives =
            Tensor::<B, 2>::from_data(TensorData::new(masks.negatives, [m, m]), &device);
        let positives =
            Tensor::<B, 2>::from_data(TensorData::new(masks.positives, [m, m]), &device);
        let not_pair = positives.equal_elem(0.0);

        let negative_sum = (exp_shifted.clone() * negatives)
            .sum_dim(1)
            .repeat_dim(1, m);
        let per_pair = (exp_shifted + negative_sum)
            .mask_fill(not_pair.clone(), 1.0)
            .log()
            - shifted.mask_fill(not_pair, 0.0);

        Ok(per_pair.sum().div_scalar(masks.num_pairs as f32))
    }

    /// Loss for anchors paired row-by-row with one (pooled) positive each.
    ///
    /// Anchor `i` and positive `i` share label `i`; all other rows are negatives.
    pub fn forward_pairs<B: Backend>(
        &self,
        anchors: Tensor<B, 2>,
        positives: Tensor<B, 2>,
    ) -> Result<Tensor<B, 1>, LossError> {
        let [num_anchors, _] = anchors.dims();
        let [num_positives, _] = positives.dims();
        if num_anchors != num_positives {
            return Err(LossError::PairCountMismatch {
                anchors: num_anchors,
                positives: num_positives,
            });
        }
        let labels: Vec<usize> = (0..num_anchors).chain(0..num_anchors).collect();
        self.forward(Tensor::cat(vec![anchors, positives], 0), &labels)
    }
}

/// Row-wise L2 normalisation of a [m, d] tensor
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let [_, d] = x.dims();
    let norms = x
        .clone()
        .powf_scalar(2.0)
        .sum_dim(1)
        .sqrt()
        .clamp_min(1e-12)
        .repeat_dim(1, d);
    x / norms
}

/// Cross entropy of `logits` ([n, l, vocab]) against `labels` ([n, l]).
///
/// Negative labels are ignored. The mean is over the labelled positions and is zero when
/// there are none.
pub fn masked_lm_loss<B: Backend>(
    logits: Tensor<B, 3>,
    labels: Tensor<B, 2, Int>,
) -> Tensor<B, 1> {
    let [n, l] = labels.dims();
    let weights = labels.clone().greater_equal_elem(0).float();
    let targets = labels.clamp_min(0).reshape([n, l, 1]);
    let picked = log_softmax(logits, 2).gather(2, targets).reshape([n, l]);

    let total = (picked * weights.clone()).sum().neg();
    total / weights.sum().clamp_min(1.0)
}

struct PairMasks {
    positives: Vec<f32>,
    negatives: Vec<f32>,
    num_pairs: usize,
}

impl PairMasks {
    fn from_labels(labels: &[usize]) -> Result<Self, LossError> {
        let m = labels.len();
        let mut positives = vec![0.0; m * m];
        let mut negatives = vec![0.0; m * m];
        let mut num_pairs = 0;

        for (i, &label_i) in labels.iter().enumerate() {
            let mut has_positive = false;
            for (j, &label_j) in labels.iter().enumerate() {
                if label_i != label_j {
                    negatives[i * m + j] = 1.0;
                } else if i != j {
                    positives[i * m + j] = 1.0;
                    has_positive = true;
                    num_pairs += 1;
                }
            }
            if !has_positive {
                return Err(LossError::NoPositive {
                    index: i,
                    label: label_i,
                });
            }
        }

        Ok(Self {
            positives,
            negatives,
            num_pairs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;

    type TestBackend = NdArray;

    fn tensor(rows: &[[f32; 3]]) -> Tensor<TestBackend, 2> {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_data(TensorData::new(flat, [rows.len(), 3]), &Default::default())
    }

    fn scalar(loss: Tensor<TestBackend, 1>) -> f64 {
        loss.into_scalar().elem::<f64>()
    }

    /// Direct evaluation of the pair formula in f64
    fn reference_loss(rows: &[[f32; 3]], labels: &[usize], temperature: f64) -> f64 {
        let unit: Vec<Vec<f64>> = rows
            .iter()
            .map(|r| {
                let norm = r.iter().map(|&v| (v as f64).powi(2)).sum::<f64>().sqrt();
                r.iter().map(|&v| v as f64 / norm).collect()
            })
            .collect();
        let sim = |i: usize, j: usize| -> f64 {
            unit[i].iter().zip(&unit[j]).map(|(a, b)| a * b).sum::<f64>() / temperature
        };

        let mut total = 0.0;
        let mut pairs = 0;
        for i in 0..rows.len() {
            let negatives: f64 = (0..rows.len())
                .filter(|&k| labels[k] != labels[i])
                .map(|k| sim(i, k).exp())
                .sum();
            for j in 0..rows.len() {
                if i != j && labels[i] == labels[j] {
                    let pos = sim(i, j).exp();
                    total += -(pos / (pos + negatives)).ln();
                    pairs += 1;
                }
            }
        }
        total / pairs as f64
    }

    const ROWS: [[f32; 3]; 4] = [
        [1.0, 0.2, -0.3],
        [0.1, 1.0, 0.4],
        [0.9, 0.3, -0.1],
        [-0.2, 0.8, 0.6],
    ];

    #[test]
    fn test_matches_pair_formula() {
        let labels = [0, 1, 0, 1];
        let loss = NtXentLoss::new(0.5).unwrap();
        let value = scalar(loss.forward(tensor(&ROWS), &labels).unwrap());
        let expected = reference_loss(&ROWS, &labels, 0.5);
        assert!((value - expected).abs() < 1e-4, "{value} vs {expected}");
    }

    #[test]
    fn test_invariant_to_row_order() {
        let loss = NtXentLoss::new(0.1).unwrap();
        let original = scalar(loss.forward(tensor(&ROWS), &[0, 1, 0, 1]).unwrap());

        let permuted_rows = [ROWS[3], ROWS[0], ROWS[1], ROWS[2]];
        let permuted = scalar(loss.forward(tensor(&permuted_rows), &[1, 0, 1, 0]).unwrap());

        assert!((original - permuted).abs() < 1e-5);
    }

    #[test]
    fn test_identical_pairs_reach_minimum() {
        // Orthogonal anchors, each positive identical to its anchor
        let rows = [
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
        ];
        let loss = NtXentLoss::new(1.0).unwrap();
        let value = scalar(loss.forward(tensor(&rows), &[0, 1, 0, 1]).unwrap());

        // Every pair has s_ij = 1 and two negatives at s = 0
        let minimum = (1.0 + 2.0 * (-1.0f64).exp()).ln();
        assert!((value - minimum).abs() < 1e-4, "{value} vs {minimum}");

        let worse = scalar(loss.forward(tensor(&ROWS), &[0, 1, 0, 1]).unwrap());
        assert!(worse > value);
    }

    #[test]
    fn test_small_temperature_stays_finite() {
        let loss = NtXentLoss::new(DEFAULT_TEMPERATURE).unwrap();
        let value = scalar(loss.forward(tensor(&ROWS), &[0, 1, 0, 1]).unwrap());
        assert!(value.is_finite());
        let expected = reference_loss(&ROWS, &[0, 1, 0, 1], DEFAULT_TEMPERATURE as f64);
        assert!((value - expected).abs() < 1e-2, "{value} vs {expected}");
    }

    #[test]
    fn test_forward_pairs_matches_labelled_forward() {
        let loss = NtXentLoss::new(0.2).unwrap();
        let anchors = tensor(&ROWS[..2]);
        let positives = tensor(&ROWS[2..]);
        let paired = scalar(loss.forward_pairs(anchors, positives).unwrap());
        let labelled = scalar(loss.forward(tensor(&ROWS), &[0, 1, 0, 1]).unwrap());
        assert!((paired - labelled).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_invalid_inputs() {
        assert_eq!(
            NtXentLoss::new(0.0).unwrap_err(),
            LossError::NonPositiveTemperature(0.0)
        );
        assert!(NtXentLoss::new(-1.0).is_err());

        let loss = NtXentLoss::new(0.05).unwrap();
        assert_eq!(
            loss.forward(tensor(&ROWS), &[0, 1, 0]).unwrap_err(),
            LossError::LabelCountMismatch {
                expected: 4,
                actual: 3
            }
        );
        assert_eq!(
            loss.forward(tensor(&ROWS), &[0, 1, 0, 2]).unwrap_err(),
            LossError::NoPositive { index: 1, label: 1 }
        );
        assert!(matches!(
            loss.forward_pairs(tensor(&ROWS[..3]), tensor(&ROWS[3..])),
            Err(LossError::PairCountMismatch { .. })
        ));
    }

    fn labels(values: &[i64], shape: [usize; 2]) -> Tensor<TestBackend, 2, Int> {
        Tensor::from_data(TensorData::new(values.to_vec(), shape), &Default::default())
    }

    #[test]
    fn test_masked_lm_loss_confident_prediction() {
        let mut logits = vec![0.0f32; 2 * 4];
        logits[2] = 50.0;
        logits[4 + 1] = 50.0;
        let logits = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(logits, [1, 2, 4]),
            &Default::default(),
        );
        let value = scalar(masked_lm_loss(logits, labels(&[2, 1], [1, 2])));
        assert!(value.abs() < 1e-4, "{value}");
    }

    #[test]
    fn test_masked_lm_loss_ignores_negative_labels() {
        let vocab = 5;
        let logits = Tensor::<TestBackend, 3>::zeros([2, 3, vocab], &Default::default());
        let targets = labels(&[1, -100, 3, -100, -100, 0], [2, 3]);
        let value = scalar(masked_lm_loss(logits.clone(), targets));
        assert!((value - (vocab as f64).ln()).abs() < 1e-5, "{value}");

        let ignored = scalar(masked_lm_loss(logits, labels(&[-100; 6], [2, 3])));
        assert_eq!(ignored, 0.0);
    }

    #[test]
    fn test_loss_config_defaults() {
        let config: LossConfig = serde_json::from_str(r#"{"type": "nt_xent"}"#).unwrap();
        assert_eq!(config, LossConfig::default());
        assert_eq!(config.init().unwrap().temperature(), DEFAULT_TEMPERATURE);
    }
}
