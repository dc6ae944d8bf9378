use crate::data::ContrastiveItem;
use crate::masking::IGNORE_LABEL;
use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;

/// Padded token ids with their attention mask (1 = token, 0 = padding)
#[derive(Clone, Debug)]
pub struct TokenBatch<B: Backend> {
    pub token_ids: Tensor<B, 2, Int>,
    pub attention_mask: Tensor<B, 2, Int>,
}

impl<B: Backend> TokenBatch<B> {
    /// Right-pad `sequences` to the longest one
    pub fn from_sequences(sequences: &[Vec<u32>], pad_id: u32, device: &B::Device) -> Self {
        let rows = sequences.len();
        let max_len = sequences.iter().map(Vec::len).max().unwrap_or(0).max(1);

        let mut ids = Vec::with_capacity(rows * max_len);
        let mut mask = Vec::with_capacity(rows * max_len);
        for seq in sequences {
            ids.extend(seq.iter().map(|&id| id as i64));
            ids.extend(std::iter::repeat(pad_id as i64).take(max_len - seq.len()));
            mask.extend(std::iter::repeat(1i64).take(seq.len()));
            mask.extend(std::iter::repeat(0i64).take(max_len - seq.len()));
        }

        Self {
            token_ids: Tensor::<B, 2, Int>::from_data(
                TensorData::new(ids, [rows, max_len]),
                device,
            ),
            attention_mask: Tensor::<B, 2, Int>::from_data(
                TensorData::new(mask, [rows, max_len]),
                device,
            ),
        }
    }

    pub fn rows(&self) -> usize {
        self.token_ids.dims()[0]
    }
}

/// Right-pad label rows with [`IGNORE_LABEL`] to `width`
fn pad_labels<B: Backend>(
    rows: &[Vec<i64>],
    width: usize,
    device: &B::Device,
) -> Tensor<B, 2, Int> {
    let mut labels = Vec::with_capacity(rows.len() * width);
    for row in rows {
        labels.extend(row.iter().copied());
        labels.extend(std::iter::repeat(IGNORE_LABEL).take(width - row.len()));
    }
    Tensor::<B, 2, Int>::from_data(TensorData::new(labels, [rows.len(), width]), device)
}

/// Anchors of every document in the batch and their positives.
///
/// Positives are anchor-major: rows `a * num_positives .. (a + 1) * num_positives` belong to
/// anchor row `a`.
#[derive(Clone, Debug)]
pub struct ContrastiveBatch<B: Backend> {
    pub anchors: TokenBatch<B>,
    pub positives: TokenBatch<B>,
    pub num_positives: usize,
    /// Dataset indices of the documents in this batch
    pub indices: Vec<usize>,
    /// Masked-LM targets shaped like `anchors.token_ids`
    pub anchor_labels: Option<Tensor<B, 2, Int>>,
}

/// Batcher turning sampled documents into padded tensors
#[derive(Clone, Debug)]
pub struct ContrastiveBatcher {
    pad_id: u32,
}

impl ContrastiveBatcher {
    pub fn new(pad_id: u32) -> Self {
        Self { pad_id }
    }
}

impl<B: Backend> Batcher<B, ContrastiveItem, ContrastiveBatch<B>> for ContrastiveBatcher {
    fn batch(&self, items: Vec<ContrastiveItem>, device: &B::Device) -> ContrastiveBatch<B> {
        let num_positives = items
            .first()
            .and_then(|item| item.positives.first())
            .map_or(0, Vec::len);

        let mut anchors = Vec::new();
        let mut positives = Vec::new();
        let mut labels = items
            .iter()
            .all(|item| item.anchor_labels.is_some())
            .then(Vec::new);
        let mut indices = Vec::with_capacity(items.len());
        for item in items {
            indices.push(item.index);
            anchors.extend(item.anchors);
            positives.extend(item.positives.into_iter().flatten());
            if let (Some(labels), Some(item_labels)) = (labels.as_mut(), item.anchor_labels) {
                labels.extend(item_labels);
            }
        }

        let anchors = TokenBatch::from_sequences(&anchors, self.pad_id, device);
        let width = anchors.token_ids.dims()[1];
        ContrastiveBatch {
            anchor_labels: labels.map(|rows| pad_labels(&rows, width, device)),
            anchors,
            positives: TokenBatch::from_sequences(&positives, self.pad_id, device),
            num_positives,
            indices,
        }
    }
}
