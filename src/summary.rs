use crate::metrics::EpochMetrics;

/// Loss trend across a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossTrend {
    Decreasing { delta: f64 },
    Flat,
    Increasing { delta: f64 },
    SingleEpoch,
}

/// Change in mean loss between the first and last epoch; moves under 1% count as flat
pub fn loss_trend(history: &[EpochMetrics]) -> Option<LossTrend> {
    let first = history.first()?.train_loss;
    let last = history.last()?.train_loss;
    if history.len() == 1 {
        return Some(LossTrend::SingleEpoch);
    }
    let delta = last - first;
    Some(if delta.abs() <= first.abs() * 0.01 {
        LossTrend::Flat
    } else if delta < 0.0 {
        LossTrend::Decreasing { delta: -delta }
    } else {
        LossTrend::Increasing { delta }
    })
}

/// Print an end-of-run explanation of the recorded epoch metrics
///
/// `embeddings_per_batch` is the number of rows the loss sees per step (anchors plus pooled
/// positives).
pub fn print_training_summary(
    history: &[EpochMetrics],
    embeddings_per_batch: usize,
    interrupted: bool,
) {
    println!("\n📊 Training Results:");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let Some(last) = history.last() else {
        println!("   • No epoch finished, nothing to report");
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        return;
    };

    println!("📈 Loss per epoch:");
    for m in history {
        println!(
            "   • Epoch {:>3}: {:.4} (min {:.4} / max {:.4}, {} batches, lr {:.2e})",
            m.epoch, m.train_loss, m.min_batch_loss, m.max_batch_loss, m.batches, m.learning_rate
        );
    }

    println!();
    println!("🔍 Key Observations:");
    match loss_trend(history) {
        Some(LossTrend::Decreasing { delta }) => {
            println!("   • ✅ Loss fell by {:.4} since the first epoch", delta);
        }
        Some(LossTrend::Increasing { delta }) => {
            println!("   • ⚠️  Loss rose by {:.4} since the first epoch", delta);
            println!("     Consider a lower learning rate or a longer warmup");
        }
        Some(LossTrend::Flat) => {
            println!("   • Loss is flat across epochs");
        }
        Some(LossTrend::SingleEpoch) | None => {
            println!("   • Only one epoch recorded, no trend yet");
        }
    }

    // Uniform similarities give ln(m - 1) for m rows with one positive each
    let rows = embeddings_per_batch;
    if rows > 2 && last.train_loss >= ((rows - 1) as f64).ln() {
        let chance = ((rows - 1) as f64).ln();
        println!(
            "   • 📈 Final loss {:.3} is at or above chance level ({:.3}); spans are not separated yet",
            last.train_loss, chance
        );
    }

    if interrupted {
        println!("   • 🛑 Run was interrupted after epoch {}", last.epoch);
    }
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
}
