// SPDX-License-Identifier: Apache-2.0

//! Per-step data-volume accounting and throughput estimation.
//!
//! Request coroutines record (batch size, seqlens, architecture card)
//! triples per interface type; the driver turns them into a per-step report
//! and clears the accumulator. FLOP counts are llama-style estimates from
//! the architecture card; they exist for operator-facing throughput logs and
//! nothing else.

use trainflow_config::ModelConfig;

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Architecture card of the invoked model, if already known.
    pub config: Option<ModelConfig>,
    /// Sequences in the call.
    pub batch_size: usize,
    /// Per-sequence lengths.
    pub seqlens: Vec<u32>,
}

/// Per-step accumulator of data volumes, by interface type.
#[derive(Debug, Default)]
pub struct InterfaceDataAmount {
    /// Generation calls.
    pub generate: Vec<CallRecord>,
    /// Inference calls.
    pub inf: Vec<CallRecord>,
    /// Train-step calls.
    pub train: Vec<CallRecord>,
}

/// A finished step's throughput numbers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepStats {
    /// Sequences touched this step, across interfaces.
    pub n_seqs: usize,
    /// Tokens touched this step, across interfaces.
    pub n_tokens: u64,
    /// Estimated TFLOPs executed this step.
    pub tflops: f64,
}

impl InterfaceDataAmount {
    /// Drops everything recorded for the current step.
    pub fn clear(&mut self) {
        self.generate.clear();
        self.inf.clear();
        self.train.clear();
    }

    /// Summarizes the step and the FLOPs it is estimated to have cost.
    // TODO: account for decode-phase attention separately once generation
    // lengths are reported back per invocation; until then generation is
    // costed as one forward pass over the final lengths.
    #[must_use]
    pub fn summarize(&self) -> StepStats {
        let mut n_seqs = 0usize;
        let mut n_tokens = 0u64;
        let mut flops = 0.0f64;

        for (records, factor) in [
            (&self.generate, 1.0),
            (&self.inf, 1.0),
            // Forward, backward (2x) and activation recomputation.
            (&self.train, 4.0),
        ] {
            for rec in records {
                n_seqs += rec.batch_size;
                n_tokens += rec.seqlens.iter().map(|&l| u64::from(l)).sum::<u64>();
                if let Some(cfg) = &rec.config {
                    flops += factor * forward_flops(cfg, &rec.seqlens);
                }
            }
        }

        StepStats {
            n_seqs,
            n_tokens,
            tflops: flops / 1e12,
        }
    }
}

/// Estimated forward-pass FLOPs of a llama-style decoder over packed
/// sequences: attention projections, attention scores, gated MLP and the
/// output logits.
fn forward_flops(cfg: &ModelConfig, seqlens: &[u32]) -> f64 {
    let h = cfg.hidden_dim as f64;
    let i = cfg.intermediate_dim as f64;
    let v = cfg.vocab_size as f64;
    let layers = cfg.n_layers as f64;

    let mut flops = 0.0;
    for &len in seqlens {
        let l = f64::from(len);
        let proj = 8.0 * h * h * l;
        let scores = 4.0 * h * l * l;
        let mlp = 6.0 * h * i * l;
        flops += layers * (proj + scores + mlp) + 2.0 * h * v * l;
    }
    flops
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card() -> ModelConfig {
        ModelConfig {
            n_layers: 2,
            hidden_dim: 16,
            intermediate_dim: 64,
            vocab_size: 100,
        }
    }

    #[test]
    fn summarize_counts_seqs_and_tokens() {
        let mut amount = InterfaceDataAmount::default();
        amount.generate.push(CallRecord {
            config: Some(card()),
            batch_size: 2,
            seqlens: vec![8, 8],
        });
        amount.train.push(CallRecord {
            config: None,
            batch_size: 2,
            seqlens: vec![16, 16],
        });
        let stats = amount.summarize();
        assert_eq!(stats.n_seqs, 4);
        assert_eq!(stats.n_tokens, 48);
        assert!(stats.tflops > 0.0);

        amount.clear();
        let stats = amount.summarize();
        assert_eq!(stats.n_seqs, 0);
        assert_eq!(stats.n_tokens, 0);
    }

    #[test]
    fn training_costs_more_than_inference() {
        let rec = CallRecord {
            config: Some(card()),
            batch_size: 1,
            seqlens: vec![32],
        };
        let mut inf = InterfaceDataAmount::default();
        inf.inf.push(rec.clone());
        let mut train = InterfaceDataAmount::default();
        train.train.push(rec);
        assert!(train.summarize().tflops > 3.0 * inf.summarize().tflops);
    }
}
