//! Autoregressive decoding for encoder-decoder models

use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::marian;
use tracing::debug;

use crate::core::errors::Result;
use crate::core::models::GenerationConfig;

/// Token ids that steer decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialTokens {
    /// First decoder input
    pub decoder_start: u32,
    /// End of sequence
    pub eos: u32,
    /// Alternative terminator some exports configure
    pub forced_eos: u32,
    /// Padding, never generated
    pub pad: u32,
}

impl SpecialTokens {
    /// Read the ids from a model config
    pub fn from_marian(config: &marian::Config) -> Self {
        Self {
            decoder_start: config.decoder_start_token_id,
            eos: config.eos_token_id,
            forced_eos: config.forced_eos_token_id,
            pad: config.pad_token_id,
        }
    }

    /// Whether `token` ends a sequence
    pub fn is_eos(&self, token: u32) -> bool {
        token == self.eos || token == self.forced_eos
    }
}

/// Decoder half of a seq2seq model
pub trait Seq2SeqDecoder {
    /// Logits of shape `(batch, seq_len, vocab)` for `tokens` of shape `(batch, seq_len)`
    fn step_logits(&mut self, tokens: &Tensor, encoder_output: &Tensor, past_len: usize) -> Result<Tensor>;

    /// Forget cached keys and values
    fn reset(&mut self);
}

impl Seq2SeqDecoder for marian::MTModel {
    fn step_logits(&mut self, tokens: &Tensor, encoder_output: &Tensor, past_len: usize) -> Result<Tensor> {
        Ok(self.decode(tokens, encoder_output, past_len)?)
    }

    fn reset(&mut self) {
        self.reset_kv_cache();
    }
}

fn last_position(logits: &Tensor) -> Result<Tensor> {
    let seq_len = logits.dim(1)?;
    Ok(logits.i((.., seq_len - 1, ..))?.to_dtype(DType::F32)?)
}

fn ban_token(logits: &Tensor, token: u32) -> Result<Tensor> {
    let mut values = logits.to_vec1::<f32>()?;
    if let Some(value) = values.get_mut(token as usize) {
        *value = f32::NEG_INFINITY;
    }
    Ok(Tensor::new(values, logits.device())?)
}

/// Decode the best output sequence, without the decoder start token or EOS
pub fn generate<M: Seq2SeqDecoder>(
    model: &mut M,
    encoder_output: &Tensor,
    tokens: SpecialTokens,
    config: &GenerationConfig,
    device: &Device,
) -> Result<Vec<u32>> {
    if config.num_beams > 1 {
        beam_search(model, encoder_output, tokens, config, device)
    } else {
        incremental(model, encoder_output, tokens, config, device)
    }
}

/// One token per step, reusing the decoder's KV cache
fn incremental<M: Seq2SeqDecoder>(
    model: &mut M,
    encoder_output: &Tensor,
    tokens: SpecialTokens,
    config: &GenerationConfig,
    device: &Device,
) -> Result<Vec<u32>> {
    model.reset();
    let mut processor = LogitsProcessor::new(config.seed, config.temperature, config.top_p);
    let mut output = vec![tokens.decoder_start];

    for step in 0..config.max_new_tokens {
        let input = Tensor::new(&output[step..], device)?.unsqueeze(0)?;
        let logits = model.step_logits(&input, encoder_output, step)?;
        let logits = ban_token(&last_position(&logits)?.squeeze(0)?, tokens.pad)?;
        let next = processor.sample(&logits)?;

        if tokens.is_eos(next) {
            break;
        }
        output.push(next);
    }

    debug!("Generated {} tokens", output.len() - 1);
    Ok(output.split_off(1))
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<u32>,
    score: f32,
}

impl Hypothesis {
    fn normalized(&self, length_penalty: f64) -> f32 {
        // Length counts generated tokens plus the terminator
        let len = self.tokens.len().max(1) as f64;
        self.score / len.powf(length_penalty) as f32
    }
}

/// Indices of the `k` largest finite values, excluding `banned`
fn top_k(row: &[f32], k: usize, banned: u32) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..row.len())
        .filter(|&i| i as u32 != banned && row[i].is_finite())
        .collect();
    let by_score = |a: &usize, b: &usize| row[*b].total_cmp(&row[*a]);

    if indices.len() > k {
        indices.select_nth_unstable_by(k - 1, by_score);
        indices.truncate(k);
    }
    indices.sort_by(by_score);
    indices
}

/// Beam search without KV reuse: every step re-decodes the full prefix of each beam
fn beam_search<M: Seq2SeqDecoder>(
    model: &mut M,
    encoder_output: &Tensor,
    tokens: SpecialTokens,
    config: &GenerationConfig,
    device: &Device,
) -> Result<Vec<u32>> {
    let num_beams = config.num_beams;
    let length_penalty = config.length_penalty;
    let by_normalized = |a: &Hypothesis, b: &Hypothesis| {
        b.normalized(length_penalty).total_cmp(&a.normalized(length_penalty))
    };

    let mut beams = vec![Hypothesis {
        tokens: vec![tokens.decoder_start],
        score: 0.0,
    }];
    let mut finished: Vec<Hypothesis> = Vec::new();
    let mut exhausted = true;

    for _ in 0..config.max_new_tokens {
        model.reset();
        let batch = beams.len();
        let seq_len = beams[0].tokens.len();
        let flat: Vec<u32> = beams.iter().flat_map(|b| b.tokens.iter().copied()).collect();
        let input = Tensor::from_vec(flat, (batch, seq_len), device)?;
        let encoder = encoder_output.repeat((batch, 1, 1))?;

        let logits = last_position(&model.step_logits(&input, &encoder, 0)?)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?.to_vec2::<f32>()?;

        let mut candidates: Vec<(f32, usize, u32)> = Vec::with_capacity(batch * num_beams * 2);
        for (beam, row) in log_probs.iter().enumerate() {
            for token in top_k(row, num_beams * 2, tokens.pad) {
                candidates.push((beams[beam].score + row[token], beam, token as u32));
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut next = Vec::with_capacity(num_beams);
        for (rank, (score, beam, token)) in candidates.into_iter().enumerate() {
            if tokens.is_eos(token) {
                // Only candidates ranked within the beam width may finish
                if rank < num_beams {
                    finished.push(Hypothesis {
                        tokens: beams[beam].tokens.clone(),
                        score,
                    });
                }
            } else {
                let mut extended = beams[beam].tokens.clone();
                extended.push(token);
                next.push(Hypothesis {
                    tokens: extended,
                    score,
                });
            }

            if next.len() == num_beams {
                break;
            }
        }

        finished.sort_by(by_normalized);
        finished.truncate(num_beams);

        // Done once the worst kept hypothesis beats the best live beam
        let settled = finished.len() == num_beams
            && match (finished.last(), next.first()) {
                (Some(worst), Some(best_live)) => {
                    worst.normalized(length_penalty) >= best_live.normalized(length_penalty)
                }
                _ => true,
            };
        if settled || next.is_empty() {
            exhausted = false;
            break;
        }
        beams = next;
    }

    if exhausted {
        // Out of budget: unfinished beams compete with what did finish
        finished.extend(beams);
    }

    let best = finished
        .into_iter()
        .min_by(by_normalized)
        .map(|hypothesis| hypothesis.tokens)
        .unwrap_or_default();

    debug!("Beam search kept {} tokens", best.len().saturating_sub(1));
    Ok(best.into_iter().skip(1).collect())
}
